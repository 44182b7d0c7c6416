use std::{
    cell::{Cell, RefCell},
    collections::HashSet,
    fmt::Display,
    panic::{self, AssertUnwindSafe},
    ptr,
    rc::Rc,
};

use crate::{block::testing, CreateError, Shared, Weak};

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

struct Data {
    string: String,
    int: i32,
}

/// Counts how many times it has been dropped.
struct Probe {
    drops: Rc<Cell<usize>>,
    value: i32,
}

impl Probe {
    fn new(value: i32) -> (Probe, Rc<Cell<usize>>) {
        let drops = Rc::new(Cell::new(0));
        let probe = Probe {
            drops: Rc::clone(&drops),
            value,
        };
        (probe, drops)
    }
}

impl Drop for Probe {
    fn drop(&mut self) {
        self.drops.set(self.drops.get() + 1);
    }
}

#[test]
fn test_singlethreaded() {
    init_logging();
    let data = Data {
        string: String::from("This is data."),
        int: 123,
    };

    let mut shared = Shared::new(data);
    assert_eq!(shared.int, 123);
    Shared::get_mut(&mut shared).unwrap().string = String::from("This is also data");
    assert_eq!(shared.string, "This is also data");
}

#[test]
fn test_use_count_follows_live_handles() {
    init_logging();
    let a = Shared::new(5);
    assert_eq!(Shared::use_count(&a), 1);

    let b = a.clone();
    let c = b.clone();
    assert_eq!(Shared::use_count(&a), 3);

    let moved = c;
    assert_eq!(Shared::use_count(&moved), 3);

    drop(b);
    assert_eq!(Shared::use_count(&a), 2);

    let mut slot = moved;
    let taken = Shared::take(&mut slot);
    assert_eq!(Shared::use_count(&taken), 2);
    assert_eq!(Shared::use_count(&slot), 0);

    drop(taken);
    assert_eq!(Shared::use_count(&a), 1);
}

#[test]
fn test_disposal_runs_once_at_last_drop() {
    init_logging();
    let baseline = testing::live_blocks();
    let (probe, drops) = Probe::new(1);

    let a = Shared::new(probe);
    let b = a.clone();
    assert_eq!(testing::live_blocks(), baseline + 1);

    drop(a);
    assert_eq!(drops.get(), 0);
    drop(b);
    assert_eq!(drops.get(), 1);
    assert_eq!(testing::live_blocks(), baseline);
}

#[test]
fn test_owner_copy_weak_lifecycle() {
    init_logging();
    let baseline = testing::live_blocks();
    let (probe, drops) = Probe::new(7);

    let a = Shared::new(probe);
    assert_eq!(Shared::use_count(&a), 1);

    let b = a.clone();
    assert_eq!(Shared::use_count(&b), 2);

    drop(a);
    assert_eq!(Shared::use_count(&b), 1);
    assert_eq!(drops.get(), 0);
    assert_eq!(b.value, 7);

    let w = Shared::downgrade(&b);
    assert_eq!(Weak::weak_count(&w), 1);

    drop(b);
    assert_eq!(drops.get(), 1);
    assert_eq!(Weak::use_count(&w), 0);
    // The block outlives the value while `w` observes it.
    assert_eq!(testing::live_blocks(), baseline + 1);

    assert!(!Shared::is_valid(&Weak::lock(&w)));
    assert!(Weak::upgrade(&w).is_none());

    drop(w);
    assert_eq!(testing::live_blocks(), baseline);
    assert_eq!(drops.get(), 1);
}

#[test]
fn test_lock_on_expired_block_is_null() {
    init_logging();
    let shared = Shared::new(String::from("gone"));
    let weaks: Vec<Weak<String>> = (0..4).map(|_| Shared::downgrade(&shared)).collect();
    drop(shared);

    for weak in &weaks {
        assert!(Weak::expired(weak));
        let locked = Weak::lock(weak);
        assert!(!Shared::is_valid(&locked));
        assert_eq!(Shared::use_count(&locked), 0);
    }
    assert_eq!(Weak::weak_count(&weaks[0]), 4);
}

#[test]
fn test_lock_on_live_block_adds_one() {
    init_logging();
    let shared = Shared::new(100);
    let _other = shared.clone();
    let weak = Shared::downgrade(&shared);

    let before = Shared::use_count(&shared);
    let locked = Weak::lock(&weak);
    assert_eq!(Shared::use_count(&locked), before + 1);
    assert!(locked == shared);
    assert_eq!(*locked, 100);
}

#[test]
fn test_aliased_handle_keeps_owner_alive() {
    init_logging();
    let (probe, drops) = Probe::new(42);
    let owner = Shared::new((probe, 9u64));

    let field = Shared::map(&owner, |pair| &pair.1);
    let same_field = unsafe { Shared::alias(&owner, &owner.1 as *const u64) };
    assert!(field == same_field);
    assert!(Shared::owner_eq(&owner, &field));
    assert_eq!(Shared::use_count(&owner), 3);

    drop(owner);
    drop(same_field);
    assert_eq!(drops.get(), 0);
    assert_eq!(*field, 9);
    assert_eq!(Shared::use_count(&field), 1);

    drop(field);
    assert_eq!(drops.get(), 1);
}

fn as_display(value: &i32) -> &(dyn Display + 'static) {
    value
}

#[test]
fn test_map_to_trait_object() {
    init_logging();
    let owner = Shared::new(12);
    let shown: Shared<dyn Display> = Shared::map(&owner, as_display);
    assert_eq!(shown.to_string(), "12");

    let missing = Shared::try_map(&owner, |_| None::<&u8>);
    assert!(missing.is_none());

    let null = Shared::<i32>::null();
    assert!(!Shared::is_valid(&Shared::map(&null, |value| value)));
}

#[test]
fn test_custom_disposer_runs_instead_of_drop() {
    init_logging();
    let baseline = testing::live_blocks();
    let (probe, drops) = Probe::new(3);
    let calls = Rc::new(Cell::new(0));
    let blocks_at_disposal = Rc::new(Cell::new(usize::MAX));

    let raw = Box::into_raw(Box::new(probe));
    let shared = unsafe {
        let calls = Rc::clone(&calls);
        let blocks_at_disposal = Rc::clone(&blocks_at_disposal);
        Shared::from_raw_with(raw, move |ptr: *mut Probe| {
            calls.set(calls.get() + 1);
            blocks_at_disposal.set(testing::live_blocks());
            drop(Box::from_raw(ptr));
        })
    };
    assert_eq!(shared.value, 3);
    let copy = shared.clone();

    drop(shared);
    assert_eq!(calls.get(), 0);
    drop(copy);

    assert_eq!(calls.get(), 1);
    assert_eq!(drops.get(), 1);
    // Disposal happens while the block still exists; deallocation follows.
    assert_eq!(blocks_at_disposal.get(), baseline + 1);
    assert_eq!(testing::live_blocks(), baseline);
}

#[test]
fn test_failed_in_place_construction_leaves_nothing() {
    init_logging();
    let baseline = testing::live_blocks();
    let (part, drops) = Probe::new(0);

    let result = Shared::<Probe>::try_new_with(move || {
        assert_eq!(testing::live_blocks(), baseline + 1);
        // A half-built value is cleaned up by the constructor itself.
        drop(part);
        Err("constructor failed")
    });

    match result {
        Err(CreateError::Construct(msg)) => assert_eq!(msg, "constructor failed"),
        _ => panic!("expected a construction error"),
    }
    assert_eq!(testing::live_blocks(), baseline);
    assert_eq!(drops.get(), 1);
}

#[test]
fn test_panicking_constructor_frees_block() {
    init_logging();
    let baseline = testing::live_blocks();

    let result = panic::catch_unwind(AssertUnwindSafe(|| {
        Shared::<String>::new_with(|| panic!("constructor panicked"))
    }));

    assert!(result.is_err());
    assert_eq!(testing::live_blocks(), baseline);
}

#[test]
fn test_alloc_failure_runs_disposer_once() {
    init_logging();
    let baseline = testing::live_blocks();
    let (probe, drops) = Probe::new(8);
    let calls = Rc::new(Cell::new(0));

    testing::fail_next_allocation();
    let raw = Box::into_raw(Box::new(probe));
    let result = unsafe {
        let calls = Rc::clone(&calls);
        Shared::try_from_raw_with(raw, move |ptr: *mut Probe| {
            calls.set(calls.get() + 1);
            drop(Box::from_raw(ptr));
        })
    };

    assert!(result.is_err());
    assert_eq!(calls.get(), 1);
    assert_eq!(drops.get(), 1);
    assert_eq!(testing::live_blocks(), baseline);
}

#[test]
fn test_alloc_failure_in_try_new_drops_value() {
    init_logging();
    let (probe, drops) = Probe::new(1);

    testing::fail_next_allocation();
    let err = Shared::try_new(probe).err().unwrap();
    assert_eq!(drops.get(), 1);
    assert!(err.layout().size() > 0);
    assert!(err.to_string().starts_with("failed to allocate a control block"));

    let ran = Cell::new(false);
    testing::fail_next_allocation();
    let result = Shared::<i32>::try_new_with(|| {
        ran.set(true);
        Ok::<_, ()>(1)
    });
    assert!(matches!(result, Err(CreateError::Alloc(_))));
    assert!(!ran.get());

    // The injected failure is one-shot.
    assert!(Shared::try_new(5).is_ok());
}

#[test]
fn test_clone_from_same_reference_is_noop() {
    init_logging();
    let a = Shared::new(1);
    let mut b = a.clone();
    b.clone_from(&a);
    assert_eq!(Shared::use_count(&a), 2);

    let (probe, drops) = Probe::new(2);
    let mut target = Shared::new(probe);
    let source = Shared::new(Probe::new(3).0);
    target.clone_from(&source);
    assert_eq!(drops.get(), 1);
    assert_eq!(Shared::use_count(&source), 2);
    assert!(target == source);

    let weak_a = Shared::downgrade(&a);
    let mut weak_b = weak_a.clone();
    weak_b.clone_from(&weak_a);
    assert_eq!(Weak::weak_count(&weak_a), 2);
}

#[test]
fn test_reset_replaces_reference() {
    init_logging();
    let baseline = testing::live_blocks();
    let (first, first_drops) = Probe::new(1);
    let (second, second_drops) = Probe::new(2);

    let mut shared = Shared::new(first);
    Shared::reset_box(&mut shared, Box::new(second));
    assert_eq!(first_drops.get(), 1);
    assert_eq!(shared.value, 2);

    let disposed = Rc::new(Cell::new(false));
    let flag = Rc::clone(&disposed);
    let raw = Box::into_raw(Box::new(Probe::new(3).0));
    unsafe {
        Shared::reset_with(&mut shared, raw, move |ptr| {
            flag.set(true);
            drop(Box::from_raw(ptr));
        })
    };
    assert_eq!(second_drops.get(), 1);
    assert_eq!(shared.value, 3);

    Shared::reset(&mut shared);
    assert!(disposed.get());
    assert!(!Shared::is_valid(&shared));
    assert_eq!(testing::live_blocks(), baseline);
}

#[test]
fn test_swap_exchanges_without_counting() {
    init_logging();
    let mut a = Shared::new(1);
    let mut b = Shared::new(2);
    let a2 = a.clone();

    Shared::swap(&mut a, &mut b);
    assert_eq!(*a, 2);
    assert_eq!(*b, 1);
    assert_eq!(Shared::use_count(&b), 2);
    assert!(b == a2);

    let mut wa = Shared::downgrade(&a);
    let mut wb = Weak::new();
    Weak::swap(&mut wa, &mut wb);
    assert!(Weak::expired(&wa));
    assert_eq!(*Weak::lock(&wb), 2);
    assert_eq!(Shared::weak_count(&a), 1);
}

#[test]
fn test_null_handles() {
    init_logging();
    let null: Shared<i32> = Shared::default();
    assert!(!Shared::is_valid(&null));
    assert_eq!(Shared::use_count(&null), 0);
    assert!(Shared::get(&null).is_none());
    assert!(null == Shared::null());
    assert!(!Shared::owner_eq(&null, &Shared::<i32>::null()));
    assert_eq!(format!("{:?}", null), "null");
    assert_eq!(format!("{}", null), "null");

    let weak = Shared::downgrade(&null);
    assert!(Weak::expired(&weak));
    assert_eq!(Weak::weak_count(&weak), 0);
    assert!(!Shared::is_valid(&Weak::lock(&weak)));

    let copy = null.clone();
    assert_eq!(Shared::use_count(&copy), 0);
}

#[test]
#[should_panic(expected = "dereferenced a null `Shared`")]
fn test_deref_null_panics() {
    let null = Shared::<i32>::null();
    let _value: i32 = *null;
}

#[test]
fn test_null_raw_pointer_still_owns_block() {
    init_logging();
    let baseline = testing::live_blocks();
    let seen = Rc::new(Cell::new(None));
    let record = Rc::clone(&seen);

    let shared = unsafe {
        Shared::from_raw_with(ptr::null_mut::<i32>(), move |ptr: *mut i32| {
            record.set(Some(ptr.is_null()))
        })
    };
    assert_eq!(Shared::use_count(&shared), 1);
    assert!(!Shared::is_valid(&shared));

    drop(shared);
    assert_eq!(seen.get(), Some(true));
    assert_eq!(testing::live_blocks(), baseline);
}

struct Node {
    value: i32,
    this: RefCell<Weak<Node>>,
}

#[test]
fn test_pointee_holding_weak_to_itself() {
    init_logging();
    let baseline = testing::live_blocks();

    let node = Shared::new(Node {
        value: 4,
        this: RefCell::new(Weak::new()),
    });
    *node.this.borrow_mut() = Shared::downgrade(&node);
    assert_eq!(Shared::weak_count(&node), 1);
    assert_eq!(Weak::lock(&*node.this.borrow()).value, 4);

    // Dropping the node releases the last weak reference from inside its own disposal.
    drop(node);
    assert_eq!(testing::live_blocks(), baseline);
}

#[test]
fn test_cycle_of_shared_leaks() {
    init_logging();
    struct Link {
        next: RefCell<Shared<Link>>,
    }

    let baseline = testing::live_blocks();
    let a = Shared::new(Link {
        next: RefCell::new(Shared::null()),
    });
    let b = Shared::new(Link {
        next: RefCell::new(a.clone()),
    });
    *a.next.borrow_mut() = b.clone();
    drop(a);
    drop(b);
    assert_eq!(testing::live_blocks(), baseline + 2);
}

#[test]
fn test_get_mut_requires_unique_handle() {
    init_logging();
    let mut shared = Shared::new(1);
    let weak = Shared::downgrade(&shared);
    assert!(Shared::get_mut(&mut shared).is_none());

    drop(weak);
    *Shared::get_mut(&mut shared).unwrap() += 1;
    assert_eq!(*shared, 2);
}

#[test]
fn test_from_box_unsized() {
    init_logging();
    let shared: Shared<[u8]> = Shared::from_box(vec![1, 2, 3].into_boxed_slice());
    assert_eq!(&*shared, &[1, 2, 3]);

    let shown: Shared<dyn Display> = Shared::from(Box::new("text") as Box<dyn Display>);
    assert_eq!(shown.to_string(), "text");
    assert_eq!(Shared::use_count(&shown), 1);
}

#[test]
fn test_hash_matches_address_equality() {
    init_logging();
    let a = Shared::new(1);
    let b = Shared::new(1);
    let mut set = HashSet::new();
    set.insert(a.clone());
    set.insert(a.clone());
    set.insert(b);
    assert_eq!(set.len(), 2);
    assert!(set.contains(&a));
}

#[repr(C)]
struct Pair {
    first: u32,
    second: u32,
}

#[test]
fn test_weak_equality_through_alias() {
    init_logging();
    let owner = Shared::new(Pair {
        first: 1,
        second: 2,
    });
    let first = Shared::map(&owner, |pair| &pair.first);
    let second = Shared::map(&owner, |pair| &pair.second);

    let weak_owner = Shared::downgrade(&owner);
    let weak_first = Shared::downgrade(&first);
    let weak_second = Shared::downgrade(&second);
    assert_eq!(Weak::weak_count(&weak_owner), 3);

    // Same block, different stored addresses.
    assert!(Weak::owner_eq(&weak_owner, &weak_second));
    assert!(Weak::owner_eq(&weak_first, &weak_second));
    assert!(!Weak::ptr_eq(&weak_first, &weak_second));
    assert!(Weak::ptr_eq(&weak_second, &weak_second.clone()));

    let unrelated = Shared::new(2u32);
    let weak_unrelated = Shared::downgrade(&unrelated);
    assert!(!Weak::owner_eq(&weak_second, &weak_unrelated));
    assert!(!Weak::owner_eq(&Weak::<u32>::new(), &Weak::<u32>::new()));
}

#[test]
fn test_try_map_some_shares_block() {
    init_logging();
    let owner = Shared::new(vec![10, 20, 30]);
    let last = Shared::try_map(&owner, |values| values.last()).unwrap();
    assert_eq!(*last, 30);
    assert_eq!(Shared::use_count(&owner), 2);
    assert!(Shared::owner_eq(&owner, &last));

    drop(owner);
    assert_eq!(Shared::use_count(&last), 1);
    assert_eq!(*last, 30);
}

#[test]
fn test_weak_clone_from_other_block() {
    init_logging();
    let a = Shared::new(1);
    let b = Shared::new(2);
    let mut weak = Shared::downgrade(&a);
    let other = Shared::downgrade(&b);
    assert_eq!(Shared::weak_count(&a), 1);

    weak.clone_from(&other);
    assert_eq!(Shared::weak_count(&a), 0);
    assert_eq!(Shared::weak_count(&b), 2);
    assert_eq!(*Weak::lock(&weak), 2);

    // Same reference: no count changes.
    weak.clone_from(&other);
    assert_eq!(Shared::weak_count(&b), 2);
}

#[test]
fn test_pointer_format_is_stored_address() {
    let owner = Shared::new(5);
    let expected = format!("{:p}", Shared::as_ptr(&owner).unwrap());
    assert_eq!(format!("{:p}", owner), expected);
    assert_eq!(format!("{:p}", Shared::<i32>::null()), format!("{:p}", ptr::null::<()>()));
}

#[test]
fn test_try_reset_with_keeps_old_reference_on_failure() {
    init_logging();
    let (old, old_drops) = Probe::new(1);
    let (new, new_drops) = Probe::new(2);
    let mut shared = Shared::new(old);
    let before = testing::live_blocks();

    testing::fail_next_allocation();
    let raw = Box::into_raw(Box::new(new));
    let result = unsafe { Shared::try_reset_with(&mut shared, raw, |ptr| drop(Box::from_raw(ptr))) };
    assert!(result.is_err());
    assert_eq!(new_drops.get(), 1);
    assert_eq!(old_drops.get(), 0);
    assert_eq!(shared.value, 1);
    assert_eq!(testing::live_blocks(), before);

    let (newer, newer_drops) = Probe::new(3);
    let raw = Box::into_raw(Box::new(newer));
    unsafe { Shared::try_reset_with(&mut shared, raw, |ptr| drop(Box::from_raw(ptr))) }.unwrap();
    assert_eq!(shared.value, 3);
    assert_eq!(old_drops.get(), 1);
    assert_eq!(testing::live_blocks(), before);

    drop(shared);
    assert_eq!(newer_drops.get(), 1);
}

struct CountOnDrop {
    this: RefCell<Weak<CountOnDrop>>,
    seen: Rc<Cell<usize>>,
}

impl Drop for CountOnDrop {
    fn drop(&mut self) {
        self.seen.set(Weak::weak_count(&*self.this.borrow()));
    }
}

#[test]
fn test_weak_count_during_disposal_includes_block_guard() {
    init_logging();
    let seen = Rc::new(Cell::new(0));
    let shared = Shared::new(CountOnDrop {
        this: RefCell::new(Weak::new()),
        seen: Rc::clone(&seen),
    });
    *shared.this.borrow_mut() = Shared::downgrade(&shared);
    assert_eq!(Shared::weak_count(&shared), 1);

    let before = testing::live_blocks();
    drop(shared);
    assert_eq!(seen.get(), 2);
    assert_eq!(testing::live_blocks(), before - 1);
}
