use std::{
    alloc::handle_alloc_error,
    convert::Infallible,
    fmt::{self, Debug, Display, Pointer},
    hash::{Hash, Hasher},
    marker::PhantomData,
    mem,
    ops::Deref,
    panic::{RefUnwindSafe, UnwindSafe},
    ptr::{self, NonNull},
};

use crate::{
    block::{BlockRef, ExternalBlock, InPlaceBlock},
    error::{AllocError, CreateError},
    weak::Weak,
};

/// `Shared<T>` is a single-threaded, reference-counted owning pointer.
///
/// Every `Shared<T>` refers to a control block that tracks how many owning (`Shared`) and
/// observing ([`Weak`]) handles exist. The pointee is disposed of when the last `Shared` is
/// dropped; the control block itself is freed once the last `Weak` is gone as well.
///
/// A `Shared<T>` can also be null. A null handle owns nothing, [`Shared::use_count`] is 0
/// for it, and dereferencing it panics.
///
/// ## Creation
/// * [`Shared::new`] and friends allocate the control block and the value together, in a
///   single allocation.
/// * [`Shared::from_box`] and the `from_raw` family take over a pointee that already lives
///   elsewhere, optionally with a custom disposer that runs instead of the ordinary `drop`.
///
/// ## Clone behavior
/// Cloning increments the strong count; the clone points at the same value.
///
/// ## Aliasing
/// The pointer a `Shared<T>` dereferences to does not have to be the block's own pointee.
/// [`Shared::map`] and [`Shared::alias`] produce handles that share the owner's block (and
/// keep the owner alive) while pointing at a field of it, or at the same value viewed as a
/// trait object.
///
/// ## Equality
/// Two handles are equal when they point at the same address, regardless of which block
/// keeps that address alive. Use [`Shared::owner_eq`] to compare blocks.
///
/// ## Cycles
/// A cycle of `Shared` handles is never freed. Break it with [`Weak`].
///
/// `Shared<T>` is neither [`Send`] nor [`Sync`]: its counts are not atomic.
///
/// ## Examples
/// ```
/// use cbrc::Shared;
///
/// let a = Shared::new(100);
/// let b = a.clone();
/// assert_eq!(Shared::use_count(&a), 2);
/// drop(a);
/// assert_eq!(*b, 100);
/// assert_eq!(Shared::use_count(&b), 1);
/// ```
pub struct Shared<T: ?Sized> {
    block: Option<BlockRef>,
    ptr: Option<NonNull<T>>,
    _marker: PhantomData<T>,
}

impl<T: ?Sized> Shared<T> {
    /// Wraps a block reference whose strong count has already been accounted for.
    #[inline]
    pub(crate) fn from_parts(block: Option<BlockRef>, ptr: Option<NonNull<T>>) -> Self {
        Shared {
            block,
            ptr,
            _marker: PhantomData,
        }
    }

    /// Creates a null `Shared<T>`.
    /// ```
    /// use cbrc::Shared;
    ///
    /// let shared = Shared::<i32>::null();
    /// assert!(!Shared::is_valid(&shared));
    /// assert_eq!(Shared::use_count(&shared), 0);
    /// ```
    #[inline]
    pub const fn null() -> Self {
        Shared {
            block: None,
            ptr: None,
            _marker: PhantomData,
        }
    }

    /// Takes ownership of `ptr`, which is released with `disposer` once the last `Shared`
    /// pointing at it is dropped.
    ///
    /// If the control block cannot be allocated, `disposer` runs on `ptr` and the process
    /// aborts through [`handle_alloc_error`]. Use [`Shared::try_from_raw_with`] to get an
    /// error instead.
    ///
    /// A null `ptr` is accepted: the result owns a block but [`Shared::get`] returns
    /// [`None`], and `disposer` receives the null pointer when it runs.
    ///
    /// # Safety
    /// Unless it is null, `ptr` must be valid for reads until `disposer` runs, and nothing
    /// else may mutate or free the pointee in the meantime.
    ///
    /// ```
    /// use std::{cell::Cell, rc::Rc};
    /// use cbrc::Shared;
    ///
    /// let disposed = Rc::new(Cell::new(0));
    /// let counter = Rc::clone(&disposed);
    /// let raw = Box::into_raw(Box::new(7));
    /// let shared = unsafe {
    ///     Shared::from_raw_with(raw, move |ptr| {
    ///         counter.set(counter.get() + 1);
    ///         drop(Box::from_raw(ptr));
    ///     })
    /// };
    /// assert_eq!(*shared, 7);
    /// drop(shared);
    /// assert_eq!(disposed.get(), 1);
    /// ```
    pub unsafe fn from_raw_with<D>(ptr: *mut T, disposer: D) -> Self
    where
        D: FnOnce(*mut T) + 'static,
    {
        match unsafe { Shared::try_from_raw_with(ptr, disposer) } {
            Ok(shared) => shared,
            Err(err) => handle_alloc_error(err.layout()),
        }
    }

    /// Fallible form of [`Shared::from_raw_with`]. On allocation failure `disposer` has run
    /// on `ptr` exactly once before the error is returned.
    ///
    /// # Safety
    /// Same as [`Shared::from_raw_with`].
    pub unsafe fn try_from_raw_with<D>(ptr: *mut T, disposer: D) -> Result<Self, AllocError>
    where
        D: FnOnce(*mut T) + 'static,
    {
        unsafe { Shared::adopt(ptr, disposer) }
    }

    /// Creates the external control block for `ptr`.
    ///
    /// # Safety
    /// Same as [`Shared::from_raw_with`]; in addition, `disposer` must not borrow anything that
    /// could end while `T` is still alive.
    unsafe fn adopt<D>(ptr: *mut T, disposer: D) -> Result<Self, AllocError>
    where
        D: FnOnce(*mut T),
    {
        let block = ExternalBlock::create(ptr, disposer)?;
        Ok(Shared::from_parts(Some(block), NonNull::new(ptr)))
    }

    /// Takes ownership of a pointer obtained from [`Box::into_raw`]. The box is rebuilt and
    /// dropped when the last `Shared` goes away.
    ///
    /// # Safety
    /// `ptr` must come from [`Box::into_raw`] and must not be used to free the value elsewhere.
    pub unsafe fn from_raw(ptr: *mut T) -> Self {
        match unsafe { Shared::try_from_raw(ptr) } {
            Ok(shared) => shared,
            Err(err) => handle_alloc_error(err.layout()),
        }
    }

    /// Fallible form of [`Shared::from_raw`]. On allocation failure the box has already been
    /// dropped.
    ///
    /// # Safety
    /// Same as [`Shared::from_raw`].
    pub unsafe fn try_from_raw(ptr: *mut T) -> Result<Self, AllocError> {
        unsafe { Shared::adopt(ptr, drop_box::<T>) }
    }

    /// Takes ownership of a boxed value. This also works for unsized values, which makes it
    /// the way to get a `Shared<dyn Trait>` or `Shared<[T]>`.
    /// ```
    /// use std::fmt::Display;
    /// use cbrc::Shared;
    ///
    /// let shared: Shared<dyn Display> = Shared::from_box(Box::new(42));
    /// assert_eq!(shared.to_string(), "42");
    /// ```
    pub fn from_box(value: Box<T>) -> Self {
        unsafe { Shared::from_raw(Box::into_raw(value)) }
    }

    /// Fallible form of [`Shared::from_box`].
    pub fn try_from_box(value: Box<T>) -> Result<Self, AllocError> {
        unsafe { Shared::try_from_raw(Box::into_raw(value)) }
    }

    /// Creates a handle that shares `owner`'s control block (incrementing its strong count)
    /// but dereferences to `ptr`. `owner`'s pointee stays alive while the result exists.
    /// Aliasing a null `owner` gives a handle without a block.
    ///
    /// # Safety
    /// Unless it is null, `ptr` must stay valid for reads for as long as `owner`'s pointee is
    /// alive, typically because it points into that pointee. The result no longer mentions
    /// `U`, so `owner`'s pointee must not borrow anything that could end before the result
    /// is dropped.
    ///
    /// ```
    /// use cbrc::Shared;
    ///
    /// struct Pair { left: i32, right: i32 }
    ///
    /// let pair = Shared::new(Pair { left: 1, right: 2 });
    /// let right = unsafe { Shared::alias(&pair, &pair.right as *const i32) };
    /// drop(pair);
    /// assert_eq!(*right, 2);
    /// ```
    pub unsafe fn alias<U: ?Sized>(owner: &Shared<U>, ptr: *const T) -> Self {
        if let Some(block) = owner.block {
            block.increment_strong();
        }
        Shared::from_parts(owner.block, NonNull::new(ptr.cast_mut()))
    }

    /// Creates a handle to part of the pointee, or to the pointee viewed as another type,
    /// sharing this handle's control block. Mapping a null handle gives a null handle.
    /// ```
    /// use cbrc::Shared;
    ///
    /// let pair = Shared::new((String::from("left"), String::from("right")));
    /// let right = Shared::map(&pair, |pair| &pair.1);
    /// assert_eq!(Shared::use_count(&pair), 2);
    /// drop(pair);
    /// assert_eq!(*right, "right");
    /// ```
    pub fn map<U: ?Sized, F>(this: &Self, f: F) -> Shared<U>
    where
        T: 'static,
        F: FnOnce(&T) -> &U,
    {
        match Shared::get(this) {
            Some(value) => {
                let projected: *const U = f(value);
                unsafe { Shared::alias(this, projected) }
            }
            None => Shared::null(),
        }
    }

    /// Like [`Shared::map`], for projections that may not exist.
    pub fn try_map<U: ?Sized, F>(this: &Self, f: F) -> Option<Shared<U>>
    where
        T: 'static,
        F: FnOnce(&T) -> Option<&U>,
    {
        let projected: *const U = f(Shared::get(this)?)?;
        Some(unsafe { Shared::alias(this, projected) })
    }

    /// Returns a reference to the pointee, or [`None`] for a null handle.
    #[inline]
    pub fn get(this: &Self) -> Option<&T> {
        this.ptr.map(|ptr| unsafe { &*ptr.as_ptr() })
    }

    /// Gets a `&mut` to the pointee if this is the only handle of any kind to the control
    /// block. Otherwise, returns [`None`] because it would be unsafe to mutate a shared value.
    /// ```
    /// use cbrc::Shared;
    ///
    /// let mut shared = Shared::new(100);
    /// *Shared::get_mut(&mut shared).unwrap() = 300;
    /// assert_eq!(*shared, 300);
    ///
    /// let _other = shared.clone();
    /// assert!(Shared::get_mut(&mut shared).is_none());
    /// ```
    #[inline]
    pub fn get_mut(this: &mut Self) -> Option<&mut T> {
        let block = this.block?;
        if block.strong_count() != 1 || block.weak_count() != 0 {
            return None;
        }
        this.ptr.map(|ptr| unsafe { &mut *ptr.as_ptr() })
    }

    /// Gets the stored pointer.
    #[inline]
    pub fn as_ptr(this: &Self) -> Option<NonNull<T>> {
        this.ptr
    }

    /// Returns whether this handle points at something.
    #[inline]
    pub fn is_valid(this: &Self) -> bool {
        this.ptr.is_some()
    }

    /// Returns the number of `Shared` handles that share this handle's control block, or 0
    /// if there is no block.
    /// ```
    /// use cbrc::{Shared, Weak};
    ///
    /// let shared = Shared::new(100);
    /// let weak = Shared::downgrade(&shared);
    /// let _other = Weak::lock(&weak);
    /// assert_eq!(Shared::use_count(&shared), 2);
    /// ```
    #[inline]
    pub fn use_count(this: &Self) -> usize {
        this.block.map_or(0, BlockRef::strong_count)
    }

    /// Returns the number of [`Weak`] handles observing this handle's control block.
    ///
    /// While the pointee is being dropped the block holds one extra weak reference to itself,
    /// so code running inside the pointee's `Drop` sees a count one higher than the number of
    /// live `Weak` handles.
    #[inline]
    pub fn weak_count(this: &Self) -> usize {
        this.block.map_or(0, BlockRef::weak_count)
    }

    /// Creates a [`Weak`] observer of this handle's control block. This increments the weak
    /// count.
    /// ```
    /// use cbrc::{Shared, Weak};
    ///
    /// let shared = Shared::new(100);
    /// let weak = Shared::downgrade(&shared);
    /// assert_eq!(Shared::weak_count(&shared), 1);
    /// assert_eq!(*Weak::lock(&weak), 100);
    /// ```
    #[inline]
    pub fn downgrade(this: &Self) -> Weak<T> {
        if let Some(block) = this.block {
            block.increment_weak();
        }
        Weak::from_parts(this.block, this.ptr)
    }

    /// Checks if two handles share a control block. Handles with no block do not share one.
    /// ```
    /// use cbrc::Shared;
    ///
    /// let pair = Shared::new((1, 2));
    /// let first = Shared::map(&pair, |pair| &pair.0);
    /// assert!(Shared::owner_eq(&pair, &first));
    /// ```
    #[inline]
    pub fn owner_eq<U: ?Sized>(this: &Self, other: &Shared<U>) -> bool {
        match (this.block, other.block) {
            (Some(a), Some(b)) => a.as_ptr() == b.as_ptr(),
            _ => false,
        }
    }

    /// Releases this handle's reference and leaves it null.
    /// ```
    /// use cbrc::Shared;
    ///
    /// let mut shared = Shared::new(100);
    /// Shared::reset(&mut shared);
    /// assert!(!Shared::is_valid(&shared));
    /// ```
    #[inline]
    pub fn reset(this: &mut Self) {
        drop(Shared::take(this));
    }

    /// Replaces the current reference with ownership of `ptr`. The new control block is
    /// created before the old reference is released.
    ///
    /// If the control block cannot be allocated, `disposer` runs on `ptr` and the process
    /// aborts through [`handle_alloc_error`]. Use [`Shared::try_reset_with`] to get an error
    /// instead.
    ///
    /// # Safety
    /// Same as [`Shared::from_raw_with`].
    pub unsafe fn reset_with<D>(this: &mut Self, ptr: *mut T, disposer: D)
    where
        D: FnOnce(*mut T) + 'static,
    {
        *this = unsafe { Shared::from_raw_with(ptr, disposer) };
    }

    /// Fallible form of [`Shared::reset_with`]. On allocation failure `disposer` has run on
    /// `ptr`, `this` still holds its old reference, and the error is returned.
    ///
    /// # Safety
    /// Same as [`Shared::from_raw_with`].
    ///
    /// ```
    /// use cbrc::Shared;
    ///
    /// let mut shared = Shared::new(1);
    /// let raw = Box::into_raw(Box::new(2));
    /// unsafe { Shared::try_reset_with(&mut shared, raw, |ptr| drop(Box::from_raw(ptr))) }
    ///     .unwrap();
    /// assert_eq!(*shared, 2);
    /// ```
    pub unsafe fn try_reset_with<D>(
        this: &mut Self,
        ptr: *mut T,
        disposer: D,
    ) -> Result<(), AllocError>
    where
        D: FnOnce(*mut T) + 'static,
    {
        *this = unsafe { Shared::try_from_raw_with(ptr, disposer) }?;
        Ok(())
    }

    /// Replaces the current reference with ownership of a boxed value.
    ///
    /// If the control block cannot be allocated, the value is dropped and the process aborts
    /// through [`handle_alloc_error`].
    pub fn reset_box(this: &mut Self, value: Box<T>) {
        *this = Shared::from_box(value);
    }

    /// Moves the reference out of `this`, leaving a null handle behind. No counts change.
    #[inline]
    pub fn take(this: &mut Self) -> Self {
        mem::replace(this, Shared::null())
    }

    /// Exchanges the references held by two handles. No counts change.
    #[inline]
    pub fn swap(this: &mut Self, other: &mut Self) {
        mem::swap(&mut this.block, &mut other.block);
        mem::swap(&mut this.ptr, &mut other.ptr);
    }

    #[inline]
    fn addr(&self) -> *const () {
        self.ptr
            .map_or(ptr::null(), |ptr| ptr.as_ptr().cast_const().cast())
    }
}

impl<T> Shared<T> {
    /// Creates a new `Shared<T>` holding `value`, with the value and its control block in one
    /// allocation.
    /// ```
    /// use cbrc::Shared;
    ///
    /// let shared = Shared::new(100);
    /// assert_eq!(*shared, 100);
    /// ```
    #[inline]
    pub fn new(value: T) -> Self {
        Shared::new_with(|| value)
    }

    /// Allocates the control block first and then stores the result of `init` in it.
    /// If `init` panics, the block is freed again.
    #[inline]
    pub fn new_with<F>(init: F) -> Self
    where
        F: FnOnce() -> T,
    {
        match InPlaceBlock::create(|| Ok::<T, Infallible>(init())) {
            Ok((block, ptr)) => Shared::from_parts(Some(block), Some(ptr)),
            Err(err) => handle_alloc_error(err.into_alloc().layout()),
        }
    }

    /// Fallible form of [`Shared::new`]. If the block cannot be allocated, `value` is dropped
    /// and an error is returned.
    pub fn try_new(value: T) -> Result<Self, AllocError> {
        InPlaceBlock::create(|| Ok::<T, Infallible>(value))
            .map(|(block, ptr)| Shared::from_parts(Some(block), Some(ptr)))
            .map_err(CreateError::into_alloc)
    }

    /// Allocates the control block and then runs a fallible constructor into it. When the
    /// constructor fails, the block storage is freed, nothing is disposed of and the error is
    /// returned as [`CreateError::Construct`].
    /// ```
    /// use cbrc::{CreateError, Shared};
    ///
    /// let parsed = Shared::try_new_with(|| "12".parse::<u8>());
    /// assert_eq!(*parsed.unwrap(), 12);
    ///
    /// let failed = Shared::try_new_with(|| "x".parse::<u8>());
    /// assert!(matches!(failed, Err(CreateError::Construct(_))));
    /// ```
    pub fn try_new_with<E, F>(init: F) -> Result<Self, CreateError<E>>
    where
        F: FnOnce() -> Result<T, E>,
    {
        let (block, ptr) = InPlaceBlock::create(init)?;
        Ok(Shared::from_parts(Some(block), Some(ptr)))
    }
}

impl<T: ?Sized> Drop for Shared<T> {
    #[inline]
    fn drop(&mut self) {
        if let Some(block) = self.block.take() {
            unsafe { block.decrement_strong() };
        }
    }
}

impl<T: ?Sized> Clone for Shared<T> {
    /// Clone a `Shared<T>` (increment the strong count).
    /// It will panic if the strong count overflows.
    /// ```
    /// use cbrc::Shared;
    ///
    /// let shared = Shared::new(100);
    /// let shared2 = shared.clone();
    /// assert_eq!(Shared::use_count(&shared2), 2);
    /// ```
    #[inline]
    fn clone(&self) -> Self {
        if let Some(block) = self.block {
            block.increment_strong();
        }
        Shared::from_parts(self.block, self.ptr)
    }

    /// Copy-assignment: a no-op when `self` already holds the same reference; otherwise the
    /// new reference is acquired before the old one is released.
    #[inline]
    fn clone_from(&mut self, source: &Self) {
        if self.block == source.block && self.addr() == source.addr() {
            return;
        }
        *self = source.clone();
    }
}

impl<T: ?Sized> Deref for Shared<T> {
    type Target = T;

    /// Get an immutable reference to the pointee. It will panic if the handle is null.
    #[inline]
    fn deref(&self) -> &Self::Target {
        match Shared::get(self) {
            Some(value) => value,
            None => panic!("dereferenced a null `Shared`"),
        }
    }
}

impl<T: ?Sized> AsRef<T> for Shared<T> {
    fn as_ref(&self) -> &T {
        self
    }
}

impl<T: ?Sized> Default for Shared<T> {
    /// A null handle.
    fn default() -> Self {
        Shared::null()
    }
}

impl<T: ?Sized> PartialEq for Shared<T> {
    /// Handles are equal when they point at the same address.
    /// ```
    /// use cbrc::Shared;
    ///
    /// let a = Shared::new(100);
    /// let b = Shared::new(100);
    /// assert!(a == a.clone());
    /// assert!(a != b);
    /// ```
    #[inline]
    fn eq(&self, other: &Self) -> bool {
        self.addr() == other.addr()
    }
}

impl<T: ?Sized> Eq for Shared<T> {}

impl<T: ?Sized> Hash for Shared<T> {
    /// Hashes the stored address, consistently with [`PartialEq`].
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.addr().hash(state);
    }
}

impl<T: ?Sized + Display> Display for Shared<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match Shared::get(self) {
            Some(value) => Display::fmt(value, f),
            None => f.write_str("null"),
        }
    }
}

impl<T: ?Sized + Debug> Debug for Shared<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match Shared::get(self) {
            Some(value) => Debug::fmt(value, f),
            None => f.write_str("null"),
        }
    }
}

impl<T: ?Sized> Pointer for Shared<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        Pointer::fmt(&self.addr(), f)
    }
}

impl<T> From<T> for Shared<T> {
    /// Equivalent to [`Shared::new`].
    fn from(value: T) -> Self {
        Shared::new(value)
    }
}

impl<T: ?Sized> From<Box<T>> for Shared<T> {
    /// Equivalent to [`Shared::from_box`].
    fn from(value: Box<T>) -> Self {
        Shared::from_box(value)
    }
}

impl<T: ?Sized> Unpin for Shared<T> {}

impl<T: ?Sized + RefUnwindSafe> UnwindSafe for Shared<T> {}

fn drop_box<T: ?Sized>(ptr: *mut T) {
    drop(unsafe { Box::from_raw(ptr) });
}
