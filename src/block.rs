//! Control blocks: the bookkeeping shared by every [`Shared`](crate::Shared) and
//! [`Weak`](crate::Weak) that refer to one pointee.
//!
//! A block is one of two `#[repr(C)]` variants that start with a [`BlockHeader`]:
//!
//! * [`ExternalBlock`] owns a pointee that lives in its own allocation and disposes of it
//!   with a caller-supplied disposer.
//! * [`InPlaceBlock`] stores the pointee inline, so the pointee and its counts share a
//!   single allocation.
//!
//! The header carries the strong and weak counts together with the variant's `dispose`
//! and `deallocate` entry points. Disposal happens when the strong count drops to zero,
//! deallocation when both counts are zero.

use std::{
    alloc::{alloc, dealloc, Layout},
    any::type_name,
    cell::Cell,
    mem::{self, MaybeUninit},
    ptr::{self, addr_of_mut, NonNull},
};

use crate::error::{AllocError, CreateError};

const MAX_REFCOUNT: usize = (isize::MAX) as usize;

#[repr(C)]
pub(crate) struct BlockHeader {
    strong: Cell<usize>,
    weak: Cell<usize>,
    dispose: unsafe fn(NonNull<BlockHeader>),
    deallocate: unsafe fn(NonNull<BlockHeader>),
}

impl BlockHeader {
    /// A header for a freshly created block: one strong reference, no weak ones.
    fn new(
        dispose: unsafe fn(NonNull<BlockHeader>),
        deallocate: unsafe fn(NonNull<BlockHeader>),
    ) -> Self {
        BlockHeader {
            strong: Cell::new(1),
            weak: Cell::new(0),
            dispose,
            deallocate,
        }
    }
}

/// Non-owning pointer to a control block. Handles own their counts; this type only
/// performs the count arithmetic on their behalf.
#[derive(Clone, Copy, PartialEq, Eq)]
pub(crate) struct BlockRef(NonNull<BlockHeader>);

impl BlockRef {
    #[inline]
    fn header(&self) -> &BlockHeader {
        unsafe { self.0.as_ref() }
    }

    #[inline]
    pub(crate) fn as_ptr(self) -> *const () {
        self.0.as_ptr().cast_const().cast()
    }

    #[inline]
    pub(crate) fn strong_count(self) -> usize {
        self.header().strong.get()
    }

    #[inline]
    pub(crate) fn weak_count(self) -> usize {
        self.header().weak.get()
    }

    #[inline]
    pub(crate) fn is_alive(self) -> bool {
        self.strong_count() != 0
    }

    /// Adds one strong reference. It will panic if the strong count overflows.
    #[inline]
    pub(crate) fn increment_strong(self) {
        let strong = &self.header().strong;
        if strong.get() >= MAX_REFCOUNT {
            panic!("Overflow of maximum strong reference count.");
        }
        strong.set(strong.get() + 1);
    }

    /// Adds one weak reference. It will panic if the weak count overflows.
    #[inline]
    pub(crate) fn increment_weak(self) {
        let weak = &self.header().weak;
        if weak.get() >= MAX_REFCOUNT {
            panic!("Overflow of maximum weak reference count.");
        }
        weak.set(weak.get() + 1);
    }

    /// Drops one strong reference, disposing of the pointee on the 1 -> 0 transition and
    /// freeing the block if no weak references remain.
    ///
    /// # Safety
    /// The caller must own one of the block's strong references and give it up.
    #[inline]
    pub(crate) unsafe fn decrement_strong(self) {
        let header = self.header();
        let strong = header.strong.get();
        debug_assert!(strong > 0, "strong count underflow");
        header.strong.set(strong - 1);
        if strong != 1 {
            return;
        }

        // The pointee's destructor may release weak references to this very block, so
        // the block holds one of its own until disposal has finished.
        header.weak.set(header.weak.get() + 1);
        let dispose = header.dispose;
        unsafe {
            dispose(self.0);
            self.decrement_weak();
        }
    }

    /// Drops one weak reference, freeing the block once both counts are zero.
    ///
    /// # Safety
    /// The caller must own one of the block's weak references and give it up.
    #[inline]
    pub(crate) unsafe fn decrement_weak(self) {
        let header = self.header();
        let weak = header.weak.get();
        debug_assert!(weak > 0, "weak count underflow");
        header.weak.set(weak - 1);
        if weak == 1 && header.strong.get() == 0 {
            let deallocate = header.deallocate;
            unsafe { deallocate(self.0) };
        }
    }
}

/// Allocates uninitialized memory for a block of type `B`.
unsafe fn allocate<B>() -> Result<NonNull<B>, AllocError> {
    let layout = Layout::new::<B>();

    #[cfg(test)]
    if testing::take_injected_failure() {
        log::warn!(target: "cbrc::block", "allocation of {} bytes failed (injected)", layout.size());
        return Err(AllocError::new(layout));
    }

    match NonNull::new(unsafe { alloc(layout) }.cast::<B>()) {
        Some(block) => {
            #[cfg(test)]
            testing::on_allocate();
            Ok(block)
        }
        None => {
            log::warn!(target: "cbrc::block", "allocation of {} bytes failed", layout.size());
            Err(AllocError::new(layout))
        }
    }
}

/// Returns the memory of a block of type `B` to the allocator. Nothing inside it is dropped.
unsafe fn release<B>(block: NonNull<B>) {
    #[cfg(test)]
    testing::on_release();

    unsafe { dealloc(block.as_ptr().cast(), Layout::new::<B>()) };
}

/// Control block for a pointee owned outside the block.
#[repr(C)]
pub(crate) struct ExternalBlock<T: ?Sized, D> {
    header: BlockHeader,
    target: *mut T,
    disposer: Cell<Option<D>>,
}

impl<T: ?Sized, D: FnOnce(*mut T)> ExternalBlock<T, D> {
    /// Creates a block that owns `target`. If the block cannot be allocated, `disposer` is
    /// run on `target` before the error is returned.
    pub(crate) fn create(target: *mut T, disposer: D) -> Result<BlockRef, AllocError> {
        let block = match unsafe { allocate::<Self>() } {
            Ok(block) => block,
            Err(err) => {
                disposer(target);
                return Err(err);
            }
        };

        unsafe {
            block.as_ptr().write(ExternalBlock {
                header: BlockHeader::new(Self::dispose, Self::deallocate),
                target,
                disposer: Cell::new(Some(disposer)),
            });
        }
        Ok(BlockRef(block.cast()))
    }

    unsafe fn dispose(header: NonNull<BlockHeader>) {
        let block = unsafe { header.cast::<Self>().as_ref() };
        log::trace!(
            target: "cbrc::block",
            "disposing external {} at {:p}",
            type_name::<T>(),
            header
        );
        if let Some(disposer) = block.disposer.take() {
            disposer(block.target);
        }
    }

    unsafe fn deallocate(header: NonNull<BlockHeader>) {
        log::trace!(target: "cbrc::block", "freeing external block at {:p}", header);
        let block = header.cast::<Self>();
        unsafe {
            ptr::drop_in_place(addr_of_mut!((*block.as_ptr()).disposer));
            release(block);
        }
    }
}

/// Control block with the pointee embedded in it.
#[repr(C)]
pub(crate) struct InPlaceBlock<T> {
    header: BlockHeader,
    storage: MaybeUninit<T>,
}

impl<T> InPlaceBlock<T> {
    /// Allocates a block and fills its storage with the value produced by `init`.
    ///
    /// The block is allocated before `init` runs. If `init` fails or panics, the storage is
    /// freed again without disposing of anything.
    pub(crate) fn create<E, F>(init: F) -> Result<(BlockRef, NonNull<T>), CreateError<E>>
    where
        F: FnOnce() -> Result<T, E>,
    {
        struct Unfilled<T>(NonNull<InPlaceBlock<T>>);

        impl<T> Drop for Unfilled<T> {
            fn drop(&mut self) {
                unsafe { release(self.0) };
            }
        }

        let block = unsafe { allocate::<Self>() }?;
        let unfilled = Unfilled(block);
        let value = init().map_err(CreateError::Construct)?;
        mem::forget(unfilled);

        unsafe {
            let raw = block.as_ptr();
            addr_of_mut!((*raw).header).write(BlockHeader::new(Self::dispose, Self::deallocate));
            let storage = addr_of_mut!((*raw).storage).cast::<T>();
            storage.write(value);
            Ok((BlockRef(block.cast()), NonNull::new_unchecked(storage)))
        }
    }

    unsafe fn dispose(header: NonNull<BlockHeader>) {
        log::trace!(
            target: "cbrc::block",
            "dropping in-place {} at {:p}",
            type_name::<T>(),
            header
        );
        let block = header.cast::<Self>().as_ptr();
        unsafe { ptr::drop_in_place(addr_of_mut!((*block).storage).cast::<T>()) };
    }

    unsafe fn deallocate(header: NonNull<BlockHeader>) {
        log::trace!(target: "cbrc::block", "freeing in-place block at {:p}", header);
        unsafe { release(header.cast::<Self>()) };
    }
}
