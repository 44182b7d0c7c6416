use std::{
    fmt::{self, Debug},
    mem,
    ptr::{self, NonNull},
};

use crate::{block::BlockRef, shared::Shared};

/// `Weak<T>` is a non-owning observer of a [`Shared<T>`]'s control block. It is used to break
/// reference cycles, which would otherwise never be freed.
///
/// A `Weak<T>` does not keep the value alive; it only keeps the control block alive, so it can
/// always tell whether the value still exists. It cannot access the value directly and must be
/// promoted with [`Weak::lock`] (or [`Weak::upgrade`]) first, which fails once the last
/// `Shared<T>` has been dropped.
///
/// One use case of a `Weak<T>` is a tree: parent nodes own their children through `Shared<T>`,
/// and children refer back to their parents through `Weak<T>`.
///
/// # Examples
/// ```
/// use cbrc::{Shared, Weak};
///
/// let shared = Shared::new(100);
/// let weak = Shared::downgrade(&shared);
/// assert_eq!(*Weak::lock(&weak), 100);
///
/// drop(shared);
/// assert!(Weak::expired(&weak));
/// assert!(!Shared::is_valid(&Weak::lock(&weak)));
/// ```
pub struct Weak<T: ?Sized> {
    block: Option<BlockRef>,
    ptr: Option<NonNull<T>>,
}

impl<T: ?Sized> Weak<T> {
    /// Wraps a block reference whose weak count has already been accounted for.
    #[inline]
    pub(crate) fn from_parts(block: Option<BlockRef>, ptr: Option<NonNull<T>>) -> Self {
        Weak { block, ptr }
    }

    /// Creates a `Weak<T>` that observes nothing. [`Weak::lock`] always gives a null handle.
    /// ```
    /// use cbrc::Weak;
    ///
    /// let weak = Weak::<i32>::new();
    /// assert!(Weak::expired(&weak));
    /// ```
    #[inline]
    pub const fn new() -> Self {
        Weak {
            block: None,
            ptr: None,
        }
    }

    /// Promotes this observer to an owning handle. If there is no control block, or the value
    /// has already been disposed of, the result is a null [`Shared<T>`]. Otherwise the strong
    /// count is incremented and the result points where this `Weak<T>` does.
    /// ```
    /// use cbrc::{Shared, Weak};
    ///
    /// let shared = Shared::new(100);
    /// let weak = Shared::downgrade(&shared);
    /// let locked = Weak::lock(&weak);
    /// assert_eq!(Shared::use_count(&locked), 2);
    /// ```
    #[inline]
    pub fn lock(this: &Self) -> Shared<T> {
        Weak::upgrade(this).unwrap_or_default()
    }

    /// Like [`Weak::lock`], but returns [`None`] instead of a null handle.
    /// ```
    /// use cbrc::{Shared, Weak};
    ///
    /// let shared = Shared::new(100i32);
    /// let weak = Shared::downgrade(&shared);
    /// let new_shared = Weak::upgrade(&weak).expect("Value was dropped");
    /// drop(weak);
    /// assert_eq!(*new_shared, 100i32);
    /// ```
    #[inline]
    pub fn upgrade(this: &Self) -> Option<Shared<T>> {
        // Once the strong count has hit zero it stays there.
        let block = this.block.filter(|block| block.is_alive())?;
        block.increment_strong();
        Some(Shared::from_parts(Some(block), this.ptr))
    }

    /// Returns whether the observed value is gone (or was never there).
    #[inline]
    pub fn expired(this: &Self) -> bool {
        !this.block.is_some_and(BlockRef::is_alive)
    }

    /// Returns the number of [`Shared`] handles keeping the observed value alive.
    #[inline]
    pub fn use_count(this: &Self) -> usize {
        this.block.map_or(0, BlockRef::strong_count)
    }

    /// Returns the number of `Weak<T>` handles observing the control block, this one included.
    ///
    /// While the pointee is being dropped the block holds one extra weak reference to itself,
    /// so a call made from the pointee's `Drop` reports one more than the live `Weak` handles.
    /// ```
    /// use cbrc::{Shared, Weak};
    ///
    /// let shared = Shared::new(100);
    /// let weak1 = Shared::downgrade(&shared);
    /// let weak2 = weak1.clone();
    /// assert_eq!(Weak::weak_count(&weak2), 2);
    /// ```
    #[inline]
    pub fn weak_count(this: &Self) -> usize {
        this.block.map_or(0, BlockRef::weak_count)
    }

    /// Checks if two handles observe the same control block.
    #[inline]
    pub fn owner_eq<U: ?Sized>(this: &Self, other: &Weak<U>) -> bool {
        match (this.block, other.block) {
            (Some(a), Some(b)) => a.as_ptr() == b.as_ptr(),
            _ => false,
        }
    }

    /// Checks if two handles point at the same address.
    #[inline]
    pub fn ptr_eq(this: &Self, other: &Self) -> bool {
        this.addr() == other.addr()
    }

    /// Releases this handle's weak reference and leaves it observing nothing.
    #[inline]
    pub fn reset(this: &mut Self) {
        drop(mem::take(this));
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

impl<T: ?Sized> Drop for Weak<T> {
    #[inline]
    fn drop(&mut self) {
        if let Some(block) = self.block.take() {
            unsafe { block.decrement_weak() };
        }
    }
}

impl<T: ?Sized> Clone for Weak<T> {
    /// Clone a `Weak<T>` (increment the weak count).
    /// ```
    /// use cbrc::Shared;
    ///
    /// let shared = Shared::new(100);
    /// let weak1 = Shared::downgrade(&shared);
    /// let weak2 = weak1.clone();
    /// assert_eq!(Shared::weak_count(&shared), 2);
    /// ```
    #[inline]
    fn clone(&self) -> Self {
        if let Some(block) = self.block {
            block.increment_weak();
        }
        Weak::from_parts(self.block, self.ptr)
    }

    /// A no-op when `self` already observes the same block at the same address.
    #[inline]
    fn clone_from(&mut self, source: &Self) {
        if self.block == source.block && self.addr() == source.addr() {
            return;
        }
        *self = source.clone();
    }
}

impl<T: ?Sized> Default for Weak<T> {
    fn default() -> Self {
        Weak::new()
    }
}

impl<T: ?Sized> Debug for Weak<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("(Weak)")
    }
}

impl<T: ?Sized> From<&Shared<T>> for Weak<T> {
    /// Equivalent to [`Shared::downgrade`].
    fn from(value: &Shared<T>) -> Self {
        Shared::downgrade(value)
    }
}
