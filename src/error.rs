use std::{alloc::Layout, convert::Infallible};

use thiserror::Error;

/// A control block could not be allocated.
///
/// By the time this error reaches the caller, whatever was handed over for ownership has
/// already been disposed of: the disposer ran on the raw pointer, or the value was dropped.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error(
    "failed to allocate a control block of {} bytes (align {})",
    .layout.size(),
    .layout.align()
)]
pub struct AllocError {
    layout: Layout,
}

impl AllocError {
    #[cold]
    pub(crate) fn new(layout: Layout) -> Self {
        AllocError { layout }
    }

    /// The layout of the block that could not be allocated.
    pub fn layout(&self) -> Layout {
        self.layout
    }
}

/// Failure while creating a pointee in place with [`Shared::try_new_with`](crate::Shared::try_new_with).
///
/// In both cases the block's storage has been freed and no disposal took place.
#[derive(Error, Debug)]
pub enum CreateError<E> {
    #[error(transparent)]
    Alloc(#[from] AllocError),

    #[error("pointee construction failed: {0}")]
    Construct(E),
}

impl<E> CreateError<E> {
    /// Returns the constructor's error, if that is what failed.
    pub fn into_construct(self) -> Option<E> {
        match self {
            CreateError::Construct(err) => Some(err),
            CreateError::Alloc(_) => None,
        }
    }
}

impl CreateError<Infallible> {
    pub(crate) fn into_alloc(self) -> AllocError {
        match self {
            CreateError::Alloc(err) => err,
            CreateError::Construct(never) => match never {},
        }
    }
}
