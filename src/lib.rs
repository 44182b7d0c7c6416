//! `Shared<T>` is a heap-allocated, reference-counted smart pointer for single-threaded code, and
//! `Weak<T>` is its non-owning observer. `cbrc` stands for: Control-Block Reference Counted.
//!
//! Every owned value is tracked by one control block holding two counts: a strong count for the
//! `Shared<T>` handles and a weak count for the `Weak<T>` handles. When the strong count drops to
//! zero the value is disposed of; when both counts are zero the control block itself is freed.
//! Keeping the block alive after disposal is what lets a `Weak<T>` reliably report that its value
//! is gone.
//!
//! There are two kinds of control block:
//! - `Shared::new` (and `new_with`, `try_new_with`) puts the value inside the control block, so
//!   creating a `Shared<T>` costs a single allocation.
//! - `Shared::from_box` and `Shared::from_raw_with` take over a value that was allocated
//!   elsewhere. A custom disposer can be supplied to release it.
//!
//! Unlike `Rc<T>`, a `Shared<T>` can be null, and the pointer it dereferences to can differ from
//! the value its block owns (see `Shared::map`). This is used to hand out a handle to a field
//! while keeping the whole value alive.
//!
//! A cycle between `Shared` pointers cannot be freed as the strong counts will never reach zero.
//! The solution is a `Weak<T>`, which must be promoted back into a `Shared<T>` with `Weak::lock`
//! before the data can be reached.
//!
//! The counts are not atomic, so neither handle implements `Send` or `Sync`.
//!
//! Lifecycle events (disposal, block deallocation, allocation failure) are reported through the
//! `log` facade under the `cbrc::block` target.

mod block;
pub mod error;
pub mod shared;
pub mod weak;

pub use crate::error::{AllocError, CreateError};
pub use crate::shared::Shared;
pub use crate::weak::Weak;

#[cfg(test)]
mod tests;
