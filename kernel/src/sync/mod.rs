//! Kernel synchronisation primitives.
//!
//! Locking throughout the kernel uses `spin::Mutex` / `spin::Once` at the
//! public entry points of every process-wide singleton. This module adds
//! the completion flag used to bridge synchronous callers over the
//! asynchronous device APIs.

mod completion;

pub use completion::CompletionFlag;
