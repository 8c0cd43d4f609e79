//! Kernel synchronization primitives shared by drivers and tasking.

pub mod completion;

pub use completion::{CommandFuture, CompletionLock};
