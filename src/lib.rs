//! Cooperative single-threaded fibers
//!
//! Each [`Fiber`] runs on its own mmap'd stack. A [`Scheduler`] switches
//! between them round-robin with a hand-written context switch: a fiber runs
//! until it calls [`Handle::yield_now`], returns, or calls [`Handle::exit`].
//!
//! - [`context`]: raw capture / restore / exchange primitives
//! - [`fiber`]: fibers and their builder
//! - [`scheduler`]: the ready queue and the services fibers call back into

mod arch;
pub mod context;
mod error;
pub mod fiber;
pub mod scheduler;
pub mod stack;

pub use error::{Error, Result};
pub use fiber::{Builder, Fiber, FiberId, FiberState};
pub use scheduler::{Handle, Scheduler};
