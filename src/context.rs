//! Low-level context switching primitives.
//!
//! A [`Context`] is an opaque snapshot of the machine state a suspended
//! execution needs to continue: stack pointer, resume address, frame pointer
//! and the callee-saved registers. It is never inspected, only moved through
//! three operations:
//!
//! - [`capture`]: record the caller's state and return normally
//! - [`restore`]: continue at a snapshot, never returning
//! - [`exchange`]: record the caller's state and continue at another
//!   snapshot; returns when something later targets the saved one
//!
//! Contexts built with [`Context::new`] start at an entry function on a
//! fresh stack. The entry receives the context's argument word as its only
//! parameter and must never return.

pub use crate::arch::{Context, capture, exchange, restore};
