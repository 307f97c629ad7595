//! aarch64 implementation of context switching

use std::arch::naked_asm;

/// Saved CPU context for context switching
///
/// On aarch64 (AAPCS64), these are the callee-saved registers
/// that must be preserved across function calls:
/// - x19-x28: general purpose callee-saved registers
/// - d8-d15: floating-point/SIMD callee-saved registers (lower 64 bits of v8-v15)
#[repr(C)]
#[derive(Debug, Default)]
pub struct Context {
    /// Stack pointer
    sp: u64,
    /// Link register (resume address)
    lr: u64,
    /// Frame pointer
    fp: u64,
    /// General purpose (callee-saved); x19 also carries the argument word
    /// of a fresh context
    x19: u64,
    x20: u64,
    x21: u64,
    x22: u64,
    x23: u64,
    x24: u64,
    x25: u64,
    x26: u64,
    x27: u64,
    x28: u64,
    /// Floating-point/SIMD (callee-saved, lower 64 bits)
    d8: u64,
    d9: u64,
    d10: u64,
    d11: u64,
    d12: u64,
    d13: u64,
    d14: u64,
    d15: u64,
}

impl Context {
    /// Create a new context for a fiber.
    ///
    /// - `stack_pointer`: 16-byte aligned, already below the red zone
    /// - `entry`: The entry point function address
    /// - `arg`: Word handed to `entry` in `x0` on first switch
    ///
    /// # Safety
    /// `stack_pointer` must point just past memory owned by the caller.
    pub unsafe fn new(stack_pointer: usize, entry: usize, arg: u64) -> Self {
        // On aarch64, `ret` jumps to the address in lr.
        // No return address lives on the stack.
        Context {
            sp: stack_pointer as u64,
            lr: entry as u64,
            x19: arg,
            ..Default::default()
        }
    }

    /// Replace the argument word of a context that has never run.
    pub fn set_arg(&mut self, arg: u64) {
        self.x19 = arg;
    }

    /// Stack pointer recorded in this snapshot.
    pub fn stack_pointer(&self) -> usize {
        self.sp as usize
    }
}

// Register sequences shared by the three entry points. `$ctx` names the
// register that holds the `Context` pointer.
macro_rules! save_to {
    ($ctx:literal) => {
        concat!(
            "mov x9, sp\n",
            "str x9,  [", $ctx, ", #0x00]\n",
            "str lr,  [", $ctx, ", #0x08]\n",
            "str fp,  [", $ctx, ", #0x10]\n",
            "stp x19, x20, [", $ctx, ", #0x18]\n",
            "stp x21, x22, [", $ctx, ", #0x28]\n",
            "stp x23, x24, [", $ctx, ", #0x38]\n",
            "stp x25, x26, [", $ctx, ", #0x48]\n",
            "stp x27, x28, [", $ctx, ", #0x58]\n",
            "stp d8,  d9,  [", $ctx, ", #0x68]\n",
            "stp d10, d11, [", $ctx, ", #0x78]\n",
            "stp d12, d13, [", $ctx, ", #0x88]\n",
            "stp d14, d15, [", $ctx, ", #0x98]\n",
        )
    };
}

// Ends by jumping to the loaded lr with the argument word in x0. x0 is
// caller-saved, so a resumed call site never reads it.
macro_rules! load_from {
    ($ctx:literal) => {
        concat!(
            "ldr x9,  [", $ctx, ", #0x00]\n",
            "mov sp, x9\n",
            "ldr lr,  [", $ctx, ", #0x08]\n",
            "ldr fp,  [", $ctx, ", #0x10]\n",
            "ldp x19, x20, [", $ctx, ", #0x18]\n",
            "ldp x21, x22, [", $ctx, ", #0x28]\n",
            "ldp x23, x24, [", $ctx, ", #0x38]\n",
            "ldp x25, x26, [", $ctx, ", #0x48]\n",
            "ldp x27, x28, [", $ctx, ", #0x58]\n",
            "ldp d8,  d9,  [", $ctx, ", #0x68]\n",
            "ldp d10, d11, [", $ctx, ", #0x78]\n",
            "ldp d12, d13, [", $ctx, ", #0x88]\n",
            "ldp d14, d15, [", $ctx, ", #0x98]\n",
            "mov x0, x19\n",
            "ret\n",
        )
    };
}

/// Record the caller's state into `ctx` and return.
///
/// # Safety
/// `ctx` must be valid for writes.
#[unsafe(naked)]
pub unsafe extern "C" fn capture(_ctx: *mut Context) {
    naked_asm!(save_to!("x0"), "ret");
}

/// Load `ctx` and continue there. Never returns.
///
/// # Safety
/// `ctx` must hold a snapshot taken by `capture`/`exchange` whose frames are
/// still live, or a context built by `Context::new` over a live stack.
#[unsafe(naked)]
pub unsafe extern "C" fn restore(_ctx: *const Context) -> ! {
    naked_asm!(load_from!("x0"));
}

/// Save into `old`, then continue at `new`
///
/// Returns when another context later switches back to `old`.
///
/// # Safety
/// `old` must be valid for writes. `new` must satisfy the requirements of
/// [`restore`].
#[unsafe(naked)]
pub unsafe extern "C" fn exchange(_old: *mut Context, _new: *const Context) {
    naked_asm!(save_to!("x0"), load_from!("x1"));
}
