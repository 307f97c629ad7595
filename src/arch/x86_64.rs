//! x86_64 implementation of context switching

use std::arch::naked_asm;

/// Saved CPU context for context switching
///
/// On x86_64 System V ABI, these are the callee-saved registers
/// that must be preserved across function calls, plus the resume address.
#[repr(C)]
#[derive(Debug, Default)]
pub struct Context {
    /// Stack pointer
    rsp: u64,
    /// Resume address
    rip: u64,
    /// Frame pointer
    rbp: u64,
    /// General purpose (callee-saved)
    rbx: u64,
    r12: u64,
    r13: u64,
    r14: u64,
    /// Callee-saved; also carries the argument word of a fresh context
    r15: u64,
}

impl Context {
    /// Create a new context for a fiber.
    ///
    /// - `stack_pointer`: 16-byte aligned, already below the red zone
    /// - `entry`: The entry point function address
    /// - `arg`: Word handed to `entry` in `rdi` on first switch
    ///
    /// # Safety
    /// `stack_pointer - 8` must be writable memory owned by the caller.
    pub unsafe fn new(stack_pointer: usize, entry: usize, arg: u64) -> Self {
        // System V ABI requires RSP to be 16-byte aligned BEFORE `call`.
        // We enter with `jmp`, so simulate the pushed return address:
        //
        //   stack_pointer - 8: null return address (ends backtraces)
        //
        // On entry RSP = 16n+8 as required.
        let rsp = stack_pointer - 8;

        unsafe {
            std::ptr::write(rsp as *mut u64, 0);
        }

        Context {
            rsp: rsp as u64,
            rip: entry as u64,
            r15: arg,
            ..Default::default()
        }
    }

    /// Replace the argument word of a context that has never run.
    pub fn set_arg(&mut self, arg: u64) {
        self.r15 = arg;
    }

    /// Stack pointer recorded in this snapshot.
    pub fn stack_pointer(&self) -> usize {
        self.rsp as usize
    }
}

// Register sequences shared by the three entry points. `$ctx` names the
// register that holds the `Context` pointer.
//
// The saved stack pointer is the caller's after the call returns, and the
// resume address is the return address.
macro_rules! save_to {
    ($ctx:literal) => {
        concat!(
            "mov rax, [rsp]\n",
            "mov [", $ctx, " + 0x08], rax\n",
            "lea rax, [rsp + 8]\n",
            "mov [", $ctx, " + 0x00], rax\n",
            "mov [", $ctx, " + 0x10], rbp\n",
            "mov [", $ctx, " + 0x18], rbx\n",
            "mov [", $ctx, " + 0x20], r12\n",
            "mov [", $ctx, " + 0x28], r13\n",
            "mov [", $ctx, " + 0x30], r14\n",
            "mov [", $ctx, " + 0x38], r15\n",
        )
    };
}

// A fresh context reads its argument from rdi. rdi is caller-saved, so a
// resumed call site never reads it.
macro_rules! load_from {
    ($ctx:literal) => {
        concat!(
            "mov rsp, [", $ctx, " + 0x00]\n",
            "mov rbp, [", $ctx, " + 0x10]\n",
            "mov rbx, [", $ctx, " + 0x18]\n",
            "mov r12, [", $ctx, " + 0x20]\n",
            "mov r13, [", $ctx, " + 0x28]\n",
            "mov r14, [", $ctx, " + 0x30]\n",
            "mov r15, [", $ctx, " + 0x38]\n",
            "mov rax, [", $ctx, " + 0x08]\n",
            "mov rdi, r15\n",
            "jmp rax\n",
        )
    };
}

/// Record the caller's state into `ctx` and return.
///
/// # Safety
/// `ctx` must be valid for writes.
#[unsafe(naked)]
pub unsafe extern "C" fn capture(_ctx: *mut Context) {
    naked_asm!(save_to!("rdi"), "ret");
}

/// Load `ctx` and continue there. Never returns.
///
/// # Safety
/// `ctx` must hold a snapshot taken by `capture`/`exchange` whose frames are
/// still live, or a context built by `Context::new` over a live stack.
#[unsafe(naked)]
pub unsafe extern "C" fn restore(_ctx: *const Context) -> ! {
    naked_asm!(load_from!("rdi"));
}

/// Switch from one context to another
///
/// Saves the current CPU state into `old` and restores state from `new`.
/// For a fresh context this jumps to its entry; otherwise it returns where
/// that context last called `exchange`.
///
/// # Safety
/// `old` must be valid for writes. `new` must satisfy the requirements of
/// [`restore`].
#[unsafe(naked)]
pub unsafe extern "C" fn exchange(_old: *mut Context, _new: *const Context) {
    naked_asm!(save_to!("rdi"), load_from!("rsi"));
}
