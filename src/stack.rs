//! Fiber stacks.

use std::io;
use std::ptr;

use crate::error::{Error, Result};

/// Stack size for each fiber (64KB)
pub const DEFAULT_STACK_SIZE: usize = 64 * 1024;
/// Smallest stack a fiber may be built with
pub const MIN_STACK_SIZE: usize = 4 * 1024;
/// Stack pointer alignment required by the ABI
pub const STACK_ALIGN: usize = 16;
/// Scratch area below the stack pointer that leaf code may use freely
pub const RED_ZONE: usize = 128;

const GUARD_PAGES: usize = 1;

/// Mmap'd fiber stack with a guard page below it.
///
/// Layout (grows downward):
/// ```text
/// [guard]  [usable ................]
///  NONE     READ|WRITE
///           ^base                   ^top
/// ```
///
/// Running off the bottom faults on the guard page instead of scribbling
/// over whatever was mapped below.
pub(crate) struct Stack {
    mmap_base: *mut u8,
    mmap_size: usize,
    base: *mut u8,
    size: usize,
}

impl Stack {
    /// Map a stack of at least `size` bytes, rounded up to whole pages.
    pub(crate) fn new(size: usize) -> Result<Self> {
        let page_size = page_size();
        let usable_size = size.next_multiple_of(page_size);
        let guard_size = GUARD_PAGES * page_size;
        let total_size = usable_size + guard_size;

        unsafe {
            let ptr = libc::mmap(
                ptr::null_mut(),
                total_size,
                libc::PROT_NONE,
                libc::MAP_PRIVATE | libc::MAP_ANON,
                -1,
                0,
            );
            if ptr == libc::MAP_FAILED {
                return Err(Error::StackAlloc {
                    size: usable_size,
                    source: io::Error::last_os_error(),
                });
            }

            let usable_ptr = (ptr as *mut u8).add(guard_size);
            let ret = libc::mprotect(
                usable_ptr as *mut libc::c_void,
                usable_size,
                libc::PROT_READ | libc::PROT_WRITE,
            );
            if ret != 0 {
                let err = io::Error::last_os_error();
                libc::munmap(ptr, total_size);
                return Err(Error::GuardPage(err));
            }

            Ok(Stack {
                mmap_base: ptr as *mut u8,
                mmap_size: total_size,
                base: usable_ptr,
                size: usable_size,
            })
        }
    }

    /// One past the highest usable address.
    pub(crate) fn top(&self) -> usize {
        self.base as usize + self.size
    }

    /// Usable size in bytes, excluding the guard page.
    pub(crate) fn size(&self) -> usize {
        self.size
    }

    pub(crate) fn contains(&self, addr: usize) -> bool {
        (self.base as usize..=self.top()).contains(&addr)
    }
}

impl Drop for Stack {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.mmap_base as *mut libc::c_void, self.mmap_size);
        }
    }
}

/// Stack pointer for a fresh context: align `top` down, then step below the
/// red zone so the first frame cannot clobber anything above it.
pub(crate) fn initial_stack_pointer(top: usize) -> usize {
    (top & !(STACK_ALIGN - 1)) - RED_ZONE
}

fn page_size() -> usize {
    // SAFETY: sysconf(_SC_PAGESIZE) always succeeds on POSIX systems.
    unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize }
}
