//! Round-robin fiber scheduler
//!
//! # Example
//!
//! ```no_run
//! use myfiber::{Fiber, Scheduler};
//!
//! let f1 = Fiber::new(|h| {
//!     println!("Fiber 1");
//!     h.yield_now();
//!     println!("Fiber 1 done");
//! })
//! .unwrap();
//!
//! let f2 = Fiber::new(|_| {
//!     println!("Fiber 2");
//! })
//! .unwrap();
//!
//! let scheduler = Scheduler::new();
//! scheduler.spawn(&f1);
//! scheduler.spawn(&f2);
//! scheduler.run();
//! ```

use std::cell::{Cell, RefCell, UnsafeCell};
use std::collections::VecDeque;
use std::panic;
use std::ptr::NonNull;

use crate::context::{self, Context};
use crate::error::fatal;
use crate::fiber::{Fiber, FiberId, FiberState};

/// Unwind payload of [`Handle::exit`], recognised by the fiber trampoline
pub(crate) struct ExitUnwind;

/// The part of the scheduler a running fiber talks to
///
/// It holds no borrow of the fibers, so the trampoline can reach it through
/// a plain pointer.
pub(crate) struct Core<'a, T: ?Sized> {
    /// Context to return to when a fiber yields or exits
    main: UnsafeCell<Context>,
    /// Fiber whose context is live; `None` whenever the scheduler itself runs
    current: Cell<Option<NonNull<Fiber<'a, T>>>>,
}

impl<'a, T: ?Sized> Core<'a, T> {
    fn new() -> Self {
        Core {
            main: UnsafeCell::new(Context::default()),
            current: Cell::new(None),
        }
    }

    pub(crate) fn current(&self) -> Option<&Fiber<'a, T>> {
        // SAFETY: `current` is only set while `run` holds the fiber borrowed.
        self.current.get().map(|fiber| unsafe { fiber.as_ref() })
    }

    fn running_fiber(&self, op: &str) -> &Fiber<'a, T> {
        match self.current() {
            Some(fiber) => fiber,
            None => fatal!("{} called with no running fiber", op),
        }
    }

    pub(crate) fn yield_now(&self) {
        let fiber = self.running_fiber("yield_now");
        log::trace!("{} yielded", fiber);
        // SAFETY: the fiber's stack is live; `main` was saved by the exchange
        // in `Scheduler::switch_to` that is waiting for us.
        unsafe { context::exchange(fiber.context(), self.main.get()) };
    }

    /// Unwind the running fiber back to its trampoline, which then finishes
    /// it. Without unwinding support the fiber finishes on the spot.
    pub(crate) fn exit(&self) -> ! {
        let fiber = self.running_fiber("exit");
        log::trace!("{} exiting", fiber);
        if cfg!(panic = "unwind") {
            panic::resume_unwind(Box::new(ExitUnwind));
        }
        self.finish()
    }

    pub(crate) fn finish(&self) -> ! {
        let fiber = self.running_fiber("exit");
        fiber.mark_done();
        log::debug!("{} completed", fiber);
        // SAFETY: as in `yield_now`. Nothing ever switches back here.
        unsafe { context::restore(self.main.get()) }
    }

    pub(crate) fn current_data(&self) -> Option<&'a T> {
        self.current().and_then(Fiber::data)
    }
}

/// Services available to code running inside a fiber
///
/// Every entry closure receives one.
pub struct Handle<'h, 'a, T: ?Sized> {
    core: &'h Core<'a, T>,
}

impl<'h, 'a, T: ?Sized> Handle<'h, 'a, T> {
    pub(crate) fn new(core: &'h Core<'a, T>) -> Self {
        Handle { core }
    }

    /// Suspend this fiber and go to the back of the ready queue.
    ///
    /// Returns once every other runnable fiber has had a turn.
    pub fn yield_now(&self) {
        self.core.yield_now();
    }

    /// Finish this fiber immediately.
    ///
    /// The fiber's stack is unwound, so its locals and the entry closure's
    /// captures are dropped as if the closure had returned. A `catch_unwind`
    /// inside the fiber will intercept the exit.
    pub fn exit(&self) -> ! {
        self.core.exit()
    }

    /// Shared data the fiber was built with.
    pub fn data(&self) -> Option<&'a T> {
        self.core.current_data()
    }

    pub fn id(&self) -> FiberId {
        self.core.running_fiber("id").id()
    }
}

/// Cooperative single-threaded scheduler
///
/// Fibers are borrowed for `'f`, so none of them can be dropped while the
/// scheduler might still switch into it.
pub struct Scheduler<'f, 'a, T: ?Sized = ()> {
    core: Core<'a, T>,
    /// Queue of runnable fibers
    ready: RefCell<VecDeque<&'f Fiber<'a, T>>>,
    /// Flag to track if run() is currently executing
    running: Cell<bool>,
}

impl<'f, 'a, T: ?Sized> Scheduler<'f, 'a, T> {
    pub fn new() -> Self {
        Scheduler {
            core: Core::new(),
            ready: RefCell::new(VecDeque::new()),
            running: Cell::new(false),
        }
    }

    /// Append a fiber to the back of the ready queue
    ///
    /// Can be called before `run()` or while it is running. A fiber that was
    /// already handed to a scheduler is ignored.
    pub fn spawn(&self, fiber: &'f Fiber<'a, T>) {
        if fiber.state() != FiberState::New {
            log::warn!("not spawning {}: already {:?}", fiber, fiber.state());
            return;
        }
        fiber.set_state(FiberState::Queued);
        self.ready.borrow_mut().push_back(fiber);
        log::debug!("spawned {}", fiber);
    }

    /// Run fibers until the ready queue is empty
    ///
    /// Aborts if called from inside one of this scheduler's fibers.
    pub fn run(&self) {
        if self.running.replace(true) {
            fatal!("Scheduler::run called while already running");
        }
        log::debug!("scheduler started with {} fiber(s)", self.len());

        // SAFETY: `main` is only restored by a fiber after `switch_to` has
        // overwritten it, so this snapshot is never resumed.
        unsafe { context::capture(self.core.main.get()) };

        loop {
            let Some(fiber) = self.ready.borrow_mut().pop_front() else {
                break;
            };

            self.switch_to(fiber);

            // We're back! The fiber either yielded or finished
            if fiber.is_done() {
                log::trace!("{} retired", fiber);
            } else {
                fiber.set_state(FiberState::Queued);
                self.ready.borrow_mut().push_back(fiber);
            }
        }

        self.running.set(false);
        log::debug!("scheduler finished");
    }

    fn switch_to(&self, fiber: &'f Fiber<'a, T>) {
        fiber.set_state(FiberState::Running);
        fiber.bind(&self.core as *const Core<'a, T> as *const ());
        self.core.current.set(Some(NonNull::from(fiber)));

        log::trace!("switching to {}", fiber);
        // SAFETY: the fiber's context was built over its own stack or saved by
        // `Core::yield_now`, and the stack stays mapped for `'f`.
        unsafe { context::exchange(self.core.main.get(), fiber.context()) };

        self.core.current.set(None);
    }

    /// Yield the running fiber. Aborts if no fiber is running.
    pub fn yield_now(&self) {
        self.core.yield_now();
    }

    /// Finish the running fiber. Aborts if no fiber is running.
    pub fn exit(&self) -> ! {
        self.core.exit()
    }

    /// Shared data of the running fiber, or `None` outside of one.
    pub fn current_data(&self) -> Option<&'a T> {
        self.core.current_data()
    }

    pub fn current_id(&self) -> Option<FiberId> {
        self.core.current().map(Fiber::id)
    }

    /// Number of fibers waiting in the ready queue.
    pub fn len(&self) -> usize {
        self.ready.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.ready.borrow().is_empty()
    }
}

impl<T: ?Sized> Default for Scheduler<'_, '_, T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: ?Sized> Drop for Scheduler<'_, '_, T> {
    fn drop(&mut self) {
        // Fibers that never ran may go to another scheduler. Suspended ones
        // hold a handle to this one and stay queued forever.
        for fiber in self.ready.get_mut().drain(..) {
            if fiber.has_started() {
                log::warn!("{} dropped while suspended", fiber);
            } else {
                fiber.set_state(FiberState::New);
            }
        }
    }
}
