//! Fibers: an entry closure plus the stack and context it runs on.

use std::any::Any;
use std::cell::{Cell, UnsafeCell};
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};

use crate::context::Context;
use crate::error::{Error, Result, fatal};
use crate::scheduler::{Core, ExitUnwind, Handle};
use crate::stack::{self, DEFAULT_STACK_SIZE, MIN_STACK_SIZE, STACK_ALIGN, Stack};

/// Unique identifier of a fiber
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FiberId(u64);

impl FiberId {
    fn next() -> Self {
        static NEXT_ID: AtomicU64 = AtomicU64::new(1);
        FiberId(NEXT_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for FiberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Where a fiber is in its life
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FiberState {
    /// Built, not yet handed to a scheduler
    New,
    /// Waiting in a ready queue
    Queued,
    /// Its context is the live one
    Running,
    /// Finished; never resumed again
    Done,
}

type Entry<'a, T> = Box<dyn FnOnce(&Handle<'_, 'a, T>) + 'a>;

/// A cooperative task with its own stack
///
/// The fiber owns its stack; a [`Scheduler`](crate::Scheduler) only borrows
/// it, so the stack cannot be unmapped while any scheduler could still switch
/// into it.
pub struct Fiber<'a, T: ?Sized = ()> {
    id: FiberId,
    name: Option<String>,
    entry: Cell<Option<Entry<'a, T>>>,
    context: UnsafeCell<Context>,
    data: Option<&'a T>,
    state: Cell<FiberState>,
    /// Set once the argument word has been bound for the first switch
    started: Cell<bool>,
    stack: Stack,
}

impl<'a> Fiber<'a> {
    /// Create a fiber with no shared data and the default stack size.
    pub fn new<F>(entry: F) -> Result<Self>
    where
        F: FnOnce(&Handle<'_, 'a, ()>) + 'a,
    {
        Builder::new().build(entry)
    }
}

impl<'a, T: ?Sized> Fiber<'a, T> {
    /// Create a fiber that can reach `data` through its handle.
    pub fn with_data<F>(entry: F, data: &'a T) -> Result<Self>
    where
        F: FnOnce(&Handle<'_, 'a, T>) + 'a,
    {
        Builder::new().data(data).build(entry)
    }

    pub fn builder() -> Builder<'a, T> {
        Builder::new()
    }

    pub fn id(&self) -> FiberId {
        self.id
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// Shared data supplied at construction, if any.
    pub fn data(&self) -> Option<&'a T> {
        self.data
    }

    pub fn state(&self) -> FiberState {
        self.state.get()
    }

    pub fn is_done(&self) -> bool {
        self.state.get() == FiberState::Done
    }

    /// Usable stack size in bytes.
    pub fn stack_size(&self) -> usize {
        self.stack.size()
    }

    pub(crate) fn mark_done(&self) {
        self.state.set(FiberState::Done);
    }

    /// Move to `state` unless already done.
    pub(crate) fn set_state(&self, state: FiberState) {
        if !self.is_done() {
            self.state.set(state);
        }
    }

    pub(crate) fn context(&self) -> *mut Context {
        self.context.get()
    }

    pub(crate) fn has_started(&self) -> bool {
        self.started.get()
    }

    /// Hand `core` to the trampoline. Only the first call has any effect;
    /// after that the context holds live register state.
    pub(crate) fn bind(&self, core: *const ()) {
        if !self.started.replace(true) {
            // SAFETY: the context has never run, so nothing else reads it.
            unsafe { (*self.context.get()).set_arg(core as u64) };
        }
    }

    fn take_entry(&self) -> Option<Entry<'a, T>> {
        self.entry.take()
    }
}

impl<T: ?Sized> fmt::Display for Fiber<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.name {
            Some(name) => write!(f, "fiber {} ({})", self.id, name),
            None => write!(f, "fiber {}", self.id),
        }
    }
}

impl<T: ?Sized> fmt::Debug for Fiber<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Fiber")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("state", &self.state.get())
            .field("stack_size", &self.stack.size())
            .finish_non_exhaustive()
    }
}

/// Fiber factory, which can be used to configure a fiber before building it
#[derive(Debug)]
pub struct Builder<'a, T: ?Sized = ()> {
    name: Option<String>,
    stack_size: usize,
    data: Option<&'a T>,
}

impl<'a, T: ?Sized> Builder<'a, T> {
    pub fn new() -> Self {
        Builder {
            name: None,
            stack_size: DEFAULT_STACK_SIZE,
            data: None,
        }
    }

    /// Name shown in log lines.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Stack size in bytes; rounded up to whole pages.
    pub fn stack_size(mut self, size: usize) -> Self {
        self.stack_size = size;
        self
    }

    pub fn data(mut self, data: &'a T) -> Self {
        self.data = Some(data);
        self
    }

    /// Map the stack and build the initial context.
    pub fn build<F>(self, entry: F) -> Result<Fiber<'a, T>>
    where
        F: FnOnce(&Handle<'_, 'a, T>) + 'a,
    {
        if self.stack_size < MIN_STACK_SIZE {
            return Err(Error::StackTooSmall {
                requested: self.stack_size,
                minimum: MIN_STACK_SIZE,
            });
        }

        let stack = Stack::new(self.stack_size)?;
        let sp = stack::initial_stack_pointer(stack.top());
        if sp % STACK_ALIGN != 0 || !stack.contains(sp) {
            fatal!("initial stack pointer {:#x} is misaligned or outside its stack", sp);
        }

        // The argument word is bound to the scheduler on the first switch.
        // SAFETY: the word below `sp` lies inside `stack`.
        let context = unsafe { Context::new(sp, fiber_main::<T> as *const () as usize, 0) };
        let entry: Entry<'a, T> = Box::new(entry);

        let fiber = Fiber {
            id: FiberId::next(),
            name: self.name,
            entry: Cell::new(Some(entry)),
            context: UnsafeCell::new(context),
            data: self.data,
            state: Cell::new(FiberState::New),
            started: Cell::new(false),
            stack,
        };
        log::debug!("created {} with {} byte stack", fiber, fiber.stack_size());
        Ok(fiber)
    }
}

impl<T: ?Sized> Default for Builder<'_, T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Entry point for new fibers
///
/// The scheduler core arrives as the context's argument word. Returning from
/// the entry closure exits the fiber, and so does [`Handle::exit`] by
/// unwinding to here. A panic is contained here because it cannot unwind past
/// the switch that started this stack.
extern "C" fn fiber_main<T: ?Sized>(core: *const ()) -> ! {
    // SAFETY: `Scheduler::run` binds its core before the first switch and
    // outlives every fiber it runs.
    let core = unsafe { &*core.cast::<Core<'_, T>>() };
    let fiber = core
        .current()
        .unwrap_or_else(|| fatal!("fiber started with no current fiber"));

    if let Some(entry) = fiber.take_entry() {
        log::debug!("{} started", fiber);
        let handle = Handle::new(core);
        if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| entry(&handle)))
            && !payload.is::<ExitUnwind>()
        {
            log::error!("{} panicked: {}", fiber, panic_message(&*payload));
        }
    }

    core.finish()
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        msg
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg
    } else {
        "<non-string panic payload>"
    }
}
