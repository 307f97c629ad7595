//! Precondition violations abort the process. Each test re-runs itself in a
//! child process and checks how the child died.

use std::env;
use std::os::unix::process::ExitStatusExt;
use std::process::Command;

use myfiber::{Fiber, Scheduler};

const CHILD_ENV: &str = "MYFIBER_ABORT_CHILD";

fn in_child() -> bool {
    env::var_os(CHILD_ENV).is_some()
}

fn expect_abort(test: &str, message: &str) {
    let output = Command::new(env::current_exe().unwrap())
        .args([test, "--exact", "--nocapture", "--test-threads=1"])
        .env(CHILD_ENV, "1")
        .output()
        .unwrap();

    let stderr = String::from_utf8_lossy(&output.stderr);
    assert_eq!(
        output.status.signal(),
        Some(libc::SIGABRT),
        "child did not abort: {:?}\n{}",
        output.status,
        stderr
    );
    assert!(stderr.contains("myfiber: fatal:"), "stderr: {}", stderr);
    assert!(stderr.contains(message), "stderr: {}", stderr);
}

#[test]
fn yield_outside_a_fiber_aborts() {
    if in_child() {
        let scheduler: Scheduler = Scheduler::new();
        scheduler.yield_now();
        return;
    }
    expect_abort(
        "yield_outside_a_fiber_aborts",
        "yield_now called with no running fiber",
    );
}

#[test]
fn exit_outside_a_fiber_aborts() {
    if in_child() {
        let scheduler: Scheduler = Scheduler::new();
        scheduler.exit();
    }
    expect_abort(
        "exit_outside_a_fiber_aborts",
        "exit called with no running fiber",
    );
}

#[test]
fn run_from_inside_a_fiber_aborts() {
    if in_child() {
        // The fiber needs the scheduler and the scheduler needs the fiber.
        // The child never returns, so both are leaked.
        let scheduler: &'static Scheduler<'static, 'static> = Box::leak(Box::new(Scheduler::new()));
        let nested: &'static Fiber<'static> =
            Box::leak(Box::new(Fiber::new(move |_| scheduler.run()).unwrap()));
        scheduler.spawn(nested);
        scheduler.run();
        return;
    }
    expect_abort(
        "run_from_inside_a_fiber_aborts",
        "Scheduler::run called while already running",
    );
}
