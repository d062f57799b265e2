// SPDX-License-Identifier: (MIT OR Apache-2.0)
#![allow(dead_code)]

use std::os::unix::io::RawFd;
use std::sync::Once;

use tracing_subscriber::EnvFilter;
use weft_rt::{Config, Scheduler};

static INIT_LOGGING: Once = Once::new();

pub fn init_test_logging() {
    INIT_LOGGING.call_once(|| {
        let filter = EnvFilter::try_from_env("WEFT_TEST_LOG").unwrap_or_else(|_| EnvFilter::new("warn"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .with_ansi(false)
            .try_init();
    });
}

/// Fresh scheduler with small task stacks.
pub fn scheduler() -> Scheduler {
    scheduler_with(Config::default())
}

pub fn scheduler_with(config: Config) -> Scheduler {
    init_test_logging();
    Scheduler::with_config(config.stack_size(64 * 1024))
}

/// Non-blocking pipe, `(read, write)`.
pub fn pipe() -> (RawFd, RawFd) {
    let mut fds = [0i32; 2];
    let ret = unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_NONBLOCK | libc::O_CLOEXEC) };
    assert_eq!(ret, 0, "pipe2 failed: {}", std::io::Error::last_os_error());
    (fds[0], fds[1])
}

pub fn close_fds(fds: &[RawFd]) {
    for &fd in fds {
        unsafe { libc::close(fd) };
    }
}
