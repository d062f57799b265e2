// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Cooperative task runtime built on stackful fibers.
//!
//! Every task runs on its own fiber. Awaiting anything suspends the task's
//! fiber and hands control back to the scheduler, which dispatches ready
//! tasks in FIFO order and polls the event loop for timers and descriptor
//! readiness when nothing is ready. The whole runtime is single-threaded:
//! schedulers, tasks and primitives are tied to the thread that made them.
//!
//! ```ignore
//! use std::time::Duration;
//! use weft_rt::{sleep, Awaitable, Task};
//!
//! let task = Task::spawn(|| {
//!     sleep(Duration::from_millis(10))?;
//!     Ok(42)
//! });
//! assert_eq!(task.wait().unwrap(), 42);
//! ```
//!
//! Awaiting from the top level (outside any task) drives the ambient
//! scheduler's loop until the awaited operation completes.

pub mod awaitable;
pub mod cancel;
pub mod channel;
pub mod config;
pub mod context;
pub mod deferred;
pub mod error;
pub mod event_loop;
pub mod op;
pub mod scheduler;
pub mod signal;
pub mod task;
pub mod timer;
pub mod watcher;

pub use awaitable::{Awaitable, Delegate};
pub use cancel::CancellationHandle;
pub use channel::{Channel, ChannelGroup, Iter};
pub use config::{Config, ConfigError};
pub use context::{Context, ContextVar};
pub use deferred::{Deferred, DeferredAwaitable, DeferredStatus};
pub use error::{Error, ErrorKind, Result};
pub use event_loop::{EventLoop, Interest, Readiness, TimerId};
pub use op::{await_op, Op, OpQueue, OpStatus};
pub use scheduler::{BusyGuard, EnterGuard, HookId, Scheduler};
pub use signal::SignalWatcher;
pub use task::{IntoTaskResult, Task, TaskId, TaskInfo, TaskStatus};
pub use timer::{sleep, Timer};
pub use watcher::StreamWatcher;

#[cfg(test)]
pub(crate) mod test_utils {
    use std::sync::Once;

    use tracing_subscriber::EnvFilter;

    static INIT_LOGGING: Once = Once::new();

    /// Install the fmt subscriber once per test binary. `WEFT_TEST_LOG`
    /// takes an env-filter directive and defaults to `warn`.
    pub fn init_test_logging() {
        INIT_LOGGING.call_once(|| {
            let filter = EnvFilter::try_from_env("WEFT_TEST_LOG").unwrap_or_else(|_| EnvFilter::new("warn"));
            let _ = tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_test_writer()
                .with_target(true)
                .with_ansi(false)
                .try_init();
        });
    }
}
