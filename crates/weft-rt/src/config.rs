// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Scheduler configuration.
//!
//! Settings are resolved once, when a scheduler is constructed. Values set
//! in the environment override the defaults:
//!
//! | Variable | Type | Maps to |
//! |----------|------|---------|
//! | `WEFT_STACK_SIZE` | `usize` (bytes) | `stack_size` |
//! | `WEFT_THREAD_POOL_SIZE` | `usize` | `thread_pool_size` |
//! | `WEFT_DEBUG` | `bool` | `debug` |
//! | `WEFT_INLINE_TASKS` | `bool` | `inline_tasks` |

use weft_fiber::DEFAULT_STACK_SIZE;

pub const ENV_STACK_SIZE: &str = "WEFT_STACK_SIZE";
pub const ENV_THREAD_POOL_SIZE: &str = "WEFT_THREAD_POOL_SIZE";
pub const ENV_DEBUG: &str = "WEFT_DEBUG";
pub const ENV_INLINE_TASKS: &str = "WEFT_INLINE_TASKS";

/// Smallest native stack a task fiber may be given.
pub const MIN_STACK_SIZE: usize = 16 * 1024;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid value for {var}: expected {expected}, got {value:?}")]
    Invalid {
        var: &'static str,
        expected: &'static str,
        value: String,
    },

    #[error("stack size {0} is below the minimum of {MIN_STACK_SIZE} bytes")]
    StackTooSmall(usize),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Native stack size for task fibers.
    pub stack_size: usize,
    /// Size of the blocking worker pool offered to I/O collaborators.
    pub thread_pool_size: usize,
    /// Log failed tasks whose error nobody observed.
    pub debug: bool,
    /// Run not-yet-started tasks on the awaiting fiber when possible.
    pub inline_tasks: bool,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            stack_size: DEFAULT_STACK_SIZE,
            thread_pool_size: 4,
            debug: false,
            inline_tasks: false,
        }
    }
}

impl Config {
    /// Defaults with environment overrides applied.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Config::default();
        apply_env_overrides(&mut config)?;
        Ok(config)
    }

    pub fn stack_size(mut self, bytes: usize) -> Self {
        self.stack_size = bytes;
        self
    }

    pub fn thread_pool_size(mut self, n: usize) -> Self {
        self.thread_pool_size = n;
        self
    }

    pub fn debug(mut self, on: bool) -> Self {
        self.debug = on;
        self
    }

    pub fn inline_tasks(mut self, on: bool) -> Self {
        self.inline_tasks = on;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.stack_size < MIN_STACK_SIZE {
            return Err(ConfigError::StackTooSmall(self.stack_size));
        }
        Ok(())
    }
}

/// Apply `WEFT_*` environment variables to `config`.
///
/// Only variables that are set are applied; a set but unparseable value is
/// an error.
pub fn apply_env_overrides(config: &mut Config) -> Result<(), ConfigError> {
    if let Some(val) = read_env(ENV_STACK_SIZE) {
        config.stack_size = parse_usize(ENV_STACK_SIZE, &val)?;
    }
    if let Some(val) = read_env(ENV_THREAD_POOL_SIZE) {
        config.thread_pool_size = parse_usize(ENV_THREAD_POOL_SIZE, &val)?;
    }
    if let Some(val) = read_env(ENV_DEBUG) {
        config.debug = parse_bool(ENV_DEBUG, &val)?;
    }
    if let Some(val) = read_env(ENV_INLINE_TASKS) {
        config.inline_tasks = parse_bool(ENV_INLINE_TASKS, &val)?;
    }
    config.validate()
}

fn read_env(name: &str) -> Option<String> {
    std::env::var(name).ok()
}

fn parse_usize(var: &'static str, val: &str) -> Result<usize, ConfigError> {
    val.trim().parse::<usize>().map_err(|_| ConfigError::Invalid {
        var,
        expected: "unsigned integer",
        value: val.to_string(),
    })
}

fn parse_bool(var: &'static str, val: &str) -> Result<bool, ConfigError> {
    match val.trim().to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::Invalid {
            var,
            expected: "bool (true/false/1/0/yes/no)",
            value: val.to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    // Tests below mutate process-wide environment variables.
    static ENV_LOCK: Mutex<()> = Mutex::new(());

    fn clear_env() {
        for var in [ENV_STACK_SIZE, ENV_THREAD_POOL_SIZE, ENV_DEBUG, ENV_INLINE_TASKS] {
            std::env::remove_var(var);
        }
    }

    #[test]
    fn defaults() {
        let config = Config::default();
        assert_eq!(config.stack_size, DEFAULT_STACK_SIZE);
        assert_eq!(config.thread_pool_size, 4);
        assert!(!config.debug);
        assert!(!config.inline_tasks);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn builder_setters() {
        let config = Config::default()
            .stack_size(64 * 1024)
            .thread_pool_size(2)
            .debug(true)
            .inline_tasks(true);
        assert_eq!(config.stack_size, 64 * 1024);
        assert_eq!(config.thread_pool_size, 2);
        assert!(config.debug);
        assert!(config.inline_tasks);
    }

    #[test]
    fn env_overrides_apply() {
        let _guard = ENV_LOCK.lock().unwrap();
        clear_env();
        std::env::set_var(ENV_STACK_SIZE, "131072");
        std::env::set_var(ENV_DEBUG, "yes");
        std::env::set_var(ENV_INLINE_TASKS, "off");
        let config = Config::from_env().unwrap();
        clear_env();

        assert_eq!(config.stack_size, 131072);
        assert!(config.debug);
        assert!(!config.inline_tasks);
        assert_eq!(config.thread_pool_size, 4);
    }

    #[test]
    fn env_rejects_garbage() {
        let _guard = ENV_LOCK.lock().unwrap();
        clear_env();
        std::env::set_var(ENV_THREAD_POOL_SIZE, "many");
        let err = Config::from_env().unwrap_err();
        clear_env();

        assert_eq!(
            err,
            ConfigError::Invalid {
                var: ENV_THREAD_POOL_SIZE,
                expected: "unsigned integer",
                value: "many".into(),
            }
        );
        assert!(err.to_string().contains("WEFT_THREAD_POOL_SIZE"));
    }

    #[test]
    fn env_rejects_tiny_stack() {
        let _guard = ENV_LOCK.lock().unwrap();
        clear_env();
        std::env::set_var(ENV_STACK_SIZE, "1024");
        let err = Config::from_env().unwrap_err();
        clear_env();

        assert_eq!(err, ConfigError::StackTooSmall(1024));
    }
}
