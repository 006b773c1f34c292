//! Thread creation attributes.

use crate::config::RuntimeConfig;
use crate::error::{Error, Result};
use crate::pthread::thread::ThreadId;

/// Smallest stack a thread may be created with.
pub const PTHREAD_STACK_MIN: usize = 16 * 1024;

/// Priority used when an attribute set leaves it unset.
pub const DEFAULT_PRIORITY: u8 = 5;

/// Longest thread name accepted, in bytes.
pub const MAX_NAME_LEN: usize = 15;

/// Whether a new thread starts running or waits for
/// [`ThreadTable::resume`](crate::pthread::ThreadTable::resume).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum InitialState {
    #[default]
    Run,
    Suspended,
}

/// Runs on a new thread before its creator returns from `create`.
pub type InitHook = fn(ThreadId);

/// Attributes for [`ThreadTable::create`](crate::pthread::ThreadTable::create).
#[derive(Debug, Clone)]
pub struct ThreadAttr {
    /// Stack size in bytes; `None` uses the runtime default.
    pub stack_size: Option<usize>,
    pub priority: u8,
    /// Core to pin to; `None` lets the scheduler choose.
    pub core: Option<usize>,
    pub initial_state: InitialState,
    pub detached: bool,
    /// Thread name; `None` derives one from the thread handle.
    pub name: Option<String>,
    /// Called on the new task, with its handle, before `create` returns and
    /// before a suspended thread parks.
    pub init: Option<InitHook>,
}

impl Default for ThreadAttr {
    fn default() -> Self {
        Self {
            stack_size: None,
            priority: DEFAULT_PRIORITY,
            core: None,
            initial_state: InitialState::Run,
            detached: false,
            name: None,
            init: None,
        }
    }
}

impl ThreadAttr {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_stack_size(mut self, bytes: usize) -> Self {
        self.stack_size = Some(bytes);
        self
    }

    #[must_use]
    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = priority;
        self
    }

    #[must_use]
    pub fn with_core(mut self, core: usize) -> Self {
        self.core = Some(core);
        self
    }

    #[must_use]
    pub fn with_initial_state(mut self, state: InitialState) -> Self {
        self.initial_state = state;
        self
    }

    #[must_use]
    pub fn detached(mut self, detached: bool) -> Self {
        self.detached = detached;
        self
    }

    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    #[must_use]
    pub fn with_init(mut self, hook: InitHook) -> Self {
        self.init = Some(hook);
        self
    }

    /// Check every attribute against `config`.
    pub fn validate(&self, config: &RuntimeConfig) -> Result<()> {
        if self.stack_size.is_some_and(|s| s < PTHREAD_STACK_MIN) {
            return Err(Error::InvalidArgument);
        }
        if self.priority == 0 || self.priority >= config.max_priority {
            return Err(Error::InvalidArgument);
        }
        if self.core.is_some_and(|c| c >= config.cpu_count) {
            return Err(Error::InvalidArgument);
        }
        if let Some(name) = &self.name {
            validate_name(name)?;
        }
        Ok(())
    }

    /// Effective stack size under `config`.
    #[must_use]
    pub fn effective_stack_size(&self, config: &RuntimeConfig) -> usize {
        self.stack_size.unwrap_or(config.default_stack_size)
    }
}

/// Reject names longer than [`MAX_NAME_LEN`] bytes.
pub fn validate_name(name: &str) -> Result<()> {
    if name.len() > MAX_NAME_LEN {
        return Err(Error::InvalidArgument);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        assert_eq!(ThreadAttr::new().validate(&RuntimeConfig::default()), Ok(()));
    }

    #[test]
    fn small_stack_rejected() {
        let attr = ThreadAttr::new().with_stack_size(PTHREAD_STACK_MIN - 1);
        assert_eq!(attr.validate(&RuntimeConfig::default()), Err(Error::InvalidArgument));
        let attr = ThreadAttr::new().with_stack_size(PTHREAD_STACK_MIN);
        assert_eq!(attr.validate(&RuntimeConfig::default()), Ok(()));
    }

    #[test]
    fn priority_bounds() {
        let config = RuntimeConfig::default();
        assert!(ThreadAttr::new().with_priority(0).validate(&config).is_err());
        assert!(ThreadAttr::new().with_priority(1).validate(&config).is_ok());
        assert!(
            ThreadAttr::new()
                .with_priority(config.max_priority - 1)
                .validate(&config)
                .is_ok()
        );
        assert!(
            ThreadAttr::new()
                .with_priority(config.max_priority)
                .validate(&config)
                .is_err()
        );
    }

    #[test]
    fn core_must_exist() {
        let config = RuntimeConfig::default();
        assert!(ThreadAttr::new().with_core(config.cpu_count - 1).validate(&config).is_ok());
        assert!(ThreadAttr::new().with_core(config.cpu_count).validate(&config).is_err());
    }

    #[test]
    fn long_name_rejected() {
        assert_eq!(validate_name("fifteen-chars!!"), Ok(()));
        assert_eq!(validate_name("sixteen-chars!!!"), Err(Error::InvalidArgument));
    }

    #[test]
    fn stack_size_falls_back_to_config() {
        let config = RuntimeConfig::default();
        assert_eq!(ThreadAttr::new().effective_stack_size(&config), config.default_stack_size);
        assert_eq!(
            ThreadAttr::new().with_stack_size(1 << 20).effective_stack_size(&config),
            1 << 20
        );
    }
}
