//! Runtime configuration.
//!
//! A [`RuntimeConfig`] is fixed when a [`Runtime`](crate::Runtime) is built.
//! [`RuntimeConfig::from_env`] reads overrides from the environment:
//! - `RTPTHREAD_LOCK_TIMEOUT_MS`: diagnostic bound for plain `lock`/`wait`.
//!   `0`, `off` or `forever` disable it (wait forever).
//! - `RTPTHREAD_MAX_HANDLES`: per-registry handle limit.
//! - `RTPTHREAD_CPUS`: number of cores a thread may be pinned to.
//! - `RTPTHREAD_STACK_SIZE`: default thread stack size in bytes.
//!
//! Unparseable values fall back to the defaults.

use std::time::Duration;

use crate::pthread::attr::PTHREAD_STACK_MIN;

/// Default diagnostic bound on plain `lock`/`wait`. Expiry returns
/// `Timeout` and logs a warning.
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(120);

/// Default per-registry handle limit.
pub const DEFAULT_MAX_HANDLES: usize = 4096;

/// Scheduler priority levels (`configMAX_PRIORITIES` on the target).
pub const DEFAULT_MAX_PRIORITY: u8 = 25;

/// Number of cores on the reference target.
pub const DEFAULT_CPU_COUNT: usize = 2;

/// Default thread stack size in bytes.
pub const DEFAULT_STACK_SIZE: usize = 256 * 1024;

const ENV_LOCK_TIMEOUT: &str = "RTPTHREAD_LOCK_TIMEOUT_MS";
const ENV_MAX_HANDLES: &str = "RTPTHREAD_MAX_HANDLES";
const ENV_CPUS: &str = "RTPTHREAD_CPUS";
const ENV_STACK_SIZE: &str = "RTPTHREAD_STACK_SIZE";

/// Tunables for one runtime instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeConfig {
    /// Bound applied to plain `lock`, `wait` and lock re-acquisition after a
    /// wait. `None` waits forever.
    pub lock_timeout: Option<Duration>,
    /// Maximum live handles per registry.
    pub max_handles: usize,
    /// Exclusive upper bound of thread priorities; valid priorities are
    /// `1..max_priority`.
    pub max_priority: u8,
    /// Cores available for affinity pinning.
    pub cpu_count: usize,
    /// Stack size used when a [`ThreadAttr`](crate::ThreadAttr) leaves it unset.
    pub default_stack_size: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            lock_timeout: Some(DEFAULT_LOCK_TIMEOUT),
            max_handles: DEFAULT_MAX_HANDLES,
            max_priority: DEFAULT_MAX_PRIORITY,
            cpu_count: DEFAULT_CPU_COUNT,
            default_stack_size: DEFAULT_STACK_SIZE,
        }
    }
}

impl RuntimeConfig {
    /// Defaults overridden by `RTPTHREAD_*` environment variables.
    #[must_use]
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Defaults overridden by whatever `lookup` returns for each variable name.
    #[must_use]
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();
        if let Some(raw) = lookup(ENV_LOCK_TIMEOUT) {
            if let Some(timeout) = parse_lock_timeout(&raw) {
                config.lock_timeout = timeout;
            }
        }
        if let Some(max) = lookup(ENV_MAX_HANDLES).and_then(|raw| parse_positive(&raw)) {
            config.max_handles = max;
        }
        if let Some(cpus) = lookup(ENV_CPUS).and_then(|raw| parse_positive(&raw)) {
            config.cpu_count = cpus;
        }
        if let Some(stack) = lookup(ENV_STACK_SIZE).and_then(|raw| parse_positive(&raw)) {
            config.default_stack_size = stack.max(PTHREAD_STACK_MIN);
        }
        config
    }

    /// Replace the diagnostic lock timeout.
    #[must_use]
    pub fn with_lock_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.lock_timeout = timeout;
        self
    }

    /// Replace the per-registry handle limit.
    #[must_use]
    pub fn with_max_handles(mut self, max_handles: usize) -> Self {
        self.max_handles = max_handles;
        self
    }
}

/// Parse a lock timeout in milliseconds.
///
/// Returns `Some(None)` for "wait forever", `Some(Some(d))` for a bound and
/// `None` when the value is not understood.
fn parse_lock_timeout(raw: &str) -> Option<Option<Duration>> {
    let raw = raw.trim();
    match raw.to_ascii_lowercase().as_str() {
        "off" | "forever" | "none" | "0" => Some(None),
        other => other
            .parse::<u64>()
            .ok()
            .map(|ms| Some(Duration::from_millis(ms))),
    }
}

fn parse_positive(raw: &str) -> Option<usize> {
    raw.trim().parse::<usize>().ok().filter(|v| *v > 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn parse_lock_timeouts() {
        assert_eq!(parse_lock_timeout("250"), Some(Some(Duration::from_millis(250))));
        assert_eq!(parse_lock_timeout(" 10 "), Some(Some(Duration::from_millis(10))));
        assert_eq!(parse_lock_timeout("0"), Some(None));
        assert_eq!(parse_lock_timeout("OFF"), Some(None));
        assert_eq!(parse_lock_timeout("forever"), Some(None));
        assert_eq!(parse_lock_timeout("soon"), None);
        assert_eq!(parse_lock_timeout("-5"), None);
    }

    #[test]
    fn default_timeout_is_finite() {
        let config = RuntimeConfig::default();
        assert_eq!(config.lock_timeout, Some(DEFAULT_LOCK_TIMEOUT));
        assert_eq!(config.max_handles, DEFAULT_MAX_HANDLES);
    }

    #[test]
    fn lookup_overrides_defaults() {
        let config = RuntimeConfig::from_lookup(lookup_from(&[
            (ENV_LOCK_TIMEOUT, "1500"),
            (ENV_MAX_HANDLES, "64"),
            (ENV_CPUS, "4"),
            (ENV_STACK_SIZE, "1024"),
        ]));
        assert_eq!(config.lock_timeout, Some(Duration::from_millis(1500)));
        assert_eq!(config.max_handles, 64);
        assert_eq!(config.cpu_count, 4);
        // clamped up to the minimum stack
        assert_eq!(config.default_stack_size, PTHREAD_STACK_MIN);
    }

    #[test]
    fn bogus_values_fall_back() {
        let config = RuntimeConfig::from_lookup(lookup_from(&[
            (ENV_LOCK_TIMEOUT, "later"),
            (ENV_MAX_HANDLES, "0"),
            (ENV_CPUS, "many"),
        ]));
        assert_eq!(config, RuntimeConfig::default());
    }

    #[test]
    fn lock_timeout_can_be_disabled() {
        let config = RuntimeConfig::from_lookup(lookup_from(&[(ENV_LOCK_TIMEOUT, "off")]));
        assert_eq!(config.lock_timeout, None);
    }
}
