//! Scheduler construction configuration.

use crate::pool::PoolAccess;
use rustc_hash::FxHashMap;

/// How many work units a predefined scheduler runs between event checks.
pub const DEFAULT_EVENT_FREQ: u32 = 50;

/// Configuration consumed during scheduler construction.
///
/// `access` and `automatic` drive the pools a predefined scheduler builds
/// for itself; `event_freq` tunes how often the built-in loops poll for
/// stop requests. User-defined policies may stash additional numeric
/// parameters in the params map and read them back from their `init` hook.
#[derive(Debug, Clone)]
pub struct SchedConfig {
    access: PoolAccess,
    automatic: bool,
    event_freq: u32,
    params: FxHashMap<String, u64>,
}

impl Default for SchedConfig {
    fn default() -> Self {
        Self {
            access: PoolAccess::default(),
            automatic: true,
            event_freq: DEFAULT_EVENT_FREQ,
            params: FxHashMap::default(),
        }
    }
}

impl SchedConfig {
    /// Create a configuration with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Access mode for pools constructed on the scheduler's behalf.
    pub fn access(&self) -> PoolAccess {
        self.access
    }

    /// Whether the constructed scheduler frees itself after running as a
    /// work unit.
    pub fn automatic(&self) -> bool {
        self.automatic
    }

    /// Units executed between event checks in the built-in loops.
    pub fn event_freq(&self) -> u32 {
        self.event_freq
    }

    /// Set the access mode for constructed pools.
    pub fn with_access(mut self, access: PoolAccess) -> Self {
        self.access = access;
        self
    }

    /// Set the automatic flag for the constructed scheduler.
    pub fn with_automatic(mut self, automatic: bool) -> Self {
        self.automatic = automatic;
        self
    }

    /// Set the event-check frequency.
    pub fn with_event_freq(mut self, event_freq: u32) -> Self {
        self.event_freq = event_freq.max(1);
        self
    }

    /// Store a free-form numeric parameter for a user-defined policy.
    pub fn set_param(&mut self, key: impl Into<String>, value: u64) {
        self.params.insert(key.into(), value);
    }

    /// Read back a free-form parameter.
    pub fn param(&self, key: &str) -> Option<u64> {
        self.params.get(key).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = SchedConfig::default();
        assert_eq!(config.access(), PoolAccess::PrSw);
        assert!(config.automatic());
        assert_eq!(config.event_freq(), DEFAULT_EVENT_FREQ);
    }

    #[test]
    fn test_builders() {
        let config = SchedConfig::new()
            .with_access(PoolAccess::SrSw)
            .with_automatic(false)
            .with_event_freq(0);
        assert_eq!(config.access(), PoolAccess::SrSw);
        assert!(!config.automatic());
        // frequency is clamped to at least one
        assert_eq!(config.event_freq(), 1);
    }

    #[test]
    fn test_params() {
        let mut config = SchedConfig::new();
        config.set_param("queue_depth", 128);
        assert_eq!(config.param("queue_depth"), Some(128));
        assert_eq!(config.param("missing"), None);
    }
}
