//! Engine configuration

use serde::{Deserialize, Serialize};

/// Where scheduler work runs after a start, signal or retry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DispatchMode {
    /// Drive the instance in the caller's task until it yields or waits
    #[default]
    Inline,
    /// Push the instance id onto the work queue for the worker pool
    Queued,
}

impl std::str::FromStr for DispatchMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "inline" => Ok(Self::Inline),
            "queued" => Ok(Self::Queued),
            other => Err(format!("unknown dispatch mode: {}", other)),
        }
    }
}

/// Scheduler limits and dispatch behavior
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Node executions per scheduler call before yielding back to the queue
    pub max_steps_per_slice: u32,
    /// Total node executions before an instance faults as a runaway loop
    pub max_steps_per_instance: u64,
    /// Immediate step retries on a concurrency conflict
    pub conflict_retry_limit: u32,
    pub dispatch: DispatchMode,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_steps_per_slice: 50,
            max_steps_per_instance: 10_000,
            conflict_retry_limit: 5,
            dispatch: DispatchMode::Inline,
        }
    }
}

impl EngineConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create configuration from environment variables
    ///
    /// Missing or unparsable values fall back to the defaults.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            max_steps_per_slice: env_or("CLINICFLOW_MAX_STEPS_PER_SLICE", defaults.max_steps_per_slice),
            max_steps_per_instance: env_or(
                "CLINICFLOW_MAX_STEPS_PER_INSTANCE",
                defaults.max_steps_per_instance,
            ),
            conflict_retry_limit: env_or(
                "CLINICFLOW_CONFLICT_RETRY_LIMIT",
                defaults.conflict_retry_limit,
            ),
            dispatch: env_or("CLINICFLOW_DISPATCH", defaults.dispatch),
        }
    }

    pub fn with_max_steps_per_slice(mut self, steps: u32) -> Self {
        self.max_steps_per_slice = steps.max(1);
        self
    }

    pub fn with_max_steps_per_instance(mut self, steps: u64) -> Self {
        self.max_steps_per_instance = steps;
        self
    }

    pub fn with_conflict_retry_limit(mut self, limit: u32) -> Self {
        self.conflict_retry_limit = limit;
        self
    }

    pub fn with_dispatch(mut self, dispatch: DispatchMode) -> Self {
        self.dispatch = dispatch;
        self
    }
}

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|s| s.trim().parse().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.max_steps_per_slice, 50);
        assert_eq!(config.max_steps_per_instance, 10_000);
        assert_eq!(config.conflict_retry_limit, 5);
        assert_eq!(config.dispatch, DispatchMode::Inline);
    }

    #[test]
    fn test_builder() {
        let config = EngineConfig::new()
            .with_max_steps_per_slice(0)
            .with_max_steps_per_instance(20)
            .with_dispatch(DispatchMode::Queued);
        assert_eq!(config.max_steps_per_slice, 1);
        assert_eq!(config.max_steps_per_instance, 20);
        assert_eq!(config.dispatch, DispatchMode::Queued);
    }

    #[test]
    fn test_partial_deserialize_uses_defaults() {
        let config: EngineConfig =
            serde_json::from_value(serde_json::json!({"dispatch": "queued"})).unwrap();
        assert_eq!(config.dispatch, DispatchMode::Queued);
        assert_eq!(config.max_steps_per_slice, 50);
    }

    #[test]
    fn test_dispatch_mode_parse() {
        assert_eq!("Queued".parse::<DispatchMode>().unwrap(), DispatchMode::Queued);
        assert!("later".parse::<DispatchMode>().is_err());
    }
}
