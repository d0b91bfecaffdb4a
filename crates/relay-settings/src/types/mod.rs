//! Settings type definitions.
//!
//! All types use `#[serde(rename_all = "camelCase")]` for the JSON file
//! format and `#[serde(default)]` so partial files are accepted.

mod coordination;
mod server;

pub use coordination::*;
pub use server::*;

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::errors::{Result, SettingsError};

/// Root settings type.
///
/// ```json
/// {
///   "orchestrator": { "commandPrefix": "!bot" },
///   "session": { "stepTimeoutMs": 10000, "maxRetries": 0 }
/// }
/// ```
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RelaySettings {
    pub orchestrator: OrchestratorSettings,
    pub registry: RegistrySettings,
    pub session: SessionSettings,
    pub server: ServerSettings,
    pub logging: LoggingSettings,
}

impl RelaySettings {
    /// Reject combinations the coordinator cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.orchestrator.id.trim().is_empty() {
            return Err(SettingsError::InvalidValue("orchestrator.id is empty".into()));
        }
        if self.orchestrator.command_prefix.trim().is_empty() {
            return Err(SettingsError::InvalidValue(
                "orchestrator.commandPrefix is empty".into(),
            ));
        }
        if self.orchestrator.coordination_channel.trim().is_empty() {
            return Err(SettingsError::InvalidValue(
                "orchestrator.coordinationChannel is empty".into(),
            ));
        }
        if self.registry.heartbeat_interval_ms == 0 {
            return Err(SettingsError::InvalidValue(
                "registry.heartbeatIntervalMs must be positive".into(),
            ));
        }
        if self.registry.agent_ttl_ms < self.registry.heartbeat_interval_ms {
            return Err(SettingsError::InvalidValue(format!(
                "registry.agentTtlMs ({}) is shorter than heartbeatIntervalMs ({})",
                self.registry.agent_ttl_ms, self.registry.heartbeat_interval_ms
            )));
        }
        if self.session.step_timeout_ms == 0 {
            return Err(SettingsError::InvalidValue(
                "session.stepTimeoutMs must be positive".into(),
            ));
        }
        if self.session.max_retries > MAX_RETRIES_LIMIT {
            return Err(SettingsError::InvalidValue(format!(
                "session.maxRetries ({}) is above {MAX_RETRIES_LIMIT}",
                self.session.max_retries
            )));
        }
        if !(0.0..=1.0).contains(&self.session.jitter_factor) {
            return Err(SettingsError::InvalidValue(format!(
                "session.jitterFactor ({}) must be between 0 and 1",
                self.session.jitter_factor
            )));
        }
        if self.session.max_backoff_ms < self.session.retry_backoff_ms {
            return Err(SettingsError::InvalidValue(
                "session.maxBackoffMs is below retryBackoffMs".into(),
            ));
        }
        Ok(())
    }

    pub fn step_timeout(&self) -> Duration {
        Duration::from_millis(self.session.step_timeout_ms)
    }

    pub fn agent_ttl(&self) -> Duration {
        Duration::from_millis(self.registry.agent_ttl_ms)
    }

    /// Registry sweep period: half the heartbeat interval.
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis((self.registry.heartbeat_interval_ms / 2).max(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_prefix_is_invalid() {
        let mut s = RelaySettings::default();
        s.orchestrator.command_prefix = "  ".into();
        assert!(matches!(s.validate(), Err(SettingsError::InvalidValue(_))));
    }

    #[test]
    fn ttl_below_heartbeat_is_invalid() {
        let mut s = RelaySettings::default();
        s.registry.heartbeat_interval_ms = 60_000;
        s.registry.agent_ttl_ms = 30_000;
        let err = s.validate().unwrap_err();
        assert!(err.to_string().contains("agentTtlMs"));
    }

    #[test]
    fn zero_step_timeout_is_invalid() {
        let mut s = RelaySettings::default();
        s.session.step_timeout_ms = 0;
        assert!(s.validate().is_err());
    }

    #[test]
    fn retry_budget_is_bounded() {
        let mut s = RelaySettings::default();
        s.session.max_retries = MAX_RETRIES_LIMIT;
        assert!(s.validate().is_ok());

        s.session.max_retries = MAX_RETRIES_LIMIT + 1;
        let err = s.validate().unwrap_err();
        assert!(err.to_string().contains("maxRetries"));
    }

    #[test]
    fn jitter_must_be_a_fraction() {
        let mut s = RelaySettings::default();
        for ok in [0.0, 0.5, 1.0] {
            s.session.jitter_factor = ok;
            assert!(s.validate().is_ok(), "{ok}");
        }
        for bad in [-0.1, 1.5, f64::NAN] {
            s.session.jitter_factor = bad;
            let err = s.validate().unwrap_err();
            assert!(err.to_string().contains("jitterFactor"), "{bad}");
        }
    }

    #[test]
    fn sweep_runs_at_half_heartbeat() {
        let mut s = RelaySettings::default();
        s.registry.heartbeat_interval_ms = 10_000;
        assert_eq!(s.sweep_interval(), Duration::from_secs(5));
    }

    #[test]
    fn serializes_camel_case() {
        let json = serde_json::to_value(RelaySettings::default()).unwrap();
        assert!(json["orchestrator"]["commandPrefix"].is_string());
        assert!(json["session"]["stepTimeoutMs"].is_number());
        assert!(json["registry"]["agentTtlMs"].is_number());
    }
}
