//! Connector tuning, derived from the engine configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tally_core::{BackoffPolicy, EngineConfig};

/// Timeouts and retry policy shared by the Substrate and EVM connectors.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectorConfig {
    /// Bounded wait for any single request, queued time included.
    #[serde(with = "duration_ms")]
    pub request_timeout: Duration,

    /// Timeout for opening one endpoint's socket.
    #[serde(with = "duration_ms")]
    pub connect_timeout: Duration,

    /// Delay between full failed passes over the endpoint list.
    pub backoff: BackoffPolicy,

    /// Full passes before a connection gives up; `None` retries forever.
    pub max_endpoint_cycles: Option<u32>,
}

impl Default for ConnectorConfig {
    fn default() -> Self {
        Self::from(&EngineConfig::default())
    }
}

impl From<&EngineConfig> for ConnectorConfig {
    fn from(config: &EngineConfig) -> Self {
        let request_timeout = config.request_timeout();
        Self {
            request_timeout,
            connect_timeout: request_timeout.min(Duration::from_secs(10)),
            backoff: config.backoff_policy(),
            max_endpoint_cycles: config.max_endpoint_cycles(),
        }
    }
}

// ---------------------------------------------------------------------------
// Serde helpers
// ---------------------------------------------------------------------------

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(dur: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(dur.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let millis = u64::deserialize(d)?;
        Ok(Duration::from_millis(millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derived_from_engine_config() {
        let mut engine = EngineConfig::default();
        engine.request_timeout_secs = 5;
        engine.max_endpoint_cycles = 3;
        let config = ConnectorConfig::from(&engine);
        assert_eq!(config.request_timeout, Duration::from_secs(5));
        assert_eq!(config.connect_timeout, Duration::from_secs(5));
        assert_eq!(config.max_endpoint_cycles, Some(3));
        assert_eq!(config.backoff, engine.backoff_policy());
    }

    #[test]
    fn connect_timeout_is_capped() {
        let config = ConnectorConfig::default();
        assert_eq!(config.request_timeout, Duration::from_secs(30));
        assert_eq!(config.connect_timeout, Duration::from_secs(10));
        assert_eq!(config.max_endpoint_cycles, None);
    }

    #[test]
    fn serializes_durations_as_millis() {
        let config = ConnectorConfig::default();
        let json = serde_json::to_value(&config).unwrap();
        assert_eq!(json["request_timeout"], 30_000);
        let back: ConnectorConfig = serde_json::from_value(json).unwrap();
        assert_eq!(back, config);
    }
}
