//! Engine configuration
//!
//! Every knob has a default so an empty TOML document (or no file at all)
//! yields a working configuration. Durations are stored as milliseconds.
//!
//! ```toml
//! [connection]
//! keepalive_interval_ms = 10000
//! failure_threshold = 3
//!
//! [arbitration.weights]
//! single_peer = 0.25
//! ```

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{MeshError, MeshResult};
use crate::types::ForcedRole;

/// Top-level configuration for a mesh node
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MeshConfig {
    /// Device id; generated at startup when absent
    pub device_id: Option<String>,
    /// Display name announced in handshakes
    pub device_name: Option<String>,
    pub discovery: DiscoveryConfig,
    pub connection: ConnectionConfig,
    pub arbitration: ArbitrationConfig,
    pub messaging: MessagingConfig,
    pub sync: SyncConfig,
}

/// Peer discovery settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DiscoveryConfig {
    /// Minimum gap between unforced scans
    pub cooldown_ms: u64,
    /// Hard timeout for one discovery cycle
    pub timeout_ms: u64,
    /// Interval of the background discovery sweep
    pub sweep_interval_ms: u64,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            cooldown_ms: 5_000,
            timeout_ms: 20_000,
            sweep_interval_ms: 60_000,
        }
    }
}

impl DiscoveryConfig {
    pub fn cooldown(&self) -> Duration {
        Duration::from_millis(self.cooldown_ms)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }
}

/// Connection supervision settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ConnectionConfig {
    /// Interval between keep-alive pings
    pub keepalive_interval_ms: u64,
    /// How long a ping may wait for its pong
    pub ping_timeout_ms: u64,
    /// Consecutive failures that tear the connection down
    pub failure_threshold: u32,
    /// Outstanding pings that mark the socket suspect-dead
    pub ping_backlog_limit: usize,
    /// Base interval between recovery attempts while idle
    pub retry_interval_ms: u64,
    /// Start in emergency mode (escalating recovery)
    pub emergency: bool,
    /// Operator-forced role, if any
    pub forced_role: Option<ForcedRole>,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            keepalive_interval_ms: 10_000,
            ping_timeout_ms: 10_000,
            failure_threshold: 3,
            ping_backlog_limit: 3,
            retry_interval_ms: 15_000,
            emergency: false,
            forced_role: None,
        }
    }
}

impl ConnectionConfig {
    pub fn keepalive_interval(&self) -> Duration {
        Duration::from_millis(self.keepalive_interval_ms)
    }

    pub fn ping_timeout(&self) -> Duration {
        Duration::from_millis(self.ping_timeout_ms)
    }

    pub fn retry_interval(&self) -> Duration {
        Duration::from_millis(self.retry_interval_ms)
    }
}

/// Host/client arbitration settings
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ArbitrationConfig {
    /// Seed for the arbitration RNG; random when absent
    pub seed: Option<u64>,
    /// Probability of choosing Host, by pool size
    pub weights: HostWeights,
}

/// Probability of becoming Host given the number of available peers
///
/// These are tuning values. Larger pools make hosting less likely so relay
/// duty spreads across the few devices that already host.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct HostWeights {
    /// Exactly one available peer
    pub single_peer: f64,
    /// Two up to `small_pool_max` available peers
    pub small_pool: f64,
    /// More than `small_pool_max` available peers
    pub large_pool: f64,
    /// Upper bound of a "small" pool
    pub small_pool_max: usize,
}

impl Default for HostWeights {
    fn default() -> Self {
        Self {
            single_peer: 0.25,
            small_pool: 0.15,
            large_pool: 0.10,
            small_pool_max: 3,
        }
    }
}

impl HostWeights {
    /// Host probability for a pool of `available` peers (`available >= 1`)
    pub fn host_probability(&self, available: usize) -> f64 {
        match available {
            0 => 1.0,
            1 => self.single_peer,
            n if n <= self.small_pool_max => self.small_pool,
            _ => self.large_pool,
        }
    }
}

/// Message engine settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MessagingConfig {
    /// Hop budget stamped on new envelopes
    pub default_ttl: u8,
    /// Upper clamp for caller-supplied TTLs
    pub max_ttl: u8,
    /// How long a processed id suppresses duplicates
    pub processed_expiry_ms: u64,
    /// Interval of the processed-id sweep
    pub processed_sweep_interval_ms: u64,
    /// Maximum age of a queued envelope
    pub queue_max_age_ms: u64,
    /// Failed transmissions before a queued envelope is dropped
    pub queue_retry_ceiling: u32,
    /// Interval of the store-and-forward sweep
    pub queue_flush_interval_ms: u64,
    /// Time to wait for an ack before the first retry
    pub ack_timeout_ms: u64,
    /// Retries before a message is marked failed
    pub ack_max_retries: u32,
    /// Cap on the exponential retry backoff
    pub ack_backoff_cap_ms: u64,
    /// Interval of the ack timeout check
    pub ack_check_interval_ms: u64,
}

impl Default for MessagingConfig {
    fn default() -> Self {
        Self {
            default_ttl: 5,
            max_ttl: 8,
            processed_expiry_ms: 24 * 60 * 60 * 1000,
            processed_sweep_interval_ms: 10 * 60 * 1000,
            queue_max_age_ms: 24 * 60 * 60 * 1000,
            queue_retry_ceiling: 5,
            queue_flush_interval_ms: 30_000,
            ack_timeout_ms: 30_000,
            ack_max_retries: 3,
            ack_backoff_cap_ms: 60_000,
            ack_check_interval_ms: 5_000,
        }
    }
}

impl MessagingConfig {
    pub fn processed_expiry(&self) -> Duration {
        Duration::from_millis(self.processed_expiry_ms)
    }

    pub fn processed_sweep_interval(&self) -> Duration {
        Duration::from_millis(self.processed_sweep_interval_ms)
    }

    pub fn queue_max_age(&self) -> Duration {
        Duration::from_millis(self.queue_max_age_ms)
    }

    pub fn queue_flush_interval(&self) -> Duration {
        Duration::from_millis(self.queue_flush_interval_ms)
    }

    pub fn ack_timeout(&self) -> Duration {
        Duration::from_millis(self.ack_timeout_ms)
    }

    pub fn ack_backoff_cap(&self) -> Duration {
        Duration::from_millis(self.ack_backoff_cap_ms)
    }

    pub fn ack_check_interval(&self) -> Duration {
        Duration::from_millis(self.ack_check_interval_ms)
    }
}

/// Cloud sync settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SyncConfig {
    /// Interval of the opportunistic sync timer
    pub interval_ms: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self { interval_ms: 30_000 }
    }
}

impl SyncConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

impl MeshConfig {
    /// Parse a configuration from TOML text
    pub fn from_toml_str(s: &str) -> MeshResult<Self> {
        let config: MeshConfig =
            toml::from_str(s).map_err(|e| MeshError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a file; a missing file yields defaults
    pub fn load(path: impl AsRef<Path>) -> MeshResult<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Ok(Self::default());
        }
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    /// Render the configuration back to TOML
    pub fn to_toml_string(&self) -> MeshResult<String> {
        toml::to_string_pretty(self).map_err(|e| MeshError::Config(e.to_string()))
    }

    /// Reject values the engine cannot operate with
    pub fn validate(&self) -> MeshResult<()> {
        let m = &self.messaging;
        if m.default_ttl == 0 {
            return Err(MeshError::Config("messaging.default_ttl must be > 0".into()));
        }
        if m.max_ttl < m.default_ttl {
            return Err(MeshError::Config(
                "messaging.max_ttl must be >= messaging.default_ttl".into(),
            ));
        }
        if self.connection.failure_threshold == 0 {
            return Err(MeshError::Config(
                "connection.failure_threshold must be > 0".into(),
            ));
        }
        if self.connection.ping_backlog_limit == 0 {
            return Err(MeshError::Config(
                "connection.ping_backlog_limit must be > 0".into(),
            ));
        }
        let w = &self.arbitration.weights;
        for (name, p) in [
            ("single_peer", w.single_peer),
            ("small_pool", w.small_pool),
            ("large_pool", w.large_pool),
        ] {
            if !(0.0..=1.0).contains(&p) {
                return Err(MeshError::Config(format!(
                    "arbitration.weights.{} must be within [0, 1]",
                    name
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_toml_gives_defaults() {
        let config = MeshConfig::from_toml_str("").unwrap();
        assert_eq!(config, MeshConfig::default());
        assert_eq!(config.messaging.default_ttl, 5);
        assert_eq!(config.connection.failure_threshold, 3);
        assert_eq!(config.discovery.cooldown(), Duration::from_secs(5));
    }

    #[test]
    fn test_partial_override() {
        let config = MeshConfig::from_toml_str(
            r#"
            device_name = "Rescue 1"

            [connection]
            emergency = true
            forced_role = "host"

            [arbitration.weights]
            single_peer = 0.5
            "#,
        )
        .unwrap();
        assert_eq!(config.device_name.as_deref(), Some("Rescue 1"));
        assert!(config.connection.emergency);
        assert_eq!(config.connection.forced_role, Some(ForcedRole::Host));
        assert_eq!(config.arbitration.weights.single_peer, 0.5);
        assert_eq!(config.arbitration.weights.small_pool, 0.15);
        assert_eq!(config.connection.keepalive_interval_ms, 10_000);
    }

    #[test]
    fn test_unknown_key_rejected() {
        let err = MeshConfig::from_toml_str("[connection]\nbogus = 1\n").unwrap_err();
        assert!(matches!(err, MeshError::Config(_)));
    }

    #[test]
    fn test_invalid_probability_rejected() {
        let err = MeshConfig::from_toml_str("[arbitration.weights]\nlarge_pool = 1.5\n")
            .unwrap_err();
        assert!(err.to_string().contains("large_pool"));
    }

    #[test]
    fn test_zero_ttl_rejected() {
        assert!(MeshConfig::from_toml_str("[messaging]\ndefault_ttl = 0\n").is_err());
    }

    #[test]
    fn test_host_probability_shrinks_with_pool() {
        let w = HostWeights::default();
        assert_eq!(w.host_probability(0), 1.0);
        assert!(w.host_probability(1) > w.host_probability(2));
        assert!(w.host_probability(3) > w.host_probability(10));
    }

    #[test]
    fn test_missing_file_gives_defaults() {
        let config = MeshConfig::load("/definitely/not/here/meshlink.toml").unwrap();
        assert_eq!(config, MeshConfig::default());
    }

    #[test]
    fn test_toml_roundtrip() {
        let mut config = MeshConfig::default();
        config.device_id = Some("alpha".into());
        config.connection.forced_role = Some(ForcedRole::Client);
        let text = config.to_toml_string().unwrap();
        assert_eq!(MeshConfig::from_toml_str(&text).unwrap(), config);
    }
}
