use anyhow::Result;
use serde::Deserialize;

/// Controller-wide tunables loaded from a TOML file or defaults.
#[derive(Debug, Clone, Deserialize)]
pub struct ControllerConfig {
    /// Whether IPv4 address resolution is attempted alongside IPv6.
    #[serde(default = "default_ipv4_enabled")]
    pub ipv4_enabled: bool,

    /// Initial reconnect backoff, in seconds (spec: 15s).
    #[serde(default = "default_reconnect_floor_secs")]
    pub reconnect_floor_secs: u64,

    /// Reconnect backoff ceiling, in seconds (spec: 10min).
    #[serde(default = "default_reconnect_ceiling_secs")]
    pub reconnect_ceiling_secs: u64,

    /// Delay before reconnecting after an explicit `shutDown` event (spec: 30s).
    #[serde(default = "default_shutdown_reconnect_secs")]
    pub shutdown_reconnect_secs: u64,

    /// Delay before reconnecting after a new inbound session while
    /// `WaitingForDeviceDiscovery` (spec: 5s).
    #[serde(default = "default_rediscovery_reconnect_secs")]
    pub rediscovery_reconnect_secs: u64,

    /// Structure-change debounce window, in seconds (spec: 5s).
    #[serde(default = "default_structure_debounce_secs")]
    pub structure_debounce_secs: u64,

    /// Default subscription min-interval floor for non-ICD devices (spec: 1s).
    #[serde(default = "default_subscription_floor_secs")]
    pub subscription_floor_secs: u64,

    /// mDNS query backoff: initial interval, in milliseconds (spec: 1500ms).
    #[serde(default = "default_query_backoff_initial_ms")]
    pub query_backoff_initial_ms: u64,

    /// mDNS query backoff cap, in milliseconds (spec: 1 hour).
    #[serde(default = "default_query_backoff_cap_ms")]
    pub query_backoff_cap_ms: u64,

    /// Record cache expiry sweep interval, in seconds (spec: every minute).
    #[serde(default = "default_cache_sweep_secs")]
    pub cache_sweep_secs: u64,

    /// TTL grace-period multiplier applied before treating a record as expired
    /// (spec: 1.05).
    #[serde(default = "default_ttl_grace_factor")]
    pub ttl_grace_factor: f64,
}

fn default_ipv4_enabled() -> bool {
    true
}
fn default_reconnect_floor_secs() -> u64 {
    15
}
fn default_reconnect_ceiling_secs() -> u64 {
    600
}
fn default_shutdown_reconnect_secs() -> u64 {
    30
}
fn default_rediscovery_reconnect_secs() -> u64 {
    5
}
fn default_structure_debounce_secs() -> u64 {
    5
}
fn default_subscription_floor_secs() -> u64 {
    1
}
fn default_query_backoff_initial_ms() -> u64 {
    1500
}
fn default_query_backoff_cap_ms() -> u64 {
    3_600_000
}
fn default_cache_sweep_secs() -> u64 {
    60
}
fn default_ttl_grace_factor() -> f64 {
    1.05
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            ipv4_enabled: default_ipv4_enabled(),
            reconnect_floor_secs: default_reconnect_floor_secs(),
            reconnect_ceiling_secs: default_reconnect_ceiling_secs(),
            shutdown_reconnect_secs: default_shutdown_reconnect_secs(),
            rediscovery_reconnect_secs: default_rediscovery_reconnect_secs(),
            structure_debounce_secs: default_structure_debounce_secs(),
            subscription_floor_secs: default_subscription_floor_secs(),
            query_backoff_initial_ms: default_query_backoff_initial_ms(),
            query_backoff_cap_ms: default_query_backoff_cap_ms(),
            cache_sweep_secs: default_cache_sweep_secs(),
            ttl_grace_factor: default_ttl_grace_factor(),
        }
    }
}

impl ControllerConfig {
    /// Load configuration from a TOML file, falling back to defaults for any
    /// field the file omits.
    pub fn from_file(path: &str) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: ControllerConfig = toml::de::from_str(&contents)?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec_constants() {
        let cfg = ControllerConfig::default();
        assert_eq!(cfg.reconnect_floor_secs, 15);
        assert_eq!(cfg.reconnect_ceiling_secs, 600);
        assert_eq!(cfg.shutdown_reconnect_secs, 30);
        assert_eq!(cfg.structure_debounce_secs, 5);
        assert_eq!(cfg.query_backoff_initial_ms, 1500);
        assert_eq!(cfg.query_backoff_cap_ms, 3_600_000);
    }

    #[test]
    fn partial_toml_falls_back_to_defaults() {
        let toml = "ipv4_enabled = false\n";
        let cfg: ControllerConfig = toml::de::from_str(toml).unwrap();
        assert!(!cfg.ipv4_enabled);
        assert_eq!(cfg.reconnect_floor_secs, 15);
    }
}
