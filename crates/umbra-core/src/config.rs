//! Process-wide configuration
//!
//! Loaded once at startup from `UMBRA_*` environment variables; never
//! reloaded. Tenants override the documented subset through
//! `Organization.settings`.

use anyhow::Result;
use std::env;

/// Discovery engine options
#[derive(Debug, Clone)]
pub struct DiscoveryConfig {
    pub default_frequency_hours: u32,
    pub max_concurrent_runs_per_org: u32,
    /// Capacity of the engine's event channel; reads pause past this mark
    pub channel_capacity: usize,
    /// Hours an unseen automation survives before soft-expiry
    pub grace_window_hours: i64,
}

/// Static detector defaults; per-org thresholds start from these
#[derive(Debug, Clone)]
pub struct DetectorConfig {
    pub velocity_z_score: f64,
    pub batch_min_size: u32,
    pub timing_variance_max_cv: f64,
    pub data_volume_factor: f64,
    /// Minimum baseline confidence before off-hours detection engages
    pub off_hours_min_confidence: f64,
}

/// Baseline learning options
#[derive(Debug, Clone)]
pub struct BaselineConfig {
    pub min_sample_size: u64,
    pub adaptation_rate: f64,
}

/// Real-time hub options
#[derive(Debug, Clone)]
pub struct RealtimeConfig {
    pub idle_timeout_sec: u64,
    pub heartbeat_interval_sec: u64,
    /// Per-session outbound queue depth
    pub channel_capacity: usize,
}

/// Qualitative validator (external LLM endpoint) options
#[derive(Debug, Clone)]
pub struct ValidatorConfig {
    pub enabled: bool,
    pub endpoint: Option<String>,
    pub max_cost_usd_per_run: f64,
    pub max_concurrency: usize,
    pub request_timeout_sec: u64,
}

/// HTTP server options
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind_addr: String,
    pub jwt_secret: String,
    pub jwt_audience: String,
}

/// Relational store options; absent URL selects the in-memory backend
#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub url: Option<String>,
    pub max_connections: u32,
}

/// Credential vault options
#[derive(Debug, Clone)]
pub struct VaultConfig {
    /// Base64 root key the per-organization master keys derive from
    pub master_key_b64: String,
    pub key_version: u32,
}

/// OAuth client settings for one platform
#[derive(Debug, Clone, Default)]
pub struct OAuthClientConfig {
    pub client_id: String,
    pub client_secret: String,
    pub redirect_uri: String,
}

/// Immutable configuration snapshot
#[derive(Debug, Clone)]
pub struct UmbraConfig {
    pub discovery: DiscoveryConfig,
    pub detector: DetectorConfig,
    pub baseline: BaselineConfig,
    pub realtime: RealtimeConfig,
    pub validator: ValidatorConfig,
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub vault: VaultConfig,
    pub oauth_slack: OAuthClientConfig,
    pub oauth_google: OAuthClientConfig,
    pub oauth_microsoft: OAuthClientConfig,
    pub oauth_ai: OAuthClientConfig,
}

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn env_string(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn oauth_client(prefix: &str) -> OAuthClientConfig {
    OAuthClientConfig {
        client_id: env_string(&format!("{prefix}_CLIENT_ID"), ""),
        client_secret: env_string(&format!("{prefix}_CLIENT_SECRET"), ""),
        redirect_uri: env_string(&format!("{prefix}_REDIRECT_URI"), ""),
    }
}

impl UmbraConfig {
    /// Build the snapshot from the process environment
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            discovery: DiscoveryConfig {
                default_frequency_hours: env_or("UMBRA_DISCOVERY_FREQUENCY_HOURS", 24),
                max_concurrent_runs_per_org: env_or("UMBRA_DISCOVERY_MAX_CONCURRENT_RUNS", 4),
                channel_capacity: env_or("UMBRA_DISCOVERY_CHANNEL_CAPACITY", 256),
                grace_window_hours: env_or("UMBRA_DISCOVERY_GRACE_WINDOW_HOURS", 72),
            },
            detector: DetectorConfig {
                velocity_z_score: env_or("UMBRA_DETECTOR_VELOCITY_ZSCORE", 3.0),
                batch_min_size: env_or("UMBRA_DETECTOR_BATCH_MIN_SIZE", 5),
                timing_variance_max_cv: env_or("UMBRA_DETECTOR_TIMING_MAX_CV", 0.05),
                data_volume_factor: env_or("UMBRA_DETECTOR_DATA_VOLUME_FACTOR", 3.0),
                off_hours_min_confidence: env_or("UMBRA_DETECTOR_OFF_HOURS_MIN_CONFIDENCE", 0.7),
            },
            baseline: BaselineConfig {
                min_sample_size: env_or("UMBRA_BASELINE_MIN_SAMPLE_SIZE", 50),
                adaptation_rate: env_or("UMBRA_BASELINE_ADAPTATION_RATE", 0.2),
            },
            realtime: RealtimeConfig {
                idle_timeout_sec: env_or("UMBRA_REALTIME_IDLE_TIMEOUT_SEC", 120),
                heartbeat_interval_sec: env_or("UMBRA_REALTIME_HEARTBEAT_SEC", 30),
                channel_capacity: env_or("UMBRA_REALTIME_CHANNEL_CAPACITY", 64),
            },
            validator: ValidatorConfig {
                enabled: env_or("UMBRA_VALIDATOR_ENABLED", false),
                endpoint: env::var("UMBRA_VALIDATOR_ENDPOINT").ok(),
                max_cost_usd_per_run: env_or("UMBRA_VALIDATOR_MAX_COST_USD", 0.50),
                max_concurrency: env_or("UMBRA_VALIDATOR_MAX_CONCURRENCY", 2),
                request_timeout_sec: env_or("UMBRA_VALIDATOR_TIMEOUT_SEC", 10),
            },
            server: ServerConfig {
                bind_addr: env_string("UMBRA_BIND_ADDR", "0.0.0.0:8600"),
                jwt_secret: env_string("UMBRA_JWT_SECRET", "umbra-dev-secret"),
                jwt_audience: env_string("UMBRA_JWT_AUDIENCE", "umbra"),
            },
            database: DatabaseConfig {
                url: env::var("UMBRA_DATABASE_URL").ok(),
                max_connections: env_or("UMBRA_DATABASE_MAX_CONNECTIONS", 10),
            },
            vault: VaultConfig {
                master_key_b64: env_string("UMBRA_VAULT_MASTER_KEY", ""),
                key_version: env_or("UMBRA_VAULT_KEY_VERSION", 1),
            },
            oauth_slack: oauth_client("UMBRA_SLACK"),
            oauth_google: oauth_client("UMBRA_GOOGLE"),
            oauth_microsoft: oauth_client("UMBRA_MICROSOFT"),
            oauth_ai: oauth_client("UMBRA_AI"),
        })
    }

    /// Pre-expiry refresh lead time
    pub fn refresh_lead_secs(&self) -> i64 {
        300
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let cfg = UmbraConfig::from_env().unwrap();
        assert_eq!(cfg.discovery.default_frequency_hours, 24);
        assert_eq!(cfg.discovery.max_concurrent_runs_per_org, 4);
        assert_eq!(cfg.detector.velocity_z_score, 3.0);
        assert_eq!(cfg.detector.batch_min_size, 5);
        assert_eq!(cfg.detector.timing_variance_max_cv, 0.05);
        assert_eq!(cfg.baseline.min_sample_size, 50);
        assert_eq!(cfg.baseline.adaptation_rate, 0.2);
        assert_eq!(cfg.realtime.idle_timeout_sec, 120);
    }
}
