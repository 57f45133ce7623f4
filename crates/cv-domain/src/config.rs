//! Top-level configuration, validated once at startup. `Config` is built
//! once and handed down explicitly rather than read from global state,
//! except for the token env vars named here.

use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub bus: BusConfig,
    #[serde(default)]
    pub turn: TurnConfig,
    #[serde(default)]
    pub bridge: BridgeConfig,
    #[serde(default)]
    pub admin: AdminConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            store: StoreConfig::default(),
            bus: BusConfig::default(),
            turn: TurnConfig::default(),
            bridge: BridgeConfig::default(),
            admin: AdminConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "d_host")]
    pub host: String,
    #[serde(default = "d_port")]
    pub port: u16,
    /// Env var holding the bearer token guarding `/api/*`. Unset = dev mode.
    #[serde(default = "d_api_token_env")]
    pub api_token_env: String,
    /// Public base URL this server is reachable at, used to populate
    /// `url` in generated agent-card documents.
    #[serde(default = "d_public_base_url")]
    pub public_base_url: String,
}

fn d_host() -> String {
    "127.0.0.1".into()
}
fn d_port() -> u16 {
    8085
}
fn d_api_token_env() -> String {
    "CV_API_TOKEN".into()
}
fn d_public_base_url() -> String {
    "http://127.0.0.1:8085".into()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: d_host(),
            port: d_port(),
            api_token_env: d_api_token_env(),
            public_base_url: d_public_base_url(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "d_db_path")]
    pub db_path: PathBuf,
    /// Idempotency key TTL, hours.
    #[serde(default = "d_idempotency_ttl_hours")]
    pub idempotency_ttl_hours: i64,
    /// Background sweeper interval, seconds.
    #[serde(default = "d_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
}

fn d_db_path() -> PathBuf {
    PathBuf::from("./data/conversa.db")
}
fn d_idempotency_ttl_hours() -> i64 {
    24
}
fn d_sweep_interval_secs() -> u64 {
    300
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            db_path: d_db_path(),
            idempotency_ttl_hours: d_idempotency_ttl_hours(),
            sweep_interval_secs: d_sweep_interval_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusConfig {
    /// Per-subscriber bounded queue depth (Backpressure).
    #[serde(default = "d_subscriber_queue_depth")]
    pub subscriber_queue_depth: usize,
}

fn d_subscriber_queue_depth() -> usize {
    1024
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            subscriber_queue_depth: d_subscriber_queue_depth(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurnConfig {
    /// Default guidance deadline, milliseconds (: default 30_000).
    #[serde(default = "d_default_deadline_ms")]
    pub default_deadline_ms: u64,
    /// Floor applied to any computed deadline (step 3).
    #[serde(default = "d_deadline_floor_ms")]
    pub deadline_floor_ms: u64,
    /// `restart` force-closes an abandoned turn; `resume` re-enters IDLE.
    #[serde(default)]
    pub recovery_mode: TurnRecoveryMode,
}

fn d_default_deadline_ms() -> u64 {
    30_000
}
fn d_deadline_floor_ms() -> u64 {
    5_000
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnRecoveryMode {
    Restart,
    Resume,
}

impl Default for TurnRecoveryMode {
    fn default() -> Self {
        // Open Question: "default to `restart` for newly introduced agents."
        TurnRecoveryMode::Restart
    }
}

impl Default for TurnConfig {
    fn default() -> Self {
        Self {
            default_deadline_ms: d_default_deadline_ms(),
            deadline_floor_ms: d_deadline_floor_ms(),
            recovery_mode: TurnRecoveryMode::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeConfig {
    /// Backend lease TTL, milliseconds.
    #[serde(default = "d_lease_ttl_ms")]
    pub lease_ttl_ms: u64,
    /// `check_replies` waitMs clamp bounds.
    #[serde(default = "d_check_replies_min_ms")]
    pub check_replies_min_ms: u64,
    #[serde(default = "d_check_replies_max_ms")]
    pub check_replies_max_ms: u64,
    #[serde(default = "d_check_replies_default_ms")]
    pub check_replies_default_ms: u64,
    /// Base template deep-merged with per-room fields to build
    /// `.well-known/agent-card.json`.
    #[serde(default = "d_agent_card_template")]
    pub agent_card_template: serde_json::Value,
}

fn d_agent_card_template() -> serde_json::Value {
    serde_json::json!({
        "protocolVersion": "0.2",
        "capabilities": { "streaming": true },
        "skills": [],
    })
}

fn d_lease_ttl_ms() -> u64 {
    15_000
}
fn d_check_replies_min_ms() -> u64 {
    0
}
fn d_check_replies_max_ms() -> u64 {
    120_000
}
fn d_check_replies_default_ms() -> u64 {
    10_000
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            lease_ttl_ms: d_lease_ttl_ms(),
            check_replies_min_ms: d_check_replies_min_ms(),
            check_replies_max_ms: d_check_replies_max_ms(),
            check_replies_default_ms: d_check_replies_default_ms(),
            agent_card_template: d_agent_card_template(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdminConfig {
    /// Env var holding the bearer token guarding scenario edits tagged
    /// `published` and the `/v1/admin/*` surface. Unset = disabled (403).
    #[serde(default = "d_admin_token_env")]
    pub token_env: String,
}

fn d_admin_token_env() -> String {
    "CV_ADMIN_TOKEN".into()
}

impl Default for AdminConfig {
    fn default() -> Self {
        Self {
            token_env: d_admin_token_env(),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Validation
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigSeverity {
    Error,
    Warning,
}

#[derive(Debug, Clone)]
pub struct ConfigError {
    pub severity: ConfigSeverity,
    pub field: String,
    pub message: String,
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tag = match self.severity {
            ConfigSeverity::Error => "ERROR",
            ConfigSeverity::Warning => "WARN",
        };
        write!(f, "[{tag}] {}: {}", self.field, self.message)
    }
}

impl Config {
    pub fn validate(&self) -> Vec<ConfigError> {
        let mut errors = Vec::new();

        if self.server.port == 0 {
            errors.push(ConfigError {
                severity: ConfigSeverity::Error,
                field: "server.port".into(),
                message: "port must be greater than 0".into(),
            });
        }
        if self.server.host.is_empty() {
            errors.push(ConfigError {
                severity: ConfigSeverity::Error,
                field: "server.host".into(),
                message: "host must not be empty".into(),
            });
        }
        if self.store.idempotency_ttl_hours < 24 {
            errors.push(ConfigError {
                severity: ConfigSeverity::Warning,
                field: "store.idempotency_ttl_hours".into(),
                message: "idempotency TTL should be at least 24h; shorter values risk duplicate effects"
                    .into(),
            });
        }
        if self.bridge.check_replies_max_ms < self.bridge.check_replies_min_ms {
            errors.push(ConfigError {
                severity: ConfigSeverity::Error,
                field: "bridge.check_replies_max_ms".into(),
                message: "must be >= check_replies_min_ms".into(),
            });
        }
        if self.bus.subscriber_queue_depth == 0 {
            errors.push(ConfigError {
                severity: ConfigSeverity::Error,
                field: "bus.subscriber_queue_depth".into(),
                message: "queue depth must be greater than 0".into(),
            });
        }

        errors
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        let issues = Config::default().validate();
        assert!(
            issues.iter().all(|i| i.severity != ConfigSeverity::Error),
            "default config should have no errors: {issues:?}"
        );
    }

    #[test]
    fn zero_port_is_an_error() {
        let mut c = Config::default();
        c.server.port = 0;
        let issues = c.validate();
        assert!(issues
            .iter()
            .any(|i| i.field == "server.port" && i.severity == ConfigSeverity::Error));
    }

    #[test]
    fn short_idempotency_ttl_is_a_warning_not_an_error() {
        let mut c = Config::default();
        c.store.idempotency_ttl_hours = 1;
        let issues = c.validate();
        assert!(issues
            .iter()
            .any(|i| i.field == "store.idempotency_ttl_hours"
                && i.severity == ConfigSeverity::Warning));
        assert!(issues.iter().all(|i| i.severity != ConfigSeverity::Error));
    }
}
