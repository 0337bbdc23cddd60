//! Configuration loading utilities.
//!
//! This module provides layered configuration loading using figment:
//! - Default values (compiled in)
//! - Configuration file (TOML)
//! - Environment variables
//!
//! # Example
//!
//! ```rust,ignore
//! use tally_common::config::{load_tally_config, TallyConfig};
//!
//! // Load configuration from defaults + file + env
//! let config: TallyConfig = load_tally_config(None)?;
//! ```

#[cfg(feature = "config")]
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use secrecy::Secret;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, RwLock};

/// Database connection configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DatabaseConfig {
    /// PostgreSQL connection URL.
    #[serde(default = "default_database_url")]
    pub url: String,

    /// Maximum connections in the pool.
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,

    /// Minimum connections to maintain.
    #[serde(default = "default_min_connections")]
    pub min_connections: u32,

    /// Per-statement timeout in seconds.
    #[serde(default = "default_statement_timeout")]
    pub statement_timeout_secs: u64,
}

fn default_database_url() -> String {
    "postgres://localhost/tally".to_string()
}

fn default_max_connections() -> u32 {
    10
}

fn default_min_connections() -> u32 {
    1
}

fn default_statement_timeout() -> u64 {
    30
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: default_database_url(),
            max_connections: default_max_connections(),
            min_connections: default_min_connections(),
            statement_timeout_secs: default_statement_timeout(),
        }
    }
}

/// AI gateway client configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct GatewayConfig {
    /// Gateway base URL.
    #[serde(default = "default_gateway_base_url")]
    pub base_url: String,

    /// Admin path under the base URL.
    #[serde(default = "default_admin_path")]
    pub admin_path: String,

    /// Name of the admin credential header.
    #[serde(default = "default_credential_header")]
    pub credential_header: String,

    /// Admin credential value.
    #[serde(default = "default_credential")]
    #[serde(serialize_with = "serialize_redacted")]
    pub credential: Secret<String>,

    /// Per-call timeout in seconds.
    #[serde(default = "default_gateway_timeout")]
    pub timeout_secs: u64,
}

fn default_gateway_base_url() -> String {
    "http://localhost:8080".to_string()
}

fn default_admin_path() -> String {
    "/v1/chat/completions/quota".to_string()
}

fn default_credential_header() -> String {
    "X-Admin-Key".to_string()
}

fn default_credential() -> Secret<String> {
    Secret::new(String::new())
}

fn default_gateway_timeout() -> u64 {
    30
}

// Secrets never leave the process through config serialization.
fn serialize_redacted<S: serde::Serializer>(
    _secret: &Secret<String>,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    serializer.serialize_str("")
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            base_url: default_gateway_base_url(),
            admin_path: default_admin_path(),
            credential_header: default_credential_header(),
            credential: default_credential(),
            timeout_secs: default_gateway_timeout(),
        }
    }
}

/// HR directory synchronization configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct HrSyncConfig {
    /// Whether HR sync is enabled.
    #[serde(default)]
    pub enabled: bool,

    /// Employee feed endpoint.
    #[serde(default)]
    pub employees_url: String,

    /// Department hierarchy feed endpoint.
    #[serde(default)]
    pub departments_url: String,

    /// 32-byte shared key authenticating both feeds.
    #[serde(default = "default_credential")]
    #[serde(serialize_with = "serialize_redacted")]
    pub shared_key: Secret<String>,

    /// Sync interval in seconds.
    #[serde(default = "default_hr_interval")]
    pub interval_secs: u64,
}

fn default_hr_interval() -> u64 {
    3600
}

impl Default for HrSyncConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            employees_url: String::new(),
            departments_url: String::new(),
            shared_key: default_credential(),
            interval_secs: default_hr_interval(),
        }
    }
}

/// Strategy scheduler configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SchedulerConfig {
    /// Scheduler tick interval in seconds.
    #[serde(default = "default_tick_interval")]
    pub tick_interval_secs: u64,

    /// Expiry sweep interval in seconds.
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,

    /// Page size when iterating the user population.
    #[serde(default = "default_page_size")]
    pub user_page_size: u32,

    /// Deadline for one strategy's population iteration, in seconds.
    #[serde(default = "default_tick_deadline")]
    pub tick_deadline_secs: u64,
}

fn default_tick_interval() -> u64 {
    60
}

fn default_sweep_interval() -> u64 {
    600
}

fn default_page_size() -> u32 {
    500
}

fn default_tick_deadline() -> u64 {
    300
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_interval_secs: default_tick_interval(),
            sweep_interval_secs: default_sweep_interval(),
            user_page_size: default_page_size(),
            tick_deadline_secs: default_tick_deadline(),
        }
    }
}

/// Voucher signing configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct VoucherConfig {
    /// Hex-encoded 32-byte symmetric signing key, initialized at startup
    /// and immutable for the process lifetime.
    #[serde(default = "default_credential")]
    #[serde(serialize_with = "serialize_redacted")]
    pub signing_key: Secret<String>,
}

impl Default for VoucherConfig {
    fn default() -> Self {
        Self {
            signing_key: default_credential(),
        }
    }
}

/// Complete Tally configuration.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct TallyConfig {
    /// Database configuration.
    #[serde(default)]
    pub database: DatabaseConfig,

    /// Gateway client configuration.
    #[serde(default)]
    pub gateway: GatewayConfig,

    /// HR sync configuration.
    #[serde(default)]
    pub hr_sync: HrSyncConfig,

    /// Strategy scheduler configuration.
    #[serde(default)]
    pub scheduler: SchedulerConfig,

    /// Voucher signing configuration.
    #[serde(default)]
    pub voucher: VoucherConfig,
}

/// Load configuration from layered sources.
///
/// Sources (in order of precedence):
/// 1. Defaults (lowest)
/// 2. Configuration file (if provided)
/// 3. Environment variables (highest)
///
/// Environment variables are prefixed with the uppercase `prefix` followed by `_`.
/// For example, with prefix "tally", `TALLY_DATABASE_URL` sets `database.url`.
#[cfg(feature = "config")]
pub fn load_config<T: Default + Serialize + for<'de> Deserialize<'de>>(
    prefix: &str,
    config_file: Option<&str>,
) -> Result<T, figment::Error> {
    let mut figment = Figment::new().merge(Serialized::defaults(T::default()));

    if let Some(path) = config_file {
        figment = figment.merge(Toml::file(path));
    }

    figment = figment.merge(Env::prefixed(&format!("{}_", prefix.to_uppercase())).split("_"));

    figment.extract()
}

/// Load Tally configuration from defaults, file, and environment.
#[cfg(feature = "config")]
pub fn load_tally_config(config_file: Option<&str>) -> Result<TallyConfig, figment::Error> {
    load_config("tally", config_file)
}

/// Process-wide configuration holder.
///
/// Writers swap the whole snapshot under the write lock; readers take an
/// `Arc` snapshot and never observe a half-applied update.
pub struct ConfigManager {
    current: RwLock<Arc<TallyConfig>>,
}

impl ConfigManager {
    /// Create a manager around an initial snapshot.
    pub fn new(config: TallyConfig) -> Self {
        Self {
            current: RwLock::new(Arc::new(config)),
        }
    }

    /// Take a snapshot of the current configuration.
    pub fn snapshot(&self) -> Arc<TallyConfig> {
        self.current
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Replace the configuration atomically.
    pub fn replace(&self, config: TallyConfig) {
        let mut guard = self
            .current
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *guard = Arc::new(config);
    }
}
