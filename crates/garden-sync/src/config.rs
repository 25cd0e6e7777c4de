//! # Garden Configuration
//!
//! Garden identity, broker endpoints, TLS material, backoff parameters and
//! the set of remote gardens this garden talks to.
//!
//! ## Config File Format (garden.toml)
//! ```toml
//! [garden]
//! name = "parent"
//! namespaces = ["default"]
//!
//! [broker]
//! endpoints = ["ws://localhost:61614/stomp"]
//! username = "beer_garden"
//! password = "password"
//! subscribe_destination = "parent.operations"
//! send_destination = "parent.events"
//! reply_destination = "parent.replies"
//!
//! [broker.tls]
//! use_ssl = false
//!
//! [backoff]
//! initial_ms = 500
//! max_ms = 30000
//! multiplier = 2.0
//!
//! [[remote_gardens]]
//! name = "child"
//! connection_type = "STOMP"
//! namespaces = ["ns1"]
//! destination = "child.operations"
//! ```

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, info, warn};
use url::Url;

use garden_core::{ConnectionType, Garden};
use garden_db::DbConfig;

use crate::error::{SyncError, SyncResult};
use crate::supervisor::BackoffPolicy;
use crate::transport::{TlsConfig, TransportConfig};

// =============================================================================
// Garden Settings
// =============================================================================

/// Identity of the garden this process runs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GardenSettings {
    /// Unique garden name within the federation.
    #[serde(default = "default_garden_name")]
    pub name: String,

    /// Namespaces owned by this garden.
    #[serde(default)]
    pub namespaces: Vec<String>,

    /// Upper bound on waiting for workers during shutdown.
    #[serde(default = "default_shutdown_grace")]
    pub shutdown_grace_secs: u64,
}

fn default_garden_name() -> String {
    "default".to_string()
}

fn default_shutdown_grace() -> u64 {
    10
}

impl Default for GardenSettings {
    fn default() -> Self {
        GardenSettings {
            name: default_garden_name(),
            namespaces: Vec::new(),
            shutdown_grace_secs: default_shutdown_grace(),
        }
    }
}

// =============================================================================
// Broker Settings
// =============================================================================

/// TLS material for the broker connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TlsSettings {
    #[serde(default)]
    pub use_ssl: bool,

    /// PEM CA bundle to trust in addition to the system roots.
    #[serde(default)]
    pub ca_cert: Option<PathBuf>,

    /// PEM client certificate.
    #[serde(default)]
    pub client_cert: Option<PathBuf>,

    /// PEM PKCS#8 private key for `client_cert`.
    #[serde(default)]
    pub client_key: Option<PathBuf>,

    #[serde(default = "default_true")]
    pub verify_host: bool,
}

fn default_true() -> bool {
    true
}

impl Default for TlsSettings {
    fn default() -> Self {
        TlsSettings {
            use_ssl: false,
            ca_cert: None,
            client_cert: None,
            client_key: None,
            verify_host: true,
        }
    }
}

/// Broker connection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerSettings {
    /// `ws://` / `wss://` endpoints, tried in order.
    #[serde(default)]
    pub endpoints: Vec<String>,

    #[serde(default)]
    pub username: Option<String>,

    #[serde(default)]
    pub password: Option<String>,

    /// STOMP `host` header. Defaults to the endpoint's host.
    #[serde(default)]
    pub virtual_host: Option<String>,

    /// Where operations for this garden arrive.
    #[serde(default)]
    pub subscribe_destination: Option<String>,

    /// Default destination for replies without `reply-to`, and for events.
    #[serde(default)]
    pub send_destination: Option<String>,

    /// Where replies to forwarded operations arrive.
    #[serde(default)]
    pub reply_destination: Option<String>,

    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    #[serde(default = "default_heartbeat_send")]
    pub heartbeat_send_ms: u32,

    #[serde(default)]
    pub heartbeat_receive_ms: u32,

    #[serde(default)]
    pub tls: TlsSettings,
}

fn default_connect_timeout() -> u64 {
    10
}

fn default_heartbeat_send() -> u32 {
    10_000
}

impl Default for BrokerSettings {
    fn default() -> Self {
        BrokerSettings {
            endpoints: Vec::new(),
            username: None,
            password: None,
            virtual_host: None,
            subscribe_destination: None,
            send_destination: None,
            reply_destination: None,
            connect_timeout_secs: default_connect_timeout(),
            heartbeat_send_ms: default_heartbeat_send(),
            heartbeat_receive_ms: 0,
            tls: TlsSettings::default(),
        }
    }
}

// =============================================================================
// Backoff / Database / HTTP / Log Settings
// =============================================================================

/// Retry timing shared by every supervisor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackoffSettings {
    #[serde(default = "default_initial_backoff")]
    pub initial_ms: u64,

    #[serde(default = "default_max_backoff")]
    pub max_ms: u64,

    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
}

fn default_initial_backoff() -> u64 {
    500
}

fn default_max_backoff() -> u64 {
    30_000
}

fn default_multiplier() -> f64 {
    2.0
}

impl Default for BackoffSettings {
    fn default() -> Self {
        BackoffSettings {
            initial_ms: default_initial_backoff(),
            max_ms: default_max_backoff(),
            multiplier: default_multiplier(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DatabaseSettings {
    /// SQLite file. Defaults to the platform data directory.
    #[serde(default)]
    pub path: Option<PathBuf>,

    #[serde(default)]
    pub max_connections: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpSettings {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    #[serde(default = "default_http_port")]
    pub port: u16,
}

fn default_bind_addr() -> String {
    "0.0.0.0".to_string()
}

fn default_http_port() -> u16 {
    2337
}

impl Default for HttpSettings {
    fn default() -> Self {
        HttpSettings {
            enabled: true,
            bind_addr: default_bind_addr(),
            port: default_http_port(),
        }
    }
}

impl HttpSettings {
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.bind_addr, self.port)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogSettings {
    /// `tracing_subscriber::EnvFilter` directive, used when RUST_LOG is unset.
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LogSettings {
    fn default() -> Self {
        LogSettings {
            level: default_log_level(),
        }
    }
}

// =============================================================================
// Remote Gardens
// =============================================================================

/// A federation member reachable from this garden.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteGardenSettings {
    pub name: String,

    #[serde(default = "default_remote_connection")]
    pub connection_type: ConnectionType,

    #[serde(default)]
    pub namespaces: Vec<String>,

    /// Broker destination the remote garden subscribes to.
    #[serde(default)]
    pub destination: Option<String>,
}

fn default_remote_connection() -> ConnectionType {
    ConnectionType::Stomp
}

impl RemoteGardenSettings {
    pub fn to_garden(&self) -> Garden {
        Garden::new(self.name.clone(), Some(self.connection_type))
            .with_namespaces(self.namespaces.iter().cloned())
    }

    /// Configured destination, or `<name>.operations`.
    pub fn destination(&self) -> String {
        self.destination
            .clone()
            .unwrap_or_else(|| format!("{}.operations", self.name))
    }
}

// =============================================================================
// Main Configuration
// =============================================================================

/// Complete garden configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GardenConfig {
    #[serde(default)]
    pub garden: GardenSettings,

    #[serde(default)]
    pub broker: BrokerSettings,

    #[serde(default)]
    pub backoff: BackoffSettings,

    #[serde(default)]
    pub database: DatabaseSettings,

    #[serde(default)]
    pub http: HttpSettings,

    #[serde(default)]
    pub log: LogSettings,

    #[serde(default)]
    pub remote_gardens: Vec<RemoteGardenSettings>,
}

impl GardenConfig {
    /// Loads configuration from file, environment, and defaults.
    ///
    /// ## Load Order (later overrides earlier)
    /// 1. Default values
    /// 2. Config file (garden.toml)
    /// 3. Environment variables
    pub fn load(config_path: Option<PathBuf>) -> SyncResult<Self> {
        let mut config = Self::default();

        if let Some(path) = config_path.or_else(Self::default_config_path) {
            if path.exists() {
                info!(?path, "Loading garden config from file");
                let contents = std::fs::read_to_string(&path)?;
                config = toml::from_str(&contents)?;
            } else {
                debug!(?path, "Config file not found, using defaults");
            }
        }

        config.apply_env_overrides();
        config.validate()?;

        Ok(config)
    }

    /// Saves configuration to file.
    pub fn save(&self, config_path: Option<PathBuf>) -> SyncResult<()> {
        let path = config_path
            .or_else(Self::default_config_path)
            .ok_or_else(|| SyncError::ConfigSaveFailed("No config path available".into()))?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let contents = toml::to_string_pretty(self)?;
        std::fs::write(&path, contents)?;

        info!(?path, "Garden config saved");
        Ok(())
    }

    /// Validates the configuration.
    pub fn validate(&self) -> SyncResult<()> {
        if self.garden.name.trim().is_empty() {
            return Err(SyncError::InvalidConfig("garden.name must not be empty".into()));
        }

        for endpoint in &self.broker.endpoints {
            let url = Url::parse(endpoint)?;
            if url.scheme() != "ws" && url.scheme() != "wss" {
                return Err(SyncError::InvalidUrl(format!(
                    "Broker endpoint must start with ws:// or wss://, got: {}",
                    endpoint
                )));
            }
        }

        let tls = &self.broker.tls;
        if tls.client_cert.is_some() != tls.client_key.is_some() {
            return Err(SyncError::InvalidConfig(
                "broker.tls.client_cert and broker.tls.client_key must be set together".into(),
            ));
        }

        if self.backoff.initial_ms == 0 || self.backoff.max_ms < self.backoff.initial_ms {
            return Err(SyncError::InvalidConfig(
                "backoff.initial_ms must be > 0 and <= backoff.max_ms".into(),
            ));
        }

        if self.backoff.multiplier <= 1.0 {
            return Err(SyncError::InvalidConfig(
                "backoff.multiplier must be greater than 1.0".into(),
            ));
        }

        let mut seen = HashSet::new();
        for remote in &self.remote_gardens {
            if remote.name.trim().is_empty() || remote.name == self.garden.name {
                return Err(SyncError::InvalidConfig(format!(
                    "invalid remote garden name '{}'",
                    remote.name
                )));
            }
            if !seen.insert(remote.name.as_str()) {
                return Err(SyncError::InvalidConfig(format!(
                    "remote garden '{}' configured twice",
                    remote.name
                )));
            }
            if remote.connection_type == ConnectionType::Local {
                return Err(SyncError::InvalidConfig(format!(
                    "remote garden '{}' cannot be LOCAL",
                    remote.name
                )));
            }
        }

        if !self.remote_gardens.is_empty() && self.broker.reply_destination.is_none() {
            return Err(SyncError::InvalidConfig(
                "broker.reply_destination is required when remote_gardens are configured".into(),
            ));
        }

        Ok(())
    }

    /// Applies environment variable overrides.
    fn apply_env_overrides(&mut self) {
        if let Ok(name) = std::env::var("BG_GARDEN_NAME") {
            debug!(garden = %name, "Overriding garden name from environment");
            self.garden.name = name;
        }

        if let Ok(endpoints) = std::env::var("BG_BROKER_ENDPOINTS") {
            self.broker.endpoints = endpoints
                .split(',')
                .map(str::trim)
                .filter(|e| !e.is_empty())
                .map(String::from)
                .collect();
        }

        if let Ok(username) = std::env::var("BG_BROKER_USERNAME") {
            self.broker.username = Some(username);
        }

        if let Ok(password) = std::env::var("BG_BROKER_PASSWORD") {
            self.broker.password = Some(password);
        }

        if let Ok(path) = std::env::var("BG_DATABASE_PATH") {
            self.database.path = Some(PathBuf::from(path));
        }

        if let Ok(port) = std::env::var("BG_HTTP_PORT") {
            match port.parse::<u16>() {
                Ok(p) => self.http.port = p,
                Err(_) => warn!(port = %port, "Ignoring invalid BG_HTTP_PORT"),
            }
        }

        if let Ok(level) = std::env::var("BG_LOG_LEVEL") {
            self.log.level = level;
        }
    }

    /// Returns the default config file path.
    fn default_config_path() -> Option<PathBuf> {
        directories::ProjectDirs::from("org", "beer-garden", "beer-garden")
            .map(|dirs| dirs.config_dir().join("garden.toml"))
    }

    // =========================================================================
    // Derived Settings
    // =========================================================================

    pub fn garden_name(&self) -> &str {
        &self.garden.name
    }

    /// The garden record for this process.
    pub fn local_garden(&self) -> Garden {
        Garden::new(self.garden.name.clone(), Some(ConnectionType::Local))
            .with_namespaces(self.garden.namespaces.iter().cloned())
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.garden.shutdown_grace_secs)
    }

    pub fn backoff_policy(&self) -> BackoffPolicy {
        BackoffPolicy {
            initial: Duration::from_millis(self.backoff.initial_ms),
            max: Duration::from_millis(self.backoff.max_ms),
            multiplier: self.backoff.multiplier,
        }
    }

    /// Transport settings for the broker connection.
    pub fn transport_config(&self) -> TransportConfig {
        let broker = &self.broker;

        let mut subscriptions = Vec::new();
        subscriptions.extend(broker.subscribe_destination.clone());
        subscriptions.extend(broker.reply_destination.clone());

        let tls = broker.tls.use_ssl.then(|| TlsConfig {
            ca_cert: broker.tls.ca_cert.clone(),
            client_cert: broker.tls.client_cert.clone(),
            client_key: broker.tls.client_key.clone(),
            verify_host: broker.tls.verify_host,
        });

        TransportConfig {
            endpoints: broker.endpoints.clone(),
            username: broker.username.clone(),
            password: broker.password.clone(),
            virtual_host: broker.virtual_host.clone(),
            subscriptions,
            send_destination: broker.send_destination.clone(),
            connect_timeout: Duration::from_secs(broker.connect_timeout_secs),
            heartbeat: (broker.heartbeat_send_ms, broker.heartbeat_receive_ms),
            tls,
            backoff: self.backoff_policy(),
        }
    }

    /// Database settings, defaulting to the platform data directory.
    pub fn db_config(&self) -> DbConfig {
        let path = self
            .database
            .path
            .clone()
            .or_else(|| {
                directories::ProjectDirs::from("org", "beer-garden", "beer-garden")
                    .map(|dirs| dirs.data_dir().join("garden.db"))
            })
            .unwrap_or_else(|| PathBuf::from("garden.db"));

        let mut config = DbConfig::new(path);
        if let Some(max) = self.database.max_connections {
            config = config.max_connections(max);
        }
        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn remote(name: &str) -> RemoteGardenSettings {
        RemoteGardenSettings {
            name: name.into(),
            connection_type: ConnectionType::Stomp,
            namespaces: vec!["ns1".into()],
            destination: None,
        }
    }

    #[test]
    fn test_default_config_is_valid() {
        let config = GardenConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.broker.heartbeat_send_ms, 10_000);
        assert_eq!(config.broker.heartbeat_receive_ms, 0);
        assert_eq!(config.garden_name(), "default");
    }

    #[test]
    fn test_config_validation() {
        let mut config = GardenConfig::default();

        config.garden.name = " ".into();
        assert!(config.validate().unwrap_err().is_config_error());

        config.garden.name = "parent".into();
        config.broker.endpoints = vec!["http://localhost:61613".into()];
        assert!(config.validate().is_err());

        config.broker.endpoints = vec!["ws://localhost:61614/stomp".into()];
        assert!(config.validate().is_ok());

        config.backoff.multiplier = 1.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_remote_gardens_validation() {
        let mut config = GardenConfig::default();
        config.garden.name = "parent".into();
        config.remote_gardens = vec![remote("child")];

        // replies need somewhere to land
        assert!(config.validate().is_err());
        config.broker.reply_destination = Some("parent.replies".into());
        assert!(config.validate().is_ok());

        config.remote_gardens.push(remote("child"));
        assert!(config.validate().is_err());

        config.remote_gardens = vec![remote("parent")];
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_transport_config_subscribes_operations_and_replies() {
        let mut config = GardenConfig::default();
        config.broker.subscribe_destination = Some("parent.operations".into());
        config.broker.reply_destination = Some("parent.replies".into());

        let transport = config.transport_config();
        assert_eq!(
            transport.subscriptions,
            vec!["parent.operations".to_string(), "parent.replies".to_string()]
        );
        assert!(transport.tls.is_none());
        assert_eq!(transport.heartbeat, (10_000, 0));
    }

    #[test]
    fn test_remote_destination_default() {
        assert_eq!(remote("child").destination(), "child.operations");
    }

    #[test]
    fn test_toml_round_trip() {
        let toml_str = r#"
            [garden]
            name = "parent"
            namespaces = ["default"]

            [broker]
            endpoints = ["ws://localhost:61614/stomp"]
            reply_destination = "parent.replies"

            [[remote_gardens]]
            name = "child"
            namespaces = ["ns1"]
        "#;

        let config: GardenConfig = toml::from_str(toml_str).unwrap();
        assert!(config.validate().is_ok());
        assert_eq!(config.remote_gardens[0].connection_type, ConnectionType::Stomp);
        assert!(config.local_garden().namespaces.contains("default"));

        let rendered = toml::to_string_pretty(&config).unwrap();
        assert!(rendered.contains("[garden]"));
    }
}
