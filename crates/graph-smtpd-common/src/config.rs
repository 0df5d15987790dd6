//! Configuration for graph-smtpd

use config::builder::DefaultState;
use config::{ConfigBuilder, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// SMTP listener configuration
    #[serde(default)]
    pub smtp: SmtpConfig,

    /// Access controls
    #[serde(default)]
    pub access: AccessConfig,

    /// STARTTLS certificate configuration
    #[serde(default)]
    pub tls: TlsConfig,

    /// Microsoft Graph application credentials
    #[serde(default)]
    pub graph: GraphConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// SMTP configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SmtpConfig {
    /// Listen address
    #[serde(default = "default_addr")]
    pub addr: String,

    /// Domain announced in the greeting
    #[serde(default = "default_domain")]
    pub domain: String,

    /// Maximum recipients per transaction
    #[serde(default = "default_max_recipients")]
    pub max_recipients: usize,

    /// Maximum message size in bytes
    #[serde(default = "default_max_message_bytes")]
    pub max_message_bytes: usize,

    /// Maximum concurrent connections
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,

    /// Idle timeout while waiting for a command, in seconds
    #[serde(default = "default_connection_timeout")]
    pub connection_timeout_secs: u64,
}

impl Default for SmtpConfig {
    fn default() -> Self {
        Self {
            addr: default_addr(),
            domain: default_domain(),
            max_recipients: default_max_recipients(),
            max_message_bytes: default_max_message_bytes(),
            max_connections: default_max_connections(),
            connection_timeout_secs: default_connection_timeout(),
        }
    }
}

fn default_addr() -> String {
    "localhost:2525".to_string()
}

fn default_domain() -> String {
    "localhost".to_string()
}

fn default_max_recipients() -> usize {
    10
}

fn default_max_message_bytes() -> usize {
    1024 * 1024 // 1 MiB
}

fn default_max_connections() -> usize {
    100
}

fn default_connection_timeout() -> u64 {
    300
}

/// Access control lists
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AccessConfig {
    /// Sender addresses allowed in MAIL FROM. Empty allows any sender.
    #[serde(default)]
    pub senders: Vec<String>,

    /// Source addresses or CIDR networks allowed to relay. Empty allows any source.
    #[serde(default)]
    pub sources: Vec<String>,
}

/// TLS configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TlsConfig {
    /// Path to certificate chain (PEM)
    pub cert: Option<PathBuf>,

    /// Path to private key (PEM)
    pub key: Option<PathBuf>,

    /// How often the certificate files are checked for changes, in seconds
    #[serde(default = "default_reload_interval")]
    pub reload_interval_secs: u64,
}

impl Default for TlsConfig {
    fn default() -> Self {
        Self {
            cert: None,
            key: None,
            reload_interval_secs: default_reload_interval(),
        }
    }
}

impl TlsConfig {
    /// Certificate and key paths, when both are configured
    pub fn paths(&self) -> Option<(&Path, &Path)> {
        match (&self.cert, &self.key) {
            (Some(cert), Some(key)) if !cert.as_os_str().is_empty() && !key.as_os_str().is_empty() => {
                Some((cert.as_path(), key.as_path()))
            }
            _ => None,
        }
    }
}

fn default_reload_interval() -> u64 {
    5
}

/// Microsoft Graph configuration
#[derive(Clone, Serialize, Deserialize)]
pub struct GraphConfig {
    /// Entra ID tenant
    #[serde(default)]
    pub tenant_id: String,

    /// App registration client/application ID
    #[serde(default)]
    pub client_id: String,

    /// App registration client secret
    #[serde(default)]
    pub client_secret: String,

    /// Save a copy of each message to the sender's Sent Items
    #[serde(default)]
    pub save_to_sent_items: bool,

    /// OAuth2 authority host
    #[serde(default = "default_authority_url")]
    pub authority_url: String,

    /// Graph API base URL
    #[serde(default = "default_graph_url")]
    pub graph_url: String,

    /// Request timeout in seconds
    #[serde(default = "default_graph_timeout")]
    pub timeout_secs: u64,
}

impl Default for GraphConfig {
    fn default() -> Self {
        Self {
            tenant_id: String::new(),
            client_id: String::new(),
            client_secret: String::new(),
            save_to_sent_items: false,
            authority_url: default_authority_url(),
            graph_url: default_graph_url(),
            timeout_secs: default_graph_timeout(),
        }
    }
}

impl std::fmt::Debug for GraphConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GraphConfig")
            .field("tenant_id", &self.tenant_id)
            .field("client_id", &self.client_id)
            .field("client_secret", &"<redacted>")
            .field("save_to_sent_items", &self.save_to_sent_items)
            .field("authority_url", &self.authority_url)
            .field("graph_url", &self.graph_url)
            .field("timeout_secs", &self.timeout_secs)
            .finish()
    }
}

fn default_authority_url() -> String {
    "https://login.microsoftonline.com".to_string()
}

fn default_graph_url() -> String {
    "https://graph.microsoft.com/v1.0".to_string()
}

fn default_graph_timeout() -> u64 {
    30
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format: "json" or "text"
    #[serde(default = "default_log_format")]
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "json".to_string()
}

impl Config {
    /// Layered sources: config file, then environment variables
    ///
    /// An explicit `path` must exist. Without one, `./config.{toml,yaml,json}`
    /// is used if present. Environment variables use `{prefix}_SECTION__KEY`,
    /// e.g. `SMTPD_SMTP__ADDR`; access lists are comma separated.
    pub fn sources(path: Option<&Path>, env_prefix: &str) -> ConfigBuilder<DefaultState> {
        Self::sources_in(path, &[], env_prefix)
    }

    /// Like [`Config::sources`], but without an explicit path an optional
    /// `config.*` is also looked up in each of `search_dirs`. Earlier
    /// directories take precedence over later ones and over `./config.*`.
    pub fn sources_in(
        path: Option<&Path>,
        search_dirs: &[PathBuf],
        env_prefix: &str,
    ) -> ConfigBuilder<DefaultState> {
        let mut builder = config::Config::builder();

        match path {
            Some(path) => builder = builder.add_source(File::from(path).required(true)),
            None => {
                builder = builder.add_source(File::with_name("config").required(false));
                for dir in search_dirs.iter().rev() {
                    let name = dir.join("config");
                    builder = builder.add_source(File::with_name(&name.to_string_lossy()).required(false));
                }
            }
        }

        builder.add_source(
            Environment::with_prefix(env_prefix)
                .prefix_separator("_")
                .separator("__")
                .list_separator(",")
                .with_list_parse_key("access.senders")
                .with_list_parse_key("access.sources")
                .try_parsing(true),
        )
    }

    /// Build the final configuration from layered sources
    pub fn from_sources(builder: ConfigBuilder<DefaultState>) -> crate::Result<Self> {
        let config = builder.build()?.try_deserialize::<Config>()?;
        Ok(config)
    }
}
