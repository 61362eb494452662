//! Runtime connection settings and the TOML file they are usually loaded from.

use std::fmt;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;
use xmpp_parsers::jid::Jid;

use crate::iq_handler::UnknownIqReply;
use crate::reconnect::{BackoffStrategy, ReconnectPolicy};
use crate::sasl::MechanismSet;

pub const DEFAULT_CLIENT_PORT: u16 = 5222;
pub const DEFAULT_NEGOTIATION_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_REPLY_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_MAX_RESUMPTION: Duration = Duration::from_secs(300);
pub const DEFAULT_SEND_QUEUE_CAPACITY: usize = 500;
pub const DEFAULT_LISTENER_QUEUE_CAPACITY: usize = 1024;
pub const DEFAULT_MAX_UNACKED_STANZAS: usize = 1024;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid TOML at line {line}, column {column}: {message}")]
    InvalidToml {
        line: usize,
        column: usize,
        message: String,
    },

    #[error("missing required fields: {fields:?}")]
    MissingRequiredFields { fields: Vec<String> },

    #[error("invalid value for {field}: {message}")]
    InvalidValue { field: String, message: String },

    #[error("I/O error reading configuration: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TlsPolicy {
    #[default]
    Required,
    IfPossible,
    Disabled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TransportKind {
    /// RFC 6120 over TCP, upgraded with StartTLS.
    #[default]
    Tcp,
    /// TLS from the first byte (XEP-0368).
    DirectTls,
    /// RFC 7395; `server` is a `ws://`/`wss://` URL or a host.
    Websocket,
    /// XEP-0206; `server` is the BOSH endpoint URL or a host.
    Bosh,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamManagementConfig {
    pub enabled: bool,
    pub resume: bool,
    pub max_resumption: Option<Duration>,
    /// Sending waits for acknowledgements once this many stanzas are unacked.
    pub max_unacked: usize,
}

impl Default for StreamManagementConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            resume: true,
            max_resumption: Some(DEFAULT_MAX_RESUMPTION),
            max_unacked: DEFAULT_MAX_UNACKED_STANZAS,
        }
    }
}

/// Everything an [`XmppConnection`](crate::XmppConnection) needs to
/// establish and maintain a session.
#[derive(Clone)]
pub struct ConnectionConfig {
    /// Account JID. A resource part is requested during binding.
    pub jid: Jid,
    pub password: String,
    /// Host (or URL for HTTP transports) to connect to instead of the JID domain.
    pub server: Option<String>,
    pub port: Option<u16>,
    pub transport: TransportKind,
    pub tls: TlsPolicy,
    pub allow_plain_without_tls: bool,
    pub mechanisms: MechanismSet,
    pub lang: Option<String>,
    pub negotiation_timeout: Duration,
    pub reply_timeout: Duration,
    pub stream_management: StreamManagementConfig,
    pub reconnect: ReconnectPolicy,
    /// Reconnect in the background after an established session is lost.
    pub auto_reconnect: bool,
    pub unknown_iq_reply: UnknownIqReply,
    pub send_queue_capacity: usize,
    /// Per-listener backlog for asynchronous stanza listeners.
    pub listener_queue_capacity: usize,
}

impl fmt::Debug for ConnectionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionConfig")
            .field("jid", &self.jid.to_string())
            .field("password", &"<redacted>")
            .field("server", &self.server)
            .field("port", &self.port)
            .field("transport", &self.transport)
            .field("tls", &self.tls)
            .field("mechanisms", &self.mechanisms)
            .field("stream_management", &self.stream_management)
            .field("reconnect", &self.reconnect)
            .finish_non_exhaustive()
    }
}

impl ConnectionConfig {
    pub fn new(jid: Jid, password: impl Into<String>) -> Self {
        Self {
            jid,
            password: password.into(),
            server: None,
            port: None,
            transport: TransportKind::default(),
            tls: TlsPolicy::default(),
            allow_plain_without_tls: false,
            mechanisms: MechanismSet::default(),
            lang: None,
            negotiation_timeout: DEFAULT_NEGOTIATION_TIMEOUT,
            reply_timeout: DEFAULT_REPLY_TIMEOUT,
            stream_management: StreamManagementConfig::default(),
            reconnect: ReconnectPolicy::default(),
            auto_reconnect: true,
            unknown_iq_reply: UnknownIqReply::default(),
            send_queue_capacity: DEFAULT_SEND_QUEUE_CAPACITY,
            listener_queue_capacity: DEFAULT_LISTENER_QUEUE_CAPACITY,
        }
    }

    pub fn domain(&self) -> String {
        self.jid.domain().to_string()
    }

    pub fn username(&self) -> Option<String> {
        self.jid.node().map(|node| node.to_string())
    }

    pub fn resource(&self) -> Option<String> {
        self.jid.resource().map(|resource| resource.to_string())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub account: AccountConfig,
    #[serde(default)]
    pub connection: ConnectionSection,
    #[serde(default)]
    pub sasl: SaslSection,
    #[serde(default)]
    pub stream_management: StreamManagementSection,
    #[serde(default)]
    pub reconnect: ReconnectSection,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AccountConfig {
    pub jid: String,
    pub password: String,
    pub server: Option<String>,
    pub port: Option<u16>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ConnectionSection {
    #[serde(default)]
    pub transport: TransportKind,
    #[serde(default)]
    pub tls: TlsPolicy,
    #[serde(default = "default_negotiation_timeout_secs")]
    pub negotiation_timeout_secs: u64,
    #[serde(default = "default_reply_timeout_secs")]
    pub reply_timeout_secs: u64,
    pub lang: Option<String>,
    #[serde(default)]
    pub unknown_iq_reply: UnknownIqReply,
}

impl Default for ConnectionSection {
    fn default() -> Self {
        Self {
            transport: TransportKind::default(),
            tls: TlsPolicy::default(),
            negotiation_timeout_secs: default_negotiation_timeout_secs(),
            reply_timeout_secs: default_reply_timeout_secs(),
            lang: None,
            unknown_iq_reply: UnknownIqReply::default(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SaslSection {
    /// Mechanism names in order of preference; empty keeps the default order.
    #[serde(default)]
    pub mechanisms: Vec<String>,
    #[serde(default)]
    pub allow_plain_without_tls: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StreamManagementSection {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_true")]
    pub resume: bool,
    #[serde(default = "default_max_resumption_secs")]
    pub max_resumption_secs: u64,
    #[serde(default = "default_max_unacked")]
    pub max_unacked: usize,
}

impl Default for StreamManagementSection {
    fn default() -> Self {
        Self {
            enabled: true,
            resume: true,
            max_resumption_secs: default_max_resumption_secs(),
            max_unacked: default_max_unacked(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ReconnectStrategyName {
    #[default]
    Exponential,
    Fixed,
    RandomIncreasing,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReconnectSection {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub policy: ReconnectStrategyName,
    #[serde(default = "default_initial_delay_secs")]
    pub initial_delay_secs: u64,
    #[serde(default = "default_max_delay_secs")]
    pub max_delay_secs: u64,
    #[serde(default = "default_fixed_delay_secs")]
    pub fixed_delay_secs: u64,
    #[serde(default)]
    pub max_attempts: u32,
    #[serde(default = "default_true")]
    pub jitter: bool,
}

impl Default for ReconnectSection {
    fn default() -> Self {
        Self {
            enabled: true,
            policy: ReconnectStrategyName::default(),
            initial_delay_secs: default_initial_delay_secs(),
            max_delay_secs: default_max_delay_secs(),
            fixed_delay_secs: default_fixed_delay_secs(),
            max_attempts: 0,
            jitter: true,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

#[derive(Debug, Default, Clone)]
struct ConfigOverrides {
    jid: Option<String>,
    password: Option<String>,
    server: Option<String>,
    log_level: Option<String>,
}

fn default_true() -> bool {
    true
}

fn default_negotiation_timeout_secs() -> u64 {
    DEFAULT_NEGOTIATION_TIMEOUT.as_secs()
}

fn default_reply_timeout_secs() -> u64 {
    DEFAULT_REPLY_TIMEOUT.as_secs()
}

fn default_max_resumption_secs() -> u64 {
    DEFAULT_MAX_RESUMPTION.as_secs()
}

fn default_max_unacked() -> usize {
    DEFAULT_MAX_UNACKED_STANZAS
}

fn default_initial_delay_secs() -> u64 {
    1
}

fn default_max_delay_secs() -> u64 {
    60
}

fn default_fixed_delay_secs() -> u64 {
    15
}

fn default_log_level() -> String {
    "info".to_string()
}

const VALID_LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];
const KNOWN_MECHANISMS: &[&str] = &["SCRAM-SHA-256", "SCRAM-SHA-1", "PLAIN"];

pub const DEFAULT_CONFIG_TOML: &str = r#"[account]
jid = ""
password = ""
# server = "xmpp.example.com"
# port = 5222

[connection]
transport = "tcp"
tls = "required"
negotiation_timeout_secs = 30
reply_timeout_secs = 5

[sasl]
# mechanisms = ["SCRAM-SHA-256", "SCRAM-SHA-1", "PLAIN"]
allow_plain_without_tls = false

[stream_management]
enabled = true
resume = true
max_resumption_secs = 300
max_unacked = 1024

[reconnect]
enabled = true
policy = "exponential"
max_attempts = 0

[logging]
level = "info"
"#;

/// Loads a configuration file, applying `PLOVER_*` environment overrides.
pub fn load_config_from(path: impl AsRef<Path>) -> Result<Config, ConfigError> {
    let contents = std::fs::read_to_string(path)?;
    load_config_from_str_with_overrides(&contents, config_overrides_from_env())
}

pub fn load_config_from_str(toml_str: &str) -> Result<Config, ConfigError> {
    load_config_from_str_with_overrides(toml_str, config_overrides_from_env())
}

/// Writes the commented default configuration, creating parent directories.
pub fn create_default_config(path: impl AsRef<Path>) -> Result<(), ConfigError> {
    let path = path.as_ref();
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, DEFAULT_CONFIG_TOML)?;
    Ok(())
}

fn load_config_from_str_with_overrides(
    toml_str: &str,
    overrides: ConfigOverrides,
) -> Result<Config, ConfigError> {
    let mut config: Config = toml::from_str(toml_str).map_err(|e| {
        let (line, column) = e.span().map_or((0, 0), |span| {
            let before = &toml_str[..span.start];
            let line = before.chars().filter(|&c| c == '\n').count() + 1;
            let column = before
                .rfind('\n')
                .map_or(span.start + 1, |nl| span.start - nl);
            (line, column)
        });
        ConfigError::InvalidToml {
            line,
            column,
            message: e.message().to_string(),
        }
    })?;

    apply_overrides(&mut config, overrides);
    validate(&config)?;

    Ok(config)
}

fn config_overrides_from_env() -> ConfigOverrides {
    ConfigOverrides {
        jid: std::env::var("PLOVER_JID").ok(),
        password: std::env::var("PLOVER_PASSWORD").ok(),
        server: std::env::var("PLOVER_SERVER").ok(),
        log_level: std::env::var("PLOVER_LOG_LEVEL").ok(),
    }
}

fn apply_overrides(config: &mut Config, overrides: ConfigOverrides) {
    if let Some(jid) = overrides.jid {
        config.account.jid = jid;
    }
    if let Some(password) = overrides.password {
        config.account.password = password;
    }
    if let Some(server) = overrides.server {
        config.account.server = Some(server);
    }
    if let Some(level) = overrides.log_level {
        config.logging.level = level;
    }
}

fn validate(config: &Config) -> Result<(), ConfigError> {
    let mut missing = Vec::new();

    if config.account.jid.is_empty() {
        missing.push("account.jid".to_string());
    }
    if config.account.password.is_empty() {
        missing.push("account.password".to_string());
    }

    if !missing.is_empty() {
        return Err(ConfigError::MissingRequiredFields { fields: missing });
    }

    let jid = config
        .account
        .jid
        .parse::<Jid>()
        .map_err(|error| ConfigError::InvalidValue {
            field: "account.jid".to_string(),
            message: error.to_string(),
        })?;
    if jid.node().is_none() {
        return Err(ConfigError::InvalidValue {
            field: "account.jid".to_string(),
            message: "must include a local part".to_string(),
        });
    }

    if let Some(unknown) = config
        .sasl
        .mechanisms
        .iter()
        .find(|mechanism| !KNOWN_MECHANISMS.contains(&mechanism.as_str()))
    {
        return Err(ConfigError::InvalidValue {
            field: "sasl.mechanisms".to_string(),
            message: format!(
                "unsupported mechanism '{unknown}', expected one of: {}",
                KNOWN_MECHANISMS.join(", ")
            ),
        });
    }

    if config.connection.negotiation_timeout_secs == 0 {
        return Err(ConfigError::InvalidValue {
            field: "connection.negotiation_timeout_secs".to_string(),
            message: "must be greater than zero".to_string(),
        });
    }

    if config.stream_management.max_unacked == 0 {
        return Err(ConfigError::InvalidValue {
            field: "stream_management.max_unacked".to_string(),
            message: "must be greater than zero".to_string(),
        });
    }

    if config.reconnect.initial_delay_secs > config.reconnect.max_delay_secs {
        return Err(ConfigError::InvalidValue {
            field: "reconnect.initial_delay_secs".to_string(),
            message: "must not exceed reconnect.max_delay_secs".to_string(),
        });
    }

    if !VALID_LOG_LEVELS.contains(&config.logging.level.as_str()) {
        return Err(ConfigError::InvalidValue {
            field: "logging.level".to_string(),
            message: format!("must be one of: {}", VALID_LOG_LEVELS.join(", ")),
        });
    }

    Ok(())
}

impl Config {
    pub fn connection_config(&self) -> Result<ConnectionConfig, ConfigError> {
        let jid = self
            .account
            .jid
            .parse::<Jid>()
            .map_err(|error| ConfigError::InvalidValue {
                field: "account.jid".to_string(),
                message: error.to_string(),
            })?;

        let mut connection = ConnectionConfig::new(jid, self.account.password.clone());
        connection.server = self.account.server.clone();
        connection.port = self.account.port;
        connection.transport = self.connection.transport;
        connection.tls = self.connection.tls;
        connection.lang = self.connection.lang.clone();
        connection.negotiation_timeout = Duration::from_secs(self.connection.negotiation_timeout_secs);
        connection.reply_timeout = Duration::from_secs(self.connection.reply_timeout_secs);
        connection.unknown_iq_reply = self.connection.unknown_iq_reply;
        connection.allow_plain_without_tls = self.sasl.allow_plain_without_tls;
        if !self.sasl.mechanisms.is_empty() {
            connection.mechanisms = MechanismSet::with_preference(self.sasl.mechanisms.clone());
        }
        connection.stream_management = StreamManagementConfig {
            enabled: self.stream_management.enabled,
            resume: self.stream_management.resume,
            max_resumption: Some(Duration::from_secs(self.stream_management.max_resumption_secs)),
            max_unacked: self.stream_management.max_unacked,
        };

        let strategy = match self.reconnect.policy {
            ReconnectStrategyName::Exponential => BackoffStrategy::Exponential {
                initial: Duration::from_secs(self.reconnect.initial_delay_secs),
                max: Duration::from_secs(self.reconnect.max_delay_secs),
            },
            ReconnectStrategyName::Fixed => {
                BackoffStrategy::Fixed(Duration::from_secs(self.reconnect.fixed_delay_secs))
            }
            ReconnectStrategyName::RandomIncreasing => BackoffStrategy::RandomIncreasing,
        };
        let mut reconnect = ReconnectPolicy::new(strategy, self.reconnect.max_attempts);
        reconnect.jitter = self.reconnect.jitter;
        connection.reconnect = reconnect;
        connection.auto_reconnect = self.reconnect.enabled;

        Ok(connection)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_without_env(toml_str: &str) -> Result<Config, ConfigError> {
        load_config_from_str_with_overrides(toml_str, ConfigOverrides::default())
    }

    fn minimal_toml() -> &'static str {
        r#"
[account]
jid = "user@example.com"
password = "secret"
"#
    }

    #[test]
    fn parses_minimal_config_with_defaults() {
        let config = parse_without_env(minimal_toml()).unwrap();
        assert_eq!(config.account.jid, "user@example.com");
        assert_eq!(config.connection.transport, TransportKind::Tcp);
        assert_eq!(config.connection.tls, TlsPolicy::Required);
        assert_eq!(config.connection.negotiation_timeout_secs, 30);
        assert!(config.stream_management.enabled);
        assert_eq!(config.reconnect.policy, ReconnectStrategyName::Exponential);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn parses_full_config() {
        let toml = r#"
[account]
jid = "user@example.com/laptop"
password = "secret"
server = "wss://xmpp.example.com/ws"

[connection]
transport = "websocket"
tls = "if-possible"
reply_timeout_secs = 10
unknown_iq_reply = "feature-not-implemented"

[sasl]
mechanisms = ["SCRAM-SHA-1"]

[stream_management]
resume = false
max_unacked = 64

[reconnect]
policy = "random-increasing"
max_attempts = 5

[logging]
level = "debug"
"#;
        let config = parse_without_env(toml).unwrap();
        let connection = config.connection_config().unwrap();

        assert_eq!(connection.transport, TransportKind::Websocket);
        assert_eq!(connection.tls, TlsPolicy::IfPossible);
        assert_eq!(connection.reply_timeout, Duration::from_secs(10));
        assert_eq!(connection.unknown_iq_reply, UnknownIqReply::FeatureNotImplemented);
        assert_eq!(connection.mechanisms.preference(), ["SCRAM-SHA-1".to_string()]);
        assert!(!connection.stream_management.resume);
        assert_eq!(connection.stream_management.max_unacked, 64);
        assert_eq!(connection.reconnect.strategy, BackoffStrategy::RandomIncreasing);
        assert_eq!(connection.reconnect.max_attempts, 5);
        assert_eq!(connection.resource().as_deref(), Some("laptop"));
        assert_eq!(connection.username().as_deref(), Some("user"));
    }

    #[test]
    fn rejects_missing_credentials() {
        let toml = r#"
[account]
jid = ""
password = ""
"#;
        match parse_without_env(toml).unwrap_err() {
            ConfigError::MissingRequiredFields { fields } => {
                assert_eq!(fields, vec!["account.jid", "account.password"]);
            }
            other => panic!("expected MissingRequiredFields, got: {other}"),
        }
    }

    #[test]
    fn rejects_jid_without_local_part() {
        let toml = r#"
[account]
jid = "example.com"
password = "secret"
"#;
        assert!(matches!(
            parse_without_env(toml),
            Err(ConfigError::InvalidValue { ref field, .. }) if field == "account.jid"
        ));
    }

    #[test]
    fn rejects_unknown_mechanism() {
        let toml = r#"
[account]
jid = "user@example.com"
password = "secret"

[sasl]
mechanisms = ["DIGEST-MD5"]
"#;
        assert!(matches!(
            parse_without_env(toml),
            Err(ConfigError::InvalidValue { ref field, .. }) if field == "sasl.mechanisms"
        ));
    }

    #[test]
    fn rejects_zero_unacked_cap() {
        let toml = r#"
[account]
jid = "user@example.com"
password = "secret"

[stream_management]
max_unacked = 0
"#;
        assert!(matches!(
            parse_without_env(toml),
            Err(ConfigError::InvalidValue { ref field, .. }) if field == "stream_management.max_unacked"
        ));
    }

    #[test]
    fn invalid_toml_reports_position() {
        let toml = "[account]\njid = \"user@example.com\"\npassword = @secret\n";
        match parse_without_env(toml).unwrap_err() {
            ConfigError::InvalidToml { line, .. } => assert_eq!(line, 3),
            other => panic!("expected InvalidToml, got: {other}"),
        }
    }

    #[test]
    fn overrides_take_precedence() {
        let overrides = ConfigOverrides {
            jid: Some("other@example.org".to_string()),
            password: None,
            server: Some("xmpp.example.org".to_string()),
            log_level: Some("trace".to_string()),
        };
        let config = load_config_from_str_with_overrides(minimal_toml(), overrides).unwrap();

        assert_eq!(config.account.jid, "other@example.org");
        assert_eq!(config.account.server.as_deref(), Some("xmpp.example.org"));
        assert_eq!(config.logging.level, "trace");
    }

    #[test]
    fn default_config_file_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");
        create_default_config(&path).unwrap();

        let written = std::fs::read_to_string(&path).unwrap();
        let config: Config = toml::from_str(&written).unwrap();
        assert!(config.account.jid.is_empty());
        assert!(matches!(
            validate(&config),
            Err(ConfigError::MissingRequiredFields { .. })
        ));
    }
}
