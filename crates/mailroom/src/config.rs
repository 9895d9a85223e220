//! Server configuration.
//!
//! Read from a TOML file (every section optional), then overridden by
//! `MAILROOM_*` environment variables, then validated.
//!
//! ```toml
//! [server]
//! bind = "127.0.0.1:8080"
//!
//! [relay]
//! enabled = true
//! host = "smtp.example.com"
//! security = "starttls"
//!
//! [mail]
//! domains = ["example.com"]
//! ```

use mailroom_core::service::AuthConfig;
use mailroom_queue::{ConsumerConfig, RetryPolicy};
use mailroom_smtp::{Credentials, ReceiverConfig, Security, TransportConfig};
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Environment variable naming the config file.
pub const CONFIG_ENV: &str = "MAILROOM_CONFIG";
/// Config file used when [`CONFIG_ENV`] is unset.
pub const DEFAULT_CONFIG_PATH: &str = "mailroom.toml";

/// Why the configuration could not be loaded.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The file exists but could not be read.
    #[error("cannot read {path}: {source}")]
    Read {
        /// File path.
        path: String,
        /// Cause.
        source: std::io::Error,
    },
    /// The file is not valid TOML for [`Config`].
    #[error("cannot parse {path}: {source}")]
    Parse {
        /// File path.
        path: String,
        /// Cause.
        source: toml::de::Error,
    },
    /// An environment override has the wrong shape.
    #[error("{name}: {message}")]
    Env {
        /// Variable name.
        name: String,
        /// What is wrong.
        message: String,
    },
    /// A setting is out of range.
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Complete configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// HTTP listener.
    pub server: ServerConfig,
    /// Storage files.
    pub database: DatabaseConfig,
    /// Outbound SMTP relay.
    pub relay: RelayConfig,
    /// Inbound SMTP receiver.
    pub inbound: InboundConfig,
    /// Topic log and workers.
    pub queue: QueueConfig,
    /// Sessions and password hashing.
    pub auth: AuthSection,
    /// Local mail domains and scheduling.
    pub mail: MailConfig,
}

/// `[server]`
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServerConfig {
    /// Address of the HTTP API.
    pub bind: SocketAddr,
    /// Largest accepted request body.
    pub max_body_bytes: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([127, 0, 0, 1], 8080)),
            max_body_bytes: 40 * 1024 * 1024,
        }
    }
}

/// `[database]`
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DatabaseConfig {
    /// Users, emails and everything else.
    pub path: String,
    /// The topic log.
    pub queue_path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: "mailroom.db".to_string(),
            queue_path: "mailroom-queue.db".to_string(),
        }
    }
}

/// Relay connection security, as written in the config file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RelaySecurity {
    /// Plain TCP.
    None,
    /// Implicit TLS.
    Tls,
    /// STARTTLS upgrade.
    #[default]
    StartTls,
}

impl From<RelaySecurity> for Security {
    fn from(value: RelaySecurity) -> Self {
        match value {
            RelaySecurity::None => Self::None,
            RelaySecurity::Tls => Self::Tls,
            RelaySecurity::StartTls => Self::StartTls,
        }
    }
}

/// `[relay]`
#[derive(Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RelayConfig {
    /// Deliver remote mail through the relay. When off, remote recipients
    /// bounce.
    pub enabled: bool,
    /// Relay host.
    pub host: String,
    /// Relay port; the security mode's default when absent.
    pub port: Option<u16>,
    /// Connection security.
    pub security: RelaySecurity,
    /// AUTH user.
    pub username: Option<String>,
    /// AUTH password.
    pub password: Option<String>,
    /// EHLO name; the first local domain when absent.
    pub hello_name: Option<String>,
    /// Timeout of each network step, in seconds.
    pub timeout_secs: Option<u64>,
}

impl std::fmt::Debug for RelayConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayConfig")
            .field("enabled", &self.enabled)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("security", &self.security)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .finish_non_exhaustive()
    }
}

impl RelayConfig {
    /// Settings for the SMTP client.
    #[must_use]
    pub fn transport(&self, default_hello: &str) -> TransportConfig {
        let mut config = TransportConfig::new(self.host.clone(), self.security.into());
        if let Some(port) = self.port {
            config.port = port;
        }
        if let (Some(username), Some(password)) = (&self.username, &self.password) {
            config.credentials = Some(Credentials {
                username: username.clone(),
                password: password.clone(),
            });
        }
        config.hello_name = self
            .hello_name
            .clone()
            .unwrap_or_else(|| default_hello.to_string());
        if let Some(secs) = self.timeout_secs {
            config.timeout = Duration::from_secs(secs);
        }
        config
    }
}

/// `[inbound]`
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct InboundConfig {
    /// Run the SMTP receiver.
    pub enabled: bool,
    /// Receiver address.
    pub bind: SocketAddr,
    /// Name in the greeting; the first local domain when absent.
    pub hostname: Option<String>,
    /// Largest accepted message.
    pub max_message_bytes: usize,
    /// Most recipients per message.
    pub max_recipients: usize,
    /// Concurrent sessions.
    pub max_connections: usize,
}

impl Default for InboundConfig {
    fn default() -> Self {
        let defaults = ReceiverConfig::default();
        Self {
            enabled: false,
            bind: SocketAddr::from(([0, 0, 0, 0], 2525)),
            hostname: None,
            max_message_bytes: defaults.max_message_bytes,
            max_recipients: defaults.max_recipients,
            max_connections: defaults.max_connections,
        }
    }
}

impl InboundConfig {
    /// Settings for the SMTP receiver.
    #[must_use]
    pub fn receiver(&self, default_hostname: &str) -> ReceiverConfig {
        ReceiverConfig {
            hostname: self
                .hostname
                .clone()
                .unwrap_or_else(|| default_hostname.to_string()),
            max_message_bytes: self.max_message_bytes,
            max_recipients: self.max_recipients,
            max_connections: self.max_connections,
            ..ReceiverConfig::default()
        }
    }
}

/// `[queue]`
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct QueueConfig {
    /// Partitions of each topic.
    pub partitions: i32,
    /// Send worker tasks; each is one consumer group member.
    pub send_workers: usize,
    /// Receive worker tasks.
    pub receive_workers: usize,
    /// Idle pause between polls, in milliseconds.
    pub poll_interval_ms: u64,
    /// Records per poll.
    pub batch_size: usize,
    /// Attempts per record, the first included.
    pub max_attempts: u32,
    /// First retry delay, in milliseconds.
    pub initial_backoff_ms: u64,
    /// Retry delay cap, in milliseconds.
    pub max_backoff_ms: u64,
    /// Retry delay growth.
    pub backoff_multiplier: f64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            partitions: 4,
            send_workers: 2,
            receive_workers: 1,
            poll_interval_ms: 500,
            batch_size: 50,
            max_attempts: 5,
            initial_backoff_ms: 30_000,
            max_backoff_ms: 30 * 60_000,
            backoff_multiplier: 2.0,
        }
    }
}

impl QueueConfig {
    /// Retry policy of the workers.
    #[must_use]
    pub const fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            initial_backoff: Duration::from_millis(self.initial_backoff_ms),
            max_backoff: Duration::from_millis(self.max_backoff_ms),
            multiplier: self.backoff_multiplier,
        }
    }

    /// Consumer settings of the workers.
    #[must_use]
    pub fn consumer(&self) -> ConsumerConfig {
        ConsumerConfig {
            max_poll_records: self.batch_size,
            poll_interval: Duration::from_millis(self.poll_interval_ms),
            ..ConsumerConfig::default()
        }
    }
}

/// `[auth]`
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AuthSection {
    /// Session lifetime, in hours.
    pub session_ttl_hours: u64,
    /// Argon2 memory cost, in KiB.
    pub password_memory_kib: u32,
    /// Argon2 iterations.
    pub password_iterations: u32,
}

impl Default for AuthSection {
    fn default() -> Self {
        let defaults = AuthConfig::default();
        Self {
            session_ttl_hours: defaults.session_ttl.as_secs() / 3600,
            password_memory_kib: defaults.password_memory_kib,
            password_iterations: defaults.password_iterations,
        }
    }
}

impl AuthSection {
    /// Settings of the auth service.
    #[must_use]
    pub const fn auth(&self) -> AuthConfig {
        AuthConfig {
            session_ttl: Duration::from_secs(self.session_ttl_hours * 3600),
            password_memory_kib: self.password_memory_kib,
            password_iterations: self.password_iterations,
        }
    }
}

/// `[mail]`
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MailConfig {
    /// Domains whose mailboxes live here.
    pub domains: Vec<String>,
    /// Scheduler period, in seconds.
    pub schedule_interval_secs: u64,
    /// Schedules dispatched per scheduler tick.
    pub schedule_batch: u32,
}

impl Default for MailConfig {
    fn default() -> Self {
        Self {
            domains: vec!["localhost".to_string()],
            schedule_interval_secs: 15,
            schedule_batch: 100,
        }
    }
}

impl Config {
    /// Loads the file named by `MAILROOM_CONFIG` (or `mailroom.toml`),
    /// applies environment overrides and validates the result. A missing
    /// file means all defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if the file is unreadable or malformed, or the
    /// result is invalid.
    pub fn load() -> Result<Self, ConfigError> {
        let path = std::env::var(CONFIG_ENV).unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
        let mut config = Self::from_file(Path::new(&path))?;
        config.apply_env(|name| std::env::var(name).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Reads a config file; defaults if it does not exist.
    ///
    /// # Errors
    ///
    /// Returns an error if the file is unreadable or malformed.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = match std::fs::read_to_string(path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(source) => {
                return Err(ConfigError::Read {
                    path: path.display().to_string(),
                    source,
                });
            }
        };
        Self::from_toml(&text).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })
    }

    /// Parses TOML text.
    ///
    /// # Errors
    ///
    /// Returns the TOML error for malformed input or unknown keys.
    pub fn from_toml(text: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(text)
    }

    /// Applies `MAILROOM_*` overrides read through `var`.
    ///
    /// # Errors
    ///
    /// Returns an error for an override that does not parse.
    pub fn apply_env<F>(&mut self, var: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(bind) = parsed(&var, "MAILROOM_BIND")? {
            self.server.bind = bind;
        }
        if let Some(path) = var("MAILROOM_DATABASE") {
            self.database.path = path;
        }
        if let Some(path) = var("MAILROOM_QUEUE_DATABASE") {
            self.database.queue_path = path;
        }
        if let Some(host) = var("MAILROOM_SMTP_HOST") {
            self.relay.enabled = !host.trim().is_empty();
            self.relay.host = host;
        }
        if let Some(port) = parsed(&var, "MAILROOM_SMTP_PORT")? {
            self.relay.port = Some(port);
        }
        if let Some(username) = var("MAILROOM_SMTP_USERNAME") {
            self.relay.username = Some(username);
        }
        if let Some(password) = var("MAILROOM_SMTP_PASSWORD") {
            self.relay.password = Some(password);
        }
        if let Some(bind) = parsed(&var, "MAILROOM_INBOUND_BIND")? {
            self.inbound.enabled = true;
            self.inbound.bind = bind;
        }
        if let Some(domains) = var("MAILROOM_DOMAINS") {
            self.mail.domains = domains
                .split(',')
                .map(str::trim)
                .filter(|d| !d.is_empty())
                .map(String::from)
                .collect();
        }
        Ok(())
    }

    /// Checks value ranges.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] naming the first bad setting.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |message: &str| Err(ConfigError::Invalid(message.to_string()));
        if self.server.bind.port() == 0 {
            return invalid("server.bind needs a port");
        }
        if self.database.path.trim().is_empty() || self.database.queue_path.trim().is_empty() {
            return invalid("database paths must not be empty");
        }
        if self.relay.enabled {
            if self.relay.host.trim().is_empty() {
                return invalid("relay.host is required when the relay is enabled");
            }
            if self.relay.port == Some(0) {
                return invalid("relay.port must not be 0");
            }
            if self.relay.username.is_some() != self.relay.password.is_some() {
                return invalid("relay.username and relay.password go together");
            }
        }
        if self.inbound.enabled && self.inbound.bind.port() == 0 {
            return invalid("inbound.bind needs a port");
        }
        if !(1..=mailroom_queue::MAX_PARTITIONS).contains(&self.queue.partitions) {
            return invalid("queue.partitions must be between 1 and 256");
        }
        if self.queue.send_workers == 0 || self.queue.receive_workers == 0 {
            return invalid("queue needs at least one send and one receive worker");
        }
        if self.queue.batch_size == 0 {
            return invalid("queue.batch_size must be at least 1");
        }
        if self.queue.max_attempts == 0 {
            return invalid("queue.max_attempts must be at least 1");
        }
        if !self.queue.backoff_multiplier.is_finite() || self.queue.backoff_multiplier < 1.0 {
            return invalid("queue.backoff_multiplier must be at least 1");
        }
        if self.auth.session_ttl_hours == 0 {
            return invalid("auth.session_ttl_hours must be at least 1");
        }
        if self.mail.domains.iter().all(|d| d.trim().is_empty()) {
            return invalid("mail.domains must name at least one domain");
        }
        if self.mail.schedule_interval_secs == 0 {
            return invalid("mail.schedule_interval_secs must be at least 1");
        }
        Ok(())
    }

    /// First local domain, used as the default SMTP identity.
    #[must_use]
    pub fn primary_domain(&self) -> &str {
        self.mail
            .domains
            .iter()
            .map(|d| d.trim())
            .find(|d| !d.is_empty())
            .unwrap_or("localhost")
    }
}

fn parsed<T, F>(var: &F, name: &str) -> Result<Option<T>, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    var(name)
        .map(|raw| {
            raw.trim().parse().map_err(|e: T::Err| ConfigError::Env {
                name: name.to_string(),
                message: e.to_string(),
            })
        })
        .transpose()
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn defaults_are_valid() {
        let config = Config::default();
        config.validate().unwrap();
        assert!(!config.relay.enabled);
        assert!(!config.inbound.enabled);
        assert_eq!(config.primary_domain(), "localhost");
    }

    #[test]
    fn parses_sections() {
        let config = Config::from_toml(
            r#"
            [server]
            bind = "0.0.0.0:9000"

            [relay]
            enabled = true
            host = "smtp.example.com"
            security = "tls"
            username = "ada"
            password = "secret"

            [queue]
            partitions = 8
            max_attempts = 3

            [mail]
            domains = ["example.com", "example.net"]
            "#,
        )
        .unwrap();
        config.validate().unwrap();
        assert_eq!(config.server.bind.port(), 9000);
        assert_eq!(config.queue.partitions, 8);
        assert_eq!(config.queue.retry_policy().max_attempts, 3);
        assert_eq!(config.primary_domain(), "example.com");

        let transport = config.relay.transport("mx.example.com");
        assert_eq!(transport.port, 465);
        assert_eq!(transport.security, Security::Tls);
        assert_eq!(transport.hello_name, "mx.example.com");
        assert_eq!(transport.credentials.unwrap().username, "ada");
    }

    #[test]
    fn unknown_keys_are_rejected() {
        assert!(Config::from_toml("[server]\nbnd = \"x\"").is_err());
        assert!(Config::from_toml("[nope]").is_err());
    }

    #[test]
    fn missing_file_means_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::from_file(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(config.database.path, "mailroom.db");
    }

    #[test]
    fn environment_overrides() {
        let vars: HashMap<&str, &str> = [
            ("MAILROOM_BIND", "127.0.0.1:3000"),
            ("MAILROOM_SMTP_HOST", "relay.example.org"),
            ("MAILROOM_SMTP_PORT", "2587"),
            ("MAILROOM_INBOUND_BIND", "127.0.0.1:2526"),
            ("MAILROOM_DOMAINS", "example.com, ,example.org"),
        ]
        .into_iter()
        .collect();
        let mut config = Config::default();
        config
            .apply_env(|name| vars.get(name).map(|v| (*v).to_string()))
            .unwrap();
        config.validate().unwrap();
        assert_eq!(config.server.bind.port(), 3000);
        assert!(config.relay.enabled);
        assert_eq!(config.relay.port, Some(2587));
        assert!(config.inbound.enabled);
        assert_eq!(config.mail.domains, vec!["example.com", "example.org"]);

        let mut config = Config::default();
        let err = config
            .apply_env(|name| (name == "MAILROOM_SMTP_PORT").then(|| "many".to_string()))
            .unwrap_err();
        assert!(matches!(err, ConfigError::Env { .. }));
    }

    #[test]
    fn validation_catches_bad_values() {
        let mut config = Config::default();
        config.relay.enabled = true;
        assert!(config.validate().is_err());
        config.relay.host = "smtp.example.com".into();
        config.validate().unwrap();

        config.queue.partitions = 0;
        assert!(config.validate().is_err());
        config.queue.partitions = 2;
        config.queue.max_attempts = 0;
        assert!(config.validate().is_err());
        config.queue.max_attempts = 1;
        config.mail.domains = vec![" ".into()];
        assert!(config.validate().is_err());
    }
}
