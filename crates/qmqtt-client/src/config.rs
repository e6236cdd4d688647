//! Client configuration types.
//!
//! Built in code with the builder methods on [`ClientConfig`], or loaded
//! with [`ClientConfig::load`] from:
//! - a TOML file, with in-file substitution of `${VAR}` or `${VAR:-default}`
//! - environment variables with the `QMQTT__` prefix (double underscore for
//!   nesting), e.g. `QMQTT__KEEP_ALIVE=30`, `QMQTT__RECONNECT__ENABLED=true`

use std::path::Path;
use std::sync::OnceLock;
use std::time::Duration;

use config::{Environment, File, FileFormat};
use qmqtt_core::topic::validate_topic_name;
use qmqtt_core::{QoS, Will};
use regex::Regex;
use serde::{Deserialize, Deserializer};

use crate::error::{ClientError, Result};

/// Default keep-alive in seconds.
pub const DEFAULT_KEEP_ALIVE: u16 = 60;
/// Default time allowed between CONNECT and CONNACK.
pub const DEFAULT_CONNACK_TIMEOUT: Duration = Duration::from_secs(30);
/// Default time allowed for opening the transport.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
/// Default time a single flush may block on transport backpressure.
pub const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_secs(10);

/// Client configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Remote broker address (host:port).
    pub address: String,
    /// Client identifier.
    pub client_id: String,
    /// Username for authentication.
    pub username: Option<String>,
    /// Password for authentication. Requires a username.
    pub password: Option<String>,
    /// Keep-alive interval in seconds (0 = disabled).
    pub keep_alive: u16,
    /// Clean session flag.
    pub clean_session: bool,
    /// Last will, sent once in CONNECT.
    #[serde(deserialize_with = "deserialize_will")]
    pub will: Option<Will>,
    /// Time allowed between CONNECT and CONNACK.
    #[serde(rename = "connack_timeout_ms", deserialize_with = "deserialize_millis")]
    pub connack_timeout: Duration,
    /// Time allowed for opening the transport.
    #[serde(rename = "connect_timeout_ms", deserialize_with = "deserialize_millis")]
    pub connect_timeout: Duration,
    /// Time a single flush may block before the connection counts as lost.
    #[serde(rename = "write_timeout_ms", deserialize_with = "deserialize_millis")]
    pub write_timeout: Duration,
    /// Reconnection policy.
    pub reconnect: ReconnectConfig,
    /// Log level used by binaries embedding the client.
    pub log_level: String,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            address: "localhost:1883".to_string(),
            client_id: String::new(),
            username: None,
            password: None,
            keep_alive: DEFAULT_KEEP_ALIVE,
            clean_session: true,
            will: None,
            connack_timeout: DEFAULT_CONNACK_TIMEOUT,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            write_timeout: DEFAULT_WRITE_TIMEOUT,
            reconnect: ReconnectConfig::default(),
            log_level: "info".to_string(),
        }
    }
}

impl ClientConfig {
    /// Create a new config with the given address.
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            ..Default::default()
        }
    }

    /// Set the client ID.
    pub fn client_id(mut self, id: impl Into<String>) -> Self {
        self.client_id = id.into();
        self
    }

    /// Set username and password.
    pub fn credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self.password = Some(password.into());
        self
    }

    /// Set keep-alive interval in seconds.
    pub fn keep_alive(mut self, seconds: u16) -> Self {
        self.keep_alive = seconds;
        self
    }

    /// Set clean session flag.
    pub fn clean_session(mut self, clean: bool) -> Self {
        self.clean_session = clean;
        self
    }

    /// Attach a last will message.
    pub fn will(mut self, will: Will) -> Self {
        self.will = Some(will);
        self
    }

    /// Set the CONNACK timeout.
    pub fn connack_timeout(mut self, timeout: Duration) -> Self {
        self.connack_timeout = timeout;
        self
    }

    /// Set the transport connect timeout.
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Set the per-flush write timeout.
    pub fn write_timeout(mut self, timeout: Duration) -> Self {
        self.write_timeout = timeout;
        self
    }

    /// Set the reconnection policy.
    pub fn reconnect(mut self, reconnect: ReconnectConfig) -> Self {
        self.reconnect = reconnect;
        self
    }

    /// Keep-alive as a duration, `None` when disabled.
    pub(crate) fn keep_alive_interval(&self) -> Option<Duration> {
        (self.keep_alive > 0).then(|| Duration::from_secs(self.keep_alive as u64))
    }

    /// Load configuration from a TOML file with environment variable overrides.
    ///
    /// A missing file is not an error; defaults and the environment still
    /// apply.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = if path.as_os_str().is_empty() || !path.exists() {
            None
        } else {
            Some(std::fs::read_to_string(path)?)
        };
        Self::build(content.as_deref(), true)
    }

    /// Parse configuration from a TOML string, ignoring the environment.
    pub fn parse(content: &str) -> Result<Self> {
        Self::build(Some(content), false)
    }

    fn build(content: Option<&str>, with_env: bool) -> Result<Self> {
        let mut builder = config::Config::builder();

        if let Some(content) = content {
            let substituted = substitute_env_vars(content);
            builder = builder.add_source(File::from_str(&substituted, FileFormat::Toml));
        }

        // QMQTT__KEEP_ALIVE, QMQTT__RECONNECT__ENABLED, etc.
        if with_env {
            builder = builder.add_source(
                Environment::with_prefix("QMQTT")
                    .separator("__")
                    .try_parsing(true),
            );
        }

        let config: ClientConfig = builder
            .build()
            .and_then(|cfg| cfg.try_deserialize())
            .map_err(|e| ClientError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.password.is_some() && self.username.is_none() {
            return Err(ClientError::Config(
                "password requires a username".to_string(),
            ));
        }
        if let Some(ref will) = self.will {
            validate_topic_name(&will.topic)
                .map_err(|e| ClientError::Config(format!("will topic: {}", e)))?;
        }
        for (name, timeout) in [
            ("connack_timeout", self.connack_timeout),
            ("connect_timeout", self.connect_timeout),
            ("write_timeout", self.write_timeout),
        ] {
            if timeout.is_zero() {
                return Err(ClientError::Config(format!("{} must be positive", name)));
            }
        }
        self.reconnect.validate()
    }
}

/// Reconnection policy with exponential backoff.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ReconnectConfig {
    /// Reconnect after a lost connection or CONNACK timeout.
    pub enabled: bool,
    /// Delay before the first attempt.
    #[serde(rename = "initial_delay_ms", deserialize_with = "deserialize_millis")]
    pub initial_delay: Duration,
    /// Upper bound for the delay.
    #[serde(rename = "max_delay_ms", deserialize_with = "deserialize_millis")]
    pub max_delay: Duration,
    /// Growth factor between attempts.
    pub multiplier: f64,
    /// Random spread applied to each delay, as a fraction in `[0, 1]`.
    pub jitter: f64,
    /// Give up after this many consecutive attempts (0 = never).
    pub max_attempts: u32,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            multiplier: 2.0,
            jitter: 0.1,
            max_attempts: 0,
        }
    }
}

impl ReconnectConfig {
    /// Default policy with reconnection turned on.
    pub fn enabled() -> Self {
        Self {
            enabled: true,
            ..Default::default()
        }
    }

    fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.jitter) {
            return Err(ClientError::Config(format!(
                "reconnect.jitter must be within [0, 1], got {}",
                self.jitter
            )));
        }
        if self.multiplier < 1.0 {
            return Err(ClientError::Config(format!(
                "reconnect.multiplier must be at least 1, got {}",
                self.multiplier
            )));
        }
        if self.initial_delay > self.max_delay {
            return Err(ClientError::Config(
                "reconnect.initial_delay_ms exceeds reconnect.max_delay_ms".to_string(),
            ));
        }
        Ok(())
    }
}

/// Substitute environment variables in a string.
/// Supports `${VAR}` and `${VAR:-default}` syntax.
fn substitute_env_vars(content: &str) -> String {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    let Some(re) = PATTERN
        .get_or_init(|| Regex::new(r"\$\{([^}:]+)(?::-([^}]*))?\}").ok())
        .as_ref()
    else {
        return content.to_string();
    };
    re.replace_all(content, |caps: &regex::Captures| {
        let var_name = &caps[1];
        let default = caps.get(2).map(|m| m.as_str()).unwrap_or("");
        std::env::var(var_name).unwrap_or_else(|_| default.to_string())
    })
    .to_string()
}

fn deserialize_millis<'de, D>(deserializer: D) -> std::result::Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    u64::deserialize(deserializer).map(Duration::from_millis)
}

/// Will as written in a config file.
#[derive(Deserialize)]
struct WillEntry {
    topic: String,
    #[serde(default)]
    payload: String,
    #[serde(default)]
    qos: u8,
    #[serde(default)]
    retain: bool,
}

fn deserialize_will<'de, D>(deserializer: D) -> std::result::Result<Option<Will>, D::Error>
where
    D: Deserializer<'de>,
{
    let Some(entry) = Option::<WillEntry>::deserialize(deserializer)? else {
        return Ok(None);
    };
    let qos = QoS::try_from(entry.qos).map_err(serde::de::Error::custom)?;
    Ok(Some(
        Will::new(entry.topic, entry.payload)
            .qos(qos)
            .retain(entry.retain),
    ))
}
