//! Broker Configuration
//!
//! Connection settings shared by both sides of the relay.

use std::time::Duration;

use serde::Deserialize;

use super::ConfigError;

/// Default sensor-network (LoRa Server) broker URL
pub const DEFAULT_LORA_URL: &str = "tcp://localhost:1884";

/// Default platform broker URL
pub const DEFAULT_PLATFORM_URL: &str = "tcp://localhost:1883";

/// Port used when a broker URL has none
pub const DEFAULT_MQTT_PORT: u16 = 1883;

/// Resolved broker endpoint
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerAddress {
    /// Host name or IP address, IPv6 without brackets
    pub host: String,
    pub port: u16,
    /// Credentials given as `user:pass@` in the URL
    pub username: Option<String>,
    pub password: Option<String>,
}

impl std::fmt::Display for BrokerAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.connect_host(), self.port)
    }
}

impl BrokerAddress {
    /// Parse a broker URL.
    ///
    /// Accepts `tcp://`, `mqtt://` or no scheme, optional `user[:pass]@`
    /// userinfo, a host name, IPv4 or bracketed IPv6 address, and an
    /// optional port. TLS and WebSocket schemes are rejected.
    pub fn parse(url: &str) -> Result<Self, ConfigError> {
        let url = url.trim();
        let invalid = |what: &str| {
            ConfigError::Validation(format!("{} in broker URL '{}'", what, url))
        };

        let rest = match url.split_once("://") {
            Some(("tcp" | "mqtt", rest)) => rest,
            Some((scheme, _)) => {
                return Err(invalid(&format!("unsupported scheme '{}'", scheme)));
            }
            None => url,
        };

        // Drop any trailing path
        let authority = rest.split('/').next().unwrap_or_default();

        let (userinfo, hostport) = match authority.rsplit_once('@') {
            Some((userinfo, hostport)) => (Some(userinfo), hostport),
            None => (None, authority),
        };

        let (username, password) = match userinfo {
            Some(userinfo) => {
                let (user, pass) = match userinfo.split_once(':') {
                    Some((user, pass)) => (user, Some(pass.to_string())),
                    None => (userinfo, None),
                };
                if user.is_empty() {
                    return Err(invalid("empty username"));
                }
                (Some(user.to_string()), pass)
            }
            None => (None, None),
        };

        let (host, port) = if let Some(bracketed) = hostport.strip_prefix('[') {
            let (host, after) = bracketed
                .split_once(']')
                .ok_or_else(|| invalid("unterminated IPv6 address"))?;
            let port = match after {
                "" => None,
                _ => Some(
                    after
                        .strip_prefix(':')
                        .ok_or_else(|| invalid(&format!("unexpected '{}' after host", after)))?,
                ),
            };
            (host, port)
        } else {
            match hostport.split_once(':') {
                Some((host, port)) => (host, Some(port)),
                None => (hostport, None),
            }
        };

        let port = match port {
            Some(port_str) => port_str
                .parse::<u16>()
                .map_err(|_| invalid(&format!("invalid port '{}'", port_str)))?,
            None => DEFAULT_MQTT_PORT,
        };

        if host.is_empty() {
            return Err(invalid("missing host"));
        }

        Ok(Self {
            host: host.to_string(),
            port,
            username,
            password,
        })
    }

    /// Host in the form the MQTT client connects to, IPv6 re-bracketed
    pub fn connect_host(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]", self.host)
        } else {
            self.host.clone()
        }
    }
}

/// Configuration for one broker session
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    /// Broker URL (`tcp://[user[:pass]@]host:port`).
    /// Omitted in a config file, it falls back to the role's default URL.
    #[serde(default)]
    pub url: String,

    /// Username for authentication
    pub username: Option<String>,

    /// Password for authentication
    pub password: Option<String>,

    /// Client ID, generated from role, hostname and pid when unset
    pub client_id: Option<String>,

    /// Keep-alive interval in seconds
    pub keep_alive: u16,

    /// Start without a persisted session on the broker
    pub clean_session: bool,

    /// Connection timeout in seconds
    pub connect_timeout: u64,

    /// Initial reconnect delay in seconds
    pub reconnect_interval: u64,

    /// Maximum reconnect delay in seconds (for exponential backoff)
    pub max_reconnect_interval: u64,

    /// Consecutive failed reconnects before giving up (0 = retry forever)
    pub max_reconnect_attempts: u32,

    /// Time allowed for in-flight work to drain on disconnect
    #[serde(with = "humantime_serde")]
    pub disconnect_grace: Duration,

    /// Capacity of the request queue between callers and the event loop
    pub request_capacity: usize,
}

fn default_keep_alive() -> u16 {
    30
}

fn default_connect_timeout() -> u64 {
    30
}

fn default_reconnect_interval() -> u64 {
    1
}

fn default_max_reconnect_interval() -> u64 {
    60
}

fn default_disconnect_grace() -> Duration {
    Duration::from_millis(250)
}

fn default_request_capacity() -> usize {
    1024
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            url: DEFAULT_PLATFORM_URL.to_string(),
            username: None,
            password: None,
            client_id: None,
            keep_alive: default_keep_alive(),
            clean_session: true,
            connect_timeout: default_connect_timeout(),
            reconnect_interval: default_reconnect_interval(),
            max_reconnect_interval: default_max_reconnect_interval(),
            max_reconnect_attempts: 0,
            disconnect_grace: default_disconnect_grace(),
            request_capacity: default_request_capacity(),
        }
    }
}

impl BrokerConfig {
    /// Defaults for the sensor-network side
    pub fn lora_default() -> Self {
        Self {
            url: DEFAULT_LORA_URL.to_string(),
            ..Default::default()
        }
    }

    /// Defaults for the platform side
    pub fn platform_default() -> Self {
        Self::default()
    }

    /// Create a config pointing at `url` with default settings
    pub fn with_url(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Default::default()
        }
    }

    /// Parse the URL into host and port
    pub fn address(&self) -> Result<BrokerAddress, ConfigError> {
        BrokerAddress::parse(&self.url)
    }

    /// Client ID to present to the broker
    pub fn effective_client_id(&self, role: &str) -> String {
        self.client_id.clone().unwrap_or_else(|| {
            let host = hostname::get()
                .ok()
                .and_then(|h| h.into_string().ok())
                .unwrap_or_else(|| "localhost".to_string());
            format!("lora-adapter-{}-{}-{}", role, host, std::process::id())
        })
    }

    /// Username and password to authenticate with. The `username` and
    /// `password` settings take precedence over userinfo in the URL.
    pub fn credentials(&self) -> Result<Option<(String, String)>, ConfigError> {
        let address = self.address()?;
        let Some(username) = self.username.clone().or(address.username) else {
            return Ok(None);
        };
        let password = self
            .password
            .clone()
            .or(address.password)
            .unwrap_or_default();
        Ok(Some((username, password)))
    }

    /// Get the keep-alive interval as Duration
    pub fn keep_alive_duration(&self) -> Duration {
        Duration::from_secs(self.keep_alive as u64)
    }

    /// Get the connect timeout as Duration
    pub fn connect_timeout_duration(&self) -> Duration {
        Duration::from_secs(self.connect_timeout)
    }

    /// Get the reconnect interval as Duration
    pub fn reconnect_interval_duration(&self) -> Duration {
        Duration::from_secs(self.reconnect_interval)
    }

    /// Get the max reconnect interval as Duration
    pub fn max_reconnect_interval_duration(&self) -> Duration {
        Duration::from_secs(self.max_reconnect_interval)
    }

    /// Validate the broker section named `section`
    pub fn validate(&self, section: &str) -> Result<(), ConfigError> {
        self.address()
            .map_err(|e| ConfigError::Validation(format!("{}.url: {}", section, e)))?;

        if self.password.is_some() && self.credentials()?.is_none() {
            return Err(ConfigError::Validation(format!(
                "{}.password requires {}.username",
                section, section
            )));
        }

        if self.keep_alive != 0 && self.keep_alive < 5 {
            return Err(ConfigError::Validation(format!(
                "{}.keep_alive must be 0 or at least 5 seconds",
                section
            )));
        }

        if self.connect_timeout == 0 {
            return Err(ConfigError::Validation(format!(
                "{}.connect_timeout must be greater than 0",
                section
            )));
        }

        if self.reconnect_interval == 0 {
            return Err(ConfigError::Validation(format!(
                "{}.reconnect_interval must be greater than 0",
                section
            )));
        }

        if self.max_reconnect_interval < self.reconnect_interval {
            return Err(ConfigError::Validation(format!(
                "{}.max_reconnect_interval must not be less than reconnect_interval",
                section
            )));
        }

        if self.request_capacity == 0 {
            return Err(ConfigError::Validation(format!(
                "{}.request_capacity must be greater than 0",
                section
            )));
        }

        Ok(())
    }
}
