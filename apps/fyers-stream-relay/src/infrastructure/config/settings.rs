//! Relay Configuration Settings
//!
//! Configuration types for the relay, loaded from environment variables.

use std::time::Duration;

use crate::application::services::{RelayOptions, UntaggedTickPolicy, UpstreamEndpoint};

/// Deployment environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Environment {
    /// Local development.
    #[default]
    Development,
    /// Production deployment.
    Production,
}

impl Environment {
    /// Parse environment from string.
    #[must_use]
    pub fn from_str_case_insensitive(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "production" | "prod" => Self::Production,
            _ => Self::Development,
        }
    }

    /// Get the environment name.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Development => "development",
            Self::Production => "production",
        }
    }
}

/// Fyers application credentials.
#[derive(Clone)]
pub struct AppCredentials {
    /// Application (client) id, e.g. `XJ12345-100`.
    pub app_id: String,
    /// Application secret.
    pub app_secret: String,
    /// Redirect URI registered with the application.
    pub redirect_uri: String,
}

impl AppCredentials {
    /// Create credentials, rejecting empty values.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::EmptyValue` naming the first empty field.
    pub fn new(
        app_id: impl Into<String>,
        app_secret: impl Into<String>,
        redirect_uri: impl Into<String>,
    ) -> Result<Self, ConfigError> {
        let credentials = Self {
            app_id: app_id.into(),
            app_secret: app_secret.into(),
            redirect_uri: redirect_uri.into(),
        };

        for (name, value) in [
            (ENV_APP_ID, &credentials.app_id),
            (ENV_APP_SECRET, &credentials.app_secret),
            (ENV_REDIRECT_URI, &credentials.redirect_uri),
        ] {
            if value.trim().is_empty() {
                return Err(ConfigError::EmptyValue(name.to_string()));
            }
        }

        Ok(credentials)
    }
}

impl std::fmt::Debug for AppCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppCredentials")
            .field("app_id", &self.app_id)
            .field("app_secret", &"[REDACTED]")
            .field("redirect_uri", &self.redirect_uri)
            .finish()
    }
}

/// HTTP listener settings.
#[derive(Debug, Clone)]
pub struct ServerSettings {
    /// Port for the consumer WebSocket, control plane and health routes.
    pub port: u16,
}

/// Upstream data socket settings.
#[derive(Debug, Clone)]
pub struct UpstreamSettings {
    /// Data socket base URL.
    pub socket_url: String,
    /// Maximum time to wait for the socket to open.
    pub connect_timeout: Duration,
    /// Keep-alive ping interval (`None` = disabled).
    pub ping_interval: Option<Duration>,
}

impl Default for UpstreamSettings {
    fn default() -> Self {
        Self {
            socket_url: "wss://socket.fyers.in/data-stream".to_string(),
            connect_timeout: Duration::from_secs(10),
            ping_interval: Some(Duration::from_secs(30)),
        }
    }
}

/// Login API settings.
#[derive(Debug, Clone)]
pub struct AuthSettings {
    /// Base URL for the OTP, TOTP and PIN stages.
    pub login_base_url: String,
    /// Base URL for the token stage and login page.
    pub api_base_url: String,
    /// Per-request timeout.
    pub request_timeout: Duration,
}

impl Default for AuthSettings {
    fn default() -> Self {
        Self {
            login_base_url: "https://api-t2.fyers.in/vagator/v2".to_string(),
            api_base_url: "https://api-t1.fyers.in/api/v3".to_string(),
            request_timeout: Duration::from_secs(15),
        }
    }
}

/// Fan-out settings.
#[derive(Debug, Clone)]
pub struct FanOutSettings {
    /// Per-consumer outbound queue capacity.
    pub consumer_buffer: usize,
    /// Relay command queue capacity.
    pub command_buffer: usize,
    /// What to do with ticks that name no instrument.
    pub untagged_ticks: UntaggedTickPolicy,
}

impl Default for FanOutSettings {
    fn default() -> Self {
        Self {
            consumer_buffer: 1024,
            command_buffer: 1024,
            untagged_ticks: UntaggedTickPolicy::default(),
        }
    }
}

/// Complete relay configuration.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Deployment environment.
    pub environment: Environment,
    /// Fyers application credentials.
    pub credentials: AppCredentials,
    /// HTTP listener settings.
    pub server: ServerSettings,
    /// Upstream data socket settings.
    pub upstream: UpstreamSettings,
    /// Login API settings.
    pub auth: AuthSettings,
    /// Fan-out settings.
    pub fanout: FanOutSettings,
}

const ENV_APP_ID: &str = "FYERS_APP_ID";
const ENV_APP_SECRET: &str = "FYERS_SECRET_KEY";
const ENV_REDIRECT_URI: &str = "FYERS_REDIRECT_URI";
const ENV_PORT: &str = "RELAY_PORT";

impl RelayConfig {
    /// Create configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error if required environment variables are missing or
    /// empty, the port is not a valid `u16`, or an enumerated setting has
    /// an unknown value.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Create configuration from an arbitrary key lookup.
    ///
    /// # Errors
    ///
    /// Same as [`RelayConfig::from_env`].
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let app_id = require(&lookup, ENV_APP_ID)?;
        let app_secret = require(&lookup, ENV_APP_SECRET)?;
        let redirect_uri = require(&lookup, ENV_REDIRECT_URI)?;
        let credentials = AppCredentials::new(app_id, app_secret, redirect_uri)?;

        let environment = lookup("ENVIRONMENT")
            .map(|s| Environment::from_str_case_insensitive(&s))
            .unwrap_or_default();

        let raw_port = require(&lookup, ENV_PORT)?;
        let server = ServerSettings {
            port: raw_port
                .trim()
                .parse()
                .map_err(|_| ConfigError::InvalidValue {
                    key: ENV_PORT.to_string(),
                    value: raw_port.clone(),
                })?,
        };

        let upstream_defaults = UpstreamSettings::default();
        let ping_secs = parse_u64(
            &lookup,
            "RELAY_UPSTREAM_PING_INTERVAL_SECS",
            upstream_defaults.ping_interval.map_or(0, |d| d.as_secs()),
        );
        let upstream = UpstreamSettings {
            socket_url: lookup("FYERS_SOCKET_URL")
                .filter(|v| !v.is_empty())
                .unwrap_or(upstream_defaults.socket_url),
            connect_timeout: parse_duration_secs(
                &lookup,
                "RELAY_UPSTREAM_CONNECT_TIMEOUT_SECS",
                upstream_defaults.connect_timeout,
            ),
            ping_interval: (ping_secs > 0).then(|| Duration::from_secs(ping_secs)),
        };

        let auth_defaults = AuthSettings::default();
        let auth = AuthSettings {
            login_base_url: lookup("FYERS_LOGIN_BASE_URL")
                .filter(|v| !v.is_empty())
                .unwrap_or(auth_defaults.login_base_url),
            api_base_url: lookup("FYERS_API_BASE_URL")
                .filter(|v| !v.is_empty())
                .unwrap_or(auth_defaults.api_base_url),
            request_timeout: parse_duration_secs(
                &lookup,
                "RELAY_AUTH_TIMEOUT_SECS",
                auth_defaults.request_timeout,
            ),
        };

        let fanout_defaults = FanOutSettings::default();
        let untagged_ticks = match lookup("RELAY_UNTAGGED_TICKS") {
            None => fanout_defaults.untagged_ticks,
            Some(value) => UntaggedTickPolicy::parse(&value).ok_or_else(|| {
                ConfigError::InvalidValue {
                    key: "RELAY_UNTAGGED_TICKS".to_string(),
                    value,
                }
            })?,
        };
        let fanout = FanOutSettings {
            consumer_buffer: parse_usize(
                &lookup,
                "RELAY_CONSUMER_BUFFER",
                fanout_defaults.consumer_buffer,
            )
            .max(1),
            command_buffer: parse_usize(
                &lookup,
                "RELAY_COMMAND_BUFFER",
                fanout_defaults.command_buffer,
            )
            .max(1),
            untagged_ticks,
        };

        Ok(Self {
            environment,
            credentials,
            server,
            upstream,
            auth,
            fanout,
        })
    }

    /// Relay event loop options derived from this configuration.
    #[must_use]
    pub fn relay_options(&self) -> RelayOptions {
        RelayOptions {
            endpoint: UpstreamEndpoint {
                socket_url: self.upstream.socket_url.clone(),
                app_id: self.credentials.app_id.clone(),
            },
            connect_timeout: self.upstream.connect_timeout,
            command_buffer: self.fanout.command_buffer,
            upstream_event_buffer: self.fanout.command_buffer,
            untagged_ticks: self.fanout.untagged_ticks,
        }
    }
}

/// Configuration error.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Required environment variable is missing.
    #[error("missing required environment variable: {0}")]
    MissingEnvVar(String),
    /// Environment variable has empty value.
    #[error("environment variable {0} cannot be empty")]
    EmptyValue(String),
    /// Environment variable has a value outside its allowed set.
    #[error("environment variable {key} has invalid value {value:?}")]
    InvalidValue {
        /// Variable name.
        key: String,
        /// Rejected value.
        value: String,
    },
}

fn require(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Result<String, ConfigError> {
    let value = lookup(key).ok_or_else(|| ConfigError::MissingEnvVar(key.to_string()))?;
    if value.trim().is_empty() {
        return Err(ConfigError::EmptyValue(key.to_string()));
    }
    Ok(value)
}

fn parse_or_default<T: std::str::FromStr + Copy + std::fmt::Debug>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: T,
) -> T {
    match lookup(key) {
        None => default,
        Some(raw) => raw.trim().parse().unwrap_or_else(|_| {
            tracing::warn!(key, value = %raw, default = ?default, "Invalid setting, using default");
            default
        }),
    }
}

fn parse_u64(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: u64) -> u64 {
    parse_or_default(lookup, key, default)
}

fn parse_usize(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: usize) -> usize {
    parse_or_default(lookup, key, default)
}

fn parse_duration_secs(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: Duration,
) -> Duration {
    Duration::from_secs(parse_u64(lookup, key, default.as_secs()))
}
