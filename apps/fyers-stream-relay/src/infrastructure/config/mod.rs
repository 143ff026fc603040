//! Configuration Module
//!
//! Configuration loading for the relay service.

mod settings;

pub use settings::{
    AppCredentials, AuthSettings, ConfigError, Environment, FanOutSettings, RelayConfig,
    ServerSettings, UpstreamSettings,
};
