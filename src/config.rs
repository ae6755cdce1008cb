//! Runtime configuration.
//!
//! Values come from the environment (a `.env` file is honored through
//! `dotenvy`); CLI flags in `main.rs` override individual fields.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

use secrecy::SecretString;
use url::Url;

use crate::error::ConfigError;

/// Default bind address, same port the bridge has always listened on.
pub const DEFAULT_LISTEN_ADDR: &str = "0.0.0.0:7000";

/// Default server suffix appended to `mobile_no`.
pub const DEFAULT_ADDRESS_DOMAIN: &str = "s.whatsapp.net";

/// What to do when a previously paired identity fails to reconnect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReconnectFallback {
    /// Report the failure and stay unpaired.
    #[default]
    Fail,
    /// Discard the stale identity and start a fresh pairing flow.
    Repair,
}

impl FromStr for ReconnectFallback {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "fail" => Ok(Self::Fail),
            "repair" | "repair-pairing" => Ok(Self::Repair),
            other => Err(format!("expected 'fail' or 'repair', got '{}'", other)),
        }
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pretty" | "text" => Ok(Self::Pretty),
            "json" => Ok(Self::Json),
            other => Err(format!("expected 'pretty' or 'json', got '{}'", other)),
        }
    }
}

/// Timeouts and policy knobs for the session lifecycle.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Bound on waiting for the first pairing code.
    pub pairing_timeout: Duration,
    /// Bound on connecting a paired identity.
    pub connect_timeout: Duration,
    /// Per-send deadline.
    pub send_timeout: Duration,
    /// Bound on the protocol logout call.
    pub logout_timeout: Duration,
    pub reconnect_fallback: ReconnectFallback,
    /// Server part of every outbound address.
    pub address_domain: String,
    /// Minimum edge of the rendered QR PNG, in pixels.
    pub qr_size: u32,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            pairing_timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(20),
            send_timeout: Duration::from_secs(15),
            logout_timeout: Duration::from_secs(10),
            reconnect_fallback: ReconnectFallback::Fail,
            address_domain: DEFAULT_ADDRESS_DOMAIN.to_string(),
            qr_size: 256,
        }
    }
}

/// Device store settings.
#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub url: SecretString,
    pub pool_size: usize,
}

/// Full bridge configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub listen_addr: SocketAddr,
    /// `None` runs against the in-memory device store.
    pub database: Option<DatabaseConfig>,
    pub relay_url: Url,
    pub session: SessionConfig,
    pub log_format: LogFormat,
}

impl Config {
    /// Load configuration from the process environment. Entries in
    /// `overrides` (CLI flags) take precedence.
    pub fn from_env(overrides: &HashMap<&str, String>) -> Result<Self, ConfigError> {
        let _ = dotenvy::dotenv();
        Self::from_lookup(|key| {
            overrides
                .get(key)
                .cloned()
                .or_else(|| std::env::var(key).ok())
        })
    }

    /// Load configuration through an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let listen_addr = parse_or(&lookup, "KIRIMWA_LISTEN_ADDR", DEFAULT_LISTEN_ADDR)?;

        let database = match lookup("DATABASE_URL") {
            Some(url) if !url.trim().is_empty() => Some(DatabaseConfig {
                url: SecretString::from(url),
                pool_size: parse_or(&lookup, "DATABASE_POOL_SIZE", "5")?,
            }),
            _ => None,
        };

        let relay_raw = lookup("KIRIMWA_RELAY_URL")
            .ok_or_else(|| ConfigError::MissingEnvVar("KIRIMWA_RELAY_URL".to_string()))?;
        let relay_url = Url::parse(&relay_raw).map_err(|e| ConfigError::InvalidValue {
            key: "KIRIMWA_RELAY_URL".to_string(),
            message: e.to_string(),
        })?;

        let session = SessionConfig {
            pairing_timeout: secs_or(&lookup, "KIRIMWA_PAIRING_TIMEOUT_SECS", 30)?,
            connect_timeout: secs_or(&lookup, "KIRIMWA_CONNECT_TIMEOUT_SECS", 20)?,
            send_timeout: secs_or(&lookup, "KIRIMWA_SEND_TIMEOUT_SECS", 15)?,
            logout_timeout: secs_or(&lookup, "KIRIMWA_LOGOUT_TIMEOUT_SECS", 10)?,
            reconnect_fallback: parse_or(&lookup, "KIRIMWA_RECONNECT_FALLBACK", "fail")?,
            address_domain: lookup("KIRIMWA_ADDRESS_DOMAIN")
                .unwrap_or_else(|| DEFAULT_ADDRESS_DOMAIN.to_string()),
            qr_size: parse_or(&lookup, "KIRIMWA_QR_SIZE", "256")?,
        };

        if session.address_domain.trim().is_empty() || session.address_domain.contains('@') {
            return Err(ConfigError::InvalidValue {
                key: "KIRIMWA_ADDRESS_DOMAIN".to_string(),
                message: "must be a bare server name".to_string(),
            });
        }

        Ok(Self {
            listen_addr,
            database,
            relay_url,
            session,
            log_format: parse_or(&lookup, "KIRIMWA_LOG_FORMAT", "pretty")?,
        })
    }
}

fn parse_or<F, T>(lookup: &F, key: &str, default: &str) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: std::fmt::Display,
{
    let raw = lookup(key).unwrap_or_else(|| default.to_string());
    raw.trim()
        .parse::<T>()
        .map_err(|e| ConfigError::InvalidValue {
            key: key.to_string(),
            message: e.to_string(),
        })
}

fn secs_or<F>(lookup: &F, key: &str, default: u64) -> Result<Duration, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let secs: u64 = parse_or(lookup, key, &default.to_string())?;
    if secs == 0 {
        return Err(ConfigError::InvalidValue {
            key: key.to_string(),
            message: "must be greater than zero".to_string(),
        });
    }
    Ok(Duration::from_secs(secs))
}
