use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

const PREFIX: &str = "SLOTGUARD_";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{name}: cannot parse {value:?}")]
    Invalid { name: String, value: String },
    #[error("both SLOTGUARD_TLS_CERT and SLOTGUARD_TLS_KEY must be set, or neither")]
    PartialTls,
}

/// Knobs the booking engine itself consumes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    /// Reservations may start at most `horizon_months` + `horizon_extra_days` ahead.
    pub horizon_months: u32,
    pub horizon_extra_days: u64,
    /// Bound on acquiring ledger locks and committing a WAL record.
    pub lock_timeout: Duration,
    /// Extra attempts `reserve` makes after a `StorageContention`.
    pub max_retries: u32,
    /// Reject reservations that fall outside the provider's open windows.
    pub enforce_availability: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            horizon_months: 6,
            horizon_extra_days: 1,
            lock_timeout: Duration::from_millis(2_000),
            max_retries: 3,
            enforce_availability: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub bind: String,
    pub port: u16,
    pub data_dir: PathBuf,
    pub password: String,
    pub max_connections: usize,
    pub compact_threshold: u64,
    pub tls_cert: Option<String>,
    pub tls_key: Option<String>,
    pub metrics_port: Option<u16>,
    pub engine: EngineConfig,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build from an arbitrary variable source keyed by full variable name.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let get = |name: &str| lookup(&format!("{PREFIX}{name}"));
        let defaults = EngineConfig::default();

        let tls_cert = get("TLS_CERT");
        let tls_key = get("TLS_KEY");
        if tls_cert.is_some() != tls_key.is_some() {
            return Err(ConfigError::PartialTls);
        }

        let engine = EngineConfig {
            horizon_months: parse_or(&get, "HORIZON_MONTHS", defaults.horizon_months)?,
            horizon_extra_days: parse_or(&get, "HORIZON_EXTRA_DAYS", defaults.horizon_extra_days)?,
            lock_timeout: Duration::from_millis(parse_or(
                &get,
                "LOCK_TIMEOUT_MS",
                defaults.lock_timeout.as_millis() as u64,
            )?),
            max_retries: parse_or(&get, "MAX_RETRIES", defaults.max_retries)?,
            enforce_availability: parse_or(&get, "ENFORCE_AVAILABILITY", defaults.enforce_availability)?,
        };

        Ok(Self {
            bind: get("BIND").unwrap_or_else(|| "0.0.0.0".into()),
            port: parse_or(&get, "PORT", 5433)?,
            data_dir: PathBuf::from(get("DATA_DIR").unwrap_or_else(|| "./data".into())),
            password: get("PASSWORD").unwrap_or_else(|| "slotguard".into()),
            max_connections: parse_or(&get, "MAX_CONNECTIONS", 256)?,
            compact_threshold: parse_or(&get, "COMPACT_THRESHOLD", 1000)?,
            tls_cert,
            tls_key,
            metrics_port: get("METRICS_PORT")
                .map(|v| parse_value("METRICS_PORT", &v))
                .transpose()?,
            engine,
        })
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }
}

fn parse_or<T: FromStr>(
    get: &impl Fn(&str) -> Option<String>,
    name: &str,
    default: T,
) -> Result<T, ConfigError> {
    match get(name) {
        Some(v) => parse_value(name, &v),
        None => Ok(default),
    }
}

fn parse_value<T: FromStr>(name: &str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::Invalid {
        name: format!("{PREFIX}{name}"),
        value: value.to_string(),
    })
}
