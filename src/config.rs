use std::fmt::Display;
use std::path::PathBuf;
use std::str::FromStr;

use rand::distributions::Alphanumeric;
use rand::Rng;
use tracing::{info, warn};

#[derive(Debug)]
pub enum ConfigError {
    Missing(&'static str),
    Invalid { key: &'static str, message: String },
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Missing(key) => write!(f, "environment variable {key} is required"),
            ConfigError::Invalid { key, message } => write!(f, "invalid {key}: {message}"),
        }
    }
}

impl std::error::Error for ConfigError {}

/// Everything the service reads from the environment, loaded once at startup.
#[derive(Clone)]
pub struct Config {
    pub bind: String,
    pub port: u16,
    pub data_dir: PathBuf,
    pub metrics_port: Option<u16>,
    pub compact_threshold: u64,
    pub pending_ttl_secs: u64,
    pub sync_interval_secs: Option<u64>,
    pub production: bool,
    /// Public origin used in gateway return URLs and redirects, no trailing slash.
    pub site_url: String,
    pub getnet_base_url: String,
    pub getnet_login: String,
    pub getnet_secret_key: String,
    pub cron_secret: String,
    pub admin_secret: Option<String>,
    pub admin_email: String,
    pub admin_password: String,
    pub session_secret: Vec<u8>,
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("bind", &self.bind)
            .field("port", &self.port)
            .field("data_dir", &self.data_dir)
            .field("metrics_port", &self.metrics_port)
            .field("production", &self.production)
            .field("site_url", &self.site_url)
            .field("getnet_base_url", &self.getnet_base_url)
            .field("getnet_login", &self.getnet_login)
            .field("admin_email", &self.admin_email)
            .finish_non_exhaustive()
    }
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup; `from_env` passes the process environment.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let site_url = var("SITE_URL")
            .or_else(|| var("PUBLIC_SITE_URL"))
            .unwrap_or_else(|| {
                info!("SITE_URL not set, using default: http://localhost:4321");
                "http://localhost:4321".into()
            });
        if !(site_url.starts_with("http://") || site_url.starts_with("https://")) {
            return Err(ConfigError::Invalid {
                key: "SITE_URL",
                message: "must start with http:// or https://".into(),
            });
        }

        let cron_secret = var("CRON_SECRET_KEY").unwrap_or_else(|| {
            warn!("CRON_SECRET_KEY not set; generated a temporary key, set a permanent one");
            format!("sync-calendar-secret-key-{}", random_token(13))
        });
        let session_secret = var("SESSION_SECRET")
            .map(String::into_bytes)
            .unwrap_or_else(|| {
                warn!("SESSION_SECRET not set; admin sessions will not survive a restart");
                random_token(48).into_bytes()
            });

        Ok(Self {
            bind: var("CABINBOOK_BIND").unwrap_or_else(|| "0.0.0.0".into()),
            port: parse_or(&var, "CABINBOOK_PORT", 4321)?,
            data_dir: PathBuf::from(var("CABINBOOK_DATA_DIR").unwrap_or_else(|| "./data".into())),
            metrics_port: parse_opt(&var, "CABINBOOK_METRICS_PORT")?,
            compact_threshold: parse_or(&var, "CABINBOOK_COMPACT_THRESHOLD", 1000)?,
            pending_ttl_secs: parse_or(&var, "CABINBOOK_PENDING_TTL_SECS", 1800)?,
            sync_interval_secs: parse_opt(&var, "CABINBOOK_SYNC_INTERVAL_SECS")?,
            production: parse_or(&var, "CABINBOOK_PRODUCTION", false)?,
            site_url: site_url.trim_end_matches('/').to_string(),
            getnet_base_url: var("GETNET_BASE_URL")
                .unwrap_or_else(|| "https://checkout.test.getnet.cl".into()),
            getnet_login: var("GETNET_LOGIN").ok_or(ConfigError::Missing("GETNET_LOGIN"))?,
            getnet_secret_key: var("GETNET_SECRET_KEY")
                .ok_or(ConfigError::Missing("GETNET_SECRET_KEY"))?,
            cron_secret,
            admin_secret: var("ADMIN_SECRET"),
            admin_email: var("ADMIN_EMAIL").ok_or(ConfigError::Missing("ADMIN_EMAIL"))?,
            admin_password: var("ADMIN_PASSWORD").ok_or(ConfigError::Missing("ADMIN_PASSWORD"))?,
            session_secret,
        })
    }

    pub fn wal_path(&self) -> PathBuf {
        self.data_dir.join("cabinbook.wal")
    }
}

fn parse_or<T: FromStr>(
    var: &impl Fn(&str) -> Option<String>,
    key: &'static str,
    default: T,
) -> Result<T, ConfigError>
where
    T::Err: Display,
{
    Ok(parse_opt(var, key)?.unwrap_or(default))
}

fn parse_opt<T: FromStr>(
    var: &impl Fn(&str) -> Option<String>,
    key: &'static str,
) -> Result<Option<T>, ConfigError>
where
    T::Err: Display,
{
    var(key)
        .map(|raw| {
            raw.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
                key,
                message: e.to_string(),
            })
        })
        .transpose()
}

fn random_token(len: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}
