//! Environment-driven configuration.

use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

use finsync_core::EmailCategory;
use finsync_infra::provider::gmail::GMAIL_API_BASE;
use finsync_infra::sync::SyncSettings;

const DEV_JWT_SECRET: &str = "dev-secret";

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{0} must be set")]
    Missing(&'static str),
    #[error("invalid {key}={value:?}: {reason}")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },
}

/// Where jobs and raw emails are kept.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Persistence {
    InMemory,
    Postgres {
        database_url: String,
        max_connections: u32,
    },
}

/// Gmail access. Absent means the in-memory mailbox is used.
#[derive(Clone, PartialEq, Eq)]
pub struct GmailConfig {
    pub api_base: String,
    pub access_token: String,
}

impl std::fmt::Debug for GmailConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GmailConfig")
            .field("api_base", &self.api_base)
            .field("access_token", &"<redacted>")
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub bind_addr: SocketAddr,
    pub jwt_secret: String,
    pub persistence: Persistence,
    pub gmail: Option<GmailConfig>,
    pub sync: SyncSettings,
    pub reaper_interval: Duration,
    pub shutdown_grace: Duration,
}

impl AppConfig {
    /// Load configuration from process environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let bind_addr: SocketAddr = parse_or(&get, "BIND_ADDR", "0.0.0.0:8080".parse().ok())?;

        let jwt_secret = get("JWT_SECRET").unwrap_or_else(|| {
            tracing::warn!("JWT_SECRET not set; using insecure dev default");
            DEV_JWT_SECRET.to_string()
        });

        let use_persistent: bool = parse_or(&get, "USE_PERSISTENT_STORES", Some(false))?;
        let persistence = if use_persistent {
            Persistence::Postgres {
                database_url: get("DATABASE_URL").ok_or(ConfigError::Missing("DATABASE_URL"))?,
                max_connections: parse_or(&get, "DATABASE_MAX_CONNECTIONS", Some(10))?,
            }
        } else {
            Persistence::InMemory
        };

        let gmail = get("GMAIL_ACCESS_TOKEN").map(|access_token| GmailConfig {
            api_base: get("GMAIL_API_BASE").unwrap_or_else(|| GMAIL_API_BASE.to_string()),
            access_token,
        });

        let defaults = SyncSettings::default();
        let default_category = match get("SYNC_DEFAULT_CATEGORY") {
            Some(raw) => EmailCategory::new(raw.as_str()).map_err(|e| ConfigError::Invalid {
                key: "SYNC_DEFAULT_CATEGORY",
                value: raw,
                reason: e.to_string(),
            })?,
            None => defaults.default_category.clone(),
        };
        let sync = SyncSettings::new()
            .with_max_results(parse_or(&get, "SYNC_MAX_RESULTS", Some(defaults.max_results))?)
            .with_batch_size(parse_or(&get, "SYNC_BATCH_SIZE", Some(defaults.batch_size))?)
            .with_default_category(default_category)
            .with_stale_after(secs(&get, "SYNC_STALE_AFTER_SECS", defaults.stale_after.as_secs())?);

        Ok(Self {
            bind_addr,
            jwt_secret,
            persistence,
            gmail,
            sync,
            reaper_interval: secs(&get, "SYNC_REAPER_INTERVAL_SECS", 60)?,
            shutdown_grace: secs(&get, "SHUTDOWN_GRACE_SECS", 30)?,
        })
    }
}

fn parse_or<T, G>(get: &G, key: &'static str, default: Option<T>) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    G: Fn(&str) -> Option<String>,
{
    match get(key) {
        Some(raw) => raw.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
            key,
            value: raw.clone(),
            reason: e.to_string(),
        }),
        None => default.ok_or(ConfigError::Missing(key)),
    }
}

fn secs<G>(get: &G, key: &'static str, default: u64) -> Result<Duration, ConfigError>
where
    G: Fn(&str) -> Option<String>,
{
    let secs: u64 = parse_or(get, key, Some(default))?;
    if secs == 0 {
        return Err(ConfigError::Invalid {
            key,
            value: "0".to_string(),
            reason: "must be greater than zero".to_string(),
        });
    }
    Ok(Duration::from_secs(secs))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn load(vars: &[(&str, &str)]) -> Result<AppConfig, ConfigError> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        AppConfig::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn defaults_are_dev_friendly() {
        let config = load(&[]).unwrap();
        assert_eq!(config.bind_addr, "0.0.0.0:8080".parse().unwrap());
        assert_eq!(config.jwt_secret, DEV_JWT_SECRET);
        assert_eq!(config.persistence, Persistence::InMemory);
        assert!(config.gmail.is_none());
        assert_eq!(config.sync, SyncSettings::default());
        assert_eq!(config.reaper_interval, Duration::from_secs(60));
        assert_eq!(config.shutdown_grace, Duration::from_secs(30));
    }

    #[test]
    fn reads_overrides() {
        let config = load(&[
            ("BIND_ADDR", "127.0.0.1:9000"),
            ("JWT_SECRET", "s3cret"),
            ("USE_PERSISTENT_STORES", "true"),
            ("DATABASE_URL", "postgres://localhost/finsync"),
            ("GMAIL_ACCESS_TOKEN", "ya29.token"),
            ("SYNC_MAX_RESULTS", "100"),
            ("SYNC_BATCH_SIZE", "10"),
            ("SYNC_DEFAULT_CATEGORY", "Playground"),
            ("SYNC_STALE_AFTER_SECS", "120"),
        ])
        .unwrap();

        assert_eq!(config.jwt_secret, "s3cret");
        assert_eq!(
            config.persistence,
            Persistence::Postgres {
                database_url: "postgres://localhost/finsync".into(),
                max_connections: 10
            }
        );
        let gmail = config.gmail.unwrap();
        assert_eq!(gmail.api_base, GMAIL_API_BASE);
        assert!(!format!("{gmail:?}").contains("ya29"));
        assert_eq!(config.sync.max_results, 100);
        assert_eq!(config.sync.batch_size, 10);
        assert_eq!(config.sync.default_category, EmailCategory::playground());
        assert_eq!(config.sync.stale_after, Duration::from_secs(120));
    }

    #[test]
    fn invalid_values_are_errors() {
        assert!(matches!(
            load(&[("SYNC_BATCH_SIZE", "lots")]),
            Err(ConfigError::Invalid { key: "SYNC_BATCH_SIZE", .. })
        ));
        assert!(matches!(
            load(&[("SHUTDOWN_GRACE_SECS", "0")]),
            Err(ConfigError::Invalid { key: "SHUTDOWN_GRACE_SECS", .. })
        ));
        assert_eq!(
            load(&[("USE_PERSISTENT_STORES", "true")]).unwrap_err(),
            ConfigError::Missing("DATABASE_URL")
        );
    }
}
