//! Process configuration, read once at startup and shared by reference.

use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("missing environment variable '{0}'")]
    Missing(&'static str),
    #[error("invalid value for '{name}': {reason}")]
    Invalid { name: &'static str, reason: String },
}

/// Credentials for the CRM REST API. All fields must be present for the CRM
/// consumer and poller to start.
#[derive(Clone)]
pub struct CrmCredentials {
    pub login_url: String,
    pub client_id: String,
    pub client_secret: String,
    pub username: String,
    pub password: String,
    pub security_token: String,
}

impl std::fmt::Debug for CrmCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CrmCredentials")
            .field("login_url", &self.login_url)
            .field("username", &self.username)
            .finish_non_exhaustive()
    }
}

/// Setting any of these turns CRM sync on and makes the four credentials required.
const CRM_VARS: [&str; 6] = [
    "CRM_CLIENT_ID", "CRM_CLIENT_SECRET", "CRM_USERNAME", "CRM_PASSWORD", "CRM_LOGIN_URL", "CRM_SECURITY_TOKEN",
];

#[derive(Clone)]
pub struct AppConfig {
    pub port: u16,
    pub database_url: String,
    pub broker_url: String,
    pub secret_key: String,
    pub backup_retention_days: u32,
    pub backup_sweep_interval: Duration,
    pub backup_max_attempts: u32,
    pub crm_poll_interval: Duration,
    pub dead_letter_ttl: Duration,
    pub erp_output_dir: PathBuf,
    pub consumer_concurrency: usize,
    pub shutdown_grace: Duration,
    pub currency: String,
    pub default_country: String,
    pub crm: Option<CrmCredentials>,
}

impl std::fmt::Debug for AppConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppConfig")
            .field("port", &self.port)
            .field("broker_url", &self.broker_url)
            .field("backup_retention_days", &self.backup_retention_days)
            .field("crm_poll_interval", &self.crm_poll_interval)
            .field("dead_letter_ttl", &self.dead_letter_ttl)
            .field("erp_output_dir", &self.erp_output_dir)
            .field("consumer_concurrency", &self.consumer_concurrency)
            .field("crm", &self.crm)
            .finish_non_exhaustive()
    }
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let get = |name: &'static str| lookup(name).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        let require = |name: &'static str| get(name).ok_or(ConfigError::Missing(name));
        let number = |name: &'static str, default: u64| -> Result<u64, ConfigError> {
            match get(name) {
                Some(raw) => raw.parse::<u64>().map_err(|e| ConfigError::Invalid { name, reason: e.to_string() }),
                None => Ok(default),
            }
        };

        let port = u16::try_from(number("PORT", 8083)?)
            .map_err(|e| ConfigError::Invalid { name: "PORT", reason: e.to_string() })?;
        let backup_retention_days = u32::try_from(number("BACKUP_RETENTION_DAYS", 90)?)
            .map_err(|e| ConfigError::Invalid { name: "BACKUP_RETENTION_DAYS", reason: e.to_string() })?;
        let backup_max_attempts = u32::try_from(number("BACKUP_MAX_ATTEMPTS", 2)?.max(1))
            .map_err(|e| ConfigError::Invalid { name: "BACKUP_MAX_ATTEMPTS", reason: e.to_string() })?;
        let consumer_concurrency = usize::try_from(number("CONSUMER_CONCURRENCY", 8)?.max(1))
            .map_err(|e| ConfigError::Invalid { name: "CONSUMER_CONCURRENCY", reason: e.to_string() })?;
        let crm_poll_secs = number("CRM_POLL_INTERVAL_SECS", 30)?;
        if crm_poll_secs == 0 {
            return Err(ConfigError::Invalid { name: "CRM_POLL_INTERVAL_SECS", reason: "must be positive".into() });
        }

        let crm = if CRM_VARS.iter().any(|&name| get(name).is_some()) {
            Some(CrmCredentials {
                login_url: get("CRM_LOGIN_URL").unwrap_or_else(|| "https://login.salesforce.com".to_string()),
                client_id: require("CRM_CLIENT_ID")?,
                client_secret: require("CRM_CLIENT_SECRET")?,
                username: require("CRM_USERNAME")?,
                password: require("CRM_PASSWORD")?,
                security_token: get("CRM_SECURITY_TOKEN").unwrap_or_default(),
            })
        } else {
            None
        };

        let default_country = get("DEFAULT_COUNTRY").unwrap_or_else(|| "BE".to_string()).to_uppercase();
        if default_country.len() != 2 {
            return Err(ConfigError::Invalid { name: "DEFAULT_COUNTRY", reason: "expected ISO 3166 alpha-2".into() });
        }

        let config = Self {
            port,
            database_url: require("DATABASE_URL")?,
            broker_url: get("BROKER_URL").unwrap_or_else(|| "nats://127.0.0.1:4222".to_string()),
            secret_key: require("ORDER_SECRET_KEY")?,
            backup_retention_days,
            backup_sweep_interval: Duration::from_secs(number("BACKUP_SWEEP_INTERVAL_SECS", 24 * 60 * 60)?.max(1)),
            backup_max_attempts,
            crm_poll_interval: Duration::from_secs(crm_poll_secs),
            dead_letter_ttl: Duration::from_secs(number("DEAD_LETTER_TTL_SECS", 24 * 60 * 60)?.max(1)),
            erp_output_dir: PathBuf::from(get("ERP_OUTPUT_DIR").unwrap_or_else(|| "./idocs_out".to_string())),
            consumer_concurrency,
            shutdown_grace: Duration::from_secs(number("SHUTDOWN_GRACE_SECS", 10)?),
            currency: get("CURRENCY").unwrap_or_else(|| "EUR".to_string()).to_uppercase(),
            default_country,
            crm,
        };
        tracing::info!(config = ?config, "Configuration loaded");
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn test_defaults_apply() {
        let config = AppConfig::from_lookup(lookup(&[("DATABASE_URL", "postgres://x"), ("ORDER_SECRET_KEY", "s")])).unwrap();
        assert_eq!(config.port, 8083);
        assert_eq!(config.backup_retention_days, 90);
        assert_eq!(config.crm_poll_interval, Duration::from_secs(30));
        assert_eq!(config.dead_letter_ttl, Duration::from_secs(86_400));
        assert_eq!(config.currency, "EUR");
        assert_eq!(config.default_country, "BE");
        assert!(config.crm.is_none());
    }

    #[test]
    fn test_required_and_invalid_values() {
        assert_eq!(
            AppConfig::from_lookup(lookup(&[("DATABASE_URL", "postgres://x")])).unwrap_err(),
            ConfigError::Missing("ORDER_SECRET_KEY")
        );
        let err = AppConfig::from_lookup(lookup(&[
            ("DATABASE_URL", "postgres://x"), ("ORDER_SECRET_KEY", "s"), ("CRM_POLL_INTERVAL_SECS", "soon"),
        ])).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { name: "CRM_POLL_INTERVAL_SECS", .. }));
    }

    #[test]
    fn test_crm_credentials_are_all_or_nothing() {
        let err = AppConfig::from_lookup(lookup(&[
            ("DATABASE_URL", "postgres://x"), ("ORDER_SECRET_KEY", "s"),
            ("CRM_CLIENT_ID", "id"), ("CRM_USERNAME", "user"),
        ])).unwrap_err();
        assert_eq!(err, ConfigError::Missing("CRM_CLIENT_SECRET"));

        for (name, missing) in [("CRM_USERNAME", "CRM_CLIENT_ID"), ("CRM_PASSWORD", "CRM_CLIENT_ID"), ("CRM_LOGIN_URL", "CRM_CLIENT_ID")] {
            let err = AppConfig::from_lookup(lookup(&[
                ("DATABASE_URL", "postgres://x"), ("ORDER_SECRET_KEY", "s"), (name, "set"),
            ])).unwrap_err();
            assert_eq!(err, ConfigError::Missing(missing), "{name} alone");
        }
        let err = AppConfig::from_lookup(lookup(&[
            ("DATABASE_URL", "postgres://x"), ("ORDER_SECRET_KEY", "s"), ("CRM_CLIENT_ID", "id"), ("CRM_CLIENT_SECRET", "cs"),
        ])).unwrap_err();
        assert_eq!(err, ConfigError::Missing("CRM_USERNAME"));

        let config = AppConfig::from_lookup(lookup(&[
            ("DATABASE_URL", "postgres://x"), ("ORDER_SECRET_KEY", "s"), ("CRM_CLIENT_ID", "id"),
            ("CRM_USERNAME", "user"), ("CRM_CLIENT_SECRET", "cs"), ("CRM_PASSWORD", "pw"),
        ])).unwrap();
        let crm = config.crm.unwrap();
        assert_eq!(crm.login_url, "https://login.salesforce.com");
        assert!(!format!("{crm:?}").contains("pw"));
    }
}
