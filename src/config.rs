//! Configuration for the orchestration daemon.
//!
//! Configuration is read from environment variables once at startup:
//! - `SOVI_MASTER_KEY` - Required. 32-byte credential key, hex or base64.
//! - `SOVI_DATABASE_PATH` - Required. Path to the SQLite store.
//! - `HOST` - Optional. Dashboard API host. Defaults to `127.0.0.1`.
//! - `PORT` - Optional. Dashboard API port. Defaults to `3000`.
//! - `SOVI_AGENT_HOST` - Optional. Host the per-device automation ports are
//!   tunneled on. Defaults to `127.0.0.1`.
//! - `CAPTCHA_API_KEY` - Optional. Gates the account creation runner.
//! - `SMS_API_URL` / `SMS_API_KEY` - Optional. Disposable number provider.
//! - `IMAP_HOST` / `IMAP_PORT` / `IMAP_USER` / `IMAP_PASSWORD` - Optional.
//!   Mailbox polled for email verification codes.

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid value for {0}: {1}")]
    InvalidValue(String, String),
}

/// External services required by the account creation runner. All optional;
/// when any of them is absent, creation tasks are skipped with a warning.
#[derive(Debug, Clone, Default)]
pub struct CreationConfig {
    /// CAPTCHA solver API key
    pub captcha_api_key: Option<String>,

    /// Disposable SMS provider endpoint
    pub sms_api_url: Option<String>,

    /// Disposable SMS provider key
    pub sms_api_key: Option<String>,

    /// IMAP endpoint for email verification
    pub imap_host: Option<String>,
    pub imap_port: u16,
    pub imap_user: Option<String>,
    pub imap_password: Option<String>,
}

impl CreationConfig {
    /// Whether every external collaborator needed for sign-up is configured.
    pub fn is_enabled(&self) -> bool {
        self.captcha_api_key.is_some()
            && self.sms_api_url.is_some()
            && self.sms_api_key.is_some()
            && self.imap_host.is_some()
            && self.imap_user.is_some()
            && self.imap_password.is_some()
    }
}

/// Time budgets for one session and the worker loop around it.
#[derive(Debug, Clone)]
pub struct ScheduleConfig {
    /// Uninstall + reinstall + login overhead ceiling.
    pub session_overhead_budget: Duration,

    /// Warming wall-clock, checked each iteration.
    pub warming_budget: Duration,

    /// Hard ceiling for a whole session.
    pub session_total_budget: Duration,

    /// Cooldown between sessions on one device.
    pub session_cooldown: Duration,

    /// Sleep when no task is available.
    pub idle_interval: Duration,

    /// First backoff after a failed agent health probe.
    pub probe_backoff_initial: Duration,

    /// Backoff cap per device.
    pub probe_backoff_max: Duration,

    /// Consecutive probe failures before the event escalates to critical.
    pub probe_critical_threshold: u32,

    /// Grace period for in-flight work at shutdown.
    pub shutdown_grace: Duration,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            session_overhead_budget: Duration::from_secs(15 * 60),
            warming_budget: Duration::from_secs(30 * 60),
            session_total_budget: Duration::from_secs(45 * 60),
            session_cooldown: Duration::from_secs(30),
            idle_interval: Duration::from_secs(30),
            probe_backoff_initial: Duration::from_secs(60),
            probe_backoff_max: Duration::from_secs(15 * 60),
            probe_critical_threshold: 5,
            shutdown_grace: Duration::from_secs(30),
        }
    }
}

/// Daemon configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// SQLite store path
    pub database_path: PathBuf,

    /// Dashboard API host
    pub host: String,

    /// Dashboard API port
    pub port: u16,

    /// Host the per-device automation ports listen on
    pub agent_host: String,

    /// Creation runner collaborators
    pub creation: CreationConfig,

    /// Session and worker timing
    pub schedule: ScheduleConfig,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::MissingEnvVar` if `SOVI_DATABASE_PATH` is not
    /// set. The master key is validated separately by `crypto::Codec`.
    pub fn from_env() -> Result<Self, ConfigError> {
        let database_path = std::env::var("SOVI_DATABASE_PATH")
            .map(PathBuf::from)
            .map_err(|_| ConfigError::MissingEnvVar("SOVI_DATABASE_PATH".to_string()))?;

        let host = std::env::var("HOST").unwrap_or_else(|_| "127.0.0.1".to_string());

        let port = std::env::var("PORT")
            .unwrap_or_else(|_| "3000".to_string())
            .parse()
            .map_err(|e| ConfigError::InvalidValue("PORT".to_string(), format!("{}", e)))?;

        let agent_host =
            std::env::var("SOVI_AGENT_HOST").unwrap_or_else(|_| "127.0.0.1".to_string());

        let imap_port = std::env::var("IMAP_PORT")
            .unwrap_or_else(|_| "143".to_string())
            .parse()
            .map_err(|e| ConfigError::InvalidValue("IMAP_PORT".to_string(), format!("{}", e)))?;

        let creation = CreationConfig {
            captcha_api_key: std::env::var("CAPTCHA_API_KEY").ok(),
            sms_api_url: std::env::var("SMS_API_URL").ok(),
            sms_api_key: std::env::var("SMS_API_KEY").ok(),
            imap_host: std::env::var("IMAP_HOST").ok(),
            imap_port,
            imap_user: std::env::var("IMAP_USER").ok(),
            imap_password: std::env::var("IMAP_PASSWORD").ok(),
        };

        Ok(Self {
            database_path,
            host,
            port,
            agent_host,
            creation,
            schedule: ScheduleConfig::default(),
        })
    }

    /// Create a config with custom values (useful for testing).
    pub fn for_tests(database_path: PathBuf) -> Self {
        Self {
            database_path,
            host: "127.0.0.1".to_string(),
            port: 3000,
            agent_host: "127.0.0.1".to_string(),
            creation: CreationConfig::default(),
            schedule: ScheduleConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn creation_disabled_by_default() {
        assert!(!CreationConfig::default().is_enabled());
    }

    #[test]
    fn creation_enabled_when_fully_configured() {
        let creation = CreationConfig {
            captcha_api_key: Some("k".into()),
            sms_api_url: Some("https://sms.example".into()),
            sms_api_key: Some("k".into()),
            imap_host: Some("mail.example".into()),
            imap_port: 143,
            imap_user: Some("u".into()),
            imap_password: Some("p".into()),
        };
        assert!(creation.is_enabled());
    }

    #[test]
    fn default_budgets() {
        let schedule = ScheduleConfig::default();
        assert_eq!(schedule.warming_budget, Duration::from_secs(1800));
        assert_eq!(schedule.session_total_budget, Duration::from_secs(2700));
        assert!(schedule.session_overhead_budget < schedule.session_total_budget);
    }
}
