//! Startup parameters and the immutable daemon context

use crate::error::ConfigError;
use crate::retry::RetryPolicy;
use crate::rules::RuleSet;
use lettre::message::Mailbox;
use secrecy::{ExposeSecret, SecretString};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// How the SMTP connection is secured
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum TlsMode {
    /// STARTTLS when the server advertises it, plaintext otherwise
    #[default]
    Opportunistic,
    /// STARTTLS, refuse servers that don't offer it
    Required,
    /// Implicit TLS from the first byte (port 465)
    Wrapper,
    /// Plaintext only
    None,
}

/// Parameters resolved by the command line layer before the core starts
#[derive(Debug, Clone)]
pub struct DaemonConfig {
    pub rules_path: PathBuf,
    pub smtp_host: String,
    pub smtp_port: u16,
    pub smtp_user: String,
    pub smtp_password_file: PathBuf,
    pub mail_from: String,
    pub tls: TlsMode,
    pub max_attempts: u32,
    pub shutdown_grace: Duration,
}

impl DaemonConfig {
    /// Create config for testing with files under `temp_dir`
    pub fn for_test(temp_dir: &Path) -> Self {
        Self {
            rules_path: temp_dir.join("sms2mail.yaml"),
            smtp_host: "localhost".to_string(),
            smtp_port: 2525,
            smtp_user: "sms".to_string(),
            smtp_password_file: temp_dir.join("smtp-password"),
            mail_from: "SMS Gateway <sms@example.org>".to_string(),
            tls: TlsMode::None,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            shutdown_grace: Duration::from_secs(DEFAULT_SHUTDOWN_GRACE_SECS),
        }
    }
}

/// SMTP login, read once at startup
#[derive(Debug, Clone)]
pub struct Credentials {
    pub username: String,
    password: SecretString,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: SecretString::from(password.into()),
        }
    }

    /// Read the password from `path`, trimming surrounding whitespace
    pub fn from_password_file(username: &str, path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;

        let password = content.trim();
        if password.is_empty() {
            return Err(ConfigError::EmptyPassword(path.to_path_buf()));
        }

        Ok(Self::new(username, password))
    }

    pub fn password(&self) -> &str {
        self.password.expose_secret()
    }
}

/// Everything the SMTP sender needs to open a session
#[derive(Debug, Clone)]
pub struct SmtpSettings {
    pub host: String,
    pub port: u16,
    pub tls: TlsMode,
    pub credentials: Credentials,
    pub timeout: Duration,
}

/// Shared read-only state, built once and handed to the listener and dispatcher
#[derive(Debug, Clone)]
pub struct Context {
    pub rules: RuleSet,
    pub smtp: SmtpSettings,
    pub from: Mailbox,
    pub retry: RetryPolicy,
    pub shutdown_grace: Duration,
}

impl Context {
    /// Load the rules document and credentials. Any failure here stops the daemon.
    pub fn from_config(config: &DaemonConfig) -> Result<Self, ConfigError> {
        if config.smtp_host.trim().is_empty() {
            return Err(ConfigError::InvalidValue {
                key: "smtp-server".to_string(),
                message: "must not be empty".to_string(),
            });
        }
        if config.smtp_port == 0 {
            return Err(ConfigError::InvalidValue {
                key: "smtp-port".to_string(),
                message: "must be between 1 and 65535".to_string(),
            });
        }

        let from: Mailbox = config
            .mail_from
            .parse()
            .map_err(|e| ConfigError::InvalidValue {
                key: "mail-from".to_string(),
                message: format!("'{}' is not an email address: {}", config.mail_from, e),
            })?;

        let rules = RuleSet::load(&config.rules_path)?;
        let credentials =
            Credentials::from_password_file(&config.smtp_user, &config.smtp_password_file)?;

        Ok(Self {
            rules,
            smtp: SmtpSettings {
                host: config.smtp_host.trim().to_string(),
                port: config.smtp_port,
                tls: config.tls,
                credentials,
                timeout: Duration::from_secs(SMTP_TIMEOUT_SECS),
            },
            from,
            retry: RetryPolicy::with_max_attempts(config.max_attempts),
            shutdown_grace: config.shutdown_grace,
        })
    }
}

#[cfg(test)]
impl Context {
    /// Context over an in-memory rules document with millisecond retry delays
    pub fn for_test(rules_yaml: &str) -> Self {
        Self {
            rules: RuleSet::from_yaml_str(rules_yaml).unwrap(),
            smtp: SmtpSettings {
                host: "127.0.0.1".to_string(),
                port: 2525,
                tls: TlsMode::None,
                credentials: Credentials::new("sms", "hunter2"),
                timeout: Duration::from_secs(5),
            },
            from: "SMS Gateway <sms@example.org>".parse().unwrap(),
            retry: RetryPolicy {
                max_attempts: DEFAULT_MAX_ATTEMPTS,
                initial_backoff: Duration::from_millis(1),
                max_backoff: Duration::from_millis(10),
                multiplier: 2.0,
                jitter: false,
            },
            shutdown_grace: Duration::from_millis(200),
        }
    }
}

pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;

pub const DEFAULT_SHUTDOWN_GRACE_SECS: u64 = 30;

pub const SMTP_TIMEOUT_SECS: u64 = 30;

/// Characters of the SMS body included in log records
pub const BODY_PREVIEW_CHARS: usize = 60;
