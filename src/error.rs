//! Error types for sms2mail

use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    #[error("Logging error: {0}")]
    Logging(String),
}

/// Problems with the rules document or the startup parameters. Always fatal.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("cannot read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed configuration: {0}")]
    Parse(String),

    #[error("rule '{pattern}' is missing required field '{field}'")]
    MissingField { pattern: String, field: &'static str },

    #[error("invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("duplicate match pattern: {0}")]
    DuplicatePattern(String),

    #[error("password file {0} is empty")]
    EmptyPassword(PathBuf),
}

impl From<serde_yaml::Error> for ConfigError {
    fn from(err: serde_yaml::Error) -> Self {
        ConfigError::Parse(err.to_string())
    }
}

/// The system bus or ModemManager went away. The listener reconnects.
#[derive(Error, Debug)]
pub enum BusConnectionError {
    #[error("D-Bus error: {0}")]
    Dbus(#[from] zbus::Error),

    #[error("D-Bus call failed: {0}")]
    Fdo(#[from] zbus::fdo::Error),

    #[error("signal stream closed")]
    StreamClosed,
}

/// A single notification that could not be turned into an SMS.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DecodeError {
    #[error("payload has no sender number")]
    MissingSender,

    #[error("payload has no text")]
    MissingBody,

    #[error("SMS is not in received state (state {0})")]
    NotReceived(u32),

    #[error("multipart SMS never finished receiving")]
    Incomplete,
}

/// Outcome of one SMTP submission attempt, split by whether retrying can help.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SendError {
    #[error("transient failure: {0}")]
    Transient(String),

    #[error("permanent failure: {0}")]
    Permanent(String),
}

impl SendError {
    pub fn is_transient(&self) -> bool {
        matches!(self, SendError::Transient(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
