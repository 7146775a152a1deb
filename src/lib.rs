//! sms2mail - forward SMS received by a ModemManager modem to email
//!
//! The daemon listens for `Messaging.Added` signals on the system bus, looks up the
//! sender in a prefix rule table and submits the message to an SMTP server.

pub mod config;
pub mod daemon;
pub mod dispatcher;
pub mod error;
pub mod listener;
pub mod logging;
pub mod mailer;
pub mod modem;
pub mod retry;
pub mod rules;
pub mod sms;

pub use error::{Error, Result};
