//! SMTP sender
//!
//! One fresh lettre connection per message. SMS volume is low, so there is no pooling.

use crate::config::{SmtpSettings, TlsMode};
use crate::error::SendError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use lettre::message::header::ContentType;
use lettre::message::Mailbox;
use lettre::transport::smtp::authentication::Credentials as SmtpCredentials;
use lettre::transport::smtp::client::{Tls, TlsParameters};
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use std::time::SystemTime;
use tracing::debug;
use uuid::Uuid;

/// A composed email, owned by the sender for one attempt
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundEmail {
    pub to: Mailbox,
    pub from: Mailbox,
    pub subject: String,
    pub body: String,
    pub sent_at: DateTime<Utc>,
}

/// Anything that can submit an [`OutboundEmail`]
#[async_trait]
pub trait MailTransport: Send + Sync {
    async fn send(&self, email: &OutboundEmail) -> Result<(), SendError>;
}

/// Submits mail over SMTP with STARTTLS and AUTH
pub struct SmtpMailer {
    settings: SmtpSettings,
}

impl SmtpMailer {
    pub fn new(settings: SmtpSettings) -> Self {
        Self { settings }
    }

    fn transport(&self) -> Result<AsyncSmtpTransport<Tokio1Executor>, SendError> {
        let settings = &self.settings;

        let tls_parameters = || {
            TlsParameters::new(settings.host.clone())
                .map_err(|e| SendError::Permanent(format!("TLS setup failed: {}", e)))
        };
        let tls = match settings.tls {
            TlsMode::Opportunistic => Tls::Opportunistic(tls_parameters()?),
            TlsMode::Required => Tls::Required(tls_parameters()?),
            TlsMode::Wrapper => Tls::Wrapper(tls_parameters()?),
            TlsMode::None => Tls::None,
        };

        let credentials = SmtpCredentials::new(
            settings.credentials.username.clone(),
            settings.credentials.password().to_string(),
        );

        Ok(
            AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(settings.host.as_str())
                .port(settings.port)
                .tls(tls)
                .credentials(credentials)
                .timeout(Some(settings.timeout))
                .build(),
        )
    }
}

#[async_trait]
impl MailTransport for SmtpMailer {
    async fn send(&self, email: &OutboundEmail) -> Result<(), SendError> {
        let message = build_message(email)?;
        let transport = self.transport()?;

        let response = transport.send(message).await.map_err(|e| classify_error(&e))?;
        debug!(
            host = %self.settings.host,
            code = %response.code(),
            "SMTP server accepted message"
        );
        Ok(())
    }
}

/// Turn an [`OutboundEmail`] into a MIME message
pub fn build_message(email: &OutboundEmail) -> Result<Message, SendError> {
    let message_id = format!("<{}@{}>", Uuid::new_v4(), email.from.email.domain());

    Message::builder()
        .from(email.from.clone())
        .to(email.to.clone())
        .subject(email.subject.clone())
        .date(SystemTime::from(email.sent_at))
        .message_id(Some(message_id))
        .header(ContentType::TEXT_PLAIN)
        .body(email.body.clone())
        .map_err(|e| SendError::Permanent(format!("failed to build email: {}", e)))
}

/// Sort an SMTP reply code into retryable (4xx) and final (everything else)
pub fn classify_reply_code(code: u16, detail: impl Into<String>) -> SendError {
    let detail = detail.into();
    if (400..500).contains(&code) {
        SendError::Transient(detail)
    } else {
        SendError::Permanent(detail)
    }
}

/// Classify a lettre error. Replies go by their code; client-side problems (no usable
/// AUTH mechanism, bad address) are final; network trouble is worth retrying.
pub fn classify_error(err: &lettre::transport::smtp::Error) -> SendError {
    let detail = err.to_string();

    if let Some(code) = err.status() {
        return match code.to_string().parse::<u16>() {
            Ok(code) => classify_reply_code(code, detail),
            Err(_) => SendError::Permanent(detail),
        };
    }

    if err.is_client() {
        SendError::Permanent(detail)
    } else {
        SendError::Transient(detail)
    }
}
