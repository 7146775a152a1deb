//! Dispatcher - route, compose, send with retries, record the outcome
//!
//! One call to [`Dispatcher::dispatch`] handles one SMS from start to finish. Every SMS
//! ends in exactly one outcome log record.

use crate::config::{Context, BODY_PREVIEW_CHARS};
use crate::mailer::{MailTransport, OutboundEmail};
use crate::modem::SmsStore;
use crate::retry::RetryDecision;
use crate::rules::Route;
use crate::sms::IncomingSms;
use chrono::Utc;
use std::fmt;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info, warn};

/// Why an SMS was not delivered
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureReason {
    NoRoute,
    Transient,
    Permanent,
    Shutdown,
    Panicked,
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FailureReason::NoRoute => "no_route",
            FailureReason::Transient => "transient",
            FailureReason::Permanent => "permanent",
            FailureReason::Shutdown => "shutdown",
            FailureReason::Panicked => "panicked",
        };
        f.write_str(s)
    }
}

/// Terminal result of one dispatch
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Delivered {
        attempts: u32,
    },
    Failed {
        reason: FailureReason,
        attempts: u32,
        detail: String,
    },
}

impl Outcome {
    pub fn attempts(&self) -> u32 {
        match self {
            Outcome::Delivered { attempts } | Outcome::Failed { attempts, .. } => *attempts,
        }
    }

    pub fn is_delivered(&self) -> bool {
        matches!(self, Outcome::Delivered { .. })
    }

    pub fn shutdown(attempts: u32) -> Self {
        Outcome::Failed {
            reason: FailureReason::Shutdown,
            attempts,
            detail: "daemon shutting down".to_string(),
        }
    }
}

pub struct Dispatcher {
    ctx: Arc<Context>,
    transport: Arc<dyn MailTransport>,
    store: Option<Arc<dyn SmsStore>>,
}

impl Dispatcher {
    pub fn new(ctx: Arc<Context>, transport: Arc<dyn MailTransport>) -> Self {
        Self {
            ctx,
            transport,
            store: None,
        }
    }

    /// Store used to remove delivered messages when `delete_after_sending` is set
    pub fn with_store(mut self, store: Option<Arc<dyn SmsStore>>) -> Self {
        self.store = store;
        self
    }

    /// Build the email for `sms` going to `route`
    pub fn compose(&self, sms: &IncomingSms, route: &Route<'_>) -> OutboundEmail {
        let rules = &self.ctx.rules;
        let display = rules.display_name(Some(route), &sms.sender);

        let from_line = if display == sms.sender {
            display.clone()
        } else {
            format!("{} ({})", display, sms.sender)
        };
        let date = sms
            .received_at
            .format(&rules.options.date_format)
            .to_string();

        OutboundEmail {
            to: route.recipient().clone(),
            from: self.ctx.from.clone(),
            subject: format!("New SMS from {}", display),
            body: format!("From: {}\nDate: {}\n\n{}", from_line, date, sms.body),
            sent_at: Utc::now(),
        }
    }

    /// Deliver one SMS. Transient failures are retried per the context's policy; a
    /// shutdown signal cuts any pending backoff short.
    pub async fn dispatch(
        &self,
        sms: &IncomingSms,
        mut shutdown: watch::Receiver<bool>,
    ) -> Outcome {
        let preview = sms.preview(BODY_PREVIEW_CHARS);

        let Some(route) = self.ctx.rules.resolve(&sms.sender) else {
            let outcome = Outcome::Failed {
                reason: FailureReason::NoRoute,
                attempts: 0,
                detail: "no rule matches and no default recipient".to_string(),
            };
            log_outcome(&sms.sender, &preview, None, &outcome);
            return outcome;
        };

        let email = self.compose(sms, &route);
        let to = email.to.to_string();
        let mut attempts = 0;

        let outcome = loop {
            attempts += 1;
            let err = match self.transport.send(&email).await {
                Ok(()) => break Outcome::Delivered { attempts },
                Err(err) => err,
            };

            match self.ctx.retry.decide(attempts, &err) {
                RetryDecision::RetryAfter(delay) => {
                    warn!(
                        sender = %sms.sender,
                        to = %to,
                        attempt = attempts,
                        retry_in_ms = delay.as_millis() as u64,
                        error = %err,
                        "SMTP submission failed, retrying"
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = wait_for_shutdown(&mut shutdown) => break Outcome::shutdown(attempts),
                    }
                }
                RetryDecision::GiveUp => {
                    let reason = if err.is_transient() {
                        FailureReason::Transient
                    } else {
                        FailureReason::Permanent
                    };
                    break Outcome::Failed {
                        reason,
                        attempts,
                        detail: err.to_string(),
                    };
                }
            }
        };

        log_outcome(&sms.sender, &preview, Some(&to), &outcome);

        if outcome.is_delivered() && self.ctx.rules.options.delete_after_sending {
            self.delete_from_modem(sms).await;
        }

        outcome
    }

    async fn delete_from_modem(&self, sms: &IncomingSms) {
        let (Some(store), Some(origin)) = (&self.store, &sms.origin) else {
            return;
        };
        match store.delete(origin).await {
            Ok(()) => info!(sms = %origin.sms_path, "Deleted forwarded SMS from modem"),
            Err(e) => warn!(sms = %origin.sms_path, error = %e, "Failed to delete SMS from modem"),
        }
    }
}

/// Emit the single terminal record for an SMS
pub fn log_outcome(sender: &str, preview: &str, to: Option<&str>, outcome: &Outcome) {
    let to = to.unwrap_or("-");
    match outcome {
        Outcome::Delivered { attempts } => info!(
            sender = %sender,
            preview = %preview,
            to = %to,
            outcome = "delivered",
            attempts,
            "SMS forwarded"
        ),
        Outcome::Failed {
            reason,
            attempts,
            detail,
        } => error!(
            sender = %sender,
            preview = %preview,
            to = %to,
            outcome = "failed",
            reason = %reason,
            attempts,
            detail = %detail,
            "SMS not forwarded"
        ),
    }
}

/// Resolves once shutdown is requested. Pending forever if the sender is gone.
pub async fn wait_for_shutdown(shutdown: &mut watch::Receiver<bool>) {
    let requested = shutdown.wait_for(|stop| *stop).await.is_ok();
    if !requested {
        std::future::pending::<()>().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{BusConnectionError, SendError};
    use crate::sms::SmsOrigin;
    use async_trait::async_trait;
    use chrono::DateTime;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    const RULES: &str = r#"
rules:
  - match: "+4915"
    to: mobile@example.org
    name: Alice
  - match: "+49"
    to: germany@example.org
"#;

    /// Replies from a script, then succeeds
    #[derive(Default)]
    struct ScriptedTransport {
        replies: Mutex<VecDeque<Result<(), SendError>>>,
        attempts: AtomicU32,
        sent: Mutex<Vec<OutboundEmail>>,
    }

    impl ScriptedTransport {
        fn with_replies(replies: Vec<Result<(), SendError>>) -> Arc<Self> {
            Arc::new(Self {
                replies: Mutex::new(replies.into()),
                ..Self::default()
            })
        }

        fn attempts(&self) -> u32 {
            self.attempts.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl MailTransport for ScriptedTransport {
        async fn send(&self, email: &OutboundEmail) -> Result<(), SendError> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            let reply = self.replies.lock().unwrap().pop_front().unwrap_or(Ok(()));
            if reply.is_ok() {
                self.sent.lock().unwrap().push(email.clone());
            }
            reply
        }
    }

    #[derive(Default)]
    struct RecordingStore {
        deleted: Mutex<Vec<SmsOrigin>>,
    }

    #[async_trait]
    impl SmsStore for RecordingStore {
        async fn delete(&self, origin: &SmsOrigin) -> Result<(), BusConnectionError> {
            self.deleted.lock().unwrap().push(origin.clone());
            Ok(())
        }
    }

    fn sms(sender: &str) -> IncomingSms {
        IncomingSms {
            sender: sender.to_string(),
            body: "Your code is 1234".to_string(),
            received_at: DateTime::parse_from_rfc3339("2024-01-15T10:00:00+01:00").unwrap(),
            origin: Some(SmsOrigin {
                modem_path: "/org/freedesktop/ModemManager1/Modem/0".to_string(),
                sms_path: "/org/freedesktop/ModemManager1/SMS/3".to_string(),
            }),
        }
    }

    fn dispatcher(rules: &str, transport: Arc<ScriptedTransport>) -> Dispatcher {
        Dispatcher::new(Arc::new(Context::for_test(rules)), transport)
    }

    /// A shutdown channel whose sender is gone: never fires
    fn running() -> watch::Receiver<bool> {
        watch::channel(false).1
    }

    fn busy() -> Result<(), SendError> {
        Err(SendError::Transient("421 4.3.2 try again later".to_string()))
    }

    #[test]
    fn test_compose_named_rule() {
        let d = dispatcher(RULES, ScriptedTransport::with_replies(vec![]));
        let sms = sms("+491512345678");
        let route = d.ctx.rules.resolve(&sms.sender).unwrap();

        let email = d.compose(&sms, &route);
        assert_eq!(email.subject, "New SMS from Alice");
        assert_eq!(email.to.email.to_string(), "mobile@example.org");
        assert_eq!(
            email.body,
            "From: Alice (+491512345678)\nDate: 15.01.2024, 10:00:00\n\nYour code is 1234"
        );
    }

    #[test]
    fn test_compose_unnamed_rule_uses_number() {
        let d = dispatcher(RULES, ScriptedTransport::with_replies(vec![]));
        let sms = sms("+4930123456");
        let route = d.ctx.rules.resolve(&sms.sender).unwrap();

        let email = d.compose(&sms, &route);
        assert_eq!(email.subject, "New SMS from +4930123456");
        assert!(email.body.starts_with("From: +4930123456\n"));
    }

    #[tokio::test]
    async fn test_delivered_first_try() {
        let transport = ScriptedTransport::with_replies(vec![]);
        let d = dispatcher(RULES, transport.clone());

        let outcome = d.dispatch(&sms("+491512345678"), running()).await;
        assert_eq!(outcome, Outcome::Delivered { attempts: 1 });
        assert_eq!(transport.sent.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_transient_then_delivered() {
        let transport = ScriptedTransport::with_replies(vec![busy(), busy(), Ok(())]);
        let d = dispatcher(RULES, transport.clone());

        let outcome = d.dispatch(&sms("+491512345678"), running()).await;
        assert_eq!(outcome, Outcome::Delivered { attempts: 3 });
        assert_eq!(transport.attempts(), 3);
    }

    #[tokio::test]
    async fn test_permanent_not_retried() {
        let transport = ScriptedTransport::with_replies(vec![Err(SendError::Permanent(
            "535 5.7.8 authentication failed".to_string(),
        ))]);
        let d = dispatcher(RULES, transport.clone());

        let outcome = d.dispatch(&sms("+491512345678"), running()).await;
        assert!(matches!(
            outcome,
            Outcome::Failed { reason: FailureReason::Permanent, attempts: 1, .. }
        ));
        assert_eq!(transport.attempts(), 1);
    }

    #[tokio::test]
    async fn test_transient_exhausts_attempts() {
        let transport = ScriptedTransport::with_replies((0..10).map(|_| busy()).collect());
        let d = dispatcher(RULES, transport.clone());

        let outcome = d.dispatch(&sms("+491512345678"), running()).await;
        assert!(matches!(
            outcome,
            Outcome::Failed { reason: FailureReason::Transient, attempts: 5, .. }
        ));
        assert_eq!(transport.attempts(), 5);
    }

    #[tokio::test]
    async fn test_no_route_makes_no_attempt() {
        let transport = ScriptedTransport::with_replies(vec![]);
        let d = dispatcher(RULES, transport.clone());

        let outcome = d.dispatch(&sms("+33612345678"), running()).await;
        assert!(matches!(
            outcome,
            Outcome::Failed { reason: FailureReason::NoRoute, attempts: 0, .. }
        ));
        assert_eq!(transport.attempts(), 0);
    }

    #[tokio::test]
    async fn test_shutdown_cuts_backoff() {
        let transport = ScriptedTransport::with_replies(vec![busy(), busy()]);
        let mut ctx = Context::for_test(RULES);
        ctx.retry.initial_backoff = std::time::Duration::from_secs(3600);
        ctx.retry.max_backoff = std::time::Duration::from_secs(3600);
        let d = Dispatcher::new(Arc::new(ctx), transport.clone());

        let (_tx, rx) = watch::channel(true);
        let outcome = d.dispatch(&sms("+491512345678"), rx).await;
        assert_eq!(outcome, Outcome::shutdown(1));
        assert_eq!(transport.attempts(), 1);
    }

    #[tokio::test]
    async fn test_delete_after_delivery() {
        let rules = format!("delete_after_sending: true\n{}", RULES);
        let store = Arc::new(RecordingStore::default());
        let d = dispatcher(&rules, ScriptedTransport::with_replies(vec![]))
            .with_store(Some(store.clone() as Arc<dyn SmsStore>));

        let outcome = d.dispatch(&sms("+491512345678"), running()).await;
        assert!(outcome.is_delivered());
        let deleted = store.deleted.lock().unwrap();
        assert_eq!(deleted.len(), 1);
        assert_eq!(deleted[0].sms_path, "/org/freedesktop/ModemManager1/SMS/3");
    }

    #[tokio::test]
    async fn test_failed_delivery_keeps_sms() {
        let rules = format!("delete_after_sending: true\n{}", RULES);
        let store = Arc::new(RecordingStore::default());
        let transport = ScriptedTransport::with_replies(vec![Err(SendError::Permanent(
            "550 no such user".to_string(),
        ))]);
        let d = dispatcher(&rules, transport)
            .with_store(Some(store.clone() as Arc<dyn SmsStore>));

        let outcome = d.dispatch(&sms("+491512345678"), running()).await;
        assert!(!outcome.is_delivered());
        assert!(store.deleted.lock().unwrap().is_empty());
    }
}
