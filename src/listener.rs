//! Signal listener - keeps a bus subscription alive and feeds the dispatcher
//!
//! Notifications are decoded and handed off over a channel; nothing here waits on SMTP.
//! Malformed payloads are dropped with a log record and never end the subscription.

use crate::config::BODY_PREVIEW_CHARS;
use crate::dispatcher::{log_outcome, Outcome};
use crate::error::DecodeError;
use crate::modem::{BusConnector, SmsStream};
use crate::retry::{Backoff, RetryPolicy};
use crate::sms::{decode, IncomingSms, SmsKey, SmsPayload};
use futures::StreamExt;
use std::collections::HashSet;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

pub struct SignalListener<C: BusConnector> {
    connector: C,
    policy: RetryPolicy,
    /// SMS already forwarded in this process
    seen: HashSet<SmsKey>,
}

impl<C: BusConnector> SignalListener<C> {
    pub fn new(connector: C) -> Self {
        Self {
            connector,
            policy: RetryPolicy::reconnect(),
            seen: HashSet::new(),
        }
    }

    pub fn with_backoff(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Subscribe and forward until `shutdown` turns true. Connection loss is retried
    /// with exponential backoff, never returned.
    pub async fn run(
        mut self,
        tx: mpsc::UnboundedSender<IncomingSms>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut backoff = Backoff::new(self.policy.clone());

        loop {
            if *shutdown.borrow() {
                break;
            }

            let subscribed = tokio::select! {
                result = self.connector.subscribe() => result,
                _ = shutdown.changed() => break,
            };

            match subscribed {
                Ok(stream) => {
                    backoff.reset();
                    tokio::select! {
                        _ = self.pump(stream, &tx) => {
                            if tx.is_closed() {
                                info!("Dispatcher gone, listener stopping");
                                break;
                            }
                            warn!("Bus signal stream ended");
                        }
                        _ = shutdown.changed() => {
                            info!("Unsubscribing from SMS signals");
                            break;
                        }
                    }
                }
                Err(e) => {
                    warn!(error = %e, "Bus connection failed");
                }
            }

            let delay = backoff.next_delay();
            info!(delay_secs = delay.as_secs_f64(), "Reconnecting to system bus");
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown.changed() => break,
            }
        }
    }

    /// Forward every valid notification of one subscription. Returns how many were sent.
    pub async fn pump(
        &mut self,
        mut stream: SmsStream,
        tx: &mpsc::UnboundedSender<IncomingSms>,
    ) -> usize {
        let mut forwarded = 0;

        while let Some(payload) = stream.next().await {
            let Some((key, sms)) = self.accept(payload) else {
                continue;
            };

            info!(
                sender = %sms.sender,
                received_at = %sms.received_at,
                "SMS received"
            );
            if let Err(mpsc::error::SendError(sms)) = tx.send(sms) {
                // Not forwarded, so not seen either
                self.seen.remove(&key);
                log_outcome(
                    &sms.sender,
                    &sms.preview(BODY_PREVIEW_CHARS),
                    None,
                    &Outcome::shutdown(0),
                );
                break;
            }
            forwarded += 1;
        }

        forwarded
    }

    fn accept(&mut self, payload: SmsPayload) -> Option<(SmsKey, IncomingSms)> {
        let sms_path = payload.origin.as_ref().map(|o| o.sms_path.clone());
        let key = payload.key();

        match decode(payload) {
            Ok(sms) => {
                if !self.seen.insert(key.clone()) {
                    debug!(
                        sms = ?sms_path,
                        sender = %sms.sender,
                        "Skipping already forwarded SMS"
                    );
                    return None;
                }
                Some((key, sms))
            }
            Err(DecodeError::NotReceived(state)) => {
                debug!(sms = ?sms_path, state, "Skipping SMS that was not received");
                None
            }
            Err(e) => {
                warn!(sms = ?sms_path, error = %e, "Dropping malformed SMS notification");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::BusConnectionError;
    use crate::sms::SmsOrigin;
    use async_trait::async_trait;
    use futures::stream;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    fn valid(path: &str, number: &str) -> SmsPayload {
        SmsPayload {
            number: Some(number.to_string()),
            text: Some("Hello".to_string()),
            state: Some(3),
            timestamp: Some("2024-01-15T10:00:00+01".to_string()),
            origin: Some(SmsOrigin {
                modem_path: "/org/freedesktop/ModemManager1/Modem/0".to_string(),
                sms_path: path.to_string(),
            }),
        }
    }

    fn missing_sender(path: &str) -> SmsPayload {
        SmsPayload {
            number: None,
            ..valid(path, "")
        }
    }

    fn fast() -> RetryPolicy {
        RetryPolicy {
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(4),
            jitter: false,
            ..RetryPolicy::reconnect()
        }
    }

    /// Fails `fail_first` subscriptions, then replays `payloads` on every subscription
    struct ScriptedBus {
        subscriptions: Arc<AtomicU32>,
        fail_first: u32,
        payloads: Vec<SmsPayload>,
        keep_open: bool,
    }

    #[async_trait]
    impl BusConnector for ScriptedBus {
        async fn subscribe(&self) -> Result<SmsStream, BusConnectionError> {
            let n = self.subscriptions.fetch_add(1, Ordering::SeqCst) + 1;
            if n <= self.fail_first {
                return Err(BusConnectionError::StreamClosed);
            }
            let items = stream::iter(self.payloads.clone());
            if self.keep_open {
                Ok(Box::pin(items.chain(stream::pending())))
            } else {
                Ok(Box::pin(items))
            }
        }
    }

    fn bus(
        fail_first: u32,
        payloads: Vec<SmsPayload>,
        keep_open: bool,
    ) -> (ScriptedBus, Arc<AtomicU32>) {
        let subscriptions = Arc::new(AtomicU32::new(0));
        (
            ScriptedBus {
                subscriptions: subscriptions.clone(),
                fail_first,
                payloads,
                keep_open,
            },
            subscriptions,
        )
    }

    #[tokio::test]
    async fn test_malformed_payload_dropped_next_forwarded() {
        let (connector, _) = bus(0, Vec::new(), false);
        let mut listener = SignalListener::new(connector);
        let (tx, mut rx) = mpsc::unbounded_channel();

        let payloads = vec![missing_sender("/sms/1"), valid("/sms/2", "+491512345678")];
        let forwarded = listener.pump(Box::pin(stream::iter(payloads)), &tx).await;

        assert_eq!(forwarded, 1);
        let sms = rx.try_recv().unwrap();
        assert_eq!(sms.sender, "+491512345678");
        assert!(rx.try_recv().is_err());
    }

    fn with_body(path: &str, body: &str, timestamp: &str) -> SmsPayload {
        SmsPayload {
            text: Some(body.to_string()),
            timestamp: Some(timestamp.to_string()),
            ..valid(path, "+491512345678")
        }
    }

    #[tokio::test]
    async fn test_reused_object_path_new_sms_forwarded() {
        let (connector, _) = bus(0, Vec::new(), false);
        let mut listener = SignalListener::new(connector);
        let (tx, mut rx) = mpsc::unbounded_channel();

        // ModemManager restarted in between and numbers its SMS objects from 0 again
        let path = "/org/freedesktop/ModemManager1/SMS/0";
        let payloads = vec![
            with_body(path, "before restart", "2024-01-15T10:00:00+01"),
            with_body(path, "after restart", "2024-01-16T09:30:00+01"),
        ];
        let forwarded = listener.pump(Box::pin(stream::iter(payloads)), &tx).await;

        assert_eq!(forwarded, 2);
        assert_eq!(rx.try_recv().unwrap().body, "before restart");
        assert_eq!(rx.try_recv().unwrap().body, "after restart");
    }

    #[tokio::test]
    async fn test_same_sms_under_new_path_forwarded_once() {
        let (connector, _) = bus(0, Vec::new(), false);
        let mut listener = SignalListener::new(connector);
        let (tx, mut rx) = mpsc::unbounded_channel();

        let payloads = vec![
            with_body("/org/freedesktop/ModemManager1/SMS/7", "stored", "2024-01-15T10:00:00+01"),
            with_body("/org/freedesktop/ModemManager1/SMS/0", "stored", "2024-01-15T10:00:00+01"),
        ];
        let forwarded = listener.pump(Box::pin(stream::iter(payloads)), &tx).await;

        assert_eq!(forwarded, 1);
        assert_eq!(rx.try_recv().unwrap().body, "stored");
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_closed_channel_does_not_mark_seen() {
        let (connector, _) = bus(0, Vec::new(), false);
        let mut listener = SignalListener::new(connector);

        let (closed_tx, closed_rx) = mpsc::unbounded_channel();
        drop(closed_rx);
        let forwarded = listener
            .pump(Box::pin(stream::iter(vec![valid("/sms/1", "+49151")])), &closed_tx)
            .await;
        assert_eq!(forwarded, 0);

        let (tx, mut rx) = mpsc::unbounded_channel();
        let forwarded = listener
            .pump(Box::pin(stream::iter(vec![valid("/sms/1", "+49151")])), &tx)
            .await;
        assert_eq!(forwarded, 1);
        assert!(rx.try_recv().is_ok());
    }

    #[tokio::test]
    async fn test_duplicate_notification_forwarded_once() {
        let (connector, _) = bus(0, Vec::new(), false);
        let mut listener = SignalListener::new(connector);
        let (tx, mut rx) = mpsc::unbounded_channel();

        let payloads = vec![
            valid("/sms/7", "+49151"),
            valid("/sms/7", "+49151"),
            valid("/sms/8", "+49152"),
        ];
        let forwarded = listener.pump(Box::pin(stream::iter(payloads)), &tx).await;

        assert_eq!(forwarded, 2);
        assert_eq!(rx.try_recv().unwrap().sender, "+49151");
        assert_eq!(rx.try_recv().unwrap().sender, "+49152");
    }

    #[tokio::test]
    async fn test_stored_outgoing_sms_skipped() {
        let (connector, _) = bus(0, Vec::new(), false);
        let mut listener = SignalListener::new(connector);
        let (tx, mut rx) = mpsc::unbounded_channel();

        let mut sent = valid("/sms/9", "+49151");
        sent.state = Some(5);
        let forwarded = listener.pump(Box::pin(stream::iter(vec![sent])), &tx).await;

        assert_eq!(forwarded, 0);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_reconnects_after_connection_errors() {
        let (connector, subscriptions) = bus(2, vec![valid("/sms/1", "+49151")], true);
        let listener = SignalListener::new(connector).with_backoff(fast());
        let (tx, mut rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let handle = tokio::spawn(listener.run(tx, shutdown_rx));

        let sms = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(sms.sender, "+49151");
        assert_eq!(subscriptions.load(Ordering::SeqCst), 3);

        shutdown_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_resubscribe_does_not_replay_forwarded_sms() {
        let (connector, subscriptions) = bus(0, vec![valid("/sms/1", "+49151")], false);
        let listener = SignalListener::new(connector).with_backoff(fast());
        let (tx, mut rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let handle = tokio::spawn(listener.run(tx, shutdown_rx));

        while subscriptions.load(Ordering::SeqCst) < 4 {
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        shutdown_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();

        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_shutdown_before_start() {
        let (connector, subscriptions) = bus(0, Vec::new(), true);
        let listener = SignalListener::new(connector);
        let (tx, _rx) = mpsc::unbounded_channel();
        let (_shutdown_tx, shutdown_rx) = watch::channel(true);

        listener.run(tx, shutdown_rx).await;
        assert_eq!(subscriptions.load(Ordering::SeqCst), 0);
    }
}
