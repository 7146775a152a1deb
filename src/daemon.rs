//! Daemon loop
//!
//! Wires the signal listener to the dispatcher. Each SMS is dispatched on its own task so
//! a slow SMTP server never holds up the bus. On shutdown, in-flight dispatches get a grace
//! period; whatever is left is recorded as failed.

use crate::config::{Context, BODY_PREVIEW_CHARS};
use crate::dispatcher::{log_outcome, wait_for_shutdown, Dispatcher, FailureReason, Outcome};
use crate::listener::SignalListener;
use crate::mailer::MailTransport;
use crate::modem::{BusConnector, SmsStore};
use crate::sms::IncomingSms;
use futures::FutureExt;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

/// How long the listener gets to unsubscribe after shutdown
const LISTENER_STOP_TIMEOUT: Duration = Duration::from_secs(5);

/// Counters reported when the daemon stops
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DaemonStats {
    pub received: usize,
    pub delivered: usize,
    pub failed: usize,
    /// Part of `failed`: cut off by shutdown
    pub abandoned: usize,
}

impl DaemonStats {
    fn record(&mut self, outcome: &Outcome) {
        match outcome {
            Outcome::Delivered { .. } => self.delivered += 1,
            Outcome::Failed { reason, .. } => {
                self.failed += 1;
                if *reason == FailureReason::Shutdown {
                    self.abandoned += 1;
                }
            }
        }
    }
}

/// An SMS handed to a dispatch task that has not finished yet
struct InFlight {
    sender: String,
    preview: String,
    to: Option<String>,
}

impl InFlight {
    fn new(ctx: &Context, sms: &IncomingSms) -> Self {
        Self {
            sender: sms.sender.clone(),
            preview: sms.preview(BODY_PREVIEW_CHARS),
            to: ctx
                .rules
                .resolve(&sms.sender)
                .map(|route| route.recipient().to_string()),
        }
    }

    /// Log the terminal record on behalf of a dispatch that could not
    fn conclude(&self, outcome: &Outcome) {
        log_outcome(&self.sender, &self.preview, self.to.as_deref(), outcome);
    }
}

/// Run until `shutdown` turns true, then drain and return what happened
pub async fn run<C>(
    ctx: Arc<Context>,
    connector: C,
    transport: Arc<dyn MailTransport>,
    store: Option<Arc<dyn SmsStore>>,
    shutdown: watch::Receiver<bool>,
) -> DaemonStats
where
    C: BusConnector + 'static,
{
    info!(
        rules = ctx.rules.len(),
        smtp = %ctx.smtp.host,
        max_attempts = ctx.retry.max_attempts,
        "sms2mail daemon starting"
    );

    let (tx, mut rx) = mpsc::unbounded_channel::<IncomingSms>();
    let mut listener = tokio::spawn(SignalListener::new(connector).run(tx, shutdown.clone()));

    let dispatcher = Arc::new(Dispatcher::new(ctx.clone(), transport).with_store(store));
    let mut tasks: JoinSet<(u64, Option<Outcome>)> = JoinSet::new();
    let mut in_flight: HashMap<u64, InFlight> = HashMap::new();
    let mut next_id: u64 = 0;
    let mut stats = DaemonStats::default();
    let mut stop = shutdown.clone();

    // ========================================================================
    // Main loop
    // ========================================================================

    loop {
        tokio::select! {
            biased;

            _ = wait_for_shutdown(&mut stop) => {
                info!("Shutdown requested");
                break;
            }

            received = rx.recv() => {
                let Some(sms) = received else {
                    warn!("Signal listener stopped");
                    break;
                };
                stats.received += 1;

                let id = next_id;
                next_id += 1;
                in_flight.insert(id, InFlight::new(&ctx, &sms));

                let dispatcher = dispatcher.clone();
                let shutdown = shutdown.clone();
                tasks.spawn(async move {
                    // None when the dispatch panicked before logging an outcome
                    let outcome = AssertUnwindSafe(dispatcher.dispatch(&sms, shutdown))
                        .catch_unwind()
                        .await
                        .ok();
                    (id, outcome)
                });
                debug!(in_flight = in_flight.len(), "Dispatch started");
            }

            Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                finish(joined, &mut in_flight, &mut stats);
            }
        }
    }

    // ========================================================================
    // Shutdown
    // ========================================================================

    // Queued but never started
    rx.close();
    while let Ok(sms) = rx.try_recv() {
        let outcome = Outcome::shutdown(0);
        stats.received += 1;
        stats.record(&outcome);
        InFlight::new(&ctx, &sms).conclude(&outcome);
    }

    if !in_flight.is_empty() {
        info!(
            in_flight = in_flight.len(),
            grace_secs = ctx.shutdown_grace.as_secs_f64(),
            "Waiting for in-flight dispatches"
        );
    }

    let deadline = tokio::time::sleep(ctx.shutdown_grace);
    tokio::pin!(deadline);
    while !tasks.is_empty() {
        tokio::select! {
            joined = tasks.join_next() => match joined {
                Some(joined) => finish(joined, &mut in_flight, &mut stats),
                None => break,
            },
            _ = &mut deadline => {
                warn!(remaining = in_flight.len(), "Shutdown grace period expired");
                break;
            }
        }
    }

    for (_, abandoned) in in_flight.drain() {
        let outcome = Outcome::shutdown(0);
        stats.record(&outcome);
        abandoned.conclude(&outcome);
    }
    tasks.shutdown().await;

    if tokio::time::timeout(LISTENER_STOP_TIMEOUT, &mut listener)
        .await
        .is_err()
    {
        warn!("Signal listener did not stop in time");
        listener.abort();
    }

    info!(
        received = stats.received,
        delivered = stats.delivered,
        failed = stats.failed,
        abandoned = stats.abandoned,
        "sms2mail daemon stopped"
    );
    stats
}

fn finish(
    joined: Result<(u64, Option<Outcome>), tokio::task::JoinError>,
    in_flight: &mut HashMap<u64, InFlight>,
    stats: &mut DaemonStats,
) {
    let (id, outcome) = match joined {
        Ok(joined) => joined,
        Err(e) => {
            // Only aborted tasks end up here; their entries are concluded at shutdown
            error!(error = %e, "Dispatch task did not complete");
            return;
        }
    };
    let flight = in_flight.remove(&id);

    match outcome {
        Some(outcome) => stats.record(&outcome),
        None => {
            let outcome = Outcome::Failed {
                reason: FailureReason::Panicked,
                attempts: 0,
                detail: "dispatch task panicked".to_string(),
            };
            stats.record(&outcome);
            if let Some(flight) = flight {
                flight.conclude(&outcome);
            }
        }
    }
}
