//! ModemManager over D-Bus
//!
//! Subscribes to `Messaging.Added` on the system bus and reads SMS objects. The rest of
//! the crate only sees the [`BusConnector`] and [`SmsStore`] traits.

use crate::error::BusConnectionError;
use crate::sms::{SmsOrigin, SmsPayload, SmsState};
use async_trait::async_trait;
use futures::future::{self, Future};
use futures::stream::{self, Stream, StreamExt};
use std::pin::Pin;
use std::time::Duration;
use tracing::{debug, info, warn};
use zbus::fdo::ObjectManagerProxy;
use zbus::proxy::CacheProperties;
use zbus::zvariant::{ObjectPath, OwnedObjectPath};
use zbus::{Connection, MatchRule, MessageStream};

pub const MM_SERVICE: &str = "org.freedesktop.ModemManager1";
pub const MM_PATH: &str = "/org/freedesktop/ModemManager1";
pub const MESSAGING_INTERFACE: &str = "org.freedesktop.ModemManager1.Modem.Messaging";

/// Re-reads of a multipart SMS still in `Receiving` state
const RECEIVING_POLLS: u32 = 5;
const RECEIVING_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// SMS objects read at the same time
const CONCURRENT_READS: usize = 8;

#[zbus::proxy(
    interface = "org.freedesktop.ModemManager1.Modem.Messaging",
    default_service = "org.freedesktop.ModemManager1",
    gen_blocking = false
)]
trait Messaging {
    fn delete(&self, path: &ObjectPath<'_>) -> zbus::Result<()>;

    #[zbus(property)]
    fn messages(&self) -> zbus::Result<Vec<OwnedObjectPath>>;
}

#[zbus::proxy(
    interface = "org.freedesktop.ModemManager1.Sms",
    default_service = "org.freedesktop.ModemManager1",
    gen_blocking = false
)]
trait Sms {
    #[zbus(property)]
    fn number(&self) -> zbus::Result<String>;

    #[zbus(property)]
    fn text(&self) -> zbus::Result<String>;

    #[zbus(property)]
    fn state(&self) -> zbus::Result<u32>;

    #[zbus(property)]
    fn timestamp(&self) -> zbus::Result<String>;
}

/// Stream of SMS property bags, one per notification
pub type SmsStream = Pin<Box<dyn Stream<Item = SmsPayload> + Send>>;

/// Source of SMS notifications. `subscribe` is called again after the stream ends.
#[async_trait]
pub trait BusConnector: Send + Sync {
    async fn subscribe(&self) -> Result<SmsStream, BusConnectionError>;
}

/// Removes forwarded messages from the modem
#[async_trait]
pub trait SmsStore: Send + Sync {
    async fn delete(&self, origin: &SmsOrigin) -> Result<(), BusConnectionError>;
}

/// The real ModemManager on the system bus
#[derive(Debug, Clone)]
pub struct ModemManagerBus {
    process_existing: bool,
}

impl ModemManagerBus {
    /// With `process_existing`, each subscription first yields the received SMS already
    /// stored on every modem.
    pub fn new(process_existing: bool) -> Self {
        Self { process_existing }
    }
}

#[async_trait]
impl BusConnector for ModemManagerBus {
    async fn subscribe(&self) -> Result<SmsStream, BusConnectionError> {
        let connection = Connection::system().await?;

        let rule = MatchRule::builder()
            .msg_type(zbus::message::Type::Signal)
            .interface(MESSAGING_INTERFACE)?
            .member("Added")?
            .build();
        let signals = MessageStream::for_match_rule(rule, &connection, None).await?;

        let existing = if self.process_existing {
            stored_messages(&connection).await?
        } else {
            Vec::new()
        };
        info!(stored = existing.len(), "Subscribed to ModemManager SMS signals");

        let conn = connection.clone();
        let stored = read_concurrently(stream::iter(existing), move |(modem_path, sms_path)| {
            let conn = conn.clone();
            async move { read_logged(&conn, modem_path, sms_path).await }
        });

        let added = read_concurrently(signals, move |message| {
            let conn = connection.clone();
            async move {
                let message = match message {
                    Ok(message) => message,
                    Err(e) => {
                        warn!(error = %e, "Error on signal stream");
                        return None;
                    }
                };

                let modem_path = message.header().path()?.to_string();
                let (sms_path, received): (OwnedObjectPath, bool) =
                    match message.body().deserialize() {
                        Ok(args) => args,
                        Err(e) => {
                            warn!(modem = %modem_path, error = %e, "Undecodable Added signal");
                            return None;
                        }
                    };

                if !received {
                    debug!(sms = %sms_path, "Ignoring locally created SMS");
                    return None;
                }
                read_logged(&conn, modem_path, sms_path.to_string()).await
            }
        });

        Ok(Box::pin(stored.chain(added)))
    }
}

/// Deletes SMS objects through the modem's Messaging interface
#[derive(Debug, Clone, Default)]
pub struct ModemManagerStore;

#[async_trait]
impl SmsStore for ModemManagerStore {
    async fn delete(&self, origin: &SmsOrigin) -> Result<(), BusConnectionError> {
        let connection = Connection::system().await?;
        let messaging = MessagingProxy::builder(&connection)
            .path(origin.modem_path.as_str())?
            .build()
            .await?;
        let sms_path =
            ObjectPath::try_from(origin.sms_path.as_str()).map_err(zbus::Error::from)?;
        messaging.delete(&sms_path).await?;
        Ok(())
    }
}

/// Run `read` for each item with up to [`CONCURRENT_READS`] in flight, yielding results in
/// completion order. An SMS waiting for its remaining parts does not hold up later ones.
fn read_concurrently<S, F, Fut>(items: S, read: F) -> impl Stream<Item = SmsPayload> + Send
where
    S: Stream + Send,
    F: FnMut(S::Item) -> Fut + Send,
    Fut: Future<Output = Option<SmsPayload>> + Send,
{
    items
        .map(read)
        .buffer_unordered(CONCURRENT_READS)
        .filter_map(future::ready)
}

/// (modem path, sms path) for every SMS stored on any modem
async fn stored_messages(
    connection: &Connection,
) -> Result<Vec<(String, String)>, BusConnectionError> {
    let manager = ObjectManagerProxy::builder(connection)
        .destination(MM_SERVICE)?
        .path(MM_PATH)?
        .build()
        .await?;

    let objects = manager.get_managed_objects().await?;
    let mut found = Vec::new();

    for (modem_path, interfaces) in objects {
        if !interfaces.keys().any(|name| name.as_str() == MESSAGING_INTERFACE) {
            continue;
        }

        let messaging = MessagingProxy::builder(connection)
            .path(modem_path.as_str())?
            .cache_properties(CacheProperties::No)
            .build()
            .await?;

        for sms_path in messaging.messages().await? {
            found.push((modem_path.to_string(), sms_path.to_string()));
        }
    }

    Ok(found)
}

async fn read_logged(
    connection: &Connection,
    modem_path: String,
    sms_path: String,
) -> Option<SmsPayload> {
    match read_sms(connection, &modem_path, &sms_path).await {
        Ok(payload) => Some(payload),
        Err(e) => {
            warn!(sms = %sms_path, error = %e, "Failed to read SMS properties");
            None
        }
    }
}

/// Read an SMS object's properties, waiting briefly for multipart messages to complete
async fn read_sms(
    connection: &Connection,
    modem_path: &str,
    sms_path: &str,
) -> zbus::Result<SmsPayload> {
    let sms = SmsProxy::builder(connection)
        .path(sms_path)?
        .cache_properties(CacheProperties::No)
        .build()
        .await?;

    let mut state = sms.state().await?;
    for _ in 0..RECEIVING_POLLS {
        if SmsState::from_raw(state) != SmsState::Receiving {
            break;
        }
        debug!(sms = %sms_path, "SMS still receiving, waiting for remaining parts");
        tokio::time::sleep(RECEIVING_POLL_INTERVAL).await;
        state = sms.state().await?;
    }

    Ok(SmsPayload {
        number: sms.number().await.ok(),
        text: sms.text().await.ok(),
        state: Some(state),
        timestamp: sms.timestamp().await.ok(),
        origin: Some(SmsOrigin {
            modem_path: modem_path.to_string(),
            sms_path: sms_path.to_string(),
        }),
    })
}
