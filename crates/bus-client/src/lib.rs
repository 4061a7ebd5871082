use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{debug, warn};

use types::{PublisherId, Variant};

/// Settings shared by every call made through a bus attachment.
#[cfg_attr(feature = "config", derive(serde::Serialize, serde::Deserialize))]
#[derive(Debug, Clone)]
pub struct BusConfig {
    pub app_name: String,
    /// Upper bound for a single outbound transport call.
    pub call_timeout_ms: u64,
    /// Capacity of the inbound discovery/property event channel.
    pub event_capacity: usize,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            app_name: "der-node".to_string(),
            call_timeout_ms: 2_000,
            event_capacity: 64,
        }
    }
}

#[derive(Debug, Error)]
pub enum BusError {
    #[error("bus call timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },
    #[error("bus attachment closed")]
    Closed,
    #[error("unknown publisher {0}")]
    UnknownPublisher(PublisherId),
    #[error("nested bus call from a dispatch callback without concurrent callbacks enabled")]
    NestedCallDisallowed,
    #[error("bus rejected call: {0}")]
    Rejected(String),
}

/// Opaque bus address of a remote observer of the local object.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObserverId(pub String);

impl fmt::Display for ObserverId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Inbound notifications raised by the transport's dispatch context.
#[derive(Debug, Clone, PartialEq)]
pub enum BusEvent {
    Discovered(PublisherId),
    Lost(PublisherId),
    PropertiesChanged {
        publisher: PublisherId,
        interface: String,
        changed: Variant,
        invalidated: Vec<String>,
    },
}

/// Property values emitted for the local object.
#[derive(Debug, Clone, PartialEq)]
pub struct Notification {
    pub path: String,
    pub interface: String,
    pub properties: Vec<(String, Variant)>,
}

/// Outbound half of the message bus.
///
/// Calls made from inside a dispatch callback can re-enter application code, so the
/// caller must invoke [`BusTransport::enable_concurrent_callbacks`] before issuing one.
pub trait BusTransport: Send + Sync + 'static {
    fn enable_concurrent_callbacks(&self);

    fn subscribe(
        &self,
        publisher: &PublisherId,
        interface: &str,
        names: &[&str],
    ) -> impl Future<Output = Result<(), BusError>> + Send;

    fn unsubscribe(
        &self,
        publisher: &PublisherId,
        interface: &str,
    ) -> impl Future<Output = Result<(), BusError>> + Send;

    /// Observers currently attached to the local object, in a stable order.
    fn observers(&self) -> Vec<ObserverId>;

    /// Sends `notification` to each listed observer and returns how many received it.
    /// An observer the transport does not know is not counted.
    fn notify(
        &self,
        observers: &[ObserverId],
        notification: &Notification,
    ) -> impl Future<Output = Result<usize, BusError>> + Send;
}

/// Runs a transport call with an explicit deadline.
pub async fn call_with_timeout<T, F>(call_timeout: Duration, call: F) -> Result<T, BusError>
where
    F: Future<Output = Result<T, BusError>>,
{
    match timeout(call_timeout, call).await {
        Ok(result) => result,
        Err(_) => Err(BusError::Timeout {
            timeout_ms: call_timeout.as_millis() as u64,
        }),
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
    pub interface: String,
    pub names: Vec<String>,
}

/// In-process loopback bus.
///
/// Remote publishers are simulated with [`LocalBus::announce`], [`LocalBus::withdraw`] and
/// [`LocalBus::change_properties`]; local observers receive `notify` payloads on channels
/// returned by [`LocalBus::attach_observer`].
#[derive(Debug, Clone)]
pub struct LocalBus {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    config: BusConfig,
    events: mpsc::Sender<BusEvent>,
    subscriptions: Mutex<HashMap<PublisherId, Subscription>>,
    observers: Mutex<HashMap<ObserverId, mpsc::UnboundedSender<Notification>>>,
    concurrent_callbacks: AtomicBool,
    reject_calls: AtomicBool,
    notify_calls: AtomicU64,
    unsubscribe_calls: AtomicU64,
}

impl LocalBus {
    pub fn new(config: BusConfig) -> (Self, mpsc::Receiver<BusEvent>) {
        let (events, rx) = mpsc::channel(config.event_capacity.max(1));
        let bus = Self {
            inner: Arc::new(Inner {
                config,
                events,
                subscriptions: Mutex::new(HashMap::new()),
                observers: Mutex::new(HashMap::new()),
                concurrent_callbacks: AtomicBool::new(false),
                reject_calls: AtomicBool::new(false),
                notify_calls: AtomicU64::new(0),
                unsubscribe_calls: AtomicU64::new(0),
            }),
        };
        (bus, rx)
    }

    pub fn config(&self) -> &BusConfig {
        &self.inner.config
    }

    pub async fn announce(&self, publisher: PublisherId) -> Result<(), BusError> {
        self.dispatch(BusEvent::Discovered(publisher)).await
    }

    pub async fn withdraw(&self, publisher: PublisherId) -> Result<(), BusError> {
        self.dispatch(BusEvent::Lost(publisher)).await
    }

    pub async fn change_properties(
        &self,
        publisher: PublisherId,
        interface: impl Into<String>,
        changed: Variant,
        invalidated: Vec<String>,
    ) -> Result<(), BusError> {
        self.dispatch(BusEvent::PropertiesChanged {
            publisher,
            interface: interface.into(),
            changed,
            invalidated,
        })
        .await
    }

    pub fn attach_observer(&self, id: ObserverId) -> mpsc::UnboundedReceiver<Notification> {
        let (tx, rx) = mpsc::unbounded_channel();
        lock(&self.inner.observers).insert(id, tx);
        rx
    }

    pub fn detach_observer(&self, id: &ObserverId) {
        lock(&self.inner.observers).remove(id);
    }

    pub fn subscription(&self, publisher: &PublisherId) -> Option<Subscription> {
        lock(&self.inner.subscriptions).get(publisher).cloned()
    }

    pub fn concurrent_callbacks_enabled(&self) -> bool {
        self.inner.concurrent_callbacks.load(Ordering::SeqCst)
    }

    /// Makes every subsequent outbound call fail until reset.
    pub fn set_reject_calls(&self, reject: bool) {
        self.inner.reject_calls.store(reject, Ordering::SeqCst);
    }

    pub fn notify_count(&self) -> u64 {
        self.inner.notify_calls.load(Ordering::SeqCst)
    }

    /// Unsubscribe calls seen, including rejected ones.
    pub fn unsubscribe_count(&self) -> u64 {
        self.inner.unsubscribe_calls.load(Ordering::SeqCst)
    }

    async fn dispatch(&self, event: BusEvent) -> Result<(), BusError> {
        self.inner.events.send(event).await.map_err(|_| BusError::Closed)
    }

    fn check_rejected(&self, call: &str) -> Result<(), BusError> {
        if self.inner.reject_calls.load(Ordering::SeqCst) {
            warn!(call, "local bus rejecting call");
            return Err(BusError::Rejected(call.to_string()));
        }
        Ok(())
    }
}

impl BusTransport for LocalBus {
    fn enable_concurrent_callbacks(&self) {
        self.inner.concurrent_callbacks.store(true, Ordering::SeqCst);
    }

    async fn subscribe(
        &self,
        publisher: &PublisherId,
        interface: &str,
        names: &[&str],
    ) -> Result<(), BusError> {
        self.check_rejected("subscribe")?;
        if !self.concurrent_callbacks_enabled() {
            return Err(BusError::NestedCallDisallowed);
        }
        let subscription = Subscription {
            interface: interface.to_string(),
            names: names.iter().map(|name| name.to_string()).collect(),
        };
        lock(&self.inner.subscriptions).insert(publisher.clone(), subscription);
        debug!(publisher = %publisher, interface, "properties-changed listener registered");
        Ok(())
    }

    async fn unsubscribe(&self, publisher: &PublisherId, interface: &str) -> Result<(), BusError> {
        self.inner.unsubscribe_calls.fetch_add(1, Ordering::SeqCst);
        self.check_rejected("unsubscribe")?;
        match lock(&self.inner.subscriptions).remove(publisher) {
            Some(_) => {
                debug!(publisher = %publisher, interface, "properties-changed listener removed");
                Ok(())
            }
            None => Err(BusError::UnknownPublisher(publisher.clone())),
        }
    }

    fn observers(&self) -> Vec<ObserverId> {
        let mut ids: Vec<ObserverId> = lock(&self.inner.observers).keys().cloned().collect();
        ids.sort();
        ids
    }

    async fn notify(
        &self,
        observers: &[ObserverId],
        notification: &Notification,
    ) -> Result<usize, BusError> {
        self.check_rejected("notify")?;
        self.inner.notify_calls.fetch_add(1, Ordering::SeqCst);
        let mut table = lock(&self.inner.observers);
        let mut delivered = 0;
        for id in observers {
            match table.get(id) {
                Some(tx) if tx.send(notification.clone()).is_ok() => delivered += 1,
                Some(_) => {
                    debug!(observer = %id, "observer gone, dropping");
                    table.remove(id);
                }
                None => debug!(observer = %id, "unknown observer, not delivered"),
            }
        }
        Ok(delivered)
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
