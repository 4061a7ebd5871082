use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use bus_client::{call_with_timeout, BusError, BusEvent, BusTransport};
use signal_store::{ApplyReport, SignalStore, SIGNAL_PROPERTIES};
use types::{PublisherId, SignalSample, Variant};

#[cfg_attr(feature = "config", derive(serde::Serialize, serde::Deserialize))]
#[derive(Debug, Clone)]
pub struct SubscriptionConfig {
    /// Interface advertised by price/time publishers.
    pub server_interface: String,
    pub call_timeout_ms: u64,
    /// Drop the properties-changed listener when a publisher disappears.
    pub unsubscribe_on_loss: bool,
}

impl Default for SubscriptionConfig {
    fn default() -> Self {
        Self {
            server_interface: "org.ems.Server".to_string(),
            call_timeout_ms: 2_000,
            unsubscribe_on_loss: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublisherState {
    Discovered,
    Subscribed,
    Lost,
}

#[derive(Debug, Error)]
pub enum SubscriptionError {
    #[error("subscribe to {publisher} failed: {source}")]
    Subscribe {
        publisher: PublisherId,
        source: BusError,
    },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchStats {
    pub discovered: u64,
    pub lost: u64,
    pub changes: u64,
    pub dropped_changes: u64,
}

/// Tracks remote publishers and keeps their signals current in a [`SignalStore`].
pub struct SubscriptionManager<T> {
    transport: T,
    store: Arc<SignalStore>,
    config: SubscriptionConfig,
    publishers: Mutex<HashMap<PublisherId, PublisherState>>,
}

impl<T: BusTransport> SubscriptionManager<T> {
    pub fn new(transport: T, store: Arc<SignalStore>, config: SubscriptionConfig) -> Self {
        Self {
            transport,
            store,
            config,
            publishers: Mutex::new(HashMap::new()),
        }
    }

    pub async fn on_discovered(&self, publisher: PublisherId) -> Result<(), SubscriptionError> {
        info!(publisher = %publisher.unique_name, path = %publisher.path, "publisher discovered");
        metrics::counter!("der_publishers_discovered_total").increment(1);
        self.store.register(&publisher);
        self.set_state(&publisher, PublisherState::Discovered);

        // subscribing re-enters the transport from its own dispatch context
        self.transport.enable_concurrent_callbacks();
        let subscribe = self.transport.subscribe(
            &publisher,
            &self.config.server_interface,
            &SIGNAL_PROPERTIES,
        );
        match call_with_timeout(self.call_timeout(), subscribe).await {
            Ok(()) => {
                self.set_state(&publisher, PublisherState::Subscribed);
                debug!(publisher = %publisher, "properties-changed subscription established");
                Ok(())
            }
            Err(source) => {
                warn!(publisher = %publisher, error = %source, "subscription failed");
                Err(SubscriptionError::Subscribe { publisher, source })
            }
        }
    }

    /// Marks a known publisher unreachable. Its last sample stays readable; a loss for a
    /// publisher never discovered is ignored.
    pub async fn on_lost(&self, publisher: &PublisherId) {
        let Some(previous) = self.mark_lost(publisher) else {
            debug!(publisher = %publisher, "loss for unknown publisher ignored");
            return;
        };
        info!(publisher = %publisher.unique_name, path = %publisher.path, "publisher connection lost");
        metrics::counter!("der_publishers_lost_total").increment(1);

        if !self.config.unsubscribe_on_loss || previous != PublisherState::Subscribed {
            return;
        }
        let unsubscribe = self
            .transport
            .unsubscribe(publisher, &self.config.server_interface);
        if let Err(err) = call_with_timeout(self.call_timeout(), unsubscribe).await {
            warn!(publisher = %publisher, error = %err, "unsubscribe failed");
        }
    }

    /// Applies a change set. Returns `None` when the set could not be read at all.
    pub fn on_properties_changed(
        &self,
        publisher: &PublisherId,
        changed: &Variant,
        invalidated: &[String],
    ) -> Option<ApplyReport> {
        if !invalidated.is_empty() {
            debug!(publisher = %publisher, count = invalidated.len(), "ignoring invalidated properties");
        }

        match self.store.apply_changes(publisher, changed) {
            Ok(report) => {
                if report.failed > 0 {
                    metrics::counter!("der_signal_decode_failures_total")
                        .increment(report.failed as u64);
                }
                debug!(
                    publisher = %publisher,
                    applied = report.applied,
                    ignored = report.ignored,
                    failed = report.failed,
                    "property change applied"
                );
                Some(report)
            }
            Err(err) => {
                metrics::counter!("der_signal_decode_failures_total").increment(1);
                warn!(publisher = %publisher, error = %err, "dropping property change notification");
                None
            }
        }
    }

    pub async fn handle(&self, event: BusEvent, stats: &mut DispatchStats) {
        match event {
            BusEvent::Discovered(publisher) => {
                stats.discovered += 1;
                // failures are already logged; the publisher simply stays unsubscribed
                let _ = self.on_discovered(publisher).await;
            }
            BusEvent::Lost(publisher) => {
                stats.lost += 1;
                self.on_lost(&publisher).await;
            }
            BusEvent::PropertiesChanged {
                publisher,
                interface,
                changed,
                invalidated,
            } => {
                stats.changes += 1;
                debug!(publisher = %publisher, interface = %interface, "properties changed");
                if self
                    .on_properties_changed(&publisher, &changed, &invalidated)
                    .is_none()
                {
                    stats.dropped_changes += 1;
                }
            }
        }
    }

    /// Dispatch loop: consumes transport events until shutdown or until the bus goes away.
    pub async fn run(
        &self,
        mut events: mpsc::Receiver<BusEvent>,
        mut shutdown: watch::Receiver<bool>,
    ) -> DispatchStats {
        let mut stats = DispatchStats::default();
        loop {
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                maybe_event = events.recv() => {
                    match maybe_event {
                        Some(event) => self.handle(event, &mut stats).await,
                        None => {
                            info!("bus event channel closed");
                            break;
                        }
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        info!(
            discovered = stats.discovered,
            lost = stats.lost,
            changes = stats.changes,
            dropped = stats.dropped_changes,
            "subscription dispatch stopped"
        );
        stats
    }

    pub fn signal(&self, publisher: &PublisherId) -> Option<SignalSample> {
        self.store.get(publisher)
    }

    pub fn state(&self, publisher: &PublisherId) -> Option<PublisherState> {
        self.lock().get(publisher).copied()
    }

    pub fn publishers(&self) -> Vec<(PublisherId, PublisherState)> {
        let mut all: Vec<_> = self
            .lock()
            .iter()
            .map(|(id, state)| (id.clone(), *state))
            .collect();
        all.sort_by(|a, b| a.0.cmp(&b.0));
        all
    }

    pub fn store(&self) -> &Arc<SignalStore> {
        &self.store
    }

    fn set_state(&self, publisher: &PublisherId, state: PublisherState) {
        self.lock().insert(publisher.clone(), state);
    }

    fn mark_lost(&self, publisher: &PublisherId) -> Option<PublisherState> {
        let mut publishers = self.lock();
        let state = publishers.get_mut(publisher)?;
        Some(std::mem::replace(state, PublisherState::Lost))
    }

    fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.config.call_timeout_ms)
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<PublisherId, PublisherState>> {
        self.publishers.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
