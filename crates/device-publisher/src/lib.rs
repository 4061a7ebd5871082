use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, warn};

use bus_client::{call_with_timeout, BusError, BusTransport, Notification, ObserverId};
use resource_controller::ResourceController;
use types::{ResourceState, Variant};

pub const NAME: &str = "Name";
pub const IMPORT_POWER: &str = "ImportPower";
pub const EXPORT_POWER: &str = "ExportPower";
pub const IMPORT_ENERGY: &str = "ImportEnergy";
pub const EXPORT_ENERGY: &str = "ExportEnergy";

#[derive(Debug, Clone)]
pub struct DeviceConfig {
    pub name: String,
    pub path: String,
    pub interface: String,
    pub call_timeout_ms: u64,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            name: "der".to_string(),
            path: "/der".to_string(),
            interface: "org.der.Device".to_string(),
            call_timeout_ms: 2_000,
        }
    }
}

#[derive(Debug, Error)]
pub enum PublishError {
    #[error("property push failed: {0}")]
    Transport(#[from] BusError),
}

/// Property set of the local device as last pushed to observers.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PublishedProperties {
    pub name: String,
    pub path: String,
    pub interface: String,
    pub state: ResourceState,
}

impl PublishedProperties {
    pub fn entries(&self) -> Vec<(String, Variant)> {
        [NAME, IMPORT_POWER, EXPORT_POWER, IMPORT_ENERGY, EXPORT_ENERGY]
            .into_iter()
            .filter_map(|name| self.get(name).map(|value| (name.to_string(), value)))
            .collect()
    }

    pub fn get(&self, name: &str) -> Option<Variant> {
        let value = match name {
            NAME => Variant::Str(self.name.clone()),
            IMPORT_POWER => Variant::U32(self.state.import_watts),
            EXPORT_POWER => Variant::U32(self.state.export_watts),
            IMPORT_ENERGY => Variant::F64(self.state.import_energy_wh),
            EXPORT_ENERGY => Variant::F64(self.state.export_energy_wh),
            _ => return None,
        };
        Some(value)
    }
}

/// Exposes the local resource to remote observers.
pub struct DevicePublisher<T> {
    transport: T,
    controller: Arc<ResourceController>,
    call_timeout: Duration,
    // held for the whole push so the set is never rewritten mid-notify
    properties: tokio::sync::Mutex<PublishedProperties>,
}

impl<T: BusTransport> DevicePublisher<T> {
    pub fn new(transport: T, controller: Arc<ResourceController>, config: DeviceConfig) -> Self {
        let properties = PublishedProperties {
            name: config.name,
            path: config.path,
            interface: config.interface,
            state: controller.snapshot(),
        };
        Self {
            transport,
            controller,
            call_timeout: Duration::from_millis(config.call_timeout_ms),
            properties: tokio::sync::Mutex::new(properties),
        }
    }

    /// Observers attached to the device object on the transport.
    pub fn observer_count(&self) -> usize {
        self.transport.observers().len()
    }

    /// Refreshes the property set and notifies every observer attached on the transport.
    ///
    /// Returns the number of observers the transport delivered to; zero observers is not
    /// an error and makes no transport call.
    pub async fn push(&self) -> Result<usize, PublishError> {
        let mut properties = self.properties.lock().await;
        properties.state = self.controller.snapshot();

        let observers: Vec<ObserverId> = self.transport.observers();
        if observers.is_empty() {
            debug!("no observers attached, skipping push");
            return Ok(0);
        }

        let notification = Notification {
            path: properties.path.clone(),
            interface: properties.interface.clone(),
            properties: properties.entries(),
        };
        let delivered = call_with_timeout(
            self.call_timeout,
            self.transport.notify(&observers, &notification),
        )
        .await?;

        if delivered == 0 {
            warn!(observers = observers.len(), "push reached no observer");
            return Ok(0);
        }
        metrics::counter!("der_pushes_total").increment(1);
        info!(
            observers = delivered,
            import_watts = properties.state.import_watts,
            export_watts = properties.state.export_watts,
            "properties pushed"
        );
        Ok(delivered)
    }

    pub async fn properties(&self) -> PublishedProperties {
        self.properties.lock().await.clone()
    }

    /// Reads one published property, as a remote `Get` would.
    pub async fn property(&self, name: &str) -> Option<Variant> {
        self.properties.lock().await.get(name)
    }
}
