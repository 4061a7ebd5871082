use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use bus_client::{LocalBus, Notification, ObserverId};

/// Attaches a local observer to the device object and logs every property push it
/// receives. The task resolves to the number of pushes seen.
pub fn spawn_property_monitor(
    bus: &LocalBus,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<u64> {
    let id = ObserverId(format!("{}.monitor", bus.config().app_name));
    let mut notifications = bus.attach_observer(id.clone());
    info!(observer = %id, "property monitor attached");

    tokio::spawn(async move {
        let mut seen = 0;
        loop {
            tokio::select! {
                // queued pushes drain before shutdown is honoured
                biased;
                maybe = notifications.recv() => match maybe {
                    Some(notification) => {
                        seen += 1;
                        log_notification(&notification);
                    }
                    None => break,
                },
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        debug!(observer = %id, seen, "property monitor stopped");
        seen
    })
}

fn log_notification(notification: &Notification) {
    let properties: Vec<String> = notification
        .properties
        .iter()
        .map(|(name, value)| format!("{name}={value:?}"))
        .collect();
    info!(
        path = %notification.path,
        interface = %notification.interface,
        properties = %properties.join(" "),
        "properties changed"
    );
}
