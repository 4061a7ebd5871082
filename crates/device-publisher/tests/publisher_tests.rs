use std::sync::Arc;

use bus_client::{BusConfig, LocalBus, ObserverId};
use device_publisher::{DeviceConfig, DevicePublisher, PublishError};
use resource_controller::ResourceController;
use types::Variant;

fn publisher(controller: Arc<ResourceController>) -> (LocalBus, DevicePublisher<LocalBus>) {
    let (bus, _events) = LocalBus::new(BusConfig::default());
    let publisher = DevicePublisher::new(bus.clone(), controller, DeviceConfig::default());
    (bus, publisher)
}

#[tokio::test]
async fn push_without_observers_is_silent() {
    let (bus, publisher) = publisher(Arc::new(ResourceController::new()));

    assert_eq!(publisher.push().await.expect("push"), 0);
    assert_eq!(publisher.push().await.expect("push again"), 0);
    assert_eq!(bus.notify_count(), 0);
}

#[tokio::test]
async fn push_sends_current_snapshot_to_observers() {
    let controller = Arc::new(ResourceController::with_setpoints(1_200, 0));
    controller.tick(3_600_000);
    let (bus, publisher) = publisher(Arc::clone(&controller));
    let observer = ObserverId(":1.20".to_string());
    let mut rx = bus.attach_observer(observer);
    assert_eq!(publisher.observer_count(), 1);

    assert_eq!(publisher.push().await.expect("push"), 1);

    let notification = rx.recv().await.expect("notification");
    assert_eq!(notification.path, "/der");
    assert_eq!(notification.interface, "org.der.Device");
    assert_eq!(
        notification.properties[0],
        ("Name".to_string(), Variant::Str("der".to_string()))
    );
    assert!(notification
        .properties
        .contains(&("ImportPower".to_string(), Variant::U32(1_200))));
    assert!(notification
        .properties
        .contains(&("ImportEnergy".to_string(), Variant::F64(1_200.0))));
}

#[tokio::test]
async fn properties_refresh_on_push_only() {
    let controller = Arc::new(ResourceController::new());
    let (_bus, publisher) = publisher(Arc::clone(&controller));

    controller.set_export_watts(750);
    assert_eq!(publisher.property("ExportPower").await, Some(Variant::U32(0)));

    publisher.push().await.expect("push");
    assert_eq!(
        publisher.property("ExportPower").await,
        Some(Variant::U32(750))
    );
    assert_eq!(publisher.property("Missing").await, None);
    assert_eq!(publisher.properties().await.state.export_watts, 750);
}

#[tokio::test]
async fn transport_failure_is_surfaced() {
    let (bus, publisher) = publisher(Arc::new(ResourceController::new()));
    let _rx = bus.attach_observer(ObserverId(":1.21".to_string()));
    bus.set_reject_calls(true);

    let err = publisher.push().await.expect_err("rejected");
    assert!(matches!(err, PublishError::Transport(_)));
}

#[tokio::test]
async fn detached_observer_is_not_notified() {
    let (bus, publisher) = publisher(Arc::new(ResourceController::new()));
    let observer = ObserverId(":1.22".to_string());
    let _rx = bus.attach_observer(observer.clone());
    bus.detach_observer(&observer);
    assert_eq!(publisher.observer_count(), 0);

    assert_eq!(publisher.push().await.expect("push"), 0);
    assert_eq!(bus.notify_count(), 0);
}

#[tokio::test]
async fn push_counts_only_delivered_observers() {
    let (bus, publisher) = publisher(Arc::new(ResourceController::with_setpoints(5, 0)));
    let mut live = bus.attach_observer(ObserverId(":1.23".to_string()));
    drop(bus.attach_observer(ObserverId(":1.24".to_string())));

    assert_eq!(publisher.push().await.expect("push"), 1);
    assert!(live.recv().await.is_some());
    assert_eq!(publisher.observer_count(), 1);

    drop(live);
    assert_eq!(publisher.push().await.expect("push to closed observer"), 0);
    assert_eq!(publisher.observer_count(), 0);
}

#[tokio::test]
async fn property_dump_serializes() {
    let controller = Arc::new(ResourceController::with_setpoints(10, 20));
    let (_bus, publisher) = publisher(controller);
    publisher.push().await.expect("push");

    let json = serde_json::to_value(publisher.properties().await).expect("json");
    assert_eq!(json["name"], "der");
    assert_eq!(json["state"]["import_watts"], 10);
    assert_eq!(json["state"]["export_watts"], 20);
}
