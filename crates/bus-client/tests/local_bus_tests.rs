use std::time::Duration;

use bus_client::{
    call_with_timeout, BusConfig, BusError, BusEvent, BusTransport, LocalBus, Notification,
    ObserverId,
};
use types::{PublisherId, Variant};

fn publisher() -> PublisherId {
    PublisherId::new(":1.42", "/ems/server")
}

#[tokio::test]
async fn subscribe_requires_concurrent_callbacks() {
    let (bus, _events) = LocalBus::new(BusConfig::default());

    let err = bus
        .subscribe(&publisher(), "org.ems.Server", &["Time"])
        .await
        .expect_err("nested call should be refused");
    assert!(matches!(err, BusError::NestedCallDisallowed));

    bus.enable_concurrent_callbacks();
    bus.subscribe(&publisher(), "org.ems.Server", &["Time", "price"])
        .await
        .expect("subscribe");

    let subscription = bus.subscription(&publisher()).expect("subscription");
    assert_eq!(subscription.interface, "org.ems.Server");
    assert_eq!(subscription.names, vec!["Time", "price"]);
}

#[tokio::test]
async fn unsubscribe_unknown_publisher_fails() {
    let (bus, _events) = LocalBus::new(BusConfig::default());
    let err = bus
        .unsubscribe(&publisher(), "org.ems.Server")
        .await
        .expect_err("unknown publisher");
    assert!(matches!(err, BusError::UnknownPublisher(_)));
}

#[tokio::test]
async fn announcements_arrive_in_order() {
    let (bus, mut events) = LocalBus::new(BusConfig::default());
    bus.announce(publisher()).await.expect("announce");
    bus.change_properties(
        publisher(),
        "org.ems.Server",
        Variant::Array(vec![Variant::entry("Time", Variant::U32(5))]),
        Vec::new(),
    )
    .await
    .expect("change");
    bus.withdraw(publisher()).await.expect("withdraw");

    assert_eq!(events.recv().await, Some(BusEvent::Discovered(publisher())));
    assert!(matches!(
        events.recv().await,
        Some(BusEvent::PropertiesChanged { .. })
    ));
    assert_eq!(events.recv().await, Some(BusEvent::Lost(publisher())));
}

#[tokio::test]
async fn notify_reaches_attached_observers_only() {
    let (bus, _events) = LocalBus::new(BusConfig::default());
    let alice = ObserverId(":1.7".to_string());
    let bob = ObserverId(":1.8".to_string());
    let mut alice_rx = bus.attach_observer(alice.clone());

    let notification = Notification {
        path: "/der".to_string(),
        interface: "org.der.Device".to_string(),
        properties: vec![("import_power".to_string(), Variant::U32(10))],
    };
    let delivered = bus
        .notify(&[alice, bob], &notification)
        .await
        .expect("notify");

    assert_eq!(delivered, 1, "unknown observer must not count as delivered");
    assert_eq!(alice_rx.recv().await, Some(notification));
    assert_eq!(bus.notify_count(), 1);
}

#[tokio::test]
async fn observers_reflect_attach_and_detach() {
    let (bus, _events) = LocalBus::new(BusConfig::default());
    let first = ObserverId(":1.9".to_string());
    let second = ObserverId(":1.10".to_string());
    let _first_rx = bus.attach_observer(first.clone());
    let _second_rx = bus.attach_observer(second.clone());
    assert_eq!(bus.observers(), vec![second.clone(), first.clone()]);

    bus.detach_observer(&second);
    assert_eq!(bus.observers(), vec![first]);
}

#[tokio::test]
async fn closed_observer_is_dropped_on_notify() {
    let (bus, _events) = LocalBus::new(BusConfig::default());
    let id = ObserverId(":1.11".to_string());
    drop(bus.attach_observer(id.clone()));

    let notification = Notification {
        path: "/der".to_string(),
        interface: "org.der.Device".to_string(),
        properties: Vec::new(),
    };
    let delivered = bus.notify(&[id], &notification).await.expect("notify");
    assert_eq!(delivered, 0);
    assert!(bus.observers().is_empty());
}

#[tokio::test]
async fn rejected_calls_surface_errors() {
    let (bus, _events) = LocalBus::new(BusConfig::default());
    bus.enable_concurrent_callbacks();
    bus.set_reject_calls(true);
    let err = bus
        .subscribe(&publisher(), "org.ems.Server", &["Time"])
        .await
        .expect_err("rejected");
    assert!(matches!(err, BusError::Rejected(_)));
}

#[tokio::test]
async fn call_with_timeout_maps_elapsed_deadline() {
    let result: Result<(), BusError> = call_with_timeout(Duration::from_millis(10), async {
        tokio::time::sleep(Duration::from_millis(200)).await;
        Ok(())
    })
    .await;
    assert!(matches!(result, Err(BusError::Timeout { timeout_ms: 10 })));
}
