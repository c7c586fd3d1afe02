//! End-to-end behaviour of a coordinator driven through the loopback
//! transport.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::sync::broadcast;
use tokio::time::sleep;

use greennet_core::event::SharedEventBus;
use greennet_devices::{
    Coordinator, CoordinatorSettings, DeviceError, DiscoveryStatus, MemoryTransport, Notification,
};

const ROOT: &str = "EnOcean/EAG-1";

fn settings() -> CoordinatorSettings {
    let mut settings = CoordinatorSettings::new("EAG-1");
    settings.initial_window = Duration::from_millis(500);
    settings.quiet_period = Duration::from_millis(200);
    settings.telegram_quiet = Duration::from_millis(100);
    settings.delta_quiet = Duration::from_millis(20);
    settings.query_timeout = Duration::from_millis(300);
    settings
}

struct Harness {
    coordinator: Coordinator,
    transport: Arc<MemoryTransport>,
    notifications: broadcast::Receiver<Notification>,
}

impl Harness {
    async fn start() -> Self {
        let transport = Arc::new(MemoryTransport::new());
        let coordinator = Coordinator::start(settings(), transport.clone(), SharedEventBus::new())
            .await
            .unwrap();
        let notifications = coordinator.subscribe().unwrap();
        Self {
            coordinator,
            transport,
            notifications,
        }
    }

    fn inject(&self, suffix: &str, payload: &str) {
        self.transport.inject(format!("{}/{}", ROOT, suffix), payload.to_string());
    }

    async fn answer_devices(&self, body: serde_json::Value) {
        self.inject("getAnswer/devices", &body.to_string());
        sleep(Duration::from_millis(600)).await;
    }

    /// Discovered and updated notifications received so far
    fn drain(&mut self) -> (Vec<String>, Vec<String>) {
        let mut discovered = Vec::new();
        let mut updated = Vec::new();
        while let Ok(notification) = self.notifications.try_recv() {
            match notification {
                Notification::DeviceDiscovered { device, .. } => discovered.push(device.key().to_string()),
                Notification::DeviceStateUpdated { device_key, .. } => updated.push(device_key),
            }
        }
        (discovered, updated)
    }

    fn published_body(&self, suffix: &str) -> Vec<serde_json::Value> {
        self.transport
            .published_to(&format!("{}/{}", ROOT, suffix))
            .iter()
            .map(|m| serde_json::from_slice(&m.payload).unwrap())
            .collect()
    }
}

fn kitchen_dimmer() -> serde_json::Value {
    json!([{
        "deviceId": "0123ABCD",
        "friendlyId": "kitchen",
        "eeps": [{"eep": "D2-01-12"}],
        "manufacturer": "NodOn",
    }])
}

#[tokio::test(start_paused = true)]
async fn fragments_assemble_into_one_device() {
    let mut harness = Harness::start().await;
    for (path, value) in [
        ("deviceId", "0123ABCD"),
        ("friendlyId", "kitchen"),
        ("eeps/0/eep", "D2-01-12"),
        ("functions/0/key", "switch"),
        ("functions/0/value", "on"),
    ] {
        harness.inject(&format!("stream/devices/0123ABCD/{}", path), value);
    }

    sleep(Duration::from_millis(600)).await;

    let devices = harness.coordinator.devices().await.unwrap();
    assert_eq!(devices.len(), 1);
    assert_eq!(devices[0].key(), "kitchen");
    assert_eq!(devices[0].primary_eep(), Some("D2-01-12"));
    assert!(devices[0].channel(0).unwrap().is_on);

    let (discovered, _) = harness.drain();
    assert_eq!(discovered, vec!["kitchen".to_string()]);
}

async fn assert_single_live_device(harness: &mut Harness) {
    let devices = harness.coordinator.devices().await.unwrap();
    assert_eq!(devices.len(), 1);
    assert_eq!(devices[0].device_id, "0123ABCD");
    assert!(devices[0].channel(0).unwrap().is_on);

    let (discovered, updated) = harness.drain();
    assert_eq!(discovered, vec!["0123ABCD".to_string()]);
    assert!(updated.is_empty());
}

#[tokio::test(start_paused = true)]
async fn delta_fragments_assemble_into_one_device() {
    let mut harness = Harness::start().await;
    for (path, value) in [
        ("deviceId", "0123ABCD"),
        ("states/switch", "on"),
        ("states/channel", "0"),
    ] {
        harness.inject(&format!("stream/device/0123ABCD/{}", path), value);
    }

    sleep(Duration::from_millis(50)).await;

    assert_single_live_device(&mut harness).await;
}

#[tokio::test(start_paused = true)]
async fn telegram_fragments_assemble_into_one_device() {
    let mut harness = Harness::start().await;
    for (path, value) in [
        ("deviceId", "0123ABCD"),
        ("states/switch", "on"),
        ("states/channel", "0"),
    ] {
        harness.inject(&format!("stream/telegram/0123ABCD/from/{}", path), value);
    }

    sleep(Duration::from_millis(150)).await;

    assert_single_live_device(&mut harness).await;
}

#[tokio::test(start_paused = true)]
async fn numeric_looking_id_keeps_leading_zeros() {
    let harness = Harness::start().await;
    harness.inject("stream/devices/01234567/deviceId", "01234567");
    harness.inject("stream/devices/01234567/eeps/0/eep", "F6-02-01");
    sleep(Duration::from_millis(600)).await;

    let device = harness.coordinator.device("01234567").await.unwrap().unwrap();
    assert_eq!(device.device_id, "01234567");
    assert_eq!(device.key(), "01234567");
}

#[tokio::test(start_paused = true)]
async fn dimmable_turn_on_sends_dim_value() {
    let mut harness = Harness::start().await;
    harness.answer_devices(kitchen_dimmer()).await;
    harness.drain();
    let mut kitchen = harness.coordinator.subscribe_device("kitchen").unwrap();

    harness.coordinator.turn_on("kitchen", 0, None).await.unwrap();

    assert_eq!(
        harness.published_body("put/devices/0123ABCD/state"),
        vec![json!({"state": {"functions": [{"key": "dimValue", "value": "100"}]}})]
    );

    let device = harness.coordinator.device("kitchen").await.unwrap().unwrap();
    assert_eq!(device.channel(0).unwrap().brightness, Some(100));
    assert!(matches!(
        kitchen.try_recv(),
        Ok(Notification::DeviceStateUpdated { .. })
    ));
}

#[tokio::test(start_paused = true)]
async fn cover_stop_names_channel() {
    let harness = Harness::start().await;
    harness
        .answer_devices(json!([{
            "deviceId": "0456EF01",
            "friendlyId": "blind",
            "eeps": [{"eep": "D2-05-00"}],
        }]))
        .await;

    harness.coordinator.stop_cover("blind", 2).await.unwrap();

    assert_eq!(
        harness.published_body("put/devices/0456EF01/state"),
        vec![json!({"state": {"functions": [
            {"key": "position", "value": "stop"},
            {"key": "channel", "value": "2"},
        ]}})]
    );
}

#[tokio::test(start_paused = true)]
async fn query_timeout_releases_subscription_once() {
    let harness = Harness::start().await;
    harness.answer_devices(kitchen_dimmer()).await;
    let before = harness.transport.unsubscribe_count();

    let result = harness.coordinator.device_profile("kitchen").await;

    assert!(matches!(result, Err(DeviceError::Timeout(_))));
    assert_eq!(harness.transport.unsubscribe_count(), before + 1);
    assert_eq!(harness.transport.active_subscriptions(), 6);
}

#[tokio::test(start_paused = true)]
async fn profile_is_fetched_once() {
    let harness = Harness::start().await;
    harness.answer_devices(kitchen_dimmer()).await;
    harness.transport.respond_to(
        &format!("{}/get/devices/0123ABCD/profile", ROOT),
        &format!("{}/getAnswer/devices/0123ABCD/profile", ROOT),
        r#"{"eep":"D2-01-12","functions":[]}"#,
    );

    let first = harness.coordinator.device_profile("kitchen").await.unwrap();
    let second = harness.coordinator.device_profile("0123ABCD").await.unwrap();

    assert_eq!(first, second);
    assert_eq!(first["eep"], "D2-01-12");
    assert_eq!(harness.published_body("get/devices/0123ABCD/profile").len(), 1);
}

#[tokio::test(start_paused = true)]
async fn resolution_keeps_channel_state() {
    let mut harness = Harness::start().await;
    harness.answer_devices(kitchen_dimmer()).await;
    harness.inject("stream/device/0123ABCD", r#"{"states":{"dimValue":"40"}}"#);
    harness.coordinator.device("kitchen").await.unwrap();
    harness.drain();

    harness
        .answer_devices(json!([{
            "deviceId": "0123ABCD",
            "friendlyId": "kitchen",
            "eeps": [{"eep": "D2-01-12"}],
            "manufacturer": "NodOn SA",
        }]))
        .await;

    let device = harness.coordinator.device("kitchen").await.unwrap().unwrap();
    assert_eq!(device.manufacturer.as_deref(), Some("NodOn SA"));
    assert_eq!(device.channel(0).unwrap().brightness, Some(40));

    let (discovered, updated) = harness.drain();
    assert!(discovered.is_empty());
    assert_eq!(updated, vec!["kitchen".to_string()]);
}

#[tokio::test(start_paused = true)]
async fn stale_snapshot_does_not_override_live_state() {
    let harness = Harness::start().await;
    let relay = json!([{
        "deviceId": "0A",
        "friendlyId": "relay",
        "eeps": [{"eep": "D2-01-00"}],
        "states": {"switch": "on"},
    }]);
    harness.answer_devices(relay.clone()).await;
    let device = harness.coordinator.device("relay").await.unwrap().unwrap();
    assert!(device.channel(0).unwrap().is_on);

    harness.inject("stream/device/0A", r#"{"states":{"switch":"off"}}"#);
    let device = harness.coordinator.device("relay").await.unwrap().unwrap();
    assert!(!device.channel(0).unwrap().is_on);

    harness.answer_devices(relay).await;

    let device = harness.coordinator.device("relay").await.unwrap().unwrap();
    assert!(!device.channel(0).unwrap().is_on);
}

#[tokio::test(start_paused = true)]
async fn telegram_state_ignored_while_live_delta_active() {
    let harness = Harness::start().await;
    harness.answer_devices(kitchen_dimmer()).await;

    harness.inject("stream/device/0123ABCD", r#"{"states":{"dimValue":"0"}}"#);
    harness.inject(
        "stream/telegram/0123ABCD/from",
        r#"{"telegram":{"deviceId":"0123ABCD","functions":[{"key":"dimValue","value":"80"}],"telegramInfo":{"dbm":-61}}}"#,
    );

    let device = harness.coordinator.device("kitchen").await.unwrap().unwrap();
    assert_eq!(device.channel(0).unwrap().brightness, Some(0));
    assert!(!device.channel(0).unwrap().is_on);
    assert_eq!(device.dbm, Some(-61));
}

#[tokio::test(start_paused = true)]
async fn telegram_state_applied_without_live_delta() {
    let harness = Harness::start().await;
    harness.answer_devices(kitchen_dimmer()).await;

    harness.inject("stream/telegram/0123ABCD/from/functions/0/key", "dimValue");
    harness.inject("stream/telegram/0123ABCD/from/functions/0/value", "80");
    sleep(Duration::from_millis(150)).await;

    let device = harness.coordinator.device("kitchen").await.unwrap().unwrap();
    assert_eq!(device.channel(0).unwrap().brightness, Some(80));
}

#[tokio::test(start_paused = true)]
async fn placeholder_upgrades_and_rekeys() {
    let mut harness = Harness::start().await;
    harness.inject("stream/telegram/05A1B2C3/from/functions/0/key", "switch");
    harness.inject("stream/telegram/05A1B2C3/from/functions/0/value", "on");
    sleep(Duration::from_millis(150)).await;

    assert_eq!(
        harness.coordinator.discovery_status("05A1B2C3").await.unwrap(),
        DiscoveryStatus::Pending
    );
    let placeholder = harness.coordinator.device("05A1B2C3").await.unwrap().unwrap();
    assert!(!placeholder.is_resolved());
    assert!(placeholder.channel(0).unwrap().is_on);

    harness
        .answer_devices(json!([{
            "deviceId": "05A1B2C3",
            "friendlyId": "hall",
            "eeps": [{"eep": "D2-01-00"}],
        }]))
        .await;

    let devices = harness.coordinator.devices().await.unwrap();
    assert_eq!(devices.len(), 1);
    assert_eq!(devices[0].key(), "hall");
    assert!(devices[0].channel(0).unwrap().is_on);
    assert_eq!(
        harness.coordinator.discovery_status("05A1B2C3").await.unwrap(),
        DiscoveryStatus::Resolved
    );

    let (discovered, _) = harness.drain();
    assert_eq!(discovered, vec!["05A1B2C3".to_string(), "hall".to_string()]);
}

#[test_log::test(tokio::test)]
async fn failed_publish_leaves_state_untouched() {
    let harness = Harness::start().await;
    harness.inject("stream/device/0777", r#"{"states":{"switch":"off"}}"#);
    harness.transport.set_fail_publish(true);

    let result = harness.coordinator.turn_on("0777", 0, None).await;

    assert!(matches!(result, Err(DeviceError::Transport(_))));
    let device = harness.coordinator.device("0777").await.unwrap().unwrap();
    assert!(!device.channel(0).unwrap().is_on);
}

#[test_log::test(tokio::test)]
async fn whole_object_answer_for_one_device() {
    let harness = Harness::start().await;
    harness.inject(
        "getAnswer/devices/0ABC",
        r#"{"device":{"friendlyId":"porch","eeps":[{"eep":"D2-01-00"}]}}"#,
    );

    assert_eq!(
        harness.coordinator.discovery_status("0ABC").await.unwrap(),
        DiscoveryStatus::Pending
    );
    harness.coordinator.stop().await;
    assert_eq!(harness.transport.active_subscriptions(), 0);
}

#[tokio::test(start_paused = true)]
async fn stop_cancels_query_in_flight() {
    let harness = Harness::start().await;
    harness.answer_devices(kitchen_dimmer()).await;
    let started = tokio::time::Instant::now();

    let (result, _) = tokio::join!(harness.coordinator.device_profile("kitchen"), async {
        sleep(Duration::from_millis(50)).await;
        harness.coordinator.stop().await;
    });

    assert!(matches!(result, Err(DeviceError::CoordinatorStopped)));
    assert!(started.elapsed() < Duration::from_millis(300));
    assert_eq!(harness.transport.active_subscriptions(), 0);
}

#[tokio::test(start_paused = true)]
async fn dropping_coordinator_releases_subscriptions() {
    let harness = Harness::start().await;
    let transport = harness.transport.clone();
    assert_eq!(transport.active_subscriptions(), 6);

    drop(harness);
    sleep(Duration::from_millis(10)).await;

    assert_eq!(transport.active_subscriptions(), 0);
    assert_eq!(transport.inject(format!("{}/stream/device/0A", ROOT), "{}".to_string()), 0);
}
