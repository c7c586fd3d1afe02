/*!
 * Discovery coordinator for one gateway.
 *
 * All inbound messages and timer fires are handled by a single task that
 * owns the device registry and the pending assemblies. The public
 * [`Coordinator`] handle talks to that task over a channel, so device state
 * is never mutated concurrently.
 *
 * Lifecycle of a device id: unseen, then pending while fragments assemble,
 * then resolved once a snapshot with equipment profiles was finalized.
 * Telegrams and live deltas for an unknown id create a placeholder device
 * right away so an entity exists before the snapshot arrives.
 */
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::Serialize;
use tokio::sync::{broadcast, mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, trace, warn, Instrument};

use greennet_core::{config::Config, event::SharedEventBus, logging, utils::spawn_and_log};

use crate::assembler::{Assembler, StreamKey, TimerFired};
use crate::command::{Command, Intent};
use crate::correlator::Correlator;
use crate::device::{Device, DeviceError, HvacMode, Result};
use crate::path_tree::Node;
use crate::payload::{parse_json, CommandPayload, DeviceObject, DevicesPayload, Function};
use crate::profile::EntityCategory;
use crate::registry::DeviceRegistry;
use crate::topics::{Route, Topics};
use crate::transport::{Message, MessageHandler, Qos, SubscriptionId, Transport};

/// Runtime settings of a coordinator
#[derive(Debug, Clone, PartialEq)]
pub struct CoordinatorSettings {
    /// Topic root shared by all gateways
    pub base_topic: String,
    /// Gateway identifier
    pub gateway_id: String,
    /// QoS for subscriptions and publishes
    pub qos: Qos,
    /// Minimum wait before the first snapshot finalize
    pub initial_window: Duration,
    /// Snapshot quiet period
    pub quiet_period: Duration,
    /// Telegram quiet period
    pub telegram_quiet: Duration,
    /// Live delta quiet period
    pub delta_quiet: Duration,
    /// Correlated query timeout
    pub query_timeout: Duration,
}

impl CoordinatorSettings {
    /// Default settings for a gateway
    pub fn new<S: Into<String>>(gateway_id: S) -> Self {
        let defaults = Config::default();
        Self {
            base_topic: defaults.gateway.base_topic,
            gateway_id: gateway_id.into(),
            qos: Qos::AtLeastOnce,
            initial_window: defaults.discovery.initial_window(),
            quiet_period: defaults.discovery.quiet_period(),
            telegram_quiet: defaults.discovery.telegram_quiet(),
            delta_quiet: defaults.discovery.delta_quiet(),
            query_timeout: defaults.query.timeout(),
        }
    }

    /// Derive settings from a validated configuration
    pub fn from_config(config: &Config) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            base_topic: config.gateway.base_topic.clone(),
            gateway_id: config.gateway.gateway_id.clone(),
            qos: Qos::try_from(config.gateway.qos)?,
            initial_window: config.discovery.initial_window(),
            quiet_period: config.discovery.quiet_period(),
            telegram_quiet: config.discovery.telegram_quiet(),
            delta_quiet: config.discovery.delta_quiet(),
            query_timeout: config.query.timeout(),
        })
    }
}

/// Host-facing notification
#[derive(Debug, Clone)]
pub enum Notification {
    /// A device appeared, or a placeholder got its full profile
    DeviceDiscovered {
        /// Gateway the device belongs to
        gateway_id: String,
        /// The device
        device: Device,
    },
    /// A device's state or metadata changed
    DeviceStateUpdated {
        /// Gateway the device belongs to
        gateway_id: String,
        /// Key of the device
        device_key: String,
        /// The device after the change
        device: Device,
    },
}

impl Notification {
    /// The device carried by the notification
    pub fn device(&self) -> &Device {
        match self {
            Notification::DeviceDiscovered { device, .. } => device,
            Notification::DeviceStateUpdated { device, .. } => device,
        }
    }
}

/// Where a device id stands in discovery
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum DiscoveryStatus {
    /// Never referenced
    Unseen,
    /// Fragments are assembling, or only a placeholder exists
    Pending,
    /// Resolved from a snapshot with equipment profiles
    Resolved,
}

/// Latest gateway system answers
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GatewayStatus {
    /// Body of the last `systemInfo` answer
    pub system_info: Option<serde_json::Value>,
    /// Body of the last `uptime` answer
    pub uptime: Option<serde_json::Value>,
    /// When either was last received
    pub updated_at: Option<DateTime<Utc>>,
}

enum Request {
    Inbound(Message),
    Device {
        key_or_id: String,
        reply: oneshot::Sender<Option<Device>>,
    },
    Devices {
        category: Option<EntityCategory>,
        reply: oneshot::Sender<Vec<Device>>,
    },
    Status {
        device_id: String,
        reply: oneshot::Sender<DiscoveryStatus>,
    },
    Gateway {
        reply: oneshot::Sender<GatewayStatus>,
    },
    Encode {
        key_or_id: String,
        command: Command,
        reply: oneshot::Sender<Result<(String, Vec<Function>)>>,
    },
    ApplyOptimistic {
        device_id: String,
        command: Command,
    },
    CacheProfile {
        device_id: String,
        profile: serde_json::Value,
    },
    Shutdown,
}

/// Handle to the coordinator of one gateway
#[derive(Debug)]
pub struct Coordinator {
    settings: Arc<CoordinatorSettings>,
    topics: Topics,
    transport: Arc<dyn Transport>,
    correlator: Correlator,
    events: SharedEventBus,
    requests: mpsc::UnboundedSender<Request>,
    subscriptions: Mutex<Vec<SubscriptionId>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for Request {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Request::Inbound(_) => "Inbound",
            Request::Device { .. } => "Device",
            Request::Devices { .. } => "Devices",
            Request::Status { .. } => "Status",
            Request::Gateway { .. } => "Gateway",
            Request::Encode { .. } => "Encode",
            Request::ApplyOptimistic { .. } => "ApplyOptimistic",
            Request::CacheProfile { .. } => "CacheProfile",
            Request::Shutdown => "Shutdown",
        };
        f.write_str(name)
    }
}

impl Coordinator {
    /// Start the coordinator task, subscribe to the gateway's streams and
    /// ask for the device list
    pub async fn start(
        settings: CoordinatorSettings,
        transport: Arc<dyn Transport>,
        events: SharedEventBus,
    ) -> Result<Self> {
        let settings = Arc::new(settings);
        let topics = Topics::new(&settings.base_topic, &settings.gateway_id);
        let (requests, request_rx) = mpsc::unbounded_channel();
        let (fired_tx, fired_rx) = mpsc::unbounded_channel();

        let worker = Worker::new(settings.clone(), topics.clone(), events.clone(), fired_tx);
        let task = tokio::spawn(
            worker
                .run(request_rx, fired_rx)
                .instrument(logging::gateway_span(&settings.gateway_id)),
        );

        let coordinator = Self {
            correlator: Correlator::new(transport.clone(), settings.qos, settings.query_timeout),
            settings,
            topics,
            transport,
            events,
            requests,
            subscriptions: Mutex::new(Vec::new()),
            task: Mutex::new(Some(task)),
        };

        if let Err(e) = coordinator.subscribe_streams().await {
            error!("Failed to subscribe to gateway streams: {}", e);
            coordinator.stop().await;
            return Err(e);
        }

        if let Err(e) = coordinator.request_devices().await {
            warn!("Initial device request failed: {}", e);
        }

        info!(
            "Coordinator for {} started on {}",
            coordinator.settings.gateway_id,
            coordinator.topics.root()
        );
        Ok(coordinator)
    }

    async fn subscribe_streams(&self) -> Result<()> {
        for pattern in self.topics.inbound_patterns() {
            let requests = self.requests.clone();
            let handler: MessageHandler = Arc::new(move |message: Message| {
                // Fails only after shutdown, when the message is moot
                let _ = requests.send(Request::Inbound(message));
            });

            let id = self
                .transport
                .subscribe(&pattern, self.settings.qos, handler)
                .await?;
            debug!("Subscribed to {}", pattern);
            self.subscriptions.lock().await.push(id);
        }
        Ok(())
    }

    /// Release every subscription and stop the coordinator task.
    ///
    /// Queries in flight are cancelled and pending assemblies are dropped
    /// with their timers. Calling this more than once is harmless. Dropping
    /// the coordinator without calling it releases the subscriptions from a
    /// background task.
    pub async fn stop(&self) {
        self.correlator.close();
        let subscriptions = std::mem::take(&mut *self.subscriptions.lock().await);
        let released = join_all(
            subscriptions
                .into_iter()
                .map(|id| async move { (id, self.transport.unsubscribe(id).await) }),
        )
        .await;
        for (id, result) in released {
            if let Err(e) = result {
                warn!("Failed to unsubscribe {}: {}", id, e);
            }
        }

        let _ = self.requests.send(Request::Shutdown);
        if let Some(task) = self.task.lock().await.take() {
            if let Err(e) = task.await {
                error!("Coordinator task ended abnormally: {}", e);
            }
        }
    }

    /// Settings in use
    pub fn settings(&self) -> &CoordinatorSettings {
        &self.settings
    }

    /// Gateway identifier
    pub fn gateway_id(&self) -> &str {
        &self.settings.gateway_id
    }

    /// Topic set of the gateway
    pub fn topics(&self) -> &Topics {
        &self.topics
    }

    /// Receive every notification published on the event bus
    pub fn subscribe(&self) -> Result<broadcast::Receiver<Notification>> {
        Ok(self.events.subscribe::<Notification>()?)
    }

    /// Receive state updates of one device
    pub fn subscribe_device(&self, device_key: &str) -> Result<broadcast::Receiver<Notification>> {
        let scope = format!("{}/{}", self.settings.gateway_id, device_key);
        Ok(self.events.subscribe_scoped::<Notification>(&scope)?)
    }

    async fn call<T>(&self, request: impl FnOnce(oneshot::Sender<T>) -> Request) -> Result<T> {
        let (reply, rx) = oneshot::channel();
        self.requests
            .send(request(reply))
            .map_err(|_| DeviceError::CoordinatorStopped)?;
        rx.await.map_err(|_| DeviceError::CoordinatorStopped)
    }

    /// Get a device by key or device id
    pub async fn device(&self, key_or_id: &str) -> Result<Option<Device>> {
        let key_or_id = key_or_id.to_string();
        self.call(|reply| Request::Device { key_or_id, reply }).await
    }

    /// All known devices, placeholders included
    pub async fn devices(&self) -> Result<Vec<Device>> {
        self.call(|reply| Request::Devices {
            category: None,
            reply,
        })
        .await
    }

    /// Devices of one entity category
    pub async fn devices_by_category(&self, category: EntityCategory) -> Result<Vec<Device>> {
        self.call(|reply| Request::Devices {
            category: Some(category),
            reply,
        })
        .await
    }

    /// Discovery state of a device id
    pub async fn discovery_status(&self, device_id: &str) -> Result<DiscoveryStatus> {
        let device_id = device_id.to_string();
        self.call(|reply| Request::Status { device_id, reply }).await
    }

    /// Latest gateway system answers
    pub async fn gateway_status(&self) -> Result<GatewayStatus> {
        self.call(|reply| Request::Gateway { reply }).await
    }

    /// Ask the gateway for its device list
    pub async fn request_devices(&self) -> Result<()> {
        self.correlator.fire(&self.topics.get_devices()).await
    }

    /// Ask the gateway for system information and uptime. The answers are
    /// stored and returned by [`Coordinator::gateway_status`].
    pub async fn refresh_gateway_info(&self) -> Result<()> {
        self.correlator.fire(&self.topics.get_system_info()).await?;
        self.correlator.fire(&self.topics.get_uptime()).await
    }

    /// Encode and publish a command, then apply its expected state
    pub async fn send_command(&self, key_or_id: &str, command: Command) -> Result<()> {
        let span = logging::operation_span("command", key_or_id);
        async {
            let target = key_or_id.to_string();
            let encode = command.clone();
            let (device_id, functions) = self
                .call(|reply| Request::Encode {
                    key_or_id: target,
                    command: encode,
                    reply,
                })
                .await??;

            let topic = self.topics.put_state(&device_id);
            let payload = CommandPayload::new(functions).to_bytes()?;
            debug!("Publishing {} to {}", String::from_utf8_lossy(&payload), topic);

            if let Err(e) = self.transport.publish(&topic, payload, self.settings.qos).await {
                error!("Command for {} not sent: {}", device_id, e);
                return Err(e);
            }

            self.requests
                .send(Request::ApplyOptimistic { device_id, command })
                .map_err(|_| DeviceError::CoordinatorStopped)
        }
        .instrument(span)
        .await
    }

    /// Switch a channel on, optionally at a brightness
    pub async fn turn_on(&self, key_or_id: &str, channel: u8, brightness: Option<u8>) -> Result<()> {
        self.send_command(key_or_id, Command::new(Intent::TurnOn { brightness }).on_channel(channel))
            .await
    }

    /// Switch a channel off
    pub async fn turn_off(&self, key_or_id: &str, channel: u8) -> Result<()> {
        self.send_command(key_or_id, Command::new(Intent::TurnOff).on_channel(channel))
            .await
    }

    /// Set a brightness
    pub async fn set_brightness(&self, key_or_id: &str, channel: u8, brightness: u8) -> Result<()> {
        self.send_command(
            key_or_id,
            Command::new(Intent::SetBrightness { brightness }).on_channel(channel),
        )
        .await
    }

    /// Move a cover to a position
    pub async fn set_cover_position(&self, key_or_id: &str, channel: u8, position: u8) -> Result<()> {
        self.send_command(
            key_or_id,
            Command::new(Intent::SetPosition { position }).on_channel(channel),
        )
        .await
    }

    /// Fully open a cover
    pub async fn open_cover(&self, key_or_id: &str, channel: u8) -> Result<()> {
        self.send_command(key_or_id, Command::new(Intent::Open).on_channel(channel))
            .await
    }

    /// Fully close a cover
    pub async fn close_cover(&self, key_or_id: &str, channel: u8) -> Result<()> {
        self.send_command(key_or_id, Command::new(Intent::Close).on_channel(channel))
            .await
    }

    /// Stop a moving cover
    pub async fn stop_cover(&self, key_or_id: &str, channel: u8) -> Result<()> {
        self.send_command(key_or_id, Command::new(Intent::Stop).on_channel(channel))
            .await
    }

    /// Set a cover's slat angle
    pub async fn set_cover_tilt(&self, key_or_id: &str, channel: u8, tilt: u8) -> Result<()> {
        self.send_command(key_or_id, Command::new(Intent::SetTilt { tilt }).on_channel(channel))
            .await
    }

    /// Set a temperature setpoint
    pub async fn set_setpoint(&self, key_or_id: &str, channel: u8, temperature: f64) -> Result<()> {
        self.send_command(
            key_or_id,
            Command::new(Intent::SetSetpoint { temperature }).on_channel(channel),
        )
        .await
    }

    /// Change the HVAC mode
    pub async fn set_hvac_mode(&self, key_or_id: &str, channel: u8, mode: HvacMode) -> Result<()> {
        self.send_command(key_or_id, Command::new(Intent::SetHvacMode { mode }).on_channel(channel))
            .await
    }

    async fn require(&self, key_or_id: &str) -> Result<Device> {
        self.device(key_or_id)
            .await?
            .ok_or_else(|| DeviceError::UnknownDevice(key_or_id.to_string()))
    }

    async fn query_resource(&self, device_id: &str, resource: &str) -> Result<serde_json::Value> {
        let answer_topic = self.topics.answer_device_resource(device_id, resource);
        let answer = self
            .correlator
            .query(&self.topics.get_device_resource(device_id, resource), &answer_topic)
            .await?;
        parse_json(&answer.topic, &answer.payload)
    }

    /// The device's profile, fetched once and then served from cache
    pub async fn device_profile(&self, key_or_id: &str) -> Result<serde_json::Value> {
        let device = self.require(key_or_id).await?;
        if let Some(profile) = device.profile {
            return Ok(profile);
        }

        let profile = self.query_resource(&device.device_id, "profile").await?;
        self.requests
            .send(Request::CacheProfile {
                device_id: device.device_id,
                profile: profile.clone(),
            })
            .map_err(|_| DeviceError::CoordinatorStopped)?;
        Ok(profile)
    }

    /// The device's configuration
    pub async fn device_configuration(&self, key_or_id: &str) -> Result<serde_json::Value> {
        let device = self.require(key_or_id).await?;
        self.query_resource(&device.device_id, "configuration").await
    }

    /// The device's parameters
    pub async fn device_parameters(&self, key_or_id: &str) -> Result<serde_json::Value> {
        let device = self.require(key_or_id).await?;
        self.query_resource(&device.device_id, "parameters").await
    }

    async fn put_resource(&self, key_or_id: &str, resource: &str, body: &serde_json::Value) -> Result<()> {
        let device = self.require(key_or_id).await?;
        let topic = self.topics.put_device_resource(&device.device_id, resource);
        let payload = Bytes::from(serde_json::to_vec(body)?);
        self.transport.publish(&topic, payload, self.settings.qos).await
    }

    /// Write the device's configuration
    pub async fn put_configuration(&self, key_or_id: &str, configuration: &serde_json::Value) -> Result<()> {
        self.put_resource(key_or_id, "configuration", configuration).await
    }

    /// Write the device's parameters
    pub async fn put_parameters(&self, key_or_id: &str, parameters: &serde_json::Value) -> Result<()> {
        self.put_resource(key_or_id, "parameters", parameters).await
    }
}

impl Drop for Coordinator {
    fn drop(&mut self) {
        self.correlator.close();
        let _ = self.requests.send(Request::Shutdown);

        let subscriptions = std::mem::take(self.subscriptions.get_mut());
        if subscriptions.is_empty() {
            return;
        }
        if tokio::runtime::Handle::try_current().is_err() {
            warn!(
                "Coordinator dropped outside a runtime, {} subscriptions left on the transport",
                subscriptions.len()
            );
            return;
        }

        let transport = self.transport.clone();
        spawn_and_log("release-subscriptions", async move {
            join_all(subscriptions.into_iter().map(|id| transport.unsubscribe(id)))
                .await
                .into_iter()
                .collect::<Result<Vec<()>>>()
        });
    }
}

/// State owned by the coordinator task
struct Worker {
    settings: Arc<CoordinatorSettings>,
    topics: Topics,
    events: SharedEventBus,
    registry: DeviceRegistry,
    assembler: Assembler,
    live_delta: HashSet<String>,
    gateway: GatewayStatus,
    initial_deadline: Option<Instant>,
}

impl Worker {
    fn new(
        settings: Arc<CoordinatorSettings>,
        topics: Topics,
        events: SharedEventBus,
        fired: mpsc::UnboundedSender<TimerFired>,
    ) -> Self {
        let initial_deadline = Some(Instant::now() + settings.initial_window);
        Self {
            settings,
            topics,
            events,
            registry: DeviceRegistry::new(),
            assembler: Assembler::new(fired),
            live_delta: HashSet::new(),
            gateway: GatewayStatus::default(),
            initial_deadline,
        }
    }

    async fn run(
        mut self,
        mut requests: mpsc::UnboundedReceiver<Request>,
        mut fired: mpsc::UnboundedReceiver<TimerFired>,
    ) {
        debug!("Coordinator task running");
        loop {
            tokio::select! {
                biased;
                request = requests.recv() => match request {
                    Some(Request::Shutdown) | None => break,
                    Some(request) => self.handle_request(request),
                },
                Some(timer) = fired.recv() => self.on_timer(timer),
            }
        }

        self.assembler.cancel_all();
        info!("Coordinator for {} stopped", self.settings.gateway_id);
    }

    fn handle_request(&mut self, request: Request) {
        match request {
            Request::Inbound(message) => {
                if let Err(e) = self.handle_message(&message) {
                    log_failure(&message.topic, &e);
                }
            }
            Request::Device { key_or_id, reply } => {
                let _ = reply.send(self.registry.resolve(&key_or_id).cloned());
            }
            Request::Devices { category, reply } => {
                let devices = match category {
                    Some(category) => self
                        .registry
                        .get_devices_by_category(category)
                        .into_iter()
                        .cloned()
                        .collect(),
                    None => self.registry.get_devices().cloned().collect(),
                };
                let _ = reply.send(devices);
            }
            Request::Status { device_id, reply } => {
                let _ = reply.send(self.status(&device_id));
            }
            Request::Gateway { reply } => {
                let _ = reply.send(self.gateway.clone());
            }
            Request::Encode {
                key_or_id,
                command,
                reply,
            } => {
                let encoded = self
                    .registry
                    .resolve(&key_or_id)
                    .map(|device| (device.device_id.clone(), command.encode(device)))
                    .ok_or(DeviceError::UnknownDevice(key_or_id));
                let _ = reply.send(encoded);
            }
            Request::ApplyOptimistic { device_id, command } => {
                if let Some(key) = self.registry.key_for(&device_id).map(str::to_string) {
                    if let Some(device) = self.registry.get_device_mut(&key) {
                        command.apply_optimistic(device);
                    }
                    self.notify_updated(&key);
                }
            }
            Request::CacheProfile { device_id, profile } => {
                if let Some(key) = self.registry.key_for(&device_id).map(str::to_string) {
                    if let Some(device) = self.registry.get_device_mut(&key) {
                        device.profile = Some(profile);
                    }
                }
            }
            Request::Shutdown => {}
        }
    }

    fn handle_message(&mut self, message: &Message) -> Result<()> {
        let route = match self.topics.route(&message.topic) {
            Some(route) => route,
            None => {
                debug!("Ignoring message on {}", message.topic);
                return Ok(());
            }
        };

        match route {
            Route::Snapshot { device_id, path } if path.is_empty() => {
                let json = parse_json(&message.topic, &message.payload)?;
                self.merge_snapshot(&message.topic, json, Some(&device_id))
            }
            Route::Snapshot { device_id, path } => {
                let delay = self.discovery_delay();
                self.assembler.on_fragment(
                    StreamKey::Discovery,
                    &format!("{}/{}", device_id, path),
                    &message.text(),
                    delay,
                )
            }
            Route::Delta { device_id, path } if path.is_empty() => {
                let json = parse_json(&message.topic, &message.payload)?;
                self.finalize_delta(&device_id, json)
            }
            Route::Delta { device_id, path } => self.assembler.on_fragment(
                StreamKey::Delta(device_id),
                &path,
                &message.text(),
                self.settings.delta_quiet,
            ),
            Route::Telegram { device_id, path } if path.is_empty() => {
                let json = parse_json(&message.topic, &message.payload)?;
                self.finalize_telegram(&device_id, json)
            }
            Route::Telegram { device_id, path } => self.assembler.on_fragment(
                StreamKey::Telegram(device_id),
                &path,
                &message.text(),
                self.settings.telegram_quiet,
            ),
            Route::DevicesAnswer { device_id } => {
                let json = parse_json(&message.topic, &message.payload)?;
                self.merge_snapshot(&message.topic, json, device_id.as_deref())
            }
            Route::SystemInfo => {
                self.gateway.system_info = Some(json_or_text(message));
                self.gateway.updated_at = Some(Utc::now());
                debug!("Gateway system info updated");
                Ok(())
            }
            Route::Uptime => {
                self.gateway.uptime = Some(json_or_text(message));
                self.gateway.updated_at = Some(Utc::now());
                Ok(())
            }
        }
    }

    /// Wait before a snapshot finalize. Until the first finalize the
    /// initial window is honoured as well.
    fn discovery_delay(&self) -> Duration {
        let quiet = self.settings.quiet_period;
        match self.initial_deadline {
            Some(deadline) => deadline.saturating_duration_since(Instant::now()).max(quiet),
            None => quiet,
        }
    }

    fn merge_snapshot(&mut self, topic: &str, json: serde_json::Value, topic_id: Option<&str>) -> Result<()> {
        let objects = DevicesPayload::from_json(topic, json)?.into_objects();
        let single = objects.len() == 1;

        let mut entries = BTreeMap::new();
        for object in objects {
            let id = match (object.get("deviceId"), topic_id) {
                (Some(serde_json::Value::String(id)), _) if !id.is_empty() => id.clone(),
                (_, Some(id)) if single => id.to_string(),
                (Some(serde_json::Value::Number(n)), _) => n.to_string(),
                _ => {
                    log_failure(topic, &DeviceError::MissingIdentifier(topic.to_string()));
                    continue;
                }
            };
            entries.insert(id, Node::from_json(&object));
        }

        if !entries.is_empty() {
            trace!("Merging {} device objects from {}", entries.len(), topic);
            let delay = self.discovery_delay();
            self.assembler
                .merge_tree(StreamKey::Discovery, Node::Object(entries), delay);
        }
        Ok(())
    }

    fn on_timer(&mut self, fired: TimerFired) {
        let (key, tree) = match self.assembler.on_quiet_period_elapsed(fired) {
            Some(finished) => finished,
            None => return,
        };

        let result = match key {
            StreamKey::Discovery => {
                self.finalize_discovery(tree);
                Ok(())
            }
            StreamKey::Telegram(device_id) => self.finalize_telegram(&device_id, tree.to_json()),
            StreamKey::Delta(device_id) => self.finalize_delta(&device_id, tree.to_json()),
        };

        if let Err(e) = result {
            log_failure("finalize", &e);
        }
    }

    fn finalize_discovery(&mut self, tree: Node) {
        self.initial_deadline = None;
        let entries = tree.into_object().unwrap_or_default();
        info!("Resolving {} devices", entries.len());

        for (topic_id, node) in entries {
            match DeviceObject::from_json(node.to_json(), Some(&topic_id)) {
                Ok(object) => self.resolve(object),
                Err(e) => log_failure(&topic_id, &e),
            }
        }
    }

    /// Turn a finalized snapshot object into a resolved device.
    ///
    /// An existing device keeps its channels and cached profile; only
    /// identity and capability fields are refreshed. Snapshot state seeds
    /// the channels of a device seen for the first time and is ignored
    /// afterwards.
    fn resolve(&mut self, object: DeviceObject) {
        let snapshot = object.to_device();
        let device_id = snapshot.device_id.clone();

        let existing = self
            .registry
            .key_for(&device_id)
            .map(str::to_string)
            .and_then(|key| self.registry.unregister_device(&key));

        let (device, discovered) = match existing {
            Some(mut device) => {
                let was_placeholder = !device.is_resolved();
                device.refresh_identity(snapshot);
                (device, was_placeholder)
            }
            None => {
                let mut device = snapshot;
                device.apply_functions(&object.all_functions());
                (device, true)
            }
        };

        let key = device.key().to_string();
        self.registry.register_device(device);

        if discovered {
            info!("Discovered device {} ({})", key, device_id);
            self.notify_discovered(&key);
        } else {
            debug!("Re-resolved device {} ({})", key, device_id);
            self.notify_updated(&key);
        }
    }

    /// Key of the device for a stream object, creating a placeholder for
    /// an unknown id. The flag tells whether one was created.
    fn ensure_device(&mut self, object: &DeviceObject) -> (String, bool) {
        if let Some(key) = self.registry.key_for(object.id()) {
            return (key.to_string(), false);
        }

        let mut placeholder = Device::new(object.id(), object.friendly_id.clone());
        placeholder.physical_device = object.physical_device.clone();
        let key = placeholder.key().to_string();
        info!("Created placeholder for {} from live traffic", object.id());
        self.registry.register_device(placeholder);
        (key, true)
    }

    fn finalize_telegram(&mut self, topic_id: &str, json: serde_json::Value) -> Result<()> {
        let object = DeviceObject::from_json(json, Some(topic_id))?;
        let (key, created) = self.ensure_device(&object);
        let delta_active = self.live_delta.contains(object.id());

        let device = self
            .registry
            .get_device_mut(&key)
            .ok_or_else(|| DeviceError::UnknownDevice(key.clone()))?;
        device.note_seen(object.seen_at(), object.signal());

        if delta_active && device.is_resolved() {
            trace!("Telegram state for {} ignored, live delta is authoritative", key);
        } else {
            device.apply_functions(&object.all_functions());
        }

        if created {
            self.notify_discovered(&key);
        } else {
            self.notify_updated(&key);
        }
        Ok(())
    }

    fn finalize_delta(&mut self, topic_id: &str, json: serde_json::Value) -> Result<()> {
        let object = DeviceObject::from_json(json, Some(topic_id))?;
        self.live_delta.insert(object.id().to_string());
        let (key, created) = self.ensure_device(&object);

        let device = self
            .registry
            .get_device_mut(&key)
            .ok_or_else(|| DeviceError::UnknownDevice(key.clone()))?;
        device.note_seen(object.seen_at(), object.signal());
        device.apply_functions(&object.all_functions());

        if created {
            self.notify_discovered(&key);
        } else {
            self.notify_updated(&key);
        }
        Ok(())
    }

    fn status(&self, key_or_id: &str) -> DiscoveryStatus {
        let known = self.registry.resolve(key_or_id);
        if known.map_or(false, Device::is_resolved) {
            return DiscoveryStatus::Resolved;
        }

        let assembling = self
            .assembler
            .peek(&StreamKey::Discovery)
            .and_then(|tree| tree.get(key_or_id))
            .is_some()
            || self
                .assembler
                .is_pending(&StreamKey::Telegram(key_or_id.to_string()))
            || self
                .assembler
                .is_pending(&StreamKey::Delta(key_or_id.to_string()));

        if assembling || known.is_some() {
            DiscoveryStatus::Pending
        } else {
            DiscoveryStatus::Unseen
        }
    }

    fn notify_discovered(&self, key: &str) {
        let device = match self.registry.get_device(key) {
            Some(device) => device.clone(),
            None => return,
        };
        let notification = Notification::DeviceDiscovered {
            gateway_id: self.settings.gateway_id.clone(),
            device,
        };
        if let Err(e) = self
            .events
            .publish_scoped(&self.settings.gateway_id, notification)
        {
            warn!("Failed to publish discovery of {}: {}", key, e);
        }
    }

    fn notify_updated(&self, key: &str) {
        let device = match self.registry.get_device(key) {
            Some(device) => device.clone(),
            None => return,
        };
        let notification = Notification::DeviceStateUpdated {
            gateway_id: self.settings.gateway_id.clone(),
            device_key: key.to_string(),
            device,
        };
        let scope = format!("{}/{}", self.settings.gateway_id, key);
        if let Err(e) = self.events.publish_scoped(&scope, notification) {
            warn!("Failed to publish update of {}: {}", key, e);
        }
    }
}

fn json_or_text(message: &Message) -> serde_json::Value {
    serde_json::from_slice(&message.payload)
        .unwrap_or_else(|_| serde_json::Value::String(message.text()))
}

fn log_failure(topic: &str, err: &DeviceError) {
    match err {
        DeviceError::MalformedPayload { .. } | DeviceError::Serialization(_) => {
            error!("Dropped message on {}: {}", topic, err)
        }
        DeviceError::MissingIdentifier(_) | DeviceError::InvalidPath { .. } => {
            warn!("Dropped message on {}: {}", topic, err)
        }
        other => warn!("Failed to handle message on {}: {}", topic, other),
    }
}
