/*!
 * MQTT transport backed by rumqttc.
 *
 * One client per transport. The event loop runs on its own task and hands
 * every incoming publish to the handlers whose pattern matches. Broker
 * subscriptions are restored after each reconnect.
 */
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use rumqttc::{AsyncClient, ConnectionError, Event, EventLoop, MqttOptions, Packet, QoS};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use greennet_core::{config::MqttConfig, utils::spawn_and_log};

use crate::device::{DeviceError, Result};
use crate::transport::{Message, MessageHandler, Qos, SubscriptionId, Subscriptions, Transport};

const RECONNECT_DELAY: Duration = Duration::from_secs(1);

impl From<Qos> for QoS {
    fn from(qos: Qos) -> Self {
        match qos {
            Qos::AtMostOnce => QoS::AtMostOnce,
            Qos::AtLeastOnce => QoS::AtLeastOnce,
            Qos::ExactlyOnce => QoS::ExactlyOnce,
        }
    }
}

fn lock(subscriptions: &Mutex<Subscriptions>) -> MutexGuard<'_, Subscriptions> {
    subscriptions
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Transport over an MQTT broker connection
#[derive(Debug)]
pub struct MqttTransport {
    client: AsyncClient,
    client_id: String,
    subscriptions: Arc<Mutex<Subscriptions>>,
    event_loop: Mutex<Option<JoinHandle<()>>>,
}

impl MqttTransport {
    /// Create the client and start its event loop.
    ///
    /// The connection is established in the background; subscriptions and
    /// publishes made before it is up are queued by the client.
    pub fn connect(config: &MqttConfig) -> Result<Self> {
        if config.host.is_empty() {
            return Err(DeviceError::transport("MQTT host must not be empty"));
        }

        let client_id = format!("{}{}", config.client_id_prefix, Uuid::new_v4());
        let mut options = MqttOptions::new(&client_id, &config.host, config.port);
        options.set_keep_alive(Duration::from_secs(config.keep_alive_secs));
        if let Some(username) = &config.username {
            options.set_credentials(username, config.password.as_deref().unwrap_or_default());
        }

        let (client, event_loop) = AsyncClient::new(options, config.channel_capacity.max(1));
        let subscriptions = Arc::new(Mutex::new(Subscriptions::default()));

        let task = spawn_and_log(
            "mqtt-event-loop",
            run_event_loop(event_loop, client.clone(), subscriptions.clone()),
        );

        info!(
            "MQTT client {} connecting to {}:{}",
            client_id, config.host, config.port
        );
        Ok(Self {
            client,
            client_id,
            subscriptions,
            event_loop: Mutex::new(Some(task)),
        })
    }

    /// Generated client identifier
    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// Disconnect from the broker and stop the event loop
    pub async fn disconnect(&self) -> Result<()> {
        let result = self
            .client
            .disconnect()
            .await
            .map_err(DeviceError::transport);

        let task = self
            .event_loop
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(task) = task {
            task.abort();
        }

        info!("MQTT client {} disconnected", self.client_id);
        result
    }
}

impl Drop for MqttTransport {
    fn drop(&mut self) {
        if let Ok(mut task) = self.event_loop.lock() {
            if let Some(task) = task.take() {
                task.abort();
            }
        }
    }
}

async fn run_event_loop(
    mut event_loop: EventLoop,
    client: AsyncClient,
    subscriptions: Arc<Mutex<Subscriptions>>,
) -> Result<()> {
    loop {
        match event_loop.poll().await {
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                trace!("Received {} bytes on {}", publish.payload.len(), publish.topic);
                let message = Message::new(publish.topic.clone(), publish.payload.clone());
                let handlers = lock(&subscriptions).matching(&message.topic);
                for handler in handlers {
                    handler(message.clone());
                }
            }
            Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                info!("Connected to MQTT broker ({:?})", ack.code);
                let patterns = lock(&subscriptions).patterns();
                for (pattern, qos) in patterns {
                    // The poll loop must not await its own request channel
                    if let Err(e) = client.try_subscribe(pattern.as_str(), qos.into()) {
                        warn!("Failed to restore subscription {}: {}", pattern, e);
                    }
                }
            }
            Ok(_) => {}
            Err(ConnectionError::RequestsDone) => {
                debug!("MQTT client dropped, stopping event loop");
                return Ok(());
            }
            Err(e) => {
                warn!("MQTT connection error: {}", e);
                tokio::time::sleep(RECONNECT_DELAY).await;
            }
        }
    }
}

#[async_trait]
impl Transport for MqttTransport {
    async fn subscribe(
        &self,
        pattern: &str,
        qos: Qos,
        handler: MessageHandler,
    ) -> Result<SubscriptionId> {
        let id = lock(&self.subscriptions).insert(pattern, qos, handler);

        if let Err(e) = self.client.subscribe(pattern, qos.into()).await {
            lock(&self.subscriptions).remove(id);
            return Err(DeviceError::transport(e));
        }

        debug!("Subscribed to {} as {}", pattern, id);
        Ok(id)
    }

    async fn unsubscribe(&self, id: SubscriptionId) -> Result<()> {
        let released = {
            let mut subscriptions = lock(&self.subscriptions);
            subscriptions
                .remove(id)
                .filter(|pattern| !subscriptions.has_pattern(pattern))
        };

        if let Some(pattern) = released {
            self.client
                .unsubscribe(pattern.as_str())
                .await
                .map_err(DeviceError::transport)?;
            debug!("Unsubscribed from {}", pattern);
        }
        Ok(())
    }

    async fn publish(&self, topic: &str, payload: Bytes, qos: Qos) -> Result<()> {
        self.client
            .publish(topic, qos.into(), false, payload.to_vec())
            .await
            .map_err(DeviceError::transport)
    }
}
