/*!
 * Request/response correlation over publish/subscribe.
 *
 * A query subscribes to the answer topic, publishes the request and waits
 * for the first answer. The subscription is released whether an answer
 * arrived, the publish failed, the wait timed out or the correlator was
 * closed while waiting.
 */
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::{oneshot, watch};
use tracing::{debug, warn, Instrument};

use greennet_core::{error::Error as CoreError, logging, utils::with_timeout};

use crate::device::{DeviceError, Result};
use crate::transport::{Message, MessageHandler, Qos, Transport};

/// Issues correlated queries over a transport
#[derive(Debug, Clone)]
pub struct Correlator {
    transport: Arc<dyn Transport>,
    qos: Qos,
    timeout: Duration,
    closed: Arc<watch::Sender<bool>>,
}

impl Correlator {
    /// Create a correlator with a default timeout
    pub fn new(transport: Arc<dyn Transport>, qos: Qos, timeout: Duration) -> Self {
        let (closed, _) = watch::channel(false);
        Self {
            transport,
            qos,
            timeout,
            closed: Arc::new(closed),
        }
    }

    /// Cancel queries in flight and refuse new ones. Shared by every clone.
    pub fn close(&self) {
        self.closed.send_replace(true);
    }

    /// Whether [`Correlator::close`] was called
    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    /// Default timeout
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Query with an empty request payload and the default timeout
    pub async fn query(&self, request_topic: &str, answer_pattern: &str) -> Result<Message> {
        self.query_with(request_topic, Bytes::new(), answer_pattern, self.timeout)
            .await
    }

    /// Query with an explicit payload and timeout
    pub async fn query_with(
        &self,
        request_topic: &str,
        payload: Bytes,
        answer_pattern: &str,
        timeout: Duration,
    ) -> Result<Message> {
        let span = logging::operation_span("query", request_topic);
        async move {
            if self.is_closed() {
                return Err(DeviceError::CoordinatorStopped);
            }

            let (tx, rx) = oneshot::channel();
            let slot = Arc::new(Mutex::new(Some(tx)));
            let handler: MessageHandler = Arc::new(move |message: Message| {
                let sender = slot.lock().ok().and_then(|mut s| s.take());
                if let Some(sender) = sender {
                    let _ = sender.send(message);
                }
            });

            let id = self
                .transport
                .subscribe(answer_pattern, self.qos, handler)
                .await?;

            let outcome = self
                .exchange(request_topic, payload, answer_pattern, timeout, rx)
                .await;

            if let Err(e) = self.transport.unsubscribe(id).await {
                warn!("Failed to unsubscribe from {}: {}", answer_pattern, e);
            }

            if outcome.is_ok() {
                debug!("Got answer on {}", answer_pattern);
            }
            outcome
        }
        .instrument(span)
        .await
    }

    async fn exchange(
        &self,
        request_topic: &str,
        payload: Bytes,
        answer_pattern: &str,
        timeout: Duration,
        rx: oneshot::Receiver<Message>,
    ) -> Result<Message> {
        self.transport
            .publish(request_topic, payload, self.qos)
            .await?;

        let answer = async {
            rx.await
                .map_err(|_| CoreError::other("answer subscription dropped"))
        };

        tokio::select! {
            outcome = with_timeout(timeout, answer) => outcome.map_err(|e| match e {
                CoreError::Timeout(_) => DeviceError::Timeout(answer_pattern.to_string()),
                other => DeviceError::Core(other),
            }),
            _ = closed(self.closed.subscribe()) => {
                debug!("Query for {} cancelled", answer_pattern);
                Err(DeviceError::CoordinatorStopped)
            }
        }
    }

    /// Publish a request whose answer is consumed by a standing
    /// subscription
    pub async fn fire(&self, request_topic: &str) -> Result<()> {
        self.transport
            .publish(request_topic, Bytes::new(), self.qos)
            .await
    }
}

/// Resolves once the flag is raised
async fn closed(mut flag: watch::Receiver<bool>) {
    while !*flag.borrow_and_update() {
        if flag.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MemoryTransport;

    fn correlator(transport: &Arc<MemoryTransport>) -> Correlator {
        Correlator::new(transport.clone(), Qos::AtLeastOnce, Duration::from_millis(200))
    }

    #[tokio::test(start_paused = true)]
    async fn test_query_answer() {
        let transport = Arc::new(MemoryTransport::new());
        transport.respond_to(
            "EnOcean/EAG-1/get/devices/0555/profile",
            "EnOcean/EAG-1/getAnswer/devices/0555/profile",
            r#"{"profile":{"eep":"D2-01-12"}}"#,
        );

        let answer = correlator(&transport)
            .query(
                "EnOcean/EAG-1/get/devices/0555/profile",
                "EnOcean/EAG-1/getAnswer/devices/0555/profile",
            )
            .await
            .unwrap();

        assert!(answer.text().contains("D2-01-12"));
        assert_eq!(transport.subscribe_count(), 1);
        assert_eq!(transport.unsubscribe_count(), 1);
        assert_eq!(transport.active_subscriptions(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_query_timeout_unsubscribes_once() {
        let transport = Arc::new(MemoryTransport::new());

        let result = correlator(&transport)
            .query("EnOcean/EAG-1/get/uptime", "EnOcean/EAG-1/getAnswer/uptime")
            .await;

        assert!(matches!(result, Err(DeviceError::Timeout(_))));
        assert_eq!(transport.unsubscribe_count(), 1);
        assert_eq!(transport.active_subscriptions(), 0);
        assert_eq!(transport.published_to("EnOcean/EAG-1/get/uptime").len(), 1);
    }

    #[tokio::test]
    async fn test_publish_failure_unsubscribes() {
        let transport = Arc::new(MemoryTransport::new());
        transport.set_fail_publish(true);

        let result = correlator(&transport).query("gw/get/x", "gw/getAnswer/x").await;

        assert!(matches!(result, Err(DeviceError::Transport(_))));
        assert_eq!(transport.unsubscribe_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_late_answer_is_not_observed() {
        let transport = Arc::new(MemoryTransport::new());
        let result = correlator(&transport).query("gw/get/x", "gw/getAnswer/x").await;
        assert!(result.is_err());

        assert_eq!(transport.inject("gw/getAnswer/x", "late"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_cancels_waiting_query() {
        let transport = Arc::new(MemoryTransport::new());
        let correlator = correlator(&transport);
        let started = tokio::time::Instant::now();

        let (result, _) = tokio::join!(
            correlator.query("gw/get/x", "gw/getAnswer/x"),
            async {
                tokio::time::sleep(Duration::from_millis(20)).await;
                correlator.close();
            }
        );

        assert!(matches!(result, Err(DeviceError::CoordinatorStopped)));
        assert!(started.elapsed() < correlator.timeout());
        assert_eq!(transport.unsubscribe_count(), 1);
        assert_eq!(transport.active_subscriptions(), 0);

        let refused = correlator.query("gw/get/x", "gw/getAnswer/x").await;
        assert!(matches!(refused, Err(DeviceError::CoordinatorStopped)));
        assert_eq!(transport.subscribe_count(), 1);
    }
}
