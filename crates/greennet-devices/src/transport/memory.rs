/*!
 * In-process loopback transport.
 *
 * Published messages are recorded and delivered to local subscribers.
 * Canned answers can be registered for request topics, which is enough to
 * drive the coordinator and the correlator without a broker.
 */
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use bytes::Bytes;
use tracing::trace;

use crate::device::{DeviceError, Result};

use super::{Message, MessageHandler, Qos, SubscriptionId, Subscriptions, Transport};

/// Loopback transport
#[derive(Debug, Default)]
pub struct MemoryTransport {
    subscriptions: Mutex<Subscriptions>,
    published: Mutex<Vec<Message>>,
    responders: Mutex<HashMap<String, Message>>,
    subscribe_calls: AtomicUsize,
    unsubscribe_calls: AtomicUsize,
    fail_publish: AtomicBool,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    // A panicking handler must not wedge the transport
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl MemoryTransport {
    /// Create an empty transport
    pub fn new() -> Self {
        Self::default()
    }

    /// Deliver a message to matching subscribers as if a broker sent it.
    /// Returns the number of handlers invoked.
    pub fn inject<T: Into<String>, P: Into<Bytes>>(&self, topic: T, payload: P) -> usize {
        self.deliver(Message::new(topic, payload))
    }

    fn deliver(&self, message: Message) -> usize {
        let handlers = lock(&self.subscriptions).matching(&message.topic);
        trace!("Delivering {} to {} handlers", message.topic, handlers.len());
        for handler in &handlers {
            handler(message.clone());
        }
        handlers.len()
    }

    /// Answer every publish on `request_topic` with `payload` on
    /// `answer_topic`
    pub fn respond_to<P: Into<Bytes>>(&self, request_topic: &str, answer_topic: &str, payload: P) {
        lock(&self.responders).insert(
            request_topic.to_string(),
            Message::new(answer_topic, payload),
        );
    }

    /// Make every following publish fail, or succeed again
    pub fn set_fail_publish(&self, fail: bool) {
        self.fail_publish.store(fail, Ordering::SeqCst);
    }

    /// Everything published so far
    pub fn published(&self) -> Vec<Message> {
        lock(&self.published).clone()
    }

    /// Messages published on one topic
    pub fn published_to(&self, topic: &str) -> Vec<Message> {
        lock(&self.published)
            .iter()
            .filter(|m| m.topic == topic)
            .cloned()
            .collect()
    }

    /// Forget recorded publishes
    pub fn clear_published(&self) {
        lock(&self.published).clear();
    }

    /// Number of subscribe calls
    pub fn subscribe_count(&self) -> usize {
        self.subscribe_calls.load(Ordering::SeqCst)
    }

    /// Number of unsubscribe calls
    pub fn unsubscribe_count(&self) -> usize {
        self.unsubscribe_calls.load(Ordering::SeqCst)
    }

    /// Number of live subscriptions
    pub fn active_subscriptions(&self) -> usize {
        lock(&self.subscriptions).len()
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn subscribe(
        &self,
        pattern: &str,
        qos: Qos,
        handler: MessageHandler,
    ) -> Result<SubscriptionId> {
        self.subscribe_calls.fetch_add(1, Ordering::SeqCst);
        Ok(lock(&self.subscriptions).insert(pattern, qos, handler))
    }

    async fn unsubscribe(&self, id: SubscriptionId) -> Result<()> {
        self.unsubscribe_calls.fetch_add(1, Ordering::SeqCst);
        lock(&self.subscriptions).remove(id);
        Ok(())
    }

    async fn publish(&self, topic: &str, payload: Bytes, _qos: Qos) -> Result<()> {
        if self.fail_publish.load(Ordering::SeqCst) {
            return Err(DeviceError::transport(format!("publish to {} rejected", topic)));
        }

        let message = Message::new(topic, payload);
        lock(&self.published).push(message.clone());
        self.deliver(message);

        let answer = lock(&self.responders).get(topic).cloned();
        if let Some(answer) = answer {
            self.deliver(answer);
        }
        Ok(())
    }
}
