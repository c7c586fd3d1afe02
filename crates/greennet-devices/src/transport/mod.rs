/*!
 * Publish/subscribe transport seam.
 *
 * The adapter never owns a broker connection. It subscribes, publishes and
 * reacts to delivered messages through [`Transport`].
 */
use std::fmt::{self, Debug};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;

use crate::device::{DeviceError, Result};
use crate::topics;

pub mod memory;

pub use memory::MemoryTransport;

/// Delivery guarantee of a subscription or publish
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Qos {
    /// Fire and forget
    AtMostOnce,
    /// Acknowledged delivery
    #[default]
    AtLeastOnce,
    /// Assured single delivery
    ExactlyOnce,
}

impl Qos {
    /// Numeric level
    pub fn as_u8(&self) -> u8 {
        match self {
            Qos::AtMostOnce => 0,
            Qos::AtLeastOnce => 1,
            Qos::ExactlyOnce => 2,
        }
    }
}

impl TryFrom<u8> for Qos {
    type Error = DeviceError;

    fn try_from(level: u8) -> Result<Self> {
        match level {
            0 => Ok(Qos::AtMostOnce),
            1 => Ok(Qos::AtLeastOnce),
            2 => Ok(Qos::ExactlyOnce),
            other => Err(DeviceError::Other(format!("Invalid QoS level: {}", other))),
        }
    }
}

/// A delivered message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Topic the message was published on
    pub topic: String,
    /// Raw payload
    pub payload: Bytes,
}

impl Message {
    /// Create a message
    pub fn new<T: Into<String>, P: Into<Bytes>>(topic: T, payload: P) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
        }
    }

    /// Payload as text, replacing invalid UTF-8
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.payload).into_owned()
    }
}

/// Callback invoked for every message matching a subscription
pub type MessageHandler = Arc<dyn Fn(Message) + Send + Sync>;

/// Handle returned by [`Transport::subscribe`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(pub u64);

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

/// The narrow interface the adapter needs from a broker client
#[async_trait]
pub trait Transport: Send + Sync + Debug {
    /// Subscribe `handler` to every message matching `pattern`
    async fn subscribe(&self, pattern: &str, qos: Qos, handler: MessageHandler)
        -> Result<SubscriptionId>;

    /// Drop a subscription. Unknown ids are ignored.
    async fn unsubscribe(&self, id: SubscriptionId) -> Result<()>;

    /// Publish a payload
    async fn publish(&self, topic: &str, payload: Bytes, qos: Qos) -> Result<()>;
}

struct Entry {
    id: SubscriptionId,
    pattern: String,
    qos: Qos,
    handler: MessageHandler,
}

/// Subscription bookkeeping shared by the bundled transports
#[derive(Default)]
pub(crate) struct Subscriptions {
    next_id: u64,
    entries: Vec<Entry>,
}

impl Debug for Subscriptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscriptions")
            .field("patterns", &self.entries.iter().map(|e| &e.pattern).collect::<Vec<_>>())
            .finish()
    }
}

impl Subscriptions {
    pub(crate) fn insert(&mut self, pattern: &str, qos: Qos, handler: MessageHandler) -> SubscriptionId {
        self.next_id += 1;
        let id = SubscriptionId(self.next_id);
        self.entries.push(Entry {
            id,
            pattern: pattern.to_string(),
            qos,
            handler,
        });
        id
    }

    /// Remove a subscription and return its pattern
    pub(crate) fn remove(&mut self, id: SubscriptionId) -> Option<String> {
        let position = self.entries.iter().position(|e| e.id == id)?;
        Some(self.entries.remove(position).pattern)
    }

    /// Whether any subscription still uses `pattern`
    pub(crate) fn has_pattern(&self, pattern: &str) -> bool {
        self.entries.iter().any(|e| e.pattern == pattern)
    }

    /// Distinct patterns with the highest QoS requested for each
    pub(crate) fn patterns(&self) -> Vec<(String, Qos)> {
        let mut patterns: Vec<(String, Qos)> = Vec::new();
        for entry in &self.entries {
            match patterns.iter_mut().find(|(p, _)| *p == entry.pattern) {
                Some((_, qos)) if qos.as_u8() < entry.qos.as_u8() => *qos = entry.qos,
                Some(_) => {}
                None => patterns.push((entry.pattern.clone(), entry.qos)),
            }
        }
        patterns
    }

    /// Handlers whose pattern matches `topic`
    pub(crate) fn matching(&self, topic: &str) -> Vec<MessageHandler> {
        self.entries
            .iter()
            .filter(|e| topics::matches(&e.pattern, topic))
            .map(|e| e.handler.clone())
            .collect()
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }
}
