/*!
 * Event fan-out for GreenNet.
 *
 * Events are routed by their Rust type. A publisher may additionally name a
 * scope (for example `"<gateway>/<device key>"`); scoped events reach the
 * subscribers of that scope and every unscoped subscriber of the type.
 */
use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::{Arc, Mutex};

use tokio::sync::broadcast;
use tracing::trace;

use crate::error::{Error, Result};

/// Maximum number of events that can be buffered in a channel
const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

type ChannelKey = (TypeId, Option<String>);

/// Event bus for publishing and subscribing to events
#[derive(Debug)]
pub struct EventBus {
    channels: Mutex<HashMap<ChannelKey, Box<dyn Any + Send + Sync>>>,
    channel_capacity: usize,
}

impl EventBus {
    /// Create a new event bus
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CHANNEL_CAPACITY)
    }

    /// Create a new event bus with a specific channel capacity
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            channels: Mutex::new(HashMap::new()),
            channel_capacity: capacity,
        }
    }

    fn sender<T>(&self, scope: Option<&str>) -> Result<broadcast::Sender<T>>
    where
        T: Clone + Debug + Send + Sync + 'static,
    {
        let key = (TypeId::of::<T>(), scope.map(str::to_string));
        let mut channels = self
            .channels
            .lock()
            .map_err(|_| Error::event("Failed to lock channels"))?;

        if let Some(sender) = channels.get(&key) {
            return sender
                .downcast_ref::<broadcast::Sender<T>>()
                .cloned()
                .ok_or_else(|| Error::event("Failed to downcast sender"));
        }

        let (sender, _) = broadcast::channel(self.channel_capacity);
        channels.insert(key, Box::new(sender.clone()));
        Ok(sender)
    }

    /// Publish an event to unscoped subscribers.
    ///
    /// Returns the number of receivers reached. Publishing with nobody
    /// listening is not an error.
    pub fn publish<T>(&self, event: T) -> Result<usize>
    where
        T: Clone + Debug + Send + Sync + 'static,
    {
        let sender = self.sender::<T>(None)?;
        let reached = sender.send(event).unwrap_or(0);
        trace!("Published event to {} receivers", reached);
        Ok(reached)
    }

    /// Publish an event to the subscribers of `scope` and to unscoped
    /// subscribers
    pub fn publish_scoped<T>(&self, scope: &str, event: T) -> Result<usize>
    where
        T: Clone + Debug + Send + Sync + 'static,
    {
        let scoped = self.sender::<T>(Some(scope))?;
        let reached = scoped.send(event.clone()).unwrap_or(0);
        Ok(reached + self.publish(event)?)
    }

    /// Subscribe to every event of type `T`
    pub fn subscribe<T>(&self) -> Result<broadcast::Receiver<T>>
    where
        T: Clone + Debug + Send + Sync + 'static,
    {
        Ok(self.sender::<T>(None)?.subscribe())
    }

    /// Subscribe to events of type `T` published under `scope`
    pub fn subscribe_scoped<T>(&self, scope: &str) -> Result<broadcast::Receiver<T>>
    where
        T: Clone + Debug + Send + Sync + 'static,
    {
        Ok(self.sender::<T>(Some(scope))?.subscribe())
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// A shared event bus that can be cloned
#[derive(Debug, Clone, Default)]
pub struct SharedEventBus(Arc<EventBus>);

impl SharedEventBus {
    /// Create a new shared event bus
    pub fn new() -> Self {
        Self(Arc::new(EventBus::new()))
    }

    /// Create a new shared event bus with a specific channel capacity
    pub fn with_capacity(capacity: usize) -> Self {
        Self(Arc::new(EventBus::with_capacity(capacity)))
    }

    /// Publish an event to unscoped subscribers
    pub fn publish<T: Clone + Debug + Send + Sync + 'static>(&self, event: T) -> Result<usize> {
        self.0.publish(event)
    }

    /// Publish an event under a scope
    pub fn publish_scoped<T: Clone + Debug + Send + Sync + 'static>(
        &self,
        scope: &str,
        event: T,
    ) -> Result<usize> {
        self.0.publish_scoped(scope, event)
    }

    /// Subscribe to every event of type `T`
    pub fn subscribe<T: Clone + Debug + Send + Sync + 'static>(
        &self,
    ) -> Result<broadcast::Receiver<T>> {
        self.0.subscribe()
    }

    /// Subscribe to events of type `T` under `scope`
    pub fn subscribe_scoped<T: Clone + Debug + Send + Sync + 'static>(
        &self,
        scope: &str,
    ) -> Result<broadcast::Receiver<T>> {
        self.0.subscribe_scoped(scope)
    }
}
