//! Notification hooks for the automation lifecycle
//!
//! Lifecycle components publish `automation_version_created`,
//! `automation_retired` and `automation_backup_restored` notifications here.
//! Dashboards, the recorder and the runtime subscribe either to a single
//! event type or to everything through [`MATCH_ALL`].
//!
//! Publishing never blocks and never fails: a notification with no
//! subscribers is dropped.

use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use ha_core::{Context, Event, EventData, MATCH_ALL};
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::{debug, warn};

const DEFAULT_CAPACITY: usize = 256;

type RawEvent = Event<Value>;

/// Broadcast bus for lifecycle notifications
pub struct EventBus {
    by_type: DashMap<String, broadcast::Sender<RawEvent>>,
    everything: broadcast::Sender<RawEvent>,
    published: AtomicU64,
    capacity: usize,
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    /// Bus whose channels buffer `capacity` notifications per subscriber
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            by_type: DashMap::new(),
            everything: broadcast::channel(capacity).0,
            published: AtomicU64::new(0),
            capacity,
        }
    }

    /// Raw receiver for one event type, or every type with [`MATCH_ALL`]
    pub fn subscribe(&self, event_type: &str) -> broadcast::Receiver<RawEvent> {
        if event_type == MATCH_ALL {
            return self.everything.subscribe();
        }
        self.by_type
            .entry(event_type.to_owned())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .subscribe()
    }

    /// Typed receiver for the notifications carrying `T`
    pub fn listen<T: EventData + DeserializeOwned>(&self) -> Listener<T> {
        Listener {
            rx: self.subscribe(T::event_type()),
            _payload: PhantomData,
        }
    }

    pub fn publish_event(&self, event: RawEvent) {
        self.published.fetch_add(1, Ordering::Relaxed);
        debug!(event_type = %event.event_type, "Publishing lifecycle event");

        // Send errors only mean nobody is listening
        if let Some(sender) = self.by_type.get(&event.event_type) {
            let _ = sender.send(event.clone());
        }
        let _ = self.everything.send(event);
    }

    /// Publish a typed payload on behalf of `context`
    pub fn publish<T: EventData + Serialize>(&self, payload: T, context: Context) {
        match serde_json::to_value(&payload) {
            Ok(data) => self.publish_event(Event::new(T::event_type(), data, context)),
            Err(err) => warn!(
                event_type = T::event_type(),
                error = %err,
                "Dropping lifecycle event that failed to serialize"
            ),
        }
    }

    pub fn published_count(&self) -> u64 {
        self.published.load(Ordering::Relaxed)
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Receiver that yields only notifications whose payload parses as `T`
pub struct Listener<T> {
    rx: broadcast::Receiver<RawEvent>,
    _payload: PhantomData<T>,
}

impl<T: EventData + DeserializeOwned> Listener<T> {
    pub async fn recv(&mut self) -> Result<Event<T>, RecvError> {
        loop {
            if let Some(event) = self.rx.recv().await?.parse() {
                return Ok(event);
            }
        }
    }

    /// Next buffered notification, if any
    pub fn try_recv(&mut self) -> Option<Event<T>> {
        while let Ok(raw) = self.rx.try_recv() {
            if let Some(event) = raw.parse() {
                return Some(event);
            }
        }
        None
    }
}
