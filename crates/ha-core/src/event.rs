//! Notification envelope published by lifecycle components

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::Context;

/// Subscription key that receives every notification
pub const MATCH_ALL: &str = "*";

/// Payload of one notification type
pub trait EventData: Clone + Send + Sync + 'static {
    fn event_type() -> &'static str;
}

/// A notification with its payload, time and originating context
///
/// The bus transports `Event<serde_json::Value>`; subscribers narrow it to a
/// typed payload with [`Event::parse`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event<T = serde_json::Value> {
    pub event_type: String,
    pub data: T,
    pub time_fired: DateTime<Utc>,
    pub context: Context,
}

impl<T> Event<T> {
    pub fn new(event_type: impl Into<String>, data: T, context: Context) -> Self {
        Self {
            event_type: event_type.into(),
            data,
            time_fired: Utc::now(),
            context,
        }
    }

    pub fn is(&self, event_type: &str) -> bool {
        self.event_type == event_type
    }
}

impl Event<serde_json::Value> {
    /// Narrow to `T` when the type matches and the payload parses
    pub fn parse<T: EventData + DeserializeOwned>(self) -> Option<Event<T>> {
        if !self.is(T::event_type()) {
            return None;
        }
        let data = serde_json::from_value(self.data).ok()?;
        Some(Event {
            event_type: self.event_type,
            data,
            time_fired: self.time_fired,
            context: self.context,
        })
    }
}
