//! The event and filter types `EventPublisher` traffics in.

use device_common::DeviceId;
use uuid::Uuid;

/// One published event, as carried through the bus to every matching
/// subscriber. Mirrors spec.md §3's `PublishedEvent`.
#[derive(Debug, Clone)]
pub struct PublishedEvent {
    pub name: String,
    pub user_id: Option<Uuid>,
    pub device_id: Option<DeviceId>,
    pub connection_id: Option<String>,
    pub context: Option<serde_json::Value>,
    pub ttl: Option<u32>,
    pub published_at: chrono::DateTime<chrono::Utc>,
    pub broadcasted: bool,
}

impl PublishedEvent {
    /// Build a minimal event carrying just a name; every other field
    /// defaults to "not set" / `false`. `published_at` is stamped by
    /// [`crate::EventPublisher::publish`], not here, since this type has no
    /// clock access of its own (matches the rest of this workspace's rule
    /// against hidden `Instant::now()` calls inside plain data types).
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            user_id: None,
            device_id: None,
            connection_id: None,
            context: None,
            ttl: None,
            published_at: chrono::DateTime::UNIX_EPOCH,
            broadcasted: false,
        }
    }

    pub fn with_user_id(mut self, user_id: Uuid) -> Self {
        self.user_id = Some(user_id);
        self
    }

    pub fn with_device_id(mut self, device_id: DeviceId) -> Self {
        self.device_id = Some(device_id);
        self
    }

    pub fn with_connection_id(mut self, connection_id: impl Into<String>) -> Self {
        self.connection_id = Some(connection_id.into());
        self
    }

    pub fn with_context(mut self, context: serde_json::Value) -> Self {
        self.context = Some(context);
        self
    }

    pub fn with_ttl(mut self, ttl: u32) -> Self {
        self.ttl = Some(ttl);
        self
    }

    pub fn broadcasted(mut self, broadcasted: bool) -> Self {
        self.broadcasted = broadcasted;
        self
    }
}

/// Publish-time metadata: not part of the event's own identity, but
/// consulted by subscriber filters (spec.md §4.4).
#[derive(Debug, Clone, Copy, Default)]
pub struct PublishMetadata {
    pub is_public: bool,
    pub is_internal: bool,
}

impl PublishMetadata {
    pub fn public() -> Self {
        Self { is_public: true, is_internal: false }
    }

    pub fn private() -> Self {
        Self { is_public: false, is_internal: false }
    }

    pub fn internal(mut self) -> Self {
        self.is_internal = true;
        self
    }
}

/// Filters a subscription applies to decide whether a given publish is
/// delivered to its handler. Field absence/defaults follow spec.md's table:
/// `userID`/`deviceID`/`connectionID`/`mydevices` default to "no ownership
/// restriction"; `listenToInternalEvents`/`listenToBroadcastedEvents` default
/// to `true` (the caller opts *out* of these, not in).
#[derive(Debug, Clone, Default)]
pub struct FilterOptions {
    pub user_id: Option<Uuid>,
    pub device_id: Option<DeviceId>,
    pub connection_id: Option<String>,
    pub mydevices: bool,
    pub listen_to_internal_events: bool,
    pub listen_to_broadcasted_events: bool,
}

impl FilterOptions {
    pub fn new() -> Self {
        Self { listen_to_internal_events: true, listen_to_broadcasted_events: true, ..Default::default() }
    }

    pub fn with_user_id(mut self, user_id: Uuid) -> Self {
        self.user_id = Some(user_id);
        self
    }

    pub fn with_device_id(mut self, device_id: DeviceId) -> Self {
        self.device_id = Some(device_id);
        self
    }

    pub fn with_connection_id(mut self, connection_id: impl Into<String>) -> Self {
        self.connection_id = Some(connection_id.into());
        self
    }

    pub fn mydevices(mut self, user_id: Uuid) -> Self {
        self.user_id = Some(user_id);
        self.mydevices = true;
        self
    }

    pub fn ignore_internal_events(mut self) -> Self {
        self.listen_to_internal_events = false;
        self
    }

    pub fn ignore_broadcasted_events(mut self) -> Self {
        self.listen_to_broadcasted_events = false;
        self
    }

    /// Whether `event`/`metadata` passes every filter this subscription set.
    pub(crate) fn matches(&self, event: &PublishedEvent, metadata: PublishMetadata) -> bool {
        if !self.listen_to_internal_events && metadata.is_internal {
            return false;
        }
        if !self.listen_to_broadcasted_events && event.broadcasted {
            return false;
        }

        if let Some(device_id) = &self.device_id {
            if event.device_id.as_ref() != Some(device_id) {
                return false;
            }
        }

        if let Some(user_id) = &self.user_id {
            if self.mydevices {
                // mydevices: ownership alone decides it, public or not.
                if event.user_id.as_ref() != Some(user_id) {
                    return false;
                }
            } else if event.user_id.as_ref() != Some(user_id) && !metadata.is_public {
                return false;
            }
        }

        if let Some(connection_id) = &self.connection_id {
            if !metadata.is_public && event.connection_id.as_deref() == Some(connection_id.as_str()) {
                return false;
            }
        }

        true
    }
}
