//! Typed event bus
//!
//! A closed set of event kinds broadcast to local subscribers,
//! at-least-once, no persistence. Events are observed after the
//! corresponding durable write commits; subscribers filter by tenant.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::types::{MemoryId, TenantId};

/// Closed set of event kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    MemoryAdded,
    MemoryUpdated,
    MemoryDeleted,
    TemporalFactCreated,
    TemporalFactUpdated,
    TemporalFactDeleted,
    TemporalEdgeCreated,
    TemporalEdgeUpdated,
    TemporalEdgeDeleted,
    IdeSuggestion,
    IdeSessionUpdate,
}

/// One bus event
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    #[serde(rename = "type")]
    pub kind: EventKind,
    pub tenant_id: TenantId,
    pub timestamp: DateTime<Utc>,
    /// Related memory or fact id
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

impl Event {
    pub fn memory_added(id: &MemoryId, tenant_id: TenantId) -> Self {
        Self::new(EventKind::MemoryAdded, tenant_id, Some(id.clone()))
    }

    pub fn memory_updated(id: &MemoryId, tenant_id: TenantId) -> Self {
        Self::new(EventKind::MemoryUpdated, tenant_id, Some(id.clone()))
    }

    pub fn memory_deleted(id: &MemoryId, tenant_id: TenantId) -> Self {
        Self::new(EventKind::MemoryDeleted, tenant_id, Some(id.clone()))
    }

    pub fn new(kind: EventKind, tenant_id: TenantId, subject_id: Option<String>) -> Self {
        Self {
            kind,
            tenant_id,
            timestamp: Utc::now(),
            subject_id,
            data: None,
        }
    }

    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = Some(data);
        self
    }
}

/// Broadcast bus with a bounded channel; slow subscribers lose the
/// oldest events (at-least-once only for keeping-up subscribers).
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<Event>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Emit an event. No subscribers is not an error.
    pub fn emit(&self, event: Event) {
        let _ = self.sender.send(event);
    }

    /// Subscribe to every event
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.sender.subscribe()
    }

    /// Number of live subscribers
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

/// Tenant-side filter applied by subscribers: a tenant sees its own
/// events and system-bucket events; admins see everything.
pub fn visible_to(event: &Event, tenant_id: &TenantId, is_admin: bool) -> bool {
    if is_admin {
        return true;
    }
    event.tenant_id.is_none() || event.tenant_id == *tenant_id
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_emit_and_receive() {
        let bus = EventBus::default();
        let mut rx = bus.subscribe();

        bus.emit(Event::memory_added(
            &"m1".to_string(),
            Some("u1".to_string()),
        ));

        let event = rx.recv().await.unwrap();
        assert_eq!(event.kind, EventKind::MemoryAdded);
        assert_eq!(event.subject_id.as_deref(), Some("m1"));
    }

    #[test]
    fn test_emit_without_subscribers_is_fine() {
        let bus = EventBus::default();
        bus.emit(Event::memory_deleted(&"m1".to_string(), None));
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[test]
    fn test_tenant_visibility() {
        let own = Event::memory_added(&"m".to_string(), Some("a".to_string()));
        let system = Event::memory_added(&"m".to_string(), None);
        let other = Event::memory_added(&"m".to_string(), Some("b".to_string()));

        let tenant = Some("a".to_string());
        assert!(visible_to(&own, &tenant, false));
        assert!(visible_to(&system, &tenant, false));
        assert!(!visible_to(&other, &tenant, false));
        assert!(visible_to(&other, &tenant, true));
    }
}
