//! Inbound message routing
//!
//! Listeners register against an [`EventKey`]: a `(meta field, value)` pair,
//! the catch-all [`EventKey::All`], or [`EventKey::Unhandled`] which fires
//! only when no field listener took the message. Sequence-valued meta fields
//! (e.g. `group: ["a", "b"]`, `cc.group`) fan out to each element.

use crate::message::{Message, META_GROUP, META_REPLY_TO, META_TYPE};

use dashmap::DashMap;
use serde_json::Value;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

/// Callback invoked for a routed message
pub type Listener = Arc<dyn Fn(&Message) + Send + Sync>;

/// What a listener is registered against
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum EventKey {
    /// Messages whose meta `field` equals (or contains) `value`
    Field { field: String, value: String },
    /// Every inbound message
    All,
    /// Messages no field listener handled
    Unhandled,
}

impl EventKey {
    pub fn field(field: impl Into<String>, value: impl Into<String>) -> Self {
        EventKey::Field {
            field: field.into(),
            value: value.into(),
        }
    }

    /// Route on `meta.type`
    pub fn kind(value: impl Into<String>) -> Self {
        Self::field(META_TYPE, value)
    }

    /// Route on `meta.group`
    pub fn group(value: impl Into<String>) -> Self {
        Self::field(META_GROUP, value)
    }

    /// Route on `meta.replyTo`
    pub fn reply_to(value: impl Into<String>) -> Self {
        Self::field(META_REPLY_TO, value)
    }
}

impl fmt::Display for EventKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventKey::Field { field, value } => write!(f, "{}={}", field, value),
            EventKey::All => write!(f, "*"),
            EventKey::Unhandled => write!(f, "unhandled"),
        }
    }
}

/// Handle returned by [`Dispatcher::on`], used to deregister
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

/// Scalar form of a meta value used as a routing key
fn scalar_key(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

/// Listener registry keyed by [`EventKey`]
#[derive(Clone, Default)]
pub struct Dispatcher {
    listeners: Arc<DashMap<EventKey, Vec<(ListenerId, Listener)>>>,
    next_id: Arc<AtomicU64>,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a listener; listeners on the same key run in registration order
    pub fn on<F>(&self, key: EventKey, listener: F) -> ListenerId
    where
        F: Fn(&Message) + Send + Sync + 'static,
    {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let listener: Listener = Arc::new(listener);
        self.listeners.entry(key).or_default().push((id, listener));
        id
    }

    /// Remove a listener, returning whether it was registered
    pub fn off(&self, id: ListenerId) -> bool {
        let mut removed = false;
        self.listeners.retain(|_, entries| {
            let before = entries.len();
            entries.retain(|(entry_id, _)| *entry_id != id);
            removed |= entries.len() != before;
            !entries.is_empty()
        });
        removed
    }

    pub fn listener_count(&self, key: &EventKey) -> usize {
        self.listeners.get(key).map(|e| e.len()).unwrap_or(0)
    }

    /// Route `msg` to every interested listener
    ///
    /// Returns the number of field listeners invoked. [`EventKey::All`]
    /// always fires; [`EventKey::Unhandled`] fires when that number is zero.
    pub fn dispatch(&self, msg: &Message) -> usize {
        let mut fired = 0;

        for (field, value) in msg.meta() {
            let members: Vec<String> = match value {
                Value::Array(items) => items.iter().filter_map(scalar_key).collect(),
                other => scalar_key(other).into_iter().collect(),
            };
            for member in members {
                fired += self.fire(&EventKey::field(field.as_str(), member), msg);
            }
        }

        self.fire(&EventKey::All, msg);

        if fired == 0 {
            debug!(id = %msg.id(), "No listener for message");
            self.fire(&EventKey::Unhandled, msg);
        }

        fired
    }

    fn fire(&self, key: &EventKey, msg: &Message) -> usize {
        // Snapshot so listeners may (de)register without holding the shard lock
        let listeners: Vec<Listener> = match self.listeners.get(key) {
            Some(entries) => entries.iter().map(|(_, l)| l.clone()).collect(),
            None => return 0,
        };

        for listener in &listeners {
            if catch_unwind(AssertUnwindSafe(|| listener(msg))).is_err() {
                warn!(key = %key, id = %msg.id(), "Listener panicked");
            }
        }

        listeners.len()
    }
}
