//! Request/reply correlation
//!
//! Outbound messages that expect an answer register their own `id` here.
//! Inbound frames carrying `meta.replyTo` are matched against the registry.
//! One-shot entries are removed in the same critical section that claims
//! them, so a duplicate reply finds nothing and is dropped.

use crate::error::{EsbError, Result};
use crate::message::{Message, META_REASON, META_REPLY_TO, META_RESULT, RESULT_FAILURE, RESULT_SUCCESS};

use parking_lot::Mutex;
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::timeout;
use tracing::{debug, warn};

/// Callback fired for every reply to a plain `send`
pub type ReplyCallback = Arc<dyn Fn(Message) + Send + Sync>;

enum Pending {
    Once(oneshot::Sender<Message>),
    Repeating(ReplyCallback),
}

/// Registry of messages awaiting replies, keyed by message id
#[derive(Clone, Default)]
pub struct PendingReplies {
    entries: Arc<Mutex<HashMap<String, Pending>>>,
}

impl PendingReplies {
    pub fn new() -> Self {
        Self::default()
    }

    /// Expect exactly one reply to `id`
    pub fn expect(&self, id: &str) -> Expectation {
        let (tx, rx) = oneshot::channel();
        self.entries.lock().insert(id.to_string(), Pending::Once(tx));
        Expectation {
            id: id.to_string(),
            rx,
            pending: self.clone(),
        }
    }

    /// Invoke `callback` for every reply to `id` until [`forget`](Self::forget)
    pub fn on_reply(&self, id: &str, callback: ReplyCallback) {
        self.entries
            .lock()
            .insert(id.to_string(), Pending::Repeating(callback));
    }

    /// Drop the entry for `id`, returning whether one existed
    pub fn forget(&self, id: &str) -> bool {
        self.entries.lock().remove(id).is_some()
    }

    /// Drop every entry; waiting expectations fail with [`EsbError::Shutdown`]
    pub fn clear(&self) -> usize {
        let drained: Vec<Pending> = self.entries.lock().drain().map(|(_, p)| p).collect();
        drained.len()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Route a reply to its waiting entry; returns whether anything claimed it
    pub fn resolve(&self, reply: &Message) -> bool {
        let Some(reply_to) = reply.meta_str(META_REPLY_TO) else {
            return false;
        };

        let claimed = {
            let mut entries = self.entries.lock();
            match entries.remove(reply_to) {
                Some(Pending::Repeating(callback)) => {
                    entries.insert(reply_to.to_string(), Pending::Repeating(callback.clone()));
                    Some(Pending::Repeating(callback))
                }
                other => other,
            }
        };

        match claimed {
            Some(Pending::Once(tx)) => {
                if tx.send(reply.clone()).is_err() {
                    debug!(reply_to = %reply_to, "Reply arrived after caller went away");
                }
            }
            Some(Pending::Repeating(callback)) => {
                let reply = reply.clone();
                if catch_unwind(AssertUnwindSafe(|| callback(reply))).is_err() {
                    warn!(reply_to = %reply_to, "Reply callback panicked");
                }
            }
            None => {
                debug!(reply_to = %reply_to, "Dropping reply with no pending request");
                return false;
            }
        }
        true
    }
}

/// Apply the resolution policy to a correlated reply
///
/// `SUCCESS` fulfills with the reply, `FAILURE` rejects with the remote
/// `reason`, anything else is a protocol violation.
pub fn settle(reply: Message) -> Result<Message> {
    match reply.meta_str(META_RESULT) {
        Some(RESULT_SUCCESS) => Ok(reply),
        Some(RESULT_FAILURE) => Err(EsbError::RpcFailure {
            reason: reply
                .get_meta(META_REASON)
                .map(|r| match r.as_str() {
                    Some(s) => s.to_string(),
                    None => r.to_string(),
                })
                .unwrap_or_default(),
        }),
        Some(other) => Err(EsbError::Protocol(format!(
            "reply {} has unknown result {:?}",
            reply.id(),
            other
        ))),
        None => Err(EsbError::Protocol(format!(
            "reply {} carries no result",
            reply.id()
        ))),
    }
}

/// A registered one-shot expectation; dropping it frees the pending entry
pub struct Expectation {
    id: String,
    rx: oneshot::Receiver<Message>,
    pending: PendingReplies,
}

impl Expectation {
    /// Wait up to `bound` for the reply and settle it
    pub async fn wait(mut self, bound: Duration) -> Result<Message> {
        match timeout(bound, &mut self.rx).await {
            Ok(Ok(reply)) => settle(reply),
            Ok(Err(_)) => Err(EsbError::Shutdown),
            Err(_) => {
                debug!(id = %self.id, ?bound, "Reply timed out");
                Err(EsbError::RpcTimeout(bound))
            }
        }
    }
}

impl Drop for Expectation {
    fn drop(&mut self) {
        self.pending.forget(&self.id);
    }
}
