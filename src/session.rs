//! Authentication and subscription state machine
//!
//! Every user-facing operation funnels through the session's authentication
//! outcome, so nothing is written for a session before its login has been
//! acknowledged. Login and per-group subscriptions are stored as shared
//! outcomes: a second caller asking for the same thing gets the outcome the
//! first caller created instead of issuing a new request.
//!
//! A send with no login ever started performs an implicit login with no
//! subscriptions, using the last login name or [`EsbConfig::name`]. Only when
//! neither exists does the send fail with [`EsbError::Authentication`].
//!
//! [`EsbConfig::name`]: crate::EsbConfig::name

use crate::client::ClientInner;
use crate::correlation::ReplyCallback;
use crate::error::{EsbError, Result};
use crate::message::{Message, META_FROM, META_REPLY_TO, RESULT_GROUP_SUFFIX};

use futures::future::{BoxFuture, Shared};
use futures::FutureExt;
use parking_lot::Mutex;
use serde_json::Value;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Cloneable handle on a pending or completed request
pub(crate) type Outcome = Shared<BoxFuture<'static, Result<Message>>>;

/// Session lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// No transport
    Disconnected,
    /// Waiting for the connector
    Connecting,
    /// Transport up, no login acknowledged
    Unauthenticated,
    /// Login sent, waiting for the acknowledgement
    Authenticating,
    /// Logged in
    Ready,
    /// Closed by the caller or out of reconnect options
    Closed,
}

impl SessionState {
    /// Whether a transport is currently attached
    pub fn is_connected(self) -> bool {
        matches!(
            self,
            SessionState::Unauthenticated | SessionState::Authenticating | SessionState::Ready
        )
    }
}

/// Lifecycle notifications published to [`EsbClient::events`]
///
/// [`EsbClient::events`]: crate::EsbClient::events
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEvent {
    /// A transport was established
    Connected,
    /// The transport dropped unexpectedly
    Disconnected,
    /// Waiting before connect attempt `attempt`
    Reconnecting { attempt: u32 },
    /// A new transport is up and the previous session is about to be replayed
    Reconnected,
    /// `close()` was called
    Closing,
    /// An inbound frame was dropped
    ProtocolError(String),
    /// The stream or connector failed
    TransportError(String),
}

/// What a replacement session must restore, captured when the transport drops
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionSnapshot {
    pub name: Option<String>,
    pub groups: Vec<String>,
}

struct SubscriptionEntry {
    group: String,
    token: u64,
    outcome: Outcome,
}

#[derive(Default)]
struct SessionData {
    name: Option<String>,
    channel: Option<String>,
    auth: Option<Outcome>,
    subscriptions: Vec<SubscriptionEntry>,
    next_token: u64,
}

/// Per-client session state
#[derive(Default)]
pub(crate) struct Session {
    data: Mutex<SessionData>,
}

impl Session {
    pub fn name(&self) -> Option<String> {
        self.data.lock().name.clone()
    }

    pub fn channel(&self) -> Option<String> {
        self.data.lock().channel.clone()
    }

    fn set_channel(&self, channel: Option<String>) {
        self.data.lock().channel = channel;
    }

    /// Subscribed or pending groups, in the order they were first requested
    pub fn groups(&self) -> Vec<String> {
        self.data
            .lock()
            .subscriptions
            .iter()
            .map(|s| s.group.clone())
            .collect()
    }

    /// Capture the restorable state and clear everything tied to the old transport
    ///
    /// The login name survives; the channel id, authentication outcome and
    /// subscription table do not.
    pub fn take_snapshot(&self) -> SessionSnapshot {
        let mut data = self.data.lock();
        let snapshot = SessionSnapshot {
            name: data.name.clone(),
            groups: data.subscriptions.iter().map(|s| s.group.clone()).collect(),
        };
        data.channel = None;
        data.auth = None;
        data.subscriptions.clear();
        snapshot
    }

    fn forget_subscription(&self, group: &str, token: u64) {
        self.data
            .lock()
            .subscriptions
            .retain(|s| !(s.group == group && s.token == token));
    }
}

/// Run an outcome to completion in the background even if nobody awaits it
fn drive(outcome: &Outcome) {
    tokio::spawn(outcome.clone().map(|_| ()));
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "handler panicked".to_string()
    }
}

impl ClientInner {
    fn login_future(self: &Arc<Self>, name: String) -> BoxFuture<'static, Result<Message>> {
        let inner = self.clone();
        async move {
            let epoch = inner.wait_connected().await?;
            inner.set_state_for(epoch, SessionState::Authenticating);

            let request = Message::login(&name, &[]);
            let reply = inner.request(request, inner.config.rpc_timeout).await;

            match &reply {
                Ok(ack) => {
                    let channel = ack
                        .get("channel")
                        .and_then(Value::as_str)
                        .or_else(|| ack.meta_str(META_FROM))
                        .map(str::to_string);
                    info!(name = %name, channel = ?channel, "Logged in");
                    inner.session.set_channel(channel);
                    inner.set_state_for(epoch, SessionState::Ready);
                }
                Err(e) => {
                    warn!(name = %name, error = %e, "Login failed");
                    inner.set_state_for(epoch, SessionState::Unauthenticated);
                }
            }
            reply
        }
        .boxed()
    }

    fn install_login(self: &Arc<Self>, data: &mut SessionData, name: String) -> Outcome {
        let outcome = self.login_future(name.clone()).shared();
        data.name = Some(name);
        data.auth = Some(outcome.clone());
        outcome
    }

    /// Start a login and make it the session's authentication outcome
    ///
    /// A login for the same name that is still in flight, or has succeeded
    /// on the current transport, is shared instead of sending another.
    pub(crate) fn begin_login(self: &Arc<Self>, name: &str) -> Outcome {
        let outcome = {
            let mut data = self.session.data.lock();
            if data.name.as_deref() == Some(name) {
                if let Some(auth) = &data.auth {
                    if !matches!(auth.peek(), Some(Err(_))) {
                        return auth.clone();
                    }
                }
            }
            self.install_login(&mut data, name.to_string())
        };
        drive(&outcome);
        outcome
    }

    /// The current authentication outcome, starting an implicit login if needed
    fn auth_outcome(self: &Arc<Self>) -> Result<Outcome> {
        let mut data = self.session.data.lock();
        if let Some(auth) = &data.auth {
            return Ok(auth.clone());
        }

        let name = data.name.clone().or_else(|| self.config.name.clone());
        let Some(name) = name else {
            return Err(EsbError::Authentication(
                "no login has been started and no default name is configured".to_string(),
            ));
        };

        debug!(name = %name, "Starting implicit login");
        let outcome = self.install_login(&mut data, name);
        drop(data);
        drive(&outcome);
        Ok(outcome)
    }

    /// Wait for the session to be authenticated
    pub(crate) async fn authenticated(self: &Arc<Self>) -> Result<Message> {
        self.auth_outcome()?.await
    }

    fn subscribe_future(
        self: &Arc<Self>,
        group: String,
        token: u64,
        after: Option<Outcome>,
    ) -> BoxFuture<'static, Result<Message>> {
        let inner = self.clone();
        async move {
            let result = async {
                inner.authenticated().await?;
                if let Some(previous) = after {
                    let _ = previous.await;
                }
                inner
                    .request(Message::subscribe(&group), inner.config.rpc_timeout)
                    .await
            }
            .await;

            match &result {
                Ok(_) => debug!(group = %group, "Subscribed"),
                Err(e) => {
                    warn!(group = %group, error = %e, "Subscription failed");
                    inner.session.forget_subscription(&group, token);
                }
            }
            result
        }
        .boxed()
    }

    fn install_subscription(
        self: &Arc<Self>,
        data: &mut SessionData,
        group: &str,
        after: Option<Outcome>,
    ) -> Outcome {
        let token = data.next_token;
        data.next_token += 1;
        let outcome = self
            .subscribe_future(group.to_string(), token, after)
            .shared();
        data.subscriptions.push(SubscriptionEntry {
            group: group.to_string(),
            token,
            outcome: outcome.clone(),
        });
        outcome
    }

    /// The subscription outcome for `group`, requesting it if not yet pending
    pub(crate) fn subscription(self: &Arc<Self>, group: &str) -> Outcome {
        let outcome = {
            let mut data = self.session.data.lock();
            if let Some(existing) = data.subscriptions.iter().find(|s| s.group == group) {
                return existing.outcome.clone();
            }
            self.install_subscription(&mut data, group, None)
        };
        drive(&outcome);
        outcome
    }

    /// Rebuild the session from a snapshot: login first, then each group in order
    ///
    /// The outcomes are installed immediately so calls made before the new
    /// transport is up wait behind them; nothing is written until it is.
    pub(crate) fn replay(self: &Arc<Self>, snapshot: &SessionSnapshot) {
        let Some(name) = snapshot.name.clone() else {
            return;
        };

        let outcomes = {
            let mut data = self.session.data.lock();
            let mut outcomes = vec![self.install_login(&mut data, name)];
            let mut previous: Option<Outcome> = None;
            for group in &snapshot.groups {
                let outcome = self.install_subscription(&mut data, group, previous.take());
                previous = Some(outcome.clone());
                outcomes.push(outcome);
            }
            outcomes
        };

        for outcome in &outcomes {
            drive(outcome);
        }
    }

    /// Send `request` and wait up to `bound` for its correlated reply
    pub(crate) async fn request(&self, request: Message, bound: Duration) -> Result<Message> {
        let expectation = self.pending.expect(&request.id());
        self.write(&request).await?;
        expectation.wait(bound).await
    }

    /// Authenticate if needed, then publish `data` into `group`
    pub(crate) async fn publish(
        self: &Arc<Self>,
        group: &str,
        data: Value,
        inre: Option<&str>,
        on_reply: Option<ReplyCallback>,
    ) -> Result<Message> {
        self.authenticated().await?;

        let channel = self.session.channel();
        let msg = Message::send(Value::from(group), data, inre, channel.as_deref());
        let id = msg.id();

        let registered = on_reply.is_some();
        if let Some(callback) = on_reply {
            self.pending.on_reply(&id, callback);
        }

        if let Err(e) = self.write(&msg).await {
            if registered {
                self.pending.forget(&id);
            }
            return Err(e);
        }

        debug!(group = %group, id = %id, "Sent message");
        Ok(msg)
    }

    /// Publish into `group` and wait for exactly one reply on `group-result`
    pub(crate) async fn rpc_send(
        self: &Arc<Self>,
        group: &str,
        data: Value,
        inre: Option<&str>,
        bound: Duration,
    ) -> Result<Message> {
        let result_group = format!("{}{}", group, RESULT_GROUP_SUFFIX);
        self.subscription(&result_group).await?;
        self.authenticated().await?;

        let channel = self.session.channel();
        let msg = Message::send(Value::from(group), data, inre, channel.as_deref());
        debug!(group = %group, id = %msg.id(), "Sending RPC request");
        self.request(msg, bound).await
    }

    /// Answer every request arriving in `group` with the handler's result
    pub(crate) async fn rpc_receive<F, Fut>(
        self: &Arc<Self>,
        group: &str,
        handler: F,
    ) -> Result<crate::dispatch::ListenerId>
    where
        F: Fn(Message) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        let handler = Arc::new(handler);
        let weak = Arc::downgrade(self);
        let result_group = format!("{}{}", group, RESULT_GROUP_SUFFIX);

        let listener = self.dispatcher.on(
            crate::dispatch::EventKey::group(group),
            move |request: &Message| {
                if request.has_meta(META_REPLY_TO) {
                    return;
                }
                let Some(inner) = weak.upgrade() else {
                    return;
                };

                let handler = handler.clone();
                let request = request.clone();
                let result_group = result_group.clone();

                tokio::spawn(async move {
                    let outcome = match std::panic::catch_unwind(AssertUnwindSafe(|| {
                        handler(request.clone())
                    })) {
                        Ok(fut) => match AssertUnwindSafe(fut).catch_unwind().await {
                            Ok(result) => result,
                            Err(panic) => Err(anyhow::anyhow!(panic_message(panic))),
                        },
                        Err(panic) => Err(anyhow::anyhow!(panic_message(panic))),
                    };

                    let mut groups = request.cc_groups();
                    groups.push(result_group);

                    let reply = match outcome {
                        Ok(value) => request.success(groups, value),
                        Err(e) => {
                            debug!(id = %request.id(), error = %e, "RPC handler failed");
                            request.failure(groups, &e.to_string())
                        }
                    };

                    let sent = async {
                        inner.authenticated().await?;
                        inner.write(&reply).await
                    }
                    .await;
                    if let Err(e) = sent {
                        warn!(id = %request.id(), error = %e, "Failed to send RPC reply");
                    }
                });
            },
        );

        if let Err(e) = self.subscription(group).await {
            self.dispatcher.off(listener);
            return Err(e);
        }
        Ok(listener)
    }
}
