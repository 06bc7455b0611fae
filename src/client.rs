//! ESB client implementation

use crate::codec::encode_frame;
use crate::config::EsbConfig;
use crate::correlation::{PendingReplies, ReplyCallback};
use crate::dispatch::{Dispatcher, EventKey, ListenerId};
use crate::error::{EsbError, Result};
use crate::message::Message;
use crate::reconnect;
use crate::session::{ClientEvent, Session, SessionState};
use crate::transport::{Connector, TcpConnector};

use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// State shared between the client handles, the supervisor and spawned outcomes
pub(crate) struct ClientInner {
    pub(crate) config: EsbConfig,
    pub(crate) connector: Arc<dyn Connector>,
    state: watch::Sender<SessionState>,
    state_rx: watch::Receiver<SessionState>,
    events: broadcast::Sender<ClientEvent>,

    // Frames for the current transport's writer; `None` while disconnected
    pub(crate) outbound: Mutex<Option<mpsc::Sender<String>>>,

    pub(crate) pending: PendingReplies,
    pub(crate) dispatcher: Dispatcher,
    pub(crate) session: Session,

    // Bumped for every established transport
    pub(crate) epoch: AtomicU64,

    closing: AtomicBool,
    pub(crate) shutdown: Notify,
    supervisor: Mutex<Option<JoinHandle<()>>>,
}

impl ClientInner {
    pub(crate) fn set_state(&self, state: SessionState) {
        let _ = self.state.send(state);
    }

    /// Update a connected state, unless the transport it belongs to is gone
    pub(crate) fn set_state_for(&self, epoch: u64, state: SessionState) {
        if self.epoch.load(Ordering::SeqCst) != epoch {
            return;
        }
        self.state.send_if_modified(|current| {
            if current.is_connected() && *current != state {
                *current = state;
                true
            } else {
                false
            }
        });
    }

    pub(crate) fn emit(&self, event: ClientEvent) {
        let _ = self.events.send(event);
    }

    pub(crate) fn is_closing(&self) -> bool {
        self.closing.load(Ordering::SeqCst)
    }

    /// Wait for a transport and return its epoch
    pub(crate) async fn wait_connected(&self) -> Result<u64> {
        let mut state_rx = self.state_rx.clone();
        loop {
            let state = *state_rx.borrow_and_update();
            match state {
                SessionState::Closed => return Err(EsbError::Shutdown),
                s if s.is_connected() => return Ok(self.epoch.load(Ordering::SeqCst)),
                _ => {}
            }
            state_rx.changed().await.map_err(|_| EsbError::Shutdown)?;
        }
    }

    /// Queue one frame on the current transport
    pub(crate) async fn write(&self, msg: &Message) -> Result<()> {
        let frame = encode_frame(msg)?;
        let tx = self.outbound.lock().clone();
        match tx {
            Some(tx) => tx.send(frame).await.map_err(|_| EsbError::NotConnected),
            None => Err(EsbError::NotConnected),
        }
    }
}

/// ESB client
///
/// Provides login, group subscriptions, fire-and-forget sends and RPC over a
/// single bus connection, with automatic reconnection and session replay.
/// This struct is cheaply cloneable as it uses an internal Arc.
#[derive(Clone)]
pub struct EsbClient {
    inner: Arc<ClientInner>,
}

impl EsbClient {
    /// Create a client that connects over TCP to `config.addr`
    pub fn new(config: EsbConfig) -> Self {
        let connector = TcpConnector::new(config.addr.clone());
        Self::with_connector(config, Arc::new(connector))
    }

    /// Create a client with a custom stream source
    pub fn with_connector(config: EsbConfig, connector: Arc<dyn Connector>) -> Self {
        let (state_tx, state_rx) = watch::channel(SessionState::Disconnected);
        let (events, _) = broadcast::channel(config.event_capacity.max(1));

        let inner = Arc::new(ClientInner {
            config,
            connector,
            state: state_tx,
            state_rx,
            events,
            outbound: Mutex::new(None),
            pending: PendingReplies::new(),
            dispatcher: Dispatcher::new(),
            session: Session::default(),
            epoch: AtomicU64::new(0),
            closing: AtomicBool::new(false),
            shutdown: Notify::new(),
            supervisor: Mutex::new(None),
        });

        Self { inner }
    }

    /// Get the current session state
    pub fn state(&self) -> SessionState {
        *self.inner.state_rx.borrow()
    }

    /// Get a receiver for session state changes
    pub fn state_receiver(&self) -> watch::Receiver<SessionState> {
        self.inner.state_rx.clone()
    }

    /// Subscribe to lifecycle notifications
    pub fn events(&self) -> broadcast::Receiver<ClientEvent> {
        self.inner.events.subscribe()
    }

    /// Channel id assigned by the bus at login, cleared on disconnect
    pub fn channel_id(&self) -> Option<String> {
        self.inner.session.channel()
    }

    /// Name of the last login, kept across reconnects
    pub fn login_name(&self) -> Option<String> {
        self.inner.session.name()
    }

    /// Groups subscribed or pending, in request order
    pub fn subscriptions(&self) -> Vec<String> {
        self.inner.session.groups()
    }

    /// Start the connection supervisor and wait for the first transport
    ///
    /// With auto-reconnect enabled a failed first attempt is still reported
    /// here, while the supervisor keeps retrying in the background.
    pub async fn connect(&self) -> Result<()> {
        if self.inner.is_closing() {
            return Err(EsbError::Shutdown);
        }

        {
            let mut supervisor = self.inner.supervisor.lock();
            if supervisor.is_none() {
                self.inner.set_state(SessionState::Connecting);
                let inner = self.inner.clone();
                *supervisor = Some(tokio::spawn(reconnect::supervise(inner)));
            }
        }

        let mut state_rx = self.inner.state_rx.clone();
        loop {
            let state = *state_rx.borrow_and_update();
            match state {
                s if s.is_connected() => return Ok(()),
                SessionState::Disconnected => {
                    return Err(EsbError::Transport("Connection failed".into()));
                }
                SessionState::Closed => return Err(EsbError::Shutdown),
                _ => {}
            }
            if state_rx.changed().await.is_err() {
                return Err(EsbError::Shutdown);
            }
        }
    }

    /// Close the client
    ///
    /// Stops reconnection, tears down the transport and moves to
    /// [`SessionState::Closed`]. Waiting logins, subscriptions and RPCs fail
    /// with [`EsbError::Shutdown`].
    pub async fn close(&self) -> Result<()> {
        if self.inner.closing.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        info!("Closing client");
        self.inner.emit(ClientEvent::Closing);
        self.inner.shutdown.notify_one();

        let supervisor = self.inner.supervisor.lock().take();
        if let Some(handle) = supervisor {
            let _ = handle.await;
        }

        *self.inner.outbound.lock() = None;
        self.inner.set_state(SessionState::Closed);

        let abandoned = self.inner.pending.clear();
        if abandoned > 0 {
            debug!(abandoned, "Dropped pending replies on close");
        }
        Ok(())
    }

    /// Log in as `name` and wait for the acknowledgement
    ///
    /// The login becomes the session's authentication outcome: every later
    /// subscribe and send waits on it. Called before the transport is up,
    /// the request is written as soon as it is.
    pub async fn login(&self, name: &str) -> Result<Message> {
        self.inner.begin_login(name).await
    }

    /// Join `group`, sharing the outcome with any concurrent subscribe to it
    pub async fn subscribe(&self, group: &str) -> Result<Message> {
        self.inner.subscription(group).await
    }

    /// Publish `data` into `group` and return the message that was sent
    pub async fn send<T: Serialize>(
        &self,
        group: &str,
        data: &T,
        inre: Option<&str>,
    ) -> Result<Message> {
        let data = serde_json::to_value(data)?;
        self.inner.publish(group, data, inre, None).await
    }

    /// Publish and invoke `callback` for every reply correlated to the sent message
    ///
    /// The callback stays registered until [`cancel_replies`](Self::cancel_replies).
    pub async fn send_with_callback<T, F>(
        &self,
        group: &str,
        data: &T,
        inre: Option<&str>,
        callback: F,
    ) -> Result<Message>
    where
        T: Serialize,
        F: Fn(Message) + Send + Sync + 'static,
    {
        let data = serde_json::to_value(data)?;
        let callback: ReplyCallback = Arc::new(callback);
        self.inner.publish(group, data, inre, Some(callback)).await
    }

    /// Stop routing replies for a message sent with a callback
    pub fn cancel_replies(&self, id: &str) -> bool {
        self.inner.pending.forget(id)
    }

    /// Send a request into `group` and wait for its reply
    pub async fn rpc_send<T: Serialize>(
        &self,
        group: &str,
        data: &T,
        inre: Option<&str>,
    ) -> Result<Message> {
        let bound = self.inner.config.rpc_timeout;
        self.rpc_send_with_timeout(group, data, inre, bound).await
    }

    /// [`rpc_send`](Self::rpc_send) with an explicit reply bound
    pub async fn rpc_send_with_timeout<T: Serialize>(
        &self,
        group: &str,
        data: &T,
        inre: Option<&str>,
        bound: Duration,
    ) -> Result<Message> {
        let data = serde_json::to_value(data)?;
        self.inner.rpc_send(group, data, inre, bound).await
    }

    /// Serve requests arriving in `group`
    ///
    /// Each request is handed to `handler`. `Ok(value)` is answered with a
    /// `SUCCESS` reply carrying `value`; an error or a panic is answered with
    /// `FAILURE` and the error text as the reason. Replies go to the request's
    /// `cc.group` list plus `group-result`.
    ///
    /// Messages in `group` that carry `replyTo` are replies copied there
    /// through `cc.group`, not requests; they are skipped so two responders
    /// never answer each other's replies.
    pub async fn rpc_receive<F, Fut>(&self, group: &str, handler: F) -> Result<ListenerId>
    where
        F: Fn(Message) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        self.inner.rpc_receive(group, handler).await
    }

    /// Register a listener for inbound messages
    pub fn on<F>(&self, key: EventKey, listener: F) -> ListenerId
    where
        F: Fn(&Message) + Send + Sync + 'static,
    {
        debug!(key = %key, "Registering listener");
        self.inner.dispatcher.on(key, listener)
    }

    /// Remove a listener registered with [`on`](Self::on) or [`rpc_receive`](Self::rpc_receive)
    pub fn off(&self, id: ListenerId) -> bool {
        self.inner.dispatcher.off(id)
    }
}
