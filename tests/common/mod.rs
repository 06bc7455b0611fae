//! Shared test harness: an in-memory bus reached through duplex pipes
//!
//! The bus acknowledges `login` (assigning `chan-<n>`) and `subscribe`, and
//! routes `sendMessage` to every connection subscribed to one of its groups.
//! Every frame it receives is logged with the connection it arrived on.

#![allow(dead_code)]

use async_trait::async_trait;
use esb_client::{
    encode_frame, BoxedStream, Connector, EsbClient, EsbConfig, FrameDecoder, Message,
    TYPE_LOGIN, TYPE_SEND, TYPE_SUBSCRIBE,
};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};
use std::io;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Client config with short backoff for tests
pub fn test_config() -> EsbConfig {
    EsbConfig::new("mock-bus")
        .reconnect_delay(Duration::from_millis(10), Duration::from_millis(50))
        .rpc_timeout(Duration::from_secs(2))
}

/// Poll `check` until it holds, failing the test after five seconds
pub async fn eventually<F: Fn() -> bool>(what: &str, check: F) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !check() {
        assert!(Instant::now() < deadline, "timed out waiting for {}", what);
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Hands the bus the server end of a fresh duplex pipe for every connect
pub struct PipeConnector {
    servers: mpsc::UnboundedSender<DuplexStream>,
    refusing: AtomicBool,
}

impl PipeConnector {
    /// Make subsequent connects fail until called again with `false`
    pub fn refuse(&self, refusing: bool) {
        self.refusing.store(refusing, Ordering::SeqCst);
    }
}

#[async_trait]
impl Connector for PipeConnector {
    async fn connect(&self) -> io::Result<BoxedStream> {
        if self.refusing.load(Ordering::SeqCst) {
            return Err(io::Error::new(io::ErrorKind::ConnectionRefused, "bus refused"));
        }
        let (client, server) = tokio::io::duplex(64 * 1024);
        self.servers
            .send(server)
            .map_err(|_| io::Error::new(io::ErrorKind::ConnectionRefused, "bus stopped"))?;
        Ok(Box::new(client))
    }
}

/// A frame received by the bus
#[derive(Debug, Clone)]
pub struct Frame {
    pub conn: usize,
    pub msg: Message,
}

struct Peer {
    tx: mpsc::UnboundedSender<String>,
    groups: HashSet<String>,
    task: JoinHandle<()>,
}

#[derive(Default)]
struct BusState {
    peers: Mutex<HashMap<usize, Peer>>,
    log: Mutex<Vec<Frame>>,
    denied: Mutex<HashSet<String>>,
    accepted: AtomicUsize,
}

impl BusState {
    fn handle(&self, conn: usize, msg: Message) {
        self.log.lock().push(Frame {
            conn,
            msg: msg.clone(),
        });

        match msg.kind() {
            Some(TYPE_LOGIN) => {
                self.answer(conn, &msg, "SUCCESS", json!({"channel": format!("chan-{}", conn)}));
            }
            Some(TYPE_SUBSCRIBE) => {
                let group = msg
                    .get("channel")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string();
                if self.denied.lock().contains(&group) {
                    self.answer(conn, &msg, "FAILURE", json!({}));
                    return;
                }
                if let Some(peer) = self.peers.lock().get_mut(&conn) {
                    peer.groups.insert(group);
                }
                self.answer(conn, &msg, "SUCCESS", json!({}));
            }
            Some(TYPE_SEND) => self.route(&msg),
            _ => {}
        }
    }

    fn answer(&self, conn: usize, request: &Message, result: &str, data: Value) {
        let mut meta = json!({
            "replyTo": request.id(),
            "inre": request.id(),
            "result": result,
        });
        if result == "FAILURE" {
            meta["reason"] = json!("denied");
        }
        let reply = Message::new(meta, data).unwrap();
        self.deliver(conn, encode_frame(&reply).unwrap());
    }

    fn deliver(&self, conn: usize, frame: String) {
        if let Some(peer) = self.peers.lock().get(&conn) {
            let _ = peer.tx.send(frame);
        }
    }

    fn route(&self, msg: &Message) {
        let groups = msg.groups();
        let frame = encode_frame(msg).unwrap();
        for peer in self.peers.lock().values() {
            if groups.iter().any(|g| peer.groups.contains(g)) {
                let _ = peer.tx.send(frame.clone());
            }
        }
    }
}

async fn serve(
    state: Arc<BusState>,
    conn: usize,
    stream: DuplexStream,
    mut rx: mpsc::UnboundedReceiver<String>,
) {
    let (mut reader, mut writer) = tokio::io::split(stream);
    let writer_task = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            if writer.write_all(frame.as_bytes()).await.is_err() {
                break;
            }
        }
    });

    let mut decoder = FrameDecoder::new();
    let mut buf = vec![0u8; 4096];
    loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => n,
        };
        for msg in decoder.decode(&buf[..n]).into_iter().flatten() {
            state.handle(conn, msg);
        }
    }

    writer_task.abort();
    state.peers.lock().remove(&conn);
}

/// In-memory bus
pub struct MockBus {
    state: Arc<BusState>,
    connector: Arc<PipeConnector>,
    acceptor: JoinHandle<()>,
}

impl MockBus {
    pub fn start() -> Self {
        let (servers_tx, mut servers_rx) = mpsc::unbounded_channel::<DuplexStream>();
        let state = Arc::new(BusState::default());

        let acceptor = {
            let state = state.clone();
            tokio::spawn(async move {
                while let Some(stream) = servers_rx.recv().await {
                    let conn = state.accepted.fetch_add(1, Ordering::SeqCst);
                    let (tx, rx) = mpsc::unbounded_channel();
                    // Registered before the connection task can look itself up
                    {
                        let mut peers = state.peers.lock();
                        let task = tokio::spawn(serve(state.clone(), conn, stream, rx));
                        peers.insert(
                            conn,
                            Peer {
                                tx,
                                groups: HashSet::new(),
                                task,
                            },
                        );
                    }
                }
            })
        };

        Self {
            state,
            connector: Arc::new(PipeConnector {
                servers: servers_tx,
                refusing: AtomicBool::new(false),
            }),
            acceptor,
        }
    }

    pub fn connector(&self) -> Arc<PipeConnector> {
        self.connector.clone()
    }

    pub fn client(&self, config: EsbConfig) -> EsbClient {
        EsbClient::with_connector(config, self.connector.clone())
    }

    /// Connected client already logged in as `name`
    pub async fn logged_in(&self, name: &str) -> EsbClient {
        let client = self.client(test_config());
        client.connect().await.unwrap();
        client.login(name).await.unwrap();
        client
    }

    pub fn frames(&self) -> Vec<Frame> {
        self.state.log.lock().clone()
    }

    pub fn frames_of(&self, kind: &str) -> Vec<Frame> {
        self.frames()
            .into_iter()
            .filter(|f| f.msg.kind() == Some(kind))
            .collect()
    }

    pub fn frames_on(&self, conn: usize) -> Vec<Frame> {
        self.frames().into_iter().filter(|f| f.conn == conn).collect()
    }

    /// Connections accepted since start, including closed ones
    pub fn accepted(&self) -> usize {
        self.state.accepted.load(Ordering::SeqCst)
    }

    pub fn live_connections(&self) -> usize {
        self.state.peers.lock().len()
    }

    /// Answer subscriptions to `group` with `FAILURE`
    pub fn deny(&self, group: &str) {
        self.state.denied.lock().insert(group.to_string());
    }

    /// Route `msg` as if a peer had sent it
    pub fn publish(&self, msg: &Message) {
        self.state.route(msg);
    }

    /// Write raw bytes to one connection
    pub fn inject_raw(&self, conn: usize, bytes: &str) {
        self.state.deliver(conn, bytes.to_string());
    }

    /// Sever every live connection from the bus side
    pub fn drop_connections(&self) {
        let peers: Vec<Peer> = self.state.peers.lock().drain().map(|(_, p)| p).collect();
        for peer in peers {
            peer.task.abort();
        }
    }
}

impl Drop for MockBus {
    fn drop(&mut self) {
        self.acceptor.abort();
        self.drop_connections();
    }
}
