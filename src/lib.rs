//! ESB Rust Client
//!
//! A client runtime for a pub/sub and RPC message bus speaking
//! newline-delimited JSON over a byte stream. Provides login, group
//! subscriptions, request/reply correlation, listener dispatch and automatic
//! reconnection with session replay.
//!
//! # Example
//!
//! ```no_run
//! use esb_client::{EsbClient, EsbConfig, EventKey};
//! use serde_json::json;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let client = EsbClient::new(EsbConfig::new("localhost:8900"));
//!     client.connect().await?;
//!     client.login("billing").await?;
//!
//!     // Listen to a group
//!     client.subscribe("invoices").await?;
//!     client.on(EventKey::group("invoices"), |msg| {
//!         println!("invoice: {}", msg.data());
//!     });
//!
//!     // Serve requests
//!     client
//!         .rpc_receive("totals", |req| async move {
//!             let n = req.get("n").and_then(|v| v.as_i64()).unwrap_or(0);
//!             Ok::<_, anyhow::Error>(json!({ "total": n * 2 }))
//!         })
//!         .await?;
//!
//!     // Call someone else
//!     let reply = client.rpc_send("pricing", &json!({"sku": "A-1"}), None).await?;
//!     println!("price: {}", reply.data());
//!
//!     client.close().await?;
//!     Ok(())
//! }
//! ```

mod client;
mod codec;
mod config;
mod correlation;
mod dispatch;
mod error;
mod message;
mod reconnect;
mod session;
mod transport;

pub use client::EsbClient;
pub use codec::{decode_frame, encode_frame, FrameDecoder, DEFAULT_MAX_FRAME, DELIMITER};
pub use config::EsbConfig;
pub use correlation::{Expectation, PendingReplies, ReplyCallback};
pub use dispatch::{Dispatcher, EventKey, Listener, ListenerId};
pub use error::{EsbError, Result};
pub use message::{
    Fragment, Message, Meta, META_CC_GROUP, META_FROM, META_GROUP, META_ID, META_INRE,
    META_REASON, META_REPLY_TO, META_RESULT, META_SESSION, META_TYPE, RESULT_FAILURE,
    RESULT_GROUP_SUFFIX, RESULT_SUCCESS, TYPE_LOGIN, TYPE_SUBSCRIBE, TYPE_SEND,
};
pub use session::{ClientEvent, SessionSnapshot, SessionState};
pub use transport::{BoxedStream, ByteStream, Connector, TcpConnector};
