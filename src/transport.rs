//! Byte stream collaborator
//!
//! The client never opens sockets itself; it asks a [`Connector`] for a
//! fresh reliable, ordered, bidirectional stream whenever it needs one.
//! [`TcpConnector`] is the production implementation; tests hand out
//! in-memory `tokio::io::duplex` pipes instead.

use async_trait::async_trait;
use std::io;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tracing::debug;

/// A connected byte stream
pub trait ByteStream: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

impl<T> ByteStream for T where T: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

/// Boxed stream handed to the connection supervisor
pub type BoxedStream = Box<dyn ByteStream>;

/// Source of connected streams
///
/// Called once at start-up and again after every unexpected disconnect.
/// Errors are reported as transport faults and retried with backoff.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    async fn connect(&self) -> io::Result<BoxedStream>;
}

/// Connects to the bus over TCP
#[derive(Debug, Clone)]
pub struct TcpConnector {
    addr: String,
}

impl TcpConnector {
    pub fn new(addr: impl Into<String>) -> Self {
        Self { addr: addr.into() }
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }
}

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(&self) -> io::Result<BoxedStream> {
        debug!(addr = %self.addr, "Opening TCP connection");
        let stream = TcpStream::connect(&self.addr).await?;
        stream.set_nodelay(true)?;
        Ok(Box::new(stream))
    }
}
