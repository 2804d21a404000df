use tokio::net::TcpStream;
use tracing::trace;

use super::{BoxFuture, BoxedStream, Connector};
use crate::error::Result;

/// Connects over TCP to `host:port`.
#[derive(Debug, Clone)]
pub struct TcpConnector {
    addr: String,
    nodelay: bool,
}

impl TcpConnector {
    pub fn new(addr: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            nodelay: true,
        }
    }

    /// Toggle `TCP_NODELAY` (on by default).
    pub fn nodelay(mut self, nodelay: bool) -> Self {
        self.nodelay = nodelay;
        self
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }
}

impl Connector for TcpConnector {
    fn connect(&self) -> BoxFuture<'_, Result<BoxedStream>> {
        Box::pin(async move {
            let stream = TcpStream::connect(&self.addr).await?;
            stream.set_nodelay(self.nodelay)?;
            trace!(addr = %self.addr, "TCP stream opened");
            Ok(Box::new(stream) as BoxedStream)
        })
    }

    fn peer(&self) -> String {
        self.addr.clone()
    }
}
