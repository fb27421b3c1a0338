//! Reject outbound (block connections)

use super::{OutboundProxy, ProxyConnection, ProxyType};
use crate::common::Metadata;
use crate::Result;
use async_trait::async_trait;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tracing::debug;

/// Blocks the connection: the returned stream reads EOF and swallows writes
pub struct Reject {
    name: String,
}

impl Reject {
    pub fn new() -> Self {
        Reject {
            name: "REJECT".to_string(),
        }
    }

    pub fn with_name(name: String) -> Self {
        Reject { name }
    }
}

impl Default for Reject {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl OutboundProxy for Reject {
    fn name(&self) -> &str {
        &self.name
    }

    fn proxy_type(&self) -> ProxyType {
        ProxyType::Reject
    }

    fn server(&self) -> &str {
        "REJECT"
    }

    fn support_udp(&self) -> bool {
        true
    }

    async fn dial_tcp(&self, metadata: &Metadata) -> Result<Box<dyn ProxyConnection>> {
        debug!("{} connection to {}", self.name, metadata.remote_address());
        Ok(Box::new(RejectConn))
    }
}

struct RejectConn;

impl AsyncRead for RejectConn {
    fn poll_read(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        _buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

impl AsyncWrite for RejectConn {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}
