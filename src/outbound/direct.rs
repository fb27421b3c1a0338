//! Direct outbound (no proxy)

use super::{OutboundProxy, ProxyConnection, ProxyType};
use crate::common::net::configure_tcp_stream;
use crate::common::Metadata;
use crate::{Error, Result};
use async_trait::async_trait;
use tokio::net::TcpStream;
use tracing::debug;

/// Direct connection (no proxy)
pub struct Direct {
    name: String,
}

impl Direct {
    pub fn new() -> Self {
        Direct {
            name: "DIRECT".to_string(),
        }
    }

    pub fn with_name(name: String) -> Self {
        Direct { name }
    }
}

impl Default for Direct {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl OutboundProxy for Direct {
    fn name(&self) -> &str {
        &self.name
    }

    fn proxy_type(&self) -> ProxyType {
        ProxyType::Direct
    }

    fn server(&self) -> &str {
        "DIRECT"
    }

    fn support_udp(&self) -> bool {
        true
    }

    async fn dial_tcp(&self, metadata: &Metadata) -> Result<Box<dyn ProxyConnection>> {
        if !metadata.valid() {
            return Err(Error::connection(format!(
                "no destination to dial for {}",
                metadata
            )));
        }

        let addr = metadata.remote_address();
        debug!("Direct connecting to {}", addr);

        let stream = TcpStream::connect(&addr)
            .await
            .map_err(|e| Error::connection(format!("Failed to connect to {}: {}", addr, e)))?;
        configure_tcp_stream(&stream);

        Ok(Box::new(stream))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::ConnType;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    #[test]
    fn test_direct_creation() {
        let direct = Direct::new();
        assert_eq!(direct.name(), "DIRECT");
        assert_eq!(direct.proxy_type(), ProxyType::Direct);
    }

    #[tokio::test]
    async fn test_direct_dial() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            sock.write_all(b"hi").await.unwrap();
        });

        let meta = Metadata::tcp(ConnType::Inner)
            .with_dst_ip(addr.ip())
            .with_dst_port(addr.port());
        let mut conn = Direct::new().dial_tcp(&meta).await.unwrap();
        let mut buf = [0u8; 2];
        conn.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hi");
    }

    #[tokio::test]
    async fn test_direct_rejects_empty_destination() {
        let meta = Metadata::tcp(ConnType::Inner);
        assert!(Direct::new().dial_tcp(&meta).await.is_err());
    }
}
