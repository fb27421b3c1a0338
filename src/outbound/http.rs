//! HTTP proxy outbound
//!
//! Tunnels TCP through an upstream HTTP proxy with the CONNECT method,
//! optionally over TLS.

use super::{tls, OutboundProxy, ProxyConnection, ProxyType};
use crate::common::net::{configure_tcp_stream, join_host_port};
use crate::common::Metadata;
use crate::{Error, Result};
use async_trait::async_trait;
use base64::Engine;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::debug;

/// Upper bound on the CONNECT response head
const MAX_RESPONSE_HEAD: usize = 4096;

/// HTTP proxy outbound
pub struct HttpProxy {
    name: String,
    server: String,
    port: u16,
    username: Option<String>,
    password: Option<String>,
    tls: bool,
    skip_cert_verify: bool,
    connect_timeout: Duration,
}

impl HttpProxy {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        name: String,
        server: String,
        port: u16,
        username: Option<String>,
        password: Option<String>,
        tls: bool,
        skip_cert_verify: bool,
        connect_timeout: Duration,
    ) -> Self {
        HttpProxy {
            name,
            server,
            port,
            username,
            password,
            tls,
            skip_cert_verify,
            connect_timeout,
        }
    }

    /// Build the Proxy-Authorization header value
    fn auth_header(&self) -> Option<String> {
        match (&self.username, &self.password) {
            (Some(user), Some(pass)) => {
                let credentials = format!("{}:{}", user, pass);
                let encoded = base64::engine::general_purpose::STANDARD.encode(credentials);
                Some(format!("Basic {}", encoded))
            }
            _ => None,
        }
    }

    fn connect_request(&self, target: &str) -> String {
        let mut request = format!(
            "CONNECT {} HTTP/1.1\r\nHost: {}\r\nProxy-Connection: keep-alive\r\n",
            target, target
        );
        if let Some(auth) = self.auth_header() {
            request.push_str(&format!("Proxy-Authorization: {}\r\n", auth));
        }
        request.push_str("\r\n");
        request
    }

    async fn http_connect<S: AsyncRead + AsyncWrite + Unpin>(
        &self,
        stream: &mut S,
        target: &str,
    ) -> Result<()> {
        debug!("[{}] Sending CONNECT to {}", self.name, target);

        stream
            .write_all(self.connect_request(target).as_bytes())
            .await
            .map_err(|e| Error::connection(format!("Failed to send CONNECT request: {}", e)))?;
        stream.flush().await?;

        // Read byte by byte so nothing past the header is consumed
        let mut head = Vec::with_capacity(256);
        let mut byte = [0u8; 1];
        loop {
            let n = stream.read(&mut byte).await.map_err(|e| {
                Error::connection(format!("Failed to read CONNECT response: {}", e))
            })?;
            if n == 0 {
                return Err(Error::connection("Connection closed during CONNECT"));
            }
            head.push(byte[0]);

            if head.ends_with(b"\r\n\r\n") {
                break;
            }
            if head.len() >= MAX_RESPONSE_HEAD {
                return Err(Error::connection("CONNECT response too large"));
            }
        }

        let mut headers = [httparse::EMPTY_HEADER; 32];
        let mut response = httparse::Response::new(&mut headers);
        response
            .parse(&head)
            .map_err(|e| Error::protocol(format!("Malformed CONNECT response: {}", e)))?;

        match response.code {
            Some(200) => {
                debug!("[{}] CONNECT handshake successful", self.name);
                Ok(())
            }
            Some(407) => Err(Error::auth("Proxy authentication required")),
            Some(code) => Err(Error::connection(format!(
                "CONNECT failed: {} {}",
                code,
                response.reason.unwrap_or("")
            ))),
            None => Err(Error::protocol("CONNECT response without status")),
        }
    }
}

#[async_trait]
impl OutboundProxy for HttpProxy {
    fn name(&self) -> &str {
        &self.name
    }

    fn proxy_type(&self) -> ProxyType {
        ProxyType::Http
    }

    fn server(&self) -> &str {
        &self.server
    }

    fn support_udp(&self) -> bool {
        false
    }

    async fn dial_tcp(&self, metadata: &Metadata) -> Result<Box<dyn ProxyConnection>> {
        if !metadata.valid() {
            return Err(Error::connection("No destination address"));
        }
        let target = join_host_port(&metadata.destination(), metadata.dst_port);
        let server_addr = join_host_port(&self.server, self.port);

        debug!(
            "[{}] HTTP proxy connecting to {} via {}",
            self.name, target, server_addr
        );

        let mut stream = timeout(self.connect_timeout, TcpStream::connect(&server_addr))
            .await
            .map_err(|_| Error::timeout("HTTP proxy connection timeout"))?
            .map_err(|e| Error::connection(format!("Failed to connect to HTTP proxy: {}", e)))?;
        configure_tcp_stream(&stream);

        if self.tls {
            let mut tls_stream = tls::handshake(stream, &self.server, self.skip_cert_verify).await?;
            self.http_connect(&mut tls_stream, &target).await?;
            debug!("[{}] HTTP proxy connected to {} (TLS)", self.name, target);
            Ok(Box::new(HttpProxyConnection::Tls(Box::new(tls_stream))))
        } else {
            self.http_connect(&mut stream, &target).await?;
            debug!("[{}] HTTP proxy connected to {}", self.name, target);
            Ok(Box::new(HttpProxyConnection::Plain(stream)))
        }
    }
}

/// HTTP proxy connection wrapper
pub enum HttpProxyConnection {
    Plain(TcpStream),
    Tls(Box<tokio_rustls::client::TlsStream<TcpStream>>),
}

impl AsyncRead for HttpProxyConnection {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            HttpProxyConnection::Plain(stream) => Pin::new(stream).poll_read(cx, buf),
            HttpProxyConnection::Tls(stream) => Pin::new(stream.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for HttpProxyConnection {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            HttpProxyConnection::Plain(stream) => Pin::new(stream).poll_write(cx, buf),
            HttpProxyConnection::Tls(stream) => Pin::new(stream.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            HttpProxyConnection::Plain(stream) => Pin::new(stream).poll_flush(cx),
            HttpProxyConnection::Tls(stream) => Pin::new(stream.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            HttpProxyConnection::Plain(stream) => Pin::new(stream).poll_shutdown(cx),
            HttpProxyConnection::Tls(stream) => Pin::new(stream.as_mut()).poll_shutdown(cx),
        }
    }
}
