//! Mixed port inbound (HTTP + SOCKS5 auto-detection)

use super::http::{self as http_proxy, MAX_HEAD_BYTES};
use super::socks5::{self, SOCKS5_VERSION};
use super::{ConnContext, Credentials, InboundListener};
use crate::common::net::{configure_tcp_stream, Address};
use crate::common::{ConnType, Metadata};
use crate::{Error, Result};
use async_trait::async_trait;
use bytes::BytesMut;
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader, ReadBuf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Notify};
use tracing::{debug, error, info};

struct HandshakeStream {
    reader: BufReader<TcpStream>,
}

impl HandshakeStream {
    fn new(stream: TcpStream) -> Self {
        Self {
            reader: BufReader::with_capacity(8 * 1024, stream),
        }
    }

    async fn peek_u8(&mut self) -> Result<u8> {
        let buf = self.reader.fill_buf().await?;
        buf.first()
            .copied()
            .ok_or_else(|| Error::protocol("Unexpected EOF"))
    }

    /// Hand over the socket; `replay` and any buffered bytes are read first
    fn into_prefixed(self, mut replay: Vec<u8>) -> PrefixedStream {
        replay.extend_from_slice(self.reader.buffer());
        PrefixedStream {
            inner: self.reader.into_inner(),
            prefix: replay,
            pos: 0,
        }
    }
}

impl AsyncRead for HandshakeStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.reader).poll_read(cx, buf)
    }
}

impl AsyncWrite for HandshakeStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        data: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        Pin::new(self.reader.get_mut()).poll_write(cx, data)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(self.reader.get_mut()).poll_flush(cx)
    }

    fn poll_shutdown(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<std::io::Result<()>> {
        Pin::new(self.reader.get_mut()).poll_shutdown(cx)
    }
}

/// Socket with bytes already consumed during the handshake replayed first
struct PrefixedStream {
    inner: TcpStream,
    prefix: Vec<u8>,
    pos: usize,
}

impl AsyncRead for PrefixedStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        if self.pos < self.prefix.len() {
            let remaining = &self.prefix[self.pos..];
            let to_copy = remaining.len().min(buf.remaining());
            buf.put_slice(&remaining[..to_copy]);
            self.pos += to_copy;
            return Poll::Ready(Ok(()));
        }

        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl AsyncWrite for PrefixedStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        data: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, data)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

/// Mixed port listener (auto-detects HTTP or SOCKS5)
pub struct MixedListener {
    listener: Mutex<Option<TcpListener>>,
    local_addr: SocketAddr,
    users: Arc<Vec<Credentials>>,
    conn_tx: mpsc::Sender<ConnContext>,
    running: AtomicBool,
    stop: Notify,
}

impl MixedListener {
    /// Bind now; connections are accepted once [`InboundListener::start`] runs
    pub async fn bind(
        addr: &str,
        users: Vec<Credentials>,
        conn_tx: mpsc::Sender<ConnContext>,
    ) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| Error::config(format!("Failed to bind mixed port {}: {}", addr, e)))?;
        let local_addr = listener.local_addr()?;

        Ok(MixedListener {
            listener: Mutex::new(Some(listener)),
            local_addr,
            users: Arc::new(users),
            conn_tx,
            running: AtomicBool::new(false),
            stop: Notify::new(),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    async fn handle_connection(
        stream: TcpStream,
        peer_addr: SocketAddr,
        users: Arc<Vec<Credentials>>,
        conn_tx: mpsc::Sender<ConnContext>,
    ) {
        match Self::process_connection(stream, peer_addr, &users).await {
            Ok(ctx) => {
                if conn_tx.send(ctx).await.is_err() {
                    debug!("Connection from {} dropped: executor gone", peer_addr);
                }
            }
            Err(e) => debug!("Mixed connection error from {}: {}", peer_addr, e),
        }
    }

    async fn process_connection(
        stream: TcpStream,
        peer_addr: SocketAddr,
        users: &[Credentials],
    ) -> Result<ConnContext> {
        configure_tcp_stream(&stream);
        let mut stream = HandshakeStream::new(stream);

        if stream.peek_u8().await? == SOCKS5_VERSION {
            debug!("Mixed port: detected SOCKS5 from {}", peer_addr);
            Self::handle_socks5(stream, peer_addr, users).await
        } else {
            debug!("Mixed port: detected HTTP from {}", peer_addr);
            Self::handle_http(stream, peer_addr, users).await
        }
    }

    async fn handle_socks5(
        mut stream: HandshakeStream,
        peer_addr: SocketAddr,
        users: &[Credentials],
    ) -> Result<ConnContext> {
        let (address, port) = socks5::handshake(&mut stream, users).await?;
        socks5::reply_success(&mut stream).await?;

        let metadata = Metadata::tcp(ConnType::Socks5)
            .with_source(peer_addr)
            .with_dst_port(port);
        let metadata = match address {
            Address::Domain(domain) => metadata.with_host(domain),
            ip => match ip.to_ip() {
                Some(ip) => metadata.with_dst_ip(ip),
                None => metadata,
            },
        };

        Ok(ConnContext::new(
            metadata,
            Box::new(stream.into_prefixed(Vec::new())),
        ))
    }

    async fn handle_http(
        mut stream: HandshakeStream,
        peer_addr: SocketAddr,
        users: &[Credentials],
    ) -> Result<ConnContext> {
        let mut buf = BytesMut::with_capacity(4 * 1024);
        let head_len = loop {
            if let Some(end) = http_proxy::head_end(&buf) {
                break end;
            }
            if buf.len() >= MAX_HEAD_BYTES {
                stream.write_all(http_proxy::RESPONSE_BAD_REQUEST).await?;
                return Err(Error::protocol("HTTP header too large"));
            }
            if stream.read_buf(&mut buf).await? == 0 {
                return Err(Error::protocol("Unexpected EOF"));
            }
        };

        let request = match http_proxy::parse_request(&buf[..head_len], users) {
            Ok(request) => request,
            Err(e @ Error::Auth(_)) => {
                stream.write_all(http_proxy::RESPONSE_AUTH_REQUIRED).await?;
                return Err(e);
            }
            Err(e) => {
                stream.write_all(http_proxy::RESPONSE_BAD_REQUEST).await?;
                return Err(e);
            }
        };

        let body = buf.split_off(head_len);
        let (conn_type, replay) = match request.forward_head {
            None => {
                stream.write_all(http_proxy::RESPONSE_ESTABLISHED).await?;
                stream.flush().await?;
                (ConnType::HttpConnect, body.to_vec())
            }
            Some(mut head) => {
                head.extend_from_slice(&body);
                (ConnType::Http, head)
            }
        };

        let metadata = Metadata::tcp(conn_type)
            .with_source(peer_addr)
            .with_dst_port(request.port)
            .with_destination(&request.host);

        Ok(ConnContext::new(
            metadata,
            Box::new(stream.into_prefixed(replay)),
        ))
    }
}

#[async_trait]
impl InboundListener for MixedListener {
    fn name(&self) -> &str {
        "Mixed"
    }

    async fn start(&self) -> Result<()> {
        let listener = self
            .listener
            .lock()
            .take()
            .ok_or_else(|| Error::internal("mixed listener already started"))?;
        info!("Mixed proxy listening on {}", self.local_addr);

        self.running.store(true, Ordering::SeqCst);

        while self.running.load(Ordering::SeqCst) {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer_addr)) => {
                        let users = self.users.clone();
                        let conn_tx = self.conn_tx.clone();
                        tokio::spawn(async move {
                            Self::handle_connection(stream, peer_addr, users, conn_tx).await;
                        });
                    }
                    Err(e) => error!("Mixed accept error: {}", e),
                },
                _ = self.stop.notified() => break,
            }
        }

        self.running.store(false, Ordering::SeqCst);
        info!("Mixed proxy on {} stopped", self.local_addr);
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        self.running.store(false, Ordering::SeqCst);
        self.stop.notify_one();
        Ok(())
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    async fn listener(users: Vec<Credentials>) -> (Arc<MixedListener>, mpsc::Receiver<ConnContext>) {
        let (tx, rx) = mpsc::channel(10);
        let listener = Arc::new(MixedListener::bind("127.0.0.1:0", users, tx).await.unwrap());
        let runner = listener.clone();
        tokio::spawn(async move { runner.start().await });
        (listener, rx)
    }

    #[tokio::test]
    async fn test_http_connect_emits_context() {
        let (listener, mut rx) = listener(Vec::new()).await;
        let mut client = TcpStream::connect(listener.local_addr()).await.unwrap();
        client
            .write_all(b"CONNECT example.com:443 HTTP/1.1\r\nHost: example.com:443\r\n\r\nhello")
            .await
            .unwrap();

        let mut reply = vec![0u8; http_proxy::RESPONSE_ESTABLISHED.len()];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply, http_proxy::RESPONSE_ESTABLISHED);

        let mut ctx = rx.recv().await.unwrap();
        assert_eq!(ctx.metadata.conn_type, ConnType::HttpConnect);
        assert_eq!(ctx.metadata.host, "example.com");
        assert_eq!(ctx.metadata.dst_port, 443);

        let mut early = [0u8; 5];
        ctx.stream.read_exact(&mut early).await.unwrap();
        assert_eq!(&early, b"hello");
    }

    #[tokio::test]
    async fn test_http_forward_replays_rewritten_head() {
        let (listener, mut rx) = listener(Vec::new()).await;
        let mut client = TcpStream::connect(listener.local_addr()).await.unwrap();
        client
            .write_all(b"GET http://10.0.0.1:8080/x HTTP/1.1\r\nHost: 10.0.0.1:8080\r\nProxy-Connection: keep-alive\r\n\r\n")
            .await
            .unwrap();

        let mut ctx = rx.recv().await.unwrap();
        assert_eq!(ctx.metadata.conn_type, ConnType::Http);
        assert_eq!(ctx.metadata.dst_ip, Some("10.0.0.1".parse().unwrap()));
        assert_eq!(ctx.metadata.dst_port, 8080);

        let expected = b"GET /x HTTP/1.1\r\nHost: 10.0.0.1:8080\r\nConnection: close\r\n\r\n";
        let mut head = vec![0u8; expected.len()];
        ctx.stream.read_exact(&mut head).await.unwrap();
        assert_eq!(head, expected);
    }

    #[tokio::test]
    async fn test_socks5_connect_emits_context() {
        let (listener, mut rx) = listener(Vec::new()).await;
        let mut client = TcpStream::connect(listener.local_addr()).await.unwrap();

        client.write_all(&[5, 1, 0]).await.unwrap();
        let mut choice = [0u8; 2];
        client.read_exact(&mut choice).await.unwrap();
        assert_eq!(choice, [5, 0]);

        client
            .write_all(&[5, 1, 0, 1, 1, 1, 1, 1, 0, 53])
            .await
            .unwrap();
        let mut reply = [0u8; 10];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply[1], 0);

        let ctx = rx.recv().await.unwrap();
        assert_eq!(ctx.metadata.conn_type, ConnType::Socks5);
        assert_eq!(ctx.metadata.dst_ip, Some("1.1.1.1".parse().unwrap()));
        assert_eq!(ctx.metadata.dst_port, 53);
        assert!(ctx.metadata.host.is_empty());
    }

    #[tokio::test]
    async fn test_http_auth_required() {
        let (listener, mut rx) = listener(vec![Credentials::new("u", "p")]).await;
        let mut client = TcpStream::connect(listener.local_addr()).await.unwrap();
        client
            .write_all(b"CONNECT example.com:443 HTTP/1.1\r\n\r\n")
            .await
            .unwrap();

        let mut reply = Vec::new();
        client.read_to_end(&mut reply).await.unwrap();
        assert!(reply.starts_with(b"HTTP/1.1 407"));
        assert!(tokio::time::timeout(Duration::from_millis(50), rx.recv())
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_stop() {
        let (listener, _rx) = listener(Vec::new()).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(listener.is_running());
        listener.stop().await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!listener.is_running());
    }
}
