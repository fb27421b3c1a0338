//! SOCKS5 proxy outbound
//!
//! Implements the client side of RFC 1928 CONNECT with optional RFC 1929
//! username/password authentication.

use super::{OutboundProxy, ProxyConnection, ProxyType};
use crate::common::net::{configure_tcp_stream, join_host_port, Address};
use crate::common::Metadata;
use crate::{Error, Result};
use async_trait::async_trait;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::debug;

const SOCKS5_VERSION: u8 = 0x05;

const AUTH_NONE: u8 = 0x00;
const AUTH_PASSWORD: u8 = 0x02;
const AUTH_NO_ACCEPTABLE: u8 = 0xFF;

const CMD_CONNECT: u8 = 0x01;

const REP_SUCCESS: u8 = 0x00;
const REP_GENERAL_FAILURE: u8 = 0x01;
const REP_CONNECTION_NOT_ALLOWED: u8 = 0x02;
const REP_NETWORK_UNREACHABLE: u8 = 0x03;
const REP_HOST_UNREACHABLE: u8 = 0x04;
const REP_CONNECTION_REFUSED: u8 = 0x05;
const REP_TTL_EXPIRED: u8 = 0x06;
const REP_COMMAND_NOT_SUPPORTED: u8 = 0x07;
const REP_ADDRESS_TYPE_NOT_SUPPORTED: u8 = 0x08;

/// SOCKS5 proxy outbound
pub struct Socks5Proxy {
    name: String,
    server: String,
    port: u16,
    username: Option<String>,
    password: Option<String>,
    udp: bool,
    connect_timeout: Duration,
}

impl Socks5Proxy {
    pub fn new(
        name: String,
        server: String,
        port: u16,
        username: Option<String>,
        password: Option<String>,
        udp: bool,
        connect_timeout: Duration,
    ) -> Self {
        Socks5Proxy {
            name,
            server,
            port,
            username,
            password,
            udp,
            connect_timeout,
        }
    }

    async fn socks5_connect<S: AsyncRead + AsyncWrite + Unpin>(
        &self,
        stream: &mut S,
        target: &Address,
        port: u16,
    ) -> Result<()> {
        let greeting: &[u8] = if self.username.is_some() && self.password.is_some() {
            &[SOCKS5_VERSION, 2, AUTH_NONE, AUTH_PASSWORD]
        } else {
            &[SOCKS5_VERSION, 1, AUTH_NONE]
        };
        stream
            .write_all(greeting)
            .await
            .map_err(|e| Error::connection(format!("Failed to send SOCKS5 greeting: {}", e)))?;

        let mut response = [0u8; 2];
        stream
            .read_exact(&mut response)
            .await
            .map_err(|e| Error::connection(format!("Failed to read SOCKS5 response: {}", e)))?;

        if response[0] != SOCKS5_VERSION {
            return Err(Error::protocol("Invalid SOCKS5 version"));
        }

        match response[1] {
            AUTH_NONE => {}
            AUTH_PASSWORD => self.authenticate_password(stream).await?,
            AUTH_NO_ACCEPTABLE => {
                return Err(Error::auth("No acceptable authentication method"));
            }
            other => {
                return Err(Error::protocol(format!(
                    "Unsupported authentication method: {}",
                    other
                )));
            }
        }

        let mut request = vec![SOCKS5_VERSION, CMD_CONNECT, 0x00];
        request.extend_from_slice(&target.encode(port)?);
        stream.write_all(&request).await.map_err(|e| {
            Error::connection(format!("Failed to send SOCKS5 connect request: {}", e))
        })?;

        let mut reply = [0u8; 3];
        stream
            .read_exact(&mut reply)
            .await
            .map_err(|e| Error::connection(format!("Failed to read SOCKS5 reply: {}", e)))?;

        if reply[0] != SOCKS5_VERSION {
            return Err(Error::protocol("Invalid SOCKS5 version in reply"));
        }
        if reply[1] != REP_SUCCESS {
            return Err(Error::connection(reply_error_message(reply[1])));
        }

        // Bound address is not used
        let _ = Address::read_from(stream).await?;

        debug!("[{}] SOCKS5 connected to {:?}:{}", self.name, target, port);
        Ok(())
    }

    async fn authenticate_password<S: AsyncRead + AsyncWrite + Unpin>(
        &self,
        stream: &mut S,
    ) -> Result<()> {
        let username = self
            .username
            .as_ref()
            .ok_or_else(|| Error::auth("Username required for authentication"))?;
        let password = self
            .password
            .as_ref()
            .ok_or_else(|| Error::auth("Password required for authentication"))?;

        if username.len() > 255 || password.len() > 255 {
            return Err(Error::auth("Username or password too long"));
        }

        let mut auth_request = vec![0x01];
        auth_request.push(username.len() as u8);
        auth_request.extend_from_slice(username.as_bytes());
        auth_request.push(password.len() as u8);
        auth_request.extend_from_slice(password.as_bytes());
        stream.write_all(&auth_request).await?;

        let mut response = [0u8; 2];
        stream.read_exact(&mut response).await?;
        if response[1] != 0x00 {
            return Err(Error::auth("Authentication failed"));
        }

        debug!("[{}] Password authentication successful", self.name);
        Ok(())
    }
}

fn reply_error_message(code: u8) -> String {
    match code {
        REP_GENERAL_FAILURE => "General SOCKS server failure".to_string(),
        REP_CONNECTION_NOT_ALLOWED => "Connection not allowed by ruleset".to_string(),
        REP_NETWORK_UNREACHABLE => "Network unreachable".to_string(),
        REP_HOST_UNREACHABLE => "Host unreachable".to_string(),
        REP_CONNECTION_REFUSED => "Connection refused".to_string(),
        REP_TTL_EXPIRED => "TTL expired".to_string(),
        REP_COMMAND_NOT_SUPPORTED => "Command not supported".to_string(),
        REP_ADDRESS_TYPE_NOT_SUPPORTED => "Address type not supported".to_string(),
        _ => format!("Unknown error: {}", code),
    }
}

#[async_trait]
impl OutboundProxy for Socks5Proxy {
    fn name(&self) -> &str {
        &self.name
    }

    fn proxy_type(&self) -> ProxyType {
        ProxyType::Socks5
    }

    fn server(&self) -> &str {
        &self.server
    }

    fn support_udp(&self) -> bool {
        self.udp
    }

    async fn dial_tcp(&self, metadata: &Metadata) -> Result<Box<dyn ProxyConnection>> {
        if !metadata.valid() {
            return Err(Error::connection("No destination address"));
        }
        let target = match metadata.dst_ip {
            Some(ip) if metadata.host.is_empty() => Address::from(ip),
            _ => Address::Domain(metadata.host.clone()),
        };
        let server_addr = join_host_port(&self.server, self.port);

        debug!(
            "[{}] SOCKS5 proxy connecting to {} via {}",
            self.name,
            metadata.remote_address(),
            server_addr
        );

        let mut stream = timeout(self.connect_timeout, TcpStream::connect(&server_addr))
            .await
            .map_err(|_| Error::timeout("SOCKS5 connection timeout"))?
            .map_err(|e| Error::connection(format!("Failed to connect to SOCKS5 server: {}", e)))?;
        configure_tcp_stream(&stream);

        self.socks5_connect(&mut stream, &target, metadata.dst_port)
            .await?;

        Ok(Box::new(stream))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::ConnType;
    use tokio::net::TcpListener;

    #[test]
    fn test_reply_error_messages() {
        assert_eq!(
            reply_error_message(REP_CONNECTION_REFUSED),
            "Connection refused"
        );
        assert_eq!(reply_error_message(0x42), "Unknown error: 66");
    }

    #[tokio::test]
    async fn test_connect_with_password() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();

            let mut greeting = [0u8; 4];
            sock.read_exact(&mut greeting).await.unwrap();
            assert_eq!(greeting, [5, 2, AUTH_NONE, AUTH_PASSWORD]);
            sock.write_all(&[5, AUTH_PASSWORD]).await.unwrap();

            let mut auth = [0u8; 1 + 1 + 4 + 1 + 4];
            sock.read_exact(&mut auth).await.unwrap();
            assert_eq!(&auth[2..6], b"user");
            sock.write_all(&[1, 0]).await.unwrap();

            let mut head = [0u8; 3];
            sock.read_exact(&mut head).await.unwrap();
            let (addr, port) = Address::read_from(&mut sock).await.unwrap();
            assert_eq!(addr, Address::Domain("example.com".into()));
            assert_eq!(port, 443);

            sock.write_all(&[5, 0, 0, 1, 0, 0, 0, 0, 0, 0]).await.unwrap();
            sock.write_all(b"ok").await.unwrap();
        });

        let proxy = Socks5Proxy::new(
            "s".into(),
            "127.0.0.1".into(),
            port,
            Some("user".into()),
            Some("pass".into()),
            false,
            Duration::from_secs(2),
        );
        let meta = Metadata::tcp(ConnType::Inner)
            .with_host("example.com")
            .with_dst_port(443);
        let mut conn = proxy.dial_tcp(&meta).await.unwrap();
        let mut buf = [0u8; 2];
        conn.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ok");
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_connect_refused_reply() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let mut greeting = [0u8; 3];
            sock.read_exact(&mut greeting).await.unwrap();
            sock.write_all(&[5, AUTH_NONE]).await.unwrap();
            let mut req = [0u8; 10];
            sock.read_exact(&mut req).await.unwrap();
            sock.write_all(&[5, REP_CONNECTION_REFUSED, 0, 1, 0, 0, 0, 0, 0, 0])
                .await
                .unwrap();
        });

        let proxy = Socks5Proxy::new(
            "s".into(),
            "127.0.0.1".into(),
            port,
            None,
            None,
            false,
            Duration::from_secs(2),
        );
        let meta = Metadata::tcp(ConnType::Inner)
            .with_dst_ip("10.0.0.1".parse().unwrap())
            .with_dst_port(80);
        let result = proxy.dial_tcp(&meta).await;
        assert!(matches!(result, Err(Error::Connection(m)) if m == "Connection refused"));
    }
}
