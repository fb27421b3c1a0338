//! SOCKS5 server handshake (RFC 1928 CONNECT, RFC 1929 auth)

use super::Credentials;
use crate::common::net::Address;
use crate::{Error, Result};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

pub const SOCKS5_VERSION: u8 = 0x05;

const AUTH_NO_AUTH: u8 = 0x00;
const AUTH_USERNAME_PASSWORD: u8 = 0x02;
const AUTH_NO_ACCEPTABLE: u8 = 0xFF;

const CMD_CONNECT: u8 = 0x01;

const REP_SUCCESS: u8 = 0x00;
const REP_COMMAND_NOT_SUPPORTED: u8 = 0x07;

/// Negotiate, authenticate and read a CONNECT request.
///
/// Returns the requested destination. The success reply is not written;
/// call [`reply_success`] once the connection is accepted.
pub async fn handshake<S>(stream: &mut S, users: &[Credentials]) -> Result<(Address, u16)>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let version = stream.read_u8().await?;
    if version != SOCKS5_VERSION {
        return Err(Error::protocol(format!("Invalid SOCKS version: {}", version)));
    }
    let count = stream.read_u8().await? as usize;
    let mut methods = vec![0u8; count];
    stream.read_exact(&mut methods).await?;

    let wanted = if users.is_empty() {
        AUTH_NO_AUTH
    } else {
        AUTH_USERNAME_PASSWORD
    };
    if !methods.contains(&wanted) {
        stream
            .write_all(&[SOCKS5_VERSION, AUTH_NO_ACCEPTABLE])
            .await?;
        return Err(Error::auth("No acceptable authentication method"));
    }
    stream.write_all(&[SOCKS5_VERSION, wanted]).await?;

    if wanted == AUTH_USERNAME_PASSWORD {
        authenticate(stream, users).await?;
    }

    let mut head = [0u8; 3];
    stream.read_exact(&mut head).await?;
    if head[0] != SOCKS5_VERSION {
        return Err(Error::protocol("Invalid SOCKS5 request version"));
    }
    let (address, port) = Address::read_from(stream).await?;

    if head[1] != CMD_CONNECT {
        write_reply(stream, REP_COMMAND_NOT_SUPPORTED).await?;
        return Err(Error::unsupported(format!(
            "SOCKS5 command {} not supported",
            head[1]
        )));
    }

    Ok((address, port))
}

async fn authenticate<S>(stream: &mut S, users: &[Credentials]) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let _version = stream.read_u8().await?;
    let username = read_field(stream).await?;
    let password = read_field(stream).await?;

    let accepted = users
        .iter()
        .any(|c| c.username == username && c.password == password);
    stream
        .write_all(&[0x01, if accepted { 0x00 } else { 0x01 }])
        .await?;

    if accepted {
        Ok(())
    } else {
        Err(Error::auth("Invalid credentials"))
    }
}

async fn read_field<S: AsyncRead + Unpin>(stream: &mut S) -> Result<String> {
    let len = stream.read_u8().await? as usize;
    let mut buf = vec![0u8; len];
    stream.read_exact(&mut buf).await?;
    String::from_utf8(buf).map_err(|_| Error::auth("Credentials are not UTF-8"))
}

pub async fn reply_success<S: AsyncWrite + Unpin>(stream: &mut S) -> Result<()> {
    write_reply(stream, REP_SUCCESS).await
}

async fn write_reply<S: AsyncWrite + Unpin>(stream: &mut S, code: u8) -> Result<()> {
    // Bound address is always reported as 0.0.0.0:0
    stream
        .write_all(&[SOCKS5_VERSION, code, 0x00, 0x01, 0, 0, 0, 0, 0, 0])
        .await?;
    stream.flush().await?;
    Ok(())
}
