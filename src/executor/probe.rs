//! Delay and throughput probes through an adapter

use crate::adapter::ProxyAdapter;
use crate::common::{ConnType, Metadata};
use crate::outbound::tls;
use crate::{Error, Result};
use bytes::Bytes;
use http_body_util::{BodyExt, Empty};
use hyper::body::Incoming;
use hyper::client::conn::http1;
use hyper::{Request, Response};
use hyper_util::rt::TokioIo;
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::time::timeout;
use tracing::trace;
use url::Url;

struct Target {
    host: String,
    port: u16,
    https: bool,
    path: String,
    authority: String,
}

impl Target {
    fn parse(raw: &str) -> Result<Self> {
        let url = Url::parse(raw)?;
        let https = match url.scheme() {
            "http" => false,
            "https" => true,
            other => {
                return Err(Error::config(format!("probe url scheme {} not supported", other)))
            }
        };
        let host = match url.host() {
            Some(url::Host::Ipv6(ip)) => ip.to_string(),
            Some(host) => host.to_string(),
            None => return Err(Error::config(format!("probe url {} has no host", raw))),
        };
        let port = url
            .port_or_known_default()
            .ok_or_else(|| Error::config(format!("probe url {} has no port", raw)))?;

        let mut path = url.path().to_string();
        if let Some(query) = url.query() {
            path.push('?');
            path.push_str(query);
        }
        let authority = match url.port() {
            Some(port) => format!("{}:{}", url.host_str().unwrap_or_default(), port),
            None => url.host_str().unwrap_or_default().to_string(),
        };

        Ok(Target {
            host,
            port,
            https,
            path,
            authority,
        })
    }

    fn metadata(&self) -> Metadata {
        Metadata::tcp(ConnType::Inner)
            .with_dst_port(self.port)
            .with_destination(&self.host)
    }
}

/// Send a GET through `adapter`, returning the response head
async fn get(adapter: &ProxyAdapter, target: &Target) -> Result<Response<Incoming>> {
    let conn = adapter.dial(&target.metadata()).await?;
    if target.https {
        let stream = tls::handshake(conn, &target.host, false).await?;
        send(stream, target).await
    } else {
        send(conn, target).await
    }
}

async fn send<S>(stream: S, target: &Target) -> Result<Response<Incoming>>
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let (mut sender, connection) = http1::handshake(TokioIo::new(stream))
        .await
        .map_err(|e| Error::connection(format!("HTTP handshake failed: {}", e)))?;

    tokio::spawn(async move {
        if let Err(e) = connection.await {
            trace!("probe connection ended: {}", e);
        }
    });

    let request = Request::get(target.path.as_str())
        .header(hyper::header::HOST, target.authority.as_str())
        .header(hyper::header::USER_AGENT, concat!("nico/", env!("CARGO_PKG_VERSION")))
        .body(Empty::<Bytes>::new())?;

    sender
        .send_request(request)
        .await
        .map_err(|e| Error::connection(format!("HTTP request failed: {}", e)))
}

/// Time from dial start until the response head arrives
pub async fn url_test(adapter: &ProxyAdapter, url: &str, limit: Duration) -> Result<Duration> {
    let target = Target::parse(url)?;
    let start = Instant::now();

    let response = timeout(limit, get(adapter, &target))
        .await
        .map_err(|_| Error::timeout(format!("url test {} timed out", url)))??;

    let elapsed = start.elapsed();
    trace!("[{}] {} answered {}", adapter.name(), url, response.status());
    Ok(elapsed)
}

/// Download up to `sample` body bytes, returning (bytes read, elapsed)
pub async fn download_sample(
    adapter: &ProxyAdapter,
    url: &str,
    sample: usize,
    limit: Duration,
) -> Result<(usize, Duration)> {
    let target = Target::parse(url)?;
    let start = Instant::now();

    let read = timeout(limit, async {
        let response = get(adapter, &target).await?;
        if !response.status().is_success() {
            return Err(Error::connection(format!(
                "speed test {} returned {}",
                url,
                response.status()
            )));
        }

        let mut body = response.into_body();
        let mut read = 0usize;
        while read < sample {
            match body.frame().await {
                Some(Ok(frame)) => {
                    if let Some(data) = frame.data_ref() {
                        read += data.len();
                    }
                }
                Some(Err(e)) => {
                    return Err(Error::connection(format!("speed test read failed: {}", e)))
                }
                None => break,
            }
        }
        Ok(read)
    })
    .await
    .map_err(|_| Error::timeout(format!("speed test {} timed out", url)))??;

    if read == 0 {
        return Err(Error::connection(format!("speed test {} returned no data", url)));
    }
    Ok((read, start.elapsed()))
}

/// Bytes per second, scaled with the coarsest unit the elapsed time allows
pub fn bytes_per_second(bytes: usize, elapsed: Duration) -> f64 {
    let bytes = bytes as f64;
    if elapsed.is_zero() {
        return 0.0;
    }

    if elapsed < Duration::from_micros(1) {
        bytes * 1_000_000_000.0 / elapsed.as_nanos() as f64
    } else if elapsed < Duration::from_millis(1) {
        bytes * 1_000_000.0 / elapsed.as_micros() as f64
    } else if elapsed < Duration::from_secs(1) {
        bytes * 1_000.0 / elapsed.as_millis() as f64
    } else {
        bytes / elapsed.as_secs_f64()
    }
}

/// Human readable bit rate for a bytes-per-second figure
pub fn format_speed(speed: f64) -> String {
    const K: f64 = 1024.0;

    if speed == 0.0 {
        "0bps".to_string()
    } else if speed < K {
        format!("{:.2}bps", speed * 8.0)
    } else if speed < K * 128.0 {
        format!("{:.2}Kbps", speed / 128.0)
    } else if speed < K * K * 128.0 {
        format!("{:.2}Mbps", speed / (128.0 * K))
    } else if speed < K * K * K * 128.0 {
        format!("{:.2}Gbps", speed / (128.0 * K * K))
    } else {
        format!("{:.2}Tbps", speed / (128.0 * K * K * K))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_target_parse() {
        let target = Target::parse("http://www.gstatic.com/generate_204").unwrap();
        assert_eq!(target.host, "www.gstatic.com");
        assert_eq!(target.port, 80);
        assert!(!target.https);
        assert_eq!(target.path, "/generate_204");
        assert_eq!(target.authority, "www.gstatic.com");

        let target = Target::parse("https://[::1]:8443/a?b=c").unwrap();
        assert_eq!(target.host, "::1");
        assert_eq!(target.port, 8443);
        assert!(target.https);
        assert_eq!(target.path, "/a?b=c");
        assert_eq!(target.authority, "[::1]:8443");

        assert!(Target::parse("ftp://example.com/").is_err());
    }

    #[test]
    fn test_bytes_per_second_ladder() {
        assert_eq!(bytes_per_second(1024, Duration::from_secs(2)), 512.0);
        assert_eq!(bytes_per_second(1000, Duration::from_millis(500)), 2000.0);
        assert_eq!(bytes_per_second(10, Duration::from_micros(10)), 1_000_000.0);
        assert_eq!(bytes_per_second(1, Duration::from_nanos(500)), 2_000_000.0);
        assert_eq!(bytes_per_second(1, Duration::ZERO), 0.0);
    }

    #[test]
    fn test_format_speed() {
        assert_eq!(format_speed(0.0), "0bps");
        assert_eq!(format_speed(100.0), "800.00bps");
        assert_eq!(format_speed(2048.0), "16.00Kbps");
        assert_eq!(format_speed(1024.0 * 1024.0), "8.00Mbps");
        assert_eq!(format_speed(1024.0 * 1024.0 * 1024.0), "8.00Gbps");
        assert_eq!(format_speed(1024.0 * 1024.0 * 1024.0 * 1024.0), "8.00Tbps");
    }
}
