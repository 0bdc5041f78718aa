//! Connection dispatcher (§4.1): accepts one TCP connection, classifies it as
//! TLS or plaintext HTTP by peeking its first byte, recovers the original
//! destination, and hands off to the MITM engine, the plaintext HTTP loop, or
//! a raw bidirectional tunnel.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tokio::net::TcpStream;
use tokio::time::timeout;

use stronghold_net::dialer::DialError;
use stronghold_net::{PrefixedStream, SniError, dial_marked, original_dst, parse_sni};

use crate::http_loop;
use crate::mitm;
use crate::state::ProxyState;

const FIRST_BYTE_DEADLINE: Duration = Duration::from_secs(10);
const DIAL_TIMEOUT: Duration = Duration::from_secs(10);
const TLS_HANDSHAKE_BYTE: u8 = 0x16;
/// Record header (5 bytes) plus the largest record §6.4 will accept (16 KiB).
const MAX_CLIENT_HELLO_BYTES: usize = 5 + 16384;
const MAX_HTTP_HEADER_BYTES: usize = 8192;
const DEFAULT_TLS_PORT: u16 = 443;
const DEFAULT_HTTP_PORT: u16 = 80;

#[derive(Debug, thiserror::Error)]
enum DispatchError {
    #[error("failed to read first byte: {0}")]
    FirstByte(std::io::Error),
    #[error("connection closed before sending any bytes")]
    EmptyConnection,
    #[error("failed to read ClientHello: {0}")]
    ClientHelloRead(std::io::Error),
    #[error("could not extract SNI from ClientHello: {0}")]
    Sni(#[from] SniError),
    #[error("failed to read plaintext request headers: {0}")]
    HttpRead(std::io::Error),
    #[error("plaintext request carried no usable Host header")]
    NoHost,
    #[error("failed to resolve {0}: {1}")]
    Resolve(String, std::io::Error),
    #[error("failed to dial {0}: {1}")]
    Dial(String, DialError),
}

/// Entry point spawned per accepted connection. Never propagates an error: every
/// failure here is a silent, debug-logged connection close (§4.1 "Failure semantics").
pub async fn handle_connection(stream: TcpStream, peer: SocketAddr, state: Arc<ProxyState>) {
    if let Err(e) = dispatch(stream, state).await {
        tracing::debug!(%peer, error = %e, "connection dropped during dispatch");
    }
}

async fn dispatch(mut stream: TcpStream, state: Arc<ProxyState>) -> Result<(), DispatchError> {
    let mut first = [0u8; 1];
    let n = timeout(FIRST_BYTE_DEADLINE, stream.read(&mut first))
        .await
        .map_err(|_| {
            DispatchError::FirstByte(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                "first-byte read deadline exceeded",
            ))
        })?
        .map_err(DispatchError::FirstByte)?;
    if n == 0 {
        return Err(DispatchError::EmptyConnection);
    }

    // §4.1: `SO_ORIGINAL_DST` is socket-level and available (or not) regardless of
    // which protocol the connection turns out to carry.
    let dst = original_dst(&stream).ok();

    if first[0] == TLS_HANDSHAKE_BYTE {
        handle_tls(stream, first[0], dst, state).await
    } else {
        handle_http(stream, first[0], dst, state).await
    }
}

async fn handle_tls(
    mut stream: TcpStream,
    first_byte: u8,
    dst: Option<SocketAddr>,
    state: Arc<ProxyState>,
) -> Result<(), DispatchError> {
    let mut prefix = vec![first_byte];
    let host = read_sni(&mut stream, &mut prefix).await?;
    let port = dst.map(|a| a.port()).unwrap_or(DEFAULT_TLS_PORT);
    let prefixed = PrefixedStream::new(prefix, stream);

    if !state.config.mitm_enabled {
        let addr = resolve_dial_addr(&host, port, dst).await?;
        return tunnel(prefixed, addr, &state).await;
    }

    // §4.1 step 1 / §6.1: prefer the SO_ORIGINAL_DST-recovered address for the
    // actual dial so a redirected connection reaches the exact origin the client
    // intended, falling back to resolving the SNI host only when the kernel
    // destination wasn't available (e.g. the SNI-only macOS path).
    mitm::serve(prefixed, host, dst, port, Arc::clone(&state)).await;
    Ok(())
}

/// Accumulates bytes from `stream` into `prefix` until a full ClientHello can be
/// parsed, so the MITM engine later sees the complete handshake unharmed (§4.1
/// step 1, §6.4).
async fn read_sni(stream: &mut TcpStream, prefix: &mut Vec<u8>) -> Result<String, DispatchError> {
    loop {
        match parse_sni(prefix) {
            Ok(host) => return Ok(host),
            Err(SniError::Truncated) | Err(SniError::IncompleteRecord) => {
                if prefix.len() >= MAX_CLIENT_HELLO_BYTES {
                    return Err(DispatchError::Sni(SniError::Malformed(
                        "ClientHello exceeded the maximum record size before SNI was found",
                    )));
                }
                let mut buf = [0u8; 4096];
                let n = stream.read(&mut buf).await.map_err(DispatchError::ClientHelloRead)?;
                if n == 0 {
                    return Err(DispatchError::Sni(SniError::Truncated));
                }
                prefix.extend_from_slice(&buf[..n]);
            }
            Err(e) => return Err(e.into()),
        }
    }
}

async fn handle_http(
    mut stream: TcpStream,
    first_byte: u8,
    dst: Option<SocketAddr>,
    state: Arc<ProxyState>,
) -> Result<(), DispatchError> {
    let mut prefix = vec![first_byte];
    let host_header = read_host_header(&mut stream, &mut prefix).await?;
    let (dial_host, header_port) = split_host_port(&host_header);
    let port = dst.map(|a| a.port()).or(header_port).unwrap_or(DEFAULT_HTTP_PORT);
    let addr = resolve_dial_addr(&dial_host, port, dst).await?;

    let prefixed = PrefixedStream::new(prefix, stream);
    let upstream = dial_marked(addr, state.mark(), DIAL_TIMEOUT)
        .await
        .map_err(|e| DispatchError::Dial(addr.to_string(), e))?;

    http_loop::serve(prefixed, upstream, host_header, "http", false, Arc::clone(&state)).await;
    Ok(())
}

/// Reads up to the end of the request header block (or [`MAX_HTTP_HEADER_BYTES`]),
/// scanning for a `Host:` line so a plaintext connection's destination can be
/// learned the same way a browser would resolve it.
async fn read_host_header(stream: &mut TcpStream, prefix: &mut Vec<u8>) -> Result<String, DispatchError> {
    loop {
        if let Some(host) = extract_host_header(prefix) {
            return Ok(host);
        }
        if headers_complete(prefix) || prefix.len() >= MAX_HTTP_HEADER_BYTES {
            return Err(DispatchError::NoHost);
        }
        let mut buf = [0u8; 1024];
        let n = stream.read(&mut buf).await.map_err(DispatchError::HttpRead)?;
        if n == 0 {
            return Err(DispatchError::NoHost);
        }
        prefix.extend_from_slice(&buf[..n]);
    }
}

fn headers_complete(buf: &[u8]) -> bool {
    buf.windows(4).any(|w| w == b"\r\n\r\n")
}

fn extract_host_header(buf: &[u8]) -> Option<String> {
    let text = String::from_utf8_lossy(buf);
    for line in text.split("\r\n") {
        if line.len() > 5 && line[..5].eq_ignore_ascii_case("host:") {
            let value = line[5..].trim();
            if !value.is_empty() {
                return Some(value.to_string());
            }
        }
    }
    None
}

/// Splits a `Host:` header value into its bare host name and, if present, an
/// explicit port.
fn split_host_port(host_header: &str) -> (String, Option<u16>) {
    match host_header.rsplit_once(':') {
        Some((host, port)) if port.chars().all(|c| c.is_ascii_digit()) && !port.is_empty() => {
            (host.to_string(), port.parse().ok())
        }
        _ => (host_header.to_string(), None),
    }
}

async fn resolve_dial_addr(
    host: &str,
    port: u16,
    dst: Option<SocketAddr>,
) -> Result<SocketAddr, DispatchError> {
    if let Some(addr) = dst {
        return Ok(addr);
    }
    tokio::net::lookup_host((host, port))
        .await
        .map_err(|e| DispatchError::Resolve(host.to_string(), e))?
        .next()
        .ok_or_else(|| {
            DispatchError::Resolve(
                host.to_string(),
                std::io::Error::new(std::io::ErrorKind::NotFound, "DNS lookup returned no addresses"),
            )
        })
}

/// Tunnels bytes bidirectionally between `client` and the dialed origin with no TLS
/// termination or scanning, used when MITM is disabled (§4.1 step 3).
async fn tunnel<C>(mut client: C, addr: SocketAddr, state: &ProxyState) -> Result<(), DispatchError>
where
    C: AsyncRead + AsyncWrite + Unpin,
{
    let mut upstream = dial_marked(addr, state.mark(), DIAL_TIMEOUT)
        .await
        .map_err(|e| DispatchError::Dial(addr.to_string(), e))?;
    let _ = tokio::io::copy_bidirectional(&mut client, &mut upstream).await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_host_header_case_insensitively() {
        let buf = b"GET / HTTP/1.1\r\nHOST: example.test:8080\r\nAccept: */*\r\n\r\n";
        assert_eq!(extract_host_header(buf).as_deref(), Some("example.test:8080"));
    }

    #[test]
    fn split_host_port_separates_explicit_port() {
        assert_eq!(
            split_host_port("example.test:8080"),
            ("example.test".to_string(), Some(8080))
        );
        assert_eq!(split_host_port("example.test"), ("example.test".to_string(), None));
    }

    #[test]
    fn headers_complete_detects_terminator() {
        assert!(!headers_complete(b"GET / HTTP/1.1\r\nHost: x"));
        assert!(headers_complete(b"GET / HTTP/1.1\r\nHost: x\r\n\r\n"));
    }
}
