//! MITM TLS engine (§4.3): terminates TLS with the client using a per-host leaf
//! certificate minted by the certificate cache, dials the true origin with real
//! TLS, and drives the shared HTTP/1.1 request loop over both legs.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use rustls::pki_types::ServerName;
use rustls::{ClientConfig, RootCertStore, ServerConfig};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_rustls::{TlsAcceptor, TlsConnector};

use stronghold_net::dial_marked;
use stronghold_net::dialer::DialError;

use crate::deadline::DeadlineIo;
use crate::http_loop;
use crate::state::ProxyState;

const CLIENT_HANDSHAKE_DEADLINE: Duration = Duration::from_secs(10);
const ORIGIN_DIAL_TIMEOUT: Duration = Duration::from_secs(10);
const CLIENT_READ_DEADLINE: Duration = Duration::from_secs(30);

#[derive(Debug, thiserror::Error)]
enum MitmError {
    #[error("failed to obtain leaf certificate: {0}")]
    Cert(#[from] stronghold_ca::CaError),
    #[error("failed to build server TLS config: {0}")]
    ServerConfig(#[from] rustls::Error),
    #[error("client TLS handshake failed: {0}")]
    ClientHandshake(std::io::Error),
    #[error("failed to resolve origin {0}: {1}")]
    Resolve(String, std::io::Error),
    #[error("failed to dial origin {0}: {1}")]
    Dial(String, DialError),
    #[error("origin TLS handshake failed: {0}")]
    OriginHandshake(std::io::Error),
    #[error("{0:?} is not a valid DNS name for SNI")]
    InvalidServerName(String),
}

/// Drives one intercepted TLS connection end to end. Any failure is a debug-logged
/// connection close; nothing here is ever retried at this layer (§4.1 "Failure
/// semantics", §7 Transport). `original_dst`, when present, is the kernel-recovered
/// destination from `SO_ORIGINAL_DST` and is dialed directly rather than
/// re-resolving `host` over DNS (§4.1 step 1, §6.1).
pub async fn serve<C>(client: C, host: String, original_dst: Option<SocketAddr>, port: u16, state: Arc<ProxyState>)
where
    C: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    if let Err(e) = run(client, &host, original_dst, port, &state).await {
        tracing::debug!(host = %host, error = %e, "mitm connection dropped");
    }
}

async fn run<C>(
    client: C,
    host: &str,
    original_dst: Option<SocketAddr>,
    port: u16,
    state: &Arc<ProxyState>,
) -> Result<(), MitmError>
where
    C: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let leaf = state.cert_cache.get_cert(host).await?;

    let server_config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(leaf.cert_chain.clone(), leaf.private_key.clone_key())?;
    let acceptor = TlsAcceptor::from(Arc::new(server_config));

    let client_tls = tokio::time::timeout(CLIENT_HANDSHAKE_DEADLINE, acceptor.accept(client))
        .await
        .map_err(|_| {
            MitmError::ClientHandshake(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                "client handshake deadline exceeded",
            ))
        })?
        .map_err(MitmError::ClientHandshake)?;
    let client_tls = DeadlineIo::new(client_tls, CLIENT_READ_DEADLINE);

    let origin_addr = match original_dst {
        Some(addr) => addr,
        None => resolve_origin_addr(host, port)
            .await
            .map_err(|e| MitmError::Resolve(host.to_string(), e))?,
    };
    let origin_tcp = dial_marked(origin_addr, state.mark(), ORIGIN_DIAL_TIMEOUT)
        .await
        .map_err(|e| MitmError::Dial(format!("{host}:{port}"), e))?;

    let server_name = ServerName::try_from(host.to_string())
        .map_err(|_| MitmError::InvalidServerName(host.to_string()))?;
    let connector = TlsConnector::from(Arc::new(origin_client_config()));
    let origin_tls = tokio::time::timeout(ORIGIN_DIAL_TIMEOUT, connector.connect(server_name, origin_tcp))
        .await
        .map_err(|_| {
            MitmError::OriginHandshake(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                "origin handshake deadline exceeded",
            ))
        })?
        .map_err(MitmError::OriginHandshake)?;

    http_loop::serve(client_tls, origin_tls, host.to_string(), "https", true, Arc::clone(state)).await;
    Ok(())
}

async fn resolve_origin_addr(host: &str, port: u16) -> std::io::Result<SocketAddr> {
    tokio::net::lookup_host((host, port))
        .await?
        .next()
        .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::NotFound, "DNS lookup returned no addresses"))
}

/// Client config for the outbound leg to the real origin (§4.3 step 3): the normal
/// system/Mozilla trust store, no client certificate, TLS 1.2 minimum (rustls's
/// default supported-version set already excludes anything older).
fn origin_client_config() -> ClientConfig {
    let mut roots = RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth()
}
