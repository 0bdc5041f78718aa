//! One-shot marked HTTP(S) client (§4.7): the scanner, facilitator, and Solana
//! RPC calls all talk to a remote API over plain `reqwest`/RPC-client sockets
//! that never pass through [`crate::dial_marked`]. Since the installer's
//! firewall redirects any unmarked outbound connection on 80/443 straight back
//! into the proxy, those calls need their own marked dial rather than relying
//! on the same connection-pool machinery the forwarded-traffic path uses.
//!
//! This dials a fresh connection per request instead of pooling one, mirroring
//! how the MITM engine dials a fresh origin leg per intercepted connection
//! (`mitm.rs`): call volume here is occasional (scans, settlements, RPC), not
//! the high-frequency path `dial_marked` otherwise serves.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http::{HeaderMap, Method, StatusCode};
use http_body_util::{BodyExt, Full};
use hyper::client::conn::http1;
use hyper_util::rt::TokioIo;
use rustls::pki_types::ServerName;
use rustls::{ClientConfig, RootCertStore};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_rustls::TlsConnector;
use url::Url;

use crate::dialer::{DialError, dial_marked};

#[derive(Debug, thiserror::Error)]
pub enum MarkedHttpError {
    #[error("unsupported URL scheme: {0}")]
    UnsupportedScheme(String),
    #[error("URL has no host")]
    MissingHost,
    #[error("{0:?} is not a valid DNS name for TLS")]
    InvalidServerName(String),
    #[error("failed to resolve {0}: {1}")]
    Resolve(String, std::io::Error),
    #[error("failed to dial {0}: {1}")]
    Dial(String, DialError),
    #[error("TLS handshake with {0} failed: {1}")]
    Tls(String, std::io::Error),
    #[error("HTTP handshake failed: {0}")]
    Handshake(hyper::Error),
    #[error("request timed out after {0:?}")]
    Timeout(Duration),
    #[error("request failed: {0}")]
    Request(hyper::Error),
    #[error("failed to read response body: {0}")]
    Body(hyper::Error),
}

pub struct MarkedResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

/// Sends one request to `url` over a freshly dialed connection carrying `mark`,
/// wrapped in TLS when `url`'s scheme is `https`. `timeout` bounds the whole
/// operation (resolve, dial, handshake, send, and response body).
pub async fn request(
    method: Method,
    url: &Url,
    extra_headers: &[(&'static str, String)],
    body: Vec<u8>,
    mark: u32,
    timeout: Duration,
) -> Result<MarkedResponse, MarkedHttpError> {
    tokio::time::timeout(
        timeout,
        request_inner(method, url, extra_headers, body, mark, timeout),
    )
    .await
    .map_err(|_| MarkedHttpError::Timeout(timeout))?
}

async fn request_inner(
    method: Method,
    url: &Url,
    extra_headers: &[(&'static str, String)],
    body: Vec<u8>,
    mark: u32,
    connect_timeout: Duration,
) -> Result<MarkedResponse, MarkedHttpError> {
    let host = url.host_str().ok_or(MarkedHttpError::MissingHost)?.to_string();
    let tls = match url.scheme() {
        "https" => true,
        "http" => false,
        other => return Err(MarkedHttpError::UnsupportedScheme(other.to_string())),
    };
    let port = url.port_or_known_default().unwrap_or(if tls { 443 } else { 80 });

    let addr = tokio::net::lookup_host((host.as_str(), port))
        .await
        .map_err(|e| MarkedHttpError::Resolve(host.clone(), e))?
        .next()
        .ok_or_else(|| {
            MarkedHttpError::Resolve(
                host.clone(),
                std::io::Error::new(std::io::ErrorKind::NotFound, "DNS lookup returned no addresses"),
            )
        })?;

    let tcp = dial_marked(addr, mark, connect_timeout)
        .await
        .map_err(|e| MarkedHttpError::Dial(format!("{host}:{port}"), e))?;

    let mut path_and_query = url.path().to_string();
    if let Some(query) = url.query() {
        path_and_query.push('?');
        path_and_query.push_str(query);
    }
    let mut builder = http::Request::builder()
        .method(method)
        .uri(path_and_query)
        .header(http::header::HOST, host.as_str());
    for (name, value) in extra_headers {
        builder = builder.header(*name, value.as_str());
    }
    let request = builder
        .body(Full::new(Bytes::from(body)))
        .expect("method/uri/header construction from validated inputs cannot fail");

    if tls {
        let connector = TlsConnector::from(Arc::new(tls_client_config()));
        let server_name = ServerName::try_from(host.clone())
            .map_err(|_| MarkedHttpError::InvalidServerName(host.clone()))?;
        let stream = connector
            .connect(server_name, tcp)
            .await
            .map_err(|e| MarkedHttpError::Tls(host.clone(), e))?;
        send(stream, request).await
    } else {
        send(tcp, request).await
    }
}

async fn send<S>(io: S, request: http::Request<Full<Bytes>>) -> Result<MarkedResponse, MarkedHttpError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (mut sender, conn) = http1::handshake(TokioIo::new(io)).await.map_err(MarkedHttpError::Handshake)?;
    tokio::spawn(async move {
        if let Err(e) = conn.await {
            tracing::debug!(error = %e, "marked http connection ended");
        }
    });

    let response = sender.send_request(request).await.map_err(MarkedHttpError::Request)?;
    let (parts, body) = response.into_parts();
    let body = body.collect().await.map_err(MarkedHttpError::Body)?.to_bytes();

    Ok(MarkedResponse {
        status: parts.status,
        headers: parts.headers,
        body,
    })
}

/// Trust store for the outbound leg to a remote API (scanner, facilitator, Solana
/// RPC): the normal Mozilla trust store, no client certificate, mirroring the
/// proxy's own origin-facing TLS config in `mitm.rs`.
fn tls_client_config() -> ClientConfig {
    let mut roots = RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth()
}
