//! The HTTP/1.1 request loop shared by the MITM (TLS) path and the plaintext
//! dispatcher path (§4.1 last bullet, §4.3): read a request, scan its body, scan
//! the upstream response's body, apply policy, inject `X-Stronghold-*` headers.

use std::convert::Infallible;
use std::sync::Arc;

use bytes::Bytes;
use http::header::{CONTENT_TYPE, HeaderName, HeaderValue};
use http::{Request, Response, StatusCode, Uri};
use http_body_util::{BodyExt, Full, combinators::BoxBody};
use hyper::body::Incoming;
use hyper::client::conn::http1::SendRequest;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::Mutex as AsyncMutex;
use uuid::Uuid;

use crate::policy::{self, BlockBody, ContentClass, PolicyOutcome, ScanType};
use crate::state::ProxyState;
use stronghold_scanner::ScanFailure;

type RespBody = BoxBody<Bytes, hyper::Error>;

#[derive(Debug, thiserror::Error)]
enum ForwardError {
    #[error("failed to read request body: {0}")]
    RequestBody(hyper::Error),
    #[error("upstream request failed: {0}")]
    Upstream(hyper::Error),
    #[error("failed to read upstream response body: {0}")]
    ResponseBody(hyper::Error),
}

/// §7 "Payment-required": a missing wallet, or a 402 that survives the one-shot
/// retry, is a hard failure to the caller rather than something fail-open/
/// fail-closed policy can paper over.
#[derive(Debug)]
struct PaymentHardError(String);

/// Drives one client connection end to end: handshakes with `upstream_io`, then
/// serves HTTP/1.1 requests read from `client_io` over that single upstream
/// connection until either side closes or the read deadline trips. `scheme` is
/// the absolute-form scheme used to rewrite each request's target (§4.3: `https`
/// for the MITM path, `http` for the plaintext dispatcher path).
pub async fn serve<C, U>(
    client_io: C,
    upstream_io: U,
    host: String,
    scheme: &'static str,
    is_mitm: bool,
    state: Arc<ProxyState>,
) where
    C: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    U: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (sender, conn) = match hyper::client::conn::http1::handshake(TokioIo::new(upstream_io)).await {
        Ok(pair) => pair,
        Err(e) => {
            tracing::debug!(host = %host, error = %e, "upstream handshake failed");
            return;
        }
    };

    tokio::spawn(async move {
        if let Err(e) = conn.await {
            tracing::debug!(error = %e, "upstream connection task ended");
        }
    });

    let sender = Arc::new(AsyncMutex::new(sender));

    let service = service_fn(move |req: Request<Incoming>| {
        let sender = Arc::clone(&sender);
        let host = host.clone();
        let state = Arc::clone(&state);
        async move { handle_request(req, sender, host, scheme, is_mitm, state).await }
    });

    if let Err(e) = hyper::server::conn::http1::Builder::new()
        .serve_connection(TokioIo::new(client_io), service)
        .await
    {
        tracing::debug!(error = %e, "client connection ended");
    }
}

async fn handle_request(
    req: Request<Incoming>,
    sender: Arc<AsyncMutex<SendRequest<Full<Bytes>>>>,
    host: String,
    scheme: &'static str,
    is_mitm: bool,
    state: Arc<ProxyState>,
) -> Result<Response<RespBody>, Infallible> {
    state.counters.record_request();
    let request_id = Uuid::now_v7().to_string();

    match process_request(req, &sender, &host, scheme, &state).await {
        Ok(resp) => Ok(apply_proxy_marker(resp, is_mitm)),
        Err(e) => {
            tracing::warn!(host = %host, error = %e, "failed to forward request");
            Ok(apply_proxy_marker(
                text_response(StatusCode::BAD_GATEWAY, &request_id, "upstream request failed"),
                is_mitm,
            ))
        }
    }
}

async fn process_request(
    req: Request<Incoming>,
    sender: &AsyncMutex<SendRequest<Full<Bytes>>>,
    host: &str,
    scheme: &str,
    state: &Arc<ProxyState>,
) -> Result<Response<RespBody>, ForwardError> {
    let request_id = Uuid::now_v7().to_string();
    let (mut parts, body) = req.into_parts();

    let rewritten = rewrite_to_absolute(&parts.uri, scheme, host);
    let source_url = rewritten.to_string();
    parts.uri = rewritten;

    let body_bytes = body.collect().await.map_err(ForwardError::RequestBody)?.to_bytes();

    let content_type = header_str(&parts.headers, &CONTENT_TYPE).unwrap_or_default();
    let request_outcome = match scan_body(state, &body_bytes, &source_url, content_type).await {
        Ok(outcome) => outcome,
        Err(e) => return Ok(payment_required_response(&e.0, &request_id)),
    };

    if request_outcome.is_block() {
        state.counters.record_blocked();
        return Ok(block_response(&request_outcome, &source_url, &request_id));
    }
    if request_outcome.is_warn() {
        state.counters.record_warned();
    }

    let upstream_req = Request::from_parts(parts, Full::new(body_bytes));
    let mut guard = sender.lock().await;
    guard.ready().await.map_err(ForwardError::Upstream)?;
    let upstream_resp = guard.send_request(upstream_req).await.map_err(ForwardError::Upstream)?;
    drop(guard);

    let (resp_parts, resp_body) = upstream_resp.into_parts();
    let resp_bytes = resp_body.collect().await.map_err(ForwardError::ResponseBody)?.to_bytes();
    let resp_content_type = header_str(&resp_parts.headers, &CONTENT_TYPE).unwrap_or_default();
    let response_outcome = match scan_body(state, &resp_bytes, &source_url, resp_content_type).await {
        Ok(outcome) => outcome,
        Err(e) => return Ok(payment_required_response(&e.0, &request_id)),
    };

    if response_outcome.is_block() {
        state.counters.record_blocked();
        return Ok(block_response(&response_outcome, &source_url, &request_id));
    }
    if response_outcome.is_warn() {
        state.counters.record_warned();
    }

    let mut response = Response::from_parts(resp_parts, full_body(resp_bytes));
    inject_headers(response.headers_mut(), &response_outcome, &request_id);
    Ok(response)
}

/// Rewrites a request-target to absolute form (§4.3): `{scheme}://{host}{path_and_query}`.
/// Requests arriving in origin form (the common case once TLS already pins the host
/// via SNI, or plaintext HTTP pins it via `Host:`) pick up the scheme and authority
/// here; requests that already name an absolute URI keep their own path untouched.
fn rewrite_to_absolute(uri: &Uri, scheme: &str, host: &str) -> Uri {
    let path_and_query = uri.path_and_query().map(|pq| pq.as_str()).unwrap_or("/");
    let rebuilt = format!("{scheme}://{host}{path_and_query}");
    rebuilt.parse().unwrap_or_else(|_| uri.clone())
}

async fn scan_body(
    state: &Arc<ProxyState>,
    body: &Bytes,
    source_url: &str,
    content_type: &str,
) -> Result<PolicyOutcome, PaymentHardError> {
    if !state.config.scanner.content.enabled {
        return Ok(PolicyOutcome::disabled());
    }
    if body.is_empty() {
        return Ok(PolicyOutcome::skipped(ScanType::SkippedUnscannable));
    }
    if policy::classify_content_type(content_type) != ContentClass::Scannable {
        return Ok(PolicyOutcome::skipped(ScanType::SkippedUnscannable));
    }
    if body.len() > policy::MAX_SCAN_BODY_BYTES {
        return Ok(PolicyOutcome::skipped(ScanType::SkippedOversized));
    }

    let text = String::from_utf8_lossy(body);
    match state.scanner.scan(&text, source_url, content_type).await {
        Ok(outcome) => {
            if let Some(payment) = outcome.payment {
                let state = Arc::clone(state);
                tokio::spawn(async move { register_payment(state, payment).await });
            }
            Ok(PolicyOutcome::from_scan_result(&outcome.result, &state.config.scanner.content))
        }
        // §7 "Payment-required": a missing wallet or a 402 that survives the
        // one-shot retry is a hard error to the caller, distinct from the
        // fail-open/fail-closed "Scan-upstream" kind below.
        Err(e @ (ScanFailure::NoWalletConfigured | ScanFailure::PaymentRejected)) => {
            tracing::warn!(error = %e, "payment-required scan failure");
            Err(PaymentHardError(e.to_string()))
        }
        Err(e) => {
            tracing::warn!(error = %e, "scanner call failed");
            Ok(PolicyOutcome::from_scan_failure(state.config.scanner.fail_open))
        }
    }
}

/// Persists a payment the scanner signed as `reserved` and attempts to settle it
/// immediately, off the request path — the settlement worker's retry loop picks up
/// whatever this first attempt doesn't finish (§4.6).
async fn register_payment(state: Arc<ProxyState>, payment: stronghold_scanner::SettledPayment) {
    let id = Uuid::now_v7().to_string();
    if let Err(e) = state
        .settlement
        .insert_reserved(&id, &payment.payload, &payment.requirements)
    {
        tracing::warn!(id, error = %e, "failed to persist reserved payment");
        return;
    }
    match stronghold_settlement::settle_reserved_now(&state.settlement, &id, state.facilitator_timeout(), state.mark()).await {
        Ok(true) => tracing::debug!(id, "inline settlement attempt made"),
        Ok(false) => tracing::debug!(id, "payment claim lost before inline settlement"),
        Err(e) => tracing::warn!(id, error = %e, "inline settlement attempt failed to start"),
    }
}

fn header_str<'a>(headers: &'a http::HeaderMap, name: &HeaderName) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

fn full_body(bytes: Bytes) -> RespBody {
    Full::new(bytes).map_err(|never| match never {}).boxed()
}

fn text_response(status: StatusCode, request_id: &str, message: &str) -> Response<RespBody> {
    let mut response = Response::new(full_body(Bytes::copy_from_slice(message.as_bytes())));
    *response.status_mut() = status;
    response.headers_mut().insert(
        HeaderName::from_static("content-type"),
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    if let Ok(value) = HeaderValue::from_str(request_id) {
        response
            .headers_mut()
            .insert(HeaderName::from_static("x-stronghold-request-id"), value);
    }
    response
}

/// §7 "Payment-required": 502 with the scanner's own failure text (`no wallet
/// configured` / `payment was rejected`) surfaced to the caller verbatim.
fn payment_required_response(message: &str, request_id: &str) -> Response<RespBody> {
    text_response(StatusCode::BAD_GATEWAY, request_id, message)
}

/// §6.7: the 403 JSON body returned in place of whichever side's content tripped
/// a `block` action, with every `X-Stronghold-*` header still attached.
fn block_response(outcome: &PolicyOutcome, url: &str, request_id: &str) -> Response<RespBody> {
    let reason = outcome.reason.as_deref().unwrap_or("blocked by content scan");
    let recommended_action = outcome.recommended_action.as_deref().unwrap_or("review");
    let body = BlockBody::new(reason, url, request_id, recommended_action);
    let payload = serde_json::to_vec(&body).unwrap_or_else(|_| b"{}".to_vec());

    let mut response = Response::new(full_body(Bytes::from(payload)));
    *response.status_mut() = StatusCode::FORBIDDEN;
    response.headers_mut().insert(
        HeaderName::from_static("content-type"),
        HeaderValue::from_static("application/json"),
    );
    inject_headers(response.headers_mut(), outcome, request_id);
    response
}

/// §6.6: the common `X-Stronghold-*` header set reflecting the final policy
/// outcome for this request/response pair.
fn inject_headers(headers: &mut http::HeaderMap, outcome: &PolicyOutcome, request_id: &str) {
    insert(headers, "x-stronghold-request-id", request_id);
    insert(headers, "x-stronghold-action", policy::action_header_value(outcome.action));
    insert(headers, "x-stronghold-scan-type", outcome.scan_type.as_str());
    if let Some(latency_ms) = outcome.latency_ms {
        insert(headers, "x-stronghold-scan-latency", &format!("{latency_ms}ms"));
    }
    if let Some(decision) = outcome.decision {
        insert(headers, "x-stronghold-decision", policy::decision_header_value(decision));
    }
    if let Some(reason) = &outcome.reason {
        insert(headers, "x-stronghold-reason", reason);
    }
    if let Some(score) = outcome.score {
        insert(headers, "x-stronghold-score", &score.to_string());
    }
    if outcome.is_warn() {
        let warning = outcome.reason.as_deref().unwrap_or("content flagged by security scan");
        insert(headers, "x-stronghold-warning", warning);
    }
}

fn apply_proxy_marker(mut response: Response<RespBody>, is_mitm: bool) -> Response<RespBody> {
    if is_mitm {
        insert(response.headers_mut(), "x-stronghold-proxy", "mitm");
    }
    response
}

fn insert(headers: &mut http::HeaderMap, name: &'static str, value: &str) {
    if let Ok(value) = HeaderValue::from_str(value) {
        headers.insert(HeaderName::from_static(name), value);
    }
}
