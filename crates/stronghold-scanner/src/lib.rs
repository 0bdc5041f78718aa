//! Scanner HTTP client (§4.4, §6.2): submits request/response bodies for content
//! scanning, and drives the 402-payment retry with the payment signer.

use http::Method;
use serde::Serialize;
use std::time::Duration;
use stronghold_net::MarkedResponse;
use stronghold_payments::Wallet;
use stronghold_types::payment::{PaymentRequiredResponse, PaymentRequirements};
use stronghold_types::{ScanResult, X402Payload};
use url::Url;

/// A payment that was signed and accepted in the course of a [`ScannerClient::scan`]
/// call, returned so the caller can register it for settlement (§4.6).
#[derive(Debug, Clone)]
pub struct SettledPayment {
    pub requirements: PaymentRequirements,
    pub payload: X402Payload,
}

/// The outcome of [`ScannerClient::scan`]: the scan verdict, plus the payment that
/// was made to obtain it, if the scanner's 402 retry dance was exercised.
#[derive(Debug, Clone)]
pub struct ScanOutcome {
    pub result: ScanResult,
    pub payment: Option<SettledPayment>,
}

const SCAN_PATH: &str = "v1/scan/content";
const BODY_EXCERPT_LEN: usize = 512;

#[derive(Debug, thiserror::Error)]
pub enum ScanFailure {
    #[error("no wallet configured")]
    NoWalletConfigured,
    #[error("payment was rejected")]
    PaymentRejected,
    #[error("scanner request failed: {0}")]
    Transport(#[from] stronghold_net::MarkedHttpError),
    #[error("scanner returned invalid JSON: {0}")]
    Decode(serde_json::Error),
    #[error("scanner returned unexpected status {status}: {body_excerpt}")]
    UnexpectedStatus {
        status: http::StatusCode,
        body_excerpt: String,
    },
    #[error("{0}")]
    Payments(#[from] stronghold_payments::PaymentsError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceType {
    HttpProxy,
}

impl SourceType {
    fn as_str(self) -> &'static str {
        match self {
            // Reserved per §9 open question: the proxy only ever sends this value.
            SourceType::HttpProxy => "http_proxy",
        }
    }
}

#[derive(Debug, Serialize)]
struct ScanRequestBody<'a> {
    text: &'a str,
    source_url: &'a str,
    source_type: &'static str,
    content_type: &'a str,
}

#[derive(Clone)]
pub struct ScannerClient {
    api_base_url: Url,
    auth_token: Option<String>,
    timeout: Duration,
    /// §4.7: every scan call dials a fresh connection carrying this mark, since
    /// the scanner is a remote HTTPS endpoint the installer's firewall would
    /// otherwise redirect straight back into the proxy.
    mark: u32,
    wallet: Option<Wallet>,
}

impl ScannerClient {
    pub fn new(
        api_base_url: Url,
        auth_token: Option<String>,
        timeout: Duration,
        mark: u32,
        wallet: Option<Wallet>,
    ) -> Self {
        Self {
            api_base_url,
            auth_token,
            timeout,
            mark,
            wallet,
        }
    }

    /// Submits `body` for content scanning (§4.4). Returns the scan verdict, or a
    /// [`ScanFailure`] the caller maps to fail-open/fail-closed per its own policy.
    pub async fn scan(
        &self,
        body: &str,
        source_url: &str,
        content_type: &str,
    ) -> Result<ScanOutcome, ScanFailure> {
        let request_body = ScanRequestBody {
            text: body,
            source_url,
            source_type: SourceType::HttpProxy.as_str(),
            content_type,
        };

        let response = self.post(&request_body, None).await?;
        if response.status == http::StatusCode::OK {
            let result = decode(response)?;
            return Ok(ScanOutcome {
                result,
                payment: None,
            });
        }
        if response.status != http::StatusCode::PAYMENT_REQUIRED {
            return Err(unexpected_status(response));
        }

        let Some(wallet) = self.wallet.as_ref() else {
            return Err(ScanFailure::NoWalletConfigured);
        };
        let required: PaymentRequiredResponse = serde_json::from_slice(&response.body).map_err(|_| {
            ScanFailure::Payments(stronghold_payments::PaymentsError::Signing(
                "malformed 402 response body".to_string(),
            ))
        })?;
        let requirements = required
            .select(|network| supports_network(network))
            .ok_or_else(|| {
                // §9 open question: a 402 whose single (non-`accepts`) requirement names an
                // unsupported network fails rather than silently substituting another asset.
                ScanFailure::Payments(stronghold_payments::PaymentsError::UnsupportedNetwork(
                    required.payment_requirements.network.clone(),
                ))
            })?
            .clone();

        let payload = stronghold_payments::sign_payment(&requirements, wallet).await?;
        let header = stronghold_payments::encode_header(&payload)?;
        let retry_response = self.post(&request_body, Some(&header)).await?;
        if retry_response.status == http::StatusCode::OK {
            let result = decode(retry_response)?;
            return Ok(ScanOutcome {
                result,
                payment: Some(SettledPayment {
                    requirements,
                    payload,
                }),
            });
        }
        if retry_response.status == http::StatusCode::PAYMENT_REQUIRED {
            return Err(ScanFailure::PaymentRejected);
        }
        Err(unexpected_status(retry_response))
    }

    /// Never follows redirects: a fresh one-shot request per call, same as every other
    /// marked socket the proxy opens (§4.7).
    async fn post(
        &self,
        body: &ScanRequestBody<'_>,
        payment_header: Option<&str>,
    ) -> Result<MarkedResponse, ScanFailure> {
        let url = self
            .api_base_url
            .join(SCAN_PATH)
            .expect("scan path is a valid relative URL");
        let mut headers = vec![("content-type", "application/json".to_string())];
        if let Some(token) = &self.auth_token {
            headers.push(("authorization", format!("Bearer {token}")));
        }
        if let Some(header) = payment_header {
            headers.push(("X-Payment", header.to_string()));
        }
        let body = serde_json::to_vec(body).expect("ScanRequestBody always serializes");
        let response =
            stronghold_net::marked_http::request(Method::POST, &url, &headers, body, self.mark, self.timeout)
                .await?;
        Ok(response)
    }
}

fn decode(response: MarkedResponse) -> Result<ScanResult, ScanFailure> {
    serde_json::from_slice(&response.body).map_err(ScanFailure::Decode)
}

fn unexpected_status(response: MarkedResponse) -> ScanFailure {
    let body = String::from_utf8_lossy(&response.body);
    let body_excerpt = body.chars().take(BODY_EXCERPT_LEN).collect();
    ScanFailure::UnexpectedStatus {
        status: response.status,
        body_excerpt,
    }
}

/// Which networks this proxy's wallet can pay on. Kept in the scanner crate since it
/// only needs to decide candidate selection, not perform any signing itself.
fn supports_network(network: &str) -> bool {
    matches!(
        network,
        "base" | "base-sepolia" | "solana" | "solana-devnet"
    )
}
