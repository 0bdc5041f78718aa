//! Facilitator settlement client (§4.6, §6.3): `POST <facilitator_url>/settle` (and,
//! for future use, `/verify`), built from a persisted payment record and the x402
//! payload it was constructed from.

use crate::error::PaymentsError;
use http::{Method, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use stronghold_types::{Network, X402Payload};
use url::Url;

#[derive(Debug, Clone, Serialize)]
pub struct FacilitatorSettleRequest {
    #[serde(rename = "x402Version")]
    pub x402_version: u32,
    #[serde(rename = "paymentPayload")]
    pub payment_payload: PaymentPayloadEnvelope,
    #[serde(rename = "paymentRequirements")]
    pub payment_requirements: PaymentRequirementsEnvelope,
}

#[derive(Debug, Clone, Serialize)]
pub struct PaymentPayloadEnvelope {
    #[serde(rename = "x402Version")]
    pub x402_version: u32,
    pub payload: Value,
    pub accepted: Value,
}

#[derive(Debug, Clone, Serialize)]
pub struct PaymentRequirementsEnvelope {
    pub scheme: &'static str,
    pub network: String,
    pub asset: String,
    pub amount: String,
    #[serde(rename = "payTo")]
    pub pay_to: String,
    #[serde(rename = "maxTimeoutSeconds")]
    pub max_timeout_seconds: u32,
    pub extra: Value,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FacilitatorSettleResponse {
    pub success: bool,
    #[serde(default)]
    pub transaction: Option<String>,
    #[serde(default)]
    pub network: Option<String>,
    #[serde(default)]
    pub payer: Option<String>,
    #[serde(default)]
    pub error_reason: Option<String>,
}

/// Builds the §6.3 `/settle` (and `/verify`) request body from a signed x402 payload.
pub fn build_settle_request(
    payload: &X402Payload,
    accepted: &Value,
) -> Result<FacilitatorSettleRequest, PaymentsError> {
    let network: Network = payload
        .network
        .parse()
        .map_err(|_| PaymentsError::UnsupportedNetwork(payload.network.clone()))?;

    let (payload_body, extra) = match network.family() {
        stronghold_types::network::NetworkFamily::Evm => {
            let signature = payload
                .signature
                .clone()
                .ok_or_else(|| PaymentsError::Signing("EVM payload missing signature".into()))?;
            let body = serde_json::json!({
                "signature": signature,
                "authorization": {
                    "from": payload.payer,
                    "to": payload.receiver,
                    "value": payload.amount,
                    "validAfter": 0,
                    "validBefore": payload.timestamp + 300,
                    "nonce": payload.nonce,
                }
            });
            let extra = serde_json::json!({
                "assetTransferMethod": "eip3009",
                "name": "USD Coin",
                "version": "2",
            });
            (body, extra)
        }
        stronghold_types::network::NetworkFamily::Solana => {
            let transaction = payload
                .transaction
                .clone()
                .ok_or_else(|| PaymentsError::Signing("Solana payload missing transaction".into()))?;
            let body = serde_json::json!({ "transaction": transaction });
            let extra = serde_json::json!({ "assetTransferMethod": "solana-transfer" });
            (body, extra)
        }
    };

    Ok(FacilitatorSettleRequest {
        x402_version: 2,
        payment_payload: PaymentPayloadEnvelope {
            x402_version: 2,
            payload: payload_body,
            accepted: accepted.clone(),
        },
        payment_requirements: PaymentRequirementsEnvelope {
            scheme: "exact",
            network: network.caip2().to_string(),
            asset: payload.token_address.clone(),
            amount: payload.amount.clone(),
            pay_to: payload.receiver.clone(),
            max_timeout_seconds: 300,
            extra,
        },
    })
}

/// HTTP client for a remote facilitator's `/settle` (and `/verify`) endpoints.
/// Every call dials a fresh connection carrying `STRONGHOLD_MARK` (§4.7): the
/// facilitator is a remote HTTPS endpoint the installer's firewall would
/// otherwise redirect straight back into the proxy.
#[derive(Clone)]
pub struct FacilitatorClient {
    base_url: Url,
    timeout: Duration,
    mark: u32,
}

impl FacilitatorClient {
    pub fn new(base_url: Url, timeout: Duration, mark: u32) -> Self {
        Self {
            base_url,
            timeout,
            mark,
        }
    }

    pub async fn settle(
        &self,
        request: &FacilitatorSettleRequest,
    ) -> Result<FacilitatorSettleResponse, PaymentsError> {
        self.post_json("POST /settle", "settle", request).await
    }

    /// Exposed for future use (§9 open question: `/verify` is not invoked by the
    /// settlement loop, which calls `/settle` directly).
    #[allow(dead_code)]
    pub async fn verify(
        &self,
        request: &FacilitatorSettleRequest,
    ) -> Result<FacilitatorSettleResponse, PaymentsError> {
        self.post_json("POST /verify", "verify", request).await
    }

    async fn post_json(
        &self,
        context: &'static str,
        path: &str,
        request: &FacilitatorSettleRequest,
    ) -> Result<FacilitatorSettleResponse, PaymentsError> {
        let url = self.base_url.join(path).map_err(|e| {
            PaymentsError::InvalidAddress(format!("bad facilitator url: {e}"))
        })?;
        let body = serde_json::to_vec(request).map_err(PaymentsError::JsonEncode)?;
        let response = stronghold_net::marked_http::request(
            Method::POST,
            &url,
            &[("content-type", "application/json".to_string())],
            body,
            self.mark,
            self.timeout,
        )
        .await
        .map_err(|e| PaymentsError::FacilitatorHttp {
            context,
            source: e.to_string(),
        })?;

        if response.status != StatusCode::OK {
            let body = String::from_utf8_lossy(&response.body).into_owned();
            return Err(PaymentsError::FacilitatorStatus {
                context,
                status: response.status,
                body,
            });
        }
        serde_json::from_slice(&response.body).map_err(|e| PaymentsError::FacilitatorHttp {
            context,
            source: e.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn evm_payload() -> X402Payload {
        X402Payload {
            network: "base-sepolia".into(),
            scheme: "exact".into(),
            payer: "0xabc".into(),
            receiver: "0xdef".into(),
            token_address: "0x036CbD53842c5426634e7929541eC2318f3dCF7e".into(),
            amount: "2000".into(),
            timestamp: 1_700_000_000,
            nonce: format!("0x{}", "00".repeat(32)),
            signature: Some("0xsig".into()),
            transaction: None,
        }
    }

    #[test]
    fn build_settle_request_maps_evm_network_to_caip2() {
        let payload = evm_payload();
        let req = build_settle_request(&payload, &serde_json::json!({})).unwrap();
        assert_eq!(req.payment_requirements.network, "eip155:84532");
        assert_eq!(req.payment_requirements.extra["assetTransferMethod"], "eip3009");
    }

    #[test]
    fn build_settle_request_rejects_evm_payload_missing_signature() {
        let mut payload = evm_payload();
        payload.signature = None;
        let err = build_settle_request(&payload, &serde_json::json!({})).unwrap_err();
        assert!(matches!(err, PaymentsError::Signing(_)));
    }
}
