//! Error taxonomy for payment signing and facilitator settlement (§7 Payment-required,
//! §7 Settlement).

#[derive(Debug, thiserror::Error)]
pub enum PaymentsError {
    #[error("no wallet configured")]
    NoWalletConfigured,
    #[error("unsupported network: {0}")]
    UnsupportedNetwork(String),
    #[error("invalid address: {0}")]
    InvalidAddress(String),
    #[error("failed to sign payload: {0}")]
    Signing(String),
    #[error("failed to reach Solana RPC: {0}")]
    SolanaRpc(String),
    #[error("failed to encode payment payload to json: {0}")]
    JsonEncode(#[source] serde_json::Error),
    #[error("failed to decode payment payload from json: {0}")]
    JsonDecode(#[source] serde_json::Error),
    #[error("malformed X-Payment header: {0}")]
    MalformedHeader(String),
    #[error("facilitator request failed: {context}: {source}")]
    FacilitatorHttp { context: &'static str, source: String },
    #[error("facilitator returned unexpected status {status}: {context}: {body}")]
    FacilitatorStatus {
        context: &'static str,
        status: http::StatusCode,
        body: String,
    },
}
