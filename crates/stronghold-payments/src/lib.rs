//! Payment signer (§4.5, §4.5') and facilitator settlement client (§4.6, §6.3).

pub mod error;
pub mod evm;
pub mod facilitator;
pub mod solana;

pub use error::PaymentsError;
pub use facilitator::{FacilitatorClient, FacilitatorSettleRequest, FacilitatorSettleResponse};

use stronghold_types::{Network, PaymentRequirements, X402Payload};

/// Signs `requirements` with the wallet's handle for the matching chain family
/// (§4.5 steps 1-6, §4.5' steps 1-4), without encoding it as a header yet. Exposed
/// separately from [`build_payment_header`] so callers that must persist the
/// signed payload for settlement (§4.6) don't have to decode it back out of the
/// header they just built.
pub async fn sign_payment(
    requirements: &PaymentRequirements,
    wallet: &Wallet,
) -> Result<X402Payload, PaymentsError> {
    let network: Network = requirements
        .network
        .parse()
        .map_err(|_| PaymentsError::UnsupportedNetwork(requirements.network.clone()))?;
    match network.family() {
        stronghold_types::network::NetworkFamily::Evm => {
            let signer = wallet
                .evm
                .as_ref()
                .ok_or(PaymentsError::NoWalletConfigured)?;
            evm::sign_payment(signer, network, requirements)
        }
        stronghold_types::network::NetworkFamily::Solana => {
            let signer = wallet
                .solana
                .as_ref()
                .ok_or(PaymentsError::NoWalletConfigured)?;
            solana::sign_payment(signer, network, requirements).await
        }
    }
}

/// Produces the base64 `x402;...` header value for `requirements`, dispatching to the
/// EVM or Solana signer per the network's chain family (§4.5 step 1, §4.5').
pub async fn build_payment_header(
    requirements: &PaymentRequirements,
    wallet: &Wallet,
) -> Result<String, PaymentsError> {
    let payload = sign_payment(requirements, wallet).await?;
    encode_header(&payload)
}

/// Wire format for the `X-Payment` header (§6.5): `x402;<base64(payload_json)>`.
pub fn encode_header(payload: &X402Payload) -> Result<String, PaymentsError> {
    let json = serde_json::to_vec(payload).map_err(PaymentsError::JsonEncode)?;
    let b64 = stronghold_types::util::Base64Bytes::encode(json);
    Ok(format!("x402;{b64}"))
}

/// Parses an `X-Payment` header value back into its payload (§6.5, §8 property 6).
pub fn parse_header(header: &str) -> Result<X402Payload, PaymentsError> {
    let (token, encoded) = header
        .split_once(';')
        .ok_or_else(|| PaymentsError::MalformedHeader("missing ';' separator".into()))?;
    if token != "x402" {
        return Err(PaymentsError::MalformedHeader(format!(
            "expected scheme token 'x402', got '{token}'"
        )));
    }
    let bytes = stronghold_types::util::Base64Bytes::from(encoded.as_bytes())
        .decode()
        .map_err(|e| PaymentsError::MalformedHeader(format!("invalid base64: {e}")))?;
    serde_json::from_slice(&bytes).map_err(PaymentsError::JsonDecode)
}

/// The wallet material loaded from the OS keyring (§1, §4.5, §4.5'; out of scope:
/// provisioning itself, only the signing handles are in this crate's purview).
#[derive(Clone)]
pub struct Wallet {
    pub evm: Option<evm::EvmSigner>,
    pub solana: Option<solana::SolanaSigner>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_roundtrips_arbitrary_payload() {
        let payload = X402Payload {
            network: "base-sepolia".into(),
            scheme: "exact".into(),
            payer: "0xabc".into(),
            receiver: "0xdef".into(),
            token_address: "0x036CbD53842c5426634e7929541eC2318f3dCF7e".into(),
            amount: "2000".into(),
            timestamp: 1_700_000_000,
            nonce: "0x00".repeat(32),
            signature: Some("0xsig".into()),
            transaction: None,
        };
        let header = encode_header(&payload).unwrap();
        assert!(header.starts_with("x402;"));
        let parsed = parse_header(&header).unwrap();
        assert_eq!(parsed, payload);
    }

    #[test]
    fn parse_header_rejects_wrong_scheme_token() {
        let err = parse_header("notx402;aGVsbG8=").unwrap_err();
        assert!(matches!(err, PaymentsError::MalformedHeader(_)));
    }
}
