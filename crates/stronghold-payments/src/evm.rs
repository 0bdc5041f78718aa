//! EIP-712 / EIP-3009 `transferWithAuthorization` signing and verification (§4.5).

use crate::error::PaymentsError;
use alloy_primitives::{Address, FixedBytes, U256};
use alloy_signer::{Signer, SignerSync};
use alloy_signer_local::PrivateKeySigner;
use alloy_sol_types::{SolStruct, eip712_domain};
use rand::RngCore;
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};
use stronghold_types::{Network, PaymentRequirements, X402Payload};

alloy_sol_types::sol! {
    /// Solidity-compatible struct mirrored from the ERC-3009 typed-data message (§4.5 step 4).
    struct TransferWithAuthorization {
        address from;
        address to;
        uint256 value;
        uint256 validAfter;
        uint256 validBefore;
        bytes32 nonce;
    }
}

const AUTHORIZATION_WINDOW_SECS: u64 = 300;

#[derive(Clone)]
pub struct EvmSigner {
    inner: PrivateKeySigner,
}

impl EvmSigner {
    pub fn from_bytes(bytes: &[u8; 32]) -> Result<Self, PaymentsError> {
        let inner = PrivateKeySigner::from_slice(bytes)
            .map_err(|e| PaymentsError::Signing(format!("invalid EVM private key: {e}")))?;
        Ok(Self { inner })
    }

    pub fn address(&self) -> Address {
        self.inner.address()
    }
}

fn now_unix() -> Result<u64, PaymentsError> {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .map_err(|e| PaymentsError::Signing(format!("system clock error: {e}")))
}

/// Signs a `TransferWithAuthorization` EIP-712 message for `requirements` and returns the
/// fully populated [`X402Payload`] with a 65-byte hex-encoded signature (§4.5 steps 2-7).
pub fn sign_payment(
    signer: &EvmSigner,
    network: Network,
    requirements: &PaymentRequirements,
) -> Result<X402Payload, PaymentsError> {
    let chain_id = network
        .evm_chain_id()
        .ok_or_else(|| PaymentsError::UnsupportedNetwork(network.to_string()))?;
    let token_address = Address::from_str(network.usdc_address())
        .map_err(|e| PaymentsError::InvalidAddress(e.to_string()))?;
    let to = Address::from_str(&requirements.recipient)
        .map_err(|e| PaymentsError::InvalidAddress(format!("recipient: {e}")))?;
    let value = U256::from_str(&requirements.amount)
        .map_err(|e| PaymentsError::InvalidAddress(format!("amount: {e}")))?;

    let timestamp = now_unix()?;
    let valid_after: u64 = 0;
    let valid_before = timestamp + AUTHORIZATION_WINDOW_SECS;

    let mut nonce_bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut nonce_bytes);

    let domain = eip712_domain! {
        name: "USD Coin".to_string(),
        version: "2".to_string(),
        chain_id: chain_id,
        verifying_contract: token_address,
    };
    let message = TransferWithAuthorization {
        from: signer.address(),
        to,
        value,
        validAfter: U256::from(valid_after),
        validBefore: U256::from(valid_before),
        nonce: FixedBytes(nonce_bytes),
    };
    let hash = message.eip712_signing_hash(&domain);

    // `sign_hash_sync` is CPU-bound and never suspends, matching §5's signing contract.
    let signature = signer
        .inner
        .sign_hash_sync(&hash)
        .map_err(|e| PaymentsError::Signing(e.to_string()))?;
    let sig_bytes = signature.as_bytes();

    Ok(X402Payload {
        network: network.to_string(),
        scheme: requirements.scheme.clone(),
        payer: format!("{:#x}", signer.address()),
        receiver: format!("{to:#x}"),
        token_address: format!("{token_address:#x}"),
        amount: requirements.amount.clone(),
        timestamp,
        nonce: format!("0x{}", hex::encode(nonce_bytes)),
        signature: Some(format!("0x{}", hex::encode(sig_bytes))),
        transaction: None,
    })
}

/// Reconstructs the typed data from `payload` and recovers the signer address,
/// accepting recovery bytes in either `{0,1}` or `{27,28}` (§4.5 Verifier, §8 property 5).
pub fn verify_payment(payload: &X402Payload) -> Result<Address, PaymentsError> {
    let network: Network = payload
        .network
        .parse()
        .map_err(|_| PaymentsError::UnsupportedNetwork(payload.network.clone()))?;
    let chain_id = network
        .evm_chain_id()
        .ok_or_else(|| PaymentsError::UnsupportedNetwork(payload.network.clone()))?;

    let from = Address::from_str(&payload.payer)
        .map_err(|e| PaymentsError::InvalidAddress(format!("payer: {e}")))?;
    let to = Address::from_str(&payload.receiver)
        .map_err(|e| PaymentsError::InvalidAddress(format!("receiver: {e}")))?;
    let token_address = Address::from_str(&payload.token_address)
        .map_err(|e| PaymentsError::InvalidAddress(format!("token_address: {e}")))?;
    let value = U256::from_str(&payload.amount)
        .map_err(|e| PaymentsError::InvalidAddress(format!("amount: {e}")))?;

    let nonce_hex = payload.nonce.strip_prefix("0x").unwrap_or(&payload.nonce);
    let nonce_vec =
        hex::decode(nonce_hex).map_err(|e| PaymentsError::Signing(format!("bad nonce: {e}")))?;
    let nonce: [u8; 32] = nonce_vec
        .try_into()
        .map_err(|_| PaymentsError::Signing("nonce must be 32 bytes".into()))?;

    let sig_hex = payload
        .signature
        .as_deref()
        .ok_or_else(|| PaymentsError::Signing("payload has no signature".into()))?;
    let sig_hex = sig_hex.strip_prefix("0x").unwrap_or(sig_hex);
    let sig_bytes =
        hex::decode(sig_hex).map_err(|e| PaymentsError::Signing(format!("bad signature: {e}")))?;
    if sig_bytes.len() != 65 {
        return Err(PaymentsError::Signing(
            "signature must be 65 bytes".to_string(),
        ));
    }
    // Wallets emit recovery bytes in {27,28}; alloy's `PrimitiveSignature` parser expects
    // {0,1}, so normalize before parsing (§8 property 5 accepts both on the way in).
    let mut normalized = sig_bytes.clone();
    if normalized[64] >= 27 {
        normalized[64] -= 27;
    }
    let signature = alloy_primitives::Signature::try_from(normalized.as_slice())
        .map_err(|e| PaymentsError::Signing(format!("malformed signature: {e}")))?;

    let domain = eip712_domain! {
        name: "USD Coin".to_string(),
        version: "2".to_string(),
        chain_id: chain_id,
        verifying_contract: token_address,
    };
    let message = TransferWithAuthorization {
        from,
        to,
        value,
        validAfter: U256::ZERO,
        validBefore: U256::from(payload.timestamp + AUTHORIZATION_WINDOW_SECS),
        nonce: FixedBytes(nonce),
    };
    let hash = message.eip712_signing_hash(&domain);

    let recovered = signature
        .recover_address_from_prehash(&hash)
        .map_err(|e| PaymentsError::Signing(format!("recovery failed: {e}")))?;
    if recovered != from {
        return Err(PaymentsError::Signing(format!(
            "recovered address {recovered:#x} does not match payer {from:#x}"
        )));
    }
    Ok(recovered)
}
