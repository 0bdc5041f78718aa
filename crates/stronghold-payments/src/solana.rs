//! Solana SPL transfer-with-fee-payer signing (§4.5').

use crate::error::PaymentsError;
use http::Method;
use serde::Deserialize;
use solana_sdk::hash::Hash;
use solana_sdk::message::Message;
use solana_sdk::pubkey::Pubkey;
use solana_sdk::signature::Keypair;
use solana_sdk::signer::Signer as _;
use solana_sdk::transaction::Transaction;
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use stronghold_types::{Network, PaymentRequirements, X402Payload};
use url::Url;

const USDC_DECIMALS: u8 = 6;
const RPC_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Clone)]
pub struct SolanaSigner {
    keypair: Arc<Keypair>,
    rpc_url: String,
    /// §4.7: the RPC socket carries this mark, same as every other outbound
    /// call the proxy makes, since solana's RPC is also a remote HTTPS
    /// endpoint the installer's firewall would otherwise redirect.
    mark: u32,
}

impl SolanaSigner {
    pub fn new(keypair: Keypair, rpc_url: String, mark: u32) -> Self {
        Self {
            keypair: Arc::new(keypair),
            rpc_url,
            mark,
        }
    }

    pub fn pubkey(&self) -> Pubkey {
        self.keypair.pubkey()
    }
}

fn now_unix() -> Result<u64, PaymentsError> {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .map_err(|e| PaymentsError::Signing(format!("system clock error: {e}")))
}

/// Builds and partially signs an SPL token transfer from the payer's associated token
/// account to the recipient's, with the facilitator's `fee_payer` pubkey as the
/// transaction's fee payer (§4.5' steps 1-4); the facilitator completes the signature
/// when it submits the transaction.
pub async fn sign_payment(
    signer: &SolanaSigner,
    network: Network,
    requirements: &PaymentRequirements,
) -> Result<X402Payload, PaymentsError> {
    let mint = Pubkey::from_str(network.usdc_address())
        .map_err(|e| PaymentsError::InvalidAddress(format!("usdc mint: {e}")))?;
    let recipient = Pubkey::from_str(&requirements.recipient)
        .map_err(|e| PaymentsError::InvalidAddress(format!("recipient: {e}")))?;
    let fee_payer_str = requirements
        .fee_payer
        .as_deref()
        .ok_or_else(|| PaymentsError::InvalidAddress("402 response missing fee_payer".into()))?;
    let fee_payer = Pubkey::from_str(fee_payer_str)
        .map_err(|e| PaymentsError::InvalidAddress(format!("fee_payer: {e}")))?;
    let amount: u64 = requirements
        .amount
        .parse()
        .map_err(|e| PaymentsError::InvalidAddress(format!("amount: {e}")))?;

    let source_ata =
        spl_associated_token_account::get_associated_token_address(&signer.pubkey(), &mint);
    let dest_ata = spl_associated_token_account::get_associated_token_address(&recipient, &mint);

    let transfer_ix = spl_token::instruction::transfer_checked(
        &spl_token::id(),
        &source_ata,
        &mint,
        &dest_ata,
        &signer.pubkey(),
        &[],
        amount,
        USDC_DECIMALS,
    )
    .map_err(|e| PaymentsError::Signing(format!("failed to build transfer instruction: {e}")))?;

    let recent_blockhash = fetch_latest_blockhash(&signer.rpc_url, signer.mark).await?;

    let message = Message::new_with_blockhash(&[transfer_ix], Some(&fee_payer), &recent_blockhash);
    let mut tx = Transaction::new_unsigned(message);
    tx.try_partial_sign(&[signer.keypair.as_ref()], recent_blockhash)
        .map_err(|e| PaymentsError::Signing(format!("partial sign failed: {e}")))?;

    let serialized = bincode::serialize(&tx)
        .map_err(|e| PaymentsError::Signing(format!("transaction serialization failed: {e}")))?;
    let tx_b64 = stronghold_types::util::Base64Bytes::encode(serialized).to_string();

    Ok(X402Payload {
        network: network.to_string(),
        scheme: requirements.scheme.clone(),
        payer: signer.pubkey().to_string(),
        receiver: recipient.to_string(),
        token_address: mint.to_string(),
        amount: requirements.amount.clone(),
        timestamp: now_unix()?,
        nonce: recent_blockhash.to_string(),
        signature: None,
        transaction: Some(tx_b64),
    })
}

#[derive(Debug, Deserialize)]
struct GetLatestBlockhashResponse {
    result: Option<GetLatestBlockhashResult>,
    error: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct GetLatestBlockhashResult {
    value: GetLatestBlockhashValue,
}

#[derive(Debug, Deserialize)]
struct GetLatestBlockhashValue {
    blockhash: String,
}

/// Fetches the current blockhash over a marked JSON-RPC POST (§4.7), rather than
/// through `solana-client`'s own `RpcClient`, whose internal transport has no hook
/// for applying `STRONGHOLD_MARK` to its socket.
async fn fetch_latest_blockhash(rpc_url: &str, mark: u32) -> Result<Hash, PaymentsError> {
    let url = Url::parse(rpc_url).map_err(|e| PaymentsError::InvalidAddress(format!("solana rpc url: {e}")))?;
    let body = serde_json::to_vec(&serde_json::json!({
        "jsonrpc": "2.0",
        "id": 1,
        "method": "getLatestBlockhash",
        "params": [{"commitment": "confirmed"}],
    }))
    .map_err(PaymentsError::JsonEncode)?;

    let response = stronghold_net::marked_http::request(
        Method::POST,
        &url,
        &[("content-type", "application/json".to_string())],
        body,
        mark,
        RPC_TIMEOUT,
    )
    .await
    .map_err(|e| PaymentsError::SolanaRpc(e.to_string()))?;

    if response.status != http::StatusCode::OK {
        return Err(PaymentsError::SolanaRpc(format!(
            "getLatestBlockhash returned status {}",
            response.status
        )));
    }

    let parsed: GetLatestBlockhashResponse = serde_json::from_slice(&response.body)
        .map_err(|e| PaymentsError::SolanaRpc(format!("malformed getLatestBlockhash response: {e}")))?;
    if let Some(error) = parsed.error {
        return Err(PaymentsError::SolanaRpc(format!("getLatestBlockhash error: {error}")));
    }
    let result = parsed
        .result
        .ok_or_else(|| PaymentsError::SolanaRpc("getLatestBlockhash response missing result".to_string()))?;
    Hash::from_str(&result.value.blockhash)
        .map_err(|e| PaymentsError::SolanaRpc(format!("invalid blockhash in RPC response: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payload_carries_transaction_not_signature_for_solana() {
        // Construction of the payload shape only; RPC-dependent signing is covered by
        // integration tests against a local validator, out of scope here.
        let payload = X402Payload {
            network: "solana-devnet".into(),
            scheme: "exact".into(),
            payer: Keypair::new().pubkey().to_string(),
            receiver: Keypair::new().pubkey().to_string(),
            token_address: spl_token::id().to_string(),
            amount: "2000".into(),
            timestamp: 1_700_000_000,
            nonce: "blockhash".into(),
            signature: None,
            transaction: Some("base64tx".into()),
        };
        assert!(payload.signature.is_none());
        assert!(payload.transaction.is_some());
    }

    #[tokio::test]
    async fn fetch_latest_blockhash_parses_a_real_rpc_response() {
        use bytes::Bytes;
        use http_body_util::{BodyExt, Full};
        use hyper::service::service_fn;
        use hyper_util::rt::TokioIo;
        use tokio::net::TcpListener;

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let service = service_fn(|_req: hyper::Request<hyper::body::Incoming>| async move {
                let body = serde_json::json!({
                    "jsonrpc": "2.0",
                    "id": 1,
                    "result": {
                        "context": {"slot": 1},
                        "value": {"blockhash": "11111111111111111111111111111111", "lastValidBlockHeight": 1},
                    },
                });
                Ok::<_, std::convert::Infallible>(hyper::Response::new(
                    Full::new(Bytes::from(serde_json::to_vec(&body).unwrap())).boxed(),
                ))
            });
            let _ = hyper::server::conn::http1::Builder::new()
                .serve_connection(TokioIo::new(stream), service)
                .await;
        });

        let rpc_url = format!("http://{addr}");
        let hash = fetch_latest_blockhash(&rpc_url, 0).await.unwrap();
        assert_eq!(hash.to_string(), "11111111111111111111111111111111");
    }

    #[tokio::test]
    async fn fetch_latest_blockhash_surfaces_rpc_error_field() {
        use bytes::Bytes;
        use http_body_util::{BodyExt, Full};
        use hyper::service::service_fn;
        use hyper_util::rt::TokioIo;
        use tokio::net::TcpListener;

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let service = service_fn(|_req: hyper::Request<hyper::body::Incoming>| async move {
                let body = serde_json::json!({
                    "jsonrpc": "2.0",
                    "id": 1,
                    "error": {"code": -32601, "message": "method not found"},
                });
                Ok::<_, std::convert::Infallible>(hyper::Response::new(
                    Full::new(Bytes::from(serde_json::to_vec(&body).unwrap())).boxed(),
                ))
            });
            let _ = hyper::server::conn::http1::Builder::new()
                .serve_connection(TokioIo::new(stream), service)
                .await;
        });

        let rpc_url = format!("http://{addr}");
        let err = fetch_latest_blockhash(&rpc_url, 0).await.unwrap_err();
        assert!(matches!(err, PaymentsError::SolanaRpc(_)));
    }
}
