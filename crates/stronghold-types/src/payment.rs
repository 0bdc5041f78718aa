//! 402 payment requirements and the x402 wire payload (§3, §6.2, §6.5).

use serde::{Deserialize, Serialize};

/// `payment_requirements` carried in a scanner 402 response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentRequirements {
    pub scheme: String,
    pub network: String,
    pub recipient: String,
    /// Integer string, atomic units of the token (microUSDC; 6 decimals).
    pub amount: String,
    pub currency: String,
    pub facilitator_url: String,
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fee_payer: Option<String>,
}

/// 402 response body (§6.2): either a bare `payment_requirements`, or a list of
/// `accepts` when the server supports more than one network.
#[derive(Debug, Clone, Deserialize)]
pub struct PaymentRequiredResponse {
    #[serde(default)]
    pub error: Option<String>,
    pub payment_requirements: PaymentRequirements,
    #[serde(default)]
    pub accepts: Option<Vec<PaymentRequirements>>,
}

impl PaymentRequiredResponse {
    /// Returns the candidate requirements to act on: the first of `accepts` whose
    /// network the caller supports, falling back to the bare `payment_requirements`
    /// when `accepts` is absent.
    pub fn select<'a>(
        &'a self,
        supports: impl Fn(&str) -> bool,
    ) -> Option<&'a PaymentRequirements> {
        match &self.accepts {
            Some(accepts) => accepts.iter().find(|r| supports(&r.network)),
            None => supports(&self.payment_requirements.network)
                .then_some(&self.payment_requirements),
        }
    }
}

/// The signed payload carried base64-encoded in the `X-Payment` header (§3, §6.5).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct X402Payload {
    pub network: String,
    pub scheme: String,
    pub payer: String,
    pub receiver: String,
    pub token_address: String,
    pub amount: String,
    pub timestamp: u64,
    pub nonce: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transaction: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn select_prefers_matching_accepts_entry() {
        let resp = PaymentRequiredResponse {
            error: None,
            payment_requirements: PaymentRequirements {
                scheme: "exact".into(),
                network: "base".into(),
                recipient: "0xabc".into(),
                amount: "2000".into(),
                currency: "USDC".into(),
                facilitator_url: "https://facilitator.example".into(),
                description: "scan".into(),
                fee_payer: None,
            },
            accepts: Some(vec![
                PaymentRequirements {
                    scheme: "exact".into(),
                    network: "solana".into(),
                    recipient: "abc".into(),
                    amount: "2000".into(),
                    currency: "USDC".into(),
                    facilitator_url: "https://facilitator.example".into(),
                    description: "scan".into(),
                    fee_payer: Some("feepayer".into()),
                },
                PaymentRequirements {
                    scheme: "exact".into(),
                    network: "base-sepolia".into(),
                    recipient: "0xabc".into(),
                    amount: "2000".into(),
                    currency: "USDC".into(),
                    facilitator_url: "https://facilitator.example".into(),
                    description: "scan".into(),
                    fee_payer: None,
                },
            ]),
        };
        let selected = resp.select(|n| n == "base-sepolia").unwrap();
        assert_eq!(selected.network, "base-sepolia");
    }

    #[test]
    fn select_falls_back_to_bare_requirements_when_accepts_absent() {
        let resp = PaymentRequiredResponse {
            error: None,
            payment_requirements: PaymentRequirements {
                scheme: "exact".into(),
                network: "base".into(),
                recipient: "0xabc".into(),
                amount: "2000".into(),
                currency: "USDC".into(),
                facilitator_url: "https://facilitator.example".into(),
                description: "scan".into(),
                fee_payer: None,
            },
            accepts: None,
        };
        assert!(resp.select(|n| n == "base").is_some());
        assert!(resp.select(|n| n == "solana").is_none());
    }
}
