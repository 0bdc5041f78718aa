//! Persisted payment record (§3, §4.6): the settlement database row shape.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PaymentStatus {
    Reserved,
    Executing,
    Settling,
    Completed,
    Failed,
    Expired,
}

impl PaymentStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            PaymentStatus::Reserved => "reserved",
            PaymentStatus::Executing => "executing",
            PaymentStatus::Settling => "settling",
            PaymentStatus::Completed => "completed",
            PaymentStatus::Failed => "failed",
            PaymentStatus::Expired => "expired",
        }
    }
}

impl std::str::FromStr for PaymentStatus {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "reserved" => Ok(PaymentStatus::Reserved),
            "executing" => Ok(PaymentStatus::Executing),
            "settling" => Ok(PaymentStatus::Settling),
            "completed" => Ok(PaymentStatus::Completed),
            "failed" => Ok(PaymentStatus::Failed),
            "expired" => Ok(PaymentStatus::Expired),
            other => Err(format!("unknown payment status: {other}")),
        }
    }
}

/// A row in the settlement database.
///
/// Invariants (§3): `settlement_attempts <= max_attempts`; `status = settling` implies
/// some worker currently holds the claim; a row in `reserved` past its reservation TTL
/// must transition to `expired`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentRecord {
    pub id: String,
    /// Opaque `X-Payment` header value this record was built from.
    pub payment_header: String,
    pub network: String,
    pub amount: String,
    pub status: PaymentStatus,
    pub settlement_attempts: u32,
    pub executed_at: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}
