//! Persisted payment record store (§3, §4.6, §9 "Long-lived transactions → optimistic
//! claims"): a single SQLite file, one row per payment, claimed with compare-and-set
//! updates rather than held transactions.

use crate::error::SettlementError;
use rusqlite::{Connection, OptionalExtension, params};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};
use stronghold_types::payment::PaymentRequirements;
use stronghold_types::{PaymentRecord, PaymentStatus, X402Payload};

/// Everything the settlement worker needs to rebuild the §6.3 facilitator request,
/// serialized into the record's `payment_header` column (opaque to the schema itself).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SettlementEnvelope {
    pub payload: X402Payload,
    pub requirements: PaymentRequirements,
}

pub fn now_unix() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before unix epoch")
        .as_secs() as i64
}

pub struct PaymentStore {
    conn: Mutex<Connection>,
}

impl PaymentStore {
    pub fn open(path: &Path) -> Result<Self, SettlementError> {
        let conn = Connection::open(path).map_err(|source| SettlementError::Open {
            path: path.display().to_string(),
            source,
        })?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS payments (
                id TEXT PRIMARY KEY,
                payment_header TEXT NOT NULL,
                network TEXT NOT NULL,
                amount TEXT NOT NULL,
                status TEXT NOT NULL,
                settlement_attempts INTEGER NOT NULL,
                executed_at INTEGER NOT NULL,
                last_error TEXT
            );
            CREATE INDEX IF NOT EXISTS payments_status_idx ON payments(status, executed_at);",
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn open_in_memory() -> Result<Self, SettlementError> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(
            "CREATE TABLE payments (
                id TEXT PRIMARY KEY,
                payment_header TEXT NOT NULL,
                network TEXT NOT NULL,
                amount TEXT NOT NULL,
                status TEXT NOT NULL,
                settlement_attempts INTEGER NOT NULL,
                executed_at INTEGER NOT NULL,
                last_error TEXT
            );
            CREATE INDEX payments_status_idx ON payments(status, executed_at);",
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Inserts a fresh `reserved` row for a payment the scanner client just signed
    /// (§4.6, called from the proxy once a 402 retry succeeds).
    pub fn insert_reserved(
        &self,
        id: &str,
        payload: &X402Payload,
        requirements: &PaymentRequirements,
    ) -> Result<(), SettlementError> {
        let envelope = SettlementEnvelope {
            payload: payload.clone(),
            requirements: requirements.clone(),
        };
        let header = serde_json::to_string(&envelope)?;
        let conn = self.conn.lock().expect("settlement db mutex poisoned");
        conn.execute(
            "INSERT INTO payments (id, payment_header, network, amount, status, settlement_attempts, executed_at, last_error)
             VALUES (?1, ?2, ?3, ?4, ?5, 0, ?6, NULL)",
            params![
                id,
                header,
                payload.network,
                payload.amount,
                PaymentStatus::Reserved.as_str(),
                now_unix(),
            ],
        )?;
        Ok(())
    }

    /// Claims a `reserved` row for its first settlement attempt, transitioning it to
    /// `executing`. Returns `false` if another worker already claimed it.
    pub fn try_claim_reserved(&self, id: &str) -> Result<bool, SettlementError> {
        let conn = self.conn.lock().expect("settlement db mutex poisoned");
        let affected = conn.execute(
            "UPDATE payments SET status = ?1 WHERE id = ?2 AND status = ?3",
            params![
                PaymentStatus::Executing.as_str(),
                id,
                PaymentStatus::Reserved.as_str()
            ],
        )?;
        Ok(affected == 1)
    }

    /// Candidate rows for the retry loop: `failed` or `settling`, under the attempt
    /// ceiling, oldest first (§4.6 retry loop).
    pub fn retry_candidates(
        &self,
        max_attempts: u32,
        batch_size: u32,
    ) -> Result<Vec<PaymentRecord>, SettlementError> {
        let conn = self.conn.lock().expect("settlement db mutex poisoned");
        let mut stmt = conn.prepare(
            "SELECT id, payment_header, network, amount, status, settlement_attempts, executed_at, last_error
             FROM payments
             WHERE status IN (?1, ?2) AND settlement_attempts < ?3
             ORDER BY executed_at ASC
             LIMIT ?4",
        )?;
        let rows = stmt
            .query_map(
                params![
                    PaymentStatus::Failed.as_str(),
                    PaymentStatus::Settling.as_str(),
                    max_attempts,
                    batch_size,
                ],
                row_to_record,
            )?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Atomically claims `failed`/`settling` row `id` for a retry attempt: fences on
    /// both the previously-observed status and `settlement_attempts` so two workers
    /// racing the same row never both win (§4.6, §8 property 12, §9).
    pub fn try_claim_for_retry(
        &self,
        id: &str,
        expected_status: PaymentStatus,
        expected_attempts: u32,
    ) -> Result<bool, SettlementError> {
        let conn = self.conn.lock().expect("settlement db mutex poisoned");
        let affected = conn.execute(
            "UPDATE payments SET status = ?1, settlement_attempts = settlement_attempts + 1
             WHERE id = ?2 AND status = ?3 AND settlement_attempts = ?4",
            params![
                PaymentStatus::Settling.as_str(),
                id,
                expected_status.as_str(),
                expected_attempts,
            ],
        )?;
        Ok(affected == 1)
    }

    pub fn mark_completed(&self, id: &str, transaction: &str) -> Result<(), SettlementError> {
        let conn = self.conn.lock().expect("settlement db mutex poisoned");
        conn.execute(
            "UPDATE payments SET status = ?1, last_error = ?2, executed_at = ?3 WHERE id = ?4",
            params![
                PaymentStatus::Completed.as_str(),
                transaction,
                now_unix(),
                id
            ],
        )?;
        Ok(())
    }

    /// Records a settlement failure, returning the row to the `failed` pool
    /// (§7 "Settlement": stays failed until `max_attempts`, never silently dropped).
    pub fn mark_failed(&self, id: &str, error: &str) -> Result<(), SettlementError> {
        let conn = self.conn.lock().expect("settlement db mutex poisoned");
        conn.execute(
            "UPDATE payments SET status = ?1, last_error = ?2, executed_at = ?3 WHERE id = ?4",
            params![PaymentStatus::Failed.as_str(), error, now_unix(), id],
        )?;
        Ok(())
    }

    /// Marks `reserved` rows older than `ttl_secs` as `expired` (§3 invariant (c), §4.6
    /// expiration loop).
    pub fn expire_stale_reservations(&self, ttl_secs: u64) -> Result<usize, SettlementError> {
        let conn = self.conn.lock().expect("settlement db mutex poisoned");
        let cutoff = now_unix() - ttl_secs as i64;
        let affected = conn.execute(
            "UPDATE payments SET status = ?1 WHERE status = ?2 AND executed_at < ?3",
            params![PaymentStatus::Expired.as_str(), PaymentStatus::Reserved.as_str(), cutoff],
        )?;
        Ok(affected)
    }

    pub fn get(&self, id: &str) -> Result<Option<PaymentRecord>, SettlementError> {
        let conn = self.conn.lock().expect("settlement db mutex poisoned");
        let record = conn
            .query_row(
                "SELECT id, payment_header, network, amount, status, settlement_attempts, executed_at, last_error
                 FROM payments WHERE id = ?1",
                params![id],
                row_to_record,
            )
            .optional()?;
        Ok(record)
    }

    pub fn envelope_for(&self, id: &str) -> Result<Option<SettlementEnvelope>, SettlementError> {
        let record = self.get(id)?;
        Ok(match record {
            Some(record) => Some(serde_json::from_str(&record.payment_header)?),
            None => None,
        })
    }
}

fn row_to_record(row: &rusqlite::Row<'_>) -> rusqlite::Result<PaymentRecord> {
    let status: String = row.get(4)?;
    Ok(PaymentRecord {
        id: row.get(0)?,
        payment_header: row.get(1)?,
        network: row.get(2)?,
        amount: row.get(3)?,
        status: status.parse().unwrap_or(PaymentStatus::Failed),
        settlement_attempts: row.get(5)?,
        executed_at: row.get(6)?,
        last_error: row.get(7)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_payload() -> X402Payload {
        X402Payload {
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
        }
    }

    fn sample_requirements() -> PaymentRequirements {
        PaymentRequirements {
            scheme: "exact".into(),
            network: "base-sepolia".into(),
            recipient: "0xdef".into(),
            amount: "2000".into(),
            currency: "USDC".into(),
            facilitator_url: "https://facilitator.example".into(),
            description: "scan".into(),
            fee_payer: None,
        }
    }

    #[test]
    fn insert_and_fetch_roundtrips() {
        let store = PaymentStore::open_in_memory().unwrap();
        store
            .insert_reserved("pay-1", &sample_payload(), &sample_requirements())
            .unwrap();
        let record = store.get("pay-1").unwrap().unwrap();
        assert_eq!(record.status, PaymentStatus::Reserved);
        assert_eq!(record.settlement_attempts, 0);

        let envelope = store.envelope_for("pay-1").unwrap().unwrap();
        assert_eq!(envelope.payload.amount, "2000");
        assert_eq!(envelope.requirements.facilitator_url, "https://facilitator.example");
    }

    #[test]
    fn only_one_worker_wins_the_retry_claim() {
        let store = PaymentStore::open_in_memory().unwrap();
        store
            .insert_reserved("pay-2", &sample_payload(), &sample_requirements())
            .unwrap();
        // Force into the failed pool as if a prior attempt had already run once.
        store.mark_failed("pay-2", "simulated failure").unwrap();
        let record = store.get("pay-2").unwrap().unwrap();
        assert_eq!(record.settlement_attempts, 0);

        let first = store
            .try_claim_for_retry("pay-2", PaymentStatus::Failed, 0)
            .unwrap();
        let second = store
            .try_claim_for_retry("pay-2", PaymentStatus::Failed, 0)
            .unwrap();
        assert!(first);
        assert!(!second);

        let record = store.get("pay-2").unwrap().unwrap();
        assert_eq!(record.status, PaymentStatus::Settling);
        assert_eq!(record.settlement_attempts, 1);
    }

    #[test]
    fn expiration_only_touches_stale_reserved_rows() {
        let store = PaymentStore::open_in_memory().unwrap();
        store
            .insert_reserved("pay-3", &sample_payload(), &sample_requirements())
            .unwrap();
        {
            let conn = store.conn.lock().unwrap();
            conn.execute(
                "UPDATE payments SET executed_at = ?1 WHERE id = 'pay-3'",
                params![now_unix() - 10_000],
            )
            .unwrap();
        }
        let expired = store.expire_stale_reservations(300).unwrap();
        assert_eq!(expired, 1);
        assert_eq!(store.get("pay-3").unwrap().unwrap().status, PaymentStatus::Expired);
    }
}
