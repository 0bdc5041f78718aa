//! Settlement worker (§4.6): the retry loop and the expiration loop, each a
//! dedicated long-lived task supervised against panics (§4.6 "panic containment").

use crate::store::PaymentStore;
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use stronghold_payments::facilitator::{FacilitatorClient, build_settle_request};
use stronghold_payments::PaymentsError;
use stronghold_types::PaymentStatus;
use tokio_util::sync::CancellationToken;
use url::Url;

const PANIC_RESTART_DELAY: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy)]
pub struct BackoffConfig {
    pub base_secs: u64,
    pub cap_secs: u64,
}

/// `delay = min(base * 2^attempts, cap) + jitter in [0, delay/2)` (§4.6, §8 property 11).
pub fn backoff_delay(attempts: u32, cfg: BackoffConfig) -> Duration {
    let pow = 2u64.saturating_pow(attempts.min(63));
    let base = cfg.base_secs.saturating_mul(pow).min(cfg.cap_secs);
    let jitter_ceiling = base / 2;
    let jitter = if jitter_ceiling == 0 {
        0
    } else {
        rand::thread_rng().gen_range(0..jitter_ceiling)
    };
    Duration::from_secs(base + jitter)
}

#[derive(Debug, Clone)]
pub struct SettlementConfig {
    pub retry_interval: Duration,
    pub expiration_interval: Duration,
    pub batch_size: u32,
    pub max_attempts: u32,
    pub reservation_ttl_secs: u64,
    pub backoff: BackoffConfig,
    /// Timeout applied to each `/settle` POST. The facilitator base URL itself is not
    /// fixed at startup: it travels with the payment (§6.2's `facilitator_url`), so a
    /// fresh [`FacilitatorClient`] is built per row from its stored requirements.
    pub facilitator_timeout: Duration,
    /// §4.7: the mark applied to every facilitator socket this crate opens.
    pub mark: u32,
}

/// Spawns both settlement loops; each independently restarts after a panic rather
/// than taking down the process.
pub fn spawn(store: Arc<PaymentStore>, config: SettlementConfig, shutdown: CancellationToken) {
    spawn_supervised(
        "settlement-retry-loop",
        shutdown.clone(),
        move |shutdown| {
            let store = Arc::clone(&store);
            let config = config.clone();
            async move { retry_loop(store, config, shutdown).await }
        },
    );
}

/// Spawns the expiration loop separately so it can be wired into a binary that does
/// not (yet) have a facilitator client configured.
pub fn spawn_expiration_loop(
    store: Arc<PaymentStore>,
    interval: Duration,
    ttl_secs: u64,
    shutdown: CancellationToken,
) {
    spawn_supervised("settlement-expiration-loop", shutdown, move |shutdown| {
        let store = Arc::clone(&store);
        async move { expiration_loop(store, interval, ttl_secs, shutdown).await }
    });
}

fn spawn_supervised<F, Fut>(name: &'static str, shutdown: CancellationToken, mut make_fut: F)
where
    F: FnMut(CancellationToken) -> Fut + Send + 'static,
    Fut: std::future::Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        loop {
            if shutdown.is_cancelled() {
                return;
            }
            let child_shutdown = shutdown.clone();
            let handle = tokio::spawn(make_fut(child_shutdown));
            match handle.await {
                Ok(()) => return,
                Err(e) => {
                    tracing::error!(task = name, error = %e, "settlement task panicked, restarting");
                    tokio::time::sleep(PANIC_RESTART_DELAY).await;
                }
            }
        }
    });
}

async fn retry_loop(store: Arc<PaymentStore>, config: SettlementConfig, shutdown: CancellationToken) {
    let mut ticker = tokio::time::interval(config.retry_interval);
    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = shutdown.cancelled() => {
                tracing::debug!("settlement retry loop shutting down");
                return;
            }
        }

        let candidates = match store.retry_candidates(config.max_attempts, config.batch_size) {
            Ok(rows) => rows,
            Err(e) => {
                tracing::warn!(error = %e, "failed to load settlement retry candidates");
                continue;
            }
        };

        for record in candidates {
            let delay = backoff_delay(record.settlement_attempts, config.backoff);
            let age = (crate::store::now_unix() - record.executed_at).max(0) as u64;
            if age < delay.as_secs() {
                continue;
            }

            let claimed = store.try_claim_for_retry(
                &record.id,
                record.status,
                record.settlement_attempts,
            );
            let claimed = match claimed {
                Ok(won) => won,
                Err(e) => {
                    tracing::warn!(error = %e, id = %record.id, "settlement claim query failed");
                    continue;
                }
            };
            if !claimed {
                tracing::debug!(id = %record.id, "settlement claim lost to another worker");
                continue;
            }

            settle_one(&store, &record.id, config.facilitator_timeout, config.mark).await;
        }
    }
}

/// Builds a facilitator request from the row's persisted envelope and POSTs it to
/// *that payment's own* `facilitator_url` (§6.2, §6.3) — not a startup-fixed one,
/// since the 402 response that produced this payment may have named any facilitator.
/// Exposed for reuse by the inline first-settlement attempt the proxy makes right
/// after a scan's payment retry succeeds, so a payment doesn't sit `reserved` for a
/// full `retry_interval` before anyone tries to settle it.
pub async fn settle_one(store: &PaymentStore, id: &str, timeout: Duration, mark: u32) {
    let envelope = match store.envelope_for(id) {
        Ok(Some(envelope)) => envelope,
        Ok(None) => {
            tracing::warn!(id, "claimed settlement row vanished before settle");
            return;
        }
        Err(e) => {
            tracing::warn!(id, error = %e, "failed to load settlement envelope");
            let _ = store.mark_failed(id, &e.to_string());
            return;
        }
    };

    let facilitator_url = match Url::parse(&envelope.requirements.facilitator_url) {
        Ok(url) => url,
        Err(e) => {
            tracing::warn!(id, error = %e, "payment has an unparseable facilitator_url");
            let _ = store.mark_failed(id, &format!("invalid facilitator_url: {e}"));
            return;
        }
    };
    let facilitator = FacilitatorClient::new(facilitator_url, timeout, mark);

    let accepted = serde_json::to_value(&envelope.requirements).unwrap_or(serde_json::Value::Null);
    let request = match build_settle_request(&envelope.payload, &accepted) {
        Ok(request) => request,
        Err(e) => {
            tracing::warn!(id, error = %e, "failed to build facilitator settle request");
            let _ = store.mark_failed(id, &e.to_string());
            return;
        }
    };

    match facilitator.settle(&request).await {
        Ok(response) if response.success => {
            let tx = response.transaction.unwrap_or_default();
            tracing::info!(id, transaction = %tx, "payment settled");
            if let Err(e) = store.mark_completed(id, &tx) {
                tracing::warn!(id, error = %e, "failed to record settlement completion");
            }
        }
        Ok(response) => {
            let reason = response
                .error_reason
                .unwrap_or_else(|| "facilitator rejected settlement".to_string());
            tracing::warn!(id, reason = %reason, "facilitator settle rejected");
            let _ = store.mark_failed(id, &reason);
        }
        Err(e) => {
            tracing::warn!(id, error = %e, "facilitator settle call failed");
            let _ = store.mark_failed(id, &e.to_string());
        }
    }
}

/// Claims a freshly-`reserved` row and makes its first settlement attempt inline,
/// bypassing the retry loop's backoff wait entirely for the common case where the
/// facilitator accepts on the first try. Returns `true` if this caller won the claim.
pub async fn settle_reserved_now(
    store: &PaymentStore,
    id: &str,
    timeout: Duration,
    mark: u32,
) -> Result<bool, PaymentsError> {
    let claimed = store
        .try_claim_reserved(id)
        .map_err(|e| PaymentsError::Signing(e.to_string()))?;
    if !claimed {
        return Ok(false);
    }
    settle_one(store, id, timeout, mark).await;
    Ok(true)
}

async fn expiration_loop(
    store: Arc<PaymentStore>,
    interval: Duration,
    ttl_secs: u64,
    shutdown: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = shutdown.cancelled() => {
                tracing::debug!("settlement expiration loop shutting down");
                return;
            }
        }
        match store.expire_stale_reservations(ttl_secs) {
            Ok(0) => {}
            Ok(n) => tracing::debug!(count = n, "expired stale payment reservations"),
            Err(e) => tracing::warn!(error = %e, "failed to expire stale reservations"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_saturates_at_cap_times_one_point_five() {
        let cfg = BackoffConfig {
            base_secs: 2,
            cap_secs: 30,
        };
        for attempts in 0..10 {
            let delay = backoff_delay(attempts, cfg).as_secs();
            let base = 2u64.saturating_pow(attempts).saturating_mul(2).min(30);
            assert!(delay >= base);
            assert!((delay as f64) < (base.min(30) as f64) * 1.5 + 1.0);
        }
    }

    #[test]
    fn backoff_never_exceeds_cap_times_one_point_five() {
        let cfg = BackoffConfig {
            base_secs: 2,
            cap_secs: 30,
        };
        let delay = backoff_delay(20, cfg).as_secs();
        assert!((delay as f64) < 30.0 * 1.5);
    }
}
