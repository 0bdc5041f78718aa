//! Shared, owned process state threaded through every accepted connection
//! (§9 "global mutable counters and loggers → explicit `ProxyState` struct").

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use stronghold_ca::CertCache;
use stronghold_payments::Wallet;
use stronghold_scanner::ScannerClient;
use stronghold_settlement::PaymentStore;

use crate::config::Config;

/// Monotonic request counters (§5 "Shared resources"). Updated with relaxed atomics;
/// nothing here needs to synchronize with anything else.
#[derive(Default)]
pub struct Counters {
    pub requests: AtomicU64,
    pub blocked: AtomicU64,
    pub warned: AtomicU64,
}

impl Counters {
    pub fn record_request(&self) {
        self.requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_blocked(&self) {
        self.blocked.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_warned(&self) {
        self.warned.fetch_add(1, Ordering::Relaxed);
    }
}

pub struct ProxyState {
    pub config: Config,
    pub cert_cache: Arc<CertCache>,
    pub scanner: ScannerClient,
    pub wallet: Option<Wallet>,
    pub settlement: Arc<PaymentStore>,
    pub counters: Counters,
}

impl ProxyState {
    pub fn facilitator_timeout(&self) -> Duration {
        Duration::from_secs(self.config.settlement.facilitator_timeout_secs)
    }

    pub fn mark(&self) -> u32 {
        self.config.mark
    }
}
