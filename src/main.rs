//! Stronghold transparent MITM proxy entrypoint.
//!
//! This binary accepts raw TCP connections redirected to it by the host's
//! firewall (`SO_ORIGINAL_DST` on Linux, a SNI-sniffing fallback elsewhere),
//! classifies each as TLS or plaintext HTTP, and either terminates TLS with a
//! forged per-host leaf certificate to scan the decrypted traffic or forwards
//! plaintext HTTP directly through the same scanning request loop.
//!
//! Environment:
//! - `.env` values loaded at startup
//! - `CONFIG` (or `--config`) points at the JSON configuration file
//! - `OTEL_EXPORTER_OTLP_*` variables enable tracing/metrics export

mod config;
mod deadline;
mod dispatcher;
#[cfg(test)]
mod e2e_tests;
mod http_loop;
mod mitm;
mod policy;
mod sig_down;
mod state;
mod telemetry;

use dotenvy::dotenv;
use std::sync::Arc;
use std::time::Duration;

use sig_down::SigDown;
use state::{Counters, ProxyState};
use stronghold_ca::{CertCache, RootCa};
use stronghold_payments::evm::EvmSigner;
use stronghold_payments::solana::SolanaSigner;
use stronghold_payments::Wallet;
use stronghold_scanner::ScannerClient;
use stronghold_settlement::worker::{self, BackoffConfig, SettlementConfig as WorkerSettlementConfig};
use stronghold_settlement::PaymentStore;
use telemetry::Telemetry;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv().ok();
    let _telemetry = Telemetry::new();

    rustls::crypto::ring::default_provider()
        .install_default()
        .expect("no other crypto provider installed yet");

    let config = config::Config::load()?;

    let root_ca = Arc::new(RootCa::load_or_generate(&config.ca_dir)?);
    let cert_cache = CertCache::new(
        Arc::clone(&root_ca),
        config.cert_cache.max_size,
        Duration::from_secs(config.cert_cache.ttl_secs),
    );

    let wallet = build_wallet(&config.wallet, config.mark)?;
    if wallet.is_none() {
        tracing::warn!("no wallet configured; scans will fail closed on any 402 response");
    }

    let scanner = ScannerClient::new(
        config.scanner.api_base_url.clone(),
        config
            .scanner
            .auth_token
            .as_ref()
            .map(|t| t.inner().clone()),
        Duration::from_secs(config.scanner.timeout_secs),
        config.mark,
        wallet.clone(),
    );

    let settlement = Arc::new(PaymentStore::open(&config.settlement.db_path)?);

    let sig_down = SigDown::try_new()?;
    let shutdown = sig_down.cancellation_token();

    cert_cache.spawn_sweeper(
        Duration::from_secs(config.cert_cache.eviction_interval_secs),
        shutdown.clone(),
    );

    let worker_config = WorkerSettlementConfig {
        retry_interval: Duration::from_secs(config.settlement.retry_interval_secs),
        expiration_interval: Duration::from_secs(config.settlement.expiration_interval_secs),
        batch_size: config.settlement.batch_size,
        max_attempts: config.settlement.max_attempts,
        reservation_ttl_secs: config.settlement.reservation_ttl_secs,
        backoff: BackoffConfig {
            base_secs: config.settlement.backoff_base_secs,
            cap_secs: config.settlement.backoff_cap_secs,
        },
        facilitator_timeout: Duration::from_secs(config.settlement.facilitator_timeout_secs),
        mark: config.mark,
    };
    worker::spawn(Arc::clone(&settlement), worker_config, shutdown.clone());
    worker::spawn_expiration_loop(
        Arc::clone(&settlement),
        Duration::from_secs(config.settlement.expiration_interval_secs),
        config.settlement.reservation_ttl_secs,
        shutdown.clone(),
    );

    let bind = config.bind;
    let state = Arc::new(ProxyState {
        config,
        cert_cache,
        scanner,
        wallet,
        settlement,
        counters: Counters::default(),
    });

    let listener = tokio::net::TcpListener::bind(bind).await.unwrap_or_else(|e| {
        tracing::error!("failed to bind to {}: {}", bind, e);
        std::process::exit(1);
    });
    tracing::info!("stronghold proxy listening on {}", bind);

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, peer) = match accepted {
                    Ok(pair) => pair,
                    Err(e) => {
                        tracing::warn!(error = %e, "failed to accept connection");
                        continue;
                    }
                };
                let state = Arc::clone(&state);
                tokio::spawn(async move { dispatcher::handle_connection(stream, peer, state).await });
            }
            _ = shutdown.cancelled() => {
                tracing::info!("shutdown signal received, no longer accepting connections");
                break;
            }
        }
    }

    Ok(())
}

/// Builds the payment-signing wallet from configuration (§1, §4.5, §4.5'). Either
/// leg is independently optional; a proxy with neither configured can still run
/// with scanning disabled or accept fail-open 402 responses.
fn build_wallet(
    wallet_config: &config::WalletConfig,
    mark: u32,
) -> Result<Option<Wallet>, Box<dyn std::error::Error>> {
    let evm = wallet_config
        .evm_private_key
        .as_ref()
        .map(|key| EvmSigner::from_bytes(key.inner().as_bytes()))
        .transpose()?;

    let solana = match wallet_config.solana_private_key.as_ref() {
        Some(key) => {
            let rpc_url = wallet_config
                .solana_rpc_url
                .clone()
                .ok_or("solana_private_key configured without solana_rpc_url")?;
            let keypair = solana_sdk::signature::Keypair::from_bytes(key.inner().as_bytes().as_slice())
                .map_err(|e| format!("invalid solana keypair: {e}"))?;
            Some(SolanaSigner::new(keypair, rpc_url, mark))
        }
        None => None,
    };

    if evm.is_none() && solana.is_none() {
        return Ok(None);
    }
    Ok(Some(Wallet { evm, solana }))
}
