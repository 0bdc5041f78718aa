//! Configuration for the Stronghold proxy process.

use clap::Parser;
use serde::{Deserialize, Serialize};
use std::fs;
use std::net::SocketAddr;
use std::ops::{Deref, DerefMut};
use std::path::PathBuf;
use std::str::FromStr;
use url::Url;

/// CLI arguments for the proxy process.
#[derive(Parser, Debug)]
#[command(name = "stronghold-proxy")]
#[command(about = "Transparent MITM proxy scanning traffic for prompt injection and credential leaks")]
struct CliArgs {
    /// Path to the JSON configuration file
    #[arg(long, short, env = "CONFIG", default_value = "config.json")]
    config: PathBuf,
}

// ============================================================================
// Environment variable resolution
// ============================================================================

/// A transparent wrapper that resolves environment variables during deserialization.
///
/// Supports both literal values and environment variable references:
/// - Literal: `"0xcafe..."`
/// - Simple env var: `"$STRONGHOLD_EVM_KEY"`
/// - Braced env var: `"${STRONGHOLD_EVM_KEY}"`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LiteralOrEnv<T>(T);

impl<T> LiteralOrEnv<T> {
    pub fn inner(&self) -> &T {
        &self.0
    }

    pub fn into_inner(self) -> T {
        self.0
    }

    fn parse_env_var_syntax(s: &str) -> Option<String> {
        if s.starts_with("${") && s.ends_with('}') {
            Some(s[2..s.len() - 1].to_string())
        } else if s.starts_with('$') && s.len() > 1 {
            let var_name = &s[1..];
            if var_name.chars().all(|c| c.is_alphanumeric() || c == '_') {
                Some(var_name.to_string())
            } else {
                None
            }
        } else {
            None
        }
    }
}

impl<T> Deref for LiteralOrEnv<T> {
    type Target = T;
    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl<T> DerefMut for LiteralOrEnv<T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}

impl<'de, T> Deserialize<'de> for LiteralOrEnv<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        let value = if let Some(var_name) = Self::parse_env_var_syntax(&s) {
            std::env::var(&var_name).map_err(|_| {
                serde::de::Error::custom(format!(
                    "environment variable '{}' not found (referenced as '{}')",
                    var_name, s
                ))
            })?
        } else {
            s
        };
        let parsed = value
            .parse::<T>()
            .map_err(|e| serde::de::Error::custom(format!("failed to parse value: {}", e)))?;
        Ok(LiteralOrEnv(parsed))
    }
}

impl<T> Serialize for LiteralOrEnv<T>
where
    T: Serialize,
{
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        self.0.serialize(serializer)
    }
}

// ============================================================================
// Wallet key types
// ============================================================================

/// A validated EVM private key (32 raw bytes, from a `0x`-prefixed hex string).
#[derive(Clone, Serialize, Deserialize)]
pub struct EvmPrivateKey([u8; 32]);

impl EvmPrivateKey {
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl Drop for EvmPrivateKey {
    fn drop(&mut self) {
        self.0.fill(0);
    }
}

impl std::fmt::Debug for EvmPrivateKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("EvmPrivateKey").field(&"<redacted>").finish()
    }
}

impl PartialEq for EvmPrivateKey {
    fn eq(&self, other: &Self) -> bool {
        self.0 == other.0
    }
}

impl FromStr for EvmPrivateKey {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let hex_str = s.strip_prefix("0x").unwrap_or(s);
        let bytes = hex::decode(hex_str).map_err(|e| format!("invalid evm private key: {}", e))?;
        let arr: [u8; 32] = bytes
            .try_into()
            .map_err(|_| "evm private key must be 32 bytes".to_string())?;
        Ok(Self(arr))
    }
}

/// A validated Solana private key (64 bytes, standard keypair format, base58-encoded).
#[derive(Clone, PartialEq, Eq)]
pub struct SolanaPrivateKey([u8; 64]);

impl SolanaPrivateKey {
    pub fn from_base58(s: &str) -> Result<Self, String> {
        let bytes = bs58::decode(s)
            .into_vec()
            .map_err(|e| format!("invalid base58: {}", e))?;
        if bytes.len() != 64 {
            return Err(format!(
                "private key must be 64 bytes (standard solana keypair format), got {} bytes",
                bytes.len()
            ));
        }
        let mut arr = [0u8; 64];
        arr.copy_from_slice(&bytes);
        Ok(Self(arr))
    }

    pub fn to_base58(&self) -> String {
        bs58::encode(&self.0).into_string()
    }

    pub fn as_bytes(&self) -> &[u8; 64] {
        &self.0
    }
}

impl Drop for SolanaPrivateKey {
    fn drop(&mut self) {
        self.0.fill(0);
    }
}

impl std::fmt::Debug for SolanaPrivateKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("SolanaPrivateKey").field(&"<redacted>").finish()
    }
}

impl Serialize for SolanaPrivateKey {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_base58())
    }
}

impl FromStr for SolanaPrivateKey {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_base58(s)
    }
}

// ============================================================================
// Top-level configuration
// ============================================================================

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default = "config_defaults::default_bind")]
    pub bind: SocketAddr,
    #[serde(default = "config_defaults::default_ca_dir")]
    pub ca_dir: PathBuf,
    #[serde(default = "config_defaults::default_mitm_enabled")]
    pub mitm_enabled: bool,
    #[serde(default)]
    pub cert_cache: CertCacheConfig,
    pub scanner: ScannerConfig,
    #[serde(default)]
    pub wallet: WalletConfig,
    #[serde(default)]
    pub settlement: SettlementConfig,
    #[serde(default = "config_defaults::default_mark")]
    pub mark: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CertCacheConfig {
    #[serde(default = "cert_cache_defaults::default_max_size")]
    pub max_size: usize,
    #[serde(default = "cert_cache_defaults::default_ttl_secs")]
    pub ttl_secs: u64,
    #[serde(default = "cert_cache_defaults::default_eviction_interval_secs")]
    pub eviction_interval_secs: u64,
}

impl Default for CertCacheConfig {
    fn default() -> Self {
        Self {
            max_size: cert_cache_defaults::default_max_size(),
            ttl_secs: cert_cache_defaults::default_ttl_secs(),
            eviction_interval_secs: cert_cache_defaults::default_eviction_interval_secs(),
        }
    }
}

mod cert_cache_defaults {
    pub fn default_max_size() -> usize {
        1024
    }
    pub fn default_ttl_secs() -> u64 {
        3600
    }
    pub fn default_eviction_interval_secs() -> u64 {
        300
    }
}

/// `{allow, warn, block}` action applied on a scan decision, per §3 Scanner configuration.
pub use stronghold_types::ScanAction;

/// Scanning strictness hint forwarded to operators; the proxy itself only consults
/// `block_threshold` and the per-decision action table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScanMode {
    Smart,
    Strict,
    Permissive,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContentScanConfig {
    #[serde(default = "content_scan_defaults::default_enabled")]
    pub enabled: bool,
    #[serde(default = "content_scan_defaults::default_action_on_warn")]
    pub action_on_warn: ScanAction,
    #[serde(default = "content_scan_defaults::default_action_on_block")]
    pub action_on_block: ScanAction,
}

impl Default for ContentScanConfig {
    fn default() -> Self {
        Self {
            enabled: content_scan_defaults::default_enabled(),
            action_on_warn: content_scan_defaults::default_action_on_warn(),
            action_on_block: content_scan_defaults::default_action_on_block(),
        }
    }
}

mod content_scan_defaults {
    use super::ScanAction;
    pub fn default_enabled() -> bool {
        true
    }
    pub fn default_action_on_warn() -> ScanAction {
        ScanAction::Warn
    }
    pub fn default_action_on_block() -> ScanAction {
        ScanAction::Block
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ScannerConfig {
    pub api_base_url: Url,
    #[serde(default)]
    pub auth_token: Option<LiteralOrEnv<String>>,
    #[serde(default = "scanner_defaults::default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default)]
    pub content: ContentScanConfig,
    #[serde(default = "scanner_defaults::default_mode")]
    pub mode: ScanMode,
    #[serde(default = "scanner_defaults::default_block_threshold")]
    pub block_threshold: f64,
    #[serde(default = "scanner_defaults::default_fail_open")]
    pub fail_open: bool,
}

mod scanner_defaults {
    use super::ScanMode;
    pub fn default_timeout_secs() -> u64 {
        10
    }
    pub fn default_mode() -> ScanMode {
        ScanMode::Smart
    }
    pub fn default_block_threshold() -> f64 {
        0.8
    }
    pub fn default_fail_open() -> bool {
        true
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct WalletConfig {
    #[serde(default)]
    pub evm_private_key: Option<LiteralOrEnv<EvmPrivateKey>>,
    #[serde(default)]
    pub solana_private_key: Option<LiteralOrEnv<SolanaPrivateKey>>,
    /// RPC endpoint used to fetch blockhashes when signing the Solana transfer
    /// path (§4.5'). Required only if `solana_private_key` is set.
    #[serde(default)]
    pub solana_rpc_url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SettlementConfig {
    #[serde(default = "settlement_defaults::default_db_path")]
    pub db_path: PathBuf,
    #[serde(default = "settlement_defaults::default_retry_interval_secs")]
    pub retry_interval_secs: u64,
    #[serde(default = "settlement_defaults::default_expiration_interval_secs")]
    pub expiration_interval_secs: u64,
    #[serde(default = "settlement_defaults::default_batch_size")]
    pub batch_size: u32,
    #[serde(default = "settlement_defaults::default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "settlement_defaults::default_reservation_ttl_secs")]
    pub reservation_ttl_secs: u64,
    #[serde(default = "settlement_defaults::default_backoff_base_secs")]
    pub backoff_base_secs: u64,
    #[serde(default = "settlement_defaults::default_backoff_cap_secs")]
    pub backoff_cap_secs: u64,
    #[serde(default = "settlement_defaults::default_facilitator_timeout_secs")]
    pub facilitator_timeout_secs: u64,
}

impl Default for SettlementConfig {
    fn default() -> Self {
        Self {
            db_path: settlement_defaults::default_db_path(),
            retry_interval_secs: settlement_defaults::default_retry_interval_secs(),
            expiration_interval_secs: settlement_defaults::default_expiration_interval_secs(),
            batch_size: settlement_defaults::default_batch_size(),
            max_attempts: settlement_defaults::default_max_attempts(),
            reservation_ttl_secs: settlement_defaults::default_reservation_ttl_secs(),
            backoff_base_secs: settlement_defaults::default_backoff_base_secs(),
            backoff_cap_secs: settlement_defaults::default_backoff_cap_secs(),
            facilitator_timeout_secs: settlement_defaults::default_facilitator_timeout_secs(),
        }
    }
}

mod settlement_defaults {
    use std::path::PathBuf;
    pub fn default_db_path() -> PathBuf {
        PathBuf::from("stronghold-settlement.db")
    }
    pub fn default_retry_interval_secs() -> u64 {
        10
    }
    pub fn default_expiration_interval_secs() -> u64 {
        60
    }
    pub fn default_batch_size() -> u32 {
        50
    }
    pub fn default_max_attempts() -> u32 {
        8
    }
    pub fn default_reservation_ttl_secs() -> u64 {
        300
    }
    pub fn default_backoff_base_secs() -> u64 {
        2
    }
    pub fn default_backoff_cap_secs() -> u64 {
        30
    }
    pub fn default_facilitator_timeout_secs() -> u64 {
        10
    }
}

pub mod config_defaults {
    use std::net::SocketAddr;
    use std::path::PathBuf;

    pub const DEFAULT_BIND: &str = "127.0.0.1:8402";
    pub const STRONGHOLD_MARK: u32 = 0x2702;

    pub fn default_bind() -> SocketAddr {
        std::env::var("STRONGHOLD_BIND")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or_else(|| DEFAULT_BIND.parse().unwrap())
    }

    pub fn default_ca_dir() -> PathBuf {
        std::env::var("STRONGHOLD_CA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./ca"))
    }

    pub fn default_mitm_enabled() -> bool {
        true
    }

    pub fn default_mark() -> u32 {
        STRONGHOLD_MARK
    }
}

/// Configuration error types.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file at {0}: {1}")]
    FileRead(PathBuf, std::io::Error),
    #[error("failed to parse config file: {0}")]
    JsonParse(#[from] serde_json::Error),
}

impl Config {
    /// Loads configuration from CLI arguments (`--config`/`$CONFIG`) and a JSON file.
    ///
    /// Fields absent from the file fall back to environment variables and then to
    /// hardcoded defaults during deserialization; missing/invalid configuration is
    /// always a startup failure, never a request-time one.
    pub fn load() -> Result<Self, ConfigError> {
        let cli_args = CliArgs::parse();
        Self::load_from_path(cli_args.config)
    }

    fn load_from_path(path: PathBuf) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(&path).map_err(|e| ConfigError::FileRead(path, e))?;
        let config: Config = serde_json::from_str(&content)?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn literal_or_env_parses_literal() {
        let json = r#""0xaabbccdd""#;
        #[derive(Deserialize)]
        struct Wrapper(LiteralOrEnv<String>);
        let w: Wrapper = serde_json::from_str(&format!("{}", json)).unwrap();
        assert_eq!(w.0.inner(), "0xaabbccdd");
    }

    #[test]
    fn literal_or_env_resolves_braced_var() {
        unsafe {
            std::env::set_var("STRONGHOLD_TEST_VAR", "resolved");
        }
        let w: LiteralOrEnv<String> = serde_json::from_str(r#""${STRONGHOLD_TEST_VAR}""#).unwrap();
        assert_eq!(w.inner(), "resolved");
    }

    #[test]
    fn evm_private_key_rejects_wrong_length() {
        let err = EvmPrivateKey::from_str("0xdead").unwrap_err();
        assert!(err.contains("32 bytes"));
    }

    #[test]
    fn solana_private_key_roundtrips_base58() {
        let bytes = [7u8; 64];
        let encoded = bs58::encode(&bytes).into_string();
        let key = SolanaPrivateKey::from_base58(&encoded).unwrap();
        assert_eq!(key.to_base58(), encoded);
    }

    #[test]
    fn scanner_config_defaults_apply() {
        let json = r#"{"api_base_url":"https://scan.example.test"}"#;
        let cfg: ScannerConfig = serde_json::from_str(json).unwrap();
        assert_eq!(cfg.timeout_secs, 10);
        assert_eq!(cfg.mode, ScanMode::Smart);
        assert!(cfg.fail_open);
        assert_eq!(cfg.content.action_on_warn, ScanAction::Warn);
        assert_eq!(cfg.content.action_on_block, ScanAction::Block);
    }
}
