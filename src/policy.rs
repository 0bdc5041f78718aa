//! Content-type classification, decision-to-action mapping, and the block
//! response body (§4.3, §6.6, §6.7).

use serde::Serialize;
use stronghold_types::{ScanDecision, ScanResult};

use crate::config::{ContentScanConfig, ScanAction};

const SCANNABLE_PREFIXES: &[&str] = &[
    "text/html",
    "text/plain",
    "text/markdown",
    "application/json",
    "application/xml",
    "text/xml",
    "application/javascript",
    "text/javascript",
    "text/css",
];

const BINARY_PREFIXES: &[&str] = &[
    "image/",
    "video/",
    "audio/",
    "application/octet-stream",
    "application/pdf",
    "application/zip",
    "application/gzip",
    "application/x-",
];

/// The maximum body size, in bytes, that is ever handed to the scanner (§4.3).
pub const MAX_SCAN_BODY_BYTES: usize = 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentClass {
    Scannable,
    Binary,
    Unknown,
}

/// Classifies a `Content-Type` header value by case-insensitive prefix match
/// against the fixed tables in §4.3. Parameters (e.g. `; charset=utf-8`) are
/// ignored by virtue of being a prefix match against the bare media type.
pub fn classify_content_type(content_type: &str) -> ContentClass {
    let lower = content_type.trim().to_ascii_lowercase();
    if SCANNABLE_PREFIXES.iter().any(|p| lower.starts_with(p)) {
        ContentClass::Scannable
    } else if BINARY_PREFIXES.iter().any(|p| lower.starts_with(p)) {
        ContentClass::Binary
    } else {
        ContentClass::Unknown
    }
}

/// Why a body was or wasn't scanned, surfaced as `X-Stronghold-Scan-Type` (§6.6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanType {
    Content,
    SkippedUnscannable,
    SkippedOversized,
    Disabled,
}

impl ScanType {
    pub fn as_str(self) -> &'static str {
        match self {
            ScanType::Content => "content",
            ScanType::SkippedUnscannable => "skipped-unscannable",
            ScanType::SkippedOversized => "skipped-oversized",
            ScanType::Disabled => "disabled",
        }
    }
}

/// The outcome of applying policy to a scan (or its absence) for one request or
/// response body: what the proxy actually does, and why, for header injection.
#[derive(Debug, Clone)]
pub struct PolicyOutcome {
    pub action: ScanAction,
    pub scan_type: ScanType,
    pub decision: Option<ScanDecision>,
    pub reason: Option<String>,
    pub score: Option<f64>,
    pub request_id: Option<String>,
    pub recommended_action: Option<String>,
    pub latency_ms: Option<u64>,
}

impl PolicyOutcome {
    pub fn disabled() -> Self {
        Self {
            action: ScanAction::Allow,
            scan_type: ScanType::Disabled,
            decision: None,
            reason: None,
            score: None,
            request_id: None,
            recommended_action: None,
            latency_ms: None,
        }
    }

    pub fn skipped(scan_type: ScanType) -> Self {
        Self {
            action: ScanAction::Allow,
            scan_type,
            decision: None,
            reason: None,
            score: None,
            request_id: None,
            recommended_action: None,
            latency_ms: None,
        }
    }

    /// Maps a scanner verdict through `ScanTypeConfig`'s action table (§4.3):
    /// `ALLOW → allow`, `WARN → action_on_warn`, `BLOCK → action_on_block`.
    pub fn from_scan_result(result: &ScanResult, content: &ContentScanConfig) -> Self {
        let action = match result.decision {
            ScanDecision::Allow => ScanAction::Allow,
            ScanDecision::Warn => content.action_on_warn,
            ScanDecision::Block => content.action_on_block,
        };
        Self {
            action,
            scan_type: ScanType::Content,
            decision: Some(result.decision),
            reason: Some(result.reason.clone()),
            score: non_zero_score(result.combined_score()),
            request_id: result.request_id.clone(),
            recommended_action: result.recommended_action.clone(),
            latency_ms: result.latency_ms,
        }
    }

    /// A scan upstream failure mapped per `fail_open` (§4.3, §7 Scan-upstream):
    /// `true` proceeds as `ALLOW`; `false` blocks with a fixed reason.
    pub fn from_scan_failure(fail_open: bool) -> Self {
        if fail_open {
            Self {
                action: ScanAction::Allow,
                scan_type: ScanType::Content,
                decision: None,
                reason: None,
                score: None,
                request_id: None,
                recommended_action: None,
                latency_ms: None,
            }
        } else {
            Self {
                action: ScanAction::Block,
                scan_type: ScanType::Content,
                decision: Some(ScanDecision::Block),
                reason: Some("Scan failed - blocking for safety".to_string()),
                score: None,
                request_id: None,
                recommended_action: None,
                latency_ms: None,
            }
        }
    }

    pub fn is_block(&self) -> bool {
        self.action == ScanAction::Block
    }

    pub fn is_warn(&self) -> bool {
        self.action == ScanAction::Warn
    }
}

fn non_zero_score(score: f64) -> Option<f64> {
    if score > 0.0 { Some(score) } else { None }
}

/// `ScanDecision` as a response header value (`ALLOW`/`WARN`/`BLOCK`).
pub fn decision_header_value(decision: ScanDecision) -> &'static str {
    match decision {
        ScanDecision::Allow => "ALLOW",
        ScanDecision::Warn => "WARN",
        ScanDecision::Block => "BLOCK",
    }
}

pub fn action_header_value(action: ScanAction) -> &'static str {
    match action {
        ScanAction::Allow => "allow",
        ScanAction::Warn => "warn",
        ScanAction::Block => "block",
    }
}

/// §6.7 JSON block response body.
#[derive(Debug, Serialize)]
pub struct BlockBody<'a> {
    pub error: &'static str,
    pub reason: &'a str,
    pub url: &'a str,
    pub request_id: &'a str,
    pub recommended_action: &'a str,
}

pub const BLOCK_ERROR_MESSAGE: &str = "Content blocked by Stronghold security scan";

impl<'a> BlockBody<'a> {
    pub fn new(reason: &'a str, url: &'a str, request_id: &'a str, recommended_action: &'a str) -> Self {
        Self {
            error: BLOCK_ERROR_MESSAGE,
            reason,
            url,
            request_id,
            recommended_action,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn classifies_scannable_prefixes_case_insensitively() {
        assert_eq!(
            classify_content_type("TEXT/HTML; charset=utf-8"),
            ContentClass::Scannable
        );
        assert_eq!(classify_content_type("application/json"), ContentClass::Scannable);
    }

    #[test]
    fn classifies_binary_prefixes() {
        assert_eq!(classify_content_type("image/png"), ContentClass::Binary);
        assert_eq!(classify_content_type("application/x-protobuf"), ContentClass::Binary);
    }

    #[test]
    fn unknown_content_type_is_neither() {
        assert_eq!(classify_content_type("font/woff2"), ContentClass::Unknown);
    }

    #[test]
    fn policy_mapping_matches_configured_actions() {
        let content = ContentScanConfig {
            enabled: true,
            action_on_warn: ScanAction::Block,
            action_on_block: ScanAction::Warn,
        };
        let warn_result = ScanResult {
            decision: ScanDecision::Warn,
            reason: "suspicious".into(),
            scores: HashMap::new(),
            threats_found: Vec::new(),
            sanitized_text: None,
            recommended_action: None,
            request_id: None,
            latency_ms: None,
            metadata: None,
        };
        let outcome = PolicyOutcome::from_scan_result(&warn_result, &content);
        assert_eq!(outcome.action, ScanAction::Block);

        let block_result = ScanResult {
            decision: ScanDecision::Block,
            ..warn_result
        };
        let outcome = PolicyOutcome::from_scan_result(&block_result, &content);
        assert_eq!(outcome.action, ScanAction::Warn);
    }

    #[test]
    fn scan_failure_respects_fail_open() {
        assert_eq!(PolicyOutcome::from_scan_failure(true).action, ScanAction::Allow);
        assert_eq!(PolicyOutcome::from_scan_failure(false).action, ScanAction::Block);
        assert_eq!(
            PolicyOutcome::from_scan_failure(false).reason.as_deref(),
            Some("Scan failed - blocking for safety")
        );
    }
}
