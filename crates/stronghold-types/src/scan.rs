//! Scan decision (§3, §6.2): the scanner's verdict on a request or response body.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ScanDecision {
    Allow,
    Warn,
    Block,
}

/// The action actually taken, after policy mapping (§4.3). Distinct from [`ScanDecision`]:
/// a `WARN` decision maps to `action_on_warn`, which may itself be `allow` or `block`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScanAction {
    Allow,
    Warn,
    Block,
}

impl std::fmt::Display for ScanAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ScanAction::Allow => "allow",
            ScanAction::Warn => "warn",
            ScanAction::Block => "block",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Threat {
    pub category: String,
    pub pattern: String,
    pub location: String,
    pub severity: String,
    pub description: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanResult {
    pub decision: ScanDecision,
    pub reason: String,
    #[serde(default)]
    pub scores: HashMap<String, f64>,
    #[serde(default)]
    pub threats_found: Vec<Threat>,
    #[serde(default)]
    pub sanitized_text: Option<String>,
    #[serde(default)]
    pub recommended_action: Option<String>,
    #[serde(default)]
    pub request_id: Option<String>,
    #[serde(default)]
    pub latency_ms: Option<u64>,
    #[serde(default)]
    pub metadata: Option<serde_json::Value>,
}

impl ScanResult {
    /// Combined score: the maximum across all reported stage scores, or 0.0 if none.
    pub fn combined_score(&self) -> f64 {
        self.scores.values().cloned().fold(0.0, f64::max)
    }
}
