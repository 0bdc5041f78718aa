//! Settlement store error taxonomy (§7 "Settlement").

#[derive(Debug, thiserror::Error)]
pub enum SettlementError {
    #[error("failed to open settlement database at {path}: {source}")]
    Open {
        path: String,
        #[source]
        source: rusqlite::Error,
    },
    #[error("settlement database error: {0}")]
    Database(#[from] rusqlite::Error),
    #[error("failed to encode payment record: {0}")]
    Encode(#[from] serde_json::Error),
}
