//! Pipeline error taxonomy.
//!
//! - `TransientIo`: cache or store unreachable / failed. Loops log it and try
//!   again at their next scheduled tick or cycle.
//! - `DataShape`: malformed input (bad filter expression, unparseable range).
//! - `Configuration`: invalid instrument list or periods. Fatal at startup only.

/// Errors crossing the cache, store, sync and stitcher boundaries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PipelineError {
    TransientIo { source: &'static str, detail: String },
    DataShape(String),
    Configuration(String),
}

impl PipelineError {
    pub fn cache(detail: impl Into<String>) -> Self {
        Self::TransientIo {
            source: "cache",
            detail: detail.into(),
        }
    }

    pub fn store(detail: impl Into<String>) -> Self {
        Self::TransientIo {
            source: "store",
            detail: detail.into(),
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, Self::TransientIo { .. })
    }
}

impl std::fmt::Display for PipelineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::TransientIo { source, detail } => write!(f, "{} unavailable: {}", source, detail),
            Self::DataShape(detail) => write!(f, "malformed data: {}", detail),
            Self::Configuration(detail) => write!(f, "invalid configuration: {}", detail),
        }
    }
}

impl std::error::Error for PipelineError {}

/// Best-effort message from a caught panic payload.
pub(crate) fn panic_reason(payload: &(dyn std::any::Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}

impl From<rusqlite::Error> for PipelineError {
    fn from(e: rusqlite::Error) -> Self {
        Self::store(e.to_string())
    }
}
