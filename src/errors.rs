use std::io;

use thiserror::Error;

/// Errors raised by the transaction engine.
///
/// Every variant maps to a stable code through [`EngineError::code`] so that
/// operators and remote callers can classify failures without parsing the
/// message text. The code prefix encodes the retry class: `PX01` input
/// (never retried), `PX02` transient (retried with backoff), `PX03`
/// reverted, `PX04` endorsement, `PX05` fatal.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("routing failed: {0}")]
    Routing(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("configuration error: {0}")]
    Config(String),
    #[error("verifier unreachable: {0}")]
    VerifierUnreachable(String),
    #[error("operation timed out: {0}")]
    Timeout(String),
    #[error("transient failure: {0}")]
    Transient(String),
    #[error("endorsement failed: {0}")]
    EndorsementFailed(String),
    #[error("assembly reverted: {0}")]
    AssembleReverted(String),
    #[error("transaction reverted on chain")]
    RevertedOnChain { data: Vec<u8> },
    #[error("transaction rejected before chain submission")]
    RejectedPreChain { data: Vec<u8> },
    #[error("invariant violation: {0}")]
    Fatal(String),
    #[error("storage error: {0}")]
    Storage(#[from] rocksdb::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] bincode::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

pub type EngineResult<T> = Result<T, EngineError>;

impl EngineError {
    pub fn code(&self) -> &'static str {
        match self {
            EngineError::InvalidInput(_) => "PX010001",
            EngineError::Routing(_) => "PX010002",
            EngineError::NotFound(_) => "PX010003",
            EngineError::Config(_) => "PX010004",
            EngineError::Json(_) => "PX010005",
            EngineError::VerifierUnreachable(_) => "PX020001",
            EngineError::Timeout(_) => "PX020002",
            EngineError::Transient(_) => "PX020003",
            EngineError::RevertedOnChain { .. } => "PX030001",
            EngineError::RejectedPreChain { .. } => "PX030002",
            EngineError::AssembleReverted(_) => "PX030003",
            EngineError::EndorsementFailed(_) => "PX040001",
            EngineError::Fatal(_) => "PX050001",
            EngineError::Storage(_) => "PX050002",
            EngineError::Serialization(_) => "PX050003",
            EngineError::Io(_) => "PX050004",
        }
    }

    /// Whether the component that owns the operation should retry it.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            EngineError::VerifierUnreachable(_)
                | EngineError::Timeout(_)
                | EngineError::Transient(_)
        )
    }
}
