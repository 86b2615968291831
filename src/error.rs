//! Error taxonomy for the durable data layer and its callers.
//!
//! Mirrors the error table in spec.md §7: `NotFound` is a normal, unlogged
//! outcome; `BadEncoding` is scoped to the offending record and logged with
//! hex context; `Corruption`/`Io`/`Store` fail the containing operation but
//! never panic the process.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("not found")]
    NotFound,

    #[error("bad encoding in region {region} key {key_hex}: {reason}")]
    BadEncoding {
        region: u64,
        key_hex: String,
        reason: String,
    },

    #[error("store corruption: {0}")]
    Corruption(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("store error: {0}")]
    Store(String),

    #[error("value rejected: {0}")]
    WrongType(String),

    #[error("comparison predicate failed")]
    CmpFail,

    #[error("reconfiguration invalidated this operation")]
    Reconfigure,
}

pub type EngineResult<T> = Result<T, EngineError>;

impl From<sled::Error> for EngineError {
    fn from(e: sled::Error) -> Self {
        match e {
            sled::Error::Corruption { .. } => EngineError::Corruption(e.to_string()),
            sled::Error::Io(io) => EngineError::Io(io),
            other => EngineError::Store(other.to_string()),
        }
    }
}

/// Hex-encode a region/key pair for log context, per spec.md §7's
/// "log BAD_ENCODING with region+key hex" policy.
pub fn hex_key_context(key: &[u8]) -> String {
    hex::encode(key)
}
