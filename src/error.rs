use std::sync::PoisonError;
use thiserror::Error;

use crate::config::ConfigError;

pub type PoolResult<T> = Result<T, PoolError>;

/// Share validation failures. Always recoverable; the code and message are
/// reported back to the submitting miner.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ShareError {
    #[error("incorrect size of extranonce2")]
    IncorrectExtranonce2Size,
    #[error("job not found, got {0}")]
    JobNotFound(String),
    #[error("incorrect size of ntime")]
    IncorrectNtimeSize,
    #[error("ntime out of range")]
    NtimeOutOfRange,
    #[error("incorrect size of nonce")]
    IncorrectNonceSize,
    #[error("extranonce1 does not match the assigned marker")]
    IncorrectExtranonce1,
    #[error("malformed {0}")]
    MalformedField(&'static str),
    #[error("duplicate share")]
    Duplicate,
    #[error("low difficulty share of {0}")]
    LowDifficulty(f64),
}

impl ShareError {
    pub fn code(&self) -> u32 {
        match self {
            ShareError::IncorrectExtranonce2Size
            | ShareError::IncorrectNtimeSize
            | ShareError::NtimeOutOfRange
            | ShareError::IncorrectNonceSize
            | ShareError::IncorrectExtranonce1
            | ShareError::MalformedField(_) => 20,
            ShareError::JobNotFound(_) => 21,
            ShareError::Duplicate => 22,
            ShareError::LowDifficulty(_) => 23,
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SigmaError {
    #[error("invalid secret key: {0}")]
    InvalidKey(String),
    #[error("round count must be greater than 0")]
    NoRounds,
    #[error("round {requested} requested while at round {current}")]
    RoundOutOfOrder { current: usize, requested: usize },
    #[error("all {0} rounds have been consumed")]
    RoundsExhausted(usize),
    #[error("nonce of round {0} already backs a response to a different challenge")]
    NonceAlreadyUsed(usize),
    #[error("point at infinity has no affine coordinates")]
    PointAtInfinity,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("challenge randomness did not arrive within {0} ms")]
    RandomnessTimeout(u128),
    #[error("challenge randomness channel closed before a value was sent")]
    RandomnessChannelClosed,
    #[error("malformed challenge randomness: {0}")]
    MalformedRandomness(String),
    #[error("job manager is not active (state: {0})")]
    NotActive(String),
    #[error("no upstream template has been processed yet")]
    NoTemplate,
    #[error("proof bundle already holds {0} response blocks")]
    BundleFull(usize),
    #[error("proof bundle incomplete: {have} of {need} response blocks")]
    BundleIncomplete { have: usize, need: usize },
    #[error("proof bundle has already been persisted")]
    AlreadyPersisted,
}

#[derive(Error, Debug)]
pub enum PoolError {
    #[error(transparent)]
    Share(#[from] ShareError),
    #[error("sigma protocol: {0}")]
    Sigma(#[from] SigmaError),
    #[error("protocol state: {0}")]
    Protocol(#[from] ProtocolError),
    #[error("invalid block template: {0}")]
    Template(String),
    #[error("merkle tree: {0}")]
    Merkle(String),
    #[error("upstream rpc: {0}")]
    Rpc(String),
    #[error("lock poisoned: {0}")]
    LockPoisoned(String),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Hex(#[from] hex::FromHexError),
    #[error(transparent)]
    Http(#[from] reqwest::Error),
}

impl PoolError {
    /// Stratum error code, present only for share validation failures.
    pub fn share_code(&self) -> Option<u32> {
        match self {
            PoolError::Share(e) => Some(e.code()),
            _ => None,
        }
    }
}

impl<T> From<PoisonError<T>> for PoolError {
    fn from(error: PoisonError<T>) -> Self {
        PoolError::LockPoisoned(error.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn share_error_codes_are_stable() {
        assert_eq!(ShareError::IncorrectExtranonce2Size.code(), 20);
        assert_eq!(ShareError::NtimeOutOfRange.code(), 20);
        assert_eq!(ShareError::MalformedField("nonce").code(), 20);
        assert_eq!(ShareError::IncorrectExtranonce1.code(), 20);
        assert_eq!(ShareError::JobNotFound("a".into()).code(), 21);
        assert_eq!(ShareError::Duplicate.code(), 22);
        assert_eq!(ShareError::LowDifficulty(0.5).code(), 23);
    }

    #[test]
    fn pool_error_exposes_share_code() {
        let err: PoolError = ShareError::Duplicate.into();
        assert_eq!(err.share_code(), Some(22));
        assert_eq!(err.to_string(), "duplicate share");

        let err: PoolError = ProtocolError::NoTemplate.into();
        assert_eq!(err.share_code(), None);
    }
}
