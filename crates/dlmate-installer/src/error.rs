use std::path::PathBuf;

use thiserror::Error;

use crate::transactions::TransactionStatus;

/// Conditions callers branch on. Everything else travels as a plain
/// `anyhow::Error` with context attached.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("another transaction is in progress (lock held: {})", .path.display())]
    TransactionInProgress { path: PathBuf },
    #[error("transaction '{txid}' cannot move from {from} to {to}")]
    InvalidTransition {
        txid: String,
        from: TransactionStatus,
        to: TransactionStatus,
    },
    #[error("checkpoint '{0}' not found")]
    CheckpointNotFound(String),
    #[error("CUDA {version} is not available for {platform}")]
    UnsupportedVersion { version: String, platform: String },
    #[error("failed to install CUDA {version}: {reason}")]
    InstallFailed { version: String, reason: String },
    #[error("transaction '{txid}' was interrupted")]
    Interrupted { txid: String },
    #[error("CUDA {0} is the active version")]
    VersionActive(String),
}
