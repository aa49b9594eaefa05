use ethers::types::Address;

use crate::db::DbError;

pub type MempoolResult<T> = std::result::Result<T, MempoolError>;

#[derive(Debug, thiserror::Error)]
pub enum MempoolError {
    /// An operation with the same sender and nonce is already stored and
    /// the replacement does not raise both fees enough.
    #[error("fee too low")]
    ReplacementUnderpriced,
    /// The sender is at its quota and its stake does not buy more slots.
    #[error("{reason}")]
    MaxOperationsReached { sender: Address, reason: String },
    #[error(transparent)]
    Db(#[from] DbError),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}
