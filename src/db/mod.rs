mod memory;

pub use memory::MemoryDb;

use serde::{de::DeserializeOwned, Serialize};

pub type DbResult<T> = std::result::Result<T, DbError>;

#[derive(Debug, thiserror::Error)]
pub enum DbError {
    /// The key does not exist in the store.
    #[error("key not found")]
    NotFound,
    #[error("codec failure: {0}")]
    Codec(#[from] serde_json::Error),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Flat byte-keyed persistence used for mempool and reputation state.
///
/// The production deployment backs this with an embedded store; the crate
/// ships an in-memory implementation which is also what the tests run on.
/// `start`/`stop` bracket whatever durable state the backend holds.
#[async_trait::async_trait]
pub trait Database: Send + Sync + 'static {
    async fn get_raw(&self, key: &str) -> DbResult<Option<Vec<u8>>>;

    async fn put_raw(&self, key: &str, value: Vec<u8>) -> DbResult<()>;

    async fn del(&self, key: &str) -> DbResult<()>;

    /// Values in key order; missing keys yield `None` slots.
    async fn get_many_raw(&self, keys: &[String]) -> DbResult<Vec<Option<Vec<u8>>>>;

    async fn start(&self) -> DbResult<()>;

    async fn stop(&self) -> DbResult<()>;
}

/// Typed access over the raw byte store. Values are encoded as JSON, which
/// round-trips 256-bit integers losslessly as canonical hex strings.
#[async_trait::async_trait]
pub trait DatabaseExt: Database {
    async fn get<T: DeserializeOwned + Send>(&self, key: &str) -> DbResult<T> {
        match self.get_raw(key).await? {
            Some(bytes) => Ok(serde_json::from_slice(&bytes)?),
            None => Err(DbError::NotFound),
        }
    }

    async fn put<T: Serialize + Sync>(&self, key: &str, value: &T) -> DbResult<()> {
        self.put_raw(key, serde_json::to_vec(value)?).await
    }

    async fn get_many<T: DeserializeOwned + Send>(&self, keys: &[String]) -> DbResult<Vec<Option<T>>> {
        let values = self.get_many_raw(keys).await?;
        values
            .into_iter()
            .map(|slot| {
                slot.map(|bytes| serde_json::from_slice(&bytes).map_err(DbError::from))
                    .transpose()
            })
            .collect()
    }
}

impl<D: Database + ?Sized> DatabaseExt for D {}
