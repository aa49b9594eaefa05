use std::collections::HashMap;

use parking_lot::RwLock;

use super::{Database, DbResult};

/// In-memory store. State does not survive a restart, which the services
/// tolerate by construction; a durable backend only needs to implement the
/// same trait.
#[derive(Debug, Default)]
pub struct MemoryDb {
    values: RwLock<HashMap<String, Vec<u8>>>,
}

impl MemoryDb {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl Database for MemoryDb {
    async fn get_raw(&self, key: &str) -> DbResult<Option<Vec<u8>>> {
        Ok(self.values.read().get(key).cloned())
    }

    async fn put_raw(&self, key: &str, value: Vec<u8>) -> DbResult<()> {
        self.values.write().insert(key.to_owned(), value);
        Ok(())
    }

    async fn del(&self, key: &str) -> DbResult<()> {
        self.values.write().remove(key);
        Ok(())
    }

    async fn get_many_raw(&self, keys: &[String]) -> DbResult<Vec<Option<Vec<u8>>>> {
        let values = self.values.read();
        Ok(keys.iter().map(|key| values.get(key).cloned()).collect())
    }

    async fn start(&self) -> DbResult<()> {
        Ok(())
    }

    async fn stop(&self) -> DbResult<()> {
        Ok(())
    }
}
