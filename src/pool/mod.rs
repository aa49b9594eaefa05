mod entry;
mod error;

pub use entry::MempoolEntry;
pub use error::{MempoolError, MempoolResult};

use std::sync::Arc;

use ethers::types::{Address, H256, U256};
use tracing::warn;

use crate::{
    common::types::{StakeInfo, UserOperation},
    db::{Database, DatabaseExt, DbError},
    reputation::ReputationService,
};

/// The most operations an unstaked sender may have pending at once. A
/// sufficiently staked sender is exempt.
pub const MAX_MEMPOOL_USEROPS_PER_SENDER: usize = 4;

/// Persisted store of pending user operations for one chain.
///
/// There is no internal lock: the keys list is written before the entry on
/// insert and pruned before the entry is deleted on removal, so a crash can
/// only ever leave orphan keys, which `fetch_all` garbage-collects.
#[derive(Debug)]
pub struct MempoolService<D> {
    db: Arc<D>,
    reputation: Arc<ReputationService<D>>,
    chain_id: u64,
}

impl<D: Database> MempoolService<D> {
    pub fn new(db: Arc<D>, reputation: Arc<ReputationService<D>>, chain_id: u64) -> Self {
        Self {
            db,
            reputation,
            chain_id,
        }
    }

    fn keys_key(&self) -> String {
        format!("{}:USEROPKEYS", self.chain_id)
    }

    /// Admits or replaces an operation. Replacement applies when the
    /// (sender, nonce) key is already present and requires a ten percent
    /// bump on both fee fields; admission of a fresh key is subject to the
    /// sender quota unless the sender's stake clears the configured bar.
    pub async fn add_user_op(
        &self,
        user_op: UserOperation,
        entry_point: Address,
        prefund: U256,
        sender_info: &StakeInfo,
        hash: Option<H256>,
        aggregator: Option<Address>,
    ) -> MempoolResult<MempoolEntry> {
        let entry = MempoolEntry::new(
            self.chain_id,
            user_op,
            entry_point,
            prefund,
            aggregator,
            hash,
        );
        let key = entry.key();

        match self.find(&key).await? {
            Some(existing) => {
                if !entry.can_replace(&existing) {
                    return Err(MempoolError::ReplacementUnderpriced);
                }
                self.db.put(&key, &entry).await?;
            }
            None => {
                let mut keys = self.read_keys().await?;
                let prefix =
                    MempoolEntry::sender_prefix(self.chain_id, entry.user_op.sender);
                let sender_count = keys.iter().filter(|k| k.starts_with(&prefix)).count();
                if sender_count >= MAX_MEMPOOL_USEROPS_PER_SENDER {
                    if let Some(reason) = self.reputation.check_stake(sender_info).await? {
                        return Err(MempoolError::MaxOperationsReached {
                            sender: entry.user_op.sender,
                            reason,
                        });
                    }
                }
                keys.push(key.clone());
                self.db.put(&self.keys_key(), &keys).await?;
                self.db.put(&key, &entry).await?;
            }
        }

        self.reputation.update_seen(entry.user_op.sender).await?;
        if let Some(paymaster) = entry.user_op.paymaster() {
            self.reputation.update_seen(paymaster).await?;
        }
        if let Some(aggregator) = entry.aggregator {
            self.reputation.update_seen(aggregator).await?;
        }

        Ok(entry)
    }

    pub async fn remove(&self, entry: &MempoolEntry) -> MempoolResult<()> {
        self.remove_by_key(&entry.key()).await
    }

    pub async fn remove_user_op(&self, user_op: &UserOperation) -> MempoolResult<()> {
        let key = MempoolEntry::key_for(self.chain_id, user_op.sender, user_op.nonce);
        self.remove_by_key(&key).await
    }

    async fn remove_by_key(&self, key: &str) -> MempoolResult<()> {
        let mut keys = self.read_keys().await?;
        keys.retain(|k| k != key);
        self.db.put(&self.keys_key(), &keys).await?;
        self.db.del(key).await?;
        Ok(())
    }

    /// All pending operations, costliest first.
    pub async fn get_sorted_ops(&self) -> MempoolResult<Vec<MempoolEntry>> {
        let mut entries = self.fetch_all().await?;
        entries.sort_by(MempoolEntry::compare_by_cost);
        Ok(entries)
    }

    pub async fn count(&self) -> MempoolResult<usize> {
        Ok(self.read_keys().await?.len())
    }

    pub async fn dump(&self) -> MempoolResult<Vec<MempoolEntry>> {
        self.fetch_all().await
    }

    pub async fn clear_state(&self) -> MempoolResult<()> {
        let keys = self.read_keys().await?;
        self.db.del(&self.keys_key()).await?;
        for key in keys {
            self.db.del(&key).await?;
        }
        Ok(())
    }

    /// Whether an incoming operation would be admitted as new or as a valid
    /// replacement of its stored counterpart.
    pub async fn is_new_or_replacing(
        &self,
        user_op: &UserOperation,
        entry_point: Address,
    ) -> MempoolResult<bool> {
        let key = MempoolEntry::key_for(self.chain_id, user_op.sender, user_op.nonce);
        match self.find(&key).await? {
            None => Ok(true),
            Some(existing) => {
                let candidate = MempoolEntry::new(
                    self.chain_id,
                    user_op.clone(),
                    entry_point,
                    U256::zero(),
                    None,
                    None,
                );
                Ok(candidate.can_replace(&existing))
            }
        }
    }

    async fn find(&self, key: &str) -> MempoolResult<Option<MempoolEntry>> {
        match self.db.get::<MempoolEntry>(key).await {
            Ok(entry) => Ok(Some(entry)),
            Err(DbError::NotFound) => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    async fn read_keys(&self) -> MempoolResult<Vec<String>> {
        match self.db.get::<Vec<String>>(&self.keys_key()).await {
            Ok(keys) => Ok(keys),
            Err(DbError::NotFound) => Ok(vec![]),
            Err(err) => Err(err.into()),
        }
    }

    /// Loads every listed entry. Keys whose value is gone are dropped from
    /// the list on the way.
    async fn fetch_all(&self) -> MempoolResult<Vec<MempoolEntry>> {
        let keys = self.read_keys().await?;
        let slots: Vec<Option<MempoolEntry>> = self.db.get_many(&keys).await?;
        if slots.iter().any(Option::is_none) {
            warn!("Dropping orphan keys from the mempool key list");
            let kept: Vec<String> = keys
                .iter()
                .zip(&slots)
                .filter(|(_, slot)| slot.is_some())
                .map(|(key, _)| key.clone())
                .collect();
            self.db.put(&self.keys_key(), &kept).await?;
        }
        Ok(slots.into_iter().flatten().collect())
    }
}
