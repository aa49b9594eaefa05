use std::cmp::Ordering;

use chrono::Utc;
use ethers::types::{Address, H256, U256};
use serde::{Deserialize, Serialize};

use crate::common::{math, types::UserOperation};

/// Minimum fee bump, in percent, for a replacement to evict a stored
/// operation with the same sender and nonce.
const REPLACEMENT_FEE_INCREASE_PERCENT: u64 = 10;

/// A user operation admitted to the pool, bound to the entry point it was
/// validated against and to the prefund the entry point will reserve.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MempoolEntry {
    pub chain_id: u64,
    pub user_op: UserOperation,
    pub entry_point: Address,
    pub prefund: U256,
    pub aggregator: Option<Address>,
    pub hash: Option<H256>,
    pub last_updated_time: i64,
}

impl MempoolEntry {
    pub fn new(
        chain_id: u64,
        user_op: UserOperation,
        entry_point: Address,
        prefund: U256,
        aggregator: Option<Address>,
        hash: Option<H256>,
    ) -> Self {
        Self {
            chain_id,
            user_op,
            entry_point,
            prefund,
            aggregator,
            hash,
            last_updated_time: Utc::now().timestamp_millis(),
        }
    }

    /// Uniqueness is per (chain, sender, nonce); a second submission under
    /// the same key is a replacement, never a second entry.
    pub fn key(&self) -> String {
        Self::key_for(self.chain_id, self.user_op.sender, self.user_op.nonce)
    }

    pub fn key_for(chain_id: u64, sender: Address, nonce: U256) -> String {
        format!("{chain_id}:{sender:?}:{nonce}")
    }

    /// Prefix shared by every entry of one sender, used for quota counting.
    pub fn sender_prefix(chain_id: u64, sender: Address) -> String {
        format!("{chain_id}:{sender:?}:")
    }

    /// Whether this entry may evict `other`: both fee fields must be bumped
    /// by at least ten percent.
    pub fn can_replace(&self, other: &MempoolEntry) -> bool {
        self.user_op.max_priority_fee_per_gas
            >= math::percent_raise(
                other.user_op.max_priority_fee_per_gas,
                REPLACEMENT_FEE_INCREASE_PERCENT,
            )
            && self.user_op.max_fee_per_gas
                >= math::percent_raise(
                    other.user_op.max_fee_per_gas,
                    REPLACEMENT_FEE_INCREASE_PERCENT,
                )
    }

    /// Orders by priority fee, highest first. Ties keep their relative
    /// order in the snapshot, which is insertion order within one run.
    pub fn compare_by_cost(&self, other: &MempoolEntry) -> Ordering {
        other
            .user_op
            .max_priority_fee_per_gas
            .cmp(&self.user_op.max_priority_fee_per_gas)
    }
}
