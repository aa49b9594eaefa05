use std::sync::Arc;

use chrono::Utc;
use ethers::types::{Address, U256};
use parse_display::Display;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::{
    common::types::StakeInfo,
    db::{Database, DatabaseExt, DbError},
};

const HOUR_MS: i64 = 60 * 60 * 1000;

#[derive(Display, Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[display(style = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum ReputationStatus {
    Ok,
    Throttled,
    Banned,
}

/// Parameters of the inclusion-rate classification.
#[derive(Debug, Clone, Copy)]
pub struct ReputationParams {
    pub min_inclusion_denominator: u64,
    pub throttling_slack: u64,
    pub ban_slack: u64,
}

impl Default for ReputationParams {
    fn default() -> Self {
        Self {
            min_inclusion_denominator: 10,
            throttling_slack: 10,
            ban_slack: 50,
        }
    }
}

/// Minimum collateral an entity needs before it is exempt from per-sender
/// quotas and eligible for bundling when throttling rules would apply.
#[derive(Debug, Clone, Copy, Default)]
pub struct StakeSettings {
    pub min_stake: U256,
    pub min_unstake_delay: U256,
}

/// Per-address inclusion counters. Counters only ever grow, except for the
/// hourly decay and explicit overwrites from the debug API.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReputationEntry {
    pub chain_id: u64,
    pub address: Address,
    pub ops_seen: u64,
    pub ops_included: u64,
    pub last_update_time: i64,
}

impl ReputationEntry {
    pub fn new(chain_id: u64, address: Address) -> Self {
        Self {
            chain_id,
            address,
            ops_seen: 0,
            ops_included: 0,
            last_update_time: Utc::now().timestamp_millis(),
        }
    }

    pub fn status(&self, params: &ReputationParams) -> ReputationStatus {
        let min_expected_included = self.ops_seen / params.min_inclusion_denominator;
        if min_expected_included <= self.ops_included + params.throttling_slack {
            ReputationStatus::Ok
        } else if min_expected_included <= self.ops_included + params.ban_slack {
            ReputationStatus::Throttled
        } else {
            ReputationStatus::Banned
        }
    }

    /// Applies the hourly decay for every full hour elapsed since the last
    /// update. Keeps long-lived entities from being banned forever.
    pub fn decay(&mut self, now_ms: i64) {
        let hours = (now_ms - self.last_update_time) / HOUR_MS;
        if hours <= 0 {
            return;
        }
        for _ in 0..hours {
            if self.ops_seen == 0 && self.ops_included == 0 {
                break;
            }
            self.ops_seen -= self.ops_seen / 24;
            self.ops_included -= self.ops_included / 24;
        }
        self.last_update_time += hours * HOUR_MS;
    }
}

/// Persisted reputation of senders, paymasters, factories and aggregators,
/// together with the stake checks and the white/blacklists.
///
/// Reads are read-modify-write per address without a lock; a lost increment
/// is acceptable because reputation is approximate and self-correcting.
#[derive(Debug)]
pub struct ReputationService<D> {
    db: Arc<D>,
    chain_id: u64,
    params: ReputationParams,
    stake: StakeSettings,
}

impl<D: Database> ReputationService<D> {
    pub fn new(db: Arc<D>, chain_id: u64, params: ReputationParams, stake: StakeSettings) -> Self {
        Self {
            db,
            chain_id,
            params,
            stake,
        }
    }

    fn list_key(&self) -> String {
        format!("{}:REPUTATION", self.chain_id)
    }

    fn entry_key(&self, address: Address) -> String {
        format!("{}:REPUTATION:{:?}", self.chain_id, address)
    }

    fn whitelist_key(&self) -> String {
        format!("{}:REPUTATION:WL", self.chain_id)
    }

    fn blacklist_key(&self) -> String {
        format!("{}:REPUTATION:BL", self.chain_id)
    }

    pub async fn update_seen(&self, address: Address) -> anyhow::Result<()> {
        let mut entry = self.load(address).await?;
        entry.ops_seen += 1;
        self.store(entry).await
    }

    pub async fn update_included(&self, address: Address) -> anyhow::Result<()> {
        let mut entry = self.load(address).await?;
        entry.ops_included += 1;
        self.store(entry).await
    }

    pub async fn get_status(&self, address: Address) -> anyhow::Result<ReputationStatus> {
        if self.is_blacklisted(address).await? {
            return Ok(ReputationStatus::Banned);
        }
        if self.is_whitelisted(address).await? {
            return Ok(ReputationStatus::Ok);
        }
        Ok(self.load(address).await?.status(&self.params))
    }

    pub async fn set_reputation(
        &self,
        address: Address,
        ops_seen: u64,
        ops_included: u64,
    ) -> anyhow::Result<()> {
        let mut entry = self.load(address).await?;
        entry.ops_seen = ops_seen;
        entry.ops_included = ops_included;
        entry.last_update_time = Utc::now().timestamp_millis();
        self.store(entry).await
    }

    /// Quarantines an entity whose on-chain `handleOps` behavior disagreed
    /// with its off-chain simulation: counters are reset to a crashed
    /// profile and the address is blacklisted so it classifies as banned
    /// from the next lookup on.
    pub async fn crashed_handle_ops(&self, address: Address) -> anyhow::Result<()> {
        info!("Quarantining entity {address:?} after failed handleOps");
        self.set_reputation(address, 100, 0).await?;
        self.add_blacklist(address).await
    }

    /// Returns a rejection reason when the entity's collateral does not
    /// clear the configured bar, `None` when it does. Whitelisted entities
    /// always pass.
    pub async fn check_stake(&self, info: &StakeInfo) -> anyhow::Result<Option<String>> {
        if self.is_whitelisted(info.address).await? {
            return Ok(None);
        }
        if self.get_status(info.address).await? == ReputationStatus::Banned {
            return Ok(Some(format!("entity {:?} is banned", info.address)));
        }
        if info.unstake_delay_sec < self.stake.min_unstake_delay {
            return Ok(Some(format!(
                "entity {:?} unstake delay {} is below the minimum {}",
                info.address, info.unstake_delay_sec, self.stake.min_unstake_delay
            )));
        }
        if info.stake < self.stake.min_stake {
            return Ok(Some(format!(
                "entity {:?} stake {} is below the minimum {}",
                info.address, info.stake, self.stake.min_stake
            )));
        }
        Ok(None)
    }

    pub async fn dump(&self) -> anyhow::Result<Vec<(ReputationEntry, ReputationStatus)>> {
        let addresses: Vec<String> = match self.db.get(&self.list_key()).await {
            Ok(addresses) => addresses,
            Err(DbError::NotFound) => vec![],
            Err(err) => return Err(err.into()),
        };
        let mut entries = Vec::with_capacity(addresses.len());
        for address in addresses {
            let address: Address = address
                .parse()
                .map_err(|_| anyhow::anyhow!("bad address {address} in reputation list"))?;
            let entry = self.load(address).await?;
            let status = self.get_status(address).await?;
            entries.push((entry, status));
        }
        Ok(entries)
    }

    pub async fn add_whitelist(&self, address: Address) -> anyhow::Result<()> {
        self.add_to_list(&self.whitelist_key(), address).await
    }

    pub async fn remove_whitelist(&self, address: Address) -> anyhow::Result<()> {
        self.remove_from_list(&self.whitelist_key(), address).await
    }

    pub async fn is_whitelisted(&self, address: Address) -> anyhow::Result<bool> {
        self.list_contains(&self.whitelist_key(), address).await
    }

    pub async fn add_blacklist(&self, address: Address) -> anyhow::Result<()> {
        self.add_to_list(&self.blacklist_key(), address).await
    }

    pub async fn remove_blacklist(&self, address: Address) -> anyhow::Result<()> {
        self.remove_from_list(&self.blacklist_key(), address).await
    }

    pub async fn is_blacklisted(&self, address: Address) -> anyhow::Result<bool> {
        self.list_contains(&self.blacklist_key(), address).await
    }

    async fn load(&self, address: Address) -> anyhow::Result<ReputationEntry> {
        let mut entry = match self.db.get::<ReputationEntry>(&self.entry_key(address)).await {
            Ok(entry) => entry,
            Err(DbError::NotFound) => ReputationEntry::new(self.chain_id, address),
            Err(err) => return Err(err.into()),
        };
        entry.decay(Utc::now().timestamp_millis());
        Ok(entry)
    }

    async fn store(&self, entry: ReputationEntry) -> anyhow::Result<()> {
        let mut addresses: Vec<String> = match self.db.get(&self.list_key()).await {
            Ok(addresses) => addresses,
            Err(DbError::NotFound) => vec![],
            Err(err) => return Err(err.into()),
        };
        let formatted = format!("{:?}", entry.address);
        if !addresses.iter().any(|a| a.eq_ignore_ascii_case(&formatted)) {
            addresses.push(formatted);
            self.db.put(&self.list_key(), &addresses).await?;
        }
        self.db.put(&self.entry_key(entry.address), &entry).await?;
        Ok(())
    }

    async fn read_list(&self, key: &str) -> anyhow::Result<Vec<String>> {
        match self.db.get(key).await {
            Ok(list) => Ok(list),
            Err(DbError::NotFound) => Ok(vec![]),
            Err(err) => Err(err.into()),
        }
    }

    async fn add_to_list(&self, key: &str, address: Address) -> anyhow::Result<()> {
        let mut list = self.read_list(key).await?;
        let formatted = format!("{address:?}");
        if !list.iter().any(|a| a.eq_ignore_ascii_case(&formatted)) {
            list.push(formatted);
            self.db.put(key, &list).await?;
        }
        Ok(())
    }

    async fn remove_from_list(&self, key: &str, address: Address) -> anyhow::Result<()> {
        let mut list = self.read_list(key).await?;
        let formatted = format!("{address:?}");
        list.retain(|a| !a.eq_ignore_ascii_case(&formatted));
        self.db.put(key, &list).await?;
        Ok(())
    }

    async fn list_contains(&self, key: &str, address: Address) -> anyhow::Result<bool> {
        let list = self.read_list(key).await?;
        let formatted = format!("{address:?}");
        Ok(list.iter().any(|a| a.eq_ignore_ascii_case(&formatted)))
    }
}
