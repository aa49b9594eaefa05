use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
    time::Duration,
};

use ethers::types::{Address, H256, U256};
use parking_lot::{Mutex as SyncMutex, RwLock};
use tokio::{
    sync::Mutex,
    task::JoinHandle,
    time::{interval, timeout},
};
use tracing::{error, info, warn};

use crate::{
    common::{
        entry_point::{EntryPointError, EntryPointLike, EntryPointRegistry},
        provider::ProviderLike,
        types::{BundlingMode, UserOperation},
    },
    db::Database,
    pool::{MempoolEntry, MempoolService},
    reputation::{ReputationService, ReputationStatus},
    validation::UserOpValidationService,
};

#[derive(Debug, Clone)]
pub struct BundlerSettings {
    pub relayer: Address,
    pub beneficiary: Option<Address>,
    pub min_signer_balance: U256,
    pub multicall: Option<Address>,
    pub submit_timeout: Duration,
    pub bundle_interval: Duration,
    pub bundle_trigger_size: usize,
    pub mode: BundlingMode,
}

/// Assembles conflict-free bundles from the pool and submits them through
/// the relayer wallet.
///
/// A single async mutex covers the whole of `send_next_bundle`, so bundle
/// creation, submission and the post-mortem never interleave between two
/// callers.
pub struct BundlingService<D, E, P> {
    mempool: Arc<MempoolService<D>>,
    reputation: Arc<ReputationService<D>>,
    validation: Arc<UserOpValidationService<E>>,
    entry_points: Arc<EntryPointRegistry<E>>,
    provider: Arc<P>,
    settings: BundlerSettings,
    mode: RwLock<BundlingMode>,
    bundle_interval: RwLock<Duration>,
    bundle_trigger_size: RwLock<usize>,
    bundle_lock: Mutex<()>,
    cron: SyncMutex<Option<JoinHandle<()>>>,
}

impl<D, E, P> BundlingService<D, E, P>
where
    D: Database,
    E: EntryPointLike,
    P: ProviderLike,
{
    pub fn new(
        mempool: Arc<MempoolService<D>>,
        reputation: Arc<ReputationService<D>>,
        validation: Arc<UserOpValidationService<E>>,
        entry_points: Arc<EntryPointRegistry<E>>,
        provider: Arc<P>,
        settings: BundlerSettings,
    ) -> Self {
        Self {
            mode: RwLock::new(settings.mode),
            bundle_interval: RwLock::new(settings.bundle_interval),
            bundle_trigger_size: RwLock::new(settings.bundle_trigger_size),
            mempool,
            reputation,
            validation,
            entry_points,
            provider,
            settings,
            bundle_lock: Mutex::new(()),
            cron: SyncMutex::new(None),
        }
    }

    /// Spawns the periodic bundling task when the service is in auto mode.
    pub fn start(self: &Arc<Self>) {
        if *self.mode.read() == BundlingMode::Auto {
            self.restart_cron();
        }
    }

    pub fn stop(&self) {
        self.stop_cron();
    }

    pub fn bundling_mode(&self) -> BundlingMode {
        *self.mode.read()
    }

    pub fn set_bundling_mode(self: &Arc<Self>, mode: BundlingMode) {
        *self.mode.write() = mode;
        match mode {
            BundlingMode::Auto => self.restart_cron(),
            BundlingMode::Manual => self.stop_cron(),
        }
        info!("Bundling mode set to {mode}");
    }

    pub fn set_bundle_interval(self: &Arc<Self>, seconds: u64) {
        *self.bundle_interval.write() = Duration::from_secs(seconds);
        if *self.mode.read() == BundlingMode::Auto {
            self.restart_cron();
        }
        info!("Bundle interval set to {seconds}s");
    }

    pub fn set_bundle_trigger_size(self: &Arc<Self>, size: usize) {
        *self.bundle_trigger_size.write() = size;
        if *self.mode.read() == BundlingMode::Auto {
            self.restart_cron();
        }
    }

    fn restart_cron(self: &Arc<Self>) {
        self.stop_cron();
        let service = Arc::clone(self);
        let period = *self.bundle_interval.read();
        let handle = tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                service.try_bundle(true).await;
            }
        });
        *self.cron.lock() = Some(handle);
    }

    fn stop_cron(&self) {
        if let Some(handle) = self.cron.lock().take() {
            handle.abort();
        }
    }

    /// Bundles unconditionally when forced; otherwise only once the pool
    /// has grown past the configured trigger size.
    pub async fn try_bundle(&self, force: bool) {
        if !force {
            match self.mempool.count().await {
                Ok(count) if count < *self.bundle_trigger_size.read() => return,
                Err(err) => {
                    error!("Failed to read mempool size: {err:#}");
                    return;
                }
                _ => {}
            }
        }
        if let Err(err) = self.send_next_bundle().await {
            error!("Failed to send bundle: {err:#}");
        }
    }

    /// Builds the next bundle and submits one `handleOps` transaction per
    /// entry point present in it. Returns the submitted transaction hashes.
    pub async fn send_next_bundle(&self) -> anyhow::Result<Vec<H256>> {
        let _guard = self.bundle_lock.lock().await;
        let bundle = self.create_bundle().await?;
        if bundle.is_empty() {
            return Ok(vec![]);
        }

        let mut groups: Vec<(Address, Vec<MempoolEntry>)> = Vec::new();
        for entry in bundle {
            match groups.iter_mut().find(|(ep, _)| *ep == entry.entry_point) {
                Some((_, group)) => group.push(entry),
                None => groups.push((entry.entry_point, vec![entry])),
            }
        }

        let mut tx_hashes = Vec::new();
        for (_, group) in groups {
            if let Some(tx_hash) = self.send_bundle(group).await? {
                tx_hashes.push(tx_hash);
            }
        }
        Ok(tx_hashes)
    }

    /// One admission pass over a cost-sorted snapshot of the pool. Entries
    /// of banned entities and entries failing a second validation are
    /// purged; skipped entries stay in the pool for a later bundle.
    async fn create_bundle(&self) -> anyhow::Result<Vec<MempoolEntry>> {
        let candidates = self.mempool.get_sorted_ops().await?;
        let mut paymaster_deposit: HashMap<Address, U256> = HashMap::new();
        let mut staked_entity_count: HashMap<Address, u64> = HashMap::new();
        let mut senders: HashSet<Address> = HashSet::new();
        let mut bundle = Vec::new();

        for entry in candidates {
            let paymaster = entry.user_op.paymaster();
            let factory = entry.user_op.factory();

            if let Some(paymaster) = paymaster {
                match self.reputation.get_status(paymaster).await? {
                    ReputationStatus::Banned => {
                        warn!("Purging op of banned paymaster {paymaster:?}");
                        self.mempool.remove(&entry).await?;
                        continue;
                    }
                    ReputationStatus::Throttled
                        if staked_entity_count.get(&paymaster).copied().unwrap_or(0) >= 1 =>
                    {
                        continue;
                    }
                    _ => {}
                }
            }

            if let Some(factory) = factory {
                match self.reputation.get_status(factory).await? {
                    ReputationStatus::Banned => {
                        warn!("Purging op of banned factory {factory:?}");
                        self.mempool.remove(&entry).await?;
                        continue;
                    }
                    ReputationStatus::Throttled
                        if staked_entity_count.get(&factory).copied().unwrap_or(0) >= 1 =>
                    {
                        continue;
                    }
                    _ => {}
                }
            }

            if senders.contains(&entry.user_op.sender) {
                continue;
            }

            let validation = match self
                .validation
                .simulate_complete_validation(&entry.user_op, entry.entry_point)
                .await
            {
                Ok(validation) => validation,
                Err(err) => {
                    warn!("Purging op that failed second validation: {err:#}");
                    self.mempool.remove(&entry).await?;
                    continue;
                }
            };

            if let Some(paymaster) = paymaster {
                let deposit = match paymaster_deposit.get(&paymaster) {
                    Some(deposit) => *deposit,
                    None => {
                        let entry_point = self
                            .entry_points
                            .get(entry.entry_point)
                            .ok_or_else(|| {
                                anyhow::anyhow!("no entry point {:?}", entry.entry_point)
                            })?;
                        let deposit = entry_point.get_deposit(paymaster).await?;
                        paymaster_deposit.insert(paymaster, deposit);
                        deposit
                    }
                };
                let prefund = validation.return_info.prefund;
                if deposit < prefund {
                    // not enough deposit left for this op in this bundle
                    continue;
                }
                paymaster_deposit.insert(paymaster, deposit - prefund);
                *staked_entity_count.entry(paymaster).or_insert(0) += 1;
            }

            if let Some(factory) = factory {
                *staked_entity_count.entry(factory).or_insert(0) += 1;
            }

            senders.insert(entry.user_op.sender);
            bundle.push(entry);
        }

        Ok(bundle)
    }

    /// Submits one `handleOps` for a group of entries sharing an entry
    /// point, then applies the post-mortem: removal and inclusion counters
    /// on success, quarantine or targeted eviction on a `FailedOp` revert.
    async fn send_bundle(&self, bundle: Vec<MempoolEntry>) -> anyhow::Result<Option<H256>> {
        let Some(first) = bundle.first() else {
            return Ok(None);
        };
        let entry_point_address = first.entry_point;
        let entry_point = self
            .entry_points
            .get(entry_point_address)
            .ok_or_else(|| anyhow::anyhow!("no entry point {entry_point_address:?}"))?;
        let beneficiary = self.select_beneficiary().await?;
        let ops: Vec<UserOperation> = bundle.iter().map(|e| e.user_op.clone()).collect();

        info!(
            "Submitting bundle of {} op(s) to entry point {entry_point_address:?}",
            ops.len()
        );
        metrics::increment_counter!("bundler_bundles_submitted");

        let result = match timeout(
            self.settings.submit_timeout,
            entry_point.send_ops(ops.clone(), beneficiary),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => {
                warn!("handleOps submission timed out, dropping bundle");
                metrics::increment_counter!("bundler_bundles_dropped");
                return Ok(None);
            }
        };

        match result {
            Ok(tx_hash) => {
                for entry in &bundle {
                    if let Err(err) = self.mempool.remove(entry).await {
                        error!("Failed to remove bundled op from mempool: {err:#}");
                    }
                    self.record_inclusion(entry).await;
                }
                metrics::increment_counter!("bundler_bundles_sent");
                let user_op_hashes = self.resolve_user_op_hashes(entry_point_address, ops).await;
                info!(
                    "Bundle transaction {tx_hash:?} submitted, user op hashes {user_op_hashes:?}"
                );
                Ok(Some(tx_hash))
            }
            Err(EntryPointError::FailedOp {
                index,
                paymaster,
                reason,
            }) => {
                warn!("handleOps reverted at op {index} (paymaster {paymaster:?}): {reason}");
                metrics::increment_counter!("bundler_bundles_reverted");
                if paymaster != Address::zero() {
                    self.reputation.crashed_handle_ops(paymaster).await?;
                } else if reason.starts_with("AA1") {
                    if let Some(factory) = bundle.get(index).and_then(|e| e.user_op.factory()) {
                        self.reputation.crashed_handle_ops(factory).await?;
                    }
                } else if let Some(entry) = bundle.get(index) {
                    self.mempool.remove(entry).await?;
                }
                Ok(None)
            }
            Err(err) => {
                error!("handleOps submission failed, dropping bundle: {err:#}");
                metrics::increment_counter!("bundler_bundles_dropped");
                Ok(None)
            }
        }
    }

    async fn record_inclusion(&self, entry: &MempoolEntry) {
        let mut entities = vec![entry.user_op.sender];
        entities.extend(entry.user_op.paymaster());
        entities.extend(entry.aggregator);
        for entity in entities {
            if let Err(err) = self.reputation.update_included(entity).await {
                error!("Failed to update inclusion counter for {entity:?}: {err:#}");
            }
        }
    }

    /// The gas refund recipient. Falls back to the relayer itself when no
    /// beneficiary is configured or the relayer is running low and should
    /// refuel on this transaction.
    pub async fn select_beneficiary(&self) -> anyhow::Result<Address> {
        let Some(beneficiary) = self.settings.beneficiary else {
            return Ok(self.settings.relayer);
        };
        let balance = self.provider.get_balance(self.settings.relayer).await?;
        if balance <= self.settings.min_signer_balance {
            info!("Relayer balance {balance} at or below the refuel threshold");
            return Ok(self.settings.relayer);
        }
        Ok(beneficiary)
    }

    /// Hash resolution is observability only: a multicall failure yields an
    /// empty list, never an error.
    async fn resolve_user_op_hashes(
        &self,
        entry_point: Address,
        ops: Vec<UserOperation>,
    ) -> Vec<H256> {
        let Some(multicall) = self.settings.multicall else {
            return vec![];
        };
        match Arc::clone(&self.provider)
            .resolve_user_op_hashes(multicall, entry_point, ops)
            .await
        {
            Ok(hashes) => hashes,
            Err(err) => {
                warn!("Failed to resolve user op hashes: {err:#}");
                vec![]
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        common::{
            entry_point::MockEntryPointLike,
            provider::MockProviderLike,
            types::StakeInfo,
            validation_results::{EntityStake, ValidationOutput, ValidationReturnInfo},
        },
        db::MemoryDb,
        reputation::{ReputationParams, StakeSettings},
    };

    const EP: u8 = 0xee;
    const RELAYER: u8 = 0xcc;

    fn address(n: u8) -> Address {
        let mut bytes = [0_u8; 20];
        bytes[0] = n;
        Address::from(bytes)
    }

    fn validation_output(prefund: u64) -> ValidationOutput {
        ValidationOutput {
            return_info: ValidationReturnInfo {
                pre_op_gas: 50_000.into(),
                prefund: prefund.into(),
                deadline: U256::zero(),
            },
            sender_info: EntityStake::default(),
            factory_info: EntityStake::default(),
            paymaster_info: EntityStake::default(),
            aggregator_info: None,
        }
    }

    fn op(sender: Address, nonce: u64, priority_fee: u64) -> UserOperation {
        UserOperation {
            sender,
            nonce: nonce.into(),
            max_fee_per_gas: 100.into(),
            max_priority_fee_per_gas: priority_fee.into(),
            ..UserOperation::default()
        }
    }

    fn with_paymaster(mut user_op: UserOperation, paymaster: Address) -> UserOperation {
        user_op.paymaster_and_data = paymaster.as_bytes().to_vec().into();
        user_op
    }

    fn with_factory(mut user_op: UserOperation, factory: Address) -> UserOperation {
        user_op.init_code = factory.as_bytes().to_vec().into();
        user_op
    }

    struct Harness {
        mempool: Arc<MempoolService<MemoryDb>>,
        reputation: Arc<ReputationService<MemoryDb>>,
        bundler: Arc<BundlingService<MemoryDb, MockEntryPointLike, MockProviderLike>>,
    }

    fn harness(mut entry_point: MockEntryPointLike, provider: MockProviderLike) -> Harness {
        entry_point.expect_address().return_const(address(EP));
        let db = Arc::new(MemoryDb::new());
        let reputation = Arc::new(ReputationService::new(
            db.clone(),
            1337,
            ReputationParams::default(),
            StakeSettings::default(),
        ));
        let mempool = Arc::new(MempoolService::new(db, reputation.clone(), 1337));
        let registry = Arc::new(EntryPointRegistry::new(vec![entry_point]));
        let validation = Arc::new(UserOpValidationService::new(
            registry.clone(),
            Duration::from_secs(10),
        ));
        let provider = Arc::new(provider);
        let bundler = Arc::new(BundlingService::new(
            mempool.clone(),
            reputation.clone(),
            validation,
            registry,
            provider,
            BundlerSettings {
                relayer: address(RELAYER),
                beneficiary: Some(address(0xbb)),
                min_signer_balance: U256::from(1_000),
                multicall: None,
                submit_timeout: Duration::from_secs(30),
                bundle_interval: Duration::from_secs(15),
                bundle_trigger_size: 2,
                mode: BundlingMode::Manual,
            },
        ));
        Harness {
            mempool,
            reputation,
            bundler,
        }
    }

    async fn seed(harness: &Harness, user_op: UserOperation) {
        let sender_info = StakeInfo {
            address: user_op.sender,
            ..StakeInfo::default()
        };
        harness
            .mempool
            .add_user_op(user_op, address(EP), 1.into(), &sender_info, None, None)
            .await
            .unwrap();
    }

    fn provider_with_balance(balance: u64) -> MockProviderLike {
        let mut provider = MockProviderLike::new();
        provider
            .expect_get_balance()
            .returning(move |_| Ok(balance.into()));
        provider
    }

    #[tokio::test]
    async fn bundle_has_one_op_per_sender() {
        let mut ep = MockEntryPointLike::new();
        ep.expect_simulate_op()
            .returning(|_| Ok(validation_output(1)));
        let harness = harness(ep, MockProviderLike::new());

        let sender = address(1);
        seed(&harness, op(sender, 0, 10)).await;
        seed(&harness, op(sender, 1, 20)).await;
        seed(&harness, op(address(2), 0, 5)).await;

        let bundle = harness.bundler.create_bundle().await.unwrap();
        assert_eq!(bundle.len(), 2);
        let senders: Vec<Address> = bundle.iter().map(|e| e.user_op.sender).collect();
        assert_eq!(senders, vec![sender, address(2)]);
        // the skipped op is not evicted
        assert_eq!(harness.mempool.count().await.unwrap(), 3);
    }

    #[tokio::test]
    async fn throttled_paymaster_contributes_one_op() {
        let mut ep = MockEntryPointLike::new();
        ep.expect_simulate_op()
            .returning(|_| Ok(validation_output(1)));
        ep.expect_get_deposit()
            .returning(|_| Ok(U256::from(1_000_000)));
        let harness = harness(ep, MockProviderLike::new());

        let paymaster = address(0xaa);
        harness
            .reputation
            .set_reputation(paymaster, 200, 5)
            .await
            .unwrap();
        assert_eq!(
            harness.reputation.get_status(paymaster).await.unwrap(),
            ReputationStatus::Throttled
        );

        seed(&harness, with_paymaster(op(address(1), 0, 30), paymaster)).await;
        seed(&harness, with_paymaster(op(address(2), 0, 20), paymaster)).await;
        seed(&harness, with_paymaster(op(address(3), 0, 10), paymaster)).await;

        let bundle = harness.bundler.create_bundle().await.unwrap();
        assert_eq!(bundle.len(), 1);
        // highest priority fee wins the single slot
        assert_eq!(bundle[0].user_op.sender, address(1));
        assert_eq!(harness.mempool.count().await.unwrap(), 3);
    }

    #[tokio::test]
    async fn banned_paymaster_ops_are_purged() {
        let ep = MockEntryPointLike::new();
        let harness = harness(ep, MockProviderLike::new());

        let paymaster = address(0xaa);
        harness
            .reputation
            .crashed_handle_ops(paymaster)
            .await
            .unwrap();

        seed(&harness, with_paymaster(op(address(1), 0, 10), paymaster)).await;
        seed(&harness, with_paymaster(op(address(2), 0, 20), paymaster)).await;

        let bundle = harness.bundler.create_bundle().await.unwrap();
        assert!(bundle.is_empty());
        assert_eq!(harness.mempool.count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn failed_revalidation_purges_the_op() {
        let mut ep = MockEntryPointLike::new();
        ep.expect_simulate_op().returning(|_| {
            Err(EntryPointError::FailedOp {
                index: 0,
                paymaster: Address::zero(),
                reason: "AA23 reverted".to_owned(),
            })
        });
        let harness = harness(ep, MockProviderLike::new());

        seed(&harness, op(address(1), 0, 10)).await;
        let bundle = harness.bundler.create_bundle().await.unwrap();
        assert!(bundle.is_empty());
        assert_eq!(harness.mempool.count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn paymaster_prefund_is_capped_by_deposit() {
        let mut ep = MockEntryPointLike::new();
        ep.expect_simulate_op()
            .returning(|_| Ok(validation_output(1_000)));
        // deposit covers two prefunds, fetched once per bundle
        ep.expect_get_deposit()
            .times(1)
            .returning(|_| Ok(U256::from(2_500)));
        let harness = harness(ep, MockProviderLike::new());

        let paymaster = address(0xaa);
        seed(&harness, with_paymaster(op(address(1), 0, 30), paymaster)).await;
        seed(&harness, with_paymaster(op(address(2), 0, 20), paymaster)).await;
        seed(&harness, with_paymaster(op(address(3), 0, 10), paymaster)).await;

        let bundle = harness.bundler.create_bundle().await.unwrap();
        assert_eq!(bundle.len(), 2);
        // the op that did not fit stays pending
        assert_eq!(harness.mempool.count().await.unwrap(), 3);
    }

    #[tokio::test]
    async fn successful_bundle_clears_pool_and_counts_inclusions() {
        let tx_hash = H256::repeat_byte(0x11);
        let mut ep = MockEntryPointLike::new();
        ep.expect_simulate_op()
            .returning(|_| Ok(validation_output(1)));
        ep.expect_send_ops()
            .times(1)
            .returning(move |_, _| Ok(tx_hash));
        let harness = harness(ep, provider_with_balance(1_000_000));

        let sender = address(1);
        seed(&harness, op(sender, 0, 10)).await;

        let hashes = harness.bundler.send_next_bundle().await.unwrap();
        assert_eq!(hashes, vec![tx_hash]);
        assert_eq!(harness.mempool.count().await.unwrap(), 0);

        let dump = harness.reputation.dump().await.unwrap();
        let sender_entry = dump.iter().find(|(e, _)| e.address == sender).unwrap();
        assert_eq!(sender_entry.0.ops_seen, 1);
        assert_eq!(sender_entry.0.ops_included, 1);
    }

    #[tokio::test]
    async fn failed_op_with_paymaster_quarantines_it() {
        let paymaster = address(0xaa);
        let mut ep = MockEntryPointLike::new();
        ep.expect_simulate_op()
            .returning(|_| Ok(validation_output(1)));
        ep.expect_get_deposit()
            .returning(|_| Ok(U256::from(1_000_000)));
        ep.expect_send_ops().times(1).returning(move |_, _| {
            Err(EntryPointError::FailedOp {
                index: 0,
                paymaster,
                reason: "AA31 paymaster deposit too low".to_owned(),
            })
        });
        let harness = harness(ep, provider_with_balance(1_000_000));

        seed(&harness, with_paymaster(op(address(1), 0, 10), paymaster)).await;

        let hashes = harness.bundler.send_next_bundle().await.unwrap();
        assert!(hashes.is_empty());
        // the op stays pooled, the paymaster is now banned
        assert_eq!(harness.mempool.count().await.unwrap(), 1);
        assert_eq!(
            harness.reputation.get_status(paymaster).await.unwrap(),
            ReputationStatus::Banned
        );
        let dump = harness.reputation.dump().await.unwrap();
        let entry = dump.iter().find(|(e, _)| e.address == paymaster).unwrap();
        assert_eq!(entry.0.ops_seen, 100);
        assert_eq!(entry.0.ops_included, 0);

        // the next bundle purges the quarantined paymaster's op
        let bundle = harness.bundler.create_bundle().await.unwrap();
        assert!(bundle.is_empty());
        assert_eq!(harness.mempool.count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn failed_op_without_paymaster_evicts_the_op() {
        let factory = address(0xf0);
        let mut ep = MockEntryPointLike::new();
        ep.expect_simulate_op()
            .returning(|_| Ok(validation_output(1)));
        ep.expect_send_ops().times(1).returning(|_, _| {
            Err(EntryPointError::FailedOp {
                index: 0,
                paymaster: Address::zero(),
                reason: "AA21 didn't pay prefund".to_owned(),
            })
        });
        let harness = harness(ep, provider_with_balance(1_000_000));

        seed(&harness, with_factory(op(address(1), 0, 10), factory)).await;

        harness.bundler.send_next_bundle().await.unwrap();
        assert_eq!(harness.mempool.count().await.unwrap(), 0);
        // factory reputation is untouched by an AA2x failure
        assert_eq!(
            harness.reputation.get_status(factory).await.unwrap(),
            ReputationStatus::Ok
        );
    }

    #[tokio::test]
    async fn aa1_failure_quarantines_the_factory() {
        let factory = address(0xf0);
        let mut ep = MockEntryPointLike::new();
        ep.expect_simulate_op()
            .returning(|_| Ok(validation_output(1)));
        ep.expect_send_ops().times(1).returning(|_, _| {
            Err(EntryPointError::FailedOp {
                index: 0,
                paymaster: Address::zero(),
                reason: "AA13 initCode failed or OOG".to_owned(),
            })
        });
        let harness = harness(ep, provider_with_balance(1_000_000));

        seed(&harness, with_factory(op(address(1), 0, 10), factory)).await;

        harness.bundler.send_next_bundle().await.unwrap();
        // entry remains, factory is quarantined
        assert_eq!(harness.mempool.count().await.unwrap(), 1);
        assert_eq!(
            harness.reputation.get_status(factory).await.unwrap(),
            ReputationStatus::Banned
        );
    }

    #[tokio::test]
    async fn beneficiary_falls_back_to_relayer_when_low() {
        let ep = MockEntryPointLike::new();
        let harness = harness(ep, provider_with_balance(999));
        assert_eq!(
            harness.bundler.select_beneficiary().await.unwrap(),
            address(RELAYER)
        );

        let ep = MockEntryPointLike::new();
        let harness = harness(ep, provider_with_balance(1_001));
        assert_eq!(
            harness.bundler.select_beneficiary().await.unwrap(),
            address(0xbb)
        );
    }

    #[tokio::test]
    async fn unforced_bundling_waits_for_the_trigger_size() {
        let mut ep = MockEntryPointLike::new();
        ep.expect_simulate_op()
            .returning(|_| Ok(validation_output(1)));
        // send_ops must only be reached once the trigger is met
        ep.expect_send_ops()
            .times(1)
            .returning(|_, _| Ok(H256::repeat_byte(0x22)));
        let harness = harness(ep, provider_with_balance(1_000_000));

        seed(&harness, op(address(1), 0, 10)).await;
        harness.bundler.try_bundle(false).await;
        assert_eq!(harness.mempool.count().await.unwrap(), 1);

        seed(&harness, op(address(2), 0, 10)).await;
        harness.bundler.try_bundle(false).await;
        assert_eq!(harness.mempool.count().await.unwrap(), 0);
    }
}
