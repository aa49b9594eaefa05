use std::sync::Arc;

use anyhow::{anyhow, bail, Context};
use ethers::{
    abi::AbiDecode,
    contract::EthLogDecode,
    types::{Address, Bytes, Filter, Log, H256, U256, U64},
    utils::to_checksum,
};
use jsonrpsee::{
    core::{async_trait, RpcResult},
    proc_macros::rpc,
};

use super::{GasEstimate, RichUserOperation, RpcError, RpcUserOperation, UserOperationReceipt};
use crate::{
    common::{
        contracts::{IEntryPointCalls, UserOperationEventFilter},
        entry_point::{EntryPointLike, EntryPointRegistry},
        eth::log_to_raw_log,
        gas,
        provider::ProviderLike,
        types::UserOperation,
    },
    db::Database,
    pool::MempoolService,
    validation::UserOpValidationService,
};

/// Verification gas limit substituted into the fee-less simulation run
/// during gas estimation.
const ESTIMATION_VERIFICATION_GAS_LIMIT: u64 = 10_000_000;

/// Eth API
#[rpc(server, namespace = "eth")]
pub trait EthApi {
    #[method(name = "sendUserOperation")]
    async fn send_user_operation(
        &self,
        op: RpcUserOperation,
        entry_point: Address,
    ) -> RpcResult<H256>;

    #[method(name = "estimateUserOperationGas")]
    async fn estimate_user_operation_gas(
        &self,
        op: RpcUserOperation,
        entry_point: Address,
    ) -> RpcResult<GasEstimate>;

    #[method(name = "getUserOperationByHash")]
    async fn get_user_operation_by_hash(&self, hash: H256) -> RpcResult<Option<RichUserOperation>>;

    #[method(name = "getUserOperationReceipt")]
    async fn get_user_operation_receipt(
        &self,
        hash: H256,
    ) -> RpcResult<Option<UserOperationReceipt>>;

    #[method(name = "supportedEntryPoints")]
    async fn supported_entry_points(&self) -> RpcResult<Vec<String>>;

    #[method(name = "chainId")]
    async fn chain_id(&self) -> RpcResult<U64>;

    #[method(name = "validateUserOperation")]
    async fn validate_user_operation(
        &self,
        op: RpcUserOperation,
        entry_point: Address,
    ) -> RpcResult<bool>;
}

/// RPC-facing orchestration of the submit, estimate and lookup paths.
pub struct EthApi<D, E, P> {
    chain_id: u64,
    mempool: Arc<MempoolService<D>>,
    validation: Arc<UserOpValidationService<E>>,
    entry_points: Arc<EntryPointRegistry<E>>,
    provider: Arc<P>,
}

impl<D, E, P> EthApi<D, E, P>
where
    D: Database,
    E: EntryPointLike,
    P: ProviderLike,
{
    pub fn new(
        chain_id: u64,
        mempool: Arc<MempoolService<D>>,
        validation: Arc<UserOpValidationService<E>>,
        entry_points: Arc<EntryPointRegistry<E>>,
        provider: Arc<P>,
    ) -> Self {
        Self {
            chain_id,
            mempool,
            validation,
            entry_points,
            provider,
        }
    }

    fn require_entry_point(&self, entry_point: Address) -> Result<&E, RpcError> {
        self.entry_points.get(entry_point).ok_or_else(|| {
            RpcError::InvalidRequest(format!("unsupported entry point {entry_point:?}"))
        })
    }

    async fn find_user_operation_event(&self, hash: H256) -> anyhow::Result<Option<Log>> {
        let filter = Filter::new()
            .address(self.entry_points.addresses())
            .topic1(hash);
        let logs = self.provider.get_logs(&filter).await?;
        Ok(logs.into_iter().next())
    }

    fn user_operations_from_tx_data(&self, tx_data: &Bytes) -> anyhow::Result<Vec<UserOperation>> {
        match IEntryPointCalls::decode(tx_data)
            .context("should parse tx data as calls to the entry point")?
        {
            IEntryPointCalls::HandleOps(call) => Ok(call.ops),
            _ => bail!("transaction does not carry user operations"),
        }
    }
}

#[async_trait]
impl<D, E, P> EthApiServer for EthApi<D, E, P>
where
    D: Database,
    E: EntryPointLike,
    P: ProviderLike,
{
    async fn send_user_operation(
        &self,
        op: RpcUserOperation,
        entry_point: Address,
    ) -> RpcResult<H256> {
        let op: UserOperation = op.into();
        let ep = self.require_entry_point(entry_point)?;

        let result = self
            .validation
            .simulate_complete_validation(&op, entry_point)
            .await
            .map_err(RpcError::from)?;
        let hash = ep.user_op_hash(op.clone()).await.map_err(RpcError::Internal)?;

        self.mempool
            .add_user_op(
                op,
                entry_point,
                result.return_info.prefund,
                &result.sender_info,
                Some(hash),
                result.aggregator_info.as_ref().map(|a| a.address),
            )
            .await
            .map_err(RpcError::from)?;

        Ok(hash)
    }

    async fn estimate_user_operation_gas(
        &self,
        op: RpcUserOperation,
        entry_point: Address,
    ) -> RpcResult<GasEstimate> {
        let op: UserOperation = op.into();
        self.require_entry_point(entry_point)?;

        // simulate a fee-less copy so no payment is attempted
        let mut sim_op = op.clone();
        sim_op.max_fee_per_gas = U256::zero();
        sim_op.max_priority_fee_per_gas = U256::zero();
        sim_op.pre_verification_gas = U256::zero();
        sim_op.verification_gas_limit = ESTIMATION_VERIFICATION_GAS_LIMIT.into();
        sim_op.paymaster_and_data = Bytes::default();

        let output = self
            .validation
            .call_simulate_validation(&sim_op, entry_point)
            .await
            .map_err(RpcError::from)?;

        let call_gas_limit = self
            .provider
            .estimate_call_gas(entry_point, op.sender, op.call_data.clone())
            .await
            .map_err(RpcError::Internal)?;

        let deadline = output.return_info.deadline;
        Ok(GasEstimate {
            pre_verification_gas: gas::calc_pre_verification_gas(&op),
            verification_gas: output.return_info.pre_op_gas,
            call_gas_limit,
            deadline: (!deadline.is_zero()).then_some(deadline),
        })
    }

    async fn get_user_operation_by_hash(&self, hash: H256) -> RpcResult<Option<RichUserOperation>> {
        if hash == H256::zero() {
            return Err(RpcError::InvalidRequest("hash cannot be zero".to_owned()).into());
        }

        let Some(event_log) = self
            .find_user_operation_event(hash)
            .await
            .map_err(RpcError::Internal)?
        else {
            return Ok(None);
        };

        let transaction_hash = event_log
            .transaction_hash
            .ok_or_else(|| RpcError::Internal(anyhow!("event log has no transaction hash")))?;

        let tx = self
            .provider
            .get_transaction(transaction_hash)
            .await
            .map_err(RpcError::Internal)?
            .ok_or_else(|| RpcError::Internal(anyhow!("transaction should exist")))?;

        let entry_point = match tx.to {
            Some(to) if self.entry_points.is_supported(to) => to,
            _ => {
                return Err(
                    RpcError::Internal(anyhow!("transaction was not sent to an entry point"))
                        .into(),
                )
            }
        };

        let event = UserOperationEventFilter::decode_log(&log_to_raw_log(&event_log))
            .map_err(|err| RpcError::Internal(anyhow!("bad user operation event: {err}")))?;

        let user_operation = self
            .user_operations_from_tx_data(&tx.input)
            .map_err(RpcError::Internal)?
            .into_iter()
            .find(|op| op.sender == event.sender && op.nonce == event.nonce)
            .ok_or_else(|| {
                RpcError::Internal(anyhow!("no matching operation in transaction data"))
            })?;

        Ok(Some(RichUserOperation {
            user_operation: user_operation.into(),
            entry_point,
            transaction_hash,
            block_hash: tx.block_hash.unwrap_or_default(),
            block_number: tx
                .block_number
                .map(|n| U256::from(n.as_u64()))
                .unwrap_or_default(),
        }))
    }

    async fn get_user_operation_receipt(
        &self,
        hash: H256,
    ) -> RpcResult<Option<UserOperationReceipt>> {
        if hash == H256::zero() {
            return Err(RpcError::InvalidRequest("hash cannot be zero".to_owned()).into());
        }

        let Some(event_log) = self
            .find_user_operation_event(hash)
            .await
            .map_err(RpcError::Internal)?
        else {
            return Ok(None);
        };

        let transaction_hash = event_log
            .transaction_hash
            .ok_or_else(|| RpcError::Internal(anyhow!("event log has no transaction hash")))?;

        let Some(receipt) = self
            .provider
            .get_transaction_receipt(transaction_hash)
            .await
            .map_err(RpcError::Internal)?
        else {
            return Ok(None);
        };

        let event = UserOperationEventFilter::decode_log(&log_to_raw_log(&event_log))
            .map_err(|err| RpcError::Internal(anyhow!("bad user operation event: {err}")))?;

        let logs = filter_receipt_logs(&event_log, &receipt.logs).map_err(RpcError::Internal)?;

        Ok(Some(UserOperationReceipt {
            user_op_hash: hash,
            entry_point: event_log.address,
            sender: event.sender,
            nonce: event.nonce,
            paymaster: event.paymaster,
            actual_gas_cost: event.actual_gas_cost,
            actual_gas_used: event.actual_gas_used,
            success: event.success,
            logs,
            receipt,
        }))
    }

    async fn supported_entry_points(&self) -> RpcResult<Vec<String>> {
        Ok(self
            .entry_points
            .addresses()
            .into_iter()
            .map(|address| to_checksum(&address, None))
            .collect())
    }

    async fn chain_id(&self) -> RpcResult<U64> {
        Ok(self.chain_id.into())
    }

    async fn validate_user_operation(
        &self,
        op: RpcUserOperation,
        entry_point: Address,
    ) -> RpcResult<bool> {
        let op: UserOperation = op.into();
        self.require_entry_point(entry_point)?;

        if !self
            .mempool
            .is_new_or_replacing(&op, entry_point)
            .await
            .map_err(RpcError::from)?
        {
            return Err(RpcError::FeeTooLow("fee too low".to_owned()).into());
        }

        self.validation
            .simulate_complete_validation(&op, entry_point)
            .await
            .map_err(RpcError::from)?;

        Ok(true)
    }
}

/// Slices the receipt's logs down to the ones emitted for this operation:
/// everything after the previous operation's `UserOperationEvent` (same
/// topic0, different topic1) up to, but excluding, this operation's own
/// event.
fn filter_receipt_logs(event_log: &Log, logs: &[Log]) -> anyhow::Result<Vec<Log>> {
    let topic0 = *event_log
        .topics
        .first()
        .context("event log should have a signature topic")?;
    let topic1 = *event_log
        .topics
        .get(1)
        .context("event log should have a hash topic")?;

    let mut start_index = None;
    let mut end_index = None;
    for (index, log) in logs.iter().enumerate() {
        if log.topics.first() != Some(&topic0) {
            continue;
        }
        if log.topics.get(1) == Some(&topic1) {
            end_index = Some(index);
        } else if end_index.is_none() {
            start_index = Some(index);
        }
    }
    let Some(end_index) = end_index else {
        bail!("user operation event not found in receipt logs");
    };
    let start = start_index.map_or(0, |index| index + 1);
    Ok(logs[start..end_index].to_vec())
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::{
        common::{
            entry_point::MockEntryPointLike,
            provider::MockProviderLike,
            validation_results::{EntityStake, ValidationOutput, ValidationReturnInfo},
        },
        db::MemoryDb,
        reputation::{ReputationParams, ReputationService, StakeSettings},
    };

    fn address(n: u8) -> Address {
        let mut bytes = [0_u8; 20];
        bytes[0] = n;
        Address::from(bytes)
    }

    fn hash(n: u8) -> H256 {
        H256::repeat_byte(n)
    }

    fn log_with_topics(topics: Vec<H256>) -> Log {
        Log {
            topics,
            ..Log::default()
        }
    }

    #[test]
    fn receipt_logs_sliced_between_events() {
        let sig = hash(0xe0);
        let this_op = hash(1);
        let prev_op = hash(2);
        let other_event = hash(0xe1);
        let logs = vec![
            log_with_topics(vec![other_event]),            // 0: unrelated
            log_with_topics(vec![sig, prev_op]),           // 1: previous op's event
            log_with_topics(vec![other_event]),            // 2: belongs to this op
            log_with_topics(vec![other_event, hash(9)]),   // 3: belongs to this op
            log_with_topics(vec![sig, this_op]),           // 4: this op's event
            log_with_topics(vec![other_event]),            // 5: next op's logs
        ];
        let sliced = filter_receipt_logs(&logs[4], &logs).unwrap();
        assert_eq!(sliced, logs[2..4].to_vec());
    }

    #[test]
    fn receipt_logs_from_start_when_first_op() {
        let sig = hash(0xe0);
        let this_op = hash(1);
        let logs = vec![
            log_with_topics(vec![hash(0xe1)]),
            log_with_topics(vec![sig, this_op]),
        ];
        let sliced = filter_receipt_logs(&logs[1], &logs).unwrap();
        assert_eq!(sliced, logs[0..1].to_vec());
    }

    #[test]
    fn receipt_logs_require_the_event() {
        let sig = hash(0xe0);
        let this_op = hash(1);
        let reference = log_with_topics(vec![sig, this_op]);
        let logs = vec![log_with_topics(vec![hash(0xe1)])];
        assert!(filter_receipt_logs(&reference, &logs).is_err());
    }

    fn validation_output() -> ValidationOutput {
        ValidationOutput {
            return_info: ValidationReturnInfo {
                pre_op_gas: 60_000.into(),
                prefund: 1_000.into(),
                deadline: U256::zero(),
            },
            sender_info: EntityStake::default(),
            factory_info: EntityStake::default(),
            paymaster_info: EntityStake::default(),
            aggregator_info: None,
        }
    }

    fn api(
        mut entry_point: MockEntryPointLike,
        provider: MockProviderLike,
    ) -> EthApi<MemoryDb, MockEntryPointLike, MockProviderLike> {
        entry_point.expect_address().return_const(address(0xee));
        let db = Arc::new(MemoryDb::new());
        let reputation = Arc::new(ReputationService::new(
            db.clone(),
            1337,
            ReputationParams::default(),
            StakeSettings::default(),
        ));
        let mempool = Arc::new(MempoolService::new(db, reputation, 1337));
        let registry = Arc::new(EntryPointRegistry::new(vec![entry_point]));
        let validation = Arc::new(UserOpValidationService::new(
            registry.clone(),
            Duration::from_secs(10),
        ));
        EthApi::new(1337, mempool, validation, registry, Arc::new(provider))
    }

    #[tokio::test]
    async fn send_admits_to_pool_and_returns_hash() {
        let op_hash = hash(0x42);
        let mut ep = MockEntryPointLike::new();
        ep.expect_simulate_op()
            .returning(|_| Ok(validation_output()));
        ep.expect_user_op_hash().returning(move |_| Ok(op_hash));
        let api = api(ep, MockProviderLike::new());

        let op = RpcUserOperation::from(UserOperation {
            sender: address(1),
            max_fee_per_gas: 100.into(),
            max_priority_fee_per_gas: 10.into(),
            ..UserOperation::default()
        });
        let got = api.send_user_operation(op, address(0xee)).await.unwrap();
        assert_eq!(got, op_hash);
        assert_eq!(api.mempool.count().await.unwrap(), 1);
        let entry = &api.mempool.dump().await.unwrap()[0];
        assert_eq!(entry.hash, Some(op_hash));
        assert_eq!(entry.prefund, U256::from(1_000));
    }

    #[tokio::test]
    async fn send_rejects_unknown_entry_point() {
        let api = api(MockEntryPointLike::new(), MockProviderLike::new());
        let op = RpcUserOperation::from(UserOperation::default());
        let err = api.send_user_operation(op, address(0x99)).await.unwrap_err();
        assert!(err.to_string().contains("unsupported entry point"));
    }

    #[tokio::test]
    async fn estimate_combines_simulation_and_call_gas() {
        let mut ep = MockEntryPointLike::new();
        ep.expect_simulate_op()
            .withf(|op| {
                op.max_fee_per_gas.is_zero()
                    && op.max_priority_fee_per_gas.is_zero()
                    && op.pre_verification_gas.is_zero()
                    && op.verification_gas_limit
                        == U256::from(ESTIMATION_VERIFICATION_GAS_LIMIT)
                    && op.paymaster_and_data.is_empty()
            })
            .returning(|_| Ok(validation_output()));
        let mut provider = MockProviderLike::new();
        provider
            .expect_estimate_call_gas()
            .returning(|_, _, _| Ok(31_000.into()));
        let api = api(ep, provider);

        let op = UserOperation {
            sender: address(1),
            max_fee_per_gas: 100.into(),
            paymaster_and_data: address(2).as_bytes().to_vec().into(),
            ..UserOperation::default()
        };
        let estimate = api
            .estimate_user_operation_gas(op.clone().into(), address(0xee))
            .await
            .unwrap();
        assert_eq!(estimate.verification_gas, U256::from(60_000));
        assert_eq!(estimate.call_gas_limit, U256::from(31_000));
        assert_eq!(
            estimate.pre_verification_gas,
            gas::calc_pre_verification_gas(&op)
        );
        assert_eq!(estimate.deadline, None);
    }

    #[tokio::test]
    async fn submit_then_bundle_happy_path() {
        use crate::{
            bundler::{BundlerSettings, BundlingService},
            common::types::BundlingMode,
            reputation::ReputationStatus,
        };

        let ep_address = address(0xee);
        let sender = address(0xa);
        let paymaster = address(0xb);
        let op_hash = hash(0x42);
        let tx_hash = hash(0x43);

        let mut ep = MockEntryPointLike::new();
        ep.expect_address().return_const(ep_address);
        ep.expect_simulate_op().returning(|_| {
            let mut output = validation_output();
            output.return_info.prefund = U256::exp10(16);
            Ok(output)
        });
        ep.expect_user_op_hash().returning(move |_| Ok(op_hash));
        ep.expect_get_deposit()
            .returning(|_| Ok(U256::exp10(18)));
        ep.expect_send_ops()
            .times(1)
            .returning(move |ops, _| {
                assert_eq!(ops.len(), 1);
                Ok(tx_hash)
            });

        let db = Arc::new(crate::db::MemoryDb::new());
        let reputation = Arc::new(ReputationService::new(
            db.clone(),
            1337,
            ReputationParams::default(),
            StakeSettings::default(),
        ));
        let mempool = Arc::new(MempoolService::new(db, reputation.clone(), 1337));
        let registry = Arc::new(EntryPointRegistry::new(vec![ep]));
        let validation = Arc::new(UserOpValidationService::new(
            registry.clone(),
            Duration::from_secs(10),
        ));

        let mut provider = MockProviderLike::new();
        provider
            .expect_get_balance()
            .returning(|_| Ok(U256::exp10(18)));
        let provider = Arc::new(provider);

        let bundler = Arc::new(BundlingService::new(
            mempool.clone(),
            reputation.clone(),
            validation.clone(),
            registry.clone(),
            provider.clone(),
            BundlerSettings {
                relayer: address(0xcc),
                beneficiary: Some(address(0xbb)),
                min_signer_balance: U256::exp10(17),
                multicall: None,
                submit_timeout: Duration::from_secs(30),
                bundle_interval: Duration::from_secs(15),
                bundle_trigger_size: 2,
                mode: BundlingMode::Manual,
            },
        ));
        let api = EthApi::new(1337, mempool.clone(), validation, registry, provider);

        let mut op = UserOperation {
            sender,
            nonce: 1.into(),
            max_fee_per_gas: 100.into(),
            max_priority_fee_per_gas: 10.into(),
            ..UserOperation::default()
        };
        op.paymaster_and_data = paymaster.as_bytes().to_vec().into();

        let got = api
            .send_user_operation(op.into(), ep_address)
            .await
            .unwrap();
        assert_eq!(got, op_hash);
        assert_eq!(mempool.count().await.unwrap(), 1);

        let hashes = bundler.send_next_bundle().await.unwrap();
        assert_eq!(hashes, vec![tx_hash]);
        assert_eq!(mempool.count().await.unwrap(), 0);

        let dump = reputation.dump().await.unwrap();
        let seen_of = |addr: Address| {
            dump.iter()
                .find(|(e, _)| e.address == addr)
                .map(|(e, _)| e.ops_seen)
        };
        assert_eq!(seen_of(sender), Some(1));
        assert_eq!(seen_of(paymaster), Some(1));
        assert_eq!(
            reputation.get_status(paymaster).await.unwrap(),
            ReputationStatus::Ok
        );
    }

    #[tokio::test]
    async fn chain_id_and_supported_entry_points() {
        let api = api(MockEntryPointLike::new(), MockProviderLike::new());
        assert_eq!(api.chain_id().await.unwrap(), U64::from(1337));
        let eps = api.supported_entry_points().await.unwrap();
        assert_eq!(eps.len(), 1);
        assert!(eps[0].starts_with("0x"));
        assert_eq!(
            eps[0].to_lowercase(),
            format!("{:?}", address(0xee))
        );
    }
}
