use std::sync::Arc;

use anyhow::{bail, Context};
use ethers::{
    abi::AbiEncode,
    providers::Middleware,
    types::{
        transaction::eip2718::TypedTransaction, Address, Bytes, Eip1559TransactionRequest, Filter,
        Log, Transaction, TransactionReceipt, H256, U256,
    },
};
#[cfg(test)]
use mockall::automock;

use crate::common::{
    contracts::{Call3, GetUserOpHashCall, Multicall3},
    types::UserOperation,
};

/// The subset of the EVM node API the bundler consumes, abstracted for
/// testability over any `Middleware`.
#[cfg_attr(test, automock)]
#[async_trait::async_trait]
pub trait ProviderLike: Send + Sync + 'static {
    async fn get_balance(&self, address: Address) -> anyhow::Result<U256>;

    async fn estimate_call_gas(
        &self,
        from: Address,
        to: Address,
        data: Bytes,
    ) -> anyhow::Result<U256>;

    async fn get_logs(&self, filter: &Filter) -> anyhow::Result<Vec<Log>>;

    async fn get_transaction(&self, hash: H256) -> anyhow::Result<Option<Transaction>>;

    async fn get_transaction_receipt(
        &self,
        hash: H256,
    ) -> anyhow::Result<Option<TransactionReceipt>>;

    /// Resolves the entry point hash of each operation with a single
    /// multicall3 round trip.
    async fn resolve_user_op_hashes(
        self: Arc<Self>,
        multicall: Address,
        entry_point: Address,
        ops: Vec<UserOperation>,
    ) -> anyhow::Result<Vec<H256>>;
}

#[async_trait::async_trait]
impl<M> ProviderLike for M
where
    M: Middleware + 'static,
{
    async fn get_balance(&self, address: Address) -> anyhow::Result<U256> {
        Middleware::get_balance(self, address, None)
            .await
            .context("should get balance")
    }

    async fn estimate_call_gas(
        &self,
        from: Address,
        to: Address,
        data: Bytes,
    ) -> anyhow::Result<U256> {
        let tx: TypedTransaction = Eip1559TransactionRequest {
            from: Some(from),
            to: Some(to.into()),
            data: Some(data),
            ..Default::default()
        }
        .into();
        Middleware::estimate_gas(self, &tx, None)
            .await
            .context("should estimate call gas")
    }

    async fn get_logs(&self, filter: &Filter) -> anyhow::Result<Vec<Log>> {
        Middleware::get_logs(self, filter)
            .await
            .context("should query logs")
    }

    async fn get_transaction(&self, hash: H256) -> anyhow::Result<Option<Transaction>> {
        Middleware::get_transaction(self, hash)
            .await
            .context("should fetch transaction")
    }

    async fn get_transaction_receipt(
        &self,
        hash: H256,
    ) -> anyhow::Result<Option<TransactionReceipt>> {
        Middleware::get_transaction_receipt(self, hash)
            .await
            .context("should fetch transaction receipt")
    }

    async fn resolve_user_op_hashes(
        self: Arc<Self>,
        multicall: Address,
        entry_point: Address,
        ops: Vec<UserOperation>,
    ) -> anyhow::Result<Vec<H256>> {
        let multicall = Multicall3::new(multicall, self);
        let calls = ops
            .into_iter()
            .map(|op| Call3 {
                target: entry_point,
                allow_failure: false,
                call_data: GetUserOpHashCall { user_op: op }.encode().into(),
            })
            .collect::<Vec<_>>();
        let results = multicall
            .aggregate_3(calls)
            .call()
            .await
            .context("multicall should aggregate getUserOpHash calls")?;
        let mut hashes = Vec::with_capacity(results.len());
        for result in results {
            if !result.success || result.return_data.len() != 32 {
                bail!("getUserOpHash call failed inside multicall");
            }
            hashes.push(H256::from_slice(&result.return_data));
        }
        Ok(hashes)
    }
}
