use std::sync::Arc;

use ethers::types::Address;
use jsonrpsee::{
    core::{async_trait, RpcResult},
    proc_macros::rpc,
};

use super::{RpcError, RpcReputation, RpcUserOperation};
use crate::{
    bundler::BundlingService,
    common::{entry_point::EntryPointLike, provider::ProviderLike, types::BundlingMode},
    db::Database,
    pool::MempoolService,
    reputation::ReputationService,
};

/// Debug API
#[rpc(server, namespace = "debug")]
pub trait DebugApi {
    #[method(name = "bundler_clearState")]
    async fn bundler_clear_state(&self) -> RpcResult<String>;

    #[method(name = "bundler_dumpMempool")]
    async fn bundler_dump_mempool(&self) -> RpcResult<Vec<RpcUserOperation>>;

    #[method(name = "bundler_setBundlingMode")]
    async fn bundler_set_bundling_mode(&self, mode: BundlingMode) -> RpcResult<String>;

    #[method(name = "bundler_setBundleInterval")]
    async fn bundler_set_bundle_interval(&self, interval: u64) -> RpcResult<String>;

    #[method(name = "bundler_sendBundleNow")]
    async fn bundler_send_bundle_now(&self) -> RpcResult<String>;

    #[method(name = "bundler_setReputation")]
    async fn bundler_set_reputation(
        &self,
        reputations: Vec<RpcReputation>,
        entry_point: Address,
    ) -> RpcResult<String>;

    #[method(name = "bundler_dumpReputation")]
    async fn bundler_dump_reputation(&self) -> RpcResult<Vec<RpcReputation>>;
}

pub struct DebugApi<D, E, P> {
    mempool: Arc<MempoolService<D>>,
    reputation: Arc<ReputationService<D>>,
    bundler: Arc<BundlingService<D, E, P>>,
}

impl<D, E, P> DebugApi<D, E, P>
where
    D: Database,
    E: EntryPointLike,
    P: ProviderLike,
{
    pub fn new(
        mempool: Arc<MempoolService<D>>,
        reputation: Arc<ReputationService<D>>,
        bundler: Arc<BundlingService<D, E, P>>,
    ) -> Self {
        Self {
            mempool,
            reputation,
            bundler,
        }
    }
}

#[async_trait]
impl<D, E, P> DebugApiServer for DebugApi<D, E, P>
where
    D: Database,
    E: EntryPointLike,
    P: ProviderLike,
{
    async fn bundler_clear_state(&self) -> RpcResult<String> {
        self.mempool
            .clear_state()
            .await
            .map_err(RpcError::from)?;
        Ok("ok".to_owned())
    }

    async fn bundler_dump_mempool(&self) -> RpcResult<Vec<RpcUserOperation>> {
        Ok(self
            .mempool
            .dump()
            .await
            .map_err(RpcError::from)?
            .into_iter()
            .map(|entry| entry.user_op.into())
            .collect())
    }

    async fn bundler_set_bundling_mode(&self, mode: BundlingMode) -> RpcResult<String> {
        self.bundler.set_bundling_mode(mode);
        Ok("ok".to_owned())
    }

    async fn bundler_set_bundle_interval(&self, interval: u64) -> RpcResult<String> {
        self.bundler.set_bundle_interval(interval);
        Ok("ok".to_owned())
    }

    async fn bundler_send_bundle_now(&self) -> RpcResult<String> {
        self.bundler
            .send_next_bundle()
            .await
            .map_err(RpcError::Internal)?;
        Ok("ok".to_owned())
    }

    async fn bundler_set_reputation(
        &self,
        reputations: Vec<RpcReputation>,
        _entry_point: Address,
    ) -> RpcResult<String> {
        for reputation in reputations {
            self.reputation
                .set_reputation(
                    reputation.address,
                    reputation.ops_seen.as_u64(),
                    reputation.ops_included.as_u64(),
                )
                .await
                .map_err(RpcError::Internal)?;
        }
        Ok("ok".to_owned())
    }

    async fn bundler_dump_reputation(&self) -> RpcResult<Vec<RpcReputation>> {
        Ok(self
            .reputation
            .dump()
            .await
            .map_err(RpcError::Internal)?
            .into_iter()
            .map(|(entry, status)| RpcReputation {
                address: entry.address,
                ops_seen: entry.ops_seen.into(),
                ops_included: entry.ops_included.into(),
                status: Some(status),
            })
            .collect())
    }
}
