use std::net::SocketAddr;

use anyhow::Context;
use jsonrpsee::{
    server::{ServerBuilder, ServerHandle},
    RpcModule,
};
use tracing::info;

use super::{DebugApi, DebugApiServer, EthApi, EthApiServer};
use crate::{
    common::{entry_point::EntryPointLike, provider::ProviderLike},
    db::Database,
};

#[derive(Debug, Clone)]
pub struct RpcServerArgs {
    pub host: String,
    pub port: u16,
}

/// Builds the merged eth + debug module and starts the HTTP server. The
/// returned handle stops the server when dropped or explicitly stopped.
pub async fn spawn_rpc_server<D, E, P>(
    args: RpcServerArgs,
    eth_api: EthApi<D, E, P>,
    debug_api: DebugApi<D, E, P>,
) -> anyhow::Result<ServerHandle>
where
    D: Database,
    E: EntryPointLike,
    P: ProviderLike,
{
    let addr: SocketAddr = format!("{}:{}", args.host, args.port)
        .parse()
        .context("invalid RPC listen address")?;

    let mut module = RpcModule::new(());
    module.merge(eth_api.into_rpc())?;
    module.merge(debug_api.into_rpc())?;

    let server = ServerBuilder::default().http_only().build(addr).await?;
    let handle = server.start(module)?;
    info!("RPC server listening on {addr}");
    Ok(handle)
}
