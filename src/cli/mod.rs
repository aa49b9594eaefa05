use std::{sync::Arc, time::Duration};

use anyhow::Context;
use clap::Parser;
use ethers::{
    middleware::SignerMiddleware,
    providers::{Http, HttpRateLimitRetryPolicy, Middleware, Provider, RetryClientBuilder},
    signers::{LocalWallet, Signer},
    types::{Address, U256},
};
use tokio::signal;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;
use url::Url;

use crate::{
    bundler::{BundlerSettings, BundlingService},
    common::{
        contracts::IEntryPoint,
        entry_point::EntryPointRegistry,
        types::BundlingMode,
    },
    db::{Database, MemoryDb},
    pool::MempoolService,
    reputation::{ReputationParams, ReputationService, StakeSettings},
    rpc::{spawn_rpc_server, DebugApi, EthApi, RpcServerArgs},
    validation::UserOpValidationService,
};

/// CLI options
#[derive(Debug, Parser)]
#[command(author, version, about = "ERC-4337 user operation bundler")]
struct Opts {
    /// EVM node RPC endpoint to run against
    #[arg(long, env = "ETH_RPC_URL", default_value = "http://localhost:8545")]
    rpc_endpoint: String,

    /// Entry point addresses to serve, comma separated
    #[arg(long, env = "ENTRY_POINTS", value_delimiter = ',')]
    entry_points: Vec<String>,

    /// Private key of the relayer wallet that signs bundle transactions
    #[arg(long, env = "RELAYER_PRIVATE_KEY")]
    relayer: String,

    /// Gas refund recipient; the relayer refuels itself when unset
    #[arg(long, env = "BENEFICIARY")]
    beneficiary: Option<String>,

    /// Multicall3 contract used to resolve user op hashes in one round trip
    #[arg(long, env = "MULTICALL", default_value = "0xcA11bde05977b3631167028862bE2a173976CA11")]
    multicall: String,

    /// Reputation: denominator of the minimum inclusion rate
    #[arg(long, default_value = "10")]
    min_inclusion_denominator: u64,

    /// Reputation: slack before an entity is throttled
    #[arg(long, default_value = "10")]
    throttling_slack: u64,

    /// Reputation: slack before an entity is banned
    #[arg(long, default_value = "50")]
    ban_slack: u64,

    /// Minimum stake, in wei, for quota exemptions
    #[arg(long, default_value = "0")]
    min_stake: String,

    /// Minimum unstake delay, in seconds, for quota exemptions
    #[arg(long, default_value = "0")]
    min_unstake_delay: u64,

    /// Relayer balance, in wei, below which gas refunds go to the relayer
    #[arg(long, default_value = "100000000000000000")]
    min_signer_balance: String,

    /// Seconds between automatic bundle attempts
    #[arg(long, default_value = "15")]
    bundle_interval: u64,

    /// Pool size that triggers size-based bundling
    #[arg(long, default_value = "2")]
    bundle_trigger_size: usize,

    /// Bundling mode at startup: auto or manual
    #[arg(long, default_value = "auto")]
    bundling_mode: String,

    /// Per-call timeout for validation simulations, in seconds
    #[arg(long, default_value = "10")]
    sim_timeout: u64,

    /// Timeout for handleOps submission, in seconds
    #[arg(long, default_value = "30")]
    submit_timeout: u64,

    /// Host to listen on for JSON-RPC requests
    #[arg(long, env = "RPC_HOST", default_value = "127.0.0.1")]
    host: String,

    /// Port to listen on for JSON-RPC requests
    #[arg(long, env = "RPC_PORT", default_value = "14337")]
    port: u16,

    /// Log level: trace, debug, info, warn, error
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,
}

/// Main entry point for the CLI: builds one service set for the configured
/// network, starts the bundling cron and the RPC server, and runs until
/// ctrl-c.
pub async fn run() -> anyhow::Result<()> {
    let opts = Opts::parse();

    let subscriber = FmtSubscriber::builder()
        .with_max_level(opts.log_level.parse::<Level>()?)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let url = Url::parse(&opts.rpc_endpoint).context("invalid RPC endpoint")?;
    let client = RetryClientBuilder::default()
        .rate_limit_retries(10)
        .timeout_retries(3)
        .initial_backoff(Duration::from_millis(500))
        .build(Http::new(url), Box::<HttpRateLimitRetryPolicy>::default());
    let provider = Arc::new(Provider::new(client));
    let chain_id = provider
        .get_chainid()
        .await
        .context("should reach the EVM node")?
        .as_u64();

    let wallet = opts
        .relayer
        .parse::<LocalWallet>()
        .context("invalid relayer private key")?
        .with_chain_id(chain_id);
    let relayer = wallet.address();
    let signer = Arc::new(SignerMiddleware::new((*provider).clone(), wallet));

    let entry_point_addresses = opts
        .entry_points
        .iter()
        .map(|raw| {
            raw.parse::<Address>()
                .with_context(|| format!("invalid entry point address {raw}"))
        })
        .collect::<anyhow::Result<Vec<_>>>()?;
    anyhow::ensure!(
        !entry_point_addresses.is_empty(),
        "no entry points configured"
    );
    let registry = Arc::new(EntryPointRegistry::new(
        entry_point_addresses
            .iter()
            .map(|&address| IEntryPoint::new(address, signer.clone()))
            .collect(),
    ));

    let db = Arc::new(MemoryDb::new());
    db.start().await?;

    let reputation = Arc::new(ReputationService::new(
        db.clone(),
        chain_id,
        ReputationParams {
            min_inclusion_denominator: opts.min_inclusion_denominator,
            throttling_slack: opts.throttling_slack,
            ban_slack: opts.ban_slack,
        },
        StakeSettings {
            min_stake: U256::from_dec_str(&opts.min_stake).context("invalid min_stake")?,
            min_unstake_delay: opts.min_unstake_delay.into(),
        },
    ));
    let mempool = Arc::new(MempoolService::new(db.clone(), reputation.clone(), chain_id));
    let validation = Arc::new(UserOpValidationService::new(
        registry.clone(),
        Duration::from_secs(opts.sim_timeout),
    ));

    let beneficiary = opts
        .beneficiary
        .as_deref()
        .map(|raw| raw.parse::<Address>().context("invalid beneficiary"))
        .transpose()?;
    let multicall = opts
        .multicall
        .parse::<Address>()
        .context("invalid multicall address")?;
    let mode = opts
        .bundling_mode
        .parse::<BundlingMode>()
        .map_err(|_| anyhow::anyhow!("bundling mode must be auto or manual"))?;

    let bundler = Arc::new(BundlingService::new(
        mempool.clone(),
        reputation.clone(),
        validation.clone(),
        registry.clone(),
        provider.clone(),
        BundlerSettings {
            relayer,
            beneficiary,
            min_signer_balance: U256::from_dec_str(&opts.min_signer_balance)
                .context("invalid min_signer_balance")?,
            multicall: Some(multicall),
            submit_timeout: Duration::from_secs(opts.submit_timeout),
            bundle_interval: Duration::from_secs(opts.bundle_interval),
            bundle_trigger_size: opts.bundle_trigger_size,
            mode,
        },
    ));
    bundler.start();

    let eth_api = EthApi::new(
        chain_id,
        mempool.clone(),
        validation,
        registry,
        provider.clone(),
    );
    let debug_api = DebugApi::new(mempool, reputation, bundler.clone());
    let server_handle = spawn_rpc_server(
        RpcServerArgs {
            host: opts.host.clone(),
            port: opts.port,
        },
        eth_api,
        debug_api,
    )
    .await?;

    info!("Bundler running for chain {chain_id} with relayer {relayer:?}");

    signal::ctrl_c().await?;
    info!("Received SIGINT, shutting down");
    bundler.stop();
    let _ = server_handle.stop();
    db.stop().await?;

    Ok(())
}
