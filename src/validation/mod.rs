use std::{sync::Arc, time::Duration};

use ethers::types::Address;
use tokio::time::timeout;

use crate::common::{
    entry_point::{EntryPointError, EntryPointLike, EntryPointRegistry},
    types::{StakeInfo, UserOperation},
    validation_results::{ValidationOutput, ValidationReturnInfo},
};

#[derive(Debug, thiserror::Error)]
pub enum ValidationError {
    #[error("unknown entry point {0:?}")]
    UnknownEntryPoint(Address),
    /// The entry point rejected the operation with a structured reason.
    #[error("{reason}")]
    FailedOp { index: usize, reason: String },
    /// The simulation call reverted without a `ValidationResult` payload.
    #[error("{0}")]
    Reverted(String),
    #[error("validation simulation timed out")]
    Timeout,
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Validation outcome with stake info resolved to concrete entity
/// addresses taken from the operation itself.
#[derive(Debug, Clone)]
pub struct UserOpValidationResult {
    pub return_info: ValidationReturnInfo,
    pub sender_info: StakeInfo,
    pub factory_info: Option<StakeInfo>,
    pub paymaster_info: Option<StakeInfo>,
    pub aggregator_info: Option<StakeInfo>,
}

/// Hook for tracing-based rule enforcement (banned opcodes, storage access
/// rules). Validation runs without one; deployments that can debug-trace
/// wire an implementation in.
#[async_trait::async_trait]
pub trait TracingValidator: Send + Sync + 'static {
    async fn check(&self, op: &UserOperation, entry_point: Address) -> anyhow::Result<()>;
}

/// Wraps the entry point's `simulateValidation` and shapes its structured
/// revert into stake and prefund info.
pub struct UserOpValidationService<E> {
    entry_points: Arc<EntryPointRegistry<E>>,
    sim_timeout: Duration,
    tracer: Option<Arc<dyn TracingValidator>>,
}

impl<E: EntryPointLike> UserOpValidationService<E> {
    pub fn new(entry_points: Arc<EntryPointRegistry<E>>, sim_timeout: Duration) -> Self {
        Self {
            entry_points,
            sim_timeout,
            tracer: None,
        }
    }

    pub fn with_tracer(mut self, tracer: Arc<dyn TracingValidator>) -> Self {
        self.tracer = Some(tracer);
        self
    }

    /// Full validation used on the submit path and again for each candidate
    /// during bundle assembly.
    pub async fn simulate_complete_validation(
        &self,
        op: &UserOperation,
        entry_point: Address,
    ) -> Result<UserOpValidationResult, ValidationError> {
        let output = self.call_simulate_validation(op, entry_point).await?;
        if let Some(tracer) = &self.tracer {
            tracer.check(op, entry_point).await?;
        }
        Ok(Self::attach_addresses(output, op))
    }

    /// The raw simulation call, used by gas estimation which only needs the
    /// return info.
    pub async fn call_simulate_validation(
        &self,
        op: &UserOperation,
        entry_point: Address,
    ) -> Result<ValidationOutput, ValidationError> {
        let ep = self
            .entry_points
            .get(entry_point)
            .ok_or(ValidationError::UnknownEntryPoint(entry_point))?;
        timeout(self.sim_timeout, ep.simulate_op(op.clone()))
            .await
            .map_err(|_| ValidationError::Timeout)?
            .map_err(|err| match err {
                EntryPointError::FailedOp { index, reason, .. } => {
                    ValidationError::FailedOp { index, reason }
                }
                EntryPointError::Revert(reason) => ValidationError::Reverted(reason),
                EntryPointError::Other(err) => ValidationError::Other(err),
            })
    }

    fn attach_addresses(output: ValidationOutput, op: &UserOperation) -> UserOpValidationResult {
        UserOpValidationResult {
            return_info: output.return_info,
            sender_info: StakeInfo {
                address: op.sender,
                stake: output.sender_info.stake,
                unstake_delay_sec: output.sender_info.unstake_delay_sec,
            },
            factory_info: op.factory().map(|address| StakeInfo {
                address,
                stake: output.factory_info.stake,
                unstake_delay_sec: output.factory_info.unstake_delay_sec,
            }),
            paymaster_info: op.paymaster().map(|address| StakeInfo {
                address,
                stake: output.paymaster_info.stake,
                unstake_delay_sec: output.paymaster_info.unstake_delay_sec,
            }),
            aggregator_info: output.aggregator_info.map(|aggregator| StakeInfo {
                address: aggregator.address,
                stake: aggregator.stake_info.stake,
                unstake_delay_sec: aggregator.stake_info.unstake_delay_sec,
            }),
        }
    }
}
