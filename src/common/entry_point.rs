use std::ops::Deref;

use anyhow::Context;
use ethers::{
    abi::AbiDecode,
    contract::ContractError,
    providers::Middleware,
    types::{Address, H256, U256},
};
#[cfg(test)]
use mockall::automock;

use crate::common::{
    contracts::{FailedOp, IEntryPoint, SimulationResult},
    eth::{get_revert_bytes, parse_revert_message},
    types::UserOperation,
    validation_results::ValidationOutput,
};

/// Error surfaced by entry point interactions. `FailedOp` carries the revert
/// payload the contract uses to point at the offending operation.
#[derive(Debug, thiserror::Error)]
pub enum EntryPointError {
    #[error("operation {index} failed: {reason}")]
    FailedOp {
        index: usize,
        paymaster: Address,
        reason: String,
    },
    #[error("{0}")]
    Revert(String),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// The subset of the entry point contract the bundler consumes. Implemented
/// for the generated binding; mocked in tests.
#[cfg_attr(test, automock)]
#[async_trait::async_trait]
pub trait EntryPointLike: Send + Sync + 'static {
    fn address(&self) -> Address;

    /// Staticcalls `simulateValidation` and decodes the structured revert.
    async fn simulate_op(&self, op: UserOperation) -> Result<ValidationOutput, EntryPointError>;

    /// Submits `handleOps` from the relayer wallet and returns the
    /// transaction hash.
    async fn send_ops(
        &self,
        ops: Vec<UserOperation>,
        beneficiary: Address,
    ) -> Result<H256, EntryPointError>;

    /// `balanceOf` of an entity, i.e. its deposit held by the entry point.
    async fn get_deposit(&self, address: Address) -> anyhow::Result<U256>;

    /// `getUserOpHash` via eth_call.
    async fn user_op_hash(&self, op: UserOperation) -> anyhow::Result<H256>;
}

#[async_trait::async_trait]
impl<M> EntryPointLike for IEntryPoint<M>
where
    M: Middleware + 'static,
{
    fn address(&self) -> Address {
        self.deref().address()
    }

    async fn simulate_op(&self, op: UserOperation) -> Result<ValidationOutput, EntryPointError> {
        let error = self
            .simulate_validation(op)
            .call()
            .await
            .err()
            .context("simulateValidation should revert")?;
        let revert_data = get_revert_bytes(error).map_err(decode_error)?;
        if let Ok(output) = ValidationOutput::decode(&revert_data) {
            return Ok(output);
        }
        if let Ok(FailedOp {
            op_index,
            paymaster,
            reason,
        }) = FailedOp::decode(&revert_data)
        {
            return Err(EntryPointError::FailedOp {
                index: op_index.as_usize(),
                paymaster,
                reason,
            });
        }
        if SimulationResult::decode(&revert_data).is_ok() {
            return Err(EntryPointError::Revert(
                "unexpected SimulationResult revert".to_owned(),
            ));
        }
        if let Some(reason) = parse_revert_message(&revert_data) {
            return Err(EntryPointError::Revert(reason));
        }
        Err(EntryPointError::Revert(format!("{revert_data}")))
    }

    async fn send_ops(
        &self,
        ops: Vec<UserOperation>,
        beneficiary: Address,
    ) -> Result<H256, EntryPointError> {
        match self.handle_ops(ops, beneficiary).send().await {
            Ok(pending) => Ok(pending.tx_hash()),
            Err(error) => match get_revert_bytes(error) {
                Ok(revert_data) => {
                    if let Ok(FailedOp {
                        op_index,
                        paymaster,
                        reason,
                    }) = FailedOp::decode(&revert_data)
                    {
                        Err(EntryPointError::FailedOp {
                            index: op_index.as_usize(),
                            paymaster,
                            reason,
                        })
                    } else if let Some(reason) = parse_revert_message(&revert_data) {
                        Err(EntryPointError::Revert(reason))
                    } else {
                        Err(EntryPointError::Revert(format!("{revert_data}")))
                    }
                }
                Err(error) => Err(decode_error(error)),
            },
        }
    }

    async fn get_deposit(&self, address: Address) -> anyhow::Result<U256> {
        self.balance_of(address)
            .call()
            .await
            .context("entry point should return entity deposit")
    }

    async fn user_op_hash(&self, op: UserOperation) -> anyhow::Result<H256> {
        Ok(self
            .get_user_op_hash(op)
            .call()
            .await
            .context("entry point should hash user operation")?
            .into())
    }
}

fn decode_error<M: Middleware>(error: ContractError<M>) -> EntryPointError {
    EntryPointError::Other(anyhow::anyhow!("{error}"))
}

/// The set of entry points a chain instance serves, addressable by contract
/// address.
#[derive(Debug)]
pub struct EntryPointRegistry<E> {
    entry_points: Vec<E>,
}

impl<E: EntryPointLike> EntryPointRegistry<E> {
    pub fn new(entry_points: Vec<E>) -> Self {
        Self { entry_points }
    }

    pub fn get(&self, address: Address) -> Option<&E> {
        self.entry_points.iter().find(|ep| ep.address() == address)
    }

    pub fn is_supported(&self, address: Address) -> bool {
        self.get(address).is_some()
    }

    pub fn addresses(&self) -> Vec<Address> {
        self.entry_points.iter().map(|ep| ep.address()).collect()
    }
}
