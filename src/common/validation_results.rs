use ethers::{
    abi,
    abi::{AbiDecode, AbiError},
    types::{Address, U256},
};

use crate::common::contracts::{ValidationResult, ValidationResultWithAggregation};

/// Equivalent to the entry point's `ValidationResult` or
/// `ValidationResultWithAggregation` revert payloads, but with named structs
/// instead of tuples and with a single helper for deserializing either.
#[derive(Clone, Debug)]
pub struct ValidationOutput {
    pub return_info: ValidationReturnInfo,
    pub sender_info: EntityStake,
    pub factory_info: EntityStake,
    pub paymaster_info: EntityStake,
    pub aggregator_info: Option<AggregatorStake>,
}

impl AbiDecode for ValidationOutput {
    fn decode(bytes: impl AsRef<[u8]>) -> Result<Self, AbiError> {
        if let Ok(result) = ValidationResult::decode(bytes.as_ref()) {
            return Ok(result.into());
        }
        if let Ok(result) = ValidationResultWithAggregation::decode(bytes) {
            return Ok(result.into());
        }
        Err(AbiError::DecodingError(abi::Error::InvalidData))
    }
}

impl From<ValidationResult> for ValidationOutput {
    fn from(value: ValidationResult) -> Self {
        let ValidationResult {
            return_info,
            sender_info,
            factory_info,
            paymaster_info,
        } = value;
        Self {
            return_info: return_info.into(),
            sender_info: sender_info.into(),
            factory_info: factory_info.into(),
            paymaster_info: paymaster_info.into(),
            aggregator_info: None,
        }
    }
}

impl From<ValidationResultWithAggregation> for ValidationOutput {
    fn from(value: ValidationResultWithAggregation) -> Self {
        let ValidationResultWithAggregation {
            return_info,
            sender_info,
            factory_info,
            paymaster_info,
            aggregator_info,
        } = value;
        Self {
            return_info: return_info.into(),
            sender_info: sender_info.into(),
            factory_info: factory_info.into(),
            paymaster_info: paymaster_info.into(),
            aggregator_info: Some(aggregator_info.into()),
        }
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct ValidationReturnInfo {
    pub pre_op_gas: U256,
    pub prefund: U256,
    pub deadline: U256,
}

impl From<(U256, U256, U256)> for ValidationReturnInfo {
    fn from((pre_op_gas, prefund, deadline): (U256, U256, U256)) -> Self {
        Self {
            pre_op_gas,
            prefund,
            deadline,
        }
    }
}

/// Stake amounts of one entity, without the entity address. The address is
/// known from the operation itself and attached by the validation service.
#[derive(Clone, Copy, Debug, Default)]
pub struct EntityStake {
    pub stake: U256,
    pub unstake_delay_sec: U256,
}

impl From<(U256, U256)> for EntityStake {
    fn from((stake, unstake_delay_sec): (U256, U256)) -> Self {
        Self {
            stake,
            unstake_delay_sec,
        }
    }
}

#[derive(Clone, Copy, Debug)]
pub struct AggregatorStake {
    pub address: Address,
    pub stake_info: EntityStake,
}

impl From<(Address, (U256, U256))> for AggregatorStake {
    fn from((address, stake_info): (Address, (U256, U256))) -> Self {
        Self {
            address,
            stake_info: stake_info.into(),
        }
    }
}
