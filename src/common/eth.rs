use ethers::{
    abi::{AbiDecode, RawLog},
    contract::ContractError,
    providers::Middleware,
    types::{Bytes, Log},
};

/// Converts an ethers `Log` into an ethabi `RawLog` for event decoding.
pub fn log_to_raw_log(log: &Log) -> RawLog {
    RawLog {
        topics: log.topics.clone(),
        data: log.data.to_vec(),
    }
}

/// Gets the revert data from a contract error if it is a revert error,
/// otherwise returns the original error.
pub fn get_revert_bytes<M: Middleware>(error: ContractError<M>) -> Result<Bytes, ContractError<M>> {
    if let ContractError::Revert(bytes) = error {
        Ok(bytes)
    } else {
        Err(error)
    }
}

/// The abi for what happens when you just `revert("message")` in a contract.
#[derive(Clone, Debug, Default, Eq, PartialEq, ethers::contract::EthError)]
#[etherror(name = "Error", abi = "Error(string)")]
pub struct ContractRevertError {
    pub reason: String,
}

pub fn parse_revert_message(revert_data: &[u8]) -> Option<String> {
    ContractRevertError::decode(revert_data)
        .ok()
        .map(|err| err.reason)
}
