use jsonrpsee::{
    core::Error as JsonRpseeError,
    types::{error::CallError, ErrorObject},
};
use serde::Serialize;

use crate::{pool::MempoolError, validation::ValidationError};

// Standard JSON-RPC codes
const INVALID_REQUEST_CODE: i32 = -32600;
const METHOD_NOT_FOUND_CODE: i32 = -32601;
const INVALID_USEROP_CODE: i32 = -32602;
const INTERNAL_ERROR_CODE: i32 = -32603;

// ERC-4337 era codes, kept for client compatibility
const INVALID_OPCODE_CODE: i32 = -32502;
const EXECUTION_REVERTED_CODE: i32 = -32521;

/// Errors surfaced to RPC clients. Internal bundling failures never reach
/// this type; they are consumed by the bundling service.
#[derive(Debug, thiserror::Error)]
pub enum RpcError {
    /// Malformed request, unknown entry point, bad params
    #[error("{0}")]
    InvalidRequest(String),
    /// The operation itself is unacceptable
    #[error("{0}")]
    InvalidUserOp(String),
    /// Replacement with an insufficient fee bump. Carries the historical
    /// opcode-violation code on the wire.
    #[error("{0}")]
    FeeTooLow(String),
    /// Entry point simulation reverted without a validation result
    #[error("{0}")]
    ExecutionReverted(String),
    #[error("method not found")]
    MethodNotFound,
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl From<MempoolError> for RpcError {
    fn from(error: MempoolError) -> Self {
        match error {
            MempoolError::ReplacementUnderpriced => RpcError::FeeTooLow(error.to_string()),
            MempoolError::MaxOperationsReached { .. } => RpcError::InvalidRequest(error.to_string()),
            MempoolError::Db(err) => RpcError::Internal(err.into()),
            MempoolError::Other(err) => RpcError::Internal(err),
        }
    }
}

impl From<ValidationError> for RpcError {
    fn from(error: ValidationError) -> Self {
        match error {
            ValidationError::UnknownEntryPoint(_) => RpcError::InvalidRequest(error.to_string()),
            ValidationError::FailedOp { .. } => RpcError::ExecutionReverted(error.to_string()),
            ValidationError::Reverted(reason) => RpcError::ExecutionReverted(reason),
            ValidationError::Timeout => {
                RpcError::Internal(anyhow::anyhow!("validation simulation timed out"))
            }
            ValidationError::Other(err) => RpcError::Internal(err),
        }
    }
}

impl From<RpcError> for JsonRpseeError {
    fn from(error: RpcError) -> Self {
        let msg = error.to_string();
        match error {
            RpcError::InvalidRequest(_) => rpc_err(INVALID_REQUEST_CODE, msg),
            RpcError::InvalidUserOp(_) => rpc_err(INVALID_USEROP_CODE, msg),
            RpcError::FeeTooLow(_) => rpc_err(INVALID_OPCODE_CODE, msg),
            RpcError::ExecutionReverted(_) => rpc_err(EXECUTION_REVERTED_CODE, msg),
            RpcError::MethodNotFound => rpc_err(METHOD_NOT_FOUND_CODE, msg),
            RpcError::Internal(_) => rpc_err(INTERNAL_ERROR_CODE, msg),
        }
    }
}

fn rpc_err(code: i32, msg: impl Into<String>) -> JsonRpseeError {
    create_rpc_err(code, msg, None::<()>)
}

fn create_rpc_err<S: Serialize>(code: i32, msg: impl Into<String>, data: Option<S>) -> JsonRpseeError {
    JsonRpseeError::Call(CallError::Custom(ErrorObject::owned(
        code,
        msg.into(),
        data,
    )))
}
