use ethers::contract::abigen;

abigen!(
    IEntryPoint,
    r#"[
        struct UserOperation { address sender; uint256 nonce; bytes initCode; bytes callData; uint256 callGasLimit; uint256 verificationGasLimit; uint256 preVerificationGas; uint256 maxFeePerGas; uint256 maxPriorityFeePerGas; bytes paymasterAndData; bytes signature; }
        struct ReturnInfo { uint256 preOpGas; uint256 prefund; uint256 deadline; }
        struct StakeInfo { uint256 stake; uint256 unstakeDelaySec; }
        struct AggregatorStakeInfo { address aggregator; StakeInfo stakeInfo; }
        function handleOps(UserOperation[] ops, address beneficiary)
        function simulateValidation(UserOperation userOp)
        function getUserOpHash(UserOperation userOp) view returns (bytes32)
        function balanceOf(address account) view returns (uint256)
        event UserOperationEvent(bytes32 indexed userOpHash, address indexed sender, address indexed paymaster, uint256 nonce, bool success, uint256 actualGasCost, uint256 actualGasUsed)
        error FailedOp(uint256 opIndex, address paymaster, string reason)
        error SimulationResult(uint256 preOpGas, uint256 prefund, uint256 deadline)
        error ValidationResult(ReturnInfo returnInfo, StakeInfo senderInfo, StakeInfo factoryInfo, StakeInfo paymasterInfo)
        error ValidationResultWithAggregation(ReturnInfo returnInfo, StakeInfo senderInfo, StakeInfo factoryInfo, StakeInfo paymasterInfo, AggregatorStakeInfo aggregatorInfo)
    ]"#,
    derives(serde::Deserialize, serde::Serialize)
);

// NOTE: this contract is declared via JSON ABI (rather than the human-readable
// format used above) because ethers' human-readable ABI parser does not track
// struct types that are only used as function outputs, which would otherwise
// cause `aggregate3`'s return value to be generated as an untyped tuple
// instead of `Vec<Call3Result>`.
abigen!(
    Multicall3,
    r#"[
        {
            "type": "function",
            "name": "aggregate3",
            "stateMutability": "payable",
            "inputs": [
                {
                    "name": "calls",
                    "type": "tuple[]",
                    "internalType": "struct Multicall3.Call3[]",
                    "components": [
                        { "name": "target", "type": "address", "internalType": "address" },
                        { "name": "allowFailure", "type": "bool", "internalType": "bool" },
                        { "name": "callData", "type": "bytes", "internalType": "bytes" }
                    ]
                }
            ],
            "outputs": [
                {
                    "name": "returnData",
                    "type": "tuple[]",
                    "internalType": "struct Multicall3.Call3Result[]",
                    "components": [
                        { "name": "success", "type": "bool", "internalType": "bool" },
                        { "name": "returnData", "type": "bytes", "internalType": "bytes" }
                    ]
                }
            ]
        }
    ]"#
);
