use ethers::types::U256;

use crate::common::types::UserOperation;

/// Gas overheads charged for a user operation on top of its own limits,
/// used when computing the pre-verification gas.
#[derive(Clone, Copy, Debug)]
pub struct GasOverheads {
    pub fixed: U256,
    pub per_user_op: U256,
    pub per_user_op_word: U256,
    pub zero_byte: U256,
    pub non_zero_byte: U256,
    pub bundle_size: U256,
    pub sig_size: usize,
}

impl Default for GasOverheads {
    fn default() -> Self {
        Self {
            fixed: 21000.into(),
            per_user_op: 18300.into(),
            per_user_op_word: 4.into(),
            zero_byte: 4.into(),
            non_zero_byte: 16.into(),
            bundle_size: 1.into(),
            sig_size: 65,
        }
    }
}

/// Computes the pre-verification gas of an operation: the calldata cost of
/// its packed form plus fixed and per-op overheads. The signature is
/// replaced with a dummy of `sig_size` nonzero bytes so the result does not
/// depend on the signature the wallet eventually attaches.
pub fn calc_pre_verification_gas(op: &UserOperation) -> U256 {
    let ov = GasOverheads::default();
    let mut op = op.clone();
    op.signature = vec![1_u8; ov.sig_size].into();
    let packed = op.pack();
    let call_data_cost = packed
        .iter()
        .map(|&byte| if byte == 0 { ov.zero_byte } else { ov.non_zero_byte })
        .fold(U256::zero(), |acc, cost| acc + cost);
    ov.fixed / ov.bundle_size + call_data_cost + ov.per_user_op + ov.per_user_op_word * packed.len()
}
