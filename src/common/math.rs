use ethers::types::U256;

/// Raises a value by the given whole percentage, rounding down.
pub fn percent_raise(value: U256, percent: u64) -> U256 {
    value * (100 + percent) / 100
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raises_and_floors() {
        assert_eq!(percent_raise(100.into(), 10), U256::from(110));
        assert_eq!(percent_raise(10.into(), 10), U256::from(11));
        assert_eq!(percent_raise(105.into(), 10), U256::from(115));
        assert_eq!(percent_raise(0.into(), 10), U256::zero());
    }
}
