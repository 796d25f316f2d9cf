//! Fee model shared by all network families
//!
//! Pure value type: no I/O, deterministic, so fee bumps are reproducible.

use ethers::types::U256;
use serde::{Deserialize, Serialize};

/// Cost of a transaction under one fee regime
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Fee {
    Fixed {
        amount: U256,
    },
    Legacy {
        gas_price: U256,
        gas_limit: U256,
        l1_fee: Option<U256>,
    },
    Eip1559 {
        max_priority_fee: U256,
        base_fee: U256,
        gas_limit: U256,
        l1_fee: Option<U256>,
    },
    Solana {
        compute_unit_price: U256,
        compute_unit_limit: U256,
        base_fee: U256,
    },
}

impl Fee {
    /// Per-unit price actually offered to the network
    pub fn effective_price(&self) -> U256 {
        match self {
            Fee::Fixed { amount } => *amount,
            Fee::Legacy { gas_price, .. } => *gas_price,
            Fee::Eip1559 {
                max_priority_fee,
                base_fee,
                ..
            } => max_priority_fee.saturating_add(*base_fee),
            Fee::Solana {
                compute_unit_price, ..
            } => *compute_unit_price,
        }
    }

    /// Total amount the sender pays, in the network's smallest native unit
    pub fn total_cost(&self) -> U256 {
        match self {
            Fee::Fixed { amount } => *amount,
            Fee::Legacy {
                gas_price,
                gas_limit,
                l1_fee,
            } => gas_price
                .saturating_mul(*gas_limit)
                .saturating_add(l1_fee.unwrap_or_default()),
            Fee::Eip1559 {
                gas_limit, l1_fee, ..
            } => self
                .effective_price()
                .saturating_mul(*gas_limit)
                .saturating_add(l1_fee.unwrap_or_default()),
            Fee::Solana {
                compute_unit_price,
                compute_unit_limit,
                base_fee,
            } => base_fee.saturating_add(compute_unit_price.saturating_mul(*compute_unit_limit)),
        }
    }

    /// Raise the price component(s) by `percentage`. Limits, the L1 data fee
    /// and the Solana signature fee are left untouched.
    pub fn bump(&self, percentage: u32) -> Fee {
        match self {
            Fee::Fixed { amount } => Fee::Fixed {
                amount: bump_price(*amount, percentage),
            },
            Fee::Legacy {
                gas_price,
                gas_limit,
                l1_fee,
            } => Fee::Legacy {
                gas_price: bump_price(*gas_price, percentage),
                gas_limit: *gas_limit,
                l1_fee: *l1_fee,
            },
            Fee::Eip1559 {
                max_priority_fee,
                base_fee,
                gas_limit,
                l1_fee,
            } => Fee::Eip1559 {
                max_priority_fee: bump_price(*max_priority_fee, percentage),
                base_fee: bump_price(*base_fee, percentage),
                gas_limit: *gas_limit,
                l1_fee: *l1_fee,
            },
            Fee::Solana {
                compute_unit_price,
                compute_unit_limit,
                base_fee,
            } => Fee::Solana {
                compute_unit_price: bump_price(*compute_unit_price, percentage),
                compute_unit_limit: *compute_unit_limit,
                base_fee: *base_fee,
            },
        }
    }

    /// Gas or compute-unit limit, if the regime has one
    pub fn limit(&self) -> Option<U256> {
        match self {
            Fee::Fixed { .. } => None,
            Fee::Legacy { gas_limit, .. } | Fee::Eip1559 { gas_limit, .. } => Some(*gas_limit),
            Fee::Solana {
                compute_unit_limit, ..
            } => Some(*compute_unit_limit),
        }
    }
}

/// Scale a price up by `percentage`, rounding up. A non-zero percentage always
/// yields a strictly higher price, even from zero.
fn bump_price(price: U256, percentage: u32) -> U256 {
    if percentage == 0 {
        return price;
    }

    let hundred = U256::from(100u64);
    let increase = price
        .saturating_mul(U256::from(percentage))
        .saturating_add(hundred - U256::one())
        / hundred;
    price.saturating_add(std::cmp::max(increase, U256::one()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gwei(n: u64) -> U256 {
        U256::from(n) * U256::exp10(9)
    }

    #[test]
    fn test_total_cost_per_regime() {
        let fixed = Fee::Fixed {
            amount: U256::from(42u64),
        };
        assert_eq!(fixed.total_cost(), U256::from(42u64));

        let legacy = Fee::Legacy {
            gas_price: gwei(10),
            gas_limit: U256::from(21_000u64),
            l1_fee: Some(U256::from(7u64)),
        };
        assert_eq!(legacy.total_cost(), gwei(10) * 21_000 + 7);

        let eip1559 = Fee::Eip1559 {
            max_priority_fee: gwei(2),
            base_fee: gwei(30),
            gas_limit: U256::from(100_000u64),
            l1_fee: None,
        };
        assert_eq!(eip1559.effective_price(), gwei(32));
        assert_eq!(eip1559.total_cost(), gwei(32) * 100_000);

        let solana = Fee::Solana {
            compute_unit_price: U256::from(1_000u64),
            compute_unit_limit: U256::from(200_000u64),
            base_fee: U256::from(5_000u64),
        };
        assert_eq!(solana.total_cost(), U256::from(5_000u64 + 1_000 * 200_000));
    }

    #[test]
    fn test_bump_scales_price_not_limit() {
        let fee = Fee::Eip1559 {
            max_priority_fee: gwei(2),
            base_fee: gwei(30),
            gas_limit: U256::from(100_000u64),
            l1_fee: Some(U256::from(9u64)),
        };

        let bumped = fee.bump(20);
        match bumped {
            Fee::Eip1559 {
                max_priority_fee,
                base_fee,
                gas_limit,
                l1_fee,
            } => {
                assert_eq!(max_priority_fee, U256::from(2_400_000_000u64));
                assert_eq!(base_fee, gwei(36));
                assert_eq!(gas_limit, U256::from(100_000u64));
                assert_eq!(l1_fee, Some(U256::from(9u64)));
            }
            other => panic!("variant changed: {:?}", other),
        }

        let solana = Fee::Solana {
            compute_unit_price: U256::from(10u64),
            compute_unit_limit: U256::from(200_000u64),
            base_fee: U256::from(5_000u64),
        };
        let bumped = solana.bump(50);
        assert_eq!(bumped.limit(), Some(U256::from(200_000u64)));
        assert_eq!(bumped.effective_price(), U256::from(15u64));
        assert_eq!(bumped.total_cost(), U256::from(5_000u64 + 15 * 200_000));
    }

    #[test]
    fn test_bump_is_strictly_increasing_and_deterministic() {
        let mut fee = Fee::Legacy {
            gas_price: U256::zero(),
            gas_limit: U256::from(21_000u64),
            l1_fee: None,
        };

        for _ in 0..10 {
            let next = fee.bump(10);
            assert!(next.effective_price() > fee.effective_price());
            assert_eq!(next, fee.bump(10));
            fee = next;
        }
    }

    #[test]
    fn test_zero_percentage_is_identity() {
        let fee = Fee::Fixed {
            amount: U256::from(1_000u64),
        };
        assert_eq!(fee.bump(0), fee);
    }

    #[test]
    fn test_fee_serializes_with_tag() {
        let fee = Fee::Fixed {
            amount: U256::from(1u64),
        };
        let json = serde_json::to_value(&fee).unwrap();
        assert_eq!(json["type"], "fixed");
        let back: Fee = serde_json::from_value(json).unwrap();
        assert_eq!(back, fee);
    }
}
