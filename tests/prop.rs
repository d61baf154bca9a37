use proptest::prelude::*;
use solana_program::pubkey::Pubkey;

use larder::decimal::Decimal;
use larder::ix::{BorrowAmountType, LendingInstruction};
use larder::math;
use larder::state::{
    LastUpdate, Obligation, ObligationCollateral, ObligationLiquidity, Reserve,
    ReserveCollateral, ReserveConfig, ReserveFees, ReserveLiquidity,
};

// --- Fixtures and strategies ---

fn base_reserve() -> Reserve {
    Reserve {
        pubkey: Pubkey::new_unique(),
        version: 1,
        last_update: LastUpdate { slot: 1, stale: false },
        lending_market: Pubkey::new_unique(),
        liquidity: ReserveLiquidity {
            mint: Pubkey::new_unique(),
            mint_decimals: 6,
            supply: Pubkey::new_unique(),
            fee_receiver: Pubkey::new_unique(),
            oracle: Pubkey::new_unique(),
            available_amount: 0,
            borrowed_amount_wad: Decimal::zero(),
            cumulative_borrow_rate_wad: Decimal::one(),
            market_price: 1,
        },
        collateral: ReserveCollateral {
            mint: Pubkey::new_unique(),
            mint_total_supply: 0,
            supply: Pubkey::new_unique(),
        },
        config: ReserveConfig {
            optimal_utilization_rate: 80,
            loan_to_value_ratio: 50,
            liquidation_bonus: 5,
            liquidation_threshold: 55,
            min_borrow_rate: 0,
            optimal_borrow_rate: 4,
            max_borrow_rate: 30,
            fees: ReserveFees {
                borrow_fee_wad: 0,
                flash_loan_fee_wad: 0,
                host_fee_percentage: 0,
            },
        },
        reserved: [0u8; 248],
    }
}

fn arb_reserve() -> impl Strategy<Value = Reserve> {
    (
        0u64..=u64::MAX / 4,
        0u64..=u64::MAX / 4,
        1u8..=100,
        0u64..=100,
        0u8..=50,
        0u8..=100,
    )
        .prop_map(|(available, borrowed, optimal_util, supply_pct, min_rate, max_extra)| {
            let optimal_rate = min_rate.saturating_add(5).min(100);
            let max_rate = optimal_rate.saturating_add(max_extra).min(100).max(optimal_rate);
            let cap = available.saturating_add(borrowed);
            let mut reserve = base_reserve();
            reserve.liquidity.available_amount = available;
            reserve.liquidity.borrowed_amount_wad = Decimal::from_integer(borrowed);
            // Supply between 0 and 2x cap so exchange rates above and below
            // one both appear.
            reserve.collateral.mint_total_supply = (cap / 50).saturating_mul(supply_pct);
            reserve.config.optimal_utilization_rate = optimal_util;
            reserve.config.min_borrow_rate = min_rate;
            reserve.config.optimal_borrow_rate = optimal_rate;
            reserve.config.max_borrow_rate = max_rate;
            reserve
        })
}

fn arb_obligation() -> impl Strategy<Value = Obligation> {
    (
        prop::collection::vec((any::<u64>(), 0u64..=1 << 40), 0..=4),
        prop::collection::vec((0u64..=1 << 40, 0u64..=1 << 40), 0..=4),
        0u64..=1 << 20,
        0u64..=1 << 20,
        0u64..=1 << 20,
        0u64..=1 << 20,
    )
        .prop_map(|(deposits, borrows, deposited, borrowed, allowed, unhealthy)| Obligation {
            pubkey: Pubkey::new_unique(),
            version: 1,
            last_update: LastUpdate { slot: 7, stale: false },
            lending_market: Pubkey::new_unique(),
            owner: Pubkey::new_unique(),
            deposits: deposits
                .into_iter()
                .map(|(amount, value)| ObligationCollateral {
                    deposit_reserve: Pubkey::new_unique(),
                    deposited_amount: amount,
                    market_value: Decimal::from_integer(value),
                })
                .collect(),
            borrows: borrows
                .into_iter()
                .map(|(amount, value)| ObligationLiquidity {
                    borrow_reserve: Pubkey::new_unique(),
                    cumulative_borrow_rate_wad: Decimal::one(),
                    borrowed_amount_wad: Decimal::from_integer(amount),
                    market_value: Decimal::from_integer(value),
                })
                .collect(),
            deposited_value: Decimal::from_integer(deposited),
            borrowed_value: Decimal::from_integer(borrowed),
            allowed_borrow_value: Decimal::from_integer(allowed),
            unhealthy_borrow_value: Decimal::from_integer(unhealthy),
            reserved: [0u8; 64],
        })
}

fn arb_instruction() -> impl Strategy<Value = LendingInstruction> {
    prop_oneof![
        Just(LendingInstruction::RefreshReserve),
        any::<u64>().prop_map(|liquidity_amount| {
            LendingInstruction::DepositReserveLiquidity { liquidity_amount }
        }),
        any::<u64>().prop_map(|collateral_amount| {
            LendingInstruction::RedeemReserveCollateral { collateral_amount }
        }),
        Just(LendingInstruction::InitObligation),
        Just(LendingInstruction::RefreshObligation),
        any::<u64>().prop_map(|collateral_amount| {
            LendingInstruction::DepositObligationCollateral { collateral_amount }
        }),
        any::<u64>().prop_map(|collateral_amount| {
            LendingInstruction::WithdrawObligationCollateral { collateral_amount }
        }),
        (
            any::<u64>(),
            prop_oneof![Just(BorrowAmountType::Liquidity), Just(BorrowAmountType::Collateral)]
        )
            .prop_map(|(amount, amount_type)| LendingInstruction::BorrowObligationLiquidity {
                amount,
                amount_type,
            }),
        any::<u64>().prop_map(|liquidity_amount| {
            LendingInstruction::RepayObligationLiquidity { liquidity_amount }
        }),
        any::<u64>().prop_map(|liquidity_amount| {
            LendingInstruction::LiquidateObligation { liquidity_amount }
        }),
    ]
}

// --- Properties ---

proptest! {
    #[test]
    fn reserve_codec_round_trips(reserve in arb_reserve()) {
        let packed = reserve.pack();
        let unpacked = Reserve::unpack(reserve.pubkey, &packed).unwrap();
        prop_assert_eq!(unpacked, reserve);
    }

    #[test]
    fn obligation_codec_round_trips(obligation in arb_obligation()) {
        let packed = obligation.pack();
        let unpacked = Obligation::unpack(obligation.pubkey, &packed).unwrap();
        prop_assert_eq!(unpacked, obligation);
    }

    #[test]
    fn instruction_codec_round_trips(ix in arb_instruction()) {
        let packed = ix.pack();
        prop_assert_eq!(LendingInstruction::unpack(&packed).unwrap(), ix);
    }

    #[test]
    fn utilization_stays_in_unit_range(reserve in arb_reserve()) {
        let utilization = math::utilization_ratio(&reserve).unwrap();
        prop_assert!(utilization <= Decimal::one());
    }

    #[test]
    fn borrow_apy_stays_between_min_and_max(reserve in arb_reserve()) {
        let apy = math::borrow_apy(&reserve).unwrap();
        prop_assert!(apy >= Decimal::from_percent(reserve.config.min_borrow_rate));
        prop_assert!(apy <= Decimal::from_percent(reserve.config.max_borrow_rate));
    }

    #[test]
    fn deposit_apy_never_exceeds_borrow_apy(reserve in arb_reserve()) {
        let borrow = math::borrow_apy(&reserve).unwrap();
        let deposit = math::deposit_apy(&reserve).unwrap();
        prop_assert!(deposit <= borrow);
    }

    #[test]
    fn collateral_conversions_invert_within_rounding(
        reserve in arb_reserve(),
        amount in 0u64..(1 << 63),
    ) {
        let collateral = math::liquidity_to_collateral(amount, &reserve).unwrap();
        let back = math::collateral_to_liquidity(collateral, &reserve).unwrap();
        prop_assert!(back <= amount);
        // Each floor loses less than one collateral unit, which is worth
        // 1/rate liquidity units.
        let rate = math::collateral_exchange_rate(&reserve).unwrap();
        let slack = Decimal::one().try_div(rate).unwrap().try_floor_u64().unwrap() + 2;
        prop_assert!(amount - back <= slack);
    }

    #[test]
    fn withdraw_capacity_never_exceeds_deposits(obligation in arb_obligation()) {
        let reserve = base_reserve();
        let capacity = math::max_withdraw_value_in_liquidity(&obligation, &reserve).unwrap();
        // At price 1 the liquidity capacity equals the withdrawable value.
        prop_assert!(Decimal::from_integer(capacity) <= obligation.deposited_value);
    }

    #[test]
    fn apy_lands_on_the_optimal_rate_at_the_breakpoint(
        optimal_util in 1u8..=99,
        min_rate in 0u8..=20,
    ) {
        // A pool divisible by 100 can sit exactly on the breakpoint, where
        // both segment formulas must agree on the optimal rate.
        let optimal_rate = min_rate + 5;
        let total = 1_000_000u64;
        let borrowed = total * optimal_util as u64 / 100;
        let mut reserve = base_reserve();
        reserve.liquidity.available_amount = total - borrowed;
        reserve.liquidity.borrowed_amount_wad = Decimal::from_integer(borrowed);
        reserve.collateral.mint_total_supply = total;
        reserve.config.optimal_utilization_rate = optimal_util;
        reserve.config.min_borrow_rate = min_rate;
        reserve.config.optimal_borrow_rate = optimal_rate;
        reserve.config.max_borrow_rate = optimal_rate + 10;

        let apy = math::borrow_apy(&reserve).unwrap();
        prop_assert_eq!(apy, Decimal::from_percent(optimal_rate));
    }
}
