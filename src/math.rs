//! Pure lending formulas over decoded records.
//!
//! These mirror the on-chain program's own fixed-point arithmetic; a
//! divergence here does not fail loudly, it silently disagrees with the
//! ledger. Everything stays in Wad integers, no floats.

use crate::decimal::{Decimal, Rate};
use crate::error::LarderError;
use crate::state::{Obligation, Reserve};

/// Borrowed liquidity in base units, floored out of the Wad field.
pub fn total_borrows(reserve: &Reserve) -> Result<u64, LarderError> {
    reserve.liquidity.borrowed_amount_wad.try_floor_u64()
}

/// Available plus borrowed liquidity, in base units.
pub fn reserve_market_cap(reserve: &Reserve) -> Result<u64, LarderError> {
    reserve
        .liquidity
        .available_amount
        .checked_add(total_borrows(reserve)?)
        .ok_or(LarderError::MathOverflow)
}

/// borrows / (available + borrows). An empty reserve has utilization 0 by
/// convention rather than an undefined ratio.
pub fn utilization_ratio(reserve: &Reserve) -> Result<Rate, LarderError> {
    let borrows = total_borrows(reserve)?;
    let cap = reserve_market_cap(reserve)?;
    if cap == 0 {
        return Ok(Rate::zero());
    }
    Decimal::from_integer(borrows).try_div(Decimal::from_integer(cap))
}

/// Two-segment interpolated borrow rate.
///
/// Below the optimal utilization breakpoint the rate runs from
/// `min_borrow_rate` to `optimal_borrow_rate`; above it, from
/// `optimal_borrow_rate` to `max_borrow_rate`. At 100% optimal utilization
/// the upper segment would divide by zero, so the lower formula covers the
/// whole range.
pub fn borrow_apy(reserve: &Reserve) -> Result<Rate, LarderError> {
    let utilization = utilization_ratio(reserve)?;
    let optimal_utilization = Decimal::from_percent(reserve.config.optimal_utilization_rate);
    let min_rate = Decimal::from_percent(reserve.config.min_borrow_rate);
    let optimal_rate = Decimal::from_percent(reserve.config.optimal_borrow_rate);
    let max_rate = Decimal::from_percent(reserve.config.max_borrow_rate);

    if reserve.config.optimal_utilization_rate == 100 || utilization < optimal_utilization {
        let normalized = utilization.try_div(optimal_utilization)?;
        normalized.try_mul(optimal_rate.try_sub(min_rate)?)?.try_add(min_rate)
    } else {
        let excess = utilization.try_sub(optimal_utilization)?;
        let span = Decimal::one().try_sub(optimal_utilization)?;
        let normalized = excess.try_div(span)?;
        normalized.try_mul(max_rate.try_sub(optimal_rate)?)?.try_add(optimal_rate)
    }
}

/// Suppliers earn the borrow rate scaled by how much of the pool is out.
pub fn deposit_apy(reserve: &Reserve) -> Result<Rate, LarderError> {
    utilization_ratio(reserve)?.try_mul(borrow_apy(reserve)?)
}

/// Collateral tokens per unit of underlying liquidity.
///
/// A pool with no collateral minted yet opens at rate 1 (supply taken equal
/// to the market cap); a pool that is empty on both sides is also rate 1 so
/// conversions through it are identity rather than zero.
pub fn collateral_exchange_rate(reserve: &Reserve) -> Result<Rate, LarderError> {
    let cap = reserve_market_cap(reserve)?;
    if cap == 0 {
        return Ok(Rate::one());
    }
    let supply = match reserve.collateral.mint_total_supply {
        0 => cap,
        supply => supply,
    };
    Decimal::from_integer(supply).try_div(Decimal::from_integer(cap))
}

/// Collateral base units -> liquidity base units, floored.
pub fn collateral_to_liquidity(collateral_amount: u64, reserve: &Reserve) -> Result<u64, LarderError> {
    let rate = collateral_exchange_rate(reserve)?;
    Decimal::from_integer(collateral_amount).try_div(rate)?.try_floor_u64()
}

/// Liquidity base units -> collateral base units, floored.
pub fn liquidity_to_collateral(liquidity_amount: u64, reserve: &Reserve) -> Result<u64, LarderError> {
    let rate = collateral_exchange_rate(reserve)?;
    Decimal::from_integer(liquidity_amount).try_mul(rate)?.try_floor_u64()
}

/// Remaining borrow capacity against `reserve`, in liquidity base units.
/// No obligation, an exhausted allowance, or an unpriced reserve all mean 0.
pub fn max_borrow_value_in_liquidity(
    obligation: Option<&Obligation>,
    reserve: &Reserve,
) -> Result<u64, LarderError> {
    let obligation = match obligation {
        Some(obligation) => obligation,
        None => return Ok(0),
    };
    if reserve.liquidity.market_price == 0 {
        return Ok(0);
    }
    let remaining_value = obligation
        .allowed_borrow_value
        .saturating_sub(obligation.borrowed_value);
    remaining_value
        .try_div(Decimal::from_integer(reserve.liquidity.market_price))?
        .try_floor_u64()
}

/// How much deposited value can leave the obligation without making it
/// unhealthy, in liquidity base units of `reserve`.
///
/// The deposit value the current borrows pin down is
/// `borrowed * deposited / allowed`; only the excess above that is
/// withdrawable, and the subtraction saturates so the result is never
/// negative.
pub fn max_withdraw_value_in_liquidity(
    obligation: &Obligation,
    reserve: &Reserve,
) -> Result<u64, LarderError> {
    if reserve.liquidity.market_price == 0 {
        return Ok(0);
    }
    let required_deposit_value = if obligation.allowed_borrow_value.is_zero() {
        Decimal::zero()
    } else {
        obligation
            .borrowed_value
            .try_mul(obligation.deposited_value)?
            .try_div(obligation.allowed_borrow_value)?
    };
    if required_deposit_value >= obligation.deposited_value {
        return Ok(0);
    }
    obligation
        .deposited_value
        .saturating_sub(required_deposit_value)
        .try_div(Decimal::from_integer(reserve.liquidity.market_price))?
        .try_floor_u64()
}

/// Distance from liquidation: unhealthy threshold value over current
/// borrowed value. `None` when nothing is borrowed; below 1 the obligation
/// is eligible for liquidation.
pub fn health_factor(obligation: &Obligation) -> Option<Rate> {
    if obligation.borrowed_value.is_zero() {
        return None;
    }
    obligation
        .unhealthy_borrow_value
        .try_div(obligation.borrowed_value)
        .ok()
}
