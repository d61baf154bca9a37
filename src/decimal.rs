//! Wad fixed point: u128 values scaled by 10^18.
//!
//! Every intermediate that could outgrow 128 bits runs through
//! `spl_math::uint::U192`; floating point exists only at the `to_f64`
//! boundary where a UI needs a display value. Arithmetic mid-calculation is
//! always integer and always checked.

use spl_math::uint::U192;

use crate::constants::{HALF_WAD, PERCENT_DIVISOR, WAD};
use crate::error::LarderError;

/// An unsigned Wad fixed-point value.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct Decimal(pub u128);

/// Rates (utilization, APY, exchange rates) share the representation.
pub type Rate = Decimal;

impl Decimal {
    pub const fn zero() -> Self {
        Decimal(0)
    }

    pub const fn one() -> Self {
        Decimal(WAD)
    }

    /// Wrap an already-scaled raw value, e.g. a `borrowed_amount_wad` field
    /// straight off the wire.
    pub const fn from_scaled_val(val: u128) -> Self {
        Decimal(val)
    }

    pub const fn to_scaled_val(self) -> u128 {
        self.0
    }

    /// Scale an integer amount of base units up to Wad.
    pub fn from_integer(val: u64) -> Self {
        Decimal(val as u128 * WAD)
    }

    /// A whole-percent config byte (0..=100) as a rate.
    pub fn from_percent(percent: u8) -> Self {
        Decimal(percent as u128 * WAD / PERCENT_DIVISOR)
    }

    pub fn is_zero(self) -> bool {
        self.0 == 0
    }

    pub fn try_add(self, rhs: Decimal) -> Result<Decimal, LarderError> {
        self.0
            .checked_add(rhs.0)
            .map(Decimal)
            .ok_or(LarderError::MathOverflow)
    }

    pub fn try_sub(self, rhs: Decimal) -> Result<Decimal, LarderError> {
        self.0
            .checked_sub(rhs.0)
            .map(Decimal)
            .ok_or(LarderError::MathOverflow)
    }

    /// Subtraction clamped at zero, for "remaining capacity" formulas that
    /// must not underflow when the position is already past the limit.
    pub fn saturating_sub(self, rhs: Decimal) -> Decimal {
        Decimal(self.0.saturating_sub(rhs.0))
    }

    pub fn try_mul(self, rhs: Decimal) -> Result<Decimal, LarderError> {
        let wide = U192::from(self.0)
            .checked_mul(U192::from(rhs.0))
            .ok_or(LarderError::MathOverflow)?
            / U192::from(WAD);
        narrow(wide).map(Decimal)
    }

    pub fn try_div(self, rhs: Decimal) -> Result<Decimal, LarderError> {
        if rhs.0 == 0 {
            return Err(LarderError::MathOverflow);
        }
        let wide = U192::from(self.0)
            .checked_mul(U192::from(WAD))
            .ok_or(LarderError::MathOverflow)?
            / U192::from(rhs.0);
        narrow(wide).map(Decimal)
    }

    /// Base units, rounded down.
    pub fn try_floor_u64(self) -> Result<u64, LarderError> {
        u64::try_from(self.0 / WAD).map_err(|_| LarderError::MathOverflow)
    }

    /// Base units, rounded to nearest.
    pub fn try_round_u64(self) -> Result<u64, LarderError> {
        let rounded = self
            .0
            .checked_add(HALF_WAD)
            .ok_or(LarderError::MathOverflow)?
            / WAD;
        u64::try_from(rounded).map_err(|_| LarderError::MathOverflow)
    }

    /// Display-boundary conversion. Precision loss is acceptable here and
    /// nowhere else.
    pub fn to_f64(self) -> f64 {
        self.0 as f64 / WAD as f64
    }
}

fn narrow(wide: U192) -> Result<u128, LarderError> {
    if wide > U192::from(u128::MAX) {
        return Err(LarderError::MathOverflow);
    }
    Ok(wide.as_u128())
}

impl std::fmt::Display for Decimal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let whole = self.0 / WAD;
        let frac = self.0 % WAD;
        write!(f, "{whole}.{frac:018}")
    }
}
