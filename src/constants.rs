//! Protocol-wide constants. Record spans are the single source of truth for
//! the wire contract; a buffer that does not match one of these exactly is
//! not a record.

use std::time::Duration;

/// Wad scale: fixed-point values are integers scaled by 10^18.
pub const WAD: u128 = 1_000_000_000_000_000_000;

/// Half a Wad, for round-to-nearest conversions.
pub const HALF_WAD: u128 = WAD / 2;

/// Config percentages are whole percents in 0..=100.
pub const PERCENT_DIVISOR: u128 = 100;

/// Reserve record span in bytes.
pub const RESERVE_LEN: usize = 563;

/// Obligation record span in bytes.
pub const OBLIGATION_LEN: usize = 1004;

/// Lending market record span in bytes.
pub const LENDING_MARKET_LEN: usize = 226;

/// Dex market header span in bytes.
pub const DEX_MARKET_LEN: usize = 248;

/// Combined deposit + borrow reserves an obligation may reference.
pub const MAX_OBLIGATION_RESERVES: usize = 10;

/// Size of one packed obligation collateral element.
pub const OBLIGATION_COLLATERAL_LEN: usize = 56;

/// Size of one packed obligation liquidity element.
pub const OBLIGATION_LIQUIDITY_LEN: usize = 80;

/// Hard remote limit on addresses per getMultipleAccounts call.
pub const GET_MULTIPLE_LIMIT: usize = 99;

/// How long a submitted transaction may wait for confirmation before the
/// operation is treated as failed. A confirmation landing later is dropped.
pub const CONFIRM_TIMEOUT: Duration = Duration::from_secs(15);

/// Poll interval while waiting on a signature status.
pub const CONFIRM_POLL_INTERVAL: Duration = Duration::from_millis(500);
