#![deny(unsafe_code)]

//! Larder: client library for an on-chain lending protocol.
//!
//! Three subsystems carry the weight here: byte-exact codecs for the
//! protocol's account records and instruction payloads, an asynchronous
//! account cache with fetch deduplication and change notification, and the
//! Wad fixed-point lending math mirrored from the on-chain program. On top
//! of those, `actions` assembles full user flows (deposit, borrow, repay,
//! withdraw, liquidate) as ordered instruction lists handed to a pluggable
//! transaction submitter.

// 1. mod constants
pub mod constants;

// 2. mod error
pub mod error;

// 3. mod decimal (Wad fixed point)
pub mod decimal;

// 4. mod layout (little-endian cursor codec)
pub mod layout;

// 5. mod state (records + parsers)
pub mod state;

// 6. mod ix (instruction codec + builders)
pub mod ix;

// 7. mod cache (account store, dedup, events)
pub mod cache;

// 8. mod math (lending formulas)
pub mod math;

// 9. mod actions (user flows + submission)
pub mod actions;

pub use crate::actions::{LendingClient, SubmitOptions, SubmitReceipt, TransactionSubmitter};
pub use crate::cache::{AccountsCache, CacheEvent, LedgerReader};
pub use crate::decimal::{Decimal, Rate};
pub use crate::error::LarderError;
pub use crate::state::{LendingMarket, Obligation, ParserKind, Record, Reserve};
