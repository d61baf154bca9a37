//! Instruction payload codec and per-instruction builders.
//!
//! Payloads are a one-byte tag followed by little-endian fields. Unlike
//! record parsing, instruction decoding throws: an unknown tag or a
//! truncated payload is `InvalidInstruction`, never a silent absence.

use num_derive::FromPrimitive;
use num_traits::FromPrimitive as _;
use solana_program::instruction::{AccountMeta, Instruction};
use solana_program::pubkey::Pubkey;
use solana_program::sysvar;

use crate::error::LarderError;
use crate::layout;

/// Which unit the caller denominated a borrow in. Selects the mint whose
/// exchange rate governs the lamport conversion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive)]
pub enum BorrowAmountType {
    /// Amount of liquidity to receive.
    Liquidity = 0,
    /// Amount of collateral to post as the new borrow basis.
    Collateral = 1,
}

/// Wire instructions understood by the lending program. Tags are part of
/// the contract and never reordered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LendingInstruction {
    /// 3
    RefreshReserve,
    /// 4
    DepositReserveLiquidity { liquidity_amount: u64 },
    /// 5
    RedeemReserveCollateral { collateral_amount: u64 },
    /// 6
    InitObligation,
    /// 7
    RefreshObligation,
    /// 8
    DepositObligationCollateral { collateral_amount: u64 },
    /// 9
    WithdrawObligationCollateral { collateral_amount: u64 },
    /// 10
    BorrowObligationLiquidity { amount: u64, amount_type: BorrowAmountType },
    /// 11
    RepayObligationLiquidity { liquidity_amount: u64 },
    /// 12
    LiquidateObligation { liquidity_amount: u64 },
}

impl LendingInstruction {
    pub fn pack(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(16);
        match *self {
            Self::RefreshReserve => layout::write_u8(3, &mut buf),
            Self::DepositReserveLiquidity { liquidity_amount } => {
                layout::write_u8(4, &mut buf);
                layout::write_u64(liquidity_amount, &mut buf);
            }
            Self::RedeemReserveCollateral { collateral_amount } => {
                layout::write_u8(5, &mut buf);
                layout::write_u64(collateral_amount, &mut buf);
            }
            Self::InitObligation => layout::write_u8(6, &mut buf),
            Self::RefreshObligation => layout::write_u8(7, &mut buf),
            Self::DepositObligationCollateral { collateral_amount } => {
                layout::write_u8(8, &mut buf);
                layout::write_u64(collateral_amount, &mut buf);
            }
            Self::WithdrawObligationCollateral { collateral_amount } => {
                layout::write_u8(9, &mut buf);
                layout::write_u64(collateral_amount, &mut buf);
            }
            Self::BorrowObligationLiquidity { amount, amount_type } => {
                layout::write_u8(10, &mut buf);
                layout::write_u64(amount, &mut buf);
                layout::write_u8(amount_type as u8, &mut buf);
            }
            Self::RepayObligationLiquidity { liquidity_amount } => {
                layout::write_u8(11, &mut buf);
                layout::write_u64(liquidity_amount, &mut buf);
            }
            Self::LiquidateObligation { liquidity_amount } => {
                layout::write_u8(12, &mut buf);
                layout::write_u64(liquidity_amount, &mut buf);
            }
        }
        buf
    }

    pub fn unpack(input: &[u8]) -> Result<Self, LarderError> {
        let (&tag, mut rest) = input.split_first().ok_or(LarderError::InvalidInstruction)?;
        let read_amount = |rest: &mut &[u8]| {
            layout::read_u64(rest).map_err(|_| LarderError::InvalidInstruction)
        };
        let ix = match tag {
            3 => Self::RefreshReserve,
            4 => Self::DepositReserveLiquidity { liquidity_amount: read_amount(&mut rest)? },
            5 => Self::RedeemReserveCollateral { collateral_amount: read_amount(&mut rest)? },
            6 => Self::InitObligation,
            7 => Self::RefreshObligation,
            8 => Self::DepositObligationCollateral { collateral_amount: read_amount(&mut rest)? },
            9 => Self::WithdrawObligationCollateral { collateral_amount: read_amount(&mut rest)? },
            10 => {
                let amount = read_amount(&mut rest)?;
                let raw = layout::read_u8(&mut rest).map_err(|_| LarderError::InvalidInstruction)?;
                let amount_type =
                    BorrowAmountType::from_u8(raw).ok_or(LarderError::InvalidInstruction)?;
                Self::BorrowObligationLiquidity { amount, amount_type }
            }
            11 => Self::RepayObligationLiquidity { liquidity_amount: read_amount(&mut rest)? },
            12 => Self::LiquidateObligation { liquidity_amount: read_amount(&mut rest)? },
            _ => return Err(LarderError::InvalidInstruction),
        };
        if !rest.is_empty() {
            return Err(LarderError::InvalidInstruction);
        }
        Ok(ix)
    }
}

/// Derived authority that signs for the market's supply accounts.
pub fn lending_market_authority(program_id: &Pubkey, lending_market: &Pubkey) -> (Pubkey, u8) {
    Pubkey::find_program_address(&[lending_market.as_ref()], program_id)
}

pub fn refresh_reserve(program_id: &Pubkey, reserve: &Pubkey, oracle: &Pubkey) -> Instruction {
    Instruction {
        program_id: *program_id,
        accounts: vec![
            AccountMeta::new(*reserve, false),
            AccountMeta::new_readonly(*oracle, false),
            AccountMeta::new_readonly(sysvar::clock::id(), false),
        ],
        data: LendingInstruction::RefreshReserve.pack(),
    }
}

/// Reserves must be listed in obligation order: deposits first, then
/// borrows, matching the element order of the obligation record.
pub fn refresh_obligation(
    program_id: &Pubkey,
    obligation: &Pubkey,
    reserves: &[Pubkey],
) -> Instruction {
    let mut accounts = vec![
        AccountMeta::new(*obligation, false),
        AccountMeta::new_readonly(sysvar::clock::id(), false),
    ];
    accounts.extend(reserves.iter().map(|r| AccountMeta::new_readonly(*r, false)));
    Instruction {
        program_id: *program_id,
        accounts,
        data: LendingInstruction::RefreshObligation.pack(),
    }
}

#[allow(clippy::too_many_arguments)]
pub fn deposit_reserve_liquidity(
    program_id: &Pubkey,
    liquidity_amount: u64,
    source_liquidity: &Pubkey,
    destination_collateral: &Pubkey,
    reserve: &Pubkey,
    reserve_liquidity_supply: &Pubkey,
    reserve_collateral_mint: &Pubkey,
    lending_market: &Pubkey,
    user_transfer_authority: &Pubkey,
) -> Instruction {
    let (authority, _bump) = lending_market_authority(program_id, lending_market);
    Instruction {
        program_id: *program_id,
        accounts: vec![
            AccountMeta::new(*source_liquidity, false),
            AccountMeta::new(*destination_collateral, false),
            AccountMeta::new(*reserve, false),
            AccountMeta::new(*reserve_liquidity_supply, false),
            AccountMeta::new(*reserve_collateral_mint, false),
            AccountMeta::new_readonly(*lending_market, false),
            AccountMeta::new_readonly(authority, false),
            AccountMeta::new_readonly(*user_transfer_authority, true),
            AccountMeta::new_readonly(spl_token::id(), false),
        ],
        data: LendingInstruction::DepositReserveLiquidity { liquidity_amount }.pack(),
    }
}

#[allow(clippy::too_many_arguments)]
pub fn redeem_reserve_collateral(
    program_id: &Pubkey,
    collateral_amount: u64,
    source_collateral: &Pubkey,
    destination_liquidity: &Pubkey,
    reserve: &Pubkey,
    reserve_collateral_mint: &Pubkey,
    reserve_liquidity_supply: &Pubkey,
    lending_market: &Pubkey,
    user_transfer_authority: &Pubkey,
) -> Instruction {
    let (authority, _bump) = lending_market_authority(program_id, lending_market);
    Instruction {
        program_id: *program_id,
        accounts: vec![
            AccountMeta::new(*source_collateral, false),
            AccountMeta::new(*destination_liquidity, false),
            AccountMeta::new(*reserve, false),
            AccountMeta::new(*reserve_collateral_mint, false),
            AccountMeta::new(*reserve_liquidity_supply, false),
            AccountMeta::new_readonly(*lending_market, false),
            AccountMeta::new_readonly(authority, false),
            AccountMeta::new_readonly(*user_transfer_authority, true),
            AccountMeta::new_readonly(spl_token::id(), false),
        ],
        data: LendingInstruction::RedeemReserveCollateral { collateral_amount }.pack(),
    }
}

pub fn init_obligation(
    program_id: &Pubkey,
    obligation: &Pubkey,
    lending_market: &Pubkey,
    obligation_owner: &Pubkey,
) -> Instruction {
    Instruction {
        program_id: *program_id,
        accounts: vec![
            AccountMeta::new(*obligation, false),
            AccountMeta::new_readonly(*lending_market, false),
            AccountMeta::new_readonly(*obligation_owner, true),
            AccountMeta::new_readonly(sysvar::clock::id(), false),
            AccountMeta::new_readonly(sysvar::rent::id(), false),
            AccountMeta::new_readonly(spl_token::id(), false),
        ],
        data: LendingInstruction::InitObligation.pack(),
    }
}

#[allow(clippy::too_many_arguments)]
pub fn deposit_obligation_collateral(
    program_id: &Pubkey,
    collateral_amount: u64,
    source_collateral: &Pubkey,
    destination_collateral: &Pubkey,
    deposit_reserve: &Pubkey,
    obligation: &Pubkey,
    lending_market: &Pubkey,
    obligation_owner: &Pubkey,
    user_transfer_authority: &Pubkey,
) -> Instruction {
    let (authority, _bump) = lending_market_authority(program_id, lending_market);
    Instruction {
        program_id: *program_id,
        accounts: vec![
            AccountMeta::new(*source_collateral, false),
            AccountMeta::new(*destination_collateral, false),
            AccountMeta::new_readonly(*deposit_reserve, false),
            AccountMeta::new(*obligation, false),
            AccountMeta::new_readonly(*lending_market, false),
            AccountMeta::new_readonly(authority, false),
            AccountMeta::new_readonly(*obligation_owner, true),
            AccountMeta::new_readonly(*user_transfer_authority, true),
            AccountMeta::new_readonly(spl_token::id(), false),
        ],
        data: LendingInstruction::DepositObligationCollateral { collateral_amount }.pack(),
    }
}

#[allow(clippy::too_many_arguments)]
pub fn withdraw_obligation_collateral(
    program_id: &Pubkey,
    collateral_amount: u64,
    source_collateral: &Pubkey,
    destination_collateral: &Pubkey,
    withdraw_reserve: &Pubkey,
    obligation: &Pubkey,
    lending_market: &Pubkey,
    obligation_owner: &Pubkey,
) -> Instruction {
    let (authority, _bump) = lending_market_authority(program_id, lending_market);
    Instruction {
        program_id: *program_id,
        accounts: vec![
            AccountMeta::new(*source_collateral, false),
            AccountMeta::new(*destination_collateral, false),
            AccountMeta::new_readonly(*withdraw_reserve, false),
            AccountMeta::new(*obligation, false),
            AccountMeta::new_readonly(*lending_market, false),
            AccountMeta::new_readonly(authority, false),
            AccountMeta::new_readonly(*obligation_owner, true),
            AccountMeta::new_readonly(spl_token::id(), false),
        ],
        data: LendingInstruction::WithdrawObligationCollateral { collateral_amount }.pack(),
    }
}

#[allow(clippy::too_many_arguments)]
pub fn borrow_obligation_liquidity(
    program_id: &Pubkey,
    amount: u64,
    amount_type: BorrowAmountType,
    source_collateral: &Pubkey,
    source_liquidity: &Pubkey,
    destination_liquidity: &Pubkey,
    borrow_reserve: &Pubkey,
    borrow_reserve_fee_receiver: &Pubkey,
    deposit_reserve: &Pubkey,
    deposit_reserve_collateral_supply: &Pubkey,
    obligation: &Pubkey,
    lending_market: &Pubkey,
    user_transfer_authority: &Pubkey,
    dex_market: &Pubkey,
    dex_order_book_side: &Pubkey,
) -> Instruction {
    let (authority, _bump) = lending_market_authority(program_id, lending_market);
    Instruction {
        program_id: *program_id,
        accounts: vec![
            AccountMeta::new(*source_collateral, false),
            AccountMeta::new(*source_liquidity, false),
            AccountMeta::new(*destination_liquidity, false),
            AccountMeta::new(*borrow_reserve, false),
            AccountMeta::new(*borrow_reserve_fee_receiver, false),
            AccountMeta::new_readonly(*deposit_reserve, false),
            AccountMeta::new(*deposit_reserve_collateral_supply, false),
            AccountMeta::new(*obligation, false),
            AccountMeta::new_readonly(*lending_market, false),
            AccountMeta::new_readonly(authority, false),
            AccountMeta::new_readonly(*user_transfer_authority, true),
            AccountMeta::new_readonly(*dex_market, false),
            AccountMeta::new_readonly(*dex_order_book_side, false),
            AccountMeta::new_readonly(sysvar::clock::id(), false),
            AccountMeta::new_readonly(spl_token::id(), false),
        ],
        data: LendingInstruction::BorrowObligationLiquidity { amount, amount_type }.pack(),
    }
}

#[allow(clippy::too_many_arguments)]
pub fn repay_obligation_liquidity(
    program_id: &Pubkey,
    liquidity_amount: u64,
    source_liquidity: &Pubkey,
    destination_liquidity: &Pubkey,
    repay_reserve: &Pubkey,
    obligation: &Pubkey,
    lending_market: &Pubkey,
    user_transfer_authority: &Pubkey,
) -> Instruction {
    let (authority, _bump) = lending_market_authority(program_id, lending_market);
    Instruction {
        program_id: *program_id,
        accounts: vec![
            AccountMeta::new(*source_liquidity, false),
            AccountMeta::new(*destination_liquidity, false),
            AccountMeta::new(*repay_reserve, false),
            AccountMeta::new(*obligation, false),
            AccountMeta::new_readonly(*lending_market, false),
            AccountMeta::new_readonly(authority, false),
            AccountMeta::new_readonly(*user_transfer_authority, true),
            AccountMeta::new_readonly(sysvar::clock::id(), false),
            AccountMeta::new_readonly(spl_token::id(), false),
        ],
        data: LendingInstruction::RepayObligationLiquidity { liquidity_amount }.pack(),
    }
}

#[allow(clippy::too_many_arguments)]
pub fn liquidate_obligation(
    program_id: &Pubkey,
    liquidity_amount: u64,
    source_liquidity: &Pubkey,
    destination_collateral: &Pubkey,
    repay_reserve: &Pubkey,
    repay_reserve_liquidity_supply: &Pubkey,
    withdraw_reserve: &Pubkey,
    withdraw_reserve_collateral_supply: &Pubkey,
    obligation: &Pubkey,
    lending_market: &Pubkey,
    user_transfer_authority: &Pubkey,
    dex_market: &Pubkey,
    dex_order_book_side: &Pubkey,
) -> Instruction {
    let (authority, _bump) = lending_market_authority(program_id, lending_market);
    Instruction {
        program_id: *program_id,
        accounts: vec![
            AccountMeta::new(*source_liquidity, false),
            AccountMeta::new(*destination_collateral, false),
            AccountMeta::new(*repay_reserve, false),
            AccountMeta::new(*repay_reserve_liquidity_supply, false),
            AccountMeta::new_readonly(*withdraw_reserve, false),
            AccountMeta::new(*withdraw_reserve_collateral_supply, false),
            AccountMeta::new(*obligation, false),
            AccountMeta::new_readonly(*lending_market, false),
            AccountMeta::new_readonly(authority, false),
            AccountMeta::new_readonly(*user_transfer_authority, true),
            AccountMeta::new_readonly(*dex_market, false),
            AccountMeta::new_readonly(*dex_order_book_side, false),
            AccountMeta::new_readonly(sysvar::clock::id(), false),
            AccountMeta::new_readonly(spl_token::id(), false),
        ],
        data: LendingInstruction::LiquidateObligation { liquidity_amount }.pack(),
    }
}
