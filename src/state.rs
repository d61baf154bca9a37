//! Typed account records and their byte-exact layouts.
//!
//! Every record is an immutable snapshot tagged with the address it was
//! read from. Unpacking checks the schema span exactly; reserved tails are
//! carried opaquely so a re-encoded record round-trips byte-for-byte.
//! Parsers sit on top of unpacking and apply the absence policy: a
//! structurally valid but uninitialized record (zero `last_update.slot`)
//! parses to `None`, never to a zero-valued struct.

use arrayref::{array_mut_ref, array_ref, array_refs, mut_array_refs};
use solana_program::program_pack::Pack;
use solana_program::pubkey::Pubkey;
use solana_sdk::account::Account;

use crate::constants::{
    DEX_MARKET_LEN, LENDING_MARKET_LEN, MAX_OBLIGATION_RESERVES, OBLIGATION_COLLATERAL_LEN,
    OBLIGATION_LEN, OBLIGATION_LIQUIDITY_LEN, RESERVE_LEN,
};
use crate::decimal::Decimal;
use crate::error::LarderError;
use crate::layout;

/// Slot-stamped freshness marker shared by reserves and obligations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LastUpdate {
    pub slot: u64,
    pub stale: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReserveLiquidity {
    pub mint: Pubkey,
    pub mint_decimals: u8,
    pub supply: Pubkey,
    pub fee_receiver: Pubkey,
    pub oracle: Pubkey,
    pub available_amount: u64,
    pub borrowed_amount_wad: Decimal,
    pub cumulative_borrow_rate_wad: Decimal,
    pub market_price: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReserveCollateral {
    pub mint: Pubkey,
    pub mint_total_supply: u64,
    pub supply: Pubkey,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReserveFees {
    pub borrow_fee_wad: u64,
    pub flash_loan_fee_wad: u64,
    pub host_fee_percentage: u8,
}

/// Rate-curve and risk parameters, all whole percents (0..=100).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReserveConfig {
    pub optimal_utilization_rate: u8,
    pub loan_to_value_ratio: u8,
    pub liquidation_bonus: u8,
    pub liquidation_threshold: u8,
    pub min_borrow_rate: u8,
    pub optimal_borrow_rate: u8,
    pub max_borrow_rate: u8,
    pub fees: ReserveFees,
}

/// One asset's lending pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reserve {
    pub pubkey: Pubkey,
    pub version: u8,
    pub last_update: LastUpdate,
    pub lending_market: Pubkey,
    pub liquidity: ReserveLiquidity,
    pub collateral: ReserveCollateral,
    pub config: ReserveConfig,
    pub reserved: [u8; 248],
}

impl Reserve {
    pub const LEN: usize = RESERVE_LEN;

    pub fn unpack(pubkey: Pubkey, data: &[u8]) -> Result<Self, LarderError> {
        if data.len() != Self::LEN {
            return Err(LarderError::MalformedRecord);
        }
        let src = array_ref![data, 0, RESERVE_LEN];
        #[allow(clippy::ptr_offset_with_cast)]
        let (
            version,
            last_update_slot,
            last_update_stale,
            lending_market,
            liq_mint,
            liq_mint_decimals,
            liq_supply,
            liq_fee_receiver,
            liq_oracle,
            liq_available_amount,
            liq_borrowed_amount_wad,
            liq_cumulative_borrow_rate_wad,
            liq_market_price,
            col_mint,
            col_mint_total_supply,
            col_supply,
            config_rates,
            borrow_fee_wad,
            flash_loan_fee_wad,
            host_fee_percentage,
            reserved,
        ) = array_refs![
            src, 1, 8, 1, 32, 32, 1, 32, 32, 32, 8, 16, 16, 8, 32, 8, 32, 7, 8, 8, 1, 248
        ];

        Ok(Reserve {
            pubkey,
            version: version[0],
            last_update: LastUpdate {
                slot: u64::from_le_bytes(*last_update_slot),
                stale: last_update_stale[0] != 0,
            },
            lending_market: Pubkey::new_from_array(*lending_market),
            liquidity: ReserveLiquidity {
                mint: Pubkey::new_from_array(*liq_mint),
                mint_decimals: liq_mint_decimals[0],
                supply: Pubkey::new_from_array(*liq_supply),
                fee_receiver: Pubkey::new_from_array(*liq_fee_receiver),
                oracle: Pubkey::new_from_array(*liq_oracle),
                available_amount: u64::from_le_bytes(*liq_available_amount),
                borrowed_amount_wad: Decimal::from_scaled_val(u128::from_le_bytes(
                    *liq_borrowed_amount_wad,
                )),
                cumulative_borrow_rate_wad: Decimal::from_scaled_val(u128::from_le_bytes(
                    *liq_cumulative_borrow_rate_wad,
                )),
                market_price: u64::from_le_bytes(*liq_market_price),
            },
            collateral: ReserveCollateral {
                mint: Pubkey::new_from_array(*col_mint),
                mint_total_supply: u64::from_le_bytes(*col_mint_total_supply),
                supply: Pubkey::new_from_array(*col_supply),
            },
            config: ReserveConfig {
                optimal_utilization_rate: config_rates[0],
                loan_to_value_ratio: config_rates[1],
                liquidation_bonus: config_rates[2],
                liquidation_threshold: config_rates[3],
                min_borrow_rate: config_rates[4],
                optimal_borrow_rate: config_rates[5],
                max_borrow_rate: config_rates[6],
                fees: ReserveFees {
                    borrow_fee_wad: u64::from_le_bytes(*borrow_fee_wad),
                    flash_loan_fee_wad: u64::from_le_bytes(*flash_loan_fee_wad),
                    host_fee_percentage: host_fee_percentage[0],
                },
            },
            reserved: *reserved,
        })
    }

    pub fn pack(&self) -> [u8; RESERVE_LEN] {
        let mut out = [0u8; RESERVE_LEN];
        {
            let dst = array_mut_ref![out, 0, RESERVE_LEN];
            #[allow(clippy::ptr_offset_with_cast)]
            let (
                version,
                last_update_slot,
                last_update_stale,
                lending_market,
                liq_mint,
                liq_mint_decimals,
                liq_supply,
                liq_fee_receiver,
                liq_oracle,
                liq_available_amount,
                liq_borrowed_amount_wad,
                liq_cumulative_borrow_rate_wad,
                liq_market_price,
                col_mint,
                col_mint_total_supply,
                col_supply,
                config_rates,
                borrow_fee_wad,
                flash_loan_fee_wad,
                host_fee_percentage,
                reserved,
            ) = mut_array_refs![
                dst, 1, 8, 1, 32, 32, 1, 32, 32, 32, 8, 16, 16, 8, 32, 8, 32, 7, 8, 8, 1, 248
            ];
            version[0] = self.version;
            *last_update_slot = self.last_update.slot.to_le_bytes();
            last_update_stale[0] = self.last_update.stale as u8;
            lending_market.copy_from_slice(self.lending_market.as_ref());
            liq_mint.copy_from_slice(self.liquidity.mint.as_ref());
            liq_mint_decimals[0] = self.liquidity.mint_decimals;
            liq_supply.copy_from_slice(self.liquidity.supply.as_ref());
            liq_fee_receiver.copy_from_slice(self.liquidity.fee_receiver.as_ref());
            liq_oracle.copy_from_slice(self.liquidity.oracle.as_ref());
            *liq_available_amount = self.liquidity.available_amount.to_le_bytes();
            *liq_borrowed_amount_wad =
                self.liquidity.borrowed_amount_wad.to_scaled_val().to_le_bytes();
            *liq_cumulative_borrow_rate_wad = self
                .liquidity
                .cumulative_borrow_rate_wad
                .to_scaled_val()
                .to_le_bytes();
            *liq_market_price = self.liquidity.market_price.to_le_bytes();
            col_mint.copy_from_slice(self.collateral.mint.as_ref());
            *col_mint_total_supply = self.collateral.mint_total_supply.to_le_bytes();
            col_supply.copy_from_slice(self.collateral.supply.as_ref());
            config_rates[0] = self.config.optimal_utilization_rate;
            config_rates[1] = self.config.loan_to_value_ratio;
            config_rates[2] = self.config.liquidation_bonus;
            config_rates[3] = self.config.liquidation_threshold;
            config_rates[4] = self.config.min_borrow_rate;
            config_rates[5] = self.config.optimal_borrow_rate;
            config_rates[6] = self.config.max_borrow_rate;
            *borrow_fee_wad = self.config.fees.borrow_fee_wad.to_le_bytes();
            *flash_loan_fee_wad = self.config.fees.flash_loan_fee_wad.to_le_bytes();
            host_fee_percentage[0] = self.config.fees.host_fee_percentage;
            reserved.copy_from_slice(&self.reserved);
        }
        out
    }
}

/// One deposit leg of an obligation, unique by reserve.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObligationCollateral {
    pub deposit_reserve: Pubkey,
    pub deposited_amount: u64,
    pub market_value: Decimal,
}

/// One borrow leg of an obligation, unique by reserve.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObligationLiquidity {
    pub borrow_reserve: Pubkey,
    pub cumulative_borrow_rate_wad: Decimal,
    pub borrowed_amount_wad: Decimal,
    pub market_value: Decimal,
}

/// One user's aggregate borrowing position.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Obligation {
    pub pubkey: Pubkey,
    pub version: u8,
    pub last_update: LastUpdate,
    pub lending_market: Pubkey,
    pub owner: Pubkey,
    pub deposits: Vec<ObligationCollateral>,
    pub borrows: Vec<ObligationLiquidity>,
    pub deposited_value: Decimal,
    pub borrowed_value: Decimal,
    pub allowed_borrow_value: Decimal,
    pub unhealthy_borrow_value: Decimal,
    pub reserved: [u8; 64],
}

impl Obligation {
    pub const LEN: usize = OBLIGATION_LEN;
    const FLAT_LEN: usize = OBLIGATION_LEN - 204;

    pub fn unpack(pubkey: Pubkey, data: &[u8]) -> Result<Self, LarderError> {
        if data.len() != Self::LEN {
            return Err(LarderError::MalformedRecord);
        }
        let mut cursor = data;
        let version = layout::read_u8(&mut cursor)?;
        let slot = layout::read_u64(&mut cursor)?;
        let stale = layout::read_u8(&mut cursor)? != 0;
        let lending_market = layout::read_pubkey(&mut cursor)?;
        let owner = layout::read_pubkey(&mut cursor)?;
        let deposited_value = Decimal::from_scaled_val(layout::read_u128(&mut cursor)?);
        let borrowed_value = Decimal::from_scaled_val(layout::read_u128(&mut cursor)?);
        let allowed_borrow_value = Decimal::from_scaled_val(layout::read_u128(&mut cursor)?);
        let unhealthy_borrow_value = Decimal::from_scaled_val(layout::read_u128(&mut cursor)?);
        let reserved: [u8; 64] = layout::read_bytes(&mut cursor, 64)?.try_into().unwrap();
        let deposits_len = layout::read_u8(&mut cursor)? as usize;
        let borrows_len = layout::read_u8(&mut cursor)? as usize;

        // Declared counts must fit both the reserve cap and the flat region.
        if deposits_len + borrows_len > MAX_OBLIGATION_RESERVES {
            return Err(LarderError::MalformedRecord);
        }
        let need = deposits_len * OBLIGATION_COLLATERAL_LEN + borrows_len * OBLIGATION_LIQUIDITY_LEN;
        if need > Self::FLAT_LEN {
            return Err(LarderError::MalformedRecord);
        }

        let mut deposits = Vec::with_capacity(deposits_len);
        for _ in 0..deposits_len {
            deposits.push(ObligationCollateral {
                deposit_reserve: layout::read_pubkey(&mut cursor)?,
                deposited_amount: layout::read_u64(&mut cursor)?,
                market_value: Decimal::from_scaled_val(layout::read_u128(&mut cursor)?),
            });
        }
        let mut borrows = Vec::with_capacity(borrows_len);
        for _ in 0..borrows_len {
            borrows.push(ObligationLiquidity {
                borrow_reserve: layout::read_pubkey(&mut cursor)?,
                cumulative_borrow_rate_wad: Decimal::from_scaled_val(layout::read_u128(
                    &mut cursor,
                )?),
                borrowed_amount_wad: Decimal::from_scaled_val(layout::read_u128(&mut cursor)?),
                market_value: Decimal::from_scaled_val(layout::read_u128(&mut cursor)?),
            });
        }

        Ok(Obligation {
            pubkey,
            version,
            last_update: LastUpdate { slot, stale },
            lending_market,
            owner,
            deposits,
            borrows,
            deposited_value,
            borrowed_value,
            allowed_borrow_value,
            unhealthy_borrow_value,
            reserved,
        })
    }

    /// Panics if the legs exceed the reserve cap or the flat region; such
    /// an obligation has no wire representation.
    pub fn pack(&self) -> [u8; OBLIGATION_LEN] {
        let need = self.deposits.len() * OBLIGATION_COLLATERAL_LEN
            + self.borrows.len() * OBLIGATION_LIQUIDITY_LEN;
        assert!(
            self.deposits.len() + self.borrows.len() <= MAX_OBLIGATION_RESERVES
                && need <= Self::FLAT_LEN,
            "obligation legs exceed the flat region"
        );
        let mut buf = Vec::with_capacity(OBLIGATION_LEN);
        layout::write_u8(self.version, &mut buf);
        layout::write_u64(self.last_update.slot, &mut buf);
        layout::write_u8(self.last_update.stale as u8, &mut buf);
        layout::write_pubkey(&self.lending_market, &mut buf);
        layout::write_pubkey(&self.owner, &mut buf);
        layout::write_u128(self.deposited_value.to_scaled_val(), &mut buf);
        layout::write_u128(self.borrowed_value.to_scaled_val(), &mut buf);
        layout::write_u128(self.allowed_borrow_value.to_scaled_val(), &mut buf);
        layout::write_u128(self.unhealthy_borrow_value.to_scaled_val(), &mut buf);
        layout::write_bytes(&self.reserved, &mut buf);
        layout::write_u8(self.deposits.len() as u8, &mut buf);
        layout::write_u8(self.borrows.len() as u8, &mut buf);
        for deposit in &self.deposits {
            layout::write_pubkey(&deposit.deposit_reserve, &mut buf);
            layout::write_u64(deposit.deposited_amount, &mut buf);
            layout::write_u128(deposit.market_value.to_scaled_val(), &mut buf);
        }
        for borrow in &self.borrows {
            layout::write_pubkey(&borrow.borrow_reserve, &mut buf);
            layout::write_u128(borrow.cumulative_borrow_rate_wad.to_scaled_val(), &mut buf);
            layout::write_u128(borrow.borrowed_amount_wad.to_scaled_val(), &mut buf);
            layout::write_u128(borrow.market_value.to_scaled_val(), &mut buf);
        }
        buf.resize(OBLIGATION_LEN, 0);
        let mut out = [0u8; OBLIGATION_LEN];
        out.copy_from_slice(&buf);
        out
    }

    /// The borrow leg against a given reserve, if any.
    pub fn find_borrow(&self, borrow_reserve: &Pubkey) -> Option<&ObligationLiquidity> {
        self.borrows.iter().find(|b| b.borrow_reserve == *borrow_reserve)
    }

    /// The deposit leg against a given reserve, if any.
    pub fn find_deposit(&self, deposit_reserve: &Pubkey) -> Option<&ObligationCollateral> {
        self.deposits.iter().find(|d| d.deposit_reserve == *deposit_reserve)
    }
}

/// The market grouping a set of reserves under one quote currency.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LendingMarket {
    pub pubkey: Pubkey,
    pub version: u8,
    pub bump_seed: u8,
    pub owner: Pubkey,
    pub quote_token_mint: Pubkey,
    pub token_program_id: Pubkey,
    pub reserved: [u8; 128],
}

impl LendingMarket {
    pub const LEN: usize = LENDING_MARKET_LEN;

    pub fn unpack(pubkey: Pubkey, data: &[u8]) -> Result<Self, LarderError> {
        if data.len() != Self::LEN {
            return Err(LarderError::MalformedRecord);
        }
        let src = array_ref![data, 0, LENDING_MARKET_LEN];
        #[allow(clippy::ptr_offset_with_cast)]
        let (version, bump_seed, owner, quote_token_mint, token_program_id, reserved) =
            array_refs![src, 1, 1, 32, 32, 32, 128];
        Ok(LendingMarket {
            pubkey,
            version: version[0],
            bump_seed: bump_seed[0],
            owner: Pubkey::new_from_array(*owner),
            quote_token_mint: Pubkey::new_from_array(*quote_token_mint),
            token_program_id: Pubkey::new_from_array(*token_program_id),
            reserved: *reserved,
        })
    }

    pub fn pack(&self) -> [u8; LENDING_MARKET_LEN] {
        let mut buf = Vec::with_capacity(LENDING_MARKET_LEN);
        layout::write_u8(self.version, &mut buf);
        layout::write_u8(self.bump_seed, &mut buf);
        layout::write_pubkey(&self.owner, &mut buf);
        layout::write_pubkey(&self.quote_token_mint, &mut buf);
        layout::write_pubkey(&self.token_program_id, &mut buf);
        layout::write_bytes(&self.reserved, &mut buf);
        let mut out = [0u8; LENDING_MARKET_LEN];
        out.copy_from_slice(&buf);
        out
    }
}

/// Header of a market-making venue. The order books hang off `bids`/`asks`
/// and get registered for follow-on parsing when the header is seen.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DexMarket {
    pub pubkey: Pubkey,
    pub account_flags: u64,
    pub own_address: Pubkey,
    pub base_mint: Pubkey,
    pub quote_mint: Pubkey,
    pub bids: Pubkey,
    pub asks: Pubkey,
    pub event_queue: Pubkey,
    pub base_lot_size: u64,
    pub quote_lot_size: u64,
    pub reserved: [u8; 32],
}

impl DexMarket {
    pub const LEN: usize = DEX_MARKET_LEN;

    pub fn unpack(pubkey: Pubkey, data: &[u8]) -> Result<Self, LarderError> {
        if data.len() != Self::LEN {
            return Err(LarderError::MalformedRecord);
        }
        let src = array_ref![data, 0, DEX_MARKET_LEN];
        #[allow(clippy::ptr_offset_with_cast)]
        let (
            account_flags,
            own_address,
            base_mint,
            quote_mint,
            bids,
            asks,
            event_queue,
            base_lot_size,
            quote_lot_size,
            reserved,
        ) = array_refs![src, 8, 32, 32, 32, 32, 32, 32, 8, 8, 32];
        Ok(DexMarket {
            pubkey,
            account_flags: u64::from_le_bytes(*account_flags),
            own_address: Pubkey::new_from_array(*own_address),
            base_mint: Pubkey::new_from_array(*base_mint),
            quote_mint: Pubkey::new_from_array(*quote_mint),
            bids: Pubkey::new_from_array(*bids),
            asks: Pubkey::new_from_array(*asks),
            event_queue: Pubkey::new_from_array(*event_queue),
            base_lot_size: u64::from_le_bytes(*base_lot_size),
            quote_lot_size: u64::from_le_bytes(*quote_lot_size),
            reserved: *reserved,
        })
    }

    pub fn pack(&self) -> [u8; DEX_MARKET_LEN] {
        let mut buf = Vec::with_capacity(DEX_MARKET_LEN);
        layout::write_u64(self.account_flags, &mut buf);
        layout::write_pubkey(&self.own_address, &mut buf);
        layout::write_pubkey(&self.base_mint, &mut buf);
        layout::write_pubkey(&self.quote_mint, &mut buf);
        layout::write_pubkey(&self.bids, &mut buf);
        layout::write_pubkey(&self.asks, &mut buf);
        layout::write_pubkey(&self.event_queue, &mut buf);
        layout::write_u64(self.base_lot_size, &mut buf);
        layout::write_u64(self.quote_lot_size, &mut buf);
        layout::write_bytes(&self.reserved, &mut buf);
        let mut out = [0u8; DEX_MARKET_LEN];
        out.copy_from_slice(&buf);
        out
    }
}

/// One side of a venue's book, kept as an opaque slab; depth inspection is
/// the price collaborator's business, the cache only needs to key it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderBook {
    pub pubkey: Pubkey,
    pub account_flags: u64,
    pub slab: Vec<u8>,
}

impl OrderBook {
    pub fn unpack(pubkey: Pubkey, data: &[u8]) -> Result<Self, LarderError> {
        let mut cursor = data;
        let account_flags = layout::read_u64(&mut cursor)?;
        Ok(OrderBook { pubkey, account_flags, slab: cursor.to_vec() })
    }
}

/// Closed variant over every record kind the cache can hold. Consumers
/// pattern-match instead of downcasting.
#[derive(Debug, Clone, PartialEq)]
pub enum Record {
    Reserve(Reserve),
    Obligation(Obligation),
    LendingMarket(LendingMarket),
    Token(spl_token::state::Account),
    Mint(spl_token::state::Mint),
    DexMarket(DexMarket),
    OrderBook(OrderBook),
}

/// Parser identity a cache address can be registered against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ParserKind {
    Reserve,
    Obligation,
    LendingMarket,
    Token,
    Mint,
    DexMarket,
    OrderBook,
}

/// Decode `account` as `kind`. `Ok(None)` means structurally valid but
/// semantically uninitialized; `Err` means no schema of this kind accepts
/// the bytes.
pub fn parse(kind: ParserKind, address: Pubkey, account: &Account) -> Result<Option<Record>, LarderError> {
    match kind {
        ParserKind::Reserve => {
            let reserve = Reserve::unpack(address, &account.data)?;
            if reserve.last_update.slot == 0 {
                return Ok(None);
            }
            Ok(Some(Record::Reserve(reserve)))
        }
        ParserKind::Obligation => {
            let obligation = Obligation::unpack(address, &account.data)?;
            if obligation.last_update.slot == 0 {
                return Ok(None);
            }
            Ok(Some(Record::Obligation(obligation)))
        }
        ParserKind::LendingMarket => {
            let market = LendingMarket::unpack(address, &account.data)?;
            Ok(Some(Record::LendingMarket(market)))
        }
        ParserKind::Token => {
            let token = spl_token::state::Account::unpack_unchecked(&account.data)
                .map_err(|_| LarderError::MalformedRecord)?;
            if token.state == spl_token::state::AccountState::Uninitialized {
                return Ok(None);
            }
            Ok(Some(Record::Token(token)))
        }
        ParserKind::Mint => {
            let mint = spl_token::state::Mint::unpack_unchecked(&account.data)
                .map_err(|_| LarderError::MalformedRecord)?;
            if !mint.is_initialized {
                return Ok(None);
            }
            Ok(Some(Record::Mint(mint)))
        }
        ParserKind::DexMarket => {
            let market = DexMarket::unpack(address, &account.data)?;
            Ok(Some(Record::DexMarket(market)))
        }
        ParserKind::OrderBook => {
            let book = OrderBook::unpack(address, &account.data)?;
            Ok(Some(Record::OrderBook(book)))
        }
    }
}
