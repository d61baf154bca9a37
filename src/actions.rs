//! User-facing flows: deposit, borrow, repay, withdraw, liquidate.
//!
//! Every action follows the same shape. Auxiliary token accounts are
//! resolved from the cache or created in-transaction with ephemeral
//! keypair co-signers; a disposable transfer authority is granted a
//! one-shot allowance over the exact amount, with the matching revoke
//! appended after the main instruction; refresh instructions precede the
//! instruction that consumes their output. Instruction order within one
//! submission is refresh -> approve -> main -> cleanup.

use std::sync::Arc;

use async_trait::async_trait;
use solana_program::instruction::Instruction;
use solana_program::program_pack::Pack as _;
use solana_program::pubkey::Pubkey;
use solana_program::system_instruction;
use solana_sdk::commitment_config::CommitmentConfig;
use solana_sdk::signature::{Keypair, Signature};
use solana_sdk::signer::Signer;
use solana_sdk::transaction::Transaction;
use std::time::Duration;
use tracing::debug;

use crate::cache::{AccountsCache, CacheEntry};
use crate::constants::{CONFIRM_POLL_INTERVAL, CONFIRM_TIMEOUT, OBLIGATION_LEN};
use crate::decimal::Decimal;
use crate::error::LarderError;
use crate::ix::{self, BorrowAmountType};
use crate::math;
use crate::state::{DexMarket, Obligation, ParserKind, Record, Reserve};

#[derive(Debug, Clone)]
pub struct SubmitOptions {
    pub await_confirmation: bool,
    pub commitment: CommitmentConfig,
    pub timeout: Duration,
}

impl Default for SubmitOptions {
    fn default() -> Self {
        SubmitOptions {
            await_confirmation: true,
            commitment: CommitmentConfig::confirmed(),
            timeout: CONFIRM_TIMEOUT,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmitReceipt {
    pub signature: Signature,
    pub slot: u64,
}

/// External submission collaborator: sign, send, await confirmation.
#[async_trait]
pub trait TransactionSubmitter: Send + Sync {
    async fn submit(
        &self,
        instructions: &[Instruction],
        signers: &[&Keypair],
        opts: &SubmitOptions,
    ) -> Result<SubmitReceipt, LarderError>;
}

/// Submitter over the nonblocking RPC client. Confirmation is a bounded
/// status poll; a confirmation landing after the deadline is dropped.
pub struct RpcSubmitter {
    rpc: Arc<solana_client::nonblocking::rpc_client::RpcClient>,
}

impl RpcSubmitter {
    pub fn new(rpc: Arc<solana_client::nonblocking::rpc_client::RpcClient>) -> Self {
        RpcSubmitter { rpc }
    }

    async fn await_confirmation(
        &self,
        signature: &Signature,
        opts: &SubmitOptions,
    ) -> Result<u64, LarderError> {
        loop {
            let statuses = self
                .rpc
                .get_signature_statuses(&[*signature])
                .await
                .map_err(|err| LarderError::SubmissionFailed {
                    signature: signature.to_string(),
                    reason: err.to_string(),
                })?;
            if let Some(Some(status)) = statuses.value.first() {
                if let Some(err) = &status.err {
                    return Err(LarderError::SubmissionFailed {
                        signature: signature.to_string(),
                        reason: err.to_string(),
                    });
                }
                if status.satisfies_commitment(opts.commitment) {
                    return Ok(status.slot);
                }
            }
            tokio::time::sleep(CONFIRM_POLL_INTERVAL).await;
        }
    }
}

#[async_trait]
impl TransactionSubmitter for RpcSubmitter {
    async fn submit(
        &self,
        instructions: &[Instruction],
        signers: &[&Keypair],
        opts: &SubmitOptions,
    ) -> Result<SubmitReceipt, LarderError> {
        let payer = signers.first().ok_or(LarderError::SignatureDeclined)?;
        let blockhash = self.rpc.get_latest_blockhash().await.map_err(|err| {
            LarderError::SubmissionFailed { signature: String::new(), reason: err.to_string() }
        })?;
        let mut tx = Transaction::new_with_payer(instructions, Some(&payer.pubkey()));
        tx.try_sign(&signers.to_vec(), blockhash)?;
        let signature = tx.signatures[0];
        self.rpc.send_transaction(&tx).await.map_err(|err| LarderError::SubmissionFailed {
            signature: signature.to_string(),
            reason: err.to_string(),
        })?;
        debug!(%signature, "transaction sent");
        if !opts.await_confirmation {
            return Ok(SubmitReceipt { signature, slot: 0 });
        }
        let slot = tokio::time::timeout(opts.timeout, self.await_confirmation(&signature, opts))
            .await
            .map_err(|_| LarderError::ConfirmationTimeout { signature: signature.to_string() })??;
        Ok(SubmitReceipt { signature, slot })
    }
}

/// The withdraw flow submits two transactions: the redemption itself, then
/// an independent refresh to settle the post-withdrawal view.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WithdrawReceipts {
    pub primary: SubmitReceipt,
    pub compensating: SubmitReceipt,
}

/// Growing transaction under construction: main instructions, trailing
/// cleanup, and the ephemeral keypairs that must co-sign.
#[derive(Default)]
struct TxPlan {
    instructions: Vec<Instruction>,
    cleanup: Vec<Instruction>,
    signers: Vec<Keypair>,
}

impl TxPlan {
    fn into_instructions(mut self) -> (Vec<Instruction>, Vec<Keypair>) {
        self.instructions.append(&mut self.cleanup);
        (self.instructions, self.signers)
    }
}

/// High-level lending actions over one cache, submitter and program.
pub struct LendingClient {
    cache: AccountsCache,
    submitter: Arc<dyn TransactionSubmitter>,
    program_id: Pubkey,
    opts: SubmitOptions,
}

impl LendingClient {
    pub fn new(
        cache: AccountsCache,
        submitter: Arc<dyn TransactionSubmitter>,
        program_id: Pubkey,
    ) -> Self {
        LendingClient { cache, submitter, program_id, opts: SubmitOptions::default() }
    }

    pub fn with_options(mut self, opts: SubmitOptions) -> Self {
        self.opts = opts;
        self
    }

    pub fn cache(&self) -> &AccountsCache {
        &self.cache
    }

    async fn reserve(&self, address: Pubkey) -> Result<Reserve, LarderError> {
        match &self.cache.query(address, Some(ParserKind::Reserve)).await?.record {
            Record::Reserve(reserve) => Ok(*reserve),
            _ => Err(LarderError::MalformedRecord),
        }
    }

    async fn obligation(&self, address: Pubkey) -> Result<Obligation, LarderError> {
        match &self.cache.query(address, Some(ParserKind::Obligation)).await?.record {
            Record::Obligation(obligation) => Ok(obligation.clone()),
            _ => Err(LarderError::MalformedRecord),
        }
    }

    /// The wallet's cached token account for `mint` holding at least
    /// `min_amount`. Frozen accounts cannot move funds and are skipped.
    fn find_token_account(&self, owner: &Pubkey, mint: &Pubkey, min_amount: u64) -> Option<Pubkey> {
        self.cache
            .by_parser(ParserKind::Token)
            .into_iter()
            .filter_map(|address| self.cache.get(&address))
            .find_map(|entry| match &entry.record {
                Record::Token(token)
                    if token.state == spl_token::state::AccountState::Initialized
                        && token.owner == *owner
                        && token.mint == *mint
                        && token.amount >= min_amount =>
                {
                    Some(entry.address)
                }
                _ => None,
            })
    }

    /// Reuse the wallet's token account for `mint`, or create one inside
    /// the transaction, tracking the new keypair as a co-signer.
    async fn resolve_or_create_token_account(
        &self,
        wallet: &Pubkey,
        mint: &Pubkey,
        plan: &mut TxPlan,
    ) -> Result<Pubkey, LarderError> {
        if let Some(address) = self.find_token_account(wallet, mint, 0) {
            return Ok(address);
        }
        let rent = self
            .cache
            .reader()
            .minimum_balance_for_rent_exemption(spl_token::state::Account::LEN)
            .await?;
        let account = Keypair::new();
        let address = account.pubkey();
        plan.instructions.push(system_instruction::create_account(
            wallet,
            &address,
            rent,
            spl_token::state::Account::LEN as u64,
            &spl_token::id(),
        ));
        plan.instructions.push(
            spl_token::instruction::initialize_account(&spl_token::id(), &address, mint, wallet)
                .map_err(|_| LarderError::InvalidInstruction)?,
        );
        plan.signers.push(account);
        debug!(%address, %mint, "creating token account in-transaction");
        Ok(address)
    }

    /// One-shot allowance bracket: approve exactly `amount` to a fresh
    /// disposable authority, revoke in cleanup. Returns the authority.
    fn approve_transfer(
        &self,
        source: &Pubkey,
        owner: &Pubkey,
        amount: u64,
        plan: &mut TxPlan,
    ) -> Result<Pubkey, LarderError> {
        let authority = Keypair::new();
        let authority_pubkey = authority.pubkey();
        plan.instructions.push(
            spl_token::instruction::approve(
                &spl_token::id(),
                source,
                &authority_pubkey,
                owner,
                &[],
                amount,
            )
            .map_err(|_| LarderError::InvalidInstruction)?,
        );
        plan.cleanup.push(
            spl_token::instruction::revoke(&spl_token::id(), source, owner, &[])
                .map_err(|_| LarderError::InvalidInstruction)?,
        );
        plan.signers.push(authority);
        Ok(authority_pubkey)
    }

    /// The wallet's obligation under `lending_market`, if one is cached.
    fn find_obligation(&self, owner: &Pubkey, lending_market: &Pubkey) -> Option<Arc<CacheEntry>> {
        self.cache
            .by_parser(ParserKind::Obligation)
            .into_iter()
            .filter_map(|address| self.cache.get(&address))
            .find(|entry| match &entry.record {
                Record::Obligation(ob) => {
                    ob.owner == *owner && ob.lending_market == *lending_market
                }
                _ => false,
            })
    }

    /// The venue quoting the `base`/`quote` pair, plus the book side that
    /// prices `base`.
    fn find_dex_market(&self, base: &Pubkey, quote: &Pubkey) -> Result<(DexMarket, Pubkey), LarderError> {
        for address in self.cache.by_parser(ParserKind::DexMarket) {
            if let Some(entry) = self.cache.get(&address) {
                if let Record::DexMarket(market) = &entry.record {
                    if market.base_mint == *base && market.quote_mint == *quote {
                        return Ok((*market, market.bids));
                    }
                    if market.base_mint == *quote && market.quote_mint == *base {
                        return Ok((*market, market.asks));
                    }
                }
            }
        }
        Err(LarderError::DexMarketNotFound)
    }

    fn refresh_obligation_ix(&self, obligation: &Obligation) -> Instruction {
        // Deposit reserves first, then borrow reserves, matching record order.
        let mut reserves: Vec<Pubkey> =
            obligation.deposits.iter().map(|d| d.deposit_reserve).collect();
        reserves.extend(obligation.borrows.iter().map(|b| b.borrow_reserve));
        ix::refresh_obligation(&self.program_id, &obligation.pubkey, &reserves)
    }

    async fn submit(
        &self,
        plan: TxPlan,
        wallet: &Keypair,
    ) -> Result<SubmitReceipt, LarderError> {
        let (instructions, ephemeral) = plan.into_instructions();
        let mut signers: Vec<&Keypair> = vec![wallet];
        signers.extend(ephemeral.iter());
        self.submitter.submit(&instructions, &signers, &self.opts).await
    }

    /// Supply `liquidity_amount` of the reserve's asset, receiving
    /// collateral tokens in exchange.
    pub async fn deposit(
        &self,
        liquidity_amount: u64,
        reserve_pubkey: Pubkey,
        wallet: &Keypair,
    ) -> Result<SubmitReceipt, LarderError> {
        if liquidity_amount == 0 {
            return Err(LarderError::InvalidInstruction);
        }
        let reserve = self.reserve(reserve_pubkey).await?;
        let wallet_pubkey = wallet.pubkey();
        let source = self
            .find_token_account(&wallet_pubkey, &reserve.liquidity.mint, liquidity_amount)
            .ok_or(LarderError::TokenAccountNotFound { mint: reserve.liquidity.mint })?;

        let mut plan = TxPlan::default();
        let destination = self
            .resolve_or_create_token_account(&wallet_pubkey, &reserve.collateral.mint, &mut plan)
            .await?;
        plan.instructions.push(ix::refresh_reserve(
            &self.program_id,
            &reserve_pubkey,
            &reserve.liquidity.oracle,
        ));
        let authority = self.approve_transfer(&source, &wallet_pubkey, liquidity_amount, &mut plan)?;
        plan.instructions.push(ix::deposit_reserve_liquidity(
            &self.program_id,
            liquidity_amount,
            &source,
            &destination,
            &reserve_pubkey,
            &reserve.liquidity.supply,
            &reserve.collateral.mint,
            &reserve.lending_market,
            &authority,
        ));
        self.submit(plan, wallet).await
    }

    /// Collateral to lock for a borrow, depending on how the caller
    /// denominated the amount.
    fn collateral_to_lock(
        &self,
        amount: u64,
        amount_type: BorrowAmountType,
        deposit_reserve: &Reserve,
        borrow_reserve: &Reserve,
    ) -> Result<u64, LarderError> {
        match amount_type {
            BorrowAmountType::Collateral => Ok(amount),
            BorrowAmountType::Liquidity => {
                // Quote value of the requested liquidity, translated into
                // deposit-side liquidity, grossed up by the reserve's LTV,
                // then through the collateral exchange rate.
                if deposit_reserve.liquidity.market_price == 0
                    || deposit_reserve.config.loan_to_value_ratio == 0
                {
                    return Err(LarderError::MathOverflow);
                }
                let borrow_value = Decimal::from_integer(amount)
                    .try_mul(Decimal::from_integer(borrow_reserve.liquidity.market_price))?;
                let deposit_liquidity = borrow_value
                    .try_div(Decimal::from_integer(deposit_reserve.liquidity.market_price))?
                    .try_div(Decimal::from_percent(deposit_reserve.config.loan_to_value_ratio))?
                    .try_floor_u64()?;
                math::liquidity_to_collateral(deposit_liquidity, deposit_reserve)
            }
        }
    }

    /// Borrow against collateral from `deposit_reserve_pubkey`, creating
    /// the obligation if the wallet has none.
    pub async fn borrow(
        &self,
        amount: u64,
        amount_type: BorrowAmountType,
        deposit_reserve_pubkey: Pubkey,
        borrow_reserve_pubkey: Pubkey,
        wallet: &Keypair,
    ) -> Result<SubmitReceipt, LarderError> {
        if amount == 0 {
            return Err(LarderError::InvalidInstruction);
        }
        let deposit_reserve = self.reserve(deposit_reserve_pubkey).await?;
        let borrow_reserve = self.reserve(borrow_reserve_pubkey).await?;
        let wallet_pubkey = wallet.pubkey();

        let collateral_amount =
            self.collateral_to_lock(amount, amount_type, &deposit_reserve, &borrow_reserve)?;
        let source_collateral = self
            .find_token_account(&wallet_pubkey, &deposit_reserve.collateral.mint, collateral_amount)
            .ok_or(LarderError::TokenAccountNotFound { mint: deposit_reserve.collateral.mint })?;

        // Venue lookup happens before anything is built so a miss fails fast.
        let (dex_market, book_side) =
            self.find_dex_market(&borrow_reserve.liquidity.mint, &deposit_reserve.liquidity.mint)?;

        let mut plan = TxPlan::default();
        let destination = self
            .resolve_or_create_token_account(&wallet_pubkey, &borrow_reserve.liquidity.mint, &mut plan)
            .await?;

        let existing = self.find_obligation(&wallet_pubkey, &deposit_reserve.lending_market);
        let (obligation_pubkey, obligation_record) = match &existing {
            Some(entry) => match &entry.record {
                Record::Obligation(ob) => (entry.address, Some(ob.clone())),
                _ => return Err(LarderError::MalformedRecord),
            },
            None => {
                let rent = self
                    .cache
                    .reader()
                    .minimum_balance_for_rent_exemption(OBLIGATION_LEN)
                    .await?;
                let account = Keypair::new();
                let address = account.pubkey();
                plan.instructions.push(system_instruction::create_account(
                    &wallet_pubkey,
                    &address,
                    rent,
                    OBLIGATION_LEN as u64,
                    &self.program_id,
                ));
                plan.instructions.push(ix::init_obligation(
                    &self.program_id,
                    &address,
                    &deposit_reserve.lending_market,
                    &wallet_pubkey,
                ));
                plan.signers.push(account);
                (address, None)
            }
        };

        plan.instructions.push(ix::refresh_reserve(
            &self.program_id,
            &deposit_reserve_pubkey,
            &deposit_reserve.liquidity.oracle,
        ));
        plan.instructions.push(ix::refresh_reserve(
            &self.program_id,
            &borrow_reserve_pubkey,
            &borrow_reserve.liquidity.oracle,
        ));
        if let Some(ob) = &obligation_record {
            plan.instructions.push(self.refresh_obligation_ix(ob));
        }

        let authority =
            self.approve_transfer(&source_collateral, &wallet_pubkey, collateral_amount, &mut plan)?;
        plan.instructions.push(ix::borrow_obligation_liquidity(
            &self.program_id,
            amount,
            amount_type,
            &source_collateral,
            &borrow_reserve.liquidity.supply,
            &destination,
            &borrow_reserve_pubkey,
            &borrow_reserve.liquidity.fee_receiver,
            &deposit_reserve_pubkey,
            &deposit_reserve.collateral.supply,
            &obligation_pubkey,
            &borrow_reserve.lending_market,
            &authority,
            &dex_market.pubkey,
            &book_side,
        ));
        self.submit(plan, wallet).await
    }

    /// Repay `liquidity_amount` of debt against `reserve_pubkey`.
    pub async fn repay(
        &self,
        liquidity_amount: u64,
        reserve_pubkey: Pubkey,
        obligation_pubkey: Pubkey,
        wallet: &Keypair,
    ) -> Result<SubmitReceipt, LarderError> {
        if liquidity_amount == 0 {
            return Err(LarderError::InvalidInstruction);
        }
        let reserve = self.reserve(reserve_pubkey).await?;
        let obligation = self.obligation(obligation_pubkey).await?;
        let wallet_pubkey = wallet.pubkey();
        let source = self
            .find_token_account(&wallet_pubkey, &reserve.liquidity.mint, liquidity_amount)
            .ok_or(LarderError::TokenAccountNotFound { mint: reserve.liquidity.mint })?;

        let mut plan = TxPlan::default();
        plan.instructions.push(ix::refresh_reserve(
            &self.program_id,
            &reserve_pubkey,
            &reserve.liquidity.oracle,
        ));
        plan.instructions.push(self.refresh_obligation_ix(&obligation));
        let authority = self.approve_transfer(&source, &wallet_pubkey, liquidity_amount, &mut plan)?;
        plan.instructions.push(ix::repay_obligation_liquidity(
            &self.program_id,
            liquidity_amount,
            &source,
            &reserve.liquidity.supply,
            &reserve_pubkey,
            &obligation_pubkey,
            &reserve.lending_market,
            &authority,
        ));
        self.submit(plan, wallet).await
    }

    /// Redeem `collateral_amount` collateral tokens back into liquidity.
    /// The redemption and the follow-up refresh are separate transactions;
    /// the refresh settles the ledger view of the obligation afterwards
    /// and is not part of the atomic withdrawal.
    pub async fn withdraw(
        &self,
        collateral_amount: u64,
        reserve_pubkey: Pubkey,
        wallet: &Keypair,
    ) -> Result<WithdrawReceipts, LarderError> {
        if collateral_amount == 0 {
            return Err(LarderError::InvalidInstruction);
        }
        let reserve = self.reserve(reserve_pubkey).await?;
        let wallet_pubkey = wallet.pubkey();
        let source = self
            .find_token_account(&wallet_pubkey, &reserve.collateral.mint, collateral_amount)
            .ok_or(LarderError::TokenAccountNotFound { mint: reserve.collateral.mint })?;

        let mut plan = TxPlan::default();
        let destination = self
            .resolve_or_create_token_account(&wallet_pubkey, &reserve.liquidity.mint, &mut plan)
            .await?;
        plan.instructions.push(ix::refresh_reserve(
            &self.program_id,
            &reserve_pubkey,
            &reserve.liquidity.oracle,
        ));
        let authority =
            self.approve_transfer(&source, &wallet_pubkey, collateral_amount, &mut plan)?;
        plan.instructions.push(ix::redeem_reserve_collateral(
            &self.program_id,
            collateral_amount,
            &source,
            &destination,
            &reserve_pubkey,
            &reserve.collateral.mint,
            &reserve.liquidity.supply,
            &reserve.lending_market,
            &authority,
        ));
        let primary = self.submit(plan, wallet).await?;

        let mut refresh = TxPlan::default();
        refresh.instructions.push(ix::refresh_reserve(
            &self.program_id,
            &reserve_pubkey,
            &reserve.liquidity.oracle,
        ));
        if let Some(entry) = self.find_obligation(&wallet_pubkey, &reserve.lending_market) {
            if let Record::Obligation(ob) = &entry.record {
                refresh.instructions.push(self.refresh_obligation_ix(ob));
            }
        }
        let compensating = self.submit(refresh, wallet).await?;
        Ok(WithdrawReceipts { primary, compensating })
    }

    /// Repay part of an unhealthy obligation's debt and seize collateral.
    pub async fn liquidate(
        &self,
        liquidity_amount: u64,
        repay_reserve_pubkey: Pubkey,
        withdraw_reserve_pubkey: Pubkey,
        obligation_pubkey: Pubkey,
        wallet: &Keypair,
    ) -> Result<SubmitReceipt, LarderError> {
        if liquidity_amount == 0 {
            return Err(LarderError::InvalidInstruction);
        }
        let repay_reserve = self.reserve(repay_reserve_pubkey).await?;
        let withdraw_reserve = self.reserve(withdraw_reserve_pubkey).await?;
        let obligation = self.obligation(obligation_pubkey).await?;
        let wallet_pubkey = wallet.pubkey();

        let source = self
            .find_token_account(&wallet_pubkey, &repay_reserve.liquidity.mint, liquidity_amount)
            .ok_or(LarderError::TokenAccountNotFound { mint: repay_reserve.liquidity.mint })?;
        let (dex_market, book_side) = self
            .find_dex_market(&repay_reserve.liquidity.mint, &withdraw_reserve.liquidity.mint)?;

        let mut plan = TxPlan::default();
        let destination = self
            .resolve_or_create_token_account(
                &wallet_pubkey,
                &withdraw_reserve.collateral.mint,
                &mut plan,
            )
            .await?;
        plan.instructions.push(ix::refresh_reserve(
            &self.program_id,
            &repay_reserve_pubkey,
            &repay_reserve.liquidity.oracle,
        ));
        plan.instructions.push(ix::refresh_reserve(
            &self.program_id,
            &withdraw_reserve_pubkey,
            &withdraw_reserve.liquidity.oracle,
        ));
        plan.instructions.push(self.refresh_obligation_ix(&obligation));
        let authority = self.approve_transfer(&source, &wallet_pubkey, liquidity_amount, &mut plan)?;
        plan.instructions.push(ix::liquidate_obligation(
            &self.program_id,
            liquidity_amount,
            &source,
            &destination,
            &repay_reserve_pubkey,
            &repay_reserve.liquidity.supply,
            &withdraw_reserve_pubkey,
            &withdraw_reserve.collateral.supply,
            &obligation_pubkey,
            &repay_reserve.lending_market,
            &authority,
            &dex_market.pubkey,
            &book_side,
        ));
        self.submit(plan, wallet).await
    }
}
