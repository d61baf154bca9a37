use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use solana_program::pubkey::Pubkey;
use solana_sdk::account::Account;
use tokio::sync::mpsc;

use larder::cache::{AccountsCache, CacheEvent, LedgerReader, SubscriptionId};
use larder::decimal::Decimal;
use larder::error::LarderError;
use larder::state::{
    LastUpdate, ParserKind, Record, Reserve, ReserveCollateral, ReserveConfig, ReserveFees,
    ReserveLiquidity,
};

// --- Mock ledger ---

#[derive(Default)]
struct MockLedger {
    accounts: Mutex<HashMap<Pubkey, Account>>,
    reads: AtomicUsize,
    multi_reads: AtomicUsize,
    fail_next: Mutex<HashMap<Pubkey, String>>,
    delay: Mutex<Duration>,
}

impl MockLedger {
    fn insert(&self, address: Pubkey, account: Account) {
        self.accounts.lock().unwrap().insert(address, account);
    }

    fn fail(&self, address: Pubkey, reason: &str) {
        self.fail_next.lock().unwrap().insert(address, reason.to_string());
    }

    fn reads(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }

    /// Slow every read down so a test can race a second caller into the
    /// in-flight window.
    fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = delay;
    }

    async fn pause(&self) {
        let delay = *self.delay.lock().unwrap();
        if delay.is_zero() {
            // Yield so concurrent queries overlap the in-flight window.
            tokio::task::yield_now().await;
        } else {
            tokio::time::sleep(delay).await;
        }
    }
}

#[async_trait]
impl LedgerReader for MockLedger {
    async fn get_account(&self, address: &Pubkey) -> Result<Option<Account>, LarderError> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        self.pause().await;
        if let Some(reason) = self.fail_next.lock().unwrap().remove(address) {
            return Err(LarderError::FetchFailed { address: *address, reason });
        }
        Ok(self.accounts.lock().unwrap().get(address).cloned())
    }

    async fn get_multiple_accounts(
        &self,
        addresses: &[Pubkey],
    ) -> Result<Vec<Option<Account>>, LarderError> {
        assert!(addresses.len() <= larder::constants::GET_MULTIPLE_LIMIT);
        self.multi_reads.fetch_add(1, Ordering::SeqCst);
        self.pause().await;
        let accounts = self.accounts.lock().unwrap();
        Ok(addresses.iter().map(|a| accounts.get(a).cloned()).collect())
    }

    async fn minimum_balance_for_rent_exemption(
        &self,
        _data_len: usize,
    ) -> Result<u64, LarderError> {
        Ok(2_039_280)
    }

    async fn subscribe(
        &self,
        _address: Pubkey,
        _sink: mpsc::UnboundedSender<(Pubkey, Account)>,
    ) -> Result<SubscriptionId, LarderError> {
        Ok(1)
    }

    async fn unsubscribe(&self, _id: SubscriptionId) -> Result<(), LarderError> {
        Ok(())
    }
}

// --- Builders ---

fn make_reserve(pubkey: Pubkey) -> Reserve {
    Reserve {
        pubkey,
        version: 1,
        last_update: LastUpdate { slot: 42, stale: false },
        lending_market: Pubkey::new_unique(),
        liquidity: ReserveLiquidity {
            mint: Pubkey::new_unique(),
            mint_decimals: 6,
            supply: Pubkey::new_unique(),
            fee_receiver: Pubkey::new_unique(),
            oracle: Pubkey::new_unique(),
            available_amount: 1_000,
            borrowed_amount_wad: Decimal::zero(),
            cumulative_borrow_rate_wad: Decimal::one(),
            market_price: 1,
        },
        collateral: ReserveCollateral {
            mint: Pubkey::new_unique(),
            mint_total_supply: 1_000,
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

fn reserve_account(reserve: &Reserve) -> Account {
    Account {
        lamports: 1_000_000,
        data: reserve.pack().to_vec(),
        owner: Pubkey::new_unique(),
        executable: false,
        rent_epoch: 0,
    }
}

fn setup() -> (Arc<MockLedger>, AccountsCache) {
    let ledger = Arc::new(MockLedger::default());
    let cache = AccountsCache::new(ledger.clone());
    (ledger, cache)
}

// --- Query and dedup ---

#[tokio::test]
async fn query_miss_fetches_then_hit_is_local() {
    let (ledger, cache) = setup();
    let address = Pubkey::new_unique();
    let reserve = make_reserve(address);
    ledger.insert(address, reserve_account(&reserve));

    let entry = cache.query(address, Some(ParserKind::Reserve)).await.unwrap();
    assert!(matches!(&entry.record, Record::Reserve(r) if *r == reserve));
    assert_eq!(ledger.reads(), 1);

    let again = cache.query(address, None).await.unwrap();
    assert_eq!(again.address, address);
    assert_eq!(ledger.reads(), 1);
    assert!(cache.get(&address).is_some());
}

#[tokio::test]
async fn concurrent_queries_share_one_remote_read() {
    let (ledger, cache) = setup();
    let address = Pubkey::new_unique();
    ledger.insert(address, reserve_account(&make_reserve(address)));
    cache.register_parser(address, ParserKind::Reserve);

    let handles: Vec<_> = (0..16)
        .map(|_| {
            let cache = cache.clone();
            tokio::spawn(async move { cache.query(address, None).await })
        })
        .collect();
    for handle in handles {
        handle.await.unwrap().unwrap();
    }
    assert_eq!(ledger.reads(), 1);
}

#[tokio::test]
async fn batch_query_joins_an_in_flight_single_fetch() {
    let (ledger, cache) = setup();
    let address = Pubkey::new_unique();
    ledger.insert(address, reserve_account(&make_reserve(address)));
    ledger.set_delay(Duration::from_millis(50));
    cache.register_parser(address, ParserKind::Reserve);

    let racing = {
        let cache = cache.clone();
        tokio::spawn(async move { cache.query(address, None).await })
    };
    tokio::time::sleep(Duration::from_millis(10)).await;
    let out = cache.query_many(&[address], Some(ParserKind::Reserve)).await.unwrap();
    assert!(out[0].is_some());
    racing.await.unwrap().unwrap();
    assert_eq!(ledger.reads(), 1);
    assert_eq!(ledger.multi_reads.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn single_query_joins_an_in_flight_batch_fetch() {
    let (ledger, cache) = setup();
    let address = Pubkey::new_unique();
    ledger.insert(address, reserve_account(&make_reserve(address)));
    ledger.set_delay(Duration::from_millis(50));

    let racing = {
        let cache = cache.clone();
        tokio::spawn(async move { cache.query_many(&[address], Some(ParserKind::Reserve)).await })
    };
    tokio::time::sleep(Duration::from_millis(10)).await;
    let entry = cache.query(address, None).await.unwrap();
    assert_eq!(entry.address, address);
    racing.await.unwrap().unwrap();
    assert_eq!(ledger.reads(), 0);
    assert_eq!(ledger.multi_reads.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn query_without_parser_fails() {
    let (_ledger, cache) = setup();
    let address = Pubkey::new_unique();
    assert_eq!(
        cache.query(address, None).await.unwrap_err(),
        LarderError::NoParserRegistered(address)
    );
}

#[tokio::test]
async fn missing_account_is_not_found() {
    let (_ledger, cache) = setup();
    let address = Pubkey::new_unique();
    assert_eq!(
        cache.query(address, Some(ParserKind::Reserve)).await.unwrap_err(),
        LarderError::AccountNotFound(address)
    );
}

#[tokio::test]
async fn uninitialized_record_is_reported_as_missing() {
    let (ledger, cache) = setup();
    let address = Pubkey::new_unique();
    let mut reserve = make_reserve(address);
    reserve.last_update.slot = 0;
    ledger.insert(address, reserve_account(&reserve));
    assert_eq!(
        cache.query(address, Some(ParserKind::Reserve)).await.unwrap_err(),
        LarderError::AccountNotFound(address)
    );
}

// --- Failed fetch pinning ---

#[tokio::test]
async fn failed_fetch_replays_until_deleted() {
    let (ledger, cache) = setup();
    let address = Pubkey::new_unique();
    ledger.fail(address, "rate limited");

    let first = cache.query(address, Some(ParserKind::Reserve)).await;
    assert!(matches!(first, Err(LarderError::FetchFailed { .. })));
    assert_eq!(ledger.reads(), 1);

    // The pinned error replays without touching the ledger again, even
    // though the account now exists.
    ledger.insert(address, reserve_account(&make_reserve(address)));
    let second = cache.query(address, None).await;
    assert!(matches!(second, Err(LarderError::FetchFailed { .. })));
    assert_eq!(ledger.reads(), 1);

    // Deleting the slot is the explicit retry path.
    cache.delete(&address);
    let third = cache.query(address, None).await;
    assert!(third.is_ok());
    assert_eq!(ledger.reads(), 2);
}

// --- Ingestion and events ---

#[tokio::test]
async fn store_emits_updated_with_new_flag() {
    let (_ledger, cache) = setup();
    let mut events = cache.subscribe_events();
    let address = Pubkey::new_unique();
    let reserve = make_reserve(address);

    cache.add(address, reserve_account(&reserve), Some(ParserKind::Reserve)).unwrap();
    assert_eq!(
        events.try_recv().unwrap(),
        CacheEvent::Updated { address, is_new: true }
    );

    cache.add(address, reserve_account(&reserve), None).unwrap();
    assert_eq!(
        events.try_recv().unwrap(),
        CacheEvent::Updated { address, is_new: false }
    );
}

#[tokio::test]
async fn zero_length_payload_is_skipped() {
    let (_ledger, cache) = setup();
    let address = Pubkey::new_unique();
    let account = Account {
        lamports: 0,
        data: Vec::new(),
        owner: Pubkey::new_unique(),
        executable: false,
        rent_epoch: 0,
    };
    let stored = cache.add(address, account, Some(ParserKind::Reserve)).unwrap();
    assert!(stored.is_none());
    assert!(cache.get(&address).is_none());
}

#[tokio::test]
async fn parser_registration_is_idempotent() {
    let (_ledger, cache) = setup();
    let address = Pubkey::new_unique();
    cache.register_parser(address, ParserKind::Reserve);
    cache.register_parser(address, ParserKind::Obligation);
    assert_eq!(cache.by_parser(ParserKind::Reserve), vec![address]);
    assert!(cache.by_parser(ParserKind::Obligation).is_empty());
}

#[tokio::test]
async fn delete_and_clear_emit_events() {
    let (_ledger, cache) = setup();
    let address = Pubkey::new_unique();
    cache
        .add(address, reserve_account(&make_reserve(address)), Some(ParserKind::Reserve))
        .unwrap();

    let mut events = cache.subscribe_events();
    assert!(cache.delete(&address));
    assert!(!cache.delete(&address));
    assert_eq!(events.try_recv().unwrap(), CacheEvent::Deleted { address });

    cache.clear();
    assert_eq!(events.try_recv().unwrap(), CacheEvent::Cleared);
    assert!(cache.by_parser(ParserKind::Reserve).is_empty());
}

// --- Batched query ---

#[tokio::test]
async fn query_many_aligns_results_and_skips_missing() {
    let (ledger, cache) = setup();
    let present = Pubkey::new_unique();
    let missing = Pubkey::new_unique();
    let cached = Pubkey::new_unique();
    ledger.insert(present, reserve_account(&make_reserve(present)));
    cache
        .add(cached, reserve_account(&make_reserve(cached)), Some(ParserKind::Reserve))
        .unwrap();

    let out = cache
        .query_many(&[present, missing, cached], Some(ParserKind::Reserve))
        .await
        .unwrap();
    assert_eq!(out.len(), 3);
    assert!(out[0].is_some());
    assert!(out[1].is_none());
    assert!(out[2].is_some());
    // The cached entry never hit the ledger; the other two went in one batch.
    assert_eq!(ledger.multi_reads.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn query_many_chunks_large_requests() {
    let (ledger, cache) = setup();
    let addresses: Vec<Pubkey> = (0..150).map(|_| Pubkey::new_unique()).collect();
    for address in &addresses {
        ledger.insert(*address, reserve_account(&make_reserve(*address)));
    }
    let out = cache.query_many(&addresses, Some(ParserKind::Reserve)).await.unwrap();
    assert!(out.iter().all(|entry| entry.is_some()));
    // 150 addresses at a 99 cap: two batches.
    assert_eq!(ledger.multi_reads.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn query_many_degrades_a_bad_record_to_its_own_slot() {
    let (ledger, cache) = setup();
    let good = Pubkey::new_unique();
    let bad = Pubkey::new_unique();
    ledger.insert(good, reserve_account(&make_reserve(good)));
    ledger.insert(
        bad,
        Account {
            lamports: 1_000_000,
            data: vec![0xA5; 17],
            owner: Pubkey::new_unique(),
            executable: false,
            rent_epoch: 0,
        },
    );

    let out = cache.query_many(&[good, bad], Some(ParserKind::Reserve)).await.unwrap();
    assert!(out[0].is_some());
    assert!(out[1].is_none());
}

// --- Mint store ---

fn mint_account() -> Account {
    use solana_program::program_pack::Pack as _;
    let mut data = vec![0u8; spl_token::state::Mint::LEN];
    let mint = spl_token::state::Mint {
        mint_authority: solana_program::program_option::COption::None,
        supply: 1_000_000,
        decimals: 6,
        is_initialized: true,
        freeze_authority: solana_program::program_option::COption::None,
    };
    spl_token::state::Mint::pack(mint, &mut data).unwrap();
    Account {
        lamports: 1_000_000,
        data,
        owner: spl_token::id(),
        executable: false,
        rent_epoch: 0,
    }
}

#[tokio::test]
async fn mint_fetch_is_deduplicated_and_cached() {
    let (ledger, cache) = setup();
    let address = Pubkey::new_unique();
    ledger.insert(address, mint_account());

    let fetched = cache.query_mint(address).await.unwrap();
    assert_eq!(fetched.supply, 1_000_000);
    assert_eq!(ledger.reads(), 1);

    let again = cache.query_mint(address).await.unwrap();
    assert_eq!(again.decimals, 6);
    assert_eq!(ledger.reads(), 1);
    assert!(cache.get_mint(&address).is_some());
}

#[tokio::test]
async fn concurrent_mint_queries_share_one_remote_read() {
    let (ledger, cache) = setup();
    let address = Pubkey::new_unique();
    ledger.insert(address, mint_account());

    let handles: Vec<_> = (0..16)
        .map(|_| {
            let cache = cache.clone();
            tokio::spawn(async move { cache.query_mint(address).await })
        })
        .collect();
    for handle in handles {
        handle.await.unwrap().unwrap();
    }
    assert_eq!(ledger.reads(), 1);
}
