//! Account cache: the single source of truth for the last known decoded
//! state of every observed address.
//!
//! The cache owns three keyed stores (records, mints, parser registry) and
//! two pending-fetch maps. The pending maps are the concurrency-sensitive
//! invariant: for any address, at most one remote read is outstanding at a
//! time; every logical caller that asks while it is in flight awaits the
//! same shared future.
//!
//! A fetch that fails stays in the pending map and replays its error to
//! later callers. `delete` (or `clear`) evicts the slot, making retry an
//! explicit caller decision.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::future::{BoxFuture, Shared};
use futures::FutureExt;
use solana_client::nonblocking::rpc_client::RpcClient;
use solana_program::pubkey::Pubkey;
use solana_sdk::account::Account;
use solana_sdk::commitment_config::CommitmentConfig;
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, warn};

use crate::constants::GET_MULTIPLE_LIMIT;
use crate::error::LarderError;
use crate::state::{self, ParserKind, Record};

pub type SubscriptionId = u64;

/// Remote read/subscribe surface the cache depends on.
///
/// `get_multiple_accounts` is always called with at most
/// [`GET_MULTIPLE_LIMIT`] addresses; the cache chunks before calling.
#[async_trait]
pub trait LedgerReader: Send + Sync {
    async fn get_account(&self, address: &Pubkey) -> Result<Option<Account>, LarderError>;

    async fn get_multiple_accounts(
        &self,
        addresses: &[Pubkey],
    ) -> Result<Vec<Option<Account>>, LarderError>;

    async fn minimum_balance_for_rent_exemption(&self, data_len: usize)
        -> Result<u64, LarderError>;

    /// Push account changes for `address` into `sink` until unsubscribed.
    async fn subscribe(
        &self,
        address: Pubkey,
        sink: mpsc::UnboundedSender<(Pubkey, Account)>,
    ) -> Result<SubscriptionId, LarderError>;

    async fn unsubscribe(&self, id: SubscriptionId) -> Result<(), LarderError>;
}

/// A decoded record plus the raw snapshot it was decoded from. Consumers
/// only ever see this behind `Arc`; updates replace the entry wholesale.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub address: Pubkey,
    pub account: Account,
    pub record: Record,
    pub parser: ParserKind,
}

/// Change notifications. Dropping the receiver unsubscribes.
#[derive(Debug, Clone, PartialEq)]
pub enum CacheEvent {
    Updated { address: Pubkey, is_new: bool },
    Deleted { address: Pubkey },
    Cleared,
}

type FetchResult = Result<Arc<CacheEntry>, LarderError>;
type FetchFuture = Shared<BoxFuture<'static, FetchResult>>;
type MintResult = Result<spl_token::state::Mint, LarderError>;
type MintFuture = Shared<BoxFuture<'static, MintResult>>;

struct CacheInner {
    records: Mutex<HashMap<Pubkey, Arc<CacheEntry>>>,
    mints: Mutex<HashMap<Pubkey, spl_token::state::Mint>>,
    parsers: Mutex<HashMap<Pubkey, ParserKind>>,
    pending: Mutex<HashMap<Pubkey, FetchFuture>>,
    pending_mints: Mutex<HashMap<Pubkey, MintFuture>>,
    events: broadcast::Sender<CacheEvent>,
}

/// Cheap-to-clone handle; all clones share one store. Construct one per
/// network context and `clear()` it on endpoint switch, since addresses
/// may alias across networks.
#[derive(Clone)]
pub struct AccountsCache {
    reader: Arc<dyn LedgerReader>,
    inner: Arc<CacheInner>,
}

impl AccountsCache {
    pub fn new(reader: Arc<dyn LedgerReader>) -> Self {
        let (events, _) = broadcast::channel(1024);
        AccountsCache {
            reader,
            inner: Arc::new(CacheInner {
                records: Mutex::new(HashMap::new()),
                mints: Mutex::new(HashMap::new()),
                parsers: Mutex::new(HashMap::new()),
                pending: Mutex::new(HashMap::new()),
                pending_mints: Mutex::new(HashMap::new()),
                events,
            }),
        }
    }

    pub fn reader(&self) -> &Arc<dyn LedgerReader> {
        &self.reader
    }

    /// Subscribe to change notifications.
    pub fn subscribe_events(&self) -> broadcast::Receiver<CacheEvent> {
        self.inner.events.subscribe()
    }

    fn emit(&self, event: CacheEvent) {
        // No receivers is fine.
        let _ = self.inner.events.send(event);
    }

    /// Register `kind` for `address`. Idempotent; the first registration
    /// wins and repeats are no-ops.
    pub fn register_parser(&self, address: Pubkey, kind: ParserKind) {
        self.inner.parsers.lock().unwrap().entry(address).or_insert(kind);
    }

    fn parser_for(&self, address: &Pubkey) -> Option<ParserKind> {
        self.inner.parsers.lock().unwrap().get(address).copied()
    }

    /// Every address currently registered against `kind`. Used to
    /// enumerate e.g. all reserves without a remote scan.
    pub fn by_parser(&self, kind: ParserKind) -> Vec<Pubkey> {
        self.inner
            .parsers
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, k)| **k == kind)
            .map(|(address, _)| *address)
            .collect()
    }

    /// Synchronous read of the last known state. No I/O.
    pub fn get(&self, address: &Pubkey) -> Option<Arc<CacheEntry>> {
        self.inner.records.lock().unwrap().get(address).cloned()
    }

    /// Fetch-or-return-cached. Deduplicates: concurrent queries for one
    /// uncached address trigger exactly one remote read.
    pub async fn query(
        &self,
        address: Pubkey,
        parser: Option<ParserKind>,
    ) -> Result<Arc<CacheEntry>, LarderError> {
        if let Some(kind) = parser {
            self.register_parser(address, kind);
        }
        if let Some(entry) = self.get(&address) {
            return Ok(entry);
        }
        let fut = {
            let mut pending = self.inner.pending.lock().unwrap();
            match pending.get(&address) {
                Some(fut) => fut.clone(),
                None => {
                    let this = self.clone();
                    let fut: FetchFuture =
                        async move { this.fetch_and_store(address, parser).await }.boxed().shared();
                    pending.insert(address, fut.clone());
                    fut
                }
            }
        };
        let result = fut.await;
        if result.is_ok() {
            self.inner.pending.lock().unwrap().remove(&address);
        } else {
            warn!(%address, "fetch failed; error pinned until delete/clear");
        }
        result
    }

    async fn fetch_and_store(
        &self,
        address: Pubkey,
        parser: Option<ParserKind>,
    ) -> Result<Arc<CacheEntry>, LarderError> {
        let kind = parser
            .or_else(|| self.parser_for(&address))
            .ok_or(LarderError::NoParserRegistered(address))?;
        let account = self
            .reader
            .get_account(&address)
            .await?
            .ok_or(LarderError::AccountNotFound(address))?;
        // An uninitialized record is indistinguishable from a missing one
        // as far as callers are concerned.
        self.store(address, account, kind)?
            .ok_or(LarderError::AccountNotFound(address))
    }

    /// Synchronous ingestion for pushed updates. Zero-length payloads mean
    /// a closed account and are skipped. Returns the stored entry, or
    /// `None` when the payload was skipped or parsed as uninitialized.
    pub fn add(
        &self,
        address: Pubkey,
        account: Account,
        parser: Option<ParserKind>,
    ) -> Result<Option<Arc<CacheEntry>>, LarderError> {
        if account.data.is_empty() {
            return Ok(None);
        }
        let kind = parser
            .or_else(|| self.parser_for(&address))
            .ok_or(LarderError::NoParserRegistered(address))?;
        self.store(address, account, kind)
    }

    fn store(
        &self,
        address: Pubkey,
        account: Account,
        kind: ParserKind,
    ) -> Result<Option<Arc<CacheEntry>>, LarderError> {
        let record = match state::parse(kind, address, &account)? {
            Some(record) => record,
            None => return Ok(None),
        };
        self.register_parser(address, kind);
        self.register_follow_ons(&record);

        let entry = Arc::new(CacheEntry { address, account, record, parser: kind });
        let is_new = self
            .inner
            .records
            .lock()
            .unwrap()
            .insert(address, entry.clone())
            .is_none();
        debug!(%address, ?kind, is_new, "record stored");
        self.emit(CacheEvent::Updated { address, is_new });
        Ok(Some(entry))
    }

    /// Embedded addresses a record vouches for: later generic fetches of
    /// them must know how to decode.
    fn register_follow_ons(&self, record: &Record) {
        match record {
            Record::LendingMarket(market) => {
                self.register_parser(market.quote_token_mint, ParserKind::Mint);
            }
            Record::DexMarket(market) => {
                self.register_parser(market.bids, ParserKind::OrderBook);
                self.register_parser(market.asks, ParserKind::OrderBook);
            }
            _ => {}
        }
    }

    /// Remove one entry (and any pinned failed fetch). Emits `Deleted` and
    /// reports whether a record existed.
    pub fn delete(&self, address: &Pubkey) -> bool {
        let existed = self.inner.records.lock().unwrap().remove(address).is_some();
        self.inner.pending.lock().unwrap().remove(address);
        self.inner.pending_mints.lock().unwrap().remove(address);
        if existed {
            self.emit(CacheEvent::Deleted { address: *address });
        }
        existed
    }

    /// Drop everything: records, mints, registry, pending fetches. Used on
    /// network switch.
    pub fn clear(&self) {
        self.inner.records.lock().unwrap().clear();
        self.inner.mints.lock().unwrap().clear();
        self.inner.parsers.lock().unwrap().clear();
        self.inner.pending.lock().unwrap().clear();
        self.inner.pending_mints.lock().unwrap().clear();
        debug!("cache cleared");
        self.emit(CacheEvent::Cleared);
    }

    /// Batched query: resolves every address, reading uncached ones via
    /// `get_multiple_accounts` in chunks of [`GET_MULTIPLE_LIMIT`]. The
    /// result is aligned with `addresses`; `None` marks accounts that are
    /// missing, uninitialized, or failed to decode (a bad record degrades
    /// its own slot, never the batch).
    ///
    /// Shares the pending map with `query`: addresses already in flight
    /// are joined instead of re-read, and this call's own reads are
    /// registered so concurrent single queries join them. Only a transport
    /// failure of a whole chunk fails the call.
    pub async fn query_many(
        &self,
        addresses: &[Pubkey],
        parser: Option<ParserKind>,
    ) -> Result<Vec<Option<Arc<CacheEntry>>>, LarderError> {
        let mut out: Vec<Option<Arc<CacheEntry>>> = vec![None; addresses.len()];
        let mut positions: HashMap<Pubkey, Vec<usize>> = HashMap::new();
        let mut misses: Vec<Pubkey> = Vec::new();
        for (i, address) in addresses.iter().enumerate() {
            match self.get(address) {
                Some(entry) => out[i] = Some(entry),
                None => {
                    positions
                        .entry(*address)
                        .or_insert_with(|| {
                            misses.push(*address);
                            Vec::new()
                        })
                        .push(i);
                }
            }
        }

        // Claim each miss in the pending map, or join a fetch that is
        // already in flight. Claimed slots resolve from this batch.
        let mut joined: Vec<(Pubkey, FetchFuture)> = Vec::new();
        let mut claimed: HashMap<Pubkey, oneshot::Sender<FetchResult>> = HashMap::new();
        let mut to_fetch: Vec<Pubkey> = Vec::new();
        {
            let mut pending = self.inner.pending.lock().unwrap();
            for address in misses {
                match pending.get(&address) {
                    Some(fut) => joined.push((address, fut.clone())),
                    None => {
                        let (tx, rx) = oneshot::channel();
                        let fut: FetchFuture = async move {
                            rx.await
                                .unwrap_or_else(|_| Err(LarderError::AccountNotFound(address)))
                        }
                        .boxed()
                        .shared();
                        pending.insert(address, fut);
                        claimed.insert(address, tx);
                        to_fetch.push(address);
                    }
                }
            }
        }

        let mut transport_failure: Option<LarderError> = None;
        for chunk in to_fetch.chunks(GET_MULTIPLE_LIMIT) {
            let accounts = match self.reader.get_multiple_accounts(chunk).await {
                Ok(accounts) => accounts,
                Err(err) => {
                    transport_failure = Some(err);
                    break;
                }
            };
            for (address, account) in chunk.iter().zip(accounts) {
                let result = match account {
                    Some(account) => match self.add(*address, account, parser) {
                        Ok(Some(entry)) => Ok(entry),
                        Ok(None) => Err(LarderError::AccountNotFound(*address)),
                        Err(err) => Err(err),
                    },
                    None => Err(LarderError::AccountNotFound(*address)),
                };
                match &result {
                    Ok(entry) => {
                        self.inner.pending.lock().unwrap().remove(address);
                        for i in &positions[address] {
                            out[*i] = Some(entry.clone());
                        }
                    }
                    Err(err) => {
                        warn!(%address, %err, "batch slot degraded");
                    }
                }
                if let Some(tx) = claimed.remove(address) {
                    let _ = tx.send(result);
                }
            }
        }
        if let Some(err) = transport_failure {
            // Resolve every remaining waiter before surfacing the failure;
            // the errors stay pinned until delete/clear, like any failed
            // fetch.
            for (_, tx) in claimed {
                let _ = tx.send(Err(err.clone()));
            }
            return Err(err);
        }

        for (address, fut) in joined {
            match fut.await {
                Ok(entry) => {
                    for i in &positions[&address] {
                        out[*i] = Some(entry.clone());
                    }
                }
                Err(err) => warn!(%address, %err, "batch slot degraded"),
            }
        }
        Ok(out)
    }

    /// Synchronous mint read. No I/O.
    pub fn get_mint(&self, address: &Pubkey) -> Option<spl_token::state::Mint> {
        self.inner.mints.lock().unwrap().get(address).copied()
    }

    /// Mint ingestion for pushed updates.
    pub fn add_mint(
        &self,
        address: Pubkey,
        account: &Account,
    ) -> Result<Option<spl_token::state::Mint>, LarderError> {
        if account.data.is_empty() {
            return Ok(None);
        }
        let mint = match state::parse(ParserKind::Mint, address, account)? {
            Some(Record::Mint(mint)) => mint,
            _ => return Ok(None),
        };
        let is_new = self.inner.mints.lock().unwrap().insert(address, mint).is_none();
        self.emit(CacheEvent::Updated { address, is_new });
        Ok(Some(mint))
    }

    /// Mint fetch with its own dedup map. Mints are read on every balance
    /// computation, hence the separate fast path.
    pub async fn query_mint(
        &self,
        address: Pubkey,
    ) -> Result<spl_token::state::Mint, LarderError> {
        if let Some(mint) = self.get_mint(&address) {
            return Ok(mint);
        }
        let fut = {
            let mut pending = self.inner.pending_mints.lock().unwrap();
            match pending.get(&address) {
                Some(fut) => fut.clone(),
                None => {
                    let this = self.clone();
                    let fut: MintFuture = async move {
                        let account = this
                            .reader
                            .get_account(&address)
                            .await?
                            .ok_or(LarderError::AccountNotFound(address))?;
                        this.add_mint(address, &account)?
                            .ok_or(LarderError::AccountNotFound(address))
                    }
                    .boxed()
                    .shared();
                    pending.insert(address, fut.clone());
                    fut
                }
            }
        };
        let result = fut.await;
        if result.is_ok() {
            self.inner.pending_mints.lock().unwrap().remove(&address);
        }
        result
    }
}

/// `LedgerReader` over a nonblocking RPC client. Subscriptions are
/// realized as polling tasks; `unsubscribe` aborts the task.
pub struct RpcLedgerReader {
    rpc: Arc<RpcClient>,
    commitment: CommitmentConfig,
    poll_interval: Duration,
    next_id: AtomicU64,
    watchers: Mutex<HashMap<SubscriptionId, tokio::task::JoinHandle<()>>>,
}

impl RpcLedgerReader {
    pub fn new(rpc: Arc<RpcClient>) -> Self {
        RpcLedgerReader {
            rpc,
            commitment: CommitmentConfig::confirmed(),
            poll_interval: Duration::from_secs(2),
            next_id: AtomicU64::new(1),
            watchers: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    fn rpc_error(address: &Pubkey, err: impl std::fmt::Display) -> LarderError {
        LarderError::FetchFailed { address: *address, reason: err.to_string() }
    }
}

#[async_trait]
impl LedgerReader for RpcLedgerReader {
    async fn get_account(&self, address: &Pubkey) -> Result<Option<Account>, LarderError> {
        self.rpc
            .get_account_with_commitment(address, self.commitment)
            .await
            .map(|response| response.value)
            .map_err(|err| Self::rpc_error(address, err))
    }

    async fn get_multiple_accounts(
        &self,
        addresses: &[Pubkey],
    ) -> Result<Vec<Option<Account>>, LarderError> {
        self.rpc
            .get_multiple_accounts(addresses)
            .await
            .map_err(|err| Self::rpc_error(addresses.first().unwrap_or(&Pubkey::default()), err))
    }

    async fn minimum_balance_for_rent_exemption(
        &self,
        data_len: usize,
    ) -> Result<u64, LarderError> {
        self.rpc
            .get_minimum_balance_for_rent_exemption(data_len)
            .await
            .map_err(|err| Self::rpc_error(&Pubkey::default(), err))
    }

    async fn subscribe(
        &self,
        address: Pubkey,
        sink: mpsc::UnboundedSender<(Pubkey, Account)>,
    ) -> Result<SubscriptionId, LarderError> {
        let rpc = Arc::clone(&self.rpc);
        let commitment = self.commitment;
        let poll_interval = self.poll_interval;
        let handle = tokio::spawn(async move {
            let mut last: Option<Account> = None;
            let mut ticker = tokio::time::interval(poll_interval);
            loop {
                ticker.tick().await;
                let fetched = match rpc.get_account_with_commitment(&address, commitment).await {
                    Ok(response) => response.value,
                    Err(err) => {
                        warn!(%address, %err, "account poll failed");
                        continue;
                    }
                };
                if let Some(account) = fetched {
                    if last.as_ref() != Some(&account) {
                        last = Some(account.clone());
                        if sink.send((address, account)).is_err() {
                            // Receiver gone, watcher has no audience.
                            return;
                        }
                    }
                }
            }
        });
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.watchers.lock().unwrap().insert(id, handle);
        Ok(id)
    }

    async fn unsubscribe(&self, id: SubscriptionId) -> Result<(), LarderError> {
        if let Some(handle) = self.watchers.lock().unwrap().remove(&id) {
            handle.abort();
        }
        Ok(())
    }
}
