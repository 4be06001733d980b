//! In-memory reference ledger with optimistic concurrency.
//!
//! A unit stages its writes locally and remembers the version of every
//! account and holding row it touched. Commit re-checks those versions under
//! the write lock and fails with [`StoreError::Conflict`] if any moved, so
//! units on different accounts never block each other.

use chrono::Utc;
use std::collections::{BTreeMap, HashMap};
use std::sync::{RwLock, RwLockReadGuard};
use uuid::Uuid;

use super::{LedgerStore, LedgerTx, StoreError};
use crate::models::{normalize_symbol, Account, Holding, NewTransaction, Stock, Transaction};

#[derive(Debug, Clone)]
struct Versioned<T> {
    version: u64,
    value: T,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum RowKey {
    Account(Uuid),
    Holding(Uuid, String),
}

#[derive(Default)]
struct LedgerState {
    clock: u64,
    accounts: HashMap<Uuid, Versioned<Account>>,
    stocks: BTreeMap<String, Stock>,
    // Deleted holdings stay behind as `None` so their version keeps moving forward.
    holdings: BTreeMap<(Uuid, String), Versioned<Option<Holding>>>,
    transactions: Vec<Transaction>,
}

impl LedgerState {
    fn version_of(&self, key: &RowKey) -> u64 {
        match key {
            RowKey::Account(id) => self.accounts.get(id).map_or(0, |row| row.version),
            RowKey::Holding(id, symbol) => self
                .holdings
                .get(&(*id, symbol.clone()))
                .map_or(0, |row| row.version),
        }
    }
}

#[derive(Default)]
pub struct MemoryLedger {
    state: RwLock<LedgerState>,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }
}

impl LedgerStore for MemoryLedger {
    fn begin(&self) -> Result<Box<dyn LedgerTx + '_>, StoreError> {
        Ok(Box::new(MemoryTx {
            ledger: self,
            seen: HashMap::new(),
            accounts: HashMap::new(),
            stocks: BTreeMap::new(),
            holdings: BTreeMap::new(),
            transactions: Vec::new(),
        }))
    }
}

struct MemoryTx<'a> {
    ledger: &'a MemoryLedger,
    seen: HashMap<RowKey, u64>,
    accounts: HashMap<Uuid, Account>,
    stocks: BTreeMap<String, Stock>,
    holdings: BTreeMap<(Uuid, String), Option<Holding>>,
    transactions: Vec<Transaction>,
}

impl<'a> MemoryTx<'a> {
    fn read(&self) -> Result<RwLockReadGuard<'a, LedgerState>, StoreError> {
        self.ledger.state.read().map_err(|_| StoreError::Poisoned)
    }

    /// Remember the first version observed for `key`.
    fn track(&mut self, key: RowKey) -> Result<(), StoreError> {
        if !self.seen.contains_key(&key) {
            let version = self.read()?.version_of(&key);
            self.seen.insert(key, version);
        }
        Ok(())
    }

    fn has_writes(&self) -> bool {
        !(self.accounts.is_empty()
            && self.stocks.is_empty()
            && self.holdings.is_empty()
            && self.transactions.is_empty())
    }
}

impl LedgerTx for MemoryTx<'_> {
    fn find_account(&mut self, id: Uuid) -> Result<Option<Account>, StoreError> {
        if let Some(account) = self.accounts.get(&id) {
            return Ok(Some(account.clone()));
        }
        let key = RowKey::Account(id);
        let state = self.read()?;
        let row = state.accounts.get(&id).cloned();
        let version = row.as_ref().map_or(0, |r| r.version);
        drop(state);
        self.seen.entry(key).or_insert(version);
        Ok(row.map(|r| r.value))
    }

    fn insert_account(&mut self, account: &Account) -> Result<(), StoreError> {
        if self.find_account(account.id)?.is_some() {
            return Err(StoreError::DuplicateAccount(account.id));
        }
        self.accounts.insert(account.id, account.clone());
        Ok(())
    }

    fn save_account(&mut self, account: &Account) -> Result<(), StoreError> {
        self.track(RowKey::Account(account.id))?;
        self.accounts.insert(account.id, account.clone());
        Ok(())
    }

    fn find_stock(&mut self, symbol: &str) -> Result<Option<Stock>, StoreError> {
        let symbol = normalize_symbol(symbol);
        if let Some(stock) = self.stocks.get(&symbol) {
            return Ok(Some(stock.clone()));
        }
        Ok(self.read()?.stocks.get(&symbol).cloned())
    }

    fn save_stock(&mut self, stock: &Stock) -> Result<(), StoreError> {
        self.stocks.insert(normalize_symbol(&stock.symbol), stock.clone());
        Ok(())
    }

    fn list_stocks(&mut self) -> Result<Vec<Stock>, StoreError> {
        let mut merged = self.read()?.stocks.clone();
        for (symbol, stock) in &self.stocks {
            merged.insert(symbol.clone(), stock.clone());
        }
        Ok(merged.into_values().collect())
    }

    fn find_holding(
        &mut self,
        account_id: Uuid,
        symbol: &str,
    ) -> Result<Option<Holding>, StoreError> {
        let symbol = normalize_symbol(symbol);
        let map_key = (account_id, symbol.clone());
        if let Some(staged) = self.holdings.get(&map_key) {
            return Ok(staged.clone());
        }
        let state = self.read()?;
        let row = state.holdings.get(&map_key).cloned();
        drop(state);
        let version = row.as_ref().map_or(0, |r| r.version);
        self.seen
            .entry(RowKey::Holding(account_id, symbol))
            .or_insert(version);
        Ok(row.and_then(|r| r.value))
    }

    fn list_holdings(&mut self, account_id: Uuid) -> Result<Vec<Holding>, StoreError> {
        let mut merged: BTreeMap<String, Option<Holding>> = BTreeMap::new();
        {
            let state = self.read()?;
            for ((owner, symbol), row) in state.holdings.range((account_id, String::new())..) {
                if *owner != account_id {
                    break;
                }
                merged.insert(symbol.clone(), row.value.clone());
                self.seen
                    .entry(RowKey::Holding(account_id, symbol.clone()))
                    .or_insert(row.version);
            }
        }
        for ((owner, symbol), staged) in &self.holdings {
            if *owner == account_id {
                merged.insert(symbol.clone(), staged.clone());
            }
        }
        Ok(merged.into_values().flatten().collect())
    }

    fn save_holding(&mut self, holding: &Holding) -> Result<(), StoreError> {
        let symbol = normalize_symbol(&holding.symbol);
        self.track(RowKey::Holding(holding.account_id, symbol.clone()))?;
        self.holdings
            .insert((holding.account_id, symbol), Some(holding.clone()));
        Ok(())
    }

    fn delete_holding(&mut self, account_id: Uuid, symbol: &str) -> Result<(), StoreError> {
        let symbol = normalize_symbol(symbol);
        self.track(RowKey::Holding(account_id, symbol.clone()))?;
        self.holdings.insert((account_id, symbol), None);
        Ok(())
    }

    fn append_transaction(&mut self, entry: NewTransaction) -> Result<Transaction, StoreError> {
        let transaction = entry.into_transaction(Uuid::new_v4(), Utc::now());
        self.transactions.push(transaction.clone());
        Ok(transaction)
    }

    fn list_transactions(&mut self, account_id: Uuid) -> Result<Vec<Transaction>, StoreError> {
        let mut history: Vec<Transaction> = self
            .read()?
            .transactions
            .iter()
            .chain(self.transactions.iter())
            .filter(|t| t.account_id == account_id)
            .cloned()
            .collect();
        // Reverse first so that, among equal timestamps, later inserts stay ahead.
        history.reverse();
        history.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        Ok(history)
    }

    fn commit(self: Box<Self>) -> Result<(), StoreError> {
        if !self.has_writes() {
            return Ok(());
        }
        let ledger = self.ledger;
        let mut state = ledger.state.write().map_err(|_| StoreError::Poisoned)?;

        for (key, seen) in &self.seen {
            if state.version_of(key) != *seen {
                return Err(StoreError::Conflict(format!("{:?}", key)));
            }
        }

        state.clock += 1;
        let version = state.clock;
        let this = *self;
        for (id, account) in this.accounts {
            state.accounts.insert(id, Versioned { version, value: account });
        }
        for (key, holding) in this.holdings {
            state.holdings.insert(key, Versioned { version, value: holding });
        }
        state.stocks.extend(this.stocks);
        state.transactions.extend(this.transactions);
        Ok(())
    }
}
