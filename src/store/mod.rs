//! Ledger Store: the record store behind settlement and valuation.
//!
//! Every read and write goes through a [`LedgerTx`] obtained from
//! [`LedgerStore::begin`]. Writes made through a unit become visible only
//! when it is committed; dropping it uncommitted rolls everything back.

pub mod memory;

use thiserror::Error;
use uuid::Uuid;

use crate::models::{Account, Holding, NewTransaction, Stock, Transaction};

pub use memory::MemoryLedger;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Sqlite(rusqlite::Error),

    /// Another unit changed a row this unit read or wrote.
    #[error("Write conflict on {0}")]
    Conflict(String),

    #[error("Account {0} already exists")]
    DuplicateAccount(Uuid),

    #[error("Ledger lock poisoned")]
    Poisoned,
}

impl From<rusqlite::Error> for StoreError {
    fn from(err: rusqlite::Error) -> Self {
        match &err {
            rusqlite::Error::SqliteFailure(failure, _)
                if matches!(
                    failure.code,
                    rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
                ) =>
            {
                StoreError::Conflict(err.to_string())
            }
            _ => StoreError::Sqlite(err),
        }
    }
}

/// A source of atomic units of work over accounts, stocks, holdings and
/// transactions.
pub trait LedgerStore: Send + Sync {
    fn begin(&self) -> Result<Box<dyn LedgerTx + '_>, StoreError>;
}

/// One atomic unit of work. Rolled back when dropped without [`LedgerTx::commit`].
pub trait LedgerTx {
    fn find_account(&mut self, id: Uuid) -> Result<Option<Account>, StoreError>;

    /// Insert a new account; fails with `DuplicateAccount` if the id is taken.
    fn insert_account(&mut self, account: &Account) -> Result<(), StoreError>;

    fn save_account(&mut self, account: &Account) -> Result<(), StoreError>;

    fn find_stock(&mut self, symbol: &str) -> Result<Option<Stock>, StoreError>;

    /// Insert or replace a stock row. All price fields are written together.
    fn save_stock(&mut self, stock: &Stock) -> Result<(), StoreError>;

    /// All listed stocks ordered by symbol.
    fn list_stocks(&mut self) -> Result<Vec<Stock>, StoreError>;

    fn find_holding(&mut self, account_id: Uuid, symbol: &str)
        -> Result<Option<Holding>, StoreError>;

    /// Holdings of one account ordered by symbol.
    fn list_holdings(&mut self, account_id: Uuid) -> Result<Vec<Holding>, StoreError>;

    fn save_holding(&mut self, holding: &Holding) -> Result<(), StoreError>;

    fn delete_holding(&mut self, account_id: Uuid, symbol: &str) -> Result<(), StoreError>;

    /// Append a transaction. The store assigns its id and timestamp.
    fn append_transaction(&mut self, entry: NewTransaction) -> Result<Transaction, StoreError>;

    /// Transactions of one account, newest first.
    fn list_transactions(&mut self, account_id: Uuid) -> Result<Vec<Transaction>, StoreError>;

    fn commit(self: Box<Self>) -> Result<(), StoreError>;
}
