use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::types::Type;
use rusqlite::{Connection, OptionalExtension, Row};
use rust_decimal::Decimal;
use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use uuid::Uuid;

use crate::models::{
    normalize_symbol, Account, Holding, NewTransaction, Stock, TradeSide, Transaction,
};
use crate::store::{LedgerStore, LedgerTx, StoreError};

/// SQLite-backed ledger. One connection, serialized behind a mutex; every
/// unit runs inside `BEGIN IMMEDIATE`.
#[derive(Clone)]
pub struct DatabasePool(pub Arc<Mutex<rusqlite::Connection>>);

impl DatabasePool {
    /// Open (or create) the ledger database at `path`.
    pub fn new(path: &str) -> Result<Self, StoreError> {
        Self::init(Connection::open(path)?)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, StoreError> {
        conn.busy_timeout(Duration::from_secs(5))?;
        conn.execute_batch("PRAGMA foreign_keys = ON")?;

        // Initialize schema for accounts
        conn.execute(
            "CREATE TABLE IF NOT EXISTS accounts (
                id TEXT PRIMARY KEY,
                balance TEXT NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )",
            [],
        )?;

        // Initialize schema for the stock catalog
        conn.execute(
            "CREATE TABLE IF NOT EXISTS stocks (
                symbol TEXT PRIMARY KEY,
                company_name TEXT NOT NULL,
                current_price TEXT,
                previous_close TEXT,
                day_high TEXT,
                day_low TEXT,
                volume INTEGER NOT NULL DEFAULT 0,
                price_change TEXT NOT NULL,
                change_percent TEXT NOT NULL,
                last_updated TEXT NOT NULL
            )",
            [],
        )?;

        // Initialize schema for portfolio (holdings)
        conn.execute(
            "CREATE TABLE IF NOT EXISTS holdings (
                account_id TEXT NOT NULL,
                stock_symbol TEXT NOT NULL,
                shares INTEGER NOT NULL CHECK (shares > 0),
                average_buy_price TEXT NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                PRIMARY KEY (account_id, stock_symbol),
                FOREIGN KEY (account_id) REFERENCES accounts(id)
            )",
            [],
        )?;

        // Initialize schema for transactions
        conn.execute(
            "CREATE TABLE IF NOT EXISTS transactions (
                id TEXT PRIMARY KEY,
                account_id TEXT NOT NULL,
                stock_symbol TEXT NOT NULL,
                transaction_type TEXT NOT NULL CHECK (transaction_type IN ('BUY', 'SELL')),
                quantity INTEGER NOT NULL CHECK (quantity > 0),
                price TEXT NOT NULL,
                timestamp TEXT NOT NULL,
                notes TEXT,
                FOREIGN KEY (account_id) REFERENCES accounts(id)
            )",
            [],
        )?;

        conn.execute(
            "CREATE INDEX IF NOT EXISTS transactions_by_account
             ON transactions (account_id, timestamp)",
            [],
        )?;

        Ok(Self(Arc::new(Mutex::new(conn))))
    }
}

impl LedgerStore for DatabasePool {
    fn begin(&self) -> Result<Box<dyn LedgerTx + '_>, StoreError> {
        // A unit that panicked has already rolled back in `SqliteTx::drop`.
        let conn = self.0.lock().unwrap_or_else(PoisonError::into_inner);
        conn.execute_batch("BEGIN IMMEDIATE")?;
        Ok(Box::new(SqliteTx {
            conn,
            committed: false,
        }))
    }
}

struct SqliteTx<'a> {
    conn: MutexGuard<'a, Connection>,
    committed: bool,
}

impl Drop for SqliteTx<'_> {
    fn drop(&mut self) {
        if !self.committed {
            if let Err(e) = self.conn.execute_batch("ROLLBACK") {
                tracing::error!("Error rolling back ledger unit: {}", e);
            }
        }
    }
}

// Timestamps are fixed-width RFC 3339 in UTC so text order matches time order.
fn format_time(at: &DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn conversion_error<E>(idx: usize, err: E) -> rusqlite::Error
where
    E: Into<Box<dyn std::error::Error + Send + Sync + 'static>>,
{
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, err.into())
}

fn decimal_col(row: &Row, idx: usize) -> rusqlite::Result<Decimal> {
    let text: String = row.get(idx)?;
    Decimal::from_str(&text).map_err(|e| conversion_error(idx, e))
}

fn opt_decimal_col(row: &Row, idx: usize) -> rusqlite::Result<Option<Decimal>> {
    let text: Option<String> = row.get(idx)?;
    text.map(|t| Decimal::from_str(&t).map_err(|e| conversion_error(idx, e)))
        .transpose()
}

fn time_col(row: &Row, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let text: String = row.get(idx)?;
    DateTime::parse_from_rfc3339(&text)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| conversion_error(idx, e))
}

fn uuid_col(row: &Row, idx: usize) -> rusqlite::Result<Uuid> {
    let text: String = row.get(idx)?;
    Uuid::parse_str(&text).map_err(|e| conversion_error(idx, e))
}

fn account_row(row: &Row) -> rusqlite::Result<Account> {
    Ok(Account {
        id: uuid_col(row, 0)?,
        balance: decimal_col(row, 1)?,
        created_at: time_col(row, 2)?,
        updated_at: time_col(row, 3)?,
    })
}

const STOCK_COLUMNS: &str = "symbol, company_name, current_price, previous_close, day_high, \
     day_low, volume, price_change, change_percent, last_updated";

fn stock_row(row: &Row) -> rusqlite::Result<Stock> {
    Ok(Stock {
        symbol: row.get(0)?,
        company_name: row.get(1)?,
        current_price: opt_decimal_col(row, 2)?,
        previous_close: opt_decimal_col(row, 3)?,
        day_high: opt_decimal_col(row, 4)?,
        day_low: opt_decimal_col(row, 5)?,
        volume: row.get(6)?,
        price_change: decimal_col(row, 7)?,
        change_percent: decimal_col(row, 8)?,
        last_updated: time_col(row, 9)?,
    })
}

const HOLDING_COLUMNS: &str =
    "account_id, stock_symbol, shares, average_buy_price, created_at, updated_at";

fn holding_row(row: &Row) -> rusqlite::Result<Holding> {
    Ok(Holding {
        account_id: uuid_col(row, 0)?,
        symbol: row.get(1)?,
        shares: row.get(2)?,
        average_buy_price: decimal_col(row, 3)?,
        created_at: time_col(row, 4)?,
        updated_at: time_col(row, 5)?,
    })
}

fn transaction_row(row: &Row) -> rusqlite::Result<Transaction> {
    let side: String = row.get(3)?;
    Ok(Transaction {
        id: uuid_col(row, 0)?,
        account_id: uuid_col(row, 1)?,
        symbol: row.get(2)?,
        side: side
            .parse::<TradeSide>()
            .map_err(|e| conversion_error(3, e))?,
        quantity: row.get(4)?,
        price: decimal_col(row, 5)?,
        timestamp: time_col(row, 6)?,
        notes: row.get(7)?,
    })
}

impl LedgerTx for SqliteTx<'_> {
    fn find_account(&mut self, id: Uuid) -> Result<Option<Account>, StoreError> {
        let account = self
            .conn
            .query_row(
                "SELECT id, balance, created_at, updated_at FROM accounts WHERE id = ?",
                [id.to_string()],
                account_row,
            )
            .optional()?;
        Ok(account)
    }

    fn insert_account(&mut self, account: &Account) -> Result<(), StoreError> {
        if self.find_account(account.id)?.is_some() {
            return Err(StoreError::DuplicateAccount(account.id));
        }
        self.conn.execute(
            "INSERT INTO accounts (id, balance, created_at, updated_at) VALUES (?, ?, ?, ?)",
            rusqlite::params![
                account.id.to_string(),
                account.balance.to_string(),
                format_time(&account.created_at),
                format_time(&account.updated_at),
            ],
        )?;
        Ok(())
    }

    fn save_account(&mut self, account: &Account) -> Result<(), StoreError> {
        self.conn.execute(
            "INSERT INTO accounts (id, balance, created_at, updated_at)
             VALUES (?, ?, ?, ?)
             ON CONFLICT(id)
             DO UPDATE SET
                 balance = excluded.balance,
                 updated_at = excluded.updated_at",
            rusqlite::params![
                account.id.to_string(),
                account.balance.to_string(),
                format_time(&account.created_at),
                format_time(&account.updated_at),
            ],
        )?;
        Ok(())
    }

    fn find_stock(&mut self, symbol: &str) -> Result<Option<Stock>, StoreError> {
        let stock = self
            .conn
            .query_row(
                &format!("SELECT {} FROM stocks WHERE symbol = ?", STOCK_COLUMNS),
                [normalize_symbol(symbol)],
                stock_row,
            )
            .optional()?;
        Ok(stock)
    }

    fn save_stock(&mut self, stock: &Stock) -> Result<(), StoreError> {
        self.conn.execute(
            &format!(
                "INSERT INTO stocks ({})
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                 ON CONFLICT(symbol)
                 DO UPDATE SET
                     company_name = excluded.company_name,
                     current_price = excluded.current_price,
                     previous_close = excluded.previous_close,
                     day_high = excluded.day_high,
                     day_low = excluded.day_low,
                     volume = excluded.volume,
                     price_change = excluded.price_change,
                     change_percent = excluded.change_percent,
                     last_updated = excluded.last_updated",
                STOCK_COLUMNS
            ),
            rusqlite::params![
                normalize_symbol(&stock.symbol),
                stock.company_name,
                stock.current_price.map(|d| d.to_string()),
                stock.previous_close.map(|d| d.to_string()),
                stock.day_high.map(|d| d.to_string()),
                stock.day_low.map(|d| d.to_string()),
                stock.volume,
                stock.price_change.to_string(),
                stock.change_percent.to_string(),
                format_time(&stock.last_updated),
            ],
        )?;
        Ok(())
    }

    fn list_stocks(&mut self) -> Result<Vec<Stock>, StoreError> {
        let mut stmt = self
            .conn
            .prepare(&format!("SELECT {} FROM stocks ORDER BY symbol", STOCK_COLUMNS))?;
        let stocks = stmt
            .query_map([], stock_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(stocks)
    }

    fn find_holding(
        &mut self,
        account_id: Uuid,
        symbol: &str,
    ) -> Result<Option<Holding>, StoreError> {
        let holding = self
            .conn
            .query_row(
                &format!(
                    "SELECT {} FROM holdings WHERE account_id = ? AND stock_symbol = ?",
                    HOLDING_COLUMNS
                ),
                [account_id.to_string(), normalize_symbol(symbol)],
                holding_row,
            )
            .optional()?;
        Ok(holding)
    }

    fn list_holdings(&mut self, account_id: Uuid) -> Result<Vec<Holding>, StoreError> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {} FROM holdings WHERE account_id = ? ORDER BY stock_symbol",
            HOLDING_COLUMNS
        ))?;
        let holdings = stmt
            .query_map([account_id.to_string()], holding_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(holdings)
    }

    fn save_holding(&mut self, holding: &Holding) -> Result<(), StoreError> {
        self.conn.execute(
            &format!(
                "INSERT INTO holdings ({})
                 VALUES (?, ?, ?, ?, ?, ?)
                 ON CONFLICT(account_id, stock_symbol)
                 DO UPDATE SET
                     shares = excluded.shares,
                     average_buy_price = excluded.average_buy_price,
                     updated_at = excluded.updated_at",
                HOLDING_COLUMNS
            ),
            rusqlite::params![
                holding.account_id.to_string(),
                normalize_symbol(&holding.symbol),
                holding.shares,
                holding.average_buy_price.to_string(),
                format_time(&holding.created_at),
                format_time(&holding.updated_at),
            ],
        )?;
        Ok(())
    }

    fn delete_holding(&mut self, account_id: Uuid, symbol: &str) -> Result<(), StoreError> {
        self.conn.execute(
            "DELETE FROM holdings WHERE account_id = ? AND stock_symbol = ?",
            [account_id.to_string(), normalize_symbol(symbol)],
        )?;
        Ok(())
    }

    fn append_transaction(&mut self, entry: NewTransaction) -> Result<Transaction, StoreError> {
        let transaction = entry.into_transaction(Uuid::new_v4(), Utc::now());
        self.conn.execute(
            "INSERT INTO transactions
                 (id, account_id, stock_symbol, transaction_type, quantity, price, timestamp, notes)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
            rusqlite::params![
                transaction.id.to_string(),
                transaction.account_id.to_string(),
                normalize_symbol(&transaction.symbol),
                transaction.side.as_str(),
                transaction.quantity,
                transaction.price.to_string(),
                format_time(&transaction.timestamp),
                transaction.notes,
            ],
        )?;
        Ok(transaction)
    }

    fn list_transactions(&mut self, account_id: Uuid) -> Result<Vec<Transaction>, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT id, account_id, stock_symbol, transaction_type, quantity, price, timestamp, notes
             FROM transactions
             WHERE account_id = ?
             ORDER BY timestamp DESC, rowid DESC",
        )?;
        let transactions = stmt
            .query_map([account_id.to_string()], transaction_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(transactions)
    }

    fn commit(mut self: Box<Self>) -> Result<(), StoreError> {
        self.conn.execute_batch("COMMIT")?;
        self.committed = true;
        Ok(())
    }
}
