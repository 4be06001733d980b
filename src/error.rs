use rust_decimal::Decimal;
use thiserror::Error;
use uuid::Uuid;

use crate::money;
use crate::oracle::OracleError;
use crate::store::StoreError;

/// Everything settlement, valuation and the catalog can fail with.
#[derive(Error, Debug)]
pub enum LedgerError {
    #[error("Account {0} not found")]
    AccountNotFound(Uuid),

    #[error("Stock {0} not found")]
    StockNotFound(String),

    #[error("Invalid stock symbol {0:?}")]
    InvalidSymbol(String),

    #[error("Quantity must be positive, got {0}")]
    InvalidQuantity(i64),

    #[error("Stock {symbol} has no tradable price")]
    InvalidPrice {
        symbol: String,
        price: Option<Decimal>,
    },

    #[error(
        "Insufficient funds: required {}, available {}",
        money::display(*required),
        money::display(*available)
    )]
    InsufficientFunds {
        required: Decimal,
        available: Decimal,
    },

    #[error("Insufficient shares of {symbol}: owned {owned}, requested {requested}")]
    InsufficientShares {
        symbol: String,
        owned: i64,
        requested: i64,
    },

    #[error("Amount out of range: {0}")]
    AmountOutOfRange(String),

    #[error("Price unavailable: {0}")]
    PriceUnavailable(String),

    #[error("Concurrent update, gave up: {0}")]
    ConcurrencyConflict(String),

    #[error("Stock {0} is already listed")]
    DuplicateStock(String),

    #[error(transparent)]
    Store(StoreError),
}

impl From<StoreError> for LedgerError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Conflict(what) => LedgerError::ConcurrencyConflict(what),
            other => LedgerError::Store(other),
        }
    }
}

impl From<OracleError> for LedgerError {
    fn from(err: OracleError) -> Self {
        match err {
            OracleError::Store(store) => store.into(),
            other => LedgerError::PriceUnavailable(other.to_string()),
        }
    }
}
