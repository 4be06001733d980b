// src/lib.rs
pub mod accounts;
pub mod config;
pub mod db;
pub mod error;
pub mod finnhub;
pub mod handlers;
pub mod market;
pub mod models;
pub mod money;
pub mod oracle;
pub mod portfolio;
pub mod settlement;
pub mod store;

// Re-export commonly used items
pub use accounts::AccountRegistry;
pub use config::Settings;
pub use db::DatabasePool;
pub use error::LedgerError;
pub use market::StockCatalog;
pub use models::*;
pub use oracle::{CachedOracle, PriceOracle, PriceRefresher};
pub use portfolio::PortfolioValuator;
pub use settlement::SettlementEngine;
pub use store::{LedgerStore, MemoryLedger};
