use chrono::Utc;
use rust_decimal::Decimal;
use serde::Deserialize;
use std::sync::Arc;

use crate::error::LedgerError;
use crate::models::{normalize_symbol, QuoteSnapshot, Stock};
use crate::money;
use crate::settlement::{run_unit, DEFAULT_MAX_RETRIES};
use crate::store::LedgerStore;

/// A stock to add to the catalog.
#[derive(Deserialize, Debug, Clone)]
pub struct NewStock {
    pub symbol: String,
    pub company_name: String,
    pub current_price: Option<Decimal>,
    pub previous_close: Option<Decimal>,
    pub day_high: Option<Decimal>,
    pub day_low: Option<Decimal>,
    pub volume: Option<i64>,
}

/// The stock catalog: listing, explicit price sets and lookups.
pub struct StockCatalog {
    store: Arc<dyn LedgerStore>,
}

impl StockCatalog {
    pub fn new(store: Arc<dyn LedgerStore>) -> Self {
        Self { store }
    }

    pub fn list_stock(&self, new: NewStock) -> Result<Stock, LedgerError> {
        let symbol = normalize_symbol(&new.symbol);
        if symbol.is_empty() {
            return Err(LedgerError::InvalidSymbol(new.symbol));
        }
        let now = Utc::now();
        let mut stock = Stock::new(&symbol, new.company_name.trim(), now);
        if let Some(price) = new.current_price {
            stock.apply_quote(
                &QuoteSnapshot {
                    price,
                    previous_close: new.previous_close,
                    day_high: new.day_high,
                    day_low: new.day_low,
                    volume: new.volume,
                },
                now,
            );
        }

        run_unit(self.store.as_ref(), DEFAULT_MAX_RETRIES, |tx| {
            if tx.find_stock(&symbol)?.is_some() {
                return Err(LedgerError::DuplicateStock(symbol.clone()));
            }
            tx.save_stock(&stock)?;
            Ok(())
        })?;
        tracing::info!("Listed {} ({})", stock.symbol, stock.company_name);
        Ok(stock)
    }

    /// Set the current price explicitly. The old price becomes the previous close.
    pub fn set_price(&self, symbol: &str, price: Decimal) -> Result<Stock, LedgerError> {
        let symbol = normalize_symbol(symbol);
        if !money::is_tradable(price) {
            return Err(LedgerError::InvalidPrice {
                symbol,
                price: Some(price),
            });
        }
        let stock = run_unit(self.store.as_ref(), DEFAULT_MAX_RETRIES, |tx| {
            let mut stock = tx
                .find_stock(&symbol)?
                .ok_or_else(|| LedgerError::StockNotFound(symbol.clone()))?;
            stock.reprice(price, Utc::now());
            tx.save_stock(&stock)?;
            Ok(stock)
        })?;
        tracing::info!(
            "Price of {} set to {} ({}%)",
            stock.symbol,
            price,
            stock.change_percent
        );
        Ok(stock)
    }

    pub fn get_stock(&self, symbol: &str) -> Result<Stock, LedgerError> {
        let symbol = normalize_symbol(symbol);
        run_unit(self.store.as_ref(), DEFAULT_MAX_RETRIES, |tx| {
            tx.find_stock(&symbol)?
                .ok_or_else(|| LedgerError::StockNotFound(symbol.clone()))
        })
    }

    /// Every listed stock, ordered by symbol.
    pub fn all_stocks(&self) -> Result<Vec<Stock>, LedgerError> {
        run_unit(self.store.as_ref(), DEFAULT_MAX_RETRIES, |tx| {
            Ok(tx.list_stocks()?)
        })
    }

    /// Case-insensitive substring match on symbol or company name.
    pub fn search(&self, query: &str) -> Result<Vec<Stock>, LedgerError> {
        let needle = query.trim().to_lowercase();
        let stocks = self.all_stocks()?;
        if needle.is_empty() {
            return Ok(stocks);
        }
        Ok(stocks
            .into_iter()
            .filter(|s| {
                s.symbol.to_lowercase().contains(&needle)
                    || s.company_name.to_lowercase().contains(&needle)
            })
            .collect())
    }
}
