//! Price Oracle: current prices backed by the stock catalog, refilled from a
//! remote quote feed when the local row is missing or stale.

use async_trait::async_trait;
use chrono::Utc;
use futures_util::stream::{self, StreamExt};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use crate::models::{normalize_symbol, PriceQuote, QuoteSnapshot, Stock};
use crate::store::{LedgerStore, StoreError};

#[derive(Error, Debug)]
pub enum OracleError {
    #[error("No price available for {0}")]
    Unavailable(String),

    #[error("Quote request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Invalid quote URL: {0}")]
    Url(#[from] url::ParseError),

    #[error("Invalid quote for {symbol}: {reason}")]
    InvalidQuote { symbol: String, reason: String },

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Source of current prices.
#[async_trait]
pub trait PriceOracle: Send + Sync {
    async fn get_price(&self, symbol: &str) -> Result<PriceQuote, OracleError>;

    /// Refresh every listed symbol. Per-symbol failures are counted, not raised.
    async fn refresh_all(&self) -> RefreshReport;
}

/// A remote market-data feed.
#[async_trait]
pub trait QuoteFeed: Send + Sync {
    async fn fetch_quote(&self, symbol: &str) -> Result<QuoteSnapshot, OracleError>;

    async fn fetch_name(&self, symbol: &str) -> Result<String, OracleError>;
}

#[derive(Serialize, Debug, Clone, Default, PartialEq)]
pub struct RefreshReport {
    pub refreshed: usize,
    pub failed: Vec<String>,
}

/// Spaces out remote calls by at least `min_gap`.
pub struct Pacer {
    min_gap: Duration,
    next: Mutex<Instant>,
}

impl Pacer {
    pub fn new(min_gap: Duration) -> Self {
        Self {
            min_gap,
            next: Mutex::new(Instant::now()),
        }
    }

    /// Wait for the next free slot and claim it.
    pub async fn wait(&self) {
        let mut next = self.next.lock().await;
        if *next > Instant::now() {
            tokio::time::sleep_until(*next).await;
        }
        *next = Instant::now() + self.min_gap;
    }
}

/// Oracle that reads the local stock table first and falls back to a feed.
///
/// Without a feed it is local-only: any tradable row is served as-is.
pub struct CachedOracle {
    store: Arc<dyn LedgerStore>,
    feed: Option<Arc<dyn QuoteFeed>>,
    max_age: Duration,
    concurrency: usize,
    pacer: Pacer,
}

fn quote_of(stock: &Stock) -> Result<PriceQuote, OracleError> {
    let price = stock
        .tradable_price()
        .ok_or_else(|| OracleError::Unavailable(stock.symbol.clone()))?;
    Ok(PriceQuote {
        symbol: stock.symbol.clone(),
        price,
        previous_close: stock.previous_close,
        as_of: stock.last_updated,
    })
}

impl CachedOracle {
    pub fn new(
        store: Arc<dyn LedgerStore>,
        feed: Option<Arc<dyn QuoteFeed>>,
        max_age: Duration,
    ) -> Self {
        Self {
            store,
            feed,
            max_age,
            concurrency: 1,
            pacer: Pacer::new(Duration::ZERO),
        }
    }

    pub fn with_pacing(mut self, concurrency: usize, min_gap: Duration) -> Self {
        self.concurrency = concurrency.max(1);
        self.pacer = Pacer::new(min_gap);
        self
    }

    fn cached(&self, symbol: &str) -> Result<Option<Stock>, OracleError> {
        let mut tx = self.store.begin()?;
        Ok(tx.find_stock(symbol)?)
    }

    fn symbols(&self) -> Result<Vec<String>, OracleError> {
        let mut tx = self.store.begin()?;
        Ok(tx.list_stocks()?.into_iter().map(|s| s.symbol).collect())
    }

    fn is_fresh(&self, stock: &Stock) -> bool {
        let age = Utc::now().signed_duration_since(stock.last_updated);
        stock.tradable_price().is_some()
            && age.to_std().map_or(true, |age| age <= self.max_age)
    }

    /// Apply a snapshot to the stored row (creating it if needed) as one write.
    fn store_quote(
        &self,
        symbol: &str,
        name: Option<String>,
        snapshot: &QuoteSnapshot,
    ) -> Result<Stock, OracleError> {
        let mut tx = self.store.begin()?;
        let now = Utc::now();
        let mut stock = match tx.find_stock(symbol)? {
            Some(stock) => stock,
            None => Stock::new(symbol, name.as_deref().unwrap_or(symbol), now),
        };
        stock.apply_quote(snapshot, now);
        tx.save_stock(&stock)?;
        tx.commit()?;
        Ok(stock)
    }

    async fn fetch_and_store(&self, symbol: &str, listed: bool) -> Result<Stock, OracleError> {
        let feed = self
            .feed
            .as_ref()
            .ok_or_else(|| OracleError::Unavailable(symbol.to_string()))?;

        self.pacer.wait().await;
        let snapshot = feed.fetch_quote(symbol).await?;

        let name = if listed {
            None
        } else {
            self.pacer.wait().await;
            match feed.fetch_name(symbol).await {
                Ok(name) => Some(name),
                Err(e) => {
                    tracing::warn!("No company name for {}: {}", symbol, e);
                    None
                }
            }
        };
        self.store_quote(symbol, name, &snapshot)
    }
}

#[async_trait]
impl PriceOracle for CachedOracle {
    async fn get_price(&self, symbol: &str) -> Result<PriceQuote, OracleError> {
        let symbol = normalize_symbol(symbol);
        let cached = self.cached(&symbol)?;

        if let Some(stock) = &cached {
            if self.feed.is_none() || self.is_fresh(stock) {
                return quote_of(stock);
            }
        }

        match self.fetch_and_store(&symbol, cached.is_some()).await {
            Ok(stock) => quote_of(&stock),
            Err(OracleError::Store(e)) => Err(OracleError::Store(e)),
            Err(e) => match cached.as_ref().map(quote_of) {
                Some(Ok(stale)) => {
                    tracing::warn!(
                        "Serving stale price for {} from {}: {}",
                        symbol,
                        stale.as_of,
                        e
                    );
                    Ok(stale)
                }
                _ => {
                    tracing::warn!("Price unavailable for {}: {}", symbol, e);
                    Err(e)
                }
            },
        }
    }

    async fn refresh_all(&self) -> RefreshReport {
        let mut report = RefreshReport::default();
        if self.feed.is_none() {
            return report;
        }
        let symbols = match self.symbols() {
            Ok(symbols) => symbols,
            Err(e) => {
                tracing::error!("Error listing stocks for refresh: {}", e);
                return report;
            }
        };

        let results: Vec<(String, Result<Stock, OracleError>)> = stream::iter(symbols)
            .map(|symbol| async move {
                let result = self.fetch_and_store(&symbol, true).await;
                (symbol, result)
            })
            .buffer_unordered(self.concurrency)
            .collect()
            .await;

        for (symbol, result) in results {
            match result {
                Ok(_) => report.refreshed += 1,
                Err(e) => {
                    tracing::warn!("Refresh failed for {}: {}", symbol, e);
                    report.failed.push(symbol);
                }
            }
        }
        report.failed.sort();
        tracing::info!(
            "Price refresh done: {} refreshed, {} failed",
            report.refreshed,
            report.failed.len()
        );
        report
    }
}

/// Background task that calls [`PriceOracle::refresh_all`] on an interval.
pub struct PriceRefresher {
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl PriceRefresher {
    /// Spawn the refresh loop. The first refresh runs immediately.
    pub fn start(oracle: Arc<dyn PriceOracle>, every: Duration) -> Self {
        let (shutdown, mut signal) = watch::channel(false);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        oracle.refresh_all().await;
                    }
                    changed = signal.changed() => {
                        if changed.is_err() || *signal.borrow() {
                            break;
                        }
                    }
                }
            }
            tracing::info!("Price refresher stopped");
        });
        Self { shutdown, handle }
    }

    /// Signal the loop to stop and wait for it. An in-flight refresh finishes first.
    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.handle.await {
            tracing::error!("Price refresher task failed: {}", e);
        }
    }
}
