use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::money;

/// Account represents a user's cash account.
/// The balance never goes negative; only settlement changes it once opened.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Account {
    pub id: Uuid,
    pub balance: Decimal,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Account {
    /// A freshly registered account holding `starting_balance` in cash.
    pub fn open(starting_balance: Decimal, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            balance: starting_balance,
            created_at: now,
            updated_at: now,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "UPPERCASE")]
pub enum TradeSide {
    Buy,
    Sell,
}

impl TradeSide {
    pub fn as_str(&self) -> &'static str {
        match self {
            TradeSide::Buy => "BUY",
            TradeSide::Sell => "SELL",
        }
    }
}

impl fmt::Display for TradeSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TradeSide {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "BUY" => Ok(TradeSide::Buy),
            "SELL" => Ok(TradeSide::Sell),
            other => Err(format!("unknown trade side: {}", other)),
        }
    }
}

/// A listed stock and its latest known price fields.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Stock {
    pub symbol: String,
    pub company_name: String,
    pub current_price: Option<Decimal>,
    pub previous_close: Option<Decimal>,
    pub day_high: Option<Decimal>,
    pub day_low: Option<Decimal>,
    pub volume: i64,
    pub price_change: Decimal,
    pub change_percent: Decimal,
    pub last_updated: DateTime<Utc>,
}

/// Price fields reported by a market-data feed for one symbol.
#[derive(Debug, Clone, PartialEq)]
pub struct QuoteSnapshot {
    pub price: Decimal,
    pub previous_close: Option<Decimal>,
    pub day_high: Option<Decimal>,
    pub day_low: Option<Decimal>,
    pub volume: Option<i64>,
}

impl QuoteSnapshot {
    pub fn price_only(price: Decimal) -> Self {
        Self {
            price,
            previous_close: None,
            day_high: None,
            day_low: None,
            volume: None,
        }
    }
}

fn positive(value: Option<Decimal>) -> Option<Decimal> {
    value
        .filter(|v| money::is_tradable(*v))
        .map(money::normalize_price)
}

impl Stock {
    /// An unpriced catalog entry.
    pub fn new(symbol: &str, company_name: &str, now: DateTime<Utc>) -> Self {
        Self {
            symbol: normalize_symbol(symbol),
            company_name: company_name.to_string(),
            current_price: None,
            previous_close: None,
            day_high: None,
            day_low: None,
            volume: 0,
            price_change: Decimal::ZERO,
            change_percent: Decimal::ZERO,
            last_updated: now,
        }
    }

    /// The current price if it can be traded at.
    pub fn tradable_price(&self) -> Option<Decimal> {
        self.current_price.filter(|p| money::is_tradable(*p))
    }

    /// Overwrite the price fields from a feed snapshot.
    ///
    /// When the feed does not report a previous close, the old current price
    /// takes that role.
    pub fn apply_quote(&mut self, snapshot: &QuoteSnapshot, now: DateTime<Utc>) {
        let previous = snapshot.previous_close.or(self.current_price);
        self.previous_close = positive(previous);
        self.current_price = positive(Some(snapshot.price));
        if snapshot.day_high.is_some() {
            self.day_high = positive(snapshot.day_high);
        }
        if snapshot.day_low.is_some() {
            self.day_low = positive(snapshot.day_low);
        }
        if let Some(volume) = snapshot.volume {
            self.volume = volume.max(0);
        }
        self.last_updated = now;
        self.recompute_change();
    }

    /// Explicit price set: the old current price becomes the previous close.
    pub fn reprice(&mut self, price: Decimal, now: DateTime<Utc>) {
        self.previous_close = positive(self.current_price);
        self.current_price = positive(Some(price));
        self.last_updated = now;
        self.recompute_change();
    }

    fn recompute_change(&mut self) {
        match (self.current_price, self.previous_close) {
            (Some(current), Some(previous)) if !previous.is_zero() => {
                let change = current - previous;
                self.price_change = change;
                self.change_percent = money::percent_of(change, previous);
            }
            _ => {
                self.price_change = Decimal::ZERO;
                self.change_percent = Decimal::ZERO;
            }
        }
    }
}

/// Symbols are stored and compared upper-case.
pub fn normalize_symbol(symbol: &str) -> String {
    symbol.trim().to_ascii_uppercase()
}

/// An account's position in one stock. `shares` is always positive for a
/// stored holding.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Holding {
    pub account_id: Uuid,
    pub symbol: String,
    pub shares: i64,
    pub average_buy_price: Decimal,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Holding {
    /// `None` when `shares × average_buy_price` overflows.
    pub fn cost_basis(&self) -> Option<Decimal> {
        money::notional(self.average_buy_price, self.shares)
    }
}

/// Immutable record of an executed trade.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Transaction {
    pub id: Uuid,
    pub account_id: Uuid,
    pub symbol: String,
    pub side: TradeSide,
    pub quantity: i64,
    pub price: Decimal,
    pub timestamp: DateTime<Utc>,
    pub notes: Option<String>,
}

impl Transaction {
    pub fn total(&self) -> Option<Decimal> {
        money::notional(self.price, self.quantity)
    }
}

/// A transaction before the store has assigned its id and timestamp.
#[derive(Debug, Clone)]
pub struct NewTransaction {
    pub account_id: Uuid,
    pub symbol: String,
    pub side: TradeSide,
    pub quantity: i64,
    pub price: Decimal,
    pub notes: Option<String>,
}

impl NewTransaction {
    pub fn into_transaction(self, id: Uuid, timestamp: DateTime<Utc>) -> Transaction {
        Transaction {
            id,
            account_id: self.account_id,
            symbol: self.symbol,
            side: self.side,
            quantity: self.quantity,
            price: self.price,
            timestamp,
            notes: self.notes,
        }
    }
}

/// A buy or sell request against one account.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct TradeOrder {
    pub account_id: Uuid,
    pub symbol: String,
    pub side: TradeSide,
    pub quantity: i64,
    pub notes: Option<String>,
}

/// A transaction joined with the catalog entry of its stock.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct TransactionView {
    pub id: Uuid,
    pub symbol: String,
    pub company_name: Option<String>,
    pub side: TradeSide,
    pub quantity: i64,
    pub price: Decimal,
    pub total: Decimal,
    pub timestamp: DateTime<Utc>,
    pub notes: Option<String>,
}

/// Latest price known for a symbol.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct PriceQuote {
    pub symbol: String,
    pub price: Decimal,
    pub previous_close: Option<Decimal>,
    pub as_of: DateTime<Utc>,
}

/// One valued line of a portfolio.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct HoldingValuation {
    pub symbol: String,
    pub company_name: Option<String>,
    pub shares: i64,
    pub average_buy_price: Decimal,
    pub current_price: Decimal,
    pub market_value: Decimal,
    pub cost_basis: Decimal,
    pub gain_loss: Decimal,
    pub gain_loss_percent: Decimal,
    pub day_change: Option<Decimal>,
    pub day_change_percent: Option<Decimal>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Portfolio {
    pub account_id: Uuid,
    pub cash_balance: Decimal,
    pub holdings: Vec<HoldingValuation>,
    pub total_value: Decimal,
    pub total_cost_basis: Decimal,
    pub total_gain_loss: Decimal,
    pub total_gain_loss_percent: Decimal,
    /// Symbols left out because no quote was available.
    pub excluded: Vec<String>,
}
