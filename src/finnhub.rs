use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::Deserialize;
use std::str::FromStr;
use url::Url;

use crate::models::QuoteSnapshot;
use crate::money;
use crate::oracle::{OracleError, QuoteFeed};

/// Response structure for the Finnhub `/quote` endpoint
#[derive(Deserialize, Debug, Clone)]
pub struct FinnhubQuote {
    pub c: f64, // Current price
    #[serde(default)]
    pub d: Option<f64>, // Day change
    #[serde(default)]
    pub dp: Option<f64>, // Day change percentage
    #[serde(default)]
    pub h: Option<f64>, // Day high
    #[serde(default)]
    pub l: Option<f64>, // Day low
    #[serde(default)]
    pub o: Option<f64>, // Open
    #[serde(default)]
    pub pc: Option<f64>, // Previous close
}

#[derive(Deserialize, Debug)]
struct FinnhubProfile {
    #[serde(default)]
    name: Option<String>,
}

fn to_decimal(symbol: &str, value: f64) -> Result<Decimal, OracleError> {
    // Go through the shortest round-trip text so 150.12 stays 150.12.
    Decimal::from_str(&value.to_string()).map_err(|e| OracleError::InvalidQuote {
        symbol: symbol.to_string(),
        reason: e.to_string(),
    })
}

impl FinnhubQuote {
    /// Convert into a snapshot. Finnhub answers unknown symbols with `c = 0`.
    pub fn into_snapshot(self, symbol: &str) -> Result<QuoteSnapshot, OracleError> {
        if !self.c.is_finite() || self.c <= 0.0 {
            return Err(OracleError::InvalidQuote {
                symbol: symbol.to_string(),
                reason: format!("current price {}", self.c),
            });
        }
        let optional = |value: Option<f64>| -> Result<Option<Decimal>, OracleError> {
            match value {
                Some(v) if v.is_finite() && v > 0.0 => Ok(Some(to_decimal(symbol, v)?)),
                _ => Ok(None),
            }
        };
        Ok(QuoteSnapshot {
            price: money::normalize_price(to_decimal(symbol, self.c)?),
            previous_close: optional(self.pc)?,
            day_high: optional(self.h)?,
            day_low: optional(self.l)?,
            volume: None,
        })
    }
}

/// HTTP client for the Finnhub market-data API.
#[derive(Clone)]
pub struct FinnhubClient {
    client: reqwest::Client,
    base_url: Url,
    api_key: String,
}

impl FinnhubClient {
    pub fn new(base_url: &str, api_key: String) -> Result<Self, OracleError> {
        // Keep a trailing slash so `join` appends instead of replacing the last segment.
        let base_url = Url::parse(&format!("{}/", base_url.trim_end_matches('/')))?;
        Ok(Self {
            client: reqwest::Client::new(),
            base_url,
            api_key,
        })
    }

    fn endpoint(&self, path: &str, symbol: &str) -> Result<Url, OracleError> {
        let mut url = self.base_url.join(path)?;
        url.query_pairs_mut()
            .append_pair("symbol", symbol)
            .append_pair("token", &self.api_key);
        Ok(url)
    }
}

#[async_trait]
impl QuoteFeed for FinnhubClient {
    async fn fetch_quote(&self, symbol: &str) -> Result<QuoteSnapshot, OracleError> {
        let url = self.endpoint("quote", symbol)?;
        tracing::debug!("Fetching quote for {}", symbol);
        let quote: FinnhubQuote = self
            .client
            .get(url)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        quote.into_snapshot(symbol)
    }

    async fn fetch_name(&self, symbol: &str) -> Result<String, OracleError> {
        let url = self.endpoint("stock/profile2", symbol)?;
        let profile: FinnhubProfile = self
            .client
            .get(url)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        profile
            .name
            .filter(|name| !name.trim().is_empty())
            .ok_or_else(|| OracleError::InvalidQuote {
                symbol: symbol.to_string(),
                reason: "no company profile".to_string(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn quote_json_is_parsed_into_a_snapshot() {
        let quote: FinnhubQuote = serde_json::from_str(
            r#"{"c":150.12,"d":1.5,"dp":1.01,"h":151.0,"l":148.25,"o":149.0,"pc":148.62,"t":1700000000}"#,
        )
        .unwrap();
        let snapshot = quote.into_snapshot("AAPL").unwrap();
        assert_eq!(snapshot.price, dec!(150.12));
        assert_eq!(snapshot.previous_close, Some(dec!(148.62)));
        assert_eq!(snapshot.day_high, Some(dec!(151)));
        assert_eq!(snapshot.day_low, Some(dec!(148.25)));
    }

    #[test]
    fn unknown_symbol_quote_is_rejected() {
        let quote: FinnhubQuote =
            serde_json::from_str(r#"{"c":0,"d":null,"dp":null,"h":0,"l":0,"o":0,"pc":0}"#).unwrap();
        assert!(matches!(
            quote.into_snapshot("ZZZZ"),
            Err(OracleError::InvalidQuote { symbol, .. }) if symbol == "ZZZZ"
        ));
    }

    #[test]
    fn endpoints_carry_symbol_and_token() {
        let client = FinnhubClient::new("https://finnhub.io/api/v1/", "key".to_string()).unwrap();
        let url = client.endpoint("stock/profile2", "MSFT").unwrap();
        assert_eq!(
            url.as_str(),
            "https://finnhub.io/api/v1/stock/profile2?symbol=MSFT&token=key"
        );
    }
}
