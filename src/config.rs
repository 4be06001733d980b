use rust_decimal::Decimal;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug, PartialEq)]
pub enum ConfigError {
    #[error("{name} has an invalid value {value:?}: {reason}")]
    Invalid {
        name: &'static str,
        value: String,
        reason: String,
    },
}

/// Runtime settings, read from the environment (and `.env`).
#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    pub database_path: String,
    pub bind_addr: String,
    pub finnhub_api_key: Option<String>,
    pub finnhub_base_url: String,
    pub starting_balance: Decimal,
    pub quote_max_age: Duration,
    pub refresh_interval: Duration,
    pub refresh_concurrency: usize,
    pub refresh_min_gap: Duration,
    pub settlement_max_retries: u32,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            database_path: "db.sqlite".to_string(),
            bind_addr: "0.0.0.0:3000".to_string(),
            finnhub_api_key: None,
            finnhub_base_url: "https://finnhub.io/api/v1".to_string(),
            starting_balance: Decimal::new(1_000_000, 2),
            quote_max_age: Duration::from_secs(300),
            refresh_interval: Duration::from_secs(900),
            refresh_concurrency: 2,
            refresh_min_gap: Duration::from_millis(1000),
            settlement_max_retries: 3,
        }
    }
}

impl Settings {
    pub fn from_env() -> Result<Self, ConfigError> {
        // Initalize dotenv so we can read .env file
        dotenv::dotenv().ok();
        Self::from_lookup(|name| dotenv::var(name).ok())
    }

    /// Build settings from any variable source; unset variables keep their default.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Settings::default();
        let starting_balance =
            parse_or("STARTING_BALANCE", &lookup, defaults.starting_balance)?;
        if starting_balance < Decimal::ZERO {
            return Err(ConfigError::Invalid {
                name: "STARTING_BALANCE",
                value: starting_balance.to_string(),
                reason: "must not be negative".to_string(),
            });
        }
        let refresh_concurrency: usize = parse_or(
            "REFRESH_CONCURRENCY",
            &lookup,
            defaults.refresh_concurrency,
        )?;

        Ok(Self {
            database_path: lookup("DATABASE_PATH").unwrap_or(defaults.database_path),
            bind_addr: lookup("BIND_ADDR").unwrap_or(defaults.bind_addr),
            finnhub_api_key: lookup("FINNHUB_API_KEY").filter(|key| !key.trim().is_empty()),
            finnhub_base_url: lookup("FINNHUB_BASE_URL").unwrap_or(defaults.finnhub_base_url),
            starting_balance,
            quote_max_age: Duration::from_secs(parse_or(
                "QUOTE_MAX_AGE_SECS",
                &lookup,
                defaults.quote_max_age.as_secs(),
            )?),
            refresh_interval: Duration::from_secs(parse_or(
                "REFRESH_INTERVAL_SECS",
                &lookup,
                defaults.refresh_interval.as_secs(),
            )?),
            refresh_concurrency: refresh_concurrency.max(1),
            refresh_min_gap: Duration::from_millis(parse_or(
                "REFRESH_MIN_GAP_MS",
                &lookup,
                defaults.refresh_min_gap.as_millis() as u64,
            )?),
            settlement_max_retries: parse_or(
                "SETTLEMENT_MAX_RETRIES",
                &lookup,
                defaults.settlement_max_retries,
            )?,
        })
    }
}

fn parse_or<T, F>(name: &'static str, lookup: &F, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    match lookup(name) {
        None => Ok(default),
        Some(raw) => raw.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
            name,
            value: raw.clone(),
            reason: e.to_string(),
        }),
    }
}
