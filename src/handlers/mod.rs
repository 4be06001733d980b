pub mod accounts;
pub mod market;
pub mod portfolio;
pub mod trading;

use axum::http::StatusCode;
use axum::{
    routing::{get, post, put},
    Json, Router,
};
use std::sync::Arc;
use tower_http::trace::{self, TraceLayer};
use tracing::Level;

use crate::accounts::AccountRegistry;
use crate::error::LedgerError;
use crate::market::StockCatalog;
use crate::oracle::PriceOracle;
use crate::portfolio::PortfolioValuator;
use crate::settlement::SettlementEngine;

/// Shared services behind every route.
#[derive(Clone)]
pub struct AppState {
    pub accounts: Arc<AccountRegistry>,
    pub catalog: Arc<StockCatalog>,
    pub engine: Arc<SettlementEngine>,
    pub valuator: Arc<PortfolioValuator>,
    pub oracle: Arc<dyn PriceOracle>,
}

pub type ApiError = (StatusCode, Json<String>);

/// Map a ledger failure to its status class.
pub fn error_response(err: LedgerError) -> ApiError {
    let status = match &err {
        LedgerError::AccountNotFound(_) | LedgerError::StockNotFound(_) => StatusCode::NOT_FOUND,
        LedgerError::InvalidSymbol(_)
        | LedgerError::InvalidQuantity(_)
        | LedgerError::InvalidPrice { .. }
        | LedgerError::AmountOutOfRange(_)
        | LedgerError::InsufficientFunds { .. }
        | LedgerError::InsufficientShares { .. } => StatusCode::BAD_REQUEST,
        LedgerError::PriceUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        LedgerError::ConcurrencyConflict(_) | LedgerError::DuplicateStock(_) => {
            StatusCode::CONFLICT
        }
        LedgerError::Store(e) => {
            tracing::error!("Database error: {}", e);
            StatusCode::INTERNAL_SERVER_ERROR
        }
    };
    (status, Json(err.to_string()))
}

/// Run a synchronous ledger call on the blocking pool. A store unit can hold
/// the SQLite connection lock for its whole lifetime.
pub async fn blocking<T, F>(work: F) -> Result<T, ApiError>
where
    F: FnOnce() -> Result<T, LedgerError> + Send + 'static,
    T: Send + 'static,
{
    match tokio::task::spawn_blocking(work).await {
        Ok(result) => result.map_err(error_response),
        Err(e) => {
            tracing::error!("Ledger task failed: {}", e);
            Err((StatusCode::INTERNAL_SERVER_ERROR, Json(e.to_string())))
        }
    }
}

/// Build application with routes
pub fn router(state: AppState) -> Router {
    Router::new()
        // Account routes
        .route("/accounts", post(accounts::register_account))
        .route("/accounts/:id", get(accounts::get_account))
        // Trading routes
        .route("/accounts/:id/buy", post(trading::buy_stock))
        .route("/accounts/:id/sell", post(trading::sell_stock))
        .route("/accounts/:id/portfolio", get(portfolio::get_portfolio))
        .route(
            "/accounts/:id/transactions",
            get(portfolio::get_transaction_history),
        )
        // Stock catalog routes
        .route("/stocks", get(market::list_stocks).post(market::add_stock))
        .route("/stocks/search", get(market::search_stocks))
        .route("/stocks/:symbol", get(market::get_stock))
        .route("/stocks/:symbol/price", put(market::set_price))
        .with_state(state)
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(trace::DefaultMakeSpan::new().level(Level::INFO))
                .on_response(trace::DefaultOnResponse::new().level(Level::INFO)),
        )
}
