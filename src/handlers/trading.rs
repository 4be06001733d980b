use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use serde::Deserialize;
use uuid::Uuid;

use super::{blocking, error_response, ApiError, AppState};
use crate::error::LedgerError;
use crate::models::{TradeOrder, TradeSide, Transaction};

#[derive(Deserialize, Debug)]
pub struct TradeRequest {
    pub symbol: String,
    pub quantity: i64,
    #[serde(default)]
    pub notes: Option<String>,
}

/// Buy a stock with a given account ID. The request body should contain the stock symbol and the quantity to buy.
#[axum::debug_handler]
pub async fn buy_stock(
    State(state): State<AppState>,
    Path(account_id): Path<Uuid>,
    Json(trade): Json<TradeRequest>,
) -> Result<(StatusCode, Json<Transaction>), ApiError> {
    trade_stock(&state, account_id, TradeSide::Buy, trade).await
}

/// Sell a stock with a given account ID. The request body should contain the stock symbol and the quantity to sell.
#[axum::debug_handler]
pub async fn sell_stock(
    State(state): State<AppState>,
    Path(account_id): Path<Uuid>,
    Json(trade): Json<TradeRequest>,
) -> Result<(StatusCode, Json<Transaction>), ApiError> {
    trade_stock(&state, account_id, TradeSide::Sell, trade).await
}

async fn trade_stock(
    state: &AppState,
    account_id: Uuid,
    side: TradeSide,
    trade: TradeRequest,
) -> Result<(StatusCode, Json<Transaction>), ApiError> {
    if trade.quantity <= 0 {
        return Err(error_response(LedgerError::InvalidQuantity(trade.quantity)));
    }
    let accounts = state.accounts.clone();
    blocking(move || accounts.get(account_id)).await?;

    // Bring the catalog price up to date; no quote means no trade
    if let Err(e) = state.oracle.get_price(&trade.symbol).await {
        let unavailable = error_response(e.into());
        let catalog = state.catalog.clone();
        let symbol = trade.symbol.clone();
        return Err(match blocking(move || catalog.get_stock(&symbol)).await {
            Err(missing) if missing.0 == StatusCode::NOT_FOUND => missing,
            _ => unavailable,
        });
    }

    let engine = state.engine.clone();
    let order = TradeOrder {
        account_id,
        symbol: trade.symbol,
        side,
        quantity: trade.quantity,
        notes: trade.notes,
    };
    let transaction = blocking(move || engine.execute(&order)).await?;

    Ok((StatusCode::CREATED, Json(transaction)))
}
