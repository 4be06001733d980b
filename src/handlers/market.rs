use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use rust_decimal::Decimal;
use serde::Deserialize;

use super::{blocking, error_response, ApiError, AppState};
use crate::market::NewStock;
use crate::models::Stock;

pub async fn list_stocks(
    State(state): State<AppState>,
) -> Result<(StatusCode, Json<Vec<Stock>>), ApiError> {
    let stocks = blocking(move || state.catalog.all_stocks()).await?;
    Ok((StatusCode::OK, Json(stocks)))
}

#[derive(Deserialize, Debug)]
pub struct SearchQuery {
    #[serde(default)]
    pub q: String,
}

pub async fn search_stocks(
    State(state): State<AppState>,
    Query(query): Query<SearchQuery>,
) -> Result<(StatusCode, Json<Vec<Stock>>), ApiError> {
    let stocks = blocking(move || state.catalog.search(&query.q)).await?;
    Ok((StatusCode::OK, Json(stocks)))
}

/// A stock with its price brought up to date through the oracle.
pub async fn get_stock(
    State(state): State<AppState>,
    Path(symbol): Path<String>,
) -> Result<(StatusCode, Json<Stock>), ApiError> {
    let quote = state.oracle.get_price(&symbol).await;
    let catalog = state.catalog.clone();
    let stock = blocking(move || catalog.get_stock(&symbol)).await;
    let stock = match (quote, stock) {
        (Ok(_), stock) => stock?,
        (Err(_), Err(missing)) if missing.0 == StatusCode::NOT_FOUND => return Err(missing),
        (Err(e), _) => return Err(error_response(e.into())),
    };
    Ok((StatusCode::OK, Json(stock)))
}

pub async fn add_stock(
    State(state): State<AppState>,
    Json(new): Json<NewStock>,
) -> Result<(StatusCode, Json<Stock>), ApiError> {
    let stock = blocking(move || state.catalog.list_stock(new)).await?;
    Ok((StatusCode::CREATED, Json(stock)))
}

#[derive(Deserialize, Debug)]
pub struct PriceUpdate {
    pub price: Decimal,
}

pub async fn set_price(
    State(state): State<AppState>,
    Path(symbol): Path<String>,
    Json(update): Json<PriceUpdate>,
) -> Result<(StatusCode, Json<Stock>), ApiError> {
    let stock = blocking(move || state.catalog.set_price(&symbol, update.price)).await?;
    Ok((StatusCode::OK, Json(stock)))
}
