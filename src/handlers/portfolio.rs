use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use uuid::Uuid;

use super::{blocking, error_response, ApiError, AppState};
use crate::models::{normalize_symbol, Portfolio, TransactionView};

pub async fn get_portfolio(
    State(state): State<AppState>,
    Path(account_id): Path<Uuid>,
) -> Result<(StatusCode, Json<Portfolio>), ApiError> {
    let portfolio = state
        .valuator
        .get_portfolio(account_id)
        .await
        .map_err(error_response)?;
    Ok((StatusCode::OK, Json(portfolio)))
}

#[derive(Deserialize, Debug, Default)]
pub struct HistoryQuery {
    pub symbol: Option<String>,
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
}

/// Transaction history, newest first. Optional `symbol`, `from` and `to` narrow it down.
pub async fn get_transaction_history(
    State(state): State<AppState>,
    Path(account_id): Path<Uuid>,
    Query(query): Query<HistoryQuery>,
) -> Result<(StatusCode, Json<Vec<TransactionView>>), ApiError> {
    let engine = state.engine.clone();
    let history = blocking(move || match (query.symbol, query.from, query.to) {
        (None, None, None) => engine.transaction_history(account_id),
        (Some(symbol), None, None) => engine.transactions_for_symbol(account_id, &symbol),
        (symbol, from, to) => engine
            .transactions_between(
                account_id,
                from.unwrap_or(DateTime::<Utc>::MIN_UTC),
                to.unwrap_or(DateTime::<Utc>::MAX_UTC),
            )
            .map(|mut history| {
                if let Some(symbol) = symbol {
                    let symbol = normalize_symbol(&symbol);
                    history.retain(|t| t.symbol == symbol);
                }
                history
            }),
    })
    .await?;

    Ok((StatusCode::OK, Json(history)))
}
