use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use uuid::Uuid;

use super::{blocking, ApiError, AppState};
use crate::models::Account;

/// Opens a new account funded with the starting balance.
pub async fn register_account(
    State(state): State<AppState>,
) -> Result<(StatusCode, Json<Account>), ApiError> {
    let account = blocking(move || state.accounts.register()).await?;
    Ok((StatusCode::CREATED, Json(account)))
}

/// Gets an account by ID.
pub async fn get_account(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<(StatusCode, Json<Account>), ApiError> {
    let account = blocking(move || state.accounts.get(id)).await?;
    Ok((StatusCode::OK, Json(account)))
}
