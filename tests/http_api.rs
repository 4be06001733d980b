use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde_json::{json, Value};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceExt;

use stocksim_ledger::handlers::{self, AppState};
use stocksim_ledger::{
    AccountRegistry, CachedOracle, LedgerStore, MemoryLedger, PortfolioValuator, PriceOracle,
    SettlementEngine, StockCatalog,
};

fn app() -> Router {
    let store: Arc<dyn LedgerStore> = Arc::new(MemoryLedger::new());
    let oracle: Arc<dyn PriceOracle> = Arc::new(CachedOracle::new(
        store.clone(),
        None,
        Duration::from_secs(300),
    ));
    handlers::router(AppState {
        accounts: Arc::new(AccountRegistry::new(store.clone(), dec!(10000.00))),
        catalog: Arc::new(StockCatalog::new(store.clone())),
        engine: Arc::new(SettlementEngine::new(store.clone())),
        valuator: Arc::new(PortfolioValuator::new(store, oracle.clone())),
        oracle,
    })
}

async fn call(app: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let request = Request::builder().method(method).uri(uri);
    let request = match body {
        Some(body) => request
            .header("content-type", "application/json")
            .body(Body::from(body.to_string())),
        None => request.body(Body::empty()),
    }
    .unwrap();

    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, value)
}

fn decimal(value: &Value) -> Decimal {
    Decimal::from_str(value.as_str().unwrap()).unwrap()
}

async fn open_account(app: &Router) -> String {
    let (status, account) = call(app, "POST", "/accounts", None).await;
    assert_eq!(status, StatusCode::CREATED);
    account["id"].as_str().unwrap().to_string()
}

async fn list_stock(app: &Router, symbol: &str, price: &str) {
    let (status, _) = call(
        app,
        "POST",
        "/stocks",
        Some(json!({ "symbol": symbol, "company_name": format!("{} Inc.", symbol), "current_price": price })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
}

#[tokio::test]
async fn trading_round_trip() {
    let app = app();
    let id = open_account(&app).await;
    list_stock(&app, "AAPL", "150").await;

    let (status, tx) = call(
        &app,
        "POST",
        &format!("/accounts/{}/buy", id),
        Some(json!({ "symbol": "aapl", "quantity": 10, "notes": "first lot" })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(tx["side"], "BUY");
    assert_eq!(tx["symbol"], "AAPL");
    assert_eq!(tx["notes"], "first lot");

    let (_, account) = call(&app, "GET", &format!("/accounts/{}", id), None).await;
    assert_eq!(decimal(&account["balance"]), dec!(8500));

    let (status, _) = call(
        &app,
        "PUT",
        "/stocks/AAPL/price",
        Some(json!({ "price": "160" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let (status, portfolio) = call(&app, "GET", &format!("/accounts/{}/portfolio", id), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(decimal(&portfolio["total_value"]), dec!(1600));
    assert_eq!(decimal(&portfolio["total_gain_loss"]), dec!(100));
    assert_eq!(decimal(&portfolio["holdings"][0]["day_change"]), dec!(10));

    let (status, _) = call(
        &app,
        "POST",
        &format!("/accounts/{}/sell", id),
        Some(json!({ "symbol": "AAPL", "quantity": 4 })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);

    let (_, history) = call(&app, "GET", &format!("/accounts/{}/transactions", id), None).await;
    let history = history.as_array().unwrap();
    assert_eq!(history.len(), 2);
    assert_eq!(history[0]["side"], "SELL");
    assert_eq!(decimal(&history[0]["total"]), dec!(640));

    let (_, filtered) = call(
        &app,
        "GET",
        &format!("/accounts/{}/transactions?symbol=msft", id),
        None,
    )
    .await;
    assert!(filtered.as_array().unwrap().is_empty());

    let (_, window) = call(
        &app,
        "GET",
        &format!(
            "/accounts/{}/transactions?symbol=AAPL&from=2000-01-01T00:00:00Z",
            id
        ),
        None,
    )
    .await;
    assert_eq!(window.as_array().unwrap().len(), 2);
}

#[tokio::test]
async fn errors_map_to_status_codes() {
    let app = app();
    let id = open_account(&app).await;
    list_stock(&app, "AAPL", "150").await;

    let buy = |body: Value| {
        let app = app.clone();
        let uri = format!("/accounts/{}/buy", id);
        async move { call(&app, "POST", &uri, Some(body)).await.0 }
    };

    assert_eq!(buy(json!({ "symbol": "AAPL", "quantity": 0 })).await, StatusCode::BAD_REQUEST);
    assert_eq!(buy(json!({ "symbol": "AAPL", "quantity": 1000 })).await, StatusCode::BAD_REQUEST);
    assert_eq!(buy(json!({ "symbol": "NOPE", "quantity": 1 })).await, StatusCode::NOT_FOUND);

    let (status, _) = call(
        &app,
        "POST",
        &format!("/accounts/{}/sell", id),
        Some(json!({ "symbol": "AAPL", "quantity": 1 })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    list_stock(&app, "BIG", "10000000000000000000").await;
    assert_eq!(
        buy(json!({ "symbol": "BIG", "quantity": i64::MAX })).await,
        StatusCode::BAD_REQUEST
    );
    assert_eq!(buy(json!({ "symbol": "AAPL", "quantity": 1 })).await, StatusCode::CREATED);

    let missing = format!("/accounts/{}", uuid::Uuid::new_v4());
    assert_eq!(call(&app, "GET", &missing, None).await.0, StatusCode::NOT_FOUND);

    // Listed without a price: no quote can be had
    let (status, _) = call(
        &app,
        "POST",
        "/stocks",
        Some(json!({ "symbol": "IPO", "company_name": "Upcoming" })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(
        buy(json!({ "symbol": "IPO", "quantity": 1 })).await,
        StatusCode::SERVICE_UNAVAILABLE
    );
    assert_eq!(call(&app, "GET", "/stocks/IPO", None).await.0, StatusCode::SERVICE_UNAVAILABLE);

    let (status, _) = call(
        &app,
        "POST",
        "/stocks",
        Some(json!({ "symbol": "AAPL", "company_name": "Again" })),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
}

#[tokio::test]
async fn catalog_routes() {
    let app = app();
    list_stock(&app, "MSFT", "400").await;
    list_stock(&app, "AAPL", "150").await;

    let (_, stocks) = call(&app, "GET", "/stocks", None).await;
    let symbols: Vec<&str> = stocks
        .as_array()
        .unwrap()
        .iter()
        .map(|s| s["symbol"].as_str().unwrap())
        .collect();
    assert_eq!(symbols, vec!["AAPL", "MSFT"]);

    let (_, found) = call(&app, "GET", "/stocks/search?q=micro", None).await;
    assert_eq!(found.as_array().unwrap().len(), 0);
    let (_, found) = call(&app, "GET", "/stocks/search?q=msft", None).await;
    assert_eq!(found[0]["company_name"], "MSFT Inc.");

    let (status, stock) = call(&app, "GET", "/stocks/msft", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(decimal(&stock["current_price"]), dec!(400));

    assert_eq!(call(&app, "GET", "/stocks/NOPE", None).await.0, StatusCode::NOT_FOUND);
    let (status, _) = call(&app, "PUT", "/stocks/AAPL/price", Some(json!({ "price": "0" }))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}
