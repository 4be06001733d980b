use std::sync::Arc;
use tracing::Level;

use stocksim_ledger::finnhub::FinnhubClient;
use stocksim_ledger::handlers::{self, AppState};
use stocksim_ledger::oracle::QuoteFeed;
use stocksim_ledger::{
    AccountRegistry, CachedOracle, DatabasePool, LedgerStore, PortfolioValuator, PriceOracle,
    PriceRefresher, SettlementEngine, Settings, StockCatalog,
};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Set the log level based on the first argument
    let args: Vec<String> = std::env::args().collect();
    let mut log_level = Level::INFO;
    if args.len() >= 2 {
        log_level = match args[1].as_str() {
            "debug" => Level::DEBUG,
            "warn" => Level::WARN,
            "error" => Level::ERROR,
            _ => Level::INFO,
        };
    }

    // Initialize tracing
    tracing_subscriber::fmt()
        .with_target(false)
        .compact()
        .with_max_level(log_level)
        .init();

    tracing::info!("Log level set to: {}", log_level);

    let settings = Settings::from_env()?;

    // Initialize the ledger database
    let store: Arc<dyn LedgerStore> = Arc::new(DatabasePool::new(&settings.database_path)?);
    tracing::info!("Ledger database at {}", settings.database_path);

    let feed: Option<Arc<dyn QuoteFeed>> = match &settings.finnhub_api_key {
        Some(key) => Some(Arc::new(FinnhubClient::new(
            &settings.finnhub_base_url,
            key.clone(),
        )?)),
        None => {
            tracing::warn!("FINNHUB_API_KEY not set, prices come from the local catalog only");
            None
        }
    };
    let oracle: Arc<dyn PriceOracle> = Arc::new(
        CachedOracle::new(store.clone(), feed, settings.quote_max_age)
            .with_pacing(settings.refresh_concurrency, settings.refresh_min_gap),
    );

    let state = AppState {
        accounts: Arc::new(AccountRegistry::new(
            store.clone(),
            settings.starting_balance,
        )),
        catalog: Arc::new(StockCatalog::new(store.clone())),
        engine: Arc::new(
            SettlementEngine::new(store.clone())
                .with_max_retries(settings.settlement_max_retries),
        ),
        valuator: Arc::new(PortfolioValuator::new(store.clone(), oracle.clone())),
        oracle: oracle.clone(),
    };

    // Start the background price refresh
    let refresher = PriceRefresher::start(oracle, settings.refresh_interval);

    let app = handlers::router(state);

    // Run server
    let listener = tokio::net::TcpListener::bind(&settings.bind_addr).await?;

    tracing::info!("Listening on: {}", listener.local_addr()?);
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!("Error waiting for shutdown signal: {}", e);
            }
        })
        .await?;

    refresher.stop().await;
    tracing::info!("Shut down");

    Ok(())
}
