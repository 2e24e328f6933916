pub mod config;
pub mod db;
pub mod error;
pub mod handlers;
pub mod ledger;
pub mod middleware;
pub mod models;
pub mod services;
pub mod storage;

use axum::{
    extract::DefaultBodyLimit,
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::config::{Config, LedgerMode};
use crate::db::Database;
use crate::ledger::{EvmLedgerClient, InMemoryLedger, LedgerClient};
use crate::middleware::rate_limit::{RateLimiter, SqliteCounterStore};
use crate::services::{LedgerHandle, RetryPolicy, SettlementQueue};
use crate::storage::StorageManager;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub db: Database,
    pub config: Arc<Config>,
    pub storage: Arc<StorageManager>,
    pub ledger: LedgerHandle,
    pub rate_limiter: RateLimiter,
}

impl AppState {
    pub fn new(
        db: Database,
        config: Config,
        storage: StorageManager,
        ledger: Arc<dyn LedgerClient>,
    ) -> Self {
        let queue = SettlementQueue::new(RetryPolicy::from_config(&config.settlement));
        let ledger = LedgerHandle::new(ledger, queue, config.ledger.call_timeout());
        let rate_limiter = RateLimiter::new(
            Arc::new(SqliteCounterStore::new(db.clone())),
            &config.rate_limit,
        );

        Self {
            db,
            config: Arc::new(config),
            storage: Arc::new(storage),
            ledger,
            rate_limiter,
        }
    }

    /// Build storage providers and the ledger client the config asks for
    pub fn from_config(db: Database, config: Config) -> anyhow::Result<Self> {
        let storage = StorageManager::from_config(&config.storage);

        let ledger: Arc<dyn LedgerClient> = match config.ledger.mode {
            LedgerMode::Memory => {
                tracing::warn!("Using the in-memory ledger; nothing is settled on chain");
                Arc::new(InMemoryLedger::new(config.rewards.schedule()))
            }
            LedgerMode::Rpc => {
                let client = EvmLedgerClient::new(&config.ledger)?;
                tracing::info!(
                    "Ledger client for {} as {}",
                    config.ledger.contract_address,
                    client.sender_address()
                );
                Arc::new(client)
            }
        };

        Ok(Self::new(db, config, storage, ledger))
    }
}

/// Build the HTTP router
pub fn create_router(state: AppState) -> Router {
    // CORS configuration
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    // Payloads travel base64-encoded inside JSON
    let body_limit = state.config.server.max_upload_bytes / 3 * 4 + 64 * 1024;

    let api_routes = Router::new()
        // Content
        .route("/upload", post(handlers::file::upload_file))
        .route("/retrieve", post(handlers::file::retrieve_file))
        .route("/files/:cid", get(handlers::file::get_file))
        .route("/files/:cid/retire", post(handlers::file::retire_file))
        .route("/files/:cid/grants", get(handlers::file::list_grants))
        // Rewards
        .route("/claim-reward", post(handlers::reward::claim_reward))
        .route("/claim-reward/batch", post(handlers::reward::batch_claim))
        .route("/rewards/preview", get(handlers::reward::preview_reward))
        .route("/rewards/:address/balance", get(handlers::reward::reward_balance))
        // Access control
        .route("/access/grant", post(handlers::access::grant_access))
        .route("/access/revoke", post(handlers::access::revoke_access))
        .route("/access/:cid/:address", get(handlers::access::check_access))
        // Users
        .route("/users/:address/files", get(handlers::user::list_files))
        .route("/users/:address/stats", get(handlers::user::get_stats))
        .route("/users/:address/profile", get(handlers::user::get_profile))
        .route("/users/:address/activity", get(handlers::user::get_activity))
        // Ledger
        .route(
            "/transaction/:tx_hash/status",
            get(handlers::health::transaction_status),
        )
        .route("/webhook", post(handlers::webhook::receive_event))
        .route("/settlement/stats", get(handlers::health::settlement_stats))
        .route("/health", get(handlers::health::health))
        .layer(axum::middleware::from_fn_with_state(
            state.clone(),
            middleware::rate_limit::rate_limit_middleware,
        ))
        .layer(DefaultBodyLimit::max(body_limit));

    // Combine all routes under /api/v1
    Router::new()
        .nest("/api/v1", api_routes)
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}
