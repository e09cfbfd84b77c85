mod config;
mod db;
mod error;
mod models;
mod routes;
mod services;

use std::sync::Arc;

use axum::{
    routing::{get, post},
    Router,
};
use sqlx::PgPool;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use config::Config;
use services::booking::BookingOrchestrator;
use services::notifications::{NotificationService, TwilioClient};
use services::oauth::StateSigner;
use services::token_vault::TokenVault;

/// Application state shared across all handlers.
#[derive(Clone)]
pub struct AppState {
    pub db: PgPool,
    pub config: Arc<Config>,
    pub vault: Arc<TokenVault>,
    pub notifications: Arc<NotificationService>,
    pub orchestrator: Arc<BookingOrchestrator>,
    pub state_signer: StateSigner,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Arc::new(Config::from_env()?);

    let pool = db::create_pool(&config.database_url).await?;
    db::run_migrations(&pool).await?;
    info!("Database connected and migrations applied");

    let vault = Arc::new(TokenVault::new(pool.clone(), config.tokens_enc_key));
    if config.run_token_migration {
        let migrated = vault.migrate_legacy_plaintext().await?;
        info!("Token migration sweep re-encrypted {migrated} legacy rows");
    }

    let provider = Arc::new(TwilioClient::new(
        config.twilio_account_sid.clone(),
        config.twilio_auth_token.clone(),
        config.twilio_from_number.clone(),
    ));
    let notifications = Arc::new(NotificationService::new(
        pool.clone(),
        provider,
        config.emergency_fallback_phone.clone(),
    ));

    let orchestrator = Arc::new(BookingOrchestrator::new(
        pool.clone(),
        config.clone(),
        vault.clone(),
        notifications.clone(),
    ));

    let state = AppState {
        db: pool.clone(),
        config: config.clone(),
        vault: vault.clone(),
        notifications: notifications.clone(),
        orchestrator,
        state_signer: StateSigner::new(&config.oauth_state_secret, config.oauth_state_ttl_sec),
    };

    services::hold_sweeper::start(pool.clone());
    if config.run_retry_worker {
        services::retry_worker::start(pool.clone(), config.clone(), vault, notifications);
        info!("Retry worker enabled");
    }

    let app = Router::new()
        .route("/health", get(routes::health::health_check))
        // Bookings (current and legacy route)
        .route("/api/bookings", post(routes::bookings::create_booking))
        .route("/api/book", post(routes::bookings::create_booking))
        // Availability
        .route("/api/available-slots", get(routes::availability::available_slots))
        // Business profile
        .route(
            "/api/businesses/{business_id}/profile",
            get(routes::profile::get_profile).put(routes::profile::update_profile),
        )
        // Google Calendar consent
        .route("/auth/google-business", get(routes::oauth::google_business))
        .route("/auth/google/callback", get(routes::oauth::google_callback))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state);

    let addr = format!("{}:{}", config.host, config.port);
    info!("fieldbook API listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
