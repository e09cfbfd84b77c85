// Library exports for binary tools and tests
pub mod config;
pub mod db;
pub mod error;
pub mod models;
pub mod routes;
pub mod services;

use std::sync::Arc;

use sqlx::PgPool;

use config::Config;
use services::booking::BookingOrchestrator;
use services::notifications::NotificationService;
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
