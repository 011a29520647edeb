// API module - HTTP endpoints

use axum::{routing::get, Router};

pub mod gift_cards;
pub mod health;
pub mod state;

pub use state::AppState;

/// All routes, without middleware layers
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health::health_check))
        .merge(gift_cards::router())
        .with_state(state)
}
