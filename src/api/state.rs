use axum::extract::FromRef;
use sqlx::PgPool;

use crate::services::ledger::GiftCardLedger;

#[derive(Clone)]
pub struct AppState {
    pub ledger: GiftCardLedger,
    /// Checked by `/health`; `None` when running on the in-memory store
    pub pool: Option<PgPool>,
}

impl FromRef<AppState> for GiftCardLedger {
    fn from_ref(state: &AppState) -> GiftCardLedger {
        state.ledger.clone()
    }
}
