use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

use crate::services::ledger::LedgerError;

#[derive(Error, Debug)]
pub enum AppError {
    #[error(transparent)]
    Ledger(#[from] LedgerError),

    #[error("Validation error: {0}")]
    Validation(String),
}

impl AppError {
    pub fn status(&self) -> StatusCode {
        match self {
            AppError::Ledger(e) => match e {
                LedgerError::InvalidAmount
                | LedgerError::InvalidBalance { .. }
                | LedgerError::InvalidHolder(_) => StatusCode::BAD_REQUEST,
                LedgerError::NotFound => StatusCode::NOT_FOUND,
                LedgerError::Conflict => StatusCode::CONFLICT,
                LedgerError::CodeSpaceExhausted(_) => StatusCode::SERVICE_UNAVAILABLE,
                LedgerError::CodeGeneration(_)
                | LedgerError::Store(_)
                | LedgerError::Holder(_)
                | LedgerError::QrGeneration(_)
                | LedgerError::Certificate(_) => StatusCode::INTERNAL_SERVER_ERROR,
            },
            AppError::Validation(_) => StatusCode::BAD_REQUEST,
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let error_debug = format!("{:?}", self);
        let status = self.status();

        let error_message = if status.is_server_error() && status != StatusCode::SERVICE_UNAVAILABLE
        {
            tracing::error!(error = %self, "Request failed");
            "Internal server error".to_string()
        } else {
            self.to_string()
        };

        let body = Json(json!({
            "error": error_debug,
            "message": error_message,
        }));

        (status, body).into_response()
    }
}

pub type Result<T> = std::result::Result<T, AppError>;
