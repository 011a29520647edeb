use axum::{
    extract::{Path, Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde::Deserialize;
use serde_json::json;
use uuid::Uuid;

use crate::api::AppState;
use crate::error::{AppError, Result};
use crate::services::ledger::{GiftCardLedger, GiftCardView, IssueRequest, UpdateGiftCard};
use crate::services::notifier::FailedDelivery;

async fn list_gift_cards(State(ledger): State<GiftCardLedger>) -> Result<Json<Vec<GiftCardView>>> {
    Ok(Json(ledger.list().await?))
}

async fn issue_gift_card(
    State(ledger): State<GiftCardLedger>,
    Json(request): Json<IssueRequest>,
) -> Result<(StatusCode, Json<GiftCardView>)> {
    let card = ledger.issue(request).await?;
    Ok((StatusCode::CREATED, Json(card)))
}

async fn get_gift_card(
    State(ledger): State<GiftCardLedger>,
    Path(id): Path<Uuid>,
) -> Result<Json<GiftCardView>> {
    Ok(Json(ledger.get(id).await?))
}

async fn update_gift_card(
    State(ledger): State<GiftCardLedger>,
    Path(id): Path<Uuid>,
    Json(update): Json<UpdateGiftCard>,
) -> Result<Json<GiftCardView>> {
    Ok(Json(ledger.update(id, update).await?))
}

async fn revoke_gift_card(
    State(ledger): State<GiftCardLedger>,
    Path(id): Path<Uuid>,
) -> Result<Json<serde_json::Value>> {
    ledger.revoke(id).await?;
    Ok(Json(json!({ "success": true })))
}

async fn download_certificate(
    State(ledger): State<GiftCardLedger>,
    Path(id): Path<Uuid>,
) -> Result<Response> {
    let certificate = ledger.export_certificate(id).await?;

    Ok((
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, "application/pdf".to_string()),
            (
                header::CONTENT_DISPOSITION,
                format!("attachment; filename={}", certificate.filename),
            ),
        ],
        certificate.bytes,
    )
        .into_response())
}

#[derive(Debug, Deserialize)]
struct QrQuery {
    format: Option<String>,
}

async fn gift_card_qr(
    State(ledger): State<GiftCardLedger>,
    Path(id): Path<Uuid>,
    Query(query): Query<QrQuery>,
) -> Result<Response> {
    match query.format.as_deref().unwrap_or("png") {
        "png" => {
            let png = ledger.qr_png(id).await?;
            Ok((StatusCode::OK, [(header::CONTENT_TYPE, "image/png")], png).into_response())
        }
        "svg" => {
            let svg = ledger.qr_svg(id).await?;
            Ok((StatusCode::OK, [(header::CONTENT_TYPE, "image/svg+xml")], svg).into_response())
        }
        other => Err(AppError::Validation(format!(
            "Unsupported QR format '{}', expected png or svg",
            other
        ))),
    }
}

async fn lookup_by_code(
    State(ledger): State<GiftCardLedger>,
    Path(code): Path<String>,
) -> Result<Json<GiftCardView>> {
    Ok(Json(ledger.get_by_code(&code).await?))
}

async fn failed_notifications(State(ledger): State<GiftCardLedger>) -> Json<Vec<FailedDelivery>> {
    Json(ledger.failed_notifications())
}

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/api/giftcards", get(list_gift_cards).post(issue_gift_card))
        .route(
            "/api/giftcards/:id",
            get(get_gift_card)
                .put(update_gift_card)
                .delete(revoke_gift_card),
        )
        .route("/api/giftcards/:id/pdf", get(download_certificate))
        .route("/api/giftcards/:id/qr", get(gift_card_qr))
        .route("/api/giftcard-codes/:code", get(lookup_by_code))
        .route("/api/notifications/failed", get(failed_notifications))
}
