//! Order ingress and saga lookup endpoints.

use axum::Json;
use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use broker::OrderId;
use choreography::{ReceiptStatus, SagaTrail, SubmitReceipt};
use domain::SubmitOrderRequest;

use crate::AppState;
use crate::error::ApiError;

/// POST /order: validates an order and hands `order_created` to the broker.
///
/// Responds 200 once the broker accepted (or is retrying) the write, 400 on
/// validation errors and 502 when the broker rejected it. Downstream
/// processing happens asynchronously.
#[tracing::instrument(skip(state, body))]
pub async fn submit(
    State(state): State<AppState>,
    body: Result<Json<SubmitOrderRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<SubmitReceipt>), ApiError> {
    let Json(request) = body.map_err(|e| ApiError::BadRequest(e.body_text()))?;
    let orders = state
        .orders
        .as_ref()
        .ok_or_else(|| ApiError::NotFound("order ingress is not enabled".to_string()))?;

    let receipt = orders.submit_order(request).await?;
    let status = match receipt.status {
        ReceiptStatus::Success => StatusCode::OK,
        ReceiptStatus::Error => StatusCode::BAD_GATEWAY,
    };
    Ok((status, Json(receipt)))
}

/// GET /order/{order_id}: returns the saga trail reconstructed so far.
#[tracing::instrument(skip(state))]
pub async fn saga(
    State(state): State<AppState>,
    Path(order_id): Path<String>,
) -> Result<Json<SagaTrail>, ApiError> {
    let tracker = state
        .tracker
        .as_ref()
        .ok_or_else(|| ApiError::NotFound("saga tracking is not enabled".to_string()))?;

    tracker
        .trail(&OrderId::new(order_id.clone()))
        .await
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("no events seen for order {order_id}")))
}
