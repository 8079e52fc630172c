use crate::error::AppError;
use crate::state::AppState;
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use topup_order::{OrderFilter, OrderPage, OrderView, ProfitSummary};
use uuid::Uuid;

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/v1/orders", post(create_order).get(list_orders))
        .route("/v1/orders/{id}", get(get_order))
        .route("/v1/reports/profit", get(profit_report))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateOrderRequest {
    pub package_id: String,
    pub quantity: u32,
    pub buyer_ref: String,
}

pub async fn create_order(
    State(state): State<AppState>,
    Json(req): Json<CreateOrderRequest>,
) -> Result<(StatusCode, Json<OrderView>), AppError> {
    if req.package_id.trim().is_empty() {
        return Err(AppError::bad_request("packageId is required"));
    }
    let order = state
        .orders
        .create_order(req.package_id.trim(), req.quantity, req.buyer_ref)
        .await?;
    Ok((StatusCode::CREATED, Json(order.view())))
}

pub async fn get_order(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<OrderView>, AppError> {
    let order = state.orders.get_order(id)?;
    Ok(Json(order.view()))
}

pub async fn list_orders(
    State(state): State<AppState>,
    Query(filter): Query<OrderFilter>,
) -> Result<Json<OrderPage>, AppError> {
    Ok(Json(state.orders.list_orders(&filter)?))
}

#[derive(Debug, Deserialize)]
pub struct ReportWindow {
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
}

pub async fn profit_report(
    State(state): State<AppState>,
    Query(window): Query<ReportWindow>,
) -> Json<ProfitSummary> {
    Json(state.orders.profit_report(window.from, window.to))
}
