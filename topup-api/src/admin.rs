use crate::error::AppError;
use crate::state::AppState;
use crate::stream;
use crate::worker::BalanceReading;
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    routing::{get, patch, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use topup_catalog::{
    Code, CodeError, CodeGroup, GroupStats, ProviderType, RoutingPlan, RoutingPolicyView, RoutingStats,
};
use topup_core::ErrorKind;
use topup_order::{BulkAction, BulkReport};
use uuid::Uuid;

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/v1/admin/orders/bulk/{action}", post(bulk_orders))
        .route("/v1/admin/orders/pending-count", get(pending_count))
        .route(
            "/v1/admin/packages/{id}/routing",
            get(get_routing).put(set_routing),
        )
        .route("/v1/admin/routing/stats", get(routing_stats))
        .route("/v1/admin/codes/groups", get(list_groups).post(create_group))
        .route("/v1/admin/codes/groups/{id}/toggle", patch(toggle_group))
        .route("/v1/admin/codes/groups/{id}/items", get(list_codes))
        .route("/v1/admin/codes/groups/{id}/items/bulk", post(add_codes))
        .route("/v1/admin/codes/items/{id}/disable", post(disable_code))
        .route("/v1/admin/providers/balances", get(provider_balances))
        .route("/v1/admin/events", get(stream::order_events))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BulkRequest {
    pub ids: Vec<Uuid>,
    pub note: Option<String>,
    pub provider_id: Option<String>,
}

/// `action` is one of approve, reject, manual or dispatch.
pub async fn bulk_orders(
    State(state): State<AppState>,
    Path(action): Path<String>,
    Json(req): Json<BulkRequest>,
) -> Result<Json<BulkReport>, AppError> {
    let action = match action.as_str() {
        "approve" => BulkAction::Approve,
        "reject" => BulkAction::Reject,
        "manual" => BulkAction::SetManual,
        "dispatch" => {
            let provider_id = req
                .provider_id
                .as_deref()
                .map(str::trim)
                .filter(|p| !p.is_empty())
                .ok_or_else(|| AppError::bad_request("providerId is required for dispatch"))?;
            if !state.gateway.contains(provider_id).await {
                return Err(AppError::ValidationError(
                    format!("Unknown provider: {}", provider_id),
                    Some(ErrorKind::InvalidRouting),
                ));
            }
            BulkAction::Dispatch {
                provider_id: provider_id.to_string(),
            }
        }
        other => return Err(AppError::NotFoundError(format!("Unknown bulk action: {}", other))),
    };
    if req.ids.is_empty() {
        return Err(AppError::bad_request("ids must not be empty"));
    }

    tracing::info!("Bulk {:?} over {} orders", action, req.ids.len());
    Ok(Json(state.bulk.run(&action, &req.ids, req.note).await))
}

pub async fn get_routing(
    State(state): State<AppState>,
    Path(package_id): Path<String>,
) -> Result<Json<RoutingPolicyView>, AppError> {
    state.catalog.get(&package_id)?;
    Ok(Json(state.routing.view(&package_id)))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoutingUpdate {
    pub mode: ProviderType,
    pub primary_provider_id: Option<String>,
    pub fallback_provider_id: Option<String>,
    pub code_group_id: Option<String>,
}

pub async fn set_routing(
    State(state): State<AppState>,
    Path(package_id): Path<String>,
    Json(update): Json<RoutingUpdate>,
) -> Result<Json<RoutingPolicyView>, AppError> {
    state.catalog.get(&package_id)?;

    let plan = RoutingPolicyView {
        package_id: package_id.clone(),
        mode: update.mode,
        primary_provider_id: update.primary_provider_id,
        fallback_provider_id: update.fallback_provider_id,
        code_group_id: update.code_group_id,
    }
    .into_plan()?;

    match &plan {
        RoutingPlan::External { primary, fallback } => {
            for provider in std::iter::once(primary).chain(fallback.as_ref()) {
                if !state.gateway.contains(provider).await {
                    return Err(AppError::ValidationError(
                        format!("Unknown provider: {}", provider),
                        Some(ErrorKind::InvalidRouting),
                    ));
                }
            }
        }
        RoutingPlan::InternalCodes { code_group_id } => {
            match state.codes.group(code_group_id).await {
                Ok(_) => {}
                Err(CodeError::GroupNotFound(_)) => {
                    return Err(AppError::ValidationError(
                        format!("Unknown code group: {}", code_group_id),
                        Some(ErrorKind::InvalidRouting),
                    ))
                }
                Err(e) => return Err(e.into()),
            }
        }
        RoutingPlan::Manual => {}
    }

    let plan = state.routing.apply(&package_id, plan)?;
    tracing::info!("Routing for {} set to {}", package_id, plan.provider_type().as_str());
    Ok(Json(RoutingPolicyView::from_plan(&package_id, &plan)))
}

pub async fn routing_stats(State(state): State<AppState>) -> Json<RoutingStats> {
    Json(state.routing.stats())
}

pub async fn list_groups(State(state): State<AppState>) -> Result<Json<Vec<CodeGroup>>, AppError> {
    Ok(Json(state.codes.list_groups().await?))
}

#[derive(Debug, Deserialize)]
pub struct CreateGroupRequest {
    pub id: Option<String>,
    pub name: String,
}

/// The id defaults to a fresh UUID when omitted.
pub async fn create_group(
    State(state): State<AppState>,
    Json(req): Json<CreateGroupRequest>,
) -> Result<(StatusCode, Json<CodeGroup>), AppError> {
    if req.name.trim().is_empty() {
        return Err(AppError::bad_request("name is required"));
    }
    let id = req.id.unwrap_or_else(|| Uuid::new_v4().to_string());
    let group = state.codes.create_group(&id, &req.name).await?;
    Ok((StatusCode::CREATED, Json(group)))
}

pub async fn toggle_group(
    State(state): State<AppState>,
    Path(group_id): Path<String>,
) -> Result<Json<CodeGroup>, AppError> {
    Ok(Json(state.codes.toggle_group(&group_id).await?))
}

/// Import payload: either one text blob or one entry per line.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum CodeLines {
    Text(String),
    Lines(Vec<String>),
}

impl CodeLines {
    fn into_text(self) -> String {
        match self {
            CodeLines::Text(text) => text,
            CodeLines::Lines(lines) => lines.join("\n"),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct AddCodesRequest {
    pub codes: CodeLines,
    pub cost: Option<f64>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AddCodesResponse {
    pub added: usize,
    pub rejected_lines: Vec<usize>,
}

pub async fn add_codes(
    State(state): State<AppState>,
    Path(group_id): Path<String>,
    Json(req): Json<AddCodesRequest>,
) -> Result<(StatusCode, Json<AddCodesResponse>), AppError> {
    let created = state
        .codes
        .add_codes(&group_id, &req.codes.into_text(), req.cost)
        .await?;
    Ok((
        StatusCode::CREATED,
        Json(AddCodesResponse {
            added: created.len(),
            rejected_lines: Vec::new(),
        }),
    ))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CodeGroupListing {
    pub items: Vec<Code>,
    pub stats: GroupStats,
}

pub async fn list_codes(
    State(state): State<AppState>,
    Path(group_id): Path<String>,
) -> Result<Json<CodeGroupListing>, AppError> {
    state.codes.group(&group_id).await?;
    let items = state.codes.list_group(&group_id).await?;
    let stats = state.codes.group_stats(&group_id).await?;
    Ok(Json(CodeGroupListing { items, stats }))
}

pub async fn disable_code(
    State(state): State<AppState>,
    Path(code_id): Path<Uuid>,
) -> Result<Json<Code>, AppError> {
    Ok(Json(state.codes.disable(code_id).await?))
}

#[derive(Debug, Deserialize)]
pub struct PendingQuery {
    pub kind: Option<ProviderType>,
}

#[derive(Debug, Serialize)]
pub struct PendingCount {
    pub count: usize,
    pub kind: Option<ProviderType>,
}

pub async fn pending_count(
    State(state): State<AppState>,
    Query(query): Query<PendingQuery>,
) -> Json<PendingCount> {
    Json(PendingCount {
        count: state.orders.count_pending(query.kind),
        kind: query.kind,
    })
}

pub async fn provider_balances(State(state): State<AppState>) -> Json<Vec<BalanceReading>> {
    Json(state.balances.snapshot())
}
