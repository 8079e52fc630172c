use axum::{
    body::Body,
    http::{Request, StatusCode},
    Router,
};
use serde_json::{json, Value};
use std::sync::Arc;
use topup_api::{app, worker, AppState};
use topup_catalog::InMemoryCodeStore;
use topup_store::Config;
use tower::ServiceExt;

const CONFIG: &str = r#"
    [server]
    port = 0

    [tenant]
    id = "acme"
    local_currency = "try"

    [dispatch]
    provider_timeout_ms = 200
    balance_poll_seconds = 60

    [currencies]
    TRY = 34.0

    [[packages]]
    id = "pubg-60"
    name = "PUBG 60 UC"
    unit_sell_usd = 1.2
    unit_cost_usd = 0.9

    [[packages]]
    id = "freefire-100"
    name = "Free Fire 100"
    unit_sell_usd = 1.3
    unit_cost_usd = 1.0

    [[packages]]
    id = "steam-10"
    name = "Steam 10"
    unit_sell_usd = 10.5
    unit_cost_usd = 9.8

    [[providers]]
    id = "znet"
    behavior = "ACCEPT"
    balance = 250.0

    [[providers]]
    id = "down"
    behavior = "REJECT"

    [[code_groups]]
    id = "steam"
    name = "Steam Wallet"

    [[routing]]
    package_id = "pubg-60"
    mode = "external"
    primary_provider_id = "down"
    fallback_provider_id = "znet"

    [[routing]]
    package_id = "steam-10"
    mode = "internal_codes"
    code_group_id = "steam"
"#;

async fn test_state() -> AppState {
    let config = Config::from_toml(CONFIG).unwrap();
    AppState::build(&config, Arc::new(InMemoryCodeStore::new()))
        .await
        .unwrap()
}

async fn send(app: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let builder = Request::builder().method(method).uri(uri);
    let request = match body {
        Some(body) => builder
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    };
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), 1024 * 1024)
        .await
        .unwrap();
    let json = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, json)
}

async fn create(app: &Router, package_id: &str, quantity: u32) -> Value {
    let (status, body) = send(
        app,
        "POST",
        "/v1/orders",
        Some(json!({ "packageId": package_id, "quantity": quantity, "buyerRef": "player-1234" })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED, "{}", body);
    body
}

#[tokio::test]
async fn test_external_order_falls_back_and_settles() {
    let app = app(test_state().await);

    let order = create(&app, "pubg-60", 2).await;
    assert_eq!(order["status"], "PENDING");
    assert_eq!(order["dispatchState"], "FULFILLED");
    assert_eq!(order["providerId"], "znet");
    assert_eq!(order["rerouted"], true);
    assert_eq!(order["chainPath"].as_array().unwrap().len(), 2);
    assert_eq!(order["localCurrency"], "TRY");

    let settlement = &order["settlement"];
    let sell = settlement["sellUsd"].as_f64().unwrap();
    let cost = settlement["costUsd"].as_f64().unwrap();
    let profit = settlement["profitUsd"].as_f64().unwrap();
    assert!((profit - (sell - cost)).abs() < 1e-9);

    let id = order["id"].as_str().unwrap();
    let (status, fetched) = send(&app, "GET", &format!("/v1/orders/{}", id), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(fetched["id"], order["id"]);
}

#[tokio::test]
async fn test_create_order_validation() {
    let app = app(test_state().await);

    let (status, body) = send(
        &app,
        "POST",
        "/v1/orders",
        Some(json!({ "packageId": "nope", "quantity": 1, "buyerRef": "p" })),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert!(body["error"].is_string());

    let (status, _) = send(
        &app,
        "POST",
        "/v1/orders",
        Some(json!({ "packageId": "pubg-60", "quantity": 0, "buyerRef": "p" })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = send(
        &app,
        "GET",
        "/v1/orders/6f1c2a7e-9b1d-4c53-8a62-0d1e2f3a4b5c",
        None,
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_list_orders_pages_with_cursor() {
    let app = app(test_state().await);
    for _ in 0..3 {
        create(&app, "freefire-100", 1).await;
    }

    let (status, first) = send(&app, "GET", "/v1/orders?limit=2&mode=manual", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(first["items"].as_array().unwrap().len(), 2);
    let cursor = first["nextCursor"].as_str().unwrap().to_string();

    let (_, second) = send(
        &app,
        "GET",
        &format!("/v1/orders?limit=2&mode=manual&cursor={}", cursor),
        None,
    )
    .await;
    assert_eq!(second["items"].as_array().unwrap().len(), 1);
    assert!(second["nextCursor"].is_null());

    let (status, body) = send(&app, "GET", "/v1/orders?cursor=garbage", None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].as_str().unwrap().contains("cursor"));
}

#[tokio::test]
async fn test_bulk_approve_is_idempotent() {
    let app = app(test_state().await);
    let order = create(&app, "freefire-100", 1).await;
    let ids = json!({ "ids": [order["id"]], "note": "paid" });

    let (status, report) = send(&app, "POST", "/v1/admin/orders/bulk/approve", Some(ids.clone())).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(report["succeeded"], 1);
    assert_eq!(report["results"][0]["result"], "APPLIED");
    assert_eq!(report["results"][0]["changed"], true);

    let (_, again) = send(&app, "POST", "/v1/admin/orders/bulk/approve", Some(ids.clone())).await;
    assert_eq!(again["results"][0]["changed"], false);

    let (_, rejected) = send(&app, "POST", "/v1/admin/orders/bulk/reject", Some(ids)).await;
    assert_eq!(rejected["skipped"], 1);
    assert_eq!(rejected["results"][0]["kind"], "ALREADY_TERMINAL");

    let (_, pending) = send(&app, "GET", "/v1/admin/orders/pending-count", None).await;
    assert_eq!(pending["count"], 0);
}

#[tokio::test]
async fn test_bulk_dispatch_requires_known_provider() {
    let app = app(test_state().await);
    let order = create(&app, "freefire-100", 1).await;

    let (status, _) = send(
        &app,
        "POST",
        "/v1/admin/orders/bulk/dispatch",
        Some(json!({ "ids": [order["id"]] })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, body) = send(
        &app,
        "POST",
        "/v1/admin/orders/bulk/dispatch",
        Some(json!({ "ids": [order["id"]], "providerId": "ghost" })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["kind"], "INVALID_ROUTING");

    let (status, report) = send(
        &app,
        "POST",
        "/v1/admin/orders/bulk/dispatch",
        Some(json!({ "ids": [order["id"]], "providerId": "znet" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(report["succeeded"], 1);

    let (status, _) = send(
        &app,
        "POST",
        "/v1/admin/orders/bulk/teleport",
        Some(json!({ "ids": [order["id"]] })),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_routing_update_and_stats() {
    let app = app(test_state().await);

    let (status, body) = send(
        &app,
        "PUT",
        "/v1/admin/packages/freefire-100/routing",
        Some(json!({ "mode": "external", "primaryProviderId": "ghost" })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["kind"], "INVALID_ROUTING");

    let (status, body) = send(
        &app,
        "PUT",
        "/v1/admin/packages/freefire-100/routing",
        Some(json!({ "mode": "external", "primaryProviderId": "znet", "fallbackProviderId": "znet" })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["kind"], "INVALID_ROUTING");

    let (status, body) = send(
        &app,
        "PUT",
        "/v1/admin/packages/freefire-100/routing",
        Some(json!({ "mode": "external", "primaryProviderId": "znet" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["mode"], "external");

    let (_, view) = send(&app, "GET", "/v1/admin/packages/freefire-100/routing", None).await;
    assert_eq!(view["primaryProviderId"], "znet");

    let (_, stats) = send(&app, "GET", "/v1/admin/routing/stats", None).await;
    assert_eq!(stats["external"], 2);
    assert_eq!(stats["externalWithFallback"], 1);
    assert_eq!(stats["internalCodes"], 1);

    let (status, _) = send(&app, "GET", "/v1/admin/packages/nope/routing", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_code_import_and_issue() {
    let app = app(test_state().await);

    let (status, body) = send(
        &app,
        "POST",
        "/v1/admin/codes/groups/steam/items/bulk",
        Some(json!({ "codes": "AAA;111\n;;\nBBB;222;abc" })),
    )
    .await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(body["kind"], "MALFORMED_BULK_IMPORT_LINE");
    assert_eq!(body["rejectedLines"].as_array().unwrap().len(), 3);

    let (status, body) = send(
        &app,
        "POST",
        "/v1/admin/codes/groups/steam/items/bulk",
        Some(json!({ "codes": ["AAA;111", "BBB;222"], "cost": 9.5 })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["added"], 2);

    let order = create(&app, "steam-10", 1).await;
    assert_eq!(order["dispatchState"], "FULFILLED");
    assert_eq!(order["codes"].as_array().unwrap().len(), 1);

    let (_, listing) = send(&app, "GET", "/v1/admin/codes/groups/steam/items", None).await;
    assert_eq!(listing["stats"]["reserved"], 1);
    assert_eq!(listing["stats"]["available"], 1);

    let available = listing["items"]
        .as_array()
        .unwrap()
        .iter()
        .find(|c| c["status"] == "AVAILABLE")
        .unwrap();
    let uri = format!(
        "/v1/admin/codes/items/{}/disable",
        available["id"].as_str().unwrap()
    );
    let (status, disabled) = send(&app, "POST", &uri, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(disabled["status"], "DISABLED");

    let (status, body) = send(
        &app,
        "POST",
        "/v1/orders",
        Some(json!({ "packageId": "steam-10", "quantity": 1, "buyerRef": "p" })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["dispatchState"], "FAILED");
    assert_eq!(body["failure"]["kind"], "CODES_EXHAUSTED");
}

#[tokio::test]
async fn test_balances_and_event_stream() {
    let state = test_state().await;
    worker::poll_balances(&state.gateway, &state.balances).await;
    let app = app(state);

    let (status, balances) = send(&app, "GET", "/v1/admin/providers/balances", None).await;
    assert_eq!(status, StatusCode::OK);
    let balances = balances.as_array().unwrap();
    assert_eq!(balances.len(), 2);
    let znet = balances.iter().find(|b| b["providerId"] == "znet").unwrap();
    assert_eq!(znet["balance"]["amount"], 250.0);

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .uri("/v1/admin/events")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers()["content-type"].to_str().unwrap(),
        "text/event-stream"
    );
}

#[tokio::test]
async fn test_code_groups_gate_routing_and_issuing() {
    let app = app(test_state().await);

    let (status, body) = send(
        &app,
        "PUT",
        "/v1/admin/packages/freefire-100/routing",
        Some(json!({ "mode": "internal_codes", "codeGroupId": "ff-codes" })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["kind"], "INVALID_ROUTING");

    let (status, group) = send(
        &app,
        "POST",
        "/v1/admin/codes/groups",
        Some(json!({ "id": "ff-codes", "name": "Free Fire codes" })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(group["isActive"], true);

    let (status, _) = send(
        &app,
        "POST",
        "/v1/admin/codes/groups",
        Some(json!({ "id": "ff-codes", "name": "Again" })),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);

    let (status, _) = send(
        &app,
        "PUT",
        "/v1/admin/packages/freefire-100/routing",
        Some(json!({ "mode": "internal_codes", "codeGroupId": "ff-codes" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let (status, _) = send(
        &app,
        "POST",
        "/v1/admin/codes/groups/ff-codes/items/bulk",
        Some(json!({ "codes": "FF1;1" })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);

    let (status, toggled) = send(&app, "PATCH", "/v1/admin/codes/groups/ff-codes/toggle", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(toggled["isActive"], false);

    let order = create(&app, "freefire-100", 1).await;
    assert_eq!(order["dispatchState"], "FAILED");
    assert_eq!(order["failure"]["kind"], "CODES_EXHAUSTED");

    let (_, groups) = send(&app, "GET", "/v1/admin/codes/groups", None).await;
    let ids: Vec<&str> = groups
        .as_array()
        .unwrap()
        .iter()
        .map(|g| g["id"].as_str().unwrap())
        .collect();
    assert_eq!(ids, vec!["steam", "ff-codes"]);

    let (status, _) = send(&app, "PATCH", "/v1/admin/codes/groups/ghost/toggle", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    let (status, _) = send(&app, "GET", "/v1/admin/codes/groups/ghost/items", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}
