mod common;

use axum::http::StatusCode;
use common::{harness, harness_with, read_json};
use console::app::build_router;
use http_helpers::{action_request, get_request};
use serde_json::json;
use std::time::Duration;
use tower::ServiceExt;

#[tokio::test]
async fn health_reports_backend() {
    let h = harness().await;
    let response = build_router(h.state)
        .oneshot(get_request("/v1/system/health"))
        .await
        .expect("health");
    assert_eq!(response.status(), StatusCode::OK);
    let body = read_json(response).await;
    assert_eq!(body["status"], "ok");
    assert_eq!(body["backend"], "memory");
    assert_eq!(body["durable"], false);
}

#[tokio::test]
async fn openapi_document_is_served() {
    let h = harness().await;
    let response = build_router(h.state)
        .oneshot(get_request("/v1/openapi.json"))
        .await
        .expect("openapi");
    assert_eq!(response.status(), StatusCode::OK);
    let body = read_json(response).await;
    assert!(body["paths"]["/v1/actions/{resource}/{operation}"].is_object());
}

#[tokio::test]
async fn namespace_create_list_and_update_over_http() {
    let h = harness().await;
    let app = build_router(h.state.clone());

    let response = app
        .clone()
        .oneshot(action_request(
            Some("admin1"),
            "namespaces",
            "create",
            json!({"name": "team-a", "members": ["u1"], "metadata": {"labels": {"tier": "dev"}}}),
        ))
        .await
        .expect("create");
    assert_eq!(response.status(), StatusCode::OK);
    let created = read_json(response).await;
    assert_eq!(created["name"], "team-a");
    assert_eq!(created["members"], json!(["admin1", "u1"]));
    let id = created["id"].as_str().expect("id").to_string();

    // u1 is a member; u2 is not.
    let response = app
        .clone()
        .oneshot(action_request(Some("u1"), "namespaces", "retrieve", json!({})))
        .await
        .expect("retrieve");
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(read_json(response).await["items"].as_array().map(Vec::len), Some(1));
    let response = app
        .clone()
        .oneshot(action_request(Some("u2"), "namespaces", "retrieve", json!({})))
        .await
        .expect("retrieve");
    assert_eq!(read_json(response).await["items"], json!([]));

    let response = app
        .clone()
        .oneshot(action_request(
            Some("admin1"),
            "namespaces",
            "update",
            json!({"id": id, "members": ["u2"]}),
        ))
        .await
        .expect("update");
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(read_json(response).await["members"], json!(["admin1", "u2"]));
}

#[tokio::test]
async fn caller_header_is_required_and_resolved() {
    let h = harness().await;
    let app = build_router(h.state);

    let response = app
        .clone()
        .oneshot(action_request(None, "notifications", "retrieve", json!({})))
        .await
        .expect("no header");
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(read_json(response).await["code"], "unauthorized");

    let response = app
        .oneshot(action_request(Some("ghost"), "notifications", "retrieve", json!({})))
        .await
        .expect("unknown user");
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn error_kinds_map_to_status_codes() {
    let h = harness_with(|fake| fake.silent = true, Duration::from_millis(200)).await;
    let app = build_router(h.state);

    let cases = [
        (Some("u1"), "namespaces", "create", json!({"name": "team-a"}), StatusCode::FORBIDDEN),
        (Some("admin1"), "namespaces", "create", json!({}), StatusCode::BAD_REQUEST),
        (Some("admin1"), "widgets", "retrieve", json!({}), StatusCode::NOT_FOUND),
        (Some("admin1"), "logs", "delete", json!({}), StatusCode::METHOD_NOT_ALLOWED),
        (Some("admin1"), "logs", "explode", json!({}), StatusCode::METHOD_NOT_ALLOWED),
        (
            Some("u1"),
            "notifications",
            "update",
            json!({"id": "missing", "unread": false}),
            StatusCode::NOT_FOUND,
        ),
        (
            Some("admin1"),
            "namespaces",
            "create",
            json!({"name": "team-b"}),
            StatusCode::GATEWAY_TIMEOUT,
        ),
    ];
    for (user, resource, operation, body, status) in cases {
        let response = app
            .clone()
            .oneshot(action_request(user, resource, operation, body))
            .await
            .expect("request");
        assert_eq!(response.status(), status, "{resource}/{operation}");
    }
}

#[tokio::test]
async fn invalid_json_body_is_rejected_with_request_id() {
    let h = harness().await;
    let request = axum::http::Request::builder()
        .method("POST")
        .uri("/v1/actions/notifications/retrieve")
        .header("x-console-user", "u1")
        .header("x-request-id", "req-42")
        .body(axum::body::Body::from("{not json"))
        .expect("request");
    let response = build_router(h.state).oneshot(request).await.expect("request");
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = read_json(response).await;
    assert_eq!(body["code"], "validation_error");
    assert_eq!(body["request_id"], "req-42");
}

#[tokio::test]
async fn logs_are_forwarded_to_the_orchestrator() {
    let h = harness().await;
    let response = build_router(h.state)
        .oneshot(action_request(
            Some("u1"),
            "logs",
            "retrieve",
            json!({"namespace": "team-a", "name": "web-0", "tailLines": 50}),
        ))
        .await
        .expect("logs");
    assert_eq!(response.status(), StatusCode::OK);
    let body = read_json(response).await;
    assert_eq!(body["log"], "log of team-a/web-0\n");
    let requests = h.orchestrator.logs.lock().expect("lock").clone();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].tail_lines, Some(50));
}
