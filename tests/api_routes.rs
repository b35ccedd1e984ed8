use adminhub_server::build_app;
use adminhub_server::config::{Config, LlmModelConfig};
use adminhub_server::state::AppState;
use axum::body::{to_bytes, Body};
use axum::http::{Method, Request, StatusCode};
use axum::Router;
use serde_json::{json, Value};
use std::sync::Arc;
use tower::ServiceExt;

const API_KEY: &str = "test-admin-key";

fn test_app() -> Router {
    let db_path = std::env::temp_dir().join(format!(
        "adminhub_api_it_{}.db",
        uuid::Uuid::new_v4().simple()
    ));
    let mut config = Config::default();
    config.storage.db_path = db_path.to_string_lossy().to_string();
    config.security.api_key = Some(API_KEY.to_string());
    config.auth.demo_mode = false;
    config.plugins.builtin = vec!["math".to_string()];
    config.llm.default = "local".to_string();
    config.llm.models.insert(
        "local".to_string(),
        LlmModelConfig {
            mock_if_unconfigured: Some(true),
            ..Default::default()
        },
    );
    let state = AppState::new(config).unwrap();
    build_app(Arc::new(state))
}

fn request(method: Method, uri: &str, body: Option<Value>) -> axum::http::request::Builder {
    let builder = Request::builder()
        .method(method)
        .uri(uri)
        .header("x-user-oid", "oid-1")
        .header("x-tenant-id", "tenant-1")
        .header("x-user-name", "Ann");
    if body.is_some() {
        builder.header("content-type", "application/json")
    } else {
        builder
    }
}

async fn send(app: &Router, builder: axum::http::request::Builder, body: Option<Value>) -> (StatusCode, String) {
    let body = body
        .map(|value| Body::from(value.to_string()))
        .unwrap_or_else(Body::empty);
    let response = app
        .clone()
        .oneshot(builder.body(body).unwrap())
        .await
        .unwrap();
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    (status, String::from_utf8_lossy(&bytes).to_string())
}

async fn send_json(app: &Router, builder: axum::http::request::Builder, body: Option<Value>) -> (StatusCode, Value) {
    let (status, text) = send(app, builder, body).await;
    (status, serde_json::from_str(&text).unwrap_or(Value::Null))
}

#[tokio::test]
async fn health_and_identity_provisioning() {
    let app = test_app();
    let (status, body) = send_json(
        &app,
        Request::builder().uri("/health"),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({ "status": "ok" }));

    let (status, body) = send_json(&app, Request::builder().uri("/api/me"), None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["error"]["code"], json!("AUTH_REQUIRED"));

    let (status, body) = send_json(&app, request(Method::GET, "/api/me", None), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["oid"], json!("oid-1"));
    assert_eq!(body["tenant_id"], json!("tenant-1"));
    assert_eq!(body["display_name"], json!("Ann"));
}

#[tokio::test]
async fn admin_writes_require_api_key() {
    let app = test_app();
    let payload = json!({ "code": "FIN", "name": "Finance" });
    let (status, _) = send_json(
        &app,
        request(Method::POST, "/api/dm/domains", Some(payload.clone())),
        Some(payload.clone()),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, created) = send_json(
        &app,
        request(Method::POST, "/api/dm/domains", Some(payload.clone())).header("x-api-key", API_KEY),
        Some(payload.clone()),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(created["code"], json!("FIN"));

    let (status, body) = send_json(
        &app,
        request(Method::POST, "/api/dm/domains", Some(payload.clone())).header("x-api-key", API_KEY),
        Some(payload),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["detail"]["message"], json!("Domain code already exists"));

    // 读取接口不需要管理密钥。
    let (status, list) = send_json(&app, request(Method::GET, "/api/dm/domains", None), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(list.as_array().map(Vec::len), Some(1));

    let (status, _) = send_json(&app, request(Method::GET, "/api/dm/planets", None), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, logs) = send_json(
        &app,
        request(Method::GET, "/api/admin/audit-logs", None).header("x-api-key", API_KEY),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(logs["total"], json!(1));
    assert_eq!(logs["items"][0]["resource"], json!("domain"));
}

#[tokio::test]
async fn settings_resolve_uses_caller_identity() {
    let app = test_app();
    let create = json!({ "key": "theme", "payload": { "color": "blue" } });
    let (status, _) = send_json(
        &app,
        request(Method::POST, "/api/dm/settings", Some(create.clone())).header("x-api-key", API_KEY),
        Some(create),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let resolve = json!({ "key": "theme" });
    let (status, body) = send_json(
        &app,
        request(Method::POST, "/api/dm/settings/resolve", Some(resolve.clone())),
        Some(resolve),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["found"], json!(true));
    assert_eq!(body["resolved_payload"], json!({ "color": "blue" }));
    assert_eq!(body["resolved_from"], json!("Global"));
    assert_eq!(body["specificity"], json!(0));

    let missing = json!({ "key": "absent" });
    let (_, body) = send_json(
        &app,
        request(Method::POST, "/api/dm/settings/resolve", Some(missing.clone())),
        Some(missing),
    )
    .await;
    assert_eq!(body["found"], json!(false));
    assert_eq!(body["resolved_payload"], Value::Null);
}

#[tokio::test]
async fn chat_completion_streams_sse_and_tracks_sessions() {
    let app = test_app();
    let payload = json!({ "messages": [{ "role": "user", "content": "hello there" }] });
    let (status, text) = send(
        &app,
        request(Method::POST, "/api/ai/chat/completion", Some(payload.clone())),
        Some(payload),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let events = text
        .lines()
        .filter_map(|line| line.strip_prefix("data: "))
        .collect::<Vec<_>>();
    assert_eq!(events.last(), Some(&"[DONE]"));
    let content = events
        .iter()
        .filter(|event| **event != "[DONE]")
        .map(|event| serde_json::from_str::<Value>(event).unwrap())
        .map(|chunk| {
            assert_eq!(chunk["role"], json!("assistant"));
            chunk["content"].as_str().unwrap_or_default().to_string()
        })
        .collect::<String>();
    assert_eq!(content, "Echo: hello there");

    let buffered = json!({
        "messages": [{ "role": "user", "content": "again" }],
        "stream": false
    });
    let (status, body) = send_json(
        &app,
        request(Method::POST, "/api/ai/chat/completion", Some(buffered.clone())),
        Some(buffered),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({ "content": "Echo: again", "role": "assistant" }));

    let (_, metrics) = send_json(
        &app,
        request(Method::GET, "/api/dashboard/kernel/metrics", None),
        None,
    )
    .await;
    assert_eq!(metrics["total_kernels"], json!(1));
    assert_eq!(metrics["tenant_stats"]["tenant-1"]["count"], json!(1));

    let (status, _) = send_json(
        &app,
        request(Method::DELETE, "/api/dashboard/kernel/oid-1", None).header("x-api-key", API_KEY),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let (status, _) = send_json(
        &app,
        request(Method::DELETE, "/api/dashboard/kernel/oid-1", None).header("x-api-key", API_KEY),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn playground_sessions_round_trip() {
    let app = test_app();
    let create = json!({ "title": "Draft" });
    let (status, session) = send_json(
        &app,
        request(Method::POST, "/api/playground/sessions", Some(create.clone())),
        Some(create),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let session_id = session["id"].as_str().unwrap().to_string();
    let messages_uri = format!("/api/playground/sessions/{session_id}/messages");

    let mut ids = Vec::new();
    for (role, content) in [("user", "hello"), ("assistant", "hi there")] {
        let payload = json!({ "role": role, "content": content });
        let (status, message) = send_json(
            &app,
            request(Method::POST, &messages_uri, Some(payload.clone())),
            Some(payload),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        ids.push(message["id"].as_str().unwrap().to_string());
    }

    let edit = json!({ "role": "user", "content": "hello again" });
    let (status, edited) = send_json(
        &app,
        request(
            Method::PUT,
            &format!("{messages_uri}/{}/edit", ids[0]),
            Some(edit.clone()),
        ),
        Some(edit),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(edited["content"], json!("hello again"));
    let (_, listed) = send_json(&app, request(Method::GET, &messages_uri, None), None).await;
    assert_eq!(listed.as_array().map(Vec::len), Some(1));

    let (status, title) = send_json(
        &app,
        request(Method::PUT, &format!("/api/playground/sessions/{session_id}/title"), None),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert!(!title["title"].as_str().unwrap_or("").is_empty());

    // 其他用户看不到该会话。
    let (status, _) = send_json(
        &app,
        Request::builder()
            .method(Method::GET)
            .uri(&messages_uri)
            .header("x-user-oid", "oid-2")
            .header("x-tenant-id", "tenant-1"),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _) = send_json(
        &app,
        request(Method::DELETE, &format!("/api/playground/sessions/{session_id}"), None),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let (_, sessions) =
        send_json(&app, request(Method::GET, "/api/playground/sessions", None), None).await;
    assert_eq!(sessions, json!([]));
}

#[tokio::test]
async fn admin_manages_tenants_and_users() {
    let app = test_app();
    let (status, me) = send_json(&app, request(Method::GET, "/api/me", None), None).await;
    assert_eq!(status, StatusCode::OK);
    let user_id = me["id"].as_str().unwrap().to_string();

    let admin = |method: Method, uri: &str| {
        Request::builder()
            .method(method)
            .uri(uri.to_string())
            .header("x-api-key", API_KEY)
    };

    let (status, _) = send_json(&app, request(Method::GET, "/api/admin/tenants", None), None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, tenants) = send_json(&app, admin(Method::GET, "/api/admin/tenants"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(tenants[0]["tenant_id"], json!("tenant-1"));
    let (_, count) = send_json(&app, admin(Method::GET, "/api/admin/tenants/count"), None).await;
    assert_eq!(count, json!({ "count": 1 }));
    let (_, count) =
        send_json(&app, admin(Method::GET, "/api/admin/users/count?search=Ann"), None).await;
    assert_eq!(count, json!({ "count": 1 }));

    let (status, body) =
        send_json(&app, admin(Method::DELETE, "/api/admin/tenants/tenant-1"), None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["detail"]["message"]
        .as_str()
        .unwrap_or("")
        .contains("1 user(s)"));

    let (status, options) =
        send_json(&app, admin(Method::GET, "/api/admin/users/master-data-options"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(
        options,
        json!({ "organizations": [], "domains": [], "environments": [] })
    );

    let (status, _) = send_json(
        &app,
        admin(Method::DELETE, &format!("/api/admin/users/{user_id}")),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let (_, count) = send_json(&app, admin(Method::GET, "/api/admin/users/count"), None).await;
    assert_eq!(count, json!({ "count": 0 }));
    let (status, _) =
        send_json(&app, admin(Method::DELETE, "/api/admin/tenants/tenant-1"), None).await;
    assert_eq!(status, StatusCode::OK);
    let (_, tenants) = send_json(&app, admin(Method::GET, "/api/admin/tenants"), None).await;
    assert_eq!(tenants, json!([]));
}
