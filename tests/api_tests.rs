use chat_relay::config::{Config, DEFAULT_SYSTEM_PROMPT, Provider};
use chat_relay::message::{ChatResponse, ErrorResponse};
use chat_relay::routes::create_router;
use chat_relay::services::completions::{
    ChatMessage, CompletionRequest, CompletionsClient, Upstream, http_client,
};
use chat_relay::services::credential::{AccessToken, CredentialError, TokenCredential};
use chat_relay::services::page::IndexPage;
use chat_relay::state::AppState;

use async_trait::async_trait;
use axum::body::Body;
use axum::extract::{Query, State};
use axum::http::{HeaderMap, Request, StatusCode, Uri, header};
use axum::routing::post;
use axum::{Json, Router};
use http_body_util::BodyExt;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};
use tower::util::ServiceExt;
use tracing_test::traced_test;

const PAGE: &str = "<!DOCTYPE html><html><body>chat</body></html>";

struct FixedToken(&'static str);

#[async_trait]
impl TokenCredential for FixedToken {
    async fn get_token(&self, _scope: &str) -> Result<AccessToken, CredentialError> {
        Ok(AccessToken::new(
            self.0,
            SystemTime::now() + Duration::from_secs(3600),
        ))
    }
}

struct NoIdentity;

#[async_trait]
impl TokenCredential for NoIdentity {
    async fn get_token(&self, _scope: &str) -> Result<AccessToken, CredentialError> {
        Err(CredentialError::Unavailable {
            source_name: "managed identity",
            reason: "no identity endpoint".to_string(),
        })
    }
}

#[derive(Debug, Clone)]
struct Captured {
    path: String,
    authorization: Option<String>,
    api_version: Option<String>,
    request: CompletionRequest,
}

#[derive(Clone)]
struct MockUpstream {
    status: StatusCode,
    body: Value,
    seen: Arc<Mutex<Vec<Captured>>>,
}

impl MockUpstream {
    fn captured(&self) -> Vec<Captured> {
        self.seen.lock().unwrap().clone()
    }
}

async fn mock_completions(
    State(mock): State<MockUpstream>,
    uri: Uri,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
    Json(request): Json<CompletionRequest>,
) -> (StatusCode, Json<Value>) {
    mock.seen.lock().unwrap().push(Captured {
        path: uri.path().to_string(),
        authorization: headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string),
        api_version: query.get("api-version").cloned(),
        request,
    });
    (mock.status, Json(mock.body.clone()))
}

async fn spawn_upstream(status: StatusCode, body: Value) -> (String, MockUpstream) {
    let mock = MockUpstream {
        status,
        body,
        seen: Arc::new(Mutex::new(Vec::new())),
    };
    let app = Router::new()
        .route(
            "/openai/deployments/{deployment}/chat/completions",
            post(mock_completions),
        )
        .route("/v1/chat/completions", post(mock_completions))
        .with_state(mock.clone());

    let listener = tokio::net::TcpListener::bind(("127.0.0.1", 0))
        .await
        .unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    (format!("http://{}", addr), mock)
}

fn reply_body(content: &str) -> Value {
    json!({
        "id": "chatcmpl-test",
        "choices": [
            {"index": 0, "message": {"role": "assistant", "content": content}}
        ]
    })
}

fn build_app(upstream: Upstream) -> Router {
    let client = CompletionsClient::new(
        http_client(Duration::from_secs(5)).unwrap(),
        upstream,
        DEFAULT_SYSTEM_PROMPT,
    );
    let state = Arc::new(AppState::new(client, IndexPage::from_html(PAGE)));
    create_router().with_state(state)
}

fn azure_app(endpoint: Option<&str>, credential: Arc<dyn TokenCredential>) -> Router {
    let cfg = Config {
        azure_endpoint: endpoint.map(str::to_string),
        azure_deployment: Some("gpt-test".to_string()),
        ..Config::default()
    };
    build_app(Upstream::azure(&cfg, credential))
}

fn openai_app(base_url: &str, api_key: Option<&str>) -> Router {
    let cfg = Config {
        provider: Provider::OpenAi,
        openai_chat_url: format!("{base_url}/v1/chat/completions"),
        openai_api_key: api_key.map(str::to_string),
        ..Config::default()
    };
    build_app(Upstream::openai(&cfg))
}

fn chat_request(body: &str) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri("/api/chat")
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn get_request(uri: &str) -> Request<Body> {
    Request::builder()
        .method("GET")
        .uri(uri)
        .body(Body::empty())
        .unwrap()
}

async fn read_body(response: axum::response::Response) -> Vec<u8> {
    response
        .into_body()
        .collect()
        .await
        .unwrap()
        .to_bytes()
        .to_vec()
}

async fn read_json<T: DeserializeOwned>(response: axum::response::Response) -> T {
    serde_json::from_slice(&read_body(response).await).unwrap()
}

#[tokio::test]
async fn test_chat_returns_first_choice_content() {
    let (base_url, mock) = spawn_upstream(StatusCode::OK, reply_body("Hello there!")).await;
    let app = azure_app(Some(&base_url), Arc::new(FixedToken("test-token")));

    let response = app
        .oneshot(chat_request(r#"{"message": "hi"}"#))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let chat_resp: ChatResponse = read_json(response).await;
    assert_eq!(chat_resp.reply, "Hello there!");

    let captured = mock.captured();
    assert_eq!(captured.len(), 1);
    let call = &captured[0];
    assert_eq!(call.path, "/openai/deployments/gpt-test/chat/completions");
    assert_eq!(call.api_version.as_deref(), Some("2024-02-15-preview"));
    assert_eq!(call.authorization.as_deref(), Some("Bearer test-token"));
    assert_eq!(call.request.model, None);
    assert_eq!(
        call.request.messages,
        vec![
            ChatMessage::system("You are a helpful assistant."),
            ChatMessage::user("hi"),
        ]
    );
}

#[tokio::test]
async fn test_empty_message_is_rejected() {
    let (base_url, mock) = spawn_upstream(StatusCode::OK, reply_body("unused")).await;
    let app = azure_app(Some(&base_url), Arc::new(FixedToken("test-token")));

    let response = app
        .oneshot(chat_request(r#"{"message": ""}"#))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(read_body(response).await, br#"{"error":"Message is required"}"#);
    assert!(mock.captured().is_empty());
}

#[tokio::test]
async fn test_missing_message_is_rejected() {
    let (base_url, mock) = spawn_upstream(StatusCode::OK, reply_body("unused")).await;
    let app = azure_app(Some(&base_url), Arc::new(FixedToken("test-token")));

    for body in [r#"{}"#, r#"{"message": null}"#, r#"{"message": "   "}"#] {
        let response = app.clone().oneshot(chat_request(body)).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST, "body: {body}");
        let err: ErrorResponse = read_json(response).await;
        assert_eq!(err.error, "Message is required");
    }
    assert!(mock.captured().is_empty());
}

#[tokio::test]
async fn test_unparseable_body_is_rejected() {
    let app = azure_app(Some("http://127.0.0.1:1"), Arc::new(FixedToken("test-token")));

    let response = app.oneshot(chat_request("not json")).await.unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let err: ErrorResponse = read_json(response).await;
    assert_eq!(err.error, "Invalid JSON body");
}

#[tokio::test]
#[traced_test]
async fn test_upstream_unauthorized_is_hidden_from_caller() {
    let (base_url, _mock) = spawn_upstream(
        StatusCode::UNAUTHORIZED,
        json!({"error": {"code": "401", "message": "Access denied due to invalid subscription key"}}),
    )
    .await;
    let app = azure_app(Some(&base_url), Arc::new(FixedToken("test-token")));

    let response = app
        .oneshot(chat_request(r#"{"message": "hi"}"#))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    let body = read_body(response).await;
    assert_eq!(body, br#"{"error":"Internal error"}"#);
    assert!(!String::from_utf8_lossy(&body).contains("Access denied"));

    assert!(logs_contain("401 Unauthorized"));
    assert!(logs_contain("Access denied"));
}

#[tokio::test]
async fn test_unexpected_response_shape_is_internal_error() {
    let (base_url, _mock) = spawn_upstream(StatusCode::OK, json!({"object": "chat.completion"})).await;
    let app = azure_app(Some(&base_url), Arc::new(FixedToken("test-token")));

    let response = app
        .oneshot(chat_request(r#"{"message": "hi"}"#))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    let err: ErrorResponse = read_json(response).await;
    assert_eq!(err.error, "Internal error");
}

#[tokio::test]
async fn test_unreachable_upstream_is_internal_error() {
    let app = azure_app(Some("http://127.0.0.1:1"), Arc::new(FixedToken("test-token")));

    let response = app
        .oneshot(chat_request(r#"{"message": "hi"}"#))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    let err: ErrorResponse = read_json(response).await;
    assert_eq!(err.error, "Internal error");
}

#[tokio::test]
async fn test_missing_endpoint_is_internal_error() {
    let app = azure_app(None, Arc::new(FixedToken("test-token")));

    let response = app
        .oneshot(chat_request(r#"{"message": "hi"}"#))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    let err: ErrorResponse = read_json(response).await;
    assert_eq!(err.error, "Internal error");
}

#[tokio::test]
#[traced_test]
async fn test_credential_failure_is_internal_error() {
    let (base_url, mock) = spawn_upstream(StatusCode::OK, reply_body("unused")).await;
    let app = azure_app(Some(&base_url), Arc::new(NoIdentity));

    let response = app
        .oneshot(chat_request(r#"{"message": "hi"}"#))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    let err: ErrorResponse = read_json(response).await;
    assert_eq!(err.error, "Internal error");
    assert!(mock.captured().is_empty());
    assert!(logs_contain("could not acquire access token"));
}

#[tokio::test]
async fn test_openai_provider_sends_key_and_model() {
    let (base_url, mock) = spawn_upstream(StatusCode::OK, reply_body("from openai")).await;
    let app = openai_app(&base_url, Some("sk-test"));

    let response = app
        .oneshot(chat_request(r#"{"message": "hi"}"#))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let chat_resp: ChatResponse = read_json(response).await;
    assert_eq!(chat_resp.reply, "from openai");

    let captured = mock.captured();
    assert_eq!(captured.len(), 1);
    assert_eq!(captured[0].path, "/v1/chat/completions");
    assert_eq!(captured[0].authorization.as_deref(), Some("Bearer sk-test"));
    assert_eq!(captured[0].request.model.as_deref(), Some("gpt-3.5-turbo"));
    assert_eq!(captured[0].request.messages.len(), 2);
}

#[tokio::test]
async fn test_openai_provider_without_key_is_internal_error() {
    let (base_url, mock) = spawn_upstream(StatusCode::OK, reply_body("unused")).await;
    let app = openai_app(&base_url, None);

    let response = app
        .oneshot(chat_request(r#"{"message": "hi"}"#))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    assert!(mock.captured().is_empty());
}

#[tokio::test]
async fn test_health_ignores_upstream() {
    let app = azure_app(Some("http://127.0.0.1:1"), Arc::new(NoIdentity));

    let response = app.oneshot(get_request("/health")).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(read_body(response).await, br#"{"status":"ok"}"#);
}

#[tokio::test]
async fn test_index_serves_html_without_configuration() {
    let app = azure_app(None, Arc::new(NoIdentity));

    let response = app.oneshot(get_request("/")).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let content_type = response
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string();
    assert!(content_type.starts_with("text/html"), "got {content_type}");
    assert_eq!(read_body(response).await, PAGE.as_bytes());
}

#[tokio::test]
async fn test_unknown_route_returns_json_404() {
    let app = azure_app(None, Arc::new(NoIdentity));

    let response = app.oneshot(get_request("/nope")).await.unwrap();

    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    let err: ErrorResponse = read_json(response).await;
    assert_eq!(err.error, "Not found");
}
