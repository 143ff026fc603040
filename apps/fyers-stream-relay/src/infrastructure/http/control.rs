//! Control-Plane Routes
//!
//! Request/response operations that produce the upstream bearer token.
//!
//! - `GET /api/auth/url?state=` returns `{url}` for the redirect flow
//! - `POST /api/auth/token` with `{auth_code}` returns `{access_token}`
//! - `POST /api/auth/login` with `{accountId, pin, totpSeed}` returns
//!   `{access_token}`
//!
//! Every issued token is also handed to the relay, which uses it for
//! consumers that subscribe without one. Failures come back as
//! `{error, details?, stage?}`.

use std::sync::Arc;

use axum::extract::rejection::JsonRejection;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};

use crate::application::services::RelayHandle;
use crate::domain::credentials::BearerToken;
use crate::infrastructure::fyers::{AuthError, AuthStage, CredentialExchange};
use crate::infrastructure::metrics::{self, AuthFlow};

// =============================================================================
// Payloads
// =============================================================================

/// Query for the login URL.
#[derive(Debug, Default, Deserialize)]
pub struct AuthUrlQuery {
    /// Opaque value echoed back by the provider redirect.
    #[serde(default)]
    pub state: Option<String>,
}

/// Login URL response.
#[derive(Debug, Serialize, Deserialize)]
pub struct AuthUrlResponse {
    /// Provider login page.
    pub url: String,
}

/// Authorization code exchange request.
#[derive(Debug, Deserialize)]
pub struct TokenRequest {
    /// One-time code from the provider redirect.
    pub auth_code: String,
}

/// Direct login request.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoginRequest {
    /// Provider account id.
    pub account_id: String,
    /// Account PIN.
    pub pin: String,
    /// Base32 TOTP seed.
    pub totp_seed: String,
}

/// Issued token.
#[derive(Debug, Serialize, Deserialize)]
pub struct TokenResponse {
    /// Bearer token for the data socket.
    pub access_token: String,
}

/// Error body.
#[derive(Debug, Serialize)]
pub struct ErrorBody {
    /// Short description.
    pub error: String,
    /// Provider or validation detail.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
    /// Login stage that failed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stage: Option<AuthStage>,
}

// =============================================================================
// Errors
// =============================================================================

/// Control-plane failure rendered as a JSON error response.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    body: ErrorBody,
}

impl ApiError {
    fn invalid(details: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            body: ErrorBody {
                error: "Invalid request".to_string(),
                details: Some(details.into()),
                stage: None,
            },
        }
    }
}

impl From<AuthError> for ApiError {
    fn from(error: AuthError) -> Self {
        let (status, summary) = match error.stage {
            AuthStage::Otp | AuthStage::Totp | AuthStage::Pin => {
                (StatusCode::UNAUTHORIZED, "Authentication failed")
            }
            AuthStage::Token => (StatusCode::BAD_GATEWAY, "Token exchange failed"),
        };
        Self {
            status,
            body: ErrorBody {
                error: summary.to_string(),
                details: Some(error.message),
                stage: Some(error.stage),
            },
        }
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        Self::invalid(rejection.body_text())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(self.body)).into_response()
    }
}

// =============================================================================
// Routes
// =============================================================================

/// State for the control-plane routes.
pub struct ControlState {
    exchange: Arc<CredentialExchange>,
    relay: RelayHandle,
}

impl ControlState {
    /// Create control-plane state.
    #[must_use]
    pub const fn new(exchange: Arc<CredentialExchange>, relay: RelayHandle) -> Self {
        Self { exchange, relay }
    }
}

/// The `/api/auth/*` routes.
pub fn routes(state: Arc<ControlState>) -> Router {
    Router::new()
        .route("/api/auth/url", get(auth_url_handler))
        .route("/api/auth/token", post(token_handler))
        .route("/api/auth/login", post(login_handler))
        .with_state(state)
}

async fn auth_url_handler(
    State(state): State<Arc<ControlState>>,
    Query(query): Query<AuthUrlQuery>,
) -> Json<AuthUrlResponse> {
    let url = state.exchange.login_url(query.state.as_deref().unwrap_or_default());
    Json(AuthUrlResponse { url })
}

async fn token_handler(
    State(state): State<Arc<ControlState>>,
    payload: Result<Json<TokenRequest>, JsonRejection>,
) -> Result<Json<TokenResponse>, ApiError> {
    let Json(request) = payload?;
    let auth_code = request.auth_code.trim();
    if auth_code.is_empty() {
        return Err(ApiError::invalid("auth_code must not be empty"));
    }

    let result = state.exchange.exchange_code(auth_code).await;
    issue(&state, AuthFlow::Code, result).await
}

async fn login_handler(
    State(state): State<Arc<ControlState>>,
    payload: Result<Json<LoginRequest>, JsonRejection>,
) -> Result<Json<TokenResponse>, ApiError> {
    let Json(request) = payload?;
    let missing: Vec<&str> = [
        ("accountId", &request.account_id),
        ("pin", &request.pin),
        ("totpSeed", &request.totp_seed),
    ]
    .into_iter()
    .filter(|(_, value)| value.trim().is_empty())
    .map(|(name, _)| name)
    .collect();
    if !missing.is_empty() {
        return Err(ApiError::invalid(format!(
            "missing required fields: {}",
            missing.join(", ")
        )));
    }

    let result = state
        .exchange
        .login(request.account_id.trim(), &request.pin, &request.totp_seed)
        .await;
    issue(&state, AuthFlow::Direct, result).await
}

async fn issue(
    state: &ControlState,
    flow: AuthFlow,
    result: Result<BearerToken, AuthError>,
) -> Result<Json<TokenResponse>, ApiError> {
    let token = match result {
        Ok(token) => token,
        Err(error) => {
            tracing::warn!(stage = %error.stage, error = %error, "Credential exchange failed");
            metrics::record_auth_attempt(flow, "failed");
            return Err(error.into());
        }
    };
    metrics::record_auth_attempt(flow, "issued");

    if state.relay.issue_token(token.clone()).await.is_err() {
        tracing::warn!("Relay is not running, token not retained");
    }
    Ok(Json(TokenResponse {
        access_token: token.expose().to_string(),
    }))
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use axum::body::{Body, to_bytes};
    use axum::http::Request;
    use serde_json::{Value, json};
    use tokio::sync::mpsc;
    use tower::ServiceExt;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;
    use crate::application::ports::testing::FakeConnector;
    use crate::application::services::{
        Relay, RelayOptions, RelayStatus, UntaggedTickPolicy, UpstreamEndpoint, UpstreamState,
    };
    use crate::domain::streaming::ConsumerCommand;
    use crate::infrastructure::config::{AppCredentials, AuthSettings};

    // RFC 6238 test seed
    const SEED: &str = "GEZDGNBVGY3TQOJQGEZDGNBVGY3TQOJQ";

    struct Fixture {
        app: Router,
        relay: RelayHandle,
        status: Arc<RelayStatus>,
        links: mpsc::UnboundedReceiver<crate::application::ports::testing::FakeLink>,
        server: MockServer,
    }

    async fn fixture() -> Fixture {
        let server = MockServer::start().await;
        let settings = AuthSettings {
            login_base_url: format!("{}/vagator/v2", server.uri()),
            api_base_url: format!("{}/api/v3", server.uri()),
            ..AuthSettings::default()
        };
        let credentials =
            AppCredentials::new("APP-100", "secret", "https://example.com/cb").unwrap();
        let exchange = Arc::new(CredentialExchange::new(credentials, &settings).unwrap());

        let (connector, links) = FakeConnector::new();
        let status = Arc::new(RelayStatus::new());
        let (relay, handle) = Relay::new(
            connector,
            RelayOptions {
                endpoint: UpstreamEndpoint {
                    socket_url: "wss://socket.example/data".to_string(),
                    app_id: "APP-100".to_string(),
                },
                connect_timeout: std::time::Duration::from_secs(1),
                command_buffer: 16,
                upstream_event_buffer: 16,
                untagged_ticks: UntaggedTickPolicy::Broadcast,
            },
            Arc::clone(&status),
        );
        tokio::spawn(relay.run(tokio_util::sync::CancellationToken::new()));

        Fixture {
            app: routes(Arc::new(ControlState::new(exchange, handle.clone()))),
            relay: handle,
            status,
            links,
            server,
        }
    }

    async fn mount_ok(server: &MockServer, route: &str, body: Value) {
        Mock::given(method("POST"))
            .and(path(route))
            .respond_with(ResponseTemplate::new(200).set_body_json(body))
            .mount(server)
            .await;
    }

    async fn call(app: &Router, request: Request<Body>) -> (StatusCode, Value) {
        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    fn post_json(uri: &str, body: &Value) -> Request<Body> {
        Request::post(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn login_body() -> Value {
        json!({"accountId": "XY12345", "pin": "1234", "totpSeed": SEED})
    }

    #[tokio::test]
    async fn auth_url_includes_state() {
        let fx = fixture().await;
        let (status, body) = call(
            &fx.app,
            Request::get("/api/auth/url?state=abc").body(Body::empty()).unwrap(),
        )
        .await;

        assert_eq!(status, StatusCode::OK);
        let url = body["url"].as_str().unwrap();
        assert!(url.contains("/api/v3/generate-authcode?"));
        assert!(url.contains("client_id=APP-100"));
        assert!(url.contains("response_type=code"));
        assert!(url.ends_with("state=abc"));
    }

    #[tokio::test]
    async fn token_exchange_issues_token_to_relay() {
        let mut fx = fixture().await;
        mount_ok(
            &fx.server,
            "/api/v3/validate-authcode",
            json!({"s": "ok", "access_token": "issued-tok"}),
        )
        .await;

        let (status, body) = call(
            &fx.app,
            post_json("/api/auth/token", &json!({"auth_code": "code-1"})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({"access_token": "issued-tok"}));

        // A consumer without its own token now connects with the issued one
        let (tx, _rx) = mpsc::channel(4);
        fx.relay.connect(1, tx).await.unwrap();
        fx.relay
            .dispatch(
                1,
                ConsumerCommand::Subscribe {
                    instrument: "NSE:SBIN-EQ".to_string(),
                    access_token: None,
                },
            )
            .await
            .unwrap();
        let link = tokio::time::timeout(std::time::Duration::from_secs(2), fx.links.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(link.url.ends_with("access_token=APP-100:issued-tok"));
    }

    #[tokio::test]
    async fn token_exchange_failure_is_bad_gateway() {
        let fx = fixture().await;
        Mock::given(method("POST"))
            .and(path("/api/v3/validate-authcode"))
            .respond_with(
                ResponseTemplate::new(400)
                    .set_body_json(json!({"s": "error", "code": -413, "message": "invalid auth code"})),
            )
            .mount(&fx.server)
            .await;

        let (status, body) = call(
            &fx.app,
            post_json("/api/auth/token", &json!({"auth_code": "bad"})),
        )
        .await;

        assert_eq!(status, StatusCode::BAD_GATEWAY);
        assert_eq!(body["stage"], "TOKEN");
        assert!(body["details"].as_str().unwrap().contains("invalid auth code"));
    }

    #[tokio::test]
    async fn token_request_needs_code() {
        let fx = fixture().await;

        let (status, body) =
            call(&fx.app, post_json("/api/auth/token", &json!({"auth_code": " "}))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "Invalid request");

        let (status, _) = call(&fx.app, post_json("/api/auth/token", &json!({}))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn direct_login_returns_token() {
        let fx = fixture().await;
        mount_ok(
            &fx.server,
            "/vagator/v2/send_login_otp_v2",
            json!({"s": "ok", "request_key": "rk-1"}),
        )
        .await;
        mount_ok(
            &fx.server,
            "/vagator/v2/verify_otp",
            json!({"s": "ok", "request_key": "rk-2"}),
        )
        .await;
        mount_ok(
            &fx.server,
            "/vagator/v2/verify_pin_v2",
            json!({"s": "ok", "data": {"auth_code": "ac-1"}}),
        )
        .await;
        mount_ok(
            &fx.server,
            "/api/v3/validate-authcode",
            json!({"s": "ok", "access_token": "direct-tok"}),
        )
        .await;

        let (status, body) = call(&fx.app, post_json("/api/auth/login", &login_body())).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["access_token"], "direct-tok");
        assert_eq!(fx.status.state(), UpstreamState::Disconnected);
    }

    #[tokio::test]
    async fn invalid_pin_reports_pin_stage() {
        let fx = fixture().await;
        mount_ok(
            &fx.server,
            "/vagator/v2/send_login_otp_v2",
            json!({"s": "ok", "request_key": "rk-1"}),
        )
        .await;
        mount_ok(
            &fx.server,
            "/vagator/v2/verify_otp",
            json!({"s": "ok", "request_key": "rk-2"}),
        )
        .await;
        Mock::given(method("POST"))
            .and(path("/vagator/v2/verify_pin_v2"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({"s": "error", "code": -1006, "message": "Invalid PIN"})),
            )
            .mount(&fx.server)
            .await;
        Mock::given(method("POST"))
            .and(path("/api/v3/validate-authcode"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&fx.server)
            .await;

        let (status, body) = call(&fx.app, post_json("/api/auth/login", &login_body())).await;

        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["stage"], "PIN");
        assert_eq!(body["error"], "Authentication failed");
        assert!(body.get("access_token").is_none());
    }

    #[tokio::test]
    async fn login_lists_missing_fields() {
        let fx = fixture().await;

        let (status, body) = call(
            &fx.app,
            post_json("/api/auth/login", &json!({"accountId": "XY1", "pin": "", "totpSeed": ""})),
        )
        .await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["details"], "missing required fields: pin, totpSeed");
    }

    #[tokio::test]
    async fn malformed_json_is_bad_request() {
        let fx = fixture().await;
        let request = Request::post("/api/auth/login")
            .header("content-type", "application/json")
            .body(Body::from("{not json"))
            .unwrap();

        let (status, body) = call(&fx.app, request).await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["details"].is_string());
    }
}
