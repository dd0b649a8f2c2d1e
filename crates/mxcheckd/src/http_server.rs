//! The HTTP surface: validation endpoints, health, and Prometheus
//! metrics exposition. The engine underneath is owned by [`AppState`],
//! constructed once at startup.
use crate::audit::{AuditEventType, AuditLogger, AuditRecord};
use crate::auth::{auth_middleware, ApiKeyInfo, Authenticator, ClientIp};
use axum::extract::{Json, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Extension, Router};
use chrono::Utc;
use dns_resolver::{DnsService, RecordKind};
use redis_conn::RedisConnection;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use throttle::{IpBlocker, RateLimiter};
use tower_http::trace::TraceLayer;
use validator::{ValidationOptions, Validator, Verdict};

pub struct AppState {
    pub validator: Validator,
    pub limiter: RateLimiter,
    pub blocker: IpBlocker,
    pub auth: Authenticator,
    pub audit: AuditLogger,
    pub redis: Option<RedisConnection>,
    pub dns: Arc<DnsService>,
    pub hostname: String,
}

pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/validate", post(validate_one))
        .route("/validate/batch", post(validate_batch))
        .route("/health", get(health))
        .route("/metrics", get(report_metrics))
        .route(
            "/admin/set_diagnostic_log_filter",
            post(set_diagnostic_log_filter),
        )
        .route_layer(axum::middleware::from_fn_with_state(
            state.clone(),
            auth_middleware,
        ))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[derive(Deserialize)]
struct SetLogFilterRequest {
    filter: String,
}

/// Changes the diagnostic log filter dynamically, eg:
/// `{"filter": "mxcheckd=debug,smtp_client=trace"}`.
async fn set_diagnostic_log_filter(
    Json(request): Json<SetLogFilterRequest>,
) -> Result<(), AppError> {
    crate::logging::set_diagnostic_log_filter(&request.filter)?;
    Ok(())
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
    error_code: String,
}

pub fn error_response(status: StatusCode, code: &str, message: &str) -> Response {
    (
        status,
        Json(ErrorBody {
            error: message.to_string(),
            error_code: code.to_string(),
        }),
    )
        .into_response()
}

/// Converts internal errors into a stable 500 shape.
#[derive(Debug)]
pub struct AppError(anyhow::Error);

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        tracing::error!("internal error: {:#}", self.0);
        error_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            "internal",
            "internal server error",
        )
    }
}

impl<E> From<E> for AppError
where
    E: Into<anyhow::Error>,
{
    fn from(err: E) -> Self {
        Self(err.into())
    }
}

#[derive(Deserialize, Debug)]
#[serde(deny_unknown_fields)]
struct ValidateRequest {
    email: String,
    #[serde(default = "default_true")]
    check_mx: bool,
    #[serde(default)]
    check_smtp: bool,
    #[serde(default)]
    smtp_from: Option<String>,
}

fn default_true() -> bool {
    true
}

impl ValidateRequest {
    fn options(&self) -> ValidationOptions {
        ValidationOptions {
            check_mx: self.check_mx,
            check_smtp: self.check_smtp,
            smtp_from: self.smtp_from.clone(),
        }
    }
}

#[derive(Deserialize, Debug)]
#[serde(deny_unknown_fields)]
struct BatchValidateRequest {
    emails: Vec<String>,
    #[serde(default)]
    batch_size: Option<usize>,
    #[serde(default = "default_true")]
    check_mx: bool,
    #[serde(default)]
    check_smtp: bool,
    #[serde(default)]
    smtp_from: Option<String>,
}

async fn audit_rate_limited(state: &AppState, ip: &ClientIp, info: &ApiKeyInfo, path: &str) {
    state
        .audit
        .log(AuditRecord {
            timestamp: Utc::now(),
            event_type: AuditEventType::RateLimitExceeded,
            client_ip: ip.0.to_string(),
            api_key: Some(info.key.clone()),
            request_path: path.to_string(),
            request_method: "POST".to_string(),
            status_code: 429,
            details: serde_json::json!({"tier": info.tier.as_str()}),
        })
        .await;
}

async fn audit_validation(
    state: &AppState,
    ip: &ClientIp,
    info: &ApiKeyInfo,
    path: &str,
    verdicts: &[&Verdict],
) {
    let details: Vec<serde_json::Value> = verdicts
        .iter()
        .map(|verdict| {
            serde_json::json!({
                "email": verdict.email,
                "is_valid": verdict.is_valid,
                "validation_type": verdict.validation_type.as_str(),
            })
        })
        .collect();
    state
        .audit
        .log(AuditRecord {
            timestamp: Utc::now(),
            event_type: AuditEventType::Validation,
            client_ip: ip.0.to_string(),
            api_key: Some(info.key.clone()),
            request_path: path.to_string(),
            request_method: "POST".to_string(),
            status_code: 200,
            details: serde_json::json!({"results": details}),
        })
        .await;
}

async fn validate_one(
    State(state): State<Arc<AppState>>,
    Extension(info): Extension<ApiKeyInfo>,
    Extension(ip): Extension<ClientIp>,
    Json(request): Json<ValidateRequest>,
) -> Response {
    let decision = state.limiter.check(&info.key, info.tier, 1.0).await;
    if !decision.allowed {
        audit_rate_limited(&state, &ip, &info, "/validate").await;
        return error_response(
            StatusCode::TOO_MANY_REQUESTS,
            "quota_exceeded",
            "Rate limit exceeded",
        );
    }

    let verdict = state
        .validator
        .validate(&request.email, &request.options())
        .await;
    audit_validation(&state, &ip, &info, "/validate", &[&verdict]).await;
    Json(verdict).into_response()
}

async fn validate_batch(
    State(state): State<Arc<AppState>>,
    Extension(info): Extension<ApiKeyInfo>,
    Extension(ip): Extension<ClientIp>,
    Json(request): Json<BatchValidateRequest>,
) -> Response {
    if request.emails.is_empty() {
        return error_response(
            StatusCode::BAD_REQUEST,
            "empty_batch",
            "emails must not be empty",
        );
    }

    // A batch spends quota proportional to its size.
    let multiplier = request.emails.len() as f64;
    let decision = state.limiter.check(&info.key, info.tier, multiplier).await;
    if !decision.allowed {
        audit_rate_limited(&state, &ip, &info, "/validate/batch").await;
        return error_response(
            StatusCode::TOO_MANY_REQUESTS,
            "quota_exceeded",
            "Rate limit exceeded",
        );
    }

    let options = ValidationOptions {
        check_mx: request.check_mx,
        check_smtp: request.check_smtp,
        smtp_from: request.smtp_from.clone(),
    };
    let verdicts = state
        .validator
        .validate_batch(&request.emails, request.batch_size, &options)
        .await;
    let refs: Vec<&Verdict> = verdicts.iter().collect();
    audit_validation(&state, &ip, &info, "/validate/batch", &refs).await;
    Json(verdicts).into_response()
}

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
    components: BTreeMap<String, String>,
}

async fn health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    let mut components = BTreeMap::new();

    let redis_status = match &state.redis {
        Some(redis) => match redis.ping().await {
            Ok(()) => "ok",
            Err(_) => "unavailable",
        },
        None => "not_configured",
    };
    components.insert("redis".to_string(), redis_status.to_string());

    let dns_status = match state
        .dns
        .resolve_kind(&state.hostname, RecordKind::A)
        .await
    {
        Ok(_) => "ok",
        Err(_) => "degraded",
    };
    components.insert("dns".to_string(), dns_status.to_string());

    let status = if components.values().any(|s| s == "unavailable" || s == "degraded") {
        "degraded"
    } else {
        "healthy"
    };
    Json(HealthResponse {
        status: status.to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        components,
    })
}

async fn report_metrics() -> Result<String, AppError> {
    let report = prometheus::TextEncoder::new()
        .encode_to_string(&prometheus::default_registry().gather())?;
    Ok(report)
}
