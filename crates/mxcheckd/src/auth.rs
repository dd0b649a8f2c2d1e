//! API-key authentication and the IP block gate.
//!
//! Keys arrive via `X-API-Key`, `Authorization: Bearer`, or the
//! `api_key` query parameter, and resolve to a tier through the static
//! table or the shared key store (`apikey:<key>` hash, with a
//! `rotation:<oldkey>` pointer honored during key rollover). Failed
//! attempts feed the IP blocker, which is consulted before anything
//! else.
use crate::audit::{AuditEventType, AuditRecord};
use crate::http_server::{error_response, AppState};
use axum::extract::{ConnectInfo, Request, State};
use axum::http::StatusCode;
use axum::middleware::Next;
use axum::response::Response;
use chrono::Utc;
use redis_conn::{cmd, RedisConnection, RedisValue};
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};
use throttle::Tier;
use ttl_cache::TtlCache;

const AUTH_CACHE_TTL: Duration = Duration::from_secs(60);

/// Paths served without authentication.
const SKIP_AUTH_PATHS: &[&str] = &[
    "/health",
    "/metrics",
    "/docs",
    "/redoc",
    "/openapi.json",
    "/readiness",
];

/// The authenticated identity attached to a request.
#[derive(Debug, Clone)]
pub struct ApiKeyInfo {
    pub key: String,
    pub tier: Tier,
}

/// The client address after X-Forwarded-For resolution.
#[derive(Debug, Clone, Copy)]
pub struct ClientIp(pub IpAddr);

pub struct Authenticator {
    static_keys: HashMap<String, Tier>,
    redis: Option<RedisConnection>,
    cache: TtlCache<String, Option<Tier>>,
}

impl Authenticator {
    pub fn new(static_keys: HashMap<String, Tier>, redis: Option<RedisConnection>) -> Self {
        Self {
            static_keys,
            redis,
            cache: TtlCache::new("api_key_auth", 1024),
        }
    }

    /// Resolve a key to its tier; `None` means the key is unknown,
    /// inactive or expired.
    pub async fn resolve(&self, api_key: &str) -> Option<Tier> {
        if let Some(tier) = self.static_keys.get(api_key) {
            return Some(*tier);
        }

        let redis = self.redis.as_ref()?;
        let key = api_key.to_string();
        if let Some(cached) = self.cache.get(&key) {
            return cached;
        }

        let resolved = self.resolve_in_store(redis, api_key).await;
        self.cache
            .insert(key, resolved, Instant::now() + AUTH_CACHE_TTL);
        resolved
    }

    async fn resolve_in_store(&self, redis: &RedisConnection, api_key: &str) -> Option<Tier> {
        match self.fetch_key_record(redis, api_key).await {
            Ok(Some(tier)) => Some(tier),
            Ok(None) => {
                // Rotated keys keep working for the rotation grace
                // period via a pointer to their replacement.
                let mut rotation = cmd("GET");
                rotation.arg(format!("rotation:{api_key}"));
                match redis.query(rotation).await {
                    Ok(RedisValue::BulkString(bytes)) => {
                        let new_key = String::from_utf8_lossy(&bytes).to_string();
                        self.fetch_key_record(redis, &new_key).await.ok().flatten()
                    }
                    Ok(_) => None,
                    Err(err) => {
                        tracing::warn!("rotation lookup failed: {err:#}");
                        None
                    }
                }
            }
            Err(err) => {
                // Unverifiable is not authenticated.
                tracing::warn!("api key lookup failed: {err:#}");
                None
            }
        }
    }

    async fn fetch_key_record(
        &self,
        redis: &RedisConnection,
        api_key: &str,
    ) -> anyhow::Result<Option<Tier>> {
        let mut hgetall = cmd("HGETALL");
        hgetall.arg(format!("apikey:{api_key}"));
        let value = redis.query(hgetall).await?;

        let fields = match value {
            RedisValue::Map(pairs) => pairs
                .into_iter()
                .filter_map(|(k, v)| Some((redis_string(k)?, redis_string(v)?)))
                .collect::<HashMap<String, String>>(),
            RedisValue::Array(items) => {
                let mut fields = HashMap::new();
                let mut iter = items.into_iter();
                while let (Some(k), Some(v)) = (iter.next(), iter.next()) {
                    if let (Some(k), Some(v)) = (redis_string(k), redis_string(v)) {
                        fields.insert(k, v);
                    }
                }
                fields
            }
            _ => return Ok(None),
        };
        if fields.is_empty() {
            return Ok(None);
        }

        let active = fields
            .get("is_active")
            .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
            .unwrap_or(false);
        if !active {
            return Ok(None);
        }

        if let Some(expires_at) = fields.get("expires_at") {
            if let Ok(expires_at) = expires_at.parse::<i64>() {
                if expires_at <= Utc::now().timestamp() {
                    return Ok(None);
                }
            }
        }

        let tier = fields
            .get("tier")
            .and_then(|t| t.parse::<Tier>().ok())
            .unwrap_or(Tier::Basic);
        Ok(Some(tier))
    }
}

fn redis_string(value: RedisValue) -> Option<String> {
    match value {
        RedisValue::BulkString(bytes) => Some(String::from_utf8_lossy(&bytes).to_string()),
        RedisValue::SimpleString(s) => Some(s),
        _ => None,
    }
}

/// First element of X-Forwarded-For when present, else the peer
/// address from the socket.
pub fn client_ip(request: &Request) -> IpAddr {
    if let Some(forwarded) = request
        .headers()
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
    {
        if let Some(first) = forwarded.split(',').next() {
            if let Ok(ip) = first.trim().parse::<IpAddr>() {
                return ip;
            }
        }
    }
    request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ci| ci.0.ip())
        .unwrap_or(IpAddr::from([0, 0, 0, 0]))
}

fn extract_api_key(request: &Request) -> Option<String> {
    if let Some(authorization) = request
        .headers()
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
    {
        if let Some(token) = authorization.strip_prefix("Bearer ") {
            return Some(token.to_string());
        }
    }

    if let Some(key) = request
        .headers()
        .get("x-api-key")
        .and_then(|v| v.to_str().ok())
    {
        return Some(key.to_string());
    }

    request.uri().query().and_then(|query| {
        query.split('&').find_map(|pair| {
            pair.strip_prefix("api_key=")
                .map(|value| value.to_string())
        })
    })
}

pub async fn auth_middleware(
    State(state): State<Arc<AppState>>,
    mut request: Request,
    next: Next,
) -> Response {
    let path = request.uri().path().to_string();
    if SKIP_AUTH_PATHS.contains(&path.as_str()) {
        return next.run(request).await;
    }

    let ip = client_ip(&request);
    let method = request.method().to_string();
    request.extensions_mut().insert(ClientIp(ip));

    // The block gate runs before any other work.
    if state.blocker.is_blocked(ip).await {
        state
            .audit
            .log(AuditRecord {
                timestamp: Utc::now(),
                event_type: AuditEventType::IpBlocked,
                client_ip: ip.to_string(),
                api_key: None,
                request_path: path,
                request_method: method,
                status_code: 403,
                details: serde_json::json!({}),
            })
            .await;
        return error_response(
            StatusCode::FORBIDDEN,
            "ip_blocked",
            "Access denied due to suspicious activity",
        );
    }

    let Some(api_key) = extract_api_key(&request) else {
        state.blocker.record_failure(ip).await;
        state
            .audit
            .log(AuditRecord {
                timestamp: Utc::now(),
                event_type: AuditEventType::AuthenticationFailure,
                client_ip: ip.to_string(),
                api_key: None,
                request_path: path,
                request_method: method,
                status_code: 403,
                details: serde_json::json!({"reason": "missing api key"}),
            })
            .await;
        return error_response(StatusCode::FORBIDDEN, "auth_missing", "API key missing");
    };

    let Some(tier) = state.auth.resolve(&api_key).await else {
        state.blocker.record_failure(ip).await;
        state
            .audit
            .log(AuditRecord {
                timestamp: Utc::now(),
                event_type: AuditEventType::AuthenticationFailure,
                client_ip: ip.to_string(),
                api_key: Some(api_key),
                request_path: path,
                request_method: method,
                status_code: 403,
                details: serde_json::json!({"reason": "invalid api key"}),
            })
            .await;
        return error_response(StatusCode::FORBIDDEN, "auth_invalid", "Invalid API key");
    };

    state
        .audit
        .log(AuditRecord {
            timestamp: Utc::now(),
            event_type: AuditEventType::AuthenticationSuccess,
            client_ip: ip.to_string(),
            api_key: Some(api_key.clone()),
            request_path: path,
            request_method: method,
            status_code: 200,
            details: serde_json::json!({"tier": tier.as_str()}),
        })
        .await;

    request
        .extensions_mut()
        .insert(ApiKeyInfo { key: api_key, tier });
    next.run(request).await
}
