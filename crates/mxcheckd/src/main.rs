//! mxcheckd: the email address verification daemon.
use anyhow::Context;
use breaker::BreakerRegistry;
use clap::Parser;
use dns_resolver::DnsService;
use smtp_client::{SmtpConnectionPool, SmtpProber};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use throttle::{IpBlocker, RateLimiter};
use validator::{RiskEngine, Validator, VerdictCache};

mod audit;
mod auth;
mod config;
mod http_server;
mod logging;

use audit::AuditLogger;
use auth::Authenticator;
use config::Config;
use http_server::{build_router, AppState};
use logging::{DiagnosticFormat, LoggingConfig};

/// Email validation service daemon.
#[derive(Debug, Parser)]
#[command(about, version)]
struct Opt {
    /// Configuration file to load. When omitted, `mxcheckd.toml` is
    /// used if present, else built-in defaults.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Directory where diagnostic log files will be placed.
    ///
    /// If omitted, diagnostics will be printed to stderr.
    #[arg(long)]
    diag_log_dir: Option<PathBuf>,

    /// How diagnostic logs render. full, compact and pretty are
    /// intended for human consumption; json outputs machine readable
    /// records.
    #[arg(long, default_value = "full")]
    diag_format: DiagnosticFormat,
}

fn main() -> anyhow::Result<()> {
    let opts = Opt::parse();

    LoggingConfig {
        log_dir: opts.diag_log_dir.clone(),
        filter_env_var: "MXCHECKD_LOG",
        default_filter: "mxcheckd=info,validator=info,smtp_client=info,dns_resolver=info",
        diag_format: opts.diag_format,
    }
    .init()?;

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("building tokio runtime")?
        .block_on(run(opts))
}

async fn run(opts: Opt) -> anyhow::Result<()> {
    let config_path = opts
        .config
        .clone()
        .unwrap_or_else(|| PathBuf::from("mxcheckd.toml"));
    let config = Config::load(&config_path, opts.config.is_some())?;

    let (state, pool) = build_state(&config)?;
    let reaper = pool.start_reaper();

    let app = build_router(state.clone());
    let socket = std::net::TcpListener::bind(&config.listener.listen)
        .with_context(|| format!("listen on {}", config.listener.listen))?;
    socket.set_nonblocking(true)?;
    let addr = socket.local_addr()?;
    tracing::info!("http listener on {addr:?}");

    let handle = axum_server::Handle::new();
    let server = axum_server::from_tcp(socket)
        .handle(handle.clone())
        .serve(app.into_make_service_with_connect_info::<SocketAddr>());
    let server_task = tokio::spawn(server);

    tokio::signal::ctrl_c()
        .await
        .context("listening for shutdown signal")?;
    tracing::info!("shutdown requested, draining");

    handle.graceful_shutdown(Some(Duration::from_secs(10)));
    server_task.await.ok();

    reaper.abort();
    pool.shutdown().await;
    state.audit.shutdown();
    Ok(())
}

fn build_state(config: &Config) -> anyhow::Result<(Arc<AppState>, SmtpConnectionPool)> {
    let redis = config
        .redis
        .as_ref()
        .map(|params| params.open())
        .transpose()
        .context("opening redis connection")?;
    if redis.is_none() {
        tracing::warn!(
            "no redis configured: rate limits, IP blocks and the verdict \
             cache are process-local"
        );
    }

    let dns = Arc::new(
        DnsService::new(config.dns.clone())
            .map_err(|err| anyhow::anyhow!("initializing DNS service: {err}"))?,
    );

    let pool = SmtpConnectionPool::new(config.smtp.pool_params(&config.listener.hostname));
    let breakers = Arc::new(BreakerRegistry::new(config.breaker));
    let prober = Arc::new(SmtpProber::new(
        pool.clone(),
        breakers,
        config.smtp.probe_params(),
    ));

    let risk = RiskEngine::new(&config.risk).context("loading risk data")?;
    let verdict_cache = VerdictCache::new(config.verdict_cache.clone(), redis.clone());
    let validator = Validator::new(
        dns.clone(),
        prober,
        risk,
        verdict_cache,
        config.validator.clone(),
    );

    let state = Arc::new(AppState {
        validator,
        limiter: RateLimiter::new(config.rate_limit.limiter_params()?, redis.clone()),
        blocker: IpBlocker::new(config.ip_blocker.clone(), redis.clone()),
        auth: Authenticator::new(config.auth.static_keys.clone(), redis.clone()),
        audit: AuditLogger::init(&config.audit)?,
        redis,
        dns,
        hostname: config.listener.hostname.clone(),
    });
    Ok((state, pool))
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::audit::AuditParams;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use breaker::BreakerParams;
    use dns_resolver::{DnsParams, Resolver, TestResolver};
    use smtp_client::{PoolParams, ProbeParams, SmtpClientTimeouts};
    use std::collections::HashMap;
    use throttle::{IpBlockerParams, RateLimiterParams, Tier, TierTable};
    use tower::util::ServiceExt;
    use validator::{RiskParams, ValidatorParams, VerdictCacheParams};

    const EXAMPLE_COM: &str = r#"$ORIGIN example.com.
@       600 MX  20 mx2
            MX  10 mx1
mx1         A   192.0.2.129
mx2         A   192.0.2.130"#;

    fn test_state(tiers: TierTable) -> Arc<AppState> {
        let resolver: Arc<dyn Resolver> =
            Arc::new(TestResolver::default().with_zone(EXAMPLE_COM));
        let dns = Arc::new(DnsService::with_resolvers(
            vec![resolver],
            DnsParams::default(),
        ));
        let pool = SmtpConnectionPool::new(PoolParams {
            timeouts: SmtpClientTimeouts::short_timeouts(),
            ..PoolParams::default()
        });
        let prober = Arc::new(SmtpProber::new(
            pool.clone(),
            Arc::new(BreakerRegistry::new(BreakerParams::default())),
            ProbeParams::default(),
        ));
        let validator = Validator::new(
            dns.clone(),
            prober,
            RiskEngine::new(&RiskParams::default()).unwrap(),
            VerdictCache::new(VerdictCacheParams::default(), None),
            ValidatorParams {
                inter_chunk_delay: Duration::from_millis(1),
                ..ValidatorParams::default()
            },
        );

        let mut static_keys = HashMap::new();
        static_keys.insert("dev-key".to_string(), Tier::Basic);
        static_keys.insert("vip-key".to_string(), Tier::Unlimited);

        Arc::new(AppState {
            validator,
            limiter: RateLimiter::new(
                RateLimiterParams {
                    tiers,
                    ..RateLimiterParams::default()
                },
                None,
            ),
            blocker: IpBlocker::new(IpBlockerParams::default(), None),
            auth: Authenticator::new(static_keys, None),
            audit: AuditLogger::init(&AuditParams::default()).unwrap(),
            redis: None,
            dns,
            hostname: "test.local".to_string(),
        })
    }

    fn router() -> axum::Router {
        build_router(test_state(TierTable::default()))
    }

    async fn send(
        app: &axum::Router,
        method: &str,
        uri: &str,
        api_key: Option<&str>,
        client_ip: &str,
        body: Option<serde_json::Value>,
    ) -> (StatusCode, serde_json::Value) {
        let mut builder = Request::builder()
            .method(method)
            .uri(uri)
            .header("x-forwarded-for", client_ip);
        if let Some(key) = api_key {
            builder = builder.header("x-api-key", key);
        }
        let request = match body {
            Some(body) => builder
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };

        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let value = if bytes.is_empty() {
            serde_json::Value::Null
        } else {
            serde_json::from_slice(&bytes)
                .unwrap_or_else(|_| serde_json::Value::String(
                    String::from_utf8_lossy(&bytes).to_string(),
                ))
        };
        (status, value)
    }

    #[tokio::test]
    async fn missing_api_key_is_forbidden() {
        let app = router();
        let (status, body) = send(
            &app,
            "POST",
            "/validate",
            None,
            "198.51.100.1",
            Some(serde_json::json!({"email": "user@example.com"})),
        )
        .await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert_eq!(body["error_code"], "auth_missing");
    }

    #[tokio::test]
    async fn validate_endpoint_returns_verdict() {
        let app = router();
        let (status, body) = send(
            &app,
            "POST",
            "/validate",
            Some("dev-key"),
            "198.51.100.2",
            Some(serde_json::json!({"email": "user@example.com"})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["email"], "user@example.com");
        assert_eq!(body["is_valid"], true);
        assert_eq!(body["validation_type"], "mx");
        assert_eq!(
            body["details"]["mx_records"][0]["host"],
            "mx1.example.com"
        );
        assert_eq!(body["details"]["mx_records"][0]["priority"], 10);
    }

    #[tokio::test]
    async fn api_key_via_bearer_and_query() {
        let app = router();
        let request = Request::builder()
            .method("POST")
            .uri("/validate")
            .header("x-forwarded-for", "198.51.100.3")
            .header("authorization", "Bearer dev-key")
            .header("content-type", "application/json")
            .body(Body::from(
                serde_json::json!({"email": "user@example.com", "check_mx": false})
                    .to_string(),
            ))
            .unwrap();
        let response = app.clone().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let (status, _) = send(
            &app,
            "POST",
            "/validate?api_key=dev-key",
            None,
            "198.51.100.3",
            Some(serde_json::json!({"email": "user@example.com", "check_mx": false})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn quota_exhaustion_yields_429() {
        let mut specs = HashMap::new();
        specs.insert("basic".to_string(), "2/h".to_string());
        let app = build_router(test_state(TierTable::from_strings(&specs).unwrap()));

        let body = serde_json::json!({"email": "user@example.com", "check_mx": false});
        for _ in 0..2 {
            let (status, _) = send(
                &app,
                "POST",
                "/validate",
                Some("dev-key"),
                "198.51.100.4",
                Some(body.clone()),
            )
            .await;
            assert_eq!(status, StatusCode::OK);
        }
        let (status, response) = send(
            &app,
            "POST",
            "/validate",
            Some("dev-key"),
            "198.51.100.4",
            Some(body),
        )
        .await;
        assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response["error_code"], "quota_exceeded");
    }

    #[tokio::test]
    async fn unlimited_tier_is_never_throttled() {
        let mut specs = HashMap::new();
        specs.insert("basic".to_string(), "1/h".to_string());
        let app = build_router(test_state(TierTable::from_strings(&specs).unwrap()));
        let body = serde_json::json!({"email": "user@example.com", "check_mx": false});
        for _ in 0..5 {
            let (status, _) = send(
                &app,
                "POST",
                "/validate",
                Some("vip-key"),
                "198.51.100.5",
                Some(body.clone()),
            )
            .await;
            assert_eq!(status, StatusCode::OK);
        }
    }

    #[tokio::test]
    async fn repeated_bad_keys_block_the_ip() {
        let app = router();
        let body = serde_json::json!({"email": "user@example.com"});
        for _ in 0..5 {
            let (status, _) = send(
                &app,
                "POST",
                "/validate",
                Some("wrong-key"),
                "198.51.100.6",
                Some(body.clone()),
            )
            .await;
            assert_eq!(status, StatusCode::FORBIDDEN);
        }

        // Even a valid key is rejected once the IP is blocked.
        let (status, response) = send(
            &app,
            "POST",
            "/validate",
            Some("dev-key"),
            "198.51.100.6",
            Some(body),
        )
        .await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert_eq!(response["error_code"], "ip_blocked");
    }

    #[tokio::test]
    async fn batch_endpoint_preserves_order() {
        let app = router();
        let (status, body) = send(
            &app,
            "POST",
            "/validate/batch",
            Some("dev-key"),
            "198.51.100.7",
            Some(serde_json::json!({
                "emails": ["user@example.com", "broken@@nope"],
                "batch_size": 10
            })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let results = body.as_array().unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(results[0]["is_valid"], true);
        assert_eq!(results[1]["is_valid"], false);
        assert_eq!(results[1]["validation_type"], "syntax");
    }

    #[tokio::test]
    async fn health_and_metrics_skip_auth() {
        let app = router();
        let (status, body) = send(&app, "GET", "/health", None, "198.51.100.8", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "healthy");
        assert_eq!(body["components"]["redis"], "not_configured");
        assert_eq!(body["components"]["dns"], "ok");

        // Touch the pipeline so its metrics are registered, then read
        // the exposition.
        let (status, _) = send(
            &app,
            "POST",
            "/validate",
            Some("dev-key"),
            "198.51.100.8",
            Some(serde_json::json!({"email": "user@example.com", "check_mx": false})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        let (status, body) = send(&app, "GET", "/metrics", None, "198.51.100.8", None).await;
        assert_eq!(status, StatusCode::OK);
        let text = body.as_str().unwrap_or_default().to_string();
        assert!(
            text.contains("validation_results_total"),
            "metrics exposition should include validation counters: {text}"
        );
    }
}
