//! The validation pipeline: syntax, verdict cache, domain risk, DNS,
//! SMTP probe, risk score. Stages run strictly in that order for a
//! single address and stop at the first terminal answer.
use dns_resolver::{DnsError, DnsService, MxResolution};
use email_addr::EmailAddress;
use serde::{Deserialize, Serialize};
use smtp_client::{ProbeOutcome, SmtpProber};
use std::sync::{Arc, LazyLock};
use std::time::Duration;
use tokio::sync::Semaphore;

pub mod cache;
pub mod risk;
pub mod verdict;

pub use cache::{VerdictCache, VerdictCacheParams};
pub use risk::{RiskEngine, RiskParams};
pub use verdict::{
    MxRecord, RiskReport, RiskStatus, SmtpCheck, ValidationDetails, ValidationOptions,
    ValidationType, Verdict,
};

static STAGE_DURATION: LazyLock<prometheus::HistogramVec> = LazyLock::new(|| {
    prometheus::register_histogram_vec!(
        "validation_stage_duration_seconds",
        "duration of each validation stage",
        &["stage"]
    )
    .unwrap()
});
static RESULTS: LazyLock<prometheus::IntCounterVec> = LazyLock::new(|| {
    prometheus::register_int_counter_vec!(
        "validation_results_total",
        "final validation results",
        &["result"]
    )
    .unwrap()
});

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct ValidatorParams {
    /// Default batch chunk size when the request does not name one.
    #[serde(default = "ValidatorParams::default_batch_size")]
    pub batch_size: usize,
    /// Upper bound on concurrent validations inside one batch chunk.
    #[serde(default = "ValidatorParams::default_max_fanout")]
    pub max_fanout: usize,
    /// Pause between chunks so downstream MTAs don't see a burst.
    #[serde(
        default = "ValidatorParams::default_inter_chunk_delay",
        with = "duration_serde"
    )]
    pub inter_chunk_delay: Duration,
    /// Qualify a deliverable answer with a random-local-part probe.
    #[serde(default = "ValidatorParams::default_check_catch_all")]
    pub check_catch_all: bool,
}

impl ValidatorParams {
    fn default_batch_size() -> usize {
        50
    }
    fn default_max_fanout() -> usize {
        20
    }
    fn default_inter_chunk_delay() -> Duration {
        Duration::from_millis(100)
    }
    fn default_check_catch_all() -> bool {
        true
    }
}

impl Default for ValidatorParams {
    fn default() -> Self {
        Self {
            batch_size: Self::default_batch_size(),
            max_fanout: Self::default_max_fanout(),
            inter_chunk_delay: Self::default_inter_chunk_delay(),
            check_catch_all: Self::default_check_catch_all(),
        }
    }
}

/// Everything observed about an address, feeding the risk score.
#[derive(Default)]
struct Signals {
    disposable: bool,
    role_account: bool,
    typo_suggestion: Option<String>,
    spam_trap: bool,
    reputation: Option<u8>,
    no_mx: bool,
    smtp_requested: bool,
    smtp_verified: bool,
    catch_all: bool,
    has_ptr: Option<bool>,
}

impl Signals {
    /// The additive risk score, capped at 100.
    fn score(&self) -> u8 {
        let mut score = 0u32;
        if self.no_mx {
            score += 30;
        }
        if self.smtp_requested && !self.smtp_verified {
            score += 20;
        }
        if self.disposable {
            score += 15;
        }
        if self.has_ptr == Some(false) {
            score += 10;
        }
        if self.catch_all {
            score += 10;
        }
        if self.typo_suggestion.is_some() {
            score += 10;
        }
        if self.role_account {
            score += 5;
        }
        if self.spam_trap {
            score += 40;
        }
        if let Some(reputation) = self.reputation {
            score += ((100u32.saturating_sub(reputation as u32)) as f64 * 0.2) as u32;
        }
        score.min(100) as u8
    }

    fn report(&self, terminal_failure: bool) -> RiskReport {
        let score = self.score();
        let status = if terminal_failure {
            RiskStatus::Invalid
        } else if score < 50 {
            RiskStatus::Valid
        } else {
            RiskStatus::Risky
        };
        RiskReport {
            score,
            status,
            disposable: self.disposable,
            role_account: self.role_account,
            typo_suggestion: self.typo_suggestion.clone(),
            catch_all: self.catch_all,
            has_ptr: self.has_ptr,
            spam_trap: self.spam_trap,
            reputation: self.reputation,
        }
    }
}

/// The orchestrator. Owns nothing global: every dependency is handed
/// in at construction and shared by reference.
pub struct Validator {
    dns: Arc<DnsService>,
    prober: Arc<SmtpProber>,
    risk: RiskEngine,
    cache: VerdictCache,
    params: ValidatorParams,
}

impl Validator {
    pub fn new(
        dns: Arc<DnsService>,
        prober: Arc<SmtpProber>,
        risk: RiskEngine,
        cache: VerdictCache,
        params: ValidatorParams,
    ) -> Self {
        Self {
            dns,
            prober,
            risk,
            cache,
            params,
        }
    }

    pub async fn validate(&self, raw_email: &str, options: &ValidationOptions) -> Verdict {
        let verdict = self.validate_impl(raw_email, options).await;
        let result = if !verdict.is_valid {
            "invalid"
        } else if matches!(
            verdict.risk.as_ref().map(|r| r.status),
            Some(RiskStatus::Risky)
        ) {
            "risky"
        } else {
            "valid"
        };
        RESULTS.with_label_values(&[result]).inc();
        verdict
    }

    async fn validate_impl(&self, raw_email: &str, options: &ValidationOptions) -> Verdict {
        // Stage 1: syntax + IDNA. Fail fast; there is no cache key for
        // an address that doesn't parse.
        let syntax_timer = STAGE_DURATION.with_label_values(&["syntax"]).start_timer();
        let address = match EmailAddress::parse(raw_email) {
            Ok(address) => address,
            Err(err) => {
                syntax_timer.observe_duration();
                let mut verdict =
                    Verdict::invalid(raw_email, ValidationType::Syntax, err.to_string());
                verdict.risk = Some(RiskReport {
                    score: 40,
                    status: RiskStatus::Invalid,
                    disposable: false,
                    role_account: false,
                    typo_suggestion: None,
                    catch_all: false,
                    has_ptr: None,
                    spam_trap: false,
                    reputation: None,
                });
                return verdict;
            }
        };
        syntax_timer.observe_duration();

        // Stage 2: verdict cache.
        let key = Verdict::cache_key(address.normalized(), options);
        if let Some(verdict) = self.cache.get(&key).await {
            return verdict;
        }

        // Stage 3: pure domain risk signals.
        let risk_timer = STAGE_DURATION.with_label_values(&["risk"]).start_timer();
        let mut signals = Signals {
            disposable: self.risk.is_disposable(address.domain()),
            role_account: self.risk.is_role_account(address.local_part()),
            typo_suggestion: self.risk.typo_suggestion(address.domain()),
            spam_trap: self.risk.is_spam_trap(address.normalized()),
            reputation: self.risk.reputation(address.domain()),
            smtp_requested: options.check_smtp,
            ..Signals::default()
        };
        risk_timer.observe_duration();

        let mut details = ValidationDetails {
            local_part: address.local_part().to_string(),
            domain: address.domain().to_string(),
            normalized_email: address.normalized().to_string(),
            mx_records: None,
            smtp_check: None,
        };

        if !options.check_mx && !options.check_smtp {
            let verdict = Verdict {
                email: raw_email.to_string(),
                is_valid: true,
                validation_type: ValidationType::Syntax,
                error_message: None,
                details: Some(details),
                risk: Some(signals.report(false)),
            };
            self.cache.put(&key, &verdict).await;
            return verdict;
        }

        // Stage 4: MX resolution (also required for an SMTP check).
        let dns_timer = STAGE_DURATION.with_label_values(&["dns"]).start_timer();
        let resolution = match self.dns.resolve_mx(address.domain()).await {
            Ok(resolution) => resolution,
            Err(err) => {
                dns_timer.observe_duration();
                // Transport-level DNS trouble is not a property of the
                // address; surface it without caching.
                return Verdict {
                    email: raw_email.to_string(),
                    is_valid: false,
                    validation_type: ValidationType::Mx,
                    error_message: Some(dns_error_message(&err)),
                    details: Some(details),
                    risk: None,
                };
            }
        };

        if resolution.is_empty() {
            dns_timer.observe_duration();
            signals.no_mx = true;
            let verdict = Verdict {
                email: raw_email.to_string(),
                is_valid: false,
                validation_type: ValidationType::Mx,
                error_message: Some("No MX records found for domain".to_string()),
                details: Some(details),
                risk: Some(signals.report(true)),
            };
            self.cache.put(&key, &verdict).await;
            return verdict;
        }

        details.mx_records = Some(
            resolution
                .hosts
                .iter()
                .map(|mx| MxRecord {
                    host: mx.host.clone(),
                    priority: mx.priority,
                })
                .collect(),
        );
        signals.has_ptr = match self.dns.resolve_ptr(address.domain()).await {
            Ok(ptr) => Some(ptr.is_some()),
            Err(_) => None,
        };
        dns_timer.observe_duration();

        if !options.check_smtp {
            let verdict = Verdict {
                email: raw_email.to_string(),
                is_valid: true,
                validation_type: ValidationType::Mx,
                error_message: None,
                details: Some(details),
                risk: Some(signals.report(false)),
            };
            self.cache.put(&key, &verdict).await;
            return verdict;
        }

        // Stage 5: the RCPT probe.
        let smtp_timer = STAGE_DURATION.with_label_values(&["smtp"]).start_timer();
        let verdict = self
            .probe_verdict(raw_email, &address, &resolution, options, signals, details)
            .await;
        smtp_timer.observe_duration();

        self.cache.put(&key, &verdict).await;
        verdict
    }

    async fn probe_verdict(
        &self,
        raw_email: &str,
        address: &EmailAddress,
        resolution: &MxResolution,
        options: &ValidationOptions,
        mut signals: Signals,
        mut details: ValidationDetails,
    ) -> Verdict {
        let hosts: Vec<String> = resolution
            .hosts
            .iter()
            .map(|mx| mx.host.clone())
            .collect();
        let result = self
            .prober
            .probe(
                address.normalized(),
                &hosts,
                options.smtp_from.as_deref(),
            )
            .await;

        details.smtp_check = Some(SmtpCheck {
            mx_used: result.mx_used.clone(),
            response: result.outcome.response().map(|r| r.to_single_line()),
        });

        let (is_valid, error_message, terminal_failure) = match &result.outcome {
            ProbeOutcome::Deliverable(_) => {
                signals.smtp_verified = true;
                if self.params.check_catch_all {
                    signals.catch_all = self
                        .prober
                        .probe_catch_all(address.domain(), &hosts)
                        .await
                        .unwrap_or(false);
                }
                (true, None, false)
            }
            ProbeOutcome::Undeliverable(_) => (
                false,
                Some("Email address does not exist".to_string()),
                true,
            ),
            ProbeOutcome::Tempfail(response) => (
                false,
                Some(format!(
                    "SMTP temporary failure: {}",
                    response.to_single_line()
                )),
                false,
            ),
            ProbeOutcome::PolicyBlock(response) => (
                false,
                Some(format!(
                    "SMTP verification blocked: {}",
                    response.to_single_line()
                )),
                false,
            ),
            ProbeOutcome::Inconclusive { last_error } => (
                false,
                Some(match last_error {
                    Some(error) => format!("SMTP verification inconclusive: {error}"),
                    None => "SMTP verification inconclusive: no MX reachable".to_string(),
                }),
                false,
            ),
        };

        Verdict {
            email: raw_email.to_string(),
            is_valid,
            validation_type: ValidationType::Smtp,
            error_message,
            details: Some(details),
            risk: Some(signals.report(terminal_failure)),
        }
    }

    /// Validate a batch: chunked, each chunk fanned out concurrently
    /// under a semaphore, with a small pause between chunks. Results
    /// come back in input order.
    pub async fn validate_batch(
        &self,
        emails: &[String],
        batch_size: Option<usize>,
        options: &ValidationOptions,
    ) -> Vec<Verdict> {
        let batch_size = batch_size.unwrap_or(self.params.batch_size).max(1);
        let fanout = Arc::new(Semaphore::new(batch_size.min(self.params.max_fanout).max(1)));

        let mut results = Vec::with_capacity(emails.len());
        let chunk_count = emails.len().div_ceil(batch_size);
        for (idx, chunk) in emails.chunks(batch_size).enumerate() {
            let chunk_results = futures::future::join_all(chunk.iter().map(|email| {
                let fanout = fanout.clone();
                async move {
                    let _permit = fanout.acquire().await.expect("semaphore never closed");
                    self.validate(email, options).await
                }
            }))
            .await;
            results.extend(chunk_results);

            if idx + 1 < chunk_count {
                tokio::time::sleep(self.params.inter_chunk_delay).await;
            }
        }
        results
    }
}

fn dns_error_message(err: &DnsError) -> String {
    match err {
        DnsError::Timeout { .. } => format!("DNS resolution timed out: {err}"),
        _ => format!("DNS resolution failed: {err}"),
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use breaker::{BreakerParams, BreakerRegistry};
    use dns_resolver::{DnsParams, Resolver, TestResolver};
    use smtp_client::test_server::{Behavior, TestSmtpServer};
    use smtp_client::{PoolParams, ProbeParams, SmtpClientTimeouts, SmtpConnectionPool};

    const EXAMPLE_COM: &str = r#"; two mail servers, deliberately out of order
$ORIGIN example.com.
@       600 MX  20 mx2
            MX  10 mx1
            A   192.0.2.10
mx1         A   192.0.2.129
mx2         A   192.0.2.130"#;

    const SMTP_TEST: &str = r#"; MX pointing at loopback for the scripted server
$ORIGIN smtp.test.
@       600 MX  10 127.0.0.1."#;

    fn zones() -> Arc<dyn Resolver> {
        Arc::new(
            TestResolver::default()
                .with_zone(EXAMPLE_COM)
                .with_zone(SMTP_TEST),
        )
    }

    fn make_validator(probe_port: u16) -> Validator {
        make_validator_with_risk(probe_port, RiskParams::default())
    }

    fn make_validator_with_risk(probe_port: u16, risk_params: RiskParams) -> Validator {
        let dns = Arc::new(DnsService::with_resolvers(
            vec![zones()],
            DnsParams::default(),
        ));
        let pool = SmtpConnectionPool::new(PoolParams {
            timeouts: SmtpClientTimeouts::short_timeouts(),
            retry_delay: Duration::from_millis(10),
            ..PoolParams::default()
        });
        let breakers = Arc::new(BreakerRegistry::new(BreakerParams::default()));
        let prober = Arc::new(SmtpProber::new(
            pool,
            breakers,
            ProbeParams {
                port: probe_port,
                retry_delay: Duration::from_millis(5),
                ..ProbeParams::default()
            },
        ));
        Validator::new(
            dns,
            prober,
            RiskEngine::new(&risk_params).unwrap(),
            VerdictCache::new(VerdictCacheParams::default(), None),
            ValidatorParams {
                inter_chunk_delay: Duration::from_millis(1),
                ..ValidatorParams::default()
            },
        )
    }

    fn syntax_only() -> ValidationOptions {
        ValidationOptions {
            check_mx: false,
            check_smtp: false,
            smtp_from: None,
        }
    }

    #[tokio::test]
    async fn syntax_only_validation() {
        let validator = make_validator(25);
        let verdict = validator
            .validate("user@example.com", &syntax_only())
            .await;
        assert!(verdict.is_valid);
        assert_eq!(verdict.validation_type, ValidationType::Syntax);
        let details = verdict.details.unwrap();
        assert_eq!(details.normalized_email, "user@example.com");
        assert_eq!(details.local_part, "user");
        assert_eq!(details.domain, "example.com");
        assert_eq!(details.mx_records, None);
    }

    #[tokio::test]
    async fn mx_validation_sorts_by_priority() {
        let validator = make_validator(25);
        let verdict = validator
            .validate("user@example.com", &ValidationOptions::default())
            .await;
        assert!(verdict.is_valid);
        assert_eq!(verdict.validation_type, ValidationType::Mx);
        assert_eq!(
            verdict.details.unwrap().mx_records.unwrap(),
            vec![
                MxRecord {
                    host: "mx1.example.com".to_string(),
                    priority: 10
                },
                MxRecord {
                    host: "mx2.example.com".to_string(),
                    priority: 20
                },
            ]
        );
    }

    #[tokio::test]
    async fn missing_mx_is_invalid() {
        let validator = make_validator(25);
        let verdict = validator
            .validate("user@missing.test", &ValidationOptions::default())
            .await;
        assert!(!verdict.is_valid);
        assert_eq!(verdict.validation_type, ValidationType::Mx);
        assert_eq!(
            verdict.error_message.as_deref(),
            Some("No MX records found for domain")
        );
        let risk = verdict.risk.unwrap();
        assert_eq!(risk.status, RiskStatus::Invalid);
        assert!(risk.score >= 30);
    }

    #[tokio::test]
    async fn smtp_validation_deliverable() {
        let server = TestSmtpServer::spawn(Behavior::default()).await;
        let validator = make_validator(server.port());
        let verdict = validator
            .validate(
                "user@smtp.test",
                &ValidationOptions {
                    check_mx: true,
                    check_smtp: true,
                    smtp_from: None,
                },
            )
            .await;
        assert!(verdict.is_valid, "verdict: {verdict:?}");
        assert_eq!(verdict.validation_type, ValidationType::Smtp);
        let details = verdict.details.unwrap();
        let smtp_check = details.smtp_check.unwrap();
        assert_eq!(smtp_check.mx_used.as_deref(), Some("127.0.0.1"));
        // the scripted server accepts any RCPT, so the catch-all probe
        // flags it
        assert!(verdict.risk.unwrap().catch_all);
    }

    #[tokio::test]
    async fn smtp_validation_undeliverable() {
        let mut behavior = Behavior::default();
        behavior.rcpt_replies.insert(
            "ghost@smtp.test".to_string(),
            "550 5.1.1 User unknown".to_string(),
        );
        let server = TestSmtpServer::spawn(behavior).await;
        let validator = make_validator(server.port());
        let verdict = validator
            .validate(
                "ghost@smtp.test",
                &ValidationOptions {
                    check_mx: true,
                    check_smtp: true,
                    smtp_from: None,
                },
            )
            .await;
        assert!(!verdict.is_valid);
        assert_eq!(verdict.validation_type, ValidationType::Smtp);
        assert_eq!(
            verdict.error_message.as_deref(),
            Some("Email address does not exist")
        );
        assert_eq!(verdict.risk.unwrap().status, RiskStatus::Invalid);
    }

    #[tokio::test]
    async fn verdicts_are_cached() {
        let validator = make_validator(25);
        let options = ValidationOptions::default();
        let first = validator.validate("user@example.com", &options).await;
        let key = Verdict::cache_key("user@example.com", &options);
        assert_eq!(validator.cache.get(&key).await, Some(first.clone()));

        let second = validator.validate("user@example.com", &options).await;
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn syntax_errors_fail_fast() {
        let validator = make_validator(25);
        let verdict = validator.validate("not-an-email", &syntax_only()).await;
        assert!(!verdict.is_valid);
        assert_eq!(verdict.validation_type, ValidationType::Syntax);
        assert!(verdict.error_message.is_some());
        assert_eq!(verdict.risk.unwrap().score, 40);
    }

    #[tokio::test]
    async fn risk_signals_are_reported() {
        let validator = make_validator(25);
        let verdict = validator
            .validate("admin@mailinator.com", &syntax_only())
            .await;
        assert!(verdict.is_valid);
        let risk = verdict.risk.unwrap();
        assert!(risk.disposable);
        assert!(risk.role_account);
        assert_eq!(risk.score, 20);
        assert_eq!(risk.status, RiskStatus::Valid);

        let verdict = validator
            .validate("user@gmal.com", &syntax_only())
            .await;
        assert_eq!(
            verdict.risk.unwrap().typo_suggestion.as_deref(),
            Some("gmail.com")
        );
    }

    #[tokio::test]
    async fn spam_traps_push_into_risky() {
        let trap_file = std::env::temp_dir().join(format!(
            "spam-traps-{}-{}.txt",
            std::process::id(),
            std::time::SystemTime::now()
                .duration_since(std::time::SystemTime::UNIX_EPOCH)
                .unwrap()
                .as_nanos()
        ));
        std::fs::write(&trap_file, "trap@mailinator.com\n").unwrap();

        let validator = make_validator_with_risk(
            25,
            RiskParams {
                spam_trap_file: Some(trap_file.clone()),
                ..RiskParams::default()
            },
        );
        let verdict = validator
            .validate("trap@mailinator.com", &syntax_only())
            .await;
        let risk = verdict.risk.unwrap();
        assert!(risk.spam_trap);
        // spam trap (40) + disposable (15)
        assert_eq!(risk.score, 55);
        assert_eq!(risk.status, RiskStatus::Risky);

        std::fs::remove_file(trap_file).ok();
    }

    #[tokio::test]
    async fn batch_preserves_order() {
        let validator = make_validator(25);
        let emails = vec![
            "user@example.com".to_string(),
            "definitely@@broken".to_string(),
            "user@missing.test".to_string(),
        ];
        let verdicts = validator
            .validate_batch(&emails, Some(2), &ValidationOptions::default())
            .await;
        assert_eq!(verdicts.len(), 3);
        assert!(verdicts[0].is_valid);
        assert_eq!(verdicts[1].validation_type, ValidationType::Syntax);
        assert!(!verdicts[1].is_valid);
        assert_eq!(
            verdicts[2].error_message.as_deref(),
            Some("No MX records found for domain")
        );
    }

    #[tokio::test]
    async fn identical_options_share_cache_but_different_do_not() {
        let validator = make_validator(25);
        let verdict_mx = validator
            .validate("user@example.com", &ValidationOptions::default())
            .await;
        let verdict_syntax = validator
            .validate("user@example.com", &syntax_only())
            .await;
        assert_eq!(verdict_mx.validation_type, ValidationType::Mx);
        assert_eq!(verdict_syntax.validation_type, ValidationType::Syntax);
    }
}
