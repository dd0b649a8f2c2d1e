//! The RCPT probe: determine whether a mailbox exists by walking the
//! domain's MX hosts in priority order and watching how each answers
//! `MAIL FROM` / `RCPT TO`. No message is ever transmitted; after RCPT
//! the transaction is reset and the connection goes back to the pool.
use crate::pool::{PoolError, SmtpConnectionPool};
use crate::types::{Command, Response};
use breaker::{BreakerError, BreakerRegistry};
use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, LazyLock};
use std::time::{Duration, Instant};

static PROBE_DURATION: LazyLock<prometheus::HistogramVec> = LazyLock::new(|| {
    prometheus::register_histogram_vec!(
        "smtp_probe_duration_seconds",
        "duration of RCPT probes, by outcome",
        &["outcome"]
    )
    .unwrap()
});

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct ProbeParams {
    /// Envelope sender for MAIL FROM.
    #[serde(default = "ProbeParams::default_from_address")]
    pub from_address: String,
    /// SMTP port on the MX hosts.
    #[serde(default = "ProbeParams::default_port")]
    pub port: u16,
    /// Attempts per MX on a transient (4xx) RCPT reply.
    #[serde(default = "ProbeParams::default_max_retries")]
    pub max_retries: u32,
    #[serde(
        default = "ProbeParams::default_retry_delay",
        with = "duration_serde"
    )]
    pub retry_delay: Duration,
}

impl ProbeParams {
    fn default_from_address() -> String {
        "verify@example.com".to_string()
    }
    fn default_port() -> u16 {
        25
    }
    fn default_max_retries() -> u32 {
        3
    }
    fn default_retry_delay() -> Duration {
        Duration::from_secs(2)
    }
}

impl Default for ProbeParams {
    fn default() -> Self {
        Self {
            from_address: Self::default_from_address(),
            port: Self::default_port(),
            max_retries: Self::default_max_retries(),
            retry_delay: Self::default_retry_delay(),
        }
    }
}

/// What a probe learned about the address.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum ProbeOutcome {
    /// RCPT answered 250.
    Deliverable(Response),
    /// RCPT answered 550/551/553: the mailbox does not exist.
    Undeliverable(Response),
    /// The best we saw was a transient 4xx.
    Tempfail(Response),
    /// The server rejected our MAIL FROM or otherwise refused to talk.
    PolicyBlock(Response),
    /// No MX gave a definitive answer.
    Inconclusive { last_error: Option<String> },
}

impl ProbeOutcome {
    pub fn is_definitive(&self) -> bool {
        matches!(self, Self::Deliverable(_) | Self::Undeliverable(_))
    }

    fn label(&self) -> &'static str {
        match self {
            Self::Deliverable(_) => "deliverable",
            Self::Undeliverable(_) => "undeliverable",
            Self::Tempfail(_) => "tempfail",
            Self::PolicyBlock(_) => "policy_block",
            Self::Inconclusive { .. } => "inconclusive",
        }
    }

    pub fn response(&self) -> Option<&Response> {
        match self {
            Self::Deliverable(r)
            | Self::Undeliverable(r)
            | Self::Tempfail(r)
            | Self::PolicyBlock(r) => Some(r),
            Self::Inconclusive { .. } => None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ProbeResult {
    pub outcome: ProbeOutcome,
    /// Which MX produced the outcome, when one was reached.
    pub mx_used: Option<String>,
    pub duration: Duration,
}

/// One MX conversation, before retry/iteration policy is applied.
enum MxAttempt {
    Done(ProbeOutcome),
    /// 421: the connection is unusable and was discarded.
    ConnectionFatal(Response),
    /// A downstream transport failure; counts against the breaker.
    Transport(String),
    /// A local resource problem (pool exhausted); the endpoint is not
    /// at fault and the breaker must not be charged.
    Skip(String),
}

pub struct SmtpProber {
    pool: SmtpConnectionPool,
    breakers: Arc<BreakerRegistry>,
    params: ProbeParams,
}

impl SmtpProber {
    pub fn new(
        pool: SmtpConnectionPool,
        breakers: Arc<BreakerRegistry>,
        params: ProbeParams,
    ) -> Self {
        Self {
            pool,
            breakers,
            params,
        }
    }

    pub fn pool(&self) -> &SmtpConnectionPool {
        &self.pool
    }

    /// Probe `address` against `mx_hosts` (already in priority order).
    /// Stops at the first definitive answer; a transient reply is
    /// retried per-MX before moving on. `sender` overrides the
    /// configured MAIL FROM address for this probe.
    pub async fn probe(
        &self,
        address: &str,
        mx_hosts: &[String],
        sender: Option<&str>,
    ) -> ProbeResult {
        let started = Instant::now();
        let mut last_error: Option<String> = None;
        let mut last_tempfail: Option<(Response, String)> = None;

        for mx_host in mx_hosts {
            let endpoint = format!("{mx_host}:{}", self.params.port);
            let breaker = self.breakers.get_or_create(&endpoint);

            let mut permit = match breaker.permit() {
                Ok(permit) => permit,
                Err(err @ BreakerError::Open { .. })
                | Err(err @ BreakerError::AtCapacity { .. }) => {
                    tracing::debug!("skipping {endpoint}: {err}");
                    last_error = Some(err.to_string());
                    continue;
                }
            };

            let mut attempt = 0;
            let outcome = loop {
                attempt += 1;
                match self.probe_once(mx_host, address, sender).await {
                    MxAttempt::Done(outcome @ ProbeOutcome::Tempfail(_)) => {
                        if attempt >= self.params.max_retries {
                            break Some(outcome);
                        }
                        tokio::time::sleep(self.params.retry_delay).await;
                    }
                    MxAttempt::Done(outcome) => break Some(outcome),
                    MxAttempt::ConnectionFatal(response) => {
                        permit.failure();
                        last_error = Some(response.to_single_line());
                        break None;
                    }
                    MxAttempt::Transport(error) => {
                        permit.failure();
                        last_error = Some(error);
                        break None;
                    }
                    MxAttempt::Skip(error) => {
                        last_error = Some(error);
                        break None;
                    }
                }
            };

            let Some(outcome) = outcome else {
                // breaker already updated; try the next MX
                continue;
            };

            // The endpoint held a coherent SMTP conversation, so it is
            // healthy from the breaker's point of view even when the
            // answer itself is negative.
            permit.success();

            match outcome {
                outcome @ (ProbeOutcome::Deliverable(_) | ProbeOutcome::Undeliverable(_)) => {
                    return self.finish(outcome, Some(mx_host.clone()), started);
                }
                ProbeOutcome::Tempfail(response) => {
                    last_tempfail = Some((response, mx_host.clone()));
                }
                ProbeOutcome::PolicyBlock(response) => {
                    last_error = Some(response.to_single_line());
                }
                ProbeOutcome::Inconclusive { .. } => {}
            }
        }

        // Nothing definitive. Prefer reporting the tempfail: the caller
        // can distinguish greylisting from hard failure.
        match last_tempfail {
            Some((response, mx_host)) => {
                self.finish(ProbeOutcome::Tempfail(response), Some(mx_host), started)
            }
            None => self.finish(
                ProbeOutcome::Inconclusive { last_error },
                None,
                started,
            ),
        }
    }

    /// Detect a catch-all configuration by probing a random local part
    /// that cannot plausibly exist.
    pub async fn probe_catch_all(&self, domain: &str, mx_hosts: &[String]) -> Option<bool> {
        let primary = mx_hosts.first()?;
        let random_local: String = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(16)
            .map(char::from)
            .collect();
        let probe_address = format!("{}@{domain}", random_local.to_lowercase());

        match self.probe_once(primary, &probe_address, None).await {
            MxAttempt::Done(ProbeOutcome::Deliverable(_)) => Some(true),
            MxAttempt::Done(ProbeOutcome::Undeliverable(_)) => Some(false),
            _ => None,
        }
    }

    fn finish(
        &self,
        outcome: ProbeOutcome,
        mx_used: Option<String>,
        started: Instant,
    ) -> ProbeResult {
        let duration = started.elapsed();
        PROBE_DURATION
            .with_label_values(&[outcome.label()])
            .observe(duration.as_secs_f64());
        ProbeResult {
            outcome,
            mx_used,
            duration,
        }
    }

    /// One borrow/MAIL/RCPT/RSET conversation with a single MX.
    async fn probe_once(&self, mx_host: &str, address: &str, sender: Option<&str>) -> MxAttempt {
        let mut conn = match self.pool.borrow(mx_host, self.params.port).await {
            Ok(conn) => conn,
            Err(err @ PoolError::Exhausted { .. }) => {
                return MxAttempt::Skip(err.to_string());
            }
            Err(err) => return MxAttempt::Transport(err.to_string()),
        };

        let mail_from = Command::MailFrom(
            sender.unwrap_or(&self.params.from_address).to_string(),
        );
        let response = match conn.client_mut().send_command(&mail_from).await {
            Ok(response) => response,
            Err(err) => {
                conn.mark_failed();
                conn.discard().await;
                return MxAttempt::Transport(err.to_string());
            }
        };
        match response.code {
            250 => {}
            421 => {
                conn.discard().await;
                return MxAttempt::ConnectionFatal(response);
            }
            _ => {
                // Leave the session clean before giving the connection back.
                conn.client_mut().rset().await.ok();
                conn.release().await;
                return MxAttempt::Done(ProbeOutcome::PolicyBlock(response));
            }
        }

        let rcpt_to = Command::RcptTo(address.to_string());
        let response = match conn.client_mut().send_command(&rcpt_to).await {
            Ok(response) => response,
            Err(err) => {
                conn.mark_failed();
                conn.discard().await;
                return MxAttempt::Transport(err.to_string());
            }
        };

        let outcome = match response.code {
            250 => ProbeOutcome::Deliverable(response),
            550 | 551 | 553 => ProbeOutcome::Undeliverable(response),
            450 | 451 | 452 => ProbeOutcome::Tempfail(response),
            421 => {
                conn.discard().await;
                return MxAttempt::ConnectionFatal(response);
            }
            _ => ProbeOutcome::PolicyBlock(response),
        };

        conn.client_mut().rset().await.ok();
        conn.release().await;
        MxAttempt::Done(outcome)
    }
}
