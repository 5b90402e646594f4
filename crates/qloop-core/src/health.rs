//! Health probing and bounded polling.
//!
//! A single [`Probe`] observes one service once (HTTP, Redis `PING`, or raw TCP).
//! [`HealthProber::wait_for_health`] repeats probes under a [`PollPolicy`] and ends in
//! [`PollState::Ready`] or [`PollState::TimedOut`]; [`PollState::NotReady`] is what a
//! single [`HealthProber::poll_once`] reports while the service is still coming up.
//! A probe that got no answer in time is [`Probe::TimedOut`], never folded into
//! "unhealthy".

use crate::config::{Backoff, HealthCheck, HealthSettings};
use crate::error::Cancelled;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;

/// `status` field of a service health record. Anything unrecognised is `Unknown`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Unhealthy,
    Degraded,
    #[serde(other)]
    Unknown,
}

impl HealthStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            HealthStatus::Healthy => "healthy",
            HealthStatus::Unhealthy => "unhealthy",
            HealthStatus::Degraded => "degraded",
            HealthStatus::Unknown => "unknown",
        }
    }
}

/// Body of `GET /health`: `{status, service, ...capability flags}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthRecord {
    pub status: HealthStatus,
    #[serde(default)]
    pub service: Option<String>,
    /// Feature flags and anything else the service reports.
    #[serde(flatten)]
    pub capabilities: serde_json::Map<String, serde_json::Value>,
}

impl HealthRecord {
    pub fn new(status: HealthStatus, service: impl Into<String>) -> Self {
        Self {
            status,
            service: Some(service.into()),
            capabilities: serde_json::Map::new(),
        }
    }

    pub fn with_flag(mut self, key: &str, value: impl Into<serde_json::Value>) -> Self {
        self.capabilities.insert(key.to_string(), value.into());
        self
    }
}

/// Outcome of one health probe.
#[derive(Debug, Clone, PartialEq)]
pub enum Probe {
    /// Success. `record` is present when the body parsed as a health record.
    Healthy { record: Option<HealthRecord> },
    /// Responding, but reporting reduced capability.
    Degraded { record: HealthRecord },
    /// Responded with a failure status, an unhealthy record, or an error reply.
    Unhealthy {
        status_code: Option<u16>,
        record: Option<HealthRecord>,
        detail: String,
    },
    /// Nothing listening / connection refused / DNS failure.
    Unreachable { detail: String },
    /// Connected (or tried to) but got no answer within the probe budget.
    TimedOut { after: Duration },
}

impl Probe {
    /// Up and serving; degraded counts for lifecycle purposes.
    pub fn is_ready(&self) -> bool {
        matches!(self, Probe::Healthy { .. } | Probe::Degraded { .. })
    }

    /// Reported exactly `healthy` in a health record.
    pub fn reports_healthy(&self) -> bool {
        matches!(
            self,
            Probe::Healthy {
                record: Some(HealthRecord {
                    status: HealthStatus::Healthy,
                    ..
                })
            }
        )
    }

    pub fn label(&self) -> &'static str {
        match self {
            Probe::Healthy { .. } => "healthy",
            Probe::Degraded { .. } => "degraded",
            Probe::Unhealthy { .. } => "unhealthy",
            Probe::Unreachable { .. } => "unreachable",
            Probe::TimedOut { .. } => "timed out",
        }
    }
}

impl fmt::Display for Probe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Probe::Healthy { record: Some(r) } => write!(
                f,
                "healthy ({})",
                r.service.as_deref().unwrap_or("unnamed service")
            ),
            Probe::Healthy { record: None } => write!(f, "healthy"),
            Probe::Degraded { record } => write!(
                f,
                "degraded ({})",
                record.service.as_deref().unwrap_or("unnamed service")
            ),
            Probe::Unhealthy {
                status_code: Some(code),
                detail,
                ..
            } => write!(f, "unhealthy (HTTP {}): {}", code, detail),
            Probe::Unhealthy { detail, .. } => write!(f, "unhealthy: {}", detail),
            Probe::Unreachable { detail } => write!(f, "unreachable: {}", detail),
            Probe::TimedOut { after } => write!(
                f,
                "no response within {}ms (process may be hung)",
                after.as_millis()
            ),
        }
    }
}

/// Tri-state polling result.
#[derive(Debug, Clone, PartialEq)]
pub enum PollState {
    Ready(Probe),
    NotReady(Probe),
    TimedOut {
        last: Probe,
        elapsed: Duration,
        attempts: u32,
    },
}

impl PollState {
    pub fn is_ready(&self) -> bool {
        matches!(self, PollState::Ready(_))
    }

    pub fn last_probe(&self) -> &Probe {
        match self {
            PollState::Ready(p) | PollState::NotReady(p) => p,
            PollState::TimedOut { last, .. } => last,
        }
    }

    /// Operator-facing explanation; a timed-out wait whose last probe also timed out points at a hang.
    pub fn diagnosis(&self) -> String {
        match self {
            PollState::Ready(p) => format!("ready: {}", p),
            PollState::NotReady(p) => format!("not ready yet: {}", p),
            PollState::TimedOut {
                last: last @ Probe::TimedOut { .. },
                elapsed,
                attempts,
            } => format!(
                "timed out after {:.1}s ({} attempts); last probe: {}. The process is accepting connections but not answering; it may be hung",
                elapsed.as_secs_f64(),
                attempts,
                last
            ),
            PollState::TimedOut {
                last,
                elapsed,
                attempts,
            } => format!(
                "timed out after {:.1}s ({} attempts); last probe: {}",
                elapsed.as_secs_f64(),
                attempts,
                last
            ),
        }
    }
}

/// Bounded polling schedule.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PollPolicy {
    pub timeout: Duration,
    pub interval: Duration,
    pub backoff: Backoff,
    pub max_interval: Duration,
}

impl PollPolicy {
    pub fn fixed(timeout: Duration, interval: Duration) -> Self {
        Self {
            timeout,
            interval,
            backoff: Backoff::Fixed,
            max_interval: interval,
        }
    }

    pub fn exponential(timeout: Duration, interval: Duration, max_interval: Duration) -> Self {
        Self {
            timeout,
            interval,
            backoff: Backoff::Exponential,
            max_interval: max_interval.max(interval),
        }
    }

    pub fn from_settings(settings: &HealthSettings) -> Self {
        let timeout = Duration::from_millis(settings.timeout_ms);
        let interval = Duration::from_millis(settings.interval_ms.max(1));
        match settings.backoff {
            Backoff::Fixed => Self::fixed(timeout, interval),
            Backoff::Exponential => {
                Self::exponential(timeout, interval, Duration::from_millis(settings.max_interval_ms))
            }
        }
    }

    pub fn next_interval(&self, current: Duration) -> Duration {
        match self.backoff {
            Backoff::Fixed => self.interval,
            Backoff::Exponential => current.saturating_mul(2).min(self.max_interval),
        }
    }
}

/// Runs probes. Cheap to clone (shares the HTTP client pool).
#[derive(Debug, Clone)]
pub struct HealthProber {
    client: reqwest::Client,
    probe_timeout: Duration,
}

impl HealthProber {
    pub fn new(probe_timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .timeout(probe_timeout)
            .connect_timeout(probe_timeout)
            .build()?;
        Ok(Self {
            client,
            probe_timeout,
        })
    }

    pub fn probe_timeout(&self) -> Duration {
        self.probe_timeout
    }

    pub async fn probe(&self, check: &HealthCheck) -> Probe {
        match check {
            HealthCheck::Http { url } => self.probe_http(url).await,
            HealthCheck::Redis { host, port } => self.probe_redis(host, *port).await,
            HealthCheck::Tcp { host, port } => self.probe_tcp(host, *port).await,
        }
    }

    /// One probe, classified as ready or not-ready-yet.
    pub async fn poll_once(&self, check: &HealthCheck) -> PollState {
        let probe = self.probe(check).await;
        if probe.is_ready() {
            PollState::Ready(probe)
        } else {
            PollState::NotReady(probe)
        }
    }

    /// Poll until ready or `policy.timeout` elapses. Never errors on an unhealthy service;
    /// only cancellation short-circuits.
    pub async fn wait_for_health(
        &self,
        check: &HealthCheck,
        policy: &PollPolicy,
        cancel: &CancellationToken,
    ) -> Result<PollState, Cancelled> {
        let started = Instant::now();
        let deadline = started + policy.timeout;
        let mut interval = policy.interval;
        let mut attempts = 0u32;

        loop {
            attempts += 1;
            let state = tokio::select! {
                _ = cancel.cancelled() => return Err(Cancelled),
                s = self.poll_once(check) => s,
            };
            let last = match state {
                PollState::Ready(_) => {
                    tracing::debug!(health_target = %check.target(), attempts, "health check passed");
                    return Ok(state);
                }
                PollState::NotReady(p) | PollState::TimedOut { last: p, .. } => p,
            };

            let now = Instant::now();
            if now >= deadline {
                return Ok(PollState::TimedOut {
                    last,
                    elapsed: now - started,
                    attempts,
                });
            }
            tracing::debug!(health_target = %check.target(), attempt = attempts, probe = %last, "not ready yet");

            let sleep_for = interval.min(deadline - now);
            tokio::select! {
                _ = cancel.cancelled() => return Err(Cancelled),
                _ = tokio::time::sleep(sleep_for) => {}
            }
            interval = policy.next_interval(interval);
        }
    }

    async fn probe_http(&self, url: &str) -> Probe {
        let response = match self.client.get(url).send().await {
            Ok(r) => r,
            Err(e) => return self.classify_reqwest(e),
        };
        let status = response.status();
        let body = match response.text().await {
            Ok(b) => b,
            Err(e) => return self.classify_reqwest(e),
        };
        let record = serde_json::from_str::<HealthRecord>(&body).ok();

        if !status.is_success() {
            return Probe::Unhealthy {
                status_code: Some(status.as_u16()),
                record,
                detail: crate::error::preview(&body, 200),
            };
        }

        match record {
            None => Probe::Healthy { record: None },
            Some(r) => match r.status {
                HealthStatus::Healthy => Probe::Healthy { record: Some(r) },
                HealthStatus::Degraded => Probe::Degraded { record: r },
                HealthStatus::Unhealthy | HealthStatus::Unknown => Probe::Unhealthy {
                    status_code: Some(status.as_u16()),
                    detail: format!("service reports status '{}'", r.status.as_str()),
                    record: Some(r),
                },
            },
        }
    }

    fn classify_reqwest(&self, e: reqwest::Error) -> Probe {
        if e.is_timeout() {
            Probe::TimedOut {
                after: self.probe_timeout,
            }
        } else {
            Probe::Unreachable {
                detail: e.to_string(),
            }
        }
    }

    /// RESP inline `PING`; mirrors `redis-cli ping`.
    async fn probe_redis(&self, host: &str, port: u16) -> Probe {
        let exchange = async {
            let mut stream = TcpStream::connect((host, port)).await?;
            stream.write_all(b"*1\r\n$4\r\nPING\r\n").await?;
            let mut buf = [0u8; 128];
            let n = stream.read(&mut buf).await?;
            Ok::<String, std::io::Error>(String::from_utf8_lossy(&buf[..n]).to_string())
        };

        match tokio::time::timeout(self.probe_timeout, exchange).await {
            Err(_) => Probe::TimedOut {
                after: self.probe_timeout,
            },
            Ok(Err(e)) => Probe::Unreachable {
                detail: e.to_string(),
            },
            Ok(Ok(reply)) if reply.starts_with("+PONG") => Probe::Healthy { record: None },
            Ok(Ok(reply)) => Probe::Unhealthy {
                status_code: None,
                record: None,
                detail: format!("unexpected PING reply: {}", reply.trim()),
            },
        }
    }

    async fn probe_tcp(&self, host: &str, port: u16) -> Probe {
        match tokio::time::timeout(self.probe_timeout, TcpStream::connect((host, port))).await {
            Err(_) => Probe::TimedOut {
                after: self.probe_timeout,
            },
            Ok(Err(e)) => Probe::Unreachable {
                detail: e.to_string(),
            },
            Ok(Ok(_)) => Probe::Healthy { record: None },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn health_record_keeps_capability_flags() {
        let rec: HealthRecord = serde_json::from_str(
            r#"{"status":"healthy","service":"prompt_engine","learning_enabled":true,"rag":false}"#,
        )
        .unwrap();
        assert_eq!(rec.status, HealthStatus::Healthy);
        assert_eq!(rec.service.as_deref(), Some("prompt_engine"));
        assert_eq!(rec.capabilities.get("learning_enabled"), Some(&serde_json::json!(true)));
        assert_eq!(rec.capabilities.len(), 2);
    }

    #[test]
    fn unrecognised_status_is_unknown() {
        let rec: HealthRecord = serde_json::from_str(r#"{"status":"starting"}"#).unwrap();
        assert_eq!(rec.status, HealthStatus::Unknown);
    }

    #[test]
    fn exponential_backoff_is_capped() {
        let policy = PollPolicy::exponential(
            Duration::from_secs(30),
            Duration::from_millis(250),
            Duration::from_secs(1),
        );
        let mut i = policy.interval;
        i = policy.next_interval(i);
        assert_eq!(i, Duration::from_millis(500));
        i = policy.next_interval(i);
        assert_eq!(i, Duration::from_secs(1));
        i = policy.next_interval(i);
        assert_eq!(i, Duration::from_secs(1));
    }

    #[test]
    fn fixed_backoff_never_grows() {
        let policy = PollPolicy::fixed(Duration::from_secs(5), Duration::from_millis(200));
        assert_eq!(policy.next_interval(Duration::from_millis(200)), Duration::from_millis(200));
    }

    #[test]
    fn degraded_is_ready_but_not_healthy() {
        let probe = Probe::Degraded {
            record: HealthRecord::new(HealthStatus::Degraded, "pseudonymization"),
        };
        assert!(probe.is_ready());
        assert!(!probe.reports_healthy());
    }

    #[test]
    fn hung_timeout_diagnosis_mentions_hang() {
        let state = PollState::TimedOut {
            last: Probe::TimedOut {
                after: Duration::from_millis(100),
            },
            elapsed: Duration::from_secs(2),
            attempts: 4,
        };
        assert!(!state.is_ready());
        assert!(state.diagnosis().contains("hung"));
    }
}
