//! Quality-improvement verification.
//!
//! Two identical analyses of the same dataset, separated by a delay, must show a
//! strictly higher `validation_result.overall_score` the second time. The workflow
//! refuses to start unless both the prompt engine and the agent report `healthy`.

use crate::client::{join_url, AnalysisReply, DataPlaneClient};
use crate::config::{HealthCheck, QloopConfig, VerifySettings};
use crate::error::{preview, VerifyError};
use crate::health::{HealthProber, Probe};
use crate::payload::{sample_dataset, AnalysisRequest, AnalysisResponse, LearningFeedback, Score};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::time::Instant;
use tokio_util::sync::CancellationToken;

pub const PROMPT_ENGINE: &str = "prompt_engine";
pub const AUTONOMOUS_AGENT: &str = "autonomous_agent";

const PREVIEW_CHARS: usize = 300;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RunObservation {
    Scored {
        score: f64,
        elapsed_ms: u64,
    },
    /// The run completed but yielded no usable score.
    Inconclusive {
        reason: String,
        preview: String,
        elapsed_ms: u64,
    },
}

impl RunObservation {
    pub fn score(&self) -> Option<f64> {
        match self {
            RunObservation::Scored { score, .. } => Some(*score),
            RunObservation::Inconclusive { .. } => None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RunRecord {
    pub run: u8,
    pub started_at: DateTime<Utc>,
    #[serde(flatten)]
    pub observation: RunObservation,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "verdict", rename_all = "snake_case")]
pub enum Comparison {
    Improved {
        first: f64,
        second: f64,
        delta: f64,
        #[serde(skip_serializing_if = "Option::is_none")]
        percent: Option<f64>,
    },
    NotImproved {
        first: f64,
        second: f64,
        delta: f64,
        #[serde(skip_serializing_if = "Option::is_none")]
        percent: Option<f64>,
    },
    Inconclusive {
        reason: String,
    },
}

impl Comparison {
    /// Strict: equal scores are not an improvement. `percent` is absent when `first` is zero.
    pub fn from_scores(first: f64, second: f64) -> Self {
        let delta = second - first;
        let percent = (first != 0.0).then(|| 100.0 * delta / first);
        if second > first {
            Comparison::Improved {
                first,
                second,
                delta,
                percent,
            }
        } else {
            Comparison::NotImproved {
                first,
                second,
                delta,
                percent,
            }
        }
    }

    pub fn from_runs(first: &RunObservation, second: &RunObservation) -> Self {
        match (first, second) {
            (RunObservation::Scored { score: a, .. }, RunObservation::Scored { score: b, .. }) => {
                Self::from_scores(*a, *b)
            }
            (RunObservation::Inconclusive { reason, .. }, _) => Comparison::Inconclusive {
                reason: format!("first run: {}", reason),
            },
            (_, RunObservation::Inconclusive { reason, .. }) => Comparison::Inconclusive {
                reason: format!("second run: {}", reason),
            },
        }
    }

    pub fn is_improved(&self) -> bool {
        matches!(self, Comparison::Improved { .. })
    }

    pub fn exit_code(&self) -> u8 {
        if self.is_improved() {
            0
        } else {
            1
        }
    }
}

/// What happened to the optional explicit `/learn` call.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum FeedbackOutcome {
    Accepted {
        status: String,
        quality_improvement_active: bool,
    },
    Skipped {
        reason: String,
    },
    Failed {
        error: String,
    },
}

#[derive(Debug, Clone, Serialize)]
pub struct ServiceObservation {
    pub service: String,
    pub observation: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct VerificationReport {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub agent_url: String,
    pub delay_ms: u64,
    pub preflight: Vec<ServiceObservation>,
    pub first: RunRecord,
    pub second: RunRecord,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub feedback: Option<FeedbackOutcome>,
    pub comparison: Comparison,
}

impl VerificationReport {
    pub fn exit_code(&self) -> u8 {
        self.comparison.exit_code()
    }
}

/// Result of probing `/analyze` with the raw and the wrapped dataset.
#[derive(Debug, Clone, Serialize)]
pub struct EnvelopeCheck {
    pub raw_status: u16,
    pub raw_preview: String,
    pub wrapped_status: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub wrapped_score: Option<f64>,
    pub wrapped_detail: String,
    /// Raw rejected with 4xx and wrapped accepted with a score in [0, 1].
    pub holds: bool,
}

pub struct VerificationWorkflow {
    client: DataPlaneClient,
    prober: HealthProber,
    settings: VerifySettings,
}

impl VerificationWorkflow {
    pub fn new(config: &QloopConfig) -> Result<Self, VerifyError> {
        Ok(Self {
            client: DataPlaneClient::new(&config.http)?,
            prober: HealthProber::new(config.health.probe_timeout())?,
            settings: config.verify.clone(),
        })
    }

    pub fn settings(&self) -> &VerifySettings {
        &self.settings
    }

    pub fn settings_mut(&mut self) -> &mut VerifySettings {
        &mut self.settings
    }

    /// One probe of each required service. Anything but `healthy` refuses to proceed.
    pub async fn preflight(
        &self,
        cancel: &CancellationToken,
    ) -> Result<Vec<ServiceObservation>, VerifyError> {
        let targets = [
            (PROMPT_ENGINE, &self.settings.prompt_engine_url),
            (AUTONOMOUS_AGENT, &self.settings.agent_url),
        ];
        let mut observations = Vec::with_capacity(targets.len());
        for (service, base) in targets {
            let check = HealthCheck::Http {
                url: join_url(base, "/health"),
            };
            let probe: Probe = tokio::select! {
                _ = cancel.cancelled() => return Err(VerifyError::Cancelled),
                p = self.prober.probe(&check) => p,
            };
            if !probe.reports_healthy() {
                tracing::error!(service, probe = %probe, "❌ {} is not healthy", service);
                return Err(VerifyError::ServiceNotReady {
                    service: service.to_string(),
                    observation: probe.to_string(),
                });
            }
            tracing::info!(service, "✅ {} healthy", service);
            observations.push(ServiceObservation {
                service: service.to_string(),
                observation: probe.to_string(),
            });
        }
        Ok(observations)
    }

    /// Dataset from `dataset_path` or the built-in sample, wrapped under `input_data`.
    pub fn load_dataset(&self) -> Result<AnalysisRequest, VerifyError> {
        let dataset = match &self.settings.dataset_path {
            Some(path) => read_dataset(path)?,
            None => sample_dataset(),
        };
        let path = self
            .settings
            .dataset_path
            .as_deref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "<built-in sample>".to_string());
        AnalysisRequest::wrap(dataset).map_err(|reason| VerifyError::Dataset { path, reason })
    }

    pub async fn run(&self, cancel: &CancellationToken) -> Result<VerificationReport, VerifyError> {
        let started_at = Utc::now();
        let preflight = self.preflight(cancel).await?;
        let request = self.load_dataset()?;

        tracing::info!(agent = %self.settings.agent_url, "🔍 First analysis");
        let (first, first_reply) = self.analyze_once(1, &request, cancel).await?;

        let feedback = if self.settings.explicit_feedback {
            Some(self.send_feedback(&request, first_reply.as_ref(), cancel).await?)
        } else {
            None
        };

        tracing::info!(delay_ms = self.settings.delay_ms, "⏳ Waiting before second analysis");
        tokio::select! {
            _ = cancel.cancelled() => return Err(VerifyError::Cancelled),
            _ = tokio::time::sleep(self.settings.delay()) => {}
        }

        tracing::info!(agent = %self.settings.agent_url, "🔍 Second analysis");
        let (second, _) = self.analyze_once(2, &request, cancel).await?;

        let comparison = Comparison::from_runs(&first.observation, &second.observation);
        match &comparison {
            Comparison::Improved { delta, .. } => {
                tracing::info!(delta, "✅ Quality improved")
            }
            Comparison::NotImproved { delta, .. } => {
                tracing::warn!(delta, "❌ Quality did not improve")
            }
            Comparison::Inconclusive { reason } => {
                tracing::warn!(reason = %reason, "⚠️ Verification inconclusive")
            }
        }

        Ok(VerificationReport {
            started_at,
            finished_at: Utc::now(),
            agent_url: self.settings.agent_url.clone(),
            delay_ms: self.settings.delay_ms,
            preflight,
            first,
            second,
            feedback,
            comparison,
        })
    }

    /// Raw dataset must be rejected with 4xx; the wrapped one must come back with a score.
    pub async fn check_envelope_contract(
        &self,
        cancel: &CancellationToken,
    ) -> Result<EnvelopeCheck, VerifyError> {
        let request = self.load_dataset()?;
        let endpoint = join_url(&self.settings.agent_url, "/analyze");

        let raw = self
            .client
            .post_json(&endpoint, &request.input_data, cancel)
            .await?;
        let wrapped = self.client.post_json(&endpoint, &request, cancel).await?;

        let score = if wrapped.is_success() {
            AnalysisResponse::from_body(&wrapped.body)
                .map(|r| r.score())
                .unwrap_or_else(|_| Score::NonNumeric(wrapped.preview()))
        } else {
            Score::Missing
        };
        let wrapped_detail = if wrapped.is_success() {
            score.describe()
        } else {
            wrapped.preview()
        };
        let holds = (400..500).contains(&raw.status) && score.value().is_some();

        Ok(EnvelopeCheck {
            raw_status: raw.status,
            raw_preview: raw.preview(),
            wrapped_status: wrapped.status,
            wrapped_score: score.value(),
            wrapped_detail,
            holds,
        })
    }

    async fn analyze_once(
        &self,
        run: u8,
        request: &AnalysisRequest,
        cancel: &CancellationToken,
    ) -> Result<(RunRecord, Option<AnalysisResponse>), VerifyError> {
        let started_at = Utc::now();
        let clock = Instant::now();
        let reply = self
            .client
            .analyze(&self.settings.agent_url, request, cancel)
            .await?;
        let elapsed_ms = clock.elapsed().as_millis() as u64;

        let (observation, parsed) = match reply {
            AnalysisReply::Parsed { parsed, raw } => {
                let observation = match parsed.score() {
                    Score::Present(score) => RunObservation::Scored { score, elapsed_ms },
                    other => RunObservation::Inconclusive {
                        reason: other.describe(),
                        preview: raw.preview(),
                        elapsed_ms,
                    },
                };
                (observation, Some(parsed))
            }
            AnalysisReply::Unparsed(raw) => (
                RunObservation::Inconclusive {
                    reason: "response is not JSON".to_string(),
                    preview: preview(&raw.body, PREVIEW_CHARS),
                    elapsed_ms,
                },
                None,
            ),
        };

        match &observation {
            RunObservation::Scored { score, .. } => {
                tracing::info!(run, score, elapsed_ms, "📊 Run {} score: {:.4}", run, score)
            }
            RunObservation::Inconclusive { reason, .. } => {
                tracing::warn!(run, reason = %reason, "⚠️ Run {} produced no score", run)
            }
        }

        Ok((
            RunRecord {
                run,
                started_at,
                observation,
            },
            parsed,
        ))
    }

    async fn send_feedback(
        &self,
        request: &AnalysisRequest,
        first: Option<&AnalysisResponse>,
        cancel: &CancellationToken,
    ) -> Result<FeedbackOutcome, VerifyError> {
        let Some(feedback) = first.and_then(|r| LearningFeedback::from_analysis(request, r)) else {
            return Ok(FeedbackOutcome::Skipped {
                reason: "first run has no score".to_string(),
            });
        };
        match self
            .client
            .learn(&self.settings.prompt_engine_url, &feedback, cancel)
            .await
        {
            Ok(resp) => {
                tracing::info!(status = %resp.status, "📝 Feedback submitted");
                Ok(FeedbackOutcome::Accepted {
                    status: resp.status,
                    quality_improvement_active: resp.quality_improvement_active,
                })
            }
            Err(VerifyError::Cancelled) => Err(VerifyError::Cancelled),
            Err(e) => {
                tracing::warn!(error = %e, "feedback submission failed; continuing");
                Ok(FeedbackOutcome::Failed {
                    error: e.to_string(),
                })
            }
        }
    }
}

fn read_dataset(path: &Path) -> Result<serde_json::Value, VerifyError> {
    let display = PathBuf::from(path).display().to_string();
    let content = std::fs::read_to_string(path).map_err(|e| VerifyError::Dataset {
        path: display.clone(),
        reason: e.to_string(),
    })?;
    serde_json::from_str(&content).map_err(|e| VerifyError::Dataset {
        path: display,
        reason: e.to_string(),
    })
}
