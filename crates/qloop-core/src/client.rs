//! Timed, cancellable JSON client for the data-plane services.

use crate::config::HttpSettings;
use crate::error::{preview, VerifyError};
use crate::payload::{AnalysisRequest, AnalysisResponse, LearnResponse, LearningFeedback};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

const PREVIEW_CHARS: usize = 300;

/// Status and body of a completed request, before any interpretation.
#[derive(Debug, Clone)]
pub struct RawResponse {
    pub status: u16,
    pub body: String,
}

impl RawResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn preview(&self) -> String {
        preview(&self.body, PREVIEW_CHARS)
    }
}

#[derive(Debug, Clone)]
pub struct DataPlaneClient {
    http: reqwest::Client,
    request_timeout: Duration,
}

impl DataPlaneClient {
    pub fn new(settings: &HttpSettings) -> Result<Self, VerifyError> {
        let http = reqwest::Client::builder()
            .timeout(settings.request_timeout())
            .connect_timeout(settings.connect_timeout())
            .build()?;
        Ok(Self {
            http,
            request_timeout: settings.request_timeout(),
        })
    }

    /// POST `body` as JSON and return whatever came back, any status.
    pub async fn post_json<B: Serialize + ?Sized>(
        &self,
        endpoint: &str,
        body: &B,
        cancel: &CancellationToken,
    ) -> Result<RawResponse, VerifyError> {
        let exchange = async {
            let response = self.http.post(endpoint).json(body).send().await?;
            let status = response.status().as_u16();
            let body = response.text().await?;
            Ok::<_, reqwest::Error>(RawResponse { status, body })
        };

        let result = tokio::select! {
            _ = cancel.cancelled() => return Err(VerifyError::Cancelled),
            r = exchange => r,
        };

        result.map_err(|e| {
            if e.is_timeout() {
                VerifyError::TimedOut {
                    endpoint: endpoint.to_string(),
                    timeout_ms: self.request_timeout.as_millis() as u64,
                }
            } else {
                VerifyError::Http {
                    endpoint: endpoint.to_string(),
                    source: e,
                }
            }
        })
    }

    /// `POST {base}/analyze`. Non-2xx is [`VerifyError::Rejected`]. Only a 2xx body that is
    /// not JSON at all is returned as [`AnalysisReply::Unparsed`] so the caller can treat it as inconclusive.
    pub async fn analyze(
        &self,
        base_url: &str,
        request: &AnalysisRequest,
        cancel: &CancellationToken,
    ) -> Result<AnalysisReply, VerifyError> {
        let endpoint = join_url(base_url, "/analyze");
        let raw = self.post_json(&endpoint, request, cancel).await?;
        if !raw.is_success() {
            return Err(VerifyError::Rejected {
                endpoint,
                status: raw.status,
                preview: raw.preview(),
            });
        }
        Ok(match AnalysisResponse::from_body(&raw.body) {
            Ok(parsed) => AnalysisReply::Parsed { parsed, raw },
            Err(_) => AnalysisReply::Unparsed(raw),
        })
    }

    /// `POST {base}/learn`.
    pub async fn learn(
        &self,
        base_url: &str,
        feedback: &LearningFeedback,
        cancel: &CancellationToken,
    ) -> Result<LearnResponse, VerifyError> {
        let endpoint = join_url(base_url, "/learn");
        let raw = self.post_json(&endpoint, feedback, cancel).await?;
        if !raw.is_success() {
            return Err(VerifyError::Rejected {
                endpoint,
                status: raw.status,
                preview: raw.preview(),
            });
        }
        parse_json(&endpoint, &raw)
    }
}

#[derive(Debug, Clone)]
pub enum AnalysisReply {
    Parsed {
        parsed: AnalysisResponse,
        raw: RawResponse,
    },
    Unparsed(RawResponse),
}

impl AnalysisReply {
    pub fn raw(&self) -> &RawResponse {
        match self {
            AnalysisReply::Parsed { raw, .. } | AnalysisReply::Unparsed(raw) => raw,
        }
    }
}

fn parse_json<T: DeserializeOwned>(endpoint: &str, raw: &RawResponse) -> Result<T, VerifyError> {
    serde_json::from_str(&raw.body).map_err(|_| VerifyError::InvalidJson {
        endpoint: endpoint.to_string(),
        preview: raw.preview(),
    })
}

pub fn join_url(base: &str, path: &str) -> String {
    format!("{}{}", base.trim_end_matches('/'), path)
}
