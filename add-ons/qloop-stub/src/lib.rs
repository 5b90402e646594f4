//! Reference implementation of the data-plane HTTP contract for local runs.
//!
//! One binary plays any of the four service roles. The agent role learns implicitly from
//! every `/analyze` call, so repeating the same analysis scores higher each time; the
//! prompt-engine role accepts explicit `/learn` feedback and ignores duplicates.

use axum::extract::State;
use axum::routing::{get, post};
use axum::{Json, Router};
use qloop_core::{
    AnalysisRequest, HealthRecord, HealthStatus, LearnResponse, LearningFeedback,
};
use serde_json::{json, Map, Value};
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Score of the first analysis, before anything has been learned.
pub const BASE_SCORE: f64 = 0.71;
/// Added per learned example.
pub const LEARNING_STEP: f64 = 0.11;
pub const MAX_SCORE: f64 = 0.99;

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum Role {
    Agent,
    PromptEngine,
    Pseudonymization,
    Repersonalization,
}

impl Role {
    pub fn service_name(&self) -> &'static str {
        match self {
            Role::Agent => "autonomous_agent",
            Role::PromptEngine => "prompt_engine",
            Role::Pseudonymization => "pseudonymization",
            Role::Repersonalization => "repersonalization",
        }
    }

    pub fn default_port(&self) -> u16 {
        match self {
            Role::Agent => 5001,
            Role::PromptEngine => 5000,
            Role::Pseudonymization => 5003,
            Role::Repersonalization => 5004,
        }
    }
}

#[derive(Debug, Default)]
struct LearningState {
    learned: usize,
    fingerprints: HashSet<String>,
}

#[derive(Debug)]
pub struct StubState {
    role: Role,
    degraded: bool,
    learning: RwLock<LearningState>,
}

impl StubState {
    pub fn new(role: Role) -> Self {
        Self {
            role,
            degraded: false,
            learning: RwLock::new(LearningState::default()),
        }
    }

    /// Report `degraded` on `/health` (e.g. running on an in-memory store).
    pub fn degraded(mut self, degraded: bool) -> Self {
        self.degraded = degraded;
        self
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub async fn learned(&self) -> usize {
        self.learning.read().await.learned
    }
}

/// Score after `learned` examples, rounded to two decimals.
pub fn score_for(learned: usize) -> f64 {
    let raw = (BASE_SCORE + LEARNING_STEP * learned as f64).min(MAX_SCORE);
    (raw * 100.0).round() / 100.0
}

pub fn router(state: Arc<StubState>) -> Router {
    let mut router = Router::new().route("/health", get(health));
    router = match state.role {
        Role::Agent => router.route("/analyze", post(analyze)),
        Role::PromptEngine => router.route("/learn", post(learn)),
        Role::Pseudonymization | Role::Repersonalization => router,
    };
    router.with_state(state)
}

async fn health(State(state): State<Arc<StubState>>) -> Json<HealthRecord> {
    let status = if state.degraded {
        HealthStatus::Degraded
    } else {
        HealthStatus::Healthy
    };
    let record = HealthRecord::new(status, state.role.service_name());
    let record = match state.role {
        Role::Agent => record.with_flag("learning_enabled", true),
        Role::PromptEngine => record
            .with_flag("learning_enabled", true)
            .with_flag("rag_enabled", !state.degraded),
        Role::Pseudonymization | Role::Repersonalization => record.with_flag(
            "store",
            if state.degraded { "memory" } else { "redis" },
        ),
    };
    Json(record)
}

/// The body must be `{input_data: {...}}`; the JSON extractor answers 422 otherwise.
async fn analyze(
    State(state): State<Arc<StubState>>,
    Json(request): Json<AnalysisRequest>,
) -> Json<Value> {
    let score = {
        let mut learning = state.learning.write().await;
        let score = score_for(learning.learned);
        learning.learned += 1;
        score
    };
    tracing::info!(score, "📊 analysis scored");

    let (count, net) = summarize(&request.input_data);
    let recommendation = if net < 0.0 {
        "reduce discretionary spend"
    } else {
        "maintain current cash position"
    };
    let completeness = if count > 0 { 1.0 } else { 0.5 };
    Json(json!({
        "insights": [
            format!("{} transactions analyzed", count),
            format!("net flow {:.2}", net),
        ],
        "recommendations": [recommendation],
        "validation_result": {
            "overall_score": score,
            "criteria_scores": {
                "accuracy": score,
                "completeness": completeness,
            }
        },
        "learning": {"feedback_recorded": true},
    }))
}

async fn learn(
    State(state): State<Arc<StubState>>,
    Json(feedback): Json<LearningFeedback>,
) -> Json<LearnResponse> {
    let fingerprint = format!(
        "{}|{}",
        Value::Object(feedback.input_data.clone()),
        feedback.quality_score
    );
    let mut learning = state.learning.write().await;
    let fresh = learning.fingerprints.insert(fingerprint);
    if fresh {
        learning.learned += 1;
        tracing::info!(learned = learning.learned, "📝 feedback recorded");
    } else {
        tracing::info!("feedback already recorded; ignoring duplicate");
    }
    Json(LearnResponse {
        status: if fresh { "success" } else { "duplicate" }.to_string(),
        message: if fresh {
            "feedback recorded".to_string()
        } else {
            "feedback already recorded".to_string()
        },
        quality_improvement_active: true,
        validation_score: Some(feedback.validation_result.overall_score),
    })
}

fn summarize(input: &Map<String, Value>) -> (usize, f64) {
    let transactions = input
        .get("transactions")
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or_default();
    let net = transactions
        .iter()
        .filter_map(|t| t.get("amount").and_then(Value::as_f64))
        .sum::<f64>();
    (transactions.len(), net)
}
