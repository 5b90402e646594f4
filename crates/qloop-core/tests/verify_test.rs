//! Integration test: verification workflow against a scripted mock agent.

mod common;

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use common::serve;
use qloop_core::{
    CancellationToken, Comparison, FeedbackOutcome, QloopConfig, RunObservation,
    VerificationWorkflow, VerifyError,
};
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Clone)]
struct MockStack {
    health: Value,
    replies: Arc<Mutex<VecDeque<(StatusCode, String)>>>,
    analyze_delay: Duration,
    learn_calls: Arc<AtomicUsize>,
}

impl MockStack {
    fn new(replies: Vec<(StatusCode, String)>) -> Self {
        Self {
            health: json!({"status": "healthy", "service": "mock"}),
            replies: Arc::new(Mutex::new(replies.into())),
            analyze_delay: Duration::ZERO,
            learn_calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    async fn serve(self) -> String {
        let router = Router::new()
            .route("/health", get(health))
            .route("/analyze", post(analyze))
            .route("/learn", post(learn))
            .with_state(self);
        serve(router).await
    }
}

async fn health(State(stack): State<MockStack>) -> Json<Value> {
    Json(stack.health.clone())
}

async fn analyze(State(stack): State<MockStack>, Json(body): Json<Value>) -> (StatusCode, String) {
    tokio::time::sleep(stack.analyze_delay).await;
    if body.get("input_data").is_none() {
        return (
            StatusCode::UNPROCESSABLE_ENTITY,
            json!({"detail": "field required: input_data"}).to_string(),
        );
    }
    let next = stack.replies.lock().unwrap().pop_front();
    next.unwrap_or((StatusCode::OK, "{}".to_string()))
}

async fn learn(State(stack): State<MockStack>) -> Json<Value> {
    stack.learn_calls.fetch_add(1, Ordering::SeqCst);
    Json(json!({
        "status": "success",
        "message": "feedback recorded",
        "quality_improvement_active": true,
        "validation_score": 0.71
    }))
}

fn scored(score: f64) -> (StatusCode, String) {
    (
        StatusCode::OK,
        json!({
            "insights": ["steady revenue"],
            "recommendations": ["reduce hosting spend"],
            "validation_result": {"overall_score": score, "criteria_scores": {"accuracy": score}}
        })
        .to_string(),
    )
}

fn config_for(base: &str) -> QloopConfig {
    let mut config = QloopConfig::defaults().unwrap();
    config.verify.agent_url = base.to_string();
    config.verify.prompt_engine_url = base.to_string();
    config.verify.delay_ms = 10;
    config.http.request_timeout_ms = 2_000;
    config.health.probe_timeout_ms = 1_000;
    config
}

#[tokio::test]
async fn improvement_is_detected() {
    let base = MockStack::new(vec![scored(0.71), scored(0.82)]).serve().await;
    let workflow = VerificationWorkflow::new(&config_for(&base)).unwrap();

    let report = workflow.run(&CancellationToken::new()).await.unwrap();
    assert_eq!(report.exit_code(), 0);
    match report.comparison {
        Comparison::Improved { first, second, delta, percent } => {
            assert_eq!(first, 0.71);
            assert_eq!(second, 0.82);
            assert!((delta - 0.11).abs() < 1e-9);
            assert!((percent.unwrap() - 15.49).abs() < 0.01);
        }
        other => panic!("expected improvement, got {:?}", other),
    }
    assert_eq!(report.preflight.len(), 2);
    assert!(report.feedback.is_none());
}

#[tokio::test]
async fn equal_scores_fail() {
    let base = MockStack::new(vec![scored(0.75), scored(0.75)]).serve().await;
    let workflow = VerificationWorkflow::new(&config_for(&base)).unwrap();
    let report = workflow.run(&CancellationToken::new()).await.unwrap();
    assert!(matches!(report.comparison, Comparison::NotImproved { .. }));
    assert_eq!(report.exit_code(), 1);
}

#[tokio::test]
async fn missing_score_is_inconclusive() {
    let base = MockStack::new(vec![scored(0.7), (StatusCode::OK, json!({"insights": []}).to_string())])
        .serve()
        .await;
    let workflow = VerificationWorkflow::new(&config_for(&base)).unwrap();
    let report = workflow.run(&CancellationToken::new()).await.unwrap();

    assert!(matches!(report.second.observation, RunObservation::Inconclusive { .. }));
    match &report.comparison {
        Comparison::Inconclusive { reason } => assert!(reason.contains("missing")),
        other => panic!("expected inconclusive, got {:?}", other),
    }
    assert_eq!(report.exit_code(), 1);
}

#[tokio::test]
async fn non_json_reply_is_inconclusive() {
    let base = MockStack::new(vec![(StatusCode::OK, "<html>oops</html>".to_string()), scored(0.8)])
        .serve()
        .await;
    let workflow = VerificationWorkflow::new(&config_for(&base)).unwrap();
    let report = workflow.run(&CancellationToken::new()).await.unwrap();
    match &report.first.observation {
        RunObservation::Inconclusive { preview, .. } => assert!(preview.contains("oops")),
        other => panic!("expected inconclusive, got {:?}", other),
    }
}

#[tokio::test]
async fn odd_criteria_shape_keeps_the_score() {
    let null_criteria = |score: f64| {
        (
            StatusCode::OK,
            json!({"validation_result": {"overall_score": score, "criteria_scores": null}})
                .to_string(),
        )
    };
    let base = MockStack::new(vec![null_criteria(0.71), null_criteria(0.82)])
        .serve()
        .await;
    let workflow = VerificationWorkflow::new(&config_for(&base)).unwrap();
    let report = workflow.run(&CancellationToken::new()).await.unwrap();

    assert_eq!(report.first.observation.score(), Some(0.71));
    assert!(report.comparison.is_improved());
    assert_eq!(report.exit_code(), 0);
}

#[tokio::test]
async fn envelope_check_scores_reply_with_list_criteria() {
    let reply = (
        StatusCode::OK,
        json!({"validation_result": {"overall_score": 0.66, "criteria_scores": [0.6, 0.7]}})
            .to_string(),
    );
    let base = MockStack::new(vec![reply]).serve().await;
    let workflow = VerificationWorkflow::new(&config_for(&base)).unwrap();
    let check = workflow
        .check_envelope_contract(&CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(check.wrapped_score, Some(0.66));
    assert!(check.holds);
}

#[tokio::test]
async fn rejected_analysis_is_a_hard_failure() {
    let base = MockStack::new(vec![(
        StatusCode::UNPROCESSABLE_ENTITY,
        json!({"detail": "bad payload"}).to_string(),
    )])
    .serve()
    .await;
    let workflow = VerificationWorkflow::new(&config_for(&base)).unwrap();
    match workflow.run(&CancellationToken::new()).await {
        Err(VerifyError::Rejected { status, preview, .. }) => {
            assert_eq!(status, 422);
            assert!(preview.contains("bad payload"));
        }
        other => panic!("expected rejection, got {:?}", other.map(|r| r.comparison)),
    }
}

#[tokio::test]
async fn degraded_service_refuses_to_verify() {
    let mut stack = MockStack::new(vec![scored(0.7), scored(0.8)]);
    stack.health = json!({"status": "degraded", "service": "prompt_engine"});
    let base = stack.serve().await;
    let workflow = VerificationWorkflow::new(&config_for(&base)).unwrap();
    match workflow.run(&CancellationToken::new()).await {
        Err(VerifyError::ServiceNotReady { service, observation }) => {
            assert_eq!(service, "prompt_engine");
            assert!(observation.contains("degraded"));
        }
        other => panic!("expected ServiceNotReady, got {:?}", other.map(|r| r.comparison)),
    }
}

#[tokio::test]
async fn slow_agent_times_out() {
    let mut stack = MockStack::new(vec![scored(0.7)]);
    stack.analyze_delay = Duration::from_secs(3);
    let base = stack.serve().await;
    let mut config = config_for(&base);
    config.http.request_timeout_ms = 200;
    let workflow = VerificationWorkflow::new(&config).unwrap();
    assert!(matches!(
        workflow.run(&CancellationToken::new()).await,
        Err(VerifyError::TimedOut { timeout_ms: 200, .. })
    ));
}

#[tokio::test]
async fn cancellation_during_delay_aborts() {
    let base = MockStack::new(vec![scored(0.7), scored(0.8)]).serve().await;
    let mut config = config_for(&base);
    config.verify.delay_ms = 30_000;
    let workflow = VerificationWorkflow::new(&config).unwrap();

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(300)).await;
        trigger.cancel();
    });
    assert!(matches!(workflow.run(&cancel).await, Err(VerifyError::Cancelled)));
}

#[tokio::test]
async fn explicit_feedback_posts_to_learn() {
    let stack = MockStack::new(vec![scored(0.71), scored(0.82)]);
    let learn_calls = stack.learn_calls.clone();
    let base = stack.serve().await;
    let mut config = config_for(&base);
    config.verify.explicit_feedback = true;
    let workflow = VerificationWorkflow::new(&config).unwrap();

    let report = workflow.run(&CancellationToken::new()).await.unwrap();
    assert_eq!(learn_calls.load(Ordering::SeqCst), 1);
    assert_eq!(
        report.feedback,
        Some(FeedbackOutcome::Accepted {
            status: "success".to_string(),
            quality_improvement_active: true
        })
    );
}

#[tokio::test]
async fn envelope_contract_holds_for_wrapping_agent() {
    let base = MockStack::new(vec![scored(0.66)]).serve().await;
    let workflow = VerificationWorkflow::new(&config_for(&base)).unwrap();
    let check = workflow
        .check_envelope_contract(&CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(check.raw_status, 422);
    assert_eq!(check.wrapped_status, 200);
    assert_eq!(check.wrapped_score, Some(0.66));
    assert!(check.holds);
}

#[tokio::test]
async fn report_serializes_for_json_output() {
    let base = MockStack::new(vec![scored(0.5), scored(0.6)]).serve().await;
    let workflow = VerificationWorkflow::new(&config_for(&base)).unwrap();
    let report = workflow.run(&CancellationToken::new()).await.unwrap();
    let value = serde_json::to_value(&report).unwrap();
    assert_eq!(value["comparison"]["verdict"], "improved");
    assert_eq!(value["first"]["outcome"], "scored");
    assert_eq!(value["second"]["run"], 2);
}
