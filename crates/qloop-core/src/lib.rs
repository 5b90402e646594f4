//! qloop-core: lifecycle controller for the local analysis stack (Redis, Qdrant, Ollama and
//! the four data-plane services) plus the quality-improvement verification workflow.
//!
//! The CLI (`qloop-ctl`) and the contract stub (`qloop-stub`) both build on this crate.

mod client;
mod config;
mod error;
mod health;
mod lifecycle;
mod payload;
mod process;
mod registry;
mod verify;

// Configuration
pub use config::{
    Backoff, DockerLaunch, HealthCheck, HealthSettings, HttpSettings, Launch, ProcessLaunch,
    QloopConfig, ServiceSpec, Tier, VerifySettings, DEFAULT_CONFIG, QDRANT_SERVICE,
};
pub use ::config::ConfigError;

// Errors
pub use error::{preview, Cancelled, LifecycleError, VerifyError};

// Health probing and polling
pub use health::{HealthProber, HealthRecord, HealthStatus, PollPolicy, PollState, Probe};

// Process seam and registry
pub use process::{find_on_path, CommandOutput, LaunchRequest, ProcessHost, SystemHost};
pub use registry::{ProcessRegistry, RegistryEntry, REGISTRY_FILE};

// Lifecycle
pub use lifecycle::{
    EnsureOutcome, LifecycleController, ServiceReport, ServiceStatus, StartOutcome, StartReport,
    StopOutcome,
};

// Data-plane wire types and client
pub use client::{join_url, AnalysisReply, DataPlaneClient, RawResponse};
pub use payload::{
    sample_dataset, AnalysisRequest, AnalysisResponse, LearnResponse, LearningFeedback, Score,
    ValidationResult, ValidationSummary,
};

// Verification
pub use verify::{
    Comparison, EnvelopeCheck, FeedbackOutcome, RunObservation, RunRecord, ServiceObservation,
    VerificationReport, VerificationWorkflow, AUTONOMOUS_AGENT, PROMPT_ENGINE,
};

/// Re-exported so callers can build cancellation tokens without a direct dependency.
pub use tokio_util::sync::CancellationToken;
