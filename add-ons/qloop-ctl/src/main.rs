//! qloop-ctl: operator CLI for the local analysis stack.
//!
//! Starts and stops Redis, Qdrant, Ollama and the data-plane services in dependency order,
//! waits on their health, and runs the quality-improvement verification.

mod prompt;
mod render;

use clap::{Parser, Subcommand};
use qloop_core::{
    CancellationToken, ConfigError, LifecycleController, QloopConfig, VerificationWorkflow,
};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

type CliResult = Result<u8, Box<dyn std::error::Error + Send + Sync>>;

#[derive(Parser)]
#[command(name = "qloop-ctl", version, about = "Start, stop and verify the local analysis stack")]
struct Cli {
    /// Config file (overrides QLOOP_CONFIG).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start services (default: all) in dependency order and wait for health.
    Start {
        /// Service names or groups: dependencies, data-plane, all.
        services: Vec<String>,
        /// Offer degraded mode when a requirement is unavailable.
        #[arg(long)]
        allow_degraded: bool,
        /// Accept degraded mode without prompting.
        #[arg(short, long)]
        yes: bool,
    },
    /// Stop services (default: all). Nothing running is not an error.
    Stop { services: Vec<String> },
    /// Stop, wait for the port to free, start and wait for health.
    Restart { service: String },
    /// Port, health and registry entry for every service.
    Status {
        #[arg(long)]
        json: bool,
    },
    /// Poll one service's health until ready or timed out.
    Wait {
        service: String,
        #[arg(long)]
        timeout_ms: Option<u64>,
        #[arg(long)]
        interval_ms: Option<u64>,
    },
    /// Run the two-call quality-improvement check.
    Verify {
        #[arg(long)]
        json: bool,
        #[arg(long)]
        delay_ms: Option<u64>,
        /// JSON dataset file (default: built-in sample).
        #[arg(long)]
        dataset: Option<PathBuf>,
        /// POST the first run's feedback to the prompt engine's /learn.
        #[arg(long)]
        explicit_feedback: bool,
    },
    /// Check that /analyze rejects an unwrapped dataset and scores a wrapped one.
    Contract {
        #[arg(long)]
        dataset: Option<PathBuf>,
        #[arg(long)]
        json: bool,
    },
    /// Print the effective configuration as TOML.
    Config,
}

#[tokio::main]
async fn main() -> ExitCode {
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();

    let config = match load_config(cli.config.as_deref()) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("❌ Configuration error: {}", e);
            return ExitCode::from(1);
        }
    };
    let _log_guard = init_logging(&config.log_dir);

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("🛑 Ctrl-C received, cancelling");
            trigger.cancel();
        }
    });

    match run(cli.command, config, &cancel).await {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            tracing::error!(error = %e, "command failed");
            eprintln!("❌ {}", e);
            ExitCode::from(1)
        }
    }
}

fn load_config(path: Option<&Path>) -> Result<QloopConfig, ConfigError> {
    match path {
        Some(p) => QloopConfig::load_from(Some(p)),
        None => QloopConfig::load(),
    }
}

/// Console on stderr (stdout is for reports) plus `qloop-ctl.log` in the log directory.
fn init_logging(log_dir: &Path) -> Option<WorkerGuard> {
    let filter = tracing_subscriber::EnvFilter::new(
        std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
    );
    let (file_layer, guard) = match std::fs::create_dir_all(log_dir) {
        Ok(()) => {
            let appender = tracing_appender::rolling::never(log_dir, "qloop-ctl.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = tracing_subscriber::fmt::layer()
                .with_writer(writer)
                .with_ansi(false);
            (Some(layer), Some(guard))
        }
        Err(_) => (None, None),
    };
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(file_layer)
        .init();
    guard
}

async fn run(command: Command, mut config: QloopConfig, cancel: &CancellationToken) -> CliResult {
    match command {
        Command::Start {
            services,
            allow_degraded,
            yes,
        } => {
            let mut ctl = LifecycleController::from_config(config)?;
            let selection = ctl.resolve_selection(&services)?;
            let mut consent = |service: &str, missing: &[String]| -> bool {
                if !allow_degraded {
                    return false;
                }
                if yes {
                    return true;
                }
                prompt::confirm_degraded_or_cancel(service, missing, cancel)
            };
            let report = ctl.start_all(&selection, &mut consent, cancel).await?;
            print!("{}", render::start_report(&report, allow_degraded));
            Ok(if report.all_ready() { 0 } else { 1 })
        }
        Command::Stop { services } => {
            let mut ctl = LifecycleController::from_config(config)?;
            let selection = ctl.resolve_selection(&services)?;
            let results = ctl.stop_all(&selection).await?;
            print!("{}", render::stop_results(&results));
            Ok(0)
        }
        Command::Restart { service } => {
            let mut ctl = LifecycleController::from_config(config)?;
            let (stopped, ensure, state) = ctl.restart(&service, cancel).await?;
            print!("{}", render::restart(&service, &stopped, &ensure, &state));
            Ok(if state.is_ready() { 0 } else { 1 })
        }
        Command::Status { json } => {
            let ctl = LifecycleController::from_config(config)?;
            let statuses = ctl.status().await;
            if json {
                println!("{}", serde_json::to_string_pretty(&render::status_json(&statuses))?);
            } else {
                print!("{}", render::status_table(&statuses));
            }
            Ok(0)
        }
        Command::Wait {
            service,
            timeout_ms,
            interval_ms,
        } => {
            if let Some(t) = timeout_ms {
                config.health.timeout_ms = t;
            }
            if let Some(i) = interval_ms {
                config.health.interval_ms = i;
            }
            let ctl = LifecycleController::from_config(config)?;
            let state = ctl.wait_for_health(&service, cancel).await?;
            println!("{}: {}", service, state.diagnosis());
            Ok(if state.is_ready() { 0 } else { 1 })
        }
        Command::Verify {
            json,
            delay_ms,
            dataset,
            explicit_feedback,
        } => {
            if let Some(d) = delay_ms {
                config.verify.delay_ms = d;
            }
            if dataset.is_some() {
                config.verify.dataset_path = dataset;
            }
            config.verify.explicit_feedback |= explicit_feedback;

            let workflow = VerificationWorkflow::new(&config)?;
            let report = workflow.run(cancel).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                print!("{}", render::verification(&report));
            }
            Ok(report.exit_code())
        }
        Command::Contract { dataset, json } => {
            if dataset.is_some() {
                config.verify.dataset_path = dataset;
            }
            let workflow = VerificationWorkflow::new(&config)?;
            let check = workflow.check_envelope_contract(cancel).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&check)?);
            } else {
                print!("{}", render::envelope(&check));
            }
            Ok(if check.holds { 0 } else { 1 })
        }
        Command::Config => {
            print!("{}", toml::to_string_pretty(&config)?);
            Ok(0)
        }
    }
}
