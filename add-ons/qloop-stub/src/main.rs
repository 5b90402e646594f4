use clap::Parser;
use qloop_stub::{router, Role, StubState};
use std::sync::Arc;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

#[derive(Parser)]
#[command(name = "qloop-stub", version, about = "Stand-in data-plane service for local runs")]
struct Args {
    #[arg(long, value_enum)]
    role: Role,
    /// Defaults to the role's standard port.
    #[arg(long)]
    port: Option<u16>,
    #[arg(long, default_value = "127.0.0.1")]
    host: String,
    /// Report `degraded` on /health. Implied by PSEUDONYM_STORE=memory.
    #[arg(long)]
    degraded: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();
    let memory_store = std::env::var("PSEUDONYM_STORE")
        .map(|v| v.eq_ignore_ascii_case("memory"))
        .unwrap_or(false);
    let state = Arc::new(StubState::new(args.role).degraded(args.degraded || memory_store));
    let port = args.port.unwrap_or_else(|| args.role.default_port());

    let listener = tokio::net::TcpListener::bind((args.host.as_str(), port)).await?;
    tracing::info!(
        "🚀 {} stub listening on http://{}",
        args.role.service_name(),
        listener.local_addr()?
    );

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("🛑 Shutting down");
        })
        .await?;
    Ok(())
}
