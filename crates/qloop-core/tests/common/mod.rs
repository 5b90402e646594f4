//! Shared fixtures: an in-memory process host and axum mock servers.

#![allow(dead_code)]

use async_trait::async_trait;
use axum::http::StatusCode;
use axum::routing::get;
use axum::{Json, Router};
use qloop_core::{
    CommandOutput, HealthCheck, Launch, LaunchRequest, ProcessHost, ProcessLaunch, QloopConfig,
    ServiceSpec, Tier,
};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

#[derive(Default)]
struct FakeState {
    bound: BTreeSet<u16>,
    spawned: Vec<LaunchRequest>,
    running: Vec<(String, Option<u16>)>,
    commands: Vec<Vec<String>>,
}

/// Process host that launches nothing. A spawned program binds the port registered for it
/// in `ports_by_program`; `kill_matching` unbinds it again.
pub struct FakeHost {
    state: Mutex<FakeState>,
    programs: BTreeSet<String>,
    ports_by_program: BTreeMap<String, u16>,
    docker_available: bool,
}

impl FakeHost {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(FakeState::default()),
            programs: BTreeSet::new(),
            ports_by_program: BTreeMap::new(),
            docker_available: true,
        }
    }

    /// `program` is on PATH and binds `port` once spawned.
    pub fn with_program(mut self, program: &str, port: u16) -> Self {
        self.programs.insert(program.to_string());
        self.ports_by_program.insert(program.to_string(), port);
        self
    }

    pub fn without_docker(mut self) -> Self {
        self.docker_available = false;
        self
    }

    /// Something unrelated already holds `port`, matched by `cmdline` on stop.
    pub fn occupy(&self, port: u16, cmdline: &str) {
        let mut state = self.state.lock().unwrap();
        state.bound.insert(port);
        state.running.push((cmdline.to_string(), Some(port)));
    }

    pub fn spawn_count(&self) -> usize {
        self.state.lock().unwrap().spawned.len()
    }

    pub fn last_spawn(&self) -> Option<LaunchRequest> {
        self.state.lock().unwrap().spawned.last().cloned()
    }

    pub fn commands(&self) -> Vec<Vec<String>> {
        self.state.lock().unwrap().commands.clone()
    }
}

#[async_trait]
impl ProcessHost for FakeHost {
    async fn port_in_use(&self, port: u16) -> bool {
        self.state.lock().unwrap().bound.contains(&port)
    }

    fn resolve_program(&self, program: &str) -> Option<PathBuf> {
        self.programs
            .contains(program)
            .then(|| PathBuf::from("/usr/bin").join(program))
    }

    fn spawn_detached(&self, request: &LaunchRequest, _log_path: &Path) -> std::io::Result<u32> {
        let mut state = self.state.lock().unwrap();
        let port = self.ports_by_program.get(&request.program).copied();
        if let Some(port) = port {
            state.bound.insert(port);
        }
        let cmdline = std::iter::once(request.program.clone())
            .chain(request.args.iter().cloned())
            .collect::<Vec<_>>()
            .join(" ");
        state.running.push((cmdline, port));
        state.spawned.push(request.clone());
        Ok(1000 + state.spawned.len() as u32)
    }

    fn kill_matching(&self, pattern: &str) -> usize {
        let mut state = self.state.lock().unwrap();
        let (matched, kept): (Vec<_>, Vec<_>) = state
            .running
            .drain(..)
            .partition(|(cmdline, _)| cmdline.contains(pattern));
        state.running = kept;
        for (_, port) in &matched {
            if let Some(port) = port {
                state.bound.remove(port);
            }
        }
        matched.len()
    }

    async fn run(&self, program: &str, args: &[String]) -> std::io::Result<CommandOutput> {
        let mut call = vec![program.to_string()];
        call.extend(args.iter().cloned());
        self.state.lock().unwrap().commands.push(call);

        if !self.docker_available {
            return Ok(CommandOutput {
                success: false,
                stdout: String::new(),
                stderr: "Cannot connect to the Docker daemon".to_string(),
            });
        }
        Ok(CommandOutput {
            success: true,
            stdout: String::new(),
            stderr: String::new(),
        })
    }
}

/// Defaults with the given services and log dir.
pub fn config_with(log_dir: &Path, services: Vec<(&str, ServiceSpec)>) -> QloopConfig {
    let mut config = QloopConfig::defaults().unwrap();
    config.log_dir = log_dir.to_path_buf();
    config.services = services
        .into_iter()
        .map(|(name, spec)| (name.to_string(), spec))
        .collect();
    config
}

pub fn process_service(
    port: u16,
    tier: Tier,
    requires: &[&str],
    health_url: &str,
    program: &str,
) -> ServiceSpec {
    ServiceSpec {
        port,
        tier,
        requires: requires.iter().map(|r| r.to_string()).collect(),
        health: HealthCheck::Http {
            url: health_url.to_string(),
        },
        launch: Launch::Process(ProcessLaunch {
            program: program.to_string(),
            args: vec![],
            cwd: None,
            env: vec![],
        }),
        process_pattern: None,
        log_file: None,
        degraded_env: vec![],
        remediation: None,
    }
}

/// Serve `router` on an ephemeral port; returns `http://127.0.0.1:<port>`.
pub async fn serve(router: Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    format!("http://{}", addr)
}

/// `/health` answering `status` with `body`.
pub fn health_router(status: StatusCode, body: Value) -> Router {
    Router::new().route(
        "/health",
        get(move || {
            let body = body.clone();
            async move { (status, Json(body)) }
        }),
    )
}

/// A base URL nothing listens on.
pub fn closed_url() -> String {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);
    format!("http://127.0.0.1:{}", port)
}

/// Accepts connections and never answers.
pub async fn hung_server() -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let mut held = Vec::new();
        while let Ok((socket, _)) = listener.accept().await {
            held.push(socket);
        }
    });
    format!("http://{}", addr)
}
