//! Lifecycle controller: idempotent start / stop / health-wait for the local stack.
//!
//! Replaces the `start_*.sh` / stop scripts. Every operation is safe to re-run:
//! a bound port means "already running", a stop with nothing to stop succeeds.
//! Services are started in `requires` order and a service is only launched once
//! everything it requires has been confirmed healthy (or the operator explicitly
//! accepted degraded mode for it).

use crate::config::{DockerLaunch, Launch, QloopConfig, ServiceSpec, Tier};
use crate::error::{preview, LifecycleError};
use crate::health::{HealthProber, PollPolicy, PollState, Probe};
use crate::process::{CommandOutput, LaunchRequest, ProcessHost, SystemHost};
use crate::registry::{ProcessRegistry, RegistryEntry};
use chrono::Utc;
use std::collections::{BTreeMap, BTreeSet};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

const PORT_RELEASE_INTERVAL: Duration = Duration::from_millis(200);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnsureOutcome {
    /// Port was already bound; nothing launched.
    AlreadyRunning,
    /// Launched now. `pid` is None for docker-managed services.
    Started { pid: Option<u32> },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    Stopped { terminated: usize },
    NotRunning,
}

/// What `start_all` did for one service.
#[derive(Debug, Clone, PartialEq)]
pub enum StartOutcome {
    Ready {
        ensure: EnsureOutcome,
        probe: Probe,
        degraded: bool,
    },
    /// Launched (or found running) but never became healthy.
    Unhealthy {
        ensure: EnsureOutcome,
        state: PollState,
    },
    /// Not launched: these requirements were unhealthy and degraded mode was declined.
    Blocked { missing: Vec<String> },
    /// Pre-flight or launch failed.
    Failed {
        error: String,
        remediation: Option<String>,
    },
}

impl StartOutcome {
    pub fn is_ready(&self) -> bool {
        matches!(self, StartOutcome::Ready { .. })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ServiceReport {
    pub name: String,
    pub port: u16,
    pub outcome: StartOutcome,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct StartReport {
    pub services: Vec<ServiceReport>,
}

impl StartReport {
    pub fn all_ready(&self) -> bool {
        self.services.iter().all(|s| s.outcome.is_ready())
    }

    pub fn get(&self, name: &str) -> Option<&ServiceReport> {
        self.services.iter().find(|s| s.name == name)
    }
}

/// Snapshot for `status`.
#[derive(Debug, Clone)]
pub struct ServiceStatus {
    pub name: String,
    pub port: u16,
    pub tier: Tier,
    pub port_bound: bool,
    pub probe: Probe,
    pub registry: Option<RegistryEntry>,
}

pub struct LifecycleController<H: ProcessHost = SystemHost> {
    config: QloopConfig,
    host: H,
    prober: HealthProber,
    policy: PollPolicy,
    registry: ProcessRegistry,
}

impl LifecycleController<SystemHost> {
    pub fn from_config(config: QloopConfig) -> Result<Self, LifecycleError> {
        let host = SystemHost::new(config.health.probe_timeout());
        Self::with_host(config, host)
    }
}

impl<H: ProcessHost> LifecycleController<H> {
    /// Creates the log directory and loads the persisted registry.
    pub fn with_host(config: QloopConfig, host: H) -> Result<Self, LifecycleError> {
        std::fs::create_dir_all(&config.log_dir)?;
        let registry = ProcessRegistry::open(&config.log_dir);
        let prober = HealthProber::new(config.health.probe_timeout())?;
        let policy = PollPolicy::from_settings(&config.health);
        Ok(Self {
            config,
            host,
            prober,
            policy,
            registry,
        })
    }

    pub fn with_poll_policy(mut self, policy: PollPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn config(&self) -> &QloopConfig {
        &self.config
    }

    pub fn host(&self) -> &H {
        &self.host
    }

    pub fn registry(&self) -> &ProcessRegistry {
        &self.registry
    }

    pub fn poll_policy(&self) -> &PollPolicy {
        &self.policy
    }

    fn spec(&self, name: &str) -> Result<ServiceSpec, LifecycleError> {
        self.config
            .service(name)
            .cloned()
            .ok_or_else(|| LifecycleError::UnknownService(name.to_string()))
    }

    /// Expand service names and groups (`all`, `dependencies`, `data-plane`). Empty means all.
    pub fn resolve_selection(&self, names: &[String]) -> Result<Vec<String>, LifecycleError> {
        let mut selected = BTreeSet::new();
        if names.is_empty() {
            selected.extend(self.config.services.keys().cloned());
        }
        for raw in names {
            let name = raw.trim().to_lowercase().replace('-', "_");
            match name.as_str() {
                "all" => selected.extend(self.config.services.keys().cloned()),
                "dependencies" | "deps" => selected.extend(self.config.names_in_tier(Tier::Dependency)),
                "data_plane" | "data_services" => {
                    selected.extend(self.config.names_in_tier(Tier::DataPlane))
                }
                _ if self.config.services.contains_key(&name) => {
                    selected.insert(name.clone());
                }
                _ => return Err(LifecycleError::UnknownService(raw.clone())),
            }
        }
        Ok(selected.into_iter().collect())
    }

    /// Topological order over `selection` by `requires`; within a wave dependencies come first.
    pub fn start_order(&self, selection: &[String]) -> Result<Vec<String>, LifecycleError> {
        let selected: BTreeSet<&String> = selection.iter().collect();
        let mut pending: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
        for name in &selected {
            let spec = self
                .config
                .service(name)
                .ok_or_else(|| LifecycleError::UnknownService((*name).clone()))?;
            let reqs = spec
                .requires
                .iter()
                .filter(|r| selected.contains(r))
                .cloned()
                .collect();
            pending.insert((*name).clone(), reqs);
        }

        let mut order = Vec::with_capacity(pending.len());
        while !pending.is_empty() {
            let mut wave: Vec<String> = pending
                .iter()
                .filter(|(_, reqs)| reqs.is_empty())
                .map(|(n, _)| n.clone())
                .collect();
            if wave.is_empty() {
                let stuck: Vec<&str> = pending.keys().map(String::as_str).collect();
                return Err(LifecycleError::DependencyCycle(stuck.join(", ")));
            }
            wave.sort_by_key(|n| (self.config.services[n].tier, n.clone()));
            for n in &wave {
                pending.remove(n);
            }
            for reqs in pending.values_mut() {
                for n in &wave {
                    reqs.remove(n);
                }
            }
            order.extend(wave);
        }
        Ok(order)
    }

    /// Start `name` unless its port is already bound.
    pub async fn ensure_running(
        &mut self,
        name: &str,
        degraded: bool,
    ) -> Result<EnsureOutcome, LifecycleError> {
        let spec = self.spec(name)?;
        if self.host.port_in_use(spec.port).await {
            tracing::info!(service = name, port = spec.port, "✅ {} already running on port {}", name, spec.port);
            return Ok(EnsureOutcome::AlreadyRunning);
        }

        self.preflight(name, &spec).await?;
        let log_path = self.config.log_path(name);

        let (pid, container) = match &spec.launch {
            Launch::Process(p) => {
                let mut env = p.env_pairs();
                if degraded {
                    env.extend(spec.degraded_env_pairs());
                }
                let request = LaunchRequest {
                    program: p.program.clone(),
                    args: p.args.clone(),
                    cwd: p.cwd.clone(),
                    env,
                };
                tracing::info!(
                    service = name,
                    port = spec.port,
                    log = %log_path.display(),
                    degraded,
                    "🚀 Starting {}: {}",
                    name,
                    p.command_line()
                );
                let pid = self
                    .host
                    .spawn_detached(&request, &log_path)
                    .map_err(|e| LifecycleError::StartupError {
                        service: name.to_string(),
                        reason: e.to_string(),
                    })?;
                (Some(pid), None)
            }
            Launch::Docker(d) => {
                self.start_container(name, d, &log_path).await?;
                (None, Some(d.container.clone()))
            }
        };

        self.registry.record(
            name,
            RegistryEntry {
                port: spec.port,
                pid,
                container,
                log_path,
                started_at: Utc::now(),
                degraded,
            },
        );
        self.persist_registry();
        Ok(EnsureOutcome::Started { pid })
    }

    /// Stop by process pattern (or `docker stop`). Nothing running is success.
    pub async fn stop(&mut self, name: &str) -> Result<StopOutcome, LifecycleError> {
        let spec = self.spec(name)?;
        let outcome = match &spec.launch {
            Launch::Docker(d) => self.stop_container(name, d).await?,
            Launch::Process(_) => match spec.stop_pattern() {
                Some(pattern) => match self.host.kill_matching(pattern) {
                    0 => StopOutcome::NotRunning,
                    n => StopOutcome::Stopped { terminated: n },
                },
                None => StopOutcome::NotRunning,
            },
        };

        match outcome {
            StopOutcome::NotRunning => tracing::info!(service = name, "ℹ️ {} not running; nothing to stop", name),
            StopOutcome::Stopped { terminated } => {
                tracing::info!(service = name, terminated, "🛑 Stopped {}", name)
            }
        }
        if self.registry.remove(name).is_some() {
            self.persist_registry();
        }
        Ok(outcome)
    }

    /// Poll `name`'s health check under the controller's policy. Timeout is a result, not an error.
    pub async fn wait_for_health(
        &self,
        name: &str,
        cancel: &CancellationToken,
    ) -> Result<PollState, LifecycleError> {
        let spec = self.spec(name)?;
        let state = self
            .prober
            .wait_for_health(&spec.health, &self.policy, cancel)
            .await?;
        match &state {
            PollState::Ready(probe) => tracing::info!(service = name, "✅ {} is {}", name, probe),
            other => tracing::warn!(service = name, "⚠️ {} not healthy: {}", name, other.diagnosis()),
        }
        Ok(state)
    }

    /// One probe of `name` without waiting.
    pub async fn probe(&self, name: &str) -> Result<Probe, LifecycleError> {
        let spec = self.spec(name)?;
        Ok(self.prober.probe(&spec.health).await)
    }

    /// Bring up `selection` in dependency order.
    ///
    /// `consent(service, missing)` is asked before starting a service whose requirements
    /// are unhealthy; returning true starts it in degraded mode. A service whose port is
    /// already bound skips the requirement check and goes straight to the health wait. Individual failures are
    /// recorded in the report and the sequence continues; only cancellation aborts it.
    pub async fn start_all(
        &mut self,
        selection: &[String],
        consent: &mut (dyn FnMut(&str, &[String]) -> bool + Send),
        cancel: &CancellationToken,
    ) -> Result<StartReport, LifecycleError> {
        let order = self.start_order(selection)?;
        tracing::info!(order = ?order, "Starting services");

        let mut healthy: BTreeSet<String> = BTreeSet::new();
        let mut report = StartReport::default();

        for name in order {
            if cancel.is_cancelled() {
                return Err(LifecycleError::Cancelled);
            }
            let spec = self.spec(&name)?;

            // A bound port is taken as the service already running; its requirements are not ours to gate.
            let already_running = self.host.port_in_use(spec.port).await;
            let mut missing = Vec::new();
            for req in spec.requires.iter().filter(|_| !already_running) {
                if healthy.contains(req) {
                    continue;
                }
                let probe = self.probe(req).await?;
                if probe.is_ready() {
                    healthy.insert(req.clone());
                } else {
                    tracing::warn!(service = %name, requirement = %req, "⚠️ {} requires {}, which is {}", name, req, probe);
                    missing.push(req.clone());
                }
            }

            let degraded = if missing.is_empty() {
                false
            } else if consent(&name, &missing) {
                tracing::warn!(service = %name, missing = ?missing, "Starting {} in degraded mode", name);
                true
            } else {
                tracing::warn!(service = %name, missing = ?missing, "❌ Not starting {}: requirements unavailable", name);
                report.services.push(ServiceReport {
                    name,
                    port: spec.port,
                    outcome: StartOutcome::Blocked { missing },
                });
                continue;
            };

            let ensure = match self.ensure_running(&name, degraded).await {
                Ok(o) => o,
                Err(LifecycleError::Cancelled) => return Err(LifecycleError::Cancelled),
                Err(e) => {
                    tracing::error!(service = %name, error = %e, "❌ Failed to start {}", name);
                    report.services.push(ServiceReport {
                        name,
                        port: spec.port,
                        outcome: StartOutcome::Failed {
                            error: e.to_string(),
                            remediation: spec.remediation.clone(),
                        },
                    });
                    continue;
                }
            };

            let state = self.wait_for_health(&name, cancel).await?;
            let outcome = match state {
                PollState::Ready(probe) => {
                    healthy.insert(name.clone());
                    StartOutcome::Ready {
                        ensure,
                        probe,
                        degraded,
                    }
                }
                other => StartOutcome::Unhealthy {
                    ensure,
                    state: other,
                },
            };
            report.services.push(ServiceReport {
                name,
                port: spec.port,
                outcome,
            });
        }
        Ok(report)
    }

    /// Stop `selection` in reverse start order.
    pub async fn stop_all(
        &mut self,
        selection: &[String],
    ) -> Result<Vec<(String, StopOutcome)>, LifecycleError> {
        let mut order = self.start_order(selection)?;
        order.reverse();
        let mut results = Vec::with_capacity(order.len());
        for name in order {
            let outcome = self.stop(&name).await?;
            results.push((name, outcome));
        }
        Ok(results)
    }

    /// Port-conflict resolution: stop by pattern, wait for the port to free, start, wait healthy.
    pub async fn restart(
        &mut self,
        name: &str,
        cancel: &CancellationToken,
    ) -> Result<(StopOutcome, EnsureOutcome, PollState), LifecycleError> {
        let spec = self.spec(name)?;
        let stopped = self.stop(name).await?;
        self.wait_for_port_release(name, spec.port, cancel).await?;
        let ensure = self.ensure_running(name, false).await?;
        let state = self.wait_for_health(name, cancel).await?;
        Ok((stopped, ensure, state))
    }

    pub async fn status(&self) -> Vec<ServiceStatus> {
        let mut out = Vec::with_capacity(self.config.services.len());
        for (name, spec) in &self.config.services {
            out.push(ServiceStatus {
                name: name.clone(),
                port: spec.port,
                tier: spec.tier,
                port_bound: self.host.port_in_use(spec.port).await,
                probe: self.prober.probe(&spec.health).await,
                registry: self.registry.get(name).cloned(),
            });
        }
        out
    }

    async fn wait_for_port_release(
        &self,
        name: &str,
        port: u16,
        cancel: &CancellationToken,
    ) -> Result<(), LifecycleError> {
        let deadline = Instant::now() + self.policy.timeout;
        while self.host.port_in_use(port).await {
            if Instant::now() >= deadline {
                return Err(LifecycleError::PortStillBound {
                    service: name.to_string(),
                    port,
                });
            }
            tokio::select! {
                _ = cancel.cancelled() => return Err(LifecycleError::Cancelled),
                _ = tokio::time::sleep(PORT_RELEASE_INTERVAL) => {}
            }
        }
        Ok(())
    }

    async fn preflight(&self, name: &str, spec: &ServiceSpec) -> Result<(), LifecycleError> {
        match &spec.launch {
            Launch::Process(p) => {
                if self.host.resolve_program(&p.program).is_none() {
                    return Err(LifecycleError::BinaryNotFound {
                        service: name.to_string(),
                        program: p.program.clone(),
                    });
                }
                Ok(())
            }
            Launch::Docker(_) => {
                let remediation = spec
                    .remediation
                    .clone()
                    .unwrap_or_else(|| "start the Docker daemon and retry".to_string());
                let args = ["info", "--format", "{{.ServerVersion}}"].map(String::from);
                match self.host.run("docker", &args).await {
                    Ok(out) if out.success => Ok(()),
                    Ok(out) => Err(LifecycleError::DependencyUnavailable {
                        service: name.to_string(),
                        reason: format!("Docker is not running ({})", preview(&out.stderr, 200)),
                        remediation,
                    }),
                    Err(e) => Err(LifecycleError::DependencyUnavailable {
                        service: name.to_string(),
                        reason: format!("docker CLI unavailable: {}", e),
                        remediation,
                    }),
                }
            }
        }
    }

    async fn docker(&self, name: &str, args: &[String]) -> Result<CommandOutput, LifecycleError> {
        self.host
            .run("docker", args)
            .await
            .map_err(|e| LifecycleError::StartupError {
                service: name.to_string(),
                reason: format!("docker {}: {}", args.join(" "), e),
            })
    }

    async fn start_container(
        &self,
        name: &str,
        docker: &DockerLaunch,
        log_path: &Path,
    ) -> Result<(), LifecycleError> {
        let filter = format!("name=^/{}$", docker.container);
        let existing = self
            .docker(name, &["ps", "-a", "-q", "-f", filter.as_str()].map(String::from))
            .await?;

        let args: Vec<String> = if existing.stdout.trim().is_empty() {
            let mut args = vec!["run", "-d", "--name", docker.container.as_str()]
                .into_iter()
                .map(String::from)
                .collect::<Vec<_>>();
            for port in &docker.ports {
                args.push("-p".into());
                args.push(port.clone());
            }
            for volume in &docker.volumes {
                args.push("-v".into());
                args.push(resolve_volume(volume)?);
            }
            args.push(docker.image.clone());
            args
        } else {
            vec!["start".into(), docker.container.clone()]
        };

        tracing::info!(service = name, container = %docker.container, "🐳 docker {}", args.join(" "));
        let out = self.docker(name, &args).await?;
        append_log(log_path, &format!("$ docker {}\n{}{}", args.join(" "), out.stdout, out.stderr));
        if !out.success {
            return Err(LifecycleError::StartupError {
                service: name.to_string(),
                reason: preview(&out.stderr, 300),
            });
        }
        Ok(())
    }

    async fn stop_container(
        &self,
        name: &str,
        docker: &DockerLaunch,
    ) -> Result<StopOutcome, LifecycleError> {
        let filter = format!("name=^/{}$", docker.container);
        let running = match self
            .host
            .run("docker", &["ps", "-q", "-f", filter.as_str()].map(String::from))
            .await
        {
            Ok(out) if out.success => out.stdout,
            // No docker daemon: nothing can be running in it.
            _ => return Ok(StopOutcome::NotRunning),
        };
        if running.trim().is_empty() {
            return Ok(StopOutcome::NotRunning);
        }
        let out = self
            .docker(name, &["stop".to_string(), docker.container.clone()])
            .await?;
        if !out.success {
            return Err(LifecycleError::StopError {
                service: name.to_string(),
                reason: preview(&out.stderr, 300),
            });
        }
        Ok(StopOutcome::Stopped { terminated: 1 })
    }

    fn persist_registry(&self) {
        if let Err(e) = self.registry.save() {
            tracing::warn!(error = %e, "failed to persist process registry");
        }
    }
}

/// Bind mounts with a relative or absolute host path are made absolute and created;
/// named volumes pass through untouched.
fn resolve_volume(spec: &str) -> Result<String, LifecycleError> {
    let Some((host, container)) = spec.split_once(':') else {
        return Ok(spec.to_string());
    };
    let is_path = host.starts_with('.') || host.contains('/');
    if !is_path {
        return Ok(spec.to_string());
    }
    let host_path = PathBuf::from(host);
    let absolute = if host_path.is_absolute() {
        host_path
    } else {
        std::env::current_dir()?.join(host_path)
    };
    std::fs::create_dir_all(&absolute)?;
    Ok(format!("{}:{}", absolute.display(), container))
}

fn append_log(path: &Path, text: &str) {
    let result = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .and_then(|mut f| f.write_all(text.as_bytes()));
    if let Err(e) = result {
        tracing::debug!(path = %path.display(), error = %e, "could not append to service log");
    }
}
