//! Stack configuration: services, health polling, HTTP timeouts and verification settings.
//!
//! Precedence: built-in defaults (`config/default.toml`, embedded) < config file
//! (`QLOOP_CONFIG`, default `config/qloop`) < `QLOOP__SECTION__KEY` environment
//! < `QDRANT_HOST` / `QDRANT_PORT`.
//!
//! | Env | Default | Description |
//! |-----|---------|-------------|
//! | QLOOP_CONFIG | config/qloop | Config file path (extension optional). |
//! | QLOOP__LOG_DIR | logs | Directory for per-service logs and the process registry. |
//! | QLOOP__HEALTH__TIMEOUT_MS | 30000 | Upper bound for one `wait_for_health`. |
//! | QLOOP__VERIFY__DELAY_MS | 5000 | Pause between the two analysis calls. |
//! | QDRANT_HOST / QDRANT_PORT | localhost / 6333 | Where the Qdrant health check points. |

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Embedded defaults; every field of [`QloopConfig`] has a value here.
pub const DEFAULT_CONFIG: &str = include_str!("../config/default.toml");

/// Name of the Qdrant entry that `QDRANT_HOST` / `QDRANT_PORT` retarget.
pub const QDRANT_SERVICE: &str = "qdrant";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QloopConfig {
    /// Per-service log files and `registry.json` live here. Created on demand.
    pub log_dir: PathBuf,
    pub http: HttpSettings,
    pub health: HealthSettings,
    pub verify: VerifySettings,
    /// Service name -> definition. Names are lowercase identifiers (`prompt_engine`).
    pub services: BTreeMap<String, ServiceSpec>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpSettings {
    pub request_timeout_ms: u64,
    pub connect_timeout_ms: u64,
}

impl HttpSettings {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthSettings {
    pub timeout_ms: u64,
    pub interval_ms: u64,
    pub backoff: Backoff,
    /// Cap for exponential backoff; ignored for fixed.
    pub max_interval_ms: u64,
    /// Budget for a single probe (one HTTP request / one PING).
    pub probe_timeout_ms: u64,
}

impl HealthSettings {
    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Backoff {
    Fixed,
    Exponential,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerifySettings {
    pub agent_url: String,
    pub prompt_engine_url: String,
    pub delay_ms: u64,
    /// JSON file holding the dataset; built-in sample when unset.
    #[serde(default)]
    pub dataset_path: Option<PathBuf>,
    /// Also POST the first run's feedback to the prompt engine's `/learn`.
    #[serde(default)]
    pub explicit_feedback: bool,
}

impl VerifySettings {
    pub fn delay(&self) -> Duration {
        Duration::from_millis(self.delay_ms)
    }
}

/// Startup tier. Dependencies are external stores/runtimes; data-plane services are the HTTP apps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    Dependency,
    DataPlane,
}

impl Tier {
    pub fn label(&self) -> &'static str {
        match self {
            Tier::Dependency => "dependency",
            Tier::DataPlane => "data-plane",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceSpec {
    pub port: u16,
    pub tier: Tier,
    /// Services that must report healthy before this one is launched.
    #[serde(default)]
    pub requires: Vec<String>,
    pub health: HealthCheck,
    pub launch: Launch,
    /// Matched against process name and command line on stop. Defaults to the launch program.
    #[serde(default)]
    pub process_pattern: Option<String>,
    /// Defaults to `<name>.log` under `log_dir`.
    #[serde(default)]
    pub log_file: Option<String>,
    /// `KEY=VALUE` pairs added to the environment when started without its requirements.
    #[serde(default)]
    pub degraded_env: Vec<String>,
    /// Operator instruction printed when the service cannot be brought up.
    #[serde(default)]
    pub remediation: Option<String>,
}

impl ServiceSpec {
    /// Pattern used to locate this service's processes; never a PID.
    pub fn stop_pattern(&self) -> Option<&str> {
        match (&self.process_pattern, &self.launch) {
            (Some(p), _) => Some(p.as_str()),
            (None, Launch::Process(p)) => Some(p.program.as_str()),
            (None, Launch::Docker(_)) => None,
        }
    }

    pub fn degraded_env_pairs(&self) -> Vec<(String, String)> {
        parse_env_pairs(&self.degraded_env)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum HealthCheck {
    /// 2xx required; a JSON health record must additionally report `healthy` or `degraded`.
    Http { url: String },
    /// RESP `PING` must answer `+PONG`.
    Redis { host: String, port: u16 },
    /// Port accepts a TCP connection.
    Tcp { host: String, port: u16 },
}

impl HealthCheck {
    pub fn target(&self) -> String {
        match self {
            HealthCheck::Http { url } => url.clone(),
            HealthCheck::Redis { host, port } => format!("redis://{}:{}", host, port),
            HealthCheck::Tcp { host, port } => format!("tcp://{}:{}", host, port),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Launch {
    Process(ProcessLaunch),
    Docker(DockerLaunch),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessLaunch {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub cwd: Option<PathBuf>,
    /// `KEY=VALUE` pairs.
    #[serde(default)]
    pub env: Vec<String>,
}

impl ProcessLaunch {
    pub fn env_pairs(&self) -> Vec<(String, String)> {
        parse_env_pairs(&self.env)
    }

    pub fn command_line(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DockerLaunch {
    pub container: String,
    pub image: String,
    /// `host:container` port mappings.
    #[serde(default)]
    pub ports: Vec<String>,
    /// `host_path:container_path` bind mounts; relative host paths resolve against the cwd.
    #[serde(default)]
    pub volumes: Vec<String>,
}

fn parse_env_pairs(entries: &[String]) -> Vec<(String, String)> {
    entries
        .iter()
        .filter_map(|e| e.split_once('='))
        .map(|(k, v)| (k.trim().to_string(), v.to_string()))
        .filter(|(k, _)| !k.is_empty())
        .collect()
}

impl QloopConfig {
    /// Load config from defaults, file and environment. File path: env `QLOOP_CONFIG` > `config/qloop`.
    pub fn load() -> Result<Self, config::ConfigError> {
        let config_path = std::env::var("QLOOP_CONFIG").unwrap_or_else(|_| "config/qloop".to_string());
        Self::load_from(Some(Path::new(&config_path)))
    }

    /// Same as [`load`](Self::load) with an explicit (optional, may not exist) file.
    pub fn load_from(path: Option<&Path>) -> Result<Self, config::ConfigError> {
        let builder = config::Config::builder().add_source(config::File::from_str(
            DEFAULT_CONFIG,
            config::FileFormat::Toml,
        ));

        let builder = match path {
            Some(p) => builder.add_source(config::File::from(p).required(false)),
            None => builder,
        };

        let built = builder
            .add_source(
                config::Environment::with_prefix("QLOOP")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let mut cfg: QloopConfig = built.try_deserialize()?;
        cfg.apply_qdrant_overrides(
            std::env::var("QDRANT_HOST").ok(),
            std::env::var("QDRANT_PORT").ok(),
        )?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Built-in defaults only (no file, no environment).
    pub fn defaults() -> Result<Self, config::ConfigError> {
        let cfg: QloopConfig = config::Config::builder()
            .add_source(config::File::from_str(DEFAULT_CONFIG, config::FileFormat::Toml))
            .build()?
            .try_deserialize()?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Retarget the Qdrant service from `QDRANT_HOST` / `QDRANT_PORT`. Blank values are ignored.
    pub fn apply_qdrant_overrides(
        &mut self,
        host: Option<String>,
        port: Option<String>,
    ) -> Result<(), config::ConfigError> {
        let host = host.map(|h| h.trim().to_string()).filter(|h| !h.is_empty());
        let port = match port.map(|p| p.trim().to_string()).filter(|p| !p.is_empty()) {
            Some(p) => Some(p.parse::<u16>().map_err(|_| {
                config::ConfigError::Message(format!("QDRANT_PORT is not a valid port: {}", p))
            })?),
            None => None,
        };
        if host.is_none() && port.is_none() {
            return Ok(());
        }
        let Some(qdrant) = self.services.get_mut(QDRANT_SERVICE) else {
            return Ok(());
        };
        let port = port.unwrap_or(qdrant.port);
        let host = host.unwrap_or_else(|| "localhost".to_string());
        qdrant.port = port;
        qdrant.health = HealthCheck::Http {
            url: format!("http://{}:{}/healthz", host, port),
        };
        Ok(())
    }

    /// Reject unknown `requires` references and empty launch programs.
    pub fn validate(&self) -> Result<(), config::ConfigError> {
        for (name, spec) in &self.services {
            for req in &spec.requires {
                if !self.services.contains_key(req) {
                    return Err(config::ConfigError::Message(format!(
                        "service '{}' requires unknown service '{}'",
                        name, req
                    )));
                }
                if req == name {
                    return Err(config::ConfigError::Message(format!(
                        "service '{}' cannot require itself",
                        name
                    )));
                }
            }
            if let Launch::Process(p) = &spec.launch {
                if p.program.trim().is_empty() {
                    return Err(config::ConfigError::Message(format!(
                        "service '{}' has an empty launch program",
                        name
                    )));
                }
            }
        }
        Ok(())
    }

    pub fn service(&self, name: &str) -> Option<&ServiceSpec> {
        self.services.get(name)
    }

    pub fn names_in_tier(&self, tier: Tier) -> BTreeSet<String> {
        self.services
            .iter()
            .filter(|(_, s)| s.tier == tier)
            .map(|(n, _)| n.clone())
            .collect()
    }

    /// `<log_dir>/<log_file or name.log>`.
    pub fn log_path(&self, name: &str) -> PathBuf {
        let file = self
            .services
            .get(name)
            .and_then(|s| s.log_file.clone())
            .unwrap_or_else(|| format!("{}.log", name));
        self.log_dir.join(file)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_describe_the_full_stack() {
        let cfg = QloopConfig::defaults().unwrap();
        let ports: Vec<(&str, u16)> = cfg
            .services
            .iter()
            .map(|(n, s)| (n.as_str(), s.port))
            .collect();
        assert!(ports.contains(&("redis", 6379)));
        assert!(ports.contains(&("qdrant", 6333)));
        assert!(ports.contains(&("ollama", 11434)));
        assert!(ports.contains(&("prompt_engine", 5000)));
        assert!(ports.contains(&("autonomous_agent", 5001)));
        assert!(ports.contains(&("pseudonymization", 5003)));
        assert!(ports.contains(&("repersonalization", 5004)));
        assert_eq!(cfg.health.backoff, Backoff::Fixed);
        assert_eq!(cfg.verify.agent_url, "http://localhost:5001");
    }

    #[test]
    fn redis_launch_caps_memory_with_lru() {
        let cfg = QloopConfig::defaults().unwrap();
        let redis = cfg.service("redis").unwrap();
        match &redis.launch {
            Launch::Process(p) => {
                assert_eq!(p.program, "redis-server");
                let line = p.command_line();
                assert!(line.contains("--maxmemory 256mb"));
                assert!(line.contains("--maxmemory-policy allkeys-lru"));
            }
            other => panic!("unexpected launch: {:?}", other),
        }
        assert_eq!(
            redis.health,
            HealthCheck::Redis {
                host: "localhost".into(),
                port: 6379
            }
        );
    }

    #[test]
    fn qdrant_env_retargets_health_url() {
        let mut cfg = QloopConfig::defaults().unwrap();
        cfg.apply_qdrant_overrides(Some("vector-box".into()), Some("7333".into()))
            .unwrap();
        let qdrant = cfg.service(QDRANT_SERVICE).unwrap();
        assert_eq!(qdrant.port, 7333);
        assert_eq!(qdrant.health.target(), "http://vector-box:7333/healthz");
    }

    #[test]
    fn qdrant_port_alone_keeps_localhost() {
        let mut cfg = QloopConfig::defaults().unwrap();
        cfg.apply_qdrant_overrides(None, Some("6400".into())).unwrap();
        assert_eq!(
            cfg.service(QDRANT_SERVICE).unwrap().health.target(),
            "http://localhost:6400/healthz"
        );
    }

    #[test]
    fn invalid_qdrant_port_is_rejected() {
        let mut cfg = QloopConfig::defaults().unwrap();
        assert!(cfg
            .apply_qdrant_overrides(None, Some("not-a-port".into()))
            .is_err());
    }

    #[test]
    fn unknown_requirement_fails_validation() {
        let mut cfg = QloopConfig::defaults().unwrap();
        cfg.services
            .get_mut("autonomous_agent")
            .unwrap()
            .requires
            .push("does_not_exist".into());
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn degraded_env_pairs_skip_malformed_entries() {
        let mut cfg = QloopConfig::defaults().unwrap();
        let svc = cfg.services.get_mut("pseudonymization").unwrap();
        svc.degraded_env.push("garbage".into());
        svc.degraded_env.push("EMPTY=".into());
        let pairs = svc.degraded_env_pairs();
        assert!(pairs.contains(&("PSEUDONYM_STORE".to_string(), "memory".to_string())));
        assert!(pairs.contains(&("EMPTY".to_string(), String::new())));
        assert_eq!(pairs.len(), 2);
    }

    #[test]
    fn file_overrides_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("qloop.toml");
        std::fs::write(
            &path,
            "log_dir = \"/tmp/qloop-logs\"\n[verify]\ndelay_ms = 250\n",
        )
        .unwrap();
        let cfg = QloopConfig::load_from(Some(&path)).unwrap();
        assert_eq!(cfg.log_dir, PathBuf::from("/tmp/qloop-logs"));
        assert_eq!(cfg.verify.delay_ms, 250);
        // untouched sections keep their defaults
        assert_eq!(cfg.verify.prompt_engine_url, "http://localhost:5000");
    }

    #[test]
    fn stop_pattern_falls_back_to_program() {
        let mut cfg = QloopConfig::defaults().unwrap();
        let redis = cfg.services.get_mut("redis").unwrap();
        redis.process_pattern = None;
        assert_eq!(redis.stop_pattern(), Some("redis-server"));
        assert_eq!(cfg.service("qdrant").unwrap().stop_pattern(), None);
    }
}
