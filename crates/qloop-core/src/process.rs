//! OS process seam for the lifecycle controller.
//!
//! [`ProcessHost`] is everything the controller asks of the operating system: is a
//! port bound, does a program exist, launch detached, terminate by pattern, run a
//! short command (docker). [`SystemHost`] is the real implementation; tests swap in
//! an in-memory host.

use async_trait::async_trait;
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::Duration;
use sysinfo::{ProcessRefreshKind, Signal, System, UpdateKind};
use tokio::net::TcpStream;

/// Fully resolved launch: program, args, cwd and environment (including any degraded overlay).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchRequest {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub env: Vec<(String, String)>,
}

/// Captured result of a short-lived command.
#[derive(Debug, Clone, Default)]
pub struct CommandOutput {
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
}

#[async_trait]
pub trait ProcessHost: Send + Sync {
    /// True when something accepts connections on `127.0.0.1:port`.
    async fn port_in_use(&self, port: u16) -> bool;

    /// Absolute path of `program` if it can be executed.
    fn resolve_program(&self, program: &str) -> Option<PathBuf>;

    /// Start `request` in the background with stdout/stderr appended to `log_path`. Returns the PID.
    fn spawn_detached(&self, request: &LaunchRequest, log_path: &Path) -> std::io::Result<u32>;

    /// Terminate every process whose name or command line contains `pattern`,
    /// excluding the current process and thread entries. Returns how many were signalled.
    fn kill_matching(&self, pattern: &str) -> usize;

    /// Run a short command to completion and capture its output.
    async fn run(&self, program: &str, args: &[String]) -> std::io::Result<CommandOutput>;
}

/// Real host: TCP connect probes, `PATH` lookup, `std::process` spawn, sysinfo termination.
#[derive(Debug, Clone)]
pub struct SystemHost {
    connect_timeout: Duration,
}

impl SystemHost {
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }
}

impl Default for SystemHost {
    fn default() -> Self {
        Self::new(Duration::from_millis(500))
    }
}

#[async_trait]
impl ProcessHost for SystemHost {
    async fn port_in_use(&self, port: u16) -> bool {
        matches!(
            tokio::time::timeout(self.connect_timeout, TcpStream::connect(("127.0.0.1", port))).await,
            Ok(Ok(_))
        )
    }

    fn resolve_program(&self, program: &str) -> Option<PathBuf> {
        find_on_path(program)
    }

    fn spawn_detached(&self, request: &LaunchRequest, log_path: &Path) -> std::io::Result<u32> {
        if let Some(parent) = log_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let stdout = OpenOptions::new().create(true).append(true).open(log_path)?;
        let stderr = stdout.try_clone()?;

        let mut cmd = Command::new(&request.program);
        cmd.args(&request.args)
            .envs(request.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .stdout(Stdio::from(stdout))
            .stderr(Stdio::from(stderr));
        if let Some(cwd) = &request.cwd {
            cmd.current_dir(cwd);
        }

        // Own process group: Ctrl-C in the operator's terminal must not reach the service.
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            cmd.process_group(0);
        }

        let child = cmd.spawn()?;
        Ok(child.id())
    }

    fn kill_matching(&self, pattern: &str) -> usize {
        if pattern.trim().is_empty() {
            return 0;
        }
        let own_pid = sysinfo::get_current_pid().ok();
        // Interpreted services only show their script in the command line.
        let mut sys = System::new();
        sys.refresh_processes_specifics(
            ProcessRefreshKind::new().with_cmd(UpdateKind::Always),
        );

        let mut killed = 0;
        for (pid, process) in sys.processes() {
            // Linux lists each thread as its own entry sharing the parent's command line.
            if Some(*pid) == own_pid || process.thread_kind().is_some() {
                continue;
            }
            let cmdline = process.cmd().join(" ");
            if process.name().contains(pattern) || cmdline.contains(pattern) {
                // SIGTERM first so services can flush; SIGKILL where TERM is unsupported.
                let signalled = process
                    .kill_with(Signal::Term)
                    .unwrap_or_else(|| process.kill());
                if signalled {
                    tracing::debug!(pid = %pid, name = %process.name(), pattern, "terminated process");
                    killed += 1;
                } else {
                    tracing::warn!(pid = %pid, name = %process.name(), "failed to signal process");
                }
            }
        }
        killed
    }

    async fn run(&self, program: &str, args: &[String]) -> std::io::Result<CommandOutput> {
        let output = tokio::process::Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .output()
            .await?;
        Ok(CommandOutput {
            success: output.status.success(),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        })
    }
}

/// `which`-style lookup. Paths containing a separator are checked as given.
pub fn find_on_path(program: &str) -> Option<PathBuf> {
    let candidate = Path::new(program);
    if candidate.components().count() > 1 {
        return is_executable(candidate).then(|| candidate.to_path_buf());
    }
    let path_var = std::env::var_os("PATH")?;
    std::env::split_paths(&path_var)
        .map(|dir| dir.join(program))
        .find(|p| is_executable(p))
}

fn is_executable(path: &Path) -> bool {
    let Ok(meta) = std::fs::metadata(path) else {
        return false;
    };
    if !meta.is_file() {
        return false;
    }
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        meta.permissions().mode() & 0o111 != 0
    }
    #[cfg(not(unix))]
    {
        true
    }
}
