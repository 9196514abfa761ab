use std::collections::HashSet;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use nix::unistd::Pid;
use serde::{Deserialize, Serialize};

use crate::config::CliTool;
use crate::{log_debug, log_warn};

/// Maximum time to wait for graceful shutdown after SIGTERM before sending SIGKILL.
const SIGTERM_GRACE_PERIOD_SECONDS: u64 = 5;

/// Polling interval when waiting for a process group to exit after SIGTERM.
const KILL_POLL_INTERVAL_MS: u64 = 100;

/// Global shutdown flag shared with signal handlers.
fn shutdown_flag() -> &'static Arc<AtomicBool> {
    static FLAG: OnceLock<Arc<AtomicBool>> = OnceLock::new();
    FLAG.get_or_init(|| Arc::new(AtomicBool::new(false)))
}

/// Check if a shutdown has been requested via signal.
pub fn is_shutdown_requested() -> bool {
    shutdown_flag().load(Ordering::Relaxed)
}

/// Install signal handlers for SIGTERM and SIGINT that set the shutdown flag.
///
/// Call once at program startup. Subsequent calls are safe (re-registers handlers).
pub fn install_signal_handlers() -> Result<(), String> {
    let flag = Arc::clone(shutdown_flag());
    signal_hook::flag::register(signal_hook::consts::SIGTERM, Arc::clone(&flag))
        .map_err(|e| format!("Failed to register SIGTERM handler: {}", e))?;
    signal_hook::flag::register(signal_hook::consts::SIGINT, flag)
        .map_err(|e| format!("Failed to register SIGINT handler: {}", e))?;
    Ok(())
}

// --- Process Registry ---

/// Global registry of active child process group IDs, so a SIGINT/SIGTERM
/// handler can cancel every outstanding invocation before exit.
fn process_registry() -> &'static Arc<std::sync::Mutex<HashSet<Pid>>> {
    static REGISTRY: OnceLock<Arc<std::sync::Mutex<HashSet<Pid>>>> = OnceLock::new();
    REGISTRY.get_or_init(|| Arc::new(std::sync::Mutex::new(HashSet::new())))
}

pub fn register_child(pgid: Pid) {
    if let Ok(mut registry) = process_registry().lock() {
        registry.insert(pgid);
    }
}

pub fn unregister_child(pgid: Pid) {
    if let Ok(mut registry) = process_registry().lock() {
        registry.remove(&pgid);
    }
}

/// Kill all registered child process groups: SIGTERM all, wait the grace
/// period, SIGKILL survivors.
pub fn kill_all_children() {
    use nix::sys::signal::{killpg, Signal};

    let pgids: Vec<Pid> = {
        let Ok(registry) = process_registry().lock() else {
            return;
        };
        registry.iter().copied().collect()
    };

    if pgids.is_empty() {
        return;
    }

    for &pgid in &pgids {
        let _ = killpg(pgid, Signal::SIGTERM);
    }

    let deadline = std::time::Instant::now() + Duration::from_secs(SIGTERM_GRACE_PERIOD_SECONDS);
    let poll_interval = Duration::from_millis(KILL_POLL_INTERVAL_MS);

    while std::time::Instant::now() < deadline {
        let all_gone = pgids.iter().all(|&pgid| matches!(killpg(pgid, None), Err(nix::errno::Errno::ESRCH)));
        if all_gone {
            break;
        }
        std::thread::sleep(poll_interval);
    }

    for &pgid in &pgids {
        let _ = killpg(pgid, Signal::SIGKILL);
    }

    if let Ok(mut registry) = process_registry().lock() {
        registry.clear();
    }
}

/// Failure taxonomy surfaced distinctly in `AgentResult::error_kind`, classified
/// from the backend's exit code and captured output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentErrorKind {
    AuthenticationFailure,
    RateLimited,
    ContextOverflow,
    NetworkError,
    BackendUnavailable,
    Generic,
}

fn classify_failure(output: &str, exit_code: Option<i32>) -> AgentErrorKind {
    let lower = output.to_lowercase();
    if lower.contains("rate limit") || lower.contains("429") {
        AgentErrorKind::RateLimited
    } else if lower.contains("unauthorized") || lower.contains("authentication") || lower.contains("invalid api key") {
        AgentErrorKind::AuthenticationFailure
    } else if lower.contains("context length") || lower.contains("context window") || lower.contains("too many tokens") {
        AgentErrorKind::ContextOverflow
    } else if lower.contains("connection refused") || lower.contains("network") || lower.contains("dns") {
        AgentErrorKind::NetworkError
    } else if exit_code == Some(127) || lower.contains("command not found") {
        AgentErrorKind::BackendUnavailable
    } else {
        AgentErrorKind::Generic
    }
}

/// The uniform result shape for every backend (subprocess or future library-call).
#[derive(Debug, Clone)]
pub struct AgentResult {
    pub success: bool,
    pub output: String,
    pub exit_code: Option<i32>,
    pub timed_out: bool,
    pub completion_detected: bool,
    pub error_kind: Option<AgentErrorKind>,
    /// Payload from a structured tool call (PRD save, story-status update, the
    /// `complete` tool), as the Model Context Protocol server that would
    /// capture it is outside this dispatcher's scope. Always `None` for
    /// `CliAgentRunner`; only `MockAgentRunner` can populate it, standing in
    /// for a real MCP integration in tests.
    pub mcp_capture: Option<serde_json::Value>,
}

pub struct AgentRequest<'a> {
    pub working_dir: &'a Path,
    pub prompt: &'a str,
    pub allowed_tools: Option<&'a [String]>,
    pub timeout: Duration,
    pub completion_sentinel: &'a str,
    pub dry_run: bool,
}

/// Trait for running agents. Enables mocking in pipeline tests.
pub trait AgentRunner: Send + Sync {
    fn run_agent(&self, request: &AgentRequest<'_>) -> impl std::future::Future<Output = AgentResult> + Send;
}

/// Real implementation that spawns a CLI agent as a subprocess.
pub struct CliAgentRunner {
    pub tool: CliTool,
    pub model: Option<String>,
}

impl CliAgentRunner {
    pub fn new(tool: CliTool, model: Option<String>) -> Self {
        Self { tool, model }
    }

    /// Verify that the configured CLI tool is available on PATH.
    pub fn verify_cli_available(&self) -> Result<(), String> {
        let output = std::process::Command::new(self.tool.binary_name())
            .arg("--version")
            .output()
            .map_err(|e| format!("{} not found on PATH ({})", self.tool.binary_name(), e))?;

        if !output.status.success() {
            return Err(format!("{} found but `--version` failed", self.tool.binary_name()));
        }
        Ok(())
    }
}

impl AgentRunner for CliAgentRunner {
    async fn run_agent(&self, request: &AgentRequest<'_>) -> AgentResult {
        if request.dry_run {
            return AgentResult {
                success: true,
                output: "[dry-run]".to_string(),
                exit_code: Some(0),
                timed_out: false,
                completion_detected: true,
                error_kind: None,
                mcp_capture: None,
            };
        }

        // Tool restriction: if the configured CLI has no flag to express an
        // allowlist, building args would silently drop it. `build_args` always
        // returns an explicit restriction flag when tools are Some(_), so this
        // path only fails if the caller passes an allowlist for a tool that
        // cannot express one at all.
        if request.allowed_tools.is_some() && !self.tool.supports_tool_restriction() {
            return AgentResult {
                success: false,
                output: format!("{} cannot enforce a tool allowlist", self.tool.binary_name()),
                exit_code: None,
                timed_out: false,
                completion_detected: false,
                error_kind: Some(AgentErrorKind::Generic),
                mcp_capture: None,
            };
        }

        let mut cmd = tokio::process::Command::new(self.tool.binary_name());
        cmd.args(self.tool.build_args(request.prompt, self.model.as_deref(), request.allowed_tools));
        cmd.current_dir(request.working_dir);
        run_subprocess_agent(cmd, request.timeout, request.completion_sentinel).await
    }
}

/// Spawn a subprocess agent, enforce timeout, capture combined stdout/stderr,
/// scan for the completion sentinel, and classify failures.
///
/// Process-group isolation (setpgid) plus registry tracking means a SIGINT/SIGTERM
/// on this process cancels every outstanding agent invocation, not just this one.
pub async fn run_subprocess_agent(
    mut cmd: tokio::process::Command,
    timeout: Duration,
    completion_sentinel: &str,
) -> AgentResult {
    cmd.stdin(std::process::Stdio::null());
    cmd.stdout(std::process::Stdio::piped());
    cmd.stderr(std::process::Stdio::piped());
    cmd.kill_on_drop(true);

    // SAFETY: pre_exec runs between fork() and exec() where only async-signal-safe
    // functions are permitted. setpgid is async-signal-safe per POSIX.
    unsafe {
        cmd.pre_exec(|| {
            nix::unistd::setpgid(nix::unistd::Pid::from_raw(0), nix::unistd::Pid::from_raw(0))
                .map_err(std::io::Error::other)?;
            Ok(())
        });
    }

    log_debug!("[agent] Spawning subprocess...");
    let mut child = match cmd.spawn() {
        Ok(c) => c,
        Err(e) => {
            return AgentResult {
                success: false,
                output: format!("Failed to spawn subprocess: {}", e),
                exit_code: None,
                timed_out: false,
                completion_detected: false,
                error_kind: Some(AgentErrorKind::BackendUnavailable),
                mcp_capture: None,
            }
        }
    };

    let child_pid = match child.id() {
        Some(pid) => pid as i32,
        None => {
            return AgentResult {
                success: false,
                output: "Failed to get child PID".to_string(),
                exit_code: None,
                timed_out: false,
                completion_detected: false,
                error_kind: Some(AgentErrorKind::Generic),
                mcp_capture: None,
            }
        }
    };
    let pgid = Pid::from_raw(child_pid);
    register_child(pgid);

    let stdout = child.stdout.take();
    let stderr = child.stderr.take();
    let output_task = tokio::spawn(async move {
        use tokio::io::AsyncReadExt;
        let mut combined = String::new();
        if let Some(mut stdout) = stdout {
            let _ = stdout.read_to_string(&mut combined).await;
        }
        if let Some(mut stderr) = stderr {
            let mut err_buf = String::new();
            let _ = stderr.read_to_string(&mut err_buf).await;
            combined.push_str(&err_buf);
        }
        combined
    });

    let wait_result = tokio::time::timeout(timeout, child.wait()).await;

    match wait_result {
        Err(_) => {
            kill_process_group(child_pid).await;
            let _ = child.wait().await;
            unregister_child(pgid);
            let output = output_task.await.unwrap_or_default();
            AgentResult {
                success: false,
                output,
                exit_code: None,
                timed_out: true,
                completion_detected: false,
                error_kind: Some(AgentErrorKind::Generic),
                mcp_capture: None,
            }
        }
        Ok(wait_result) => {
            unregister_child(pgid);
            let output = output_task.await.unwrap_or_default();

            if is_shutdown_requested() {
                kill_process_group(child_pid).await;
                let _ = child.wait().await;
                return AgentResult {
                    success: false,
                    output,
                    exit_code: None,
                    timed_out: false,
                    completion_detected: false,
                    error_kind: Some(AgentErrorKind::Generic),
                    mcp_capture: None,
                };
            }

            match wait_result {
                Ok(exit_status) => {
                    let exit_code = exit_status.code();
                    let completion_detected = output.contains(completion_sentinel);
                    let success = exit_status.success() && completion_detected;
                    AgentResult {
                        success,
                        error_kind: if success { None } else { Some(classify_failure(&output, exit_code)) },
                        mcp_capture: None,
                        output,
                        exit_code,
                        timed_out: false,
                        completion_detected,
                    }
                }
                Err(e) => AgentResult {
                    success: false,
                    output: format!("Error waiting for subprocess: {}", e),
                    exit_code: None,
                    timed_out: false,
                    completion_detected: false,
                    error_kind: Some(AgentErrorKind::Generic),
                    mcp_capture: None,
                },
            }
        }
    }
}

/// Kill a process group by PID. Sends SIGTERM, polls for exit, then SIGKILL if needed.
async fn kill_process_group(pgid: i32) {
    tokio::task::spawn_blocking(move || {
        use nix::sys::signal::{killpg, Signal};

        let pgid = Pid::from_raw(pgid);

        if let Err(nix::errno::Errno::ESRCH) = killpg(pgid, Signal::SIGTERM) {
            return;
        }

        let deadline = std::time::Instant::now() + Duration::from_secs(SIGTERM_GRACE_PERIOD_SECONDS);
        let poll_interval = Duration::from_millis(KILL_POLL_INTERVAL_MS);

        while std::time::Instant::now() < deadline {
            match killpg(pgid, None) {
                Err(nix::errno::Errno::ESRCH) => return,
                _ => std::thread::sleep(poll_interval),
            }
        }

        let _ = killpg(pgid, Signal::SIGKILL);
    })
    .await
    .unwrap_or_else(|e| log_warn!("kill_process_group task panicked: {}", e));
}

/// Mock agent runner for pipeline tests. Returns predefined results from a
/// configurable sequence, one per call.
pub struct MockAgentRunner {
    results: tokio::sync::Mutex<Vec<AgentResult>>,
}

impl MockAgentRunner {
    pub fn new(results: Vec<AgentResult>) -> Self {
        let mut reversed = results;
        reversed.reverse();
        Self { results: tokio::sync::Mutex::new(reversed) }
    }
}

impl AgentRunner for MockAgentRunner {
    async fn run_agent(&self, _request: &AgentRequest<'_>) -> AgentResult {
        let mut results = self.results.lock().await;
        results.pop().unwrap_or(AgentResult {
            success: false,
            output: "MockAgentRunner: no more results in sequence".to_string(),
            exit_code: None,
            timed_out: false,
            completion_detected: false,
            error_kind: Some(AgentErrorKind::Generic),
            mcp_capture: None,
        })
    }
}

#[cfg(test)]
fn set_shutdown_flag_for_testing(value: bool) {
    shutdown_flag().store(value, Ordering::Relaxed);
}
