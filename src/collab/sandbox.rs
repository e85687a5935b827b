//! Code execution sandbox.
//!
//! Every run gets its own interpreter process: a cleared environment, a fresh
//! temporary working directory, piped stdin/stdout/stderr, a wall-clock
//! timeout and (on unix) CPU and address-space rlimits. The server's own
//! standard streams are never touched, so concurrent runs cannot see each
//! other's I/O.
//!
//! The keyword denylist applied before spawning is a deterrent only. It is
//! trivially bypassed (`getattr(__import__("o"+"s"), ...)`) and is not a
//! security boundary; the process limits are what actually constrain a run,
//! and they do not restrict filesystem or network access.

use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tracing::{debug, warn};

/// Substrings that cause code to be rejected without being run.
pub const RESTRICTED_KEYWORDS: &[&str] = &["os.", "sys.", "subprocess."];

pub const NO_OUTPUT_MESSAGE: &str = "Code executed successfully with no output.";

const TRUNCATION_NOTICE: &str = "\n[output truncated]";
const STDERR_CAP: u64 = 16 * 1024;

/// Configuration for sandboxed code runs.
#[derive(Debug, Clone, PartialEq)]
pub struct SandboxConfig {
    pub interpreter: String,
    /// Arguments placed before the code; the code itself is passed last.
    pub interpreter_args: Vec<String>,
    pub timeout_secs: u64,
    /// Address-space limit for the interpreter process. 0 disables it.
    pub memory_mb: u64,
    pub max_output_bytes: usize,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            interpreter: "python3".to_string(),
            interpreter_args: vec!["-I".to_string(), "-c".to_string()],
            timeout_secs: 10,
            memory_mb: 512,
            max_output_bytes: 64 * 1024,
        }
    }
}

/// What a run produced, as shown to the room.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionResult {
    Output(String),
    Error(String),
}

impl ExecutionResult {
    pub fn into_message(self) -> String {
        match self {
            Self::Output(s) | Self::Error(s) => s,
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Self::Error(_))
    }
}

#[derive(Debug, Error)]
pub enum ExecutionFault {
    #[error("Restricted keywords detected.")]
    Restricted,

    #[error("execution timed out after {0}s")]
    Timeout(u64),

    #[error("could not start interpreter: {0}")]
    Spawn(#[source] std::io::Error),

    /// The code itself failed; carries the interpreter's description.
    #[error("{0}")]
    Runtime(String),
}

/// Runs one piece of code in isolation and returns its captured stdout.
#[async_trait]
pub trait CodeRunner: Send + Sync {
    async fn run(&self, code: &str, stdin: &str) -> Result<String, ExecutionFault>;
}

/// Returns the first denylisted keyword contained in `code`.
pub fn restricted_keyword(code: &str) -> Option<&'static str> {
    RESTRICTED_KEYWORDS.iter().copied().find(|k| code.contains(k))
}

pub struct Sandbox {
    runner: Arc<dyn CodeRunner>,
}

impl Sandbox {
    pub fn new(runner: Arc<dyn CodeRunner>) -> Self {
        Self { runner }
    }

    pub fn from_config(config: SandboxConfig) -> Self {
        Self::new(Arc::new(ProcessRunner::new(config)))
    }

    /// Filter, run and format. Never fails: every fault becomes an
    /// `Error: ...` string.
    pub async fn execute(&self, code: &str, stdin: &str) -> ExecutionResult {
        if let Some(keyword) = restricted_keyword(code) {
            debug!(keyword, "[sandbox] rejected code containing restricted keyword");
            return ExecutionResult::Error(format!("Error: {}", ExecutionFault::Restricted));
        }
        if code.trim().is_empty() {
            return ExecutionResult::Output(NO_OUTPUT_MESSAGE.to_string());
        }

        match self.runner.run(code, stdin).await {
            Ok(output) if output.is_empty() => ExecutionResult::Output(NO_OUTPUT_MESSAGE.to_string()),
            Ok(output) => ExecutionResult::Output(output),
            Err(fault) => {
                if let ExecutionFault::Spawn(ref e) = fault {
                    warn!("[sandbox] interpreter failed to start: {}", e);
                }
                ExecutionResult::Error(format!("Error: {}", fault))
            }
        }
    }
}

/// Runs code in a freshly spawned interpreter process.
pub struct ProcessRunner {
    config: SandboxConfig,
}

impl ProcessRunner {
    pub fn new(config: SandboxConfig) -> Self {
        Self { config }
    }

    fn command(&self, code: &str, workdir: &std::path::Path) -> Command {
        let mut cmd = Command::new(&self.config.interpreter);
        cmd.args(&self.config.interpreter_args)
            .arg(code)
            .env_clear()
            .current_dir(workdir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Ok(path) = std::env::var("PATH") {
            cmd.env("PATH", path);
        }
        cmd.env("PYTHONIOENCODING", "utf-8");

        #[cfg(unix)]
        apply_resource_limits(&mut cmd, self.config.timeout_secs, self.config.memory_mb);

        cmd
    }
}

#[async_trait]
impl CodeRunner for ProcessRunner {
    async fn run(&self, code: &str, stdin: &str) -> Result<String, ExecutionFault> {
        let workdir = tempfile::tempdir().map_err(ExecutionFault::Spawn)?;
        let mut child = self
            .command(code, workdir.path())
            .spawn()
            .map_err(ExecutionFault::Spawn)?;

        if let Some(mut child_stdin) = child.stdin.take() {
            let input = stdin.to_owned();
            tokio::spawn(async move {
                // The program may exit without reading its input.
                let _ = child_stdin.write_all(input.as_bytes()).await;
            });
        }

        let mut stdout = child
            .stdout
            .take()
            .ok_or_else(|| ExecutionFault::Runtime("stdout was not captured".to_string()))?;
        let mut stderr = child
            .stderr
            .take()
            .ok_or_else(|| ExecutionFault::Runtime("stderr was not captured".to_string()))?;

        // Keep the head of stderr and drain the rest so the child never
        // blocks on a full pipe.
        let stderr_task = tokio::spawn(async move {
            let mut buf = Vec::new();
            let _ = (&mut stderr).take(STDERR_CAP).read_to_end(&mut buf).await;
            let _ = tokio::io::copy(&mut stderr, &mut tokio::io::sink()).await;
            buf
        });

        let limit = self.config.max_output_bytes;
        let timeout = Duration::from_secs(self.config.timeout_secs);
        let collected = tokio::time::timeout(timeout, async {
            let mut out = Vec::new();
            (&mut stdout)
                .take(limit as u64 + 1)
                .read_to_end(&mut out)
                .await
                .map_err(|e| ExecutionFault::Runtime(e.to_string()))?;
            let truncated = out.len() > limit;
            if truncated {
                out.truncate(limit);
                let _ = child.start_kill();
            }
            let status = child
                .wait()
                .await
                .map_err(|e| ExecutionFault::Runtime(e.to_string()))?;
            Ok::<_, ExecutionFault>((status, out, truncated))
        })
        .await;

        let (status, out, truncated) = match collected {
            Ok(result) => result?,
            Err(_) => {
                let _ = child.start_kill();
                stderr_task.abort();
                return Err(ExecutionFault::Timeout(self.config.timeout_secs));
            }
        };
        let err = stderr_task.await.unwrap_or_default();

        let mut output = String::from_utf8_lossy(&out).into_owned();
        if truncated {
            output.push_str(TRUNCATION_NOTICE);
            return Ok(output);
        }
        if !status.success() {
            return Err(ExecutionFault::Runtime(describe_failure(&err, status.code())));
        }
        Ok(output)
    }
}

/// Last non-empty stderr line (the exception line of a traceback), or the
/// exit status when stderr is empty.
fn describe_failure(stderr: &[u8], code: Option<i32>) -> String {
    let text = String::from_utf8_lossy(stderr);
    if let Some(line) = text.lines().rev().map(str::trim).find(|l| !l.is_empty()) {
        return exception_message(line).to_string();
    }
    match code {
        Some(code) => format!("process exited with status {}", code),
        None => "process terminated by signal".to_string(),
    }
}

/// Strip the exception type from a `NameError: name 'x' is not defined`
/// style line. Lines without a message are kept whole.
fn exception_message(line: &str) -> &str {
    match line.split_once(": ") {
        Some((kind, message))
            if !kind.is_empty()
                && !message.trim().is_empty()
                && kind
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '.') =>
        {
            message.trim()
        }
        _ => line,
    }
}

#[cfg(unix)]
fn apply_resource_limits(cmd: &mut Command, cpu_secs: u64, memory_mb: u64) {
    let cpu = libc::rlimit {
        rlim_cur: cpu_secs as libc::rlim_t,
        rlim_max: cpu_secs as libc::rlim_t,
    };
    let memory_bytes = memory_mb.saturating_mul(1024 * 1024);
    let memory = libc::rlimit {
        rlim_cur: memory_bytes as libc::rlim_t,
        rlim_max: memory_bytes as libc::rlim_t,
    };
    // SAFETY: the closure runs between fork and exec and only calls
    // setrlimit, which is async-signal-safe.
    unsafe {
        cmd.pre_exec(move || {
            if libc::setrlimit(libc::RLIMIT_CPU, &cpu) != 0 {
                return Err(std::io::Error::last_os_error());
            }
            if memory_mb > 0 && libc::setrlimit(libc::RLIMIT_AS, &memory) != 0 {
                return Err(std::io::Error::last_os_error());
            }
            Ok(())
        });
    }
}
