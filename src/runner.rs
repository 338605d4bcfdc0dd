//! Child-process execution for admitted requests.
//!
//! One process per request, stdout and stderr drained concurrently into
//! separate buffers while the process runs, a hard deadline after which
//! the process is killed. Every outcome, including spawn failure and
//! timeout, comes back as exactly one `ExecutionResult`.
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::InterpreterConfig;
use crate::directive::Directive;
use crate::format::{self, OutputKind};
use crate::scheduler::Admission;
use crate::trust;

/// Bytes kept per stream. Anything beyond is read and dropped so the child
/// never blocks on a full pipe.
const MAX_CAPTURE_BYTES: usize = 4 * 1024 * 1024;

/// How long to wait for the output pipes to close after the process is gone.
/// Grandchildren can hold them open after a kill.
const STREAM_GRACE: Duration = Duration::from_millis(200);

/// Supported command kinds. Adding a runner means adding a variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interpreter {
    Python,
    Shell,
    Node,
}

impl Interpreter {
    /// Maps a directive's command tag to a runner. `run` is the generic
    /// button command and uses Python.
    pub fn from_command(command: &str) -> Option<Self> {
        match command {
            "run" | "python" | "python3" | "py" => Some(Interpreter::Python),
            "sh" | "shell" | "bash" => Some(Interpreter::Shell),
            "node" | "js" => Some(Interpreter::Node),
            _ => None,
        }
    }

    /// Binary configured for this kind.
    pub fn program<'a>(&self, config: &'a InterpreterConfig) -> &'a str {
        match self {
            Interpreter::Python => &config.python_path,
            Interpreter::Shell => &config.shell_path,
            Interpreter::Node => &config.node_path,
        }
    }
}

/// Outcome of one execution attempt.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionResult {
    /// Exit code was 0
    pub success: bool,
    /// Classified, line-limited stdout
    pub output: String,
    pub kind: OutputKind,
    pub error: Option<String>,
    /// Wall-clock milliseconds from admission to result
    pub execution_time: u64,
    pub button_id: String,
}

impl ExecutionResult {
    /// A run that never produced output (spawn failure, rejection, ...).
    pub fn failure(button_id: &str, error: impl Into<String>, execution_time: u64) -> Self {
        Self {
            success: false,
            output: String::new(),
            kind: OutputKind::Text,
            error: Some(error.into()),
            execution_time,
            button_id: button_id.to_string(),
        }
    }
}

/// An admitted attempt to run a directive.
///
/// Owns the scheduler slot: the slot is released when the request is
/// consumed by `ProcessRunner::run`, whatever the outcome.
#[derive(Debug)]
pub struct ExecutionRequest<'a> {
    pub directive: &'a Directive,
    pub interpreter: Interpreter,
    /// Absolute; becomes the child's cwd
    pub working_dir: PathBuf,
    /// Absolute
    pub script_path: PathBuf,
    /// Fingerprint of the content that passed the trust check
    pub fingerprint: String,
    pub timeout: Duration,
    pub admitted_at: Instant,
    pub admission: Admission,
}

pub struct ProcessRunner {
    interpreters: InterpreterConfig,
    output_line_limit: usize,
}

impl ProcessRunner {
    pub fn new(interpreters: InterpreterConfig, output_line_limit: usize) -> Self {
        Self {
            interpreters,
            output_line_limit,
        }
    }

    /// Runs the request to completion or deadline. Never fails: every
    /// failure class is folded into the returned result.
    pub async fn run(&self, request: ExecutionRequest<'_>) -> ExecutionResult {
        let ExecutionRequest {
            directive,
            interpreter,
            working_dir,
            script_path,
            fingerprint,
            timeout,
            admitted_at,
            admission: _admission,
        } = request;
        let program = interpreter.program(&self.interpreters);

        info!(
            "Running '{}' ({} {} {})",
            directive.label,
            program,
            script_path.display(),
            directive.args.join(" ")
        );

        let mut command = Command::new(program);
        command
            .arg(&script_path)
            .args(&directive.args)
            .current_dir(&working_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        // Own group, so a timeout can take down everything the script started
        #[cfg(unix)]
        command.process_group(0);

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(e) => {
                warn!("Failed to start {program} for '{}': {e}", directive.label);
                return ExecutionResult::failure(
                    &directive.id,
                    format!("Failed to start process: {e}"),
                    elapsed_ms(admitted_at),
                );
            }
        };

        // The interpreter opens the script by path after the trust check read
        // it. Re-hash now so a swap in between is caught; a swap that lands
        // after this read and before the interpreter's open is not.
        if !content_unchanged(&script_path, &fingerprint).await {
            warn!("'{}' changed on disk after the trust check, killing", directive.label);
            terminate(&mut child).await;
            return ExecutionResult::failure(
                &directive.id,
                "script modified since approval",
                elapsed_ms(admitted_at),
            );
        }

        let stdout = Arc::new(Mutex::new(Vec::new()));
        let stderr = Arc::new(Mutex::new(Vec::new()));
        let mut readers = Vec::with_capacity(2);
        if let Some(stream) = child.stdout.take() {
            readers.push(tokio::spawn(drain(stream, stdout.clone())));
        }
        if let Some(stream) = child.stderr.take() {
            readers.push(tokio::spawn(drain(stream, stderr.clone())));
        }

        let outcome = match tokio::time::timeout(timeout, child.wait()).await {
            Ok(Ok(status)) => Outcome::Exited(status),
            Ok(Err(e)) => Outcome::WaitFailed(e.to_string()),
            Err(_) => {
                warn!(
                    "'{}' exceeded {}, killing",
                    directive.label,
                    format::format_duration(timeout.as_millis() as u64)
                );
                terminate(&mut child).await;
                Outcome::TimedOut
            }
        };

        finish_readers(readers).await;

        let stdout = take_text(&stdout);
        let stderr = take_text(&stderr);
        let (formatted, kind) = format::classify(&stdout);
        let output = format::truncate(&formatted, self.output_line_limit);
        let execution_time = elapsed_ms(admitted_at);

        let (success, error) = match outcome {
            Outcome::Exited(status) => {
                info!(
                    "'{}' finished with {status} in {}",
                    directive.label,
                    format::format_duration(execution_time)
                );
                let error = if !stderr.trim().is_empty() {
                    Some(format::truncate(stderr.trim_end(), self.output_line_limit))
                } else if !status.success() {
                    Some(describe_exit(status))
                } else {
                    None
                };
                (status.success(), error)
            }
            Outcome::WaitFailed(e) => (false, Some(format!("Failed to wait for process: {e}"))),
            Outcome::TimedOut => (
                false,
                Some(format!(
                    "execution timed out after {}",
                    format::format_duration(timeout.as_millis() as u64)
                )),
            ),
        };

        ExecutionResult {
            success,
            output,
            kind,
            error,
            execution_time,
            button_id: directive.id.clone(),
        }
    }
}

async fn content_unchanged(script_path: &Path, fingerprint: &str) -> bool {
    match tokio::fs::read(script_path).await {
        Ok(content) => trust::fingerprint(&content) == fingerprint,
        Err(e) => {
            debug!("Cannot re-read {}: {e}", script_path.display());
            false
        }
    }
}

/// Kills the child's whole process group, then the child itself, and reaps it.
async fn terminate(child: &mut Child) {
    #[cfg(unix)]
    if let Some(pid) = child.id() {
        use nix::sys::signal::{killpg, Signal};
        use nix::unistd::Pid;
        if let Err(e) = killpg(Pid::from_raw(pid as i32), Signal::SIGKILL) {
            debug!("Process group kill failed: {e}");
        }
    }
    if let Err(e) = child.start_kill() {
        debug!("Kill failed (process already gone?): {e}");
    }
    let _ = child.wait().await;
}

enum Outcome {
    Exited(ExitStatus),
    WaitFailed(String),
    TimedOut,
}

/// Reads `reader` to EOF into `sink`, keeping at most `MAX_CAPTURE_BYTES`.
async fn drain<R>(mut reader: R, sink: Arc<Mutex<Vec<u8>>>)
where
    R: AsyncRead + Unpin,
{
    let mut buffer = [0u8; 4096];
    loop {
        match reader.read(&mut buffer).await {
            Ok(0) => break,
            Ok(n) => {
                let mut sink = sink.lock().unwrap_or_else(PoisonError::into_inner);
                let room = MAX_CAPTURE_BYTES.saturating_sub(sink.len());
                sink.extend_from_slice(&buffer[..n.min(room)]);
            }
            Err(e) => {
                debug!("Output stream read error: {e}");
                break;
            }
        }
    }
}

/// Waits briefly for each reader to hit EOF, then abandons it.
async fn finish_readers(readers: Vec<JoinHandle<()>>) {
    for mut reader in readers {
        if tokio::time::timeout(STREAM_GRACE, &mut reader).await.is_err() {
            debug!("Output stream still open after exit, detaching");
            reader.abort();
        }
    }
}

fn take_text(buffer: &Mutex<Vec<u8>>) -> String {
    let bytes = std::mem::take(&mut *buffer.lock().unwrap_or_else(PoisonError::into_inner));
    String::from_utf8_lossy(&bytes).into_owned()
}

fn describe_exit(status: ExitStatus) -> String {
    match status.code() {
        Some(code) => format!("process exited with code {code}"),
        None => "process terminated by signal".to_string(),
    }
}

pub(crate) fn elapsed_ms(since: Instant) -> u64 {
    since.elapsed().as_millis() as u64
}
