use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use anyhow::{bail, Context, Result};
use futures::future::join_all;
use tracing::{info, warn};

use crate::config::Config;
use crate::directive::Directive;
use crate::runner::{elapsed_ms, ExecutionRequest, ExecutionResult, Interpreter, ProcessRunner};
use crate::scheduler::ExecutionScheduler;
use crate::trust::{self, Authorization, PermissionRecord, TrustRegistry, ValidationResult};

/// What activating a directive produced.
#[derive(Debug, Clone, PartialEq)]
pub enum Activation {
    /// The script ran, or was refused after trust passed (admission,
    /// spawn failure). Exactly one result per attempt.
    Completed(ExecutionResult),
    /// Trust gating stopped the script before anything was spawned.
    Blocked(Blocked),
}

impl Activation {
    pub fn button_id(&self) -> &str {
        match self {
            Activation::Completed(result) => &result.button_id,
            Activation::Blocked(blocked) => &blocked.button_id,
        }
    }

    pub fn succeeded(&self) -> bool {
        matches!(self, Activation::Completed(result) if result.success)
    }
}

/// A refused directive, with what a human needs to decide on it.
#[derive(Debug, Clone, PartialEq)]
pub struct Blocked {
    pub button_id: String,
    pub script_path: String,
    pub reason: String,
    pub validation: ValidationResult,
    /// False when no approval can lift the refusal (path policy).
    pub approvable: bool,
}

/// Parsed directive → trust → admission → process → result.
///
/// Holds the only shared mutable state (trust records and the admission
/// counter). Share it behind an `Arc` to activate from several tasks.
pub struct Engine {
    config: Config,
    trust: Mutex<TrustRegistry>,
    scheduler: ExecutionScheduler,
    runner: ProcessRunner,
}

impl Engine {
    pub fn new(config: Config) -> Self {
        let trust = TrustRegistry::new(
            config.trust.require_approval,
            config.trust.trusted_scripts.clone(),
        );
        let scheduler = ExecutionScheduler::new(config.execution.max_concurrent_executions);
        let runner = ProcessRunner::new(
            config.interpreters.clone(),
            config.execution.output_line_limit,
        );
        Self {
            config,
            trust: Mutex::new(trust),
            scheduler,
            runner,
        }
    }

    #[cfg(test)]
    pub fn scheduler(&self) -> &ExecutionScheduler {
        &self.scheduler
    }

    /// Copy of every permission record, for persistence.
    pub fn trust_records(&self) -> HashMap<String, PermissionRecord> {
        self.registry().records().clone()
    }

    /// Explicit human approval of a script's current content.
    pub async fn approve(&self, working_dir: &Path, script_path: &str) -> Result<()> {
        if !trust::path_allowed(script_path, &self.config.trust.allowed_script_paths) {
            bail!("{script_path} is outside the allowed script paths");
        }
        let (_, script) = resolve_script(working_dir, script_path)?;
        let content = tokio::fs::read(&script)
            .await
            .with_context(|| format!("Cannot read {}", script.display()))?;
        self.registry().approve(script_path, &content);
        Ok(())
    }

    /// Runs every directive concurrently. Results come back in input
    /// order; match them to directives by `button_id`.
    pub async fn activate_all(&self, directives: &[Directive], working_dir: &Path) -> Vec<Activation> {
        join_all(directives.iter().map(|d| self.activate(d, working_dir))).await
    }

    /// Activates one directive. Never fails: every outcome is an `Activation`.
    pub async fn activate(&self, directive: &Directive, working_dir: &Path) -> Activation {
        let started = Instant::now();
        let fail = |error: String| {
            warn!("'{}' failed: {error}", directive.label);
            Activation::Completed(ExecutionResult::failure(
                &directive.id,
                error,
                elapsed_ms(started),
            ))
        };

        let Some(interpreter) = Interpreter::from_command(&directive.command) else {
            return fail(format!("unsupported command kind '{}'", directive.command));
        };

        if !trust::path_allowed(&directive.script_path, &self.config.trust.allowed_script_paths) {
            return self.blocked(
                directive,
                "script path not allowed",
                ValidationResult::rejected(format!(
                    "{} is outside the allowed script paths",
                    directive.script_path
                )),
            );
        }

        let (root, script) = match resolve_script(working_dir, &directive.script_path) {
            Ok(paths) => paths,
            Err(e) if e.is::<EscapesRoot>() => {
                return self.blocked(
                    directive,
                    "script escapes the working directory",
                    ValidationResult::rejected(format!("{e}")),
                );
            }
            Err(e) => return fail(format!("{e:#}")),
        };

        let content = match tokio::fs::read(&script).await {
            Ok(content) => content,
            Err(e) => return fail(format!("Cannot read {}: {e}", script.display())),
        };

        let authorization = self.registry().authorize(&directive.script_path, &content);
        if let Authorization::Denied { reason, validation } = authorization {
            return Activation::Blocked(Blocked {
                button_id: directive.id.clone(),
                script_path: directive.script_path.clone(),
                reason: reason.to_string(),
                validation,
                approvable: true,
            });
        }

        let Some(admission) = self.scheduler.admit() else {
            return fail(format!(
                "too many concurrent executions (limit {})",
                self.scheduler.max()
            ));
        };

        let request = ExecutionRequest {
            directive,
            interpreter,
            working_dir: root,
            script_path: script,
            fingerprint: trust::fingerprint(&content),
            timeout: self.config.execution.timeout(),
            admitted_at: Instant::now(),
            admission,
        };
        Activation::Completed(self.runner.run(request).await)
    }

    fn blocked(&self, directive: &Directive, reason: &str, validation: ValidationResult) -> Activation {
        warn!("'{}' blocked: {reason}", directive.label);
        Activation::Blocked(Blocked {
            button_id: directive.id.clone(),
            script_path: directive.script_path.clone(),
            reason: reason.to_string(),
            validation,
            approvable: false,
        })
    }

    fn registry(&self) -> MutexGuard<'_, TrustRegistry> {
        self.trust.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// A script whose real location is outside the working root.
#[derive(Debug)]
struct EscapesRoot(PathBuf);

impl std::fmt::Display for EscapesRoot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} resolves outside the working directory", self.0.display())
    }
}

impl std::error::Error for EscapesRoot {}

/// Canonical working root and canonical script path inside it.
fn resolve_script(working_dir: &Path, script_path: &str) -> Result<(PathBuf, PathBuf)> {
    let root = working_dir
        .canonicalize()
        .with_context(|| format!("Working directory not found: {}", working_dir.display()))?;
    let script = root
        .join(script_path)
        .canonicalize()
        .with_context(|| format!("Script not found: {script_path}"))?;
    if !script.starts_with(&root) {
        return Err(EscapesRoot(PathBuf::from(script_path)).into());
    }
    if !script.is_file() {
        bail!("Script is not a file: {script_path}");
    }
    info!("Resolved {script_path} → {}", script.display());
    Ok((root, script))
}
