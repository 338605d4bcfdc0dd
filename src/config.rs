use anyhow::bail;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use crate::trust::PermissionRecord;

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub interpreters: InterpreterConfig,
    #[serde(default)]
    pub execution: ExecutionConfig,
    #[serde(default)]
    pub trust: TrustConfig,
}

/// Binaries used for each supported command kind.
#[derive(Debug, Deserialize, Clone)]
pub struct InterpreterConfig {
    #[serde(default = "default_python_path")]
    pub python_path: String,
    #[serde(default = "default_shell_path")]
    pub shell_path: String,
    #[serde(default = "default_node_path")]
    pub node_path: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ExecutionConfig {
    /// Milliseconds before a running script is killed
    #[serde(default = "default_execution_timeout")]
    pub execution_timeout: u64,
    #[serde(default = "default_output_line_limit")]
    pub output_line_limit: usize,
    #[serde(default = "default_max_concurrent_executions")]
    pub max_concurrent_executions: usize,
}

#[derive(Debug, Deserialize, Clone)]
pub struct TrustConfig {
    #[serde(default = "default_require_approval")]
    pub require_approval: bool,
    /// Relative path prefixes scripts must live under. Empty = no restriction.
    #[serde(default)]
    pub allowed_script_paths: Vec<String>,
    #[serde(default)]
    pub trusted_scripts: HashMap<String, PermissionRecord>,
    /// Where the CLI keeps approvals between runs (JSON)
    #[serde(default)]
    pub store_path: Option<PathBuf>,
}

fn default_python_path() -> String {
    "python3".to_string()
}

fn default_shell_path() -> String {
    "sh".to_string()
}

fn default_node_path() -> String {
    "node".to_string()
}

fn default_execution_timeout() -> u64 {
    5000
}

fn default_output_line_limit() -> usize {
    100
}

fn default_max_concurrent_executions() -> usize {
    3
}

fn default_require_approval() -> bool {
    true
}

impl Default for InterpreterConfig {
    fn default() -> Self {
        Self {
            python_path: default_python_path(),
            shell_path: default_shell_path(),
            node_path: default_node_path(),
        }
    }
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            execution_timeout: default_execution_timeout(),
            output_line_limit: default_output_line_limit(),
            max_concurrent_executions: default_max_concurrent_executions(),
        }
    }
}

impl Default for TrustConfig {
    fn default() -> Self {
        Self {
            require_approval: default_require_approval(),
            allowed_script_paths: Vec::new(),
            trusted_scripts: HashMap::new(),
            store_path: None,
        }
    }
}

impl ExecutionConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.execution_timeout)
    }
}

impl Config {
    pub fn load(path: &str) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> anyhow::Result<Self> {
        // Expand environment variables like ${PYTHON}
        let expanded = shellexpand::env(content)?;
        let config: Config = toml::from_str(&expanded)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> anyhow::Result<()> {
        if self.execution.max_concurrent_executions == 0 {
            bail!("execution.max_concurrent_executions must be at least 1");
        }
        if self.execution.execution_timeout == 0 {
            bail!("execution.execution_timeout must be greater than 0");
        }
        Ok(())
    }
}
