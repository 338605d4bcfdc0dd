mod config;
mod directive;
mod engine;
mod format;
mod runner;
mod scheduler;
mod store;
mod trust;

use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};

use anyhow::{anyhow, bail, Context, Result};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::config::Config;
use crate::directive::Directive;
use crate::engine::{Activation, Engine};
use crate::format::format_duration;
use crate::trust::TrustRegistry;

const DEFAULT_CONFIG_PATH: &str = "config/buttons.toml";

fn print_help() {
    println!(
        "\
interactive-buttons v{}

Runs the script buttons declared in a document.

USAGE:
    interactive-buttons [OPTIONS] <DOCUMENT>
    interactive-buttons [TRUST OPTIONS]

DIRECTIVE SYNTAX:
    [![Label] Button: !command \"path/to/script\" arg1 arg2]

    command: run | python | py (python_path),
             sh | shell | bash (shell_path), node | js (node_path)

OPTIONS:
    -c, --config PATH    TOML configuration [default: {DEFAULT_CONFIG_PATH}]
    -w, --workdir DIR    Root for script paths and child cwd
                         [default: the document's directory]
    -l, --list           List the directives found and exit
        --label LABEL    Only activate directives with this label
        --approve        Approve every referenced script as it is now
    -h, --help           Print this help message and exit
    -V, --version        Print version and exit

TRUST OPTIONS (applied to trust.store_path, then exit):
        --revoke SCRIPT      Keep the record but require approval again
        --forget SCRIPT      Delete the record
        --grant SCRIPT=TAG   Add a capability tag to the record
        --check SCRIPT=TAG   Print whether the record carries the tag

ENVIRONMENT VARIABLES:
    RUST_LOG    Log level filter for tracing
                (e.g. debug, interactive_buttons=debug,warn)

    Variables are referenced in the config file via ${{VAR_NAME}} syntax.

EXAMPLES:
    interactive-buttons notes/tools.md
    interactive-buttons --approve --label Deploy notes/tools.md
    RUST_LOG=debug interactive-buttons -c buttons.toml notes/tools.md",
        env!("CARGO_PKG_VERSION"),
    );
}

#[derive(Debug, Clone, PartialEq)]
enum TrustAction {
    Revoke(String),
    Forget(String),
    Grant { script: String, tag: String },
    Check { script: String, tag: String },
}

#[derive(Debug, Default, PartialEq)]
struct Options {
    document: Option<PathBuf>,
    trust_actions: Vec<TrustAction>,
    config_path: Option<String>,
    workdir: Option<PathBuf>,
    list: bool,
    label: Option<String>,
    approve: bool,
}

#[derive(Debug, PartialEq)]
enum CliAction {
    Help,
    Version,
    Run(Options),
}

fn parse_args(args: impl IntoIterator<Item = String>) -> Result<CliAction> {
    let mut options = Options::default();
    let mut args = args.into_iter();

    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--help" | "-h" => return Ok(CliAction::Help),
            "--version" | "-V" => return Ok(CliAction::Version),
            "--config" | "-c" => options.config_path = Some(value_for(&arg, args.next())?),
            "--workdir" | "-w" => options.workdir = Some(PathBuf::from(value_for(&arg, args.next())?)),
            "--label" => options.label = Some(value_for(&arg, args.next())?),
            "--list" | "-l" => options.list = true,
            "--approve" => options.approve = true,
            "--revoke" => options
                .trust_actions
                .push(TrustAction::Revoke(value_for(&arg, args.next())?)),
            "--forget" => options
                .trust_actions
                .push(TrustAction::Forget(value_for(&arg, args.next())?)),
            "--grant" => {
                let (script, tag) = script_and_tag(&arg, args.next())?;
                options.trust_actions.push(TrustAction::Grant { script, tag });
            }
            "--check" => {
                let (script, tag) = script_and_tag(&arg, args.next())?;
                options.trust_actions.push(TrustAction::Check { script, tag });
            }
            flag if flag.starts_with('-') => bail!("Unknown option: {flag}"),
            _ if options.document.is_some() => bail!("Only one document can be given"),
            _ => options.document = Some(PathBuf::from(&arg)),
        }
    }

    if options.document.is_none() && options.trust_actions.is_empty() {
        bail!("Missing <DOCUMENT> argument");
    }
    Ok(CliAction::Run(options))
}

fn value_for(flag: &str, value: Option<String>) -> Result<String> {
    value.ok_or_else(|| anyhow!("{flag} expects a value"))
}

fn script_and_tag(flag: &str, value: Option<String>) -> Result<(String, String)> {
    let value = value_for(flag, value)?;
    value
        .split_once('=')
        .filter(|(s, t)| !s.is_empty() && !t.is_empty())
        .map(|(s, t)| (s.to_string(), t.to_string()))
        .ok_or_else(|| anyhow!("{flag} expects SCRIPT=TAG"))
}

/// Explicit path must exist; the default path is optional.
fn load_config(explicit: Option<&str>) -> Result<Config> {
    match explicit {
        Some(path) => {
            info!("Loading configuration from {path}");
            Config::load(path).with_context(|| format!("Cannot load config {path}"))
        }
        None if Path::new(DEFAULT_CONFIG_PATH).exists() => {
            info!("Loading configuration from {DEFAULT_CONFIG_PATH}");
            Config::load(DEFAULT_CONFIG_PATH)
        }
        None => {
            info!("No configuration file, using defaults");
            Ok(Config::default())
        }
    }
}

fn working_dir_for(document: &Path) -> PathBuf {
    match document.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    }
}

/// Text shown for one activation, the way the document view would show it.
fn render(directive: &Directive, activation: &Activation) -> String {
    let mut out = String::new();
    match activation {
        Activation::Completed(result) if result.success => {
            out.push_str(&format!(
                "[{}] ✓ Completed in {} ({})\n",
                directive.label,
                format_duration(result.execution_time),
                result.kind.as_str()
            ));
            if !result.output.is_empty() {
                out.push_str(&result.output);
                out.push('\n');
            }
            if let Some(stderr) = &result.error {
                out.push_str(&format!("stderr:\n{stderr}\n"));
            }
        }
        Activation::Completed(result) => {
            out.push_str(&format!(
                "[{}] ✗ Error: {}\n",
                directive.label,
                result.error.as_deref().unwrap_or("unknown error")
            ));
            if !result.output.is_empty() {
                out.push_str(&result.output);
                out.push('\n');
            }
        }
        Activation::Blocked(blocked) => {
            out.push_str(&format!(
                "[{}] ⚠ {}: {}\n",
                directive.label, blocked.script_path, blocked.reason
            ));
            for e in &blocked.validation.errors {
                out.push_str(&format!("  error: {e}\n"));
            }
            for w in &blocked.validation.warnings {
                out.push_str(&format!("  warning: {w}\n"));
            }
            if blocked.approvable {
                out.push_str("  re-run with --approve to trust this script\n");
            }
        }
    }
    out
}

/// Applies administrative trust changes. Returns how many took effect.
fn apply_trust_actions(registry: &mut TrustRegistry, actions: &[TrustAction]) -> usize {
    let mut applied = 0;
    for action in actions {
        let done = match action {
            TrustAction::Revoke(script) => registry.revoke(script),
            TrustAction::Forget(script) => registry.remove(script).is_some(),
            TrustAction::Grant { script, tag } => registry.grant(script, tag),
            TrustAction::Check { script, tag } => {
                let granted = registry.has_permission(script, tag);
                println!("{script}\t{tag}\t{}", if granted { "granted" } else { "not granted" });
                granted
            }
        };
        if done {
            applied += 1;
        } else if !matches!(action, TrustAction::Check { .. }) {
            warn!("No permission record for {action:?}");
        }
    }
    applied
}

/// Writes the engine's trust records back to the store, when one is configured.
fn persist_trust(store_path: Option<&Path>, engine: &Engine) -> Result<()> {
    match store_path {
        Some(path) => store::save(path, &engine.trust_records()),
        None => Ok(()),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let options = match parse_args(std::env::args().skip(1)) {
        Ok(CliAction::Help) => {
            print_help();
            return Ok(());
        }
        Ok(CliAction::Version) => {
            println!("interactive-buttons v{}", env!("CARGO_PKG_VERSION"));
            return Ok(());
        }
        Ok(CliAction::Run(options)) => options,
        Err(e) => {
            eprintln!("error: {e}\n\nRun with --help for usage.");
            std::process::exit(2);
        }
    };

    // Logs go to stderr, script output to stdout
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("interactive_buttons=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let mut config = load_config(options.config_path.as_deref())?;
    if let Some(store_path) = &config.trust.store_path {
        let stored = store::load(store_path)?;
        config.trust.trusted_scripts.extend(stored);
    }
    let store_path = config.trust.store_path.clone();

    if !options.trust_actions.is_empty() {
        let Some(path) = store_path else {
            bail!("Trust options need trust.store_path in the configuration");
        };
        let mut registry = TrustRegistry::new(
            config.trust.require_approval,
            config.trust.trusted_scripts,
        );
        let applied = apply_trust_actions(&mut registry, &options.trust_actions);
        store::save(&path, registry.records())?;
        info!("{applied} trust change(s) saved to {}", path.display());
        return Ok(());
    }

    let Some(document) = options.document else {
        bail!("Missing <DOCUMENT> argument");
    };
    let text = std::fs::read_to_string(&document)
        .with_context(|| format!("Cannot read document {}", document.display()))?;
    let working_dir = options
        .workdir
        .unwrap_or_else(|| working_dir_for(&document));

    let directives: Vec<Directive> = directive::parse(&text)
        .into_iter()
        .filter(|d| options.label.as_deref().map_or(true, |label| d.label == label))
        .collect();
    info!("Found {} directive(s) in {}", directives.len(), document.display());

    if options.list {
        for d in &directives {
            println!(
                "{}\t!{}\t{}\t{}\t{}",
                d.label,
                d.command,
                d.script_path,
                d.args.join(" "),
                d.output_mode.as_str()
            );
        }
        return Ok(());
    }
    if directives.is_empty() {
        warn!("Nothing to run");
        return Ok(());
    }

    let engine = Engine::new(config);

    if options.approve {
        let scripts: BTreeSet<&str> = directives.iter().map(|d| d.script_path.as_str()).collect();
        for script in scripts {
            if let Err(e) = engine.approve(&working_dir, script).await {
                error!("Cannot approve {script}: {e:#}");
            }
        }
    }

    let activations = tokio::select! {
        activations = engine.activate_all(&directives, &working_dir) => activations,
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown signal received, exiting");
            return persist_trust(store_path.as_deref(), &engine);
        }
    };

    let by_id: HashMap<&str, &Directive> = directives.iter().map(|d| (d.id.as_str(), d)).collect();
    let mut failures = 0;
    for activation in &activations {
        if let Some(d) = by_id.get(activation.button_id()) {
            print!("{}", render(d, activation));
        }
        if !activation.succeeded() {
            failures += 1;
        }
    }

    persist_trust(store_path.as_deref(), &engine)?;

    if failures > 0 {
        error!("{failures} of {} directive(s) did not complete", directives.len());
        std::process::exit(1);
    }
    Ok(())
}
