//! Button directives embedded in document text.
//!
//! Grammar, one directive per match:
//!
//! ```text
//! [![Label] Button: !command "path/to/script" arg1 arg2]
//! ```
//!
//! Malformed matches are skipped one by one; parsing never fails as a whole.
use std::sync::LazyLock;

use regex::{Captures, Regex};
use tracing::debug;

static DIRECTIVE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"\[!\[(.*?)\]\s*Button:\s*!(\w+)\s+"([^"]+)"(.*?)\]"#)
        .expect("directive grammar")
});

/// Characters never allowed in a script path.
const FORBIDDEN_PATH_CHARS: &[char] = &['<', '>', ':', '"', '|', '?', '*'];

/// Where the presentation layer shows a directive's output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputMode {
    // Never produced by the parser; a rendering host may switch to these.
    #[allow(dead_code)]
    Inline,
    #[allow(dead_code)]
    Modal,
    #[default]
    Below,
}

impl OutputMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutputMode::Inline => "inline",
            OutputMode::Modal => "modal",
            OutputMode::Below => "below",
        }
    }
}

/// One parsed button declaration.
#[derive(Debug, Clone, PartialEq)]
pub struct Directive {
    /// Per-parse identity, not derived from content.
    pub id: String,
    pub label: String,
    /// Lower-cased command kind tag (`python`, `sh`, ...)
    pub command: String,
    /// Relative to the working root, never contains `..`
    pub script_path: String,
    pub args: Vec<String>,
    pub output_mode: OutputMode,
}

#[cfg(test)]
impl Directive {
    /// True when both directives describe the same action, ignoring `id`.
    pub fn same_action(&self, other: &Directive) -> bool {
        self.label == other.label
            && self.command == other.command
            && self.script_path == other.script_path
            && self.args == other.args
    }
}

/// Extracts every well-formed directive from `text`, in order of appearance.
pub fn parse(text: &str) -> Vec<Directive> {
    DIRECTIVE_RE
        .captures_iter(text)
        .filter_map(|caps| {
            let directive = parse_match(&caps);
            if directive.is_none() {
                debug!("Skipping malformed directive: {}", &caps[0]);
            }
            directive
        })
        .collect()
}

fn parse_match(caps: &Captures<'_>) -> Option<Directive> {
    let label = caps.get(1)?.as_str().trim();
    let command = caps.get(2)?.as_str().to_lowercase();
    let script_path = sanitize_path(caps.get(3)?.as_str());
    let args = caps
        .get(4)
        .map(|m| m.as_str().split_whitespace().map(String::from).collect())
        .unwrap_or_default();

    if label.is_empty() || command.is_empty() || script_path.is_empty() {
        return None;
    }

    Some(Directive {
        id: generate_id(),
        label: label.to_string(),
        command,
        script_path,
        args,
        output_mode: OutputMode::default(),
    })
}

/// Normalizes a script path so it stays relative to the working root.
///
/// Drops forbidden characters, then empty, `.` and `..` segments.
pub fn sanitize_path(input: &str) -> String {
    let cleaned: String = input
        .trim()
        .chars()
        .filter(|c| !FORBIDDEN_PATH_CHARS.contains(c))
        .collect();

    cleaned
        .split(['/', '\\'])
        .map(str::trim)
        .filter(|seg| !seg.is_empty() && *seg != "." && *seg != "..")
        .collect::<Vec<_>>()
        .join("/")
}

fn generate_id() -> String {
    format!("btn_{}", uuid::Uuid::new_v4().simple())
}
