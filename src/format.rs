//! Output post-processing: line truncation, JSON detection, durations.

/// How captured output was classified.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputKind {
    Json,
    Text,
}

impl OutputKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutputKind::Json => "json",
            OutputKind::Text => "text",
        }
    }
}

/// Keeps the first `max_lines` lines and notes how many were dropped.
pub fn truncate(output: &str, max_lines: usize) -> String {
    let lines: Vec<&str> = output.split('\n').collect();
    if lines.len() <= max_lines {
        return output.to_string();
    }

    let remaining = lines.len() - max_lines;
    format!(
        "{}\n\n... ({remaining} more lines truncated)",
        lines[..max_lines].join("\n")
    )
}

/// Pretty-prints output that parses as JSON, otherwise returns it trimmed.
pub fn classify(output: &str) -> (String, OutputKind) {
    let trimmed = output.trim();
    match serde_json::from_str::<serde_json::Value>(trimmed) {
        Ok(value) => match serde_json::to_string_pretty(&value) {
            Ok(pretty) => (pretty, OutputKind::Json),
            Err(_) => (trimmed.to_string(), OutputKind::Text),
        },
        Err(_) => (trimmed.to_string(), OutputKind::Text),
    }
}

/// `750ms`, `1.5s`, `2m 5s`.
pub fn format_duration(ms: u64) -> String {
    if ms < 1000 {
        format!("{ms}ms")
    } else if ms < 60_000 {
        format!("{:.1}s", ms as f64 / 1000.0)
    } else {
        format!("{}m {}s", ms / 60_000, (ms % 60_000) / 1000)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truncate_long_output() {
        let output: Vec<String> = (1..=250).map(|i| format!("line {i}")).collect();
        let result = truncate(&output.join("\n"), 100);

        let (kept, marker) = result.split_once("\n\n").unwrap();
        let kept: Vec<&str> = kept.split('\n').collect();
        assert_eq!(kept.len(), 100);
        assert_eq!(kept[0], "line 1");
        assert_eq!(kept[99], "line 100");
        assert!(marker.contains("150 more lines truncated"));
    }

    #[test]
    fn test_truncate_short_output_unchanged() {
        assert_eq!(truncate("a\nb\nc", 3), "a\nb\nc");
        assert_eq!(truncate("", 10), "");
    }

    #[test]
    fn test_truncate_counts_trailing_newline_as_line() {
        // "a\nb\n" splits into ["a", "b", ""]
        let result = truncate("a\nb\n", 2);
        assert!(result.starts_with("a\nb\n\n"));
        assert!(result.ends_with("(1 more lines truncated)"));
    }

    #[test]
    fn test_classify_json() {
        let (formatted, kind) = classify("{\"a\":1}\n");
        assert_eq!(kind, OutputKind::Json);
        assert_eq!(formatted, "{\n  \"a\": 1\n}");
    }

    #[test]
    fn test_classify_json_array() {
        let (formatted, kind) = classify("  [1,2]  ");
        assert_eq!(kind, OutputKind::Json);
        assert_eq!(formatted, "[\n  1,\n  2\n]");
    }

    #[test]
    fn test_classify_text() {
        let (formatted, kind) = classify("  hello world\n");
        assert_eq!(kind, OutputKind::Text);
        assert_eq!(formatted, "hello world");

        let (formatted, kind) = classify("{not json}");
        assert_eq!(kind, OutputKind::Text);
        assert_eq!(formatted, "{not json}");
    }

    #[test]
    fn test_classify_empty_is_text() {
        let (formatted, kind) = classify("");
        assert_eq!(kind, OutputKind::Text);
        assert_eq!(formatted, "");
    }

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(0), "0ms");
        assert_eq!(format_duration(750), "750ms");
        assert_eq!(format_duration(1000), "1.0s");
        assert_eq!(format_duration(1500), "1.5s");
        assert_eq!(format_duration(59_999), "60.0s");
        assert_eq!(format_duration(60_000), "1m 0s");
        assert_eq!(format_duration(125_000), "2m 5s");
    }

    #[test]
    fn test_output_kind_tags() {
        assert_eq!(OutputKind::Json.as_str(), "json");
        assert_eq!(OutputKind::Text.as_str(), "text");
    }
}
