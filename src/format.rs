//! Text sanitisation for parser output and activity summaries.

/// Collapse a blob onto one line: newlines become spaces, whitespace runs
/// collapse to a single space.
pub fn single_line(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Truncate to `max` characters, appending `…` when anything was dropped.
/// Operates on characters, not bytes, so multibyte input stays valid.
pub fn truncate_chars(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        return s.to_string();
    }
    let mut out: String = s.chars().take(max).collect();
    out.push('…');
    out
}

/// Long paths shrink to their basename.
pub fn trim_path(path: &str) -> String {
    if path.chars().count() <= 30 {
        return path.to_string();
    }
    path.rsplit(['/', '\\']).next().unwrap_or(path).to_string()
}

pub fn trim_command(command: &str) -> String {
    truncate_chars(&single_line(command), 40)
}

pub fn trim_snippet(text: &str) -> String {
    truncate_chars(&single_line(text), 50)
}

/// Human summary of a tool call. The first key of the map names the tool;
/// its value carries tool-specific arguments in whatever shape the backend
/// chose.
pub fn summarize_tool_call(call: &serde_json::Map<String, serde_json::Value>) -> String {
    let Some((tool, args)) = call.iter().next() else {
        return "(empty tool call)".to_string();
    };

    let arg_str = |keys: &[&str]| -> Option<String> {
        if let Some(s) = args.as_str() {
            return Some(s.to_string());
        }
        for key in keys {
            if let Some(v) = args.get(*key).and_then(|v| v.as_str()) {
                return Some(v.to_string());
            }
        }
        None
    };

    match tool.as_str() {
        "shell" | "bash" | "exec" => {
            let cmd = arg_str(&["command", "simpleCommand", "cmd"]).unwrap_or_default();
            format!("{tool}: {}", trim_command(&cmd))
        }
        "ls" | "read" | "write" | "edit" | "apply_patch" | "apply-patch" => {
            let path = arg_str(&["path", "file_path", "filename"]).unwrap_or_default();
            format!("{tool}: {}", trim_path(&path))
        }
        "search" | "grep" | "glob" => {
            let pattern = arg_str(&["pattern", "query", "path"]).unwrap_or_default();
            format!("{tool}: {}", trim_command(&pattern))
        }
        "web_search" | "web-search" | "fetch" => {
            let query = arg_str(&["query", "url"]).unwrap_or_default();
            format!("{tool}: {}", trim_command(&query))
        }
        _ => tool.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn map(v: serde_json::Value) -> serde_json::Map<String, serde_json::Value> {
        v.as_object().unwrap().clone()
    }

    #[test]
    fn single_line_collapses_whitespace() {
        assert_eq!(single_line("a\r\nb\n\n  c\td"), "a b c d");
    }

    #[test]
    fn truncate_respects_char_boundaries() {
        let s = "日本語のテキストです".repeat(10);
        let out = truncate_chars(&s, 40);
        assert_eq!(out.chars().count(), 41);
        assert!(out.ends_with('…'));
    }

    #[test]
    fn short_path_kept_long_path_trimmed_to_basename() {
        assert_eq!(trim_path("src/main.rs"), "src/main.rs");
        assert_eq!(
            trim_path("/very/long/path/to/some/deeply/nested/file.rs"),
            "file.rs"
        );
    }

    #[test]
    fn command_truncated_at_forty() {
        let cmd = "cargo build --release --target x86_64-unknown-linux-gnu";
        let out = trim_command(cmd);
        assert!(out.ends_with('…'));
        assert_eq!(out.chars().count(), 41);
    }

    #[test]
    fn shell_tool_summary_extracts_command() {
        let call = map(json!({"shell": {"command": "cargo test"}}));
        assert_eq!(summarize_tool_call(&call), "shell: cargo test");
    }

    #[test]
    fn simple_command_fallback() {
        let call = map(json!({"shell": {"simpleCommand": "ls -la"}}));
        assert_eq!(summarize_tool_call(&call), "shell: ls -la");
    }

    #[test]
    fn read_tool_summary_extracts_path() {
        let call = map(json!({"read": {"file_path": "src/store.rs"}}));
        assert_eq!(summarize_tool_call(&call), "read: src/store.rs");
    }

    #[test]
    fn unknown_tool_renders_name_only() {
        let call = map(json!({"telepathy": {"target": "mars"}}));
        assert_eq!(summarize_tool_call(&call), "telepathy");
    }

    #[test]
    fn empty_tool_call() {
        assert_eq!(summarize_tool_call(&map(json!({}))), "(empty tool call)");
    }
}
