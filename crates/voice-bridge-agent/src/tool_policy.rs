//! Voice-safety policy for tools advertised to the realtime endpoint.
//!
//! A voice call tolerates neither long-running work nor side effects the
//! caller cannot see. The default allow set is the short-latency,
//! read-mostly subset; the deny set names the categories that must never
//! run mid-call. Configuration may replace the allow set, and may extend —
//! but never shrink — the deny set.

use voice_bridge_core::ToolSpec;

/// Tool results are clamped to this many characters before being returned
/// to the model.
pub const TOOL_RESULT_MAX_CHARS: usize = 1000;

/// Tools cleared for voice by default: context lookup, delegation,
/// retrieval, reminders.
const DEFAULT_ALLOW: &[&str] = &[
    "get_context",
    "lookup_contact",
    "search_notes",
    "delegate_task",
    "set_reminder",
    "get_weather",
    "get_calendar",
];

/// Tools never run from a voice call.
const DEFAULT_DENY: &[&str] = &[
    "read_file",
    "write_file",
    "run_code",
    "execute_shell",
    "browser",
    "git",
    "deploy",
];

/// Filter the host's tool list down to what a realtime session may see.
///
/// `allow` (when present) replaces the default allow set; `deny` is
/// unioned with the default deny set. Deny always wins.
pub fn filter_voice_tools(
    tools: Vec<ToolSpec>,
    allow: Option<&[String]>,
    deny: Option<&[String]>,
) -> Vec<ToolSpec> {
    let allowed = |name: &str| match allow {
        Some(list) => list.iter().any(|a| a == name),
        None => DEFAULT_ALLOW.contains(&name),
    };
    let denied = |name: &str| {
        DEFAULT_DENY.contains(&name)
            || deny.is_some_and(|list| list.iter().any(|d| d == name))
    };

    tools
        .into_iter()
        .filter(|tool| allowed(&tool.name) && !denied(&tool.name))
        .collect()
}

/// Stringify and clamp a tool result for the voice channel.
pub fn clamp_tool_result(value: &serde_json::Value) -> String {
    let text = match value {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    };
    if text.chars().count() <= TOOL_RESULT_MAX_CHARS {
        return text;
    }
    text.chars().take(TOOL_RESULT_MAX_CHARS).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn spec(name: &str) -> ToolSpec {
        ToolSpec {
            name: name.into(),
            description: format!("{} tool", name),
            parameters: json!({"type": "object", "properties": {}}),
        }
    }

    #[test]
    fn default_allow_set_passes() {
        let tools = vec![spec("get_context"), spec("run_code"), spec("unknown_tool")];
        let filtered = filter_voice_tools(tools, None, None);
        let names: Vec<_> = filtered.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, vec!["get_context"]);
    }

    #[test]
    fn config_allow_replaces_default() {
        let tools = vec![spec("get_context"), spec("custom_tool")];
        let allow = vec!["custom_tool".to_string()];
        let filtered = filter_voice_tools(tools, Some(&allow), None);
        let names: Vec<_> = filtered.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, vec!["custom_tool"]);
    }

    #[test]
    fn deny_wins_over_allow() {
        let tools = vec![spec("run_code"), spec("custom_tool")];
        let allow = vec!["run_code".to_string(), "custom_tool".to_string()];
        let deny = vec!["custom_tool".to_string()];
        let filtered = filter_voice_tools(tools, Some(&allow), Some(&deny));
        assert!(filtered.is_empty());
    }

    #[test]
    fn clamp_shortens_long_results() {
        let long = json!("x".repeat(2000));
        assert_eq!(clamp_tool_result(&long).chars().count(), TOOL_RESULT_MAX_CHARS);

        let short = json!({"ok": true});
        assert_eq!(clamp_tool_result(&short), "{\"ok\":true}");
    }
}
