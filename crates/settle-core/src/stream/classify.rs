//! Classification of decoded agent stream records.
//!
//! The agent runtime emits three record shapes:
//!
//! ```text
//! {"agent":{"messages":[{"kwargs":{"content":"..."}}]}}
//! {"tools":{"messages":[{"kwargs":{"content":..., "error":"..."}}]}}
//! {"error":"..."}
//! ```
//!
//! Unknown shapes are ignored so newer runtimes can add event kinds.

use serde_json::Value;

/// One classified record from the agent stream.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    /// Assistant text to show as-is.
    AgentText(String),
    /// Output of a tool invocation.
    ToolResult(ToolResult),
    /// Explicit stream-level error. Fatal for the turn.
    ProtocolError(String),
}

/// Content carried by a tool result.
#[derive(Debug, Clone, PartialEq)]
pub enum ToolContent {
    /// Missing, `null`, `false` or an empty string.
    Absent,
    Text(String),
    /// Any other JSON value (objects, arrays, numbers).
    Structured(Value),
}

/// A tool result record.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolResult {
    pub content: ToolContent,
    pub error: Option<String>,
    /// The raw `kwargs` object of the tool message.
    pub payload: Value,
}

impl ToolResult {
    /// Text shown when the tool reported neither an error nor content.
    pub fn fallback_text(&self) -> String {
        let pretty = serde_json::to_string_pretty(&self.payload)
            .unwrap_or_else(|_| self.payload.to_string());
        format!("Tool Response: {pretty}")
    }
}

/// Classifies a decoded record.
///
/// Precedence: agent text, then tool result, then protocol error. Returns
/// `None` for records that match none of them.
pub fn classify(record: &Value) -> Option<StreamEvent> {
    if let Some(text) = first_kwargs(record, "agent")
        .and_then(|kwargs| kwargs.get("content"))
        .and_then(display_text)
    {
        return Some(StreamEvent::AgentText(text));
    }

    if let Some(kwargs) = first_kwargs(record, "tools") {
        let error = kwargs.get("error").and_then(display_text);
        let content = match kwargs.get("content") {
            Some(Value::String(text)) if !text.is_empty() => ToolContent::Text(text.clone()),
            Some(value) if is_truthy(value) => ToolContent::Structured(value.clone()),
            _ => ToolContent::Absent,
        };
        return Some(StreamEvent::ToolResult(ToolResult {
            content,
            error,
            payload: kwargs.clone(),
        }));
    }

    if let Some(error) = record.get("error") {
        let message = match error {
            Value::String(message) => message.clone(),
            other => other.to_string(),
        };
        return Some(StreamEvent::ProtocolError(message));
    }

    None
}

/// Returns `record[key].messages[0].kwargs`.
fn first_kwargs<'a>(record: &'a Value, key: &str) -> Option<&'a Value> {
    record.get(key)?.get("messages")?.get(0)?.get("kwargs")
}

/// Renders a truthy JSON value as display text.
fn display_text(value: &Value) -> Option<String> {
    match value {
        Value::String(text) if !text.is_empty() => Some(text.clone()),
        value if is_truthy(value) && !value.is_string() => Some(value.to_string()),
        _ => None,
    }
}

fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(flag) => *flag,
        Value::Number(number) => number.as_f64().is_some_and(|n| n != 0.0),
        Value::String(text) => !text.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_agent_text() {
        let record = json!({"agent": {"messages": [{"kwargs": {"content": "hi"}}]}});
        assert_eq!(
            classify(&record),
            Some(StreamEvent::AgentText("hi".to_string()))
        );
    }

    #[test]
    fn test_agent_with_empty_content_falls_through() {
        let record = json!({
            "agent": {"messages": [{"kwargs": {"content": ""}}]},
            "error": "boom"
        });
        assert_eq!(
            classify(&record),
            Some(StreamEvent::ProtocolError("boom".to_string()))
        );
    }

    #[test]
    fn test_agent_takes_precedence_over_error() {
        let record = json!({
            "agent": {"messages": [{"kwargs": {"content": "hi"}}]},
            "error": "boom"
        });
        assert!(matches!(classify(&record), Some(StreamEvent::AgentText(_))));
    }

    #[test]
    fn test_tool_text_content() {
        let record = json!({"tools": {"messages": [{"kwargs": {"content": "Balance: 1 USDT"}}]}});
        let Some(StreamEvent::ToolResult(result)) = classify(&record) else {
            panic!("expected tool result");
        };
        assert_eq!(result.content, ToolContent::Text("Balance: 1 USDT".to_string()));
        assert_eq!(result.error, None);
    }

    #[test]
    fn test_tool_error() {
        let record = json!({"tools": {"messages": [{"kwargs": {"content": "", "error": "insufficient funds"}}]}});
        let Some(StreamEvent::ToolResult(result)) = classify(&record) else {
            panic!("expected tool result");
        };
        assert_eq!(result.error.as_deref(), Some("insufficient funds"));
        assert_eq!(result.content, ToolContent::Absent);
    }

    #[test]
    fn test_tool_structured_content() {
        let record = json!({"tools": {"messages": [{"kwargs": {"content": {"balance": "1.0"}}}]}});
        let Some(StreamEvent::ToolResult(result)) = classify(&record) else {
            panic!("expected tool result");
        };
        assert_eq!(
            result.content,
            ToolContent::Structured(json!({"balance": "1.0"}))
        );
    }

    #[test]
    fn test_tool_without_content_renders_payload() {
        let record = json!({"tools": {"messages": [{"kwargs": {"name": "get_balance"}}]}});
        let Some(StreamEvent::ToolResult(result)) = classify(&record) else {
            panic!("expected tool result");
        };
        assert_eq!(result.content, ToolContent::Absent);
        let text = result.fallback_text();
        assert!(text.starts_with("Tool Response: {"));
        assert!(text.contains("\"name\": \"get_balance\""));
    }

    #[test]
    fn test_protocol_error() {
        assert_eq!(
            classify(&json!({"error": "boom"})),
            Some(StreamEvent::ProtocolError("boom".to_string()))
        );
        assert_eq!(
            classify(&json!({"error": {"code": 500}})),
            Some(StreamEvent::ProtocolError(r#"{"code":500}"#.to_string()))
        );
    }

    #[test]
    fn test_unknown_records_are_ignored() {
        assert_eq!(classify(&json!({"metadata": {"step": 3}})), None);
        assert_eq!(classify(&json!({"tools": {"messages": []}})), None);
        assert_eq!(classify(&json!(42)), None);
    }
}
