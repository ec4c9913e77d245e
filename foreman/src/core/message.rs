//! Typed worker messages parsed from the worker's JSONL output stream.
//!
//! Each stdout line is one JSON object with a `type` discriminator. A single
//! `assistant` or `user` line may carry several content blocks, so one line can
//! expand into several messages. Anything unrecognised becomes
//! [`WorkerMessage::Unknown`] and is logged, never treated as fatal.

use serde::Deserialize;
use serde_json::Value;

use super::types::{LogEntry, LogKind};

/// Longest payload kept for a single log entry.
const MAX_PAYLOAD_CHARS: usize = 4_000;

#[derive(Debug, Clone, PartialEq)]
pub enum WorkerMessage {
    Init {
        session_id: Option<String>,
        model: Option<String>,
    },
    System {
        subtype: String,
    },
    Text(String),
    ToolUse {
        name: String,
        input: Value,
    },
    ToolResult {
        content: String,
        is_error: bool,
    },
    /// Terminal message; nothing after it is consumed.
    Result(WorkerResult),
    /// One line the worker wrote to stderr.
    Stderr(String),
    Unknown {
        kind: String,
        raw: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerResult {
    pub success: bool,
    pub subtype: String,
    pub text: Option<String>,
}

impl WorkerResult {
    pub fn failure(subtype: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            success: false,
            subtype: subtype.into(),
            text: Some(text.into()),
        }
    }

    /// Human-readable failure detail; never empty.
    pub fn failure_detail(&self) -> String {
        match self.text.as_deref().map(str::trim) {
            Some(text) if !text.is_empty() => format!("{}: {}", self.subtype, text),
            _ => format!("worker reported {}", self.subtype),
        }
    }
}

impl WorkerMessage {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Result(_))
    }

    /// Text worth scanning for artifact URLs or branch markers.
    pub fn text_content(&self) -> Option<&str> {
        match self {
            Self::Text(text) => Some(text),
            Self::ToolResult { content, .. } => Some(content),
            Self::Result(result) => result.text.as_deref(),
            Self::Init { .. }
            | Self::System { .. }
            | Self::ToolUse { .. }
            | Self::Stderr(_)
            | Self::Unknown { .. } => None,
        }
    }

    pub fn to_log_entry(&self) -> LogEntry {
        let (kind, payload) = match self {
            Self::Init { session_id, model } => (
                LogKind::System,
                format!(
                    "init session={} model={}",
                    session_id.as_deref().unwrap_or("-"),
                    model.as_deref().unwrap_or("-")
                ),
            ),
            Self::System { subtype } => (LogKind::System, subtype.clone()),
            Self::Text(text) => (LogKind::Text, text.clone()),
            Self::ToolUse { name, input } => (LogKind::ToolUse, format!("{name} {input}")),
            Self::ToolResult { content, is_error } => {
                let prefix = if *is_error { "error: " } else { "" };
                (LogKind::ToolResult, format!("{prefix}{content}"))
            }
            Self::Result(result) => (
                LogKind::Result,
                format!(
                    "{} {}",
                    result.subtype,
                    result.text.as_deref().unwrap_or_default()
                )
                .trim_end()
                .to_string(),
            ),
            Self::Stderr(line) => (LogKind::Stderr, line.clone()),
            Self::Unknown { kind, raw } => (LogKind::Unknown, format!("{kind}: {raw}")),
        };
        LogEntry::new(kind, truncate_chars(&payload, MAX_PAYLOAD_CHARS))
    }
}

#[derive(Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum RawLine {
    System {
        #[serde(default)]
        subtype: Option<String>,
        #[serde(default)]
        session_id: Option<String>,
        #[serde(default)]
        model: Option<String>,
    },
    Assistant {
        message: RawMessage,
    },
    User {
        message: RawMessage,
    },
    Result {
        #[serde(default)]
        subtype: Option<String>,
        #[serde(default)]
        is_error: bool,
        #[serde(default)]
        result: Option<String>,
    },
}

#[derive(Deserialize)]
struct RawMessage {
    #[serde(default)]
    content: RawContent,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawContent {
    Text(String),
    Blocks(Vec<RawBlock>),
}

impl Default for RawContent {
    fn default() -> Self {
        Self::Blocks(Vec::new())
    }
}

#[derive(Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum RawBlock {
    Text {
        text: String,
    },
    ToolUse {
        name: String,
        #[serde(default)]
        input: Value,
    },
    ToolResult {
        #[serde(default)]
        content: Value,
        #[serde(default)]
        is_error: bool,
    },
    #[serde(other)]
    Other,
}

/// Parse one line of worker output into zero or more messages.
pub fn parse_line(line: &str) -> Vec<WorkerMessage> {
    let line = line.trim();
    if line.is_empty() {
        return Vec::new();
    }
    let value: Value = match serde_json::from_str(line) {
        Ok(value) => value,
        Err(_) => {
            return vec![WorkerMessage::Unknown {
                kind: "non-json".to_string(),
                raw: truncate_chars(line, MAX_PAYLOAD_CHARS),
            }];
        }
    };
    let kind = value
        .get("type")
        .and_then(Value::as_str)
        .unwrap_or("untyped")
        .to_string();

    match serde_json::from_value::<RawLine>(value) {
        Ok(raw) => expand(raw),
        Err(_) => vec![WorkerMessage::Unknown {
            kind,
            raw: truncate_chars(line, MAX_PAYLOAD_CHARS),
        }],
    }
}

fn expand(raw: RawLine) -> Vec<WorkerMessage> {
    match raw {
        RawLine::System {
            subtype,
            session_id,
            model,
        } => match subtype.as_deref() {
            Some("init") => vec![WorkerMessage::Init { session_id, model }],
            other => vec![WorkerMessage::System {
                subtype: other.unwrap_or("system").to_string(),
            }],
        },
        RawLine::Assistant { message } | RawLine::User { message } => match message.content {
            RawContent::Text(text) => vec![WorkerMessage::Text(text)],
            RawContent::Blocks(blocks) => blocks.into_iter().filter_map(expand_block).collect(),
        },
        RawLine::Result {
            subtype,
            is_error,
            result,
        } => {
            let subtype = subtype.unwrap_or_else(|| "result".to_string());
            let success = !is_error && subtype == "success";
            vec![WorkerMessage::Result(WorkerResult {
                success,
                subtype,
                text: result,
            })]
        }
    }
}

fn expand_block(block: RawBlock) -> Option<WorkerMessage> {
    match block {
        RawBlock::Text { text } => Some(WorkerMessage::Text(text)),
        RawBlock::ToolUse { name, input } => Some(WorkerMessage::ToolUse { name, input }),
        RawBlock::ToolResult { content, is_error } => Some(WorkerMessage::ToolResult {
            content: flatten_content(&content),
            is_error,
        }),
        RawBlock::Other => None,
    }
}

/// Tool results carry either a string or a list of `{type: text, text}` parts.
fn flatten_content(content: &Value) -> String {
    match content {
        Value::String(text) => text.clone(),
        Value::Array(parts) => parts
            .iter()
            .filter_map(|part| part.get("text").and_then(Value::as_str))
            .collect::<Vec<_>>()
            .join("\n"),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

fn truncate_chars(text: &str, max: usize) -> String {
    match text.char_indices().nth(max) {
        Some((idx, _)) => format!("{}…", &text[..idx]),
        None => text.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_init() {
        let msgs = parse_line(
            r#"{"type":"system","subtype":"init","session_id":"s-1","model":"m","tools":[]}"#,
        );
        assert_eq!(
            msgs,
            vec![WorkerMessage::Init {
                session_id: Some("s-1".to_string()),
                model: Some("m".to_string())
            }]
        );
    }

    #[test]
    fn expands_assistant_blocks_in_order() {
        let msgs = parse_line(
            r#"{"type":"assistant","message":{"content":[
                {"type":"text","text":"looking"},
                {"type":"tool_use","id":"t1","name":"Bash","input":{"command":"ls"}},
                {"type":"thinking","thinking":"hm"}
            ]}}"#,
        );
        assert_eq!(msgs.len(), 2);
        assert_eq!(msgs[0], WorkerMessage::Text("looking".to_string()));
        assert!(matches!(&msgs[1], WorkerMessage::ToolUse { name, .. } if name == "Bash"));
    }

    #[test]
    fn flattens_tool_result_parts() {
        let msgs = parse_line(
            r#"{"type":"user","message":{"content":[{"type":"tool_result","tool_use_id":"t1",
                "content":[{"type":"text","text":"a"},{"type":"text","text":"b"}],"is_error":true}]}}"#,
        );
        assert_eq!(
            msgs,
            vec![WorkerMessage::ToolResult {
                content: "a\nb".to_string(),
                is_error: true
            }]
        );
    }

    #[test]
    fn result_success_and_failure() {
        let ok = parse_line(r#"{"type":"result","subtype":"success","is_error":false,"result":"done"}"#);
        assert!(matches!(&ok[0], WorkerMessage::Result(r) if r.success));

        let failed = parse_line(r#"{"type":"result","subtype":"error_max_turns","is_error":true}"#);
        let WorkerMessage::Result(result) = &failed[0] else {
            panic!("expected result");
        };
        assert!(!result.success);
        assert!(!result.failure_detail().is_empty());
    }

    #[test]
    fn unknown_kinds_are_log_only() {
        let msgs = parse_line(r#"{"type":"stream_event","event":{}}"#);
        assert!(matches!(&msgs[0], WorkerMessage::Unknown { kind, .. } if kind == "stream_event"));

        let msgs = parse_line("plain text banner");
        assert!(matches!(&msgs[0], WorkerMessage::Unknown { kind, .. } if kind == "non-json"));
        assert_eq!(msgs[0].to_log_entry().kind, LogKind::Unknown);
    }

    #[test]
    fn blank_lines_yield_nothing() {
        assert!(parse_line("   ").is_empty());
    }
}
