use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Capability class of a registered tool. Classification is data on the
/// descriptor, not a trait hierarchy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Capability {
    Read,
    Write,
    Action,
    Meta,
}

impl Capability {
    /// Write and Action both mutate state or spawn processes; the
    /// provenance gate treats them identically.
    pub fn is_mutating(self) -> bool {
        matches!(self, Capability::Write | Capability::Action)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Capability::Read => "read",
            Capability::Write => "write",
            Capability::Action => "action",
            Capability::Meta => "meta",
        }
    }
}

/// Canonical failure kinds surfaced in tool results. The string forms are
/// part of the wire contract with the model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    ParseError,
    PermissionDenied,
    ProvenanceBlocked,
    OutsideSandbox,
    Protected,
    BlockedExtension,
    NonAsciiCommand,
    BlockedMetacharacter,
    CommandNotAllowed,
    InlineInterpreter,
    AmbiguousMatch,
    NotFound,
    TimedOut,
    OutputTruncated,
    IntegrityFailure,
    InternalError,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::ParseError => "parse_error",
            ErrorKind::PermissionDenied => "permission_denied",
            ErrorKind::ProvenanceBlocked => "provenance_blocked",
            ErrorKind::OutsideSandbox => "outside_sandbox",
            ErrorKind::Protected => "protected",
            ErrorKind::BlockedExtension => "blocked_extension",
            ErrorKind::NonAsciiCommand => "non_ascii_command",
            ErrorKind::BlockedMetacharacter => "blocked_metacharacter",
            ErrorKind::CommandNotAllowed => "command_not_allowed",
            ErrorKind::InlineInterpreter => "inline_interpreter",
            ErrorKind::AmbiguousMatch => "ambiguous_match",
            ErrorKind::NotFound => "not_found",
            ErrorKind::TimedOut => "timed_out",
            ErrorKind::OutputTruncated => "output_truncated",
            ErrorKind::IntegrityFailure => "integrity_failure",
            ErrorKind::InternalError => "internal_error",
        }
    }
}

/// A single argument value in a tool call. Bare tokens are coerced to
/// integers and booleans at parse time; everything else stays a string.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ArgValue {
    Str(String),
    Int(i64),
    Bool(bool),
}

impl ArgValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            ArgValue::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            ArgValue::Int(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            ArgValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Lossy string form used for permission previews and audit records.
    pub fn display(&self) -> String {
        match self {
            ArgValue::Str(s) => s.clone(),
            ArgValue::Int(n) => n.to_string(),
            ArgValue::Bool(b) => b.to_string(),
        }
    }
}

/// A tool invocation parsed out of model output. Keyword arguments keep
/// their emission order so parse → serialize is the identity.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolCall {
    pub name: String,
    pub positional: Vec<ArgValue>,
    pub keyword: Vec<(String, ArgValue)>,
    /// Byte range of the `::TOOL …::` marker in the model output.
    pub span: (usize, usize),
}

impl ToolCall {
    pub fn kwarg(&self, key: &str) -> Option<&ArgValue> {
        self.keyword
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v)
    }

    /// Parameter lookup: positional index first, keyword fallback.
    pub fn arg(&self, index: usize, key: &str) -> Option<&ArgValue> {
        self.positional.get(index).or_else(|| self.kwarg(key))
    }

    pub fn preview(&self) -> String {
        let mut parts: Vec<String> = self.positional.iter().map(|v| v.display()).collect();
        for (k, v) in &self.keyword {
            parts.push(format!("{k}={}", v.display()));
        }
        let joined = parts.join(", ");
        let capped: String = joined.chars().take(120).collect();
        format!("{}({})", self.name, capped)
    }
}

/// Outcome of one tool invocation. Serialized verbatim into the framed
/// `[TOOL_RESULT]` block.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolResult {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    #[serde(default)]
    pub truncated: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bytes_read: Option<u64>,
}

impl ToolResult {
    pub fn success(data: Value) -> Self {
        ToolResult {
            ok: true,
            data: Some(data),
            error_kind: None,
            detail: None,
            truncated: false,
            bytes_read: None,
        }
    }

    pub fn failure(kind: ErrorKind, detail: impl Into<String>) -> Self {
        ToolResult {
            ok: false,
            data: None,
            error_kind: Some(kind),
            detail: Some(detail.into()),
            truncated: false,
            bytes_read: None,
        }
    }

    pub fn with_truncated(mut self, truncated: bool) -> Self {
        self.truncated = truncated;
        self
    }

    pub fn with_bytes_read(mut self, bytes: u64) -> Self {
        self.bytes_read = Some(bytes);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

/// One conversation entry. Tool results are carried as plain content; the
/// protocol embeds calls and results in text rather than structured fields.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

impl Message {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Message {
            role,
            content: content.into(),
        }
    }
}

/// Truncate a string to at most `max_bytes` without splitting a UTF-8
/// code point. Returns the (possibly shortened) string and whether it
/// was cut.
pub fn truncate_utf8_to_bytes(input: &str, max_bytes: usize) -> (String, bool) {
    if max_bytes == 0 || input.len() <= max_bytes {
        return (input.to_string(), false);
    }
    let mut end = max_bytes;
    while end > 0 && !input.is_char_boundary(end) {
        end -= 1;
    }
    (input[..end].to_string(), true)
}
