use std::collections::BTreeMap;
use std::sync::OnceLock;

use regex::Regex;
use serde_json::Value;

use crate::policy::MAX_FRAME_BYTES;
use crate::types::{truncate_utf8_to_bytes, ArgValue, Capability, ToolCall, ToolResult};

/// Single-line tool-call grammar: `::TOOL name(arglist)::`. The arglist
/// may span lines inside quotes, so the body match is dot-all.
fn call_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?s)::TOOL\s+(\w+)\((.*?)\)\s*::").expect("static call regex"))
}

/// One extracted marker: either a valid call or a parse failure that is
/// reported back to the model at the same position in the sequence.
#[derive(Debug, Clone)]
pub struct ParsedCall {
    pub span: (usize, usize),
    pub outcome: Result<ToolCall, ParseFailure>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ParseFailure {
    pub name: Option<String>,
    pub detail: String,
}

/// Extract every tool-call marker from a model generation, in emission
/// order. Malformed argument lists become `ParseFailure` entries rather
/// than aborting extraction.
pub fn extract_tool_calls(text: &str) -> Vec<ParsedCall> {
    let mut out = Vec::new();
    for caps in call_regex().captures_iter(text) {
        let whole = caps.get(0).expect("match");
        let name = caps.get(1).expect("name").as_str().to_string();
        let args_str = caps.get(2).expect("args").as_str();
        let span = (whole.start(), whole.end());
        let outcome = match parse_args(args_str) {
            Ok((positional, keyword)) => Ok(ToolCall {
                name: name.clone(),
                positional,
                keyword,
                span,
            }),
            Err(detail) => Err(ParseFailure {
                name: Some(name),
                detail,
            }),
        };
        out.push(ParsedCall { span, outcome });
    }
    out
}

/// Canonical text form of a call; the inverse of `extract_tool_calls`
/// for well-formed inputs.
pub fn serialize_tool_call(call: &ToolCall) -> String {
    let mut parts: Vec<String> = call.positional.iter().map(render_value).collect();
    for (key, value) in &call.keyword {
        parts.push(format!("{key}={}", render_value(value)));
    }
    format!("::TOOL {}({})::", call.name, parts.join(", "))
}

fn render_value(value: &ArgValue) -> String {
    match value {
        ArgValue::Str(s) => {
            let escaped = s.replace('\\', "\\\\").replace('"', "\\\"");
            format!("\"{escaped}\"")
        }
        ArgValue::Int(n) => n.to_string(),
        ArgValue::Bool(b) => b.to_string(),
    }
}

/// Split the arglist into positional values and key=value pairs.
/// Values are quoted strings (escapes limited to `\"` and `\\`) or bare
/// tokens; bare tokens coerce to integers and booleans.
fn parse_args(args_str: &str) -> Result<(Vec<ArgValue>, Vec<(String, ArgValue)>), String> {
    let mut positional = Vec::new();
    let mut keyword: Vec<(String, ArgValue)> = Vec::new();

    for piece in split_top_level(args_str)? {
        let piece = piece.trim();
        if piece.is_empty() {
            continue;
        }
        match split_keyword(piece) {
            Some((key, value_str)) => {
                let value = parse_value(value_str.trim())?;
                if keyword.iter().any(|(k, _)| k == &key) {
                    return Err(format!("duplicate keyword argument: {key}"));
                }
                keyword.push((key, value));
            }
            None => {
                if !keyword.is_empty() {
                    return Err("positional argument after keyword argument".to_string());
                }
                positional.push(parse_value(piece)?);
            }
        }
    }
    Ok((positional, keyword))
}

/// Comma split that ignores commas inside quoted strings.
fn split_top_level(input: &str) -> Result<Vec<String>, String> {
    let mut pieces = Vec::new();
    let mut current = String::new();
    let mut quote: Option<char> = None;
    let mut escaped = false;

    for c in input.chars() {
        match quote {
            Some(q) => {
                current.push(c);
                if escaped {
                    escaped = false;
                } else if c == '\\' {
                    escaped = true;
                } else if c == q {
                    quote = None;
                }
            }
            None => match c {
                '\'' | '"' => {
                    quote = Some(c);
                    current.push(c);
                }
                ',' => pieces.push(std::mem::take(&mut current)),
                _ => current.push(c),
            },
        }
    }
    if quote.is_some() {
        return Err("unterminated quoted string".to_string());
    }
    if !current.trim().is_empty() {
        pieces.push(current);
    }
    Ok(pieces)
}

/// `key=value` detection: the piece must start with an identifier
/// followed by `=` outside any quoting.
fn split_keyword(piece: &str) -> Option<(String, String)> {
    if piece.starts_with('"') || piece.starts_with('\'') {
        return None;
    }
    let eq = piece.find('=')?;
    let key = piece[..eq].trim();
    if key.is_empty()
        || !key
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_')
        || key.chars().next().is_some_and(|c| c.is_ascii_digit())
    {
        return None;
    }
    Some((key.to_string(), piece[eq + 1..].to_string()))
}

fn parse_value(raw: &str) -> Result<ArgValue, String> {
    if raw.is_empty() {
        return Err("empty argument value".to_string());
    }
    let first = raw.chars().next().expect("non-empty");
    if first == '"' || first == '\'' {
        return parse_quoted(raw, first);
    }
    if raw == "true" {
        return Ok(ArgValue::Bool(true));
    }
    if raw == "false" {
        return Ok(ArgValue::Bool(false));
    }
    if let Ok(n) = raw.parse::<i64>() {
        return Ok(ArgValue::Int(n));
    }
    // Bare tokens must look like tokens, not expressions.
    if raw.chars().any(|c| c.is_whitespace() || c == '(' || c == ')') {
        return Err(format!("malformed bare token: {raw}"));
    }
    Ok(ArgValue::Str(raw.to_string()))
}

fn parse_quoted(raw: &str, quote: char) -> Result<ArgValue, String> {
    let inner = &raw[1..];
    let mut out = String::new();
    let mut escaped = false;
    let mut closed = false;
    for (i, c) in inner.char_indices() {
        if closed {
            return Err(format!("trailing content after closing quote: {raw}"));
        }
        if escaped {
            match c {
                '"' | '\\' | '\'' => out.push(c),
                other => {
                    // Only `\"` and `\\` are escapes; keep the backslash.
                    out.push('\\');
                    out.push(other);
                }
            }
            escaped = false;
            continue;
        }
        match c {
            '\\' => escaped = true,
            c if c == quote => {
                closed = true;
                if i + c.len_utf8() != inner.len() {
                    return Err(format!("trailing content after closing quote: {raw}"));
                }
            }
            _ => out.push(c),
        }
    }
    if !closed {
        return Err(format!("unterminated quoted string: {raw}"));
    }
    Ok(ArgValue::Str(out))
}

/// Static descriptor for one registered tool. Signatures are parameter
/// name lists; coercion against them is explicit in the handlers.
#[derive(Debug, Clone, Copy)]
pub struct ToolSpec {
    pub name: &'static str,
    pub capability: Capability,
    pub description: &'static str,
    /// Parameters that must be supplied, positionally or by keyword.
    pub required: &'static [&'static str],
    /// Optional parameters, positional after the required ones.
    pub optional: &'static [&'static str],
}

impl ToolSpec {
    fn param_names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.required.iter().chain(self.optional.iter()).copied()
    }
}

/// Closed registry of tool descriptors. Populated at boot, then frozen;
/// registration after freeze is a programming error surfaced as `Err`.
pub struct ToolRegistry {
    specs: BTreeMap<String, ToolSpec>,
    frozen: bool,
}

impl ToolRegistry {
    pub fn new() -> Self {
        ToolRegistry {
            specs: BTreeMap::new(),
            frozen: false,
        }
    }

    pub fn register(&mut self, spec: ToolSpec) -> anyhow::Result<()> {
        if self.frozen {
            anyhow::bail!("tool registry is frozen; cannot register '{}'", spec.name);
        }
        if self.specs.contains_key(spec.name) {
            anyhow::bail!("tool '{}' is already registered", spec.name);
        }
        self.specs.insert(spec.name.to_string(), spec);
        Ok(())
    }

    pub fn freeze(&mut self) {
        self.frozen = true;
    }

    pub fn get(&self, name: &str) -> Option<&ToolSpec> {
        self.specs.get(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.specs.keys().map(String::as_str)
    }

    /// Arity and keyword validation against the tool's signature.
    pub fn validate_call(&self, call: &ToolCall) -> Result<(), String> {
        let Some(spec) = self.get(&call.name) else {
            return Err(format!("unknown tool: {}", call.name));
        };
        let max_args = spec.required.len() + spec.optional.len();
        if call.positional.len() > max_args {
            return Err(format!(
                "too many positional arguments for {} (max {max_args})",
                call.name
            ));
        }
        for (key, _) in &call.keyword {
            if !spec.param_names().any(|p| p == key) {
                return Err(format!("unknown parameter '{key}' for {}", call.name));
            }
        }
        for (i, param) in spec.required.iter().enumerate() {
            let supplied = i < call.positional.len() || call.kwarg(param).is_some();
            if !supplied {
                return Err(format!("missing required parameter '{param}' for {}", call.name));
            }
        }
        Ok(())
    }

    /// One line per tool for the system prompt.
    pub fn render_tool_docs(&self) -> String {
        let mut lines = Vec::new();
        for spec in self.specs.values() {
            let mut params: Vec<String> = spec.required.iter().map(|p| p.to_string()).collect();
            params.extend(spec.optional.iter().map(|p| format!("{p}?")));
            lines.push(format!(
                "::TOOL {}({}):: — {}",
                spec.name,
                params.join(", "),
                spec.description
            ));
        }
        lines.join("\n")
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Frame a result for reinjection. Payloads above the frame cap are
/// replaced by a truncated string dump and marked `truncated`.
pub fn frame_result(name: &str, result: &ToolResult) -> String {
    let mut framed = result.clone();
    let mut json = serde_json::to_string(&framed)
        .unwrap_or_else(|e| format!("{{\"ok\":false,\"error_kind\":\"internal_error\",\"detail\":\"serialize: {e}\"}}"));
    if json.len() > MAX_FRAME_BYTES {
        framed.truncated = true;
        if let Some(data) = framed.data.take() {
            let dump = data.to_string();
            let (cut, _) = truncate_utf8_to_bytes(&dump, MAX_FRAME_BYTES.saturating_sub(512));
            framed.data = Some(Value::String(cut));
        }
        json = serde_json::to_string(&framed)
            .unwrap_or_else(|e| format!("{{\"ok\":false,\"error_kind\":\"internal_error\",\"detail\":\"serialize: {e}\"}}"));
    }
    format!("[TOOL_RESULT {name}]\n{json}\n[/TOOL_RESULT]")
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::{extract_tool_calls, frame_result, serialize_tool_call, ToolRegistry, ToolSpec};
    use crate::types::{ArgValue, Capability, ToolCall, ToolResult};

    fn registry_with_file_read() -> ToolRegistry {
        let mut reg = ToolRegistry::new();
        reg.register(ToolSpec {
            name: "file_read",
            capability: Capability::Read,
            description: "Read a file",
            required: &["path"],
            optional: &["offset", "limit"],
        })
        .expect("register");
        reg
    }

    #[test]
    fn extracts_calls_in_emission_order() {
        let text = "first ::TOOL file_read(path=\"a.txt\"):: then ::TOOL bash_exec(command=\"ls\"):: done";
        let calls = extract_tool_calls(text);
        assert_eq!(calls.len(), 2);
        let first = calls[0].outcome.as_ref().expect("parsed");
        assert_eq!(first.name, "file_read");
        assert_eq!(first.kwarg("path").and_then(|v| v.as_str()), Some("a.txt"));
        let second = calls[1].outcome.as_ref().expect("parsed");
        assert_eq!(second.name, "bash_exec");
        assert!(calls[0].span.0 < calls[1].span.0);
    }

    #[test]
    fn positional_keyword_and_typed_args() {
        let calls = extract_tool_calls("::TOOL file_read(\"src/main.rs\", offset=10, limit=50)::");
        let call = calls[0].outcome.as_ref().expect("parsed");
        assert_eq!(call.positional, vec![ArgValue::Str("src/main.rs".into())]);
        assert_eq!(call.kwarg("offset").and_then(|v| v.as_i64()), Some(10));
        assert_eq!(call.kwarg("limit").and_then(|v| v.as_i64()), Some(50));
        let calls = extract_tool_calls("::TOOL file_edit(path=\"a\", find=\"x\", replace=\"y\", occurrence=2)::");
        let call = calls[0].outcome.as_ref().expect("parsed");
        assert_eq!(call.keyword.len(), 4);
    }

    #[test]
    fn quoted_strings_support_limited_escapes() {
        let calls = extract_tool_calls(r#"::TOOL file_write(path="a.txt", content="say \"hi\" \\ done")::"#);
        let call = calls[0].outcome.as_ref().expect("parsed");
        assert_eq!(
            call.kwarg("content").and_then(|v| v.as_str()),
            Some("say \"hi\" \\ done")
        );
    }

    #[test]
    fn commas_inside_quotes_do_not_split() {
        let calls = extract_tool_calls("::TOOL file_write(path=\"a.txt\", content=\"one, two, three\")::");
        let call = calls[0].outcome.as_ref().expect("parsed");
        assert_eq!(
            call.kwarg("content").and_then(|v| v.as_str()),
            Some("one, two, three")
        );
    }

    #[test]
    fn malformed_args_yield_parse_failures() {
        let calls = extract_tool_calls("::TOOL file_read(path=\"unterminated)::");
        assert_eq!(calls.len(), 1);
        let failure = calls[0].outcome.as_ref().expect_err("failure");
        assert_eq!(failure.name.as_deref(), Some("file_read"));
        let calls = extract_tool_calls("::TOOL file_read(path=\"a\", \"b\")::");
        assert!(calls[0].outcome.is_err(), "positional after keyword");
    }

    #[test]
    fn text_without_markers_parses_nothing() {
        assert!(extract_tool_calls("just prose, no calls here").is_empty());
        // A bare `::name(...)::` without the TOOL keyword is not a call.
        assert!(extract_tool_calls("::file_read(path=\"a\")::").is_empty());
    }

    #[test]
    fn parse_serialize_round_trip_is_identity() {
        let inputs = [
            "::TOOL file_read(\"a.txt\")::",
            "::TOOL file_read(\"a.txt\", offset=10)::",
            "::TOOL bash_exec(command=\"git status\")::",
            "::TOOL file_edit(path=\"x\", find=\"a\", replace=\"b\", occurrence=2)::",
            "::TOOL git_commit(message=\"fix: handle \\\"quoted\\\" args\")::",
        ];
        for input in inputs {
            let calls = extract_tool_calls(input);
            let call = calls[0].outcome.as_ref().expect("parsed");
            assert_eq!(serialize_tool_call(call), input, "{input}");
        }
    }

    #[test]
    fn registry_validates_signatures() {
        let reg = registry_with_file_read();
        let ok = ToolCall {
            name: "file_read".into(),
            positional: vec![ArgValue::Str("a.txt".into())],
            keyword: vec![("limit".into(), ArgValue::Int(5))],
            span: (0, 0),
        };
        reg.validate_call(&ok).expect("valid");

        let missing = ToolCall {
            name: "file_read".into(),
            positional: vec![],
            keyword: vec![],
            span: (0, 0),
        };
        assert!(reg.validate_call(&missing).expect_err("invalid").contains("path"));

        let unknown_param = ToolCall {
            name: "file_read".into(),
            positional: vec![ArgValue::Str("a".into())],
            keyword: vec![("nope".into(), ArgValue::Int(1))],
            span: (0, 0),
        };
        assert!(reg.validate_call(&unknown_param).is_err());
    }

    #[test]
    fn registry_is_closed_after_freeze() {
        let mut reg = registry_with_file_read();
        reg.freeze();
        let err = reg.register(ToolSpec {
            name: "late_tool",
            capability: Capability::Meta,
            description: "too late",
            required: &[],
            optional: &[],
        });
        assert!(err.is_err());
        let dup = ToolRegistry::new().register(ToolSpec {
            name: "file_read",
            capability: Capability::Read,
            description: "",
            required: &[],
            optional: &[],
        });
        assert!(dup.is_ok());
    }

    #[test]
    fn framing_wraps_json_and_caps_size() {
        let result = ToolResult::success(json!({"content": "hello"}));
        let framed = frame_result("file_read", &result);
        assert!(framed.starts_with("[TOOL_RESULT file_read]\n"));
        assert!(framed.ends_with("\n[/TOOL_RESULT]"));
        let body: serde_json::Value =
            serde_json::from_str(framed.lines().nth(1).expect("json line")).expect("json");
        assert_eq!(body["ok"].as_bool(), Some(true));

        let huge = ToolResult::success(json!({"content": "x".repeat(200_000)}));
        let framed = frame_result("file_read", &huge);
        assert!(framed.len() < 60_000);
        let body: serde_json::Value =
            serde_json::from_str(framed.lines().nth(1).expect("json line")).expect("json");
        assert_eq!(body["truncated"].as_bool(), Some(true));
    }
}
