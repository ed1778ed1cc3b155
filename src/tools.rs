use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde_json::json;
use uuid::Uuid;

use crate::audit::AuditLog;
use crate::binpath::BinPathRegistry;
use crate::pathguard::{is_sensitive_file, AccessMode, PathGuard};
use crate::policy::SandboxPolicy;
use crate::protocol::{ToolRegistry, ToolSpec};
use crate::sandbox::CommandSandbox;
use crate::types::{ArgValue, Capability, ErrorKind, ToolCall, ToolResult};

const GREP_MAX_RESULTS: usize = 50;
const GLOB_MAX_RESULTS: usize = 1000;
const BINARY_SNIFF_BYTES: usize = 8192;

/// Everything a handler may touch. Handlers never perform filesystem or
/// process operations without routing through the guard and sandbox held
/// here.
pub struct ToolContext {
    pub policy: Arc<SandboxPolicy>,
    pub guard: Arc<PathGuard>,
    pub sandbox: Arc<CommandSandbox>,
    pub binpaths: Arc<BinPathRegistry>,
    pub audit: Arc<AuditLog>,
    pub workdir: PathBuf,
}

/// Register the built-in tool descriptors. The registry is frozen by the
/// caller once plugins (if any) are added.
pub fn register_builtin_tools(registry: &mut ToolRegistry) -> anyhow::Result<()> {
    let specs = [
        ToolSpec {
            name: "file_read",
            capability: Capability::Read,
            description: "Read a file with line numbers",
            required: &["path"],
            optional: &["offset", "limit"],
        },
        ToolSpec {
            name: "file_write",
            capability: Capability::Write,
            description: "Write content to a file (existing file is backed up)",
            required: &["path", "content"],
            optional: &[],
        },
        ToolSpec {
            name: "file_edit",
            capability: Capability::Write,
            description: "Replace text in a file; the match must be unique",
            required: &["path", "find", "replace"],
            optional: &["occurrence"],
        },
        ToolSpec {
            name: "glob_search",
            capability: Capability::Read,
            description: "Find files by glob pattern",
            required: &["pattern"],
            optional: &[],
        },
        ToolSpec {
            name: "grep_search",
            capability: Capability::Read,
            description: "Search file contents by regex",
            required: &["pattern"],
            optional: &["path", "max_results"],
        },
        ToolSpec {
            name: "bash_exec",
            capability: Capability::Action,
            description: "Run one validated command (no shell operators)",
            required: &["command"],
            optional: &["timeout_seconds"],
        },
        ToolSpec {
            name: "git_status",
            capability: Capability::Read,
            description: "Show working tree status",
            required: &[],
            optional: &[],
        },
        ToolSpec {
            name: "git_diff",
            capability: Capability::Read,
            description: "Show unstaged or staged changes",
            required: &[],
            optional: &["staged"],
        },
        ToolSpec {
            name: "git_log",
            capability: Capability::Read,
            description: "Show recent commits",
            required: &[],
            optional: &["count"],
        },
        ToolSpec {
            name: "git_branch",
            capability: Capability::Read,
            description: "List branches",
            required: &[],
            optional: &[],
        },
        ToolSpec {
            name: "git_add",
            capability: Capability::Action,
            description: "Stage named files (no wildcards)",
            required: &["files"],
            optional: &[],
        },
        ToolSpec {
            name: "git_commit",
            capability: Capability::Action,
            description: "Create a commit with the given message",
            required: &["message"],
            optional: &[],
        },
        ToolSpec {
            name: "tool_list",
            capability: Capability::Meta,
            description: "List registered tools",
            required: &[],
            optional: &[],
        },
    ];
    for spec in specs {
        registry.register(spec)?;
    }
    Ok(())
}

/// Invoke a validated call. The dispatcher has already arbitrated
/// permission and provenance; this is pure execution.
pub async fn invoke(call: &ToolCall, ctx: &ToolContext, registry: &ToolRegistry) -> ToolResult {
    match call.name.as_str() {
        "file_read" => file_read(call, ctx).await,
        "file_write" => file_write(call, ctx).await,
        "file_edit" => file_edit(call, ctx).await,
        "glob_search" => glob_search(call, ctx).await,
        "grep_search" => grep_search(call, ctx).await,
        "bash_exec" => crate::exec::bash_exec(call, ctx).await,
        name if name.starts_with("git_") => crate::git::run_git_tool(call, ctx).await,
        "tool_list" => tool_list(registry),
        other => ToolResult::failure(ErrorKind::ParseError, format!("unknown tool: {other}")),
    }
}

fn tool_list(registry: &ToolRegistry) -> ToolResult {
    let names: Vec<&str> = registry.names().collect();
    ToolResult::success(json!({ "tools": names }))
}

// ---------------------------------------------------------------------------
// argument coercion helpers
// ---------------------------------------------------------------------------

pub(crate) fn str_arg(call: &ToolCall, index: usize, key: &str) -> Result<String, ToolResult> {
    match call.arg(index, key) {
        Some(ArgValue::Str(s)) => Ok(s.clone()),
        Some(other) => Err(ToolResult::failure(
            ErrorKind::ParseError,
            format!("parameter '{key}' must be a string, got {}", other.display()),
        )),
        None => Err(ToolResult::failure(
            ErrorKind::ParseError,
            format!("missing parameter '{key}'"),
        )),
    }
}

pub(crate) fn int_arg(call: &ToolCall, index: usize, key: &str, default: i64) -> Result<i64, ToolResult> {
    match call.arg(index, key) {
        Some(ArgValue::Int(n)) => Ok(*n),
        Some(other) => Err(ToolResult::failure(
            ErrorKind::ParseError,
            format!("parameter '{key}' must be an integer, got {}", other.display()),
        )),
        None => Ok(default),
    }
}

pub(crate) fn bool_arg(call: &ToolCall, index: usize, key: &str, default: bool) -> Result<bool, ToolResult> {
    match call.arg(index, key) {
        Some(ArgValue::Bool(b)) => Ok(*b),
        Some(other) => Err(ToolResult::failure(
            ErrorKind::ParseError,
            format!("parameter '{key}' must be a boolean, got {}", other.display()),
        )),
        None => Ok(default),
    }
}

pub(crate) fn denied(kind: ErrorKind, detail: String) -> ToolResult {
    ToolResult::failure(kind, detail)
}

// ---------------------------------------------------------------------------
// file_read
// ---------------------------------------------------------------------------

async fn file_read(call: &ToolCall, ctx: &ToolContext) -> ToolResult {
    let path = match str_arg(call, 0, "path") {
        Ok(v) => v,
        Err(r) => return r,
    };
    let offset = match int_arg(call, 1, "offset", 0) {
        Ok(v) => v.max(0) as usize,
        Err(r) => return r,
    };
    let limit = match int_arg(call, 2, "limit", 0) {
        Ok(v) => v.max(0) as usize,
        Err(r) => return r,
    };

    let resolved = match ctx.guard.validate(&path, AccessMode::Read) {
        Ok(p) => p,
        Err(e) => return denied(e.kind, e.detail),
    };
    if !resolved.is_file() {
        return ToolResult::failure(ErrorKind::NotFound, format!("not a file: {path}"));
    }
    match tokio::fs::metadata(&resolved).await {
        Ok(meta) if meta.len() > ctx.policy.max_file_size => {
            return ToolResult::failure(
                ErrorKind::OutputTruncated,
                format!("file too large ({} bytes, max {})", meta.len(), ctx.policy.max_file_size),
            );
        }
        Ok(_) => {}
        Err(e) => return ToolResult::failure(ErrorKind::NotFound, format!("{path}: {e}")),
    }

    let bytes = match tokio::fs::read(&resolved).await {
        Ok(b) => b,
        Err(e) => return ToolResult::failure(ErrorKind::NotFound, format!("{path}: {e}")),
    };
    if bytes[..bytes.len().min(BINARY_SNIFF_BYTES)].contains(&0) {
        return ToolResult::failure(
            ErrorKind::ParseError,
            format!("binary file detected ({} bytes): {path}", bytes.len()),
        );
    }
    let text = String::from_utf8_lossy(&bytes);

    let all_lines: Vec<&str> = text.lines().collect();
    let total_lines = all_lines.len();
    let effective_limit = if limit > 0 { limit } else { ctx.policy.max_read_lines };
    let window: Vec<&str> = all_lines
        .iter()
        .skip(offset)
        .take(effective_limit)
        .copied()
        .collect();
    let truncated = total_lines.saturating_sub(offset) > effective_limit;

    let mut numbered = String::new();
    for (i, line) in window.iter().enumerate() {
        numbered.push_str(&format!("{:>6}\t{}\n", offset + i + 1, line));
    }

    let origin = resolved.display().to_string();
    let sensitive = resolved
        .file_name()
        .and_then(|n| n.to_str())
        .is_some_and(is_sensitive_file);
    if sensitive {
        ctx.audit.sensitive_read(&origin);
    }

    let mut data = json!({
        "path": origin,
        "origin": origin,
        "content": numbered,
        "lines_count": total_lines,
    });
    if sensitive {
        data["sensitive"] = json!(true);
    }
    if truncated {
        data["note"] = json!(format!(
            "output capped at {effective_limit} lines (file has {total_lines}); use offset/limit to page"
        ));
    }
    ToolResult::success(data)
        .with_truncated(truncated)
        .with_bytes_read(bytes.len() as u64)
}

// ---------------------------------------------------------------------------
// file_write / file_edit
// ---------------------------------------------------------------------------

/// Write via a same-directory temp file and rename, so a crash can not
/// leave a half-written target.
async fn write_atomic(target: &Path, content: &str) -> std::io::Result<()> {
    let dir = target.parent().unwrap_or_else(|| Path::new("."));
    let stem = target
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("out");
    let tmp = dir.join(format!(".{stem}.{}.tmp", Uuid::new_v4().simple()));
    tokio::fs::write(&tmp, content.as_bytes()).await?;
    match tokio::fs::rename(&tmp, target).await {
        Ok(()) => Ok(()),
        Err(e) => {
            let _ = tokio::fs::remove_file(&tmp).await;
            Err(e)
        }
    }
}

async fn file_write(call: &ToolCall, ctx: &ToolContext) -> ToolResult {
    let path = match str_arg(call, 0, "path") {
        Ok(v) => v,
        Err(r) => return r,
    };
    let content = match str_arg(call, 1, "content") {
        Ok(v) => v,
        Err(r) => return r,
    };

    let resolved = match ctx.guard.validate(&path, AccessMode::Write) {
        Ok(p) => p,
        Err(e) => return denied(e.kind, e.detail),
    };
    if content.len() as u64 > ctx.policy.max_file_size {
        return ToolResult::failure(
            ErrorKind::OutputTruncated,
            format!("content too large ({} bytes, max {})", content.len(), ctx.policy.max_file_size),
        );
    }

    if let Some(parent) = resolved.parent() {
        if let Err(e) = tokio::fs::create_dir_all(parent).await {
            return ToolResult::failure(ErrorKind::InternalError, format!("create parents: {e}"));
        }
    }

    // Reversible-change contract: keep a timestamped copy of anything we
    // overwrite.
    let mut backup_path = None;
    if resolved.is_file() {
        let ts = chrono::Utc::now().timestamp();
        let backup = PathBuf::from(format!("{}.bak.{ts}", resolved.display()));
        if let Err(e) = tokio::fs::copy(&resolved, &backup).await {
            return ToolResult::failure(ErrorKind::InternalError, format!("backup: {e}"));
        }
        backup_path = Some(backup.display().to_string());
    }

    if let Err(e) = write_atomic(&resolved, &content).await {
        return ToolResult::failure(ErrorKind::InternalError, format!("write {path}: {e}"));
    }

    let mut data = json!({
        "path": resolved.display().to_string(),
        "bytes_written": content.len(),
    });
    if let Some(b) = backup_path {
        data["backup_path"] = json!(b);
    }
    ToolResult::success(data)
}

async fn file_edit(call: &ToolCall, ctx: &ToolContext) -> ToolResult {
    let path = match str_arg(call, 0, "path") {
        Ok(v) => v,
        Err(r) => return r,
    };
    let find = match str_arg(call, 1, "find") {
        Ok(v) => v,
        Err(r) => return r,
    };
    let replace = match str_arg(call, 2, "replace") {
        Ok(v) => v,
        Err(r) => return r,
    };
    let occurrence = match int_arg(call, 3, "occurrence", 0) {
        Ok(v) => v,
        Err(r) => return r,
    };

    if find.is_empty() {
        return ToolResult::failure(ErrorKind::ParseError, "find text must not be empty");
    }
    if find == replace {
        return ToolResult::failure(ErrorKind::ParseError, "find and replace are identical");
    }

    let resolved = match ctx.guard.validate(&path, AccessMode::Edit) {
        Ok(p) => p,
        Err(e) => return denied(e.kind, e.detail),
    };
    let content = match tokio::fs::read_to_string(&resolved).await {
        Ok(c) => c,
        Err(e) => return ToolResult::failure(ErrorKind::NotFound, format!("{path}: {e}")),
    };

    let positions: Vec<usize> = content.match_indices(&find).map(|(i, _)| i).collect();
    if positions.is_empty() {
        return ToolResult::failure(ErrorKind::NotFound, "find text not found in file");
    }
    let index = if occurrence > 0 {
        let ord = occurrence as usize;
        if ord > positions.len() {
            return ToolResult::failure(
                ErrorKind::NotFound,
                format!("occurrence {ord} requested but only {} matches", positions.len()),
            );
        }
        positions[ord - 1]
    } else {
        if positions.len() > 1 {
            return ToolResult::failure(
                ErrorKind::AmbiguousMatch,
                format!(
                    "find text matches {} times; pass occurrence=N or provide more context",
                    positions.len()
                ),
            );
        }
        positions[0]
    };

    let mut updated = String::with_capacity(content.len());
    updated.push_str(&content[..index]);
    updated.push_str(&replace);
    updated.push_str(&content[index + find.len()..]);

    if let Err(e) = write_atomic(&resolved, &updated).await {
        return ToolResult::failure(ErrorKind::InternalError, format!("write {path}: {e}"));
    }
    ToolResult::success(json!({
        "path": resolved.display().to_string(),
        "replacements_count": 1,
        "match_count": positions.len(),
    }))
}

// ---------------------------------------------------------------------------
// glob_search / grep_search
// ---------------------------------------------------------------------------

/// Depth-first walk of the sandbox. Symlinks are never followed; escape
/// protection belongs to the guard, skipping them here just keeps the
/// walk inside the tree it started in.
fn walk_files(root: &Path, out: &mut Vec<PathBuf>, cap: usize) {
    let Ok(entries) = std::fs::read_dir(root) else {
        return;
    };
    let mut entries: Vec<_> = entries.flatten().collect();
    entries.sort_by_key(|e| e.file_name());
    for entry in entries {
        if out.len() >= cap {
            return;
        }
        let path = entry.path();
        let Ok(meta) = std::fs::symlink_metadata(&path) else {
            continue;
        };
        if meta.file_type().is_symlink() {
            continue;
        }
        if meta.is_dir() {
            let name = entry.file_name();
            if name == ".git" || name == "target" || name == "node_modules" {
                continue;
            }
            walk_files(&path, out, cap);
        } else if meta.is_file() {
            out.push(path);
        }
    }
}

async fn glob_search(call: &ToolCall, ctx: &ToolContext) -> ToolResult {
    let pattern = match str_arg(call, 0, "pattern") {
        Ok(v) => v,
        Err(r) => return r,
    };
    let matcher = match globset::Glob::new(&pattern) {
        Ok(g) => g.compile_matcher(),
        Err(e) => return ToolResult::failure(ErrorKind::ParseError, format!("invalid glob: {e}")),
    };

    let root = ctx.workdir.clone();
    let mut files = Vec::new();
    walk_files(&root, &mut files, GLOB_MAX_RESULTS * 10);

    let mut matches: Vec<(PathBuf, std::time::SystemTime)> = files
        .into_iter()
        .filter_map(|p| {
            let rel = p.strip_prefix(&root).ok()?.to_path_buf();
            if matcher.is_match(&rel) {
                let mtime = std::fs::metadata(&p)
                    .and_then(|m| m.modified())
                    .unwrap_or(std::time::SystemTime::UNIX_EPOCH);
                Some((rel, mtime))
            } else {
                None
            }
        })
        .collect();
    matches.sort_by(|a, b| b.1.cmp(&a.1));
    let truncated = matches.len() > GLOB_MAX_RESULTS;
    let rel_paths: Vec<String> = matches
        .into_iter()
        .take(GLOB_MAX_RESULTS)
        .map(|(p, _)| p.display().to_string())
        .collect();

    ToolResult::success(json!({ "matches": rel_paths })).with_truncated(truncated)
}

async fn grep_search(call: &ToolCall, ctx: &ToolContext) -> ToolResult {
    let pattern = match str_arg(call, 0, "pattern") {
        Ok(v) => v,
        Err(r) => return r,
    };
    let path = match call.arg(1, "path") {
        Some(ArgValue::Str(s)) => s.clone(),
        Some(other) => {
            return ToolResult::failure(
                ErrorKind::ParseError,
                format!("parameter 'path' must be a string, got {}", other.display()),
            )
        }
        None => ".".to_string(),
    };
    let max_results = match int_arg(call, 2, "max_results", GREP_MAX_RESULTS as i64) {
        Ok(v) => v.max(1) as usize,
        Err(r) => return r,
    };

    let regex = match regex::Regex::new(&pattern) {
        Ok(r) => r,
        Err(e) => return ToolResult::failure(ErrorKind::ParseError, format!("invalid regex: {e}")),
    };
    let resolved = match ctx.guard.validate(&path, AccessMode::Read) {
        Ok(p) => p,
        Err(e) => return denied(e.kind, e.detail),
    };

    let files = if resolved.is_file() {
        vec![resolved.clone()]
    } else {
        let mut files = Vec::new();
        walk_files(&resolved, &mut files, GLOB_MAX_RESULTS * 10);
        files
    };

    let mut rendered = String::new();
    let mut count = 0usize;
    let mut bytes_read = 0u64;
    'outer: for file in files {
        let Ok(head) = std::fs::File::open(&file).and_then(|f| {
            use std::io::Read;
            let mut buf = [0u8; 512];
            let mut f = f;
            let n = f.read(&mut buf)?;
            Ok(buf[..n].to_vec())
        }) else {
            continue;
        };
        if head.contains(&0) {
            continue;
        }
        let Ok(bytes) = std::fs::read(&file) else {
            continue;
        };
        bytes_read += bytes.len() as u64;
        let text = String::from_utf8_lossy(&bytes);
        for (line_no, line) in text.lines().enumerate() {
            if regex.is_match(line) {
                rendered.push_str(&format!(
                    "{}:{}:{}\n",
                    file.display(),
                    line_no + 1,
                    line.trim_end()
                ));
                count += 1;
                if count >= max_results {
                    break 'outer;
                }
            }
        }
    }

    ToolResult::success(json!({
        "origin": format!("grep:{}", resolved.display()),
        "content": rendered,
        "match_count": count,
    }))
    .with_truncated(count >= max_results)
    .with_bytes_read(bytes_read)
}

/// Names of tools whose successful output is untrusted for provenance
/// purposes, with the data field holding the content to anchor.
pub fn untrusted_origin(name: &str, result: &ToolResult) -> Option<(String, &'static str)> {
    if !result.ok {
        return None;
    }
    let origin = result
        .data
        .as_ref()
        .and_then(|d| d.get("origin"))
        .and_then(|o| o.as_str())
        .map(str::to_string);
    match name {
        "file_read" => Some((origin.unwrap_or_else(|| "file".to_string()), "file")),
        "grep_search" => Some((origin.unwrap_or_else(|| "grep".to_string()), "grep")),
        "git_status" | "git_diff" | "git_log" | "git_branch" => {
            Some((origin.unwrap_or_else(|| "git".to_string()), "git"))
        }
        _ => None,
    }
}

/// Paths the operator explicitly trusted with `/add --trust`; reads from
/// them do not set the provenance flag.
pub fn is_trusted_read(name: &str, result: &ToolResult, trusted: &BTreeSet<PathBuf>) -> bool {
    if name != "file_read" {
        return false;
    }
    let Some(path) = result
        .data
        .as_ref()
        .and_then(|d| d.get("path"))
        .and_then(|p| p.as_str())
    else {
        return false;
    };
    trusted.contains(Path::new(path))
}
