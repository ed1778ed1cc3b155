use serde_json::json;

use crate::exec::run_argv;
use crate::tools::{bool_arg, int_arg, str_arg, ToolContext};
use crate::types::{ErrorKind, ToolCall, ToolResult};

const GIT_TIMEOUT_SECS: u64 = 30;

/// The git subset. Read subcommands produce attacker-controlled text
/// (commit messages, branch names, diff hunks), so the dispatcher anchors
/// their output like any other untrusted read. The network subcommands
/// never appear here; the sandbox rejects them independently.
pub async fn run_git_tool(call: &ToolCall, ctx: &ToolContext) -> ToolResult {
    let args: Vec<String> = match call.name.as_str() {
        "git_status" => vec!["status".into(), "--short".into()],
        "git_diff" => {
            let staged = match bool_arg(call, 0, "staged", false) {
                Ok(v) => v,
                Err(r) => return r,
            };
            let mut args = vec!["diff".into()];
            if staged {
                args.push("--cached".into());
            }
            args
        }
        "git_log" => {
            let count = match int_arg(call, 0, "count", 10) {
                Ok(v) => v.clamp(1, 100),
                Err(r) => return r,
            };
            vec!["log".into(), format!("-{count}"), "--oneline".into()]
        }
        "git_branch" => vec!["branch".into(), "-v".into()],
        "git_add" => {
            let files = match str_arg(call, 0, "files") {
                Ok(v) => v,
                Err(r) => return r,
            };
            let file_list: Vec<String> = files.split_whitespace().map(str::to_string).collect();
            if file_list.is_empty() {
                return ToolResult::failure(ErrorKind::ParseError, "no files given");
            }
            // Broad staging would sweep in files the operator never saw.
            if file_list.iter().any(|f| f == "." || f == "-A" || f == "--all") {
                return ToolResult::failure(
                    ErrorKind::CommandNotAllowed,
                    "stage specific file names, not '.' or '-A'",
                );
            }
            let mut args = vec!["add".to_string(), "--".to_string()];
            args.extend(file_list);
            args
        }
        "git_commit" => {
            let message = match str_arg(call, 0, "message") {
                Ok(v) => v,
                Err(r) => return r,
            };
            if message.trim().is_empty() {
                return ToolResult::failure(ErrorKind::ParseError, "commit message is empty");
            }
            // Never amends, never skips hooks.
            vec!["commit".into(), "-m".into(), message]
        }
        other => {
            return ToolResult::failure(ErrorKind::ParseError, format!("unknown git tool: {other}"))
        }
    };

    let Some(git) = ctx.binpaths.lookup("git") else {
        return ToolResult::failure(ErrorKind::NotFound, "git was not resolved at boot");
    };

    let result = run_argv(git, &args, GIT_TIMEOUT_SECS, ctx).await;
    tag_git_origin(call, result)
}

/// Fold stdout/stderr into the content/origin shape the anchorer expects.
fn tag_git_origin(call: &ToolCall, result: ToolResult) -> ToolResult {
    if !result.ok {
        return result;
    }
    let Some(data) = result.data.as_ref() else {
        return result;
    };
    let stdout = data.get("stdout").and_then(|v| v.as_str()).unwrap_or_default();
    let stderr = data.get("stderr").and_then(|v| v.as_str()).unwrap_or_default();
    let status = data.get("status").cloned().unwrap_or(json!(null));
    let subcommand = call.name.trim_start_matches("git_").to_string();
    let mut folded = ToolResult::success(json!({
        "origin": format!("git {subcommand}"),
        "content": if stderr.is_empty() {
            stdout.to_string()
        } else {
            format!("{stdout}\n{stderr}")
        },
        "status": status,
    }));
    folded.truncated = result.truncated;
    folded.bytes_read = result.bytes_read;
    folded
}
