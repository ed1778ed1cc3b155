use std::path::PathBuf;
use std::process::Stdio;
use std::time::{Duration, Instant};

use serde_json::json;
use tokio::process::Command;
use tracing::warn;

use crate::tools::{int_arg, str_arg, ToolContext};
use crate::types::{truncate_utf8_to_bytes, ErrorKind, ToolCall, ToolResult};

/// Environment variables a child process is allowed to inherit.
/// Everything else is stripped before spawn; PATH is re-pinned to the
/// boot-time snapshot.
const ENV_ALLOWLIST: &[&str] = &["HOME", "LANG", "LC_ALL", "TERM", "WARDEN_BACKEND_URL"];

/// Execute one sandboxed command: validate through every phase, then
/// spawn the accepted argv directly. No shell is ever interposed, so
/// quoting tricks have nothing to exploit.
pub async fn bash_exec(call: &ToolCall, ctx: &ToolContext) -> ToolResult {
    let command = match str_arg(call, 0, "command") {
        Ok(v) => v,
        Err(r) => return r,
    };
    let timeout_secs = match int_arg(call, 1, "timeout_seconds", ctx.policy.command_timeout_secs as i64) {
        Ok(v) => v.clamp(1, 600) as u64,
        Err(r) => return r,
    };

    let argv = match ctx.sandbox.validate(&command) {
        Ok(argv) => argv,
        Err(e) => {
            ctx.audit.sandbox_block("bash_exec", &e.detail, &command);
            warn!(command = %command, kind = e.kind.as_str(), "command rejected");
            return ToolResult::failure(e.kind, e.detail);
        }
    };

    let program = match resolve_program(&argv[0], ctx) {
        Some(p) => p,
        None => {
            return ToolResult::failure(
                ErrorKind::NotFound,
                format!("binary not found on boot PATH: {}", argv[0]),
            )
        }
    };

    run_argv(program, &argv[1..], timeout_secs, ctx).await
}

fn resolve_program(name: &str, ctx: &ToolContext) -> Option<PathBuf> {
    ctx.binpaths.lookup(name)
}

/// Spawn with a sanitized environment, pinned working directory, wall
/// clock timeout, and a bounded output buffer.
pub async fn run_argv(
    program: PathBuf,
    args: &[String],
    timeout_secs: u64,
    ctx: &ToolContext,
) -> ToolResult {
    let mut cmd = Command::new(&program);
    cmd.args(args)
        .current_dir(&ctx.workdir)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .env_clear()
        .env("PATH", ctx.binpaths.boot_path_value())
        .kill_on_drop(true);
    for key in ENV_ALLOWLIST {
        if let Ok(value) = std::env::var(key) {
            cmd.env(key, value);
        }
    }

    let start = Instant::now();
    let child = match cmd.spawn() {
        Ok(c) => c,
        Err(e) => {
            return ToolResult::failure(
                ErrorKind::InternalError,
                format!("spawn {}: {e}", program.display()),
            )
        }
    };

    let output = match tokio::time::timeout(Duration::from_secs(timeout_secs), child.wait_with_output())
        .await
    {
        Ok(Ok(output)) => output,
        Ok(Err(e)) => {
            return ToolResult::failure(ErrorKind::InternalError, format!("wait: {e}"));
        }
        // The dropped future kills the child (kill_on_drop). A timeout is
        // a terminal state that the model is told about, not an exception.
        Err(_) => {
            return ToolResult::failure(
                ErrorKind::TimedOut,
                format!("command timed out after {timeout_secs}s"),
            );
        }
    };

    let duration_ms = start.elapsed().as_millis() as u64;
    let stdout_raw = String::from_utf8_lossy(&output.stdout);
    let stderr_raw = String::from_utf8_lossy(&output.stderr);
    let (stdout, stdout_truncated) = truncate_utf8_to_bytes(&stdout_raw, ctx.policy.max_output_bytes);
    let (stderr, stderr_truncated) = truncate_utf8_to_bytes(&stderr_raw, ctx.policy.max_output_bytes);
    let truncated = stdout_truncated || stderr_truncated;

    let data = json!({
        "status": output.status.code(),
        "stdout": stdout,
        "stderr": stderr,
        "duration_ms": duration_ms,
    });
    let bytes = (output.stdout.len() + output.stderr.len()) as u64;
    // A nonzero exit code is still a completed spawn: the model reads the
    // status from the payload and adapts. error_kind stays reserved for
    // runtime-level failures.
    ToolResult::success(data).with_truncated(truncated).with_bytes_read(bytes)
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;
    use std::sync::Arc;

    use tempfile::tempdir;

    use super::bash_exec;
    use crate::audit::AuditLog;
    use crate::binpath::BinPathRegistry;
    use crate::pathguard::PathGuard;
    use crate::policy::SandboxPolicy;
    use crate::protocol::extract_tool_calls;
    use crate::sandbox::CommandSandbox;
    use crate::tools::ToolContext;
    use crate::types::{ErrorKind, ToolCall};

    fn context_in(dir: &std::path::Path) -> ToolContext {
        let policy = Arc::new(SandboxPolicy::with_defaults(vec![dir.to_path_buf()]));
        let guard = Arc::new(PathGuard::from_policy(&policy, dir).expect("guard"));
        let sandbox = Arc::new(CommandSandbox::new(policy.clone(), guard.clone()));
        let binpaths = Arc::new(BinPathRegistry::with_search_dirs(vec![
            PathBuf::from("/usr/bin"),
            PathBuf::from("/bin"),
        ]));
        ToolContext {
            policy,
            guard: guard.clone(),
            sandbox,
            binpaths,
            audit: Arc::new(AuditLog::new(dir)),
            workdir: guard.base_dir().to_path_buf(),
        }
    }

    fn call(text: &str) -> ToolCall {
        extract_tool_calls(text)[0]
            .outcome
            .as_ref()
            .expect("parsed")
            .clone()
    }

    #[tokio::test]
    async fn chained_command_never_spawns() {
        let tmp = tempdir().expect("tempdir");
        let ctx = context_in(tmp.path());
        let c = call("::TOOL bash_exec(command=\"git status && echo hacked\")::");
        let result = bash_exec(&c, &ctx).await;
        assert!(!result.ok);
        assert_eq!(result.error_kind, Some(ErrorKind::BlockedMetacharacter));
        assert!(result.data.is_none(), "no process output on rejection");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn accepted_command_runs_in_workdir() {
        let tmp = tempdir().expect("tempdir");
        std::fs::write(tmp.path().join("hello.txt"), "x").expect("write");
        let ctx = context_in(tmp.path());
        let c = call("::TOOL bash_exec(command=\"ls\")::");
        let result = bash_exec(&c, &ctx).await;
        assert!(result.ok, "{result:?}");
        let stdout = result.data.as_ref().expect("data")["stdout"]
            .as_str()
            .expect("stdout");
        assert!(stdout.contains("hello.txt"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn quoted_arguments_survive_tokenization() {
        let tmp = tempdir().expect("tempdir");
        let ctx = context_in(tmp.path());
        let c = call("::TOOL bash_exec(command=\"echo 'one two' three\")::");
        let result = bash_exec(&c, &ctx).await;
        assert!(result.ok, "{result:?}");
        let stdout = result.data.as_ref().expect("data")["stdout"]
            .as_str()
            .expect("stdout");
        assert_eq!(stdout.trim_end(), "one two three");
    }

    #[tokio::test]
    async fn outside_sandbox_listing_rejected_before_spawn() {
        let tmp = tempdir().expect("tempdir");
        let ctx = context_in(tmp.path());
        let c = call("::TOOL bash_exec(command=\"ls -la /etc\")::");
        let result = bash_exec(&c, &ctx).await;
        assert_eq!(result.error_kind, Some(ErrorKind::OutsideSandbox));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn runaway_command_times_out() {
        let tmp = tempdir().expect("tempdir");
        let ctx = context_in(tmp.path());
        // `tail -f` on an existing file never terminates on its own.
        std::fs::write(tmp.path().join("f.txt"), "x\n").expect("write");
        let c = call("::TOOL bash_exec(command=\"tail -f f.txt\", timeout_seconds=1)::");
        let result = bash_exec(&c, &ctx).await;
        assert_eq!(result.error_kind, Some(ErrorKind::TimedOut));
    }
}
