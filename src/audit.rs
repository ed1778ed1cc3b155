use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::Utc;
use serde_json::{json, Value};

/// Append-only JSONL event sink. One JSON object per line, serialized
/// behind a single writer; no other lock is involved anywhere in the
/// runtime.
pub struct AuditLog {
    log_path: PathBuf,
    session_id: String,
    inner: Mutex<AuditInner>,
}

struct AuditInner {
    file: Option<File>,
    seq: u64,
}

impl AuditLog {
    pub fn new(log_dir: &Path) -> Self {
        let session_id = Utc::now().format("%Y%m%d-%H%M%S").to_string();
        let log_path = log_dir.join(format!(".warden-audit-{session_id}.jsonl"));
        AuditLog {
            log_path,
            session_id,
            inner: Mutex::new(AuditInner { file: None, seq: 0 }),
        }
    }

    pub fn log_path(&self) -> &Path {
        &self.log_path
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    fn write(&self, event: &str, mut data: Value) {
        let Ok(mut inner) = self.inner.lock() else {
            return;
        };
        if inner.file.is_none() {
            if let Some(parent) = self.log_path.parent() {
                let _ = std::fs::create_dir_all(parent);
            }
            inner.file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.log_path)
                .ok();
        }
        inner.seq += 1;
        if let Some(obj) = data.as_object_mut() {
            obj.insert("seq".to_string(), json!(inner.seq));
            obj.insert("ts".to_string(), json!(Utc::now().to_rfc3339()));
            obj.insert("event".to_string(), json!(event));
        }
        if let Some(file) = inner.file.as_mut() {
            if let Ok(line) = serde_json::to_string(&data) {
                let _ = writeln!(file, "{line}");
                let _ = file.flush();
            }
        }
    }

    pub fn session_start(&self, workdir: &Path, model: &str, skip_permissions: bool) {
        self.write(
            "session_start",
            json!({
                "session_id": self.session_id,
                "workdir": workdir.display().to_string(),
                "model": model,
                "skip_permissions": skip_permissions,
            }),
        );
    }

    pub fn session_end(&self, turns: u64, tool_calls: u64) {
        self.write("session_end", json!({"turns": turns, "tool_calls": tool_calls}));
    }

    pub fn tool_call(&self, tool: &str, preview: &str, ok: bool, error_kind: Option<&str>) {
        self.write(
            "tool_call",
            json!({
                "tool": tool,
                "args": truncate(preview, 500),
                "ok": ok,
                "error_kind": error_kind,
            }),
        );
    }

    pub fn permission(&self, tool: &str, allowed: bool, mode: &str) {
        self.write(
            "permission",
            json!({"tool": tool, "allowed": allowed, "mode": mode}),
        );
    }

    pub fn sandbox_block(&self, tool: &str, reason: &str, target: &str) {
        self.write(
            "sandbox_block",
            json!({
                "tool": tool,
                "reason": truncate(reason, 300),
                "target": truncate(target, 200),
            }),
        );
    }

    pub fn sensitive_read(&self, path: &str) {
        self.write("sensitive_read", json!({"path": truncate(path, 300)}));
    }

    pub fn error(&self, source: &str, message: &str) {
        self.write(
            "error",
            json!({"source": source, "message": truncate(message, 500)}),
        );
    }
}

fn truncate(s: &str, max_chars: usize) -> String {
    s.chars().take(max_chars).collect()
}
