use std::collections::BTreeSet;
use std::path::PathBuf;

use serde_json::json;
use tracing::{info, warn};

use crate::anchor::anchor;
use crate::gate::{ApprovalPrompt, Arbitrator, GateDecision};
use crate::pathguard::{AccessMode, PathDenied};
use crate::protocol::{extract_tool_calls, frame_result, ToolRegistry};
use crate::taint::TurnContext;
use crate::tools::{invoke, is_trusted_read, untrusted_origin, ToolContext};
use crate::types::{ErrorKind, ToolResult};

/// Owns all per-session mutable state and runs the per-turn pipeline:
/// parse → arbitrate → provenance check → execute → anchor → frame.
/// Tool calls execute strictly in emission order; taint transitions from
/// call *k* are visible to call *k+1*.
pub struct Dispatcher {
    pub registry: ToolRegistry,
    pub arbitrator: Arbitrator,
    pub ctx: ToolContext,
    pub turn: TurnContext,
    trusted_paths: BTreeSet<PathBuf>,
    plugin_aliases: crate::plugins::PluginAliases,
    last_backup: Option<(PathBuf, PathBuf)>,
    tool_calls_total: u64,
}

impl Dispatcher {
    pub fn new(registry: ToolRegistry, arbitrator: Arbitrator, ctx: ToolContext) -> Self {
        Dispatcher {
            registry,
            arbitrator,
            ctx,
            turn: TurnContext::new(),
            trusted_paths: BTreeSet::new(),
            plugin_aliases: crate::plugins::PluginAliases::new(),
            last_backup: None,
            tool_calls_total: 0,
        }
    }

    pub fn set_plugin_aliases(&mut self, aliases: crate::plugins::PluginAliases) {
        self.plugin_aliases = aliases;
    }

    /// Called on every new operator message. Resets the provenance flag;
    /// the guarantee is scoped to one model response.
    pub fn begin_turn(&mut self) {
        self.turn.begin_turn();
    }

    pub fn tool_calls_total(&self) -> u64 {
        self.tool_calls_total
    }

    /// Operator `/add --trust <path>`: reads from this exact file no
    /// longer set the provenance flag. The path must itself pass the
    /// guard.
    pub fn trust_path(&mut self, raw: &str) -> Result<PathBuf, PathDenied> {
        let resolved = self.ctx.guard.validate(raw, AccessMode::Read)?;
        self.trusted_paths.insert(resolved.clone());
        Ok(resolved)
    }

    /// Operator `/undo`: restore the most recent file_write backup.
    pub fn undo_last_write(&mut self) -> anyhow::Result<PathBuf> {
        let Some((target, backup)) = self.last_backup.take() else {
            anyhow::bail!("nothing to undo");
        };
        std::fs::copy(&backup, &target)
            .map_err(|e| anyhow::anyhow!("restore {} from {}: {e}", target.display(), backup.display()))?;
        Ok(target)
    }

    /// Process one model generation: execute every embedded tool call and
    /// return the framed result blocks in emission order.
    pub async fn run_model_output(
        &mut self,
        model_output: &str,
        prompt: &mut dyn ApprovalPrompt,
    ) -> Vec<String> {
        let mut frames = Vec::new();
        for parsed in extract_tool_calls(model_output) {
            let (name, result) = match &parsed.outcome {
                Err(failure) => {
                    let name = failure.name.clone().unwrap_or_else(|| "unknown".to_string());
                    (
                        name,
                        ToolResult::failure(ErrorKind::ParseError, failure.detail.clone()),
                    )
                }
                Ok(call) => {
                    let result = self.dispatch_call(call, prompt).await;
                    (call.name.clone(), result)
                }
            };

            let index = self.turn.next_call_index();
            self.turn.record_call(index, &name, result.ok);
            self.tool_calls_total += 1;
            self.ctx.audit.tool_call(
                &name,
                &parsed
                    .outcome
                    .as_ref()
                    .map(|c| c.preview())
                    .unwrap_or_else(|_| name.clone()),
                result.ok,
                result.error_kind.map(|k| k.as_str()),
            );
            frames.push(frame_result(&name, &result));
        }
        frames
    }

    async fn dispatch_call(
        &mut self,
        call: &crate::types::ToolCall,
        prompt: &mut dyn ApprovalPrompt,
    ) -> ToolResult {
        let Some(spec) = self.registry.get(&call.name).copied() else {
            return ToolResult::failure(
                ErrorKind::ParseError,
                format!("unknown tool: {}", call.name),
            );
        };
        if let Err(detail) = self.registry.validate_call(call) {
            return ToolResult::failure(ErrorKind::ParseError, detail);
        }

        let mode = self.arbitrator.effective_mode(&call.name);
        match self.arbitrator.arbitrate(&call.name, &call.preview(), prompt) {
            GateDecision::Denied => {
                self.ctx.audit.permission(&call.name, false, mode.as_str());
                info!(tool = %call.name, "permission denied");
                return ToolResult::failure(
                    ErrorKind::PermissionDenied,
                    format!("operator policy denies {}", call.name),
                );
            }
            GateDecision::Allow => {
                self.ctx.audit.permission(&call.name, true, mode.as_str());
            }
        }

        // Provenance gate: within one model response, no mutating tool
        // runs after an untrusted read.
        if spec.capability.is_mutating() && self.turn.is_tainted() {
            let sources = self.turn.taint_sources().join(", ");
            warn!(tool = %call.name, %sources, "provenance blocked");
            self.ctx
                .audit
                .sandbox_block(&call.name, "provenance_blocked", &sources);
            return ToolResult::failure(
                ErrorKind::ProvenanceBlocked,
                format!(
                    "untrusted content was read earlier in this turn ({sources}); \
                     {} is refused until the next operator message",
                    call.name
                ),
            );
        }

        // Plugin names are views over vetted builtin handlers; resolve
        // the alias only after arbitration ran against the plugin name.
        let handler_call;
        let effective = match self.plugin_aliases.get(&call.name) {
            Some(builtin) => {
                let mut rewritten = call.clone();
                rewritten.name = builtin.clone();
                handler_call = rewritten;
                &handler_call
            }
            None => call,
        };

        let mut result = invoke(effective, &self.ctx, &self.registry).await;
        if let Some(bytes) = result.bytes_read {
            self.turn.bytes_read += bytes;
        }
        if let Some(data) = result.data.as_ref() {
            if let (Some(path), Some(backup)) = (
                data.get("path").and_then(|v| v.as_str()),
                data.get("backup_path").and_then(|v| v.as_str()),
            ) {
                self.last_backup = Some((PathBuf::from(path), PathBuf::from(backup)));
            }
        }

        // Read-class results with untrusted origin taint the turn and get
        // anchored before the model ever sees a byte of them.
        if let Some((origin, source)) = untrusted_origin(&effective.name, &result) {
            if !is_trusted_read(&effective.name, &result, &self.trusted_paths) {
                self.turn.record_untrusted_read(source, &origin);
            }
            anchor_result_content(&mut result, &origin);
        }
        result
    }
}

/// Rewrite `data.content` into its neutralized, framed form. Sensitive
/// origins are labeled so the model treats the content with extra care.
fn anchor_result_content(result: &mut ToolResult, origin: &str) {
    let Some(data) = result.data.as_mut() else {
        return;
    };
    let Some(content) = data.get("content").and_then(|c| c.as_str()).map(str::to_string) else {
        return;
    };
    let sensitive = data.get("sensitive").and_then(|s| s.as_bool()).unwrap_or(false);
    let label = if sensitive {
        format!("{origin} (sensitive)")
    } else {
        origin.to_string()
    };
    data["content"] = json!(anchor(&label, &content));
}
