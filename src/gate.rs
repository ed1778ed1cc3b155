use std::collections::{BTreeMap, BTreeSet};
use std::io::Write;

use clap::ValueEnum;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PermissionMode {
    Allow,
    Ask,
    Deny,
}

impl PermissionMode {
    pub fn as_str(self) -> &'static str {
        match self {
            PermissionMode::Allow => "allow",
            PermissionMode::Ask => "ask",
            PermissionMode::Deny => "deny",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.to_ascii_lowercase().as_str() {
            "allow" => Some(PermissionMode::Allow),
            "ask" => Some(PermissionMode::Ask),
            "deny" => Some(PermissionMode::Deny),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateDecision {
    Allow,
    Denied,
}

/// Answer to an `ask` prompt. `AlwaysAllow` allows the tool for the rest
/// of the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromptAnswer {
    Yes,
    No,
    AlwaysAllow,
}

/// Seam to the UI collaborator: surfaces a yes/no prompt and blocks until
/// the operator answers.
pub trait ApprovalPrompt {
    fn confirm(&mut self, tool: &str, preview: &str) -> PromptAnswer;
}

/// Interactive prompt on the operator terminal.
pub struct StdinPrompt;

impl ApprovalPrompt for StdinPrompt {
    fn confirm(&mut self, tool: &str, preview: &str) -> PromptAnswer {
        eprintln!("\n  Tool: {tool}({preview})");
        eprint!("  Allow? [y/n/a(lways)] ");
        let _ = std::io::stderr().flush();
        let mut line = String::new();
        if std::io::stdin().read_line(&mut line).is_err() {
            return PromptAnswer::No;
        }
        match line.trim().to_ascii_lowercase().as_str() {
            "y" | "yes" => PromptAnswer::Yes,
            "a" | "always" => PromptAnswer::AlwaysAllow,
            _ => PromptAnswer::No,
        }
    }
}

/// Scripted prompt used by tests and non-interactive boots: every ask is
/// answered the same way.
pub struct FixedPrompt(pub PromptAnswer);

impl ApprovalPrompt for FixedPrompt {
    fn confirm(&mut self, _tool: &str, _preview: &str) -> PromptAnswer {
        self.0
    }
}

fn default_permissions() -> BTreeMap<String, PermissionMode> {
    let mut map = BTreeMap::new();
    for tool in ["file_read", "glob_search", "grep_search", "git_status", "git_diff", "git_log", "git_branch", "tool_list"] {
        map.insert(tool.to_string(), PermissionMode::Allow);
    }
    for tool in ["file_write", "file_edit", "bash_exec", "git_add", "git_commit"] {
        map.insert(tool.to_string(), PermissionMode::Ask);
    }
    map
}

/// Per-tool allow/ask/deny arbitration with operator overrides.
///
/// `--dangerously-skip-permissions` promotes `ask` to `allow` but never
/// promotes `deny`: an explicit deny wins over every other setting.
pub struct Arbitrator {
    skip_permissions: bool,
    defaults: BTreeMap<String, PermissionMode>,
    overrides: BTreeMap<String, PermissionMode>,
    session_allowed: BTreeSet<String>,
}

impl Arbitrator {
    pub fn new(skip_permissions: bool) -> Self {
        Arbitrator {
            skip_permissions,
            defaults: default_permissions(),
            overrides: BTreeMap::new(),
            session_allowed: BTreeSet::new(),
        }
    }

    pub fn set_override(&mut self, tool: &str, mode: PermissionMode) {
        self.overrides.insert(tool.to_string(), mode);
    }

    pub fn effective_mode(&self, tool: &str) -> PermissionMode {
        let configured = self
            .overrides
            .get(tool)
            .or_else(|| self.defaults.get(tool))
            .copied()
            .unwrap_or(PermissionMode::Ask);
        match configured {
            PermissionMode::Deny => PermissionMode::Deny,
            PermissionMode::Allow => PermissionMode::Allow,
            PermissionMode::Ask if self.skip_permissions => PermissionMode::Allow,
            PermissionMode::Ask => PermissionMode::Ask,
        }
    }

    /// Decide whether a call may proceed, prompting the operator when the
    /// effective mode is `ask`.
    pub fn arbitrate(
        &mut self,
        tool: &str,
        preview: &str,
        prompt: &mut dyn ApprovalPrompt,
    ) -> GateDecision {
        match self.effective_mode(tool) {
            PermissionMode::Allow => GateDecision::Allow,
            PermissionMode::Deny => GateDecision::Denied,
            PermissionMode::Ask => {
                if self.session_allowed.contains(tool) {
                    return GateDecision::Allow;
                }
                match prompt.confirm(tool, preview) {
                    PromptAnswer::Yes => GateDecision::Allow,
                    PromptAnswer::AlwaysAllow => {
                        self.session_allowed.insert(tool.to_string());
                        GateDecision::Allow
                    }
                    PromptAnswer::No => GateDecision::Denied,
                }
            }
        }
    }

    /// Clear session-level grants; explicit overrides survive.
    pub fn reset_session(&mut self) {
        self.session_allowed.clear();
    }
}
