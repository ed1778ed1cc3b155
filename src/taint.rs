use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaintLevel {
    #[default]
    Clean,
    Tainted,
}

impl TaintLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            TaintLevel::Clean => "clean",
            TaintLevel::Tainted => "tainted",
        }
    }
}

/// One untrusted-read event recorded against the current turn.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaintSpan {
    /// Origin class: "file", "git", "grep".
    pub source: String,
    /// Origin detail, e.g. the path that was read.
    pub detail: String,
}

/// Record of a dispatched call, kept for audit context and ordering
/// guarantees within the turn.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutedCall {
    pub index: u32,
    pub tool: String,
    pub ok: bool,
}

/// Per-turn ephemeral state owned by the dispatcher.
///
/// The provenance flag is forward-only inside a turn: once any read-class
/// tool consumes untrusted content, every later mutating call in the same
/// turn is refused. A new operator message resets the flag.
#[derive(Debug, Default)]
pub struct TurnContext {
    pub turn_index: u64,
    pub call_index: u32,
    pub taint: TaintLevel,
    pub taint_spans: Vec<TaintSpan>,
    pub calls: Vec<ExecutedCall>,
    pub bytes_read: u64,
}

impl TurnContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a fresh turn on operator input. Taint does not survive the
    /// reset; call indices restart at zero.
    pub fn begin_turn(&mut self) {
        self.turn_index += 1;
        self.call_index = 0;
        self.taint = TaintLevel::Clean;
        self.taint_spans.clear();
        self.calls.clear();
        self.bytes_read = 0;
    }

    pub fn next_call_index(&mut self) -> u32 {
        let idx = self.call_index;
        self.call_index += 1;
        idx
    }

    pub fn record_untrusted_read(&mut self, source: &str, detail: &str) {
        self.taint = TaintLevel::Tainted;
        self.taint_spans.push(TaintSpan {
            source: source.to_string(),
            detail: detail.to_string(),
        });
    }

    pub fn record_call(&mut self, index: u32, tool: &str, ok: bool) {
        self.calls.push(ExecutedCall {
            index,
            tool: tool.to_string(),
            ok,
        });
    }

    pub fn is_tainted(&self) -> bool {
        matches!(self.taint, TaintLevel::Tainted)
    }

    /// Short source list for the refusal detail shown to the model.
    pub fn taint_sources(&self) -> Vec<String> {
        self.taint_spans
            .iter()
            .map(|s| format!("{}:{}", s.source, s.detail))
            .collect()
    }
}
