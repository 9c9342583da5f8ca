/// A turn kept requesting tools past the configured cycle limit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolLoopExhausted {
    pub project_id: String,
    pub cycles: usize,
}

impl std::fmt::Display for ToolLoopExhausted {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "turn for project `{}` stopped after {} tool cycles",
            self.project_id, self.cycles
        )
    }
}

impl std::error::Error for ToolLoopExhausted {}

/// The caller cancelled a turn. The thread holds every transition completed
/// before the cancellation and nothing after it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TurnCancelled {
    pub thread_id: String,
}

impl std::fmt::Display for TurnCancelled {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "turn for thread `{}` was cancelled", self.thread_id)
    }
}

impl std::error::Error for TurnCancelled {}
