use std::fmt::Display;

/// Why a consumer task stopped.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum StopReason {
    /// Shutdown was requested and the in-flight event was drained.
    Shutdown,
    /// The source cannot be captured; the task is not restarted.
    Fatal,
    /// A dependency failed past its retry budget; a fresh task is started after a cooldown.
    Failed,
}

/// Lifecycle of a per-source consumer task.
///
/// ```text
/// Starting -> LoadingCheckpoint -> Streaming <-> Processing
///                   ^                 |
///                   +---- Backoff <---+  (transient channel error)
///
/// any state -> Stopped
/// ```
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ConsumerState {
    Starting,
    LoadingCheckpoint,
    Streaming,
    Processing,
    Backoff,
    Stopped(StopReason),
}

impl ConsumerState {
    pub fn is_stopped(&self) -> bool {
        matches!(self, Self::Stopped(_))
    }
}

impl Display for ConsumerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Starting => f.write_str("starting"),
            Self::LoadingCheckpoint => f.write_str("loading_checkpoint"),
            Self::Streaming => f.write_str("streaming"),
            Self::Processing => f.write_str("processing"),
            Self::Backoff => f.write_str("backoff"),
            Self::Stopped(StopReason::Shutdown) => f.write_str("stopped(shutdown)"),
            Self::Stopped(StopReason::Fatal) => f.write_str("stopped(fatal)"),
            Self::Stopped(StopReason::Failed) => f.write_str("stopped(failed)"),
        }
    }
}
