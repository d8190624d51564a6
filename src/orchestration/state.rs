use serde::Serialize;
use std::fmt;

/// Lifecycle of one batch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchState {
    Idle,
    AnalyzingRegions,
    AwaitingUserSelection,
    Charging,
    Generating,
    Completed,
    Cancelled,
    Failed,
}

impl BatchState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::AnalyzingRegions => "analyzing_regions",
            Self::AwaitingUserSelection => "awaiting_user_selection",
            Self::Charging => "charging",
            Self::Generating => "generating",
            Self::Completed => "completed",
            Self::Cancelled => "cancelled",
            Self::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled | Self::Failed)
    }

    pub fn can_transition_to(&self, next: BatchState) -> bool {
        use BatchState::*;
        matches!(
            (self, next),
            (Idle, AnalyzingRegions)
                | (Idle, Charging)
                | (Idle, Cancelled)
                | (AnalyzingRegions, AwaitingUserSelection)
                | (AnalyzingRegions, Charging)
                | (AnalyzingRegions, Completed)
                | (AnalyzingRegions, Cancelled)
                | (AnalyzingRegions, Failed)
                | (AwaitingUserSelection, Charging)
                | (AwaitingUserSelection, Cancelled)
                | (Charging, Generating)
                | (Charging, Cancelled)
                | (Charging, Failed)
                | (Generating, Completed)
                | (Generating, Cancelled)
        )
    }
}

impl fmt::Display for BatchState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
