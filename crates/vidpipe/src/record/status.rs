//! Record status state machine.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Pipeline status of a record.
///
/// Forward-only: `uploading → uploaded → processing_media → transcribing →
/// analyzing → finalizing → completed`. `failed` is reachable from every
/// non-terminal state and is itself terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordStatus {
    Uploading,
    Uploaded,
    ProcessingMedia,
    Transcribing,
    Analyzing,
    Finalizing,
    Completed,
    Failed,
}

impl RecordStatus {
    const ORDER: [RecordStatus; 7] = [
        RecordStatus::Uploading,
        RecordStatus::Uploaded,
        RecordStatus::ProcessingMedia,
        RecordStatus::Transcribing,
        RecordStatus::Analyzing,
        RecordStatus::Finalizing,
        RecordStatus::Completed,
    ];

    /// Non-terminal statuses, in pipeline order.
    pub fn in_flight() -> impl Iterator<Item = RecordStatus> {
        Self::ORDER.into_iter().filter(|s| !s.is_terminal())
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, RecordStatus::Completed | RecordStatus::Failed)
    }

    /// Position on the happy path; `None` for `failed`.
    pub fn rank(self) -> Option<usize> {
        Self::ORDER.iter().position(|s| *s == self)
    }

    /// The single legal forward successor, if any.
    pub fn next(self) -> Option<RecordStatus> {
        self.rank().and_then(|r| Self::ORDER.get(r + 1).copied())
    }

    pub fn can_transition_to(self, to: RecordStatus) -> bool {
        if self.is_terminal() {
            return false;
        }
        to == RecordStatus::Failed || self.next() == Some(to)
    }

    /// Legal single steps leading from `self` to `target`, in order.
    ///
    /// Returns `None` if `target` is behind `self`, or if either end is terminal
    /// in a way that forbids the move.
    pub fn path_to(self, target: RecordStatus) -> Option<Vec<RecordStatus>> {
        if self == target {
            return Some(Vec::new());
        }
        if target == RecordStatus::Failed {
            return self.can_transition_to(target).then(|| vec![target]);
        }
        let (from, to) = (self.rank()?, target.rank()?);
        if to < from || self.is_terminal() {
            return None;
        }
        Some(Self::ORDER[from + 1..=to].to_vec())
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RecordStatus::Uploading => "uploading",
            RecordStatus::Uploaded => "uploaded",
            RecordStatus::ProcessingMedia => "processing_media",
            RecordStatus::Transcribing => "transcribing",
            RecordStatus::Analyzing => "analyzing",
            RecordStatus::Finalizing => "finalizing",
            RecordStatus::Completed => "completed",
            RecordStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<RecordStatus> {
        Self::ORDER
            .into_iter()
            .chain(std::iter::once(RecordStatus::Failed))
            .find(|status| status.as_str() == s)
    }
}

impl fmt::Display for RecordStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
