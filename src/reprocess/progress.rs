use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::channel::ChannelId;

/// Lifecycle of one sweep. Moves forward only:
/// `Pending → Running → {Completed, Failed}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessingStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl ProcessingStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, ProcessingStatus::Completed | ProcessingStatus::Failed)
    }

    pub fn can_transition_to(self, next: ProcessingStatus) -> bool {
        use ProcessingStatus::*;
        matches!(
            (self, next),
            (Pending, Running) | (Running, Completed) | (Running, Failed)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ProcessingStatus::Pending => "pending",
            ProcessingStatus::Running => "running",
            ProcessingStatus::Completed => "completed",
            ProcessingStatus::Failed => "failed",
        }
    }
}

/// Snapshot of a reprocessing sweep. Counters keep `decrypted <= processed <= total`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessingProgress {
    pub channel_id: ChannelId,
    pub channel_name: String,
    pub total: usize,
    pub processed: usize,
    pub decrypted: usize,
    pub status: ProcessingStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl ProcessingProgress {
    pub fn new(channel_id: ChannelId, channel_name: String) -> Self {
        Self {
            channel_id,
            channel_name,
            total: 0,
            processed: 0,
            decrypted: 0,
            status: ProcessingStatus::Pending,
            error: None,
            started_at: None,
            completed_at: None,
        }
    }

    /// A sweep that was never allowed to start (used in multi-channel summaries).
    pub fn rejected(channel_id: ChannelId, channel_name: String, error: String) -> Self {
        let now = Utc::now();
        Self {
            status: ProcessingStatus::Failed,
            error: Some(error),
            started_at: Some(now),
            completed_at: Some(now),
            ..Self::new(channel_id, channel_name)
        }
    }

    fn transition(&mut self, next: ProcessingStatus) -> bool {
        if !self.status.can_transition_to(next) {
            return false;
        }
        self.status = next;
        true
    }

    /// `Pending → Running` with the candidate count fixed for the rest of the sweep.
    pub fn start(&mut self, total: usize) -> bool {
        if !self.transition(ProcessingStatus::Running) {
            return false;
        }
        self.total = total;
        self.started_at = Some(Utc::now());
        true
    }

    /// Count one examined record. Ignored outside `Running` or past `total`.
    pub fn record(&mut self, decrypted: bool) {
        if self.status != ProcessingStatus::Running || self.processed >= self.total {
            return;
        }
        self.processed += 1;
        if decrypted {
            self.decrypted += 1;
        }
    }

    pub fn complete(&mut self) -> bool {
        if !self.transition(ProcessingStatus::Completed) {
            return false;
        }
        self.completed_at = Some(Utc::now());
        true
    }

    pub fn fail(&mut self, error: impl Into<String>) -> bool {
        if !self.transition(ProcessingStatus::Failed) {
            return false;
        }
        self.error = Some(error.into());
        self.completed_at = Some(Utc::now());
        true
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Completion percentage, 100 for an empty sweep.
    pub fn percent(&self) -> u8 {
        if self.total == 0 {
            return 100;
        }
        ((self.processed * 100) / self.total) as u8
    }
}
