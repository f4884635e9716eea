use serde::{Deserialize, Serialize};

use super::answer::AbandonedAnswer;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NetworkStatus {
    Online,
    Offline,
}

impl NetworkStatus {
    pub fn from_online(online: bool) -> Self {
        if online {
            NetworkStatus::Online
        } else {
            NetworkStatus::Offline
        }
    }

    pub fn is_online(&self) -> bool {
        matches!(self, NetworkStatus::Online)
    }
}

/// Coarse signals the UI is allowed to observe
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncState {
    pub is_online: bool,
    pub pending_sync: usize,
    pub is_syncing: bool,
    /// Answers dropped this session after exhausting retries
    pub abandoned: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    AlreadySyncing,
    Offline,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SyncReport {
    pub attempted: usize,
    pub synced: usize,
    pub failed: usize,
    /// Later records of a question whose earlier record failed in this pass
    pub held_back: usize,
    pub abandoned: Vec<AbandonedAnswer>,
    pub remaining: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SyncOutcome {
    Skipped(SkipReason),
    Completed(SyncReport),
}

impl SyncOutcome {
    pub fn report(&self) -> Option<&SyncReport> {
        match self {
            SyncOutcome::Completed(report) => Some(report),
            SyncOutcome::Skipped(_) => None,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            SyncOutcome::Skipped(SkipReason::AlreadySyncing) => "skipped_busy",
            SyncOutcome::Skipped(SkipReason::Offline) => "skipped_offline",
            SyncOutcome::Completed(report) if report.failed == 0 => "success",
            SyncOutcome::Completed(_) => "partial",
        }
    }
}

/// Why the sync worker was woken up
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncTrigger {
    CameOnline,
    Timer,
    Manual,
}
