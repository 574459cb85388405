//! Worker to controller event channel
//!
//! The worker never shares counters with the controller: every change is
//! posted as a [`WorkerEvent`] and the controller reads them at its own pace.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, RwLock};
use uuid::Uuid;

use crate::coordinator::WorkerState;
use crate::error::{Result, SyncError};
use crate::mission::{Mission, MissionOutcome, MissionReport};

/// Events posted by the worker
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum WorkerEvent {
    /// Worker task is running
    Alive,
    /// Lifecycle transition
    StateChanged(WorkerState),
    MissionStarted {
        mission_id: Uuid,
        mission: Mission,
        targets: usize,
    },
    /// Counters after a file or tile
    Progress {
        mission_id: Uuid,
        scanned: usize,
        updated: usize,
        errors: usize,
        transferred: usize,
        notice: String,
    },
    MissionFinished {
        mission_id: Uuid,
        mission: Mission,
        outcome: MissionOutcome,
        report: MissionReport,
        duration: Duration,
        notice: String,
    },
    /// A start request arrived while a mission was running
    Rejected {
        mission_id: Uuid,
        reason: String,
    },
    /// Worker task has exited
    Terminated,
}

impl WorkerEvent {
    /// Outcome if this event ends a mission
    pub fn outcome(&self) -> Option<MissionOutcome> {
        match self {
            WorkerEvent::MissionFinished { outcome, .. } => Some(*outcome),
            _ => None,
        }
    }
}

/// Receiving end, held by the controller
pub struct ProgressChannel {
    receiver: mpsc::UnboundedReceiver<WorkerEvent>,
}

impl ProgressChannel {
    /// Create a new progress channel
    pub fn new() -> (ProgressReporter, Self) {
        let (sender, receiver) = mpsc::unbounded_channel();
        let reporter = ProgressReporter::new(sender);
        let channel = Self { receiver };
        (reporter, channel)
    }

    /// Receive the next event
    pub async fn recv(&mut self) -> Option<WorkerEvent> {
        self.receiver.recv().await
    }

    /// Receive an event without blocking
    pub fn try_recv(&mut self) -> Result<WorkerEvent> {
        self.receiver.try_recv().map_err(|e| match e {
            mpsc::error::TryRecvError::Empty => {
                SyncError::Progress("No worker events available".to_string())
            }
            mpsc::error::TryRecvError::Disconnected => {
                SyncError::Progress("Worker channel disconnected".to_string())
            }
        })
    }
}

/// Sending end, held by the worker
#[derive(Clone)]
pub struct ProgressReporter {
    sender: mpsc::UnboundedSender<WorkerEvent>,
    state: Arc<RwLock<ProgressState>>,
}

#[derive(Debug)]
struct ProgressState {
    mission_id: Uuid,
    started_at: Instant,
    scanned: usize,
    updated: usize,
    errors: usize,
    transferred: usize,
}

impl ProgressReporter {
    fn new(sender: mpsc::UnboundedSender<WorkerEvent>) -> Self {
        Self {
            sender,
            state: Arc::new(RwLock::new(ProgressState {
                mission_id: Uuid::nil(),
                started_at: Instant::now(),
                scanned: 0,
                updated: 0,
                errors: 0,
                transferred: 0,
            })),
        }
    }

    pub fn alive(&self) -> Result<()> {
        self.send(WorkerEvent::Alive)
    }

    pub fn state_changed(&self, state: WorkerState) -> Result<()> {
        self.send(WorkerEvent::StateChanged(state))
    }

    /// Reset the counters and announce a mission
    pub async fn mission_started(
        &self,
        mission_id: Uuid,
        mission: Mission,
        targets: usize,
    ) -> Result<()> {
        {
            let mut state = self.state.write().await;
            state.mission_id = mission_id;
            state.started_at = Instant::now();
            state.scanned = 0;
            state.updated = 0;
            state.errors = 0;
            state.transferred = 0;
        }

        self.send(WorkerEvent::MissionStarted {
            mission_id,
            mission,
            targets,
        })
    }

    /// Count one transferred file
    pub async fn file_transferred(&self, name: &str) -> Result<()> {
        {
            let mut state = self.state.write().await;
            state.transferred += 1;
        }
        self.send_progress(format!("Downloaded {}", name)).await
    }

    /// Count one finished tile
    pub async fn tile_finished(&self, tile: &str, updated: usize, errors: usize) -> Result<()> {
        {
            let mut state = self.state.write().await;
            state.scanned += 1;
            state.updated += updated;
            state.errors += errors;
        }
        let notice = if errors > 0 {
            format!("Tile {} done ({} updates, {} errors)", tile, updated, errors)
        } else {
            format!("Tile {} done ({} updates)", tile, updated)
        };
        self.send_progress(notice).await
    }

    pub async fn mission_finished(
        &self,
        mission: Mission,
        outcome: MissionOutcome,
        report: MissionReport,
        notice: impl Into<String>,
    ) -> Result<()> {
        let state = self.state.read().await;
        self.send(WorkerEvent::MissionFinished {
            mission_id: state.mission_id,
            mission,
            outcome,
            report,
            duration: state.started_at.elapsed(),
            notice: notice.into(),
        })
    }

    pub fn rejected(&self, mission_id: Uuid, reason: impl Into<String>) -> Result<()> {
        self.send(WorkerEvent::Rejected {
            mission_id,
            reason: reason.into(),
        })
    }

    pub fn terminated(&self) -> Result<()> {
        self.send(WorkerEvent::Terminated)
    }

    async fn send_progress(&self, notice: String) -> Result<()> {
        let state = self.state.read().await;
        self.send(WorkerEvent::Progress {
            mission_id: state.mission_id,
            scanned: state.scanned,
            updated: state.updated,
            errors: state.errors,
            transferred: state.transferred,
            notice,
        })
    }

    fn send(&self, event: WorkerEvent) -> Result<()> {
        self.sender
            .send(event)
            .map_err(|_| SyncError::Progress("Worker channel disconnected".to_string()))
    }
}
