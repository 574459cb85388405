//! Controller side of the single background worker
//!
//! Commands go to the worker over an mpsc channel, events come back over a
//! [`ProgressChannel`], and the worker publishes its lifecycle state through
//! a watch channel. The worker is spawned on the first dispatch.
//!
//! ```text
//! Idle --Start--> Busy --(tiles done)--> Idle
//!                 Busy --Abort--> Aborting --> Idle
//! Idle | Busy --Exit--> Terminated
//! ```

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::error::TryRecvError;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::engine::SyncEngine;
use crate::error::{Result, SyncError};
use crate::mission::MissionOrder;
use crate::progress::{ProgressChannel, ProgressReporter, WorkerEvent};

/// Default pause between command polls while idle
pub const DEFAULT_IDLE_POLL: Duration = Duration::from_secs(2);

/// Requests from the controller
#[derive(Debug)]
pub enum WorkerCommand {
    Start(Box<MissionOrder>),
    /// Stop the running mission at the next tile boundary
    Abort,
    /// Stop the worker
    Exit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WorkerState {
    Idle,
    Busy,
    Aborting,
    Terminated,
}

/// Timing of the worker and of its startup handshake
#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub idle_poll: Duration,
    /// Checks for the worker to report alive
    pub alive_attempts: u32,
    /// Further checks for it to reach `Idle`
    pub idle_attempts: u32,
    pub startup_interval: Duration,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            idle_poll: DEFAULT_IDLE_POLL,
            alive_attempts: 10,
            idle_attempts: 5,
            startup_interval: Duration::from_secs(1),
        }
    }
}

struct WorkerHandle {
    commands: mpsc::UnboundedSender<WorkerCommand>,
    state: watch::Receiver<Option<WorkerState>>,
    events: ProgressChannel,
    task: JoinHandle<()>,
}

/// Owns the worker and enforces one mission at a time
pub struct WorkerCoordinator {
    engine: Option<SyncEngine>,
    settings: WorkerSettings,
    worker: Option<WorkerHandle>,
    in_flight: Option<Uuid>,
}

impl WorkerCoordinator {
    pub fn new(engine: SyncEngine, settings: WorkerSettings) -> Self {
        Self {
            engine: Some(engine),
            settings,
            worker: None,
            in_flight: None,
        }
    }

    /// Last state published by the worker; `None` before it is spawned
    pub fn state(&self) -> Option<WorkerState> {
        self.worker.as_ref().and_then(|w| *w.state.borrow())
    }

    /// Mission dispatched and not yet reported finished
    pub fn in_flight(&self) -> Option<Uuid> {
        self.in_flight
    }

    /// Hand `order` to the worker, spawning it first if needed.
    ///
    /// Fails with [`SyncError::WorkerBusy`] unless the worker is idle.
    pub async fn dispatch(&mut self, order: MissionOrder) -> Result<Uuid> {
        self.ensure_worker().await?;

        if self.in_flight.is_some() {
            return Err(SyncError::WorkerBusy);
        }
        match self.state() {
            Some(WorkerState::Idle) => {}
            Some(WorkerState::Terminated) | None => {
                return Err(SyncError::WorkerUnavailable("worker has terminated".to_string()))
            }
            Some(_) => return Err(SyncError::WorkerBusy),
        }

        let id = order.id;
        self.send(WorkerCommand::Start(Box::new(order)))?;
        self.in_flight = Some(id);
        info!(mission_id = %id, "Mission dispatched");
        Ok(id)
    }

    /// Ask the running mission to stop after its current tile
    pub fn abort(&self) -> Result<()> {
        if self.worker.is_none() {
            return Ok(());
        }
        info!("Abort requested");
        self.send(WorkerCommand::Abort)
    }

    /// Next worker event; `None` once the worker is gone
    pub async fn next_event(&mut self) -> Option<WorkerEvent> {
        let event = self.worker.as_mut()?.events.recv().await?;
        self.observe(&event);
        Some(event)
    }

    /// Next worker event if one is waiting
    pub fn try_next_event(&mut self) -> Option<WorkerEvent> {
        let event = self.worker.as_mut()?.events.try_recv().ok()?;
        self.observe(&event);
        Some(event)
    }

    /// Drain events until the running mission finishes
    pub async fn wait_finished(&mut self) -> Option<WorkerEvent> {
        while let Some(event) = self.next_event().await {
            if event.outcome().is_some() {
                return Some(event);
            }
        }
        None
    }

    /// Stop the worker and wait for it. A running mission ends at its next
    /// tile boundary.
    pub async fn shutdown(&mut self) -> Result<()> {
        let Some(worker) = self.worker.take() else {
            return Ok(());
        };
        // The worker may already be gone
        let _ = worker.commands.send(WorkerCommand::Exit);
        worker
            .task
            .await
            .map_err(|e| SyncError::WorkerUnavailable(format!("worker task failed: {}", e)))?;
        self.in_flight = None;
        info!("Worker shut down");
        Ok(())
    }

    fn observe(&mut self, event: &WorkerEvent) {
        match event {
            WorkerEvent::MissionFinished { mission_id, .. } => {
                if self.in_flight == Some(*mission_id) {
                    self.in_flight = None;
                }
            }
            WorkerEvent::Rejected { mission_id, reason } => {
                warn!(mission_id = %mission_id, "Mission rejected: {}", reason);
                if self.in_flight == Some(*mission_id) {
                    self.in_flight = None;
                }
            }
            WorkerEvent::Terminated => self.in_flight = None,
            _ => {}
        }
    }

    fn send(&self, command: WorkerCommand) -> Result<()> {
        let worker = self
            .worker
            .as_ref()
            .ok_or_else(|| SyncError::WorkerUnavailable("worker not started".to_string()))?;
        worker
            .commands
            .send(command)
            .map_err(|_| SyncError::WorkerUnavailable("worker has exited".to_string()))
    }

    async fn ensure_worker(&mut self) -> Result<()> {
        if self.worker.is_some() {
            return Ok(());
        }
        let engine = self
            .engine
            .take()
            .ok_or_else(|| SyncError::WorkerUnavailable("worker already shut down".to_string()))?;

        let (reporter, events) = ProgressChannel::new();
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(None);
        let engine = engine.with_reporter(reporter.clone());
        let task = tokio::spawn(run_worker(
            engine,
            reporter,
            command_rx,
            state_tx,
            self.settings.idle_poll,
        ));
        debug!("Worker spawned");

        self.worker = Some(WorkerHandle {
            commands: command_tx,
            state: state_rx,
            events,
            task,
        });

        let settings = self.settings.clone();
        if !self
            .wait_for_state(settings.alive_attempts, settings.startup_interval, |s| s.is_some())
            .await
        {
            return Err(self.abandon_worker("worker did not report alive"));
        }
        if !self
            .wait_for_state(settings.idle_attempts, settings.startup_interval, |s| {
                s == Some(WorkerState::Idle)
            })
            .await
        {
            return Err(self.abandon_worker("worker did not become idle"));
        }
        Ok(())
    }

    /// Drop a worker that failed the startup handshake. The engine went with
    /// it, so later dispatches report the worker as unavailable.
    fn abandon_worker(&mut self, reason: &str) -> SyncError {
        if let Some(worker) = self.worker.take() {
            worker.task.abort();
        }
        warn!("Worker startup abandoned: {}", reason);
        SyncError::WorkerUnavailable(reason.to_string())
    }

    async fn wait_for_state<P>(&self, attempts: u32, interval: Duration, ready: P) -> bool
    where
        P: Fn(Option<WorkerState>) -> bool,
    {
        for attempt in 0..attempts {
            if ready(self.state()) {
                return true;
            }
            debug!("Waiting for worker ({}/{})", attempt + 1, attempts);
            sleep(interval).await;
        }
        false
    }
}

fn publish(
    state_tx: &watch::Sender<Option<WorkerState>>,
    reporter: &ProgressReporter,
    state: WorkerState,
) {
    state_tx.send_replace(Some(state));
    if let Err(e) = reporter.state_changed(state) {
        debug!("State change not delivered: {}", e);
    }
}

async fn run_worker(
    engine: SyncEngine,
    reporter: ProgressReporter,
    mut commands: mpsc::UnboundedReceiver<WorkerCommand>,
    state_tx: watch::Sender<Option<WorkerState>>,
    idle_poll: Duration,
) {
    if let Err(e) = reporter.alive() {
        debug!("Alive signal not delivered: {}", e);
    }
    publish(&state_tx, &reporter, WorkerState::Idle);

    loop {
        let command = match timeout(idle_poll, commands.recv()).await {
            Err(_) => continue,
            Ok(None) => {
                debug!("Controller dropped the command channel");
                break;
            }
            Ok(Some(command)) => command,
        };

        match command {
            WorkerCommand::Start(order) => {
                publish(&state_tx, &reporter, WorkerState::Busy);
                let mut exit_requested = false;
                let result = engine
                    .run(&order, || {
                        interrupt_requested(&mut commands, &reporter, &state_tx, &mut exit_requested)
                    })
                    .await;
                debug!(mission_id = %order.id, "Mission ended: {:?}", result.outcome);
                if exit_requested {
                    break;
                }
                publish(&state_tx, &reporter, WorkerState::Idle);
            }
            WorkerCommand::Abort => debug!("No mission to abort"),
            WorkerCommand::Exit => break,
        }
    }

    publish(&state_tx, &reporter, WorkerState::Terminated);
    if let Err(e) = reporter.terminated() {
        debug!("Termination not delivered: {}", e);
    }
    info!("Worker terminated");
}

/// Drain commands that arrived during a tile
fn interrupt_requested(
    commands: &mut mpsc::UnboundedReceiver<WorkerCommand>,
    reporter: &ProgressReporter,
    state_tx: &watch::Sender<Option<WorkerState>>,
    exit_requested: &mut bool,
) -> bool {
    loop {
        match commands.try_recv() {
            Ok(WorkerCommand::Abort) => {
                publish(state_tx, reporter, WorkerState::Aborting);
                return true;
            }
            Ok(WorkerCommand::Exit) | Err(TryRecvError::Disconnected) => {
                *exit_requested = true;
                return true;
            }
            Ok(WorkerCommand::Start(order)) => {
                if let Err(e) = reporter.rejected(order.id, "a mission is already running") {
                    debug!("Rejection not delivered: {}", e);
                }
            }
            Err(TryRecvError::Empty) => return false,
        }
    }
}
