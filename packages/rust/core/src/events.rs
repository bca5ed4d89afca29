//! Pipeline event bus.
//!
//! Fan-out of run lifecycle and progress events over a tokio broadcast
//! channel. Subscribers only see events published after they subscribed;
//! current state is available from [`crate::Orchestrator::get_status`].
//!
//! Each subscriber may fall at most `capacity` events behind. A subscriber
//! that lags further is disconnected: its [`Subscription::recv`] returns
//! `None` from then on. Publishing never waits for subscribers.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast::{self, error::RecvError, error::TryRecvError};
use tracing::warn;

use codelore_shared::{RunCounts, RunId, RunStatus, Stage};

/// Events emitted by the orchestrator, in stage order for any one run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PipelineEvent {
    StageStarted {
        run_id: RunId,
        stage: Stage,
    },
    StageProgress {
        run_id: RunId,
        stage: Stage,
        processed: usize,
        total: usize,
    },
    /// First occurrence of a pattern type in a scanned file.
    PatternDiscovered {
        run_id: RunId,
        file: String,
        pattern_type: String,
        value: String,
    },
    StageCompleted {
        run_id: RunId,
        stage: Stage,
        summary: RunCounts,
    },
    RunCompleted {
        run_id: RunId,
        status: RunStatus,
        summary: RunCounts,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
}

impl PipelineEvent {
    pub fn run_id(&self) -> &RunId {
        match self {
            Self::StageStarted { run_id, .. }
            | Self::StageProgress { run_id, .. }
            | Self::PatternDiscovered { run_id, .. }
            | Self::StageCompleted { run_id, .. }
            | Self::RunCompleted { run_id, .. } => run_id,
        }
    }

    /// Wire name of the event type.
    pub fn name(&self) -> &'static str {
        match self {
            Self::StageStarted { .. } => "stage_started",
            Self::StageProgress { .. } => "stage_progress",
            Self::PatternDiscovered { .. } => "pattern_discovered",
            Self::StageCompleted { .. } => "stage_completed",
            Self::RunCompleted { .. } => "run_completed",
        }
    }
}

/// Broadcast bus for [`PipelineEvent`]s. Cheap to clone.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<PipelineEvent>,
    capacity: usize,
}

impl EventBus {
    /// Create a bus buffering up to `capacity` events per subscriber.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (tx, _) = broadcast::channel(capacity);
        Self { tx, capacity }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Publish to all current subscribers. Returns how many there were;
    /// zero subscribers is not an error.
    pub fn publish(&self, event: PipelineEvent) -> usize {
        self.tx.send(event).unwrap_or(0)
    }

    /// Receive every event published from now on.
    pub fn subscribe(&self) -> Subscription {
        Subscription {
            rx: Some(self.tx.subscribe()),
            lagged: false,
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

/// One subscriber's view of the bus.
pub struct Subscription {
    rx: Option<broadcast::Receiver<PipelineEvent>>,
    lagged: bool,
}

impl Subscription {
    /// Next event, or `None` once the bus is gone or this subscriber was
    /// disconnected for falling behind.
    pub async fn recv(&mut self) -> Option<PipelineEvent> {
        let rx = self.rx.as_mut()?;
        match rx.recv().await {
            Ok(event) => Some(event),
            Err(RecvError::Lagged(skipped)) => {
                self.disconnect_slow(skipped);
                None
            }
            Err(RecvError::Closed) => {
                self.rx = None;
                None
            }
        }
    }

    /// Next already-buffered event without waiting.
    pub fn try_recv(&mut self) -> Option<PipelineEvent> {
        let rx = self.rx.as_mut()?;
        match rx.try_recv() {
            Ok(event) => Some(event),
            Err(TryRecvError::Lagged(skipped)) => {
                self.disconnect_slow(skipped);
                None
            }
            Err(TryRecvError::Closed) => {
                self.rx = None;
                None
            }
            Err(TryRecvError::Empty) => None,
        }
    }

    fn disconnect_slow(&mut self, skipped: u64) {
        warn!(skipped, "event subscriber fell behind, disconnecting");
        self.rx = None;
        self.lagged = true;
    }

    pub fn is_connected(&self) -> bool {
        self.rx.is_some()
    }

    /// Whether this subscriber was dropped for being too slow.
    pub fn was_disconnected_for_lag(&self) -> bool {
        self.lagged
    }
}
