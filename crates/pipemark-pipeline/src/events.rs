//! Progress reporting for pipeline runs.
//!
//! Emits [`ProgressEvent`]s via a [`tokio::sync::broadcast`] channel so that
//! callers can follow a run without coupling to the executor internals.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Events emitted while a pipeline runs.
///
/// Step events are only emitted for natural-language steps.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ProgressEvent {
    PipelineStarted {
        run_id: Uuid,
        pipeline: String,
        step_count: usize,
    },
    PipelineCompleted {
        run_id: Uuid,
        pipeline: String,
        duration_ms: u64,
    },
    PipelineFailed {
        run_id: Uuid,
        pipeline: String,
        error: String,
    },
    StepStarted {
        run_id: Uuid,
        step: String,
        title: String,
    },
    StepCompleted {
        run_id: Uuid,
        step: String,
        resulting_parameter: String,
        duration_ms: u64,
    },
}

/// Event emitter wrapping a broadcast sender.
#[derive(Clone)]
pub struct EventEmitter {
    sender: tokio::sync::broadcast::Sender<ProgressEvent>,
}

impl EventEmitter {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = tokio::sync::broadcast::channel(capacity);
        Self { sender }
    }

    /// Emit an event to all current subscribers; dropped when nobody listens.
    pub fn emit(&self, event: ProgressEvent) {
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<ProgressEvent> {
        self.sender.subscribe()
    }
}

impl Default for EventEmitter {
    fn default() -> Self {
        Self::new(256)
    }
}
