//! Work unit and result event data model

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use uuid::Uuid;

/// One dispatchable item of remote work, e.g. a test class to execute
///
/// Opaque to the transport layer: the worker entry interprets `kind` and
/// `payload`. Immutable once created.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkUnit {
    pub id: Uuid,
    pub kind: String,
    pub payload: JsonValue,
}

impl WorkUnit {
    /// Create a new work unit with a fresh id
    pub fn new(kind: impl Into<String>, payload: JsonValue) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind: kind.into(),
            payload,
        }
    }
}

/// Outcome of one executed work unit
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum UnitOutcome {
    Success,
    Failed { message: String },
}

/// One asynchronous notification produced by the worker
///
/// Events correlate to work units through `unit_id`, never through
/// submission order: result delivery may interleave with the dispatch of
/// further units.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ResultEvent {
    /// Execution of a unit began in the worker
    Started {
        unit_id: Uuid,
        timestamp: DateTime<Utc>,
    },

    /// Intermediate output produced while executing a unit
    Output { unit_id: Uuid, message: String },

    /// Execution of a unit finished
    Completed {
        unit_id: Uuid,
        outcome: UnitOutcome,
        duration_ms: i64,
    },

    /// Worker process lifecycle notification
    WorkerLifecycle { worker_id: String, message: String },
}

impl ResultEvent {
    /// The unit this event belongs to, if any
    pub fn unit_id(&self) -> Option<Uuid> {
        match self {
            ResultEvent::Started { unit_id, .. }
            | ResultEvent::Output { unit_id, .. }
            | ResultEvent::Completed { unit_id, .. } => Some(*unit_id),
            ResultEvent::WorkerLifecycle { .. } => None,
        }
    }
}

/// Caller-supplied consumer of result events
///
/// Invoked from the channel's delivery task, sequentially for one processor;
/// implementations must not assume they run on the submitting thread. A
/// failing `on_event` is isolated and does not stop delivery of subsequent
/// events.
pub trait ResultSink: Send + Sync + 'static {
    fn on_event(&self, event: ResultEvent) -> anyhow::Result<()>;

    /// The worker's transport died before an orderly stop
    fn on_disconnect(&self) {}
}
