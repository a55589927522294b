//! Worker-side harness
//!
//! Drives a caller-supplied [`WorkerEntry`] from inside the worker process:
//! performs the handshake, binds the work-dispatch and result-reporting
//! interfaces, and runs the request loop until a stop request arrives or the
//! parent connection dies.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::mpsc;
use tracing::{debug, error, warn};

use anvil_ipc::{
    ChannelError, ChannelMessage, Connection, InboundHandler, MessageEnvelope, Transport,
};

use crate::error::ExecutionError;
use crate::remote::{
    decode_work_request, methods, result_sink_interface, work_processor_interface, WorkRequest,
};
use crate::unit::{ResultEvent, UnitOutcome, WorkUnit};

/// Application entry point executed inside the worker process
///
/// `execute` runs once per received work unit, in receive order. Returning
/// an error marks the unit failed; it does not terminate the worker.
#[async_trait]
pub trait WorkerEntry: Send + Sync + 'static {
    async fn execute(&self, unit: WorkUnit, results: &ResultPublisher) -> anyhow::Result<()>;
}

/// Worker-side handle for publishing result events to the parent
pub struct ResultPublisher {
    proxy: anvil_ipc::OutgoingProxy,
    worker_id: String,
}

impl ResultPublisher {
    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    /// Enqueue one event for delivery to the parent's result sink
    pub async fn publish(&self, event: ResultEvent) -> Result<(), ChannelError> {
        self.proxy.invoke(methods::EVENT, &event).await
    }

    /// Publish intermediate output for a unit under execution
    pub async fn output(
        &self,
        unit_id: uuid::Uuid,
        message: impl Into<String>,
    ) -> Result<(), ChannelError> {
        self.publish(ResultEvent::Output {
            unit_id,
            message: message.into(),
        })
        .await
    }

    /// Publish a worker lifecycle notification
    pub async fn lifecycle(&self, message: impl Into<String>) -> Result<(), ChannelError> {
        self.publish(ResultEvent::WorkerLifecycle {
            worker_id: self.worker_id.clone(),
            message: message.into(),
        })
        .await
    }
}

enum HarnessEvent {
    Request(WorkRequest),
    Disconnected,
}

/// Incoming binding that decodes work requests onto the harness queue
struct WorkRequestBinding {
    queue: mpsc::UnboundedSender<HarnessEvent>,
}

impl InboundHandler for WorkRequestBinding {
    fn handle(&self, method: &str, payload: serde_json::Value) -> anyhow::Result<()> {
        let request = decode_work_request(method, payload)?;
        self.queue
            .send(HarnessEvent::Request(request))
            .map_err(|_| anyhow::anyhow!("worker request loop has stopped"))
    }

    fn disconnected(&self) {
        let _ = self.queue.send(HarnessEvent::Disconnected);
    }
}

/// Run the worker loop over a connected transport
///
/// Sends the handshake, then serves work requests until a stop request or a
/// dead parent connection ends the loop. Returns the exit code the worker
/// process should terminate with: zero after an orderly stop, non-zero when
/// the parent vanished.
pub async fn run_worker<E: WorkerEntry>(
    entry: Arc<E>,
    worker_id: String,
    mut transport: Transport,
) -> Result<i32, ExecutionError> {
    transport
        .sink
        .send(&MessageEnvelope::new(ChannelMessage::Ready {
            worker_id: worker_id.clone(),
            pid: std::process::id(),
        }))
        .await
        .map_err(ExecutionError::Channel)?;

    let (queue, mut events) = mpsc::unbounded_channel();
    let connection = Connection::open(transport);
    connection.add_incoming(
        work_processor_interface(),
        Arc::new(WorkRequestBinding { queue }),
    )?;
    let proxy = connection.add_outgoing(result_sink_interface())?;
    let results = ResultPublisher {
        proxy,
        worker_id: worker_id.clone(),
    };

    let mut exit_code = 0;
    while let Some(event) = events.recv().await {
        match event {
            HarnessEvent::Request(WorkRequest::BeginProcessing) => {
                debug!("worker {} accepting work units", worker_id);
                results.lifecycle("worker started").await?;
            }
            HarnessEvent::Request(WorkRequest::Process { unit }) => {
                process_unit(entry.as_ref(), unit, &results).await?;
            }
            HarnessEvent::Request(WorkRequest::Stop) => {
                debug!("worker {} stopping", worker_id);
                break;
            }
            HarnessEvent::Disconnected => {
                error!("parent connection lost, aborting worker {}", worker_id);
                exit_code = 1;
                break;
            }
        }
    }

    // flush pending result events before the process exits
    if let Err(e) = connection.close().await {
        warn!("closing worker channel: {}", e);
    }
    connection.join().await;
    Ok(exit_code)
}

/// Run the worker loop over the process's own stdio
pub async fn run_worker_stdio<E: WorkerEntry>(
    entry: Arc<E>,
    worker_id: String,
) -> Result<i32, ExecutionError> {
    run_worker(entry, worker_id, Transport::stdio()).await
}

async fn process_unit<E: WorkerEntry>(
    entry: &E,
    unit: WorkUnit,
    results: &ResultPublisher,
) -> Result<(), ChannelError> {
    let unit_id = unit.id;
    let started_at = Utc::now();
    results
        .publish(ResultEvent::Started {
            unit_id,
            timestamp: started_at,
        })
        .await?;

    let outcome = match entry.execute(unit, results).await {
        Ok(()) => UnitOutcome::Success,
        Err(e) => {
            warn!("work unit {} failed: {:#}", unit_id, e);
            UnitOutcome::Failed {
                message: format!("{:#}", e),
            }
        }
    };

    let duration_ms = (Utc::now() - started_at).num_milliseconds();
    results
        .publish(ResultEvent::Completed {
            unit_id,
            outcome,
            duration_ms,
        })
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Mutex;

    use crate::remote::{RemoteWorkProcessor, ResultSinkBinding};
    use crate::unit::ResultSink;

    /// Entry that echoes the unit payload back as output
    struct EchoEntry;

    #[async_trait]
    impl WorkerEntry for EchoEntry {
        async fn execute(&self, unit: WorkUnit, results: &ResultPublisher) -> anyhow::Result<()> {
            match unit.kind.as_str() {
                "echo" => {
                    let text = unit.payload.as_str().unwrap_or_default();
                    results.output(unit.id, format!("done:{}", text)).await?;
                    Ok(())
                }
                "fail" => anyhow::bail!("unit refused"),
                other => anyhow::bail!("unknown unit kind {}", other),
            }
        }
    }

    struct RecordingSink {
        events: Mutex<Vec<ResultEvent>>,
    }

    impl RecordingSink {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                events: Mutex::new(Vec::new()),
            })
        }
    }

    impl ResultSink for RecordingSink {
        fn on_event(&self, event: ResultEvent) -> anyhow::Result<()> {
            self.events.lock().unwrap().push(event);
            Ok(())
        }
    }

    /// Drive the harness from the parent side over an in-memory transport.
    async fn run_session(units: Vec<WorkUnit>) -> (i32, Vec<ResultEvent>) {
        let (parent, child) = Transport::in_memory_pair();
        let worker =
            tokio::spawn(run_worker(Arc::new(EchoEntry), "worker-test".to_string(), child));

        let mut parent = parent;
        let envelope = parent.source.receive().await.unwrap().unwrap();
        assert!(matches!(envelope.message, ChannelMessage::Ready { .. }));

        let sink = RecordingSink::new();
        let connection = Connection::open(parent);
        connection
            .add_incoming(result_sink_interface(), ResultSinkBinding::new(sink.clone()))
            .unwrap();
        let remote =
            RemoteWorkProcessor::new(connection.add_outgoing(work_processor_interface()).unwrap());

        remote.begin_processing().await.unwrap();
        for unit in &units {
            remote.process(unit).await.unwrap();
        }
        remote.stop().await.unwrap();
        connection.close().await.unwrap();
        connection.join().await;

        let exit_code = worker.await.unwrap().unwrap();
        let events = sink.events.lock().unwrap().clone();
        (exit_code, events)
    }

    #[tokio::test]
    async fn test_orderly_session_produces_ordered_events() {
        let unit = WorkUnit::new("echo", json!("a"));
        let unit_id = unit.id;
        let (exit_code, events) = run_session(vec![unit]).await;

        assert_eq!(exit_code, 0);
        assert_eq!(events.len(), 4);
        assert!(matches!(&events[0], ResultEvent::WorkerLifecycle { .. }));
        assert!(matches!(&events[1], ResultEvent::Started { unit_id: id, .. } if *id == unit_id));
        assert!(matches!(
            &events[2],
            ResultEvent::Output { message, .. } if message == "done:a"
        ));
        assert!(matches!(
            &events[3],
            ResultEvent::Completed { outcome: UnitOutcome::Success, .. }
        ));
    }

    #[tokio::test]
    async fn test_failing_unit_reports_failure_and_continues() {
        let bad = WorkUnit::new("fail", json!(null));
        let good = WorkUnit::new("echo", json!("b"));
        let (exit_code, events) = run_session(vec![bad.clone(), good.clone()]).await;

        assert_eq!(exit_code, 0);
        let completions: Vec<_> = events
            .iter()
            .filter_map(|event| match event {
                ResultEvent::Completed {
                    unit_id, outcome, ..
                } => Some((*unit_id, outcome.clone())),
                _ => None,
            })
            .collect();
        assert_eq!(completions.len(), 2);
        assert_eq!(completions[0].0, bad.id);
        assert!(matches!(
            completions[0].1,
            UnitOutcome::Failed { ref message } if message.contains("unit refused")
        ));
        assert_eq!(completions[1].0, good.id);
        assert_eq!(completions[1].1, UnitOutcome::Success);
    }

    #[tokio::test]
    async fn test_parent_death_ends_worker_with_failure() {
        let (parent, child) = Transport::in_memory_pair();
        let worker =
            tokio::spawn(run_worker(Arc::new(EchoEntry), "worker-test".to_string(), child));

        let mut parent = parent;
        let _ = parent.source.receive().await.unwrap();
        drop(parent);

        let exit_code = worker.await.unwrap().unwrap();
        assert_eq!(exit_code, 1);
    }
}
