//! End-to-end tests against a real forked worker process

use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Duration;

use serde_json::json;
use tokio::sync::Notify;
use tokio::time::timeout;

use anvil_execution::{
    ExecutionError, ForkingProcessor, ResultEvent, ResultSink, UnitOutcome, WorkUnit,
    WorkerProcessBuilder, WorkerProcessConfig,
};

struct TestSink {
    events: Mutex<Vec<ResultEvent>>,
    disconnected: Notify,
}

impl TestSink {
    fn new() -> std::sync::Arc<Self> {
        std::sync::Arc::new(Self {
            events: Mutex::new(Vec::new()),
            disconnected: Notify::new(),
        })
    }

    fn outputs(&self) -> Vec<String> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter_map(|event| match event {
                ResultEvent::Output { message, .. } => Some(message.clone()),
                _ => None,
            })
            .collect()
    }

    fn completions(&self) -> Vec<UnitOutcome> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter_map(|event| match event {
                ResultEvent::Completed { outcome, .. } => Some(outcome.clone()),
                _ => None,
            })
            .collect()
    }
}

impl ResultSink for TestSink {
    fn on_event(&self, event: ResultEvent) -> anyhow::Result<()> {
        self.events.lock().unwrap().push(event);
        Ok(())
    }

    fn on_disconnect(&self) {
        self.disconnected.notify_one();
    }
}

fn worker_config() -> WorkerProcessConfig {
    WorkerProcessBuilder::new(env!("CARGO_BIN_EXE_echo_worker"))
        .classpath(vec![PathBuf::from(env!("CARGO_MANIFEST_DIR"))])
        .startup_timeout(Duration::from_secs(10))
        .stop_grace_period(Duration::from_secs(10))
        .build()
        .unwrap()
}

#[tokio::test]
async fn echo_units_complete_in_order() {
    let sink = TestSink::new();
    let mut processor = ForkingProcessor::new(worker_config());
    processor.start_processing(sink.clone()).unwrap();

    processor
        .submit(WorkUnit::new("echo", json!("a")))
        .await
        .unwrap();
    processor
        .submit(WorkUnit::new("echo", json!("b")))
        .await
        .unwrap();
    processor.stop().await.unwrap();

    // stop drains every trailing event before returning
    assert_eq!(sink.outputs(), vec!["done:a", "done:b"]);
    assert_eq!(
        sink.completions(),
        vec![UnitOutcome::Success, UnitOutcome::Success]
    );
}

#[tokio::test]
async fn failed_unit_is_reported_and_session_continues() {
    let sink = TestSink::new();
    let mut processor = ForkingProcessor::new(worker_config());
    processor.start_processing(sink.clone()).unwrap();

    processor
        .submit(WorkUnit::new("fail", json!("broken fixture")))
        .await
        .unwrap();
    processor
        .submit(WorkUnit::new("echo", json!("still-alive")))
        .await
        .unwrap();
    processor.stop().await.unwrap();

    let completions = sink.completions();
    assert_eq!(completions.len(), 2);
    assert!(matches!(
        completions[0],
        UnitOutcome::Failed { ref message } if message.contains("broken fixture")
    ));
    assert_eq!(completions[1], UnitOutcome::Success);
    assert_eq!(sink.outputs(), vec!["done:still-alive"]);
}

#[tokio::test]
async fn worker_crash_breaks_the_channel() {
    let sink = TestSink::new();
    let mut processor = ForkingProcessor::new(worker_config());
    processor.start_processing(sink.clone()).unwrap();

    // the submit itself succeeds; the crash surfaces asynchronously
    processor
        .submit(WorkUnit::new("exit", json!(7)))
        .await
        .unwrap();
    timeout(Duration::from_secs(10), sink.disconnected.notified())
        .await
        .expect("disconnect was never reported");

    match processor.submit(WorkUnit::new("echo", json!("late"))).await {
        Err(e) => assert!(e.worker_unusable(), "unexpected error: {:?}", e),
        Ok(()) => panic!("submit to a crashed worker succeeded"),
    }

    // stop after a crash reports the broken channel
    assert!(processor.stop().await.is_err());
}

#[tokio::test]
async fn missing_worker_binary_is_a_start_failure() {
    let config = WorkerProcessBuilder::new("/nonexistent/anvil-echo-worker")
        .classpath(vec![PathBuf::from(env!("CARGO_MANIFEST_DIR"))])
        .build()
        .unwrap();

    let sink = TestSink::new();
    let mut processor = ForkingProcessor::new(config);
    processor.start_processing(sink).unwrap();

    match processor.submit(WorkUnit::new("echo", json!("a"))).await {
        Err(ExecutionError::WorkerStartFailure { reason, .. }) => {
            assert!(reason.contains("failed to spawn"));
        }
        other => panic!("expected WorkerStartFailure, got {:?}", other),
    }
}

#[cfg(unix)]
#[tokio::test]
async fn worker_exiting_before_handshake_is_a_start_failure() {
    let config = WorkerProcessBuilder::new("/bin/false")
        .classpath(vec![PathBuf::from(env!("CARGO_MANIFEST_DIR"))])
        .startup_timeout(Duration::from_secs(10))
        .build()
        .unwrap();

    let sink = TestSink::new();
    let mut processor = ForkingProcessor::new(config);
    processor.start_processing(sink).unwrap();

    match processor.submit(WorkUnit::new("echo", json!("a"))).await {
        Err(ExecutionError::WorkerStartFailure { reason, exit_code, .. }) => {
            assert!(reason.contains("exited before completing handshake"));
            assert_eq!(exit_code, Some(1));
        }
        other => panic!("expected WorkerStartFailure, got {:?}", other),
    }
}
