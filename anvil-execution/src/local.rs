//! In-process worker launcher
//!
//! Runs a worker entry on a local task over an in-memory transport instead
//! of forking a process. The full handshake and channel protocol still
//! apply, which makes this launcher useful for debugging worker entries and
//! for tests.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tracing::error;

use anvil_ipc::Transport;

use crate::error::ExecutionError;
use crate::harness::{run_worker, WorkerEntry};
use crate::process::{LaunchedWorker, WorkerExit, WorkerLauncher};
use crate::worker::WorkerProcessConfig;

/// Launcher that runs the worker loop on a local task
pub struct InProcessLauncher<E: WorkerEntry> {
    entry: Arc<E>,
}

impl<E: WorkerEntry> InProcessLauncher<E> {
    pub fn new(entry: Arc<E>) -> Self {
        Self { entry }
    }
}

#[async_trait]
impl<E: WorkerEntry> WorkerLauncher for InProcessLauncher<E> {
    async fn launch(
        &self,
        config: &WorkerProcessConfig,
    ) -> Result<(Box<dyn LaunchedWorker>, Transport), ExecutionError> {
        let (parent, child) = Transport::in_memory_pair();
        let entry = self.entry.clone();
        let worker_id = config.worker_id.clone();
        let task = tokio::spawn(async move {
            match run_worker(entry, worker_id, child).await {
                Ok(code) => code,
                Err(e) => {
                    error!("in-process worker failed: {}", e);
                    1
                }
            }
        });
        Ok((
            Box::new(InProcessWorker {
                task: Some(task),
                exit: None,
            }),
            parent,
        ))
    }
}

/// Handle over the local worker task; `kill` aborts it
pub struct InProcessWorker {
    task: Option<JoinHandle<i32>>,
    exit: Option<WorkerExit>,
}

#[async_trait]
impl LaunchedWorker for InProcessWorker {
    fn pid(&self) -> Option<u32> {
        None
    }

    async fn wait(&mut self) -> Result<WorkerExit, ExecutionError> {
        if let Some(exit) = self.exit {
            return Ok(exit);
        }
        let task = self
            .task
            .take()
            .ok_or_else(|| ExecutionError::Process("worker task already consumed".to_string()))?;
        // an aborted task reports no exit code, like a killed process
        let exit = match task.await {
            Ok(code) => WorkerExit { code: Some(code) },
            Err(_) => WorkerExit { code: None },
        };
        self.exit = Some(exit);
        Ok(exit)
    }

    async fn kill(&mut self) -> Result<(), ExecutionError> {
        if let Some(task) = &self.task {
            task.abort();
        }
        Ok(())
    }

    async fn diagnostic_output(&mut self) -> String {
        String::new()
    }
}
