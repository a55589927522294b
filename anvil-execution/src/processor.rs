//! Forking work processor
//!
//! Parent-side facade over one out-of-process worker. The worker is forked
//! lazily on the first submitted unit, so a session that never submits never
//! pays for a process. Submission enqueues the unit on the worker's channel
//! and returns; results arrive asynchronously through the caller's sink.

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::error::ExecutionError;
use crate::process::{OsProcessLauncher, WorkerLauncher, WorkerProcess};
use crate::remote::{
    result_sink_interface, work_processor_interface, RemoteWorkProcessor, ResultSinkBinding,
};
use crate::unit::{ResultSink, WorkUnit};
use crate::worker::WorkerProcessConfig;

/// Processor lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessorState {
    /// No worker process exists yet
    Idle,
    /// A worker is running and accepting units
    Active,
    /// `stop` has completed; the processor cannot be reused
    Stopped,
}

struct ActiveWorker {
    process: WorkerProcess,
    remote: RemoteWorkProcessor,
}

/// Executes work units in a forked worker process
pub struct ForkingProcessor {
    config: WorkerProcessConfig,
    launcher: Arc<dyn WorkerLauncher>,
    sink: Option<Arc<dyn ResultSink>>,
    state: ProcessorState,
    worker: Option<ActiveWorker>,
}

impl ForkingProcessor {
    /// Create a processor that forks real OS processes
    pub fn new(config: WorkerProcessConfig) -> Self {
        Self::with_launcher(config, Arc::new(OsProcessLauncher))
    }

    /// Create a processor with a caller-supplied launcher
    pub fn with_launcher(config: WorkerProcessConfig, launcher: Arc<dyn WorkerLauncher>) -> Self {
        Self {
            config,
            launcher,
            sink: None,
            state: ProcessorState::Idle,
            worker: None,
        }
    }

    pub fn state(&self) -> ProcessorState {
        self.state
    }

    /// Register the sink that receives result events from the worker
    ///
    /// Must be called once, before the first `submit`.
    pub fn start_processing(&mut self, sink: Arc<dyn ResultSink>) -> Result<(), ExecutionError> {
        if self.state == ProcessorState::Stopped {
            return Err(ExecutionError::ProcessorStopped);
        }
        if self.sink.is_some() {
            return Err(ExecutionError::AlreadyStarted);
        }
        self.sink = Some(sink);
        Ok(())
    }

    /// Submit one work unit for remote execution
    ///
    /// Forks the worker on the first call; later calls reuse it. Returns once
    /// the unit is enqueued on the channel, never waiting for execution. A
    /// fork failure leaves the processor idle, so a later submit retries the
    /// fork.
    pub async fn submit(&mut self, unit: WorkUnit) -> Result<(), ExecutionError> {
        if self.state == ProcessorState::Stopped {
            return Err(ExecutionError::ProcessorStopped);
        }
        if self.sink.is_none() {
            return Err(ExecutionError::NotStarted);
        }

        if self.worker.is_none() {
            let active = self.fork().await?;
            self.worker = Some(active);
            self.state = ProcessorState::Active;
        }
        let Some(active) = self.worker.as_ref() else {
            return Err(ExecutionError::InvalidState(
                "worker missing after fork".to_string(),
            ));
        };

        debug!("submitting unit {} to worker", unit.id);
        active.remote.process(&unit).await.map_err(Into::into)
    }

    /// Stop the processor and tear down the worker. Idempotent.
    ///
    /// Asks the worker to finish, flushes and closes the channel, drains any
    /// trailing result events, and waits for the process to exit. A worker
    /// that outlives the grace period is forcibly terminated and reported as
    /// `WorkerStopTimeout`.
    pub async fn stop(&mut self) -> Result<(), ExecutionError> {
        match self.state {
            ProcessorState::Stopped => return Ok(()),
            ProcessorState::Idle => {
                self.state = ProcessorState::Stopped;
                return Ok(());
            }
            ProcessorState::Active => {}
        }
        self.state = ProcessorState::Stopped;
        let Some(mut active) = self.worker.take() else {
            return Ok(());
        };

        let mut first_error: Option<ExecutionError> = None;

        if let Err(e) = active.remote.stop().await {
            warn!("sending stop to worker: {}", e);
            first_error = Some(e.into());
        }
        if let Ok(connection) = active.process.connection() {
            if let Err(e) = connection.close().await {
                debug!("closing worker channel: {}", e);
            }
        }

        let wait = active.process.wait_for_stop().await;

        // trailing result events may still be in flight after the worker exits
        if let Ok(connection) = active.process.connection() {
            connection.join().await;
            for error in connection.drain_dispatch_errors() {
                warn!(
                    "result dispatch failure in {}.{}: {}",
                    error.interface, error.method, error.message
                );
            }
        }

        match wait {
            Ok(exit) => {
                if !exit.success() {
                    warn!("worker exited with status {:?}", exit.code);
                }
            }
            Err(e) => {
                if first_error.is_none() {
                    first_error = Some(e);
                }
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    async fn fork(&self) -> Result<ActiveWorker, ExecutionError> {
        let sink = self.sink.clone().ok_or(ExecutionError::NotStarted)?;
        info!("forking worker {}", self.config.worker_id);

        let mut process = WorkerProcess::new(self.config.clone(), self.launcher.clone());
        process.start().await?;

        match bind_worker(&process, sink).await {
            Ok(remote) => Ok(ActiveWorker { process, remote }),
            Err(e) => {
                if let Ok(connection) = process.connection() {
                    let _ = connection.close().await;
                }
                let _ = process.wait_for_stop().await;
                Err(e)
            }
        }
    }
}

async fn bind_worker(
    process: &WorkerProcess,
    sink: Arc<dyn ResultSink>,
) -> Result<RemoteWorkProcessor, ExecutionError> {
    let connection = process.connection()?;
    connection.add_incoming(result_sink_interface(), ResultSinkBinding::new(sink))?;
    let remote = RemoteWorkProcessor::new(connection.add_outgoing(work_processor_interface())?);
    remote.begin_processing().await?;
    Ok(remote)
}
