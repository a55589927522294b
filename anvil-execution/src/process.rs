//! Worker process handle and launchers

use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use anvil_ipc::{ChannelMessage, Connection, Transport};

use crate::error::ExecutionError;
use crate::worker::{
    WorkerProcessConfig, WORKER_CLASSPATH_ENV, WORKER_ID_ENV, WORKER_ISOLATED_ENV,
};

/// How long to wait for an exit status while tearing down a failed start
const REAP_TIMEOUT: Duration = Duration::from_secs(5);

/// Exit status of a worker process
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerExit {
    /// Exit code; `None` when the process was killed by a signal
    pub code: Option<i32>,
}

impl WorkerExit {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

/// A launched worker process, before and after its handshake
#[async_trait]
pub trait LaunchedWorker: Send {
    /// OS process id, if the launcher has one
    fn pid(&self) -> Option<u32>;

    /// Wait for the process to exit
    async fn wait(&mut self) -> Result<WorkerExit, ExecutionError>;

    /// Forcibly terminate the process
    async fn kill(&mut self) -> Result<(), ExecutionError>;

    /// Diagnostic output captured so far, for start-failure reports
    async fn diagnostic_output(&mut self) -> String;
}

/// Launches worker processes for a given configuration
#[async_trait]
pub trait WorkerLauncher: Send + Sync {
    async fn launch(
        &self,
        config: &WorkerProcessConfig,
    ) -> Result<(Box<dyn LaunchedWorker>, Transport), ExecutionError>;
}

/// Spawns real OS processes with piped stdio as the channel transport
pub struct OsProcessLauncher;

#[async_trait]
impl WorkerLauncher for OsProcessLauncher {
    async fn launch(
        &self,
        config: &WorkerProcessConfig,
    ) -> Result<(Box<dyn LaunchedWorker>, Transport), ExecutionError> {
        let classpath = std::env::join_paths(&config.classpath).map_err(|e| {
            ExecutionError::Configuration(format!("unrepresentable classpath entry: {}", e))
        })?;

        let mut command = Command::new(&config.program);
        command
            .args(&config.args)
            .env(WORKER_ID_ENV, &config.worker_id)
            .env(WORKER_CLASSPATH_ENV, classpath)
            .env(WORKER_ISOLATED_ENV, if config.isolated { "1" } else { "0" })
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        for (key, value) in &config.env {
            command.env(key, value);
        }
        if let Some(dir) = &config.working_dir {
            command.current_dir(dir);
        }

        debug!("spawning worker process: {}", config.program.display());
        let mut child = command
            .spawn()
            .map_err(|e| ExecutionError::WorkerStartFailure {
                reason: format!("failed to spawn {}: {}", config.program.display(), e),
                exit_code: None,
                output: String::new(),
            })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| ExecutionError::Process("worker stdin not captured".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| ExecutionError::Process("worker stdout not captured".to_string()))?;

        // stderr stays out of the channel; capture it for diagnostics
        let stderr_buffer = Arc::new(Mutex::new(String::new()));
        if let Some(stderr) = child.stderr.take() {
            let buffer = stderr_buffer.clone();
            let worker_id = config.worker_id.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!("[{}] {}", worker_id, line);
                    let mut buffer = buffer.lock().unwrap();
                    buffer.push_str(&line);
                    buffer.push('\n');
                }
            });
        }

        let pid = child.id();
        let transport = Transport::for_child(stdin, stdout);
        Ok((
            Box::new(OsWorker {
                child,
                pid,
                stderr: stderr_buffer,
            }),
            transport,
        ))
    }
}

struct OsWorker {
    child: tokio::process::Child,
    pid: Option<u32>,
    stderr: Arc<Mutex<String>>,
}

#[async_trait]
impl LaunchedWorker for OsWorker {
    fn pid(&self) -> Option<u32> {
        self.pid
    }

    async fn wait(&mut self) -> Result<WorkerExit, ExecutionError> {
        let status = self
            .child
            .wait()
            .await
            .map_err(|e| ExecutionError::Process(e.to_string()))?;
        Ok(WorkerExit {
            code: status.code(),
        })
    }

    async fn kill(&mut self) -> Result<(), ExecutionError> {
        if let Err(e) = self.child.kill().await {
            debug!("killing worker process: {}", e);
        }
        Ok(())
    }

    async fn diagnostic_output(&mut self) -> String {
        self.stderr.lock().unwrap().clone()
    }
}

/// Worker process lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerProcessState {
    Built,
    Starting,
    Running,
    Stopping,
    Stopped,
}

/// Identity reported by the worker during its handshake
#[derive(Debug, Clone)]
pub struct WorkerIdentity {
    pub worker_id: String,
    pub pid: u32,
}

/// Handle owning one worker process and its channel
pub struct WorkerProcess {
    config: WorkerProcessConfig,
    launcher: Arc<dyn WorkerLauncher>,
    state: WorkerProcessState,
    worker: Option<Box<dyn LaunchedWorker>>,
    connection: Option<Connection>,
    identity: Option<WorkerIdentity>,
}

impl WorkerProcess {
    /// Wrap a validated configuration; no process is created yet
    pub fn new(config: WorkerProcessConfig, launcher: Arc<dyn WorkerLauncher>) -> Self {
        Self {
            config,
            launcher,
            state: WorkerProcessState::Built,
            worker: None,
            connection: None,
            identity: None,
        }
    }

    /// Wrap a validated configuration using the OS process launcher
    pub fn from_config(config: WorkerProcessConfig) -> Self {
        Self::new(config, Arc::new(OsProcessLauncher))
    }

    pub fn state(&self) -> WorkerProcessState {
        self.state
    }

    pub fn config(&self) -> &WorkerProcessConfig {
        &self.config
    }

    /// Identity from the handshake; available once the worker is running
    pub fn identity(&self) -> Option<&WorkerIdentity> {
        self.identity.as_ref()
    }

    /// Launch the worker and block until its handshake completes
    ///
    /// On failure the process is reaped, its captured output is attached to
    /// the error, and the handle ends up `Stopped`.
    pub async fn start(&mut self) -> Result<(), ExecutionError> {
        if self.state != WorkerProcessState::Built {
            return Err(ExecutionError::InvalidState(format!(
                "cannot start worker in state {:?}",
                self.state
            )));
        }
        self.state = WorkerProcessState::Starting;

        let (worker, mut transport) = match self.launcher.launch(&self.config).await {
            Ok(launched) => launched,
            Err(e) => {
                self.state = WorkerProcessState::Stopped;
                return Err(e);
            }
        };

        debug!("waiting for handshake from worker {}", self.config.worker_id);
        let handshake = timeout(self.config.startup_timeout, transport.source.receive()).await;
        let identity = match handshake {
            Err(_) => Err(format!(
                "handshake not received within {:?}",
                self.config.startup_timeout
            )),
            Ok(Err(e)) => Err(format!("handshake failed: {}", e)),
            Ok(Ok(None)) => Err("worker exited before completing handshake".to_string()),
            Ok(Ok(Some(envelope))) => match envelope.message {
                ChannelMessage::Ready { worker_id, pid } => Ok(WorkerIdentity { worker_id, pid }),
                other => Err(format!("unexpected first frame from worker: {:?}", other)),
            },
        };

        match identity {
            Ok(identity) => {
                info!(
                    "worker {} running (pid {})",
                    identity.worker_id, identity.pid
                );
                self.connection = Some(Connection::open(transport));
                self.worker = Some(worker);
                self.identity = Some(identity);
                self.state = WorkerProcessState::Running;
                Ok(())
            }
            Err(reason) => {
                self.state = WorkerProcessState::Stopped;
                Err(start_failure(worker, reason).await)
            }
        }
    }

    /// The worker's channel; valid once the worker is running
    pub fn connection(&self) -> Result<&Connection, ExecutionError> {
        match self.state {
            WorkerProcessState::Built | WorkerProcessState::Starting => {
                Err(ExecutionError::InvalidState(format!(
                    "worker connection unavailable in state {:?}",
                    self.state
                )))
            }
            _ => self.connection.as_ref().ok_or_else(|| {
                ExecutionError::InvalidState("worker connection unavailable".to_string())
            }),
        }
    }

    /// Wait for the worker to exit after a stop has been signalled
    ///
    /// Forcibly terminates the process and reports `WorkerStopTimeout` if it
    /// outlives the configured grace period.
    pub async fn wait_for_stop(&mut self) -> Result<WorkerExit, ExecutionError> {
        match self.state {
            WorkerProcessState::Running | WorkerProcessState::Stopping => {}
            other => {
                return Err(ExecutionError::InvalidState(format!(
                    "cannot wait for stop in state {:?}",
                    other
                )))
            }
        }
        self.state = WorkerProcessState::Stopping;

        let worker = self
            .worker
            .as_mut()
            .ok_or_else(|| ExecutionError::InvalidState("no launched worker".to_string()))?;

        let grace = self.config.stop_grace_period;
        let result = match timeout(grace, worker.wait()).await {
            Ok(Ok(exit)) => {
                if !exit.success() {
                    warn!(
                        "worker {} exited with status {:?}",
                        self.config.worker_id, exit.code
                    );
                }
                Ok(exit)
            }
            Ok(Err(e)) => Err(e),
            Err(_) => {
                warn!(
                    "worker {} did not exit within {:?}, killing it",
                    self.config.worker_id, grace
                );
                let _ = worker.kill().await;
                let _ = timeout(REAP_TIMEOUT, worker.wait()).await;
                Err(ExecutionError::WorkerStopTimeout { timeout: grace })
            }
        };

        self.state = WorkerProcessState::Stopped;
        result
    }
}

async fn start_failure(mut worker: Box<dyn LaunchedWorker>, reason: String) -> ExecutionError {
    let _ = worker.kill().await;
    let exit_code = match timeout(REAP_TIMEOUT, worker.wait()).await {
        Ok(Ok(exit)) => exit.code,
        _ => None,
    };
    let output = worker.diagnostic_output().await;
    ExecutionError::WorkerStartFailure {
        reason,
        exit_code,
        output,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anvil_ipc::MessageEnvelope;
    use std::path::PathBuf;
    use std::time::Duration;
    use tokio::task::JoinHandle;

    use crate::worker::WorkerProcessBuilder;

    fn test_config() -> WorkerProcessConfig {
        WorkerProcessBuilder::new("/usr/bin/anvil-worker")
            .classpath(vec![PathBuf::from("/build/classes")])
            .startup_timeout(Duration::from_millis(200))
            .stop_grace_period(Duration::from_millis(200))
            .build()
            .unwrap()
    }

    struct TaskWorker {
        task: Option<JoinHandle<i32>>,
        exit: Option<WorkerExit>,
    }

    #[async_trait]
    impl LaunchedWorker for TaskWorker {
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
                .ok_or_else(|| ExecutionError::Process("worker task gone".to_string()))?;
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
            "worker stderr".to_string()
        }
    }

    /// Launcher whose worker connects and handshakes, then idles until the
    /// parent closes the channel
    struct HandshakeLauncher;

    #[async_trait]
    impl WorkerLauncher for HandshakeLauncher {
        async fn launch(
            &self,
            config: &WorkerProcessConfig,
        ) -> Result<(Box<dyn LaunchedWorker>, Transport), ExecutionError> {
            let (parent, mut child) = Transport::in_memory_pair();
            let worker_id = config.worker_id.clone();
            let task = tokio::spawn(async move {
                child
                    .sink
                    .send(&MessageEnvelope::new(ChannelMessage::Ready {
                        worker_id,
                        pid: 7,
                    }))
                    .await
                    .ok();
                while let Ok(Some(_)) = child.source.receive().await {}
                0
            });
            Ok((
                Box::new(TaskWorker {
                    task: Some(task),
                    exit: None,
                }),
                parent,
            ))
        }
    }

    /// Launcher whose worker never completes the handshake
    struct SilentLauncher;

    #[async_trait]
    impl WorkerLauncher for SilentLauncher {
        async fn launch(
            &self,
            config: &WorkerProcessConfig,
        ) -> Result<(Box<dyn LaunchedWorker>, Transport), ExecutionError> {
            let _ = config;
            let (parent, mut child) = Transport::in_memory_pair();
            let task = tokio::spawn(async move {
                while let Ok(Some(_)) = child.source.receive().await {}
                0
            });
            Ok((
                Box::new(TaskWorker {
                    task: Some(task),
                    exit: None,
                }),
                parent,
            ))
        }
    }

    /// Launcher whose worker exits immediately without a handshake
    struct EarlyExitLauncher;

    #[async_trait]
    impl WorkerLauncher for EarlyExitLauncher {
        async fn launch(
            &self,
            _config: &WorkerProcessConfig,
        ) -> Result<(Box<dyn LaunchedWorker>, Transport), ExecutionError> {
            let (parent, child) = Transport::in_memory_pair();
            let task = tokio::spawn(async move {
                drop(child);
                3
            });
            Ok((
                Box::new(TaskWorker {
                    task: Some(task),
                    exit: None,
                }),
                parent,
            ))
        }
    }

    #[tokio::test]
    async fn test_start_transitions_to_running() {
        let mut process = WorkerProcess::new(test_config(), Arc::new(HandshakeLauncher));
        assert_eq!(process.state(), WorkerProcessState::Built);
        assert!(process.connection().is_err());

        process.start().await.unwrap();
        assert_eq!(process.state(), WorkerProcessState::Running);
        assert!(process.connection().is_ok());
        assert_eq!(process.identity().unwrap().pid, 7);
    }

    #[tokio::test]
    async fn test_start_twice_rejected() {
        let mut process = WorkerProcess::new(test_config(), Arc::new(HandshakeLauncher));
        process.start().await.unwrap();

        match process.start().await {
            Err(ExecutionError::InvalidState(_)) => {}
            other => panic!("expected InvalidState, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_handshake_timeout_is_start_failure() {
        let mut process = WorkerProcess::new(test_config(), Arc::new(SilentLauncher));

        match process.start().await {
            Err(ExecutionError::WorkerStartFailure { reason, output, .. }) => {
                assert!(reason.contains("handshake not received"));
                assert_eq!(output, "worker stderr");
            }
            other => panic!("expected WorkerStartFailure, got {:?}", other),
        }
        assert_eq!(process.state(), WorkerProcessState::Stopped);
    }

    #[tokio::test]
    async fn test_early_exit_is_start_failure() {
        let mut process = WorkerProcess::new(test_config(), Arc::new(EarlyExitLauncher));

        match process.start().await {
            Err(ExecutionError::WorkerStartFailure {
                reason, exit_code, ..
            }) => {
                assert!(reason.contains("exited before completing handshake"));
                assert_eq!(exit_code, Some(3));
            }
            other => panic!("expected WorkerStartFailure, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_stop_times_out_and_kills() {
        let mut process = WorkerProcess::new(test_config(), Arc::new(HandshakeLauncher));
        process.start().await.unwrap();

        // the fake worker idles until the parent closes the channel, which
        // this test never does, so the grace period must expire
        match process.wait_for_stop().await {
            Err(ExecutionError::WorkerStopTimeout { timeout }) => {
                assert_eq!(timeout, Duration::from_millis(200));
            }
            other => panic!("expected WorkerStopTimeout, got {:?}", other),
        }
        assert_eq!(process.state(), WorkerProcessState::Stopped);
    }

    #[tokio::test]
    async fn test_clean_stop_reports_exit() {
        let mut process = WorkerProcess::new(test_config(), Arc::new(HandshakeLauncher));
        process.start().await.unwrap();

        process.connection().unwrap().close().await.unwrap();
        let exit = process.wait_for_stop().await.unwrap();
        assert_eq!(exit.code, Some(0));
        assert!(exit.success());
    }
}
