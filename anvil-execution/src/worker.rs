//! Worker process configuration and builder

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use uuid::Uuid;

use crate::error::ExecutionError;

/// Environment variable carrying the worker id into the child
pub const WORKER_ID_ENV: &str = "ANVIL_WORKER_ID";
/// Environment variable carrying the application classpath into the child
pub const WORKER_CLASSPATH_ENV: &str = "ANVIL_WORKER_CLASSPATH";
/// Environment variable carrying the isolation flag into the child
pub const WORKER_ISOLATED_ENV: &str = "ANVIL_WORKER_ISOLATED";

const DEFAULT_STARTUP_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_STOP_GRACE_PERIOD: Duration = Duration::from_secs(10);

/// Immutable launch configuration for one worker process
#[derive(Debug, Clone)]
pub struct WorkerProcessConfig {
    /// Worker entry-point executable
    pub program: PathBuf,
    /// Arguments passed to the worker executable
    pub args: Vec<String>,
    /// Application classpath entries handed to the worker
    pub classpath: Vec<PathBuf>,
    /// Extra environment for the worker process
    pub env: HashMap<String, String>,
    /// Working directory for the worker process
    pub working_dir: Option<PathBuf>,
    /// Whether the worker entry loads application code in an isolated
    /// sub-context instead of its primary execution context
    pub isolated: bool,
    /// Stable identifier reported back in the handshake
    pub worker_id: String,
    /// How long `start` waits for the handshake
    pub startup_timeout: Duration,
    /// How long `wait_for_stop` waits before force-killing the worker
    pub stop_grace_period: Duration,
}

/// Builder for [`WorkerProcessConfig`]
///
/// `build` validates the configuration before any process exists; a failed
/// build leaks no resources.
#[derive(Debug, Clone)]
pub struct WorkerProcessBuilder {
    config: WorkerProcessConfig,
}

impl WorkerProcessBuilder {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            config: WorkerProcessConfig {
                program: program.into(),
                args: Vec::new(),
                classpath: Vec::new(),
                env: HashMap::new(),
                working_dir: None,
                isolated: false,
                worker_id: format!("anvil-worker-{}", Uuid::new_v4()),
                startup_timeout: DEFAULT_STARTUP_TIMEOUT,
                stop_grace_period: DEFAULT_STOP_GRACE_PERIOD,
            },
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.config.args.push(arg.into());
        self
    }

    pub fn classpath(mut self, entries: impl IntoIterator<Item = PathBuf>) -> Self {
        self.config.classpath.extend(entries);
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.config.env.insert(key.into(), value.into());
        self
    }

    pub fn working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.working_dir = Some(dir.into());
        self
    }

    pub fn isolated(mut self, isolated: bool) -> Self {
        self.config.isolated = isolated;
        self
    }

    pub fn worker_id(mut self, id: impl Into<String>) -> Self {
        self.config.worker_id = id.into();
        self
    }

    pub fn startup_timeout(mut self, timeout: Duration) -> Self {
        self.config.startup_timeout = timeout;
        self
    }

    pub fn stop_grace_period(mut self, grace: Duration) -> Self {
        self.config.stop_grace_period = grace;
        self
    }

    /// Validate and freeze the configuration
    pub fn build(self) -> Result<WorkerProcessConfig, ExecutionError> {
        let config = self.config;
        if config.program.as_os_str().is_empty() {
            return Err(ExecutionError::Configuration(
                "worker program must not be empty".to_string(),
            ));
        }
        if config.classpath.is_empty() {
            return Err(ExecutionError::Configuration(
                "worker classpath must not be empty".to_string(),
            ));
        }
        if config.worker_id.is_empty() {
            return Err(ExecutionError::Configuration(
                "worker id must not be empty".to_string(),
            ));
        }
        if config.startup_timeout.is_zero() {
            return Err(ExecutionError::Configuration(
                "startup timeout must be positive".to_string(),
            ));
        }
        if config.stop_grace_period.is_zero() {
            return Err(ExecutionError::Configuration(
                "stop grace period must be positive".to_string(),
            ));
        }
        Ok(config)
    }
}

/// Launch surface as seen from inside the worker process
#[derive(Debug, Clone)]
pub struct WorkerEnv {
    pub worker_id: String,
    pub classpath: Vec<PathBuf>,
    pub isolated: bool,
}

impl WorkerEnv {
    /// Read the launch surface from the process environment
    pub fn from_env() -> Self {
        Self {
            worker_id: std::env::var(WORKER_ID_ENV)
                .unwrap_or_else(|_| format!("worker-{}", std::process::id())),
            classpath: std::env::var_os(WORKER_CLASSPATH_ENV)
                .map(|joined| std::env::split_paths(&joined).collect())
                .unwrap_or_default(),
            isolated: std::env::var(WORKER_ISOLATED_ENV)
                .map(|flag| flag == "1")
                .unwrap_or(false),
        }
    }
}
