//! Out-of-process worker execution
//!
//! Runs caller-defined work units in forked worker processes, with results
//! streamed back asynchronously over an [`anvil_ipc`] channel. The parent
//! side revolves around [`ForkingProcessor`], which forks one worker lazily
//! on the first submitted unit; the worker side revolves around
//! [`WorkerEntry`] and the [`harness`] request loop.

pub mod error;
pub mod harness;
pub mod local;
pub mod process;
pub mod processor;
pub mod remote;
pub mod unit;
pub mod worker;

pub use error::ExecutionError;
pub use harness::{run_worker, run_worker_stdio, ResultPublisher, WorkerEntry};
pub use local::InProcessLauncher;
pub use process::{
    LaunchedWorker, OsProcessLauncher, WorkerExit, WorkerLauncher, WorkerProcess,
    WorkerProcessState,
};
pub use processor::{ForkingProcessor, ProcessorState};
pub use remote::{RemoteWorkProcessor, ResultSinkBinding};
pub use unit::{ResultEvent, ResultSink, UnitOutcome, WorkUnit};
pub use worker::{WorkerEnv, WorkerProcessBuilder, WorkerProcessConfig};
