//! Typed bindings for the work-dispatch and result-reporting interfaces
//!
//! The channel carries untyped `(interface, method, payload)` frames; this
//! module pins down the two interfaces the forking processor uses and the
//! dispatch tables that encode and decode them. Work requests flow parent to
//! worker; result events flow worker to parent. Neither direction waits for
//! the other.

use std::sync::Arc;

use serde_json::Value as JsonValue;

use anvil_ipc::{ChannelError, InboundHandler, InterfaceId, OutgoingProxy};

use crate::unit::{ResultEvent, ResultSink, WorkUnit};

/// Interface id for work dispatch (parent to worker)
pub fn work_processor_interface() -> InterfaceId {
    InterfaceId::new("anvil.WorkUnitProcessor")
}

/// Interface id for result reporting (worker to parent)
pub fn result_sink_interface() -> InterfaceId {
    InterfaceId::new("anvil.ResultSink")
}

/// Method names carried in `Call` frames
pub mod methods {
    pub const BEGIN_PROCESSING: &str = "begin_processing";
    pub const PROCESS: &str = "process";
    pub const STOP: &str = "stop";
    pub const EVENT: &str = "event";
}

/// One decoded request on the work-dispatch interface
#[derive(Debug, Clone)]
pub enum WorkRequest {
    BeginProcessing,
    Process { unit: WorkUnit },
    Stop,
}

/// Decode an inbound call on the work-dispatch interface
pub fn decode_work_request(method: &str, payload: JsonValue) -> anyhow::Result<WorkRequest> {
    match method {
        methods::BEGIN_PROCESSING => Ok(WorkRequest::BeginProcessing),
        methods::PROCESS => Ok(WorkRequest::Process {
            unit: serde_json::from_value(payload)?,
        }),
        methods::STOP => Ok(WorkRequest::Stop),
        other => anyhow::bail!("unknown method {} on work-dispatch interface", other),
    }
}

/// Outgoing proxy for the work-dispatch interface (parent side)
///
/// All calls are fire-and-forget; results come back through the separately
/// bound result-reporting interface.
pub struct RemoteWorkProcessor {
    proxy: OutgoingProxy,
}

impl RemoteWorkProcessor {
    pub fn new(proxy: OutgoingProxy) -> Self {
        Self { proxy }
    }

    /// Tell the worker to get ready to accept work units
    pub async fn begin_processing(&self) -> Result<(), ChannelError> {
        self.proxy.invoke(methods::BEGIN_PROCESSING, &()).await
    }

    /// Forward one work unit to the worker
    pub async fn process(&self, unit: &WorkUnit) -> Result<(), ChannelError> {
        self.proxy.invoke(methods::PROCESS, unit).await
    }

    /// Ask the worker to finish in-flight work, flush pending events and exit
    pub async fn stop(&self) -> Result<(), ChannelError> {
        self.proxy.invoke(methods::STOP, &()).await
    }
}

/// Incoming binding adapter that decodes result events and feeds the
/// caller's sink (parent side)
pub struct ResultSinkBinding {
    sink: Arc<dyn ResultSink>,
}

impl ResultSinkBinding {
    pub fn new(sink: Arc<dyn ResultSink>) -> Arc<Self> {
        Arc::new(Self { sink })
    }
}

impl InboundHandler for ResultSinkBinding {
    fn handle(&self, method: &str, payload: JsonValue) -> anyhow::Result<()> {
        match method {
            methods::EVENT => {
                let event: ResultEvent = serde_json::from_value(payload)?;
                self.sink.on_event(event)
            }
            other => anyhow::bail!("unknown method {} on result-reporting interface", other),
        }
    }

    fn disconnected(&self) {
        self.sink.on_disconnect();
    }
}
