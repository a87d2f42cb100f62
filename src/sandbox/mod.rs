//! Processor sandbox — runs recipe processors against query results.
//!
//! Each execution gets its own V8 isolate with a minimal global
//! environment: the decoded query results (`queryResult`) and a `console`
//! that forwards to the host. Nothing else from the host is reachable.
//!
//! The pieces, leaf first:
//!
//! 1. [`bridge`] — encodes input, decodes values, forwards console calls
//! 2. [`lifecycle`] — acquires the isolate and guarantees its teardown
//! 3. [`wrapper`] — turns the processor body into an executable unit
//! 4. [`classify`] — evaluates the unit and classifies the outcome
//!
//! There is no CPU or memory quota. The optional wall-clock limit
//! (`[sandbox] timeout_ms`) is the only guard against processors that
//! never return.

pub mod bridge;
pub mod classify;
pub mod error;
pub mod lifecycle;
pub mod wrapper;

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde_json::Value;
use tracing::debug;

use crate::config::{ConsoleTarget, SandboxConfig};

pub use bridge::{ConsoleSink, StdoutConsole, TracingConsole};
pub use classify::ExecutionOutcome;
pub use error::SandboxError;
pub use lifecycle::{LifecycleProbe, Sandbox};
pub use wrapper::RawScript;

/// Ordered results of a recipe's queries, one element per query.
pub type QueryResultSet = Vec<Value>;

/// Runs processors, one disposable sandbox per call.
///
/// Cheap to clone; clones share the console sink and lifecycle probe.
#[derive(Clone)]
pub struct ProcessorEngine {
    limit: Option<Duration>,
    console: Arc<dyn ConsoleSink>,
    probe: LifecycleProbe,
}

impl ProcessorEngine {
    pub fn new(config: &SandboxConfig) -> Self {
        let console: Arc<dyn ConsoleSink> = match config.console {
            ConsoleTarget::Stdout => Arc::new(StdoutConsole),
            ConsoleTarget::Log => Arc::new(TracingConsole),
        };
        Self {
            limit: config.timeout_ms.map(Duration::from_millis),
            console,
            probe: LifecycleProbe::default(),
        }
    }

    /// Replaces the sink receiving processor console output.
    pub fn with_console(mut self, console: Arc<dyn ConsoleSink>) -> Self {
        self.console = console;
        self
    }

    pub fn probe(&self) -> &LifecycleProbe {
        &self.probe
    }

    /// Runs `script` against `data` and returns the classified outcome.
    ///
    /// Script failures are an `Ok(ExecutionOutcome::ScriptError)`; `Err` is
    /// reserved for encoding failures and sandbox faults.
    pub fn evaluate<T>(&self, script: &RawScript, data: &T) -> Result<ExecutionOutcome, SandboxError>
    where
        T: Serialize + ?Sized,
    {
        let input = bridge::serialize(data)?;
        debug!("Encoded {} bytes of query results", input.as_str().len());

        let sandbox = Sandbox::acquire(self.console.clone(), &self.probe)?;
        sandbox.scoped_run(|sandbox| {
            sandbox.prepare(&input)?;
            let unit = wrapper::wrap(script);
            sandbox.mark_unit_built()?;
            classify::run(sandbox, &unit, self.limit)
        })
    }

    /// Runs `script` against `data`, folding script failures into
    /// [`SandboxError::Script`].
    pub fn execute<T>(&self, script: &RawScript, data: &T) -> Result<Value, SandboxError>
    where
        T: Serialize + ?Sized,
    {
        match self.evaluate(script, data)? {
            ExecutionOutcome::Value(value) => Ok(value),
            ExecutionOutcome::ScriptError(diagnostic) => Err(SandboxError::Script(diagnostic)),
        }
    }
}
