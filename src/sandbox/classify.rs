//! Execution and result classification.
//!
//! Evaluates a wrapped unit and decides, once, whether the processor
//! produced a value or an error. Callers only ever see the resulting
//! [`ExecutionOutcome`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use deno_core::error::JsError;
use deno_core::{v8, FastString};
use serde_json::Value;
use tracing::{debug, warn};

use super::bridge;
use super::error::{Phase, SandboxError, ScriptDiagnostic, ScriptErrorKind};
use super::lifecycle::Sandbox;
use super::wrapper::ExecutableUnit;

/// Script name shown in processor stack traces.
const UNIT_NAME: &str = "processor.js";

/// Result of one processor execution.
#[derive(Debug, Clone, PartialEq)]
pub enum ExecutionOutcome {
    Value(Value),
    ScriptError(ScriptDiagnostic),
}

/// Evaluates `unit` in a sandbox whose unit has been built.
///
/// With `limit` set, a watchdog terminates the isolate once the wall-clock
/// budget is spent. It stays armed until the outcome is decoded: promise
/// callbacks and `toJSON` methods run after the unit itself returns.
pub fn run(
    sandbox: &mut Sandbox,
    unit: &ExecutableUnit,
    limit: Option<Duration>,
) -> Result<ExecutionOutcome, SandboxError> {
    if sandbox.phase() != Phase::UnitBuilt {
        return Err(SandboxError::host_fault(
            sandbox.phase(),
            "evaluation requested before the unit was built",
        ));
    }
    sandbox.set_phase(Phase::Evaluating);

    let watchdog = limit.map(|limit| Watchdog::arm(sandbox, limit));
    let settled = evaluate(sandbox, unit);
    let fired = watchdog.map(Watchdog::disarm).unwrap_or(false);

    let outcome = classify(settled, fired, limit)?;
    match &outcome {
        ExecutionOutcome::Value(_) => sandbox.set_phase(Phase::ValueReady),
        ExecutionOutcome::ScriptError(diagnostic) => {
            if diagnostic.kind == ScriptErrorKind::Terminated {
                warn!("Processor exceeded its time limit and was terminated");
            } else {
                debug!("Processor failed: {diagnostic}");
            }
            sandbox.set_phase(Phase::ErrorCaught);
        }
    }
    Ok(outcome)
}

/// Outcome of evaluation and decoding, before the watchdog is consulted.
#[derive(Debug)]
struct Settled {
    outcome: ExecutionOutcome,
    /// Nothing indicates the run was cut short: the unit returned, any
    /// promise settled, and the value decoded without falling back to its
    /// string form.
    intact: bool,
}

impl Settled {
    fn intact(outcome: ExecutionOutcome) -> Self {
        Self { outcome, intact: true }
    }

    fn cut_short(outcome: ExecutionOutcome) -> Self {
        Self { outcome, intact: false }
    }
}

/// Decides the outcome once. A fired watchdog only wins over a run it
/// could actually have interrupted.
fn classify(
    settled: Result<Settled, SandboxError>,
    fired: bool,
    limit: Option<Duration>,
) -> Result<ExecutionOutcome, SandboxError> {
    let interrupted = match &settled {
        Ok(settled) => !settled.intact,
        Err(_) => true,
    };
    if fired && interrupted {
        return Ok(ExecutionOutcome::ScriptError(terminated(limit)));
    }
    settled.map(|settled| settled.outcome)
}

fn evaluate(sandbox: &mut Sandbox, unit: &ExecutableUnit) -> Result<Settled, SandboxError> {
    let evaluated = sandbox
        .runtime()
        .execute_script(UNIT_NAME, FastString::from(unit.source().to_string()));

    match evaluated {
        Ok(result) => {
            let settled = settle(sandbox, &result);
            // Persistent result handle released before the outcome leaves.
            drop(result);
            Ok(settled)
        }
        Err(error) => match error.downcast_ref::<JsError>() {
            Some(js_error) => Ok(Settled::cut_short(ExecutionOutcome::ScriptError(
                diagnostic(js_error),
            ))),
            None => Err(SandboxError::host_fault(Phase::Evaluating, error)),
        },
    }
}

/// Decodes the completion value, resolving a returned promise if it
/// settles once pending microtasks have run.
fn settle(sandbox: &mut Sandbox, result: &v8::Global<v8::Value>) -> Settled {
    let scope = &mut sandbox.runtime().handle_scope();
    let value = v8::Local::new(scope, result);

    let Ok(promise) = v8::Local::<v8::Promise>::try_from(value) else {
        return decoded(scope, value);
    };

    scope.perform_microtask_checkpoint();
    match promise.state() {
        v8::PromiseState::Fulfilled => {
            let fulfilled = promise.result(scope);
            decoded(scope, fulfilled)
        }
        v8::PromiseState::Rejected => {
            let reason = promise.result(scope);
            let js_error = JsError::from_v8_exception(scope, reason);
            Settled::intact(ExecutionOutcome::ScriptError(diagnostic(&js_error)))
        }
        v8::PromiseState::Pending => Settled::cut_short(ExecutionOutcome::ScriptError(ScriptDiagnostic {
            kind: ScriptErrorKind::Unsettled,
            name: "Error".to_string(),
            message: "processor returned a promise that never settled".to_string(),
            stack: None,
        })),
    }
}

fn decoded(scope: &mut v8::HandleScope, value: v8::Local<v8::Value>) -> Settled {
    match bridge::decode_json(scope, value) {
        Some(json) => Settled::intact(ExecutionOutcome::Value(json)),
        None => Settled::cut_short(ExecutionOutcome::Value(bridge::decode_lossy(scope, value))),
    }
}

fn diagnostic(error: &JsError) -> ScriptDiagnostic {
    let name = error.name.clone().unwrap_or_else(|| "Error".to_string());
    let kind = if name == "SyntaxError" {
        ScriptErrorKind::Syntax
    } else {
        ScriptErrorKind::Exception
    };
    let message = error
        .message
        .clone()
        .unwrap_or_else(|| error.exception_message.clone());

    ScriptDiagnostic {
        kind,
        name,
        message,
        stack: error.stack.clone(),
    }
}

fn terminated(limit: Option<Duration>) -> ScriptDiagnostic {
    let millis = limit.map(|l| l.as_millis()).unwrap_or_default();
    ScriptDiagnostic {
        kind: ScriptErrorKind::Terminated,
        name: "TimeoutError".to_string(),
        message: format!("processor did not finish within {millis} ms"),
        stack: None,
    }
}

// ── Watchdog ─────────────────────────────────────────────

/// Terminates the isolate from another thread once `limit` elapses.
struct Watchdog {
    cancel: mpsc::Sender<()>,
    thread: JoinHandle<()>,
    fired: Arc<AtomicBool>,
}

impl Watchdog {
    fn arm(sandbox: &mut Sandbox, limit: Duration) -> Self {
        let isolate = sandbox.runtime().v8_isolate().thread_safe_handle();
        let (cancel, cancelled) = mpsc::channel::<()>();
        let fired = Arc::new(AtomicBool::new(false));
        let flag = fired.clone();

        let thread = std::thread::spawn(move || {
            if let Err(RecvTimeoutError::Timeout) = cancelled.recv_timeout(limit) {
                flag.store(true, Ordering::SeqCst);
                isolate.terminate_execution();
            }
        });

        Self {
            cancel,
            thread,
            fired,
        }
    }

    /// Stops the watchdog and reports whether it terminated the script.
    fn disarm(self) -> bool {
        let _ = self.cancel.send(());
        let _ = self.thread.join();
        self.fired.load(Ordering::SeqCst)
    }
}
