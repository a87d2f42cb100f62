//! Sandbox lifecycle — one isolated V8 context per execution.
//!
//! A [`Sandbox`] owns its `JsRuntime` and, through it, every handle created
//! while the processor runs. Teardown happens in `Drop`, so it runs exactly
//! once on every path out of [`Sandbox::scoped_run`]: success, script error,
//! setup fault, or panic.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use deno_core::{v8, FastString, JsRuntime, RuntimeOptions};
use tracing::debug;

use super::bridge::{self, ConsoleBridge, ConsoleSink, EncodedInput};
use super::error::{Phase, SandboxError};

/// Global the encoded query results are injected under.
pub const INPUT_GLOBAL: &str = "__attestorInput";

/// Installs `console` on top of the forwarding op, then removes the `Deno`
/// namespace (and the legacy `__bootstrap` one, where present) so the
/// processor sees nothing but what was injected.
const CONSOLE_SHIM: &str = r#"
((ops) => {
  const forward = (...args) => ops.op_attestor_log(args);
  Object.defineProperty(globalThis, "console", {
    value: Object.freeze({
      log: forward,
      info: forward,
      warn: forward,
      error: forward,
      debug: forward,
    }),
    writable: false,
    enumerable: false,
    configurable: false,
  });
})(Deno.core.ops);
delete globalThis.Deno;
delete globalThis.__bootstrap;
"#;

/// Counts sandbox acquisitions and teardowns.
///
/// Clones share the same counters.
#[derive(Debug, Clone, Default)]
pub struct LifecycleProbe {
    counters: Arc<Counters>,
}

#[derive(Debug, Default)]
struct Counters {
    acquired: AtomicUsize,
    torn_down: AtomicUsize,
}

impl LifecycleProbe {
    pub fn acquired(&self) -> usize {
        self.counters.acquired.load(Ordering::SeqCst)
    }

    pub fn torn_down(&self) -> usize {
        self.counters.torn_down.load(Ordering::SeqCst)
    }

    /// Sandboxes acquired but not yet torn down.
    pub fn live(&self) -> usize {
        self.acquired().saturating_sub(self.torn_down())
    }

    fn record_acquire(&self) {
        self.counters.acquired.fetch_add(1, Ordering::SeqCst);
    }

    fn record_teardown(&self) {
        self.counters.torn_down.fetch_add(1, Ordering::SeqCst);
    }
}

/// An isolated interpreter for exactly one processor execution.
pub struct Sandbox {
    runtime: JsRuntime,
    phase: Phase,
    probe: LifecycleProbe,
}

impl Sandbox {
    /// Creates a fresh isolate with only the console op registered.
    pub fn acquire(console: Arc<dyn ConsoleSink>, probe: &LifecycleProbe) -> Result<Self, SandboxError> {
        let runtime = JsRuntime::try_new(RuntimeOptions {
            extensions: vec![bridge::attestor_bridge::init_ops()],
            ..Default::default()
        })
        .map_err(|e| SandboxError::host_fault(Phase::Idle, e))?;

        runtime
            .op_state()
            .borrow_mut()
            .put(ConsoleBridge::new(console));

        probe.record_acquire();
        debug!("Sandbox context acquired");

        Ok(Self {
            runtime,
            phase: Phase::ContextAcquired,
            probe: probe.clone(),
        })
    }

    /// Runs `f` against this sandbox, then tears it down whatever `f` returned.
    ///
    /// Consumes the sandbox: a context is never reused for a second execution.
    pub fn scoped_run<T>(
        mut self,
        f: impl FnOnce(&mut Sandbox) -> Result<T, SandboxError>,
    ) -> Result<T, SandboxError> {
        let result = f(&mut self);
        if let Err(e) = &result {
            debug!("Sandbox run failed in phase {}: {e}", self.phase);
        }
        drop(self);
        result
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub(super) fn set_phase(&mut self, phase: Phase) {
        debug!("Sandbox phase: {} -> {}", self.phase, phase);
        self.phase = phase;
    }

    /// Injects the encoded input and the console capability.
    ///
    /// Both must be in place before the sandbox accepts a unit.
    pub fn prepare(&mut self, input: &EncodedInput) -> Result<(), SandboxError> {
        if self.phase != Phase::ContextAcquired {
            return Err(SandboxError::host_fault(
                self.phase,
                "sandbox already prepared",
            ));
        }
        self.inject_string(INPUT_GLOBAL, input.as_str())?;
        self.install_console()?;
        self.set_phase(Phase::Prepared);
        Ok(())
    }

    /// Records that the executable unit exists. Only a prepared sandbox
    /// accepts one.
    pub fn mark_unit_built(&mut self) -> Result<(), SandboxError> {
        if self.phase != Phase::Prepared {
            return Err(SandboxError::host_fault(
                self.phase,
                "unit built before input injection completed",
            ));
        }
        self.set_phase(Phase::UnitBuilt);
        Ok(())
    }

    /// Sets a string-valued global property through the V8 object API.
    pub fn inject_string(&mut self, name: &str, value: &str) -> Result<(), SandboxError> {
        let phase = self.phase;
        let scope = &mut self.runtime.handle_scope();
        let context = scope.get_current_context();
        let global = context.global(scope);

        let key = v8::String::new(scope, name)
            .ok_or_else(|| SandboxError::host_fault(phase, format!("cannot allocate global name {name}")))?;
        let text = v8::String::new(scope, value).ok_or_else(|| {
            SandboxError::host_fault(
                phase,
                format!("cannot allocate {} bytes of input in the sandbox", value.len()),
            )
        })?;

        match global.set(scope, key.into(), text.into()) {
            Some(true) => Ok(()),
            _ => Err(SandboxError::host_fault(
                phase,
                format!("cannot define global {name}"),
            )),
        }
    }

    fn install_console(&mut self) -> Result<(), SandboxError> {
        let phase = self.phase;
        self.runtime
            .execute_script("[attestor:console]", FastString::from(CONSOLE_SHIM.to_string()))
            .map(drop)
            .map_err(|e| SandboxError::host_fault(phase, format!("console setup failed: {e}")))
    }

    pub(super) fn runtime(&mut self) -> &mut JsRuntime {
        &mut self.runtime
    }
}

impl Drop for Sandbox {
    fn drop(&mut self) {
        self.phase = Phase::TornDown;
        self.probe.record_teardown();
        debug!("Sandbox context torn down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::bridge::{serialize, RecordingConsole};

    fn console() -> Arc<dyn ConsoleSink> {
        Arc::new(RecordingConsole::default())
    }

    #[test]
    fn test_acquire_and_drop_balance() {
        let probe = LifecycleProbe::default();
        let sandbox = Sandbox::acquire(console(), &probe).unwrap();
        assert_eq!(sandbox.phase(), Phase::ContextAcquired);
        assert_eq!(probe.live(), 1);
        drop(sandbox);
        assert_eq!(probe.acquired(), 1);
        assert_eq!(probe.torn_down(), 1);
    }

    #[test]
    fn test_scoped_run_tears_down_on_success() {
        let probe = LifecycleProbe::default();
        let sandbox = Sandbox::acquire(console(), &probe).unwrap();
        let value = sandbox.scoped_run(|_| Ok(42)).unwrap();
        assert_eq!(value, 42);
        assert_eq!(probe.live(), 0);
    }

    #[test]
    fn test_scoped_run_tears_down_after_partial_injection() {
        let probe = LifecycleProbe::default();
        let sandbox = Sandbox::acquire(console(), &probe).unwrap();
        let result: Result<(), _> = sandbox.scoped_run(|sandbox| {
            sandbox.inject_string(INPUT_GLOBAL, "[]")?;
            Err(SandboxError::host_fault(sandbox.phase(), "second injection failed"))
        });
        assert_eq!(result.unwrap_err().category(), "HostFault");
        assert_eq!(probe.acquired(), 1);
        assert_eq!(probe.torn_down(), 1);
    }

    #[test]
    fn test_scoped_run_tears_down_on_panic() {
        let probe = LifecycleProbe::default();
        let observed = probe.clone();
        let outcome = std::panic::catch_unwind(move || {
            let sandbox = Sandbox::acquire(console(), &probe).unwrap();
            let _: Result<(), SandboxError> = sandbox.scoped_run(|_| panic!("host bug"));
        });
        assert!(outcome.is_err());
        assert_eq!(observed.acquired(), 1);
        assert_eq!(observed.torn_down(), 1);
    }

    #[test]
    fn test_prepare_twice_is_a_host_fault() {
        let probe = LifecycleProbe::default();
        let input = serialize(&Vec::<serde_json::Value>::new()).unwrap();
        let sandbox = Sandbox::acquire(console(), &probe).unwrap();
        let result = sandbox.scoped_run(|sandbox| {
            sandbox.prepare(&input)?;
            assert_eq!(sandbox.phase(), Phase::Prepared);
            sandbox.prepare(&input)
        });
        assert!(matches!(
            result,
            Err(SandboxError::HostFault { phase: Phase::Prepared, .. })
        ));
        assert_eq!(probe.live(), 0);
    }

    #[test]
    fn test_unit_built_only_after_prepare() {
        let probe = LifecycleProbe::default();
        let input = serialize(&Vec::<serde_json::Value>::new()).unwrap();
        let sandbox = Sandbox::acquire(console(), &probe).unwrap();
        let result = sandbox.scoped_run(|sandbox| {
            assert!(matches!(
                sandbox.mark_unit_built(),
                Err(SandboxError::HostFault { phase: Phase::ContextAcquired, .. })
            ));
            sandbox.prepare(&input)?;
            sandbox.mark_unit_built()?;
            Ok(sandbox.phase())
        });
        assert_eq!(result.unwrap(), Phase::UnitBuilt);
        assert_eq!(probe.live(), 0);
    }
}
