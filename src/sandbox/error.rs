//! Error taxonomy of the processor sandbox.
//!
//! Every failure leaving the engine is one of three kinds: the input could
//! not be encoded, the user script failed, or the sandbox itself broke.
//! None of them are retried.

use std::fmt;

use thiserror::Error;

/// Position of one execution in the sandbox state machine.
///
/// `Idle → ContextAcquired → UnitBuilt → Evaluating → {ValueReady | ErrorCaught} → TornDown`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    ContextAcquired,
    /// Input and console are injected; the sandbox accepts a unit.
    Prepared,
    UnitBuilt,
    Evaluating,
    ValueReady,
    ErrorCaught,
    TornDown,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::Idle => "idle",
            Phase::ContextAcquired => "context acquisition",
            Phase::Prepared => "input injection",
            Phase::UnitBuilt => "unit construction",
            Phase::Evaluating => "evaluation",
            Phase::ValueReady => "value extraction",
            Phase::ErrorCaught => "error extraction",
            Phase::TornDown => "teardown",
        };
        f.write_str(name)
    }
}

/// How a user script failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScriptErrorKind {
    /// The script threw (or returned a rejected promise).
    Exception,
    /// The wrapped unit did not parse.
    Syntax,
    /// The wall-clock watchdog stopped the script.
    Terminated,
    /// The script returned a promise that never settled.
    Unsettled,
}

/// Diagnostic extracted from the sandbox when a script fails.
#[derive(Debug, Clone, PartialEq)]
pub struct ScriptDiagnostic {
    pub kind: ScriptErrorKind,
    /// Error constructor name, e.g. `"TypeError"`. `"Error"` for non-error throws.
    pub name: String,
    pub message: String,
    pub stack: Option<String>,
}

impl fmt::Display for ScriptDiagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.name, self.message)
    }
}

#[derive(Debug, Error)]
pub enum SandboxError {
    /// The query results could not be encoded. Raised before any
    /// sandbox resource is allocated.
    #[error("cannot encode query results for the sandbox: {0}")]
    Serialization(#[source] serde_json::Error),

    /// The user script threw, failed to parse, or was stopped.
    #[error("{0}")]
    Script(ScriptDiagnostic),

    /// Sandbox setup, injection, or teardown failed.
    #[error("sandbox fault during {phase}: {message}")]
    HostFault { phase: Phase, message: String },
}

impl SandboxError {
    pub fn host_fault(phase: Phase, message: impl fmt::Display) -> Self {
        SandboxError::HostFault {
            phase,
            message: message.to_string(),
        }
    }

    /// Short category name shown to users ahead of the message.
    pub fn category(&self) -> &'static str {
        match self {
            SandboxError::Serialization(_) => "SerializationError",
            SandboxError::Script(_) => "ScriptError",
            SandboxError::HostFault { .. } => "HostFault",
        }
    }

    /// Extra diagnostic text for verbose output (the script's stack trace).
    pub fn detail(&self) -> Option<&str> {
        match self {
            SandboxError::Script(diagnostic) => diagnostic.stack.as_deref(),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_categories() {
        let ser = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
        assert_eq!(SandboxError::Serialization(ser).category(), "SerializationError");
        assert_eq!(
            SandboxError::host_fault(Phase::ContextAcquired, "boom").category(),
            "HostFault"
        );
    }

    #[test]
    fn test_script_error_display_uses_name_and_message() {
        let err = SandboxError::Script(ScriptDiagnostic {
            kind: ScriptErrorKind::Exception,
            name: "TypeError".to_string(),
            message: "x is not a function".to_string(),
            stack: Some("TypeError: x is not a function\n    at main".to_string()),
        });
        assert_eq!(err.to_string(), "TypeError: x is not a function");
        assert!(err.detail().unwrap().contains("at main"));
    }

    #[test]
    fn test_host_fault_names_phase() {
        let err = SandboxError::host_fault(Phase::Prepared, "string too long");
        assert_eq!(
            err.to_string(),
            "sandbox fault during input injection: string too long"
        );
        assert!(err.detail().is_none());
    }
}
