//! Script wrapper — turns a processor body into an executable unit.
//!
//! Purely textual: the body is not parsed here. Syntax errors surface when
//! the unit is evaluated.

use std::fmt;

use super::lifecycle::INPUT_GLOBAL;

/// Name the processor reads its query results from.
pub const DATA_BINDING: &str = "queryResult";

/// Zero-argument function the processor body becomes.
pub const ENTRY_POINT: &str = "main";

/// User-authored processor source, read once per execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawScript(String);

impl RawScript {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for RawScript {
    fn from(source: String) -> Self {
        Self(source)
    }
}

impl From<&str> for RawScript {
    fn from(source: &str) -> Self {
        Self(source.to_string())
    }
}

/// Complete program ready for evaluation. Its completion value is the
/// processor's return value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutableUnit(String);

impl ExecutableUnit {
    pub fn source(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ExecutableUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

pub fn wrap(script: &RawScript) -> ExecutableUnit {
    ExecutableUnit(format!(
        "const {DATA_BINDING} = JSON.parse(globalThis.{INPUT_GLOBAL});\n\
         delete globalThis.{INPUT_GLOBAL};\n\
         function {ENTRY_POINT}() {{\n\
         {body}\n\
         }}\n\
         {ENTRY_POINT}();\n",
        body = script.as_str(),
    ))
}
