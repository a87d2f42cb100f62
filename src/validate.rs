//! Output validation against a recipe's JSON Schema.
//!
//! The processor result is checked exactly as the sandbox returned it;
//! nothing is coerced or reparsed.

use anyhow::{anyhow, bail, Result};
use jsonschema::JSONSchema;
use serde_json::Value;
use tracing::{debug, error};

pub struct OutputValidator {
    schema: Option<JSONSchema>,
}

impl OutputValidator {
    /// Compiles `schema`. `None` accepts every result.
    pub fn new(schema: Option<&Value>) -> Result<Self> {
        let schema = match schema {
            Some(schema) => Some(
                JSONSchema::compile(schema).map_err(|e| anyhow!("invalid output schema: {e}"))?,
            ),
            None => None,
        };
        Ok(Self { schema })
    }

    pub fn validate(&self, output: &Value) -> Result<()> {
        let Some(schema) = &self.schema else {
            debug!("No output schema, accepting result as is");
            return Ok(());
        };

        if let Err(errors) = schema.validate(output) {
            let messages: Vec<String> = errors
                .map(|e| {
                    let path = e.instance_path.to_string();
                    if path.is_empty() {
                        e.to_string()
                    } else {
                        format!("{path}: {e}")
                    }
                })
                .collect();
            error!("Processor output failed validation ({} errors)", messages.len());
            debug!(
                "Rejected output: {}",
                serde_json::to_string_pretty(output).unwrap_or_default()
            );
            bail!("output does not match schema: {}", messages.join("; "));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn schema() -> Value {
        json!({
            "type": "object",
            "required": ["address", "volume"],
            "properties": {
                "address": {"type": "string"},
                "volume": {"type": "number", "minimum": 0}
            }
        })
    }

    #[test]
    fn test_no_schema_accepts_anything() {
        let validator = OutputValidator::new(None).unwrap();
        assert!(validator.validate(&json!("whatever")).is_ok());
        assert!(validator.validate(&Value::Null).is_ok());
    }

    #[test]
    fn test_matching_output() {
        let schema = schema();
        let validator = OutputValidator::new(Some(&schema)).unwrap();
        assert!(validator
            .validate(&json!({"address": "0xabc", "volume": 12.5}))
            .is_ok());
    }

    #[test]
    fn test_reports_every_violation() {
        let schema = schema();
        let validator = OutputValidator::new(Some(&schema)).unwrap();
        let err = validator
            .validate(&json!({"address": 7, "volume": -1}))
            .unwrap_err()
            .to_string();
        assert!(err.starts_with("output does not match schema: "));
        assert!(err.contains("/address"));
        assert!(err.contains("/volume"));
    }

    #[test]
    fn test_missing_required_property() {
        let schema = schema();
        let validator = OutputValidator::new(Some(&schema)).unwrap();
        let err = validator.validate(&json!({"address": "0xabc"})).unwrap_err();
        assert!(err.to_string().contains("volume"));
    }

    #[test]
    fn test_invalid_schema_is_rejected() {
        let schema = json!({"type": "not-a-type"});
        assert!(OutputValidator::new(Some(&schema)).is_err());
    }

    #[test]
    fn test_string_output_is_not_reparsed() {
        let schema = json!({"type": "object"});
        let validator = OutputValidator::new(Some(&schema)).unwrap();
        assert!(validator.validate(&json!("{\"a\": 1}")).is_err());
    }
}
