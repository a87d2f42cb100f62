//! Host bridge — moves data across the host/sandbox boundary.
//!
//! The two sides share no memory. Input goes in as one JSON string that the
//! processor parses with its own `JSON.parse`; values come back out through
//! the sandbox's `JSON.stringify` and `serde_json`. Console calls made by the
//! processor are forwarded to a host [`ConsoleSink`].

use std::cell::RefCell;
use std::rc::Rc;
use std::sync::Arc;
#[cfg(test)]
use std::sync::Mutex;

use deno_core::{op2, v8, OpState};
use serde::Serialize;
use serde_json::Value;
use tracing::info;

use super::error::SandboxError;

/// Query results encoded for the sandbox (a JSON document).
#[derive(Debug, Clone, PartialEq)]
pub struct EncodedInput(String);

impl EncodedInput {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Encodes host data for the sandbox.
///
/// Runs before any sandbox resource exists, so a failure here never
/// needs a teardown.
pub fn serialize<T: Serialize + ?Sized>(data: &T) -> Result<EncodedInput, SandboxError> {
    serde_json::to_string(data)
        .map(EncodedInput)
        .map_err(SandboxError::Serialization)
}

/// Extracts a sandbox value as a host JSON value.
///
/// Never raises inside the sandbox: values `JSON.stringify` cannot handle
/// (functions, symbols, BigInt, cyclic objects) come back as their string
/// form. `undefined` maps to `null`.
pub fn decode(scope: &mut v8::HandleScope, value: v8::Local<v8::Value>) -> Value {
    match decode_json(scope, value) {
        Some(json) => json,
        None => decode_lossy(scope, value),
    }
}

/// Structural decoding through the sandbox's `JSON.stringify`.
///
/// `None` when the value has no JSON form or stringifying it was cut
/// short. Lone surrogates in strings become U+FFFD.
pub fn decode_json(scope: &mut v8::HandleScope, value: v8::Local<v8::Value>) -> Option<Value> {
    if value.is_null_or_undefined() {
        return Some(Value::Null);
    }
    if value.is_function() || value.is_symbol() {
        return None;
    }

    let tc = &mut v8::TryCatch::new(scope);
    let text = v8::json::stringify(tc, value).map(|text| text.to_rust_string_lossy(tc));
    tc.reset();
    let text = text?;

    serde_json::from_str(&text)
        .or_else(|_| serde_json::from_str(&replace_lone_surrogates(&text)))
        .ok()
}

/// String form of a value, for values without a JSON form.
pub fn decode_lossy(scope: &mut v8::HandleScope, value: v8::Local<v8::Value>) -> Value {
    let tc = &mut v8::TryCatch::new(scope);
    let text = value.to_rust_string_lossy(tc);
    tc.reset();
    if text.is_empty() && !value.is_string() {
        Value::String("[unrepresentable value]".to_string())
    } else {
        Value::String(text)
    }
}

/// Rewrites `\uD800`..`\uDFFF` escapes that are not half of a surrogate
/// pair to `\ufffd`. `JSON.stringify` escapes lone surrogates this way and
/// `serde_json` refuses them.
fn replace_lone_surrogates(json: &str) -> String {
    let mut out = String::with_capacity(json.len());
    let mut rest = json;
    while let Some(pos) = rest.find('\\') {
        out.push_str(&rest[..pos]);
        rest = &rest[pos..];
        match surrogate_escape(rest) {
            Some(0xD800..=0xDBFF)
                if matches!(surrogate_escape(&rest[6..]), Some(0xDC00..=0xDFFF)) =>
            {
                out.push_str(&rest[..12]);
                rest = &rest[12..];
            }
            Some(_) => {
                out.push_str("\\ufffd");
                rest = &rest[6..];
            }
            None => {
                // Any other escape, copied with the character it escapes.
                let len = rest[1..].chars().next().map_or(1, |c| 1 + c.len_utf8());
                out.push_str(&rest[..len]);
                rest = &rest[len..];
            }
        }
    }
    out.push_str(rest);
    out
}

/// The code unit of a `\uXXXX` escape at the start of `text`, if it is a
/// surrogate.
fn surrogate_escape(text: &str) -> Option<u16> {
    let hex = text.strip_prefix("\\u")?.get(..4)?;
    let unit = u16::from_str_radix(hex, 16).ok()?;
    (0xD800..=0xDFFF).contains(&unit).then_some(unit)
}

/// Display form of one console argument: strings verbatim, anything else
/// as compact JSON.
pub fn display(scope: &mut v8::HandleScope, value: v8::Local<v8::Value>) -> String {
    if value.is_undefined() {
        return "undefined".to_string();
    }
    match decode(scope, value) {
        Value::String(s) => s,
        other => other.to_string(),
    }
}

// ── Console forwarding ───────────────────────────────────

/// Receiver of console calls made inside the sandbox.
///
/// Called synchronously, once per call, with every argument already
/// converted to display text.
pub trait ConsoleSink: Send + Sync {
    fn log(&self, args: &[String]);
}

/// Writes each console call as one line on standard output.
pub struct StdoutConsole;

impl ConsoleSink for StdoutConsole {
    fn log(&self, args: &[String]) {
        println!("{}", args.join(" "));
    }
}

/// Emits each console call as a tracing event.
pub struct TracingConsole;

impl ConsoleSink for TracingConsole {
    fn log(&self, args: &[String]) {
        info!(target: "attestor::processor", "{}", args.join(" "));
    }
}

/// Keeps every console call in memory.
#[cfg(test)]
#[derive(Default)]
pub struct RecordingConsole {
    calls: Mutex<Vec<Vec<String>>>,
}

#[cfg(test)]
impl RecordingConsole {
    pub fn calls(&self) -> Vec<Vec<String>> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }
}

#[cfg(test)]
impl ConsoleSink for RecordingConsole {
    fn log(&self, args: &[String]) {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(args.to_vec());
        }
    }
}

/// Op state slot holding the sink of the current sandbox.
pub(super) struct ConsoleBridge {
    sink: Arc<dyn ConsoleSink>,
}

impl ConsoleBridge {
    pub(super) fn new(sink: Arc<dyn ConsoleSink>) -> Self {
        Self { sink }
    }
}

/// Receives the argument array of one `console.*` call.
///
/// Rendering an argument can run processor code (`toJSON`), which may log
/// again; the op state is only borrowed once every argument is rendered.
#[op2]
fn op_attestor_log(
    state: Rc<RefCell<OpState>>,
    scope: &mut v8::HandleScope,
    args: v8::Local<v8::Value>,
) {
    let Ok(args) = v8::Local::<v8::Array>::try_from(args) else {
        return;
    };

    let mut line = Vec::with_capacity(args.length() as usize);
    for index in 0..args.length() {
        match args.get_index(scope, index) {
            Some(arg) => line.push(display(scope, arg)),
            None => line.push("undefined".to_string()),
        }
    }

    let sink = state
        .borrow()
        .try_borrow::<ConsoleBridge>()
        .map(|bridge| bridge.sink.clone());
    if let Some(sink) = sink {
        sink.log(&line);
    }
}

deno_core::extension!(attestor_bridge, ops = [op_attestor_log]);

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::BTreeMap;

    #[test]
    fn test_serialize_query_results() {
        let encoded = serialize(&vec![json!({"a": 1}), json!({"b": [true, null]})]).unwrap();
        assert_eq!(encoded.as_str(), r#"[{"a":1},{"b":[true,null]}]"#);
    }

    #[test]
    fn test_serialize_rejects_non_string_keys() {
        let mut data = BTreeMap::new();
        data.insert(vec![1u8, 2], "value");
        let err = serialize(&data).unwrap_err();
        assert_eq!(err.category(), "SerializationError");
    }

    #[test]
    fn test_lone_surrogates_replaced() {
        assert_eq!(
            replace_lone_surrogates(r#"{"s":"\ud800","t":"a\udc00b"}"#),
            r#"{"s":"\ufffd","t":"a\ufffdb"}"#
        );
        assert_eq!(replace_lone_surrogates(r#""\ud83dx""#), r#""\ufffdx""#);
    }

    #[test]
    fn test_surrogate_pairs_and_escaped_backslashes_kept() {
        let pair = r#""\ud83d\udc22""#;
        assert_eq!(replace_lone_surrogates(pair), pair);
        let literal = r#""\\ud800 \n \"""#;
        assert_eq!(replace_lone_surrogates(literal), literal);
        let value: Value =
            serde_json::from_str(&replace_lone_surrogates(r#"{"s":"\ud800"}"#)).unwrap();
        assert_eq!(value, json!({"s": "\u{FFFD}"}));
    }

    #[test]
    fn test_recording_console_keeps_calls_in_order() {
        let console = RecordingConsole::default();
        console.log(&["first".to_string()]);
        console.log(&["second".to_string(), "2".to_string()]);
        assert_eq!(
            console.calls(),
            vec![
                vec!["first".to_string()],
                vec!["second".to_string(), "2".to_string()],
            ]
        );
    }
}
