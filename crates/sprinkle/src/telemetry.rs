//! Decoding of the cyclic-program telemetry reported by the valve.
//!
//! The device publishes its program descriptor as a Python-literal dict
//! (`{'current_count': 1, 'total_number': 1, ...}`) rather than JSON. Everything
//! that knows about that format lives in this module.

use serde::Deserialize;
use serde_json::{Map, Value};

// ---------------------------------------------------------------------------
// Decoder
// ---------------------------------------------------------------------------

/// Decode a Python-literal style mapping into a JSON object.
///
/// Never fails: malformed input, an empty string, or anything that is not a
/// mapping yields an empty map.
pub(crate) fn decode(raw: &str) -> Map<String, Value> {
    let Some(json) = normalize(raw) else {
        return Map::new();
    };
    match serde_json::from_str::<Value>(&json) {
        Ok(Value::Object(map)) => map,
        _ => Map::new(),
    }
}

/// Rewrite single-quoted strings and `True`/`False`/`None` into strict JSON.
/// Returns `None` on an unterminated string.
fn normalize(raw: &str) -> Option<String> {
    let mut out = String::with_capacity(raw.len() + 8);
    let mut chars = raw.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '\'' | '"' => {
                let quote = c;
                out.push('"');
                loop {
                    match chars.next()? {
                        ch if ch == quote => break,
                        '\\' => {
                            let escaped = chars.next()?;
                            if escaped == '\'' {
                                out.push('\'');
                            } else {
                                out.push('\\');
                                out.push(escaped);
                            }
                        }
                        '"' => out.push_str("\\\""),
                        ch => out.push(ch),
                    }
                }
                out.push('"');
            }
            c if c.is_ascii_alphabetic() || c == '_' => {
                let mut word = String::from(c);
                while let Some(&next) = chars.peek() {
                    if next.is_ascii_alphanumeric() || next == '_' {
                        word.push(next);
                        chars.next();
                    } else {
                        break;
                    }
                }
                out.push_str(match word.as_str() {
                    "True" => "true",
                    "False" => "false",
                    "None" => "null",
                    other => other,
                });
            }
            c => out.push(c),
        }
    }

    Some(out)
}

// ---------------------------------------------------------------------------
// Cyclic program descriptor
// ---------------------------------------------------------------------------

/// A decoded cyclic irrigation program. Only ever constructed whole: every
/// field present, numeric and finite.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
pub(crate) struct CyclicProgram {
    pub(crate) current_count: f64,
    pub(crate) total_number: f64,
    pub(crate) irrigation_duration: f64,
    pub(crate) irrigation_interval: f64,
}

impl CyclicProgram {
    pub(crate) fn from_record(record: &Map<String, Value>) -> Option<Self> {
        let program: Self = serde_json::from_value(Value::Object(record.clone())).ok()?;
        let finite = [
            program.current_count,
            program.total_number,
            program.irrigation_duration,
            program.irrigation_interval,
        ]
        .iter()
        .all(|v| v.is_finite());
        finite.then_some(program)
    }
}

// ===========================================================================
// Tests
// ===========================================================================
