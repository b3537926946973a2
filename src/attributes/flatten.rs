use std::collections::HashSet;

use chrono::DateTime;
use log::debug;
use serde_json::{Map, Value};

use super::{is_valid_value, FlatAttributeMap};

/// Flattens nested GitLab API records into string-valued attribute maps.
///
/// Nested objects become dotted keys (`runner.description`), sequences become
/// bracketed keys (`runner.tags[0]`) and strings holding a JSON object or
/// array are expanded as if they had been native structures. Null, empty and
/// `"None"` values never produce an attribute, and sequence indices are
/// compacted so filtered elements leave no gaps.
#[derive(Debug, Clone, Default)]
pub struct AttributeFlattener {
    dropped_fields: HashSet<String>,
    convert_timestamps: bool,
}

impl AttributeFlattener {
    /// Creates a flattener.
    ///
    /// # Arguments
    ///
    /// * `dropped_fields` - Lowercase qualified names to leave out, together
    ///   with everything nested below them
    /// * `convert_timestamps` - Emit `*_at` / `*_date` RFC 3339 values as Unix
    ///   epoch nanoseconds
    pub fn new(dropped_fields: HashSet<String>, convert_timestamps: bool) -> Self {
        Self {
            dropped_fields,
            convert_timestamps,
        }
    }

    pub fn flatten(&self, record: &Map<String, Value>) -> FlatAttributeMap {
        self.flatten_with_prefix(record, "")
    }

    /// Flattens `record` with every key qualified by `prefix`.
    pub fn flatten_with_prefix(&self, record: &Map<String, Value>, prefix: &str) -> FlatAttributeMap {
        let mut out = FlatAttributeMap::new();
        self.flatten_mapping(&mut out, record, prefix);
        out
    }

    fn flatten_mapping(&self, out: &mut FlatAttributeMap, record: &Map<String, Value>, prefix: &str) {
        for (field, value) in record {
            if !is_present(value) {
                continue;
            }

            let name = qualify(prefix, &normalize_key(field));
            if self.dropped_fields.contains(&name) {
                continue;
            }

            self.flatten_value(out, &name, value);
        }
    }

    fn flatten_value(&self, out: &mut FlatAttributeMap, name: &str, value: &Value) {
        match value {
            Value::Object(map) => self.flatten_mapping(out, map, name),
            Value::Array(items) => self.flatten_sequence(out, items, name),
            Value::String(raw) => match parse_json_container(raw) {
                Some(parsed) => self.flatten_value(out, name, &parsed),
                None => self.emit_scalar(out, name, raw.clone()),
            },
            Value::Number(number) => self.emit_scalar(out, name, number.to_string()),
            Value::Bool(flag) => self.emit_scalar(out, name, flag.to_string()),
            Value::Null => {}
        }
    }

    fn flatten_sequence(&self, out: &mut FlatAttributeMap, items: &[Value], prefix: &str) {
        // Only elements that produced output advance the index
        let mut index = 0usize;
        for item in items.iter().filter(|item| is_present(item)) {
            let mut element = FlatAttributeMap::new();
            self.flatten_value(&mut element, &format!("{prefix}[{index}]"), item);
            if !element.is_empty() {
                out.extend(element);
                index += 1;
            }
        }
    }

    fn emit_scalar(&self, out: &mut FlatAttributeMap, name: &str, value: String) {
        if !is_valid_value(&value) {
            return;
        }

        if self.convert_timestamps && is_timestamp_key(name) {
            if let Some(nanos) = to_epoch_nanos(&value) {
                out.insert(name.to_string(), nanos.to_string());
                return;
            }
        }

        out.insert(name.to_string(), value);
    }
}

fn normalize_key(key: &str) -> String {
    key.to_lowercase().replace(' ', "")
}

fn qualify(prefix: &str, key: &str) -> String {
    if prefix.is_empty() {
        key.to_string()
    } else {
        format!("{prefix}.{key}")
    }
}

fn is_present(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::String(raw) => is_valid_value(raw),
        _ => true,
    }
}

/// Parses strings that hold a JSON object or array. Anything else, including
/// malformed JSON, stays a plain string.
fn parse_json_container(raw: &str) -> Option<Value> {
    let trimmed = raw.trim();
    if !(trimmed.starts_with('{') || trimmed.starts_with('[')) {
        return None;
    }

    match serde_json::from_str::<Value>(trimmed) {
        Ok(parsed) if parsed.is_object() || parsed.is_array() => Some(parsed),
        Ok(_) => None,
        Err(e) => {
            debug!("Keeping malformed JSON value as a plain string: {e}");
            None
        }
    }
}

fn is_timestamp_key(name: &str) -> bool {
    name.contains("_at") || name.contains("_date")
}

fn to_epoch_nanos(value: &str) -> Option<i64> {
    DateTime::parse_from_rfc3339(value)
        .ok()
        .and_then(|timestamp| timestamp.timestamp_nanos_opt())
}
