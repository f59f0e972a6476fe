//! Value bridge between script values and JSON-shaped native values
//!
//! Conversion is total in both directions. Integral numbers survive as
//! integers, fractional numbers as floats. Callables pass through opaquely
//! on the script side and stringify when dragged to the native side; the
//! same goes for any other foreign type. Byte blobs become (lossy) strings
//! on the native side, matching how byte columns surface from the SQL
//! bridge.

use rhai::{Array, Dynamic, FnPtr, Map};
use serde_json::{Number, Value};

/// Convert a native JSON value into a script value
pub fn to_dynamic(value: &Value) -> Dynamic {
    match value {
        Value::Null => Dynamic::UNIT,
        Value::Bool(b) => Dynamic::from(*b),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Dynamic::from(i)
            } else if let Some(u) = n.as_u64() {
                // u64 values beyond i64::MAX lose no precision as floats
                // that scripts can still compare and print
                i64::try_from(u).map(Dynamic::from).unwrap_or_else(|_| Dynamic::from(u as f64))
            } else {
                Dynamic::from(n.as_f64().unwrap_or(f64::NAN))
            }
        }
        Value::String(s) => Dynamic::from(s.clone()),
        Value::Array(items) => {
            let array: Array = items.iter().map(to_dynamic).collect();
            Dynamic::from_array(array)
        }
        Value::Object(fields) => {
            let mut map = Map::new();
            for (key, entry) in fields {
                map.insert(key.as_str().into(), to_dynamic(entry));
            }
            Dynamic::from_map(map)
        }
    }
}

/// Convert a script value into a native JSON value
pub fn to_json(value: &Dynamic) -> Value {
    if value.is_unit() {
        return Value::Null;
    }
    if let Ok(b) = value.as_bool() {
        return Value::Bool(b);
    }
    if let Ok(i) = value.as_int() {
        return Value::Number(Number::from(i));
    }
    if let Ok(f) = value.as_float() {
        return Number::from_f64(f).map(Value::Number).unwrap_or(Value::Null);
    }
    if value.is_string() {
        return Value::String(value.clone().into_immutable_string().map(|s| s.to_string()).unwrap_or_default());
    }
    if value.is_array() {
        let items = value.clone().into_array().unwrap_or_default();
        return Value::Array(items.iter().map(to_json).collect());
    }
    if value.is_map() {
        if let Some(map) = value.clone().try_cast::<Map>() {
            let mut fields = serde_json::Map::with_capacity(map.len());
            for (key, entry) in map {
                fields.insert(key.to_string(), to_json(&entry));
            }
            return Value::Object(fields);
        }
        return Value::Null;
    }
    if let Some(blob) = value.clone().try_cast::<rhai::Blob>() {
        return Value::String(String::from_utf8_lossy(&blob).into_owned());
    }
    if value.clone().try_cast::<FnPtr>().is_some() {
        return Value::String(value.to_string());
    }
    // opaque foreign data stringifies
    Value::String(value.to_string())
}

/// Convert a whole rhai map into a JSON object
pub fn map_to_json(map: &Map) -> Value {
    let mut fields = serde_json::Map::with_capacity(map.len());
    for (key, entry) in map {
        fields.insert(key.to_string(), to_json(entry));
    }
    Value::Object(fields)
}
