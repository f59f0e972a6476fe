//! `json` module: encode/decode through the value bridge

use rhai::{Dynamic, Engine, EvalAltResult, ImmutableString, Module};

use crate::error::ErrorKind;
use crate::interp::kit;
use crate::interp::value;

fn encode(value_in: Dynamic) -> Result<ImmutableString, Box<EvalAltResult>> {
    serde_json::to_string(&value::to_json(&value_in))
        .map(Into::into)
        .map_err(|e| kit::runtime_error(ErrorKind::ArgumentError, format!("json encode: {e}")))
}

fn pretty(value_in: Dynamic) -> Result<ImmutableString, Box<EvalAltResult>> {
    serde_json::to_string_pretty(&value::to_json(&value_in))
        .map(Into::into)
        .map_err(|e| kit::runtime_error(ErrorKind::ArgumentError, format!("json encode: {e}")))
}

fn decode(text: ImmutableString) -> Result<Dynamic, Box<EvalAltResult>> {
    let parsed: serde_json::Value = serde_json::from_str(&text)
        .map_err(|e| kit::runtime_error(ErrorKind::ArgumentError, format!("json decode: {e}")))?;
    Ok(value::to_dynamic(&parsed))
}

/// Register the `json` module
pub fn register(engine: &mut Engine) {
    let mut module = Module::new();
    module.set_native_fn("encode", encode);
    module.set_native_fn("pretty", pretty);
    module.set_native_fn("decode", decode);
    engine.register_static_module("json", module.into());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_decode_round_trip() {
        let decoded = decode(r#"{"a":1,"b":[true,null],"c":"x"}"#.into()).unwrap();
        let encoded = encode(decoded).unwrap();
        let reparsed: serde_json::Value = serde_json::from_str(&encoded).unwrap();
        assert_eq!(reparsed, serde_json::json!({"a":1,"b":[true,null],"c":"x"}));
    }

    #[test]
    fn test_decode_error_is_script_visible() {
        let err = decode("{broken".into()).unwrap_err();
        assert!(err.to_string().contains("json decode"));
    }

    #[test]
    fn test_pretty_output() {
        let decoded = decode(r#"{"a":1}"#.into()).unwrap();
        let pretty_text = pretty(decoded).unwrap();
        assert!(pretty_text.contains("\n"));
    }
}
