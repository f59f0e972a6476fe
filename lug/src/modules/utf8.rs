//! `utf8` module: character-aware string helpers

use rhai::{Array, Dynamic, Engine, EvalAltResult, ImmutableString, Module};

use crate::error::ErrorKind;
use crate::interp::kit;

fn char_len(text: ImmutableString) -> i64 {
    text.chars().count() as i64
}

/// Character-indexed substring; negative indices count from the end
fn sub(text: ImmutableString, start: i64, end: i64) -> ImmutableString {
    let chars: Vec<char> = text.chars().collect();
    let len = chars.len() as i64;
    let clamp = |i: i64| -> usize {
        let resolved = if i < 0 { len + i } else { i };
        resolved.clamp(0, len) as usize
    };
    let (start, end) = (clamp(start), clamp(end));
    if start >= end {
        return ImmutableString::from("");
    }
    chars[start..end].iter().collect::<String>().into()
}

fn chars(text: ImmutableString) -> Array {
    text.chars().map(|c| Dynamic::from(c.to_string())).collect()
}

fn code_points(text: ImmutableString) -> Array {
    text.chars().map(|c| Dynamic::from(c as i64)).collect()
}

fn from_code_points(points: Array) -> Result<ImmutableString, Box<EvalAltResult>> {
    let mut out = String::with_capacity(points.len());
    for point in &points {
        let value = point
            .as_int()
            .map_err(|_| kit::arg_error("fromCodePoints", 1, "an array of integers", point))?;
        let c = u32::try_from(value)
            .ok()
            .and_then(char::from_u32)
            .ok_or_else(|| {
                kit::runtime_error(ErrorKind::ArgumentError, format!("invalid code point {value}"))
            })?;
        out.push(c);
    }
    Ok(out.into())
}

fn valid(blob: rhai::Blob) -> bool {
    std::str::from_utf8(&blob).is_ok()
}

/// Register the `utf8` module
pub fn register(engine: &mut Engine) {
    let mut module = Module::new();
    module.set_native_fn("len", |text: ImmutableString| Ok(char_len(text)));
    module.set_native_fn("sub", |text: ImmutableString, start: i64, end: i64| Ok(sub(text, start, end)));
    module.set_native_fn("sub", |text: ImmutableString, start: i64| {
        let end = text.chars().count() as i64;
        Ok(sub(text, start, end))
    });
    module.set_native_fn("chars", |text: ImmutableString| Ok(chars(text)));
    module.set_native_fn("codePoints", |text: ImmutableString| Ok(code_points(text)));
    module.set_native_fn("fromCodePoints", from_code_points);
    module.set_native_fn("valid", |blob: rhai::Blob| Ok(valid(blob)));
    module.set_native_fn("upper", |text: ImmutableString| {
        Ok(ImmutableString::from(text.to_uppercase()))
    });
    module.set_native_fn("lower", |text: ImmutableString| {
        Ok(ImmutableString::from(text.to_lowercase()))
    });
    engine.register_static_module("utf8", module.into());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_char_len_counts_chars_not_bytes() {
        assert_eq!(char_len("héllo".into()), 5);
        assert_eq!(char_len("日本語".into()), 3);
    }

    #[test]
    fn test_sub_char_indices() {
        assert_eq!(sub("日本語abc".into(), 1, 3).as_str(), "本語");
        assert_eq!(sub("hello".into(), -3, 5).as_str(), "llo");
        assert_eq!(sub("hello".into(), 3, 2).as_str(), "");
        assert_eq!(sub("hello".into(), 0, 99).as_str(), "hello");
    }

    #[test]
    fn test_code_points_round_trip() {
        let points = code_points("héllo".into());
        let back = from_code_points(points).unwrap();
        assert_eq!(back.as_str(), "héllo");
        assert!(from_code_points(vec![Dynamic::from(0x110000_i64)]).is_err());
    }

    #[test]
    fn test_valid() {
        assert!(valid(b"plain ascii".to_vec()));
        assert!(valid("日本語".as_bytes().to_vec()));
        assert!(!valid(vec![0xff, 0xfe]));
    }
}
