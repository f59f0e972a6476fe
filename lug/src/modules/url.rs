//! `url` module: parsing, percent-encoding, query strings

use percent_encoding::{percent_decode_str, utf8_percent_encode, NON_ALPHANUMERIC};
use rhai::{Dynamic, Engine, EvalAltResult, ImmutableString, Map, Module};
use url::Url;

use crate::error::ErrorKind;
use crate::interp::kit;

fn parse(text: ImmutableString) -> Result<Map, Box<EvalAltResult>> {
    let parsed = Url::parse(&text)
        .map_err(|e| kit::runtime_error(ErrorKind::ArgumentError, format!("url parse: {e}")))?;
    let mut map = Map::new();
    map.insert("scheme".into(), Dynamic::from(parsed.scheme().to_string()));
    map.insert("host".into(), Dynamic::from(parsed.host_str().unwrap_or_default().to_string()));
    map.insert(
        "port".into(),
        parsed.port_or_known_default().map(|p| Dynamic::from(p as i64)).unwrap_or(Dynamic::UNIT),
    );
    map.insert("path".into(), Dynamic::from(parsed.path().to_string()));
    map.insert("query".into(), Dynamic::from(parsed.query().unwrap_or_default().to_string()));
    map.insert("fragment".into(), Dynamic::from(parsed.fragment().unwrap_or_default().to_string()));
    map.insert("user".into(), Dynamic::from(parsed.username().to_string()));

    let mut query_map = Map::new();
    for (key, value) in parsed.query_pairs() {
        query_map.insert(key.as_ref().into(), Dynamic::from(value.into_owned()));
    }
    map.insert("queryParams".into(), Dynamic::from_map(query_map));
    Ok(map)
}

fn join(base: ImmutableString, reference: ImmutableString) -> Result<ImmutableString, Box<EvalAltResult>> {
    let base = Url::parse(&base)
        .map_err(|e| kit::runtime_error(ErrorKind::ArgumentError, format!("url parse: {e}")))?;
    let joined = base
        .join(&reference)
        .map_err(|e| kit::runtime_error(ErrorKind::ArgumentError, format!("url join: {e}")))?;
    Ok(joined.to_string().into())
}

fn encode(text: ImmutableString) -> ImmutableString {
    utf8_percent_encode(&text, NON_ALPHANUMERIC).to_string().into()
}

fn decode(text: ImmutableString) -> Result<ImmutableString, Box<EvalAltResult>> {
    percent_decode_str(&text)
        .decode_utf8()
        .map(|decoded| decoded.into_owned().into())
        .map_err(|e| kit::runtime_error(ErrorKind::ArgumentError, format!("url decode: {e}")))
}

fn query_encode(values: Map) -> ImmutableString {
    let mut serializer = url::form_urlencoded::Serializer::new(String::new());
    for (key, value) in &values {
        serializer.append_pair(key, &value.to_string());
    }
    serializer.finish().into()
}

fn query_decode(text: ImmutableString) -> Map {
    let mut map = Map::new();
    for (key, value) in url::form_urlencoded::parse(text.as_bytes()) {
        map.insert(key.as_ref().into(), Dynamic::from(value.into_owned()));
    }
    map
}

/// Register the `url` module
pub fn register(engine: &mut Engine) {
    let mut module = Module::new();
    module.set_native_fn("parse", parse);
    module.set_native_fn("join", join);
    module.set_native_fn("encode", |text: ImmutableString| Ok(encode(text)));
    module.set_native_fn("decode", decode);
    module.set_native_fn("queryEncode", |values: Map| Ok(query_encode(values)));
    module.set_native_fn("queryDecode", |text: ImmutableString| Ok(query_decode(text)));
    engine.register_static_module("url", module.into());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_full_url() {
        let map = parse("https://user@h.example:8443/a/b?x=1&y=two#frag".into()).unwrap();
        assert_eq!(map.get("scheme").unwrap().to_string(), "https");
        assert_eq!(map.get("host").unwrap().to_string(), "h.example");
        assert_eq!(map.get("port").unwrap().as_int().unwrap(), 8443);
        assert_eq!(map.get("path").unwrap().to_string(), "/a/b");
        assert_eq!(map.get("fragment").unwrap().to_string(), "frag");
        assert_eq!(map.get("user").unwrap().to_string(), "user");
        let params = map.get("queryParams").unwrap().clone().try_cast::<Map>().unwrap();
        assert_eq!(params.get("y").unwrap().to_string(), "two");
    }

    #[test]
    fn test_encode_decode_round_trip() {
        let original = "a b/ä?";
        let encoded = encode(original.into());
        assert!(!encoded.contains(' '));
        assert_eq!(decode(encoded).unwrap().as_str(), original);
    }

    #[test]
    fn test_query_round_trip() {
        let mut values = Map::new();
        values.insert("q".into(), Dynamic::from("a b"));
        values.insert("n".into(), Dynamic::from(3_i64));
        let encoded = query_encode(values);
        let decoded = query_decode(encoded);
        assert_eq!(decoded.get("q").unwrap().to_string(), "a b");
        assert_eq!(decoded.get("n").unwrap().to_string(), "3");
    }

    #[test]
    fn test_join() {
        assert_eq!(
            join("https://h.example/a/b".into(), "../c".into()).unwrap().as_str(),
            "https://h.example/c"
        );
    }

    #[test]
    fn test_parse_error() {
        assert!(parse("://nope".into()).is_err());
    }
}
