//! `request` module: HTTP client calls from scripts
//!
//! Each call builds a fresh client (own transport), applies the options
//! map, runs the request to completion on the bridge runtime and returns
//! `#{status, headers, body}`.

use std::time::Duration;

use rhai::{Dynamic, Engine, EvalAltResult, ImmutableString, Map, Module};

use crate::error::ErrorKind;
use crate::interp::kit;
use crate::interp::value;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

fn http_error(err: reqwest::Error) -> Box<EvalAltResult> {
    kit::runtime_error(ErrorKind::IOError, format!("http request: {err}"))
}

fn perform(method: &str, target: &str, opts: &Map) -> Result<Map, Box<EvalAltResult>> {
    let method = reqwest::Method::from_bytes(method.as_bytes())
        .map_err(|_| kit::runtime_error(ErrorKind::ArgumentError, format!("bad method {method:?}")))?;

    let timeout = match opts.get("timeout") {
        Some(v) if !v.is_unit() => kit::check_duration("request", 3, v)?,
        _ => DEFAULT_TIMEOUT,
    };

    let client = reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .map_err(http_error)?;
    let mut request = client.request(method, target);

    if let Some(headers) = opts.get("headers") {
        if !headers.is_unit() {
            for (name, v) in kit::check_string_map("request", 3, headers)? {
                request = request.header(name, v);
            }
        }
    }
    if let Some(query) = opts.get("query") {
        if let Some(query) = query.clone().try_cast::<Map>() {
            let pairs: Vec<(String, String)> = query
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect();
            request = request.query(&pairs);
        }
    }
    if let Some(auth) = opts.get("basicAuth") {
        if let Some(auth) = auth.clone().try_cast::<rhai::Array>() {
            let user = auth.first().map(|v| v.to_string()).unwrap_or_default();
            let pass = auth.get(1).map(|v| v.to_string());
            request = request.basic_auth(user, pass);
        }
    }
    if let Some(json) = opts.get("json") {
        if !json.is_unit() {
            request = request.json(&value::to_json(json));
        }
    } else if let Some(body) = opts.get("body") {
        if let Some(text) = body.clone().try_cast::<ImmutableString>() {
            request = request.body(text.to_string());
        } else if let Some(blob) = body.clone().try_cast::<rhai::Blob>() {
            request = request.body(blob);
        }
    }

    let (status, headers, body) = kit::block_on(async move {
        let response = request.send().await?;
        let status = response.status().as_u16();
        let headers: Vec<(String, String)> = response
            .headers()
            .iter()
            .map(|(name, v)| (name.to_string(), v.to_str().unwrap_or_default().to_string()))
            .collect();
        let body = response.text().await?;
        Ok::<_, reqwest::Error>((status, headers, body))
    })?
    .map_err(http_error)?;

    let mut header_map = Map::new();
    for (name, v) in headers {
        header_map.insert(name.as_str().into(), Dynamic::from(v));
    }
    let mut result = Map::new();
    result.insert("status".into(), Dynamic::from(status as i64));
    result.insert("headers".into(), Dynamic::from_map(header_map));
    result.insert("body".into(), Dynamic::from(body));
    Ok(result)
}

/// Register the `request` module
pub fn register(engine: &mut Engine) {
    let mut module = Module::new();
    for verb in ["get", "post", "put", "patch", "delete", "head"] {
        let method = verb.to_ascii_uppercase();
        let simple_method = method.clone();
        module.set_native_fn(verb, move |target: ImmutableString| {
            perform(&simple_method, &target, &Map::new())
        });
        module.set_native_fn(verb, move |target: ImmutableString, opts: Map| {
            perform(&method, &target, &opts)
        });
    }
    module.set_native_fn("call", |method: ImmutableString, target: ImmutableString, opts: Map| {
        perform(&method.to_ascii_uppercase(), &target, &opts)
    });
    engine.register_static_module("request", module.into());
}
