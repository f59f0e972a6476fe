//! Per-request context
//!
//! Contexts come from a process-wide free list and are handed to script
//! handlers as an opaque handle with a method surface. All mutation goes
//! through the internal mutex; response state additionally passes the
//! writer's own guards (written / hijacked / timed-out). Release clears
//! every field; an entry is only recycled when no script kept a handle to
//! it.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use base64::Engine as _;
use bytes::Bytes;
use http::header::HeaderMap;
use once_cell::sync::Lazy;
use path_clean::PathClean;
use rhai::{Dynamic, Engine, EvalAltResult, ImmutableString, Map, NativeCallContext};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::error::{Error, ErrorKind};
use crate::http::cookie::{self, CookieOptions};
use crate::http::middleware::{Chain, Handler};
use crate::http::multipart;
use crate::http::pages;
use crate::http::response::{ConnStream, ResponseWriter};
use crate::interp::kit;

/// A connection taken over by a handler
pub struct HijackedConn {
    stream: Box<dyn ConnStream>,
    leftover: Vec<u8>,
}

impl HijackedConn {
    /// Wrap a stream plus any bytes already read past the request
    pub fn new(stream: Box<dyn ConnStream>, leftover: Vec<u8>) -> Self {
        Self { stream, leftover }
    }
}

pub(crate) struct ChainRun {
    pub steps: Arc<Vec<Handler>>,
    pub depth: usize,
    pub fired: Vec<bool>,
}

#[derive(Default)]
struct CtxState {
    method: String,
    path: String,
    raw_path: String,
    raw_query: String,
    proto: String,
    headers: HeaderMap,
    host: String,
    remote_addr: String,
    local_port: u16,
    scheme: &'static str,
    body: Bytes,
    leftover: Vec<u8>,
    params: Vec<(String, String)>,
    route_pattern: String,
    data: BTreeMap<String, Dynamic>,
    status_error: String,
    start: Option<Instant>,
    error_template: Option<String>,
    writer: Option<ResponseWriter>,
    hijack: Option<Arc<Mutex<HijackedConn>>>,
    chain: Option<ChainRun>,
}

/// Script-facing request context handle
#[derive(Clone)]
pub struct Ctx {
    inner: Arc<Mutex<CtxState>>,
}

static FREE_LIST: Lazy<Mutex<Vec<Ctx>>> = Lazy::new(|| Mutex::new(Vec::new()));

/// Everything the engine knows about one parsed request
pub struct RequestParts {
    pub method: String,
    pub path: String,
    pub raw_query: String,
    pub proto: String,
    pub headers: HeaderMap,
    pub remote_addr: String,
    pub local_port: u16,
    pub scheme: &'static str,
    pub body: Bytes,
    pub leftover: Vec<u8>,
}

impl Ctx {
    /// Take a context from the free list and bind it to a request
    pub fn acquire(parts: RequestParts, writer: ResponseWriter, error_template: Option<String>) -> Self {
        let ctx = FREE_LIST
            .lock()
            .ok()
            .and_then(|mut free| free.pop())
            .unwrap_or_else(|| Ctx {
                inner: Arc::new(Mutex::new(CtxState::default())),
            });
        {
            let mut state = ctx.lock();
            let host = parts
                .headers
                .get(http::header::HOST)
                .and_then(|value| value.to_str().ok())
                .unwrap_or_default()
                .to_string();
            *state = CtxState {
                method: parts.method,
                path: parts.path.clone(),
                raw_path: parts.path,
                raw_query: parts.raw_query,
                proto: parts.proto,
                headers: parts.headers,
                host,
                remote_addr: parts.remote_addr,
                local_port: parts.local_port,
                scheme: parts.scheme,
                body: parts.body,
                leftover: parts.leftover,
                params: Vec::new(),
                route_pattern: String::new(),
                data: BTreeMap::new(),
                status_error: String::new(),
                start: Some(Instant::now()),
                error_template,
                writer: Some(writer),
                hijack: None,
                chain: None,
            };
        }
        ctx
    }

    /// Clear all fields and recycle the entry when nothing still holds it
    pub fn release(self) {
        {
            let mut state = self.lock();
            *state = CtxState::default();
        }
        if Arc::strong_count(&self.inner) == 1 {
            if let Ok(mut free) = FREE_LIST.lock() {
                free.push(self);
            }
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, CtxState> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn writer(&self) -> Result<ResponseWriter, Error> {
        self.lock()
            .writer
            .clone()
            .ok_or_else(|| Error::new(ErrorKind::ScriptError, "context already released"))
    }

    // ---- engine-side accessors -------------------------------------------

    /// Bind the resolved route
    pub fn set_route(&self, params: Vec<(String, String)>, pattern: String) {
        let mut state = self.lock();
        state.params = params;
        state.route_pattern = pattern;
    }

    /// Remove a route prefix from the visible path (empty result becomes `/`)
    pub fn strip_prefix(&self, prefix: &str) {
        let mut state = self.lock();
        let current = state.path.clone();
        if let Some(rest) = current.strip_prefix(prefix) {
            state.path = if rest.is_empty() { "/".to_string() } else { rest.to_string() };
        }
    }

    /// Install the middleware chain for this request
    pub(crate) fn begin_chain(&self, chain: &Chain) {
        let steps = chain.steps();
        let fired = vec![false; steps.len()];
        self.lock().chain = Some(ChainRun { steps, depth: 0, fired });
    }

    /// Record a failure status and its error text
    pub fn record_failure(&self, err: &Error) {
        let status = err.status();
        let text = err.to_string();
        {
            let mut state = self.lock();
            state.status_error = text;
        }
        if let Ok(writer) = self.writer() {
            if err.kind() == ErrorKind::Timeout {
                // the timeout path stamps its own response first
                writer.mark_timed_out();
            } else {
                writer.overwrite(status, &[]);
            }
        }
    }

    /// Recorded error text for logging
    pub fn status_error(&self) -> String {
        self.lock().status_error.clone()
    }

    /// The response status recorded so far (0 when none)
    pub fn response_status(&self) -> u16 {
        self.lock().writer.as_ref().map(|writer| writer.status()).unwrap_or(0)
    }

    /// Request method
    pub fn method_name(&self) -> String {
        self.lock().method.clone()
    }

    /// Visible (possibly stripped) request path
    pub fn current_path(&self) -> String {
        self.lock().path.clone()
    }

    /// Request host
    pub fn host_name(&self) -> String {
        let state = self.lock();
        state.host.split(':').next().unwrap_or_default().to_string()
    }

    /// Elapsed time since the context was bound
    pub fn elapsed(&self) -> Duration {
        self.lock().start.map(|t| t.elapsed()).unwrap_or_default()
    }

    /// Whether a handler took the connection
    pub fn hijacked(&self) -> bool {
        self.lock().hijack.is_some()
    }

    /// Render the error page into the body when a failed response has none
    pub fn finalize_error_body(&self) {
        let Ok(writer) = self.writer() else { return };
        let status = writer.status();
        if status >= 400 && writer.body_is_empty() && !writer.hijacked() {
            let (error_text, template) = {
                let state = self.lock();
                (state.status_error.clone(), state.error_template.clone())
            };
            let page = pages::render_error_page(status, &error_text, template.as_deref());
            writer.overwrite(status, page.as_bytes());
        }
    }

    // ---- shared implementations ------------------------------------------

    fn query_value(&self, key: &str) -> String {
        let raw = self.lock().raw_query.clone();
        url::form_urlencoded::parse(raw.as_bytes())
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.into_owned())
            .unwrap_or_default()
    }

    fn header_value(&self, name: &str) -> String {
        self.lock()
            .headers
            .get(name)
            .and_then(|value| value.to_str().ok())
            .unwrap_or_default()
            .to_string()
    }

    fn cookies(&self) -> BTreeMap<String, String> {
        cookie::parse_cookie_header(&self.header_value("cookie"))
    }

    fn write_value(&self, value: &Dynamic) -> Result<i64, Error> {
        let bytes: Vec<u8> = if let Some(text) = value.clone().try_cast::<ImmutableString>() {
            text.as_bytes().to_vec()
        } else if let Some(blob) = value.clone().try_cast::<rhai::Blob>() {
            blob
        } else if value.is_map() || value.is_array() {
            serde_json::to_string(&crate::interp::value::to_json(value))
                .map_err(|e| Error::new(ErrorKind::ArgumentError, e.to_string()))?
                .into_bytes()
        } else {
            value.to_string().into_bytes()
        };
        // after a hijack, writes go to the raw connection
        if self.lock().hijack.is_some() {
            return self.hijack_write(&bytes);
        }
        let writer = self.writer()?;
        Ok(writer.write(&bytes)? as i64)
    }

    fn redirect_to(&self, target: &str, code: i64) -> Result<(), Error> {
        if !(300..=308).contains(&code) {
            return Err(Error::new(
                ErrorKind::InvalidStatus,
                format!("redirect status {code} outside 300..=308"),
            ));
        }
        let writer = self.writer()?;
        writer.set_header("Location", target)?;
        writer.write_header(code as u16)
    }

    fn respond_error(&self, code: i64, message: &str) -> Result<(), Error> {
        if !(400..600).contains(&code) {
            return Err(Error::new(
                ErrorKind::InvalidStatus,
                format!("error status {code} outside 400..600"),
            ));
        }
        let template = {
            let mut state = self.lock();
            state.status_error = message.to_string();
            state.error_template.clone()
        };
        let writer = self.writer()?;
        let page = pages::render_error_page(code as u16, message, template.as_deref());
        writer.overwrite(code as u16, page.as_bytes());
        Ok(())
    }

    fn serve_path(&self, path: &Path, root: Option<&Path>, attachment: Option<&str>) -> Result<(), Error> {
        let resolved = match root {
            Some(root) => {
                let root = root.clean();
                let joined = root.join(path.strip_prefix("/").unwrap_or(path)).clean();
                if !joined.starts_with(&root) {
                    return Err(Error::new(
                        ErrorKind::PathTraversal,
                        format!("{} escapes {}", path.display(), root.display()),
                    ));
                }
                joined
            }
            None => path.clean(),
        };

        let data = std::fs::read(&resolved).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                Error::new(ErrorKind::NotFound, format!("{} not found", resolved.display()))
            } else {
                Error::from(e)
            }
        })?;

        let writer = self.writer()?;
        let mime = mime_guess::from_path(&resolved).first_or_octet_stream();
        writer.set_header("Content-Type", mime.as_ref())?;
        if let Some(name) = attachment {
            writer.set_header("Content-Disposition", &format!("attachment; filename=\"{name}\""))?;
        }
        writer.write(&data)?;
        Ok(())
    }

    /// Serve a directory entry for a static-file route
    pub(crate) fn serve_static(&self, root: &Path) -> Result<(), Error> {
        let rel = {
            let state = self.lock();
            state
                .params
                .last()
                .map(|(_, value)| value.clone())
                .unwrap_or_else(|| state.path.trim_start_matches('/').to_string())
        };
        let rel = if rel.is_empty() { "index.html".to_string() } else { rel };
        self.serve_path(Path::new(&rel), Some(root), None)
    }

    fn do_hijack(&self) -> Result<(), Error> {
        let writer = self.writer()?;
        writer.mark_hijacked()?;
        let context = kit::current()
            .ok_or_else(|| Error::new(ErrorKind::ScriptError, "no active script context"))?;
        let stream = context.handle.block_on(writer.take_io());
        let Some(stream) = stream else {
            return Err(Error::new(ErrorKind::Hijacked, "connection already taken"));
        };
        let mut state = self.lock();
        let leftover = std::mem::take(&mut state.leftover);
        state.hijack = Some(Arc::new(Mutex::new(HijackedConn::new(stream, leftover))));
        Ok(())
    }

    fn hijack_handle(&self) -> Result<Arc<Mutex<HijackedConn>>, Error> {
        self.lock()
            .hijack
            .clone()
            .ok_or_else(|| Error::new(ErrorKind::Hijacked, "connection is not hijacked"))
    }

    fn hijack_read(&self, limit: Option<usize>) -> Result<rhai::Blob, Error> {
        let conn = self.hijack_handle()?;
        let context = kit::current()
            .ok_or_else(|| Error::new(ErrorKind::ScriptError, "no active script context"))?;
        let mut guard = conn.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if !guard.leftover.is_empty() {
            let take = limit.unwrap_or(guard.leftover.len()).min(guard.leftover.len());
            return Ok(guard.leftover.drain(..take).collect());
        }
        let wanted = limit.unwrap_or(4096);
        let mut buf = vec![0u8; wanted.max(1)];
        let read = context
            .handle
            .block_on(guard.stream.read(&mut buf))
            .map_err(Error::from)?;
        buf.truncate(read);
        Ok(buf)
    }

    fn hijack_write(&self, data: &[u8]) -> Result<i64, Error> {
        let conn = self.hijack_handle()?;
        let context = kit::current()
            .ok_or_else(|| Error::new(ErrorKind::ScriptError, "no active script context"))?;
        let mut guard = conn.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        context
            .handle
            .block_on(guard.stream.write_all(data))
            .map_err(Error::from)?;
        Ok(data.len() as i64)
    }

    fn hijack_close(&self) -> Result<(), Error> {
        let conn = self.hijack_handle()?;
        let context = kit::current()
            .ok_or_else(|| Error::new(ErrorKind::ScriptError, "no active script context"))?;
        let mut guard = conn.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        context
            .handle
            .block_on(guard.stream.shutdown())
            .map_err(Error::from)?;
        Ok(())
    }

    /// Advance the middleware chain by one step (one-shot per depth)
    pub(crate) fn advance_chain(&self) -> Option<(Handler, usize)> {
        let mut state = self.lock();
        let chain = state.chain.as_mut()?;
        let depth = chain.depth;
        if *chain.fired.get(depth)? {
            return None;
        }
        chain.fired[depth] = true;
        if depth + 1 >= chain.steps.len() {
            return None;
        }
        let next = chain.steps[depth + 1].clone();
        chain.depth = depth + 1;
        Some((next, depth))
    }

    /// Restore the chain cursor after a `next` call unwinds
    pub(crate) fn restore_chain_depth(&self, depth: usize) {
        let mut state = self.lock();
        if let Some(chain) = state.chain.as_mut() {
            chain.depth = depth;
        }
    }
}

fn to_script<T>(result: Result<T, Error>) -> Result<T, Box<EvalAltResult>> {
    result.map_err(Error::into_script)
}

fn map_from_pairs<I: IntoIterator<Item = (String, String)>>(pairs: I) -> Map {
    let mut map = Map::new();
    for (key, value) in pairs {
        map.insert(key.as_str().into(), Dynamic::from(value));
    }
    map
}

/// Register the context type and its script surface
pub fn register(engine: &mut Engine) {
    engine.register_type_with_name::<Ctx>("Context");

    // ---- read surface ----------------------------------------------------
    engine.register_fn("method", |ctx: &mut Ctx| ctx.method_name());
    engine.register_fn("host", |ctx: &mut Ctx| ctx.host_name());
    engine.register_fn("proto", |ctx: &mut Ctx| ctx.lock().proto.clone());
    engine.register_fn("path", |ctx: &mut Ctx| ctx.current_path());
    engine.register_fn("rawPath", |ctx: &mut Ctx| ctx.lock().raw_path.clone());
    engine.register_fn("rawQuery", |ctx: &mut Ctx| ctx.lock().raw_query.clone());
    engine.register_fn("requestUri", |ctx: &mut Ctx| {
        let state = ctx.lock();
        if state.raw_query.is_empty() {
            state.raw_path.clone()
        } else {
            format!("{}?{}", state.raw_path, state.raw_query)
        }
    });
    engine.register_fn("remoteAddr", |ctx: &mut Ctx| ctx.lock().remote_addr.clone());
    engine.register_fn("remoteIP", |ctx: &mut Ctx| {
        let addr = ctx.lock().remote_addr.clone();
        addr.rsplit_once(':').map(|(ip, _)| ip.trim_matches(['[', ']']).to_string()).unwrap_or(addr)
    });
    engine.register_fn("referer", |ctx: &mut Ctx| ctx.header_value("referer"));
    engine.register_fn("userAgent", |ctx: &mut Ctx| ctx.header_value("user-agent"));
    engine.register_fn("scheme", |ctx: &mut Ctx| ctx.lock().scheme.to_string());
    engine.register_fn("port", |ctx: &mut Ctx| ctx.lock().local_port as i64);
    engine.register_fn("query", |ctx: &mut Ctx, key: ImmutableString| ctx.query_value(&key));
    engine.register_fn("getHeader", |ctx: &mut Ctx, name: ImmutableString| ctx.header_value(&name));
    engine.register_fn("getCookie", |ctx: &mut Ctx, name: ImmutableString| {
        ctx.cookies().remove(name.as_str()).unwrap_or_default()
    });
    engine.register_fn("getCookies", |ctx: &mut Ctx| map_from_pairs(ctx.cookies()));
    engine.register_fn("getBody", |ctx: &mut Ctx| {
        let body = ctx.lock().body.clone();
        match std::str::from_utf8(&body) {
            Ok(text) => Dynamic::from(text.to_string()),
            Err(_) => Dynamic::from_blob(body.to_vec()),
        }
    });
    engine.register_fn("postForm", |ctx: &mut Ctx| {
        let (body, content_type) = {
            let state = ctx.lock();
            (state.body.clone(), state.headers.get(http::header::CONTENT_TYPE)
                .and_then(|v| v.to_str().ok()).unwrap_or_default().to_string())
        };
        if let Some(boundary) = multipart::boundary_from_content_type(&content_type) {
            let mut map = Map::new();
            if let Ok(parts) = multipart::parse(&body, &boundary) {
                for part in parts {
                    if part.filename.is_none() {
                        map.insert(
                            part.name.as_str().into(),
                            Dynamic::from(String::from_utf8_lossy(&part.data).into_owned()),
                        );
                    }
                }
            }
            map
        } else {
            map_from_pairs(
                url::form_urlencoded::parse(&body)
                    .map(|(k, v)| (k.into_owned(), v.into_owned())),
            )
        }
    });
    engine.register_fn("params", |ctx: &mut Ctx| {
        map_from_pairs(ctx.lock().params.iter().cloned())
    });
    engine.register_fn("param", |ctx: &mut Ctx, name: ImmutableString| {
        ctx.lock()
            .params
            .iter()
            .find(|(key, _)| key.as_str() == name.as_str())
            .map(|(_, value)| value.clone())
            .unwrap_or_default()
    });
    engine.register_fn("basicAuth", |ctx: &mut Ctx, user: ImmutableString, pass: ImmutableString| {
        let header = ctx.header_value("authorization");
        let Some(encoded) = header.strip_prefix("Basic ") else { return false };
        let expected = base64::engine::general_purpose::STANDARD.encode(format!("{user}:{pass}"));
        encoded.trim() == expected
    });
    engine.register_fn("getData", |ctx: &mut Ctx, key: ImmutableString| {
        ctx.lock().data.get(key.as_str()).cloned().unwrap_or(Dynamic::UNIT)
    });
    engine.register_fn("since", |ctx: &mut Ctx| ctx.elapsed().as_secs_f64());
    engine.register_fn("route", |ctx: &mut Ctx| ctx.lock().route_pattern.clone());

    // ---- write surface ---------------------------------------------------
    engine.register_fn("setStatus", |ctx: &mut Ctx, code: i64| -> Result<(), Box<EvalAltResult>> {
        let writer = to_script(ctx.writer())?;
        if !(100..600).contains(&code) {
            return Err(Error::new(ErrorKind::InvalidStatus, format!("status {code} out of range")).into());
        }
        to_script(writer.write_header(code as u16))
    });
    engine.register_fn(
        "setHeader",
        |ctx: &mut Ctx, name: ImmutableString, value: ImmutableString| -> Result<(), Box<EvalAltResult>> {
            let writer = to_script(ctx.writer())?;
            to_script(writer.set_header(&name, &value))
        },
    );
    engine.register_fn("delHeader", |ctx: &mut Ctx, name: ImmutableString| -> Result<(), Box<EvalAltResult>> {
        let writer = to_script(ctx.writer())?;
        to_script(writer.del_header(&name))
    });
    engine.register_fn("setCookie", |ctx: &mut Ctx, opts: Map| -> Result<(), Box<EvalAltResult>> {
        let get = |key: &str| opts.get(key).cloned();
        let name = get("name")
            .and_then(|v| v.try_cast::<ImmutableString>())
            .ok_or_else(|| kit::arg_error("setCookie", 1, "a map with a name field", &Dynamic::UNIT))?;
        let value = get("value").and_then(|v| v.try_cast::<ImmutableString>()).unwrap_or_default();
        let expires = match get("expires") {
            Some(v) if !v.is_unit() => Some(kit::check_time("setCookie", 1, &v)?),
            _ => None,
        };
        let options = CookieOptions {
            name: name.to_string(),
            value: value.to_string(),
            path: get("path").and_then(|v| v.try_cast::<ImmutableString>()).map(|s| s.to_string()),
            domain: get("domain").and_then(|v| v.try_cast::<ImmutableString>()).map(|s| s.to_string()),
            max_age: get("maxAge").and_then(|v| v.as_int().ok()),
            expires,
            secure: get("secure").and_then(|v| v.as_bool().ok()).unwrap_or(false),
            http_only: get("httpOnly").and_then(|v| v.as_bool().ok()).unwrap_or(false),
            same_site: get("sameSite").and_then(|v| v.try_cast::<ImmutableString>()).map(|s| s.to_string()),
        };
        let writer = to_script(ctx.writer())?;
        to_script(writer.add_header("Set-Cookie", &cookie::format_set_cookie(&options)))
    });
    engine.register_fn("delCookie", |ctx: &mut Ctx, name: ImmutableString| -> Result<(), Box<EvalAltResult>> {
        let writer = to_script(ctx.writer())?;
        to_script(writer.add_header("Set-Cookie", &cookie::format_delete_cookie(&name)))
    });
    engine.register_fn("disableCache", |ctx: &mut Ctx| -> Result<(), Box<EvalAltResult>> {
        let writer = to_script(ctx.writer())?;
        to_script(writer.set_header("Cache-Control", "no-cache, no-store, must-revalidate"))?;
        to_script(writer.set_header("Pragma", "no-cache"))?;
        to_script(writer.set_header("Expires", "0"))
    });
    engine.register_fn("write", |ctx: &mut Ctx, value: Dynamic| -> Result<i64, Box<EvalAltResult>> {
        to_script(ctx.write_value(&value))
    });
    engine.register_fn("flush", |ctx: &mut Ctx| -> Result<(), Box<EvalAltResult>> {
        let writer = to_script(ctx.writer())?;
        let context = kit::require_current()?;
        to_script(writer.flush(&context.handle))
    });
    engine.register_fn("redirect", |ctx: &mut Ctx, target: ImmutableString| -> Result<(), Box<EvalAltResult>> {
        to_script(ctx.redirect_to(&target, 308))
    });
    engine.register_fn(
        "redirect",
        |ctx: &mut Ctx, target: ImmutableString, code: i64| -> Result<(), Box<EvalAltResult>> {
            to_script(ctx.redirect_to(&target, code))
        },
    );
    engine.register_fn("error", |ctx: &mut Ctx, code: i64| -> Result<(), Box<EvalAltResult>> {
        to_script(ctx.respond_error(code, ""))
    });
    engine.register_fn(
        "error",
        |ctx: &mut Ctx, code: i64, message: ImmutableString| -> Result<(), Box<EvalAltResult>> {
            to_script(ctx.respond_error(code, &message))
        },
    );
    engine.register_fn("serveFile", |ctx: &mut Ctx, path: ImmutableString| -> Result<(), Box<EvalAltResult>> {
        to_script(ctx.serve_path(Path::new(path.as_str()), None, None))
    });
    engine.register_fn(
        "serveFile",
        |ctx: &mut Ctx, path: ImmutableString, opts: Map| -> Result<(), Box<EvalAltResult>> {
            let root = opts
                .get("root")
                .cloned()
                .and_then(|v| v.try_cast::<ImmutableString>())
                .map(|s| PathBuf::from(s.to_string()));
            to_script(ctx.serve_path(Path::new(path.as_str()), root.as_deref(), None))
        },
    );
    engine.register_fn(
        "attachmentFile",
        |ctx: &mut Ctx, path: ImmutableString| -> Result<(), Box<EvalAltResult>> {
            let name = Path::new(path.as_str())
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| "download".to_string());
            to_script(ctx.serve_path(Path::new(path.as_str()), None, Some(&name)))
        },
    );
    engine.register_fn(
        "attachmentFile",
        |ctx: &mut Ctx, path: ImmutableString, name: ImmutableString| -> Result<(), Box<EvalAltResult>> {
            to_script(ctx.serve_path(Path::new(path.as_str()), None, Some(&name)))
        },
    );
    engine.register_fn(
        "uploadFile",
        |ctx: &mut Ctx, field: ImmutableString, dst: ImmutableString| -> Result<(), Box<EvalAltResult>> {
            upload_file(ctx, &field, &dst, None)
        },
    );
    engine.register_fn(
        "uploadFile",
        |ctx: &mut Ctx, field: ImmutableString, dst: ImmutableString, mode: i64| -> Result<(), Box<EvalAltResult>> {
            upload_file(ctx, &field, &dst, Some(mode))
        },
    );
    engine.register_fn("cors", |ctx: &mut Ctx, opts: Map| -> Result<(), Box<EvalAltResult>> {
        let writer = to_script(ctx.writer())?;
        let text = |key: &str, fallback: &str| {
            opts.get(key)
                .cloned()
                .and_then(|v| v.try_cast::<ImmutableString>())
                .map(|s| s.to_string())
                .unwrap_or_else(|| fallback.to_string())
        };
        to_script(writer.set_header("Access-Control-Allow-Origin", &text("origin", "*")))?;
        to_script(writer.set_header(
            "Access-Control-Allow-Methods",
            &text("methods", "GET, POST, PUT, PATCH, DELETE, HEAD, OPTIONS"),
        ))?;
        to_script(writer.set_header("Access-Control-Allow-Headers", &text("headers", "*")))?;
        if opts.get("credentials").and_then(|v| v.as_bool().ok()).unwrap_or(false) {
            to_script(writer.set_header("Access-Control-Allow-Credentials", "true"))?;
        }
        if let Some(max_age) = opts.get("maxAge").and_then(|v| v.as_int().ok()) {
            to_script(writer.set_header("Access-Control-Max-Age", &max_age.to_string()))?;
        }
        Ok(())
    });
    engine.register_fn("hijack", |ctx: &mut Ctx| -> Result<(), Box<EvalAltResult>> {
        to_script(ctx.do_hijack())
    });
    engine.register_fn("setData", |ctx: &mut Ctx, key: ImmutableString, value: Dynamic| {
        ctx.lock().data.insert(key.to_string(), value);
    });
    engine.register_fn("delData", |ctx: &mut Ctx, key: ImmutableString| {
        ctx.lock().data.remove(key.as_str());
    });
    engine.register_fn("setPath", |ctx: &mut Ctx, path: ImmutableString| {
        ctx.lock().path = path.to_string();
    });

    // ---- hijacked connection surface -------------------------------------
    engine.register_fn("read", |ctx: &mut Ctx| -> Result<rhai::Blob, Box<EvalAltResult>> {
        to_script(ctx.hijack_read(None))
    });
    engine.register_fn("read", |ctx: &mut Ctx, n: i64| -> Result<rhai::Blob, Box<EvalAltResult>> {
        to_script(ctx.hijack_read(Some(n.max(0) as usize)))
    });
    engine.register_fn("close", |ctx: &mut Ctx| -> Result<(), Box<EvalAltResult>> {
        to_script(ctx.hijack_close())
    });

    // ---- middleware continuation -----------------------------------------
    engine.register_fn(
        "next",
        |ncc: NativeCallContext, ctx: &mut Ctx| -> Result<Dynamic, Box<EvalAltResult>> {
            let Some((handler, depth)) = ctx.advance_chain() else {
                // one-shot: a repeated (or terminal) call is an observable no-op
                return Ok(Dynamic::UNIT);
            };
            let outcome = match handler {
                Handler::Script(fn_ptr) => {
                    fn_ptr.call_within_context::<Dynamic>(&ncc, (ctx.clone(),))
                }
                Handler::StaticDir(root) => ctx
                    .serve_static(root.as_path())
                    .map(|()| Dynamic::UNIT)
                    .map_err(Error::into_script),
            };
            ctx.restore_chain_depth(depth);
            outcome
        },
    );
}

fn upload_file(ctx: &Ctx, field: &str, dst: &str, mode: Option<i64>) -> Result<(), Box<EvalAltResult>> {
    let (body, content_type) = {
        let state = ctx.lock();
        (
            state.body.clone(),
            state
                .headers
                .get(http::header::CONTENT_TYPE)
                .and_then(|v| v.to_str().ok())
                .unwrap_or_default()
                .to_string(),
        )
    };
    let boundary = multipart::boundary_from_content_type(&content_type).ok_or_else(|| {
        kit::runtime_error(ErrorKind::ArgumentError, "request is not multipart/form-data")
    })?;
    let parts = multipart::parse(&body, &boundary).map_err(Error::into_script)?;
    let part = parts
        .into_iter()
        .find(|part| part.name == field && part.filename.is_some())
        .ok_or_else(|| {
            kit::runtime_error(ErrorKind::NotFound, format!("no uploaded file in field {field:?}"))
        })?;
    std::fs::write(dst, &part.data).map_err(|e| Error::from(e).into_script())?;
    #[cfg(unix)]
    if let Some(mode) = mode {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(mode as u32);
        std::fs::set_permissions(dst, perms).map_err(|e| Error::from(e).into_script())?;
    }
    #[cfg(not(unix))]
    let _ = mode;
    Ok(())
}
