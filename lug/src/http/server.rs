//! Server engine
//!
//! The engine owns the listener and the per-connection tasks. Request
//! handlers are script callables: each request borrows an interpreter
//! cloned from the registering script, runs the composed middleware chain
//! on a blocking thread gated by the worker semaphore, and races the
//! per-request processing deadline. Shutdown, whether from SIGINT/SIGTERM
//! or a script calling `shutdown()`, converges on one cancellation token:
//! the listener closes, in-flight handlers drain up to the shutdown
//! budget, then the engine force-closes.

use std::panic::{self, AssertUnwindSafe};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use bytes::BytesMut;
use rhai::{Dynamic, Engine, EvalAltResult, FnPtr, ImmutableString, Map, Module};
use tokio::net::TcpListener;
use tokio::signal;
use tokio::sync::Semaphore;
use tokio::time::timeout;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::config::{LogLevel, Mode, ServerConfig};
use crate::error::{Error, ErrorKind, Result};
use crate::http::conn::{self, ParsedRequest};
use crate::http::context::{Ctx, RequestParts};
use crate::http::middleware::{Chain, Handler};
use crate::http::pages;
use crate::http::response::{ConnStream, IoSlot, ResponseWriter};
use crate::interp::kit::{self, ExecContext, ScriptImage};
use crate::interp::pool;
use crate::router::pattern::{Pattern, SegmentKind};
use crate::router::Router;

/// Lifecycle callbacks from the server configuration map
#[derive(Default, Clone)]
struct Hooks {
    on_request: Option<FnPtr>,
    on_error: Option<FnPtr>,
    on_success: Option<FnPtr>,
    on_shutdown: Option<FnPtr>,
}

struct AppInner {
    config: ServerConfig,
    hooks: Hooks,
    router: Router<Chain>,
    middlewares: Mutex<Vec<FnPtr>>,
    image: ScriptImage,
    mode: Mode,
    shutdown: CancellationToken,
    shutdown_started: AtomicBool,
    draining: AtomicBool,
    bound: OnceLock<std::net::SocketAddr>,
}

/// Script-facing server handle
#[derive(Clone)]
pub struct App {
    inner: Arc<AppInner>,
}

impl std::fmt::Debug for App {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("App").finish_non_exhaustive()
    }
}

impl App {
    fn new(config: ServerConfig, hooks: Hooks, image: ScriptImage, mode: Mode) -> Self {
        Self {
            inner: Arc::new(AppInner {
                config,
                hooks,
                router: Router::new(),
                middlewares: Mutex::new(Vec::new()),
                image,
                mode,
                shutdown: CancellationToken::new(),
                shutdown_started: AtomicBool::new(false),
                draining: AtomicBool::new(false),
                bound: OnceLock::new(),
            }),
        }
    }

    fn register_route(&self, spec: &str, handler: Handler) -> Result<()> {
        let (method, pattern) = split_route_spec(spec);
        let middlewares = self
            .inner
            .middlewares
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone();
        let chain = Chain::compose(&middlewares, handler);
        self.inner.router.insert(&method, &pattern, chain, None)
    }

    fn register_files(&self, spec: &str, root: &str) -> Result<()> {
        let (method, pattern) = split_route_spec(spec);
        let parsed = Pattern::parse(&pattern)?;
        if parsed.segments.last().map(|s| s.kind) != Some(SegmentKind::Wild) {
            return Err(Error::new(
                ErrorKind::ArgumentError,
                "file route pattern must end with a {name...} segment",
            ));
        }
        let strip = pattern
            .rfind("/{")
            .map(|idx| pattern[..idx].to_string())
            .filter(|prefix| prefix.starts_with('/'));
        let middlewares = self
            .inner
            .middlewares
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone();
        let chain = Chain::compose(&middlewares, Handler::StaticDir(Arc::new(PathBuf::from(root))));
        self.inner.router.insert(&method, &pattern, chain, strip)
    }

    fn add_middleware(&self, fn_ptr: FnPtr) {
        self.inner
            .middlewares
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(fn_ptr);
    }

    fn trigger_shutdown(&self, reason: &str) {
        if !self.inner.shutdown_started.swap(true, Ordering::SeqCst) {
            tracing::info!("shutdown requested ({reason})");
            self.inner.shutdown.cancel();
        }
    }

    /// The bound socket address, once listening
    pub fn bound_addr(&self) -> Option<std::net::SocketAddr> {
        self.inner.bound.get().copied()
    }
}

fn split_route_spec(spec: &str) -> (String, String) {
    match spec.split_once(char::is_whitespace) {
        Some((method, rest)) if !method.is_empty() && !method.contains('/') => {
            (method.to_ascii_uppercase(), rest.trim().to_string())
        }
        _ => ("*".to_string(), spec.trim().to_string()),
    }
}

// ---- serving ---------------------------------------------------------------

async fn run(server: Arc<AppInner>) -> Result<()> {
    eprintln!("DEBUG: run() start, addr={}", server.config.bind_addr());
    let listener = TcpListener::bind(server.config.bind_addr()).await?;
    eprintln!("DEBUG: bound ok");
    let local_addr = listener.local_addr()?;
    let _ = server.bound.set(local_addr);
    eprintln!("DEBUG: bound.set done, local_addr={local_addr}, inner_ptr={:p}", Arc::as_ptr(&server));
    tracing::info!("lug server listening on {local_addr}");

    let tls = if server.config.tls_enabled() {
        Some(build_tls_acceptor(&server.config)?)
    } else {
        None
    };

    let semaphore = Arc::new(Semaphore::new(server.config.workers.max(1)));
    let app = App { inner: server.clone() };
    tokio::spawn(async move {
        shutdown_signal().await;
        app.trigger_shutdown("signal");
    });

    let tracker = TaskTracker::new();
    loop {
        tokio::select! {
            _ = server.shutdown.cancelled() => break,
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, peer)) => {
                        let server = server.clone();
                        let semaphore = semaphore.clone();
                        let tls = tls.clone();
                        tracker.spawn(async move {
                            handle_connection(server, semaphore, tls, stream, peer, local_addr.port()).await;
                        });
                    }
                    Err(e) => {
                        tracing::warn!("accept error: {e}");
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                }
            }
        }
    }

    // stop accepting, disable keep-alives, drain in-flight handlers
    drop(listener);
    server.draining.store(true, Ordering::SeqCst);
    tracker.close();
    let drained = timeout(server.config.shutdown_timeout.get(), tracker.wait())
        .await
        .is_ok();
    if drained {
        tracing::info!("server drained cleanly");
    } else {
        tracing::error!("shutdown timed out with handlers still in flight");
    }
    report_shutdown(&server, drained).await;
    Ok(())
}

async fn report_shutdown(server: &Arc<AppInner>, drained: bool) {
    let message = if drained {
        "graceful shutdown complete".to_string()
    } else {
        "shutdown timed out; handlers force-closed".to_string()
    };
    if !drained {
        if let Some(hook) = server.hooks.on_error.clone() {
            call_hook(server, hook, Dynamic::from(message.clone())).await;
        }
    }
    if let Some(hook) = server.hooks.on_shutdown.clone() {
        call_hook(server, hook, Dynamic::from(message)).await;
    }
}

async fn call_hook(server: &Arc<AppInner>, fn_ptr: FnPtr, arg: Dynamic) {
    let image = server.image.clone();
    let mode = server.mode;
    let _ = tokio::task::spawn_blocking(move || {
        let Ok(exec) = ExecContext::new(image.clone(), mode) else {
            return;
        };
        let _guard = kit::enter(exec);
        if let Ok(interp) = pool::clone_from(&image) {
            if let Err(err) = interp.call_fn(&fn_ptr, (arg,)) {
                tracing::warn!("lifecycle hook failed: {err}");
            }
        }
    })
    .await;
}

fn build_tls_acceptor(config: &ServerConfig) -> Result<TlsAcceptor> {
    use rustls_pemfile::{certs, private_key};
    use std::fs::File;
    use std::io::BufReader;
    use tokio_rustls::rustls;

    let (cert_path, key_path) = match (&config.cert_file, &config.key_file) {
        (Some(cert), Some(key)) => (cert, key),
        _ => return Err(Error::new(ErrorKind::ArgumentError, "TLS requires certFile and keyFile")),
    };

    let cert_file = File::open(cert_path)
        .map_err(|e| Error::new(ErrorKind::IOError, format!("cannot open cert file {cert_path:?}: {e}")))?;
    let cert_chain: Vec<rustls::pki_types::CertificateDer<'static>> =
        certs(&mut BufReader::new(cert_file))
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| Error::new(ErrorKind::IOError, format!("cannot parse certificates: {e}")))?;
    if cert_chain.is_empty() {
        return Err(Error::new(ErrorKind::IOError, "cert file contains no certificates"));
    }

    let key_file = File::open(key_path)
        .map_err(|e| Error::new(ErrorKind::IOError, format!("cannot open key file {key_path:?}: {e}")))?;
    let key = private_key(&mut BufReader::new(key_file))
        .map_err(|e| Error::new(ErrorKind::IOError, format!("cannot parse private key: {e}")))?
        .ok_or_else(|| Error::new(ErrorKind::IOError, "key file contains no private key"))?;

    // rustls defaults negotiate TLS 1.2 and 1.3 only
    let tls_config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(cert_chain, key)
        .map_err(|e| Error::new(ErrorKind::IOError, format!("cannot build TLS config: {e}")))?;
    Ok(TlsAcceptor::from(Arc::new(tls_config)))
}

async fn handle_connection(
    server: Arc<AppInner>,
    semaphore: Arc<Semaphore>,
    tls: Option<TlsAcceptor>,
    tcp: tokio::net::TcpStream,
    peer: std::net::SocketAddr,
    local_port: u16,
) {
    let scheme: &'static str = if tls.is_some() { "https" } else { "http" };
    let stream: Box<dyn ConnStream> = match tls {
        Some(acceptor) => {
            match timeout(server.config.read_timeout.get(), acceptor.accept(tcp)).await {
                Ok(Ok(tls_stream)) => Box::new(tls_stream),
                Ok(Err(e)) => {
                    tracing::warn!("TLS handshake failed from {peer}: {e}");
                    return;
                }
                Err(_) => {
                    tracing::warn!("TLS handshake timed out from {peer}");
                    return;
                }
            }
        }
        None => Box::new(tcp),
    };

    let io: IoSlot = Arc::new(tokio::sync::Mutex::new(Some(stream)));
    let mut buf = BytesMut::new();
    let mut first = true;

    loop {
        let wait = if first {
            server.config.read_timeout.get()
        } else {
            server.config.idle_timeout.get()
        };
        first = false;

        // idle connections must not outlive shutdown
        let read_result = tokio::select! {
            _ = server.shutdown.cancelled() => None,
            result = timeout(wait, conn::read_request(&io, &mut buf)) => Some(result),
        };
        let request = match read_result {
            None | Some(Err(_)) => break,
            Some(Ok(Err(err))) => {
                if err.kind() != ErrorKind::Hijacked {
                    tracing::debug!("connection error from {peer}: {err}");
                }
                break;
            }
            Some(Ok(Ok(None))) => break,
            Some(Ok(Ok(Some(request)))) => request,
        };

        let keep = handle_request(&server, &semaphore, &io, &buf, request, peer, local_port, scheme).await;
        if !keep || server.draining.load(Ordering::SeqCst) {
            break;
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn handle_request(
    server: &Arc<AppInner>,
    semaphore: &Arc<Semaphore>,
    io: &IoSlot,
    leftover: &BytesMut,
    request: ParsedRequest,
    peer: std::net::SocketAddr,
    local_port: u16,
    scheme: &'static str,
) -> bool {
    let writer = ResponseWriter::new(io.clone(), request.version);
    let request_keep_alive = request.keep_alive;
    let method = request.method.clone();
    let log_path = request.path.clone();

    let ctx = Ctx::acquire(
        RequestParts {
            method: request.method,
            path: request.path,
            raw_query: request.raw_query,
            proto: request.proto,
            headers: request.headers,
            remote_addr: peer.to_string(),
            local_port,
            scheme,
            body: request.body,
            leftover: leftover.to_vec(),
        },
        writer.clone(),
        server.config.error_template.clone(),
    );

    let deadline = server.config.processing_timeout.get();
    let worker = {
        let server = server.clone();
        let semaphore = semaphore.clone();
        let ctx = ctx.clone();
        tokio::spawn(async move {
            let permit = match timeout(deadline, semaphore.acquire_owned()).await {
                Ok(Ok(permit)) => permit,
                _ => {
                    ctx.record_failure(&Error::new(ErrorKind::ConcurrencyLimit, "concurrency limit"));
                    return;
                }
            };
            let blocking_server = server.clone();
            let blocking_ctx = ctx.clone();
            let joined =
                tokio::task::spawn_blocking(move || run_handler(blocking_server, blocking_ctx)).await;
            drop(permit);
            if joined.is_err() {
                ctx.record_failure(&Error::new(ErrorKind::Panic, "handler task panicked"));
            }
        })
    };

    tokio::pin!(worker);
    let timed_out = tokio::select! {
        _ = &mut worker => false,
        _ = tokio::time::sleep(deadline) => true,
    };

    if timed_out {
        // the handler may still be running; poison its writer and answer now
        writer.mark_timed_out();
        let err = Error::new(ErrorKind::Timeout, "request timeout");
        ctx.record_failure(&err);
        let page = {
            let template = server.config.error_template.clone();
            pages::render_error_page(408, "request timeout", template.as_deref())
        };
        writer.overwrite(408, page.as_bytes());
        let _ = writer.finalize(false).await;
        log_request(server, &method, &log_path, &writer, &ctx, peer);
        return false;
    }

    if writer.hijacked() || ctx.hijacked() {
        log_request(server, &method, &log_path, &writer, &ctx, peer);
        ctx.release();
        return false;
    }

    ctx.finalize_error_body();
    let allow_keep_alive = request_keep_alive && !server.draining.load(Ordering::SeqCst);
    let keep = match writer.finalize(allow_keep_alive).await {
        Ok((_, keep)) => keep,
        Err(err) => {
            tracing::debug!("response write failed for {peer}: {err}");
            false
        }
    };
    log_request(server, &method, &log_path, &writer, &ctx, peer);
    ctx.release();
    keep
}

fn log_request(
    server: &Arc<AppInner>,
    method: &str,
    path: &str,
    writer: &ResponseWriter,
    ctx: &Ctx,
    peer: std::net::SocketAddr,
) {
    let status = writer.status();
    let bytes = writer.bytes_written();
    let elapsed = ctx.elapsed();
    match server.config.log_level {
        LogLevel::Silent => {}
        LogLevel::Error => {
            if status >= 400 {
                tracing::error!(
                    %peer, method, path, status, bytes,
                    elapsed_ms = elapsed.as_millis() as u64,
                    error = %ctx.status_error(),
                    "request failed"
                );
            }
        }
        LogLevel::Info => {
            if status >= 400 {
                tracing::error!(
                    %peer, method, path, status, bytes,
                    elapsed_ms = elapsed.as_millis() as u64,
                    error = %ctx.status_error(),
                    "request failed"
                );
            } else {
                tracing::info!(
                    %peer, method, path, status, bytes,
                    elapsed_ms = elapsed.as_millis() as u64,
                    status_text = crate::error::status_text(status),
                    "request"
                );
            }
        }
    }
}

fn run_handler(server: Arc<AppInner>, ctx: Ctx) {
    let exec = match ExecContext::new(server.image.clone(), server.mode) {
        Ok(exec) => exec,
        Err(err) => {
            ctx.record_failure(&err);
            return;
        }
    };
    let _guard = kit::enter(exec);

    let interp = match pool::clone_from(&server.image) {
        Ok(interp) => interp,
        Err(err) => {
            ctx.record_failure(&err);
            return;
        }
    };

    let method = ctx.method_name();
    let host = ctx.host_name();
    let path = ctx.current_path();
    let found = match server.router.find(&host, &method, &path) {
        Ok(found) => found,
        Err(err) => {
            ctx.record_failure(&err);
            return;
        }
    };
    if let Some(prefix) = &found.strip_prefix {
        ctx.strip_prefix(prefix);
    }
    ctx.set_route(found.params, found.pattern);

    if let Some(hook) = &server.hooks.on_request {
        if let Err(err) = interp.call_fn(hook, (ctx.clone(),)) {
            tracing::warn!("onRequest hook failed: {err}");
        }
    }

    let outcome = panic::catch_unwind(AssertUnwindSafe(|| found.handler.run(&interp, ctx.clone())));
    match outcome {
        Ok(Ok(())) => {}
        Ok(Err(script_err)) => {
            ctx.record_failure(&Error::Script(script_err.to_string()));
        }
        Err(payload) => {
            ctx.record_failure(&Error::new(
                ErrorKind::Panic,
                format!("handler panicked: {}", describe_panic(payload)),
            ));
        }
    }

    let status = ctx.response_status();
    let hook = if status >= 400 {
        server.hooks.on_error.clone()
    } else {
        server.hooks.on_success.clone()
    };
    if let Some(hook) = hook {
        if let Err(err) = interp.call_fn(&hook, (ctx.clone(),)) {
            tracing::warn!("lifecycle hook failed: {err}");
        }
    }
}

fn describe_panic(payload: Box<dyn std::any::Any + Send>) -> String {
    match payload.downcast::<String>() {
        Ok(message) => *message,
        Err(payload) => match payload.downcast::<&'static str>() {
            Ok(message) => (*message).to_string(),
            Err(_) => "unknown panic".to_string(),
        },
    }
}

/// Wait for SIGINT or SIGTERM
async fn shutdown_signal() {
    let ctrl_c = async {
        if signal::ctrl_c().await.is_err() {
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

// ---- script surface --------------------------------------------------------

fn take_hook(config: &mut Map, key: &str) -> Result<Option<FnPtr>> {
    match config.remove(key) {
        Some(value) if !value.is_unit() => value
            .try_cast::<FnPtr>()
            .map(Some)
            .ok_or_else(|| Error::new(ErrorKind::ArgumentError, format!("{key} must be a function"))),
        _ => Ok(None),
    }
}

fn create_app(config: Map) -> std::result::Result<App, Box<EvalAltResult>> {
    let exec = kit::require_current()?;
    let mut config = config;
    let hooks = Hooks {
        on_request: take_hook(&mut config, "onRequest").map_err(Error::into_script)?,
        on_error: take_hook(&mut config, "onError").map_err(Error::into_script)?,
        on_success: take_hook(&mut config, "onSuccess").map_err(Error::into_script)?,
        on_shutdown: take_hook(&mut config, "onShutdown").map_err(Error::into_script)?,
    };
    let config: ServerConfig = rhai::serde::from_dynamic(&Dynamic::from_map(config))?;
    Ok(App::new(config, hooks, exec.image, exec.mode))
}

/// Register the `server` module and the server handle type
pub fn register(engine: &mut Engine) {
    engine.register_type_with_name::<App>("Server");

    engine.register_fn(
        "route",
        |app: &mut App, spec: ImmutableString, handler: FnPtr| -> std::result::Result<(), Box<EvalAltResult>> {
            app.register_route(&spec, Handler::Script(handler)).map_err(Error::into_script)
        },
    );
    engine.register_fn("middleware", |app: &mut App, fn_ptr: FnPtr| {
        app.add_middleware(fn_ptr);
    });
    engine.register_fn(
        "files",
        |app: &mut App, spec: ImmutableString, root: ImmutableString| -> std::result::Result<(), Box<EvalAltResult>> {
            app.register_files(&spec, &root).map_err(Error::into_script)
        },
    );
    engine.register_fn("listen", |app: &mut App| -> std::result::Result<(), Box<EvalAltResult>> {
        let inner = app.inner.clone();
        kit::block_on(run(inner))?.map_err(Error::into_script)
    });
    engine.register_fn("shutdown", |app: &mut App| {
        app.trigger_shutdown("script");
    });
    engine.register_fn("port", |app: &mut App| -> i64 {
        let p = app.bound_addr().map(|addr| addr.port() as i64).unwrap_or(0);
        eprintln!("DEBUG: port() called, returning {p}, inner_ptr={:p}", Arc::as_ptr(&app.inner));
        p
    });

    let mut module = Module::new();
    module.set_native_fn("create", |config: Map| create_app(config));
    module.set_native_fn("create", || create_app(Map::new()));
    engine.register_static_module("server", module.into());
}
