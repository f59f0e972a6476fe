//! End-to-end server tests: real listeners on ephemeral ports, driven by
//! scripts, exercised over plain sockets.

mod common;

use std::time::{Duration, Instant};

use common::*;

#[test]
fn hello_route_and_server_header() {
    let dir = tempfile::tempdir().unwrap();
    let port_file = dir.path().join("port");
    let script = server_script(
        r#"app.route("GET /", |ctx| ctx.write("ok"));"#,
        "",
        &port_file,
    );
    let handle = spawn_script(script);
    let port = wait_for_port(&port_file);

    let response = http_get(port, "/");
    assert_eq!(response.status, 200);
    assert_eq!(response.body, "ok");
    let server = response.header("server").expect("server header");
    assert!(server.starts_with("lug/"), "got {server:?}");
    assert_eq!(
        response.header("content-type"),
        Some("text/html;charset=utf-8")
    );

    quit_server(port, handle);
}

#[test]
fn param_echo() {
    let dir = tempfile::tempdir().unwrap();
    let port_file = dir.path().join("port");
    let script = server_script(
        r#"app.route("GET /u/{id}", |ctx| ctx.write(ctx.param("id")));"#,
        "",
        &port_file,
    );
    let handle = spawn_script(script);
    let port = wait_for_port(&port_file);

    assert_eq!(http_get(port, "/u/42").body, "42");
    assert_eq!(http_get(port, "/u/hello").body, "hello");

    quit_server(port, handle);
}

#[test]
fn middleware_order_and_one_shot_next() {
    let dir = tempfile::tempdir().unwrap();
    let port_file = dir.path().join("port");
    let script = server_script(
        r#"
app.middleware(|ctx| {
    ctx.write("A");
    ctx.next();
    ctx.next();
    ctx.write("a");
});
app.middleware(|ctx| { ctx.write("B"); ctx.next(); ctx.write("b"); });
app.route("GET /", |ctx| ctx.write("H"));
app.route("GET /skip", |ctx| ctx.write("H"));
"#,
        "",
        &port_file,
    );
    let handle = spawn_script(script);
    let port = wait_for_port(&port_file);

    // A-pre, B-pre, handler, B-post, A-post; the duplicated next in A is a no-op
    let response = http_get(port, "/");
    assert_eq!(response.body, "ABHba");

    quit_server(port, handle);
}

#[test]
fn middleware_short_circuits_without_next() {
    let dir = tempfile::tempdir().unwrap();
    let port_file = dir.path().join("port");
    let script = server_script(
        r#"
app.middleware(|ctx| { ctx.write("A"); ctx.next(); ctx.write("a"); });
app.middleware(|ctx| { ctx.write("B"); ctx.write("b"); });
app.route("GET /", |ctx| ctx.write("H"));
"#,
        "",
        &port_file,
    );
    let handle = spawn_script(script);
    let port = wait_for_port(&port_file);

    // the second middleware never calls next, so the handler is skipped
    assert_eq!(http_get(port, "/").body, "ABba");

    quit_server(port, handle);
}

#[test]
fn static_route_beats_param_route() {
    let dir = tempfile::tempdir().unwrap();
    let port_file = dir.path().join("port");
    let script = server_script(
        r#"
app.route("GET /x/{id}", |ctx| ctx.write("param:" + ctx.param("id")));
app.route("GET /x/new", |ctx| ctx.write("static"));
"#,
        "",
        &port_file,
    );
    let handle = spawn_script(script);
    let port = wait_for_port(&port_file);

    assert_eq!(http_get(port, "/x/new").body, "static");
    assert_eq!(http_get(port, "/x/42").body, "param:42");

    quit_server(port, handle);
}

#[test]
fn regex_constraint_rejects_mismatch() {
    let dir = tempfile::tempdir().unwrap();
    let port_file = dir.path().join("port");
    let script = server_script(
        r#"app.route("GET /r/{id:[0-9]+}", |ctx| ctx.write(ctx.param("id")));"#,
        "",
        &port_file,
    );
    let handle = spawn_script(script);
    let port = wait_for_port(&port_file);

    assert_eq!(http_get(port, "/r/123").status, 200);
    let rejected = http_get(port, "/r/abc");
    assert_eq!(rejected.status, 404);
    assert!(rejected.body.contains("404"));

    quit_server(port, handle);
}

#[test]
fn wildcard_captures_remainder() {
    let dir = tempfile::tempdir().unwrap();
    let port_file = dir.path().join("port");
    let script = server_script(
        r#"app.route("GET /f/{p...}", |ctx| ctx.write("[" + ctx.param("p") + "]"));"#,
        "",
        &port_file,
    );
    let handle = spawn_script(script);
    let port = wait_for_port(&port_file);

    assert_eq!(http_get(port, "/f/a/b").body, "[a/b]");
    assert_eq!(http_get(port, "/f/").body, "[]");
    assert_eq!(http_get(port, "/f").status, 404);

    quit_server(port, handle);
}

#[test]
fn host_gating() {
    let dir = tempfile::tempdir().unwrap();
    let port_file = dir.path().join("port");
    let script = server_script(
        r#"app.route("GET h/ping", |ctx| ctx.write("pong"));"#,
        "",
        &port_file,
    );
    let handle = spawn_script(script);
    let port = wait_for_port(&port_file);

    assert_eq!(http_request(port, "GET", "/ping", "h", "").body, "pong");
    assert_eq!(http_request(port, "GET", "/ping", "other", "").status, 404);

    quit_server(port, handle);
}

#[test]
fn method_fallback_and_405() {
    let dir = tempfile::tempdir().unwrap();
    let port_file = dir.path().join("port");
    let script = server_script(
        r#"
app.route("GET /m", |ctx| ctx.write("get"));
app.route("* /m", |ctx| ctx.write("any"));
app.route("GET /strict", |ctx| ctx.write("get"));
"#,
        "",
        &port_file,
    );
    let handle = spawn_script(script);
    let port = wait_for_port(&port_file);

    assert_eq!(http_request(port, "GET", "/m", "localhost", "").body, "get");
    assert_eq!(http_request(port, "DELETE", "/m", "localhost", "").body, "any");
    assert_eq!(http_request(port, "PUT", "/strict", "localhost", "").status, 405);

    quit_server(port, handle);
}

#[test]
fn processing_timeout_yields_408() {
    let dir = tempfile::tempdir().unwrap();
    let port_file = dir.path().join("port");
    let script = server_script(
        r#"app.route("GET /slow", |ctx| { sleep(2000); ctx.write("late"); });"#,
        r#", processingTimeout: "100ms""#,
        &port_file,
    );
    let handle = spawn_script(script);
    let port = wait_for_port(&port_file);

    let started = Instant::now();
    let response = http_get(port, "/slow");
    let elapsed = started.elapsed();
    assert_eq!(response.status, 408);
    assert!(elapsed < Duration::from_millis(1500), "took {elapsed:?}");

    quit_server(port, handle);
}

#[test]
fn worker_semaphore_bounds_concurrency() {
    let dir = tempfile::tempdir().unwrap();
    let port_file = dir.path().join("port");
    let script = server_script(
        r#"app.route("GET /slow", |ctx| { sleep(300); ctx.write("done"); });"#,
        ", workers: 2",
        &port_file,
    );
    let handle = spawn_script(script);
    let port = wait_for_port(&port_file);

    let started = Instant::now();
    let clients: Vec<_> = (0..3)
        .map(|_| std::thread::spawn(move || http_get(port, "/slow")))
        .collect();
    for client in clients {
        let response = client.join().unwrap();
        assert_eq!(response.status, 200);
        assert_eq!(response.body, "done");
    }
    let elapsed = started.elapsed();
    // two run in parallel, the third waits for a permit
    assert!(elapsed >= Duration::from_millis(550), "took {elapsed:?}");

    quit_server(port, handle);
}

#[test]
fn response_write_guards() {
    let dir = tempfile::tempdir().unwrap();
    let port_file = dir.path().join("port");
    let script = server_script(
        r#"
app.route("GET /guard", |ctx| {
    ctx.write("body");
    let verdicts = "";
    try { ctx.setStatus(201); verdicts += "status-ok"; } catch (e) { verdicts += "status-blocked"; }
    try { ctx.redirect("/x", 250); verdicts += ",redirect-ok"; } catch (e) { verdicts += ",redirect-blocked"; }
    try { ctx.error(399); verdicts += ",error-ok"; } catch (e) { verdicts += ",error-blocked"; }
    ctx.setHeader("X-Verdicts", verdicts);
});
"#,
        "",
        &port_file,
    );
    let handle = spawn_script(script);
    let port = wait_for_port(&port_file);

    let response = http_get(port, "/guard");
    assert_eq!(response.status, 200);
    assert_eq!(
        response.header("x-verdicts"),
        Some("status-blocked,redirect-blocked,error-blocked")
    );

    quit_server(port, handle);
}

#[test]
fn redirect_defaults_to_308() {
    let dir = tempfile::tempdir().unwrap();
    let port_file = dir.path().join("port");
    let script = server_script(
        r#"app.route("GET /go", |ctx| ctx.redirect("/elsewhere"));"#,
        "",
        &port_file,
    );
    let handle = spawn_script(script);
    let port = wait_for_port(&port_file);

    let response = http_get(port, "/go");
    assert_eq!(response.status, 308);
    assert_eq!(response.header("location"), Some("/elsewhere"));

    quit_server(port, handle);
}

#[test]
fn script_error_becomes_500() {
    let dir = tempfile::tempdir().unwrap();
    let port_file = dir.path().join("port");
    let script = server_script(
        r#"app.route("GET /boom", |ctx| { throw "kaput"; });"#,
        "",
        &port_file,
    );
    let handle = spawn_script(script);
    let port = wait_for_port(&port_file);

    let response = http_get(port, "/boom");
    assert_eq!(response.status, 500);
    assert!(response.body.contains("500"));

    quit_server(port, handle);
}

#[test]
fn static_files_with_strip_prefix() {
    let dir = tempfile::tempdir().unwrap();
    let port_file = dir.path().join("port");
    let web_root = dir.path().join("public");
    std::fs::create_dir_all(web_root.join("css")).unwrap();
    std::fs::write(web_root.join("css/site.css"), "body{color:red}").unwrap();

    let routes = format!(
        r#"app.files("GET /static/{{p...}}", "{}");"#,
        web_root.to_string_lossy()
    );
    let script = server_script(&routes, "", &port_file);
    let handle = spawn_script(script);
    let port = wait_for_port(&port_file);

    let response = http_get(port, "/static/css/site.css");
    assert_eq!(response.status, 200);
    assert_eq!(response.body, "body{color:red}");
    assert_eq!(response.header("content-type"), Some("text/css"));

    let traversal = http_get(port, "/static/../port");
    assert_ne!(traversal.status, 200);

    quit_server(port, handle);
}

#[test]
fn lifecycle_hooks_run() {
    let dir = tempfile::tempdir().unwrap();
    let port_file = dir.path().join("port");
    let script = server_script(
        r#"app.route("GET /hooked", |ctx| ctx.write(ctx.getData("stamp")));"#,
        r#", onRequest: |ctx| ctx.setData("stamp", "from-hook")"#,
        &port_file,
    );
    let handle = spawn_script(script);
    let port = wait_for_port(&port_file);

    assert_eq!(http_get(port, "/hooked").body, "from-hook");

    quit_server(port, handle);
}

#[test]
fn query_headers_and_form() {
    let dir = tempfile::tempdir().unwrap();
    let port_file = dir.path().join("port");
    let script = server_script(
        r#"
app.route("GET /echo", |ctx| {
    ctx.write(ctx.query("a") + "|" + ctx.getHeader("x-probe"));
});
app.route("POST /form", |ctx| {
    let form = ctx.postForm();
    ctx.write(form["name"] + "/" + form["city"]);
});
"#,
        "",
        &port_file,
    );
    let handle = spawn_script(script);
    let port = wait_for_port(&port_file);

    let mut stream = std::net::TcpStream::connect(("127.0.0.1", port)).unwrap();
    use std::io::{Read, Write};
    stream
        .write_all(b"GET /echo?a=one&b=two HTTP/1.1\r\nHost: h\r\nX-Probe: pong\r\nConnection: close\r\n\r\n")
        .unwrap();
    let mut raw = Vec::new();
    stream.read_to_end(&mut raw).unwrap();
    let text = String::from_utf8_lossy(&raw);
    assert!(text.ends_with("one|pong"), "got {text}");

    let form = "name=ada&city=london";
    let mut stream = std::net::TcpStream::connect(("127.0.0.1", port)).unwrap();
    let request = format!(
        "POST /form HTTP/1.1\r\nHost: h\r\nConnection: close\r\nContent-Type: application/x-www-form-urlencoded\r\nContent-Length: {}\r\n\r\n{form}",
        form.len()
    );
    stream.write_all(request.as_bytes()).unwrap();
    let mut raw = Vec::new();
    stream.read_to_end(&mut raw).unwrap();
    let text = String::from_utf8_lossy(&raw);
    assert!(text.ends_with("ada/london"), "got {text}");

    quit_server(port, handle);
}
