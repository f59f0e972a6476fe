//! Shared test harness: run scripts on their own runtime thread and talk
//! plain HTTP/1.1 over std sockets.
#![allow(dead_code)]

use std::io::{Read, Write};
use std::net::TcpStream;
use std::path::Path;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use lug::prelude::*;

/// Run a script source on a dedicated thread with its own runtime
pub fn spawn_script(source: String) -> JoinHandle<Result<String>> {
    std::thread::spawn(move || {
        let runtime = tokio::runtime::Runtime::new()
            .map_err(|e| Error::new(ErrorKind::IOError, e.to_string()))?;
        let _entered = runtime.enter();
        let mut host = Host::new(HostOptions {
            mode: Mode::Test,
            ..Default::default()
        })?;
        host.run(&source, Some("test-script")).map(|value| value.to_string())
    })
}

/// Wait for the server script to publish its bound port
pub fn wait_for_port(port_file: &Path) -> u16 {
    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        if let Ok(text) = std::fs::read_to_string(port_file) {
            if let Ok(port) = text.trim().parse::<u16>() {
                return port;
            }
        }
        assert!(Instant::now() < deadline, "server never published its port");
        std::thread::sleep(Duration::from_millis(10));
    }
}

/// A decoded HTTP response
#[derive(Debug)]
pub struct TestResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: String,
}

impl TestResponse {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }
}

/// Send one request (Connection: close) and decode the response
pub fn http_request(port: u16, method: &str, target: &str, host: &str, body: &str) -> TestResponse {
    let mut stream = TcpStream::connect(("127.0.0.1", port)).expect("connect");
    stream
        .set_read_timeout(Some(Duration::from_secs(10)))
        .expect("read timeout");
    let request = format!(
        "{method} {target} HTTP/1.1\r\nHost: {host}\r\nConnection: close\r\nContent-Length: {}\r\n\r\n{body}",
        body.len()
    );
    stream.write_all(request.as_bytes()).expect("send request");

    let mut raw = Vec::new();
    stream.read_to_end(&mut raw).expect("read response");
    parse_response(&raw)
}

/// GET shorthand
pub fn http_get(port: u16, target: &str) -> TestResponse {
    http_request(port, "GET", target, "localhost", "")
}

fn parse_response(raw: &[u8]) -> TestResponse {
    let text = String::from_utf8_lossy(raw);
    let (head, body) = text
        .split_once("\r\n\r\n")
        .unwrap_or((text.as_ref(), ""));
    let mut lines = head.lines();
    let status_line = lines.next().unwrap_or_default();
    let status = status_line
        .split_whitespace()
        .nth(1)
        .and_then(|code| code.parse().ok())
        .unwrap_or(0);
    let headers = lines
        .filter_map(|line| {
            line.split_once(':')
                .map(|(key, value)| (key.trim().to_string(), value.trim().to_string()))
        })
        .collect::<Vec<_>>();

    // unchunk if necessary
    let body = if headers
        .iter()
        .any(|(key, value)| key.eq_ignore_ascii_case("transfer-encoding") && value.contains("chunked"))
    {
        unchunk(body)
    } else {
        body.to_string()
    };

    TestResponse { status, headers, body }
}

fn unchunk(body: &str) -> String {
    let mut out = String::new();
    let mut rest = body;
    loop {
        let Some((size_line, tail)) = rest.split_once("\r\n") else { break };
        let Ok(size) = usize::from_str_radix(size_line.trim(), 16) else { break };
        if size == 0 {
            break;
        }
        out.push_str(&tail[..size.min(tail.len())]);
        rest = tail.get(size + 2..).unwrap_or("");
    }
    out
}

/// Boilerplate prologue: create a server on an ephemeral port, publish the
/// port to `PORT_FILE`, and serve in the background until `GET /quit`.
pub fn server_script(routes: &str, config_extra: &str, port_file: &Path) -> String {
    let template = r#"
let app = server::create(#{ addr: ":0", logLevel: "silent"__CONFIG__ });
app.route("GET /quit", |ctx| { ctx.write("bye"); app.shutdown(); });
__ROUTES__
let wg = waitGroup::create();
wg.run(|| app.listen());
while app.port() == 0 { sleep(5); }
fs::write("__PORT_FILE__", `${app.port()}`);
wg.wait();
"ok"
"#;
    template
        .replace("__CONFIG__", config_extra)
        .replace("__ROUTES__", routes)
        .replace("__PORT_FILE__", &port_file.to_string_lossy())
}

/// Stop a server started with [`server_script`] and join the script thread
pub fn quit_server(port: u16, handle: JoinHandle<Result<String>>) {
    let response = http_get(port, "/quit");
    assert_eq!(response.status, 200, "quit endpoint failed");
    let outcome = handle.join().expect("script thread panicked");
    assert_eq!(outcome.expect("script failed"), "ok");
}
