//! Preloaded script modules
//!
//! Every pooled interpreter gets the same surface: `fs`, `json`,
//! `request`, `server`, `sql`, `template`, `url`, `utf8`, `waitGroup`,
//! plus the request-context and database handle types those modules hand
//! out.

use rhai::Engine;

use crate::error::Result;

pub mod fs;
pub mod json;
pub mod request;
pub mod template;
pub mod url;
pub mod utf8;
pub mod wait_group;

pub use wait_group::WaitGroup;

/// Register every module and bridge type on a fresh engine
pub fn register_all(engine: &mut Engine) -> Result<()> {
    engine.register_fn("sleep", |millis: i64| {
        std::thread::sleep(std::time::Duration::from_millis(millis.max(0) as u64));
    });
    engine.register_fn("sleep", |seconds: f64| {
        if seconds.is_finite() && seconds > 0.0 {
            std::thread::sleep(std::time::Duration::from_secs_f64(seconds));
        }
    });
    fs::register(engine);
    json::register(engine);
    request::register(engine);
    template::register(engine);
    url::register(engine);
    utf8::register(engine);
    wait_group::register(engine);
    crate::http::context::register(engine);
    crate::http::server::register(engine);
    crate::sql::module::register(engine);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_all_modules_register() {
        let mut engine = Engine::new();
        register_all(&mut engine).unwrap();
        // namespaced calls resolve after registration
        let encoded: String = engine.eval(r#"json::encode(#{a: 1})"#).unwrap();
        assert_eq!(encoded, r#"{"a":1}"#);
        let length: i64 = engine.eval(r#"utf8::len("日本語")"#).unwrap();
        assert_eq!(length, 3);
    }
}
