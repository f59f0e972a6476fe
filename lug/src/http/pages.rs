//! Error page rendering
//!
//! Failed requests render an HTML template with `StatusCode`, `StatusText`
//! and `StatusError` bindings. A per-server template path overrides the
//! built-in page; if rendering itself fails, the engine falls back to plain
//! text so a broken template can never mask the status.

use std::sync::Mutex;

use minijinja::{context, Environment};
use once_cell::sync::Lazy;

use crate::error::status_text;

/// Built-in error page
pub const DEFAULT_ERROR_TEMPLATE: &str = r#"<!DOCTYPE html>
<html>
<head><title>{{ StatusCode }} {{ StatusText }}</title></head>
<body>
<center><h1>{{ StatusCode }} {{ StatusText }}</h1></center>
{% if StatusError %}<center><p>{{ StatusError }}</p></center>{% endif %}
<hr><center>{{ Server }}</center>
</body>
</html>
"#;

static TEMPLATES: Lazy<Mutex<Environment<'static>>> = Lazy::new(|| {
    let mut env = Environment::new();
    // the built-in page is infallible by construction
    let _ = env.add_template("__default__", DEFAULT_ERROR_TEMPLATE);
    Mutex::new(env)
});

fn render_named(name: &str, status: u16, error: &str) -> Result<String, minijinja::Error> {
    let env = TEMPLATES
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner());
    let template = env.get_template(name)?;
    template.render(context! {
        StatusCode => status,
        StatusText => status_text(status),
        StatusError => error,
        Server => crate::http::response::server_header(),
    })
}

/// Render the error page for a status, using the override template when set
pub fn render_error_page(status: u16, error: &str, template_path: Option<&str>) -> String {
    if let Some(path) = template_path {
        match ensure_file_template(path) {
            Ok(()) => match render_named(path, status, error) {
                Ok(html) => return html,
                Err(render_err) => {
                    tracing::warn!("error template {path:?} failed to render: {render_err}");
                }
            },
            Err(load_err) => {
                tracing::warn!("error template {path:?} failed to load: {load_err}");
            }
        }
    }
    match render_named("__default__", status, error) {
        Ok(html) => html,
        Err(_) => format!("{status} {}\n", status_text(status)),
    }
}

fn ensure_file_template(path: &str) -> crate::error::Result<()> {
    {
        let env = TEMPLATES
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if env.get_template(path).is_ok() {
            return Ok(());
        }
    }
    let source = std::fs::read_to_string(path)?;
    let mut env = TEMPLATES
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner());
    env.add_template_owned(path.to_string(), source)?;
    Ok(())
}
