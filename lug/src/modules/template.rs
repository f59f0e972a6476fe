//! `template` module: runtime HTML/text templates
//!
//! Inline sources render one-shot; file templates are compiled once and
//! cached by path.

use std::sync::Mutex;

use minijinja::Environment;
use once_cell::sync::Lazy;
use rhai::{Dynamic, Engine, EvalAltResult, ImmutableString, Module};

use crate::error::ErrorKind;
use crate::interp::kit;
use crate::interp::value;

static FILE_TEMPLATES: Lazy<Mutex<Environment<'static>>> = Lazy::new(|| Mutex::new(Environment::new()));

fn template_error(err: minijinja::Error) -> Box<EvalAltResult> {
    kit::runtime_error(ErrorKind::TemplateError, err.to_string())
}

fn render(source: ImmutableString, data: Dynamic) -> Result<ImmutableString, Box<EvalAltResult>> {
    let env = Environment::new();
    let template = env.template_from_str(&source).map_err(template_error)?;
    template
        .render(value::to_json(&data))
        .map(Into::into)
        .map_err(template_error)
}

fn render_file(path: ImmutableString, data: Dynamic) -> Result<ImmutableString, Box<EvalAltResult>> {
    {
        let env = FILE_TEMPLATES.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Ok(template) = env.get_template(&path) {
            return template
                .render(value::to_json(&data))
                .map(Into::into)
                .map_err(template_error);
        }
    }
    let source = std::fs::read_to_string(path.as_str())
        .map_err(|e| kit::runtime_error(ErrorKind::IOError, format!("cannot read template {path:?}: {e}")))?;
    let mut env = FILE_TEMPLATES.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
    env.add_template_owned(path.to_string(), source).map_err(template_error)?;
    let template = env.get_template(&path).map_err(template_error)?;
    template
        .render(value::to_json(&data))
        .map(Into::into)
        .map_err(template_error)
}

/// Register the `template` module
pub fn register(engine: &mut Engine) {
    let mut module = Module::new();
    module.set_native_fn("render", render);
    module.set_native_fn("renderFile", render_file);
    engine.register_static_module("template", module.into());
}

#[cfg(test)]
mod tests {
    use super::*;
    use rhai::Map;

    #[test]
    fn test_render_inline() {
        let mut data = Map::new();
        data.insert("name".into(), Dynamic::from("world"));
        let html = render("hello {{ name }}".into(), Dynamic::from_map(data)).unwrap();
        assert_eq!(html.as_str(), "hello world");
    }

    #[test]
    fn test_render_loop_and_conditional() {
        let data = value::to_dynamic(&serde_json::json!({"items": [1, 2, 3], "show": true}));
        let html = render(
            "{% if show %}{% for i in items %}[{{ i }}]{% endfor %}{% endif %}".into(),
            data,
        )
        .unwrap();
        assert_eq!(html.as_str(), "[1][2][3]");
    }

    #[test]
    fn test_bad_template_errors() {
        let err = render("{{ unclosed".into(), Dynamic::UNIT).unwrap_err();
        assert!(err.to_string().contains("template error"));
    }

    #[test]
    fn test_render_file_cached() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.html");
        std::fs::write(&path, "v={{ v }}").unwrap();
        let path_text = path.to_string_lossy().into_owned();
        let data = value::to_dynamic(&serde_json::json!({"v": 7}));
        assert_eq!(render_file(path_text.clone().into(), data.clone()).unwrap().as_str(), "v=7");
        // second render hits the cache even if the file disappears
        std::fs::remove_file(&path).unwrap();
        assert_eq!(render_file(path_text.into(), data).unwrap().as_str(), "v=7");
    }
}
