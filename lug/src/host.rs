//! Host-side script execution
//!
//! The CLI (and tests) drive scripts through this module: compile a
//! source, install the execution context, and run it against a persistent
//! scope so `-l` libraries, `-e` statements, the script itself and REPL
//! lines share state.

use rhai::{Array, Dynamic, Map, Scope, AST};

use crate::config::Mode;
use crate::error::{Error, ErrorKind, Result};
use crate::interp::kit::{self, ExecContext, ScriptImage};
use crate::interp::pool::{self, PooledInterp};

/// Options governing one host session
#[derive(Debug, Clone, Default)]
pub struct HostOptions {
    /// Debug-print routing mode
    pub mode: Mode,
    /// Script resource budget in megabytes (`-m`); `None` means unlimited
    pub memory_cap_mb: Option<u64>,
}

/// A borrowed interpreter plus the persistent evaluation scope
pub struct Host {
    interp: PooledInterp,
    options: HostOptions,
    scope: Scope<'static>,
}

impl Host {
    /// Borrow an interpreter and apply the session options
    pub fn new(options: HostOptions) -> Result<Self> {
        let mut interp = pool::acquire()?;
        if let Some(cap_mb) = options.memory_cap_mb {
            apply_memory_cap(interp.engine_mut(), cap_mb);
        }
        Ok(Self {
            interp,
            options,
            scope: Scope::new(),
        })
    }

    /// Expose the script argument vector
    ///
    /// `arg` is a map keyed by stringified indices: `"0"` is the script
    /// path, positives are script arguments, negatives are the host argv.
    /// `argv` carries the script arguments as a plain array.
    pub fn set_args(&mut self, host_argv: &[String], script_path: &str, script_args: &[String]) {
        let mut arg = Map::new();
        for (offset, value) in host_argv.iter().rev().enumerate() {
            let index = -(offset as i64 + 1);
            arg.insert(index.to_string().into(), Dynamic::from(value.clone()));
        }
        arg.insert("0".into(), Dynamic::from(script_path.to_string()));
        for (offset, value) in script_args.iter().enumerate() {
            arg.insert((offset as i64 + 1).to_string().into(), Dynamic::from(value.clone()));
        }
        let argv: Array = script_args.iter().map(|value| Dynamic::from(value.clone())).collect();
        self.scope.push("arg", arg);
        self.scope.push("argv", argv);
    }

    /// Compile a source unit
    pub fn compile(&self, source: &str, name: Option<&str>) -> Result<AST> {
        let mut ast = self
            .interp
            .engine()
            .compile(source)
            .map_err(|e| Error::Script(e.to_string()))?;
        if let Some(name) = name {
            ast.set_source(name);
        }
        Ok(ast)
    }

    /// Compile and run a source unit against the persistent scope
    pub fn run(&mut self, source: &str, name: Option<&str>) -> Result<Dynamic> {
        let ast = self.compile(source, name)?;
        self.run_ast(ast)
    }

    /// Run a compiled unit against the persistent scope
    pub fn run_ast(&mut self, ast: AST) -> Result<Dynamic> {
        let image = ScriptImage::new(ast);
        let exec = ExecContext::new(image.clone(), self.options.mode)?;
        let _guard = kit::enter(exec);
        self.interp
            .engine()
            .eval_ast_with_scope::<Dynamic>(&mut self.scope, image.ast())
            .map_err(|e| Error::Script(e.to_string()))
    }

    /// Read and run a script file
    pub fn run_file(&mut self, path: &str) -> Result<Dynamic> {
        let source = std::fs::read_to_string(path)
            .map_err(|e| Error::new(ErrorKind::IOError, format!("cannot read {path:?}: {e}")))?;
        self.run(&source, Some(path))
    }

    /// Dump a compile tree, optionally with full optimization applied
    pub fn dump_ast(&mut self, source: &str, optimized: bool) -> Result<String> {
        let engine = self.interp.engine_mut();
        let level = if optimized {
            rhai::OptimizationLevel::Full
        } else {
            rhai::OptimizationLevel::None
        };
        let previous = engine.optimization_level();
        engine.set_optimization_level(level);
        let compiled = engine.compile(source);
        engine.set_optimization_level(previous);
        let ast = compiled.map_err(|e| Error::Script(e.to_string()))?;
        Ok(format!("{ast:#?}"))
    }

    /// The run mode of this session
    pub fn mode(&self) -> Mode {
        self.options.mode
    }
}

/// Scale engine limits from a megabyte budget
///
/// The interpreter meters sizes and depths rather than bytes, so the cap
/// bounds the dominant growth vectors: string/array/map sizes and
/// expression nesting.
fn apply_memory_cap(engine: &mut rhai::Engine, cap_mb: u64) {
    let budget_bytes = cap_mb.saturating_mul(1024 * 1024);
    let max_len = usize::try_from(budget_bytes / 16).unwrap_or(usize::MAX).max(1024);
    engine.set_max_string_size(max_len);
    engine.set_max_array_size(max_len);
    engine.set_max_map_size(max_len);
    engine.set_max_expr_depths(128, 64);
    engine.set_max_call_levels(256);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn runtime() -> tokio::runtime::Runtime {
        tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .enable_all()
            .build()
            .unwrap()
    }

    #[test]
    fn test_scope_persists_across_runs() {
        let rt = runtime();
        let _entered = rt.enter();
        let mut host = Host::new(HostOptions { mode: Mode::Test, ..Default::default() }).unwrap();
        host.run("let counter = 1;", None).unwrap();
        let result = host.run("counter + 41", None).unwrap();
        assert_eq!(result.as_int().unwrap(), 42);
    }

    #[test]
    fn test_args_visible_to_scripts() {
        let rt = runtime();
        let _entered = rt.enter();
        let mut host = Host::new(HostOptions::default()).unwrap();
        host.set_args(
            &["lug".to_string()],
            "script.rhai",
            &["alpha".to_string(), "beta".to_string()],
        );
        let result = host.run(r#"arg["0"] + ":" + arg["1"] + ":" + arg["-1"]"#, None).unwrap();
        assert_eq!(result.to_string(), "script.rhai:alpha:lug");
        let count = host.run("argv.len", None).unwrap();
        assert_eq!(count.as_int().unwrap(), 2);
    }

    #[test]
    fn test_script_error_reported() {
        let rt = runtime();
        let _entered = rt.enter();
        let mut host = Host::new(HostOptions::default()).unwrap();
        let err = host.run("undefined_call()", None).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ScriptError);
    }

    #[test]
    fn test_dump_ast() {
        let rt = runtime();
        let _entered = rt.enter();
        let mut host = Host::new(HostOptions::default()).unwrap();
        let dump = host.dump_ast("let x = 1 + 2;", false).unwrap();
        assert!(dump.contains("x"));
        // full optimization folds the constant expression
        let optimized = host.dump_ast("let x = 1 + 2;", true).unwrap();
        assert!(optimized.len() <= dump.len());
    }

    #[test]
    fn test_memory_cap_limits_strings() {
        let rt = runtime();
        let _entered = rt.enter();
        let mut host = Host::new(HostOptions { memory_cap_mb: Some(1), ..Default::default() }).unwrap();
        let err = host
            .run(r#"let s = "x"; loop { s += s; }"#, None)
            .unwrap_err();
        assert!(err.to_string().contains("Length of string"), "got: {err}");
    }
}
