//! `lug`: run scripts against the embedded-script service runtime

use std::io::{BufRead, Write};
use std::path::PathBuf;

use anyhow::Context;
use clap::{ArgAction, Parser};
use lug::prelude::*;

/// lug - embedded-script service runtime
#[derive(Parser)]
#[command(name = "lug")]
#[command(version, about, long_about = None)]
#[command(disable_version_flag = true)]
struct Cli {
    /// Execute the statement before (or instead of) the script
    #[arg(short = 'e', value_name = "stmt")]
    eval: Option<String>,

    /// Enter interactive mode after running the script
    #[arg(short = 'i')]
    interactive: bool,

    /// Run a library file before the script (repeatable)
    #[arg(short = 'l', value_name = "lib")]
    libraries: Vec<String>,

    /// Script resource cap in megabytes
    #[arg(short = 'm', value_name = "MB")]
    memory: Option<u64>,

    /// Dump instead of running: `-dt` parse tree, `-dc` optimized tree
    #[arg(short = 'd', value_name = "what")]
    dump: Option<String>,

    /// Write the dump to a file instead of stdout
    #[arg(short = 'p', value_name = "file")]
    dump_output: Option<PathBuf>,

    /// Print version information
    #[arg(short = 'v', action = ArgAction::Version)]
    version: Option<bool>,

    /// Script to run
    #[arg(value_name = "script")]
    script: Option<String>,

    /// Arguments passed to the script
    #[arg(value_name = "args", trailing_var_arg = true)]
    args: Vec<String>,
}

fn main() {
    match run() {
        Ok(()) => std::process::exit(0),
        Err(e) => {
            eprintln!("lug: {e}");
            for cause in e.chain().skip(1) {
                eprintln!("  caused by: {cause}");
            }
            std::process::exit(1);
        }
    }
}

fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing();
    let mode = Mode::from_env().context("invalid LUG_MODE")?;

    let runtime = tokio::runtime::Runtime::new().context("cannot start runtime")?;
    let _entered = runtime.enter();

    let mut host = Host::new(HostOptions {
        mode,
        memory_cap_mb: cli.memory,
    })
    .context("cannot initialize interpreter")?;

    let script_path = cli.script.clone().unwrap_or_default();
    host.set_args(&host_argv(cli.script.as_deref()), &script_path, &cli.args);

    if let Some(what) = &cli.dump {
        return dump(&mut host, &cli, what);
    }

    for library in &cli.libraries {
        host.run_file(library).with_context(|| format!("library {library:?}"))?;
    }
    if let Some(statement) = &cli.eval {
        host.run(statement, Some("-e"))?;
    }
    if let Some(script) = &cli.script {
        host.run_file(script).with_context(|| format!("script {script:?}"))?;
    }

    let nothing_ran = cli.eval.is_none() && cli.script.is_none();
    if cli.interactive || nothing_ran {
        repl(&mut host)?;
    }

    pool::shutdown();
    Ok(())
}

/// The invocation prefix (program plus flags) exposed at negative `arg`
/// indices
fn host_argv(script: Option<&str>) -> Vec<String> {
    let raw: Vec<String> = std::env::args().collect();
    match script.and_then(|s| raw.iter().position(|a| a == s)) {
        Some(position) => raw[..position].to_vec(),
        None => raw,
    }
}

fn dump(host: &mut Host, cli: &Cli, what: &str) -> anyhow::Result<()> {
    let optimized = match what {
        "t" => false,
        "c" => true,
        other => anyhow::bail!("unknown dump kind {other:?} (expected -dt or -dc)"),
    };
    let source = match (&cli.script, &cli.eval) {
        (Some(script), _) => std::fs::read_to_string(script).with_context(|| format!("script {script:?}"))?,
        (None, Some(statement)) => statement.clone(),
        (None, None) => anyhow::bail!("nothing to dump: pass a script or -e"),
    };
    let tree = host.dump_ast(&source, optimized)?;
    match &cli.dump_output {
        Some(path) => std::fs::write(path, tree).with_context(|| format!("writing {path:?}"))?,
        None => println!("{tree}"),
    }
    Ok(())
}

fn repl(host: &mut Host) -> anyhow::Result<()> {
    let stdin = std::io::stdin();
    let mut stdout = std::io::stdout();
    writeln!(stdout, "lug {} ({} mode), ctrl-d to exit", env!("CARGO_PKG_VERSION"), host.mode())?;
    loop {
        write!(stdout, "> ")?;
        stdout.flush()?;
        let mut line = String::new();
        if stdin.lock().read_line(&mut line)? == 0 {
            writeln!(stdout)?;
            return Ok(());
        }
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if line == "exit" {
            return Ok(());
        }
        match host.run(line, Some("repl")) {
            Ok(value) if !value.is_unit() => writeln!(stdout, "{value}")?,
            Ok(_) => {}
            Err(err) => eprintln!("{err}"),
        }
    }
}
