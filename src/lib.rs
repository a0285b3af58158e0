//! Embeddable entry point for the `protopython` interpreter binary.
//!
//! Grounded on the teacher's `lib.rs` (`run(init)` orchestrating
//! settings/shell/REPL dispatch); this runtime drops the teacher's
//! pip-install and flame-profiling paths since there's no package installer
//! or profiling story here, leaving script/command/REPL dispatch as the
//! embeddable surface.

mod interpreter;
mod settings;
mod shell;

pub use interpreter::build_interpreter;
pub use protopython_vm as vm;
pub use settings::{parse_args, RunMode, Settings};

use std::process::ExitCode;

/// Parses process arguments, builds an interpreter, and runs whichever of
/// `-c`/`-m`/script/REPL mode was selected. Returns the process exit code.
pub fn run() -> ExitCode {
    let settings = settings::parse_args();
    init_logging(&settings);
    let mut interp = interpreter::build_interpreter(&settings);

    if let Some(path) = &settings.startup_file {
        if matches!(settings.run_mode, RunMode::Repl) {
            match std::fs::read_to_string(path) {
                Ok(source) => {
                    let _ = shell::run_once(&mut interp, &source, path);
                }
                Err(e) => eprintln!("protopython: can't open startup file '{path}': {e}"),
            }
        }
    }

    let code = match &settings.run_mode {
        RunMode::Command(cmd) => shell::run_once(&mut interp, cmd, "<string>"),
        RunMode::Module(name) => shell::run_module(&mut interp, name),
        RunMode::Script(path) => match std::fs::read_to_string(path) {
            Ok(source) => shell::run_once(&mut interp, &source, path),
            Err(e) => {
                eprintln!("protopython: can't open file '{path}': {e}");
                2
            }
        },
        RunMode::Repl => {
            shell::run_shell(&mut interp);
            0
        }
    };

    match u8::try_from(code) {
        Ok(code) => ExitCode::from(code),
        Err(_) => ExitCode::FAILURE,
    }
}

/// Turns `RUNTIME_THREAD_DIAG`/`RUNTIME_ENV_DIAG` (spec §6) into an
/// `env_logger` filter raising the relevant subsystem targets to `trace`
/// (SPEC_FULL.md §B.1), and `RUNTIME_NO_COLOR` into a disabled write style,
/// read once at startup rather than consulted per-call.
fn init_logging(settings: &Settings) {
    let mut builder = env_logger::Builder::from_default_env();
    let mut directives = Vec::new();
    if std::env::var_os("RUNTIME_THREAD_DIAG").is_some() {
        directives.push("protopython_vm::space=trace");
    }
    if std::env::var_os("RUNTIME_ENV_DIAG").is_some() {
        directives.push("protopython_vm::environment=trace");
        directives.push("protopython_vm::import=trace");
    }
    if !directives.is_empty() {
        builder.parse_filters(&directives.join(","));
    }
    if settings.no_color {
        builder.write_style(env_logger::WriteStyle::Never);
    }
    builder.init();
}
