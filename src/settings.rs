//! Command-line argument parsing (SPEC_FULL.md §B.1 "Entry points", §B.3
//! "Configuration").
//!
//! Grounded on the teacher's `settings.rs` (a `clap`-based parser producing
//! a `Settings`/`RunMode` pair consumed by `lib.rs::run`, plus the teacher's
//! own `RUSTPYTHONPATH`/`PYTHONPATH` environment-variable fallback for
//! search paths), re-expressed with `lexopt` rather than `clap` (matching
//! this workspace's own dependency choice) and reading spec §6's own
//! environment variables (`RUNTIME_PATH`, `RUNTIME_STARTUP`,
//! `RUNTIME_NO_COLOR`) rather than CPython-style names.

use std::env;

pub enum RunMode {
    /// No script/command given: drop into the REPL.
    Repl,
    /// `-c CMD`: run `CMD` as a single module body.
    Command(String),
    /// A bare positional argument: the path to a `.py` file to run.
    Script(String),
    /// `-m module_name`: resolve `module_name` through the import pipeline's
    /// search paths and run it as `__main__`.
    Module(String),
}

pub struct Settings {
    pub run_mode: RunMode,
    pub search_paths: Vec<String>,
    pub quiet: bool,
    /// `-O`: optimization level, carried through but not yet consulted by
    /// the compiler (spec §B.3 "optimization level (`-O`)").
    pub optimize: u32,
    /// `RUNTIME_STARTUP`: a source file run in the REPL's global namespace
    /// before the first prompt (spec §6).
    pub startup_file: Option<String>,
    /// `RUNTIME_NO_COLOR`: disables ANSI color in diagnostics (spec §6).
    pub no_color: bool,
    /// Arguments following the script/command/module name, exposed as
    /// `sys.argv[1:]`.
    pub argv: Vec<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            run_mode: RunMode::Repl,
            search_paths: Vec::new(),
            quiet: false,
            optimize: 0,
            startup_file: None,
            no_color: false,
            argv: Vec::new(),
        }
    }
}

/// Parses `std::env::args_os()` plus spec §6's environment variables.
pub fn parse_args() -> Settings {
    let mut settings = Settings::default();
    settings.search_paths.extend(get_paths("RUNTIME_PATH"));
    settings.startup_file = env::var("RUNTIME_STARTUP").ok();
    settings.no_color = env::var_os("RUNTIME_NO_COLOR").is_some();

    let mut parser = lexopt::Parser::from_env();
    let mut script: Option<String> = None;
    let mut command: Option<String> = None;
    let mut module: Option<String> = None;

    while let Some(arg) = parser.next().expect("invalid command line arguments") {
        match arg {
            lexopt::Arg::Short('c') => {
                command = Some(parser.value().expect("-c requires an argument").to_string_lossy().into_owned());
            }
            lexopt::Arg::Short('m') => {
                module = Some(parser.value().expect("-m requires an argument").to_string_lossy().into_owned());
            }
            lexopt::Arg::Short('O') => {
                settings.optimize += 1;
            }
            lexopt::Arg::Short('q') | lexopt::Arg::Long("quiet") => {
                settings.quiet = true;
            }
            lexopt::Arg::Value(val) => {
                script = Some(val.to_string_lossy().into_owned());
                while let Ok(extra) = parser.value() {
                    settings.argv.push(extra.to_string_lossy().into_owned());
                }
                break;
            }
            _ => {
                eprintln!("unrecognized argument: {arg:?}");
                std::process::exit(2);
            }
        }
    }

    settings.run_mode = if let Some(cmd) = command {
        RunMode::Command(cmd)
    } else if let Some(name) = module {
        RunMode::Module(name)
    } else if let Some(path) = script {
        RunMode::Script(path)
    } else {
        RunMode::Repl
    };

    settings
}

/// Splits an OS-specific `PATH`-style environment variable into individual
/// search-path entries.
fn get_paths(env_variable_name: &str) -> impl Iterator<Item = String> + '_ {
    env::var_os(env_variable_name)
        .into_iter()
        .flat_map(move |paths| {
            env::split_paths(&paths)
                .map(|path| {
                    path.into_os_string()
                        .into_string()
                        .unwrap_or_else(|_| panic!("{env_variable_name} isn't valid unicode"))
                })
                .collect::<Vec<_>>()
        })
}

