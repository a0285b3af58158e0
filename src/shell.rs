//! Interactive REPL (SPEC_FULL.md §B.1 "Entry points" — the no-script,
//! no-`-c` fallback).
//!
//! Grounded on the teacher's `shell.rs` (`shell_exec`/`run_shell`,
//! `ReadlineResult`, a `Readline` abstraction over `rustyline`/a plain-stdin
//! fallback, history persisted under the user's config directory); rebuilt
//! against this runtime's `Interpreter::run_source` and its own
//! `CompileErrorType`/`ParseErrorType` shape rather than the teacher's.

use protopython_compiler::{CompileErrorType, Mode};
use protopython_parser::{LexErrorType, ParseErrorType};
use protopython_vm::{Interpreter, ObjectRef, Value};
use rustyline::error::ReadlineError;
use rustyline::DefaultEditor;
use std::path::PathBuf;

enum ExecOutcome {
    Ok,
    PyErr,
}

fn shell_exec(interp: &mut Interpreter, source: &str) -> ExecOutcome {
    match interp.run_source(source, "<stdin>", Mode::Single) {
        Ok(_) => ExecOutcome::Ok,
        Err(()) => ExecOutcome::PyErr,
    }
}

/// Compiles `source` standalone (discarding the result) just to check
/// whether the syntax error is "ran out of input mid-statement" — the
/// signal the REPL uses to keep reading continuation lines instead of
/// reporting a real syntax error. Re-compiling here rather than inspecting
/// the raised guest `SyntaxError` instance, since the compiler doesn't
/// thread the original `CompileErrorType` onto it.
fn compile_is_eof(source: &str) -> bool {
    let scratch_pool = std::sync::Arc::new(protopython_common::StringPool::new());
    match protopython_compiler::compile_program(source, "<stdin>", Mode::Single, scratch_pool) {
        Err(e) => matches!(
            e.error,
            CompileErrorType::Parse(ParseErrorType::Eof)
                | CompileErrorType::Parse(ParseErrorType::Lexical(LexErrorType::Eof))
        ),
        Ok(_) => false,
    }
}

fn history_path() -> Option<PathBuf> {
    dirs::config_dir().map(|mut p| {
        p.push("protopython");
        p.push("repl_history.txt");
        p
    })
}

pub fn run_shell(interp: &mut Interpreter) {
    let mut editor = match DefaultEditor::new() {
        Ok(e) => e,
        Err(e) => {
            eprintln!("could not start line editor: {e}");
            return;
        }
    };

    let hist_path = history_path();
    if let Some(path) = &hist_path {
        let _ = editor.load_history(path);
    }

    let mut buffer = String::new();
    loop {
        let prompt = if buffer.is_empty() { ">>> " } else { "... " };
        match editor.readline(prompt) {
            Ok(line) => {
                if !buffer.is_empty() {
                    buffer.push('\n');
                }
                buffer.push_str(&line);

                if buffer.trim().is_empty() {
                    buffer.clear();
                    continue;
                }

                if compile_is_eof(&buffer) {
                    continue;
                }

                let _ = editor.add_history_entry(buffer.as_str());
                match shell_exec(interp, &buffer) {
                    ExecOutcome::Ok => {}
                    ExecOutcome::PyErr => {
                        if let Some(code) = system_exit_code(interp) {
                            if let Some(path) = &hist_path {
                                let _ = editor.save_history(path);
                            }
                            std::process::exit(code);
                        }
                        print_exception(interp);
                    }
                }
                buffer.clear();
            }
            Err(ReadlineError::Interrupted) => {
                buffer.clear();
                continue;
            }
            Err(ReadlineError::Eof) => break,
            Err(e) => {
                eprintln!("readline error: {e}");
                break;
            }
        }
    }

    if let Some(path) = &hist_path {
        let _ = editor.save_history(path);
    }
}

/// `-m module_name`: resolves `module_name` through the same search paths
/// the import pipeline uses, then runs its source as `__main__` (spec §6
/// "`runtime -m module_name [args…]` — run a module as `__main__`").
pub fn run_module(interp: &mut Interpreter, module_name: &str) -> i32 {
    use protopython_vm::import::{ModuleProvider, ModuleSource, SourceProvider};

    let search_paths = interp.vm.env.search_paths.read().clone();
    match SourceProvider.find(module_name, &search_paths) {
        Some(ModuleSource::Source(text, _path)) => run_once(interp, &text, "__main__"),
        Some(ModuleSource::Native(_)) => {
            eprintln!("protopython: native module '{module_name}' can't be run with -m");
            1
        }
        None => {
            eprintln!("protopython: No module named {module_name}");
            1
        }
    }
}

/// Runs a single `-c CMD` / script body to completion, printing the
/// uncaught exception (if any) the way the interactive loop does.
pub fn run_once(interp: &mut Interpreter, source: &str, name: &str) -> i32 {
    match interp.run_source(source, name, Mode::Exec) {
        Ok(_) => 0,
        Err(()) => {
            if let Some(code) = system_exit_code(interp) {
                return code;
            }
            print_exception(interp);
            1
        }
    }
}

/// If the pending exception is a `SystemExit`, returns the process exit code
/// it carries (defaulting to 0, matching Python's `sys.exit()` with no
/// argument or `sys.exit(None)`).
fn system_exit_code(interp: &mut Interpreter) -> Option<i32> {
    let exc = protopython_vm::exceptions::peek_pending()?;
    let exc_obj = exc.as_object()?;
    if !is_instance_of(interp, exc_obj, interp.vm.env.exc.system_exit) {
        return None;
    }
    protopython_vm::exceptions::clear_pending();
    let code = interp
        .vm
        .space
        .get(exc_obj)
        .read()
        .attrs
        .get(&interp.vm.space.intern("code"))
        .cloned();
    match code {
        Some(Value::Int(n)) => Some(n as i32),
        Some(Value::None) | None => Some(0),
        Some(_) => Some(0),
    }
}

fn is_instance_of(interp: &Interpreter, obj: ObjectRef, target: ObjectRef) -> bool {
    let class = interp.vm.env.class_of(&interp.vm.space, &Value::Object(obj));
    interp.vm.env.is_subclass(&interp.vm.space, class, target)
}

fn print_exception(interp: &mut Interpreter) {
    if let Some(exc) = protopython_vm::exceptions::take_pending() {
        match interp.vm.str_of(&exc) {
            Ok(text) => eprintln!("{text}"),
            Err(()) => {
                protopython_vm::exceptions::clear_pending();
                eprintln!("<error while formatting exception>");
            }
        }
    }
}

