//! End-to-end scenario tests (SPEC_FULL.md §B.4): construct an
//! `Interpreter`, run a source string, and assert on the resulting value or
//! exit behavior.

use protopython_compiler::Mode;
use protopython_vm::{exceptions, Interpreter, Value};

fn eval(source: &str) -> Value {
    let mut interp = Interpreter::new(Vec::new());
    interp
        .run_source(source, "<test>", Mode::Eval)
        .unwrap_or_else(|()| panic!("unexpected exception: {:?}", exceptions::take_pending()))
}

fn exec(source: &str) -> Interpreter {
    let mut interp = Interpreter::new(Vec::new());
    interp
        .run_source(source, "<test>", Mode::Exec)
        .unwrap_or_else(|()| panic!("unexpected exception: {:?}", exceptions::take_pending()));
    interp
}

fn exec_err(source: &str) -> Value {
    let mut interp = Interpreter::new(Vec::new());
    match interp.run_source(source, "<test>", Mode::Exec) {
        Ok(_) => panic!("expected an uncaught exception"),
        Err(()) => exceptions::take_pending().expect("pending exception"),
    }
}

fn eval_in(interp: &mut Interpreter, name: &str) -> Value {
    interp
        .run_source(name, "<eval>", Mode::Eval)
        .unwrap_or_else(|()| panic!("unexpected exception reading {name}"))
}

#[test]
fn arithmetic_expression() {
    assert_eq!(eval("1 + 2 * 3").as_int(), Some(7));
    assert_eq!(eval("(1 + 2) * 3").as_int(), Some(9));
    assert_eq!(eval("10 // 3").as_int(), Some(3));
}

#[test]
fn numeric_and_bool_cross_equality() {
    assert!(matches!(eval("1 == 1.0"), Value::Bool(true)));
    assert!(matches!(eval("True == 1"), Value::Bool(true)));
}

#[test]
fn string_concatenation_and_len() {
    assert_eq!(eval("len('hello' + ' world')").as_int(), Some(11));
}

#[test]
fn variables_and_control_flow() {
    let mut interp = exec(
        r#"
total = 0
for i in range(5):
    if i % 2 == 0:
        total = total + i
"#,
    );
    assert_eq!(eval_in(&mut interp, "total").as_int(), Some(6));
}

#[test]
fn function_definition_and_call() {
    let mut interp = exec(
        r#"
def add(a, b):
    return a + b

result = add(3, 4)
"#,
    );
    assert_eq!(eval_in(&mut interp, "result").as_int(), Some(7));
}

#[test]
fn closures_capture_enclosing_variables() {
    let mut interp = exec(
        r#"
def make_counter():
    count = 0
    def bump():
        nonlocal count
        count = count + 1
        return count
    return bump

counter = make_counter()
first = counter()
second = counter()
"#,
    );
    assert_eq!(eval_in(&mut interp, "first").as_int(), Some(1));
    assert_eq!(eval_in(&mut interp, "second").as_int(), Some(2));
}

#[test]
fn generator_yields_in_order() {
    let mut interp = exec(
        r#"
def count_up_to(n):
    i = 0
    while i < n:
        yield i
        i = i + 1

g = count_up_to(3)
a = next(g)
b = next(g)
c = next(g)
"#,
    );
    assert_eq!(eval_in(&mut interp, "a").as_int(), Some(0));
    assert_eq!(eval_in(&mut interp, "b").as_int(), Some(1));
    assert_eq!(eval_in(&mut interp, "c").as_int(), Some(2));
}

#[test]
fn try_except_catches_named_exception() {
    let mut interp = exec(
        r#"
caught = False
try:
    1 / 0
except ZeroDivisionError:
    caught = True
"#,
    );
    assert!(matches!(eval_in(&mut interp, "caught"), Value::Bool(true)));
}

#[test]
fn uncaught_exception_propagates_to_the_top() {
    let exc = exec_err("raise ValueError('boom')");
    assert!(exc.as_object().is_some(), "exception should be a heap object");
}

#[test]
fn isinstance_and_type_builtins_agree() {
    assert!(matches!(eval("isinstance(3, int)"), Value::Bool(true)));
    assert!(matches!(eval("isinstance(True, int)"), Value::Bool(true)));
    assert!(matches!(eval("isinstance('x', int)"), Value::Bool(false)));
}

#[test]
fn list_and_dict_builtin_constructors() {
    assert_eq!(eval("len([1, 2, 3])").as_int(), Some(3));
    assert_eq!(eval("len({'a': 1, 'b': 2})").as_int(), Some(2));
    assert_eq!(eval("sum([1, 2, 3, 4])").as_int(), Some(10));
    assert_eq!(eval("max([3, 1, 4, 1, 5])").as_int(), Some(5));
}

#[test]
fn syntax_error_on_malformed_source() {
    let mut interp = Interpreter::new(Vec::new());
    let result = interp.run_source("def f(:\n    pass", "<test>", Mode::Exec);
    assert!(result.is_err());
    exceptions::clear_pending();
}
