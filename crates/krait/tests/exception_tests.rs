use krait::{Error, Value, Vm};
use pretty_assertions::assert_eq;

fn run(src: &str) -> Value {
    Vm::new().run(src).unwrap()
}

fn run_err(src: &str) -> krait::UncaughtException {
    match Vm::new().run(src) {
        Err(Error::Exception(e)) => e,
        other => panic!("expected an uncaught exception, got {other:?}"),
    }
}

#[test]
fn test_try_except_catches_matching_type() {
    let src = r#"
try:
    1 / 0
    r = 'no error'
except ZeroDivisionError:
    r = 'caught'
r
"#;
    assert_eq!(run(src), Value::str("caught"));
}

#[test]
fn test_handler_matching_uses_hierarchy() {
    let src = r#"
try:
    [][5]
except LookupError:
    r = 'lookup'
r
"#;
    assert_eq!(run(src), Value::str("lookup"));

    let src = r#"
try:
    int('nope')
except Exception:
    r = 'generic'
r
"#;
    assert_eq!(run(src), Value::str("generic"));
}

#[test]
fn test_first_matching_handler_wins() {
    let src = r#"
try:
    {}['k']
except ValueError:
    r = 'value'
except KeyError:
    r = 'key'
except Exception:
    r = 'generic'
r
"#;
    assert_eq!(run(src), Value::str("key"));
}

#[test]
fn test_tuple_of_matchers() {
    let src = r#"
try:
    1 // 0
except (ValueError, ZeroDivisionError):
    r = 'caught'
r
"#;
    assert_eq!(run(src), Value::str("caught"));
}

#[test]
fn test_exception_binding_carries_message_and_args() {
    let src = r#"
try:
    raise ValueError('bad thing', 42)
except ValueError as e:
    r = [str(type(e).__name__), e.args[0], e.args[1]]
r
"#;
    assert_eq!(run(src), run("['ValueError', 'bad thing', 42]"));
}

#[test]
fn test_else_runs_only_without_exception() {
    let src = r#"
out = []
try:
    out.append('body')
except ValueError:
    out.append('handler')
else:
    out.append('else')
out
"#;
    assert_eq!(run(src), run("['body', 'else']"));
}

#[test]
fn test_finally_runs_on_both_paths() {
    let src = r#"
out = []
try:
    out.append('a')
finally:
    out.append('fin')
try:
    try:
        1 / 0
    finally:
        out.append('fin2')
except ZeroDivisionError:
    out.append('caught')
out
"#;
    assert_eq!(run(src), run("['a', 'fin', 'fin2', 'caught']"));
}

#[test]
fn test_finally_runs_on_return() {
    let src = r#"
out = []
def f():
    try:
        return 'ret'
    finally:
        out.append('fin')
[f(), out]
"#;
    assert_eq!(run(src), run("['ret', ['fin']]"));
}

#[test]
fn test_finally_runs_on_break() {
    let src = r#"
out = []
for i in range(5):
    try:
        if i == 2:
            break
    finally:
        out.append(i)
out
"#;
    assert_eq!(run(src), run("[0, 1, 2]"));
}

#[test]
fn test_bare_raise_reraises() {
    let src = r#"
def f():
    try:
        1 / 0
    except ZeroDivisionError:
        raise
try:
    f()
except ZeroDivisionError:
    r = 'propagated'
r
"#;
    assert_eq!(run(src), Value::str("propagated"));
}

#[test]
fn test_raise_class_instantiates() {
    let src = r#"
try:
    raise ValueError
except ValueError as e:
    r = len(e.args)
r
"#;
    assert_eq!(run(src), Value::Int(0));
}

#[test]
fn test_exception_chaining_scenario() {
    let mut vm = Vm::new();
    let src = r#"
try:
    try:
        1 / 0
    except ZeroDivisionError as e:
        raise ValueError("bad") from e
except ValueError as v:
    print(type(v).__name__, v.__cause__.__class__.__name__)
"#;
    vm.run(src).unwrap();
    assert_eq!(vm.take_output(), "ValueError ZeroDivisionError\n");
}

#[test]
fn test_implicit_context_chaining() {
    let src = r#"
try:
    try:
        1 / 0
    except ZeroDivisionError:
        raise KeyError('k')
except KeyError as e:
    r = [e.__context__.__class__.__name__, e.__suppress_context__, e.__cause__ is None]
r
"#;
    assert_eq!(run(src), run("['ZeroDivisionError', False, True]"));
}

#[test]
fn test_raise_from_suppresses_context_display() {
    let src = r#"
try:
    try:
        1 / 0
    except ZeroDivisionError:
        raise ValueError('v') from None
except ValueError as e:
    r = [e.__cause__ is None, e.__suppress_context__]
r
"#;
    assert_eq!(run(src), run("[True, True]"));
}

#[test]
fn test_custom_exception_classes() {
    let src = r#"
class AppError(Exception):
    pass
class NotFound(AppError):
    pass
try:
    raise NotFound('missing thing')
except AppError as e:
    r = [type(e).__name__, str(e)]
r
"#;
    assert_eq!(run(src), run("['NotFound', 'missing thing']"));
}

#[test]
fn test_unhandled_exception_surfaces_with_traceback() {
    let e = run_err("def boom():\n    raise ValueError('pow')\n\nboom()\n");
    assert_eq!(e.type_name(), "ValueError");
    assert_eq!(e.message(), "pow");
    let rendered = e.to_string();
    assert!(rendered.contains("Traceback (most recent call last):"));
    assert!(rendered.contains("line 2, in boom"));
    assert!(rendered.ends_with("ValueError: pow"));
    // Oldest frame first: the module-level call precedes the raise site.
    let module_pos = rendered.find("in <module>").unwrap();
    let boom_pos = rendered.find("in boom").unwrap();
    assert!(module_pos < boom_pos);
}

#[test]
fn test_uncaught_chain_renders_cause() {
    let e = run_err(
        "try:\n    1 / 0\nexcept ZeroDivisionError as e:\n    raise ValueError('v') from e\n",
    );
    let rendered = e.to_string();
    assert!(rendered.contains("ZeroDivisionError: division by zero"));
    assert!(rendered.contains("direct cause"));
    assert!(rendered.ends_with("ValueError: v"));
}

#[test]
fn test_error_messages() {
    assert_eq!(run_err("1 / 0").message(), "division by zero");
    assert_eq!(run_err("1 << -1").message(), "negative shift count");
    assert_eq!(run_err("{}['k']").message(), "'k'");
    assert_eq!(run_err("[1][5]").message(), "list index out of range");
    assert_eq!(
        run_err("1 + 'x'").message(),
        "unsupported operand type(s) for +: 'int' and 'str'"
    );
    assert_eq!(
        run_err("len(1)").message(),
        "object of type 'int' has no len()"
    );
    assert_eq!(run_err("missing_name").type_name(), "NameError");
    assert_eq!(run_err("range(1, 2, 0)").type_name(), "ValueError");
    assert_eq!(run_err("'a' < 1").type_name(), "TypeError");
}

#[test]
fn test_unbound_local() {
    let e = run_err("def f():\n    x = x + 1\n    return x\nf()\n");
    assert_eq!(e.type_name(), "UnboundLocalError");
}

#[test]
fn test_assert_statement() {
    assert_eq!(run("assert True\n'ok'"), Value::str("ok"));
    let e = run_err("assert 1 == 2, 'math is broken'");
    assert_eq!(e.type_name(), "AssertionError");
    assert_eq!(e.message(), "math is broken");
}

#[test]
fn test_add_note() {
    let src = r#"
try:
    e = ValueError('base')
    e.add_note('extra context')
    raise e
except ValueError as caught:
    r = caught.__notes__
r
"#;
    assert_eq!(run(src), run("['extra context']"));
}

#[test]
fn test_exception_group_splitting() {
    let src = r#"
out = []
try:
    raise ExceptionGroup('batch', [ValueError('a'), TypeError('b'), ValueError('c')])
except* ValueError as eg:
    out.append(['V', len(eg.exceptions)])
except* TypeError as eg:
    out.append(['T', len(eg.exceptions)])
out
"#;
    assert_eq!(run(src), run("[['V', 2], ['T', 1]]"));
}

#[test]
fn test_exception_group_unmatched_leaves_reraise() {
    let src = r#"
try:
    try:
        raise ExceptionGroup('batch', [ValueError('a'), KeyError('b')])
    except* ValueError:
        pass
except Exception as e:
    r = [type(e).__name__, len(e.exceptions)]
r
"#;
    assert_eq!(run(src), run("['ExceptionGroup', 1]"));
}

#[test]
fn test_exception_group_classification() {
    assert_eq!(
        run("isinstance(ExceptionGroup('m', [ValueError()]), Exception)"),
        Value::Bool(true)
    );
    assert_eq!(
        run("issubclass(ExceptionGroup, BaseExceptionGroup)"),
        Value::Bool(true)
    );
}

#[test]
fn test_stop_iteration_value_from_generator() {
    let src = r#"
def g():
    yield 1
    yield 2
    return 9
it = g()
a = next(it)
b = next(it)
try:
    next(it)
    c = 'no error'
except StopIteration as e:
    c = e.value
[a, b, c]
"#;
    assert_eq!(run(src), run("[1, 2, 9]"));
}

#[test]
fn test_with_statement_runs_exit() {
    let src = r#"
log = []
class CM:
    def __enter__(self):
        log.append('enter')
        return 5
    def __exit__(self, t, v, tb):
        log.append('exit')
        return False
with CM() as x:
    log.append(x)
log
"#;
    assert_eq!(run(src), run("['enter', 5, 'exit']"));
}

#[test]
fn test_with_statement_suppression() {
    let src = r#"
class Quiet:
    def __enter__(self):
        return None
    def __exit__(self, t, v, tb):
        return t is ValueError
with Quiet():
    raise ValueError('swallowed')
'survived'
"#;
    assert_eq!(run(src), Value::str("survived"));
}

#[test]
fn test_with_exit_sees_exception_details() {
    let src = r#"
seen = []
class Watch:
    def __enter__(self):
        return None
    def __exit__(self, t, v, tb):
        seen.append(t.__name__)
        seen.append(str(v))
        return True
with Watch():
    raise KeyError('oops')
seen
"#;
    assert_eq!(run(src), run("['KeyError', 'oops']"));
}

#[test]
fn test_exception_inside_with_still_runs_exit_on_return() {
    let src = r#"
log = []
class CM:
    def __enter__(self):
        return None
    def __exit__(self, t, v, tb):
        log.append('closed')
        return False
def f():
    with CM():
        return 'early'
[f(), log]
"#;
    assert_eq!(run(src), run("['early', ['closed']]"));
}

#[test]
fn test_uncatchable_timeouts_bypass_except() {
    use std::time::Duration;
    let mut vm = Vm::new();
    let code = vm
        .compile(
            "try:\n    while True:\n        pass\nexcept BaseException:\n    pass\n",
            "<t>",
        )
        .unwrap();
    match vm.execute_with_timeout(code, Duration::from_millis(25)) {
        Err(Error::Timeout { elapsed }) => {
            assert!(elapsed >= Duration::from_millis(25));
        }
        other => panic!("expected timeout, got {other:?}"),
    }
}
