use krait::{Value, Vm};
use pretty_assertions::assert_eq;

fn run(src: &str) -> Value {
    Vm::new().run(src).unwrap()
}

#[test]
fn test_generator_yields_lazily() {
    let src = r#"
log = []
def g():
    log.append('start')
    yield 1
    log.append('middle')
    yield 2
it = g()
before = len(log)
a = next(it)
b = next(it)
[before, a, b, log]
"#;
    assert_eq!(run(src), run("[0, 1, 2, ['start', 'middle']]"));
}

#[test]
fn test_generator_in_for_loop() {
    let src = r#"
def countdown(n):
    while n > 0:
        yield n
        n -= 1
out = []
for v in countdown(4):
    out.append(v)
out
"#;
    assert_eq!(run(src), run("[4, 3, 2, 1]"));
}

#[test]
fn test_generator_state_is_independent() {
    let src = r#"
def g():
    yield 1
    yield 2
a = g()
b = g()
[next(a), next(b), next(a)]
"#;
    assert_eq!(run(src), run("[1, 1, 2]"));
}

#[test]
fn test_send() {
    let src = r#"
def echo():
    total = 0
    while True:
        got = yield total
        total += got
e = echo()
first = e.send(None)
a = e.send(10)
b = e.send(5)
[first, a, b]
"#;
    assert_eq!(run(src), run("[0, 10, 15]"));
}

#[test]
fn test_send_non_none_to_fresh_generator_fails() {
    let src = r#"
def g():
    yield 1
it = g()
try:
    it.send(5)
    r = 'sent'
except TypeError:
    r = 'rejected'
r
"#;
    assert_eq!(run(src), Value::str("rejected"));
}

#[test]
fn test_throw_into_generator() {
    let src = r#"
def g():
    try:
        yield 1
    except ValueError:
        yield 'caught'
it = g()
a = next(it)
b = it.throw(ValueError('x'))
[a, b]
"#;
    assert_eq!(run(src), run("[1, 'caught']"));
}

#[test]
fn test_throw_unhandled_propagates() {
    let src = r#"
def g():
    yield 1
it = g()
next(it)
try:
    it.throw(KeyError('boom'))
    r = 'survived'
except KeyError:
    r = 'propagated'
r
"#;
    assert_eq!(run(src), Value::str("propagated"));
}

#[test]
fn test_close() {
    let src = r#"
log = []
def g():
    try:
        yield 1
    finally:
        log.append('cleanup')
it = g()
next(it)
it.close()
log
"#;
    assert_eq!(run(src), run("['cleanup']"));
}

#[test]
fn test_exhausted_generator_raises_stop_iteration() {
    let src = r#"
def g():
    yield 1
it = g()
next(it)
r = []
for attempt in range(2):
    try:
        next(it)
    except StopIteration:
        r.append('stop')
r
"#;
    assert_eq!(run(src), run("['stop', 'stop']"));
}

#[test]
fn test_generator_return_value_reaches_stop_iteration() {
    let src = r#"
def g():
    yield 1
    return 'done'
it = g()
next(it)
try:
    next(it)
    r = None
except StopIteration as e:
    r = e.value
r
"#;
    assert_eq!(run(src), Value::str("done"));
}

#[test]
fn test_yield_expression_receives_sent_value() {
    let src = r#"
def g():
    x = yield 'ready'
    yield x * 2
it = g()
a = next(it)
b = it.send(21)
[a, b]
"#;
    assert_eq!(run(src), run("['ready', 42]"));
}

#[test]
fn test_yield_from_delegates_values() {
    let src = r#"
def inner():
    yield 1
    yield 2
def outer():
    yield 0
    yield from inner()
    yield 3
list(outer())
"#;
    assert_eq!(run(src), run("[0, 1, 2, 3]"));
}

#[test]
fn test_generator_feeds_builtins() {
    let src = r#"
def squares(n):
    for i in range(n):
        yield i * i
[sum(squares(5)), max(squares(5)), list(squares(3))]
"#;
    assert_eq!(run(src), run("[30, 16, [0, 1, 4]]"));
}

#[test]
fn test_generator_closure_capture() {
    let src = r#"
def make(step):
    def walk(start):
        n = start
        while True:
            yield n
            n += step
    return walk
w = make(10)(3)
[next(w), next(w), next(w)]
"#;
    assert_eq!(run(src), run("[3, 13, 23]"));
}

#[test]
fn test_generator_type_names() {
    let src = r#"
def g():
    yield 1
type(g()).__name__
"#;
    assert_eq!(run(src), Value::str("generator"));

    let src = r#"
async def c():
    return 1
type(c()).__name__
"#;
    assert_eq!(run(src), Value::str("coroutine"));
}

#[test]
fn test_generator_expression_is_iterable_once() {
    let src = r#"
gen = (x * 2 for x in range(3))
first = list(gen)
second = list(gen)
[first, second]
"#;
    assert_eq!(run(src), run("[[0, 2, 4], []]"));
}

#[test]
fn test_nested_generators() {
    let src = r#"
def pairs(xs, ys):
    for x in xs:
        for y in ys:
            yield (x, y)
list(pairs([1, 2], 'ab'))
"#;
    assert_eq!(run(src), run("[(1, 'a'), (1, 'b'), (2, 'a'), (2, 'b')]"));
}
