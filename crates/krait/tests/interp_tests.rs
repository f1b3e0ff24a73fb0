use krait::{Value, Vm};
use pretty_assertions::assert_eq;

fn run(src: &str) -> Value {
    Vm::new().run(src).unwrap()
}

#[test]
fn test_basic_arithmetic() {
    let mut vm = Vm::new();

    assert_eq!(vm.run("2 + 2").unwrap(), Value::Int(4));
    assert_eq!(vm.run("10 - 3").unwrap(), Value::Int(7));
    assert_eq!(vm.run("4 * 5").unwrap(), Value::Int(20));
    assert_eq!(vm.run("10 / 4").unwrap(), Value::Float(2.5));
    assert_eq!(vm.run("10 // 3").unwrap(), Value::Int(3));
    assert_eq!(vm.run("10 % 3").unwrap(), Value::Int(1));
    assert_eq!(vm.run("2 ** 8").unwrap(), Value::Int(256));
}

#[test]
fn test_floor_division_rounds_down() {
    assert_eq!(run("-7 // 2"), Value::Int(-4));
    assert_eq!(run("7 // -2"), Value::Int(-4));
    assert_eq!(run("-7 % 2"), Value::Int(1));
    assert_eq!(run("7 % -2"), Value::Int(-1));
    assert_eq!(run("divmod(7, -2)"), run("(-4, -1)"));
}

#[test]
fn test_unbounded_integers() {
    assert_eq!(
        run("str(2 ** 100)"),
        Value::str("1267650600228229401496703205376")
    );
    assert_eq!(run("(2 ** 100) // (2 ** 90)"), Value::Int(1024));
    assert_eq!(run("(10 ** 30) % 7"), Value::Int(1));
}

#[test]
fn test_bool_is_arithmetic_int() {
    assert_eq!(run("True + True"), Value::Int(2));
    assert_eq!(run("True * 10"), Value::Int(10));
    assert_eq!(run("isinstance(True, int)"), Value::Bool(true));
}

#[test]
fn test_negative_exponent_promotes_to_float() {
    assert_eq!(run("2 ** -1"), Value::Float(0.5));
}

#[test]
fn test_strings() {
    assert_eq!(run("'hello' + ' ' + 'world'"), Value::str("hello world"));
    assert_eq!(run("'ab' * 3"), Value::str("ababab"));
    assert_eq!(run("len('héllo')"), Value::Int(5));
    assert_eq!(run("'héllo'[1]"), Value::str("é"));
    assert_eq!(run("'hello'[-1]"), Value::str("o"));
    assert_eq!(run("'hello'[1:4]"), Value::str("ell"));
    assert_eq!(run("'hello'[::-1]"), Value::str("olleh"));
}

#[test]
fn test_string_methods() {
    assert_eq!(run("'Hello'.upper()"), Value::str("HELLO"));
    assert_eq!(run("'Hello'.lower()"), Value::str("hello"));
    assert_eq!(run("'  x  '.strip()"), Value::str("x"));
    assert_eq!(run("'a,b,c'.split(',')"), run("['a', 'b', 'c']"));
    assert_eq!(run("'-'.join(['a', 'b'])"), Value::str("a-b"));
    assert_eq!(run("'banana'.count('an')"), Value::Int(2));
    assert_eq!(run("'banana'.find('na')"), Value::Int(2));
    assert_eq!(run("'banana'.rfind('na')"), Value::Int(4));
    assert_eq!(run("'abc'.startswith(('x', 'ab'))"), Value::Bool(true));
    assert_eq!(run("'abc'.endswith('bc')"), Value::Bool(true));
    assert_eq!(run("'5'.zfill(3)"), Value::str("005"));
    assert_eq!(run("'-5'.zfill(4)"), Value::str("-005"));
    assert_eq!(run("'ab'.center(6, '-')"), Value::str("--ab--"));
    assert_eq!(run("'aXbXc'.replace('X', '-', 1)"), Value::str("a-bXc"));
    assert_eq!(run("'abc'.removeprefix('ab')"), Value::str("c"));
    assert_eq!(run("'123'.isdigit()"), Value::Bool(true));
    assert_eq!(run("'a1'.isdigit()"), Value::Bool(false));
    assert_eq!(run("'{} and {}'.format(1, 'x')"), Value::str("1 and x"));
    assert_eq!(run("'{1}{0}'.format('a', 'b')"), Value::str("ba"));
    assert_eq!(run("'{v:>4}'.format(v=7)"), Value::str("   7"));
}

#[test]
fn test_fstrings() {
    assert_eq!(run("x = 6\nf'{x} * 7 = {x * 7}'"), Value::str("6 * 7 = 42"));
    assert_eq!(run("f'{3.14159:.2f}'"), Value::str("3.14"));
    assert_eq!(run("f'{\"hi\"!r}'"), Value::str("'hi'"));
}

#[test]
fn test_percent_formatting() {
    assert_eq!(run("'%s=%d' % ('n', 3)"), Value::str("n=3"));
    assert_eq!(run("'%05.2f' % 3.14159"), Value::str("03.14"));
    assert_eq!(run("'%x' % 255"), Value::str("ff"));
}

#[test]
fn test_lists() {
    assert_eq!(
        run("[1, 2, 3]"),
        Value::list(vec![Value::Int(1), Value::Int(2), Value::Int(3)])
    );
    assert_eq!(run("xs = [10, 20, 30]\nxs[0]"), Value::Int(10));
    assert_eq!(run("xs = [10, 20, 30]\nxs[-1]"), Value::Int(30));
    assert_eq!(run("[0, 1, 2, 3, 4][::2]"), run("[0, 2, 4]"));
    assert_eq!(run("[1, 2] + [3]"), run("[1, 2, 3]"));
    assert_eq!(run("[1] * 3"), run("[1, 1, 1]"));
    assert_eq!(run("[1] * 0"), run("[]"));
    assert_eq!(run("[1] * -5"), run("[]"));
}

#[test]
fn test_list_methods() {
    let src = r#"
xs = [3, 1]
xs.append(2)
xs.extend([5, 4])
xs.insert(0, 9)
xs.remove(1)
xs.sort()
xs
"#;
    assert_eq!(run(src), run("[2, 3, 4, 5, 9]"));
    assert_eq!(run("xs = [1, 2, 3]\nxs.pop()"), Value::Int(3));
    assert_eq!(run("xs = [1, 2, 3]\nxs.pop(0)\nxs"), run("[2, 3]"));
    assert_eq!(run("[1, 2, 1].count(1)"), Value::Int(2));
    assert_eq!(run("[1, 2, 3].index(2)"), Value::Int(1));
    assert_eq!(
        run("xs = [1, 2]\nys = xs.copy()\nys.append(3)\n[len(xs), len(ys)]"),
        run("[2, 3]")
    );
}

#[test]
fn test_list_aliasing_is_shared() {
    let src = r#"
xs = [1]
ys = xs
ys.append(2)
xs
"#;
    assert_eq!(run(src), run("[1, 2]"));
}

#[test]
fn test_slice_assignment_and_deletion() {
    assert_eq!(run("xs = [0, 1, 2, 3]\nxs[1:3] = [9]\nxs"), run("[0, 9, 3]"));
    assert_eq!(run("xs = [0, 1, 2, 3, 4]\ndel xs[::2]\nxs"), run("[1, 3]"));
    assert_eq!(run("xs = [0, 1, 2]\ndel xs[0]\nxs"), run("[1, 2]"));
}

#[test]
fn test_tuples() {
    assert_eq!(run("(1, 2)[1]"), Value::Int(2));
    assert_eq!(run("len((1,))"), Value::Int(1));
    assert_eq!(run("(1, 2) + (3,)"), run("(1, 2, 3)"));
    assert_eq!(run("(1, 2).count(2)"), Value::Int(1));
}

#[test]
fn test_dict_insertion_order() {
    let mut vm = Vm::new();
    vm.run("d = {}\nd['b'] = 2\nd['a'] = 1\nd['c'] = 3\nprint(list(d))")
        .unwrap();
    assert_eq!(vm.take_output(), "['b', 'a', 'c']\n");
}

#[test]
fn test_dict_overwrite_keeps_position() {
    assert_eq!(
        run("d = {'a': 1, 'b': 2}\nd['a'] = 9\nlist(d.items())"),
        run("[('a', 9), ('b', 2)]")
    );
}

#[test]
fn test_dict_methods() {
    assert_eq!(run("{'a': 1}.get('a')"), Value::Int(1));
    assert_eq!(run("{'a': 1}.get('b', 0)"), Value::Int(0));
    assert_eq!(run("d = {'a': 1}\nd.pop('a')"), Value::Int(1));
    assert_eq!(
        run("d = {'a': 1}\nd.setdefault('b', 2)\nsorted(d.values())"),
        run("[1, 2]")
    );
    assert_eq!(
        run("d = {'a': 1}\nd.update({'b': 2})\nlen(d)"),
        Value::Int(2)
    );
    assert_eq!(run("d = {'x': 1}\nd.popitem()"), run("('x', 1)"));
}

#[test]
fn test_dict_merge_operator() {
    assert_eq!(
        run("list(({'a': 1, 'b': 2} | {'b': 9, 'c': 3}).items())"),
        run("[('a', 1), ('b', 9), ('c', 3)]")
    );
    assert_eq!(run("{**{'a': 1}, 'b': 2}"), run("{'a': 1, 'b': 2}"));
}

#[test]
fn test_dict_keys_by_value_equality() {
    assert_eq!(run("d = {1: 'one'}\nd[1.0]"), Value::str("one"));
    assert_eq!(run("d = {1: 'one'}\nd[True]"), Value::str("one"));
    assert_eq!(run("d = {(1, 2): 'p'}\nd[(1, 2)]"), Value::str("p"));
}

#[test]
fn test_sets() {
    assert_eq!(run("len({1, 2, 2, 3})"), Value::Int(3));
    assert_eq!(run("sorted({1, 2} | {2, 3})"), run("[1, 2, 3]"));
    assert_eq!(run("sorted({1, 2, 3} & {2, 3, 4})"), run("[2, 3]"));
    assert_eq!(run("sorted({1, 2, 3} - {2})"), run("[1, 3]"));
    assert_eq!(run("sorted({1, 2} ^ {2, 3})"), run("[1, 3]"));
    assert_eq!(run("{1, 2} <= {1, 2, 3}"), Value::Bool(true));
    assert_eq!(run("{1, 2} < {1, 2}"), Value::Bool(false));
    assert_eq!(run("s = {1}\ns.add(2)\ns.discard(9)\nsorted(s)"), run("[1, 2]"));
    assert_eq!(run("{1, 2}.isdisjoint({3})"), Value::Bool(true));
}

#[test]
fn test_frozenset() {
    assert_eq!(run("len(frozenset([1, 1, 2]))"), Value::Int(2));
    // The result type follows the left operand.
    assert_eq!(
        run("type(frozenset([1]) | {2}).__name__"),
        Value::str("frozenset")
    );
    assert_eq!(
        run("hash(frozenset([1, 2, 3])) == hash(frozenset([3, 2, 1]))"),
        Value::Bool(true)
    );
}

#[test]
fn test_comparisons() {
    assert_eq!(run("5 > 3"), Value::Bool(true));
    assert_eq!(run("1 < 2 < 3"), Value::Bool(true));
    assert_eq!(run("1 < 2 > 5"), Value::Bool(false));
    assert_eq!(run("'abc' < 'abd'"), Value::Bool(true));
    assert_eq!(run("[1, 2] < [1, 3]"), Value::Bool(true));
    assert_eq!(run("(1, 2) == (1, 2)"), Value::Bool(true));
    assert_eq!(run("1 == 1.0"), Value::Bool(true));
    assert_eq!(run("[1] == (1,)"), Value::Bool(false));
    assert_eq!(run("float('nan') == float('nan')"), Value::Bool(false));
}

#[test]
fn test_identity() {
    assert_eq!(run("None is None"), Value::Bool(true));
    assert_eq!(run("a = 100 + 156\nb = 256\na is b"), Value::Bool(true));
    assert_eq!(run("('a' + 'b') is 'ab'"), Value::Bool(true));
    assert_eq!(run("[] is []"), Value::Bool(false));
    assert_eq!(run("xs = []\nys = xs\nxs is ys"), Value::Bool(true));
}

#[test]
fn test_membership() {
    assert_eq!(run("2 in [1, 2]"), Value::Bool(true));
    assert_eq!(run("'el' in 'hello'"), Value::Bool(true));
    assert_eq!(run("'a' in {'a': 1}"), Value::Bool(true));
    assert_eq!(run("5 not in range(3)"), Value::Bool(true));
    assert_eq!(run("4 in range(0, 10, 2)"), Value::Bool(true));
    assert_eq!(run("5 in range(0, 10, 2)"), Value::Bool(false));
}

#[test]
fn test_boolean_operators_return_operands() {
    assert_eq!(run("0 and 5"), Value::Int(0));
    assert_eq!(run("2 and 5"), Value::Int(5));
    assert_eq!(run("0 or 5"), Value::Int(5));
    assert_eq!(run("not 0"), Value::Bool(true));
}

#[test]
fn test_control_flow() {
    let src = r#"
x = 10
if x > 5:
    r = 'big'
else:
    r = 'small'
r
"#;
    assert_eq!(run(src), Value::str("big"));
}

#[test]
fn test_arithmetic_and_loop_scenario() {
    let mut vm = Vm::new();
    let src = "s=0\nfor i in range(10):\n    if i%2: s+=i\nprint(s)\n";
    vm.run(src).unwrap();
    assert_eq!(vm.take_output(), "25\n");
}

#[test]
fn test_while_loop_with_break_and_else() {
    let src = r#"
total = 0
i = 0
while True:
    i += 1
    if i > 4:
        break
    total += i
total
"#;
    assert_eq!(run(src), Value::Int(10));

    let src = r#"
r = []
for i in range(3):
    if i == 99:
        break
else:
    r.append('else ran')
r
"#;
    assert_eq!(run(src), run("['else ran']"));

    let src = r#"
r = []
for i in range(3):
    if i == 1:
        break
else:
    r.append('else ran')
r
"#;
    assert_eq!(run(src), run("[]"));
}

#[test]
fn test_continue() {
    let src = r#"
out = []
for i in range(6):
    if i % 2 == 0:
        continue
    out.append(i)
out
"#;
    assert_eq!(run(src), run("[1, 3, 5]"));
}

#[test]
fn test_functions_and_defaults() {
    let src = r#"
def greet(name, punct='!'):
    return 'hi ' + name + punct
[greet('a'), greet('b', '?')]
"#;
    assert_eq!(run(src), run("['hi a!', 'hi b?']"));
}

#[test]
fn test_varargs_and_kwargs() {
    let src = r#"
def f(a, *rest, **kw):
    return [a, len(rest), kw.get('k', 0)]
f(1, 2, 3, k=9)
"#;
    assert_eq!(run(src), run("[1, 2, 9]"));
}

#[test]
fn test_keyword_only_arguments() {
    let src = r#"
def f(a, *, b=1):
    return a + b
[f(1), f(1, b=10)]
"#;
    assert_eq!(run(src), run("[2, 11]"));
}

#[test]
fn test_call_spreading() {
    let src = r#"
def f(a, b, c):
    return a * 100 + b * 10 + c
f(*[1, 2], 3)
"#;
    assert_eq!(run(src), Value::Int(123));

    let src = r#"
def f(a, b):
    return a - b
f(**{'a': 10, 'b': 4})
"#;
    assert_eq!(run(src), Value::Int(6));
}

#[test]
fn test_recursion() {
    let src = r#"
def fact(n):
    if n <= 1:
        return 1
    return n * fact(n - 1)
fact(10)
"#;
    assert_eq!(run(src), Value::Int(3_628_800));
}

#[test]
fn test_closure_cells_are_shared() {
    let mut vm = Vm::new();
    let src = r#"
def make():
    x = 10
    def inc():
        nonlocal x
        x += 1
        return x
    return inc
f = make()
print(f(), f(), f())
"#;
    vm.run(src).unwrap();
    assert_eq!(vm.take_output(), "11 12 13\n");
}

#[test]
fn test_two_closures_share_one_cell() {
    let src = r#"
def make():
    x = 0
    def bump():
        nonlocal x
        x += 1
    def read():
        return x
    return bump, read
bump, read = make()
bump()
bump()
read()
"#;
    assert_eq!(run(src), Value::Int(2));
}

#[test]
fn test_global_statement() {
    let src = r#"
g = 0
def bump():
    global g
    g = g + 1
bump()
bump()
g
"#;
    assert_eq!(run(src), Value::Int(2));
}

#[test]
fn test_lambda() {
    assert_eq!(run("(lambda a, b=2: a + b)(1)"), Value::Int(3));
    assert_eq!(run("f = lambda x: x * x\nf(9)"), Value::Int(81));
}

#[test]
fn test_comprehensions() {
    assert_eq!(run("[x * x for x in range(4)]"), run("[0, 1, 4, 9]"));
    assert_eq!(
        run("[x for x in range(10) if x % 3 == 0]"),
        run("[0, 3, 6, 9]")
    );
    assert_eq!(
        run("[x * y for x in range(2) for y in range(2)]"),
        run("[0, 0, 0, 1]")
    );
    assert_eq!(run("sorted({x % 3 for x in range(9)})"), run("[0, 1, 2]"));
    assert_eq!(run("{k: k * k for k in range(3)}[2]"), Value::Int(4));
    assert_eq!(run("sum(x * x for x in range(4))"), Value::Int(14));
}

#[test]
fn test_unpacking() {
    assert_eq!(run("a, b = [1, 2]\na + b"), Value::Int(3));
    assert_eq!(run("a, b = b, a = 1, 2\n[a, b]"), run("[2, 1]"));
    assert_eq!(run("a, *mid, z = range(5)\n[a, mid, z]"), run("[0, [1, 2, 3], 4]"));
    assert_eq!(run("[1, *[2, 3], 4]"), run("[1, 2, 3, 4]"));
}

#[test]
fn test_conditional_expression_and_walrus() {
    assert_eq!(run("'yes' if 1 > 0 else 'no'"), Value::str("yes"));
    assert_eq!(run("(y := 5) + y"), Value::Int(10));
}

#[test]
fn test_builtin_len_sum_abs() {
    assert_eq!(run("len([1, 2, 3])"), Value::Int(3));
    assert_eq!(run("sum([1, 2, 3])"), Value::Int(6));
    assert_eq!(run("sum([1, 2], 10)"), Value::Int(13));
    assert_eq!(run("abs(-5)"), Value::Int(5));
    assert_eq!(run("abs(-2.5)"), Value::Float(2.5));
    assert_eq!(run("abs(3 + 4j)"), Value::Float(5.0));
}

#[test]
fn test_min_max() {
    assert_eq!(run("min([3, 1, 2])"), Value::Int(1));
    assert_eq!(run("max(3, 1, 2)"), Value::Int(3));
    assert_eq!(run("min([], default=42)"), Value::Int(42));
    assert_eq!(run("max(['bb', 'a', 'ccc'], key=len)"), Value::str("ccc"));
}

#[test]
fn test_sorted_is_stable() {
    assert_eq!(run("sorted([3, 1, 2])"), run("[1, 2, 3]"));
    assert_eq!(
        run("sorted(['bb', 'a', 'ccc'], key=len)"),
        run("['a', 'bb', 'ccc']")
    );
    // Stability: equal keys keep their input order, in both directions.
    assert_eq!(
        run("sorted([('b', 2), ('a', 1), ('c', 2), ('d', 1)], key=lambda p: p[1])"),
        run("[('a', 1), ('d', 1), ('b', 2), ('c', 2)]")
    );
    assert_eq!(
        run("sorted([('b', 2), ('a', 1), ('c', 2)], key=lambda p: p[1], reverse=True)"),
        run("[('b', 2), ('c', 2), ('a', 1)]")
    );
}

#[test]
fn test_map_filter_zip_enumerate() {
    assert_eq!(run("list(map(lambda x: x * 2, [1, 2]))"), run("[2, 4]"));
    assert_eq!(
        run("list(filter(lambda x: x % 2, range(6)))"),
        run("[1, 3, 5]")
    );
    assert_eq!(run("list(filter(None, [0, 1, '', 'a']))"), run("[1, 'a']"));
    assert_eq!(
        run("list(zip([1, 2, 3], 'ab'))"),
        run("[(1, 'a'), (2, 'b')]")
    );
    assert_eq!(
        run("list(enumerate('ab', start=1))"),
        run("[(1, 'a'), (2, 'b')]")
    );
    assert_eq!(run("list(reversed([1, 2, 3]))"), run("[3, 2, 1]"));
    assert_eq!(run("list(reversed(range(3)))"), run("[2, 1, 0]"));
}

#[test]
fn test_iterators_are_single_pass() {
    let src = r#"
it = iter([1, 2])
a = next(it)
b = next(it)
c = next(it, 'done')
[a, b, c]
"#;
    assert_eq!(run(src), run("[1, 2, 'done']"));
    assert_eq!(run("it = iter([1])\niter(it) is it"), Value::Bool(true));
}

#[test]
fn test_any_all() {
    assert_eq!(run("any([0, '', 3])"), Value::Bool(true));
    assert_eq!(run("all([1, 'a'])"), Value::Bool(true));
    assert_eq!(run("all([1, 0])"), Value::Bool(false));
    assert_eq!(run("any([])"), Value::Bool(false));
    assert_eq!(run("all([])"), Value::Bool(true));
}

#[test]
fn test_number_conversions() {
    assert_eq!(run("int('42')"), Value::Int(42));
    assert_eq!(run("int('  -7  ')"), Value::Int(-7));
    assert_eq!(run("int('ff', 16)"), Value::Int(255));
    assert_eq!(run("int('0b101', 0)"), Value::Int(5));
    assert_eq!(run("int(3.9)"), Value::Int(3));
    assert_eq!(run("int(-3.9)"), Value::Int(-3));
    assert_eq!(run("float('2.5')"), Value::Float(2.5));
    assert_eq!(run("float('inf') > 10 ** 100"), Value::Bool(true));
    assert_eq!(run("str(3.0)"), Value::str("3.0"));
    assert_eq!(run("int(str(98765)) == 98765"), Value::Bool(true));
}

#[test]
fn test_hex_oct_bin_chr_ord() {
    assert_eq!(run("hex(255)"), Value::str("0xff"));
    assert_eq!(run("hex(-255)"), Value::str("-0xff"));
    assert_eq!(run("oct(8)"), Value::str("0o10"));
    assert_eq!(run("bin(5)"), Value::str("0b101"));
    assert_eq!(run("chr(97)"), Value::str("a"));
    assert_eq!(run("ord('a')"), Value::Int(97));
    assert_eq!(run("ord(chr(955))"), Value::Int(955));
}

#[test]
fn test_pow_and_round() {
    assert_eq!(run("pow(2, 10)"), Value::Int(1024));
    assert_eq!(run("pow(3, 100, 7)"), Value::Int(4));
    assert_eq!(run("round(0.5)"), Value::Int(0));
    assert_eq!(run("round(1.5)"), Value::Int(2));
    assert_eq!(run("round(2.5)"), Value::Int(2));
    assert_eq!(run("round(-0.5)"), Value::Int(0));
    assert_eq!(run("round(3.14159, 2)"), Value::Float(3.14));
    assert_eq!(run("round(12345, -2)"), Value::Int(12300));
}

#[test]
fn test_hash_invariants() {
    assert_eq!(run("hash(1) == hash(1.0)"), Value::Bool(true));
    assert_eq!(run("hash(True) == hash(1)"), Value::Bool(true));
    assert_eq!(
        run("hash((1, 2)) == hash(tuple(list((1, 2))))"),
        Value::Bool(true)
    );
}

#[test]
fn test_repr_and_str() {
    assert_eq!(run("repr('hi')"), Value::str("'hi'"));
    assert_eq!(run("repr([1, 'a'])"), Value::str("[1, 'a']"));
    assert_eq!(run("repr((1,))"), Value::str("(1,)"));
    assert_eq!(run("repr(set())"), Value::str("set()"));
    assert_eq!(run("repr(frozenset())"), Value::str("frozenset()"));
    assert_eq!(run("str(None)"), Value::str("None"));
    assert_eq!(run("repr(1.0)"), Value::str("1.0"));
    assert_eq!(run("repr(10 ** 16 / 1)"), Value::str("1e+16"));
    assert_eq!(run("ascii('é')"), Value::str("'\\xe9'"));
    assert_eq!(run("repr(range(3))"), Value::str("range(0, 3)"));
    assert_eq!(run("repr(b'ab\\n')"), Value::str("b'ab\\n'"));
}

#[test]
fn test_ranges() {
    assert_eq!(run("list(range(3))"), run("[0, 1, 2]"));
    assert_eq!(run("list(range(2, 10, 3))"), run("[2, 5, 8]"));
    assert_eq!(run("list(range(3, 0, -1))"), run("[3, 2, 1]"));
    assert_eq!(run("len(range(0, 10, 3))"), Value::Int(4));
    assert_eq!(run("range(10)[-1]"), Value::Int(9));
    assert_eq!(run("list(range(0, 0, 1))"), run("[]"));
    assert_eq!(run("list(range(0, 0, -1))"), run("[]"));
    assert_eq!(run("range(0, 4) == range(0, 4, 1)"), Value::Bool(true));
}

#[test]
fn test_bytes() {
    assert_eq!(run("len(b'abc')"), Value::Int(3));
    assert_eq!(run("b'abc'[0]"), Value::Int(97));
    assert_eq!(run("b'a' + b'b'"), run("b'ab'"));
    assert_eq!(run("bytes([65, 66]).decode()"), Value::str("AB"));
    assert_eq!(run("'hi'.encode()"), run("b'hi'"));
    assert_eq!(run("b'\\x01\\x02'.hex()"), Value::str("0102"));
    assert_eq!(run("bytes(list(b'xyz')) == b'xyz'"), Value::Bool(true));
    assert_eq!(run("98 in b'abc'"), Value::Bool(true));
}

#[test]
fn test_float_hex_roundtrip() {
    assert_eq!(
        run("float.fromhex((3.14159).hex()) == 3.14159"),
        Value::Bool(true)
    );
    assert_eq!(run("float.fromhex((0.1).hex()) == 0.1"), Value::Bool(true));
}

#[test]
fn test_complex_numbers() {
    assert_eq!(run("(1 + 2j) + (3 - 1j)"), Value::complex(4.0, 1.0));
    assert_eq!(run("(1j) * (1j)"), Value::complex(-1.0, 0.0));
    assert_eq!(run("(3 + 4j).real"), Value::Float(3.0));
    assert_eq!(run("(3 + 4j).imag"), Value::Float(4.0));
    assert_eq!(run("(3 + 4j).conjugate()"), Value::complex(3.0, -4.0));
    assert_eq!(run("complex(1, 2) == 1 + 2j"), Value::Bool(true));
}

#[test]
fn test_int_attributes() {
    assert_eq!(run("(255).bit_length()"), Value::Int(8));
    assert_eq!(run("(7).numerator"), Value::Int(7));
    assert_eq!(run("(7).denominator"), Value::Int(1));
    assert_eq!(run("(7).real"), Value::Int(7));
    assert_eq!(run("(7).imag"), Value::Int(0));
    assert_eq!(run("(2.0).is_integer()"), Value::Bool(true));
    assert_eq!(run("(2.5).is_integer()"), Value::Bool(false));
}

#[test]
fn test_isinstance_issubclass() {
    assert_eq!(run("isinstance(1, int)"), Value::Bool(true));
    assert_eq!(run("isinstance(1.0, int)"), Value::Bool(false));
    assert_eq!(run("isinstance('a', (int, str))"), Value::Bool(true));
    assert_eq!(run("isinstance(1, int | str)"), Value::Bool(true));
    assert_eq!(run("isinstance([], object)"), Value::Bool(true));
    assert_eq!(run("issubclass(bool, int)"), Value::Bool(true));
    assert_eq!(run("issubclass(int, object)"), Value::Bool(true));
    assert_eq!(run("isinstance([1], list[int])"), Value::Bool(true));
    assert_eq!(run("callable(len)"), Value::Bool(true));
    assert_eq!(run("callable(3)"), Value::Bool(false));
}

#[test]
fn test_getattr_setattr_hasattr_dir() {
    assert_eq!(run("getattr('x', 'upper')()"), Value::str("X"));
    assert_eq!(run("getattr(3, 'missing', 'dflt')"), Value::str("dflt"));
    assert_eq!(run("hasattr([], 'append')"), Value::Bool(true));
    assert_eq!(run("hasattr([], 'nope')"), Value::Bool(false));
    assert_eq!(run("'append' in dir([])"), Value::Bool(true));
    assert_eq!(run("'keys' in dir({})"), Value::Bool(true));
}

#[test]
fn test_print_kwargs() {
    let mut vm = Vm::new();
    vm.run("print(1, 2, sep='-', end='!')").unwrap();
    assert_eq!(vm.take_output(), "1-2!");
}

#[test]
fn test_globals_persist_across_runs() {
    let mut vm = Vm::new();
    vm.run("x = 10").unwrap();
    vm.run("y = 20").unwrap();
    assert_eq!(vm.run("x + y").unwrap(), Value::Int(30));
}

#[test]
fn test_math_module() {
    let mut vm = Vm::new();
    assert_eq!(vm.run("import math\nmath.sqrt(16.0)").unwrap(), Value::Float(4.0));
    assert_eq!(vm.run("math.floor(3.7)").unwrap(), Value::Int(3));
    assert_eq!(vm.run("math.ceil(3.2)").unwrap(), Value::Int(4));
    assert_eq!(vm.run("math.gcd(12, 18)").unwrap(), Value::Int(6));
    assert_eq!(vm.run("math.pi > 3.14").unwrap(), Value::Bool(true));
    assert_eq!(vm.run("str(math.factorial(20))").unwrap(), Value::str("2432902008176640000"));
}

#[test]
fn test_json_module() {
    let mut vm = Vm::new();
    let src = r#"
import json
d = json.loads('{"a": [1, 2.5, true, null]}')
[d['a'][0], d['a'][2], d['a'][3]]
"#;
    assert_eq!(vm.run(src).unwrap(), {
        Value::list(vec![Value::Int(1), Value::Bool(true), Value::None])
    });
    assert_eq!(
        vm.run("json.dumps({'x': 1})").unwrap(),
        Value::str("{\"x\":1}")
    );
}

#[test]
fn test_from_import() {
    let mut vm = Vm::new();
    assert_eq!(
        vm.run("from math import sqrt, pi\nsqrt(pi * 0 + 4.0)").unwrap(),
        Value::Float(2.0)
    );
    assert_eq!(
        vm.run("from math import sqrt as s\ns(9.0)").unwrap(),
        Value::Float(3.0)
    );
}

#[test]
fn test_del_statement() {
    let mut vm = Vm::new();
    let result = vm.run("x = 1\ndel x\nx");
    assert!(result.is_err());
}
