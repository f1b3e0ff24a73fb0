use krait::{Value, Vm};
use pretty_assertions::assert_eq;

fn run(src: &str) -> Value {
    Vm::new().run(src).unwrap()
}

#[test]
fn test_basic_class() {
    let src = r#"
class Point:
    def __init__(self, x, y):
        self.x = x
        self.y = y
    def norm2(self):
        return self.x * self.x + self.y * self.y
p = Point(3, 4)
[p.x, p.y, p.norm2()]
"#;
    assert_eq!(run(src), run("[3, 4, 25]"));
}

#[test]
fn test_instance_dict_is_live() {
    let src = r#"
class Bag:
    pass
b = Bag()
b.x = 1
b.__dict__['y'] = 2
d = b.__dict__
d['z'] = 3
[b.x, b.y, b.z, sorted(d.keys())]
"#;
    assert_eq!(run(src), run("[1, 2, 3, ['x', 'y', 'z']]"));
}

#[test]
fn test_inheritance_and_override() {
    let src = r#"
class A:
    def who(self):
        return 'A'
    def hello(self):
        return 'hello ' + self.who()
class B(A):
    def who(self):
        return 'B'
[A().hello(), B().hello()]
"#;
    assert_eq!(run(src), run("['hello A', 'hello B']"));
}

#[test]
fn test_diamond_mro_is_c3() {
    let src = r#"
class A: pass
class B(A): pass
class C(A): pass
class D(B, C): pass
[k.__name__ for k in D.__mro__]
"#;
    assert_eq!(run(src), run("['D', 'B', 'C', 'A', 'object']"));
}

#[test]
fn test_mro_method_resolution_order() {
    let src = r#"
class A:
    def f(self): return 'A'
class B(A):
    pass
class C(A):
    def f(self): return 'C'
class D(B, C):
    pass
D().f()
"#;
    assert_eq!(run(src), Value::str("C"));
}

#[test]
fn test_inconsistent_mro_raises_type_error() {
    let src = r#"
class A: pass
class B(A): pass
try:
    class C(A, B): pass
    r = 'built'
except TypeError:
    r = 'rejected'
r
"#;
    assert_eq!(run(src), Value::str("rejected"));
}

#[test]
fn test_property_scenario() {
    let mut vm = Vm::new();
    let src = r#"
class P:
    @property
    def v(self): return self._v * 2
    @v.setter
    def v(self, x): self._v = x
p = P()
p.v = 7
print(p.v)
"#;
    vm.run(src).unwrap();
    assert_eq!(vm.take_output(), "14\n");
}

#[test]
fn test_property_without_setter_rejects_writes() {
    let src = r#"
class R:
    @property
    def v(self): return 1
try:
    R().v = 5
    r = 'wrote'
except AttributeError:
    r = 'read-only'
r
"#;
    assert_eq!(run(src), Value::str("read-only"));
}

#[test]
fn test_classmethod_staticmethod() {
    let src = r#"
class C:
    @staticmethod
    def s():
        return 1
    @classmethod
    def c(cls):
        return cls.__name__
[C.s(), C().s(), C.c(), C().c()]
"#;
    assert_eq!(run(src), run("[1, 1, 'C', 'C']"));
}

#[test]
fn test_non_data_descriptor() {
    let src = r#"
class Ten:
    def __get__(self, obj, objtype):
        return 10
class H:
    x = Ten()
H().x
"#;
    assert_eq!(run(src), Value::Int(10));
}

#[test]
fn test_data_descriptor_shadows_instance_dict() {
    let src = r#"
class Guard:
    def __get__(self, obj, objtype):
        return 'guarded'
    def __set__(self, obj, value):
        obj.__dict__['backing'] = value
class H:
    x = Guard()
h = H()
h.x = 5
[h.x, h.backing]
"#;
    assert_eq!(run(src), run("['guarded', 5]"));
}

#[test]
fn test_getattr_fallback() {
    let src = r#"
class D:
    def __getattr__(self, name):
        return name.upper()
d = D()
d.real_attr = 1
[d.real_attr, d.missing]
"#;
    assert_eq!(run(src), run("[1, 'MISSING']"));
}

#[test]
fn test_setattr_hook() {
    let src = r#"
class Logged:
    def __setattr__(self, name, value):
        self.__dict__[name] = value * 2
l = Logged()
l.x = 21
l.x
"#;
    assert_eq!(run(src), Value::Int(42));
}

#[test]
fn test_slots() {
    let src = r#"
class S:
    __slots__ = ('a', 'b')
    def __init__(self):
        self.a = 1
s = S()
s.b = 2
try:
    s.c = 3
    r = 'wrote'
except AttributeError:
    r = 'rejected'
[s.a, s.b, r]
"#;
    assert_eq!(run(src), run("[1, 2, 'rejected']"));
}

#[test]
fn test_operator_dunders() {
    let src = r#"
class Vec:
    def __init__(self, x):
        self.x = x
    def __add__(self, other):
        return Vec(self.x + other.x)
    def __mul__(self, k):
        return Vec(self.x * k)
    def __eq__(self, other):
        return self.x == other.x
    def __repr__(self):
        return 'Vec(%d)' % self.x
v = Vec(1) + Vec(2)
[repr(v * 3), Vec(2) == Vec(2), Vec(2) == Vec(3)]
"#;
    assert_eq!(run(src), run("['Vec(9)', True, False]"));
}

#[test]
fn test_reflected_dunder_after_not_implemented() {
    let src = r#"
class L:
    def __add__(self, other):
        return NotImplemented
class R:
    def __radd__(self, other):
        return 'radd'
L() + R()
"#;
    assert_eq!(run(src), Value::str("radd"));
}

#[test]
fn test_ordering_dunders() {
    let src = r#"
class Box:
    def __init__(self, n):
        self.n = n
    def __lt__(self, other):
        return self.n < other.n
sorted([Box(3), Box(1), Box(2)], key=lambda b: b)[0].n
"#;
    assert_eq!(run(src), Value::Int(1));
}

#[test]
fn test_str_and_repr_dunders() {
    let src = r#"
class Name:
    def __repr__(self):
        return '<name>'
class Both:
    def __repr__(self):
        return 'r'
    def __str__(self):
        return 's'
[str(Name()), repr(Name()), str(Both()), repr(Both())]
"#;
    assert_eq!(run(src), run("['<name>', '<name>', 's', 'r']"));
}

#[test]
fn test_callable_instances() {
    let src = r#"
class Adder:
    def __init__(self, n):
        self.n = n
    def __call__(self, x):
        return x + self.n
add5 = Adder(5)
[add5(1), callable(add5)]
"#;
    assert_eq!(run(src), run("[6, True]"));
}

#[test]
fn test_container_dunders() {
    let src = r#"
class Grid:
    def __init__(self):
        self.cells = {}
    def __getitem__(self, key):
        return self.cells.get(key, 0)
    def __setitem__(self, key, value):
        self.cells[key] = value
    def __len__(self):
        return len(self.cells)
    def __contains__(self, key):
        return key in self.cells
g = Grid()
g['a'] = 1
[g['a'], g['b'], len(g), 'a' in g, 'b' in g]
"#;
    assert_eq!(run(src), run("[1, 0, 1, True, False]"));
}

#[test]
fn test_bool_via_len() {
    let src = r#"
class Empty:
    def __len__(self):
        return 0
class Full:
    def __len__(self):
        return 3
[bool(Empty()), bool(Full())]
"#;
    assert_eq!(run(src), run("[False, True]"));
}

#[test]
fn test_iter_dunder() {
    let src = r#"
class Countdown:
    def __init__(self, n):
        self.n = n
    def __iter__(self):
        return self
    def __next__(self):
        if self.n <= 0:
            raise StopIteration
        self.n -= 1
        return self.n + 1
list(Countdown(3))
"#;
    assert_eq!(run(src), run("[3, 2, 1]"));
}

#[test]
fn test_class_attributes_are_shared() {
    let src = r#"
class Counter:
    total = 0
    def bump(self):
        Counter.total = Counter.total + 1
a = Counter()
b = Counter()
a.bump()
b.bump()
[Counter.total, a.total, b.total]
"#;
    assert_eq!(run(src), run("[2, 2, 2]"));
}

#[test]
fn test_class_and_instance_introspection() {
    let src = r#"
class C:
    pass
c = C()
[type(c).__name__, c.__class__.__name__, C.__class__.__name__, type(C).__name__]
"#;
    assert_eq!(run(src), run("['C', 'C', 'type', 'type']"));
}

#[test]
fn test_isinstance_with_user_classes() {
    let src = r#"
class Animal: pass
class Dog(Animal): pass
d = Dog()
[isinstance(d, Dog), isinstance(d, Animal), isinstance(d, object),
 issubclass(Dog, Animal), issubclass(Animal, Dog)]
"#;
    assert_eq!(run(src), run("[True, True, True, True, False]"));
}

#[test]
fn test_virtual_subclass_registration() {
    let src = r#"
class Base: pass
class Other: pass
Base.register(Other)
[isinstance(Other(), Base), issubclass(Other, Base)]
"#;
    assert_eq!(run(src), run("[True, True]"));
}

#[test]
fn test_metaclass_instancecheck() {
    let src = r#"
class Meta:
    def __instancecheck__(cls, obj):
        return obj == 42
class AnswerLike(metaclass=Meta):
    pass
[isinstance(42, AnswerLike), isinstance(7, AnswerLike)]
"#;
    assert_eq!(run(src), run("[True, False]"));
}

#[test]
fn test_type_with_three_arguments() {
    let src = r#"
C = type('C', (), {'x': 10})
[C.__name__, C().x]
"#;
    assert_eq!(run(src), run("['C', 10]"));
}

#[test]
fn test_unhashable_when_eq_without_hash() {
    let src = r#"
class K:
    def __eq__(self, other):
        return True
try:
    {K(): 1}
    r = 'hashed'
except TypeError:
    r = 'unhashable'
r
"#;
    assert_eq!(run(src), Value::str("unhashable"));
}

#[test]
fn test_custom_hash() {
    let src = r#"
class K:
    def __init__(self, n):
        self.n = n
    def __hash__(self):
        return self.n % 10
hash(K(42))
"#;
    assert_eq!(run(src), Value::Int(2));
}

#[test]
fn test_class_decorator() {
    let src = r#"
def tag(cls):
    cls.tagged = True
    return cls

@tag
class T:
    pass
T.tagged
"#;
    assert_eq!(run(src), Value::Bool(true));
}

#[test]
fn test_function_decorator() {
    let src = r#"
def twice(f):
    def wrapper(x):
        return f(f(x))
    return wrapper

@twice
def inc(x):
    return x + 1
inc(10)
"#;
    assert_eq!(run(src), Value::Int(12));
}

#[test]
fn test_del_attribute() {
    let src = r#"
class B: pass
b = B()
b.x = 1
del b.x
hasattr(b, 'x')
"#;
    assert_eq!(run(src), Value::Bool(false));
}

#[test]
fn test_class_body_sees_enclosing_scope() {
    let src = r#"
def build(n):
    class Holder:
        def get(self):
            return n
    return Holder
build(7)().get()
"#;
    assert_eq!(run(src), Value::Int(7));
}

#[test]
fn test_method_bound_to_instance() {
    let src = r#"
class C:
    def __init__(self, v):
        self.v = v
    def get(self):
        return self.v
m = C(9).get
m()
"#;
    assert_eq!(run(src), Value::Int(9));
}

#[test]
fn test_unbound_builtin_method() {
    assert_eq!(run("str.upper('abc')"), Value::str("ABC"));
    assert_eq!(run("callable(list.append)"), Value::Bool(true));
}
