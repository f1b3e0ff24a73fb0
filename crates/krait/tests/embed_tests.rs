use std::rc::Rc;

use krait::{
    raise_error, BinOp, CancelToken, CodeBuilder, Error, Limits, Metatable, Opcode, Value,
    Vm,
};
use pretty_assertions::assert_eq;

#[test]
fn test_register_native_function() {
    let mut vm = Vm::new();
    vm.register("add_numbers", |_vm, args| {
        let a = args.check_int(1)?;
        let b = args.check_int(2)?;
        Ok(Value::Int(a + b))
    });
    assert_eq!(vm.run("add_numbers(10, 20) * 2").unwrap(), Value::Int(60));
}

#[test]
fn test_native_function_argument_errors_are_typed() {
    let mut vm = Vm::new();
    vm.register("needs_int", |_vm, args| {
        let n = args.check_int(1)?;
        Ok(Value::Int(n))
    });
    let src = r#"
try:
    needs_int('not a number')
    r = 'accepted'
except TypeError as e:
    r = str(e)
r
"#;
    assert_eq!(
        vm.run(src).unwrap(),
        Value::str("argument 1 must be int, not str")
    );
}

#[test]
fn test_native_function_optional_args() {
    let mut vm = Vm::new();
    vm.register("clamp", |_vm, args| {
        let x = args.check_int(1)?;
        let lo = args.opt_int(2, 0);
        let hi = args.opt_int(3, 100);
        Ok(Value::Int(x.clamp(lo, hi)))
    });
    assert_eq!(vm.run("clamp(250)").unwrap(), Value::Int(100));
    assert_eq!(vm.run("clamp(250, 0, 99)").unwrap(), Value::Int(99));
    assert_eq!(vm.run("clamp(-5)").unwrap(), Value::Int(0));
}

#[test]
fn test_native_function_kwargs() {
    let mut vm = Vm::new();
    vm.register("describe", |_vm, args| {
        let name = args.check_str(1)?;
        let shout = args
            .kwarg("shout")
            .map(|v| v.is_truthy())
            .unwrap_or(false);
        let out = if shout { name.to_uppercase() } else { name };
        Ok(Value::str(out))
    });
    assert_eq!(vm.run("describe('bob')").unwrap(), Value::str("bob"));
    assert_eq!(
        vm.run("describe('bob', shout=True)").unwrap(),
        Value::str("BOB")
    );
}

#[test]
fn test_raise_error_from_native() {
    let mut vm = Vm::new();
    vm.register("explode", |_vm, _args| {
        Err(raise_error("ValueError: the gasket failed"))
    });
    let src = r#"
try:
    explode()
    r = 'fine'
except ValueError as e:
    r = str(e)
r
"#;
    assert_eq!(vm.run(src).unwrap(), Value::str("the gasket failed"));
}

#[test]
fn test_native_reentry_into_python() {
    let mut vm = Vm::new();
    vm.register("apply_twice", |vm, args| {
        let f = args.check_any(1)?;
        let x = args.check_any(2)?;
        let once = vm.call(f.clone(), vec![x])?;
        vm.call(f, vec![once])
    });
    let src = r#"
def double(x):
    return x * 2
apply_twice(double, 5)
"#;
    assert_eq!(vm.run(src).unwrap(), Value::Int(20));
}

#[test]
fn test_globals_and_builtins_accessors() {
    let mut vm = Vm::new();
    vm.set_global("answer", Value::Int(42));
    assert_eq!(vm.run("answer").unwrap(), Value::Int(42));
    assert_eq!(vm.get_global("answer"), Value::Int(42));
    assert_eq!(vm.get_global("missing"), Value::None);

    vm.set_builtin("shadow_me", Value::Int(1));
    vm.run("shadow_me = 2").unwrap();
    assert_eq!(vm.run("shadow_me").unwrap(), Value::Int(2));
    vm.run("del shadow_me").unwrap();
    assert_eq!(vm.run("shadow_me").unwrap(), Value::Int(1));
    assert_eq!(vm.get_builtin("missing"), Value::None);
}

#[test]
fn test_stack_api() {
    let mut vm = Vm::new();
    vm.push(Value::Int(1));
    vm.push(Value::str("two"));
    vm.push(Value::Float(3.0));
    assert_eq!(vm.get_top(), 3);

    // 1-based from the bottom, negative from the top.
    assert_eq!(vm.get(1), Value::Int(1));
    assert_eq!(vm.get(-1), Value::Float(3.0));
    assert_eq!(vm.get(-3), Value::Int(1));
    // Out of range reads are None rather than errors.
    assert_eq!(vm.get(99), Value::None);
    assert_eq!(vm.get(-99), Value::None);
    assert_eq!(vm.get(0), Value::None);

    assert_eq!(vm.check_int(1).unwrap(), 1);
    assert!(vm.check_int(2).is_err());
    assert_eq!(vm.check_str(2).unwrap(), "two");
    assert_eq!(vm.check_float(-1).unwrap(), 3.0);

    assert_eq!(vm.to_int(3), 3);
    assert_eq!(vm.to_string_at(1), "1");
    assert_eq!(vm.opt_int(99, 7), 7);
    assert!(vm.to_bool(2));

    // set_top: positive is absolute; non-positive addresses SP + n + 1, so
    // -1 names the current top and -2 drops one element.
    vm.set_top(-1);
    assert_eq!(vm.get_top(), 3);
    vm.set_top(-2);
    assert_eq!(vm.get_top(), 2);
    vm.set_top(4);
    assert_eq!(vm.get_top(), 4);
    assert_eq!(vm.get(4), Value::None);
    assert_eq!(vm.pop(), Value::None);
    vm.set_top(1);
    assert_eq!(vm.get_top(), 1);
    assert_eq!(vm.pop(), Value::Int(1));
    assert_eq!(vm.pop(), Value::None);
}

#[test]
fn test_user_data_with_metatable() {
    struct Point {
        x: f64,
        y: f64,
    }

    let mut vm = Vm::new();
    let mut meta = Metatable::new("point");
    meta.method("norm", |_vm, args| {
        let ud = args.check_user_data(1)?;
        let p = ud.data.downcast_ref::<Point>().expect("point userdata");
        Ok(Value::Float(p.x.hypot(p.y)))
    });
    meta.property("x", |_vm, args| {
        let ud = args.check_user_data(1)?;
        let p = ud.data.downcast_ref::<Point>().expect("point userdata");
        Ok(Value::Float(p.x))
    });
    let meta = Rc::new(meta);

    let point = vm.new_user_data(Rc::new(Point { x: 3.0, y: 4.0 }), Some(meta));
    vm.set_global("p", point);

    assert_eq!(vm.run("p.norm()").unwrap(), Value::Float(5.0));
    assert_eq!(vm.run("p.x").unwrap(), Value::Float(3.0));
    assert_eq!(vm.run("repr(p)").unwrap(), Value::str("<point userdata>"));
}

#[test]
fn test_module_registration_is_lazy() {
    use std::cell::Cell;
    use std::rc::Rc as StdRc;

    let loaded = StdRc::new(Cell::new(false));
    let seen = loaded.clone();

    let mut vm = Vm::new();
    vm.register_module("lazy", move |m| {
        seen.set(true);
        m.constant("VALUE", Value::Int(9));
    });
    assert!(!loaded.get());
    assert_eq!(vm.run("import lazy\nlazy.VALUE").unwrap(), Value::Int(9));
    assert!(loaded.get());
    // Cached: the loader does not run again.
    loaded.set(false);
    assert_eq!(vm.run("import lazy\nlazy.VALUE").unwrap(), Value::Int(9));
    assert!(!loaded.get());
}

#[test]
fn test_submodules() {
    let mut vm = Vm::new();
    vm.register_module("pkg", |m| {
        m.constant("NAME", Value::str("pkg"));
    });
    vm.register_module("pkg.util", |m| {
        m.function("triple", |_vm, args| {
            let n = args.check_int(1)?;
            Ok(Value::Int(n * 3))
        });
    });
    assert_eq!(
        vm.run("import pkg.util\npkg.util.triple(5)").unwrap(),
        Value::Int(15)
    );
    assert_eq!(
        vm.run("from pkg import util\nutil.triple(2)").unwrap(),
        Value::Int(6)
    );
}

#[test]
fn test_missing_module() {
    let mut vm = Vm::new();
    match vm.run("import does_not_exist") {
        Err(Error::Exception(e)) => {
            assert_eq!(e.type_name(), "ModuleNotFoundError");
            assert_eq!(e.message(), "No module named 'does_not_exist'");
        }
        other => panic!("expected ModuleNotFoundError, got {other:?}"),
    }
}

#[test]
fn test_module_instance_registration() {
    let mut vm = Vm::new();
    let module = Value::dict();
    if let Value::Dict(d) = &module {
        d.borrow_mut().insert_str("flag", Value::Bool(true));
    }
    vm.register_module_instance("cfg", module);
    assert_eq!(vm.run("import cfg\ncfg.flag").unwrap(), Value::Bool(true));
}

#[test]
fn test_instruction_limit_is_uncatchable() {
    let mut vm = Vm::with_limits(Limits::default().with_max_instructions(10_000));
    let src = "try:\n    while True:\n        pass\nexcept BaseException:\n    pass\n";
    match vm.run(src) {
        Err(Error::InstructionLimit(limit)) => assert_eq!(limit, 10_000),
        other => panic!("expected instruction limit, got {other:?}"),
    }
}

#[test]
fn test_recursion_limit() {
    let mut vm = Vm::with_limits(Limits::default().with_max_recursion(64));
    let src = r#"
def down(n):
    return down(n + 1)
try:
    down(0)
    r = 'finished'
except RecursionError:
    r = 'limited'
r
"#;
    assert_eq!(vm.run(src).unwrap(), Value::str("limited"));
}

#[test]
fn test_collection_size_limit() {
    let mut vm = Vm::with_limits(Limits::default().with_max_collection_size(100));
    let src = r#"
try:
    xs = list(range(1000))
    r = 'built'
except MemoryError:
    r = 'limited'
r
"#;
    assert_eq!(vm.run(src).unwrap(), Value::str("limited"));
}

#[test]
fn test_repetition_caps_raise_memory_error() {
    let mut vm = Vm::new();
    let src = r#"
try:
    xs = [0] * (10 ** 12)
    r = 'built'
except MemoryError:
    r = 'capped'
r
"#;
    assert_eq!(vm.run(src).unwrap(), Value::str("capped"));
}

#[test]
fn test_cancellation() {
    let mut vm = Vm::new();
    let token = CancelToken::new();
    token.cancel();
    let code = vm
        .compile("i = 0\nwhile i < 10 ** 9:\n    i = i + 1\n", "<loop>")
        .unwrap();
    match vm.execute_with_cancel(code, token) {
        Err(Error::Cancelled) => {}
        other => panic!("expected cancellation, got {other:?}"),
    }
}

#[test]
fn test_check_interval_minimum() {
    let mut vm = Vm::new();
    vm.set_check_interval(0);
    // Still executes; the interval clamps to one instruction.
    assert_eq!(vm.run("1 + 1").unwrap(), Value::Int(2));
}

#[test]
fn test_output_capture() {
    let mut vm = Vm::new();
    vm.run("print('a')\nprint('b')").unwrap();
    assert_eq!(vm.take_output(), "a\nb\n");
    assert_eq!(vm.take_output(), "");
}

#[test]
fn test_compile_error_reports_line() {
    let mut vm = Vm::new();
    match vm.run("x = 1\ndef broken(:\n") {
        Err(Error::Compile(e)) => {
            assert_eq!(e.line, 2);
            let rendered = e.to_string();
            assert!(rendered.contains("SyntaxError"));
        }
        other => panic!("expected a compile error, got {other:?}"),
    }
}

#[test]
fn test_hand_assembled_code_object() {
    let mut b = CodeBuilder::new("<asm>", "<asm>", 1);
    b.set_line(1);
    let k1 = b.add_const(Value::Int(20));
    let k2 = b.add_const(Value::Int(22));
    b.emit_arg(Opcode::LoadConst, k1);
    b.emit_arg(Opcode::LoadConst, k2);
    b.emit_arg(Opcode::BinaryOp, BinOp::Add as u16);
    b.emit(Opcode::ReturnValue);
    let code = Rc::new(b.finish());

    let mut vm = Vm::new();
    assert_eq!(vm.execute(code).unwrap(), Value::Int(42));
}

#[test]
fn test_specialized_opcodes_match_generic_ones() {
    // The specialized integer add must be observably identical to the
    // generic operator, including the overflow promotion path.
    let build = |op: Opcode, use_arg: bool| {
        let mut b = CodeBuilder::new("<asm>", "<asm>", 1);
        let k1 = b.add_const(Value::Int(i64::MAX));
        let k2 = b.add_const(Value::Int(1));
        b.emit_arg(Opcode::LoadConst, k1);
        b.emit_arg(Opcode::LoadConst, k2);
        if use_arg {
            b.emit_arg(op, BinOp::Add as u16);
        } else {
            b.emit(op);
        }
        b.emit(Opcode::ReturnValue);
        Rc::new(b.finish())
    };

    let mut vm = Vm::new();
    let generic = vm.execute(build(Opcode::BinaryOp, true)).unwrap();
    let specialized = vm.execute(build(Opcode::BinaryAddInt, false)).unwrap();
    assert_eq!(generic, specialized);
    assert_eq!(generic, vm.run("9223372036854775807 + 1").unwrap());
}

#[test]
fn test_disassembly_shows_specializations() {
    let mut vm = Vm::new();
    let code = vm
        .compile(
            "def f(a, b):\n    if a < b:\n        return a + b\n    return len('xy')\n",
            "<dis>",
        )
        .unwrap();
    let Value::Code(inner) = code.constants[0].clone() else {
        panic!("function code expected in the constant pool");
    };
    let listing = inner.disassemble();
    // The peephole pass fuses the two parameter loads and the compare+branch,
    // and rewrites len() into the inline length opcode.
    assert!(listing.contains("LoadFastLoadFast"), "{listing}");
    assert!(listing.contains("CompareLtJump"), "{listing}");
    assert!(listing.contains("LenGeneric"), "{listing}");
}

#[test]
fn test_take_output_between_runs() {
    let mut vm = Vm::new();
    vm.register("emit", |vm, args| {
        let text = args.check_str(1)?;
        vm.push(Value::str(&text));
        Ok(Value::None)
    });
    vm.run("emit('staged')").unwrap();
    assert_eq!(vm.pop(), Value::str("staged"));
}
