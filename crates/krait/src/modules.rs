//! The module system: a named registry with lazy loaders, submodules,
//! relative-import resolution, and an import cycle guard, plus the bundled
//! `math` and `json` modules.
//!
//! A module is created and cached on first successful import and lives for
//! the VM's lifetime. The module object is registered *before* its loader
//! runs, so a cyclic import observes the partially-initialized module
//! instead of recursing.

use std::cell::RefCell;
use std::rc::Rc;

use crate::embed::Args;
use crate::exceptions::{ExcType, PyExc, VmResult};
use crate::object::Module;
use crate::value::Value;
use crate::vm::Vm;

/// A lazily-invoked module initializer.
pub type ModuleLoader = Rc<dyn Fn(&mut ModuleBuilder)>;

/// One registry slot: an already-built module or a pending loader.
pub(crate) enum ModuleEntry {
    Loaded(Rc<Module>),
    Pending(ModuleLoader),
}

/// Collects the attributes of a module under construction.
///
/// ```
/// use krait::{Value, Vm};
///
/// let mut vm = Vm::new();
/// vm.register_module("units", |m| {
///     m.constant("INCH_MM", Value::Float(25.4));
///     m.function("to_mm", |_vm, args| {
///         let inches = args.check_float(1)?;
///         Ok(Value::Float(inches * 25.4))
///     });
/// });
/// let result = vm.run("import units; units.to_mm(2.0)").unwrap();
/// assert_eq!(result, Value::Float(50.8));
/// ```
pub struct ModuleBuilder {
    attrs: Vec<(String, Value)>,
    doc: Option<String>,
}

impl ModuleBuilder {
    pub(crate) fn new() -> Self {
        Self {
            attrs: Vec::new(),
            doc: None,
        }
    }

    /// Set the module docstring.
    pub fn doc(&mut self, text: &str) {
        self.doc = Some(text.to_string());
    }

    /// Register a constant attribute.
    pub fn constant(&mut self, name: &str, value: Value) {
        self.attrs.push((name.to_string(), value));
    }

    /// Register a native function attribute.
    pub fn function(
        &mut self,
        name: &str,
        f: impl Fn(&mut Vm, &mut Args) -> Result<Value, PyExc> + 'static,
    ) {
        self.attrs.push((name.to_string(), Value::native(name, f)));
    }
}

impl Vm {
    /// Register a lazy module loader. The loader runs on first import; its
    /// result is cached for the VM's lifetime.
    pub fn register_module(&mut self, name: &str, loader: impl Fn(&mut ModuleBuilder) + 'static) {
        self.module_registry
            .insert(name.to_string(), ModuleEntry::Pending(Rc::new(loader)));
    }

    /// Register an already-built module value.
    pub fn register_module_instance(&mut self, name: &str, module: Value) {
        let m = match module {
            Value::Module(m) => m,
            other => {
                // Accept a dict of attributes as a convenience.
                let module = Module::new(name);
                if let Value::Dict(d) = other {
                    module.dict.borrow_mut().update(&d.borrow());
                }
                Rc::new(module)
            }
        };
        self.module_registry
            .insert(name.to_string(), ModuleEntry::Loaded(m));
    }
}

/// Import by fully-qualified name. Dotted paths import every parent and bind
/// each child as an attribute of its parent.
pub(crate) fn import_module(vm: &mut Vm, name: &str) -> VmResult<Rc<Module>> {
    let mut result = None;
    let mut prefix = String::new();
    for part in name.split('.') {
        let full = if prefix.is_empty() {
            part.to_string()
        } else {
            format!("{prefix}.{part}")
        };
        let child = import_single(vm, &full)?;
        if let Some(parent) = result.replace(child.clone()) {
            let parent: Rc<Module> = parent;
            parent
                .dict
                .borrow_mut()
                .insert_str(part, Value::Module(child));
        }
        prefix = full;
    }
    result.ok_or_else(|| PyExc::value_error("empty module name").into())
}

/// The leaf module of a dotted import, for `from a.b import c` and
/// `import a.b as x`.
pub(crate) fn import_leaf(vm: &mut Vm, name: &str) -> VmResult<Rc<Module>> {
    import_module(vm, name)
}

/// The top module of a dotted import, which is what plain `import a.b`
/// binds.
pub(crate) fn import_top(vm: &mut Vm, name: &str) -> VmResult<Rc<Module>> {
    import_module(vm, name)?;
    let top = name.split('.').next().unwrap_or(name);
    import_single(vm, top)
}

fn import_single(vm: &mut Vm, name: &str) -> VmResult<Rc<Module>> {
    match vm.module_registry.get(name) {
        Some(ModuleEntry::Loaded(m)) => return Ok(m.clone()),
        Some(ModuleEntry::Pending(_)) => {}
        None => {
            return Err(PyExc::new(
                ExcType::ModuleNotFoundError,
                format!("No module named '{name}'"),
            )
            .into());
        }
    }

    // Take the loader out and register the (empty) module first: an import
    // cycle through the loader then observes this partial module.
    let Some(ModuleEntry::Pending(loader)) = vm
        .module_registry
        .insert(name.to_string(), ModuleEntry::Loaded(Rc::new(Module::new(name))))
    else {
        unreachable!("checked above");
    };
    let Some(ModuleEntry::Loaded(module)) = vm.module_registry.get(name) else {
        unreachable!("just inserted");
    };
    let module = module.clone();
    module.loading.set(true);
    if let Some((package, _)) = name.rsplit_once('.') {
        module
            .dict
            .borrow_mut()
            .insert_str("__package__", Value::str(package));
    }

    let mut builder = ModuleBuilder::new();
    loader(&mut builder);
    {
        let mut dict = module.dict.borrow_mut();
        for (attr, value) in builder.attrs {
            dict.insert_str(&attr, value);
        }
    }
    if let Some(doc) = builder.doc {
        *module.doc.borrow_mut() = Some(crate::intern::PyStr::new(&doc));
    }
    module.loading.set(false);
    Ok(module)
}

/// Resolve a relative import: drop the last `level - 1` components of the
/// current package, then append `name` (or use the truncated package when
/// `name` is empty).
pub(crate) fn resolve_relative(
    package: Option<&str>,
    level: u32,
    name: &str,
) -> Result<String, PyExc> {
    if level == 0 {
        return Ok(name.to_string());
    }
    let Some(package) = package else {
        return Err(PyExc::new(
            ExcType::ImportError,
            "attempted relative import with no known parent package",
        ));
    };
    let parts: Vec<&str> = package.split('.').collect();
    let drop = (level - 1) as usize;
    if drop >= parts.len() {
        return Err(PyExc::new(
            ExcType::ImportError,
            "attempted relative import beyond top-level package",
        ));
    }
    let base = parts[..parts.len() - drop].join(".");
    Ok(if name.is_empty() {
        base
    } else {
        format!("{base}.{name}")
    })
}

// ---------------------------------------------------------------------------
// Bundled modules
// ---------------------------------------------------------------------------

/// Install the stock `math` and `json` modules on a new VM.
pub(crate) fn register_stock_modules(vm: &mut Vm) {
    vm.register_module("math", build_math);
    vm.register_module("json", build_json);
}

fn build_math(m: &mut ModuleBuilder) {
    m.doc("Mathematical functions over machine floats.");
    m.constant("pi", Value::Float(std::f64::consts::PI));
    m.constant("e", Value::Float(std::f64::consts::E));
    m.constant("tau", Value::Float(std::f64::consts::TAU));
    m.constant("inf", Value::Float(f64::INFINITY));
    m.constant("nan", Value::Float(f64::NAN));

    macro_rules! unary {
        ($name:literal, $f:expr) => {
            m.function($name, move |_vm, args| {
                let x = args.check_float(1)?;
                let f: fn(f64) -> f64 = $f;
                Ok(Value::Float(f(x)))
            });
        };
    }

    unary!("exp", |x| x.exp());
    unary!("sin", |x| x.sin());
    unary!("cos", |x| x.cos());
    unary!("tan", |x| x.tan());
    unary!("asin", |x| x.asin());
    unary!("acos", |x| x.acos());
    unary!("atan", |x| x.atan());
    unary!("fabs", |x| x.abs());
    unary!("degrees", |x| x.to_degrees());
    unary!("radians", |x| x.to_radians());

    m.function("sqrt", |_vm, args| {
        let x = args.check_float(1)?;
        if x < 0.0 {
            return Err(PyExc::value_error("math domain error"));
        }
        Ok(Value::Float(x.sqrt()))
    });
    m.function("log", |_vm, args| {
        let x = args.check_float(1)?;
        if x <= 0.0 {
            return Err(PyExc::value_error("math domain error"));
        }
        Ok(Value::Float(match args.check_float(2) {
            Ok(base) => x.log(base),
            Err(_) => x.ln(),
        }))
    });
    m.function("log10", |_vm, args| {
        let x = args.check_float(1)?;
        if x <= 0.0 {
            return Err(PyExc::value_error("math domain error"));
        }
        Ok(Value::Float(x.log10()))
    });
    m.function("log2", |_vm, args| {
        let x = args.check_float(1)?;
        if x <= 0.0 {
            return Err(PyExc::value_error("math domain error"));
        }
        Ok(Value::Float(x.log2()))
    });
    m.function("pow", |_vm, args| {
        let x = args.check_float(1)?;
        let y = args.check_float(2)?;
        Ok(Value::Float(x.powf(y)))
    });
    m.function("atan2", |_vm, args| {
        let y = args.check_float(1)?;
        let x = args.check_float(2)?;
        Ok(Value::Float(y.atan2(x)))
    });
    m.function("hypot", |_vm, args| {
        let x = args.check_float(1)?;
        let y = args.check_float(2)?;
        Ok(Value::Float(x.hypot(y)))
    });
    m.function("fmod", |_vm, args| {
        let x = args.check_float(1)?;
        let y = args.check_float(2)?;
        if y == 0.0 {
            return Err(PyExc::value_error("math domain error"));
        }
        Ok(Value::Float(x % y))
    });
    m.function("copysign", |_vm, args| {
        let x = args.check_float(1)?;
        let y = args.check_float(2)?;
        Ok(Value::Float(x.copysign(y)))
    });
    m.function("floor", |_vm, args| {
        let x = args.check_float(1)?;
        Ok(Value::Int(x.floor() as i64))
    });
    m.function("ceil", |_vm, args| {
        let x = args.check_float(1)?;
        Ok(Value::Int(x.ceil() as i64))
    });
    m.function("trunc", |_vm, args| {
        let x = args.check_float(1)?;
        Ok(Value::Int(x.trunc() as i64))
    });
    m.function("isnan", |_vm, args| {
        Ok(Value::Bool(args.check_float(1)?.is_nan()))
    });
    m.function("isinf", |_vm, args| {
        Ok(Value::Bool(args.check_float(1)?.is_infinite()))
    });
    m.function("isfinite", |_vm, args| {
        Ok(Value::Bool(args.check_float(1)?.is_finite()))
    });
    m.function("gcd", |_vm, args| {
        let mut a = args.check_int(1)?.unsigned_abs();
        let mut b = args.check_int(2)?.unsigned_abs();
        while b != 0 {
            (a, b) = (b, a % b);
        }
        Ok(Value::Int(a as i64))
    });
    m.function("factorial", |_vm, args| {
        let n = args.check_int(1)?;
        if n < 0 {
            return Err(PyExc::value_error(
                "factorial() not defined for negative values",
            ));
        }
        let mut acc = num_bigint::BigInt::from(1);
        for i in 2..=n {
            acc *= i;
        }
        Ok(Value::from_bigint(acc))
    });
}

fn build_json(m: &mut ModuleBuilder) {
    m.doc("JSON encoding and decoding.");
    m.function("loads", |_vm, args| {
        let text = args.check_str(1)?;
        let parsed: serde_json::Value = serde_json::from_str(&text)
            .map_err(|e| PyExc::value_error(format!("invalid JSON: {e}")))?;
        Ok(json_to_value(&parsed))
    });
    m.function("dumps", |vm, args| {
        let v = args.check_any(1)?;
        let indent = args
            .kwarg("indent")
            .and_then(|v| v.as_int())
            .filter(|&n| n > 0);
        let json = value_to_json(vm, &v)?;
        let rendered = match indent {
            Some(_) => serde_json::to_string_pretty(&json),
            None => serde_json::to_string(&json),
        };
        rendered
            .map(Value::str)
            .map_err(|e| PyExc::value_error(format!("cannot serialize: {e}")))
    });
}

fn json_to_value(v: &serde_json::Value) -> Value {
    match v {
        serde_json::Value::Null => Value::None,
        serde_json::Value::Bool(b) => Value::Bool(*b),
        serde_json::Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Value::Int(i)
            } else {
                Value::Float(n.as_f64().unwrap_or(f64::NAN))
            }
        }
        serde_json::Value::String(s) => Value::str(s),
        serde_json::Value::Array(items) => {
            Value::list(items.iter().map(json_to_value).collect())
        }
        serde_json::Value::Object(map) => {
            let mut d = crate::dict::Dict::with_capacity(map.len());
            for (k, v) in map {
                d.insert_str(k, json_to_value(v));
            }
            Value::Dict(Rc::new(RefCell::new(d)))
        }
    }
}

fn value_to_json(vm: &mut Vm, v: &Value) -> Result<serde_json::Value, PyExc> {
    Ok(match v {
        Value::None => serde_json::Value::Null,
        Value::Bool(b) => serde_json::Value::Bool(*b),
        Value::Int(i) => serde_json::Value::Number((*i).into()),
        Value::BigInt(b) => {
            use num_traits::ToPrimitive;
            match b.to_i64() {
                Some(i) => serde_json::Value::Number(i.into()),
                None => {
                    return Err(PyExc::value_error("integer out of JSON range"));
                }
            }
        }
        Value::Float(f) => serde_json::Number::from_f64(*f)
            .map(serde_json::Value::Number)
            .ok_or_else(|| PyExc::value_error("Out of range float values are not JSON compliant"))?,
        Value::Str(s) => serde_json::Value::String(s.to_string()),
        Value::List(items) => {
            let items = items.borrow().clone();
            let mut out = Vec::with_capacity(items.len());
            for item in &items {
                out.push(value_to_json(vm, item)?);
            }
            serde_json::Value::Array(out)
        }
        Value::Tuple(items) => {
            let mut out = Vec::with_capacity(items.len());
            for item in items.iter() {
                out.push(value_to_json(vm, item)?);
            }
            serde_json::Value::Array(out)
        }
        Value::Dict(d) => {
            let items = d.borrow().items();
            let mut map = serde_json::Map::with_capacity(items.len());
            for (k, v) in items {
                let key = match &k {
                    Value::Str(s) => s.to_string(),
                    other => crate::format::plain_str(other),
                };
                map.insert(key, value_to_json(vm, &v)?);
            }
            serde_json::Value::Object(map)
        }
        other => {
            return Err(PyExc::type_error(format!(
                "Object of type {} is not JSON serializable",
                other.type_name()
            )));
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn relative_resolution() {
        assert_eq!(resolve_relative(Some("a.b.c"), 1, "d").unwrap(), "a.b.c.d");
        assert_eq!(resolve_relative(Some("a.b.c"), 2, "d").unwrap(), "a.b.d");
        assert_eq!(resolve_relative(Some("a.b.c"), 3, "").unwrap(), "a");
        assert!(resolve_relative(Some("a"), 2, "x").is_err());
        assert!(resolve_relative(None, 1, "x").is_err());
        assert_eq!(resolve_relative(None, 0, "x").unwrap(), "x");
    }
}
