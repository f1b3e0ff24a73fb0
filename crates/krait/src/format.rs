//! Value formatting: `str`, `repr`, `ascii`, float rendering, and
//! printf-style `%` interpolation.
//!
//! These are the dunder-free fallbacks used for every builtin kind. The VM
//! layers `__str__`/`__repr__` dispatch for instances on top (`Vm::py_str`
//! and `Vm::py_repr`); everything here is pure and reusable from host code.

use std::fmt::Write;

use crate::exceptions::PyExc;
use crate::object::class_name_of;
use crate::value::{ReprGuard, Value};

/// `str(v)` for builtin kinds: identity for strings, repr otherwise.
pub fn plain_str(v: &Value) -> String {
    match v {
        Value::Str(s) => s.to_string(),
        Value::Exception(exc) => exc.borrow().message(),
        _ => plain_repr(v),
    }
}

/// `repr(v)` for builtin kinds, with cycle protection.
pub fn plain_repr(v: &Value) -> String {
    let guard = ReprGuard::new();
    repr_with_guard(v, &guard, false)
}

/// `ascii(v)`: like repr, but every non-ASCII code point is escaped.
pub fn ascii_repr(v: &Value) -> String {
    let guard = ReprGuard::new();
    repr_with_guard(v, &guard, true)
}

pub(crate) fn repr_with_guard(v: &Value, guard: &ReprGuard, ascii: bool) -> String {
    match v {
        Value::None => "None".into(),
        Value::NotImplemented => "NotImplemented".into(),
        Value::Bool(true) => "True".into(),
        Value::Bool(false) => "False".into(),
        Value::Int(i) => i.to_string(),
        Value::BigInt(b) => b.to_string(),
        Value::Float(f) => float_repr(*f),
        Value::Complex { re, im } => complex_repr(*re, *im),
        Value::Str(s) => string_repr(s, ascii),
        Value::Bytes(b) => bytes_repr(b),
        Value::List(items) => {
            if !guard.enter(v) {
                return "[...]".into();
            }
            let body = join_reprs(items.borrow().iter(), guard, ascii);
            guard.leave(v);
            format!("[{body}]")
        }
        Value::Tuple(items) => {
            if items.len() == 1 {
                format!("({},)", repr_with_guard(&items[0], guard, ascii))
            } else {
                let body = join_reprs(items.iter(), guard, ascii);
                format!("({body})")
            }
        }
        Value::Dict(d) => {
            if !guard.enter(v) {
                return "{...}".into();
            }
            let d = d.borrow();
            let mut out = String::from("{");
            for (i, (_, k, val)) in d.iter().enumerate() {
                if i > 0 {
                    out.push_str(", ");
                }
                let _ = write!(
                    out,
                    "{}: {}",
                    repr_with_guard(k, guard, ascii),
                    repr_with_guard(val, guard, ascii)
                );
            }
            guard.leave(v);
            out.push('}');
            out
        }
        Value::Set(s) => {
            let s = s.borrow();
            if s.is_empty() {
                return "set()".into();
            }
            let body = join_reprs(s.iter(), guard, ascii);
            format!("{{{body}}}")
        }
        Value::FrozenSet(s) => {
            if s.is_empty() {
                return "frozenset()".into();
            }
            let body = join_reprs(s.iter(), guard, ascii);
            format!("frozenset({{{body}}})")
        }
        Value::Range(r) => {
            if r.step == 1 {
                format!("range({}, {})", r.start, r.stop)
            } else {
                format!("range({}, {}, {})", r.start, r.stop, r.step)
            }
        }
        Value::Slice(s) => format!(
            "slice({}, {}, {})",
            repr_with_guard(&s.start, guard, ascii),
            repr_with_guard(&s.stop, guard, ascii),
            repr_with_guard(&s.step, guard, ascii)
        ),
        Value::Iter(it) => format!("<{} object>", it.borrow().type_name()),
        Value::Generator(g) => {
            let g = g.borrow();
            let kind = if g.is_coroutine { "coroutine" } else { "generator" };
            format!("<{} object {}>", kind, g.name)
        }
        Value::Function(f) => {
            format!("<function {} at {:#x}>", f.name.borrow(), std::rc::Rc::as_ptr(f) as usize)
        }
        Value::Native(f) => format!("<built-in function {}>", f.name),
        Value::Builtin(b) => format!("<built-in function {}>", b.name()),
        Value::BoundMethod(m) => {
            let name = match &m.func {
                Value::Function(f) => f.name.borrow().to_string(),
                Value::Native(f) => f.name.to_string(),
                Value::Builtin(b) => b.name().to_string(),
                other => other.type_name(),
            };
            format!(
                "<bound method {} of {}>",
                name,
                repr_with_guard(&m.receiver, guard, ascii)
            )
        }
        Value::Type(t) => format!("<class '{}'>", t.name()),
        Value::ExcClass(e) => format!("<class '{}'>", e.name()),
        Value::Class(c) => format!("<class '{}'>", c.name),
        Value::Instance(inst) => format!(
            "<{} object at {:#x}>",
            inst.class_name(),
            std::rc::Rc::as_ptr(inst) as usize
        ),
        Value::Module(m) => format!("<module '{}'>", m.name),
        Value::Exception(exc) => {
            let exc = exc.borrow();
            let args = join_reprs(exc.args.iter(), guard, ascii);
            format!("{}({})", exc.class_name(), args)
        }
        Value::Code(c) => format!("<code object {}>", c.name),
        Value::Cell(_) => "<cell>".into(),
        Value::Property(_) => "<property object>".into(),
        Value::ClassMethod(_) => "<classmethod object>".into(),
        Value::StaticMethod(_) => "<staticmethod object>".into(),
        Value::Union(parts) => {
            let body: Vec<String> = parts.iter().map(class_name_of).collect();
            body.join(" | ")
        }
        Value::GenericAlias(g) => {
            let args: Vec<String> = g
                .args
                .iter()
                .map(|a| match a {
                    Value::Class(_) | Value::Type(_) | Value::ExcClass(_) => class_name_of(a),
                    other => repr_with_guard(other, guard, ascii),
                })
                .collect();
            format!("{}[{}]", class_name_of(&g.origin), args.join(", "))
        }
        Value::UserData(ud) => match &ud.metatable {
            Some(m) => format!("<{} userdata>", m.type_name),
            None => "<userdata>".into(),
        },
        Value::Ctrl(_) => "<ctrl>".into(),
    }
}

fn join_reprs<'a>(
    items: impl Iterator<Item = &'a Value>,
    guard: &ReprGuard,
    ascii: bool,
) -> String {
    items
        .map(|v| repr_with_guard(v, guard, ascii))
        .collect::<Vec<_>>()
        .join(", ")
}

// ---------------------------------------------------------------------------
// Scalar formatting
// ---------------------------------------------------------------------------

/// Python-style float rendering: trailing `.0` for integral values, decimal
/// up to `1e16`, exponent notation with an explicit sign and two-digit
/// exponent beyond that.
pub fn float_repr(f: f64) -> String {
    if f.is_nan() {
        return "nan".into();
    }
    if f.is_infinite() {
        return if f > 0.0 { "inf".into() } else { "-inf".into() };
    }
    let abs = f.abs();
    if abs != 0.0 && !(1e-4..1e16).contains(&abs) {
        // Exponent form, e.g. 1e+16, 2.5e-05.
        let s = format!("{f:e}");
        let (mantissa, exp) = s.split_once('e').expect("exponent format");
        let exp: i32 = exp.parse().expect("exponent digits");
        return format!("{mantissa}e{}{:02}", if exp < 0 { '-' } else { '+' }, exp.abs());
    }
    if f == f.trunc() {
        // Keeps the sign of negative zero.
        return format!("{f:.1}");
    }
    format!("{f}")
}

fn complex_repr(re: f64, im: f64) -> String {
    let im_part = |im: f64| {
        let s = float_repr(im);
        // Python drops ".0" on integral imaginary parts: (1+2j), not (1+2.0j)
        let s = s.strip_suffix(".0").map_or(s.clone(), str::to_owned);
        format!("{s}j")
    };
    if re == 0.0 && re.is_sign_positive() {
        im_part(im)
    } else {
        let re_s = float_repr(re);
        let re_s = re_s.strip_suffix(".0").map_or(re_s.clone(), str::to_owned);
        if im >= 0.0 || im.is_nan() {
            format!("({re_s}+{})", im_part(im))
        } else {
            format!("({re_s}-{})", im_part(-im))
        }
    }
}

/// String repr: single quotes unless the text contains one (and no double
/// quote), standard short escapes, control characters as `\xXX`.
pub fn string_repr(s: &str, ascii: bool) -> String {
    let quote = if s.contains('\'') && !s.contains('"') {
        '"'
    } else {
        '\''
    };
    let mut out = String::with_capacity(s.len() + 2);
    out.push(quote);
    for c in s.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c if c == quote => {
                out.push('\\');
                out.push(c);
            }
            c if (c as u32) < 0x20 || c as u32 == 0x7f => {
                let _ = write!(out, "\\x{:02x}", c as u32);
            }
            c if ascii && !c.is_ascii() => {
                let cp = c as u32;
                if cp <= 0xff {
                    let _ = write!(out, "\\x{cp:02x}");
                } else if cp <= 0xffff {
                    let _ = write!(out, "\\u{cp:04x}");
                } else {
                    let _ = write!(out, "\\U{cp:08x}");
                }
            }
            c => out.push(c),
        }
    }
    out.push(quote);
    out
}

pub fn bytes_repr(bytes: &[u8]) -> String {
    let mut out = String::from("b'");
    for &b in bytes {
        match b {
            b'\\' => out.push_str("\\\\"),
            b'\'' => out.push_str("\\'"),
            b'\n' => out.push_str("\\n"),
            b'\r' => out.push_str("\\r"),
            b'\t' => out.push_str("\\t"),
            0x20..=0x7e => out.push(b as char),
            _ => {
                let _ = write!(out, "\\x{b:02x}");
            }
        }
    }
    out.push('\'');
    out
}

// ---------------------------------------------------------------------------
// format() mini-language
// ---------------------------------------------------------------------------

/// Apply a format spec: `[[fill]align][sign][#][0][width][,][.precision][type]`.
///
/// Covers the subset embedders and f-strings actually use; exotic corners
/// (nested specs, locale types) are rejected with `ValueError`.
pub fn format_spec(v: &Value, spec: &str) -> Result<String, PyExc> {
    if spec.is_empty() {
        return Ok(plain_str(v));
    }

    let mut chars: Vec<char> = spec.chars().collect();
    let mut fill = ' ';
    let mut align: Option<char> = None;

    if chars.len() >= 2 && matches!(chars[1], '<' | '>' | '^' | '=') {
        fill = chars[0];
        align = Some(chars[1]);
        chars.drain(..2);
    } else if !chars.is_empty() && matches!(chars[0], '<' | '>' | '^' | '=') {
        align = Some(chars[0]);
        chars.remove(0);
    }

    let mut sign = None;
    if !chars.is_empty() && matches!(chars[0], '+' | '-' | ' ') {
        sign = Some(chars[0]);
        chars.remove(0);
    }

    let mut alternate = false;
    if chars.first() == Some(&'#') {
        alternate = true;
        chars.remove(0);
    }

    if chars.first() == Some(&'0') {
        if align.is_none() {
            align = Some('=');
            fill = '0';
        }
        chars.remove(0);
    }

    let mut width = 0usize;
    while chars.first().is_some_and(|c| c.is_ascii_digit()) {
        width = width * 10 + chars.remove(0).to_digit(10).unwrap() as usize;
    }

    let mut thousands = false;
    if chars.first() == Some(&',') {
        thousands = true;
        chars.remove(0);
    }

    let mut precision: Option<usize> = None;
    if chars.first() == Some(&'.') {
        chars.remove(0);
        let mut p = 0usize;
        let mut any = false;
        while chars.first().is_some_and(|c| c.is_ascii_digit()) {
            p = p * 10 + chars.remove(0).to_digit(10).unwrap() as usize;
            any = true;
        }
        if !any {
            return Err(PyExc::value_error("Format specifier missing precision"));
        }
        precision = Some(p);
    }

    let kind = if chars.len() > 1 {
        return Err(PyExc::value_error(format!(
            "Invalid format specifier '{spec}'"
        )));
    } else {
        chars.first().copied()
    };

    let (mut body, negative) = render_for_spec(v, kind, precision, alternate, thousands)?;

    // Sign handling for numbers.
    let sign_str = if negative {
        "-"
    } else {
        match sign {
            Some('+') if v.is_real_number() => "+",
            Some(' ') if v.is_real_number() => " ",
            _ => "",
        }
    };

    let total = sign_str.len() + body.chars().count();
    if total >= width {
        return Ok(format!("{sign_str}{body}"));
    }
    let pad = width - total;
    Ok(match align.unwrap_or(if v.is_real_number() { '>' } else { '<' }) {
        '<' => format!("{sign_str}{body}{}", fill.to_string().repeat(pad)),
        '>' => format!("{}{sign_str}{body}", fill.to_string().repeat(pad)),
        '=' => format!("{sign_str}{}{body}", fill.to_string().repeat(pad)),
        '^' => {
            let left = pad / 2;
            let right = pad - left;
            format!(
                "{}{sign_str}{}{}",
                fill.to_string().repeat(left),
                std::mem::take(&mut body),
                fill.to_string().repeat(right)
            )
        }
        _ => unreachable!(),
    })
}

fn render_for_spec(
    v: &Value,
    kind: Option<char>,
    precision: Option<usize>,
    alternate: bool,
    thousands: bool,
) -> Result<(String, bool), PyExc> {
    let type_err = |k: char| {
        Err(PyExc::value_error(format!(
            "Unknown format code '{}' for object of type '{}'",
            k,
            v.type_name()
        )))
    };

    match kind {
        None | Some('s') => {
            if matches!(kind, Some('s')) && !matches!(v, Value::Str(_)) {
                return type_err('s');
            }
            let mut s = plain_str(v);
            if let Some(p) = precision {
                s = s.chars().take(p).collect();
            }
            Ok((s, false))
        }
        Some(k @ ('d' | 'b' | 'o' | 'x' | 'X')) => {
            let Some(i) = v.as_int() else {
                return type_err(k);
            };
            let negative = i < 0;
            let mag = i.unsigned_abs();
            let digits = match k {
                'd' => mag.to_string(),
                'b' => format!("{}{:b}", if alternate { "0b" } else { "" }, mag),
                'o' => format!("{}{:o}", if alternate { "0o" } else { "" }, mag),
                'x' => format!("{}{:x}", if alternate { "0x" } else { "" }, mag),
                'X' => format!("{}{:X}", if alternate { "0X" } else { "" }, mag),
                _ => unreachable!(),
            };
            let digits = if thousands && k == 'd' {
                group_thousands(&digits)
            } else {
                digits
            };
            Ok((digits, negative))
        }
        Some(k @ ('f' | 'F' | 'e' | 'E' | 'g' | 'G' | '%')) => {
            let Some(f) = v.as_float() else {
                return type_err(k);
            };
            let p = precision.unwrap_or(6);
            let (f, suffix) = if k == '%' { (f * 100.0, "%") } else { (f, "") };
            let negative = f < 0.0;
            let mag = f.abs();
            let body = match k {
                'f' | 'F' | '%' => format!("{mag:.p$}", p = p),
                'e' => exp_format(mag, p, false),
                'E' => exp_format(mag, p, true),
                'g' | 'G' => {
                    let s = format!("{mag:.p$e}", p = p.saturating_sub(1));
                    let formatted = general_from_exp(&s, k == 'G');
                    formatted
                }
                _ => unreachable!(),
            };
            let body = if thousands {
                let (int_part, rest) = body.split_once('.').map_or((body.as_str(), None), |(a, b)| (a, Some(b)));
                match rest {
                    Some(frac) => format!("{}.{frac}", group_thousands(int_part)),
                    None => group_thousands(int_part),
                }
            } else {
                body
            };
            Ok((format!("{body}{suffix}"), negative))
        }
        Some(other) => type_err(other),
    }
}

fn exp_format(mag: f64, precision: usize, upper: bool) -> String {
    let s = format!("{mag:.precision$e}");
    let (mantissa, exp) = s.split_once('e').expect("exponent format");
    let exp: i32 = exp.parse().expect("exponent digits");
    let e = if upper { 'E' } else { 'e' };
    format!("{mantissa}{e}{}{:02}", if exp < 0 { '-' } else { '+' }, exp.abs())
}

fn general_from_exp(s: &str, upper: bool) -> String {
    let (mantissa, exp) = s.split_once('e').expect("exponent format");
    let exp: i32 = exp.parse().expect("exponent digits");
    if (-4..16).contains(&exp) {
        // Re-render as plain decimal, trimming trailing zeros like %g.
        let val: f64 = s.parse().unwrap_or(0.0);
        let mut out = format!("{val}");
        if out.contains('.') {
            while out.ends_with('0') {
                out.pop();
            }
            if out.ends_with('.') {
                out.pop();
            }
        }
        out
    } else {
        let mantissa = mantissa.trim_end_matches('0').trim_end_matches('.');
        let e = if upper { 'E' } else { 'e' };
        format!("{mantissa}{e}{}{:02}", if exp < 0 { '-' } else { '+' }, exp.abs())
    }
}

fn group_thousands(digits: &str) -> String {
    let chars: Vec<char> = digits.chars().collect();
    let mut out = String::new();
    for (i, c) in chars.iter().enumerate() {
        if i > 0 && (chars.len() - i) % 3 == 0 {
            out.push(',');
        }
        out.push(*c);
    }
    out
}

// ---------------------------------------------------------------------------
// printf-style % formatting
// ---------------------------------------------------------------------------

/// `fmt % args`: supports `%s %r %a %d %i %u %f %F %e %E %g %G %x %X %o %c %%`
/// with width/precision/flags, a tuple of values, or a single value.
pub fn printf_format(fmt: &str, args: &Value) -> Result<String, PyExc> {
    let values: Vec<Value> = match args {
        Value::Tuple(items) => items.to_vec(),
        other => vec![other.clone()],
    };
    let mut next = 0usize;
    let mut take = |conversion: char| -> Result<Value, PyExc> {
        if next >= values.len() {
            return Err(PyExc::type_error(
                "not enough arguments for format string",
            ));
        }
        let v = values[next].clone();
        next += 1;
        let _ = conversion;
        Ok(v)
    };

    let mut out = String::new();
    let mut chars = fmt.chars().peekable();
    while let Some(c) = chars.next() {
        if c != '%' {
            out.push(c);
            continue;
        }
        if chars.peek() == Some(&'%') {
            chars.next();
            out.push('%');
            continue;
        }

        // flags
        let mut zero_pad = false;
        let mut left = false;
        let mut plus = false;
        let mut space = false;
        while let Some(&f) = chars.peek() {
            match f {
                '0' => zero_pad = true,
                '-' => left = true,
                '+' => plus = true,
                ' ' => space = true,
                _ => break,
            }
            chars.next();
        }
        // width
        let mut width = 0usize;
        while chars.peek().is_some_and(|c| c.is_ascii_digit()) {
            width = width * 10 + chars.next().unwrap().to_digit(10).unwrap() as usize;
        }
        // precision
        let mut precision = None;
        if chars.peek() == Some(&'.') {
            chars.next();
            let mut p = 0usize;
            while chars.peek().is_some_and(|c| c.is_ascii_digit()) {
                p = p * 10 + chars.next().unwrap().to_digit(10).unwrap() as usize;
            }
            precision = Some(p);
        }

        let Some(conv) = chars.next() else {
            return Err(PyExc::value_error("incomplete format"));
        };

        let v = take(conv)?;
        let rendered = match conv {
            's' => {
                let mut s = plain_str(&v);
                if let Some(p) = precision {
                    s = s.chars().take(p).collect();
                }
                s
            }
            'r' => plain_repr(&v),
            'a' => ascii_repr(&v),
            'd' | 'i' | 'u' => {
                let Some(i) = v.as_int() else {
                    return Err(PyExc::type_error(format!(
                        "%{conv} format: a real number is required, not {}",
                        v.type_name()
                    )));
                };
                signed_int(i, plus, space)
            }
            'x' => radix_int(&v, conv, |m| format!("{m:x}"))?,
            'X' => radix_int(&v, conv, |m| format!("{m:X}"))?,
            'o' => radix_int(&v, conv, |m| format!("{m:o}"))?,
            'c' => match &v {
                Value::Str(s) if s.char_len() == 1 => s.to_string(),
                v => match v.as_int() {
                    Some(i) => char::from_u32(i as u32)
                        .map(String::from)
                        .ok_or_else(|| PyExc::overflow("%c arg not in range(0x110000)"))?,
                    None => {
                        return Err(PyExc::type_error(
                            "%c requires int or char",
                        ));
                    }
                },
            },
            'f' | 'F' | 'e' | 'E' | 'g' | 'G' => {
                let Some(f) = v.as_float() else {
                    return Err(PyExc::type_error(format!(
                        "must be real number, not {}",
                        v.type_name()
                    )));
                };
                let p = precision.unwrap_or(6);
                let mag = f.abs();
                let body = match conv {
                    'f' | 'F' => format!("{mag:.p$}", p = p),
                    'e' => exp_format(mag, p, false),
                    'E' => exp_format(mag, p, true),
                    'g' | 'G' => general_from_exp(
                        &format!("{mag:.p$e}", p = p.saturating_sub(1).max(0)),
                        conv == 'G',
                    ),
                    _ => unreachable!(),
                };
                let sign = if f < 0.0 {
                    "-"
                } else if plus {
                    "+"
                } else if space {
                    " "
                } else {
                    ""
                };
                format!("{sign}{body}")
            }
            other => {
                return Err(PyExc::value_error(format!(
                    "unsupported format character '{other}'"
                )));
            }
        };

        let len = rendered.chars().count();
        if len >= width {
            out.push_str(&rendered);
        } else if left {
            out.push_str(&rendered);
            out.push_str(&" ".repeat(width - len));
        } else if zero_pad && matches!(conv, 'd' | 'i' | 'u' | 'x' | 'X' | 'o' | 'f' | 'F' | 'e' | 'E' | 'g' | 'G') {
            // Zero padding goes between the sign and the digits.
            let (sign, digits) = match rendered.strip_prefix(['-', '+', ' ']) {
                Some(rest) => (&rendered[..1], rest),
                None => ("", rendered.as_str()),
            };
            out.push_str(sign);
            out.push_str(&"0".repeat(width - len));
            out.push_str(digits);
        } else {
            out.push_str(&" ".repeat(width - len));
            out.push_str(&rendered);
        }
    }

    if next < values.len() && matches!(args, Value::Tuple(_)) {
        return Err(PyExc::type_error(
            "not all arguments converted during string formatting",
        ));
    }
    Ok(out)
}

fn signed_int(i: i64, plus: bool, space: bool) -> String {
    if i < 0 {
        format!("-{}", i.unsigned_abs())
    } else if plus {
        format!("+{i}")
    } else if space {
        format!(" {i}")
    } else {
        i.to_string()
    }
}

fn radix_int(
    v: &Value,
    conv: char,
    render: impl Fn(u64) -> String,
) -> Result<String, PyExc> {
    let Some(i) = v.as_int() else {
        return Err(PyExc::type_error(format!(
            "%{conv} format: an integer is required, not {}",
            v.type_name()
        )));
    };
    if i < 0 {
        Ok(format!("-{}", render(i.unsigned_abs())))
    } else {
        Ok(render(i as u64))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn float_reprs_match_python() {
        assert_eq!(float_repr(1.0), "1.0");
        assert_eq!(float_repr(-0.0), "-0.0");
        assert_eq!(float_repr(0.1), "0.1");
        assert_eq!(float_repr(2.5), "2.5");
        assert_eq!(float_repr(1e16), "1e+16");
        assert_eq!(float_repr(1.5e-5), "1.5e-05");
        assert_eq!(float_repr(f64::INFINITY), "inf");
        assert_eq!(float_repr(f64::NAN), "nan");
        assert_eq!(float_repr(1e15), "1000000000000000.0");
    }

    #[test]
    fn string_reprs() {
        assert_eq!(string_repr("hi", false), "'hi'");
        assert_eq!(string_repr("it's", false), "\"it's\"");
        assert_eq!(string_repr("a\nb", false), "'a\\nb'");
        assert_eq!(string_repr("é", false), "'é'");
        assert_eq!(string_repr("é", true), "'\\xe9'");
        assert_eq!(string_repr("\u{1F40D}", true), "'\\U0001f40d'");
    }

    #[test]
    fn singleton_tuple_gets_a_comma() {
        let t = Value::tuple(vec![Value::Int(1)]);
        assert_eq!(plain_repr(&t), "(1,)");
        let empty = Value::tuple(vec![]);
        assert_eq!(plain_repr(&empty), "()");
    }

    #[test]
    fn cyclic_list_reprs_as_ellipsis() {
        let l = Value::list(vec![Value::Int(1)]);
        if let Value::List(r) = &l {
            let inner = l.clone();
            r.borrow_mut().push(inner);
        }
        assert_eq!(plain_repr(&l), "[1, [...]]");
        if let Value::List(r) = &l {
            r.borrow_mut().clear();
        }
    }

    #[test]
    fn percent_formatting() {
        let args = Value::tuple(vec![Value::str("x"), Value::Int(3)]);
        assert_eq!(printf_format("%s=%d", &args).unwrap(), "x=3");
        assert_eq!(
            printf_format("%05.2f", &Value::Float(3.14159)).unwrap(),
            "03.14"
        );
        assert_eq!(printf_format("%x", &Value::Int(255)).unwrap(), "ff");
        assert_eq!(printf_format("100%%", &Value::tuple(vec![])).unwrap(), "100%");
    }

    #[test]
    fn format_spec_basics() {
        assert_eq!(format_spec(&Value::Int(42), ">5").unwrap(), "   42");
        assert_eq!(format_spec(&Value::Int(42), "05d").unwrap(), "00042");
        assert_eq!(format_spec(&Value::Float(3.14159), ".2f").unwrap(), "3.14");
        assert_eq!(format_spec(&Value::str("ab"), "^6").unwrap(), "  ab  ");
        assert_eq!(format_spec(&Value::Int(255), "#x").unwrap(), "0xff");
        assert_eq!(format_spec(&Value::Int(1234567), ",d").unwrap(), "1,234,567");
        assert_eq!(format_spec(&Value::Int(-5), "+d").unwrap(), "-5");
        assert_eq!(format_spec(&Value::Int(5), "+d").unwrap(), "+5");
    }

    #[test]
    fn complex_reprs() {
        assert_eq!(plain_repr(&Value::complex(0.0, 1.0)), "1j");
        assert_eq!(plain_repr(&Value::complex(1.0, 2.0)), "(1+2j)");
        assert_eq!(plain_repr(&Value::complex(1.0, -2.0)), "(1-2j)");
    }
}
