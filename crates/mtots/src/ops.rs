//! Value operations shared by the VM and the built-in classes: identity,
//! equality, ordering, sorting, string conversion, and `%`-formatting.
//!
//! Everything here is a stateless function over the heap; nothing in this
//! module allocates GC objects or mutates VM state.

use crate::error::{Error, Result};
use crate::heap::Heap;
use crate::map::Map;
use crate::object::Obj;
use crate::value::Value;

/// The `is` operator: identity for objects and interned values, value
/// comparison for primitives.
pub fn values_is(a: Value, b: Value) -> bool {
    a.identical_to(&b)
}

/// The `==` operator: deep for lists, dicts, and buffers; identity/value
/// comparison for everything else.
pub fn values_equal(heap: &Heap, a: Value, b: Value) -> bool {
    match (a, b) {
        (Value::Obj(ia), Value::Obj(ib)) => {
            if ia == ib {
                return true;
            }
            match (heap.get(ia), heap.get(ib)) {
                (Obj::List(la), Obj::List(lb)) => {
                    la.items.len() == lb.items.len()
                        && la
                            .items
                            .iter()
                            .zip(lb.items.iter())
                            .all(|(x, y)| values_equal(heap, *x, *y))
                }
                (Obj::Dict(da), Obj::Dict(db)) => maps_equal(heap, &da.map, &db.map),
                (Obj::Buffer(ba), Obj::Buffer(bb)) => ba.data == bb.data,
                _ => false,
            }
        }
        _ => a.identical_to(&b),
    }
}

/// Same size and every key maps to an equal value.
pub fn maps_equal(heap: &Heap, a: &Map, b: &Map) -> bool {
    if a.len() != b.len() {
        return false;
    }
    for (key, value_a) in a.iter() {
        // Keys inside a map were hashed when they were inserted.
        let hash = heap
            .value_hash(key)
            .expect("map keys are always hashable");
        match b.get(key, hash) {
            Some(value_b) if values_equal(heap, value_a, value_b) => {}
            _ => return false,
        }
    }
    true
}

/// The `<` operator: defined for bools, numbers, strings, lists, and
/// tuples (lexicographic); a runtime error for everything else or for
/// mixed operand kinds.
pub fn value_less_than(heap: &Heap, a: Value, b: Value) -> Result<bool> {
    let mismatch = || {
        Error::Runtime(format!(
            "'<' requires values of the same type but got {} and {}",
            heap.kind_name(a),
            heap.kind_name(b)
        ))
    };
    match (a, b) {
        (Value::Bool(x), Value::Bool(y)) => Ok(!x & y),
        (Value::Nil, Value::Nil) => Ok(false),
        (Value::Number(x), Value::Number(y)) => Ok(x < y),
        (Value::Str(x), Value::Str(y)) => Ok(heap.str(x) < heap.str(y)),
        (Value::Obj(x), Value::Obj(y)) => {
            let (items_a, items_b): (&[Value], &[Value]) = match (heap.get(x), heap.get(y)) {
                (Obj::List(la), Obj::List(lb)) => (&la.items, &lb.items),
                (Obj::Tuple(ta), Obj::Tuple(tb)) => (&ta.items, &tb.items),
                _ => return Err(mismatch()),
            };
            for (xi, yi) in items_a.iter().zip(items_b.iter()) {
                if !values_equal(heap, *xi, *yi) {
                    return value_less_than(heap, *xi, *yi);
                }
            }
            Ok(items_a.len() < items_b.len())
        }
        _ => Err(mismatch()),
    }
}

/// Stable bottom-up mergesort of `items`, ordered by `keys` when given
/// (`keys[i]` sorts `items[i]`) and by the items themselves otherwise.
pub fn sort_values(
    heap: &Heap,
    items: &mut [Value],
    keys: Option<&[Value]>,
) -> Result<()> {
    let len = items.len();
    if let Some(keys) = keys {
        if keys.len() != len {
            return Err(Error::Runtime(format!(
                "sort: item list and key list lengths do not match: {}, {}",
                len,
                keys.len()
            )));
        }
    }
    let mut src: Vec<(Value, Value)> = (0..len)
        .map(|i| (keys.map(|k| k[i]).unwrap_or(items[i]), items[i]))
        .collect();
    let mut dst = src.clone();

    let mut width = 1;
    while width < len {
        let mut i = 0;
        while i < len {
            let mid = usize::min(i + width, len);
            let high = usize::min(i + 2 * width, len);
            let (mut a, mut b) = (i, mid);
            for slot in dst[i..high].iter_mut() {
                let take_b = b < high
                    && (a >= mid || value_less_than(heap, src[b].0, src[a].0)?);
                if take_b {
                    *slot = src[b];
                    b += 1;
                } else {
                    *slot = src[a];
                    a += 1;
                }
            }
            i += 2 * width;
        }
        std::mem::swap(&mut src, &mut dst);
        width *= 2;
    }

    for (slot, (_, value)) in items.iter_mut().zip(src) {
        *slot = value;
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// String conversion
// ---------------------------------------------------------------------------

/// Format a number the way the original prints them: `%f`, then trim the
/// trailing zeros and a trailing decimal point.
pub fn write_number(out: &mut String, n: f64) {
    if n.is_nan() {
        out.push_str("nan");
        return;
    }
    if n.is_infinite() {
        out.push_str(if n < 0.0 { "-inf" } else { "inf" });
        return;
    }
    let formatted = format!("{n:.6}");
    let trimmed = formatted.trim_end_matches('0').trim_end_matches('.');
    out.push_str(trimmed);
}

/// Escape a byte for a quoted display. `shorthand` enables the `\n`-style
/// codes; without it every control byte renders as `\xNN` (buffer repr).
fn escape_byte_into(out: &mut String, byte: u8, shorthand: bool) {
    match byte {
        b'"' => out.push_str("\\\""),
        b'\\' => out.push_str("\\\\"),
        b'\n' if shorthand => out.push_str("\\n"),
        b'\t' if shorthand => out.push_str("\\t"),
        b'\r' if shorthand => out.push_str("\\r"),
        0x20..=0x7e => out.push(byte as char),
        b if b >= 0x80 => out.push(b as char),
        b => {
            out.push_str(&format!("\\x{b:02x}"));
        }
    }
}

fn escape_str_into(out: &mut String, text: &str) {
    for ch in text.chars() {
        match ch {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\t' => out.push_str("\\t"),
            '\r' => out.push_str("\\r"),
            c if (c as u32) < 0x20 => out.push_str(&format!("\\x{:02x}", c as u32)),
            c => out.push(c),
        }
    }
}

fn map_repr_into(heap: &Heap, out: &mut String, map: &Map) {
    out.push('{');
    for (i, (key, value)) in map.iter().enumerate() {
        if i > 0 {
            out.push_str(", ");
        }
        write_repr(heap, out, key);
        // Nil values print as bare keys, which is how set displays
        // round-trip.
        if !value.is_nil() {
            out.push_str(": ");
            write_repr(heap, out, value);
        }
    }
    out.push('}');
}

fn write_repr(heap: &Heap, out: &mut String, value: Value) {
    match value {
        Value::Nil => out.push_str("nil"),
        Value::Bool(true) => out.push_str("true"),
        Value::Bool(false) => out.push_str("false"),
        Value::Number(n) => write_number(out, n),
        Value::Str(id) => {
            out.push('"');
            escape_str_into(out, heap.str(id));
            out.push('"');
        }
        Value::CFunction(f) => {
            out.push_str("<function ");
            out.push_str(f.name);
            out.push('>');
        }
        Value::Operator(op) => {
            out.push_str(&format!("<operator {}>", op as u32));
        }
        Value::Sentinel(s) => {
            out.push_str(&format!("<sentinel {}>", s as u32));
        }
        Value::Obj(id) => match heap.get(id) {
            Obj::Class(class) => {
                out.push_str("<class ");
                out.push_str(heap.str(class.name));
                out.push('>');
            }
            Obj::Closure(closure) => {
                let name = match heap.get(closure.thunk) {
                    Obj::Thunk(thunk) => thunk.name.map(|n| heap.str(n)).unwrap_or("<script>"),
                    _ => "<script>",
                };
                out.push_str("<function ");
                out.push_str(name);
                out.push('>');
            }
            Obj::Thunk(thunk) => {
                let name = thunk.name.map(|n| heap.str(n)).unwrap_or("<script>");
                out.push_str("<thunk ");
                out.push_str(name);
                out.push('>');
            }
            Obj::NativeClosure(nc) => {
                out.push_str("<native-closure ");
                out.push_str(nc.name);
                out.push('>');
            }
            Obj::Instance(instance) => {
                let (name, is_module) = match heap.get(instance.class) {
                    Obj::Class(class) => (heap.str(class.name), class.is_module),
                    _ => ("?", false),
                };
                if is_module {
                    out.push_str(&format!("<module {name}>"));
                } else {
                    out.push_str(&format!("<{name} instance>"));
                }
            }
            Obj::Buffer(buffer) => {
                out.push_str("b\"");
                for &byte in &buffer.data {
                    escape_byte_into(out, byte, false);
                }
                out.push('"');
            }
            Obj::List(list) => {
                out.push('[');
                for (i, item) in list.items.iter().enumerate() {
                    if i > 0 {
                        out.push_str(", ");
                    }
                    write_repr(heap, out, *item);
                }
                out.push(']');
            }
            Obj::Tuple(tuple) => {
                out.push('(');
                for (i, item) in tuple.items.iter().enumerate() {
                    if i > 0 {
                        out.push_str(", ");
                    }
                    write_repr(heap, out, *item);
                }
                out.push(')');
            }
            Obj::Dict(dict) => map_repr_into(heap, out, &dict.map),
            Obj::FrozenDict(fdict) => {
                out.push_str("final");
                map_repr_into(heap, out, &fdict.map);
            }
            Obj::File(file) => {
                out.push_str("<file ");
                out.push_str(heap.str(file.name));
                out.push('>');
            }
            Obj::Native(native) => {
                out.push_str(&format!("<{} native-instance>", native.descriptor.name));
            }
            Obj::Upvalue(_) => out.push_str("<upvalue>"),
        },
    }
}

/// The `repr()` of a value.
pub fn value_repr(heap: &Heap, value: Value) -> String {
    let mut out = String::new();
    write_repr(heap, &mut out, value);
    out
}

/// The `str()` of a value: strings unquoted, everything else as `repr()`.
pub fn value_str(heap: &Heap, value: Value) -> String {
    if let Value::Str(id) = value {
        return heap.str(id).to_string();
    }
    value_repr(heap, value)
}

/// `%`-formatting: `"%s and %r" % [a, b]`. `%s` uses `str` conversion,
/// `%r` uses `repr`, `%%` is a literal percent sign.
pub fn str_mod(heap: &Heap, format: &str, args: &[Value]) -> Result<String> {
    let mut out = String::new();
    let mut chars = format.chars();
    let mut next_arg = 0;
    while let Some(ch) = chars.next() {
        if ch != '%' {
            out.push(ch);
            continue;
        }
        match chars.next() {
            Some('%') => out.push('%'),
            Some(indicator @ ('s' | 'r')) => {
                if next_arg >= args.len() {
                    return Err(Error::Runtime(
                        "Not enough arguments for format string".to_string(),
                    ));
                }
                let arg = args[next_arg];
                next_arg += 1;
                if indicator == 's' {
                    out.push_str(&value_str(heap, arg));
                } else {
                    out.push_str(&value_repr(heap, arg));
                }
            }
            Some(other) => {
                return Err(Error::Runtime(format!(
                    "invalid format indicator '%{other}'"
                )));
            }
            None => {
                return Err(Error::Runtime("missing format indicator".to_string()));
            }
        }
    }
    Ok(out)
}

/// Decode the escape sequences of a quoted string literal body.
pub fn unescape(src: &str) -> std::result::Result<String, String> {
    let mut out = String::with_capacity(src.len());
    let mut chars = src.chars();
    while let Some(ch) = chars.next() {
        if ch != '\\' {
            out.push(ch);
            continue;
        }
        match chars.next() {
            Some('n') => out.push('\n'),
            Some('t') => out.push('\t'),
            Some('r') => out.push('\r'),
            Some('0') => out.push('\0'),
            Some('\\') => out.push('\\'),
            Some('\'') => out.push('\''),
            Some('"') => out.push('"'),
            Some('x') => {
                let hi = chars.next().and_then(|c| c.to_digit(16));
                let lo = chars.next().and_then(|c| c.to_digit(16));
                match (hi, lo) {
                    (Some(hi), Some(lo)) => out.push(((hi * 16 + lo) as u8) as char),
                    _ => return Err("Invalid hex escape in string literal".to_string()),
                }
            }
            Some(other) => {
                return Err(format!("Invalid string escape '\\{other}'"));
            }
            None => return Err("Expected string escape but got end of string".to_string()),
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn number_formatting_trims_like_printf_f() {
        let fmt = |n: f64| {
            let mut s = String::new();
            write_number(&mut s, n);
            s
        };
        assert_eq!(fmt(1.0), "1");
        assert_eq!(fmt(100.0), "100");
        assert_eq!(fmt(0.5), "0.5");
        assert_eq!(fmt(-2.25), "-2.25");
        assert_eq!(fmt(0.0), "0");
        assert_eq!(fmt(f64::NAN), "nan");
        assert_eq!(fmt(f64::INFINITY), "inf");
        assert_eq!(fmt(f64::NEG_INFINITY), "-inf");
    }

    #[test]
    fn unescape_handles_the_supported_sequences() {
        assert_eq!(unescape(r"a\nb\tc\\d\'e").unwrap(), "a\nb\tc\\d'e");
        assert_eq!(unescape(r"\x41\x20\x42").unwrap(), "A B");
        assert!(unescape(r"\q").is_err());
    }
}
