//! JSON surface (§6.4): a thin consumer of the interpreter surface for
//! encoding Objects/Tuples through their VM-level hooks. Parsing uses
//! `serde_json`'s value model as an intermediate and re-expresses it as
//! `Value`, so this module owns only the mapping, not a hand-rolled
//! lexer.

use crate::class::MemberKind;
use crate::interpreter::Interpreter;
use loom_core::{InternId, RuntimeError, Value, ValueKind};
use std::sync::Arc;

/// Parses strict JSON text into a `Value`: null→Nil, true/false→Bool,
/// an integral literal→Int else Float, strings, arrays, and objects
/// with string keys→Dict.
pub fn parse(text: &str) -> Result<Value, RuntimeError> {
    let parsed: serde_json::Value =
        serde_json::from_str(text).map_err(|e| RuntimeError::MatchError { message: format!("invalid JSON: {e}") })?;
    Ok(from_serde(&parsed))
}

fn from_serde(v: &serde_json::Value) -> Value {
    match v {
        serde_json::Value::Null => Value::nil(),
        serde_json::Value::Bool(b) => Value::bool(*b),
        serde_json::Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Value::int(i)
            } else {
                Value::float(n.as_f64().unwrap_or(0.0))
            }
        }
        serde_json::Value::String(s) => Value::string(s.as_str()),
        serde_json::Value::Array(items) => {
            Value::new(ValueKind::Array(Arc::new(std::sync::Mutex::new(items.iter().map(from_serde).collect()))))
        }
        serde_json::Value::Object(map) => {
            let mut dict = loom_core::DictData::new();
            for (k, v) in map {
                dict.insert(Value::string(k.as_str()), from_serde(v));
            }
            Value::new(ValueKind::Dict(Arc::new(std::sync::Mutex::new(dict))))
        }
    }
}

/// `__json__` method id and the encoder's cycle guard stack, threaded
/// through `encode` so a self-referential Object/Array fails instead of
/// recursing forever.
pub struct Encoder<'a> {
    interp: &'a mut Interpreter,
    json_method: InternId,
    visiting: Vec<usize>,
}

impl<'a> Encoder<'a> {
    pub fn new(interp: &'a mut Interpreter, json_method: InternId) -> Self {
        Self { interp, json_method, visiting: Vec::new() }
    }

    pub fn encode(&mut self, value: &Value) -> Result<String, RuntimeError> {
        let mut out = String::new();
        self.encode_into(value, &mut out)?;
        Ok(out)
    }

    fn encode_into(&mut self, value: &Value, out: &mut String) -> Result<(), RuntimeError> {
        match &value.kind {
            ValueKind::Nil | ValueKind::None => out.push_str("null"),
            ValueKind::Bool(b) => out.push_str(if *b { "true" } else { "false" }),
            ValueKind::Int(i) => out.push_str(&i.to_string()),
            ValueKind::Float(f) => out.push_str(&f.to_string()),
            ValueKind::String(s) => encode_string(s, out),
            ValueKind::Array(arr) => {
                let ptr = Arc::as_ptr(arr) as usize;
                self.guard_cycle(ptr)?;
                out.push('[');
                let items: Vec<Value> = arr.lock().expect("array lock poisoned").clone();
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        out.push(',');
                    }
                    self.encode_into(item, out)?;
                }
                out.push(']');
                self.visiting.pop();
            }
            ValueKind::Dict(dict) => {
                let ptr = Arc::as_ptr(dict) as usize;
                self.guard_cycle(ptr)?;
                out.push('{');
                let entries = dict.lock().expect("dict lock poisoned").entries.clone();
                for (i, (k, v)) in entries.iter().enumerate() {
                    if i > 0 {
                        out.push(',');
                    }
                    let key_str = match &k.kind {
                        ValueKind::String(s) => s.to_string(),
                        other => format!("{other:?}"),
                    };
                    encode_string(&key_str, out);
                    out.push(':');
                    self.encode_into(v, out)?;
                }
                out.push('}');
                self.visiting.pop();
            }
            ValueKind::Tuple(tuple) => {
                out.push('{');
                for (i, item) in tuple.items.iter().enumerate() {
                    if i > 0 {
                        out.push(',');
                    }
                    let key = match tuple.field_ids.as_ref().and_then(|ids| ids.get(i)).copied().flatten() {
                        Some(_id) => i.to_string(),
                        None => i.to_string(),
                    };
                    encode_string(&key, out);
                    out.push(':');
                    self.encode_into(item, out)?;
                }
                out.push('}');
            }
            ValueKind::Object(obj) => {
                let ptr = Arc::as_ptr(obj) as usize;
                self.guard_cycle(ptr)?;
                if let Some(method) = self.interp.classes.lookup(obj.class, MemberKind::Method, self.json_method) {
                    let result = self.interp.eval_function(&method, &[value.clone()]).map_err(|e| match e {
                        crate::interpreter::Unwind::Error(err) => err,
                        crate::interpreter::Unwind::Thrown(_) => {
                            RuntimeError::Panic { component: "json".into(), message: "__json__ threw".into() }
                        }
                    })?;
                    self.encode_into(&result, out)?;
                } else {
                    out.push('{');
                    let itable = obj.itable.lock().expect("object itable lock poisoned");
                    for (i, (id, slot)) in itable.iter().enumerate() {
                        if i > 0 {
                            out.push(',');
                        }
                        encode_string(&id.to_string(), out);
                        out.push(':');
                        let v = match slot {
                            loom_core::ItableSlot::Direct(v) => v.clone(),
                            loom_core::ItableSlot::Ref(cell) => cell.lock().expect("ref cell lock poisoned").clone().unwrap_or(Value::nil()),
                        };
                        self.encode_into(&v, out)?;
                    }
                    out.push('}');
                }
                self.visiting.pop();
            }
            _ => out.push_str("null"),
        }
        Ok(())
    }

    fn guard_cycle(&mut self, ptr: usize) -> Result<(), RuntimeError> {
        if self.visiting.contains(&ptr) {
            return Err(RuntimeError::MatchError { message: "cycle detected during JSON encoding".into() });
        }
        self.visiting.push(ptr);
        Ok(())
    }
}

fn encode_string(s: &str, out: &mut String) {
    out.push('"');
    for c in s.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c if (c as u32) < 0x20 => out.push_str(&format!("\\u{:04x}", c as u32)),
            c => out.push(c),
        }
    }
    out.push('"');
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_primitives() {
        assert!(matches!(parse("null").unwrap().kind, ValueKind::Nil));
        assert!(matches!(parse("true").unwrap().kind, ValueKind::Bool(true)));
        assert_eq!(parse("42").unwrap().as_int(), Some(42));
    }

    #[test]
    fn parses_nested_array_and_object() {
        let v = parse(r#"{"a": [1, 2, 3], "b": "x"}"#).unwrap();
        let ValueKind::Dict(dict) = &v.kind else { panic!("expected dict") };
        let guard = dict.lock().unwrap();
        let a = guard.get(&Value::string("a")).unwrap();
        let ValueKind::Array(arr) = &a.kind else { panic!("expected array") };
        assert_eq!(arr.lock().unwrap().len(), 3);
    }

    #[test]
    fn integral_float_literal_becomes_int() {
        assert_eq!(parse("7").unwrap().as_int(), Some(7));
    }

    #[test]
    fn non_integral_number_becomes_float() {
        let v = parse("3.5").unwrap();
        assert!(matches!(v.kind, ValueKind::Float(f) if f == 3.5));
    }

    #[test]
    fn encodes_array_of_ints() {
        use crate::class::ClassTable;
        use crate::dispatch::OperatorTable;
        let mut interp = Interpreter::new(Arc::new(ClassTable::new()), Arc::new(OperatorTable::new()));
        let arr = Value::new(ValueKind::Array(Arc::new(std::sync::Mutex::new(vec![Value::int(1), Value::int(2)]))));
        let mut enc = Encoder::new(&mut interp, 1);
        assert_eq!(enc.encode(&arr).unwrap(), "[1,2]");
    }

    #[test]
    fn rejects_self_referential_array() {
        use crate::class::ClassTable;
        use crate::dispatch::OperatorTable;
        let mut interp = Interpreter::new(Arc::new(ClassTable::new()), Arc::new(OperatorTable::new()));
        let arr = Arc::new(std::sync::Mutex::new(Vec::new()));
        let wrapped = Value::new(ValueKind::Array(arr.clone()));
        arr.lock().unwrap().push(wrapped.clone());
        let mut enc = Encoder::new(&mut interp, 1);
        assert!(enc.encode(&wrapped).is_err());
    }
}
