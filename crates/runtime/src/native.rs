//! Minimal native-object method tables (§4.L): string/array/dict
//! built-ins registered as `BuiltinMethodData`/`BuiltinFunctionData`
//! under the `fn(ty, self, argc, kwargs) -> Value` convention (§6.2),
//! expressed here as `loom_core::NativeFn` closures.

use crate::class::{ClassTable, MemberKind};
use loom_core::{BuiltinFunctionData, InternId, ItableSlot, NativeFn, RuntimeError, Value, ValueKind};
use std::sync::Arc;

fn wrong_kind(op: &str, got: &Value) -> RuntimeError {
    RuntimeError::DispatchError { op_or_method: op.into(), class: format!("{:?}", got.kind) }
}

fn as_string(v: &Value) -> Result<Arc<str>, RuntimeError> {
    match &v.kind {
        ValueKind::String(s) => Ok(s.clone()),
        _ => Err(wrong_kind("string-method", v)),
    }
}

/// `install(classes, id, method_id, f)`: registers a native method under
/// a class's itable, used by callers wiring this table onto the
/// well-known String/Array/Dict class ids the class table reserves for
/// built-ins.
pub fn install(classes: &ClassTable, class_id: loom_core::ClassId, method_id: InternId, arity: loom_core::Arity, func: NativeFn) {
    let data = Arc::new(BuiltinFunctionData { name: method_id, arity, func });
    classes.define(class_id, MemberKind::Method, method_id, ItableSlot::Direct(Value::new(ValueKind::BuiltinFunction(data))));
}

pub fn string_length() -> NativeFn {
    Arc::new(|_ctx, _args, recv| {
        let recv = recv.ok_or_else(|| RuntimeError::DispatchError { op_or_method: "length".into(), class: "String".into() })?;
        let s = as_string(recv)?;
        Ok(Value::int(s.chars().count() as i64))
    })
}

pub fn string_upper() -> NativeFn {
    Arc::new(|_ctx, _args, recv| {
        let recv = recv.ok_or_else(|| RuntimeError::DispatchError { op_or_method: "upper".into(), class: "String".into() })?;
        let s = as_string(recv)?;
        Ok(Value::string(s.to_uppercase()))
    })
}

pub fn string_concat() -> NativeFn {
    Arc::new(|_ctx, args, recv| {
        let recv = recv.ok_or_else(|| RuntimeError::DispatchError { op_or_method: "concat".into(), class: "String".into() })?;
        let a = as_string(recv)?;
        let b = as_string(args.first().ok_or_else(|| RuntimeError::DispatchError { op_or_method: "concat".into(), class: "arity".into() })?)?;
        Ok(Value::string(format!("{a}{b}")))
    })
}

pub fn array_length() -> NativeFn {
    Arc::new(|_ctx, _args, recv| {
        let recv = recv.ok_or_else(|| RuntimeError::DispatchError { op_or_method: "length".into(), class: "Array".into() })?;
        match &recv.kind {
            ValueKind::Array(arr) => Ok(Value::int(arr.lock().expect("array lock poisoned").len() as i64)),
            _ => Err(wrong_kind("length", recv)),
        }
    })
}

pub fn array_push() -> NativeFn {
    Arc::new(|_ctx, args, recv| {
        let recv = recv.ok_or_else(|| RuntimeError::DispatchError { op_or_method: "push".into(), class: "Array".into() })?;
        match &recv.kind {
            ValueKind::Array(arr) => {
                let item = args.first().cloned().unwrap_or(Value::nil());
                arr.lock().expect("array lock poisoned").push(item);
                Ok(recv.clone())
            }
            _ => Err(wrong_kind("push", recv)),
        }
    })
}

pub fn array_get() -> NativeFn {
    Arc::new(|_ctx, args, recv| {
        let recv = recv.ok_or_else(|| RuntimeError::DispatchError { op_or_method: "get".into(), class: "Array".into() })?;
        match &recv.kind {
            ValueKind::Array(arr) => {
                let idx = args.first().and_then(|v| v.as_int()).unwrap_or(0);
                let guard = arr.lock().expect("array lock poisoned");
                let len = guard.len() as i64;
                let resolved = if idx < 0 { idx + len } else { idx };
                if resolved < 0 || resolved >= len {
                    return Err(RuntimeError::IndexError { index: idx, len: len as usize });
                }
                Ok(guard[resolved as usize].clone())
            }
            _ => Err(wrong_kind("get", recv)),
        }
    })
}

pub fn dict_get() -> NativeFn {
    Arc::new(|_ctx, args, recv| {
        let recv = recv.ok_or_else(|| RuntimeError::DispatchError { op_or_method: "get".into(), class: "Dict".into() })?;
        match &recv.kind {
            ValueKind::Dict(dict) => {
                let key = args.first().cloned().unwrap_or(Value::nil());
                let guard = dict.lock().expect("dict lock poisoned");
                match guard.get(&key) {
                    Some(v) => Ok(v.clone()),
                    None => guard.default.clone().ok_or_else(|| RuntimeError::MatchError { message: "key not found".into() }),
                }
            }
            _ => Err(wrong_kind("get", recv)),
        }
    })
}

pub fn dict_set() -> NativeFn {
    Arc::new(|_ctx, args, recv| {
        let recv = recv.ok_or_else(|| RuntimeError::DispatchError { op_or_method: "set".into(), class: "Dict".into() })?;
        match &recv.kind {
            ValueKind::Dict(dict) => {
                let key = args.first().cloned().unwrap_or(Value::nil());
                let value = args.get(1).cloned().unwrap_or(Value::nil());
                dict.lock().expect("dict lock poisoned").insert(key, value);
                Ok(recv.clone())
            }
            _ => Err(wrong_kind("set", recv)),
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn string_length_counts_chars() {
        let f = string_length();
        let recv = Value::string("hello");
        let result = f(&mut crate::interpreter::Interpreter::new(
            Arc::new(ClassTable::new()),
            Arc::new(crate::dispatch::OperatorTable::new()),
        ), &[], Some(&recv)).unwrap();
        assert_eq!(result.as_int(), Some(5));
    }

    #[test]
    fn array_push_then_get() {
        let arr = Value::new(ValueKind::Array(Arc::new(Mutex::new(vec![]))));
        let mut interp = crate::interpreter::Interpreter::new(Arc::new(ClassTable::new()), Arc::new(crate::dispatch::OperatorTable::new()));
        array_push()(&mut interp, &[Value::int(10)], Some(&arr)).unwrap();
        array_push()(&mut interp, &[Value::int(20)], Some(&arr)).unwrap();
        assert_eq!(array_length()(&mut interp, &[], Some(&arr)).unwrap().as_int(), Some(2));
        assert_eq!(array_get()(&mut interp, &[Value::int(-1)], Some(&arr)).unwrap().as_int(), Some(20));
    }

    #[test]
    fn array_get_out_of_range_is_index_error() {
        let arr = Value::new(ValueKind::Array(Arc::new(Mutex::new(vec![Value::int(1)]))));
        let mut interp = crate::interpreter::Interpreter::new(Arc::new(ClassTable::new()), Arc::new(crate::dispatch::OperatorTable::new()));
        let err = array_get()(&mut interp, &[Value::int(5)], Some(&arr));
        assert!(matches!(err, Err(RuntimeError::IndexError { .. })));
    }

    #[test]
    fn dict_get_falls_back_to_default() {
        let mut data = loom_core::DictData::new();
        data.default = Some(Value::string("missing"));
        let dict = Value::new(ValueKind::Dict(Arc::new(Mutex::new(data))));
        let mut interp = crate::interpreter::Interpreter::new(Arc::new(ClassTable::new()), Arc::new(crate::dispatch::OperatorTable::new()));
        let result = dict_get()(&mut interp, &[Value::int(1)], Some(&dict)).unwrap();
        assert_eq!(as_string(&result).unwrap().as_ref(), "missing");
    }
}
