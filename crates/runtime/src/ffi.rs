//! Foreign-function bridge (§4.J): CIF construction, Value<->raw
//! marshalling, blocking calls that release the global cooperative lock
//! around the foreign call, and libffi closures that call back into the
//! VM.

use crate::interpreter::Interpreter;
use crate::thread::global_lock;
use libffi::low;
use libffi::middle::{Arg, Cif, Closure, CodePtr, Type};
use loom_core::{PtrData, RuntimeError, Value, ValueKind};
use std::ffi::c_void;
use std::sync::atomic::{AtomicPtr, AtomicU64, Ordering};
use std::sync::Arc;

/// Direct exposure of the system FFI library's primitive type descriptors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FfiType {
    Uint8,
    Sint8,
    Uint16,
    Sint16,
    Uint32,
    Sint32,
    Uint64,
    Sint64,
    Float,
    Double,
    Pointer,
    Void,
    Struct(u32),
}

impl FfiType {
    fn to_middle(self, structs: &StructTable) -> Type {
        match self {
            FfiType::Uint8 => Type::u8(),
            FfiType::Sint8 => Type::i8(),
            FfiType::Uint16 => Type::u16(),
            FfiType::Sint16 => Type::i16(),
            FfiType::Uint32 => Type::u32(),
            FfiType::Sint32 => Type::i32(),
            FfiType::Uint64 => Type::u64(),
            FfiType::Sint64 => Type::i64(),
            FfiType::Float => Type::f32(),
            FfiType::Double => Type::f64(),
            FfiType::Pointer => Type::pointer(),
            FfiType::Void => Type::void(),
            FfiType::Struct(id) => structs.get(id).expect("unknown struct descriptor id").clone(),
        }
    }

    fn size(self) -> usize {
        match self {
            FfiType::Uint8 | FfiType::Sint8 => 1,
            FfiType::Uint16 | FfiType::Sint16 => 2,
            FfiType::Uint32 | FfiType::Sint32 | FfiType::Float => 4,
            FfiType::Uint64 | FfiType::Sint64 | FfiType::Double | FfiType::Pointer => 8,
            FfiType::Void => 0,
            FfiType::Struct(_) => 0, // resolved via the struct descriptor's field offsets
        }
    }
}

/// `cffi_struct(fields...)`: a struct descriptor is its field types plus
/// the element offsets libffi computes when building the aggregate type.
pub struct StructDescriptor {
    pub fields: Vec<FfiType>,
    pub offsets: Vec<usize>,
    middle_type: Type,
}

#[derive(Default)]
pub struct StructTable {
    descriptors: std::sync::RwLock<std::collections::HashMap<u32, StructDescriptor>>,
    next_id: AtomicU64,
}

impl StructTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn define(&self, fields: Vec<FfiType>) -> u32 {
        let middle_fields: Vec<Type> = fields.iter().map(|f| f.to_middle(self)).collect();
        let middle_type = Type::structure(middle_fields);
        // libffi lays out fields with natural alignment; without a portable
        // const-eval path to its internal offsets, offsets are computed the
        // same way a naive C compiler would: cumulative size rounded up to
        // each field's own size (a reasonable approximation for the
        // primitive types this VM marshals).
        let mut offsets = Vec::with_capacity(fields.len());
        let mut cursor = 0usize;
        for f in &fields {
            let align = f.size().max(1);
            cursor = cursor.div_ceil(align) * align;
            offsets.push(cursor);
            cursor += f.size();
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) as u32;
        self.descriptors.write().expect("struct table lock poisoned").insert(id, StructDescriptor { fields, offsets, middle_type });
        id
    }

    fn get(&self, id: u32) -> Option<Type> {
        self.descriptors.read().expect("struct table lock poisoned").get(&id).map(|d| d.middle_type.clone())
    }

    pub fn descriptor(&self, id: u32) -> Option<(Vec<FfiType>, Vec<usize>)> {
        self.descriptors
            .read()
            .expect("struct table lock poisoned")
            .get(&id)
            .map(|d| (d.fields.clone(), d.offsets.clone()))
    }
}

/// `cffi_cif(ret, args..., nFixed?)`: a call interface, optionally
/// variadic via `nFixed`.
pub struct CallInterface {
    pub ret: FfiType,
    pub args: Vec<FfiType>,
    pub n_fixed: Option<usize>,
    cif: Cif,
}

impl CallInterface {
    pub fn new(structs: &StructTable, ret: FfiType, args: Vec<FfiType>, n_fixed: Option<usize>) -> Self {
        let arg_types: Vec<Type> = args.iter().map(|a| a.to_middle(structs)).collect();
        let ret_type = ret.to_middle(structs);
        let cif = Cif::new(arg_types, ret_type);
        Self { ret, args, n_fixed, cif }
    }
}

/// `store(type, dst, value)`: converts a Value to raw bytes at `dst`.
pub fn store(ty: FfiType, dst: *mut u8, value: &Value, structs: &StructTable) -> Result<(), RuntimeError> {
    unsafe {
        match ty {
            FfiType::Uint8 | FfiType::Sint8 => *dst = int_of(value)? as u8,
            FfiType::Uint16 | FfiType::Sint16 => (dst as *mut i16).write_unaligned(int_of(value)? as i16),
            FfiType::Uint32 | FfiType::Sint32 => (dst as *mut i32).write_unaligned(int_of(value)? as i32),
            FfiType::Uint64 | FfiType::Sint64 => (dst as *mut i64).write_unaligned(int_of(value)?),
            FfiType::Float => (dst as *mut f32).write_unaligned(float_of(value)? as f32),
            FfiType::Double => (dst as *mut f64).write_unaligned(float_of(value)?),
            FfiType::Pointer => (dst as *mut usize).write_unaligned(pointer_of(value)?),
            FfiType::Struct(id) => {
                let (fields, offsets) = structs.descriptor(id).ok_or_else(|| struct_err())?;
                let ValueKind::Tuple(tuple) = &value.kind else {
                    return Err(RuntimeError::DispatchError {
                        op_or_method: "ffi.store".into(),
                        class: "Struct".into(),
                    });
                };
                for (i, (field_ty, offset)) in fields.iter().zip(offsets.iter()).enumerate() {
                    store(*field_ty, dst.add(*offset), &tuple.items[i], structs)?;
                }
            }
            FfiType::Void => {}
        }
        Ok(())
    }
}

/// `load(type, src) -> Value`: the inverse of `store`.
pub fn load(ty: FfiType, src: *const u8, structs: &StructTable) -> Result<Value, RuntimeError> {
    unsafe {
        Ok(match ty {
            FfiType::Uint8 => Value::int(*src as i64),
            FfiType::Sint8 => Value::int(*(src as *const i8) as i64),
            FfiType::Uint16 => Value::int((src as *const u16).read_unaligned() as i64),
            FfiType::Sint16 => Value::int((src as *const i16).read_unaligned() as i64),
            FfiType::Uint32 => Value::int((src as *const u32).read_unaligned() as i64),
            FfiType::Sint32 => Value::int((src as *const i32).read_unaligned() as i64),
            FfiType::Uint64 => Value::int((src as *const u64).read_unaligned() as i64),
            FfiType::Sint64 => Value::int((src as *const i64).read_unaligned()),
            FfiType::Float => Value::float((src as *const f32).read_unaligned() as f64),
            FfiType::Double => Value::float((src as *const f64).read_unaligned()),
            FfiType::Pointer => Value::new(ValueKind::Ptr(PtrData {
                addr: (src as *const usize).read_unaligned(),
                extra: None,
            })),
            FfiType::Struct(id) => {
                let (fields, offsets) = structs.descriptor(id).ok_or_else(struct_err)?;
                let mut items = Vec::with_capacity(fields.len());
                for (field_ty, offset) in fields.iter().zip(offsets.iter()) {
                    items.push(load(*field_ty, src.add(*offset), structs)?);
                }
                Value::new(ValueKind::Tuple(Arc::new(loom_core::TupleData { items, field_ids: None })))
            }
            FfiType::Void => Value::nil(),
        })
    }
}

/// Atomic variants: relaxed atomic accesses, integral/pointer types only.
pub fn xstore(ty: FfiType, dst: *mut u8, value: &Value) -> Result<(), RuntimeError> {
    match ty {
        FfiType::Sint32 | FfiType::Uint32 => unsafe {
            (*(dst as *const std::sync::atomic::AtomicI32)).store(int_of(value)? as i32, Ordering::Relaxed);
            Ok(())
        },
        FfiType::Sint64 | FfiType::Uint64 => unsafe {
            (*(dst as *const AtomicU64)).store(int_of(value)? as u64, Ordering::Relaxed);
            Ok(())
        },
        FfiType::Pointer => unsafe {
            (*(dst as *const AtomicPtr<c_void>)).store(pointer_of(value)? as *mut c_void, Ordering::Relaxed);
            Ok(())
        },
        _ => Err(RuntimeError::DispatchError { op_or_method: "ffi.xstore".into(), class: "non-atomic-type".into() }),
    }
}

pub fn xload(ty: FfiType, src: *const u8) -> Result<Value, RuntimeError> {
    match ty {
        FfiType::Sint32 | FfiType::Uint32 => unsafe {
            Ok(Value::int((*(src as *const std::sync::atomic::AtomicI32)).load(Ordering::Relaxed) as i64))
        },
        FfiType::Sint64 | FfiType::Uint64 => unsafe {
            Ok(Value::int((*(src as *const AtomicU64)).load(Ordering::Relaxed) as i64))
        },
        FfiType::Pointer => unsafe {
            Ok(Value::new(ValueKind::Ptr(PtrData {
                addr: (*(src as *const AtomicPtr<c_void>)).load(Ordering::Relaxed) as usize,
                extra: None,
            })))
        },
        _ => Err(RuntimeError::DispatchError { op_or_method: "ffi.xload".into(), class: "non-atomic-type".into() }),
    }
}

fn int_of(value: &Value) -> Result<i64, RuntimeError> {
    match value.kind {
        ValueKind::Int(i) => Ok(*i),
        ValueKind::Float(f) => Ok(*f as i64),
        ValueKind::Ptr(p) => Ok(p.addr as i64),
        _ => Err(RuntimeError::DispatchError { op_or_method: "ffi.store".into(), class: "integer-target".into() }),
    }
}

fn float_of(value: &Value) -> Result<f64, RuntimeError> {
    match value.kind {
        ValueKind::Float(f) => Ok(*f),
        ValueKind::Int(i) => Ok(*i as f64),
        _ => Err(RuntimeError::DispatchError { op_or_method: "ffi.store".into(), class: "float-target".into() }),
    }
}

fn pointer_of(value: &Value) -> Result<usize, RuntimeError> {
    match value.kind {
        ValueKind::Ptr(p) => Ok(p.addr),
        ValueKind::Int(i) => Ok(*i as usize),
        ValueKind::Nil => Ok(0),
        ValueKind::String(s) => Ok(s.as_ptr() as usize),
        ValueKind::Blob(b) => Ok(b.lock().expect("blob lock poisoned").as_ptr() as usize),
        _ => Err(RuntimeError::DispatchError { op_or_method: "ffi.store".into(), class: "pointer-target".into() }),
    }
}

fn struct_err() -> RuntimeError {
    RuntimeError::DispatchError { op_or_method: "ffi.store".into(), class: "unknown-struct".into() }
}

/// `ffi.call(cif, fn, args...)`: release the global lock, invoke the raw
/// C function, reacquire, return the raw result word. Argument marshalling
/// into scratch-arena storage and building the `Arg` slice is the
/// interpreter's job (it owns the arena and the argument Values); this
/// wraps only the lock-release/invoke/reacquire protocol plus the unsafe
/// libffi call itself.
///
/// # Safety
/// `fn_ptr` must be a valid pointer to a C function matching `cif`'s
/// signature, and `args` must be built from storage that outlives the
/// call and matches the arity/types `cif` was constructed with.
pub unsafe fn call(cif: &CallInterface, fn_ptr: *const c_void, args: &[Arg]) -> usize {
    let code = CodePtr::from_ptr(fn_ptr);
    global_lock().release_around(|| unsafe { cif.cif.call::<usize>(code, args) })
}

/// Fixed-size scratch big enough for any scalar `FfiType` this bridge
/// marshals; struct returns aren't supported by-value through a closure
/// (the original C function pointers this stands in for never returned
/// aggregates larger than a register either).
const RET_SCRATCH: usize = 8;

struct ClosureUserData {
    callable: Value,
    structs: Arc<StructTable>,
    arg_types: Vec<FfiType>,
    ret_type: FfiType,
}

/// `ffi.closure(arg_types, ret_type, f)`: a libffi trampoline whose code
/// pointer foreign code can call like any other C function; each call
/// marshals its raw arguments to `Value`s, invokes `f` back on the VM
/// thread that installed itself via `Interpreter::enter`, and marshals the
/// `Value` result back to raw bytes.
///
/// `Closure` only borrows its userdata, so it's kept alongside a boxed
/// copy with a stable address; both live in this struct and the closure
/// field is declared (and so dropped) before the userdata it points into.
pub struct VmClosure {
    code: CodePtr,
    closure: Closure<'static>,
    userdata: Box<ClosureUserData>,
}

// SAFETY: the only cross-thread traffic through `closure`/`code` is the
// underlying executable trampoline, which is immutable after construction;
// all mutable state it touches lives behind `Interpreter::with_current`'s
// own synchronization (one OS thread's interpreter at a time).
unsafe impl Send for VmClosure {}
unsafe impl Sync for VmClosure {}

impl VmClosure {
    pub fn new(structs: Arc<StructTable>, arg_types: Vec<FfiType>, ret_type: FfiType, callable: Value) -> Self {
        let middle_args: Vec<Type> = arg_types.iter().map(|a| a.to_middle(&structs)).collect();
        let middle_ret = ret_type.to_middle(&structs);
        let cif = Cif::new(middle_args, middle_ret);
        let userdata = Box::new(ClosureUserData { callable, structs, arg_types, ret_type });
        // SAFETY: `userdata`'s heap allocation outlives `closure` (dropped
        // first, per field order below), so this borrow never dangles.
        let userdata_ref: &'static ClosureUserData = unsafe { &*(userdata.as_ref() as *const ClosureUserData) };
        let closure = Closure::new(cif, trampoline, userdata_ref);
        let code = *closure.code_ptr();
        Self { code, closure, userdata }
    }

    pub fn code_ptr(&self) -> CodePtr {
        self.code
    }
}

extern "C" fn trampoline(
    _cif: &low::ffi_cif,
    result: &mut [u8; RET_SCRATCH],
    args: *const *const c_void,
    userdata: &ClosureUserData,
) {
    let argc = userdata.arg_types.len();
    let raw_args = unsafe { std::slice::from_raw_parts(args, argc) };

    let marshal_and_call = || -> Result<Value, RuntimeError> {
        let mut values = Vec::with_capacity(argc);
        for (ty, raw) in userdata.arg_types.iter().zip(raw_args.iter()) {
            values.push(load(*ty, *raw as *const u8, &userdata.structs)?);
        }
        match Interpreter::with_current(|interp| interp.eval_function(&userdata.callable, &values)) {
            Some(Ok(v)) => Ok(v),
            Some(Err(_)) => Err(RuntimeError::Panic {
                component: "ffi".into(),
                message: "closure trampoline: a thrown value escaped across the FFI boundary".into(),
            }),
            None => Err(RuntimeError::Panic {
                component: "ffi".into(),
                message: "closure invoked on a thread with no VM context installed".into(),
            }),
        }
    };

    // The trampoline may run reentrantly on the thread that made the
    // outbound `ffi.call` (the common synchronous callback case), which
    // already holds the global lock; only take it if this thread doesn't.
    let took_lock = !global_lock().holding();
    if took_lock {
        global_lock().take();
    }
    let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(marshal_and_call));
    if took_lock {
        global_lock().release();
    }

    let value = match outcome {
        Ok(Ok(v)) => v,
        _ => Value::nil(),
    };
    *result = [0u8; RET_SCRATCH];
    let _ = store(userdata.ret_type, result.as_mut_ptr(), &value, &userdata.structs);
}

/// `ffi.auto(ptr, dtor?)`: attaches a finalizer to a raw pointer; on
/// collection the finalizer runs exactly once. The actual hookup into the
/// collector's sweep pass happens where `AllocBody` gains a pointer
/// variant; this wraps the dtor invocation itself.
pub struct AutoPointer {
    pub addr: usize,
    dtor: Option<Box<dyn FnOnce(usize) + Send>>,
    ran: std::sync::atomic::AtomicBool,
}

impl AutoPointer {
    pub fn new(addr: usize, dtor: Option<Box<dyn FnOnce(usize) + Send>>) -> Self {
        Self { addr, dtor, ran: std::sync::atomic::AtomicBool::new(false) }
    }

    pub fn run_once(&mut self) {
        if self.ran.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(dtor) = self.dtor.take() {
            dtor(self.addr);
        }
    }
}

impl Drop for AutoPointer {
    fn drop(&mut self) {
        self.run_once();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_load_round_trips_through_int32() {
        let structs = StructTable::new();
        let mut buf = [0u8; 4];
        store(FfiType::Sint32, buf.as_mut_ptr(), &Value::int(-7), &structs).unwrap();
        let v = load(FfiType::Sint32, buf.as_ptr(), &structs).unwrap();
        assert_eq!(v.as_int(), Some(-7));
    }

    #[test]
    fn store_rejects_wrong_shape_for_struct() {
        let structs = StructTable::new();
        let id = structs.define(vec![FfiType::Sint32, FfiType::Sint32]);
        let mut buf = [0u8; 8];
        let err = store(FfiType::Struct(id), buf.as_mut_ptr(), &Value::int(1), &structs);
        assert!(err.is_err());
    }

    #[test]
    fn struct_offsets_are_naturally_aligned() {
        let structs = StructTable::new();
        let id = structs.define(vec![FfiType::Sint8, FfiType::Sint32]);
        let (_, offsets) = structs.descriptor(id).unwrap();
        assert_eq!(offsets, vec![0, 4]);
    }

    #[test]
    fn closure_trampoline_marshals_args_and_calls_back_into_the_entered_interpreter() {
        let structs = Arc::new(StructTable::new());
        let func: loom_core::NativeFn = Arc::new(|_ctx, args, _recv| Ok(Value::int(args[0].as_int().unwrap_or(0) * 2)));
        let b = Arc::new(loom_core::BuiltinFunctionData { name: 1, arity: loom_core::Arity::Exact(1), func });
        let callable = Value::new(ValueKind::BuiltinFunction(b));
        let userdata = ClosureUserData { callable, structs, arg_types: vec![FfiType::Sint32], ret_type: FfiType::Sint32 };

        let mut interp = Interpreter::new(Arc::new(crate::class::ClassTable::new()), Arc::new(crate::dispatch::OperatorTable::new()));
        let _guard = interp.enter();

        let arg: i32 = 21;
        let args: [*const c_void; 1] = [&arg as *const i32 as *const c_void];
        // the trampoline never reads its `cif` argument; zeroed is fine here.
        let cif = unsafe { std::mem::zeroed::<low::ffi_cif>() };
        let mut result = [0u8; RET_SCRATCH];
        trampoline(&cif, &mut result, args.as_ptr(), &userdata);
        assert_eq!(i32::from_ne_bytes(result[..4].try_into().unwrap()), 42);
    }

    #[test]
    fn closure_trampoline_without_an_entered_interpreter_returns_nil_not_a_panic() {
        let structs = Arc::new(StructTable::new());
        let func: loom_core::NativeFn = Arc::new(|_ctx, _args, _recv| Ok(Value::int(1)));
        let b = Arc::new(loom_core::BuiltinFunctionData { name: 1, arity: loom_core::Arity::Exact(0), func });
        let callable = Value::new(ValueKind::BuiltinFunction(b));
        let userdata = ClosureUserData { callable, structs, arg_types: vec![], ret_type: FfiType::Sint32 };

        let cif = unsafe { std::mem::zeroed::<low::ffi_cif>() };
        let mut result = [0xffu8; RET_SCRATCH];
        trampoline(&cif, &mut result, std::ptr::null(), &userdata);
        assert_eq!(i32::from_ne_bytes(result[..4].try_into().unwrap()), 0);
    }

    #[test]
    fn auto_pointer_runs_dtor_exactly_once() {
        let ran = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let r = ran.clone();
        let mut ptr = AutoPointer::new(0x1000, Some(Box::new(move |_| {
            r.fetch_add(1, Ordering::Relaxed);
        })));
        ptr.run_once();
        ptr.run_once();
        drop(ptr);
        assert_eq!(ran.load(Ordering::Relaxed), 1);
    }
}
