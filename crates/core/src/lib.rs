//! Loom Core: value representation and allocation bookkeeping for a
//! stack-based dynamic language runtime.
//!
//! This crate is deliberately small and has no concurrency or GC-sweep
//! logic of its own — it defines the data that the `loom-runtime` crate's
//! collector, dispatcher, and interpreter operate on.
//!
//! # Modules
//!
//! - `intern`: bi-map from names to small stable integers
//! - `alloc`: the `Alloc` header every managed heap block carries
//! - `error`: thread-local last-error slot plus the `RuntimeError` taxonomy
//! - `value`: the `Value` tagged variant and its tag stack

pub mod alloc;
pub mod error;
pub mod intern;
pub mod value;

pub use alloc::{Alloc, AllocKind, HardPinGuard};
pub use error::{RuntimeError, clear_runtime_error, has_runtime_error, set_runtime_error, take_runtime_error};
pub use intern::{InternId, InternTable};
pub use value::{
    Arity, BuiltinFunctionData, BuiltinMethodData, ClassId, DictData, FunctionData,
    GeneratorHandle, ItableSlot, MethodData, NativeContext, NativeFn, NativeResult, ObjectData,
    OperatorData, PtrData, RegexData, TagId, TagSpineTable, TagStack, ThreadHandle, TupleData,
    Value, ValueKind, ops,
};
