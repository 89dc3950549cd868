//! Loom Runtime: collector, class/operator dispatch, concurrency
//! substrate, generators, and FFI bridge for the loom VM.
//!
//! `loom-core` defines the `Value` data model; everything here operates
//! on it. The bytecode dispatcher body itself is out of scope — this
//! crate hands `Function` calls off to an injected `BytecodeExecutor`
//! and owns only the surrounding machinery: frames, try/defer stacks,
//! class and operator lookup, the cooperative global lock, generators,
//! and the FFI bridge.

pub mod class;
pub mod config;
pub mod diagnostics;
pub mod dispatch;
pub mod ffi;
pub mod gc;
pub mod generator;
pub mod interpreter;
pub mod json;
pub mod native;
pub mod program;
pub mod queue;
pub mod thread;
pub mod watchdog;

pub use class::{Class, ClassTable, FieldDescriptor, Itable, MemberKind};
pub use config::{Config, config};
pub use dispatch::{DispatchGroup, OperatorTable, ProgramRef};
pub use ffi::{AutoPointer, CallInterface, FfiType, StructTable, VmClosure};
pub use gc::{AllocList, GCCounters, GCStats};
pub use generator::{Generator, GeneratorOutcome};
pub use interpreter::{BytecodeExecutor, EnterGuard, Frame, Interpreter, TryEntry, Unwind};
pub use program::{ProgramBlob, ProgramError, ProgramTable};
pub use queue::{Message, MessageQueue};
pub use thread::{
    GlobalLock, ThreadRegistry, TyBarrier, TyCondVar, TyMutex, TyRwLock, TySpinLock, VmThread, global_lock, thread_registry,
};
