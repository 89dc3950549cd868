//! Interpreter surface (§4.K): operand stack, frames, the try-stack, and
//! call dispatch by value kind. The opcode dispatcher body itself — what a
//! `Function`'s bytecode actually does — is a collaborator consumed
//! through the `BytecodeExecutor` trait, not implemented here; this
//! module owns only the contracts GC, dispatch, and concurrency need.

use crate::class::{ClassTable, MemberKind};
use crate::dispatch::{OperatorTable, ProgramRef};
use loom_core::{
    Arity, BuiltinFunctionData, BuiltinMethodData, FunctionData, InternId, MethodData, NativeContext, NativeResult,
    RuntimeError, Value, ValueKind,
};
use std::cell::Cell;
use std::sync::Arc;

thread_local! {
    // The interpreter an FFI closure trampoline on this OS thread should
    // call back into, installed by `Interpreter::enter`. Null when this
    // thread has never entered the VM (a foreign thread calling a closure
    // it was handed has no VM context to reenter).
    static CURRENT: Cell<*mut Interpreter> = const { Cell::new(std::ptr::null_mut()) };
}

/// Restores whatever interpreter pointer was installed on this OS thread
/// before the matching `enter` call, once dropped.
pub struct EnterGuard(*mut Interpreter);

impl Drop for EnterGuard {
    fn drop(&mut self) {
        CURRENT.with(|c| c.set(self.0));
    }
}

/// A VM-code-level stack frame: the active function, the base index of
/// its locals in the operand stack, a return address, and a back-pointer
/// used only for stack traces.
pub struct Frame {
    pub function: Value,
    pub base: usize,
    pub return_addr: usize,
    pub caller: Option<usize>,
}

/// One entry on the try-stack: the catch/finally targets a bytecode
/// executor should jump to, and the stack/frame depths to unwind to.
pub struct TryEntry {
    pub catch_addr: Option<usize>,
    pub finally_addr: Option<usize>,
    pub stack_depth: usize,
    pub frame_depth: usize,
    pub defer_depth: usize,
}

pub type DeferAction = Box<dyn FnOnce() + Send>;

/// What actually runs a `Function`'s bytecode body; supplied by whatever
/// owns the compiled program (out of scope here — §1's Non-goals name the
/// bytecode dispatcher body explicitly).
pub trait BytecodeExecutor: Send + Sync {
    fn execute(&self, interp: &mut Interpreter, function: &FunctionData, argc: usize) -> NativeResult;

    /// Runs the operator-definition program `dispatch::DispatchGroup`
    /// resolved to, against the two already-popped operands. Separate
    /// from `execute` because an operator definition isn't necessarily
    /// backed by a `FunctionData` the way an ordinary call is.
    fn execute_operator(&self, interp: &mut Interpreter, program: ProgramRef, lhs: Value, rhs: Value) -> NativeResult;
}

/// Thrown-value unwind signal, distinct from `RuntimeError` because a
/// VM-level `throw` carries an arbitrary `Value`, not a typed error.
#[derive(Debug)]
pub enum Unwind {
    Thrown(Value),
    Error(RuntimeError),
}

impl From<RuntimeError> for Unwind {
    fn from(e: RuntimeError) -> Self {
        Unwind::Error(e)
    }
}

pub type InterpResult<T> = Result<T, Unwind>;

pub struct Interpreter {
    pub operand_stack: Vec<Value>,
    pub frames: Vec<Frame>,
    pub try_stack: Vec<TryEntry>,
    pub defer_stack: Vec<DeferAction>,
    pub classes: Arc<ClassTable>,
    pub operators: Arc<OperatorTable>,
    executor: Option<Arc<dyn BytecodeExecutor>>,
}

impl NativeContext for Interpreter {}

impl Interpreter {
    pub fn new(classes: Arc<ClassTable>, operators: Arc<OperatorTable>) -> Self {
        Self {
            operand_stack: Vec::new(),
            frames: Vec::new(),
            try_stack: Vec::new(),
            defer_stack: Vec::new(),
            classes,
            operators,
            executor: None,
        }
    }

    pub fn set_executor(&mut self, executor: Arc<dyn BytecodeExecutor>) {
        self.executor = Some(executor);
    }

    pub fn push(&mut self, value: Value) {
        self.operand_stack.push(value);
    }

    pub fn pop(&mut self) -> Value {
        self.operand_stack.pop().expect("operand stack underflow")
    }

    pub fn get(&self, i: usize) -> &Value {
        &self.operand_stack[self.operand_stack.len() - 1 - i]
    }

    /// `call(f, argc)`: arranges a frame (for Function) and dispatches by
    /// `f`'s kind. The top `argc` values of the operand stack are the
    /// arguments; the call consumes them and pushes the result.
    pub fn call(&mut self, f: &Value, argc: usize) -> InterpResult<Value> {
        match &f.kind {
            ValueKind::Function(func) => self.call_function(f.clone(), func.clone(), argc, None),
            ValueKind::BuiltinFunction(b) => self.call_builtin_function(b.clone(), argc, None),
            ValueKind::Method(m) => self.call_method_data(m.clone(), argc),
            ValueKind::BuiltinMethod(m) => self.call_builtin_method(m.clone(), argc),
            ValueKind::Operator(op) => self.call_operator(op, argc),
            _ => Err(Unwind::Error(RuntimeError::DispatchError {
                op_or_method: "call".into(),
                class: format!("{:?}", f.kind),
            })),
        }
    }

    /// `call_method(self, m_id, argc)`: inheritance-walk lookup on
    /// `self`'s class, then bind and call.
    pub fn call_method(&mut self, receiver: &Value, class_id: loom_core::ClassId, m_id: InternId, argc: usize) -> InterpResult<Value> {
        let method = self
            .classes
            .lookup(class_id, MemberKind::Method, m_id)
            .ok_or_else(|| Unwind::Error(RuntimeError::DispatchError { op_or_method: "call_method".into(), class: format!("{class_id}") }))?;
        match method.kind {
            ValueKind::Function(func) => self.call_function(method.clone(), func, argc, Some(receiver.clone())),
            ValueKind::BuiltinFunction(b) => self.call_builtin_function(b, argc, Some(receiver.clone())),
            _ => Err(Unwind::Error(RuntimeError::DispatchError { op_or_method: "call_method".into(), class: format!("{class_id}") })),
        }
    }

    /// `eval_function(f, args...)`: pushes `args`, calls `f`, returns the
    /// popped result. A convenience wrapper over `call` for native code
    /// that doesn't already have arguments sitting on the operand stack.
    pub fn eval_function(&mut self, f: &Value, args: &[Value]) -> InterpResult<Value> {
        for a in args {
            self.push(a.clone());
        }
        self.call(f, args.len())
    }

    fn call_function(&mut self, f: Value, func: Arc<FunctionData>, argc: usize, receiver: Option<Value>) -> InterpResult<Value> {
        check_arity(func.arity, argc)?;
        let Some(executor) = self.executor.clone() else {
            return Err(Unwind::Error(RuntimeError::Panic {
                component: "interpreter".into(),
                message: "no bytecode executor installed".into(),
            }));
        };
        let base = self.operand_stack.len() - argc;
        if let Some(recv) = receiver {
            self.operand_stack.insert(base, recv);
        }
        self.frames.push(Frame { function: f, base, return_addr: func.code_offset, caller: self.frames.len().checked_sub(1) });
        let result = executor.execute(self, &func, argc).map_err(Unwind::Error);
        self.frames.pop();
        result
    }

    fn call_builtin_function(&mut self, b: Arc<BuiltinFunctionData>, argc: usize, receiver: Option<Value>) -> InterpResult<Value> {
        check_arity(b.arity, argc)?;
        let args: Vec<Value> = (0..argc).map(|_| self.pop()).collect::<Vec<_>>().into_iter().rev().collect();
        (b.func)(self, &args, receiver.as_ref()).map_err(Unwind::Error)
    }

    fn call_method_data(&mut self, m: Arc<MethodData>, argc: usize) -> InterpResult<Value> {
        match &m.function.kind {
            ValueKind::Function(func) => self.call_function(m.function.clone(), func.clone(), argc, Some(m.receiver.clone())),
            ValueKind::BuiltinFunction(b) => self.call_builtin_function(b.clone(), argc, Some(m.receiver.clone())),
            _ => Err(Unwind::Error(RuntimeError::DispatchError { op_or_method: "call".into(), class: "Method".into() })),
        }
    }

    fn call_builtin_method(&mut self, m: Arc<BuiltinMethodData>, argc: usize) -> InterpResult<Value> {
        let args: Vec<Value> = (0..argc).map(|_| self.pop()).collect::<Vec<_>>().into_iter().rev().collect();
        (m.func)(self, &args, Some(&m.receiver)).map_err(Unwind::Error)
    }

    /// Binary operators only (§4.F): pops the two operands, resolves a
    /// definition by their classes through `OperatorTable`, then hands
    /// the resolved program to the bytecode executor.
    fn call_operator(&mut self, op: &loom_core::OperatorData, argc: usize) -> InterpResult<Value> {
        if argc != 2 {
            return Err(Unwind::Error(RuntimeError::DispatchError { op_or_method: "operator".into(), class: "arity-mismatch".into() }));
        }
        let rhs = self.pop();
        let lhs = self.pop();
        let t1 = self.classes.class_of(&lhs);
        let t2 = self.classes.class_of(&rhs);
        let classes = self.classes.clone();
        let program = self.operators.with_group(op.op_id, |group| group.dispatch(t1, t2, |a, b| classes.is_subclass(a, b)));
        let Some(program) = program else {
            return Err(Unwind::Error(RuntimeError::DispatchError { op_or_method: "operator".into(), class: format!("{t1}:{t2}") }));
        };
        let Some(executor) = self.executor.clone() else {
            return Err(Unwind::Error(RuntimeError::Panic {
                component: "interpreter".into(),
                message: "no bytecode executor installed".into(),
            }));
        };
        executor.execute_operator(self, program, lhs, rhs).map_err(Unwind::Error)
    }

    /// `push_try`: opens a try region, recording where to unwind back to.
    pub fn push_try(&mut self, catch_addr: Option<usize>, finally_addr: Option<usize>) {
        self.try_stack.push(TryEntry {
            catch_addr,
            finally_addr,
            stack_depth: self.operand_stack.len(),
            frame_depth: self.frames.len(),
            defer_depth: self.defer_stack.len(),
        });
    }

    /// `catch`: normal exit from a try region with no throw; discards its
    /// try-stack entry.
    pub fn catch(&mut self) {
        self.try_stack.pop();
    }

    /// `finally`: runs any `defer`s registered since the matching
    /// `push_try`, in LIFO order, regardless of how the region exited.
    pub fn finally(&mut self, since_depth: usize) {
        while self.defer_stack.len() > since_depth {
            let action = self.defer_stack.pop().unwrap();
            action();
        }
    }

    /// `throw(v)`: unwinds through the try-stack, running deferred actions
    /// in LIFO order, until it lands in a catch handler. Returns the
    /// catch target and unwound value, or `None` if the thread should
    /// terminate (uncaught).
    pub fn throw(&mut self, value: Value) -> Option<usize> {
        while let Some(entry) = self.try_stack.pop() {
            self.finally(entry.defer_depth);
            self.operand_stack.truncate(entry.stack_depth);
            self.frames.truncate(entry.frame_depth);
            if let Some(addr) = entry.catch_addr {
                self.operand_stack.push(value);
                return Some(addr);
            }
            if let Some(addr) = entry.finally_addr {
                return Some(addr);
            }
        }
        None
    }

    /// `rethrow`: re-raises the value currently being unwound, used inside
    /// a catch handler that decides not to fully handle it.
    pub fn rethrow(&mut self, value: Value) -> Option<usize> {
        self.throw(value)
    }

    pub fn register_defer(&mut self, action: DeferAction) {
        self.defer_stack.push(action);
    }

    /// Installs `self` as this OS thread's reentry point for FFI closure
    /// trampolines (§4.J) until the returned guard drops. A thread that
    /// runs VM code should hold this for the duration of any call that
    /// might cross into native code and call back through a closure.
    pub fn enter(&mut self) -> EnterGuard {
        let prev = CURRENT.with(|c| c.replace(self as *mut Interpreter));
        EnterGuard(prev)
    }

    /// Runs `f` against the interpreter this OS thread entered, if any.
    /// `None` means a closure was invoked from a thread that never called
    /// `enter` — there is no VM context on this thread to reenter.
    pub fn with_current<R>(f: impl FnOnce(&mut Interpreter) -> R) -> Option<R> {
        let ptr = CURRENT.with(|c| c.get());
        if ptr.is_null() {
            None
        } else {
            Some(f(unsafe { &mut *ptr }))
        }
    }
}

fn check_arity(arity: Arity, argc: usize) -> InterpResult<()> {
    let ok = match arity {
        Arity::Exact(n) => argc == n as usize,
        Arity::AtLeast(n) => argc >= n as usize,
    };
    if ok {
        Ok(())
    } else {
        Err(Unwind::Error(RuntimeError::DispatchError { op_or_method: "call".into(), class: "arity-mismatch".into() }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use loom_core::ItableSlot;

    fn interp() -> Interpreter {
        Interpreter::new(Arc::new(ClassTable::new()), Arc::new(OperatorTable::new()))
    }

    #[test]
    fn push_pop_get_round_trip() {
        let mut i = interp();
        i.push(Value::int(1));
        i.push(Value::int(2));
        assert_eq!(i.get(0).as_int(), Some(2));
        assert_eq!(i.pop().as_int(), Some(2));
        assert_eq!(i.pop().as_int(), Some(1));
    }

    #[test]
    fn calling_a_builtin_function_invokes_it() {
        let mut i = interp();
        let func: loom_core::NativeFn = Arc::new(|_ctx, args, _recv| Ok(Value::int(args[0].as_int().unwrap_or(0) * 2)));
        let b = Arc::new(BuiltinFunctionData { name: 1, arity: Arity::Exact(1), func });
        i.push(Value::int(21));
        let result = i.call(&Value::new(ValueKind::BuiltinFunction(b)), 1).unwrap();
        assert_eq!(result.as_int(), Some(42));
    }

    #[test]
    fn wrong_arity_is_rejected() {
        let mut i = interp();
        let func: loom_core::NativeFn = Arc::new(|_ctx, _args, _recv| Ok(Value::nil()));
        let b = Arc::new(BuiltinFunctionData { name: 1, arity: Arity::Exact(2), func });
        i.push(Value::int(1));
        assert!(i.call(&Value::new(ValueKind::BuiltinFunction(b)), 1).is_err());
    }

    #[test]
    fn throw_unwinds_to_nearest_catch() {
        let mut i = interp();
        i.push_try(Some(99), None);
        let target = i.throw(Value::int(7));
        assert_eq!(target, Some(99));
        assert_eq!(i.pop().as_int(), Some(7));
    }

    #[test]
    fn throw_runs_defers_in_lifo_order_before_landing() {
        let mut i = interp();
        let order = Arc::new(std::sync::Mutex::new(Vec::new()));
        i.push_try(Some(1), None);
        let o1 = order.clone();
        let o2 = order.clone();
        i.register_defer(Box::new(move || o1.lock().unwrap().push(1)));
        i.register_defer(Box::new(move || o2.lock().unwrap().push(2)));
        i.throw(Value::nil());
        assert_eq!(*order.lock().unwrap(), vec![2, 1]);
    }

    #[test]
    fn throw_runs_only_defers_registered_since_the_matching_try() {
        // Operand stack depth and defer-stack depth diverge at push_try time
        // (3 values already pushed, no defers yet); a defer registered
        // *before* the outer push_try must survive the unwind.
        let mut i = interp();
        let order = Arc::new(std::sync::Mutex::new(Vec::new()));
        let o0 = order.clone();
        i.register_defer(Box::new(move || o0.lock().unwrap().push(0)));
        i.push(Value::int(1));
        i.push(Value::int(2));
        i.push(Value::int(3));
        i.push_try(Some(42), None);
        let o1 = order.clone();
        i.register_defer(Box::new(move || o1.lock().unwrap().push(1)));
        let target = i.throw(Value::int(9));
        assert_eq!(target, Some(42));
        // only the defer registered inside the try ran; the pre-existing
        // one is still pending, not executed twice or skipped.
        assert_eq!(*order.lock().unwrap(), vec![1]);
        assert_eq!(i.defer_stack.len(), 1);
    }

    #[test]
    fn uncaught_throw_returns_none() {
        let mut i = interp();
        assert!(i.throw(Value::int(1)).is_none());
    }

    struct AddExecutor;
    impl BytecodeExecutor for AddExecutor {
        fn execute(&self, _interp: &mut Interpreter, _function: &FunctionData, _argc: usize) -> NativeResult {
            Ok(Value::nil())
        }
        fn execute_operator(&self, _interp: &mut Interpreter, _program: crate::dispatch::ProgramRef, lhs: Value, rhs: Value) -> NativeResult {
            Ok(Value::int(lhs.as_int().unwrap_or(0) + rhs.as_int().unwrap_or(0)))
        }
    }

    #[test]
    fn call_operator_resolves_by_operand_class_and_invokes_executor() {
        let mut i = interp();
        i.set_executor(Arc::new(AddExecutor));
        i.operators.with_group(7, |g| g.register(crate::class::INT_CLASS, crate::class::INT_CLASS, 42));
        i.push(Value::int(3));
        i.push(Value::int(4));
        let op = Value::new(ValueKind::Operator(Arc::new(loom_core::OperatorData { op_id: 7 })));
        let result = i.call(&op, 2).unwrap();
        assert_eq!(result.as_int(), Some(7));
    }

    #[test]
    fn call_operator_with_no_matching_definition_is_a_dispatch_error() {
        let mut i = interp();
        i.set_executor(Arc::new(AddExecutor));
        i.push(Value::int(3));
        i.push(Value::int(4));
        let op = Value::new(ValueKind::Operator(Arc::new(loom_core::OperatorData { op_id: 999 })));
        assert!(i.call(&op, 2).is_err());
    }

    #[test]
    fn with_current_sees_nothing_before_enter_and_the_interpreter_after() {
        assert!(Interpreter::with_current(|_| ()).is_none());
        let mut i = interp();
        i.push(Value::int(5));
        let guard = i.enter();
        let top = Interpreter::with_current(|interp| interp.get(0).as_int());
        assert_eq!(top, Some(Some(5)));
        drop(guard);
        assert!(Interpreter::with_current(|_| ()).is_none());
    }

    #[test]
    fn call_method_walks_inheritance() {
        let mut i = interp();
        let base = i.classes.class_new(1, false, None);
        let func: loom_core::NativeFn = Arc::new(|_ctx, _args, recv| Ok(recv.cloned().unwrap_or(Value::nil())));
        let b = Arc::new(BuiltinFunctionData { name: 5, arity: Arity::Exact(0), func });
        i.classes.define(base, MemberKind::Method, 5, ItableSlot::Direct(Value::new(ValueKind::BuiltinFunction(b))));
        let derived = i.classes.class_new(2, false, Some(base));
        let receiver = Value::int(9);
        let result = i.call_method(&receiver, derived, 5, 0).unwrap();
        assert_eq!(result.as_int(), Some(9));
    }
}
