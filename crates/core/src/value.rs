//! The `Value` tagged variant and its tag stack (§3.1, §3.6).
//!
//! Heap-backed variants wrap their payload in `Arc` so that cloning a
//! `Value` is always O(1) and aliasing (two `Value`s pointing at the same
//! array) is the normal case, matching the reference semantics the
//! dispatcher and collector assume. Mutable payloads (`Array`, `Dict`,
//! `Blob`, `RefCell`) additionally wrap in a `Mutex` since a `Value` sent
//! through a message queue moves to a different OS thread.

use crate::intern::InternId;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};

pub type ClassId = u32;
pub type TagId = InternId;

/// An id into a `TagSpineTable`, naming an immutable linked-list spine of
/// pushed tags. `None` means "no tags pushed" (the base value only).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TagSpineId(u32);

/// A value's independent tag stack: `Some x`, `Ok x`, and similar
/// user-defined sum constructors are a base `Value` plus a `TagStack`.
///
/// Stored as an id rather than an inline `Vec<TagId>` so that pushing and
/// popping are O(1) and two values with the same tag sequence compare
/// equal by a single integer comparison (§3.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct TagStack(Option<TagSpineId>);

impl TagStack {
    pub fn empty() -> Self {
        TagStack(None)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_none()
    }
}

struct SpineNode {
    tag: TagId,
    parent: Option<TagSpineId>,
}

/// Backing store for every `TagStack` in one interpreter: a trie of
/// (parent, tag) edges, so that `push`ing the same tag onto the same
/// parent spine from two unrelated call sites yields the same spine id.
#[derive(Default)]
pub struct TagSpineTable {
    nodes: Vec<SpineNode>,
    index: HashMap<(Option<TagSpineId>, TagId), TagSpineId>,
}

impl TagSpineTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// `tags_push`: O(1) amortized.
    pub fn push(&mut self, stack: TagStack, tag: TagId) -> TagStack {
        let key = (stack.0, tag);
        if let Some(&id) = self.index.get(&key) {
            return TagStack(Some(id));
        }
        let id = TagSpineId(self.nodes.len() as u32);
        self.nodes.push(SpineNode { tag, parent: stack.0 });
        self.index.insert(key, id);
        TagStack(Some(id))
    }

    /// `tags_pop`: returns the popped tag and the stack with it removed.
    /// Popping an empty stack leaves it untagged and returns `None`.
    pub fn pop(&self, stack: TagStack) -> (Option<TagId>, TagStack) {
        match stack.0 {
            None => (None, stack),
            Some(id) => {
                let node = &self.nodes[id.0 as usize];
                (Some(node.tag), TagStack(node.parent))
            }
        }
    }

    pub fn top(&self, stack: TagStack) -> Option<TagId> {
        stack.0.map(|id| self.nodes[id.0 as usize].tag)
    }

    /// Tags from outermost (most recently pushed) to innermost (base-adjacent).
    pub fn to_vec(&self, stack: TagStack) -> Vec<TagId> {
        let mut out = Vec::new();
        let mut cur = stack.0;
        while let Some(id) = cur {
            let node = &self.nodes[id.0 as usize];
            out.push(node.tag);
            cur = node.parent;
        }
        out
    }
}

/// An itable slot: either a direct value, or a mutable `Ref` cell used by
/// the compiler for redefinable statics. Looking a slot up transparently
/// dereferences a non-empty `Ref` and returns absent for an empty one.
#[derive(Debug, Clone)]
pub enum ItableSlot {
    Direct(Value),
    Ref(Arc<Mutex<Option<Value>>>),
}

#[derive(Debug)]
pub struct ObjectData {
    pub class: ClassId,
    pub itable: Mutex<HashMap<InternId, ItableSlot>>,
}

impl PartialEq for ObjectData {
    fn eq(&self, other: &Self) -> bool {
        std::ptr::eq(self, other)
    }
}

#[derive(Debug)]
pub struct TupleData {
    pub items: Vec<Value>,
    /// Present iff the tuple has named fields; `None` entries are unnamed
    /// positions (the `-1` sentinel of the original layout, §3.1).
    pub field_ids: Option<Vec<Option<InternId>>>,
}

impl PartialEq for TupleData {
    fn eq(&self, other: &Self) -> bool {
        std::ptr::eq(self, other)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arity {
    Exact(u16),
    AtLeast(u16),
}

#[derive(Debug)]
pub struct FunctionData {
    pub code_offset: usize,
    pub arity: Arity,
    pub name: Option<InternId>,
    pub class_owner: Option<ClassId>,
    pub proto: Option<String>,
    pub doc: Option<String>,
    pub upvalues: Vec<Value>,
}

impl PartialEq for FunctionData {
    fn eq(&self, other: &Self) -> bool {
        std::ptr::eq(self, other)
    }
}

/// Context handed to a native implementation. Concrete interpreter state
/// (`Ty`) lives in `loom-runtime`; this crate only needs a trait object so
/// `Value` doesn't depend upward on the crate that defines `Ty`.
pub trait NativeContext: std::any::Any {}

pub type NativeResult = Result<Value, crate::error::RuntimeError>;
pub type NativeFn =
    Arc<dyn Fn(&mut dyn NativeContext, &[Value], Option<&Value>) -> NativeResult + Send + Sync>;

/// A built-in receiver method or free function, called per the
/// `fn(ty, self, argc, kwargs) -> Value` convention (§6.2), generalized to
/// a Rust closure returning `Result` instead of signaling errors through
/// the thread-local error slot.
#[derive(Clone)]
pub struct BuiltinFunctionData {
    pub name: InternId,
    pub arity: Arity,
    pub func: NativeFn,
}

impl fmt::Debug for BuiltinFunctionData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BuiltinFunctionData").field("name", &self.name).finish_non_exhaustive()
    }
}

impl PartialEq for BuiltinFunctionData {
    fn eq(&self, other: &Self) -> bool {
        std::ptr::eq(self, other)
    }
}

#[derive(Debug, PartialEq)]
pub struct MethodData {
    pub receiver: Value,
    pub function: Value,
}

#[derive(Clone)]
pub struct BuiltinMethodData {
    pub receiver: Value,
    pub name: InternId,
    pub func: NativeFn,
}

impl fmt::Debug for BuiltinMethodData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BuiltinMethodData").field("name", &self.name).finish_non_exhaustive()
    }
}

impl PartialEq for BuiltinMethodData {
    fn eq(&self, other: &Self) -> bool {
        std::ptr::eq(self, other)
    }
}

/// Opaque handle to a generator's coroutine state; the fields the
/// collector needs to traverse (§4.D) live behind this trait so this
/// crate doesn't depend on `may::coroutine`.
pub trait GeneratorHandle: std::fmt::Debug + Send + Sync {
    fn is_done(&self) -> bool;

    /// Invoked by the collector when it determines this generator
    /// unreachable while still suspended: runs any recorded drop-stack
    /// actions. A no-op default since not every implementor suspends
    /// with pending cleanup.
    fn on_collected(&self) {}
}

/// Opaque handle to an OS thread's message queue and liveness flags; the
/// OS handle and `Ty` context live in `loom-runtime::thread`.
pub trait ThreadHandle: std::fmt::Debug + Send + Sync {
    fn is_alive(&self) -> bool;
}

#[derive(Debug)]
pub struct RegexData {
    pub pattern: regex::Regex,
    pub source: String,
    pub detailed: bool,
}

impl PartialEq for RegexData {
    fn eq(&self, other: &Self) -> bool {
        std::ptr::eq(self, other)
    }
}

/// A raw pointer plus an optional FFI type-descriptor id used to check
/// pointer arithmetic and subtraction compatibility (§3.1, §4.J).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PtrData {
    pub addr: usize,
    pub extra: Option<InternId>,
}

#[derive(Debug)]
pub struct OperatorData {
    pub op_id: InternId,
}

impl PartialEq for OperatorData {
    fn eq(&self, other: &Self) -> bool {
        std::ptr::eq(self, other)
    }
}

/// Open-addressed-by-hash dictionary: entries live in insertion-ordered
/// storage, with a hash-bucketed index for O(1) average lookup. Keys
/// compare with value equality (§4.B), not Rust's `Hash`/`Eq`, since deep
/// equality needs a cycle-breaking visiting set that those traits can't
/// thread through.
#[derive(Debug, Default)]
pub struct DictData {
    pub entries: Vec<(Value, Value)>,
    buckets: HashMap<u64, Vec<usize>>,
    /// Callable producing a default value for a missing key, if any.
    pub default: Option<Value>,
}

impl DictData {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &Value) -> Option<&Value> {
        let h = crate::value::ops::hash(key);
        let bucket = self.buckets.get(&h)?;
        bucket
            .iter()
            .find(|&&i| crate::value::ops::eq(&self.entries[i].0, key))
            .map(|&i| &self.entries[i].1)
    }

    pub fn insert(&mut self, key: Value, value: Value) -> Option<Value> {
        let h = crate::value::ops::hash(&key);
        let bucket = self.buckets.entry(h).or_default();
        if let Some(&i) = bucket.iter().find(|&&i| crate::value::ops::eq(&self.entries[i].0, &key)) {
            let old = std::mem::replace(&mut self.entries[i].1, value);
            return Some(old);
        }
        let idx = self.entries.len();
        self.entries.push((key, value));
        self.buckets.entry(h).or_default().push(idx);
        None
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl PartialEq for DictData {
    fn eq(&self, other: &Self) -> bool {
        std::ptr::eq(self, other)
    }
}

#[derive(Clone)]
pub enum ValueKind {
    Nil,
    None,
    Int(i64),
    Float(f64),
    Bool(bool),
    String(Arc<str>),
    Array(Arc<Mutex<Vec<Value>>>),
    Dict(Arc<Mutex<DictData>>),
    Blob(Arc<Mutex<Vec<u8>>>),
    Tuple(Arc<TupleData>),
    Object(Arc<ObjectData>),
    Class(ClassId),
    Tag(TagId),
    Function(Arc<FunctionData>),
    BuiltinFunction(Arc<BuiltinFunctionData>),
    Method(Arc<MethodData>),
    BuiltinMethod(Arc<BuiltinMethodData>),
    Generator(Arc<dyn GeneratorHandle>),
    Thread(Arc<dyn ThreadHandle>),
    Regex(Arc<RegexData>),
    Ptr(PtrData),
    Operator(Arc<OperatorData>),
    RefCell(Arc<Mutex<Option<Value>>>),
}

// `dyn GeneratorHandle`/`dyn ThreadHandle` don't get a `Debug` impl for
// free just from naming `Debug` as a supertrait, so `ValueKind` can't
// derive `Debug` — those two arms print a fixed placeholder instead.
impl fmt::Debug for ValueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValueKind::Nil => write!(f, "Nil"),
            ValueKind::None => write!(f, "None"),
            ValueKind::Int(i) => write!(f, "Int({i})"),
            ValueKind::Float(x) => write!(f, "Float({x})"),
            ValueKind::Bool(b) => write!(f, "Bool({b})"),
            ValueKind::String(s) => write!(f, "String({s:?})"),
            ValueKind::Array(_) => write!(f, "Array(..)"),
            ValueKind::Dict(_) => write!(f, "Dict(..)"),
            ValueKind::Blob(_) => write!(f, "Blob(..)"),
            ValueKind::Tuple(t) => write!(f, "Tuple({:?})", t.items),
            ValueKind::Object(o) => write!(f, "Object(class={})", o.class),
            ValueKind::Class(c) => write!(f, "Class({c})"),
            ValueKind::Tag(t) => write!(f, "Tag({t})"),
            ValueKind::Function(_) => write!(f, "Function(..)"),
            ValueKind::BuiltinFunction(func) => write!(f, "BuiltinFunction({:?})", func.name),
            ValueKind::Method(_) => write!(f, "Method(..)"),
            ValueKind::BuiltinMethod(_) => write!(f, "BuiltinMethod(..)"),
            ValueKind::Generator(_) => write!(f, "Generator(..)"),
            ValueKind::Thread(_) => write!(f, "Thread(..)"),
            ValueKind::Regex(r) => write!(f, "Regex({:?})", r.source),
            ValueKind::Ptr(p) => write!(f, "Ptr({p:?})"),
            ValueKind::Operator(o) => write!(f, "Operator({})", o.op_id),
            ValueKind::RefCell(_) => write!(f, "RefCell(..)"),
        }
    }
}

/// A runtime value: a base variant plus an independently-tracked tag
/// stack (§3.1). Cloning is always O(1): heap payloads are `Arc`-shared.
#[derive(Clone)]
pub struct Value {
    pub kind: ValueKind,
    pub tags: TagStack,
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Value").field("kind", &self.kind).field("tags", &self.tags).finish()
    }
}

impl Value {
    pub fn new(kind: ValueKind) -> Self {
        Self { kind, tags: TagStack::empty() }
    }

    pub fn nil() -> Self {
        Self::new(ValueKind::Nil)
    }

    pub fn int(v: i64) -> Self {
        Self::new(ValueKind::Int(v))
    }

    pub fn float(v: f64) -> Self {
        Self::new(ValueKind::Float(v))
    }

    pub fn bool(v: bool) -> Self {
        Self::new(ValueKind::Bool(v))
    }

    pub fn string(v: impl Into<Arc<str>>) -> Self {
        Self::new(ValueKind::String(v.into()))
    }

    pub fn with_tags(kind: ValueKind, tags: TagStack) -> Self {
        Self { kind, tags }
    }

    /// Pushes `tag` onto this value's tag stack, producing a new tagged
    /// value over the same base (`Some x`, `Ok x`, ...).
    pub fn tagged(&self, table: &mut TagSpineTable, tag: TagId) -> Value {
        Value { kind: self.kind.clone(), tags: table.push(self.tags, tag) }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self.kind {
            ValueKind::Int(i) => Some(i),
            _ => None,
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        ops::eq(self, other)
    }
}

pub mod ops {
    //! Value operations (§4.B): hash, deep equality, ordering, truthiness,
    //! and pretty-printing. Kept free-standing rather than as inherent
    //! methods so equality/hash can thread a cycle-breaking visiting set
    //! that `std::hash::Hash`/`Eq` have no room for.

    use super::*;
    use std::cmp::Ordering;
    use std::hash::{Hash, Hasher};

    /// Consistent with `eq`: two values that compare equal hash equal.
    pub fn hash(v: &Value) -> u64 {
        let mut h = std::collections::hash_map::DefaultHasher::new();
        hash_into(v, &mut h);
        v.tags.0.hash(&mut h);
        h.finish()
    }

    fn hash_into(v: &Value, h: &mut impl Hasher) {
        std::mem::discriminant(&v.kind).hash(h);
        match &v.kind {
            ValueKind::Nil | ValueKind::None => {}
            ValueKind::Int(i) => i.hash(h),
            ValueKind::Float(f) => f.to_bits().hash(h),
            ValueKind::Bool(b) => b.hash(h),
            ValueKind::String(s) => s.hash(h),
            ValueKind::Class(c) => c.hash(h),
            ValueKind::Tag(t) => t.hash(h),
            ValueKind::Ptr(p) => {
                p.addr.hash(h);
                p.extra.hash(h);
            }
            ValueKind::Array(a) => {
                let a = a.lock().expect("array lock poisoned");
                for item in a.iter() {
                    hash_into(item, h);
                }
            }
            ValueKind::Blob(b) => b.lock().expect("blob lock poisoned").hash(h),
            ValueKind::Tuple(t) => {
                for item in &t.items {
                    hash_into(item, h);
                }
            }
            // Remaining kinds (Dict, Object, Function, Generator, Thread,
            // Regex, Operator, RefCell, *Method) hash by identity: they
            // are reference types without a natural value hash.
            _ => identity_addr(v).hash(h),
        }
    }

    fn identity_addr(v: &Value) -> usize {
        match &v.kind {
            ValueKind::Dict(d) => Arc::as_ptr(d) as usize,
            ValueKind::Object(o) => Arc::as_ptr(o) as usize,
            ValueKind::Function(f) => Arc::as_ptr(f) as usize,
            ValueKind::BuiltinFunction(f) => Arc::as_ptr(f) as usize,
            ValueKind::Method(m) => Arc::as_ptr(m) as usize,
            ValueKind::BuiltinMethod(m) => Arc::as_ptr(m) as usize,
            ValueKind::Generator(g) => Arc::as_ptr(g) as *const () as usize,
            ValueKind::Thread(t) => Arc::as_ptr(t) as *const () as usize,
            ValueKind::Regex(r) => Arc::as_ptr(r) as usize,
            ValueKind::Operator(o) => Arc::as_ptr(o) as usize,
            ValueKind::RefCell(r) => Arc::as_ptr(r) as usize,
            _ => 0,
        }
    }

    /// Deep equality with a visiting set to break cycles in self-referential
    /// arrays/dicts/objects: a value reached twice along the same path is
    /// treated as equal to itself without recursing further.
    pub fn eq(a: &Value, b: &Value) -> bool {
        let mut visiting = Vec::new();
        eq_inner(a, b, &mut visiting)
    }

    /// Order-independent so a mutual cycle (x holds y, y holds x) is
    /// recognized regardless of which order the recursive comparison
    /// visits the pair in.
    fn sorted_pair(a: usize, b: usize) -> (usize, usize) {
        if a <= b { (a, b) } else { (b, a) }
    }

    fn ptr_pair(a: &Value, b: &Value) -> Option<(usize, usize)> {
        let pa = identity_addr(a);
        let pb = identity_addr(b);
        if pa == 0 && pb == 0 {
            None
        } else {
            Some((pa, pb))
        }
    }

    fn eq_inner(a: &Value, b: &Value, visiting: &mut Vec<(usize, usize)>) -> bool {
        if a.tags != b.tags {
            return false;
        }
        match (&a.kind, &b.kind) {
            (ValueKind::Nil, ValueKind::Nil) => true,
            (ValueKind::None, ValueKind::None) => true,
            (ValueKind::Int(x), ValueKind::Int(y)) => x == y,
            (ValueKind::Float(x), ValueKind::Float(y)) => x == y,
            (ValueKind::Int(x), ValueKind::Float(y)) | (ValueKind::Float(y), ValueKind::Int(x)) => {
                *x as f64 == *y
            }
            (ValueKind::Bool(x), ValueKind::Bool(y)) => x == y,
            (ValueKind::String(x), ValueKind::String(y)) => x == y,
            (ValueKind::Class(x), ValueKind::Class(y)) => x == y,
            (ValueKind::Tag(x), ValueKind::Tag(y)) => x == y,
            (ValueKind::Ptr(x), ValueKind::Ptr(y)) => x == y,
            (ValueKind::Array(x), ValueKind::Array(y)) => {
                if Arc::ptr_eq(x, y) {
                    return true;
                }
                let key = sorted_pair(Arc::as_ptr(x) as usize, Arc::as_ptr(y) as usize);
                if visiting.contains(&key) {
                    return true;
                }
                visiting.push(key);
                let (xs, ys) = (x.lock().expect("array lock poisoned"), y.lock().expect("array lock poisoned"));
                let result = xs.len() == ys.len() && xs.iter().zip(ys.iter()).all(|(i, j)| eq_inner(i, j, visiting));
                visiting.pop();
                result
            }
            (ValueKind::Blob(x), ValueKind::Blob(y)) => {
                *x.lock().expect("blob lock poisoned") == *y.lock().expect("blob lock poisoned")
            }
            (ValueKind::Tuple(x), ValueKind::Tuple(y)) => {
                if Arc::ptr_eq(x, y) {
                    return true;
                }
                x.items.len() == y.items.len()
                    && x.items.iter().zip(y.items.iter()).all(|(i, j)| eq_inner(i, j, visiting))
            }
            (ValueKind::Dict(x), ValueKind::Dict(y)) => {
                if Arc::ptr_eq(x, y) {
                    return true;
                }
                let key = sorted_pair(Arc::as_ptr(x) as usize, Arc::as_ptr(y) as usize);
                if visiting.contains(&key) {
                    return true;
                }
                visiting.push(key);
                let (xs, ys) = (x.lock().expect("dict lock poisoned"), y.lock().expect("dict lock poisoned"));
                let result = xs.len() == ys.len()
                    && xs.entries.iter().all(|(k, v)| ys.get(k).is_some_and(|v2| eq_inner(v, v2, visiting)));
                visiting.pop();
                result
            }
            // Every other pairing (including cross-kind pairs not listed
            // above, and reference types) falls back to identity.
            _ => ptr_pair(a, b).is_some_and(|(pa, pb)| pa == pb),
        }
    }

    /// Total ordering within one kind; `None` for pairs the language
    /// doesn't define an order over.
    pub fn compare(a: &Value, b: &Value) -> Option<Ordering> {
        match (&a.kind, &b.kind) {
            (ValueKind::Int(x), ValueKind::Int(y)) => Some(x.cmp(y)),
            (ValueKind::Float(x), ValueKind::Float(y)) => x.partial_cmp(y),
            (ValueKind::Int(x), ValueKind::Float(y)) => (*x as f64).partial_cmp(y),
            (ValueKind::Float(x), ValueKind::Int(y)) => x.partial_cmp(&(*y as f64)),
            (ValueKind::String(x), ValueKind::String(y)) => Some(x.as_ref().cmp(y.as_ref())),
            (ValueKind::Bool(x), ValueKind::Bool(y)) => Some(x.cmp(y)),
            _ => None,
        }
    }

    /// Nil, False, zero, and empty collections are falsy; everything else
    /// is truthy.
    pub fn truthy(v: &Value) -> bool {
        match &v.kind {
            ValueKind::Nil | ValueKind::None => false,
            ValueKind::Bool(b) => *b,
            ValueKind::Int(i) => *i != 0,
            ValueKind::Float(f) => *f != 0.0,
            ValueKind::String(s) => !s.is_empty(),
            ValueKind::Array(a) => !a.lock().expect("array lock poisoned").is_empty(),
            ValueKind::Dict(d) => !d.lock().expect("dict lock poisoned").is_empty(),
            ValueKind::Blob(b) => !b.lock().expect("blob lock poisoned").is_empty(),
            ValueKind::Tuple(t) => !t.items.is_empty(),
            _ => true,
        }
    }

    /// Cycle-safe `show`: arrays/dicts/objects that contain themselves
    /// print `[...]`/`{...}` at the repeat instead of recursing forever.
    pub fn show(v: &Value) -> String {
        let mut out = String::new();
        let mut visiting = Vec::new();
        show_into(v, &mut out, &mut visiting);
        out
    }

    fn show_into(v: &Value, out: &mut String, visiting: &mut Vec<usize>) {
        match &v.kind {
            ValueKind::Nil => out.push_str("nil"),
            ValueKind::None => out.push_str("None"),
            ValueKind::Int(i) => out.push_str(&i.to_string()),
            ValueKind::Float(f) => out.push_str(&f.to_string()),
            ValueKind::Bool(b) => out.push_str(&b.to_string()),
            ValueKind::String(s) => {
                out.push('"');
                out.push_str(s);
                out.push('"');
            }
            ValueKind::Array(a) => {
                let addr = Arc::as_ptr(a) as usize;
                if visiting.contains(&addr) {
                    out.push_str("[...]");
                    return;
                }
                visiting.push(addr);
                out.push('[');
                for (i, item) in a.lock().expect("array lock poisoned").iter().enumerate() {
                    if i > 0 {
                        out.push_str(", ");
                    }
                    show_into(item, out, visiting);
                }
                out.push(']');
                visiting.pop();
            }
            ValueKind::Dict(d) => {
                let addr = Arc::as_ptr(d) as usize;
                if visiting.contains(&addr) {
                    out.push_str("{...}");
                    return;
                }
                visiting.push(addr);
                out.push('{');
                for (i, (k, val)) in d.lock().expect("dict lock poisoned").entries.iter().enumerate() {
                    if i > 0 {
                        out.push_str(", ");
                    }
                    show_into(k, out, visiting);
                    out.push_str(": ");
                    show_into(val, out, visiting);
                }
                out.push('}');
                visiting.pop();
            }
            ValueKind::Tuple(t) => {
                out.push('(');
                for (i, item) in t.items.iter().enumerate() {
                    if i > 0 {
                        out.push_str(", ");
                    }
                    show_into(item, out, visiting);
                }
                out.push(')');
            }
            ValueKind::Class(c) => out.push_str(&format!("<class {c}>")),
            ValueKind::Tag(t) => out.push_str(&format!("<tag {t}>")),
            ValueKind::Ptr(p) => out.push_str(&format!("<ptr {:#x}>", p.addr)),
            _ => out.push_str("<opaque>"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tag_push_pop_round_trips() {
        let mut table = TagSpineTable::new();
        let base = Value::int(5);
        let tagged = base.tagged(&mut table, 42);
        assert!(!tagged.tags.is_empty());
        let (popped, stack) = table.pop(tagged.tags);
        assert_eq!(popped, Some(42));
        assert!(stack.is_empty());
    }

    #[test]
    fn pushing_same_tag_sequence_twice_yields_same_spine() {
        let mut table = TagSpineTable::new();
        let a = table.push(TagStack::empty(), 1);
        let a2 = table.push(TagStack::empty(), 1);
        assert_eq!(a, a2);
    }

    #[test]
    fn eq_treats_tagged_values_as_distinct_from_base() {
        let mut table = TagSpineTable::new();
        let base = Value::int(1);
        let tagged = base.tagged(&mut table, 7);
        assert_ne!(base, tagged);
    }

    #[test]
    fn truthiness_matches_spec() {
        assert!(!ops::truthy(&Value::nil()));
        assert!(!ops::truthy(&Value::int(0)));
        assert!(ops::truthy(&Value::int(1)));
        assert!(!ops::truthy(&Value::bool(false)));
        assert!(ops::truthy(&Value::string("x")));
        assert!(!ops::truthy(&Value::string("")));
    }

    #[test]
    fn hash_is_consistent_with_eq_for_ints() {
        let a = Value::int(9);
        let b = Value::int(9);
        assert_eq!(a, b);
        assert_eq!(ops::hash(&a), ops::hash(&b));
    }

    #[test]
    fn int_and_float_compare_across_kinds() {
        let i = Value::int(3);
        let f = Value::float(3.0);
        assert_eq!(ops::compare(&i, &f), Some(std::cmp::Ordering::Equal));
        assert!(ops::eq(&i, &f));
    }

    #[test]
    fn dict_insert_get_round_trip() {
        let mut d = DictData::new();
        assert!(d.insert(Value::string("k"), Value::int(1)).is_none());
        assert_eq!(d.get(&Value::string("k")), Some(&Value::int(1)));
        assert_eq!(d.insert(Value::string("k"), Value::int(2)), Some(Value::int(1)));
        assert_eq!(d.get(&Value::string("k")), Some(&Value::int(2)));
    }

    #[test]
    fn cyclic_array_eq_does_not_stack_overflow() {
        let a = Arc::new(Mutex::new(vec![Value::int(1)]));
        let va = Value::new(ValueKind::Array(a.clone()));
        a.lock().expect("array lock poisoned").push(va.clone());
        assert!(ops::eq(&va, &va));
    }

    #[test]
    fn cyclic_array_show_terminates() {
        let a = Arc::new(Mutex::new(Vec::new()));
        let va = Value::new(ValueKind::Array(a.clone()));
        a.lock().expect("array lock poisoned").push(va.clone());
        let s = ops::show(&va);
        assert!(s.contains("..."));
    }
}
