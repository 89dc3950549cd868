//! Class table: itables, single-superclass + multi-trait linkage, and the
//! `impls` bitmap used for O(1) subtype queries (§3.3, §4.E).

use loom_core::{ClassId, InternId, ItableSlot, Value, ValueKind};
use std::collections::HashMap;
use std::sync::{Mutex, RwLock};

/// Fixed class ids for primitive kinds, reserved below `class_new`'s
/// starting id of 1 so a freshly created `ClassTable` never collides
/// with them. Operator dispatch and the native method tables (§4.L)
/// both need a `ClassId` for values that aren't `Object`s.
pub const NIL_CLASS: ClassId = 0;
pub const BOOL_CLASS: ClassId = 1001;
pub const INT_CLASS: ClassId = 1002;
pub const FLOAT_CLASS: ClassId = 1003;
pub const STRING_CLASS: ClassId = 1004;
pub const ARRAY_CLASS: ClassId = 1005;
pub const DICT_CLASS: ClassId = 1006;
pub const TUPLE_CLASS: ClassId = 1007;
pub const BLOB_CLASS: ClassId = 1008;

#[derive(Debug, Default, Clone)]
pub struct Itable {
    slots: HashMap<InternId, ItableSlot>,
}

impl Itable {
    pub fn define(&mut self, id: InternId, slot: ItableSlot) {
        self.slots.insert(id, slot);
    }

    pub fn has_own(&self, id: InternId) -> bool {
        self.slots.contains_key(&id)
    }

    /// Look up a slot, transparently dereferencing a `Ref` cell. A `Ref`
    /// holding `None` (a zero ref) is reported as absent, same as no slot
    /// at all.
    pub fn get(&self, id: InternId) -> Option<Value> {
        match self.slots.get(&id)? {
            ItableSlot::Direct(v) => Some(v.clone()),
            ItableSlot::Ref(cell) => cell.lock().expect("ref cell lock poisoned").clone(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct FieldDescriptor {
    pub default: Option<Value>,
}

pub struct Class {
    pub id: ClassId,
    pub type_checker_id: InternId,
    pub is_trait: bool,
    pub is_final: bool,
    pub is_really_final: bool,
    pub super_class: Option<ClassId>,
    pub traits: Vec<ClassId>,
    /// Bitset over transitive ancestors/traits, indexed by class id;
    /// `is_subclass(a, b)` is `a.impls[b]` in O(1).
    impls: Vec<u64>,
    pub methods: Itable,
    pub setters: Itable,
    pub getters: Itable,
    pub statics: Itable,
    pub fields: Mutex<HashMap<InternId, FieldDescriptor>>,
    pub finalizer: Option<Value>,
}

impl Class {
    fn bit_set(bits: &mut Vec<u64>, id: ClassId) {
        let word = id as usize / 64;
        if bits.len() <= word {
            bits.resize(word + 1, 0);
        }
        bits[word] |= 1u64 << (id as usize % 64);
    }

    fn bit_get(bits: &[u64], id: ClassId) -> bool {
        let word = id as usize / 64;
        bits.get(word).is_some_and(|w| w & (1u64 << (id as usize % 64)) != 0)
    }

    pub fn is_subclass_bit(&self, ancestor: ClassId) -> bool {
        ancestor == self.id || Self::bit_get(&self.impls, ancestor)
    }

    fn record_ancestor(&mut self, ancestor: ClassId) {
        Self::bit_set(&mut self.impls, ancestor);
    }
}

/// The process-wide class table. `class_new` assigns an id, allocates
/// itables, and records super/traits; subtype bits are computed at
/// creation/trait-implementation time so queries afterward are O(1).
pub struct ClassTable {
    classes: RwLock<HashMap<ClassId, Class>>,
    next_id: std::sync::atomic::AtomicU32,
}

impl Default for ClassTable {
    fn default() -> Self {
        Self::new()
    }
}

impl ClassTable {
    pub fn new() -> Self {
        Self { classes: RwLock::new(HashMap::new()), next_id: std::sync::atomic::AtomicU32::new(1) }
    }

    pub fn class_new(&self, type_checker_id: InternId, is_trait: bool, super_class: Option<ClassId>) -> ClassId {
        let id = self.next_id.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        let mut ancestors = Vec::new();
        if let Some(super_id) = super_class {
            let classes = self.classes.read().expect("class table lock poisoned");
            if let Some(super_class) = classes.get(&super_id) {
                ancestors.push(super_id);
                for (i, word) in super_class.impls.iter().enumerate() {
                    for bit in 0..64u32 {
                        if word & (1u64 << bit) != 0 {
                            ancestors.push(i as u32 * 64 + bit);
                        }
                    }
                }
            }
        }
        let mut class = Class {
            id,
            type_checker_id,
            is_trait,
            is_final: false,
            is_really_final: false,
            super_class,
            traits: Vec::new(),
            impls: Vec::new(),
            methods: Itable::default(),
            setters: Itable::default(),
            getters: Itable::default(),
            statics: Itable::default(),
            fields: Mutex::new(HashMap::new()),
            finalizer: None,
        };
        for a in ancestors {
            class.record_ancestor(a);
        }
        self.classes.write().expect("class table lock poisoned").insert(id, class);
        id
    }

    /// `class_implement_trait`: copy the trait's method/getter/setter
    /// slots into the implementing class unless it already defines that
    /// id, and mark the trait (and its own transitive ancestry) in the
    /// implementing class's `impls` bitmap.
    pub fn implement_trait(&self, class_id: ClassId, trait_id: ClassId) {
        let mut classes = self.classes.write().expect("class table lock poisoned");
        let trait_snapshot = classes.get(&trait_id).map(|t| {
            (
                t.methods.slots.clone(),
                t.getters.slots.clone(),
                t.setters.slots.clone(),
                t.impls.clone(),
            )
        });
        let Some((methods, getters, setters, trait_impls)) = trait_snapshot else { return };
        if let Some(class) = classes.get_mut(&class_id) {
            for (id, slot) in methods {
                if !class.methods.has_own(id) {
                    class.methods.define(id, slot);
                }
            }
            for (id, slot) in getters {
                if !class.getters.has_own(id) {
                    class.getters.define(id, slot);
                }
            }
            for (id, slot) in setters {
                if !class.setters.has_own(id) {
                    class.setters.define(id, slot);
                }
            }
            class.traits.push(trait_id);
            class.record_ancestor(trait_id);
            for (i, word) in trait_impls.iter().enumerate() {
                for bit in 0..64u32 {
                    if word & (1u64 << bit) != 0 {
                        class.record_ancestor(i as u32 * 64 + bit);
                    }
                }
            }
        }
    }

    pub fn is_subclass(&self, a: ClassId, b: ClassId) -> bool {
        self.classes.read().expect("class table lock poisoned").get(&a).is_some_and(|c| c.is_subclass_bit(b))
    }

    /// Maps a `Value` to the `ClassId` operator/method dispatch should
    /// use: an `Object`'s own class, or one of the reserved primitive
    /// ids for everything else.
    pub fn class_of(&self, value: &Value) -> ClassId {
        match &value.kind {
            ValueKind::Object(obj) => obj.class,
            ValueKind::Nil | ValueKind::None => NIL_CLASS,
            ValueKind::Bool(_) => BOOL_CLASS,
            ValueKind::Int(_) => INT_CLASS,
            ValueKind::Float(_) => FLOAT_CLASS,
            ValueKind::String(_) => STRING_CLASS,
            ValueKind::Array(_) => ARRAY_CLASS,
            ValueKind::Dict(_) => DICT_CLASS,
            ValueKind::Tuple(_) => TUPLE_CLASS,
            ValueKind::Blob(_) => BLOB_CLASS,
            _ => NIL_CLASS,
        }
    }

    /// Member-id lookup, walking `self` then `super` (and whatever the
    /// trait copy already folded in). `kind` selects which of the four
    /// itables to search.
    pub fn lookup(&self, class_id: ClassId, kind: MemberKind, id: InternId) -> Option<Value> {
        let classes = self.classes.read().expect("class table lock poisoned");
        let mut cur = Some(class_id);
        while let Some(cid) = cur {
            let class = classes.get(&cid)?;
            let table = match kind {
                MemberKind::Method => &class.methods,
                MemberKind::Getter => &class.getters,
                MemberKind::Setter => &class.setters,
                MemberKind::Static => &class.statics,
            };
            if let Some(v) = table.get(id) {
                return Some(v);
            }
            cur = class.super_class;
        }
        None
    }

    /// Member lookup restricted to slots defined directly on `class_id`,
    /// not inherited — distinguished from `lookup` because trait
    /// composition upstream needs to know "defined here" vs. "found via
    /// the inheritance walk".
    pub fn lookup_immediate(&self, class_id: ClassId, kind: MemberKind, id: InternId) -> Option<Value> {
        let classes = self.classes.read().expect("class table lock poisoned");
        let class = classes.get(&class_id)?;
        let table = match kind {
            MemberKind::Method => &class.methods,
            MemberKind::Getter => &class.getters,
            MemberKind::Setter => &class.setters,
            MemberKind::Static => &class.statics,
        };
        table.get(id)
    }

    pub fn define(&self, class_id: ClassId, kind: MemberKind, id: InternId, slot: ItableSlot) {
        let mut classes = self.classes.write().expect("class table lock poisoned");
        if let Some(class) = classes.get_mut(&class_id) {
            let table = match kind {
                MemberKind::Method => &mut class.methods,
                MemberKind::Getter => &mut class.getters,
                MemberKind::Setter => &mut class.setters,
                MemberKind::Static => &mut class.statics,
            };
            table.define(id, slot);
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemberKind {
    Method,
    Getter,
    Setter,
    Static,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subclass_of_self_and_ancestor_is_true() {
        let table = ClassTable::new();
        let base = table.class_new(1, false, None);
        let derived = table.class_new(2, false, Some(base));
        assert!(table.is_subclass(derived, base));
        assert!(table.is_subclass(derived, derived));
    }

    #[test]
    fn unrelated_classes_are_not_subclasses() {
        let table = ClassTable::new();
        let a = table.class_new(1, false, None);
        let b = table.class_new(2, false, None);
        assert!(!table.is_subclass(a, b));
    }

    #[test]
    fn transitive_ancestry_is_tracked() {
        let table = ClassTable::new();
        let grandparent = table.class_new(1, false, None);
        let parent = table.class_new(2, false, Some(grandparent));
        let child = table.class_new(3, false, Some(parent));
        assert!(table.is_subclass(child, grandparent));
    }

    #[test]
    fn trait_composition_copies_undefined_methods_only() {
        let table = ClassTable::new();
        let tr = table.class_new(1, true, None);
        table.define(tr, MemberKind::Method, 10, ItableSlot::Direct(Value::int(1)));
        let class = table.class_new(2, false, None);
        table.define(class, MemberKind::Method, 10, ItableSlot::Direct(Value::int(99)));
        table.implement_trait(class, tr);
        assert_eq!(table.lookup(class, MemberKind::Method, 10), Some(Value::int(99)));
        assert!(table.is_subclass(class, tr));
    }

    #[test]
    fn lookup_falls_back_to_super() {
        let table = ClassTable::new();
        let base = table.class_new(1, false, None);
        table.define(base, MemberKind::Method, 5, ItableSlot::Direct(Value::int(7)));
        let derived = table.class_new(2, false, Some(base));
        assert_eq!(table.lookup(derived, MemberKind::Method, 5), Some(Value::int(7)));
        assert!(table.lookup_immediate(derived, MemberKind::Method, 5).is_none());
    }

    #[test]
    fn ref_slot_with_no_binding_is_absent() {
        let table = ClassTable::new();
        let class = table.class_new(1, false, None);
        table.define(class, MemberKind::Static, 1, ItableSlot::Ref(std::sync::Arc::new(std::sync::Mutex::new(None))));
        assert!(table.lookup(class, MemberKind::Static, 1).is_none());
    }
}
