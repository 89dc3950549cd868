//! Binary operator dispatch: per-operator group with a sorted cache and a
//! specificity-ordered definition list (§4.F).

use loom_core::{ClassId, InternId};
use std::sync::RwLock;

pub type ProgramRef = u32;

#[derive(Debug, Clone, Copy)]
struct Definition {
    t1: ClassId,
    t2: ClassId,
    program: ProgramRef,
    /// Registration order, used to break ties between incomparable matches.
    seq: u64,
}

/// One operator's dispatch state: a sorted `(key, program)` cache kept in
/// step with a linear definition list, exactly mirroring `operators.c`'s
/// `check_cache`/`update_cache` pair.
#[derive(Default)]
pub struct DispatchGroup {
    inner: RwLock<DispatchGroupInner>,
}

#[derive(Default)]
struct DispatchGroupInner {
    defs: Vec<Definition>,
    cache: Vec<(u64, ProgramRef)>,
    next_seq: u64,
}

fn cache_key(t1: ClassId, t2: ClassId) -> u64 {
    ((t1 as u64) << 32) | t2 as u64
}

impl DispatchGroup {
    pub fn new() -> Self {
        Self::default()
    }

    /// `op_add`: register that `(t1, t2)` is implemented by `program`.
    /// Invalidates the cache (any prior resolution for an overlapping key
    /// may no longer be the most specific match).
    pub fn register(&self, t1: ClassId, t2: ClassId, program: ProgramRef) {
        let mut inner = self.inner.write().expect("dispatch group lock poisoned");
        let seq = inner.next_seq;
        inner.next_seq += 1;
        inner.defs.push(Definition { t1, t2, program, seq });
        inner.cache.clear();
    }

    /// `op_dispatch`: cache hit via binary search under a read lock; on
    /// miss, upgrade to the write lock, linear-scan `defs` for the most
    /// specific match, and insert the result into the sorted cache.
    pub fn dispatch(&self, t1: ClassId, t2: ClassId, is_subclass: impl Fn(ClassId, ClassId) -> bool) -> Option<ProgramRef> {
        let key = cache_key(t1, t2);
        {
            let inner = self.inner.read().expect("dispatch group lock poisoned");
            if let Ok(idx) = inner.cache.binary_search_by_key(&key, |(k, _)| *k) {
                return Some(inner.cache[idx].1);
            }
        }

        let mut inner = self.inner.write().expect("dispatch group lock poisoned");
        // Another writer may have resolved this key while we waited for the lock.
        if let Ok(idx) = inner.cache.binary_search_by_key(&key, |(k, _)| *k) {
            return Some(inner.cache[idx].1);
        }

        let matches: Vec<Definition> = inner
            .defs
            .iter()
            .copied()
            .filter(|d| is_subclass(t1, d.t1) && is_subclass(t2, d.t2))
            .collect();

        let best = most_specific(&matches, &is_subclass);
        if let Some(def) = best {
            let idx = inner.cache.binary_search_by_key(&key, |(k, _)| *k).unwrap_err();
            inner.cache.insert(idx, (key, def.program));
            Some(def.program)
        } else {
            None
        }
    }
}

/// A definition is strictly more specific than another when its operand
/// classes are subclasses of the other's (and not vice versa on both).
/// Ties between incomparable matches resolve to registration order.
fn are_ordered(a: &Definition, b: &Definition, is_subclass: &impl Fn(ClassId, ClassId) -> bool) -> Option<std::cmp::Ordering> {
    let a_more_specific = is_subclass(a.t1, b.t1) && is_subclass(a.t2, b.t2);
    let b_more_specific = is_subclass(b.t1, a.t1) && is_subclass(b.t2, a.t2);
    match (a_more_specific, b_more_specific) {
        (true, false) => Some(std::cmp::Ordering::Less),
        (false, true) => Some(std::cmp::Ordering::Greater),
        _ => None,
    }
}

fn most_specific(matches: &[Definition], is_subclass: &impl Fn(ClassId, ClassId) -> bool) -> Option<Definition> {
    let mut best: Option<Definition> = None;
    for &candidate in matches {
        best = Some(match best {
            None => candidate,
            Some(cur) => match are_ordered(&candidate, &cur, is_subclass) {
                Some(std::cmp::Ordering::Less) => candidate,
                Some(std::cmp::Ordering::Greater) => cur,
                _ => {
                    if candidate.seq < cur.seq {
                        candidate
                    } else {
                        cur
                    }
                }
            },
        });
    }
    best
}

/// The process-wide operator table: operator ids (interned `+`, `-`, ...)
/// index a vector of `DispatchGroup`s.
pub struct OperatorTable {
    groups: RwLock<Vec<DispatchGroup>>,
}

impl Default for OperatorTable {
    fn default() -> Self {
        Self::new()
    }
}

impl OperatorTable {
    pub fn new() -> Self {
        Self { groups: RwLock::new(Vec::new()) }
    }

    fn ensure_group(&self, op: InternId) {
        let mut groups = self.groups.write().expect("operator table lock poisoned");
        if groups.len() <= op as usize {
            groups.resize_with(op as usize + 1, DispatchGroup::new);
        }
    }

    pub fn with_group<R>(&self, op: InternId, f: impl FnOnce(&DispatchGroup) -> R) -> R {
        self.ensure_group(op);
        let groups = self.groups.read().expect("operator table lock poisoned");
        f(&groups[op as usize])
    }
}
