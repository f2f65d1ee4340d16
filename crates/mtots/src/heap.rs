//! The object arena and the mark-sweep collector.
//!
//! Objects live in a slot vector addressed by [`ObjId`]; the sweep phase is
//! a scan over the slots (the index-handle rendition of the original's
//! intrusive object list). The heap also owns the string pool and the two
//! weak intern tables for tuples and frozen dicts, which is what makes
//! structural equality collapse to identity for those types.
//!
//! The heap never collects on its own: allocation here only does the
//! bookkeeping. The VM's allocation gate decides when to run a collection
//! and feeds the roots in, so code that allocates directly against the heap
//! (the compiler, module setup) can never trigger a collection mid-flight.

use crate::error::{Error, Result};
use crate::map::{self, Map};
use crate::object::{Obj, ObjTuple};
use crate::ops;
use crate::strings::StringPool;
use crate::value::{ObjId, StrId, Value};

const GC_HEAP_GROW_FACTOR: usize = 2;
const FIRST_GC_AT: usize = 1024 * 1024;

struct Slot {
    marked: bool,
    obj: Obj,
}

pub struct Heap {
    slots: Vec<Option<Slot>>,
    free: Vec<u32>,
    pub strings: StringPool,
    /// Weak intern table: every live tuple, keyed by itself.
    tuples: Map,
    /// Weak intern table: every live frozen dict, keyed by itself.
    frozen_dicts: Map,
    bytes_allocated: usize,
    next_gc: usize,
    gray: Vec<ObjId>,
    /// Pin list for native code building multi-step structures that are not
    /// yet reachable from the VM stack.
    temp_roots: Vec<Value>,
}

impl Heap {
    pub fn new() -> Heap {
        Heap {
            slots: Vec::new(),
            free: Vec::new(),
            strings: StringPool::new(),
            tuples: Map::new(),
            frozen_dicts: Map::new(),
            bytes_allocated: 0,
            next_gc: FIRST_GC_AT,
            gray: Vec::new(),
            temp_roots: Vec::new(),
        }
    }

    // -- Allocation ---------------------------------------------------------

    pub fn allocate(&mut self, obj: Obj) -> ObjId {
        self.bytes_allocated += obj.heap_size();
        let slot = Slot { marked: false, obj };
        match self.free.pop() {
            Some(index) => {
                self.slots[index as usize] = Some(slot);
                ObjId(index)
            }
            None => {
                self.slots.push(Some(slot));
                ObjId((self.slots.len() - 1) as u32)
            }
        }
    }

    /// True when the next gated allocation should collect first.
    pub fn should_collect(&self) -> bool {
        if cfg!(feature = "gc-stress") {
            return true;
        }
        self.bytes_allocated + self.strings.allocated_bytes() > self.next_gc
    }

    pub fn intern(&mut self, text: &str) -> StrId {
        self.strings.intern(text)
    }

    pub fn intern_owned(&mut self, text: String) -> StrId {
        self.strings.intern_owned(text)
    }

    pub fn str(&self, id: StrId) -> &str {
        self.strings.get(id)
    }

    // -- Object access ------------------------------------------------------

    pub fn get(&self, id: ObjId) -> &Obj {
        match &self.slots[id.0 as usize] {
            Some(slot) => &slot.obj,
            None => panic!("dangling object id {}", id.0),
        }
    }

    pub fn get_mut(&mut self, id: ObjId) -> &mut Obj {
        match &mut self.slots[id.0 as usize] {
            Some(slot) => &mut slot.obj,
            None => panic!("dangling object id {}", id.0),
        }
    }

    // -- Hashing and interning ----------------------------------------------

    /// The language-level hash of a value. Non-integral numbers and
    /// non-interned aggregates are not hashable.
    pub fn value_hash(&self, value: Value) -> Result<u32> {
        if let Some(hash) = map::hash_primitive(&value) {
            return Ok(hash);
        }
        match value {
            Value::Str(id) => Ok(self.strings.hash(id)),
            Value::Obj(id) => match self.get(id) {
                Obj::Tuple(tuple) => Ok(tuple.hash),
                Obj::FrozenDict(fdict) => Ok(fdict.hash),
                _ => Err(self.unhashable(value)),
            },
            _ => Err(self.unhashable(value)),
        }
    }

    fn unhashable(&self, value: Value) -> Error {
        Error::Runtime(format!(
            "{} values are not hashable",
            self.kind_name(value)
        ))
    }

    /// FNV-1a folding of the four little-endian bytes of each element hash.
    pub fn hash_tuple_items(&self, items: &[Value]) -> Result<u32> {
        let mut hash: u32 = 2166136261;
        for item in items {
            let item_hash = self.value_hash(*item)?;
            for byte in item_hash.to_le_bytes() {
                hash ^= byte as u32;
                hash = hash.wrapping_mul(16777619);
            }
        }
        Ok(hash)
    }

    /// The CPython-frozenset-style hash of a map's contents.
    pub fn hash_map_contents(&self, map: &Map) -> Result<u32> {
        let mut hash: u32 = 1927868237;
        hash = hash.wrapping_mul(2 * map.len() as u32 * 2);
        for (key, value) in map.iter() {
            let kh = self.value_hash(key)?;
            let vh = self.value_hash(value)?;
            hash ^= (kh ^ (kh << 16) ^ 89869747).wrapping_mul(3644798167);
            hash ^= (vh ^ (vh << 16) ^ 89869747).wrapping_mul(3644798167);
        }
        Ok(hash.wrapping_mul(69069).wrapping_add(907133923))
    }

    /// Intern a tuple: structurally-equal tuples share one object.
    pub fn intern_tuple(&mut self, items: &[Value]) -> Result<ObjId> {
        let hash = self.hash_tuple_items(items)?;
        let existing = self.tuples.probe(hash, |key| match key {
            Value::Obj(id) => match self.get(id) {
                Obj::Tuple(tuple) => {
                    tuple.items.len() == items.len()
                        && tuple
                            .items
                            .iter()
                            .zip(items)
                            .all(|(a, b)| ops::values_equal(self, *a, *b))
                }
                _ => false,
            },
            _ => false,
        });
        if let Some(Value::Obj(id)) = existing {
            return Ok(id);
        }
        let id = self.allocate(Obj::Tuple(ObjTuple {
            items: items.to_vec().into_boxed_slice(),
            hash,
        }));
        self.tuples.set(Value::Obj(id), hash, Value::Nil);
        Ok(id)
    }

    /// Intern a frozen dict built from `map`'s contents.
    pub fn intern_frozen_dict(&mut self, map: Map) -> Result<ObjId> {
        let hash = self.hash_map_contents(&map)?;
        let existing = self.frozen_dicts.probe(hash, |key| match key {
            Value::Obj(id) => match self.get(id) {
                Obj::FrozenDict(fdict) => ops::maps_equal(self, &fdict.map, &map),
                _ => false,
            },
            _ => false,
        });
        if let Some(Value::Obj(id)) = existing {
            return Ok(id);
        }
        let id = self.allocate(Obj::FrozenDict(crate::object::ObjFrozenDict { map, hash }));
        self.frozen_dicts.set(Value::Obj(id), hash, Value::Nil);
        Ok(id)
    }

    /// A short human name for a value's kind, for error messages.
    pub fn kind_name(&self, value: Value) -> &'static str {
        match value {
            Value::Nil => "nil",
            Value::Bool(_) => "bool",
            Value::Number(_) => "number",
            Value::Str(_) => "string",
            Value::CFunction(_) => "cfunction",
            Value::Operator(_) => "operator",
            Value::Sentinel(_) => "sentinel",
            Value::Obj(id) => match self.get(id) {
                Obj::Class(_) => "class",
                Obj::Closure(_) => "function",
                Obj::Thunk(_) => "thunk",
                Obj::NativeClosure(_) => "native-closure",
                Obj::Instance(instance) => {
                    if let Obj::Class(class) = self.get(instance.class) {
                        if class.is_module {
                            return "module";
                        }
                    }
                    "instance"
                }
                Obj::Buffer(_) => "Buffer",
                Obj::List(_) => "List",
                Obj::Tuple(_) => "Tuple",
                Obj::Dict(_) => "Dict",
                Obj::FrozenDict(_) => "FrozenDict",
                Obj::File(_) => "File",
                Obj::Native(native) => native.descriptor.name,
                Obj::Upvalue(_) => "upvalue",
            },
        }
    }

    // -- Pinning ------------------------------------------------------------

    /// Keep `value` reachable until the matching [`Heap::pop_root`].
    pub fn push_root(&mut self, value: Value) {
        self.temp_roots.push(value);
    }

    pub fn pop_root(&mut self) {
        self.temp_roots.pop();
    }

    // -- Collection protocol ------------------------------------------------
    //
    // The VM drives a collection as: mark every root with `mark_value`,
    // `trace_references`, then `finish_collection`.

    pub fn mark_value(&mut self, value: Value) {
        match value {
            Value::Str(id) => self.strings.mark(id),
            Value::Obj(id) => self.mark_object(id),
            _ => {}
        }
    }

    pub fn mark_object(&mut self, id: ObjId) {
        let slot = match &mut self.slots[id.0 as usize] {
            Some(slot) => slot,
            None => panic!("marking dangling object id {}", id.0),
        };
        if slot.marked {
            return;
        }
        slot.marked = true;
        self.gray.push(id);
    }

    /// Drain the gray stack, blackening each object by marking everything
    /// it references.
    pub fn trace_references(&mut self) {
        let mut scratch: Vec<Value> = Vec::new();
        while let Some(id) = self.gray.pop() {
            scratch.clear();
            if let Some(slot) = &self.slots[id.0 as usize] {
                slot.obj.trace(&mut |value| scratch.push(value));
            }
            for value in scratch.drain(..) {
                match value {
                    Value::Str(sid) => self.strings.mark(sid),
                    Value::Obj(oid) => self.mark_object(oid),
                    _ => {}
                }
            }
        }
    }

    /// Mark the pin list. Called by the VM alongside its own roots.
    pub fn mark_pinned(&mut self) {
        let pinned: Vec<Value> = self.temp_roots.clone();
        for value in pinned {
            self.mark_value(value);
        }
        self.trace_references();
    }

    fn is_value_marked(&self, value: Value) -> bool {
        match value {
            Value::Obj(id) => self.slots[id.0 as usize]
                .as_ref()
                .map(|slot| slot.marked)
                .unwrap_or(false),
            // Non-object keys never appear in the intern tables.
            _ => true,
        }
    }

    /// Prune the weak tables and sweep the arena. Every surviving mark bit
    /// is cleared, restoring the between-cycles invariant.
    pub fn finish_collection(&mut self) {
        // Weak tables first: canonical entries must not resurrect objects.
        let mut tuples = std::mem::take(&mut self.tuples);
        tuples.remove_where_key(|key| !self.is_value_marked(key));
        self.tuples = tuples;
        let mut frozen_dicts = std::mem::take(&mut self.frozen_dicts);
        frozen_dicts.remove_where_key(|key| !self.is_value_marked(key));
        self.frozen_dicts = frozen_dicts;

        self.strings.sweep_unmarked();

        for (index, slot) in self.slots.iter_mut().enumerate() {
            match slot {
                Some(s) if s.marked => s.marked = false,
                Some(s) => {
                    self.bytes_allocated -= s.obj.heap_size();
                    *slot = None;
                    self.free.push(index as u32);
                }
                None => {}
            }
        }

        self.next_gc =
            (self.bytes_allocated + self.strings.allocated_bytes()) * GC_HEAP_GROW_FACTOR;
    }

    /// Number of live objects; test and debugging aid.
    pub fn live_objects(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::Value;

    fn num(n: f64) -> Value {
        Value::Number(n)
    }

    #[test]
    fn equal_strings_share_one_id() {
        let mut heap = Heap::new();
        let a = heap.intern("interned");
        let b = heap.intern_owned("interned".to_string());
        assert_eq!(a, b);
        assert!(Value::Str(a).identical_to(&Value::Str(b)));
    }

    #[test]
    fn structurally_equal_tuples_share_identity() {
        let mut heap = Heap::new();
        let a = heap.intern_tuple(&[num(1.0), num(2.0), num(3.0)]).unwrap();
        let b = heap.intern_tuple(&[num(1.0), num(2.0), num(3.0)]).unwrap();
        let c = heap.intern_tuple(&[num(1.0), num(2.0)]).unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn nested_tuples_intern_through_their_elements() {
        let mut heap = Heap::new();
        let inner1 = heap.intern_tuple(&[num(1.0), num(2.0)]).unwrap();
        let inner2 = heap.intern_tuple(&[num(1.0), num(2.0)]).unwrap();
        let outer1 = heap
            .intern_tuple(&[Value::Obj(inner1), num(3.0)])
            .unwrap();
        let outer2 = heap
            .intern_tuple(&[Value::Obj(inner2), num(3.0)])
            .unwrap();
        assert_eq!(outer1, outer2);
    }

    #[test]
    fn tuple_hashes_agree_for_equal_contents() {
        let heap = Heap::new();
        let a = heap.hash_tuple_items(&[num(1.0), Value::Bool(true)]).unwrap();
        let b = heap.hash_tuple_items(&[num(1.0), Value::Bool(true)]).unwrap();
        let c = heap.hash_tuple_items(&[num(2.0), Value::Bool(true)]).unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn tuples_with_unhashable_elements_are_errors() {
        let mut heap = Heap::new();
        assert!(heap.intern_tuple(&[num(1.5)]).is_err());
        assert!(heap.intern_tuple(&[num(f64::NAN)]).is_err());
        assert!(heap.intern_tuple(&[num(3.0)]).is_ok());
    }

    #[test]
    fn structurally_equal_frozen_dicts_share_identity() {
        let mut heap = Heap::new();
        let mut build = |heap: &mut Heap| {
            let mut map = Map::new();
            let key = Value::Bool(true);
            let hash = heap.value_hash(key).unwrap();
            map.set(key, hash, num(5.0));
            map
        };
        let map1 = build(&mut heap);
        let map2 = build(&mut heap);
        let a = heap.intern_frozen_dict(map1).unwrap();
        let b = heap.intern_frozen_dict(map2).unwrap();
        assert_eq!(a, b);

        let mut other = Map::new();
        let key = Value::Bool(false);
        let hash = heap.value_hash(key).unwrap();
        other.set(key, hash, num(5.0));
        let c = heap.intern_frozen_dict(other).unwrap();
        assert_ne!(a, c);
    }

    #[test]
    fn frozen_dicts_are_hashable_values() {
        let mut heap = Heap::new();
        let map = Map::new();
        let fdict = heap.intern_frozen_dict(map).unwrap();
        let hash = heap.value_hash(Value::Obj(fdict)).unwrap();
        // The cached hash is returned on every query.
        assert_eq!(heap.value_hash(Value::Obj(fdict)).unwrap(), hash);
    }

    #[test]
    fn unreferenced_objects_are_swept_and_intern_tables_pruned() {
        let mut heap = Heap::new();
        let tuple = heap.intern_tuple(&[num(9.0)]).unwrap();
        assert_eq!(heap.live_objects(), 1);

        // Nothing marked: the sweep reclaims the tuple and prunes its
        // intern-table entry.
        heap.trace_references();
        heap.finish_collection();
        assert_eq!(heap.live_objects(), 0);

        // Re-interning builds a fresh canonical tuple.
        let again = heap.intern_tuple(&[num(9.0)]).unwrap();
        assert_eq!(heap.live_objects(), 1);
        assert_eq!(tuple, again); // the freed slot is reused
    }

    #[test]
    fn marked_objects_survive_collection_with_clean_mark_bits() {
        let mut heap = Heap::new();
        let keep = heap.intern_tuple(&[num(1.0)]).unwrap();
        let _drop = heap.intern_tuple(&[num(2.0)]).unwrap();
        heap.mark_object(keep);
        heap.trace_references();
        heap.finish_collection();
        assert_eq!(heap.live_objects(), 1);
        // The mark bit was cleared: a second unmarked collection frees it.
        heap.trace_references();
        heap.finish_collection();
        assert_eq!(heap.live_objects(), 0);
    }
}
