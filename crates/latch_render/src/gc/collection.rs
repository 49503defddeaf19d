//! Collections the reaper may clean up without owning them
//!
//! [`ManagedMap`] and [`ManagedArray`] are cheap shared handles: the owner
//! keeps one, the reaper keeps a weak reference. Slots hold `Option<V>` so
//! entries can be nulled in place; a rebuild without the empty slots swaps
//! the backing storage and bumps [`ManagedMap::generation`].

use super::state::{ResourceKind, Trackable, TrackingRecord};
use indexmap::IndexMap;
use std::cell::{Cell, RefCell};
use std::hash::Hash;
use std::rc::{Rc, Weak};

/// Shape of a managed collection.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum CollectionKind {
    Map,
    Array,
}

/// Parameters of one group sweep.
pub(crate) struct SweepPass {
    pub now_ms: u64,
    pub max_unused_ms: u64,
    pub kind: ResourceKind,
}

/// Result of sweeping one group.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub(crate) struct GroupSweep {
    /// Empty slots seen, including the ones emptied by this sweep.
    pub nulls: usize,
    pub evicted: usize,
}

pub(crate) trait SweepSlots {
    fn sweep(&self, pass: &SweepPass) -> GroupSweep;

    /// Rebuild the backing storage without empty slots.
    fn compact(&self);
}

pub(crate) trait StripEmpty {
    /// Rebuild without empty slots if there are any. Returns how many were
    /// dropped.
    fn strip_empty(&self) -> usize;
}

/// Weak reference to a group of trackable resources.
#[derive(Clone)]
pub struct ResourceGroupHandle {
    slots: Weak<dyn SweepSlots>,
    kind: CollectionKind,
}

impl ResourceGroupHandle {
    pub fn kind(&self) -> CollectionKind {
        self.kind
    }

    pub(crate) fn upgrade(&self) -> Option<Rc<dyn SweepSlots>> {
        self.slots.upgrade()
    }
}

/// Weak reference to a plain collection.
#[derive(Clone)]
pub struct CollectionHandle {
    slots: Weak<dyn StripEmpty>,
    kind: CollectionKind,
}

impl CollectionHandle {
    pub fn kind(&self) -> CollectionKind {
        self.kind
    }

    pub(crate) fn upgrade(&self) -> Option<Rc<dyn StripEmpty>> {
        self.slots.upgrade()
    }
}

/// A collection of trackable resources the reaper can sweep.
pub trait ResourceCollection {
    fn resource_group(&self) -> ResourceGroupHandle;
}

/// A collection whose empty slots the reaper periodically strips.
pub trait ManagedCollection {
    fn collection_handle(&self) -> CollectionHandle;
}

/// Null-or-evict pass shared by maps and arrays. Evicted resources are
/// handed back so they can be unloaded after the slot borrow is released.
fn sweep_slots<'a, R: Trackable + 'a>(
    slots: impl Iterator<Item = &'a mut Option<Rc<R>>>,
    pass: &SweepPass,
    evicted: &mut Vec<Rc<R>>,
) -> usize {
    let mut nulls = 0;
    for slot in slots {
        let Some(resource) = slot.as_ref() else {
            nulls += 1;
            continue;
        };

        let state = resource.gc_state();
        if !state.is_tracked() {
            state.attach(TrackingRecord {
                kind: pass.kind,
                index: None,
            });
            state.touch(pass.now_ms);
            continue;
        }

        if state.auto_collect() && state.is_idle(pass.now_ms, pass.max_unused_ms) {
            state.clear_record();
            if let Some(resource) = slot.take() {
                evicted.push(resource);
            }
            nulls += 1;
        }
    }
    nulls
}

fn unload_all<R: Trackable>(evicted: Vec<Rc<R>>) -> usize {
    let count = evicted.len();
    for resource in evicted {
        resource.unload();
    }
    count
}

// ----------------------------------------------------------------------------
// Map
// ----------------------------------------------------------------------------

struct MapSlots<K, V> {
    entries: RefCell<IndexMap<K, Option<V>>>,
    generation: Cell<u64>,
}

impl<K: Hash + Eq, V> MapSlots<K, V> {
    fn rebuild(&self) -> usize {
        let mut entries = self.entries.borrow_mut();
        let before = entries.len();
        let live: IndexMap<K, Option<V>> = std::mem::take(&mut *entries)
            .into_iter()
            .filter(|(_, value)| value.is_some())
            .collect();
        *entries = live;
        self.generation.set(self.generation.get() + 1);
        before - entries.len()
    }
}

impl<K: Hash + Eq, R: Trackable> SweepSlots for MapSlots<K, Rc<R>> {
    fn sweep(&self, pass: &SweepPass) -> GroupSweep {
        let mut evicted = Vec::new();
        let nulls = sweep_slots(self.entries.borrow_mut().values_mut(), pass, &mut evicted);
        GroupSweep {
            nulls,
            evicted: unload_all(evicted),
        }
    }

    fn compact(&self) {
        self.rebuild();
    }
}

impl<K: Hash + Eq, V> StripEmpty for MapSlots<K, V> {
    fn strip_empty(&self) -> usize {
        let has_empty = self.entries.borrow().values().any(Option::is_none);
        if has_empty {
            self.rebuild()
        } else {
            0
        }
    }
}

/// Insertion-ordered map whose entries can be nulled in place.
pub struct ManagedMap<K, V> {
    slots: Rc<MapSlots<K, V>>,
}

impl<K: Hash + Eq, V> ManagedMap<K, V> {
    pub fn new() -> Self {
        Self {
            slots: Rc::new(MapSlots {
                entries: RefCell::new(IndexMap::new()),
                generation: Cell::new(0),
            }),
        }
    }

    /// Insert or replace a live entry, returning the previous live value.
    pub fn insert(&self, key: K, value: V) -> Option<V> {
        self.slots
            .entries
            .borrow_mut()
            .insert(key, Some(value))
            .flatten()
    }

    /// Null an entry in place, keeping its key and position.
    pub fn clear_entry(&self, key: &K) -> Option<V> {
        self.slots
            .entries
            .borrow_mut()
            .get_mut(key)
            .and_then(Option::take)
    }

    /// Remove an entry entirely, preserving the order of the rest.
    pub fn remove(&self, key: &K) -> Option<V> {
        self.slots.entries.borrow_mut().shift_remove(key).flatten()
    }

    pub fn get(&self, key: &K) -> Option<V>
    where
        V: Clone,
    {
        self.slots.entries.borrow().get(key).cloned().flatten()
    }

    pub fn contains_key(&self, key: &K) -> bool {
        self.slots.entries.borrow().contains_key(key)
    }

    /// True if the key exists but its slot is empty.
    pub fn is_null(&self, key: &K) -> bool {
        matches!(self.slots.entries.borrow().get(key), Some(None))
    }

    /// Number of slots, empty ones included.
    pub fn len(&self) -> usize {
        self.slots.entries.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.entries.borrow().is_empty()
    }

    pub fn live_len(&self) -> usize {
        self.slots
            .entries
            .borrow()
            .values()
            .filter(|value| value.is_some())
            .count()
    }

    /// Keys in iteration order, empty slots included.
    pub fn keys(&self) -> Vec<K>
    where
        K: Clone,
    {
        self.slots.entries.borrow().keys().cloned().collect()
    }

    /// Incremented every time the backing storage is replaced.
    pub fn generation(&self) -> u64 {
        self.slots.generation.get()
    }
}

impl<K: Hash + Eq, V> Default for ManagedMap<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V> Clone for ManagedMap<K, V> {
    fn clone(&self) -> Self {
        Self {
            slots: Rc::clone(&self.slots),
        }
    }
}

impl<K, R> ResourceCollection for ManagedMap<K, Rc<R>>
where
    K: Hash + Eq + 'static,
    R: Trackable + 'static,
{
    fn resource_group(&self) -> ResourceGroupHandle {
        let slots = Rc::downgrade(&self.slots);
        let slots: Weak<dyn SweepSlots> = slots;
        ResourceGroupHandle {
            slots,
            kind: CollectionKind::Map,
        }
    }
}

impl<K, V> ManagedCollection for ManagedMap<K, V>
where
    K: Hash + Eq + 'static,
    V: 'static,
{
    fn collection_handle(&self) -> CollectionHandle {
        let slots = Rc::downgrade(&self.slots);
        let slots: Weak<dyn StripEmpty> = slots;
        CollectionHandle {
            slots,
            kind: CollectionKind::Map,
        }
    }
}

// ----------------------------------------------------------------------------
// Array
// ----------------------------------------------------------------------------

struct ArraySlots<V> {
    entries: RefCell<Vec<Option<V>>>,
    generation: Cell<u64>,
}

impl<V> ArraySlots<V> {
    fn rebuild(&self) -> usize {
        let mut entries = self.entries.borrow_mut();
        let before = entries.len();
        let live: Vec<Option<V>> = std::mem::take(&mut *entries)
            .into_iter()
            .filter(Option::is_some)
            .collect();
        *entries = live;
        self.generation.set(self.generation.get() + 1);
        before - entries.len()
    }
}

impl<R: Trackable> SweepSlots for ArraySlots<Rc<R>> {
    fn sweep(&self, pass: &SweepPass) -> GroupSweep {
        let mut evicted = Vec::new();
        let nulls = sweep_slots(self.entries.borrow_mut().iter_mut(), pass, &mut evicted);
        GroupSweep {
            nulls,
            evicted: unload_all(evicted),
        }
    }

    fn compact(&self) {
        self.rebuild();
    }
}

impl<V> StripEmpty for ArraySlots<V> {
    fn strip_empty(&self) -> usize {
        let has_empty = self.entries.borrow().iter().any(Option::is_none);
        if has_empty {
            self.rebuild()
        } else {
            0
        }
    }
}

/// Growable array whose slots can be nulled in place.
pub struct ManagedArray<V> {
    slots: Rc<ArraySlots<V>>,
}

impl<V> ManagedArray<V> {
    pub fn new() -> Self {
        Self {
            slots: Rc::new(ArraySlots {
                entries: RefCell::new(Vec::new()),
                generation: Cell::new(0),
            }),
        }
    }

    /// Append a slot, returning its index.
    pub fn push(&self, value: Option<V>) -> usize {
        let mut entries = self.slots.entries.borrow_mut();
        entries.push(value);
        entries.len() - 1
    }

    /// Overwrite a slot. Out-of-range indices are ignored and the value is
    /// handed back.
    pub fn set(&self, index: usize, value: Option<V>) -> Option<V> {
        match self.slots.entries.borrow_mut().get_mut(index) {
            Some(slot) => std::mem::replace(slot, value),
            None => value,
        }
    }

    /// Null a slot in place.
    pub fn clear_slot(&self, index: usize) -> Option<V> {
        self.slots
            .entries
            .borrow_mut()
            .get_mut(index)
            .and_then(Option::take)
    }

    pub fn get(&self, index: usize) -> Option<V>
    where
        V: Clone,
    {
        self.slots.entries.borrow().get(index).cloned().flatten()
    }

    pub fn len(&self) -> usize {
        self.slots.entries.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.entries.borrow().is_empty()
    }

    pub fn live_len(&self) -> usize {
        self.slots
            .entries
            .borrow()
            .iter()
            .filter(|value| value.is_some())
            .count()
    }

    /// Snapshot of all slots in order.
    pub fn to_vec(&self) -> Vec<Option<V>>
    where
        V: Clone,
    {
        self.slots.entries.borrow().clone()
    }

    pub fn generation(&self) -> u64 {
        self.slots.generation.get()
    }
}

impl<V> Default for ManagedArray<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V> Clone for ManagedArray<V> {
    fn clone(&self) -> Self {
        Self {
            slots: Rc::clone(&self.slots),
        }
    }
}

impl<R: Trackable + 'static> ResourceCollection for ManagedArray<Rc<R>> {
    fn resource_group(&self) -> ResourceGroupHandle {
        let slots = Rc::downgrade(&self.slots);
        let slots: Weak<dyn SweepSlots> = slots;
        ResourceGroupHandle {
            slots,
            kind: CollectionKind::Array,
        }
    }
}

impl<V: 'static> ManagedCollection for ManagedArray<V> {
    fn collection_handle(&self) -> CollectionHandle {
        let slots = Rc::downgrade(&self.slots);
        let slots: Weak<dyn StripEmpty> = slots;
        CollectionHandle {
            slots,
            kind: CollectionKind::Array,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clear_entry_keeps_key_and_order() {
        let map = ManagedMap::new();
        map.insert("a", 1);
        map.insert("b", 2);
        map.insert("c", 3);

        assert_eq!(map.clear_entry(&"b"), Some(2));
        assert!(map.is_null(&"b"));
        assert_eq!(map.keys(), vec!["a", "b", "c"]);
        assert_eq!(map.live_len(), 2);
        assert_eq!(map.generation(), 0);
    }

    #[test]
    fn strip_empty_rebuilds_only_when_needed() {
        let map: ManagedMap<&str, i32> = ManagedMap::new();
        map.insert("a", 1);
        let handle = map.collection_handle();
        let slots = handle.upgrade().unwrap();

        assert_eq!(slots.strip_empty(), 0);
        assert_eq!(map.generation(), 0);

        map.insert("b", 2);
        map.clear_entry(&"a");
        assert_eq!(slots.strip_empty(), 1);
        assert_eq!(map.generation(), 1);
        assert_eq!(map.keys(), vec!["b"]);
    }

    #[test]
    fn array_strip_preserves_order() {
        let array = ManagedArray::new();
        for value in [Some(1), None, Some(2), None, Some(3)] {
            array.push(value);
        }
        let slots = array.collection_handle().upgrade().unwrap();

        assert_eq!(slots.strip_empty(), 2);
        assert_eq!(array.to_vec(), vec![Some(1), Some(2), Some(3)]);
        assert_eq!(array.generation(), 1);
    }

    #[test]
    fn handles_do_not_keep_collections_alive() {
        let array: ManagedArray<u8> = ManagedArray::new();
        let handle = array.collection_handle();
        assert!(handle.upgrade().is_some());
        drop(array);
        assert!(handle.upgrade().is_none());
    }

    #[test]
    fn set_out_of_range_returns_value() {
        let array = ManagedArray::new();
        array.push(Some('x'));
        assert_eq!(array.set(5, Some('y')), Some('y'));
        assert_eq!(array.set(0, None), Some('x'));
        assert_eq!(array.clear_slot(0), None);
        assert_eq!(array.len(), 1);
        assert_eq!(array.collection_handle().kind(), CollectionKind::Array);
    }
}
