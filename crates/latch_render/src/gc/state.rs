//! Per-resource garbage collection state
//!
//! Every reclaimable GPU object embeds a [`GcState`] and implements
//! [`Trackable`]. The reaper only ever reads and writes this state; the
//! resource itself stays owned by whoever created it.

use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::Rc;

/// Tag describing what kind of resource a tracking record belongs to.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct ResourceKind(&'static str);

impl ResourceKind {
    pub const RESOURCE: Self = Self("resource");
    pub const RENDERABLE: Self = Self("renderable");
    pub const BUFFER: Self = Self("buffer");
    pub const TEXTURE: Self = Self("texture");

    pub const fn new(name: &'static str) -> Self {
        Self(name)
    }

    pub fn name(self) -> &'static str {
        self.0
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.0)
    }
}

/// Bookkeeping the reaper attaches to a resource it knows about.
///
/// `index` is the resource's slot in the reaper's dense array. Resources
/// discovered while sweeping a managed group have no slot.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct TrackingRecord {
    pub kind: ResourceKind,
    pub index: Option<usize>,
}

/// Token identifying one unload subscription.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

type UnloadListener = Rc<dyn Fn(&dyn Trackable)>;

/// Observer list raised when a resource releases its native objects.
///
/// Subscriptions are one-shot: raising the signal drains every listener.
#[derive(Default)]
pub struct UnloadSignal {
    listeners: RefCell<Vec<(ListenerId, UnloadListener)>>,
    next_id: Cell<u64>,
}

impl UnloadSignal {
    pub fn subscribe(&self, listener: impl Fn(&dyn Trackable) + 'static) -> ListenerId {
        let id = ListenerId(self.next_id.get());
        self.next_id.set(id.0 + 1);
        self.listeners.borrow_mut().push((id, Rc::new(listener)));
        id
    }

    /// Drop a subscription. Returns `false` if it had already fired or been
    /// removed.
    pub fn unsubscribe(&self, id: ListenerId) -> bool {
        let mut listeners = self.listeners.borrow_mut();
        let before = listeners.len();
        listeners.retain(|(listener, _)| *listener != id);
        listeners.len() != before
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.borrow().len()
    }

    /// Notify and drain all listeners. Listeners may subscribe again while
    /// running; those new subscriptions are kept for the next emission.
    pub fn emit(&self, resource: &dyn Trackable) {
        let listeners = std::mem::take(&mut *self.listeners.borrow_mut());
        for (_, listener) in listeners {
            listener(resource);
        }
    }
}

impl fmt::Debug for UnloadSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UnloadSignal")
            .field("listeners", &self.listener_count())
            .finish()
    }
}

/// Garbage collection state embedded in every trackable resource.
#[derive(Debug)]
pub struct GcState {
    last_used_ms: Cell<u64>,
    auto_collect: Cell<bool>,
    record: Cell<Option<TrackingRecord>>,
    unload: UnloadSignal,
}

impl GcState {
    pub fn new() -> Self {
        Self {
            last_used_ms: Cell::new(0),
            auto_collect: Cell::new(true),
            record: Cell::new(None),
            unload: UnloadSignal::default(),
        }
    }

    #[inline]
    pub fn last_used_ms(&self) -> u64 {
        self.last_used_ms.get()
    }

    #[inline]
    pub fn touch(&self, now_ms: u64) {
        self.last_used_ms.set(now_ms);
    }

    #[inline]
    pub fn auto_collect(&self) -> bool {
        self.auto_collect.get()
    }

    /// Opt this resource in or out of idle eviction.
    pub fn set_auto_collect(&self, enabled: bool) {
        self.auto_collect.set(enabled);
    }

    #[inline]
    pub fn record(&self) -> Option<TrackingRecord> {
        self.record.get()
    }

    #[inline]
    pub fn is_tracked(&self) -> bool {
        self.record.get().is_some()
    }

    pub fn unload_signal(&self) -> &UnloadSignal {
        &self.unload
    }

    /// True when the resource has been idle for strictly longer than
    /// `max_unused_ms`.
    #[inline]
    pub fn is_idle(&self, now_ms: u64, max_unused_ms: u64) -> bool {
        now_ms.saturating_sub(self.last_used_ms.get()) > max_unused_ms
    }

    pub(crate) fn attach(&self, record: TrackingRecord) {
        self.record.set(Some(record));
    }

    pub(crate) fn set_index(&self, index: usize) {
        if let Some(mut record) = self.record.get() {
            record.index = Some(index);
            self.record.set(Some(record));
        }
    }

    pub(crate) fn clear_record(&self) {
        self.record.set(None);
    }
}

impl Default for GcState {
    fn default() -> Self {
        Self::new()
    }
}

/// A GPU-backed object the reaper may evict when it goes unused.
///
/// Implementations release their native objects in [`Trackable::unload`]
/// and then raise `gc_state().unload_signal().emit(self)` so anything
/// tracking them lets go.
pub trait Trackable {
    fn gc_state(&self) -> &GcState;

    /// Release native objects. Called by the reaper on eviction, or by the
    /// owner for explicit cleanup.
    fn unload(&self);
}
