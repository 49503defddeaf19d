//! Idle resource reaper
//!
//! Individually registered resources live in a dense array; each one's
//! [`TrackingRecord`] stores its slot so removal is a swap with the last
//! entry. Bulk collections are registered as groups and swept in place,
//! nulling evicted slots and only rebuilding a group once enough empty
//! slots have been seen.

use super::collection::{
    CollectionHandle, ManagedCollection, ResourceCollection, ResourceGroupHandle, SweepPass,
};
use super::state::{ListenerId, ResourceKind, Trackable, TrackingRecord};
use crate::config::{GcConfig, COMPACTION_THRESHOLD};
use latch_core::{Clock, Scheduler, TaskHandle};
use std::cell::{Cell, RefCell};
use std::rc::{Rc, Weak};

/// What one sweep did.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepReport {
    /// Resources whose `unload` was invoked.
    pub evicted: usize,
    /// Dense entries dropped because their owner freed the resource.
    pub pruned: usize,
    /// Empty group slots seen, including freshly evicted ones.
    pub nulled: usize,
    /// Groups rebuilt without their empty slots.
    pub compacted: usize,
}

struct TrackedEntry {
    resource: Weak<dyn Trackable>,
    listener: ListenerId,
}

struct GroupEntry {
    group: ResourceGroupHandle,
    kind: ResourceKind,
    priority: i32,
}

#[derive(Clone, Copy)]
struct ScheduledSweeps {
    resources: TaskHandle,
    collections: TaskHandle,
}

struct ReaperInner {
    clock: Rc<dyn Clock>,
    scheduler: Rc<dyn Scheduler>,
    config: Cell<GcConfig>,
    sweeps: Cell<Option<ScheduledSweeps>>,
    tracked: RefCell<Vec<TrackedEntry>>,
    groups: RefCell<Vec<GroupEntry>>,
    collections: RefCell<Vec<CollectionHandle>>,
    null_count: Cell<usize>,
}

impl Drop for ReaperInner {
    fn drop(&mut self) {
        if let Some(sweeps) = self.sweeps.take() {
            self.scheduler.cancel(sweeps.resources);
            self.scheduler.cancel(sweeps.collections);
        }
    }
}

/// Evicts GPU resources that have gone unused for too long.
///
/// Cloning yields another handle to the same reaper. Scheduled sweeps and
/// unload subscriptions only hold weak references, so dropping the last
/// handle cancels everything.
#[derive(Clone)]
pub struct Reaper {
    inner: Rc<ReaperInner>,
}

impl Reaper {
    /// Create a disabled reaper. Call [`Reaper::configure`] to start
    /// scheduled sweeps.
    pub fn new(clock: Rc<dyn Clock>, scheduler: Rc<dyn Scheduler>) -> Self {
        Self {
            inner: Rc::new(ReaperInner {
                clock,
                scheduler,
                config: Cell::new(GcConfig::default()),
                sweeps: Cell::new(None),
                tracked: RefCell::new(Vec::new()),
                groups: RefCell::new(Vec::new()),
                collections: RefCell::new(Vec::new()),
                null_count: Cell::new(0),
            }),
        }
    }

    pub fn with_config(
        clock: Rc<dyn Clock>,
        scheduler: Rc<dyn Scheduler>,
        config: GcConfig,
    ) -> Self {
        let reaper = Self::new(clock, scheduler);
        reaper.configure(config);
        reaper
    }

    /// Apply a policy. Frequencies take effect the next time sweeps are
    /// scheduled.
    pub fn configure(&self, config: GcConfig) {
        self.inner.config.set(config);
        self.set_enabled(config.active);
    }

    pub fn config(&self) -> GcConfig {
        self.inner.config.get()
    }

    pub fn max_unused_ms(&self) -> u64 {
        self.inner.config.get().max_unused_ms
    }

    pub fn enabled(&self) -> bool {
        self.inner.sweeps.get().is_some()
    }

    /// Schedule or cancel the two repeating sweeps. Idempotent.
    pub fn set_enabled(&self, enabled: bool) {
        match (enabled, self.inner.sweeps.get()) {
            (true, None) => {
                let config = self.inner.config.get();

                let weak = Rc::downgrade(&self.inner);
                let resources = self.inner.scheduler.repeat(
                    config.frequency_ms,
                    Box::new(move || {
                        if let Some(inner) = weak.upgrade() {
                            Reaper { inner }.run();
                        }
                    }),
                );

                let weak = Rc::downgrade(&self.inner);
                let collections = self.inner.scheduler.repeat(
                    config.collection_frequency_ms,
                    Box::new(move || {
                        if let Some(inner) = weak.upgrade() {
                            Reaper { inner }.run_collections();
                        }
                    }),
                );

                self.inner.sweeps.set(Some(ScheduledSweeps {
                    resources,
                    collections,
                }));
                tracing::debug!(
                    frequency_ms = config.frequency_ms,
                    max_unused_ms = config.max_unused_ms,
                    "resource reaper enabled"
                );
            }
            (false, Some(sweeps)) => {
                self.inner.scheduler.cancel(sweeps.resources);
                self.inner.scheduler.cancel(sweeps.collections);
                self.inner.sweeps.set(None);
                tracing::debug!("resource reaper disabled");
            }
            _ => {}
        }
    }

    /// Start tracking a resource, or refresh its timestamp if it is already
    /// tracked.
    pub fn add_resource<R: Trackable + 'static>(&self, resource: &Rc<R>, kind: ResourceKind) {
        let state = resource.gc_state();
        let now = self.inner.clock.now_ms();
        if state.is_tracked() {
            state.touch(now);
            return;
        }

        let weak = Rc::downgrade(&self.inner);
        let listener = state
            .unload_signal()
            .subscribe(move |unloaded: &dyn Trackable| {
                if let Some(inner) = weak.upgrade() {
                    Reaper { inner }.remove_resource(unloaded);
                }
            });

        let resource = Rc::downgrade(resource);
        let resource: Weak<dyn Trackable> = resource;
        let mut tracked = self.inner.tracked.borrow_mut();
        state.attach(TrackingRecord {
            kind,
            index: Some(tracked.len()),
        });
        state.touch(now);
        tracked.push(TrackedEntry { resource, listener });
        tracing::trace!(%kind, index = tracked.len() - 1, "tracking resource");
    }

    /// Stop tracking a resource. Returns `false` if it was not tracked by
    /// this reaper.
    pub fn remove_resource(&self, resource: &dyn Trackable) -> bool {
        let state = resource.gc_state();
        let Some(index) = state.record().and_then(|record| record.index) else {
            return false;
        };

        let owned = self
            .inner
            .tracked
            .borrow()
            .get(index)
            .is_some_and(|entry| std::ptr::addr_eq(entry.resource.as_ptr(), resource));
        if !owned {
            tracing::warn!(index, "tracking record does not match the reaper's entry");
            return false;
        }

        if let Some(entry) = self.swap_remove_at(index) {
            state.unload_signal().unsubscribe(entry.listener);
        }
        state.clear_record();
        tracing::trace!(index, "stopped tracking resource");
        true
    }

    /// Mark a resource as used now.
    pub fn touch(&self, resource: &dyn Trackable) {
        resource.gc_state().touch(self.inner.clock.now_ms());
    }

    /// Register a group of resources to sweep after the individually tracked
    /// ones. Groups run in ascending priority, ties in registration order.
    pub fn add_resource_hash(
        &self,
        group: &impl ResourceCollection,
        kind: ResourceKind,
        priority: i32,
    ) {
        let mut groups = self.inner.groups.borrow_mut();
        let position = groups
            .iter()
            .position(|entry| entry.priority > priority)
            .unwrap_or(groups.len());
        groups.insert(
            position,
            GroupEntry {
                group: group.resource_group(),
                kind,
                priority,
            },
        );
    }

    /// Register a plain collection whose empty slots are stripped on the
    /// collections tick.
    pub fn add_collection(&self, collection: &impl ManagedCollection) {
        self.inner
            .collections
            .borrow_mut()
            .push(collection.collection_handle());
    }

    pub fn tracked_count(&self) -> usize {
        self.inner.tracked.borrow().len()
    }

    pub fn group_count(&self) -> usize {
        self.inner.groups.borrow().len()
    }

    pub fn collection_count(&self) -> usize {
        self.inner.collections.borrow().len()
    }

    /// Evict idle tracked resources, then sweep every registered group.
    pub fn run(&self) -> SweepReport {
        let now = self.inner.clock.now_ms();
        let max_unused_ms = self.inner.config.get().max_unused_ms;
        let mut report = SweepReport::default();

        // Evictions may shrink the array, so bounds are re-read every step
        // and the index only advances past entries that stay.
        let mut index = 0;
        loop {
            let (resource, listener) = {
                let tracked = self.inner.tracked.borrow();
                let Some(entry) = tracked.get(index) else {
                    break;
                };
                (entry.resource.upgrade(), entry.listener)
            };

            let Some(resource) = resource else {
                self.swap_remove_at(index);
                report.pruned += 1;
                continue;
            };

            let state = resource.gc_state();
            if !(state.auto_collect() && state.is_idle(now, max_unused_ms)) {
                index += 1;
                continue;
            }

            state.unload_signal().unsubscribe(listener);
            self.swap_remove_at(index);
            state.clear_record();
            resource.unload();
            report.evicted += 1;
        }

        self.sweep_groups(now, max_unused_ms, &mut report);

        if report.evicted > 0 || report.compacted > 0 {
            tracing::debug!(
                evicted = report.evicted,
                pruned = report.pruned,
                compacted = report.compacted,
                tracked = self.tracked_count(),
                "resource sweep"
            );
        }
        report
    }

    /// Strip empty slots from every registered plain collection. Returns the
    /// number of slots removed.
    pub fn run_collections(&self) -> usize {
        let collections: Vec<_> = {
            let mut handles = self.inner.collections.borrow_mut();
            handles.retain(|handle| handle.upgrade().is_some());
            handles.iter().filter_map(CollectionHandle::upgrade).collect()
        };

        let stripped = collections
            .iter()
            .map(|collection| collection.strip_empty())
            .sum();
        if stripped > 0 {
            tracing::debug!(stripped, "managed collections compacted");
        }
        stripped
    }

    /// Disable scheduling and forget everything.
    pub fn destroy(&self) {
        self.set_enabled(false);

        let tracked = std::mem::take(&mut *self.inner.tracked.borrow_mut());
        for entry in tracked {
            if let Some(resource) = entry.resource.upgrade() {
                let state = resource.gc_state();
                state.unload_signal().unsubscribe(entry.listener);
                state.clear_record();
            }
        }

        self.inner.groups.borrow_mut().clear();
        self.inner.collections.borrow_mut().clear();
        self.inner.null_count.set(0);
    }

    fn sweep_groups(&self, now_ms: u64, max_unused_ms: u64, report: &mut SweepReport) {
        let groups: Vec<_> = {
            let mut entries = self.inner.groups.borrow_mut();
            entries.retain(|entry| entry.group.upgrade().is_some());
            entries
                .iter()
                .filter_map(|entry| entry.group.upgrade().map(|group| (group, entry.kind)))
                .collect()
        };

        for (group, kind) in groups {
            let sweep = group.sweep(&SweepPass {
                now_ms,
                max_unused_ms,
                kind,
            });
            report.evicted += sweep.evicted;
            report.nulled += sweep.nulls;

            let nulls = self.inner.null_count.get() + sweep.nulls;
            if nulls >= COMPACTION_THRESHOLD {
                group.compact();
                report.compacted += 1;
                self.inner.null_count.set(0);
            } else {
                self.inner.null_count.set(nulls);
            }
        }
    }

    /// Swap the last entry into `index` and fix its record.
    fn swap_remove_at(&self, index: usize) -> Option<TrackedEntry> {
        let mut tracked = self.inner.tracked.borrow_mut();
        if index >= tracked.len() {
            return None;
        }
        let removed = tracked.swap_remove(index);
        if let Some(moved) = tracked.get(index).and_then(|entry| entry.resource.upgrade()) {
            moved.gc_state().set_index(index);
        }
        Some(removed)
    }
}
