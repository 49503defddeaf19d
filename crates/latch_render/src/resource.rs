//! Reclaimable GPU buffer
//!
//! [`ManagedBuffer`] owns its description and creates the native buffer on
//! first use. Evicting it only drops the native object; the next use
//! recreates it and hands it back to the reaper.

use crate::backend::GpuBackend;
use crate::gc::{GcState, Reaper, ResourceKind, Trackable};
use latch_core::Clock;
use std::cell::RefCell;
use std::rc::{Rc, Weak};

pub struct ManagedBuffer<B: GpuBackend> {
    this: Weak<Self>,
    backend: Rc<B>,
    reaper: Reaper,
    clock: Rc<dyn Clock>,
    label: String,
    size: u64,
    usage: wgpu::BufferUsages,
    native: RefCell<Option<B::Buffer>>,
    gc: GcState,
}

impl<B: GpuBackend + 'static> ManagedBuffer<B> {
    /// Describe a buffer. Nothing is allocated and nothing is tracked until
    /// the first use.
    pub fn new(
        backend: Rc<B>,
        reaper: Reaper,
        clock: Rc<dyn Clock>,
        label: impl Into<String>,
        size: u64,
        usage: wgpu::BufferUsages,
    ) -> Rc<Self> {
        Rc::new_cyclic(|this| Self {
            this: this.clone(),
            backend,
            reaper,
            clock,
            label: label.into(),
            size,
            usage,
            native: RefCell::new(None),
            gc: GcState::new(),
        })
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    /// True while a native buffer exists.
    pub fn is_resident(&self) -> bool {
        self.native.borrow().is_some()
    }

    /// Run `f` with the native buffer, creating it if needed, and mark the
    /// buffer as used. `f` must not unload this buffer.
    pub fn with_native<T>(&self, f: impl FnOnce(&B::Buffer) -> T) -> T {
        // Tracking ends on eviction, so every use re-registers.
        match self.this.upgrade() {
            Some(this) => self.reaper.add_resource(&this, ResourceKind::BUFFER),
            None => self.gc.touch(self.clock.now_ms()),
        }
        let mut native = self.native.borrow_mut();
        let buffer = native.get_or_insert_with(|| {
            tracing::trace!(label = %self.label, size = self.size, "creating native buffer");
            self.backend.create_buffer(&self.label, self.size, self.usage)
        });
        f(buffer)
    }

    pub fn write(&self, offset: u64, data: &[u8]) {
        self.with_native(|buffer| self.backend.write_buffer(buffer, offset, data));
    }
}

impl<B: GpuBackend + 'static> Trackable for ManagedBuffer<B> {
    fn gc_state(&self) -> &GcState {
        &self.gc
    }

    fn unload(&self) {
        let native = self.native.borrow_mut().take();
        if let Some(buffer) = native {
            self.backend.destroy_buffer(&buffer);
            tracing::trace!(label = %self.label, "released native buffer");
        }
        self.gc.unload_signal().emit(self);
    }
}
