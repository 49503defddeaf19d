//! Per-frame uniform batching
//!
//! Every uniform group drawn in a frame is packed into one [`UniformArena`].
//! The device only accepts binding offsets on a `granularity` boundary, so
//! the arena is mirrored into `granularity / min_alignment` buffers, each
//! shifted by one alignment unit. Slot `index` is then always reachable at a
//! legal offset:
//!
//! ```text
//! arena     | 0 | 1 | 2 | 3 | 4 | 5 | ...   (min_alignment bytes each)
//! buffer 0  | 0 | 1 | 2 | 3 | 4 | 5 | ...   views at 0, 256, ... -> slots 0, 2, 4
//! buffer 1  | 1 | 2 | 3 | 4 | 5 | ...       views at 0, 256, ... -> slots 1, 3, 5
//! ```
//!
//! At the end of the frame the arena is written to buffer 0 once and the
//! other mirrors are filled with device-side copies in a single submission.

use super::arena::UniformArena;
use super::group::{UniformGroupId, UniformSource};
use crate::backend::GpuBackend;
use crate::config::UniformBatchConfig;
use crate::error::UniformError;
use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::{Rc, Weak};

/// A uniform-sized window into one mirror buffer.
pub struct BufferView<B: GpuBackend> {
    pub buffer: Rc<B::Buffer>,
    pub offset: u64,
    pub size: u64,
}

impl<B: GpuBackend> Clone for BufferView<B> {
    fn clone(&self) -> Self {
        Self {
            buffer: Rc::clone(&self.buffer),
            offset: self.offset,
            size: self.size,
        }
    }
}

/// Where the batcher is within the current frame.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum FramePhase {
    Idle,
    Accumulating,
    Flushed,
}

struct MirrorSet<B: GpuBackend> {
    buffers: Vec<Rc<B::Buffer>>,
    size: u64,
}

/// Mirror buffers live until growth retires them or the batcher is
/// destroyed. They are never registered with a reaper.
struct Mirrors<B: GpuBackend> {
    current: MirrorSet<B>,
    /// Sets replaced by growth this frame. Bindings made before the growth
    /// still point at them, so they are uploaded too and freed at frame end.
    retired: Vec<MirrorSet<B>>,
    generation: u64,
}

impl<B: GpuBackend> Mirrors<B> {
    fn create_set(backend: &B, count: usize, size: u64) -> MirrorSet<B> {
        let buffers = (0..count)
            .map(|index| {
                let mut usage = wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST;
                if index == 0 {
                    usage |= wgpu::BufferUsages::COPY_SRC;
                }
                Rc::new(backend.create_buffer(&format!("uniform batch mirror {index}"), size, usage))
            })
            .collect();
        MirrorSet { buffers, size }
    }

    fn grow(&mut self, backend: &B, size: u64) {
        let count = self.current.buffers.len();
        let replaced = std::mem::replace(&mut self.current, Self::create_set(backend, count, size));
        tracing::debug!(
            from = replaced.size,
            to = size,
            "uniform batch mirrors reallocated"
        );
        self.retired.push(replaced);
        self.generation += 1;
    }
}

/// Packs uniform groups into shared buffers and uploads them once per frame.
pub struct UniformBatcher<B: GpuBackend> {
    backend: Rc<B>,
    config: UniformBatchConfig,
    arena: UniformArena,
    mirrors: Rc<RefCell<Mirrors<B>>>,
    views: Vec<Option<BufferView<B>>>,
    bind_groups: Vec<Option<Rc<B::BindGroup>>>,
    cache_generation: u64,
    frame_bindings: HashMap<UniformGroupId, Rc<B::BindGroup>>,
    phase: FramePhase,
}

impl<B: GpuBackend + 'static> UniformBatcher<B> {
    pub fn new(backend: Rc<B>, config: UniformBatchConfig) -> Result<Self, UniformError> {
        config.validate()?;
        let mut arena = UniformArena::new(&config)?;

        let mirrors = Rc::new(RefCell::new(Mirrors {
            current: Mirrors::create_set(
                &*backend,
                config.total_buffers(),
                arena.capacity_bytes() as u64,
            ),
            retired: Vec::new(),
            generation: 0,
        }));

        let weak: Weak<RefCell<Mirrors<B>>> = Rc::downgrade(&mirrors);
        let resize_backend = Rc::clone(&backend);
        arena.set_resize_listener(move |data: &[f32]| {
            if let Some(mirrors) = weak.upgrade() {
                let size = std::mem::size_of_val(data) as u64;
                mirrors.borrow_mut().grow(&*resize_backend, size);
            }
        });

        tracing::debug!(
            buffers = config.total_buffers(),
            min_alignment = config.min_alignment,
            granularity = config.granularity,
            "uniform batcher created"
        );

        Ok(Self {
            backend,
            config,
            arena,
            mirrors,
            views: Vec::new(),
            bind_groups: Vec::new(),
            cache_generation: 0,
            frame_bindings: HashMap::new(),
            phase: FramePhase::Idle,
        })
    }

    pub fn config(&self) -> &UniformBatchConfig {
        &self.config
    }

    pub fn arena(&self) -> &UniformArena {
        &self.arena
    }

    pub fn phase(&self) -> FramePhase {
        self.phase
    }

    pub fn total_buffers(&self) -> usize {
        self.config.total_buffers()
    }

    /// The current mirror buffers, primary first.
    pub fn mirror_buffers(&self) -> Vec<Rc<B::Buffer>> {
        self.mirrors.borrow().current.buffers.clone()
    }

    /// Bind group for `group`'s data this frame.
    ///
    /// Unless `duplicate` is set, a group already placed this frame gets the
    /// same bind group back without being written again.
    pub fn bind_group_for(
        &mut self,
        group: &impl UniformSource,
        duplicate: bool,
    ) -> Result<Rc<B::BindGroup>, UniformError> {
        self.ensure_accumulating()?;
        if !duplicate {
            if let Some(bind_group) = self.frame_bindings.get(&group.id()) {
                return Ok(Rc::clone(bind_group));
            }
        }

        let offset = self.place(group)?;
        let bind_group = self.bind_group(offset / self.config.min_alignment);
        self.frame_bindings
            .insert(group.id(), Rc::clone(&bind_group));
        Ok(bind_group)
    }

    /// Place `group` and return the view it landed in. Never memoized.
    pub fn buffer_view_for_group(
        &mut self,
        group: &impl UniformSource,
    ) -> Result<BufferView<B>, UniformError> {
        let offset = self.place(group)?;
        Ok(self.buffer_view(offset / self.config.min_alignment))
    }

    pub fn bind_group_for_array(&mut self, values: &[f32]) -> Result<Rc<B::BindGroup>, UniformError> {
        let offset = self.place_array(values)?;
        Ok(self.bind_group(offset / self.config.min_alignment))
    }

    pub fn buffer_view_for_array(&mut self, values: &[f32]) -> Result<BufferView<B>, UniformError> {
        let offset = self.place_array(values)?;
        Ok(self.buffer_view(offset / self.config.min_alignment))
    }

    /// View for alignment bucket `index`, created on first use.
    pub fn buffer_view(&mut self, index: usize) -> BufferView<B> {
        self.sync_cache_generation();
        if let Some(Some(view)) = self.views.get(index) {
            return view.clone();
        }

        let total = self.config.total_buffers();
        let buffer = Rc::clone(&self.mirrors.borrow().current.buffers[index % total]);
        let view = BufferView {
            buffer,
            offset: ((index / total) * self.config.granularity) as u64,
            size: self.config.min_alignment as u64,
        };

        if self.views.len() <= index {
            self.views.resize_with(index + 1, || None);
        }
        self.views[index] = Some(view.clone());
        view
    }

    /// Bind group for alignment bucket `index`, created on first use.
    pub fn bind_group(&mut self, index: usize) -> Rc<B::BindGroup> {
        self.sync_cache_generation();
        if let Some(Some(bind_group)) = self.bind_groups.get(index) {
            return Rc::clone(bind_group);
        }

        let view = self.buffer_view(index);
        let bind_group = Rc::new(self.backend.create_uniform_bind_group(
            &view.buffer,
            view.offset,
            view.size,
        ));

        if self.bind_groups.len() <= index {
            self.bind_groups.resize_with(index + 1, || None);
        }
        self.bind_groups[index] = Some(Rc::clone(&bind_group));
        bind_group
    }

    /// Upload everything placed this frame: one write into the primary
    /// buffer, then one copy per secondary, in a single submission.
    pub fn flush_frame(&mut self) -> Result<(), UniformError> {
        if self.phase == FramePhase::Flushed {
            return Err(UniformError::AlreadyFlushed);
        }
        self.phase = FramePhase::Flushed;

        let cursor = self.arena.byte_index();
        if cursor == 0 {
            return Ok(());
        }

        let mirrors = self.mirrors.borrow();
        let bytes: &[u8] = bytemuck::cast_slice(self.arena.data());
        let mut batch = self.backend.begin_batch("uniform batch upload");
        let mut copies = 0;

        for set in mirrors.retired.iter().chain(std::iter::once(&mirrors.current)) {
            let end = cursor.min(set.size as usize);
            let Some((primary, secondaries)) = set.buffers.split_first() else {
                continue;
            };
            self.backend.write_buffer(primary, 0, &bytes[..end]);

            for (phase, secondary) in secondaries.iter().enumerate() {
                let source_offset = (phase + 1) * self.config.min_alignment;
                let size = end.saturating_sub(source_offset);
                if size == 0 {
                    continue;
                }
                self.backend.copy_buffer_to_buffer(
                    &mut batch,
                    primary,
                    source_offset as u64,
                    secondary,
                    0,
                    size as u64,
                );
                copies += 1;
            }
        }

        self.backend.submit(batch);
        tracing::trace!(bytes = cursor, copies, "uniform batch flushed");
        Ok(())
    }

    /// Forget this frame's placements and rewind the arena.
    pub fn end_frame(&mut self) {
        self.frame_bindings.clear();
        self.arena.reset();
        self.sync_cache_generation();

        let retired = std::mem::take(&mut self.mirrors.borrow_mut().retired);
        for set in retired {
            for buffer in &set.buffers {
                self.backend.destroy_buffer(buffer);
            }
        }
        self.phase = FramePhase::Idle;
    }

    /// Flush, then end the frame.
    pub fn render_end(&mut self) -> Result<(), UniformError> {
        self.flush_frame()?;
        self.end_frame();
        Ok(())
    }

    /// Release every cached binding and mirror buffer.
    pub fn destroy(self) {
        let Self {
            backend,
            mirrors,
            views,
            bind_groups,
            frame_bindings,
            ..
        } = self;
        drop(frame_bindings);
        drop(bind_groups);
        drop(views);

        let mirrors = mirrors.borrow();
        for set in mirrors.retired.iter().chain(std::iter::once(&mirrors.current)) {
            for buffer in &set.buffers {
                backend.destroy_buffer(buffer);
            }
        }
        tracing::debug!("uniform batcher destroyed");
    }

    fn ensure_accumulating(&mut self) -> Result<(), UniformError> {
        match self.phase {
            FramePhase::Flushed => Err(UniformError::PlacementAfterFlush),
            FramePhase::Idle | FramePhase::Accumulating => {
                self.phase = FramePhase::Accumulating;
                Ok(())
            }
        }
    }

    fn place(&mut self, group: &impl UniformSource) -> Result<usize, UniformError> {
        self.ensure_accumulating()?;
        self.arena
            .write_group_with(group.float_len(), |slot| group.write_to(slot))
    }

    fn place_array(&mut self, values: &[f32]) -> Result<usize, UniformError> {
        self.ensure_accumulating()?;
        self.arena.write_group(values)
    }

    /// Drop cached views and bind groups that point at replaced mirrors.
    fn sync_cache_generation(&mut self) {
        let generation = self.mirrors.borrow().generation;
        if generation != self.cache_generation {
            self.views.clear();
            self.bind_groups.clear();
            self.cache_generation = generation;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::testing::{RecordingBackend, TestBindGroup};
    use crate::uniform::UniformGroup;

    fn batcher(config: UniformBatchConfig) -> (Rc<RecordingBackend>, UniformBatcher<RecordingBackend>) {
        let backend = Rc::new(RecordingBackend::default());
        let batcher = UniformBatcher::new(backend.clone(), config).unwrap();
        (backend, batcher)
    }

    fn small(initial_capacity: usize) -> UniformBatchConfig {
        UniformBatchConfig {
            min_alignment: 128,
            granularity: 256,
            initial_capacity,
        }
    }

    #[test]
    fn creates_one_mirror_per_phase() {
        let (backend, batcher) = batcher(UniformBatchConfig::default());

        assert_eq!(batcher.total_buffers(), 2);
        assert_eq!(backend.buffer_count(), 2);
        assert!(backend.usage(0).contains(wgpu::BufferUsages::COPY_SRC));
        assert!(!backend.usage(1).contains(wgpu::BufferUsages::COPY_SRC));
        assert!(backend
            .usage(1)
            .contains(wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST));
        assert_eq!(backend.size(0), 65_535 * 4);
    }

    #[test]
    fn rejects_invalid_config() {
        let backend = Rc::new(RecordingBackend::default());
        let result = UniformBatcher::new(
            backend,
            UniformBatchConfig {
                min_alignment: 128,
                granularity: 100,
                initial_capacity: 64,
            },
        );
        assert!(matches!(
            result,
            Err(UniformError::InvalidGranularity { granularity: 100, .. })
        ));
    }

    #[test]
    fn slots_alternate_between_mirrors() {
        let (_backend, mut batcher) = batcher(small(1024));
        let groups: Vec<_> = (0..4).map(|i| UniformGroup::new(vec![i as f32])).collect();

        let bound: Vec<TestBindGroup> = groups
            .iter()
            .map(|group| *batcher.bind_group_for(group, false).unwrap())
            .collect();

        let expected = [(0, 0), (1, 0), (0, 256), (1, 256)].map(|(buffer, offset)| TestBindGroup {
            buffer,
            offset,
            size: 128,
        });
        assert_eq!(bound, expected);
    }

    #[test]
    fn group_is_placed_once_per_frame() {
        let (_backend, mut batcher) = batcher(small(1024));
        let group = UniformGroup::new(vec![1.0, 2.0]);

        let first = batcher.bind_group_for(&group, false).unwrap();
        let again = batcher.bind_group_for(&group, false).unwrap();
        assert!(Rc::ptr_eq(&first, &again));
        assert_eq!(batcher.arena().byte_index(), 128);

        let duplicate = batcher.bind_group_for(&group, true).unwrap();
        assert_eq!(duplicate.buffer, 1);
        assert_eq!(batcher.arena().byte_index(), 256);
    }

    #[test]
    fn views_and_bind_groups_are_cached_per_bucket() {
        let (_backend, mut batcher) = batcher(small(1024));
        let view = batcher.buffer_view(5);
        assert_eq!(*view.buffer, 1);
        assert_eq!(view.offset, 512);
        assert_eq!(view.size, 128);
        assert!(Rc::ptr_eq(&view.buffer, &batcher.buffer_view(5).buffer));

        let bind_group = batcher.bind_group(5);
        assert!(Rc::ptr_eq(&bind_group, &batcher.bind_group(5)));
    }

    #[test]
    fn flush_uploads_primary_and_copies_phases() {
        let (backend, mut batcher) = batcher(small(1024));
        for i in 0..3 {
            let values = [i as f32 + 1.0, i as f32 + 10.0];
            batcher.bind_group_for_array(&values).unwrap();
        }

        batcher.flush_frame().unwrap();

        assert_eq!(backend.writes.get(), 1);
        assert_eq!(backend.submits.get(), 1);
        assert_eq!(backend.copies.borrow().len(), 1);
        let copy = backend.copies.borrow()[0];
        assert_eq!((copy.source, copy.source_offset), (0, 128));
        assert_eq!((copy.destination, copy.destination_offset), (1, 0));
        assert_eq!(copy.size, 384 - 128);

        // Slot 1 sits at offset 0 of the second mirror, slot 2 at 256 of the first.
        assert_eq!(backend.floats(0, 0, 2), vec![1.0, 10.0]);
        assert_eq!(backend.floats(1, 0, 2), vec![2.0, 11.0]);
        assert_eq!(backend.floats(0, 256, 2), vec![3.0, 12.0]);
    }

    #[test]
    fn wider_granularity_uses_more_mirrors() {
        let (backend, mut batcher) = batcher(UniformBatchConfig {
            min_alignment: 128,
            granularity: 512,
            initial_capacity: 1024,
        });
        for i in 0..6 {
            batcher.buffer_view_for_array(&[i as f32]).unwrap();
        }

        batcher.flush_frame().unwrap();

        let copies = backend.copies.borrow();
        let phases: Vec<_> = copies.iter().map(|copy| (copy.source_offset, copy.size)).collect();
        assert_eq!(phases, vec![(128, 640), (256, 512), (384, 384)]);

        let view = batcher.buffer_view(5);
        assert_eq!((*view.buffer, view.offset), (1, 512));
        assert_eq!(backend.floats(1, 512, 1), vec![5.0]);
    }

    #[test]
    fn placement_after_flush_is_rejected() {
        let (_backend, mut batcher) = batcher(small(1024));
        let group = UniformGroup::new(vec![1.0]);
        batcher.bind_group_for(&group, false).unwrap();
        batcher.flush_frame().unwrap();

        assert_eq!(
            batcher.bind_group_for(&group, false).unwrap_err(),
            UniformError::PlacementAfterFlush
        );
        assert!(matches!(
            batcher.buffer_view_for_array(&[1.0]),
            Err(UniformError::PlacementAfterFlush)
        ));
        assert_eq!(batcher.flush_frame(), Err(UniformError::AlreadyFlushed));
    }

    #[test]
    fn end_frame_resets_arena_and_memo() {
        let (_backend, mut batcher) = batcher(small(1024));
        let group = UniformGroup::new(vec![1.0]);
        let other = UniformGroup::new(vec![2.0]);
        batcher.bind_group_for(&other, false).unwrap();
        batcher.bind_group_for(&group, false).unwrap();

        batcher.render_end().unwrap();
        assert_eq!(batcher.phase(), FramePhase::Idle);
        assert_eq!(batcher.arena().byte_index(), 0);

        let bound = batcher.bind_group_for(&group, false).unwrap();
        assert_eq!(bound.buffer, 0);
        assert_eq!(batcher.arena().byte_index(), 128);
    }

    #[test]
    fn empty_frame_submits_nothing() {
        let (backend, mut batcher) = batcher(small(1024));
        batcher.render_end().unwrap();
        assert_eq!(backend.submits.get(), 0);
        assert_eq!(backend.writes.get(), 0);
    }

    #[test]
    fn oversized_group_leaves_batch_untouched() {
        let (_backend, mut batcher) = batcher(small(1024));
        let group = UniformGroup::new(vec![0.0; 33]);

        assert_eq!(
            batcher.bind_group_for(&group, false).unwrap_err(),
            UniformError::GroupTooLarge {
                bytes: 132,
                alignment: 128,
            }
        );
        assert_eq!(batcher.arena().byte_index(), 0);
    }

    #[test]
    fn growth_mid_frame_keeps_earlier_bindings_valid() {
        // 64 floats = two slots before the arena has to grow.
        let (backend, mut batcher) = batcher(small(64));
        let early = batcher.bind_group_for_array(&[1.0]).unwrap();
        batcher.bind_group_for_array(&[2.0]).unwrap();
        assert_eq!(backend.buffer_count(), 2);

        let late = batcher.bind_group_for_array(&[3.0]).unwrap();

        assert_eq!(backend.buffer_count(), 4);
        assert_eq!(backend.size(2), 512);
        assert_eq!(early.buffer, 0);
        assert_eq!(*late, TestBindGroup { buffer: 2, offset: 256, size: 128 });
        assert!(Rc::ptr_eq(&batcher.mirror_buffers()[0], &batcher.buffer_view(0).buffer));

        batcher.flush_frame().unwrap();

        assert_eq!(backend.submits.get(), 1);
        assert_eq!(backend.floats(0, 0, 1), vec![1.0]);
        assert_eq!(backend.floats(1, 0, 1), vec![2.0]);
        assert_eq!(backend.floats(2, 256, 1), vec![3.0]);
        assert_eq!(backend.floats(3, 0, 1), vec![2.0]);

        batcher.end_frame();
        assert!(backend.is_destroyed(0));
        assert!(backend.is_destroyed(1));
        assert!(!backend.is_destroyed(2));
    }

    #[test]
    fn mirrors_survive_idle_frames() {
        let (backend, mut batcher) = batcher(small(1024));
        let first = Rc::clone(&batcher.mirror_buffers()[0]);
        batcher.bind_group_for_array(&[1.0]).unwrap();
        batcher.render_end().unwrap();

        for _ in 0..100 {
            batcher.render_end().unwrap();
        }

        assert_eq!(backend.buffer_count(), 2);
        assert!(!backend.is_destroyed(0));
        assert!(!backend.is_destroyed(1));
        assert!(Rc::ptr_eq(&first, &batcher.mirror_buffers()[0]));
    }

    #[test]
    fn destroy_releases_all_buffers() {
        let (backend, mut batcher) = batcher(small(64));
        for i in 0..3 {
            batcher.bind_group_for_array(&[i as f32]).unwrap();
        }

        batcher.destroy();

        assert_eq!(backend.buffer_count(), 4);
        assert!((0..4).all(|buffer| backend.is_destroyed(buffer)));
    }
}
