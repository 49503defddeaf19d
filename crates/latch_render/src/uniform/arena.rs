//! Bump allocator for per-frame uniform data
//!
//! Groups are packed into one growable `f32` buffer. Every group starts on
//! a `min_alignment` boundary and never spans more than one alignment unit,
//! so its byte offset divided by the alignment is a stable bucket index.

use crate::config::UniformBatchConfig;
use crate::error::UniformError;
use std::fmt;

const FLOAT_BYTES: usize = std::mem::size_of::<f32>();

type ResizeListener = Box<dyn FnMut(&[f32])>;

pub struct UniformArena {
    /// Backing storage. Grows by doubling, never shrinks.
    data: Vec<f32>,
    /// Write cursor in bytes. Always a multiple of `min_alignment`.
    byte_index: usize,
    min_alignment: usize,
    on_resize: Option<ResizeListener>,
}

impl UniformArena {
    pub fn new(config: &UniformBatchConfig) -> Result<Self, UniformError> {
        Self::with_alignment(config.min_alignment, config.initial_capacity)
    }

    /// Create an arena with `initial_capacity` floats of storage.
    pub fn with_alignment(min_alignment: usize, initial_capacity: usize) -> Result<Self, UniformError> {
        if min_alignment == 0 || min_alignment % FLOAT_BYTES != 0 {
            return Err(UniformError::InvalidAlignment {
                alignment: min_alignment,
            });
        }
        if initial_capacity == 0 {
            return Err(UniformError::EmptyArena);
        }
        Ok(Self {
            data: vec![0.0; initial_capacity],
            byte_index: 0,
            min_alignment,
            on_resize: None,
        })
    }

    /// Install the callback invoked with the new storage whenever the arena
    /// grows. It runs before the reservation that caused the growth returns.
    pub fn set_resize_listener(&mut self, listener: impl FnMut(&[f32]) + 'static) {
        self.on_resize = Some(Box::new(listener));
    }

    /// Reserve room for `size` floats and return the group's byte offset.
    ///
    /// Fails without touching the arena if the group would not fit in one
    /// alignment unit.
    pub fn reserve_slot(&mut self, size: usize) -> Result<usize, UniformError> {
        let bytes = match size.checked_mul(FLOAT_BYTES) {
            Some(bytes) if bytes <= self.min_alignment => bytes,
            oversized => {
                return Err(UniformError::GroupTooLarge {
                    bytes: oversized.unwrap_or(usize::MAX),
                    alignment: self.min_alignment,
                })
            }
        };

        let start = self.byte_index;
        let end = (start + bytes).div_ceil(self.min_alignment) * self.min_alignment;
        if end > self.capacity_bytes() {
            self.grow(end);
        }
        self.byte_index = end;
        Ok(start)
    }

    /// Reserve a slot and copy `values` into it.
    pub fn write_group(&mut self, values: &[f32]) -> Result<usize, UniformError> {
        self.write_group_with(values.len(), |slot| slot.copy_from_slice(values))
    }

    /// Reserve `len` floats and let `fill` write them in place.
    pub fn write_group_with(
        &mut self,
        len: usize,
        fill: impl FnOnce(&mut [f32]),
    ) -> Result<usize, UniformError> {
        let offset = self.reserve_slot(len)?;
        let start = offset / FLOAT_BYTES;
        fill(&mut self.data[start..start + len]);
        Ok(offset)
    }

    /// Mutable view of `len` floats starting at `byte_offset`, if in bounds.
    pub fn slot_mut(&mut self, byte_offset: usize, len: usize) -> Option<&mut [f32]> {
        let start = byte_offset / FLOAT_BYTES;
        self.data.get_mut(start..start.checked_add(len)?)
    }

    /// Rewind the cursor. Capacity is kept.
    pub fn reset(&mut self) {
        self.byte_index = 0;
    }

    pub fn data(&self) -> &[f32] {
        &self.data
    }

    /// Bytes reserved so far this frame.
    #[inline]
    pub fn byte_index(&self) -> usize {
        self.byte_index
    }

    #[inline]
    pub fn min_alignment(&self) -> usize {
        self.min_alignment
    }

    #[inline]
    pub fn capacity_bytes(&self) -> usize {
        self.data.len() * FLOAT_BYTES
    }

    fn grow(&mut self, required_bytes: usize) {
        let required = required_bytes.div_ceil(FLOAT_BYTES);
        let previous = self.data.len();
        let mut len = previous;
        while len < required {
            len *= 2;
        }

        self.data.resize(len, 0.0);
        tracing::debug!(from = previous, to = len, "uniform arena grew");

        if let Some(listener) = self.on_resize.as_mut() {
            listener(&self.data);
        }
    }
}

impl fmt::Debug for UniformArena {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UniformArena")
            .field("capacity", &self.data.len())
            .field("byte_index", &self.byte_index)
            .field("min_alignment", &self.min_alignment)
            .field("has_resize_listener", &self.on_resize.is_some())
            .finish()
    }
}
