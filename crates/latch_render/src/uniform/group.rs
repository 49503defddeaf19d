use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Identity of a uniform group, used to place it at most once per frame.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct UniformGroupId(u64);

impl UniformGroupId {
    /// Allocate a process-unique id.
    pub fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }

    #[inline]
    pub fn raw(self) -> u64 {
        self.0
    }
}

impl fmt::Display for UniformGroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "uniforms#{}", self.0)
    }
}

/// Anything that can write its uniform values into a batch slot.
pub trait UniformSource {
    fn id(&self) -> UniformGroupId;

    /// Number of floats [`UniformSource::write_to`] writes.
    fn float_len(&self) -> usize;

    /// Write the current values into `out`, which is exactly
    /// `float_len()` long.
    fn write_to(&self, out: &mut [f32]);
}

/// A plain block of uniform floats.
#[derive(Debug, Clone)]
pub struct UniformGroup {
    id: UniformGroupId,
    values: Vec<f32>,
}

impl UniformGroup {
    pub fn new(values: Vec<f32>) -> Self {
        Self {
            id: UniformGroupId::next(),
            values,
        }
    }

    /// Build a group from a `#[repr(C)]` plain-old-data struct. Trailing
    /// bytes that do not fill a whole float are dropped.
    pub fn from_pod<T: bytemuck::Pod>(value: &T) -> Self {
        let values = bytemuck::bytes_of(value)
            .chunks_exact(4)
            .map(bytemuck::pod_read_unaligned::<f32>)
            .collect();
        Self::new(values)
    }

    pub fn id(&self) -> UniformGroupId {
        self.id
    }

    pub fn values(&self) -> &[f32] {
        &self.values
    }

    pub fn values_mut(&mut self) -> &mut [f32] {
        &mut self.values
    }

    /// Overwrite one value. Returns `false` if `index` is out of range.
    pub fn set(&mut self, index: usize, value: f32) -> bool {
        match self.values.get_mut(index) {
            Some(slot) => {
                *slot = value;
                true
            }
            None => false,
        }
    }
}

impl UniformSource for UniformGroup {
    fn id(&self) -> UniformGroupId {
        self.id
    }

    fn float_len(&self) -> usize {
        self.values.len()
    }

    fn write_to(&self, out: &mut [f32]) {
        out.copy_from_slice(&self.values);
    }
}
