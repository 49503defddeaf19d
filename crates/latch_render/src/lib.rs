//! Latch Render System
//!
//! GPU resource lifetime management and per-frame uniform batching on top
//! of wgpu.

pub mod backend;
pub mod config;
pub mod error;
pub mod gc;
pub mod resource;
pub mod uniform;

pub use wgpu;

pub use backend::{probe_capabilities, GpuBackend, WgpuBackend};
pub use config::{GcConfig, RenderSettings, UniformBatchConfig, COMPACTION_THRESHOLD};
pub use error::{ConfigError, UniformError};
pub use gc::{
    GcState, ManagedArray, ManagedMap, Reaper, ResourceKind, SweepReport, Trackable,
    TrackingRecord,
};
pub use resource::ManagedBuffer;
pub use uniform::{BufferView, UniformArena, UniformBatcher, UniformGroup, UniformSource};

/// Rendering backend type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendType {
    /// Metal (macOS, iOS)
    Metal,
    /// DirectX 12 (Windows)
    DirectX12,
    /// Vulkan (cross-platform)
    Vulkan,
    /// OpenGL / GLES (cross-platform, fallback)
    OpenGL,
    /// WebGPU in a browser
    WebGpu,
    /// No real device
    Empty,
}

/// Capability probe result
#[derive(Debug, Clone)]
pub struct DeviceCapabilities {
    pub backend: BackendType,
    pub adapter_name: String,
    /// Binding offsets into uniform buffers must be multiples of this.
    pub min_uniform_buffer_offset_alignment: u32,
    pub max_uniform_buffer_binding_size: u32,
}

impl DeviceCapabilities {
    /// Adapt a batch layout to this device: the device's offset alignment
    /// becomes the granularity, never below the slot size.
    pub fn uniform_batch_config(&self, base: UniformBatchConfig) -> UniformBatchConfig {
        let granularity = (self.min_uniform_buffer_offset_alignment as usize).max(base.min_alignment);
        UniformBatchConfig {
            granularity,
            ..base
        }
    }
}
