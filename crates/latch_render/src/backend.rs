//! Rendering backend abstraction
//!
//! The uniform batcher and managed resources only need a handful of native
//! operations. [`GpuBackend`] names them so the bookkeeping can be exercised
//! without a device; [`WgpuBackend`] is the real implementation.

use crate::{BackendType, DeviceCapabilities};

/// Native buffer, bind group and command primitives.
pub trait GpuBackend {
    type Buffer;
    type BindGroup;
    type CommandBatch;

    fn create_buffer(&self, label: &str, size: u64, usage: wgpu::BufferUsages) -> Self::Buffer;

    /// Queue a CPU-side write. Lands before the next submitted batch.
    fn write_buffer(&self, buffer: &Self::Buffer, offset: u64, data: &[u8]);

    /// Bind group exposing `size` bytes of `buffer` at `offset` as a uniform
    /// at binding 0.
    fn create_uniform_bind_group(
        &self,
        buffer: &Self::Buffer,
        offset: u64,
        size: u64,
    ) -> Self::BindGroup;

    fn begin_batch(&self, label: &str) -> Self::CommandBatch;

    fn copy_buffer_to_buffer(
        &self,
        batch: &mut Self::CommandBatch,
        source: &Self::Buffer,
        source_offset: u64,
        destination: &Self::Buffer,
        destination_offset: u64,
        size: u64,
    );

    fn submit(&self, batch: Self::CommandBatch);

    fn destroy_buffer(&self, buffer: &Self::Buffer);
}

/// [`GpuBackend`] over a wgpu device and queue.
pub struct WgpuBackend {
    device: wgpu::Device,
    queue: wgpu::Queue,
    uniform_layout: wgpu::BindGroupLayout,
}

impl WgpuBackend {
    pub fn new(device: wgpu::Device, queue: wgpu::Queue) -> Self {
        let uniform_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("latch uniform group"),
            entries: &[wgpu::BindGroupLayoutEntry {
                binding: 0,
                visibility: wgpu::ShaderStages::VERTEX_FRAGMENT,
                ty: wgpu::BindingType::Buffer {
                    ty: wgpu::BufferBindingType::Uniform,
                    has_dynamic_offset: false,
                    min_binding_size: None,
                },
                count: None,
            }],
        });
        Self {
            device,
            queue,
            uniform_layout,
        }
    }

    pub fn device(&self) -> &wgpu::Device {
        &self.device
    }

    pub fn queue(&self) -> &wgpu::Queue {
        &self.queue
    }

    /// Layout every uniform bind group handed out by this backend uses.
    pub fn uniform_layout(&self) -> &wgpu::BindGroupLayout {
        &self.uniform_layout
    }
}

impl GpuBackend for WgpuBackend {
    type Buffer = wgpu::Buffer;
    type BindGroup = wgpu::BindGroup;
    type CommandBatch = wgpu::CommandEncoder;

    fn create_buffer(&self, label: &str, size: u64, usage: wgpu::BufferUsages) -> wgpu::Buffer {
        self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some(label),
            size,
            usage,
            mapped_at_creation: false,
        })
    }

    fn write_buffer(&self, buffer: &wgpu::Buffer, offset: u64, data: &[u8]) {
        self.queue.write_buffer(buffer, offset, data);
    }

    fn create_uniform_bind_group(
        &self,
        buffer: &wgpu::Buffer,
        offset: u64,
        size: u64,
    ) -> wgpu::BindGroup {
        self.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("latch uniform batch"),
            layout: &self.uniform_layout,
            entries: &[wgpu::BindGroupEntry {
                binding: 0,
                resource: wgpu::BindingResource::Buffer(wgpu::BufferBinding {
                    buffer,
                    offset,
                    size: wgpu::BufferSize::new(size),
                }),
            }],
        })
    }

    fn begin_batch(&self, label: &str) -> wgpu::CommandEncoder {
        self.device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor { label: Some(label) })
    }

    fn copy_buffer_to_buffer(
        &self,
        batch: &mut wgpu::CommandEncoder,
        source: &wgpu::Buffer,
        source_offset: u64,
        destination: &wgpu::Buffer,
        destination_offset: u64,
        size: u64,
    ) {
        batch.copy_buffer_to_buffer(source, source_offset, destination, destination_offset, size);
    }

    fn submit(&self, batch: wgpu::CommandEncoder) {
        self.queue.submit(std::iter::once(batch.finish()));
    }

    fn destroy_buffer(&self, buffer: &wgpu::Buffer) {
        buffer.destroy();
    }
}

/// Probe what the adapter offers.
pub fn probe_capabilities(adapter: &wgpu::Adapter) -> DeviceCapabilities {
    let info = adapter.get_info();
    let limits = adapter.limits();
    let backend = match info.backend {
        wgpu::Backend::Vulkan => BackendType::Vulkan,
        wgpu::Backend::Metal => BackendType::Metal,
        wgpu::Backend::Dx12 => BackendType::DirectX12,
        wgpu::Backend::Gl => BackendType::OpenGL,
        wgpu::Backend::BrowserWebGpu => BackendType::WebGpu,
        wgpu::Backend::Empty => BackendType::Empty,
    };

    DeviceCapabilities {
        backend,
        adapter_name: info.name,
        min_uniform_buffer_offset_alignment: limits.min_uniform_buffer_offset_alignment,
        max_uniform_buffer_binding_size: limits.max_uniform_buffer_binding_size,
    }
}

/// In-memory backend that simulates buffer contents.
#[cfg(test)]
pub(crate) mod testing {
    use super::GpuBackend;
    use std::cell::{Cell, RefCell};

    pub(crate) struct BufferRecord {
        pub label: String,
        pub usage: wgpu::BufferUsages,
        pub bytes: Vec<u8>,
        pub destroyed: bool,
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub(crate) struct TestBindGroup {
        pub buffer: usize,
        pub offset: u64,
        pub size: u64,
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub(crate) struct CopyOp {
        pub source: usize,
        pub source_offset: u64,
        pub destination: usize,
        pub destination_offset: u64,
        pub size: u64,
    }

    #[derive(Default)]
    pub(crate) struct RecordingBackend {
        pub buffers: RefCell<Vec<BufferRecord>>,
        pub writes: Cell<usize>,
        pub submits: Cell<usize>,
        pub copies: RefCell<Vec<CopyOp>>,
    }

    impl RecordingBackend {
        pub fn floats(&self, buffer: usize, byte_offset: usize, len: usize) -> Vec<f32> {
            let buffers = self.buffers.borrow();
            buffers[buffer].bytes[byte_offset..byte_offset + len * 4]
                .chunks_exact(4)
                .map(bytemuck::pod_read_unaligned::<f32>)
                .collect()
        }

        pub fn size(&self, buffer: usize) -> usize {
            self.buffers.borrow()[buffer].bytes.len()
        }

        pub fn usage(&self, buffer: usize) -> wgpu::BufferUsages {
            self.buffers.borrow()[buffer].usage
        }

        pub fn is_destroyed(&self, buffer: usize) -> bool {
            self.buffers.borrow()[buffer].destroyed
        }

        pub fn buffer_count(&self) -> usize {
            self.buffers.borrow().len()
        }
    }

    impl GpuBackend for RecordingBackend {
        type Buffer = usize;
        type BindGroup = TestBindGroup;
        type CommandBatch = Vec<CopyOp>;

        fn create_buffer(&self, label: &str, size: u64, usage: wgpu::BufferUsages) -> usize {
            let mut buffers = self.buffers.borrow_mut();
            buffers.push(BufferRecord {
                label: label.to_string(),
                usage,
                bytes: vec![0; size as usize],
                destroyed: false,
            });
            buffers.len() - 1
        }

        fn write_buffer(&self, buffer: &usize, offset: u64, data: &[u8]) {
            let mut buffers = self.buffers.borrow_mut();
            let record = &mut buffers[*buffer];
            assert!(!record.destroyed, "write to destroyed buffer {}", record.label);
            let offset = offset as usize;
            record.bytes[offset..offset + data.len()].copy_from_slice(data);
            self.writes.set(self.writes.get() + 1);
        }

        fn create_uniform_bind_group(&self, buffer: &usize, offset: u64, size: u64) -> TestBindGroup {
            TestBindGroup {
                buffer: *buffer,
                offset,
                size,
            }
        }

        fn begin_batch(&self, _label: &str) -> Vec<CopyOp> {
            Vec::new()
        }

        fn copy_buffer_to_buffer(
            &self,
            batch: &mut Vec<CopyOp>,
            source: &usize,
            source_offset: u64,
            destination: &usize,
            destination_offset: u64,
            size: u64,
        ) {
            batch.push(CopyOp {
                source: *source,
                source_offset,
                destination: *destination,
                destination_offset,
                size,
            });
        }

        fn submit(&self, batch: Vec<CopyOp>) {
            let mut buffers = self.buffers.borrow_mut();
            for op in &batch {
                let from = op.source_offset as usize;
                let to = op.destination_offset as usize;
                let size = op.size as usize;
                let chunk = buffers[op.source].bytes[from..from + size].to_vec();
                buffers[op.destination].bytes[to..to + size].copy_from_slice(&chunk);
            }
            self.copies.borrow_mut().extend(batch);
            self.submits.set(self.submits.get() + 1);
        }

        fn destroy_buffer(&self, buffer: &usize) {
            self.buffers.borrow_mut()[*buffer].destroyed = true;
        }
    }
}
