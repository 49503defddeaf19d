//! Latch Engine Runtime
//!
//! Boots a headless device and drives the resource reaper and the uniform
//! batcher through a simulated frame loop.
//!
//! Usage: `latch [settings.json] [frames]`

use anyhow::{Context, Result};
use latch_core::{FrameScheduler, ManualClock};
use latch_render::wgpu;
use latch_render::{
    probe_capabilities, DeviceCapabilities, ManagedBuffer, Reaper, RenderSettings,
    Trackable, UniformBatcher, UniformGroup, WgpuBackend,
};
use std::rc::Rc;
use tracing_subscriber::EnvFilter;

/// Simulated time per frame.
const FRAME_MS: u64 = 16;
const DEFAULT_FRAMES: u64 = 6_000;
const BUFFER_COUNT: usize = 8;

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    tracing::info!("Latch Engine v{}", latch_core::VERSION);

    let mut args = std::env::args().skip(1);
    let settings = load_settings(args.next())?;
    let frames = match args.next() {
        Some(raw) => raw
            .parse::<u64>()
            .with_context(|| format!("invalid frame count '{raw}'"))?,
        None => DEFAULT_FRAMES,
    };

    let (backend, capabilities) =
        pollster::block_on(init_headless()).context("failed to initialise a headless GPU device")?;
    tracing::info!(
        adapter = %capabilities.adapter_name,
        backend = ?capabilities.backend,
        uniform_alignment = capabilities.min_uniform_buffer_offset_alignment,
        "device ready"
    );

    run_frames(Rc::new(backend), &capabilities, settings, frames)
}

fn load_settings(path: Option<String>) -> Result<RenderSettings> {
    let Some(path) = path else {
        tracing::info!("no settings file given, using defaults");
        return Ok(RenderSettings::default());
    };

    let json = std::fs::read_to_string(&path)
        .with_context(|| format!("failed to read settings from {path}"))?;
    let settings = RenderSettings::from_json_str(&json)
        .with_context(|| format!("invalid settings in {path}"))?;
    tracing::info!(%path, "loaded render settings");
    Ok(settings)
}

async fn init_headless() -> Result<(WgpuBackend, DeviceCapabilities)> {
    let instance = wgpu::Instance::new(wgpu::InstanceDescriptor {
        backends: wgpu::Backends::all(),
        ..Default::default()
    });

    let adapter = instance
        .request_adapter(&wgpu::RequestAdapterOptions {
            power_preference: wgpu::PowerPreference::default(),
            compatible_surface: None,
            force_fallback_adapter: false,
        })
        .await
        .context("no suitable GPU adapter")?;
    let capabilities = probe_capabilities(&adapter);

    let (device, queue) = adapter
        .request_device(
            &wgpu::DeviceDescriptor {
                label: Some("Latch Device"),
                required_features: wgpu::Features::empty(),
                required_limits: wgpu::Limits::downlevel_defaults().using_resolution(adapter.limits()),
                memory_hints: wgpu::MemoryHints::default(),
            },
            None,
        )
        .await
        .context("failed to create device")?;

    Ok((WgpuBackend::new(device, queue), capabilities))
}

fn run_frames(
    backend: Rc<WgpuBackend>,
    capabilities: &DeviceCapabilities,
    settings: RenderSettings,
    frames: u64,
) -> Result<()> {
    let clock = Rc::new(ManualClock::new(0));
    let scheduler = Rc::new(FrameScheduler::new(clock.clone()));
    let reaper = Reaper::with_config(clock.clone(), scheduler.clone(), settings.gc);

    let batch_config = capabilities.uniform_batch_config(settings.uniform_batch);
    let mut batcher = UniformBatcher::new(backend.clone(), batch_config)
        .context("invalid uniform batch layout")?;

    // Even buffers are used every frame, odd ones only once.
    let buffers: Vec<_> = (0..BUFFER_COUNT)
        .map(|index| {
            ManagedBuffer::new(
                backend.clone(),
                reaper.clone(),
                clock.clone(),
                format!("instance data {index}"),
                1024,
                wgpu::BufferUsages::VERTEX | wgpu::BufferUsages::COPY_DST,
            )
        })
        .collect();

    let mut sprites: Vec<_> = (0..16)
        .map(|index| UniformGroup::new(vec![index as f32, 0.0, 0.0, 1.0]))
        .collect();

    for frame in 0..frames {
        for (index, buffer) in buffers.iter().enumerate() {
            if frame == 0 || index % 2 == 0 {
                buffer.write(0, &frame.to_le_bytes());
            }
        }

        for (index, sprite) in sprites.iter_mut().enumerate() {
            sprite.set(1, frame as f32);
            batcher.bind_group_for(&*sprite, false)?;
            if index == 0 {
                batcher.bind_group_for(&*sprite, true)?;
            }
        }
        batcher.bind_group_for_array(&[frame as f32; 4])?;
        batcher.render_end()?;

        let status = backend.device().poll(wgpu::Maintain::Poll);
        tracing::trace!(queue_empty = status.is_queue_empty(), "device polled");
        clock.advance(FRAME_MS);
        scheduler.update();
    }

    let resident = buffers.iter().filter(|buffer| buffer.is_resident()).count();
    let tracked = buffers
        .iter()
        .filter(|buffer| buffer.gc_state().is_tracked())
        .count();
    tracing::info!(
        frames,
        simulated_ms = frames * FRAME_MS,
        resident,
        tracked,
        reaper_tracked = reaper.tracked_count(),
        "frame loop finished"
    );

    reaper.destroy();
    batcher.destroy();
    Ok(())
}
