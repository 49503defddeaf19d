//! Per-frame uniform packing and upload
//!
//! [`UniformArena`] hands out aligned offsets in one growable float buffer;
//! [`UniformBatcher`] turns those offsets into bind groups and uploads the
//! whole arena once per frame.

mod arena;
mod batch;
mod group;

pub use arena::UniformArena;
pub use batch::{BufferView, FramePhase, UniformBatcher};
pub use group::{UniformGroup, UniformGroupId, UniformSource};
