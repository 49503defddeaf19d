//! Latch Engine Core
//!
//! Contains the engine-wide primitives shared by every subsystem:
//! - Millisecond clocks (wall and manual)
//! - Cooperative repeating-task scheduler driven by the frame loop

pub mod scheduler;
pub mod time;

pub use scheduler::{FrameScheduler, Scheduler, TaskHandle};
pub use time::{Clock, ManualClock, SystemClock};

/// Engine version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_is_set() {
        assert!(!VERSION.is_empty());
    }
}
