//! Idle GPU resource collection
//!
//! Resources embed a [`GcState`] and implement [`Trackable`]. A [`Reaper`]
//! tracks them individually or through [`ManagedMap`] / [`ManagedArray`]
//! groups and unloads whatever has gone unused for longer than the
//! configured window.

mod collection;
mod reaper;
mod state;

pub use collection::{
    CollectionHandle, CollectionKind, ManagedArray, ManagedCollection, ManagedMap,
    ResourceCollection, ResourceGroupHandle,
};
pub use reaper::{Reaper, SweepReport};
pub use state::{GcState, ListenerId, ResourceKind, Trackable, TrackingRecord, UnloadSignal};
