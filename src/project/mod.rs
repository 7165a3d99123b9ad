//! Read-only project model
//!
//! The transport does not edit any of this; it observes tracks, clips and
//! the timeline, and rebuilds its playback cache when the owner reports a
//! change. Editing, persistence and undo live elsewhere.

pub mod timeline;
pub mod track;

use std::sync::Arc;

use parking_lot::RwLock;

pub use timeline::{TimeSignature, Timeline};
pub use track::{Clip, Track, TrackEvent, TEMPO_CONTROLLER};

/// Shared handle to a track; the owner mutates, the transport reads
pub type TrackRef = Arc<RwLock<Track>>;

/// Wrap a track for sharing with the transport
pub fn track_ref(track: Track) -> TrackRef {
    Arc::new(RwLock::new(track))
}
