//! backbeat - playback and transport core for a MIDI sequencer
//!
//! Given a musical project (tracks of beat-stamped events plus tempo and
//! meter automation), the transport drives opaque instruments in real time,
//! and supports seeking, looping, MIDI recording arm/disarm, offline
//! rendering to audio files and interactive note previews.
//!
//! The crate deliberately stops at the instrument boundary: instruments
//! receive timestamped MIDI and hand back audio blocks, and everything
//! about how they do that is out of scope.

pub mod audio;
pub mod project;

pub use audio::midi::{MidiDeviceInfo, MidiMessage, MidiMessageQueue, TimedMessage};
pub use audio::orchestra::{Instrument, KeyboardMapping, Orchestra, OrchestraListener};
pub use audio::transport::{
    PlaybackCache, PlaybackContext, RenderFormat, Transport, TransportListener,
};
pub use project::{Clip, TimeSignature, Timeline, Track, TrackEvent};
