//! The audio side of the sequencer core
//!
//! Provides:
//! - MIDI message types and per-instrument queues
//! - The instrument/orchestra interface
//! - The transport: playback, looping, recording arm, rendering, previews

pub mod midi;
pub mod orchestra;
pub mod transport;
