//! Precomputed playback streams
//!
//! The cache is built once per project change: every track's sequence is
//! expanded into a beat-sorted message list bound to its instrument. Once
//! published the data is immutable; readers take value copies that share
//! the message storage but own their cursors, so several player workers can
//! traverse the same snapshot without stepping on each other.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::audio::midi::{BeatMessage, MidiMessage};
use crate::audio::orchestra::Instrument;

/// One track's worth of ready-to-dispatch messages
pub struct CachedTrack {
    /// Id of the source track, used by targeted sound probing
    pub track_id: String,
    pub instrument: Arc<dyn Instrument>,
    /// Beat-sorted; ties keep export order
    pub messages: Vec<BeatMessage>,
}

/// A message pulled out of the merged stream
pub struct CacheMessage {
    pub beat: f32,
    pub message: MidiMessage,
    pub off_beat: Option<f32>,
    pub instrument: Arc<dyn Instrument>,
}

/// The published set of cached tracks
///
/// Cloning is cheap (the track data is reference-counted) and gives the
/// clone a fresh set of cursors; the lock below only serializes cursor
/// advances between readers sharing one copy.
pub struct PlaybackCache {
    tracks: Arc<Vec<CachedTrack>>,
    unique_instruments: Arc<Vec<Arc<dyn Instrument>>>,
    cursors: Mutex<Vec<usize>>,
}

impl Default for PlaybackCache {
    fn default() -> Self {
        Self::publish(Vec::new())
    }
}

impl Clone for PlaybackCache {
    fn clone(&self) -> Self {
        Self {
            tracks: Arc::clone(&self.tracks),
            unique_instruments: Arc::clone(&self.unique_instruments),
            cursors: Mutex::new(vec![0; self.tracks.len()]),
        }
    }
}

impl PlaybackCache {
    /// Publish a built cache; empty tracks are dropped here
    pub fn publish(tracks: Vec<CachedTrack>) -> Self {
        let tracks: Vec<CachedTrack> =
            tracks.into_iter().filter(|t| !t.messages.is_empty()).collect();

        let mut unique_instruments: Vec<Arc<dyn Instrument>> = Vec::new();
        for track in &tracks {
            if !unique_instruments.iter().any(|i| Arc::ptr_eq(i, &track.instrument)) {
                unique_instruments.push(Arc::clone(&track.instrument));
            }
        }

        let cursors = Mutex::new(vec![0; tracks.len()]);
        Self {
            tracks: Arc::new(tracks),
            unique_instruments: Arc::new(unique_instruments),
            cursors,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.tracks.is_empty()
    }

    /// Every instrument referenced by at least one cached track
    pub fn unique_instruments(&self) -> &[Arc<dyn Instrument>] {
        &self.unique_instruments
    }

    /// Sample rate of the first instrument, 0 when empty
    pub fn sample_rate(&self) -> f64 {
        self.tracks.first().map(|t| t.instrument.sample_rate()).unwrap_or(0.0)
    }

    /// Output channel count of the first instrument, 0 when empty
    pub fn num_output_channels(&self) -> usize {
        self.tracks
            .first()
            .map(|t| t.instrument.num_output_channels())
            .unwrap_or(0)
    }

    /// Rewind all cursors to the beginning
    pub fn seek_to_start(&self) {
        for cursor in self.cursors.lock().iter_mut() {
            *cursor = 0;
        }
    }

    /// Position each cursor at the first message with beat >= target
    pub fn seek_to_beat(&self, beat: f32) {
        let mut cursors = self.cursors.lock();
        for (track, cursor) in self.tracks.iter().zip(cursors.iter_mut()) {
            *cursor = track.messages.partition_point(|m| m.beat < beat);
        }
    }

    /// Pull the globally earliest unconsumed message
    ///
    /// Ties between tracks resolve to the lowest track index, so the merged
    /// order is total and stable.
    pub fn next_message(&self) -> Option<CacheMessage> {
        let mut cursors = self.cursors.lock();

        let mut min_beat = f32::INFINITY;
        let mut found: Option<usize> = None;

        for (i, (track, cursor)) in self.tracks.iter().zip(cursors.iter()).enumerate() {
            if let Some(message) = track.messages.get(*cursor) {
                if message.beat < min_beat {
                    min_beat = message.beat;
                    found = Some(i);
                }
            }
        }

        let i = found?;
        let track = &self.tracks[i];
        let message = track.messages[cursors[i]];
        cursors[i] += 1;

        Some(CacheMessage {
            beat: message.beat,
            message: message.message,
            off_beat: message.off_beat,
            instrument: Arc::clone(&track.instrument),
        })
    }

    /// Note ons of notes sounding at `beat` (on <= beat < off)
    ///
    /// Optionally limited to a single source track. Does not touch cursors.
    pub fn sounding_notes_at(
        &self,
        beat: f32,
        track_id: Option<&str>,
    ) -> Vec<(Arc<dyn Instrument>, MidiMessage)> {
        let mut result = Vec::new();
        for track in self.tracks.iter() {
            if let Some(id) = track_id {
                if track.track_id != id {
                    continue;
                }
            }
            for message in &track.messages {
                if message.beat > beat {
                    break;
                }
                if let Some(off_beat) = message.off_beat {
                    if message.beat <= beat && off_beat > beat {
                        result.push((Arc::clone(&track.instrument), message.message));
                    }
                }
            }
        }
        result
    }
}
