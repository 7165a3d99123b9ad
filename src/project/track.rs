//! Tracks, clips and their expansion into raw MIDI
//!
//! A track is a sequence of beat-stamped events plus a pattern of clips;
//! each clip instantiates the sequence at an offset, optionally transposed,
//! scaled, muted or soloed. `export_midi` renders one clip's worth of the
//! sequence into the message list the playback cache is built from.

use crate::audio::midi::{BeatMessage, MidiMessage};
use crate::audio::orchestra::KeyboardMapping;
use crate::audio::transport::ms_per_beat_from_controller;

/// Controller number carrying tempo automation
pub const TEMPO_CONTROLLER: u8 = 81;

/// One instance of a track's sequence within its pattern
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Clip {
    /// Beat offset applied to every event of the sequence
    pub beat_offset: f32,
    /// Semitone transposition applied to note keys
    pub key_offset: i32,
    /// Velocity multiplier, 0..=1
    pub velocity_scale: f32,
    /// When any clip in the project is soloed, only soloed clips sound
    pub solo: bool,
    pub muted: bool,
}

impl Default for Clip {
    fn default() -> Self {
        Self {
            beat_offset: 0.0,
            key_offset: 0,
            velocity_scale: 1.0,
            solo: false,
            muted: false,
        }
    }
}

impl Clip {
    pub fn at(beat_offset: f32) -> Self {
        Self { beat_offset, ..Self::default() }
    }
}

/// An event in a track's sequence
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TrackEvent {
    Note {
        beat: f32,
        /// MIDI key number (0-127)
        key: u8,
        /// Velocity, 0..=1
        velocity: f32,
        /// Length in beats
        length: f32,
    },
    Automation {
        beat: f32,
        /// Normalized controller value, 0..=1
        value: f32,
    },
}

impl TrackEvent {
    pub fn beat(&self) -> f32 {
        match *self {
            Self::Note { beat, .. } | Self::Automation { beat, .. } => beat,
        }
    }
}

/// A source track: one sequence, one pattern of clips
#[derive(Debug, Clone)]
pub struct Track {
    /// Stable identifier, the key of the transport's instrument links
    pub id: String,
    pub name: String,
    /// Free-form reference resolved against the orchestra (see §resolve)
    pub instrument_id: String,
    /// MIDI channel (1-16) the track's events are tagged with
    pub channel: u8,
    /// Controller number for automation tracks; 0 for note tracks
    pub controller_number: u8,
    pub events: Vec<TrackEvent>,
    /// Clip pattern; an empty pattern exports once through a neutral clip
    pub clips: Vec<Clip>,
}

impl Track {
    /// A note track with no clips
    pub fn new(id: &str, instrument_id: &str) -> Self {
        Self {
            id: id.to_string(),
            name: id.to_string(),
            instrument_id: instrument_id.to_string(),
            channel: 1,
            controller_number: 0,
            events: Vec::new(),
            clips: Vec::new(),
        }
    }

    /// An automation track driving the given controller
    pub fn automation(id: &str, instrument_id: &str, controller_number: u8) -> Self {
        Self {
            controller_number,
            ..Self::new(id, instrument_id)
        }
    }

    pub fn is_tempo_track(&self) -> bool {
        self.controller_number == TEMPO_CONTROLLER
    }

    /// Whether any clip of this track's pattern is soloed
    pub fn has_solo_clips(&self) -> bool {
        self.clips.iter().any(|c| c.solo)
    }

    /// Render one clip of this track into raw beat-stamped MIDI
    ///
    /// Applies the clip transformation and the instrument's keyboard
    /// mapping, skips non-soloed clips while anything is soloed, and keeps
    /// only events inside the project beat range.
    pub fn export_midi(
        &self,
        out: &mut Vec<BeatMessage>,
        clip: &Clip,
        mapping: &KeyboardMapping,
        has_solo_clips: bool,
        first_beat: f32,
        last_beat: f32,
    ) {
        if clip.muted || (has_solo_clips && !clip.solo) {
            return;
        }

        for event in &self.events {
            let beat = event.beat() + clip.beat_offset;
            if beat < first_beat || beat > last_beat {
                continue;
            }

            match *event {
                TrackEvent::Note { key, velocity, length, .. } => {
                    let key = (key as i32 + clip.key_offset).clamp(0, 127) as u8;
                    let (key, channel) = mapping.map(key, self.channel);
                    let velocity =
                        ((velocity * clip.velocity_scale).clamp(0.0, 1.0) * 127.0).round() as u8;
                    let off_beat = beat + length.max(0.0);

                    out.push(BeatMessage::with_off_beat(
                        beat,
                        MidiMessage::note_on(key, velocity, channel),
                        off_beat,
                    ));
                    out.push(BeatMessage::new(off_beat, MidiMessage::note_off(key, channel)));
                }
                TrackEvent::Automation { value, .. } => {
                    if self.is_tempo_track() {
                        out.push(BeatMessage::new(
                            beat,
                            MidiMessage::TempoChange {
                                ms_per_beat: ms_per_beat_from_controller(value),
                            },
                        ));
                    } else {
                        out.push(BeatMessage::new(
                            beat,
                            MidiMessage::controller(
                                self.controller_number,
                                (value.clamp(0.0, 1.0) * 127.0).round() as u8,
                                self.channel,
                            ),
                        ));
                    }
                }
            }
        }
    }
}
