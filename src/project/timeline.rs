//! Time signatures and metronome tick synthesis
//!
//! The timeline holds the project's meter automation; the playback cache
//! asks it for a synthetic click track when the metronome flag is on.

use crate::audio::midi::{BeatMessage, MidiMessage};

/// GM percussion channel, where the click notes go
const METRONOME_CHANNEL: u8 = 10;
/// High wood block, the accented downbeat
const DOWNBEAT_KEY: u8 = 76;
/// Low wood block, every other tick
const TICK_KEY: u8 = 77;

const DOWNBEAT_VELOCITY: u8 = 116;
const TICK_VELOCITY: u8 = 84;

/// A meter change at a beat position
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TimeSignature {
    pub beat: f32,
    pub numerator: u8,
    pub denominator: u8,
}

impl TimeSignature {
    pub fn new(beat: f32, numerator: u8, denominator: u8) -> Self {
        Self { beat, numerator, denominator }
    }

    /// One metronome step in quarter-notes
    fn step(&self) -> f32 {
        4.0 / self.denominator.max(1) as f32
    }
}

/// The project's meter map, sorted by beat
#[derive(Debug, Clone, Default)]
pub struct Timeline {
    signatures: Vec<TimeSignature>,
}

impl Timeline {
    pub fn new(mut signatures: Vec<TimeSignature>) -> Self {
        signatures.sort_by(|a, b| a.beat.partial_cmp(&b.beat).unwrap_or(std::cmp::Ordering::Equal));
        Self { signatures }
    }

    pub fn signatures(&self) -> &[TimeSignature] {
        &self.signatures
    }

    /// Synthesize click notes covering `[first_beat, last_beat)`
    ///
    /// Without any signature the whole range is treated as 4/4 anchored at
    /// `first_beat`; each signature re-anchors the bar grid at its beat.
    pub fn metronome_ticks(&self, first_beat: f32, last_beat: f32) -> Vec<BeatMessage> {
        let mut anchors: Vec<TimeSignature> = Vec::new();
        match self.signatures.first() {
            Some(sig) if sig.beat <= first_beat => {}
            _ => anchors.push(TimeSignature::new(first_beat, 4, 4)),
        }
        anchors.extend(self.signatures.iter().copied());

        let mut out = Vec::new();
        for (i, anchor) in anchors.iter().enumerate() {
            let segment_end = anchors
                .get(i + 1)
                .map(|next| next.beat)
                .unwrap_or(last_beat)
                .min(last_beat);

            let step = anchor.step();
            if step <= 0.0 || segment_end <= anchor.beat {
                continue;
            }

            let mut tick = 0u32;
            loop {
                let beat = anchor.beat + tick as f32 * step;
                if beat >= segment_end {
                    break;
                }

                if beat >= first_beat {
                    let downbeat = tick % anchor.numerator.max(1) as u32 == 0;
                    let (key, velocity) = if downbeat {
                        (DOWNBEAT_KEY, DOWNBEAT_VELOCITY)
                    } else {
                        (TICK_KEY, TICK_VELOCITY)
                    };

                    let off_beat = beat + step * 0.5;
                    out.push(BeatMessage::with_off_beat(
                        beat,
                        MidiMessage::note_on(key, velocity, METRONOME_CHANNEL),
                        off_beat,
                    ));
                    out.push(BeatMessage::new(
                        off_beat,
                        MidiMessage::note_off(key, METRONOME_CHANNEL),
                    ));
                }

                tick += 1;
            }
        }

        out.sort_by(|a, b| a.beat.partial_cmp(&b.beat).unwrap_or(std::cmp::Ordering::Equal));
        out
    }
}
