//! MIDI message types and the per-instrument input queue
//!
//! The transport core speaks a small crate-local message vocabulary:
//! channel voice messages, channel mode messages and the tempo meta event
//! that the playback cache embeds into its streams.

use ringbuf::{traits::*, HeapRb};
use std::time::Instant;

use once_cell::sync::Lazy;
use parking_lot::Mutex;

/// MIDI channels are 1-based, as in the wire protocol.
pub const NUM_CHANNELS: u8 = 16;

/// A MIDI message as it travels through the transport core
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum MidiMessage {
    /// Note on event
    NoteOn {
        /// MIDI key number (0-127)
        key: u8,
        /// Velocity (0-127)
        velocity: u8,
        /// MIDI channel (1-16)
        channel: u8,
    },
    /// Note off event
    NoteOff {
        /// MIDI key number (0-127)
        key: u8,
        /// MIDI channel (1-16)
        channel: u8,
    },
    /// Control change
    Controller {
        /// Controller number (0-127)
        number: u8,
        /// Controller value (0-127)
        value: u8,
        /// MIDI channel (1-16)
        channel: u8,
    },
    /// Tempo meta event, carries the new tempo in milliseconds per beat
    TempoChange {
        /// Milliseconds per quarter-note
        ms_per_beat: f64,
    },
    /// Channel mode: all notes off (CC 123)
    AllNotesOff { channel: u8 },
    /// Channel mode: all sound off (CC 120)
    AllSoundOff { channel: u8 },
    /// Channel mode: reset all controllers (CC 121)
    AllControllersOff { channel: u8 },
}

impl MidiMessage {
    /// Create a note on event
    pub fn note_on(key: u8, velocity: u8, channel: u8) -> Self {
        Self::NoteOn { key, velocity, channel }
    }

    /// Create a note off event
    pub fn note_off(key: u8, channel: u8) -> Self {
        Self::NoteOff { key, channel }
    }

    /// Create a control change event
    pub fn controller(number: u8, value: u8, channel: u8) -> Self {
        Self::Controller { number, value, channel }
    }

    /// The channel this message is addressed to, if it has one
    pub fn channel(&self) -> Option<u8> {
        match *self {
            Self::NoteOn { channel, .. }
            | Self::NoteOff { channel, .. }
            | Self::Controller { channel, .. }
            | Self::AllNotesOff { channel }
            | Self::AllSoundOff { channel }
            | Self::AllControllersOff { channel } => Some(channel),
            Self::TempoChange { .. } => None,
        }
    }

    /// Whether this is the tempo meta event
    pub fn is_tempo_change(&self) -> bool {
        matches!(self, Self::TempoChange { .. })
    }

    /// The tempo carried by a tempo meta event
    pub fn tempo_ms_per_beat(&self) -> Option<f64> {
        match *self {
            Self::TempoChange { ms_per_beat } => Some(ms_per_beat),
            _ => None,
        }
    }
}

/// A message placed on the playback timeline, in beats
///
/// Note ons keep the beat of their paired note off around so that
/// "which notes are sounding at beat t" can be answered without
/// re-scanning for the matching note off.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BeatMessage {
    /// Timeline position in quarter-notes from the project origin
    pub beat: f32,
    pub message: MidiMessage,
    /// For note ons: the beat of the matching note off
    pub off_beat: Option<f32>,
}

impl BeatMessage {
    pub fn new(beat: f32, message: MidiMessage) -> Self {
        Self { beat, message, off_beat: None }
    }

    pub fn with_off_beat(beat: f32, message: MidiMessage, off_beat: f32) -> Self {
        Self { beat, message, off_beat: Some(off_beat) }
    }
}

/// A message stamped with a wall-clock time, ready for an instrument
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TimedMessage {
    /// Milliseconds on the shared monotonic clock, see [`now_ms`]
    pub time_ms: f64,
    pub message: MidiMessage,
}

static CLOCK_ORIGIN: Lazy<Instant> = Lazy::new(Instant::now);

/// Milliseconds elapsed on the process-wide monotonic clock
///
/// All timestamps handed to instrument queues use this clock, so that
/// sub-block alignment inside the instruments has a common reference.
pub fn now_ms() -> f64 {
    CLOCK_ORIGIN.elapsed().as_secs_f64() * 1000.0
}

/// Thread-safe MIDI input queue owned by an instrument
///
/// Producer side is fed by player workers, the preview timer and the
/// transport façade; consumer side is drained by the instrument's own
/// audio callback.
pub struct MidiMessageQueue {
    /// Producer side - wrapped in mutex for multi-producer access
    producer: Mutex<ringbuf::HeapProd<TimedMessage>>,
    /// Consumer side - only accessed by the instrument
    consumer: Mutex<ringbuf::HeapCons<TimedMessage>>,
}

impl MidiMessageQueue {
    /// Create a new queue with the given capacity
    pub fn new(capacity: usize) -> Self {
        let rb = HeapRb::new(capacity);
        let (producer, consumer) = rb.split();
        Self {
            producer: Mutex::new(producer),
            consumer: Mutex::new(consumer),
        }
    }

    /// Push a timestamped message; returns false when the queue is full
    pub fn push(&self, message: TimedMessage) -> bool {
        self.producer.lock().try_push(message).is_ok()
    }

    /// Push a message stamped with the current time
    pub fn push_now(&self, message: MidiMessage) -> bool {
        self.push(TimedMessage { time_ms: now_ms(), message })
    }

    /// Pop a single message (instrument side)
    pub fn pop(&self) -> Option<TimedMessage> {
        self.consumer.lock().try_pop()
    }

    /// Drain all queued messages into a vector (instrument side)
    pub fn drain(&self) -> Vec<TimedMessage> {
        let mut messages = Vec::new();
        let mut consumer = self.consumer.lock();
        while let Some(message) = consumer.try_pop() {
            messages.push(message);
        }
        messages
    }

    /// Check if the queue is empty
    pub fn is_empty(&self) -> bool {
        self.consumer.lock().is_empty()
    }

    /// Number of queued messages
    pub fn len(&self) -> usize {
        self.consumer.lock().occupied_len()
    }
}

impl Default for MidiMessageQueue {
    fn default() -> Self {
        Self::new(256)
    }
}
