//! Instruments and the orchestra that owns them
//!
//! Instruments are opaque audio processors: the transport only ever hands
//! them timestamped MIDI messages and, when rendering offline, pulls blocks
//! of interleaved samples out of them. Everything else (plugin formats,
//! device output, voice handling) is their own business.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, RwLock};

use super::midi::MidiMessageQueue;

/// Per-instrument remapping of (key, channel) pairs
///
/// Applied to every note event before it reaches the instrument; the
/// default mapping is the identity.
#[derive(Debug, Default, Clone)]
pub struct KeyboardMapping {
    overrides: HashMap<(u8, u8), (u8, u8)>,
}

impl KeyboardMapping {
    pub fn new() -> Self {
        Self::default()
    }

    /// Remap a single (key, channel) pair
    pub fn set(&mut self, from: (u8, u8), to: (u8, u8)) {
        let _ = self.overrides.insert(from, to);
    }

    /// Resolve a (key, channel) pair through the mapping
    pub fn map(&self, key: u8, channel: u8) -> (u8, u8) {
        self.overrides
            .get(&(key, channel))
            .copied()
            .unwrap_or((key, channel))
    }
}

/// An opaque audio processor fed by the transport
pub trait Instrument: Send + Sync {
    /// Stable identifier, matched against track instrument ids
    fn id(&self) -> &str;

    /// Content hash, the fallback for id matching
    fn hash(&self) -> &str;

    /// The keyboard mapping applied before any note event is sent
    fn keyboard_mapping(&self) -> &KeyboardMapping;

    /// The MIDI input queue; messages carry wall-clock ms timestamps
    fn midi_queue(&self) -> &MidiMessageQueue;

    /// Sample rate of the instrument's audio graph
    fn sample_rate(&self) -> f64;

    /// Output channel count of the instrument's audio graph
    fn num_output_channels(&self) -> usize;

    /// Pull the next block of interleaved samples (offline rendering)
    ///
    /// `out` holds `frames * num_output_channels()` samples; the instrument
    /// is expected to consume its queued MIDI up to the block boundary.
    fn render_next_block(&self, frames: usize, out: &mut [f32]);
}

/// Notifications about the instrument stack changing
pub trait OrchestraListener: Send + Sync {
    /// A new instrument was added
    fn on_instrument_added(&self, instrument: &Arc<dyn Instrument>);

    /// An instrument is about to be removed; it is still in the list
    fn on_instrument_removed(&self, instrument: &Arc<dyn Instrument>);

    /// Removal went through, the list no longer contains the instrument
    fn on_post_remove_instrument(&self);
}

/// The set of instruments available to the project
pub struct Orchestra {
    instruments: RwLock<Vec<Arc<dyn Instrument>>>,
    default_instrument: RwLock<Arc<dyn Instrument>>,
    listeners: Mutex<Vec<Weak<dyn OrchestraListener>>>,
}

impl Orchestra {
    /// Create an orchestra around its built-in default instrument
    pub fn new(default_instrument: Arc<dyn Instrument>) -> Self {
        Self {
            instruments: RwLock::new(vec![Arc::clone(&default_instrument)]),
            default_instrument: RwLock::new(default_instrument),
            listeners: Mutex::new(Vec::new()),
        }
    }

    /// All instruments, default included
    pub fn instruments(&self) -> Vec<Arc<dyn Instrument>> {
        self.instruments.read().clone()
    }

    /// The instrument used when track resolution finds no match
    pub fn default_instrument(&self) -> Arc<dyn Instrument> {
        Arc::clone(&self.default_instrument.read())
    }

    pub fn add_listener(&self, listener: Weak<dyn OrchestraListener>) {
        self.listeners.lock().push(listener);
    }

    /// Register an instrument and notify listeners
    pub fn add_instrument(&self, instrument: Arc<dyn Instrument>) {
        log::info!("Orchestra: adding instrument {}", instrument.id());
        self.instruments.write().push(Arc::clone(&instrument));
        self.for_each_listener(|l| l.on_instrument_added(&instrument));
    }

    /// Remove an instrument by id and notify listeners
    pub fn remove_instrument(&self, instrument_id: &str) {
        let found = self
            .instruments
            .read()
            .iter()
            .find(|i| i.id() == instrument_id)
            .cloned();

        let Some(instrument) = found else {
            log::warn!("Orchestra: no instrument {} to remove", instrument_id);
            return;
        };

        self.for_each_listener(|l| l.on_instrument_removed(&instrument));
        self.instruments.write().retain(|i| !Arc::ptr_eq(i, &instrument));
        self.for_each_listener(|l| l.on_post_remove_instrument());
    }

    /// Resolve a track's instrument id to an instrument
    ///
    /// The track id is matched as a substring against each instrument's id,
    /// then against each instrument's hash; the default instrument is the
    /// last resort.
    pub fn resolve(&self, track_instrument_id: &str) -> Arc<dyn Instrument> {
        let instruments = self.instruments.read();

        for instrument in instruments.iter() {
            if !instrument.id().is_empty() && track_instrument_id.contains(instrument.id()) {
                return Arc::clone(instrument);
            }
        }

        for instrument in instruments.iter() {
            if !instrument.hash().is_empty() && track_instrument_id.contains(instrument.hash()) {
                return Arc::clone(instrument);
            }
        }

        drop(instruments);
        self.default_instrument()
    }

    fn for_each_listener(&self, mut f: impl FnMut(&Arc<dyn OrchestraListener>)) {
        let mut listeners = self.listeners.lock();
        listeners.retain(|weak| {
            if let Some(listener) = weak.upgrade() {
                f(&listener);
                true
            } else {
                false
            }
        });
    }
}
