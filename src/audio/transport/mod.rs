//! The transport façade
//!
//! Owns playback, recording arm state, looping, rendering and previews for
//! one project. The project and the orchestra are observed through
//! callbacks: any mutation invalidates the playback cache, which is rebuilt
//! lazily on the next read. All beat/loop/recording state lives in atomics
//! so the UI can query it without taking locks.

pub mod cache;
pub mod listener;
pub mod player;
pub mod preview;
pub mod renderer;

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

pub use cache::{CacheMessage, CachedTrack, PlaybackCache};
pub use listener::{ListenerBus, TransportEvent, TransportListener};
pub use player::{PlayerPool, MIN_STOP_CHECK_MS};
pub use preview::{NotePreviewTimer, TICK_MS};
pub use renderer::{RenderFormat, RendererThread};

use crate::audio::midi::{
    autodetect_input_device, list_input_devices, now_ms, DeviceSelectionError, MidiDeviceInfo,
    MidiMessage, TimedMessage, NUM_CHANNELS,
};
use crate::audio::orchestra::{Instrument, Orchestra, OrchestraListener};
use crate::project::{Clip, Timeline, TrackRef, TEMPO_CONTROLLER};

/// Implicit tempo before the first tempo event: 120 BPM
pub const DEFAULT_MS_PER_BEAT: f64 = 500.0;

/// Scale of the log2 controller-value/tempo mapping, in ms per beat
pub const MAX_MS_PER_BEAT: f64 = 250.0;

/// Highest controller number tracked in playback contexts; 102..=119 are
/// undefined and 120..=127 are reserved channel mode messages
pub const NUM_CCS: usize = 101;

const DEFAULT_PROJECT_LAST_BEAT: f32 = 32.0;

#[inline]
fn f32_to_u32(f: f32) -> u32 {
    f.to_bits()
}

#[inline]
fn u32_to_f32(u: u32) -> f32 {
    f32::from_bits(u)
}

/// Convert a normalized controller value to a tempo in ms per beat
pub fn ms_per_beat_from_controller(controller_value: f32) -> f64 {
    // clamped to (1e-5, 1 - 1e-5) to keep the log2 out of its singularities
    let safe_cv = controller_value.clamp(0.00001, 0.99999) as f64;
    (1.0 - safe_cv.log2()) * MAX_MS_PER_BEAT
}

/// Convert a tempo in ms per beat back to a normalized controller value
pub fn controller_from_ms_per_beat(ms_per_beat: f64) -> f32 {
    let cv = 1.0 - ms_per_beat / MAX_MS_PER_BEAT;
    (cv.exp2() as f32).clamp(0.0, 1.0)
}

/// Format a millisecond duration as `M:SS` or `M:SS:mmm`, sign preserved
pub fn format_time_ms(time_ms: f64, include_milliseconds: bool) -> String {
    // '-0:00' is no good, so anything above -1 s counts as positive
    let sign = if time_ms <= -1000.0 { "-" } else { "" };
    let abs = time_ms.abs();

    let minutes = (abs / 60_000.0) as u64;
    let seconds = ((abs / 1000.0) as u64) % 60;
    let millis = (abs as u64) % 1000;

    if include_milliseconds && millis > 0 {
        format!("{}{}:{:02}:{:03}", sign, minutes, seconds, millis)
    } else {
        format!("{}{}:{:02}", sign, minutes, seconds)
    }
}

/// Snapshot of the timeline state a worker needs to start dispatching
///
/// Computed once per playback start and shared read-only with the worker;
/// `cc_states[cc][channel-1]` holds the controller values in effect at the
/// start beat, -1 meaning "never set".
pub struct PlaybackContext {
    pub start_beat: f32,
    pub rewind_beat: f32,
    pub end_beat: f32,

    /// ms per beat in effect at the start beat
    pub start_beat_tempo: f64,
    pub start_beat_time_ms: f64,
    pub total_time_ms: f64,

    pub sample_rate: f64,
    pub num_output_channels: usize,

    pub loop_mode: bool,

    pub cc_states: [[i16; NUM_CHANNELS as usize]; NUM_CCS + 1],
}

impl Default for PlaybackContext {
    fn default() -> Self {
        Self {
            start_beat: 0.0,
            rewind_beat: 0.0,
            end_beat: 0.0,
            start_beat_tempo: DEFAULT_MS_PER_BEAT,
            start_beat_time_ms: 0.0,
            total_time_ms: 0.0,
            sample_rate: 0.0,
            num_output_channels: 0,
            loop_mode: false,
            cc_states: [[-1; NUM_CHANNELS as usize]; NUM_CCS + 1],
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
struct TransportState {
    seek_beat: f32,
}

/// The playback and transport engine of one project
pub struct Transport {
    orchestra: Arc<Orchestra>,

    player: PlayerPool,
    renderer: RendererThread,
    note_preview_timer: NotePreviewTimer,
    listeners: ListenerBus,

    seek_beat_bits: AtomicU32,
    project_first_beat_bits: AtomicU32,
    project_last_beat_bits: AtomicU32,

    // just a flag; recording itself is done by a separate collaborator
    midi_recording_mode: AtomicBool,

    loop_mode: AtomicBool,
    loop_start_beat_bits: AtomicU32,
    loop_end_beat_bits: AtomicU32,

    metronome_enabled: AtomicBool,

    playback_cache: Mutex<PlaybackCache>,
    playback_cache_outdated: AtomicBool,
    has_solo_clips_cache: AtomicBool,

    tracks_cache: Mutex<Vec<TrackRef>>,
    instrument_links: Mutex<HashMap<String, Weak<dyn Instrument>>>,
    timeline: Mutex<Timeline>,
}

impl Transport {
    /// Create a transport observing the given orchestra
    pub fn new(orchestra: Arc<Orchestra>) -> Arc<Self> {
        let transport = Arc::new(Self {
            orchestra,
            player: PlayerPool::new(),
            renderer: RendererThread::default(),
            note_preview_timer: NotePreviewTimer::default(),
            listeners: ListenerBus::default(),
            seek_beat_bits: AtomicU32::new(f32_to_u32(0.0)),
            project_first_beat_bits: AtomicU32::new(f32_to_u32(0.0)),
            project_last_beat_bits: AtomicU32::new(f32_to_u32(DEFAULT_PROJECT_LAST_BEAT)),
            midi_recording_mode: AtomicBool::new(false),
            loop_mode: AtomicBool::new(false),
            loop_start_beat_bits: AtomicU32::new(f32_to_u32(0.0)),
            loop_end_beat_bits: AtomicU32::new(f32_to_u32(DEFAULT_PROJECT_LAST_BEAT)),
            metronome_enabled: AtomicBool::new(false),
            playback_cache: Mutex::new(PlaybackCache::default()),
            playback_cache_outdated: AtomicBool::new(true),
            has_solo_clips_cache: AtomicBool::new(false),
            tracks_cache: Mutex::new(Vec::new()),
            instrument_links: Mutex::new(HashMap::new()),
            timeline: Mutex::new(Timeline::default()),
        });

        let weak = Arc::downgrade(&transport) as Weak<dyn OrchestraListener>;
        transport.orchestra.add_listener(weak);
        transport
    }

    //===------------------------------------------------------------------===//
    // Accessors
    //===------------------------------------------------------------------===//

    pub fn seek_beat(&self) -> f32 {
        u32_to_f32(self.seek_beat_bits.load(Ordering::SeqCst))
    }

    pub fn project_first_beat(&self) -> f32 {
        u32_to_f32(self.project_first_beat_bits.load(Ordering::SeqCst))
    }

    pub fn project_last_beat(&self) -> f32 {
        u32_to_f32(self.project_last_beat_bits.load(Ordering::SeqCst))
    }

    pub fn playback_loop_start(&self) -> f32 {
        u32_to_f32(self.loop_start_beat_bits.load(Ordering::SeqCst))
    }

    pub fn playback_loop_end(&self) -> f32 {
        u32_to_f32(self.loop_end_beat_bits.load(Ordering::SeqCst))
    }

    pub fn has_playback_loop(&self) -> bool {
        self.loop_mode.load(Ordering::SeqCst)
    }

    pub fn has_solo_clips(&self) -> bool {
        self.has_solo_clips_cache.load(Ordering::SeqCst)
    }

    pub fn cache_is_outdated(&self) -> bool {
        self.playback_cache_outdated.load(Ordering::SeqCst)
    }

    //===------------------------------------------------------------------===//
    // Listeners
    //===------------------------------------------------------------------===//

    pub fn add_transport_listener(&self, listener: Arc<dyn TransportListener>) {
        self.listeners.add(listener);
    }

    pub fn remove_transport_listener(&self, listener: &Arc<dyn TransportListener>) {
        self.listeners.remove(listener);
    }

    /// Drain worker-posted notifications; call this from the UI thread
    pub fn dispatch_pending_events(&self) -> usize {
        self.listeners.dispatch_pending()
    }

    //===------------------------------------------------------------------===//
    // Transport
    //===------------------------------------------------------------------===//

    pub fn seek_to_beat(&self, beat: f32) {
        self.seek_beat_bits.store(f32_to_u32(beat), Ordering::SeqCst);
        self.listeners.broadcast(&TransportEvent::Seek(beat));
    }

    /// Re-send note-ons of every note sounding at the given beat
    ///
    /// Used by the UI to audition the timeline position while seeking;
    /// optionally limited to one track.
    pub fn probe_sound_at(&self, beat: f32, track_id: Option<&str>) {
        let cache = self.playback_cache();
        for (instrument, message) in cache.sounding_notes_at(beat, track_id) {
            if !instrument.midi_queue().push_now(message) {
                log::warn!("Instrument {} dropped a probed note", instrument.id());
            }
        }
    }

    pub fn is_playing(&self) -> bool {
        self.player.is_playing()
    }

    pub fn start_playback(&self) -> bool {
        self.start_playback_at(self.seek_beat())
    }

    pub fn start_playback_at(&self, start: f32) -> bool {
        self.rebuild_playback_cache_if_needed();
        if self.playback_cache.lock().is_empty() {
            log::warn!("Nothing to play");
            return false;
        }

        self.stop_playback();

        if self.loop_mode.load(Ordering::SeqCst) {
            let loop_start = self.playback_loop_start();
            let loop_end = self.playback_loop_end();
            let start = if start >= loop_end { loop_start } else { start };
            self.start_worker(start, loop_start, loop_end, true);
        } else {
            self.start_worker(start, self.seek_beat(), self.project_last_beat(), false);
        }

        self.listeners.broadcast(&TransportEvent::Play);
        true
    }

    pub fn start_playback_fragment(&self, start_beat: f32, end_beat: f32, looped: bool) -> bool {
        self.rebuild_playback_cache_if_needed();
        if self.playback_cache.lock().is_empty() {
            log::warn!("Nothing to play");
            return false;
        }

        self.stop_playback();
        self.start_worker(start_beat, start_beat, end_beat, looped);
        self.listeners.broadcast(&TransportEvent::Play);
        true
    }

    fn start_worker(&self, start_beat: f32, rewind_beat: f32, end_beat: f32, loop_mode: bool) {
        let mut context = self.fill_playback_context_at(start_beat);
        context.rewind_beat = rewind_beat;
        context.end_beat = end_beat;
        context.loop_mode = loop_mode;

        // let listeners know the tempo before the playback starts
        self.listeners
            .broadcast(&TransportEvent::CurrentTempoChanged(context.start_beat_tempo));

        let cache = self.playback_cache();
        self.player
            .start_playback(Arc::new(context), cache, self.listeners.sender());
    }

    pub fn stop_playback(&self) {
        if self.player.is_playing() {
            self.listeners.broadcast(&TransportEvent::Stop);
            self.player.stop_playback();
            self.all_notes_controllers_and_sound_off();
            self.seek_to_beat(self.seek_beat());
        }
    }

    pub fn toggle_start_stop_playback(&self) {
        if self.is_playing() {
            self.stop_playback_and_recording();
        } else {
            let _ = self.start_playback();
        }
    }

    /// Rescale beats-to-wall-clock of the running playback
    pub fn set_playback_speed_multiplier(&self, multiplier: f32) {
        debug_assert!(self.is_playing());
        self.player.set_speed_multiplier(multiplier);
    }

    //===------------------------------------------------------------------===//
    // Recording MIDI
    //===------------------------------------------------------------------===//

    pub fn start_recording(&self) {
        let devices = list_input_devices().unwrap_or_else(|e| {
            log::warn!("MIDI input enumeration failed: {}", e);
            Vec::new()
        });
        self.start_recording_with_devices(devices);
    }

    pub(crate) fn start_recording_with_devices(&self, devices: Vec<MidiDeviceInfo>) {
        if !self.is_playing() {
            self.rebuild_playback_cache_if_needed();
        }

        // recording arms only with exactly one device available
        match autodetect_input_device(&devices) {
            Ok(_) => {
                self.midi_recording_mode.store(true, Ordering::SeqCst);
                self.listeners.broadcast(&TransportEvent::Record);
            }
            Err(DeviceSelectionError::NoDevicesAvailable) => {
                self.listeners.broadcast(&TransportEvent::RecordFailed(Vec::new()));
            }
            Err(DeviceSelectionError::AmbiguousDevices(all)) => {
                self.listeners.broadcast(&TransportEvent::RecordFailed(all));
            }
        }
    }

    pub fn is_recording(&self) -> bool {
        self.midi_recording_mode.load(Ordering::SeqCst)
    }

    pub fn is_playing_and_recording(&self) -> bool {
        self.is_playing() && self.is_recording()
    }

    pub fn stop_recording(&self) {
        if self.is_recording() {
            self.midi_recording_mode.store(false, Ordering::SeqCst);

            if self.is_playing() {
                self.stop_playback(); // broadcasts the stop
            } else {
                self.listeners.broadcast(&TransportEvent::Stop);
            }
        }
    }

    pub fn stop_playback_and_recording(&self) {
        self.stop_recording();
        self.stop_playback();
    }

    //===------------------------------------------------------------------===//
    // Playback loop
    //===------------------------------------------------------------------===//

    pub fn toggle_playback_loop(&self, start_beat: f32, end_beat: f32) {
        if self.loop_mode.load(Ordering::SeqCst) {
            self.disable_playback_loop();
            return;
        }
        self.set_playback_loop(start_beat, end_beat);
    }

    pub fn set_playback_loop(&self, start_beat: f32, end_beat: f32) {
        if self.is_playing() {
            self.stop_playback_and_recording();
        }

        self.loop_mode.store(true, Ordering::SeqCst);
        self.loop_start_beat_bits.store(f32_to_u32(start_beat), Ordering::SeqCst);
        // length is at least one beat
        self.loop_end_beat_bits
            .store(f32_to_u32(end_beat.max(start_beat + 1.0)), Ordering::SeqCst);

        self.listeners.broadcast(&TransportEvent::LoopModeChanged {
            enabled: true,
            start_beat: self.playback_loop_start(),
            end_beat: self.playback_loop_end(),
        });
    }

    pub fn disable_playback_loop(&self) {
        if !self.loop_mode.load(Ordering::SeqCst) {
            return;
        }

        if self.is_playing() {
            self.stop_playback_and_recording();
        }

        self.loop_mode.store(false, Ordering::SeqCst);
        self.listeners.broadcast(&TransportEvent::LoopModeChanged {
            enabled: false,
            start_beat: 0.0,
            end_beat: 0.0,
        });
    }

    //===------------------------------------------------------------------===//
    // Rendering
    //===------------------------------------------------------------------===//

    pub fn start_render(
        &self,
        path: &Path,
        format: RenderFormat,
        thumbnail_resolution: usize,
    ) -> bool {
        if self.renderer.is_rendering() {
            return false;
        }

        self.rebuild_playback_cache_if_needed();
        if self.playback_cache.lock().is_empty() {
            log::warn!("Nothing to render");
            return false;
        }

        let mut context = self.fill_playback_context_at(self.project_first_beat());
        context.rewind_beat = self.project_first_beat();
        context.end_beat = self.project_last_beat();

        self.renderer.start_rendering(
            path,
            format,
            Arc::new(context),
            self.playback_cache(),
            thumbnail_resolution,
        )
    }

    pub fn stop_render(&self) {
        if !self.renderer.is_rendering() {
            return;
        }
        self.renderer.stop();
    }

    pub fn is_rendering(&self) -> bool {
        self.renderer.is_rendering()
    }

    pub fn render_progress(&self) -> f32 {
        self.renderer.percent_complete()
    }

    pub fn render_waveform_thumbnail(&self) -> Vec<f32> {
        self.renderer.waveform_thumbnail()
    }

    //===------------------------------------------------------------------===//
    // Sending messages at real-time
    //===------------------------------------------------------------------===//

    /// Preview a key interactively, routed through the track's instrument
    /// or the default one
    ///
    /// The note-off timeout uses the default 120 BPM rather than the tempo
    /// at the current position; previews are not tied to the timeline.
    pub fn preview_key(
        &self,
        track_id: Option<&str>,
        channel: u8,
        key: u8,
        volume: f32,
        length_in_beats: f32,
    ) {
        let instrument = self.linked_instrument(track_id);
        let note_off_timeout_ms = (DEFAULT_MS_PER_BEAT * length_in_beats as f64) as i32;
        self.note_preview_timer.preview_note(
            Arc::downgrade(&instrument),
            channel,
            key,
            volume,
            note_off_timeout_ms,
        );
    }

    /// Silence one track's instrument, or everything
    pub fn stop_sound(&self, track_id: Option<&str>) {
        match track_id
            .and_then(|id| self.instrument_links.lock().get(id).and_then(Weak::upgrade))
        {
            Some(instrument) => {
                self.note_preview_timer.cancel_all_pending(true);
                stop_sound_for_instrument(&instrument);
            }
            None => self.all_notes_controllers_and_sound_off(),
        }
    }

    /// Silence every linked instrument on every channel
    pub fn all_notes_controllers_and_sound_off(&self) {
        self.note_preview_timer.cancel_all_pending(true);

        let mut unique: Vec<Arc<dyn Instrument>> = Vec::new();
        {
            let links = self.instrument_links.lock();
            for instrument in links.values().filter_map(Weak::upgrade) {
                if !unique.iter().any(|i| Arc::ptr_eq(i, &instrument)) {
                    unique.push(instrument);
                }
            }
        }

        for instrument in &unique {
            stop_sound_for_instrument(instrument);
        }
    }

    fn linked_instrument(&self, track_id: Option<&str>) -> Arc<dyn Instrument> {
        // previews without a track (scale editor etc.) use the default
        track_id
            .and_then(|id| self.instrument_links.lock().get(id).and_then(Weak::upgrade))
            .unwrap_or_else(|| self.orchestra.default_instrument())
    }

    //===------------------------------------------------------------------===//
    // Time calculations
    //===------------------------------------------------------------------===//

    /// Elapsed milliseconds from the project start to the given beat
    pub fn find_time_at(&self, target_beat: f32) -> f64 {
        let cache = self.playback_cache();
        if cache.is_empty() {
            return 0.0;
        }

        let mut tempo = initial_tempo(&cache);
        let mut prev_beat = self.project_first_beat() as f64;
        let mut result_ms = 0.0;

        cache.seek_to_start();
        while let Some(message) = cache.next_message() {
            let beat = message.beat as f64;
            if message.beat > target_beat {
                break;
            }

            result_ms += tempo * (beat - prev_beat);
            prev_beat = beat;

            if let Some(new_tempo) = message.message.tempo_ms_per_beat() {
                tempo = new_tempo;
            }
        }

        // the remainder, from the last event to the target beat
        result_ms += tempo * (target_beat as f64 - prev_beat);
        result_ms
    }

    /// Walk the cache once, collecting everything a worker needs to start
    /// at the given beat: elapsed time, active tempo, the controller
    /// snapshot, and the total project time
    pub fn fill_playback_context_at(&self, target_beat: f32) -> PlaybackContext {
        let cache = self.playback_cache();

        let mut context = PlaybackContext {
            start_beat: target_beat,
            ..PlaybackContext::default()
        };

        if cache.is_empty() {
            return context;
        }

        context.start_beat_tempo = initial_tempo(&cache);
        context.sample_rate = cache.sample_rate();
        context.num_output_channels = cache.num_output_channels();

        let mut tempo = context.start_beat_tempo;
        let mut prev_beat = self.project_first_beat() as f64;
        let mut start_beat_passed = false;

        cache.seek_to_start();
        while let Some(message) = cache.next_message() {
            let beat = message.beat as f64;
            let time_delta = tempo * (beat - prev_beat);

            if !start_beat_passed && message.beat > target_beat {
                // the time from the last event to the start beat
                context.start_beat_time_ms += tempo * (target_beat as f64 - prev_beat);
                start_beat_passed = true;
            }

            if !start_beat_passed {
                context.start_beat_time_ms += time_delta;
            }

            context.total_time_ms += time_delta;
            prev_beat = beat;

            if let Some(new_tempo) = message.message.tempo_ms_per_beat() {
                tempo = new_tempo;
            } else if !start_beat_passed {
                if let MidiMessage::Controller { number, value, channel } = message.message {
                    if (number as usize) <= NUM_CCS {
                        let channel_index = (channel.clamp(1, NUM_CHANNELS) - 1) as usize;
                        context.cc_states[number as usize][channel_index] = value as i16;
                    }
                }
            }

            if !start_beat_passed {
                context.start_beat_tempo = tempo;
            }
        }

        if !start_beat_passed {
            context.start_beat_time_ms += tempo * (target_beat as f64 - prev_beat);
        }

        // the remainder up to the end of the project
        context.total_time_ms += tempo * (self.project_last_beat() as f64 - prev_beat);
        context
    }

    //===------------------------------------------------------------------===//
    // Playback cache management
    //===------------------------------------------------------------------===//

    /// A value copy of the cache with its own cursors, rebuilding first if
    /// any change invalidated it
    pub fn playback_cache(&self) -> PlaybackCache {
        self.rebuild_playback_cache_if_needed();
        self.playback_cache.lock().clone()
    }

    fn invalidate_playback_cache(&self) {
        self.playback_cache_outdated.store(true, Ordering::SeqCst);
    }

    fn rebuild_playback_cache_if_needed(&self) {
        if self.playback_cache_outdated.load(Ordering::SeqCst) {
            let rebuilt = self.build_playback_cache(self.metronome_enabled.load(Ordering::SeqCst));
            *self.playback_cache.lock() = rebuilt;
            self.playback_cache_outdated.store(false, Ordering::SeqCst);
        }
    }

    fn build_playback_cache(&self, with_metronome: bool) -> PlaybackCache {
        let has_solo = self.refresh_solo_clips_cache();
        let first_beat = self.project_first_beat();
        let last_beat = self.project_last_beat();

        let mut cached_tracks = Vec::new();

        {
            let tracks = self.tracks_cache.lock();
            for track_ref in tracks.iter() {
                let track = track_ref.read();
                let instrument = self
                    .instrument_links
                    .lock()
                    .get(&track.id)
                    .and_then(Weak::upgrade)
                    .unwrap_or_else(|| self.orchestra.default_instrument());

                let mut messages = Vec::new();
                {
                    let mapping = instrument.keyboard_mapping();
                    if track.clips.is_empty() {
                        track.export_midi(
                            &mut messages,
                            &Clip::default(),
                            mapping,
                            has_solo,
                            first_beat,
                            last_beat,
                        );
                    } else {
                        for clip in &track.clips {
                            track.export_midi(
                                &mut messages,
                                clip,
                                mapping,
                                has_solo,
                                first_beat,
                                last_beat,
                            );
                        }
                    }
                }

                messages.sort_by(|a, b| {
                    a.beat.partial_cmp(&b.beat).unwrap_or(std::cmp::Ordering::Equal)
                });

                cached_tracks.push(CachedTrack {
                    track_id: track.id.clone(),
                    instrument,
                    messages,
                });
            }
        }

        if with_metronome {
            let ticks = self.timeline.lock().metronome_ticks(first_beat, last_beat);
            cached_tracks.push(CachedTrack {
                track_id: "metronome".to_string(),
                instrument: self.orchestra.default_instrument(),
                messages: ticks,
            });
        }

        PlaybackCache::publish(cached_tracks)
    }

    fn refresh_solo_clips_cache(&self) -> bool {
        let has_solo = self
            .tracks_cache
            .lock()
            .iter()
            .any(|track| track.read().has_solo_clips());
        self.has_solo_clips_cache.store(has_solo, Ordering::SeqCst);
        has_solo
    }

    fn update_instrument_link_for_track(&self, track_ref: &TrackRef) {
        let (track_id, instrument_id) = {
            let track = track_ref.read();
            (track.id.clone(), track.instrument_id.clone())
        };
        let instrument = self.orchestra.resolve(&instrument_id);
        let _ = self
            .instrument_links
            .lock()
            .insert(track_id, Arc::downgrade(&instrument));
    }

    fn relink_all_tracks(&self) {
        let tracks = self.tracks_cache.lock().clone();
        for track_ref in &tracks {
            self.update_instrument_link_for_track(track_ref);
        }
    }

    fn handle_possible_tempo_change(&self, track_controller_number: u8) {
        if track_controller_number == TEMPO_CONTROLLER {
            let total_ms = self.find_time_at(self.project_last_beat());
            self.listeners.broadcast(&TransportEvent::TotalTimeChanged(total_ms));
        }
    }

    //===------------------------------------------------------------------===//
    // Project state reactions
    //===------------------------------------------------------------------===//

    pub fn on_metronome_flag_changed(&self, enabled: bool) {
        // metronome ticks are part of the playback cache
        self.metronome_enabled.store(enabled, Ordering::SeqCst);
        self.stop_playback_and_recording();
        self.invalidate_playback_cache();
    }

    pub fn on_time_signatures_updated(&self, timeline: Timeline) {
        *self.timeline.lock() = timeline;
        if self.metronome_enabled.load(Ordering::SeqCst) {
            self.invalidate_playback_cache();
        }
    }

    pub fn on_midi_event_added(&self, track_controller_number: u8) {
        // live recording must not be interrupted by its own inserts
        if !self.is_recording() {
            self.stop_playback();
        }
        self.invalidate_playback_cache();
        self.handle_possible_tempo_change(track_controller_number);
    }

    pub fn on_midi_event_changed(&self, track_controller_number: u8) {
        if !self.is_recording() {
            self.stop_playback();
        }
        self.invalidate_playback_cache();
        self.handle_possible_tempo_change(track_controller_number);
    }

    pub fn on_midi_events_removed(&self, track_controller_number: u8) {
        self.stop_playback_and_recording();
        self.invalidate_playback_cache();
        self.handle_possible_tempo_change(track_controller_number);
    }

    pub fn on_clip_added(&self, clip: &Clip, track_controller_number: u8) {
        if !self.is_recording() {
            self.stop_playback();
        }
        self.invalidate_playback_cache();
        self.handle_possible_tempo_change(track_controller_number);

        if clip.solo {
            let _ = self.refresh_solo_clips_cache();
        }
    }

    pub fn on_clip_changed(&self, old_clip: &Clip, new_clip: &Clip, track_controller_number: u8) {
        self.stop_playback_and_recording();
        self.invalidate_playback_cache();
        self.handle_possible_tempo_change(track_controller_number);

        if old_clip.solo != new_clip.solo {
            let _ = self.refresh_solo_clips_cache();
        }
    }

    pub fn on_clips_removed(&self, track_controller_number: u8) {
        self.stop_playback_and_recording();
        self.invalidate_playback_cache();
        self.handle_possible_tempo_change(track_controller_number);
        let _ = self.refresh_solo_clips_cache();
    }

    pub fn on_track_added(&self, track: TrackRef) {
        if !self.is_recording() {
            self.stop_playback();
        }
        self.invalidate_playback_cache();

        self.update_instrument_link_for_track(&track);
        {
            let mut tracks = self.tracks_cache.lock();
            let id = track.read().id.clone();
            if !tracks.iter().any(|t| t.read().id == id) {
                tracks.push(track);
            }
        }
        let _ = self.refresh_solo_clips_cache();
    }

    pub fn on_track_removed(&self, track_id: &str) {
        self.stop_playback_and_recording();
        self.invalidate_playback_cache();

        self.tracks_cache.lock().retain(|t| t.read().id != track_id);
        let _ = self.instrument_links.lock().remove(track_id);
        let _ = self.refresh_solo_clips_cache();
    }

    pub fn on_track_properties_changed(&self, track: &TrackRef) {
        // stop playback only when the track's instrument actually changed
        let (track_id, instrument_id) = {
            let t = track.read();
            (t.id.clone(), t.instrument_id.clone())
        };

        let link_unchanged = {
            let links = self.instrument_links.lock();
            match links.get(&track_id).and_then(Weak::upgrade) {
                Some(linked) => linked.id() == instrument_id,
                None => false,
            }
        };
        if link_unchanged {
            return;
        }

        if !self.is_recording() {
            self.stop_playback();
        }
        self.invalidate_playback_cache();
        self.update_instrument_link_for_track(track);
    }

    pub fn on_project_beat_range_changed(&self, first_beat: f32, last_beat: f32) {
        if !self.is_recording() {
            self.stop_playback();
        }

        self.project_first_beat_bits.store(f32_to_u32(first_beat), Ordering::SeqCst);
        self.project_last_beat_bits.store(f32_to_u32(last_beat), Ordering::SeqCst);
        self.invalidate_playback_cache();

        let total_ms = self.find_time_at(last_beat);
        self.listeners.broadcast(&TransportEvent::TotalTimeChanged(total_ms));
    }

    pub fn on_deactivate_project_subtree(&self) {
        self.stop_playback_and_recording();
    }

    pub fn on_activate_project_subtree(&self) {
        // keyboard mappings may have changed while the project was inactive
        self.invalidate_playback_cache();
    }

    pub fn on_reload_project_content(
        &self,
        tracks: Vec<TrackRef>,
        timeline: Timeline,
        first_beat: f32,
        last_beat: f32,
    ) {
        self.invalidate_playback_cache();

        self.project_first_beat_bits.store(f32_to_u32(first_beat), Ordering::SeqCst);
        self.project_last_beat_bits.store(f32_to_u32(last_beat), Ordering::SeqCst);
        *self.timeline.lock() = timeline;

        {
            let mut cached = self.tracks_cache.lock();
            cached.clear();
            cached.extend(tracks.iter().cloned());
        }
        self.instrument_links.lock().clear();
        for track_ref in &tracks {
            self.update_instrument_link_for_track(track_ref);
        }

        let _ = self.refresh_solo_clips_cache();
        self.stop_playback_and_recording();
    }

    //===------------------------------------------------------------------===//
    // Serialization
    //===------------------------------------------------------------------===//

    pub fn serialize(&self) -> serde_json::Value {
        serde_json::to_value(TransportState { seek_beat: self.seek_beat() })
            .unwrap_or(serde_json::Value::Null)
    }

    pub fn deserialize(&self, data: &serde_json::Value) {
        self.reset();
        let state: TransportState =
            serde_json::from_value(data.clone()).unwrap_or(TransportState { seek_beat: 0.0 });
        self.seek_to_beat(state.seek_beat);
    }

    pub fn reset(&self) {}
}

impl OrchestraListener for Transport {
    fn on_instrument_added(&self, _instrument: &Arc<dyn Instrument>) {
        self.stop_playback_and_recording();
        // the cache holds references to the instruments, too
        self.invalidate_playback_cache();
        self.relink_all_tracks();
    }

    fn on_instrument_removed(&self, _instrument: &Arc<dyn Instrument>) {
        // the instrument stack has not changed yet,
        // so just stop the playback before it's too late
        self.stop_playback_and_recording();
    }

    fn on_post_remove_instrument(&self) {
        self.invalidate_playback_cache();
        self.relink_all_tracks();
    }
}

fn initial_tempo(cache: &PlaybackCache) -> f64 {
    // the initial tempo is the very first tempo event, wherever it is
    cache.seek_to_start();
    while let Some(message) = cache.next_message() {
        if let Some(tempo) = message.message.tempo_ms_per_beat() {
            return tempo;
        }
    }
    DEFAULT_MS_PER_BEAT
}

fn stop_sound_for_instrument(instrument: &Arc<dyn Instrument>) {
    let queue = instrument.midi_queue();
    for channel in 1..=NUM_CHANNELS {
        let time_ms = now_ms();
        let _ = queue.push(TimedMessage {
            time_ms,
            message: MidiMessage::AllControllersOff { channel },
        });
        let _ = queue.push(TimedMessage {
            time_ms,
            message: MidiMessage::AllNotesOff { channel },
        });
        let _ = queue.push(TimedMessage {
            time_ms,
            message: MidiMessage::AllSoundOff { channel },
        });
    }
}

#[cfg(test)]
mod tests {
    use super::listener::testing::{Heard, RecordingListener};
    use super::*;
    use crate::audio::orchestra::testing::MockInstrument;
    use crate::project::{track_ref, TimeSignature, Track, TrackEvent};
    use std::time::Duration;

    struct Fixture {
        orchestra: Arc<Orchestra>,
        default_instrument: Arc<MockInstrument>,
        synth: Arc<MockInstrument>,
        transport: Arc<Transport>,
        listener: Arc<RecordingListener>,
    }

    fn note(beat: f32, key: u8, length: f32) -> TrackEvent {
        TrackEvent::Note { beat, key, velocity: 0.8, length }
    }

    fn fixture_with_tracks(tracks: Vec<Track>) -> Fixture {
        crate::audio::orchestra::testing::init_logging();

        let default_instrument = MockInstrument::new("default-synth");
        let orchestra = Arc::new(Orchestra::new(default_instrument.clone()));
        let synth = MockInstrument::new("poly-synth");
        orchestra.add_instrument(synth.clone());

        let transport = Transport::new(Arc::clone(&orchestra));
        let listener = RecordingListener::new();
        transport.add_transport_listener(listener.clone());

        let track_refs = tracks.into_iter().map(track_ref).collect();
        transport.on_reload_project_content(track_refs, Timeline::default(), 0.0, 8.0);
        listener.heard.lock().clear();

        Fixture {
            orchestra,
            default_instrument,
            synth,
            transport,
            listener,
        }
    }

    fn fixture() -> Fixture {
        let mut track = Track::new("t-notes", "poly-synth");
        track.events = vec![note(0.0, 60, 0.5), note(1.0, 62, 0.5), note(2.0, 64, 0.5)];
        fixture_with_tracks(vec![track])
    }

    fn tempo_track(events: Vec<(f32, f32)>) -> Track {
        let mut track = Track::automation("t-tempo", "", TEMPO_CONTROLLER);
        track.events = events
            .into_iter()
            .map(|(beat, value)| TrackEvent::Automation { beat, value })
            .collect();
        track
    }

    //===------------------------------------------------------------------===//
    // Conversions and formatting
    //===------------------------------------------------------------------===//

    #[test]
    fn test_tempo_controller_round_trip() {
        for ms_per_beat in [300.0, 500.0, 1000.0, 2000.0, 3500.0] {
            let cv = controller_from_ms_per_beat(ms_per_beat);
            let back = ms_per_beat_from_controller(cv);
            assert!(
                (back - ms_per_beat).abs() < 0.5,
                "{} -> {} -> {}",
                ms_per_beat,
                cv,
                back
            );
        }
    }

    #[test]
    fn test_controller_midpoint_is_default_tempo() {
        assert!((ms_per_beat_from_controller(0.5) - DEFAULT_MS_PER_BEAT).abs() < 1e-9);
        assert!((controller_from_ms_per_beat(DEFAULT_MS_PER_BEAT) - 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_format_time_ms() {
        assert_eq!(format_time_ms(0.0, false), "0:00");
        assert_eq!(format_time_ms(65_000.0, false), "1:05");
        assert_eq!(format_time_ms(-90_500.0, false), "-1:30");
        assert_eq!(format_time_ms(-500.0, false), "0:00");
        assert_eq!(format_time_ms(1_234.0, true), "0:01:234");
        assert_eq!(format_time_ms(61_000.0, true), "1:01");
    }

    #[test]
    fn test_serialize_round_trip() {
        let f = fixture();
        f.transport.seek_to_beat(7.5);
        let data = f.transport.serialize();

        let g = fixture();
        g.transport.deserialize(&data);
        assert_eq!(g.transport.seek_beat(), 7.5);
        assert!(g.listener.events().contains(&Heard::Seek(7.5)));
    }

    //===------------------------------------------------------------------===//
    // Time map
    //===------------------------------------------------------------------===//

    #[test]
    fn test_find_time_at_constant_tempo() {
        let f = fixture();
        assert!((f.transport.find_time_at(0.0) - 0.0).abs() < 1e-6);
        assert!((f.transport.find_time_at(2.0) - 1000.0).abs() < 1e-6);
        assert!((f.transport.find_time_at(4.0) - 2000.0).abs() < 1e-6);
    }

    #[test]
    fn test_find_time_at_with_tempo_change() {
        // tempo halves to 250 ms/beat at beat 2
        let mut notes = Track::new("t-notes", "poly-synth");
        notes.events = (0..5).map(|i| note(i as f32, 60, 0.25)).collect();
        let tempo = tempo_track(vec![(2.0, 1.0)]);
        let f = fixture_with_tracks(vec![notes, tempo]);

        let expected = [0.0, 500.0, 1000.0, 1250.0, 1500.0];
        for (beat, expected_ms) in expected.iter().enumerate() {
            let actual = f.transport.find_time_at(beat as f32);
            assert!(
                (actual - expected_ms).abs() < 1.0,
                "beat {}: {} ms, expected {} ms",
                beat,
                actual,
                expected_ms
            );
        }
    }

    #[test]
    fn test_find_time_is_monotonic() {
        let tempo = tempo_track(vec![(1.0, 0.3), (3.0, 0.9), (5.0, 0.6)]);
        let mut notes = Track::new("t-notes", "poly-synth");
        notes.events = vec![note(0.0, 60, 8.0)];
        let f = fixture_with_tracks(vec![notes, tempo]);

        let mut prev = f64::NEG_INFINITY;
        for i in 0..=16 {
            let ms = f.transport.find_time_at(i as f32 * 0.5);
            assert!(ms >= prev, "time went backwards at beat {}", i as f32 * 0.5);
            prev = ms;
        }
    }

    #[test]
    fn test_find_time_on_empty_cache() {
        let f = fixture_with_tracks(vec![]);
        assert_eq!(f.transport.find_time_at(8.0), 0.0);
    }

    #[test]
    fn test_initial_tempo_found_anywhere_in_stream() {
        // the first (and only) tempo event sits at beat 4, but it defines
        // the initial tempo for the whole project
        let mut notes = Track::new("t-notes", "poly-synth");
        notes.events = vec![note(0.0, 60, 0.5)];
        let tempo = tempo_track(vec![(4.0, 1.0)]); // 250 ms/beat
        let f = fixture_with_tracks(vec![notes, tempo]);

        assert!((f.transport.find_time_at(2.0) - 500.0).abs() < 1.0);
    }

    #[test]
    fn test_playback_context_totals_and_ccs() {
        let mut notes = Track::new("t-notes", "poly-synth");
        notes.events = vec![note(0.0, 60, 0.5), note(6.0, 62, 0.5)];

        let mut volume = Track::automation("t-vol", "poly-synth", 7);
        volume.events = vec![
            TrackEvent::Automation { beat: 0.0, value: 0.25 },
            TrackEvent::Automation { beat: 1.5, value: 0.5 },
            TrackEvent::Automation { beat: 6.0, value: 1.0 },
        ];

        let f = fixture_with_tracks(vec![notes, volume]);
        let context = f.transport.fill_playback_context_at(2.0);

        // the latest CC 7 value at beat <= 2 wins; the one at beat 6 is not
        // applied yet
        assert_eq!(context.cc_states[7][0], 64);
        // untouched controllers stay unset
        assert_eq!(context.cc_states[8][0], -1);
        assert_eq!(context.cc_states[7][1], -1);

        assert!((context.start_beat_time_ms - f.transport.find_time_at(2.0)).abs() < 1e-6);
        let total = f.transport.find_time_at(f.transport.project_last_beat());
        assert!((context.total_time_ms - total).abs() < 1e-6);
        assert_eq!(context.sample_rate, 44100.0);
        assert_eq!(context.num_output_channels, 2);
    }

    #[test]
    fn test_playback_context_on_empty_cache() {
        let f = fixture_with_tracks(vec![]);
        let context = f.transport.fill_playback_context_at(3.0);
        assert_eq!(context.start_beat, 3.0);
        assert_eq!(context.total_time_ms, 0.0);
        assert_eq!(context.start_beat_tempo, DEFAULT_MS_PER_BEAT);
    }

    //===------------------------------------------------------------------===//
    // Cache lifecycle
    //===------------------------------------------------------------------===//

    #[test]
    fn test_cache_rebuilds_lazily_after_invalidation() {
        let f = fixture();
        let _ = f.transport.playback_cache();
        assert!(!f.transport.cache_is_outdated());

        f.transport.on_midi_event_added(0);
        assert!(f.transport.cache_is_outdated());

        let _ = f.transport.playback_cache();
        assert!(!f.transport.cache_is_outdated());
    }

    #[test]
    fn test_tempo_event_mutation_broadcasts_total_time() {
        let f = fixture();
        f.transport.on_midi_event_added(TEMPO_CONTROLLER);
        assert!(f
            .listener
            .events()
            .iter()
            .any(|e| matches!(e, Heard::TotalTime(_))));

        f.listener.heard.lock().clear();
        f.transport.on_midi_event_added(0);
        assert!(!f
            .listener
            .events()
            .iter()
            .any(|e| matches!(e, Heard::TotalTime(_))));
    }

    #[test]
    fn test_solo_clip_filters_cache() {
        let mut plain = Track::new("t-plain", "poly-synth");
        plain.events = vec![note(0.0, 60, 0.5)];
        plain.clips = vec![Clip::default()];

        let mut soloed = Track::new("t-solo", "poly-synth");
        soloed.events = vec![note(1.0, 72, 0.5)];
        soloed.clips = vec![Clip { solo: true, ..Clip::default() }];

        let f = fixture_with_tracks(vec![plain, soloed]);
        assert!(f.transport.has_solo_clips());

        let cache = f.transport.playback_cache();
        let mut keys = Vec::new();
        while let Some(m) = cache.next_message() {
            if let MidiMessage::NoteOn { key, .. } = m.message {
                keys.push(key);
            }
        }
        assert_eq!(keys, vec![72]);
    }

    #[test]
    fn test_metronome_adds_tick_track() {
        let f = fixture();
        f.transport
            .on_time_signatures_updated(Timeline::new(vec![TimeSignature::new(0.0, 4, 4)]));
        f.transport.on_metronome_flag_changed(true);
        assert!(f.transport.cache_is_outdated());

        let cache = f.transport.playback_cache();
        let mut metronome_keys = 0;
        while let Some(m) = cache.next_message() {
            if let MidiMessage::NoteOn { key: 76, .. } = m.message {
                metronome_keys += 1;
            }
        }
        // 8 beats of 4/4: downbeats at 0 and 4
        assert_eq!(metronome_keys, 2);

        f.transport.on_metronome_flag_changed(false);
        let cache = f.transport.playback_cache();
        let mut metronome_keys = 0;
        while let Some(m) = cache.next_message() {
            if let MidiMessage::NoteOn { key: 76, .. } = m.message {
                metronome_keys += 1;
            }
        }
        assert_eq!(metronome_keys, 0);
    }

    //===------------------------------------------------------------------===//
    // Instrument links
    //===------------------------------------------------------------------===//

    #[test]
    fn test_track_property_change_keeps_playback_when_instrument_same() {
        let f = fixture();
        let _ = f.transport.playback_cache();

        let track = f.transport.tracks_cache.lock()[0].clone();
        track.write().name = "renamed".to_string();
        f.transport.on_track_properties_changed(&track);
        assert!(!f.transport.cache_is_outdated());

        track.write().instrument_id = "default-synth".to_string();
        f.transport.on_track_properties_changed(&track);
        assert!(f.transport.cache_is_outdated());
    }

    #[test]
    fn test_removed_instrument_rebinds_to_default() {
        let f = fixture();
        f.orchestra.remove_instrument("poly-synth");

        // the cache was invalidated and the track now links to the default
        assert!(f.transport.cache_is_outdated());
        let linked = f.transport.linked_instrument(Some("t-notes"));
        assert_eq!(linked.id(), "default-synth");
    }

    #[test]
    fn test_instrument_removed_mid_playback_stops_cleanly() {
        let f = fixture();
        assert!(f.transport.start_playback());
        assert!(f.transport.is_playing());

        f.orchestra.remove_instrument("poly-synth");
        assert!(!f.transport.is_playing());

        // the next start uses a rebuilt cache routed to the default
        f.default_instrument.received();
        assert!(f.transport.start_playback());
        std::thread::sleep(Duration::from_millis(150));
        f.transport.stop_playback();

        let received = f.default_instrument.received();
        assert!(received
            .iter()
            .any(|m| matches!(m.message, MidiMessage::NoteOn { .. })));
    }

    //===------------------------------------------------------------------===//
    // Playback control
    //===------------------------------------------------------------------===//

    #[test]
    fn test_start_playback_without_project_fails() {
        let f = fixture_with_tracks(vec![]);
        assert!(!f.transport.start_playback());
        assert!(!f.transport.is_playing());
    }

    #[test]
    fn test_start_and_stop_playback() {
        let f = fixture();
        assert!(f.transport.start_playback());
        assert!(f.transport.is_playing());

        // tempo is announced before the playback state
        let events = f.listener.events();
        assert_eq!(events[0], Heard::Tempo(DEFAULT_MS_PER_BEAT));
        assert_eq!(events[1], Heard::Play);

        std::thread::sleep(Duration::from_millis(100));
        f.transport.stop_playback();
        assert!(!f.transport.is_playing());
        assert!(f.listener.events().contains(&Heard::Stop));

        // everything got silenced on stop
        let received = f.synth.received();
        assert!(received
            .iter()
            .any(|m| matches!(m.message, MidiMessage::AllNotesOff { .. })));
        assert!(received
            .iter()
            .any(|m| matches!(m.message, MidiMessage::AllSoundOff { .. })));
        assert!(received
            .iter()
            .any(|m| matches!(m.message, MidiMessage::AllControllersOff { .. })));
    }

    #[test]
    fn test_playback_fragment_completes_naturally() {
        let mut track = Track::new("t-notes", "poly-synth");
        track.events = vec![note(0.0, 60, 0.1)];
        let f = fixture_with_tracks(vec![track]);

        assert!(f.transport.start_playback_fragment(0.0, 0.5, false));
        std::thread::sleep(Duration::from_millis(500));
        assert!(!f.transport.is_playing());

        let _ = f.transport.dispatch_pending_events();
        assert!(f.listener.events().contains(&Heard::Stop));
    }

    #[test]
    fn test_loop_range_is_clamped() {
        let f = fixture();
        f.transport.set_playback_loop(4.0, 4.25);
        assert_eq!(f.transport.playback_loop_start(), 4.0);
        assert_eq!(f.transport.playback_loop_end(), 5.0);
        assert!(f
            .listener
            .events()
            .contains(&Heard::LoopMode(true, 4.0, 5.0)));

        f.transport.disable_playback_loop();
        assert!(!f.transport.has_playback_loop());
        assert!(f
            .listener
            .events()
            .contains(&Heard::LoopMode(false, 0.0, 0.0)));
    }

    #[test]
    fn test_toggle_playback_loop() {
        let f = fixture();
        f.transport.toggle_playback_loop(0.0, 4.0);
        assert!(f.transport.has_playback_loop());
        f.transport.toggle_playback_loop(0.0, 4.0);
        assert!(!f.transport.has_playback_loop());
    }

    //===------------------------------------------------------------------===//
    // Recording
    //===------------------------------------------------------------------===//

    #[test]
    fn test_recording_arms_with_single_device() {
        let f = fixture();
        f.transport.start_recording_with_devices(vec![MidiDeviceInfo {
            index: 0,
            name: "KeyStation".into(),
        }]);
        assert!(f.transport.is_recording());
        assert!(f.listener.events().contains(&Heard::Record));

        f.transport.stop_recording();
        assert!(!f.transport.is_recording());
        assert!(f.listener.events().contains(&Heard::Stop));
    }

    #[test]
    fn test_recording_fails_without_devices() {
        let f = fixture();
        f.transport.start_recording_with_devices(vec![]);
        assert!(!f.transport.is_recording());
        assert!(f.listener.events().contains(&Heard::RecordFailed(0)));
    }

    #[test]
    fn test_recording_fails_with_ambiguous_devices() {
        let f = fixture();
        f.transport.start_recording_with_devices(vec![
            MidiDeviceInfo { index: 0, name: "A".into() },
            MidiDeviceInfo { index: 1, name: "B".into() },
        ]);
        assert!(!f.transport.is_recording());
        assert!(f.listener.events().contains(&Heard::RecordFailed(2)));
    }

    //===------------------------------------------------------------------===//
    // Probing and previews
    //===------------------------------------------------------------------===//

    #[test]
    fn test_probe_sound_at_beat() {
        let mut track = Track::new("t-notes", "poly-synth");
        track.events = vec![note(0.0, 60, 2.0), note(4.0, 62, 1.0)];
        let f = fixture_with_tracks(vec![track]);

        f.transport.probe_sound_at(1.0, None);
        let received = f.synth.received();
        assert_eq!(received.len(), 1);
        assert!(matches!(received[0].message, MidiMessage::NoteOn { key: 60, .. }));

        // nothing sounds at beat 3
        f.transport.probe_sound_at(3.0, None);
        assert!(f.synth.received().is_empty());
    }

    #[test]
    fn test_preview_key_routes_to_linked_instrument() {
        let f = fixture();
        f.transport.preview_key(Some("t-notes"), 1, 60, 0.8, 0.5);
        std::thread::sleep(Duration::from_millis(120));

        let received = f.synth.received();
        assert!(received
            .iter()
            .any(|m| matches!(m.message, MidiMessage::NoteOn { key: 60, .. })));
        f.transport.stop_sound(None);
    }

    #[test]
    fn test_preview_key_falls_back_to_default_instrument() {
        let f = fixture();
        f.transport.preview_key(None, 1, 72, 0.8, 0.5);
        std::thread::sleep(Duration::from_millis(120));

        let received = f.default_instrument.received();
        assert!(received
            .iter()
            .any(|m| matches!(m.message, MidiMessage::NoteOn { key: 72, .. })));
        f.transport.stop_sound(None);
    }

    #[test]
    fn test_stop_sound_silences_and_cancels_previews() {
        let f = fixture();
        let _ = f.transport.playback_cache();

        f.transport.preview_key(Some("t-notes"), 1, 60, 0.8, 10.0);
        std::thread::sleep(Duration::from_millis(120)); // note-on went out
        f.transport.stop_sound(Some("t-notes"));

        let received = f.synth.received();
        assert!(received
            .iter()
            .any(|m| matches!(m.message, MidiMessage::NoteOff { key: 60, .. })));
        assert!(received
            .iter()
            .any(|m| matches!(m.message, MidiMessage::AllNotesOff { .. })));
    }
}
