//! Real-time player workers
//!
//! A pool of OS threads; at most one worker is active per transport. The
//! active worker owns a snapshot of the playback cache and a playback
//! context and paces itself against the wall clock, sleeping between events
//! on a condvar so that stop and speed-change signals interrupt it
//! immediately (and are polled at least every [`MIN_STOP_CHECK_MS`] even if
//! the notify is missed).

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::Sender;
use parking_lot::{Condvar, Mutex};

use super::cache::PlaybackCache;
use super::listener::TransportEvent;
use super::{PlaybackContext, NUM_CCS};
use crate::audio::midi::{MidiMessage, NUM_CHANNELS};

/// Stop signals cannot be delayed beyond this bound
pub const MIN_STOP_CHECK_MS: u64 = 200;

/// Idle workers kept around between playbacks
const MIN_POOL_SIZE: usize = 5;

/// Flags shared between a worker thread and its controller
struct WorkerSignals {
    should_exit: AtomicBool,
    is_running: AtomicBool,
    speed_multiplier_bits: AtomicU32,
    speed_changed: AtomicBool,
    wakeup_lock: Mutex<()>,
    wakeup: Condvar,
}

impl WorkerSignals {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            should_exit: AtomicBool::new(false),
            is_running: AtomicBool::new(false),
            speed_multiplier_bits: AtomicU32::new(1.0_f32.to_bits()),
            speed_changed: AtomicBool::new(false),
            wakeup_lock: Mutex::new(()),
            wakeup: Condvar::new(),
        })
    }

    fn speed_multiplier(&self) -> f32 {
        f32::from_bits(self.speed_multiplier_bits.load(Ordering::SeqCst))
    }

    fn notify(&self) {
        self.wakeup.notify_all();
    }
}

/// One reusable worker slot
struct PlayerThread {
    signals: Arc<WorkerSignals>,
    handle: Option<JoinHandle<()>>,
}

impl PlayerThread {
    fn new() -> Self {
        Self {
            signals: WorkerSignals::new(),
            handle: None,
        }
    }

    fn is_running(&self) -> bool {
        self.signals.is_running.load(Ordering::SeqCst)
    }

    fn signal_should_exit(&self) {
        self.signals.should_exit.store(true, Ordering::SeqCst);
        self.signals.notify();
    }

    fn start(
        &mut self,
        context: Arc<PlaybackContext>,
        cache: PlaybackCache,
        events: Sender<TransportEvent>,
    ) {
        debug_assert!(!self.is_running());

        // join the previous, already-finished run of this slot
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }

        // fresh flags so stale exit/speed signals cannot leak into this run
        self.signals = WorkerSignals::new();
        self.signals.is_running.store(true, Ordering::SeqCst);

        let signals = Arc::clone(&self.signals);
        self.handle = Some(thread::spawn(move || {
            player_run(&signals, &context, &cache, &events);
            signals.is_running.store(false, Ordering::SeqCst);
        }));
    }
}

struct PoolState {
    players: Vec<PlayerThread>,
    current: usize,
}

/// The worker pool; `current` is the only player a transport talks to
pub struct PlayerPool {
    state: Mutex<PoolState>,
}

impl Default for PlayerPool {
    fn default() -> Self {
        Self::new()
    }
}

impl PlayerPool {
    pub fn new() -> Self {
        let players = (0..MIN_POOL_SIZE).map(|_| PlayerThread::new()).collect();
        Self {
            state: Mutex::new(PoolState { players, current: 0 }),
        }
    }

    /// Arm a free worker and start dispatching
    pub fn start_playback(
        &self,
        context: Arc<PlaybackContext>,
        cache: PlaybackCache,
        events: Sender<TransportEvent>,
    ) {
        let mut state = self.state.lock();

        if state.players[state.current].is_running() {
            state.players[state.current].signal_should_exit();
        }

        let index = Self::find_next_free_player(&mut state);
        state.current = index;
        state.players[index].start(context, cache, events);
    }

    /// Signal the active worker to stop; it might be waiting for the next
    /// event, so it won't necessarily exit immediately
    pub fn stop_playback(&self) {
        let state = self.state.lock();
        let player = &state.players[state.current];
        if player.is_running() {
            player.signal_should_exit();
        }
    }

    pub fn is_playing(&self) -> bool {
        let state = self.state.lock();
        let player = &state.players[state.current];
        player.is_running() && !player.signals.should_exit.load(Ordering::SeqCst)
    }

    /// Rescale the beat-to-wall-clock mapping of the active worker
    pub fn set_speed_multiplier(&self, multiplier: f32) {
        debug_assert!(multiplier > 0.5 && multiplier < 5.0);
        let multiplier = multiplier.clamp(0.5 + f32::EPSILON, 5.0 - f32::EPSILON);

        let state = self.state.lock();
        let signals = &state.players[state.current].signals;
        signals.speed_multiplier_bits.store(multiplier.to_bits(), Ordering::SeqCst);
        signals.speed_changed.store(true, Ordering::SeqCst);
        signals.notify();
    }

    fn find_next_free_player(state: &mut PoolState) -> usize {
        Self::cleanup(state);

        for (i, player) in state.players.iter().enumerate() {
            if !player.is_running() {
                return i;
            }
        }

        log::warn!("All playback workers are busy, adding one");
        state.players.push(PlayerThread::new());
        state.players.len() - 1
    }

    fn cleanup(state: &mut PoolState) {
        // New workers are appended, so the front ones are the most likely
        // to have finished; reclaim from there until a busy one is met
        while state.players.len() > MIN_POOL_SIZE {
            if state.current == 0 || state.players[0].is_running() {
                return;
            }

            log::debug!("Removing a stale playback worker");
            let _ = state.players.remove(0);
            state.current -= 1;
        }
    }
}

impl Drop for PlayerPool {
    fn drop(&mut self) {
        let mut state = self.state.lock();
        for player in state.players.iter() {
            player.signal_should_exit();
        }
        for player in state.players.iter_mut() {
            if let Some(handle) = player.handle.take() {
                let _ = handle.join();
            }
        }
    }
}

/// Re-establish the controller state captured in the context
///
/// The context records which CC values are in effect at the start beat;
/// they are replayed to every instrument of the snapshot so the first
/// audible note lands on the right controller state.
fn send_cc_snapshot(context: &PlaybackContext, cache: &PlaybackCache) {
    for cc in 0..=NUM_CCS {
        for channel in 1..=NUM_CHANNELS {
            let value = context.cc_states[cc][(channel - 1) as usize];
            if value < 0 {
                continue;
            }

            let message = MidiMessage::controller(cc as u8, value as u8, channel);
            for instrument in cache.unique_instruments() {
                if !instrument.midi_queue().push_now(message) {
                    log::warn!("Instrument {} dropped a CC snapshot message", instrument.id());
                }
            }
        }
    }
}

/// The worker loop
fn player_run(
    signals: &WorkerSignals,
    context: &PlaybackContext,
    cache: &PlaybackCache,
    events: &Sender<TransportEvent>,
) {
    cache.seek_to_beat(context.start_beat);
    send_cc_snapshot(context, cache);

    let mut tempo = context.start_beat_tempo;
    let mut prev_beat = context.start_beat as f64;

    // virtual (musical) milliseconds at prev_beat; keeps growing across
    // loop iterations, which is exactly the wall-start advance the loop
    // rewind needs
    let mut virtual_ms = context.start_beat_time_ms;

    // the wall anchor maps virtual time to the monotonic clock; speed
    // changes rebase it so the current position is preserved
    let mut speed = signals.speed_multiplier() as f64;
    let mut anchor = Instant::now();
    let mut anchor_virtual_ms = virtual_ms;

    loop {
        let message = match cache.next_message() {
            Some(message) if message.beat <= context.end_beat => message,
            _ => {
                if context.loop_mode {
                    virtual_ms += tempo * (context.end_beat as f64 - prev_beat).max(0.0);
                    prev_beat = context.rewind_beat as f64;
                    cache.seek_to_beat(context.rewind_beat);
                    send_cc_snapshot(context, cache);
                    let _ = events.try_send(TransportEvent::Seek(context.rewind_beat));
                    continue;
                }

                if !signals.should_exit.load(Ordering::SeqCst) {
                    // natural completion
                    let _ = events.try_send(TransportEvent::Stop);
                }
                return;
            }
        };

        virtual_ms += tempo * (message.beat as f64 - prev_beat).max(0.0);
        prev_beat = message.beat as f64;

        // interruptible wait until the event's wall time
        loop {
            if signals.should_exit.load(Ordering::SeqCst) {
                return;
            }

            if signals.speed_changed.swap(false, Ordering::SeqCst) {
                let wall_elapsed_ms = anchor.elapsed().as_secs_f64() * 1000.0;
                anchor_virtual_ms += wall_elapsed_ms * speed;
                anchor = Instant::now();
                speed = signals.speed_multiplier() as f64;
            }

            let target_offset_ms = ((virtual_ms - anchor_virtual_ms) / speed).max(0.0);
            let elapsed_ms = anchor.elapsed().as_secs_f64() * 1000.0;
            if elapsed_ms >= target_offset_ms {
                break;
            }

            let remaining = Duration::from_secs_f64((target_offset_ms - elapsed_ms) / 1000.0);
            let timeout = remaining.min(Duration::from_millis(MIN_STOP_CHECK_MS));
            let mut guard = signals.wakeup_lock.lock();
            let _ = signals.wakeup.wait_for(&mut guard, timeout);
        }

        if let Some(new_tempo) = message.message.tempo_ms_per_beat() {
            tempo = new_tempo;
            let _ = events.try_send(TransportEvent::CurrentTempoChanged(tempo));
        } else if !message.instrument.midi_queue().push_now(message.message) {
            log::warn!(
                "Instrument {} dropped a message at beat {}",
                message.instrument.id(),
                message.beat
            );
        }

        let _ = events.try_send(TransportEvent::Seek(message.beat));
    }
}
