//! Interactive note previews
//!
//! Helps previewing notes from sequencer interactions. Note-ons are sent
//! after one timer tick rather than immediately: some synth plugins process
//! tightly packed on/off pairs out of order when the user drags notes
//! around quickly, and the small delay lets rapid updates coalesce. The
//! matching note-offs are tracked here and sent when the preview length
//! runs out, or when the transport cancels all pending previews.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::Mutex;

use crate::audio::midi::{now_ms, MidiMessage, TimedMessage};
use crate::audio::orchestra::Instrument;

/// Timer period; also the artificial note-on delay
pub const TICK_MS: i32 = 50;

struct KeyPreviewState {
    key: u8,
    channel: u8,
    volume: f32,
    note_on_timeout_ms: i32,
    note_off_timeout_ms: i32,
    instrument: Weak<dyn Instrument>,
}

struct PreviewShared {
    previews: Mutex<Vec<KeyPreviewState>>,
    timer_running: AtomicBool,
    should_stop: AtomicBool,
}

/// The preview scheduler; one timer thread, started on demand
pub struct NotePreviewTimer {
    shared: Arc<PreviewShared>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl Default for NotePreviewTimer {
    fn default() -> Self {
        Self {
            shared: Arc::new(PreviewShared {
                previews: Mutex::new(Vec::new()),
                timer_running: AtomicBool::new(false),
                should_stop: AtomicBool::new(false),
            }),
            thread: Mutex::new(None),
        }
    }
}

impl NotePreviewTimer {
    /// Schedule a preview note-on/note-off pair
    ///
    /// A pending preview of the same (key, channel) is refreshed in place;
    /// if its note-on already went out, the note-off is sent right away and
    /// the cycle restarts.
    pub fn preview_note(
        &self,
        instrument: Weak<dyn Instrument>,
        channel: u8,
        key: u8,
        volume: f32,
        note_off_timeout_ms: i32,
    ) {
        debug_assert!(key <= 127);
        debug_assert!(channel >= 1 && channel <= 16);

        let note_off_timeout_ms = note_off_timeout_ms.max(TICK_MS);

        {
            let mut previews = self.shared.previews.lock();
            if let Some(preview) = previews
                .iter_mut()
                .find(|p| p.key == key && p.channel == channel)
            {
                if preview.note_on_timeout_ms <= 0 && preview.note_off_timeout_ms > 0 {
                    send_note_off(preview, now_ms());
                }

                preview.volume = volume;
                preview.note_on_timeout_ms = TICK_MS;
                preview.note_off_timeout_ms = note_off_timeout_ms;
                preview.instrument = instrument;
            } else {
                previews.push(KeyPreviewState {
                    key,
                    channel,
                    volume,
                    note_on_timeout_ms: TICK_MS,
                    note_off_timeout_ms,
                    instrument,
                });
            }
        }

        self.ensure_timer_running();
    }

    /// Stop the timer and drop all previews, optionally closing the notes
    /// whose note-on already went out
    pub fn cancel_all_pending(&self, send_remaining_note_offs: bool) {
        self.shared.should_stop.store(true, Ordering::SeqCst);

        let mut previews = self.shared.previews.lock();
        if send_remaining_note_offs {
            for preview in previews.iter() {
                if preview.note_on_timeout_ms <= 0 && preview.note_off_timeout_ms > 0 {
                    send_note_off(preview, now_ms());
                }
            }
        }
        previews.clear();
    }

    fn ensure_timer_running(&self) {
        if self.shared.timer_running.swap(true, Ordering::SeqCst) {
            return;
        }

        self.shared.should_stop.store(false, Ordering::SeqCst);
        let shared = Arc::clone(&self.shared);
        let handle = thread::spawn(move || preview_timer_loop(&shared));

        let mut slot = self.thread.lock();
        if let Some(old) = slot.replace(handle) {
            let _ = old.join();
        }
    }
}

impl Drop for NotePreviewTimer {
    fn drop(&mut self) {
        self.cancel_all_pending(false);
        if let Some(handle) = self.thread.lock().take() {
            let _ = handle.join();
        }
    }
}

fn preview_timer_loop(shared: &PreviewShared) {
    loop {
        thread::sleep(Duration::from_millis(TICK_MS as u64));

        if shared.should_stop.load(Ordering::SeqCst) {
            break;
        }
        if tick(shared) {
            break;
        }
    }

    shared.timer_running.store(false, Ordering::SeqCst);
}

/// Advance all previews by one tick; returns true when nothing is pending
fn tick(shared: &PreviewShared) -> bool {
    // iSEM tends to hang if too many messages arrive simultaneously, so on
    // mobile every tick lands at a slightly randomized timestamp
    #[cfg(any(target_os = "android", target_os = "ios"))]
    let time_ms = {
        use rand::Rng;
        now_ms() + rand::thread_rng().gen_range(0.0..50.0)
    };
    #[cfg(not(any(target_os = "android", target_os = "ios")))]
    let time_ms = now_ms();

    let mut previews = shared.previews.lock();
    let mut can_stop = true;

    for preview in previews.iter_mut() {
        if preview.note_on_timeout_ms > 0 {
            can_stop = false;
            preview.note_on_timeout_ms -= TICK_MS;

            if preview.note_on_timeout_ms <= 0 {
                send_note_on(preview, time_ms);
            }
        } else if preview.note_off_timeout_ms > 0 {
            can_stop = false;
            preview.note_off_timeout_ms -= TICK_MS;

            if preview.note_off_timeout_ms <= 0 {
                send_note_off(preview, time_ms);
            }
        }
    }

    previews.retain(|p| p.note_on_timeout_ms > 0 || p.note_off_timeout_ms > 0);
    can_stop
}

fn send_note_on(preview: &KeyPreviewState, time_ms: f64) {
    if let Some(instrument) = preview.instrument.upgrade() {
        let (key, channel) = instrument
            .keyboard_mapping()
            .map(preview.key, preview.channel);
        let velocity = (preview.volume.clamp(0.0, 1.0) * 127.0).round() as u8;
        let _ = instrument.midi_queue().push(TimedMessage {
            time_ms,
            message: MidiMessage::note_on(key, velocity, channel),
        });
    }
}

fn send_note_off(preview: &KeyPreviewState, time_ms: f64) {
    if let Some(instrument) = preview.instrument.upgrade() {
        let (key, channel) = instrument
            .keyboard_mapping()
            .map(preview.key, preview.channel);
        let _ = instrument.midi_queue().push(TimedMessage {
            time_ms,
            message: MidiMessage::note_off(key, channel),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::orchestra::testing::MockInstrument;
    use crate::audio::orchestra::KeyboardMapping;

    fn kinds(instrument: &MockInstrument) -> Vec<&'static str> {
        instrument
            .received()
            .iter()
            .map(|m| match m.message {
                MidiMessage::NoteOn { .. } => "on",
                MidiMessage::NoteOff { .. } => "off",
                _ => "other",
            })
            .collect()
    }

    #[test]
    fn test_single_preview_sends_one_on_one_off() {
        let instrument = MockInstrument::new("synth");
        let timer = NotePreviewTimer::default();

        timer.preview_note(Arc::downgrade(&instrument) as Weak<dyn Instrument>, 1, 60, 0.8, 150);

        // TICK + off timeout + TICK of slack
        thread::sleep(Duration::from_millis(400));
        assert_eq!(kinds(&instrument), vec!["on", "off"]);

        // the entry is gone and the timer has wound down
        assert!(timer.shared.previews.lock().is_empty());
        assert!(!timer.shared.timer_running.load(Ordering::SeqCst));
    }

    #[test]
    fn test_refresh_before_note_on_coalesces() {
        let instrument = MockInstrument::new("synth");
        let timer = NotePreviewTimer::default();
        let weak = Arc::downgrade(&instrument) as Weak<dyn Instrument>;

        timer.preview_note(weak.clone(), 1, 60, 0.8, 150);
        // immediately again, before the first tick fired the note-on
        timer.preview_note(weak, 1, 60, 0.9, 150);

        thread::sleep(Duration::from_millis(400));
        assert_eq!(kinds(&instrument), vec!["on", "off"]);
    }

    #[test]
    fn test_retrigger_after_note_on_restarts_cycle() {
        let instrument = MockInstrument::new("synth");
        let timer = NotePreviewTimer::default();
        let weak = Arc::downgrade(&instrument) as Weak<dyn Instrument>;

        timer.preview_note(weak.clone(), 1, 60, 0.8, 200);
        // wait for the note-on to fire, then retrigger the same key
        thread::sleep(Duration::from_millis(120));
        timer.preview_note(weak, 1, 60, 0.8, 200);

        thread::sleep(Duration::from_millis(450));
        assert_eq!(kinds(&instrument), vec!["on", "off", "on", "off"]);
    }

    #[test]
    fn test_cancel_all_sends_remaining_note_offs() {
        let instrument = MockInstrument::new("synth");
        let timer = NotePreviewTimer::default();

        timer.preview_note(Arc::downgrade(&instrument) as Weak<dyn Instrument>, 1, 60, 0.8, 10_000);
        thread::sleep(Duration::from_millis(120));

        timer.cancel_all_pending(true);
        assert_eq!(kinds(&instrument), vec!["on", "off"]);
        assert!(timer.shared.previews.lock().is_empty());
    }

    #[test]
    fn test_cancel_all_without_note_offs() {
        let instrument = MockInstrument::new("synth");
        let timer = NotePreviewTimer::default();

        timer.preview_note(Arc::downgrade(&instrument) as Weak<dyn Instrument>, 1, 60, 0.8, 10_000);
        thread::sleep(Duration::from_millis(120));

        timer.cancel_all_pending(false);
        assert_eq!(kinds(&instrument), vec!["on"]);
    }

    #[test]
    fn test_preview_applies_keyboard_mapping() {
        let mut mapping = KeyboardMapping::new();
        mapping.set((60, 1), (48, 5));
        let instrument = MockInstrument::with_mapping("synth", mapping);
        let timer = NotePreviewTimer::default();

        timer.preview_note(Arc::downgrade(&instrument) as Weak<dyn Instrument>, 1, 60, 1.0, 100);
        thread::sleep(Duration::from_millis(300));

        let received = instrument.received();
        assert_eq!(received[0].message, MidiMessage::note_on(48, 127, 5));
    }

    #[test]
    fn test_dead_instrument_is_ignored() {
        let timer = NotePreviewTimer::default();
        let weak = {
            let instrument = MockInstrument::new("gone");
            Arc::downgrade(&instrument) as Weak<dyn Instrument>
        };

        // must not panic or wedge the timer
        timer.preview_note(weak, 1, 60, 0.8, 100);
        thread::sleep(Duration::from_millis(300));
        assert!(!timer.shared.timer_running.load(Ordering::SeqCst));
    }
}
