//! Transport listeners and the worker-to-UI event bus
//!
//! Listener callbacks are a UI-thread affair. Calls made on the control
//! thread fan out directly; player and renderer workers never touch the
//! listener list and instead post events into a bounded channel which the
//! host drains from its UI thread via `Transport::dispatch_pending_events`.

use std::sync::Arc;

use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use parking_lot::Mutex;

use crate::audio::midi::MidiDeviceInfo;

/// Subscriber to transport state changes; all methods default to no-ops
pub trait TransportListener: Send + Sync {
    fn on_play(&self) {}
    fn on_stop(&self) {}
    fn on_record(&self) {}
    fn on_record_failed(&self, _devices: &[MidiDeviceInfo]) {}
    fn on_seek(&self, _beat: f32) {}
    fn on_current_tempo_changed(&self, _ms_per_beat: f64) {}
    fn on_total_time_changed(&self, _total_ms: f64) {}
    fn on_loop_mode_changed(&self, _enabled: bool, _start_beat: f32, _end_beat: f32) {}
}

/// A listener notification in transit from a worker thread
#[derive(Debug, Clone)]
pub enum TransportEvent {
    Play,
    Stop,
    Record,
    RecordFailed(Vec<MidiDeviceInfo>),
    Seek(f32),
    CurrentTempoChanged(f64),
    TotalTimeChanged(f64),
    LoopModeChanged { enabled: bool, start_beat: f32, end_beat: f32 },
}

const EVENT_QUEUE_CAPACITY: usize = 256;

/// Listener list plus the bounded worker channel
pub struct ListenerBus {
    listeners: Mutex<Vec<Arc<dyn TransportListener>>>,
    tx: Sender<TransportEvent>,
    rx: Receiver<TransportEvent>,
}

impl Default for ListenerBus {
    fn default() -> Self {
        let (tx, rx) = bounded(EVENT_QUEUE_CAPACITY);
        Self {
            listeners: Mutex::new(Vec::new()),
            tx,
            rx,
        }
    }
}

impl ListenerBus {
    pub fn add(&self, listener: Arc<dyn TransportListener>) {
        self.listeners.lock().push(listener);
    }

    pub fn remove(&self, listener: &Arc<dyn TransportListener>) {
        self.listeners.lock().retain(|l| !Arc::ptr_eq(l, listener));
    }

    /// A sender handle for worker threads
    pub fn sender(&self) -> Sender<TransportEvent> {
        self.tx.clone()
    }

    /// Post from a worker; drops the event when the UI is hopelessly behind
    pub fn post(&self, event: TransportEvent) {
        if let Err(TrySendError::Full(event)) = self.tx.try_send(event) {
            log::warn!("Transport event queue full, dropping {:?}", event);
        }
    }

    /// Fan an event out to every listener, on the calling thread
    pub fn broadcast(&self, event: &TransportEvent) {
        // snapshot under a short lock, call outside of it
        let listeners = self.listeners.lock().clone();
        for listener in &listeners {
            match event {
                TransportEvent::Play => listener.on_play(),
                TransportEvent::Stop => listener.on_stop(),
                TransportEvent::Record => listener.on_record(),
                TransportEvent::RecordFailed(devices) => listener.on_record_failed(devices),
                TransportEvent::Seek(beat) => listener.on_seek(*beat),
                TransportEvent::CurrentTempoChanged(tempo) => {
                    listener.on_current_tempo_changed(*tempo)
                }
                TransportEvent::TotalTimeChanged(ms) => listener.on_total_time_changed(*ms),
                TransportEvent::LoopModeChanged { enabled, start_beat, end_beat } => {
                    listener.on_loop_mode_changed(*enabled, *start_beat, *end_beat)
                }
            }
        }
    }

    /// Drain queued worker events and fan each out; returns the drain count
    pub fn dispatch_pending(&self) -> usize {
        let mut count = 0;
        while let Ok(event) = self.rx.try_recv() {
            self.broadcast(&event);
            count += 1;
        }
        count
    }
}
