//! Offline rendering
//!
//! Runs the same schedule as the real-time player but never waits on the
//! wall clock: for every inter-event interval it pulls the corresponding
//! number of frames out of each instrument's audio graph, mixes them and
//! writes them to the output file, keeping a progress figure and a peak
//! thumbnail up to date for the UI to poll.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use hound::{SampleFormat, WavSpec, WavWriter};
use parking_lot::Mutex;

use super::cache::PlaybackCache;
use super::PlaybackContext;

/// Frames pulled per mixing round
const RENDER_BLOCK_FRAMES: usize = 512;

/// Output containers the UI can ask for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenderFormat {
    Wav,
    Flac,
}

impl RenderFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            Self::Wav => "wav",
            Self::Flac => "flac",
        }
    }
}

struct RenderState {
    is_rendering: AtomicBool,
    should_stop: AtomicBool,
    /// f32 progress in 0..=1, stored as bits
    progress_bits: AtomicU32,
    thumbnail: Mutex<Vec<f32>>,
}

/// The offline render worker; at most one render at a time
pub struct RendererThread {
    state: Arc<RenderState>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl Default for RendererThread {
    fn default() -> Self {
        Self {
            state: Arc::new(RenderState {
                is_rendering: AtomicBool::new(false),
                should_stop: AtomicBool::new(false),
                progress_bits: AtomicU32::new(0.0_f32.to_bits()),
                thumbnail: Mutex::new(Vec::new()),
            }),
            thread: Mutex::new(None),
        }
    }
}

impl RendererThread {
    /// Kick off a render; false when one is already running or the format
    /// has no encoder
    pub fn start_rendering(
        &self,
        path: &Path,
        format: RenderFormat,
        context: Arc<PlaybackContext>,
        cache: PlaybackCache,
        thumbnail_resolution: usize,
    ) -> bool {
        if self.state.is_rendering.swap(true, Ordering::SeqCst) {
            return false;
        }

        if format != RenderFormat::Wav {
            log::error!("No encoder for {:?} output", format);
            self.state.is_rendering.store(false, Ordering::SeqCst);
            return false;
        }

        self.state.should_stop.store(false, Ordering::SeqCst);
        self.state.progress_bits.store(0.0_f32.to_bits(), Ordering::SeqCst);
        *self.state.thumbnail.lock() = vec![0.0; thumbnail_resolution];

        log::info!("Rendering to {:?}", path);

        let state = Arc::clone(&self.state);
        let path: PathBuf = path.to_path_buf();
        let handle = thread::spawn(move || {
            render_run(&state, &path, &context, &cache);
            state.is_rendering.store(false, Ordering::SeqCst);
        });

        let mut slot = self.thread.lock();
        if let Some(old) = slot.replace(handle) {
            let _ = old.join();
        }

        true
    }

    /// Ask the worker to finish up; the file is finalized at the point
    /// reached so far
    pub fn stop(&self) {
        self.state.should_stop.store(true, Ordering::SeqCst);
    }

    pub fn is_rendering(&self) -> bool {
        self.state.is_rendering.load(Ordering::SeqCst)
    }

    /// Render progress, 0..=1
    pub fn percent_complete(&self) -> f32 {
        f32::from_bits(self.state.progress_bits.load(Ordering::SeqCst))
    }

    /// Downsampled peak array of the audio written so far
    pub fn waveform_thumbnail(&self) -> Vec<f32> {
        self.state.thumbnail.lock().clone()
    }
}

impl Drop for RendererThread {
    fn drop(&mut self) {
        self.stop();
        if let Some(handle) = self.thread.lock().take() {
            let _ = handle.join();
        }
    }
}

fn render_run(state: &RenderState, path: &Path, context: &PlaybackContext, cache: &PlaybackCache) {
    let sample_rate = if context.sample_rate > 0.0 { context.sample_rate } else { 44100.0 };
    let channels = context.num_output_channels.max(1);

    let spec = WavSpec {
        channels: channels as u16,
        sample_rate: sample_rate as u32,
        bits_per_sample: 32,
        sample_format: SampleFormat::Float,
    };

    let mut writer = match WavWriter::create(path, spec) {
        Ok(writer) => writer,
        Err(e) => {
            log::error!("Failed to create {:?}: {}", path, e);
            return;
        }
    };

    cache.seek_to_beat(context.start_beat);

    // controller snapshot first, stamped at the virtual start time
    for instrument in cache.unique_instruments() {
        for cc in 0..context.cc_states.len() {
            for channel in 1..=crate::audio::midi::NUM_CHANNELS {
                let value = context.cc_states[cc][(channel - 1) as usize];
                if value >= 0 {
                    let _ = instrument.midi_queue().push(crate::audio::midi::TimedMessage {
                        time_ms: context.start_beat_time_ms,
                        message: crate::audio::midi::MidiMessage::controller(
                            cc as u8,
                            value as u8,
                            channel,
                        ),
                    });
                }
            }
        }
    }

    let total_ms = context.total_time_ms.max(1.0);
    let total_frames = ((sample_rate * total_ms) / 1000.0).round().max(1.0) as u64;

    let mut tempo = context.start_beat_tempo;
    let mut prev_beat = context.start_beat as f64;
    let mut elapsed_ms = context.start_beat_time_ms;
    let mut frames_written: u64 = 0;

    let mut mix = vec![0.0f32; RENDER_BLOCK_FRAMES * channels];
    let mut scratch = vec![0.0f32; RENDER_BLOCK_FRAMES * 8];

    loop {
        if state.should_stop.load(Ordering::SeqCst) {
            break;
        }

        let next = match cache.next_message() {
            Some(message) if message.beat <= context.end_beat => Some(message),
            _ => None,
        };
        let event_ms = match &next {
            Some(message) => elapsed_ms + tempo * (message.beat as f64 - prev_beat).max(0.0),
            None => context.total_time_ms,
        };

        // pull and write the audio covering [elapsed_ms, event_ms)
        let mut frames = ((sample_rate * (event_ms - elapsed_ms).max(0.0)) / 1000.0).round() as u64;
        while frames > 0 && !state.should_stop.load(Ordering::SeqCst) {
            let block = (frames as usize).min(RENDER_BLOCK_FRAMES);

            mix[..block * channels].fill(0.0);
            for instrument in cache.unique_instruments() {
                let instrument_channels = instrument.num_output_channels().max(1);
                let needed = block * instrument_channels;
                if scratch.len() < needed {
                    scratch.resize(needed, 0.0);
                }

                instrument.render_next_block(block, &mut scratch[..needed]);

                for frame in 0..block {
                    for channel in 0..channels {
                        let source = frame * instrument_channels + channel.min(instrument_channels - 1);
                        mix[frame * channels + channel] += scratch[source];
                    }
                }
            }

            for sample in &mix[..block * channels] {
                if let Err(e) = writer.write_sample(*sample) {
                    log::error!("Render write failed: {}", e);
                    state.should_stop.store(true, Ordering::SeqCst);
                    break;
                }
            }

            update_thumbnail(state, &mix[..block * channels], channels, frames_written, total_frames);

            frames_written += block as u64;
            frames -= block as u64;

            let progress = (frames_written as f32 / total_frames as f32).min(1.0);
            state.progress_bits.store(progress.to_bits(), Ordering::SeqCst);
        }

        elapsed_ms = event_ms;

        let Some(message) = next else {
            break;
        };
        if state.should_stop.load(Ordering::SeqCst) {
            break;
        }

        prev_beat = message.beat as f64;

        if let Some(new_tempo) = message.message.tempo_ms_per_beat() {
            tempo = new_tempo;
        } else {
            let _ = message.instrument.midi_queue().push(crate::audio::midi::TimedMessage {
                time_ms: event_ms,
                message: message.message,
            });
        }
    }

    if let Err(e) = writer.finalize() {
        log::error!("Failed to finalize {:?}: {}", path, e);
    }

    if !state.should_stop.load(Ordering::SeqCst) {
        state.progress_bits.store(1.0_f32.to_bits(), Ordering::SeqCst);
    }

    log::info!("Rendered {} frames to {:?}", frames_written, path);
}

/// Fold a block of samples into the peak thumbnail
fn update_thumbnail(
    state: &RenderState,
    samples: &[f32],
    channels: usize,
    first_frame: u64,
    total_frames: u64,
) {
    let mut thumbnail = state.thumbnail.lock();
    let resolution = thumbnail.len();
    if resolution == 0 {
        return;
    }

    for (i, frame) in samples.chunks(channels).enumerate() {
        let frame_index = first_frame + i as u64;
        let bucket = ((frame_index * resolution as u64) / total_frames).min(resolution as u64 - 1);
        let peak = frame.iter().fold(0.0f32, |acc, s| acc.max(s.abs()));
        let slot = &mut thumbnail[bucket as usize];
        if peak > *slot {
            *slot = peak;
        }
    }
}
