//! MIDI message plumbing between the transport and the instruments

mod device;
mod events;

pub use device::{autodetect_input_device, list_input_devices, DeviceSelectionError, MidiDeviceInfo};
pub use events::{now_ms, BeatMessage, MidiMessage, MidiMessageQueue, TimedMessage, NUM_CHANNELS};
