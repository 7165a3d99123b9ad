//! MIDI input device enumeration
//!
//! Recording arms only when the input device can be picked unambiguously,
//! so all the transport needs from the MIDI backend is the device list.

use midir::MidiInput;

/// Information about a MIDI input device
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct MidiDeviceInfo {
    /// Device index (for connection)
    pub index: usize,
    /// Device name
    pub name: String,
}

/// Why a single input device could not be selected automatically
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceSelectionError {
    /// No MIDI inputs are present
    NoDevicesAvailable,
    /// More than one input is present and none is marked preferred
    AmbiguousDevices(Vec<MidiDeviceInfo>),
}

/// List available MIDI input devices
pub fn list_input_devices() -> Result<Vec<MidiDeviceInfo>, String> {
    let midi_in = MidiInput::new("backbeat-enumerate")
        .map_err(|e| format!("Failed to create MIDI input: {}", e))?;

    let ports = midi_in.ports();
    let mut devices = Vec::with_capacity(ports.len());

    for (index, port) in ports.iter().enumerate() {
        let name = midi_in
            .port_name(port)
            .unwrap_or_else(|_| format!("Unknown Device {}", index));
        devices.push(MidiDeviceInfo { index, name });
    }

    Ok(devices)
}

/// Pick the recording input when exactly one device is available
pub fn autodetect_input_device(
    devices: &[MidiDeviceInfo],
) -> Result<&MidiDeviceInfo, DeviceSelectionError> {
    match devices {
        [] => Err(DeviceSelectionError::NoDevicesAvailable),
        [only] => Ok(only),
        many => Err(DeviceSelectionError::AmbiguousDevices(many.to_vec())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn device(index: usize, name: &str) -> MidiDeviceInfo {
        MidiDeviceInfo { index, name: name.to_string() }
    }

    #[test]
    fn test_autodetect_empty() {
        assert_eq!(
            autodetect_input_device(&[]),
            Err(DeviceSelectionError::NoDevicesAvailable)
        );
    }

    #[test]
    fn test_autodetect_single() {
        let devices = [device(0, "KeyStation")];
        assert_eq!(autodetect_input_device(&devices), Ok(&devices[0]));
    }

    #[test]
    fn test_autodetect_ambiguous() {
        let devices = vec![device(0, "KeyStation"), device(1, "Launchpad")];
        match autodetect_input_device(&devices) {
            Err(DeviceSelectionError::AmbiguousDevices(all)) => assert_eq!(all, devices),
            other => panic!("Expected ambiguous devices, got {:?}", other),
        }
    }

    #[test]
    fn test_list_devices() {
        // Should not fail even with no devices connected
        let result = list_input_devices();
        assert!(result.is_ok());
    }
}
