//! Audio device enumeration and selection.

use serde::{Deserialize, Serialize};

/// Which side of the device a descriptor refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceDirection {
    Capture,
    Playback,
}

impl std::fmt::Display for DeviceDirection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeviceDirection::Capture => f.write_str("capture"),
            DeviceDirection::Playback => f.write_str("playback"),
        }
    }
}

/// Metadata about an audio device.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceInfo {
    /// Human-readable device name reported by the OS.
    pub name: String,
    pub direction: DeviceDirection,
    /// Whether this is the system default device for `direction`.
    pub is_default: bool,
    /// Heuristic flag for capture devices that likely record system output.
    /// Converting from one of these while playing back creates a feedback loop.
    pub is_loopback_like: bool,
}

const LOOPBACK_KEYWORDS: &[&str] = &[
    "stereo mix",
    "wave out",
    "what u hear",
    "what you hear",
    "loopback",
    "virtual output",
    "monitor of",
    "mix stereo",
];

/// Best-effort heuristic for loopback/system-output capture devices.
pub fn is_loopback_like_name(name: &str) -> bool {
    let lowered = name.trim().to_ascii_lowercase();
    LOOPBACK_KEYWORDS.iter().any(|k| lowered.contains(k))
}

/// List devices for one direction.
///
/// Returns an empty `Vec` if cpal is not available or no devices exist.
#[cfg(feature = "audio-cpal")]
pub fn list_devices(direction: DeviceDirection) -> Vec<DeviceInfo> {
    use cpal::traits::{DeviceTrait, HostTrait};

    let host = cpal::default_host();
    let (default_name, devices) = match direction {
        DeviceDirection::Capture => (
            host.default_input_device().and_then(|d| d.name().ok()),
            host.input_devices().map(|d| d.collect::<Vec<_>>()),
        ),
        DeviceDirection::Playback => (
            host.default_output_device().and_then(|d| d.name().ok()),
            host.output_devices().map(|d| d.collect::<Vec<_>>()),
        ),
    };

    let devices = match devices {
        Ok(d) => d,
        Err(e) => {
            tracing::warn!(%direction, "failed to enumerate devices: {e}");
            return default_name
                .map(|name| vec![describe(name, direction, true)])
                .unwrap_or_default();
        }
    };

    let mut list: Vec<DeviceInfo> = devices
        .iter()
        .enumerate()
        .map(|(idx, device)| {
            let name = device
                .name()
                .unwrap_or_else(|_| format!("Device {}", idx + 1));
            let is_default = default_name.as_deref() == Some(name.as_str());
            describe(name, direction, is_default)
        })
        .collect();

    list.sort_by_key(|d| (!d.is_default, d.is_loopback_like, d.name.to_ascii_lowercase()));
    list
}

#[cfg(not(feature = "audio-cpal"))]
pub fn list_devices(_direction: DeviceDirection) -> Vec<DeviceInfo> {
    vec![]
}

fn describe(name: String, direction: DeviceDirection, is_default: bool) -> DeviceInfo {
    let is_loopback_like = direction == DeviceDirection::Capture && is_loopback_like_name(&name);
    DeviceInfo {
        name,
        direction,
        is_default,
        is_loopback_like,
    }
}

/// Resolve a device by preferred name, otherwise the default device, otherwise
/// the first one available.
#[cfg(feature = "audio-cpal")]
pub(crate) fn select_device(
    direction: DeviceDirection,
    preferred: Option<&str>,
) -> crate::error::Result<cpal::Device> {
    use crate::error::VoxError;
    use cpal::traits::{DeviceTrait, HostTrait};

    let host = cpal::default_host();
    let enumerate = || match direction {
        DeviceDirection::Capture => host.input_devices().map(|d| d.collect::<Vec<_>>()),
        DeviceDirection::Playback => host.output_devices().map(|d| d.collect::<Vec<_>>()),
    };

    if let Some(wanted) = preferred {
        match enumerate() {
            Ok(devices) => {
                if let Some(found) = devices
                    .into_iter()
                    .find(|d| d.name().map(|n| n == wanted).unwrap_or(false))
                {
                    return Ok(found);
                }
                tracing::warn!(%direction, wanted, "preferred device not found, falling back");
            }
            Err(e) => tracing::warn!(%direction, "failed to list devices: {e}"),
        }
    }

    let default = match direction {
        DeviceDirection::Capture => host.default_input_device(),
        DeviceDirection::Playback => host.default_output_device(),
    };
    if let Some(device) = default {
        return Ok(device);
    }

    tracing::warn!(%direction, "no default device, falling back to first available");
    enumerate()
        .map_err(|e| VoxError::Transport(format!("{direction} devices: {e}")))?
        .into_iter()
        .next()
        .ok_or_else(|| VoxError::Config(format!("no {direction} device available")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_common_loopback_names() {
        assert!(is_loopback_like_name("Stereo Mix (Realtek Audio)"));
        assert!(is_loopback_like_name("What U Hear (Sound Blaster)"));
        assert!(is_loopback_like_name("Monitor of Built-in Audio"));
        assert!(!is_loopback_like_name("Microphone Array (USB PnP Audio Device)"));
    }

    #[test]
    fn playback_devices_are_never_flagged_loopback() {
        let info = describe("Loopback Out".into(), DeviceDirection::Playback, false);
        assert!(!info.is_loopback_like);
        let info = describe("Loopback In".into(), DeviceDirection::Capture, false);
        assert!(info.is_loopback_like);
    }

    #[test]
    fn direction_serializes_lowercase() {
        let json = serde_json::to_string(&DeviceDirection::Playback).unwrap();
        assert_eq!(json, "\"playback\"");
    }
}
