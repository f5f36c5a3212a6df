// Copyright (C) 2026 Michael Wilson <mike@mdwn.dev>
//
// This program is free software: you can redistribute it and/or modify it under
// the terms of the GNU General Public License as published by the Free Software
// Foundation, version 3.
//
// This program is distributed in the hope that it will be useful, but WITHOUT
// ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS
// FOR A PARTICULAR PURPOSE. See the GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License along with
// this program. If not, see <https://www.gnu.org/licenses/>.
//
use std::time::Duration;

use duration_string::DurationString;
use serde::Deserialize;

/// The default serial speed.
pub const DEFAULT_BAUD: u32 = 115200;

/// The default pause after every frame.
pub const DEFAULT_FRAME_DELAY: Duration = Duration::from_micros(100);

fn default_baud() -> u32 {
    DEFAULT_BAUD
}

fn frame_delay(value: &Option<String>) -> Result<Duration, duration_string::Error> {
    value.as_ref().map_or(Ok(DEFAULT_FRAME_DELAY), |duration| {
        Ok(DurationString::from_string(duration.clone())?.into())
    })
}

/// A YAML representation of the shared addressed bus.
#[derive(Deserialize, Clone, Debug)]
pub struct Bus {
    /// The serial port the bus adapter is on.
    port: String,

    /// The serial speed.
    #[serde(default = "default_baud")]
    baud: u32,

    /// How long to pause after each frame.
    frame_delay: Option<String>,

    /// The address every device listens on.
    #[serde(default)]
    broadcast_address: u16,

    /// Send a TICK command every this many sub-beats. No ticks when unset.
    tick_divisor: Option<u8>,

    /// Log frames instead of writing them.
    #[serde(default)]
    dry_run: bool,
}

impl Bus {
    pub fn port(&self) -> &str {
        &self.port
    }

    pub fn baud(&self) -> u32 {
        self.baud
    }

    pub fn frame_delay(&self) -> Result<Duration, duration_string::Error> {
        frame_delay(&self.frame_delay)
    }

    pub fn broadcast_address(&self) -> u16 {
        self.broadcast_address
    }

    pub fn tick_divisor(&self) -> Option<u8> {
        self.tick_divisor
    }

    pub fn dry_run(&self) -> bool {
        self.dry_run
    }
}

/// A YAML representation of a point-to-point strip.
#[derive(Deserialize, Clone, Debug)]
pub struct Strip {
    /// Name used in logs.
    name: String,

    /// The serial port the strip is on.
    port: String,

    /// The serial speed.
    #[serde(default = "default_baud")]
    baud: u32,

    /// The strip's address byte.
    address: u8,

    /// The flags byte sent with every frame.
    #[serde(default)]
    flags: u8,

    /// How long to pause after each frame.
    frame_delay: Option<String>,
}

impl Strip {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn port(&self) -> &str {
        &self.port
    }

    pub fn baud(&self) -> u32 {
        self.baud
    }

    pub fn address(&self) -> u8 {
        self.address
    }

    pub fn flags(&self) -> u8 {
        self.flags
    }

    pub fn frame_delay(&self) -> Result<Duration, duration_string::Error> {
        frame_delay(&self.frame_delay)
    }
}

/// A named set of devices on the bus.
#[derive(Deserialize, Clone, Debug)]
pub struct Group {
    name: String,
    devices: Vec<Device>,
}

impl Group {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn devices(&self) -> &[Device] {
        &self.devices
    }

    pub fn addresses(&self) -> Vec<u16> {
        self.devices.iter().map(|d| d.address).collect()
    }
}

/// A single device on the bus.
#[derive(Deserialize, Clone, Debug)]
pub struct Device {
    address: u16,
    label: Option<String>,
}

impl Device {
    pub fn address(&self) -> u16 {
        self.address
    }

    pub fn label(&self) -> String {
        self.label
            .clone()
            .unwrap_or_else(|| format!("{:#06x}", self.address))
    }
}

/// Color correction for one device. Each channel is a factor in [0, 1].
#[derive(Deserialize, Clone, Debug)]
pub struct Calibration {
    address: u16,
    rgba: [f64; 4],
}

impl Calibration {
    pub fn address(&self) -> u16 {
        self.address
    }

    /// The factors scaled to bytes, or None if any is out of range.
    pub fn bytes(&self) -> Option<[u8; 4]> {
        let mut bytes = [0u8; 4];
        for (byte, factor) in bytes.iter_mut().zip(self.rgba.iter()) {
            if !(0.0..=1.0).contains(factor) {
                return None;
            }
            *byte = (factor * 255.0).round() as u8;
        }
        Some(bytes)
    }
}
