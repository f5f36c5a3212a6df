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
use std::io;

pub mod bus;
pub mod framing;
pub mod transport;

pub use bus::Bus;
pub use framing::FrameError;
pub use transport::Transport;

/// Advances the sub-beat clock on the receiving firmware.
pub const CMD_TICK: u8 = 0x80;
/// Updates the parameters of an already started effect slot.
pub const CMD_MSG: u8 = 0x81;
/// Frees an effect slot.
pub const CMD_STOP: u8 = 0x82;
/// Resets the device, dropping all slots.
pub const CMD_RESET: u8 = 0x83;
/// Sets a device parameter (calibration).
pub const CMD_PARAM: u8 = 0x85;

/// Errors while sending a command.
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("unable to frame command: {0}")]
    Frame(#[from] FrameError),
    #[error("transport write failed: {0}")]
    Io(#[from] io::Error),
}

/// Formats bytes as colon separated hex for logging.
pub fn hex(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect::<Vec<String>>()
        .join(":")
}
