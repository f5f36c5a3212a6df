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

use std::collections::BTreeMap;

use tracing::debug;

use super::{framing, BusError, Transport};

/// Label given to addresses first seen on send.
const UNKNOWN_DEVICE: &str = "(Unknown)";

/// Label of the broadcast address.
const ALL_DEVICES: &str = "(All)";

/// The shared multi-device bus. Every command is wrapped in an addressed frame.
pub struct Bus {
    transport: Box<dyn Transport>,
    /// Every address we've talked to, with a human readable label.
    addresses: BTreeMap<u16, String>,
    /// The address the bus hardware fans out to every device.
    broadcast: u16,
}

impl Bus {
    pub fn new(transport: Box<dyn Transport>, broadcast: u16) -> Bus {
        let mut addresses = BTreeMap::new();
        addresses.insert(broadcast, ALL_DEVICES.to_string());
        Bus {
            transport,
            addresses,
            broadcast,
        }
    }

    /// Labels a device address.
    pub fn add_device(&mut self, addr: u16, name: &str) {
        self.addresses.insert(addr, name.to_string());
    }

    /// The broadcast address.
    pub fn broadcast_address(&self) -> u16 {
        self.broadcast
    }

    /// Every address that has been labelled or sent to.
    pub fn known_addresses(&self) -> &BTreeMap<u16, String> {
        &self.addresses
    }

    /// Sends `payload` to a single address.
    pub fn send(&mut self, addr: u16, payload: &[u8]) -> Result<(), BusError> {
        let frame = framing::addressed(addr, payload)?;
        self.addresses
            .entry(addr)
            .or_insert_with(|| UNKNOWN_DEVICE.to_string());
        debug!(addr, "Bus command");
        self.transport.write_frame(&frame)?;
        Ok(())
    }

    /// Sends `payload` to the broadcast address.
    pub fn send_to_all(&mut self, payload: &[u8]) -> Result<(), BusError> {
        self.send(self.broadcast, payload)
    }
}
