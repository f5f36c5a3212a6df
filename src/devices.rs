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
use std::collections::{BTreeMap, BTreeSet};

use tracing::{debug, info};

use crate::{
    effects::{self, strobe_data, Color},
    protocol::{framing, hex, BusError, Transport, CMD_MSG, CMD_RESET, CMD_STOP, CMD_TICK},
    timing::Tick,
};

/// Effect class of the on/off strobe built into the strip firmware.
pub const STROBE_CHANNEL_CLASS: u8 = 0x10;

/// A device that keeps track of its own effect slots and only needs to be
/// told where the beat is.
pub trait Device: Send {
    fn name(&self) -> &str;

    /// Forwards the current beat position.
    fn tick(&mut self, tick: Tick) -> Result<(), BusError>;

    /// Drops every effect on the device.
    fn reset(&mut self) -> Result<(), BusError>;

    /// Starts an effect of the given class and returns the slot it landed in.
    fn add_effect(&mut self, class: u8, data: &[u8]) -> Result<u8, BusError>;

    /// Updates a running effect.
    fn msg_effect(&mut self, slot: u8, data: &[u8]) -> Result<(), BusError>;

    /// Stops a running effect and frees its slot.
    fn pop_effect(&mut self, slot: u8) -> Result<(), BusError>;
}

/// A point-to-point LED strip spoken to with stuffed frames.
pub struct StripDevice {
    name: String,
    addr: u8,
    flags: u8,
    transport: Box<dyn Transport>,
    slots: BTreeSet<u8>,
}

impl StripDevice {
    pub fn new(name: &str, addr: u8, flags: u8, transport: Box<dyn Transport>) -> StripDevice {
        StripDevice {
            name: name.to_string(),
            addr,
            flags,
            transport,
            slots: BTreeSet::new(),
        }
    }

    fn send(&mut self, payload: &[u8]) -> Result<(), BusError> {
        let frame = framing::stuffed(self.flags, self.addr, payload)?;
        debug!(device = self.name, payload = hex(payload), "Strip command");
        self.transport.write_frame(&frame)?;
        Ok(())
    }

    pub fn slots_in_use(&self) -> usize {
        self.slots.len()
    }
}

impl Device for StripDevice {
    fn name(&self) -> &str {
        &self.name
    }

    fn tick(&mut self, tick: Tick) -> Result<(), BusError> {
        self.send(&[CMD_TICK, tick.beat, tick.sub_beat])
    }

    fn reset(&mut self) -> Result<(), BusError> {
        info!(device = self.name, "Resetting strip.");
        self.slots.clear();
        self.send(&[CMD_RESET])
    }

    fn add_effect(&mut self, class: u8, data: &[u8]) -> Result<u8, BusError> {
        let slot = effects::allocate_slot(&[u16::from(self.addr)], |_, slot| {
            self.slots.contains(&slot)
        });
        let mut payload = vec![class, slot];
        payload.extend_from_slice(data);
        self.send(&payload)?;
        self.slots.insert(slot);
        Ok(slot)
    }

    fn msg_effect(&mut self, slot: u8, data: &[u8]) -> Result<(), BusError> {
        let mut payload = vec![CMD_MSG, slot];
        payload.extend_from_slice(data);
        self.send(&payload)
    }

    fn pop_effect(&mut self, slot: u8) -> Result<(), BusError> {
        self.slots.remove(&slot);
        self.send(&[CMD_STOP, slot])
    }
}

/// A strobe on one device that follows a held key. It lights on the first
/// tick the key is down and blanks once the key has been up for more than
/// `width` sub-beats.
#[derive(Debug)]
struct StrobeChannel {
    device: usize,
    color: Color,
    width: u8,
    slot: Option<u8>,
    held: bool,
    last_on: Option<Tick>,
}

impl StrobeChannel {
    fn tick(&mut self, device: &mut dyn Device, tick: Tick) -> Result<(), BusError> {
        let Some(slot) = self.slot else {
            return Ok(());
        };
        if self.held {
            if self.last_on.is_none() {
                device.msg_effect(slot, &strobe_data(self.color, true))?;
            }
            self.last_on = Some(tick);
        } else if let Some(last_on) = self.last_on {
            if tick.fracs_since(last_on) > u32::from(self.width) {
                device.msg_effect(slot, &strobe_data(self.color, false))?;
                self.last_on = None;
            }
        }
        Ok(())
    }
}

/// Drives a set of self-managing devices from the beat clock.
pub struct DeviceManager {
    devices: Vec<Box<dyn Device>>,
    /// Device name -> strobe channel.
    channels: BTreeMap<String, StrobeChannel>,
    /// Ticks are forwarded when the sub-beat is divisible by this. Every tick
    /// is forwarded when unset.
    tick_divisor: Option<u8>,
    last_tick: Option<Tick>,
}

impl DeviceManager {
    pub fn new(tick_divisor: Option<u8>) -> DeviceManager {
        DeviceManager {
            devices: Vec::new(),
            channels: BTreeMap::new(),
            tick_divisor: tick_divisor.filter(|n| *n > 0),
            last_tick: None,
        }
    }

    pub fn add_device(&mut self, device: Box<dyn Device>) {
        info!(device = device.name(), "Added device.");
        self.devices.push(device);
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    /// Holds the strobe on the named device, starting its channel on first
    /// use. Returns false when no device has that name.
    pub fn press_strobe(&mut self, device: &str, color: Color, width: u8) -> Result<bool, BusError> {
        let Some(index) = self.devices.iter().position(|d| d.name() == device) else {
            return Ok(false);
        };
        let channel = self
            .channels
            .entry(device.to_string())
            .or_insert_with(|| StrobeChannel {
                device: index,
                color,
                width,
                slot: None,
                held: false,
                last_on: None,
            });
        if channel.slot.is_none() {
            let slot = self.devices[index].add_effect(STROBE_CHANNEL_CLASS, &[])?;
            info!(device, slot, "Started strobe channel.");
            channel.slot = Some(slot);
        }
        channel.color = color;
        channel.width = width;
        channel.held = true;
        Ok(true)
    }

    /// Lets go of the strobe on the named device. It blanks after its width.
    pub fn release_strobe(&mut self, device: &str) {
        if let Some(channel) = self.channels.get_mut(device) {
            channel.held = false;
        }
    }

    /// Whether the named device's strobe is currently lit.
    pub fn strobe_lit(&self, device: &str) -> bool {
        self.channels
            .get(device)
            .is_some_and(|channel| channel.last_on.is_some())
    }

    /// Pops every strobe channel off its device.
    pub fn stop_channels(&mut self) -> Result<(), BusError> {
        for (name, mut channel) in std::mem::take(&mut self.channels) {
            if let Some(slot) = channel.slot.take() {
                info!(device = name, slot, "Stopping strobe channel.");
                self.devices[channel.device].pop_effect(slot)?;
            }
        }
        Ok(())
    }

    /// Forwards `tick` to every device, once per distinct tick. The first tick
    /// of a new beat is always forwarded as sub-beat zero. Strobe channels see
    /// every tick regardless of the gate.
    pub fn tick(&mut self, tick: Tick) -> Result<(), BusError> {
        if self.last_tick == Some(tick) {
            return Ok(());
        }
        let rollover = self.last_tick.map_or(true, |last| last.beat != tick.beat);
        self.last_tick = Some(tick);

        let mut tick = tick;
        if rollover {
            tick.sub_beat = 0;
        }
        for channel in self.channels.values_mut() {
            channel.tick(self.devices[channel.device].as_mut(), tick)?;
        }
        if let Some(divisor) = self.tick_divisor {
            if tick.sub_beat % divisor != 0 {
                return Ok(());
            }
        }
        for device in self.devices.iter_mut() {
            device.tick(tick)?;
        }
        Ok(())
    }

    /// Resets every device. Strobe channels are forgotten with their slots.
    pub fn reset_all(&mut self) -> Result<(), BusError> {
        self.channels.clear();
        for device in self.devices.iter_mut() {
            device.reset()?;
        }
        Ok(())
    }
}
