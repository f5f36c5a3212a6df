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
use std::fmt;

use tracing::warn;

use crate::{
    protocol::{Bus, BusError, CMD_MSG, CMD_STOP},
    timing::Tick,
};

pub mod color;
pub mod kind;

pub use color::Color;
pub use kind::{strobe_data, Data, EffectKind, TickState};

/// The slot handed out when every slot on a device is taken.
pub const FALLBACK_SLOT: u8 = 0xFF;

/// Where an effect is in its life.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    /// Created, nothing sent yet.
    Initialized,
    /// The start message has gone out.
    Started,
    /// The stop command has gone out. Terminal.
    Stopped,
}

/// A running instance of an effect kind, bound to a slot on one or more devices.
#[derive(Debug)]
pub struct Effect {
    name: String,
    kind: EffectKind,
    slot: u8,
    addresses: Vec<u16>,
    lifecycle: Lifecycle,
    state: TickState,
}

impl Effect {
    /// Creates an effect. Nothing is sent until [`Effect::start`].
    pub fn new(name: &str, kind: EffectKind, slot: u8, addresses: Vec<u16>) -> Effect {
        Effect {
            name: name.to_string(),
            kind,
            slot,
            addresses,
            lifecycle: Lifecycle::Initialized,
            state: TickState::default(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> &EffectKind {
        &self.kind
    }

    pub fn slot(&self) -> u8 {
        self.slot
    }

    pub fn addresses(&self) -> &[u16] {
        &self.addresses
    }

    pub fn lifecycle(&self) -> Lifecycle {
        self.lifecycle
    }

    /// Instantiates the effect on every device. The first message carries the
    /// kind identifier; everything after is an update.
    pub fn start(&mut self, bus: &mut Bus) -> Result<(), BusError> {
        if self.lifecycle != Lifecycle::Initialized {
            return Ok(());
        }
        let data = self.kind.start_data();
        self.msg(bus, &data)?;
        self.lifecycle = Lifecycle::Started;
        Ok(())
    }

    /// Sends `data` to every device the effect lives on.
    pub fn msg(&mut self, bus: &mut Bus, data: &[u8]) -> Result<(), BusError> {
        let opcode = match self.lifecycle {
            Lifecycle::Stopped => return Ok(()),
            Lifecycle::Started => CMD_MSG,
            Lifecycle::Initialized => self.kind.id(),
        };
        let mut payload = Vec::with_capacity(data.len() + 2);
        payload.push(opcode);
        payload.push(self.slot);
        payload.extend_from_slice(data);
        for addr in &self.addresses {
            bus.send(*addr, &payload)?;
        }
        Ok(())
    }

    /// Advances the effect's own behavior.
    pub fn tick(&mut self, bus: &mut Bus, tick: Tick) -> Result<(), BusError> {
        if self.lifecycle != Lifecycle::Started {
            return Ok(());
        }
        if let Some(data) = self.kind.tick_data(&mut self.state, tick) {
            self.msg(bus, &data)?;
        }
        Ok(())
    }

    /// Frees the slot on every device. Later calls do nothing.
    pub fn stop(&mut self, bus: &mut Bus) -> Result<(), BusError> {
        if self.lifecycle == Lifecycle::Stopped {
            return Ok(());
        }
        let mut payload = vec![CMD_STOP, self.slot];
        payload.extend_from_slice(&self.kind.stop_data());
        // Stopped is terminal even when a write below fails.
        self.lifecycle = Lifecycle::Stopped;
        for addr in &self.addresses {
            bus.send(*addr, &payload)?;
        }
        Ok(())
    }
}

impl fmt::Display for Effect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}) @ slot {}", self.name, self.kind, self.slot)
    }
}

/// Finds the lowest slot that is free on every device. When none is, the
/// fallback slot is returned and a warning is logged.
pub fn allocate_slot<F>(devices: &[u16], in_use: F) -> u8
where
    F: Fn(u16, u8) -> bool,
{
    match (0..=u8::MAX).find(|slot| devices.iter().all(|addr| !in_use(*addr, *slot))) {
        Some(slot) => slot,
        None => {
            warn!(
                devices = ?devices,
                slot = FALLBACK_SLOT,
                "No free effect slot; reusing fallback slot"
            );
            FALLBACK_SLOT
        }
    }
}
