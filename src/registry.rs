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
use std::collections::{BTreeMap, HashMap};

use tracing::{debug, info};

use crate::{
    broadcast::BeatListener,
    effects::{self, Effect, EffectKind},
    protocol::{Bus, BusError, CMD_PARAM, CMD_RESET, CMD_TICK},
    timing::Tick,
};

/// Internal handle for an effect in the arena.
type EffectId = u64;

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("an effect named {0} is already running")]
    DuplicateName(String),
    #[error(transparent)]
    Bus(#[from] BusError),
}

/// Tracks which effects live in which slot on which device and drives them
/// from the beat clock.
pub struct Registry {
    bus: Bus,
    effects: HashMap<EffectId, Effect>,
    next_id: EffectId,
    /// address -> (slot -> effect)
    slots: HashMap<u16, BTreeMap<u8, EffectId>>,
    /// name -> effect
    names: HashMap<String, EffectId>,
    /// Per-address color calibration sent after every reset.
    calibration: BTreeMap<u16, [u8; 4]>,
    /// A bus TICK goes out when the sub-beat is divisible by this.
    tick_divisor: Option<u8>,
    last_tick: Option<Tick>,
    listener: Option<Box<dyn BeatListener>>,
}

impl Registry {
    /// Creates an empty registry. Nothing is sent until [`Registry::reset_all`].
    pub fn new(bus: Bus, calibration: BTreeMap<u16, [u8; 4]>, tick_divisor: Option<u8>) -> Registry {
        Registry {
            bus,
            effects: HashMap::new(),
            next_id: 0,
            slots: HashMap::new(),
            names: HashMap::new(),
            calibration,
            tick_divisor: tick_divisor.filter(|n| *n > 0),
            last_tick: None,
            listener: None,
        }
    }

    /// Sets the listener notified of beats and scene changes.
    pub fn set_listener(&mut self, listener: Box<dyn BeatListener>) {
        self.listener = Some(listener);
    }

    /// Labels a device address for diagnostics.
    pub fn add_device(&mut self, addr: u16, name: &str) {
        self.bus.add_device(addr, name);
    }

    pub fn bus(&self) -> &Bus {
        &self.bus
    }

    /// Starts a new effect of `kind` on every address in `addresses`.
    pub fn add_effect(
        &mut self,
        name: &str,
        kind: EffectKind,
        addresses: &[u16],
    ) -> Result<&Effect, RegistryError> {
        if self.names.contains_key(name) {
            return Err(RegistryError::DuplicateName(name.to_string()));
        }

        let slot = effects::allocate_slot(addresses, |addr, slot| {
            self.slots
                .get(&addr)
                .is_some_and(|slots| slots.contains_key(&slot))
        });
        let mut effect = Effect::new(name, kind, slot, addresses.to_vec());
        effect.start(&mut self.bus)?;
        info!(effect = %effect, addresses = ?addresses, "Started effect.");

        let id = self.next_id;
        self.next_id += 1;
        for addr in addresses {
            self.slots.entry(*addr).or_default().insert(slot, id);
        }
        self.names.insert(name.to_string(), id);
        self.effects.insert(id, effect);
        Ok(&self.effects[&id])
    }

    /// Stops and forgets the named effect. Unknown names are ignored.
    pub fn stop_effect(&mut self, name: &str) -> Result<Option<Effect>, RegistryError> {
        let Some(id) = self.names.remove(name) else {
            return Ok(None);
        };
        let Some(mut effect) = self.effects.remove(&id) else {
            return Ok(None);
        };

        for addr in effect.addresses() {
            if let Some(slots) = self.slots.get_mut(addr) {
                // A later effect may have taken the fallback slot.
                if slots.get(&effect.slot()) == Some(&id) {
                    slots.remove(&effect.slot());
                }
            }
        }
        effect.stop(&mut self.bus)?;
        info!(effect = %effect, "Stopped effect.");
        Ok(Some(effect))
    }

    /// Sends `data` to the named effect. Unknown names are ignored.
    pub fn msg_effect(&mut self, name: &str, data: &[u8]) -> Result<(), RegistryError> {
        if let Some(effect) = self
            .names
            .get(name)
            .and_then(|id| self.effects.get_mut(id))
        {
            effect.msg(&mut self.bus, data)?;
        }
        Ok(())
    }

    pub fn effect_exists(&self, name: &str) -> bool {
        self.names.contains_key(name)
    }

    pub fn effect(&self, name: &str) -> Option<&Effect> {
        self.names.get(name).and_then(|id| self.effects.get(id))
    }

    /// The effect occupying `slot` on `addr`.
    pub fn effect_at(&self, addr: u16, slot: u8) -> Option<&Effect> {
        self.slots
            .get(&addr)
            .and_then(|slots| slots.get(&slot))
            .and_then(|id| self.effects.get(id))
    }

    /// Names of every effect reachable by name.
    pub fn effect_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.names.keys().map(String::as_str).collect();
        names.sort();
        names
    }

    /// Resets a single device and forgets the effects in its slots.
    ///
    /// Only this address's slot map is purged. An effect that also lives on
    /// other addresses drops out of the name index but keeps its slot there.
    pub fn reset_device(&mut self, addr: u16) -> Result<(), RegistryError> {
        info!(addr, "Resetting device.");
        self.bus.send(addr, &reset_payload())?;
        if let Some(calibration) = self.calibration.get(&addr) {
            self.bus.send(addr, &calibration_payload(calibration))?;
        }

        let Some(slots) = self.slots.remove(&addr) else {
            return Ok(());
        };
        for id in slots.into_values() {
            self.names.retain(|_, named| *named != id);
            let still_owned = self.slots.values().any(|slots| slots.values().any(|v| *v == id));
            if !still_owned {
                self.effects.remove(&id);
            }
        }
        Ok(())
    }

    /// Resets every device and sends each calibrated address its calibration.
    pub fn reset_all(&mut self) -> Result<(), RegistryError> {
        info!("Resetting all devices.");
        self.bus.send_to_all(&reset_payload())?;
        for (addr, calibration) in self.calibration.iter() {
            self.bus.send(*addr, &calibration_payload(calibration))?;
        }
        Ok(())
    }

    /// Dispatches a tick to the bus, the listener and every named effect.
    pub fn tick(&mut self, tick: Tick) -> Result<(), RegistryError> {
        if self.last_tick == Some(tick) {
            return Ok(());
        }
        let rollover = self.last_tick.map_or(true, |last| last.beat != tick.beat);
        self.last_tick = Some(tick);

        let mut tick = tick;
        if rollover {
            tick.sub_beat = 0;
            if let Some(listener) = &self.listener {
                listener.beat(tick.beat);
            }
        }
        if let Some(listener) = &self.listener {
            listener.sub_beat(tick.beat, tick.sub_beat);
        }

        if let Some(divisor) = self.tick_divisor {
            if tick.sub_beat % divisor == 0 {
                debug!(tick = %tick, "Bus tick");
                self.bus
                    .send_to_all(&[CMD_TICK, tick.beat, tick.sub_beat])?;
            }
        }

        for id in self.names.values() {
            if let Some(effect) = self.effects.get_mut(id) {
                effect.tick(&mut self.bus, tick)?;
            }
        }
        Ok(())
    }

    /// Tells the listener the scene changed.
    pub fn change_scene(&mut self, index: usize) {
        info!(index, "Changing scene.");
        if let Some(listener) = &self.listener {
            listener.change_scene(index);
        }
    }
}

fn reset_payload() -> [u8; 8] {
    [CMD_RESET, 0, 0, 0, 0, 0, 0, 0]
}

fn calibration_payload(calibration: &[u8; 4]) -> [u8; 8] {
    let [r, g, b, a] = *calibration;
    [CMD_PARAM, 0, r, g, b, a, 0, 0]
}

#[cfg(test)]
mod test {
    use std::collections::BTreeMap;

    use crate::{
        broadcast::test::RecordingListener,
        effects::{Color, EffectKind, Lifecycle, FALLBACK_SLOT},
        protocol::{
            transport::test::MockTransport, Bus, CMD_MSG, CMD_PARAM, CMD_RESET, CMD_STOP, CMD_TICK,
        },
        test::capture_warnings,
        timing::Tick,
    };

    use super::{Registry, RegistryError};

    fn registry(tick_divisor: Option<u8>) -> (MockTransport, Registry) {
        let mock = MockTransport::new();
        let bus = Bus::new(Box::new(mock.clone()), 0x0000);
        let mut calibration = BTreeMap::new();
        calibration.insert(0x0002, [255, 102, 102, 255]);
        (mock, Registry::new(bus, calibration, tick_divisor))
    }

    fn solid() -> EffectKind {
        EffectKind::Solid { color: Color::RED }
    }

    fn rainbow() -> EffectKind {
        EffectKind::Rainbow {
            l_period: 1,
            t_period: 1,
        }
    }

    #[test]
    fn test_add_effect_allocates_and_starts() {
        let (mock, mut registry) = registry(None);
        let effect = registry.add_effect("a", solid(), &[1, 2]).unwrap();
        assert_eq!(effect.slot(), 0);
        assert_eq!(effect.lifecycle(), Lifecycle::Started);

        let frames = mock.take();
        assert_eq!(frames.len(), 2);
        assert!(frames.iter().all(|f| f[3] == 0x00 && f[4] == 0));

        assert_eq!(registry.add_effect("b", solid(), &[2]).unwrap().slot(), 1);
        assert_eq!(registry.add_effect("c", solid(), &[3]).unwrap().slot(), 0);
        assert_eq!(registry.add_effect("d", solid(), &[1, 3]).unwrap().slot(), 1);
        assert!(registry.effect_exists("d"));
        assert_eq!(registry.effect_at(3, 1).map(|e| e.name()), Some("d"));
    }

    #[test]
    fn test_slot_exhaustion_falls_back() {
        let (_mock, mut registry) = registry(None);
        for i in 0..256 {
            let slot = registry
                .add_effect(&format!("e{}", i), solid(), &[7])
                .unwrap()
                .slot();
            assert_eq!(usize::from(slot), i);
        }
        let mut slot = 0;
        let logs = capture_warnings(|| {
            slot = registry.add_effect("e256", solid(), &[7]).unwrap().slot();
        });
        assert_eq!(slot, FALLBACK_SLOT);
        assert!(logs.contains("No free effect slot"));
        assert!(logs.contains("slot=255"));
        // The newest effect displaced the old one in the slot map.
        assert_eq!(
            registry.effect_at(7, FALLBACK_SLOT).map(|e| e.name()),
            Some("e256")
        );

        // Stopping the displaced effect leaves the newer one in place.
        assert!(registry.stop_effect("e255").unwrap().is_some());
        assert_eq!(
            registry.effect_at(7, FALLBACK_SLOT).map(|e| e.name()),
            Some("e256")
        );
    }

    #[test]
    fn test_duplicate_names_are_rejected() {
        let (mock, mut registry) = registry(None);
        registry.add_effect("a", solid(), &[1]).unwrap();
        mock.take();

        assert!(matches!(
            registry.add_effect("a", solid(), &[2]),
            Err(RegistryError::DuplicateName(_))
        ));
        assert_eq!(mock.frame_count(), 0);
        assert!(registry.effect_at(2, 0).is_none());
    }

    #[test]
    fn test_stop_effect() {
        let (mock, mut registry) = registry(None);
        registry.add_effect("a", solid(), &[1, 2]).unwrap();
        mock.take();

        let stopped = registry.stop_effect("a").unwrap().unwrap();
        assert_eq!(stopped.lifecycle(), Lifecycle::Stopped);
        let frames = mock.take();
        assert_eq!(frames.len(), 2);
        assert!(frames.iter().all(|f| f[3] == CMD_STOP && f[4] == 0));

        assert!(!registry.effect_exists("a"));
        assert!(registry.effect_at(1, 0).is_none());
        assert!(registry.effect_at(2, 0).is_none());

        // The slot is free again.
        assert_eq!(registry.add_effect("b", solid(), &[1]).unwrap().slot(), 0);
    }

    #[test]
    fn test_stop_unknown_effect_is_a_noop() {
        let (mock, mut registry) = registry(None);
        registry.add_effect("a", solid(), &[1]).unwrap();
        mock.take();

        assert!(registry.stop_effect("missing").unwrap().is_none());
        assert!(registry.stop_effect("missing").unwrap().is_none());
        assert_eq!(mock.frame_count(), 0);
        assert!(registry.effect_exists("a"));

        registry.msg_effect("missing", &[1, 2, 3]).unwrap();
        assert_eq!(mock.frame_count(), 0);
    }

    #[test]
    fn test_msg_effect() {
        let (mock, mut registry) = registry(None);
        registry.add_effect("a", solid(), &[1]).unwrap();
        mock.take();

        registry.msg_effect("a", &[9, 8]).unwrap();
        assert_eq!(mock.take(), vec![vec![1, 0, 4, CMD_MSG, 0, 9, 8, 0xFF]]);
    }

    #[test]
    fn test_reset_device_keeps_other_addresses() {
        let (mock, mut registry) = registry(None);
        registry.add_effect("shared", solid(), &[1, 2]).unwrap();
        registry.add_effect("only", solid(), &[1]).unwrap();
        mock.take();

        registry.reset_device(1).unwrap();
        assert_eq!(mock.take(), vec![vec![1, 0, 8, CMD_RESET, 0, 0, 0, 0, 0, 0, 0, 0xFF]]);

        assert!(!registry.effect_exists("shared"));
        assert!(!registry.effect_exists("only"));
        assert!(registry.effect_at(1, 0).is_none());
        assert!(registry.effect_at(1, 1).is_none());

        // The shared effect is no longer named but still owns its slot on 2.
        assert_eq!(registry.effect_at(2, 0).map(|e| e.name()), Some("shared"));
        assert_eq!(registry.add_effect("next", solid(), &[2]).unwrap().slot(), 1);
    }

    #[test]
    fn test_reset_sends_calibration() {
        let (mock, mut registry) = registry(None);
        registry.reset_device(2).unwrap();
        let frames = mock.take();
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[1], vec![2, 0, 8, CMD_PARAM, 0, 255, 102, 102, 255, 0, 0, 0xFF]);

        registry.reset_all().unwrap();
        let frames = mock.take();
        assert_eq!(frames.len(), 2);
        assert_eq!(&frames[0][..4], &[0, 0, 8, CMD_RESET]);
        assert_eq!(frames[1][0], 2);
    }

    #[test]
    fn test_tick_dedups_and_forces_downbeat() {
        let (mock, mut registry) = registry(Some(60));
        let listener = RecordingListener::default();
        registry.set_listener(Box::new(listener.clone()));

        registry.tick(Tick::new(0, 0)).unwrap();
        registry.tick(Tick::new(0, 0)).unwrap();
        registry.tick(Tick::new(0, 60)).unwrap();
        registry.tick(Tick::new(0, 61)).unwrap();
        // Rolled over past the downbeat; dispatched as sub-beat zero.
        registry.tick(Tick::new(1, 3)).unwrap();

        assert_eq!(
            listener.take(),
            vec![
                "beat 0",
                "sub_beat 0 0",
                "sub_beat 0 60",
                "sub_beat 0 61",
                "beat 1",
                "sub_beat 1 0"
            ]
        );
        assert_eq!(
            mock.take(),
            vec![
                vec![0, 0, 3, CMD_TICK, 0, 0, 0xFF],
                vec![0, 0, 3, CMD_TICK, 0, 60, 0xFF],
                vec![0, 0, 3, CMD_TICK, 1, 0, 0xFF],
            ]
        );

        // The raw tick is what gets deduplicated.
        registry.tick(Tick::new(1, 3)).unwrap();
        assert!(listener.take().is_empty());
    }

    #[test]
    fn test_tick_without_divisor_sends_no_bus_ticks() {
        let (mock, mut registry) = registry(None);
        registry.tick(Tick::new(0, 0)).unwrap();
        registry.tick(Tick::new(1, 0)).unwrap();
        assert_eq!(mock.frame_count(), 0);
    }

    #[test]
    fn test_tick_drives_named_effects() {
        let (mock, mut registry) = registry(None);
        registry.add_effect("rainbow", rainbow(), &[4]).unwrap();
        mock.take();

        registry.tick(Tick::new(2, 0)).unwrap();
        assert_eq!(mock.take(), vec![vec![4, 0, 8, CMD_MSG, 0, 1, 1, 2, 0, 0, 0, 0xFF]]);

        registry.tick(Tick::new(2, 50)).unwrap();
        assert_eq!(mock.frame_count(), 0);
    }

    #[test]
    fn test_change_scene_notifies_listener() {
        let (_mock, mut registry) = registry(None);
        let listener = RecordingListener::default();
        registry.set_listener(Box::new(listener.clone()));
        registry.change_scene(3);
        assert_eq!(listener.take(), vec!["scene 3"]);
    }

    #[test]
    fn test_transport_failure_propagates() {
        let (mock, mut registry) = registry(None);
        mock.set_failing(true);
        assert!(matches!(
            registry.add_effect("a", solid(), &[1]),
            Err(RegistryError::Bus(_))
        ));
        assert!(!registry.effect_exists("a"));
    }
}
