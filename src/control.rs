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
use std::{
    collections::{BTreeMap, HashMap},
    error::Error,
    time::Duration,
};

use tracing::{info, span, warn, Level};

use crate::{
    devices::DeviceManager,
    input::{InputEvent, Keyboards, Led},
    registry::Registry,
    timing::{self, Tick, Timebase},
};

/// Reacts to a key event by changing the stage.
pub type Handler = Box<dyn FnMut(&InputEvent, &mut Stage) -> Result<(), Box<dyn Error>> + Send>;

/// Everything a key handler is allowed to touch.
pub struct Stage {
    pub timebase: Timebase,
    pub registry: Registry,
    pub devices: DeviceManager,
    /// Device group name -> bus addresses.
    groups: BTreeMap<String, Vec<u16>>,
    running: bool,
}

impl Stage {
    pub fn new(
        timebase: Timebase,
        registry: Registry,
        devices: DeviceManager,
        groups: BTreeMap<String, Vec<u16>>,
    ) -> Stage {
        Stage {
            timebase,
            registry,
            devices,
            groups,
            running: true,
        }
    }

    /// Ends the control loop after the current event.
    pub fn quit(&mut self) {
        info!("Quitting.");
        self.running = false;
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    pub fn group(&self, name: &str) -> Option<&[u16]> {
        self.groups.get(name).map(Vec::as_slice)
    }

    /// The addresses of every device in `groups`, without repeats.
    pub fn addresses(&self, groups: &[String]) -> Vec<u16> {
        let mut addresses = Vec::new();
        for name in groups {
            let Some(group) = self.group(name) else {
                warn!(group = name, "Unknown device group");
                continue;
            };
            for addr in group {
                if !addresses.contains(addr) {
                    addresses.push(*addr);
                }
            }
        }
        addresses
    }
}

/// The single threaded loop that keeps the beat, drives the devices and
/// handles key presses.
pub struct ControlLoop {
    stage: Stage,
    keyboards: Keyboards,
    /// Keyboard id -> handlers, in registration order.
    handlers: HashMap<usize, Vec<Handler>>,
    poll_interval: Duration,
    last_beat: Option<u8>,
}

impl ControlLoop {
    pub fn new(stage: Stage, keyboards: Keyboards, poll_interval: Duration) -> ControlLoop {
        ControlLoop {
            stage,
            keyboards,
            handlers: HashMap::new(),
            poll_interval,
            last_beat: None,
        }
    }

    /// Adds a handler for events from keyboard `device_id`.
    pub fn register(&mut self, device_id: usize, handler: Handler) {
        self.handlers.entry(device_id).or_default().push(handler);
    }

    pub fn stage(&self) -> &Stage {
        &self.stage
    }

    pub fn stage_mut(&mut self) -> &mut Stage {
        &mut self.stage
    }

    /// Runs one iteration at time `now`. Returns false once the loop should end.
    pub fn run_once(&mut self, now: f64) -> Result<bool, Box<dyn Error>> {
        let tick = self.stage.timebase.tick(now);
        self.stage.registry.tick(tick)?;
        self.stage.devices.tick(tick)?;
        self.blink(tick);

        while let Ok(event) = self.keyboards.events().try_recv() {
            self.dispatch(&event)?;
            if !self.stage.running {
                break;
            }
        }
        Ok(self.stage.running)
    }

    fn dispatch(&mut self, event: &InputEvent) -> Result<(), Box<dyn Error>> {
        if let Some(handlers) = self.handlers.get_mut(&event.device_id) {
            for handler in handlers.iter_mut() {
                handler(event, &mut self.stage)?;
            }
        }
        Ok(())
    }

    /// Caps lock follows the beat: on for even beats, off for odd.
    fn blink(&mut self, tick: Tick) {
        if self.last_beat == Some(tick.beat) {
            return;
        }
        self.last_beat = Some(tick.beat);
        self.keyboards
            .set_all_leds(Led::CapsLock, tick.beat % 2 == 0);
    }

    /// Resets every device and runs until a handler quits or something fails.
    /// Keyboards are stopped on the way out; a keyboard blocked in a read
    /// holds up shutdown until its next key event.
    pub fn run(&mut self) -> Result<(), Box<dyn Error>> {
        let span = span!(Level::INFO, "control loop");
        let _enter = span.enter();

        self.stage.registry.reset_all()?;
        self.stage.devices.reset_all()?;
        info!(
            bpm = self.stage.timebase.bpm(),
            keyboards = self.keyboards.len(),
            "Control loop started."
        );

        let result = loop {
            match self.run_once(timing::now()) {
                Ok(true) => spin_sleep::sleep(self.poll_interval),
                Ok(false) => break Ok(()),
                Err(e) => break Err(e),
            }
        };

        if let Err(e) = self.stage.devices.stop_channels() {
            warn!(err = e.to_string(), "Unable to stop strobe channels");
        }
        self.keyboards.set_all_leds(Led::CapsLock, false);
        self.keyboards.stop();
        info!("Control loop stopped.");
        result
    }
}

#[cfg(test)]
pub(crate) mod test {
    use std::{collections::BTreeMap, sync::Arc, time::Duration};

    use parking_lot::Mutex;

    use crate::{
        devices::DeviceManager,
        effects::EffectKind,
        input::{
            test::{key, RecordingLeds, ScriptedSource},
            InputEvent, Keyboards, Led, Transition,
        },
        protocol::{transport::test::MockTransport, Bus, CMD_MSG},
        registry::Registry,
        test::eventually,
        timing::Timebase,
    };

    use super::{ControlLoop, Stage};

    type HandlerResult = Result<(), Box<dyn std::error::Error>>;

    /// A stage at 120 BPM on a mock bus with the given device groups.
    pub fn stage(groups: &[(&str, &[u16])]) -> (MockTransport, Stage) {
        let mock = MockTransport::new();
        let bus = Bus::new(Box::new(mock.clone()), 0x0000);
        let registry = Registry::new(bus, BTreeMap::new(), None);
        let groups = groups
            .iter()
            .map(|(name, addrs)| (name.to_string(), addrs.to_vec()))
            .collect();
        (
            mock,
            Stage::new(
                Timebase::new(0.0, 120.0),
                registry,
                DeviceManager::new(None),
                groups,
            ),
        )
    }

    #[test]
    fn test_addresses_merge_groups() {
        let (_mock, stage) = stage(&[("a", &[1, 2]), ("b", &[2, 3])]);
        assert_eq!(
            stage.addresses(&["a".to_string(), "b".to_string(), "missing".to_string()]),
            vec![1, 2, 3]
        );
        assert_eq!(stage.group("b"), Some(&[2, 3][..]));
    }

    #[test]
    fn test_run_once_ticks_effects() {
        let (mock, mut stage) = stage(&[]);
        stage
            .registry
            .add_effect(
                "rainbow",
                EffectKind::Rainbow {
                    l_period: 1,
                    t_period: 1,
                },
                &[5],
            )
            .unwrap();
        mock.take();

        let mut control = ControlLoop::new(stage, Keyboards::new(), Duration::ZERO);
        assert!(control.run_once(0.0).unwrap());
        let frames = mock.take();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0][3], CMD_MSG);

        // Same beat, no new downbeat.
        assert!(control.run_once(0.25).unwrap());
        assert_eq!(mock.frame_count(), 0);

        assert!(control.run_once(0.5).unwrap());
        assert_eq!(mock.take()[0][7], 1);
    }

    #[test]
    fn test_events_route_by_keyboard() {
        let (_mock, stage) = stage(&[]);
        let mut keyboards = Keyboards::new();
        let (first, first_tx, _) = ScriptedSource::new("first");
        let (second, second_tx, _) = ScriptedSource::new("second");
        keyboards.add_source(Box::new(first), None).unwrap();
        keyboards.add_source(Box::new(second), None).unwrap();
        let events = keyboards.events().clone();

        let seen: Arc<Mutex<Vec<(usize, u16, &'static str)>>> = Arc::new(Mutex::new(Vec::new()));
        let mut control = ControlLoop::new(stage, keyboards, Duration::ZERO);
        for label in ["one", "two"] {
            let seen = seen.clone();
            control.register(
                1,
                Box::new(move |event: &InputEvent, _stage: &mut Stage| -> HandlerResult {
                    seen.lock().push((event.device_id, event.key, label));
                    Ok(())
                }),
            );
        }

        first_tx.send(vec![key(10, Transition::Down)]).unwrap();
        second_tx.send(vec![key(20, Transition::Down)]).unwrap();
        eventually(|| events.len() == 2, "Events never queued");

        assert!(control.run_once(0.0).unwrap());
        assert_eq!(*seen.lock(), vec![(1, 20, "one"), (1, 20, "two")]);
        assert!(events.is_empty());

        drop(first_tx);
        drop(second_tx);
        control.keyboards.stop();
    }

    #[test]
    fn test_quit_stops_processing() {
        let (_mock, stage) = stage(&[]);
        let mut keyboards = Keyboards::new();
        let (source, tx, _) = ScriptedSource::new("only");
        keyboards.add_source(Box::new(source), None).unwrap();
        let events = keyboards.events().clone();

        let handled = Arc::new(Mutex::new(0));
        let mut control = ControlLoop::new(stage, keyboards, Duration::ZERO);
        {
            let handled = handled.clone();
            control.register(
                0,
                Box::new(move |event: &InputEvent, stage: &mut Stage| -> HandlerResult {
                    *handled.lock() += 1;
                    if event.key == 16 {
                        stage.quit();
                    }
                    Ok(())
                }),
            );
        }

        tx.send(vec![key(16, Transition::Down), key(17, Transition::Down)])
            .unwrap();
        eventually(|| events.len() == 2, "Events never queued");

        assert!(!control.run_once(0.0).unwrap());
        assert_eq!(*handled.lock(), 1);
        assert!(!control.stage().is_running());

        drop(tx);
        control.keyboards.stop();
    }

    #[test]
    fn test_handler_errors_end_the_iteration() {
        let (_mock, stage) = stage(&[]);
        let mut keyboards = Keyboards::new();
        let (source, tx, _) = ScriptedSource::new("only");
        keyboards.add_source(Box::new(source), None).unwrap();
        let events = keyboards.events().clone();

        let mut control = ControlLoop::new(stage, keyboards, Duration::ZERO);
        control.register(
            0,
            Box::new(|_event: &InputEvent, _stage: &mut Stage| -> HandlerResult {
                Err("broken handler".into())
            }),
        );

        tx.send(vec![key(1, Transition::Down)]).unwrap();
        eventually(|| events.len() == 1, "Event never queued");
        assert!(control.run_once(0.0).is_err());

        drop(tx);
        control.keyboards.stop();
    }

    #[test]
    fn test_caps_lock_follows_beat() {
        let (_mock, stage) = stage(&[]);
        let mut keyboards = Keyboards::new();
        let (source, tx, _) = ScriptedSource::new("only");
        let leds = RecordingLeds::default();
        keyboards
            .add_source(Box::new(source), Some(Box::new(leds.clone())))
            .unwrap();

        let mut control = ControlLoop::new(stage, keyboards, Duration::ZERO);
        control.run_once(0.0).unwrap();
        control.run_once(0.25).unwrap();
        control.run_once(0.5).unwrap();
        control.run_once(1.0).unwrap();
        assert_eq!(
            *leds.calls.lock(),
            vec![
                (Led::CapsLock, true),
                (Led::CapsLock, false),
                (Led::CapsLock, true)
            ]
        );

        drop(tx);
        control.keyboards.stop();
    }
}
