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
    collections::BTreeSet,
    io,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread::{self, JoinHandle},
    time::SystemTime,
};

use crossbeam_channel::{Receiver, Sender};
use tracing::{error, info, span, warn, Level};

pub mod evdev;

/// What happened to a key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Up,
    Down,
    Repeat,
}

impl Transition {
    /// Maps a raw key event value.
    pub fn from_value(value: i32) -> Option<Transition> {
        match value {
            0 => Some(Transition::Up),
            1 => Some(Transition::Down),
            2 => Some(Transition::Repeat),
            _ => None,
        }
    }
}

/// A single key transition as read from a device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyEvent {
    pub key: u16,
    pub transition: Transition,
    pub timestamp: SystemTime,
}

/// A key transition along with the keys held on the same device at the time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InputEvent {
    pub device_id: usize,
    pub key: u16,
    pub transition: Transition,
    pub pressed: BTreeSet<u16>,
    pub timestamp: SystemTime,
}

/// Keyboard indicator lights.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Led {
    NumLock,
    CapsLock,
    ScrollLock,
}

/// A device that produces key events.
pub trait InputSource: Send + 'static {
    fn name(&self) -> &str;

    /// Blocks until at least one event is available.
    fn read_keys(&mut self) -> io::Result<Vec<KeyEvent>>;

    /// Gives the device back to the rest of the system.
    fn release(&mut self) {}
}

/// Something that can switch keyboard lights.
pub trait LedControl: Send {
    fn set_led(&mut self, led: Led, on: bool) -> io::Result<()>;
}

struct Worker {
    name: String,
    running: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
    leds: Option<Box<dyn LedControl>>,
}

/// Funnels every attached keyboard into one ordered event queue.
pub struct Keyboards {
    workers: Vec<Worker>,
    events_tx: Sender<InputEvent>,
    events_rx: Receiver<InputEvent>,
}

impl Default for Keyboards {
    fn default() -> Self {
        Self::new()
    }
}

impl Keyboards {
    pub fn new() -> Keyboards {
        let (events_tx, events_rx) = crossbeam_channel::unbounded();
        Keyboards {
            workers: Vec::new(),
            events_tx,
            events_rx,
        }
    }

    /// Starts a worker thread for `source` and returns its device id.
    pub fn add_source(
        &mut self,
        source: Box<dyn InputSource>,
        leds: Option<Box<dyn LedControl>>,
    ) -> io::Result<usize> {
        let device_id = self.workers.len();
        let name = source.name().to_string();
        let running = Arc::new(AtomicBool::new(true));

        let handle = {
            let running = running.clone();
            let events_tx = self.events_tx.clone();
            thread::Builder::new()
                .name(format!("keyboard-{}", device_id))
                .spawn(move || Self::run(device_id, source, running, events_tx))?
        };

        info!(device_id, name, "Keyboard attached.");
        self.workers.push(Worker {
            name,
            running,
            handle: Some(handle),
            leds,
        });
        Ok(device_id)
    }

    fn run(
        device_id: usize,
        mut source: Box<dyn InputSource>,
        running: Arc<AtomicBool>,
        events_tx: Sender<InputEvent>,
    ) {
        let span = span!(Level::INFO, "keyboard", device_id);
        let _enter = span.enter();

        let mut pressed = BTreeSet::new();
        'read: loop {
            let keys = match source.read_keys() {
                Ok(keys) => keys,
                Err(e) => {
                    error!(err = e.to_string(), "Error reading keyboard.");
                    break;
                }
            };
            if !running.load(Ordering::Relaxed) {
                break;
            }

            for key in keys {
                match key.transition {
                    Transition::Down => {
                        pressed.insert(key.key);
                    }
                    Transition::Up => {
                        pressed.remove(&key.key);
                    }
                    Transition::Repeat => {}
                }
                let event = InputEvent {
                    device_id,
                    key: key.key,
                    transition: key.transition,
                    pressed: pressed.clone(),
                    timestamp: key.timestamp,
                };
                if events_tx.send(event).is_err() {
                    break 'read;
                }
            }
        }

        source.release();
        info!("Keyboard worker stopped.");
    }

    /// The shared event queue.
    pub fn events(&self) -> &Receiver<InputEvent> {
        &self.events_rx
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    /// Sets an indicator on one keyboard. Keyboards without lights are skipped.
    pub fn set_led(&mut self, device_id: usize, led: Led, on: bool) {
        let Some(worker) = self.workers.get_mut(device_id) else {
            return;
        };
        if let Some(leds) = worker.leds.as_mut() {
            if let Err(e) = leds.set_led(led, on) {
                warn!(keyboard = worker.name, err = e.to_string(), "Unable to set LED");
            }
        }
    }

    /// Sets an indicator on every keyboard.
    pub fn set_all_leds(&mut self, led: Led, on: bool) {
        for device_id in 0..self.workers.len() {
            self.set_led(device_id, led, on);
        }
    }

    /// Asks every worker to stop. Workers blocked in a read exit after their
    /// next event.
    pub fn request_stop(&self) {
        for worker in self.workers.iter() {
            worker.running.store(false, Ordering::Relaxed);
        }
    }

    /// Waits for every worker to exit.
    pub fn join(&mut self) {
        for worker in self.workers.iter_mut() {
            if let Some(handle) = worker.handle.take() {
                if handle.join().is_err() {
                    error!(keyboard = worker.name, "Keyboard worker panicked.");
                }
            }
        }
    }

    /// Stops and joins every worker.
    pub fn stop(&mut self) {
        self.request_stop();
        self.join();
    }
}
