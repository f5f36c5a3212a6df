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
    io,
    path::{Path, PathBuf},
};

use evdev::{Device, EventType, InputEvent, Key, LedType};
use tracing::{info, warn};

use super::{InputSource, KeyEvent, Keyboards, Led, LedControl, Transition};

/// A keyboard read through the kernel's event interface.
pub struct EvdevKeyboard {
    name: String,
    device: Device,
    grabbed: bool,
}

impl EvdevKeyboard {
    /// Opens the keyboard, grabbing it exclusively if asked to.
    pub fn open(path: &Path, grab: bool) -> io::Result<EvdevKeyboard> {
        let mut device = Device::open(path)?;
        let name = device
            .name()
            .map(str::to_string)
            .unwrap_or_else(|| path.display().to_string());
        if grab {
            device.grab()?;
        }
        Ok(EvdevKeyboard {
            name,
            device,
            grabbed: grab,
        })
    }

    fn toggle_grab(&mut self) {
        let result = if self.grabbed {
            self.device.ungrab()
        } else {
            self.device.grab()
        };
        match result {
            Ok(()) => {
                self.grabbed = !self.grabbed;
                info!(keyboard = self.name, grabbed = self.grabbed, "Toggled grab.");
            }
            Err(e) => warn!(keyboard = self.name, err = e.to_string(), "Unable to toggle grab"),
        }
    }
}

impl InputSource for EvdevKeyboard {
    fn name(&self) -> &str {
        &self.name
    }

    fn read_keys(&mut self) -> io::Result<Vec<KeyEvent>> {
        let keys: Vec<KeyEvent> = self
            .device
            .fetch_events()?
            .filter(|ev| ev.event_type() == EventType::KEY)
            .filter_map(|ev| {
                Transition::from_value(ev.value()).map(|transition| KeyEvent {
                    key: ev.code(),
                    transition,
                    timestamp: ev.timestamp(),
                })
            })
            .collect();

        // Releasing escape hands the keyboard back to the console or takes it again.
        if keys
            .iter()
            .any(|k| k.key == Key::KEY_ESC.code() && k.transition == Transition::Up)
        {
            self.toggle_grab();
        }
        Ok(keys)
    }

    fn release(&mut self) {
        if self.grabbed {
            if let Err(e) = self.device.ungrab() {
                warn!(keyboard = self.name, err = e.to_string(), "Unable to release keyboard");
            }
            self.grabbed = false;
        }
    }
}

/// A second handle on a keyboard used only to drive its lights.
pub struct EvdevLeds {
    device: Device,
}

impl EvdevLeds {
    pub fn open(path: &Path) -> io::Result<EvdevLeds> {
        Ok(EvdevLeds {
            device: Device::open(path)?,
        })
    }
}

impl LedControl for EvdevLeds {
    fn set_led(&mut self, led: Led, on: bool) -> io::Result<()> {
        let code = match led {
            Led::NumLock => LedType::LED_NUML,
            Led::CapsLock => LedType::LED_CAPSL,
            Led::ScrollLock => LedType::LED_SCROLLL,
        };
        self.device
            .send_events(&[InputEvent::new(EventType::LED, code.0, i32::from(on))])
    }
}

/// True for devices that have both keys and lights.
pub fn is_keyboard(device: &Device) -> bool {
    let events = device.supported_events();
    events.contains(EventType::KEY) && events.contains(EventType::LED)
}

/// Every attached keyboard, ordered by device path.
pub fn discover() -> Vec<(PathBuf, String)> {
    let mut found: Vec<(PathBuf, String)> = evdev::enumerate()
        .filter(|(_, device)| is_keyboard(device))
        .map(|(path, device)| {
            let name = device.name().unwrap_or("(unnamed)").to_string();
            (path, name)
        })
        .collect();
    found.sort();
    found
}

/// Attaches every keyboard to `keyboards`. The first keyboard stays usable by
/// the console; the rest are grabbed. Returns how many were attached.
pub fn attach_all(keyboards: &mut Keyboards) -> io::Result<usize> {
    let mut attached = 0;
    for (path, name) in discover() {
        let grab = attached > 0;
        let source = match EvdevKeyboard::open(&path, grab) {
            Ok(source) => source,
            Err(e) => {
                warn!(path = %path.display(), name, err = e.to_string(), "Skipping keyboard");
                continue;
            }
        };
        let leds: Option<Box<dyn LedControl>> = match EvdevLeds::open(&path) {
            Ok(leds) => Some(Box::new(leds)),
            Err(e) => {
                warn!(path = %path.display(), err = e.to_string(), "Keyboard lights unavailable");
                None
            }
        };
        keyboards.add_source(Box::new(source), leds)?;
        attached += 1;
    }
    Ok(attached)
}
