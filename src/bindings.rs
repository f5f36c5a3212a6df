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

//! Maps key presses to tempo and effect actions.

use std::error::Error;

use evdev::Key;
use serde::Deserialize;
use tracing::{info, warn};

use crate::{
    control::{Handler, Stage},
    effects::{Color, EffectKind},
    input::{InputEvent, Transition},
    timing,
};

/// BPM step used by the quantize action unless configured otherwise.
pub const DEFAULT_QUANTIZE_STEP: f64 = 2.0;

/// What a key does.
#[derive(Deserialize, Clone, Debug, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Action {
    /// Adds a tap-tempo sample.
    Tap,
    /// Puts the downbeat at the moment of the press.
    Sync,
    /// Rounds the tempo.
    Quantize {
        #[serde(default = "default_quantize_step")]
        nearest: f64,
    },
    /// Doubles the tempo.
    Double,
    /// Halves the tempo.
    Halve,
    /// Shifts the tempo by `bpm` while the key is held.
    Nudge { bpm: f64 },
    /// Ends the control loop.
    Quit,
    /// Starts the effect if it isn't running, stops it if it is.
    ToggleEffect {
        name: String,
        effect: EffectKind,
        /// Device group to run on. Defaults to the groups mapped to the
        /// keyboard the binding belongs to.
        group: Option<String>,
    },
    /// Resets every device in a group.
    ResetGroup { group: String },
    /// Announces a scene change.
    ChangeScene { index: usize },
    /// Strobes a strip for as long as the key is held.
    StripStrobe {
        strip: String,
        #[serde(default = "default_strobe_color")]
        color: Color,
        /// Sub-beats the strobe stays lit after the key is released.
        #[serde(default = "default_strobe_width")]
        width: u8,
    },
}

fn default_quantize_step() -> f64 {
    DEFAULT_QUANTIZE_STEP
}

fn default_strobe_color() -> Color {
    Color::WHITE
}

fn default_strobe_width() -> u8 {
    1
}

/// A key code, given either numerically or by name.
#[derive(Deserialize, Clone, Debug, PartialEq)]
#[serde(untagged)]
pub enum KeyName {
    Code(u16),
    Name(String),
}

impl KeyName {
    /// Resolves the key code.
    pub fn code(&self) -> Result<u16, String> {
        match self {
            KeyName::Code(code) => Ok(*code),
            KeyName::Name(name) => key_code(name).ok_or_else(|| format!("unknown key '{}'", name)),
        }
    }
}

/// A key and the action it triggers.
#[derive(Clone, Debug, PartialEq)]
pub struct Binding {
    pub key: u16,
    pub action: Action,
}

impl Binding {
    pub fn new(key: Key, action: Action) -> Binding {
        Binding {
            key: key.code(),
            action,
        }
    }
}

/// The master keyboard layout.
pub fn default_bindings(first_group: Option<&str>) -> Vec<Binding> {
    let mut bindings = vec![
        Binding::new(Key::KEY_D, Action::Double),
        Binding::new(
            Key::KEY_E,
            Action::Quantize {
                nearest: DEFAULT_QUANTIZE_STEP,
            },
        ),
        Binding::new(Key::KEY_H, Action::Halve),
        Binding::new(Key::KEY_Q, Action::Quit),
        Binding::new(Key::KEY_R, Action::Sync),
        Binding::new(Key::KEY_T, Action::Tap),
    ];
    if let Some(group) = first_group {
        bindings.push(Binding::new(
            Key::KEY_Z,
            Action::ToggleEffect {
                name: "red".to_string(),
                effect: EffectKind::Solid { color: Color::RED },
                group: Some(group.to_string()),
            },
        ));
    }
    bindings
}

/// Builds a handler that runs `bindings` for one keyboard. `default_groups`
/// are the device groups mapped to that keyboard.
pub fn handler(bindings: Vec<Binding>, default_groups: Vec<String>) -> Handler {
    Box::new(move |event: &InputEvent, stage: &mut Stage| -> Result<(), Box<dyn Error>> {
        for binding in bindings.iter().filter(|b| b.key == event.key) {
            match event.transition {
                Transition::Down => on_press(&binding.action, event, stage, &default_groups)?,
                Transition::Up => on_release(&binding.action, stage),
                Transition::Repeat => {}
            }
        }
        Ok(())
    })
}

fn on_press(
    action: &Action,
    event: &InputEvent,
    stage: &mut Stage,
    default_groups: &[String],
) -> Result<(), Box<dyn Error>> {
    let when = timing::unix_seconds(event.timestamp);
    match action {
        Action::Tap => {
            stage.timebase.tap(when);
            info!(bpm = stage.timebase.bpm(), "Tap");
        }
        Action::Sync => {
            stage.timebase.sync(when);
            info!("Synced downbeat.");
        }
        Action::Quantize { nearest } => {
            let bpm = stage.timebase.quantize(*nearest);
            info!(bpm, "Quantized tempo.");
        }
        Action::Double => {
            stage.timebase.multiply(2.0);
            info!(bpm = stage.timebase.bpm(), "Doubled tempo.");
        }
        Action::Halve => {
            stage.timebase.multiply(0.5);
            info!(bpm = stage.timebase.bpm(), "Halved tempo.");
        }
        Action::Nudge { bpm } => stage.timebase.nudge(*bpm),
        Action::Quit => stage.quit(),
        Action::ToggleEffect {
            name,
            effect,
            group,
        } => {
            if stage.registry.effect_exists(name) {
                stage.registry.stop_effect(name)?;
                return Ok(());
            }
            let groups = match group {
                Some(group) => vec![group.clone()],
                None => default_groups.to_vec(),
            };
            let addresses = stage.addresses(&groups);
            if addresses.is_empty() {
                warn!(effect = name, groups = ?groups, "No devices to run effect on");
                return Ok(());
            }
            stage.registry.add_effect(name, effect.clone(), &addresses)?;
        }
        Action::ResetGroup { group } => {
            for addr in stage.addresses(std::slice::from_ref(group)) {
                stage.registry.reset_device(addr)?;
            }
        }
        Action::ChangeScene { index } => stage.registry.change_scene(*index),
        Action::StripStrobe {
            strip,
            color,
            width,
        } => {
            if !stage.devices.press_strobe(strip, *color, *width)? {
                warn!(strip, "No strip to strobe");
            }
        }
    }
    Ok(())
}

fn on_release(action: &Action, stage: &mut Stage) {
    match action {
        Action::Nudge { bpm } => stage.timebase.nudge(-bpm),
        Action::StripStrobe { strip, .. } => stage.devices.release_strobe(strip),
        _ => {}
    }
}

/// Looks up a key by a short name such as `d`, `5`, `space` or `f1`.
pub fn key_code(name: &str) -> Option<u16> {
    const LETTERS: [Key; 26] = [
        Key::KEY_A,
        Key::KEY_B,
        Key::KEY_C,
        Key::KEY_D,
        Key::KEY_E,
        Key::KEY_F,
        Key::KEY_G,
        Key::KEY_H,
        Key::KEY_I,
        Key::KEY_J,
        Key::KEY_K,
        Key::KEY_L,
        Key::KEY_M,
        Key::KEY_N,
        Key::KEY_O,
        Key::KEY_P,
        Key::KEY_Q,
        Key::KEY_R,
        Key::KEY_S,
        Key::KEY_T,
        Key::KEY_U,
        Key::KEY_V,
        Key::KEY_W,
        Key::KEY_X,
        Key::KEY_Y,
        Key::KEY_Z,
    ];
    const DIGITS: [Key; 10] = [
        Key::KEY_0,
        Key::KEY_1,
        Key::KEY_2,
        Key::KEY_3,
        Key::KEY_4,
        Key::KEY_5,
        Key::KEY_6,
        Key::KEY_7,
        Key::KEY_8,
        Key::KEY_9,
    ];
    const FUNCTION: [Key; 12] = [
        Key::KEY_F1,
        Key::KEY_F2,
        Key::KEY_F3,
        Key::KEY_F4,
        Key::KEY_F5,
        Key::KEY_F6,
        Key::KEY_F7,
        Key::KEY_F8,
        Key::KEY_F9,
        Key::KEY_F10,
        Key::KEY_F11,
        Key::KEY_F12,
    ];

    let name = name.trim().to_lowercase();
    let mut chars = name.chars();
    if let (Some(c), None) = (chars.next(), chars.next()) {
        if c.is_ascii_lowercase() {
            return Some(LETTERS[(c as u8 - b'a') as usize].code());
        }
        if c.is_ascii_digit() {
            return Some(DIGITS[(c as u8 - b'0') as usize].code());
        }
    }
    if let Some(n) = name.strip_prefix('f').and_then(|n| n.parse::<usize>().ok()) {
        return FUNCTION.get(n.checked_sub(1)?).map(|k| k.code());
    }
    let key = match name.as_str() {
        "space" => Key::KEY_SPACE,
        "enter" => Key::KEY_ENTER,
        "tab" => Key::KEY_TAB,
        "esc" | "escape" => Key::KEY_ESC,
        "backspace" => Key::KEY_BACKSPACE,
        "minus" => Key::KEY_MINUS,
        "equal" => Key::KEY_EQUAL,
        "left" => Key::KEY_LEFT,
        "right" => Key::KEY_RIGHT,
        "up" => Key::KEY_UP,
        "down" => Key::KEY_DOWN,
        _ => return None,
    };
    Some(key.code())
}
