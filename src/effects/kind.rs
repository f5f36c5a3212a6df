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

use serde::Deserialize;

use crate::timing::{Tick, FRACS};

use super::color::Color;

/// Number of data bytes that follow the opcode and slot in every effect message.
pub const DATA_LEN: usize = 6;

/// The data portion of an effect message.
pub type Data = [u8; DATA_LEN];

/// Strobe "on" trailer understood by the firmware.
const STROBE_ON: [u8; 2] = [0x00, 0x03];
/// Strobe "off" trailer understood by the firmware.
const STROBE_OFF: [u8; 2] = [0x00, 0x82];

/// The visual behaviors the fixtures know how to render.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EffectKind {
    /// A constant color.
    Solid { color: Color },

    /// Flashes `rate` times per beat. Each flash stays on for at least
    /// `width` sub-beats before it may turn off again.
    Strobe {
        color: Color,
        #[serde(default = "default_rate")]
        rate: u8,
        #[serde(default = "default_width")]
        width: u8,
    },

    /// Pulses `rate` times per beat, decaying between pulses.
    Pulse {
        color: Color,
        #[serde(default = "default_rate")]
        rate: u8,
    },

    /// A rainbow sweep with a spatial period and a temporal period.
    Rainbow {
        #[serde(default = "default_period")]
        l_period: u8,
        #[serde(default = "default_period")]
        t_period: u8,
    },

    /// Swipes across the strip `rate` times per beat.
    Swipe {
        color: Color,
        #[serde(default = "default_rate")]
        rate: u8,
        #[serde(default)]
        reverse: bool,
    },

    /// Fades up to `color` over `beats` beats.
    Fade {
        color: Color,
        #[serde(default = "default_fade_beats")]
        beats: u8,
    },

    /// Steps through `colors`, one per beat.
    FlashCycle { colors: Vec<Color> },
}

fn default_rate() -> u8 {
    1
}

fn default_width() -> u8 {
    24
}

fn default_period() -> u8 {
    1
}

fn default_fade_beats() -> u8 {
    4
}

/// Per-effect state carried between ticks.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TickState {
    /// The (beat, bucket) of the last rate trigger.
    last_bucket: Option<(u8, u8)>,
    /// When the strobe last turned on, if it is on.
    last_on: Option<Tick>,
    /// Fade and flash cycle progress.
    step: usize,
}

impl EffectKind {
    /// The identifier the firmware uses to instantiate this behavior.
    pub fn id(&self) -> u8 {
        match self {
            EffectKind::Solid { .. } => 0x00,
            EffectKind::Strobe { .. } => 0x01,
            EffectKind::Pulse { .. } => 0x02,
            EffectKind::Rainbow { .. } => 0x03,
            EffectKind::Swipe { .. } => 0x04,
            EffectKind::Fade { .. } => 0x05,
            EffectKind::FlashCycle { .. } => 0x06,
        }
    }

    /// Human readable name of the behavior.
    pub fn label(&self) -> &'static str {
        match self {
            EffectKind::Solid { .. } => "Solid Color",
            EffectKind::Strobe { .. } => "Strobe",
            EffectKind::Pulse { .. } => "Pulse",
            EffectKind::Rainbow { .. } => "Rainbow",
            EffectKind::Swipe { .. } => "Swipe",
            EffectKind::Fade { .. } => "Fade",
            EffectKind::FlashCycle { .. } => "Flash Cycle",
        }
    }

    /// Rejects parameters the firmware can't render. Rates run from one to
    /// one trigger per sub-beat.
    pub fn check(&self) -> Result<(), String> {
        match self {
            EffectKind::Strobe { rate, .. }
            | EffectKind::Pulse { rate, .. }
            | EffectKind::Swipe { rate, .. } => {
                if *rate == 0 || *rate > FRACS {
                    return Err(format!(
                        "{} rate {} must be between 1 and {}",
                        self.label(),
                        rate,
                        FRACS
                    ));
                }
            }
            EffectKind::FlashCycle { colors } if colors.is_empty() => {
                return Err("flash cycle needs at least one color".to_string());
            }
            _ => {}
        }
        Ok(())
    }

    /// The data sent with the start message.
    pub fn start_data(&self) -> Data {
        match self {
            EffectKind::Solid { color } => data(*color, [0, 0]),
            EffectKind::Strobe { .. } => data(Color::CLEAR, [0, 0]),
            EffectKind::Pulse { color, rate } => data(*color, [bucket_len(*rate), 0]),
            EffectKind::Rainbow { l_period, t_period } => [*l_period, *t_period, 0, 0, 0, 0],
            EffectKind::Swipe {
                color,
                rate,
                reverse,
            } => data(*color, [bucket_len(*rate), u8::from(*reverse)]),
            EffectKind::Fade { color, beats } => data(color.with_alpha(0), [0, *beats]),
            EffectKind::FlashCycle { colors } => data(
                colors.first().copied().unwrap_or(Color::CLEAR),
                [0, colors.len() as u8],
            ),
        }
    }

    /// The data sent with the terminal stop command.
    pub fn stop_data(&self) -> Data {
        [0; DATA_LEN]
    }

    /// Computes the message, if any, this behavior sends at `tick`.
    pub fn tick_data(&self, state: &mut TickState, tick: Tick) -> Option<Data> {
        match self {
            EffectKind::Solid { .. } => None,
            EffectKind::Strobe { color, rate, width } => {
                if new_bucket(state, tick, *rate) {
                    let was_off = state.last_on.is_none();
                    state.last_on = Some(tick);
                    if was_off {
                        return Some(strobe_data(*color, true));
                    }
                } else if let Some(last_on) = state.last_on {
                    if tick.fracs_since(last_on) > u32::from(*width) {
                        state.last_on = None;
                        return Some(strobe_data(*color, false));
                    }
                }
                None
            }
            EffectKind::Pulse { color, rate } => {
                if new_bucket(state, tick, *rate) {
                    let bucket = state.last_bucket.map(|(_, b)| b).unwrap_or(0);
                    return Some(data(*color, [bucket_len(*rate), bucket]));
                }
                None
            }
            EffectKind::Rainbow { l_period, t_period } => {
                if tick.sub_beat == 0 {
                    return Some([*l_period, *t_period, tick.beat, 0, 0, 0]);
                }
                None
            }
            EffectKind::Swipe {
                color,
                rate,
                reverse,
            } => {
                if new_bucket(state, tick, *rate) {
                    return Some(data(*color, [bucket_len(*rate), u8::from(*reverse)]));
                }
                None
            }
            EffectKind::Fade { color, beats } => {
                if tick.sub_beat != 0 || state.step >= usize::from(*beats) {
                    return None;
                }
                state.step += 1;
                let alpha = u32::from(color.alpha()) * state.step as u32 / u32::from(*beats);
                Some(data(
                    color.with_alpha(alpha as u8),
                    [state.step as u8, *beats],
                ))
            }
            EffectKind::FlashCycle { colors } => {
                if tick.sub_beat != 0 || colors.is_empty() {
                    return None;
                }
                state.step = (state.step + 1) % colors.len();
                Some(data(colors[state.step], [state.step as u8, colors.len() as u8]))
            }
        }
    }
}

impl fmt::Display for EffectKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.label())
    }
}

fn data(color: Color, trailer: [u8; 2]) -> Data {
    let [r, g, b, a] = color.0;
    [r, g, b, a, trailer[0], trailer[1]]
}

/// The strobe message that lights `color`, or blanks the strobe.
pub fn strobe_data(color: Color, on: bool) -> Data {
    if on {
        data(color, STROBE_ON)
    } else {
        data(Color::CLEAR, STROBE_OFF)
    }
}

/// Length of one rate bucket in sub-beats. Never zero.
fn bucket_len(rate: u8) -> u8 {
    (FRACS / rate.max(1)).max(1)
}

/// Returns true when `tick` has entered a bucket that hasn't triggered yet.
fn new_bucket(state: &mut TickState, tick: Tick, rate: u8) -> bool {
    let bucket = tick.sub_beat / bucket_len(rate);
    let key = (tick.beat, bucket);
    if state.last_bucket == Some(key) {
        return false;
    }
    state.last_bucket = Some(key);
    true
}
