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
use std::net::{AddrParseError, SocketAddr};

use serde::Deserialize;

use crate::broadcast::DEFAULT_SUB_BEAT_DIVISOR;

const DEFAULT_BIND: &str = "0.0.0.0:0";

fn default_bind() -> String {
    DEFAULT_BIND.to_string()
}

fn default_sub_beat_divisor() -> u8 {
    DEFAULT_SUB_BEAT_DIVISOR
}

/// A YAML representation of the OSC beat broadcaster.
#[derive(Deserialize, Clone, Debug)]
pub struct Broadcast {
    /// Turns the broadcaster on.
    #[serde(default)]
    enabled: bool,

    /// The local address to send from.
    #[serde(default = "default_bind")]
    bind: String,

    /// Where beats are sent.
    #[serde(default)]
    targets: Vec<String>,

    /// Only sub-beats divisible by this are sent.
    #[serde(default = "default_sub_beat_divisor")]
    sub_beat_divisor: u8,

    /// Scene names, by index.
    #[serde(default)]
    scenes: Vec<String>,
}

impl Broadcast {
    pub fn enabled(&self) -> bool {
        self.enabled
    }

    pub fn bind(&self) -> Result<SocketAddr, AddrParseError> {
        self.bind.parse()
    }

    pub fn targets(&self) -> Result<Vec<SocketAddr>, AddrParseError> {
        self.targets.iter().map(|addr| addr.parse()).collect()
    }

    pub fn sub_beat_divisor(&self) -> u8 {
        self.sub_beat_divisor
    }

    pub fn scenes(&self) -> Vec<String> {
        self.scenes.clone()
    }
}
