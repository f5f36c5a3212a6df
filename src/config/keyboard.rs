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
use serde::Deserialize;

use crate::bindings::{Action, KeyName};

/// Assigns a device group to a keyboard.
#[derive(Deserialize, Clone, Debug)]
pub struct KeyboardMapping {
    group: String,
    keyboard: usize,
}

impl KeyboardMapping {
    pub fn group(&self) -> &str {
        &self.group
    }

    pub fn keyboard(&self) -> usize {
        self.keyboard
    }
}

/// A YAML representation of a key binding.
#[derive(Deserialize, Clone, Debug)]
pub struct Binding {
    /// The keyboard the binding listens on.
    #[serde(default)]
    keyboard: usize,

    /// The key, by code or name.
    key: KeyName,

    /// What the key does.
    action: Action,
}

impl Binding {
    pub fn keyboard(&self) -> usize {
        self.keyboard
    }

    pub fn key(&self) -> &KeyName {
        &self.key
    }

    pub fn action(&self) -> &Action {
        &self.action
    }
}
