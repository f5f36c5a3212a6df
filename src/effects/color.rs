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

/// An RGBA color as sent to the fixtures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(try_from = "String")]
pub struct Color(pub [u8; 4]);

impl Color {
    pub const CLEAR: Color = Color([0x00, 0x00, 0x00, 0x00]);
    pub const WHITE: Color = Color([0xff, 0xff, 0xff, 0xff]);
    pub const RED: Color = Color([0xff, 0x00, 0x00, 0xff]);

    pub fn new(r: u8, g: u8, b: u8, a: u8) -> Color {
        Color([r, g, b, a])
    }

    pub fn alpha(&self) -> u8 {
        self.0[3]
    }

    /// The same color with a different alpha.
    pub fn with_alpha(&self, alpha: u8) -> Color {
        let [r, g, b, _] = self.0;
        Color([r, g, b, alpha])
    }

    /// Parses `#rrggbb`, `#rrggbbaa` or a color name.
    pub fn parse(value: &str) -> Result<Color, String> {
        let value = value.trim();
        if let Some(hex) = value.strip_prefix('#') {
            return Self::from_hex(hex);
        }
        Self::from_name(value)
    }

    fn from_hex(hex: &str) -> Result<Color, String> {
        if (hex.len() != 6 && hex.len() != 8) || !hex.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(format!("invalid hex color '#{}'", hex));
        }
        let mut bytes = [0xffu8; 4];
        for (i, byte) in bytes.iter_mut().enumerate().take(hex.len() / 2) {
            *byte = u8::from_str_radix(&hex[i * 2..i * 2 + 2], 16)
                .map_err(|e| format!("invalid hex color '#{}': {}", hex, e))?;
        }
        Ok(Color(bytes))
    }

    fn from_name(name: &str) -> Result<Color, String> {
        Ok(match name.to_lowercase().as_str() {
            "red" => Color::RED,
            "green" => Color([0x00, 0xff, 0x00, 0xff]),
            "blue" => Color([0x00, 0x00, 0xff, 0xff]),
            "white" => Color::WHITE,
            "yellow" => Color([0xff, 0xff, 0x00, 0xff]),
            "cyan" => Color([0x00, 0xff, 0xff, 0xff]),
            "magenta" => Color([0xff, 0x00, 0xff, 0xff]),
            "orange" => Color([0xff, 0xa5, 0x00, 0xff]),
            "purple" => Color([0x80, 0x00, 0x80, 0xff]),
            "clear" | "off" => Color::CLEAR,
            _ => return Err(format!("unknown color name '{}'", name)),
        })
    }
}

impl TryFrom<String> for Color {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Color::parse(&value)
    }
}

impl fmt::Display for Color {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [r, g, b, a] = self.0;
        write!(f, "#{:02x}{:02x}{:02x}{:02x}", r, g, b, a)
    }
}
