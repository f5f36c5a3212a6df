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
use std::{error::Error, num::ParseIntError, path::PathBuf};

use clap::{crate_version, Parser, Subcommand};
use cursedlight::{
    config::{self, Settings},
    input,
    protocol::{framing, hex},
};

#[derive(Parser)]
#[clap(
    author = "Michael Wilson",
    version = crate_version!(),
    about = "Beat synchronized lighting over a serial bus."
)]
struct Cli {
    #[clap(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Runs the lights.
    Run {
        /// The path to the config file.
        config_path: String,
        /// Log frames instead of writing them to the bus.
        #[arg(long)]
        dry_run: bool,
    },
    /// Lists the input devices that can drive the lights.
    Keyboards {},
    /// Prints the addressed bus frame for a payload.
    Frame {
        /// The device address, e.g. 0x0003.
        addr: String,
        /// The payload bytes, comma separated, e.g. 0x80,0,0.
        bytes: String,
    },
    /// Prints the zero-stuffed strip frame for a payload.
    Stuff {
        /// The flags byte.
        flags: String,
        /// The strip address.
        addr: String,
        /// The payload bytes, comma separated.
        bytes: String,
    },
}

/// Parses decimal or 0x-prefixed hex.
fn parse_number(value: &str) -> Result<u16, ParseIntError> {
    let value = value.trim();
    match value
        .strip_prefix("0x")
        .or_else(|| value.strip_prefix("0X"))
    {
        Some(digits) => u16::from_str_radix(digits, 16),
        None => value.parse(),
    }
}

fn parse_byte(value: &str) -> Result<u8, Box<dyn Error>> {
    Ok(u8::try_from(parse_number(value)?)?)
}

fn parse_bytes(value: &str) -> Result<Vec<u8>, Box<dyn Error>> {
    value
        .split(',')
        .filter(|part| !part.trim().is_empty())
        .map(parse_byte)
        .collect()
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            config_path,
            dry_run,
        } => {
            let settings = Settings::load(&PathBuf::from(config_path))?;
            let mut control = config::init_control_loop(&settings, dry_run).await?;
            tokio::task::spawn_blocking(move || control.run().map_err(|e| e.to_string()))
                .await??;
        }
        Commands::Keyboards {} => {
            let keyboards = input::evdev::discover();

            if keyboards.is_empty() {
                println!("No keyboards found.");
                return Ok(());
            }

            println!("Keyboards:");
            for (id, (path, name)) in keyboards.iter().enumerate() {
                println!("- {}: {} ({})", id, name, path.display());
            }
        }
        Commands::Frame { addr, bytes } => {
            let frame = framing::addressed(parse_number(&addr)?, &parse_bytes(&bytes)?)?;
            println!("{}", hex(&frame));
        }
        Commands::Stuff { flags, addr, bytes } => {
            let frame = framing::stuffed(parse_byte(&flags)?, parse_byte(&addr)?, &parse_bytes(&bytes)?)?;
            println!("{}", hex(&frame));
        }
    }

    Ok(())
}
