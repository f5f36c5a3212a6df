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
    fs::{File, OpenOptions},
    io::{self, Write},
    path::{Path, PathBuf},
    time::Duration,
};

use nix::sys::termios::{self, BaudRate, SetArg};
use tracing::{debug, info};

use super::hex;

/// Something that can put encoded frames on the wire.
pub trait Transport: Send {
    /// Writes one complete frame. Blocks until the bytes are handed to the OS.
    fn write_frame(&mut self, frame: &[u8]) -> io::Result<()>;
}

/// A real serial port.
pub struct SerialTransport {
    port: File,
    path: PathBuf,
    frame_delay: Duration,
}

impl SerialTransport {
    /// Opens the serial port at `path` in raw mode at the given baud rate.
    pub fn open(path: &Path, baud: u32, frame_delay: Duration) -> io::Result<SerialTransport> {
        let port = OpenOptions::new().read(true).write(true).open(path)?;

        let mut settings = termios::tcgetattr(&port)?;
        termios::cfmakeraw(&mut settings);
        termios::cfsetspeed(&mut settings, baud_rate(baud)?)?;
        termios::tcsetattr(&port, SetArg::TCSANOW, &settings)?;

        info!(port = %path.display(), baud, "Opened serial port.");
        Ok(SerialTransport {
            port,
            path: path.to_path_buf(),
            frame_delay,
        })
    }
}

impl Transport for SerialTransport {
    fn write_frame(&mut self, frame: &[u8]) -> io::Result<()> {
        debug!(port = %self.path.display(), data = hex(frame), "Serial frame");
        self.port.write_all(frame)?;
        self.port.flush()?;
        if !self.frame_delay.is_zero() {
            spin_sleep::sleep(self.frame_delay);
        }
        Ok(())
    }
}

fn baud_rate(baud: u32) -> io::Result<BaudRate> {
    Ok(match baud {
        9600 => BaudRate::B9600,
        19200 => BaudRate::B19200,
        38400 => BaudRate::B38400,
        57600 => BaudRate::B57600,
        115200 => BaudRate::B115200,
        230400 => BaudRate::B230400,
        460800 => BaudRate::B460800,
        921600 => BaudRate::B921600,
        _ => {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("unsupported baud rate {}", baud),
            ))
        }
    })
}

/// A transport that only logs what it would have sent.
pub struct FakeTransport {
    name: String,
}

impl FakeTransport {
    pub fn new(name: &str, baud: u32) -> FakeTransport {
        debug!(port = name, baud, "Set up fake transport");
        FakeTransport {
            name: name.to_string(),
        }
    }
}

impl Transport for FakeTransport {
    fn write_frame(&mut self, frame: &[u8]) -> io::Result<()> {
        debug!(port = self.name, data = hex(frame), "Fake frame");
        Ok(())
    }
}

/// Opens the configured transport, or a fake one for dry runs.
pub fn open(
    path: &str,
    baud: u32,
    frame_delay: Duration,
    dry_run: bool,
) -> io::Result<Box<dyn Transport>> {
    if dry_run {
        return Ok(Box::new(FakeTransport::new(path, baud)));
    }
    Ok(Box::new(SerialTransport::open(
        Path::new(path),
        baud,
        frame_delay,
    )?))
}
