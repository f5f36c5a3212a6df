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
use std::{error::Error, net::SocketAddr};

use rosc::{OscMessage, OscPacket, OscType};
use tokio::{
    net::UdpSocket,
    sync::mpsc::{self, error::TrySendError, Receiver, Sender},
    task::JoinHandle,
};
use tracing::{error, info, span, warn, Instrument, Level};

/// How many packets may be waiting to go out before new ones are dropped.
const QUEUE_DEPTH: usize = 64;

/// Default sub-beat divisor. Forwards eight sub-beats per beat.
pub const DEFAULT_SUB_BEAT_DIVISOR: u8 = 30;

const BEAT_ADDR: &str = "/beat";
const SUB_BEAT_ADDR: &str = "/sub_beat";
const SCENE_ADDR: &str = "/scene";

/// Receives beat notifications from the registry. Implementations must not
/// block; delivery is fire and forget.
pub trait BeatListener: Send {
    fn beat(&self, beat: u8);
    fn sub_beat(&self, beat: u8, sub_beat: u8);
    fn change_scene(&self, index: usize);
}

/// Sends beats, sub-beats and scene changes to OSC listeners over UDP.
pub struct OscBroadcaster {
    tx: Sender<OscPacket>,
    sub_beat_divisor: u8,
    scenes: Vec<String>,
    handle: JoinHandle<()>,
}

impl OscBroadcaster {
    /// Binds a socket and starts the sending task. Must be called from
    /// within a tokio runtime.
    pub async fn new(
        bind: SocketAddr,
        targets: Vec<SocketAddr>,
        sub_beat_divisor: u8,
        scenes: Vec<String>,
    ) -> Result<OscBroadcaster, Box<dyn Error>> {
        let socket = UdpSocket::bind(bind).await?;
        socket.set_broadcast(true)?;
        info!(bind = %socket.local_addr()?, targets = ?targets, "Beat broadcaster started.");

        let (tx, rx) = mpsc::channel(QUEUE_DEPTH);
        let handle = tokio::spawn(
            Self::send_packets(socket, targets, rx).instrument(span!(Level::INFO, "beat broadcaster")),
        );
        Ok(OscBroadcaster {
            tx,
            sub_beat_divisor: sub_beat_divisor.max(1),
            scenes,
            handle,
        })
    }

    async fn send_packets(
        socket: UdpSocket,
        targets: Vec<SocketAddr>,
        mut rx: Receiver<OscPacket>,
    ) {
        while let Some(packet) = rx.recv().await {
            let buf = match rosc::encoder::encode(&packet) {
                Ok(buf) => buf,
                Err(e) => {
                    error!(err = e.to_string(), "Error encoding OSC message");
                    continue;
                }
            };
            for addr in targets.iter() {
                if let Err(e) = socket.send_to(&buf, addr).await {
                    error!(err = e.to_string(), addr = %addr, "Error sending UDP data.");
                }
            }
        }
        info!("Beat broadcaster closing.");
    }

    fn queue(&self, addr: &str, args: Vec<OscType>) {
        let packet = OscPacket::Message(OscMessage {
            addr: addr.to_string(),
            args,
        });
        match self.tx.try_send(packet) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => warn!(addr, "Broadcast queue full, dropping message"),
            Err(TrySendError::Closed(_)) => warn!(addr, "Broadcaster has stopped"),
        }
    }
}

impl BeatListener for OscBroadcaster {
    fn beat(&self, beat: u8) {
        self.queue(BEAT_ADDR, vec![OscType::Int(i32::from(beat))]);
    }

    fn sub_beat(&self, beat: u8, sub_beat: u8) {
        if sub_beat % self.sub_beat_divisor != 0 {
            return;
        }
        self.queue(
            SUB_BEAT_ADDR,
            vec![OscType::Int(i32::from(beat)), OscType::Int(i32::from(sub_beat))],
        );
    }

    fn change_scene(&self, index: usize) {
        let name = self.scenes.get(index).cloned().unwrap_or_default();
        self.queue(
            SCENE_ADDR,
            vec![OscType::Int(index as i32), OscType::String(name)],
        );
    }
}

impl Drop for OscBroadcaster {
    fn drop(&mut self) {
        self.handle.abort();
    }
}
