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
use std::time::{SystemTime, UNIX_EPOCH};

/// Number of beats in a bar. Beats count 0..BEATS and wrap.
pub const BEATS: u8 = 4;

/// Number of sub-beats per beat.
pub const FRACS: u8 = 240;

/// The slowest tempo `multiply` will accept.
pub const MIN_BPM: f64 = 20.0;

/// The fastest tempo `multiply` will accept.
pub const MAX_BPM: f64 = 500.0;

/// Taps older than this (relative to the newest tap) are discarded.
const TAP_WINDOW: f64 = 2.0;

/// At most this many taps are averaged.
const TAP_HISTORY: usize = 5;

/// A quantized position within the bar.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Tick {
    pub beat: u8,
    pub sub_beat: u8,
}

impl Tick {
    pub fn new(beat: u8, sub_beat: u8) -> Tick {
        Tick { beat, sub_beat }
    }

    /// Number of sub-beats from `earlier` to `self`, wrapping around the bar.
    pub fn fracs_since(&self, earlier: Tick) -> u32 {
        let bar = u32::from(BEATS) * u32::from(FRACS);
        let now = u32::from(self.beat) * u32::from(FRACS) + u32::from(self.sub_beat);
        let then = u32::from(earlier.beat) * u32::from(FRACS) + u32::from(earlier.sub_beat);
        (now + bar - then) % bar
    }
}

impl fmt::Display for Tick {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{:03}", self.beat, self.sub_beat)
    }
}

/// Converts a wall clock reading into floating point seconds since the epoch.
pub fn unix_seconds(time: SystemTime) -> f64 {
    time.duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

/// Current wall clock time in seconds.
pub fn now() -> f64 {
    unix_seconds(SystemTime::now())
}

/// Tracks the beat phase against wall clock time.
///
/// The timebase never runs on its own: every call to [`Timebase::tick`] samples
/// the supplied time and catches the phase up to it. Sub-beats that fall
/// between two polls are skipped rather than replayed.
#[derive(Debug, Clone)]
pub struct Timebase {
    /// Seconds per beat.
    period: f64,
    /// Current beat. -1 means "before the first downbeat".
    beat: i32,
    /// Current sub-beat. -1 right after a beat commit until the sub-beat is sampled.
    sub_beat: i32,
    next_beat_time: f64,
    last_beat_time: f64,
    next_sub_beat_time: f64,
    taps: Vec<f64>,
}

impl Timebase {
    /// Creates a timebase whose first downbeat lands at `now`.
    pub fn new(now: f64, bpm: f64) -> Timebase {
        let period = 60.0 / bpm;
        Timebase {
            period,
            beat: -1,
            sub_beat: -1,
            next_beat_time: now,
            last_beat_time: now - period,
            next_sub_beat_time: now,
            taps: Vec::with_capacity(TAP_HISTORY + 1),
        }
    }

    /// Seconds per beat.
    pub fn period(&self) -> f64 {
        self.period
    }

    /// Beats per minute.
    pub fn bpm(&self) -> f64 {
        60.0 / self.period
    }

    /// Samples the clock and returns the current position.
    pub fn tick(&mut self, now: f64) -> Tick {
        if now >= self.next_beat_time {
            self.last_beat_time = self.next_beat_time;
            self.next_sub_beat_time = self.next_beat_time;
            self.next_beat_time += self.period;
            self.sub_beat = -1;
            self.beat = (self.beat + 1).rem_euclid(i32::from(BEATS));
        }

        if now >= self.next_sub_beat_time {
            let candidate =
                (f64::from(FRACS) * (now - self.last_beat_time) / self.period).floor() as i64;
            if (0..i64::from(FRACS)).contains(&candidate) && candidate > i64::from(self.sub_beat) {
                self.sub_beat = candidate as i32;
            }
            self.next_sub_beat_time =
                self.last_beat_time + (candidate + 1) as f64 * self.period / f64::from(FRACS);
        }

        self.current()
    }

    /// The most recently computed position, without sampling the clock.
    pub fn current(&self) -> Tick {
        Tick {
            beat: self.beat.max(0) as u8,
            sub_beat: self.sub_beat.max(0) as u8,
        }
    }

    /// Records a tap and re-derives the period from the recent taps.
    pub fn tap(&mut self, now: f64) {
        self.taps.push(now);
        self.taps.retain(|tap| *tap > now - TAP_WINDOW);
        if self.taps.len() > TAP_HISTORY {
            let excess = self.taps.len() - TAP_HISTORY;
            self.taps.drain(..excess);
        }

        if self.taps.len() < 2 {
            return;
        }

        let diffs = self.taps.windows(2).map(|pair| pair[1] - pair[0]);
        let count = (self.taps.len() - 1) as f64;
        self.period = diffs.sum::<f64>() / count;
    }

    /// Re-aligns the phase so that `now` is a downbeat.
    ///
    /// If the next beat is closer than the last one, `now` is treated as that
    /// upcoming beat and the following tick lands exactly on beat 0.
    pub fn sync(&mut self, now: f64) {
        if (now - self.next_beat_time).abs() < (now - self.last_beat_time).abs() {
            self.beat = -1;
            self.next_beat_time = now;
        } else {
            self.beat = 0;
            self.next_beat_time = now + self.period;
        }
    }

    /// Rounds the tempo to the nearest multiple of `nearest` BPM.
    pub fn quantize(&mut self, nearest: f64) -> f64 {
        let quantized = nearest * (self.bpm() / nearest).round();
        if quantized <= 0.0 || !quantized.is_finite() {
            return self.bpm();
        }
        self.period = 60.0 / quantized;
        quantized
    }

    /// Scales the tempo by `factor`. Changes that leave [`MIN_BPM`, `MAX_BPM`] are rejected.
    pub fn multiply(&mut self, factor: f64) {
        let original = self.period;
        self.period /= factor;
        let bpm = self.bpm();
        if !(MIN_BPM..=MAX_BPM).contains(&bpm) {
            self.period = original;
        }
    }

    /// Offsets the tempo by `delta` BPM. Undo with the opposite delta.
    pub fn nudge(&mut self, delta: f64) {
        self.period = 60.0 / (self.bpm() + delta);
    }
}
