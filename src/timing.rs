/*
 *  Copyright (C) 2025 Michael Bachmann
 *
 *  This program is free software: you can redistribute it and/or modify
 *  it under the terms of the GNU Affero General Public License as published by
 *  the Free Software Foundation, either version 3 of the License, or
 *  (at your option) any later version.
 *
 *  This program is distributed in the hope that it will be useful,
 *  but WITHOUT ANY WARRANTY; without even the implied warranty of
 *  MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 *  GNU Affero General Public License for more details.
 *
 *  You should have received a copy of the GNU Affero General Public License
 *  along with this program.  If not, see <https://www.gnu.org/licenses/>.
 */

//! Timing anchors and wraparound arithmetic.
//!
//! The timing hierarchy is tone > NTP > wall clock. A [`TimeSnap`] maps RTP
//! timestamps to UTC; all RTP timestamp comparisons use signed deltas so
//! both the 16 bit sequence number space and the 32 bit timestamp space wrap
//! transparently.

use crate::station::Station;
use serde::{Deserialize, Serialize};
use std::{
    fmt::Display,
    sync::Mutex,
    time::{Duration, Instant, SystemTime, UNIX_EPOCH},
};
use tracing::{debug, warn};

pub const U16_WRAP: u32 = 65536;
pub const U32_WRAP: u64 = 4294967296;

/// Signed distance from `from` to `to` in 16 bit sequence number space.
/// A delta more negative than -32768 is interpreted as forward motion past
/// the wrap.
pub fn seq_delta(from: u16, to: u16) -> i32 {
    to.wrapping_sub(from) as i16 as i32
}

/// Signed distance from `from` to `to` in 32 bit RTP timestamp space.
pub fn rtp_delta(from: u32, to: u32) -> i64 {
    to.wrapping_sub(from) as i32 as i64
}

/// Wall clock seconds since the unix epoch, fractional.
pub fn unix_now() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

/// Where an anchor's UTC mapping came from, ordered by precision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeSource {
    ToneOnset,
    Ntp,
    WallClock,
}

impl TimeSource {
    /// Higher is more precise.
    pub fn precision_rank(&self) -> u8 {
        match self {
            TimeSource::ToneOnset => 2,
            TimeSource::Ntp => 1,
            TimeSource::WallClock => 0,
        }
    }
}

impl Display for TimeSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TimeSource::ToneOnset => write!(f, "tone_onset"),
            TimeSource::Ntp => write!(f, "ntp"),
            TimeSource::WallClock => write!(f, "wall_clock"),
        }
    }
}

/// The immutable mapping between one RTP timestamp and UTC.
///
/// A sample at RTP timestamp `r` has UTC
/// `utc + rtp_delta(rtp_timestamp, r) / sample_rate`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimeSnap {
    pub rtp_timestamp: u32,
    pub utc: f64,
    pub sample_rate: u32,
    pub source: TimeSource,
    pub confidence: f32,
    pub station: Option<Station>,
}

impl TimeSnap {
    /// Reconstructed UTC of the sample at `rtp_ts`, signed arithmetic across
    /// the timestamp wrap.
    pub fn utc_of(&self, rtp_ts: u32) -> f64 {
        self.utc + rtp_delta(self.rtp_timestamp, rtp_ts) as f64 / self.sample_rate as f64
    }

    /// Number of samples from `rtp_ts` (inclusive) to the next UTC minute
    /// boundary. Zero if `rtp_ts` falls on a boundary to within half a
    /// sample.
    pub fn samples_until_next_minute(&self, rtp_ts: u32) -> u64 {
        let utc = self.utc_of(rtp_ts);
        let rem = utc.rem_euclid(60.0);
        let half_sample = 0.5 / self.sample_rate as f64;
        let to_next = if rem < half_sample || (60.0 - rem) < half_sample {
            0.0
        } else {
            60.0 - rem
        };
        (to_next * self.sample_rate as f64).round() as u64
    }

    /// True if this anchor should supersede `other` for downstream
    /// consumers. Source precision wins, confidence breaks ties.
    pub fn better_than(&self, other: &TimeSnap) -> bool {
        let (a, b) = (self.source.precision_rank(), other.source.precision_rank());
        a > b || (a == b && self.confidence > other.confidence)
    }
}

/// Cached NTP daemon synchronization state.
///
/// One instance is shared by all channels so the kernel is probed at most
/// once per validity window no matter how many channels ask.
pub struct NtpMonitor {
    cache: Mutex<Option<(Instant, bool)>>,
    validity: Duration,
}

impl NtpMonitor {
    pub fn new(validity: Duration) -> Self {
        Self {
            cache: Mutex::new(None),
            validity,
        }
    }

    /// Whether the OS reports its clock as NTP synchronized. Served from the
    /// cache when the last probe is younger than the validity window.
    pub fn synchronized(&self) -> bool {
        let mut cache = match self.cache.lock() {
            Ok(it) => it,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Some((at, synced)) = *cache
            && at.elapsed() < self.validity
        {
            return synced;
        }
        let synced = probe_ntp_sync();
        debug!("NTP synchronization probe: {synced}");
        *cache = Some((Instant::now(), synced));
        synced
    }
}

impl Default for NtpMonitor {
    fn default() -> Self {
        Self::new(Duration::from_secs(10))
    }
}

#[cfg(target_os = "linux")]
fn probe_ntp_sync() -> bool {
    let mut tx: libc::timex = unsafe { std::mem::zeroed() };
    let rc = unsafe { libc::adjtimex(&mut tx) };
    if rc < 0 {
        warn!("adjtimex failed, assuming unsynchronized clock");
        return false;
    }
    tx.status & libc::STA_UNSYNC == 0
}

#[cfg(not(target_os = "linux"))]
fn probe_ntp_sync() -> bool {
    warn!("NTP synchronization probe not supported on this OS, assuming unsynchronized");
    false
}
