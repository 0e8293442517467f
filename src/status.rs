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

//! Status snapshot files for external monitoring.
//!
//! Snapshots are plain JSON, rewritten atomically (temp file + rename) at
//! most every few seconds. Nothing in the core reads them back; they exist
//! to be polled by the out-of-scope web UI.

use crate::{
    error::TimemarkResult,
    timing::{TimeSnap, unix_now},
};
use serde::Serialize;
use std::{
    collections::BTreeMap,
    fs::{self, File},
    io::Write,
    path::Path,
};

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AnchorSummary {
    pub rtp_timestamp: u32,
    pub utc: f64,
    pub source: String,
    pub confidence: f32,
    pub station: Option<String>,
}

impl From<&TimeSnap> for AnchorSummary {
    fn from(snap: &TimeSnap) -> Self {
        Self {
            rtp_timestamp: snap.rtp_timestamp,
            utc: snap.utc,
            source: snap.source.to_string(),
            confidence: snap.confidence,
            station: snap.station.map(|s| s.to_string()),
        }
    }
}

/// Per-channel recorder counters, one entry per channel in the snapshot.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelStatus {
    pub ssrc: u32,
    pub frequency_hz: u64,
    pub sample_rate: u32,
    pub state: String,
    pub packets_received: u64,
    pub duplicates: u64,
    pub late_drops: u64,
    pub forced_advances: u64,
    pub resyncs: u64,
    pub gaps: u64,
    pub samples_zero_filled: u64,
    pub processing_errors: u64,
    pub files_written: u64,
    pub write_failures: u64,
    pub minutes_discarded: u64,
    pub alignment_skipped: u64,
    pub anchor: Option<AnchorSummary>,
}

/// Counters owned by the supervisor's receive loop.
#[derive(Debug, Clone, Copy, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SupervisorCounters {
    pub malformed_packets: u64,
    pub unknown_payload_type: u64,
    pub unknown_ssrc: u64,
    pub receive_errors: u64,
    pub queue_overflows: u64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RecorderStatus {
    pub service: String,
    pub version: String,
    pub pid: u32,
    pub hostname: String,
    pub started_at_unix: f64,
    pub updated_at_unix: f64,
    pub health: String,
    pub supervisor: SupervisorCounters,
    pub channels: BTreeMap<String, ChannelStatus>,
}

impl RecorderStatus {
    pub fn new(service: String, hostname: String) -> Self {
        Self {
            service,
            version: env!("CARGO_PKG_VERSION").to_owned(),
            pid: std::process::id(),
            hostname,
            started_at_unix: unix_now(),
            updated_at_unix: unix_now(),
            health: "startup".to_owned(),
            supervisor: SupervisorCounters::default(),
            channels: BTreeMap::new(),
        }
    }

    /// Coarse health: all channels anchored and writing cleanly is "ok".
    pub fn refresh_health(&mut self) {
        self.updated_at_unix = unix_now();
        self.health = if self.channels.values().any(|c| c.anchor.is_none()) {
            "waiting-for-anchor".to_owned()
        } else if self.channels.values().any(|c| c.write_failures > 0) {
            "degraded".to_owned()
        } else {
            "ok".to_owned()
        };
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalyticsStatus {
    pub service: String,
    pub version: String,
    pub pid: u32,
    pub channel: String,
    pub started_at_unix: f64,
    pub updated_at_unix: f64,
    pub health: String,
    pub files_processed: u64,
    pub quarantined: u64,
    pub detections: u64,
    pub last_processed: Option<String>,
    pub best_anchor: Option<AnchorSummary>,
}

/// Writes a JSON snapshot atomically so pollers never see a torn file.
pub fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> TimemarkResult<()> {
    let mut tmp_name = path.file_name().map(|n| n.to_owned()).unwrap_or_default();
    tmp_name.push(".tmp");
    let tmp = path.with_file_name(tmp_name);

    let mut file = File::create(&tmp)?;
    file.write_all(&serde_json::to_vec_pretty(value)?)?;
    file.sync_all()?;
    drop(file);
    fs::rename(&tmp, path)?;
    Ok(())
}
