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

//! Persisted per-channel analytics state.
//!
//! Stored as JSON next to the other derived outputs and rewritten
//! atomically after every successfully processed file, so a restart
//! reprocesses only uncommitted work. Archive files sort by name in
//! timestamp order, which makes the `last_processed` watermark sufficient
//! to know what has been seen.

use crate::{error::TimemarkResult, status::write_json_atomic, timing::TimeSnap};
use serde::{Deserialize, Serialize};
use std::{fs, path::Path};
use tracing::warn;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelState {
    /// File name of the newest archive fully processed.
    pub last_processed: Option<String>,
    pub files_processed: u64,
    pub quarantined: u64,
    pub detections: u64,
    /// Best tone-derived anchor seen so far. Published for downstream
    /// consumers; archives themselves are never touched.
    pub best_anchor: Option<TimeSnap>,
}

impl ChannelState {
    /// Keeps the candidate if it beats the current best anchor.
    pub fn note_anchor(&mut self, candidate: TimeSnap) {
        let better = self
            .best_anchor
            .as_ref()
            .is_none_or(|current| candidate.better_than(current));
        if better {
            self.best_anchor = Some(candidate);
        }
    }
}

/// Missing or unreadable state falls back to empty: reprocessing is safe,
/// losing the watermark only costs duplicate derived rows.
pub fn load(path: &Path) -> ChannelState {
    match fs::read_to_string(path) {
        Ok(raw) => match serde_json::from_str(&raw) {
            Ok(state) => state,
            Err(e) => {
                warn!(
                    "analytics state {} is corrupt, starting fresh: {e}",
                    path.to_string_lossy()
                );
                ChannelState::default()
            }
        },
        Err(_) => ChannelState::default(),
    }
}

pub fn store(path: &Path, state: &ChannelState) -> TimemarkResult<()> {
    write_json_atomic(path, state)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{station::Station, timing::TimeSource};

    fn snap(source: TimeSource, confidence: f32) -> TimeSnap {
        TimeSnap {
            rtp_timestamp: 1000,
            utc: 1_700_000_160.0,
            sample_rate: 16_000,
            source,
            confidence,
            station: Some(Station::Wwv),
        }
    }

    #[test]
    fn round_trips_through_disk() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("state.json");
        let mut state = ChannelState {
            last_processed: Some("20231114T221600Z_10000000_iq.zip".to_owned()),
            files_processed: 42,
            quarantined: 1,
            detections: 17,
            best_anchor: None,
        };
        state.note_anchor(snap(TimeSource::ToneOnset, 0.9));
        store(&path, &state).expect("store");
        assert_eq!(load(&path), state);
    }

    #[test]
    fn missing_state_starts_fresh() {
        let dir = tempfile::tempdir().expect("tempdir");
        assert_eq!(load(&dir.path().join("nope.json")), ChannelState::default());
    }

    #[test]
    fn anchor_refinement_keeps_the_best() {
        let mut state = ChannelState::default();
        state.note_anchor(snap(TimeSource::Ntp, 0.7));
        state.note_anchor(snap(TimeSource::ToneOnset, 0.8));
        // A weaker source never displaces a tone anchor.
        state.note_anchor(snap(TimeSource::WallClock, 0.3));
        let best = state.best_anchor.as_ref().expect("anchor");
        assert_eq!(best.source, TimeSource::ToneOnset);
        // Same source with higher confidence does.
        state.note_anchor(snap(TimeSource::ToneOnset, 0.95));
        assert_eq!(state.best_anchor.expect("anchor").confidence, 0.95);
    }
}
