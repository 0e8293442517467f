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

//! Per-file quality metrics, recomputed from archive metadata alone.

use crate::archive::{ArchiveMeta, SECONDS_PER_FILE};

#[derive(Debug, Clone, PartialEq)]
pub struct QualityRecord {
    /// UTC of the file's minute boundary, from the embedded anchor.
    pub utc_minute: f64,
    pub completeness_pct: f64,
    pub packet_loss_pct: f64,
    pub gap_count: u32,
    pub largest_gap_ms: f64,
}

pub fn analyze(meta: &ArchiveMeta) -> QualityRecord {
    let expected_samples = (meta.sample_rate as u64 * SECONDS_PER_FILE as u64) as f64;
    let completeness_pct =
        ((expected_samples - meta.gaps_filled as f64) / expected_samples * 100.0).clamp(0.0, 100.0);

    let packet_loss_pct = if meta.packets_expected == 0 {
        0.0
    } else {
        ((meta.packets_expected as f64 - meta.packets_received as f64)
            / meta.packets_expected as f64
            * 100.0)
            .clamp(0.0, 100.0)
    };

    let largest_gap_ms = meta
        .gap_samples_filled
        .iter()
        .max()
        .map(|&samples| samples as f64 / meta.sample_rate as f64 * 1000.0)
        .unwrap_or(0.0);

    QualityRecord {
        utc_minute: meta.time_snap().utc_of(meta.rtp_timestamp),
        completeness_pct,
        packet_loss_pct,
        gap_count: meta.gaps_count,
        largest_gap_ms,
    }
}
