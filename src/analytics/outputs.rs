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

//! Derived outputs for one channel: CSVs and the decimated 10 Hz archive.

use crate::{
    analytics::{discrimination::DiscriminationRecord, quality::QualityRecord},
    archive::{self, ArchiveMeta, MinuteArchive},
    dsp::decimate::OUTPUT_RATE,
    error::TimemarkResult,
    timing::unix_now,
    tone::ToneDetection,
};
use chrono::DateTime;
use num_complex::Complex;
use std::{
    fs::{self, OpenOptions},
    io::Write,
    path::{Path, PathBuf},
};

const QUALITY_HEADER: &str = "utc_minute,completeness_pct,packet_loss_pct,gap_count,largest_gap_ms";
const TONES_HEADER: &str = "utc_minute,station,freq_hz,onset_utc,snr_db,use_for_time_snap";
const GAPS_HEADER: &str = "utc,duration_ms,lost_packets,explanation";
const DISCRIMINATION_HEADER: &str =
    "utc_minute,ticks_detected,median_tick_offset_ms,subcarrier_snr_db,marker_correlation";

/// Suffix inserted before the archive suffix for decimated products.
pub const DECIMATED_TAG: &str = "_10hz";

pub struct ChannelOutputs {
    quality_csv: PathBuf,
    tones_csv: PathBuf,
    gaps_csv: PathBuf,
    discrimination_csv: PathBuf,
    derived_dir: PathBuf,
}

impl ChannelOutputs {
    pub fn new(output_root: &Path, channel_name: &str) -> TimemarkResult<Self> {
        let channel_dir = output_root.join(channel_name);
        let derived_dir = channel_dir.join("derived");
        fs::create_dir_all(&derived_dir)?;
        Ok(Self {
            quality_csv: channel_dir.join("quality.csv"),
            tones_csv: channel_dir.join("tones.csv"),
            gaps_csv: channel_dir.join("discontinuities.csv"),
            discrimination_csv: channel_dir.join("discrimination.csv"),
            derived_dir,
        })
    }

    pub fn append_quality(&self, record: &QualityRecord) -> TimemarkResult<()> {
        append_csv_row(
            &self.quality_csv,
            QUALITY_HEADER,
            &format!(
                "{},{:.3},{:.3},{},{:.1}",
                iso_utc_seconds(record.utc_minute),
                record.completeness_pct,
                record.packet_loss_pct,
                record.gap_count,
                record.largest_gap_ms
            ),
        )
    }

    pub fn append_tones(&self, utc_minute: f64, detections: &[ToneDetection]) -> TimemarkResult<()> {
        for detection in detections {
            append_csv_row(
                &self.tones_csv,
                TONES_HEADER,
                &format!(
                    "{},{},{:.0},{},{:.1},{}",
                    iso_utc_seconds(utc_minute),
                    detection.station,
                    detection.freq_hz,
                    iso_utc_micros(detection.onset_utc),
                    detection.snr_db,
                    detection.use_for_time_snap
                ),
            )?;
        }
        Ok(())
    }

    /// One discontinuity-log row per gap in the file.
    pub fn append_gaps(&self, meta: &ArchiveMeta) -> TimemarkResult<()> {
        let snap = meta.time_snap();
        for i in 0..meta.gaps_count as usize {
            let utc = snap.utc_of(meta.gap_rtp_timestamps[i]);
            let duration_ms =
                meta.gap_samples_filled[i] as f64 / snap.sample_rate as f64 * 1000.0;
            let explanation = if meta.gap_packets_lost[i] > 0 {
                "packet loss"
            } else {
                "timestamp discontinuity"
            };
            append_csv_row(
                &self.gaps_csv,
                GAPS_HEADER,
                &format!(
                    "{},{:.1},{},{}",
                    iso_utc_micros(utc),
                    duration_ms,
                    meta.gap_packets_lost[i],
                    explanation
                ),
            )?;
        }
        Ok(())
    }

    pub fn append_discrimination(&self, record: &DiscriminationRecord) -> TimemarkResult<()> {
        append_csv_row(
            &self.discrimination_csv,
            DISCRIMINATION_HEADER,
            &format!(
                "{},{},{:.2},{:.1},{:.3}",
                iso_utc_seconds(record.utc_minute),
                record.ticks_detected,
                record.median_tick_offset_ms,
                record.subcarrier_snr_db,
                record.marker_correlation
            ),
        )
    }

    /// Writes the 10 Hz product: same container, the source anchor copied
    /// verbatim, and a pointer back to the source file.
    pub fn write_decimated(
        &self,
        source_name: &str,
        source_meta: &ArchiveMeta,
        iq: Vec<Complex<f32>>,
    ) -> TimemarkResult<PathBuf> {
        let mut meta = source_meta.clone();
        meta.sample_rate = OUTPUT_RATE;
        meta.unix_timestamp = unix_now();
        meta.source_file = Some(source_name.to_owned());
        meta.source_sample_rate = Some(source_meta.sample_rate);

        let name = source_name
            .strip_suffix(".zip")
            .map(|base| format!("{base}{DECIMATED_TAG}.zip"))
            .unwrap_or_else(|| format!("{source_name}{DECIMATED_TAG}"));
        let path = self.derived_dir.join(name);
        archive::write_archive(&path, &MinuteArchive { meta, iq })?;
        Ok(path)
    }
}

fn append_csv_row(path: &Path, header: &str, row: &str) -> TimemarkResult<()> {
    let new_file = !path.exists();
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    if new_file {
        writeln!(file, "{header}")?;
    }
    writeln!(file, "{row}")?;
    Ok(())
}

fn iso_utc_seconds(utc: f64) -> String {
    DateTime::from_timestamp(utc.round() as i64, 0)
        .unwrap_or_default()
        .format("%Y-%m-%dT%H:%M:%SZ")
        .to_string()
}

fn iso_utc_micros(utc: f64) -> String {
    let secs = utc.floor();
    let nanos = ((utc - secs) * 1e9).round() as u32;
    DateTime::from_timestamp(secs as i64, nanos.min(999_999_999))
        .unwrap_or_default()
        .format("%Y-%m-%dT%H:%M:%S%.6fZ")
        .to_string()
}
