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

//! The minute archive container.
//!
//! One file per channel per UTC minute: a zip with a `meta.json` entry (the
//! explicitly typed schema below) and an `iq.f32le` entry of interleaved
//! little endian f32 I/Q pairs. Files are written to a temporary name,
//! fsynced and renamed, so concurrent readers never observe a partial file.
//! Closed archives are immutable.

use crate::{
    error::ArchiveError,
    station::Station,
    timing::{TimeSnap, TimeSource},
};
use chrono::{DateTime, Utc};
use num_complex::Complex;
use serde::{Deserialize, Serialize};
use std::{
    fs::{self, File},
    io::{BufReader, BufWriter, Read, Write},
    path::{Path, PathBuf},
};
use zip::{CompressionMethod, ZipArchive, ZipWriter, write::SimpleFileOptions};

pub const META_ENTRY: &str = "meta.json";
pub const IQ_ENTRY: &str = "iq.f32le";

/// Suffix of every minute archive file name.
pub const ARCHIVE_SUFFIX: &str = "_iq.zip";

pub const SECONDS_PER_FILE: u32 = 60;

/// Typed archive metadata. Every field is mandatory on read unless marked
/// with a serde default; in particular the five `time_snap_*` fields MUST be
/// present, otherwise the file is corrupt and gets quarantined.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArchiveMeta {
    pub channel_name: String,
    pub frequency_hz: u64,
    pub sample_rate: u32,
    pub rtp_ssrc: u32,
    /// RTP timestamp of the first sample in the file.
    pub rtp_timestamp: u32,
    /// Approximate wall clock at file creation, not a timing reference.
    pub unix_timestamp: f64,
    pub packets_received: u64,
    pub packets_expected: u64,
    pub gaps_count: u32,
    pub gaps_filled: u64,
    #[serde(default)]
    pub truncated: bool,
    pub time_snap_rtp: u32,
    pub time_snap_utc: f64,
    pub time_snap_source: TimeSource,
    pub time_snap_confidence: f32,
    pub time_snap_station: Option<Station>,
    pub gap_rtp_timestamps: Vec<u32>,
    pub gap_sample_indices: Vec<u64>,
    pub gap_samples_filled: Vec<u64>,
    pub gap_packets_lost: Vec<u32>,
    /// Set on decimated products only: the archive they were derived from.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_file: Option<String>,
    /// Set on decimated products only: the sample rate the anchor's RTP
    /// timestamps tick at (the source capture rate).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_sample_rate: Option<u32>,
}

impl ArchiveMeta {
    pub fn time_snap(&self) -> TimeSnap {
        TimeSnap {
            rtp_timestamp: self.time_snap_rtp,
            utc: self.time_snap_utc,
            sample_rate: self.source_sample_rate.unwrap_or(self.sample_rate),
            source: self.time_snap_source,
            confidence: self.time_snap_confidence,
            station: self.time_snap_station,
        }
    }

    /// Schema checks beyond what deserialization enforces.
    pub fn validate(&self, iq_len: usize) -> Result<(), ArchiveError> {
        if self.sample_rate == 0 {
            return Err(ArchiveError::Schema("sample_rate is zero".to_owned()));
        }
        let expected = self.sample_rate as usize * SECONDS_PER_FILE as usize;
        if !self.truncated && iq_len != expected {
            return Err(ArchiveError::Schema(format!(
                "iq length {iq_len} != sample_rate * 60 == {expected}"
            )));
        }
        if self.truncated && iq_len > expected {
            return Err(ArchiveError::Schema(format!(
                "truncated file longer than one minute: {iq_len}"
            )));
        }
        let gaps = self.gaps_count as usize;
        if self.gap_rtp_timestamps.len() != gaps
            || self.gap_sample_indices.len() != gaps
            || self.gap_samples_filled.len() != gaps
            || self.gap_packets_lost.len() != gaps
        {
            return Err(ArchiveError::Schema(
                "gap detail arrays do not match gaps_count".to_owned(),
            ));
        }
        let filled: u64 = self.gap_samples_filled.iter().sum();
        if filled != self.gaps_filled {
            return Err(ArchiveError::Schema(format!(
                "gaps_filled {} != sum of gap_samples_filled {filled}",
                self.gaps_filled
            )));
        }
        Ok(())
    }
}

/// A fully decoded minute archive.
#[derive(Debug, Clone, PartialEq)]
pub struct MinuteArchive {
    pub meta: ArchiveMeta,
    pub iq: Vec<Complex<f32>>,
}

/// File name for the archive covering the minute starting at `utc_minute`,
/// e.g. `20260801T120000Z_10000000_iq.zip`.
pub fn archive_file_name(utc_minute: f64, frequency_hz: u64) -> String {
    let formatted = format_utc_compact(utc_minute);
    format!("{formatted}_{frequency_hz}{ARCHIVE_SUFFIX}")
}

pub fn format_utc_compact(utc: f64) -> String {
    let dt: DateTime<Utc> = DateTime::from_timestamp(utc.round() as i64, 0).unwrap_or_default();
    dt.format("%Y%m%dT%H%M%SZ").to_string()
}

/// Writes `archive` atomically: temp file in the target directory, fsync,
/// rename.
pub fn write_archive(path: &Path, archive: &MinuteArchive) -> Result<(), ArchiveError> {
    let tmp = temp_name(path);
    let result = write_to_temp(&tmp, archive);
    if result.is_err() {
        fs::remove_file(&tmp).ok();
        return result;
    }
    fs::rename(&tmp, path)?;
    Ok(())
}

fn temp_name(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_owned()).unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}

fn write_to_temp(tmp: &Path, archive: &MinuteArchive) -> Result<(), ArchiveError> {
    let file = File::create(tmp)?;
    let mut writer = ZipWriter::new(BufWriter::new(file));
    let options = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);

    writer.start_file(META_ENTRY, options)?;
    writer.write_all(&serde_json::to_vec_pretty(&archive.meta)?)?;

    writer.start_file(IQ_ENTRY, options)?;
    let mut chunk = Vec::with_capacity(64 * 1024);
    for sample in &archive.iq {
        chunk.extend_from_slice(&sample.re.to_le_bytes());
        chunk.extend_from_slice(&sample.im.to_le_bytes());
        if chunk.len() >= 64 * 1024 {
            writer.write_all(&chunk)?;
            chunk.clear();
        }
    }
    writer.write_all(&chunk)?;

    let buffered = writer.finish()?;
    let file = buffered
        .into_inner()
        .map_err(|e| ArchiveError::Io(e.into_error()))?;
    file.sync_all()?;
    Ok(())
}

/// Reads and schema-validates an archive.
pub fn read_archive(path: &Path) -> Result<MinuteArchive, ArchiveError> {
    let file = File::open(path)?;
    let mut container = ZipArchive::new(BufReader::new(file))?;

    let meta: ArchiveMeta = {
        let entry = container.by_name(META_ENTRY)?;
        serde_json::from_reader(entry)?
    };

    let iq = {
        let mut entry = container.by_name(IQ_ENTRY)?;
        let mut bytes = Vec::new();
        entry.read_to_end(&mut bytes)?;
        decode_iq_entry(&bytes)?
    };

    meta.validate(iq.len())?;
    Ok(MinuteArchive { meta, iq })
}

fn decode_iq_entry(bytes: &[u8]) -> Result<Vec<Complex<f32>>, ArchiveError> {
    if bytes.len() % 8 != 0 {
        return Err(ArchiveError::Schema(format!(
            "iq entry length {} is not a whole number of complex samples",
            bytes.len()
        )));
    }
    let mut iq = Vec::with_capacity(bytes.len() / 8);
    for pair in bytes.chunks_exact(8) {
        let re = f32::from_le_bytes([pair[0], pair[1], pair[2], pair[3]]);
        let im = f32::from_le_bytes([pair[4], pair[5], pair[6], pair[7]]);
        iq.push(Complex::new(re, im));
    }
    Ok(iq)
}
