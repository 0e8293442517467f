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

//! Anchor-aware minute archive writer.
//!
//! Minute boundaries are a deterministic function of the embedded timing
//! anchor and the sample rate; the wall clock never influences boundary
//! selection. A file closes when exactly `sample_rate * 60` samples have
//! accumulated since its start boundary, never earlier or later.
//!
//! The anchor is fixed at construction time and embedded unchanged in every
//! file this writer produces. All state sits behind a single exclusive lock
//! so the sample-count invariant is checked atomically with file rollover.

use crate::{
    archive::{self, ArchiveMeta, MinuteArchive, SECONDS_PER_FILE},
    config::ChannelConfig,
    error::TimemarkResult,
    timing::{self, TimeSnap},
};
use num_complex::Complex;
use std::{
    fs,
    path::PathBuf,
    sync::Mutex,
};
use tracing::{debug, info, warn};

/// Gap metadata accompanying a zero-fill batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GapAttribution {
    pub packets_lost: u32,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WriterStats {
    pub files_written: u64,
    pub write_failures: u64,
    pub minutes_discarded: u64,
    pub alignment_skipped: u64,
}

struct PendingGap {
    start_timestamp: u32,
    sample_index: u64,
    samples: u64,
    packets_lost: u32,
}

struct WriterState {
    /// False until the first anchor-aligned minute boundary has been seen;
    /// samples before it are discarded so every non-truncated file holds
    /// exactly one minute.
    aligned: bool,
    file_start_rtp: u32,
    iq: Vec<Complex<f32>>,
    gaps: Vec<PendingGap>,
    packets_received: u64,
    stats: WriterStats,
}

pub struct ArchiveWriter {
    channel: ChannelConfig,
    snap: TimeSnap,
    channel_dir: PathBuf,
    minute_samples: usize,
    state: Mutex<WriterState>,
}

impl ArchiveWriter {
    pub fn new(channel: ChannelConfig, snap: TimeSnap, output_dir: PathBuf) -> TimemarkResult<Self> {
        let channel_dir = output_dir.join(&channel.name);
        fs::create_dir_all(&channel_dir)?;
        let minute_samples = channel.sample_rate as usize * SECONDS_PER_FILE as usize;
        info!(
            "Archive writer for channel '{}' anchored at RTP {} = UTC {:.6} ({})",
            channel.name, snap.rtp_timestamp, snap.utc, snap.source
        );
        Ok(Self {
            channel,
            snap,
            channel_dir,
            minute_samples,
            state: Mutex::new(WriterState {
                aligned: false,
                file_start_rtp: 0,
                iq: Vec::with_capacity(minute_samples),
                gaps: Vec::new(),
                packets_received: 0,
                stats: WriterStats::default(),
            }),
        })
    }

    pub fn time_snap(&self) -> &TimeSnap {
        &self.snap
    }

    pub fn stats(&self) -> WriterStats {
        self.lock().stats
    }

    /// Appends samples in RTP timestamp order, splitting exactly at minute
    /// boundaries. `gap` marks the batch as zero fill for an accounted
    /// discontinuity.
    ///
    /// Write errors are retried once and then the affected minute is
    /// discarded; recording always continues.
    pub fn add_samples(
        &self,
        rtp_timestamp: u32,
        samples: &[Complex<f32>],
        gap: Option<GapAttribution>,
    ) -> TimemarkResult<()> {
        let mut state = self.lock();

        let mut timestamp = rtp_timestamp;
        let mut samples = samples;

        if !state.aligned {
            let skip = self.snap.samples_until_next_minute(timestamp) as usize;
            if skip >= samples.len() {
                state.stats.alignment_skipped += samples.len() as u64;
                return Ok(());
            }
            state.stats.alignment_skipped += skip as u64;
            timestamp = timestamp.wrapping_add(skip as u32);
            samples = &samples[skip..];
            state.aligned = true;
            state.file_start_rtp = timestamp;
            debug!(
                "channel '{}' aligned to minute boundary at RTP {timestamp} after skipping {skip} samples",
                self.channel.name
            );
        }

        if gap.is_none() {
            state.packets_received += 1;
        }

        let mut offset = 0usize;
        while offset < samples.len() {
            let room = self.minute_samples - state.iq.len();
            let take = room.min(samples.len() - offset);
            if let Some(attribution) = gap {
                let sample_index = state.iq.len() as u64;
                state.gaps.push(PendingGap {
                    start_timestamp: timestamp.wrapping_add(offset as u32),
                    sample_index,
                    samples: take as u64,
                    // The loss estimate belongs to the segment where the gap
                    // starts; continuations into the next file carry zero.
                    packets_lost: if offset == 0 { attribution.packets_lost } else { 0 },
                });
            }
            state.iq.extend_from_slice(&samples[offset..offset + take]);
            offset += take;
            if state.iq.len() == self.minute_samples {
                self.close_file(&mut state, false);
            }
        }

        Ok(())
    }

    /// Writes the partial minute at shutdown, flagged as truncated.
    pub fn flush(&self) -> TimemarkResult<()> {
        let mut state = self.lock();
        if state.aligned && !state.iq.is_empty() {
            self.close_file(&mut state, true);
        }
        Ok(())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, WriterState> {
        match self.state.lock() {
            Ok(it) => it,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn close_file(&self, state: &mut WriterState, truncated: bool) {
        let iq = std::mem::take(&mut state.iq);
        let gaps = std::mem::take(&mut state.gaps);
        let packets_received = state.packets_received;
        let file_start_rtp = state.file_start_rtp;

        state.packets_received = 0;
        state.file_start_rtp = file_start_rtp.wrapping_add(self.minute_samples as u32);
        state.iq.reserve(self.minute_samples);

        let gaps_filled: u64 = gaps.iter().map(|g| g.samples).sum();
        let meta = ArchiveMeta {
            channel_name: self.channel.name.clone(),
            frequency_hz: self.channel.frequency_hz,
            sample_rate: self.channel.sample_rate,
            rtp_ssrc: self.channel.ssrc,
            rtp_timestamp: file_start_rtp,
            unix_timestamp: timing::unix_now(),
            packets_received,
            packets_expected: (iq.len() / self.channel.samples_per_packet as usize) as u64,
            gaps_count: gaps.len() as u32,
            gaps_filled,
            truncated,
            time_snap_rtp: self.snap.rtp_timestamp,
            time_snap_utc: self.snap.utc,
            time_snap_source: self.snap.source,
            time_snap_confidence: self.snap.confidence,
            time_snap_station: self.snap.station,
            gap_rtp_timestamps: gaps.iter().map(|g| g.start_timestamp).collect(),
            gap_sample_indices: gaps.iter().map(|g| g.sample_index).collect(),
            gap_samples_filled: gaps.iter().map(|g| g.samples).collect(),
            gap_packets_lost: gaps.iter().map(|g| g.packets_lost).collect(),
            source_file: None,
            source_sample_rate: None,
        };

        let minute_utc = self.snap.utc_of(file_start_rtp);
        let path = self
            .channel_dir
            .join(archive::archive_file_name(minute_utc, self.channel.frequency_hz));
        let archive = MinuteArchive { meta, iq };

        match archive::write_archive(&path, &archive)
            .or_else(|e| {
                warn!(
                    "writing archive {} failed, retrying once: {e}",
                    path.to_string_lossy()
                );
                archive::write_archive(&path, &archive)
            }) {
            Ok(()) => {
                state.stats.files_written += 1;
                debug!(
                    "channel '{}' wrote archive {} ({} samples, {} gaps)",
                    self.channel.name,
                    path.to_string_lossy(),
                    archive.iq.len(),
                    archive.meta.gaps_count
                );
            }
            Err(e) => {
                state.stats.write_failures += 1;
                state.stats.minutes_discarded += 1;
                warn!(
                    "discarding minute at RTP {file_start_rtp} for channel '{}': {e}",
                    self.channel.name
                );
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{
        archive::read_archive,
        config::test::test_channel,
        resequencer::{Resequencer, SequencedEvent},
        rtp::IqPacket,
        station::Station,
        timing::TimeSource,
    };
    use std::path::Path;

    // 1_700_000_160 is divisible by 60, so an anchor with this UTC sits
    // exactly on a minute boundary.
    const MINUTE_UTC: f64 = 1_700_000_160.0;

    fn snap(rtp: u32, sample_rate: u32) -> TimeSnap {
        TimeSnap {
            rtp_timestamp: rtp,
            utc: MINUTE_UTC,
            sample_rate,
            source: TimeSource::ToneOnset,
            confidence: 0.9,
            station: Some(Station::Wwv),
        }
    }

    fn channel(sample_rate: u32, samples_per_packet: u32) -> ChannelConfig {
        let mut channel = test_channel(0x1234, "wwv10");
        channel.sample_rate = sample_rate;
        channel.samples_per_packet = samples_per_packet;
        channel
    }

    fn archives_in(dir: &Path) -> Vec<PathBuf> {
        let mut files: Vec<PathBuf> = fs::read_dir(dir.join("wwv10"))
            .expect("channel dir")
            .map(|e| e.expect("entry").path())
            .collect();
        files.sort();
        files
    }

    fn ones(n: usize) -> Vec<Complex<f32>> {
        vec![Complex::new(0.25, -0.25); n]
    }

    fn drive(writer: &ArchiveWriter, events: Vec<SequencedEvent>) {
        for event in events {
            match event {
                SequencedEvent::Samples {
                    rtp_timestamp,
                    samples,
                } => writer
                    .add_samples(rtp_timestamp, &samples, None)
                    .expect("add"),
                SequencedEvent::Gap {
                    start_timestamp,
                    fill,
                    packets_lost,
                    ..
                } => writer
                    .add_samples(
                        start_timestamp,
                        &fill,
                        Some(GapAttribution { packets_lost }),
                    )
                    .expect("add gap"),
            }
        }
    }

    #[test]
    fn s1_clean_minute() {
        let dir = tempfile::tempdir().expect("tempdir");
        let writer = ArchiveWriter::new(
            channel(16_000, 320),
            snap(1_000_000, 16_000),
            dir.path().to_path_buf(),
        )
        .expect("writer");

        let block = ones(320);
        for i in 0..3000u32 {
            writer
                .add_samples(1_000_000 + i * 320, &block, None)
                .expect("add");
        }

        let files = archives_in(dir.path());
        assert_eq!(files.len(), 1);
        let archive = read_archive(&files[0]).expect("read");
        assert_eq!(archive.iq.len(), 960_000);
        assert_eq!(archive.meta.rtp_timestamp, 1_000_000);
        assert_eq!(archive.meta.packets_received, 3000);
        assert_eq!(archive.meta.packets_expected, 3000);
        assert_eq!(archive.meta.gaps_count, 0);
        assert_eq!(archive.meta.gaps_filled, 0);
        assert!(!archive.meta.truncated);
        assert_eq!(writer.stats().files_written, 1);
    }

    #[test]
    fn s2_single_packet_loss() {
        let dir = tempfile::tempdir().expect("tempdir");
        let writer = ArchiveWriter::new(
            channel(16_000, 320),
            snap(1_000_000, 16_000),
            dir.path().to_path_buf(),
        )
        .expect("writer");

        let mut resequencer = Resequencer::new(100, 16_000);
        for seq in 0..3000u32 {
            if seq == 1500 {
                continue;
            }
            let events = resequencer.push(IqPacket {
                ssrc: 0x1234,
                sequence: seq as u16,
                timestamp: 1_000_000 + seq * 320,
                samples: ones(320),
            });
            drive(&writer, events);
        }
        drive(&writer, resequencer.flush());
        writer.flush().expect("flush");

        let files = archives_in(dir.path());
        assert_eq!(files.len(), 1);
        let archive = read_archive(&files[0]).expect("read");
        assert_eq!(archive.iq.len(), 960_000);
        assert_eq!(archive.meta.gaps_count, 1);
        assert_eq!(archive.meta.gap_samples_filled, vec![320]);
        assert_eq!(archive.meta.gap_sample_indices, vec![480_000]);
        assert_eq!(archive.meta.gap_packets_lost, vec![1]);
        assert_eq!(archive.meta.packets_received, 2999);
        assert_eq!(archive.meta.packets_expected, 3000);
        // The zero fill really is zeros, surrounded by data.
        assert_eq!(archive.iq[480_000].norm(), 0.0);
        assert_eq!(archive.iq[480_319].norm(), 0.0);
        assert!(archive.iq[479_999].norm() > 0.0);
        assert!(archive.iq[480_320].norm() > 0.0);
    }

    #[test]
    fn s3_out_of_order_delivery_matches_clean_minute() {
        let dir = tempfile::tempdir().expect("tempdir");
        let writer = ArchiveWriter::new(
            channel(16_000, 320),
            snap(1_000_000, 16_000),
            dir.path().to_path_buf(),
        )
        .expect("writer");

        let mut resequencer = Resequencer::new(100, 16_000);
        let mut order: Vec<u32> = (0..3000).collect();
        order.swap(100, 105);
        for seq in order {
            let events = resequencer.push(IqPacket {
                ssrc: 0x1234,
                sequence: seq as u16,
                timestamp: 1_000_000 + seq * 320,
                samples: ones(320),
            });
            drive(&writer, events);
        }

        let files = archives_in(dir.path());
        assert_eq!(files.len(), 1);
        let archive = read_archive(&files[0]).expect("read");
        assert_eq!(archive.iq.len(), 960_000);
        assert_eq!(archive.meta.gaps_count, 0);
        assert_eq!(archive.meta.packets_received, 3000);
    }

    #[test]
    fn batch_straddling_boundary_is_split_exactly() {
        let dir = tempfile::tempdir().expect("tempdir");
        let writer = ArchiveWriter::new(
            channel(100, 10),
            snap(5000, 100),
            dir.path().to_path_buf(),
        )
        .expect("writer");

        writer.add_samples(5000, &ones(5950), None).expect("add");
        // 150 samples straddle the boundary at sample 6000.
        writer.add_samples(10_950, &ones(150), None).expect("add");
        writer.flush().expect("flush");

        let files = archives_in(dir.path());
        assert_eq!(files.len(), 2);
        let first = read_archive(&files[0]).expect("read first");
        let second = read_archive(&files[1]).expect("read second");
        assert_eq!(first.iq.len(), 6000);
        assert!(!first.meta.truncated);
        assert_eq!(second.iq.len(), 100);
        assert!(second.meta.truncated);
        // RTP contiguity across consecutive files of a session.
        assert_eq!(
            second.meta.rtp_timestamp,
            first.meta.rtp_timestamp.wrapping_add(6000)
        );
        // The anchor is identical in both files.
        assert_eq!(first.meta.time_snap_rtp, second.meta.time_snap_rtp);
        assert_eq!(first.meta.time_snap_utc, second.meta.time_snap_utc);
        assert_eq!(first.meta.time_snap_source, second.meta.time_snap_source);
    }

    #[test]
    fn s6_shutdown_mid_minute_writes_truncated_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let writer = ArchiveWriter::new(
            channel(16_000, 320),
            snap(1_000_000, 16_000),
            dir.path().to_path_buf(),
        )
        .expect("writer");

        let block = ones(320);
        // 27 seconds worth of packets.
        for i in 0..1350u32 {
            writer
                .add_samples(1_000_000 + i * 320, &block, None)
                .expect("add");
        }
        writer.flush().expect("flush");

        let files = archives_in(dir.path());
        assert_eq!(files.len(), 1);
        let archive = read_archive(&files[0]).expect("read");
        assert_eq!(archive.iq.len(), 432_000);
        assert!(archive.meta.truncated);
        assert_eq!(archive.meta.packets_received, 1350);
        assert_eq!(archive.meta.packets_expected, 1350);
    }

    #[test]
    fn rtp_timestamp_wrap_mid_minute_does_not_split_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let first_rtp = u32::MAX - 2999;
        let writer = ArchiveWriter::new(
            channel(100, 10),
            snap(first_rtp, 100),
            dir.path().to_path_buf(),
        )
        .expect("writer");

        for i in 0..60u32 {
            writer
                .add_samples(first_rtp.wrapping_add(i * 100), &ones(100), None)
                .expect("add");
        }

        let files = archives_in(dir.path());
        assert_eq!(files.len(), 1);
        let archive = read_archive(&files[0]).expect("read");
        assert_eq!(archive.iq.len(), 6000);
        assert_eq!(archive.meta.rtp_timestamp, first_rtp);
        assert_eq!(archive.meta.gaps_count, 0);
        assert!(!archive.meta.truncated);
    }

    #[test]
    fn samples_before_first_boundary_are_discarded() {
        let dir = tempfile::tempdir().expect("tempdir");
        // The anchor maps RTP 5000 to half a second before the boundary.
        let anchor = TimeSnap {
            rtp_timestamp: 5000,
            utc: MINUTE_UTC - 0.5,
            sample_rate: 100,
            source: TimeSource::Ntp,
            confidence: 0.7,
            station: None,
        };
        let writer =
            ArchiveWriter::new(channel(100, 10), anchor, dir.path().to_path_buf()).expect("writer");

        writer.add_samples(5000, &ones(6100), None).expect("add");
        writer.flush().expect("flush");

        let files = archives_in(dir.path());
        assert_eq!(files.len(), 2);
        let first = read_archive(&files[0]).expect("read");
        assert_eq!(first.meta.rtp_timestamp, 5050);
        assert_eq!(first.iq.len(), 6000);
        assert_eq!(writer.stats().alignment_skipped, 50);
    }

    #[test]
    fn gap_straddling_boundary_is_accounted_per_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let writer = ArchiveWriter::new(
            channel(100, 10),
            snap(0, 100),
            dir.path().to_path_buf(),
        )
        .expect("writer");

        writer.add_samples(0, &ones(5990), None).expect("add");
        let zeros = vec![Complex::new(0.0, 0.0); 20];
        writer
            .add_samples(5990, &zeros, Some(GapAttribution { packets_lost: 2 }))
            .expect("gap");
        writer.add_samples(6010, &ones(10), None).expect("add");
        writer.flush().expect("flush");

        let files = archives_in(dir.path());
        assert_eq!(files.len(), 2);
        let first = read_archive(&files[0]).expect("read first");
        let second = read_archive(&files[1]).expect("read second");

        assert_eq!(first.meta.gaps_count, 1);
        assert_eq!(first.meta.gap_samples_filled, vec![10]);
        assert_eq!(first.meta.gap_sample_indices, vec![5990]);
        assert_eq!(first.meta.gap_packets_lost, vec![2]);
        assert_eq!(first.meta.gaps_filled, 10);

        assert_eq!(second.meta.gaps_count, 1);
        assert_eq!(second.meta.gap_samples_filled, vec![10]);
        assert_eq!(second.meta.gap_sample_indices, vec![0]);
        assert_eq!(second.meta.gap_packets_lost, vec![0]);
        assert_eq!(second.meta.gaps_filled, 10);
    }
}
