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

//! The per-SSRC channel processor.
//!
//! Owns the resequencer, the startup buffer, the anchor and the archive
//! writer for exactly one channel. Packets flow in from the supervisor's
//! demux; nothing is shared with other channels.
//!
//! State machine: `startup_buffering` collects resequenced output until the
//! buffered span covers the configured duration, then the tone-onset
//! detector anchors the stream, the writer is created with that anchor
//! fixed for the life of the session, the buffer is replayed into it and
//! the processor stays in `recording` until shutdown.

use crate::{
    config::ChannelConfig,
    resequencer::{Resequencer, SequencedEvent},
    rtp::IqPacket,
    status::{AnchorSummary, ChannelStatus},
    timing::{NtpMonitor, TimeSnap, TimeSource, unix_now},
    tone::onset::{self, MinuteMarkOnset, OnsetParams},
    writer::{ArchiveWriter, GapAttribution},
};
use num_complex::Complex;
use std::{path::PathBuf, sync::Arc};
use tracing::{error, info, warn};

/// How far the approximate wall-clock onset may sit from the nearest whole
/// minute before the detection is considered bogus.
pub const MINUTE_ASSIGN_TOLERANCE_SECS: f64 = 10.0;

const NTP_CONFIDENCE: f32 = 0.7;
const WALL_CLOCK_CONFIDENCE: f32 = 0.3;
const TONE_CONFIDENCE_CAP: f32 = 0.95;

struct StartupBuffer {
    first_timestamp: Option<u32>,
    total_samples: u64,
    events: Vec<SequencedEvent>,
}

pub struct ChannelProcessor {
    config: ChannelConfig,
    output_dir: PathBuf,
    startup_target_samples: u64,
    onset_params: OnsetParams,
    ntp: Arc<NtpMonitor>,
    wall_clock: Box<dyn Fn() -> f64 + Send>,
    resequencer: Resequencer,
    startup: Option<StartupBuffer>,
    writer: Option<ArchiveWriter>,
    packets_received: u64,
    gaps: u64,
    samples_zero_filled: u64,
    processing_errors: u64,
}

impl ChannelProcessor {
    pub fn new(
        config: ChannelConfig,
        output_dir: PathBuf,
        startup_buffer_secs: u32,
        ntp: Arc<NtpMonitor>,
    ) -> Self {
        // Roughly two seconds of reorder depth at the expected packet rate.
        let reorder_depth =
            (2 * config.sample_rate / config.samples_per_packet).max(16) as usize;
        Self {
            resequencer: Resequencer::new(reorder_depth, config.sample_rate),
            startup_target_samples: config.sample_rate as u64 * startup_buffer_secs as u64,
            onset_params: OnsetParams::default(),
            ntp,
            wall_clock: Box::new(unix_now),
            startup: Some(StartupBuffer {
                first_timestamp: None,
                total_samples: 0,
                events: Vec::new(),
            }),
            writer: None,
            packets_received: 0,
            gaps: 0,
            samples_zero_filled: 0,
            processing_errors: 0,
            config,
            output_dir,
        }
    }

    /// Replaces the wall clock used for approximate UTC assignment.
    /// Production always uses the system clock; simulations and tests
    /// inject their own.
    pub fn with_wall_clock(mut self, clock: impl Fn() -> f64 + Send + 'static) -> Self {
        self.wall_clock = Box::new(clock);
        self
    }

    pub fn anchor(&self) -> Option<&TimeSnap> {
        self.writer.as_ref().map(|w| w.time_snap())
    }

    pub fn handle_packet(&mut self, packet: IqPacket) {
        self.packets_received += 1;
        let events = self.resequencer.push(packet);
        self.dispatch(events);
    }

    /// Drains the resequencer and flushes the partial minute. A channel
    /// that never left startup buffering has nothing anchored to write; its
    /// samples are discarded.
    pub fn shutdown(&mut self) {
        let events = self.resequencer.flush();
        self.dispatch(events);
        match self.writer.as_ref().map(ArchiveWriter::flush) {
            Some(Err(e)) => {
                self.processing_errors += 1;
                error!("flushing writer for channel '{}': {e}", self.config.name);
            }
            Some(Ok(())) => {}
            None => {
                if let Some(startup) = &self.startup {
                    info!(
                        "channel '{}' shut down before anchor establishment, discarding {} buffered samples",
                        self.config.name, startup.total_samples
                    );
                }
            }
        }
    }

    pub fn status(&self) -> ChannelStatus {
        let rs = self.resequencer.counters();
        let ws = self.writer.as_ref().map(|w| w.stats()).unwrap_or_default();
        ChannelStatus {
            ssrc: self.config.ssrc,
            frequency_hz: self.config.frequency_hz,
            sample_rate: self.config.sample_rate,
            state: if self.writer.is_some() {
                "recording".to_owned()
            } else {
                "startup_buffering".to_owned()
            },
            packets_received: self.packets_received,
            duplicates: rs.duplicates,
            late_drops: rs.late_drops,
            forced_advances: rs.forced_advances,
            resyncs: rs.resyncs,
            gaps: self.gaps,
            samples_zero_filled: self.samples_zero_filled,
            processing_errors: self.processing_errors,
            files_written: ws.files_written,
            write_failures: ws.write_failures,
            minutes_discarded: ws.minutes_discarded,
            alignment_skipped: ws.alignment_skipped,
            anchor: self.anchor().map(AnchorSummary::from),
        }
    }

    fn dispatch(&mut self, events: Vec<SequencedEvent>) {
        for event in events {
            if let SequencedEvent::Gap { fill, .. } = &event {
                self.gaps += 1;
                self.samples_zero_filled += fill.len() as u64;
            }
            if self.writer.is_some() {
                self.forward(&event);
            } else {
                self.buffer(event);
            }
        }
        if self.writer.is_none() && self.startup_complete() {
            self.establish_anchor();
        }
    }

    fn forward(&mut self, event: &SequencedEvent) {
        let result = {
            let Some(writer) = &self.writer else {
                return;
            };
            match event {
                SequencedEvent::Samples {
                    rtp_timestamp,
                    samples,
                } => writer.add_samples(*rtp_timestamp, samples, None),
                SequencedEvent::Gap {
                    start_timestamp,
                    fill,
                    packets_lost,
                    ..
                } => writer.add_samples(
                    *start_timestamp,
                    fill,
                    Some(GapAttribution {
                        packets_lost: *packets_lost,
                    }),
                ),
            }
        };
        if let Err(e) = result {
            self.processing_errors += 1;
            error!("channel '{}' writer error: {e}", self.config.name);
        }
    }

    fn buffer(&mut self, event: SequencedEvent) {
        let Some(startup) = &mut self.startup else {
            return;
        };
        match &event {
            SequencedEvent::Samples {
                rtp_timestamp,
                samples,
            } => {
                startup.first_timestamp.get_or_insert(*rtp_timestamp);
                startup.total_samples += samples.len() as u64;
            }
            SequencedEvent::Gap {
                start_timestamp,
                fill,
                ..
            } => {
                startup.first_timestamp.get_or_insert(*start_timestamp);
                startup.total_samples += fill.len() as u64;
            }
        }
        startup.events.push(event);
    }

    fn startup_complete(&self) -> bool {
        self.startup
            .as_ref()
            .is_some_and(|s| s.total_samples >= self.startup_target_samples)
    }

    /// Concatenates the startup buffer, anchors it (tone > NTP > wall
    /// clock), creates the writer and replays everything buffered into it.
    fn establish_anchor(&mut self) {
        let Some(startup) = self.startup.take() else {
            return;
        };
        let Some(first_timestamp) = startup.first_timestamp else {
            self.startup = Some(startup);
            return;
        };

        let mut contiguous: Vec<Complex<f32>> =
            Vec::with_capacity(startup.total_samples as usize);
        for event in &startup.events {
            match event {
                SequencedEvent::Samples { samples, .. } => contiguous.extend_from_slice(samples),
                SequencedEvent::Gap { fill, .. } => contiguous.extend_from_slice(fill),
            }
        }

        let onset = onset::detect_minute_mark(
            &contiguous,
            self.config.sample_rate,
            &self.config.stations,
            &self.onset_params,
        );
        let snap = self.derive_snap(first_timestamp, contiguous.len() as u64, onset);
        info!(
            "channel '{}' anchored: source {}, confidence {:.2}, station {:?}",
            self.config.name, snap.source, snap.confidence, snap.station
        );

        match ArchiveWriter::new(self.config.clone(), snap, self.output_dir.clone()) {
            Ok(writer) => {
                self.writer = Some(writer);
                for event in &startup.events {
                    self.forward(event);
                }
            }
            Err(e) => {
                // Without a writer nothing can be recorded; go back to
                // buffering and try again when more data has arrived.
                self.processing_errors += 1;
                error!(
                    "channel '{}' could not create archive writer: {e}",
                    self.config.name
                );
                self.startup = Some(startup);
                self.startup_target_samples +=
                    self.config.sample_rate as u64 * 10;
            }
        }
    }

    fn derive_snap(
        &mut self,
        first_timestamp: u32,
        buffered_samples: u64,
        onset: Option<MinuteMarkOnset>,
    ) -> TimeSnap {
        let now = (self.wall_clock)();
        let sample_rate = self.config.sample_rate;
        let buffer_start_utc = now - buffered_samples as f64 / sample_rate as f64;

        if let Some(onset) = onset {
            let onset_utc_approx = buffer_start_utc + onset.onset_index / sample_rate as f64;
            let minute = (onset_utc_approx / 60.0).round() * 60.0;
            if (onset_utc_approx - minute).abs() <= MINUTE_ASSIGN_TOLERANCE_SECS {
                return TimeSnap {
                    rtp_timestamp: first_timestamp,
                    utc: minute - onset.onset_index / sample_rate as f64,
                    sample_rate,
                    source: TimeSource::ToneOnset,
                    confidence: onset_confidence(onset.snr_db, self.onset_params.min_snr_db),
                    station: Some(onset.station),
                };
            }
            warn!(
                "channel '{}': onset {:.1} s away from any whole minute, falling back",
                self.config.name,
                (onset_utc_approx - minute).abs()
            );
        }

        if self.ntp.synchronized() {
            TimeSnap {
                rtp_timestamp: first_timestamp,
                utc: buffer_start_utc,
                sample_rate,
                source: TimeSource::Ntp,
                confidence: NTP_CONFIDENCE,
                station: None,
            }
        } else {
            TimeSnap {
                rtp_timestamp: first_timestamp,
                utc: buffer_start_utc,
                sample_rate,
                source: TimeSource::WallClock,
                confidence: WALL_CLOCK_CONFIDENCE,
                station: None,
            }
        }
    }
}

/// Normalized SNR margin, capped below 1 so tone anchors are never claimed
/// perfect.
fn onset_confidence(snr_db: f32, min_snr_db: f32) -> f32 {
    (0.5 + (snr_db - min_snr_db) / 20.0).clamp(0.0, TONE_CONFIDENCE_CAP)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{config::test::test_channel, station::Station};

    const SAMPLE_RATE: u32 = 3200;
    const SAMPLES_PER_PACKET: usize = 320;
    // A whole minute.
    const MINUTE_UTC: f64 = 1_700_000_160.0;

    fn processor(dir: &std::path::Path, stations: Vec<Station>, startup_secs: u32) -> ChannelProcessor {
        let mut config = test_channel(0xABCD, "wwv10");
        config.sample_rate = SAMPLE_RATE;
        config.samples_per_packet = SAMPLES_PER_PACKET as u32;
        config.stations = stations;
        ChannelProcessor::new(
            config,
            dir.to_path_buf(),
            startup_secs,
            Arc::new(NtpMonitor::default()),
        )
    }

    /// Chops a signal into RTP packets and feeds them through the
    /// processor.
    fn feed(processor: &mut ChannelProcessor, signal: &[Complex<f32>], first_rtp: u32) {
        for (i, block) in signal.chunks(SAMPLES_PER_PACKET).enumerate() {
            processor.handle_packet(IqPacket {
                ssrc: 0xABCD,
                sequence: i as u16,
                timestamp: first_rtp.wrapping_add((i * SAMPLES_PER_PACKET) as u32),
                samples: block.to_vec(),
            });
        }
    }

    fn carrier_with_tone(len_secs: f64, tone_start: f64, tone_duration: f64) -> Vec<Complex<f32>> {
        let n = (len_secs * SAMPLE_RATE as f64) as usize;
        (0..n)
            .map(|i| {
                let t = i as f64 / SAMPLE_RATE as f64;
                let audio = if t >= tone_start && t < tone_start + tone_duration {
                    0.5 * (2.0 * std::f64::consts::PI * 1000.0 * t).sin()
                } else {
                    0.0
                };
                Complex::from_polar(0.4 * (1.0 + 0.8 * audio as f32), 0.1)
            })
            .collect()
    }

    #[test]
    fn tone_onset_anchors_the_channel_on_a_minute_boundary() {
        let dir = tempfile::tempdir().expect("tempdir");
        // Buffer is 8 s long with the minute mark 4 s in; pretend the wall
        // clock says the buffer ended 4 s after a whole minute.
        let mut processor = processor(dir.path(), vec![Station::Wwv, Station::Wwvh], 8)
            .with_wall_clock(|| MINUTE_UTC + 4.0);

        let signal = carrier_with_tone(8.5, 4.0, 0.8);
        feed(&mut processor, &signal, 50_000);

        let anchor = processor.anchor().expect("anchor established").clone();
        assert_eq!(anchor.source, TimeSource::ToneOnset);
        assert_eq!(anchor.station, Some(Station::Wwv));
        assert!(anchor.confidence <= TONE_CONFIDENCE_CAP);
        // The sample at the detected onset must map onto a whole minute.
        let onset_rtp = 50_000 + (4.0 * SAMPLE_RATE as f64) as u32;
        let onset_utc = anchor.utc_of(onset_rtp);
        let distance = (onset_utc / 60.0 - (onset_utc / 60.0).round()).abs() * 60.0;
        assert!(distance < 0.005, "onset {distance} s off a minute");
    }

    #[test]
    fn s4_startup_without_tone_falls_back_to_clock_sources() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut processor = processor(dir.path(), vec![Station::Wwv], 4)
            .with_wall_clock(|| MINUTE_UTC + 33.0);

        let signal = carrier_with_tone(4.5, 0.0, 0.0);
        feed(&mut processor, &signal, 10_000);

        let anchor = processor.anchor().expect("anchor established");
        assert!(matches!(
            anchor.source,
            TimeSource::Ntp | TimeSource::WallClock
        ));
        assert!(anchor.confidence < TONE_CONFIDENCE_CAP);
        assert_eq!(anchor.station, None);
    }

    #[test]
    fn onset_far_from_a_minute_is_rejected() {
        let dir = tempfile::tempdir().expect("tempdir");
        // The tone sits 25 s away from the nearest minute per the wall
        // clock, beyond tolerance, so it cannot be a real minute mark.
        let mut processor = processor(dir.path(), vec![Station::Wwv], 8)
            .with_wall_clock(|| MINUTE_UTC + 29.0);

        let signal = carrier_with_tone(8.5, 4.0, 0.8);
        feed(&mut processor, &signal, 50_000);

        let anchor = processor.anchor().expect("anchor established");
        assert!(matches!(
            anchor.source,
            TimeSource::Ntp | TimeSource::WallClock
        ));
    }

    #[test]
    fn startup_buffer_is_replayed_into_the_writer() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut processor = processor(dir.path(), vec![Station::Wwv], 4)
            .with_wall_clock(|| MINUTE_UTC + 2.0);

        // No tone: fallback anchor maps the buffer start to "now - 4.5 s",
        // so the first minute boundary lands inside the replayed data and
        // the writer starts accumulating immediately.
        let signal = carrier_with_tone(4.5, 0.0, 0.0);
        feed(&mut processor, &signal, 10_000);
        assert!(processor.anchor().is_some());

        let status = processor.status();
        assert_eq!(status.state, "recording");
        assert_eq!(status.packets_received, 45);
        // Some samples were skipped aligning to the first minute boundary.
        assert!(status.alignment_skipped > 0);

        processor.shutdown();
        let files: Vec<_> = std::fs::read_dir(dir.path().join("wwv10"))
            .expect("channel dir")
            .collect();
        assert_eq!(files.len(), 1, "flush writes the partial minute");
    }
}
