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

//! The analytics service.
//!
//! One worker per channel polls that channel's archive directory, runs each
//! previously-unseen minute file through quality analysis, matched-filter
//! tone detection and decimation, and persists its state after every file.
//! Archives are read once and never mutated; the embedded anchor is used as
//! is for all time mapping. Malformed archives are quarantined and the loop
//! moves on.

pub mod discrimination;
pub mod outputs;
pub mod quality;
pub mod state;

use crate::{
    archive::{self, ARCHIVE_SUFFIX},
    config::{AnalyticsConfig, ChannelConfig},
    dsp::decimate::MinuteDecimator,
    error::{TimemarkError, TimemarkResult},
    status::{AnalyticsStatus, write_json_atomic},
    timing::{TimeSnap, TimeSource, unix_now},
    tone::matched::{MatchedFilterParams, MinuteToneAnalysis, analyze_minute},
};
use outputs::ChannelOutputs;
use state::ChannelState;
use std::{
    fs,
    path::{Path, PathBuf},
    time::Duration,
};
use tokio::{select, time::sleep};
use tokio_graceful_shutdown::{SubsystemBuilder, SubsystemHandle};
use tracing::{error, info, warn};

const MAX_ATTEMPTS_PER_FILE: u32 = 3;
const RETRY_BACKOFF: Duration = Duration::from_millis(500);

/// Tone onsets further than this from a whole minute do not yield anchor
/// refinements.
const REFINEMENT_TOLERANCE_SECS: f64 = 10.0;

pub async fn run_analytics(
    subsys: SubsystemHandle,
    config: AnalyticsConfig,
    service: String,
) -> TimemarkResult<()> {
    info!("Starting analytics: {} channel(s)", config.channels.len());
    for channel in config.channels.clone() {
        let name = format!("analytics-{}", channel.name);
        let config = config.clone();
        let service = service.clone();
        subsys.start(SubsystemBuilder::new(name, move |s| {
            channel_worker(s, config, channel, service)
        }));
    }
    Ok(())
}

struct ChannelPaths {
    archive_dir: PathBuf,
    quarantine_dir: PathBuf,
    state_file: PathBuf,
    status_file: PathBuf,
}

impl ChannelPaths {
    fn new(config: &AnalyticsConfig, channel_name: &str) -> TimemarkResult<Self> {
        let archive_dir = config.archive_dir.join(channel_name);
        let state_dir = config.state_dir.join(channel_name);
        fs::create_dir_all(&state_dir)?;
        Ok(Self {
            quarantine_dir: archive_dir.join("quarantine"),
            archive_dir,
            state_file: state_dir.join("state.json"),
            status_file: state_dir.join("analytics-status.json"),
        })
    }
}

async fn channel_worker(
    subsys: SubsystemHandle,
    config: AnalyticsConfig,
    channel: ChannelConfig,
    service: String,
) -> TimemarkResult<()> {
    info!("Analytics worker for channel '{}' started.", channel.name);
    let paths = ChannelPaths::new(&config, &channel.name)?;
    let outputs = ChannelOutputs::new(&config.output_dir, &channel.name)?;
    let mut channel_state = state::load(&paths.state_file);
    let processor = FileProcessor::new(&channel);
    let started_at = unix_now();
    let poll = Duration::from_secs(config.poll_interval_secs.max(1));

    loop {
        let pending = match scan_archives(&paths.archive_dir, channel_state.last_processed.as_deref())
        {
            Ok(pending) => pending,
            Err(e) => {
                warn!(
                    "scanning {} failed: {e}",
                    paths.archive_dir.to_string_lossy()
                );
                Vec::new()
            }
        };

        for path in pending {
            if subsys.is_shutdown_requested() {
                break;
            }
            let mut attempt = 0;
            loop {
                attempt += 1;
                match processor.process(&path, &paths, &outputs, &mut channel_state) {
                    Ok(()) => break,
                    Err(e) if attempt < MAX_ATTEMPTS_PER_FILE => {
                        warn!(
                            "processing {} failed (attempt {attempt}): {e}, backing off",
                            path.to_string_lossy()
                        );
                        sleep(RETRY_BACKOFF * attempt).await;
                    }
                    Err(e) => {
                        // Leave the watermark untouched: the archive is
                        // never lost, the next poll retries it.
                        error!("giving up on {} for now: {e}", path.to_string_lossy());
                        break;
                    }
                }
            }
        }

        write_status(&paths.status_file, &service, &channel.name, started_at, &channel_state);

        select! {
            _ = sleep(poll) => {}
            _ = subsys.on_shutdown_requested() => break,
        }
    }

    write_status(&paths.status_file, &service, &channel.name, started_at, &channel_state);
    info!("Analytics worker for channel '{}' stopped.", channel.name);
    Ok(())
}

/// Archive files newer than the watermark, in name (timestamp) order.
fn scan_archives(archive_dir: &Path, last_processed: Option<&str>) -> TimemarkResult<Vec<PathBuf>> {
    let mut pending = Vec::new();
    let entries = match fs::read_dir(archive_dir) {
        Ok(entries) => entries,
        // The recorder may simply not have created the directory yet.
        Err(_) => return Ok(pending),
    };
    for entry in entries {
        let entry = entry?;
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        if !name.ends_with(ARCHIVE_SUFFIX) {
            continue;
        }
        if last_processed.is_some_and(|last| name <= last) {
            continue;
        }
        pending.push(entry.path());
    }
    pending.sort();
    Ok(pending)
}

/// Everything needed to process one archive, bundled so the hot path stays
/// testable without a runtime.
struct FileProcessor {
    channel: ChannelConfig,
    decimator: MinuteDecimator,
    matched_params: MatchedFilterParams,
}

impl FileProcessor {
    fn new(channel: &ChannelConfig) -> Self {
        Self {
            channel: channel.clone(),
            decimator: MinuteDecimator::new(channel.sample_rate),
            matched_params: MatchedFilterParams::default(),
        }
    }

    /// Processes one archive to completion: quality row, gap rows, tone
    /// rows, decimated product, then the state watermark. Corrupt files are
    /// quarantined and count as processed; transient errors bubble up for
    /// retry.
    fn process(
        &self,
        path: &Path,
        paths: &ChannelPaths,
        outputs: &ChannelOutputs,
        channel_state: &mut ChannelState,
    ) -> TimemarkResult<()> {
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| TimemarkError::Other("archive path has no file name".to_owned()))?
            .to_owned();

        let archive = match archive::read_archive(path) {
            Ok(archive) => archive,
            Err(e) if e.is_corrupt_file() => {
                warn!("quarantining corrupt archive {name}: {e}");
                quarantine(path, &paths.quarantine_dir)?;
                channel_state.quarantined += 1;
                channel_state.last_processed = Some(name);
                state::store(&paths.state_file, channel_state)?;
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };

        let snap = archive.meta.time_snap();
        let minute_utc = snap.utc_of(archive.meta.rtp_timestamp);

        outputs.append_quality(&quality::analyze(&archive.meta))?;
        outputs.append_gaps(&archive.meta)?;

        let analysis = analyze_minute(
            &archive.iq,
            archive.meta.sample_rate,
            &snap,
            archive.meta.rtp_timestamp,
            &self.channel.stations,
            &self.matched_params,
        );
        outputs.append_tones(minute_utc, &analysis.detections)?;
        channel_state.detections += analysis.detections.len() as u64;
        if let Some(refined) = refine_anchor(&snap, &analysis) {
            channel_state.note_anchor(refined);
        }

        let tick_freq_hz = if self.channel.stations.iter().any(|s| s.tone_freq_hz() == 1000.0) {
            1000.0
        } else {
            1200.0
        };
        let record = discrimination::analyze(
            &archive.iq,
            archive.meta.sample_rate,
            &snap,
            archive.meta.rtp_timestamp,
            tick_freq_hz,
        );
        outputs.append_discrimination(&record)?;

        let decimated = self.decimator.decimate(&archive.iq);
        outputs.write_decimated(&name, &archive.meta, decimated)?;

        channel_state.files_processed += 1;
        channel_state.last_processed = Some(name);
        state::store(&paths.state_file, channel_state)?;
        Ok(())
    }
}

/// A tone onset is a known whole-minute event; when one lands close enough
/// to a whole minute, the residual becomes an anchor refinement proposal
/// for downstream consumers.
fn refine_anchor(snap: &TimeSnap, analysis: &MinuteToneAnalysis) -> Option<TimeSnap> {
    let detection = analysis
        .detections
        .iter()
        .find(|d| d.use_for_time_snap)?;
    let minute = (detection.onset_utc / 60.0).round() * 60.0;
    if (detection.onset_utc - minute).abs() > REFINEMENT_TOLERANCE_SECS {
        return None;
    }
    // Shift the embedded anchor's UTC by the measured residual so the
    // onset lands exactly on the whole minute.
    let residual = detection.onset_utc - minute;
    Some(TimeSnap {
        rtp_timestamp: snap.rtp_timestamp,
        utc: snap.utc - residual,
        sample_rate: snap.sample_rate,
        source: TimeSource::ToneOnset,
        confidence: (detection.snr_db / 40.0).clamp(0.1, 0.95),
        station: Some(detection.station),
    })
}

fn quarantine(path: &Path, quarantine_dir: &Path) -> TimemarkResult<()> {
    fs::create_dir_all(quarantine_dir)?;
    let target = quarantine_dir.join(path.file_name().unwrap_or_default());
    fs::rename(path, &target)?;
    Ok(())
}

fn write_status(
    path: &Path,
    service: &str,
    channel: &str,
    started_at: f64,
    channel_state: &ChannelState,
) {
    let status = AnalyticsStatus {
        service: service.to_owned(),
        version: env!("CARGO_PKG_VERSION").to_owned(),
        pid: std::process::id(),
        channel: channel.to_owned(),
        started_at_unix: started_at,
        updated_at_unix: unix_now(),
        health: "ok".to_owned(),
        files_processed: channel_state.files_processed,
        quarantined: channel_state.quarantined,
        detections: channel_state.detections,
        last_processed: channel_state.last_processed.clone(),
        best_anchor: channel_state.best_anchor.as_ref().map(Into::into),
    };
    if let Err(e) = write_json_atomic(path, &status) {
        error!("writing analytics status {}: {e}", path.to_string_lossy());
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{
        archive::{ArchiveMeta, MinuteArchive},
        station::Station,
    };
    use num_complex::Complex;
    use std::io::Write as _;

    const SAMPLE_RATE: u32 = 3200;
    const MINUTE_UTC: f64 = 1_700_000_160.0;
    const FIRST_RTP: u32 = 1_000_000;

    fn channel() -> ChannelConfig {
        let mut channel = crate::config::test::test_channel(0x1234, "wwv10");
        channel.sample_rate = SAMPLE_RATE;
        channel.samples_per_packet = 320;
        channel.stations = vec![Station::Wwv, Station::Wwvh];
        channel
    }

    fn analytics_config(root: &Path) -> AnalyticsConfig {
        AnalyticsConfig {
            archive_dir: root.join("archives"),
            output_dir: root.join("derived"),
            state_dir: root.join("state"),
            poll_interval_secs: 1,
            status_interval_secs: 10,
            channels: vec![channel()],
        }
    }

    /// A clean anchored minute with a WWV minute mark 3 ms in.
    fn minute_archive() -> MinuteArchive {
        let n = SAMPLE_RATE as usize * 60;
        let iq: Vec<Complex<f32>> = (0..n)
            .map(|i| {
                let t = i as f64 / SAMPLE_RATE as f64;
                let audio = if t >= 0.003 && t < 0.803 {
                    0.5 * (2.0 * std::f64::consts::PI * 1000.0 * t).sin()
                } else {
                    0.0
                };
                Complex::from_polar(0.4 * (1.0 + 0.8 * audio as f32), -0.1)
            })
            .collect();
        let mut meta = crate::archive::test::test_meta(SAMPLE_RATE, n);
        meta.rtp_timestamp = FIRST_RTP;
        meta.time_snap_rtp = FIRST_RTP;
        meta.time_snap_utc = MINUTE_UTC;
        meta.packets_received = 600;
        meta.packets_expected = 600;
        MinuteArchive { meta, iq }
    }

    fn harness(root: &Path) -> (ChannelPaths, ChannelOutputs, FileProcessor, ChannelState) {
        let config = analytics_config(root);
        let channel = channel();
        let paths = ChannelPaths::new(&config, &channel.name).expect("paths");
        fs::create_dir_all(&paths.archive_dir).expect("archive dir");
        let outputs = ChannelOutputs::new(&config.output_dir, &channel.name).expect("outputs");
        (paths, outputs, FileProcessor::new(&channel), ChannelState::default())
    }

    #[test]
    fn processes_archive_end_to_end() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (paths, outputs, processor, mut channel_state) = harness(dir.path());

        let archive = minute_archive();
        let name = archive::archive_file_name(MINUTE_UTC, archive.meta.frequency_hz);
        let path = paths.archive_dir.join(&name);
        archive::write_archive(&path, &archive).expect("write");

        processor
            .process(&path, &paths, &outputs, &mut channel_state)
            .expect("process");

        assert_eq!(channel_state.files_processed, 1);
        assert_eq!(channel_state.last_processed.as_deref(), Some(name.as_str()));

        let quality = fs::read_to_string(dir.path().join("derived/wwv10/quality.csv")).expect("quality");
        assert_eq!(quality.lines().count(), 2);
        assert!(quality.lines().nth(1).expect("row").starts_with("2023-11-14T22:16:00Z,100.000"));

        let tones = fs::read_to_string(dir.path().join("derived/wwv10/tones.csv")).expect("tones");
        assert!(tones.contains("WWV,1000"));
        assert!(channel_state.detections >= 1);

        let discrimination =
            fs::read_to_string(dir.path().join("derived/wwv10/discrimination.csv")).expect("discrimination");
        assert_eq!(discrimination.lines().count(), 2);

        // The anchor refinement proposal is tone-derived.
        let best = channel_state.best_anchor.as_ref().expect("refined anchor");
        assert_eq!(best.source, TimeSource::ToneOnset);
        assert_eq!(best.station, Some(Station::Wwv));
        // The embedded archive anchor was already exact, so the residual
        // correction is tiny.
        assert!((best.utc - MINUTE_UTC).abs() < 0.005);

        let derived_name = name.replace("_iq.zip", "_iq_10hz.zip");
        let product = archive::read_archive(
            &dir.path().join("derived/wwv10/derived").join(derived_name),
        )
        .expect("decimated");
        assert_eq!(product.iq.len(), 600);
        assert_eq!(product.meta.sample_rate, 10);

        // State survives a restart.
        let reloaded = state::load(&paths.state_file);
        assert_eq!(reloaded, channel_state);
    }

    #[test]
    fn second_pass_is_idempotent() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (paths, outputs, processor, mut channel_state) = harness(dir.path());

        let archive = minute_archive();
        let name = archive::archive_file_name(MINUTE_UTC, archive.meta.frequency_hz);
        let path = paths.archive_dir.join(&name);
        archive::write_archive(&path, &archive).expect("write");
        processor
            .process(&path, &paths, &outputs, &mut channel_state)
            .expect("process");

        let quality_path = dir.path().join("derived/wwv10/quality.csv");
        let before = fs::read_to_string(&quality_path).expect("before");

        // A rescan with the stored watermark finds nothing new.
        let pending =
            scan_archives(&paths.archive_dir, channel_state.last_processed.as_deref()).expect("scan");
        assert!(pending.is_empty());
        assert_eq!(fs::read_to_string(&quality_path).expect("after"), before);
    }

    #[test]
    fn corrupt_archive_is_quarantined_not_fatal() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (paths, outputs, processor, mut channel_state) = harness(dir.path());

        let path = paths.archive_dir.join("19990101T000000Z_10000000_iq.zip");
        let mut file = fs::File::create(&path).expect("create");
        file.write_all(b"this is not a zip file").expect("write");
        drop(file);

        processor
            .process(&path, &paths, &outputs, &mut channel_state)
            .expect("quarantine path is not an error");

        assert_eq!(channel_state.quarantined, 1);
        assert_eq!(channel_state.files_processed, 0);
        assert!(!path.exists());
        assert!(
            paths
                .quarantine_dir
                .join("19990101T000000Z_10000000_iq.zip")
                .exists()
        );
    }

    #[test]
    fn scan_orders_by_name_and_respects_watermark() {
        let dir = tempfile::tempdir().expect("tempdir");
        let archive_dir = dir.path().join("archives");
        fs::create_dir_all(&archive_dir).expect("dir");
        for name in [
            "20231114T221800Z_10000000_iq.zip",
            "20231114T221600Z_10000000_iq.zip",
            "20231114T221700Z_10000000_iq.zip",
            "ignored.txt",
        ] {
            fs::File::create(archive_dir.join(name)).expect("touch");
        }

        let all = scan_archives(&archive_dir, None).expect("scan");
        let names: Vec<_> = all
            .iter()
            .filter_map(|p| p.file_name().and_then(|n| n.to_str()))
            .collect();
        assert_eq!(
            names,
            vec![
                "20231114T221600Z_10000000_iq.zip",
                "20231114T221700Z_10000000_iq.zip",
                "20231114T221800Z_10000000_iq.zip",
            ]
        );

        let newer = scan_archives(&archive_dir, Some("20231114T221700Z_10000000_iq.zip"))
            .expect("scan");
        assert_eq!(newer.len(), 1);
    }
}
