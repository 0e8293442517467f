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

//! Per-minute station discrimination metrics beyond the minute mark.
//!
//! Two discriminants are extracted from each archived minute:
//!
//! - **Second ticks**: the short (5 ms) tick transmitted at the top of
//!   every second. Their count and timing spread tell propagation
//!   conditions apart from plain carrier noise.
//! - **BCD subcarrier**: the 100 Hz time-code subcarrier. Its SNR and the
//!   correlation of its envelope with the 0.8 s position-marker comb
//!   (markers in the seconds ending in 9) separate a real time-code
//!   broadcast from an unmodulated carrier on the same frequency.

use crate::{
    dsp::{self, fir},
    timing::TimeSnap,
    tone::matched::{decimate_real, sliding_tone_magnitude},
};
use num_complex::Complex;

/// Processing rate for tick and subcarrier correlation.
const PROCESSING_RATE: u32 = 3200;

const TICK_DURATION_SECS: f64 = 0.005;
/// Ticks are searched inside this window around each whole second.
const TICK_SEARCH_SECS: f64 = 0.1;
/// Peak-over-local-median ratio for a tick to count as detected.
const TICK_THRESHOLD: f32 = 3.0;

const SUBCARRIER_FREQ_HZ: f64 = 100.0;
const SUBCARRIER_WINDOW_SECS: f64 = 0.2;
/// Seconds whose BCD symbol is a 0.8 s position marker.
const MARKER_SECONDS: [usize; 6] = [9, 19, 29, 39, 49, 59];

#[derive(Debug, Clone, PartialEq)]
pub struct DiscriminationRecord {
    pub utc_minute: f64,
    /// Second ticks detected out of the 59 expected (the minute mark
    /// replaces the tick at second 0).
    pub ticks_detected: u32,
    pub median_tick_offset_ms: f64,
    /// 100 Hz time-code subcarrier level over the noise floor.
    pub subcarrier_snr_db: f32,
    /// Correlation of the subcarrier envelope with the position-marker
    /// comb, in [-1, 1]; near zero for an unmodulated carrier.
    pub marker_correlation: f32,
}

/// Analyzes one archived minute. `tick_freq_hz` is the tick tone of the
/// station family expected on this channel (1000 Hz for WWV/CHU, 1200 Hz
/// for WWVH).
pub fn analyze(
    iq: &[Complex<f32>],
    sample_rate: u32,
    snap: &TimeSnap,
    first_rtp: u32,
    tick_freq_hz: f64,
) -> DiscriminationRecord {
    let audio = dsp::am_audio(iq);
    let factor = (sample_rate / PROCESSING_RATE).max(1) as usize;
    let proc_rate = sample_rate as f64 / factor as f64;

    let downsampled: Vec<f32> = if factor == 1 {
        audio
    } else {
        let kernel = fir::design_lowpass(
            fir::kaiser_taps(60.0, 200.0 / sample_rate as f64),
            1400.0 / sample_rate as f64,
            fir::kaiser_beta(60.0),
        );
        decimate_real(&audio, &kernel, factor)
    };

    let (ticks_detected, median_tick_offset_ms) = second_ticks(&downsampled, proc_rate, tick_freq_hz);
    let (subcarrier_snr_db, marker_correlation) = bcd_subcarrier(&downsampled, proc_rate);

    DiscriminationRecord {
        utc_minute: snap.utc_of(first_rtp),
        ticks_detected,
        median_tick_offset_ms,
        subcarrier_snr_db,
        marker_correlation,
    }
}

/// Looks for the 5 ms tick near the top of each second 1..=59.
fn second_ticks(audio: &[f32], proc_rate: f64, tick_freq_hz: f64) -> (u32, f64) {
    let template_len = ((TICK_DURATION_SECS * proc_rate) as usize).max(4);
    if audio.len() <= template_len + 2 {
        return (0, 0.0);
    }
    let magnitudes = sliding_tone_magnitude(audio, proc_rate, tick_freq_hz, template_len);
    let search = (TICK_SEARCH_SECS * proc_rate) as usize;

    let mut offsets_ms = Vec::new();
    for second in 1..=59usize {
        let expected = (second as f64 * proc_rate) as usize;
        let from = expected.saturating_sub(search);
        let to = (expected + search).min(magnitudes.len());
        if from >= to {
            break;
        }
        let window = &magnitudes[from..to];
        let Some((peak_index, &peak)) = window
            .iter()
            .enumerate()
            .max_by(|a, b| a.1.total_cmp(b.1))
        else {
            continue;
        };
        let floor = dsp::median(window).max(1e-9);
        if peak >= TICK_THRESHOLD * floor {
            let offset_samples = (from + peak_index) as f64 - expected as f64;
            offsets_ms.push((offset_samples / proc_rate * 1000.0) as f32);
        }
    }

    let median_offset = dsp::median(&offsets_ms) as f64;
    (offsets_ms.len() as u32, median_offset)
}

/// Measures the 100 Hz subcarrier envelope and correlates it with the
/// position-marker comb.
fn bcd_subcarrier(audio: &[f32], proc_rate: f64) -> (f32, f32) {
    let window_len = ((SUBCARRIER_WINDOW_SECS * proc_rate) as usize).max(8);
    if audio.len() <= window_len + 2 {
        return (0.0, 0.0);
    }
    let envelope = sliding_tone_magnitude(audio, proc_rate, SUBCARRIER_FREQ_HZ, window_len);

    let median = dsp::median(&envelope).max(1e-9);
    let peak = envelope.iter().copied().fold(0.0f32, f32::max);
    let snr_db = 20.0 * (peak / median).log10();

    // Marker comb: envelope samples inside the 0.8 s marker slots of the
    // seconds ending in 9 versus everything else.
    let mut marker_sum = 0.0f64;
    let mut marker_count = 0usize;
    let mut rest_sum = 0.0f64;
    let mut rest_count = 0usize;
    for (i, &value) in envelope.iter().enumerate() {
        let t = i as f64 / proc_rate;
        let second = t.floor() as usize;
        let in_marker = MARKER_SECONDS.contains(&second) && (t - t.floor()) < 0.8;
        if in_marker {
            marker_sum += value as f64;
            marker_count += 1;
        } else {
            rest_sum += value as f64;
            rest_count += 1;
        }
    }
    if marker_count == 0 || rest_count == 0 {
        return (snr_db, 0.0);
    }
    let marker_mean = marker_sum / marker_count as f64;
    let rest_mean = rest_sum / rest_count as f64;
    let correlation = ((marker_mean - rest_mean) / (marker_mean + rest_mean).max(1e-9)) as f32;

    (snr_db, correlation.clamp(-1.0, 1.0))
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{station::Station, timing::TimeSource};

    const SAMPLE_RATE: u32 = 3200;
    const MINUTE_UTC: f64 = 1_700_000_160.0;

    fn snap() -> TimeSnap {
        TimeSnap {
            rtp_timestamp: 0,
            utc: MINUTE_UTC,
            sample_rate: SAMPLE_RATE,
            source: TimeSource::ToneOnset,
            confidence: 0.9,
            station: Some(Station::Wwv),
        }
    }

    /// A minute with 5 ms ticks on every second, plus optional 100 Hz
    /// bursts in the position-marker slots.
    fn minute(ticks: bool, markers: bool) -> Vec<Complex<f32>> {
        let n = SAMPLE_RATE as usize * 60;
        (0..n)
            .map(|i| {
                let t = i as f64 / SAMPLE_RATE as f64;
                let in_second = t - t.floor();
                let second = t.floor() as usize;
                let mut audio = 0.0;
                if ticks && second >= 1 && in_second < TICK_DURATION_SECS {
                    audio += 0.5 * (2.0 * std::f64::consts::PI * 1000.0 * t).sin();
                }
                if markers && MARKER_SECONDS.contains(&second) && in_second < 0.8 {
                    audio += 0.3 * (2.0 * std::f64::consts::PI * 100.0 * t).sin();
                }
                Complex::from_polar(0.4 * (1.0 + 0.8 * audio as f32), 0.2)
            })
            .collect()
    }

    #[test]
    fn counts_second_ticks_on_a_clean_minute() {
        let iq = minute(true, false);
        let record = analyze(&iq, SAMPLE_RATE, &snap(), 0, 1000.0);
        assert_eq!(record.utc_minute, MINUTE_UTC);
        assert!(record.ticks_detected >= 55, "{} ticks", record.ticks_detected);
        assert!(record.median_tick_offset_ms.abs() < 5.0);
    }

    #[test]
    fn quiet_minute_yields_no_ticks() {
        let iq = minute(false, false);
        let record = analyze(&iq, SAMPLE_RATE, &snap(), 0, 1000.0);
        assert_eq!(record.ticks_detected, 0);
    }

    #[test]
    fn marker_comb_lights_up_with_subcarrier() {
        let with = analyze(&minute(false, true), SAMPLE_RATE, &snap(), 0, 1000.0);
        let without = analyze(&minute(false, false), SAMPLE_RATE, &snap(), 0, 1000.0);
        assert!(with.marker_correlation > 0.5, "{}", with.marker_correlation);
        assert!(with.subcarrier_snr_db > 10.0);
        assert!(without.marker_correlation.abs() < 0.2);
    }
}
