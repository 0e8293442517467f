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

//! Full-buffer matched-filter tone detection.
//!
//! Classifies WWV / WWVH / CHU minute marks in a complete archived minute
//! using phase-invariant quadrature matched filters, one per expected
//! (frequency, duration) pair. The correlator is a sliding complex DFT bin,
//! recomputed from scratch periodically to bound floating point drift.

use crate::{
    dsp::{self, fir},
    station::Station,
    timing::TimeSnap,
    tone::ToneDetection,
};
use num_complex::Complex;
use tracing::{debug, warn};

pub struct MatchedFilterParams {
    /// Rate the minute is downsampled to before correlation.
    pub processing_rate: u32,
    /// Detections below this margin over the noise floor are discarded.
    pub threshold_db: f32,
    /// WWV/WWVH differential delays beyond this are detection errors.
    pub max_differential_delay_secs: f64,
    /// Window (seconds into the minute) used for the noise floor estimate,
    /// past the minute mark itself.
    pub quiet_window_secs: (f64, f64),
}

impl Default for MatchedFilterParams {
    fn default() -> Self {
        Self {
            processing_rate: 3200,
            threshold_db: 6.0,
            max_differential_delay_secs: 1.0,
            quiet_window_secs: (5.0, 15.0),
        }
    }
}

/// Tone analysis of one archived minute. `detections` is sorted by SNR,
/// best first; an empty list is a normal outcome, not an error.
#[derive(Debug, Clone, PartialEq)]
pub struct MinuteToneAnalysis {
    pub detections: Vec<ToneDetection>,
    /// WWVH onset minus WWV onset when both were detected, in milliseconds.
    pub differential_delay_ms: Option<f64>,
}

struct Candidate {
    station: Station,
    onset_offset_secs: f64,
    snr_db: f32,
    amplitude: f32,
}

/// Runs matched-filter detection over a full minute of IQ samples.
/// `first_rtp` is the RTP timestamp of `iq[0]`; onsets are reported in UTC
/// via the archive's embedded anchor.
pub fn analyze_minute(
    iq: &[Complex<f32>],
    sample_rate: u32,
    snap: &TimeSnap,
    first_rtp: u32,
    stations: &[Station],
    params: &MatchedFilterParams,
) -> MinuteToneAnalysis {
    let audio = dsp::am_audio(iq);
    let factor = (sample_rate / params.processing_rate).max(1) as usize;
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

    let mut candidates: Vec<Candidate> = stations
        .iter()
        .filter_map(|&station| correlate_station(&downsampled, proc_rate, station, params))
        .collect();

    disambiguate_same_tone(&mut candidates);
    candidates.sort_by(|a, b| b.snr_db.total_cmp(&a.snr_db));

    let differential_delay_ms = differential_delay(&mut candidates, params);

    let base_utc = snap.utc_of(first_rtp);
    let detections = candidates
        .into_iter()
        .map(|c| ToneDetection {
            station: c.station,
            freq_hz: c.station.tone_freq_hz(),
            onset_utc: base_utc + c.onset_offset_secs,
            snr_db: c.snr_db,
            use_for_time_snap: c.station.use_for_time_snap(),
        })
        .collect();

    MinuteToneAnalysis {
        detections,
        differential_delay_ms,
    }
}

pub(crate) fn decimate_real(audio: &[f32], kernel: &[f32], factor: usize) -> Vec<f32> {
    let center = kernel.len() / 2;
    (0..audio.len().div_ceil(factor))
        .map(|k| {
            let i = (k * factor) as i64;
            let mut acc = 0.0f64;
            for (j, tap) in kernel.iter().enumerate() {
                let index = i + j as i64 - center as i64;
                if index >= 0 && (index as usize) < audio.len() {
                    acc += *tap as f64 * audio[index as usize] as f64;
                }
            }
            acc as f32
        })
        .collect()
}

/// Quadrature matched filter for one station's (frequency, duration) pair.
fn correlate_station(
    audio: &[f32],
    proc_rate: f64,
    station: Station,
    params: &MatchedFilterParams,
) -> Option<Candidate> {
    let template_len = (station.tone_duration_secs() as f64 * proc_rate) as usize;
    if audio.len() <= template_len + 2 {
        return None;
    }
    let magnitudes = sliding_tone_magnitude(audio, proc_rate, station.tone_freq_hz() as f64, template_len);

    let quiet_from = ((params.quiet_window_secs.0 * proc_rate) as usize).min(magnitudes.len());
    let quiet_to = ((params.quiet_window_secs.1 * proc_rate) as usize).min(magnitudes.len());
    if quiet_to <= quiet_from {
        return None;
    }
    let noise_floor = dsp::median(&magnitudes[quiet_from..quiet_to]).max(1e-9);

    let peak = magnitudes
        .iter()
        .enumerate()
        .max_by(|a, b| a.1.total_cmp(b.1))
        .map(|(i, _)| i)?;
    let snr_db = 20.0 * (magnitudes[peak] / noise_floor).log10();
    if snr_db < params.threshold_db {
        debug!("{station}: best correlation {snr_db:.1} dB below threshold");
        return None;
    }

    let offset = if peak > 0 && peak + 1 < magnitudes.len() {
        dsp::parabolic_peak_offset(magnitudes[peak - 1], magnitudes[peak], magnitudes[peak + 1])
    } else {
        0.0
    };

    Some(Candidate {
        station,
        onset_offset_secs: (peak as f64 + offset) / proc_rate,
        snr_db,
        amplitude: magnitudes[peak],
    })
}

/// Magnitude of a sliding window correlation against `e^{-j w k}`, scaled
/// to estimate the tone amplitude. O(n) via the sliding DFT recurrence
/// `c[n+1] = e^{jw} (c[n] - x[n] + x[n+L] e^{-jwL})`, with a periodic exact
/// recompute to keep rounding drift negligible.
pub(crate) fn sliding_tone_magnitude(
    audio: &[f32],
    proc_rate: f64,
    freq_hz: f64,
    template_len: usize,
) -> Vec<f32> {
    let omega = 2.0 * std::f64::consts::PI * freq_hz / proc_rate;
    let rotate = Complex::new(omega.cos(), omega.sin());
    let tail_phase = Complex::from_polar(1.0, -omega * template_len as f64);
    let output_len = audio.len() - template_len;
    let scale = 2.0 / template_len as f64;

    let direct = |n: usize| -> Complex<f64> {
        let mut acc = Complex::new(0.0, 0.0);
        for k in 0..template_len {
            acc += audio[n + k] as f64 * Complex::from_polar(1.0, -omega * k as f64);
        }
        acc
    };

    let mut magnitudes = Vec::with_capacity(output_len);
    let mut correlation = direct(0);
    for n in 0..output_len {
        if n > 0 {
            if n % 16384 == 0 {
                correlation = direct(n);
            } else {
                correlation = rotate
                    * (correlation - audio[n - 1] as f64
                        + audio[n - 1 + template_len] as f64 * tail_phase);
            }
        }
        magnitudes.push((correlation.norm() * scale) as f32);
    }
    magnitudes
}

/// WWV and CHU share the 1000 Hz tone; a real 0.8 s WWV tone fully overlaps
/// the shorter CHU template, so near-coincident onsets with comparable
/// amplitude mean WWV, while a clearly stronger short-template response
/// means the tone really was 0.5 s.
fn disambiguate_same_tone(candidates: &mut Vec<Candidate>) {
    let wwv = candidates.iter().position(|c| c.station == Station::Wwv);
    let chu = candidates.iter().position(|c| c.station == Station::Chu);
    if let (Some(wwv), Some(chu)) = (wwv, chu) {
        // The short template's peak sits on a plateau when the tone is
        // actually 0.8 s, so allow the onsets to disagree by up to the
        // duration difference.
        let close = (candidates[wwv].onset_offset_secs - candidates[chu].onset_offset_secs).abs() < 0.5;
        if close {
            let drop = if candidates[wwv].amplitude >= 0.9 * candidates[chu].amplitude {
                chu
            } else {
                wwv
            };
            candidates.remove(drop);
        }
    }
}

/// Differential WWVH - WWV delay; beyond the plausibility limit the weaker
/// detection is discarded as a detection error.
fn differential_delay(candidates: &mut Vec<Candidate>, params: &MatchedFilterParams) -> Option<f64> {
    let wwv = candidates.iter().position(|c| c.station == Station::Wwv)?;
    let wwvh = candidates.iter().position(|c| c.station == Station::Wwvh)?;
    let delay_secs = candidates[wwvh].onset_offset_secs - candidates[wwv].onset_offset_secs;
    if delay_secs.abs() > params.max_differential_delay_secs {
        let drop = if candidates[wwv].snr_db >= candidates[wwvh].snr_db {
            wwvh
        } else {
            wwv
        };
        warn!(
            "implausible WWVH-WWV differential delay {:.3} s, discarding {}",
            delay_secs, candidates[drop].station
        );
        candidates.remove(drop);
        return None;
    }
    Some(delay_secs * 1000.0)
}
