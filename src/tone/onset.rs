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

//! Startup tone-onset detection.
//!
//! Given the startup buffer (a contiguous span covering at least two minute
//! marks), locates the rising edge of one clean minute-mark tone with
//! sub-sample precision so the channel's timing anchor can be established.
//!
//! The band limiting uses zero-phase (centered) filtering, so the maximum
//! positive envelope derivative falls exactly on the tone's rising edge
//! rather than being skewed by the filter's rise time.

use crate::{
    dsp::{self, fir, hilbert},
    station::Station,
};
use num_complex::Complex;
use tracing::{debug, info};

pub struct OnsetParams {
    pub min_snr_db: f32,
    /// Candidates this close to the buffer edges are ignored.
    pub edge_guard_secs: f64,
    /// How many derivative peaks to try before giving up.
    pub max_candidates: usize,
}

impl Default for OnsetParams {
    fn default() -> Self {
        Self {
            min_snr_db: 3.0,
            edge_guard_secs: 1.5,
            max_candidates: 8,
        }
    }
}

/// A validated minute-mark rising edge.
#[derive(Debug, Clone, PartialEq)]
pub struct MinuteMarkOnset {
    pub station: Station,
    /// Fractional sample index of the rising edge within the buffer.
    pub onset_index: f64,
    pub snr_db: f32,
}

/// Searches the buffer for the strongest validated minute-mark rising edge.
///
/// Only stations usable as a time reference are considered; a WWVH-only
/// channel falls back to NTP or wall clock for its anchor.
pub fn detect_minute_mark(
    iq: &[Complex<f32>],
    sample_rate: u32,
    stations: &[Station],
    params: &OnsetParams,
) -> Option<MinuteMarkOnset> {
    let candidates: Vec<Station> = stations
        .iter()
        .copied()
        .filter(Station::use_for_time_snap)
        .collect();
    if candidates.is_empty() || iq.len() < sample_rate as usize * 4 {
        return None;
    }

    let audio = dsp::am_audio(iq);

    let mut best: Option<MinuteMarkOnset> = None;
    let mut freqs: Vec<f32> = candidates.iter().map(|s| s.tone_freq_hz()).collect();
    freqs.sort_by(f32::total_cmp);
    freqs.dedup();

    for freq in freqs {
        let stations_at_freq: Vec<Station> = candidates
            .iter()
            .copied()
            .filter(|s| s.tone_freq_hz() == freq)
            .collect();
        if let Some(onset) = detect_at_freq(&audio, sample_rate, freq, &stations_at_freq, params)
            && best.as_ref().is_none_or(|b| onset.snr_db > b.snr_db)
        {
            best = Some(onset);
        }
    }

    if let Some(onset) = &best {
        info!(
            "minute mark from {} at sample {:.1} ({:.1} dB SNR)",
            onset.station, onset.onset_index, onset.snr_db
        );
    } else {
        debug!("no valid minute-mark onset in startup buffer");
    }
    best
}

fn detect_at_freq(
    audio: &[f32],
    sample_rate: u32,
    freq: f32,
    stations: &[Station],
    params: &OnsetParams,
) -> Option<MinuteMarkOnset> {
    let fs = sample_rate as f64;
    let half_width = 50.0;
    let kernel = fir::design_bandpass(
        fir::kaiser_taps(60.0, half_width / fs),
        (freq as f64 - half_width) / fs,
        (freq as f64 + half_width) / fs,
        fir::kaiser_beta(60.0),
    );
    let filtered = fir::filter_centered_real(audio, &kernel);
    let envelope_full = hilbert::envelope(&filtered);

    // The envelope is band limited to ~100 Hz, so it can be strided down
    // without losing edge information.
    let decim = ((sample_rate / 1600).max(1)) as usize;
    let envelope: Vec<f32> = envelope_full.iter().step_by(decim).copied().collect();
    let env_rate = fs / decim as f64;

    let mut derivative = vec![0.0f32; envelope.len()];
    for i in 1..envelope.len().saturating_sub(1) {
        derivative[i] = (envelope[i + 1] - envelope[i - 1]) / 2.0;
    }

    let guard = (params.edge_guard_secs * env_rate) as usize;
    if envelope.len() <= 2 * guard {
        return None;
    }

    let mut masked = vec![false; derivative.len()];
    for _ in 0..params.max_candidates {
        let peak = derivative
            .iter()
            .enumerate()
            .take(derivative.len() - guard)
            .skip(guard)
            .filter(|(i, _)| !masked[*i])
            .max_by(|a, b| a.1.total_cmp(b.1))
            .map(|(i, _)| i)?;
        if derivative[peak] <= 0.0 {
            return None;
        }

        for station in stations {
            if let Some(snr_db) = validate(
                &envelope,
                env_rate,
                peak,
                station.tone_duration_secs() as f64,
                params.min_snr_db,
            ) {
                let offset =
                    dsp::parabolic_peak_offset(derivative[peak - 1], derivative[peak], derivative[peak + 1]);
                return Some(MinuteMarkOnset {
                    station: *station,
                    onset_index: (peak as f64 + offset) * decim as f64,
                    snr_db,
                });
            }
        }

        // Not a tone (second ticks and static produce sharp edges too);
        // mask a second around it and try the next strongest edge.
        let mask_halfwidth = env_rate as usize;
        let from = peak.saturating_sub(mask_halfwidth);
        let to = (peak + mask_halfwidth).min(masked.len());
        for flag in &mut masked[from..to] {
            *flag = true;
        }
    }

    None
}

/// Checks that the envelope around a candidate edge looks like the
/// station's minute-mark tone: sufficient SNR over the preceding noise,
/// elevated for the tone's duration, released afterwards. Returns the SNR.
fn validate(
    envelope: &[f32],
    env_rate: f64,
    peak: usize,
    duration_secs: f64,
    min_snr_db: f32,
) -> Option<f32> {
    let at = |secs: f64| -> i64 { peak as i64 + (secs * env_rate) as i64 };
    let span = |from: f64, to: f64| -> Option<&[f32]> {
        let (a, b) = (at(from), at(to));
        if a < 0 || b as usize > envelope.len() || a >= b {
            None
        } else {
            Some(&envelope[a as usize..b as usize])
        }
    };

    let tone = dsp::median(span(0.1 * duration_secs, 0.9 * duration_secs)?);
    let noise = dsp::median(span(-1.1, -0.1)?).max(1e-9);
    let snr_db = 20.0 * (tone / noise).log10();
    if snr_db < min_snr_db {
        return None;
    }

    let half = noise + 0.5 * (tone - noise);

    let sustain_span = span(0.0, duration_secs)?;
    let sustained = sustain_span.iter().filter(|&&v| v >= half).count();
    if (sustained as f64) < 0.8 * sustain_span.len() as f64 {
        return None;
    }

    let release = dsp::median(span(duration_secs + 0.1, duration_secs + 0.3)?);
    if release >= half {
        return None;
    }

    Some(snr_db)
}
