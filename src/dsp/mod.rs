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

//! Signal processing shared by the tone detectors and the decimator.

pub mod decimate;
pub mod fir;
pub mod hilbert;

use num_complex::Complex;

/// AM demodulation: the magnitude of the IQ signal with the carrier (DC)
/// component removed. The time-standard stations amplitude-modulate their
/// tones onto the carrier, so the audio lives in the envelope.
pub fn am_audio(iq: &[Complex<f32>]) -> Vec<f32> {
    let mut audio: Vec<f32> = iq.iter().map(|s| s.norm()).collect();
    let mean = audio.iter().sum::<f32>() / audio.len().max(1) as f32;
    for sample in &mut audio {
        *sample -= mean;
    }
    audio
}

/// Median of a slice, NaN-free input assumed. Returns 0 for empty input.
pub fn median(values: &[f32]) -> f32 {
    if values.is_empty() {
        return 0.0;
    }
    let mut sorted = values.to_vec();
    let mid = sorted.len() / 2;
    let (_, value, _) = sorted.select_nth_unstable_by(mid, |a, b| a.total_cmp(b));
    *value
}

/// Median absolute deviation around `center`.
pub fn median_abs_deviation(values: &[f32], center: f32) -> f32 {
    let deviations: Vec<f32> = values.iter().map(|v| (v - center).abs()).collect();
    median(&deviations)
}

/// Sub-sample peak offset in [-0.5, 0.5] from a parabola through three
/// points straddling the maximum.
pub fn parabolic_peak_offset(left: f32, peak: f32, right: f32) -> f64 {
    let denominator = (left - 2.0 * peak + right) as f64;
    if denominator.abs() < 1e-12 {
        return 0.0;
    }
    (0.5 * (left - right) as f64 / denominator).clamp(-0.5, 0.5)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn am_audio_extracts_envelope_modulation() {
        // Constant-phase carrier with a small magnitude wobble.
        let iq: Vec<Complex<f32>> = (0..1000)
            .map(|i| {
                let magnitude = 0.5 + 0.1 * (i as f32 * 0.1).sin();
                Complex::from_polar(magnitude, 0.7)
            })
            .collect();
        let audio = am_audio(&iq);
        // DC is gone, the wobble survives.
        let mean: f32 = audio.iter().sum::<f32>() / audio.len() as f32;
        assert!(mean.abs() < 1e-3);
        let max = audio.iter().cloned().fold(f32::MIN, f32::max);
        assert!((max - 0.1).abs() < 0.01);
    }

    #[test]
    fn median_and_mad() {
        let values = [1.0, 9.0, 2.0, 4.0, 100.0];
        let med = median(&values);
        assert_eq!(med, 4.0);
        assert_eq!(median_abs_deviation(&values, med), 3.0);
    }

    #[test]
    fn parabolic_offset_recovers_shifted_peak() {
        // Samples of a parabola with its true peak at +0.25.
        let f = |x: f32| -(x - 0.25) * (x - 0.25);
        let offset = parabolic_peak_offset(f(-1.0), f(0.0), f(1.0));
        assert!((offset - 0.25).abs() < 1e-6);
    }
}
