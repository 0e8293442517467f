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

//! Three-stage decimation from the capture rate down to the 10 Hz science
//! product.
//!
//! 1. Moving-average cascade (CIC equivalent) decimating to 400 Hz. Its
//!    nulls sit on the alias bands, so everything that could fold into the
//!    0..6 Hz band is pushed far below -90 dB.
//! 2. A 3-tap droop compensator at 400 Hz that flattens the cascade's
//!    passband to well under 0.1 dB over 0..5 Hz.
//! 3. A sharp Kaiser lowpass (pass 5 Hz, stop 6 Hz, 100 dB design target)
//!    decimating 400 Hz to 10 Hz.
//!
//! Every kernel is symmetric and applied centered, so the first output
//! sample corresponds to the same UTC as the first input sample and phase
//! continuity is preserved.

use crate::dsp::fir::{decimate_centered, design_lowpass, filter_centered, kaiser_beta, kaiser_taps};
use num_complex::Complex;

pub const OUTPUT_RATE: u32 = 10;

const INTERMEDIATE_RATE: u32 = 400;
const CASCADE_STAGES: usize = 4;
const STAGE3_ATTENUATION_DB: f64 = 100.0;
const PASSBAND_EDGE_HZ: f64 = 5.0;
const STOPBAND_EDGE_HZ: f64 = 6.0;

/// Decimates whole minutes of IQ from the capture rate to 10 Hz.
pub struct MinuteDecimator {
    cascade_kernel: Vec<f32>,
    compensator: [f32; 3],
    stage3_kernel: Vec<f32>,
    stage1_factor: usize,
    stage3_factor: usize,
}

impl MinuteDecimator {
    /// `input_rate` must be a multiple of 400 Hz (16 kHz for radiod IQ).
    pub fn new(input_rate: u32) -> Self {
        debug_assert!(input_rate % INTERMEDIATE_RATE == 0);
        let stage1_factor = (input_rate / INTERMEDIATE_RATE).max(1) as usize;
        let stage3_factor = (INTERMEDIATE_RATE / OUTPUT_RATE) as usize;

        let cascade_kernel = boxcar_cascade(stage1_factor, CASCADE_STAGES);

        // First-order droop cancellation for the moving-average cascade.
        // Four cascaded length-M boxcars droop by (M^2-1) w^2 / (6 M^2) at
        // the 400 Hz rate; 1 + a (1 - cos w) cancels the w^2 term with
        // a = (M^2-1) / (3 M^2).
        let m = stage1_factor as f64;
        let a = ((m * m - 1.0) / (3.0 * m * m)) as f32;
        let compensator = [-a / 2.0, 1.0 + a, -a / 2.0];

        let stage3_kernel = design_lowpass(
            kaiser_taps(
                STAGE3_ATTENUATION_DB,
                (STOPBAND_EDGE_HZ - PASSBAND_EDGE_HZ) / INTERMEDIATE_RATE as f64,
            ),
            (PASSBAND_EDGE_HZ + STOPBAND_EDGE_HZ) / 2.0 / INTERMEDIATE_RATE as f64,
            kaiser_beta(STAGE3_ATTENUATION_DB),
        );

        Self {
            cascade_kernel,
            compensator,
            stage3_kernel,
            stage1_factor,
            stage3_factor,
        }
    }

    /// A 60 s minute at 16 kHz (960,000 samples) produces exactly 600
    /// samples at 10 Hz.
    pub fn decimate(&self, iq: &[Complex<f32>]) -> Vec<Complex<f32>> {
        let intermediate = decimate_centered(iq, &self.cascade_kernel, self.stage1_factor);
        let flattened = filter_centered(&intermediate, &self.compensator);
        decimate_centered(&flattened, &self.stage3_kernel, self.stage3_factor)
    }
}

/// Convolution of `stages` boxcars of length `m`, unity DC gain. The
/// resulting kernel has length `stages * (m - 1) + 1`, odd whenever
/// `stages * (m - 1)` is even, so the 4-stage cascade has an integer center.
fn boxcar_cascade(m: usize, stages: usize) -> Vec<f32> {
    let mut kernel = vec![1.0f64 / m as f64; m];
    for _ in 1..stages {
        let mut next = vec![0.0f64; kernel.len() + m - 1];
        for (i, &a) in kernel.iter().enumerate() {
            for j in 0..m {
                next[i + j] += a / m as f64;
            }
        }
        kernel = next;
    }
    kernel.into_iter().map(|t| t as f32).collect()
}

#[cfg(test)]
mod test {
    use super::*;

    const INPUT_RATE: u32 = 16_000;
    const MINUTE: usize = 960_000;

    fn tone(freq_hz: f64, len: usize) -> Vec<Complex<f32>> {
        (0..len)
            .map(|n| {
                let phase = 2.0 * std::f64::consts::PI * freq_hz * n as f64 / INPUT_RATE as f64;
                Complex::new(phase.cos() as f32, phase.sin() as f32)
            })
            .collect()
    }

    #[test]
    fn minute_decimates_to_exactly_600_samples() {
        let decimator = MinuteDecimator::new(INPUT_RATE);
        let input = vec![Complex::new(0.5, -0.5); MINUTE];
        let output = decimator.decimate(&input);
        assert_eq!(output.len(), 600);
    }

    #[test]
    fn dc_gain_is_unity() {
        let decimator = MinuteDecimator::new(INPUT_RATE);
        let input = vec![Complex::new(0.8, -0.2); MINUTE];
        let output = decimator.decimate(&input);
        for sample in &output[50..550] {
            assert!((sample.re - 0.8).abs() < 1e-3);
            assert!((sample.im + 0.2).abs() < 1e-3);
        }
    }

    #[test]
    fn passband_is_flat_within_a_tenth_of_a_db() {
        let decimator = MinuteDecimator::new(INPUT_RATE);
        for freq in [1.0, 2.0, 4.0, 5.0] {
            let output = decimator.decimate(&tone(freq, MINUTE));
            for sample in &output[100..500] {
                let gain = sample.norm();
                assert!(
                    (gain - 1.0).abs() < 0.0116,
                    "{freq} Hz gain {gain} outside 0.1 dB"
                );
            }
        }
    }

    #[test]
    fn stopband_rejection_exceeds_90_db() {
        let decimator = MinuteDecimator::new(INPUT_RATE);
        for freq in [8.0, 25.0, 120.0] {
            let output = decimator.decimate(&tone(freq, MINUTE));
            let max = output[100..500]
                .iter()
                .map(|s| s.norm())
                .fold(0.0f32, f32::max);
            assert!(max < 3.2e-5, "{freq} Hz leaks {max}");
        }
    }

    #[test]
    fn output_timing_matches_input_timing() {
        // A 1 Hz passband tone starts at phase zero on the first input
        // sample; thirty seconds in (output sample 300) the phase must be
        // back at zero. Any uncompensated group delay would show here.
        let decimator = MinuteDecimator::new(INPUT_RATE);
        let output = decimator.decimate(&tone(1.0, MINUTE));
        let sample = output[300];
        assert!(sample.norm() > 0.98);
        assert!(sample.arg().abs() < 0.02, "phase {}", sample.arg());
    }

    #[test]
    fn cascade_kernel_is_symmetric_and_normalized() {
        let kernel = boxcar_cascade(40, 4);
        assert_eq!(kernel.len(), 4 * 40 - 3);
        let sum: f64 = kernel.iter().map(|&t| t as f64).sum();
        assert!((sum - 1.0).abs() < 1e-6);
        for i in 0..kernel.len() / 2 {
            assert!((kernel[i] - kernel[kernel.len() - 1 - i]).abs() < 1e-9);
        }
    }
}
