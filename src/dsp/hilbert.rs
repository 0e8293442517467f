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

//! Analytic signal via FFT.

use num_complex::Complex;
use rustfft::FftPlanner;

/// Computes the analytic signal of a real input: negative frequencies are
/// zeroed, positive ones doubled, DC and Nyquist kept. The magnitude of the
/// result is the instantaneous envelope.
pub fn analytic(input: &[f32]) -> Vec<Complex<f32>> {
    let n = input.len();
    if n == 0 {
        return Vec::new();
    }

    let mut planner = FftPlanner::new();
    let forward = planner.plan_fft_forward(n);
    let inverse = planner.plan_fft_inverse(n);

    let mut spectrum: Vec<Complex<f32>> =
        input.iter().map(|&v| Complex::new(v, 0.0)).collect();
    forward.process(&mut spectrum);

    let half = n / 2;
    for (k, bin) in spectrum.iter_mut().enumerate() {
        if k == 0 || (n % 2 == 0 && k == half) {
            // DC and Nyquist stay as they are.
        } else if k < half || (n % 2 == 1 && k == half) {
            *bin *= 2.0;
        } else {
            *bin = Complex::new(0.0, 0.0);
        }
    }

    inverse.process(&mut spectrum);
    let scale = 1.0 / n as f32;
    for bin in &mut spectrum {
        *bin *= scale;
    }
    spectrum
}

/// Instantaneous envelope of a real signal.
pub fn envelope(input: &[f32]) -> Vec<f32> {
    analytic(input).into_iter().map(|s| s.norm()).collect()
}
