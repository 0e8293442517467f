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

//! Kaiser windowed-sinc FIR design and zero-phase application.
//!
//! All kernels here are odd-length linear-phase filters applied *centered*:
//! output sample `i` is aligned with input sample `i` (or `i * factor` when
//! decimating), with zero padding at the edges. That keeps every stage free
//! of group delay so sample timing survives filtering unchanged.

use num_complex::Complex;

/// Normalized sinc, `sin(pi x) / (pi x)`.
pub fn sinc(x: f64) -> f64 {
    if x.abs() < 1e-12 {
        1.0
    } else {
        let px = std::f64::consts::PI * x;
        px.sin() / px
    }
}

/// Zeroth order modified Bessel function of the first kind, by power series.
pub fn bessel_i0(x: f64) -> f64 {
    let half = x / 2.0;
    let mut sum = 1.0;
    let mut term = 1.0;
    for k in 1..64 {
        term *= (half / k as f64) * (half / k as f64);
        sum += term;
        if term < sum * 1e-14 {
            break;
        }
    }
    sum
}

/// Kaiser window shape parameter for the given stopband attenuation.
pub fn kaiser_beta(attenuation_db: f64) -> f64 {
    if attenuation_db > 50.0 {
        0.1102 * (attenuation_db - 8.7)
    } else if attenuation_db >= 21.0 {
        0.5842 * (attenuation_db - 21.0).powf(0.4) + 0.07886 * (attenuation_db - 21.0)
    } else {
        0.0
    }
}

/// Kaiser estimate of the tap count for the given attenuation and
/// normalized transition width, rounded up to odd so the filter has an
/// integer center.
pub fn kaiser_taps(attenuation_db: f64, transition_norm: f64) -> usize {
    let taps = ((attenuation_db - 8.0)
        / (2.285 * 2.0 * std::f64::consts::PI * transition_norm))
        .ceil() as usize;
    if taps % 2 == 0 { taps + 1 } else { taps }
}

fn kaiser_window(taps: usize, beta: f64) -> Vec<f64> {
    let center = (taps - 1) as f64 / 2.0;
    let denominator = bessel_i0(beta);
    (0..taps)
        .map(|n| {
            let r = (n as f64 - center) / center;
            bessel_i0(beta * (1.0 - r * r).max(0.0).sqrt()) / denominator
        })
        .collect()
}

/// Lowpass with unity DC gain. `cutoff_norm` is cutoff / sample rate.
pub fn design_lowpass(taps: usize, cutoff_norm: f64, beta: f64) -> Vec<f32> {
    let center = (taps - 1) as f64 / 2.0;
    let window = kaiser_window(taps, beta);
    let mut kernel: Vec<f64> = (0..taps)
        .map(|n| 2.0 * cutoff_norm * sinc(2.0 * cutoff_norm * (n as f64 - center)) * window[n])
        .collect();
    let sum: f64 = kernel.iter().sum();
    for tap in &mut kernel {
        *tap /= sum;
    }
    kernel.into_iter().map(|t| t as f32).collect()
}

/// Bandpass with unity gain at the band center.
pub fn design_bandpass(taps: usize, low_norm: f64, high_norm: f64, beta: f64) -> Vec<f32> {
    let center = (taps - 1) as f64 / 2.0;
    let window = kaiser_window(taps, beta);
    let mut kernel: Vec<f64> = (0..taps)
        .map(|n| {
            let k = n as f64 - center;
            (2.0 * high_norm * sinc(2.0 * high_norm * k) - 2.0 * low_norm * sinc(2.0 * low_norm * k))
                * window[n]
        })
        .collect();
    let mid = (low_norm + high_norm) / 2.0;
    let gain: f64 = kernel
        .iter()
        .enumerate()
        .map(|(n, t)| t * (2.0 * std::f64::consts::PI * mid * (n as f64 - center)).cos())
        .sum();
    for tap in &mut kernel {
        *tap /= gain;
    }
    kernel.into_iter().map(|t| t as f32).collect()
}

/// Centered convolution, same-length output, zero padded edges.
pub fn filter_centered(input: &[Complex<f32>], kernel: &[f32]) -> Vec<Complex<f32>> {
    let center = kernel.len() / 2;
    (0..input.len())
        .map(|i| convolve_at(input, kernel, center, i))
        .collect()
}

pub fn filter_centered_real(input: &[f32], kernel: &[f32]) -> Vec<f32> {
    let center = kernel.len() / 2;
    (0..input.len())
        .map(|i| {
            let mut acc = 0.0f64;
            for (j, tap) in kernel.iter().enumerate() {
                let index = i as i64 + j as i64 - center as i64;
                if index >= 0 && (index as usize) < input.len() {
                    acc += *tap as f64 * input[index as usize] as f64;
                }
            }
            acc as f32
        })
        .collect()
}

/// Centered convolution evaluated only at multiples of `factor`; output
/// sample `k` is aligned with input sample `k * factor`.
pub fn decimate_centered(input: &[Complex<f32>], kernel: &[f32], factor: usize) -> Vec<Complex<f32>> {
    let center = kernel.len() / 2;
    let output_len = input.len().div_ceil(factor);
    (0..output_len)
        .map(|k| convolve_at(input, kernel, center, k * factor))
        .collect()
}

fn convolve_at(input: &[Complex<f32>], kernel: &[f32], center: usize, i: usize) -> Complex<f32> {
    let mut acc = Complex::new(0.0f64, 0.0f64);
    let start = i as i64 - center as i64;
    for (j, tap) in kernel.iter().enumerate() {
        let index = start + j as i64;
        if index >= 0 && (index as usize) < input.len() {
            let sample = input[index as usize];
            acc.re += *tap as f64 * sample.re as f64;
            acc.im += *tap as f64 * sample.im as f64;
        }
    }
    Complex::new(acc.re as f32, acc.im as f32)
}
