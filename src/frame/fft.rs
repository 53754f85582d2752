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

//! Windowed FFT and peak extraction for one audio channel.
//!
//! Each 1024 sample channel is DC stripped, windowed and transformed, then
//! the magnitude spectrum is scanned for local maxima. Peak frequency is
//! refined by quadratic interpolation of the three bins around each maximum.

use crate::frame::{
    SAMPLE_RATE, SAMPLES_PER_FRAME,
    peaks::{Peak, Peaks},
};
use lazy_static::lazy_static;
use realfft::{RealFftPlanner, RealToComplex};
use rustfft::num_complex::Complex;
use std::{f32::consts::TAU, sync::Arc};

const SAMPLES: usize = SAMPLES_PER_FRAME as usize;

lazy_static! {
    /// First half of the symmetric analysis window.
    static ref WINDOW: Vec<f32> = {
        let samples_minus_one = (SAMPLES - 1) as f32;
        (0..SAMPLES / 2)
            .map(|i| 0.54 * (1.0 - (TAU * i as f32 / samples_minus_one).cos()))
            .collect()
    };
}

pub struct Fft {
    plan: Arc<dyn RealToComplex<f32>>,
    spectrum: Vec<Complex<f32>>,
    magnitude: Vec<f32>,
}

impl Fft {
    pub fn new() -> Self {
        let plan = RealFftPlanner::<f32>::new().plan_fft_forward(SAMPLES);
        let spectrum = plan.make_output_vec();
        let magnitude = vec![0.0; spectrum.len()];
        Fft {
            plan,
            spectrum,
            magnitude,
        }
    }

    /// Transforms one channel in place and returns its peaks, strongest
    /// first. `samples` must hold exactly one frame.
    pub fn process(&mut self, samples: &mut [f32]) -> Peaks {
        debug_assert_eq!(SAMPLES, samples.len());

        dc_removal(samples);
        windowing(samples);

        if self.plan.process(samples, &mut self.spectrum).is_err() {
            return Peaks::default();
        }

        for (mag, bin) in self.magnitude.iter_mut().zip(self.spectrum.iter()) {
            *mag = bin.norm();
        }

        self.find_peaks()
    }

    /// Scans the first half of the spectrum for local maxima. The transform
    /// of a real signal is symmetric, the upper half carries no information.
    fn find_peaks(&self) -> Peaks {
        let mut peaks = Peaks::with_capacity(16);

        for i in 1..SAMPLES / 2 {
            let a = self.magnitude[i - 1];
            let b = self.magnitude[i];
            let c = self.magnitude[i + 1];

            if a < b && b > c {
                peaks.insert(Peak::new(i as u32, freq_at(i, a, b, c), mag_at(a, b, c)));
            }
        }

        peaks.finalize();
        peaks
    }
}

impl Default for Fft {
    fn default() -> Self {
        Fft::new()
    }
}

fn dc_removal(samples: &mut [f32]) {
    let mean = samples.iter().sum::<f32>() / samples.len() as f32;
    for sample in samples.iter_mut() {
        *sample -= mean;
    }
}

fn windowing(samples: &mut [f32]) {
    for (i, w) in WINDOW.iter().enumerate() {
        samples[i] *= w;
        samples[SAMPLES - (i + 1)] *= w;
    }
}

fn mag_at(a: f32, b: f32, c: f32) -> f32 {
    (a - 2.0 * b + c).abs()
}

/// Quadratic interpolation of the peak position between bins.
fn freq_at(i: usize, a: f32, b: f32, c: f32) -> f32 {
    let delta = 0.5 * ((a - c) / (a - 2.0 * b + c));
    if i == SAMPLES / 2 {
        // edge bin sits on the folding frequency
        (i as f32 + delta) * SAMPLE_RATE as f32 / SAMPLES as f32
    } else {
        (i as f32 + delta) * SAMPLE_RATE as f32 / (SAMPLES - 1) as f32
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::frame::peaks::MAG_STRONG;

    fn sinusoid(freq_hz: f32, amplitude: f32) -> Vec<f32> {
        let full_scale = amplitude * i16::MAX as f32;
        (0..SAMPLES)
            .map(|i| full_scale * (TAU * freq_hz * i as f32 / SAMPLE_RATE as f32).sin())
            .collect()
    }

    #[test]
    fn pure_sinusoids_produce_a_strong_peak_at_their_frequency() {
        let bin_width = SAMPLE_RATE as f32 / SAMPLES as f32;

        for freq in [440.0f32, 1_000.0, 4_000.0] {
            let mut fft = Fft::new();
            let mut samples = sinusoid(freq, 0.5);
            let peaks = fft.process(&mut samples);

            let strongest = peaks.strongest().expect("peak expected");
            assert_eq!(
                (freq / bin_width).round() as u32,
                strongest.index,
                "strongest peak in wrong bin for {freq} Hz"
            );
            assert!(
                (strongest.freq_hz - freq).abs() < bin_width / 4.0,
                "interpolated {} Hz too far from {freq} Hz",
                strongest.freq_hz
            );
            assert!(
                strongest.magnitude > MAG_STRONG,
                "peak at {freq} Hz not strong: {}",
                strongest.magnitude
            );
        }
    }

    #[test]
    fn silence_has_no_peaks() {
        let mut fft = Fft::new();
        let mut samples = vec![0.0f32; SAMPLES];
        let peaks = fft.process(&mut samples);
        assert!(peaks.is_empty());
    }

    #[test]
    fn dc_offset_alone_has_no_peaks() {
        let mut fft = Fft::new();
        let mut samples = vec![12_000.0f32; SAMPLES];
        let peaks = fft.process(&mut samples);
        assert!(peaks.is_empty());
    }

    #[test]
    fn quiet_signals_stay_below_the_floor() {
        let mut fft = Fft::new();
        // an amplitude three orders of magnitude below full scale cannot
        // clear the magnitude floor
        let mut samples = sinusoid(1_000.0, 0.0005);
        let peaks = fft.process(&mut samples);
        assert!(peaks.is_empty());
    }
}
