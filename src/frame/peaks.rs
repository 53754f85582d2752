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

//! Spectral peak model.
//!
//! Magnitudes are raw FFT magnitudes of full scale 16 bit samples. The floor
//! and ceiling bound the range in which a peak carries usable lighting
//! information; everything below the floor is noise, everything above the
//! ceiling is clipping territory.

/// Minimum magnitude for a peak to be recorded at all.
pub const MAG_FLOOR: f32 = 36_400.0;

/// Magnitudes above this are treated as saturated and not useable.
pub const MAG_CEILING: f32 = 2_100_000.0;

/// Magnitude at which a peak counts as strong.
pub const MAG_STRONG: f32 = 3.0 * MAG_FLOOR;

const MAG_SCALE_FACTOR: f32 = 2.41;

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Peak {
    /// FFT bin the peak was found in.
    pub index: u32,
    pub freq_hz: f32,
    pub magnitude: f32,
}

impl Peak {
    pub fn new(index: u32, freq_hz: f32, magnitude: f32) -> Self {
        Peak {
            index,
            freq_hz,
            magnitude,
        }
    }

    pub fn zero() -> Self {
        Peak::default()
    }

    pub fn useable(&self) -> bool {
        self.magnitude > MAG_FLOOR && self.magnitude < MAG_CEILING
    }

    pub fn strong(&self) -> bool {
        self.magnitude >= MAG_STRONG
    }

    /// Magnitude in dB above the scaled floor, clamped to zero.
    pub fn mag_scaled(&self) -> f32 {
        let scaled =
            10.0 * self.magnitude.log10() - 10.0 * (MAG_FLOOR * MAG_SCALE_FACTOR).log10();
        scaled.max(0.0)
    }

    /// Linear position of the magnitude within the useable range.
    pub fn mag_unit_interval(&self) -> f32 {
        let floor = (MAG_FLOOR * MAG_SCALE_FACTOR).log10();
        let ceiling = MAG_CEILING.log10();
        ((self.magnitude.log10() - floor) / (ceiling - floor)).clamp(0.0, 1.0)
    }
}

/// Peaks of one channel, ordered by magnitude descending.
#[derive(Debug, Clone, Default)]
pub struct Peaks {
    peaks: Vec<Peak>,
}

impl Peaks {
    pub fn with_capacity(capacity: usize) -> Self {
        Peaks {
            peaks: Vec::with_capacity(capacity),
        }
    }

    /// Records a peak, dropping anything at or below the noise floor.
    pub fn insert(&mut self, peak: Peak) {
        if peak.magnitude > MAG_FLOOR {
            self.peaks.push(peak);
        }
    }

    /// Sorts by magnitude descending. Call once after the spectrum scan.
    pub fn finalize(&mut self) {
        self.peaks
            .sort_unstable_by(|a, b| b.magnitude.total_cmp(&a.magnitude));
    }

    /// Strongest useable peak, if any.
    pub fn major(&self) -> Option<&Peak> {
        self.peaks.iter().find(|p| p.useable())
    }

    pub fn strongest(&self) -> Option<&Peak> {
        self.peaks.first()
    }

    pub fn len(&self) -> usize {
        self.peaks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peaks.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Peak> {
        self.peaks.iter()
    }
}

/// Peaks of both channels of one frame.
#[derive(Debug, Clone, Default)]
pub struct PeaksPair {
    pub left: Peaks,
    pub right: Peaks,
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn magnitude_floor_boundary() {
        let mut peaks = Peaks::default();
        peaks.insert(Peak::new(10, 430.0, 36_399.0));
        assert!(peaks.is_empty());

        peaks.insert(Peak::new(10, 430.0, 36_401.0));
        assert_eq!(1, peaks.len());
    }

    #[test]
    fn useable_requires_floor_to_ceiling_range() {
        assert!(!Peak::new(1, 100.0, 36_399.0).useable());
        assert!(Peak::new(1, 100.0, 36_401.0).useable());
        assert!(Peak::new(1, 100.0, 2_099_999.0).useable());
        assert!(!Peak::new(1, 100.0, 2_100_001.0).useable());
    }

    #[test]
    fn strong_is_three_floors() {
        assert!(!Peak::new(1, 100.0, MAG_STRONG - 1.0).strong());
        assert!(Peak::new(1, 100.0, MAG_STRONG).strong());
    }

    #[test]
    fn finalize_sorts_by_magnitude_descending() {
        let mut peaks = Peaks::default();
        peaks.insert(Peak::new(1, 100.0, 50_000.0));
        peaks.insert(Peak::new(2, 200.0, 500_000.0));
        peaks.insert(Peak::new(3, 300.0, 100_000.0));
        peaks.finalize();

        let mags: Vec<f32> = peaks.iter().map(|p| p.magnitude).collect();
        assert_eq!(vec![500_000.0, 100_000.0, 50_000.0], mags);
    }

    #[test]
    fn major_skips_saturated_peaks() {
        let mut peaks = Peaks::default();
        peaks.insert(Peak::new(1, 100.0, 3_000_000.0));
        peaks.insert(Peak::new(2, 200.0, 120_000.0));
        peaks.finalize();

        let major = peaks.major().expect("useable peak present");
        assert_eq!(2, major.index);
    }

    #[test]
    fn mag_scaled_clamps_at_zero() {
        assert_eq!(0.0, Peak::new(1, 100.0, 1.0).mag_scaled());
        assert!(Peak::new(1, 100.0, 500_000.0).mag_scaled() > 0.0);
    }
}
