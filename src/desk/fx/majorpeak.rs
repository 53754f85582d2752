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

//! The main show: both pin spots follow the dominant spectral peaks.
//!
//! The main spot reacts to peaks above its frequency cutoff, the fill spot
//! to the low end. Peak frequency picks the hue on a log scale, peak
//! magnitude drives brightness, and a spot without a fresh peak fades to
//! black instead of snapping off.

use crate::{
    desk::{
        color::Color,
        fader::{Easing, Fader},
        fx::{DMX_CHANNELS, EL_WIRE, FILL_SPOT_BASE, Fx, LED_FOREST, MAIN_SPOT_BASE},
        msg::{DataFrame, MT_DATA},
    },
    frame::peaks::{Peak, Peaks, PeaksPair},
};

/// Frequencies outside this window never light a spot.
const HARD_FLOOR_HZ: f32 = 40.0;
const HARD_CEILING_HZ: f32 = 10_000.0;

/// Above the soft ceiling colors collapse into a narrow red band.
const SOFT_CEILING_HZ: f32 = 1_500.0;

const MAIN_FREQUENCY_MIN_HZ: f32 = 180.0;
const FILL_FREQUENCY_MAX_HZ: f32 = 1_000.0;

/// Fade-to-black lengths in render frames (~23 ms each).
const MAIN_FADE_FRAMES: u32 = 30;
const FILL_FADE_FRAMES: u32 = 34;

/// Consecutive silent frames before the effect yields to standby,
/// about 13 s at 43 fps.
const SILENCE_TIMEOUT_FRAMES: u32 = 560;

pub struct MajorPeak {
    main: Spot,
    fill: Spot,
    forest_level: u8,
    silent_frames: u32,
}

struct Spot {
    fader: Option<Fader>,
    last_peak: Peak,
    fade_frames: u32,
}

impl Spot {
    fn new(fade_frames: u32) -> Self {
        Spot {
            fader: None,
            last_peak: Peak::zero(),
            fade_frames,
        }
    }

    /// Latches onto a fresh peak or keeps fading out the previous one.
    fn update(&mut self, peak: Option<&Peak>) -> Color {
        match peak {
            Some(peak) => {
                let color = make_color(peak);
                self.last_peak = *peak;
                self.fader = Some(Fader::to_black(color, Easing::OutExpo, self.fade_frames));
                color
            }
            None => match &mut self.fader {
                Some(fader) => {
                    let color = fader.travel();
                    if fader.finished() {
                        self.fader = None;
                    }
                    color
                }
                None => Color::black(),
            },
        }
    }
}

impl MajorPeak {
    pub fn new() -> Self {
        MajorPeak {
            main: Spot::new(MAIN_FADE_FRAMES),
            fill: Spot::new(FILL_FADE_FRAMES),
            forest_level: 0,
            silent_frames: 0,
        }
    }

    /// Called when audio returns after a standby period.
    pub fn wake(&mut self) {
        self.silent_frames = 0;
    }
}

impl Default for MajorPeak {
    fn default() -> Self {
        MajorPeak::new()
    }
}

impl Fx for MajorPeak {
    fn name(&self) -> &'static str {
        "majorpeak"
    }

    fn execute(&mut self, peaks: &PeaksPair, _due_at_ns: i64, out: &mut DataFrame) {
        let main_peak = strongest_in(peaks, MAIN_FREQUENCY_MIN_HZ, HARD_CEILING_HZ);
        let fill_peak = strongest_in(peaks, HARD_FLOOR_HZ, FILL_FREQUENCY_MAX_HZ);

        let any_audio = main_peak.is_some() || fill_peak.is_some();
        if any_audio {
            self.silent_frames = 0;
        } else {
            self.silent_frames = self.silent_frames.saturating_add(1);
        }

        let main_color = self.main.update(main_peak.as_ref());
        let fill_color = self.fill.update(fill_peak.as_ref());

        // el wire follows the overall level, the forest pulses on strong
        // peaks and decays in between
        let el_level = strongest(peaks)
            .map(|p| (p.mag_unit_interval() * 255.0) as u8)
            .unwrap_or(0);

        self.forest_level = match strongest(peaks) {
            Some(p) if p.strong() => 255,
            _ => self.forest_level.saturating_sub(8),
        };

        let left = peaks.left.major();
        let right = peaks.right.major();

        out.mt = MT_DATA;
        out.silence = !any_audio && self.main.fader.is_none() && self.fill.fader.is_none();
        out.left_freq = left.map(|p| p.freq_hz).unwrap_or(0.0);
        out.left_mag = left.map(Peak::mag_scaled).unwrap_or(0.0);
        out.right_freq = right.map(|p| p.freq_hz).unwrap_or(0.0);
        out.right_mag = right.map(Peak::mag_scaled).unwrap_or(0.0);

        let mut dmx = vec![0u8; DMX_CHANNELS];
        main_color.copy_rgbw_to(&mut dmx[MAIN_SPOT_BASE..MAIN_SPOT_BASE + 4]);
        fill_color.copy_rgbw_to(&mut dmx[FILL_SPOT_BASE..FILL_SPOT_BASE + 4]);
        dmx[EL_WIRE] = el_level;
        dmx[LED_FOREST] = self.forest_level;
        out.dmx = dmx;
    }

    fn completed(&self) -> bool {
        self.silent_frames >= SILENCE_TIMEOUT_FRAMES
    }
}

/// Strongest useable peak across both channels.
fn strongest(peaks: &PeaksPair) -> Option<Peak> {
    let left = peaks.left.major();
    let right = peaks.right.major();

    match (left, right) {
        (Some(l), Some(r)) => Some(if l.magnitude >= r.magnitude { *l } else { *r }),
        (Some(l), None) => Some(*l),
        (None, Some(r)) => Some(*r),
        (None, None) => None,
    }
}

/// Strongest useable peak across both channels within a frequency window.
fn strongest_in(peaks: &PeaksPair, floor_hz: f32, ceiling_hz: f32) -> Option<Peak> {
    let pick = |channel: &Peaks| {
        channel
            .iter()
            .filter(|p| p.useable())
            .find(|p| p.freq_hz >= floor_hz && p.freq_hz <= ceiling_hz)
            .copied()
    };

    match (pick(&peaks.left), pick(&peaks.right)) {
        (Some(l), Some(r)) => Some(if l.magnitude >= r.magnitude { l } else { r }),
        (Some(l), None) => Some(l),
        (None, Some(r)) => Some(r),
        (None, None) => None,
    }
}

/// Peak frequency picks the hue, magnitude the brightness.
fn make_color(peak: &Peak) -> Color {
    if peak.freq_hz > SOFT_CEILING_HZ {
        // high end collapses into a narrow red band at reduced brightness
        let mut color = Color::from_hsb(350.0, 100.0, 50.0);
        color.scale_brightness(0.0..=1.0, peak.mag_unit_interval());
        return color;
    }

    let clamped = peak.freq_hz.clamp(HARD_FLOOR_HZ, SOFT_CEILING_HZ);
    let unit = (clamped / HARD_FLOOR_HZ).log10() / (SOFT_CEILING_HZ / HARD_FLOOR_HZ).log10();
    let hue = 30.0 + unit * 330.0;

    let mut color = Color::from_hsb(hue, 100.0, 100.0);
    color.scale_brightness(0.0..=1.0, peak.mag_unit_interval());
    color
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::frame::peaks::MAG_FLOOR;

    fn peaks_at(freq_hz: f32, magnitude: f32) -> PeaksPair {
        let mut left = Peaks::default();
        left.insert(Peak::new((freq_hz / 43.0) as u32, freq_hz, magnitude));
        left.finalize();
        PeaksPair {
            left,
            right: Peaks::default(),
        }
    }

    #[test]
    fn a_midrange_peak_lights_both_spots() {
        let mut fx = MajorPeak::new();
        let mut out = DataFrame::new(1);
        fx.execute(&peaks_at(440.0, 400_000.0), 0, &mut out);

        assert!(!out.silence);
        assert_eq!(440.0, out.left_freq);
        assert_eq!(DMX_CHANNELS, out.dmx.len());
        assert!(out.dmx[MAIN_SPOT_BASE..MAIN_SPOT_BASE + 4].iter().any(|b| *b > 0));
        assert!(out.dmx[FILL_SPOT_BASE..FILL_SPOT_BASE + 4].iter().any(|b| *b > 0));
    }

    #[test]
    fn low_peaks_only_reach_the_fill_spot() {
        let mut fx = MajorPeak::new();
        let mut out = DataFrame::new(1);
        fx.execute(&peaks_at(60.0, 400_000.0), 0, &mut out);

        assert!(out.dmx[MAIN_SPOT_BASE..MAIN_SPOT_BASE + 4].iter().all(|b| *b == 0));
        assert!(out.dmx[FILL_SPOT_BASE..FILL_SPOT_BASE + 4].iter().any(|b| *b > 0));
    }

    #[test]
    fn spots_fade_out_instead_of_snapping_off() {
        let mut fx = MajorPeak::new();
        let mut out = DataFrame::new(1);
        fx.execute(&peaks_at(440.0, 400_000.0), 0, &mut out);

        let silence = PeaksPair::default();
        let mut out = DataFrame::new(2);
        fx.execute(&silence, 0, &mut out);

        // one frame after the peak the spot is dimmer but not black
        assert!(!out.silence);
        assert!(out.dmx[MAIN_SPOT_BASE..MAIN_SPOT_BASE + 4].iter().any(|b| *b > 0));
    }

    #[test]
    fn sub_floor_peaks_are_silence() {
        let mut fx = MajorPeak::new();
        let mut out = DataFrame::new(1);
        fx.execute(&peaks_at(440.0, MAG_FLOOR - 100.0), 0, &mut out);
        assert!(out.silence);
    }

    #[test]
    fn silence_timeout_completes_the_effect() {
        let mut fx = MajorPeak::new();
        let silence = PeaksPair::default();
        for _ in 0..SILENCE_TIMEOUT_FRAMES {
            let mut out = DataFrame::new(0);
            fx.execute(&silence, 0, &mut out);
        }
        assert!(fx.completed());

        fx.wake();
        assert!(!fx.completed());
    }
}
