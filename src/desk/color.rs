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

//! Color model for the head units.
//!
//! Colors are held as hue/saturation/brightness so effects can rotate hue
//! and scale brightness independently, and converted to RGBW channel bytes
//! only when a data frame is written.

use std::ops::RangeInclusive;

/// Hue in turns [0, 1), saturation and brightness in [0, 1].
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Hsb {
    pub hue: f32,
    pub sat: f32,
    pub bri: f32,
}

impl Hsb {
    pub fn from_rgb(red: u8, grn: u8, blu: u8) -> Self {
        let r = red as f32 / 255.0;
        let g = grn as f32 / 255.0;
        let b = blu as f32 / 255.0;

        let max = r.max(g).max(b);
        let min = r.min(g).min(b);
        let delta = max - min;

        let hue = if delta == 0.0 {
            0.0
        } else if max == r {
            (((g - b) / delta).rem_euclid(6.0)) / 6.0
        } else if max == g {
            ((b - r) / delta + 2.0) / 6.0
        } else {
            ((r - g) / delta + 4.0) / 6.0
        };

        let sat = if max == 0.0 { 0.0 } else { delta / max };

        Hsb {
            hue,
            sat,
            bri: max,
        }
    }

    pub fn to_rgb(self) -> (u8, u8, u8) {
        let h = self.hue.rem_euclid(1.0) * 6.0;
        let c = self.bri * self.sat;
        let x = c * (1.0 - (h.rem_euclid(2.0) - 1.0).abs());
        let m = self.bri - c;

        let (r, g, b) = match h as u32 {
            0 => (c, x, 0.0),
            1 => (x, c, 0.0),
            2 => (0.0, c, x),
            3 => (0.0, x, c),
            4 => (x, 0.0, c),
            _ => (c, 0.0, x),
        };

        (
            ((r + m) * 255.0).round() as u8,
            ((g + m) * 255.0).round() as u8,
            ((b + m) * 255.0).round() as u8,
        )
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Color {
    hsb: Hsb,
    white: u8,
}

impl Color {
    pub fn black() -> Self {
        Color::default()
    }

    pub fn full() -> Self {
        Color {
            hsb: Hsb::from_rgb(0xff, 0xff, 0xff),
            white: 255,
        }
    }

    pub fn from_rgb(rgb: u32) -> Self {
        Color {
            hsb: Hsb::from_rgb((rgb >> 16) as u8, (rgb >> 8) as u8, rgb as u8),
            white: 0,
        }
    }

    pub fn from_hsb(hue_degrees: f32, sat_percent: f32, bri_percent: f32) -> Self {
        Color {
            hsb: Hsb {
                hue: (hue_degrees / 360.0).rem_euclid(1.0),
                sat: (sat_percent / 100.0).clamp(0.0, 1.0),
                bri: (bri_percent / 100.0).clamp(0.0, 1.0),
            },
            white: 0,
        }
    }

    pub fn hue(&self) -> f32 {
        self.hsb.hue * 360.0
    }

    pub fn saturation(&self) -> f32 {
        self.hsb.sat * 100.0
    }

    pub fn brightness(&self) -> f32 {
        self.hsb.bri * 100.0
    }

    pub fn is_black(&self) -> bool {
        self.hsb.bri == 0.0 && self.white == 0
    }

    pub fn rotate_hue(&mut self, step_degrees: f32) -> &mut Self {
        self.hsb.hue = (self.hsb.hue + step_degrees / 360.0).rem_euclid(1.0);
        self
    }

    pub fn set_brightness(&mut self, percent: f32) -> &mut Self {
        self.hsb.bri = (percent / 100.0).clamp(0.0, 1.0);
        self
    }

    /// Scales brightness to where `val` sits within `range`.
    pub fn scale_brightness(&mut self, range: RangeInclusive<f32>, val: f32) -> &mut Self {
        let span = range.end() - range.start();
        let unit = if span == 0.0 {
            0.0
        } else {
            ((val - range.start()) / span).clamp(0.0, 1.0)
        };
        self.hsb.bri *= unit;
        self
    }

    pub fn interpolate(a: Color, b: Color, t: f32) -> Color {
        let t = t.clamp(0.0, 1.0);

        // take the short way around the hue circle
        let mut delta = b.hsb.hue - a.hsb.hue;
        if delta > 0.5 {
            delta -= 1.0;
        } else if delta < -0.5 {
            delta += 1.0;
        }

        Color {
            hsb: Hsb {
                hue: (a.hsb.hue + delta * t).rem_euclid(1.0),
                sat: a.hsb.sat + (b.hsb.sat - a.hsb.sat) * t,
                bri: a.hsb.bri + (b.hsb.bri - a.hsb.bri) * t,
            },
            white: (a.white as f32 + (b.white as f32 - a.white as f32) * t) as u8,
        }
    }

    /// Writes the color as RGBW channel bytes.
    pub fn copy_rgbw_to(&self, channels: &mut [u8]) {
        let (r, g, b) = self.hsb.to_rgb();
        channels[0] = r;
        channels[1] = g;
        channels[2] = b;
        channels[3] = self.white;
    }
}
