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

//! Color faders.
//!
//! A fader moves a head unit's color from an origin towards a destination
//! over a fixed number of render frames, shaped by an easing curve. The
//! easing functions follow Andrey Sitnik's and Ivan Solovev's easings.net
//! formulations.

use crate::desk::color::Color;
use std::f32::consts::PI;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Easing {
    /// Constant rate.
    #[default]
    Linear,
    /// Fast start, exponential tail.
    OutExpo,
    /// Sine-shaped ease in and out.
    InOutSine,
    /// Accelerates on a circular arc.
    InCircular,
    /// Decelerates on a circular arc.
    OutCircular,
    /// Fifth power acceleration from zero.
    InQuint,
    /// Fifth power deceleration to zero.
    OutQuint,
}

impl Easing {
    /// Maps linear progress `x` in [0, 1] onto the eased curve.
    pub fn apply(&self, x: f32) -> f32 {
        let x = x.clamp(0.0, 1.0);
        match self {
            Easing::Linear => x,
            Easing::OutExpo => {
                if x >= 1.0 {
                    1.0
                } else {
                    1.0 - 2.0f32.powf(-10.0 * x)
                }
            }
            Easing::InOutSine => -((PI * x).cos() - 1.0) / 2.0,
            Easing::InCircular => 1.0 - (1.0 - x * x).max(0.0).sqrt(),
            Easing::OutCircular => (1.0 - (x - 1.0) * (x - 1.0)).max(0.0).sqrt(),
            Easing::InQuint => x.powi(5),
            Easing::OutQuint => 1.0 - (1.0 - x).powi(5),
        }
    }
}

/// Fades a color over a fixed number of render frames.
#[derive(Debug, Clone)]
pub struct Fader {
    origin: Color,
    destination: Color,
    easing: Easing,
    total_frames: u32,
    frame: u32,
}

impl Fader {
    pub fn new(origin: Color, destination: Color, easing: Easing, total_frames: u32) -> Self {
        Fader {
            origin,
            destination,
            easing,
            total_frames: total_frames.max(1),
            frame: 0,
        }
    }

    /// Fade to black, the most common fade on a pin spot.
    pub fn to_black(origin: Color, easing: Easing, total_frames: u32) -> Self {
        Fader::new(origin, Color::black(), easing, total_frames)
    }

    /// Advances by one render frame and returns the current color.
    pub fn travel(&mut self) -> Color {
        if self.frame < self.total_frames {
            self.frame += 1;
        }

        let progress = self.frame as f32 / self.total_frames as f32;
        Color::interpolate(self.origin, self.destination, self.easing.apply(progress))
    }

    pub fn position(&self) -> Color {
        let progress = self.frame as f32 / self.total_frames as f32;
        Color::interpolate(self.origin, self.destination, self.easing.apply(progress))
    }

    pub fn finished(&self) -> bool {
        self.frame >= self.total_frames
    }

    pub fn restart(&mut self, origin: Color) {
        self.origin = origin;
        self.frame = 0;
    }
}
