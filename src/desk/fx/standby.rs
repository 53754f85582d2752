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

//! Idle effect: both spots glow dimly with a slowly rotating hue while no
//! audio is playing. Never completes on its own, the controller switches
//! away as soon as peaks show up again.

use crate::{
    desk::{
        color::Color,
        fx::{DMX_CHANNELS, FILL_SPOT_BASE, Fx, MAIN_SPOT_BASE},
        msg::{DataFrame, MT_SILENCE},
    },
    frame::peaks::PeaksPair,
};

/// Degrees of hue per render frame, one full turn in about 40 s.
const HUE_STEP_DEGREES: f32 = 0.2;

const IDLE_BRIGHTNESS: f32 = 15.0;

pub struct Standby {
    color: Color,
}

impl Standby {
    pub fn new() -> Self {
        Standby {
            color: Color::from_hsb(0.0, 100.0, IDLE_BRIGHTNESS),
        }
    }
}

impl Default for Standby {
    fn default() -> Self {
        Standby::new()
    }
}

impl Fx for Standby {
    fn name(&self) -> &'static str {
        "standby"
    }

    fn execute(&mut self, _peaks: &PeaksPair, _due_at_ns: i64, out: &mut DataFrame) {
        self.color.rotate_hue(HUE_STEP_DEGREES);

        out.mt = MT_SILENCE;
        out.silence = true;

        let mut dmx = vec![0u8; DMX_CHANNELS];
        self.color.copy_rgbw_to(&mut dmx[MAIN_SPOT_BASE..MAIN_SPOT_BASE + 4]);
        self.color.copy_rgbw_to(&mut dmx[FILL_SPOT_BASE..FILL_SPOT_BASE + 4]);
        out.dmx = dmx;
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn glows_dimly_and_rotates_hue() {
        let mut fx = Standby::new();
        let silence = PeaksPair::default();

        let mut out = DataFrame::new(0);
        fx.execute(&silence, 0, &mut out);
        assert!(out.silence);
        assert!(out.dmx[MAIN_SPOT_BASE..MAIN_SPOT_BASE + 4].iter().any(|b| *b > 0));

        let hue_before = fx.color.hue();
        let mut out = DataFrame::new(1);
        fx.execute(&silence, 0, &mut out);
        assert!(fx.color.hue() > hue_before);
    }

    #[test]
    fn never_completes_by_itself() {
        let fx = Standby::new();
        assert!(!fx.completed());
    }
}
