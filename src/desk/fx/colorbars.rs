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

//! Startup test pattern: white, blue, green and red bars fading to black,
//! alternating between the two pin spots. Runs once when the receiver
//! comes up so a misbehaving light rig is obvious before any audio plays.

use crate::{
    desk::{
        color::Color,
        fader::{Easing, Fader},
        fx::{DMX_CHANNELS, FILL_SPOT_BASE, Fx, MAIN_SPOT_BASE},
        msg::DataFrame,
    },
    frame::peaks::PeaksPair,
};

/// Length of one bar in render frames (~400 ms).
const BAR_FRAMES: u32 = 18;

pub struct ColorBars {
    bar_count: u32,
    fader: Option<Fader>,
}

impl ColorBars {
    pub fn new() -> Self {
        ColorBars {
            bar_count: 10,
            fader: None,
        }
    }

    fn bar_color(bar_count: u32) -> Color {
        match bar_count {
            9 | 10 => Color::from_rgb(0xff0000),
            7 | 8 => Color::from_rgb(0x00ff00),
            5 | 6 => Color::from_rgb(0x0000ff),
            _ => Color::full(),
        }
    }
}

impl Default for ColorBars {
    fn default() -> Self {
        ColorBars::new()
    }
}

impl Fx for ColorBars {
    fn name(&self) -> &'static str {
        "colorbars"
    }

    fn execute(&mut self, _peaks: &PeaksPair, _due_at_ns: i64, out: &mut DataFrame) {
        out.silence = false;
        let mut dmx = vec![0u8; DMX_CHANNELS];

        // while a bar is fading this is a no op apart from writing channels
        let color = match &mut self.fader {
            Some(fader) => {
                let color = fader.travel();
                if fader.finished() {
                    self.fader = None;
                    self.bar_count = self.bar_count.saturating_sub(1);
                }
                color
            }
            None if self.bar_count > 0 => {
                let mut fader = Fader::to_black(
                    Self::bar_color(self.bar_count),
                    Easing::InOutSine,
                    BAR_FRAMES,
                );
                let color = fader.travel();
                self.fader = Some(fader);
                color
            }
            None => Color::black(),
        };

        // even bars light the main spot, odd bars the fill spot
        let base = if self.bar_count % 2 == 0 {
            MAIN_SPOT_BASE
        } else {
            FILL_SPOT_BASE
        };
        color.copy_rgbw_to(&mut dmx[base..base + 4]);

        out.dmx = dmx;
    }

    fn completed(&self) -> bool {
        self.bar_count == 0 && self.fader.is_none()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn runs_ten_bars_then_completes() {
        let mut fx = ColorBars::new();
        let silence = PeaksPair::default();

        let mut frames = 0;
        while !fx.completed() && frames < 10_000 {
            let mut out = DataFrame::new(0);
            fx.execute(&silence, 0, &mut out);
            frames += 1;
        }

        assert!(fx.completed());
        // ten bars of BAR_FRAMES each, plus the final black frame
        assert!(frames >= 10 * BAR_FRAMES);
    }

    #[test]
    fn bars_alternate_between_the_spots() {
        let mut fx = ColorBars::new();
        let silence = PeaksPair::default();

        let mut out = DataFrame::new(0);
        fx.execute(&silence, 0, &mut out);
        // bar 10 is even: main spot lit, fill dark
        assert!(out.dmx[MAIN_SPOT_BASE..MAIN_SPOT_BASE + 4].iter().any(|b| *b > 0));
        assert!(out.dmx[FILL_SPOT_BASE..FILL_SPOT_BASE + 4].iter().all(|b| *b == 0));
    }
}
