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

//! Lighting effects.
//!
//! An effect turns the peaks of one rendered frame into a data frame for
//! the light bridge. The former head unit class hierarchy is gone: effects
//! write into a fixed channel layout (two RGBW pin spots, an el wire and an
//! led forest dimmer) and the bridge peer maps those bytes onto hardware.

mod colorbars;
mod majorpeak;
mod standby;

pub use colorbars::ColorBars;
pub use majorpeak::MajorPeak;
pub use standby::Standby;

use crate::{desk::msg::DataFrame, frame::peaks::PeaksPair};

/// Channel layout of a data frame.
pub const MAIN_SPOT_BASE: usize = 0;
pub const FILL_SPOT_BASE: usize = 4;
pub const EL_WIRE: usize = 8;
pub const LED_FOREST: usize = 9;
pub const DMX_CHANNELS: usize = 10;

pub trait Fx: Send {
    fn name(&self) -> &'static str;

    /// Fills `out` from the frame's peaks. `due_at_ns` is the frame's
    /// instant on the local timeline, effects may use it for phase.
    fn execute(&mut self, peaks: &PeaksPair, due_at_ns: i64, out: &mut DataFrame);

    /// Whether the effect has run its course and the next one may take over.
    fn completed(&self) -> bool {
        false
    }
}

/// The effect sequence of a running receiver: color bars once at startup,
/// major peak while audio plays, standby once the stream has gone silent
/// for a while.
pub struct ActiveFx {
    colorbars: ColorBars,
    majorpeak: MajorPeak,
    standby: Standby,
    phase: Phase,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    ColorBars,
    MajorPeak,
    Standby,
}

impl ActiveFx {
    pub fn new() -> Self {
        ActiveFx {
            colorbars: ColorBars::new(),
            majorpeak: MajorPeak::new(),
            standby: Standby::new(),
            phase: Phase::ColorBars,
        }
    }

    /// Major peak only, skipping the startup pattern.
    pub fn without_colorbars() -> Self {
        ActiveFx {
            phase: Phase::MajorPeak,
            ..ActiveFx::new()
        }
    }

    fn has_useable_peaks(peaks: &PeaksPair) -> bool {
        peaks.left.major().is_some() || peaks.right.major().is_some()
    }
}

impl Default for ActiveFx {
    fn default() -> Self {
        ActiveFx::new()
    }
}

impl Fx for ActiveFx {
    fn name(&self) -> &'static str {
        match self.phase {
            Phase::ColorBars => self.colorbars.name(),
            Phase::MajorPeak => self.majorpeak.name(),
            Phase::Standby => self.standby.name(),
        }
    }

    fn execute(&mut self, peaks: &PeaksPair, due_at_ns: i64, out: &mut DataFrame) {
        match self.phase {
            Phase::ColorBars => {
                self.colorbars.execute(peaks, due_at_ns, out);
                if self.colorbars.completed() {
                    self.phase = Phase::MajorPeak;
                }
            }
            Phase::MajorPeak => {
                self.majorpeak.execute(peaks, due_at_ns, out);
                if self.majorpeak.completed() {
                    self.phase = Phase::Standby;
                }
            }
            Phase::Standby => {
                self.standby.execute(peaks, due_at_ns, out);
                if Self::has_useable_peaks(peaks) {
                    self.majorpeak.wake();
                    self.phase = Phase::MajorPeak;
                }
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::frame::peaks::{Peak, Peaks};

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
    fn startup_runs_colorbars_then_switches_to_majorpeak() {
        let mut fx = ActiveFx::new();
        assert_eq!("colorbars", fx.name());

        let silence = PeaksPair::default();
        for _ in 0..1_000 {
            let mut out = DataFrame::new(0);
            fx.execute(&silence, 0, &mut out);
            if fx.name() != "colorbars" {
                break;
            }
        }

        assert_eq!("majorpeak", fx.name());
    }

    #[test]
    fn prolonged_silence_falls_back_to_standby_and_peaks_wake_it() {
        let mut fx = ActiveFx::without_colorbars();

        let silence = PeaksPair::default();
        for _ in 0..100_000 {
            let mut out = DataFrame::new(0);
            fx.execute(&silence, 0, &mut out);
            if fx.name() == "standby" {
                break;
            }
        }
        assert_eq!("standby", fx.name());

        let mut out = DataFrame::new(0);
        fx.execute(&peaks_at(440.0, 120_000.0), 0, &mut out);
        assert_eq!("majorpeak", fx.name());
    }
}
