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

//! Sender timeline anchoring.
//!
//! The sender periodically announces a `(clock id, rtp time, network time)`
//! tuple that ties its RTP timeline to the PTP master timeline. [`Anchor`]
//! keeps three slots of that data: `ACTUAL` (most recent raw input), `LAST`
//! (last accepted) and `RECENT` (a stabilised view that only becomes valid
//! after the anchor clock has stayed put for a while). Rapid master clock
//! changes invalidate the anchor until the timeline settles.

use crate::{
    clock::{ClockInfo, NANOS_PER_SEC, now_monotonic_ns},
    frame::SAMPLE_RATE,
};
use std::sync::Mutex;
use tracing::{debug, warn};

/// Minimum time the anchor clock must remain unchanged before the anchor is
/// considered stable.
pub const STABILITY_WINDOW_NS: u64 = 5 * NANOS_PER_SEC;

/// Raw anchor announcement as handed over by the control plane.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AnchorUpdate {
    pub rate: u64,
    pub clock_id: u64,
    pub secs: u64,
    pub frac: u64,
    pub flags: u64,
    pub rtp_time: u64,
}

impl AnchorUpdate {
    /// Network time in nanoseconds from the split seconds/fraction
    /// representation of the announcement.
    pub fn network_time_ns(&self) -> u64 {
        let mut frac_ns = self.frac >> 32;
        frac_ns *= NANOS_PER_SEC;
        frac_ns >>= 32;

        self.secs * NANOS_PER_SEC + frac_ns
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AnchorData {
    pub rate: u64,
    pub clock_id: u64,
    pub rtp_time: u64,
    pub network_time_ns: u64,
    pub valid_at_ns: u64,
    pub valid: bool,
}

impl AnchorData {
    pub fn ok(&self) -> bool {
        self.clock_id != 0
    }

    pub fn playing(&self) -> bool {
        self.rate & 1 == 1
    }

    fn same_tuple(&self, other: &AnchorData) -> bool {
        self.clock_id == other.clock_id
            && self.rtp_time == other.rtp_time
            && self.network_time_ns == other.network_time_ns
    }
}

#[derive(Debug, Default)]
struct Slots {
    actual: AnchorData,
    last: AnchorData,
    recent: AnchorData,
    /// Instant of the most recent anchor clock change, 0 = never.
    clock_changed_at_ns: u64,
}

impl Slots {
    fn save(&mut self, data: AnchorData, now_ns: u64) {
        self.actual = data;

        if !data.ok() {
            debug!("Anchor update without clock id, not playable.");
            self.last = data;
            self.recent = AnchorData::default();
            self.clock_changed_at_ns = now_ns;
            return;
        }

        if data.same_tuple(&self.last) {
            // idempotent announcement
            self.refresh(now_ns);
            return;
        }

        if data.clock_id == self.last.clock_id {
            let valid = self.last.valid;
            self.last = data;
            self.last.valid = valid;
            self.last.valid_at_ns = now_ns;
            self.refresh(now_ns);
            return;
        }

        let quick_change = self.clock_changed_at_ns != 0
            && now_ns.saturating_sub(self.clock_changed_at_ns) < STABILITY_WINDOW_NS;

        self.last = data;
        self.last.valid = !quick_change;
        self.last.valid_at_ns = now_ns;
        self.recent = AnchorData::default();
        self.clock_changed_at_ns = now_ns;

        if quick_change {
            warn!(
                "Anchor clock changing too quickly, holding frames until clock {:#x} stabilises.",
                data.clock_id
            );
        } else {
            debug!("New anchor clock {:#x}.", data.clock_id);
        }
    }

    /// Promotes the anchor once its clock has been stable long enough.
    fn refresh(&mut self, now_ns: u64) {
        if !self.last.ok() {
            return;
        }

        let stable_for = now_ns.saturating_sub(self.clock_changed_at_ns);
        if stable_for >= STABILITY_WINDOW_NS {
            if !self.last.valid {
                self.last.valid = true;
                self.last.valid_at_ns = now_ns;
            }
            if !self.recent.valid {
                self.recent = self.last;
                debug!("Anchor clock {:#x} stabilised.", self.last.clock_id);
            }
        }
    }
}

#[derive(Debug, Default)]
pub struct Anchor {
    slots: Mutex<Slots>,
}

impl Anchor {
    pub fn new() -> Self {
        Anchor::default()
    }

    pub fn save(&self, update: AnchorUpdate) {
        self.save_at(update, now_monotonic_ns());
    }

    pub(crate) fn save_at(&self, update: AnchorUpdate, now_ns: u64) {
        let data = AnchorData {
            rate: update.rate,
            clock_id: update.clock_id,
            rtp_time: update.rtp_time,
            network_time_ns: update.network_time_ns(),
            valid_at_ns: now_ns,
            valid: false,
        };

        let mut slots = self.slots.lock().expect("anchor mutex poisoned");
        slots.save(data, now_ns);
    }

    pub fn get(&self) -> AnchorData {
        self.get_at(now_monotonic_ns())
    }

    pub(crate) fn get_at(&self, now_ns: u64) -> AnchorData {
        let mut slots = self.slots.lock().expect("anchor mutex poisoned");
        slots.refresh(now_ns);
        slots.last
    }

    /// The stabilised view: only valid once the anchor clock has been
    /// steady for the full stability window.
    pub fn recent(&self) -> AnchorData {
        self.recent_at(now_monotonic_ns())
    }

    pub(crate) fn recent_at(&self, now_ns: u64) -> AnchorData {
        let mut slots = self.slots.lock().expect("anchor mutex poisoned");
        slots.refresh(now_ns);
        slots.recent
    }

    pub fn play_enabled(&self) -> bool {
        let data = self.get();
        data.valid && data.playing()
    }

    /// Maps an RTP timestamp to an instant on the local monotonic timeline.
    ///
    /// Needs a valid anchor and a master clock snapshot whose elected master
    /// matches the anchor clock; returns `None` otherwise. The RTP diff is
    /// 32 bit modular so timestamps may wrap.
    pub fn frame_local_time(&self, rtp_ts: u32, clock: &ClockInfo) -> Option<i64> {
        self.frame_local_time_at(rtp_ts, clock, now_monotonic_ns())
    }

    pub(crate) fn frame_local_time_at(
        &self,
        rtp_ts: u32,
        clock: &ClockInfo,
        now_ns: u64,
    ) -> Option<i64> {
        let data = self.get_at(now_ns);

        if !data.valid || !data.ok() || clock.master_id != data.clock_id {
            return None;
        }

        let diff_frames = rtp_ts.wrapping_sub(data.rtp_time as u32) as i32;
        let elapsed_ns = diff_frames as i128 * NANOS_PER_SEC as i128 / SAMPLE_RATE as i128;

        let anchor_local_ns = clock.master_to_local_ns(data.network_time_ns) as i128;

        Some((anchor_local_ns + elapsed_ns) as i64)
    }

    pub fn teardown(&self) {
        let mut slots = self.slots.lock().expect("anchor mutex poisoned");
        *slots = Slots::default();
    }
}

#[cfg(test)]
mod test {
    use super::*;

    const SEC: u64 = NANOS_PER_SEC;

    fn update(clock_id: u64, rtp_time: u64, secs: u64) -> AnchorUpdate {
        AnchorUpdate {
            rate: 1,
            clock_id,
            secs,
            frac: 0,
            flags: 0,
            rtp_time,
        }
    }

    fn master(clock_id: u64) -> ClockInfo {
        ClockInfo {
            master_id: clock_id,
            ..ClockInfo::default()
        }
    }

    #[test]
    fn network_time_combines_secs_and_frac() {
        let half_second = AnchorUpdate {
            frac: 0x8000_0000_0000_0000,
            secs: 2,
            ..AnchorUpdate::default()
        };
        assert_eq!(2 * SEC + SEC / 2, half_second.network_time_ns());
    }

    #[test]
    fn first_anchor_is_immediately_valid() {
        let anchor = Anchor::new();
        anchor.save_at(update(1, 0, 100), SEC);
        let data = anchor.get_at(SEC);
        assert!(data.valid);
        assert!(data.playing());
    }

    #[test]
    fn zero_clock_id_is_not_playable() {
        let anchor = Anchor::new();
        anchor.save_at(update(0, 0, 100), SEC);
        assert!(!anchor.get_at(SEC).ok());
        assert!(
            anchor
                .frame_local_time_at(0, &master(0), SEC)
                .is_none()
        );
    }

    #[test]
    fn equal_tuple_is_idempotent() {
        let anchor = Anchor::new();
        anchor.save_at(update(1, 4096, 100), SEC);
        let before = anchor.get_at(SEC);
        anchor.save_at(update(1, 4096, 100), 2 * SEC);
        let after = anchor.get_at(2 * SEC);
        assert_eq!(before.rtp_time, after.rtp_time);
        assert_eq!(before.network_time_ns, after.network_time_ns);
        assert!(after.valid);
    }

    #[test]
    fn same_clock_updates_in_place() {
        let anchor = Anchor::new();
        anchor.save_at(update(1, 0, 100), SEC);
        anchor.save_at(update(1, 44_100, 101), 2 * SEC);
        let data = anchor.get_at(2 * SEC);
        assert_eq!(44_100, data.rtp_time);
        assert!(data.valid);
    }

    #[test]
    fn quick_clock_changes_invalidate_until_stable() {
        let anchor = Anchor::new();
        anchor.save_at(update(1, 0, 100), 10 * SEC);
        // second change 4.4 s after the first, too quick
        anchor.save_at(update(2, 0, 100), 10 * SEC + 44 * SEC / 10);
        assert!(!anchor.get_at(10 * SEC + 44 * SEC / 10).valid);

        // 5.1 s of stability later both LAST and RECENT are valid again
        let settled = 10 * SEC + 44 * SEC / 10 + 51 * SEC / 10;
        assert!(anchor.get_at(settled).valid);
        assert!(anchor.recent_at(settled).valid);
    }

    #[test]
    fn recent_becomes_valid_after_stability_window() {
        let anchor = Anchor::new();
        anchor.save_at(update(1, 0, 100), SEC);
        assert!(!anchor.recent_at(2 * SEC).valid);
        assert!(anchor.recent_at(SEC + STABILITY_WINDOW_NS).valid);
    }

    #[test]
    fn local_time_is_affine_in_frame_steps() {
        let anchor = Anchor::new();
        anchor.save_at(update(1, 0, 100), SEC);
        let clock = master(1);

        let now = SEC;
        let base = anchor
            .frame_local_time_at(0, &clock, now)
            .expect("anchor valid");

        let mut prev = base;
        for n in 1..=200u32 {
            let t = anchor
                .frame_local_time_at(n * 1024, &clock, now)
                .expect("anchor valid");
            let exact = 1024 * n as i128 * SEC as i128 / SAMPLE_RATE as i128;
            assert_eq!(base as i128 + exact, t as i128);
            let step = t - prev;
            assert!((23_219_954..=23_219_955).contains(&step));
            prev = t;
        }
    }

    #[test]
    fn rtp_timestamp_wrap_yields_positive_diff() {
        let anchor = Anchor::new();
        anchor.save_at(
            update(1, (u32::MAX - 511) as u64, 100),
            SEC,
        );
        let clock = master(1);

        let at_anchor = anchor
            .frame_local_time_at(u32::MAX - 511, &clock, SEC)
            .expect("anchor valid");
        let wrapped = anchor
            .frame_local_time_at(512, &clock, SEC)
            .expect("anchor valid");

        let expected = 1024i128 * SEC as i128 / SAMPLE_RATE as i128;
        assert_eq!(at_anchor as i128 + expected, wrapped as i128);
    }

    #[test]
    fn mismatched_master_clock_yields_none() {
        let anchor = Anchor::new();
        anchor.save_at(update(1, 0, 100), SEC);
        assert!(anchor.frame_local_time_at(0, &master(2), SEC).is_none());
    }

    #[test]
    fn master_offset_shifts_due_times() {
        let anchor = Anchor::new();
        anchor.save_at(update(1, 0, 100), SEC);

        let mut clock = master(1);
        clock.offset_local_to_master_ns = 1_000;

        let shifted = anchor
            .frame_local_time_at(0, &clock, SEC)
            .expect("anchor valid");
        assert_eq!(100 * SEC as i64 - 1_000, shifted);
    }
}
