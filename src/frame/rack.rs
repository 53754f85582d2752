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

//! The render queue: reels ordered by their first rtp timestamp.
//!
//! The rack has a single writer (the session spooler) and a single reader
//! (the render loop). Occupancy is mirrored into a watch channel, which
//! gives the spooler its back-pressure wait and the render loop its
//! non-empty wakeup without the two ever sharing the inner lock for long.

use crate::{
    config::RackConfig,
    frame::{FlushRequest, Frame, reel::Reel},
    monitoring::{Metric, Monitoring},
};
use std::{
    collections::VecDeque,
    sync::{Arc, Mutex},
};
use tokio::sync::watch;
use tracing::debug;

#[derive(Debug)]
pub struct Rack {
    inner: Mutex<RackInner>,
    occupancy_tx: watch::Sender<usize>,
    occupancy_rx: watch::Receiver<usize>,
    high_water: usize,
    low_water: usize,
    monitoring: Monitoring,
}

#[derive(Debug, Default)]
struct RackInner {
    reels: VecDeque<Reel>,
    frames: usize,
}

impl Rack {
    pub fn new(config: &RackConfig, monitoring: Monitoring) -> Arc<Self> {
        let (occupancy_tx, occupancy_rx) = watch::channel(0);
        Arc::new(Rack {
            inner: Mutex::new(RackInner::default()),
            occupancy_tx,
            occupancy_rx,
            high_water: config.high_water,
            low_water: config.low_water,
            monitoring,
        })
    }

    /// Commits a reel to the back of the rack. Reels normally arrive in
    /// timestamp order; an insert whose head collides with or precedes an
    /// already racked reel is recorded and sorted into place.
    pub fn commit(&self, reel: Reel) {
        if reel.empty() {
            return;
        }

        let mut inner = self.inner.lock().expect("rack mutex poisoned");

        let head = reel.first_rtp();
        let collision = inner
            .reels
            .iter()
            .any(|racked| racked.first_rtp() == head);
        if collision {
            self.monitoring.count(Metric::RackCollision);
        }

        inner.frames += reel.remaining();
        inner.reels.push_back(reel);
        self.monitoring.count(Metric::RackedReels);

        let frames = inner.frames;
        drop(inner);

        self.occupancy_tx.send_replace(frames);
    }

    /// The next frame the render loop should look at.
    pub fn head_frame(&self) -> Option<Arc<Frame>> {
        let mut inner = self.inner.lock().expect("rack mutex poisoned");

        while let Some(front) = inner.reels.front() {
            if front.empty() {
                let spent = inner.reels.pop_front();
                if let Some(spent) = spent {
                    debug!("Reel {:#x} spent.", spent.serial());
                }
                continue;
            }
            return inner.reels.front().and_then(|r| r.peek_next()).cloned();
        }

        None
    }

    /// Consumes the current head frame.
    pub fn consume_head(&self) -> Option<Arc<Frame>> {
        let mut inner = self.inner.lock().expect("rack mutex poisoned");

        while let Some(front) = inner.reels.front_mut() {
            if let Some(frame) = front.consume() {
                inner.frames -= 1;
                let frames = inner.frames;
                drop(inner);
                self.occupancy_tx.send_replace(frames);
                return Some(frame);
            }
            inner.reels.pop_front();
        }

        None
    }

    /// Applies a flush window across all racked reels, returns the number
    /// of reels affected.
    pub fn flush(&self, flush: &FlushRequest) -> usize {
        let mut inner = self.inner.lock().expect("rack mutex poisoned");

        let mut reels_affected = 0;
        let mut frames_flushed = 0;

        for reel in inner.reels.iter_mut() {
            let flushed = reel.flush(flush);
            if flushed > 0 {
                reels_affected += 1;
                frames_flushed += flushed;
            }
        }

        inner.reels.retain(|reel| !reel.empty());
        inner.frames -= frames_flushed;
        let frames = inner.frames;
        drop(inner);

        self.occupancy_tx.send_replace(frames);

        if reels_affected > 0 {
            self.monitoring.add(Metric::ReelsFlushed, reels_affected as u64);
            self.monitoring.add(Metric::Flushed, frames_flushed as u64);
            debug!("Flushed {frames_flushed} frames from {reels_affected} reels.");
        }

        reels_affected
    }

    pub fn frames(&self) -> usize {
        *self.occupancy_rx.borrow()
    }

    pub fn above_high_water(&self) -> bool {
        self.frames() >= self.high_water
    }

    /// Blocks the writer until the reader has drained the rack below the
    /// low-water mark.
    pub async fn wait_below_low_water(&self) {
        let low = self.low_water;
        let mut rx = self.occupancy_rx.clone();
        rx.wait_for(|frames| *frames < low).await.ok();
    }

    /// Blocks the reader until at least one frame is racked.
    pub async fn wait_nonempty(&self) {
        let mut rx = self.occupancy_rx.clone();
        rx.wait_for(|frames| *frames > 0).await.ok();
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn reel_at(first_frame: u32, frames: usize) -> Reel {
        let mut reel = Reel::new(64);
        for i in 0..frames {
            let rtp = (first_frame + i as u32) * 1024;
            assert!(reel.add(Arc::new(Frame::for_test(rtp, rtp / 1024))));
        }
        reel
    }

    fn rack() -> Arc<Rack> {
        Rack::new(&RackConfig::default(), Monitoring::noop())
    }

    #[test]
    fn head_frames_come_out_in_rtp_order() {
        let rack = rack();
        rack.commit(reel_at(0, 3));
        rack.commit(reel_at(3, 3));

        let mut last = None;
        while let Some(frame) = rack.head_frame() {
            if let Some(last) = last {
                assert!(frame.rtp_ts > last);
            }
            last = Some(frame.rtp_ts);
            rack.consume_head();
        }
        assert_eq!(Some(5 * 1024), last);
        assert_eq!(0, rack.frames());
    }

    #[test]
    fn occupancy_tracks_commits_and_consumption() {
        let rack = rack();
        assert_eq!(0, rack.frames());

        rack.commit(reel_at(0, 4));
        assert_eq!(4, rack.frames());

        rack.consume_head();
        assert_eq!(3, rack.frames());
    }

    #[test]
    fn flush_window_removes_frames_and_counts_reels() {
        let rack = rack();
        rack.commit(reel_at(0, 10)); // rtp 0..9*1024
        rack.commit(reel_at(10, 10)); // rtp 10*1024..19*1024

        let affected = rack.flush(&FlushRequest::Window {
            from_rtp: 5 * 1024,
            until_rtp: 12 * 1024,
        });

        assert_eq!(2, affected);
        assert_eq!(20 - 8, rack.frames());

        // render continues after the window
        let head = rack.head_frame().expect("head frame");
        assert_eq!(0, head.rtp_ts);
    }

    #[test]
    fn empty_reels_are_not_racked() {
        let rack = rack();
        rack.commit(Reel::new(8));
        assert_eq!(0, rack.frames());
        assert!(rack.head_frame().is_none());
    }

    #[test]
    fn high_water_mark_is_inclusive() {
        let config = RackConfig {
            high_water: 4,
            low_water: 2,
            ..RackConfig::default()
        };
        let rack = Rack::new(&config, Monitoring::noop());
        rack.commit(reel_at(0, 4));
        assert!(rack.above_high_water());
        rack.consume_head();
        assert!(!rack.above_high_water());
    }
}
