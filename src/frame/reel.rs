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

//! An ordered run of consecutive audio frames.

use crate::frame::{FlushRequest, Frame, SAMPLES_PER_FRAME, state::FrameState};
use std::sync::{
    Arc,
    atomic::{AtomicU64, Ordering},
};

static NEXT_SERIAL: AtomicU64 = AtomicU64::new(0x1000);

/// Frames with strictly increasing rtp timestamps, step one frame. Consumed
/// frames stay in place behind a cursor so consumption is O(1).
#[derive(Debug)]
pub struct Reel {
    serial: u64,
    max_frames: usize,
    consumed: usize,
    frames: Vec<Arc<Frame>>,
}

impl Reel {
    pub fn new(max_frames: usize) -> Self {
        Reel {
            serial: NEXT_SERIAL.fetch_add(1, Ordering::Relaxed),
            max_frames,
            consumed: 0,
            frames: Vec::with_capacity(max_frames),
        }
    }

    pub fn serial(&self) -> u64 {
        self.serial
    }

    /// Appends a frame. Fails when the reel is full or the frame does not
    /// continue the timestamp run.
    pub fn add(&mut self, frame: Arc<Frame>) -> bool {
        let mut rc = !self.full();

        if let Some(back) = self.frames.last() {
            rc &= frame.rtp_ts == back.rtp_ts.wrapping_add(SAMPLES_PER_FRAME);
        }

        if rc {
            self.frames.push(frame);
        }

        rc
    }

    pub fn full(&self) -> bool {
        self.frames.len() >= self.max_frames
    }

    pub fn empty(&self) -> bool {
        self.consumed >= self.frames.len()
    }

    /// Unconsumed frames left on the reel.
    pub fn remaining(&self) -> usize {
        self.frames.len() - self.consumed
    }

    pub fn peek_next(&self) -> Option<&Arc<Frame>> {
        self.frames.get(self.consumed)
    }

    pub fn peek_last(&self) -> Option<&Arc<Frame>> {
        if self.empty() {
            None
        } else {
            self.frames.last()
        }
    }

    /// First unconsumed timestamp; the rack orders reels by it.
    pub fn first_rtp(&self) -> Option<u32> {
        self.peek_next().map(|f| f.rtp_ts)
    }

    pub fn consume(&mut self) -> Option<Arc<Frame>> {
        let frame = self.frames.get(self.consumed).cloned()?;
        self.consumed += 1;
        Some(frame)
    }

    /// Applies a flush window to the reel, returns the number of frames
    /// flushed. A window covering the whole reel consumes it wholesale,
    /// a partial overlap drops exactly the matching frames.
    pub fn flush(&mut self, flush: &FlushRequest) -> usize {
        if self.empty() {
            return 0;
        }

        let first = self.peek_next().map(|f| f.rtp_ts);
        let last = self.peek_last().map(|f| f.rtp_ts);

        let whole = match (first, last) {
            (Some(first), Some(last)) => flush.matches(first) && flush.matches(last),
            _ => false,
        };

        if whole {
            let flushed = self.remaining();
            for frame in &self.frames[self.consumed..] {
                frame.set_state(FrameState::Flushed);
            }
            self.consumed = self.frames.len();
            return flushed;
        }

        let any_overlap = self.frames[self.consumed..]
            .iter()
            .any(|f| flush.matches(f.rtp_ts));
        if !any_overlap {
            return 0;
        }

        let mut kept = Vec::with_capacity(self.remaining());
        let mut flushed = 0;
        for frame in self.frames.drain(..).skip(self.consumed) {
            if flush.matches(frame.rtp_ts) {
                frame.set_state(FrameState::Flushed);
                flushed += 1;
            } else {
                kept.push(frame);
            }
        }

        self.frames = kept;
        self.consumed = 0;
        flushed
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn reel_with(rtp_ts: &[u32]) -> Reel {
        let mut reel = Reel::new(64);
        for (i, ts) in rtp_ts.iter().enumerate() {
            assert!(reel.add(Arc::new(Frame::for_test(*ts, i as u32))));
        }
        reel
    }

    #[test]
    fn serials_are_unique() {
        assert_ne!(Reel::new(4).serial(), Reel::new(4).serial());
    }

    #[test]
    fn frames_must_step_by_one_frame_of_samples() {
        let mut reel = Reel::new(4);
        assert!(reel.add(Arc::new(Frame::for_test(0, 0))));
        assert!(reel.add(Arc::new(Frame::for_test(1024, 1))));

        // gap: 3072 instead of 2048
        assert!(!reel.add(Arc::new(Frame::for_test(3072, 2))));
        assert!(reel.add(Arc::new(Frame::for_test(2048, 2))));

        for pair in reel.frames.windows(2) {
            assert_eq!(1024, pair[1].rtp_ts - pair[0].rtp_ts);
        }
    }

    #[test]
    fn a_full_reel_rejects_frames() {
        let mut reel = Reel::new(2);
        assert!(reel.add(Arc::new(Frame::for_test(0, 0))));
        assert!(reel.add(Arc::new(Frame::for_test(1024, 1))));
        assert!(reel.full());
        assert!(!reel.add(Arc::new(Frame::for_test(2048, 2))));
    }

    #[test]
    fn consume_walks_the_reel_in_order() {
        let mut reel = reel_with(&[0, 1024, 2048]);
        assert_eq!(3, reel.remaining());
        assert_eq!(0, reel.consume().expect("frame").rtp_ts);
        assert_eq!(1024, reel.consume().expect("frame").rtp_ts);
        assert_eq!(Some(2048), reel.first_rtp());
        assert_eq!(2048, reel.consume().expect("frame").rtp_ts);
        assert!(reel.empty());
        assert!(reel.consume().is_none());
    }

    #[test]
    fn whole_reel_flush_consumes_everything() {
        let mut reel = reel_with(&[0, 1024, 2048]);
        let flushed = reel.flush(&FlushRequest::All);
        assert_eq!(3, flushed);
        assert!(reel.empty());
    }

    #[test]
    fn partial_flush_drops_exactly_the_window() {
        let mut reel = reel_with(&[0, 1024, 2048, 3072]);
        let flushed = reel.flush(&FlushRequest::Window {
            from_rtp: 1024,
            until_rtp: 2048,
        });
        assert_eq!(2, flushed);
        assert_eq!(2, reel.remaining());
        assert_eq!(Some(0), reel.first_rtp());
        reel.consume();
        assert_eq!(Some(3072), reel.first_rtp());
    }

    #[test]
    fn no_overlap_flush_is_a_no_op() {
        let mut reel = reel_with(&[0, 1024]);
        let flushed = reel.flush(&FlushRequest::Window {
            from_rtp: 10 * 1024,
            until_rtp: 20 * 1024,
        });
        assert_eq!(0, flushed);
        assert_eq!(2, reel.remaining());
    }

    #[test]
    fn flushed_frames_change_state() {
        let mut reel = reel_with(&[0, 1024]);
        let head = reel.peek_next().cloned().expect("frame");
        reel.flush(&FlushRequest::All);
        assert_eq!(FrameState::Flushed, head.state());
    }
}
