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

//! The render loop.
//!
//! A single timer driven task walks the rack in rtp order. Each tick it
//! anchors the head frame on the local timeline and either drops it as
//! outdated, dispatches it to the active effect and the light bridge, or
//! schedules itself for just ahead of the frame's due time. Without a
//! master clock or a valid anchor it idles and retries.

use crate::{
    anchor::Anchor,
    clock::{ClockSource, NANOS_PER_MILLI, now_monotonic_ns},
    config::RenderConfig,
    desk::{
        DataSink,
        fx::Fx,
        msg::DataFrame,
    },
    error::RenderInternalResult,
    frame::{Frame, peaks::PeaksPair, rack::Rack, state::FrameState},
    monitoring::{Metric, Monitoring},
    utils::AverageCalculationBuffer,
};
use std::{
    sync::Arc,
    time::Duration,
};
use tokio::{select, time::sleep};
use tokio_graceful_shutdown::SubsystemHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// Poll interval while the clock or anchor are not usable.
const RETRY_WAIT: Duration = Duration::from_millis(10);

const FPS_WINDOW_NS: u64 = 1_000 * NANOS_PER_MILLI;

#[instrument(skip_all)]
pub async fn start_render<C, S>(
    clock: C,
    anchor: Arc<Anchor>,
    rack: Arc<Rack>,
    sink: S,
    fx: Box<dyn Fx>,
    config: RenderConfig,
    monitoring: Monitoring,
    shutdown_token: CancellationToken,
) -> RenderInternalResult<()>
where
    C: ClockSource,
    S: DataSink,
{
    let core = RenderCore::new(clock, anchor, rack, sink, fx, &config, monitoring);

    let subsystem_name = "render".to_owned();
    let subsystem = async move |s: &mut SubsystemHandle| {
        run(s, core).await;
        Ok::<(), std::convert::Infallible>(())
    };

    let mut app = crate::app::spawn_child_app(subsystem_name.clone(), subsystem, shutdown_token)?;
    crate::app::wait_for_start(subsystem_name, &mut app).await?;

    Ok(())
}

async fn run<C: ClockSource, S: DataSink>(subsys: &mut SubsystemHandle, mut core: RenderCore<C, S>) {
    info!("Render loop started (lead {} ms).", core.lead_ns / NANOS_PER_MILLI as i64);

    loop {
        let outcome = core.tick();

        let wait = match outcome {
            Tick::Wait(wait) => wait,
            Tick::Idle => RETRY_WAIT,
        };

        select! {
            _ = sleep(wait) => (),
            _ = core.rack.wait_nonempty(), if matches!(outcome, Tick::Idle) => (),
            _ = subsys.on_shutdown_requested() => break,
        }
    }

    info!("Render loop stopped.");
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Tick {
    /// Sleep this long before the next tick.
    Wait(Duration),
    /// Nothing racked, wake on the next commit.
    Idle,
}

struct RenderCore<C, S> {
    clock: C,
    anchor: Arc<Anchor>,
    rack: Arc<Rack>,
    sink: S,
    fx: Box<dyn Fx>,
    lead_ns: i64,
    monitoring: Monitoring,
    seq_num: u64,
    last_dispatched_rtp: Option<u32>,
    fps_count: u64,
    fps_mark_ns: u64,
    elapsed_avg: AverageCalculationBuffer<u64>,
}

impl<C: ClockSource, S: DataSink> RenderCore<C, S> {
    fn new(
        clock: C,
        anchor: Arc<Anchor>,
        rack: Arc<Rack>,
        sink: S,
        fx: Box<dyn Fx>,
        config: &RenderConfig,
        monitoring: Monitoring,
    ) -> Self {
        RenderCore {
            clock,
            anchor,
            rack,
            sink,
            fx,
            lead_ns: config.lead_ns as i64,
            monitoring,
            seq_num: 0,
            last_dispatched_rtp: None,
            fps_count: 0,
            fps_mark_ns: now_monotonic_ns(),
            elapsed_avg: AverageCalculationBuffer::new(vec![0u64; 44].into_boxed_slice()),
        }
    }

    /// One pass over the rack head: drops everything overdue, dispatches
    /// everything due and reports how long to sleep until there is more to
    /// do.
    fn tick(&mut self) -> Tick {
        let clock_info = match self.clock.info_no_wait() {
            Ok(it) => it,
            Err(e) => {
                debug!("No usable clock: {e}");
                self.report_no_clock_anchor();
                return Tick::Wait(RETRY_WAIT);
            }
        };

        if !self.anchor.play_enabled() {
            self.report_sync_wait();
            return Tick::Wait(RETRY_WAIT);
        }

        loop {
            let Some(head) = self.rack.head_frame() else {
                return Tick::Idle;
            };

            let Some(due_ns) = self.anchor.frame_local_time(head.rtp_ts, &clock_info) else {
                // anchor and elected master disagree
                self.report_no_clock_anchor();
                return Tick::Wait(RETRY_WAIT);
            };

            head.set_due_at_ns(due_ns);

            let now_ns = now_monotonic_ns() as i64;
            let diff_ns = due_ns - now_ns;

            if diff_ns < -self.lead_ns {
                head.set_state(FrameState::Outdated);
                self.report_outdated();
                debug!(
                    "Frame {} outdated by {} ms.",
                    head.rtp_ts,
                    -diff_ns / NANOS_PER_MILLI as i64
                );
                self.rack.consume_head();
                continue;
            }

            if diff_ns > self.lead_ns {
                head.set_state(FrameState::Future);
                let wait_ns = (diff_ns - self.lead_ns) as u64;
                self.report_timer_adjust(wait_ns);
                return Tick::Wait(Duration::from_nanos(wait_ns));
            }

            // inside the lead window
            self.dispatch(head, due_ns, now_ns);
        }
    }

    fn dispatch(&mut self, head: Arc<Frame>, due_ns: i64, tick_start_ns: i64) {
        if let Some(last) = self.last_dispatched_rtp {
            // the rack hands out frames in order; a stray earlier frame is
            // dropped rather than dispatched backwards
            if head.rtp_ts.wrapping_sub(last) as i32 <= 0 {
                warn!(
                    "Frame {} arrived behind already dispatched {last}, dropping it.",
                    head.rtp_ts
                );
                head.set_state(FrameState::Outdated);
                self.report_outdated();
                self.rack.consume_head();
                return;
            }
        }

        head.set_state(FrameState::Ready);

        let silence = PeaksPair::default();
        let peaks = head.peaks().unwrap_or(&silence);

        self.seq_num += 1;
        let mut out = DataFrame::new(self.seq_num);
        self.fx.execute(peaks, due_ns, &mut out);

        self.sink.send(out);

        head.set_state(FrameState::Rendered);
        self.last_dispatched_rtp = Some(head.rtp_ts);
        self.rack.consume_head();

        self.report_rendered();

        let elapsed = (now_monotonic_ns() as i64 - tick_start_ns).max(0) as u64;
        if let Some(average) = self.elapsed_avg.update(elapsed) {
            self.report_render_elapsed(average);
        }

        self.fps_count += 1;
        let now = now_monotonic_ns();
        if now.saturating_sub(self.fps_mark_ns) >= FPS_WINDOW_NS {
            self.report_fps();
            self.fps_count = 0;
            self.fps_mark_ns = now;
        }
    }
}

mod monitoring {
    use super::*;

    impl<C: ClockSource, S: DataSink> RenderCore<C, S> {
        pub(crate) fn report_no_clock_anchor(&mut self) {
            self.monitoring.count(Metric::NoClkAnc);
        }

        pub(crate) fn report_sync_wait(&mut self) {
            self.monitoring.count(Metric::SyncWait);
        }

        pub(crate) fn report_outdated(&mut self) {
            self.monitoring.count(Metric::Outdated);
        }

        pub(crate) fn report_timer_adjust(&mut self, wait_ns: u64) {
            self.monitoring.duration_ns(Metric::NextFrameWait, wait_ns);
            self.monitoring.duration_ns(Metric::FrameTimerAdjust, wait_ns);
        }

        pub(crate) fn report_rendered(&mut self) {
            self.monitoring.count(Metric::FramesRendered);
        }

        pub(crate) fn report_render_elapsed(&mut self, average_ns: u64) {
            self.monitoring.duration_ns(Metric::RenderElapsed, average_ns);
        }

        pub(crate) fn report_fps(&mut self) {
            self.monitoring.add(Metric::Fps, self.fps_count);
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{
        anchor::AnchorUpdate,
        clock::{ClockInfo, NANOS_PER_SEC},
        config::RackConfig,
        error::{ClockError, ClockResult},
        frame::{Frame, reel::Reel},
    };
    use std::sync::{Mutex, mpsc};

    struct TestClock(Option<ClockInfo>);

    impl ClockSource for TestClock {
        fn info_no_wait(&mut self) -> ClockResult<ClockInfo> {
            self.0.clone().ok_or(ClockError::NoMaster)
        }
    }

    struct ChannelSink(Mutex<mpsc::Sender<DataFrame>>);

    impl DataSink for ChannelSink {
        fn send(&self, frame: DataFrame) {
            self.0.lock().expect("sink mutex poisoned").send(frame).ok();
        }
    }

    fn racked(rack: &Rack, rtp_ts: &[u32]) {
        let mut reel = Reel::new(64);
        for ts in rtp_ts {
            let frame = Arc::new(Frame::for_test(*ts, ts / 1024));
            frame.attach_peaks(PeaksPair::default());
            assert!(reel.add(frame));
        }
        rack.commit(reel);
    }

    /// Anchor + clock pair that makes rtp 0 due `offset_ms` from now.
    fn anchored(offset_ms: i64) -> (Arc<Anchor>, ClockInfo) {
        let now = now_monotonic_ns();
        let network_time_ns = (now as i64 + offset_ms * NANOS_PER_MILLI as i64) as u64;

        let anchor = Arc::new(Anchor::new());
        anchor.save(AnchorUpdate {
            rate: 1,
            clock_id: 1,
            secs: network_time_ns / NANOS_PER_SEC,
            frac: (((network_time_ns % NANOS_PER_SEC) << 32) / NANOS_PER_SEC) << 32,
            flags: 0,
            rtp_time: 0,
        });

        let clock_info = ClockInfo {
            master_id: 1,
            ..ClockInfo::default()
        };

        (anchor, clock_info)
    }

    fn core(
        clock: Option<ClockInfo>,
        anchor: Arc<Anchor>,
        rack: Arc<Rack>,
        lead_ns: u64,
    ) -> (
        RenderCore<TestClock, ChannelSink>,
        mpsc::Receiver<DataFrame>,
    ) {
        let (tx, rx) = mpsc::channel();
        let core = RenderCore::new(
            TestClock(clock),
            anchor,
            rack,
            ChannelSink(Mutex::new(tx)),
            Box::new(crate::desk::fx::MajorPeak::default()),
            &RenderConfig { lead_ns },
            Monitoring::noop(),
        );
        (core, rx)
    }

    #[test]
    fn without_a_clock_the_loop_backs_off() {
        let rack = Rack::new(&RackConfig::default(), Monitoring::noop());
        racked(&rack, &[0]);
        let (anchor, _) = anchored(0);

        let (mut core, rx) = core(None, anchor, rack.clone(), 10_000_000);
        assert_eq!(Tick::Wait(RETRY_WAIT), core.tick());

        assert!(rx.try_recv().is_err());
        assert_eq!(1, rack.frames());
    }

    #[test]
    fn without_an_anchor_the_loop_waits_for_sync() {
        let rack = Rack::new(&RackConfig::default(), Monitoring::noop());
        racked(&rack, &[0]);

        let anchor = Arc::new(Anchor::new());
        let (mut core, rx) = core(
            Some(ClockInfo {
                master_id: 1,
                ..ClockInfo::default()
            }),
            anchor,
            rack,
            10_000_000,
        );

        assert_eq!(Tick::Wait(RETRY_WAIT), core.tick());
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn due_frames_dispatch_in_rtp_order() {
        let rack = Rack::new(&RackConfig::default(), Monitoring::noop());
        racked(&rack, &[0, 1024, 2048]);

        // all three frames fall inside a generous lead window
        let (anchor, clock_info) = anchored(20);
        let (mut core, rx) = core(Some(clock_info), anchor, rack.clone(), 80_000_000);

        let outcome = core.tick();
        assert_eq!(Tick::Idle, outcome);

        let dispatched: Vec<u64> = rx.try_iter().map(|f| f.seq_num).collect();
        assert_eq!(vec![1, 2, 3], dispatched);
        assert_eq!(0, rack.frames());
    }

    #[test]
    fn overdue_frames_are_dropped_not_dispatched() {
        let rack = Rack::new(&RackConfig::default(), Monitoring::noop());
        racked(&rack, &[0]);

        // due half a second ago, way beyond the lead window
        let (anchor, clock_info) = anchored(-500);
        let (mut core, rx) = core(Some(clock_info), anchor, rack.clone(), 10_000_000);

        assert_eq!(Tick::Idle, core.tick());
        assert!(rx.try_recv().is_err());
        assert_eq!(0, rack.frames());
    }

    #[test]
    fn future_frames_reschedule_the_timer() {
        let rack = Rack::new(&RackConfig::default(), Monitoring::noop());
        racked(&rack, &[0]);

        let (anchor, clock_info) = anchored(500);
        let (mut core, rx) = core(Some(clock_info), anchor, rack.clone(), 10_000_000);

        match core.tick() {
            Tick::Wait(wait) => {
                // roughly due minus lead
                assert!(wait > Duration::from_millis(400));
                assert!(wait < Duration::from_millis(500));
            }
            other => panic!("expected a timer wait, got {other:?}"),
        }

        assert!(rx.try_recv().is_err());
        assert_eq!(1, rack.frames());
    }

    #[test]
    fn mismatched_master_clock_blocks_rendering() {
        let rack = Rack::new(&RackConfig::default(), Monitoring::noop());
        racked(&rack, &[0]);

        let (anchor, mut clock_info) = anchored(0);
        clock_info.master_id = 2;

        let (mut core, rx) = core(Some(clock_info), anchor, rack.clone(), 10_000_000);
        assert_eq!(Tick::Wait(RETRY_WAIT), core.tick());
        assert!(rx.try_recv().is_err());
        assert_eq!(1, rack.frames());
    }
}
