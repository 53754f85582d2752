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

//! Pipeline metrics.
//!
//! Every component reports counters and durations through a cheap clonable
//! [`Monitoring`] handle. Reporting never blocks the pipeline: events go
//! through a bounded channel with `try_send` and are silently dropped when
//! the stats subsystem cannot keep up. Aggregation and the optional
//! time-series sink live in the stats actor.

mod stats;

pub use stats::start_stats;

use tokio::sync::mpsc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Metric {
    NoClkAnc,
    SyncWait,
    NoConn,
    DecipherFail,
    ParseFail,
    DecodeFail,
    Outdated,
    Flushed,
    FramesRendered,
    Fps,
    NextFrameWait,
    FrameTimerAdjust,
    RenderElapsed,
    RackCollision,
    RackWipIncomplete,
    RackWipTimeout,
    RackedReels,
    ReelsFlushed,
    RemoteDmxQsf,
    RemoteDmxQrf,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricKind {
    Counter,
    Duration,
}

impl MetricKind {
    pub fn name(&self) -> &'static str {
        match self {
            MetricKind::Counter => "counter",
            MetricKind::Duration => "duration",
        }
    }
}

impl Metric {
    pub fn name(&self) -> &'static str {
        match self {
            Metric::NoClkAnc => "NO_CLK_ANC",
            Metric::SyncWait => "SYNC_WAIT",
            Metric::NoConn => "NO_CONN",
            Metric::DecipherFail => "DECIPHER_FAIL",
            Metric::ParseFail => "PARSE_FAIL",
            Metric::DecodeFail => "DECODE_FAIL",
            Metric::Outdated => "OUTDATED",
            Metric::Flushed => "FLUSHED",
            Metric::FramesRendered => "FRAMES_RENDERED",
            Metric::Fps => "FPS",
            Metric::NextFrameWait => "NEXT_FRAME_WAIT",
            Metric::FrameTimerAdjust => "FRAME_TIMER_ADJUST",
            Metric::RenderElapsed => "RENDER_ELAPSED",
            Metric::RackCollision => "RACK_COLLISION",
            Metric::RackWipIncomplete => "RACK_WIP_INCOMPLETE",
            Metric::RackWipTimeout => "RACK_WIP_TIMEOUT",
            Metric::RackedReels => "RACKED_REELS",
            Metric::ReelsFlushed => "REELS_FLUSHED",
            Metric::RemoteDmxQsf => "REMOTE_DMX_QSF",
            Metric::RemoteDmxQrf => "REMOTE_DMX_QRF",
        }
    }

    pub fn kind(&self) -> MetricKind {
        match self {
            Metric::NextFrameWait | Metric::FrameTimerAdjust | Metric::RenderElapsed => {
                MetricKind::Duration
            }
            _ => MetricKind::Counter,
        }
    }
}

#[derive(Debug, Clone)]
pub enum MonitoringEvent {
    Count(Metric, u64),
    Duration(Metric, u64),
}

#[derive(Debug, Clone)]
pub struct Monitoring {
    tx: Option<mpsc::Sender<MonitoringEvent>>,
}

impl Monitoring {
    pub(crate) fn new(tx: mpsc::Sender<MonitoringEvent>) -> Self {
        Monitoring { tx: Some(tx) }
    }

    /// A handle that swallows all events, for tests and teardown paths.
    pub fn noop() -> Self {
        Monitoring { tx: None }
    }

    pub fn count(&self, metric: Metric) {
        self.add(metric, 1);
    }

    pub fn add(&self, metric: Metric, value: u64) {
        if let Some(tx) = &self.tx {
            tx.try_send(MonitoringEvent::Count(metric, value)).ok();
        }
    }

    pub fn duration_ns(&self, metric: Metric, nanos: u64) {
        if let Some(tx) = &self.tx {
            tx.try_send(MonitoringEvent::Duration(metric, nanos)).ok();
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn metric_names_are_stable() {
        assert_eq!("NO_CLK_ANC", Metric::NoClkAnc.name());
        assert_eq!("REMOTE_DMX_QSF", Metric::RemoteDmxQsf.name());
        assert_eq!("REELS_FLUSHED", Metric::ReelsFlushed.name());
    }

    #[test]
    fn durations_are_typed_as_durations() {
        assert_eq!(MetricKind::Duration, Metric::RenderElapsed.kind());
        assert_eq!(MetricKind::Duration, Metric::NextFrameWait.kind());
        assert_eq!(MetricKind::Counter, Metric::Outdated.kind());
    }

    #[test]
    fn noop_handle_swallows_events() {
        let monitoring = Monitoring::noop();
        monitoring.count(Metric::Outdated);
        monitoring.duration_ns(Metric::RenderElapsed, 100);
    }
}
