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

use std::{
    fmt::Debug,
    iter::Sum,
    ops::{Add, Div},
};
use thread_priority::{
    RealtimeThreadSchedulePolicy, ThreadPriority, ThreadSchedulePolicy,
    set_thread_priority_and_policy, thread_native_id,
};
use tracing::{info, warn};

pub trait GetAverage<T> {
    fn average(&self) -> T;
}

impl<N, S> GetAverage<N> for S
where
    N: Copy + TryFrom<usize, Error: Debug> + Add + Div<Output = N> + Sum<N>,
    S: AsRef<[N]>,
{
    fn average(&self) -> N {
        let slice = self.as_ref();
        slice.iter().map(ToOwned::to_owned).sum::<N>()
            / N::try_from(slice.len()).expect("cannot cast slice length to value type")
    }
}

/// Ring buffer that yields the average of its contents every time it fills
/// up, used to smooth per-tick timing metrics before they are reported.
pub struct AverageCalculationBuffer<N> {
    buffer: Box<[N]>,
    cursor: usize,
}

impl<N> AverageCalculationBuffer<N>
where
    Box<[N]>: GetAverage<N>,
{
    pub fn new(buffer: Box<[N]>) -> Self {
        Self { buffer, cursor: 0 }
    }

    pub fn update(&mut self, value: N) -> Option<N> {
        self.buffer[self.cursor] = value;
        self.cursor += 1;
        if self.cursor >= self.buffer.len() {
            self.cursor = 0;
            let average = self.buffer.average();
            Some(average)
        } else {
            None
        }
    }
}

pub fn set_realtime_priority() {
    let pid = thread_native_id();
    if let Err(e) = set_thread_priority_and_policy(
        pid,
        ThreadPriority::Max,
        ThreadSchedulePolicy::Realtime(RealtimeThreadSchedulePolicy::Fifo),
    ) {
        warn!("Could not set thread priority: {e}");
    } else {
        info!("Successfully set real time priority for thread {pid}.");
    }
}
