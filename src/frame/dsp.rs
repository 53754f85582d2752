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

//! Peak extraction worker pool.
//!
//! Decoded frames are fanned out to a small pool of realtime threads, each
//! with its own FFT plans. Workers re-check the frame state between the
//! coarse processing steps so frames that were flushed or outdated while
//! queued are abandoned instead of burning worker time.

use crate::{
    config::DspConfig,
    frame::{
        CHANNELS, Frame, SAMPLES_PER_FRAME,
        fft::Fft,
        peaks::PeaksPair,
        state::FrameState,
    },
    utils::set_realtime_priority,
};
use crossbeam::channel;
use std::{sync::Arc, thread};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

pub struct DspJob {
    frame: Arc<Frame>,
    /// Completion channel back to the session that owns the frame.
    done: mpsc::Sender<u32>,
}

pub struct Dsp {
    jobs_tx: channel::Sender<DspJob>,
    workers: Vec<thread::JoinHandle<()>>,
}

impl Dsp {
    pub fn new(config: &DspConfig) -> Self {
        let (jobs_tx, jobs_rx) = channel::unbounded::<DspJob>();

        let worker_count = config.worker_count();
        info!("Starting {worker_count} DSP workers.");

        let mut workers = Vec::with_capacity(worker_count);
        for n in 0..worker_count {
            let jobs_rx = jobs_rx.clone();
            let worker = thread::Builder::new()
                .name(format!("pierre-dsp-{n}"))
                .spawn(move || worker_loop(jobs_rx));
            match worker {
                Ok(handle) => workers.push(handle),
                Err(e) => warn!("Could not spawn DSP worker {n}: {e}"),
            }
        }

        Dsp { jobs_tx, workers }
    }

    /// Queues a frame for peak extraction. The caller transitions it to
    /// `DspInProgress` before handing it over; anything else is skipped by
    /// the worker.
    pub fn process(&self, frame: Arc<Frame>, done: mpsc::Sender<u32>) {
        self.jobs_tx.send(DspJob { frame, done }).ok();
    }

    /// Drains the job queue and waits for all workers to finish.
    pub fn teardown(self) {
        drop(self.jobs_tx);
        for worker in self.workers {
            worker.join().ok();
        }
        info!("DSP pool stopped.");
    }
}

fn worker_loop(jobs_rx: channel::Receiver<DspJob>) {
    set_realtime_priority();

    let mut left_fft = Fft::new();
    let mut right_fft = Fft::new();

    while let Ok(job) = jobs_rx.recv() {
        process_job(&job, &mut left_fft, &mut right_fft);
        job.done.blocking_send(job.frame.rtp_ts).ok();
    }
}

fn process_job(job: &DspJob, left_fft: &mut Fft, right_fft: &mut Fft) {
    let frame = &job.frame;

    // frames can be flushed or outdated while queued
    if frame.state() != FrameState::DspInProgress {
        debug!("Skipping DSP for frame {} in state {}.", frame.rtp_ts, frame.state());
        return;
    }

    let Some(pcm) = frame.take_pcm() else {
        debug!("Frame {} queued without samples.", frame.rtp_ts);
        return;
    };

    let (mut left, mut right) = split_channels(&pcm);

    let left_peaks = left_fft.process(&mut left);

    // the left channel took processing time, re-check before the right
    if frame.state() != FrameState::DspInProgress {
        return;
    }

    let right_peaks = right_fft.process(&mut right);

    if frame.state() != FrameState::DspInProgress {
        return;
    }

    frame.attach_peaks(PeaksPair {
        left: left_peaks,
        right: right_peaks,
    });

    frame.transition(FrameState::DspInProgress, FrameState::DspComplete);
}

fn split_channels(pcm: &[i16]) -> (Vec<f32>, Vec<f32>) {
    let samples = SAMPLES_PER_FRAME as usize;
    let mut left = vec![0.0f32; samples];
    let mut right = vec![0.0f32; samples];

    for (i, pair) in pcm.chunks_exact(CHANNELS).take(samples).enumerate() {
        left[i] = pair[0] as f32;
        right[i] = pair[1] as f32;
    }

    (left, right)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::frame::SAMPLE_RATE;
    use std::f32::consts::TAU;

    fn stereo_sine(freq_hz: f32) -> Vec<i16> {
        let samples = SAMPLES_PER_FRAME as usize;
        let mut pcm = vec![0i16; samples * CHANNELS];
        for i in 0..samples {
            let value =
                (0.5 * i16::MAX as f32 * (TAU * freq_hz * i as f32 / SAMPLE_RATE as f32).sin())
                    as i16;
            pcm[2 * i] = value;
            pcm[2 * i + 1] = value;
        }
        pcm
    }

    #[tokio::test]
    async fn completed_frames_carry_peaks_for_both_channels() {
        let dsp = Dsp::new(&DspConfig {
            concurrency_factor: 0.1,
        });
        let (done_tx, mut done_rx) = mpsc::channel(4);

        let frame = Arc::new(Frame::for_test(1024, 1));
        frame.set_pcm(stereo_sine(1_000.0));
        frame.set_state(FrameState::DspInProgress);

        dsp.process(frame.clone(), done_tx);
        let completed = done_rx.recv().await.expect("completion");

        assert_eq!(1024, completed);
        assert_eq!(FrameState::DspComplete, frame.state());

        let peaks = frame.peaks().expect("peaks attached");
        assert!(!peaks.left.is_empty());
        assert!(!peaks.right.is_empty());

        dsp.teardown();
    }

    #[tokio::test]
    async fn flushed_frames_are_abandoned() {
        let dsp = Dsp::new(&DspConfig {
            concurrency_factor: 0.1,
        });
        let (done_tx, mut done_rx) = mpsc::channel(4);

        let frame = Arc::new(Frame::for_test(2048, 2));
        frame.set_pcm(stereo_sine(440.0));
        frame.set_state(FrameState::Flushed);

        dsp.process(frame.clone(), done_tx);
        done_rx.recv().await.expect("completion");

        assert_eq!(FrameState::Flushed, frame.state());
        assert!(frame.peaks().is_none());

        dsp.teardown();
    }
}
