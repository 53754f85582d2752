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

//! One audio frame: 1024 stereo samples worth of timeline, payload, derived
//! peaks and pipeline state, shared between the session intake, the DSP
//! workers and the render loop.

pub mod dsp;
pub mod fft;
pub mod peaks;
pub mod rack;
pub mod reel;
pub mod state;

use crate::frame::{
    peaks::PeaksPair,
    state::{FrameState, StateCell},
};
use rtp_rs::{RtpReader, RtpReaderError};
use std::sync::{
    Mutex, OnceLock,
    atomic::{AtomicI64, Ordering},
};

pub const SAMPLE_RATE: u32 = 44_100;
pub const SAMPLES_PER_FRAME: u32 = 1024;
pub const CHANNELS: usize = 2;

/// Playback duration of one frame on the local timeline.
pub const FRAME_NANOS: u64 =
    SAMPLES_PER_FRAME as u64 * crate::clock::NANOS_PER_SEC / SAMPLE_RATE as u64;

#[derive(Debug)]
pub struct Frame {
    pub rtp_ts: u32,
    pub seq: u32,
    pub ssrc: u32,
    pub sample_rate: u32,
    state: StateCell,
    payload: Mutex<Option<Vec<u8>>>,
    pcm: Mutex<Option<Vec<i16>>>,
    peaks: OnceLock<PeaksPair>,
    due_at_ns: AtomicI64,
}

impl Frame {
    /// Builds a frame from a deciphered audio packet (12 byte RTP header
    /// followed by the codec payload).
    pub fn from_packet(packet: &[u8]) -> Result<Frame, RtpReaderError> {
        let rtp = RtpReader::new(packet)?;

        let frame = Frame {
            rtp_ts: rtp.timestamp(),
            seq: u16::from(rtp.sequence_number()) as u32,
            ssrc: rtp.ssrc(),
            sample_rate: SAMPLE_RATE,
            state: StateCell::new(FrameState::HeaderParsed),
            payload: Mutex::new(Some(rtp.payload().to_vec())),
            pcm: Mutex::new(None),
            peaks: OnceLock::new(),
            due_at_ns: AtomicI64::new(0),
        };

        frame.state.store(FrameState::Deciphered);

        Ok(frame)
    }

    #[cfg(test)]
    pub(crate) fn for_test(rtp_ts: u32, seq: u32) -> Frame {
        Frame {
            rtp_ts,
            seq,
            ssrc: 0,
            sample_rate: SAMPLE_RATE,
            state: StateCell::new(FrameState::DspComplete),
            payload: Mutex::new(None),
            pcm: Mutex::new(None),
            peaks: OnceLock::new(),
            due_at_ns: AtomicI64::new(0),
        }
    }

    pub fn state(&self) -> FrameState {
        self.state.load()
    }

    pub fn set_state(&self, state: FrameState) {
        self.state.store(state);
    }

    /// CAS transition, used where multiple actors may race on the frame.
    pub fn transition(&self, expected: FrameState, state: FrameState) -> bool {
        self.state.store_if_equal(expected, state)
    }

    pub fn take_payload(&self) -> Option<Vec<u8>> {
        self.payload.lock().expect("frame mutex poisoned").take()
    }

    pub fn set_pcm(&self, pcm: Vec<i16>) {
        *self.pcm.lock().expect("frame mutex poisoned") = Some(pcm);
    }

    pub fn take_pcm(&self) -> Option<Vec<i16>> {
        self.pcm.lock().expect("frame mutex poisoned").take()
    }

    /// Attaches the DSP result. Peaks are write-once.
    pub fn attach_peaks(&self, peaks: PeaksPair) {
        self.peaks.set(peaks).ok();
    }

    pub fn peaks(&self) -> Option<&PeaksPair> {
        self.peaks.get()
    }

    pub fn set_due_at_ns(&self, due: i64) {
        self.due_at_ns.store(due, Ordering::Relaxed);
    }

    pub fn due_at_ns(&self) -> i64 {
        self.due_at_ns.load(Ordering::Relaxed)
    }
}

/// Flush window requested by the sender.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushRequest {
    All,
    Window { from_rtp: u32, until_rtp: u32 },
}

impl FlushRequest {
    pub fn matches(&self, rtp_ts: u32) -> bool {
        match self {
            FlushRequest::All => true,
            FlushRequest::Window { from_rtp, until_rtp } => {
                (*from_rtp..=*until_rtp).contains(&rtp_ts)
            }
        }
    }
}
