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
    fmt::{self, Display},
    sync::atomic::{AtomicU8, Ordering},
};

/// Lifecycle of an audio frame.
///
/// The discriminants are ordered by ability to render; do not reorder them.
/// Transitions are monotonic except for the flush/outdate paths, which may
/// pull a frame out of the pipeline at any point.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum FrameState {
    None = 0,
    NoSharedKey,
    DecipherFail,
    ParseFail,
    DecodeFail,
    HeaderParsed,
    Flushed,
    Outdated,
    Rendered,
    Deciphered,
    DspInProgress,
    /// Divider between renderable and not.
    CanRender,
    DspComplete,
    Ready,
    Future,
}

impl FrameState {
    pub fn can_render(&self) -> bool {
        *self > FrameState::CanRender
    }

    pub fn failure(&self) -> bool {
        matches!(
            self,
            FrameState::NoSharedKey
                | FrameState::DecipherFail
                | FrameState::ParseFail
                | FrameState::DecodeFail
        )
    }

    pub fn name(&self) -> &'static str {
        match self {
            FrameState::None => "NONE",
            FrameState::NoSharedKey => "NO_SHARED_KEY",
            FrameState::DecipherFail => "DECIPHER_FAIL",
            FrameState::ParseFail => "PARSE_FAIL",
            FrameState::DecodeFail => "DECODE_FAIL",
            FrameState::HeaderParsed => "HEADER_PARSED",
            FrameState::Flushed => "FLUSHED",
            FrameState::Outdated => "OUTDATED",
            FrameState::Rendered => "RENDERED",
            FrameState::Deciphered => "DECIPHERED",
            FrameState::DspInProgress => "DSP_IN_PROGRESS",
            FrameState::CanRender => "CAN_RENDER",
            FrameState::DspComplete => "DSP_COMPLETE",
            FrameState::Ready => "READY",
            FrameState::Future => "FUTURE",
        }
    }

    fn from_u8(val: u8) -> FrameState {
        match val {
            1 => FrameState::NoSharedKey,
            2 => FrameState::DecipherFail,
            3 => FrameState::ParseFail,
            4 => FrameState::DecodeFail,
            5 => FrameState::HeaderParsed,
            6 => FrameState::Flushed,
            7 => FrameState::Outdated,
            8 => FrameState::Rendered,
            9 => FrameState::Deciphered,
            10 => FrameState::DspInProgress,
            11 => FrameState::CanRender,
            12 => FrameState::DspComplete,
            13 => FrameState::Ready,
            14 => FrameState::Future,
            _ => FrameState::None,
        }
    }
}

impl Display for FrameState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Atomic holder of a frame's state, shared between the session intake, the
/// DSP workers and the render loop.
#[derive(Debug)]
pub struct StateCell(AtomicU8);

impl StateCell {
    pub fn new(state: FrameState) -> Self {
        StateCell(AtomicU8::new(state as u8))
    }

    pub fn load(&self) -> FrameState {
        FrameState::from_u8(self.0.load(Ordering::Acquire))
    }

    pub fn store(&self, state: FrameState) {
        self.0.store(state as u8, Ordering::Release);
    }

    /// Transitions `expected -> state`, leaving the cell untouched when some
    /// other actor got there first. Returns whether the transition happened.
    pub fn store_if_equal(&self, expected: FrameState, state: FrameState) -> bool {
        self.0
            .compare_exchange(
                expected as u8,
                state as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }
}

impl Default for StateCell {
    fn default() -> Self {
        StateCell::new(FrameState::None)
    }
}
