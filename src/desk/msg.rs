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

//! Wire format of the light bridge.
//!
//! Frames travel as a two byte big endian length prefix followed by one
//! MsgPack map. The map's final pair is `"ma": 828`; the peer scans for its
//! encoded form to find message boundaries, so the `ma` field must stay the
//! last field of [`DataFrame`]. (828 is the Commodore 64 cassette buffer
//! address, it has no meaning beyond being a recognizable magic number.)

use crate::error::DeskInternalResult;
use serde::Serialize;

pub const MSG_SENTINEL: u16 = 828;

/// MsgPack encoding of `"ma", 828`, the suffix of every complete message.
pub const SENTINEL_SUFFIX: [u8; 5] = [0x6d, 0x61, 0xcd, 0x03, 0x3c];

pub const MT_DATA: &str = "data";
pub const MT_SILENCE: &str = "silence";

/// One lighting data frame, produced per rendered audio frame.
#[derive(Debug, Clone, Serialize)]
pub struct DataFrame {
    pub seq_num: u64,
    pub mt: &'static str,
    pub silence: bool,
    pub left_freq: f32,
    pub left_mag: f32,
    pub right_freq: f32,
    pub right_mag: f32,
    /// Channel values for the head units.
    pub dmx: Vec<u8>,
    /// End of message sentinel, keep last.
    pub ma: u16,
}

impl DataFrame {
    pub fn new(seq_num: u64) -> Self {
        DataFrame {
            seq_num,
            mt: MT_DATA,
            silence: false,
            left_freq: 0.0,
            left_mag: 0.0,
            right_freq: 0.0,
            right_mag: 0.0,
            dmx: Vec::new(),
            ma: MSG_SENTINEL,
        }
    }

    pub fn silent(seq_num: u64) -> Self {
        DataFrame {
            mt: MT_SILENCE,
            silence: true,
            ..DataFrame::new(seq_num)
        }
    }
}

/// Encodes one frame including the length prefix.
pub fn encode(frame: &DataFrame) -> DeskInternalResult<Vec<u8>> {
    let body = rmp_serde::to_vec_named(frame)?;

    let mut wire = Vec::with_capacity(2 + body.len());
    wire.extend_from_slice(&(body.len() as u16).to_be_bytes());
    wire.extend_from_slice(&body);

    Ok(wire)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn encoded_frames_end_with_the_sentinel() {
        let wire = encode(&DataFrame::new(7)).expect("encode");
        assert!(wire.len() > SENTINEL_SUFFIX.len() + 2);
        assert_eq!(SENTINEL_SUFFIX, wire[wire.len() - SENTINEL_SUFFIX.len()..]);
    }

    #[test]
    fn length_prefix_covers_the_body() {
        let wire = encode(&DataFrame::silent(1)).expect("encode");
        let len = u16::from_be_bytes([wire[0], wire[1]]) as usize;
        assert_eq!(wire.len() - 2, len);
    }

    #[test]
    fn silence_frames_are_marked() {
        let frame = DataFrame::silent(3);
        assert!(frame.silence);
        assert_eq!(MT_SILENCE, frame.mt);
        assert_eq!(MSG_SENTINEL, frame.ma);
    }
}
