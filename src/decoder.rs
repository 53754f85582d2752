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

//! AAC-ELD payload decoding.
//!
//! Each deciphered packet carries one raw AAC-ELD frame that decodes to
//! 1024 interleaved stereo samples at 44.1 kHz. The decoder is stateful and
//! owned by the session, packets must be fed in stream order.

use crate::{
    error::{DecodeError, DecodeResult},
    frame::{CHANNELS, SAMPLES_PER_FRAME},
};
use fdk_aac::dec::{Decoder, Transport};
use tracing::debug;

/// AudioSpecificConfig for AAC-ELD, 44.1 kHz, stereo, 480/1024 framing as
/// negotiated by the stream setup.
const ASC_ELD_44100_STEREO: [u8; 4] = [0xf8, 0xe8, 0x50, 0x00];

const SAMPLES_PER_PACKET: usize = SAMPLES_PER_FRAME as usize * CHANNELS;

pub struct AudioDecoder {
    decoder: Decoder,
    pcm: Vec<i16>,
}

impl AudioDecoder {
    pub fn new() -> DecodeResult<Self> {
        let mut decoder = Decoder::new(Transport::Raw);
        decoder
            .config_raw(&ASC_ELD_44100_STEREO)
            .map_err(|e| DecodeError::Decoder(format!("{e:?}")))?;

        Ok(AudioDecoder {
            decoder,
            pcm: vec![0i16; SAMPLES_PER_PACKET * 4],
        })
    }

    /// Decodes one payload into interleaved stereo samples.
    pub fn decode(&mut self, payload: &[u8]) -> DecodeResult<Vec<i16>> {
        let consumed = self
            .decoder
            .fill(payload)
            .map_err(|e| DecodeError::Decoder(format!("{e:?}")))?;
        if consumed < payload.len() {
            debug!(
                "Decoder left {} of {} payload bytes unconsumed.",
                payload.len() - consumed,
                payload.len()
            );
        }

        self.decoder
            .decode_frame(&mut self.pcm)
            .map_err(|e| DecodeError::Decoder(format!("{e:?}")))?;

        let decoded = self.decoder.decoded_frame_size();
        if decoded < SAMPLES_PER_PACKET {
            return Err(DecodeError::ShortOutput(decoded, SAMPLES_PER_PACKET));
        }

        Ok(self.pcm[..SAMPLES_PER_PACKET].to_vec())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn decoder_configures_for_eld() {
        assert!(AudioDecoder::new().is_ok());
    }

    #[test]
    fn empty_payloads_do_not_decode() {
        let mut decoder = AudioDecoder::new().expect("decoder");
        assert!(decoder.decode(&[]).is_err());
    }
}
