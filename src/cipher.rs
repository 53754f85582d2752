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

//! Per-session audio payload decryption.
//!
//! Audio packets arrive AEAD sealed: a 12 byte RTP header in the clear,
//! followed by the ciphertext, a 16 byte auth tag and an 8 byte nonce
//! trailer. The additional data is the middle 8 bytes of the RTP header
//! (timestamp and SSRC), the nonce is the trailer left padded with four
//! zero bytes. The session key comes out of the pairing handshake.

use crate::error::{CipherError, CipherResult};
use chacha20poly1305::{
    ChaCha20Poly1305, Key, Nonce, Tag,
    aead::{AeadInPlace, KeyInit},
};

pub const RTP_HEADER_LEN: usize = 12;
const TAG_LEN: usize = 16;
const NONCE_TRAILER_LEN: usize = 8;
const MIN_PACKET_LEN: usize = RTP_HEADER_LEN + TAG_LEN + NONCE_TRAILER_LEN;

const AAD_RANGE: std::ops::Range<usize> = 4..12;

pub struct SessionCipher {
    cipher: ChaCha20Poly1305,
}

impl SessionCipher {
    pub fn new(key: &[u8; 32]) -> Self {
        SessionCipher {
            cipher: ChaCha20Poly1305::new(Key::from_slice(key)),
        }
    }

    /// Decrypts one framed audio packet. Returns the cleartext packet, the
    /// 12 byte RTP header followed by the decoded payload.
    ///
    /// A failed authentication only loses this packet, the session and its
    /// key remain usable.
    pub fn decrypt_packet(&self, ciphered: &[u8]) -> CipherResult<Vec<u8>> {
        if ciphered.len() < MIN_PACKET_LEN {
            return Err(CipherError::ShortPacket(ciphered.len()));
        }

        let nonce_at = ciphered.len() - NONCE_TRAILER_LEN;
        let tag_at = nonce_at - TAG_LEN;

        let mut nonce_bytes = [0u8; 12];
        nonce_bytes[4..].copy_from_slice(&ciphered[nonce_at..]);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let tag = Tag::from_slice(&ciphered[tag_at..nonce_at]);
        let aad = &ciphered[AAD_RANGE];

        let mut cleartext = Vec::with_capacity(tag_at);
        cleartext.extend_from_slice(&ciphered[..RTP_HEADER_LEN]);
        cleartext.extend_from_slice(&ciphered[RTP_HEADER_LEN..tag_at]);

        self.cipher
            .decrypt_in_place_detached(nonce, aad, &mut cleartext[RTP_HEADER_LEN..], tag)
            .map_err(|_| CipherError::Aead)?;

        Ok(cleartext)
    }

    /// Mirrors the sender's sealing for round-trip tests and synthetic
    /// session traffic.
    #[cfg(test)]
    pub(crate) fn encrypt_packet(
        &self,
        cleartext: &[u8],
        nonce_trailer: &[u8; 8],
    ) -> CipherResult<Vec<u8>> {
        if cleartext.len() < RTP_HEADER_LEN {
            return Err(CipherError::ShortPacket(cleartext.len()));
        }

        let mut nonce_bytes = [0u8; 12];
        nonce_bytes[4..].copy_from_slice(nonce_trailer);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let mut ciphered = cleartext.to_vec();
        let (header, payload) = ciphered.split_at_mut(RTP_HEADER_LEN);

        let tag = self
            .cipher
            .encrypt_in_place_detached(nonce, &header[AAD_RANGE], payload)
            .map_err(|_| CipherError::Aead)?;

        ciphered.extend_from_slice(&tag);
        ciphered.extend_from_slice(nonce_trailer);

        Ok(ciphered)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use rand::RngCore;

    fn random_key() -> [u8; 32] {
        let mut key = [0u8; 32];
        rand::rng().fill_bytes(&mut key);
        key
    }

    fn cleartext_packet(payload_len: usize) -> Vec<u8> {
        let mut packet = vec![0u8; RTP_HEADER_LEN + payload_len];
        rand::rng().fill_bytes(&mut packet);
        packet[0] = 0x80;
        packet
    }

    #[test]
    fn seal_and_open_round_trips() {
        let cipher = SessionCipher::new(&random_key());
        let cleartext = cleartext_packet(480);

        let ciphered = cipher
            .encrypt_packet(&cleartext, &[1, 2, 3, 4, 5, 6, 7, 8])
            .expect("seal");
        assert_eq!(cleartext.len() + 24, ciphered.len());
        // header stays in the clear
        assert_eq!(cleartext[..RTP_HEADER_LEN], ciphered[..RTP_HEADER_LEN]);

        let opened = cipher.decrypt_packet(&ciphered).expect("open");
        assert_eq!(cleartext, opened);
    }

    #[test]
    fn corrupted_tag_fails_but_keeps_the_session_usable() {
        let cipher = SessionCipher::new(&random_key());
        let cleartext = cleartext_packet(64);

        let mut ciphered = cipher
            .encrypt_packet(&cleartext, &[9, 9, 9, 9, 9, 9, 9, 9])
            .expect("seal");

        let tag_at = ciphered.len() - 24;
        ciphered[tag_at] ^= 0xff;

        assert!(matches!(
            cipher.decrypt_packet(&ciphered),
            Err(CipherError::Aead)
        ));

        // the next packet decrypts fine
        let next = cipher
            .encrypt_packet(&cleartext, &[0, 0, 0, 0, 0, 0, 0, 1])
            .expect("seal");
        assert_eq!(cleartext, cipher.decrypt_packet(&next).expect("open"));
    }

    #[test]
    fn tampered_header_breaks_authentication() {
        let cipher = SessionCipher::new(&random_key());
        let cleartext = cleartext_packet(64);

        let mut ciphered = cipher
            .encrypt_packet(&cleartext, &[1, 1, 2, 2, 3, 3, 4, 4])
            .expect("seal");

        // timestamp bytes are part of the additional data
        ciphered[5] ^= 0x01;

        assert!(matches!(
            cipher.decrypt_packet(&ciphered),
            Err(CipherError::Aead)
        ));
    }

    #[test]
    fn short_packets_are_rejected_without_touching_the_cipher() {
        let cipher = SessionCipher::new(&random_key());
        assert!(matches!(
            cipher.decrypt_packet(&[0u8; 20]),
            Err(CipherError::ShortPacket(20))
        ));
    }
}
