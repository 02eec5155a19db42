//! Per-direction record decryption.
//!
//! A [`TransportCodec`] owns one direction's cipher handle, MAC key and
//! sequence number. [`TransportCodec::decrypt_next_record`] is a pure
//! cursor over caller-buffered bytes: it either produces one record,
//! asks for more bytes, or reports an unrecoverable framing failure for
//! this direction. For the chained ciphers the decrypted first block is
//! cached so that a retry after `NeedMoreBytes` never re-derives
//! keystream state.

use std::convert::TryInto;

use crate::crypto::{CipherAlgorithm, DecryptCipher, MacAlgorithm, MacVerifier};
use crate::wire::MAX_PACKET_LEN;
use crate::Error;

/// One decrypted SSH record.
#[derive(Clone, Debug, PartialEq)]
pub struct DecryptedRecord {
    /// Sequence number the record was decrypted under.
    pub seqnr: u32,
    /// Message payload, starting at the message-code byte. When the
    /// authentication check failed on an AEAD cipher this holds the raw
    /// ciphertext instead.
    pub payload: Vec<u8>,
    pub padding_len: u8,
    /// MAC or authentication tag bytes as observed on the wire.
    pub mac: Vec<u8>,
    /// `Some(false)` flags a MAC/tag mismatch; `None` means the record
    /// carried no integrity data at all.
    pub mac_ok: Option<bool>,
    /// Total wire bytes this record consumed.
    pub consumed: usize,
}

/// Outcome of a decryption attempt. `NeedMoreBytes` is control flow,
/// not an error: the caller buffers and re-invokes.
#[derive(Debug)]
pub enum DecryptStatus {
    Decrypted(DecryptedRecord),
    NeedMoreBytes(usize),
    Fatal(Error),
}

#[derive(Debug)]
pub struct TransportCodec {
    cipher: DecryptCipher,
    mac: Option<MacVerifier>,
    seqnr: u32,
    /// Decrypted first cipher block, kept across `NeedMoreBytes` so the
    /// chained keystream is consumed exactly once per record.
    cached_first_block: Option<Vec<u8>>,
}

impl TransportCodec {
    /// The codec used before NEWKEYS: identity cipher, no MAC.
    pub fn plaintext() -> Self {
        TransportCodec {
            cipher: DecryptCipher::NoCipher,
            mac: None,
            seqnr: 0,
            cached_first_block: None,
        }
    }

    pub fn new(
        cipher_algorithm: CipherAlgorithm,
        key: &[u8],
        iv: &[u8],
        mac_algorithm: MacAlgorithm,
        mac_key: &[u8],
    ) -> Result<Self, Error> {
        let cipher = DecryptCipher::new(cipher_algorithm, key, iv)?;
        let mac = if cipher_algorithm.is_aead() || mac_algorithm == MacAlgorithm::NoMac {
            None
        } else {
            Some(MacVerifier::new(mac_algorithm, mac_key)?)
        };
        Ok(TransportCodec {
            cipher,
            mac,
            seqnr: 0,
            cached_first_block: None,
        })
    }

    pub fn cipher_algorithm(&self) -> CipherAlgorithm {
        self.cipher.algorithm()
    }

    pub fn seqnr(&self) -> u32 {
        self.seqnr
    }

    /// Trailing integrity bytes per record: AEAD tag or HMAC output.
    pub fn mac_len(&self) -> usize {
        let algorithm = self.cipher.algorithm();
        if algorithm.is_aead() {
            algorithm.tag_len()
        } else {
            self.mac.as_ref().map_or(0, |mac| mac.algorithm().mac_len())
        }
    }

    /// Swap in freshly derived keys after NEWKEYS. The sequence number
    /// continues uninterrupted unless strict KEX was negotiated, which
    /// resets it to zero.
    pub fn install(&mut self, new_codec: TransportCodec, strict_kex: bool) {
        let seqnr = if strict_kex { 0 } else { self.seqnr };
        *self = new_codec;
        self.seqnr = seqnr;
    }

    /// Count a record that was observed but not decrypted (frame-only
    /// mode still advances the AEAD record counter semantics).
    pub fn bump_seqnr(&mut self) {
        self.seqnr = self.seqnr.wrapping_add(1);
    }

    /// Smallest `packet_length` this cipher can produce.
    fn min_packet_len(&self) -> u32 {
        let algorithm = self.cipher.algorithm();
        if algorithm.is_aead() {
            // Length field is outside the padded region.
            algorithm.block_len() as u32
        } else {
            (algorithm.block_len() as u32).saturating_sub(4).max(5)
        }
    }

    /// Attempt to produce the next record from `buf`.
    ///
    /// `buf` must start exactly at a record boundary. The caller is
    /// responsible for buffering: on `NeedMoreBytes(n)` it re-invokes
    /// with the same start and at least `n` further bytes appended.
    pub fn decrypt_next_record(&mut self, buf: &[u8]) -> DecryptStatus {
        let algorithm = self.cipher.algorithm();
        let block_len = algorithm.block_len();
        let mac_len = self.mac_len();

        // Step 1: recover the packet length.
        let packet_len = if algorithm.length_in_clear() {
            if buf.len() < 4 {
                return DecryptStatus::NeedMoreBytes(4 - buf.len());
            }
            let first4: [u8; 4] = buf[..4].try_into().unwrap();
            match self.cipher.peek_packet_len(self.seqnr, &first4) {
                Some(len) => len,
                None => return DecryptStatus::Fatal(Error::OversizedLength(0)),
            }
        } else {
            if buf.len() < block_len {
                return DecryptStatus::NeedMoreBytes(block_len - buf.len());
            }
            if self.cached_first_block.is_none() {
                let mut first_block = buf[..block_len].to_vec();
                self.cipher.decrypt_blocks(&mut first_block);
                self.cached_first_block = Some(first_block);
            }
            let first_block = self.cached_first_block.as_ref().unwrap();
            u32::from_be_bytes(first_block[..4].try_into().unwrap())
        };

        // Step 2: length sanity. A wild value here almost always means
        // we are decrypting garbage (wrong keys, lost alignment).
        if packet_len < self.min_packet_len() || packet_len > MAX_PACKET_LEN {
            return DecryptStatus::Fatal(Error::OversizedLength(packet_len));
        }
        if !algorithm.length_in_clear() && (4 + packet_len as usize) % block_len != 0 {
            return DecryptStatus::Fatal(Error::OversizedLength(packet_len));
        }
        if algorithm.is_aead() && algorithm.length_in_clear() {
            let padded = packet_len as usize;
            if padded % algorithm.block_len() != 0 {
                return DecryptStatus::Fatal(Error::OversizedLength(packet_len));
            }
        }

        // Step 3: byte accounting including trailing MAC/tag.
        let total = 4 + packet_len as usize + mac_len;
        if buf.len() < total {
            return DecryptStatus::NeedMoreBytes(total - buf.len());
        }

        // Steps 4-5: decrypt and authenticate.
        let mac_bytes = buf[4 + packet_len as usize..total].to_vec();
        let (packet_body, mac_ok) = match algorithm {
            CipherAlgorithm::NoCipher => {
                let body = buf[4..4 + packet_len as usize].to_vec();
                let mac_ok = self
                    .mac
                    .as_ref()
                    .map(|mac| mac.verify(self.seqnr, &buf[..4 + packet_len as usize], &mac_bytes));
                (body, mac_ok)
            }
            CipherAlgorithm::Aes128Gcm | CipherAlgorithm::Aes256Gcm => {
                let first4: [u8; 4] = buf[..4].try_into().unwrap();
                let mut body = buf[4..4 + packet_len as usize].to_vec();
                let ok = self.cipher.open_gcm(&first4, &mut body, &mac_bytes);
                (body, Some(ok))
            }
            CipherAlgorithm::ChaCha20Poly1305 => {
                let first4: [u8; 4] = buf[..4].try_into().unwrap();
                let mut body = buf[4..4 + packet_len as usize].to_vec();
                let ok = self
                    .cipher
                    .open_chapoly(self.seqnr, &first4, &mut body, &mac_bytes);
                (body, Some(ok))
            }
            _ => {
                let mut plain = self.cached_first_block.take().unwrap();
                let mut rest = buf[block_len..4 + packet_len as usize].to_vec();
                self.cipher.decrypt_blocks(&mut rest);
                plain.extend_from_slice(&rest);
                let mac_ok = self
                    .mac
                    .as_ref()
                    .map(|mac| mac.verify(self.seqnr, &plain, &mac_bytes));
                (plain[4..].to_vec(), mac_ok)
            }
        };

        // Step 6: split padding from payload. When an AEAD tag failed
        // the body is still ciphertext, so keep it whole for display.
        let authenticated = mac_ok != Some(false);
        let (payload, padding_len) = if authenticated {
            let padding_len = packet_body[0];
            let payload_len = packet_len as usize - 1;
            if usize::from(padding_len) > payload_len {
                return DecryptStatus::Fatal(Error::OversizedLength(packet_len));
            }
            (
                packet_body[1..1 + payload_len - usize::from(padding_len)].to_vec(),
                padding_len,
            )
        } else {
            (packet_body, 0)
        };

        let record = DecryptedRecord {
            seqnr: self.seqnr,
            payload,
            padding_len,
            mac: mac_bytes,
            mac_ok,
            consumed: total,
        };

        // Step 7: advance per-record state.
        self.seqnr = self.seqnr.wrapping_add(1);
        self.cached_first_block = None;
        DecryptStatus::Decrypted(record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aes::cipher::generic_array::GenericArray;
    use aes::cipher::{KeyIvInit, StreamCipher};
    use hmac::Mac;

    type Aes128Ctr = ctr::Ctr128BE<aes::Aes128>;
    type HmacSha256 = hmac::Hmac<sha2::Sha256>;

    const KEY: [u8; 16] = [0x42; 16];
    const IV: [u8; 16] = [0x24; 16];
    const MAC_KEY: [u8; 32] = [0x77; 32];

    /// Build one encrypted aes128-ctr + hmac-sha2-256 record around the
    /// given payload, exactly as a sender would.
    fn seal_ctr_record(seqnr: u32, payload: &[u8], encryptor: &mut Aes128Ctr) -> Vec<u8> {
        let block = 16usize;
        let mut padding_len = block - ((4 + 1 + payload.len()) % block);
        if padding_len < 4 {
            padding_len += block;
        }
        let packet_len = (1 + payload.len() + padding_len) as u32;

        let mut plain = Vec::new();
        plain.extend_from_slice(&packet_len.to_be_bytes());
        plain.push(padding_len as u8);
        plain.extend_from_slice(payload);
        plain.extend_from_slice(&vec![0xeeu8; padding_len]);

        let mut mac = HmacSha256::new_from_slice(&MAC_KEY).unwrap();
        mac.update(&seqnr.to_be_bytes());
        mac.update(&plain);
        let tag = mac.finalize().into_bytes();

        let mut wire = plain;
        encryptor.apply_keystream(&mut wire);
        wire.extend_from_slice(&tag);
        wire
    }

    fn ctr_codec() -> TransportCodec {
        TransportCodec::new(
            CipherAlgorithm::Aes128Ctr,
            &KEY,
            &IV,
            MacAlgorithm::HmacSha256,
            &MAC_KEY,
        )
        .unwrap()
    }

    #[test]
    fn test_ctr_known_record_decrypts() {
        let mut encryptor = Aes128Ctr::new(
            GenericArray::from_slice(&KEY),
            GenericArray::from_slice(&IV),
        );
        let payload = b"\x15test-payload";
        let wire = seal_ctr_record(0, payload, &mut encryptor);
        let mut codec = ctr_codec();
        match codec.decrypt_next_record(&wire) {
            DecryptStatus::Decrypted(record) => {
                assert_eq!(record.payload, payload);
                assert_eq!(record.mac_ok, Some(true));
                assert_eq!(record.seqnr, 0);
                assert_eq!(record.consumed, wire.len());
            }
            other => panic!("expected record, got {:?}", other),
        }
        assert_eq!(codec.seqnr(), 1);
    }

    #[test]
    fn test_split_feed_equals_single_feed() {
        let mut encryptor = Aes128Ctr::new(
            GenericArray::from_slice(&KEY),
            GenericArray::from_slice(&IV),
        );
        let payload = b"\x15fragmented-record-payload";
        let wire = seal_ctr_record(0, payload, &mut encryptor);

        let mut whole = ctr_codec();
        let expected = match whole.decrypt_next_record(&wire) {
            DecryptStatus::Decrypted(record) => record,
            other => panic!("expected record, got {:?}", other),
        };

        let mut split = ctr_codec();
        // First only the length and padding-length bytes: under a
        // 16-byte block that is not even one block, so the needed count
        // goes to the block boundary first.
        match split.decrypt_next_record(&wire[..5]) {
            DecryptStatus::NeedMoreBytes(n) => assert_eq!(n, 11),
            other => panic!("expected NeedMoreBytes, got {:?}", other),
        }
        // One full block: length becomes known, the remainder is owed.
        match split.decrypt_next_record(&wire[..16]) {
            DecryptStatus::NeedMoreBytes(n) => assert_eq!(n, wire.len() - 16),
            other => panic!("expected NeedMoreBytes, got {:?}", other),
        }
        match split.decrypt_next_record(&wire) {
            DecryptStatus::Decrypted(record) => assert_eq!(record, expected),
            other => panic!("expected record, got {:?}", other),
        }
    }

    #[test]
    fn test_two_records_sequence() {
        let mut encryptor = Aes128Ctr::new(
            GenericArray::from_slice(&KEY),
            GenericArray::from_slice(&IV),
        );
        let first = seal_ctr_record(0, b"\x15first", &mut encryptor);
        let second = seal_ctr_record(1, b"\x5ezz", &mut encryptor);
        let mut codec = ctr_codec();
        let mut stream = first.clone();
        stream.extend_from_slice(&second);

        match codec.decrypt_next_record(&stream) {
            DecryptStatus::Decrypted(record) => {
                assert_eq!(record.payload, b"\x15first");
                assert_eq!(record.consumed, first.len());
            }
            other => panic!("{:?}", other),
        }
        match codec.decrypt_next_record(&stream[first.len()..]) {
            DecryptStatus::Decrypted(record) => {
                assert_eq!(record.payload, b"\x5ezz");
                assert_eq!(record.mac_ok, Some(true));
                assert_eq!(record.seqnr, 1);
            }
            other => panic!("{:?}", other),
        }
    }

    #[test]
    fn test_mac_mismatch_is_recoverable() {
        let mut encryptor = Aes128Ctr::new(
            GenericArray::from_slice(&KEY),
            GenericArray::from_slice(&IV),
        );
        let mut wire = seal_ctr_record(0, b"\x15payload", &mut encryptor);
        let last = wire.len() - 1;
        wire[last] ^= 0xff;
        let mut codec = ctr_codec();
        match codec.decrypt_next_record(&wire) {
            DecryptStatus::Decrypted(record) => {
                assert_eq!(record.mac_ok, Some(false));
            }
            other => panic!("mac mismatch must not be fatal: {:?}", other),
        }
        // The stream stays aligned for the next record.
        assert_eq!(codec.seqnr(), 1);
    }

    #[test]
    fn test_oversized_length_is_fatal() {
        // "none" cipher exposes the length directly.
        let mut codec = TransportCodec::plaintext();
        let mut wire = Vec::new();
        wire.extend_from_slice(&(MAX_PACKET_LEN + 1).to_be_bytes());
        wire.extend_from_slice(&[0u8; 64]);
        assert!(matches!(
            codec.decrypt_next_record(&wire),
            DecryptStatus::Fatal(Error::OversizedLength(_))
        ));
    }

    #[test]
    fn test_plaintext_newkeys_roundtrip() {
        // 21 = NEWKEYS: len 12 = padlen(1) + payload(1) + padding(10).
        let mut wire = Vec::new();
        wire.extend_from_slice(&12u32.to_be_bytes());
        wire.push(10);
        wire.push(21);
        wire.extend_from_slice(&[0u8; 10]);
        let mut codec = TransportCodec::plaintext();
        match codec.decrypt_next_record(&wire) {
            DecryptStatus::Decrypted(record) => {
                assert_eq!(record.payload, vec![21]);
                assert_eq!(record.mac_ok, None);
                assert_eq!(record.padding_len, 10);
            }
            other => panic!("{:?}", other),
        }
    }

    #[test]
    fn test_strict_kex_reset_on_install() {
        let mut codec = TransportCodec::plaintext();
        codec.bump_seqnr();
        codec.bump_seqnr();
        codec.install(ctr_codec(), false);
        assert_eq!(codec.seqnr(), 2);
        let mut codec = TransportCodec::plaintext();
        codec.bump_seqnr();
        codec.install(ctr_codec(), true);
        assert_eq!(codec.seqnr(), 0);
    }
}
