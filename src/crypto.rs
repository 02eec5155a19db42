//! Cipher and MAC identities plus the stateful decryption handles used
//! by the transport codec.
//!
//! All primitives come from the RustCrypto crates; this module only
//! adds the SSH-specific plumbing: the per-record GCM invocation
//! counter, the two-key ChaCha20 construction of
//! `chacha20-poly1305@openssh.com`, and HMAC-over-sequence-number
//! verification.

use std::convert::TryInto;
use std::fmt;

use aes::cipher::generic_array::GenericArray;
use aes::cipher::{Block, BlockDecryptMut, KeyIvInit, StreamCipher, StreamCipherSeek};
use aes::{Aes128, Aes192, Aes256};
use aes_gcm::aead::AeadInPlace;
use aes_gcm::{Aes128Gcm, Aes256Gcm, KeyInit};
use chacha20::ChaCha20Legacy;
use hmac::{Hmac, Mac};
use sha1::Sha1;
use sha2::{Sha256, Sha512};
use subtle::ConstantTimeEq;
use zeroize::Zeroize;

use crate::Error;

type Aes128Ctr = ctr::Ctr128BE<Aes128>;
type Aes192Ctr = ctr::Ctr128BE<Aes192>;
type Aes256Ctr = ctr::Ctr128BE<Aes256>;
type Aes128CbcDec = cbc::Decryptor<Aes128>;
type Aes192CbcDec = cbc::Decryptor<Aes192>;
type Aes256CbcDec = cbc::Decryptor<Aes256>;

/// Encryption algorithms the codec can handle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CipherAlgorithm {
    Aes128Ctr,
    Aes192Ctr,
    Aes256Ctr,
    Aes128Cbc,
    Aes192Cbc,
    Aes256Cbc,
    Aes128Gcm,
    Aes256Gcm,
    ChaCha20Poly1305,
    NoCipher,
}

impl CipherAlgorithm {
    pub fn name(self) -> &'static str {
        match self {
            CipherAlgorithm::Aes128Ctr => "aes128-ctr",
            CipherAlgorithm::Aes192Ctr => "aes192-ctr",
            CipherAlgorithm::Aes256Ctr => "aes256-ctr",
            CipherAlgorithm::Aes128Cbc => "aes128-cbc",
            CipherAlgorithm::Aes192Cbc => "aes192-cbc",
            CipherAlgorithm::Aes256Cbc => "aes256-cbc",
            CipherAlgorithm::Aes128Gcm => "aes128-gcm@openssh.com",
            CipherAlgorithm::Aes256Gcm => "aes256-gcm@openssh.com",
            CipherAlgorithm::ChaCha20Poly1305 => "chacha20-poly1305@openssh.com",
            CipherAlgorithm::NoCipher => "none",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "aes128-ctr" => Some(CipherAlgorithm::Aes128Ctr),
            "aes192-ctr" => Some(CipherAlgorithm::Aes192Ctr),
            "aes256-ctr" => Some(CipherAlgorithm::Aes256Ctr),
            "aes128-cbc" => Some(CipherAlgorithm::Aes128Cbc),
            "aes192-cbc" => Some(CipherAlgorithm::Aes192Cbc),
            "aes256-cbc" => Some(CipherAlgorithm::Aes256Cbc),
            "aes128-gcm@openssh.com" => Some(CipherAlgorithm::Aes128Gcm),
            "aes256-gcm@openssh.com" => Some(CipherAlgorithm::Aes256Gcm),
            "chacha20-poly1305@openssh.com" => Some(CipherAlgorithm::ChaCha20Poly1305),
            "none" => Some(CipherAlgorithm::NoCipher),
            _ => None,
        }
    }

    pub fn key_len(self) -> usize {
        match self {
            CipherAlgorithm::Aes128Ctr | CipherAlgorithm::Aes128Cbc | CipherAlgorithm::Aes128Gcm => {
                16
            }
            CipherAlgorithm::Aes192Ctr | CipherAlgorithm::Aes192Cbc => 24,
            CipherAlgorithm::Aes256Ctr | CipherAlgorithm::Aes256Cbc | CipherAlgorithm::Aes256Gcm => {
                32
            }
            // Two ChaCha20 keys: payload first, length field second.
            CipherAlgorithm::ChaCha20Poly1305 => 64,
            CipherAlgorithm::NoCipher => 0,
        }
    }

    pub fn iv_len(self) -> usize {
        match self {
            CipherAlgorithm::Aes128Ctr
            | CipherAlgorithm::Aes192Ctr
            | CipherAlgorithm::Aes256Ctr
            | CipherAlgorithm::Aes128Cbc
            | CipherAlgorithm::Aes192Cbc
            | CipherAlgorithm::Aes256Cbc => 16,
            CipherAlgorithm::Aes128Gcm | CipherAlgorithm::Aes256Gcm => 12,
            CipherAlgorithm::ChaCha20Poly1305 => 0,
            CipherAlgorithm::NoCipher => 0,
        }
    }

    /// The block size padding is aligned to: max(8, cipher block size).
    pub fn block_len(self) -> usize {
        match self {
            CipherAlgorithm::ChaCha20Poly1305 | CipherAlgorithm::NoCipher => 8,
            _ => 16,
        }
    }

    pub fn tag_len(self) -> usize {
        if self.is_aead() {
            16
        } else {
            0
        }
    }

    pub fn is_aead(self) -> bool {
        matches!(
            self,
            CipherAlgorithm::Aes128Gcm
                | CipherAlgorithm::Aes256Gcm
                | CipherAlgorithm::ChaCha20Poly1305
        )
    }

    /// Whether the 4-byte length field can be read without consuming
    /// chained cipher state. GCM sends it in the clear; the OpenSSH
    /// ChaCha20 construction encrypts it under a per-record key so it
    /// is recoverable statelessly.
    pub fn length_in_clear(self) -> bool {
        matches!(
            self,
            CipherAlgorithm::Aes128Gcm
                | CipherAlgorithm::Aes256Gcm
                | CipherAlgorithm::ChaCha20Poly1305
                | CipherAlgorithm::NoCipher
        )
    }
}

/// MAC algorithms for the non-AEAD ciphers.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MacAlgorithm {
    HmacSha256,
    HmacSha512,
    HmacSha1,
    NoMac,
}

impl MacAlgorithm {
    pub fn name(self) -> &'static str {
        match self {
            MacAlgorithm::HmacSha256 => "hmac-sha2-256",
            MacAlgorithm::HmacSha512 => "hmac-sha2-512",
            MacAlgorithm::HmacSha1 => "hmac-sha1",
            MacAlgorithm::NoMac => "none",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "hmac-sha2-256" => Some(MacAlgorithm::HmacSha256),
            "hmac-sha2-512" => Some(MacAlgorithm::HmacSha512),
            "hmac-sha1" => Some(MacAlgorithm::HmacSha1),
            "none" => Some(MacAlgorithm::NoMac),
            _ => None,
        }
    }

    pub fn key_len(self) -> usize {
        match self {
            MacAlgorithm::HmacSha256 => 32,
            MacAlgorithm::HmacSha512 => 64,
            MacAlgorithm::HmacSha1 => 20,
            MacAlgorithm::NoMac => 0,
        }
    }

    pub fn mac_len(self) -> usize {
        match self {
            MacAlgorithm::HmacSha256 => 32,
            MacAlgorithm::HmacSha512 => 64,
            MacAlgorithm::HmacSha1 => 20,
            MacAlgorithm::NoMac => 0,
        }
    }
}

/// HMAC computation and constant-time verification over
/// `sequence_number || plaintext packet`.
pub struct MacVerifier {
    algorithm: MacAlgorithm,
    key: Vec<u8>,
}

impl fmt::Debug for MacVerifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MacVerifier")
            .field("algorithm", &self.algorithm)
            .field("key", &"<redacted>")
            .finish()
    }
}

impl MacVerifier {
    pub fn new(algorithm: MacAlgorithm, key_material: &[u8]) -> Result<Self, Error> {
        if key_material.len() < algorithm.key_len() {
            return Err(Error::InvalidKeyLength(key_material.len()));
        }
        Ok(MacVerifier {
            algorithm,
            key: key_material[..algorithm.key_len()].to_vec(),
        })
    }

    pub fn algorithm(&self) -> MacAlgorithm {
        self.algorithm
    }

    /// HMAC over `seqnr || packet` where `packet` is the full plaintext
    /// packet including its length field.
    pub fn compute(&self, seqnr: u32, packet: &[u8]) -> Vec<u8> {
        match self.algorithm {
            MacAlgorithm::HmacSha256 => {
                let mut mac =
                    <Hmac<Sha256> as Mac>::new_from_slice(&self.key).expect("hmac accepts any key length");
                mac.update(&seqnr.to_be_bytes());
                mac.update(packet);
                mac.finalize().into_bytes().to_vec()
            }
            MacAlgorithm::HmacSha512 => {
                let mut mac =
                    <Hmac<Sha512> as Mac>::new_from_slice(&self.key).expect("hmac accepts any key length");
                mac.update(&seqnr.to_be_bytes());
                mac.update(packet);
                mac.finalize().into_bytes().to_vec()
            }
            MacAlgorithm::HmacSha1 => {
                let mut mac =
                    <Hmac<Sha1> as Mac>::new_from_slice(&self.key).expect("hmac accepts any key length");
                mac.update(&seqnr.to_be_bytes());
                mac.update(packet);
                mac.finalize().into_bytes().to_vec()
            }
            MacAlgorithm::NoMac => Vec::new(),
        }
    }

    /// Constant-time comparison against the received MAC bytes.
    pub fn verify(&self, seqnr: u32, packet: &[u8], received: &[u8]) -> bool {
        if self.algorithm == MacAlgorithm::NoMac {
            return received.is_empty();
        }
        let computed = self.compute(seqnr, packet);
        computed.len() == received.len() && bool::from(computed.ct_eq(received))
    }
}

impl Drop for MacVerifier {
    fn drop(&mut self) {
        self.key.zeroize();
    }
}

fn cbc_blocks<C: BlockDecryptMut>(dec: &mut C, data: &mut [u8]) {
    let block_size = C::block_size();
    for chunk in data.chunks_exact_mut(block_size) {
        dec.decrypt_block_mut(Block::<C>::from_mut_slice(chunk));
    }
}

/// A stateful decryption handle for one direction.
pub enum DecryptCipher {
    Ctr128(Box<Aes128Ctr>),
    Ctr192(Box<Aes192Ctr>),
    Ctr256(Box<Aes256Ctr>),
    Cbc128(Box<Aes128CbcDec>),
    Cbc192(Box<Aes192CbcDec>),
    Cbc256(Box<Aes256CbcDec>),
    Gcm128 { key: Box<Aes128Gcm>, iv: [u8; 12] },
    Gcm256 { key: Box<Aes256Gcm>, iv: [u8; 12] },
    ChaPoly { main: [u8; 32], length: [u8; 32] },
    NoCipher,
}

impl fmt::Debug for DecryptCipher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DecryptCipher({})", self.algorithm().name())
    }
}

impl DecryptCipher {
    /// Build a handle from derived key and IV material.
    pub fn new(algorithm: CipherAlgorithm, key: &[u8], iv: &[u8]) -> Result<Self, Error> {
        if key.len() < algorithm.key_len() || iv.len() < algorithm.iv_len() {
            return Err(Error::InvalidKeyLength(key.len()));
        }
        let key = &key[..algorithm.key_len()];
        let iv = &iv[..algorithm.iv_len()];
        Ok(match algorithm {
            CipherAlgorithm::Aes128Ctr => DecryptCipher::Ctr128(Box::new(Aes128Ctr::new(
                GenericArray::from_slice(key),
                GenericArray::from_slice(iv),
            ))),
            CipherAlgorithm::Aes192Ctr => DecryptCipher::Ctr192(Box::new(Aes192Ctr::new(
                GenericArray::from_slice(key),
                GenericArray::from_slice(iv),
            ))),
            CipherAlgorithm::Aes256Ctr => DecryptCipher::Ctr256(Box::new(Aes256Ctr::new(
                GenericArray::from_slice(key),
                GenericArray::from_slice(iv),
            ))),
            CipherAlgorithm::Aes128Cbc => DecryptCipher::Cbc128(Box::new(Aes128CbcDec::new(
                GenericArray::from_slice(key),
                GenericArray::from_slice(iv),
            ))),
            CipherAlgorithm::Aes192Cbc => DecryptCipher::Cbc192(Box::new(Aes192CbcDec::new(
                GenericArray::from_slice(key),
                GenericArray::from_slice(iv),
            ))),
            CipherAlgorithm::Aes256Cbc => DecryptCipher::Cbc256(Box::new(Aes256CbcDec::new(
                GenericArray::from_slice(key),
                GenericArray::from_slice(iv),
            ))),
            CipherAlgorithm::Aes128Gcm => {
                let mut iv_buf = [0u8; 12];
                iv_buf.copy_from_slice(iv);
                DecryptCipher::Gcm128 {
                    key: Box::new(Aes128Gcm::new(GenericArray::from_slice(key))),
                    iv: iv_buf,
                }
            }
            CipherAlgorithm::Aes256Gcm => {
                let mut iv_buf = [0u8; 12];
                iv_buf.copy_from_slice(iv);
                DecryptCipher::Gcm256 {
                    key: Box::new(Aes256Gcm::new(GenericArray::from_slice(key))),
                    iv: iv_buf,
                }
            }
            CipherAlgorithm::ChaCha20Poly1305 => {
                let mut main = [0u8; 32];
                let mut length = [0u8; 32];
                main.copy_from_slice(&key[..32]);
                length.copy_from_slice(&key[32..64]);
                DecryptCipher::ChaPoly { main, length }
            }
            CipherAlgorithm::NoCipher => DecryptCipher::NoCipher,
        })
    }

    pub fn algorithm(&self) -> CipherAlgorithm {
        match self {
            DecryptCipher::Ctr128(_) => CipherAlgorithm::Aes128Ctr,
            DecryptCipher::Ctr192(_) => CipherAlgorithm::Aes192Ctr,
            DecryptCipher::Ctr256(_) => CipherAlgorithm::Aes256Ctr,
            DecryptCipher::Cbc128(_) => CipherAlgorithm::Aes128Cbc,
            DecryptCipher::Cbc192(_) => CipherAlgorithm::Aes192Cbc,
            DecryptCipher::Cbc256(_) => CipherAlgorithm::Aes256Cbc,
            DecryptCipher::Gcm128 { .. } => CipherAlgorithm::Aes128Gcm,
            DecryptCipher::Gcm256 { .. } => CipherAlgorithm::Aes256Gcm,
            DecryptCipher::ChaPoly { .. } => CipherAlgorithm::ChaCha20Poly1305,
            DecryptCipher::NoCipher => CipherAlgorithm::NoCipher,
        }
    }

    /// Decrypt a run of whole cipher blocks in place, advancing the
    /// chained CTR keystream or CBC state. Only meaningful for the
    /// block/stream modes; AEAD modes use their own entry points.
    pub fn decrypt_blocks(&mut self, data: &mut [u8]) {
        match self {
            DecryptCipher::Ctr128(ctr) => ctr.apply_keystream(data),
            DecryptCipher::Ctr192(ctr) => ctr.apply_keystream(data),
            DecryptCipher::Ctr256(ctr) => ctr.apply_keystream(data),
            DecryptCipher::Cbc128(dec) => cbc_blocks(dec.as_mut(), data),
            DecryptCipher::Cbc192(dec) => cbc_blocks(dec.as_mut(), data),
            DecryptCipher::Cbc256(dec) => cbc_blocks(dec.as_mut(), data),
            _ => {}
        }
    }

    /// Recover the packet length of the next record without touching
    /// chained state. `None` when the cipher hides lengths behind
    /// chained state (CBC/CTR), which must go through
    /// [`DecryptCipher::decrypt_blocks`] instead.
    pub fn peek_packet_len(&self, seqnr: u32, first4: &[u8; 4]) -> Option<u32> {
        match self {
            DecryptCipher::ChaPoly { length, .. } => {
                let mut buf = *first4;
                let nonce = u64::from(seqnr).to_be_bytes();
                let mut cipher =
                    ChaCha20Legacy::new(GenericArray::from_slice(length), (&nonce).into());
                cipher.apply_keystream(&mut buf);
                Some(u32::from_be_bytes(buf))
            }
            DecryptCipher::Gcm128 { .. }
            | DecryptCipher::Gcm256 { .. }
            | DecryptCipher::NoCipher => Some(u32::from_be_bytes(*first4)),
            _ => None,
        }
    }

    /// Open one AES-GCM record. The length field is the AAD; the IV's
    /// low 8 bytes are incremented after every record (RFC 5647).
    ///
    /// On tag failure the ciphertext is left untouched and `false` is
    /// returned; the caller surfaces it as a MAC mismatch.
    pub fn open_gcm(&mut self, length_bytes: &[u8; 4], buffer: &mut [u8], tag: &[u8]) -> bool {
        let ok = match self {
            DecryptCipher::Gcm128 { key, iv } => key
                .decrypt_in_place_detached(
                    GenericArray::from_slice(iv),
                    length_bytes,
                    buffer,
                    GenericArray::from_slice(tag),
                )
                .is_ok(),
            DecryptCipher::Gcm256 { key, iv } => key
                .decrypt_in_place_detached(
                    GenericArray::from_slice(iv),
                    length_bytes,
                    buffer,
                    GenericArray::from_slice(tag),
                )
                .is_ok(),
            _ => false,
        };
        if let DecryptCipher::Gcm128 { iv, .. } | DecryptCipher::Gcm256 { iv, .. } = self {
            let mut counter = u64::from_be_bytes(iv[4..12].try_into().unwrap());
            counter = counter.wrapping_add(1);
            iv[4..12].copy_from_slice(&counter.to_be_bytes());
        }
        ok
    }

    /// Open one `chacha20-poly1305@openssh.com` record.
    ///
    /// `encrypted` holds the payload ciphertext (without the length
    /// field); `encrypted_len` the 4 encrypted length bytes; `tag` the
    /// trailing Poly1305 tag computed over both. The payload is always
    /// decrypted; the flag reports whether the tag verified.
    pub fn open_chapoly(
        &self,
        seqnr: u32,
        encrypted_len: &[u8; 4],
        encrypted: &mut [u8],
        tag: &[u8],
    ) -> bool {
        let (main, _) = match self {
            DecryptCipher::ChaPoly { main, length } => (main, length),
            _ => return false,
        };
        let nonce = u64::from(seqnr).to_be_bytes();

        // Poly1305 key = first 32 bytes of the block-0 keystream.
        let mut poly_key = [0u8; 32];
        let mut cipher = ChaCha20Legacy::new(GenericArray::from_slice(main), (&nonce).into());
        cipher.apply_keystream(&mut poly_key);

        let tag_ok = if tag.len() == 16 {
            let mut mac_input = Vec::with_capacity(4 + encrypted.len());
            mac_input.extend_from_slice(encrypted_len);
            mac_input.extend_from_slice(encrypted);
            let computed =
                poly1305::Poly1305::new(GenericArray::from_slice(&poly_key)).compute_unpadded(&mac_input);
            bool::from(computed.as_slice().ct_eq(tag))
        } else {
            false
        };

        // Payload keystream starts at block 1.
        let mut cipher = ChaCha20Legacy::new(GenericArray::from_slice(main), (&nonce).into());
        cipher.seek(64u64);
        cipher.apply_keystream(encrypted);

        poly_key.zeroize();
        tag_ok
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cipher_properties() {
        let chapoly = CipherAlgorithm::ChaCha20Poly1305;
        assert_eq!(chapoly.key_len(), 64);
        assert_eq!(chapoly.iv_len(), 0);
        assert_eq!(chapoly.tag_len(), 16);
        assert!(chapoly.is_aead());
        assert!(chapoly.length_in_clear());

        let ctr = CipherAlgorithm::Aes128Ctr;
        assert_eq!(ctr.key_len(), 16);
        assert_eq!(ctr.iv_len(), 16);
        assert_eq!(ctr.tag_len(), 0);
        assert!(!ctr.length_in_clear());

        let gcm = CipherAlgorithm::Aes256Gcm;
        assert_eq!(gcm.iv_len(), 12);
        assert!(gcm.length_in_clear());
    }

    #[test]
    fn test_cipher_from_name() {
        assert_eq!(
            CipherAlgorithm::from_name("aes128-ctr"),
            Some(CipherAlgorithm::Aes128Ctr)
        );
        assert_eq!(
            CipherAlgorithm::from_name("chacha20-poly1305@openssh.com"),
            Some(CipherAlgorithm::ChaCha20Poly1305)
        );
        assert_eq!(CipherAlgorithm::from_name("blowfish-cbc"), None);
    }

    #[test]
    fn test_mac_lengths() {
        assert_eq!(MacAlgorithm::HmacSha256.mac_len(), 32);
        assert_eq!(MacAlgorithm::HmacSha512.mac_len(), 64);
        assert_eq!(MacAlgorithm::HmacSha1.mac_len(), 20);
        assert_eq!(MacAlgorithm::from_name("umac-64@openssh.com"), None);
    }

    #[test]
    fn test_mac_verify_roundtrip() {
        let verifier = MacVerifier::new(MacAlgorithm::HmacSha256, &[7u8; 32]).unwrap();
        let packet = b"\x00\x00\x00\x0c\x06payload";
        let mac = verifier.compute(3, packet);
        assert!(verifier.verify(3, packet, &mac));
        assert!(!verifier.verify(4, packet, &mac));
        assert!(!verifier.verify(3, b"other", &mac));
    }

    #[test]
    fn test_ctr_keystream_is_stateful() {
        let key = [1u8; 16];
        let iv = [2u8; 16];
        let mut decrypt = DecryptCipher::new(CipherAlgorithm::Aes128Ctr, &key, &iv).unwrap();
        let mut encrypt = Aes128Ctr::new((&key).into(), (&iv).into());

        let mut data = *b"0123456789abcdef0123456789abcdef";
        encrypt.apply_keystream(&mut data);
        // Decrypt in two chunks: state must chain across calls.
        let (a, b) = data.split_at_mut(16);
        decrypt.decrypt_blocks(a);
        decrypt.decrypt_blocks(b);
        assert_eq!(&data[..], b"0123456789abcdef0123456789abcdef");
    }

    #[test]
    fn test_chapoly_roundtrip() {
        let mut key = [0u8; 64];
        for (i, b) in key.iter_mut().enumerate() {
            *b = i as u8;
        }
        let cipher = DecryptCipher::new(CipherAlgorithm::ChaCha20Poly1305, &key, &[]).unwrap();
        let seqnr = 5u32;
        let nonce = u64::from(seqnr).to_be_bytes();

        // Encrypt a record the way OpenSSH does.
        let plain_len = 28u32;
        let mut enc_len = plain_len.to_be_bytes();
        let mut len_cipher =
            ChaCha20Legacy::new(GenericArray::from_slice(&key[32..64]), (&nonce).into());
        len_cipher.apply_keystream(&mut enc_len);

        let mut payload = vec![0x5au8; plain_len as usize];
        let mut payload_cipher =
            ChaCha20Legacy::new(GenericArray::from_slice(&key[..32]), (&nonce).into());
        payload_cipher.seek(64u64);
        payload_cipher.apply_keystream(&mut payload);

        let mut poly_key = [0u8; 32];
        let mut poly_cipher =
            ChaCha20Legacy::new(GenericArray::from_slice(&key[..32]), (&nonce).into());
        poly_cipher.apply_keystream(&mut poly_key);
        let mut mac_input = enc_len.to_vec();
        mac_input.extend_from_slice(&payload);
        let tag = poly1305::Poly1305::new(GenericArray::from_slice(&poly_key))
            .compute_unpadded(&mac_input);

        // Length is recoverable statelessly.
        assert_eq!(cipher.peek_packet_len(seqnr, &enc_len), Some(plain_len));

        let mut buffer = payload.clone();
        assert!(cipher.open_chapoly(seqnr, &enc_len, &mut buffer, &tag));
        assert_eq!(buffer, vec![0x5au8; plain_len as usize]);

        // A corrupted tag still decrypts but reports failure.
        let mut buffer = payload;
        let mut bad_tag = tag;
        bad_tag[0] ^= 1;
        assert!(!cipher.open_chapoly(seqnr, &enc_len, &mut buffer, &bad_tag));
        assert_eq!(buffer, vec![0x5au8; plain_len as usize]);
    }

    #[test]
    fn test_gcm_roundtrip_and_iv_advance() {
        let key = [3u8; 16];
        let iv = [9u8; 12];
        let mut decrypt = DecryptCipher::new(CipherAlgorithm::Aes128Gcm, &key, &iv).unwrap();

        let sealer = Aes128Gcm::new((&key).into());
        let length_bytes = 16u32.to_be_bytes();
        let mut buffer = vec![0x77u8; 16];
        let tag = sealer
            .encrypt_in_place_detached(GenericArray::from_slice(&iv), &length_bytes, &mut buffer)
            .unwrap();

        assert!(decrypt.open_gcm(&length_bytes, &mut buffer, &tag));
        assert_eq!(buffer, vec![0x77u8; 16]);

        // Second record must use the incremented IV.
        let mut iv2 = iv;
        let counter = u64::from_be_bytes(iv2[4..12].try_into().unwrap()) + 1;
        iv2[4..12].copy_from_slice(&counter.to_be_bytes());
        let mut buffer2 = vec![0x33u8; 16];
        let tag2 = sealer
            .encrypt_in_place_detached(GenericArray::from_slice(&iv2), &length_bytes, &mut buffer2)
            .unwrap();
        assert!(decrypt.open_gcm(&length_bytes, &mut buffer2, &tag2));
        assert_eq!(buffer2, vec![0x33u8; 16]);
    }

    #[test]
    fn test_gcm_bad_tag_leaves_ciphertext() {
        let key = [3u8; 32];
        let iv = [9u8; 12];
        let mut decrypt = DecryptCipher::new(CipherAlgorithm::Aes256Gcm, &key, &iv).unwrap();
        let length_bytes = 16u32.to_be_bytes();
        let mut buffer = vec![0xaau8; 16];
        let original = buffer.clone();
        assert!(!decrypt.open_gcm(&length_bytes, &mut buffer, &[0u8; 16]));
        assert_eq!(buffer, original);
    }
}
