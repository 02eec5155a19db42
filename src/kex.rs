//! Key exchange: shared-secret computation, the exchange hash, and
//! RFC 4253 section 7.2 key derivation.
//!
//! Everything here is passive. The peer's ephemeral private key (or the
//! finished shared secret) must come from a keylog entry; the protocol
//! is designed so that observed wire data alone never yields keys.

use std::convert::TryInto;

use num_bigint::BigUint;
use num_traits::Zero;
use sha1::Sha1;
use sha2::{Digest, Sha256, Sha512};
use zeroize::Zeroize;

use crate::keylog::{MatchedPeer, Secret};
use crate::keymat::MAX_KEY_MATERIAL;
use crate::wire;
use crate::Error;

/// Hash algorithm implied by the KEX method name suffix.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum KexHash {
    Sha1,
    Sha256,
    Sha512,
}

impl KexHash {
    pub fn output_len(self) -> usize {
        match self {
            KexHash::Sha1 => 20,
            KexHash::Sha256 => 32,
            KexHash::Sha512 => 64,
        }
    }

    fn digest(self, data: &[u8]) -> Vec<u8> {
        match self {
            KexHash::Sha1 => Sha1::digest(data).to_vec(),
            KexHash::Sha256 => Sha256::digest(data).to_vec(),
            KexHash::Sha512 => Sha512::digest(data).to_vec(),
        }
    }
}

/// Post-quantum hybrid KEM variants.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HybridKem {
    Sntrup761,
    Mlkem768,
}

impl HybridKem {
    /// Size of the KEM ciphertext/public-key blob that follows the
    /// 32-byte Curve25519 part inside the hybrid wire string.
    pub fn kem_blob_len(self) -> usize {
        match self {
            HybridKem::Sntrup761 => 1039,
            HybridKem::Mlkem768 => 1184,
        }
    }
}

/// A fixed finite-field DH group (RFC 2409 / RFC 3526).
#[derive(Debug, PartialEq)]
pub struct ModpGroup {
    prime_hex: &'static str,
    pub generator: u32,
}

impl ModpGroup {
    pub fn prime(&self) -> BigUint {
        BigUint::from_bytes_be(&hex::decode(self.prime_hex).expect("group constant"))
    }
}

/// 1024-bit MODP group (Oakley group 2, RFC 2409 section 6.2).
pub static MODP_GROUP1: ModpGroup = ModpGroup {
    prime_hex: "FFFFFFFFFFFFFFFFC90FDAA22168C234C4C6628B80DC1CD1\
                29024E088A67CC74020BBEA63B139B22514A08798E3404DD\
                EF9519B3CD3A431B302B0A6DF25F14374FE1356D6D51C245\
                E485B576625E7EC6F44C42E9A637ED6B0BFF5CB6F406B7ED\
                EE386BFB5A899FA5AE9F24117C4B1FE649286651ECE65381\
                FFFFFFFFFFFFFFFF",
    generator: 2,
};

/// 2048-bit MODP group (RFC 3526 section 3).
pub static MODP_GROUP14: ModpGroup = ModpGroup {
    prime_hex: "FFFFFFFFFFFFFFFFC90FDAA22168C234C4C6628B80DC1CD1\
                29024E088A67CC74020BBEA63B139B22514A08798E3404DD\
                EF9519B3CD3A431B302B0A6DF25F14374FE1356D6D51C245\
                E485B576625E7EC6F44C42E9A637ED6B0BFF5CB6F406B7ED\
                EE386BFB5A899FA5AE9F24117C4B1FE649286651ECE45B3D\
                C2007CB8A163BF0598DA48361C55D39A69163FA8FD24CF5F\
                83655D23DCA3AD961C62F356208552BB9ED529077096966D\
                670C354E4ABC9804F1746C08CA18217C32905E462E36CE3B\
                E39E772C180E86039B2783A2EC07A28FB5C55DF06F4C52C9\
                DE2BCBF6955817183995497CEA956AE515D2261898FA0510\
                15728E5A8AACAA68FFFFFFFFFFFFFFFF",
    generator: 2,
};

/// 4096-bit MODP group (RFC 3526 section 5).
pub static MODP_GROUP16: ModpGroup = ModpGroup {
    prime_hex: "FFFFFFFFFFFFFFFFC90FDAA22168C234C4C6628B80DC1CD1\
                29024E088A67CC74020BBEA63B139B22514A08798E3404DD\
                EF9519B3CD3A431B302B0A6DF25F14374FE1356D6D51C245\
                E485B576625E7EC6F44C42E9A637ED6B0BFF5CB6F406B7ED\
                EE386BFB5A899FA5AE9F24117C4B1FE649286651ECE45B3D\
                C2007CB8A163BF0598DA48361C55D39A69163FA8FD24CF5F\
                83655D23DCA3AD961C62F356208552BB9ED529077096966D\
                670C354E4ABC9804F1746C08CA18217C32905E462E36CE3B\
                E39E772C180E86039B2783A2EC07A28FB5C55DF06F4C52C9\
                DE2BCBF6955817183995497CEA956AE515D2261898FA0510\
                15728E5A8AAAC42DAD33170D04507A33A85521ABDF1CBA64\
                ECFB850458DBEF0A8AEA71575D060C7DB3970F85A6E1E4C7\
                ABF5AE8CDB0933D71E8C94E04A25619DCEE3D2261AD2EE6B\
                F12FFA06D98A0864D87602733EC86A64521F2B18177B200C\
                BBE117577A615D6C770988C0BAD946E208E24FA074E5AB31\
                43DB5BFCE0FD108E4B82D120A92108011A723C12A787E6D7\
                88719A10BDBA5B2699C327186AF4E23C1A946834B6150BDA\
                2583E9CA2AD44CE8DBBBC2DB04DE8EF92E8EFC141FBECAA6\
                287C59474E6BC05D99B2964FA090C3A2233BA186515BE7ED\
                1F612970CEE2D7AFB81BDD762170481CD0069127D5B05AA9\
                93B4EA988D8FDDC186FFB7DC90A6C08F4DF435C934063199\
                FFFFFFFFFFFFFFFF",
    generator: 2,
};

/// 8192-bit MODP group (RFC 3526 section 7).
pub static MODP_GROUP18: ModpGroup = ModpGroup {
    prime_hex: "FFFFFFFFFFFFFFFFC90FDAA22168C234C4C6628B80DC1CD1\
                29024E088A67CC74020BBEA63B139B22514A08798E3404DD\
                EF9519B3CD3A431B302B0A6DF25F14374FE1356D6D51C245\
                E485B576625E7EC6F44C42E9A637ED6B0BFF5CB6F406B7ED\
                EE386BFB5A899FA5AE9F24117C4B1FE649286651ECE45B3D\
                C2007CB8A163BF0598DA48361C55D39A69163FA8FD24CF5F\
                83655D23DCA3AD961C62F356208552BB9ED529077096966D\
                670C354E4ABC9804F1746C08CA18217C32905E462E36CE3B\
                E39E772C180E86039B2783A2EC07A28FB5C55DF06F4C52C9\
                DE2BCBF6955817183995497CEA956AE515D2261898FA0510\
                15728E5A8AAAC42DAD33170D04507A33A85521ABDF1CBA64\
                ECFB850458DBEF0A8AEA71575D060C7DB3970F85A6E1E4C7\
                ABF5AE8CDB0933D71E8C94E04A25619DCEE3D2261AD2EE6B\
                F12FFA06D98A0864D87602733EC86A64521F2B18177B200C\
                BBE117577A615D6C770988C0BAD946E208E24FA074E5AB31\
                43DB5BFCE0FD108E4B82D120A92108011A723C12A787E6D7\
                88719A10BDBA5B2699C327186AF4E23C1A946834B6150BDA\
                2583E9CA2AD44CE8DBBBC2DB04DE8EF92E8EFC141FBECAA6\
                287C59474E6BC05D99B2964FA090C3A2233BA186515BE7ED\
                1F612970CEE2D7AFB81BDD762170481CD0069127D5B05AA9\
                93B4EA988D8FDDC186FFB7DC90A6C08F4DF435C934028492\
                36C3FAB4D27C7026C1D4DCB2602646DEC9751E763DBA37BD\
                F8FF9406AD9E530EE5DB382F413001AEB06A53ED9027D831\
                179727B0865A8918DA3EDBEBCF9B14ED44CE6CBACED4BB1B\
                DB7F1447E6CC254B332051512BD7AF426FB8F401378CD2BF\
                5983CA01C64B92ECF032EA15D1721D03F482D7CE6E74FEF6\
                D55E702F46980C82B5A84031900B1C9E59E7C97FBEC7E8F3\
                23A97A7E36CC88BE0F1D45B7FF585AC54BD407B22B4154AA\
                CC8F6D7EBF48E1D814CC5ED20F8037E0A79715EEF29BE328\
                06A1D58BB7C5DA76F550AA3D8A1FBFF0EB19CCB1A313D55C\
                DA56C9EC2EF29632387FE8D76E3C0468043E8F663F4860EE\
                12BF2D5B0B7474D6E694F91E6DBE115974A3926F12FEE5E4\
                38777CB6A932DF8CD8BEC4D073B931BA3BC832B68D9DD300\
                741FA7BF8AFC47ED2576F6936BA424663AAB639C5AE4F568\
                3423B4742BF1C978238F16CBE39D652DE3FDB8BEFC848AD9\
                22222E04A4037C0713EB57A81A23F0C73473FC646CEA306B\
                4BCBC8862F8385DDFA9D4B7FA2C087E879683303ED5BDD3A\
                062B3CF5B3A278A66D2A13F83F44F82DDF310EE074AB6A36\
                4597E899A0255DC164F31CC50846851DF9AB48195DED7EA1\
                B1D510BD7EE74D73FAF36BC31ECFA268359046F4EB879F92\
                4009438B481C6CD7889A002ED5EE382BC9190DA6FC026E47\
                9558E4475677E9AA9E3050E2765694DFC81F56E880B96E71\
                60C980DD98EDD3DFFFFFFFFFFFFFFFFF",
    generator: 2,
};

/// KEX method families the engine can drive.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum KexFamily {
    /// Fixed-group finite-field DH.
    DiffieHellman(&'static ModpGroup),
    /// RFC 4419 group exchange (server-supplied modulus/generator).
    GroupExchange,
    /// Curve25519 scalar multiplication (RFC 8731).
    Curve25519,
    /// NIST-curve ECDH: the message layout is dissected but secret
    /// computation requires a SHARED_SECRET keylog entry.
    EcdhNist,
    /// Classical/post-quantum hybrid; SHARED_SECRET keylog entries only.
    Hybrid(HybridKem),
}

/// A recognized key exchange method.
#[derive(Clone, Debug, PartialEq)]
pub struct KexAlgorithm {
    pub name: String,
    pub family: KexFamily,
    pub hash: KexHash,
}

impl KexAlgorithm {
    /// Classify a negotiated KEX method name.
    pub fn from_name(name: &str) -> Option<Self> {
        let (family, hash) = match name {
            "diffie-hellman-group1-sha1" => (KexFamily::DiffieHellman(&MODP_GROUP1), KexHash::Sha1),
            "diffie-hellman-group14-sha1" => {
                (KexFamily::DiffieHellman(&MODP_GROUP14), KexHash::Sha1)
            }
            "diffie-hellman-group14-sha256" => {
                (KexFamily::DiffieHellman(&MODP_GROUP14), KexHash::Sha256)
            }
            "diffie-hellman-group16-sha512" => {
                (KexFamily::DiffieHellman(&MODP_GROUP16), KexHash::Sha512)
            }
            "diffie-hellman-group18-sha512" => {
                (KexFamily::DiffieHellman(&MODP_GROUP18), KexHash::Sha512)
            }
            "diffie-hellman-group-exchange-sha1" => (KexFamily::GroupExchange, KexHash::Sha1),
            "diffie-hellman-group-exchange-sha256" => (KexFamily::GroupExchange, KexHash::Sha256),
            "curve25519-sha256" | "curve25519-sha256@libssh.org" => {
                (KexFamily::Curve25519, KexHash::Sha256)
            }
            "ecdh-sha2-nistp256" => (KexFamily::EcdhNist, KexHash::Sha256),
            "ecdh-sha2-nistp384" => (KexFamily::EcdhNist, KexHash::Sha512),
            "ecdh-sha2-nistp521" => (KexFamily::EcdhNist, KexHash::Sha512),
            "sntrup761x25519-sha512" | "sntrup761x25519-sha512@openssh.com" => {
                (KexFamily::Hybrid(HybridKem::Sntrup761), KexHash::Sha512)
            }
            "mlkem768x25519-sha256" => (KexFamily::Hybrid(HybridKem::Mlkem768), KexHash::Sha256),
            _ => return None,
        };
        Some(KexAlgorithm {
            name: name.to_owned(),
            family,
            hash,
        })
    }

    /// Public values are hashed as mpints for finite-field methods and
    /// as plain strings for everything curve-based.
    fn publics_are_mpint(&self) -> bool {
        matches!(
            self.family,
            KexFamily::DiffieHellman(_) | KexFamily::GroupExchange
        )
    }

    /// The hybrids encode the shared secret K as a string in the
    /// exchange hash and key derivation; the classic methods use mpint.
    fn secret_is_string(&self) -> bool {
        matches!(self.family, KexFamily::Hybrid(_))
    }

    fn put_secret(&self, buf: &mut Vec<u8>, secret: &[u8]) {
        if self.secret_is_string() {
            wire::put_string(buf, secret);
        } else {
            wire::put_mpint(buf, secret);
        }
    }
}

/// Split a hybrid-KEM wire value into its Curve25519 part and KEM blob.
///
/// Returns `None` when the blob length does not match the method.
pub fn split_hybrid(kem: HybridKem, blob: &[u8]) -> Option<(&[u8], &[u8])> {
    if blob.len() == 32 + kem.kem_blob_len() {
        Some(blob.split_at(32))
    } else {
        None
    }
}

/// Group-exchange negotiation state captured from the wire.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct GexParams {
    pub min: Option<u32>,
    pub n: u32,
    pub max: Option<u32>,
    /// Server-supplied modulus, raw mpint body.
    pub p: Vec<u8>,
    /// Server-supplied generator, raw mpint body.
    pub g: Vec<u8>,
}

/// Everything the exchange hash covers, in wire form.
///
/// Version strings carry no line terminator; KEXINIT payloads include
/// their message-code byte; public values are the raw bodies of their
/// wire fields.
#[derive(Debug)]
pub struct ExchangeInput<'a> {
    pub client_version: &'a [u8],
    pub server_version: &'a [u8],
    pub client_kexinit: &'a [u8],
    pub server_kexinit: &'a [u8],
    pub host_key: &'a [u8],
    pub gex: Option<&'a GexParams>,
    pub client_public: &'a [u8],
    pub server_public: &'a [u8],
    pub shared_secret: &'a [u8],
}

/// Compute the exchange hash H for one key exchange.
pub fn exchange_hash(algo: &KexAlgorithm, input: &ExchangeInput<'_>) -> Vec<u8> {
    let mut buf = Vec::with_capacity(
        input.client_kexinit.len() + input.server_kexinit.len() + input.host_key.len() + 256,
    );
    wire::put_string(&mut buf, input.client_version);
    wire::put_string(&mut buf, input.server_version);
    wire::put_string(&mut buf, input.client_kexinit);
    wire::put_string(&mut buf, input.server_kexinit);
    wire::put_string(&mut buf, input.host_key);
    if let Some(gex) = input.gex {
        // RFC 4419: the old request form hashes only n; the new form
        // hashes min || n || max. The two bit counts are raw uint32s,
        // not strings.
        if let (Some(min), Some(max)) = (gex.min, gex.max) {
            wire::put_u32(&mut buf, min);
            wire::put_u32(&mut buf, gex.n);
            wire::put_u32(&mut buf, max);
        } else {
            wire::put_u32(&mut buf, gex.n);
        }
        wire::put_mpint(&mut buf, wire::mpint_magnitude(&gex.p));
        wire::put_mpint(&mut buf, wire::mpint_magnitude(&gex.g));
    }
    if algo.publics_are_mpint() {
        wire::put_mpint(&mut buf, wire::mpint_magnitude(input.client_public));
        wire::put_mpint(&mut buf, wire::mpint_magnitude(input.server_public));
    } else {
        wire::put_string(&mut buf, input.client_public);
        wire::put_string(&mut buf, input.server_public);
    }
    algo.put_secret(&mut buf, input.shared_secret);
    let digest = algo.hash.digest(&buf);
    buf.zeroize();
    digest
}

/// Compute the shared secret K from a keylog entry.
///
/// `matched` says whose KEXINIT cookie the keylog entry was found
/// under, which decides which peer's public value the private key is
/// combined with.
pub fn compute_shared_secret(
    algo: &KexAlgorithm,
    matched: MatchedPeer,
    secret: &Secret,
    client_public: &[u8],
    server_public: &[u8],
    gex: Option<&GexParams>,
) -> Result<Vec<u8>, Error> {
    let private = match secret {
        Secret::SharedSecret(material) => return Ok(material.as_bytes().to_vec()),
        Secret::PrivateKey(material) => material,
    };
    let peer_public = match matched {
        MatchedPeer::Server => client_public,
        MatchedPeer::Client => server_public,
    };

    match algo.family {
        KexFamily::DiffieHellman(_) | KexFamily::GroupExchange => {
            let prime = match algo.family {
                KexFamily::DiffieHellman(group) => group.prime(),
                _ => {
                    let gex = gex.ok_or_else(|| {
                        Error::Unsupported("group exchange parameters not seen".into())
                    })?;
                    let magnitude = wire::mpint_magnitude(&gex.p);
                    if magnitude.is_empty() || magnitude.len() > MAX_KEY_MATERIAL {
                        return Err(Error::InvalidKeyLength(magnitude.len()));
                    }
                    BigUint::from_bytes_be(magnitude)
                }
            };
            let magnitude = wire::mpint_magnitude(peer_public);
            if magnitude.is_empty() || magnitude.len() > MAX_KEY_MATERIAL {
                return Err(Error::InvalidKeyLength(magnitude.len()));
            }
            let public = BigUint::from_bytes_be(magnitude);
            let exponent = BigUint::from_bytes_be(private.as_bytes());
            if public.is_zero() || exponent.is_zero() {
                return Err(Error::InvalidKeyLength(0));
            }
            let shared = public.modpow(&exponent, &prime);
            Ok(shared.to_bytes_be())
        }
        KexFamily::Curve25519 => {
            let scalar: [u8; 32] = private
                .as_bytes()
                .try_into()
                .map_err(|_| Error::InvalidKeyLength(private.len()))?;
            let point: [u8; 32] = peer_public
                .try_into()
                .map_err(|_| Error::InvalidKeyLength(peer_public.len()))?;
            let secret = x25519_dalek::StaticSecret::from(scalar);
            let shared = secret.diffie_hellman(&x25519_dalek::PublicKey::from(point));
            if !shared.was_contributory() {
                return Err(Error::CurveComputation);
            }
            Ok(shared.as_bytes().to_vec())
        }
        KexFamily::EcdhNist => Err(Error::Unsupported(format!(
            "{}: private-key derivation not supported, supply SHARED_SECRET",
            algo.name
        ))),
        KexFamily::Hybrid(_) => Err(Error::Unsupported(format!(
            "{}: hybrid methods need a SHARED_SECRET keylog entry",
            algo.name
        ))),
    }
}

/// Byte counts requested from [`derive_keys`].
#[derive(Clone, Copy, Debug, Default)]
pub struct KeySizes {
    pub iv_client_to_server: usize,
    pub iv_server_to_client: usize,
    pub key_client_to_server: usize,
    pub key_server_to_client: usize,
    pub mac_client_to_server: usize,
    pub mac_server_to_client: usize,
}

/// The six derived buffers of RFC 4253 section 7.2, tags 'A'..'F'.
#[derive(Clone, Debug, Default)]
pub struct DerivedKeys {
    pub iv_client_to_server: Vec<u8>,
    pub iv_server_to_client: Vec<u8>,
    pub key_client_to_server: Vec<u8>,
    pub key_server_to_client: Vec<u8>,
    pub mac_client_to_server: Vec<u8>,
    pub mac_server_to_client: Vec<u8>,
}

impl Drop for DerivedKeys {
    fn drop(&mut self) {
        self.iv_client_to_server.zeroize();
        self.iv_server_to_client.zeroize();
        self.key_client_to_server.zeroize();
        self.key_server_to_client.zeroize();
        self.mac_client_to_server.zeroize();
        self.mac_server_to_client.zeroize();
    }
}

/// Derive one key: `K1 = HASH(K || H || tag || session_id)`, extended
/// with `Kn+1 = HASH(K || H || K1 || .. || Kn)` until `len` bytes exist.
fn derive_one(
    algo: &KexAlgorithm,
    shared_secret: &[u8],
    h: &[u8],
    tag: u8,
    session_id: &[u8],
    len: usize,
) -> Vec<u8> {
    if len == 0 {
        return Vec::new();
    }
    let mut out: Vec<u8> = Vec::with_capacity(len);
    while out.len() < len {
        let mut buf = Vec::new();
        algo.put_secret(&mut buf, shared_secret);
        buf.extend_from_slice(h);
        if out.is_empty() {
            buf.push(tag);
            buf.extend_from_slice(session_id);
        } else {
            buf.extend_from_slice(&out);
        }
        let digest = algo.hash.digest(&buf);
        out.extend_from_slice(&digest);
        buf.zeroize();
    }
    out.truncate(len);
    out
}

/// Derive the six IV/key/MAC buffers for both directions.
pub fn derive_keys(
    algo: &KexAlgorithm,
    shared_secret: &[u8],
    h: &[u8],
    session_id: &[u8],
    sizes: &KeySizes,
) -> DerivedKeys {
    let derive = |tag: u8, len: usize| derive_one(algo, shared_secret, h, tag, session_id, len);
    DerivedKeys {
        iv_client_to_server: derive(b'A', sizes.iv_client_to_server),
        iv_server_to_client: derive(b'B', sizes.iv_server_to_client),
        key_client_to_server: derive(b'C', sizes.key_client_to_server),
        key_server_to_client: derive(b'D', sizes.key_server_to_client),
        mac_client_to_server: derive(b'E', sizes.mac_client_to_server),
        mac_server_to_client: derive(b'F', sizes.mac_server_to_client),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keymat::KeyMaterial;

    fn test_algo() -> KexAlgorithm {
        KexAlgorithm::from_name("curve25519-sha256").unwrap()
    }

    fn sizes() -> KeySizes {
        KeySizes {
            iv_client_to_server: 16,
            iv_server_to_client: 16,
            key_client_to_server: 32,
            key_server_to_client: 32,
            mac_client_to_server: 32,
            mac_server_to_client: 32,
        }
    }

    #[test]
    fn test_from_name_families() {
        assert!(matches!(
            KexAlgorithm::from_name("diffie-hellman-group14-sha256").unwrap().family,
            KexFamily::DiffieHellman(_)
        ));
        assert!(matches!(
            KexAlgorithm::from_name("diffie-hellman-group-exchange-sha256")
                .unwrap()
                .family,
            KexFamily::GroupExchange
        ));
        assert!(matches!(
            KexAlgorithm::from_name("sntrup761x25519-sha512@openssh.com")
                .unwrap()
                .family,
            KexFamily::Hybrid(HybridKem::Sntrup761)
        ));
        assert_eq!(KexAlgorithm::from_name("not-a-kex"), None);
    }

    #[test]
    fn test_group_primes_decode() {
        // Group constants must be valid hex of the documented widths.
        assert_eq!(MODP_GROUP1.prime().bits(), 1024);
        assert_eq!(MODP_GROUP14.prime().bits(), 2048);
        assert_eq!(MODP_GROUP16.prime().bits(), 4096);
        assert_eq!(MODP_GROUP18.prime().bits(), 8192);
    }

    #[test]
    fn test_derive_keys_deterministic() {
        let algo = test_algo();
        let k = [0x11u8; 32];
        let h = [0x22u8; 32];
        let sid = [0x33u8; 32];
        let a = derive_keys(&algo, &k, &h, &sid, &sizes());
        let b = derive_keys(&algo, &k, &h, &sid, &sizes());
        assert_eq!(a.key_client_to_server, b.key_client_to_server);
        assert_eq!(a.mac_server_to_client, b.mac_server_to_client);
    }

    #[test]
    fn test_derive_keys_avalanche() {
        let algo = test_algo();
        let k = [0x11u8; 32];
        let h = [0x22u8; 32];
        let mut h2 = h;
        h2[0] ^= 1;
        let sid = [0x33u8; 32];
        let a = derive_keys(&algo, &k, &h, &sid, &sizes());
        let b = derive_keys(&algo, &k, &h2, &sid, &sizes());
        assert_ne!(a.iv_client_to_server, b.iv_client_to_server);
        assert_ne!(a.iv_server_to_client, b.iv_server_to_client);
        assert_ne!(a.key_client_to_server, b.key_client_to_server);
        assert_ne!(a.key_server_to_client, b.key_server_to_client);
        assert_ne!(a.mac_client_to_server, b.mac_client_to_server);
        assert_ne!(a.mac_server_to_client, b.mac_server_to_client);
    }

    #[test]
    fn test_derive_keys_extension_loop() {
        // Request more bytes than one hash output to exercise the
        // K1..Kn extension path.
        let algo = test_algo();
        let keys = derive_keys(
            &algo,
            &[1u8; 32],
            &[2u8; 32],
            &[3u8; 32],
            &KeySizes {
                key_client_to_server: 96,
                ..KeySizes::default()
            },
        );
        assert_eq!(keys.key_client_to_server.len(), 96);
        // The extension must not simply repeat the first block.
        assert_ne!(
            keys.key_client_to_server[..32],
            keys.key_client_to_server[32..64]
        );
    }

    #[test]
    fn test_dh_shared_secret_both_cookie_matches_agree() {
        // x = 6, y = 7 over group14: both derivations must yield g^42.
        let group = &MODP_GROUP14;
        let g = BigUint::from(group.generator);
        let p = group.prime();
        let e = g.modpow(&BigUint::from(6u32), &p).to_bytes_be();
        let f = g.modpow(&BigUint::from(7u32), &p).to_bytes_be();
        let algo = KexAlgorithm::from_name("diffie-hellman-group14-sha256").unwrap();

        let server_priv = Secret::PrivateKey(KeyMaterial::from_wire(&[7u8]).unwrap());
        let via_server =
            compute_shared_secret(&algo, MatchedPeer::Server, &server_priv, &e, &f, None).unwrap();
        let client_priv = Secret::PrivateKey(KeyMaterial::from_wire(&[6u8]).unwrap());
        let via_client =
            compute_shared_secret(&algo, MatchedPeer::Client, &client_priv, &e, &f, None).unwrap();
        assert_eq!(via_server, via_client);
        assert_eq!(
            via_server,
            g.modpow(&BigUint::from(42u32), &p).to_bytes_be()
        );
    }

    #[test]
    fn test_dh_oversized_public_rejected() {
        let algo = KexAlgorithm::from_name("diffie-hellman-group14-sha256").unwrap();
        let secret = Secret::PrivateKey(KeyMaterial::from_wire(&[7u8]).unwrap());
        let oversized = vec![0x7fu8; MAX_KEY_MATERIAL + 1];
        assert!(matches!(
            compute_shared_secret(&algo, MatchedPeer::Server, &secret, &oversized, &[], None),
            Err(Error::InvalidKeyLength(_))
        ));
        assert!(matches!(
            compute_shared_secret(&algo, MatchedPeer::Server, &secret, &[], &[], None),
            Err(Error::InvalidKeyLength(_))
        ));
    }

    #[test]
    fn test_curve25519_low_order_rejected() {
        let algo = test_algo();
        let secret = Secret::PrivateKey(KeyMaterial::from_wire(&[9u8; 32]).unwrap());
        let zero_point = [0u8; 32];
        assert!(matches!(
            compute_shared_secret(
                &algo,
                MatchedPeer::Client,
                &secret,
                &[],
                &zero_point,
                None
            ),
            Err(Error::CurveComputation)
        ));
    }

    #[test]
    fn test_hybrid_requires_shared_secret() {
        let algo = KexAlgorithm::from_name("mlkem768x25519-sha256").unwrap();
        let secret = Secret::PrivateKey(KeyMaterial::from_wire(&[9u8; 32]).unwrap());
        assert!(matches!(
            compute_shared_secret(&algo, MatchedPeer::Client, &secret, &[], &[], None),
            Err(Error::Unsupported(_))
        ));
        let shared = Secret::SharedSecret(KeyMaterial::from_wire(&[5u8; 64]).unwrap());
        assert_eq!(
            compute_shared_secret(&algo, MatchedPeer::Client, &shared, &[], &[], None).unwrap(),
            vec![5u8; 64]
        );
    }

    #[test]
    fn test_split_hybrid_sizes() {
        let sntrup = vec![0u8; 32 + 1039];
        assert!(split_hybrid(HybridKem::Sntrup761, &sntrup).is_some());
        assert!(split_hybrid(HybridKem::Sntrup761, &sntrup[1..]).is_none());
        let mlkem = vec![0u8; 32 + 1184];
        let (curve, blob) = split_hybrid(HybridKem::Mlkem768, &mlkem).unwrap();
        assert_eq!(curve.len(), 32);
        assert_eq!(blob.len(), 1184);
    }

    #[test]
    fn test_exchange_hash_gex_field_order() {
        let algo = KexAlgorithm::from_name("diffie-hellman-group-exchange-sha256").unwrap();
        let gex_new = GexParams {
            min: Some(1024),
            n: 2048,
            max: Some(8192),
            p: vec![0x7f, 1, 2],
            g: vec![2],
        };
        let gex_old = GexParams {
            min: None,
            n: 2048,
            max: None,
            ..gex_new.clone()
        };
        let input = |gex| ExchangeInput {
            client_version: b"SSH-2.0-a",
            server_version: b"SSH-2.0-b",
            client_kexinit: &[20, 0],
            server_kexinit: &[20, 1],
            host_key: &[0, 1],
            gex: Some(gex),
            client_public: &[0x42],
            server_public: &[0x43],
            shared_secret: &[0x44],
        };
        // Old-style and new-style requests hash different prefixes.
        assert_ne!(
            exchange_hash(&algo, &input(&gex_new)),
            exchange_hash(&algo, &input(&gex_old))
        );
        assert_eq!(exchange_hash(&algo, &input(&gex_new)).len(), 32);
    }
}
