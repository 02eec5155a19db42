//! Keylog input: the sole source of the secret material needed to
//! decrypt a passively captured session.
//!
//! One record per line:
//!
//! ```text
//! <hex-cookie> <PRIVATE_KEY|SHARED_SECRET> <hex-material>
//! ```
//!
//! The legacy two-field form omits the type and implies `PRIVATE_KEY`.
//! The cookie is the 16-byte KEXINIT cookie of *either* peer of the
//! session; lookup tries the server's cookie first, then the client's.

use std::collections::HashMap;
use std::io::BufRead;

use crate::keymat::KeyMaterial;
use crate::Error;

/// A secret supplied out of band for one key exchange.
#[derive(Clone, Debug, PartialEq)]
pub enum Secret {
    /// The ephemeral private key (DH exponent or curve scalar) of the
    /// peer whose cookie matched.
    PrivateKey(KeyMaterial),
    /// The already-computed shared secret K.
    SharedSecret(KeyMaterial),
}

/// Which peer's KEXINIT cookie matched a keylog entry.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum MatchedPeer {
    Client,
    Server,
}

/// In-memory keylog table, keyed by KEXINIT cookie.
///
/// No ambient global state: the dissector takes a reference to one of
/// these wherever a secret lookup is needed.
#[derive(Debug, Default)]
pub struct KeylogSource {
    entries: HashMap<[u8; 16], Secret>,
}

impl KeylogSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse and insert a single keylog line.
    ///
    /// Blank lines and `#` comments are accepted and ignored.
    pub fn load_line(&mut self, line: &str) -> Result<(), Error> {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            return Ok(());
        }
        let mut fields = line.split_ascii_whitespace();
        let cookie_hex = fields
            .next()
            .ok_or_else(|| Error::Keylog("missing cookie".into()))?;
        let second = fields
            .next()
            .ok_or_else(|| Error::Keylog("missing key material".into()))?;
        let (kind, material_hex) = match fields.next() {
            Some(third) => (second, third),
            None => ("PRIVATE_KEY", second),
        };

        let cookie_bytes =
            hex::decode(cookie_hex).map_err(|_| Error::Keylog("bad cookie hex".into()))?;
        if cookie_bytes.len() != 16 {
            return Err(Error::Keylog(format!(
                "cookie must be 16 bytes, got {}",
                cookie_bytes.len()
            )));
        }
        let mut cookie = [0u8; 16];
        cookie.copy_from_slice(&cookie_bytes);

        let material = KeyMaterial::from_hex(material_hex)?;
        let secret = match kind {
            "PRIVATE_KEY" => Secret::PrivateKey(material),
            "SHARED_SECRET" => Secret::SharedSecret(material),
            other => {
                return Err(Error::Keylog(format!("unknown record type {:?}", other)));
            }
        };

        self.entries.insert(cookie, secret);
        Ok(())
    }

    /// Load every line from a reader, skipping malformed lines.
    ///
    /// Returns the number of records inserted.
    pub fn load<R: BufRead>(&mut self, reader: R) -> Result<usize, Error> {
        let before = self.entries.len();
        for line in reader.lines() {
            let line = line?;
            if let Err(err) = self.load_line(&line) {
                warn!("skipping keylog line: {}", err);
            }
        }
        Ok(self.entries.len() - before)
    }

    /// Look up the secret for a session, trying the server's cookie
    /// first and then the client's.
    pub fn lookup(
        &self,
        server_cookie: Option<&[u8; 16]>,
        client_cookie: Option<&[u8; 16]>,
    ) -> Option<(MatchedPeer, &Secret)> {
        if let Some(cookie) = server_cookie {
            if let Some(secret) = self.entries.get(cookie) {
                return Some((MatchedPeer::Server, secret));
            }
        }
        if let Some(cookie) = client_cookie {
            if let Some(secret) = self.entries.get(cookie) {
                return Some((MatchedPeer::Client, secret));
            }
        }
        None
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
