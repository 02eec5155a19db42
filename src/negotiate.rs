//! Algorithm negotiation and proposal fingerprinting.

use crate::msg::KexInit;

/// OpenSSH strict key exchange extension marker advertised by clients.
pub const KEX_STRICT_CLIENT: &str = "kex-strict-c-v00@openssh.com";
/// OpenSSH strict key exchange extension marker advertised by servers.
pub const KEX_STRICT_SERVER: &str = "kex-strict-s-v00@openssh.com";
/// EXT_INFO support marker in a client's kex algorithm list.
pub const EXT_INFO_CLIENT: &str = "ext-info-c";

/// Pick the first algorithm on the client's list that the server also
/// supports (RFC 4253 section 7.1: client preference order wins).
///
/// `None` means no overlap, which is a non-fatal "algorithm unset"
/// state; the language categories routinely negotiate nothing.
pub fn negotiate<'a>(client_csv: &'a str, server_csv: &str) -> Option<&'a str> {
    let server: Vec<&str> = server_csv.split(',').collect();
    client_csv
        .split(',')
        .find(|name| !name.is_empty() && server.contains(name))
}

/// Detect the OpenSSH strict-KEX extension.
///
/// True iff the client advertises [`KEX_STRICT_CLIENT`] and the server
/// advertises [`KEX_STRICT_SERVER`] in their raw (unfiltered) kex
/// algorithm lists.
pub fn is_strict_kex(client_kex_csv: &str, server_kex_csv: &str) -> bool {
    client_kex_csv.split(',').any(|name| name == KEX_STRICT_CLIENT)
        && server_kex_csv.split(',').any(|name| name == KEX_STRICT_SERVER)
}

/// The outcome of matching both KEXINIT proposals.
///
/// Every field is independently optional: one category failing to
/// negotiate does not invalidate the others.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Negotiated {
    pub kex: Option<String>,
    pub server_host_key: Option<String>,
    pub encr_client_to_server: Option<String>,
    pub encr_server_to_client: Option<String>,
    pub mac_client_to_server: Option<String>,
    pub mac_server_to_client: Option<String>,
    pub comp_client_to_server: Option<String>,
    pub comp_server_to_client: Option<String>,
    pub lang_client_to_server: Option<String>,
    pub lang_server_to_client: Option<String>,
    pub strict_kex: bool,
}

/// Run negotiation over every category of both proposals.
pub fn negotiate_all(client: &KexInit, server: &KexInit) -> Negotiated {
    let pick = |c: &str, s: &str| negotiate(c, s).map(str::to_owned);
    Negotiated {
        kex: pick(&client.kex_algs, &server.kex_algs),
        server_host_key: pick(&client.server_host_key_algs, &server.server_host_key_algs),
        encr_client_to_server: pick(
            &client.encr_algs_client_to_server,
            &server.encr_algs_client_to_server,
        ),
        encr_server_to_client: pick(
            &client.encr_algs_server_to_client,
            &server.encr_algs_server_to_client,
        ),
        mac_client_to_server: pick(
            &client.mac_algs_client_to_server,
            &server.mac_algs_client_to_server,
        ),
        mac_server_to_client: pick(
            &client.mac_algs_server_to_client,
            &server.mac_algs_server_to_client,
        ),
        comp_client_to_server: pick(
            &client.comp_algs_client_to_server,
            &server.comp_algs_client_to_server,
        ),
        comp_server_to_client: pick(
            &client.comp_algs_server_to_client,
            &server.comp_algs_server_to_client,
        ),
        lang_client_to_server: pick(
            &client.langs_client_to_server,
            &server.langs_client_to_server,
        ),
        lang_server_to_client: pick(
            &client.langs_server_to_client,
            &server.langs_server_to_client,
        ),
        strict_kex: is_strict_kex(&client.kex_algs, &server.kex_algs),
    }
}

impl KexInit {
    /// The client-side hassh input string.
    pub fn client_algo(&self) -> String {
        format!(
            "{};{};{};{}",
            self.kex_algs,
            self.encr_algs_client_to_server,
            self.mac_algs_client_to_server,
            self.comp_algs_client_to_server,
        )
    }

    /// The server-side hasshServer input string.
    pub fn server_algo(&self) -> String {
        format!(
            "{};{};{};{}",
            self.kex_algs,
            self.encr_algs_server_to_client,
            self.mac_algs_server_to_client,
            self.comp_algs_server_to_client,
        )
    }

    /// hassh fingerprint of a client KEXINIT.
    pub fn client_hash(&self) -> md5::Digest {
        md5::compute(self.client_algo())
    }

    /// hasshServer fingerprint of a server KEXINIT.
    pub fn server_hash(&self) -> md5::Digest {
        md5::compute(self.server_algo())
    }

    /// Did this (client) proposal advertise `ext-info-c`?
    pub fn offers_ext_info(&self) -> bool {
        self.kex_algs.split(',').any(|name| name == EXT_INFO_CLIENT)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kexinit(kex: &str, enc_c2s: &str, mac_c2s: &str, comp_c2s: &str) -> KexInit {
        KexInit {
            cookie: [0; 16],
            kex_algs: kex.to_owned(),
            server_host_key_algs: String::new(),
            encr_algs_client_to_server: enc_c2s.to_owned(),
            encr_algs_server_to_client: String::new(),
            mac_algs_client_to_server: mac_c2s.to_owned(),
            mac_algs_server_to_client: String::new(),
            comp_algs_client_to_server: comp_c2s.to_owned(),
            comp_algs_server_to_client: String::new(),
            langs_client_to_server: String::new(),
            langs_server_to_client: String::new(),
            first_kex_packet_follows: false,
            raw: Vec::new(),
        }
    }

    #[test]
    fn test_client_preference_wins() {
        assert_eq!(
            negotiate("aes256-ctr,aes128-ctr", "aes128-ctr,aes256-ctr"),
            Some("aes256-ctr")
        );
    }

    #[test]
    fn test_no_overlap_is_none() {
        assert_eq!(negotiate("a,b", "c,d"), None);
        assert_eq!(negotiate("", "c,d"), None);
    }

    #[test]
    fn test_single_common_token() {
        assert_eq!(negotiate("x,y,z", "q,z"), Some("z"));
    }

    #[test]
    fn test_strict_kex_detection() {
        let client = "curve25519-sha256,kex-strict-c-v00@openssh.com";
        let server = "curve25519-sha256,kex-strict-s-v00@openssh.com";
        assert!(is_strict_kex(client, server));
        assert!(!is_strict_kex(client, "curve25519-sha256"));
        assert!(!is_strict_kex("curve25519-sha256", server));
        // The markers are not interchangeable between directions.
        assert!(!is_strict_kex(server, client));
    }

    #[test]
    fn test_hassh_is_md5_of_joined_lists() {
        let kex = kexinit(
            "curve25519-sha256",
            "chacha20-poly1305@openssh.com",
            "umac-64-etm@openssh.com",
            "none",
        );
        let expected = md5::compute(
            "curve25519-sha256;chacha20-poly1305@openssh.com;umac-64-etm@openssh.com;none",
        );
        assert_eq!(kex.client_hash().0, expected.0);
    }

    #[test]
    fn test_negotiate_all_partial() {
        let mut client = kexinit("curve25519-sha256", "aes128-ctr", "hmac-sha2-256", "none");
        let mut server = kexinit("curve25519-sha256", "aes128-ctr", "hmac-sha2-256", "none");
        client.encr_algs_server_to_client = "aes256-gcm@openssh.com".to_owned();
        server.encr_algs_server_to_client = "aes128-gcm@openssh.com".to_owned();
        let negotiated = negotiate_all(&client, &server);
        assert_eq!(negotiated.kex.as_deref(), Some("curve25519-sha256"));
        assert_eq!(negotiated.encr_client_to_server.as_deref(), Some("aes128-ctr"));
        // No common server-to-client cipher: unset, not an error.
        assert_eq!(negotiated.encr_server_to_client, None);
        assert_eq!(negotiated.lang_client_to_server, None);
    }
}
