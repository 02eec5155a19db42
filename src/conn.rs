//! The per-connection protocol driver.
//!
//! [`FlowDissector`] consumes ordered per-direction byte slices and
//! emits dissection events: banner and version lines, decrypted and
//! classified messages, channel bytes, and downgrade notices when
//! decryption becomes impossible. It never blocks: when the buffered
//! bytes stop mid-record it reports how many more are needed and the
//! caller re-invokes after appending them.
//!
//! All state is per connection; nothing here is global. Cross-connection
//! parallelism is safe because independent dissectors share nothing.

use std::collections::BTreeMap;
use std::convert::TryInto;
use std::net::SocketAddr;

use crate::channel::{ChannelHandler, ChannelMux};
use crate::codec::{DecryptStatus, DecryptedRecord, TransportCodec};
use crate::crypto::{CipherAlgorithm, MacAlgorithm};
use crate::kex::{self, GexParams, KexAlgorithm, KexFamily, KeySizes};
use crate::keylog::KeylogSource;
use crate::msg::{self, ChannelRequestKind, DispatchContext, Extension, KexDialect, Message};
use crate::negotiate::{self, Negotiated};
use crate::reassembly::{ChannelConsumer, Consume};
use crate::wire;
use crate::Error;

/// Longest version/banner line buffered before the connection is
/// declared unparseable and passed through raw.
const MAX_LINE_LEN: usize = 4096;

/// One direction of the connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Direction {
    ClientToServer,
    ServerToClient,
}

impl Direction {
    pub fn index(self) -> usize {
        match self {
            Direction::ClientToServer => 0,
            Direction::ServerToClient => 1,
        }
    }

    pub fn other(self) -> Direction {
        match self {
            Direction::ClientToServer => Direction::ServerToClient,
            Direction::ServerToClient => Direction::ClientToServer,
        }
    }

    pub fn is_client(self) -> bool {
        self == Direction::ClientToServer
    }
}

/// Protocol version as learned from the client's identification line.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProtocolVersion {
    Unknown,
    V1,
    V2,
}

/// Coarse per-direction protocol phase.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Phase {
    AwaitingVersion,
    KeyExchange,
    Transport,
}

/// Localized, recoverable oddities attached to a record.
#[derive(Clone, Debug, PartialEq)]
pub enum Annotation {
    /// Decryption proceeded but the MAC/tag did not verify.
    MacMismatch,
    /// Channel-data for a channel never seen opened.
    UnknownChannel(u32),
}

/// One fully processed record, cached for idempotent replay.
#[derive(Clone, Debug, PartialEq)]
pub struct Record {
    pub seqnr: u32,
    pub message: Message,
    pub mac: Vec<u8>,
    pub mac_ok: Option<bool>,
    pub consumed: usize,
}

/// Everything the dissector reports back to its caller.
#[derive(Clone, Debug, PartialEq)]
pub enum SshEvent {
    /// A pre-version banner line (terminator stripped).
    Banner {
        direction: Direction,
        line: Vec<u8>,
    },
    Version {
        direction: Direction,
        proto: String,
        software: String,
        comments: Option<String>,
    },
    /// Both KEXINITs have been seen and matched.
    Negotiated {
        negotiated: Negotiated,
        hassh_client: String,
        hassh_server: String,
    },
    Message {
        direction: Direction,
        seqnr: u32,
        message: Message,
        mac_ok: Option<bool>,
        annotations: Vec<Annotation>,
    },
    /// Reassembled channel payload bytes.
    ChannelBytes {
        direction: Direction,
        recipient_channel: u32,
        byte_seq: u64,
        data: Vec<u8>,
    },
    /// Decryption is off for this connection from here on; framing
    /// metadata may still follow as `Opaque` events.
    DecryptionLost {
        direction: Direction,
        reason: String,
    },
    /// Bytes (or a framed but undecryptable record) passed through.
    Opaque {
        direction: Direction,
        len: usize,
    },
}

/// Result of one `feed` call. `consumed` bytes may be dropped from the
/// front of the caller's buffer; `need_more`, when set, is the minimum
/// number of additional bytes required before the next record can make
/// progress.
#[derive(Debug, Default)]
pub struct FeedOutcome {
    pub consumed: usize,
    pub events: Vec<SshEvent>,
    pub need_more: Option<usize>,
}

/// Framing-only mode: the negotiated cipher leaves lengths readable but
/// the keys are unavailable.
#[derive(Clone, Copy, Debug)]
struct FrameOnly {
    mac_len: usize,
}

#[derive(Debug)]
struct PeerState {
    version_done: bool,
    codec: TransportCodec,
    /// Keys derived but not yet installed (waiting for this
    /// direction's NEWKEYS).
    pending_codec: Option<TransportCodec>,
    /// Set when keys were installed for this direction.
    keyed: bool,
    frame_only: Option<FrameOnly>,
    /// Staged framing info to apply at NEWKEYS when keys are missing.
    pending_frame_only: Option<FrameOnly>,
    opaque: bool,
    kexinit: Option<msg::KexInit>,
    /// Stream offset of the next unprocessed byte.
    stream_offset: u64,
    records: BTreeMap<u64, Record>,
    /// Stream offsets of this direction's KEXINIT and NEWKEYS records,
    /// used to tell pre- from post-encryption byte ranges.
    kex_frame_range: (Option<u64>, Option<u64>),
}

impl PeerState {
    fn new() -> Self {
        PeerState {
            version_done: false,
            codec: TransportCodec::plaintext(),
            pending_codec: None,
            keyed: false,
            frame_only: None,
            pending_frame_only: None,
            opaque: false,
            kexinit: None,
            stream_offset: 0,
            records: BTreeMap::new(),
            kex_frame_range: (None, None),
        }
    }
}

#[derive(Debug, Default)]
struct Transcript {
    client_version: Option<Vec<u8>>,
    server_version: Option<Vec<u8>>,
    client_kexinit: Option<Vec<u8>>,
    server_kexinit: Option<Vec<u8>>,
    host_key: Option<Vec<u8>>,
}

#[derive(Debug, Default)]
struct KexRound {
    algorithm: Option<KexAlgorithm>,
    negotiated: Option<Negotiated>,
    client_public: Option<Vec<u8>>,
    server_public: Option<Vec<u8>>,
    gex: Option<GexParams>,
    /// Keys for this round have been derived and staged.
    derived: bool,
    /// A KEXINIT for this round has been seen.
    active: bool,
}

/// Discards reassembled bytes when the caller supplies no consumer; the
/// `ChannelBytes` events still carry everything.
struct DrainConsumer;

impl ChannelConsumer for DrainConsumer {
    fn on_channel_bytes(&mut self, _channel: u32, data: &[u8]) -> Consume {
        Consume::Consumed(data.len())
    }
}

/// Per-connection dissection state machine.
#[derive(Debug)]
pub struct FlowDissector {
    peers: [PeerState; 2],
    transcript: Transcript,
    kex: KexRound,
    version: ProtocolVersion,
    server_endpoint: Option<SocketAddr>,
    session_id: Option<Vec<u8>>,
    do_decrypt: bool,
    strict_kex: bool,
    auth_method: Option<String>,
    ping_enabled: bool,
    channels: ChannelMux,
}

impl Default for FlowDissector {
    fn default() -> Self {
        Self::new()
    }
}

impl FlowDissector {
    pub fn new() -> Self {
        FlowDissector {
            peers: [PeerState::new(), PeerState::new()],
            transcript: Transcript::default(),
            kex: KexRound::default(),
            version: ProtocolVersion::Unknown,
            server_endpoint: None,
            session_id: None,
            do_decrypt: true,
            strict_kex: false,
            auth_method: None,
            ping_enabled: false,
            channels: ChannelMux::new(),
        }
    }

    /// Record the server endpoint. Fixed at first observation; later
    /// calls are ignored.
    pub fn set_server_endpoint(&mut self, addr: SocketAddr) {
        if self.server_endpoint.is_none() {
            self.server_endpoint = Some(addr);
        }
    }

    pub fn server_endpoint(&self) -> Option<SocketAddr> {
        self.server_endpoint
    }

    pub fn protocol_version(&self) -> ProtocolVersion {
        self.version
    }

    pub fn session_id(&self) -> Option<&[u8]> {
        self.session_id.as_deref()
    }

    pub fn do_decrypt(&self) -> bool {
        self.do_decrypt
    }

    pub fn negotiated(&self) -> Option<&Negotiated> {
        self.kex.negotiated.as_ref()
    }

    pub fn channels(&self) -> &ChannelMux {
        &self.channels
    }

    /// Version string recorded for a direction, terminator stripped.
    pub fn version_line(&self, direction: Direction) -> Option<&[u8]> {
        match direction {
            Direction::ClientToServer => self.transcript.client_version.as_deref(),
            Direction::ServerToClient => self.transcript.server_version.as_deref(),
        }
    }

    pub fn phase(&self, direction: Direction) -> Phase {
        let peer = &self.peers[direction.index()];
        if !peer.version_done {
            Phase::AwaitingVersion
        } else if !peer.keyed || self.kex.active {
            Phase::KeyExchange
        } else {
            Phase::Transport
        }
    }

    /// Idempotent lookup of an already-processed record by its stream
    /// offset. Re-visiting processed input is a cache query, never a
    /// re-decryption.
    pub fn record_at(&self, direction: Direction, offset: u64) -> Option<&Record> {
        self.peers[direction.index()].records.get(&offset)
    }

    /// Stream offset of the next byte `feed` expects for a direction.
    pub fn stream_offset(&self, direction: Direction) -> u64 {
        self.peers[direction.index()].stream_offset
    }

    /// Feed new bytes, discarding reassembled channel payloads (the
    /// emitted `ChannelBytes` events still carry them).
    pub fn feed(
        &mut self,
        direction: Direction,
        data: &[u8],
        keylog: &KeylogSource,
    ) -> FeedOutcome {
        self.feed_with_consumer(direction, data, keylog, &mut DrainConsumer)
    }

    /// Feed new bytes from one direction.
    ///
    /// `data` must start at the stream offset this dissector has
    /// consumed up to (see [`FeedOutcome::consumed`]); the caller owns
    /// the buffering and re-invokes with appended bytes after a
    /// `need_more` outcome.
    pub fn feed_with_consumer(
        &mut self,
        direction: Direction,
        data: &[u8],
        keylog: &KeylogSource,
        consumer: &mut dyn ChannelConsumer,
    ) -> FeedOutcome {
        let mut outcome = FeedOutcome::default();
        loop {
            let rest = &data[outcome.consumed..];
            if rest.is_empty() {
                break;
            }
            let peer = &self.peers[direction.index()];

            if peer.opaque {
                self.pass_through(direction, rest.len(), &mut outcome);
                break;
            }

            if !peer.version_done {
                if !self.take_version_line(direction, rest, &mut outcome) {
                    break;
                }
                continue;
            }

            if let Some(frame) = peer.frame_only {
                if !self.frame_without_keys(direction, rest, frame, &mut outcome) {
                    break;
                }
                continue;
            }

            match self.peers[direction.index()].codec.decrypt_next_record(rest) {
                DecryptStatus::NeedMoreBytes(n) => {
                    outcome.need_more = Some(n);
                    break;
                }
                DecryptStatus::Fatal(err) => {
                    warn!("{:?}: framing failure: {}", direction, err);
                    outcome.events.push(SshEvent::DecryptionLost {
                        direction,
                        reason: err.to_string(),
                    });
                    self.peers[direction.index()].opaque = true;
                    self.pass_through(direction, rest.len(), &mut outcome);
                    break;
                }
                DecryptStatus::Decrypted(record) => {
                    outcome.consumed += record.consumed;
                    self.handle_record(direction, record, keylog, consumer, &mut outcome);
                }
            }
        }
        outcome
    }

    fn pass_through(&mut self, direction: Direction, len: usize, outcome: &mut FeedOutcome) {
        self.peers[direction.index()].stream_offset += len as u64;
        outcome.consumed += len;
        outcome.events.push(SshEvent::Opaque { direction, len });
    }

    /// Returns false when the caller must supply more bytes.
    fn take_version_line(
        &mut self,
        direction: Direction,
        rest: &[u8],
        outcome: &mut FeedOutcome,
    ) -> bool {
        let newline = match rest.iter().position(|&b| b == b'\n') {
            Some(pos) => pos,
            None => {
                if rest.len() > MAX_LINE_LEN {
                    // Not an SSH identification exchange after all.
                    warn!("{:?}: no version line within {} bytes", direction, MAX_LINE_LEN);
                    self.peers[direction.index()].opaque = true;
                    self.pass_through(direction, rest.len(), outcome);
                } else {
                    outcome.need_more = Some(1);
                }
                return false;
            }
        };
        let consumed = newline + 1;
        let mut line = &rest[..newline];
        if line.ends_with(b"\r") {
            line = &line[..line.len() - 1];
        }
        self.peers[direction.index()].stream_offset += consumed as u64;
        outcome.consumed += consumed;

        if !line.starts_with(b"SSH-") {
            // RFC 4253 section 4.2 allows arbitrary lines before the
            // server's identification line.
            trace!("{:?}: banner line ({} bytes)", direction, line.len());
            outcome.events.push(SshEvent::Banner {
                direction,
                line: line.to_vec(),
            });
            return true;
        }

        let parsed = {
            let mut terminated = line.to_vec();
            terminated.extend_from_slice(b"\r\n");
            match wire::parse_version_line(&terminated) {
                Ok((_, version)) => Some((
                    String::from_utf8_lossy(version.proto).into_owned(),
                    String::from_utf8_lossy(version.software).into_owned(),
                    version
                        .comments
                        .map(|c| String::from_utf8_lossy(c).into_owned()),
                )),
                Err(_) => None,
            }
        };

        let peer = &mut self.peers[direction.index()];
        peer.version_done = true;
        match direction {
            Direction::ClientToServer => self.transcript.client_version = Some(line.to_vec()),
            Direction::ServerToClient => self.transcript.server_version = Some(line.to_vec()),
        }

        if let Some((proto, software, comments)) = parsed {
            if direction.is_client() {
                self.version = if proto.starts_with("1.") && proto != "1.99" {
                    ProtocolVersion::V1
                } else {
                    ProtocolVersion::V2
                };
            }
            debug!("{:?}: version SSH-{}-{}", direction, proto, software);
            outcome.events.push(SshEvent::Version {
                direction,
                proto,
                software,
                comments,
            });
        } else {
            // Malformed identification line: note it and fall back to
            // framing the rest as packets anyway.
            warn!("{:?}: unparseable version line", direction);
            outcome.events.push(SshEvent::Version {
                direction,
                proto: String::new(),
                software: String::from_utf8_lossy(line).into_owned(),
                comments: None,
            });
        }
        true
    }

    /// Frame one record without decrypting it (keys unavailable but the
    /// negotiated cipher sends lengths in the clear).
    fn frame_without_keys(
        &mut self,
        direction: Direction,
        rest: &[u8],
        frame: FrameOnly,
        outcome: &mut FeedOutcome,
    ) -> bool {
        if rest.len() < 4 {
            outcome.need_more = Some(4 - rest.len());
            return false;
        }
        let packet_len = u32::from_be_bytes(rest[..4].try_into().unwrap());
        if packet_len < 5 || packet_len > wire::MAX_PACKET_LEN {
            warn!("{:?}: implausible length {} without keys", direction, packet_len);
            self.peers[direction.index()].opaque = true;
            self.pass_through(direction, rest.len(), outcome);
            return false;
        }
        let total = 4 + packet_len as usize + frame.mac_len;
        if rest.len() < total {
            outcome.need_more = Some(total - rest.len());
            return false;
        }
        self.peers[direction.index()].codec.bump_seqnr();
        self.pass_through(direction, total, outcome);
        true
    }

    fn dispatch_context(&self) -> DispatchContext {
        let dialect = self.kex.algorithm.as_ref().map(|algo| match algo.family {
            KexFamily::DiffieHellman(_) => KexDialect::DiffieHellman,
            KexFamily::GroupExchange => KexDialect::GroupExchange,
            KexFamily::Curve25519 | KexFamily::EcdhNist | KexFamily::Hybrid(_) => KexDialect::Ecdh,
        });
        DispatchContext {
            kex: dialect,
            auth_method: self.auth_method.clone(),
            ping_enabled: self.ping_enabled,
        }
    }

    fn handle_record(
        &mut self,
        direction: Direction,
        record: DecryptedRecord,
        keylog: &KeylogSource,
        consumer: &mut dyn ChannelConsumer,
        outcome: &mut FeedOutcome,
    ) {
        let context = self.dispatch_context();
        let message = msg::parse_message(&record.payload, &context);
        let offset = self.peers[direction.index()].stream_offset;
        self.peers[direction.index()].stream_offset += record.consumed as u64;

        let mut annotations = Vec::new();
        if record.mac_ok == Some(false) {
            annotations.push(Annotation::MacMismatch);
        }

        self.apply_message(direction, offset, &message, keylog, consumer, &mut annotations, outcome);

        self.peers[direction.index()].records.insert(
            offset,
            Record {
                seqnr: record.seqnr,
                message: message.clone(),
                mac: record.mac.clone(),
                mac_ok: record.mac_ok,
                consumed: record.consumed,
            },
        );
        outcome.events.push(SshEvent::Message {
            direction,
            seqnr: record.seqnr,
            message,
            mac_ok: record.mac_ok,
            annotations,
        });
    }

    #[allow(clippy::too_many_arguments)]
    fn apply_message(
        &mut self,
        direction: Direction,
        offset: u64,
        message: &Message,
        keylog: &KeylogSource,
        consumer: &mut dyn ChannelConsumer,
        annotations: &mut Vec<Annotation>,
        outcome: &mut FeedOutcome,
    ) {
        match message {
            Message::KexInit(kexinit) => {
                if self.kex.derived {
                    // Re-key: fresh transcript accumulators and round
                    // state; session id and strict flag persist.
                    debug!("{:?}: re-key started", direction);
                    self.transcript.client_kexinit = None;
                    self.transcript.server_kexinit = None;
                    self.transcript.host_key = None;
                    self.kex = KexRound::default();
                    for peer in self.peers.iter_mut() {
                        peer.kexinit = None;
                        peer.kex_frame_range = (None, None);
                    }
                }
                self.kex.active = true;
                self.peers[direction.index()].kex_frame_range.0 = Some(offset);
                match direction {
                    Direction::ClientToServer => {
                        self.transcript.client_kexinit = Some(kexinit.raw.clone())
                    }
                    Direction::ServerToClient => {
                        self.transcript.server_kexinit = Some(kexinit.raw.clone())
                    }
                }
                self.peers[direction.index()].kexinit = Some(kexinit.clone());
                self.negotiate_if_ready(outcome);
            }
            Message::KexDhInit { e } => self.kex.client_public = Some(e.clone()),
            Message::KexEcdhInit { q_client } => self.kex.client_public = Some(q_client.clone()),
            Message::KexGexInit { e } => self.kex.client_public = Some(e.clone()),
            Message::KexDhReply {
                host_key, f, ..
            }
            | Message::KexGexReply {
                host_key, f, ..
            } => {
                self.kex.server_public = Some(f.clone());
                self.transcript.host_key = Some(host_key.clone());
            }
            Message::KexEcdhReply {
                host_key, q_server, ..
            } => {
                self.kex.server_public = Some(q_server.clone());
                self.transcript.host_key = Some(host_key.clone());
            }
            Message::KexGexRequestOld { n } => {
                let gex = self.kex.gex.get_or_insert_with(GexParams::default);
                gex.n = *n;
            }
            Message::KexGexRequest { min, n, max } => {
                let gex = self.kex.gex.get_or_insert_with(GexParams::default);
                gex.min = Some(*min);
                gex.n = *n;
                gex.max = Some(*max);
            }
            Message::KexGexGroup { p, g } => {
                let gex = self.kex.gex.get_or_insert_with(GexParams::default);
                gex.p = p.clone();
                gex.g = g.clone();
            }
            Message::NewKeys => {
                self.peers[direction.index()].kex_frame_range.1 = Some(offset);
                self.on_newkeys(direction, keylog, outcome);
            }
            Message::UserauthRequest { method, .. } => {
                let name = match method {
                    msg::AuthMethod::None => "none".to_owned(),
                    msg::AuthMethod::Password { .. } => "password".to_owned(),
                    msg::AuthMethod::Publickey { .. } => "publickey".to_owned(),
                    msg::AuthMethod::Hostbased { .. } => "hostbased".to_owned(),
                    msg::AuthMethod::KeyboardInteractive { .. } => {
                        "keyboard-interactive".to_owned()
                    }
                    msg::AuthMethod::Other { name, .. } => name.clone(),
                };
                self.auth_method = Some(name);
            }
            Message::ExtInfo(extensions) => {
                for extension in extensions {
                    if let Extension::Ping(_) = extension {
                        self.ping_enabled = true;
                    }
                }
            }
            Message::ChannelOpenConfirmation {
                recipient_channel,
                sender_channel,
                ..
            } => {
                self.channels
                    .on_open_confirmation(direction, *recipient_channel, *sender_channel);
            }
            Message::ChannelRequest {
                recipient_channel,
                request,
                ..
            } => {
                let handler = match request {
                    ChannelRequestKind::Subsystem(name) => {
                        Some(ChannelHandler::Subsystem(name.clone()))
                    }
                    ChannelRequestKind::Exec(command) => Some(ChannelHandler::Exec(command.clone())),
                    ChannelRequestKind::Shell => Some(ChannelHandler::Shell),
                    _ => None,
                };
                if let Some(handler) = handler {
                    self.channels
                        .assign_handler(direction, *recipient_channel, handler);
                }
            }
            Message::ChannelData {
                recipient_channel,
                data,
            }
            | Message::ChannelExtendedData {
                recipient_channel,
                data,
                ..
            } => {
                match self
                    .channels
                    .on_data(direction, *recipient_channel, data.len())
                {
                    Some(byte_seq) => {
                        if let Some(channel) = self
                            .channels
                            .get_channel_mut(direction, *recipient_channel)
                        {
                            channel
                                .reassembler
                                .push(*recipient_channel, byte_seq, data, consumer);
                        }
                        outcome.events.push(SshEvent::ChannelBytes {
                            direction,
                            recipient_channel: *recipient_channel,
                            byte_seq,
                            data: data.clone(),
                        });
                    }
                    None => {
                        debug!(
                            "{:?}: data for unknown channel {}",
                            direction, recipient_channel
                        );
                        annotations.push(Annotation::UnknownChannel(*recipient_channel));
                    }
                }
            }
            _ => {}
        }
    }

    fn negotiate_if_ready(&mut self, outcome: &mut FeedOutcome) {
        let (client, server) = match (
            &self.peers[Direction::ClientToServer.index()].kexinit,
            &self.peers[Direction::ServerToClient.index()].kexinit,
        ) {
            (Some(client), Some(server)) => (client, server),
            _ => return,
        };
        let negotiated = negotiate::negotiate_all(client, server);
        if !self.kex_was_negotiated_before() {
            self.strict_kex = negotiated.strict_kex;
        }
        self.kex.algorithm = negotiated
            .kex
            .as_deref()
            .and_then(KexAlgorithm::from_name);
        if self.kex.algorithm.is_none() {
            debug!("kex algorithm {:?} not recognized", negotiated.kex);
        }
        let hassh_client = format!("{:x}", client.client_hash());
        let hassh_server = format!("{:x}", server.server_hash());
        outcome.events.push(SshEvent::Negotiated {
            negotiated: negotiated.clone(),
            hassh_client,
            hassh_server,
        });
        self.kex.negotiated = Some(negotiated);
    }

    fn kex_was_negotiated_before(&self) -> bool {
        self.session_id.is_some()
    }

    /// NEWKEYS observed from `direction`: derive this round's keys if
    /// not done yet, then switch this direction over.
    fn on_newkeys(
        &mut self,
        direction: Direction,
        keylog: &KeylogSource,
        outcome: &mut FeedOutcome,
    ) {
        if !self.kex.derived && self.do_decrypt {
            match self.try_derive(keylog) {
                Ok(()) => {}
                Err(err) => {
                    info!("decryption unavailable: {}", err);
                    self.do_decrypt = false;
                    self.stage_frame_only();
                    outcome.events.push(SshEvent::DecryptionLost {
                        direction,
                        reason: err.to_string(),
                    });
                }
            }
        }

        let strict = self.strict_kex;
        let peer = &mut self.peers[direction.index()];
        if let Some(pending) = peer.pending_codec.take() {
            peer.codec.install(pending, strict);
            peer.keyed = true;
            peer.frame_only = None;
        } else if let Some(frame) = peer.pending_frame_only.take() {
            peer.frame_only = Some(frame);
            peer.keyed = true;
            if strict {
                // Frame-only still honors the sequence reset so AEAD
                // record counters stay meaningful for annotation.
                peer.codec.install(TransportCodec::plaintext(), true);
            }
        } else if self.do_decrypt {
            // NEWKEYS before the exchange completed; nothing sensible
            // to install.
            warn!("{:?}: NEWKEYS with no staged keys", direction);
            peer.opaque = true;
        } else {
            peer.opaque = true;
        }

        // Both directions switched: this round is finished.
        if self.peers.iter().all(|peer| peer.keyed) {
            self.kex.active = false;
        }
    }

    /// Stage framing-only fallbacks for both directions based on the
    /// negotiated cipher names.
    fn stage_frame_only(&mut self) {
        let negotiated = self.kex.negotiated.clone().unwrap_or_default();
        for index in 0..2 {
            let (cipher_name, mac_name) = if index == 0 {
                (
                    negotiated.encr_client_to_server.as_deref(),
                    negotiated.mac_client_to_server.as_deref(),
                )
            } else {
                (
                    negotiated.encr_server_to_client.as_deref(),
                    negotiated.mac_server_to_client.as_deref(),
                )
            };
            // GCM and plaintext leave the length field readable without
            // keys; ChaCha20 encrypts it per record.
            let frame = match cipher_name.and_then(CipherAlgorithm::from_name) {
                Some(cipher)
                    if cipher.length_in_clear()
                        && cipher != CipherAlgorithm::ChaCha20Poly1305 =>
                {
                    if cipher.is_aead() {
                        Some(FrameOnly {
                            mac_len: cipher.tag_len(),
                        })
                    } else {
                        mac_name
                            .and_then(MacAlgorithm::from_name)
                            .map(|mac| FrameOnly {
                                mac_len: mac.mac_len(),
                            })
                    }
                }
                _ => None,
            };
            self.peers[index].pending_frame_only = frame;
        }
    }

    fn try_derive(&mut self, keylog: &KeylogSource) -> Result<(), Error> {
        let algorithm = self
            .kex
            .algorithm
            .clone()
            .ok_or_else(|| Error::Unsupported("key exchange method not negotiated".into()))?;
        let negotiated = self
            .kex
            .negotiated
            .clone()
            .ok_or_else(|| Error::Unsupported("algorithms not negotiated".into()))?;

        let client_version = self
            .transcript
            .client_version
            .as_deref()
            .ok_or_else(|| Error::Unsupported("client version not seen".into()))?;
        let server_version = self
            .transcript
            .server_version
            .as_deref()
            .ok_or_else(|| Error::Unsupported("server version not seen".into()))?;
        let client_kexinit = self
            .transcript
            .client_kexinit
            .as_deref()
            .ok_or_else(|| Error::Unsupported("client KEXINIT not seen".into()))?;
        let server_kexinit = self
            .transcript
            .server_kexinit
            .as_deref()
            .ok_or_else(|| Error::Unsupported("server KEXINIT not seen".into()))?;
        let host_key = self
            .transcript
            .host_key
            .as_deref()
            .ok_or_else(|| Error::Unsupported("server host key not seen".into()))?;
        let client_public = self
            .kex
            .client_public
            .as_deref()
            .ok_or_else(|| Error::Unsupported("client public value not seen".into()))?;
        let server_public = self
            .kex
            .server_public
            .as_deref()
            .ok_or_else(|| Error::Unsupported("server public value not seen".into()))?;

        let server_cookie = self.peers[Direction::ServerToClient.index()]
            .kexinit
            .as_ref()
            .map(|kexinit| kexinit.cookie);
        let client_cookie = self.peers[Direction::ClientToServer.index()]
            .kexinit
            .as_ref()
            .map(|kexinit| kexinit.cookie);
        let (matched, secret) = keylog
            .lookup(server_cookie.as_ref(), client_cookie.as_ref())
            .ok_or_else(|| Error::Unsupported("no keylog entry for session".into()))?;

        let shared_secret = kex::compute_shared_secret(
            &algorithm,
            matched,
            secret,
            client_public,
            server_public,
            self.kex.gex.as_ref(),
        )?;

        let exchange_hash = kex::exchange_hash(
            &algorithm,
            &kex::ExchangeInput {
                client_version,
                server_version,
                client_kexinit,
                server_kexinit,
                host_key,
                gex: self.kex.gex.as_ref(),
                client_public,
                server_public,
                shared_secret: &shared_secret,
            },
        );
        let session_id = self
            .session_id
            .get_or_insert_with(|| exchange_hash.clone())
            .clone();

        let cipher_c2s = negotiated
            .encr_client_to_server
            .as_deref()
            .and_then(CipherAlgorithm::from_name)
            .ok_or_else(|| {
                Error::Unsupported(format!(
                    "cipher {:?} not supported",
                    negotiated.encr_client_to_server
                ))
            })?;
        let cipher_s2c = negotiated
            .encr_server_to_client
            .as_deref()
            .and_then(CipherAlgorithm::from_name)
            .ok_or_else(|| {
                Error::Unsupported(format!(
                    "cipher {:?} not supported",
                    negotiated.encr_server_to_client
                ))
            })?;
        let mac_c2s = if cipher_c2s.is_aead() {
            MacAlgorithm::NoMac
        } else {
            negotiated
                .mac_client_to_server
                .as_deref()
                .and_then(MacAlgorithm::from_name)
                .ok_or_else(|| {
                    Error::Unsupported(format!(
                        "mac {:?} not supported",
                        negotiated.mac_client_to_server
                    ))
                })?
        };
        let mac_s2c = if cipher_s2c.is_aead() {
            MacAlgorithm::NoMac
        } else {
            negotiated
                .mac_server_to_client
                .as_deref()
                .and_then(MacAlgorithm::from_name)
                .ok_or_else(|| {
                    Error::Unsupported(format!(
                        "mac {:?} not supported",
                        negotiated.mac_server_to_client
                    ))
                })?
        };

        let sizes = KeySizes {
            iv_client_to_server: cipher_c2s.iv_len(),
            iv_server_to_client: cipher_s2c.iv_len(),
            key_client_to_server: cipher_c2s.key_len(),
            key_server_to_client: cipher_s2c.key_len(),
            mac_client_to_server: mac_c2s.key_len(),
            mac_server_to_client: mac_s2c.key_len(),
        };
        let keys = kex::derive_keys(&algorithm, &shared_secret, &exchange_hash, &session_id, &sizes);

        self.peers[Direction::ClientToServer.index()].pending_codec = Some(TransportCodec::new(
            cipher_c2s,
            &keys.key_client_to_server,
            &keys.iv_client_to_server,
            mac_c2s,
            &keys.mac_client_to_server,
        )?);
        self.peers[Direction::ServerToClient.index()].pending_codec = Some(TransportCodec::new(
            cipher_s2c,
            &keys.key_server_to_client,
            &keys.iv_server_to_client,
            mac_s2c,
            &keys.mac_server_to_client,
        )?);
        self.kex.derived = true;
        debug!(
            "derived keys for {} ({} / {})",
            algorithm.name,
            cipher_c2s.name(),
            cipher_s2c.name()
        );
        Ok(())
    }
}
