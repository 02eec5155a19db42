//! Message classification and field extraction.
//!
//! A decrypted payload is classified by the numeric range of its leading
//! message-code byte (RFC 4250 section 4.1.2) and parsed into a typed
//! [`Message`]. Unknown codes inside a range are passed through as
//! [`Message::Unknown`] with the raw bytes retained; an unrecognized
//! extension is never an error.

use nom::combinator::rest;
use nom::number::complete::{be_u8, be_u32};
use nom::sequence::tuple;
use nom::IResult;

use crate::wire;

pub const SSH_MSG_DISCONNECT: u8 = 1;
pub const SSH_MSG_IGNORE: u8 = 2;
pub const SSH_MSG_UNIMPLEMENTED: u8 = 3;
pub const SSH_MSG_DEBUG: u8 = 4;
pub const SSH_MSG_SERVICE_REQUEST: u8 = 5;
pub const SSH_MSG_SERVICE_ACCEPT: u8 = 6;
pub const SSH_MSG_EXT_INFO: u8 = 7;
pub const SSH_MSG_KEXINIT: u8 = 20;
pub const SSH_MSG_NEWKEYS: u8 = 21;
pub const SSH_MSG_KEXDH_INIT: u8 = 30;
pub const SSH_MSG_KEXDH_REPLY: u8 = 31;
pub const SSH_MSG_KEX_DH_GEX_REQUEST_OLD: u8 = 30;
pub const SSH_MSG_KEX_DH_GEX_GROUP: u8 = 31;
pub const SSH_MSG_KEX_DH_GEX_INIT: u8 = 32;
pub const SSH_MSG_KEX_DH_GEX_REPLY: u8 = 33;
pub const SSH_MSG_KEX_DH_GEX_REQUEST: u8 = 34;
pub const SSH_MSG_USERAUTH_REQUEST: u8 = 50;
pub const SSH_MSG_USERAUTH_FAILURE: u8 = 51;
pub const SSH_MSG_USERAUTH_SUCCESS: u8 = 52;
pub const SSH_MSG_USERAUTH_BANNER: u8 = 53;
pub const SSH_MSG_USERAUTH_PK_OK: u8 = 60;
pub const SSH_MSG_USERAUTH_INFO_RESPONSE: u8 = 61;
pub const SSH_MSG_GLOBAL_REQUEST: u8 = 80;
pub const SSH_MSG_REQUEST_SUCCESS: u8 = 81;
pub const SSH_MSG_REQUEST_FAILURE: u8 = 82;
pub const SSH_MSG_CHANNEL_OPEN: u8 = 90;
pub const SSH_MSG_CHANNEL_OPEN_CONFIRMATION: u8 = 91;
pub const SSH_MSG_CHANNEL_OPEN_FAILURE: u8 = 92;
pub const SSH_MSG_CHANNEL_WINDOW_ADJUST: u8 = 93;
pub const SSH_MSG_CHANNEL_DATA: u8 = 94;
pub const SSH_MSG_CHANNEL_EXTENDED_DATA: u8 = 95;
pub const SSH_MSG_CHANNEL_EOF: u8 = 96;
pub const SSH_MSG_CHANNEL_CLOSE: u8 = 97;
pub const SSH_MSG_CHANNEL_REQUEST: u8 = 98;
pub const SSH_MSG_CHANNEL_SUCCESS: u8 = 99;
pub const SSH_MSG_CHANNEL_FAILURE: u8 = 100;
pub const SSH_MSG_PING: u8 = 192;
pub const SSH_MSG_PONG: u8 = 193;

/// The seven message classes plus the reserved band, by numeric range.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MessageClass {
    TransportGeneric,
    AlgorithmNegotiation,
    KexMethodSpecific,
    UserauthGeneric,
    UserauthMethodSpecific,
    ConnectionGeneric,
    ChannelRelated,
    Reserved,
    LocalExtension,
}

/// Classify a message code by its RFC 4250 range.
pub fn classify(code: u8) -> MessageClass {
    match code {
        1..=19 => MessageClass::TransportGeneric,
        20..=29 => MessageClass::AlgorithmNegotiation,
        30..=49 => MessageClass::KexMethodSpecific,
        50..=59 => MessageClass::UserauthGeneric,
        60..=79 => MessageClass::UserauthMethodSpecific,
        80..=89 => MessageClass::ConnectionGeneric,
        90..=127 => MessageClass::ChannelRelated,
        128..=191 => MessageClass::Reserved,
        _ => MessageClass::LocalExtension,
    }
}

/// Which family of KEX messages codes 30..=34 belong to for the current
/// negotiation. Group-exchange reuses the 30/31 codes of plain DH, so the
/// negotiated method decides the layout.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum KexDialect {
    DiffieHellman,
    GroupExchange,
    /// ECDH, curve25519 and the post-quantum hybrids all use the
    /// init/reply string layout of RFC 5656.
    Ecdh,
}

/// Context the dispatcher needs for the method-specific ranges.
#[derive(Clone, Debug, Default)]
pub struct DispatchContext {
    /// Negotiated KEX family, when known (for codes 30..=49).
    pub kex: Option<KexDialect>,
    /// Last userauth method requested (for codes 60..=79).
    pub auth_method: Option<String>,
    /// `ping@openssh.com` offered via EXT_INFO (for codes 192/193).
    pub ping_enabled: bool,
}

/// Algorithm proposal lists from one SSH_MSG_KEXINIT, owned.
#[derive(Clone, Debug, PartialEq)]
pub struct KexInit {
    pub cookie: [u8; 16],
    pub kex_algs: String,
    pub server_host_key_algs: String,
    pub encr_algs_client_to_server: String,
    pub encr_algs_server_to_client: String,
    pub mac_algs_client_to_server: String,
    pub mac_algs_server_to_client: String,
    pub comp_algs_client_to_server: String,
    pub comp_algs_server_to_client: String,
    pub langs_client_to_server: String,
    pub langs_server_to_client: String,
    pub first_kex_packet_follows: bool,
    /// The full KEXINIT payload including the message-code byte, kept
    /// verbatim for the exchange-hash transcript.
    pub raw: Vec<u8>,
}

/// One EXT_INFO extension (RFC 8308 section 2.3).
#[derive(Clone, Debug, PartialEq)]
pub enum Extension {
    ServerSigAlgs(Vec<String>),
    DelayCompression {
        client_to_server: Vec<String>,
        server_to_client: Vec<String>,
    },
    NoFlowControl(String),
    Elevation(String),
    PublickeyAlgorithms(Vec<String>),
    Ping(String),
    /// Forward-compatible catch-all: unrecognized names keep their
    /// value as an opaque blob.
    Other { name: String, value: Vec<u8> },
}

/// One `CHANNEL_REQUEST` request type with its parsed fields.
#[derive(Clone, Debug, PartialEq)]
pub enum ChannelRequestKind {
    Subsystem(String),
    Exec(String),
    Shell,
    PtyReq {
        term: String,
        cols: u32,
        rows: u32,
        width_px: u32,
        height_px: u32,
        /// Terminal mode opcode/argument pairs, exposed raw.
        modes: Vec<(u8, u32)>,
    },
    Env {
        name: String,
        value: String,
    },
    ExitStatus(u32),
    ExitSignal {
        signal: String,
        core_dumped: bool,
        message: String,
        lang: String,
    },
    WindowChange {
        cols: u32,
        rows: u32,
        width_px: u32,
        height_px: u32,
    },
    Other {
        name: String,
        data: Vec<u8>,
    },
}

/// Fields of a userauth request, by method.
#[derive(Clone, Debug, PartialEq)]
pub enum AuthMethod {
    None,
    Password {
        password_present: bool,
    },
    Publickey {
        has_signature: bool,
        algorithm: String,
        blob: Vec<u8>,
    },
    Hostbased {
        algorithm: String,
        host: String,
        user: String,
    },
    KeyboardInteractive {
        submethods: String,
    },
    Other {
        name: String,
        data: Vec<u8>,
    },
}

/// A decrypted and dissected SSH message.
#[derive(Clone, Debug, PartialEq)]
pub enum Message {
    Disconnect {
        reason: u32,
        description: String,
        lang: String,
    },
    Ignore(Vec<u8>),
    Unimplemented(u32),
    Debug {
        always_display: bool,
        message: String,
        lang: String,
    },
    ServiceRequest(String),
    ServiceAccept(String),
    ExtInfo(Vec<Extension>),
    KexInit(KexInit),
    NewKeys,
    KexDhInit {
        e: Vec<u8>,
    },
    KexDhReply {
        host_key: Vec<u8>,
        f: Vec<u8>,
        signature: Vec<u8>,
    },
    KexGexRequestOld {
        n: u32,
    },
    KexGexRequest {
        min: u32,
        n: u32,
        max: u32,
    },
    KexGexGroup {
        p: Vec<u8>,
        g: Vec<u8>,
    },
    KexGexInit {
        e: Vec<u8>,
    },
    KexGexReply {
        host_key: Vec<u8>,
        f: Vec<u8>,
        signature: Vec<u8>,
    },
    KexEcdhInit {
        q_client: Vec<u8>,
    },
    KexEcdhReply {
        host_key: Vec<u8>,
        q_server: Vec<u8>,
        signature: Vec<u8>,
    },
    UserauthRequest {
        user: String,
        service: String,
        method: AuthMethod,
    },
    UserauthFailure {
        methods: Vec<String>,
        partial_success: bool,
    },
    UserauthSuccess,
    UserauthBanner {
        message: String,
        lang: String,
    },
    UserauthPkOk {
        algorithm: String,
        blob: Vec<u8>,
    },
    UserauthInfoResponse {
        responses: Vec<String>,
    },
    GlobalRequest {
        name: String,
        want_reply: bool,
        data: Vec<u8>,
    },
    RequestSuccess(Vec<u8>),
    RequestFailure,
    ChannelOpen {
        channel_type: String,
        sender_channel: u32,
        initial_window: u32,
        max_packet: u32,
        data: Vec<u8>,
    },
    ChannelOpenConfirmation {
        recipient_channel: u32,
        sender_channel: u32,
        initial_window: u32,
        max_packet: u32,
        data: Vec<u8>,
    },
    ChannelOpenFailure {
        recipient_channel: u32,
        reason: u32,
        description: String,
        lang: String,
    },
    ChannelWindowAdjust {
        recipient_channel: u32,
        amount: u32,
    },
    ChannelData {
        recipient_channel: u32,
        data: Vec<u8>,
    },
    ChannelExtendedData {
        recipient_channel: u32,
        data_type: u32,
        data: Vec<u8>,
    },
    ChannelEof {
        recipient_channel: u32,
    },
    ChannelClose {
        recipient_channel: u32,
    },
    ChannelRequest {
        recipient_channel: u32,
        want_reply: bool,
        request: ChannelRequestKind,
    },
    ChannelSuccess {
        recipient_channel: u32,
    },
    ChannelFailure {
        recipient_channel: u32,
    },
    Ping(Vec<u8>),
    Pong(Vec<u8>),
    /// Anything not understood, retained verbatim. `raw` excludes the
    /// message-code byte.
    Unknown {
        code: u8,
        raw: Vec<u8>,
    },
}

impl Message {
    /// The message code this variant was parsed from.
    pub fn code(&self) -> u8 {
        match self {
            Message::Disconnect { .. } => SSH_MSG_DISCONNECT,
            Message::Ignore(_) => SSH_MSG_IGNORE,
            Message::Unimplemented(_) => SSH_MSG_UNIMPLEMENTED,
            Message::Debug { .. } => SSH_MSG_DEBUG,
            Message::ServiceRequest(_) => SSH_MSG_SERVICE_REQUEST,
            Message::ServiceAccept(_) => SSH_MSG_SERVICE_ACCEPT,
            Message::ExtInfo(_) => SSH_MSG_EXT_INFO,
            Message::KexInit(_) => SSH_MSG_KEXINIT,
            Message::NewKeys => SSH_MSG_NEWKEYS,
            Message::KexDhInit { .. } => SSH_MSG_KEXDH_INIT,
            Message::KexDhReply { .. } => SSH_MSG_KEXDH_REPLY,
            Message::KexGexRequestOld { .. } => SSH_MSG_KEX_DH_GEX_REQUEST_OLD,
            Message::KexGexRequest { .. } => SSH_MSG_KEX_DH_GEX_REQUEST,
            Message::KexGexGroup { .. } => SSH_MSG_KEX_DH_GEX_GROUP,
            Message::KexGexInit { .. } => SSH_MSG_KEX_DH_GEX_INIT,
            Message::KexGexReply { .. } => SSH_MSG_KEX_DH_GEX_REPLY,
            Message::KexEcdhInit { .. } => SSH_MSG_KEXDH_INIT,
            Message::KexEcdhReply { .. } => SSH_MSG_KEXDH_REPLY,
            Message::UserauthRequest { .. } => SSH_MSG_USERAUTH_REQUEST,
            Message::UserauthFailure { .. } => SSH_MSG_USERAUTH_FAILURE,
            Message::UserauthSuccess => SSH_MSG_USERAUTH_SUCCESS,
            Message::UserauthBanner { .. } => SSH_MSG_USERAUTH_BANNER,
            Message::UserauthPkOk { .. } => SSH_MSG_USERAUTH_PK_OK,
            Message::UserauthInfoResponse { .. } => SSH_MSG_USERAUTH_INFO_RESPONSE,
            Message::GlobalRequest { .. } => SSH_MSG_GLOBAL_REQUEST,
            Message::RequestSuccess(_) => SSH_MSG_REQUEST_SUCCESS,
            Message::RequestFailure => SSH_MSG_REQUEST_FAILURE,
            Message::ChannelOpen { .. } => SSH_MSG_CHANNEL_OPEN,
            Message::ChannelOpenConfirmation { .. } => SSH_MSG_CHANNEL_OPEN_CONFIRMATION,
            Message::ChannelOpenFailure { .. } => SSH_MSG_CHANNEL_OPEN_FAILURE,
            Message::ChannelWindowAdjust { .. } => SSH_MSG_CHANNEL_WINDOW_ADJUST,
            Message::ChannelData { .. } => SSH_MSG_CHANNEL_DATA,
            Message::ChannelExtendedData { .. } => SSH_MSG_CHANNEL_EXTENDED_DATA,
            Message::ChannelEof { .. } => SSH_MSG_CHANNEL_EOF,
            Message::ChannelClose { .. } => SSH_MSG_CHANNEL_CLOSE,
            Message::ChannelRequest { .. } => SSH_MSG_CHANNEL_REQUEST,
            Message::ChannelSuccess { .. } => SSH_MSG_CHANNEL_SUCCESS,
            Message::ChannelFailure { .. } => SSH_MSG_CHANNEL_FAILURE,
            Message::Ping(_) => SSH_MSG_PING,
            Message::Pong(_) => SSH_MSG_PONG,
            Message::Unknown { code, .. } => *code,
        }
    }
}

fn string_vec(i: &[u8]) -> IResult<&[u8], Vec<u8>> {
    let (i, s) = wire::parse_string(i)?;
    Ok((i, s.to_vec()))
}

fn string_owned(i: &[u8]) -> IResult<&[u8], String> {
    let (i, s) = wire::parse_string(i)?;
    Ok((i, String::from_utf8_lossy(s).into_owned()))
}

fn name_list_owned(i: &[u8]) -> IResult<&[u8], Vec<String>> {
    let (i, raw) = wire::parse_string(i)?;
    Ok((
        i,
        wire::split_name_list(raw)
            .into_iter()
            .map(str::to_owned)
            .collect(),
    ))
}

/// Parse an SSH_MSG_KEXINIT payload (`payload[0]` must be code 20).
pub fn parse_kexinit(payload: &[u8]) -> Option<KexInit> {
    fn fields<'a>(i: &'a [u8], payload: &[u8]) -> IResult<&'a [u8], KexInit> {
        let (i, cookie) = nom::bytes::complete::take(16usize)(i)?;
        let (i, (kex, hostkey)) = tuple((string_owned, string_owned))(i)?;
        let (i, (enc_c2s, enc_s2c)) = tuple((string_owned, string_owned))(i)?;
        let (i, (mac_c2s, mac_s2c)) = tuple((string_owned, string_owned))(i)?;
        let (i, (comp_c2s, comp_s2c)) = tuple((string_owned, string_owned))(i)?;
        let (i, (lang_c2s, lang_s2c)) = tuple((string_owned, string_owned))(i)?;
        let (i, follows) = be_u8(i)?;
        let (i, _reserved) = be_u32(i)?;
        let mut cookie_buf = [0u8; 16];
        cookie_buf.copy_from_slice(cookie);
        Ok((
            i,
            KexInit {
                cookie: cookie_buf,
                kex_algs: kex,
                server_host_key_algs: hostkey,
                encr_algs_client_to_server: enc_c2s,
                encr_algs_server_to_client: enc_s2c,
                mac_algs_client_to_server: mac_c2s,
                mac_algs_server_to_client: mac_s2c,
                comp_algs_client_to_server: comp_c2s,
                comp_algs_server_to_client: comp_s2c,
                langs_client_to_server: lang_c2s,
                langs_server_to_client: lang_s2c,
                first_kex_packet_follows: follows > 0,
                raw: payload.to_vec(),
            },
        ))
    }
    if payload.first() != Some(&SSH_MSG_KEXINIT) {
        return None;
    }
    fields(&payload[1..], payload).ok().map(|(_, kexinit)| kexinit)
}

fn parse_extension(i: &[u8]) -> IResult<&[u8], Extension> {
    let (i, name) = string_owned(i)?;
    let (i, value) = wire::parse_string(i)?;
    let ext = match name.as_str() {
        "server-sig-algs" => Extension::ServerSigAlgs(
            wire::split_name_list(value)
                .into_iter()
                .map(str::to_owned)
                .collect(),
        ),
        "delay-compression" => {
            match tuple((name_list_owned, name_list_owned))(value) {
                Ok((_, (c2s, s2c))) => Extension::DelayCompression {
                    client_to_server: c2s,
                    server_to_client: s2c,
                },
                Err(_) => Extension::Other {
                    name,
                    value: value.to_vec(),
                },
            }
        }
        "no-flow-control" => Extension::NoFlowControl(String::from_utf8_lossy(value).into_owned()),
        "elevation" => Extension::Elevation(String::from_utf8_lossy(value).into_owned()),
        "publickey-algorithms@roumenpetrov.info" => Extension::PublickeyAlgorithms(
            wire::split_name_list(value)
                .into_iter()
                .map(str::to_owned)
                .collect(),
        ),
        "ping@openssh.com" => Extension::Ping(String::from_utf8_lossy(value).into_owned()),
        _ => Extension::Other {
            name,
            value: value.to_vec(),
        },
    };
    Ok((i, ext))
}

fn parse_ext_info(i: &[u8]) -> IResult<&[u8], Message> {
    let (i, count) = be_u32(i)?;
    let mut extensions = Vec::new();
    let mut rest = i;
    for _ in 0..count {
        let (next, ext) = parse_extension(rest)?;
        extensions.push(ext);
        rest = next;
    }
    Ok((rest, Message::ExtInfo(extensions)))
}

fn parse_auth_request(i: &[u8]) -> IResult<&[u8], Message> {
    let (i, (user, service, method_name)) =
        tuple((string_owned, string_owned, string_owned))(i)?;
    let method = match method_name.as_str() {
        "none" => AuthMethod::None,
        "password" => {
            let (_, (_change, _password)) = tuple((be_u8, wire::parse_string))(i)?;
            // The password itself is not retained.
            AuthMethod::Password {
                password_present: true,
            }
        }
        "publickey" => {
            let (_, (has_sig, algorithm, blob)) =
                tuple((be_u8, string_owned, string_vec))(i)?;
            AuthMethod::Publickey {
                has_signature: has_sig > 0,
                algorithm,
                blob,
            }
        }
        "hostbased" => {
            let (_, (algorithm, _blob, host, user)) =
                tuple((string_owned, wire::parse_string, string_owned, string_owned))(i)?;
            AuthMethod::Hostbased {
                algorithm,
                host,
                user,
            }
        }
        "keyboard-interactive" => {
            let (_, (_lang, submethods)) = tuple((wire::parse_string, string_owned))(i)?;
            AuthMethod::KeyboardInteractive { submethods }
        }
        _ => AuthMethod::Other {
            name: method_name,
            data: i.to_vec(),
        },
    };
    Ok((
        &[][..],
        Message::UserauthRequest {
            user,
            service,
            method,
        },
    ))
}

fn parse_terminal_modes(raw: &[u8]) -> Vec<(u8, u32)> {
    let mut modes = Vec::new();
    let mut i = raw;
    while let Ok((rest, opcode)) = be_u8::<_, nom::error::Error<&[u8]>>(i) {
        if opcode == 0 {
            break;
        }
        // Opcodes 1..=159 carry a uint32 argument; 160+ are reserved
        // for extensions we do not interpret.
        if opcode >= 160 {
            break;
        }
        match be_u32::<_, nom::error::Error<&[u8]>>(rest) {
            Ok((rest, arg)) => {
                modes.push((opcode, arg));
                i = rest;
            }
            Err(_) => break,
        }
    }
    modes
}

fn parse_channel_request(i: &[u8]) -> IResult<&[u8], Message> {
    let (i, recipient_channel) = be_u32(i)?;
    let (i, name) = string_owned(i)?;
    let (i, want_reply) = be_u8(i)?;
    let request = match name.as_str() {
        "subsystem" => {
            let (_, subsystem) = string_owned(i)?;
            ChannelRequestKind::Subsystem(subsystem)
        }
        "exec" => {
            let (_, command) = string_owned(i)?;
            ChannelRequestKind::Exec(command)
        }
        "shell" => ChannelRequestKind::Shell,
        "pty-req" => {
            let (_, (term, cols, rows, width_px, height_px, modes)) = tuple((
                string_owned,
                be_u32,
                be_u32,
                be_u32,
                be_u32,
                wire::parse_string,
            ))(i)?;
            ChannelRequestKind::PtyReq {
                term,
                cols,
                rows,
                width_px,
                height_px,
                modes: parse_terminal_modes(modes),
            }
        }
        "env" => {
            let (_, (name, value)) = tuple((string_owned, string_owned))(i)?;
            ChannelRequestKind::Env { name, value }
        }
        "exit-status" => {
            let (_, status) = be_u32(i)?;
            ChannelRequestKind::ExitStatus(status)
        }
        "exit-signal" => {
            let (_, (signal, core, message, lang)) =
                tuple((string_owned, be_u8, string_owned, string_owned))(i)?;
            ChannelRequestKind::ExitSignal {
                signal,
                core_dumped: core > 0,
                message,
                lang,
            }
        }
        "window-change" => {
            let (_, (cols, rows, width_px, height_px)) =
                tuple((be_u32, be_u32, be_u32, be_u32))(i)?;
            ChannelRequestKind::WindowChange {
                cols,
                rows,
                width_px,
                height_px,
            }
        }
        _ => ChannelRequestKind::Other {
            name,
            data: i.to_vec(),
        },
    };
    Ok((
        &[][..],
        Message::ChannelRequest {
            recipient_channel,
            want_reply: want_reply > 0,
            request,
        },
    ))
}

fn parse_kex_method(code: u8, body: &[u8], dialect: KexDialect) -> Option<Message> {
    match dialect {
        KexDialect::DiffieHellman => match code {
            SSH_MSG_KEXDH_INIT => {
                let (_, e) = string_vec(body).ok()?;
                Some(Message::KexDhInit { e })
            }
            SSH_MSG_KEXDH_REPLY => {
                let (_, (host_key, f, signature)) =
                    tuple((string_vec, string_vec, string_vec))(body).ok()?;
                Some(Message::KexDhReply {
                    host_key,
                    f,
                    signature,
                })
            }
            _ => None,
        },
        KexDialect::GroupExchange => match code {
            SSH_MSG_KEX_DH_GEX_REQUEST_OLD => {
                let (_, n) = be_u32::<_, nom::error::Error<&[u8]>>(body).ok()?;
                Some(Message::KexGexRequestOld { n })
            }
            SSH_MSG_KEX_DH_GEX_GROUP => {
                let (_, (p, g)) = tuple((string_vec, string_vec))(body).ok()?;
                Some(Message::KexGexGroup { p, g })
            }
            SSH_MSG_KEX_DH_GEX_INIT => {
                let (_, e) = string_vec(body).ok()?;
                Some(Message::KexGexInit { e })
            }
            SSH_MSG_KEX_DH_GEX_REPLY => {
                let (_, (host_key, f, signature)) =
                    tuple((string_vec, string_vec, string_vec))(body).ok()?;
                Some(Message::KexGexReply {
                    host_key,
                    f,
                    signature,
                })
            }
            SSH_MSG_KEX_DH_GEX_REQUEST => {
                let parsed: IResult<&[u8], (u32, u32, u32)> =
                    tuple((be_u32, be_u32, be_u32))(body);
                let (_, (min, n, max)) = parsed.ok()?;
                Some(Message::KexGexRequest { min, n, max })
            }
            _ => None,
        },
        KexDialect::Ecdh => match code {
            SSH_MSG_KEXDH_INIT => {
                let (_, q_client) = string_vec(body).ok()?;
                Some(Message::KexEcdhInit { q_client })
            }
            SSH_MSG_KEXDH_REPLY => {
                let (_, (host_key, q_server, signature)) =
                    tuple((string_vec, string_vec, string_vec))(body).ok()?;
                Some(Message::KexEcdhReply {
                    host_key,
                    q_server,
                    signature,
                })
            }
            _ => None,
        },
    }
}

/// Dissect one decrypted payload (starting at its message-code byte).
///
/// Never fails: anything that does not parse cleanly comes back as
/// [`Message::Unknown`].
pub fn parse_message(payload: &[u8], ctx: &DispatchContext) -> Message {
    let code = match payload.first() {
        Some(&code) => code,
        None => {
            return Message::Unknown {
                code: 0,
                raw: Vec::new(),
            }
        }
    };
    let body = &payload[1..];
    let unknown = || Message::Unknown {
        code,
        raw: body.to_vec(),
    };

    match classify(code) {
        MessageClass::TransportGeneric => match code {
            SSH_MSG_DISCONNECT => tuple((be_u32, string_owned, string_owned))(body)
                .map(|(_, (reason, description, lang))| Message::Disconnect {
                    reason,
                    description,
                    lang,
                })
                .unwrap_or_else(|_| unknown()),
            SSH_MSG_IGNORE => string_vec(body)
                .map(|(_, data)| Message::Ignore(data))
                .unwrap_or_else(|_| unknown()),
            SSH_MSG_UNIMPLEMENTED => be_u32::<_, nom::error::Error<&[u8]>>(body)
                .map(|(_, seq)| Message::Unimplemented(seq))
                .unwrap_or_else(|_| unknown()),
            SSH_MSG_DEBUG => tuple((be_u8, string_owned, string_owned))(body)
                .map(|(_, (display, message, lang))| Message::Debug {
                    always_display: display > 0,
                    message,
                    lang,
                })
                .unwrap_or_else(|_| unknown()),
            SSH_MSG_SERVICE_REQUEST => string_owned(body)
                .map(|(_, service)| Message::ServiceRequest(service))
                .unwrap_or_else(|_| unknown()),
            SSH_MSG_SERVICE_ACCEPT => string_owned(body)
                .map(|(_, service)| Message::ServiceAccept(service))
                .unwrap_or_else(|_| unknown()),
            SSH_MSG_EXT_INFO => parse_ext_info(body)
                .map(|(_, msg)| msg)
                .unwrap_or_else(|_| unknown()),
            _ => unknown(),
        },
        MessageClass::AlgorithmNegotiation => match code {
            SSH_MSG_KEXINIT => parse_kexinit(payload)
                .map(Message::KexInit)
                .unwrap_or_else(unknown),
            SSH_MSG_NEWKEYS => Message::NewKeys,
            _ => unknown(),
        },
        MessageClass::KexMethodSpecific => ctx
            .kex
            .and_then(|dialect| parse_kex_method(code, body, dialect))
            .unwrap_or_else(unknown),
        MessageClass::UserauthGeneric => match code {
            SSH_MSG_USERAUTH_REQUEST => parse_auth_request(body)
                .map(|(_, msg)| msg)
                .unwrap_or_else(|_| unknown()),
            SSH_MSG_USERAUTH_FAILURE => tuple((name_list_owned, be_u8))(body)
                .map(|(_, (methods, partial))| Message::UserauthFailure {
                    methods,
                    partial_success: partial > 0,
                })
                .unwrap_or_else(|_| unknown()),
            SSH_MSG_USERAUTH_SUCCESS => Message::UserauthSuccess,
            SSH_MSG_USERAUTH_BANNER => tuple((string_owned, string_owned))(body)
                .map(|(_, (message, lang))| Message::UserauthBanner { message, lang })
                .unwrap_or_else(|_| unknown()),
            _ => unknown(),
        },
        MessageClass::UserauthMethodSpecific => match (code, ctx.auth_method.as_deref()) {
            (SSH_MSG_USERAUTH_PK_OK, Some("publickey")) => {
                tuple((string_owned, string_vec))(body)
                    .map(|(_, (algorithm, blob))| Message::UserauthPkOk { algorithm, blob })
                    .unwrap_or_else(|_| unknown())
            }
            (SSH_MSG_USERAUTH_INFO_RESPONSE, Some("keyboard-interactive")) => {
                fn responses(i: &[u8]) -> IResult<&[u8], Vec<String>> {
                    let (i, count) = be_u32(i)?;
                    let mut out = Vec::new();
                    let mut rest = i;
                    for _ in 0..count {
                        let (next, response) = string_owned(rest)?;
                        out.push(response);
                        rest = next;
                    }
                    Ok((rest, out))
                }
                responses(body)
                    .map(|(_, responses)| Message::UserauthInfoResponse { responses })
                    .unwrap_or_else(|_| unknown())
            }
            _ => unknown(),
        },
        MessageClass::ConnectionGeneric => match code {
            SSH_MSG_GLOBAL_REQUEST => tuple((string_owned, be_u8, rest))(body)
                .map(|(_, (name, want_reply, data))| Message::GlobalRequest {
                    name,
                    want_reply: want_reply > 0,
                    data: data.to_vec(),
                })
                .unwrap_or_else(|_| unknown()),
            SSH_MSG_REQUEST_SUCCESS => Message::RequestSuccess(body.to_vec()),
            SSH_MSG_REQUEST_FAILURE => Message::RequestFailure,
            _ => unknown(),
        },
        MessageClass::ChannelRelated => match code {
            SSH_MSG_CHANNEL_OPEN => tuple((string_owned, be_u32, be_u32, be_u32, rest))(body)
                .map(
                    |(_, (channel_type, sender_channel, initial_window, max_packet, data))| {
                        Message::ChannelOpen {
                            channel_type,
                            sender_channel,
                            initial_window,
                            max_packet,
                            data: data.to_vec(),
                        }
                    },
                )
                .unwrap_or_else(|_| unknown()),
            SSH_MSG_CHANNEL_OPEN_CONFIRMATION => {
                tuple::<_, _, nom::error::Error<&[u8]>, _>((be_u32, be_u32, be_u32, be_u32, rest))(
                    body,
                )
                    .map(
                        |(_, (recipient, sender, initial_window, max_packet, data))| {
                            Message::ChannelOpenConfirmation {
                                recipient_channel: recipient,
                                sender_channel: sender,
                                initial_window,
                                max_packet,
                                data: data.to_vec(),
                            }
                        },
                    )
                    .unwrap_or_else(|_| unknown())
            }
            SSH_MSG_CHANNEL_OPEN_FAILURE => {
                tuple((be_u32, be_u32, string_owned, string_owned))(body)
                    .map(|(_, (recipient, reason, description, lang))| {
                        Message::ChannelOpenFailure {
                            recipient_channel: recipient,
                            reason,
                            description,
                            lang,
                        }
                    })
                    .unwrap_or_else(|_| unknown())
            }
            SSH_MSG_CHANNEL_WINDOW_ADJUST => tuple::<_, _, nom::error::Error<&[u8]>, _>((
                be_u32, be_u32,
            ))(body)
                .map(|(_, (recipient, amount))| Message::ChannelWindowAdjust {
                    recipient_channel: recipient,
                    amount,
                })
                .unwrap_or_else(|_| unknown()),
            SSH_MSG_CHANNEL_DATA => tuple((be_u32, string_vec))(body)
                .map(|(_, (recipient, data))| Message::ChannelData {
                    recipient_channel: recipient,
                    data,
                })
                .unwrap_or_else(|_| unknown()),
            SSH_MSG_CHANNEL_EXTENDED_DATA => tuple((be_u32, be_u32, string_vec))(body)
                .map(|(_, (recipient, data_type, data))| Message::ChannelExtendedData {
                    recipient_channel: recipient,
                    data_type,
                    data,
                })
                .unwrap_or_else(|_| unknown()),
            SSH_MSG_CHANNEL_EOF => be_u32::<_, nom::error::Error<&[u8]>>(body)
                .map(|(_, recipient)| Message::ChannelEof {
                    recipient_channel: recipient,
                })
                .unwrap_or_else(|_| unknown()),
            SSH_MSG_CHANNEL_CLOSE => be_u32::<_, nom::error::Error<&[u8]>>(body)
                .map(|(_, recipient)| Message::ChannelClose {
                    recipient_channel: recipient,
                })
                .unwrap_or_else(|_| unknown()),
            SSH_MSG_CHANNEL_REQUEST => parse_channel_request(body)
                .map(|(_, msg)| msg)
                .unwrap_or_else(|_| unknown()),
            SSH_MSG_CHANNEL_SUCCESS => be_u32::<_, nom::error::Error<&[u8]>>(body)
                .map(|(_, recipient)| Message::ChannelSuccess {
                    recipient_channel: recipient,
                })
                .unwrap_or_else(|_| unknown()),
            SSH_MSG_CHANNEL_FAILURE => be_u32::<_, nom::error::Error<&[u8]>>(body)
                .map(|(_, recipient)| Message::ChannelFailure {
                    recipient_channel: recipient,
                })
                .unwrap_or_else(|_| unknown()),
            _ => unknown(),
        },
        MessageClass::Reserved => unknown(),
        MessageClass::LocalExtension => match code {
            SSH_MSG_PING if ctx.ping_enabled => string_vec(body)
                .map(|(_, data)| Message::Ping(data))
                .unwrap_or_else(|_| unknown()),
            SSH_MSG_PONG if ctx.ping_enabled => string_vec(body)
                .map(|(_, data)| Message::Pong(data))
                .unwrap_or_else(|_| unknown()),
            _ => unknown(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::{put_string, put_u32};

    fn ctx() -> DispatchContext {
        DispatchContext::default()
    }

    #[test]
    fn test_classify_ranges() {
        assert_eq!(classify(1), MessageClass::TransportGeneric);
        assert_eq!(classify(20), MessageClass::AlgorithmNegotiation);
        assert_eq!(classify(30), MessageClass::KexMethodSpecific);
        assert_eq!(classify(50), MessageClass::UserauthGeneric);
        assert_eq!(classify(60), MessageClass::UserauthMethodSpecific);
        assert_eq!(classify(80), MessageClass::ConnectionGeneric);
        assert_eq!(classify(90), MessageClass::ChannelRelated);
        assert_eq!(classify(128), MessageClass::Reserved);
        assert_eq!(classify(192), MessageClass::LocalExtension);
    }

    #[test]
    fn test_unknown_code_passthrough() {
        let payload = [150u8, 1, 2, 3];
        match parse_message(&payload, &ctx()) {
            Message::Unknown { code, raw } => {
                assert_eq!(code, 150);
                assert_eq!(raw, vec![1, 2, 3]);
            }
            other => panic!("expected Unknown, got {:?}", other),
        }
    }

    #[test]
    fn test_disconnect() {
        let mut payload = vec![SSH_MSG_DISCONNECT];
        put_u32(&mut payload, 2);
        put_string(&mut payload, b"protocol error");
        put_string(&mut payload, b"en");
        match parse_message(&payload, &ctx()) {
            Message::Disconnect {
                reason,
                description,
                ..
            } => {
                assert_eq!(reason, 2);
                assert_eq!(description, "protocol error");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_channel_data() {
        let mut payload = vec![SSH_MSG_CHANNEL_DATA];
        put_u32(&mut payload, 3);
        put_string(&mut payload, b"ls -la\n");
        match parse_message(&payload, &ctx()) {
            Message::ChannelData {
                recipient_channel,
                data,
            } => {
                assert_eq!(recipient_channel, 3);
                assert_eq!(data, b"ls -la\n");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_channel_request_subsystem() {
        let mut payload = vec![SSH_MSG_CHANNEL_REQUEST];
        put_u32(&mut payload, 7);
        put_string(&mut payload, b"subsystem");
        payload.push(1);
        put_string(&mut payload, b"sftp");
        match parse_message(&payload, &ctx()) {
            Message::ChannelRequest {
                recipient_channel,
                want_reply,
                request: ChannelRequestKind::Subsystem(name),
            } => {
                assert_eq!(recipient_channel, 7);
                assert!(want_reply);
                assert_eq!(name, "sftp");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_ext_info_server_sig_algs_and_opaque() {
        let mut payload = vec![SSH_MSG_EXT_INFO];
        put_u32(&mut payload, 2);
        put_string(&mut payload, b"server-sig-algs");
        put_string(&mut payload, b"ssh-ed25519,rsa-sha2-256");
        put_string(&mut payload, b"some-future-ext@example.com");
        put_string(&mut payload, &[1, 2, 3]);
        match parse_message(&payload, &ctx()) {
            Message::ExtInfo(extensions) => {
                assert_eq!(extensions.len(), 2);
                assert_eq!(
                    extensions[0],
                    Extension::ServerSigAlgs(vec![
                        "ssh-ed25519".to_owned(),
                        "rsa-sha2-256".to_owned()
                    ])
                );
                assert!(matches!(extensions[1], Extension::Other { .. }));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_kex_method_needs_dialect() {
        let mut payload = vec![SSH_MSG_KEXDH_INIT];
        put_string(&mut payload, &[0x42; 32]);
        // No dialect known: passthrough.
        assert!(matches!(
            parse_message(&payload, &ctx()),
            Message::Unknown { code: 30, .. }
        ));
        let mut ecdh = ctx();
        ecdh.kex = Some(KexDialect::Ecdh);
        assert!(matches!(
            parse_message(&payload, &ecdh),
            Message::KexEcdhInit { .. }
        ));
        let mut gex = ctx();
        gex.kex = Some(KexDialect::GroupExchange);
        // In the group-exchange dialect code 30 is REQUEST_OLD and the
        // payload does not fit, so it falls through as unknown.
        assert!(matches!(
            parse_message(&payload, &gex),
            Message::KexGexRequestOld { .. } | Message::Unknown { .. }
        ));
    }

    #[test]
    fn test_ping_requires_offer() {
        let mut payload = vec![SSH_MSG_PING];
        put_string(&mut payload, b"abc");
        assert!(matches!(
            parse_message(&payload, &ctx()),
            Message::Unknown { code: 192, .. }
        ));
        let mut enabled = ctx();
        enabled.ping_enabled = true;
        assert!(matches!(parse_message(&payload, &enabled), Message::Ping(_)));
    }

    #[test]
    fn test_pty_req_modes() {
        let mut modes = Vec::new();
        modes.push(53); // ECHO
        modes.extend_from_slice(&1u32.to_be_bytes());
        modes.push(0); // TTY_OP_END
        let mut payload = vec![SSH_MSG_CHANNEL_REQUEST];
        put_u32(&mut payload, 1);
        put_string(&mut payload, b"pty-req");
        payload.push(0);
        put_string(&mut payload, b"xterm-256color");
        put_u32(&mut payload, 80);
        put_u32(&mut payload, 24);
        put_u32(&mut payload, 0);
        put_u32(&mut payload, 0);
        put_string(&mut payload, &modes);
        match parse_message(&payload, &ctx()) {
            Message::ChannelRequest {
                request:
                    ChannelRequestKind::PtyReq {
                        term, cols, modes, ..
                    },
                ..
            } => {
                assert_eq!(term, "xterm-256color");
                assert_eq!(cols, 80);
                assert_eq!(modes, vec![(53, 1)]);
            }
            other => panic!("unexpected {:?}", other),
        }
    }
}
