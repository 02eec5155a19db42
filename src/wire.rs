//! Wire-format primitives for the SSH 2.0 protocol.
//!
//! Readers use nom streaming parsers so that truncated input surfaces as
//! `Err::Incomplete` and can be mapped to a "need more bytes" signal by
//! the caller. Writers are used to rebuild the length-prefixed fields
//! that go into the exchange-hash transcript.

use std::str;

use nom::bytes::streaming::{tag, take};
use nom::character::streaming::{line_ending, not_line_ending};
use nom::combinator::{map, map_res, opt};
use nom::number::streaming::{be_u8, be_u32};
use nom::sequence::preceded;
use nom::IResult;

/// Hard upper bound on `packet_length` (RFC 4253 keeps real packets well
/// below this; anything larger is treated as a framing failure).
pub const MAX_PACKET_LEN: u32 = 32768;

/// Parse a length-prefixed SSH `string` (RFC 4251 section 5).
pub fn parse_string(i: &[u8]) -> IResult<&[u8], &[u8]> {
    let (i, len) = be_u32(i)?;
    take(len)(i)
}

/// Parse a length-prefixed SSH `string` as UTF-8.
pub fn parse_utf8_string(i: &[u8]) -> IResult<&[u8], &str> {
    map_res(parse_string, str::from_utf8)(i)
}

/// Parse an SSH `boolean`.
pub fn parse_bool(i: &[u8]) -> IResult<&[u8], bool> {
    map(be_u8, |b| b > 0)(i)
}

/// Split a raw name-list field into its comma-separated names.
///
/// Name lists are printable US-ASCII (RFC 4251 section 5); an empty
/// field yields an empty vector, which is a routine outcome for the
/// language categories.
pub fn split_name_list(raw: &[u8]) -> Vec<&str> {
    if raw.is_empty() {
        return Vec::new();
    }
    raw.split(|&b| b == b',')
        .filter_map(|name| str::from_utf8(name).ok())
        .collect()
}

/// SSH Protocol Version Exchange line, split into its parts.
///
/// Defined in [RFC 4253 section 4.2](https://tools.ietf.org/html/rfc4253#section-4.2).
#[derive(Clone, Debug, PartialEq)]
pub struct SshVersion<'a> {
    pub proto: &'a [u8],
    pub software: &'a [u8],
    pub comments: Option<&'a [u8]>,
}

/// Parse one `SSH-protoversion-softwareversion SP comments` line.
///
/// The terminator is CRLF for 2.0 implementations but a bare LF is
/// accepted for compatibility with older versions. The returned slice
/// positions exclude the line terminator.
pub fn parse_version_line(i: &[u8]) -> IResult<&[u8], SshVersion<'_>> {
    let (i, _) = tag("SSH-")(i)?;
    let (i, proto) = nom::bytes::streaming::take_until("-")(i)?;
    let (i, _) = tag("-")(i)?;
    let (i, software) = nom::bytes::streaming::is_not(" \r\n")(i)?;
    let (i, comments) = opt(preceded(tag(" "), not_line_ending))(i)?;
    let (i, _) = line_ending(i)?;
    Ok((
        i,
        SshVersion {
            proto,
            software,
            comments,
        },
    ))
}

/// Take one line terminated by CR?LF, returning it without the terminator.
///
/// Used to skip the arbitrary pre-version banner lines a server may send
/// before its identification line.
pub fn parse_banner_line(i: &[u8]) -> IResult<&[u8], &[u8]> {
    let (rest, line) = not_line_ending(i)?;
    let (rest, _) = line_ending(rest)?;
    Ok((rest, line))
}

/// An SSH binary packet with the payload/padding split applied but the
/// payload left unparsed (RFC 4253 section 6).
#[derive(Debug, PartialEq)]
pub struct RawSshPacket<'a> {
    /// Message payload, starting with the message-code byte.
    pub payload: &'a [u8],
    pub padding: &'a [u8],
}

/// Parse a plaintext SSH binary packet.
///
/// `uint32 packet_length | byte padding_length | payload | padding`.
/// `packet_length` excludes itself and any MAC. The caller is expected
/// to have bounds-checked `packet_length` against [`MAX_PACKET_LEN`]
/// before treating a failure here as anything but corruption.
pub fn parse_packet(i: &[u8]) -> IResult<&[u8], RawSshPacket<'_>> {
    let (i, packet_length) = be_u32(i)?;
    let (i, padding_length) = be_u8(i)?;
    if u32::from(padding_length) + 1 > packet_length || packet_length > MAX_PACKET_LEN {
        return Err(nom::Err::Error(nom::error::Error::new(
            i,
            nom::error::ErrorKind::LengthValue,
        )));
    }
    let (i, payload) = take(packet_length - u32::from(padding_length) - 1)(i)?;
    let (i, padding) = take(padding_length)(i)?;
    Ok((i, RawSshPacket { payload, padding }))
}

/// Append a `uint32` in network byte order.
pub fn put_u32(buf: &mut Vec<u8>, v: u32) {
    buf.extend_from_slice(&v.to_be_bytes());
}

/// Append a length-prefixed SSH `string`.
pub fn put_string(buf: &mut Vec<u8>, data: &[u8]) {
    put_u32(buf, data.len() as u32);
    buf.extend_from_slice(data);
}

/// Append an unsigned big-endian magnitude as an SSH `mpint`.
///
/// Leading zero octets are dropped and a single zero octet is re-added
/// when the most significant bit is set, so the value always reads back
/// as positive (RFC 4251 section 5).
pub fn put_mpint(buf: &mut Vec<u8>, magnitude: &[u8]) {
    let mut start = 0;
    while start < magnitude.len() && magnitude[start] == 0 {
        start += 1;
    }
    let trimmed = &magnitude[start..];
    let pad = !trimmed.is_empty() && trimmed[0] & 0x80 != 0;
    put_u32(buf, (trimmed.len() + pad as usize) as u32);
    if pad {
        buf.push(0);
    }
    buf.extend_from_slice(trimmed);
}

/// Strip the sign padding from an SSH `mpint` body, yielding the
/// magnitude bytes. Negative values do not occur in key-exchange
/// material; a set sign bit after stripping means the encoder relied on
/// the leading zero octet, which is exactly what gets removed here.
pub fn mpint_magnitude(body: &[u8]) -> &[u8] {
    let mut start = 0;
    while start < body.len() && body[start] == 0 {
        start += 1;
    }
    &body[start..]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_string_roundtrip() {
        for len in &[0usize, 1, 255, 65536] {
            let data = vec![0x5au8; *len];
            let mut buf = Vec::new();
            put_string(&mut buf, &data);
            let (rest, parsed) = parse_string(&buf).unwrap();
            assert!(rest.is_empty());
            assert_eq!(parsed, &data[..]);
        }
    }

    #[test]
    fn test_string_incomplete() {
        let mut buf = Vec::new();
        put_string(&mut buf, b"hello");
        assert!(matches!(
            parse_string(&buf[..6]),
            Err(nom::Err::Incomplete(_))
        ));
    }

    #[test]
    fn test_version_line() {
        let (rest, v) = parse_version_line(b"SSH-2.0-OpenSSH_9.6p1 Debian-3\r\nxx").unwrap();
        assert_eq!(rest, b"xx");
        assert_eq!(v.proto, b"2.0");
        assert_eq!(v.software, b"OpenSSH_9.6p1");
        assert_eq!(v.comments, Some(&b"Debian-3"[..]));
    }

    #[test]
    fn test_version_line_bare_lf() {
        let (_, v) = parse_version_line(b"SSH-1.99-Cisco-1.25\n").unwrap();
        assert_eq!(v.proto, b"1.99");
        assert_eq!(v.comments, None);
    }

    #[test]
    fn test_name_list_split() {
        assert_eq!(
            split_name_list(b"ssh-rsa,ssh-ed25519"),
            vec!["ssh-rsa", "ssh-ed25519"]
        );
        assert!(split_name_list(b"").is_empty());
    }

    #[test]
    fn test_mpint_high_bit_pad() {
        let mut buf = Vec::new();
        put_mpint(&mut buf, &[0x80, 0x01]);
        assert_eq!(buf, vec![0, 0, 0, 3, 0, 0x80, 0x01]);
        assert_eq!(mpint_magnitude(&buf[4..]), &[0x80, 0x01]);
    }

    #[test]
    fn test_mpint_leading_zeros_trimmed() {
        let mut buf = Vec::new();
        put_mpint(&mut buf, &[0, 0, 0x12]);
        assert_eq!(buf, vec![0, 0, 0, 1, 0x12]);
    }

    #[test]
    fn test_packet_framing() {
        // len=12: padlen(1) + payload(5) + padding(6)
        let mut buf = Vec::new();
        put_u32(&mut buf, 12);
        buf.push(6);
        buf.extend_from_slice(&[21, 1, 2, 3, 4]);
        buf.extend_from_slice(&[0; 6]);
        let (rest, pkt) = parse_packet(&buf).unwrap();
        assert!(rest.is_empty());
        assert_eq!(pkt.payload, &[21, 1, 2, 3, 4]);
        assert_eq!(pkt.padding.len(), 6);
    }

    #[test]
    fn test_packet_padding_exceeds_length() {
        let mut buf = Vec::new();
        put_u32(&mut buf, 4);
        buf.push(200);
        buf.extend_from_slice(&[0; 8]);
        assert!(parse_packet(&buf).is_err());
    }
}
