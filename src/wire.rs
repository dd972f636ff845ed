// Wire format: control-message framing and the data packet header.
// Numan Thabit 2025

use prost::Message;
use thiserror::Error;

use crate::config::{MAX_PACKET_SIZE, MIN_PACKET_SIZE, MIN_PADDED_PACKET_SIZE};

/// Set in the lead byte of every data packet.  The remaining low bits are
/// per-packet flags.
pub const DATA_LEAD_BIT: u8 = 0x80;

/// Data-packet flag: a varint-prefixed protobuf stats blob follows the
/// header, ahead of the ciphertext.
pub const DATA_FLAG_PROTOBUF_BLOB: u8 = 0x01;

/// Fixed part of the data packet header: lead/flags byte, recipient
/// connection id (LE u32), wire sequence number (LE u16).
pub const DATA_HEADER_LEN: usize = 7;

/// Padded control messages carry a one-byte tag and a LE u16 body length
/// ahead of the protobuf body.
const PADDED_HEADER_LEN: usize = 3;

/// Control message tags (wire lead bytes).
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MsgKind {
    ChallengeRequest = 32,
    ChallengeReply = 33,
    ConnectRequest = 34,
    ConnectOk = 35,
    ConnectionClosed = 36,
    NoConnection = 37,
}

impl MsgKind {
    fn from_lead(lead: u8) -> Option<Self> {
        match lead {
            32 => Some(MsgKind::ChallengeRequest),
            33 => Some(MsgKind::ChallengeReply),
            34 => Some(MsgKind::ConnectRequest),
            35 => Some(MsgKind::ConnectOk),
            36 => Some(MsgKind::ConnectionClosed),
            37 => Some(MsgKind::NoConnection),
            _ => None,
        }
    }

    /// Whether this message type must be padded on the wire.
    pub fn padded(self) -> bool {
        matches!(self, MsgKind::ChallengeRequest | MsgKind::ConnectionClosed)
    }
}

/// Coarse classification of an inbound packet.
#[derive(Debug, PartialEq, Eq)]
pub enum PacketClass {
    /// Below the 5-byte floor; discard without logging detail.
    TooShort,
    /// Legacy connectionless traffic (0xFFFFFFFF lead); discard silently.
    Connectionless,
    /// Lead byte has the high bit set: a data packet.
    Data,
    /// A recognized control message.
    Control(MsgKind),
    /// Unknown lead byte.
    Unknown(u8),
}

/// Classifies a raw inbound packet by its first bytes.
pub fn classify(pkt: &[u8]) -> PacketClass {
    if pkt.len() < MIN_PACKET_SIZE {
        return PacketClass::TooShort;
    }
    if pkt[0] & DATA_LEAD_BIT != 0 {
        if pkt[..4] == [0xff, 0xff, 0xff, 0xff] {
            return PacketClass::Connectionless;
        }
        return PacketClass::Data;
    }
    match MsgKind::from_lead(pkt[0]) {
        Some(kind) => PacketClass::Control(kind),
        None => PacketClass::Unknown(pkt[0]),
    }
}

/// Wire-level error.
#[derive(Debug, Error)]
pub enum WireError {
    /// Packet shorter than the structure it claims to carry.
    #[error("packet of {len} bytes is too small (need {need})")]
    TooShort { len: usize, need: usize },

    /// Padded message below the minimum padded size.
    #[error("padded message is {len} bytes, must be at least {MIN_PADDED_PACKET_SIZE}")]
    PaddedTooSmall { len: usize },

    /// Declared padded body length inconsistent with the packet.
    #[error("invalid encoded message length {declared} in {packet} byte packet")]
    BadPaddedLength { declared: usize, packet: usize },

    /// Serialized message would exceed the wire MTU.
    #[error("message of {len} bytes exceeds max packet size {MAX_PACKET_SIZE}")]
    Oversize { len: usize },

    /// Protobuf body failed to parse.
    #[error("protobuf parse failed: {0}")]
    Decode(#[from] prost::DecodeError),

    /// Inline stats blob length failed to varint-decode.
    #[error("failed to varint decode size of stats blob")]
    BadVarint,

    /// Inline stats blob length exceeds the packet.
    #[error("stats blob of {declared} bytes exceeds remaining {available} bytes")]
    StatsOverrun { declared: usize, available: usize },
}

/// Serializes a bare control message: tag byte followed by the protobuf.
pub fn serialize_msg<M: Message>(kind: MsgKind, msg: &M) -> Result<Vec<u8>, WireError> {
    let body_len = msg.encoded_len();
    let total = body_len + 1;
    if total > MAX_PACKET_SIZE {
        return Err(WireError::Oversize { len: total });
    }
    let mut pkt = Vec::with_capacity(total);
    pkt.push(kind as u8);
    msg.encode(&mut pkt).map_err(|_| WireError::Oversize { len: total })?;
    Ok(pkt)
}

/// Serializes a padded control message: tag, LE body length, protobuf,
/// zero-padded to at least [`MIN_PADDED_PACKET_SIZE`] bytes.
///
/// Padding makes the request at least as large as any reply it can trigger,
/// so a spoofed source cannot use us for reflection amplification.
pub fn serialize_padded_msg<M: Message>(kind: MsgKind, msg: &M) -> Result<Vec<u8>, WireError> {
    let body_len = msg.encoded_len();
    let encoded = PADDED_HEADER_LEN + body_len;
    if encoded > MAX_PACKET_SIZE {
        return Err(WireError::Oversize { len: encoded });
    }
    let total = encoded.max(MIN_PADDED_PACKET_SIZE);
    let mut pkt = Vec::with_capacity(total);
    pkt.push(kind as u8);
    pkt.extend_from_slice(&(body_len as u16).to_le_bytes());
    msg.encode(&mut pkt).map_err(|_| WireError::Oversize { len: encoded })?;
    pkt.resize(total, 0);
    Ok(pkt)
}

/// Extracts the protobuf body of a padded control message.
pub fn parse_padded_body(pkt: &[u8]) -> Result<&[u8], WireError> {
    if pkt.len() < MIN_PADDED_PACKET_SIZE {
        return Err(WireError::PaddedTooSmall { len: pkt.len() });
    }
    let declared = u16::from_le_bytes([pkt[1], pkt[2]]) as usize;
    if declared == 0 || PADDED_HEADER_LEN + declared > pkt.len() {
        return Err(WireError::BadPaddedLength {
            declared,
            packet: pkt.len(),
        });
    }
    Ok(&pkt[PADDED_HEADER_LEN..PADDED_HEADER_LEN + declared])
}

/// Extracts the protobuf body of a bare control message.
pub fn parse_bare_body(pkt: &[u8]) -> Result<&[u8], WireError> {
    if pkt.is_empty() {
        return Err(WireError::TooShort { len: 0, need: 1 });
    }
    Ok(&pkt[1..])
}

/// Parsed fixed header of a data packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataHeader {
    /// Low-bit flags from the lead byte (high bit stripped).
    pub flags: u8,
    /// The recipient's connection id.
    pub to_connection_id: u32,
    /// Low 16 bits of the sender's packet number.
    pub wire_seq: u16,
}

impl DataHeader {
    /// Parses the fixed data header.
    pub fn parse(pkt: &[u8]) -> Result<Self, WireError> {
        if pkt.len() < DATA_HEADER_LEN {
            return Err(WireError::TooShort {
                len: pkt.len(),
                need: DATA_HEADER_LEN,
            });
        }
        Ok(Self {
            flags: pkt[0] & !DATA_LEAD_BIT,
            to_connection_id: u32::from_le_bytes([pkt[1], pkt[2], pkt[3], pkt[4]]),
            wire_seq: u16::from_le_bytes([pkt[5], pkt[6]]),
        })
    }

    /// Appends the encoded header to `out`.
    pub fn encode_into(&self, out: &mut Vec<u8>) {
        out.push(DATA_LEAD_BIT | self.flags);
        out.extend_from_slice(&self.to_connection_id.to_le_bytes());
        out.extend_from_slice(&self.wire_seq.to_le_bytes());
    }
}

/// Splits the trailer of a data packet (everything after the fixed header)
/// into the optional inline stats blob and the ciphertext.
pub fn split_data_trailer(
    trailer: &[u8],
    has_stats: bool,
) -> Result<(Option<&[u8]>, &[u8]), WireError> {
    if !has_stats {
        return Ok((None, trailer));
    }
    let mut buf = trailer;
    let declared = prost::encoding::decode_varint(&mut buf).map_err(|_| WireError::BadVarint)?;
    let declared = usize::try_from(declared).map_err(|_| WireError::BadVarint)?;
    if declared > buf.len() {
        return Err(WireError::StatsOverrun {
            declared,
            available: buf.len(),
        });
    }
    Ok((Some(&buf[..declared]), &buf[declared..]))
}

/// Appends a varint-prefixed protobuf blob to `out`.
pub fn encode_length_prefixed<M: Message>(msg: &M, out: &mut Vec<u8>) {
    prost::encoding::encode_varint(msg.encoded_len() as u64, out);
    // encoding into a Vec cannot fail
    let _ = msg.encode(out);
}

/// Wire size of a varint-prefixed protobuf blob.
pub fn length_prefixed_len<M: Message>(msg: &M) -> usize {
    let body = msg.encoded_len();
    prost::encoding::encoded_len_varint(body as u64) + body
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proto::{
        CMsgSteamSocketsUdpChallengeRequest, CMsgSteamSocketsUdpConnectionClosed,
        CMsgSteamSocketsUdpNoConnection, CMsgSteamSocketsUdpStats,
    };
    use proptest::prelude::*;

    fn challenge_request() -> CMsgSteamSocketsUdpChallengeRequest {
        CMsgSteamSocketsUdpChallengeRequest {
            connection_id: Some(100),
            my_timestamp: Some(123_456_789),
            protocol_version: Some(8),
        }
    }

    #[test]
    fn classify_by_lead_byte() {
        assert_eq!(classify(&[0u8; 4]), PacketClass::TooShort);
        assert_eq!(classify(&[0xff; 8]), PacketClass::Connectionless);
        assert_eq!(classify(&[0x81, 0, 0, 0, 0, 0, 0]), PacketClass::Data);
        assert_eq!(
            classify(&[32, 0, 0, 0, 0]),
            PacketClass::Control(MsgKind::ChallengeRequest)
        );
        assert_eq!(classify(&[99, 0, 0, 0, 0]), PacketClass::Unknown(99));
    }

    #[test]
    fn high_bit_with_nonff_prefix_is_data() {
        assert_eq!(classify(&[0xff, 0xff, 0xff, 0xfe, 0]), PacketClass::Data);
    }

    #[test]
    fn padded_round_trip_and_minimum_size() {
        let msg = challenge_request();
        let pkt = serialize_padded_msg(MsgKind::ChallengeRequest, &msg).expect("serialize");
        assert!(pkt.len() >= MIN_PADDED_PACKET_SIZE);
        assert_eq!(pkt[0], MsgKind::ChallengeRequest as u8);

        let body = parse_padded_body(&pkt).expect("parse");
        let decoded = CMsgSteamSocketsUdpChallengeRequest::decode(body).expect("decode");
        assert_eq!(decoded, msg);
    }

    #[test]
    fn padded_exactly_512_accepted_511_rejected() {
        let msg = challenge_request();
        let pkt = serialize_padded_msg(MsgKind::ChallengeRequest, &msg).expect("serialize");
        assert_eq!(pkt.len(), MIN_PADDED_PACKET_SIZE);
        assert!(parse_padded_body(&pkt).is_ok());
        assert!(matches!(
            parse_padded_body(&pkt[..MIN_PADDED_PACKET_SIZE - 1]),
            Err(WireError::PaddedTooSmall { len: 511 })
        ));
    }

    #[test]
    fn padded_declared_length_checked() {
        let msg = challenge_request();
        let mut pkt = serialize_padded_msg(MsgKind::ChallengeRequest, &msg).expect("serialize");
        pkt[1] = 0;
        pkt[2] = 0;
        assert!(matches!(
            parse_padded_body(&pkt),
            Err(WireError::BadPaddedLength { declared: 0, .. })
        ));
        let huge = (pkt.len() as u16).to_le_bytes();
        pkt[1] = huge[0];
        pkt[2] = huge[1];
        assert!(matches!(
            parse_padded_body(&pkt),
            Err(WireError::BadPaddedLength { .. })
        ));
    }

    #[test]
    fn bare_round_trip() {
        let msg = CMsgSteamSocketsUdpNoConnection {
            to_connection_id: Some(100),
            from_connection_id: Some(200),
        };
        let pkt = serialize_msg(MsgKind::NoConnection, &msg).expect("serialize");
        assert!(pkt.len() < MIN_PADDED_PACKET_SIZE);
        let decoded =
            CMsgSteamSocketsUdpNoConnection::decode(parse_bare_body(&pkt).unwrap()).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn connection_closed_is_padded() {
        let msg = CMsgSteamSocketsUdpConnectionClosed {
            to_connection_id: Some(100),
            from_connection_id: None,
            reason_code: Some(5001),
            debug: Some("A connection with that ID already exists.".into()),
        };
        assert!(MsgKind::ConnectionClosed.padded());
        let pkt = serialize_padded_msg(MsgKind::ConnectionClosed, &msg).expect("serialize");
        assert!(pkt.len() >= MIN_PADDED_PACKET_SIZE);
        let decoded =
            CMsgSteamSocketsUdpConnectionClosed::decode(parse_padded_body(&pkt).unwrap()).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn data_header_round_trip() {
        let hdr = DataHeader {
            flags: DATA_FLAG_PROTOBUF_BLOB,
            to_connection_id: 0xdead_beef,
            wire_seq: 0x1234,
        };
        let mut buf = Vec::new();
        hdr.encode_into(&mut buf);
        assert_eq!(buf.len(), DATA_HEADER_LEN);
        assert!(buf[0] & DATA_LEAD_BIT != 0);
        assert_eq!(DataHeader::parse(&buf).unwrap(), hdr);
    }

    #[test]
    fn trailer_split_with_stats() {
        let stats = CMsgSteamSocketsUdpStats {
            stats: None,
            flags: Some(2),
            seq_num: Some(77),
        };
        let mut trailer = Vec::new();
        encode_length_prefixed(&stats, &mut trailer);
        assert_eq!(trailer.len(), length_prefixed_len(&stats));
        trailer.extend_from_slice(b"ciphertext");

        let (blob, rest) = split_data_trailer(&trailer, true).expect("split");
        let decoded = CMsgSteamSocketsUdpStats::decode(blob.unwrap()).expect("decode");
        assert_eq!(decoded, stats);
        assert_eq!(rest, b"ciphertext");
    }

    #[test]
    fn trailer_split_rejects_overrun() {
        let mut trailer = Vec::new();
        prost::encoding::encode_varint(100, &mut trailer);
        trailer.extend_from_slice(&[0u8; 10]);
        assert!(matches!(
            split_data_trailer(&trailer, true),
            Err(WireError::StatsOverrun {
                declared: 100,
                available: 10
            })
        ));
    }

    proptest! {
        #[test]
        fn padded_survives_arbitrary_debug_strings(debug in ".{0,200}") {
            let msg = CMsgSteamSocketsUdpConnectionClosed {
                to_connection_id: Some(1),
                from_connection_id: Some(2),
                reason_code: Some(5001),
                debug: Some(debug),
            };
            let pkt = serialize_padded_msg(MsgKind::ConnectionClosed, &msg).unwrap();
            prop_assert!(pkt.len() >= MIN_PADDED_PACKET_SIZE);
            let decoded = CMsgSteamSocketsUdpConnectionClosed::decode(
                parse_padded_body(&pkt).unwrap()).unwrap();
            prop_assert_eq!(decoded, msg);
        }
    }
}
