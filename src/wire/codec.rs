//! Datagram framing
//!
//! [`PacketBuilder`] writes a header, action groups and the EOF marker.
//! [`Header::parse`] and [`Reader`] take a datagram apart again, one action
//! group at a time, so a caller can apply earlier groups even if a later one
//! turns out to be malformed.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use super::record::{
    BusStatusRecord, ClearRecord, CompressedUpdate, SaRefreshRecord, StateRecord, StateRef,
};
use super::{
    Action, Message, SchemaVersion, WireError, DIGEST_LEN, HEADER_LEN, PROTOCOL_VERSION,
    SUBHEADER_LEN,
};

/// Datagram header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub version: u8,
    /// Total datagram length including this header
    pub length: u16,
    /// Digest of the sender's identity
    pub digest: [u8; DIGEST_LEN],
}

impl Header {
    fn put(&self, buf: &mut impl BufMut) {
        buf.put_u8(self.version);
        buf.put_u8(0);
        buf.put_u16(self.length);
        buf.put_slice(&self.digest);
    }

    /// Parse and check the header, returning it with the datagram body
    ///
    /// Bytes beyond the declared length are ignored.
    pub fn parse(datagram: &[u8]) -> Result<(Header, &[u8]), WireError> {
        if datagram.len() < HEADER_LEN {
            return Err(WireError::Truncated {
                needed: HEADER_LEN,
                available: datagram.len(),
            });
        }

        let mut buf = datagram;
        let version = buf.get_u8();
        buf.advance(1);
        let length = buf.get_u16();
        let mut digest = [0u8; DIGEST_LEN];
        buf.copy_to_slice(&mut digest);

        if version != PROTOCOL_VERSION {
            return Err(WireError::BadVersion(version));
        }

        let declared = length as usize;
        if declared > datagram.len() || declared < HEADER_LEN {
            return Err(WireError::BadLength {
                declared,
                actual: datagram.len(),
            });
        }

        let header = Header {
            version,
            length,
            digest,
        };
        Ok((header, &datagram[HEADER_LEN..declared]))
    }
}

/// Action group header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubHeader {
    pub action: u8,
    pub count: u16,
}

impl SubHeader {
    fn put(&self, buf: &mut impl BufMut) {
        buf.put_u8(self.action);
        buf.put_u8(0);
        buf.put_u16(self.count);
    }

    fn get(buf: &mut &[u8]) -> Result<Self, WireError> {
        if buf.len() < SUBHEADER_LEN {
            return Err(WireError::Truncated {
                needed: SUBHEADER_LEN,
                available: buf.len(),
            });
        }
        let action = buf.get_u8();
        buf.advance(1);
        let count = buf.get_u16();
        Ok(Self { action, count })
    }
}

/// Split off the region holding `count` records of `size` bytes
///
/// Fails without consuming anything if the buffer is too short.
pub fn record_region<'a>(
    buf: &mut &'a [u8],
    count: u16,
    size: usize,
) -> Result<&'a [u8], WireError> {
    let needed = count as usize * size;
    if buf.len() < needed {
        return Err(WireError::Truncated {
            needed,
            available: buf.len(),
        });
    }
    let (region, rest) = buf.split_at(needed);
    *buf = rest;
    Ok(region)
}

fn decode_records<T>(region: &[u8], size: usize, decode: impl Fn(&mut &[u8]) -> T) -> Vec<T> {
    region
        .chunks_exact(size)
        .map(|mut chunk| decode(&mut chunk))
        .collect()
}

/// Builds one outbound datagram
pub struct PacketBuilder {
    buf: BytesMut,
    version: SchemaVersion,
}

impl PacketBuilder {
    /// Start a datagram with a header carrying `digest`
    pub fn new(version: SchemaVersion, digest: [u8; DIGEST_LEN]) -> Self {
        let mut buf = BytesMut::with_capacity(1500);
        Header {
            version: PROTOCOL_VERSION,
            length: 0,
            digest,
        }
        .put(&mut buf);
        Self { buf, version }
    }

    /// Current encoded length, excluding the EOF marker still to come
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    /// True if no action group has been written yet
    pub fn is_empty(&self) -> bool {
        self.buf.len() == HEADER_LEN
    }

    /// Append an action group; empty groups are skipped
    pub fn push(&mut self, message: &Message) {
        if matches!(message, Message::Eof | Message::Error { .. }) || message.count() == 0 {
            return;
        }
        let version = self.version;
        SubHeader {
            action: message.action(version).code(),
            count: message.count() as u16,
        }
        .put(&mut self.buf);

        let buf = &mut self.buf;
        match message {
            Message::Clear(records) => {
                for r in records {
                    r.encode(buf);
                }
            }
            Message::Insert(records) | Message::Update(records) => {
                for r in records {
                    r.encode(version, buf);
                }
            }
            Message::InsertAck(refs)
            | Message::UpdateRequest(refs)
            | Message::DeleteCompressed(refs) => {
                for r in refs {
                    r.encode(buf);
                }
            }
            Message::UpdateCompressed(records) => {
                for r in records {
                    r.encode(buf);
                }
            }
            Message::BusStatus(records) => {
                for r in records {
                    r.encode(buf);
                }
            }
            Message::SaRefresh(records) => {
                for r in records {
                    r.encode(buf);
                }
            }
            Message::Eof | Message::Error { .. } => {}
        }
    }

    /// Terminate with the EOF marker and fix up the header length
    pub fn finish(mut self) -> Bytes {
        SubHeader {
            action: Action::Eof.code(),
            count: 0,
        }
        .put(&mut self.buf);
        let length = self.buf.len() as u16;
        self.buf[2..4].copy_from_slice(&length.to_be_bytes());
        self.buf.freeze()
    }
}

/// Encode a list of action groups into one datagram
pub fn encode(messages: &[Message], version: SchemaVersion, digest: [u8; DIGEST_LEN]) -> Bytes {
    let mut builder = PacketBuilder::new(version, digest);
    for message in messages {
        builder.push(message);
    }
    builder.finish()
}

/// Iterates the action groups of a datagram body
pub struct Reader<'a> {
    buf: &'a [u8],
    done: bool,
}

impl<'a> Reader<'a> {
    pub fn new(body: &'a [u8]) -> Self {
        Self {
            buf: body,
            done: false,
        }
    }

    fn read_group(&mut self) -> Result<Message, WireError> {
        let sub = SubHeader::get(&mut self.buf)?;
        let action = Action::from_code(sub.action).ok_or(WireError::BadAction(sub.action))?;
        let size = match action.record_len() {
            Some(size) => size,
            None => return Ok(Message::Error { action: sub.action }),
        };
        let region = record_region(&mut self.buf, sub.count, size)?;

        let message = match action {
            Action::Clear => Message::Clear(decode_records(region, size, |b| ClearRecord::decode(b))),
            Action::InsertV1 => Message::Insert(decode_records(region, size, |b| {
                StateRecord::decode(SchemaVersion::V1, b)
            })),
            Action::InsertV2 => Message::Insert(decode_records(region, size, |b| {
                StateRecord::decode(SchemaVersion::V2, b)
            })),
            Action::UpdateV1 => Message::Update(decode_records(region, size, |b| {
                StateRecord::decode(SchemaVersion::V1, b)
            })),
            Action::UpdateV2 => Message::Update(decode_records(region, size, |b| {
                StateRecord::decode(SchemaVersion::V2, b)
            })),
            Action::InsertAck => Message::InsertAck(decode_records(region, size, |b| StateRef::decode(b))),
            Action::UpdateCompressed => {
                Message::UpdateCompressed(decode_records(region, size, |b| CompressedUpdate::decode(b)))
            }
            Action::UpdateRequest => {
                Message::UpdateRequest(decode_records(region, size, |b| StateRef::decode(b)))
            }
            Action::DeleteCompressed => {
                Message::DeleteCompressed(decode_records(region, size, |b| StateRef::decode(b)))
            }
            Action::BusStatus => {
                Message::BusStatus(decode_records(region, size, |b| BusStatusRecord::decode(b)))
            }
            Action::SaRefresh => {
                Message::SaRefresh(decode_records(region, size, |b| SaRefreshRecord::decode(b)))
            }
            Action::Eof => Message::Eof,
            Action::Delete | Action::InsertFragment | Action::DeleteFragment => {
                Message::Error { action: sub.action }
            }
        };
        Ok(message)
    }
}

impl<'a> Iterator for Reader<'a> {
    type Item = Result<Message, WireError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            if self.buf.is_empty() {
                return None;
            }
            let trailing = self.buf.len();
            self.buf = &[];
            return Some(Err(WireError::TrailingData(trailing)));
        }
        if self.buf.is_empty() {
            return None;
        }

        let result = self.read_group();
        match &result {
            Ok(Message::Eof) => self.done = true,
            Ok(Message::Error { .. }) | Err(_) => {
                self.done = true;
                self.buf = &[];
            }
            Ok(_) => {}
        }
        Some(result)
    }
}

/// Decode a whole datagram, failing on the first framing error
pub fn decode(datagram: &[u8]) -> Result<(Header, Vec<Message>), WireError> {
    let (header, body) = Header::parse(datagram)?;
    let messages = Reader::new(body).collect::<Result<Vec<_>, _>>()?;
    Ok((header, messages))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::record::{af, timeout, PeerState, STATE_REF_LEN};
    use crate::wire::{bus, MIN_PACKET};

    const DIGEST: [u8; DIGEST_LEN] = [0xab; DIGEST_LEN];

    fn state(id: u64) -> StateRecord {
        StateRecord {
            id,
            ifname: "em0".into(),
            creator_id: 7,
            af: af::INET,
            proto: 17,
            timeout: timeout::UDP_MULTIPLE,
            expire: 60,
            ..Default::default()
        }
    }

    fn all_messages() -> Vec<Message> {
        vec![
            Message::Clear(vec![ClearRecord {
                ifname: String::new(),
                creator_id: 7,
            }]),
            Message::Insert(vec![state(1), state(2)]),
            Message::InsertAck(vec![StateRef::new(3, 7)]),
            Message::Update(vec![state(4)]),
            Message::UpdateCompressed(vec![CompressedUpdate {
                id: 5,
                src: PeerState {
                    seqlo: 100,
                    ..Default::default()
                },
                dst: PeerState::default(),
                creator_id: 7,
                expire: 30,
                timeout: timeout::TCP_OPENING,
            }]),
            Message::UpdateRequest(vec![StateRef::new(0, 0)]),
            Message::DeleteCompressed(vec![StateRef::new(6, 7), StateRef::new(8, 7)]),
            Message::BusStatus(vec![BusStatusRecord {
                creator_id: 7,
                elapsed: 3,
                status: bus::END,
            }]),
            Message::SaRefresh(vec![SaRefreshRecord {
                spi: 1,
                ..Default::default()
            }]),
            Message::Eof,
        ]
    }

    #[test]
    fn test_datagram_round_trip_both_versions() {
        for version in [SchemaVersion::V1, SchemaVersion::V2] {
            let messages = all_messages();
            let bytes = encode(&messages, version, DIGEST);
            let (header, decoded) = decode(&bytes).unwrap();

            assert_eq!(header.version, PROTOCOL_VERSION);
            assert_eq!(header.length as usize, bytes.len());
            assert_eq!(header.digest, DIGEST);
            assert_eq!(decoded, messages);
        }
    }

    #[test]
    fn test_empty_datagram_is_header_plus_eof() {
        let bytes = encode(&[], SchemaVersion::V2, DIGEST);
        assert_eq!(bytes.len(), MIN_PACKET);
        let (_, decoded) = decode(&bytes).unwrap();
        assert_eq!(decoded, vec![Message::Eof]);
    }

    #[test]
    fn test_empty_groups_are_skipped() {
        let bytes = encode(
            &[Message::Insert(Vec::new()), Message::InsertAck(vec![StateRef::new(1, 2)])],
            SchemaVersion::V2,
            DIGEST,
        );
        assert_eq!(bytes.len(), MIN_PACKET + SUBHEADER_LEN + STATE_REF_LEN);
    }

    #[test]
    fn test_record_region_refuses_short_buffer() {
        let data = [0u8; 100];
        let mut buf = &data[..];
        let err = record_region(&mut buf, 5, 32).unwrap_err();
        assert_eq!(
            err,
            WireError::Truncated {
                needed: 160,
                available: 100
            }
        );
        // Nothing consumed
        assert_eq!(buf.len(), 100);

        let region = record_region(&mut buf, 3, 32).unwrap();
        assert_eq!(region.len(), 96);
        assert_eq!(buf.len(), 4);
    }

    #[test]
    fn test_truncated_group_fails_the_batch() {
        let bytes = encode(
            &[Message::DeleteCompressed(vec![StateRef::new(1, 7); 5])],
            SchemaVersion::V2,
            DIGEST,
        );
        // Claim more records than are present by chopping the tail
        let mut short = bytes[..HEADER_LEN + SUBHEADER_LEN + 2 * STATE_REF_LEN].to_vec();
        let len = short.len() as u16;
        short[2..4].copy_from_slice(&len.to_be_bytes());

        let (_, body) = Header::parse(&short).unwrap();
        let mut reader = Reader::new(body);
        assert!(matches!(reader.next(), Some(Err(WireError::Truncated { .. }))));
        assert!(reader.next().is_none());
    }

    #[test]
    fn test_header_checks() {
        assert!(matches!(
            Header::parse(&[6, 0, 0]),
            Err(WireError::Truncated { .. })
        ));

        let mut bytes = encode(&[], SchemaVersion::V2, DIGEST).to_vec();
        bytes[0] = 5;
        assert_eq!(Header::parse(&bytes), Err(WireError::BadVersion(5)));

        let mut bytes = encode(&[], SchemaVersion::V2, DIGEST).to_vec();
        bytes[2..4].copy_from_slice(&200u16.to_be_bytes());
        assert!(matches!(
            Header::parse(&bytes),
            Err(WireError::BadLength { declared: 200, .. })
        ));
    }

    #[test]
    fn test_bytes_beyond_declared_length_are_ignored() {
        let mut bytes = encode(&[], SchemaVersion::V2, DIGEST).to_vec();
        bytes.extend_from_slice(&[0xff; 8]);
        let (_, decoded) = decode(&bytes).unwrap();
        assert_eq!(decoded, vec![Message::Eof]);
    }

    #[test]
    fn test_unknown_action_stops_reader() {
        let mut bytes = encode(&[], SchemaVersion::V2, DIGEST).to_vec();
        // Overwrite the EOF action code
        bytes[HEADER_LEN] = 42;
        let (_, body) = Header::parse(&bytes).unwrap();
        let mut reader = Reader::new(body);
        assert_eq!(reader.next(), Some(Err(WireError::BadAction(42))));
        assert_eq!(reader.next(), None);
    }

    #[test]
    fn test_deprecated_action_yields_error_message() {
        let mut bytes = encode(&[], SchemaVersion::V2, DIGEST).to_vec();
        bytes[HEADER_LEN] = Action::Delete.code();
        let (_, body) = Header::parse(&bytes).unwrap();
        let mut reader = Reader::new(body);
        assert_eq!(reader.next(), Some(Ok(Message::Error { action: 6 })));
        assert_eq!(reader.next(), None);
    }

    #[test]
    fn test_data_after_eof_is_reported() {
        let mut builder = PacketBuilder::new(SchemaVersion::V2, DIGEST);
        builder.push(&Message::InsertAck(vec![StateRef::new(1, 7)]));
        let mut bytes = builder.finish().to_vec();
        // Move the ack group behind the EOF marker
        let ack_group = bytes[HEADER_LEN..HEADER_LEN + SUBHEADER_LEN + STATE_REF_LEN].to_vec();
        bytes.truncate(HEADER_LEN);
        bytes.extend_from_slice(&[Action::Eof.code(), 0, 0, 0]);
        bytes.extend_from_slice(&ack_group);

        let (_, body) = Header::parse(&bytes).unwrap();
        let items: Vec<_> = Reader::new(body).collect();
        assert_eq!(items.len(), 2);
        assert_eq!(items[0], Ok(Message::Eof));
        assert_eq!(items[1], Err(WireError::TrailingData(SUBHEADER_LEN + STATE_REF_LEN)));
    }
}
