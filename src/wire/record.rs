//! Fixed-size action records
//!
//! Each record type knows its exact on-wire size, how to write itself into a
//! [`BufMut`] and how to read itself back from a slice that the caller has
//! already checked is long enough. Range checks on enumerated fields live in
//! the `validate` methods so the codec itself stays lossless.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use bytes::{Buf, BufMut};
use serde::{Deserialize, Serialize};

use super::{SchemaVersion, WireError};

/// Interface name field width (including the terminating NUL)
pub const IFNAME_LEN: usize = 16;

/// Address field width; IPv4 uses the first four bytes
pub const ADDR_LEN: usize = 16;

pub const STATE_KEY_LEN: usize = 2 * ADDR_LEN + 4;
pub const PEER_LEN: usize = 32;
pub const STATE_V1_LEN: usize = 244;
pub const STATE_V2_LEN: usize = 278;
pub const STATE_REF_LEN: usize = 12;
pub const UPDATE_COMPRESSED_LEN: usize = 8 + 2 * PEER_LEN + 12;
pub const BUS_STATUS_LEN: usize = 12;
pub const SA_REFRESH_LEN: usize = 40;
pub const CLEAR_LEN: usize = IFNAME_LEN + 4;

/// Address families
pub mod af {
    pub const INET: u8 = 2;
    pub const INET6: u8 = 28;
}

/// Packet direction a state was created for
pub mod direction {
    pub const INOUT: u8 = 0;
    pub const IN: u8 = 1;
    pub const OUT: u8 = 2;
}

/// TCP peer states, including the two syn-proxy pseudo states
pub mod tcp {
    pub const CLOSED: u8 = 0;
    pub const LISTEN: u8 = 1;
    pub const SYN_SENT: u8 = 2;
    pub const SYN_RECEIVED: u8 = 3;
    pub const ESTABLISHED: u8 = 4;
    pub const CLOSE_WAIT: u8 = 5;
    pub const FIN_WAIT_1: u8 = 6;
    pub const CLOSING: u8 = 7;
    pub const LAST_ACK: u8 = 8;
    pub const FIN_WAIT_2: u8 = 9;
    pub const TIME_WAIT: u8 = 10;
    pub const PROXY_SRC: u8 = 11;
    pub const PROXY_DST: u8 = 12;
}

/// Timeout classes
pub mod timeout {
    pub const TCP_FIRST_PACKET: u8 = 0;
    pub const TCP_OPENING: u8 = 1;
    pub const TCP_ESTABLISHED: u8 = 2;
    pub const TCP_CLOSING: u8 = 3;
    pub const TCP_FIN_WAIT: u8 = 4;
    pub const TCP_CLOSED: u8 = 5;
    pub const UDP_FIRST_PACKET: u8 = 6;
    pub const UDP_SINGLE: u8 = 7;
    pub const UDP_MULTIPLE: u8 = 8;
    pub const ICMP_FIRST_PACKET: u8 = 9;
    pub const ICMP_ERROR_REPLY: u8 = 10;
    pub const OTHER_FIRST_PACKET: u8 = 11;
    pub const OTHER_SINGLE: u8 = 12;
    pub const OTHER_MULTIPLE: u8 = 13;
    pub const FRAG: u8 = 14;
    pub const INTERVAL: u8 = 15;
    pub const ADAPTIVE_START: u8 = 16;
    pub const ADAPTIVE_END: u8 = 17;
    pub const SRC_NODE: u8 = 18;
    pub const TS_DIFF: u8 = 19;
    /// First value that is not a valid class on the wire
    pub const MAX: u8 = 20;
    /// Local-only: state is waiting to be purged
    pub const PURGE: u8 = 21;
    /// Local-only: state has been unlinked from the table
    pub const UNLINKED: u8 = 22;
}

/// A protocol address in its 16-byte wire form
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Addr(pub [u8; ADDR_LEN]);

impl Addr {
    /// Interpret the address for the given family
    pub fn to_ip(&self, family: u8) -> Option<IpAddr> {
        match family {
            af::INET => Some(IpAddr::V4(Ipv4Addr::new(
                self.0[0], self.0[1], self.0[2], self.0[3],
            ))),
            af::INET6 => Some(IpAddr::V6(Ipv6Addr::from(self.0))),
            _ => None,
        }
    }

    fn put(&self, buf: &mut impl BufMut) {
        buf.put_slice(&self.0);
    }

    fn get(buf: &mut impl Buf) -> Self {
        let mut bytes = [0u8; ADDR_LEN];
        buf.copy_to_slice(&mut bytes);
        Addr(bytes)
    }
}

impl From<Ipv4Addr> for Addr {
    fn from(ip: Ipv4Addr) -> Self {
        let mut bytes = [0u8; ADDR_LEN];
        bytes[..4].copy_from_slice(&ip.octets());
        Addr(bytes)
    }
}

impl From<Ipv6Addr> for Addr {
    fn from(ip: Ipv6Addr) -> Self {
        Addr(ip.octets())
    }
}

impl From<IpAddr> for Addr {
    fn from(ip: IpAddr) -> Self {
        match ip {
            IpAddr::V4(v4) => v4.into(),
            IpAddr::V6(v6) => v6.into(),
        }
    }
}

fn put_name(buf: &mut impl BufMut, name: &str) {
    let mut bytes = [0u8; IFNAME_LEN];
    let src = name.as_bytes();
    let n = src.len().min(IFNAME_LEN - 1);
    bytes[..n].copy_from_slice(&src[..n]);
    buf.put_slice(&bytes);
}

fn get_name(buf: &mut impl Buf) -> String {
    let mut bytes = [0u8; IFNAME_LEN];
    buf.copy_to_slice(&mut bytes);
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(IFNAME_LEN);
    String::from_utf8_lossy(&bytes[..end]).into_owned()
}

/// Address/port pair identifying one side of a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct StateKey {
    pub addr: [Addr; 2],
    pub port: [u16; 2],
}

impl StateKey {
    fn put(&self, buf: &mut impl BufMut) {
        self.addr[0].put(buf);
        self.addr[1].put(buf);
        buf.put_u16(self.port[0]);
        buf.put_u16(self.port[1]);
    }

    fn get(buf: &mut impl Buf) -> Self {
        let a0 = Addr::get(buf);
        let a1 = Addr::get(buf);
        let p0 = buf.get_u16();
        let p1 = buf.get_u16();
        Self {
            addr: [a0, a1],
            port: [p0, p1],
        }
    }
}

/// Traffic normalization options of one peer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ScrubState {
    pub flags: u16,
    pub ttl: u8,
    pub scrub_flag: u8,
    pub ts_mod: u32,
}

/// Protocol progress of one side of a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PeerState {
    pub scrub: ScrubState,
    pub seqlo: u32,
    pub seqhi: u32,
    pub seqdiff: u32,
    pub max_win: u16,
    pub mss: u16,
    pub state: u8,
    pub wscale: u8,
}

impl PeerState {
    fn put(&self, buf: &mut impl BufMut) {
        buf.put_u16(self.scrub.flags);
        buf.put_u8(self.scrub.ttl);
        buf.put_u8(self.scrub.scrub_flag);
        buf.put_u32(self.scrub.ts_mod);
        buf.put_u32(self.seqlo);
        buf.put_u32(self.seqhi);
        buf.put_u32(self.seqdiff);
        buf.put_u16(self.max_win);
        buf.put_u16(self.mss);
        buf.put_u8(self.state);
        buf.put_u8(self.wscale);
        buf.put_bytes(0, 6);
    }

    fn get(buf: &mut impl Buf) -> Self {
        let scrub = ScrubState {
            flags: buf.get_u16(),
            ttl: buf.get_u8(),
            scrub_flag: buf.get_u8(),
            ts_mod: buf.get_u32(),
        };
        let peer = Self {
            scrub,
            seqlo: buf.get_u32(),
            seqhi: buf.get_u32(),
            seqdiff: buf.get_u32(),
            max_win: buf.get_u16(),
            mss: buf.get_u16(),
            state: buf.get_u8(),
            wscale: buf.get_u8(),
        };
        buf.advance(6);
        peer
    }

    fn validate(&self) -> Result<(), WireError> {
        if self.state > tcp::PROXY_DST {
            return Err(WireError::BadValue("peer state"));
        }
        Ok(())
    }
}

/// Fields only carried by the V2 layout
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct StateExtensions {
    /// Queue and priority queue ids
    pub qid: u16,
    pub pqid: u16,
    /// Rate-limiter pipe handles
    pub dnpipe: u16,
    pub dnrpipe: u16,
    /// Routing table id
    pub rtableid: i32,
    pub min_ttl: u8,
    pub set_tos: u8,
    pub max_mss: u16,
    pub set_prio: [u8; 2],
    /// Routing decision and its outgoing interface
    pub rt: u8,
    pub rt_ifname: String,
}

/// A complete connection state as carried by Insert and Update
///
/// `creation` is the age of the state in seconds and `expire` the remaining
/// lifetime in seconds, both relative to the moment of export.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct StateRecord {
    pub id: u64,
    pub ifname: String,
    /// Wire side and stack side keys
    pub key: [StateKey; 2],
    pub src: PeerState,
    pub dst: PeerState,
    pub rt_addr: Addr,
    pub rule: u32,
    pub anchor: u32,
    pub nat_rule: u32,
    pub creation: u32,
    pub expire: u32,
    pub packets: [u64; 2],
    pub bytes: [u64; 2],
    pub creator_id: u32,
    pub af: u8,
    pub proto: u8,
    pub direction: u8,
    pub log: u8,
    pub state_flags: u16,
    pub timeout: u8,
    pub sync_flags: u8,
    pub updates: u8,
    pub ext: StateExtensions,
}

impl StateRecord {
    /// Write the record in the given layout
    pub fn encode(&self, version: SchemaVersion, buf: &mut impl BufMut) {
        buf.put_u64(self.id);
        put_name(buf, &self.ifname);
        self.key[0].put(buf);
        self.key[1].put(buf);
        self.src.put(buf);
        self.dst.put(buf);
        self.rt_addr.put(buf);
        buf.put_u32(self.rule);
        buf.put_u32(self.anchor);
        buf.put_u32(self.nat_rule);
        buf.put_u32(self.creation);
        buf.put_u32(self.expire);
        buf.put_u64(self.packets[0]);
        buf.put_u64(self.packets[1]);
        buf.put_u64(self.bytes[0]);
        buf.put_u64(self.bytes[1]);
        buf.put_u32(self.creator_id);
        buf.put_u8(self.af);
        buf.put_u8(self.proto);
        buf.put_u8(self.direction);
        buf.put_u8(0);
        match version {
            SchemaVersion::V1 => {
                buf.put_u8(self.log);
                buf.put_u8(self.state_flags as u8);
                buf.put_u8(self.timeout);
                buf.put_u8(self.sync_flags);
                buf.put_u8(self.updates);
                buf.put_bytes(0, 3);
            }
            SchemaVersion::V2 => {
                buf.put_u8(self.log);
                buf.put_u8(self.timeout);
                buf.put_u8(self.sync_flags);
                buf.put_u8(self.updates);
                buf.put_u16(self.state_flags);
                buf.put_u16(self.ext.qid);
                buf.put_u16(self.ext.pqid);
                buf.put_u16(self.ext.dnpipe);
                buf.put_u16(self.ext.dnrpipe);
                buf.put_i32(self.ext.rtableid);
                buf.put_u8(self.ext.min_ttl);
                buf.put_u8(self.ext.set_tos);
                buf.put_u16(self.ext.max_mss);
                buf.put_slice(&self.ext.set_prio);
                buf.put_u8(self.ext.rt);
                put_name(buf, &self.ext.rt_ifname);
                buf.put_u8(0);
            }
        }
    }

    /// Read a record; the caller guarantees `version.state_len()` bytes
    pub fn decode(version: SchemaVersion, buf: &mut impl Buf) -> Self {
        let id = buf.get_u64();
        let ifname = get_name(buf);
        let key = [StateKey::get(buf), StateKey::get(buf)];
        let src = PeerState::get(buf);
        let dst = PeerState::get(buf);
        let rt_addr = Addr::get(buf);
        let rule = buf.get_u32();
        let anchor = buf.get_u32();
        let nat_rule = buf.get_u32();
        let creation = buf.get_u32();
        let expire = buf.get_u32();
        let packets = [buf.get_u64(), buf.get_u64()];
        let bytes = [buf.get_u64(), buf.get_u64()];
        let creator_id = buf.get_u32();
        let af = buf.get_u8();
        let proto = buf.get_u8();
        let direction = buf.get_u8();
        buf.advance(1);

        let mut record = Self {
            id,
            ifname,
            key,
            src,
            dst,
            rt_addr,
            rule,
            anchor,
            nat_rule,
            creation,
            expire,
            packets,
            bytes,
            creator_id,
            af,
            proto,
            direction,
            ..Default::default()
        };

        match version {
            SchemaVersion::V1 => {
                record.log = buf.get_u8();
                record.state_flags = buf.get_u8() as u16;
                record.timeout = buf.get_u8();
                record.sync_flags = buf.get_u8();
                record.updates = buf.get_u8();
                buf.advance(3);
            }
            SchemaVersion::V2 => {
                record.log = buf.get_u8();
                record.timeout = buf.get_u8();
                record.sync_flags = buf.get_u8();
                record.updates = buf.get_u8();
                record.state_flags = buf.get_u16();
                record.ext.qid = buf.get_u16();
                record.ext.pqid = buf.get_u16();
                record.ext.dnpipe = buf.get_u16();
                record.ext.dnrpipe = buf.get_u16();
                record.ext.rtableid = buf.get_i32();
                record.ext.min_ttl = buf.get_u8();
                record.ext.set_tos = buf.get_u8();
                record.ext.max_mss = buf.get_u16();
                buf.copy_to_slice(&mut record.ext.set_prio);
                record.ext.rt = buf.get_u8();
                record.ext.rt_ifname = get_name(buf);
                buf.advance(1);
            }
        }
        record
    }

    /// Reject records whose enumerated fields are out of range
    pub fn validate(&self) -> Result<(), WireError> {
        if self.timeout >= timeout::MAX {
            return Err(WireError::BadValue("timeout"));
        }
        self.src.validate()?;
        self.dst.validate()?;
        if self.direction > direction::OUT {
            return Err(WireError::BadValue("direction"));
        }
        if self.af != af::INET && self.af != af::INET6 {
            return Err(WireError::BadValue("address family"));
        }
        if self.creator_id == 0 {
            return Err(WireError::BadValue("creator id"));
        }
        Ok(())
    }
}

/// (id, creator) pair used by InsertAck, UpdateRequest and DeleteCompressed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct StateRef {
    pub id: u64,
    pub creator_id: u32,
}

impl StateRef {
    pub fn new(id: u64, creator_id: u32) -> Self {
        Self { id, creator_id }
    }

    /// The null reference asks for a full table transfer
    pub fn is_null(&self) -> bool {
        self.id == 0 && self.creator_id == 0
    }

    pub fn encode(&self, buf: &mut impl BufMut) {
        buf.put_u64(self.id);
        buf.put_u32(self.creator_id);
    }

    pub fn decode(buf: &mut impl Buf) -> Self {
        Self {
            id: buf.get_u64(),
            creator_id: buf.get_u32(),
        }
    }
}

/// Peer progress and lifetime of an already-known state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CompressedUpdate {
    pub id: u64,
    pub src: PeerState,
    pub dst: PeerState,
    pub creator_id: u32,
    pub expire: u32,
    pub timeout: u8,
}

impl CompressedUpdate {
    pub fn encode(&self, buf: &mut impl BufMut) {
        buf.put_u64(self.id);
        self.src.put(buf);
        self.dst.put(buf);
        buf.put_u32(self.creator_id);
        buf.put_u32(self.expire);
        buf.put_u8(self.timeout);
        buf.put_bytes(0, 3);
    }

    pub fn decode(buf: &mut impl Buf) -> Self {
        let id = buf.get_u64();
        let src = PeerState::get(buf);
        let dst = PeerState::get(buf);
        let creator_id = buf.get_u32();
        let expire = buf.get_u32();
        let timeout = buf.get_u8();
        buf.advance(3);
        Self {
            id,
            src,
            dst,
            creator_id,
            expire,
            timeout,
        }
    }

    pub fn validate(&self) -> Result<(), WireError> {
        if self.timeout >= timeout::MAX {
            return Err(WireError::BadValue("timeout"));
        }
        self.src.validate()?;
        self.dst.validate()
    }
}

/// Start or end marker of a bulk transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct BusStatusRecord {
    pub creator_id: u32,
    /// Seconds between receipt of the request and this marker
    pub elapsed: u32,
    pub status: u8,
}

impl BusStatusRecord {
    pub fn encode(&self, buf: &mut impl BufMut) {
        buf.put_u32(self.creator_id);
        buf.put_u32(self.elapsed);
        buf.put_u8(self.status);
        buf.put_bytes(0, 3);
    }

    pub fn decode(buf: &mut impl Buf) -> Self {
        let record = Self {
            creator_id: buf.get_u32(),
            elapsed: buf.get_u32(),
            status: buf.get_u8(),
        };
        buf.advance(3);
        record
    }
}

/// IPsec security association replay counter refresh
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SaRefreshRecord {
    pub spi: u32,
    pub dst: Addr,
    pub sproto: u8,
    pub updates: u8,
    pub rpl: u64,
    pub cur_bytes: u64,
}

impl SaRefreshRecord {
    pub fn encode(&self, buf: &mut impl BufMut) {
        buf.put_u32(self.spi);
        self.dst.put(buf);
        buf.put_u8(self.sproto);
        buf.put_u8(self.updates);
        buf.put_bytes(0, 2);
        buf.put_u64(self.rpl);
        buf.put_u64(self.cur_bytes);
    }

    pub fn decode(buf: &mut impl Buf) -> Self {
        let spi = buf.get_u32();
        let dst = Addr::get(buf);
        let sproto = buf.get_u8();
        let updates = buf.get_u8();
        buf.advance(2);
        Self {
            spi,
            dst,
            sproto,
            updates,
            rpl: buf.get_u64(),
            cur_bytes: buf.get_u64(),
        }
    }
}

/// Remove all states of a creator, optionally limited to one interface
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ClearRecord {
    /// Empty means every interface
    pub ifname: String,
    pub creator_id: u32,
}

impl ClearRecord {
    pub fn encode(&self, buf: &mut impl BufMut) {
        put_name(buf, &self.ifname);
        buf.put_u32(self.creator_id);
    }

    pub fn decode(buf: &mut impl Buf) -> Self {
        let ifname = get_name(buf);
        Self {
            ifname,
            creator_id: buf.get_u32(),
        }
    }
}
