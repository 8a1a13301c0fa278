//! Route, rule, address and link message codec
//!
//! Builds rtnetlink requests from [`RouteRecord`]s and policy rule
//! bindings, and turns kernel messages back into records. Message bodies
//! and attributes go through `netlink-packet-route`; the fixed netlink
//! header and the control messages (done, error/ack) are handled here
//! directly so a datagram can be split and correlated even when one of its
//! bodies does not decode.

use crate::error::{Result, RtsyncError};
use crate::types::{InterfaceAddress, KERNEL_INFINITY, ObservedRule, RouteOp, RouteOrigin, RouteRecord};
use byteorder::{ByteOrder, NativeEndian};
use netlink_packet_core::{NetlinkHeader, NetlinkMessage, NetlinkPayload};
use netlink_packet_route::address::{AddressAttribute, AddressMessage};
use netlink_packet_route::link::{LinkAttribute, LinkMessage};
use netlink_packet_route::route::{
    RouteAddress, RouteAttribute, RouteFlags, RouteMessage, RouteProtocol, RouteScope, RouteType,
};
use netlink_packet_route::rule::{RuleAction, RuleAttribute, RuleMessage};
use netlink_packet_route::{AddressFamily, RouteNetlinkMessage};
use rtsync_types::{Family, IpPrefix};
use std::net::IpAddr;

/// Fixed netlink header length
pub const NLMSG_HDRLEN: usize = 16;

pub const NLMSG_NOOP: u16 = 1;
pub const NLMSG_ERROR: u16 = 2;
pub const NLMSG_DONE: u16 = 3;
pub const NLMSG_OVERRUN: u16 = 4;

pub const RTM_NEWLINK: u16 = 16;
pub const RTM_DELLINK: u16 = 17;
pub const RTM_NEWADDR: u16 = 20;
pub const RTM_DELADDR: u16 = 21;
pub const RTM_NEWROUTE: u16 = 24;
pub const RTM_DELROUTE: u16 = 25;
pub const RTM_NEWRULE: u16 = 32;
pub const RTM_DELRULE: u16 = 33;

/// Header table value meaning "see the table attribute"
pub const RT_TABLE_COMPAT: u8 = 252;

pub const NLM_F_REQUEST: u16 = libc::NLM_F_REQUEST as u16;
pub const NLM_F_MULTI: u16 = libc::NLM_F_MULTI as u16;
pub const NLM_F_ACK: u16 = libc::NLM_F_ACK as u16;
pub const NLM_F_DUMP: u16 = libc::NLM_F_DUMP as u16;
pub const NLM_F_CREATE: u16 = libc::NLM_F_CREATE as u16;
pub const NLM_F_EXCL: u16 = libc::NLM_F_EXCL as u16;

/// A request ready to be framed and sent on the command channel
#[derive(Debug, Clone)]
pub struct Request {
    pub message: RouteNetlinkMessage,
    pub flags: u16,
}

/// Where and how a route is installed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RouteTarget {
    pub table: u32,
    pub protocol: u8,
    /// Carry the source prefix on the route itself
    pub with_source: bool,
}

/// Bulk listing kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DumpKind {
    Routes,
    Rules,
    Addresses,
}

fn netlink_family(family: Family) -> AddressFamily {
    match family {
        Family::Inet => AddressFamily::Inet,
        Family::Inet6 => AddressFamily::Inet6,
    }
}

fn family_of(family: AddressFamily) -> Option<Family> {
    match family {
        AddressFamily::Inet => Some(Family::Inet),
        AddressFamily::Inet6 => Some(Family::Inet6),
        _ => None,
    }
}

fn route_address(addr: IpAddr) -> RouteAddress {
    match addr {
        IpAddr::V4(v4) => RouteAddress::Inet(v4),
        IpAddr::V6(v6) => RouteAddress::Inet6(v6),
    }
}

/// Address attribute of the message's family, or a decode failure.
fn attribute_address(addr: &RouteAddress, family: Family, what: &str) -> Result<IpAddr> {
    match (addr, family) {
        (RouteAddress::Inet(v4), Family::Inet) => Ok(IpAddr::V4(*v4)),
        (RouteAddress::Inet6(v6), Family::Inet6) => Ok(IpAddr::V6(*v6)),
        (other, _) => Err(RtsyncError::Decode(format!(
            "{} attribute {:?} is not a {} address",
            what, other, family
        ))),
    }
}

fn check_address(addr: IpAddr, family: Family, what: &str) -> Result<IpAddr> {
    if Family::of(&addr) == family {
        Ok(addr)
    } else {
        Err(RtsyncError::Decode(format!(
            "{} attribute {} in a {} message",
            what, addr, family
        )))
    }
}

fn prefix(addr: IpAddr, len: u8) -> Result<IpPrefix> {
    IpPrefix::new(addr, len).map_err(|e| RtsyncError::Decode(e.to_string()))
}

/// Header table byte plus the attribute needed for tables above 255.
fn split_table(table: u32) -> (u8, Option<u32>) {
    match u8::try_from(table) {
        Ok(t) => (t, None),
        Err(_) => (RT_TABLE_COMPAT, Some(table)),
    }
}

/// Build an add or delete request for `route` into `target.table`.
///
/// Unreachable routes are typed `unreachable`, carry `u32::MAX` as their
/// priority and no interface or gateway.
pub fn route_request(op: RouteOp, route: &RouteRecord, target: &RouteTarget) -> Request {
    let family = route.family();
    let source = route.source().filter(|_| target.with_source);
    let unreachable = route.is_unreachable();
    let (header_table, table_attr) = split_table(target.table);

    let mut msg = RouteMessage::default();
    msg.header.address_family = netlink_family(family);
    msg.header.destination_prefix_length = route.dest.prefix_len();
    msg.header.source_prefix_length = source.map_or(0, |s| s.prefix_len());
    msg.header.tos = 0;
    msg.header.table = header_table;
    msg.header.protocol = RouteProtocol::from(target.protocol);
    msg.header.scope = RouteScope::Universe;
    msg.header.kind = if unreachable {
        RouteType::Unreachable
    } else {
        RouteType::Unicast
    };
    msg.header.flags = RouteFlags::Onlink;

    msg.attributes
        .push(RouteAttribute::Destination(route_address(*route.dest.network().address())));
    if let Some(src) = source {
        msg.attributes
            .push(RouteAttribute::Source(route_address(*src.network().address())));
    }
    msg.attributes.push(RouteAttribute::Priority(if unreachable {
        u32::MAX
    } else {
        route.metric
    }));
    if !unreachable {
        msg.attributes.push(RouteAttribute::Oif(route.ifindex));
        msg.attributes.push(RouteAttribute::Gateway(route_address(route.gateway)));
    }
    if let Some(table) = table_attr {
        msg.attributes.push(RouteAttribute::Table(table));
    }

    match op {
        RouteOp::Add => Request {
            message: RouteNetlinkMessage::NewRoute(msg),
            flags: NLM_F_REQUEST | NLM_F_CREATE | NLM_F_EXCL,
        },
        RouteOp::Delete => Request {
            message: RouteNetlinkMessage::DelRoute(msg),
            flags: NLM_F_REQUEST,
        },
    }
}

/// Policy rule sending traffic from `src` into `table` at `priority`,
/// tagged with `protocol`.
pub fn rule_add_request(priority: u32, src: &IpPrefix, table: u32, protocol: u8) -> Request {
    let (header_table, table_attr) = split_table(table);

    let mut msg = RuleMessage::default();
    msg.header.family = netlink_family(src.family());
    msg.header.src_len = src.prefix_len();
    msg.header.table = header_table;
    msg.header.action = RuleAction::ToTable;
    msg.attributes.push(RuleAttribute::Priority(priority));
    msg.attributes.push(RuleAttribute::Source(*src.network().address()));
    if let Some(table) = table_attr {
        msg.attributes.push(RuleAttribute::Table(table));
    }
    msg.attributes.push(RuleAttribute::Protocol(RouteProtocol::from(protocol)));

    Request {
        message: RouteNetlinkMessage::NewRule(msg),
        flags: NLM_F_REQUEST | NLM_F_CREATE | NLM_F_EXCL,
    }
}

/// Removes the first rule of `family` at `priority`, whatever it matches.
pub fn rule_flush_request(priority: u32, family: Family) -> Request {
    let mut msg = RuleMessage::default();
    msg.header.family = netlink_family(family);
    msg.attributes.push(RuleAttribute::Priority(priority));

    Request {
        message: RouteNetlinkMessage::DelRule(msg),
        flags: NLM_F_REQUEST,
    }
}

/// Dump request carrying only the address family.
pub fn dump_request(kind: DumpKind, family: Option<Family>) -> Request {
    let af = family.map_or(AddressFamily::Unspec, netlink_family);
    let message = match kind {
        DumpKind::Routes => {
            let mut msg = RouteMessage::default();
            msg.header.address_family = af;
            RouteNetlinkMessage::GetRoute(msg)
        }
        DumpKind::Rules => {
            let mut msg = RuleMessage::default();
            msg.header.family = af;
            RouteNetlinkMessage::GetRule(msg)
        }
        DumpKind::Addresses => {
            let mut msg = AddressMessage::default();
            msg.header.family = af;
            RouteNetlinkMessage::GetAddress(msg)
        }
    };
    Request {
        message,
        flags: NLM_F_REQUEST | NLM_F_DUMP,
    }
}

/// Frame a message with the given flags, sequence number and sender port.
pub fn serialize(message: RouteNetlinkMessage, flags: u16, seq: u32, port: u32) -> Vec<u8> {
    let mut header = NetlinkHeader::default();
    header.flags = flags;
    header.sequence_number = seq;
    header.port_number = port;

    let mut packet = NetlinkMessage::new(header, NetlinkPayload::InnerMessage(message));
    packet.finalize();

    let mut buf = vec![0u8; packet.buffer_len()];
    packet.serialize(&mut buf);
    buf
}

fn control_frame(kind: u16, flags: u16, seq: u32, port: u32, body: &[u8]) -> Vec<u8> {
    let len = NLMSG_HDRLEN + body.len();
    let mut buf = vec![0u8; len];
    NativeEndian::write_u32(&mut buf[0..4], len as u32);
    NativeEndian::write_u16(&mut buf[4..6], kind);
    NativeEndian::write_u16(&mut buf[6..8], flags);
    NativeEndian::write_u32(&mut buf[8..12], seq);
    NativeEndian::write_u32(&mut buf[12..16], port);
    buf[NLMSG_HDRLEN..].copy_from_slice(body);
    buf
}

/// End-of-dump marker.
pub fn done_frame(seq: u32, port: u32) -> Vec<u8> {
    control_frame(NLMSG_DONE, NLM_F_MULTI, seq, port, &0i32.to_ne_bytes())
}

/// Acknowledgement carrying `errno` (0 for success), echoing the request header.
pub fn ack_frame(seq: u32, port: u32, errno: i32, request: &[u8]) -> Vec<u8> {
    let mut body = Vec::with_capacity(4 + NLMSG_HDRLEN);
    body.extend_from_slice(&(-errno).to_ne_bytes());
    let echoed = request.len().min(NLMSG_HDRLEN);
    body.extend_from_slice(&request[..echoed]);
    body.resize(4 + NLMSG_HDRLEN, 0);
    control_frame(NLMSG_ERROR, 0, seq, port, &body)
}

/// What one netlink message in a datagram carries
#[derive(Debug, Clone)]
pub enum FrameBody {
    Done,
    Noop,
    /// Error message with code zero
    Ack,
    /// Error message with a non-zero code, as found on the wire (negative)
    Error(i32),
    Message(RouteNetlinkMessage),
    /// Data message whose body failed to decode
    Undecodable(String),
}

/// One netlink message of a received datagram
#[derive(Debug, Clone)]
pub struct Frame {
    pub kind: u16,
    pub flags: u16,
    pub seq: u32,
    pub port: u32,
    pub body: FrameBody,
}

/// Split a datagram into its messages.
///
/// A header whose length runs past the datagram or below the header size
/// makes the whole datagram undecodable.
pub fn parse_datagram(buf: &[u8]) -> Result<Vec<Frame>> {
    let mut frames = Vec::new();
    let mut offset = 0;

    while buf.len() - offset >= NLMSG_HDRLEN {
        let hdr = &buf[offset..];
        let len = NativeEndian::read_u32(&hdr[0..4]) as usize;
        if len < NLMSG_HDRLEN || len > hdr.len() {
            return Err(RtsyncError::Decode(format!(
                "netlink message length {} at offset {} (datagram {})",
                len,
                offset,
                buf.len()
            )));
        }
        let kind = NativeEndian::read_u16(&hdr[4..6]);
        let flags = NativeEndian::read_u16(&hdr[6..8]);
        let seq = NativeEndian::read_u32(&hdr[8..12]);
        let port = NativeEndian::read_u32(&hdr[12..16]);
        let body = &hdr[NLMSG_HDRLEN..len];

        let body = match kind {
            NLMSG_DONE => FrameBody::Done,
            NLMSG_NOOP | NLMSG_OVERRUN => FrameBody::Noop,
            NLMSG_ERROR => {
                if body.len() < 4 {
                    return Err(RtsyncError::Decode("truncated error message".to_string()));
                }
                match NativeEndian::read_i32(&body[0..4]) {
                    0 => FrameBody::Ack,
                    code => FrameBody::Error(code),
                }
            }
            _ => match NetlinkMessage::<RouteNetlinkMessage>::deserialize(&hdr[..len]) {
                Ok(msg) => match msg.payload {
                    NetlinkPayload::InnerMessage(inner) => FrameBody::Message(inner),
                    _ => FrameBody::Noop,
                },
                Err(e) => FrameBody::Undecodable(e.to_string()),
            },
        };

        frames.push(Frame {
            kind,
            flags,
            seq,
            port,
            body,
        });

        // Align to 4 bytes (netlink alignment requirement)
        offset = (offset + len + 3) & !3;
        if offset >= buf.len() {
            break;
        }
    }

    Ok(frames)
}

/// A route as found in a kernel dump or notification
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KernelRoute {
    pub record: RouteRecord,
    pub table: u32,
    /// Cache entry rather than a configured route
    pub cloned: bool,
}

/// Decode a route message.
///
/// Non-IP families yield `None`. A missing destination is the default
/// route, a missing or out-of-range priority is clamped to the infinite
/// metric, and a table attribute overrides the header table.
pub fn decode_route(msg: &RouteMessage) -> Result<Option<KernelRoute>> {
    let Some(family) = family_of(msg.header.address_family) else {
        return Ok(None);
    };

    let mut dst = None;
    let mut src = None;
    let mut gateway = None;
    let mut ifindex = 0;
    let mut metric = 0;
    let mut table = u32::from(msg.header.table);

    for attr in &msg.attributes {
        match attr {
            RouteAttribute::Destination(a) => dst = Some(attribute_address(a, family, "destination")?),
            RouteAttribute::Source(a) => src = Some(attribute_address(a, family, "source")?),
            RouteAttribute::Gateway(a) => gateway = Some(attribute_address(a, family, "gateway")?),
            RouteAttribute::Oif(i) => ifindex = *i,
            RouteAttribute::Priority(p) => metric = *p,
            RouteAttribute::Table(t) => table = *t,
            _ => {}
        }
    }

    if metric > KERNEL_INFINITY || msg.header.kind == RouteType::Unreachable {
        metric = KERNEL_INFINITY;
    }

    let dest = prefix(
        dst.unwrap_or(family.unspecified()),
        msg.header.destination_prefix_length,
    )?;
    let src_len = msg.header.source_prefix_length;
    let src = match (src, src_len) {
        (None, 0) => None,
        (addr, len) => Some(prefix(addr.unwrap_or(family.unspecified()), len)?),
    };

    let record = RouteRecord {
        dest,
        src,
        gateway: gateway.unwrap_or(family.unspecified()),
        ifindex,
        metric,
        origin: RouteOrigin::Protocol(u8::from(msg.header.protocol)),
    };

    Ok(Some(KernelRoute {
        record,
        table,
        cloned: msg.header.flags.contains(RouteFlags::Cloned),
    }))
}

/// Decode a policy rule message; non-IP families yield `None`.
pub fn decode_rule(msg: &RuleMessage) -> Result<Option<ObservedRule>> {
    let Some(family) = family_of(msg.header.family) else {
        return Ok(None);
    };

    let mut priority = None;
    let mut src = None;
    let mut table = u32::from(msg.header.table);

    for attr in &msg.attributes {
        match attr {
            RuleAttribute::Priority(p) => priority = Some(*p),
            RuleAttribute::Source(a) => src = Some(check_address(*a, family, "rule source")?),
            RuleAttribute::Table(t) => table = *t,
            _ => {}
        }
    }

    let src = match (src, msg.header.src_len) {
        (None, 0) => None,
        (addr, len) => Some(prefix(addr.unwrap_or(family.unspecified()), len)?),
    };

    Ok(Some(ObservedRule {
        family,
        priority,
        src,
        table,
    }))
}

/// Decode an interface address message; the last address attribute wins.
pub fn decode_address(msg: &AddressMessage) -> Result<Option<InterfaceAddress>> {
    let Some(family) = family_of(msg.header.family) else {
        return Ok(None);
    };

    let mut address = None;
    for attr in &msg.attributes {
        match attr {
            AddressAttribute::Local(a) | AddressAttribute::Address(a) => {
                address = Some(check_address(*a, family, "address")?);
            }
            _ => {}
        }
    }

    Ok(address.map(|address| InterfaceAddress {
        ifindex: msg.header.index,
        address,
        prefix_len: msg.header.prefix_len,
    }))
}

/// Interface name carried by a link message.
pub fn link_name(msg: &LinkMessage) -> Option<&str> {
    msg.attributes.iter().find_map(|attr| match attr {
        LinkAttribute::IfName(name) => Some(name.as_str()),
        _ => None,
    })
}
