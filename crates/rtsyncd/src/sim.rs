//! In-memory kernel
//!
//! A [`Connector`] whose sockets talk to a simulated routing table instead
//! of the kernel. It answers requests the way rtnetlink does (acks, errno
//! replies, multi-part dumps ended by a done marker) and multicasts change
//! notifications to subscribed sockets, tagged with the requesting port.
//! Used by the integration tests and by `rtsyncd --dry-run`.

use crate::codec::{self, KernelRoute, NLM_F_ACK, NLM_F_CREATE, NLM_F_EXCL, NLM_F_MULTI};
use crate::error::{Result, RtsyncError};
use crate::netlink::{
    Connector, NetlinkIo, RTNLGRP_IPV4_IFADDR, RTNLGRP_IPV4_ROUTE, RTNLGRP_IPV4_RULE,
    RTNLGRP_IPV6_IFADDR, RTNLGRP_IPV6_ROUTE, RTNLGRP_IPV6_RULE, RTNLGRP_LINK, Readiness, RecvInfo,
    group_mask,
};
use crate::types::{ObservedRule, RouteOp, RouteOrigin, RouteRecord};
use netlink_packet_route::address::{AddressAttribute, AddressMessage};
use netlink_packet_route::link::{LinkAttribute, LinkMessage};
use netlink_packet_route::route::{RouteFlags, RouteMessage};
use netlink_packet_route::rule::RuleMessage;
use netlink_packet_route::{AddressFamily, RouteNetlinkMessage};
use parking_lot::Mutex;
use rtsync_types::{Family, IpPrefix};
use std::collections::{BTreeMap, VecDeque};
use std::io;
use std::net::IpAddr;
use std::os::fd::RawFd;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace};

/// Messages per dump datagram
const DUMP_BATCH: usize = 8;

/// First port handed out to a socket
const FIRST_PORT: u32 = 4242;

#[derive(Debug, Default)]
struct SocketState {
    groups: u32,
    /// Queued datagrams; an empty one reads as end of file
    queue: VecDeque<Vec<u8>>,
}

#[derive(Debug)]
struct StoredRoute {
    route: KernelRoute,
    family: Family,
    message: RouteMessage,
}

impl StoredRoute {
    fn same_key(&self, other: &KernelRoute) -> bool {
        self.route.table == other.table
            && self.route.record.dest == other.record.dest
            && self.route.record.src == other.record.src
            && self.route.record.metric == other.record.metric
    }
}

#[derive(Debug)]
struct StoredRule {
    rule: ObservedRule,
    message: RuleMessage,
}

/// Reply to one request
enum Outcome {
    Ack,
    Error(i32),
    Dump(Vec<RouteNetlinkMessage>),
}

#[derive(Debug)]
struct SimState {
    next_port: u32,
    sockets: BTreeMap<u32, SocketState>,
    routes: Vec<StoredRoute>,
    rules: Vec<StoredRule>,
    addresses: Vec<AddressMessage>,
    requests: usize,
    fail_next: Option<i32>,
}

impl Default for SimState {
    fn default() -> Self {
        Self {
            next_port: FIRST_PORT,
            sockets: BTreeMap::new(),
            routes: Vec::new(),
            rules: Vec::new(),
            addresses: Vec::new(),
            requests: 0,
            fail_next: None,
        }
    }
}

fn family_filter(af: AddressFamily) -> Option<Family> {
    match af {
        AddressFamily::Inet => Some(Family::Inet),
        AddressFamily::Inet6 => Some(Family::Inet6),
        _ => None,
    }
}

fn route_group(family: Family) -> u32 {
    match family {
        Family::Inet => group_mask(RTNLGRP_IPV4_ROUTE),
        Family::Inet6 => group_mask(RTNLGRP_IPV6_ROUTE),
    }
}

fn rule_group(family: Family) -> u32 {
    match family {
        Family::Inet => group_mask(RTNLGRP_IPV4_RULE),
        Family::Inet6 => group_mask(RTNLGRP_IPV6_RULE),
    }
}

fn address_group(family: Family) -> u32 {
    match family {
        Family::Inet => group_mask(RTNLGRP_IPV4_IFADDR),
        Family::Inet6 => group_mask(RTNLGRP_IPV6_IFADDR),
    }
}

impl SimState {
    /// Queue `message` on every socket subscribed to `groups`.
    fn multicast(&mut self, groups: u32, message: RouteNetlinkMessage, seq: u32, port: u32) {
        let bytes = codec::serialize(message, 0, seq, port);
        for (listener, socket) in self.sockets.iter_mut() {
            if socket.groups & groups != 0 {
                trace!(listener, "Queued notification");
                socket.queue.push_back(bytes.clone());
            }
        }
    }

    fn reply(&mut self, port: u32, datagram: Vec<u8>) {
        if let Some(socket) = self.sockets.get_mut(&port) {
            socket.queue.push_back(datagram);
        }
    }

    /// Process every message of a datagram sent from `port`.
    fn handle(&mut self, port: u32, datagram: &[u8]) {
        let frames = match codec::parse_datagram(datagram) {
            Ok(frames) => frames,
            Err(e) => {
                debug!(error = %e, "Simulated kernel dropped malformed request");
                return;
            }
        };

        for frame in frames {
            let codec::FrameBody::Message(message) = frame.body else {
                continue;
            };
            self.requests += 1;
            match self.apply(message, frame.flags, frame.seq, frame.port) {
                Outcome::Ack => {
                    if frame.flags & NLM_F_ACK != 0 {
                        self.reply(port, codec::ack_frame(frame.seq, frame.port, 0, datagram));
                    }
                }
                Outcome::Error(errno) => {
                    self.reply(port, codec::ack_frame(frame.seq, frame.port, errno, datagram));
                }
                Outcome::Dump(messages) => {
                    for batch in messages.chunks(DUMP_BATCH) {
                        let mut bytes = Vec::new();
                        for message in batch {
                            bytes.extend(codec::serialize(
                                message.clone(),
                                NLM_F_MULTI,
                                frame.seq,
                                frame.port,
                            ));
                        }
                        self.reply(port, bytes);
                    }
                    self.reply(port, codec::done_frame(frame.seq, frame.port));
                }
            }
        }
    }

    fn apply(&mut self, message: RouteNetlinkMessage, flags: u16, seq: u32, port: u32) -> Outcome {
        let mutating = matches!(
            message,
            RouteNetlinkMessage::NewRoute(_)
                | RouteNetlinkMessage::DelRoute(_)
                | RouteNetlinkMessage::NewRule(_)
                | RouteNetlinkMessage::DelRule(_)
        );
        if mutating {
            if let Some(errno) = self.fail_next.take() {
                debug!(errno, "Simulated kernel failing request");
                return Outcome::Error(errno);
            }
        }

        match message {
            RouteNetlinkMessage::NewRoute(msg) => self.new_route(msg, flags, seq, port),
            RouteNetlinkMessage::DelRoute(msg) => self.del_route(msg, seq, port),
            RouteNetlinkMessage::NewRule(msg) => self.new_rule(msg, seq, port),
            RouteNetlinkMessage::DelRule(msg) => self.del_rule(msg, seq, port),
            RouteNetlinkMessage::GetRoute(msg) => {
                let family = family_filter(msg.header.address_family);
                Outcome::Dump(
                    self.routes
                        .iter()
                        .filter(|r| family.is_none_or(|f| f == r.family))
                        .map(|r| RouteNetlinkMessage::NewRoute(r.message.clone()))
                        .collect(),
                )
            }
            RouteNetlinkMessage::GetRule(msg) => {
                let family = family_filter(msg.header.family);
                Outcome::Dump(
                    self.rules
                        .iter()
                        .filter(|r| family.is_none_or(|f| f == r.rule.family))
                        .map(|r| RouteNetlinkMessage::NewRule(r.message.clone()))
                        .collect(),
                )
            }
            RouteNetlinkMessage::GetAddress(msg) => {
                let family = family_filter(msg.header.family);
                Outcome::Dump(
                    self.addresses
                        .iter()
                        .filter(|a| family.is_none_or(|f| Some(f) == family_filter(a.header.family)))
                        .map(|a| RouteNetlinkMessage::NewAddress(a.clone()))
                        .collect(),
                )
            }
            other => {
                debug!(message = ?other, "Simulated kernel does not support request");
                Outcome::Error(libc::EOPNOTSUPP)
            }
        }
    }

    fn new_route(&mut self, msg: RouteMessage, flags: u16, seq: u32, port: u32) -> Outcome {
        let route = match codec::decode_route(&msg) {
            Ok(Some(route)) => route,
            Ok(None) => return Outcome::Error(libc::EAFNOSUPPORT),
            Err(_) => return Outcome::Error(libc::EINVAL),
        };
        let family = route.record.family();

        if let Some(existing) = self.routes.iter().position(|r| r.same_key(&route)) {
            if flags & NLM_F_EXCL != 0 {
                return Outcome::Error(libc::EEXIST);
            }
            self.routes.remove(existing);
        } else if flags & NLM_F_CREATE == 0 {
            return Outcome::Error(libc::ENOENT);
        }

        trace!(route = %route.record, table = route.table, "Simulated route added");
        self.routes.push(StoredRoute {
            route,
            family,
            message: msg.clone(),
        });
        self.multicast(route_group(family), RouteNetlinkMessage::NewRoute(msg), seq, port);
        Outcome::Ack
    }

    fn del_route(&mut self, msg: RouteMessage, seq: u32, port: u32) -> Outcome {
        let route = match codec::decode_route(&msg) {
            Ok(Some(route)) => route,
            Ok(None) => return Outcome::Error(libc::EAFNOSUPPORT),
            Err(_) => return Outcome::Error(libc::EINVAL),
        };
        let Some(index) = self.routes.iter().position(|r| r.same_key(&route)) else {
            return Outcome::Error(libc::ESRCH);
        };

        let removed = self.routes.remove(index);
        trace!(route = %removed.route.record, "Simulated route deleted");
        self.multicast(
            route_group(removed.family),
            RouteNetlinkMessage::DelRoute(removed.message),
            seq,
            port,
        );
        Outcome::Ack
    }

    fn new_rule(&mut self, msg: RuleMessage, seq: u32, port: u32) -> Outcome {
        let rule = match codec::decode_rule(&msg) {
            Ok(Some(rule)) => rule,
            Ok(None) => return Outcome::Error(libc::EAFNOSUPPORT),
            Err(_) => return Outcome::Error(libc::EINVAL),
        };
        if self.rules.iter().any(|r| r.rule == rule) {
            return Outcome::Error(libc::EEXIST);
        }

        let family = rule.family;
        self.rules.push(StoredRule {
            rule,
            message: msg.clone(),
        });
        self.multicast(rule_group(family), RouteNetlinkMessage::NewRule(msg), seq, port);
        Outcome::Ack
    }

    fn del_rule(&mut self, msg: RuleMessage, seq: u32, port: u32) -> Outcome {
        let rule = match codec::decode_rule(&msg) {
            Ok(Some(rule)) => rule,
            Ok(None) => return Outcome::Error(libc::EAFNOSUPPORT),
            Err(_) => return Outcome::Error(libc::EINVAL),
        };
        let Some(index) = self.rules.iter().position(|r| {
            r.rule.family == rule.family
                && (rule.priority.is_none() || r.rule.priority == rule.priority)
                && (rule.src.is_none() || r.rule.src == rule.src)
        }) else {
            return Outcome::Error(libc::ENOENT);
        };

        let removed = self.rules.remove(index);
        self.multicast(
            rule_group(removed.rule.family),
            RouteNetlinkMessage::DelRule(removed.message),
            seq,
            port,
        );
        Outcome::Ack
    }
}

/// Shared handle to a simulated kernel
#[derive(Debug, Clone, Default)]
pub struct SimKernel {
    state: Arc<Mutex<SimState>>,
}

impl SimKernel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply a change as if another process had requested it.
    fn external(&self, message: RouteNetlinkMessage) -> Result<()> {
        let mut state = self.state.lock();
        match state.apply(message, NLM_F_CREATE | NLM_F_EXCL, 0, 0) {
            Outcome::Error(errno) => {
                debug!(errno, "Simulated kernel rejected external change");
                Err(RtsyncError::Kernel { code: errno })
            }
            Outcome::Ack | Outcome::Dump(_) => Ok(()),
        }
    }

    /// Install a route owned by another routing protocol.
    pub fn add_foreign_route(&self, record: &RouteRecord, table: u32, protocol: u8) -> Result<()> {
        let target = codec::RouteTarget {
            table,
            protocol,
            with_source: record.source().is_some(),
        };
        self.external(codec::route_request(RouteOp::Add, record, &target).message)
    }

    /// Remove a route as another process would.
    pub fn remove_foreign_route(&self, record: &RouteRecord, table: u32) -> Result<()> {
        let target = codec::RouteTarget {
            table,
            protocol: 0,
            with_source: record.source().is_some(),
        };
        self.external(codec::route_request(RouteOp::Delete, record, &target).message)
    }

    /// Install a route cache entry.
    pub fn add_cloned_route(&self, record: &RouteRecord, table: u32) -> Result<()> {
        let target = codec::RouteTarget {
            table,
            protocol: 0,
            with_source: false,
        };
        match codec::route_request(RouteOp::Add, record, &target).message {
            RouteNetlinkMessage::NewRoute(mut msg) => {
                msg.header.flags |= RouteFlags::Cloned;
                self.external(RouteNetlinkMessage::NewRoute(msg))
            }
            other => self.external(other),
        }
    }

    /// Install a policy rule as another process would.
    pub fn add_rule(&self, priority: u32, src: &IpPrefix, table: u32) -> Result<()> {
        self.external(codec::rule_add_request(priority, src, table, 0).message)
    }

    /// Remove the first rule at `priority`, as an administrator might.
    pub fn remove_rule(&self, priority: u32, family: Family) -> Result<()> {
        self.external(codec::rule_flush_request(priority, family).message)
    }

    /// Assign an address to an interface.
    pub fn add_address(&self, ifindex: u32, address: IpAddr, prefix_len: u8) {
        let family = Family::of(&address);
        let mut msg = AddressMessage::default();
        msg.header.family = match family {
            Family::Inet => AddressFamily::Inet,
            Family::Inet6 => AddressFamily::Inet6,
        };
        msg.header.prefix_len = prefix_len;
        msg.header.index = ifindex;
        msg.attributes.push(AddressAttribute::Address(address));

        let mut state = self.state.lock();
        state.addresses.push(msg.clone());
        state.multicast(address_group(family), RouteNetlinkMessage::NewAddress(msg), 0, 0);
    }

    /// Bring up an interface.
    pub fn add_link(&self, index: u32, name: &str) {
        let mut msg = LinkMessage::default();
        msg.header.index = index;
        msg.attributes.push(LinkAttribute::IfName(name.to_string()));

        self.state
            .lock()
            .multicast(group_mask(RTNLGRP_LINK), RouteNetlinkMessage::NewLink(msg), 0, 0);
    }

    /// Fail the next route or rule change with `errno`.
    pub fn fail_next(&self, errno: i32) {
        self.state.lock().fail_next = Some(errno);
    }

    /// Make every subscribed socket read end of file.
    pub fn hang_up_listeners(&self) {
        let mut state = self.state.lock();
        for socket in state.sockets.values_mut() {
            if socket.groups != 0 {
                socket.queue.push_back(Vec::new());
            }
        }
    }

    pub fn routes(&self) -> Vec<KernelRoute> {
        self.state
            .lock()
            .routes
            .iter()
            .map(|r| r.route.clone())
            .collect()
    }

    /// Routes carrying `protocol`, in installation order.
    pub fn routes_of(&self, protocol: u8) -> Vec<KernelRoute> {
        self.routes()
            .into_iter()
            .filter(|r| r.record.origin == RouteOrigin::Protocol(protocol))
            .collect()
    }

    pub fn rules(&self) -> Vec<ObservedRule> {
        self.state.lock().rules.iter().map(|r| r.rule.clone()).collect()
    }

    /// Data messages received from any socket.
    pub fn requests(&self) -> usize {
        self.state.lock().requests
    }

    /// Sockets currently open.
    pub fn open_sockets(&self) -> usize {
        self.state.lock().sockets.len()
    }
}

impl Connector for SimKernel {
    type Io = SimSocket;

    fn open(&mut self, groups: u32) -> Result<SimSocket> {
        let mut state = self.state.lock();
        let port = state.next_port;
        state.next_port += 1;
        state.sockets.insert(
            port,
            SocketState {
                groups,
                queue: VecDeque::new(),
            },
        );
        debug!(port, groups, "Simulated socket opened");
        Ok(SimSocket {
            kernel: self.clone(),
            port,
        })
    }
}

/// A socket connected to a [`SimKernel`]
#[derive(Debug)]
pub struct SimSocket {
    kernel: SimKernel,
    port: u32,
}

impl NetlinkIo for SimSocket {
    fn send(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.kernel.state.lock().handle(self.port, buf);
        Ok(buf.len())
    }

    fn recv(&mut self, buf: &mut [u8]) -> io::Result<RecvInfo> {
        let mut state = self.kernel.state.lock();
        let datagram = state
            .sockets
            .get_mut(&self.port)
            .and_then(|socket| socket.queue.pop_front())
            .ok_or_else(|| io::Error::from(io::ErrorKind::WouldBlock))?;

        let len = datagram.len().min(buf.len());
        buf[..len].copy_from_slice(&datagram[..len]);
        Ok(RecvInfo {
            len,
            sender_port: 0,
            truncated: len < datagram.len(),
        })
    }

    fn wait(&mut self, _readiness: Readiness, _timeout: Duration) -> io::Result<bool> {
        let state = self.kernel.state.lock();
        Ok(state
            .sockets
            .get(&self.port)
            .is_some_and(|socket| !socket.queue.is_empty()))
    }

    fn local_port(&self) -> u32 {
        self.port
    }

    fn raw_fd(&self) -> Option<RawFd> {
        None
    }
}

impl Drop for SimSocket {
    fn drop(&mut self) {
        self.kernel.state.lock().sockets.remove(&self.port);
    }
}
