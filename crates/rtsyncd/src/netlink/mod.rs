//! Netlink transport
//!
//! Two independent channels: the *command* channel carries requests and
//! their replies (acks and multi-part dumps), the *listen* channel is
//! subscribed to route, link, address and rule notifications and is drained
//! by the event loop.
//!
//! The socket itself sits behind [`NetlinkIo`] and is opened through a
//! [`Connector`], so the same exchange logic runs against the kernel
//! ([`KernelConnector`]) or the in-memory kernel in [`crate::sim`].

mod socket;

pub use socket::{KernelConnector, KernelSocket};

use crate::codec::{self, FrameBody, Request};
use crate::error::{Result, RtsyncError};
use netlink_packet_route::RouteNetlinkMessage;
use std::io;
use std::os::fd::RawFd;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{debug, instrument, trace, warn};

/// Netlink multicast groups (RTNLGRP_*)
pub const RTNLGRP_LINK: u32 = 1;
pub const RTNLGRP_IPV4_IFADDR: u32 = 5;
pub const RTNLGRP_IPV4_ROUTE: u32 = 7;
pub const RTNLGRP_IPV4_RULE: u32 = 8;
pub const RTNLGRP_IPV6_IFADDR: u32 = 9;
pub const RTNLGRP_IPV6_ROUTE: u32 = 11;
pub const RTNLGRP_IPV6_RULE: u32 = 19;

/// Bind mask bit of a multicast group
pub const fn group_mask(group: u32) -> u32 {
    1 << (group - 1)
}

/// Groups the listen channel subscribes to
pub const LISTEN_GROUPS: u32 = group_mask(RTNLGRP_IPV6_ROUTE)
    | group_mask(RTNLGRP_IPV4_ROUTE)
    | group_mask(RTNLGRP_LINK)
    | group_mask(RTNLGRP_IPV4_IFADDR)
    | group_mask(RTNLGRP_IPV6_IFADDR)
    | group_mask(RTNLGRP_IPV4_RULE)
    | group_mask(RTNLGRP_IPV6_RULE);

/// Receive buffer for one datagram
const DATAGRAM_BUFFER_SIZE: usize = 32 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    Readable,
    Writable,
}

/// Result of receiving one datagram
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecvInfo {
    /// Bytes copied into the buffer
    pub len: usize,
    /// Port of the sending socket (0 for the kernel)
    pub sender_port: u32,
    /// The datagram did not fit the buffer
    pub truncated: bool,
}

/// A non-blocking netlink socket
pub trait NetlinkIo {
    /// Send one datagram to the kernel.
    fn send(&mut self, buf: &[u8]) -> io::Result<usize>;

    /// Receive one datagram; `WouldBlock` when none is queued.
    fn recv(&mut self, buf: &mut [u8]) -> io::Result<RecvInfo>;

    /// Wait until the socket is ready or the timeout expires.
    /// Returns `false` on timeout.
    fn wait(&mut self, readiness: Readiness, timeout: Duration) -> io::Result<bool>;

    /// Port the kernel assigned to this socket
    fn local_port(&self) -> u32;

    /// Descriptor for readiness polling, if backed by a real socket
    fn raw_fd(&self) -> Option<RawFd>;
}

/// Opens netlink sockets bound to a set of multicast groups
pub trait Connector {
    type Io: NetlinkIo;

    fn open(&mut self, groups: u32) -> Result<Self::Io>;
}

fn is_transient(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
    )
}

fn initial_seq() -> u32 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as u32)
        .unwrap_or(1)
}

/// One open netlink socket with its sequence counter
pub struct Channel<I> {
    io: I,
    port: u32,
    seq: u32,
}

impl<I: NetlinkIo> Channel<I> {
    fn new(io: I) -> Self {
        let port = io.local_port();
        Self {
            io,
            port,
            seq: initial_seq(),
        }
    }

    pub fn port(&self) -> u32 {
        self.port
    }

    pub fn seq(&self) -> u32 {
        self.seq
    }

    fn next_seq(&mut self) -> u32 {
        self.seq = self.seq.wrapping_add(1);
        self.seq
    }

    fn send(&mut self, bytes: &[u8], timeout: Duration) -> Result<()> {
        let sent = match self.io.send(bytes) {
            Ok(n) => n,
            Err(e) if is_transient(&e) => {
                match self.io.wait(Readiness::Writable, timeout) {
                    Ok(true) => {}
                    Ok(false) => {
                        return Err(RtsyncError::Transient("timed out waiting to send".into()));
                    }
                    Err(e) if is_transient(&e) => return Err(RtsyncError::Transient(e.to_string())),
                    Err(e) => return Err(RtsyncError::Netlink(format!("poll failed: {}", e))),
                }
                match self.io.send(bytes) {
                    Ok(n) => n,
                    Err(e) if is_transient(&e) => return Err(RtsyncError::Transient(e.to_string())),
                    Err(e) => return Err(RtsyncError::Netlink(format!("send failed: {}", e))),
                }
            }
            Err(e) => return Err(RtsyncError::Netlink(format!("send failed: {}", e))),
        };

        if sent < bytes.len() {
            return Err(RtsyncError::Netlink(format!(
                "short send: {} of {} bytes",
                sent,
                bytes.len()
            )));
        }
        Ok(())
    }

    /// Receive with one bounded wait-and-retry on would-block.
    fn recv(&mut self, buf: &mut [u8], timeout: Duration) -> Result<RecvInfo> {
        let info = match self.io.recv(buf) {
            Ok(info) => info,
            Err(e) if is_transient(&e) => {
                match self.io.wait(Readiness::Readable, timeout) {
                    Ok(true) => {}
                    Ok(false) => {
                        return Err(RtsyncError::Transient("timed out waiting for reply".into()));
                    }
                    Err(e) if is_transient(&e) => return Err(RtsyncError::Transient(e.to_string())),
                    Err(e) => return Err(RtsyncError::Netlink(format!("poll failed: {}", e))),
                }
                match self.io.recv(buf) {
                    Ok(info) => info,
                    Err(e) if is_transient(&e) => return Err(RtsyncError::Transient(e.to_string())),
                    Err(e) => return Err(RtsyncError::Netlink(format!("recv failed: {}", e))),
                }
            }
            Err(e) => return Err(RtsyncError::Netlink(format!("recv failed: {}", e))),
        };
        check_datagram(&info)?;
        Ok(info)
    }

    /// Send a request and read replies until the ack, error or done marker.
    fn exchange<F>(
        &mut self,
        buf: &mut [u8],
        timeout: Duration,
        request: Request,
        flags: u16,
        classify: &mut F,
    ) -> Result<usize>
    where
        F: FnMut(&RouteNetlinkMessage) -> Result<usize>,
    {
        let seq = self.next_seq();
        let bytes = codec::serialize(request.message, request.flags | flags, seq, self.port);
        self.send(&bytes, timeout)?;

        let mut found = 0;
        loop {
            let info = self.recv(buf, timeout)?;
            if info.sender_port != 0 {
                trace!(sender = info.sender_port, "message not sent by kernel");
                continue;
            }

            for frame in codec::parse_datagram(&buf[..info.len])? {
                if frame.port != self.port || frame.seq != seq {
                    trace!(
                        seq = frame.seq,
                        expected_seq = seq,
                        port = frame.port,
                        expected_port = self.port,
                        "wrong seqno"
                    );
                    continue;
                }
                match frame.body {
                    FrameBody::Done => {
                        trace!(seq, found, "done");
                        return Ok(found);
                    }
                    FrameBody::Ack => {
                        trace!(seq, "ack");
                        return Ok(found);
                    }
                    FrameBody::Error(code) => {
                        debug!(seq, code, "kernel returned error");
                        return Err(RtsyncError::from_ack_code(code));
                    }
                    FrameBody::Message(msg) => found += classify(&msg)?,
                    FrameBody::Undecodable(e) => return Err(RtsyncError::Decode(e)),
                    FrameBody::Noop => {}
                }
            }
        }
    }

    /// Read every queued notification without blocking.
    fn drain<F>(&mut self, buf: &mut [u8], ignore_port: Option<u32>, classify: &mut F) -> Result<usize>
    where
        F: FnMut(&RouteNetlinkMessage) -> Result<usize>,
    {
        let mut found = 0;
        loop {
            let info = match self.io.recv(buf) {
                Ok(info) => info,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(RtsyncError::Netlink(format!("recv failed: {}", e))),
            };
            check_datagram(&info)?;
            if info.sender_port != 0 {
                trace!(sender = info.sender_port, "message not sent by kernel");
                continue;
            }

            let frames = match codec::parse_datagram(&buf[..info.len]) {
                Ok(frames) => frames,
                Err(e) => {
                    warn!(error = %e, "Dropping malformed notification");
                    continue;
                }
            };
            for frame in frames {
                if ignore_port == Some(frame.port) {
                    trace!(port = frame.port, "ignoring own change");
                    continue;
                }
                match frame.body {
                    FrameBody::Message(msg) => found += classify(&msg)?,
                    FrameBody::Undecodable(e) => {
                        warn!(kind = frame.kind, error = %e, "Dropping undecodable notification");
                    }
                    FrameBody::Error(code) => {
                        let error = RtsyncError::from_ack_code(code);
                        warn!(%error, "Error message on listen channel");
                    }
                    FrameBody::Done | FrameBody::Ack | FrameBody::Noop => {}
                }
            }
        }
        Ok(found)
    }
}

fn check_datagram(info: &RecvInfo) -> Result<()> {
    if info.len == 0 {
        return Err(RtsyncError::Netlink("EOF".into()));
    }
    if info.truncated {
        return Err(RtsyncError::Netlink(format!(
            "truncated datagram ({} bytes kept)",
            info.len
        )));
    }
    Ok(())
}

/// Command and listen channels over one connector
pub struct Transport<C: Connector = KernelConnector> {
    connector: C,
    command: Option<Channel<C::Io>>,
    listen: Option<Channel<C::Io>>,
    /// Bumped every time a listen channel is opened
    listen_generation: u64,
    wait_timeout: Duration,
    buffer: Vec<u8>,
}

impl<C: Connector> Transport<C> {
    pub fn new(connector: C, wait_timeout: Duration) -> Self {
        Self {
            connector,
            command: None,
            listen: None,
            listen_generation: 0,
            wait_timeout,
            buffer: vec![0u8; DATAGRAM_BUFFER_SIZE],
        }
    }

    pub fn connector(&self) -> &C {
        &self.connector
    }

    /// Open the command channel unless it is already open.
    pub fn open_command(&mut self) -> Result<()> {
        if self.command.is_none() {
            let channel = Channel::new(self.connector.open(0)?);
            debug!(port = channel.port(), "Opened command channel");
            self.command = Some(channel);
        }
        Ok(())
    }

    /// Open the listen channel unless it is already open.
    pub fn open_listen(&mut self) -> Result<()> {
        if self.listen.is_none() {
            let channel = Channel::new(self.connector.open(LISTEN_GROUPS)?);
            self.listen_generation = self.listen_generation.wrapping_add(1);
            debug!(
                port = channel.port(),
                groups = LISTEN_GROUPS,
                generation = self.listen_generation,
                "Opened listen channel"
            );
            self.listen = Some(channel);
        }
        Ok(())
    }

    pub fn is_command_open(&self) -> bool {
        self.command.is_some()
    }

    pub fn is_listen_open(&self) -> bool {
        self.listen.is_some()
    }

    pub fn close_command(&mut self) {
        if self.command.take().is_some() {
            debug!("Closed command channel");
        }
    }

    pub fn close_listen(&mut self) {
        if self.listen.take().is_some() {
            debug!("Closed listen channel");
        }
    }

    pub fn command_port(&self) -> Option<u32> {
        self.command.as_ref().map(Channel::port)
    }

    pub fn listen_fd(&self) -> Option<RawFd> {
        self.listen.as_ref().and_then(|c| c.io.raw_fd())
    }

    /// Changes whenever the listen channel is reopened, even when the new
    /// socket reuses the old descriptor number.
    pub fn listen_generation(&self) -> u64 {
        self.listen_generation
    }

    fn exchange<F>(&mut self, request: Request, flags: u16, mut classify: F) -> Result<usize>
    where
        F: FnMut(&RouteNetlinkMessage) -> Result<usize>,
    {
        self.open_command()?;
        let Some(channel) = self.command.as_mut() else {
            return Err(RtsyncError::NotInitialized);
        };

        let result = channel.exchange(
            &mut self.buffer,
            self.wait_timeout,
            request,
            flags,
            &mut classify,
        );
        if let Err(e) = &result {
            if e.is_channel_fatal() {
                warn!(error = %e, "Closing command channel");
                self.command = None;
            }
        }
        result
    }

    /// Send a mutating request and wait for its acknowledgement.
    #[instrument(skip_all)]
    pub fn talk(&mut self, request: Request) -> Result<()> {
        self.exchange(request, codec::NLM_F_ACK, |_| Ok(0))
            .map(|_| ())
    }

    /// Send a dump request and classify every reply until the done marker.
    ///
    /// The classifier returns how many entries a message contributed; an
    /// error aborts the dump.
    #[instrument(skip_all)]
    pub fn dump<F>(&mut self, request: Request, classify: F) -> Result<usize>
    where
        F: FnMut(&RouteNetlinkMessage) -> Result<usize>,
    {
        self.exchange(request, 0, classify)
    }

    /// Classify every notification queued on the listen channel.
    ///
    /// Notifications caused by the command channel are skipped.
    #[instrument(skip_all)]
    pub fn drain_listen<F>(&mut self, mut classify: F) -> Result<usize>
    where
        F: FnMut(&RouteNetlinkMessage) -> Result<usize>,
    {
        let ignore_port = self.command_port();
        let Some(channel) = self.listen.as_mut() else {
            return Err(RtsyncError::NotInitialized);
        };

        let result = channel.drain(&mut self.buffer, ignore_port, &mut classify);
        if let Err(e) = &result {
            if e.is_channel_fatal() {
                warn!(error = %e, "Closing listen channel");
                self.listen = None;
            }
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{DumpKind, NLM_F_DUMP};
    use rtsync_types::Family;
    use std::cell::RefCell;
    use std::collections::VecDeque;
    use std::rc::Rc;

    /// What the scripted socket returns on each recv
    enum Step {
        Datagram(Vec<u8>, u32),
        WouldBlock,
        Fail(io::ErrorKind),
        Truncated,
        Eof,
    }

    #[derive(Default)]
    struct Script {
        steps: VecDeque<Step>,
        sent: Vec<Vec<u8>>,
        waits: usize,
        ready_after_wait: bool,
        opened: usize,
    }

    /// Replies with the sequence number of the last request sent.
    enum Reply {
        Ack,
        Error(i32),
        Done,
    }

    struct ScriptedIo {
        script: Rc<RefCell<Script>>,
        port: u32,
    }

    impl NetlinkIo for ScriptedIo {
        fn send(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.script.borrow_mut().sent.push(buf.to_vec());
            Ok(buf.len())
        }

        fn recv(&mut self, buf: &mut [u8]) -> io::Result<RecvInfo> {
            let mut script = self.script.borrow_mut();
            match script.steps.pop_front() {
                Some(Step::Datagram(bytes, sender)) => {
                    buf[..bytes.len()].copy_from_slice(&bytes);
                    Ok(RecvInfo {
                        len: bytes.len(),
                        sender_port: sender,
                        truncated: false,
                    })
                }
                Some(Step::Truncated) => Ok(RecvInfo {
                    len: 16,
                    sender_port: 0,
                    truncated: true,
                }),
                Some(Step::Eof) => Ok(RecvInfo {
                    len: 0,
                    sender_port: 0,
                    truncated: false,
                }),
                Some(Step::Fail(kind)) => Err(io::Error::from(kind)),
                Some(Step::WouldBlock) | None => Err(io::Error::from(io::ErrorKind::WouldBlock)),
            }
        }

        fn wait(&mut self, _readiness: Readiness, _timeout: Duration) -> io::Result<bool> {
            let mut script = self.script.borrow_mut();
            script.waits += 1;
            Ok(script.ready_after_wait)
        }

        fn local_port(&self) -> u32 {
            self.port
        }

        fn raw_fd(&self) -> Option<RawFd> {
            None
        }
    }

    struct ScriptedConnector {
        script: Rc<RefCell<Script>>,
    }

    impl Connector for ScriptedConnector {
        type Io = ScriptedIo;

        fn open(&mut self, _groups: u32) -> Result<ScriptedIo> {
            let mut script = self.script.borrow_mut();
            script.opened += 1;
            Ok(ScriptedIo {
                script: self.script.clone(),
                port: 4000 + script.opened as u32,
            })
        }
    }

    fn transport() -> (Transport<ScriptedConnector>, Rc<RefCell<Script>>) {
        let script = Rc::new(RefCell::new(Script::default()));
        let transport = Transport::new(
            ScriptedConnector {
                script: script.clone(),
            },
            Duration::from_millis(100),
        );
        (transport, script)
    }

    /// Queue a reply for the request the transport is about to send.
    fn queue_reply(transport: &mut Transport<ScriptedConnector>, script: &Rc<RefCell<Script>>, reply: Reply) {
        transport.open_command().unwrap();
        let channel = transport.command.as_ref().unwrap();
        let seq = channel.seq().wrapping_add(1);
        let port = channel.port();
        let bytes = match reply {
            Reply::Ack => codec::ack_frame(seq, port, 0, &[]),
            Reply::Error(errno) => codec::ack_frame(seq, port, errno, &[]),
            Reply::Done => codec::done_frame(seq, port),
        };
        script.borrow_mut().steps.push_back(Step::Datagram(bytes, 0));
    }

    fn flush_request() -> Request {
        codec::rule_flush_request(100, Family::Inet6)
    }

    #[test]
    fn test_talk_ack() {
        let (mut transport, script) = transport();
        queue_reply(&mut transport, &script, Reply::Ack);
        transport.talk(flush_request()).unwrap();

        let sent = &script.borrow().sent;
        assert_eq!(sent.len(), 1);
        let frames = codec::parse_datagram(&sent[0]).unwrap();
        assert_ne!(frames[0].flags & codec::NLM_F_ACK, 0);
    }

    #[test]
    fn test_talk_kernel_error() {
        let (mut transport, script) = transport();
        queue_reply(&mut transport, &script, Reply::Error(libc::ENOENT));
        let err = transport.talk(flush_request()).unwrap_err();
        assert!(err.is_not_found());
        assert_eq!(err.kernel_code(), Some(libc::ENOENT));
        assert!(transport.is_command_open());
    }

    #[test]
    fn test_sequence_numbers_increase() {
        let (mut transport, script) = transport();
        queue_reply(&mut transport, &script, Reply::Ack);
        transport.talk(flush_request()).unwrap();
        queue_reply(&mut transport, &script, Reply::Ack);
        transport.talk(flush_request()).unwrap();

        let sent = &script.borrow().sent;
        let first = codec::parse_datagram(&sent[0]).unwrap()[0].seq;
        let second = codec::parse_datagram(&sent[1]).unwrap()[0].seq;
        assert_eq!(second, first.wrapping_add(1));
    }

    #[test]
    fn test_wrong_seqno_and_foreign_sender_ignored() {
        let (mut transport, script) = transport();
        transport.open_command().unwrap();
        let port = transport.command_port().unwrap();
        let stale = transport.command.as_ref().unwrap().seq();
        script
            .borrow_mut()
            .steps
            .push_back(Step::Datagram(codec::ack_frame(stale, port, libc::EEXIST, &[]), 0));
        script.borrow_mut().steps.push_back(Step::Datagram(
            codec::ack_frame(stale.wrapping_add(1), port, libc::EEXIST, &[]),
            77,
        ));
        queue_reply(&mut transport, &script, Reply::Ack);

        transport.talk(flush_request()).unwrap();
    }

    #[test]
    fn test_would_block_waits_once_then_retries() {
        let (mut transport, script) = transport();
        script.borrow_mut().ready_after_wait = true;
        script.borrow_mut().steps.push_back(Step::WouldBlock);
        queue_reply(&mut transport, &script, Reply::Ack);

        transport.talk(flush_request()).unwrap();
        assert_eq!(script.borrow().waits, 1);
    }

    #[test]
    fn test_would_block_twice_is_transient() {
        let (mut transport, script) = transport();
        script.borrow_mut().ready_after_wait = true;
        script.borrow_mut().steps.push_back(Step::WouldBlock);
        script.borrow_mut().steps.push_back(Step::WouldBlock);

        let err = transport.talk(flush_request()).unwrap_err();
        assert!(matches!(err, RtsyncError::Transient(_)));
        assert!(transport.is_command_open());
    }

    #[test]
    fn test_wait_timeout_is_transient() {
        let (mut transport, _script) = transport();
        let err = transport.talk(flush_request()).unwrap_err();
        assert!(matches!(err, RtsyncError::Transient(_)));
    }

    #[test]
    fn test_eof_closes_channel_and_reopens() {
        let (mut transport, script) = transport();
        script.borrow_mut().steps.push_back(Step::Eof);
        let err = transport.talk(flush_request()).unwrap_err();
        assert!(err.is_channel_fatal());
        assert!(!transport.is_command_open());

        queue_reply(&mut transport, &script, Reply::Ack);
        transport.talk(flush_request()).unwrap();
        assert_eq!(script.borrow().opened, 2);
    }

    #[test]
    fn test_truncated_datagram_is_fatal() {
        let (mut transport, script) = transport();
        script.borrow_mut().steps.push_back(Step::Truncated);
        assert!(transport.talk(flush_request()).unwrap_err().is_channel_fatal());
        assert!(!transport.is_command_open());
    }

    #[test]
    fn test_io_error_is_fatal() {
        let (mut transport, script) = transport();
        script
            .borrow_mut()
            .steps
            .push_back(Step::Fail(io::ErrorKind::ConnectionReset));
        assert!(transport.talk(flush_request()).unwrap_err().is_channel_fatal());
    }

    #[test]
    fn test_dump_collects_until_done() {
        let (mut transport, script) = transport();
        transport.open_command().unwrap();
        let port = transport.command_port().unwrap();
        let seq = transport.command.as_ref().unwrap().seq().wrapping_add(1);

        let rules = [
            codec::rule_add_request(100, &"10.0.0.0/8".parse().unwrap(), 10, 42),
            codec::rule_add_request(101, &"10.1.0.0/16".parse().unwrap(), 11, 42),
        ];
        let mut datagram = Vec::new();
        for rule in rules {
            datagram.extend(codec::serialize(rule.message, codec::NLM_F_MULTI, seq, port));
        }
        script.borrow_mut().steps.push_back(Step::Datagram(datagram, 0));
        script
            .borrow_mut()
            .steps
            .push_back(Step::Datagram(codec::done_frame(seq, port), 0));

        let mut priorities = Vec::new();
        let found = transport
            .dump(codec::dump_request(DumpKind::Rules, Some(Family::Inet)), |msg| {
                if let RouteNetlinkMessage::NewRule(rule) = msg {
                    let rule = codec::decode_rule(rule)?.unwrap();
                    priorities.push(rule.priority.unwrap());
                    return Ok(1);
                }
                Ok(0)
            })
            .unwrap();
        assert_eq!(found, 2);
        assert_eq!(priorities, vec![100, 101]);

        let sent = codec::parse_datagram(&script.borrow().sent[0]).unwrap();
        assert_eq!(sent[0].flags & NLM_F_DUMP, NLM_F_DUMP);
    }

    #[test]
    fn test_dump_classifier_error_aborts() {
        let (mut transport, script) = transport();
        transport.open_command().unwrap();
        let port = transport.command_port().unwrap();
        let seq = transport.command.as_ref().unwrap().seq().wrapping_add(1);
        let rule = codec::rule_add_request(100, &"10.0.0.0/8".parse().unwrap(), 10, 42);
        script.borrow_mut().steps.push_back(Step::Datagram(
            codec::serialize(rule.message, codec::NLM_F_MULTI, seq, port),
            0,
        ));

        let err = transport
            .dump(codec::dump_request(DumpKind::Rules, None), |_| {
                Err(RtsyncError::Decode("bad".into()))
            })
            .unwrap_err();
        assert!(matches!(err, RtsyncError::Decode(_)));
    }

    #[test]
    fn test_drain_skips_own_port() {
        let (mut transport, script) = transport();
        transport.open_command().unwrap();
        transport.open_listen().unwrap();
        let own = transport.command_port().unwrap();

        let rule = codec::rule_add_request(100, &"10.0.0.0/8".parse().unwrap(), 10, 42);
        let mine = codec::serialize(rule.message.clone(), 0, 1, own);
        let theirs = codec::serialize(rule.message, 0, 1, 0);
        script.borrow_mut().steps.push_back(Step::Datagram(mine, 0));
        script.borrow_mut().steps.push_back(Step::Datagram(theirs, 0));

        let found = transport.drain_listen(|_| Ok(1)).unwrap();
        assert_eq!(found, 1);
        // Queue is empty now; draining again finds nothing and never waits
        assert_eq!(transport.drain_listen(|_| Ok(1)).unwrap(), 0);
        assert_eq!(script.borrow().waits, 0);
    }

    #[test]
    fn test_drain_eof_closes_listen() {
        let (mut transport, script) = transport();
        transport.open_listen().unwrap();
        script.borrow_mut().steps.push_back(Step::Eof);
        assert!(transport.drain_listen(|_| Ok(1)).unwrap_err().is_channel_fatal());
        assert!(!transport.is_listen_open());
    }

    #[test]
    fn test_listen_reopen_bumps_generation() {
        let (mut transport, script) = transport();
        assert_eq!(transport.listen_generation(), 0);
        transport.open_listen().unwrap();
        transport.open_listen().unwrap();
        assert_eq!(transport.listen_generation(), 1);

        script.borrow_mut().steps.push_back(Step::Eof);
        assert!(transport.drain_listen(|_| Ok(1)).is_err());
        assert_eq!(transport.listen_generation(), 1);

        transport.open_listen().unwrap();
        assert_eq!(transport.listen_generation(), 2);
    }

    #[test]
    fn test_drain_requires_listen_channel() {
        let (mut transport, _script) = transport();
        assert!(matches!(
            transport.drain_listen(|_| Ok(0)),
            Err(RtsyncError::NotInitialized)
        ));
    }

    #[test]
    fn test_listen_groups() {
        assert_eq!(group_mask(RTNLGRP_LINK), 1);
        assert_eq!(group_mask(RTNLGRP_IPV6_ROUTE), 1 << 10);
        assert_eq!(LISTEN_GROUPS.count_ones(), 7);
    }
}
