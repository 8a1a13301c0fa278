//! Kernel netlink socket

use super::{Connector, NetlinkIo, Readiness, RecvInfo};
use crate::error::{Result, RtsyncError};
use netlink_sys::{Socket, SocketAddr, protocols::NETLINK_ROUTE};
use std::io;
use std::os::fd::{AsRawFd, RawFd};
use std::time::Duration;
use tracing::{debug, instrument, warn};

/// Opens NETLINK_ROUTE sockets
#[derive(Debug, Clone)]
pub struct KernelConnector {
    recv_buffer_size: usize,
}

impl KernelConnector {
    pub fn new(recv_buffer_size: usize) -> Self {
        Self { recv_buffer_size }
    }
}

impl Connector for KernelConnector {
    type Io = KernelSocket;

    #[instrument(skip(self))]
    fn open(&mut self, groups: u32) -> Result<KernelSocket> {
        let mut socket = Socket::new(NETLINK_ROUTE)
            .map_err(|e| RtsyncError::Netlink(format!("Failed to create socket: {}", e)))?;

        socket
            .bind(&SocketAddr::new(0, groups))
            .map_err(|e| RtsyncError::Netlink(format!("Failed to bind socket: {}", e)))?;

        socket
            .set_non_blocking(true)
            .map_err(|e| RtsyncError::Netlink(format!("Failed to set non-blocking mode: {}", e)))?;

        let mut addr = SocketAddr::new(0, 0);
        socket
            .get_address(&mut addr)
            .map_err(|e| RtsyncError::Netlink(format!("Failed to get socket address: {}", e)))?;

        let kernel_socket = KernelSocket {
            socket,
            port: addr.port_number(),
        };
        if groups != 0 {
            kernel_socket.tune(self.recv_buffer_size);
        }

        debug!(port = kernel_socket.port, groups, "Netlink socket bound");
        Ok(kernel_socket)
    }
}

/// A bound, non-blocking NETLINK_ROUTE socket
pub struct KernelSocket {
    socket: Socket,
    port: u32,
}

impl KernelSocket {
    /// Enlarge the receive buffer and stop ENOBUFS under notification bursts.
    /// Both are best effort.
    fn tune(&self, recv_buffer_size: usize) {
        let fd = self.socket.as_raw_fd();

        unsafe {
            let size = recv_buffer_size as libc::c_int;
            let ret = libc::setsockopt(
                fd,
                libc::SOL_SOCKET,
                libc::SO_RCVBUF,
                &size as *const _ as *const libc::c_void,
                std::mem::size_of::<libc::c_int>() as libc::socklen_t,
            );
            if ret < 0 {
                warn!("Failed to set SO_RCVBUF, using default buffer size");
            } else {
                debug!(size = recv_buffer_size, "Set socket receive buffer");
            }

            let enable: libc::c_int = 1;
            let ret = libc::setsockopt(
                fd,
                libc::SOL_NETLINK,
                libc::NETLINK_NO_ENOBUFS,
                &enable as *const _ as *const libc::c_void,
                std::mem::size_of::<libc::c_int>() as libc::socklen_t,
            );
            if ret < 0 {
                warn!("Failed to set NETLINK_NO_ENOBUFS");
            }
        }
    }
}

impl NetlinkIo for KernelSocket {
    fn send(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.socket.send_to(buf, &SocketAddr::new(0, 0), 0)
    }

    fn recv(&mut self, buf: &mut [u8]) -> io::Result<RecvInfo> {
        let mut addr: libc::sockaddr_nl = unsafe { std::mem::zeroed() };
        let mut iov = libc::iovec {
            iov_base: buf.as_mut_ptr() as *mut libc::c_void,
            iov_len: buf.len(),
        };
        let mut msg: libc::msghdr = unsafe { std::mem::zeroed() };
        msg.msg_name = &mut addr as *mut _ as *mut libc::c_void;
        msg.msg_namelen = std::mem::size_of::<libc::sockaddr_nl>() as libc::socklen_t;
        msg.msg_iov = &mut iov;
        msg.msg_iovlen = 1;

        let ret = unsafe { libc::recvmsg(self.socket.as_raw_fd(), &mut msg, 0) };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }

        if msg.msg_namelen as usize != std::mem::size_of::<libc::sockaddr_nl>() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("unexpected sender address length ({})", msg.msg_namelen),
            ));
        }

        Ok(RecvInfo {
            len: ret as usize,
            sender_port: addr.nl_pid,
            truncated: msg.msg_flags & libc::MSG_TRUNC != 0,
        })
    }

    fn wait(&mut self, readiness: Readiness, timeout: Duration) -> io::Result<bool> {
        let events = match readiness {
            Readiness::Readable => libc::POLLIN,
            Readiness::Writable => libc::POLLOUT,
        };
        let mut pfd = libc::pollfd {
            fd: self.socket.as_raw_fd(),
            events,
            revents: 0,
        };
        let timeout_ms = libc::c_int::try_from(timeout.as_millis()).unwrap_or(libc::c_int::MAX);

        let ret = unsafe { libc::poll(&mut pfd, 1, timeout_ms) };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(ret > 0)
    }

    fn local_port(&self) -> u32 {
        self.port
    }

    fn raw_fd(&self) -> Option<RawFd> {
        Some(self.socket.as_raw_fd())
    }
}
