//! Kernel rule transport: netlink sockets and the blocking
//! request/acknowledge primitive.
//!
//! [`RuleChannel`] is the seam between the policy driver and the
//! kernel: one encoded request goes down, the call blocks until the
//! kernel acks or rejects it. The Linux implementation uses a
//! connected NETLINK_ROUTE socket; a second socket subscribed to the
//! rule multicast groups surfaces kernel-originated notifications.

use crate::codec;
use crate::error::Result;
use crate::types::{KernelRule, RuleOp};

/// Transport primitive for rule transactions.
pub trait RuleChannel {
    /// Send an encoded rule request and block until the kernel
    /// acknowledges or rejects it. No implicit retry.
    fn send_and_await_ack(&mut self, request: &[u8]) -> Result<()>;
}

#[cfg(target_os = "linux")]
mod sys {
    use super::RuleChannel;
    use crate::codec;
    use crate::error::{PbrError, Result};
    use crate::registry::InterfaceRegistry;
    use crate::types::{KernelRule, RuleOp};
    use netlink_sys::{protocols::NETLINK_ROUTE, Socket, SocketAddr};
    use std::os::fd::AsRawFd;
    use tracing::{debug, warn};

    /// Netlink multicast groups for rule notifications.
    const RTNLGRP_IPV4_RULE: u32 = 8;
    const RTNLGRP_IPV6_RULE: u32 = 19;

    /// Socket receive buffer size for notification bursts.
    const SOCKET_RECV_BUFFER_SIZE: usize = 1024 * 1024;

    /// Receive buffer length for a single recv call.
    const RECV_BUF_LEN: usize = 65536;

    /// Raise the receive buffer and tolerate bursts without ENOBUFS.
    fn tune_socket(socket: &Socket) {
        let fd = socket.as_raw_fd();
        unsafe {
            let size = SOCKET_RECV_BUFFER_SIZE as libc::c_int;
            let ret = libc::setsockopt(
                fd,
                libc::SOL_SOCKET,
                libc::SO_RCVBUF,
                &size as *const _ as *const libc::c_void,
                std::mem::size_of::<libc::c_int>() as libc::socklen_t,
            );
            if ret < 0 {
                warn!("failed to set SO_RCVBUF, using default buffer size");
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
                warn!("failed to set NETLINK_NO_ENOBUFS");
            }
        }
    }

    /// Connected request/response socket for rule transactions.
    pub struct NetlinkRuleChannel {
        socket: Socket,
        buffer: Vec<u8>,
    }

    impl NetlinkRuleChannel {
        pub fn new() -> Result<Self> {
            let mut socket = Socket::new(NETLINK_ROUTE)
                .map_err(|e| PbrError::Netlink(format!("failed to create socket: {}", e)))?;
            socket
                .bind(&SocketAddr::new(0, 0))
                .map_err(|e| PbrError::Netlink(format!("failed to bind socket: {}", e)))?;
            socket
                .connect(&SocketAddr::new(0, 0))
                .map_err(|e| PbrError::Netlink(format!("failed to connect socket: {}", e)))?;

            debug!("netlink rule channel connected");

            Ok(Self {
                socket,
                buffer: vec![0u8; RECV_BUF_LEN],
            })
        }
    }

    impl RuleChannel for NetlinkRuleChannel {
        fn send_and_await_ack(&mut self, request: &[u8]) -> Result<()> {
            self.socket
                .send(request, 0)
                .map_err(|e| PbrError::Netlink(format!("failed to send: {}", e)))?;

            let len = {
                let mut buf = &mut self.buffer[..];
                self.socket
                    .recv(&mut buf, 0)
                    .map_err(|e| PbrError::Netlink(format!("failed to receive ack: {}", e)))?
            };
            codec::decode_ack(&self.buffer[..len])
        }
    }

    /// Multicast listener for kernel-originated rule changes.
    pub struct RuleListener {
        socket: Socket,
        buffer: Vec<u8>,
    }

    impl RuleListener {
        pub fn new() -> Result<Self> {
            let mut socket = Socket::new(NETLINK_ROUTE)
                .map_err(|e| PbrError::Netlink(format!("failed to create socket: {}", e)))?;

            let groups = (1 << (RTNLGRP_IPV4_RULE - 1)) | (1 << (RTNLGRP_IPV6_RULE - 1));
            socket
                .bind(&SocketAddr::new(0, groups))
                .map_err(|e| PbrError::Netlink(format!("failed to bind socket: {}", e)))?;

            tune_socket(&socket);
            debug!("netlink rule listener bound to rule groups");

            Ok(Self {
                socket,
                buffer: vec![0u8; RECV_BUF_LEN],
            })
        }

        /// Drain pending rule notifications without blocking. Returns
        /// an empty set when nothing is queued.
        pub fn try_poll(
            &mut self,
            interfaces: &InterfaceRegistry,
        ) -> Result<Vec<(RuleOp, KernelRule)>> {
            let len = {
                let mut buf = &mut self.buffer[..];
                match self.socket.recv(&mut buf, libc::MSG_DONTWAIT) {
                    Ok(len) => len,
                    Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                        return Ok(Vec::new());
                    }
                    Err(e) => {
                        return Err(PbrError::Netlink(format!("failed to receive: {}", e)));
                    }
                }
            };
            Ok(codec::decode_notifications(&self.buffer, len, interfaces))
        }
    }
}

#[cfg(target_os = "linux")]
pub use sys::{NetlinkRuleChannel, RuleListener};

/// Mock implementations for non-Linux platforms (development only).
#[cfg(not(target_os = "linux"))]
mod sys {
    use super::RuleChannel;
    use crate::error::Result;
    use crate::registry::InterfaceRegistry;
    use crate::types::{KernelRule, RuleOp};

    pub struct NetlinkRuleChannel;

    impl NetlinkRuleChannel {
        pub fn new() -> Result<Self> {
            Ok(Self)
        }
    }

    impl RuleChannel for NetlinkRuleChannel {
        fn send_and_await_ack(&mut self, _request: &[u8]) -> Result<()> {
            Ok(())
        }
    }

    pub struct RuleListener;

    impl RuleListener {
        pub fn new() -> Result<Self> {
            Ok(Self)
        }

        pub fn try_poll(
            &mut self,
            _interfaces: &InterfaceRegistry,
        ) -> Result<Vec<(RuleOp, KernelRule)>> {
            Ok(Vec::new())
        }
    }
}

#[cfg(not(target_os = "linux"))]
pub use sys::{NetlinkRuleChannel, RuleListener};

/// In-memory [`RuleChannel`] that records every request and acks it.
/// Stands in for the kernel socket in the test suites; failures can be
/// injected per transaction.
#[derive(Debug, Default)]
pub struct RecordingChannel {
    sent: Vec<Vec<u8>>,
    fail_next: bool,
}

impl RecordingChannel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next transaction fail after being recorded.
    pub fn fail_next(&mut self) {
        self.fail_next = true;
    }

    /// Raw requests in send order.
    pub fn sent(&self) -> &[Vec<u8>] {
        &self.sent
    }

    /// Decoded view of every recorded request, in send order.
    pub fn transactions(&self) -> Vec<(RuleOp, KernelRule)> {
        self.sent
            .iter()
            .map(|buf| codec::decode_request(buf).expect("recorded request decodes"))
            .collect()
    }

    pub fn clear(&mut self) {
        self.sent.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.sent.is_empty()
    }

    pub fn len(&self) -> usize {
        self.sent.len()
    }
}

impl RuleChannel for RecordingChannel {
    fn send_and_await_ack(&mut self, request: &[u8]) -> Result<()> {
        self.sent.push(request.to_vec());
        if self.fail_next {
            self.fail_next = false;
            return Err(crate::error::PbrError::Netlink(
                "injected transaction failure".to_string(),
            ));
        }
        Ok(())
    }
}
