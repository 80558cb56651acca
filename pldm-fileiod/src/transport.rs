// SPDX-License-Identifier: Apache-2.0

//! MCTP socket transport.
//!
//! Thin wrappers around the Linux `AF_MCTP` socket family: a listener
//! bound to the PLDM message type for inbound host commands, and a
//! requester channel for the outbound notification path. Sockets are
//! nonblocking and integrate with the reactor through [`smol::Async`].

use core::mem;
use std::io::{Error, Result};
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};

use log::trace;
use smol::Async;

use pldm_fileio::{PldmRequest, PldmResponse};

/// MCTP message type for PLDM traffic.
pub const MCTP_TYPE_PLDM: u8 = 0x01;

/// Tag Owner bit; set on requests, clear on responses.
pub const MCTP_TAG_OWNER: u8 = 0x08;

/// Any-network value, usable in bind.
pub const MCTP_NET_ANY: u32 = 0x00;

/// Any-endpoint value, usable in bind.
pub const MCTP_ADDR_ANY: u8 = 0xff;

/* not yet in libc */
const AF_MCTP: libc::sa_family_t = 45;

#[repr(C)]
#[allow(non_camel_case_types)]
struct sockaddr_mctp {
    smctp_family: libc::sa_family_t,
    __smctp_pad0: u16,
    smctp_network: u32,
    smctp_addr: u8,
    smctp_type: u8,
    smctp_tag: u8,
    __smctp_pad1: u8,
}

/// A remote MCTP endpoint address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MctpAddr {
    /// MCTP network id.
    pub net: u32,
    /// Endpoint id.
    pub eid: u8,
}

/// Opaque token pairing a response with the frame that carried its
/// request: source address plus the reply tag (owner bit cleared).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RespKey {
    /// Originating endpoint.
    pub addr: MctpAddr,
    /// Reply tag value.
    pub tag: u8,
}

struct SockAddr(sockaddr_mctp);

impl SockAddr {
    fn new(eid: u8, net: u32, typ: u8, tag: u8) -> Self {
        SockAddr(sockaddr_mctp {
            smctp_family: AF_MCTP,
            __smctp_pad0: 0,
            smctp_network: net,
            smctp_addr: eid,
            smctp_type: typ,
            smctp_tag: tag,
            __smctp_pad1: 0,
        })
    }

    fn zero() -> Self {
        Self::new(0, MCTP_NET_ANY, 0, 0)
    }

    fn as_raw(&self) -> (*const libc::sockaddr, libc::socklen_t) {
        (
            &self.0 as *const sockaddr_mctp as *const libc::sockaddr,
            mem::size_of::<sockaddr_mctp>() as libc::socklen_t,
        )
    }

    fn as_raw_mut(&mut self) -> (*mut libc::sockaddr, libc::socklen_t) {
        (
            &mut self.0 as *mut sockaddr_mctp as *mut libc::sockaddr,
            mem::size_of::<sockaddr_mctp>() as libc::socklen_t,
        )
    }
}

/// A nonblocking `AF_MCTP` datagram socket.
pub struct MctpSocket(OwnedFd);

impl MctpSocket {
    /// Creates a socket, nonblocking and close-on-exec.
    pub fn new() -> Result<Self> {
        let rc = unsafe {
            libc::socket(
                AF_MCTP.into(),
                libc::SOCK_DGRAM | libc::SOCK_CLOEXEC | libc::SOCK_NONBLOCK,
                0,
            )
        };
        if rc < 0 {
            return Err(Error::last_os_error());
        }
        Ok(MctpSocket(unsafe { OwnedFd::from_raw_fd(rc) }))
    }

    fn bind(&self, addr: &SockAddr) -> Result<()> {
        let (addr_ptr, addr_len) = addr.as_raw();
        let rc =
            unsafe { libc::bind(self.0.as_raw_fd(), addr_ptr, addr_len) };
        if rc < 0 {
            return Err(Error::last_os_error());
        }
        Ok(())
    }

    fn recvfrom(&self, buf: &mut [u8]) -> Result<(usize, SockAddr)> {
        let mut addr = SockAddr::zero();
        let (addr_ptr, mut addr_len) = addr.as_raw_mut();
        let rc = unsafe {
            libc::recvfrom(
                self.0.as_raw_fd(),
                buf.as_mut_ptr() as *mut libc::c_void,
                buf.len(),
                0,
                addr_ptr,
                &mut addr_len,
            )
        };
        if rc < 0 {
            return Err(Error::last_os_error());
        }
        Ok((rc as usize, addr))
    }

    fn sendto(&self, buf: &[u8], addr: &SockAddr) -> Result<usize> {
        let (addr_ptr, addr_len) = addr.as_raw();
        let rc = unsafe {
            libc::sendto(
                self.0.as_raw_fd(),
                buf.as_ptr() as *const libc::c_void,
                buf.len(),
                0,
                addr_ptr,
                addr_len,
            )
        };
        if rc < 0 {
            return Err(Error::last_os_error());
        }
        Ok(rc as usize)
    }
}

impl AsFd for MctpSocket {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.0.as_fd()
    }
}

impl AsRawFd for MctpSocket {
    fn as_raw_fd(&self) -> RawFd {
        self.0.as_raw_fd()
    }
}

/// Where terminal transfer responses are delivered. The transport
/// implements this; tests substitute a recorder.
pub trait ResponseSink {
    /// Sends one encoded PLDM response toward `key`.
    fn send_response(&self, key: &RespKey, resp: &PldmResponse) -> Result<()>;
}

/// Inbound command channel: bound to the PLDM message type, receives host
/// requests and sends their responses.
pub struct HostLink {
    sock: Async<MctpSocket>,
}

impl HostLink {
    /// Binds the PLDM listener across all networks.
    pub fn new() -> Result<Self> {
        let sock = MctpSocket::new()?;
        sock.bind(&SockAddr::new(
            MCTP_ADDR_ANY,
            MCTP_NET_ANY,
            MCTP_TYPE_PLDM,
            MCTP_TAG_OWNER,
        ))?;
        Ok(Self {
            sock: Async::new(sock)?,
        })
    }

    /// Waits for one PLDM request, returning it with its response key.
    pub async fn recv_request(
        &self,
        buf: &mut [u8],
    ) -> Result<(PldmRequest, RespKey)> {
        loop {
            let (len, addr) =
                self.sock.read_with(|s| s.recvfrom(buf)).await?;
            let key = RespKey {
                addr: MctpAddr {
                    net: addr.0.smctp_network,
                    eid: addr.0.smctp_addr,
                },
                tag: addr.0.smctp_tag & !MCTP_TAG_OWNER,
            };
            match PldmRequest::from_buf(&buf[..len]) {
                Ok(req) => {
                    trace!(
                        "rx cmd {:#04x} iid {} from eid {}",
                        req.cmd,
                        req.iid,
                        key.addr.eid
                    );
                    return Ok((req, key));
                }
                Err(e) => {
                    // Not a request; a stray response or runt. Keep
                    // listening.
                    trace!("dropping non-request frame: {e}");
                }
            }
        }
    }
}

impl ResponseSink for HostLink {
    fn send_response(&self, key: &RespKey, resp: &PldmResponse) -> Result<()> {
        let addr = SockAddr::new(
            key.addr.eid,
            key.addr.net,
            MCTP_TYPE_PLDM,
            key.tag,
        );
        let out = resp.to_vec();
        let n = self.sock.get_ref().sendto(&out, &addr)?;
        if n != out.len() {
            return Err(Error::other("short MCTP send"));
        }
        trace!(
            "tx resp cmd {:#04x} iid {} cc {:#04x} to eid {}",
            resp.cmd,
            resp.iid,
            resp.cc,
            key.addr.eid
        );
        Ok(())
    }
}

/// Outbound request channel to one endpoint, for the host notifier.
pub struct MctpRequester {
    sock: Async<MctpSocket>,
    peer: MctpAddr,
}

impl MctpRequester {
    /// Creates an unbound socket talking to `peer`.
    pub fn new(peer: MctpAddr) -> Result<Self> {
        Ok(Self {
            sock: Async::new(MctpSocket::new()?)?,
            peer,
        })
    }

    /// Sends one encoded request with an owned tag.
    pub fn send(&self, buf: &[u8]) -> Result<()> {
        let addr = SockAddr::new(
            self.peer.eid,
            self.peer.net,
            MCTP_TYPE_PLDM,
            MCTP_TAG_OWNER,
        );
        let n = self.sock.get_ref().sendto(buf, &addr)?;
        if n != buf.len() {
            return Err(Error::other("short MCTP send"));
        }
        Ok(())
    }

    /// Waits for one frame from the peer, skipping other sources.
    ///
    /// Each frame is delivered once, so the channel wants a single
    /// consumer; the notifier's receive task is that consumer and fans
    /// responses out to waiters by instance id.
    pub async fn recv(&self, buf: &mut [u8]) -> Result<usize> {
        loop {
            let (len, addr) =
                self.sock.read_with(|s| s.recvfrom(buf)).await?;
            if addr.0.smctp_addr == self.peer.eid {
                return Ok(len);
            }
            trace!("dropping frame from eid {}", addr.0.smctp_addr);
        }
    }
}
