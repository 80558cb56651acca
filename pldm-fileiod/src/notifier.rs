// SPDX-License-Identifier: Apache-2.0

//! Outbound notifications to the host.
//!
//! The reverse path of the dispatcher: when a file appears on the BMC
//! (resource dump parameters, a CSR, a license blob), the host is told
//! with a NewFileAvailable or FileAck request and the matching response
//! is awaited. Several notifications may be in flight at once; a single
//! receive task drains the socket and hands each inbound frame to the
//! waiter registered under its instance id, so concurrent callers never
//! consume one another's responses. In-flight requests are bounded by
//! the 32 instance ids; retries are the transport's concern, not ours.

use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::io;
use std::rc::Rc;
use std::time::Duration;

use deku::DekuContainerWrite;
use log::{debug, warn};
use smol::channel::{bounded, Sender};
use smol::future::FutureExt;
use smol::{Task, Timer};

use pldm_fileio::proto::{
    Cmd, FileAckReq, FileAckWithMetaReq, NewFileReq, NewFileWithMetaReq,
};
use pldm_fileio::{
    proto_error, CCode, InstanceIdDb, PldmError, PldmRequest, PldmResponse,
    HYPERVISOR_TID, PLDM_TYPE_OEM,
};

use crate::reactor::Reactor;
use crate::transport::MctpRequester;

/// How long to wait for the host's response before surfacing an error.
pub const RESPONSE_TIMEOUT: Duration = Duration::from_millis(4800);

/// Failures on the notification path.
#[derive(Debug)]
pub enum NotifyError {
    /// Socket-level failure.
    Io(io::Error),
    /// No response within [`RESPONSE_TIMEOUT`].
    Timeout,
    /// The host answered with a non-success completion code.
    Peer(u8),
    /// Encode failure, a mismatched response, or instance-id exhaustion.
    Protocol(PldmError),
}

impl fmt::Display for NotifyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(e) => write!(f, "notify send failed: {e}"),
            Self::Timeout => write!(f, "host response timed out"),
            Self::Peer(cc) => write!(f, "host rejected request, cc {cc:#04x}"),
            Self::Protocol(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for NotifyError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            Self::Protocol(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for NotifyError {
    fn from(e: io::Error) -> Self {
        Self::Io(e)
    }
}

impl From<PldmError> for NotifyError {
    fn from(e: PldmError) -> Self {
        Self::Protocol(e)
    }
}

/// Checks a received response against the request it should answer.
fn matches(req: &PldmRequest, resp: &PldmResponse) -> bool {
    resp.iid == req.iid && resp.typ == req.typ && resp.cmd == req.cmd
}

/// Waiters for in-flight requests, keyed by instance id.
type Waiters = RefCell<HashMap<u8, Sender<PldmResponse>>>;

struct Shared {
    link: MctpRequester,
    waiters: Waiters,
}

/// Hands one inbound frame to the waiter registered under its instance
/// id; frames nobody is waiting for are dropped.
fn route_frame(waiters: &Waiters, frame: &[u8]) {
    let resp = match PldmResponse::from_buf(frame) {
        Ok(r) => r,
        Err(e) => {
            debug!("skipping frame: {e}");
            return;
        }
    };
    let Some(tx) = waiters.borrow_mut().remove(&resp.iid) else {
        debug!(
            "no waiter for response iid {} cmd {:#04x}",
            resp.iid, resp.cmd
        );
        return;
    };
    // A waiter that already timed out has dropped its receiver.
    let _ = tx.try_send(resp);
}

/// Sole consumer of the requester socket.
async fn pump(shared: Rc<Shared>) {
    let mut buf = [0u8; 256];
    loop {
        match shared.link.recv(&mut buf).await {
            Ok(len) => route_frame(&shared.waiters, &buf[..len]),
            Err(e) => {
                warn!("notifier receive failed: {e}");
                return;
            }
        }
    }
}

/// The host-facing requester.
pub struct HostNotifier {
    shared: Rc<Shared>,
    iids: RefCell<InstanceIdDb>,
    // Receive task; cancelled when the notifier is dropped.
    _pump: Task<()>,
}

impl HostNotifier {
    /// Wraps an MCTP channel to the host endpoint and starts the receive
    /// task on the reactor.
    pub fn new(link: MctpRequester, reactor: &Reactor) -> Self {
        let shared = Rc::new(Shared {
            link,
            waiters: RefCell::new(HashMap::new()),
        });
        let _pump = reactor.spawn(pump(shared.clone()));
        Self {
            shared,
            iids: RefCell::new(InstanceIdDb::new()),
            _pump,
        }
    }

    /// Announces a new file to the host.
    pub async fn new_file_available(
        &self,
        file_type: u16,
        file_handle: u32,
        length: u64,
    ) -> Result<(), NotifyError> {
        let body = NewFileReq {
            file_type,
            file_handle,
            length,
        };
        self.transfer(Cmd::NewFileAvailable, body.to_bytes().map_err(PldmError::from)?)
            .await
    }

    /// Announces a new file with type-specific metadata.
    pub async fn new_file_available_with_meta(
        &self,
        file_type: u16,
        file_handle: u32,
        length: u64,
        meta: [u32; 4],
    ) -> Result<(), NotifyError> {
        let body = NewFileWithMetaReq {
            file_type,
            file_handle,
            length,
            meta,
        };
        self.transfer(
            Cmd::NewFileAvailableWithMetaData,
            body.to_bytes().map_err(PldmError::from)?,
        )
        .await
    }

    /// Acknowledges a host file.
    pub async fn file_ack(
        &self,
        file_type: u16,
        file_handle: u32,
        status: u8,
    ) -> Result<(), NotifyError> {
        let body = FileAckReq {
            file_type,
            file_handle,
            status,
        };
        self.transfer(Cmd::FileAck, body.to_bytes().map_err(PldmError::from)?)
            .await
    }

    /// Acknowledges a host file with metadata.
    pub async fn file_ack_with_meta(
        &self,
        file_type: u16,
        file_handle: u32,
        status: u8,
        meta: [u32; 4],
    ) -> Result<(), NotifyError> {
        let body = FileAckWithMetaReq {
            file_type,
            file_handle,
            status,
            meta,
        };
        self.transfer(
            Cmd::FileAckWithMetaData,
            body.to_bytes().map_err(PldmError::from)?,
        )
        .await
    }

    async fn transfer(
        &self,
        cmd: Cmd,
        payload: Vec<u8>,
    ) -> Result<(), NotifyError> {
        let iid = self.iids.borrow_mut().alloc()?;
        let result = self.transfer_inner(iid, cmd, payload).await;
        self.shared.waiters.borrow_mut().remove(&iid);
        self.iids.borrow_mut().free(iid);
        result
    }

    async fn transfer_inner(
        &self,
        iid: u8,
        cmd: Cmd,
        payload: Vec<u8>,
    ) -> Result<(), NotifyError> {
        let mut req = PldmRequest::new(PLDM_TYPE_OEM, cmd as u8, payload);
        req.iid = iid;

        let (tx, rx) = bounded(1);
        self.shared.waiters.borrow_mut().insert(iid, tx);

        debug!("tx {cmd:?} iid {iid} to host terminus {HYPERVISOR_TID}");
        self.shared.link.send(&req.to_vec())?;

        let wait = async {
            rx.recv().await.map_err(|_| {
                NotifyError::Protocol(proto_error!(
                    "notifier receive task gone"
                ))
            })
        };
        let expiry = async {
            Timer::after(RESPONSE_TIMEOUT).await;
            Err::<PldmResponse, NotifyError>(NotifyError::Timeout)
        };
        let resp = wait.or(expiry).await?;

        if !matches(&req, &resp) {
            return Err(NotifyError::Protocol(proto_error!(
                "mismatched response for iid {iid}, cmd {:#04x}",
                resp.cmd
            )));
        }
        if resp.cc != CCode::SUCCESS as u8 {
            return Err(NotifyError::Peer(resp.cc));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn response_matching() {
        let mut req = PldmRequest::new(
            PLDM_TYPE_OEM,
            Cmd::NewFileAvailable as u8,
            vec![],
        );
        req.iid = 5;
        let mut resp = req.response(0);
        assert!(matches(&req, &resp));
        resp.iid = 6;
        assert!(!matches(&req, &resp));
        resp.iid = 5;
        resp.cmd = Cmd::FileAck as u8;
        assert!(!matches(&req, &resp));
    }

    #[test]
    fn frames_route_to_their_waiter() {
        let waiters: Waiters = RefCell::new(HashMap::new());
        let (tx5, rx5) = bounded(1);
        let (tx9, rx9) = bounded(1);
        waiters.borrow_mut().insert(5, tx5);
        waiters.borrow_mut().insert(9, tx9);

        // Response for iid 9 arrives while iid 5 is also in flight.
        let frame = [0x09, 0x3f, Cmd::NewFileAvailable as u8, 0x00];
        route_frame(&waiters, &frame);

        let resp = rx9.try_recv().unwrap();
        assert_eq!(resp.iid, 9);
        assert!(rx5.try_recv().is_err());
        // Only the addressed waiter was consumed.
        assert!(waiters.borrow().contains_key(&5));
        assert!(!waiters.borrow().contains_key(&9));
    }

    #[test]
    fn unclaimed_frames_are_dropped() {
        let waiters: Waiters = RefCell::new(HashMap::new());
        let frame = [0x03, 0x3f, Cmd::FileAck as u8, 0x00];
        route_frame(&waiters, &frame);
        assert!(waiters.borrow().is_empty());

        // Runts never reach a waiter either.
        let (tx, rx) = bounded(1);
        waiters.borrow_mut().insert(1, tx);
        route_frame(&waiters, &[0x81, 0x3f]);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn stale_waiter_send_is_ignored() {
        let waiters: Waiters = RefCell::new(HashMap::new());
        let (tx, rx) = bounded(1);
        waiters.borrow_mut().insert(2, tx);
        // The caller timed out and dropped its receiver.
        drop(rx);
        let frame = [0x02, 0x3f, Cmd::FileAck as u8, 0x00];
        route_frame(&waiters, &frame);
        assert!(waiters.borrow().is_empty());
    }

    #[test]
    fn error_text_names_cause() {
        let e = NotifyError::Peer(0x20);
        assert!(e.to_string().contains("0x20"));
        assert!(NotifyError::Timeout.to_string().contains("timed out"));
    }
}
