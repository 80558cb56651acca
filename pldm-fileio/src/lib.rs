// SPDX-License-Identifier: Apache-2.0
/*
 * PLDM OEM file-I/O message definitions.
 */

#![warn(missing_docs)]

//! PLDM OEM file-transfer protocol support.
//!
//! This crate carries the message-level pieces of the BMC file-I/O agent:
//! base PLDM request/response framing, the OEM file-I/O command codecs
//! ([`proto`]) and the file table ([`filetable`]). Transport and the
//! transfer engine live elsewhere.

use core::fmt;

pub mod filetable;
pub mod proto;

/// PLDM message type carrying the OEM file-I/O commands.
pub const PLDM_TYPE_OEM: u8 = 0x3f;

/// Terminus id of the host hypervisor endpoint.
pub const HYPERVISOR_TID: u8 = 208;

/// Heartbeat allowance, in seconds, granted on top of the host surveillance
/// period.
pub const HEARTBEAT_DELTA_SECS: u64 = 10;

/// Generic protocol error type.
#[derive(Debug)]
pub enum PldmError {
    /// Malformed or unexpected message framing.
    Protocol(String),
    /// Payload encode/decode failure.
    Codec(deku::DekuError),
    /// All 32 requester instance ids are in flight.
    InstanceIdExhausted,
}

impl fmt::Display for PldmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Protocol(s) => write!(f, "PLDM protocol error: {s}"),
            Self::Codec(e) => write!(f, "PLDM codec error: {e}"),
            Self::InstanceIdExhausted => {
                write!(f, "no free PLDM instance id")
            }
        }
    }
}

impl std::error::Error for PldmError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Codec(e) => Some(e),
            _ => None,
        }
    }
}

impl From<deku::DekuError> for PldmError {
    fn from(e: deku::DekuError) -> Self {
        Self::Codec(e)
    }
}

/// Create a [`PldmError::Protocol`] with format-style arguments.
#[macro_export]
macro_rules! proto_error {
    ($($arg:tt)*) => {
        $crate::PldmError::Protocol(format!($($arg)*))
    };
}

/// Protocol return type.
pub type Result<T> = core::result::Result<T, PldmError>;

/// PLDM completion codes used by the file-I/O command set.
#[allow(missing_docs)]
#[allow(non_camel_case_types)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CCode {
    SUCCESS = 0x00,
    ERROR = 0x01,
    ERROR_UNSUPPORTED_PLDM_CMD = 0x05,
    ERROR_INVALID_DATA = 0x13,
    ERROR_INVALID_LENGTH = 0x14,
}

/// File-I/O specific completion codes.
#[allow(missing_docs)]
pub mod oem_ccode {
    pub const FILE_TABLE_UNAVAILABLE: u8 = 0x83;
    pub const INVALID_FILE_HANDLE: u8 = 0x86;
    pub const DATA_OUT_OF_RANGE: u8 = 0x87;
}

const RQ_BIT: u8 = 0x80;
const IID_MASK: u8 = 0x1f;
const TYPE_MASK: u8 = 0x3f;

/// A decoded PLDM request: 3-byte header plus command payload.
#[derive(Debug, Clone)]
pub struct PldmRequest {
    /// Instance id assigned by the requester, 0-31.
    pub iid: u8,
    /// PLDM message type.
    pub typ: u8,
    /// Command code.
    pub cmd: u8,
    /// Command payload, header excluded.
    pub payload: Vec<u8>,
}

impl PldmRequest {
    /// Creates an outbound request. The instance id is assigned at send
    /// time.
    pub fn new(typ: u8, cmd: u8, payload: Vec<u8>) -> Self {
        Self {
            iid: 0,
            typ,
            cmd,
            payload,
        }
    }

    /// Parses a received message, requiring the request bit.
    pub fn from_buf(data: &[u8]) -> Result<Self> {
        if data.len() < 3 {
            return Err(proto_error!("short request, {} bytes", data.len()));
        }
        if data[0] & RQ_BIT == 0 {
            return Err(proto_error!("response where a request was expected"));
        }
        Ok(Self {
            iid: data[0] & IID_MASK,
            typ: data[1] & TYPE_MASK,
            cmd: data[2],
            payload: data[3..].to_vec(),
        })
    }

    /// Encodes the request for transmission.
    pub fn to_vec(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(3 + self.payload.len());
        out.push(RQ_BIT | (self.iid & IID_MASK));
        out.push(self.typ & TYPE_MASK);
        out.push(self.cmd);
        out.extend_from_slice(&self.payload);
        out
    }

    /// Builds the matching response skeleton: same iid/type/command,
    /// given completion code, empty payload.
    pub fn response(&self, cc: u8) -> PldmResponse {
        PldmResponse {
            iid: self.iid,
            typ: self.typ,
            cmd: self.cmd,
            cc,
            payload: Vec::new(),
        }
    }
}

/// A PLDM response: 3-byte header, completion code, payload.
#[derive(Debug, Clone)]
pub struct PldmResponse {
    /// Instance id copied from the request.
    pub iid: u8,
    /// PLDM message type.
    pub typ: u8,
    /// Command code copied from the request.
    pub cmd: u8,
    /// Completion code.
    pub cc: u8,
    /// Response payload, header and completion code excluded.
    pub payload: Vec<u8>,
}

impl PldmResponse {
    /// Parses a received message, rejecting the request bit.
    pub fn from_buf(data: &[u8]) -> Result<Self> {
        if data.len() < 4 {
            return Err(proto_error!("short response, {} bytes", data.len()));
        }
        if data[0] & RQ_BIT != 0 {
            return Err(proto_error!("request where a response was expected"));
        }
        Ok(Self {
            iid: data[0] & IID_MASK,
            typ: data[1] & TYPE_MASK,
            cmd: data[2],
            cc: data[3],
            payload: data[4..].to_vec(),
        })
    }

    /// Encodes the response for transmission.
    pub fn to_vec(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(4 + self.payload.len());
        out.push(self.iid & IID_MASK);
        out.push(self.typ & TYPE_MASK);
        out.push(self.cmd);
        out.push(self.cc);
        out.extend_from_slice(&self.payload);
        out
    }

    /// Replaces the payload.
    pub fn set_payload(&mut self, payload: Vec<u8>) {
        self.payload = payload;
    }
}

/// Requester instance-id allocator, ids 0-31.
///
/// Passed explicitly to whoever issues requests; there is no process-wide
/// instance.
#[derive(Debug, Default)]
pub struct InstanceIdDb {
    used: u32,
}

impl InstanceIdDb {
    /// Creates an empty allocator.
    pub fn new() -> Self {
        Self::default()
    }

    /// Claims the lowest free instance id.
    pub fn alloc(&mut self) -> Result<u8> {
        let free = (!self.used).trailing_zeros();
        if free >= 32 {
            return Err(PldmError::InstanceIdExhausted);
        }
        self.used |= 1 << free;
        Ok(free as u8)
    }

    /// Releases a previously claimed id. Releasing a free id is a no-op.
    pub fn free(&mut self, iid: u8) {
        if iid < 32 {
            self.used &= !(1 << iid);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_roundtrip() {
        let req = PldmRequest::new(PLDM_TYPE_OEM, 0x06, vec![1, 2, 3]);
        let buf = req.to_vec();
        assert_eq!(buf[0], 0x80);
        assert_eq!(buf[1], 0x3f);
        assert_eq!(buf[2], 0x06);
        let back = PldmRequest::from_buf(&buf).unwrap();
        assert_eq!(back.iid, 0);
        assert_eq!(back.payload, vec![1, 2, 3]);
    }

    #[test]
    fn request_requires_rq_bit() {
        assert!(PldmRequest::from_buf(&[0x07, 0x3f, 0x06]).is_err());
        assert!(PldmRequest::from_buf(&[0x87, 0x3f]).is_err());
    }

    #[test]
    fn response_header() {
        let mut req = PldmRequest::new(PLDM_TYPE_OEM, 0x0d, vec![]);
        req.iid = 9;
        let mut resp = req.response(CCode::SUCCESS as u8);
        resp.set_payload(vec![0xaa]);
        let buf = resp.to_vec();
        assert_eq!(buf, vec![0x09, 0x3f, 0x0d, 0x00, 0xaa]);
        let back = PldmResponse::from_buf(&buf).unwrap();
        assert_eq!(back.cc, 0);
        assert_eq!(back.iid, 9);
    }

    #[test]
    fn response_rejects_rq_bit() {
        assert!(PldmResponse::from_buf(&[0x89, 0x3f, 0x0d, 0x00]).is_err());
    }

    #[test]
    fn instance_ids_exhaust_and_recycle() {
        let mut db = InstanceIdDb::new();
        for expect in 0..32 {
            assert_eq!(db.alloc().unwrap(), expect);
        }
        assert!(matches!(db.alloc(), Err(PldmError::InstanceIdExhausted)));
        db.free(13);
        assert_eq!(db.alloc().unwrap(), 13);
    }
}
