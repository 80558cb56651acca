// SPDX-License-Identifier: Apache-2.0

//! Wire definitions for the OEM file-I/O command set.
//!
//! Requests and responses are little-endian packed structs; the 3-byte
//! message header and the response completion code are framed by
//! [`PldmRequest`](crate::PldmRequest) / [`PldmResponse`](crate::PldmResponse)
//! and are not part of these layouts.

use deku::prelude::*;
use num_derive::FromPrimitive;

/// File-I/O commands.
#[allow(missing_docs)]
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive)]
#[repr(u8)]
pub enum Cmd {
    GetFileTable = 0x01,
    ReadFile = 0x04,
    WriteFile = 0x05,
    ReadFileIntoMemory = 0x06,
    WriteFileFromMemory = 0x07,
    ReadFileByTypeIntoMemory = 0x08,
    WriteFileByTypeFromMemory = 0x09,
    NewFileAvailable = 0x0a,
    ReadFileByType = 0x0b,
    WriteFileByType = 0x0c,
    FileAck = 0x0d,
    GetAlertStatus = 0x0f,
    NewFileAvailableWithMetaData = 0x10,
    FileAckWithMetaData = 0x11,
}

/// File type values carried by the by-type and notification commands.
#[allow(missing_docs)]
pub mod file_type {
    pub const PEL: u16 = 0x00;
    pub const LID_PERM: u16 = 0x01;
    pub const LID_TEMP: u16 = 0x02;
    pub const DUMP: u16 = 0x03;
    pub const CERT_SIGNING_REQUEST: u16 = 0x04;
    pub const SIGNED_CERT: u16 = 0x05;
    pub const ROOT_CERT: u16 = 0x06;
    pub const RESOURCE_DUMP_PARMS: u16 = 0x08;
    pub const RESOURCE_DUMP: u16 = 0x09;
    pub const PROGRESS_SRC: u16 = 0x0a;
    pub const COD_LICENSE: u16 = 0x0d;
}

/// GetFileTable operation flags.
#[allow(missing_docs)]
pub mod table_op {
    pub const NEXT_PART: u8 = 0;
    pub const FIRST_PART: u8 = 1;
}

/// Multipart transfer flags.
#[allow(missing_docs)]
pub mod xfer_flag {
    pub const START: u8 = 0x01;
    pub const MIDDLE: u8 = 0x02;
    pub const END: u8 = 0x04;
    pub const START_AND_END: u8 = 0x05;
}

/// The only table type served: the file attribute table.
pub const FILE_ATTRIBUTE_TABLE: u8 = 0;

/// Fixed GetAlertStatus rack entry value.
pub const RACK_ENTRY: u32 = 0xff10_0030;

/// Fixed GetAlertStatus primary CEC node value.
pub const PRI_CEC_NODE: u32 = 0x0000_8030;

/// ReadFileIntoMemory / WriteFileFromMemory request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, DekuRead, DekuWrite)]
#[deku(endian = "little")]
pub struct RwFileMemoryReq {
    /// File table handle.
    pub file_handle: u32,
    /// Byte offset into the file.
    pub offset: u32,
    /// Transfer length in bytes.
    pub length: u32,
    /// Host memory address.
    pub address: u64,
}

/// ReadFileByTypeIntoMemory / WriteFileByTypeFromMemory request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, DekuRead, DekuWrite)]
#[deku(endian = "little")]
pub struct RwFileByTypeMemoryReq {
    /// File type from [`file_type`].
    pub file_type: u16,
    /// Type-scoped file handle.
    pub file_handle: u32,
    /// Byte offset into the file.
    pub offset: u32,
    /// Transfer length in bytes.
    pub length: u32,
    /// Host memory address.
    pub address: u64,
}

/// Transferred-length response body shared by the memory and plain
/// read/write commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, DekuRead, DekuWrite)]
#[deku(endian = "little")]
pub struct TransferResp {
    /// Bytes transferred; 0 on failure.
    pub length: u32,
}

/// ReadFile / WriteFile request header; WriteFile carries the data after
/// this header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, DekuRead, DekuWrite)]
#[deku(endian = "little")]
pub struct RwFileReq {
    /// File table handle.
    pub file_handle: u32,
    /// Byte offset into the file.
    pub offset: u32,
    /// Length in bytes.
    pub length: u32,
}

/// ReadFileByType / WriteFileByType request header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, DekuRead, DekuWrite)]
#[deku(endian = "little")]
pub struct RwFileByTypeReq {
    /// File type from [`file_type`].
    pub file_type: u16,
    /// Type-scoped file handle.
    pub file_handle: u32,
    /// Byte offset into the file.
    pub offset: u32,
    /// Length in bytes.
    pub length: u32,
}

/// FileAck request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, DekuRead, DekuWrite)]
#[deku(endian = "little")]
pub struct FileAckReq {
    /// File type from [`file_type`].
    pub file_type: u16,
    /// Type-scoped file handle.
    pub file_handle: u32,
    /// Host-side disposition of the file.
    pub status: u8,
}

/// FileAckWithMetaData request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, DekuRead, DekuWrite)]
#[deku(endian = "little")]
pub struct FileAckWithMetaReq {
    /// File type from [`file_type`].
    pub file_type: u16,
    /// Type-scoped file handle.
    pub file_handle: u32,
    /// Host-side disposition of the file.
    pub status: u8,
    /// Type-specific metadata words.
    pub meta: [u32; 4],
}

/// NewFileAvailable request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, DekuRead, DekuWrite)]
#[deku(endian = "little")]
pub struct NewFileReq {
    /// File type from [`file_type`].
    pub file_type: u16,
    /// Type-scoped file handle.
    pub file_handle: u32,
    /// File length in bytes.
    pub length: u64,
}

/// NewFileAvailableWithMetaData request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, DekuRead, DekuWrite)]
#[deku(endian = "little")]
pub struct NewFileWithMetaReq {
    /// File type from [`file_type`].
    pub file_type: u16,
    /// Type-scoped file handle.
    pub file_handle: u32,
    /// File length in bytes.
    pub length: u64,
    /// Type-specific metadata words.
    pub meta: [u32; 4],
}

/// GetFileTable request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, DekuRead, DekuWrite)]
#[deku(endian = "little")]
pub struct GetFileTableReq {
    /// Multipart continuation handle; 0 for the first request.
    pub transfer_handle: u32,
    /// One of [`table_op`].
    pub operation: u8,
    /// Table selector; only [`FILE_ATTRIBUTE_TABLE`].
    pub table_type: u8,
}

/// GetFileTable response header; the table bytes follow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, DekuRead, DekuWrite)]
#[deku(endian = "little")]
pub struct GetFileTableResp {
    /// Continuation handle for the next part; 0 when complete.
    pub next_transfer_handle: u32,
    /// One of [`xfer_flag`].
    pub transfer_flag: u8,
}

/// GetAlertStatus request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, DekuRead, DekuWrite)]
#[deku(endian = "little")]
pub struct GetAlertStatusReq {
    /// Command version; only 0 is defined.
    pub version: u8,
}

/// GetAlertStatus response body.
#[derive(Debug, Clone, Copy, PartialEq, Eq, DekuRead, DekuWrite)]
#[deku(endian = "little")]
pub struct GetAlertStatusResp {
    /// Rack entry identifier.
    pub rack_entry: u32,
    /// Primary CEC node identifier.
    pub pri_cec_node: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rw_memory_req_layout() {
        let payload: &[u8] = &[
            0x01, 0x00, 0x00, 0x00, // handle
            0x00, 0x00, 0x00, 0x00, // offset
            0x10, 0x00, 0x00, 0x00, // length
            0x00, 0x00, 0x00, 0x80, 0x00, 0x00, 0x00, 0x00, // address
        ];
        let ((rest, _), req) =
            RwFileMemoryReq::from_bytes((payload, 0)).unwrap();
        assert!(rest.is_empty());
        assert_eq!(
            req,
            RwFileMemoryReq {
                file_handle: 1,
                offset: 0,
                length: 16,
                address: 0x8000_0000,
            }
        );
        assert_eq!(req.to_bytes().unwrap(), payload);
    }

    #[test]
    fn transfer_resp_layout() {
        let resp = TransferResp { length: 16 };
        assert_eq!(resp.to_bytes().unwrap(), vec![0x10, 0x00, 0x00, 0x00]);
    }

    #[test]
    fn file_ack_req_layout() {
        let payload: &[u8] = &[0x01, 0x00, 0x2a, 0x00, 0x00, 0x00, 0x00];
        let ((rest, _), req) = FileAckReq::from_bytes((payload, 0)).unwrap();
        assert!(rest.is_empty());
        assert_eq!(req.file_type, 0x01);
        assert_eq!(req.file_handle, 42);
        assert_eq!(req.status, 0);
    }

    #[test]
    fn new_file_with_meta_size() {
        let req = NewFileWithMetaReq {
            file_type: file_type::RESOURCE_DUMP_PARMS,
            file_handle: 7,
            length: 1 << 32,
            meta: [1, 2, 3, 4],
        };
        let bytes = req.to_bytes().unwrap();
        assert_eq!(bytes.len(), 30);
        let ((rest, _), back) =
            NewFileWithMetaReq::from_bytes((&bytes, 0)).unwrap();
        assert!(rest.is_empty());
        assert_eq!(back, req);
    }

    #[test]
    fn alert_status_resp_layout() {
        let resp = GetAlertStatusResp {
            rack_entry: RACK_ENTRY,
            pri_cec_node: PRI_CEC_NODE,
        };
        assert_eq!(
            resp.to_bytes().unwrap(),
            vec![0x30, 0x00, 0x10, 0xff, 0x30, 0x80, 0x00, 0x00]
        );
    }

    #[test]
    fn file_table_req_trailing_bytes_surface() {
        let payload: &[u8] = &[0, 0, 0, 0, 1, 0, 0xee];
        let ((rest, _), req) =
            GetFileTableReq::from_bytes((payload, 0)).unwrap();
        assert_eq!(req.operation, table_op::FIRST_PART);
        assert_eq!(req.table_type, FILE_ATTRIBUTE_TABLE);
        assert_eq!(rest, &[0xee]);
    }
}
