// SPDX-License-Identifier: Apache-2.0

//! Host command dispatch.
//!
//! One routine per file-I/O command. Memory commands validate, set up a
//! [`TransferSession`] and answer asynchronously from the session; the
//! rest answer synchronously. Decode and validation failures never
//! construct a session.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::os::fd::OwnedFd;
use std::path::{Path, PathBuf};
use std::rc::Rc;

use deku::{DekuContainerRead, DekuContainerWrite};
use log::{debug, error, info, warn};
use num_traits::FromPrimitive;

use pldm_fileio::filetable::FileTable;
use pldm_fileio::proto::{
    table_op, xfer_flag, Cmd, FileAckReq, FileAckWithMetaReq,
    GetAlertStatusReq, GetAlertStatusResp, GetFileTableReq, GetFileTableResp,
    NewFileReq, NewFileWithMetaReq, RwFileByTypeMemoryReq, RwFileByTypeReq,
    RwFileMemoryReq, RwFileReq, TransferResp, FILE_ATTRIBUTE_TABLE,
    PRI_CEC_NODE, RACK_ENTRY,
};
use pldm_fileio::{oem_ccode, CCode, PldmRequest, PldmResponse};
use xdma::{Direction, XdmaDevice, MIN_CHUNK};

use crate::reactor::{Reactor, Watchdog};
use crate::session::{TransferSession, DEADLINE_RECHECK, SESSION_DEADLINE};
use crate::transport::{RespKey, ResponseSink};
use crate::typed::{FileKind, TypedFiles};

/// Host addresses must sit on a word boundary; the engine operates on
/// whole words.
const ADDR_ALIGN: u64 = 4;

/// Dispatcher settings.
#[derive(Debug, Clone)]
pub struct HandlerConfig {
    /// DMA device node.
    pub device: PathBuf,
    /// Root for by-type staging files.
    pub staging: PathBuf,
    /// Disable the per-session watchdog.
    pub no_timeout: bool,
}

/// The file-I/O command dispatcher.
pub struct FileIoHandler {
    table: FileTable,
    typed: TypedFiles,
    device: PathBuf,
    no_timeout: bool,
    reactor: Rc<Reactor>,
    sink: Rc<dyn ResponseSink>,
}

impl FileIoHandler {
    /// Builds the dispatcher.
    pub fn new(
        table: FileTable,
        config: HandlerConfig,
        reactor: Rc<Reactor>,
        sink: Rc<dyn ResponseSink>,
    ) -> Self {
        Self {
            table,
            typed: TypedFiles::new(config.staging),
            device: config.device,
            no_timeout: config.no_timeout,
            reactor,
            sink,
        }
    }

    /// Routes one request. `Some` is a synchronous response to send now;
    /// `None` means a session was spawned and will respond on its own.
    pub fn dispatch(
        &self,
        req: &PldmRequest,
        key: RespKey,
    ) -> Option<PldmResponse> {
        let Some(cmd) = Cmd::from_u8(req.cmd) else {
            debug!("unknown file-I/O command {:#04x}", req.cmd);
            return Some(req.response(CCode::ERROR_INVALID_DATA as u8));
        };
        match cmd {
            Cmd::ReadFileIntoMemory => {
                self.rw_file_memory(cmd, req, key, Direction::ToHost)
            }
            Cmd::WriteFileFromMemory => {
                self.rw_file_memory(cmd, req, key, Direction::FromHost)
            }
            Cmd::ReadFileByTypeIntoMemory => {
                self.rw_by_type_memory(cmd, req, key, Direction::ToHost)
            }
            Cmd::WriteFileByTypeFromMemory => {
                self.rw_by_type_memory(cmd, req, key, Direction::FromHost)
            }
            Cmd::ReadFile => Some(self.read_file(req)),
            Cmd::WriteFile => Some(self.write_file(req)),
            Cmd::ReadFileByType => Some(self.read_file_by_type(req)),
            Cmd::WriteFileByType => Some(self.write_file_by_type(req)),
            Cmd::GetFileTable => Some(self.get_file_table(req)),
            Cmd::GetAlertStatus => Some(self.get_alert_status(req)),
            Cmd::FileAck => Some(self.file_ack(req)),
            Cmd::FileAckWithMetaData => Some(self.file_ack_with_meta(req)),
            Cmd::NewFileAvailable => Some(self.new_file(req)),
            Cmd::NewFileAvailableWithMetaData => {
                Some(self.new_file_with_meta(req))
            }
            _ => Some(req.response(CCode::ERROR_INVALID_DATA as u8)),
        }
    }

    fn rw_file_memory(
        &self,
        cmd: Cmd,
        req: &PldmRequest,
        key: RespKey,
        direction: Direction,
    ) -> Option<PldmResponse> {
        let Ok(((rest, _), body)) =
            RwFileMemoryReq::from_bytes((&req.payload, 0))
        else {
            return Some(memory_resp(req, CCode::ERROR_INVALID_LENGTH as u8));
        };
        if !rest.is_empty() {
            return Some(memory_resp(req, CCode::ERROR_INVALID_LENGTH as u8));
        }
        let Some(entry) = self.table.lookup(body.file_handle) else {
            info!("no file table entry for handle {}", body.file_handle);
            return Some(memory_resp(req, oem_ccode::INVALID_FILE_HANDLE));
        };
        let path = entry.path.clone();
        self.start_transfer(cmd, req, key, &path, direction, false, body.offset, body.length, body.address)
    }

    fn rw_by_type_memory(
        &self,
        cmd: Cmd,
        req: &PldmRequest,
        key: RespKey,
        direction: Direction,
    ) -> Option<PldmResponse> {
        let Ok(((rest, _), body)) =
            RwFileByTypeMemoryReq::from_bytes((&req.payload, 0))
        else {
            return Some(memory_resp(req, CCode::ERROR_INVALID_LENGTH as u8));
        };
        if !rest.is_empty() {
            return Some(memory_resp(req, CCode::ERROR_INVALID_LENGTH as u8));
        }
        let Some(kind) = FileKind::from_type(body.file_type) else {
            return Some(memory_resp(req, CCode::ERROR_INVALID_DATA as u8));
        };
        if !kind.supports_dma() {
            return Some(memory_resp(
                req,
                CCode::ERROR_UNSUPPORTED_PLDM_CMD as u8,
            ));
        }
        let path = self.typed.resolve(kind, body.file_handle);
        if direction == Direction::FromHost {
            if let Err(e) = self.typed.prepare(&path) {
                warn!("staging dir for {} failed: {e}", path.display());
                return Some(memory_resp(req, CCode::ERROR as u8));
            }
        }
        self.start_transfer(cmd, req, key, &path, direction, true, body.offset, body.length, body.address)
    }

    /// Shared tail of the four memory commands: range and alignment
    /// checks, source and device setup, session spawn.
    #[allow(clippy::too_many_arguments)]
    fn start_transfer(
        &self,
        cmd: Cmd,
        req: &PldmRequest,
        key: RespKey,
        path: &Path,
        direction: Direction,
        create: bool,
        offset: u32,
        length: u32,
        address: u64,
    ) -> Option<PldmResponse> {
        if length < MIN_CHUNK {
            info!("transfer length {length} below minimum");
            return Some(memory_resp(req, CCode::ERROR_INVALID_LENGTH as u8));
        }
        if offset.checked_add(length).is_none() {
            return Some(memory_resp(req, CCode::ERROR_INVALID_DATA as u8));
        }
        if address % ADDR_ALIGN != 0 {
            info!("host address {address:#x} not word aligned");
            return Some(memory_resp(req, CCode::ERROR_INVALID_DATA as u8));
        }

        let source = match open_source(path, direction, create) {
            Ok(f) => f,
            Err(e) => {
                warn!("open of {} failed: {e}", path.display());
                return Some(memory_resp(req, CCode::ERROR as u8));
            }
        };
        if direction == Direction::ToHost {
            match source.metadata() {
                Ok(m) if u64::from(offset) + u64::from(length) <= m.len() => {}
                Ok(_) => {
                    info!(
                        "range {offset}+{length} outside {}",
                        path.display()
                    );
                    return Some(memory_resp(req, oem_ccode::DATA_OUT_OF_RANGE));
                }
                Err(e) => {
                    warn!("stat of {} failed: {e}", path.display());
                    return Some(memory_resp(req, CCode::ERROR as u8));
                }
            }
        }

        // Device and mapping failures release the source fd on return.
        let mut device = match XdmaDevice::open_at(&self.device) {
            Ok(d) => d,
            Err(e) => {
                error!("cmd {:#04x} iid {}: {e}", req.cmd, req.iid);
                return Some(memory_resp(req, CCode::ERROR as u8));
            }
        };
        if let Err(e) = device.map(length) {
            error!("cmd {:#04x} iid {}: {e}", req.cmd, req.iid);
            return Some(memory_resp(req, CCode::ERROR as u8));
        }

        let watchdog = if self.no_timeout {
            Watchdog::disabled()
        } else {
            Watchdog::arm(SESSION_DEADLINE, DEADLINE_RECHECK)
        };
        let session = TransferSession::new(
            cmd as u8,
            req.iid,
            key,
            offset,
            length,
            address,
            direction,
            device,
            OwnedFd::from(source),
            self.sink.clone(),
            watchdog,
        );
        self.reactor.spawn(session.run()).detach();
        None
    }

    fn read_file(&self, req: &PldmRequest) -> PldmResponse {
        let Ok(((rest, _), body)) = RwFileReq::from_bytes((&req.payload, 0))
        else {
            return memory_resp(req, CCode::ERROR_INVALID_LENGTH as u8);
        };
        if !rest.is_empty() || body.length == 0 {
            return memory_resp(req, CCode::ERROR_INVALID_LENGTH as u8);
        }
        let Some(entry) = self.table.lookup(body.file_handle) else {
            return memory_resp(req, oem_ccode::INVALID_FILE_HANDLE);
        };
        read_range(req, &entry.path, body.offset, body.length)
    }

    fn write_file(&self, req: &PldmRequest) -> PldmResponse {
        let Ok(((rest, _), body)) = RwFileReq::from_bytes((&req.payload, 0))
        else {
            return memory_resp(req, CCode::ERROR_INVALID_LENGTH as u8);
        };
        if body.length == 0 || rest.len() != body.length as usize {
            return memory_resp(req, CCode::ERROR_INVALID_LENGTH as u8);
        }
        let Some(entry) = self.table.lookup(body.file_handle) else {
            return memory_resp(req, oem_ccode::INVALID_FILE_HANDLE);
        };
        write_range(req, &entry.path, body.offset, rest, false)
    }

    fn read_file_by_type(&self, req: &PldmRequest) -> PldmResponse {
        let Ok(((rest, _), body)) =
            RwFileByTypeReq::from_bytes((&req.payload, 0))
        else {
            return memory_resp(req, CCode::ERROR_INVALID_LENGTH as u8);
        };
        if !rest.is_empty() || body.length == 0 {
            return memory_resp(req, CCode::ERROR_INVALID_LENGTH as u8);
        }
        let Some(kind) = FileKind::from_type(body.file_type) else {
            return memory_resp(req, CCode::ERROR_INVALID_DATA as u8);
        };
        if kind == FileKind::ProgressSrc {
            // Progress SRCs flow host-to-BMC only.
            return memory_resp(req, CCode::ERROR_UNSUPPORTED_PLDM_CMD as u8);
        }
        let path = self.typed.resolve(kind, body.file_handle);
        read_range(req, &path, body.offset, body.length)
    }

    fn write_file_by_type(&self, req: &PldmRequest) -> PldmResponse {
        let Ok(((rest, _), body)) =
            RwFileByTypeReq::from_bytes((&req.payload, 0))
        else {
            return memory_resp(req, CCode::ERROR_INVALID_LENGTH as u8);
        };
        if body.length == 0 || rest.len() != body.length as usize {
            return memory_resp(req, CCode::ERROR_INVALID_LENGTH as u8);
        }
        let Some(kind) = FileKind::from_type(body.file_type) else {
            return memory_resp(req, CCode::ERROR_INVALID_DATA as u8);
        };
        let path = self.typed.resolve(kind, body.file_handle);
        if let Err(e) = self.typed.prepare(&path) {
            warn!("staging dir for {} failed: {e}", path.display());
            return memory_resp(req, CCode::ERROR as u8);
        }
        write_range(req, &path, body.offset, rest, true)
    }

    fn get_file_table(&self, req: &PldmRequest) -> PldmResponse {
        let Ok(((rest, _), body)) =
            GetFileTableReq::from_bytes((&req.payload, 0))
        else {
            return req.response(CCode::ERROR_INVALID_LENGTH as u8);
        };
        if !rest.is_empty() {
            return req.response(CCode::ERROR_INVALID_LENGTH as u8);
        }
        if body.table_type != FILE_ATTRIBUTE_TABLE
            || body.operation != table_op::FIRST_PART
        {
            return req.response(CCode::ERROR_INVALID_DATA as u8);
        }
        if self.table.is_empty() {
            return req.response(oem_ccode::FILE_TABLE_UNAVAILABLE);
        }
        let header = GetFileTableResp {
            next_transfer_handle: 0,
            transfer_flag: xfer_flag::START_AND_END,
        };
        let mut resp = req.response(CCode::SUCCESS as u8);
        match header.to_bytes() {
            Ok(mut payload) => {
                payload.extend_from_slice(&self.table.encode());
                resp.set_payload(payload);
                resp
            }
            Err(e) => {
                error!("file table encode failed: {e}");
                req.response(CCode::ERROR as u8)
            }
        }
    }

    fn get_alert_status(&self, req: &PldmRequest) -> PldmResponse {
        let Ok(((rest, _), body)) =
            GetAlertStatusReq::from_bytes((&req.payload, 0))
        else {
            return req.response(CCode::ERROR_INVALID_LENGTH as u8);
        };
        if !rest.is_empty() {
            return req.response(CCode::ERROR_INVALID_LENGTH as u8);
        }
        if body.version != 0 {
            return req.response(CCode::ERROR_INVALID_DATA as u8);
        }
        let status = GetAlertStatusResp {
            rack_entry: RACK_ENTRY,
            pri_cec_node: PRI_CEC_NODE,
        };
        let mut resp = req.response(CCode::SUCCESS as u8);
        match status.to_bytes() {
            Ok(payload) => {
                resp.set_payload(payload);
                resp
            }
            Err(e) => {
                error!("alert status encode failed: {e}");
                req.response(CCode::ERROR as u8)
            }
        }
    }

    fn file_ack(&self, req: &PldmRequest) -> PldmResponse {
        let Ok(((rest, _), body)) = FileAckReq::from_bytes((&req.payload, 0))
        else {
            return req.response(CCode::ERROR_INVALID_LENGTH as u8);
        };
        if !rest.is_empty() {
            return req.response(CCode::ERROR_INVALID_LENGTH as u8);
        }
        let Some(kind) = FileKind::from_type(body.file_type) else {
            return req.response(CCode::ERROR_INVALID_DATA as u8);
        };
        req.response(self.typed.file_ack(kind, body.file_handle, body.status))
    }

    fn file_ack_with_meta(&self, req: &PldmRequest) -> PldmResponse {
        let Ok(((rest, _), body)) =
            FileAckWithMetaReq::from_bytes((&req.payload, 0))
        else {
            return req.response(CCode::ERROR_INVALID_LENGTH as u8);
        };
        if !rest.is_empty() {
            return req.response(CCode::ERROR_INVALID_LENGTH as u8);
        }
        let Some(kind) = FileKind::from_type(body.file_type) else {
            return req.response(CCode::ERROR_INVALID_DATA as u8);
        };
        req.response(self.typed.file_ack_with_meta(
            kind,
            body.file_handle,
            body.status,
            body.meta,
        ))
    }

    fn new_file(&self, req: &PldmRequest) -> PldmResponse {
        let Ok(((rest, _), body)) = NewFileReq::from_bytes((&req.payload, 0))
        else {
            return req.response(CCode::ERROR_INVALID_LENGTH as u8);
        };
        if !rest.is_empty() {
            return req.response(CCode::ERROR_INVALID_LENGTH as u8);
        }
        let Some(kind) = FileKind::from_type(body.file_type) else {
            return req.response(CCode::ERROR_INVALID_DATA as u8);
        };
        req.response(self.typed.new_file_available(
            kind,
            body.file_handle,
            body.length,
        ))
    }

    fn new_file_with_meta(&self, req: &PldmRequest) -> PldmResponse {
        let Ok(((rest, _), body)) =
            NewFileWithMetaReq::from_bytes((&req.payload, 0))
        else {
            return req.response(CCode::ERROR_INVALID_LENGTH as u8);
        };
        if !rest.is_empty() {
            return req.response(CCode::ERROR_INVALID_LENGTH as u8);
        }
        let Some(kind) = FileKind::from_type(body.file_type) else {
            return req.response(CCode::ERROR_INVALID_DATA as u8);
        };
        req.response(self.typed.new_file_available_with_meta(
            kind,
            body.file_handle,
            body.length,
            body.meta,
        ))
    }
}

/// Builds a memory-command response: completion code plus a zero
/// transferred-length field.
fn memory_resp(req: &PldmRequest, cc: u8) -> PldmResponse {
    let mut resp = req.response(cc);
    match (TransferResp { length: 0 }).to_bytes() {
        Ok(p) => resp.set_payload(p),
        Err(e) => error!("response encode failed: {e}"),
    }
    resp
}

fn open_source(
    path: &Path,
    direction: Direction,
    create: bool,
) -> std::io::Result<File> {
    match direction {
        Direction::ToHost => File::open(path),
        Direction::FromHost => OpenOptions::new()
            .write(true)
            .create(create)
            .open(path),
    }
}

fn read_range(
    req: &PldmRequest,
    path: &Path,
    offset: u32,
    length: u32,
) -> PldmResponse {
    let mut file = match File::open(path) {
        Ok(f) => f,
        Err(e) => {
            warn!("open of {} failed: {e}", path.display());
            return memory_resp(req, CCode::ERROR as u8);
        }
    };
    let size = match file.metadata() {
        Ok(m) => m.len(),
        Err(e) => {
            warn!("stat of {} failed: {e}", path.display());
            return memory_resp(req, CCode::ERROR as u8);
        }
    };
    if u64::from(offset) >= size {
        return memory_resp(req, oem_ccode::DATA_OUT_OF_RANGE);
    }
    // Reads past the end are clipped to what the file holds.
    let length = u64::from(length).min(size - u64::from(offset)) as u32;
    let mut data = vec![0u8; length as usize];
    let read = file
        .seek(SeekFrom::Start(offset.into()))
        .and_then(|_| file.read_exact(&mut data));
    if let Err(e) = read {
        warn!("read of {} failed: {e}", path.display());
        return memory_resp(req, CCode::ERROR as u8);
    }
    let mut resp = req.response(CCode::SUCCESS as u8);
    match (TransferResp { length }).to_bytes() {
        Ok(mut payload) => {
            payload.extend_from_slice(&data);
            resp.set_payload(payload);
            resp
        }
        Err(e) => {
            error!("response encode failed: {e}");
            req.response(CCode::ERROR as u8)
        }
    }
}

fn write_range(
    req: &PldmRequest,
    path: &Path,
    offset: u32,
    data: &[u8],
    create: bool,
) -> PldmResponse {
    let mut file = match OpenOptions::new()
        .write(true)
        .create(create)
        .open(path)
    {
        Ok(f) => f,
        Err(e) => {
            warn!("open of {} failed: {e}", path.display());
            return memory_resp(req, CCode::ERROR as u8);
        }
    };
    let size = file.metadata().map(|m| m.len()).unwrap_or(0);
    if u64::from(offset) > size {
        return memory_resp(req, oem_ccode::DATA_OUT_OF_RANGE);
    }
    let written = file
        .seek(SeekFrom::Start(offset.into()))
        .and_then(|_| file.write_all(data));
    if let Err(e) = written {
        warn!("write of {} failed: {e}", path.display());
        return memory_resp(req, CCode::ERROR as u8);
    }
    let mut resp = req.response(CCode::SUCCESS as u8);
    match (TransferResp {
        length: data.len() as u32,
    })
    .to_bytes()
    {
        Ok(payload) => {
            resp.set_payload(payload);
            resp
        }
        Err(e) => {
            error!("response encode failed: {e}");
            req.response(CCode::ERROR as u8)
        }
    }
}
