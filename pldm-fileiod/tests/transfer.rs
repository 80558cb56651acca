// SPDX-License-Identifier: Apache-2.0
/*
 * Driver-level transfer checks against a scratch device node.
 */

use std::cell::RefCell;
use std::fs::File;
use std::path::PathBuf;
use std::rc::Rc;
use std::time::{Duration, Instant};

use deku::DekuContainerWrite;
use pldm_fileio::filetable::FileTable;
use pldm_fileio::proto::{Cmd, RwFileMemoryReq};
use pldm_fileio::{PldmRequest, PldmResponse, PLDM_TYPE_OEM};
use pldm_fileiod::handler::{FileIoHandler, HandlerConfig};
use pldm_fileiod::reactor::Reactor;
use pldm_fileiod::transport::{MctpAddr, RespKey, ResponseSink};
use xdma::MAX_CHUNK;

struct Recorder(RefCell<Vec<PldmResponse>>);

impl ResponseSink for Recorder {
    fn send_response(
        &self,
        _key: &RespKey,
        resp: &PldmResponse,
    ) -> std::io::Result<()> {
        self.0.borrow_mut().push(resp.clone());
        Ok(())
    }
}

struct Rig {
    _dir: tempfile::TempDir,
    backing: PathBuf,
    reactor: Rc<Reactor>,
    sink: Rc<Recorder>,
    handler: FileIoHandler,
}

fn rig(backing_len: u64, device_len: u64) -> Rig {
    let dir = tempfile::tempdir().unwrap();
    let backing = dir.path().join("host.bin");
    let f = File::create(&backing).unwrap();
    f.set_len(backing_len).unwrap();

    let device = dir.path().join("xdma");
    let d = File::create(&device).unwrap();
    d.set_len(device_len).unwrap();

    let table = FileTable::from_listing([(backing.clone(), 0)]);
    let reactor = Rc::new(Reactor::new());
    let sink = Rc::new(Recorder(RefCell::new(Vec::new())));
    let handler = FileIoHandler::new(
        table,
        HandlerConfig {
            device,
            staging: dir.path().join("staging"),
            no_timeout: false,
        },
        reactor.clone(),
        sink.clone(),
    );
    Rig {
        _dir: dir,
        backing,
        reactor,
        sink,
        handler,
    }
}

fn key() -> RespKey {
    RespKey {
        addr: MctpAddr { net: 1, eid: 9 },
        tag: 2,
    }
}

fn memory_request(cmd: Cmd, iid: u8, body: RwFileMemoryReq) -> PldmRequest {
    PldmRequest {
        iid,
        typ: PLDM_TYPE_OEM,
        cmd: cmd as u8,
        payload: body.to_bytes().unwrap(),
    }
}

fn wait_for_response(rig: &Rig) -> PldmResponse {
    let deadline = Instant::now() + Duration::from_secs(30);
    rig.reactor.block_on(async {
        while rig.sink.0.borrow().is_empty() {
            assert!(Instant::now() < deadline, "session never responded");
            smol::Timer::after(Duration::from_millis(2)).await;
        }
    });
    rig.sink.0.borrow_mut().remove(0)
}

#[test]
fn oversize_write_splits_into_two_chunks() {
    let length = MAX_CHUNK + 512;
    // Sparse scratch files; the device must cover the bounce mapping.
    let r = rig(64, u64::from(MAX_CHUNK) + 2 * 65536);

    let req = memory_request(Cmd::WriteFileFromMemory, 11, RwFileMemoryReq {
        file_handle: 0,
        offset: 0,
        length,
        address: 0x2000_0000,
    });
    assert!(r.handler.dispatch(&req, key()).is_none());

    let resp = wait_for_response(&r);
    assert_eq!(resp.iid, 11);
    assert_eq!(resp.cc, 0x00);
    assert_eq!(resp.payload, length.to_le_bytes());

    // Both chunks landed: the backing file now spans the whole range.
    let meta = std::fs::metadata(&r.backing).unwrap();
    assert_eq!(meta.len(), u64::from(length));
}

#[test]
fn sessions_do_not_leak_descriptors() {
    let r = rig(4096, 65536);
    let open_fds =
        || std::fs::read_dir("/proc/self/fd").unwrap().count();

    // Prime the reactor so its own descriptors are in the baseline.
    let req = memory_request(Cmd::ReadFileIntoMemory, 0, RwFileMemoryReq {
        file_handle: 0,
        offset: 0,
        length: 16,
        address: 0,
    });
    assert!(r.handler.dispatch(&req, key()).is_none());
    wait_for_response(&r);

    let baseline = open_fds();
    for iid in 0..20 {
        let req =
            memory_request(Cmd::ReadFileIntoMemory, iid, RwFileMemoryReq {
                file_handle: 0,
                offset: 64,
                length: 256,
                address: 0x1000,
            });
        assert!(r.handler.dispatch(&req, key()).is_none());
        let resp = wait_for_response(&r);
        assert_eq!(resp.cc, 0x00);
    }
    assert_eq!(open_fds(), baseline);
}
