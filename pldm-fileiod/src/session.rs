// SPDX-License-Identifier: Apache-2.0

//! The DMA transfer session.
//!
//! One session services one memory command: it owns the XDMA handle, the
//! bounce buffer and the source file, splits the requested range into
//! chunks of at most [`MAX_CHUNK`] bytes and submits one chunk per device
//! readiness wakeup. A session reaches exactly one terminal state and
//! emits exactly one PLDM response; the watchdog, a late completion and
//! cancellation all funnel through the same response latch.
//!
//! The transition logic is a pure state machine ([`SessionMachine`]); the
//! async driver ([`TransferSession`]) performs the I/O the machine asks
//! for and owns every resource.

use std::os::fd::{AsFd, OwnedFd};
use std::rc::Rc;
use std::time::Duration;

use deku::DekuContainerWrite;
use log::{debug, error, info, warn};
use smol::future::FutureExt;
use smol::Async;

use pldm_fileio::proto::TransferResp;
use pldm_fileio::{CCode, PldmResponse, PLDM_TYPE_OEM};
use xdma::{Direction, XdmaDevice, XdmaError, MAX_CHUNK};

use crate::reactor::Watchdog;
use crate::transport::{RespKey, ResponseSink};

/// Whole-session deadline.
pub const SESSION_DEADLINE: Duration = Duration::from_secs(20);

/// Watchdog re-trigger interval, the resolution at which a set response
/// latch is noticed after a late completion.
pub const DEADLINE_RECHECK: Duration = Duration::from_secs(1);

/// Session lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Constructed, not yet driven.
    Init,
    /// Registered for readiness, no chunk submitted yet.
    Armed,
    /// One chunk submitted, awaiting completion readiness.
    ChunkInFlight,
    /// Terminal: all chunks transferred.
    Completed,
    /// Terminal: a chunk or the device failed.
    Failed,
    /// Terminal: the watchdog fired or the session was cancelled.
    TimedOut,
}

impl SessionState {
    fn terminal(self) -> bool {
        matches!(
            self,
            SessionState::Completed
                | SessionState::Failed
                | SessionState::TimedOut
        )
    }
}

/// One DMA operation of the plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Chunk {
    /// File offset.
    pub offset: u32,
    /// Chunk length; `MAX_CHUNK` except possibly for the tail.
    pub length: u32,
    /// Host address.
    pub address: u64,
}

/// Cursor over the requested range. Chunks are issued strictly in offset
/// order; the cursor never rewinds.
#[derive(Debug, Clone, Copy)]
pub struct TransferPlan {
    remaining: u32,
    offset: u32,
    address: u64,
}

impl TransferPlan {
    /// Plans a transfer of `length` bytes from `offset`/`address`.
    pub fn new(offset: u32, length: u32, address: u64) -> Self {
        Self {
            remaining: length,
            offset,
            address,
        }
    }

    /// The next chunk to submit.
    pub fn next_chunk(&self) -> Chunk {
        Chunk {
            offset: self.offset,
            length: self.remaining.min(MAX_CHUNK),
            address: self.address,
        }
    }

    /// Bytes not yet submitted.
    pub fn remaining(&self) -> u32 {
        self.remaining
    }

    fn advance(&mut self, length: u32) {
        self.remaining -= length;
        self.offset += length;
        self.address += u64::from(length);
    }
}

/// What a terminal transition owes the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// Emit a response with this completion code and length field.
    Respond {
        /// PLDM completion code.
        cc: u8,
        /// Transferred-length field value.
        length: u32,
    },
    /// Tear down without a response (cancellation, or latch already set).
    Silent,
}

/// Driver instruction produced by a transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    /// Nothing to do; keep waiting.
    Wait,
    /// Submit this chunk to the device.
    Submit(Chunk),
    /// Terminal: release resources, then act on the verdict.
    Finish(Verdict),
}

/// Pure transition core of a session. Every event is a total function of
/// the current state; nothing in here can fail or block.
#[derive(Debug)]
pub struct SessionMachine {
    state: SessionState,
    plan: TransferPlan,
    original_length: u32,
    in_flight: Option<Chunk>,
    response_sent: bool,
}

impl SessionMachine {
    /// Builds a machine for a request range.
    pub fn new(offset: u32, length: u32, address: u64) -> Self {
        Self {
            state: SessionState::Init,
            plan: TransferPlan::new(offset, length, address),
            original_length: length,
            in_flight: None,
            response_sent: false,
        }
    }

    /// Current state.
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Plan cursor, for diagnostics.
    pub fn cursor(&self) -> (u32, u32) {
        (self.plan.offset, self.plan.remaining)
    }

    /// Init → Armed, once registrations are in place.
    pub fn arm(&mut self) {
        if self.state == SessionState::Init {
            self.state = SessionState::Armed;
        }
    }

    /// Device readiness. Produces the next chunk to submit, or drops the
    /// event when the session is already terminal.
    pub fn on_ready(&mut self) -> Step {
        match self.state {
            SessionState::Armed | SessionState::ChunkInFlight => {
                self.state = SessionState::ChunkInFlight;
                let chunk = self.plan.next_chunk();
                self.in_flight = Some(chunk);
                Step::Submit(chunk)
            }
            _ => Step::Wait,
        }
    }

    /// Outcome of the submission requested by [`on_ready`](Self::on_ready).
    pub fn on_chunk_done(&mut self, result: Result<u32, XdmaError>) -> Step {
        let Some(chunk) = self.in_flight.take() else {
            return Step::Wait;
        };
        if self.state != SessionState::ChunkInFlight {
            return Step::Wait;
        }
        match result {
            Err(_) => self.finish(SessionState::Failed, Verdict::Respond {
                cc: CCode::ERROR as u8,
                length: 0,
            }),
            Ok(count) => {
                self.plan.advance(chunk.length);
                if self.plan.remaining() > 0 {
                    return Step::Wait;
                }
                // The tail count settles the whole transfer.
                if count == chunk.length {
                    self.finish(SessionState::Completed, Verdict::Respond {
                        cc: CCode::SUCCESS as u8,
                        length: self.original_length,
                    })
                } else {
                    self.finish(SessionState::Failed, Verdict::Respond {
                        cc: CCode::ERROR as u8,
                        length: 0,
                    })
                }
            }
        }
    }

    /// Watchdog firing. Ignored once the response latch is set.
    pub fn on_tick(&mut self) -> Step {
        if self.state.terminal() {
            return Step::Wait;
        }
        self.finish(SessionState::TimedOut, Verdict::Respond {
            cc: CCode::ERROR as u8,
            length: 0,
        })
    }

    /// A readiness-layer fault with no chunk outstanding.
    pub fn on_fault(&mut self) -> Step {
        if self.state.terminal() {
            return Step::Wait;
        }
        self.finish(SessionState::Failed, Verdict::Respond {
            cc: CCode::ERROR as u8,
            length: 0,
        })
    }

    /// Reactor shutdown: terminal, never a response.
    pub fn on_cancel(&mut self) -> Step {
        if self.state.terminal() {
            return Step::Wait;
        }
        self.state = SessionState::TimedOut;
        Step::Finish(Verdict::Silent)
    }

    fn finish(&mut self, state: SessionState, verdict: Verdict) -> Step {
        self.state = state;
        if self.response_sent {
            return Step::Finish(Verdict::Silent);
        }
        self.response_sent = true;
        Step::Finish(verdict)
    }
}

enum Wake {
    Io(std::io::Result<()>),
    Tick,
}

/// The async driver for one memory command.
pub struct TransferSession {
    cmd: u8,
    iid: u8,
    key: RespKey,
    direction: Direction,
    machine: SessionMachine,
    device: XdmaDevice,
    source: OwnedFd,
    sink: Rc<dyn ResponseSink>,
    watchdog: Watchdog,
}

impl TransferSession {
    /// Adopts the device (already mapped) and the source fd. The caller
    /// relinquishes both; the session releases them at its terminal
    /// transition.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        cmd: u8,
        iid: u8,
        key: RespKey,
        offset: u32,
        length: u32,
        address: u64,
        direction: Direction,
        device: XdmaDevice,
        source: OwnedFd,
        sink: Rc<dyn ResponseSink>,
        watchdog: Watchdog,
    ) -> Self {
        Self {
            cmd,
            iid,
            key,
            direction,
            machine: SessionMachine::new(offset, length, address),
            device,
            source,
            sink,
            watchdog,
        }
    }

    /// Drives the session to its terminal state.
    pub async fn run(mut self) {
        // The readiness registration is a dup of the device fd, owned by
        // the session and dropped at the terminal transition ahead of the
        // device itself.
        let watch = match self
            .device
            .as_fd()
            .try_clone_to_owned()
            .and_then(Async::new)
        {
            Ok(w) => w,
            Err(e) => {
                error!(
                    "cmd {:#04x} iid {}: readiness registration failed: {e}",
                    self.cmd, self.iid
                );
                self.machine.arm();
                if let Step::Finish(v) = self.machine.on_fault() {
                    self.finish(v);
                }
                return;
            }
        };

        self.machine.arm();
        info!(
            "cmd {:#04x} iid {}: transfer armed, {} bytes {:?}",
            self.cmd,
            self.iid,
            self.machine.cursor().1,
            self.direction
        );

        loop {
            let wake = {
                let io = async {
                    let r = watch.readable().or(watch.writable()).await;
                    Wake::Io(r)
                };
                let tick = async {
                    self.watchdog.tick().await;
                    Wake::Tick
                };
                io.or(tick).await
            };

            let step = match wake {
                Wake::Io(Ok(())) => match self.machine.on_ready() {
                    Step::Submit(chunk) => self.submit(chunk),
                    other => other,
                },
                Wake::Io(Err(e)) => {
                    let (offset, remaining) = self.machine.cursor();
                    error!(
                        "cmd {:#04x} iid {}: readiness wait failed at \
                         offset {offset} ({remaining} left): {e}",
                        self.cmd, self.iid
                    );
                    self.machine.on_fault()
                }
                Wake::Tick => self.machine.on_tick(),
            };

            match step {
                Step::Wait => (),
                // Submissions were resolved above.
                Step::Submit(_) => (),
                Step::Finish(verdict) => {
                    if self.machine.state() == SessionState::TimedOut {
                        let (offset, remaining) = self.machine.cursor();
                        warn!(
                            "cmd {:#04x} iid {}: watchdog expired at offset \
                             {offset} ({remaining} left)",
                            self.cmd, self.iid
                        );
                    }
                    drop(watch);
                    self.finish(verdict);
                    return;
                }
            }
        }
    }

    fn submit(&mut self, chunk: Chunk) -> Step {
        let result = self.device.submit_chunk(
            self.source.as_fd(),
            chunk.offset,
            chunk.length,
            chunk.address,
            self.direction,
        );
        match &result {
            Ok(_) => debug!(
                "cmd {:#04x} iid {}: chunk offset {} len {} submitted",
                self.cmd, self.iid, chunk.offset, chunk.length
            ),
            Err(e) => error!(
                "cmd {:#04x} iid {}: chunk offset {} len {} failed: {e}",
                self.cmd, self.iid, chunk.offset, chunk.length
            ),
        }
        self.machine.on_chunk_done(result)
    }

    fn finish(&mut self, verdict: Verdict) {
        // Mapping before handle, handle and source with the session.
        self.device.unmap();
        let Verdict::Respond { cc, length } = verdict else {
            return;
        };
        let payload = match (TransferResp { length }).to_bytes() {
            Ok(p) => p,
            Err(e) => {
                error!("response encode failed: {e}");
                Vec::new()
            }
        };
        let resp = PldmResponse {
            iid: self.iid,
            typ: PLDM_TYPE_OEM,
            cmd: self.cmd,
            cc,
            payload,
        };
        if let Err(e) = self.sink.send_response(&self.key, &resp) {
            error!(
                "cmd {:#04x} iid {}: response send failed: {e}",
                self.cmd, self.iid
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ERR: u8 = CCode::ERROR as u8;
    const OK: u8 = CCode::SUCCESS as u8;

    fn drive_to_success(m: &mut SessionMachine) -> Vec<Chunk> {
        m.arm();
        let mut chunks = Vec::new();
        loop {
            match m.on_ready() {
                Step::Submit(c) => {
                    chunks.push(c);
                    match m.on_chunk_done(Ok(c.length)) {
                        Step::Wait => (),
                        Step::Finish(v) => {
                            assert!(matches!(v, Verdict::Respond { cc, .. } if cc == OK));
                            return chunks;
                        }
                        Step::Submit(_) => unreachable!(),
                    }
                }
                step => panic!("unexpected step {step:?}"),
            }
        }
    }

    #[test]
    fn single_chunk_at_minimum() {
        let mut m = SessionMachine::new(0, 16, 0x8000_0000);
        let chunks = drive_to_success(&mut m);
        assert_eq!(chunks, vec![Chunk {
            offset: 0,
            length: 16,
            address: 0x8000_0000
        }]);
        assert_eq!(m.state(), SessionState::Completed);
    }

    #[test]
    fn single_chunk_at_maximum() {
        let mut m = SessionMachine::new(0, MAX_CHUNK, 0);
        assert_eq!(drive_to_success(&mut m).len(), 1);
    }

    #[test]
    fn short_tail_chunk() {
        let mut m = SessionMachine::new(0, MAX_CHUNK + 1, 0x1000);
        let chunks = drive_to_success(&mut m);
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].length, MAX_CHUNK);
        assert_eq!(chunks[1], Chunk {
            offset: MAX_CHUNK,
            length: 1,
            address: 0x1000 + u64::from(MAX_CHUNK),
        });
    }

    #[test]
    fn three_full_chunks() {
        let mut m = SessionMachine::new(0, 3 * MAX_CHUNK, 0);
        let chunks = drive_to_success(&mut m);
        assert_eq!(chunks.len(), 3);
        assert!(chunks.iter().all(|c| c.length == MAX_CHUNK));
    }

    #[test]
    fn chunks_cover_range_in_order() {
        let offset = 4096;
        let length = MAX_CHUNK + 512;
        let mut m = SessionMachine::new(offset, length, 0x2000_0000);
        let chunks = drive_to_success(&mut m);
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].offset, offset);
        assert_eq!(chunks[1].offset, offset + chunks[0].length);
        assert_eq!(chunks[1].length, 512);
        let total: u64 = chunks.iter().map(|c| u64::from(c.length)).sum();
        assert_eq!(total, u64::from(length));
    }

    #[test]
    fn second_chunk_failure_responds_once() {
        let mut m = SessionMachine::new(0, MAX_CHUNK + 512, 0);
        m.arm();
        let Step::Submit(c0) = m.on_ready() else { panic!() };
        assert_eq!(m.on_chunk_done(Ok(c0.length)), Step::Wait);
        let Step::Submit(_) = m.on_ready() else { panic!() };
        let eio = XdmaError::Io(std::io::Error::from_raw_os_error(libc::EIO));
        assert_eq!(
            m.on_chunk_done(Err(eio)),
            Step::Finish(Verdict::Respond { cc: ERR, length: 0 })
        );
        assert_eq!(m.state(), SessionState::Failed);
        // Later events are dropped.
        assert_eq!(m.on_ready(), Step::Wait);
        assert_eq!(m.on_tick(), Step::Wait);
    }

    #[test]
    fn tail_count_mismatch_fails() {
        let mut m = SessionMachine::new(0, 32, 0);
        m.arm();
        let Step::Submit(c) = m.on_ready() else { panic!() };
        assert_eq!(c.length, 32);
        assert_eq!(
            m.on_chunk_done(Ok(16)),
            Step::Finish(Verdict::Respond { cc: ERR, length: 0 })
        );
    }

    #[test]
    fn timeout_then_late_readiness_is_dropped() {
        let mut m = SessionMachine::new(0, 64, 0);
        m.arm();
        let Step::Submit(c) = m.on_ready() else { panic!() };
        // Chunk submitted but completion never arrives; watchdog fires.
        let _ = c;
        assert_eq!(
            m.on_tick(),
            Step::Finish(Verdict::Respond { cc: ERR, length: 0 })
        );
        assert_eq!(m.state(), SessionState::TimedOut);
        // The late completion path stays latched off.
        assert_eq!(m.on_ready(), Step::Wait);
        assert_eq!(m.on_chunk_done(Ok(64)), Step::Wait);
        assert_eq!(m.on_tick(), Step::Wait);
    }

    #[test]
    fn completion_wins_race_with_watchdog() {
        let mut m = SessionMachine::new(0, 16, 0);
        m.arm();
        let Step::Submit(c) = m.on_ready() else { panic!() };
        let Step::Finish(v) = m.on_chunk_done(Ok(c.length)) else {
            panic!()
        };
        assert_eq!(v, Verdict::Respond { cc: OK, length: 16 });
        // Watchdog firing a moment later is ignored by the latch.
        assert_eq!(m.on_tick(), Step::Wait);
    }

    #[test]
    fn cancel_is_silent() {
        let mut m = SessionMachine::new(0, 16, 0);
        m.arm();
        assert_eq!(m.on_cancel(), Step::Finish(Verdict::Silent));
        assert_eq!(m.state(), SessionState::TimedOut);
        assert_eq!(m.on_tick(), Step::Wait);
    }

    #[test]
    fn rapid_sessions_always_respond_once() {
        for i in 0u32..1000 {
            let length = 16 + (i % 7) * (MAX_CHUNK / 2);
            let mut m = SessionMachine::new(0, length, 0);
            let mut responses = 0;
            m.arm();
            loop {
                match m.on_ready() {
                    Step::Submit(c) => match m.on_chunk_done(Ok(c.length)) {
                        Step::Finish(Verdict::Respond { .. }) => {
                            responses += 1;
                            break;
                        }
                        Step::Finish(Verdict::Silent) => break,
                        _ => (),
                    },
                    _ => break,
                }
            }
            assert_eq!(m.on_tick(), Step::Wait);
            assert_eq!(responses, 1);
        }
    }
}
