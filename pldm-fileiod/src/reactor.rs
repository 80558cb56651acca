// SPDX-License-Identifier: Apache-2.0

//! Reactor glue.
//!
//! A single-threaded cooperative executor owns every session, readiness
//! registration and timer. Callbacks never run concurrently; sessions
//! suspend only between chunks.

use std::cell::RefCell;
use std::future::Future;
use std::time::{Duration, Instant};

use log::debug;
use smol::stream::StreamExt;
use smol::{LocalExecutor, Task, Timer};

/// The daemon's reactor: a local executor plus the process-wide bus
/// attachment.
pub struct Reactor {
    ex: LocalExecutor<'static>,
    bus: RefCell<Option<zbus::Connection>>,
}

impl Reactor {
    /// Creates an empty reactor.
    pub fn new() -> Self {
        Self {
            ex: LocalExecutor::new(),
            bus: RefCell::new(None),
        }
    }

    /// Schedules a task. The caller owns the handle; dropping it cancels
    /// the task and runs its owned drops.
    pub fn spawn<T: 'static>(
        &self,
        fut: impl Future<Output = T> + 'static,
    ) -> Task<T> {
        self.ex.spawn(fut)
    }

    /// Drives the reactor until `fut` completes.
    pub fn block_on<T>(&self, fut: impl Future<Output = T>) -> T {
        smol::block_on(self.ex.run(fut))
    }

    /// Adopts the message-bus connection. A one-time startup action:
    /// repeated attachment is refused so no per-session path can rebind
    /// the bus.
    pub fn attach_bus(&self, conn: zbus::Connection) -> bool {
        let mut bus = self.bus.borrow_mut();
        if bus.is_some() {
            debug!("bus already attached");
            return false;
        }
        *bus = Some(conn);
        true
    }

    /// The attached bus connection, if any.
    pub fn bus(&self) -> Option<zbus::Connection> {
        self.bus.borrow().clone()
    }
}

impl Default for Reactor {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-session deadline timer. Fires first at the deadline, then at the
/// re-check interval so a set response latch is observed promptly.
pub struct Watchdog {
    timer: Timer,
}

impl Watchdog {
    /// Arms a deadline with a re-trigger interval.
    pub fn arm(deadline: Duration, interval: Duration) -> Self {
        Self {
            timer: Timer::interval_at(Instant::now() + deadline, interval),
        }
    }

    /// A watchdog that never fires, for `--notimeout` operation.
    pub fn disabled() -> Self {
        Self {
            timer: Timer::never(),
        }
    }

    /// Completes at the next firing; pends forever when disabled.
    pub async fn tick(&mut self) {
        (&mut self.timer).next().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spawned_task_runs() {
        let reactor = Reactor::new();
        let task = reactor.spawn(async { 7 });
        assert_eq!(reactor.block_on(task), 7);
    }

    #[test]
    fn watchdog_elapses() {
        let mut wd =
            Watchdog::arm(Duration::from_millis(1), Duration::from_millis(1));
        smol::block_on(wd.tick());
        smol::block_on(wd.tick());
    }
}
