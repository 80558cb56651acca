// SPDX-License-Identifier: Apache-2.0
/*
 * BMC-side PLDM file-I/O daemon.
 */

//! Services PLDM OEM file-I/O commands from the host, moving byte ranges
//! between host memory and BMC files through the ASPEED XDMA engine, and
//! forwards BMC-originated file events back to the host.
//!
//! The daemon is single-threaded and cooperative: one reactor thread owns
//! every transfer session, I/O registration, timer and bus match.

pub mod handler;
pub mod notifier;
pub mod reactor;
pub mod session;
pub mod transport;
pub mod typed;
pub mod watch;
