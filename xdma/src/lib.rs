// SPDX-License-Identifier: Apache-2.0
/*
 * ASPEED XDMA engine support.
 */

#![warn(missing_docs)]

//! Typed wrapper over the `/dev/aspeed-xdma` character device.
//!
//! The engine stages bytes between host memory and BMC files through a
//! page-aligned shared mapping of the device (the bounce buffer). One DMA
//! operation is submitted by writing an [`XdmaOp`] record to the device fd;
//! the engine signals completion by fd readiness: readable for a
//! host-to-BMC (downstream) operation, writable once the engine is idle
//! after a BMC-to-host (upstream) operation.
//!
//! A transfer longer than [`MAX_CHUNK`] is issued as multiple operations by
//! the caller, one per readiness wakeup. [`MIN_CHUNK`] constrains the
//! logical transfer length, not an individual operation: the tail of a
//! split transfer may be arbitrarily short.

use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::num::NonZeroUsize;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, RawFd};
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;
use std::ptr::NonNull;
use std::slice;

use log::{debug, error, trace};
use nix::sys::mman::{mmap, munmap, MapFlags, ProtFlags};
use nix::sys::uio::{pread, pwrite};

/// Default device node path.
pub const XDMA_DEV: &str = "/dev/aspeed-xdma";

/// Smallest logical transfer the engine accepts, in bytes.
pub const MIN_CHUNK: u32 = 16;

/// Largest single DMA operation, in bytes. Longer transfers are split into
/// multiple operations.
pub const MAX_CHUNK: u32 = 16 * 1024 * 1024;

/// Transfer direction, seen from the BMC.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// File bytes are staged into the bounce buffer and pushed upstream to
    /// host memory.
    ToHost,
    /// The engine pulls host memory downstream into the bounce buffer, and
    /// the bytes are written out to the file.
    FromHost,
}

impl Direction {
    fn upstream(self) -> u32 {
        match self {
            Direction::ToHost => 1,
            Direction::FromHost => 0,
        }
    }
}

/// Readiness events the device uses to report completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    /// A downstream operation has completed.
    Readable,
    /// The engine is idle; an upstream operation has completed.
    Writable,
}

/// Errors from the device wrapper. Syscall failures keep the underlying
/// errno.
#[derive(Debug)]
pub enum XdmaError {
    /// The device node could not be opened.
    DeviceUnavailable(io::Error),
    /// Mapping the bounce buffer failed.
    MapFailed(io::Error),
    /// The chunk length is zero or above [`MAX_CHUNK`].
    BadChunk(u32),
    /// No bounce buffer is mapped, or it is smaller than the chunk.
    NoBuffer,
    /// A syscall during chunk submission failed. The device handle remains
    /// valid; the chunk is aborted.
    Io(io::Error),
}

impl core::fmt::Display for XdmaError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::DeviceUnavailable(e) => {
                write!(f, "XDMA device unavailable: {e}")
            }
            Self::MapFailed(e) => write!(f, "XDMA mmap failed: {e}"),
            Self::BadChunk(l) => write!(f, "bad chunk length {l}"),
            Self::NoBuffer => write!(f, "no bounce buffer mapped"),
            Self::Io(e) => write!(f, "XDMA transfer error: {e}"),
        }
    }
}

impl std::error::Error for XdmaError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::DeviceUnavailable(e) | Self::MapFailed(e) | Self::Io(e) => {
                Some(e)
            }
            _ => None,
        }
    }
}

/// One DMA operation record, as consumed by the driver.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct XdmaOp {
    /// Host bus address. Must be word aligned.
    pub host_addr: u64,
    /// Operation length in bytes.
    pub len: u32,
    /// 1 for BMC-to-host, 0 for host-to-BMC.
    pub upstream: u32,
}

impl XdmaOp {
    /// Encodes the record for a `write()` to the device fd. The kernel
    /// consumes the in-memory layout, so fields are native endian.
    pub fn to_bytes(self) -> [u8; 16] {
        let mut b = [0u8; 16];
        b[..8].copy_from_slice(&self.host_addr.to_ne_bytes());
        b[8..12].copy_from_slice(&self.len.to_ne_bytes());
        b[12..].copy_from_slice(&self.upstream.to_ne_bytes());
        b
    }
}

/// Rounds a transfer length up to a whole number of pages.
pub fn page_aligned(length: u32) -> usize {
    let page = page_size();
    (length as usize).div_ceil(page) * page
}

fn page_size() -> usize {
    let v = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if v > 0 {
        v as usize
    } else {
        4096
    }
}

/// The shared mapping backing a transfer. Unmapped on drop, on every exit
/// path of the owning session.
pub struct XdmaBuffer {
    ptr: NonNull<libc::c_void>,
    len: usize,
}

impl XdmaBuffer {
    fn map(fd: BorrowedFd, len: usize) -> Result<Self, XdmaError> {
        let len_nz = NonZeroUsize::new(len).ok_or(XdmaError::BadChunk(0))?;
        let ptr = unsafe {
            mmap(
                None,
                len_nz,
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                MapFlags::MAP_SHARED,
                fd,
                0,
            )
        }
        .map_err(|e| XdmaError::MapFailed(e.into()))?;
        Ok(Self { ptr, len })
    }

    /// Mapped length in bytes; a page multiple.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Returns true for an empty mapping. Cannot occur through [`map`];
    /// present for completeness.
    ///
    /// [`map`]: XdmaDevice::map
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// The buffer contents.
    pub fn as_slice(&self) -> &[u8] {
        unsafe { slice::from_raw_parts(self.ptr.as_ptr().cast(), self.len) }
    }

    /// The buffer contents, writable.
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        unsafe {
            slice::from_raw_parts_mut(self.ptr.as_ptr().cast(), self.len)
        }
    }
}

impl Drop for XdmaBuffer {
    fn drop(&mut self) {
        if let Err(e) = unsafe { munmap(self.ptr, self.len) } {
            error!("munmap of {} byte XDMA buffer failed: {e}", self.len);
        }
    }
}

impl core::fmt::Debug for XdmaBuffer {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("XdmaBuffer").field("len", &self.len).finish()
    }
}

/// An open XDMA engine handle and its bounce buffer.
///
/// One handle serves one transfer session; multiple opens of the device are
/// legal but only one outstanding operation per handle makes progress.
#[derive(Debug)]
pub struct XdmaDevice {
    file: File,
    buffer: Option<XdmaBuffer>,
}

impl XdmaDevice {
    /// Opens the default device node, `O_RDWR | O_NONBLOCK`.
    pub fn open() -> Result<Self, XdmaError> {
        Self::open_at(Path::new(XDMA_DEV))
    }

    /// Opens a specific device node. Exists so tests and bring-up can point
    /// at a scratch file.
    pub fn open_at(path: &Path) -> Result<Self, XdmaError> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(libc::O_NONBLOCK)
            .open(path)
            .map_err(XdmaError::DeviceUnavailable)?;
        debug!("opened XDMA device {}", path.display());
        Ok(Self { file, buffer: None })
    }

    /// Maps a bounce buffer sized for a transfer of `length` bytes, rounded
    /// up to a page multiple, at device offset 0. Replaces any previous
    /// mapping.
    pub fn map(&mut self, length: u32) -> Result<(), XdmaError> {
        let aligned = page_aligned(length);
        let buffer = XdmaBuffer::map(self.file.as_fd(), aligned)?;
        trace!("mapped {aligned} byte bounce buffer for {length} byte transfer");
        self.buffer = Some(buffer);
        Ok(())
    }

    /// The current bounce buffer, if mapped.
    pub fn buffer(&self) -> Option<&XdmaBuffer> {
        self.buffer.as_ref()
    }

    /// The current bounce buffer, writable.
    pub fn buffer_mut(&mut self) -> Option<&mut XdmaBuffer> {
        self.buffer.as_mut()
    }

    /// Drops the bounce buffer mapping ahead of the handle itself.
    pub fn unmap(&mut self) {
        self.buffer = None;
    }

    /// Issues one DMA operation of `length` bytes between `source` at
    /// `file_offset` and host memory at `host_address`.
    ///
    /// For [`Direction::ToHost`] the file bytes are staged into the bounce
    /// buffer before the operation record is pushed; for
    /// [`Direction::FromHost`] the record is pushed first and the buffer is
    /// then drained to the file. Returns the chunk byte count. Completion
    /// of the engine work is reported by fd readiness, not by this call.
    pub fn submit_chunk(
        &mut self,
        source: BorrowedFd,
        file_offset: u32,
        length: u32,
        host_address: u64,
        direction: Direction,
    ) -> Result<u32, XdmaError> {
        if length == 0 || length > MAX_CHUNK {
            return Err(XdmaError::BadChunk(length));
        }
        let len = length as usize;
        let buffer = self.buffer.as_mut().ok_or(XdmaError::NoBuffer)?;
        if buffer.len() < len {
            return Err(XdmaError::NoBuffer);
        }

        let op = XdmaOp {
            host_addr: host_address,
            len: length,
            upstream: direction.upstream(),
        };

        match direction {
            Direction::ToHost => {
                fill_exact(
                    source,
                    &mut buffer.as_mut_slice()[..len],
                    file_offset,
                )?;
                push_op(&self.file, op)?;
            }
            Direction::FromHost => {
                push_op(&self.file, op)?;
                drain_exact(source, &buffer.as_slice()[..len], file_offset)?;
            }
        }

        trace!(
            "submitted {direction:?} chunk: offset {file_offset} len {length} \
             addr {host_address:#x}"
        );
        Ok(length)
    }
}

impl AsFd for XdmaDevice {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.file.as_fd()
    }
}

impl AsRawFd for XdmaDevice {
    fn as_raw_fd(&self) -> RawFd {
        self.file.as_raw_fd()
    }
}

fn push_op(dev: &File, op: XdmaOp) -> Result<(), XdmaError> {
    let mut dev = dev;
    dev.write_all(&op.to_bytes()).map_err(XdmaError::Io)
}

fn fill_exact(
    source: BorrowedFd,
    mut buf: &mut [u8],
    mut offset: u32,
) -> Result<(), XdmaError> {
    while !buf.is_empty() {
        let n = pread(source, buf, offset.into())
            .map_err(|e| XdmaError::Io(e.into()))?;
        if n == 0 {
            return Err(XdmaError::Io(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "source file shorter than transfer range",
            )));
        }
        buf = &mut buf[n..];
        offset += n as u32;
    }
    Ok(())
}

fn drain_exact(
    source: BorrowedFd,
    mut buf: &[u8],
    mut offset: u32,
) -> Result<(), XdmaError> {
    while !buf.is_empty() {
        let n = pwrite(source, buf, offset.into())
            .map_err(|e| XdmaError::Io(e.into()))?;
        if n == 0 {
            return Err(XdmaError::Io(io::Error::new(
                io::ErrorKind::WriteZero,
                "short write to source file",
            )));
        }
        buf = &buf[n..];
        offset += n as u32;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;
    use std::os::fd::AsFd;

    fn scratch_device(len: usize) -> (tempfile::NamedTempFile, XdmaDevice) {
        let f = tempfile::NamedTempFile::new().unwrap();
        f.as_file().set_len(len as u64).unwrap();
        let dev = XdmaDevice::open_at(f.path()).unwrap();
        (f, dev)
    }

    #[test]
    fn page_alignment() {
        let page = page_size() as u32;
        assert_eq!(page_aligned(page), page as usize);
        assert_eq!(page_aligned(3 * page), 3 * page as usize);
        assert_eq!(page_aligned(1), page as usize);
        assert_eq!(page_aligned(page + 1), 2 * page as usize);
        assert_eq!(page_aligned(MIN_CHUNK), page as usize);
    }

    #[test]
    fn op_record_layout() {
        let op = XdmaOp {
            host_addr: 0x8000_0000,
            len: 512,
            upstream: 1,
        };
        let b = op.to_bytes();
        assert_eq!(b[..8], 0x8000_0000u64.to_ne_bytes());
        assert_eq!(b[8..12], 512u32.to_ne_bytes());
        assert_eq!(b[12..], 1u32.to_ne_bytes());
    }

    #[test]
    fn chunk_bounds() {
        let (_f, mut dev) = scratch_device(page_aligned(64));
        dev.map(64).unwrap();
        let src = tempfile::tempfile().unwrap();
        let r = dev.submit_chunk(src.as_fd(), 0, 0, 0, Direction::ToHost);
        assert!(matches!(r, Err(XdmaError::BadChunk(0))));
        let r = dev.submit_chunk(
            src.as_fd(),
            0,
            MAX_CHUNK + 1,
            0,
            Direction::ToHost,
        );
        assert!(matches!(r, Err(XdmaError::BadChunk(_))));
    }

    #[test]
    fn submit_without_buffer() {
        let (_f, mut dev) = scratch_device(page_aligned(64));
        let src = tempfile::tempfile().unwrap();
        let r = dev.submit_chunk(src.as_fd(), 0, 16, 0, Direction::ToHost);
        assert!(matches!(r, Err(XdmaError::NoBuffer)));
    }

    // The scratch device is a regular file, so the MAP_SHARED bounce buffer
    // aliases the op record written at file offset 0: the first 16 buffer
    // bytes read back as the record after submission.
    #[test]
    fn to_host_stages_and_pushes_op() {
        let (dev_file, mut dev) = scratch_device(page_aligned(32));
        dev.map(32).unwrap();

        let mut src = tempfile::tempfile().unwrap();
        let data: Vec<u8> = (0u8..64).collect();
        src.write_all(&data).unwrap();

        let n = dev
            .submit_chunk(src.as_fd(), 4, 32, 0x8000_0000, Direction::ToHost)
            .unwrap();
        assert_eq!(n, 32);

        let op = XdmaOp {
            host_addr: 0x8000_0000,
            len: 32,
            upstream: 1,
        }
        .to_bytes();
        let contents = std::fs::read(dev_file.path()).unwrap();
        assert_eq!(&contents[..16], &op);
        // Bytes past the record survive from the staging pread.
        assert_eq!(&contents[16..32], &data[20..36]);
        assert_eq!(&dev.buffer().unwrap().as_slice()[16..32], &data[20..36]);
    }

    #[test]
    fn from_host_drains_buffer() {
        let (_dev_file, mut dev) = scratch_device(page_aligned(32));
        dev.map(32).unwrap();
        dev.buffer_mut().unwrap().as_mut_slice()[..32]
            .copy_from_slice(&[0xa5; 32]);

        let src = tempfile::tempfile().unwrap();
        let n = dev
            .submit_chunk(src.as_fd(), 8, 32, 0x4000, Direction::FromHost)
            .unwrap();
        assert_eq!(n, 32);

        let op = XdmaOp {
            host_addr: 0x4000,
            len: 32,
            upstream: 0,
        }
        .to_bytes();
        let mut out = vec![0u8; 40];
        pread(src.as_fd(), &mut out, 0).unwrap();
        // Record first, then the drain: the aliased first 16 bytes carry the
        // record, the rest the prefilled pattern.
        assert_eq!(&out[8..24], &op);
        assert_eq!(&out[24..40], &[0xa5; 16]);
    }
}
