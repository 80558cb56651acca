// SPDX-License-Identifier: Apache-2.0

//! By-type file backends.
//!
//! The by-type commands name a file class instead of a file-table handle.
//! The class set is closed, so it is a plain enum with a path policy per
//! kind rather than an open handler registry.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use log::{info, warn};
use pldm_fileio::proto::file_type;
use pldm_fileio::CCode;

/// The file classes the daemon serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    /// Platform event log offload.
    Pel,
    /// Permanent load identifier image.
    LidPerm,
    /// Temporary load identifier image.
    LidTemp,
    /// Host dump offload.
    Dump,
    /// Certificate signing request staged for the host.
    CertSigningRequest,
    /// Certificate signed by the host.
    SignedCert,
    /// Host root certificate.
    RootCert,
    /// Resource dump parameter file.
    ResourceDumpParms,
    /// Resource dump offload.
    ResourceDump,
    /// Boot progress SRC pushed by the host.
    ProgressSrc,
    /// Capacity-on-demand license blob.
    CodLicense,
}

impl FileKind {
    /// Maps a wire `file_type` value.
    pub fn from_type(value: u16) -> Option<Self> {
        match value {
            file_type::PEL => Some(Self::Pel),
            file_type::LID_PERM => Some(Self::LidPerm),
            file_type::LID_TEMP => Some(Self::LidTemp),
            file_type::DUMP => Some(Self::Dump),
            file_type::CERT_SIGNING_REQUEST => Some(Self::CertSigningRequest),
            file_type::SIGNED_CERT => Some(Self::SignedCert),
            file_type::ROOT_CERT => Some(Self::RootCert),
            file_type::RESOURCE_DUMP_PARMS => Some(Self::ResourceDumpParms),
            file_type::RESOURCE_DUMP => Some(Self::ResourceDump),
            file_type::PROGRESS_SRC => Some(Self::ProgressSrc),
            file_type::COD_LICENSE => Some(Self::CodLicense),
            _ => None,
        }
    }

    /// Whether the class may ride the DMA memory commands. Progress SRCs
    /// arrive inline only.
    pub fn supports_dma(self) -> bool {
        !matches!(self, Self::ProgressSrc)
    }
}

/// Path policy and per-kind command behavior.
#[derive(Debug)]
pub struct TypedFiles {
    root: PathBuf,
}

impl TypedFiles {
    /// Backends rooted at `root` (normally `/var/lib/pldm`).
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    /// Where a class/handle pair lives on the BMC.
    pub fn resolve(&self, kind: FileKind, handle: u32) -> PathBuf {
        match kind {
            FileKind::Pel => self.root.join("pels").join(handle.to_string()),
            FileKind::LidPerm => {
                self.root.join("lids/perm").join(format!("{handle:08x}.lid"))
            }
            FileKind::LidTemp => {
                self.root.join("lids/temp").join(format!("{handle:08x}.lid"))
            }
            FileKind::Dump => {
                self.root.join("dumps").join(handle.to_string())
            }
            FileKind::ResourceDump => {
                self.root.join("dumps/resource").join(handle.to_string())
            }
            FileKind::ResourceDumpParms => self
                .root
                .join("dumps/resource")
                .join(format!("parms.{handle}")),
            FileKind::CertSigningRequest => {
                self.root.join("certs").join(format!("csr.{handle}"))
            }
            FileKind::SignedCert => {
                self.root.join("certs").join(format!("signed.{handle}"))
            }
            FileKind::RootCert => self.root.join("certs/root"),
            FileKind::ProgressSrc => self.root.join("progress_src"),
            FileKind::CodLicense => {
                self.root.join("license").join(format!("{handle}.bin"))
            }
        }
    }

    /// Ensures the parent directory for a staged file exists.
    pub fn prepare(&self, path: &Path) -> io::Result<()> {
        match path.parent() {
            Some(dir) => fs::create_dir_all(dir),
            None => Ok(()),
        }
    }

    /// Host acknowledgement of a file. Offload staging is cleaned up on a
    /// clean status; the ack itself always succeeds for classes that can
    /// carry files.
    pub fn file_ack(&self, kind: FileKind, handle: u32, status: u8) -> u8 {
        if kind == FileKind::ProgressSrc {
            return CCode::ERROR_UNSUPPORTED_PLDM_CMD as u8;
        }
        info!("file ack: {kind:?} handle {handle} status {status}");
        if matches!(kind, FileKind::Dump | FileKind::ResourceDump)
            && status == 0
        {
            let staged = self.resolve(kind, handle);
            if let Err(e) = fs::remove_file(&staged) {
                if e.kind() != io::ErrorKind::NotFound {
                    warn!(
                        "staged {} not removed: {e}",
                        staged.display()
                    );
                }
            }
        }
        CCode::SUCCESS as u8
    }

    /// Host announcement of a new file of this class.
    pub fn new_file_available(
        &self,
        kind: FileKind,
        handle: u32,
        length: u64,
    ) -> u8 {
        match kind {
            FileKind::ResourceDumpParms
            | FileKind::SignedCert
            | FileKind::RootCert
            | FileKind::CodLicense
            | FileKind::Dump => {
                let path = self.resolve(kind, handle);
                if let Err(e) = self.prepare(&path) {
                    warn!("staging dir for {} failed: {e}", path.display());
                    return CCode::ERROR as u8;
                }
                info!(
                    "new file: {kind:?} handle {handle} length {length} -> {}",
                    path.display()
                );
                CCode::SUCCESS as u8
            }
            _ => CCode::ERROR_UNSUPPORTED_PLDM_CMD as u8,
        }
    }

    /// Metadata-carrying variant; the metadata words are type-specific and
    /// logged for the classes that take them.
    pub fn new_file_available_with_meta(
        &self,
        kind: FileKind,
        handle: u32,
        length: u64,
        meta: [u32; 4],
    ) -> u8 {
        info!("new file meta: {kind:?} {meta:08x?}");
        self.new_file_available(kind, handle, length)
    }

    /// Metadata-carrying ack variant.
    pub fn file_ack_with_meta(
        &self,
        kind: FileKind,
        handle: u32,
        status: u8,
        meta: [u32; 4],
    ) -> u8 {
        info!("file ack meta: {kind:?} {meta:08x?}");
        self.file_ack(kind, handle, status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_type_mapping() {
        assert_eq!(FileKind::from_type(0x00), Some(FileKind::Pel));
        assert_eq!(FileKind::from_type(0x09), Some(FileKind::ResourceDump));
        assert_eq!(FileKind::from_type(0xbeef), None);
    }

    #[test]
    fn progress_src_is_inline_only() {
        assert!(!FileKind::ProgressSrc.supports_dma());
        assert!(FileKind::Dump.supports_dma());
        let t = TypedFiles::new(PathBuf::from("/tmp/x"));
        assert_eq!(
            t.file_ack(FileKind::ProgressSrc, 0, 0),
            CCode::ERROR_UNSUPPORTED_PLDM_CMD as u8
        );
    }

    #[test]
    fn ack_succeeds_and_cleans_staging() {
        let dir = tempfile::tempdir().unwrap();
        let t = TypedFiles::new(dir.path().to_path_buf());
        let staged = t.resolve(FileKind::ResourceDump, 3);
        t.prepare(&staged).unwrap();
        fs::write(&staged, b"dump").unwrap();

        assert_eq!(t.file_ack(FileKind::ResourceDump, 3, 0), 0);
        assert!(!staged.exists());
        // A clean ack for an absent file is still a success.
        assert_eq!(t.file_ack(FileKind::LidPerm, 42, 0), 0);
    }

    #[test]
    fn new_file_prepares_staging() {
        let dir = tempfile::tempdir().unwrap();
        let t = TypedFiles::new(dir.path().to_path_buf());
        assert_eq!(
            t.new_file_available(FileKind::CodLicense, 1, 4096),
            0
        );
        assert!(dir.path().join("license").is_dir());
        assert_eq!(
            t.new_file_available(FileKind::ProgressSrc, 0, 8),
            CCode::ERROR_UNSUPPORTED_PLDM_CMD as u8
        );
    }
}
