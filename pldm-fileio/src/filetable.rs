// SPDX-License-Identifier: Apache-2.0

//! The file attribute table.
//!
//! Maps the `file_handle` carried by file-I/O commands to a path on the
//! BMC filesystem. The wire form served by GetFileTable is the packed
//! entry list followed by a CRC-32 of the entries; sizes are refreshed
//! from the filesystem at encode time so the host always sees current
//! lengths.

use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use log::warn;
use serde::Deserialize;

const CRC32: crc::Crc<u32, crc::Table<16>> =
    crc::Crc::<u32, crc::Table<16>>::new(&crc::CRC_32_ISO_HDLC);

/// File table failures.
#[derive(Debug)]
pub enum FileTableError {
    /// The config listing could not be read.
    Io(io::Error),
    /// The config listing is not valid JSON.
    Config(serde_json::Error),
}

impl fmt::Display for FileTableError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(e) => write!(f, "file table read failed: {e}"),
            Self::Config(e) => write!(f, "file table config invalid: {e}"),
        }
    }
}

impl std::error::Error for FileTableError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            Self::Config(e) => Some(e),
        }
    }
}

#[derive(Debug, Deserialize)]
struct EntryConfig {
    path: PathBuf,
    #[serde(default)]
    traits: u32,
}

/// One table entry. The handle is the entry's position in the listing.
#[derive(Debug, Clone)]
pub struct FileEntry {
    /// Handle the host uses to name this file.
    pub handle: u32,
    /// Backing path on the BMC.
    pub path: PathBuf,
    /// Traits word passed through to the host.
    pub traits: u32,
}

/// The file attribute table.
#[derive(Debug, Default)]
pub struct FileTable {
    entries: Vec<FileEntry>,
}

impl FileTable {
    /// Loads the table from a JSON listing: `[{ "path": …, "traits": … }]`.
    /// Handles are assigned in listing order.
    pub fn load(config: &Path) -> Result<Self, FileTableError> {
        let raw = fs::read(config).map_err(FileTableError::Io)?;
        let configs: Vec<EntryConfig> =
            serde_json::from_slice(&raw).map_err(FileTableError::Config)?;
        Ok(Self::from_listing(
            configs.into_iter().map(|c| (c.path, c.traits)),
        ))
    }

    /// Builds a table directly from `(path, traits)` pairs.
    pub fn from_listing(
        listing: impl IntoIterator<Item = (PathBuf, u32)>,
    ) -> Self {
        let entries = listing
            .into_iter()
            .enumerate()
            .map(|(i, (path, traits))| FileEntry {
                handle: i as u32,
                path,
                traits,
            })
            .collect();
        Self { entries }
    }

    /// True when no files are listed.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Finds the entry for a handle.
    pub fn lookup(&self, handle: u32) -> Option<&FileEntry> {
        self.entries.iter().find(|e| e.handle == handle)
    }

    /// Encodes the wire form: packed entries plus a trailing CRC-32.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        for entry in &self.entries {
            let name = entry
                .path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            let size = match fs::metadata(&entry.path) {
                Ok(m) => m.len() as u32,
                Err(e) => {
                    warn!(
                        "file table entry {} ({}) not readable: {e}",
                        entry.handle,
                        entry.path.display()
                    );
                    0
                }
            };
            out.extend_from_slice(&entry.handle.to_le_bytes());
            out.extend_from_slice(&(name.len() as u16).to_le_bytes());
            out.extend_from_slice(name.as_bytes());
            out.extend_from_slice(&size.to_le_bytes());
            out.extend_from_slice(&entry.traits.to_le_bytes());
        }
        let cs = CRC32.checksum(&out);
        out.extend_from_slice(&cs.to_le_bytes());
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;

    fn table_with_file(contents: &[u8]) -> (tempfile::TempDir, FileTable) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("lid.bin");
        let mut f = fs::File::create(&path).unwrap();
        f.write_all(contents).unwrap();
        let table = FileTable::from_listing([(path, 6)]);
        (dir, table)
    }

    #[test]
    fn lookup_by_handle() {
        let (_dir, table) = table_with_file(b"abc");
        assert!(table.lookup(0).is_some());
        assert!(table.lookup(1).is_none());
        assert_eq!(table.lookup(0).unwrap().traits, 6);
    }

    #[test]
    fn wire_form() {
        let (_dir, table) = table_with_file(&[0u8; 100]);
        let wire = table.encode();
        // handle + name_len + "lid.bin" + size + traits + crc
        assert_eq!(wire.len(), 4 + 2 + 7 + 4 + 4 + 4);
        assert_eq!(&wire[..4], &[0, 0, 0, 0]);
        assert_eq!(&wire[4..6], &[7, 0]);
        assert_eq!(&wire[6..13], b"lid.bin");
        assert_eq!(&wire[13..17], &100u32.to_le_bytes());
        assert_eq!(&wire[17..21], &6u32.to_le_bytes());
        let cs = CRC32.checksum(&wire[..21]);
        assert_eq!(&wire[21..], &cs.to_le_bytes());
    }

    #[test]
    fn missing_backing_file_encodes_zero_size() {
        let table =
            FileTable::from_listing([(PathBuf::from("/does/not/exist"), 0)]);
        let wire = table.encode();
        let name = b"exist";
        let size_at = 4 + 2 + name.len();
        assert_eq!(&wire[size_at..size_at + 4], &[0, 0, 0, 0]);
    }

    #[test]
    fn load_from_json() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = dir.path().join("table.json");
        fs::write(
            &cfg,
            r#"[{"path": "/var/lib/host/lid0", "traits": 1},
                {"path": "/var/lib/host/lid1"}]"#,
        )
        .unwrap();
        let table = FileTable::load(&cfg).unwrap();
        assert_eq!(table.lookup(1).unwrap().traits, 0);
        assert_eq!(
            table.lookup(0).unwrap().path,
            PathBuf::from("/var/lib/host/lid0")
        );
        assert!(FileTable::load(&dir.path().join("nope.json")).is_err());
    }
}
