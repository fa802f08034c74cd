//! Firmware blob access.
//!
//! Patch and settings files are opaque byte blobs fetched by name. Names are
//! derived from the chip revision and LMP sub-version reported by the chip:
//!
//! ```text
//! <prefix>_<revision:04X>_<subversion:04X>_<kind>.<ext>
//! e.g. CG2900_0200_0011_patch.fw
//! ```

use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::ops::Range;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use log::debug;

use crate::chip::ChipInfo;
use crate::error::{Error, Result};

/// Which file of a chip a blob holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BlobKind {
    /// Firmware patch, downloaded first.
    Patch,
    /// Radio and system settings, downloaded after the patch.
    Settings,
}

impl BlobKind {
    /// Name fragment used in file names.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Patch => "patch",
            Self::Settings => "settings",
        }
    }
}

impl fmt::Display for BlobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Build the file name for a blob of `kind` on the identified chip.
pub fn blob_name(prefix: &str, extension: &str, chip: &ChipInfo, kind: BlobKind) -> String {
    format!(
        "{prefix}_{:04X}_{:04X}_{kind}.{extension}",
        chip.hci_revision, chip.lmp_subversion
    )
}

/// Immutable, cheaply clonable firmware blob.
#[derive(Clone, PartialEq, Eq)]
pub struct Blob {
    name: String,
    data: Arc<[u8]>,
}

impl Blob {
    /// Wrap bytes under a name.
    pub fn new(name: impl Into<String>, data: impl Into<Arc<[u8]>>) -> Self {
        Self {
            name: name.into(),
            data: data.into(),
        }
    }

    /// Name the blob was fetched under.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Size in bytes.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Whether the blob holds no bytes.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Read a byte range, clamped to the blob.
    pub fn read(&self, range: Range<usize>) -> &[u8] {
        let end = range.end.min(self.data.len());
        let start = range.start.min(end);
        &self.data[start..end]
    }

    /// Whole content.
    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }
}

impl fmt::Debug for Blob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Blob")
            .field("name", &self.name)
            .field("len", &self.data.len())
            .finish()
    }
}

/// Source of firmware blobs.
pub trait BlobProvider: Send + Sync {
    /// Fetch a blob by file name; `Error::NotFound` when it does not exist.
    fn fetch(&self, name: &str) -> Result<Blob>;
}

/// Blobs stored as files in one directory.
#[derive(Debug, Clone)]
pub struct DirBlobProvider {
    dir: PathBuf,
}

impl DirBlobProvider {
    /// Serve files from `dir`.
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
        }
    }

    /// Directory the blobs are read from.
    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

impl BlobProvider for DirBlobProvider {
    fn fetch(&self, name: &str) -> Result<Blob> {
        // Only plain file names; the provider never leaves its directory
        if name.is_empty() || name.contains(['/', '\\']) || name == ".." {
            return Err(Error::NotFound(format!("invalid blob name '{name}'")));
        }

        let path = self.dir.join(name);
        match fs::read(&path) {
            Ok(data) => {
                debug!("Loaded {} ({} bytes)", path.display(), data.len());
                Ok(Blob::new(name, data))
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(Error::NotFound(path.display().to_string()))
            },
            Err(e) => Err(Error::Io(e)),
        }
    }
}

/// In-memory blob store.
#[derive(Debug, Default)]
pub struct MemoryBlobProvider {
    blobs: RwLock<HashMap<String, Arc<[u8]>>>,
}

impl MemoryBlobProvider {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a blob.
    pub fn insert(&self, name: impl Into<String>, data: impl Into<Arc<[u8]>>) {
        if let Ok(mut blobs) = self.blobs.write() {
            blobs.insert(name.into(), data.into());
        }
    }

    /// Builder-style [`insert`](Self::insert).
    #[must_use]
    pub fn with(self, name: impl Into<String>, data: impl Into<Arc<[u8]>>) -> Self {
        self.insert(name, data);
        self
    }
}

impl BlobProvider for MemoryBlobProvider {
    fn fetch(&self, name: &str) -> Result<Blob> {
        let blobs = self
            .blobs
            .read()
            .map_err(|_| Error::NotFound(name.to_string()))?;
        blobs
            .get(name)
            .map(|data| Blob::new(name, Arc::clone(data)))
            .ok_or_else(|| Error::NotFound(name.to_string()))
    }
}
