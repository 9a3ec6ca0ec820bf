//! Artifact access: root confinement, memory mapping and hashing.

use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};

use memmap2::Mmap;
use sha2::{Digest, Sha256};

use super::error::BackendError;

/// Resolve `candidate` and require it to stay under `root`.
///
/// Both paths are canonicalized, so symlinks pointing outside the root are
/// rejected too.
pub fn confine(root: &Path, candidate: &Path) -> Result<PathBuf, BackendError> {
    let root = root.canonicalize()?;
    let canonical = candidate.canonicalize()?;
    if !canonical.starts_with(&root) {
        return Err(BackendError::InvalidArtifact(format!(
            "{} escapes model root {}",
            canonical.display(),
            root.display()
        )));
    }
    Ok(canonical)
}

/// Hex SHA-256 of a file, streamed in fixed-size chunks.
pub fn sha256_file(path: &Path) -> Result<String, BackendError> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Read-only memory map of a weights file.
pub struct MappedArtifact {
    path: PathBuf,
    mmap: Mmap,
}

impl MappedArtifact {
    pub fn open(path: &Path) -> Result<Self, BackendError> {
        let file = File::open(path)?;
        if file.metadata()?.len() == 0 {
            return Err(BackendError::InvalidArtifact(format!(
                "{} is empty",
                path.display()
            )));
        }
        // SAFETY: read-only mapping; artifacts are not modified while loaded.
        let mmap = unsafe { Mmap::map(&file)? };
        Ok(Self { path: path.to_path_buf(), mmap })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.mmap
    }

    pub fn len(&self) -> usize {
        self.mmap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.mmap.is_empty()
    }

    /// Compare the mapped bytes against an expected hex digest.
    pub fn verify_sha256(&self, expected: &str) -> Result<(), BackendError> {
        let actual = hex::encode(Sha256::digest(self.as_bytes()));
        if !actual.eq_ignore_ascii_case(expected) {
            return Err(BackendError::InvalidArtifact(format!(
                "hash mismatch: expected {}, got {}",
                expected, actual
            )));
        }
        Ok(())
    }

    pub fn read_u32_le(&self, offset: usize) -> Option<u32> {
        let bytes = self.mmap.get(offset..offset + 4)?;
        Some(u32::from_le_bytes(bytes.try_into().ok()?))
    }

    pub fn read_u64_le(&self, offset: usize) -> Option<u64> {
        let bytes = self.mmap.get(offset..offset + 8)?;
        Some(u64::from_le_bytes(bytes.try_into().ok()?))
    }
}
