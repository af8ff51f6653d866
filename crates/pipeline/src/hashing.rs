//! Multi-algorithm content hashing for files and folders.
//!
//! A file digest covers its bytes. A folder digest folds, in sorted walk
//! order, each file's relative path and per-file digest into one outer
//! digest, so the folder's own name never affects the result and a tree
//! restored under a different root hashes identically.

use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256, Sha384, Sha512};
use stowage_core::item::{Digests, HashAlgorithm};
use walkdir::WalkDir;

const READ_BUFFER_SIZE: usize = 1024 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum HashError {
    #[error("Path not found: {0}")]
    NotFound(PathBuf),

    #[error("Failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("No hash algorithms requested")]
    NoAlgorithms,
}

impl HashError {
    fn io(path: &Path, source: std::io::Error) -> Self {
        if source.kind() == std::io::ErrorKind::NotFound {
            HashError::NotFound(path.to_path_buf())
        } else {
            HashError::Io {
                path: path.to_path_buf(),
                source,
            }
        }
    }
}

/// Computes content digests. Implementations are blocking.
pub trait ContentHasher: Send + Sync {
    fn calculate(&self, path: &Path, algorithms: &[HashAlgorithm]) -> Result<Digests, HashError>;
}

// ---------------------------------------------------------------------------
// Sha2Hasher
// ---------------------------------------------------------------------------

/// [`ContentHasher`] over the SHA-2 family.
#[derive(Debug, Default, Clone, Copy)]
pub struct Sha2Hasher;

enum Running {
    Sha256(Sha256),
    Sha384(Sha384),
    Sha512(Sha512),
}

impl Running {
    fn new(algorithm: HashAlgorithm) -> Self {
        match algorithm {
            HashAlgorithm::Sha256 => Running::Sha256(Sha256::new()),
            HashAlgorithm::Sha384 => Running::Sha384(Sha384::new()),
            HashAlgorithm::Sha512 => Running::Sha512(Sha512::new()),
        }
    }

    fn update(&mut self, data: &[u8]) {
        match self {
            Running::Sha256(h) => h.update(data),
            Running::Sha384(h) => h.update(data),
            Running::Sha512(h) => h.update(data),
        }
    }

    fn finalize_hex(self) -> String {
        match self {
            Running::Sha256(h) => format!("{:X}", h.finalize()),
            Running::Sha384(h) => format!("{:X}", h.finalize()),
            Running::Sha512(h) => format!("{:X}", h.finalize()),
        }
    }
}

impl Sha2Hasher {
    fn hash_file(path: &Path, algorithms: &[HashAlgorithm]) -> Result<Digests, HashError> {
        let mut file = File::open(path).map_err(|e| HashError::io(path, e))?;
        let mut hashers: Vec<(HashAlgorithm, Running)> =
            algorithms.iter().map(|a| (*a, Running::new(*a))).collect();
        let mut buf = vec![0u8; READ_BUFFER_SIZE];
        loop {
            let n = file.read(&mut buf).map_err(|e| HashError::io(path, e))?;
            if n == 0 {
                break;
            }
            for (_, h) in hashers.iter_mut() {
                h.update(&buf[..n]);
            }
        }
        Ok(hashers
            .into_iter()
            .map(|(alg, h)| (alg, h.finalize_hex()))
            .collect())
    }

    fn hash_folder(root: &Path, algorithms: &[HashAlgorithm]) -> Result<Digests, HashError> {
        let mut outer: Vec<(HashAlgorithm, Running)> =
            algorithms.iter().map(|a| (*a, Running::new(*a))).collect();
        for entry in WalkDir::new(root).sort_by_file_name() {
            let entry = entry.map_err(|e| {
                let path = e.path().unwrap_or(root).to_path_buf();
                HashError::io(&path, e.into())
            })?;
            if !entry.file_type().is_file() {
                continue;
            }
            let rel = relative_name(root, entry.path());
            let file_digests = Self::hash_file(entry.path(), algorithms)?;
            for (alg, h) in outer.iter_mut() {
                h.update(rel.as_bytes());
                h.update(b"\0");
                h.update(file_digests.get(*alg).unwrap_or_default().as_bytes());
                h.update(b"\n");
            }
        }
        Ok(outer
            .into_iter()
            .map(|(alg, h)| (alg, h.finalize_hex()))
            .collect())
    }
}

/// `/`-separated path of `path` below `root`.
pub(crate) fn relative_name(root: &Path, path: &Path) -> String {
    path.strip_prefix(root)
        .unwrap_or(path)
        .components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

impl ContentHasher for Sha2Hasher {
    fn calculate(&self, path: &Path, algorithms: &[HashAlgorithm]) -> Result<Digests, HashError> {
        if algorithms.is_empty() {
            return Err(HashError::NoAlgorithms);
        }
        let meta = std::fs::metadata(path).map_err(|e| HashError::io(path, e))?;
        if meta.is_dir() {
            Self::hash_folder(path, algorithms)
        } else {
            Self::hash_file(path, algorithms)
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
