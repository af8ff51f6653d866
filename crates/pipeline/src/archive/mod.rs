//! Deterministic archive encoding and decoding.
//!
//! [`SealedTarArchiver`] writes a gzip-compressed tar of a file or folder,
//! optionally sealed with a password (see [`seal`]). Entries are added in
//! sorted order with normalised headers, so the same content always produces
//! byte-identical archives.

pub mod seal;

use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Component, Path, PathBuf};

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use tar::{Archive, Builder, HeaderMode};
use walkdir::WalkDir;

use self::seal::{KeyStrength, SealReader, SealWriter, MAGIC};
use crate::hashing::relative_name;

pub const ARCHIVE_EXTENSION: &str = "tar.gz";
pub const SEALED_EXTENSION: &str = "tar.gz.sealed";

#[derive(Debug, thiserror::Error)]
pub enum ArchiveError {
    #[error("Archive source not found: {0}")]
    SourceNotFound(PathBuf),

    #[error("Archive is sealed but no password was supplied")]
    PasswordRequired,

    #[error("Archive I/O failed on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Archive is corrupt: {0}")]
    Corrupt(String),
}

impl ArchiveError {
    fn io(path: &Path, source: std::io::Error) -> Self {
        match source.kind() {
            std::io::ErrorKind::InvalidData => ArchiveError::Corrupt(source.to_string()),
            _ => ArchiveError::Io {
                path: path.to_path_buf(),
                source,
            },
        }
    }
}

/// Encodes items into single-file archives and back. Implementations are
/// blocking.
pub trait Archiver: Send + Sync {
    /// Write an archive of `source` into `target_dir`; returns its path.
    fn encode(
        &self,
        source: &Path,
        target_dir: &Path,
        password: Option<&str>,
    ) -> Result<PathBuf, ArchiveError>;

    /// Extract `archive` into `target_dir`; returns the extracted root.
    fn decode(
        &self,
        archive: &Path,
        target_dir: &Path,
        password: Option<&str>,
    ) -> Result<PathBuf, ArchiveError>;
}

// ---------------------------------------------------------------------------
// SealedTarArchiver
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy)]
pub struct SealedTarArchiver {
    /// gzip level, 0-9.
    pub level: u32,
    pub key_strength: KeyStrength,
}

impl Default for SealedTarArchiver {
    fn default() -> Self {
        Self {
            level: 6,
            key_strength: KeyStrength::default(),
        }
    }
}

/// Archive file name for an item named `name`.
pub fn archive_file_name(name: &str, sealed: bool) -> String {
    let ext = if sealed {
        SEALED_EXTENSION
    } else {
        ARCHIVE_EXTENSION
    };
    format!("{name}.{ext}")
}

impl SealedTarArchiver {
    fn write_tar<W: Write>(&self, source: &Path, name: &str, out: W) -> std::io::Result<W> {
        let gz = GzEncoder::new(out, Compression::new(self.level.min(9)));
        let mut builder = Builder::new(gz);
        builder.mode(HeaderMode::Deterministic);
        builder.follow_symlinks(false);

        if source.is_dir() {
            builder.append_dir(name, source)?;
            for entry in WalkDir::new(source).min_depth(1).sort_by_file_name() {
                let entry = entry?;
                let entry_name = format!("{name}/{}", relative_name(source, entry.path()));
                let file_type = entry.file_type();
                if file_type.is_dir() {
                    builder.append_dir(&entry_name, entry.path())?;
                } else if file_type.is_file() {
                    builder.append_path_with_name(entry.path(), &entry_name)?;
                }
            }
        } else {
            builder.append_path_with_name(source, name)?;
        }

        builder.into_inner()?.finish()
    }

    fn encode_to(&self, source: &Path, name: &str, partial: &Path, password: Option<&str>) -> std::io::Result<()> {
        let file = BufWriter::new(File::create(partial)?);
        let file = match password {
            Some(pw) => {
                let sealer = SealWriter::new(file, pw, self.key_strength)?;
                self.write_tar(source, name, sealer)?.finish()?
            }
            None => self.write_tar(source, name, file)?,
        };
        file.into_inner()
            .map_err(|e| e.into_error())?
            .sync_all()
    }

    fn unpack<R: Read>(reader: R, target_dir: &Path) -> Result<PathBuf, ArchiveError> {
        let mut archive = Archive::new(GzDecoder::new(reader));
        let mut root: Option<PathBuf> = None;
        let entries = archive
            .entries()
            .map_err(|e| ArchiveError::io(target_dir, e))?;
        for entry in entries {
            let mut entry = entry.map_err(|e| ArchiveError::io(target_dir, e))?;
            if root.is_none() {
                let path = entry.path().map_err(|e| ArchiveError::io(target_dir, e))?;
                match path.components().next() {
                    Some(Component::Normal(first)) => root = Some(target_dir.join(first)),
                    _ => return Err(ArchiveError::Corrupt(format!("unexpected entry {}", path.display()))),
                }
            }
            entry
                .unpack_in(target_dir)
                .map_err(|e| ArchiveError::io(target_dir, e))?;
        }
        root.ok_or_else(|| ArchiveError::Corrupt("archive has no entries".into()))
    }
}

impl Archiver for SealedTarArchiver {
    fn encode(
        &self,
        source: &Path,
        target_dir: &Path,
        password: Option<&str>,
    ) -> Result<PathBuf, ArchiveError> {
        if !source.exists() {
            return Err(ArchiveError::SourceNotFound(source.to_path_buf()));
        }
        let name = source
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| ArchiveError::SourceNotFound(source.to_path_buf()))?;
        std::fs::create_dir_all(target_dir).map_err(|e| ArchiveError::io(target_dir, e))?;

        let target = target_dir.join(archive_file_name(&name, password.is_some()));
        let partial = target_dir.join(format!(".{name}.partial"));
        if let Err(e) = self.encode_to(source, &name, &partial, password) {
            let _ = std::fs::remove_file(&partial);
            return Err(ArchiveError::io(source, e));
        }
        std::fs::rename(&partial, &target).map_err(|e| ArchiveError::io(&target, e))?;

        tracing::debug!(source = %source.display(), archive = %target.display(), "Archive written");
        Ok(target)
    }

    fn decode(
        &self,
        archive: &Path,
        target_dir: &Path,
        password: Option<&str>,
    ) -> Result<PathBuf, ArchiveError> {
        let mut file = BufReader::new(File::open(archive).map_err(|e| ArchiveError::io(archive, e))?);
        std::fs::create_dir_all(target_dir).map_err(|e| ArchiveError::io(target_dir, e))?;

        let mut head = [0u8; MAGIC.len()];
        let n = read_up_to(&mut file, &mut head).map_err(|e| ArchiveError::io(archive, e))?;
        if n == MAGIC.len() && &head == MAGIC {
            let password = password.ok_or(ArchiveError::PasswordRequired)?;
            let reader = SealReader::new(file, password).map_err(|e| ArchiveError::io(archive, e))?;
            Self::unpack(reader, target_dir)
        } else {
            Self::unpack(std::io::Cursor::new(head[..n].to_vec()).chain(file), target_dir)
        }
    }
}

fn read_up_to<R: Read>(reader: &mut R, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..])? {
            0 => break,
            n => filled += n,
        }
    }
    Ok(filled)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
