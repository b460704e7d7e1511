//! The append-only commit archive container.
//!
//! A build's versioned commit ships as a tar archive holding the commit
//! repository objects at content-addressed paths. Accepting a signature
//! appends the detached metadata object; existing entries are never
//! modified or removed. The updated archive is assembled in a scratch file
//! next to the original and renamed over it, keeping the original
//! permissions.

use std::fs::File;
use std::io::{Read, Write};
use std::path::Path;

use tar::{Archive, Builder, Header};

use crate::error::{Result, SignError};

/// Read one entry's bytes out of the archive.
///
/// # Errors
///
/// [`SignError::Io`] when the archive is unreadable or has no entry named
/// `entry_name`.
pub fn read_entry(archive_path: &Path, entry_name: &str) -> Result<Vec<u8>> {
    let mut archive = Archive::new(File::open(archive_path)?);
    for entry in archive.entries()? {
        let mut entry = entry?;
        if entry.path()?.as_ref() == Path::new(entry_name) {
            let mut bytes = Vec::new();
            entry.read_to_end(&mut bytes)?;
            return Ok(bytes);
        }
    }
    Err(SignError::Io(std::io::Error::new(
        std::io::ErrorKind::NotFound,
        format!("no entry '{entry_name}' in '{}'", archive_path.display()),
    )))
}

/// Append `bytes` as `entry_name`, atomically.
///
/// The whole container is re-assembled in a scratch file in the archive's
/// directory (existing entries copied through unchanged, the new entry
/// appended last) and renamed over the original with its permissions
/// carried over.
///
/// # Errors
///
/// [`SignError::Io`] on read, assembly, or rename failure.
pub fn append_entry(archive_path: &Path, entry_name: &str, bytes: &[u8]) -> Result<()> {
    let dir = archive_path
        .parent()
        .ok_or_else(|| SignError::Io(std::io::Error::other("archive path has no parent")))?;
    let original_perms = std::fs::metadata(archive_path)?.permissions();

    let scratch = tempfile::NamedTempFile::new_in(dir)?;
    {
        let mut builder = Builder::new(scratch.as_file());
        let mut existing = Archive::new(File::open(archive_path)?);
        for entry in existing.entries()? {
            let mut entry = entry?;
            let mut header = entry.header().clone();
            let path = entry.path()?.into_owned();
            let mut data = Vec::new();
            entry.read_to_end(&mut data)?;
            builder.append_data(&mut header, path, data.as_slice())?;
        }

        let mut header = Header::new_gnu();
        header.set_size(bytes.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder.append_data(&mut header, entry_name, bytes)?;
        builder.finish()?;
    }
    scratch.as_file().flush()?;
    std::fs::set_permissions(scratch.path(), original_perms)?;
    scratch
        .persist(archive_path)
        .map_err(|e| SignError::Io(e.error))?;
    Ok(())
}

/// Create a fresh archive containing the given entries. Used by tests and
/// by build tooling that seeds the container.
///
/// # Errors
///
/// [`SignError::Io`] on write failure.
pub fn create(archive_path: &Path, entries: &[(&str, &[u8])]) -> Result<()> {
    let file = File::create(archive_path)?;
    let mut builder = Builder::new(file);
    for (name, bytes) in entries {
        let mut header = Header::new_gnu();
        header.set_size(bytes.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder.append_data(&mut header, name, *bytes)?;
    }
    builder.finish()?;
    Ok(())
}
