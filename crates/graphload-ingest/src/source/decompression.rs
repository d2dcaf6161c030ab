//! Turns a raw source into a single decompressed byte stream
//!
//! # Supported Formats
//!
//! - **none**: the raw bytes
//! - **gzip** (.gz): streamed through flate2, multi-member files included
//! - **zip** (.zip): exactly one entry is selected and decompressed
//!
//! Zip needs random access, so a non-seekable input is spooled to an
//! anonymous temporary file first and the selected entry is decompressed into
//! a second one. Nothing is held in memory beyond the copy buffers.
//!
//! Everything here blocks; callers run it on the blocking pool.

use flate2::read::MultiGzDecoder;
use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::path::PathBuf;
use tracing::debug;

use super::{ByteStream, OpenError};
use crate::config::Compression;

/// Source bytes before decompression
pub enum RawSource {
    /// Local file, opened lazily on the blocking pool
    Path(PathBuf),
    /// Remote body bridged to a blocking reader
    Reader(ByteStream),
}

/// Rules for picking the entry of a zip archive
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EntrySelector {
    /// `archiveEntry` from the source spec
    pub configured: Option<String>,
    /// File name of the archive without its `.zip` suffix
    pub logical_name: Option<String>,
}

/// Open `raw` and undo `compression`
pub fn decode(
    raw: RawSource,
    compression: Compression,
    selector: &EntrySelector,
    location: &str,
) -> Result<ByteStream, OpenError> {
    match compression {
        Compression::None => open_raw(raw, location),
        Compression::Gzip => {
            let inner = open_raw(raw, location)?;
            debug!(location, "Streaming gzip source");
            Ok(Box::new(MultiGzDecoder::new(inner)))
        },
        Compression::Zip => open_zip_entry(raw, selector, location),
    }
}

fn open_raw(raw: RawSource, location: &str) -> Result<ByteStream, OpenError> {
    match raw {
        RawSource::Path(path) => Ok(Box::new(open_file(&path, location)?)),
        RawSource::Reader(reader) => Ok(reader),
    }
}

fn open_file(path: &PathBuf, location: &str) -> Result<File, OpenError> {
    File::open(path).map_err(|e| {
        if e.kind() == io::ErrorKind::NotFound {
            OpenError::NotFound(location.to_string())
        } else {
            OpenError::io(location, e)
        }
    })
}

fn open_zip_entry(
    raw: RawSource,
    selector: &EntrySelector,
    location: &str,
) -> Result<ByteStream, OpenError> {
    let file = match raw {
        RawSource::Path(path) => open_file(&path, location)?,
        RawSource::Reader(mut reader) => {
            let mut spool = tempfile::tempfile().map_err(|e| OpenError::io(location, e))?;
            let copied = io::copy(&mut reader, &mut spool).map_err(|e| OpenError::io(location, e))?;
            spool
                .seek(SeekFrom::Start(0))
                .map_err(|e| OpenError::io(location, e))?;
            debug!(location, bytes = copied, "Spooled remote zip archive");
            spool
        },
    };

    let mut archive = zip::ZipArchive::new(file).map_err(|e| OpenError::Corrupt {
        location: location.to_string(),
        reason: format!("not a readable zip archive: {}", e),
    })?;

    // headers only: entries that are not chosen are never decrypted or inflated
    let mut entries = Vec::new();
    for i in 0..archive.len() {
        let entry = archive.by_index_raw(i).map_err(|e| OpenError::Corrupt {
            location: location.to_string(),
            reason: format!("cannot read zip entry {}: {}", i, e),
        })?;
        if !entry.is_dir() {
            entries.push((i, entry.name().to_string()));
        }
    }

    let index = select_entry(&entries, selector, location)?;

    let mut entry = archive.by_index(index).map_err(|e| OpenError::Corrupt {
        location: location.to_string(),
        reason: format!("cannot read zip entry {}: {}", index, e),
    })?;
    let mut out = tempfile::tempfile().map_err(|e| OpenError::io(location, e))?;
    let size = io::copy(&mut entry, &mut out).map_err(|e| OpenError::io(location, e))?;
    out.seek(SeekFrom::Start(0))
        .map_err(|e| OpenError::io(location, e))?;
    debug!(location, entry = entry.name(), bytes = size, "Extracted zip entry");

    Ok(Box::new(out))
}

/// Pick one `(index, name)` out of the archive's file entries
pub(crate) fn select_entry(
    entries: &[(usize, String)],
    selector: &EntrySelector,
    location: &str,
) -> Result<usize, OpenError> {
    let base_name = |name: &str| name.rsplit('/').next().unwrap_or(name).to_string();

    if let Some(wanted) = &selector.configured {
        return entries
            .iter()
            .find(|(_, name)| name == wanted || base_name(name) == *wanted)
            .map(|(i, _)| *i)
            .ok_or_else(|| OpenError::EntrySelection {
                location: location.to_string(),
                reason: format!("archive has no entry named '{}'", wanted),
            });
    }

    match entries {
        [] => Err(OpenError::EntrySelection {
            location: location.to_string(),
            reason: "archive contains no files".to_string(),
        }),
        [(i, _)] => Ok(*i),
        _ => {
            if let Some(logical) = &selector.logical_name {
                if let Some((i, _)) = entries.iter().find(|(_, name)| base_name(name) == *logical) {
                    return Ok(*i);
                }
            }
            let names: Vec<&str> = entries.iter().map(|(_, name)| name.as_str()).collect();
            Err(OpenError::EntrySelection {
                location: location.to_string(),
                reason: format!(
                    "archive holds {} files ({}); set archiveEntry to choose one",
                    names.len(),
                    names.join(", ")
                ),
            })
        },
    }
}
