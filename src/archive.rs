//! ZIP archive I/O and the on-disk tree
//!
//! Books are unpacked into a directory tree before they are edited. This
//! module reads EPUB ZIPs (falling back to a scan of the local file headers
//! when the central directory is damaged), writes them back with the
//! `mimetype` entry stored first, and manages hard-linked clones of the tree
//! together with the copy-on-write protocol that keeps them isolated.

use std::{
    fs::{self, File},
    io::{self, Read, Write},
    path::Path,
};

use flate2::read::DeflateDecoder;
use log::{debug, warn};
use tempfile::NamedTempFile;
use walkdir::WalkDir;
use zip::{CompressionMethod, ZipArchive, ZipWriter, write::FileOptions};

use crate::{
    error::EpubError,
    names::{name_to_path, nfc},
    types::EPUB_MIME,
};

const LOCAL_HEADER_SIGNATURE: u32 = 0x04034b50;
const DATA_DESCRIPTOR_SIGNATURE: u32 = 0x08074b50;
const LOCAL_HEADER_SIZE: usize = 30;

/// Upper bound for buffers sized from lengths declared inside a book
pub(crate) const MAX_PREALLOCATION: usize = 64 * 1024 * 1024;

/// The capacity to reserve for data whose declared length is `size`
pub(crate) fn preallocation(size: u64) -> usize {
    usize::try_from(size).map_or(MAX_PREALLOCATION, |size| size.min(MAX_PREALLOCATION))
}

/// Returns true when `bytes` start like a ZIP archive
pub fn is_zip_signature(bytes: &[u8]) -> bool {
    bytes.starts_with(b"PK\x03\x04") || bytes.starts_with(b"PK\x05\x06")
}

/// Reads up to the first 68 bytes of a file, enough to tell ZIP, MOBI and Topaz apart
pub fn read_signature(path: &Path) -> Result<Vec<u8>, EpubError> {
    let mut buffer = Vec::with_capacity(68);
    File::open(path)?.take(68).read_to_end(&mut buffer)?;
    Ok(buffer)
}

/// Extracts a ZIP archive into `dest`
///
/// Entry names are sanitized into canonical names: backslashes become
/// slashes, empty and `.` segments are dropped, entries with `..` segments
/// are skipped, and names are normalized to NFC. When the central directory
/// cannot be read, the local file headers are scanned instead.
///
/// ## Return
/// - `Ok(Vec<String>)`: The canonical names of the extracted files
/// - `Err(EpubError::InvalidEpub)`: Nothing could be extracted
pub fn extract_zip(path: &Path, dest: &Path) -> Result<Vec<String>, EpubError> {
    let names = match extract_with_central_directory(path, dest) {
        Ok(names) => names,
        Err(err) => {
            warn!(
                "Unable to read the central directory of {}: {}, scanning local headers",
                path.display(),
                err
            );
            let data = fs::read(path)?;
            extract_local_headers(&data, dest)?
        }
    };

    if names.is_empty() {
        return Err(EpubError::InvalidEpub {
            reason: format!("{} contains no usable files", path.display()),
        });
    }

    debug!("Extracted {} files from {}", names.len(), path.display());
    Ok(names)
}

fn extract_with_central_directory(path: &Path, dest: &Path) -> Result<Vec<String>, EpubError> {
    let mut archive = ZipArchive::new(File::open(path)?)?;
    let mut names = Vec::with_capacity(archive.len());

    for index in 0..archive.len() {
        let mut file = archive.by_index(index)?;
        let Some(name) = sanitize_entry_name(file.name()) else {
            warn!("Skipping unsafe archive entry {:?}", file.name());
            continue;
        };

        if file.is_dir() {
            fs::create_dir_all(name_to_path(&name, dest))?;
            continue;
        }

        let mut data = Vec::with_capacity(preallocation(file.size()));
        file.read_to_end(&mut data)?;
        write_new_file(dest, &name, &data)?;
        names.push(name);
    }

    Ok(names)
}

/// Recovers files from an archive by walking its local file headers
fn extract_local_headers(data: &[u8], dest: &Path) -> Result<Vec<String>, EpubError> {
    let mut names = Vec::new();
    let mut position = 0;

    while let Some(offset) = find_signature(data, position, LOCAL_HEADER_SIGNATURE) {
        let header = &data[offset..];
        if header.len() < LOCAL_HEADER_SIZE {
            break;
        }

        let flags = read_u16(header, 6);
        let method = read_u16(header, 8);
        let compressed_size = read_u32(header, 18) as usize;
        let name_length = read_u16(header, 26) as usize;
        let extra_length = read_u16(header, 28) as usize;

        let start = offset + LOCAL_HEADER_SIZE + name_length + extra_length;
        if start > data.len() {
            break;
        }

        let raw_name = String::from_utf8_lossy(
            &data[offset + LOCAL_HEADER_SIZE..offset + LOCAL_HEADER_SIZE + name_length],
        )
        .into_owned();

        let has_descriptor = flags & 0x08 != 0 && compressed_size == 0;
        let end = if has_descriptor {
            find_signature(data, start, LOCAL_HEADER_SIGNATURE).unwrap_or(data.len())
        } else {
            (start + compressed_size).min(data.len())
        };
        position = end.max(offset + 1);

        let Some(name) = sanitize_entry_name(&raw_name) else {
            continue;
        };
        if raw_name.ends_with('/') {
            fs::create_dir_all(name_to_path(&name, dest))?;
            continue;
        }

        let contents = match method {
            0 if has_descriptor => {
                let payload = &data[start..end];
                strip_data_descriptor(payload).to_vec()
            }
            0 => data[start..end].to_vec(),
            8 => {
                let mut inflated = Vec::new();
                match DeflateDecoder::new(&data[start..end]).read_to_end(&mut inflated) {
                    Ok(_) => inflated,
                    Err(err) => {
                        warn!("Skipping damaged archive entry {}: {}", name, err);
                        continue;
                    }
                }
            }
            other => {
                warn!("Skipping archive entry {} with compression method {}", name, other);
                continue;
            }
        };

        write_new_file(dest, &name, &contents)?;
        names.push(name);
    }

    Ok(names)
}

fn strip_data_descriptor(payload: &[u8]) -> &[u8] {
    let tail = payload.len().saturating_sub(16);
    if payload.len() >= 16 && read_u32(&payload[tail..], 0) == DATA_DESCRIPTOR_SIGNATURE {
        return &payload[..tail];
    }
    let tail = payload.len().saturating_sub(12);
    &payload[..tail]
}

fn find_signature(data: &[u8], from: usize, signature: u32) -> Option<usize> {
    let pattern = signature.to_le_bytes();
    data.get(from..)?
        .windows(4)
        .position(|window| window == pattern)
        .map(|index| from + index)
}

fn read_u16(data: &[u8], offset: usize) -> u16 {
    u16::from_le_bytes([data[offset], data[offset + 1]])
}

fn read_u32(data: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes([
        data[offset],
        data[offset + 1],
        data[offset + 2],
        data[offset + 3],
    ])
}

/// Turns an archive entry name into a canonical name, or `None` when it escapes the root
fn sanitize_entry_name(raw: &str) -> Option<String> {
    let mut segments = Vec::new();
    for segment in raw.split(['/', '\\']) {
        match segment {
            "" | "." => continue,
            ".." => return None,
            segment => segments.push(segment),
        }
    }

    if segments.is_empty() {
        return None;
    }
    Some(nfc(&segments.join("/")))
}

fn write_new_file(root: &Path, name: &str, data: &[u8]) -> Result<(), EpubError> {
    let path = name_to_path(name, root);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, data)?;
    Ok(())
}

/// Writes an EPUB archive
///
/// The `mimetype` entry is always written first, uncompressed, with the
/// content `application/epub+zip`. Every other name is deflated, in sorted
/// order, with the bytes supplied by `read`. The archive is written to a
/// temporary file next to `output` and moved into place when complete.
///
/// ## Parameters
/// - `names`: The canonical names to write; `mimetype` among them is ignored
/// - `output`: The path of the archive to create or replace
/// - `compression_level`: The deflate level, `None` for the default
/// - `read`: Supplies the bytes of a name
pub fn write_epub_zip(
    names: &[String],
    output: &Path,
    compression_level: Option<i64>,
    mut read: impl FnMut(&str) -> Result<Vec<u8>, EpubError>,
) -> Result<(), EpubError> {
    let parent = match output.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    fs::create_dir_all(parent)?;

    let temp = NamedTempFile::new_in(parent)?;
    let mut zip = ZipWriter::new(temp.reopen()?);

    let stored = FileOptions::<()>::default().compression_method(CompressionMethod::Stored);
    zip.start_file("mimetype", stored)?;
    zip.write_all(EPUB_MIME.as_bytes())?;

    let deflated = FileOptions::<()>::default()
        .compression_method(CompressionMethod::Deflated)
        .compression_level(compression_level);

    let mut sorted = names
        .iter()
        .filter(|name| name.as_str() != "mimetype")
        .collect::<Vec<_>>();
    sorted.sort();

    for name in sorted {
        let data = read(name)?;
        zip.start_file(name.as_str(), deflated)?;
        zip.write_all(&data)?;
    }

    zip.finish()?;
    temp.persist(output).map_err(|err| err.error)?;
    debug!("Wrote {}", output.display());
    Ok(())
}

/// Recreates `src` under `dest` with hard links
///
/// Regular files are hard-linked, falling back to a byte copy when linking
/// fails (for example across filesystems); directories are created fresh.
pub fn clone_dir(src: &Path, dest: &Path) -> Result<(), EpubError> {
    fs::create_dir_all(dest)?;

    for entry in WalkDir::new(src).min_depth(1) {
        let entry = entry?;
        let relative = entry.path().strip_prefix(src).unwrap_or(entry.path());
        let target = dest.join(relative);

        if entry.file_type().is_dir() {
            fs::create_dir_all(&target)?;
        } else if entry.file_type().is_file() {
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent)?;
            }
            if let Err(err) = fs::hard_link(entry.path(), &target) {
                debug!("Copying {} instead of linking: {}", entry.path().display(), err);
                fs::copy(entry.path(), &target)?;
            }
        }
    }

    Ok(())
}

#[cfg(unix)]
fn is_shared(path: &Path) -> io::Result<bool> {
    use std::os::unix::fs::MetadataExt;
    Ok(fs::metadata(path)?.nlink() > 1)
}

#[cfg(not(unix))]
fn is_shared(_path: &Path) -> io::Result<bool> {
    // link counts are not portable; treat every file of a clone as shared
    Ok(true)
}

#[cfg(windows)]
fn remove_with_retry(path: &Path) -> io::Result<()> {
    let mut attempt = 0;
    loop {
        match fs::remove_file(path) {
            Ok(()) => return Ok(()),
            Err(err) if attempt < 10 && err.kind() != io::ErrorKind::NotFound => {
                attempt += 1;
                std::thread::sleep(std::time::Duration::from_millis(50));
            }
            Err(err) => return Err(err),
        }
    }
}

#[cfg(not(windows))]
fn remove_with_retry(path: &Path) -> io::Result<()> {
    fs::remove_file(path)
}

/// Breaks the hard link between `path` and any other clone
///
/// When the file is shared, it is copied to a temporary sibling, the shared
/// file is unlinked and the copy is renamed over it. Other clones keep seeing
/// the original bytes.
pub fn decouple(path: &Path) -> Result<(), EpubError> {
    if !path.is_file() || !is_shared(path)? {
        return Ok(());
    }

    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    let temp = NamedTempFile::new_in(parent)?;
    fs::copy(path, temp.path())?;
    remove_with_retry(path)?;
    temp.persist(path).map_err(|err| err.error)?;
    Ok(())
}

/// Writes the bytes of a file, decoupling it first when it may be shared with a clone
pub fn write_file(path: &Path, data: &[u8], cloned: bool) -> Result<(), EpubError> {
    if cloned {
        decouple(path)?;
    }
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }

    let mut file = File::create(path)?;
    file.write_all(data)?;
    Ok(())
}

/// Removes the empty directories between the parent of `path` and `root`
pub fn remove_empty_dirs(path: &Path, root: &Path) {
    let mut current = path.parent();
    while let Some(dir) = current {
        if dir == root || !dir.starts_with(root) {
            break;
        }
        let is_empty = fs::read_dir(dir)
            .map(|mut entries| entries.next().is_none())
            .unwrap_or(false);
        if !is_empty || fs::remove_dir(dir).is_err() {
            break;
        }
        current = dir.parent();
    }
}
