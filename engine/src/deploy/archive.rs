//! ZIP archive extraction

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::errors::EngineError;

/// Local file header signature every ZIP archive starts with
pub const ZIP_MAGIC: &[u8] = b"PK\x03\x04";

/// True if `bytes` start like a ZIP archive
pub fn looks_like_zip(bytes: &[u8]) -> bool {
    bytes.starts_with(ZIP_MAGIC)
}

/// Unpack `archive` into `dest` off the async executor.
///
/// Returns the number of entries written. Entries whose names would land
/// outside `dest` are rejected.
pub async fn extract(archive: &Path, dest: &Path) -> Result<usize, EngineError> {
    let archive = archive.to_path_buf();
    let dest = dest.to_path_buf();
    tokio::task::spawn_blocking(move || extract_blocking(&archive, &dest))
        .await
        .map_err(|e| EngineError::Internal(format!("Extraction task failed: {}", e)))?
}

fn extract_blocking(archive: &Path, dest: &Path) -> Result<usize, EngineError> {
    let file = fs::File::open(archive)?;
    let mut zip = zip::ZipArchive::new(io::BufReader::new(file))
        .map_err(|e| EngineError::InvalidArchive(e.to_string()))?;

    fs::create_dir_all(dest)?;
    for i in 0..zip.len() {
        let mut entry = zip
            .by_index(i)
            .map_err(|e| EngineError::InvalidArchive(e.to_string()))?;
        let Some(relative) = entry.enclosed_name() else {
            return Err(EngineError::InvalidArchive(format!(
                "Entry '{}' escapes the extraction directory",
                entry.name()
            )));
        };
        let out_path = dest.join(relative);

        if entry.is_dir() {
            fs::create_dir_all(&out_path)?;
            continue;
        }
        if let Some(parent) = out_path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut out = fs::File::create(&out_path)?;
        io::copy(&mut entry, &mut out)
            .map_err(|e| EngineError::InvalidArchive(format!("{}: {}", entry.name(), e)))?;
    }

    debug!("Extracted {} entries into {}", zip.len(), dest.display());
    Ok(zip.len())
}

/// Project root of an extracted tree.
///
/// A single top-level directory is unwrapped; anything else means the
/// extraction root itself is the project.
pub async fn project_root(extracted: &Path) -> Result<PathBuf, EngineError> {
    let mut entries = tokio::fs::read_dir(extracted).await?;
    let mut first = None;
    let mut count = 0;
    while let Some(entry) = entries.next_entry().await? {
        count += 1;
        if count > 1 {
            return Ok(extracted.to_path_buf());
        }
        first = Some(entry);
    }

    match first {
        Some(entry) if entry.file_type().await?.is_dir() => Ok(entry.path()),
        _ => Ok(extracted.to_path_buf()),
    }
}
