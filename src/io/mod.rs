mod local_reader;
mod range_reader;

pub use local_reader::LocalFileReader;
pub use range_reader::{MemoryReader, RangeReader};

use std::path::Path;

/// Total size in bytes of a file, or of every file below a directory.
pub async fn path_size(path: &Path) -> Result<u64, crate::error::IoError> {
    let meta = tokio::fs::metadata(path).await?;
    if !meta.is_dir() {
        return Ok(meta.len());
    }

    let mut total = 0u64;
    let mut pending = vec![path.to_path_buf()];
    while let Some(dir) = pending.pop() {
        let mut entries = tokio::fs::read_dir(&dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let meta = entry.metadata().await?;
            if meta.is_dir() {
                pending.push(entry.path());
            } else {
                total += meta.len();
            }
        }
    }
    Ok(total)
}

/// Remove a file or a directory tree, ignoring a path that is already gone.
pub fn remove_path(path: &Path) -> std::io::Result<()> {
    match std::fs::symlink_metadata(path) {
        Ok(meta) if meta.is_dir() => std::fs::remove_dir_all(path),
        Ok(_) => std::fs::remove_file(path),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}
