use std::io::SeekFrom;
use std::path::Path;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::sync::Mutex;

use super::range_reader::{check_range, RangeReader};
use crate::error::IoError;

/// Local-filesystem implementation of RangeReader.
///
/// The file size is captured once on open. Reads seek and read under a
/// mutex, so one handle may be shared between tasks.
pub struct LocalFileReader {
    file: Mutex<File>,
    size: u64,
    identifier: String,
}

impl LocalFileReader {
    /// Open `path` for ranged reads.
    ///
    /// Returns `IoError::NotFound` if the file does not exist.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, IoError> {
        let path = path.as_ref();
        let file = File::open(path).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                IoError::NotFound(path.display().to_string())
            } else {
                IoError::Io(format!("{}: {}", path.display(), e))
            }
        })?;
        let size = file.metadata().await?.len();

        Ok(Self {
            file: Mutex::new(file),
            size,
            identifier: path.display().to_string(),
        })
    }
}

#[async_trait]
impl RangeReader for LocalFileReader {
    async fn read_exact_at(&self, offset: u64, len: usize) -> Result<Bytes, IoError> {
        check_range(offset, len, self.size)?;

        let mut buf = vec![0u8; len];
        let mut file = self.file.lock().await;
        file.seek(SeekFrom::Start(offset)).await?;
        file.read_exact(&mut buf).await?;

        Ok(Bytes::from(buf))
    }

    fn size(&self) -> u64 {
        self.size
    }

    fn identifier(&self) -> &str {
        &self.identifier
    }
}
