use async_trait::async_trait;
use std::io;
use std::path::{Path, PathBuf};

/// Random-access bytes to upload
///
/// Implementations must allow concurrent, non-overlapping range reads.
#[async_trait]
pub trait ByteSource: Send + Sync {
    /// Total number of bytes
    fn size(&self) -> u64;

    /// Read exactly `length` bytes starting at `offset`
    async fn read_range(&self, offset: u64, length: u64) -> io::Result<Vec<u8>>;
}

/// A local file read with positioned reads
///
/// Each read opens its own handle on a blocking thread, so parts can be read
/// concurrently without sharing a cursor.
#[derive(Debug, Clone)]
pub struct FileSource {
    path: PathBuf,
    size: u64,
}

impl FileSource {
    pub async fn open(path: impl AsRef<Path>) -> io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let metadata = tokio::fs::metadata(&path).await?;
        if !metadata.is_file() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("{} is not a regular file", path.display()),
            ));
        }

        Ok(Self {
            path,
            size: metadata.len(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl ByteSource for FileSource {
    fn size(&self) -> u64 {
        self.size
    }

    async fn read_range(&self, offset: u64, length: u64) -> io::Result<Vec<u8>> {
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || {
            let mut dst = vec![0u8; length as usize];
            file_util::read_file_chunk_sync(&mut dst, path, offset)?;
            Ok::<_, io::Error>(dst)
        })
        .await
        .map_err(io::Error::other)?
    }
}

#[async_trait]
impl ByteSource for Vec<u8> {
    fn size(&self) -> u64 {
        self.len() as u64
    }

    async fn read_range(&self, offset: u64, length: u64) -> io::Result<Vec<u8>> {
        let start = offset as usize;
        let end = start.saturating_add(length as usize);
        self.get(start..end).map(<[u8]>::to_vec).ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("range {}..{} is beyond {} bytes", start, end, self.len()),
            )
        })
    }
}

mod file_util {
    #[cfg(unix)]
    pub(super) use unix::read_file_chunk_sync;
    #[cfg(not(unix))]
    pub(super) use portable::read_file_chunk_sync;

    #[cfg(unix)]
    mod unix {
        use std::fs::File;
        use std::io;
        use std::os::unix::fs::FileExt;
        use std::path::Path;

        pub(crate) fn read_file_chunk_sync(
            dst: &mut [u8],
            path: impl AsRef<Path>,
            offset: u64,
        ) -> io::Result<()> {
            let file = File::open(path)?;
            file.read_exact_at(dst, offset)
        }
    }

    #[cfg(not(unix))]
    mod portable {
        use std::fs::File;
        use std::io::{self, Read, Seek, SeekFrom};
        use std::path::Path;

        pub(crate) fn read_file_chunk_sync(
            dst: &mut [u8],
            path: impl AsRef<Path>,
            offset: u64,
        ) -> io::Result<()> {
            let mut file = File::open(path)?;
            file.seek(SeekFrom::Start(offset))?;
            file.read_exact(dst)
        }
    }
}
