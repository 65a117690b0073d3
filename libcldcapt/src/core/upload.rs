use anyhow::Result as AnyResult;
use async_trait::async_trait;
use std::{
    io::SeekFrom,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};
use thiserror::Error;
use tokio::{
    fs::File,
    io::{AsyncRead, AsyncReadExt, AsyncSeekExt, AsyncWriteExt},
};

pub const DEFAULT_PART_THRESHOLD: u64 = 5 * 1024 * 1024 * 1024;
pub const DEFAULT_MAX_PARTS: u32 = 10_000;
pub const DEFAULT_MAX_OBJECT_BYTES: u64 = 5 * 1024 * 1024 * 1024 * 1024;

const FILL_CHUNK: usize = 128 * 1024;

/// Cooperative cancellation shared between the executor, the uploader and the
/// ctl signal handler. Checked between actions, between parts and between
/// stream reads; in-flight requests always complete.
#[derive(Clone, Debug, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// The object-store surface the uploader and executor consume. The body of
/// each request is a spill file positioned at the start with exactly
/// `length` readable bytes.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn put_object(&self, key: &str, body: File, length: u64) -> AnyResult<()>;
    async fn create_multipart(&self, key: &str) -> AnyResult<String>;
    async fn upload_part(
        &self,
        key: &str,
        upload_id: &str,
        part_number: i32,
        body: File,
        length: u64,
    ) -> AnyResult<String>;
    async fn complete_multipart(&self, key: &str, upload_id: &str, parts: &[(i32, String)]) -> AnyResult<()>;
    async fn abort_multipart(&self, key: &str, upload_id: &str) -> AnyResult<()>;
    async fn delete_objects(&self, keys: &[String]) -> AnyResult<()>;
}

#[derive(Error, Debug)]
pub enum UploadError {
    #[error("stream produced no data; refusing to create an empty backup object")]
    EmptyStream,
    #[error("stream exceeds the object size limit of {limit} bytes")]
    ObjectTooLarge { limit: u64 },
    #[error("upload cancelled")]
    Cancelled,
    #[error("spill buffering failed: {0}")]
    Spill(#[from] std::io::Error),
    #[error("object store request failed: {0:#}")]
    Store(#[source] anyhow::Error),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadStats {
    pub bytes: u64,
    /// `None` for a single-request PUT.
    pub parts: Option<u32>,
}

/// Ships one unbounded, non-seekable stream to a single object with the
/// minimum number of requests: buffer a prefix into spill storage, and only
/// open a multipart upload once the stream outlives the part threshold.
pub struct Uploader<'a, S: ObjectStore + ?Sized> {
    store: &'a S,
    part_threshold: u64,
    max_parts: u32,
    max_object_bytes: u64,
    spill_dir: Option<PathBuf>,
    cancel: CancelFlag,
}

impl<'a, S: ObjectStore + ?Sized> Uploader<'a, S> {
    pub fn new(store: &'a S) -> Self {
        Self {
            store,
            part_threshold: DEFAULT_PART_THRESHOLD,
            max_parts: DEFAULT_MAX_PARTS,
            max_object_bytes: DEFAULT_MAX_OBJECT_BYTES,
            spill_dir: None,
            cancel: CancelFlag::new(),
        }
    }

    pub fn part_threshold(mut self, bytes: u64) -> Self {
        self.part_threshold = bytes.max(1);
        self
    }

    pub fn max_parts(mut self, parts: u32) -> Self {
        self.max_parts = parts.max(1);
        self
    }

    pub fn max_object_bytes(mut self, bytes: u64) -> Self {
        self.max_object_bytes = bytes.max(1);
        self
    }

    pub fn spill_dir(mut self, dir: Option<PathBuf>) -> Self {
        self.spill_dir = dir;
        self
    }

    pub fn cancel_flag(mut self, cancel: CancelFlag) -> Self {
        self.cancel = cancel;
        self
    }

    pub async fn upload(
        &self,
        key: &str,
        mut stream: impl AsyncRead + Unpin + Send,
    ) -> Result<UploadStats, UploadError> {
        let mut spill = SpillBuffer::create(self.spill_dir.as_deref())?;

        match spill.fill(&mut stream, self.part_threshold, None, &self.cancel).await? {
            Fill::Eof(0) => Err(UploadError::EmptyStream),
            Fill::Eof(length) => {
                self.store
                    .put_object(key, spill.view().await?, length)
                    .await
                    .map_err(UploadError::Store)?;
                Ok(UploadStats {
                    bytes: length,
                    parts: None,
                })
            }
            Fill::Full(length, next) => {
                let upload_id = self
                    .store
                    .create_multipart(key)
                    .await
                    .map_err(UploadError::Store)?;
                match self
                    .drive_parts(key, &upload_id, &mut spill, &mut stream, length, next)
                    .await
                {
                    Ok(stats) => Ok(stats),
                    Err(error) => {
                        // Best effort; the original failure is what matters.
                        let _ = self.store.abort_multipart(key, &upload_id).await;
                        Err(error)
                    }
                }
            }
        }
    }

    async fn drive_parts(
        &self,
        key: &str,
        upload_id: &str,
        spill: &mut SpillBuffer,
        stream: &mut (impl AsyncRead + Unpin + Send),
        first_length: u64,
        first_carry: u8,
    ) -> Result<UploadStats, UploadError> {
        let mut parts: Vec<(i32, String)> = Vec::new();
        let mut part_length = first_length;
        let mut carry = Some(first_carry);
        let mut total = first_length;
        let mut at_eof = false;

        loop {
            if total > self.max_object_bytes {
                return Err(UploadError::ObjectTooLarge {
                    limit: self.max_object_bytes,
                });
            }
            let part_number = parts.len() as i32 + 1;
            if parts.len() as u32 + 1 > self.max_parts {
                return Err(UploadError::ObjectTooLarge {
                    limit: u64::from(self.max_parts) * self.part_threshold,
                });
            }
            let etag = self
                .store
                .upload_part(key, upload_id, part_number, spill.view().await?, part_length)
                .await
                .map_err(UploadError::Store)?;
            parts.push((part_number, etag));

            if at_eof {
                break;
            }
            if self.cancel.is_cancelled() {
                return Err(UploadError::Cancelled);
            }
            match spill
                .fill(stream, self.part_threshold, carry.take(), &self.cancel)
                .await?
            {
                Fill::Eof(0) => break,
                Fill::Eof(length) => {
                    part_length = length;
                    total += length;
                    at_eof = true;
                }
                Fill::Full(length, next) => {
                    part_length = length;
                    total += length;
                    carry = Some(next);
                }
            }
        }

        self.store
            .complete_multipart(key, upload_id, &parts)
            .await
            .map_err(UploadError::Store)?;
        Ok(UploadStats {
            bytes: total,
            parts: Some(parts.len() as u32),
        })
    }
}

enum Fill {
    /// Stream ended; the spill file holds this many bytes.
    Eof(u64),
    /// The limit was reached and at least one more byte exists; the byte is
    /// handed back so the next fill starts with it.
    Full(u64, u8),
}

/// An unlinked temporary file buffering one part of the stream, reclaimed by
/// the kernel on process exit.
struct SpillBuffer {
    file: File,
}

impl SpillBuffer {
    fn create(dir: Option<&Path>) -> Result<Self, UploadError> {
        let file = match dir {
            Some(dir) => tempfile::tempfile_in(dir)?,
            None => tempfile::tempfile()?,
        };
        Ok(Self {
            file: File::from_std(file),
        })
    }

    async fn fill(
        &mut self,
        stream: &mut (impl AsyncRead + Unpin + Send),
        limit: u64,
        carry: Option<u8>,
        cancel: &CancelFlag,
    ) -> Result<Fill, UploadError> {
        self.file.seek(SeekFrom::Start(0)).await?;
        self.file.set_len(0).await?;

        let mut written: u64 = 0;
        if let Some(byte) = carry {
            self.file.write_all(&[byte]).await?;
            written = 1;
        }

        let mut buffer = vec![0u8; FILL_CHUNK];
        while written < limit {
            if cancel.is_cancelled() {
                return Err(UploadError::Cancelled);
            }
            let want = (limit - written).min(buffer.len() as u64) as usize;
            let n = stream.read(&mut buffer[..want]).await?;
            if n == 0 {
                self.file.flush().await?;
                return Ok(Fill::Eof(written));
            }
            self.file.write_all(&buffer[..n]).await?;
            written += n as u64;
        }

        self.file.flush().await?;
        let mut probe = [0u8; 1];
        let n = stream.read(&mut probe).await?;
        if n == 0 {
            Ok(Fill::Eof(written))
        } else {
            Ok(Fill::Full(written, probe[0]))
        }
    }

    /// A fresh handle positioned at the start; the file holds exactly the
    /// bytes of the last fill.
    async fn view(&mut self) -> Result<File, UploadError> {
        let mut view = self.file.try_clone().await?;
        view.seek(SeekFrom::Start(0)).await?;
        Ok(view)
    }
}
