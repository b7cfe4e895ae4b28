use crate::metrics::{BYTES_READ_TOTAL, ROTATIONS_TOTAL};
use anyhow::{Context, Result};
use async_trait::async_trait;
use std::fs::Metadata;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tokio::fs::{self, File};
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tracing::{debug, info, warn};

pub const DEFAULT_MAX_READ_BYTES: usize = 8 * 1024 * 1024; // 8 MiB per call

/// Source of newly appended log bytes.
///
/// Every call hands back only bytes that no earlier call returned. Implementations own their
/// position tracking; callers never seek.
#[async_trait]
pub trait Tailer: Send {
    async fn next(&mut self) -> Result<Vec<u8>>;
}

/// Identifies the underlying file independent of the path it is reachable through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FileIdentity {
    device: u64,
    inode: u64,
}

impl FileIdentity {
    #[cfg(unix)]
    pub fn from_metadata(metadata: &Metadata) -> Self {
        use std::os::unix::fs::MetadataExt;
        Self {
            device: metadata.dev(),
            inode: metadata.ino(),
        }
    }

    // Without inode numbers only truncation can reveal a rotation.
    #[cfg(not(unix))]
    pub fn from_metadata(_metadata: &Metadata) -> Self {
        Self {
            device: 0,
            inode: 0,
        }
    }
}

#[derive(Debug, Clone)]
pub struct TailerOptions {
    /// Minimum time between identity checks of the watched path. Zero checks on every call.
    pub rotation_check_interval: Duration,
    /// Begin at the current end of file instead of offset zero.
    pub start_at_end: bool,
    /// Upper bound on bytes read from disk per call.
    pub max_read_bytes: usize,
}

/// Tails a single file by path, following it across rotation and truncation.
///
/// Only complete lines are returned. A trailing fragment without a newline stays buffered until
/// the rest of the line arrives; if the file is rotated or truncated first, the fragment is
/// discarded.
pub struct FileTailer {
    path: PathBuf,
    file: File,
    identity: FileIdentity,
    offset: u64,
    partial_line: Vec<u8>,
    options: TailerOptions,
    last_rotation_check: Instant,
}

impl FileTailer {
    pub async fn new(path: impl Into<PathBuf>, options: TailerOptions) -> Result<Self> {
        let path = path.into();
        let (file, identity, size) = open_with_identity(&path).await?;
        let offset = if options.start_at_end { size } else { 0 };
        let max_read_bytes = options.max_read_bytes.max(1);

        info!(
            path = %path.display(),
            offset,
            rotation_check_interval_ms = options.rotation_check_interval.as_millis() as u64,
            "starting tailer"
        );

        Ok(Self {
            path,
            file,
            identity,
            offset,
            partial_line: Vec::new(),
            options: TailerOptions {
                max_read_bytes,
                ..options
            },
            last_rotation_check: Instant::now(),
        })
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn identity(&self) -> FileIdentity {
        self.identity
    }

    fn rotation_check_due(&self) -> bool {
        let interval = self.options.rotation_check_interval;
        interval.is_zero() || self.last_rotation_check.elapsed() >= interval
    }

    async fn check_rotation(&mut self) -> Result<()> {
        if !self.rotation_check_due() {
            return Ok(());
        }
        self.last_rotation_check = Instant::now();

        let metadata = fs::metadata(&self.path)
            .await
            .with_context(|| format!("failed to stat {}", self.path.display()))?;
        if FileIdentity::from_metadata(&metadata) == self.identity {
            return Ok(());
        }

        let (file, identity, size) = open_with_identity(&self.path).await?;
        warn!(
            path = %self.path.display(),
            previous_offset = self.offset,
            current_size = size,
            dropped_partial_bytes = self.partial_line.len(),
            "file rotated; reading replacement from start"
        );
        ROTATIONS_TOTAL.with_label_values(&["identity"]).inc();

        self.file = file;
        self.identity = identity;
        self.reset_position();
        Ok(())
    }

    fn reset_position(&mut self) {
        self.offset = 0;
        self.partial_line.clear();
    }

    async fn read_appended(&mut self) -> Result<Vec<u8>> {
        let file_size = self
            .file
            .metadata()
            .await
            .with_context(|| format!("failed to read metadata for {}", self.path.display()))?
            .len();

        if file_size < self.offset {
            warn!(
                path = %self.path.display(),
                previous_offset = self.offset,
                current_size = file_size,
                "file truncated; resetting offset"
            );
            ROTATIONS_TOTAL.with_label_values(&["truncation"]).inc();
            self.reset_position();
        }

        let bytes_available = file_size.saturating_sub(self.offset);
        if bytes_available == 0 {
            return Ok(Vec::new());
        }

        let bytes_to_read = bytes_available.min(self.options.max_read_bytes as u64) as usize;
        let chunk = read_new_bytes(&mut self.file, &self.path, self.offset, bytes_to_read).await?;
        self.offset = self.offset.saturating_add(chunk.len() as u64);
        BYTES_READ_TOTAL.inc_by(chunk.len() as u64);

        debug!(
            path = %self.path.display(),
            offset = self.offset,
            chunk_len = chunk.len(),
            "read appended bytes"
        );

        self.partial_line.extend_from_slice(&chunk);
        Ok(self.take_complete_lines())
    }

    fn take_complete_lines(&mut self) -> Vec<u8> {
        match self.partial_line.iter().rposition(|byte| *byte == b'\n') {
            Some(idx) => {
                let rest = self.partial_line.split_off(idx + 1);
                std::mem::replace(&mut self.partial_line, rest)
            }
            // A line longer than one read window is released as-is; the parser drops it.
            None if self.partial_line.len() > self.options.max_read_bytes => {
                warn!(
                    path = %self.path.display(),
                    buffered = self.partial_line.len(),
                    "line exceeds read window; releasing without newline"
                );
                std::mem::take(&mut self.partial_line)
            }
            None => Vec::new(),
        }
    }
}

#[async_trait]
impl Tailer for FileTailer {
    async fn next(&mut self) -> Result<Vec<u8>> {
        self.check_rotation().await?;
        self.read_appended().await
    }
}

async fn open_with_identity(path: &Path) -> Result<(File, FileIdentity, u64)> {
    let file = File::open(path)
        .await
        .with_context(|| format!("failed to open {}", path.display()))?;
    let metadata = file
        .metadata()
        .await
        .with_context(|| format!("failed to read metadata for {}", path.display()))?;
    Ok((file, FileIdentity::from_metadata(&metadata), metadata.len()))
}

async fn read_new_bytes(
    file: &mut File,
    path: &Path,
    offset: u64,
    max_bytes: usize,
) -> Result<Vec<u8>> {
    file.seek(SeekFrom::Start(offset))
        .await
        .with_context(|| format!("failed to seek {} to offset {}", path.display(), offset))?;

    let mut buffer = vec![0u8; max_bytes];
    let mut total_read = 0usize;
    while total_read < max_bytes {
        let bytes_read = file
            .read(&mut buffer[total_read..])
            .await
            .with_context(|| format!("failed to read from {}", path.display()))?;
        if bytes_read == 0 {
            break;
        }
        total_read += bytes_read;
    }
    buffer.truncate(total_read);
    Ok(buffer)
}
