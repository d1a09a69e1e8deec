//! File transfers: manifest, chunking and reassembly
//!
//! The sender hashes the file in a first streaming pass, announces it with a
//! [`TransferManifest`] and then re-reads it chunk by chunk. The receiver
//! writes chunks into a `.part` file at their offsets and only renames it to
//! its final name once the whole file has been re-hashed and matches the
//! manifest checksum.

use std::io::SeekFrom;
use std::path::{Path, PathBuf};

use shared_protocol::{FileChunk, ProtocolError, TransferManifest};
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tracing::{debug, warn};

use crate::{
    SessionError, SessionResult, TransferDirection, TransferProgress, TransferStatus,
};

const HASH_BUFFER_SIZE: usize = 64 * 1024;

/// Attempts at finding a free destination name before giving up
const MAX_NAME_ATTEMPTS: u32 = 1000;

/// BLAKE3 hash of everything left in `file`, read in bounded pieces
pub async fn checksum_file(file: &mut File) -> std::io::Result<[u8; 32]> {
    let mut hasher = blake3::Hasher::new();
    let mut buf = vec![0u8; HASH_BUFFER_SIZE];
    loop {
        let n = file.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(*hasher.finalize().as_bytes())
}

/// A file being sent
pub struct OutboundTransfer {
    file: File,
    manifest: TransferManifest,
    next_index: u32,
    bytes_sent: u64,
    buf: Vec<u8>,
}

impl OutboundTransfer {
    /// Open `path`, hash it, and prepare its manifest
    pub async fn open(path: &Path, transfer_id: u64, chunk_size: u32) -> SessionResult<Self> {
        let filename = path
            .file_name()
            .and_then(|name| name.to_str())
            .ok_or_else(|| {
                SessionError::Io(std::io::Error::new(
                    std::io::ErrorKind::InvalidInput,
                    format!("{} has no usable file name", path.display()),
                ))
            })?
            .to_string();

        let mut file = File::open(path).await?;
        let metadata = file.metadata().await?;
        if !metadata.is_file() {
            return Err(SessionError::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("{} is not a regular file", path.display()),
            )));
        }

        let checksum = checksum_file(&mut file).await?;
        file.seek(SeekFrom::Start(0)).await?;

        let manifest = TransferManifest {
            transfer_id,
            filename,
            total_size: metadata.len(),
            chunk_size,
            checksum,
        };
        debug!(
            "Prepared transfer {:016x}: {} ({} bytes, {} chunks)",
            transfer_id,
            manifest.filename,
            manifest.total_size,
            manifest.chunk_count()
        );

        Ok(Self {
            file,
            manifest,
            next_index: 0,
            bytes_sent: 0,
            buf: vec![0u8; chunk_size as usize],
        })
    }

    pub fn manifest(&self) -> &TransferManifest {
        &self.manifest
    }

    pub fn transfer_id(&self) -> u64 {
        self.manifest.transfer_id
    }

    /// Read the next chunk, or `None` once the whole file has been read
    pub async fn next_chunk(&mut self) -> SessionResult<Option<FileChunk>> {
        let Some(len) = self.manifest.chunk_len(self.next_index) else {
            return Ok(None);
        };

        self.file.read_exact(&mut self.buf[..len]).await?;
        let chunk = FileChunk::new(
            self.manifest.transfer_id,
            self.next_index,
            self.buf[..len].to_vec(),
        );
        self.next_index += 1;
        self.bytes_sent += len as u64;
        Ok(Some(chunk))
    }

    pub fn progress(&self, status: TransferStatus) -> TransferProgress {
        TransferProgress {
            transfer_id: self.manifest.transfer_id,
            direction: TransferDirection::Outbound,
            filename: self.manifest.filename.clone(),
            status,
            bytes_done: self.bytes_sent,
            bytes_total: self.manifest.total_size,
            chunks_done: self.next_index as u64,
            chunks_total: self.manifest.chunk_count(),
        }
    }
}

/// A file being received
pub struct InboundTransfer {
    manifest: TransferManifest,
    download_dir: PathBuf,
    part_path: PathBuf,
    file: Option<File>,
    /// One bit per chunk index
    received: Vec<u64>,
    chunks_received: u64,
    bytes_received: u64,
    finished: bool,
}

impl InboundTransfer {
    /// Create the part file for an announced transfer.
    ///
    /// The manifest must already have been validated. An existing file at the
    /// part path is left untouched and the transfer is refused.
    pub async fn create(manifest: TransferManifest, download_dir: &Path) -> SessionResult<Self> {
        fs::create_dir_all(download_dir).await?;

        let part_path = download_dir.join(format!(
            "{}.{:016x}.part",
            manifest.filename, manifest.transfer_id
        ));
        let file = match OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&part_path)
            .await
        {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                return Err(ProtocolError::InvalidManifest(format!(
                    "transfer {:016x} collides with existing {}",
                    manifest.transfer_id,
                    part_path.display()
                ))
                .into());
            }
            Err(e) => return Err(e.into()),
        };

        let words = manifest.chunk_count().div_ceil(64) as usize;
        Ok(Self {
            manifest,
            download_dir: download_dir.to_path_buf(),
            part_path,
            file: Some(file),
            received: vec![0; words],
            chunks_received: 0,
            bytes_received: 0,
            finished: false,
        })
    }

    pub fn manifest(&self) -> &TransferManifest {
        &self.manifest
    }

    pub fn transfer_id(&self) -> u64 {
        self.manifest.transfer_id
    }

    pub fn part_path(&self) -> &Path {
        &self.part_path
    }

    pub fn is_complete(&self) -> bool {
        self.chunks_received == self.manifest.chunk_count()
    }

    fn has_chunk(&self, index: u32) -> bool {
        let index = index as usize;
        self.received[index / 64] & (1 << (index % 64)) != 0
    }

    fn mark_chunk(&mut self, index: u32) {
        let index = index as usize;
        self.received[index / 64] |= 1 << (index % 64);
    }

    /// Write one chunk at its offset.
    ///
    /// Returns `false` for a duplicate of an already written chunk.
    pub async fn accept_chunk(&mut self, chunk: &FileChunk) -> SessionResult<bool> {
        let Some(expected_len) = self.manifest.chunk_len(chunk.index) else {
            return Err(ProtocolError::InvalidChunk(format!(
                "index {} out of range for {} chunks",
                chunk.index,
                self.manifest.chunk_count()
            ))
            .into());
        };
        if chunk.data.len() != expected_len {
            return Err(ProtocolError::InvalidChunk(format!(
                "chunk {} has {} bytes, expected {}",
                chunk.index,
                chunk.data.len(),
                expected_len
            ))
            .into());
        }
        if self.has_chunk(chunk.index) {
            debug!(
                "Ignoring duplicate chunk {} of transfer {:016x}",
                chunk.index, self.manifest.transfer_id
            );
            return Ok(false);
        }

        let file = self.file.as_mut().ok_or(SessionError::TransferAborted {
            transfer_id: self.manifest.transfer_id,
        })?;
        file.seek(SeekFrom::Start(self.manifest.chunk_offset(chunk.index)))
            .await?;
        file.write_all(&chunk.data).await?;

        self.mark_chunk(chunk.index);
        self.chunks_received += 1;
        self.bytes_received += expected_len as u64;
        Ok(true)
    }

    /// Verify the reassembled file and move it to its final name
    pub async fn finish(&mut self) -> SessionResult<PathBuf> {
        let transfer_id = self.manifest.transfer_id;
        let mut file = self
            .file
            .take()
            .ok_or(SessionError::TransferAborted { transfer_id })?;
        file.flush().await?;
        file.sync_all().await?;
        drop(file);

        let mut file = File::open(&self.part_path).await?;
        let checksum = checksum_file(&mut file).await?;
        drop(file);

        if checksum != self.manifest.checksum {
            warn!(
                "Transfer {:016x} checksum mismatch, discarding {}",
                transfer_id,
                self.part_path.display()
            );
            self.remove_part_file().await;
            return Err(SessionError::TransferChecksumMismatch { transfer_id });
        }

        let destination = unique_destination(&self.download_dir, &self.manifest.filename).await?;
        fs::rename(&self.part_path, &destination).await?;
        self.finished = true;
        Ok(destination)
    }

    /// Drop the file handle and delete the partial output
    pub async fn abort(&mut self) {
        self.file = None;
        self.remove_part_file().await;
    }

    async fn remove_part_file(&mut self) {
        if let Err(e) = fs::remove_file(&self.part_path).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!("Failed to remove {}: {}", self.part_path.display(), e);
            }
        }
        self.finished = true;
    }

    pub fn progress(&self, status: TransferStatus) -> TransferProgress {
        TransferProgress {
            transfer_id: self.manifest.transfer_id,
            direction: TransferDirection::Inbound,
            filename: self.manifest.filename.clone(),
            status,
            bytes_done: self.bytes_received,
            bytes_total: self.manifest.total_size,
            chunks_done: self.chunks_received,
            chunks_total: self.manifest.chunk_count(),
        }
    }
}

impl Drop for InboundTransfer {
    fn drop(&mut self) {
        if !self.finished {
            self.file = None;
            let _ = std::fs::remove_file(&self.part_path);
        }
    }
}

/// `dir/name`, or `dir/stem (n).ext` if that is taken
async fn unique_destination(dir: &Path, filename: &str) -> SessionResult<PathBuf> {
    let candidate = dir.join(filename);
    if !fs::try_exists(&candidate).await? {
        return Ok(candidate);
    }

    let name = Path::new(filename);
    let stem = name
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or(filename);
    let extension = name.extension().and_then(|e| e.to_str());

    for n in 1..=MAX_NAME_ATTEMPTS {
        let numbered = match extension {
            Some(ext) => format!("{} ({}).{}", stem, n, ext),
            None => format!("{} ({})", stem, n),
        };
        let candidate = dir.join(numbered);
        if !fs::try_exists(&candidate).await? {
            return Ok(candidate);
        }
    }

    Err(SessionError::Io(std::io::Error::new(
        std::io::ErrorKind::AlreadyExists,
        format!("no free name for {} in {}", filename, dir.display()),
    )))
}
