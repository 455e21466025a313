use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use crc32fast::Hasher;
use tracing::debug;

use super::memory::ArchiveStats;
use super::{Archiver, Reference};
use crate::config::ArchiverConfig;
use crate::error::{BindexError, DataFormatError, TaskAbort};
use crate::Result;

const BLOCK_EXT: &str = "blk";

/// Content-addressed block store on local disk, one file per block.
///
/// Block file format:
/// - u32 length (little endian)
/// - u32 crc32 of payload
/// - raw payload bytes
pub struct FileArchiver {
    dir: PathBuf,
    fsync: bool,
    pushes: AtomicU64,
    pulls: AtomicU64,
    tmp_seq: AtomicU64,
}

impl FileArchiver {
    pub fn open(config: &ArchiverConfig) -> Result<Self> {
        fs::create_dir_all(&config.data_dir).map_err(BindexError::Io)?;
        Ok(Self {
            dir: config.data_dir.clone(),
            fsync: config.fsync,
            pushes: AtomicU64::new(0),
            pulls: AtomicU64::new(0),
            tmp_seq: AtomicU64::new(0),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn block_path(&self, reference: &Reference) -> PathBuf {
        self.dir.join(format!("{}.{}", reference.to_hex(), BLOCK_EXT))
    }

    /// Number of blocks currently stored.
    pub fn block_count(&self) -> Result<usize> {
        let mut count = 0;
        for entry in fs::read_dir(&self.dir).map_err(BindexError::Io)? {
            let path = entry.map_err(BindexError::Io)?.path();
            if path.extension().and_then(|e| e.to_str()) == Some(BLOCK_EXT) {
                count += 1;
            }
        }
        Ok(count)
    }

    pub fn stats(&self) -> Result<ArchiveStats> {
        let mut blocks = 0;
        let mut bytes = 0;
        for entry in fs::read_dir(&self.dir).map_err(BindexError::Io)? {
            let entry = entry.map_err(BindexError::Io)?;
            if entry.path().extension().and_then(|e| e.to_str()) == Some(BLOCK_EXT) {
                blocks += 1;
                bytes += entry.metadata().map_err(BindexError::Io)?.len();
            }
        }
        Ok(ArchiveStats {
            pushes: self.pushes.load(Ordering::Relaxed),
            pulls: self.pulls.load(Ordering::Relaxed),
            blocks,
            bytes,
        })
    }

    fn write_block(&self, path: &Path, payload: &[u8]) -> Result<()> {
        let len = u32::try_from(payload.len()).map_err(|_| {
            BindexError::InvalidRequest(format!("block of {} bytes is too large", payload.len()))
        })?;
        let mut hasher = Hasher::new();
        hasher.update(payload);
        let crc32 = hasher.finalize();

        let seq = self.tmp_seq.fetch_add(1, Ordering::Relaxed);
        let tmp = path.with_extension(format!("tmp{}", seq));
        {
            let mut file = OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .open(&tmp)
                .map_err(BindexError::Io)?;
            file.write_all(&len.to_le_bytes()).map_err(BindexError::Io)?;
            file.write_all(&crc32.to_le_bytes()).map_err(BindexError::Io)?;
            file.write_all(payload).map_err(BindexError::Io)?;
            if self.fsync {
                file.sync_all().map_err(BindexError::Io)?;
            }
        }
        fs::rename(&tmp, path).map_err(BindexError::Io)?;
        Ok(())
    }

    fn read_block(&self, path: &Path, reference: &Reference) -> Result<Vec<u8>> {
        let mut file = File::open(path).map_err(BindexError::Io)?;

        let mut len_buf = [0u8; 4];
        file.read_exact(&mut len_buf).map_err(BindexError::Io)?;
        let len = u32::from_le_bytes(len_buf);

        let mut crc_buf = [0u8; 4];
        file.read_exact(&mut crc_buf).map_err(BindexError::Io)?;
        let stored_crc = u32::from_le_bytes(crc_buf);

        let mut payload = Vec::with_capacity(len as usize);
        file.read_to_end(&mut payload).map_err(BindexError::Io)?;
        if payload.len() != len as usize {
            return Err(DataFormatError::new("block length mismatch")
                .with_value(format!("expected {}, found {}", len, payload.len()))
                .with_parent(reference)
                .into());
        }

        let mut hasher = Hasher::new();
        hasher.update(&payload);
        if hasher.finalize() != stored_crc {
            return Err(DataFormatError::new("block checksum mismatch (corrupt block)")
                .with_parent(reference)
                .into());
        }
        Ok(payload)
    }
}

impl Archiver<Vec<u8>> for FileArchiver {
    fn push(&self, item: &Vec<u8>) -> Result<Reference> {
        self.pushes.fetch_add(1, Ordering::Relaxed);
        let reference = Reference::digest(item);
        let path = self.block_path(&reference);
        if path.exists() {
            return Ok(reference);
        }
        self.write_block(&path, item)
            .map_err(|e| e.into_abort(format!("push of block {} failed", reference)))?;
        debug!(block = %reference, bytes = item.len(), "wrote block");
        Ok(reference)
    }

    fn pull(&self, reference: &Reference) -> Result<Vec<u8>> {
        self.pulls.fetch_add(1, Ordering::Relaxed);
        let path = self.block_path(reference);
        self.read_block(&path, reference).map_err(|e| match e {
            BindexError::DataFormat(_) => e,
            other => BindexError::TaskAbort(
                TaskAbort::failed(format!("pull of block {} failed", reference)).caused_by(other),
            ),
        })
    }
}
