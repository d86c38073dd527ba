use std::io::SeekFrom;
use std::ops::Range;
use std::path::Path;
use std::sync::Mutex as StdMutex;

use sha1::{Digest, Sha1};
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::Mutex;
use tracing::debug;

use crate::error::ApplicationError;

/// Read size used when hashing a piece back out of the file
const HASH_CHUNK: usize = 64 * 1024;

fn resource(context: &str, e: std::io::Error) -> ApplicationError {
    ApplicationError::ResourceError(format!("{}: {}", context, e))
}

/// The downloaded content: one flat file of `num_of_pieces * piece_length`
/// bytes, piece `i` starting at `i * piece_length`.
pub struct PieceStore {
    file:          Mutex<File>,
    piece_length:  u64,
    num_of_pieces: u64,
    /// Byte ranges currently held by a `BlockWriter`
    claims:        StdMutex<Vec<Range<u64>>>,
}

impl PieceStore {
    /// Creates (or truncates) the file at `path` and sizes it up front.
    pub async fn create(
        path: impl AsRef<Path>,
        num_of_pieces: usize,
        piece_length: usize,
    ) -> Result<Self, ApplicationError> {
        let path = path.as_ref();

        // Indices and offsets must survive the u32 fields of a Request.
        let (pieces, length) = match (u32::try_from(num_of_pieces), u32::try_from(piece_length)) {
            (Ok(p), Ok(l)) => (p as u64, l as u64),
            _ => {
                return Err(ApplicationError::ResourceError(format!(
                    "{} pieces of {} bytes do not fit the wire format",
                    num_of_pieces, piece_length
                )));
            }
        };
        let size = pieces.checked_mul(length).ok_or_else(|| {
            ApplicationError::ResourceError(format!(
                "store of {} pieces of {} bytes is too large",
                num_of_pieces, piece_length
            ))
        })?;

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)
            .await
            .map_err(|e| resource(&format!("open {}", path.display()), e))?;

        file.set_len(size)
            .await
            .map_err(|e| resource("pre-size store", e))?;

        debug!(path = %path.display(), size, "created store");
        Ok(Self {
            file: Mutex::new(file),
            piece_length: length,
            num_of_pieces: pieces,
            claims: StdMutex::new(Vec::new()),
        })
    }

    pub fn size(&self) -> u64 {
        self.num_of_pieces * self.piece_length
    }

    /// Absolute file position of `block_offset` inside piece `piece`.
    pub fn offset(&self, piece: usize, block_offset: usize) -> u64 {
        piece as u64 * self.piece_length + block_offset as u64
    }

    /// Claims `length` bytes at `block_offset` of piece `piece` for
    /// writing. Only one writer may hold any given byte at a time.
    pub fn block_writer(
        &self,
        piece: usize,
        block_offset: usize,
        length: usize,
    ) -> Result<BlockWriter<'_>, ApplicationError> {
        if piece as u64 >= self.num_of_pieces
            || block_offset as u64 + length as u64 > self.piece_length
        {
            return Err(ApplicationError::ResourceError(format!(
                "block {}+{} of piece {} is outside the store",
                block_offset, length, piece
            )));
        }

        let start = self.offset(piece, block_offset);
        let range = start..start + length as u64;

        let mut claims = self
            .claims
            .lock()
            .map_err(|_| ApplicationError::ResourceError("store claims poisoned".into()))?;
        if claims
            .iter()
            .any(|c| c.start < range.end && range.start < c.end)
        {
            return Err(ApplicationError::ResourceError(format!(
                "bytes {:?} are already being written",
                range
            )));
        }
        claims.push(range.clone());

        Ok(BlockWriter {
            store: self,
            pos: range.start,
            range,
        })
    }

    async fn write_at(&self, pos: u64, data: &[u8]) -> Result<(), ApplicationError> {
        let mut file = self.file.lock().await;
        file.seek(SeekFrom::Start(pos))
            .await
            .map_err(|e| resource("seek", e))?;
        file.write_all(data)
            .await
            .map_err(|e| resource("write", e))
    }

    pub async fn flush(&self) -> Result<(), ApplicationError> {
        let mut file = self.file.lock().await;
        file.flush().await.map_err(|e| resource("flush", e))
    }

    /// Fills `buf` from absolute position `pos`.
    pub async fn read_at(&self, pos: u64, buf: &mut [u8]) -> Result<(), ApplicationError> {
        let mut file = self.file.lock().await;
        file.seek(SeekFrom::Start(pos))
            .await
            .map_err(|e| resource("seek", e))?;
        file.read_exact(buf)
            .await
            .map(|_| ())
            .map_err(|e| resource("read", e))
    }

    /// SHA-1 of piece `index`, read back from disk in fixed-size chunks.
    pub async fn hash_piece(&self, index: usize) -> Result<[u8; 20], ApplicationError> {
        if index as u64 >= self.num_of_pieces {
            return Err(ApplicationError::ResourceError(format!(
                "piece {} is outside the store",
                index
            )));
        }

        let mut hasher = Sha1::new();
        let mut chunk = vec![0u8; HASH_CHUNK];
        let mut pos = self.offset(index, 0);
        let end = pos + self.piece_length;

        while pos < end {
            let n = std::cmp::min(HASH_CHUNK as u64, end - pos) as usize;
            self.read_at(pos, &mut chunk[..n]).await?;
            hasher.update(&chunk[..n]);
            pos += n as u64;
        }

        let mut digest = [0u8; 20];
        digest.copy_from_slice(&hasher.finalize());
        Ok(digest)
    }

    fn release(&self, range: &Range<u64>) {
        if let Ok(mut claims) = self.claims.lock() {
            claims.retain(|c| c != range);
        }
    }
}

/// Exclusive, sequential writer over one block's byte range.
pub struct BlockWriter<'a> {
    store: &'a PieceStore,
    range: Range<u64>,
    pos:   u64,
}

impl BlockWriter<'_> {
    /// Appends `data` after what has been written so far.
    pub async fn write(&mut self, data: &[u8]) -> Result<(), ApplicationError> {
        if self.pos + data.len() as u64 > self.range.end {
            return Err(ApplicationError::ResourceError(format!(
                "write of {} bytes overruns block {:?}",
                data.len(),
                self.range
            )));
        }
        self.store.write_at(self.pos, data).await?;
        self.pos += data.len() as u64;
        Ok(())
    }

    pub fn is_full(&self) -> bool {
        self.pos == self.range.end
    }
}

impl Drop for BlockWriter<'_> {
    fn drop(&mut self) {
        self.store.release(&self.range);
    }
}
