use std::io::ErrorKind;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::time::timeout;
use tracing::trace;

use crate::error::ApplicationError;
use crate::protocol::handshake_len;

/// Largest non-Piece frame we are willing to buffer.
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// Outcome of a timeout-bounded read.
///
/// `Timeout` means nothing at all arrived within the window; it is a normal
/// signal ("the peer has nothing more to say right now"), not a fault.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Recv<T> {
    Data(T),
    Timeout,
}

/// Length prefix and type byte of a general frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    /// Bytes after the length prefix, type byte included
    pub length: u32,
    /// `None` for a keep-alive
    pub id: Option<u8>,
}

impl FrameHeader {
    /// Bytes still unread once the header has been consumed.
    pub fn payload_len(&self) -> usize {
        (self.length as usize).saturating_sub(1)
    }
}

/// Reads length-delimited peer-wire frames off a byte stream.
pub struct Framer<S> {
    stream: BufReader<S>,
    read_timeout: Duration,
}

impl<S> Framer<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(stream: S, read_timeout: Duration) -> Self {
        Self {
            stream: BufReader::new(stream),
            read_timeout,
        }
    }

    /// Writes the whole buffer, however many partial writes it takes.
    pub async fn send(&mut self, bytes: &[u8]) -> Result<(), ApplicationError> {
        self.stream
            .write_all(bytes)
            .await
            .map_err(|e| ApplicationError::ConnectionError(format!("send: {}", e)))?;

        self.stream
            .flush()
            .await
            .map_err(|e| ApplicationError::ConnectionError(format!("send: {}", e)))
    }

    /// Waits up to the read timeout for at least one byte.
    async fn wait_readable(&mut self) -> Result<Recv<()>, ApplicationError> {
        match timeout(self.read_timeout, self.stream.fill_buf()).await {
            Err(_) => Ok(Recv::Timeout),
            Ok(Err(e)) => Err(ApplicationError::ConnectionError(format!("receive: {}", e))),
            Ok(Ok(buf)) if buf.is_empty() => Err(ApplicationError::ConnectionError(
                "connection closed by peer".into(),
            )),
            Ok(Ok(_)) => Ok(Recv::Data(())),
        }
    }

    /// Fills `buf` completely. Used once a frame has started: running out
    /// of time or data here is an error, not a timeout signal.
    pub async fn read_rest(&mut self, buf: &mut [u8]) -> Result<(), ApplicationError> {
        match timeout(self.read_timeout, self.stream.read_exact(buf)).await {
            Err(_) => Err(ApplicationError::ConnectionError(
                "peer stalled in the middle of a frame".into(),
            )),
            Ok(Err(e)) if e.kind() == ErrorKind::UnexpectedEof => Err(
                ApplicationError::ConnectionError("connection closed mid-frame".into()),
            ),
            Ok(Err(e)) => Err(ApplicationError::ConnectionError(format!("receive: {}", e))),
            Ok(Ok(_)) => Ok(()),
        }
    }

    /// Fills `buf` completely, or reports `Timeout` if no byte arrived.
    pub async fn read_exact(&mut self, buf: &mut [u8]) -> Result<Recv<()>, ApplicationError> {
        if buf.is_empty() {
            return Ok(Recv::Data(()));
        }
        if let Recv::Timeout = self.wait_readable().await? {
            return Ok(Recv::Timeout);
        }
        self.read_rest(buf).await?;
        Ok(Recv::Data(()))
    }

    /// Reads one handshake record: one byte giving the protocol-name length
    /// `L`, then the remaining `L + 48` bytes. The returned buffer holds the
    /// whole record, first byte included.
    pub async fn read_handshake(&mut self) -> Result<Recv<Vec<u8>>, ApplicationError> {
        let mut first = [0u8; 1];
        if let Recv::Timeout = self.read_exact(&mut first).await? {
            return Ok(Recv::Timeout);
        }

        let total = handshake_len(first[0]);
        let mut record = vec![0u8; total];
        record[0] = first[0];
        self.read_rest(&mut record[1..]).await?;

        trace!(len = total, "handshake frame");
        Ok(Recv::Data(record))
    }

    /// Reads the 4-byte length and, for non-keep-alive frames, the type byte.
    pub async fn read_header(&mut self) -> Result<Recv<FrameHeader>, ApplicationError> {
        let mut len = [0u8; 4];
        if let Recv::Timeout = self.read_exact(&mut len).await? {
            return Ok(Recv::Timeout);
        }

        let length = u32::from_be_bytes(len);
        if length == 0 {
            return Ok(Recv::Data(FrameHeader { length, id: None }));
        }

        let mut id = [0u8; 1];
        self.read_rest(&mut id).await?;
        Ok(Recv::Data(FrameHeader {
            length,
            id: Some(id[0]),
        }))
    }

    /// Reads the payload announced by `header` and returns the complete
    /// frame (length prefix, type byte, payload) ready for dispatch.
    pub async fn read_body(&mut self, header: FrameHeader) -> Result<Vec<u8>, ApplicationError> {
        let length = header.length as usize;
        if length > MAX_FRAME_LEN {
            return Err(ApplicationError::protocol(format!(
                "frame of {} bytes exceeds limit of {}",
                length, MAX_FRAME_LEN
            )));
        }

        let mut frame = Vec::with_capacity(4 + length);
        frame.extend_from_slice(&header.length.to_be_bytes());
        if let Some(id) = header.id {
            frame.push(id);
            frame.resize(4 + length, 0);
            self.read_rest(&mut frame[5..]).await?;
        }

        trace!(len = length, id = ?header.id, "frame");
        Ok(frame)
    }

    /// Reads one complete general-mode frame.
    pub async fn read_message(&mut self) -> Result<Recv<Vec<u8>>, ApplicationError> {
        match self.read_header().await? {
            Recv::Timeout => Ok(Recv::Timeout),
            Recv::Data(header) => Ok(Recv::Data(self.read_body(header).await?)),
        }
    }

    /// Reads a big-endian u32 inside a frame that has already started.
    pub async fn read_u32(&mut self) -> Result<u32, ApplicationError> {
        let mut buf = [0u8; 4];
        self.read_rest(&mut buf).await?;
        Ok(u32::from_be_bytes(buf))
    }
}
