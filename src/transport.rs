//! Socket halves for one MOS connection.
//!
//! The writer encodes documents in the configured [`WireEncoding`] into a
//! reused buffer. The reader fills a reused buffer and hands each chunk to the
//! framer as [`Bytes`].

use crate::error::Result;
use crate::protocol::{encode_into, WireEncoding};
use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;

/// Minimum free space before a socket read.
const READ_CHUNK: usize = 8192;

/// Write half, one document per call.
pub(crate) struct DocumentWriter {
    write: OwnedWriteHalf,
    encoding: WireEncoding,
    scratch: BytesMut,
}

impl DocumentWriter {
    /// Encode `xml` and write it out in full.
    pub async fn write_document(&mut self, xml: &str) -> Result<()> {
        self.scratch.clear();
        encode_into(xml, self.encoding, &mut self.scratch);
        self.write.write_all(&self.scratch).await?;
        self.write.flush().await?;
        Ok(())
    }
}

/// Read half.
pub(crate) struct ChunkReader {
    read: OwnedReadHalf,
    buf: BytesMut,
}

impl ChunkReader {
    /// Next chunk of raw bytes, or `None` once the peer has closed.
    ///
    /// Cancel-safe: the socket client polls this inside `select!`, and a
    /// cancelled `read_buf` leaves the buffer untouched.
    pub async fn read_chunk(&mut self) -> Result<Option<Bytes>> {
        self.buf.reserve(READ_CHUNK);
        match self.read.read_buf(&mut self.buf).await? {
            0 => Ok(None),
            _ => Ok(Some(self.buf.split().freeze())),
        }
    }
}

/// Split a connected stream into its document writer and chunk reader.
pub(crate) fn split(stream: TcpStream, encoding: WireEncoding) -> (DocumentWriter, ChunkReader) {
    if let Err(e) = stream.set_nodelay(true) {
        tracing::debug!("Failed to set TCP_NODELAY: {}", e);
    }
    let (read, write) = stream.into_split();
    (
        DocumentWriter {
            write,
            encoding,
            scratch: BytesMut::new(),
        },
        ChunkReader {
            read,
            buf: BytesMut::with_capacity(READ_CHUNK),
        },
    )
}
