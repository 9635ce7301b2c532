//! Send and receive [`Frame`] values over a byte stream.
//!
//! `Connection` is generic over anything that is `AsyncRead + AsyncWrite`,
//! so the same framing logic serves plain TCP, Unix-domain sockets, and a
//! TLS stream on top of either — [`crate::socket`] is the module that picks
//! and builds the concrete stream type; `Connection` itself never knows
//! which one it got.
//!
//! To read frames, `Connection` uses an internal buffer, which is filled up
//! until there are enough bytes to build a complete frame. Once this
//! happens, `Connection` parses the frame and returns it to the caller, and
//! any leftover bytes stay in the buffer for the next call.
//!
//! When sending frames, the frame is first encoded into the write buffer.
//! The contents of the write buffer are then flushed to the socket.

use crate::frame::{self, Frame};

use bytes::{Buf, BytesMut};
use std::io::{self, Cursor};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufWriter};

/// Default size of the read buffer. Generous enough for typical command
/// replies; large bulk strings simply grow the buffer on demand.
const READ_BUFFER_CAPACITY: usize = 4 * 1024;

/// Frames a raw, already-connected stream.
pub struct Connection<S> {
    stream: BufWriter<S>,
    buffer: BytesMut,
}

impl<S> Connection<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Wraps `stream`, allocating its read/write buffers.
    pub fn new(stream: S) -> Connection<S> {
        Connection {
            stream: BufWriter::new(stream),
            buffer: BytesMut::with_capacity(READ_BUFFER_CAPACITY),
        }
    }

    /// Reads a single `Frame` value from the underlying stream.
    ///
    /// Waits until enough data has arrived to parse a frame. Returns
    /// `Ok(None)` if the stream closed cleanly (no partial frame buffered);
    /// a stream closed mid-frame is reported as an error.
    pub async fn read_frame(&mut self) -> crate::Result<Option<Frame>> {
        loop {
            if let Some(frame) = self.parse_frame()? {
                return Ok(Some(frame));
            }

            if 0 == self.stream.read_buf(&mut self.buffer).await? {
                if self.buffer.is_empty() {
                    return Ok(None);
                } else {
                    return Err(crate::Error::Protocol(
                        "connection reset by peer".to_string(),
                    ));
                }
            }
        }
    }

    /// Tries to parse one frame out of the buffer. `Ok(None)` means more
    /// bytes are needed; the consumed bytes are only dropped from the
    /// buffer once a complete frame has actually been parsed.
    fn parse_frame(&mut self) -> crate::Result<Option<Frame>> {
        use frame::Error::Incomplete;

        let mut cursor = Cursor::new(&self.buffer[..]);

        match Frame::check(&mut cursor) {
            Ok(_) => {
                let len = cursor.position() as usize;
                cursor.set_position(0);

                let frame = Frame::parse(&mut cursor)?;
                self.buffer.advance(len);

                Ok(Some(frame))
            }
            Err(Incomplete) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Writes a single `Frame` to the underlying stream and flushes it.
    ///
    /// Commands are always encoded as an array of bulk strings; nested
    /// arrays are not needed for anything this client sends, so encoding a
    /// non-top-level `Array` is left unimplemented, matching the frame type
    /// actually produced by [`crate::queue::encode_command`].
    pub async fn write_frame(&mut self, frame: &Frame) -> io::Result<()> {
        match frame {
            Frame::Array(entries) => {
                self.stream.write_u8(b'*').await?;
                self.write_decimal(entries.len() as i64).await?;
                for entry in entries {
                    self.write_value(entry).await?;
                }
            }
            _ => self.write_value(frame).await?,
        }

        self.stream.flush().await
    }

    async fn write_value(&mut self, frame: &Frame) -> io::Result<()> {
        match frame {
            Frame::Simple(val) => {
                self.stream.write_u8(b'+').await?;
                self.stream.write_all(val.as_bytes()).await?;
                self.stream.write_all(b"\r\n").await?;
            }
            Frame::Error(val) => {
                self.stream.write_u8(b'-').await?;
                self.stream.write_all(val.as_bytes()).await?;
                self.stream.write_all(b"\r\n").await?;
            }
            Frame::Integer(val) => {
                self.stream.write_u8(b':').await?;
                self.write_decimal(*val).await?;
            }
            Frame::Null => {
                self.stream.write_all(b"$-1\r\n").await?;
            }
            Frame::Bulk(val) => {
                let len = val.len();
                self.stream.write_u8(b'$').await?;
                self.write_decimal(len as i64).await?;
                self.stream.write_all(val).await?;
                self.stream.write_all(b"\r\n").await?;
            }
            Frame::Array(_) => unreachable!("nested arrays are never sent by this client"),
            other => unreachable!("{:?} is never sent by this client", other),
        }
        Ok(())
    }

    async fn write_decimal(&mut self, val: i64) -> io::Result<()> {
        use std::io::Write;

        let mut buf = [0u8; 20];
        let mut buf = Cursor::new(&mut buf[..]);
        write!(&mut buf, "{}", val)?;

        let pos = buf.position() as usize;
        self.stream.write_all(&buf.get_ref()[..pos]).await?;
        self.stream.write_all(b"\r\n").await?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use tokio::io::duplex;

    #[tokio::test]
    async fn writes_command_then_reads_reply() {
        let (client_side, mut server_side) = duplex(4096);
        let mut conn = Connection::new(client_side);

        let mut frame = Frame::array();
        frame.push_bulk(Bytes::from("PING"));
        conn.write_frame(&frame).await.unwrap();

        let mut buf = [0u8; 64];
        use tokio::io::AsyncReadExt as _;
        let n = server_side.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"*1\r\n$4\r\nPING\r\n");

        use tokio::io::AsyncWriteExt as _;
        server_side.write_all(b"+PONG\r\n").await.unwrap();
        drop(server_side);

        let reply = conn.read_frame().await.unwrap();
        assert_eq!(reply, Some(Frame::Simple("PONG".into())));
    }

    #[tokio::test]
    async fn clean_close_with_no_partial_frame_is_none() {
        let (client_side, server_side) = duplex(16);
        drop(server_side);
        let mut conn = Connection::new(client_side);
        assert_eq!(conn.read_frame().await.unwrap(), None);
    }
}
