//! Frame reader/writer over an async byte stream

use bytes::{Buf, BytesMut};
use shared_protocol::{Decoded, Frame, FrameCodec, ProtocolError};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, warn};

use crate::{READ_CHUNK_SIZE, TransportError, TransportResult};

/// Transport statistics
#[derive(Debug, Clone, Copy, Default)]
pub struct TransportStats {
    pub frames_read: u64,
    pub frames_written: u64,
    pub bytes_read: u64,
    pub bytes_written: u64,
    /// Frames with an unknown kind that were skipped
    pub frames_dropped: u64,
}

/// Frame transport over a reliable, ordered duplex stream
pub struct FramedTransport<T> {
    io: T,
    codec: FrameCodec,
    read_buf: BytesMut,
    write_buf: BytesMut,
    stats: TransportStats,
}

impl<T> FramedTransport<T>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    /// Wrap a stream using the default frame size limit
    pub fn new(io: T) -> Self {
        Self::with_codec(io, FrameCodec::default())
    }

    pub fn with_codec(io: T, codec: FrameCodec) -> Self {
        Self {
            io,
            codec,
            read_buf: BytesMut::with_capacity(READ_CHUNK_SIZE),
            write_buf: BytesMut::new(),
            stats: TransportStats::default(),
        }
    }

    pub fn codec(&self) -> &FrameCodec {
        &self.codec
    }

    pub fn stats(&self) -> TransportStats {
        self.stats
    }

    /// Read the next frame.
    ///
    /// Partial reads stay buffered inside the transport, so the future can be
    /// dropped (e.g. in `tokio::select!`) without losing data. Frames of an
    /// unknown kind are skipped. A clean EOF between frames is
    /// [`TransportError::ConnectionClosed`].
    pub async fn read_frame(&mut self) -> TransportResult<Frame> {
        loop {
            match self.codec.decode_next_frame(&self.read_buf) {
                Ok(Decoded::Frame { frame, consumed }) => {
                    self.read_buf.advance(consumed);
                    self.stats.frames_read += 1;
                    return Ok(frame);
                }
                Ok(Decoded::NeedMoreData) => {}
                Err(ProtocolError::UnknownFrameKind { kind, frame_len }) => {
                    warn!(
                        "Dropping frame with unknown kind 0x{:02x} ({} bytes)",
                        kind, frame_len
                    );
                    self.read_buf.advance(frame_len);
                    self.stats.frames_dropped += 1;
                    continue;
                }
                Err(e) => return Err(e.into()),
            }

            self.read_buf.reserve(READ_CHUNK_SIZE);
            let n = self.io.read_buf(&mut self.read_buf).await?;
            if n == 0 {
                if self.read_buf.is_empty() {
                    debug!("Transport reached end of stream");
                    return Err(TransportError::ConnectionClosed);
                }
                return Err(TransportError::TruncatedFrame(self.read_buf.len()));
            }
            self.stats.bytes_read += n as u64;
        }
    }

    /// Queue a frame for writing without flushing
    pub async fn write_frame(&mut self, frame: &Frame) -> TransportResult<()> {
        self.write_buf.clear();
        self.codec.encode(frame, &mut self.write_buf)?;
        self.io.write_all(&self.write_buf).await?;
        self.stats.frames_written += 1;
        self.stats.bytes_written += self.write_buf.len() as u64;
        Ok(())
    }

    /// Write a frame and flush the stream
    pub async fn send_frame(&mut self, frame: &Frame) -> TransportResult<()> {
        self.write_frame(frame).await?;
        self.flush().await
    }

    pub async fn flush(&mut self) -> TransportResult<()> {
        self.io.flush().await?;
        Ok(())
    }

    /// Flush and close the write side of the stream
    pub async fn shutdown(&mut self) -> TransportResult<()> {
        self.io.shutdown().await?;
        Ok(())
    }

    pub fn get_ref(&self) -> &T {
        &self.io
    }

    pub fn into_inner(self) -> T {
        self.io
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use shared_protocol::{FRAME_OVERHEAD, FrameKind, TAG_SIZE, encode_frame};
    use tokio::io::duplex;

    fn frame(sequence: u64, payload: &'static [u8]) -> Frame {
        Frame::new(FrameKind::Data, sequence, Bytes::from_static(payload), [3; TAG_SIZE])
    }

    #[tokio::test]
    async fn test_frames_roundtrip() {
        let (a, b) = duplex(1024);
        let mut writer = FramedTransport::new(a);
        let mut reader = FramedTransport::new(b);

        for sequence in 1..=3 {
            writer.send_frame(&frame(sequence, b"hello")).await.unwrap();
        }
        for sequence in 1..=3 {
            assert_eq!(reader.read_frame().await.unwrap(), frame(sequence, b"hello"));
        }

        assert_eq!(writer.stats().frames_written, 3);
        assert_eq!(reader.stats().frames_read, 3);
        assert_eq!(writer.stats().bytes_written, reader.stats().bytes_read);
    }

    #[tokio::test]
    async fn test_byte_at_a_time_delivery() {
        let (mut raw, b) = duplex(1);
        let mut reader = FramedTransport::new(b);
        let encoded = encode_frame(&frame(9, b"trickle")).unwrap();

        let writer = tokio::spawn(async move {
            for byte in encoded.iter() {
                raw.write_all(&[*byte]).await.unwrap();
            }
            raw
        });

        assert_eq!(reader.read_frame().await.unwrap(), frame(9, b"trickle"));
        drop(writer.await.unwrap());
    }

    #[tokio::test]
    async fn test_unknown_kind_is_skipped() {
        let (mut raw, b) = duplex(1024);
        let mut reader = FramedTransport::new(b);

        let mut unknown = encode_frame(&frame(1, b"future")).unwrap().to_vec();
        unknown[4] = 0x42;
        raw.write_all(&unknown).await.unwrap();
        raw.write_all(&encode_frame(&frame(2, b"known")).unwrap()).await.unwrap();

        assert_eq!(reader.read_frame().await.unwrap(), frame(2, b"known"));
        assert_eq!(reader.stats().frames_dropped, 1);
    }

    #[tokio::test]
    async fn test_oversized_length_is_fatal() {
        let (mut raw, b) = duplex(1024);
        let mut reader = FramedTransport::with_codec(b, FrameCodec::new(FRAME_OVERHEAD + 16));

        raw.write_all(&[0x00, 0x10, 0x00, 0x00]).await.unwrap();
        let err = reader.read_frame().await.unwrap_err();
        assert!(matches!(
            err,
            TransportError::Protocol(ProtocolError::FrameTooLarge { .. })
        ));
    }

    #[tokio::test]
    async fn test_clean_eof() {
        let (a, b) = duplex(64);
        let mut reader = FramedTransport::new(b);
        drop(a);
        assert!(matches!(
            reader.read_frame().await,
            Err(TransportError::ConnectionClosed)
        ));
    }

    #[tokio::test]
    async fn test_eof_mid_frame() {
        let (mut raw, b) = duplex(1024);
        let mut reader = FramedTransport::new(b);
        let encoded = encode_frame(&frame(1, b"cut short")).unwrap();
        raw.write_all(&encoded[..10]).await.unwrap();
        drop(raw);

        assert!(matches!(
            reader.read_frame().await,
            Err(TransportError::TruncatedFrame(10))
        ));
    }

    #[tokio::test]
    async fn test_refuses_to_write_oversized_frame() {
        let (a, _b) = duplex(1024);
        let mut writer = FramedTransport::with_codec(a, FrameCodec::new(FRAME_OVERHEAD + 2));
        let err = writer.send_frame(&frame(1, b"too long")).await.unwrap_err();
        assert!(matches!(
            err,
            TransportError::Protocol(ProtocolError::FrameTooLarge { .. })
        ));
        assert_eq!(writer.stats().frames_written, 0);
    }
}
