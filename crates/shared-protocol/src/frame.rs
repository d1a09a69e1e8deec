//! Frame encoding and decoding for the SecureLink wire format.
//!
//! Every frame on the wire is laid out as (all integers big-endian):
//!
//! ```text
//! [4-byte length][1-byte kind][8-byte sequence][payload][16-byte auth tag]
//! ```
//!
//! The length counts every byte after the prefix itself. Decoding works on a
//! caller-owned buffer so partial reads can be retried once more data arrives.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::{
    DEFAULT_MAX_FRAME_SIZE, FRAME_OVERHEAD, LENGTH_PREFIX_SIZE, ProtocolError, ProtocolResult,
    SEQUENCE_SIZE, TAG_SIZE,
};

/// Type of frame being transmitted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum FrameKind {
    /// Key exchange and key confirmation (not encrypted)
    Handshake = 0x01,
    /// Text message
    Data = 0x02,
    /// Piece of a file transfer
    FileChunk = 0x03,
    /// Announces a file transfer
    FileManifest = 0x04,
    /// Session termination
    Close = 0x05,
}

impl FrameKind {
    /// Get raw byte value
    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

impl TryFrom<u8> for FrameKind {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x01 => Ok(Self::Handshake),
            0x02 => Ok(Self::Data),
            0x03 => Ok(Self::FileChunk),
            0x04 => Ok(Self::FileManifest),
            0x05 => Ok(Self::Close),
            other => Err(other),
        }
    }
}

impl std::fmt::Display for FrameKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Handshake => write!(f, "Handshake"),
            Self::Data => write!(f, "Data"),
            Self::FileChunk => write!(f, "FileChunk"),
            Self::FileManifest => write!(f, "FileManifest"),
            Self::Close => write!(f, "Close"),
        }
    }
}

/// A single authenticated, length-delimited unit of wire data
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    sequence: u64,
    kind: FrameKind,
    payload: Bytes,
    auth_tag: [u8; TAG_SIZE],
}

impl Frame {
    pub fn new(
        kind: FrameKind,
        sequence: u64,
        payload: impl Into<Bytes>,
        auth_tag: [u8; TAG_SIZE],
    ) -> Self {
        Self {
            sequence,
            kind,
            payload: payload.into(),
            auth_tag,
        }
    }

    /// Build a plaintext handshake frame.
    ///
    /// Handshake frames are sent before any key exists, so the tag is a
    /// truncated BLAKE3 digest that only detects corruption.
    pub fn handshake(sequence: u64, payload: impl Into<Bytes>) -> Self {
        let payload = payload.into();
        let auth_tag = integrity_tag(FrameKind::Handshake, sequence, &payload);
        Self::new(FrameKind::Handshake, sequence, payload, auth_tag)
    }

    /// Check the integrity tag of a handshake frame
    pub fn verify_integrity(&self) -> bool {
        integrity_tag(self.kind, self.sequence, &self.payload) == self.auth_tag
    }

    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn kind(&self) -> FrameKind {
        self.kind
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    pub fn auth_tag(&self) -> &[u8; TAG_SIZE] {
        &self.auth_tag
    }

    /// Value of the length prefix for this frame
    pub fn body_len(&self) -> usize {
        FRAME_OVERHEAD + self.payload.len()
    }

    /// Total number of bytes this frame occupies on the wire
    pub fn wire_len(&self) -> usize {
        LENGTH_PREFIX_SIZE + self.body_len()
    }

    fn encode_into(&self, length_prefix: u32, dst: &mut BytesMut) {
        dst.reserve(self.wire_len());
        dst.put_u32(length_prefix);
        dst.put_u8(self.kind.as_u8());
        dst.put_u64(self.sequence);
        dst.put_slice(&self.payload);
        dst.put_slice(&self.auth_tag);
    }
}

/// Bytes authenticated alongside an encrypted payload: kind and sequence
pub fn associated_data(kind: FrameKind, sequence: u64) -> [u8; 1 + SEQUENCE_SIZE] {
    let mut aad = [0u8; 1 + SEQUENCE_SIZE];
    aad[0] = kind.as_u8();
    aad[1..].copy_from_slice(&sequence.to_be_bytes());
    aad
}

fn integrity_tag(kind: FrameKind, sequence: u64, payload: &[u8]) -> [u8; TAG_SIZE] {
    let mut hasher = blake3::Hasher::new();
    hasher.update(&associated_data(kind, sequence));
    hasher.update(payload);
    let hash = hasher.finalize();
    let mut tag = [0u8; TAG_SIZE];
    tag.copy_from_slice(&hash.as_bytes()[..TAG_SIZE]);
    tag
}

/// Length prefix for a frame body, bounded by `max` and by the 4-byte field
fn length_prefix(body_len: usize, max: usize) -> ProtocolResult<u32> {
    match u32::try_from(body_len) {
        Ok(len) if body_len <= max => Ok(len),
        _ => Err(ProtocolError::FrameTooLarge {
            size: body_len,
            max,
        }),
    }
}

/// Encode a frame into a freshly allocated buffer.
///
/// Only the 4-byte length field bounds the frame; use [`FrameCodec::encode`]
/// to also enforce a configured maximum.
pub fn encode_frame(frame: &Frame) -> ProtocolResult<Bytes> {
    let mut buf = BytesMut::with_capacity(frame.wire_len());
    FrameCodec::new(u32::MAX as usize).encode(frame, &mut buf)?;
    Ok(buf.freeze())
}

/// Result of a decode attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decoded {
    /// A complete frame, and how many bytes of the buffer it used
    Frame { frame: Frame, consumed: usize },
    /// The buffer holds an incomplete frame
    NeedMoreData,
}

/// Frame encoder/decoder with a bound on the declared frame length
#[derive(Debug, Clone, Copy)]
pub struct FrameCodec {
    max_frame_size: usize,
}

impl FrameCodec {
    /// Create a codec accepting length prefixes up to `max_frame_size`
    pub fn new(max_frame_size: usize) -> Self {
        Self {
            max_frame_size: max_frame_size.clamp(FRAME_OVERHEAD, u32::MAX as usize),
        }
    }

    pub fn max_frame_size(&self) -> usize {
        self.max_frame_size
    }

    /// Largest payload a frame may carry under this codec
    pub fn max_payload(&self) -> usize {
        self.max_frame_size - FRAME_OVERHEAD
    }

    /// Encode a frame, refusing frames the peer would reject
    pub fn encode(&self, frame: &Frame, dst: &mut BytesMut) -> ProtocolResult<()> {
        let length_prefix = length_prefix(frame.body_len(), self.max_frame_size)?;
        frame.encode_into(length_prefix, dst);
        Ok(())
    }

    /// Decode the next frame from the front of `buf`.
    ///
    /// Returns [`Decoded::NeedMoreData`] until a whole frame is buffered. A
    /// length of zero, below the fixed overhead, or above the configured
    /// maximum is rejected before any payload is buffered. An unknown kind is
    /// only reported once the whole frame is present, so the caller can skip
    /// exactly `frame_len` bytes.
    pub fn decode_next_frame(&self, buf: &[u8]) -> ProtocolResult<Decoded> {
        if buf.len() < LENGTH_PREFIX_SIZE {
            return Ok(Decoded::NeedMoreData);
        }

        let declared = (&buf[..LENGTH_PREFIX_SIZE]).get_u32() as usize;
        if declared == 0 {
            return Err(ProtocolError::MalformedFrame(
                "zero-length frame".to_string(),
            ));
        }
        if declared < FRAME_OVERHEAD {
            return Err(ProtocolError::MalformedFrame(format!(
                "declared length {} is below the minimum of {}",
                declared, FRAME_OVERHEAD
            )));
        }
        if declared > self.max_frame_size {
            return Err(ProtocolError::FrameTooLarge {
                size: declared,
                max: self.max_frame_size,
            });
        }

        let total = LENGTH_PREFIX_SIZE + declared;
        if buf.len() < total {
            return Ok(Decoded::NeedMoreData);
        }

        let mut body = &buf[LENGTH_PREFIX_SIZE..total];
        let kind = FrameKind::try_from(body.get_u8()).map_err(|kind| {
            ProtocolError::UnknownFrameKind {
                kind,
                frame_len: total,
            }
        })?;
        let sequence = body.get_u64();

        let payload_len = body.len() - TAG_SIZE;
        let payload = Bytes::copy_from_slice(&body[..payload_len]);
        let mut auth_tag = [0u8; TAG_SIZE];
        auth_tag.copy_from_slice(&body[payload_len..]);

        Ok(Decoded::Frame {
            frame: Frame::new(kind, sequence, payload, auth_tag),
            consumed: total,
        })
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME_SIZE)
    }
}

/// Decode the next frame using the default size limit
pub fn decode_next_frame(buf: &[u8]) -> ProtocolResult<Decoded> {
    FrameCodec::default().decode_next_frame(buf)
}
