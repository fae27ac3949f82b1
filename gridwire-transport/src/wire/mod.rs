//! Wire format for transport frames.
//!
//! Frame format: `[length:4][checksum:4][request_id:8][kind:1][payload:N]`
//!
//! - **length**: Total frame size including header (little-endian u32)
//! - **checksum**: CRC32C of (request_id + kind + payload)
//! - **request_id**: Correlation id, [`NO_REQUEST_ID`] for one-way traffic
//! - **kind**: [`FrameKind`] discriminant
//! - **payload**: Marshalled command or response
//!
//! A [`FrameKind::Batch`] frame carries a bundle produced by the outbound
//! bundler: its payload is `[count:4]` followed by `count` complete frames.

use crate::request::{NO_REQUEST_ID, RequestId};

/// Header size: 4 (length) + 4 (checksum) + 8 (request id) + 1 (kind).
pub const HEADER_SIZE: usize = 17;

/// Maximum payload size (16MB).
///
/// Frames larger than this are rejected to prevent memory exhaustion.
pub const MAX_PAYLOAD_SIZE: usize = 16 * 1024 * 1024;

/// Wire format error types.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WireError {
    /// Not enough data to parse the frame.
    #[error("insufficient data: need {needed} bytes, have {have}")]
    InsufficientData {
        /// Minimum bytes required to parse.
        needed: usize,
        /// Actual bytes available.
        have: usize,
    },

    /// Checksum verification failed - data was corrupted.
    #[error("checksum mismatch: expected {expected:#010x}, got {actual:#010x}")]
    ChecksumMismatch {
        /// Expected checksum from header.
        expected: u32,
        /// Computed checksum from data.
        actual: u32,
    },

    /// Payload exceeds maximum allowed size.
    #[error("frame too large: {size} bytes (max {MAX_PAYLOAD_SIZE})")]
    FrameTooLarge {
        /// Actual payload size in bytes.
        size: usize,
    },

    /// Length field has an invalid value.
    #[error("invalid frame length: {length}")]
    InvalidLength {
        /// The invalid length value from the header.
        length: u32,
    },

    /// Unknown frame kind discriminant.
    #[error("unknown frame kind: {kind}")]
    UnknownKind {
        /// The raw discriminant.
        kind: u8,
    },

    /// Ordering flags that do not map to a delivery order.
    #[error("invalid ordering flags: {bits:#06x}")]
    InvalidOrderFlags {
        /// The raw flag bits.
        bits: u16,
    },
}

/// What a frame carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrameKind {
    /// A command that expects a correlated response.
    Request,
    /// A response to a request.
    Response,
    /// A one-way command.
    SingleMessage,
    /// A bundle of frames for the same destination.
    Batch,
}

impl FrameKind {
    fn to_byte(self) -> u8 {
        match self {
            FrameKind::Request => 0,
            FrameKind::Response => 1,
            FrameKind::SingleMessage => 2,
            FrameKind::Batch => 3,
        }
    }

    fn from_byte(byte: u8) -> Result<Self, WireError> {
        match byte {
            0 => Ok(FrameKind::Request),
            1 => Ok(FrameKind::Response),
            2 => Ok(FrameKind::SingleMessage),
            3 => Ok(FrameKind::Batch),
            kind => Err(WireError::UnknownKind { kind }),
        }
    }
}

/// A decoded frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Correlation id.
    pub request_id: RequestId,
    /// Frame kind.
    pub kind: FrameKind,
    /// Marshalled body.
    pub payload: Vec<u8>,
}

fn compute_checksum(request_id: RequestId, kind: u8, payload: &[u8]) -> u32 {
    let crc = crc32c::crc32c(&request_id.to_le_bytes());
    let crc = crc32c::crc32c_append(crc, &[kind]);
    crc32c::crc32c_append(crc, payload)
}

/// Serialize a frame.
///
/// # Errors
///
/// Returns `FrameTooLarge` if payload exceeds MAX_PAYLOAD_SIZE.
///
/// # Examples
///
/// ```
/// use gridwire_transport::wire::{FrameKind, decode_frame, encode_frame};
///
/// let bytes = encode_frame(FrameKind::Request, 42, b"get k").expect("encode");
/// let frame = decode_frame(&bytes).expect("decode");
///
/// assert_eq!(frame.request_id, 42);
/// assert_eq!(frame.kind, FrameKind::Request);
/// assert_eq!(frame.payload, b"get k");
/// ```
pub fn encode_frame(
    kind: FrameKind,
    request_id: RequestId,
    payload: &[u8],
) -> Result<Vec<u8>, WireError> {
    if payload.len() > MAX_PAYLOAD_SIZE {
        return Err(WireError::FrameTooLarge {
            size: payload.len(),
        });
    }

    let kind_byte = kind.to_byte();
    let total_length = HEADER_SIZE + payload.len();
    let mut data = Vec::with_capacity(total_length);
    data.extend_from_slice(&(total_length as u32).to_le_bytes());
    data.extend_from_slice(&compute_checksum(request_id, kind_byte, payload).to_le_bytes());
    data.extend_from_slice(&request_id.to_le_bytes());
    data.push(kind_byte);
    data.extend_from_slice(payload);
    Ok(data)
}

/// Decode one frame from the start of `data`, returning it and the number
/// of bytes consumed.
fn decode_prefix(data: &[u8]) -> Result<(Frame, usize), WireError> {
    if data.len() < HEADER_SIZE {
        return Err(WireError::InsufficientData {
            needed: HEADER_SIZE,
            have: data.len(),
        });
    }

    let length = u32::from_le_bytes([data[0], data[1], data[2], data[3]]);
    let checksum = u32::from_le_bytes([data[4], data[5], data[6], data[7]]);
    let mut id_bytes = [0u8; 8];
    id_bytes.copy_from_slice(&data[8..16]);
    let request_id = u64::from_le_bytes(id_bytes);
    let kind_byte = data[16];

    if (length as usize) < HEADER_SIZE {
        return Err(WireError::InvalidLength { length });
    }
    let payload_len = length as usize - HEADER_SIZE;
    if payload_len > MAX_PAYLOAD_SIZE {
        return Err(WireError::FrameTooLarge { size: payload_len });
    }
    if data.len() < length as usize {
        return Err(WireError::InsufficientData {
            needed: length as usize,
            have: data.len(),
        });
    }

    let payload = &data[HEADER_SIZE..length as usize];
    let actual = compute_checksum(request_id, kind_byte, payload);
    if actual != checksum {
        return Err(WireError::ChecksumMismatch {
            expected: checksum,
            actual,
        });
    }

    let frame = Frame {
        request_id,
        kind: FrameKind::from_byte(kind_byte)?,
        payload: payload.to_vec(),
    };
    Ok((frame, length as usize))
}

/// Deserialize a frame, validating checksum.
///
/// # Errors
///
/// - `InsufficientData`: Not enough bytes to parse header or full frame
/// - `ChecksumMismatch`: Data was corrupted
/// - `InvalidLength`: Length field is malformed or trailing bytes remain
/// - `UnknownKind`: Kind byte is not a known frame kind
pub fn decode_frame(data: &[u8]) -> Result<Frame, WireError> {
    let (frame, consumed) = decode_prefix(data)?;
    if consumed != data.len() {
        return Err(WireError::InvalidLength {
            length: data.len() as u32,
        });
    }
    Ok(frame)
}

/// Serialize already-encoded frames into one batch frame.
///
/// # Errors
///
/// Returns `FrameTooLarge` if the combined frames exceed MAX_PAYLOAD_SIZE.
pub fn encode_batch(frames: &[Vec<u8>]) -> Result<Vec<u8>, WireError> {
    let body_len: usize = frames.iter().map(Vec::len).sum();
    let mut payload = Vec::with_capacity(4 + body_len);
    payload.extend_from_slice(&(frames.len() as u32).to_le_bytes());
    for frame in frames {
        payload.extend_from_slice(frame);
    }
    encode_frame(FrameKind::Batch, NO_REQUEST_ID, &payload)
}

/// Split the payload of a batch frame back into its frames.
///
/// # Errors
///
/// Any inner frame failing to decode fails the whole batch, as does a count
/// that disagrees with the payload.
pub fn decode_batch(payload: &[u8]) -> Result<Vec<Frame>, WireError> {
    if payload.len() < 4 {
        return Err(WireError::InsufficientData {
            needed: 4,
            have: payload.len(),
        });
    }
    let count = u32::from_le_bytes([payload[0], payload[1], payload[2], payload[3]]);

    let mut frames = Vec::with_capacity(count as usize);
    let mut offset = 4;
    for _ in 0..count {
        let (frame, consumed) = decode_prefix(&payload[offset..])?;
        frames.push(frame);
        offset += consumed;
    }
    if offset != payload.len() {
        return Err(WireError::InvalidLength {
            length: payload.len() as u32,
        });
    }
    Ok(frames)
}
