//! Frame format shared by the RPC, OOB, and migration channels.
//!
//! A frame is a fixed 13-byte header followed by one rkyv-encoded
//! `Message`. Payloads past a size threshold are LZ4 block-compressed; the
//! header carries the decoded length, so decompression allocates exactly
//! once and a corrupt length field is caught before any allocation.
//!
//! Header layout, little-endian:
//!
//! ```text
//! offset 0   u32  magic "SHD1"
//! offset 4   u8   flags
//! offset 5   u32  payload_len  (bytes following the header)
//! offset 9   u32  decoded_len  (payload size after decompression)
//! ```

use crate::messages::Message;

pub const FRAME_MAGIC: u32 = u32::from_le_bytes(*b"SHD1");

pub const FRAME_HEADER_LEN: usize = 13;

/// Hard cap on a single payload, compressed or not: 64 MB. Fatbin images
/// and migration chunks stay well under this.
pub const MAX_PAYLOAD_LEN: u32 = 64 * 1024 * 1024;

/// Payloads below this many bytes skip the compression attempt.
const MIN_COMPRESS_LEN: usize = 1024;

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct FrameFlags: u8 {
        const COMPRESSED = 0b0000_0001;
    }
}

/// Decoded form of the fixed frame header.
#[derive(Debug, Clone, Copy)]
pub struct FrameHeader {
    pub flags: FrameFlags,
    pub payload_len: u32,
    pub decoded_len: u32,
}

impl FrameHeader {
    pub fn encode(&self) -> [u8; FRAME_HEADER_LEN] {
        let mut raw = [0u8; FRAME_HEADER_LEN];
        raw[0..4].copy_from_slice(&FRAME_MAGIC.to_le_bytes());
        raw[4] = self.flags.bits();
        raw[5..9].copy_from_slice(&self.payload_len.to_le_bytes());
        raw[9..13].copy_from_slice(&self.decoded_len.to_le_bytes());
        raw
    }

    pub fn decode(raw: &[u8; FRAME_HEADER_LEN]) -> Result<Self, WireError> {
        let magic = u32::from_le_bytes(raw[0..4].try_into().unwrap());
        if magic != FRAME_MAGIC {
            return Err(WireError::BadMagic);
        }
        let header = Self {
            flags: FrameFlags::from_bits_truncate(raw[4]),
            payload_len: u32::from_le_bytes(raw[5..9].try_into().unwrap()),
            decoded_len: u32::from_le_bytes(raw[9..13].try_into().unwrap()),
        };
        if header.payload_len > MAX_PAYLOAD_LEN || header.decoded_len > MAX_PAYLOAD_LEN {
            return Err(WireError::Oversized {
                got: header.payload_len.max(header.decoded_len),
            });
        }
        Ok(header)
    }

    pub fn is_compressed(&self) -> bool {
        self.flags.contains(FrameFlags::COMPRESSED)
    }
}

/// Encode one message into a ready-to-send frame.
pub fn encode_frame(msg: &Message) -> Result<Vec<u8>, WireError> {
    let encoded = rkyv::to_bytes::<rkyv::rancor::Error>(msg)
        .map_err(|e| WireError::Codec(e.to_string()))?;
    let decoded_len = encoded.len();

    // compress only when it actually shrinks the payload
    let packed = if decoded_len >= MIN_COMPRESS_LEN {
        Some(lz4_flex::compress(&encoded)).filter(|p| p.len() < decoded_len)
    } else {
        None
    };
    let (flags, body): (FrameFlags, &[u8]) = match &packed {
        Some(p) => (FrameFlags::COMPRESSED, p),
        None => (FrameFlags::empty(), &encoded),
    };

    if body.len() > MAX_PAYLOAD_LEN as usize {
        return Err(WireError::Oversized { got: body.len() as u32 });
    }

    let header = FrameHeader {
        flags,
        payload_len: body.len() as u32,
        decoded_len: decoded_len as u32,
    };

    let mut frame = Vec::with_capacity(FRAME_HEADER_LEN + body.len());
    frame.extend_from_slice(&header.encode());
    frame.extend_from_slice(body);
    Ok(frame)
}

/// Decode a payload read off the wire, guided by its header.
pub fn decode_payload(body: &[u8], header: &FrameHeader) -> Result<Message, WireError> {
    if body.len() != header.payload_len as usize {
        return Err(WireError::Codec(format!(
            "payload length {} disagrees with header {}",
            body.len(),
            header.payload_len
        )));
    }

    let message = if header.is_compressed() {
        let raw = lz4_flex::decompress(body, header.decoded_len as usize)
            .map_err(|e| WireError::Codec(format!("lz4: {e}")))?;
        rkyv::from_bytes::<Message, rkyv::rancor::Error>(&raw)
    } else {
        rkyv::from_bytes::<Message, rkyv::rancor::Error>(body)
    };
    message.map_err(|e| WireError::Codec(e.to_string()))
}

#[derive(Debug, thiserror::Error)]
pub enum WireError {
    #[error("frame does not start with the SHD1 magic")]
    BadMagic,

    #[error("frame of {got} bytes exceeds the {MAX_PAYLOAD_LEN}-byte cap")]
    Oversized { got: u32 },

    #[error("payload codec: {0}")]
    Codec(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::ParamDesc;
    use crate::messages::MigrationPayload;

    fn split(frame: &[u8]) -> (FrameHeader, &[u8]) {
        let mut raw = [0u8; FRAME_HEADER_LEN];
        raw.copy_from_slice(&frame[..FRAME_HEADER_LEN]);
        let header = FrameHeader::decode(&raw).unwrap();
        (header, &frame[FRAME_HEADER_LEN..])
    }

    #[test]
    fn small_frame_round_trips_uncompressed() {
        let msg = Message::Call {
            uuid: 7,
            api_id: 0x100,
            is_sync: true,
            params: vec![ParamDesc::value_u64(4096)],
            ret_data_len: 8,
        };
        let frame = encode_frame(&msg).unwrap();
        let (header, body) = split(&frame);

        assert!(!header.is_compressed());
        assert_eq!(header.payload_len, header.decoded_len);
        assert_eq!(body.len(), header.payload_len as usize);

        match decode_payload(body, &header).unwrap() {
            Message::Call { uuid, api_id, is_sync, params, ret_data_len } => {
                assert_eq!(uuid, 7);
                assert_eq!(api_id, 0x100);
                assert!(is_sync);
                assert_eq!(params.len(), 1);
                assert_eq!(ret_data_len, 8);
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[test]
    fn large_frame_compresses_and_carries_decoded_len() {
        let msg = Message::Migration(MigrationPayload::MemoryChunk {
            client_addr: 0x5555_0000_0000,
            version: 1,
            data: vec![0u8; 64 * 1024],
        });
        let frame = encode_frame(&msg).unwrap();
        let (header, body) = split(&frame);

        assert!(header.is_compressed());
        assert!(header.payload_len < header.decoded_len);

        match decode_payload(body, &header).unwrap() {
            Message::Migration(MigrationPayload::MemoryChunk { data, .. }) => {
                assert_eq!(data, vec![0u8; 64 * 1024]);
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[test]
    fn bad_magic_and_oversized_headers_are_rejected() {
        let mut raw = [0u8; FRAME_HEADER_LEN];
        raw[0] = b'X';
        assert!(matches!(FrameHeader::decode(&raw), Err(WireError::BadMagic)));

        let huge = FrameHeader {
            flags: FrameFlags::empty(),
            payload_len: MAX_PAYLOAD_LEN + 1,
            decoded_len: 0,
        };
        assert!(matches!(
            FrameHeader::decode(&huge.encode()),
            Err(WireError::Oversized { .. })
        ));
    }

    #[test]
    fn payload_length_mismatch_is_rejected() {
        let frame = encode_frame(&Message::OobAck { code: 0, message: String::new() }).unwrap();
        let (header, body) = split(&frame);
        assert!(matches!(
            decode_payload(&body[..body.len() - 1], &header),
            Err(WireError::Codec(_))
        ));
    }
}
