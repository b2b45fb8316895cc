use flate2::{Compression, read::GzDecoder, write::GzEncoder};
use std::io::{Cursor, Read as _, Write as _};

use crate::envelope::Message;

/// Length-prefixed frame codec for byte-stream transports.
///
/// Frame layout: `u32` big-endian length (flag + body), one compression flag
/// byte, then the JSON body, gzip-compressed when it exceeds the threshold.
/// Frames, and decompressed bodies, longer than `max_frame_len` are refused.
#[derive(Debug, Clone, Copy)]
pub struct FrameCodec {
    compression_threshold: usize,
    max_frame_len: usize,
}

impl FrameCodec {
    pub const DEFAULT_COMPRESSION_THRESHOLD: usize = 1024;

    pub const DEFAULT_MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

    const HEADER_LEN: usize = 4;

    pub fn new(compression_threshold: usize) -> Self {
        Self {
            compression_threshold,
            max_frame_len: Self::DEFAULT_MAX_FRAME_LEN,
        }
    }

    pub fn with_max_frame_len(mut self, max_frame_len: usize) -> Self {
        self.max_frame_len = max_frame_len;
        self
    }

    pub fn compression_threshold(&self) -> usize {
        self.compression_threshold
    }

    pub fn max_frame_len(&self) -> usize {
        self.max_frame_len
    }

    pub fn encode(&self, message: &Message) -> Result<Vec<u8>, CodecError> {
        let json_data = serde_json::to_vec(message)
            .map_err(|e| CodecError::SerializationError(e.to_string()))?;
        // the receiver caps both the frame and the decompressed body
        if json_data.len() + 1 > self.max_frame_len {
            return Err(CodecError::FrameTooLarge);
        }

        // check if compression is needed
        let (compressed, data) = if json_data.len() > self.compression_threshold {
            (1u8, Self::compress(&json_data)?)
        } else {
            (0u8, json_data)
        };

        let data_len = u32::try_from(data.len() + 1).map_err(|_| CodecError::FrameTooLarge)?;

        let mut frame = Vec::with_capacity(Self::HEADER_LEN + 1 + data.len());
        frame
            .write_all(&data_len.to_be_bytes())
            .map_err(|e| CodecError::IoError(e.to_string()))?;
        frame
            .write_all(&[compressed])
            .map_err(|e| CodecError::IoError(e.to_string()))?;
        frame
            .write_all(&data)
            .map_err(|e| CodecError::IoError(e.to_string()))?;

        Ok(frame)
    }

    /// decode one frame from the front of `buffer`
    ///
    /// return decoded message and consumed bytes, `None` if the frame is incomplete
    pub fn decode(&self, buffer: &[u8]) -> Result<Option<(Message, usize)>, CodecError> {
        let Some(header) = buffer.get(..Self::HEADER_LEN) else {
            return Ok(None);
        };
        let data_len =
            u32::from_be_bytes([header[0], header[1], header[2], header[3]]) as usize;

        if data_len == 0 {
            return Err(CodecError::InvalidFrame);
        }
        if data_len > self.max_frame_len {
            return Err(CodecError::FrameTooLarge);
        }

        let Some(body) = buffer.get(Self::HEADER_LEN..Self::HEADER_LEN + data_len) else {
            return Ok(None);
        };

        let json_data = match body[0] {
            0 => body[1..].to_vec(),
            1 => self.decompress(&body[1..])?,
            _ => return Err(CodecError::InvalidFrame),
        };

        let message = serde_json::from_slice(&json_data)
            .map_err(|e| CodecError::DeserializationError(e.to_string()))?;

        Ok(Some((message, Self::HEADER_LEN + data_len)))
    }

    fn compress(data: &[u8]) -> Result<Vec<u8>, CodecError> {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder
            .write_all(data)
            .map_err(|e| CodecError::CompressionError(e.to_string()))?;
        encoder
            .finish()
            .map_err(|e| CodecError::CompressionError(e.to_string()))
    }

    fn decompress(&self, data: &[u8]) -> Result<Vec<u8>, CodecError> {
        let limit = u64::try_from(self.max_frame_len).unwrap_or(u64::MAX);
        let mut decoder = GzDecoder::new(Cursor::new(data)).take(limit.saturating_add(1));
        let mut result = Vec::new();
        decoder
            .read_to_end(&mut result)
            .map_err(|e| CodecError::CompressionError(e.to_string()))?;
        if result.len() > self.max_frame_len {
            return Err(CodecError::FrameTooLarge);
        }
        Ok(result)
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new(Self::DEFAULT_COMPRESSION_THRESHOLD)
    }
}

/// Error types for frame codec operations
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("Deserialization error: {0}")]
    DeserializationError(String),

    #[error("Compression error: {0}")]
    CompressionError(String),

    #[error("IO error: {0}")]
    IoError(String),

    #[error("Frame exceeds the maximum frame size")]
    FrameTooLarge,

    #[error("Invalid frame format")]
    InvalidFrame,
}

/// Frame buffer for handling incomplete reads
pub struct FrameBuffer {
    codec: FrameCodec,
    buffer: Vec<u8>,
}

impl FrameBuffer {
    pub fn new(codec: FrameCodec) -> Self {
        Self {
            codec,
            buffer: Vec::new(),
        }
    }

    pub fn push(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Try to decode a complete message from the buffer
    ///
    /// Consumed bytes are drained; `None` means more data is needed.
    pub fn try_decode(&mut self) -> Result<Option<Message>, CodecError> {
        match self.codec.decode(&self.buffer)? {
            Some((message, consumed)) => {
                self.buffer.drain(0..consumed);
                Ok(Some(message))
            }
            None => Ok(None),
        }
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    pub fn clear(&mut self) {
        self.buffer.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_encode_decode_small_message() {
        let codec = FrameCodec::default();
        let message = json!({"id": 1, "method": "query", "path": "echo", "input": "hi"});

        let encoded = codec.encode(&message).expect("Failed to encode");
        assert_eq!(encoded[4], 0, "small frames are not compressed");

        let (decoded, consumed) = codec
            .decode(&encoded)
            .expect("Failed to decode")
            .expect("No message decoded");

        assert_eq!(consumed, encoded.len());
        assert_eq!(decoded, message);
    }

    #[test]
    fn test_large_message_is_compressed() {
        let codec = FrameCodec::new(64);
        let items: Vec<String> = (0..500).map(|i| format!("item_{i}")).collect();
        let message = json!({"id": 2, "result": {"type": "data", "data": items}});

        let encoded = codec.encode(&message).expect("Failed to encode");
        assert_eq!(encoded[4], 1);

        let (decoded, _) = codec
            .decode(&encoded)
            .expect("Failed to decode")
            .expect("No message decoded");
        assert_eq!(decoded["result"]["data"].as_array().map(Vec::len), Some(500));
    }

    #[test]
    fn test_frame_buffer_partial_reads() {
        let codec = FrameCodec::default();
        let first = json!({"id": 1, "method": "subscription", "path": "ticks"});
        let second = json!([{"id": 2, "method": "subscription.stop"}]);

        let mut stream = codec.encode(&first).expect("Failed to encode");
        stream.extend(codec.encode(&second).expect("Failed to encode"));

        let mut buffer = FrameBuffer::new(codec);
        let mid = 3;
        buffer.push(&stream[..mid]);
        assert!(buffer.try_decode().expect("Decode failed").is_none());

        buffer.push(&stream[mid..]);
        assert_eq!(buffer.try_decode().expect("Decode failed"), Some(first));
        assert_eq!(buffer.try_decode().expect("Decode failed"), Some(second));
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_invalid_flag_is_rejected() {
        let codec = FrameCodec::default();
        let frame = [0, 0, 0, 2, 7, b'1'];
        assert!(matches!(codec.decode(&frame), Err(CodecError::InvalidFrame)));
    }

    #[test]
    fn test_oversized_declared_length_is_rejected_before_buffering() {
        let codec = FrameCodec::default().with_max_frame_len(1024);
        // only the header has arrived; the body would be ~4 GiB
        let mut buffer = FrameBuffer::new(codec);
        buffer.push(&u32::MAX.to_be_bytes());
        assert!(matches!(buffer.try_decode(), Err(CodecError::FrameTooLarge)));

        let too_big = json!("x".repeat(2048));
        assert!(matches!(codec.encode(&too_big), Err(CodecError::FrameTooLarge)));
        assert!(codec.encode(&json!("fits")).is_ok());
    }

    #[test]
    fn test_decompressed_body_is_capped() {
        let sender = FrameCodec::new(64);
        let receiver = FrameCodec::new(64).with_max_frame_len(4096);
        let message = json!("a".repeat(64 * 1024));

        let encoded = sender.encode(&message).expect("Failed to encode");
        assert_eq!(encoded[4], 1);
        assert!(encoded.len() < 4096, "repetitive body compresses well");
        assert!(matches!(receiver.decode(&encoded), Err(CodecError::FrameTooLarge)));
    }
}
