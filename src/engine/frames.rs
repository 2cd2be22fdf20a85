// Decoder for the engine's interleaved log wire format:
// 1 byte stream id, 3 zero bytes, 4 bytes big-endian payload length, payload.

use bytes::Bytes;

use crate::models::{LogFrame, StreamKind};

/// Upper bound on a single frame payload. Declared lengths above this are
/// treated as stream corruption.
pub const MAX_FRAME_BYTES: usize = 1024 * 1024;

const HEADER_LEN: usize = 8;

/// Result of feeding one chunk into the decoder.
#[derive(Debug, Default)]
pub struct FeedOutcome {
    pub frames: Vec<LogFrame>,
    /// True when a declared length exceeded [`MAX_FRAME_BYTES`]; the rest of
    /// the chunk was discarded and the carry reset. The connection itself is
    /// the caller's to keep or drop.
    pub protocol_error: bool,
}

/// Stateful frame decoder. Bytes of an incomplete trailing frame are carried
/// across `feed` calls.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    carry: Vec<u8>,
}

impl FrameDecoder {
    pub fn new() -> Self {
        FrameDecoder::default()
    }

    /// Number of bytes currently held for an incomplete frame.
    pub fn pending(&self) -> usize {
        self.carry.len()
    }

    /// Decode as many complete frames as the carried bytes plus `chunk` allow.
    pub fn feed(&mut self, chunk: &[u8]) -> FeedOutcome {
        let mut data = std::mem::take(&mut self.carry);
        data.extend_from_slice(chunk);

        let mut outcome = FeedOutcome::default();
        let mut offset = 0;

        while offset < data.len() {
            if offset + HEADER_LEN > data.len() {
                // Incomplete header, keep for the next read
                self.carry = data[offset..].to_vec();
                break;
            }

            let size = u32::from_be_bytes([
                data[offset + 4],
                data[offset + 5],
                data[offset + 6],
                data[offset + 7],
            ]) as usize;

            if size > MAX_FRAME_BYTES {
                // Corrupted stream; drop the rest of this chunk
                outcome.protocol_error = true;
                break;
            }

            let frame_end = offset + HEADER_LEN + size;
            if frame_end > data.len() {
                // Incomplete frame, keep for the next read
                self.carry = data[offset..].to_vec();
                break;
            }

            let mut payload = &data[offset + HEADER_LEN..frame_end];
            // Trailing newline belongs to the wire format, not the line
            if payload.last() == Some(&b'\n') {
                payload = &payload[..payload.len() - 1];
            }

            outcome.frames.push(LogFrame {
                stream: StreamKind::from_wire(data[offset]),
                payload: Bytes::copy_from_slice(payload),
            });

            offset = frame_end;
        }

        outcome
    }
}
