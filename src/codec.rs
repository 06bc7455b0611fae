//! Newline-delimited JSON framing
//!
//! A frame is one serialized `{meta, data}` object followed by `\n`. JSON
//! string escaping guarantees the delimiter never appears inside a payload,
//! so framing needs no length prefix. Chunk boundaries from the stream are
//! arbitrary: a frame may span many reads and a read may carry many frames.

use crate::error::{EsbError, Result};
use crate::message::Message;

/// Frame delimiter
pub const DELIMITER: u8 = b'\n';

/// Serialize a message into a single wire frame (including the delimiter)
pub fn encode_frame(msg: &Message) -> Result<String> {
    let mut frame = serde_json::to_string(msg)?;
    frame.push(DELIMITER as char);
    Ok(frame)
}

/// Decode one complete frame (without its delimiter)
pub fn decode_frame(frame: &[u8]) -> Result<Message> {
    let value: serde_json::Value = serde_json::from_slice(frame)
        .map_err(|e| EsbError::Protocol(format!("invalid frame: {}", e)))?;
    Message::from_value(value).map_err(|e| match e {
        EsbError::MalformedMessage(reason) => EsbError::Protocol(reason),
        other => other,
    })
}

/// Default bound on a single frame
pub const DEFAULT_MAX_FRAME: usize = 16 * 1024 * 1024;

/// Incremental frame decoder owning the partial-frame buffer
#[derive(Debug)]
pub struct FrameDecoder {
    buffer: Vec<u8>,
    max_frame: usize,
    // Inside an oversized frame, skipping to its delimiter
    discarding: bool,
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::with_max_frame(DEFAULT_MAX_FRAME)
    }
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decoder rejecting frames longer than `max_frame` bytes
    pub fn with_max_frame(max_frame: usize) -> Self {
        Self {
            buffer: Vec::new(),
            max_frame: max_frame.max(1),
            discarding: false,
        }
    }

    /// Feed a chunk and return every frame it completes, in arrival order
    ///
    /// Each frame is decoded independently: a bad frame yields an `Err` in
    /// its slot and the following frames are still returned. Blank lines are
    /// skipped. A frame over the size bound yields one `Err` and the rest of
    /// it is discarded up to its delimiter.
    pub fn decode(&mut self, chunk: &[u8]) -> Vec<Result<Message>> {
        let mut chunk = chunk;
        if self.discarding {
            let Some(end) = chunk.iter().position(|b| *b == DELIMITER) else {
                return Vec::new();
            };
            self.discarding = false;
            chunk = &chunk[end + 1..];
        }

        self.buffer.extend_from_slice(chunk);

        let max_frame = self.max_frame;
        let mut frames = Vec::new();
        if let Some(last) = self.buffer.iter().rposition(|b| *b == DELIMITER) {
            let rest = self.buffer.split_off(last + 1);
            let complete = std::mem::replace(&mut self.buffer, rest);

            frames.extend(
                complete
                    .split(|b| *b == DELIMITER)
                    .filter(|frame| !frame.iter().all(u8::is_ascii_whitespace))
                    .map(|frame| {
                        if frame.len() > max_frame {
                            Err(oversized(max_frame))
                        } else {
                            decode_frame(frame)
                        }
                    }),
            );
        }

        if self.buffer.len() > max_frame {
            frames.push(Err(oversized(max_frame)));
            self.reset();
            self.discarding = true;
        }
        frames
    }

    /// Bytes received after the last delimiter
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }

    /// Drop any partial frame
    pub fn reset(&mut self) {
        self.buffer.clear();
        self.discarding = false;
    }
}

fn oversized(max_frame: usize) -> EsbError {
    EsbError::Protocol(format!("frame exceeds {} bytes", max_frame))
}
