//! Line framing for the serial byte stream
//!
//! Data from the port arrives in arbitrary chunks. The framer buffers partial
//! lines across reads, drops stray flow-control bytes and yields complete
//! newline-terminated lines.

/// Bytes removed from the stream before line splitting (NUL, XON, XOFF)
const STRIPPED_BYTES: [u8; 3] = [0x00, 0x11, 0x13];

/// Upper bound on a buffered partial line
pub const MAX_LINE_LENGTH: usize = 4096;

/// Reassembles newline-terminated lines from raw reads
#[derive(Debug, Default)]
pub struct LineFramer {
    buffer: Vec<u8>,
}

impl LineFramer {
    /// Create an empty framer
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk of bytes, returning every line it completes.
    ///
    /// Lines are returned without their terminator; blank lines are skipped.
    pub fn push(&mut self, data: &[u8]) -> Vec<String> {
        let mut lines = Vec::new();

        for &byte in data {
            if STRIPPED_BYTES.contains(&byte) {
                continue;
            }
            if byte == b'\n' {
                if self.buffer.last() == Some(&b'\r') {
                    self.buffer.pop();
                }
                if !self.buffer.is_empty() {
                    lines.push(String::from_utf8_lossy(&self.buffer).into_owned());
                }
                self.buffer.clear();
                continue;
            }
            if self.buffer.len() >= MAX_LINE_LENGTH {
                tracing::warn!(
                    "Discarding {} bytes without a line terminator",
                    self.buffer.len()
                );
                self.buffer.clear();
            }
            self.buffer.push(byte);
        }

        lines
    }

    /// Number of bytes waiting for a terminator
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }

    /// Drop any partial line
    pub fn clear(&mut self) {
        self.buffer.clear();
    }
}
