//! Growable receive buffer for the AMI line reader

use crate::{
    constants::{BUF_CHUNK, MAX_BUFFER_SIZE, MAX_MESSAGE_SIZE},
    error::{AmiError, AmiResult},
};

/// Byte buffer with a read cursor.
///
/// Consumed bytes stay in place until [`compact`](AmiBuffer::compact) moves
/// the unread tail to the front.
#[derive(Debug)]
pub(crate) struct AmiBuffer {
    data: Vec<u8>,
    pos: usize,
}

impl AmiBuffer {
    pub(crate) fn new() -> Self {
        Self {
            data: Vec::with_capacity(BUF_CHUNK),
            pos: 0,
        }
    }

    pub(crate) fn extend_from_slice(&mut self, bytes: &[u8]) {
        if self.data.capacity() - self.data.len() < bytes.len() {
            self.data
                .reserve(bytes.len().max(BUF_CHUNK));
        }
        self.data
            .extend_from_slice(bytes);
    }

    /// Unread bytes.
    pub(crate) fn len(&self) -> usize {
        self.data.len() - self.pos
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub(crate) fn check_size_limits(&self) -> AmiResult<()> {
        if self.data.len() > MAX_BUFFER_SIZE {
            return Err(AmiError::BufferOverflow {
                size: self.data.len(),
                limit: MAX_BUFFER_SIZE,
            });
        }
        Ok(())
    }

    /// Remove and return everything up to (not including) `pattern`.
    /// The pattern itself is consumed.
    pub(crate) fn extract_until_pattern(&mut self, pattern: &[u8]) -> Option<Vec<u8>> {
        let unread = &self.data[self.pos..];
        let idx = unread
            .windows(pattern.len())
            .position(|w| w == pattern)?;
        let out = unread[..idx].to_vec();
        self.pos += idx + pattern.len();
        Some(out)
    }

    /// Length of the unread region with no terminator in sight.
    /// Used to reject a single runaway line.
    pub(crate) fn check_pending_line(&self) -> AmiResult<()> {
        if self.len() > MAX_MESSAGE_SIZE {
            return Err(AmiError::BufferOverflow {
                size: self.len(),
                limit: MAX_MESSAGE_SIZE,
            });
        }
        Ok(())
    }

    pub(crate) fn take_remaining(&mut self) -> Vec<u8> {
        let out = self.data[self.pos..].to_vec();
        self.clear();
        out
    }

    pub(crate) fn compact(&mut self) {
        if self.pos == 0 {
            return;
        }
        self.data
            .drain(..self.pos);
        self.pos = 0;
    }

    pub(crate) fn clear(&mut self) {
        self.data
            .clear();
        self.pos = 0;
    }
}
