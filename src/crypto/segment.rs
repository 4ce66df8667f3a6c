/*
    SPDX-License-Identifier: AGPL-3.0-or-later
    SPDX-FileCopyrightText: 2025 Shomy
*/
//! Block bookkeeping for multi-token streams.
use std::ops::Range;
use zeroize::Zeroizing;

pub const AES_BLOCK: usize = 16;

/// Bytes held back after `prior` buffered bytes are joined by `new` ones.
///
/// A stream that has seen any input always keeps at least one byte, and a
/// block-aligned stream keeps a whole block, so the final block is still
/// around when the stream is closed.
pub fn leftover_len(prior: usize, new: usize) -> usize {
    let combined = prior + new;
    match combined % AES_BLOCK {
        0 if combined > 0 => AES_BLOCK,
        rem => rem,
    }
}

/// Largest block-aligned payload that fits in one token.
pub fn chunk_len(max_transfer: usize) -> usize {
    max_transfer & !(AES_BLOCK - 1)
}

/// Splits `len` bytes into ranges of at most `chunk` bytes.
pub fn plan_chunks(len: usize, chunk: usize) -> Vec<Range<usize>> {
    (0..len)
        .step_by(chunk.max(1))
        .map(|start| start..(start + chunk).min(len))
        .collect()
}

/// Buffers the tail of a stream until more input arrives or the stream ends.
#[derive(Debug, Default)]
pub struct BlockBuffer {
    pending: Zeroizing<Vec<u8>>,
    total: u64,
}

impl BlockBuffer {
    pub fn new() -> Self {
        BlockBuffer::default()
    }

    /// Adds `data` and returns the block-aligned bytes that can go to the
    /// engine now. Whatever [`leftover_len`] says stays buffered.
    pub fn push(&mut self, data: &[u8]) -> Zeroizing<Vec<u8>> {
        let keep = leftover_len(self.pending.len(), data.len());
        self.total += data.len() as u64;
        self.pending.extend_from_slice(data);

        let ready_len = self.pending.len() - keep;
        let tail = Zeroizing::new(self.pending[ready_len..].to_vec());
        self.pending.truncate(ready_len);
        std::mem::replace(&mut self.pending, tail)
    }

    /// Empties the buffer, returning the held-back bytes.
    pub fn take(&mut self) -> Zeroizing<Vec<u8>> {
        std::mem::take(&mut self.pending)
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Bytes pushed so far, submitted or not.
    pub fn total(&self) -> u64 {
        self.total
    }

    pub fn reset(&mut self) {
        self.pending = Zeroizing::new(Vec::new());
        self.total = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(0, 0, 0)]
    #[case(0, 5, 5)]
    #[case(0, 16, 16)]
    #[case(0, 32, 16)]
    #[case(16, 1, 1)]
    #[case(10, 6, 16)]
    #[case(3, 40, 11)]
    fn test_leftover_len(#[case] prior: usize, #[case] new: usize, #[case] expected: usize) {
        assert_eq!(leftover_len(prior, new), expected);
    }

    #[test]
    fn test_push_keeps_final_block() {
        let mut buf = BlockBuffer::new();
        assert!(buf.push(&[1u8; 10]).is_empty());
        assert_eq!(buf.len(), 10);

        let ready = buf.push(&[2u8; 22]);
        assert_eq!(ready.len(), 16);
        assert_eq!(&ready[..10], &[1u8; 10]);
        assert_eq!(buf.len(), 16);

        let ready = buf.push(&[3u8; 1]);
        assert_eq!(ready.len(), 16);
        assert_eq!(buf.take().as_slice(), &[3u8]);
        assert_eq!(buf.total(), 33);
    }

    #[test]
    fn test_plan_chunks() {
        assert_eq!(plan_chunks(40, 16), vec![0..16, 16..32, 32..40]);
        assert!(plan_chunks(0, 16).is_empty());
        assert_eq!(chunk_len(1025), 1024);
    }
}
