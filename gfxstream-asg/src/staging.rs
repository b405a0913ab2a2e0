// Write staging area for streams
//
// Copyright 2024 Red Hat Inc
//
// SPDX-License-Identifier: Apache-2.0 or BSD-3-Clause

use std::cmp::max;

use log::trace;

/// Buffered write area. Bytes are appended at `write_pos` and drained from
/// `read_pos`. The area rewinds once everything written has been drained.
#[derive(Debug, Default)]
pub struct StagingBuffer {
    buf: Vec<u8>,
    write_pos: usize,
    read_pos: usize,
}

impl StagingBuffer {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: vec![0; capacity],
            write_pos: 0,
            read_pos: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    /// Bytes written and not drained yet.
    pub fn pending(&self) -> usize {
        self.write_pos - self.read_pos
    }

    pub fn is_empty(&self) -> bool {
        self.pending() == 0
    }

    fn ensure(&mut self, size: usize) {
        let needed = self.write_pos + size;
        if needed > self.buf.len() {
            let capacity = max(self.buf.len() * 2, needed);
            trace!("staging: growing {} -> {capacity} bytes", self.buf.len());
            self.buf.resize(capacity, 0);
        }
    }

    /// Writable window of `size` bytes after the pending data. It only
    /// becomes pending once `advance` is called.
    pub fn reserve(&mut self, size: usize) -> &mut [u8] {
        self.ensure(size);
        &mut self.buf[self.write_pos..self.write_pos + size]
    }

    /// Marks `size` reserved bytes as written. Returns false if fewer bytes
    /// were reserved.
    pub fn advance(&mut self, size: usize) -> bool {
        if self.write_pos + size > self.buf.len() {
            return false;
        }
        self.write_pos += size;
        true
    }

    pub fn write(&mut self, data: &[u8]) {
        self.reserve(data.len()).copy_from_slice(data);
        self.write_pos += data.len();
    }

    pub fn pending_bytes(&self) -> &[u8] {
        &self.buf[self.read_pos..self.write_pos]
    }

    /// Drops `size` bytes from the front of the pending data.
    pub fn drain(&mut self, size: usize) {
        self.read_pos = (self.read_pos + size).min(self.write_pos);
        if self.read_pos == self.write_pos {
            self.reset();
        }
    }

    /// Forgets everything, keeping the allocation.
    pub fn reset(&mut self) {
        self.read_pos = 0;
        self.write_pos = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_linear_growth() {
        let mut staging = StagingBuffer::with_capacity(16);
        staging.write(&[1; 10]);
        // Doubling is enough.
        staging.write(&[2; 10]);
        assert_eq!(staging.capacity(), 32);
        // Doubling is not enough, grow to exactly what is needed.
        staging.write(&[3; 100]);
        assert_eq!(staging.capacity(), 120);
        assert_eq!(staging.pending(), 120);

        let mut staging = StagingBuffer::default();
        staging.write(&[0; 5]);
        assert_eq!(staging.capacity(), 5);
    }

    #[test]
    fn test_reserve_advance() {
        let mut staging = StagingBuffer::with_capacity(4);
        staging.reserve(8).copy_from_slice(&[7; 8]);
        assert!(staging.is_empty());
        assert!(staging.advance(8));
        assert_eq!(staging.pending_bytes(), &[7; 8]);
        assert!(!staging.advance(1));
    }

    #[test]
    fn test_drain_rewinds() {
        let mut staging = StagingBuffer::with_capacity(8);
        staging.write(&[1, 2, 3, 4, 5, 6]);
        staging.drain(4);
        assert_eq!(staging.pending_bytes(), &[5, 6]);
        staging.drain(2);
        assert!(staging.is_empty());
        // The next write starts at the beginning again.
        staging.write(&[9; 8]);
        assert_eq!(staging.capacity(), 8);
    }
}
