use std::io::{self, Read, Write};

/// A growable byte buffer with an explicit drain offset.
///
/// Data lives in `[idx, len)` of the backing array. Receives append at `len`,
/// partial writes advance `idx`, and the backing array only ever grows.
pub struct Buffer {
    data: Vec<u8>,
    len: usize,
    idx: usize,
}

impl Buffer {
    #[inline]
    pub fn new(capacity: usize) -> Buffer {
        Buffer {
            data: vec![0; capacity],
            len: 0,
            idx: 0,
        }
    }

    /// Capacity of the backing array.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    /// Number of pending bytes, i.e. written but not yet drained.
    #[inline]
    pub fn remaining(&self) -> usize {
        self.len - self.idx
    }

    /// True when no pending bytes are left.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == self.idx
    }

    /// Grows the backing array to `max(need, hint)`. Never shrinks.
    #[inline]
    pub fn grow(&mut self, need: usize, hint: usize) {
        let want = need.max(hint);
        if self.data.len() < want {
            self.data.resize(want, 0);
        }
    }

    #[inline]
    pub fn clear(&mut self) {
        self.len = 0;
        self.idx = 0;
    }

    /// The pending slice awaiting drain.
    #[inline]
    pub fn pending(&self) -> &[u8] {
        &self.data[self.idx..self.len]
    }

    /// Mutable view of the pending slice, for in-place transforms.
    #[inline]
    pub fn pending_mut(&mut self) -> &mut [u8] {
        &mut self.data[self.idx..self.len]
    }

    /// Appends bytes at the tail, growing as needed.
    pub fn push(&mut self, bytes: &[u8]) {
        let end = self.len + bytes.len();
        self.grow(end, 0);
        self.data[self.len..end].copy_from_slice(bytes);
        self.len = end;
    }

    /// Inserts bytes in front of the pending region.
    pub fn prepend(&mut self, bytes: &[u8]) {
        if bytes.is_empty() {
            return;
        }
        let n = bytes.len();
        self.grow(self.len + n, 0);
        self.data.copy_within(self.idx..self.len, self.idx + n);
        self.data[self.idx..self.idx + n].copy_from_slice(bytes);
        self.len += n;
    }

    /// Removes `count` bytes from the front of the pending region,
    /// compacting the remainder.
    pub fn strip_front(&mut self, count: usize) {
        debug_assert!(count <= self.remaining());
        self.data.copy_within(self.idx + count..self.len, self.idx);
        self.len -= count;
        if self.is_empty() {
            self.clear();
        }
    }

    /// Marks `count` pending bytes as drained. Resets the offsets once
    /// everything has been consumed.
    #[inline]
    pub fn advance(&mut self, count: usize) {
        self.idx += count;
        debug_assert!(self.idx <= self.len);
        if self.is_empty() {
            self.clear();
        }
    }

    /// Shortens the pending region to `count` bytes.
    #[inline]
    pub fn truncate(&mut self, count: usize) {
        debug_assert!(count <= self.remaining());
        self.len = self.idx + count;
    }

    /// Replaces the contents with `bytes`.
    pub fn set(&mut self, bytes: &[u8]) {
        self.clear();
        self.push(bytes);
    }

    /// Reads once from `r` into the tail. `Ok(0)` means end of stream.
    pub fn recv<R: Read>(&mut self, r: &mut R) -> io::Result<usize> {
        debug_assert!(self.len < self.data.len());
        let n = r.read(&mut self.data[self.len..])?;
        self.len += n;
        Ok(n)
    }

    /// Writes the pending region to `w` until it drains or the writer blocks.
    /// A blocked writer surfaces as `WouldBlock` with the partial progress
    /// already recorded in the drain offset.
    pub fn send<W: Write>(&mut self, w: &mut W) -> io::Result<usize> {
        let mut total = 0;
        while !self.is_empty() {
            match w.write(self.pending()) {
                Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                Ok(n) => {
                    total += n;
                    self.advance(n);
                }
                Err(e) => return Err(e),
            }
        }
        Ok(total)
    }
}
