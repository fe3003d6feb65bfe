//! Argument decomposition for FUSE operation requests.
//!
//! Helper to decompose a slice of binary data (incoming FUSE request) into multiple data
//! structures (request arguments).

use std::ffi::OsStr;
use std::mem;
use std::os::unix::ffi::OsStrExt;
use std::ptr;


/// An iterator that can be used to fetch typed arguments from a byte slice.
#[derive(Debug)]
pub struct ArgumentIterator<'a> {
    data: &'a [u8],
}

impl<'a> ArgumentIterator<'a> {
    /// Create a new argument iterator for the given byte slice.
    pub fn new(data: &'a [u8]) -> Self {
        Self { data }
    }

    /// Returns the size of the remaining data.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Returns true if all data has been consumed.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Fetch a slice of all remaining bytes.
    pub fn fetch_all(&mut self) -> &'a [u8] {
        let bytes = self.data;
        self.data = &[];
        bytes
    }

    /// Fetch a slice of the given number of bytes.
    pub fn fetch_bytes(&mut self, len: usize) -> Option<&'a [u8]> {
        if len > self.data.len() {
            return None;
        }
        let (bytes, rest) = self.data.split_at(len);
        self.data = rest;
        Some(bytes)
    }

    /// Fetch a typed argument.
    ///
    /// The argument is copied out of the buffer, so the buffer doesn't need to be aligned for
    /// `T`. Only plain `#[repr(C)]` ABI structs may be fetched this way.
    pub fn fetch<T: Copy>(&mut self) -> Option<T> {
        let bytes = self.fetch_bytes(mem::size_of::<T>())?;
        // Safety: `bytes` holds exactly `size_of::<T>()` bytes and the FUSE ABI structs consist
        // of integer fields only, so every bit pattern is a valid value.
        Some(unsafe { ptr::read_unaligned(bytes.as_ptr() as *const T) })
    }

    /// Fetch a number of typed arguments.
    pub fn fetch_array<T: Copy>(&mut self, count: usize) -> Option<Vec<T>> {
        (0..count).map(|_| self.fetch()).collect()
    }

    /// Fetch a (zero-terminated) string (can be non-utf8).
    pub fn fetch_str(&mut self) -> Option<&'a OsStr> {
        let len = self.data.iter().position(|&c| c == 0)?;
        let bytes = self.fetch_bytes(len)?;
        self.data = &self.data[1..];
        Some(OsStr::from_bytes(bytes))
    }
}
