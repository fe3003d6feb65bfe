//! Low-level kernel replies.
//!
//! A response to the kernel driver consists of a `fuse_out_header` followed by an optional
//! payload, typically one of the `fuse_*_out` structs. Responses are handed to a writer as
//! a list of `IoSlice`s so that payload data doesn't need to be copied.

use std::borrow::Cow;
use std::ffi::OsStr;
use std::io::IoSlice;
use std::os::unix::ffi::OsStrExt;
use std::time::Duration;
use std::{mem, slice};

use fuse_abi::consts::{FOPEN_DIRECT_IO, FOPEN_KEEP_CACHE, FOPEN_NONSEEKABLE};
use fuse_abi::{fuse_attr_out, fuse_dirent, fuse_entry_out, fuse_file_lock, fuse_kstatfs};
use fuse_abi::{fuse_lk_out, fuse_open_out, fuse_out_header, fuse_statfs_out};
use libc::c_int;

use super::attr::{FileAttr, FileType};
use crate::file_handle::Open;
use crate::reply::{Entry, StatFs};
use crate::request::Lock;


/// View a plain `#[repr(C)]` ABI struct as raw bytes.
pub(crate) fn struct_bytes<T: Copy>(value: &T) -> &[u8] {
    // Safety: the FUSE ABI structs consist of integer fields with explicit padding members, so
    // all `size_of::<T>()` bytes are initialized.
    unsafe { slice::from_raw_parts(value as *const T as *const u8, mem::size_of::<T>()) }
}


/// A response to the kernel driver.
#[derive(Debug)]
pub struct Response<'a> {
    header: fuse_out_header,
    payload: Cow<'a, [u8]>,
}

impl<'a> Response<'a> {
    /// Create a new response to the request with the given unique id. On success, the payload is
    /// sent after the header, on error only the header carrying the negated error code is sent.
    pub fn new(unique: u64, result: Result<Cow<'a, [u8]>, c_int>) -> Self {
        let (error, payload) = match result {
            Ok(payload) => (0, payload),
            Err(errno) => (-errno, Cow::Borrowed(&[][..])),
        };
        let header = fuse_out_header {
            len: (mem::size_of::<fuse_out_header>() + payload.len()) as u32,
            error,
            unique,
        };
        Self { header, payload }
    }

    /// Response without payload.
    pub fn empty(unique: u64) -> Self {
        Self::new(unique, Ok(Cow::Borrowed(&[][..])))
    }

    /// Error response.
    pub fn error(unique: u64, errno: c_int) -> Self {
        Self::new(unique, Err(errno))
    }

    /// Response carrying a borrowed block of data.
    pub fn data(unique: u64, data: &'a [u8]) -> Self {
        Self::new(unique, Ok(Cow::Borrowed(data)))
    }

    /// Response carrying a copy of an ABI struct.
    pub fn with_struct<T: Copy>(unique: u64, value: &T) -> Self {
        Self::new(unique, Ok(Cow::Owned(struct_bytes(value).to_vec())))
    }

    /// Returns the unique id of the request this response answers.
    pub fn unique(&self) -> u64 {
        self.header.unique
    }

    /// Returns the (negated) error code of this response, 0 on success.
    pub fn error_code(&self) -> i32 {
        self.header.error
    }

    /// Returns the total length of the encoded response.
    pub fn len(&self) -> usize {
        self.header.len as usize
    }

    /// Returns true if this response has no payload.
    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }

    /// Returns the encoded response as a list of `IoSlice`s, suitable for `write_vectored`.
    pub fn to_io_slices(&self) -> Vec<IoSlice<'_>> {
        let mut slices = vec![IoSlice::new(struct_bytes(&self.header))];
        if !self.payload.is_empty() {
            slices.push(IoSlice::new(&self.payload));
        }
        slices
    }
}


fn ttl_parts(ttl: &Duration) -> (u64, u32) {
    (ttl.as_secs(), ttl.subsec_nanos())
}

/// Kernel representation of a directory entry lookup result.
pub(crate) fn entry_out(entry: &Entry) -> fuse_entry_out {
    let (entry_valid, entry_valid_nsec) = ttl_parts(&entry.entry_ttl);
    let (attr_valid, attr_valid_nsec) = ttl_parts(&entry.attr_ttl);
    fuse_entry_out {
        nodeid: entry.attr.ino,
        generation: entry.generation,
        entry_valid,
        attr_valid,
        entry_valid_nsec,
        attr_valid_nsec,
        attr: (&entry.attr).into(),
    }
}

/// Kernel representation of file attributes.
pub(crate) fn attr_out(ttl: &Duration, attr: &FileAttr) -> fuse_attr_out {
    let (attr_valid, attr_valid_nsec) = ttl_parts(ttl);
    fuse_attr_out { attr_valid, attr_valid_nsec, dummy: 0, attr: attr.into() }
}

/// Kernel representation of an opened file.
pub(crate) fn open_out(open: &Open) -> fuse_open_out {
    let mut open_flags = 0;
    if open.direct_io {
        open_flags |= FOPEN_DIRECT_IO;
    }
    if open.keep_cache {
        open_flags |= FOPEN_KEEP_CACHE;
    }
    if open.nonseekable {
        open_flags |= FOPEN_NONSEEKABLE;
    }
    fuse_open_out { fh: open.fh, open_flags, padding: 0 }
}

/// Kernel representation of filesystem statistics.
pub(crate) fn statfs_out(st: &StatFs) -> fuse_statfs_out {
    fuse_statfs_out {
        st: fuse_kstatfs {
            blocks: st.blocks,
            bfree: st.bfree,
            bavail: st.bavail,
            files: st.files,
            ffree: st.ffree,
            bsize: st.bsize,
            namelen: st.namelen,
            frsize: st.frsize,
            padding: 0,
            spare: [0; 6],
        },
    }
}

/// Kernel representation of a file lock.
pub(crate) fn lk_out(lock: &Lock) -> fuse_lk_out {
    fuse_lk_out {
        lk: fuse_file_lock { start: lock.start, end: lock.end, typ: lock.typ, pid: lock.pid },
    }
}

/// Append a directory entry to a readdir buffer.
///
/// Entries are 64bit aligned. Returns false without touching the buffer if the entry doesn't fit
/// into `limit` bytes.
pub(crate) fn append_dirent(buf: &mut Vec<u8>, limit: usize, ino: u64, offset: i64, kind: FileType, name: &OsStr) -> bool {
    let name = name.as_bytes();
    let entlen = mem::size_of::<fuse_dirent>() + name.len();
    let entsize = (entlen + mem::size_of::<u64>() - 1) & !(mem::size_of::<u64>() - 1);
    if buf.len() + entsize > limit {
        return false;
    }
    let dirent = fuse_dirent {
        ino,
        off: offset as u64,
        namelen: name.len() as u32,
        typ: kind.mode_bits() >> 12,
    };
    buf.extend_from_slice(struct_bytes(&dirent));
    buf.extend_from_slice(name);
    buf.resize(buf.len() + entsize - entlen, 0);
    true
}


#[cfg(test)]
mod test {
    use super::*;

    fn encoded(response: &Response<'_>) -> Vec<u8> {
        response.to_io_slices().iter().flat_map(|s| s.iter()).copied().collect()
    }

    #[test]
    #[cfg(target_endian = "little")]
    fn empty_response() {
        let response = Response::empty(0xdeadbeef);
        assert_eq!(encoded(&response), vec![
            0x10, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,  0xef, 0xbe, 0xad, 0xde, 0x00, 0x00, 0x00, 0x00,
        ]);
        assert_eq!(response.to_io_slices().len(), 1);
    }

    #[test]
    #[cfg(target_endian = "little")]
    fn error_response() {
        let response = Response::error(0xdeadbeef, libc::ENOENT);
        assert_eq!(response.error_code(), -libc::ENOENT);
        assert_eq!(encoded(&response), vec![
            0x10, 0x00, 0x00, 0x00, 0xfe, 0xff, 0xff, 0xff,  0xef, 0xbe, 0xad, 0xde, 0x00, 0x00, 0x00, 0x00,
        ]);
    }

    #[test]
    #[cfg(target_endian = "little")]
    fn data_response() {
        let data = [0xde, 0xad, 0xbe, 0xef];
        let response = Response::data(0xdeadbeef, &data);
        assert_eq!(response.len(), 20);
        assert_eq!(encoded(&response), vec![
            0x14, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,  0xef, 0xbe, 0xad, 0xde, 0x00, 0x00, 0x00, 0x00,
            0xde, 0xad, 0xbe, 0xef,
        ]);
    }

    #[test]
    fn open_flags() {
        let open = Open { fh: 0x1122, direct_io: true, keep_cache: false, nonseekable: true };
        let out = open_out(&open);
        assert_eq!(out.fh, 0x1122);
        assert_eq!(out.open_flags, FOPEN_DIRECT_IO | FOPEN_NONSEEKABLE);
    }

    #[test]
    fn dirent_alignment_and_limit() {
        let mut buf = Vec::new();
        assert!(append_dirent(&mut buf, 64, 1, 1, FileType::Directory, OsStr::new("hello")));
        assert_eq!(buf.len(), 32);
        assert!(!append_dirent(&mut buf, 64, 2, 2, FileType::RegularFile, OsStr::new("a-longer-name")));
        assert_eq!(buf.len(), 32);
    }
}
