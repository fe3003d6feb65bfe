//! Open file state.
//!
//! A filesystem chooses a file handle when a file or directory gets opened. The kernel passes it
//! back unchanged with every subsequent operation on the same open file, up to and including the
//! final release. `FileHandle` is a read-only view of that per-open-file state, `Open` is what a
//! filesystem replies with when opening.

use std::fmt;


/// Read-only view of the per-open-file state the kernel attaches to an operation.
#[derive(Clone, Copy, Default, Eq, PartialEq)]
pub struct FileHandle {
    fh: u64,
    flags: u32,
    lock_owner: Option<u64>,
    flush: bool,
    flock_release: bool,
    writepage: bool,
}

impl FileHandle {
    /// Create a view of the given handle and open flags.
    pub fn new(fh: u64, flags: u32) -> Self {
        Self { fh, flags, ..Self::default() }
    }

    pub(crate) fn with_lock_owner(mut self, lock_owner: Option<u64>) -> Self {
        self.lock_owner = lock_owner;
        self
    }

    pub(crate) fn with_flush(mut self, flush: bool) -> Self {
        self.flush = flush;
        self
    }

    pub(crate) fn with_flock_release(mut self, flock_release: bool) -> Self {
        self.flock_release = flock_release;
        self
    }

    pub(crate) fn with_writepage(mut self, writepage: bool) -> Self {
        self.writepage = writepage;
        self
    }

    /// File handle chosen by the filesystem at open time. Zero for `open`, `opendir` and `create`
    /// requests, since no handle has been assigned yet.
    pub fn fh(&self) -> u64 {
        self.fh
    }

    /// Open flags (`O_RDONLY`, `O_APPEND`, ...) as passed to open(2).
    pub fn flags(&self) -> u32 {
        self.flags
    }

    /// Owner of locks held on this file, if the kernel provided one.
    pub fn lock_owner(&self) -> Option<u64> {
        self.lock_owner
    }

    /// Whether a `release` should flush data as well.
    pub fn flush(&self) -> bool {
        self.flush
    }

    /// Whether a `release` should also release BSD style (flock) locks of the lock owner.
    pub fn flock_release(&self) -> bool {
        self.flock_release
    }

    /// Whether a `write` originates from the page cache (delayed write), in which case the file
    /// handle is guessed by the kernel.
    pub fn writepage(&self) -> bool {
        self.writepage
    }
}

impl fmt::Debug for FileHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileHandle")
            .field("fh", &self.fh)
            .field("flags", &format_args!("{:#x}", self.flags))
            .field("lock_owner", &self.lock_owner)
            .field("flush", &self.flush)
            .field("flock_release", &self.flock_release)
            .field("writepage", &self.writepage)
            .finish()
    }
}


/// Result of opening a file or directory.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct Open {
    /// File handle to use for further operations on the opened file.
    pub fh: u64,
    /// Bypass the page cache for this open file.
    pub direct_io: bool,
    /// Don't invalidate the data cache on open.
    pub keep_cache: bool,
    /// The file is not seekable.
    pub nonseekable: bool,
}

impl Open {
    /// Open result with the given file handle and default flags.
    pub fn new(fh: u64) -> Self {
        Self { fh, ..Self::default() }
    }
}
