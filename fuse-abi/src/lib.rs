//! FUSE kernel interface
//!
//! Types and definitions used for communication between the kernel driver and the userspace
//! request proxy. Since the kernel driver may be installed independently, the ABI interface is
//! versioned and capabilities are exchanged during the initialization (mounting) of a
//! filesystem.
//!
//! libfuse (Linux/BSD): https://github.com/libfuse/libfuse/blob/master/include/fuse_kernel.h
//! - supports ABI 7.8 since FUSE 2.6.0
//! - supports ABI 7.26 since FUSE 3.0.0
//!
//! Only the subset of the ABI that carries the operations forwarded to filesystem handlers is
//! defined here. Types/fields without a version annotation are valid with ABI 7.8 and later.

#![allow(non_camel_case_types, missing_docs)]

use std::convert::TryFrom;

pub const FUSE_KERNEL_VERSION: u32 = 7;
pub const FUSE_KERNEL_MINOR_VERSION: u32 = 26;

/// Oldest ABI version we are able to talk to
pub const FUSE_MIN_KERNEL_MINOR_VERSION: u32 = 9;

pub const FUSE_ROOT_ID: u64 = 1;

#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub struct fuse_attr {
    pub ino: u64,
    pub size: u64,
    pub blocks: u64,
    pub atime: i64,
    pub mtime: i64,
    pub ctime: i64,
    #[cfg(target_os = "macos")]
    pub crtime: i64,
    pub atimensec: u32,
    pub mtimensec: u32,
    pub ctimensec: u32,
    #[cfg(target_os = "macos")]
    pub crtimensec: u32,
    pub mode: u32,
    pub nlink: u32,
    pub uid: u32,
    pub gid: u32,
    pub rdev: u32,
    #[cfg(target_os = "macos")]
    pub flags: u32,                                     // see chflags(2)
    pub blksize: u32,                                   // since ABI 7.9
    pub padding: u32,                                   // since ABI 7.9
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub struct fuse_kstatfs {
    pub blocks: u64,                                    // Total blocks (in units of frsize)
    pub bfree: u64,                                     // Free blocks
    pub bavail: u64,                                    // Free blocks for unprivileged users
    pub files: u64,                                     // Total inodes
    pub ffree: u64,                                     // Free inodes
    pub bsize: u32,                                     // Filesystem block size
    pub namelen: u32,                                   // Maximum filename length
    pub frsize: u32,                                    // Fundamental file system block size
    pub padding: u32,
    pub spare: [u32; 6],
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub struct fuse_file_lock {
    pub start: u64,
    pub end: u64,
    pub typ: u32,
    pub pid: u32,
}

pub mod consts {
    // Bitmasks for fuse_setattr_in.valid
    pub const FATTR_MODE: u32               = 1 << 0;
    pub const FATTR_UID: u32                = 1 << 1;
    pub const FATTR_GID: u32                = 1 << 2;
    pub const FATTR_SIZE: u32               = 1 << 3;
    pub const FATTR_ATIME: u32              = 1 << 4;
    pub const FATTR_MTIME: u32              = 1 << 5;
    pub const FATTR_FH: u32                 = 1 << 6;
    pub const FATTR_ATIME_NOW: u32          = 1 << 7;   // since ABI 7.9
    pub const FATTR_MTIME_NOW: u32          = 1 << 8;   // since ABI 7.9
    pub const FATTR_LOCKOWNER: u32          = 1 << 9;   // since ABI 7.9
    pub const FATTR_CTIME: u32              = 1 << 10;  // since ABI 7.23

    // Flags returned by the open request
    pub const FOPEN_DIRECT_IO: u32          = 1 << 0;   // bypass page cache for this open file
    pub const FOPEN_KEEP_CACHE: u32         = 1 << 1;   // don't invalidate the data cache on open
    pub const FOPEN_NONSEEKABLE: u32        = 1 << 2;   // since ABI 7.10: the file is not seekable

    // Init request/reply flags
    pub const FUSE_ASYNC_READ: u32          = 1 << 0;   // asynchronous read requests
    pub const FUSE_POSIX_LOCKS: u32         = 1 << 1;   // remote locking for POSIX file locks
    pub const FUSE_FILE_OPS: u32            = 1 << 2;   // since ABI 7.9: kernel sends file handle for fstat, etc...
    pub const FUSE_ATOMIC_O_TRUNC: u32      = 1 << 3;   // since ABI 7.9: handles the O_TRUNC open flag in the filesystem
    pub const FUSE_EXPORT_SUPPORT: u32      = 1 << 4;   // since ABI 7.10: filesystem handles lookups of "." and ".."
    pub const FUSE_BIG_WRITES: u32          = 1 << 5;   // since ABI 7.9: filesystem can handle write size larger than 4kB
    pub const FUSE_DONT_MASK: u32           = 1 << 6;   // since ABI 7.12: don't apply umask to file mode on create operations
    pub const FUSE_FLOCK_LOCKS: u32         = 1 << 10;  // since ABI 7.17: remote locking for BSD style file locks

    // Release flags
    pub const FUSE_RELEASE_FLUSH: u32       = 1 << 0;
    pub const FUSE_RELEASE_FLOCK_UNLOCK: u32= 1 << 1;   // since ABI 7.17

    // Getattr flags
    pub const FUSE_GETATTR_FH: u32          = 1 << 0;   // since ABI 7.9

    // Lock flags
    pub const FUSE_LK_FLOCK: u32            = 1 << 0;   // since ABI 7.9

    // Write flags
    pub const FUSE_WRITE_CACHE: u32         = 1 << 0;   // since ABI 7.9: delayed write from page cache, file handle is guessed
    pub const FUSE_WRITE_LOCKOWNER: u32     = 1 << 1;   // since ABI 7.9: lock_owner field is valid

    // Read flags
    pub const FUSE_READ_LOCKOWNER: u32      = 1 << 1;   // since ABI 7.9

    // Fsync flags
    pub const FUSE_FSYNC_FDATASYNC: u32     = 1 << 0;

    // The read buffer is required to be at least 8k, but may be much larger
    pub const FUSE_MIN_READ_BUFFER: usize   = 8192;
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum fuse_opcode {
    FUSE_LOOKUP = 1,
    FUSE_FORGET = 2,                                    // no reply
    FUSE_GETATTR = 3,
    FUSE_SETATTR = 4,
    FUSE_READLINK = 5,
    FUSE_SYMLINK = 6,
    FUSE_MKNOD = 8,
    FUSE_MKDIR = 9,
    FUSE_UNLINK = 10,
    FUSE_RMDIR = 11,
    FUSE_RENAME = 12,
    FUSE_LINK = 13,
    FUSE_OPEN = 14,
    FUSE_READ = 15,
    FUSE_WRITE = 16,
    FUSE_STATFS = 17,
    FUSE_RELEASE = 18,
    FUSE_FSYNC = 20,
    FUSE_SETXATTR = 21,
    FUSE_GETXATTR = 22,
    FUSE_LISTXATTR = 23,
    FUSE_REMOVEXATTR = 24,
    FUSE_FLUSH = 25,
    FUSE_INIT = 26,
    FUSE_OPENDIR = 27,
    FUSE_READDIR = 28,
    FUSE_RELEASEDIR = 29,
    FUSE_FSYNCDIR = 30,
    FUSE_GETLK = 31,
    FUSE_SETLK = 32,
    FUSE_SETLKW = 33,
    FUSE_ACCESS = 34,
    FUSE_CREATE = 35,
    FUSE_INTERRUPT = 36,
    FUSE_BMAP = 37,
    FUSE_DESTROY = 38,
    FUSE_BATCH_FORGET = 42,                             // since ABI 7.16, no reply
    FUSE_RENAME2 = 45,                                  // since ABI 7.23
}

/// Error returned when converting an unknown opcode number.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct UnknownOpcode(pub u32);

impl TryFrom<u32> for fuse_opcode {
    type Error = UnknownOpcode;

    fn try_from(n: u32) -> Result<Self, Self::Error> {
        use fuse_opcode::*;
        Ok(match n {
            1 => FUSE_LOOKUP,
            2 => FUSE_FORGET,
            3 => FUSE_GETATTR,
            4 => FUSE_SETATTR,
            5 => FUSE_READLINK,
            6 => FUSE_SYMLINK,
            8 => FUSE_MKNOD,
            9 => FUSE_MKDIR,
            10 => FUSE_UNLINK,
            11 => FUSE_RMDIR,
            12 => FUSE_RENAME,
            13 => FUSE_LINK,
            14 => FUSE_OPEN,
            15 => FUSE_READ,
            16 => FUSE_WRITE,
            17 => FUSE_STATFS,
            18 => FUSE_RELEASE,
            20 => FUSE_FSYNC,
            21 => FUSE_SETXATTR,
            22 => FUSE_GETXATTR,
            23 => FUSE_LISTXATTR,
            24 => FUSE_REMOVEXATTR,
            25 => FUSE_FLUSH,
            26 => FUSE_INIT,
            27 => FUSE_OPENDIR,
            28 => FUSE_READDIR,
            29 => FUSE_RELEASEDIR,
            30 => FUSE_FSYNCDIR,
            31 => FUSE_GETLK,
            32 => FUSE_SETLK,
            33 => FUSE_SETLKW,
            34 => FUSE_ACCESS,
            35 => FUSE_CREATE,
            36 => FUSE_INTERRUPT,
            37 => FUSE_BMAP,
            38 => FUSE_DESTROY,
            42 => FUSE_BATCH_FORGET,
            45 => FUSE_RENAME2,
            n => return Err(UnknownOpcode(n)),
        })
    }
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub struct fuse_entry_out {
    pub nodeid: u64,
    pub generation: u64,
    pub entry_valid: u64,
    pub attr_valid: u64,
    pub entry_valid_nsec: u32,
    pub attr_valid_nsec: u32,
    pub attr: fuse_attr,
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub struct fuse_forget_in {
    pub nlookup: u64,
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub struct fuse_forget_one {                            // since ABI 7.16
    pub nodeid: u64,
    pub nlookup: u64,
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub struct fuse_batch_forget_in {                       // since ABI 7.16
    pub count: u32,
    pub dummy: u32,
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub struct fuse_getattr_in {                            // since ABI 7.9
    pub getattr_flags: u32,
    pub dummy: u32,
    pub fh: u64,
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub struct fuse_attr_out {
    pub attr_valid: u64,
    pub attr_valid_nsec: u32,
    pub dummy: u32,
    pub attr: fuse_attr,
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub struct fuse_mknod_in {
    pub mode: u32,
    pub rdev: u32,
    pub umask: u32,                                     // since ABI 7.12
    pub padding: u32,                                   // since ABI 7.12
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub struct fuse_mkdir_in {
    pub mode: u32,
    pub umask: u32,                                     // since ABI 7.12
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub struct fuse_rename_in {
    pub newdir: u64,
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub struct fuse_rename2_in {
    pub newdir: u64,
    pub flags: u32,
    pub padding: u32,
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub struct fuse_link_in {
    pub oldnodeid: u64,
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub struct fuse_setattr_in {
    pub valid: u32,
    pub padding: u32,
    pub fh: u64,
    pub size: u64,
    pub lock_owner: u64,                                // since ABI 7.9
    pub atime: i64,
    pub mtime: i64,
    pub ctime: i64,
    pub atimensec: u32,
    pub mtimensec: u32,
    pub ctimensec: u32,
    pub mode: u32,
    pub unused4: u32,
    pub uid: u32,
    pub gid: u32,
    pub unused5: u32,
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub struct fuse_open_in {
    pub flags: u32,
    pub unused: u32,
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub struct fuse_create_in {
    pub flags: u32,
    pub mode: u32,
    pub umask: u32,                                     // since ABI 7.12
    pub padding: u32,                                   // since ABI 7.12
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub struct fuse_open_out {
    pub fh: u64,
    pub open_flags: u32,
    pub padding: u32,
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub struct fuse_release_in {
    pub fh: u64,
    pub flags: u32,
    pub release_flags: u32,
    pub lock_owner: u64,
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub struct fuse_flush_in {
    pub fh: u64,
    pub unused: u32,
    pub padding: u32,
    pub lock_owner: u64,
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub struct fuse_read_in {
    pub fh: u64,
    pub offset: u64,
    pub size: u32,
    pub read_flags: u32,                                // since ABI 7.9
    pub lock_owner: u64,                                // since ABI 7.9
    pub flags: u32,                                     // since ABI 7.9
    pub padding: u32,                                   // since ABI 7.9
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub struct fuse_write_in {
    pub fh: u64,
    pub offset: u64,
    pub size: u32,
    pub write_flags: u32,
    pub lock_owner: u64,                                // since ABI 7.9
    pub flags: u32,                                     // since ABI 7.9
    pub padding: u32,                                   // since ABI 7.9
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub struct fuse_write_out {
    pub size: u32,
    pub padding: u32,
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub struct fuse_statfs_out {
    pub st: fuse_kstatfs,
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub struct fuse_fsync_in {
    pub fh: u64,
    pub fsync_flags: u32,
    pub padding: u32,
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub struct fuse_setxattr_in {
    pub size: u32,
    pub flags: u32,
    #[cfg(target_os = "macos")]
    pub position: u32,
    #[cfg(target_os = "macos")]
    pub padding: u32,
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub struct fuse_getxattr_in {
    pub size: u32,
    pub padding: u32,
    #[cfg(target_os = "macos")]
    pub position: u32,
    #[cfg(target_os = "macos")]
    pub padding2: u32,
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub struct fuse_getxattr_out {
    pub size: u32,
    pub padding: u32,
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub struct fuse_lk_in {
    pub fh: u64,
    pub owner: u64,
    pub lk: fuse_file_lock,
    pub lk_flags: u32,                                  // since ABI 7.9
    pub padding: u32,                                   // since ABI 7.9
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub struct fuse_lk_out {
    pub lk: fuse_file_lock,
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub struct fuse_access_in {
    pub mask: u32,
    pub padding: u32,
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub struct fuse_init_in {
    pub major: u32,
    pub minor: u32,
    pub max_readahead: u32,
    pub flags: u32,
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub struct fuse_init_out {
    pub major: u32,
    pub minor: u32,
    pub max_readahead: u32,
    pub flags: u32,
    pub max_background: u16,                            // since ABI 7.13
    pub congestion_threshold: u16,                      // since ABI 7.13
    pub max_write: u32,
    pub time_gran: u32,                                 // since ABI 7.23
    pub reserved: [u32; 9],                             // since ABI 7.23
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub struct fuse_interrupt_in {
    pub unique: u64,
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub struct fuse_bmap_in {
    pub block: u64,
    pub blocksize: u32,
    pub padding: u32,
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub struct fuse_bmap_out {
    pub block: u64,
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub struct fuse_in_header {
    pub len: u32,
    pub opcode: u32,
    pub unique: u64,
    pub nodeid: u64,
    pub uid: u32,
    pub gid: u32,
    pub pid: u32,
    pub padding: u32,
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub struct fuse_out_header {
    pub len: u32,
    pub error: i32,
    pub unique: u64,
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub struct fuse_dirent {
    pub ino: u64,
    pub off: u64,
    pub namelen: u32,
    pub typ: u32,
    // followed by name of namelen bytes
}

#[cfg(test)]
mod test {
    use super::*;
    use std::mem::size_of;

    #[test]
    #[cfg(not(target_os = "macos"))]
    fn struct_sizes_match_kernel_header() {
        assert_eq!(size_of::<fuse_in_header>(), 40);
        assert_eq!(size_of::<fuse_out_header>(), 16);
        assert_eq!(size_of::<fuse_attr>(), 88);
        assert_eq!(size_of::<fuse_entry_out>(), 128);
        assert_eq!(size_of::<fuse_attr_out>(), 104);
        assert_eq!(size_of::<fuse_setattr_in>(), 88);
        assert_eq!(size_of::<fuse_init_out>(), 64);
        assert_eq!(size_of::<fuse_lk_in>(), 48);
        assert_eq!(size_of::<fuse_kstatfs>(), 80);
    }

    #[test]
    fn opcode_conversion() {
        assert_eq!(fuse_opcode::try_from(1), Ok(fuse_opcode::FUSE_LOOKUP));
        assert_eq!(fuse_opcode::try_from(42), Ok(fuse_opcode::FUSE_BATCH_FORGET));
        assert_eq!(fuse_opcode::try_from(7), Err(UnknownOpcode(7)));
        assert_eq!(fuse_opcode::try_from(4096), Err(UnknownOpcode(4096)));
    }
}
