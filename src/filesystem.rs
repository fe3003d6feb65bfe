//! Filesystem interface.
//!
//! Interface for implementing filesystems. Every operation is optional: unless overridden,
//! operations that expect a reply fail with `ENOSYS` and notifications are ignored.

use std::ffi::OsStr;
use std::path::Path;

use libc::ENOSYS;

use crate::file_handle::FileHandle;
use crate::reply::{
    ReplyAttr, ReplyBmap, ReplyCreate, ReplyData, ReplyDirectory, ReplyEmpty, ReplyEntry,
    ReplyLock, ReplyOpen, ReplyReadlink, ReplyStatfs, ReplyWrite, ReplyXattr,
};
use crate::request::{ConnectionInfo, Forget, Lock, Request, SetAttrChanges};


/// Filesystem trait.
///
/// This trait must be implemented to provide a userspace filesystem. Methods are called one at a
/// time on the handler thread, in the order the kernel issued the requests. Every method that
/// receives a reply must complete it exactly once, either before returning or later from any
/// other thread. A request whose reply is dropped without completion is never answered and the
/// calling process hangs until the kernel interrupts it.
///
/// These methods correspond to `fuse_lowlevel_ops` in libfuse.
#[allow(unused_variables)]
pub trait Filesystem {
    /// Initialize filesystem.
    ///
    /// Called once before any other filesystem method, with the capabilities negotiated with the
    /// kernel.
    fn init(&mut self, req: &Request, info: &ConnectionInfo) {}

    /// Clean up filesystem.
    ///
    /// Called on filesystem exit.
    fn destroy(&mut self, req: &Request) {}

    /// Look up a directory entry by name and get its attributes.
    fn lookup(&mut self, req: &Request, parent: u64, name: &OsStr, reply: ReplyEntry) {
        let _ = reply.error(ENOSYS);
    }

    /// Forget about an inode.
    ///
    /// The `nlookup` parameter indicates the number of lookups previously performed on this inode.
    /// If the filesystem implements inode lifetimes, it is recommended that inodes acquire a
    /// single reference on each lookup, and lose `nlookup` references on each forget. The
    /// filesystem may ignore forget calls, if the inodes don't need to have a limited lifetime.
    ///
    /// On unmount it is not guaranteed, that all referenced inodes will receive a forget message.
    fn forget(&mut self, req: &Request, ino: u64, nlookup: u64) {}

    /// Forget about multiple inodes.
    ///
    /// Calls `forget` for every inode by default.
    fn forget_multi(&mut self, req: &Request, forgets: &[Forget]) {
        for forget in forgets {
            self.forget(req, forget.ino, forget.nlookup);
        }
    }

    /// Get file attributes.
    ///
    /// `fh` is set if the attributes are requested for an open file (fstat).
    fn getattr(&mut self, req: &Request, ino: u64, fh: Option<&FileHandle>, reply: ReplyAttr) {
        let _ = reply.error(ENOSYS);
    }

    /// Set file attributes.
    ///
    /// Only the attributes present in `changes` are to be modified.
    fn setattr(&mut self, req: &Request, ino: u64, changes: &SetAttrChanges, fh: Option<&FileHandle>, reply: ReplyAttr) {
        let _ = reply.error(ENOSYS);
    }

    /// Read symbolic link.
    fn readlink(&mut self, req: &Request, ino: u64, reply: ReplyReadlink) {
        let _ = reply.error(ENOSYS);
    }

    /// Create file node.
    ///
    /// Create a regular file, character device, block device, fifo or socket node.
    fn mknod(&mut self, req: &Request, parent: u64, name: &OsStr, mode: u32, umask: u32, rdev: u32, reply: ReplyEntry) {
        let _ = reply.error(ENOSYS);
    }

    /// Create a directory.
    fn mkdir(&mut self, req: &Request, parent: u64, name: &OsStr, mode: u32, umask: u32, reply: ReplyEntry) {
        let _ = reply.error(ENOSYS);
    }

    /// Remove a file.
    fn unlink(&mut self, req: &Request, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let _ = reply.error(ENOSYS);
    }

    /// Remove a directory.
    fn rmdir(&mut self, req: &Request, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let _ = reply.error(ENOSYS);
    }

    /// Create a symbolic link.
    fn symlink(&mut self, req: &Request, parent: u64, name: &OsStr, link: &Path, reply: ReplyEntry) {
        let _ = reply.error(ENOSYS);
    }

    /// Rename a file.
    ///
    /// `flags` carries the renameat2(2) flags (`RENAME_NOREPLACE`, `RENAME_EXCHANGE`), 0 for a
    /// plain rename.
    fn rename(&mut self, req: &Request, parent: u64, name: &OsStr, newparent: u64, newname: &OsStr, flags: u32, reply: ReplyEmpty) {
        let _ = reply.error(ENOSYS);
    }

    /// Create a hard link.
    fn link(&mut self, req: &Request, ino: u64, newparent: u64, newname: &OsStr, reply: ReplyEntry) {
        let _ = reply.error(ENOSYS);
    }

    /// Open a file.
    ///
    /// Open flags (with the exception of O_CREAT, O_EXCL, O_NOCTTY and O_TRUNC) are available in
    /// `fh.flags()`. Filesystems may reply with an arbitrary file handle (pointer, index, etc) and
    /// use it in all other file operations (`read`, `write`, `flush`, `release`, `fsync`).
    /// Filesystems may also implement stateless file I/O and not store anything in the handle.
    /// There are also some flags (direct_io, keep_cache) which the filesystem may set, to change
    /// the way the file is opened.
    fn open(&mut self, req: &Request, ino: u64, fh: &FileHandle, reply: ReplyOpen) {
        let _ = reply.error(ENOSYS);
    }

    /// Read data.
    ///
    /// Read should send exactly the number of bytes requested except on EOF or error, otherwise
    /// the rest of the data will be substituted with zeroes. An exception to this is when the file
    /// has been opened in 'direct_io' mode, in which case the return value of the read system call
    /// will reflect the return value of this operation.
    fn read(&mut self, req: &Request, ino: u64, fh: &FileHandle, offset: i64, size: u32, reply: ReplyData) {
        let _ = reply.error(ENOSYS);
    }

    /// Write data.
    ///
    /// Write should return exactly the number of bytes requested except on error. An exception
    /// to this is when the file has been opened in 'direct_io' mode, in which case the return
    /// value of the write system call will reflect the return value of this operation.
    fn write(&mut self, req: &Request, ino: u64, fh: &FileHandle, offset: i64, data: &[u8], flags: u32, reply: ReplyWrite) {
        let _ = reply.error(ENOSYS);
    }

    /// Flush method.
    ///
    /// This is called on each close() of the opened file. Since file descriptors can be duplicated
    /// (dup, dup2, fork), for one open call there may be many flush calls. Filesystems shouldn't
    /// assume that flush will always be called after some writes, or that if will be called at
    /// all. If the filesystem supports file locking operations (`setlk`, `getlk`) it should remove
    /// all locks belonging to `fh.lock_owner()`.
    fn flush(&mut self, req: &Request, ino: u64, fh: &FileHandle, reply: ReplyEmpty) {
        let _ = reply.error(ENOSYS);
    }

    /// Release an open file.
    ///
    /// Release is called when there are no more references to an open file: all file descriptors
    /// are closed and all memory mappings are unmapped. For every open call there will be exactly
    /// one release call. The filesystem may reply with an error, but error values are not
    /// returned to close() or munmap() which triggered the release.
    fn release(&mut self, req: &Request, ino: u64, fh: &FileHandle, reply: ReplyEmpty) {
        let _ = reply.error(ENOSYS);
    }

    /// Synchronize file contents.
    ///
    /// If `datasync` is set, then only the user data should be flushed, not the meta data.
    fn fsync(&mut self, req: &Request, ino: u64, fh: &FileHandle, datasync: bool, reply: ReplyEmpty) {
        let _ = reply.error(ENOSYS);
    }

    /// Open a directory.
    fn opendir(&mut self, req: &Request, ino: u64, fh: &FileHandle, reply: ReplyOpen) {
        let _ = reply.error(ENOSYS);
    }

    /// Read directory.
    ///
    /// Entries are added to the reply until it reports to be full. `offset` is the offset value
    /// of the last entry the kernel has seen, 0 when starting.
    fn readdir(&mut self, req: &Request, ino: u64, fh: &FileHandle, offset: i64, reply: ReplyDirectory) {
        let _ = reply.error(ENOSYS);
    }

    /// Release an open directory.
    ///
    /// For every opendir call there will be exactly one releasedir call.
    fn releasedir(&mut self, req: &Request, ino: u64, fh: &FileHandle, reply: ReplyEmpty) {
        let _ = reply.error(ENOSYS);
    }

    /// Synchronize directory contents.
    fn fsyncdir(&mut self, req: &Request, ino: u64, fh: &FileHandle, datasync: bool, reply: ReplyEmpty) {
        let _ = reply.error(ENOSYS);
    }

    /// Get file system statistics.
    fn statfs(&mut self, req: &Request, ino: u64, reply: ReplyStatfs) {
        let _ = reply.error(ENOSYS);
    }

    /// Set an extended attribute.
    fn setxattr(&mut self, req: &Request, ino: u64, name: &OsStr, value: &[u8], flags: u32, position: u32, reply: ReplyEmpty) {
        let _ = reply.error(ENOSYS);
    }

    /// Get an extended attribute.
    ///
    /// If `size` is 0, the size of the value should be sent with `reply.size()`. If `size` is not
    /// 0, and the value fits, send it with `reply.data()`, or `reply.error(ERANGE)` if it doesn't.
    /// `position` is the offset into resource forks on macOS and always 0 elsewhere.
    fn getxattr(&mut self, req: &Request, ino: u64, name: &OsStr, size: u32, position: u32, reply: ReplyXattr) {
        let _ = reply.error(ENOSYS);
    }

    /// List extended attribute names.
    ///
    /// Same size semantics as `getxattr`, with the NUL separated list of names as value.
    fn listxattr(&mut self, req: &Request, ino: u64, size: u32, reply: ReplyXattr) {
        let _ = reply.error(ENOSYS);
    }

    /// Remove an extended attribute.
    fn removexattr(&mut self, req: &Request, ino: u64, name: &OsStr, reply: ReplyEmpty) {
        let _ = reply.error(ENOSYS);
    }

    /// Check file access permissions.
    ///
    /// This will be called for the access() system call. If the 'default_permissions' mount option
    /// is given, this method is not called.
    fn access(&mut self, req: &Request, ino: u64, mask: u32, reply: ReplyEmpty) {
        let _ = reply.error(ENOSYS);
    }

    /// Create and open a file.
    ///
    /// If the file does not exist, first create it with the specified mode, and then open it.
    /// Open flags are available in `fh.flags()`. If this method is not implemented, the kernel
    /// will call `mknod` and `open` instead.
    fn create(&mut self, req: &Request, parent: u64, name: &OsStr, mode: u32, umask: u32, fh: &FileHandle, reply: ReplyCreate) {
        let _ = reply.error(ENOSYS);
    }

    /// Test for a POSIX file lock.
    fn getlk(&mut self, req: &Request, ino: u64, fh: &FileHandle, lock: &Lock, reply: ReplyLock) {
        let _ = reply.error(ENOSYS);
    }

    /// Acquire, modify or release a POSIX file lock.
    ///
    /// For POSIX threads (NPTL) there's a 1-1 relation between pid and owner, but otherwise this
    /// is not always the case. For checking lock ownership, `fh.lock_owner()` must be used. If
    /// `sleep` is set, the call should wait until the lock can be acquired.
    fn setlk(&mut self, req: &Request, ino: u64, fh: &FileHandle, lock: &Lock, sleep: bool, reply: ReplyEmpty) {
        let _ = reply.error(ENOSYS);
    }

    /// Map block index within file to block index within device.
    ///
    /// Note: This makes sense only for block device backed filesystems mounted with the 'blkdev'
    /// option.
    fn bmap(&mut self, req: &Request, ino: u64, blocksize: u32, idx: u64, reply: ReplyBmap) {
        let _ = reply.error(ENOSYS);
    }
}
