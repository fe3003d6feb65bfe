//! Filesystem operation request
//!
//! A request represents information about a filesystem operation the kernel driver wants us to
//! perform. Requests are decoded from raw kernel packets into owned values, so they can be handed
//! to another thread and outlive the buffer the packet was read into.

use std::convert::TryFrom;
use std::ffi::{OsStr, OsString};
use std::fmt;
use std::path::PathBuf;
use std::time::SystemTime;

use fuse_abi::consts::*;
use fuse_abi::*;

use crate::file_handle::FileHandle;
use crate::ll::{self, ArgumentIterator, RequestError};


/// Opaque identifier the kernel driver uses to match a reply to its request.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct RequestToken(u64);

impl RequestToken {
    /// Returns the raw unique id assigned by the kernel driver.
    pub fn unique(self) -> u64 {
        self.0
    }
}

impl From<u64> for RequestToken {
    fn from(unique: u64) -> Self {
        RequestToken(unique)
    }
}

impl fmt::Display for RequestToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}


/// Credentials of the process that triggered a request.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct RequestContext {
    /// User id.
    pub uid: u32,
    /// Group id.
    pub gid: u32,
    /// Process id.
    pub pid: u32,
}


/// Connection capabilities, as negotiated during initialization.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct ConnectionInfo {
    /// Major version of the protocol spoken by the kernel.
    pub proto_major: u32,
    /// Minor version of the protocol spoken by the kernel.
    pub proto_minor: u32,
    /// Whether the kernel may issue read requests asynchronously.
    pub async_read: bool,
    /// Maximum size of a single write request.
    pub max_write: u32,
    /// Maximum readahead.
    pub max_readahead: u32,
    /// Capability flags offered by the kernel (`FUSE_ASYNC_READ`, `FUSE_POSIX_LOCKS`, ...).
    pub capable: u32,
    /// Capability flags enabled for this connection.
    pub want: u32,
}


/// Forget about an inode.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Forget {
    /// Inode number.
    pub ino: u64,
    /// Number of lookups to forget.
    pub nlookup: u64,
}


/// POSIX file lock description (`struct flock`).
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct Lock {
    /// First byte of the locked range.
    pub start: u64,
    /// Last byte of the locked range.
    pub end: u64,
    /// Lock type (`F_RDLCK`, `F_WRLCK` or `F_UNLCK`).
    pub typ: u32,
    /// Process holding the lock.
    pub pid: u32,
}

impl From<&fuse_file_lock> for Lock {
    fn from(lk: &fuse_file_lock) -> Self {
        Lock { start: lk.start, end: lk.end, typ: lk.typ, pid: lk.pid }
    }
}


/// Time value of an attribute change.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum TimeOrNow {
    /// Specific time provided.
    SpecificTime(SystemTime),
    /// Current time.
    Now,
}


/// Attributes to change in a `setattr` request.
///
/// Only attributes that the kernel marked as changed are `Some`. Values the kernel transmitted
/// for unmarked attributes are never surfaced.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct SetAttrChanges {
    /// New file mode.
    pub mode: Option<u32>,
    /// New owner.
    pub uid: Option<u32>,
    /// New group.
    pub gid: Option<u32>,
    /// New size (truncate).
    pub size: Option<u64>,
    /// New access time.
    pub atime: Option<TimeOrNow>,
    /// New modification time.
    pub mtime: Option<TimeOrNow>,
    /// New change time.
    pub ctime: Option<SystemTime>,
}

impl SetAttrChanges {
    /// Returns true if no attribute is to be changed.
    pub fn is_empty(&self) -> bool {
        *self == SetAttrChanges::default()
    }
}

fn masked<T>(valid: u32, flag: u32, value: T) -> Option<T> {
    if valid & flag != 0 {
        Some(value)
    } else {
        None
    }
}

fn masked_time(valid: u32, flag: u32, now_flag: u32, secs: i64, nsecs: u32) -> Result<Option<TimeOrNow>, RequestError> {
    if valid & now_flag != 0 {
        Ok(Some(TimeOrNow::Now))
    } else if valid & flag != 0 {
        Ok(Some(TimeOrNow::SpecificTime(time(secs, nsecs)?)))
    } else {
        Ok(None)
    }
}

fn time(secs: i64, nsecs: u32) -> Result<SystemTime, RequestError> {
    ll::system_time(secs, i64::from(nsecs)).ok_or(RequestError::InvalidArgument)
}

impl TryFrom<&fuse_setattr_in> for SetAttrChanges {
    type Error = RequestError;

    fn try_from(arg: &fuse_setattr_in) -> Result<Self, Self::Error> {
        let valid = arg.valid;
        let ctime = if valid & FATTR_CTIME != 0 { Some(time(arg.ctime, arg.ctimensec)?) } else { None };
        Ok(SetAttrChanges {
            mode: masked(valid, FATTR_MODE, arg.mode),
            uid: masked(valid, FATTR_UID, arg.uid),
            gid: masked(valid, FATTR_GID, arg.gid),
            size: masked(valid, FATTR_SIZE, arg.size),
            atime: masked_time(valid, FATTR_ATIME, FATTR_ATIME_NOW, arg.atime, arg.atimensec)?,
            mtime: masked_time(valid, FATTR_MTIME, FATTR_MTIME_NOW, arg.mtime, arg.mtimensec)?,
            ctime,
        })
    }
}


/// Kind of a filesystem operation.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
#[allow(missing_docs)]
pub enum OperationKind {
    Init,
    Destroy,
    Lookup,
    Forget,
    ForgetMulti,
    GetAttr,
    SetAttr,
    ReadLink,
    MkNod,
    MkDir,
    Unlink,
    RmDir,
    SymLink,
    Rename,
    Link,
    Open,
    Read,
    Write,
    Flush,
    Release,
    FSync,
    OpenDir,
    ReadDir,
    ReleaseDir,
    FSyncDir,
    StatFs,
    SetXAttr,
    GetXAttr,
    ListXAttr,
    RemoveXAttr,
    Access,
    Create,
    GetLock,
    SetLock,
    BMap,
}

impl OperationKind {
    /// Name of the operation, as reported to observers.
    pub fn name(self) -> &'static str {
        match self {
            OperationKind::Init => "init",
            OperationKind::Destroy => "destroy",
            OperationKind::Lookup => "lookup",
            OperationKind::Forget => "forget",
            OperationKind::ForgetMulti => "forget_multi",
            OperationKind::GetAttr => "getattr",
            OperationKind::SetAttr => "setattr",
            OperationKind::ReadLink => "readlink",
            OperationKind::MkNod => "mknod",
            OperationKind::MkDir => "mkdir",
            OperationKind::Unlink => "unlink",
            OperationKind::RmDir => "rmdir",
            OperationKind::SymLink => "symlink",
            OperationKind::Rename => "rename",
            OperationKind::Link => "link",
            OperationKind::Open => "open",
            OperationKind::Read => "read",
            OperationKind::Write => "write",
            OperationKind::Flush => "flush",
            OperationKind::Release => "release",
            OperationKind::FSync => "fsync",
            OperationKind::OpenDir => "opendir",
            OperationKind::ReadDir => "readdir",
            OperationKind::ReleaseDir => "releasedir",
            OperationKind::FSyncDir => "fsyncdir",
            OperationKind::StatFs => "statfs",
            OperationKind::SetXAttr => "setxattr",
            OperationKind::GetXAttr => "getxattr",
            OperationKind::ListXAttr => "listxattr",
            OperationKind::RemoveXAttr => "removexattr",
            OperationKind::Access => "access",
            OperationKind::Create => "create",
            OperationKind::GetLock => "getlk",
            OperationKind::SetLock => "setlk",
            OperationKind::BMap => "bmap",
        }
    }

    /// Whether the kernel expects a reply to this kind of operation. Notifications (`Init`,
    /// `Destroy`, `Forget` and `ForgetMulti`) are not replied to by the filesystem.
    pub fn has_reply(self) -> bool {
        match self {
            OperationKind::Init | OperationKind::Destroy | OperationKind::Forget | OperationKind::ForgetMulti => false,
            _ => true,
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}


/// Filesystem operation with its arguments.
#[derive(Clone, Debug)]
#[allow(missing_docs)]
pub enum Operation {
    Init(ConnectionInfo),
    Destroy,
    Lookup { parent: u64, name: OsString },
    Forget(Forget),
    ForgetMulti(Vec<Forget>),
    GetAttr { ino: u64, fh: Option<FileHandle> },
    SetAttr { ino: u64, changes: SetAttrChanges, fh: Option<FileHandle> },
    ReadLink { ino: u64 },
    MkNod { parent: u64, name: OsString, mode: u32, umask: u32, rdev: u32 },
    MkDir { parent: u64, name: OsString, mode: u32, umask: u32 },
    Unlink { parent: u64, name: OsString },
    RmDir { parent: u64, name: OsString },
    SymLink { parent: u64, name: OsString, link: PathBuf },
    Rename { parent: u64, name: OsString, newparent: u64, newname: OsString, flags: u32 },
    Link { ino: u64, newparent: u64, newname: OsString },
    Open { ino: u64, fh: FileHandle },
    Read { ino: u64, fh: FileHandle, offset: i64, size: u32 },
    Write { ino: u64, fh: FileHandle, offset: i64, data: Vec<u8>, flags: u32 },
    Flush { ino: u64, fh: FileHandle },
    Release { ino: u64, fh: FileHandle },
    FSync { ino: u64, fh: FileHandle, datasync: bool },
    OpenDir { ino: u64, fh: FileHandle },
    ReadDir { ino: u64, fh: FileHandle, offset: i64, size: u32 },
    ReleaseDir { ino: u64, fh: FileHandle },
    FSyncDir { ino: u64, fh: FileHandle, datasync: bool },
    StatFs { ino: u64 },
    SetXAttr { ino: u64, name: OsString, value: Vec<u8>, flags: u32, position: u32 },
    GetXAttr { ino: u64, name: OsString, size: u32, position: u32 },
    ListXAttr { ino: u64, size: u32 },
    RemoveXAttr { ino: u64, name: OsString },
    Access { ino: u64, mask: u32 },
    Create { parent: u64, name: OsString, mode: u32, umask: u32, fh: FileHandle },
    GetLock { ino: u64, fh: FileHandle, lock: Lock },
    SetLock { ino: u64, fh: FileHandle, lock: Lock, sleep: bool },
    BMap { ino: u64, blocksize: u32, idx: u64 },
}

impl Operation {
    /// Returns the kind of this operation.
    pub fn kind(&self) -> OperationKind {
        match self {
            Operation::Init(..) => OperationKind::Init,
            Operation::Destroy => OperationKind::Destroy,
            Operation::Lookup { .. } => OperationKind::Lookup,
            Operation::Forget(..) => OperationKind::Forget,
            Operation::ForgetMulti(..) => OperationKind::ForgetMulti,
            Operation::GetAttr { .. } => OperationKind::GetAttr,
            Operation::SetAttr { .. } => OperationKind::SetAttr,
            Operation::ReadLink { .. } => OperationKind::ReadLink,
            Operation::MkNod { .. } => OperationKind::MkNod,
            Operation::MkDir { .. } => OperationKind::MkDir,
            Operation::Unlink { .. } => OperationKind::Unlink,
            Operation::RmDir { .. } => OperationKind::RmDir,
            Operation::SymLink { .. } => OperationKind::SymLink,
            Operation::Rename { .. } => OperationKind::Rename,
            Operation::Link { .. } => OperationKind::Link,
            Operation::Open { .. } => OperationKind::Open,
            Operation::Read { .. } => OperationKind::Read,
            Operation::Write { .. } => OperationKind::Write,
            Operation::Flush { .. } => OperationKind::Flush,
            Operation::Release { .. } => OperationKind::Release,
            Operation::FSync { .. } => OperationKind::FSync,
            Operation::OpenDir { .. } => OperationKind::OpenDir,
            Operation::ReadDir { .. } => OperationKind::ReadDir,
            Operation::ReleaseDir { .. } => OperationKind::ReleaseDir,
            Operation::FSyncDir { .. } => OperationKind::FSyncDir,
            Operation::StatFs { .. } => OperationKind::StatFs,
            Operation::SetXAttr { .. } => OperationKind::SetXAttr,
            Operation::GetXAttr { .. } => OperationKind::GetXAttr,
            Operation::ListXAttr { .. } => OperationKind::ListXAttr,
            Operation::RemoveXAttr { .. } => OperationKind::RemoveXAttr,
            Operation::Access { .. } => OperationKind::Access,
            Operation::Create { .. } => OperationKind::Create,
            Operation::GetLock { .. } => OperationKind::GetLock,
            Operation::SetLock { .. } => OperationKind::SetLock,
            Operation::BMap { .. } => OperationKind::BMap,
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operation::Init(info) => write!(f, "kernel ABI {}.{}, flags {:#x}, max readahead {}", info.proto_major, info.proto_minor, info.capable, info.max_readahead),
            Operation::Destroy => Ok(()),
            Operation::Lookup { parent, name } => write!(f, "parent {:#018x}, name {:?}", parent, name),
            Operation::Forget(forget) => write!(f, "ino {:#018x}, nlookup {}", forget.ino, forget.nlookup),
            Operation::ForgetMulti(forgets) => write!(f, "{} inodes", forgets.len()),
            Operation::GetAttr { ino, .. } => write!(f, "ino {:#018x}", ino),
            Operation::SetAttr { ino, changes, fh } => write!(f, "ino {:#018x}, changes {:?}, fh {:?}", ino, changes, fh.map(|fh| fh.fh())),
            Operation::ReadLink { ino } => write!(f, "ino {:#018x}", ino),
            Operation::MkNod { parent, name, mode, umask, rdev } => write!(f, "parent {:#018x}, name {:?}, mode {:#05o}, umask {:#05o}, rdev {}", parent, name, mode, umask, rdev),
            Operation::MkDir { parent, name, mode, umask } => write!(f, "parent {:#018x}, name {:?}, mode {:#05o}, umask {:#05o}", parent, name, mode, umask),
            Operation::Unlink { parent, name } | Operation::RmDir { parent, name } => write!(f, "parent {:#018x}, name {:?}", parent, name),
            Operation::SymLink { parent, name, link } => write!(f, "parent {:#018x}, name {:?}, link {:?}", parent, name, link),
            Operation::Rename { parent, name, newparent, newname, flags } => write!(f, "parent {:#018x}, name {:?}, newparent {:#018x}, newname {:?}, flags {:#x}", parent, name, newparent, newname, flags),
            Operation::Link { ino, newparent, newname } => write!(f, "ino {:#018x}, newparent {:#018x}, newname {:?}", ino, newparent, newname),
            Operation::Open { ino, fh } | Operation::OpenDir { ino, fh } => write!(f, "ino {:#018x}, flags {:#x}", ino, fh.flags()),
            Operation::Read { ino, fh, offset, size } | Operation::ReadDir { ino, fh, offset, size } => write!(f, "ino {:#018x}, fh {}, offset {}, size {}", ino, fh.fh(), offset, size),
            Operation::Write { ino, fh, offset, data, flags } => write!(f, "ino {:#018x}, fh {}, offset {}, size {}, flags {:#x}", ino, fh.fh(), offset, data.len(), flags),
            Operation::Flush { ino, fh } => write!(f, "ino {:#018x}, fh {}, lock owner {:?}", ino, fh.fh(), fh.lock_owner()),
            Operation::Release { ino, fh } | Operation::ReleaseDir { ino, fh } => write!(f, "ino {:#018x}, fh {}, flags {:#x}, flush {}", ino, fh.fh(), fh.flags(), fh.flush()),
            Operation::FSync { ino, fh, datasync } | Operation::FSyncDir { ino, fh, datasync } => write!(f, "ino {:#018x}, fh {}, datasync {}", ino, fh.fh(), datasync),
            Operation::StatFs { ino } => write!(f, "ino {:#018x}", ino),
            Operation::SetXAttr { ino, name, value, flags, position } => write!(f, "ino {:#018x}, name {:?}, size {}, flags {:#x}, position {}", ino, name, value.len(), flags, position),
            Operation::GetXAttr { ino, name, size, .. } => write!(f, "ino {:#018x}, name {:?}, size {}", ino, name, size),
            Operation::ListXAttr { ino, size } => write!(f, "ino {:#018x}, size {}", ino, size),
            Operation::RemoveXAttr { ino, name } => write!(f, "ino {:#018x}, name {:?}", ino, name),
            Operation::Access { ino, mask } => write!(f, "ino {:#018x}, mask {:#05o}", ino, mask),
            Operation::Create { parent, name, mode, umask, fh } => write!(f, "parent {:#018x}, name {:?}, mode {:#05o}, umask {:#05o}, flags {:#x}", parent, name, mode, umask, fh.flags()),
            Operation::GetLock { ino, fh, lock } => write!(f, "ino {:#018x}, fh {}, lock {:?}", ino, fh.fh(), lock),
            Operation::SetLock { ino, fh, lock, sleep } => write!(f, "ino {:#018x}, fh {}, lock {:?}, sleep {}", ino, fh.fh(), lock, sleep),
            Operation::BMap { ino, blocksize, idx } => write!(f, "ino {:#018x}, blocksize {}, idx {}", ino, blocksize, idx),
        }
    }
}


/// Request of a filesystem operation.
///
/// Owns all data the kernel sent along with the operation (names, link targets, write data), so
/// the underlying packet buffer can be reused as soon as the request has been constructed.
#[derive(Clone, Debug)]
pub struct Request {
    token: RequestToken,
    context: RequestContext,
    operation: Operation,
}

impl Request {
    /// Create a request from its parts.
    pub fn new(token: RequestToken, context: RequestContext, operation: Operation) -> Self {
        Self { token, context, operation }
    }

    /// Returns the token identifying this request.
    #[inline]
    pub fn token(&self) -> RequestToken {
        self.token
    }

    /// Returns the credentials of the process that triggered this request.
    #[inline]
    pub fn context(&self) -> &RequestContext {
        &self.context
    }

    /// Returns the operation and its arguments.
    #[inline]
    pub fn operation(&self) -> &Operation {
        &self.operation
    }

    /// Returns the kind of operation.
    #[inline]
    pub fn kind(&self) -> OperationKind {
        self.operation.kind()
    }

    /// Returns the UID that the process that triggered this request runs under.
    #[inline]
    pub fn uid(&self) -> u32 {
        self.context.uid
    }

    /// Returns the GID that the process that triggered this request runs under.
    #[inline]
    pub fn gid(&self) -> u32 {
        self.context.gid
    }

    /// Returns the PID of the process that triggered this request.
    #[inline]
    pub fn pid(&self) -> u32 {
        self.context.pid
    }
}

impl fmt::Display for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({}) {}", self.kind().name().to_uppercase(), self.token, self.operation)
    }
}


fn arg<T: Copy>(it: &mut ArgumentIterator<'_>) -> Result<T, RequestError> {
    it.fetch().ok_or(RequestError::InsufficientData)
}

fn name(it: &mut ArgumentIterator<'_>) -> Result<OsString, RequestError> {
    it.fetch_str().map(OsStr::to_os_string).ok_or(RequestError::InsufficientData)
}

impl<'a> TryFrom<&ll::Request<'a>> for Request {
    type Error = RequestError;

    fn try_from(req: &ll::Request<'a>) -> Result<Self, Self::Error> {
        let opcode = req.opcode()?;
        let ino = req.nodeid();
        let mut it = req.arguments();
        let operation = match opcode {
            fuse_opcode::FUSE_INIT => {
                let arg: fuse_init_in = arg(&mut it)?;
                Operation::Init(ConnectionInfo {
                    proto_major: arg.major,
                    proto_minor: arg.minor,
                    async_read: arg.flags & FUSE_ASYNC_READ != 0,
                    max_write: 0,
                    max_readahead: arg.max_readahead,
                    capable: arg.flags,
                    want: 0,
                })
            }
            fuse_opcode::FUSE_DESTROY => Operation::Destroy,
            fuse_opcode::FUSE_LOOKUP => Operation::Lookup { parent: ino, name: name(&mut it)? },
            fuse_opcode::FUSE_FORGET => {
                let arg: fuse_forget_in = arg(&mut it)?;
                Operation::Forget(Forget { ino, nlookup: arg.nlookup })
            }
            fuse_opcode::FUSE_BATCH_FORGET => {
                let arg: fuse_batch_forget_in = arg(&mut it)?;
                let nodes: Vec<fuse_forget_one> = it.fetch_array(arg.count as usize).ok_or(RequestError::InsufficientData)?;
                Operation::ForgetMulti(nodes.iter().map(|node| Forget { ino: node.nodeid, nlookup: node.nlookup }).collect())
            }
            fuse_opcode::FUSE_GETATTR => {
                // Kernels before ABI 7.9 don't send any arguments
                let fh = if it.is_empty() {
                    None
                } else {
                    let arg: fuse_getattr_in = arg(&mut it)?;
                    masked(arg.getattr_flags, FUSE_GETATTR_FH, FileHandle::new(arg.fh, 0))
                };
                Operation::GetAttr { ino, fh }
            }
            fuse_opcode::FUSE_SETATTR => {
                let arg: fuse_setattr_in = arg(&mut it)?;
                let fh = masked(arg.valid, FATTR_FH, FileHandle::new(arg.fh, 0))
                    .map(|fh| fh.with_lock_owner(masked(arg.valid, FATTR_LOCKOWNER, arg.lock_owner)));
                Operation::SetAttr { ino, changes: SetAttrChanges::try_from(&arg)?, fh }
            }
            fuse_opcode::FUSE_READLINK => Operation::ReadLink { ino },
            fuse_opcode::FUSE_MKNOD => {
                let arg: fuse_mknod_in = arg(&mut it)?;
                Operation::MkNod { parent: ino, name: name(&mut it)?, mode: arg.mode, umask: arg.umask, rdev: arg.rdev }
            }
            fuse_opcode::FUSE_MKDIR => {
                let arg: fuse_mkdir_in = arg(&mut it)?;
                Operation::MkDir { parent: ino, name: name(&mut it)?, mode: arg.mode, umask: arg.umask }
            }
            fuse_opcode::FUSE_UNLINK => Operation::Unlink { parent: ino, name: name(&mut it)? },
            fuse_opcode::FUSE_RMDIR => Operation::RmDir { parent: ino, name: name(&mut it)? },
            fuse_opcode::FUSE_SYMLINK => {
                let name = name(&mut it)?;
                let link = PathBuf::from(self::name(&mut it)?);
                Operation::SymLink { parent: ino, name, link }
            }
            fuse_opcode::FUSE_RENAME => {
                let arg: fuse_rename_in = arg(&mut it)?;
                let name = name(&mut it)?;
                let newname = self::name(&mut it)?;
                Operation::Rename { parent: ino, name, newparent: arg.newdir, newname, flags: 0 }
            }
            fuse_opcode::FUSE_RENAME2 => {
                let arg: fuse_rename2_in = arg(&mut it)?;
                let name = name(&mut it)?;
                let newname = self::name(&mut it)?;
                Operation::Rename { parent: ino, name, newparent: arg.newdir, newname, flags: arg.flags }
            }
            fuse_opcode::FUSE_LINK => {
                let arg: fuse_link_in = arg(&mut it)?;
                Operation::Link { ino: arg.oldnodeid, newparent: ino, newname: name(&mut it)? }
            }
            fuse_opcode::FUSE_OPEN => {
                let arg: fuse_open_in = arg(&mut it)?;
                Operation::Open { ino, fh: FileHandle::new(0, arg.flags) }
            }
            fuse_opcode::FUSE_OPENDIR => {
                let arg: fuse_open_in = arg(&mut it)?;
                Operation::OpenDir { ino, fh: FileHandle::new(0, arg.flags) }
            }
            fuse_opcode::FUSE_READ | fuse_opcode::FUSE_READDIR => {
                let arg: fuse_read_in = arg(&mut it)?;
                let fh = FileHandle::new(arg.fh, arg.flags)
                    .with_lock_owner(masked(arg.read_flags, FUSE_READ_LOCKOWNER, arg.lock_owner));
                if opcode == fuse_opcode::FUSE_READ {
                    Operation::Read { ino, fh, offset: arg.offset as i64, size: arg.size }
                } else {
                    Operation::ReadDir { ino, fh, offset: arg.offset as i64, size: arg.size }
                }
            }
            fuse_opcode::FUSE_WRITE => {
                let arg: fuse_write_in = arg(&mut it)?;
                let data = it.fetch_bytes(arg.size as usize).ok_or(RequestError::InsufficientData)?;
                let fh = FileHandle::new(arg.fh, arg.flags)
                    .with_lock_owner(masked(arg.write_flags, FUSE_WRITE_LOCKOWNER, arg.lock_owner))
                    .with_writepage(arg.write_flags & FUSE_WRITE_CACHE != 0);
                Operation::Write { ino, fh, offset: arg.offset as i64, data: data.to_vec(), flags: arg.write_flags }
            }
            fuse_opcode::FUSE_FLUSH => {
                let arg: fuse_flush_in = arg(&mut it)?;
                Operation::Flush { ino, fh: FileHandle::new(arg.fh, 0).with_lock_owner(Some(arg.lock_owner)) }
            }
            fuse_opcode::FUSE_RELEASE | fuse_opcode::FUSE_RELEASEDIR => {
                let arg: fuse_release_in = arg(&mut it)?;
                let fh = FileHandle::new(arg.fh, arg.flags)
                    .with_lock_owner(Some(arg.lock_owner))
                    .with_flush(arg.release_flags & FUSE_RELEASE_FLUSH != 0)
                    .with_flock_release(arg.release_flags & FUSE_RELEASE_FLOCK_UNLOCK != 0);
                if opcode == fuse_opcode::FUSE_RELEASE {
                    Operation::Release { ino, fh }
                } else {
                    Operation::ReleaseDir { ino, fh }
                }
            }
            fuse_opcode::FUSE_FSYNC | fuse_opcode::FUSE_FSYNCDIR => {
                let arg: fuse_fsync_in = arg(&mut it)?;
                let fh = FileHandle::new(arg.fh, 0);
                let datasync = arg.fsync_flags & FUSE_FSYNC_FDATASYNC != 0;
                if opcode == fuse_opcode::FUSE_FSYNC {
                    Operation::FSync { ino, fh, datasync }
                } else {
                    Operation::FSyncDir { ino, fh, datasync }
                }
            }
            fuse_opcode::FUSE_STATFS => Operation::StatFs { ino },
            fuse_opcode::FUSE_SETXATTR => {
                let arg: fuse_setxattr_in = arg(&mut it)?;
                let name = name(&mut it)?;
                let value = it.fetch_bytes(arg.size as usize).ok_or(RequestError::InsufficientData)?;
                #[cfg(target_os = "macos")]
                let position = arg.position;
                #[cfg(not(target_os = "macos"))]
                let position = 0;
                Operation::SetXAttr { ino, name, value: value.to_vec(), flags: arg.flags, position }
            }
            fuse_opcode::FUSE_GETXATTR => {
                let arg: fuse_getxattr_in = arg(&mut it)?;
                #[cfg(target_os = "macos")]
                let position = arg.position;
                #[cfg(not(target_os = "macos"))]
                let position = 0;
                Operation::GetXAttr { ino, name: name(&mut it)?, size: arg.size, position }
            }
            fuse_opcode::FUSE_LISTXATTR => {
                let arg: fuse_getxattr_in = arg(&mut it)?;
                Operation::ListXAttr { ino, size: arg.size }
            }
            fuse_opcode::FUSE_REMOVEXATTR => Operation::RemoveXAttr { ino, name: name(&mut it)? },
            fuse_opcode::FUSE_ACCESS => {
                let arg: fuse_access_in = arg(&mut it)?;
                Operation::Access { ino, mask: arg.mask }
            }
            fuse_opcode::FUSE_CREATE => {
                let arg: fuse_create_in = arg(&mut it)?;
                Operation::Create { parent: ino, name: name(&mut it)?, mode: arg.mode, umask: arg.umask, fh: FileHandle::new(0, arg.flags) }
            }
            fuse_opcode::FUSE_GETLK => {
                let arg: fuse_lk_in = arg(&mut it)?;
                let fh = FileHandle::new(arg.fh, 0).with_lock_owner(Some(arg.owner));
                Operation::GetLock { ino, fh, lock: Lock::from(&arg.lk) }
            }
            fuse_opcode::FUSE_SETLK | fuse_opcode::FUSE_SETLKW => {
                let arg: fuse_lk_in = arg(&mut it)?;
                let fh = FileHandle::new(arg.fh, 0).with_lock_owner(Some(arg.owner));
                Operation::SetLock { ino, fh, lock: Lock::from(&arg.lk), sleep: opcode == fuse_opcode::FUSE_SETLKW }
            }
            fuse_opcode::FUSE_BMAP => {
                let arg: fuse_bmap_in = arg(&mut it)?;
                Operation::BMap { ino, blocksize: arg.blocksize, idx: arg.block }
            }
            // Interrupts are answered by the session itself
            fuse_opcode::FUSE_INTERRUPT => return Err(RequestError::UnknownOperation(opcode as u32)),
        };
        Ok(Request {
            token: RequestToken(req.unique()),
            context: RequestContext { uid: req.uid(), gid: req.gid(), pid: req.pid() },
            operation,
        })
    }
}


#[cfg(test)]
pub(crate) mod test {
    use super::*;
    use crate::ll::reply::struct_bytes;
    use std::time::{Duration, UNIX_EPOCH};

    /// Builds a raw kernel packet for the given opcode from an argument struct and trailing bytes.
    pub(crate) fn packet_with<T: Copy>(opcode: fuse_opcode, unique: u64, nodeid: u64, arg: &T, tail: &[u8]) -> Vec<u8> {
        let mut args = struct_bytes(arg).to_vec();
        args.extend_from_slice(tail);
        ll::packet(opcode as u32, unique, nodeid, &args)
    }

    pub(crate) fn parse(packet: &[u8]) -> Result<Request, RequestError> {
        let req = ll::Request::try_from(packet)?;
        Request::try_from(&req)
    }

    #[test]
    fn lookup() {
        let data = ll::packet(fuse_opcode::FUSE_LOOKUP as u32, 0xdeadbeef, 1, b"foo\0");
        let req = parse(&data).unwrap();
        assert_eq!(req.token().unique(), 0xdeadbeef);
        assert_eq!(*req.context(), RequestContext { uid: 0xc001, gid: 0xc002, pid: 0xc003 });
        assert_eq!(req.kind(), OperationKind::Lookup);
        match req.operation() {
            Operation::Lookup { parent, name } => {
                assert_eq!(*parent, 1);
                assert_eq!(name, "foo");
            }
            op => panic!("Unexpected operation {:?}", op),
        }
        assert_eq!(req.to_string(), "LOOKUP(3735928559) parent 0x0000000000000001, name \"foo\"");
    }

    #[test]
    fn lookup_without_name() {
        let data = ll::packet(fuse_opcode::FUSE_LOOKUP as u32, 1, 1, b"foo");
        assert_eq!(parse(&data).unwrap_err(), RequestError::InsufficientData);
    }

    #[test]
    fn setattr_surfaces_masked_fields_only() {
        let arg = fuse_setattr_in {
            valid: FATTR_MODE | FATTR_SIZE,
            mode: 0o100600,
            size: 4096,
            uid: 1000,
            gid: 1000,
            atime: 1_000_000,
            mtime: 2_000_000,
            ..Default::default()
        };
        let data = packet_with(fuse_opcode::FUSE_SETATTR, 7, 5, &arg, &[]);
        match parse(&data).unwrap().operation() {
            Operation::SetAttr { ino, changes, fh } => {
                assert_eq!(*ino, 5);
                assert_eq!(*changes, SetAttrChanges { mode: Some(0o100600), size: Some(4096), ..Default::default() });
                assert!(fh.is_none());
            }
            op => panic!("Unexpected operation {:?}", op),
        }
    }

    #[test]
    fn setattr_times() {
        let arg = fuse_setattr_in {
            valid: FATTR_ATIME | FATTR_ATIME_NOW | FATTR_MTIME | FATTR_FH,
            fh: 0x1234,
            mtime: 10,
            mtimensec: 500,
            ..Default::default()
        };
        let data = packet_with(fuse_opcode::FUSE_SETATTR, 7, 5, &arg, &[]);
        match parse(&data).unwrap().operation() {
            Operation::SetAttr { changes, fh, .. } => {
                assert_eq!(changes.atime, Some(TimeOrNow::Now));
                assert_eq!(changes.mtime, Some(TimeOrNow::SpecificTime(UNIX_EPOCH + Duration::new(10, 500))));
                assert_eq!(changes.mode, None);
                assert_eq!(fh.map(|fh| fh.fh()), Some(0x1234));
                assert_eq!(fh.and_then(|fh| fh.lock_owner()), None);
            }
            op => panic!("Unexpected operation {:?}", op),
        }
    }

    #[test]
    fn setattr_time_out_of_range() {
        let arg = fuse_setattr_in { valid: FATTR_ATIME, atime: i64::MAX, atimensec: u32::MAX, ..Default::default() };
        let data = packet_with(fuse_opcode::FUSE_SETATTR, 7, 5, &arg, &[]);
        let err = parse(&data).unwrap_err();
        assert_eq!(err, RequestError::InvalidArgument);
        assert_eq!(err.errno(), libc::EINVAL);

        // Unmasked garbage is ignored
        let arg = fuse_setattr_in { valid: FATTR_MODE, mode: 0o644, ctime: i64::MAX, ctimensec: u32::MAX, mtime: i64::MAX, mtimensec: u32::MAX, ..Default::default() };
        let data = packet_with(fuse_opcode::FUSE_SETATTR, 8, 5, &arg, &[]);
        assert!(parse(&data).is_ok());
    }

    #[test]
    fn write_owns_data() {
        let arg = fuse_write_in { fh: 3, offset: 8, size: 4, write_flags: FUSE_WRITE_LOCKOWNER, lock_owner: 99, ..Default::default() };
        let data = packet_with(fuse_opcode::FUSE_WRITE, 9, 5, &arg, b"abcd");
        let req = parse(&data).unwrap();
        drop(data);
        match req.operation() {
            Operation::Write { ino, fh, offset, data, .. } => {
                assert_eq!((*ino, *offset), (5, 8));
                assert_eq!(data, b"abcd");
                assert_eq!(fh.fh(), 3);
                assert_eq!(fh.lock_owner(), Some(99));
                assert!(!fh.writepage());
            }
            op => panic!("Unexpected operation {:?}", op),
        }
    }

    #[test]
    fn batch_forget() {
        let arg = fuse_batch_forget_in { count: 2, dummy: 0 };
        let mut tail = struct_bytes(&fuse_forget_one { nodeid: 10, nlookup: 1 }).to_vec();
        tail.extend_from_slice(struct_bytes(&fuse_forget_one { nodeid: 11, nlookup: 3 }));
        let data = packet_with(fuse_opcode::FUSE_BATCH_FORGET, 12, 0, &arg, &tail);
        let req = parse(&data).unwrap();
        assert!(!req.kind().has_reply());
        match req.operation() {
            Operation::ForgetMulti(forgets) => assert_eq!(forgets, &[Forget { ino: 10, nlookup: 1 }, Forget { ino: 11, nlookup: 3 }]),
            op => panic!("Unexpected operation {:?}", op),
        }
    }

    #[test]
    fn release_flags() {
        let arg = fuse_release_in { fh: 4, flags: libc::O_RDWR as u32, release_flags: FUSE_RELEASE_FLUSH, lock_owner: 77 };
        let data = packet_with(fuse_opcode::FUSE_RELEASE, 13, 5, &arg, &[]);
        match parse(&data).unwrap().operation() {
            Operation::Release { fh, .. } => {
                assert_eq!(fh.fh(), 4);
                assert_eq!(fh.flags(), libc::O_RDWR as u32);
                assert!(fh.flush());
                assert!(!fh.flock_release());
                assert_eq!(fh.lock_owner(), Some(77));
            }
            op => panic!("Unexpected operation {:?}", op),
        }
    }

    #[test]
    fn setlkw_sleeps() {
        let arg = fuse_lk_in {
            fh: 1,
            owner: 2,
            lk: fuse_file_lock { start: 0, end: 100, typ: libc::F_WRLCK as u32, pid: 42 },
            ..Default::default()
        };
        let data = packet_with(fuse_opcode::FUSE_SETLKW, 14, 5, &arg, &[]);
        let req = parse(&data).unwrap();
        assert_eq!(req.kind().name(), "setlk");
        match req.operation() {
            Operation::SetLock { lock, sleep, .. } => {
                assert!(*sleep);
                assert_eq!(lock.end, 100);
                assert_eq!(lock.pid, 42);
            }
            op => panic!("Unexpected operation {:?}", op),
        }
    }

    #[test]
    fn notification_kinds() {
        for kind in &[OperationKind::Init, OperationKind::Destroy, OperationKind::Forget, OperationKind::ForgetMulti] {
            assert!(!kind.has_reply());
        }
        assert!(OperationKind::GetAttr.has_reply());
        assert_eq!(OperationKind::GetLock.name(), "getlk");
        assert_eq!(OperationKind::ForgetMulti.to_string(), "forget_multi");
    }
}
