//! Filesystem operation reply
//!
//! A reply is passed to filesystem operation implementations and must be used to send back the
//! result of an operation. The reply can optionally be sent to another thread to asynchronously
//! work on an operation and provide the result later. Also it allows replying with a block of
//! data without cloning the data. A reply *must always* be used (by calling either one of its
//! success methods or `error()` exactly once).
//!
//! All clones of a reply share one completion state. The first completion is forwarded to the
//! kernel driver, every further attempt is rejected with `ReplyError::AlreadyCompleted` and never
//! reaches the kernel.

use std::borrow::Cow;
use std::ffi::OsStr;
use std::io::{self, Write};
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use std::{error, fmt};

use fuse_abi::{fuse_bmap_out, fuse_getxattr_out, fuse_write_out};
use libc::c_int;
use log::{error, warn};

use crate::file_handle::Open;
use crate::ll::reply::{self as ll_reply, Response};
use crate::ll::{FileAttr, FileType};
use crate::request::{Lock, OperationKind, RequestToken};


/// Generic reply callback to send data
pub trait ReplySender: Write + Send + fmt::Debug + 'static {}

impl<T: Write + Send + fmt::Debug + 'static> ReplySender for T {}


/// Directory entry, as returned by name resolving operations (`lookup`, `mknod`, `mkdir`,
/// `symlink`, `link` and `create`).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Entry {
    /// Attributes of the entry. `attr.ino` is the inode number the entry resolves to.
    pub attr: FileAttr,
    /// Inode generation. The pair of inode number and generation must be unique over the
    /// lifetime of the filesystem.
    pub generation: u64,
    /// How long the kernel may cache the attributes.
    pub attr_ttl: Duration,
    /// How long the kernel may cache the name lookup.
    pub entry_ttl: Duration,
}

impl Entry {
    /// Entry with the same cache timeout for attributes and name.
    pub fn new(attr: FileAttr, generation: u64, ttl: Duration) -> Self {
        Self { attr, generation, attr_ttl: ttl, entry_ttl: ttl }
    }

    /// Inode number of the entry.
    pub fn ino(&self) -> u64 {
        self.attr.ino
    }
}


/// Filesystem statistics (`struct statvfs`).
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct StatFs {
    /// Total data blocks (in units of `frsize`).
    pub blocks: u64,
    /// Free blocks.
    pub bfree: u64,
    /// Free blocks available to unprivileged users.
    pub bavail: u64,
    /// Total inodes.
    pub files: u64,
    /// Free inodes.
    pub ffree: u64,
    /// Filesystem block size.
    pub bsize: u32,
    /// Maximum length of filenames.
    pub namelen: u32,
    /// Fragment size.
    pub frsize: u32,
}

impl From<&libc::statvfs> for StatFs {
    #[allow(trivial_numeric_casts)]
    fn from(st: &libc::statvfs) -> Self {
        StatFs {
            blocks: st.f_blocks as u64,
            bfree: st.f_bfree as u64,
            bavail: st.f_bavail as u64,
            files: st.f_files as u64,
            ffree: st.f_ffree as u64,
            bsize: st.f_bsize as u32,
            namelen: st.f_namemax as u32,
            frsize: st.f_frsize as u32,
        }
    }
}


/// How a request was completed.
#[derive(Clone, Debug, PartialEq)]
#[allow(missing_docs)]
pub enum Outcome {
    Ok,
    Entry(Entry),
    Created(Entry, Open),
    Attr(Duration, FileAttr),
    Target(PathBuf),
    /// Number of bytes of data sent.
    Data(usize),
    Written(u32),
    Opened(Open),
    Statfs(StatFs),
    XattrSize(u32),
    Locked(Lock),
    Bmap(u64),
    Error(c_int),
}


/// Error returned by reply methods.
#[derive(Debug)]
pub enum ReplyError {
    /// The request was already completed. Nothing was sent to the kernel driver.
    AlreadyCompleted(RequestToken, OperationKind),
    /// Sending the reply to the kernel driver failed. The request counts as completed anyway.
    Io(io::Error),
}

impl fmt::Display for ReplyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReplyError::AlreadyCompleted(token, kind) => write!(f, "{} request {} was already completed", kind, token),
            ReplyError::Io(err) => write!(f, "Failed to send reply: {}", err),
        }
    }
}

impl error::Error for ReplyError {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match self {
            ReplyError::Io(err) => Some(err),
            _ => None,
        }
    }
}


#[derive(Debug)]
struct State {
    sender: Option<Box<dyn ReplySender>>,
    outcome: Option<Outcome>,
}

/// Completion state of a request, shared by all reply handles of the request.
///
/// Transitions from pending to completed exactly once.
#[derive(Debug)]
pub struct Completion {
    token: RequestToken,
    kind: OperationKind,
    state: Mutex<State>,
}

impl Completion {
    /// Create a pending completion for the given request. The reply will be sent with `sender`.
    pub fn new(token: RequestToken, kind: OperationKind, sender: Box<dyn ReplySender>) -> Self {
        Self { token, kind, state: Mutex::new(State { sender: Some(sender), outcome: None }) }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Token of the request.
    pub fn token(&self) -> RequestToken {
        self.token
    }

    /// Kind of the request.
    pub fn kind(&self) -> OperationKind {
        self.kind
    }

    /// Whether the request has been completed.
    pub fn is_completed(&self) -> bool {
        self.lock().outcome.is_some()
    }

    /// How the request was completed, `None` while pending.
    pub fn outcome(&self) -> Option<Outcome> {
        self.lock().outcome.clone()
    }

    /// Complete the request. The completion is recorded before the response is sent, so a
    /// concurrent second attempt can never send as well.
    pub(crate) fn complete(&self, outcome: Outcome, response: Response<'_>) -> Result<(), ReplyError> {
        let sender = {
            let mut state = self.lock();
            if let Some(previous) = &state.outcome {
                error!("{}({}) already completed with {:?}, rejecting {:?}", self.kind.name().to_uppercase(), self.token, previous, outcome);
                return Err(ReplyError::AlreadyCompleted(self.token, self.kind));
            }
            state.outcome = Some(outcome);
            state.sender.take()
        };
        match sender {
            Some(mut sender) => sender.write_vectored(&response.to_io_slices()).map(|_| ()).map_err(|err| {
                warn!("Failed to send reply for {}({}): {}", self.kind.name().to_uppercase(), self.token, err);
                ReplyError::Io(err)
            }),
            None => Ok(()),
        }
    }

    /// Complete the request with an error code.
    pub(crate) fn fail(&self, err: c_int) -> Result<(), ReplyError> {
        self.complete(Outcome::Error(err), Response::error(self.token.unique(), err))
    }
}

impl Drop for Completion {
    fn drop(&mut self) {
        let state = self.state.get_mut().unwrap_or_else(PoisonError::into_inner);
        if self.kind.has_reply() && state.outcome.is_none() {
            warn!("{}({}) was never replied to, the calling process hangs until interrupted", self.kind.name().to_uppercase(), self.token);
        }
    }
}


/// Generic reply trait
pub trait Reply: Sized {
    /// Create a reply handle sharing the given completion state
    fn from_completion(completion: Arc<Completion>) -> Self;

    /// Create a new reply for the given request
    fn new<S: ReplySender>(token: RequestToken, kind: OperationKind, sender: S) -> Self {
        Self::from_completion(Arc::new(Completion::new(token, kind, Box::new(sender))))
    }
}

macro_rules! reply {
    ($(#[$attr:meta])* $name:ident) => {
        $(#[$attr])*
        #[derive(Clone, Debug)]
        pub struct $name {
            completion: Arc<Completion>,
        }

        impl Reply for $name {
            fn from_completion(completion: Arc<Completion>) -> Self {
                Self { completion }
            }
        }

        impl $name {
            /// Token of the request this reply answers.
            pub fn token(&self) -> RequestToken {
                self.completion.token()
            }

            /// Reply to a request with the given error code
            pub fn error(self, err: c_int) -> Result<(), ReplyError> {
                self.completion.fail(err)
            }

            fn send(&self, outcome: Outcome, response: Response<'_>) -> Result<(), ReplyError> {
                self.completion.complete(outcome, response)
            }

            fn unique(&self) -> u64 {
                self.completion.token().unique()
            }
        }
    };
}


reply! {
    /// Empty reply
    ReplyEmpty
}

impl ReplyEmpty {
    /// Reply to a request with nothing
    pub fn ok(self) -> Result<(), ReplyError> {
        self.send(Outcome::Ok, Response::empty(self.unique()))
    }
}

reply! {
    /// Data reply
    ReplyData
}

impl ReplyData {
    /// Reply to a request with the given data. Exactly the given bytes are sent, even if the
    /// request asked for more.
    pub fn data(self, data: &[u8]) -> Result<(), ReplyError> {
        self.send(Outcome::Data(data.len()), Response::data(self.unique(), data))
    }
}

reply! {
    /// Entry reply
    ReplyEntry
}

impl ReplyEntry {
    /// Reply to a request with the given entry
    pub fn entry(self, entry: &Entry) -> Result<(), ReplyError> {
        let response = Response::with_struct(self.unique(), &ll_reply::entry_out(entry));
        self.send(Outcome::Entry(*entry), response)
    }
}

reply! {
    /// Create reply
    ReplyCreate
}

impl ReplyCreate {
    /// Reply to a request with the given entry and the opened file
    pub fn created(self, entry: &Entry, open: &Open) -> Result<(), ReplyError> {
        let mut payload = ll_reply::struct_bytes(&ll_reply::entry_out(entry)).to_vec();
        payload.extend_from_slice(ll_reply::struct_bytes(&ll_reply::open_out(open)));
        let response = Response::new(self.unique(), Ok(Cow::Owned(payload)));
        self.send(Outcome::Created(*entry, *open), response)
    }
}

reply! {
    /// Attribute reply
    ReplyAttr
}

impl ReplyAttr {
    /// Reply to a request with the given attribute
    pub fn attr(self, ttl: &Duration, attr: &FileAttr) -> Result<(), ReplyError> {
        let response = Response::with_struct(self.unique(), &ll_reply::attr_out(ttl, attr));
        self.send(Outcome::Attr(*ttl, *attr), response)
    }
}

reply! {
    /// Readlink reply
    ReplyReadlink
}

impl ReplyReadlink {
    /// Reply to a request with the target of the link
    pub fn target(self, target: &Path) -> Result<(), ReplyError> {
        let response = Response::data(self.unique(), target.as_os_str().as_bytes());
        self.send(Outcome::Target(target.to_owned()), response)
    }
}

reply! {
    /// Open reply
    ReplyOpen
}

impl ReplyOpen {
    /// Reply to a request with the given open result
    pub fn opened(self, open: &Open) -> Result<(), ReplyError> {
        let response = Response::with_struct(self.unique(), &ll_reply::open_out(open));
        self.send(Outcome::Opened(*open), response)
    }
}

reply! {
    /// Write reply
    ReplyWrite
}

impl ReplyWrite {
    /// Reply to a request with the number of bytes written
    pub fn written(self, size: u32) -> Result<(), ReplyError> {
        let response = Response::with_struct(self.unique(), &fuse_write_out { size, padding: 0 });
        self.send(Outcome::Written(size), response)
    }
}

reply! {
    /// Statfs reply
    ReplyStatfs
}

impl ReplyStatfs {
    /// Reply to a request with filesystem statistics
    pub fn statfs(self, st: &StatFs) -> Result<(), ReplyError> {
        let response = Response::with_struct(self.unique(), &ll_reply::statfs_out(st));
        self.send(Outcome::Statfs(*st), response)
    }
}

reply! {
    /// Xattr reply
    ReplyXattr
}

impl ReplyXattr {
    /// Reply to a request with the size of the xattr (or list of xattr names).
    pub fn size(self, size: u32) -> Result<(), ReplyError> {
        let response = Response::with_struct(self.unique(), &fuse_getxattr_out { size, padding: 0 });
        self.send(Outcome::XattrSize(size), response)
    }

    /// Reply to a request with the data in the xattr (or the list of xattr names).
    pub fn data(self, data: &[u8]) -> Result<(), ReplyError> {
        self.send(Outcome::Data(data.len()), Response::data(self.unique(), data))
    }
}

reply! {
    /// Lock reply
    ReplyLock
}

impl ReplyLock {
    /// Reply to a request with the conflicting lock (or the lock unchanged with type `F_UNLCK`
    /// if there is none)
    pub fn locked(self, lock: &Lock) -> Result<(), ReplyError> {
        let response = Response::with_struct(self.unique(), &ll_reply::lk_out(lock));
        self.send(Outcome::Locked(*lock), response)
    }
}

reply! {
    /// Bmap reply
    ReplyBmap
}

impl ReplyBmap {
    /// Reply to a request with the mapped device block index
    pub fn bmap(self, block: u64) -> Result<(), ReplyError> {
        let response = Response::with_struct(self.unique(), &fuse_bmap_out { block });
        self.send(Outcome::Bmap(block), response)
    }
}


///
/// Directory reply
///
#[derive(Clone, Debug)]
pub struct ReplyDirectory {
    completion: Arc<Completion>,
    data: Vec<u8>,
    size: usize,
}

impl ReplyDirectory {
    /// Creates a new ReplyDirectory with a specified buffer size.
    pub fn new<S: ReplySender>(token: RequestToken, sender: S, size: usize) -> ReplyDirectory {
        let completion = Completion::new(token, OperationKind::ReadDir, Box::new(sender));
        Self::with_completion(Arc::new(completion), size)
    }

    pub(crate) fn with_completion(completion: Arc<Completion>, size: usize) -> ReplyDirectory {
        Self { completion, data: Vec::with_capacity(size.min(64 * 1024)), size }
    }

    /// Token of the request this reply answers.
    pub fn token(&self) -> RequestToken {
        self.completion.token()
    }

    /// Add an entry to the directory reply buffer. Returns true if the buffer is full.
    /// A transparent offset value can be provided for each entry. The kernel uses these
    /// value to request the next entries in further readdir calls
    pub fn add<T: AsRef<OsStr>>(&mut self, ino: u64, offset: i64, kind: FileType, name: T) -> bool {
        !ll_reply::append_dirent(&mut self.data, self.size, ino, offset, kind, name.as_ref())
    }

    /// Reply to a request with the filled directory buffer
    pub fn ok(self) -> Result<(), ReplyError> {
        let unique = self.completion.token().unique();
        self.completion.complete(Outcome::Data(self.data.len()), Response::data(unique, &self.data))
    }

    /// Reply to a request with an already encoded directory buffer
    pub fn data(self, data: &[u8]) -> Result<(), ReplyError> {
        let unique = self.completion.token().unique();
        self.completion.complete(Outcome::Data(data.len()), Response::data(unique, data))
    }

    /// Reply to a request with the given error code
    pub fn error(self, err: c_int) -> Result<(), ReplyError> {
        self.completion.fail(err)
    }
}
