//! FUSE request proxy.
//!
//! Runs a userspace filesystem with two threads: a kernel thread that reads requests from the
//! FUSE kernel driver and a handler thread that calls into the `Filesystem` implementation. Every
//! request is handed over through a single slot mailbox, so at most one request is being
//! processed at any time. Each request that expects an answer gets a typed reply handle that
//! forwards exactly one completion to the kernel driver, no matter how often (or from which
//! thread) it is completed.

#![warn(missing_docs, missing_debug_implementations, rust_2018_idioms)]

pub mod ll;
pub use ll::{FileAttr, FileType};

mod request;
pub use request::{ConnectionInfo, Forget, Lock, Operation, OperationKind, Request, RequestContext, RequestToken, SetAttrChanges, TimeOrNow};

mod file_handle;
pub use file_handle::{FileHandle, Open};

mod reply;
pub use reply::{Completion, Entry, Outcome, Reply, ReplyError, ReplySender, StatFs};
pub use reply::{ReplyAttr, ReplyBmap, ReplyCreate, ReplyData, ReplyDirectory, ReplyEmpty, ReplyEntry};
pub use reply::{ReplyLock, ReplyOpen, ReplyReadlink, ReplyStatfs, ReplyWrite, ReplyXattr};

mod mailbox;
pub use mailbox::{Closed, Delivery, Mailbox};

mod filesystem;
pub use filesystem::Filesystem;

mod dispatch;
pub use dispatch::{Dispatcher, Envelope, LogObserver, Notice, Observer, PanicPolicy};

mod channel;
pub use channel::{Channel, ChannelSender};

mod session;
pub use session::{serve, start, stop, BackgroundSession, Session, SessionBuilder, DEFAULT_CAPABILITIES, MAX_WRITE_SIZE};
