//! Request dispatch.
//!
//! The dispatcher runs on the handler thread. It takes requests out of the mailbox one at a time,
//! calls the matching `Filesystem` method with a fresh reply, tells observers about the request
//! and releases the request and its mailbox slot afterwards.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::{fmt, process};

use libc::c_int;
use log::{debug, error};

use crate::filesystem::Filesystem;
use crate::mailbox::{Delivery, Mailbox};
use crate::reply::{Completion, Outcome, Reply, ReplyDirectory, ReplySender};
use crate::request::{Operation, Request};


/// A request together with the sender its reply goes to.
#[derive(Debug)]
pub struct Envelope {
    /// The request.
    pub request: Request,
    /// Where the reply to the request is sent.
    pub sender: Box<dyn ReplySender>,
}

impl Envelope {
    /// Create an envelope for the given request and reply sender.
    pub fn new<S: ReplySender>(request: Request, sender: S) -> Self {
        Self { request, sender: Box::new(sender) }
    }
}


/// Notification about a dispatched request.
#[derive(Debug)]
pub struct Notice<'a> {
    /// Name of the operation (`"lookup"`, `"read"`, ...).
    pub name: &'static str,
    /// The request, including its context and arguments.
    pub request: &'a Request,
    /// How the request was completed. `None` if the filesystem didn't complete it (yet) or the
    /// operation doesn't expect a reply.
    pub outcome: Option<Outcome>,
}

/// Observer of dispatched requests, e.g. for logging or metrics.
pub trait Observer: Send {
    /// Called after every dispatched request, whether or not it was completed.
    fn notice(&mut self, notice: &Notice<'_>);
}

/// Observer logging every request at debug level.
#[derive(Clone, Copy, Debug, Default)]
pub struct LogObserver;

impl Observer for LogObserver {
    fn notice(&mut self, notice: &Notice<'_>) {
        match &notice.outcome {
            Some(outcome) => debug!("{} -> {:?}", notice.request, outcome),
            None => debug!("{} -> no reply", notice.request),
        }
    }
}


/// What to do if a filesystem method panics.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PanicPolicy {
    /// Log the panic and abort the process.
    Abort,
    /// Log the panic, reply with the given error code if the request is still pending and go on
    /// with the next request. Panicking observers are skipped.
    Reply(c_int),
}

impl Default for PanicPolicy {
    fn default() -> Self {
        PanicPolicy::Abort
    }
}


/// Dispatches requests to a filesystem implementation.
pub struct Dispatcher<FS> {
    filesystem: FS,
    observers: Vec<Box<dyn Observer>>,
    panic_policy: PanicPolicy,
}

impl<FS: fmt::Debug> fmt::Debug for Dispatcher<FS> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dispatcher")
            .field("filesystem", &self.filesystem)
            .field("observers", &self.observers.len())
            .field("panic_policy", &self.panic_policy)
            .finish()
    }
}

impl<FS: Filesystem> Dispatcher<FS> {
    /// Create a dispatcher for the given filesystem.
    pub fn new(filesystem: FS) -> Self {
        Self { filesystem, observers: Vec::new(), panic_policy: PanicPolicy::default() }
    }

    /// Add an observer.
    pub fn observer<O: Observer + 'static>(mut self, observer: O) -> Self {
        self.observers.push(Box::new(observer));
        self
    }

    pub(crate) fn add_observers(&mut self, observers: Vec<Box<dyn Observer>>) {
        self.observers.extend(observers);
    }

    /// Set the policy for panicking filesystem methods.
    pub fn panic_policy(mut self, policy: PanicPolicy) -> Self {
        self.panic_policy = policy;
        self
    }

    /// Returns a reference to the filesystem.
    pub fn filesystem(&self) -> &FS {
        &self.filesystem
    }

    /// Returns a mutable reference to the filesystem.
    pub fn filesystem_mut(&mut self) -> &mut FS {
        &mut self.filesystem
    }

    /// Consume the dispatcher and return the filesystem.
    pub fn into_filesystem(self) -> FS {
        self.filesystem
    }

    /// Dispatch requests from the mailbox until it is closed.
    pub fn run(&mut self, mailbox: &Mailbox<Envelope>) {
        while let Some(delivery) = mailbox.receive() {
            self.dispatch(delivery);
        }
    }

    /// Dispatch a single request received from the mailbox. The mailbox slot is freed when this
    /// returns.
    pub fn dispatch(&mut self, mut delivery: Delivery<'_, Envelope>) {
        if let Some(envelope) = delivery.take() {
            self.process(envelope);
        }
        drop(delivery);
    }

    fn process(&mut self, envelope: Envelope) {
        let Envelope { request, sender } = envelope;
        let kind = request.kind();
        let completion = Arc::new(Completion::new(request.token(), kind, sender));

        let filesystem = &mut self.filesystem;
        let result = panic::catch_unwind(AssertUnwindSafe(|| call(filesystem, &request, &completion)));
        if let Err(payload) = result {
            self.handler_panicked(&request, &completion, payload);
        }

        let notice = Notice { name: kind.name(), request: &request, outcome: completion.outcome() };
        for observer in &mut self.observers {
            if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| observer.notice(&notice))) {
                observer_panicked(self.panic_policy, &request, &*payload);
            }
        }

        // Release our handle (a still pending reply may live on elsewhere) and the request
        drop(notice);
        drop(completion);
        drop(request);
    }

    fn handler_panicked(&self, request: &Request, completion: &Completion, payload: Box<dyn Any + Send>) {
        let message = panic_message(&*payload);
        match self.panic_policy {
            PanicPolicy::Abort => {
                error!("Filesystem panicked while handling {}: {}", request, message);
                process::abort();
            }
            PanicPolicy::Reply(errno) => {
                error!("Filesystem panicked while handling {}: {}, replying with error {}", request, message, errno);
                if request.kind().has_reply() && !completion.is_completed() {
                    let _ = completion.fail(errno);
                }
            }
        }
    }
}

/// Apply the panic policy to a panicking observer. The request itself is already handled.
fn observer_panicked(policy: PanicPolicy, request: &Request, payload: &(dyn Any + Send)) {
    let message = panic_message(payload);
    match policy {
        PanicPolicy::Abort => {
            error!("Observer panicked while noticing {}: {}", request, message);
            process::abort();
        }
        PanicPolicy::Reply(_) => error!("Observer panicked while noticing {}: {}, ignoring", request, message),
    }
}

/// Message of a caught panic, if it carries one.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> &str {
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("Box<Any>")
}

fn reply<R: Reply>(completion: &Arc<Completion>) -> R {
    R::from_completion(completion.clone())
}

/// Call the filesystem method matching the requested operation.
fn call<FS: Filesystem>(fs: &mut FS, req: &Request, c: &Arc<Completion>) {
    match req.operation() {
        Operation::Init(info) => fs.init(req, info),
        Operation::Destroy => fs.destroy(req),
        Operation::Lookup { parent, name } => fs.lookup(req, *parent, name, reply(c)),
        Operation::Forget(forget) => fs.forget(req, forget.ino, forget.nlookup),
        Operation::ForgetMulti(forgets) => fs.forget_multi(req, forgets),
        Operation::GetAttr { ino, fh } => fs.getattr(req, *ino, fh.as_ref(), reply(c)),
        Operation::SetAttr { ino, changes, fh } => fs.setattr(req, *ino, changes, fh.as_ref(), reply(c)),
        Operation::ReadLink { ino } => fs.readlink(req, *ino, reply(c)),
        Operation::MkNod { parent, name, mode, umask, rdev } => fs.mknod(req, *parent, name, *mode, *umask, *rdev, reply(c)),
        Operation::MkDir { parent, name, mode, umask } => fs.mkdir(req, *parent, name, *mode, *umask, reply(c)),
        Operation::Unlink { parent, name } => fs.unlink(req, *parent, name, reply(c)),
        Operation::RmDir { parent, name } => fs.rmdir(req, *parent, name, reply(c)),
        Operation::SymLink { parent, name, link } => fs.symlink(req, *parent, name, link, reply(c)),
        Operation::Rename { parent, name, newparent, newname, flags } => fs.rename(req, *parent, name, *newparent, newname, *flags, reply(c)),
        Operation::Link { ino, newparent, newname } => fs.link(req, *ino, *newparent, newname, reply(c)),
        Operation::Open { ino, fh } => fs.open(req, *ino, fh, reply(c)),
        Operation::Read { ino, fh, offset, size } => fs.read(req, *ino, fh, *offset, *size, reply(c)),
        Operation::Write { ino, fh, offset, data, flags } => fs.write(req, *ino, fh, *offset, data, *flags, reply(c)),
        Operation::Flush { ino, fh } => fs.flush(req, *ino, fh, reply(c)),
        Operation::Release { ino, fh } => fs.release(req, *ino, fh, reply(c)),
        Operation::FSync { ino, fh, datasync } => fs.fsync(req, *ino, fh, *datasync, reply(c)),
        Operation::OpenDir { ino, fh } => fs.opendir(req, *ino, fh, reply(c)),
        Operation::ReadDir { ino, fh, offset, size } => {
            fs.readdir(req, *ino, fh, *offset, ReplyDirectory::with_completion(c.clone(), *size as usize))
        }
        Operation::ReleaseDir { ino, fh } => fs.releasedir(req, *ino, fh, reply(c)),
        Operation::FSyncDir { ino, fh, datasync } => fs.fsyncdir(req, *ino, fh, *datasync, reply(c)),
        Operation::StatFs { ino } => fs.statfs(req, *ino, reply(c)),
        Operation::SetXAttr { ino, name, value, flags, position } => fs.setxattr(req, *ino, name, value, *flags, *position, reply(c)),
        Operation::GetXAttr { ino, name, size, position } => fs.getxattr(req, *ino, name, *size, *position, reply(c)),
        Operation::ListXAttr { ino, size } => fs.listxattr(req, *ino, *size, reply(c)),
        Operation::RemoveXAttr { ino, name } => fs.removexattr(req, *ino, name, reply(c)),
        Operation::Access { ino, mask } => fs.access(req, *ino, *mask, reply(c)),
        Operation::Create { parent, name, mode, umask, fh } => fs.create(req, *parent, name, *mode, *umask, fh, reply(c)),
        Operation::GetLock { ino, fh, lock } => fs.getlk(req, *ino, fh, lock, reply(c)),
        Operation::SetLock { ino, fh, lock, sleep } => fs.setlk(req, *ino, fh, lock, *sleep, reply(c)),
        Operation::BMap { ino, blocksize, idx } => fs.bmap(req, *ino, *blocksize, *idx, reply(c)),
    }
}
