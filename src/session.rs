//! Filesystem session.
//!
//! A session runs a filesystem implementation while it is being mounted to a specific mountpoint.
//! A session begins by mounting the filesystem and ends by unmounting it. While the session is
//! running, a kernel thread receives filesystem operation requests from the FUSE kernel driver
//! and hands them through the mailbox to the handler thread, which dispatches them to the
//! filesystem implementation. Replies go back to the kernel driver directly from wherever the
//! filesystem completes them.

use std::borrow::Cow;
use std::convert::TryFrom;
use std::ffi::{OsStr, OsString};
use std::io::{self, Read};
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::{fmt, mem, thread};

use fuse_abi::consts::{FUSE_ASYNC_READ, FUSE_BIG_WRITES};
use fuse_abi::{fuse_in_header, fuse_init_out, fuse_opcode};
use fuse_abi::{FUSE_KERNEL_MINOR_VERSION, FUSE_KERNEL_VERSION, FUSE_MIN_KERNEL_MINOR_VERSION};
use log::{debug, error, info, warn};

use crate::channel::{self, Channel};
use crate::dispatch::{panic_message, Dispatcher, Envelope, LogObserver, Observer, PanicPolicy};
use crate::filesystem::Filesystem;
use crate::ll::reply::struct_bytes;
use crate::ll::{self, ArgumentIterator, Response};
use crate::mailbox::{Closed, Mailbox};
use crate::reply::ReplySender;
use crate::request::{ConnectionInfo, Operation, OperationKind, Request};


/// Default max size of write requests (16M, which is also OSXFUSE's default).
pub const MAX_WRITE_SIZE: usize = 16 * 1024 * 1024;

/// Capability flags enabled by default, if offered by the kernel.
pub const DEFAULT_CAPABILITIES: u32 = FUSE_ASYNC_READ | FUSE_BIG_WRITES;

/// Size of `fuse_init_out` as understood by kernels before ABI 7.23.
const COMPAT_22_INIT_OUT_SIZE: usize = 24;


/// Builder for configuring a filesystem `Session`.
///
/// This builder can be used to configure the session prior to mounting and running the filesystem.
/// See the various methods of this type for configuration options of a session. Eventually call
/// `mount` to mount, `run` to mount and run or `spawn` to mount and run in the background.
pub struct SessionBuilder<FS: Filesystem> {
    filesystem: FS,
    mountpoint: PathBuf,
    options: Vec<OsString>,
    max_write_size: usize,
    help_default: bool,
    panic_policy: PanicPolicy,
    observers: Vec<Box<dyn Observer>>,
    capabilities: u32,
}

impl<FS: Filesystem> fmt::Debug for SessionBuilder<FS> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionBuilder")
            .field("mountpoint", &self.mountpoint)
            .field("options", &self.options)
            .field("max_write_size", &self.max_write_size)
            .field("help_default", &self.help_default)
            .field("panic_policy", &self.panic_policy)
            .field("observers", &self.observers.len())
            .field("capabilities", &format_args!("{:#x}", self.capabilities))
            .finish()
    }
}

impl<FS: Filesystem> SessionBuilder<FS> {
    /// Create a new session builder.
    ///
    /// Use the various methods of the returned builder to configure options of the session.
    pub fn new<P: AsRef<Path>>(filesystem: FS, mountpoint: P) -> Self {
        Self {
            filesystem,
            mountpoint: mountpoint.as_ref().to_owned(),
            options: Vec::new(),
            max_write_size: MAX_WRITE_SIZE,
            help_default: false,
            panic_policy: PanicPolicy::default(),
            observers: Vec::new(),
            capabilities: DEFAULT_CAPABILITIES,
        }
    }

    /// Add a mount option. Options are passed verbatim to the mount mechanism, e.g. `-o` and
    /// `allow_other` as two separate options.
    pub fn option<O: AsRef<OsStr>>(mut self, option: O) -> Self {
        self.options.push(option.as_ref().to_owned());
        self
    }

    /// Add multiple mount options.
    pub fn options<I, O>(mut self, options: I) -> Self
    where
        I: IntoIterator<Item = O>,
        O: AsRef<OsStr>,
    {
        self.options.extend(options.into_iter().map(|option| option.as_ref().to_owned()));
        self
    }

    /// Set max size of write requests.
    ///
    /// This determines the maximum size of write requests the kernel will send us. Larger write
    /// requests may result in higher performance (depending on your implementation), but also
    /// incur higher memory usage since a buffer of at least this size must be provided for
    /// processing requests.
    ///
    /// FUSE documents that 4k is the absolute minimum, 128k is recommended and 16M is the maximum.
    /// We're using 16M by default (which is also OSXFUSE's default, while libfuse uses 128k). It
    /// is most efficient to choose a multiple of the page size here (which is usually 4k).
    pub fn max_write_size(mut self, max_write_size: usize) -> Self {
        self.max_write_size = max_write_size;
        self
    }

    /// Append `--help` to the mount options if fewer than two options are given.
    pub fn help_default(mut self, help_default: bool) -> Self {
        self.help_default = help_default;
        self
    }

    /// Set the policy for panicking filesystem methods.
    pub fn panic_policy(mut self, policy: PanicPolicy) -> Self {
        self.panic_policy = policy;
        self
    }

    /// Add an observer that gets notified about every dispatched request.
    pub fn observer<O: Observer + 'static>(mut self, observer: O) -> Self {
        self.observers.push(Box::new(observer));
        self
    }

    /// Set the capability flags to enable if the kernel offers them.
    pub fn capabilities(mut self, capabilities: u32) -> Self {
        self.capabilities = capabilities;
        self
    }

    /// Returns the mount options to use.
    fn mount_options(&self) -> Vec<OsString> {
        let mut options = self.options.clone();
        if self.help_default && options.len() < 2 {
            options.push(OsString::from("--help"));
        }
        options
    }

    /// Mount filesystem.
    ///
    /// Use the configured builder to mount the filesystem and create a session. The returned
    /// session needs to be run by calling `Session::run` to have a functioning filesystem.
    pub fn mount(self) -> io::Result<Session<FS>> {
        Session::try_from(self)
    }

    /// Mount and run filesystem.
    ///
    /// This function doesn't return until the filesystem is unmounted.
    pub fn run(self) -> io::Result<()> {
        self.mount()?.run()
    }

    /// Mount filesystem and run it in the background. The filesystem is unmounted when the
    /// returned handle is dropped.
    pub fn spawn(self) -> io::Result<BackgroundSession>
    where
        FS: Send + 'static,
    {
        self.mount()?.spawn()
    }
}


/// Filesystem session.
///
/// A session mounts the filesystem to a mountpoint and runs it. While the session is running, it
/// receives filesystem operation requests from the FUSE kernel driver and dispatches them to the
/// filesystem implementation. The session is done running eventually when the filesystem is
/// unmounted.
#[derive(Debug)]
pub struct Session<FS: Filesystem> {
    channel: Channel,
    dispatcher: Dispatcher<FS>,
    max_write_size: usize,
    capabilities: u32,
}

impl<FS: Filesystem> TryFrom<SessionBuilder<FS>> for Session<FS> {
    type Error = io::Error;

    /// Converting from `SessionBuilder` to `Session` mounts the filesystem by creating a `Channel`.
    fn try_from(builder: SessionBuilder<FS>) -> Result<Self, Self::Error> {
        info!("Mounting {}", builder.mountpoint.display());
        let channel = Channel::mount(&builder.mountpoint, &builder.mount_options())?;
        let mut dispatcher = Dispatcher::new(builder.filesystem).panic_policy(builder.panic_policy);
        dispatcher.add_observers(builder.observers);
        Ok(Self { channel, dispatcher, max_write_size: builder.max_write_size, capabilities: builder.capabilities })
    }
}

impl<FS: Filesystem> Drop for Session<FS> {
    /// Dropping a `Session` unmounts the filesystem because the `Channel` is dropped as well.
    fn drop(&mut self) {
        info!("Unmounting {}", self.channel.mountpoint().display());
    }
}

impl<FS: Filesystem> Session<FS> {
    /// (Prepare to) mount a filesystem and create a new session.
    ///
    /// Returns a `SessionBuilder` that can be used to configure and eventually run the session.
    pub fn builder<P: AsRef<Path>>(filesystem: FS, mountpoint: P) -> SessionBuilder<FS> {
        SessionBuilder::new(filesystem, mountpoint)
    }

    /// Returns the path of the mounted filesystem.
    pub fn mountpoint(&self) -> &Path {
        self.channel.mountpoint()
    }

    /// Run the session.
    ///
    /// Runs the kernel loop on a separate thread and dispatches requests to the filesystem on the
    /// calling thread until the filesystem gets unmounted.
    pub fn run(mut self) -> io::Result<()> {
        let sender = self.channel.sender();
        serve(&mut self.dispatcher, &self.channel, sender, self.max_write_size, self.capabilities)
    }

    /// Run the session in the background. The filesystem is unmounted when the returned handle is
    /// dropped.
    pub fn spawn(self) -> io::Result<BackgroundSession>
    where
        FS: Send + 'static,
    {
        let mountpoint = self.mountpoint().to_owned();
        let guard = thread::Builder::new().name("fuse-proxy".into()).spawn(move || self.run())?;
        Ok(BackgroundSession { mountpoint, guard: Some(guard) })
    }
}


/// Serve requests read from `source` with the given dispatcher.
///
/// Reads requests on a separate kernel thread, one packet per read, and dispatches them on the
/// calling thread. Replies are sent with clones of `sender`. Returns once `source` reports the end
/// of the session (end of file or `ENODEV`) and every received request has been dispatched.
pub fn serve<FS, R, S>(dispatcher: &mut Dispatcher<FS>, source: R, sender: S, max_write_size: usize, capabilities: u32) -> io::Result<()>
where
    FS: Filesystem,
    R: Read + Send,
    S: ReplySender + Clone,
{
    let mailbox = Mailbox::new();
    let kernel = KernelLoop::new(source, sender, max_write_size, capabilities);
    // Safety: the guard is joined below before the mailbox and the source go away and it is
    // never leaked.
    let guard = unsafe { thread_scoped::scoped(|| kernel.run(&mailbox)) };
    dispatcher.run(&mailbox);
    guard.join()
}


/// Receives requests from the kernel driver, answers session level requests itself and forwards
/// everything else to the handler thread.
#[derive(Debug)]
struct KernelLoop<R, S> {
    source: R,
    sender: S,
    max_write_size: usize,
    capabilities: u32,
    initialized: bool,
    destroyed: bool,
}

impl<R: Read, S: ReplySender + Clone> KernelLoop<R, S> {
    fn new(source: R, sender: S, max_write_size: usize, capabilities: u32) -> Self {
        Self { source, sender, max_write_size, capabilities, initialized: false, destroyed: false }
    }

    /// Run the loop. The mailbox is closed when the loop ends, whatever the reason, a panic
    /// included. A panic is reported as an error.
    fn run(mut self, mailbox: &Mailbox<Envelope>) -> io::Result<()> {
        let result = panic::catch_unwind(AssertUnwindSafe(|| self.receive_all(mailbox))).unwrap_or_else(|payload| {
            Err(io::Error::new(io::ErrorKind::Other, format!("kernel thread panicked: {}", panic_message(&*payload))))
        });
        mailbox.close();
        if let Err(err) = &result {
            error!("Lost connection to the FUSE kernel driver: {}", err);
        }
        result
    }

    fn receive_all(&mut self, mailbox: &Mailbox<Envelope>) -> io::Result<()> {
        // Size of a buffer for reading one request from the kernel. Since the kernel may send up
        // to `max_write_size` bytes in a write request, we use that value plus some extra space.
        let mut buffer = vec![0; self.max_write_size + 4096];
        while let Some(len) = self.next_packet(&mut buffer)? {
            self.handle(&buffer[..len], mailbox);
        }
        Ok(())
    }

    /// Read next packet from the kernel driver
    fn next_packet(&mut self, buffer: &mut [u8]) -> io::Result<Option<usize>> {
        loop {
            match self.source.read(buffer) {
                // End of session
                Ok(0) => return Ok(None),
                // Received packet from the kernel driver, return it
                Ok(len) => return Ok(Some(len)),
                // Error while reading from the kernel driver
                Err(err) => match err.raw_os_error() {
                    // Operation interrupted. Accordingly to FUSE, this is safe to retry
                    Some(libc::ENOENT) => continue,
                    // Interrupted system call, retry
                    Some(libc::EINTR) => continue,
                    // Explicitly try again
                    Some(libc::EAGAIN) => continue,
                    // Filesystem was unmounted, quit the loop
                    Some(libc::ENODEV) => return Ok(None),
                    // Some other error occured, return it
                    _ => return Err(err),
                },
            }
        }
    }

    fn handle(&mut self, packet: &[u8], mailbox: &Mailbox<Envelope>) {
        let raw = match ll::Request::try_from(packet) {
            Ok(raw) => raw,
            Err(err) => {
                warn!("{}", err);
                // Answer if at least the header is intact, otherwise there's nobody to answer
                if let Some(header) = ArgumentIterator::new(packet).fetch::<fuse_in_header>() {
                    self.reply(Response::error(header.unique, err.errno()));
                }
                return;
            }
        };
        let unique = raw.unique();

        if raw.opcode() == Ok(fuse_opcode::FUSE_INTERRUPT) {
            debug!("{}: interrupts are not supported", raw);
            self.reply(Response::error(unique, libc::ENOSYS));
            return;
        }

        let request = match Request::try_from(&raw) {
            Ok(request) => request,
            Err(err) => {
                warn!("{}: {}", raw, err);
                self.reply(Response::error(unique, err.errno()));
                return;
            }
        };
        debug!("{}", request);

        match request.operation() {
            Operation::Init(info) if !self.initialized => {
                let info = *info;
                self.init(request, info, mailbox);
            }
            _ if !self.initialized => {
                warn!("Ignoring FUSE operation before init: {}", request);
                self.fail(&request, libc::EIO);
            }
            _ if self.destroyed => {
                warn!("Ignoring FUSE operation after destroy: {}", request);
                self.fail(&request, libc::EIO);
            }
            Operation::Init(..) => {
                error!("Repeated FUSE init: {}", request);
                self.fail(&request, libc::EIO);
            }
            Operation::Destroy => {
                self.destroyed = true;
                self.forward(request, mailbox);
                self.reply(Response::empty(unique));
            }
            _ => self.forward(request, mailbox),
        }
    }

    fn init(&mut self, request: Request, mut info: ConnectionInfo, mailbox: &Mailbox<Envelope>) {
        let unique = request.token().unique();

        // We don't support ABI versions before 7.9, older kernels send shorter read, write and
        // getattr arguments
        if info.proto_major < FUSE_KERNEL_VERSION || (info.proto_major == FUSE_KERNEL_VERSION && info.proto_minor < FUSE_MIN_KERNEL_MINOR_VERSION) {
            error!("Unsupported FUSE ABI version {}.{}", info.proto_major, info.proto_minor);
            self.reply(Response::error(unique, libc::EPROTO));
            return;
        }
        // Newer kernels downgrade to our version if told so and send init again
        if info.proto_major > FUSE_KERNEL_VERSION {
            info!("Kernel speaks FUSE ABI {}.{}, asking for {}.{}", info.proto_major, info.proto_minor, FUSE_KERNEL_VERSION, FUSE_KERNEL_MINOR_VERSION);
            let init = fuse_init_out { major: FUSE_KERNEL_VERSION, minor: FUSE_KERNEL_MINOR_VERSION, ..fuse_init_out::default() };
            self.reply(Response::with_struct(unique, &init));
            return;
        }

        info.want = info.capable & self.capabilities;
        info.async_read = info.want & FUSE_ASYNC_READ != 0;
        info.max_write = self.max_write_size as u32;
        let init = fuse_init_out {
            major: FUSE_KERNEL_VERSION,
            minor: FUSE_KERNEL_MINOR_VERSION,
            max_readahead: info.max_readahead,
            flags: info.want,
            max_write: info.max_write,
            ..fuse_init_out::default()
        };

        let request = Request::new(request.token(), *request.context(), Operation::Init(info));
        self.forward(request, mailbox);

        let payload = struct_bytes(&init);
        let len = if info.proto_minor < 23 { COMPAT_22_INIT_OUT_SIZE } else { mem::size_of::<fuse_init_out>() };
        self.reply(Response::new(unique, Ok(Cow::Borrowed(&payload[..len]))));
        debug!(
            "INIT response: ABI {}.{}, flags {:#x}, max readahead {}, max write {}",
            init.major, init.minor, init.flags, init.max_readahead, init.max_write
        );
        self.initialized = true;
    }

    fn forward(&mut self, request: Request, mailbox: &Mailbox<Envelope>) {
        if let Err(Closed(envelope)) = mailbox.send(Envelope::new(request, self.sender.clone())) {
            warn!("Handler thread gone, dropping {}", envelope.request);
            let request = envelope.request;
            self.fail(&request, libc::EIO);
        }
    }

    fn fail(&mut self, request: &Request, errno: libc::c_int) {
        if request.kind().has_reply() || request.kind() == OperationKind::Init {
            self.reply(Response::error(request.token().unique(), errno));
        }
    }

    fn reply(&mut self, response: Response<'_>) {
        if let Err(err) = self.sender.write_vectored(&response.to_io_slices()) {
            warn!("Failed to send FUSE reply: {}", err);
        }
    }
}


/// A session running in the background.
///
/// Dropping the handle unmounts the filesystem and waits for the session to end.
#[derive(Debug)]
pub struct BackgroundSession {
    mountpoint: PathBuf,
    guard: Option<thread::JoinHandle<io::Result<()>>>,
}

impl BackgroundSession {
    /// Returns the path of the mounted filesystem.
    pub fn mountpoint(&self) -> &Path {
        &self.mountpoint
    }

    /// Unmount the filesystem and wait for the session to end.
    pub fn join(mut self) -> io::Result<()> {
        self.finish()
    }

    fn finish(&mut self) -> io::Result<()> {
        let guard = match self.guard.take() {
            Some(guard) => guard,
            None => return Ok(()),
        };
        info!("Unmounting {}", self.mountpoint.display());
        // Unmounting ends the kernel loop, which ends the session. The thread is only joined if
        // unmounting succeeded, otherwise it would never terminate.
        channel::unmount(&self.mountpoint)?;
        match guard.join() {
            Ok(result) => result,
            Err(_) => Err(io::Error::new(io::ErrorKind::Other, "session thread panicked")),
        }
    }
}

impl Drop for BackgroundSession {
    fn drop(&mut self) {
        if let Err(err) = self.finish() {
            warn!("Session at {} didn't end cleanly: {}", self.mountpoint.display(), err);
        }
    }
}


/// Mount the filesystem and run it in the background.
///
/// Mount options are passed verbatim. If fewer than two options are given, `--help` is appended.
/// Every dispatched request is logged at debug level.
pub fn start<FS, P, I, O>(filesystem: FS, mountpoint: P, options: I) -> io::Result<BackgroundSession>
where
    FS: Filesystem + Send + 'static,
    P: AsRef<Path>,
    I: IntoIterator<Item = O>,
    O: AsRef<OsStr>,
{
    SessionBuilder::new(filesystem, mountpoint).options(options).help_default(true).observer(LogObserver).spawn()
}

/// Unmount a filesystem started with `start` and wait for its session to end.
pub fn stop(session: BackgroundSession) -> io::Result<()> {
    session.join()
}


#[cfg(test)]
mod test {
    use super::*;
    use crate::reply::test::{file_attr, header, RecordingSender};
    use crate::reply::{Entry, ReplyEntry};
    use crate::request::test::packet_with;
    use crate::ll::FileType;
    use crate::dispatch::Notice;
    use fuse_abi::consts::{FATTR_ATIME, FATTR_MTIME, FUSE_POSIX_LOCKS};
    use fuse_abi::{fuse_init_in, fuse_setattr_in};
    use std::collections::VecDeque;
    use std::sync::{mpsc, Arc, Mutex};
    use std::time::Duration;

    #[derive(Debug, Default)]
    struct Recorder {
        calls: Arc<Mutex<Vec<String>>>,
        info: Arc<Mutex<Option<ConnectionInfo>>>,
    }

    impl Filesystem for Recorder {
        fn init(&mut self, _req: &Request, info: &ConnectionInfo) {
            *self.info.lock().unwrap() = Some(*info);
            self.calls.lock().unwrap().push("init".into());
        }

        fn destroy(&mut self, _req: &Request) {
            self.calls.lock().unwrap().push("destroy".into());
        }

        fn lookup(&mut self, _req: &Request, parent: u64, name: &OsStr, reply: ReplyEntry) {
            self.calls.lock().unwrap().push(format!("lookup {} {:?}", parent, name));
            let entry = Entry::new(file_attr(2, FileType::Directory, 0o755, 0), 0, Duration::from_secs(1));
            reply.entry(&entry).unwrap();
        }
    }

    /// Yields one packet per read, then end of file.
    #[derive(Debug)]
    struct Packets(VecDeque<Vec<u8>>);

    impl Read for Packets {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            match self.0.pop_front() {
                Some(packet) => {
                    buf[..packet.len()].copy_from_slice(&packet);
                    Ok(packet.len())
                }
                None => Ok(0),
            }
        }
    }

    fn init_packet(unique: u64, major: u32, minor: u32, flags: u32) -> Vec<u8> {
        let arg = fuse_init_in { major, minor, max_readahead: 65536, flags };
        packet_with(fuse_opcode::FUSE_INIT, unique, 0, &arg, &[])
    }

    fn lookup_packet(unique: u64) -> Vec<u8> {
        ll::packet(fuse_opcode::FUSE_LOOKUP as u32, unique, 1, b"dir\0")
    }

    fn run(fs: Recorder, packets: Vec<Vec<u8>>) -> Vec<Vec<u8>> {
        let sender = RecordingSender::default();
        let mut dispatcher = Dispatcher::new(fs);
        serve(&mut dispatcher, Packets(packets.into()), sender.clone(), 4096, DEFAULT_CAPABILITIES).unwrap();
        sender.replies()
    }

    fn reply_to(replies: &[Vec<u8>], unique: u64) -> &[u8] {
        let mut matching = replies.iter().filter(|reply| header(reply).unique == unique);
        let reply = matching.next().unwrap_or_else(|| panic!("No reply to request {}", unique));
        assert!(matching.next().is_none(), "More than one reply to request {}", unique);
        reply
    }

    #[test]
    fn init_negotiation() {
        let fs = Recorder::default();
        let info = fs.info.clone();
        let replies = run(fs, vec![init_packet(1, 7, 26, FUSE_ASYNC_READ | FUSE_POSIX_LOCKS | FUSE_BIG_WRITES)]);
        let reply = reply_to(&replies, 1);
        assert_eq!(header(reply).error, 0);
        assert_eq!(reply.len(), 16 + 64);
        let out: fuse_init_out = ArgumentIterator::new(&reply[16..]).fetch().unwrap();
        assert_eq!((out.major, out.minor), (FUSE_KERNEL_VERSION, FUSE_KERNEL_MINOR_VERSION));
        assert_eq!(out.flags, FUSE_ASYNC_READ | FUSE_BIG_WRITES);
        assert_eq!(out.max_readahead, 65536);
        assert_eq!(out.max_write, 4096);

        let info = info.lock().unwrap().unwrap();
        assert_eq!((info.proto_major, info.proto_minor), (7, 26));
        assert_eq!(info.capable, FUSE_ASYNC_READ | FUSE_POSIX_LOCKS | FUSE_BIG_WRITES);
        assert_eq!(info.want, FUSE_ASYNC_READ | FUSE_BIG_WRITES);
        assert!(info.async_read);
        assert_eq!(info.max_write, 4096);
    }

    #[test]
    fn init_reply_for_old_kernels_is_short() {
        let replies = run(Recorder::default(), vec![init_packet(1, 7, 19, 0)]);
        assert_eq!(reply_to(&replies, 1).len(), 16 + COMPAT_22_INIT_OUT_SIZE);
    }

    #[test]
    fn init_rejects_ancient_abi() {
        let fs = Recorder::default();
        let calls = fs.calls.clone();
        let replies = run(fs, vec![init_packet(1, 7, 8, 0), lookup_packet(2)]);
        assert_eq!(header(reply_to(&replies, 1)).error, -libc::EPROTO);
        assert_eq!(header(reply_to(&replies, 2)).error, -libc::EIO);
        assert!(calls.lock().unwrap().is_empty());
    }

    #[test]
    fn init_from_newer_kernel_asks_for_our_version() {
        let fs = Recorder::default();
        let calls = fs.calls.clone();
        let replies = run(fs, vec![init_packet(1, 8, 0, 0), init_packet(2, 7, 26, 0), lookup_packet(3)]);
        let out: fuse_init_out = ArgumentIterator::new(&reply_to(&replies, 1)[16..]).fetch().unwrap();
        assert_eq!((out.major, out.minor), (FUSE_KERNEL_VERSION, FUSE_KERNEL_MINOR_VERSION));
        assert_eq!(header(reply_to(&replies, 2)).error, 0);
        assert_eq!(header(reply_to(&replies, 3)).error, 0);
        assert_eq!(*calls.lock().unwrap(), vec!["init".to_string(), "lookup 1 \"dir\"".to_string()]);
    }

    #[test]
    fn requests_before_init_and_after_destroy_fail() {
        let fs = Recorder::default();
        let calls = fs.calls.clone();
        let destroy = ll::packet(fuse_opcode::FUSE_DESTROY as u32, 4, 0, &[]);
        let replies = run(fs, vec![lookup_packet(1), init_packet(2, 7, 26, 0), lookup_packet(3), destroy, lookup_packet(5)]);
        assert_eq!(header(reply_to(&replies, 1)).error, -libc::EIO);
        assert_eq!(header(reply_to(&replies, 3)).error, 0);
        assert_eq!(reply_to(&replies, 4).len(), 16);
        assert_eq!(header(reply_to(&replies, 4)).error, 0);
        assert_eq!(header(reply_to(&replies, 5)).error, -libc::EIO);
        assert_eq!(*calls.lock().unwrap(), vec!["init".to_string(), "lookup 1 \"dir\"".to_string(), "destroy".to_string()]);
    }

    #[test]
    fn bad_requests_are_answered() {
        let interrupt = ll::packet(fuse_opcode::FUSE_INTERRUPT as u32, 3, 0, &8u64.to_ne_bytes());
        let unknown = ll::packet(4242, 4, 1, &[]);
        let truncated = ll::packet(fuse_opcode::FUSE_LOOKUP as u32, 5, 1, &[]);
        let short_header = vec![0u8; 12];
        let replies = run(Recorder::default(), vec![init_packet(1, 7, 26, 0), interrupt, unknown, truncated, short_header]);
        assert_eq!(replies.len(), 4);
        assert_eq!(header(reply_to(&replies, 3)).error, -libc::ENOSYS);
        assert_eq!(header(reply_to(&replies, 4)).error, -libc::ENOSYS);
        assert_eq!(header(reply_to(&replies, 5)).error, -libc::EIO);
    }

    #[derive(Debug)]
    struct Failing(Option<io::Error>);

    impl Read for Failing {
        fn read(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
            match self.0.take() {
                Some(err) => Err(err),
                None => Err(io::Error::from_raw_os_error(libc::ENODEV)),
            }
        }
    }

    #[test]
    fn read_errors() {
        let mut dispatcher = Dispatcher::new(Recorder::default());
        let retried = Failing(Some(io::Error::from_raw_os_error(libc::EINTR)));
        serve(&mut dispatcher, retried, RecordingSender::default(), 4096, 0).unwrap();
        let fatal = Failing(Some(io::Error::from_raw_os_error(libc::EBADF)));
        let err = serve(&mut dispatcher, fatal, RecordingSender::default(), 4096, 0).unwrap_err();
        assert_eq!(err.raw_os_error(), Some(libc::EBADF));
    }

    /// Yields the given packets, then panics.
    #[derive(Debug)]
    struct Exploding(Packets);

    impl Read for Exploding {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            match self.0.read(buf)? {
                0 => panic!("kernel connection exploded"),
                len => Ok(len),
            }
        }
    }

    #[test]
    fn kernel_thread_panic_ends_session() {
        let (tx, rx) = mpsc::channel();
        thread::spawn(move || {
            let fs = Recorder::default();
            let calls = fs.calls.clone();
            let mut dispatcher = Dispatcher::new(fs);
            let source = Exploding(Packets(vec![init_packet(1, 7, 26, 0), lookup_packet(2)].into()));
            let result = serve(&mut dispatcher, source, RecordingSender::default(), 4096, 0);
            tx.send((result.map_err(|err| err.to_string()), calls.lock().unwrap().len())).unwrap();
        });
        let (result, calls) = rx.recv_timeout(Duration::from_secs(10)).expect("session did not end");
        assert_eq!(result, Err("kernel thread panicked: kernel connection exploded".to_string()));
        // Requests received before the panic were still dispatched
        assert_eq!(calls, 2);
    }

    #[test]
    fn setattr_with_time_out_of_range_fails() {
        let fs = Recorder::default();
        let calls = fs.calls.clone();
        let arg = fuse_setattr_in { valid: FATTR_MTIME, mtime: i64::MAX, mtimensec: u32::MAX, ..Default::default() };
        let setattr = packet_with(fuse_opcode::FUSE_SETATTR, 2, 5, &arg, &[]);
        let arg = fuse_setattr_in { valid: FATTR_ATIME, atime: i64::MIN, ..Default::default() };
        let setattr_min = packet_with(fuse_opcode::FUSE_SETATTR, 3, 5, &arg, &[]);
        let replies = run(fs, vec![init_packet(1, 7, 26, 0), setattr, setattr_min, lookup_packet(4)]);
        assert_eq!(header(reply_to(&replies, 2)).error, -libc::EINVAL);
        // Representable, handled by the filesystem
        assert_eq!(header(reply_to(&replies, 3)).error, -libc::ENOSYS);
        assert_eq!(header(reply_to(&replies, 4)).error, 0);
        assert_eq!(calls.lock().unwrap().len(), 2);
    }

    #[derive(Debug)]
    struct PanickingObserver;

    impl Observer for PanickingObserver {
        fn notice(&mut self, _notice: &Notice<'_>) {
            panic!("observer failure");
        }
    }

    #[test]
    fn panicking_observer_keeps_session_running() {
        let sender = RecordingSender::default();
        let mut dispatcher = Dispatcher::new(Recorder::default()).observer(PanickingObserver).panic_policy(PanicPolicy::Reply(libc::EIO));
        let packets = vec![init_packet(1, 7, 26, 0), lookup_packet(2), lookup_packet(3)];
        serve(&mut dispatcher, Packets(packets.into()), sender.clone(), 4096, 0).unwrap();
        let replies = sender.replies();
        assert_eq!(header(reply_to(&replies, 2)).error, 0);
        assert_eq!(header(reply_to(&replies, 3)).error, 0);
    }

    #[test]
    fn help_default() {
        let builder = SessionBuilder::new(Recorder::default(), "/mnt").option("-d");
        assert_eq!(builder.mount_options(), vec![OsString::from("-d")]);
        let builder = builder.help_default(true);
        assert_eq!(builder.mount_options(), vec![OsString::from("-d"), OsString::from("--help")]);
        let builder = builder.options(&["-o", "ro"]);
        assert_eq!(builder.mount_options().len(), 3);
        assert!(!builder.mount_options().contains(&OsString::from("--help")));
    }
}
