//! FUSE kernel driver communication.
//!
//! Raw communication channel to the FUSE kernel driver. The channel owns the device file
//! descriptor and is read by the kernel thread only. Replies go out through `ChannelSender`, a
//! shared handle on the same descriptor that reply handles may carry to any thread. Once the
//! channel is dropped, senders fail with `EBADF`.

use std::ffi::{CStr, CString, OsStr, OsString};
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::io::{AsRawFd, RawFd};
use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock};

use log::debug;


macro_rules! try_io {
    ($x:expr) => {
        match $x {
            rc if rc < 0 => return Err(io::Error::last_os_error()),
            rc => rc,
        }
    };
}


/// Device file descriptor shared by a channel and its senders.
#[derive(Debug)]
struct Device {
    fd: RwLock<RawFd>,
}

impl Device {
    fn new(fd: RawFd) -> Self {
        Self { fd: RwLock::new(fd) }
    }

    fn write_vectored(&self, bufs: &[io::IoSlice<'_>]) -> io::Result<usize> {
        // Holding the lock while writing keeps the descriptor from being closed (and reused)
        let fd = self.fd.read().unwrap_or_else(PoisonError::into_inner);
        if *fd < 0 {
            return Err(io::Error::from_raw_os_error(libc::EBADF));
        }
        Ok(try_io!(unsafe { libc::writev(*fd, bufs.as_ptr() as *const libc::iovec, bufs.len() as libc::c_int) }) as usize)
    }

    fn close(&self) {
        let mut fd = self.fd.write().unwrap_or_else(PoisonError::into_inner);
        if *fd >= 0 {
            unsafe {
                libc::close(*fd);
            }
            *fd = -1;
        }
    }
}


/// A raw communication channel to the FUSE kernel driver
#[derive(Debug)]
pub struct Channel {
    fd: RawFd,
    device: Arc<Device>,
    mountpoint: PathBuf,
}

impl AsRawFd for Channel {
    fn as_raw_fd(&self) -> RawFd {
        self.fd
    }
}

impl io::Read for Channel {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        Ok(try_io!(unsafe { libc::read(self.fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len() as libc::size_t) }) as usize)
    }
}

impl io::Read for &Channel {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        Ok(try_io!(unsafe { libc::read(self.fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len() as libc::size_t) }) as usize)
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        // Close the file descriptor first to prevent further operations coming in (e.g. if the
        // filesystem is still mounted at this point, the following call to unmount would block
        // indefinitely since its sync operation requests couldn't be dispatched anymore).
        // Senders still around fail from now on.
        self.device.close();

        if let Err(err) = self.unmount() {
            debug!("Unmounting {} on channel drop: {}", self.mountpoint.display(), err);
        }
    }
}

impl Channel {
    /// Create a new communication channel to the kernel driver using the given file descriptor
    /// obtained by calling fusermount or any other FUSE mount mechanism. When the channel is
    /// dropped, the file descriptor will be closed and the path unmounted.
    pub fn new(fd: RawFd, mountpoint: PathBuf) -> Self {
        Self { fd, device: Arc::new(Device::new(fd)), mountpoint }
    }

    /// Create a new communication channel to the kernel driver by mounting the given path with
    /// the given mount options. When the channel is dropped, the path will be unmounted.
    pub fn mount(mountpoint: &Path, options: &[OsString]) -> io::Result<Channel> {
        let mountpoint = mountpoint.canonicalize()?;

        // Options are passed to libfuse as an argument vector, the program name first
        let args = [OsStr::new("fuse-proxy")]
            .iter()
            .copied()
            .chain(options.iter().map(OsString::as_os_str))
            .map(cstring)
            .collect::<io::Result<Vec<CString>>>()?;
        let path = cstring(mountpoint.as_os_str())?;

        let fd = mount(&path, &args)?;
        if fd == 0 {
            // libfuse only printed its usage (e.g. for `--help`), nothing got mounted
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "no filesystem mounted, mount options only requested help"));
        }
        Ok(Channel::new(fd, mountpoint))
    }

    /// Returns the path of the mounted filesystem.
    pub fn mountpoint(&self) -> &Path {
        &self.mountpoint
    }

    /// Returns a sender for replies to requests received through this channel.
    pub fn sender(&self) -> ChannelSender {
        ChannelSender { device: self.device.clone() }
    }

    /// Unmount this channel's mountpoint.
    /// The kernel will typically request to sync the filesystem one last time and shuts down the
    /// FUSE kernel driver instance afterwards, which results in the final `destroy` operation
    /// being sent to the channel.
    pub fn unmount(&self) -> io::Result<()> {
        unmount(&self.mountpoint)
    }
}


/// Sends replies to the FUSE kernel driver.
///
/// The kernel driver accepts a reply as one single write, so replies must be sent with
/// `write_vectored`. Sending after the channel was dropped fails with `EBADF`.
#[derive(Clone, Debug)]
pub struct ChannelSender {
    device: Arc<Device>,
}

impl io::Write for ChannelSender {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.device.write_vectored(&[io::IoSlice::new(buf)])
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }

    fn write_vectored(&mut self, bufs: &[io::IoSlice<'_>]) -> io::Result<usize> {
        self.device.write_vectored(bufs)
    }
}


fn cstring(s: &OsStr) -> io::Result<CString> {
    CString::new(s.as_bytes()).map_err(|err| io::Error::new(io::ErrorKind::InvalidInput, err))
}

#[cfg(feature = "libfuse")]
fn mount(path: &CStr, args: &[CString]) -> io::Result<RawFd> {
    use fuse_sys::{fuse_args, fuse_mount_compat25};

    let argptrs: Vec<_> = args.iter().map(|s| s.as_ptr()).collect();
    let fuse_args = fuse_args { argc: argptrs.len() as i32, argv: argptrs.as_ptr(), allocated: 0 };
    Ok(try_io!(unsafe { fuse_mount_compat25(path.as_ptr(), &fuse_args) }))
}

#[cfg(not(feature = "libfuse"))]
fn mount(path: &CStr, _args: &[CString]) -> io::Result<RawFd> {
    log::warn!("Can't mount {:?}, built without libfuse", path);
    Err(io::Error::new(io::ErrorKind::Unsupported, "mounting is unsupported, enable the `libfuse` feature"))
}


/// Unmount an arbitrary mount point
pub fn unmount(mountpoint: &Path) -> io::Result<()> {
    // `fuse_unmount_compat22` doesn't return a status and calls `realpath`, which in turn calls
    // into the filesystem. Unmount directly instead, the path is already canonical.

    #[cfg(any(
        target_os = "macos",
        target_os = "freebsd",
        target_os = "dragonfly",
        target_os = "openbsd",
        target_os = "netbsd"
    ))]
    #[inline]
    fn unmount(path: &CStr) -> libc::c_int {
        unsafe { libc::unmount(path.as_ptr(), 0) }
    }

    // On Linux, try calling `libc::umount` but fall back to libfuse in case of permission
    // errors.
    #[cfg(not(any(
        target_os = "macos",
        target_os = "freebsd",
        target_os = "dragonfly",
        target_os = "openbsd",
        target_os = "netbsd"
    )))]
    #[inline]
    fn unmount(path: &CStr) -> libc::c_int {
        let rc = unsafe { libc::umount(path.as_ptr()) };
        if rc < 0 && io::Error::last_os_error().kind() == io::ErrorKind::PermissionDenied {
            // Linux always returns EPERM for non-root users. We have to let the
            // library go through the setuid-root "fusermount -u" to unmount.
            #[cfg(feature = "libfuse")]
            {
                unsafe { fuse_sys::fuse_unmount_compat22(path.as_ptr()) };
                return 0;
            }
        }
        rc
    }

    let path = cstring(mountpoint.as_os_str())?;
    try_io!(unmount(&path));
    Ok(())
}


#[cfg(test)]
mod test {
    use super::*;
    use std::io::{Read, Write};

    fn pipe() -> (RawFd, RawFd) {
        let mut fds = [0; 2];
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
        (fds[0], fds[1])
    }

    fn channel(fd: RawFd) -> Channel {
        Channel::new(fd, PathBuf::from("/nonexistent/fuse-proxy-test"))
    }

    #[test]
    fn sender_writes_reply_at_once() {
        let (rd, wr) = pipe();
        let writer = channel(wr);
        let mut sender = writer.sender();
        let bufs = [io::IoSlice::new(b"head"), io::IoSlice::new(b"er"), io::IoSlice::new(b"payload")];
        assert_eq!(sender.write_vectored(&bufs).unwrap(), 13);
        drop(writer);

        let mut reader = channel(rd);
        let mut buf = [0; 32];
        assert_eq!(reader.read(&mut buf).unwrap(), 13);
        assert_eq!(&buf[..13], b"headerpayload");
        // Write end closed
        assert_eq!(reader.read(&mut buf).unwrap(), 0);
    }

    #[test]
    fn sender_outliving_channel_fails() {
        let (rd, wr) = pipe();
        let reader = channel(rd);
        let writer = channel(wr);
        let mut sender = writer.sender();
        drop(writer);

        // The descriptor number may get reused, the sender must not write to it
        let (rd2, wr2) = pipe();
        let err = sender.write_vectored(&[io::IoSlice::new(b"late")]).unwrap_err();
        assert_eq!(err.raw_os_error(), Some(libc::EBADF));
        assert_eq!(sender.write(b"late").unwrap_err().raw_os_error(), Some(libc::EBADF));
        drop((reader, channel(rd2), channel(wr2)));
    }

    #[test]
    fn sender_reports_errors() {
        let mut sender = ChannelSender { device: Arc::new(Device::new(-1)) };
        let err = sender.write_vectored(&[io::IoSlice::new(b"x")]).unwrap_err();
        assert_eq!(err.raw_os_error(), Some(libc::EBADF));
    }

    #[test]
    fn option_with_nul_is_rejected() {
        let err = cstring(OsStr::new("allow\0other")).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }

    #[cfg(not(feature = "libfuse"))]
    #[test]
    fn mount_without_libfuse_fails() {
        let err = Channel::mount(Path::new("/"), &[]).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::Unsupported);
    }
}
