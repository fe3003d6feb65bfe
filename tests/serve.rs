//! Drives a session with raw kernel packets and checks the replies the kernel driver would get.

use std::collections::VecDeque;
use std::ffi::OsStr;
use std::io::{self, Read, Write};
use std::sync::{mpsc, Arc, Mutex};
use std::time::{Duration, UNIX_EPOCH};
use std::{mem, ptr, slice, thread};

use fuse_abi::consts::FUSE_ASYNC_READ;
use fuse_abi::{fuse_entry_out, fuse_in_header, fuse_init_in, fuse_opcode, fuse_open_in, fuse_out_header, fuse_read_in};
use fuse_proxy::{serve, Dispatcher, Entry, FileAttr, FileHandle, FileType, Filesystem, Notice, Observer, Open, Outcome};
use fuse_proxy::{ReplyAttr, ReplyData, ReplyDirectory, ReplyEntry, ReplyOpen, Request, DEFAULT_CAPABILITIES};

const HELLO_INO: u64 = 2;
const HELLO_TXT: &[u8] = b"Hello World!\n";


fn attr(ino: u64, kind: FileType, perm: u16, size: u64) -> FileAttr {
    FileAttr {
        ino,
        size,
        blocks: 1,
        atime: UNIX_EPOCH,
        mtime: UNIX_EPOCH,
        ctime: UNIX_EPOCH,
        #[cfg(target_os = "macos")]
        crtime: UNIX_EPOCH,
        kind,
        perm,
        nlink: 1,
        uid: 501,
        gid: 20,
        rdev: 0,
        blksize: 0,
        #[cfg(target_os = "macos")]
        flags: 0,
    }
}

/// Read only filesystem with a single file, replying to reads from a worker thread.
#[derive(Debug)]
struct HelloFs {
    worker: mpsc::Sender<(ReplyData, i64, u32)>,
}

impl Filesystem for HelloFs {
    fn lookup(&mut self, _req: &Request, parent: u64, name: &OsStr, reply: ReplyEntry) {
        if parent == 1 && name == "hello.txt" {
            let entry = Entry::new(attr(HELLO_INO, FileType::RegularFile, 0o644, HELLO_TXT.len() as u64), 0, Duration::from_secs(1));
            let _ = reply.entry(&entry);
        } else {
            let _ = reply.error(libc::ENOENT);
        }
    }

    fn getattr(&mut self, _req: &Request, ino: u64, _fh: Option<&FileHandle>, reply: ReplyAttr) {
        match ino {
            1 => {
                let _ = reply.attr(&Duration::from_secs(1), &attr(1, FileType::Directory, 0o755, 0));
            }
            // Never replied, the request is left hanging
            _ => (),
        }
    }

    fn open(&mut self, _req: &Request, ino: u64, fh: &FileHandle, reply: ReplyOpen) {
        if ino == HELLO_INO && fh.flags() & libc::O_ACCMODE as u32 == libc::O_RDONLY as u32 {
            let _ = reply.opened(&Open { keep_cache: true, ..Open::new(7) });
        } else {
            let _ = reply.error(libc::EACCES);
        }
    }

    fn read(&mut self, _req: &Request, _ino: u64, fh: &FileHandle, offset: i64, size: u32, reply: ReplyData) {
        assert_eq!(fh.fh(), 7);
        self.worker.send((reply, offset, size)).unwrap();
    }

    fn readdir(&mut self, _req: &Request, _ino: u64, _fh: &FileHandle, offset: i64, mut reply: ReplyDirectory) {
        let entries = [(1, FileType::Directory, "."), (1, FileType::Directory, ".."), (HELLO_INO, FileType::RegularFile, "hello.txt")];
        for (i, (ino, kind, name)) in entries.iter().enumerate().skip(offset as usize) {
            if reply.add(*ino, (i + 1) as i64, *kind, name) {
                break;
            }
        }
        let _ = reply.ok();
    }
}

/// Records the name and outcome of every dispatched request.
#[derive(Clone, Debug, Default)]
struct Notices(Arc<Mutex<Vec<(&'static str, Option<Outcome>)>>>);

impl Observer for Notices {
    fn notice(&mut self, notice: &Notice<'_>) {
        self.0.lock().unwrap().push((notice.name, notice.outcome.clone()));
    }
}

/// Kernel side of the session: yields one packet per read, then end of file.
#[derive(Debug)]
struct Kernel(VecDeque<Vec<u8>>);

impl Read for Kernel {
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

#[derive(Clone, Debug, Default)]
struct Replies(Arc<Mutex<Vec<Vec<u8>>>>);

impl Write for Replies {
    fn write(&mut self, _buf: &[u8]) -> io::Result<usize> {
        panic!("replies must be sent with a single vectored write");
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }

    fn write_vectored(&mut self, bufs: &[io::IoSlice<'_>]) -> io::Result<usize> {
        let reply: Vec<u8> = bufs.iter().flat_map(|buf| buf.iter()).copied().collect();
        let len = reply.len();
        self.0.lock().unwrap().push(reply);
        Ok(len)
    }
}

impl Replies {
    fn to(&self, unique: u64) -> Option<Vec<u8>> {
        let replies = self.0.lock().unwrap();
        let mut matching = replies.iter().filter(|reply| header(reply).unique == unique);
        let reply = matching.next().cloned();
        assert!(matching.next().is_none(), "more than one reply to request {}", unique);
        reply
    }
}


fn bytes<T: Copy>(value: &T) -> &[u8] {
    unsafe { slice::from_raw_parts(value as *const T as *const u8, mem::size_of::<T>()) }
}

fn from_bytes<T: Copy>(data: &[u8]) -> T {
    assert!(data.len() >= mem::size_of::<T>());
    unsafe { ptr::read_unaligned(data.as_ptr() as *const T) }
}

fn header(reply: &[u8]) -> fuse_out_header {
    from_bytes(reply)
}

fn packet(opcode: fuse_opcode, unique: u64, nodeid: u64, args: &[u8]) -> Vec<u8> {
    let header = fuse_in_header {
        len: (mem::size_of::<fuse_in_header>() + args.len()) as u32,
        opcode: opcode as u32,
        unique,
        nodeid,
        uid: 501,
        gid: 20,
        pid: 4711,
        padding: 0,
    };
    let mut data = bytes(&header).to_vec();
    data.extend_from_slice(args);
    data
}

fn init(unique: u64) -> Vec<u8> {
    packet(fuse_opcode::FUSE_INIT, unique, 0, bytes(&fuse_init_in { major: 7, minor: 26, max_readahead: 131072, flags: FUSE_ASYNC_READ }))
}

fn read_in(fh: u64, offset: u64, size: u32) -> fuse_read_in {
    fuse_read_in { fh, offset, size, ..fuse_read_in::default() }
}


#[test]
fn hello_session() {
    let _ = env_logger::try_init();

    let (worker_tx, worker_rx) = mpsc::channel::<(ReplyData, i64, u32)>();
    let worker = thread::spawn(move || {
        for (reply, offset, size) in worker_rx {
            let start = (offset as usize).min(HELLO_TXT.len());
            let end = (start + size as usize).min(HELLO_TXT.len());
            reply.data(&HELLO_TXT[start..end]).unwrap();
        }
    });

    let kernel = Kernel(
        vec![
            packet(fuse_opcode::FUSE_GETATTR, 1, 1, &[]),
            init(2),
            packet(fuse_opcode::FUSE_LOOKUP, 3, 1, b"hello.txt\0"),
            packet(fuse_opcode::FUSE_LOOKUP, 4, 1, b"missing\0"),
            packet(fuse_opcode::FUSE_GETATTR, 5, 1, &[]),
            packet(fuse_opcode::FUSE_OPEN, 6, HELLO_INO, bytes(&fuse_open_in { flags: libc::O_RDONLY as u32, unused: 0 })),
            packet(fuse_opcode::FUSE_READ, 7, HELLO_INO, bytes(&read_in(7, 0, 4096))),
            packet(fuse_opcode::FUSE_READ, 8, HELLO_INO, bytes(&read_in(7, 6, 5))),
            packet(fuse_opcode::FUSE_READDIR, 9, 1, bytes(&read_in(0, 0, 4096))),
            packet(fuse_opcode::FUSE_GETATTR, 10, HELLO_INO, &[]),
            packet(fuse_opcode::FUSE_STATFS, 11, 1, &[]),
            packet(fuse_opcode::FUSE_DESTROY, 12, 0, &[]),
        ]
        .into(),
    );
    let replies = Replies::default();
    let notices = Notices::default();
    let mut dispatcher = Dispatcher::new(HelloFs { worker: worker_tx }).observer(notices.clone());
    serve(&mut dispatcher, kernel, replies.clone(), 64 * 1024, DEFAULT_CAPABILITIES).unwrap();
    // Ends the worker once the last reply got sent
    drop(dispatcher);
    worker.join().unwrap();

    // Before init
    assert_eq!(header(&replies.to(1).unwrap()).error, -libc::EIO);
    // Init
    let reply = replies.to(2).unwrap();
    assert_eq!(header(&reply).error, 0);
    assert_eq!(reply.len(), mem::size_of::<fuse_out_header>() + 64);
    // Lookup
    let reply = replies.to(3).unwrap();
    assert_eq!(header(&reply).error, 0);
    let entry: fuse_entry_out = from_bytes(&reply[16..]);
    assert_eq!(entry.nodeid, HELLO_INO);
    assert_eq!(entry.attr.size, HELLO_TXT.len() as u64);
    assert_eq!(entry.attr.mode, libc::S_IFREG as u32 | 0o644);
    assert_eq!(header(&replies.to(4).unwrap()).error, -libc::ENOENT);
    // Getattr of the root
    assert_eq!(header(&replies.to(5).unwrap()).error, 0);
    // Open
    let reply = replies.to(6).unwrap();
    assert_eq!(header(&reply).error, 0);
    assert_eq!(from_bytes::<u64>(&reply[16..]), 7);
    // Reads are answered from the worker with exactly the bytes read
    assert_eq!(&replies.to(7).unwrap()[16..], HELLO_TXT);
    assert_eq!(&replies.to(8).unwrap()[16..], b"World");
    // Readdir with three entries
    let reply = replies.to(9).unwrap();
    assert_eq!(header(&reply).error, 0);
    // Entries are padded to 8 bytes: 24 byte header plus name
    assert_eq!(reply.len(), 16 + 32 + 32 + 40);
    // Getattr of the file is never answered
    assert_eq!(replies.to(10), None);
    // Unimplemented
    assert_eq!(header(&replies.to(11).unwrap()).error, -libc::ENOSYS);
    // Destroy
    assert_eq!(replies.to(12).unwrap().len(), 16);

    let notices = notices.0.lock().unwrap();
    let names: Vec<&str> = notices.iter().map(|(name, _)| *name).collect();
    assert_eq!(
        names,
        vec!["init", "lookup", "lookup", "getattr", "open", "read", "read", "readdir", "getattr", "statfs", "destroy"]
    );
    assert_eq!(notices[2].1, Some(Outcome::Error(libc::ENOENT)));
    assert_eq!(notices[8].1, None);
    assert_eq!(notices[9].1, Some(Outcome::Error(libc::ENOSYS)));
}
