//! Low-level filesystem attributes.

use std::convert::TryFrom;
use std::os::unix::fs::{FileTypeExt, MetadataExt};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use std::{error, fmt, fs};

use fuse_abi::fuse_attr;
use libc::{S_IFBLK, S_IFCHR, S_IFDIR, S_IFIFO, S_IFLNK, S_IFMT, S_IFREG, S_IFSOCK};


/// Error type returned when a `FileAttr` conversion fails.
#[derive(Debug)]
pub struct FileAttrTryFromError;

impl fmt::Display for FileAttrTryFromError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Could not convert invalid file attributes")
    }
}

impl error::Error for FileAttrTryFromError {}


/// File attributes.
///
/// Holds metadata required to represent a file in a filesystem. Besides the
/// inode number, which uniquely identifies a file, attributes contain more
/// useful metadata like file size, ownership information and permissions that
/// users and query and act upon.
///
/// This is the filesystem side representation of file metadata (`struct stat`).
/// On the user side, Rust abstracts this information in `std::fs::Metadata`.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct FileAttr {
    /// Inode number.
    pub ino: u64,
    /// Size in bytes.
    pub size: u64,
    /// Size in blocks.
    pub blocks: u64,
    /// Time of last access.
    pub atime: SystemTime,
    /// Time of last modification.
    pub mtime: SystemTime,
    /// Time of last change.
    pub ctime: SystemTime,
    /// macOS only: Time of creation.
    #[cfg(target_os = "macos")]
    pub crtime: SystemTime,
    /// Type of the file (e.g. regular file, directory, pipe, etc).
    pub kind: FileType,
    /// File permissions.
    pub perm: u16,
    /// Number of hard links.
    pub nlink: u32,
    /// User id of file owner.
    pub uid: u32,
    /// Group id of file owner.
    pub gid: u32,
    /// Rdev.
    pub rdev: u32,
    /// Preferred block size for I/O, 0 lets the kernel choose.
    pub blksize: u32,
    /// macOS only: Flags (see chflags(2)).
    #[cfg(target_os = "macos")]
    pub flags: u32,
}

impl FileAttr {
    /// Returns the combined file type and permission bits (`st_mode`).
    pub fn mode(&self) -> u32 {
        self.kind.mode_bits() | u32::from(self.perm)
    }
}

impl TryFrom<fs::Metadata> for FileAttr {
    type Error = FileAttrTryFromError;

    fn try_from(md: fs::Metadata) -> Result<Self, Self::Error> {
        let kind = FileType::try_from(md.file_type()).map_err(|_| FileAttrTryFromError)?;
        Ok(FileAttr {
            ino: md.ino(),
            size: md.size(),
            blocks: md.blocks(),
            atime: system_time(md.atime(), md.atime_nsec()).ok_or(FileAttrTryFromError)?,
            mtime: system_time(md.mtime(), md.mtime_nsec()).ok_or(FileAttrTryFromError)?,
            ctime: system_time(md.ctime(), md.ctime_nsec()).ok_or(FileAttrTryFromError)?,
            #[cfg(target_os = "macos")]
            crtime: md.created().unwrap_or(UNIX_EPOCH),
            kind,
            perm: (md.mode() & 0o7777) as u16,
            nlink: md.nlink() as u32,
            uid: md.uid(),
            gid: md.gid(),
            rdev: md.rdev() as u32,
            blksize: md.blksize() as u32,
            #[cfg(target_os = "macos")]
            flags: 0,
        })
    }
}

impl From<&FileAttr> for fuse_attr {
    fn from(attr: &FileAttr) -> Self {
        let (atime, atimensec) = unix_time(&attr.atime);
        let (mtime, mtimensec) = unix_time(&attr.mtime);
        let (ctime, ctimensec) = unix_time(&attr.ctime);
        #[cfg(target_os = "macos")]
        let (crtime, crtimensec) = unix_time(&attr.crtime);
        fuse_attr {
            ino: attr.ino,
            size: attr.size,
            blocks: attr.blocks,
            atime,
            mtime,
            ctime,
            #[cfg(target_os = "macos")]
            crtime,
            atimensec,
            mtimensec,
            ctimensec,
            #[cfg(target_os = "macos")]
            crtimensec,
            mode: attr.mode(),
            nlink: attr.nlink,
            uid: attr.uid,
            gid: attr.gid,
            rdev: attr.rdev,
            #[cfg(target_os = "macos")]
            flags: attr.flags,
            blksize: attr.blksize,
            padding: 0,
        }
    }
}


/// Splits a `SystemTime` into seconds and nanoseconds since the epoch, the way the kernel
/// represents timestamps. Times before the epoch yield negative seconds with a positive
/// nanosecond part.
pub(crate) fn unix_time(time: &SystemTime) -> (i64, u32) {
    match time.duration_since(UNIX_EPOCH) {
        Ok(d) => (d.as_secs() as i64, d.subsec_nanos()),
        Err(err) => {
            let d = err.duration();
            match d.subsec_nanos() {
                0 => (-(d.as_secs() as i64), 0),
                nanos => (-(d.as_secs() as i64) - 1, 1_000_000_000 - nanos),
            }
        }
    }
}

/// Inverse of `unix_time`. Returns `None` for times `SystemTime` can't represent.
pub(crate) fn system_time(secs: i64, nsecs: i64) -> Option<SystemTime> {
    let time = if secs >= 0 {
        UNIX_EPOCH.checked_add(Duration::from_secs(secs as u64))
    } else {
        UNIX_EPOCH.checked_sub(Duration::from_secs(secs.unsigned_abs()))
    };
    time?.checked_add(Duration::from_nanos(nsecs.max(0) as u64))
}


/// Error type returned when a `FileType` conversion fails.
#[derive(Debug)]
pub struct FileTypeTryFromError;

impl fmt::Display for FileTypeTryFromError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Could not convert unknown file type")
    }
}

impl error::Error for FileTypeTryFromError {}


/// File type.
///
/// Determines the type of a file (e.g. wether it's a regular file or a
/// symlink).
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum FileType {
    /// Named pipe (FIFO), `S_IFIFO`.
    NamedPipe,
    /// Character device, `S_IFCHR`.
    CharDevice,
    /// Directory, `S_IFDIR`.
    Directory,
    /// Block device, `S_IFBLK`.
    BlockDevice,
    /// Regular file, `S_IFREG`.
    RegularFile,
    /// Symbolic link, `S_IFLNK`.
    Symlink,
    /// Unix domain socket, `S_IFSOCK`.
    Socket,
}

// Some platforms like Linux x86_64 have mode_t = u32, and lint warns of a trivial_numeric_casts.
// But others like macOS x86_64 have mode_t = u16, requiring a typecast.  So, just silence lint.
#[allow(trivial_numeric_casts)]
impl FileType {
    /// Returns the `S_IF*` bits of this file type.
    pub fn mode_bits(self) -> u32 {
        (match self {
            FileType::NamedPipe => S_IFIFO,
            FileType::CharDevice => S_IFCHR,
            FileType::BlockDevice => S_IFBLK,
            FileType::Directory => S_IFDIR,
            FileType::RegularFile => S_IFREG,
            FileType::Symlink => S_IFLNK,
            FileType::Socket => S_IFSOCK,
        }) as u32
    }

    /// Extracts the file type from a full `st_mode` value.
    pub fn from_mode(mode: u32) -> Result<Self, FileTypeTryFromError> {
        match mode & S_IFMT as u32 {
            m if m == S_IFIFO as u32 => Ok(FileType::NamedPipe),
            m if m == S_IFCHR as u32 => Ok(FileType::CharDevice),
            m if m == S_IFBLK as u32 => Ok(FileType::BlockDevice),
            m if m == S_IFDIR as u32 => Ok(FileType::Directory),
            m if m == S_IFREG as u32 => Ok(FileType::RegularFile),
            m if m == S_IFLNK as u32 => Ok(FileType::Symlink),
            m if m == S_IFSOCK as u32 => Ok(FileType::Socket),
            _ => Err(FileTypeTryFromError),
        }
    }
}

impl TryFrom<fs::FileType> for FileType {
    type Error = FileTypeTryFromError;

    fn try_from(ft: fs::FileType) -> Result<Self, Self::Error> {
        if ft.is_fifo() {
            Ok(FileType::NamedPipe)
        } else if ft.is_char_device() {
            Ok(FileType::CharDevice)
        } else if ft.is_dir() {
            Ok(FileType::Directory)
        } else if ft.is_block_device() {
            Ok(FileType::BlockDevice)
        } else if ft.is_file() {
            Ok(FileType::RegularFile)
        } else if ft.is_symlink() {
            Ok(FileType::Symlink)
        } else if ft.is_socket() {
            Ok(FileType::Socket)
        } else {
            Err(FileTypeTryFromError)
        }
    }
}


#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn mode_roundtrip() {
        assert_eq!(FileType::RegularFile.mode_bits() | 0o644, 0o100644);
        assert_eq!(FileType::from_mode(0o040755).unwrap(), FileType::Directory);
        assert_eq!(FileType::from_mode(0o120777).unwrap(), FileType::Symlink);
        assert!(FileType::from_mode(0o777).is_err());
    }

    #[test]
    fn unix_time_before_epoch() {
        let t = UNIX_EPOCH - Duration::new(1, 250_000_000);
        assert_eq!(unix_time(&t), (-2, 750_000_000));
        assert_eq!(system_time(-2, 750_000_000), Some(t));
        assert_eq!(unix_time(&(UNIX_EPOCH + Duration::new(5, 7))), (5, 7));
    }

    #[test]
    fn system_time_extremes() {
        assert!(system_time(i64::MIN, 0).is_some());
        assert!(system_time(i64::MAX, 999_999_999).is_some());
        assert_eq!(system_time(i64::MAX, 1_000_000_000), None);
        assert_eq!(system_time(-1, 0), Some(UNIX_EPOCH - Duration::from_secs(1)));
        assert_eq!(system_time(0, -5), Some(UNIX_EPOCH));
    }

    #[test]
    fn metadata_conversion() {
        let md = fs::metadata(env!("CARGO_MANIFEST_DIR")).unwrap();
        let attr = FileAttr::try_from(md).unwrap();
        assert_eq!(attr.kind, FileType::Directory);
        assert_eq!(attr.mode() & S_IFMT as u32, S_IFDIR as u32);
    }
}
