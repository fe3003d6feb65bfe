//! Low-level kernel requests.
//!
//! A request is a single packet read from the FUSE kernel driver. It consists of a fixed header
//! (`fuse_in_header`) followed by opcode-specific arguments. This module only frames a packet and
//! gives access to its header and argument bytes; decoding arguments into typed operations is up
//! to `crate::request`.

use std::convert::TryFrom;
use std::{error, fmt, mem};

use fuse_abi::{fuse_in_header, fuse_opcode};
use libc::c_int;

use super::argument::ArgumentIterator;


/// Error that may occur while reading and parsing a request from the kernel driver.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum RequestError {
    /// Not enough data for parsing header (short read).
    ShortReadHeader(usize),
    /// Kernel requested an unknown operation.
    UnknownOperation(u32),
    /// Not enough data for arguments (short read).
    ShortRead(usize, usize),
    /// Insufficient argument data.
    InsufficientData,
    /// Argument value out of range (e.g. a time not representable as `SystemTime`).
    InvalidArgument,
}

impl fmt::Display for RequestError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestError::ShortReadHeader(len) => write!(f, "Short read of FUSE request header ({} < {})", len, mem::size_of::<fuse_in_header>()),
            RequestError::UnknownOperation(opcode) => write!(f, "Unknown FUSE opcode ({})", opcode),
            RequestError::ShortRead(len, total) => write!(f, "Short read of FUSE request ({} < {})", len, total),
            RequestError::InsufficientData => write!(f, "Insufficient argument data"),
            RequestError::InvalidArgument => write!(f, "Argument value out of range"),
        }
    }
}

impl error::Error for RequestError {}

impl RequestError {
    /// Error code to answer a request with that failed to parse.
    pub fn errno(&self) -> c_int {
        match self {
            RequestError::UnknownOperation(_) => libc::ENOSYS,
            RequestError::InvalidArgument => libc::EINVAL,
            _ => libc::EIO,
        }
    }
}


/// Low-level request of a filesystem operation the kernel driver wants to perform.
#[derive(Debug)]
pub struct Request<'a> {
    header: fuse_in_header,
    data: &'a [u8],
}

impl<'a> TryFrom<&'a [u8]> for Request<'a> {
    type Error = RequestError;

    fn try_from(data: &'a [u8]) -> Result<Self, Self::Error> {
        // Parse a raw packet as sent by the kernel driver into typed data. Every request always
        // begins with a `fuse_in_header` struct followed by arguments depending on the opcode.
        let data_len = data.len();
        let mut it = ArgumentIterator::new(data);
        // Parse header
        let header: fuse_in_header = it.fetch().ok_or(RequestError::ShortReadHeader(data_len))?;
        // Check data size
        if data_len < header.len as usize {
            return Err(RequestError::ShortRead(data_len, header.len as usize));
        }
        let args_len = (header.len as usize).saturating_sub(mem::size_of::<fuse_in_header>());
        let data = it.fetch_bytes(args_len).ok_or(RequestError::InsufficientData)?;
        Ok(Self { header, data })
    }
}

impl<'a> fmt::Display for Request<'a> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "FUSE({:3}) ino {:#018x} opcode {} ({} bytes of arguments)",
            self.header.unique,
            self.header.nodeid,
            self.header.opcode,
            self.data.len()
        )
    }
}

impl<'a> Request<'a> {
    /// Returns the unique identifier of this request.
    ///
    /// The FUSE kernel driver assigns a unique id to every concurrent request. This allows to
    /// distinguish between multiple concurrent requests. The unique id of a request may be
    /// reused in later requests after it has completed.
    pub fn unique(&self) -> u64 {
        self.header.unique
    }

    /// Returns the node id of the inode this request is targeted to.
    pub fn nodeid(&self) -> u64 {
        self.header.nodeid
    }

    /// Returns the UID that the process that triggered this request runs under.
    pub fn uid(&self) -> u32 {
        self.header.uid
    }

    /// Returns the GID that the process that triggered this request runs under.
    pub fn gid(&self) -> u32 {
        self.header.gid
    }

    /// Returns the PID of the process that triggered this request.
    pub fn pid(&self) -> u32 {
        self.header.pid
    }

    /// Returns the opcode of this request.
    pub fn opcode(&self) -> Result<fuse_opcode, RequestError> {
        fuse_opcode::try_from(self.header.opcode)
            .map_err(|err| RequestError::UnknownOperation(err.0))
    }

    /// Returns an iterator over the argument bytes following the header.
    pub fn arguments(&self) -> ArgumentIterator<'a> {
        ArgumentIterator::new(self.data)
    }
}
