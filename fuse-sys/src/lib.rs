//! FFI bindings to libfuse
//!
//! Only the mount and unmount entry points of libfuse are used. Everything else (reading
//! requests, sending replies) talks to the kernel driver directly through the file descriptor
//! that mounting returns.

#![allow(non_camel_case_types)]

use std::os::raw::{c_char, c_int};

/// Argument vector as parsed by libfuse's option parser.
#[repr(C)]
#[derive(Debug)]
pub struct fuse_args {
    pub argc: c_int,
    pub argv: *const *const c_char,
    pub allocated: c_int,
}

#[cfg(feature = "libfuse")]
extern "C" {
    // Really belongs to fuse_lowlevel.h, but the only function used from there is
    // `fuse_mount_compat25`, which returns the raw device file descriptor.
    pub fn fuse_mount_compat25(mountpoint: *const c_char, args: *const fuse_args) -> c_int;
    pub fn fuse_unmount_compat22(mountpoint: *const c_char);
}
