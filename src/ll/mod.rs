//! Low-level kernel communication.

mod argument;
pub use argument::ArgumentIterator;

mod attr;
pub(crate) use attr::system_time;
pub use attr::{FileAttr, FileAttrTryFromError, FileType, FileTypeTryFromError};

pub(crate) mod reply;
pub use reply::Response;

mod request;
pub use request::{Request, RequestError};

#[cfg(test)]
pub(crate) use request::test::packet;
