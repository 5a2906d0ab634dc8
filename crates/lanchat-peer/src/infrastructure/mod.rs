//! Infrastructure layer: everything that touches sockets, the mDNS daemon or
//! the file system.

pub mod discovery;
pub mod listener;
pub mod storage;
pub mod transport;
