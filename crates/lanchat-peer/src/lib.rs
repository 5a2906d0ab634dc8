//! LanChat peer: connections, discovery and the `lanchat` binary's building
//! blocks.

pub mod application;
pub mod infrastructure;
