//! Application layer: the connection and browsing use cases.
//!
//! Both are written against infrastructure traits (`Connector`,
//! `DiscoveryService`) and report to injected observer traits, so they run
//! unchanged against mocks in tests.

pub mod browser;
pub mod connection;
