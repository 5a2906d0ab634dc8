//! Service discovery infrastructure.
//!
//! A [`DiscoveryService`] browses for peers advertising a service type and
//! streams [`BrowseEvent`]s into a Tokio channel.  The application-layer
//! `PeerBrowser` owns the live peer set built from those events.
//!
//! # Testability
//!
//! The trait lets tests script browse sessions (see [`mock`]) including
//! daemon failures, without multicast networking.

use std::collections::BTreeSet;
use std::fmt;
use std::net::SocketAddr;

use thiserror::Error;
use tokio::sync::mpsc;

pub mod mdns;
pub mod mock;

/// Service type LanChat peers advertise and browse for.
pub const DEFAULT_SERVICE_TYPE: &str = "_lanchat._tcp.local.";

/// Errors reported by a discovery service.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DiscoveryError {
    /// The link to the discovery daemon broke.  Restarting the browse
    /// usually recovers.
    #[error("connection to the discovery daemon became defunct")]
    DefunctConnection,

    /// The discovery daemon could not be started.
    #[error("discovery daemon unavailable: {0}")]
    DaemonUnavailable(String),

    /// The browse request itself was rejected.
    #[error("browse failed: {0}")]
    BrowseFailed(String),

    /// The local service could not be advertised.
    #[error("advertise failed: {0}")]
    AdvertiseFailed(String),
}

impl DiscoveryError {
    /// Returns `true` for the failure class handled by restarting the browse.
    pub fn is_transient(&self) -> bool {
        matches!(self, DiscoveryError::DefunctConnection)
    }
}

/// Opaque identity of an advertised peer: the service's full name.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PeerId(String);

impl PeerId {
    pub fn new(fullname: impl Into<String>) -> Self {
        Self(fullname.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One reachable peer as seen by the browser.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PeerRecord {
    pub id: PeerId,
    /// Name the peer advertised for display.
    pub display_name: String,
    /// Addresses the peer resolved to, in preference order.
    pub interfaces: Vec<SocketAddr>,
}

/// Snapshot of all currently reachable peers.
pub type PeerSet = BTreeSet<PeerRecord>;

/// Events produced by an active browse.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BrowseEvent {
    /// The browse is running.
    Ready,
    /// A peer appeared or changed.
    Resolved(PeerRecord),
    /// A peer stopped advertising.
    Removed(PeerId),
    /// The browse failed; no further events follow.
    Failed(DiscoveryError),
}

/// Browses the local network for a service type.
pub trait DiscoveryService: Send + Sync {
    /// Starts browsing for `service_type`.
    ///
    /// Events arrive on the returned receiver until [`stop_browse`] is called
    /// or a [`BrowseEvent::Failed`] is delivered.
    ///
    /// [`stop_browse`]: DiscoveryService::stop_browse
    fn browse(&self, service_type: &str) -> Result<mpsc::Receiver<BrowseEvent>, DiscoveryError>;

    /// Stops the browse for `service_type` and releases its resources.
    fn stop_browse(&self, service_type: &str);
}

/// Strips the `.<service_type>` suffix from a service full name.
pub fn instance_name<'a>(fullname: &'a str, service_type: &str) -> &'a str {
    fullname
        .strip_suffix(service_type)
        .map(|rest| rest.trim_end_matches('.'))
        .unwrap_or(fullname)
}
