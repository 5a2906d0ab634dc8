//! mDNS / DNS-SD discovery using `mdns-sd`.
//!
//! `mdns-sd` runs its own daemon thread and delivers events on a blocking
//! channel.  Each browse gets a dedicated thread that forwards those events
//! into a Tokio channel, translating them to [`BrowseEvent`]s.

use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use mdns_sd::{ServiceDaemon, ServiceEvent, ServiceInfo};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::{
    instance_name, BrowseEvent, DiscoveryError, DiscoveryService, PeerId, PeerRecord,
};

/// TXT key carrying the human-readable peer name.
const NAME_PROPERTY: &str = "name";

/// How often the forwarding thread checks whether the browse was dropped.
const POLL_INTERVAL: Duration = Duration::from_millis(250);

const EVENT_BUFFER: usize = 64;

fn classify(e: mdns_sd::Error) -> DiscoveryError {
    match e {
        mdns_sd::Error::Again => DiscoveryError::DefunctConnection,
        other => DiscoveryError::BrowseFailed(other.to_string()),
    }
}

/// [`DiscoveryService`] backed by an `mdns-sd` daemon.
pub struct MdnsDiscovery {
    daemon: ServiceDaemon,
}

impl MdnsDiscovery {
    /// Starts a new mDNS daemon.
    ///
    /// # Errors
    ///
    /// Returns [`DiscoveryError::DaemonUnavailable`] if the daemon cannot bind
    /// its multicast sockets.
    pub fn new() -> Result<Self, DiscoveryError> {
        let daemon =
            ServiceDaemon::new().map_err(|e| DiscoveryError::DaemonUnavailable(e.to_string()))?;
        Ok(Self { daemon })
    }
}

impl DiscoveryService for MdnsDiscovery {
    fn browse(&self, service_type: &str) -> Result<mpsc::Receiver<BrowseEvent>, DiscoveryError> {
        let receiver = self.daemon.browse(service_type).map_err(classify)?;
        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        let service_type = service_type.to_string();

        std::thread::Builder::new()
            .name("mdns-browse".into())
            .spawn(move || {
                let mut ready_sent = false;
                loop {
                    if tx.is_closed() {
                        break;
                    }
                    let event = match receiver.recv_timeout(POLL_INTERVAL) {
                        Ok(ServiceEvent::SearchStarted(_)) if !ready_sent => {
                            ready_sent = true;
                            BrowseEvent::Ready
                        }
                        Ok(ServiceEvent::ServiceResolved(info)) => {
                            let record = record_from_info(&info, &service_type);
                            debug!("mDNS resolved {} at {:?}", record.id, record.interfaces);
                            BrowseEvent::Resolved(record)
                        }
                        Ok(ServiceEvent::ServiceRemoved(_, fullname)) => {
                            debug!("mDNS removed {fullname}");
                            BrowseEvent::Removed(PeerId::new(fullname))
                        }
                        Ok(ServiceEvent::SearchStopped(_)) => {
                            debug!("mDNS search for {service_type} stopped");
                            break;
                        }
                        Ok(_) => continue,
                        Err(_) if receiver.is_disconnected() => {
                            warn!("mDNS daemon channel disconnected");
                            BrowseEvent::Failed(DiscoveryError::DefunctConnection)
                        }
                        Err(_) => continue,
                    };
                    let failed = matches!(event, BrowseEvent::Failed(_));
                    if tx.blocking_send(event).is_err() || failed {
                        break;
                    }
                }
            })
            .map_err(|e| DiscoveryError::BrowseFailed(e.to_string()))?;

        Ok(rx)
    }

    fn stop_browse(&self, service_type: &str) {
        if let Err(e) = self.daemon.stop_browse(service_type) {
            debug!("stop_browse({service_type}) failed: {e}");
        }
    }
}

impl Drop for MdnsDiscovery {
    fn drop(&mut self) {
        let _ = self.daemon.shutdown();
    }
}

fn record_from_info(info: &ServiceInfo, service_type: &str) -> PeerRecord {
    let fullname = info.get_fullname();
    let display_name = info
        .get_properties()
        .get(NAME_PROPERTY)
        .and_then(|p| p.val())
        .map(|val| String::from_utf8_lossy(val).into_owned())
        .unwrap_or_else(|| instance_name(fullname, service_type).to_string());

    let port = info.get_port();
    let mut interfaces: Vec<SocketAddr> = info
        .get_addresses()
        .iter()
        .map(|addr| SocketAddr::new(IpAddr::from(*addr), port))
        .collect();
    // IPv4 first, then by address, so the order is stable across resolves.
    interfaces.sort_by_key(|a| (a.is_ipv6(), *a));

    PeerRecord {
        id: PeerId::new(fullname),
        display_name,
        interfaces,
    }
}

// ── Advertising ───────────────────────────────────────────────────────────────

/// Advertises this peer so others can browse for it.
pub struct ServiceAdvertiser {
    daemon: ServiceDaemon,
    fullname: Option<String>,
}

impl ServiceAdvertiser {
    /// # Errors
    ///
    /// Returns [`DiscoveryError::DaemonUnavailable`] if the daemon cannot start.
    pub fn new() -> Result<Self, DiscoveryError> {
        let daemon =
            ServiceDaemon::new().map_err(|e| DiscoveryError::DaemonUnavailable(e.to_string()))?;
        Ok(Self {
            daemon,
            fullname: None,
        })
    }

    /// Registers `display_name` under `service_type` on `port`.
    ///
    /// Replaces any previous advertisement from this advertiser.
    pub fn advertise(
        &mut self,
        service_type: &str,
        display_name: &str,
        port: u16,
    ) -> Result<(), DiscoveryError> {
        self.stop()?;

        let host = hostname::get()
            .map(|h| h.to_string_lossy().into_owned())
            .unwrap_or_else(|_| "lanchat".to_string());
        let properties: &[(&str, &str)] = &[(NAME_PROPERTY, display_name)];
        let service_info = ServiceInfo::new(
            service_type,
            display_name,
            &format!("{host}.local."),
            "",
            port,
            properties,
        )
        .map_err(|e| DiscoveryError::AdvertiseFailed(e.to_string()))?
        .enable_addr_auto();

        let fullname = service_info.get_fullname().to_string();
        self.daemon
            .register(service_info)
            .map_err(|e| DiscoveryError::AdvertiseFailed(e.to_string()))?;

        info!("advertising {fullname} on port {port}");
        self.fullname = Some(fullname);
        Ok(())
    }

    /// Withdraws the advertisement, if any.
    pub fn stop(&mut self) -> Result<(), DiscoveryError> {
        if let Some(fullname) = self.fullname.take() {
            self.daemon
                .unregister(&fullname)
                .map_err(|e| DiscoveryError::AdvertiseFailed(e.to_string()))?;
            info!("stopped advertising {fullname}");
        }
        Ok(())
    }

    pub fn fullname(&self) -> Option<&str> {
        self.fullname.as_deref()
    }
}

impl Drop for ServiceAdvertiser {
    fn drop(&mut self) {
        let _ = self.stop();
        let _ = self.daemon.shutdown();
    }
}
