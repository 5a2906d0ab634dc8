//! Peer browsing use case.
//!
//! [`PeerBrowser`] turns the raw [`BrowseEvent`] stream of a
//! [`DiscoveryService`] into full-snapshot refreshes for a
//! [`BrowserObserver`].  A defunct daemon connection is recovered by
//! restarting the browse after a short delay; every other failure is shown
//! to the observer once and ends browsing.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::infrastructure::discovery::{
    BrowseEvent, DiscoveryError, DiscoveryService, PeerId, PeerRecord, PeerSet,
};

/// Wait before browsing again after a defunct daemon connection.
pub const DEFAULT_RESTART_DELAY: Duration = Duration::from_secs(1);

/// Receives peer snapshots and terminal browse errors.
#[cfg_attr(test, mockall::automock)]
pub trait BrowserObserver: Send + Sync {
    /// The complete set of currently reachable peers.
    fn refresh_results(&self, peers: PeerSet);
    fn display_browse_error(&self, error: &DiscoveryError);
}

struct BrowseTask {
    shutdown: oneshot::Sender<()>,
    handle: JoinHandle<()>,
}

/// Everything the background task needs, cloned out of the browser.
#[derive(Clone)]
struct BrowseContext {
    service: Arc<dyn DiscoveryService>,
    service_type: String,
    observer: Weak<dyn BrowserObserver>,
    restart_delay: Duration,
}

/// Keeps a live set of peers advertising one service type.
pub struct PeerBrowser {
    context: BrowseContext,
    task: Mutex<Option<BrowseTask>>,
}

impl PeerBrowser {
    pub fn new(
        service: Arc<dyn DiscoveryService>,
        service_type: impl Into<String>,
        observer: Weak<dyn BrowserObserver>,
        restart_delay: Duration,
    ) -> Self {
        Self {
            context: BrowseContext {
                service,
                service_type: service_type.into(),
                observer,
                restart_delay,
            },
            task: Mutex::new(None),
        }
    }

    /// Starts browsing.  Does nothing while a browse is already running.
    ///
    /// Must be called inside a Tokio runtime.
    pub fn start(&self) {
        let mut task = self.task.lock().unwrap_or_else(|e| e.into_inner());
        if task.as_ref().is_some_and(|t| !t.handle.is_finished()) {
            debug!("browse for {} already running", self.context.service_type);
            return;
        }

        info!("browsing for {}", self.context.service_type);
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let handle = tokio::spawn(run(self.context.clone(), shutdown_rx));
        *task = Some(BrowseTask {
            shutdown: shutdown_tx,
            handle,
        });
    }

    /// Stops browsing and releases the browse.  Idempotent.
    pub fn cancel(&self) {
        let task = self.task.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(task) = task {
            debug!("cancelling browse for {}", self.context.service_type);
            let _ = task.shutdown.send(());
        }
    }

    pub fn is_running(&self) -> bool {
        self.task
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .is_some_and(|t| !t.handle.is_finished())
    }

    pub fn service_type(&self) -> &str {
        &self.context.service_type
    }
}

impl Drop for PeerBrowser {
    fn drop(&mut self) {
        self.cancel();
    }
}

enum Outcome {
    Shutdown,
    Failed(DiscoveryError),
}

async fn run(ctx: BrowseContext, mut shutdown: oneshot::Receiver<()>) {
    let mut peers: BTreeMap<PeerId, PeerRecord> = BTreeMap::new();

    loop {
        let failure = match ctx.service.browse(&ctx.service_type) {
            Ok(events) => match pump(&ctx, events, &mut peers, &mut shutdown).await {
                Outcome::Shutdown => {
                    ctx.service.stop_browse(&ctx.service_type);
                    return;
                }
                Outcome::Failed(e) => {
                    ctx.service.stop_browse(&ctx.service_type);
                    e
                }
            },
            Err(e) => e,
        };

        if !failure.is_transient() {
            warn!("browse for {} failed: {failure}", ctx.service_type);
            if let Some(observer) = ctx.observer.upgrade() {
                observer.display_browse_error(&failure);
            }
            return;
        }

        info!(
            "browse for {} hit {failure}; restarting in {:?}",
            ctx.service_type, ctx.restart_delay
        );
        peers.clear();
        tokio::select! {
            biased;
            _ = &mut shutdown => return,
            _ = tokio::time::sleep(ctx.restart_delay) => {}
        }
    }
}

/// Applies events from one browse until it fails or shutdown is requested.
async fn pump(
    ctx: &BrowseContext,
    mut events: mpsc::Receiver<BrowseEvent>,
    peers: &mut BTreeMap<PeerId, PeerRecord>,
    shutdown: &mut oneshot::Receiver<()>,
) -> Outcome {
    loop {
        let event = tokio::select! {
            biased;
            _ = &mut *shutdown => return Outcome::Shutdown,
            event = events.recv() => event,
        };

        let changed = match event {
            Some(BrowseEvent::Ready) => true,
            Some(BrowseEvent::Resolved(record)) => {
                let previous = peers.insert(record.id.clone(), record.clone());
                previous.as_ref() != Some(&record)
            }
            Some(BrowseEvent::Removed(id)) => peers.remove(&id).is_some(),
            Some(BrowseEvent::Failed(e)) => return Outcome::Failed(e),
            None => return Outcome::Failed(DiscoveryError::DefunctConnection),
        };

        if changed {
            if let Some(observer) = ctx.observer.upgrade() {
                observer.refresh_results(peers.values().cloned().collect());
            }
        }
    }
}
