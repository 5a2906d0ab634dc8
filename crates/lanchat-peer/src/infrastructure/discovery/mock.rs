//! Scripted discovery service for unit testing.
//!
//! Each `browse()` call consumes the next queued script and replays its
//! events.  The channel then stays open, like a live browse, until
//! `stop_browse()` is called; tests can inject further events with
//! [`ScriptedDiscovery::emit`].

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use tokio::sync::mpsc;

use super::{BrowseEvent, DiscoveryError, DiscoveryService};

const SCRIPT_BUFFER: usize = 64;

/// A [`DiscoveryService`] that replays queued event scripts.
#[derive(Default)]
pub struct ScriptedDiscovery {
    scripts: Mutex<VecDeque<Vec<BrowseEvent>>>,
    browse_errors: Mutex<VecDeque<DiscoveryError>>,
    live: Mutex<Option<mpsc::Sender<BrowseEvent>>>,
    browse_calls: AtomicUsize,
    stop_calls: AtomicUsize,
}

impl ScriptedDiscovery {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues the events replayed by the next `browse()` call.
    pub fn push_script(&self, events: Vec<BrowseEvent>) {
        self.scripts.lock().expect("lock poisoned").push_back(events);
    }

    /// Makes the next `browse()` call fail with `error`.
    pub fn fail_next_browse(&self, error: DiscoveryError) {
        self.browse_errors
            .lock()
            .expect("lock poisoned")
            .push_back(error);
    }

    /// Sends `event` on the currently open browse.  Returns `false` if no
    /// browse is open.
    pub async fn emit(&self, event: BrowseEvent) -> bool {
        let sender = self.live.lock().expect("lock poisoned").clone();
        match sender {
            Some(tx) => tx.send(event).await.is_ok(),
            None => false,
        }
    }

    pub fn browse_calls(&self) -> usize {
        self.browse_calls.load(Ordering::SeqCst)
    }

    pub fn stop_calls(&self) -> usize {
        self.stop_calls.load(Ordering::SeqCst)
    }
}

impl DiscoveryService for ScriptedDiscovery {
    fn browse(&self, _service_type: &str) -> Result<mpsc::Receiver<BrowseEvent>, DiscoveryError> {
        self.browse_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(error) = self.browse_errors.lock().expect("lock poisoned").pop_front() {
            return Err(error);
        }

        let script = self
            .scripts
            .lock()
            .expect("lock poisoned")
            .pop_front()
            .unwrap_or_default();
        let (tx, rx) = mpsc::channel(SCRIPT_BUFFER.max(script.len()));
        for event in script {
            tx.try_send(event).expect("script fits the channel");
        }
        *self.live.lock().expect("lock poisoned") = Some(tx);
        Ok(rx)
    }

    fn stop_browse(&self, _service_type: &str) {
        self.stop_calls.fetch_add(1, Ordering::SeqCst);
        *self.live.lock().expect("lock poisoned") = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::discovery::DEFAULT_SERVICE_TYPE;

    #[tokio::test]
    async fn test_browse_replays_script_then_stays_open() {
        // Arrange
        let discovery = ScriptedDiscovery::new();
        discovery.push_script(vec![BrowseEvent::Ready]);

        // Act
        let mut rx = discovery.browse(DEFAULT_SERVICE_TYPE).unwrap();

        // Assert
        assert_eq!(rx.recv().await, Some(BrowseEvent::Ready));
        assert!(rx.try_recv().is_err(), "no further events yet");
        assert!(discovery.emit(BrowseEvent::Ready).await);
        assert_eq!(rx.recv().await, Some(BrowseEvent::Ready));
    }

    #[tokio::test]
    async fn test_stop_browse_closes_channel() {
        let discovery = ScriptedDiscovery::new();
        let mut rx = discovery.browse(DEFAULT_SERVICE_TYPE).unwrap();

        discovery.stop_browse(DEFAULT_SERVICE_TYPE);

        assert_eq!(rx.recv().await, None);
        assert_eq!(discovery.stop_calls(), 1);
        assert!(!discovery.emit(BrowseEvent::Ready).await);
    }

    #[test]
    fn test_queued_browse_error_is_returned_once() {
        let discovery = ScriptedDiscovery::new();
        discovery.fail_next_browse(DiscoveryError::DefunctConnection);

        assert_eq!(
            discovery.browse(DEFAULT_SERVICE_TYPE).unwrap_err(),
            DiscoveryError::DefunctConnection
        );
        assert!(discovery.browse(DEFAULT_SERVICE_TYPE).is_ok());
        assert_eq!(discovery.browse_calls(), 2);
    }
}
