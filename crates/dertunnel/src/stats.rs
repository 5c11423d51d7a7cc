use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use dertunnel_common::Throttled;

use crate::observer::{ClientStats, EndpointEvent, TunnelObserver};

/// Minimum time between two unforced stats callbacks
pub const STATS_INTERVAL: Duration = Duration::from_millis(200);

/// Shared stats of one tunnel, reported through the observer
///
/// Data updates are throttled; connect, disconnect and error events are
/// delivered right away and flush the throttle.
pub struct StatsTracker {
    stats: Arc<Mutex<ClientStats>>,
    observer: Arc<dyn TunnelObserver>,
    updater: Throttled<()>,
}

impl StatsTracker {
    pub fn new(observer: Arc<dyn TunnelObserver>) -> Self {
        let stats = Arc::new(Mutex::new(ClientStats::default()));
        let updater = {
            let stats = stats.clone();
            let observer = observer.clone();
            Throttled::new(STATS_INTERVAL, move |()| {
                let snapshot = *stats.lock();
                observer.on_endpoint(EndpointEvent::Data, &snapshot, "");
            })
        };
        Self {
            stats,
            observer,
            updater,
        }
    }

    pub fn snapshot(&self) -> ClientStats {
        *self.stats.lock()
    }

    fn urgent(&self, event: EndpointEvent, message: &str) {
        let snapshot = self.snapshot();
        self.observer.on_endpoint(event, &snapshot, message);
        self.updater.update((), true);
    }

    /// Push the current stats out immediately
    pub fn flush(&self) {
        self.updater.update((), true);
    }

    pub fn connected(&self) {
        {
            let mut stats = self.stats.lock();
            stats.current_connections += 1;
            stats.total_connections += 1;
        }
        self.urgent(EndpointEvent::Connect, "");
    }

    pub fn disconnected(&self) {
        {
            let mut stats = self.stats.lock();
            stats.current_connections = stats.current_connections.saturating_sub(1);
        }
        self.urgent(EndpointEvent::Disconnect, "");
    }

    /// Failure of a local socket
    pub fn connection_error(&self, message: &str) {
        self.stats.lock().connection_errors += 1;
        self.urgent(EndpointEvent::Error, message);
    }

    /// Non-fatal failure, e.g. from the inspector
    pub fn error(&self, message: &str) {
        self.urgent(EndpointEvent::Error, message);
    }

    /// Bytes read from the local service
    pub fn received(&self, bytes: usize) {
        {
            let mut stats = self.stats.lock();
            stats.bytes_received += bytes as u64;
            stats.chunks_received += 1;
        }
        self.updater.update((), false);
    }

    /// Bytes written to the local service
    pub fn sent(&self, bytes: usize) {
        {
            let mut stats = self.stats.lock();
            stats.bytes_sent += bytes as u64;
            stats.chunks_sent += 1;
        }
        self.updater.update((), false);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Recorder {
        events: Mutex<Vec<(EndpointEvent, ClientStats)>>,
    }

    impl TunnelObserver for Recorder {
        fn on_endpoint(&self, event: EndpointEvent, stats: &ClientStats, _message: &str) {
            self.events.lock().push((event, *stats));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_data_updates_are_throttled() {
        let recorder = Arc::new(Recorder::default());
        let tracker = StatsTracker::new(recorder.clone());

        tracker.received(10);
        tracker.received(20);
        tracker.sent(5);
        assert_eq!(recorder.events.lock().len(), 1);

        tokio::time::sleep(Duration::from_millis(250)).await;
        let events = recorder.events.lock().clone();
        assert_eq!(events.len(), 2);
        let (event, stats) = events[1];
        assert_eq!(event, EndpointEvent::Data);
        assert_eq!(stats.bytes_received, 30);
        assert_eq!(stats.chunks_received, 2);
        assert_eq!(stats.bytes_sent, 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connection_events_are_urgent() {
        let recorder = Arc::new(Recorder::default());
        let tracker = StatsTracker::new(recorder.clone());

        tracker.connected();
        tracker.connection_error("refused");
        tracker.disconnected();

        let kinds: Vec<_> = recorder.events.lock().iter().map(|(e, _)| *e).collect();
        assert_eq!(
            kinds,
            vec![
                EndpointEvent::Connect,
                EndpointEvent::Data,
                EndpointEvent::Error,
                EndpointEvent::Data,
                EndpointEvent::Disconnect,
                EndpointEvent::Data,
            ]
        );
        let stats = tracker.snapshot();
        assert_eq!(stats.current_connections, 0);
        assert_eq!(stats.total_connections, 1);
        assert_eq!(stats.connection_errors, 1);
    }
}
