use futures::stream::StreamExt;
use std::sync::Arc;
use tokio::{sync::Mutex, task::JoinHandle};
use tracing::{debug, info, warn};

use crate::{
    error::{ReabilitaError, Result},
    state::{Notifier, SharedState},
    transport::{ScanPredicate, Transport},
    types::{AdapterPowerState, Notice, PeripheralHandle, SessionConfig},
    PERIPHERAL_NAME,
};

/// Phase of a scan-to-selection cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanPhase {
    /// No scan has run since the last reset
    Idle,
    /// A scan is settling or receiving advertisements
    Scanning,
    /// The last scan finished; results are final
    Stopped,
}

#[derive(Debug)]
struct DiscoveryInner {
    phase: ScanPhase,
    results: Vec<PeripheralHandle>,
    has_scanned_once: bool,
    // Identifies the current scan so a superseded scan task cannot write results
    generation: u64,
    task: Option<JoinHandle<()>>,
}

/// Accept only advertisements named exactly like the peripheral
#[must_use]
pub fn peripheral_filter() -> ScanPredicate {
    Arc::new(|handle: &PeripheralHandle| handle.name.as_deref() == Some(PERIPHERAL_NAME))
}

/// One scan-to-selection cycle at a time
///
/// Results are de-duplicated by id and kept in discovery order. A scan always
/// ends in [`ScanPhase::Stopped`] after the configured duration, or sooner if
/// the adapter fails to start it.
#[derive(Clone)]
pub struct DiscoverySession {
    transport: Arc<dyn Transport>,
    state: SharedState,
    notifier: Notifier,
    config: SessionConfig,
    inner: Arc<Mutex<DiscoveryInner>>,
}

impl DiscoverySession {
    /// Create an idle session
    #[must_use]
    pub fn new(
        transport: Arc<dyn Transport>,
        state: SharedState,
        notifier: Notifier,
        config: SessionConfig,
    ) -> Self {
        Self {
            transport,
            state,
            notifier,
            config,
            inner: Arc::new(Mutex::new(DiscoveryInner {
                phase: ScanPhase::Idle,
                results: Vec::new(),
                has_scanned_once: false,
                generation: 0,
                task: None,
            })),
        }
    }

    /// Current phase
    pub async fn phase(&self) -> ScanPhase {
        self.inner.lock().await.phase
    }

    /// Whether a scan is in progress
    pub async fn is_scanning(&self) -> bool {
        self.phase().await == ScanPhase::Scanning
    }

    /// Whether a scan completed since the last reset
    pub async fn has_scanned_once(&self) -> bool {
        self.inner.lock().await.has_scanned_once
    }

    /// Peripherals found so far, in discovery order
    pub async fn results(&self) -> Vec<PeripheralHandle> {
        self.inner.lock().await.results.clone()
    }

    /// Begin a new scan
    ///
    /// Returns `false` when a scan is already running or a peripheral is
    /// connected; neither case is an error.
    ///
    /// # Errors
    ///
    /// Returns [`ReabilitaError::AdapterUnavailable`] if the adapter is not powered on.
    pub async fn start_scan(&self) -> Result<bool> {
        let power = self
            .transport
            .power_state()
            .await
            .unwrap_or(AdapterPowerState::Unknown);
        if !power.is_powered_on() {
            warn!(%power, "scan refused");
            self.notifier.publish(Notice::AdapterUnavailable(power));
            return Err(ReabilitaError::AdapterUnavailable { state: power });
        }

        if self.state.active_connection().is_some() {
            debug!("scan ignored while connected");
            return Ok(false);
        }

        let generation = {
            let mut inner = self.inner.lock().await;
            if inner.phase == ScanPhase::Scanning {
                debug!("scan already running");
                return Ok(false);
            }
            if let Some(task) = inner.task.take() {
                task.abort();
            }
            inner.phase = ScanPhase::Scanning;
            inner.results.clear();
            inner.has_scanned_once = false;
            inner.generation += 1;
            inner.generation
        };

        if let Err(e) = self.transport.stop_scan().await {
            debug!(error = %e, "stopping previous scan");
        }

        info!(generation, "scan started");
        let task = tokio::spawn(self.clone().run_scan(generation));

        let mut inner = self.inner.lock().await;
        if inner.generation == generation {
            inner.task = Some(task);
        } else {
            task.abort();
        }
        Ok(true)
    }

    /// Abandon any scan and forget all results
    pub async fn reset(&self) {
        let task = {
            let mut inner = self.inner.lock().await;
            inner.generation += 1;
            inner.phase = ScanPhase::Idle;
            inner.results.clear();
            inner.has_scanned_once = false;
            inner.task.take()
        };

        if let Some(task) = task {
            task.abort();
            if let Err(e) = self.transport.stop_scan().await {
                debug!(error = %e, "stopping scan on reset");
            }
        }
        debug!("discovery reset");
    }

    async fn is_current(&self, generation: u64) -> bool {
        self.inner.lock().await.generation == generation
    }

    async fn run_scan(self, generation: u64) {
        tokio::time::sleep(self.config.scan_settle()).await;
        if !self.is_current(generation).await {
            return;
        }

        let mut advertisements = match self.transport.start_scan(peripheral_filter()).await {
            Ok(stream) => stream,
            Err(e) => {
                warn!(error = %e, "scan could not start");
                self.finish(generation).await;
                self.notifier.publish(Notice::ScanFailed(e.to_string()));
                return;
            }
        };

        let deadline = tokio::time::sleep(self.config.scan_duration());
        tokio::pin!(deadline);

        loop {
            tokio::select! {
                () = &mut deadline => break,
                advertisement = advertisements.next() => match advertisement {
                    Some(handle) => self.record(generation, handle).await,
                    None => {
                        debug!("advertisement stream ended early");
                        break;
                    }
                },
            }
        }

        if let Err(e) = self.transport.stop_scan().await {
            debug!(error = %e, "stopping scan");
        }
        self.finish(generation).await;
    }

    async fn record(&self, generation: u64, handle: PeripheralHandle) {
        let mut inner = self.inner.lock().await;
        if inner.generation != generation || inner.phase != ScanPhase::Scanning {
            return;
        }
        if inner.results.iter().any(|known| known.id == handle.id) {
            return;
        }
        info!(peripheral = %handle.id, "peripheral found");
        inner.results.push(handle);
    }

    async fn finish(&self, generation: u64) {
        let mut inner = self.inner.lock().await;
        if inner.generation != generation || inner.phase != ScanPhase::Scanning {
            return;
        }
        inner.phase = ScanPhase::Stopped;
        inner.has_scanned_once = true;
        inner.task = None;
        info!(found = inner.results.len(), "scan stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{MockOperation, MockTransport};
    use std::time::Duration;

    fn reabilita(id: &str) -> PeripheralHandle {
        PeripheralHandle::new(id, Some(PERIPHERAL_NAME.to_string()))
    }

    fn session(transport: &Arc<MockTransport>) -> (DiscoverySession, Notifier) {
        let notifier = Notifier::new(8);
        let session = DiscoverySession::new(
            transport.clone(),
            SharedState::new(),
            notifier.clone(),
            SessionConfig::default(),
        );
        (session, notifier)
    }

    async fn wait(ms: u64) {
        tokio::time::sleep(Duration::from_millis(ms)).await;
    }

    #[test]
    fn test_filter_matches_exact_name() {
        let filter = peripheral_filter();
        assert!(filter(&reabilita("A")));
        assert!(!filter(&PeripheralHandle::new("B", Some("Reabilita 2".to_string()))));
        assert!(!filter(&PeripheralHandle::new("C", Some("reabilita".to_string()))));
        assert!(!filter(&PeripheralHandle::new("D", None)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_scan_collects_unique_results_in_order() {
        let transport = Arc::new(MockTransport::powered_on());
        let (session, _) = session(&transport);

        assert!(session.start_scan().await.unwrap());
        assert!(session.is_scanning().await);
        wait(600).await;

        assert!(transport.advertise(reabilita("B")));
        assert!(transport.advertise(reabilita("A")));
        assert!(transport.advertise(reabilita("B")));
        assert!(!transport.advertise(PeripheralHandle::new("C", Some("Speaker".to_string()))));
        wait(10).await;

        let ids: Vec<String> = session.results().await.into_iter().map(|h| h.id).collect();
        assert_eq!(ids, vec!["B".to_string(), "A".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_scan_stops_after_duration_without_results() {
        let transport = Arc::new(MockTransport::powered_on());
        let (session, _) = session(&transport);

        session.start_scan().await.unwrap();
        assert!(!session.has_scanned_once().await);

        wait(600).await;
        assert!(transport.is_scanning());
        assert_eq!(session.phase().await, ScanPhase::Scanning);

        wait(5_000).await;
        assert_eq!(session.phase().await, ScanPhase::Stopped);
        assert!(session.has_scanned_once().await);
        assert!(session.results().await.is_empty());
        assert!(!transport.is_scanning());
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_start_while_scanning_is_ignored() {
        let transport = Arc::new(MockTransport::powered_on());
        let (session, _) = session(&transport);

        assert!(session.start_scan().await.unwrap());
        assert!(!session.start_scan().await.unwrap());
        wait(600).await;
        assert_eq!(transport.scan_starts(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_scan_refused_when_adapter_off() {
        let transport = Arc::new(MockTransport::new(AdapterPowerState::PoweredOff));
        let (session, notifier) = session(&transport);
        let mut notices = notifier.subscribe();

        let result = session.start_scan().await;

        assert!(matches!(
            result,
            Err(ReabilitaError::AdapterUnavailable {
                state: AdapterPowerState::PoweredOff
            })
        ));
        assert_eq!(session.phase().await, ScanPhase::Idle);
        assert_eq!(
            notices.recv().await.unwrap(),
            Notice::AdapterUnavailable(AdapterPowerState::PoweredOff)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_scan_start_failure_lands_in_stopped() {
        let transport = Arc::new(MockTransport::powered_on());
        transport.set_failing(MockOperation::Scan, true);
        let (session, notifier) = session(&transport);
        let mut notices = notifier.subscribe();

        assert!(session.start_scan().await.unwrap());
        wait(600).await;

        assert_eq!(session.phase().await, ScanPhase::Stopped);
        assert!(session.results().await.is_empty());
        assert!(matches!(notices.recv().await.unwrap(), Notice::ScanFailed(_)));

        transport.set_failing(MockOperation::Scan, false);
        assert!(session.start_scan().await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset_clears_results_mid_scan() {
        let transport = Arc::new(MockTransport::powered_on());
        let (session, _) = session(&transport);

        session.start_scan().await.unwrap();
        wait(600).await;
        transport.advertise(reabilita("A"));
        wait(10).await;
        assert_eq!(session.results().await.len(), 1);

        session.reset().await;

        assert_eq!(session.phase().await, ScanPhase::Idle);
        assert!(session.results().await.is_empty());
        assert!(!transport.is_scanning());

        wait(6_000).await;
        assert_eq!(session.phase().await, ScanPhase::Idle);
        assert!(!session.has_scanned_once().await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_new_scan_clears_previous_results() {
        let transport = Arc::new(MockTransport::powered_on());
        let (session, _) = session(&transport);

        session.start_scan().await.unwrap();
        wait(600).await;
        transport.advertise(reabilita("A"));
        wait(5_000).await;
        assert_eq!(session.results().await.len(), 1);

        session.start_scan().await.unwrap();
        assert!(session.results().await.is_empty());
        assert!(!session.has_scanned_once().await);
    }
}
