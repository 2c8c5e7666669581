use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::remote::RemoteCaseService;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    Online,
    Offline,
}

impl ConnectionState {
    #[must_use]
    pub const fn is_online(self) -> bool {
        matches!(self, Self::Online)
    }
}

#[derive(Clone, Debug)]
pub struct MonitorConfig {
    pub probe_interval: Duration,
    pub probe_timeout: Duration,
    /// Consecutive probe failures before declaring Offline.
    pub offline_threshold: u32,
    /// Consecutive probe successes before declaring Online.
    pub online_threshold: u32,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            probe_interval: Duration::from_secs(30),
            probe_timeout: Duration::from_secs(5),
            offline_threshold: 2,
            online_threshold: 2,
        }
    }
}

/// Pure debounce state machine, separated from the probe loop so the
/// flapping rules are testable without a runtime.
#[derive(Debug)]
pub(crate) struct Debouncer {
    state: ConnectionState,
    consecutive_failures: u32,
    consecutive_successes: u32,
    offline_threshold: u32,
    online_threshold: u32,
}

impl Debouncer {
    pub(crate) fn new(initial: ConnectionState, config: &MonitorConfig) -> Self {
        Self {
            state: initial,
            consecutive_failures: 0,
            consecutive_successes: 0,
            offline_threshold: config.offline_threshold.max(1),
            online_threshold: config.online_threshold.max(1),
        }
    }

    pub(crate) const fn state(&self) -> ConnectionState {
        self.state
    }

    /// Record one probe outcome; returns the new state when it transitions.
    pub(crate) fn record(&mut self, success: bool) -> Option<ConnectionState> {
        if success {
            self.consecutive_failures = 0;
            self.consecutive_successes += 1;
            if self.state == ConnectionState::Offline
                && self.consecutive_successes >= self.online_threshold
            {
                self.state = ConnectionState::Online;
                return Some(self.state);
            }
        } else {
            self.consecutive_successes = 0;
            self.consecutive_failures += 1;
            if self.state == ConnectionState::Online
                && self.consecutive_failures >= self.offline_threshold
            {
                self.state = ConnectionState::Offline;
                return Some(self.state);
            }
        }
        None
    }
}

/// Tracks backend reachability with periodic probes and debounced
/// transitions. One instance per engine, explicitly constructed and shut
/// down; never a global.
pub struct ConnectionMonitor {
    state_rx: watch::Receiver<ConnectionState>,
    transitions: broadcast::Sender<ConnectionState>,
    shutdown: watch::Sender<bool>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl ConnectionMonitor {
    /// Spawn the probe loop. The monitor starts optimistic: Online until
    /// probes prove otherwise.
    #[must_use]
    pub fn start(remote: Arc<dyn RemoteCaseService>, config: MonitorConfig) -> Self {
        let (state_tx, state_rx) = watch::channel(ConnectionState::Online);
        let (transitions, _) = broadcast::channel(16);
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);

        let transitions_tx = transitions.clone();
        let handle = tokio::spawn(async move {
            let mut debouncer = Debouncer::new(ConnectionState::Online, &config);
            let mut interval = tokio::time::interval(config.probe_interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = shutdown_rx.changed() => break,
                    _ = interval.tick() => {
                        let success = matches!(
                            tokio::time::timeout(config.probe_timeout, remote.health_check()).await,
                            Ok(Ok(()))
                        );

                        if let Some(new_state) = debouncer.record(success) {
                            match new_state {
                                ConnectionState::Online => info!("backend reachable again"),
                                ConnectionState::Offline => warn!("backend unreachable"),
                            }
                            let _ = state_tx.send(new_state);
                            let _ = transitions_tx.send(new_state);
                        }
                    }
                }
            }
        });

        Self {
            state_rx,
            transitions,
            shutdown: shutdown_tx,
            handle: Mutex::new(Some(handle)),
        }
    }

    #[must_use]
    pub fn state(&self) -> ConnectionState {
        *self.state_rx.borrow()
    }

    /// Current-state channel for callers that poll.
    #[must_use]
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_rx.clone()
    }

    /// Transition events; the sync engine subscribes to the offline->online
    /// edge to drain immediately instead of waiting for its timer.
    #[must_use]
    pub fn subscribe_transitions(&self) -> broadcast::Receiver<ConnectionState> {
        self.transitions.subscribe()
    }

    pub async fn shutdown(&self) {
        let _ = self.shutdown.send(true);
        if let Some(handle) = self.handle.lock().await.take() {
            let _ = handle.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{
        AmendmentEntry, AmendmentPatch, Case, CaseFilter, CaseId, CaseStatus, Country, NewCaseData,
        UserId,
    };
    use crate::remote::{RemoteCase, RemoteError};
    use std::sync::atomic::{AtomicBool, Ordering};

    fn config(offline: u32, online: u32) -> MonitorConfig {
        MonitorConfig {
            offline_threshold: offline,
            online_threshold: online,
            ..Default::default()
        }
    }

    #[test]
    fn single_dropped_probe_does_not_flap() {
        let mut debouncer = Debouncer::new(ConnectionState::Online, &config(2, 2));

        assert_eq!(debouncer.record(false), None);
        assert_eq!(debouncer.state(), ConnectionState::Online);

        // A success resets the failure streak.
        assert_eq!(debouncer.record(true), None);
        assert_eq!(debouncer.record(false), None);
        assert_eq!(debouncer.state(), ConnectionState::Online);
    }

    #[test]
    fn consecutive_failures_reach_offline() {
        let mut debouncer = Debouncer::new(ConnectionState::Online, &config(3, 2));

        assert_eq!(debouncer.record(false), None);
        assert_eq!(debouncer.record(false), None);
        assert_eq!(debouncer.record(false), Some(ConnectionState::Offline));
        // Already offline; further failures are not transitions.
        assert_eq!(debouncer.record(false), None);
    }

    #[test]
    fn recovery_needs_consecutive_successes() {
        let mut debouncer = Debouncer::new(ConnectionState::Offline, &config(2, 3));

        assert_eq!(debouncer.record(true), None);
        assert_eq!(debouncer.record(true), None);
        assert_eq!(debouncer.record(false), None);
        // The failure broke the streak.
        assert_eq!(debouncer.record(true), None);
        assert_eq!(debouncer.record(true), None);
        assert_eq!(debouncer.record(true), Some(ConnectionState::Online));
    }

    struct SwitchableRemote {
        online: AtomicBool,
    }

    #[async_trait::async_trait]
    impl RemoteCaseService for SwitchableRemote {
        async fn create_case(&self, _payload: &NewCaseData) -> Result<RemoteCase, RemoteError> {
            Err(RemoteError::network("unused"))
        }

        async fn allocate_reference(&self, _country: &Country) -> Result<String, RemoteError> {
            Err(RemoteError::network("unused"))
        }

        async fn update_status(
            &self,
            _id: &CaseId,
            _status: CaseStatus,
            _actor: &UserId,
            _details: Option<&str>,
            _attachments: &[String],
        ) -> Result<(), RemoteError> {
            Err(RemoteError::network("unused"))
        }

        async fn amend(
            &self,
            _id: &CaseId,
            _patch: &AmendmentPatch,
            _actor: &UserId,
        ) -> Result<AmendmentEntry, RemoteError> {
            Err(RemoteError::network("unused"))
        }

        async fn list_cases(&self, _filter: &CaseFilter) -> Result<Vec<Case>, RemoteError> {
            Err(RemoteError::network("unused"))
        }

        async fn health_check(&self) -> Result<(), RemoteError> {
            if self.online.load(Ordering::SeqCst) {
                Ok(())
            } else {
                Err(RemoteError::network("unreachable"))
            }
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn monitor_emits_debounced_transitions() {
        let remote = Arc::new(SwitchableRemote {
            online: AtomicBool::new(false),
        });
        let monitor = ConnectionMonitor::start(
            remote.clone(),
            MonitorConfig {
                probe_interval: Duration::from_millis(10),
                probe_timeout: Duration::from_millis(50),
                offline_threshold: 2,
                online_threshold: 2,
            },
        );
        let mut transitions = monitor.subscribe_transitions();

        let first = tokio::time::timeout(Duration::from_secs(2), transitions.recv())
            .await
            .expect("expected offline transition")
            .unwrap();
        assert_eq!(first, ConnectionState::Offline);
        assert_eq!(monitor.state(), ConnectionState::Offline);

        remote.online.store(true, Ordering::SeqCst);
        let second = tokio::time::timeout(Duration::from_secs(2), transitions.recv())
            .await
            .expect("expected online transition")
            .unwrap();
        assert_eq!(second, ConnectionState::Online);

        monitor.shutdown().await;
    }
}
