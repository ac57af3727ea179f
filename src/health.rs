//! Health Monitoring
//!
//! Background liveness probing of the model host with adaptive cadence.
//! Consecutive failures stretch the probe interval geometrically up to a
//! ceiling; a success resets it. Transitions from unavailable to available
//! produce a throttled, one-shot notification. The exception is the very
//! first successful probe after startup, which changes nothing from the
//! user's point of view and stays silent.
//!
//! The monitor never surfaces errors: probe failures become state (the
//! degraded flag) that the core consults before generating predictions.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::config::HealthConfig;
use crate::model_client::ModelHostClient;

const MAX_PENDING_NOTIFICATIONS: usize = 4;

/// User-facing availability notification
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthNotification {
    pub kind: NotificationKind,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NotificationKind {
    /// The host recovered after a failure streak
    Recovered,
}

/// Probe bookkeeping; pure state machine, driven by `record_probe`
#[derive(Debug)]
pub struct HealthState {
    config: HealthConfig,
    available: bool,
    ever_succeeded: bool,
    failure_streak: u32,
    current_interval: Duration,
    last_notification: Option<DateTime<Utc>>,
    pending: VecDeque<HealthNotification>,
    probes: u64,
}

impl HealthState {
    pub fn new(config: HealthConfig) -> Self {
        let interval = Duration::from_secs(config.check_interval_secs);
        Self {
            config,
            available: false,
            ever_succeeded: false,
            failure_streak: 0,
            current_interval: interval,
            last_notification: None,
            pending: VecDeque::new(),
            probes: 0,
        }
    }

    /// Fold one probe result into the state. Returns the notification the
    /// transition produced, if any; the notification is also queued for
    /// later polling.
    pub fn record_probe(&mut self, success: bool, now: DateTime<Utc>) -> Option<HealthNotification> {
        self.probes += 1;
        let was_available = self.available;
        let first_success = success && !self.ever_succeeded;

        if success {
            self.available = true;
            self.ever_succeeded = true;
            self.failure_streak = 0;
            self.current_interval = Duration::from_secs(self.config.check_interval_secs);
        } else {
            self.available = false;
            self.failure_streak += 1;
            let scaled =
                self.current_interval.as_secs_f64() * self.config.backoff_factor;
            self.current_interval = Duration::from_secs_f64(
                scaled.min(self.config.max_interval_secs as f64),
            );
        }

        // Notify only on a real recovery: not the first success after
        // startup, not while already available, and throttled
        if success && !was_available && !first_success && self.notification_due(now) {
            let notification = HealthNotification {
                kind: NotificationKind::Recovered,
                at: now,
            };
            self.last_notification = Some(now);
            if self.pending.len() >= MAX_PENDING_NOTIFICATIONS {
                self.pending.pop_front();
            }
            self.pending.push_back(notification.clone());
            return Some(notification);
        }
        None
    }

    fn notification_due(&self, now: DateTime<Utc>) -> bool {
        match self.last_notification {
            Some(last) => {
                now.signed_duration_since(last)
                    >= ChronoDuration::seconds(self.config.notify_throttle_secs)
            }
            None => true,
        }
    }

    pub fn is_available(&self) -> bool {
        self.available
    }

    /// Degraded while the last probe failed
    pub fn is_degraded(&self) -> bool {
        self.probes > 0 && !self.available
    }

    pub fn failure_streak(&self) -> u32 {
        self.failure_streak
    }

    pub fn current_interval(&self) -> Duration {
        self.current_interval
    }

    pub fn take_notification(&mut self) -> Option<HealthNotification> {
        self.pending.pop_front()
    }
}

/// Background prober over a shared [`HealthState`]
pub struct HealthMonitor {
    state: Arc<Mutex<HealthState>>,
    client: Arc<ModelHostClient>,
    cancel: CancellationToken,
}

impl HealthMonitor {
    pub fn new(config: HealthConfig, client: Arc<ModelHostClient>, cancel: CancellationToken) -> Self {
        Self {
            state: Arc::new(Mutex::new(HealthState::new(config))),
            client,
            cancel,
        }
    }

    pub fn state(&self) -> Arc<Mutex<HealthState>> {
        self.state.clone()
    }

    pub fn is_available(&self) -> bool {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).is_available()
    }

    pub fn is_degraded(&self) -> bool {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).is_degraded()
    }

    pub fn take_notification(&self) -> Option<HealthNotification> {
        self.state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take_notification()
    }

    /// Spawn the probe loop. The task runs until the cancellation token
    /// trips; an immediate first probe primes the availability flag.
    pub fn spawn(&self) -> tokio::task::JoinHandle<()> {
        let state = self.state.clone();
        let client = self.client.clone();
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            loop {
                let success = client.available().await;
                {
                    let mut state = state.lock().unwrap_or_else(|e| e.into_inner());
                    state.record_probe(success, Utc::now());
                    log::debug!(
                        "health probe: available={}, next in {:?}",
                        success,
                        state.current_interval()
                    );
                }
                let interval = {
                    let state = state.lock().unwrap_or_else(|e| e.into_inner());
                    state.current_interval()
                };
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {}
                }
            }
            log::debug!("health monitor stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state() -> HealthState {
        HealthState::new(HealthConfig::default())
    }

    #[test]
    fn test_first_success_is_silent() {
        let mut s = state();
        let note = s.record_probe(true, Utc::now());
        assert!(note.is_none());
        assert!(s.is_available());
        assert!(!s.is_degraded());
    }

    #[test]
    fn test_failures_back_off_geometrically() {
        let mut s = state();
        let now = Utc::now();
        assert_eq!(s.current_interval(), Duration::from_secs(30));

        s.record_probe(false, now);
        assert_eq!(s.current_interval(), Duration::from_secs(45));
        s.record_probe(false, now);
        assert_eq!(s.current_interval().as_secs_f64().round() as u64, 68);
        assert_eq!(s.failure_streak(), 2);
        assert!(s.is_degraded());
    }

    #[test]
    fn test_backoff_hits_ceiling() {
        let mut s = state();
        let now = Utc::now();
        for _ in 0..20 {
            s.record_probe(false, now);
        }
        assert_eq!(s.current_interval(), Duration::from_secs(300));
    }

    #[test]
    fn test_recovery_resets_interval_and_notifies_once() {
        let mut s = state();
        let now = Utc::now();
        s.record_probe(true, now);
        for _ in 0..3 {
            s.record_probe(false, now);
        }
        assert!(s.is_degraded());

        let note = s.record_probe(true, now);
        assert_eq!(note.map(|n| n.kind), Some(NotificationKind::Recovered));
        assert_eq!(s.current_interval(), Duration::from_secs(30));
        assert!(!s.is_degraded());

        // A steady host produces no further notifications
        assert!(s.record_probe(true, now).is_none());
    }

    #[test]
    fn test_notification_throttled() {
        let mut s = state();
        let t0 = Utc::now();
        s.record_probe(true, t0);

        // First recovery notifies
        s.record_probe(false, t0);
        assert!(s.record_probe(true, t0).is_some());

        // A flap two minutes later stays silent
        let t1 = t0 + ChronoDuration::minutes(2);
        s.record_probe(false, t1);
        assert!(s.record_probe(true, t1).is_none());

        // Past the throttle window it notifies again
        let t2 = t1 + ChronoDuration::minutes(11);
        s.record_probe(false, t2);
        assert!(s.record_probe(true, t2).is_some());
    }

    #[test]
    fn test_take_notification_drains_queue() {
        let mut s = state();
        let now = Utc::now();
        s.record_probe(true, now);
        s.record_probe(false, now);
        s.record_probe(true, now);

        assert!(s.take_notification().is_some());
        assert!(s.take_notification().is_none());
    }

    #[tokio::test]
    async fn test_monitor_task_stops_on_cancel() {
        let config = Arc::new(crate::config::ConfigStore::default());
        let client = Arc::new(ModelHostClient::new(config));
        let cancel = CancellationToken::new();
        let monitor = HealthMonitor::new(HealthConfig::default(), client, cancel.clone());

        let handle = monitor.spawn();
        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("monitor should stop promptly")
            .unwrap();
    }
}
