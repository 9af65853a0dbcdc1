//! Admission control: may background work run right now?
//!
//! The [`AdmissionMonitor`] folds device capability, network class and power
//! state into an [`AdmissionStatus`] and broadcasts a payload-free
//! notification whenever that status changes. Subscribers re-read
//! [`AdmissionMonitor::status`] on receipt.

use crate::cancellation::CancellationToken;
use hevc_sweep_config::{AdmissionConfig, AssumedNetwork};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdmissionStatus {
    Allowed,
    HardwareIncapable,
    NetworkUnsuitable,
    PowerUnsuitable,
    NetworkAndPowerUnsuitable,
}

impl AdmissionStatus {
    pub fn is_allowed(&self) -> bool {
        *self == AdmissionStatus::Allowed
    }

    pub fn friendly(&self) -> &'static str {
        match self {
            AdmissionStatus::Allowed => "allowed",
            AdmissionStatus::HardwareIncapable => "'High Efficiency' not supported",
            AdmissionStatus::NetworkUnsuitable => "Paused: connect WiFi",
            AdmissionStatus::PowerUnsuitable => "Paused: connect power",
            AdmissionStatus::NetworkAndPowerUnsuitable => "Paused: connect WiFi and power",
        }
    }
}

impl std::fmt::Display for AdmissionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.friendly())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NetworkClass {
    Unmetered,
    Metered,
    Offline,
}

impl From<AssumedNetwork> for NetworkClass {
    fn from(assumed: AssumedNetwork) -> Self {
        match assumed {
            AssumedNetwork::Unmetered => NetworkClass::Unmetered,
            AssumedNetwork::Metered => NetworkClass::Metered,
            AssumedNetwork::Offline => NetworkClass::Offline,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PowerState {
    Unknown,
    Unplugged,
    Charging,
    Full,
}

impl PowerState {
    /// Anything but a known unplugged state counts as external power.
    pub fn is_external(&self) -> bool {
        *self != PowerState::Unplugged
    }
}

/// Source of the raw device conditions.
pub trait DeviceSignals: Send + Sync {
    /// Whether this host can produce the target encoding at all.
    fn can_encode(&self) -> bool;
    fn network(&self) -> NetworkClass;
    fn power(&self) -> PowerState;
}

/// Which conditions must hold for work to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdmissionPolicy {
    pub require_unmetered_network: bool,
    pub require_external_power: bool,
}

impl Default for AdmissionPolicy {
    fn default() -> Self {
        Self {
            require_unmetered_network: true,
            require_external_power: true,
        }
    }
}

impl From<&AdmissionConfig> for AdmissionPolicy {
    fn from(config: &AdmissionConfig) -> Self {
        Self {
            require_unmetered_network: config.require_unmetered_network,
            require_external_power: config.require_external_power,
        }
    }
}

impl AdmissionPolicy {
    pub fn evaluate(&self, can_encode: bool, network: NetworkClass, power: PowerState) -> AdmissionStatus {
        if !can_encode {
            return AdmissionStatus::HardwareIncapable;
        }
        let network_ok = match network {
            NetworkClass::Unmetered => true,
            NetworkClass::Metered => !self.require_unmetered_network,
            NetworkClass::Offline => false,
        };
        let power_ok = power.is_external() || !self.require_external_power;

        match (network_ok, power_ok) {
            (true, true) => AdmissionStatus::Allowed,
            (false, true) => AdmissionStatus::NetworkUnsuitable,
            (true, false) => AdmissionStatus::PowerUnsuitable,
            (false, false) => AdmissionStatus::NetworkAndPowerUnsuitable,
        }
    }
}

struct MonitorState {
    /// Evaluated once, on first use.
    can_encode: Option<bool>,
    status: AdmissionStatus,
}

/// Tracks the current [`AdmissionStatus`] and announces changes.
pub struct AdmissionMonitor {
    signals: Arc<dyn DeviceSignals>,
    policy: AdmissionPolicy,
    state: Mutex<MonitorState>,
    changes: broadcast::Sender<()>,
}

impl AdmissionMonitor {
    /// The monitor starts out `Allowed` and evaluates nothing until
    /// [`start`](Self::start).
    pub fn new(signals: Arc<dyn DeviceSignals>, policy: AdmissionPolicy) -> Self {
        let (changes, _) = broadcast::channel(16);
        Self {
            signals,
            policy,
            state: Mutex::new(MonitorState {
                can_encode: None,
                status: AdmissionStatus::Allowed,
            }),
            changes,
        }
    }

    /// First evaluation. Broadcasts only if the result is not `Allowed`.
    pub fn start(&self) -> AdmissionStatus {
        self.evaluate();
        self.status()
    }

    pub fn status(&self) -> AdmissionStatus {
        self.state.lock().status
    }

    /// Receive a notification on every status change. Dropping the receiver
    /// unsubscribes.
    pub fn subscribe(&self) -> broadcast::Receiver<()> {
        self.changes.subscribe()
    }

    /// Re-read network and power. Returns whether the status changed.
    pub fn notify_signal_changed(&self) -> bool {
        self.evaluate()
    }

    fn evaluate(&self) -> bool {
        let mut state = self.state.lock();
        let can_encode = *state.can_encode.get_or_insert_with(|| self.signals.can_encode());
        let status = self
            .policy
            .evaluate(can_encode, self.signals.network(), self.signals.power());

        if status == state.status {
            return false;
        }
        info!(from = ?state.status, to = ?status, "admission status changed");
        state.status = status;
        // No receivers is fine.
        let _ = self.changes.send(());
        true
    }

    /// Re-evaluate every `interval` until `token` is cancelled.
    pub async fn poll(self: Arc<Self>, interval: Duration, token: CancellationToken) {
        debug!(interval_ms = interval.as_millis() as u64, "admission poller started");
        let cancelled = token.cancelled();
        tokio::pin!(cancelled);
        loop {
            tokio::select! {
                _ = &mut cancelled => break,
                _ = tokio::time::sleep(interval) => {
                    self.notify_signal_changed();
                }
            }
        }
        debug!("admission poller stopped");
    }
}

impl std::fmt::Debug for AdmissionMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdmissionMonitor")
            .field("policy", &self.policy)
            .field("status", &self.status())
            .finish()
    }
}

/// Settable signals for tests and for hosts without probes.
#[derive(Debug)]
pub struct ManualSignals {
    can_encode: AtomicBool,
    network: Mutex<NetworkClass>,
    power: Mutex<PowerState>,
}

impl ManualSignals {
    pub fn new(can_encode: bool, network: NetworkClass, power: PowerState) -> Self {
        Self {
            can_encode: AtomicBool::new(can_encode),
            network: Mutex::new(network),
            power: Mutex::new(power),
        }
    }

    /// Capable, unmetered, charging.
    pub fn permissive() -> Self {
        Self::new(true, NetworkClass::Unmetered, PowerState::Charging)
    }

    pub fn set_can_encode(&self, can_encode: bool) {
        self.can_encode.store(can_encode, Ordering::SeqCst);
    }

    pub fn set_network(&self, network: NetworkClass) {
        *self.network.lock() = network;
    }

    pub fn set_power(&self, power: PowerState) {
        *self.power.lock() = power;
    }
}

impl DeviceSignals for ManualSignals {
    fn can_encode(&self) -> bool {
        self.can_encode.load(Ordering::SeqCst)
    }

    fn network(&self) -> NetworkClass {
        *self.network.lock()
    }

    fn power(&self) -> PowerState {
        *self.power.lock()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::sync::atomic::AtomicUsize;
    use tokio::sync::broadcast::error::TryRecvError;

    fn monitor(signals: &Arc<ManualSignals>) -> AdmissionMonitor {
        AdmissionMonitor::new(signals.clone(), AdmissionPolicy::default())
    }

    fn network_strategy() -> impl Strategy<Value = NetworkClass> {
        prop_oneof![
            Just(NetworkClass::Unmetered),
            Just(NetworkClass::Metered),
            Just(NetworkClass::Offline),
        ]
    }

    fn power_strategy() -> impl Strategy<Value = PowerState> {
        prop_oneof![
            Just(PowerState::Unknown),
            Just(PowerState::Unplugged),
            Just(PowerState::Charging),
            Just(PowerState::Full),
        ]
    }

    // The status is Allowed exactly when every required condition holds.
    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        #[test]
        fn prop_policy_allows_iff_conditions_hold(
            can_encode in any::<bool>(),
            network in network_strategy(),
            power in power_strategy(),
            require_unmetered_network in any::<bool>(),
            require_external_power in any::<bool>(),
        ) {
            let policy = AdmissionPolicy { require_unmetered_network, require_external_power };
            let status = policy.evaluate(can_encode, network, power);

            let network_ok = network == NetworkClass::Unmetered
                || (network == NetworkClass::Metered && !require_unmetered_network);
            let power_ok = power != PowerState::Unplugged || !require_external_power;

            prop_assert_eq!(status.is_allowed(), can_encode && network_ok && power_ok);
            if !can_encode {
                prop_assert_eq!(status, AdmissionStatus::HardwareIncapable);
            }
        }
    }

    #[test]
    fn test_friendly_strings() {
        assert_eq!(AdmissionStatus::Allowed.friendly(), "allowed");
        assert_eq!(
            AdmissionStatus::HardwareIncapable.friendly(),
            "'High Efficiency' not supported"
        );
        assert_eq!(AdmissionStatus::NetworkUnsuitable.friendly(), "Paused: connect WiFi");
        assert_eq!(AdmissionStatus::PowerUnsuitable.friendly(), "Paused: connect power");
        assert_eq!(
            AdmissionStatus::NetworkAndPowerUnsuitable.friendly(),
            "Paused: connect WiFi and power"
        );
    }

    #[test]
    fn test_status_ordering() {
        assert!(AdmissionStatus::Allowed < AdmissionStatus::HardwareIncapable);
        assert!(AdmissionStatus::PowerUnsuitable < AdmissionStatus::NetworkAndPowerUnsuitable);
    }

    #[test]
    fn test_start_allowed_does_not_broadcast() {
        let signals = Arc::new(ManualSignals::permissive());
        let monitor = monitor(&signals);
        let mut rx = monitor.subscribe();

        assert_eq!(monitor.start(), AdmissionStatus::Allowed);
        assert_eq!(rx.try_recv(), Err(TryRecvError::Empty));
    }

    #[test]
    fn test_start_not_allowed_broadcasts_once() {
        let signals = Arc::new(ManualSignals::new(true, NetworkClass::Offline, PowerState::Unplugged));
        let monitor = monitor(&signals);
        let mut rx = monitor.subscribe();

        assert_eq!(monitor.start(), AdmissionStatus::NetworkAndPowerUnsuitable);
        assert_eq!(rx.try_recv(), Ok(()));
        assert_eq!(rx.try_recv(), Err(TryRecvError::Empty));
    }

    #[test]
    fn test_only_changes_broadcast() {
        let signals = Arc::new(ManualSignals::permissive());
        let monitor = monitor(&signals);
        monitor.start();
        let mut rx = monitor.subscribe();

        assert!(!monitor.notify_signal_changed());
        signals.set_power(PowerState::Unplugged);
        assert!(monitor.notify_signal_changed());
        assert!(!monitor.notify_signal_changed());
        signals.set_power(PowerState::Full);
        assert!(monitor.notify_signal_changed());

        assert_eq!(rx.try_recv(), Ok(()));
        assert_eq!(rx.try_recv(), Ok(()));
        assert_eq!(rx.try_recv(), Err(TryRecvError::Empty));
        assert_eq!(monitor.status(), AdmissionStatus::Allowed);
    }

    #[test]
    fn test_simultaneous_signals_broadcast_once() {
        let signals = Arc::new(ManualSignals::permissive());
        let monitor = Arc::new(monitor(&signals));
        monitor.start();
        let mut rx = monitor.subscribe();

        signals.set_network(NetworkClass::Metered);
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let monitor = monitor.clone();
                std::thread::spawn(move || monitor.notify_signal_changed())
            })
            .collect();
        let changed = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|changed| *changed)
            .count();

        assert_eq!(changed, 1);
        assert_eq!(rx.try_recv(), Ok(()));
        assert_eq!(rx.try_recv(), Err(TryRecvError::Empty));
        assert_eq!(monitor.status(), AdmissionStatus::NetworkUnsuitable);
    }

    struct CountingSignals {
        capability_checks: AtomicUsize,
    }

    impl DeviceSignals for CountingSignals {
        fn can_encode(&self) -> bool {
            self.capability_checks.fetch_add(1, Ordering::SeqCst);
            true
        }
        fn network(&self) -> NetworkClass {
            NetworkClass::Unmetered
        }
        fn power(&self) -> PowerState {
            PowerState::Unknown
        }
    }

    #[test]
    fn test_capability_evaluated_once() {
        let signals = Arc::new(CountingSignals {
            capability_checks: AtomicUsize::new(0),
        });
        let monitor = AdmissionMonitor::new(signals.clone(), AdmissionPolicy::default());
        monitor.start();
        for _ in 0..5 {
            monitor.notify_signal_changed();
        }
        assert_eq!(signals.capability_checks.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_relaxed_policy_accepts_metered_and_unplugged() {
        let signals = Arc::new(ManualSignals::new(true, NetworkClass::Metered, PowerState::Unplugged));
        let policy = AdmissionPolicy::from(&AdmissionConfig {
            require_unmetered_network: false,
            require_external_power: false,
            ..AdmissionConfig::default()
        });
        let monitor = AdmissionMonitor::new(signals.clone(), policy);
        assert_eq!(monitor.start(), AdmissionStatus::Allowed);

        signals.set_network(NetworkClass::Offline);
        monitor.notify_signal_changed();
        assert_eq!(monitor.status(), AdmissionStatus::NetworkUnsuitable);
    }

    #[tokio::test]
    async fn test_poller_picks_up_changes_and_stops() {
        let signals = Arc::new(ManualSignals::permissive());
        let monitor = Arc::new(monitor(&signals));
        monitor.start();
        let mut rx = monitor.subscribe();

        let source = crate::cancellation::CancellationTokenSource::new();
        let poller = tokio::spawn(monitor.clone().poll(Duration::from_millis(5), source.token()));

        signals.set_power(PowerState::Unplugged);
        tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("poller should notice the change")
            .unwrap();
        assert_eq!(monitor.status(), AdmissionStatus::PowerUnsuitable);

        source.cancel();
        tokio::time::timeout(Duration::from_secs(1), poller)
            .await
            .expect("poller should stop on cancel")
            .unwrap();
    }

    #[tokio::test]
    async fn test_poller_holds_one_callback_on_its_token() {
        let signals = Arc::new(ManualSignals::permissive());
        let monitor = Arc::new(monitor(&signals));
        monitor.start();

        let source = crate::cancellation::CancellationTokenSource::new();
        let token = source.token();
        let poller = tokio::spawn(monitor.clone().poll(Duration::from_millis(1), token.clone()));

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(token.pending_callbacks(), 1);

        source.cancel();
        tokio::time::timeout(Duration::from_secs(1), poller)
            .await
            .expect("poller should stop on cancel")
            .unwrap();
        assert_eq!(token.pending_callbacks(), 0);
    }
}
