use std::{sync::Arc, time::Duration};

use tokio::{sync::watch, task::JoinHandle, time::MissedTickBehavior};

use crate::models::sync::NetworkStatus;
use crate::services::api_client::AttemptApi;

/// Passive connectivity signal. The host feeds platform transitions in through
/// [`NetworkMonitor::set_online`]; consumers read or subscribe.
#[derive(Clone)]
pub struct NetworkMonitor {
    tx: Arc<watch::Sender<NetworkStatus>>,
}

impl NetworkMonitor {
    /// `initially_online` must be read from the platform at startup
    pub fn new(initially_online: bool) -> Self {
        let (tx, _rx) = watch::channel(NetworkStatus::from_online(initially_online));
        tracing::debug!("Network monitor started: online={}", initially_online);
        Self { tx: Arc::new(tx) }
    }

    pub fn is_online(&self) -> bool {
        self.tx.borrow().is_online()
    }

    pub fn status(&self) -> NetworkStatus {
        *self.tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<NetworkStatus> {
        self.tx.subscribe()
    }

    /// Returns true when the signal was an actual transition
    pub fn set_online(&self, online: bool) -> bool {
        let next = NetworkStatus::from_online(online);
        let changed = self.tx.send_if_modified(|current| {
            if *current == next {
                false
            } else {
                *current = next;
                true
            }
        });

        if changed {
            tracing::info!("Network status changed: {:?}", next);
        }
        changed
    }
}

/// Feeds a [`NetworkMonitor`] from periodic `/health` checks for hosts without
/// an OS connectivity signal.
pub struct HealthProbe;

impl HealthProbe {
    pub fn spawn(
        monitor: NetworkMonitor,
        api: Arc<dyn AttemptApi>,
        interval: Duration,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                ticker.tick().await;
                let online = match api.health_check().await {
                    Ok(()) => true,
                    Err(err) => {
                        tracing::debug!("Health probe failed: {}", err);
                        false
                    }
                };
                monitor.set_online(online);
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn initial_state_is_taken_from_host() {
        assert!(!NetworkMonitor::new(false).is_online());
        assert!(NetworkMonitor::new(true).is_online());
    }

    #[tokio::test]
    async fn subscribers_see_transitions_only() {
        let monitor = NetworkMonitor::new(false);
        let mut rx = monitor.subscribe();

        assert!(!monitor.set_online(false));
        assert!(!rx.has_changed().unwrap());

        assert!(monitor.set_online(true));
        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow_and_update(), NetworkStatus::Online);
        assert!(monitor.is_online());
    }

    #[tokio::test]
    async fn clones_share_state() {
        let monitor = NetworkMonitor::new(true);
        let other = monitor.clone();
        other.set_online(false);
        assert_eq!(monitor.status(), NetworkStatus::Offline);
    }
}
