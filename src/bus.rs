//! Status distribution bus.
//!
//! The wire protocol engine that actually carries status PVs across the
//! network is an external collaborator; the service and the client-side
//! status manager only speak to this trait. `InProcessBus` is the loopback
//! implementation used by the service itself and by tests.
//!
//! Topics retain their last value: a subscriber joining after N updates
//! observes the retained value immediately or a newer one, never an older
//! one.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::watch;

use crate::status::StatusValue;

/// A live subscription to one status PV.
pub struct Subscription {
    rx: watch::Receiver<Option<StatusValue>>,
    primed: bool,
}

impl Subscription {
    /// Wait for the next value. The first call yields the retained value if
    /// one exists; later calls wait for publishes. `None` means the topic
    /// is gone.
    pub async fn next(&mut self) -> Option<StatusValue> {
        if !self.primed {
            self.primed = true;
            let current = self.rx.borrow_and_update().clone();
            if let Some(v) = current {
                return Some(v);
            }
        }
        loop {
            if self.rx.changed().await.is_err() {
                return None;
            }
            let v = self.rx.borrow_and_update().clone();
            if let Some(v) = v {
                return Some(v);
            }
        }
    }

    /// The retained value, if any, without waiting.
    pub fn latest(&self) -> Option<StatusValue> {
        self.rx.borrow().clone()
    }
}

/// Pub/sub carrier for certificate status values.
pub trait StatusBus: Send + Sync {
    /// Publish a value on a topic, retaining it for late subscribers.
    fn publish(&self, pv: &str, value: StatusValue);

    /// The retained value of a topic, if any.
    fn latest(&self, pv: &str) -> Option<StatusValue>;

    /// Open a subscription to a topic. Subscribing to a topic that has not
    /// yet published is allowed; the first value arrives when it does.
    fn subscribe(&self, pv: &str) -> Subscription;
}

/// In-process loopback bus with per-topic retained values.
#[derive(Default)]
pub struct InProcessBus {
    topics: Mutex<HashMap<String, Arc<watch::Sender<Option<StatusValue>>>>>,
}

impl InProcessBus {
    pub fn new() -> Self {
        InProcessBus::default()
    }

    fn sender(&self, pv: &str) -> Arc<watch::Sender<Option<StatusValue>>> {
        let mut topics = self.topics.lock().expect("bus lock poisoned");
        Arc::clone(
            topics
                .entry(pv.to_string())
                .or_insert_with(|| Arc::new(watch::channel(None).0)),
        )
    }
}

impl StatusBus for InProcessBus {
    fn publish(&self, pv: &str, value: StatusValue) {
        self.sender(pv).send_replace(Some(value));
    }

    fn latest(&self, pv: &str) -> Option<StatusValue> {
        let topics = self.topics.lock().expect("bus lock poisoned");
        topics.get(pv).and_then(|tx| tx.borrow().clone())
    }

    fn subscribe(&self, pv: &str) -> Subscription {
        Subscription {
            rx: self.sender(pv).subscribe(),
            primed: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::status::{CertStatus, CertificateStatus, StatusValue};

    fn value(serial: u64, status: CertStatus) -> StatusValue {
        let mut cs = CertificateStatus::unknown();
        cs.status = status;
        cs.ocsp_status = status.ocsp_status();
        StatusValue::new(serial, &cs)
    }

    #[tokio::test]
    async fn test_retained_value_reaches_late_subscriber() {
        let bus = InProcessBus::new();
        bus.publish("CERT:STATUS:ab:01", value(1, CertStatus::PendingApproval));
        bus.publish("CERT:STATUS:ab:01", value(1, CertStatus::Revoked));

        let mut sub = bus.subscribe("CERT:STATUS:ab:01");
        let first = sub.next().await.unwrap();
        assert_eq!(first.status, CertStatus::Revoked);
    }

    #[tokio::test]
    async fn test_subscriber_sees_updates_in_order() {
        let bus = InProcessBus::new();
        let mut sub = bus.subscribe("CERT:STATUS:ab:02");
        assert!(sub.latest().is_none());

        bus.publish("CERT:STATUS:ab:02", value(2, CertStatus::Valid));
        assert_eq!(sub.next().await.unwrap().status, CertStatus::Valid);

        bus.publish("CERT:STATUS:ab:02", value(2, CertStatus::Expired));
        assert_eq!(sub.next().await.unwrap().status, CertStatus::Expired);
    }

    #[tokio::test]
    async fn test_topics_are_independent() {
        let bus = InProcessBus::new();
        bus.publish("CERT:STATUS:ab:03", value(3, CertStatus::Valid));
        assert!(bus.latest("CERT:STATUS:ab:04").is_none());
        assert_eq!(
            bus.latest("CERT:STATUS:ab:03").unwrap().status,
            CertStatus::Valid
        );
    }
}
