//! Broadcast Router
//!
//! Recipient sets are resolved against the session registry while the world
//! lock is held, producing a [`Delivery`]. The delivery is pushed after the
//! lock is released. Each recipient gets the whole batch as one frame, in
//! order; a recipient that cannot take it is logged and skipped.

use tracing::{debug, warn};

use crate::network::protocol::Packet;
use crate::network::session::{DeliveryError, Outbox, SessionId, SessionRegistry};

/// Outcome of pushing one delivery.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeliveryReport {
    /// Recipients that accepted the batch.
    pub delivered: usize,
    /// Recipients that did not.
    pub failed: Vec<DeliveryError>,
}

impl DeliveryReport {
    /// Fold another report into this one.
    pub fn merge(&mut self, other: DeliveryReport) {
        self.delivered += other.delivered;
        self.failed.extend(other.failed);
    }
}

/// A batch bound to a snapshot of recipients.
#[derive(Debug, Clone)]
#[must_use = "a delivery does nothing until it is delivered"]
pub struct Delivery {
    recipients: Vec<Outbox>,
    batch: Vec<Packet>,
}

impl Delivery {
    /// Batch for an explicit recipient list.
    pub fn new(recipients: Vec<Outbox>, batch: Vec<Packet>) -> Self {
        Self { recipients, batch }
    }

    /// Batch for a single recipient.
    pub fn unicast(recipient: Outbox, batch: Vec<Packet>) -> Self {
        Self::new(vec![recipient], batch)
    }

    /// Nothing to send.
    pub fn empty() -> Self {
        Self::new(Vec::new(), Vec::new())
    }

    /// Recipient identities.
    pub fn recipients(&self) -> impl Iterator<Item = SessionId> + '_ {
        self.recipients.iter().map(Outbox::id)
    }

    /// Messages in send order.
    pub fn batch(&self) -> &[Packet] {
        &self.batch
    }

    /// Push the batch to every recipient.
    pub fn deliver(self) -> DeliveryReport {
        let mut report = DeliveryReport::default();
        if self.batch.is_empty() {
            return report;
        }

        let count = self.recipients.len();
        for outbox in self.recipients {
            match outbox.deliver(self.batch.clone()) {
                Ok(()) => report.delivered += 1,
                Err(e) => {
                    warn!("Delivery failed: {}", e);
                    report.failed.push(e);
                }
            }
        }

        debug!(
            "Delivered {} messages to {}/{} sessions",
            self.batch.len(),
            report.delivered,
            count
        );
        report
    }
}

/// Deliver a sequence of deliveries in order.
pub fn deliver_all(deliveries: impl IntoIterator<Item = Delivery>) -> DeliveryReport {
    let mut report = DeliveryReport::default();
    for delivery in deliveries {
        report.merge(delivery.deliver());
    }
    report
}

/// Every registered session not in `exclude`.
pub fn send_all(registry: &SessionRegistry, batch: Vec<Packet>, exclude: &[SessionId]) -> Delivery {
    Delivery::new(registry.outboxes_except(exclude), batch)
}

/// The registered sessions among `targets`, minus `exclude`.
pub fn send_selected<'a, I>(
    registry: &SessionRegistry,
    batch: Vec<Packet>,
    targets: I,
    exclude: &[SessionId],
) -> Delivery
where
    I: IntoIterator<Item = &'a SessionId>,
{
    Delivery::new(registry.outboxes_of(targets, exclude), batch)
}
