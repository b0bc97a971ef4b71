//! Process-wide fan-out of tracker events.
//!
//! Backed by a broadcast channel: producers never wait on subscribers. A subscriber that
//! falls more than `capacity` events behind skips ahead and observes a gap.

use tokio::sync::broadcast;
use tokio::sync::broadcast::error::{RecvError, TryRecvError};
use tracing::{debug, warn};

use crate::types::{TrackerEvent, TrackerType};

/// Which events a subscription receives.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum EventFilter {
    #[default]
    All,
    Tracker(String),
    Type(TrackerType),
}

impl EventFilter {
    pub fn matches(&self, event: &TrackerEvent) -> bool {
        match self {
            EventFilter::All => true,
            EventFilter::Tracker(id) => &event.tracker_id == id,
            EventFilter::Type(t) => event.tracker_type == *t,
        }
    }
}

#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<TrackerEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Publish an event; returns how many subscribers it reached.
    pub fn publish(&self, event: TrackerEvent) -> usize {
        match self.sender.send(event) {
            Ok(n) => n,
            Err(_) => {
                debug!("No subscribers; event dropped");
                0
            }
        }
    }

    /// Subscribe with a filter. Dropping the subscription unsubscribes.
    pub fn subscribe(&self, filter: EventFilter) -> Subscription {
        Subscription {
            receiver: self.sender.subscribe(),
            filter,
            missed: 0,
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

pub struct Subscription {
    receiver: broadcast::Receiver<TrackerEvent>,
    filter: EventFilter,
    missed: u64,
}

impl Subscription {
    /// Next matching event, or `None` once the bus is gone.
    pub async fn recv(&mut self) -> Option<TrackerEvent> {
        loop {
            match self.receiver.recv().await {
                Ok(event) if self.filter.matches(&event) => return Some(event),
                Ok(_) => {}
                Err(RecvError::Lagged(n)) => self.record_gap(n),
                Err(RecvError::Closed) => return None,
            }
        }
    }

    /// Next matching event already queued, without waiting.
    pub fn try_recv(&mut self) -> Option<TrackerEvent> {
        loop {
            match self.receiver.try_recv() {
                Ok(event) if self.filter.matches(&event) => return Some(event),
                Ok(_) => {}
                Err(TryRecvError::Lagged(n)) => self.record_gap(n),
                Err(TryRecvError::Empty | TryRecvError::Closed) => return None,
            }
        }
    }

    /// Events skipped because this subscriber fell behind.
    pub fn missed(&self) -> u64 {
        self.missed
    }

    pub fn filter(&self) -> &EventFilter {
        &self.filter
    }

    fn record_gap(&mut self, n: u64) {
        self.missed += n;
        warn!(skipped = n, total = self.missed, "Subscriber lagged; events skipped");
    }
}
