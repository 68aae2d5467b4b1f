//! Deterministic ordering key for the global event queue.

use std::time::Duration;
use trellis_core::EventPriority;

/// Orders queued events by time, then priority, then insertion sequence.
///
/// The sequence number makes the ordering total: two events scheduled for
/// the same instant at the same priority run in insertion order, which is
/// what keeps a simulation reproducible.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct EventKey {
    /// Simulated delivery time.
    pub time: Duration,
    /// Priority class at that instant.
    pub priority: EventPriority,
    /// Insertion sequence for total ordering.
    pub seq: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn orders_by_time_then_priority_then_seq() {
        let early = EventKey {
            time: Duration::from_millis(1),
            priority: EventPriority::Client,
            seq: 9,
        };
        let later_internal = EventKey {
            time: Duration::from_millis(2),
            priority: EventPriority::Internal,
            seq: 0,
        };
        assert!(early < later_internal, "time dominates priority");

        let internal = EventKey {
            time: Duration::from_millis(2),
            priority: EventPriority::Internal,
            seq: 5,
        };
        let network = EventKey {
            time: Duration::from_millis(2),
            priority: EventPriority::Network,
            seq: 1,
        };
        assert!(internal < network, "priority dominates sequence");

        let first = EventKey {
            time: Duration::from_millis(2),
            priority: EventPriority::Network,
            seq: 1,
        };
        let second = EventKey {
            time: Duration::from_millis(2),
            priority: EventPriority::Network,
            seq: 2,
        };
        assert!(first < second, "sequence breaks ties");
    }
}
