//! Timer management for the production runner.
//!
//! Timers are spawned as tokio tasks and can be cancelled. All timer slots
//! are one-shot; re-arming a slot replaces the previous task.

use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace};
use trellis_core::{Event, TimerId};

/// Convert a TimerId to the corresponding Event.
fn timer_event(id: TimerId) -> Event {
    match id {
        TimerId::Commit(height) => Event::CommitTimeout { height },
        TimerId::Blame => Event::BlameTimeout,
        TimerId::ViewTransition => Event::ViewTransitionTimeout,
        TimerId::Status => Event::StatusTimeout,
    }
}

/// Manages timers for the production runner.
///
/// Each timer is a tokio task that sleeps for the specified duration and
/// then sends the appropriate timer event to the event channel.
pub struct TimerManager {
    /// Active timers (id -> task handle).
    timers: HashMap<TimerId, JoinHandle<()>>,
    /// Event sender for timer fires.
    event_tx: mpsc::Sender<Event>,
}

impl TimerManager {
    /// Create a new timer manager.
    pub fn new(event_tx: mpsc::Sender<Event>) -> Self {
        Self {
            timers: HashMap::new(),
            event_tx,
        }
    }

    /// Set a timer that will fire after the given duration.
    ///
    /// If a timer with the same ID already exists, it is cancelled first.
    pub fn set_timer(&mut self, id: TimerId, duration: Duration) {
        self.cancel_timer(id);

        let event_tx = self.event_tx.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(duration).await;
            trace!(?id, "timer fired");
            let _ = event_tx.send(timer_event(id)).await;
        });

        self.timers.insert(id, handle);
        debug!(?id, ?duration, "timer set");
    }

    /// Cancel a timer.
    ///
    /// If the timer doesn't exist or has already fired, this is a no-op.
    pub fn cancel_timer(&mut self, id: TimerId) {
        if let Some(handle) = self.timers.remove(&id) {
            handle.abort();
            debug!(?id, "timer cancelled");
        }
    }

    /// Cancel every armed commit timer (view transition).
    pub fn cancel_commit_timers(&mut self) {
        let armed: Vec<TimerId> = self
            .timers
            .keys()
            .filter(|id| matches!(id, TimerId::Commit(_)))
            .copied()
            .collect();
        for id in armed {
            self.cancel_timer(id);
        }
    }

    /// Cancel all timers.
    ///
    /// Called during shutdown.
    pub fn cancel_all(&mut self) {
        for (id, handle) in self.timers.drain() {
            handle.abort();
            trace!(?id, "timer cancelled (shutdown)");
        }
    }

    /// Get the number of active timers.
    pub fn active_count(&self) -> usize {
        self.timers.len()
    }
}

impl Drop for TimerManager {
    fn drop(&mut self) {
        self.cancel_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use trellis_types::BlockHeight;

    #[tokio::test]
    async fn timer_fires() {
        let (event_tx, mut event_rx) = mpsc::channel(10);
        let mut manager = TimerManager::new(event_tx);

        manager.set_timer(TimerId::Blame, Duration::from_millis(10));

        let event = tokio::time::timeout(Duration::from_millis(200), event_rx.recv())
            .await
            .expect("timeout")
            .expect("channel closed");
        assert!(matches!(event, Event::BlameTimeout));
    }

    #[tokio::test]
    async fn cancelled_timer_does_not_fire() {
        let (event_tx, mut event_rx) = mpsc::channel(10);
        let mut manager = TimerManager::new(event_tx);

        manager.set_timer(TimerId::Status, Duration::from_millis(50));
        manager.cancel_timer(TimerId::Status);

        let result = tokio::time::timeout(Duration::from_millis(150), event_rx.recv()).await;
        assert!(result.is_err(), "timer should have been cancelled");
    }

    #[tokio::test]
    async fn rearming_replaces_the_previous_timer() {
        let (event_tx, mut event_rx) = mpsc::channel(10);
        let mut manager = TimerManager::new(event_tx);

        manager.set_timer(TimerId::Blame, Duration::from_millis(500));
        manager.set_timer(TimerId::Blame, Duration::from_millis(10));

        let event = tokio::time::timeout(Duration::from_millis(200), event_rx.recv())
            .await
            .expect("the short timer should fire")
            .expect("channel closed");
        assert!(matches!(event, Event::BlameTimeout));
        assert!(event_rx.try_recv().is_err(), "only one fire");
    }

    #[tokio::test]
    async fn commit_timers_cancel_as_a_group() {
        let (event_tx, mut event_rx) = mpsc::channel(10);
        let mut manager = TimerManager::new(event_tx);

        manager.set_timer(TimerId::Commit(BlockHeight(1)), Duration::from_millis(20));
        manager.set_timer(TimerId::Commit(BlockHeight(2)), Duration::from_millis(20));
        manager.set_timer(TimerId::Blame, Duration::from_millis(30));
        assert_eq!(manager.active_count(), 3);

        manager.cancel_commit_timers();
        assert_eq!(manager.active_count(), 1);

        let event = tokio::time::timeout(Duration::from_millis(200), event_rx.recv())
            .await
            .expect("blame timer should survive")
            .expect("channel closed");
        assert!(matches!(event, Event::BlameTimeout));
    }
}
