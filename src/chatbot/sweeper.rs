//! Periodic background task, used to expire idle sessions.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::MissedTickBehavior;

/// Runs a callback every `interval` until dropped.
///
/// The first run happens one full interval after creation.
pub struct Sweeper {
    /// Notify to cancel the loop
    cancel: Arc<Notify>,
}

impl Sweeper {
    pub fn new<F>(interval: Duration, task: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        let cancel = Arc::new(Notify::new());
        let cancel_clone = cancel.clone();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // interval() fires immediately; skip that one.
            ticker.tick().await;

            loop {
                tokio::select! {
                    biased;

                    _ = cancel_clone.notified() => break,
                    _ = ticker.tick() => task(),
                }
            }
        });

        Self { cancel }
    }
}

impl Drop for Sweeper {
    fn drop(&mut self) {
        self.cancel.notify_one();
    }
}
