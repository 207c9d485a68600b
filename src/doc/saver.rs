//! Debounced background persistence.
//!
//! A single task owns both save triggers: the fixed-interval tick, which
//! writes whenever the document is dirty, and the request path, which
//! coalesces a burst of accepted patches into one write after a quiet
//! window. Disk failures log and leave the dirty flag set so the next tick
//! retries.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, Notify};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error};

use super::store::DocumentStore;

/// Quiet window that collapses a burst of save requests into one write.
const DEBOUNCE: Duration = Duration::from_millis(500);

pub struct DocSaver {
    store: Arc<DocumentStore>,
    interval: Duration,
    kick: Notify,
    shutdown_tx: broadcast::Sender<()>,
}

impl DocSaver {
    pub fn new(store: Arc<DocumentStore>, interval: Duration) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            store,
            interval,
            kick: Notify::new(),
            shutdown_tx,
        }
    }

    /// Ask for a save soon. Bursts within the debounce window collapse into
    /// a single write.
    pub fn request_save(&self) {
        self.kick.notify_one();
    }

    /// Stop the save loop, cancelling any pending debounced save.
    pub fn stop(&self) {
        let _ = self.shutdown_tx.send(());
    }

    pub fn spawn(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        // Subscribe before spawning so a stop() racing the task startup is
        // not lost.
        let shutdown = self.shutdown_tx.subscribe();
        let saver = Arc::clone(self);
        tokio::spawn(async move { saver.run(shutdown).await })
    }

    async fn run(&self, mut shutdown: broadcast::Receiver<()>) {
        // First tick lands one full interval out; the initial state on disk
        // is whatever load() left there.
        let mut tick = tokio::time::interval_at(
            tokio::time::Instant::now() + self.interval,
            self.interval,
        );
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = tick.tick() => {
                    if self.store.is_dirty() {
                        self.save().await;
                    }
                }
                _ = self.kick.notified() => {
                    tokio::select! {
                        _ = tokio::time::sleep(DEBOUNCE) => {}
                        _ = shutdown.recv() => break,
                    }
                    if self.store.is_dirty() {
                        self.save().await;
                    }
                }
                _ = shutdown.recv() => break,
            }
        }
        debug!("save loop stopped");
    }

    async fn save(&self) {
        match self.store.save_async().await {
            Ok(()) => debug!(bytes = self.store.byte_len(), "document saved"),
            Err(e) => error!("document save failed: {e}"),
        }
    }
}
