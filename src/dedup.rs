use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Message ids seen within the last `ttl`.
///
/// A single mutex guards the map, so `check_and_mark` and the janitor's
/// sweep never interleave.
pub struct DedupCache {
    ttl: Duration,
    seen: Mutex<HashMap<String, Instant>>,
}

impl DedupCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            seen: Mutex::new(HashMap::new()),
        }
    }

    /// Returns true if `message_id` was already seen within the TTL.
    /// Otherwise records it as seen now and returns false.
    pub async fn check_and_mark(&self, message_id: &str) -> bool {
        let now = Instant::now();
        let mut seen = self.seen.lock().await;

        if let Some(first_seen) = seen.get(message_id) {
            if now.duration_since(*first_seen) < self.ttl {
                return true;
            }
        }

        seen.insert(message_id.to_string(), now);
        false
    }

    /// Remove every record at least `ttl` old. Returns how many were evicted.
    pub async fn sweep(&self) -> usize {
        let now = Instant::now();
        let mut seen = self.seen.lock().await;
        let before = seen.len();
        seen.retain(|_, first_seen| now.duration_since(*first_seen) < self.ttl);
        before - seen.len()
    }

    pub async fn len(&self) -> usize {
        self.seen.lock().await.len()
    }

    /// Start the janitor: sweeps every `period` until `shutdown` fires.
    pub fn spawn_janitor(
        self: Arc<Self>,
        period: Duration,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            // First tick of `interval` is immediate; start one period out.
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            info!(
                "Dedup janitor started (ttl={}s, period={}s)",
                self.ttl.as_secs(),
                period.as_secs()
            );

            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        let evicted = self.sweep().await;
                        debug!(
                            "Dedup sweep evicted {} record(s), {} remaining",
                            evicted,
                            self.len().await
                        );
                    }
                }
            }

            info!("Dedup janitor stopped");
        })
    }
}
