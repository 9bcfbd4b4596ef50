//! Platform hooks that trigger sweeps: connectivity changes and explicit wake
//! signals. The host adapter drives them with [`Scheduler::set_online`] and
//! [`Scheduler::wake`]; the outbox logic only registers handlers.

use std::future::Future;
use std::sync::Arc;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::debug;

#[derive(Clone)]
pub struct Scheduler {
    online: Arc<watch::Sender<bool>>,
    wake: broadcast::Sender<()>,
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("online", &self.is_online())
            .finish()
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new(true)
    }
}

impl Scheduler {
    pub fn new(online: bool) -> Self {
        let (online, _) = watch::channel(online);
        let (wake, _) = broadcast::channel(16);
        Self {
            online: Arc::new(online),
            wake,
        }
    }

    pub fn is_online(&self) -> bool {
        *self.online.borrow()
    }

    pub fn set_online(&self, online: bool) {
        let was = self.online.send_replace(online);
        if was != online {
            debug!(online, "connectivity changed");
        }
    }

    pub fn wake(&self) {
        // Nobody listening is fine.
        let _ = self.wake.send(());
    }

    /// Receiver of offline→online transitions, for callers running their own loop.
    pub fn connectivity(&self) -> watch::Receiver<bool> {
        self.online.subscribe()
    }

    /// Run `handler` on every offline→online transition.
    pub fn on_connectivity_restored<F, Fut>(&self, handler: F) -> JoinHandle<()>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let mut rx = self.online.subscribe();
        // Sampled before spawning so a change racing the task start is not lost.
        let mut was_online = *rx.borrow_and_update();
        tokio::spawn(async move {
            while rx.changed().await.is_ok() {
                let now = *rx.borrow_and_update();
                if now && !was_online {
                    handler().await;
                }
                was_online = now;
            }
        })
    }

    /// Run `handler` on every wake signal. Signals that arrive while a handler
    /// is still running are coalesced.
    pub fn on_wake<F, Fut>(&self, handler: F) -> JoinHandle<()>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let mut rx = self.wake.subscribe();
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(()) | Err(broadcast::error::RecvError::Lagged(_)) => {
                        while rx.try_recv().is_ok() {}
                        handler().await;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    async fn wait_for(counter: &AtomicUsize, n: usize) {
        tokio::time::timeout(Duration::from_secs(2), async {
            while counter.load(Ordering::SeqCst) < n {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn connectivity_handler_runs_on_restore_only() {
        let scheduler = Scheduler::new(false);
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        let task = scheduler.on_connectivity_restored(move || {
            let h = h.clone();
            async move {
                h.fetch_add(1, Ordering::SeqCst);
            }
        });

        scheduler.set_online(true);
        wait_for(&hits, 1).await;
        // Going offline does not trigger anything.
        scheduler.set_online(false);
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        scheduler.set_online(true);
        wait_for(&hits, 2).await;
        assert!(scheduler.is_online());
        task.abort();
    }

    #[tokio::test]
    async fn wake_handler_runs() {
        let scheduler = Scheduler::default();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        let task = scheduler.on_wake(move || {
            let h = h.clone();
            async move {
                h.fetch_add(1, Ordering::SeqCst);
            }
        });
        scheduler.wake();
        wait_for(&hits, 1).await;
        task.abort();
    }
}
