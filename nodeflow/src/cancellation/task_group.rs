//! A group of long-running worker tasks sharing one cancellation token.

use futures::future::join_all;
use parking_lot::Mutex;
use std::future::Future;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, error};

use super::CancellationToken;

/// Spawns workers and shuts them down together.
pub struct WorkerGroup {
    token: Arc<CancellationToken>,
    handles: Mutex<Vec<(String, JoinHandle<()>)>>,
}

impl WorkerGroup {
    /// Creates a group with a fresh token.
    #[must_use]
    pub fn new() -> Self {
        Self::with_token(Arc::new(CancellationToken::new()))
    }

    /// Creates a group driven by an existing token.
    #[must_use]
    pub fn with_token(token: Arc<CancellationToken>) -> Self {
        Self {
            token,
            handles: Mutex::new(Vec::new()),
        }
    }

    /// The group's token.
    #[must_use]
    pub fn token(&self) -> &Arc<CancellationToken> {
        &self.token
    }

    /// Spawns a worker. The closure receives the group's token.
    pub fn spawn<F, Fut>(&self, name: impl Into<String>, worker: F)
    where
        F: FnOnce(Arc<CancellationToken>) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let name = name.into();
        debug!(worker = %name, "Spawning worker");
        let handle = tokio::spawn(worker(self.token.clone()));
        self.handles.lock().push((name, handle));
    }

    /// Number of spawned workers not yet joined.
    #[must_use]
    pub fn len(&self) -> usize {
        self.handles.lock().len()
    }

    /// Returns true if no workers are running.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.handles.lock().is_empty()
    }

    /// Cancels the token and waits for every worker to stop. Returns the
    /// names of workers that panicked.
    pub async fn shutdown(&self, reason: &str) -> Vec<String> {
        self.token.cancel(reason);
        let (names, handles): (Vec<String>, Vec<JoinHandle<()>>) =
            std::mem::take(&mut *self.handles.lock()).into_iter().unzip();

        names
            .into_iter()
            .zip(join_all(handles).await)
            .filter_map(|(name, joined)| {
                let err = joined.err()?;
                error!(worker = %name, error = %err, "Worker did not stop cleanly");
                Some(name)
            })
            .collect()
    }
}

impl Default for WorkerGroup {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for WorkerGroup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerGroup")
            .field("cancelled", &self.token.is_cancelled())
            .field("workers", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn test_shutdown_stops_workers() {
        let group = WorkerGroup::new();
        let stopped = Arc::new(AtomicUsize::new(0));

        for i in 0..3 {
            let stopped = stopped.clone();
            group.spawn(format!("w{i}"), move |token| async move {
                token.cancelled().await;
                stopped.fetch_add(1, Ordering::SeqCst);
            });
        }
        assert_eq!(group.len(), 3);

        let failed = group.shutdown("test").await;
        assert!(failed.is_empty());
        assert_eq!(stopped.load(Ordering::SeqCst), 3);
        assert!(group.is_empty());
    }

    #[tokio::test]
    async fn test_panicking_worker_reported() {
        let group = WorkerGroup::new();
        group.spawn("boom", |_token| async move { panic!("worker panic") });

        let failed = group.shutdown("test").await;
        assert_eq!(failed, vec!["boom".to_string()]);
    }
}
