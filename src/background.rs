//! Registry for detached work that must finish before the process exits.

use std::future::Future;
use std::sync::Mutex;

use tokio::task::JoinSet;

/// Tracks spawned background tasks so shutdown can wait for them.
///
/// Task failures never reach the caller that spawned them; panics are logged
/// when the registry reaps or drains the task.
#[derive(Default)]
pub struct BackgroundTasks {
    tasks: Mutex<JoinSet<()>>,
}

impl BackgroundTasks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn spawn<F>(&self, name: &'static str, fut: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let mut tasks = self.tasks.lock().unwrap_or_else(|p| p.into_inner());
        // Reap finished tasks so the set does not grow without bound.
        while let Some(result) = tasks.try_join_next() {
            log_join(result);
        }
        tasks.spawn(async move {
            tracing::debug!(task = name, "background task started");
            fut.await;
            tracing::debug!(task = name, "background task finished");
        });
    }

    /// Number of tasks not yet reaped.
    pub fn pending(&self) -> usize {
        self.tasks.lock().unwrap_or_else(|p| p.into_inner()).len()
    }

    /// Wait for every task, including ones spawned while draining.
    pub async fn drain(&self) {
        loop {
            let mut batch = {
                let mut tasks = self.tasks.lock().unwrap_or_else(|p| p.into_inner());
                std::mem::take(&mut *tasks)
            };
            if batch.is_empty() {
                return;
            }
            tracing::info!(pending = batch.len(), "draining background tasks");
            while let Some(result) = batch.join_next().await {
                log_join(result);
            }
        }
    }
}

fn log_join(result: Result<(), tokio::task::JoinError>) {
    if let Err(e) = result {
        tracing::warn!(error = %e, "background task failed");
    }
}
