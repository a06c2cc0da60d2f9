//! Background worker for periodic and on-demand maintenance.
//!
//! Provides a generic `BackgroundWorker<R>` that processes tasks from an mpsc
//! channel via a `BackgroundRunnable` implementation, with a periodic tick.
//! [`CacheSweeper`] is the runnable that purges expired cache entries.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

use crate::cache::{Cache, InvalidationRule};

// ---------------------------------------------------------------------------
// BackgroundRunnable trait
// ---------------------------------------------------------------------------

/// Task handler executed by `BackgroundWorker`.
#[async_trait]
pub trait BackgroundRunnable: Send + 'static {
    type Task: Send + 'static;

    /// Process a single submitted task.
    async fn run(&mut self, task: Self::Task);

    /// Called on each tick interval. Default is a no-op.
    async fn on_tick(&mut self) {}

    /// Called once when the worker is shutting down. Default is a no-op.
    async fn shutdown(&mut self) {}
}

// ---------------------------------------------------------------------------
// CacheSweeper
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub enum SweepTask {
    /// Purge expired entries now instead of waiting for the next tick.
    SweepNow,
    /// Remove entries matching the rules.
    Invalidate(Vec<InvalidationRule>),
}

/// Purges expired entries of a shared cache on every tick.
pub struct CacheSweeper<V> {
    cache: Arc<Cache<V>>,
    swept: u64,
}

impl<V> CacheSweeper<V> {
    #[must_use]
    pub fn new(cache: Arc<Cache<V>>) -> Self {
        Self { cache, swept: 0 }
    }
}

impl<V: Clone + Serialize + Send + 'static> CacheSweeper<V> {
    fn sweep(&mut self) {
        let removed = self.cache.cleanup_expired();
        self.swept += removed as u64;
        if removed > 0 {
            debug!(removed, "swept expired cache entries");
        }
    }
}

#[async_trait]
impl<V: Clone + Serialize + Send + 'static> BackgroundRunnable for CacheSweeper<V> {
    type Task = SweepTask;

    async fn run(&mut self, task: SweepTask) {
        match task {
            SweepTask::SweepNow => self.sweep(),
            SweepTask::Invalidate(rules) => {
                self.cache.invalidate(&rules);
            }
        }
    }

    async fn on_tick(&mut self) {
        self.sweep();
    }

    async fn shutdown(&mut self) {
        debug!(swept = self.swept, "cache sweeper stopped");
    }
}

// ---------------------------------------------------------------------------
// BackgroundWorker
// ---------------------------------------------------------------------------

/// Generic background worker that processes tasks via an mpsc channel.
///
/// The spawned task runs submitted tasks, calls `on_tick` at the configured
/// interval, and calls `shutdown` once when stopped or when every handle to
/// the channel is gone.
pub struct BackgroundWorker<R: BackgroundRunnable> {
    tx: Option<mpsc::Sender<R::Task>>,
    shutdown_tx: Option<oneshot::Sender<()>>,
    handle: Option<tokio::task::JoinHandle<()>>,
}

impl<R: BackgroundRunnable> BackgroundWorker<R> {
    /// Starts the worker. The task channel holds 256 pending tasks.
    pub fn start(mut runnable: R, tick_interval: Duration) -> Self {
        let (tx, mut rx) = mpsc::channel::<R::Task>(256);
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(tick_interval);
            // The first tick completes immediately; skip it.
            ticker.tick().await;

            loop {
                tokio::select! {
                    task = rx.recv() => {
                        match task {
                            Some(t) => runnable.run(t).await,
                            None => break,
                        }
                    }
                    _ = ticker.tick() => {
                        runnable.on_tick().await;
                    }
                    _ = &mut shutdown_rx => {
                        break;
                    }
                }
            }

            runnable.shutdown().await;
        });

        Self {
            tx: Some(tx),
            shutdown_tx: Some(shutdown_tx),
            handle: Some(handle),
        }
    }

    /// Submits a task to the worker.
    ///
    /// # Errors
    ///
    /// Returns an error if the worker has been stopped.
    pub async fn submit(&self, task: R::Task) -> anyhow::Result<()> {
        match &self.tx {
            Some(tx) => tx
                .send(task)
                .await
                .map_err(|_| anyhow::anyhow!("worker channel closed")),
            None => Err(anyhow::anyhow!("worker not running")),
        }
    }

    /// Stops the worker and waits for its task to finish.
    pub async fn stop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        self.tx.take();
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
    }
}
