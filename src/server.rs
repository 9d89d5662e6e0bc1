//! Server: accepts channels from the connection queue and runs one worker
//! per channel on the blocking pool.

use crate::config::Config;
use crate::worker::{WorkerDispatcher, WorkerExit, WorkerReport};
use shm_compute_shared_memory::{BlockStore, Channel, ConnectionQueue, ErrorKind, Result, ShmError};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::{JoinError, JoinSet};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, instrument, trace, warn};

/// Running counters, updated as channels come and go
#[derive(Debug, Default)]
pub struct ServerStats {
    accepted: AtomicU64,
    unregistered: AtomicU64,
    abandoned: AtomicU64,
    protocol_violations: AtomicU64,
    failed: AtomicU64,
    requests_served: AtomicU64,
}

/// Point-in-time copy of [`ServerStats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub accepted: u64,
    pub unregistered: u64,
    pub abandoned: u64,
    pub protocol_violations: u64,
    pub failed: u64,
    pub requests_served: u64,
}

impl ServerStats {
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            accepted: self.accepted.load(Ordering::Relaxed),
            unregistered: self.unregistered.load(Ordering::Relaxed),
            abandoned: self.abandoned.load(Ordering::Relaxed),
            protocol_violations: self.protocol_violations.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            requests_served: self.requests_served.load(Ordering::Relaxed),
        }
    }

    fn record(&self, report: &WorkerReport) {
        self.requests_served.fetch_add(report.served, Ordering::Relaxed);
        let counter = match report.exit {
            WorkerExit::Unregistered => &self.unregistered,
            WorkerExit::Abandoned => &self.abandoned,
            WorkerExit::ProtocolViolation => &self.protocol_violations,
            WorkerExit::Shutdown => return,
            WorkerExit::Failed => &self.failed,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// Owns the connection queue and the pool of workers serving its channels
pub struct Server {
    config: Config,
    store: BlockStore,
    queue: Arc<ConnectionQueue>,
    stats: Arc<ServerStats>,
    stop: Arc<AtomicBool>,
}

impl Server {
    /// Create (or take over) the connection queue named in `config`
    pub fn new(config: Config) -> Result<Self> {
        let store = BlockStore::new(&config.store_root)?;
        let queue = ConnectionQueue::create(
            &store,
            &config.queue_name,
            config.queue_capacity,
            config.wait_options(),
        )?;

        info!(
            "Connection queue {} ready in {} (capacity {})",
            queue.name(),
            store.root().display(),
            queue.capacity()
        );

        Ok(Self {
            config,
            store,
            queue: Arc::new(queue),
            stats: Arc::new(ServerStats::default()),
            stop: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn store(&self) -> &BlockStore {
        &self.store
    }

    pub fn stats(&self) -> Arc<ServerStats> {
        Arc::clone(&self.stats)
    }

    /// Accept and serve channels until `shutdown` turns true or its sender
    /// goes away. Returns the final counters.
    #[instrument(skip_all, fields(queue = %self.queue.name()))]
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> Result<StatsSnapshot> {
        let mut workers: JoinSet<WorkerReport> = JoinSet::new();
        let mut ticker = tokio::time::interval(self.config.poll_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        info!("Server started with up to {} workers", self.config.max_workers);

        loop {
            if *shutdown.borrow() {
                break;
            }

            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                Some(joined) = workers.join_next(), if !workers.is_empty() => {
                    self.on_worker_exit(joined);
                }
                _ = ticker.tick() => {
                    self.accept(&mut workers).await;
                }
            }
        }

        self.shutdown(workers).await
    }

    /// Dequeue channels while worker slots are free
    async fn accept(&self, workers: &mut JoinSet<WorkerReport>) {
        while workers.len() < self.config.max_workers {
            let queue = Arc::clone(&self.queue);
            let dequeued = match tokio::task::spawn_blocking(move || queue.dequeue()).await {
                Ok(dequeued) => dequeued,
                Err(e) => {
                    error!("Dequeue task failed: {}", e);
                    return;
                }
            };

            match dequeued {
                Ok(channel) => self.spawn_worker(workers, channel),
                Err(ShmError::Empty) => {
                    trace!("No pending connections");
                    return;
                }
                Err(e) if e.is_recoverable() => {
                    warn!("Connection queue busy: {}", e);
                    return;
                }
                Err(e) => {
                    // The entry is consumed and its segment already released.
                    self.stats.failed.fetch_add(1, Ordering::Relaxed);
                    error!("Failed to accept connection: {}", e);
                }
            }
        }
    }

    fn spawn_worker(&self, workers: &mut JoinSet<WorkerReport>, channel: Channel) {
        self.stats.accepted.fetch_add(1, Ordering::Relaxed);
        info!("Accepted channel {} from {}", channel.name(), channel.owner_name());

        let idle_timeout = self.config.idle_timeout();
        let stop = Arc::clone(&self.stop);
        workers.spawn_blocking(move || {
            WorkerDispatcher::with_stop_flag(channel, idle_timeout, stop).run()
        });
    }

    fn on_worker_exit(&self, joined: std::result::Result<WorkerReport, JoinError>) {
        match joined {
            Ok(report) => {
                info!(
                    "Channel {} ({}) finished: {:?} after {} requests",
                    report.channel, report.owner, report.exit, report.served
                );
                self.stats.record(&report);
            }
            Err(e) => {
                self.stats.failed.fetch_add(1, Ordering::Relaxed);
                error!("Worker task failed: {}", e);
            }
        }
    }

    /// Stop workers, reclaim channels still waiting in the queue and remove
    /// the queue segment
    async fn shutdown(self, mut workers: JoinSet<WorkerReport>) -> Result<StatsSnapshot> {
        info!("Shutting down, waiting for {} workers", workers.len());
        self.stop.store(true, Ordering::Release);

        while let Some(joined) = workers.join_next().await {
            self.on_worker_exit(joined);
        }

        let queue = Arc::clone(&self.queue);
        let reclaimed = tokio::task::spawn_blocking(move || drain(&queue))
            .await
            .map_err(|e| ShmError::Protocol(format!("queue drain task failed: {}", e)))??;
        if reclaimed > 0 {
            info!("Reclaimed {} unserved channels", reclaimed);
        }

        let snapshot = self.stats.snapshot();
        match Arc::try_unwrap(self.queue) {
            Ok(queue) => queue.destroy()?,
            Err(_) => warn!("Connection queue still referenced, leaving segment in place"),
        }

        info!("Server stopped: {:?}", snapshot);
        Ok(snapshot)
    }
}

/// Close and unlink every channel left in the queue, then reset it
fn drain(queue: &ConnectionQueue) -> Result<usize> {
    let mut reclaimed = 0;
    loop {
        match queue.dequeue() {
            Ok(channel) => {
                debug!("Reclaiming unserved channel {}", channel.name());
                if let Err(e) = channel.force_close() {
                    warn!("Failed to close channel {}: {}", channel.name(), e);
                }
                channel.release()?;
                reclaimed += 1;
            }
            Err(ShmError::Empty) => break,
            Err(e) if e.kind() == ErrorKind::Allocation => {
                warn!("Skipping unusable queue entry: {}", e);
            }
            Err(e) => return Err(e),
        }
    }
    queue.reset()?;
    Ok(reclaimed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use shm_compute_core::{Request, Response};
    use std::time::Duration;
    use tempfile::TempDir;

    fn config(dir: &TempDir) -> Config {
        Config {
            store_root: dir.path().to_path_buf(),
            queue_name: "server_test".to_string(),
            queue_capacity: 8,
            max_workers: 4,
            poll_interval_ms: 1,
            ..Config::default()
        }
    }

    #[test]
    fn test_stats_record() {
        let stats = ServerStats::default();
        let report = |exit| WorkerReport { channel: "c".into(), owner: "o".into(), exit, served: 2 };

        stats.record(&report(WorkerExit::Unregistered));
        stats.record(&report(WorkerExit::Abandoned));
        stats.record(&report(WorkerExit::Shutdown));

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.unregistered, 1);
        assert_eq!(snapshot.abandoned, 1);
        assert_eq!(snapshot.failed, 0);
        assert_eq!(snapshot.requests_served, 6);
    }

    #[test]
    fn test_drain_reclaims_pending() {
        let dir = TempDir::new().unwrap();
        let store = BlockStore::new(dir.path()).unwrap();
        let queue = ConnectionQueue::create(&store, "drain_test", 4, Default::default()).unwrap();

        let a = queue.post("a").unwrap();
        let b = queue.post("b").unwrap();

        assert_eq!(drain(&queue).unwrap(), 2);
        assert!(queue.is_empty().unwrap());
        assert!(a.is_closed() && b.is_closed());
        assert!(!store.exists(a.id()));
        assert!(!store.exists(b.id()));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_serves_and_shuts_down() {
        let dir = TempDir::new().unwrap();
        let config = config(&dir);
        let server = Server::new(config.clone()).unwrap();
        let store = server.store().clone();
        let (tx, rx) = watch::channel(false);
        let running = tokio::spawn(server.run(rx));

        let response = tokio::task::spawn_blocking(move || {
            let queue = ConnectionQueue::open(&store, &config.queue_name, config.wait_options()).unwrap();
            let channel = queue.post("tester").unwrap();
            let response = channel.call(Request::arithmetic(b'*', 6, 7), Duration::from_secs(5)).unwrap();
            channel.call(Request::unregister(), Duration::from_secs(5)).unwrap();
            response
        })
        .await
        .unwrap();
        assert_eq!(response, Response::success(42));

        // Let the worker report before stopping.
        tokio::time::sleep(Duration::from_millis(50)).await;
        tx.send(true).unwrap();
        let stats = running.await.unwrap().unwrap();

        assert_eq!(stats.accepted, 1);
        assert_eq!(stats.unregistered, 1);
        assert_eq!(stats.requests_served, 1);
        assert!(BlockStore::new(dir.path()).unwrap().list().unwrap().is_empty());
    }
}
