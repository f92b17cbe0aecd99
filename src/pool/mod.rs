//! Elastic worker pool.
//!
//! Requests land in a bounded job queue. A dispatcher task pairs each one
//! with a worker that has announced itself on the availability channel,
//! growing the pool up to `max_workers` when nobody is free. A sweeper
//! running every `idle_timeout / 2` retires non-core workers that have sat
//! idle for longer than `idle_timeout`.

mod worker;

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::config::WorkerPoolConfig;
use crate::net::Request;
use crate::router::Router;
use worker::{Worker, WorkerSlot};

/// Handle to the pool. Clones share the same workers.
#[derive(Clone)]
pub struct WorkerPool {
    inner: Arc<Inner>,
}

struct Inner {
    config: WorkerPoolConfig,
    router: Arc<Router>,
    state: Mutex<PoolState>,
    /// `None` once the pool is stopped.
    job_tx: Mutex<Option<mpsc::Sender<Request>>>,
    avail_tx: mpsc::Sender<WorkerSlot>,
    shutdown: CancellationToken,
}

struct PoolState {
    workers: HashMap<u32, Worker>,
    next_worker_id: u32,
    /// Held here until the dispatcher takes them.
    job_rx: Option<mpsc::Receiver<Request>>,
    avail_rx: Option<mpsc::Receiver<WorkerSlot>>,
    dispatcher: Option<JoinHandle<()>>,
    sweeper: Option<JoinHandle<()>>,
    stopped: bool,
}

impl WorkerPool {
    pub fn new(config: WorkerPoolConfig, router: Arc<Router>) -> Self {
        let (job_tx, job_rx) = mpsc::channel(config.queue_size.max(1));
        let (avail_tx, avail_rx) = mpsc::channel(config.max_workers.max(1) * 2);

        Self {
            inner: Arc::new(Inner {
                config,
                router,
                state: Mutex::new(PoolState {
                    workers: HashMap::new(),
                    next_worker_id: 1,
                    job_rx: Some(job_rx),
                    avail_rx: Some(avail_rx),
                    dispatcher: None,
                    sweeper: None,
                    stopped: false,
                }),
                job_tx: Mutex::new(Some(job_tx)),
                avail_tx,
                shutdown: CancellationToken::new(),
            }),
        }
    }

    /// Spawn the core workers, the dispatcher and the idle sweeper.
    ///
    /// Calling it again only tops the core workers back up. Has no effect
    /// once the pool is stopped.
    pub fn start(&self) {
        let inner = &self.inner;
        let mut state = inner.state.lock();
        if state.stopped {
            return;
        }

        if let (Some(job_rx), Some(avail_rx)) = (state.job_rx.take(), state.avail_rx.take()) {
            state.dispatcher = Some(tokio::spawn(dispatch(Arc::clone(inner), job_rx, avail_rx)));
        }

        while state.workers.len() < inner.config.core_workers {
            inner.spawn_worker(&mut state, true);
        }

        if state.sweeper.is_none() {
            state.sweeper = Some(tokio::spawn(sweep(Arc::clone(inner))));
        }

        info!(
            core_workers = inner.config.core_workers,
            max_workers = inner.config.max_workers,
            queue_size = inner.config.queue_size,
            idle_timeout_ms = inner.config.idle_timeout.as_millis() as u64,
            "Worker pool started"
        );
    }

    /// Queue a request without blocking.
    ///
    /// A full queue or a stopped pool drops the request with a warning.
    pub fn add_request(&self, request: Request) {
        let conn_id = request.connection().id();
        let msg_id = request.msg_id();

        let job_tx = self.inner.job_tx.lock();
        let Some(tx) = job_tx.as_ref() else {
            warn!(conn_id, msg_id, "Worker pool stopped, request dropped");
            request.connection().metrics().error();
            return;
        };

        match tx.try_send(request) {
            Ok(()) => trace!(conn_id, msg_id, "Request queued"),
            Err(TrySendError::Full(request)) => {
                warn!(conn_id, msg_id, "Worker pool queue full, request dropped");
                request.connection().metrics().error();
            }
            Err(TrySendError::Closed(request)) => {
                warn!(conn_id, msg_id, "Worker pool stopped, request dropped");
                request.connection().metrics().error();
            }
        }
    }

    /// Stop every worker and wait for them all to exit.
    ///
    /// Requests still queued are dropped. Later calls return immediately.
    pub async fn stop(&self) {
        let (dispatcher, sweeper, workers) = {
            let mut state = self.inner.state.lock();
            if state.stopped {
                return;
            }
            state.stopped = true;
            let workers: Vec<Worker> = state.workers.drain().map(|(_, w)| w).collect();
            (state.dispatcher.take(), state.sweeper.take(), workers)
        };

        self.inner.job_tx.lock().take();
        self.inner.shutdown.cancel();

        if let Some(task) = dispatcher {
            let _ = task.await;
        }
        if let Some(task) = sweeper {
            let _ = task.await;
        }

        let count = workers.len();
        for worker in workers {
            worker.shutdown().await;
        }

        info!(workers = count, "Worker pool stopped");
    }

    /// Live worker count.
    pub fn worker_count(&self) -> usize {
        self.inner.state.lock().workers.len()
    }

    pub fn core_workers(&self) -> usize {
        self.inner.config.core_workers
    }

    pub fn max_workers(&self) -> usize {
        self.inner.config.max_workers
    }

    pub fn queue_size(&self) -> usize {
        self.inner.config.queue_size
    }

    pub fn idle_timeout(&self) -> Duration {
        self.inner.config.idle_timeout
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.state.lock().stopped
    }
}

impl Inner {
    fn spawn_worker(&self, state: &mut PoolState, is_core: bool) {
        let id = state.next_worker_id;
        state.next_worker_id = state.next_worker_id.wrapping_add(1);

        let worker = Worker::spawn(
            id,
            is_core,
            Arc::clone(&self.router),
            self.avail_tx.clone(),
            self.shutdown.child_token(),
        );
        state.workers.insert(id, worker);
    }

    /// Add one worker if below `max_workers`.
    fn grow(&self) -> bool {
        let mut state = self.state.lock();
        if state.stopped || state.workers.len() >= self.config.max_workers {
            return false;
        }

        let is_core = state.workers.len() < self.config.core_workers;
        self.spawn_worker(&mut state, is_core);
        debug!(workers = state.workers.len(), "Worker pool grew");
        true
    }

    /// Retire non-core workers idle for longer than `idle_timeout`.
    ///
    /// A worker is only removed after it has been claimed as evicted, so one
    /// the dispatcher already handed a request to is left alone and never
    /// runs a handler once it has left the worker map.
    async fn evict_idle(&self) {
        let idle_timeout = self.config.idle_timeout;

        let evicted: Vec<Worker> = {
            let mut state = self.state.lock();
            let ids: Vec<u32> = state
                .workers
                .values()
                .filter(|w| !w.is_core && w.activity.try_evict(idle_timeout))
                .map(|w| w.id)
                .collect();
            ids.iter().filter_map(|id| state.workers.remove(id)).collect()
        };

        if evicted.is_empty() {
            return;
        }

        let count = evicted.len();
        for worker in evicted {
            worker.shutdown().await;
        }
        debug!(evicted = count, workers = self.state.lock().workers.len(), "Idle workers evicted");
    }
}

async fn dispatch(
    inner: Arc<Inner>,
    mut jobs: mpsc::Receiver<Request>,
    mut available: mpsc::Receiver<WorkerSlot>,
) {
    loop {
        let mut request = tokio::select! {
            biased;
            _ = inner.shutdown.cancelled() => return,
            request = jobs.recv() => match request {
                Some(request) => request,
                None => return,
            },
        };

        loop {
            let slot = match available.try_recv() {
                Ok(slot) => slot,
                Err(_) => {
                    inner.grow();
                    tokio::select! {
                        biased;
                        _ = inner.shutdown.cancelled() => return,
                        slot = available.recv() => match slot {
                            Some(slot) => slot,
                            None => return,
                        },
                    }
                }
            };

            // Slots of evicted or exited workers are skipped
            if !slot.activity.claim() {
                trace!(worker_id = slot.worker_id, "Stale worker slot");
                continue;
            }

            match slot.jobs.try_send(request) {
                Ok(()) => break,
                Err(TrySendError::Full(r)) | Err(TrySendError::Closed(r)) => {
                    trace!(worker_id = slot.worker_id, "Stale worker slot");
                    slot.activity.release();
                    request = r;
                }
            }
        }
    }
}

async fn sweep(inner: Arc<Inner>) {
    let period = (inner.config.idle_timeout / 2).max(Duration::from_millis(1));
    let mut ticker = time::interval_at(Instant::now() + period, period);

    loop {
        tokio::select! {
            _ = inner.shutdown.cancelled() => break,
            _ = ticker.tick() => inner.evict_idle().await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Message;
    use crate::router::Handler;
    use crate::test_support::{wait_for, Harness};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Sleeps for `delay` and records peak concurrency.
    #[derive(Default)]
    struct Gauge {
        active: AtomicUsize,
        peak: AtomicUsize,
        done: AtomicUsize,
    }

    struct SlowHandler {
        gauge: Arc<Gauge>,
        delay: Duration,
    }

    #[async_trait]
    impl Handler for SlowHandler {
        async fn handle(&self, _request: &Request) {
            let now = self.gauge.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.gauge.peak.fetch_max(now, Ordering::SeqCst);
            time::sleep(self.delay).await;
            self.gauge.active.fetch_sub(1, Ordering::SeqCst);
            self.gauge.done.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn pool_with(config: WorkerPoolConfig, delay: Duration) -> (WorkerPool, Arc<Gauge>) {
        let gauge = Arc::new(Gauge::default());
        let mut router = Router::new();
        router
            .add_handler(
                1,
                SlowHandler {
                    gauge: gauge.clone(),
                    delay,
                },
            )
            .unwrap();
        (WorkerPool::new(config, Arc::new(router)), gauge)
    }

    fn config(core: usize, max: usize, queue: usize, idle_ms: u64) -> WorkerPoolConfig {
        WorkerPoolConfig {
            enabled: true,
            core_workers: core,
            max_workers: max,
            queue_size: queue,
            idle_timeout: Duration::from_millis(idle_ms),
        }
    }

    #[tokio::test]
    async fn test_start_spawns_core_workers() {
        let (pool, _gauge) = pool_with(config(3, 6, 8, 60_000), Duration::ZERO);
        assert_eq!(pool.worker_count(), 0);

        pool.start();
        assert_eq!(pool.worker_count(), 3);
        assert_eq!(pool.core_workers(), 3);
        assert_eq!(pool.max_workers(), 6);
        assert_eq!(pool.queue_size(), 8);

        pool.stop().await;
        assert_eq!(pool.worker_count(), 0);
        assert!(pool.is_stopped());
    }

    #[tokio::test]
    async fn test_grows_to_max_and_queues_the_rest() {
        let (pool, gauge) = pool_with(config(2, 4, 1, 60_000), Duration::from_millis(200));
        pool.start();

        let harness = Harness::new();
        let (conn, _peer) = harness.connect(1).await;

        let mut max_seen = 0;
        for i in 0..5u8 {
            pool.add_request(Request::new(conn.clone(), Message::new(1, vec![i])));
            time::sleep(Duration::from_millis(20)).await;
            max_seen = max_seen.max(pool.worker_count());
        }

        // The fifth request is waiting for a worker to free up
        assert_eq!(gauge.active.load(Ordering::SeqCst), 4);
        assert_eq!(gauge.done.load(Ordering::SeqCst), 0);
        assert!(max_seen <= 4);

        time::sleep(Duration::from_millis(500)).await;
        assert_eq!(gauge.done.load(Ordering::SeqCst), 5);
        assert_eq!(gauge.peak.load(Ordering::SeqCst), 4);
        assert_eq!(pool.worker_count(), 4);
        assert_eq!(harness.metrics.snapshot().errors, 0);

        pool.stop().await;
    }

    #[tokio::test]
    async fn test_idle_workers_shrink_back_to_core() {
        let (pool, gauge) = pool_with(config(2, 4, 16, 100), Duration::from_millis(50));
        pool.start();

        let harness = Harness::new();
        let (conn, _peer) = harness.connect(1).await;
        for _ in 0..4 {
            pool.add_request(Request::new(conn.clone(), Message::new(1, &b"x"[..])));
        }

        time::sleep(Duration::from_millis(30)).await;
        assert_eq!(pool.worker_count(), 4);

        time::sleep(Duration::from_millis(500)).await;
        assert_eq!(gauge.done.load(Ordering::SeqCst), 4);
        assert_eq!(pool.worker_count(), 2);

        pool.stop().await;
    }

    #[tokio::test]
    async fn test_full_queue_drops_request() {
        // Not started, so nothing drains the queue
        let (pool, _gauge) = pool_with(config(1, 1, 1, 60_000), Duration::ZERO);

        let harness = Harness::new();
        let (conn, _peer) = harness.connect(1).await;

        pool.add_request(Request::new(conn.clone(), Message::new(1, &b"a"[..])));
        pool.add_request(Request::new(conn.clone(), Message::new(1, &b"b"[..])));

        assert_eq!(harness.metrics.snapshot().errors, 1);
        pool.stop().await;
    }

    #[tokio::test]
    async fn test_stop_waits_for_running_handler() {
        let (pool, gauge) = pool_with(config(1, 1, 4, 60_000), Duration::from_millis(200));
        pool.start();

        let harness = Harness::new();
        let (conn, _peer) = harness.connect(1).await;
        pool.add_request(Request::new(conn, Message::new(1, &b"x"[..])));

        time::sleep(Duration::from_millis(30)).await;
        assert_eq!(gauge.active.load(Ordering::SeqCst), 1);
        assert_eq!(gauge.done.load(Ordering::SeqCst), 0);

        pool.stop().await;
        assert_eq!(gauge.done.load(Ordering::SeqCst), 1);
        assert_eq!(gauge.active.load(Ordering::SeqCst), 0);
        assert_eq!(pool.worker_count(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_eviction_racing_dispatch_stays_within_max_workers() {
        let (pool, gauge) = pool_with(config(1, 2, 16, 60_000), Duration::from_millis(30));
        pool.start();

        let harness = Harness::new();
        let (conn, _peer) = harness.connect(1).await;
        let submit = |n: usize| {
            for _ in 0..n {
                pool.add_request(Request::new(conn.clone(), Message::new(1, &b"x"[..])));
            }
        };

        submit(2);
        wait_for(|| gauge.done.load(Ordering::SeqCst) == 2).await;
        assert_eq!(pool.worker_count(), 2);

        let mut expected = 2;
        for _ in 0..10 {
            // Every worker looks long idle, the sweep races new requests
            for worker in pool.inner.state.lock().workers.values() {
                worker.activity.backdate(Duration::from_secs(120));
            }

            submit(2);
            let inner = pool.inner.clone();
            let evicting = tokio::spawn(async move { inner.evict_idle().await });
            submit(1);
            evicting.await.unwrap();
            expected += 3;

            assert!(pool.worker_count() <= 2);
            wait_for(|| gauge.done.load(Ordering::SeqCst) == expected).await;
        }

        assert!(gauge.peak.load(Ordering::SeqCst) <= 2);
        assert!(pool.worker_count() >= 1);
        pool.stop().await;
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let (pool, gauge) = pool_with(config(2, 2, 4, 60_000), Duration::from_millis(10));
        pool.start();

        let harness = Harness::new();
        let (conn, _peer) = harness.connect(1).await;
        pool.add_request(Request::new(conn.clone(), Message::new(1, &b"x"[..])));
        time::sleep(Duration::from_millis(50)).await;
        assert_eq!(gauge.done.load(Ordering::SeqCst), 1);

        pool.stop().await;
        pool.stop().await;
        assert_eq!(pool.worker_count(), 0);

        // Start after stop stays stopped, requests are dropped
        pool.start();
        assert_eq!(pool.worker_count(), 0);
        pool.add_request(Request::new(conn, Message::new(1, &b"y"[..])));
        assert_eq!(harness.metrics.snapshot().errors, 1);
    }
}
