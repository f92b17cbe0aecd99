use parking_lot::Mutex;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, trace};

use crate::net::Request;
use crate::router::Router;

/// A worker announcing it can take exactly one request.
pub(super) struct WorkerSlot {
    pub worker_id: u32,
    pub jobs: mpsc::Sender<Request>,
    pub activity: Arc<Activity>,
}

const IDLE: u8 = 0;
const BUSY: u8 = 1;
const EVICTED: u8 = 2;

/// Idle tracking shared between a worker task, the dispatcher and the
/// sweeper.
///
/// A worker is claimed by moving it out of `IDLE`: the dispatcher claims it
/// as `BUSY` before handing over a request, the sweeper claims it as
/// `EVICTED` before stopping it. Only one of the two can win.
pub(super) struct Activity {
    last: Mutex<Instant>,
    state: AtomicU8,
}

impl Activity {
    fn new() -> Self {
        Self {
            last: Mutex::new(Instant::now()),
            state: AtomicU8::new(IDLE),
        }
    }

    /// Reserve the worker for one request. Fails once it has been evicted.
    pub fn claim(&self) -> bool {
        self.state
            .compare_exchange(IDLE, BUSY, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Hand a claimed worker back without running anything.
    pub fn release(&self) {
        let _ = self
            .state
            .compare_exchange(BUSY, IDLE, Ordering::AcqRel, Ordering::Acquire);
    }

    /// Mark the worker evicted if it has been idle for longer than `timeout`.
    pub fn try_evict(&self, timeout: Duration) -> bool {
        if self.idle_for() <= timeout {
            return false;
        }
        self.state
            .compare_exchange(IDLE, EVICTED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn begin(&self) {
        *self.last.lock() = Instant::now();
    }

    fn end(&self) {
        *self.last.lock() = Instant::now();
        self.release();
    }

    fn idle_for(&self) -> Duration {
        self.last.lock().elapsed()
    }

    /// Pretend the last activity happened `by` earlier.
    #[cfg(test)]
    pub fn backdate(&self, by: Duration) {
        let mut last = self.last.lock();
        *last = last.checked_sub(by).unwrap_or(*last);
    }
}

/// Handle to a running worker task.
pub(super) struct Worker {
    pub id: u32,
    /// Core workers are never evicted.
    pub is_core: bool,
    pub activity: Arc<Activity>,
    pub cancel: CancellationToken,
    pub task: JoinHandle<()>,
}

impl Worker {
    pub fn spawn(
        id: u32,
        is_core: bool,
        router: Arc<Router>,
        available: mpsc::Sender<WorkerSlot>,
        cancel: CancellationToken,
    ) -> Self {
        let activity = Arc::new(Activity::new());
        let task = tokio::spawn(run(
            id,
            router,
            available,
            Arc::clone(&activity),
            cancel.clone(),
        ));

        info!(worker_id = id, is_core, "Worker started");

        Self {
            id,
            is_core,
            activity,
            cancel,
            task,
        }
    }

    /// Cancel the worker and wait for it to exit.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        let _ = self.task.await;
        info!(worker_id = self.id, "Worker exited");
    }
}

async fn run(
    id: u32,
    router: Arc<Router>,
    available: mpsc::Sender<WorkerSlot>,
    activity: Arc<Activity>,
    cancel: CancellationToken,
) {
    let (jobs_tx, mut jobs_rx) = mpsc::channel::<Request>(1);

    loop {
        let slot = WorkerSlot {
            worker_id: id,
            jobs: jobs_tx.clone(),
            activity: Arc::clone(&activity),
        };

        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            sent = available.send(slot) => {
                if sent.is_err() {
                    break;
                }
            }
        }

        let request = tokio::select! {
            biased;
            request = jobs_rx.recv() => match request {
                Some(request) => request,
                None => break,
            },
            _ = cancel.cancelled() => break,
        };

        trace!(worker_id = id, msg_id = request.msg_id(), "Worker picked up request");
        activity.begin();
        router.do_msg_handler(request).await;
        activity.end();
    }

    // A slot may still sit in the availability queue; close it so the
    // dispatcher sees the worker is gone. Only pool shutdown can leave a
    // claimed request behind here, eviction never wins against a claim.
    jobs_rx.close();
    while let Ok(request) = jobs_rx.try_recv() {
        router.do_msg_handler(request).await;
    }
}
