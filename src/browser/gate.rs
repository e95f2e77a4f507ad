use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

/// Single-isolate concurrency gate in front of browser rendering.
///
/// Permits above `max_concurrent` enqueue FIFO. A queued acquirer either
/// receives a permit when one is released, rejects after `queue_timeout`
/// with a message carrying its label and waited time, or rejects
/// immediately when the queue is at `max_queue_length`.
///
/// Invariant: `active + queue.len()` equals the number of outstanding
/// acquirers. Queue grants happen under the state lock, so a waiter that is
/// no longer queued has definitively been handed a permit.
pub struct RenderGate {
    shared: Arc<GateShared>,
}

struct GateShared {
    max_concurrent: usize,
    queue_timeout: Duration,
    max_queue_length: Option<usize>,
    state: Mutex<GateState>,
}

struct GateState {
    active: usize,
    queue: VecDeque<Waiter>,
    next_id: u64,
}

struct Waiter {
    id: u64,
    tx: oneshot::Sender<()>,
}

#[derive(Debug)]
pub enum GateError {
    QueueTimeout { label: String, waited_ms: u64 },
    QueueFull { label: String },
    Aborted,
}

impl fmt::Display for GateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GateError::QueueTimeout { label, waited_ms } => write!(
                f,
                "render queue timeout for {} after {}ms waiting",
                label, waited_ms
            ),
            GateError::QueueFull { label } => write!(f, "render queue full, rejected {}", label),
            GateError::Aborted => write!(f, "aborted"),
        }
    }
}

impl std::error::Error for GateError {}

impl From<GateError> for crate::error::ConvertError {
    fn from(e: GateError) -> Self {
        match e {
            GateError::QueueTimeout { .. } => crate::error::ConvertError::FetchTimeout(e.to_string()),
            other => crate::error::ConvertError::FetchFailed(other.to_string()),
        }
    }
}

/// Release handle. Dropping it releases the permit; calling `release`
/// repeatedly decrements `active` exactly once.
pub struct RenderPermit {
    shared: Arc<GateShared>,
    released: AtomicBool,
}

impl std::fmt::Debug for RenderPermit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RenderPermit")
            .field("released", &self.released.load(Ordering::Relaxed))
            .finish()
    }
}

impl RenderPermit {
    pub fn release(&self) {
        if !self.released.swap(true, Ordering::AcqRel) {
            release_slot(&self.shared);
        }
    }
}

impl Drop for RenderPermit {
    fn drop(&mut self) {
        self.release();
    }
}

/// Hand the freed slot to the oldest queued waiter, or decrement `active`.
/// Pop + send happen under the state lock so grant/timeout races resolve
/// deterministically; a waiter whose receiver is gone is skipped.
fn release_slot(shared: &Arc<GateShared>) {
    let mut st = shared.state.lock().unwrap();
    while let Some(waiter) = st.queue.pop_front() {
        if waiter.tx.send(()).is_ok() {
            return;
        }
    }
    st.active -= 1;
}

impl RenderGate {
    pub fn new(
        max_concurrent: usize,
        queue_timeout: Duration,
        max_queue_length: Option<usize>,
    ) -> Self {
        Self {
            shared: Arc::new(GateShared {
                max_concurrent: max_concurrent.max(1),
                queue_timeout,
                max_queue_length,
                state: Mutex::new(GateState {
                    active: 0,
                    queue: VecDeque::new(),
                    next_id: 0,
                }),
            }),
        }
    }

    pub fn active(&self) -> usize {
        self.shared.state.lock().unwrap().active
    }

    pub fn queued(&self) -> usize {
        self.shared.state.lock().unwrap().queue.len()
    }

    /// Acquire a render permit, waiting FIFO behind earlier acquirers.
    pub async fn acquire(
        &self,
        label: &str,
        cancel: &CancellationToken,
    ) -> Result<RenderPermit, GateError> {
        let (id, mut rx) = {
            let mut st = self.shared.state.lock().unwrap();
            if st.active < self.shared.max_concurrent {
                st.active += 1;
                return Ok(self.permit());
            }
            if let Some(max_queue) = self.shared.max_queue_length {
                if st.queue.len() >= max_queue {
                    metrics::counter!("mdgate_render_queue_rejected_total").increment(1);
                    return Err(GateError::QueueFull {
                        label: label.to_string(),
                    });
                }
            }
            let (tx, rx) = oneshot::channel();
            let id = st.next_id;
            st.next_id += 1;
            st.queue.push_back(Waiter { id, tx });
            (id, rx)
        };

        metrics::gauge!("mdgate_render_queue_depth").increment(1.0);
        let start = Instant::now();
        let outcome = tokio::select! {
            res = &mut rx => {
                match res {
                    Ok(()) => Ok(self.permit()),
                    // Gate dropped while we waited — treat as abort.
                    Err(_) => Err(GateError::Aborted),
                }
            }
            _ = tokio::time::sleep(self.shared.queue_timeout) => {
                self.settle_lost_wait(id, &mut rx, true, label, start)
            }
            _ = cancel.cancelled() => {
                self.settle_lost_wait(id, &mut rx, false, label, start)
            }
        };
        metrics::gauge!("mdgate_render_queue_depth").decrement(1.0);
        outcome
    }

    /// Resolve a wait that ended by timeout or cancellation. If the waiter
    /// is still queued it is removed and the wait fails; if it has already
    /// been granted, a timeout keeps the permit while a cancellation
    /// returns it without advancing other waiters wrongly.
    fn settle_lost_wait(
        &self,
        id: u64,
        rx: &mut oneshot::Receiver<()>,
        timed_out: bool,
        label: &str,
        start: Instant,
    ) -> Result<RenderPermit, GateError> {
        let still_queued = {
            let mut st = self.shared.state.lock().unwrap();
            let before = st.queue.len();
            st.queue.retain(|w| w.id != id);
            st.queue.len() != before
        };

        if still_queued {
            if timed_out {
                return Err(GateError::QueueTimeout {
                    label: label.to_string(),
                    waited_ms: start.elapsed().as_millis() as u64,
                });
            }
            return Err(GateError::Aborted);
        }

        // Not queued anymore: the grant committed under the lock.
        debug_assert!(rx.try_recv().is_ok());
        if timed_out {
            return Ok(self.permit());
        }
        release_slot(&self.shared);
        Err(GateError::Aborted)
    }

    fn permit(&self) -> RenderPermit {
        RenderPermit {
            shared: self.shared.clone(),
            released: AtomicBool::new(false),
        }
    }

    /// Run `task` under a permit; the permit is released on every exit path,
    /// including panics unwinding through the future drop.
    pub async fn run<T, F>(
        &self,
        label: &str,
        cancel: &CancellationToken,
        task: F,
    ) -> Result<T, crate::error::ConvertError>
    where
        F: std::future::Future<Output = Result<T, crate::error::ConvertError>>,
    {
        let permit = self.acquire(label, cancel).await?;
        let result = task.await;
        permit.release();
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gate(max: usize, timeout_ms: u64, max_queue: Option<usize>) -> Arc<RenderGate> {
        Arc::new(RenderGate::new(
            max,
            Duration::from_millis(timeout_ms),
            max_queue,
        ))
    }

    async fn wait_for_queue(g: &RenderGate, n: usize) {
        for _ in 0..200 {
            if g.queued() == n {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("queue never reached {}", n);
    }

    #[tokio::test]
    async fn test_immediate_acquire_within_capacity() {
        let g = gate(2, 1000, None);
        let cancel = CancellationToken::new();
        let p1 = g.acquire("a", &cancel).await.unwrap();
        let _p2 = g.acquire("b", &cancel).await.unwrap();
        assert_eq!(g.active(), 2);
        p1.release();
        assert_eq!(g.active(), 1);
    }

    #[tokio::test]
    async fn test_fifo_release_order() {
        // Property: queued acquirers resolve strictly in enqueue order.
        let g = gate(1, 5000, None);
        let cancel = CancellationToken::new();
        let holder = g.acquire("holder", &cancel).await.unwrap();

        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        for i in 0..4u32 {
            let task_g = g.clone();
            let tx = tx.clone();
            let cancel = cancel.clone();
            // Enqueue one at a time so the FIFO order is deterministic.
            tokio::spawn(async move {
                let permit = task_g.acquire(&format!("w{}", i), &cancel).await.unwrap();
                tx.send(i).unwrap();
                permit.release();
            });
            wait_for_queue(&g, (i + 1) as usize).await;
        }

        holder.release();
        let mut order = Vec::new();
        for _ in 0..4 {
            order.push(rx.recv().await.unwrap());
        }
        assert_eq!(order, vec![0, 1, 2, 3]);
    }

    #[tokio::test]
    async fn test_release_is_idempotent() {
        let g = gate(1, 1000, None);
        let cancel = CancellationToken::new();
        let p = g.acquire("a", &cancel).await.unwrap();
        assert_eq!(g.active(), 1);
        p.release();
        p.release();
        p.release();
        drop(p);
        assert_eq!(g.active(), 0);
    }

    #[tokio::test]
    async fn test_queue_timeout_carries_label_and_waited() {
        let g = gate(1, 50, None);
        let cancel = CancellationToken::new();
        let _holder = g.acquire("holder", &cancel).await.unwrap();

        let err = g.acquire("impatient", &cancel).await.unwrap_err();
        match err {
            GateError::QueueTimeout { label, waited_ms } => {
                assert_eq!(label, "impatient");
                assert!(waited_ms >= 50);
            }
            other => panic!("expected QueueTimeout, got {}", other),
        }
        // Timed-out waiter left the queue.
        assert_eq!(g.queued(), 0);
        assert_eq!(g.active(), 1);
    }

    #[tokio::test]
    async fn test_queue_full_rejects_immediately() {
        let g = gate(1, 5000, Some(1));
        let cancel = CancellationToken::new();
        let _holder = g.acquire("holder", &cancel).await.unwrap();

        let g2 = g.clone();
        let c2 = cancel.clone();
        tokio::spawn(async move {
            let _ = g2.acquire("queued", &c2).await;
        });
        wait_for_queue(&g, 1).await;

        let err = g.acquire("overflow", &cancel).await.unwrap_err();
        assert!(matches!(err, GateError::QueueFull { .. }));
    }

    #[tokio::test]
    async fn test_cancelled_waiter_leaves_queue_clean() {
        let g = gate(1, 5000, None);
        let cancel = CancellationToken::new();
        let holder = g.acquire("holder", &cancel).await.unwrap();

        let waiter_cancel = CancellationToken::new();
        let g2 = g.clone();
        let wc = waiter_cancel.clone();
        let handle = tokio::spawn(async move { g2.acquire("doomed", &wc).await });
        wait_for_queue(&g, 1).await;

        waiter_cancel.cancel();
        let res = handle.await.unwrap();
        assert!(matches!(res, Err(GateError::Aborted)));
        assert_eq!(g.queued(), 0);

        // The holder's slot is unaffected and still releasable.
        holder.release();
        assert_eq!(g.active(), 0);
    }

    #[tokio::test]
    async fn test_run_releases_on_error() {
        let g = gate(1, 1000, None);
        let cancel = CancellationToken::new();
        let res: Result<(), _> = g
            .run("job", &cancel, async {
                Err(crate::error::ConvertError::FetchFailed("boom".into()))
            })
            .await;
        assert!(res.is_err());
        assert_eq!(g.active(), 0);
    }

    #[tokio::test]
    async fn test_outstanding_invariant() {
        // active + queued equals outstanding acquirers at steady points.
        let g = gate(2, 5000, None);
        let cancel = CancellationToken::new();
        let _p1 = g.acquire("a", &cancel).await.unwrap();
        let _p2 = g.acquire("b", &cancel).await.unwrap();
        for i in 0..3u32 {
            let task_g = g.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                let _ = task_g.acquire(&format!("q{}", i), &cancel).await;
            });
            wait_for_queue(&g, (i + 1) as usize).await;
        }
        assert_eq!(g.active() + g.queued(), 5);
    }
}
