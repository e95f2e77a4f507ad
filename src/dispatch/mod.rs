use crate::error::ConvertError;
use crate::metrics::RuntimeStats;
use dashmap::DashMap;
use rand::Rng;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::debug;
use url::Url;

/// Bucket for tasks whose URL (and therefore host) is unknown.
const DEFAULT_HOST: &str = "__default__";

/// A unit of work. The URL is only used to derive the pacing bucket.
pub struct TaskInput<T> {
    pub url: Option<String>,
    pub payload: T,
}

/// Executor failure, carrying the upstream status when one was observed so
/// the retry policy can distinguish rate limiting from hard failures.
#[derive(Debug)]
pub struct TaskFailure {
    pub status: Option<u16>,
    pub error: ConvertError,
}

impl From<ConvertError> for TaskFailure {
    fn from(error: ConvertError) -> Self {
        Self {
            status: error.upstream_status(),
            error,
        }
    }
}

#[derive(Clone)]
pub struct DispatchOptions {
    pub concurrency: usize,
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub rate_limit_codes: Vec<u16>,
    pub cancel: CancellationToken,
}

impl Default for DispatchOptions {
    fn default() -> Self {
        Self {
            concurrency: 3,
            max_retries: 2,
            base_delay_ms: 250,
            max_delay_ms: 15_000,
            rate_limit_codes: vec![429, 503],
            cancel: CancellationToken::new(),
        }
    }
}

/// Per-host pacing state. The tokio mutex around it doubles as the
/// serialization point: at most one worker touches a host at a time, so
/// delay updates need no further coordination.
struct HostGate {
    current_delay_ms: u64,
    next_allowed_at: Instant,
}

/// Backoff growth after a rate-limited failure: double with jitter, capped.
fn grow_delay(current: u64, max: u64) -> u64 {
    let jitter: f64 = rand::thread_rng().gen_range(0.75..=1.25);
    ((current as f64 * 2.0 * jitter).floor() as u64).min(max)
}

/// Decay after a success: shrink toward the base delay.
fn decay_delay(current: u64, base: u64) -> u64 {
    ((current as f64 * 0.75).floor() as u64).max(base)
}

fn task_host(url: &Option<String>) -> String {
    url.as_deref()
        .and_then(|u| Url::parse(u).ok())
        .and_then(|u| u.host_str().map(|h| h.to_ascii_lowercase()))
        .unwrap_or_else(|| DEFAULT_HOST.to_string())
}

/// Run `tasks` through `executor` with bounded concurrency, per-host
/// pacing, and retry-on-rate-limit. Results come back in input order.
///
/// Workers pull tasks in order; each task waits for its host's
/// `next_allowed_at` before dispatch. Failures with a status in
/// `rate_limit_codes` (or no status at all) retry up to `max_retries`
/// with exponential jittered backoff; other statuses fail immediately.
/// Cancellation surfaces as an `aborted` error per remaining item.
pub async fn run_tasks<T, R, F, Fut>(
    tasks: Vec<TaskInput<T>>,
    executor: F,
    opts: &DispatchOptions,
    stats: Option<&RuntimeStats>,
) -> Vec<Result<R, ConvertError>>
where
    T: Sync,
    R: Send,
    F: Fn(&T) -> Fut + Sync,
    Fut: Future<Output = Result<R, TaskFailure>>,
{
    let total = tasks.len();
    let results: Vec<Mutex<Option<Result<R, ConvertError>>>> =
        (0..total).map(|_| Mutex::new(None)).collect();
    let next_index = AtomicUsize::new(0);
    let host_gates: DashMap<String, Arc<tokio::sync::Mutex<HostGate>>> = DashMap::new();

    let worker_count = opts.concurrency.max(1).min(total.max(1));
    let workers = (0..worker_count).map(|_| {
        let results = &results;
        let tasks = &tasks;
        let next_index = &next_index;
        let host_gates = &host_gates;
        let executor = &executor;
        async move {
            loop {
                let i = next_index.fetch_add(1, Ordering::Relaxed);
                if i >= total {
                    return;
                }
                let task = &tasks[i];
                let outcome = if opts.cancel.is_cancelled() {
                    Err(ConvertError::FetchFailed("aborted".into()))
                } else {
                    run_one(task, executor, host_gates, opts, stats).await
                };
                *results[i].lock().unwrap() = Some(outcome);
            }
        }
    });
    futures_util::future::join_all(workers).await;

    results
        .into_iter()
        .map(|slot| {
            slot.into_inner()
                .unwrap()
                .unwrap_or_else(|| Err(ConvertError::Internal("task never ran".into())))
        })
        .collect()
}

async fn run_one<T, R, F, Fut>(
    task: &TaskInput<T>,
    executor: &F,
    host_gates: &DashMap<String, Arc<tokio::sync::Mutex<HostGate>>>,
    opts: &DispatchOptions,
    stats: Option<&RuntimeStats>,
) -> Result<R, ConvertError>
where
    F: Fn(&T) -> Fut,
    Fut: Future<Output = Result<R, TaskFailure>>,
{
    let host = task_host(&task.url);
    let gate = host_gates
        .entry(host.clone())
        .or_insert_with(|| {
            Arc::new(tokio::sync::Mutex::new(HostGate {
                current_delay_ms: opts.base_delay_ms,
                next_allowed_at: Instant::now(),
            }))
        })
        .clone();

    // Holding the gate across execution pins the host to one worker.
    let mut gate = gate.lock().await;

    let mut attempt: u32 = 0;
    loop {
        let wait = gate.next_allowed_at.saturating_duration_since(Instant::now());
        if !wait.is_zero() {
            tokio::select! {
                _ = tokio::time::sleep(wait) => {}
                _ = opts.cancel.cancelled() => {
                    return Err(ConvertError::FetchFailed("aborted".into()));
                }
            }
        }

        let started = Instant::now();
        let result = tokio::select! {
            r = executor(&task.payload) => r,
            _ = opts.cancel.cancelled() => {
                return Err(ConvertError::FetchFailed("aborted".into()));
            }
        };

        if let Some(stats) = stats {
            RuntimeStats::incr(&stats.jobs_executed);
            stats.job_run.record(started.elapsed().as_secs_f64() * 1000.0);
        }

        match result {
            Ok(value) => {
                gate.current_delay_ms = decay_delay(gate.current_delay_ms, opts.base_delay_ms);
                gate.next_allowed_at = Instant::now()
                    + Duration::from_millis(opts.base_delay_ms.min(gate.current_delay_ms));
                return Ok(value);
            }
            Err(failure) => {
                let rate_limited = match failure.status {
                    Some(code) => opts.rate_limit_codes.contains(&code),
                    // Network-level failures carry no code and are retried.
                    None => true,
                };

                if let Some(code) = failure.status {
                    if opts.rate_limit_codes.contains(&code) {
                        metrics::counter!("mdgate_dispatch_rate_limited_total").increment(1);
                        if let Some(stats) = stats {
                            RuntimeStats::incr(&stats.rate_limited);
                        }
                    }
                }

                if rate_limited && attempt < opts.max_retries {
                    attempt += 1;
                    gate.current_delay_ms = grow_delay(gate.current_delay_ms, opts.max_delay_ms);
                    gate.next_allowed_at =
                        Instant::now() + Duration::from_millis(gate.current_delay_ms);
                    debug!(
                        "dispatch: retrying, host={}, attempt={}/{}, delay_ms={}",
                        host, attempt, opts.max_retries, gate.current_delay_ms
                    );
                    metrics::counter!("mdgate_dispatch_retries_total").increment(1);
                    if let Some(stats) = stats {
                        RuntimeStats::incr(&stats.job_retry_attempts);
                    }
                    continue;
                }

                if rate_limited {
                    gate.current_delay_ms = grow_delay(gate.current_delay_ms, opts.max_delay_ms);
                    gate.next_allowed_at =
                        Instant::now() + Duration::from_millis(gate.current_delay_ms);
                }
                return Err(failure.error);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    fn opts(max_retries: u32) -> DispatchOptions {
        DispatchOptions {
            concurrency: 4,
            max_retries,
            base_delay_ms: 1,
            max_delay_ms: 50,
            rate_limit_codes: vec![429, 503],
            cancel: CancellationToken::new(),
        }
    }

    fn task(url: &str) -> TaskInput<String> {
        TaskInput {
            url: Some(url.to_string()),
            payload: url.to_string(),
        }
    }

    #[tokio::test]
    async fn test_results_in_input_order() {
        let tasks: Vec<TaskInput<String>> = (0..8)
            .map(|i| task(&format!("https://h{}.example.com/{}", i, i)))
            .collect();
        let results = run_tasks(
            tasks,
            |payload| {
                let payload = payload.clone();
                async move { Ok::<_, TaskFailure>(payload) }
            },
            &opts(0),
            None,
        )
        .await;
        for (i, r) in results.iter().enumerate() {
            assert!(r.as_ref().unwrap().contains(&format!("/{}", i)));
        }
    }

    #[tokio::test]
    async fn test_rate_limit_codes_retry_up_to_max() {
        // Property: 429/503 retry up to max_retries; other codes attempt once.
        let calls = AtomicU32::new(0);
        let results = run_tasks(
            vec![task("https://a.example.com/1")],
            |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async {
                    Err::<(), _>(TaskFailure {
                        status: Some(429),
                        error: ConvertError::FetchFailed("Status: 429 Too Many Requests".into()),
                    })
                }
            },
            &opts(2),
            None,
        )
        .await;
        assert!(results[0].is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3); // initial + 2 retries

        let calls = AtomicU32::new(0);
        let results = run_tasks(
            vec![task("https://a.example.com/2")],
            |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async {
                    Err::<(), _>(TaskFailure {
                        status: Some(404),
                        error: ConvertError::FetchFailed("Status: 404 Not Found".into()),
                    })
                }
            },
            &opts(2),
            None,
        )
        .await;
        assert!(results[0].is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_missing_status_is_retried() {
        let calls = AtomicU32::new(0);
        let _ = run_tasks(
            vec![task("https://a.example.com/")],
            |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async {
                    Err::<(), _>(TaskFailure {
                        status: None,
                        error: ConvertError::FetchFailed("connection reset".into()),
                    })
                }
            },
            &opts(1),
            None,
        )
        .await;
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_same_host_is_serialized() {
        // Two tasks on one host never overlap; the in-flight counter must
        // stay at 1.
        let in_flight = Arc::new(AtomicU32::new(0));
        let max_seen = Arc::new(AtomicU32::new(0));
        let tasks: Vec<TaskInput<String>> = (0..4)
            .map(|i| task(&format!("https://same.example.com/{}", i)))
            .collect();

        let results = run_tasks(
            tasks,
            |_| {
                let in_flight = in_flight.clone();
                let max_seen = max_seen.clone();
                async move {
                    let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                    max_seen.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    in_flight.fetch_sub(1, Ordering::SeqCst);
                    Ok::<_, TaskFailure>(())
                }
            },
            &opts(0),
            None,
        )
        .await;
        assert!(results.iter().all(|r| r.is_ok()));
        assert_eq!(max_seen.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_cancellation_surfaces_aborted() {
        let options = DispatchOptions {
            cancel: CancellationToken::new(),
            ..opts(0)
        };
        options.cancel.cancel();
        let results = run_tasks(
            vec![task("https://a.example.com/"), task("https://b.example.com/")],
            |_| async { Ok::<_, TaskFailure>(()) },
            &options,
            None,
        )
        .await;
        for r in results {
            let err = r.unwrap_err();
            assert!(err.to_string().contains("aborted"));
        }
    }

    #[test]
    fn test_backoff_growth_and_decay() {
        for _ in 0..100 {
            let grown = grow_delay(100, 10_000);
            // 2x with jitter in [0.75, 1.25]
            assert!((150..=250).contains(&grown), "grown={}", grown);
        }
        assert_eq!(grow_delay(8_000, 10_000), 10_000);
        assert_eq!(decay_delay(1000, 250), 750);
        assert_eq!(decay_delay(300, 250), 250);
        assert_eq!(decay_delay(100, 250), 250);
    }

    #[test]
    fn test_task_host_extraction() {
        assert_eq!(
            task_host(&Some("https://News.Example.com/a".into())),
            "news.example.com"
        );
        assert_eq!(task_host(&Some("not a url".into())), DEFAULT_HOST);
        assert_eq!(task_host(&None), DEFAULT_HOST);
    }
}
