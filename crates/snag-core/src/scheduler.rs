//! Bounded-concurrency range scheduler. Splits the pending span into
//! chunks sized by the adaptive chunker, drives them over a permit pool
//! sized by the connection optimizer, and routes failures through the
//! retry classifier. Completion order is unconstrained; hashing and the
//! on-disk layout stay consistent through positioned writes and the
//! verifier's reorder cursor.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use futures_util::StreamExt;
use tokio::sync::watch;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, warn};

use crate::assembly::Assembly;
use crate::bandwidth::BandwidthEstimator;
use crate::chunker::AdaptiveChunker;
use crate::error::FetchError;
use crate::events::EventSink;
use crate::handler::{ProtocolHandler, Session};
use crate::integrity::IntegrityVerifier;
use crate::optimizer::{ConnectionOptimizer, TICK_INTERVAL};
use crate::plan::{Chunk, ChunkState, FetchPlan};
use crate::retry::{RetryClassifier, RetryDecision};
use crate::target::Target;

/// How long in-flight chunks get to finish after a cancel signal.
pub const CANCEL_GRACE: Duration = Duration::from_secs(2);

/// Concurrency budget with lazy shrink. Growing adds permits right away;
/// shrinking records a debt paid off as in-flight permits come back, so
/// running chunks are never cancelled by a decrease.
pub(crate) struct PermitPool {
    sem: Arc<Semaphore>,
    state: Mutex<PoolState>,
}

struct PoolState {
    size: usize,
    debt: usize,
}

impl PermitPool {
    pub fn new(size: usize) -> Self {
        Self {
            sem: Arc::new(Semaphore::new(size)),
            state: Mutex::new(PoolState { size, debt: 0 }),
        }
    }

    pub fn try_acquire(&self) -> Option<OwnedSemaphorePermit> {
        self.sem.clone().try_acquire_owned().ok()
    }

    /// Return a permit, consuming it against outstanding debt first.
    pub fn release(&self, permit: OwnedSemaphorePermit) {
        let mut state = self.state.lock().unwrap();
        if state.debt > 0 {
            state.debt -= 1;
            permit.forget();
        }
        // Dropping the permit hands it back to the semaphore.
    }

    pub fn resize(&self, new_size: usize) {
        let mut state = self.state.lock().unwrap();
        if new_size > state.size {
            let grow = new_size - state.size;
            // Growth first cancels debt, then mints fresh permits.
            let from_debt = grow.min(state.debt);
            state.debt -= from_debt;
            self.sem.add_permits(grow - from_debt);
        } else {
            let mut shrink = state.size - new_size;
            // Reclaim idle permits now; the rest becomes debt.
            while shrink > 0 {
                match self.sem.try_acquire() {
                    Ok(permit) => {
                        permit.forget();
                        shrink -= 1;
                    }
                    Err(_) => break,
                }
            }
            state.debt += shrink;
        }
        state.size = new_size;
    }

    pub fn size(&self) -> usize {
        self.state.lock().unwrap().size
    }
}

/// What the scheduler reports back on success.
#[derive(Debug)]
pub struct SchedulerReport {
    pub bytes: u64,
    pub peak_connections: usize,
}

/// Everything a chunk task shares with the orchestrator.
struct Shared {
    handler: Arc<dyn ProtocolHandler>,
    target: Target,
    assembly: Arc<Assembly>,
    estimator: Arc<Mutex<BandwidthEstimator>>,
    verifier: Arc<Mutex<IntegrityVerifier>>,
    sessions: Mutex<Vec<Box<dyn Session>>>,
    timeout: Duration,
}

enum TaskResult {
    Landed {
        chunk: Chunk,
        duration: Duration,
        permit: OwnedSemaphorePermit,
    },
    Failed {
        chunk: Chunk,
        error: FetchError,
        permit: OwnedSemaphorePermit,
    },
    /// Backoff sleep finished; the chunk goes back to the queue head.
    Requeue { chunk: Chunk },
}

pub struct Scheduler {
    handler: Arc<dyn ProtocolHandler>,
    target: Target,
    assembly: Arc<Assembly>,
    estimator: Arc<Mutex<BandwidthEstimator>>,
    verifier: Arc<Mutex<IntegrityVerifier>>,
    sink: Arc<dyn EventSink>,
    cancel: watch::Receiver<bool>,
    timeout: Duration,
}

impl Scheduler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        handler: Arc<dyn ProtocolHandler>,
        target: Target,
        assembly: Arc<Assembly>,
        estimator: Arc<Mutex<BandwidthEstimator>>,
        verifier: Arc<Mutex<IntegrityVerifier>>,
        sink: Arc<dyn EventSink>,
        cancel: watch::Receiver<bool>,
        timeout: Duration,
    ) -> Self {
        Self {
            handler,
            target,
            assembly,
            estimator,
            verifier,
            sink,
            cancel,
            timeout,
        }
    }

    /// Drive the plan's pending span to completion. Returns only once
    /// every byte of [resume_offset, total) has landed, or with the first
    /// terminal error.
    pub async fn run(self, plan: &FetchPlan) -> Result<SchedulerReport, FetchError> {
        let total = plan
            .total_size
            .expect("parallel mode requires a known total size");
        let span = total - plan.resume_offset;
        if span == 0 {
            return Ok(SchedulerReport {
                bytes: 0,
                peak_connections: 0,
            });
        }

        let mut optimizer = ConnectionOptimizer::new(plan.max_connections);
        if let Some(cap) = self.handler.capabilities(&self.target).max_concurrent_streams {
            optimizer.clamp_max(cap);
        }
        let mut chunker = AdaptiveChunker::new(plan.min_chunk, plan.max_chunk);
        let classifier = RetryClassifier::new();
        let pool = Arc::new(PermitPool::new(optimizer.target()));

        let shared = Arc::new(Shared {
            handler: self.handler.clone(),
            target: self.target.clone(),
            assembly: self.assembly.clone(),
            estimator: self.estimator.clone(),
            verifier: self.verifier.clone(),
            sessions: Mutex::new(Vec::new()),
            timeout: self.timeout,
        });

        let mut queue: VecDeque<Chunk> = VecDeque::new();
        queue.push_back(Chunk::new(plan.resume_offset, span));

        let mut join_set: JoinSet<TaskResult> = JoinSet::new();
        let mut tick = tokio::time::interval(TICK_INTERVAL);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        tick.reset();

        let mut cancel = self.cancel.clone();
        let mut cancel_open = true;
        let mut cancelled = *cancel.borrow();
        let mut grace_deadline: Option<Instant> = None;
        let mut landed_bytes: u64 = 0;
        let mut in_flight: usize = 0;
        let mut peak: usize = 0;
        let mut fatal: Option<FetchError> = None;

        loop {
            // Dispatch as long as a permit and pending work are available.
            while fatal.is_none() && !cancelled {
                if queue.is_empty() {
                    break;
                }
                let Some(permit) = pool.try_acquire() else {
                    break;
                };
                let Some(chunk) = next_work_unit(&mut queue, &mut chunker, &self.estimator)
                else {
                    pool.release(permit);
                    break;
                };
                in_flight += 1;
                peak = peak.max(in_flight);
                let shared = shared.clone();
                let task_cancel = cancel.clone();
                let pool_cap = pool.size();
                join_set.spawn(async move {
                    run_chunk(shared, chunk, task_cancel, pool_cap, permit).await
                });
            }

            if join_set.is_empty() {
                break;
            }

            tokio::select! {
                biased;

                changed = cancel.changed(), if !cancelled && cancel_open => {
                    if changed.is_err() {
                        cancel_open = false;
                    } else if *cancel.borrow() {
                        cancelled = true;
                        grace_deadline = Some(Instant::now() + CANCEL_GRACE);
                        debug!("cancel received, draining in-flight chunks");
                    }
                }

                _ = async {
                    match grace_deadline {
                        Some(deadline) => tokio::time::sleep_until(deadline.into()).await,
                        None => std::future::pending().await,
                    }
                }, if cancelled => {
                    warn!("cancel grace elapsed, aborting remaining chunks");
                    join_set.abort_all();
                    while join_set.join_next().await.is_some() {}
                    return Err(FetchError::Cancelled);
                }

                _ = tick.tick() => {
                    let rate = self.estimator.lock().unwrap().smoothed_rate();
                    if let Some((n, reason)) = optimizer.on_tick(rate) {
                        pool.resize(n);
                        self.sink.on_concurrency_changed(n, reason.as_str());
                    }
                    self.emit_progress(plan, landed_bytes, total);
                }

                Some(joined) = join_set.join_next() => {
                    let result = match joined {
                        Ok(result) => result,
                        Err(e) if e.is_cancelled() => continue,
                        Err(e) => {
                            fatal = Some(FetchError::TransientNetwork(format!("chunk task panicked: {e}")));
                            join_set.abort_all();
                            continue;
                        }
                    };
                    match result {
                        TaskResult::Landed { chunk, duration, permit } => {
                            in_flight -= 1;
                            pool.release(permit);
                            landed_bytes += chunk.length;
                            self.sink.on_chunk_landed(chunk.offset, chunk.length, duration);
                            self.emit_progress(plan, landed_bytes, total);
                        }
                        TaskResult::Failed { mut chunk, error, permit } => {
                            in_flight -= 1;
                            pool.release(permit);
                            if cancelled || fatal.is_some() {
                                continue;
                            }
                            let cls = classifier.classify(&error, chunk.attempt);
                            if cls.throttle {
                                let n = optimizer.on_throttle();
                                pool.resize(n);
                                self.sink.on_concurrency_changed(n, "throttled");
                            }
                            match cls.decision {
                                RetryDecision::RetryNow => {
                                    debug!(offset = chunk.offset, attempt = chunk.attempt, %error, "retrying chunk");
                                    self.sink.on_retry(cls.category.as_str(), Duration::ZERO, chunk.attempt);
                                    chunk.state = ChunkState::Pending;
                                    queue.push_front(chunk);
                                }
                                RetryDecision::RetryAfter(delay) => {
                                    debug!(offset = chunk.offset, attempt = chunk.attempt, ?delay, %error, "retrying chunk after backoff");
                                    self.sink.on_retry(cls.category.as_str(), delay, chunk.attempt);
                                    chunk.state = ChunkState::Pending;
                                    join_set.spawn(async move {
                                        tokio::time::sleep(delay).await;
                                        TaskResult::Requeue { chunk }
                                    });
                                }
                                RetryDecision::Fail => {
                                    warn!(offset = chunk.offset, attempt = chunk.attempt, %error, "chunk failed terminally");
                                    fatal = Some(error);
                                    join_set.abort_all();
                                }
                            }
                        }
                        TaskResult::Requeue { chunk } => {
                            queue.push_front(chunk);
                        }
                    }
                }
            }
        }

        // Close pooled sessions before reporting.
        let sessions = std::mem::take(&mut *shared.sessions.lock().unwrap());
        for mut session in sessions {
            session.close().await;
        }

        if let Some(error) = fatal {
            return Err(error);
        }
        if cancelled {
            return Err(FetchError::Cancelled);
        }
        debug_assert_eq!(landed_bytes, span);
        Ok(SchedulerReport {
            bytes: landed_bytes,
            peak_connections: peak,
        })
    }

    fn emit_progress(&self, plan: &FetchPlan, landed: u64, total: u64) {
        let est = self.estimator.lock().unwrap();
        let bytes = plan.resume_offset + landed;
        let rate = est.smoothed_rate().unwrap_or(0.0);
        let eta = est.eta(total.saturating_sub(bytes));
        drop(est);
        self.sink.on_progress(bytes, Some(total), rate, eta);
    }
}

/// Pop the next work unit, splitting the head down to the chunker's size.
/// The remainder of a split would-be fragment below the minimum stays
/// attached so the tail is handed out whole.
fn next_work_unit(
    queue: &mut VecDeque<Chunk>,
    chunker: &mut AdaptiveChunker,
    estimator: &Arc<Mutex<BandwidthEstimator>>,
) -> Option<Chunk> {
    let rate = estimator.lock().unwrap().smoothed_rate();
    let size = chunker.next_size(rate);
    let head = queue.pop_front()?;
    let (mut unit, rest) = if head.length > size && head.length - size >= chunker.min_size() {
        head.split_at(size)
    } else {
        (head, None)
    };
    if let Some(rest) = rest {
        queue.push_front(rest);
    }
    unit.state = ChunkState::InFlight;
    unit.attempt += 1;
    Some(unit)
}

/// Transfer one chunk: ranged read, stall detection, positioned write,
/// in-order hashing. Healthy sessions go back to the pool.
async fn run_chunk(
    shared: Arc<Shared>,
    chunk: Chunk,
    cancel: watch::Receiver<bool>,
    pool_cap: usize,
    permit: OwnedSemaphorePermit,
) -> TaskResult {
    match transfer_chunk(&shared, &chunk, cancel).await {
        Ok((duration, session)) => {
            let mut sessions = shared.sessions.lock().unwrap();
            // Keep at most one idle session per permit.
            if sessions.len() < pool_cap {
                sessions.push(session);
            }
            drop(sessions);
            let mut chunk = chunk;
            chunk.state = ChunkState::Landed;
            TaskResult::Landed {
                chunk,
                duration,
                permit,
            }
        }
        Err(error) => {
            let mut chunk = chunk;
            chunk.state = ChunkState::Failed;
            TaskResult::Failed {
                chunk,
                error,
                permit,
            }
        }
    }
}

async fn transfer_chunk(
    shared: &Shared,
    chunk: &Chunk,
    mut cancel: watch::Receiver<bool>,
) -> Result<(Duration, Box<dyn Session>), FetchError> {
    let pooled = shared.sessions.lock().unwrap().pop();
    let mut session = match pooled {
        Some(session) => session,
        None => shared.handler.open(&shared.target).await?,
    };

    let started = Instant::now();
    let mut stream = session.read_range(chunk.offset, chunk.length).await?;
    let mut buf: Vec<u8> = Vec::with_capacity(chunk.length as usize);
    let mut cancel_open = true;

    loop {
        let next = tokio::select! {
            biased;
            changed = cancel.changed(), if cancel_open => {
                if changed.is_err() {
                    cancel_open = false;
                } else if *cancel.borrow() {
                    return Err(FetchError::Cancelled);
                }
                continue;
            }
            item = tokio::time::timeout(shared.timeout, stream.next()) => {
                item.map_err(|_| FetchError::TransientNetwork("chunk stalled".into()))?
            }
        };
        let Some(item) = next else { break };
        let bytes = item?;
        shared
            .estimator
            .lock()
            .unwrap()
            .record(bytes.len() as u64);
        buf.extend_from_slice(&bytes);
    }
    drop(stream);

    if buf.is_empty() {
        return Err(FetchError::TransientNetwork(
            "connection closed before any data".into(),
        ));
    }
    if (buf.len() as u64) != chunk.length {
        return Err(FetchError::ProtocolDegraded(format!(
            "short range read: {} of {} bytes at offset {}",
            buf.len(),
            chunk.length,
            chunk.offset
        )));
    }

    let assembly = shared.assembly.clone();
    let offset = chunk.offset;
    let buf = tokio::task::spawn_blocking(move || -> std::io::Result<Vec<u8>> {
        assembly.write_at(offset, &buf)?;
        Ok(buf)
    })
    .await
    .map_err(|e| FetchError::TransientNetwork(format!("write task failed: {e}")))??;

    shared.verifier.lock().unwrap().accept(chunk.offset, buf);
    Ok((started.elapsed(), session))
}
