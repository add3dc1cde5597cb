//! Fetch controller: probe, plan, execute, verify, finalize. Owns mirror
//! selection, resume, the parallel-to-single degradation path, and the
//! terminal outcome record. Everything here is scoped to one fetch.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use futures_util::future::join_all;
use futures_util::StreamExt;
use tokio::io::AsyncWriteExt;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::assembly::{self, Assembly, PartialMeta};
use crate::bandwidth::BandwidthEstimator;
use crate::error::FetchError;
use crate::events::EventSink;
use crate::handler::{HandlerConfig, HandlerRegistry, ProtocolHandler};
use crate::integrity::{check_digest, IntegrityVerifier};
use crate::optimizer::ConnectionOptimizer;
use crate::plan::{FetchMode, FetchPlan};
use crate::probe::ProbeResult;
use crate::request::{FetchFailure, FetchOutcome, FetchRequest, FetchSummary, OutputTarget};
use crate::retry::{RetryClassifier, RetryDecision};
use crate::scheduler::Scheduler;
use crate::target::Target;

/// Bytes buffered before a positioned write in single-stream mode.
const WRITE_FLUSH: usize = 1 << 20;

/// Cancels the fetch it was created with. Dropping it without calling
/// `cancel` lets the fetch run to completion.
pub struct CancelHandle(Arc<watch::Sender<bool>>);

impl CancelHandle {
    pub fn cancel(&self) {
        let _ = self.0.send(true);
    }
}

/// Failure bookkeeping surfaced in the terminal record.
#[derive(Default)]
struct JobState {
    partial_bytes: u64,
    can_resume: bool,
}

/// Top-level fetch state machine. One instance drives one fetch.
pub struct Fetcher {
    sink: Arc<dyn EventSink>,
    plugins: Vec<Arc<dyn ProtocolHandler>>,
    cancel_rx: watch::Receiver<bool>,
    _cancel_tx: Arc<watch::Sender<bool>>,
}

impl Fetcher {
    pub fn new(sink: Arc<dyn EventSink>) -> (Self, CancelHandle) {
        let (tx, rx) = watch::channel(false);
        let tx = Arc::new(tx);
        (
            Self {
                sink,
                plugins: Vec::new(),
                cancel_rx: rx,
                _cancel_tx: tx.clone(),
            },
            CancelHandle(tx),
        )
    }

    /// Register a plugin protocol handler. Later registrations override
    /// the built-ins for the schemes they claim.
    pub fn register_handler(&mut self, handler: Arc<dyn ProtocolHandler>) {
        self.plugins.push(handler);
    }

    /// Run the fetch to a terminal record. Transient trouble is absorbed
    /// internally; whatever comes back here is final.
    pub async fn run(&self, request: FetchRequest) -> FetchOutcome {
        let started = Instant::now();
        let mut state = JobState::default();
        let outcome = match self.execute(&request, started, &mut state).await {
            Ok(summary) => FetchOutcome::Success(summary),
            Err(err) => FetchOutcome::Failure(FetchFailure {
                kind: err.kind(),
                message: err.to_string(),
                partial_bytes: state.partial_bytes,
                can_resume: state.can_resume,
            }),
        };
        self.sink.on_complete(&outcome);
        outcome
    }

    async fn execute(
        &self,
        request: &FetchRequest,
        started: Instant,
        state: &mut JobState,
    ) -> Result<FetchSummary, FetchError> {
        let config = HandlerConfig {
            timeout: request.timeout,
            proxy: request.proxy.clone(),
            verify_tls: request.verify_tls,
            pins: request.pins.clone(),
            headers: request.headers.clone(),
            cookie: request.cookie.clone(),
            http3: request.http3,
        };
        let mut registry = HandlerRegistry::builtin(&config)?;
        for plugin in &self.plugins {
            registry.register(plugin.clone());
        }

        let mut targets = Vec::new();
        for raw in &request.urls {
            targets.push(Target::parse(raw)?);
        }
        if targets.is_empty() {
            return Err(FetchError::UnsupportedScheme("no url given".into()));
        }

        // PROBING, with the mirror race when several URLs were supplied.
        let (target, handler, probe) = self.probe_targets(&registry, targets).await?;
        self.sink.on_probe(&probe);
        info!(
            url = target.as_str(),
            protocol = %probe.protocol,
            length = ?probe.content_length,
            ranges = probe.supports_range,
            "probe complete"
        );

        let estimator = Arc::new(Mutex::new(BandwidthEstimator::new()));
        let verifier = Arc::new(Mutex::new(IntegrityVerifier::new()));

        match &request.output {
            OutputTarget::Stdout => {
                self.run_stream(request, &target, handler, &probe, estimator, verifier, started)
                    .await
            }
            OutputTarget::File(path) => {
                let plan = self.make_plan(request, &target, &probe, path.clone());
                self.sink.on_plan(&plan);
                self.run_to_file(
                    request, plan, &target, handler, &probe, estimator, verifier, started, state,
                )
                .await
            }
        }
    }

    /// Probe every candidate concurrently and pick the winner: lowest
    /// latency, known content length beating unknown, then URL order.
    async fn probe_targets(
        &self,
        registry: &HandlerRegistry,
        targets: Vec<Target>,
    ) -> Result<(Target, Arc<dyn ProtocolHandler>, ProbeResult), FetchError> {
        let mut entries = Vec::with_capacity(targets.len());
        for target in targets {
            let handler = registry.for_target(&target)?;
            entries.push((target, handler));
        }

        if entries.len() == 1 {
            let (target, handler) = entries.pop().unwrap();
            let probe = handler.probe(&target).await?;
            return Ok((target, handler, probe));
        }

        let probes = join_all(
            entries
                .iter()
                .map(|(target, handler)| handler.probe(target)),
        )
        .await;

        let mut best: Option<usize> = None;
        let mut probes: Vec<Option<Result<ProbeResult, FetchError>>> =
            probes.into_iter().map(Some).collect();
        for (idx, slot) in probes.iter().enumerate() {
            let Some(Ok(probe)) = slot else { continue };
            let better = match best {
                None => true,
                Some(prev) => {
                    let Some(Ok(prev_probe)) = &probes[prev] else {
                        unreachable!()
                    };
                    let key = (
                        probe.latency,
                        probe.content_length.is_none(),
                        entries[idx].0.as_str().to_string(),
                    );
                    let prev_key = (
                        prev_probe.latency,
                        prev_probe.content_length.is_none(),
                        entries[prev].0.as_str().to_string(),
                    );
                    key < prev_key
                }
            };
            if better {
                best = Some(idx);
            }
        }

        match best {
            Some(idx) => {
                let probe = probes[idx].take().unwrap().unwrap();
                let (target, handler) = entries.swap_remove(idx);
                debug!(url = target.as_str(), "mirror probe winner");
                Ok((target, handler, probe))
            }
            None => {
                // Surface the first probe error.
                let err = probes
                    .into_iter()
                    .flatten()
                    .find_map(|r| r.err())
                    .unwrap_or_else(|| FetchError::TransientNetwork("all probes failed".into()));
                Err(err)
            }
        }
    }

    fn make_plan(
        &self,
        request: &FetchRequest,
        target: &Target,
        probe: &ProbeResult,
        output: PathBuf,
    ) -> FetchPlan {
        let mode = if probe.supports_range && probe.content_length.is_some() {
            FetchMode::Parallel
        } else {
            FetchMode::Single
        };

        // Resume only when the sidecar still matches the server's story
        // and the protocol can actually continue mid-object.
        let mut resume_offset = 0;
        if request.resume && probe.supports_range {
            if let Some(total) = probe.content_length {
                if let Some(meta) = PartialMeta::load(&output) {
                    if meta.matches(target.as_str(), total, &probe.validators)
                        && assembly::partial_path(&output).exists()
                    {
                        resume_offset = meta.committed.min(total);
                        info!(resume_offset, "resuming from recorded progress");
                    } else {
                        debug!("stale or unverifiable partial, starting over");
                    }
                }
            }
        }

        FetchPlan {
            mode,
            partial: assembly::partial_path(&output),
            output,
            total_size: probe.content_length,
            resume_offset,
            initial_connections: ConnectionOptimizer::new(request.max_connections).target(),
            max_connections: request.max_connections,
            min_chunk: request.min_chunk,
            max_chunk: request.max_chunk,
            expected_sha256: request.expected_sha256.clone(),
            validators: probe.validators.clone(),
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_to_file(
        &self,
        request: &FetchRequest,
        mut plan: FetchPlan,
        target: &Target,
        handler: Arc<dyn ProtocolHandler>,
        probe: &ProbeResult,
        estimator: Arc<Mutex<BandwidthEstimator>>,
        verifier: Arc<Mutex<IntegrityVerifier>>,
        started: Instant,
        state: &mut JobState,
    ) -> Result<FetchSummary, FetchError> {
        let assembly = if plan.resume_offset > 0 {
            match Assembly::open_resume(&plan.output, plan.total_size) {
                Ok((asm, _)) => Arc::new(asm),
                Err(e) => {
                    warn!(error = %e, "cannot reopen partial, starting over");
                    plan.resume_offset = 0;
                    Arc::new(Assembly::create(&plan.output, plan.total_size)?)
                }
            }
        } else {
            Arc::new(Assembly::create(&plan.output, plan.total_size)?)
        };

        if let Some(total) = plan.total_size {
            if plan.validators.usable() {
                PartialMeta::new(target.as_str(), total, plan.resume_offset, &plan.validators)
                    .store(&plan.output)?;
            }
        }

        // The digest must cover the resumed prefix too.
        if plan.resume_offset > 0 {
            rehash_prefix(&assembly, plan.resume_offset, &verifier).await?;
            let cursor = verifier.lock().unwrap().cursor();
            if cursor != plan.resume_offset {
                warn!(cursor, expected = plan.resume_offset, "prefix shorter than recorded, starting over");
                plan.resume_offset = 0;
                *verifier.lock().unwrap() = IntegrityVerifier::new();
                assembly.truncate_to(0)?;
                if let Some(total) = plan.total_size {
                    assembly.truncate_to(total)?;
                }
            }
        }

        let mut peak_connections = 1;
        if plan.total_size != Some(0) {
            match plan.mode {
                FetchMode::Parallel => {
                    let scheduler = Scheduler::new(
                        handler.clone(),
                        target.clone(),
                        assembly.clone(),
                        estimator.clone(),
                        verifier.clone(),
                        self.sink.clone(),
                        self.cancel_rx.clone(),
                        request.timeout,
                    );
                    match scheduler.run(&plan).await {
                        Ok(report) => peak_connections = report.peak_connections.max(1),
                        Err(FetchError::ProtocolDegraded(reason)) => {
                            info!(%reason, "range transfer degraded, replanning as single stream");
                            plan.mode = FetchMode::Single;
                            // Ranges cannot be trusted; restart the body
                            // from zero on one stream.
                            plan.resume_offset = 0;
                            *verifier.lock().unwrap() = IntegrityVerifier::new();
                            self.run_single(request, &plan, target, &handler, false, &assembly, &estimator, &verifier)
                                .await
                                .map_err(|e| self.note_failure(e, &plan, &verifier, state))?;
                        }
                        Err(e) => return Err(self.note_failure(e, &plan, &verifier, state)),
                    }
                }
                FetchMode::Single | FetchMode::Stream => {
                    self.run_single(request, &plan, target, &handler, probe.supports_range, &assembly, &estimator, &verifier)
                        .await
                        .map_err(|e| self.note_failure(e, &plan, &verifier, state))?;
                }
            }
        }

        // VERIFYING
        let cursor = verifier.lock().unwrap().cursor();
        if let Some(total) = plan.total_size {
            if cursor != total {
                let err = FetchError::TransientNetwork(format!(
                    "transfer incomplete: {cursor} of {total} bytes"
                ));
                return Err(self.note_failure(err, &plan, &verifier, state));
            }
        }
        let taken = std::mem::take(&mut *verifier.lock().unwrap());
        let digest = taken.finish();
        if let Some(expected) = &plan.expected_sha256 {
            if let Err(err) = check_digest(&digest, expected) {
                // A corrupt partial must not survive for resume.
                let _ = assembly.discard();
                state.partial_bytes = 0;
                state.can_resume = false;
                return Err(err);
            }
        }

        // FINALIZING
        if plan.total_size.is_none() {
            assembly.truncate_to(cursor)?;
        }
        let asm = assembly.clone();
        tokio::task::spawn_blocking(move || asm.finalize())
            .await
            .map_err(|e| FetchError::TransientNetwork(format!("finalize task failed: {e}")))??;

        let duration = started.elapsed();
        let transferred = estimator.lock().unwrap().total_bytes();
        Ok(FetchSummary {
            bytes: cursor,
            duration,
            avg_throughput: transferred as f64 / duration.as_secs_f64().max(f64::EPSILON),
            sha256: digest,
            protocol_used: probe.protocol.clone(),
            connections_used: peak_connections,
        })
    }

    /// One stream into the assembly file, retried through the classifier.
    /// With `allow_range` the retry continues from the verified cursor;
    /// otherwise every attempt restarts the body and the digest.
    #[allow(clippy::too_many_arguments)]
    async fn run_single(
        &self,
        request: &FetchRequest,
        plan: &FetchPlan,
        target: &Target,
        handler: &Arc<dyn ProtocolHandler>,
        allow_range: bool,
        assembly: &Arc<Assembly>,
        estimator: &Arc<Mutex<BandwidthEstimator>>,
        verifier: &Arc<Mutex<IntegrityVerifier>>,
    ) -> Result<(), FetchError> {
        let classifier = RetryClassifier::new();
        let mut attempt = 0;
        loop {
            attempt += 1;
            let result = self
                .single_pass(request, plan, target, handler, allow_range, assembly, estimator, verifier)
                .await;
            let err = match result {
                Ok(()) => return Ok(()),
                Err(err) => err,
            };
            let cls = classifier.classify(&err, attempt);
            match cls.decision {
                RetryDecision::Fail => return Err(err),
                RetryDecision::RetryNow => {}
                RetryDecision::RetryAfter(delay) => {
                    self.sink.on_retry(cls.category.as_str(), delay, attempt);
                    tokio::time::sleep(delay).await;
                }
            }
            debug!(attempt, %err, "retrying single stream");
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn single_pass(
        &self,
        request: &FetchRequest,
        plan: &FetchPlan,
        target: &Target,
        handler: &Arc<dyn ProtocolHandler>,
        allow_range: bool,
        assembly: &Arc<Assembly>,
        estimator: &Arc<Mutex<BandwidthEstimator>>,
        verifier: &Arc<Mutex<IntegrityVerifier>>,
    ) -> Result<(), FetchError> {
        let mut start_offset = verifier.lock().unwrap().cursor();
        let use_range = allow_range && plan.total_size.is_some() && start_offset > 0;
        if !use_range && start_offset > 0 {
            // Cannot seek into the body, so the digest starts over.
            *verifier.lock().unwrap() = IntegrityVerifier::new();
            start_offset = 0;
        }
        let mut session = handler.open(target).await?;
        let mut stream = match (use_range, plan.total_size) {
            (true, Some(total)) => session.read_range(start_offset, total - start_offset).await?,
            _ => session.read_all().await?,
        };

        let mut write_offset = start_offset;
        let mut pending: Vec<u8> = Vec::with_capacity(WRITE_FLUSH);
        let mut cancel = self.cancel_rx.clone();
        let mut cancel_open = true;

        loop {
            let next = tokio::select! {
                biased;
                changed = cancel.changed(), if cancel_open => {
                    if changed.is_err() {
                        cancel_open = false;
                    } else if *cancel.borrow() {
                        flush_pending(assembly, verifier, &mut write_offset, &mut pending).await?;
                        return Err(FetchError::Cancelled);
                    }
                    continue;
                }
                item = tokio::time::timeout(request.timeout, stream.next()) => {
                    item.map_err(|_| FetchError::TransientNetwork("stream stalled".into()))?
                }
            };
            let Some(item) = next else { break };
            let bytes = item?;
            estimator.lock().unwrap().record(bytes.len() as u64);
            pending.extend_from_slice(&bytes);
            if pending.len() >= WRITE_FLUSH {
                flush_pending(assembly, verifier, &mut write_offset, &mut pending).await?;
                self.emit_progress(plan, estimator, write_offset);
            }
        }
        flush_pending(assembly, verifier, &mut write_offset, &mut pending).await?;
        self.emit_progress(plan, estimator, write_offset);
        session.close().await;

        // With a known total a short stream is retryable trouble; with an
        // unknown total EOF is the only signal the object is complete.
        if let Some(total) = plan.total_size {
            if write_offset < total {
                return Err(FetchError::TransientNetwork(format!(
                    "stream ended early: {write_offset} of {total} bytes"
                )));
            }
        }
        Ok(())
    }

    /// STREAM mode: pipe to stdout while hashing. No assembly file, no
    /// resume, and no retry once bytes have been emitted.
    #[allow(clippy::too_many_arguments)]
    async fn run_stream(
        &self,
        request: &FetchRequest,
        target: &Target,
        handler: Arc<dyn ProtocolHandler>,
        probe: &ProbeResult,
        estimator: Arc<Mutex<BandwidthEstimator>>,
        verifier: Arc<Mutex<IntegrityVerifier>>,
        started: Instant,
    ) -> Result<FetchSummary, FetchError> {
        let mut session = handler.open(target).await?;
        let mut stream = session.read_all().await?;
        let mut stdout = tokio::io::stdout();
        let mut written: u64 = 0;
        let mut cancel = self.cancel_rx.clone();
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
                item = tokio::time::timeout(request.timeout, stream.next()) => {
                    item.map_err(|_| FetchError::TransientNetwork("stream stalled".into()))?
                }
            };
            let Some(item) = next else { break };
            let bytes = item?;
            estimator.lock().unwrap().record(bytes.len() as u64);
            verifier.lock().unwrap().accept(written, bytes.to_vec());
            stdout.write_all(&bytes).await?;
            written += bytes.len() as u64;
            self.sink.on_progress(
                written,
                probe.content_length,
                estimator.lock().unwrap().smoothed_rate().unwrap_or(0.0),
                None,
            );
        }
        stdout.flush().await?;
        session.close().await;

        if let Some(total) = probe.content_length {
            if written != total {
                return Err(FetchError::TransientNetwork(format!(
                    "stream ended early: {written} of {total} bytes"
                )));
            }
        }

        let taken = std::mem::take(&mut *verifier.lock().unwrap());
        let digest = taken.finish();
        if let Some(expected) = &request.expected_sha256 {
            check_digest(&digest, expected)?;
        }
        let duration = started.elapsed();
        Ok(FetchSummary {
            bytes: written,
            duration,
            avg_throughput: written as f64 / duration.as_secs_f64().max(f64::EPSILON),
            sha256: digest,
            protocol_used: probe.protocol.clone(),
            connections_used: 1,
        })
    }

    fn emit_progress(
        &self,
        plan: &FetchPlan,
        estimator: &Arc<Mutex<BandwidthEstimator>>,
        bytes: u64,
    ) {
        let est = estimator.lock().unwrap();
        let rate = est.smoothed_rate().unwrap_or(0.0);
        let eta = plan
            .total_size
            .and_then(|total| est.eta(total.saturating_sub(bytes)));
        drop(est);
        self.sink.on_progress(bytes, plan.total_size, rate, eta);
    }

    /// Record partial/resume state for the terminal failure record. The
    /// partial survives only when a consistent prefix exists.
    fn note_failure(
        &self,
        err: FetchError,
        plan: &FetchPlan,
        verifier: &Arc<Mutex<IntegrityVerifier>>,
        state: &mut JobState,
    ) -> FetchError {
        let cursor = verifier.lock().unwrap().cursor();
        state.partial_bytes = cursor;
        state.can_resume = false;
        if cursor > 0 {
            if plan.total_size.is_some() && plan.validators.usable() {
                // The sidecar was written at planning time; refresh its
                // committed watermark so the next run picks up here.
                if let Some(mut meta) = PartialMeta::load(&plan.output) {
                    meta.committed = cursor;
                    if meta.store(&plan.output).is_ok() {
                        state.can_resume = true;
                    }
                }
            }
        } else {
            // Nothing usable landed; leave no debris behind.
            let _ = std::fs::remove_file(&plan.partial);
            let _ = std::fs::remove_file(assembly::meta_path(&plan.output));
        }
        err
    }
}

/// Feed the existing on-disk prefix through the verifier so the digest
/// covers resumed bytes.
async fn rehash_prefix(
    assembly: &Arc<Assembly>,
    upto: u64,
    verifier: &Arc<Mutex<IntegrityVerifier>>,
) -> Result<(), FetchError> {
    let path = assembly.partial_path().to_path_buf();
    let verifier = verifier.clone();
    tokio::task::spawn_blocking(move || -> std::io::Result<()> {
        use std::io::Read;
        let mut file = std::fs::File::open(&path)?;
        let mut buf = vec![0u8; WRITE_FLUSH];
        let mut offset = 0u64;
        while offset < upto {
            let want = buf.len().min((upto - offset) as usize);
            let read = file.read(&mut buf[..want])?;
            if read == 0 {
                break;
            }
            verifier.lock().unwrap().accept(offset, buf[..read].to_vec());
            offset += read as u64;
        }
        Ok(())
    })
    .await
    .map_err(|e| FetchError::TransientNetwork(format!("rehash task failed: {e}")))??;
    Ok(())
}

async fn flush_pending(
    assembly: &Arc<Assembly>,
    verifier: &Arc<Mutex<IntegrityVerifier>>,
    write_offset: &mut u64,
    pending: &mut Vec<u8>,
) -> Result<(), FetchError> {
    if pending.is_empty() {
        return Ok(());
    }
    let buf = std::mem::take(pending);
    let offset = *write_offset;
    let assembly = assembly.clone();
    let buf = tokio::task::spawn_blocking(move || -> std::io::Result<Vec<u8>> {
        assembly.write_at(offset, &buf)?;
        Ok(buf)
    })
    .await
    .map_err(|e| FetchError::TransientNetwork(format!("write task failed: {e}")))??;
    *write_offset += buf.len() as u64;
    verifier.lock().unwrap().accept(offset, buf);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::NullSink;

    #[test]
    fn test_cancel_handle_flips_watch() {
        let (fetcher, handle) = Fetcher::new(Arc::new(NullSink));
        assert!(!*fetcher.cancel_rx.borrow());
        handle.cancel();
        assert!(*fetcher.cancel_rx.borrow());
    }

    #[tokio::test]
    async fn test_unknown_scheme_fails_fast() {
        let (fetcher, _handle) = Fetcher::new(Arc::new(NullSink));
        let request = crate::request::FetchRequest::new(
            "gopher://example.com/x",
            OutputTarget::File(PathBuf::from("/tmp/never-created")),
        );
        let outcome = fetcher.run(request).await;
        match outcome {
            FetchOutcome::Failure(f) => {
                assert_eq!(f.kind, crate::error::FetchErrorKind::UnsupportedScheme);
                assert_eq!(f.partial_bytes, 0);
                assert!(!f.can_resume);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_malformed_url_fails_fast() {
        let (fetcher, _handle) = Fetcher::new(Arc::new(NullSink));
        let request = crate::request::FetchRequest::new(
            "not a url at all",
            OutputTarget::Stdout,
        );
        let outcome = fetcher.run(request).await;
        assert!(!outcome.is_success());
    }
}
