//! Evaluation pipeline: bounded request queue → worker pool → bounded result
//! queue → router → per-requester mailboxes.

use crossbeam_channel::{bounded, select, unbounded, Receiver, Sender};
use dashmap::DashMap;
use sg_cache::ResultCache;
use sg_types::{Evaluator, InputRow, PipelineConfig, SgResult};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, info, trace, warn};

use crate::cancel::CancelSignal;
use crate::message::{EvaluationRequest, EvaluationResult};
use crate::requester::{Mailboxes, Requester};
use crate::stats::{PipelineStats, PipelineStatsSnapshot};
use crate::token::{IdGenerator, RequesterId};
use crate::worker::Worker;

/// How long shutdown waits for a worker stuck inside an evaluator call
/// before detaching it.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

/// Fixed pool of evaluator workers between two bounded queues.
///
/// Submitting to a full request queue blocks the submitter, and results are
/// routed back by correlation token, so any number of requesters can share
/// one pipeline without seeing each other's results.
///
/// The router drains the result queue into unbounded per-requester
/// mailboxes, so `result_ring_size` bounds only the hop between workers and
/// the router. A requester never has more than one batch in flight, which
/// keeps each mailbox at most one batch deep plus stale stragglers from a
/// timed-out batch.
pub struct EvaluationPipeline {
    requests: Sender<EvaluationRequest>,
    mailboxes: Mailboxes,
    evaluator: Arc<dyn Evaluator>,
    cache: Arc<dyn ResultCache>,
    cancel: CancelSignal,
    stats: Arc<PipelineStats>,
    ids: IdGenerator,
    config: PipelineConfig,
    workers: Vec<JoinHandle<()>>,
    router: Option<JoinHandle<()>>,
}

impl EvaluationPipeline {
    pub fn start(
        config: &PipelineConfig,
        evaluator: Arc<dyn Evaluator>,
        cache: Arc<dyn ResultCache>,
    ) -> SgResult<Self> {
        Self::start_with_cancel(config, evaluator, cache, &CancelSignal::new())
    }

    /// Start under an externally owned signal: cancelling `parent` stops the
    /// pipeline, while shutting the pipeline down leaves `parent` untouched.
    pub fn start_with_cancel(
        config: &PipelineConfig,
        evaluator: Arc<dyn Evaluator>,
        cache: Arc<dyn ResultCache>,
        parent: &CancelSignal,
    ) -> SgResult<Self> {
        config.validate()?;
        let cancel = parent.child();

        let (request_tx, request_rx) = bounded(config.request_ring_size);
        let (result_tx, result_rx) = bounded(config.result_ring_size);
        let stats = Arc::new(PipelineStats::default());
        let mailboxes: Mailboxes = Arc::new(DashMap::new());

        let mut pipeline = Self {
            requests: request_tx,
            mailboxes: Arc::clone(&mailboxes),
            evaluator: Arc::clone(&evaluator),
            cache: Arc::clone(&cache),
            cancel: cancel.clone(),
            stats: Arc::clone(&stats),
            ids: IdGenerator::new(),
            config: config.clone(),
            workers: Vec::with_capacity(config.evaluator_threads),
            router: None,
        };

        for id in 0..config.evaluator_threads {
            let worker = Worker {
                id,
                requests: request_rx.clone(),
                results: result_tx.clone(),
                evaluator: Arc::clone(&evaluator),
                cache: Arc::clone(&cache),
                cancel: cancel.clone(),
                stats: Arc::clone(&stats),
            };
            // On spawn failure `pipeline` drops here and tears down what
            // already started.
            let handle = thread::Builder::new()
                .name(format!("sg-worker-{id}"))
                .spawn(move || worker.run())?;
            pipeline.workers.push(handle);
        }
        drop(result_tx);

        let router = {
            let cancel = cancel.clone();
            thread::Builder::new()
                .name("sg-router".to_string())
                .spawn(move || route_results(result_rx, mailboxes, cancel, stats))?
        };
        pipeline.router = Some(router);

        info!(
            evaluator = %evaluator.name(),
            version = %evaluator.version(),
            workers = config.evaluator_threads,
            request_ring = config.request_ring_size,
            result_ring = config.result_ring_size,
            cache = cache.backend_name(),
            "evaluation pipeline started"
        );

        Ok(pipeline)
    }

    /// Attach a new requester with its own mailbox.
    pub fn requester(&self) -> Requester {
        let id = RequesterId(self.ids.next_id());
        let (tx, rx) = unbounded();
        self.mailboxes.insert(id, tx);
        debug!(requester = %id, "requester attached");

        Requester {
            id,
            requests: self.requests.clone(),
            mailbox: rx,
            mailboxes: Arc::clone(&self.mailboxes),
            input_keys: self.evaluator.input_keys().clone(),
            cancel: self.cancel.clone(),
            stats: Arc::clone(&self.stats),
            request_timeout: self.config.request_timeout(),
            submit_timeout: self.config.submit_timeout(),
            request_capacity: self.config.request_ring_size,
            next_batch: 0,
        }
    }

    /// One-off batch through a temporary requester.
    pub fn evaluate_batch(&self, inputs: Vec<InputRow>) -> Vec<EvaluationResult> {
        self.requester().evaluate_batch(inputs)
    }

    pub fn evaluator(&self) -> &Arc<dyn Evaluator> {
        &self.evaluator
    }

    pub fn cache(&self) -> &Arc<dyn ResultCache> {
        &self.cache
    }

    pub fn cancel_signal(&self) -> &CancelSignal {
        &self.cancel
    }

    /// Stop accepting requests and wake every blocked participant.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn stats(&self) -> PipelineStatsSnapshot {
        self.stats.snapshot()
    }

    /// Cancel, then wait for the router and the workers. In-flight requests
    /// are discarded.
    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        if self.workers.is_empty() && self.router.is_none() {
            return;
        }
        self.cancel.cancel();

        if let Some(router) = self.router.take() {
            let _ = router.join();
        }

        let deadline = Instant::now() + SHUTDOWN_GRACE;
        let mut detached = 0;
        for handle in self.workers.drain(..) {
            while !handle.is_finished() && Instant::now() < deadline {
                thread::sleep(Duration::from_millis(1));
            }
            if handle.is_finished() {
                let _ = handle.join();
            } else {
                detached += 1;
            }
        }
        if detached > 0 {
            warn!(detached, "workers still inside evaluator calls at shutdown, detaching");
        }

        info!(stats = ?self.stats.snapshot(), "evaluation pipeline stopped");
    }
}

impl Drop for EvaluationPipeline {
    fn drop(&mut self) {
        self.stop();
    }
}

fn route_results(
    results: Receiver<EvaluationResult>,
    mailboxes: Mailboxes,
    cancel: CancelSignal,
    stats: Arc<PipelineStats>,
) {
    loop {
        let result = select! {
            recv(results) -> msg => match msg {
                Ok(result) => result,
                Err(_) => break,
            },
            recv(cancel.watch()) -> _ => break,
        };

        let token = result.token;
        let delivered = match mailboxes.get(&token.requester) {
            Some(mailbox) => mailbox.send(result).is_ok(),
            None => false,
        };
        if !delivered {
            trace!(?token, "no mailbox for result, discarding");
            stats.record_discarded();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{input, Doubler};
    use sg_cache::{LruCache, NoopCache};
    use sg_types::{CacheBackend, EvaluationError, KeySet, PipelineError};
    use std::collections::HashSet;

    fn config(threads: usize) -> PipelineConfig {
        PipelineConfig {
            evaluator_threads: threads,
            request_ring_size: 64,
            result_ring_size: 64,
            max_cache_size: 1024,
            cache_backend: CacheBackend::Lru,
            ..Default::default()
        }
    }

    fn start(config: &PipelineConfig, doubler: &Arc<Doubler>, cache: Arc<dyn ResultCache>) -> EvaluationPipeline {
        EvaluationPipeline::start(config, doubler.clone(), cache).unwrap()
    }

    #[test]
    fn test_second_request_is_served_from_cache() {
        let doubler = Arc::new(Doubler::default());
        let pipeline = start(&config(2), &doubler, Arc::new(LruCache::new(16)));
        let mut requester = pipeline.requester();

        let first = requester.evaluate_batch(vec![input(3.0)]);
        let second = requester.evaluate_batch(vec![input(3.0)]);

        assert_eq!(doubler.calls(), 1);
        assert!(!first[0].cached);
        assert!(second[0].cached);
        assert_eq!(first[0].row(), second[0].row());
        assert_eq!(second[0].row().unwrap().objective(), 6.0);
        assert_eq!(pipeline.stats().cache_hits, 1);
    }

    #[test]
    fn test_noop_cache_evaluates_every_request() {
        let doubler = Arc::new(Doubler::default());
        let pipeline = start(&config(3), &doubler, Arc::new(NoopCache::new()));
        let mut requester = pipeline.requester();

        for _ in 0..3 {
            let results = requester.evaluate_batch(vec![input(1.0); 4]);
            assert!(results.iter().all(|r| r.is_success() && !r.cached));
        }
        assert_eq!(doubler.calls(), 12);
    }

    #[test]
    fn test_every_request_gets_exactly_one_result() {
        let doubler = Arc::new(Doubler::default());
        let pipeline = start(&config(4), &doubler, Arc::new(LruCache::new(16)));
        let mut requester = pipeline.requester();

        let xs: Vec<f64> = (0..50).map(|i| (i as f64 - 25.0) * 0.5).collect();
        let results = requester.evaluate_batch(xs.iter().map(|x| input(*x)).collect());

        assert_eq!(results.len(), 50);
        for (slot, (x, result)) in xs.iter().zip(&results).enumerate() {
            assert_eq!(result.token.slot, slot);
            assert_eq!(result.token.requester, requester.id());
            if *x < 0.0 {
                assert!(matches!(result.error(), Some(EvaluationError::Failed { .. })));
            } else {
                assert_eq!(result.row().unwrap().input().get("x"), Some(*x));
            }
        }
        let stats = pipeline.stats();
        assert_eq!(stats.submitted, 50);
        assert_eq!(stats.completed, 50);
        assert_eq!(stats.failed, 25);
    }

    #[test]
    fn test_tiny_rings_apply_backpressure_without_deadlock() {
        let doubler = Arc::new(Doubler::default());
        let config = PipelineConfig {
            request_ring_size: 1,
            result_ring_size: 1,
            ..config(2)
        };
        let pipeline = start(&config, &doubler, Arc::new(NoopCache::new()));

        let results = pipeline.evaluate_batch((0..64).map(|i| input(i as f64 * 0.5 + 0.25)).collect());
        assert_eq!(results.len(), 64);
        assert!(results.iter().all(|r| r.is_success()));
        assert_eq!(doubler.calls(), 64);
    }

    #[test]
    fn test_panicking_evaluator_does_not_kill_worker() {
        let doubler = Arc::new(Doubler::default());
        let pipeline = start(&config(1), &doubler, Arc::new(NoopCache::new()));
        let mut requester = pipeline.requester();

        let results = requester.evaluate_batch(vec![input(13.0), input(2.0)]);
        assert!(matches!(results[0].error(), Some(EvaluationError::Panicked { .. })));
        assert!(results[1].is_success());

        let again = requester.evaluate_batch(vec![input(4.0)]);
        assert!(again[0].is_success());
    }

    #[test]
    fn test_slow_requests_time_out() {
        let doubler = Arc::new(Doubler::with_delay(Duration::from_millis(400)));
        let config = PipelineConfig {
            request_timeout_ms: Some(50),
            ..config(2)
        };
        let pipeline = start(&config, &doubler, Arc::new(NoopCache::new()));
        let mut requester = pipeline.requester();

        let started = Instant::now();
        let results = requester.evaluate_batch(vec![input(99.0), input(1.0)]);
        assert!(started.elapsed() < Duration::from_millis(400));
        assert!(matches!(
            results[0].error(),
            Some(EvaluationError::TimedOut { timeout_ms: 50 })
        ));
        assert!(results[1].is_success());
        assert!(pipeline.stats().timed_out >= 1);

        // The late result for slot 0 must not leak into the next batch.
        thread::sleep(Duration::from_millis(450));
        let next = requester.evaluate_batch(vec![input(5.0)]);
        assert_eq!(next.len(), 1);
        assert_eq!(next[0].row().unwrap().input().get("x"), Some(5.0));
    }

    #[test]
    fn test_expired_requests_count_as_timed_out_once() {
        let doubler = Arc::new(Doubler::with_delay(Duration::from_millis(300)));
        let config = PipelineConfig {
            request_timeout_ms: Some(50),
            ..config(1)
        };
        let pipeline = start(&config, &doubler, Arc::new(NoopCache::new()));

        let results = pipeline.evaluate_batch(vec![input(99.0), input(1.0), input(2.0)]);
        assert!(results
            .iter()
            .all(|r| matches!(r.error(), Some(EvaluationError::TimedOut { .. }))));

        // The worker frees up after the slow call and skips the two expired
        // requests still queued behind it.
        thread::sleep(Duration::from_millis(500));
        let stats = pipeline.stats();
        assert_eq!(stats.timed_out, 3);
        assert_eq!(stats.evaluator_calls, 1);
        assert_eq!(doubler.calls(), 1);
    }

    #[test]
    fn test_full_request_queue_rejects_after_submit_timeout() {
        let doubler = Arc::new(Doubler::with_delay(Duration::from_millis(300)));
        let config = PipelineConfig {
            request_ring_size: 1,
            submit_timeout_ms: Some(20),
            ..config(1)
        };
        let pipeline = start(&config, &doubler, Arc::new(NoopCache::new()));

        let results = pipeline.evaluate_batch(vec![input(99.0), input(99.5), input(100.0)]);
        assert_eq!(results.len(), 3);
        assert!(results.iter().any(|r| matches!(
            r.error(),
            Some(EvaluationError::Rejected(PipelineError::Full { capacity: 1 }))
        )));
    }

    #[test]
    fn test_shape_mismatch_never_reaches_evaluator() {
        let doubler = Arc::new(Doubler::default());
        let pipeline = start(&config(1), &doubler, Arc::new(NoopCache::new()));

        let keys = KeySet::new(["x", "y"]).unwrap();
        let foreign = InputRow::new(&keys, [("x", 1.0), ("y", 1.0)]).unwrap();
        let results = pipeline.evaluate_batch(vec![foreign, input(1.0)]);

        assert!(matches!(results[0].error(), Some(EvaluationError::Shape(_))));
        assert!(results[1].is_success());
        assert_eq!(doubler.calls(), 1);
    }

    #[test]
    fn test_cancelled_pipeline_fails_fast() {
        let doubler = Arc::new(Doubler::default());
        let pipeline = start(&config(2), &doubler, Arc::new(NoopCache::new()));
        pipeline.cancel();

        let results = pipeline.evaluate_batch(vec![input(1.0), input(2.0)]);
        assert!(results
            .iter()
            .all(|r| matches!(r.error(), Some(EvaluationError::Cancelled))));
        assert_eq!(doubler.calls(), 0);

        let started = Instant::now();
        pipeline.shutdown();
        assert!(started.elapsed() < SHUTDOWN_GRACE);
    }

    #[test]
    fn test_cancel_unblocks_waiting_requester() {
        let doubler = Arc::new(Doubler::with_delay(Duration::from_millis(500)));
        let pipeline = start(&config(1), &doubler, Arc::new(NoopCache::new()));
        let mut requester = pipeline.requester();
        let cancel = pipeline.cancel_signal().clone();

        let waiter = thread::spawn(move || requester.evaluate_batch(vec![input(99.0), input(1.0)]));
        thread::sleep(Duration::from_millis(50));
        cancel.cancel();

        let results = waiter.join().unwrap();
        assert_eq!(results.len(), 2);
        assert!(results
            .iter()
            .any(|r| matches!(r.error(), Some(EvaluationError::Cancelled))));
    }

    #[test]
    fn test_shutdown_leaves_parent_signal_untouched() {
        let doubler = Arc::new(Doubler::default());
        let parent = CancelSignal::new();
        let pipeline =
            EvaluationPipeline::start_with_cancel(&config(2), doubler.clone(), Arc::new(NoopCache::new()), &parent)
                .unwrap();

        assert!(pipeline.evaluate_batch(vec![input(1.0)])[0].is_success());
        pipeline.shutdown();
        assert!(!parent.is_cancelled());

        let again =
            EvaluationPipeline::start_with_cancel(&config(2), doubler.clone(), Arc::new(NoopCache::new()), &parent)
                .unwrap();
        assert!(again.evaluate_batch(vec![input(2.0)])[0].is_success());
        drop(again);
        assert!(!parent.is_cancelled());
        assert_eq!(doubler.calls(), 2);
    }

    #[test]
    fn test_parent_cancel_stops_pipeline() {
        let doubler = Arc::new(Doubler::default());
        let parent = CancelSignal::new();
        let pipeline =
            EvaluationPipeline::start_with_cancel(&config(2), doubler.clone(), Arc::new(NoopCache::new()), &parent)
                .unwrap();
        parent.cancel();

        assert!(pipeline.cancel_signal().is_cancelled());
        let results = pipeline.evaluate_batch(vec![input(1.0)]);
        assert!(matches!(results[0].error(), Some(EvaluationError::Cancelled)));
        assert_eq!(doubler.calls(), 0);
    }

    #[test]
    fn test_concurrent_requesters_only_see_their_own_results() {
        let doubler = Arc::new(Doubler::default());
        let pipeline = start(&config(4), &doubler, Arc::new(LruCache::new(4096)));

        thread::scope(|scope| {
            for r in 0..6 {
                let mut requester = pipeline.requester();
                scope.spawn(move || {
                    let mut seen_ids = HashSet::new();
                    for batch in 0..10 {
                        let xs: Vec<f64> = (0..20)
                            .map(|i| (20 + r * 10_000 + batch * 100 + i) as f64)
                            .collect();
                        let results =
                            requester.evaluate_batch(xs.iter().map(|x| input(*x)).collect());

                        assert_eq!(results.len(), xs.len());
                        for (slot, (x, result)) in xs.iter().zip(&results).enumerate() {
                            seen_ids.insert(result.token.requester);
                            assert_eq!(result.token.slot, slot);
                            assert_eq!(result.token.batch, batch as u64);
                            assert_eq!(result.row().unwrap().input().get("x"), Some(*x));
                        }
                    }
                    assert_eq!(seen_ids.len(), 1);
                    assert!(seen_ids.contains(&requester.id()));
                });
            }
        });

        assert_eq!(doubler.calls(), 6 * 10 * 20);
        assert_eq!(pipeline.stats().discarded, 0);
    }
}
