//! Optimizer coordinator: owns the evaluation pipeline, runs the shotgun
//! climbers concurrently and reduces their final points to a global best.

use chrono::{DateTime, Utc};
use serde::Serialize;
use sg_cache::{build_cache, CacheStats, ResultCache};
use sg_pipeline::{CancelSignal, EvaluationPipeline, PipelineStatsSnapshot};
use sg_types::{Evaluator, InputRow, OptimizationError, OptimizerConfig, Row};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::climber::{ClimberOutcome, ClimberStatus, ShotgunClimber};
use crate::search::SearchSpace;

/// Unique optimization run identifier.
pub type RunId = Uuid;

/// How a run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum OptimizationState {
    /// Every climber stopped on its own (converged or hit the iteration cap).
    Completed,
    /// Stopped through the cancel signal.
    Cancelled,
    /// Stopped by the `max_run_time_ms` watchdog.
    TimedOut,
}

/// Everything known about a finished run.
#[derive(Debug, Clone, Serialize)]
pub struct OptimizationReport {
    pub run_id: RunId,
    pub evaluator: String,
    pub evaluator_version: String,
    pub state: OptimizationState,
    /// Globally best row across all climbers.
    pub best: Row,
    pub best_climber: usize,
    pub climbers: Vec<ClimberOutcome>,
    pub cache_backend: String,
    pub cache: CacheStats,
    pub pipeline: PipelineStatsSnapshot,
    pub config: OptimizerConfig,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl OptimizationReport {
    pub fn elapsed(&self) -> chrono::Duration {
        self.finished_at - self.started_at
    }

    pub fn converged_climbers(&self) -> usize {
        self.climbers
            .iter()
            .filter(|c| c.status == ClimberStatus::Converged)
            .count()
    }

    pub fn total_evaluations(&self) -> u64 {
        self.climbers.iter().map(|c| c.evaluations).sum()
    }
}

/// Runs a population of [`ShotgunClimber`]s over one shared pipeline.
pub struct Optimizer {
    config: OptimizerConfig,
    space: SearchSpace,
    start_points: Vec<InputRow>,
    cache: Option<Arc<dyn ResultCache>>,
    cancel: CancelSignal,
}

impl Optimizer {
    pub fn new(config: OptimizerConfig, space: SearchSpace) -> Self {
        Self {
            config,
            space,
            start_points: Vec::new(),
            cache: None,
            cancel: CancelSignal::new(),
        }
    }

    /// Climber `i` starts at `points[i]`, projected into the space. Climbers
    /// without a start point start at a seeded random point.
    pub fn with_start_points(mut self, points: Vec<InputRow>) -> Self {
        self.start_points = points;
        self
    }

    /// Use `cache` instead of building one from the pipeline config. A cache
    /// passed here outlives the run and can be shared between runs.
    pub fn with_cache(mut self, cache: Arc<dyn ResultCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn config(&self) -> &OptimizerConfig {
        &self.config
    }

    pub fn space(&self) -> &SearchSpace {
        &self.space
    }

    /// External abort. Cancelling stops the current run, which still
    /// reports the best point found so far; the optimizer stays cancelled.
    /// Each run works under its own child of this signal, so finishing or
    /// timing out a run never cancels it.
    pub fn cancel_signal(&self) -> &CancelSignal {
        &self.cancel
    }

    /// Run to completion and return the globally best row.
    pub fn optimize(&self, evaluator: Arc<dyn Evaluator>) -> Result<Row, OptimizationError> {
        Ok(self.run(evaluator)?.best)
    }

    pub fn run(&self, evaluator: Arc<dyn Evaluator>) -> Result<OptimizationReport, OptimizationError> {
        self.config.validate()?;
        self.space.check_against(evaluator.as_ref())?;

        let climber_count = self.config.num_shotgun_climbers;
        if self.start_points.len() > climber_count {
            warn!(
                start_points = self.start_points.len(),
                climbers = climber_count,
                "more start points than climbers, ignoring the rest"
            );
        }

        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        let base_seed = self.config.seed.unwrap_or_else(rand::random);

        let cache = self.cache.clone().unwrap_or_else(|| {
            build_cache(
                self.config.pipeline.cache_backend,
                self.config.pipeline.max_cache_size,
            )
        });
        let run_cancel = self.cancel.child();
        let pipeline = EvaluationPipeline::start_with_cancel(
            &self.config.pipeline,
            Arc::clone(&evaluator),
            Arc::clone(&cache),
            &run_cancel,
        )?;

        info!(
            run = %run_id,
            evaluator = %evaluator.name(),
            climbers = climber_count,
            seed = base_seed,
            flood_batch_size = self.config.climber.flood_batch_size,
            "optimization started"
        );

        let mut climbers = Vec::with_capacity(climber_count);
        for i in 0..climber_count {
            climbers.push(ShotgunClimber::new(
                i,
                self.space.clone(),
                &self.config.climber,
                pipeline.requester(),
                run_cancel.clone(),
                base_seed.wrapping_add(i as u64),
                self.start_points.get(i),
            )?);
        }

        let finished = CancelSignal::new();
        let timed_out = AtomicBool::new(false);
        let outcomes = thread::scope(|scope| {
            if let Some(limit) = self.config.max_run_time() {
                let (finished, timed_out, cancel) = (&finished, &timed_out, &run_cancel);
                scope.spawn(move || {
                    if !finished.wait_timeout(limit) {
                        warn!(limit_ms = limit.as_millis() as u64, "run time limit reached, cancelling");
                        timed_out.store(true, Ordering::SeqCst);
                        cancel.cancel();
                    }
                });
            }

            let mut handles = Vec::with_capacity(climbers.len());
            let mut spawn_error = None;
            for climber in climbers {
                let spawned = thread::Builder::new()
                    .name(format!("sg-climber-{}", climber.id()))
                    .spawn_scoped(scope, move || climber.run());
                match spawned {
                    Ok(handle) => handles.push(handle),
                    Err(e) => {
                        spawn_error = Some(e);
                        run_cancel.cancel();
                        break;
                    }
                }
            }

            let outcomes: Vec<ClimberOutcome> = handles
                .into_iter()
                .filter_map(|handle| match handle.join() {
                    Ok(outcome) => Some(outcome),
                    Err(_) => {
                        error!("climber thread panicked");
                        None
                    }
                })
                .collect();
            finished.cancel();

            match spawn_error {
                Some(e) => Err(OptimizationError::Startup {
                    message: format!("failed to spawn climber thread: {e}"),
                }),
                None => Ok(outcomes),
            }
        })?;

        let state = if timed_out.load(Ordering::SeqCst) {
            OptimizationState::TimedOut
        } else if run_cancel.is_cancelled() {
            OptimizationState::Cancelled
        } else {
            OptimizationState::Completed
        };

        let pipeline_stats = pipeline.stats();
        pipeline.shutdown();
        let finished_at = Utc::now();

        let winner = outcomes
            .iter()
            .filter_map(|o| o.best.as_ref().map(|row| (o.climber, row)))
            .fold(None, |best: Option<(usize, &Row)>, (id, row)| match best {
                Some((_, b)) if b.objective() >= row.objective() => best,
                _ => Some((id, row)),
            });
        let Some((best_climber, best)) = winner else {
            let failures: u64 = outcomes.iter().map(|o| o.failures).sum();
            error!(run = %run_id, failures, ?state, "no climber produced a valid result");
            return Err(OptimizationError::NoValidResult {
                climbers: climber_count,
                failures,
            });
        };
        let best = best.clone();

        let report = OptimizationReport {
            run_id,
            evaluator: evaluator.name().to_string(),
            evaluator_version: evaluator.version().to_string(),
            state,
            best,
            best_climber,
            climbers: outcomes,
            cache_backend: cache.backend_name().to_string(),
            cache: cache.stats(),
            pipeline: pipeline_stats,
            config: self.config.clone(),
            started_at,
            finished_at,
        };

        info!(
            run = %run_id,
            state = ?report.state,
            objective = report.best.objective(),
            point = %report.best.input(),
            climber = report.best_climber,
            converged = report.converged_climbers(),
            evaluations = report.total_evaluations(),
            cache_hit_rate = report.cache.hit_rate(),
            elapsed_ms = report.elapsed().num_milliseconds(),
            "optimization finished"
        );

        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::functions::TwoPeak;
    use crate::testing::FnEvaluator;
    use sg_cache::LruCache;
    use sg_types::{CacheBackend, KeySet};
    use std::time::{Duration, Instant};

    fn xy(x: f64, y: f64) -> InputRow {
        InputRow::new(&KeySet::new(["x", "y"]).unwrap(), [("x", x), ("y", y)]).unwrap()
    }

    fn small_config() -> OptimizerConfig {
        OptimizerConfig::default()
            .with_climbers(3)
            .with_evaluator_threads(2)
            .with_flood_batch_size(8)
            .with_ring_sizes(128, 128)
            .with_cache(CacheBackend::Lru, 100_000)
            .with_seed(17)
    }

    #[test]
    fn test_two_peak_finds_global_maximum() {
        let config = OptimizerConfig::default()
            .with_climbers(6)
            .with_evaluator_threads(4)
            .with_flood_batch_size(20)
            .with_ring_sizes(256, 256)
            .with_cache(CacheBackend::Lru, 100_000)
            .with_seed(7);
        let optimizer = Optimizer::new(config, TwoPeak::search_space()).with_start_points(vec![
            xy(-2.5, 2.5),
            xy(2.5, -2.5),
            xy(2.5, 2.5),
            xy(-2.5, -2.5),
        ]);

        let report = optimizer.run(Arc::new(TwoPeak::new().unwrap())).unwrap();

        assert_eq!(report.state, OptimizationState::Completed);
        assert_eq!(report.climbers.len(), 6);
        assert_eq!(report.converged_climbers(), 6);
        assert_eq!(report.evaluator, "two_peak");

        let (x, y) = (
            report.best.input().get("x").unwrap(),
            report.best.input().get("y").unwrap(),
        );
        assert!((x - 1.7).abs() < 0.05, "x = {x}");
        assert!((y - 1.7).abs() < 0.05, "y = {y}");
        assert!((report.best.objective() - 2.0).abs() < 0.01);

        let best_of_climbers = report
            .climbers
            .iter()
            .filter_map(|c| c.best.as_ref().map(Row::objective))
            .fold(f64::MIN, f64::max);
        assert_eq!(report.best.objective(), best_of_climbers);

        assert!(report.pipeline.cache_hits > 0);
        assert_eq!(report.pipeline.submitted, report.pipeline.completed);
        assert_eq!(report.cache_backend, "lru");
    }

    #[test]
    fn test_optimize_returns_best_row() {
        let optimizer = Optimizer::new(
            small_config(),
            SearchSpace::new()
                .add_float("x", -5.0, 5.0)
                .add_float("y", -5.0, 5.0),
        );
        let best = optimizer
            .optimize(Arc::new(FnEvaluator::xy(|x, y| Ok(-(x * x + y * y)))))
            .unwrap();
        assert!(best.objective() > -1e-3);
    }

    #[test]
    fn test_noop_cache_calls_evaluator_for_every_request() {
        let evaluator = FnEvaluator::xy(|x, y| Ok(-(x - 1.0).abs() - (y - 1.0).abs()));
        let calls = evaluator.counter();
        let config = small_config().with_cache(CacheBackend::Noop, 0);
        let optimizer = Optimizer::new(config, SearchSpace::uniform(evaluator.input_keys(), -4.0, 4.0));

        let report = optimizer.run(Arc::new(evaluator)).unwrap();

        assert_eq!(report.cache_backend, "noop");
        assert_eq!(report.pipeline.cache_hits, 0);
        assert_eq!(calls.load(Ordering::SeqCst) as u64, report.pipeline.submitted);
        assert_eq!(report.pipeline.evaluator_calls, report.total_evaluations());
    }

    #[test]
    fn test_shared_cache_makes_repeated_run_free() {
        let evaluator = Arc::new(FnEvaluator::xy(|x, y| Ok(-(x * x) - 2.0 * y * y)));
        let calls = evaluator.counter();
        let cache: Arc<dyn ResultCache> = Arc::new(LruCache::new(1_000_000));
        let optimizer = Optimizer::new(
            small_config(),
            SearchSpace::uniform(evaluator.input_keys(), -3.0, 3.0),
        )
        .with_cache(Arc::clone(&cache));

        let first = optimizer.run(evaluator.clone()).unwrap();
        let calls_after_first = calls.load(Ordering::SeqCst);
        assert!(calls_after_first > 0);

        let second = optimizer.run(evaluator).unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), calls_after_first);
        assert_eq!(second.pipeline.evaluator_calls, 0);
        assert_eq!(first.best, second.best);
    }

    #[test]
    fn test_all_failures_is_an_error() {
        let optimizer = Optimizer::new(small_config(), TwoPeak::search_space());
        let err = optimizer
            .optimize(Arc::new(FnEvaluator::xy(|_, _| {
                Err(sg_types::EvaluationError::failed("always broken"))
            })))
            .unwrap_err();

        match err {
            OptimizationError::NoValidResult { climbers, failures } => {
                assert_eq!(climbers, 3);
                assert!(failures > 0);
            }
            other => panic!("expected NoValidResult, got {other:?}"),
        }
    }

    #[test]
    fn test_space_must_match_evaluator() {
        let evaluator = FnEvaluator::xy(|x, y| Ok(x + y));
        let calls = evaluator.counter();
        let space = SearchSpace::new().add_float("x", 0.0, 1.0);

        let err = Optimizer::new(small_config(), space)
            .optimize(Arc::new(evaluator))
            .unwrap_err();
        assert!(matches!(err, OptimizationError::Shape(_)));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let err = Optimizer::new(small_config().with_climbers(0), TwoPeak::search_space())
            .optimize(Arc::new(TwoPeak::new().unwrap()))
            .unwrap_err();
        assert!(matches!(err, OptimizationError::InvalidConfig { .. }));
    }

    fn slow_config() -> OptimizerConfig {
        let mut config = small_config().with_climbers(2).with_flood_batch_size(4);
        config.climber.min_step = 1e-12;
        config
    }

    fn slow_evaluator() -> Arc<FnEvaluator> {
        Arc::new(
            FnEvaluator::xy(|x, y| Ok(-(x * x + y * y))).with_delay(Duration::from_millis(20)),
        )
    }

    #[test]
    fn test_run_time_limit_cancels_and_keeps_best() {
        let config = slow_config().with_max_run_time(Duration::from_millis(150));
        let optimizer = Optimizer::new(config, TwoPeak::search_space());

        let started = Instant::now();
        let report = optimizer.run(slow_evaluator()).unwrap();

        assert!(started.elapsed() < Duration::from_secs(2));
        assert_eq!(report.state, OptimizationState::TimedOut);
        assert!(report.climbers.iter().all(|c| c.cancelled));
        assert_eq!(report.converged_climbers(), 0);
        assert!(!optimizer.cancel_signal().is_cancelled());

        let again = optimizer.run(slow_evaluator()).unwrap();
        assert_eq!(again.state, OptimizationState::TimedOut);
        assert!(again.total_evaluations() > 0);
        assert_ne!(again.run_id, report.run_id);
    }

    #[test]
    fn test_optimizer_can_run_twice() {
        let optimizer = Optimizer::new(
            small_config(),
            SearchSpace::new()
                .add_float("x", -5.0, 5.0)
                .add_float("y", -5.0, 5.0),
        );
        let evaluator = Arc::new(FnEvaluator::xy(|x, y| Ok(-(x * x + y * y))));

        for _ in 0..2 {
            let report = optimizer.run(evaluator.clone()).unwrap();
            assert_eq!(report.state, OptimizationState::Completed);
            assert_eq!(report.converged_climbers(), 3);
            assert!(report.climbers.iter().all(|c| !c.cancelled));
            assert!(!optimizer.cancel_signal().is_cancelled());
        }
    }

    #[test]
    fn test_external_cancel_stops_run() {
        let optimizer = Optimizer::new(slow_config(), TwoPeak::search_space());
        let cancel = optimizer.cancel_signal().clone();

        let canceller = thread::spawn(move || {
            thread::sleep(Duration::from_millis(150));
            cancel.cancel();
        });
        let report = optimizer.run(slow_evaluator()).unwrap();
        canceller.join().unwrap();

        assert_eq!(report.state, OptimizationState::Cancelled);
        assert!(report.climbers.iter().all(|c| c.cancelled));

        let err = optimizer.run(slow_evaluator()).unwrap_err();
        assert!(matches!(err, OptimizationError::NoValidResult { .. }));
    }

    #[test]
    fn test_report_serializes() {
        let optimizer = Optimizer::new(small_config(), TwoPeak::search_space());
        let report = optimizer.run(Arc::new(TwoPeak::new().unwrap())).unwrap();

        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["state"], "Completed");
        assert_eq!(json["evaluator"], "two_peak");
        assert!(json["best"]["input"]["x"].is_number());
        assert!(json["best"]["output"]["value"].is_number());
        assert_eq!(json["climbers"].as_array().unwrap().len(), 3);
        assert_eq!(json["config"]["num_shotgun_climbers"], 3);
    }
}
