//! Shotgun climber: one independent stochastic hill-climbing agent.

use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use serde::Serialize;
use sg_pipeline::{CancelSignal, EvaluationResult, Requester};
use sg_types::{ClimberConfig, EvaluationError, InputRow, Row, ShapeError};
use tracing::{debug, info, trace, warn};

use crate::search::{FloodGenerator, SearchSpace};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ClimberStatus {
    Exploring,
    /// Terminal: the step fell below `min_step`.
    Converged,
}

/// Search state owned by exactly one climber.
#[derive(Debug, Clone)]
pub struct ClimberState {
    /// Point the next flood batch is centred on.
    pub point: InputRow,
    /// Evaluation of `point`, once one has succeeded.
    pub best: Option<Row>,
    /// Step as a fraction of each dimension's range.
    pub step: f64,
    pub iteration: u64,
    pub status: ClimberStatus,
}

/// Final report of one climber.
#[derive(Debug, Clone, Serialize)]
pub struct ClimberOutcome {
    pub climber: usize,
    pub seed: u64,
    pub start: InputRow,
    pub best: Option<Row>,
    pub status: ClimberStatus,
    pub iterations: u64,
    /// Results received, cached or not, excluding cancelled slots.
    pub evaluations: u64,
    pub cache_hits: u64,
    pub failures: u64,
    pub improvements: u64,
    pub final_step: f64,
    /// Stopped by cancellation before converging.
    pub cancelled: bool,
}

/// Highest-objective successful row of a batch. Failures are skipped and
/// the lowest slot wins ties, so the choice does not depend on the order in
/// which workers finished.
pub fn best_of(results: &[EvaluationResult]) -> Option<&Row> {
    results
        .iter()
        .filter_map(EvaluationResult::row)
        .fold(None, |best: Option<&Row>, row| match best {
            Some(b) if b.objective() >= row.objective() => Some(b),
            _ => Some(row),
        })
}

/// Gains within `tolerance` do not count as improvements.
pub fn improves(candidate: f64, current: f64, tolerance: f64) -> bool {
    candidate > current + tolerance
}

pub struct ShotgunClimber {
    id: usize,
    seed: u64,
    space: SearchSpace,
    config: ClimberConfig,
    requester: Requester,
    cancel: CancelSignal,
    flood: FloodGenerator,
    rng: ChaCha8Rng,
    start: InputRow,
    state: ClimberState,
    evaluations: u64,
    cache_hits: u64,
    failures: u64,
    improvements: u64,
    cancelled: bool,
}

impl ShotgunClimber {
    /// Create a climber starting at `start` (projected into the space), or
    /// at a random point drawn from `seed` when none is given.
    pub fn new(
        id: usize,
        space: SearchSpace,
        config: &ClimberConfig,
        requester: Requester,
        cancel: CancelSignal,
        seed: u64,
        start: Option<&InputRow>,
    ) -> Result<Self, ShapeError> {
        let keys = space.key_set()?;
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        let start = match start {
            Some(point) => space.project(&keys, point)?,
            None => space.random_point(&keys, &mut rng)?,
        };

        Ok(Self {
            id,
            seed,
            flood: FloodGenerator::new(keys, config.flood_batch_size),
            space,
            config: config.clone(),
            requester,
            cancel,
            rng,
            state: ClimberState {
                point: start.clone(),
                best: None,
                step: config.initial_step,
                iteration: 0,
                status: ClimberStatus::Exploring,
            },
            start,
            evaluations: 0,
            cache_hits: 0,
            failures: 0,
            improvements: 0,
            cancelled: false,
        })
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn state(&self) -> &ClimberState {
        &self.state
    }

    /// Submit one flood batch around the current point and advance.
    pub fn iterate(&mut self) -> Result<ClimberStatus, ShapeError> {
        if self.state.status == ClimberStatus::Converged {
            return Ok(ClimberStatus::Converged);
        }
        self.state.iteration += 1;

        let batch = self.flood.generate(
            &self.space,
            &self.state.point,
            self.state.step,
            &mut self.rng,
        )?;
        let results = self.requester.evaluate_batch(batch);

        let mut interrupted = false;
        for result in &results {
            match &result.outcome {
                Ok(_) => {
                    self.evaluations += 1;
                    if result.cached {
                        self.cache_hits += 1;
                    }
                }
                Err(EvaluationError::Cancelled) => interrupted = true,
                Err(e) => {
                    self.evaluations += 1;
                    self.failures += 1;
                    trace!(climber = self.id, slot = result.token.slot, error = %e, "candidate failed");
                }
            }
        }

        // Slot 0 re-evaluates the current point; it is the baseline until
        // the climber holds a result of its own.
        let baseline = self
            .state
            .best
            .clone()
            .or_else(|| results.first().and_then(EvaluationResult::row).cloned());
        let candidate = best_of(&results);

        let adopted = match (candidate, &baseline) {
            (Some(c), None) => Some(c.clone()),
            (Some(c), Some(b)) if improves(c.objective(), b.objective(), self.config.tolerance) => {
                Some(c.clone())
            }
            _ => None,
        };

        match adopted {
            Some(row) => {
                debug!(
                    climber = self.id,
                    iteration = self.state.iteration,
                    objective = row.objective(),
                    point = %row.input(),
                    "climber improved"
                );
                self.improvements += 1;
                self.state.point = row.input().clone();
                self.state.best = Some(row);
            }
            None => {
                self.state.best = baseline;
                if !interrupted {
                    self.shrink();
                }
            }
        }

        if interrupted {
            self.cancelled = true;
        }
        Ok(self.state.status)
    }

    fn shrink(&mut self) {
        self.state.step *= self.config.shrink_factor;
        if self.state.step < self.config.min_step {
            self.state.status = ClimberStatus::Converged;
            debug!(
                climber = self.id,
                iteration = self.state.iteration,
                step = self.state.step,
                "climber converged"
            );
        }
    }

    /// Iterate until converged, cancelled or out of iterations.
    pub fn run(mut self) -> ClimberOutcome {
        info!(climber = self.id, seed = self.seed, start = %self.start, "climber started");

        while self.state.status == ClimberStatus::Exploring {
            if self.cancel.is_cancelled() {
                self.cancelled = true;
            }
            if self.cancelled {
                break;
            }
            if self.state.iteration >= self.config.max_iterations {
                warn!(
                    climber = self.id,
                    max_iterations = self.config.max_iterations,
                    "climber hit iteration cap before converging"
                );
                break;
            }
            if let Err(e) = self.iterate() {
                warn!(climber = self.id, error = %e, "candidate generation failed, stopping climber");
                break;
            }
        }

        info!(
            climber = self.id,
            status = ?self.state.status,
            iterations = self.state.iteration,
            best = ?self.state.best.as_ref().map(Row::objective),
            cancelled = self.cancelled,
            "climber finished"
        );
        self.into_outcome()
    }

    fn into_outcome(self) -> ClimberOutcome {
        ClimberOutcome {
            climber: self.id,
            seed: self.seed,
            start: self.start,
            best: self.state.best,
            status: self.state.status,
            iterations: self.state.iteration,
            evaluations: self.evaluations,
            cache_hits: self.cache_hits,
            failures: self.failures,
            improvements: self.improvements,
            final_step: self.state.step,
            cancelled: self.cancelled,
        }
    }
}
