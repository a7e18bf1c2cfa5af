//! # sg-optimizer
//!
//! Parallel shotgun hill climbing over the Shotgun evaluation pipeline.
//!
//! Provides search space definitions, flood-batch neighbour generation, the
//! [`ShotgunClimber`] search agent, the [`Optimizer`] coordinator that runs a
//! population of climbers and reports the global best, and built-in
//! benchmark evaluators.

mod climber;
mod coordinator;
mod functions;
mod search;

pub use climber::{best_of, improves, ClimberOutcome, ClimberState, ClimberStatus, ShotgunClimber};
pub use coordinator::{OptimizationReport, OptimizationState, Optimizer, RunId};
pub use functions::{benchmark_registry, Sphere, TwoPeak, BENCHMARK_VERSION};
pub use search::{Dimension, DimensionKind, FloodGenerator, SearchSpace};
