//! Evaluator capability interface and the explicit registry used to
//! construct evaluators by name and version.

use dashmap::DashMap;
use std::fmt;
use std::sync::Arc;
use tracing::debug;

use crate::errors::{EvaluationError, SgError, SgResult};
use crate::rows::{InputRow, KeySet, OutputRowSchema, Row};

/// A black-box function of named numeric inputs to named numeric outputs.
///
/// Implementations are shared across every pipeline worker thread, so
/// `evaluate` takes `&self`; any internal mutable state must be synchronized
/// by the implementation itself.
pub trait Evaluator: Send + Sync {
    /// Registry name (e.g. "two_peak").
    fn name(&self) -> &str;

    fn version(&self) -> &str;

    /// Keys every input row must carry. Stable for the evaluator's lifetime.
    fn input_keys(&self) -> &KeySet;

    fn output_schema(&self) -> &OutputRowSchema;

    /// Keys every output row carries. Stable for the evaluator's lifetime.
    fn output_keys(&self) -> &KeySet {
        self.output_schema().slots()
    }

    /// Evaluate one point.
    fn evaluate(&self, input: &InputRow) -> Result<Row, EvaluationError>;

    /// Reject rows whose key set differs from [`Evaluator::input_keys`].
    fn check_input(&self, input: &InputRow) -> Result<(), EvaluationError> {
        self.input_keys()
            .ensure_same_keys(input.keys())
            .map_err(EvaluationError::from)
    }
}

/// Constructor stored in an [`EvaluatorRegistry`].
pub type EvaluatorFactory = Arc<dyn Fn() -> Arc<dyn Evaluator> + Send + Sync>;

/// Explicit map from evaluator name and version to a constructor.
///
/// Versions are kept in registration order; looking up a name without a
/// version returns the most recently registered one.
#[derive(Default)]
pub struct EvaluatorRegistry {
    factories: DashMap<String, Vec<(String, EvaluatorFactory)>>,
}

impl EvaluatorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a constructor. Re-registering the same name and version
    /// replaces the previous constructor.
    pub fn register<F>(&self, name: impl Into<String>, version: impl Into<String>, factory: F)
    where
        F: Fn() -> Arc<dyn Evaluator> + Send + Sync + 'static,
    {
        let name = name.into();
        let version = version.into();
        debug!(evaluator = %name, version = %version, "registering evaluator");

        let mut versions = self.factories.entry(name).or_default();
        versions.retain(|(v, _)| *v != version);
        versions.push((version, Arc::new(factory)));
    }

    /// Construct an evaluator. `version = None` picks the latest registration.
    pub fn create(&self, name: &str, version: Option<&str>) -> SgResult<Arc<dyn Evaluator>> {
        let versions = self
            .factories
            .get(name)
            .ok_or_else(|| SgError::Config(format!("unknown evaluator: {name}")))?;

        let factory = match version {
            Some(wanted) => versions
                .iter()
                .find(|(v, _)| v == wanted)
                .map(|(_, f)| f.clone())
                .ok_or_else(|| {
                    SgError::Config(format!("evaluator {name} has no version {wanted}"))
                })?,
            None => versions
                .last()
                .map(|(_, f)| f.clone())
                .ok_or_else(|| SgError::Config(format!("unknown evaluator: {name}")))?,
        };
        drop(versions);

        Ok(factory())
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.factories.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }
}

impl fmt::Debug for EvaluatorRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EvaluatorRegistry")
            .field("names", &self.names())
            .finish()
    }
}
