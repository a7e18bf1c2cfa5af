//! Built-in benchmark evaluators.

use sg_types::{
    EvaluationError, Evaluator, EvaluatorRegistry, InputRow, KeySet, OutputRowSchema, Row,
    SgResult, ShapeError,
};
use std::sync::Arc;

use crate::search::SearchSpace;

pub const BENCHMARK_VERSION: &str = "1.0.0";

fn required(input: &InputRow, key: &str) -> Result<f64, EvaluationError> {
    input.get(key).ok_or_else(|| EvaluationError::MissingInput {
        key: key.to_string(),
    })
}

/// `exp(-(x²+y²)) + 2·exp(-((x-1.7)²+(y-1.7)²))`: a local maximum near the
/// origin and the global one near (1.7, 1.7) with value ≈ 2.
#[derive(Debug, Clone)]
pub struct TwoPeak {
    keys: KeySet,
    schema: OutputRowSchema,
}

impl TwoPeak {
    pub const NAME: &'static str = "two_peak";
    /// Inputs outside `[-DOMAIN, DOMAIN]` are rejected.
    pub const DOMAIN: f64 = 10.0;

    pub fn new() -> Result<Self, ShapeError> {
        Ok(Self {
            keys: KeySet::new(["x", "y"])?,
            schema: OutputRowSchema::new(KeySet::new(["value"])?),
        })
    }

    pub fn value(x: f64, y: f64) -> f64 {
        (-(x * x + y * y)).exp() + 2.0 * (-((x - 1.7).powi(2) + (y - 1.7).powi(2))).exp()
    }

    pub fn search_space() -> SearchSpace {
        SearchSpace::new()
            .add_float("x", -3.0, 3.0)
            .add_float("y", -3.0, 3.0)
    }

    fn coordinate(input: &InputRow, key: &str) -> Result<f64, EvaluationError> {
        let value = required(input, key)?;
        if value.abs() > Self::DOMAIN {
            return Err(EvaluationError::OutOfDomain {
                key: key.to_string(),
                value,
                low: -Self::DOMAIN,
                high: Self::DOMAIN,
            });
        }
        Ok(value)
    }
}

impl Evaluator for TwoPeak {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn version(&self) -> &str {
        BENCHMARK_VERSION
    }

    fn input_keys(&self) -> &KeySet {
        &self.keys
    }

    fn output_schema(&self) -> &OutputRowSchema {
        &self.schema
    }

    fn evaluate(&self, input: &InputRow) -> Result<Row, EvaluationError> {
        self.check_input(input)?;
        let x = Self::coordinate(input, "x")?;
        let y = Self::coordinate(input, "y")?;

        let output = self
            .schema
            .builder()
            .set("value", Self::value(x, y))?
            .build()?;
        Ok(Row::new(input.clone(), output))
    }
}

/// Negated sphere `-Σ xᵢ²` over `x0..x{n-1}`, peak 0 at the origin. Also
/// reports the Euclidean distance to the origin; `value` is the objective.
#[derive(Debug, Clone)]
pub struct Sphere {
    keys: KeySet,
    schema: OutputRowSchema,
}

impl Sphere {
    pub const NAME: &'static str = "sphere";

    pub fn new(dimensions: usize) -> Result<Self, ShapeError> {
        Ok(Self {
            keys: KeySet::new((0..dimensions).map(|i| format!("x{i}")))?,
            schema: OutputRowSchema::with_objective(KeySet::new(["distance", "value"])?, "value")?,
        })
    }
}

impl Evaluator for Sphere {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn version(&self) -> &str {
        BENCHMARK_VERSION
    }

    fn input_keys(&self) -> &KeySet {
        &self.keys
    }

    fn output_schema(&self) -> &OutputRowSchema {
        &self.schema
    }

    fn evaluate(&self, input: &InputRow) -> Result<Row, EvaluationError> {
        self.check_input(input)?;
        let mut squared = 0.0;
        for key in self.keys.iter() {
            squared += required(input, key)?.powi(2);
        }

        let output = self
            .schema
            .builder()
            .set("value", -squared)?
            .set("distance", squared.sqrt())?
            .build()?;
        Ok(Row::new(input.clone(), output))
    }
}

/// Registry holding `two_peak` and a two-dimensional `sphere`.
pub fn benchmark_registry() -> SgResult<EvaluatorRegistry> {
    let registry = EvaluatorRegistry::new();

    let two_peak: Arc<dyn Evaluator> = Arc::new(TwoPeak::new()?);
    registry.register(TwoPeak::NAME, BENCHMARK_VERSION, move || Arc::clone(&two_peak));

    let sphere: Arc<dyn Evaluator> = Arc::new(Sphere::new(2)?);
    registry.register(Sphere::NAME, BENCHMARK_VERSION, move || Arc::clone(&sphere));

    Ok(registry)
}
