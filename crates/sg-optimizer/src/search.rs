//! Search space definitions and flood-batch candidate generation.

use rand::Rng;
use serde::{Deserialize, Serialize};
use sg_types::{Evaluator, InputRow, KeySet, OptimizationError, ShapeError};

/// How a dimension is sampled and moved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DimensionKind {
    /// Continuous range `[low, high]`.
    Float,
    /// Integer range `[low, high]` inclusive; candidates are rounded.
    Int,
}

/// A single named dimension of the search space.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Dimension {
    /// Input key the dimension feeds (e.g. "x").
    pub name: String,
    pub kind: DimensionKind,
    pub low: f64,
    pub high: f64,
}

impl Dimension {
    pub fn range(&self) -> f64 {
        self.high - self.low
    }

    /// Clamp into `[low, high]`, rounding integer dimensions.
    pub fn clamp(&self, value: f64) -> f64 {
        let value = value.clamp(self.low, self.high);
        match self.kind {
            DimensionKind::Float => value,
            DimensionKind::Int => value.round(),
        }
    }

    /// Absolute move for a step given as a fraction of the range. Integer
    /// dimensions always move by at least one.
    pub fn delta(&self, step: f64) -> f64 {
        let delta = step * self.range();
        match self.kind {
            DimensionKind::Float => delta,
            DimensionKind::Int => delta.max(1.0),
        }
    }

    pub fn sample<R: Rng>(&self, rng: &mut R) -> f64 {
        match self.kind {
            DimensionKind::Float => rng.gen_range(self.low..=self.high),
            DimensionKind::Int => rng.gen_range(self.low as i64..=self.high as i64) as f64,
        }
    }
}

/// The full search space: an ordered list of bounded dimensions, one per
/// evaluator input key.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SearchSpace {
    pub dimensions: Vec<Dimension>,
}

impl SearchSpace {
    pub fn new() -> Self {
        Self::default()
    }

    /// Same continuous bounds on every key.
    pub fn uniform(keys: &KeySet, low: f64, high: f64) -> Self {
        keys.iter()
            .fold(Self::new(), |space, key| space.add_float(key, low, high))
    }

    pub fn add_float(mut self, name: impl Into<String>, low: f64, high: f64) -> Self {
        self.dimensions.push(Dimension {
            name: name.into(),
            kind: DimensionKind::Float,
            low,
            high,
        });
        self
    }

    pub fn add_int(mut self, name: impl Into<String>, low: i64, high: i64) -> Self {
        self.dimensions.push(Dimension {
            name: name.into(),
            kind: DimensionKind::Int,
            low: low as f64,
            high: high as f64,
        });
        self
    }

    pub fn len(&self) -> usize {
        self.dimensions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.dimensions.is_empty()
    }

    pub fn dimension(&self, name: &str) -> Option<&Dimension> {
        self.dimensions.iter().find(|d| d.name == name)
    }

    /// Key set in dimension order. Every row the optimizer builds uses it.
    pub fn key_set(&self) -> Result<KeySet, ShapeError> {
        KeySet::new(self.dimensions.iter().map(|d| d.name.clone()))
    }

    pub fn validate(&self) -> Result<(), OptimizationError> {
        if self.is_empty() {
            return Err(OptimizationError::InvalidConfig {
                message: "search space has no dimensions".to_string(),
            });
        }
        for dim in &self.dimensions {
            if !dim.low.is_finite() || !dim.high.is_finite() || dim.low >= dim.high {
                return Err(OptimizationError::InvalidConfig {
                    message: format!(
                        "dimension {} needs finite bounds with low < high, got [{}, {}]",
                        dim.name, dim.low, dim.high
                    ),
                });
            }
        }
        self.key_set()?;
        Ok(())
    }

    /// Validate and check that the space covers exactly the evaluator's
    /// input keys.
    pub fn check_against(&self, evaluator: &dyn Evaluator) -> Result<KeySet, OptimizationError> {
        self.validate()?;
        let keys = self.key_set()?;
        evaluator.input_keys().ensure_same_keys(&keys)?;
        Ok(keys)
    }

    pub fn random_point<R: Rng>(
        &self,
        keys: &KeySet,
        rng: &mut R,
    ) -> Result<InputRow, ShapeError> {
        let values = self.dimensions.iter().map(|d| d.sample(rng)).collect();
        InputRow::from_values(keys, values)
    }

    /// Re-key `row` onto `keys` and clamp it into the space.
    pub fn project(&self, keys: &KeySet, row: &InputRow) -> Result<InputRow, ShapeError> {
        keys.ensure_same_keys(row.keys())?;
        let values = self
            .dimensions
            .iter()
            .map(|d| {
                row.get(&d.name)
                    .map(|v| d.clamp(v))
                    .ok_or_else(|| ShapeError::MissingKey {
                        key: d.name.clone(),
                    })
            })
            .collect::<Result<Vec<f64>, _>>()?;
        InputRow::from_values(keys, values)
    }
}

/// Builds one climber's flood batches.
///
/// Layout of a batch of `n` candidates around the current point `p` with
/// step `s`:
/// - slot 0: `p` itself
/// - then `p ± s` along one axis at a time, `+` before `-`, axes in order
///   starting at a cursor that rotates when the batch cannot hold every
///   axis move
/// - remaining slots: `p` plus a uniform perturbation inside the `±s` box
///
/// Every candidate is clamped to the space's bounds.
#[derive(Debug, Clone)]
pub struct FloodGenerator {
    keys: KeySet,
    batch_size: usize,
    axis_cursor: usize,
}

impl FloodGenerator {
    pub fn new(keys: KeySet, batch_size: usize) -> Self {
        Self {
            keys,
            batch_size: batch_size.max(1),
            axis_cursor: 0,
        }
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub fn generate<R: Rng>(
        &mut self,
        space: &SearchSpace,
        current: &InputRow,
        step: f64,
        rng: &mut R,
    ) -> Result<Vec<InputRow>, ShapeError> {
        let base = space
            .dimensions
            .iter()
            .map(|d| {
                current.get(&d.name).ok_or_else(|| ShapeError::MissingKey {
                    key: d.name.clone(),
                })
            })
            .collect::<Result<Vec<f64>, _>>()?;
        let dims = base.len();

        let mut batch = Vec::with_capacity(self.batch_size);
        batch.push(InputRow::from_values(&self.keys, base.clone())?);

        let axis_moves = (self.batch_size - 1).min(2 * dims);
        for m in 0..axis_moves {
            let axis = (self.axis_cursor + m / 2) % dims;
            let dim = &space.dimensions[axis];
            let sign = if m % 2 == 0 { 1.0 } else { -1.0 };

            let mut values = base.clone();
            values[axis] = dim.clamp(base[axis] + sign * dim.delta(step));
            batch.push(InputRow::from_values(&self.keys, values)?);
        }
        if axis_moves < 2 * dims {
            self.axis_cursor = (self.axis_cursor + (axis_moves + 1) / 2) % dims;
        }

        while batch.len() < self.batch_size {
            let values = space
                .dimensions
                .iter()
                .zip(&base)
                .map(|(dim, v)| {
                    let delta = dim.delta(step);
                    dim.clamp(v + rng.gen_range(-delta..=delta))
                })
                .collect();
            batch.push(InputRow::from_values(&self.keys, values)?);
        }

        Ok(batch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    fn square() -> SearchSpace {
        SearchSpace::new()
            .add_float("x", 0.0, 10.0)
            .add_float("y", 0.0, 10.0)
    }

    fn point(space: &SearchSpace, x: f64, y: f64) -> InputRow {
        InputRow::new(&space.key_set().unwrap(), [("x", x), ("y", y)]).unwrap()
    }

    fn xy(row: &InputRow) -> (f64, f64) {
        (row.get("x").unwrap(), row.get("y").unwrap())
    }

    #[test]
    fn test_axis_moves_follow_current_point() {
        let space = square();
        let mut flood = FloodGenerator::new(space.key_set().unwrap(), 5);
        let mut rng = ChaCha8Rng::seed_from_u64(1);

        let batch = flood
            .generate(&space, &point(&space, 5.0, 5.0), 0.1, &mut rng)
            .unwrap();
        let coords: Vec<_> = batch.iter().map(xy).collect();
        assert_eq!(
            coords,
            vec![(5.0, 5.0), (6.0, 5.0), (4.0, 5.0), (5.0, 6.0), (5.0, 4.0)]
        );
    }

    #[test]
    fn test_axis_cursor_rotates_for_small_batches() {
        let space = square();
        let mut flood = FloodGenerator::new(space.key_set().unwrap(), 3);
        let mut rng = ChaCha8Rng::seed_from_u64(1);
        let current = point(&space, 5.0, 5.0);

        let first = flood.generate(&space, &current, 0.1, &mut rng).unwrap();
        let second = flood.generate(&space, &current, 0.1, &mut rng).unwrap();
        let third = flood.generate(&space, &current, 0.1, &mut rng).unwrap();

        assert_eq!(xy(&first[1]), (6.0, 5.0));
        assert_eq!(xy(&second[1]), (5.0, 6.0));
        assert_eq!(xy(&third[1]), (6.0, 5.0));
    }

    #[test]
    fn test_candidates_stay_in_bounds() {
        let space = square();
        let mut flood = FloodGenerator::new(space.key_set().unwrap(), 40);
        let mut rng = ChaCha8Rng::seed_from_u64(7);

        let batch = flood
            .generate(&space, &point(&space, 10.0, 0.0), 0.3, &mut rng)
            .unwrap();
        assert_eq!(batch.len(), 40);
        assert_eq!(xy(&batch[1]), (10.0, 0.0));
        for row in &batch {
            let (x, y) = xy(row);
            assert!((0.0..=10.0).contains(&x));
            assert!((0.0..=10.0).contains(&y));
        }
    }

    #[test]
    fn test_random_fill_within_step_box() {
        let space = square();
        let mut flood = FloodGenerator::new(space.key_set().unwrap(), 30);
        let mut rng = ChaCha8Rng::seed_from_u64(3);

        let batch = flood
            .generate(&space, &point(&space, 5.0, 5.0), 0.05, &mut rng)
            .unwrap();
        for row in &batch[5..] {
            let (x, y) = xy(row);
            assert!((x - 5.0).abs() <= 0.5 + 1e-12);
            assert!((y - 5.0).abs() <= 0.5 + 1e-12);
        }
    }

    #[test]
    fn test_int_dimensions_move_by_whole_units() {
        let space = SearchSpace::new()
            .add_int("n", 0, 100)
            .add_float("x", -1.0, 1.0);
        let keys = space.key_set().unwrap();
        let current = InputRow::new(&keys, [("n", 50.0), ("x", 0.0)]).unwrap();
        let mut flood = FloodGenerator::new(keys, 20);
        let mut rng = ChaCha8Rng::seed_from_u64(11);

        let batch = flood.generate(&space, &current, 0.001, &mut rng).unwrap();
        assert_eq!(batch[1].get("n"), Some(51.0));
        assert_eq!(batch[2].get("n"), Some(49.0));
        for row in &batch {
            let n = row.get("n").unwrap();
            assert_eq!(n, n.round());
        }
    }

    #[test]
    fn test_same_seed_same_batch() {
        let space = square();
        let current = point(&space, 2.0, 8.0);
        let run = |seed| {
            let mut flood = FloodGenerator::new(space.key_set().unwrap(), 25);
            let mut rng = ChaCha8Rng::seed_from_u64(seed);
            flood.generate(&space, &current, 0.2, &mut rng).unwrap()
        };
        assert_eq!(run(9), run(9));
        assert_ne!(run(9), run(10));
    }

    #[test]
    fn test_single_slot_batch_is_current_point() {
        let space = square();
        let mut flood = FloodGenerator::new(space.key_set().unwrap(), 1);
        let mut rng = ChaCha8Rng::seed_from_u64(0);
        let current = point(&space, 1.0, 2.0);

        let batch = flood.generate(&space, &current, 0.5, &mut rng).unwrap();
        assert_eq!(batch, vec![current]);
    }

    #[test]
    fn test_validate_rejects_bad_spaces() {
        assert!(SearchSpace::new().validate().is_err());
        assert!(SearchSpace::new().add_float("x", 1.0, 1.0).validate().is_err());
        assert!(SearchSpace::new()
            .add_float("x", 0.0, f64::INFINITY)
            .validate()
            .is_err());
        assert!(matches!(
            SearchSpace::new()
                .add_float("x", 0.0, 1.0)
                .add_float("x", 0.0, 1.0)
                .validate(),
            Err(OptimizationError::Shape(ShapeError::DuplicateKey { .. }))
        ));
        assert!(square().validate().is_ok());
    }

    #[test]
    fn test_random_point_and_project() {
        let space = square().add_int("n", 1, 3);
        let keys = space.key_set().unwrap();
        let mut rng = ChaCha8Rng::seed_from_u64(5);

        for _ in 0..50 {
            let p = space.random_point(&keys, &mut rng).unwrap();
            assert!((0.0..=10.0).contains(&p.get("x").unwrap()));
            assert!([1.0, 2.0, 3.0].contains(&p.get("n").unwrap()));
        }

        let foreign = KeySet::new(["n", "y", "x"]).unwrap();
        let outside = InputRow::new(&foreign, [("n", 7.4), ("y", -3.0), ("x", 4.0)]).unwrap();
        let projected = space.project(&keys, &outside).unwrap();
        assert_eq!(projected.keys(), &keys);
        assert_eq!(projected.values(), &[4.0, 0.0, 3.0]);
    }
}
