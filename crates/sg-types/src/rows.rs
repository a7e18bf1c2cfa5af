//! Immutable row value types: input coordinates, evaluator outputs and their
//! pairing.

use serde::ser::{SerializeMap, Serializer};
use serde::Serialize;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use crate::errors::ShapeError;

/// Ordered, duplicate-free set of key names.
///
/// Cloning is cheap: the names live behind an `Arc` and are shared by every
/// row built against the same key set.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct KeySet(Arc<[String]>);

impl KeySet {
    pub fn new<I, S>(keys: I) -> Result<Self, ShapeError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let keys: Vec<String> = keys.into_iter().map(Into::into).collect();
        if keys.is_empty() {
            return Err(ShapeError::EmptyKeySet);
        }
        for (i, key) in keys.iter().enumerate() {
            if keys[..i].contains(key) {
                return Err(ShapeError::DuplicateKey { key: key.clone() });
            }
        }
        Ok(Self(keys.into()))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }

    pub fn index_of(&self, key: &str) -> Option<usize> {
        self.0.iter().position(|k| k == key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.index_of(key).is_some()
    }

    /// Check that `other` names exactly the same keys, in any order.
    pub fn ensure_same_keys(&self, other: &KeySet) -> Result<(), ShapeError> {
        let same = self.len() == other.len() && other.iter().all(|k| self.contains(k));
        if same {
            Ok(())
        } else {
            Err(ShapeError::SchemaMismatch {
                expected: self.to_string(),
                actual: other.to_string(),
            })
        }
    }
}

impl fmt::Display for KeySet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.join(", "))
    }
}

fn finite(key: &str, value: f64) -> Result<f64, ShapeError> {
    if !value.is_finite() {
        return Err(ShapeError::NonFinite {
            key: key.to_string(),
            value,
        });
    }
    // -0.0 and 0.0 compare equal but hash differently by bits.
    Ok(if value == 0.0 { 0.0 } else { value })
}

/// Input coordinate: one finite value per key of its [`KeySet`].
///
/// Equality and hashing are structural over the key names and the value bit
/// patterns, which makes rows usable directly as cache keys.
#[derive(Debug, Clone)]
pub struct InputRow {
    keys: KeySet,
    values: Arc<[f64]>,
}

impl InputRow {
    /// Build a row from `(key, value)` pairs. Every key of `keys` must be
    /// supplied exactly once and no other key is accepted.
    pub fn new<I, K>(keys: &KeySet, pairs: I) -> Result<Self, ShapeError>
    where
        I: IntoIterator<Item = (K, f64)>,
        K: AsRef<str>,
    {
        let mut slots: Vec<Option<f64>> = vec![None; keys.len()];
        for (key, value) in pairs {
            let key = key.as_ref();
            let idx = keys.index_of(key).ok_or_else(|| ShapeError::UnknownKey {
                key: key.to_string(),
            })?;
            if slots[idx].is_some() {
                return Err(ShapeError::DuplicateKey {
                    key: key.to_string(),
                });
            }
            slots[idx] = Some(finite(key, value)?);
        }

        let values = slots
            .into_iter()
            .zip(keys.iter())
            .map(|(slot, key)| {
                slot.ok_or_else(|| ShapeError::MissingKey {
                    key: key.to_string(),
                })
            })
            .collect::<Result<Vec<f64>, _>>()?;

        Ok(Self {
            keys: keys.clone(),
            values: values.into(),
        })
    }

    /// Build a row from values aligned with the key order.
    pub fn from_values(keys: &KeySet, values: Vec<f64>) -> Result<Self, ShapeError> {
        if values.len() != keys.len() {
            return Err(ShapeError::SchemaMismatch {
                expected: keys.to_string(),
                actual: format!("{} values", values.len()),
            });
        }
        let values = keys
            .iter()
            .zip(values)
            .map(|(key, value)| finite(key, value))
            .collect::<Result<Vec<f64>, _>>()?;
        Ok(Self {
            keys: keys.clone(),
            values: values.into(),
        })
    }

    pub fn keys(&self) -> &KeySet {
        &self.keys
    }

    pub fn values(&self) -> &[f64] {
        &self.values
    }

    pub fn get(&self, key: &str) -> Option<f64> {
        self.keys.index_of(key).map(|idx| self.values[idx])
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, f64)> {
        self.keys.iter().zip(self.values.iter().copied())
    }

    /// Derive a new row with one coordinate replaced.
    pub fn with_value(&self, key: &str, value: f64) -> Result<Self, ShapeError> {
        let idx = self
            .keys
            .index_of(key)
            .ok_or_else(|| ShapeError::UnknownKey {
                key: key.to_string(),
            })?;
        let mut values = self.values.to_vec();
        values[idx] = finite(key, value)?;
        Ok(Self {
            keys: self.keys.clone(),
            values: values.into(),
        })
    }
}

impl PartialEq for InputRow {
    fn eq(&self, other: &Self) -> bool {
        self.keys == other.keys
            && self.values.len() == other.values.len()
            && self
                .values
                .iter()
                .zip(other.values.iter())
                .all(|(a, b)| a.to_bits() == b.to_bits())
    }
}

impl Eq for InputRow {}

impl Hash for InputRow {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.keys.hash(state);
        for value in self.values.iter() {
            value.to_bits().hash(state);
        }
    }
}

impl Serialize for InputRow {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.values.len()))?;
        for (key, value) in self.iter() {
            map.serialize_entry(key, &value)?;
        }
        map.end()
    }
}

impl fmt::Display for InputRow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "(")?;
        for (i, (key, value)) in self.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{key}={value}")?;
        }
        write!(f, ")")
    }
}

/// Ordered output slots an evaluator fills, with one slot designated as the
/// objective that climbers maximize.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputRowSchema {
    slots: KeySet,
    objective: usize,
}

impl OutputRowSchema {
    /// Schema whose objective is the first slot.
    pub fn new(slots: KeySet) -> Self {
        Self {
            slots,
            objective: 0,
        }
    }

    pub fn with_objective(slots: KeySet, objective: &str) -> Result<Self, ShapeError> {
        let objective = slots
            .index_of(objective)
            .ok_or_else(|| ShapeError::UnknownKey {
                key: objective.to_string(),
            })?;
        Ok(Self { slots, objective })
    }

    pub fn slots(&self) -> &KeySet {
        &self.slots
    }

    pub fn objective_key(&self) -> &str {
        &self.slots.0[self.objective]
    }

    pub fn builder(&self) -> OutputRowBuilder {
        OutputRowBuilder {
            schema: self.clone(),
            values: vec![None; self.slots.len()],
        }
    }
}

/// Mutable construction phase of an [`OutputRow`].
#[derive(Debug, Clone)]
pub struct OutputRowBuilder {
    schema: OutputRowSchema,
    values: Vec<Option<f64>>,
}

impl OutputRowBuilder {
    pub fn set(mut self, key: &str, value: f64) -> Result<Self, ShapeError> {
        let idx = self
            .schema
            .slots
            .index_of(key)
            .ok_or_else(|| ShapeError::UnknownKey {
                key: key.to_string(),
            })?;
        self.values[idx] = Some(finite(key, value)?);
        Ok(self)
    }

    pub fn build(self) -> Result<OutputRow, ShapeError> {
        let values = self
            .values
            .into_iter()
            .zip(self.schema.slots.iter())
            .map(|(slot, key)| {
                slot.ok_or_else(|| ShapeError::MissingKey {
                    key: key.to_string(),
                })
            })
            .collect::<Result<Vec<f64>, _>>()?;
        Ok(OutputRow {
            schema: self.schema,
            values: values.into(),
        })
    }
}

/// Evaluator output conforming to an [`OutputRowSchema`]. Immutable once
/// built.
#[derive(Debug, Clone, PartialEq)]
pub struct OutputRow {
    schema: OutputRowSchema,
    values: Arc<[f64]>,
}

impl OutputRow {
    pub fn schema(&self) -> &OutputRowSchema {
        &self.schema
    }

    pub fn get(&self, key: &str) -> Option<f64> {
        self.schema.slots.index_of(key).map(|idx| self.values[idx])
    }

    pub fn objective(&self) -> f64 {
        self.values[self.schema.objective]
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, f64)> {
        self.schema.slots.iter().zip(self.values.iter().copied())
    }
}

impl Serialize for OutputRow {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.values.len()))?;
        for (key, value) in self.iter() {
            map.serialize_entry(key, &value)?;
        }
        map.end()
    }
}

/// One evaluated point: the unit stored in the cache and returned by the
/// pipeline.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Row {
    input: InputRow,
    output: OutputRow,
}

impl Row {
    pub fn new(input: InputRow, output: OutputRow) -> Self {
        Self { input, output }
    }

    pub fn input(&self) -> &InputRow {
        &self.input
    }

    pub fn output(&self) -> &OutputRow {
        &self.output
    }

    /// Value of the schema's objective slot.
    pub fn objective(&self) -> f64 {
        self.output.objective()
    }
}
