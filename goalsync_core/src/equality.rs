//! Equality predicates deciding when rendered state is "close enough" to a
//! goal's target.
//!
//! Rendered values and goal values both arrive as `Fields`. Floating-point
//! and network jitter mean exact comparison is rarely what a property wants,
//! so each goal picks its own predicate.

use nalgebra::Vector3;
use serde_json::Value;

use crate::backing::Fields;
use crate::error::GoalError;

/// A pure comparison between two field maps.
///
/// Must not fail for well-formed inputs of matching shape. Inputs it cannot
/// compare produce `GoalError::IncompatibleShape`, which the caller sees.
pub trait EqualityPredicate {
    fn equals(&self, a: &Fields, b: &Fields) -> Result<bool, GoalError>;
}

impl<F> EqualityPredicate for F
where
    F: Fn(&Fields, &Fields) -> Result<bool, GoalError>,
{
    fn equals(&self, a: &Fields, b: &Fields) -> Result<bool, GoalError> {
        self(a, b)
    }
}

/// Reads a numeric field, failing on absent or non-numeric values.
pub fn number(fields: &Fields, key: &str) -> Result<f64, GoalError> {
    match fields.get(key) {
        Some(Value::Number(n)) => n
            .as_f64()
            .ok_or_else(|| GoalError::shape(format!("'{}' is not representable as f64", key))),
        Some(other) => Err(GoalError::shape(format!("'{}' is not a number: {}", key, other))),
        None => Err(GoalError::shape(format!("'{}' is missing", key))),
    }
}

/// Reads `x`, `y`, `z` as a vector.
pub fn vector(fields: &Fields) -> Result<Vector3<f64>, GoalError> {
    Ok(Vector3::new(
        number(fields, "x")?,
        number(fields, "y")?,
        number(fields, "z")?,
    ))
}

/// Equal if the `x,y,z` vectors are within `threshold` Euclidean distance.
#[derive(Debug, Clone, Copy)]
pub struct Distance {
    pub threshold: f64,
}

impl Distance {
    pub fn new(threshold: f64) -> Self {
        Self { threshold }
    }
}

impl EqualityPredicate for Distance {
    fn equals(&self, a: &Fields, b: &Fields) -> Result<bool, GoalError> {
        Ok((vector(a)? - vector(b)?).norm() <= self.threshold)
    }
}

/// Equal if one numeric property differs by at most `threshold`.
#[derive(Debug, Clone)]
pub struct Delta {
    pub property: String,
    pub threshold: f64,
}

impl Delta {
    pub fn new(property: impl Into<String>, threshold: f64) -> Self {
        Self {
            property: property.into(),
            threshold,
        }
    }
}

impl EqualityPredicate for Delta {
    fn equals(&self, a: &Fields, b: &Fields) -> Result<bool, GoalError> {
        let lhs = number(a, &self.property)?;
        let rhs = number(b, &self.property)?;
        Ok((lhs - rhs).abs() <= self.threshold)
    }
}

/// Equal if every user field has an identical value in both maps.
///
/// The default predicate. Keys carrying the `@` marker are metadata and are
/// skipped, so a rendered value built from a wire snapshot compares cleanly.
#[derive(Debug, Clone, Copy, Default)]
pub struct ShallowMapEquality;

impl EqualityPredicate for ShallowMapEquality {
    fn equals(&self, a: &Fields, b: &Fields) -> Result<bool, GoalError> {
        let user_keys = |fields: &Fields| {
            fields
                .keys()
                .filter(|k| !k.starts_with(crate::backing::META_PREFIX))
                .count()
        };
        if user_keys(a) != user_keys(b) {
            return Ok(false);
        }
        Ok(a
            .iter()
            .filter(|(k, _)| !k.starts_with(crate::backing::META_PREFIX))
            .all(|(k, v)| b.get(k) == Some(v)))
    }
}
