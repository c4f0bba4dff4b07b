use serde::{Deserialize, Serialize};

use crate::CoreError;

/// Annotator confidence in a label, always within `[0.0, 1.0]`.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Serialize, Deserialize)]
#[serde(try_from = "f64", into = "f64")]
pub struct Confidence(f64);

impl Confidence {
    pub const MAX: Confidence = Confidence(1.0);

    pub fn new(value: f64) -> Result<Self, CoreError> {
        if value.is_nan() || !(0.0..=1.0).contains(&value) {
            return Err(CoreError::ConfidenceOutOfRange(value));
        }
        // -0.0 sorts below 0.0 under total_cmp
        Ok(Self(if value == 0.0 { 0.0 } else { value }))
    }

    pub fn value(&self) -> f64 {
        self.0
    }

    /// Total order usable for picking a winner; NaN is excluded by construction.
    pub fn total_cmp(&self, other: &Confidence) -> std::cmp::Ordering {
        self.0.total_cmp(&other.0)
    }
}

impl TryFrom<f64> for Confidence {
    type Error = CoreError;

    fn try_from(value: f64) -> Result<Self, Self::Error> {
        Confidence::new(value)
    }
}

impl From<Confidence> for f64 {
    fn from(c: Confidence) -> f64 {
        c.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bounds_are_inclusive() {
        assert_eq!(Confidence::new(0.0).unwrap().value(), 0.0);
        assert_eq!(Confidence::new(1.0).unwrap(), Confidence::MAX);
    }

    #[test]
    fn negative_zero_is_plain_zero() {
        let neg = Confidence::new(-0.0).unwrap();
        assert!(neg.value().is_sign_positive());
        assert_eq!(neg.total_cmp(&Confidence::new(0.0).unwrap()), std::cmp::Ordering::Equal);
    }

    #[test]
    fn out_of_range_is_rejected() {
        for bad in [-0.01, 1.01, f64::NAN, f64::INFINITY] {
            assert!(Confidence::new(bad).is_err(), "{bad} should be rejected");
        }
    }
}
