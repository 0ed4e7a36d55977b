//! Temperature compensation.
//!
//! Pure functions of `(raw_value, temperature)`; no hidden state.

use crate::profile::Compensation;

/// Apply a compensation model.
///
/// Returns `None` for [`Compensation::None`] and when the correction would
/// divide by zero or produce a non-finite result.
pub fn compensate(raw: f64, temperature_c: f64, model: &Compensation) -> Option<f64> {
    match *model {
        Compensation::None => None,
        Compensation::Linear {
            coefficient_per_c,
            reference_c,
        } => {
            let factor = 1.0 + coefficient_per_c * (temperature_c - reference_c);
            if factor.abs() < f64::EPSILON {
                return None;
            }
            let value = raw / factor;
            value.is_finite().then_some(value)
        }
    }
}
