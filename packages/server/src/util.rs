//! Small shared helpers.

use std::time::{SystemTime, UNIX_EPOCH};

/// Milliseconds since the Unix epoch.
#[allow(clippy::cast_possible_truncation)]
#[must_use]
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Exponentially weighted moving average with smoothing factor `alpha`
/// applied to the new sample.
#[must_use]
pub fn ewma(previous: Option<f64>, sample: f64, alpha: f64) -> f64 {
    match previous {
        Some(prev) => alpha * sample + (1.0 - alpha) * prev,
        None => sample,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ewma_without_history_is_the_sample() {
        assert!((ewma(None, 5.0, 0.3) - 5.0).abs() < f64::EPSILON);
    }

    #[test]
    fn ewma_blends_toward_new_samples() {
        let blended = ewma(Some(10.0), 20.0, 0.3);
        assert!((blended - 13.0).abs() < 1e-9);
    }
}
