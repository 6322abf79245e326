//! Per-vector feature normalization.

use serde::{Deserialize, Serialize};

/// Normalization strategy applied to each vehicle's feature vector before it
/// is handed to the allocator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NormalizationMode {
    MinMax,
    ZScore,
}

/// Normalizes `data` with the given strategy, returning a new vector.
///
/// Never produces NaN: a constant vector maps to all zeros under min-max,
/// and a zero standard deviation is replaced by 1 under z-score.
pub fn normalize(data: &[f64], mode: NormalizationMode) -> Vec<f64> {
    if data.is_empty() {
        return Vec::new();
    }

    match mode {
        NormalizationMode::MinMax => {
            let min = data.iter().copied().fold(f64::INFINITY, f64::min);
            let max = data.iter().copied().fold(f64::NEG_INFINITY, f64::max);
            let range = max - min;
            if range == 0.0 || !range.is_finite() {
                return vec![0.0; data.len()];
            }
            data.iter().map(|v| (v - min) / range).collect()
        }
        NormalizationMode::ZScore => {
            let n = data.len() as f64;
            let mean = data.iter().sum::<f64>() / n;
            // Sample standard deviation (n - 1)
            let std = if data.len() > 1 {
                (data.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (n - 1.0)).sqrt()
            } else {
                0.0
            };
            let std = if std == 0.0 || !std.is_finite() { 1.0 } else { std };
            data.iter().map(|v| (v - mean) / std).collect()
        }
    }
}
