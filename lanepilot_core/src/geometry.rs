//! Detector box conventions and the 4-point polygon used by the tracker.

use nalgebra::Vector2;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors raised while converting detector output.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum GeometryError {
    #[error("Box must contain exactly 4 values, got {0}")]
    InvalidBoxLength(usize),

    #[error("Polygon must contain exactly 8 values, got {0}")]
    InvalidPolygonLength(usize),

    #[error("Unsupported box shape: {0}")]
    UnknownShape(String),
}

/// The two box conventions a detector may emit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BoxShape {
    /// `(x_min, y_min, x_max, y_max)`
    Xyxy,
    /// `(x_center, y_center, width, height)`
    Xcycwh,
}

impl std::str::FromStr for BoxShape {
    type Err = GeometryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "xyxy" => Ok(Self::Xyxy),
            "xcycwh" => Ok(Self::Xcycwh),
            other => Err(GeometryError::UnknownShape(other.to_string())),
        }
    }
}

/// Axis-aligned polygon mask: 4 points = 8 floats, clockwise from top-left.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Polygon(pub [f64; 8]);

impl Polygon {
    /// Builds a polygon from a slice, rejecting anything but 8 values.
    pub fn from_slice(values: &[f64]) -> Result<Self, GeometryError> {
        let arr: [f64; 8] = values
            .try_into()
            .map_err(|_| GeometryError::InvalidPolygonLength(values.len()))?;
        Ok(Self(arr))
    }

    /// Converts a detector box into a polygon.
    pub fn from_box(values: &[f64], shape: BoxShape) -> Result<Self, GeometryError> {
        let [a, b, c, d]: [f64; 4] = values
            .try_into()
            .map_err(|_| GeometryError::InvalidBoxLength(values.len()))?;

        let (x_min, y_min, x_max, y_max) = match shape {
            BoxShape::Xyxy => (a, b, c, d),
            BoxShape::Xcycwh => (a - c / 2.0, b - d / 2.0, a + c / 2.0, b + d / 2.0),
        };

        Ok(Self([x_min, y_min, x_max, y_min, x_max, y_max, x_min, y_max]))
    }

    /// Mean of the four corner points, in pixels.
    pub fn center(&self) -> Vector2<f64> {
        let p = &self.0;
        Vector2::new(
            (p[0] + p[2] + p[4] + p[6]) / 4.0,
            (p[1] + p[3] + p[5] + p[7]) / 4.0,
        )
    }

    /// Vertical extent (max y - min y), in pixels.
    pub fn box_height(&self) -> f64 {
        let ys = [self.0[1], self.0[3], self.0[5], self.0[7]];
        let max = ys.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        let min = ys.iter().copied().fold(f64::INFINITY, f64::min);
        max - min
    }
}
