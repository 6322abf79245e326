//! Boundaries to the external collaborators of the vision node.
//!
//! The detector (with its identity tracker), the lane allocator and the
//! decoded video stream live outside LanePilot. The pipeline only sees them
//! through these traits.

use crate::geometry::{BoxShape, GeometryError, Polygon};
use crate::proximity_graph::ProximityGraph;
use crate::vehicle_tracking::VehicleDetection;
use async_trait::async_trait;
use lanepilot_env::Fault;
use nalgebra::DMatrix;
use std::time::Duration;

/// One decoded video frame.
#[derive(Debug, Clone)]
pub struct Frame {
    /// Position in the stream, starting at 0
    pub index: u64,
    pub width: u32,
    pub height: u32,
    /// Raw pixels, layout owned by the source/detector pair
    pub data: Vec<u8>,
    /// Source clock when the frame was captured
    pub captured_at: Duration,
}

/// Supplies decoded frames.
#[async_trait]
pub trait FrameSource: Send {
    /// Waits for the next frame; `Ok(None)` once the stream has ended.
    async fn next_frame(&mut self) -> Result<Option<Frame>, Fault>;
}

/// One `(trackId, box)` pair from the detector.
#[derive(Debug, Clone, PartialEq)]
pub struct RawDetection {
    pub track_id: i64,
    pub bbox: [f64; 4],
    pub shape: BoxShape,
}

impl RawDetection {
    pub fn new(track_id: i64, bbox: [f64; 4], shape: BoxShape) -> Self {
        Self { track_id, bbox, shape }
    }

    pub fn to_vehicle_detection(&self) -> Result<VehicleDetection, GeometryError> {
        Ok(VehicleDetection {
            track_id: self.track_id,
            polygon: Polygon::from_box(&self.bbox, self.shape)?,
        })
    }
}

/// Object detector with a multi-frame identity tracker.
pub trait Detector: Send {
    fn detect(&mut self, frame: &Frame) -> Result<Vec<RawDetection>, Fault>;
}

/// Lane allocation model.
pub trait LaneAllocator: Send {
    /// Returns one lane id per feature row.
    fn allocate(&mut self, features: &DMatrix<f64>, graph: &ProximityGraph) -> Result<Vec<i64>, Fault>;
}
