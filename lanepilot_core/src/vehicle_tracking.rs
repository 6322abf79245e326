//! The "TRACKING" Engine - per-vehicle 3D kinematics from 2D detections
//!
//! The detector (with its own multi-frame identity tracker) hands us one
//! polygon per stable track id and frame. This module turns that stream into
//! a live set of `VehicleState`s:
//!
//! 1. **Lifecycle**: create on first sighting, update on every later one,
//!    evict once stale
//! 2. **Depth**: pinhole-camera approximation from the box height
//! 3. **Kinematics**: 3D speed and acceleration from successive estimates
//! 4. **Lane utilization**: per-lane vehicle counts, kept consistent with
//!    the live state set under a single lock
//!
//! Degenerate geometry never raises: a zero box height yields an infinite
//! depth and a zero speed for that update.

use crate::geometry::Polygon;
use crate::normalization::{normalize, NormalizationMode};
use nalgebra::{DMatrix, Vector2, Vector3};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tracing::debug;

// ============================================================================
// CONFIGURATION
// ============================================================================

/// Configuration for the VehicleTracker
#[derive(Debug, Clone)]
pub struct TrackerConfig {
    /// Vertical field of view of the camera in degrees
    pub camera_fov_deg: f64,

    /// Image width in pixels (lane assignment)
    pub image_width_px: f64,

    /// Image height in pixels (focal length)
    pub image_height_px: f64,

    /// Physical height of a tracked vehicle in cm
    pub vehicle_height_cm: f64,

    /// Number of lanes, numbered 0..n-1 from left to right
    pub num_lanes: usize,

    /// Feature normalization applied before allocation
    pub normalization: NormalizationMode,

    /// Minimum time between two cleanup sweeps
    pub cleanup_interval: Duration,

    /// A state not updated for longer than this is stale
    pub cleanup_timeout: Duration,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            camera_fov_deg: 62.2,
            image_width_px: 1280.0,
            image_height_px: 720.0,
            vehicle_height_cm: 6.0,
            num_lanes: 3,
            normalization: NormalizationMode::MinMax,
            cleanup_interval: Duration::from_secs(5),
            cleanup_timeout: Duration::from_secs(1),
        }
    }
}

impl TrackerConfig {
    /// Pinhole focal length in pixels: `(H/2) / tan(fov/2)`.
    pub fn focal_length_px(&self) -> f64 {
        let fov_rad = self.camera_fov_deg.to_radians();
        (self.image_height_px / 2.0) / (fov_rad / 2.0).tan()
    }

    /// Estimates the distance to a vehicle whose box is `box_height_px` tall.
    ///
    /// Returns `f64::INFINITY` for a zero (or negative) box height instead
    /// of dividing by zero.
    pub fn estimate_depth(&self, box_height_px: f64) -> f64 {
        if box_height_px <= 0.0 || !box_height_px.is_finite() {
            return f64::INFINITY;
        }
        self.focal_length_px() * self.vehicle_height_cm / box_height_px
    }

    /// Maps a horizontal pixel position to a lane id.
    ///
    /// The image is split into `num_lanes` equal columns; positions outside
    /// the image clamp to the outermost lanes.
    pub fn lane_for(&self, center_x_px: f64) -> i64 {
        let lanes = self.num_lanes.max(1);
        if !center_x_px.is_finite() || self.image_width_px <= 0.0 {
            return 0;
        }
        let column = (center_x_px / (self.image_width_px / lanes as f64)).floor();
        column.clamp(0.0, (lanes - 1) as f64) as i64
    }
}

// ============================================================================
// INPUT
// ============================================================================

/// One tracked object in one frame, as produced by the detector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VehicleDetection {
    /// Stable id from the detector's identity tracker
    pub track_id: i64,

    /// Polygon mask in image pixels
    pub polygon: Polygon,
}

// ============================================================================
// VEHICLE STATE
// ============================================================================

/// Kinematic state of one tracked vehicle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VehicleState {
    /// Stable id, unique among live states
    pub id: i64,

    /// Current lane
    pub lane_id: i64,

    /// Latest polygon mask
    pub polygon_px: Polygon,

    /// 3D speed estimate in cm/s
    pub speed_cm_per_sec: f64,

    /// Finite difference of successive speeds in cm/s²
    pub acceleration_cm_per_sec2: f64,

    /// Tracker clock at the last update
    pub last_updated: Duration,

    /// Polygon center at the last update
    pub center_px: Vector2<f64>,

    /// Box height at the last update
    pub box_height_px: f64,

    /// Depth estimate at the last update (`INFINITY` when degenerate)
    pub depth_cm: f64,
}

impl VehicleState {
    /// Seeds a state from its first detection.
    fn new(id: i64, lane_id: i64, polygon: Polygon, now: Duration, config: &TrackerConfig) -> Self {
        let box_height_px = polygon.box_height();
        Self {
            id,
            lane_id,
            polygon_px: polygon,
            speed_cm_per_sec: 0.0,
            acceleration_cm_per_sec2: 0.0,
            last_updated: now,
            center_px: polygon.center(),
            box_height_px,
            depth_cm: config.estimate_depth(box_height_px),
        }
    }

    /// Estimates the 3D speed (cm/s) implied by moving to `polygon` at `now`.
    ///
    /// Lateral pixel motion is converted to cm with the *previous* box's
    /// scale (`vehicle_height / old_box_height`), then combined with the
    /// depth delta. Zero elapsed time or degenerate geometry yield 0.
    pub fn estimate_speed(&self, polygon: &Polygon, now: Duration, config: &TrackerConfig) -> f64 {
        let elapsed = now.saturating_sub(self.last_updated).as_secs_f64();
        if elapsed == 0.0 {
            return 0.0;
        }

        let new_center = polygon.center();
        let new_depth = config.estimate_depth(polygon.box_height());

        if self.box_height_px <= 0.0 {
            return 0.0;
        }
        let scale_cm_per_px = config.vehicle_height_cm / self.box_height_px;
        let delta_px = new_center - self.center_px;
        let dz = new_depth - self.depth_cm;

        let displacement_cm = Vector3::new(delta_px.x * scale_cm_per_px, delta_px.y * scale_cm_per_px, dz);
        let speed = displacement_cm.norm() / elapsed;

        if speed.is_finite() {
            speed
        } else {
            0.0
        }
    }

    /// Applies a new detection: recomputes speed, acceleration and depth.
    fn update(&mut self, polygon: Polygon, now: Duration, config: &TrackerConfig) {
        let elapsed = now.saturating_sub(self.last_updated).as_secs_f64();
        let new_speed = self.estimate_speed(&polygon, now, config);

        self.acceleration_cm_per_sec2 = if elapsed > 0.0 {
            (new_speed - self.speed_cm_per_sec) / elapsed
        } else {
            0.0
        };
        self.speed_cm_per_sec = new_speed;
        self.last_updated = now;
        self.polygon_px = polygon;

        self.center_px = polygon.center();
        self.box_height_px = polygon.box_height();
        self.depth_cm = config.estimate_depth(self.box_height_px);
    }

    /// True once the state has not been updated for longer than `timeout`.
    pub fn is_stale(&self, now: Duration, timeout: Duration) -> bool {
        now.saturating_sub(self.last_updated) > timeout
    }
}

// ============================================================================
// LANE UTILIZATION
// ============================================================================

/// Number of live vehicles per lane.
///
/// Only the tracker mutates it, under the same lock as the state map, so
/// the sum over all lanes always equals the number of live states.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LaneUtilization(BTreeMap<i64, usize>);

impl LaneUtilization {
    fn increment(&mut self, lane: i64) {
        *self.0.entry(lane).or_insert(0) += 1;
    }

    fn decrement(&mut self, lane: i64) {
        if let Some(count) = self.0.get_mut(&lane) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                self.0.remove(&lane);
            }
        }
    }

    /// Vehicles currently assigned to `lane`.
    pub fn get(&self, lane: i64) -> usize {
        self.0.get(&lane).copied().unwrap_or(0)
    }

    /// Sum over all lanes.
    pub fn total(&self) -> usize {
        self.0.values().sum()
    }

    /// Iterates `(lane, count)` for occupied lanes in lane order.
    pub fn iter(&self) -> impl Iterator<Item = (i64, usize)> + '_ {
        self.0.iter().map(|(lane, count)| (*lane, *count))
    }
}

// ============================================================================
// FEATURES
// ============================================================================

/// Raw feature vector of one vehicle.
///
/// Layout: `[lane, speed, acceleration, depth, util(0), .., util(num_lanes-1)]`,
/// length `num_lanes + 4`. An unknown (infinite) depth is encoded as 0.
/// Pure: reads the state and the utilization snapshot, mutates neither.
pub fn feature_vector(state: &VehicleState, utilization: &LaneUtilization, num_lanes: usize) -> Vec<f64> {
    let depth = if state.depth_cm.is_finite() { state.depth_cm } else { 0.0 };

    let mut features = Vec::with_capacity(num_lanes + 4);
    features.push(state.lane_id as f64);
    features.push(state.speed_cm_per_sec);
    features.push(state.acceleration_cm_per_sec2);
    features.push(depth);
    features.extend((0..num_lanes as i64).map(|lane| utilization.get(lane) as f64));
    features
}

/// Normalized feature vector handed to the allocator.
pub fn normalized_feature_vector(
    state: &VehicleState,
    utilization: &LaneUtilization,
    num_lanes: usize,
    mode: NormalizationMode,
) -> Vec<f64> {
    normalize(&feature_vector(state, utilization, num_lanes), mode)
}

/// Consistent view of the tracker taken under one lock.
#[derive(Debug, Clone, Default)]
pub struct TrackerSnapshot {
    /// Live states, ordered by id
    pub states: Vec<VehicleState>,

    /// Utilization at the same instant
    pub utilization: LaneUtilization,
}

impl TrackerSnapshot {
    /// Ids of the batch, in row order.
    pub fn ids(&self) -> Vec<i64> {
        self.states.iter().map(|s| s.id).collect()
    }

    /// Raw feature matrix (rows = vehicles), used for graph construction.
    pub fn raw_features(&self, num_lanes: usize) -> DMatrix<f64> {
        self.feature_matrix(num_lanes, |s| feature_vector(s, &self.utilization, num_lanes))
    }

    /// Normalized feature matrix (rows = vehicles), handed to the allocator.
    pub fn normalized_features(&self, num_lanes: usize, mode: NormalizationMode) -> DMatrix<f64> {
        self.feature_matrix(num_lanes, |s| {
            normalized_feature_vector(s, &self.utilization, num_lanes, mode)
        })
    }

    fn feature_matrix<F>(&self, num_lanes: usize, row: F) -> DMatrix<f64>
    where
        F: Fn(&VehicleState) -> Vec<f64>,
    {
        let cols = num_lanes + 4;
        let data: Vec<f64> = self.states.iter().flat_map(|s| row(s)).collect();
        DMatrix::from_row_slice(self.states.len(), cols, &data)
    }
}

// ============================================================================
// TRACKER (The Engine)
// ============================================================================

/// Per-batch bookkeeping returned by `VehicleTracker::observe`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ObserveReport {
    pub created: Vec<i64>,
    pub updated: Vec<i64>,
    pub removed: Vec<i64>,
}

struct TrackerInner {
    states: BTreeMap<i64, VehicleState>,
    utilization: LaneUtilization,
    last_cleanup: Option<Duration>,
}

/// Owner of all live `VehicleState`s and of the lane utilization.
///
/// All mutation goes through this API under a single mutex, so creation,
/// removal and lane moves never interleave with a snapshot used for
/// feature construction.
pub struct VehicleTracker {
    config: TrackerConfig,
    inner: Mutex<TrackerInner>,
}

impl VehicleTracker {
    /// Create a new tracker with the given configuration.
    pub fn new(config: TrackerConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(TrackerInner {
                states: BTreeMap::new(),
                utilization: LaneUtilization::default(),
                last_cleanup: None,
            }),
        }
    }

    /// Create a new tracker with default configuration.
    pub fn with_defaults() -> Self {
        Self::new(TrackerConfig::default())
    }

    pub fn config(&self) -> &TrackerConfig {
        &self.config
    }

    fn lock(&self) -> MutexGuard<'_, TrackerInner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Ingests one detection batch, then runs the cleanup sweep if due.
    pub fn observe(&self, detections: &[VehicleDetection], now: Duration) -> ObserveReport {
        let mut report = ObserveReport::default();
        let mut inner = self.lock();

        for detection in detections {
            if self.upsert_locked(&mut inner, detection, now) {
                report.created.push(detection.track_id);
            } else {
                report.updated.push(detection.track_id);
            }
        }

        let due = match inner.last_cleanup {
            None => {
                inner.last_cleanup = Some(now);
                false
            }
            Some(last) => now.saturating_sub(last) >= self.config.cleanup_interval,
        };
        if due {
            report.removed = self.sweep_locked(&mut inner, now);
            inner.last_cleanup = Some(now);
        }

        report
    }

    /// Creates or updates a single state. Returns true when it was created.
    pub fn upsert(&self, detection: &VehicleDetection, now: Duration) -> bool {
        let mut inner = self.lock();
        self.upsert_locked(&mut inner, detection, now)
    }

    fn upsert_locked(&self, inner: &mut TrackerInner, detection: &VehicleDetection, now: Duration) -> bool {
        let lane = self.config.lane_for(detection.polygon.center().x);
        let TrackerInner {
            states, utilization, ..
        } = inner;

        match states.get_mut(&detection.track_id) {
            Some(state) => {
                state.update(detection.polygon, now, &self.config);
                if state.lane_id != lane {
                    debug!(id = state.id, from = state.lane_id, to = lane, "vehicle changed lane");
                    utilization.decrement(state.lane_id);
                    utilization.increment(lane);
                    state.lane_id = lane;
                }
                false
            }
            None => {
                let state = VehicleState::new(detection.track_id, lane, detection.polygon, now, &self.config);
                utilization.increment(lane);
                states.insert(detection.track_id, state);
                debug!(id = detection.track_id, lane, "tracking new vehicle");
                true
            }
        }
    }

    /// Removes every stale state now, regardless of the cleanup cadence.
    pub fn cleanup(&self, now: Duration) -> Vec<i64> {
        let mut inner = self.lock();
        let removed = self.sweep_locked(&mut inner, now);
        inner.last_cleanup = Some(now);
        removed
    }

    fn sweep_locked(&self, inner: &mut TrackerInner, now: Duration) -> Vec<i64> {
        let stale: Vec<i64> = inner
            .states
            .values()
            .filter(|s| s.is_stale(now, self.config.cleanup_timeout))
            .map(|s| s.id)
            .collect();

        for id in &stale {
            Self::remove_locked(inner, *id);
        }
        if !stale.is_empty() {
            debug!(removed = stale.len(), "evicted stale vehicles");
        }
        stale
    }

    /// Explicitly removes a state, decrementing its lane.
    pub fn remove(&self, id: i64) -> Option<VehicleState> {
        let mut inner = self.lock();
        Self::remove_locked(&mut inner, id)
    }

    fn remove_locked(inner: &mut TrackerInner, id: i64) -> Option<VehicleState> {
        let state = inner.states.remove(&id)?;
        inner.utilization.decrement(state.lane_id);
        Some(state)
    }

    /// Consistent copy of all states and the utilization.
    pub fn snapshot(&self) -> TrackerSnapshot {
        let inner = self.lock();
        TrackerSnapshot {
            states: inner.states.values().cloned().collect(),
            utilization: inner.utilization.clone(),
        }
    }

    pub fn get(&self, id: i64) -> Option<VehicleState> {
        self.lock().states.get(&id).cloned()
    }

    pub fn lane_utilization(&self) -> LaneUtilization {
        self.lock().utilization.clone()
    }

    /// Get the number of live states.
    pub fn len(&self) -> usize {
        self.lock().states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// ============================================================================
// TESTS
// ============================================================================
