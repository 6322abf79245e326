//! Simulated collaborators, for running a node without camera, models or servos.
//!
//! A `SimulatedRoad` stands in for the camera scene: vehicles enter at the
//! top of the image, approach (their boxes grow) and leave at the bottom.
//! The same road backs the detector and the allocator, so an allocated lane
//! change shows up as lateral motion in the following frames.

use async_trait::async_trait;
use lanepilot_core::actuator::ActuatorError;
use lanepilot_core::{
    BoxShape, Detector, Frame, FrameSource, LaneAllocator, ProximityGraph, RawDetection, ServoDriver, TrackerConfig,
};
use lanepilot_env::{Fault, LanePilotContext};
use nalgebra::{DMatrix, Vector2};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rand_distr::{Distribution, Normal};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tracing::{debug, info};

/// Box aspect ratio (width / height) of a simulated vehicle.
const BOX_ASPECT: f64 = 1.6;

/// Box height when a vehicle enters the scene.
const ENTRY_BOX_HEIGHT_PX: f64 = 20.0;

#[derive(Debug, Clone)]
pub struct RoadConfig {
    /// Vehicles on screen at most
    pub max_vehicles: usize,

    /// Chance per frame that a new vehicle enters
    pub spawn_probability: f64,

    /// Downward motion per frame
    pub approach_px_per_frame: f64,

    /// Lateral motion per frame while changing lanes
    pub lateral_px_per_frame: f64,

    /// Detector jitter (standard deviation)
    pub noise_px: f64,
}

impl Default for RoadConfig {
    fn default() -> Self {
        Self {
            max_vehicles: 6,
            spawn_probability: 0.2,
            approach_px_per_frame: 8.0,
            lateral_px_per_frame: 12.0,
            noise_px: 1.0,
        }
    }
}

#[derive(Debug, Clone)]
struct SimVehicle {
    id: i64,
    center: Vector2<f64>,
    box_height: f64,
    target_x: f64,
}

struct RoadState {
    rng: ChaCha8Rng,
    noise: Normal<f64>,
    /// Ordered by id (ids only grow)
    vehicles: Vec<SimVehicle>,
    next_id: i64,
}

/// Ground truth of the simulated scene.
pub struct SimulatedRoad {
    tracker: TrackerConfig,
    config: RoadConfig,
    state: Mutex<RoadState>,
}

impl SimulatedRoad {
    pub fn new(seed: u64, tracker: TrackerConfig, config: RoadConfig) -> Result<Arc<Self>, Fault> {
        let noise = Normal::new(0.0, config.noise_px)
            .map_err(|e| Fault::configuration(format!("road noise {}: {}", config.noise_px, e)))?;

        Ok(Arc::new(Self {
            tracker,
            config,
            state: Mutex::new(RoadState {
                rng: ChaCha8Rng::seed_from_u64(seed),
                noise,
                vehicles: Vec::new(),
                next_id: 1,
            }),
        }))
    }

    pub fn detector(self: &Arc<Self>) -> RoadDetector {
        RoadDetector(Arc::clone(self))
    }

    pub fn allocator(self: &Arc<Self>) -> RoadAllocator {
        RoadAllocator(Arc::clone(self))
    }

    pub fn vehicle_count(&self) -> usize {
        self.lock().vehicles.len()
    }

    fn lock(&self) -> MutexGuard<'_, RoadState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn lane_center(&self, lane: i64) -> f64 {
        let lanes = self.tracker.num_lanes.max(1) as f64;
        (lane as f64 + 0.5) * self.tracker.image_width_px / lanes
    }

    /// Advances the scene by one frame and returns what the camera sees.
    fn step(&self, frame: &Frame) -> Vec<RawDetection> {
        let height = frame.height as f64;
        let approach = self.config.approach_px_per_frame;
        let lateral = self.config.lateral_px_per_frame;

        let mut guard = self.lock();
        let RoadState {
            rng,
            noise,
            vehicles,
            next_id,
        } = &mut *guard;

        for vehicle in vehicles.iter_mut() {
            vehicle.center.y += approach;
            vehicle.box_height += approach * 0.25;
            vehicle.center.x += (vehicle.target_x - vehicle.center.x).clamp(-lateral, lateral);
        }
        vehicles.retain(|v| v.center.y - v.box_height / 2.0 < height);

        if vehicles.len() < self.config.max_vehicles && rng.gen_bool(self.config.spawn_probability.clamp(0.0, 1.0)) {
            let lane = rng.gen_range(0..self.tracker.num_lanes.max(1)) as i64;
            let x = self.lane_center(lane);
            debug!(id = *next_id, lane, "vehicle enters");
            vehicles.push(SimVehicle {
                id: *next_id,
                center: Vector2::new(x, 0.0),
                box_height: ENTRY_BOX_HEIGHT_PX,
                target_x: x,
            });
            *next_id += 1;
        }

        vehicles
            .iter()
            .map(|v| {
                let cx = v.center.x + noise.sample(rng);
                let cy = v.center.y + noise.sample(rng);
                RawDetection::new(v.id, [cx, cy, v.box_height * BOX_ASPECT, v.box_height], BoxShape::Xcycwh)
            })
            .collect()
    }

    /// Separates vehicles that share a lane with a close neighbour.
    ///
    /// For each connected pair in the same lane, the later arrival is sent
    /// to the currently least used lane.
    fn steer(&self, rows: usize, graph: &ProximityGraph) -> Result<Vec<i64>, Fault> {
        let mut state = self.lock();
        if rows != state.vehicles.len() {
            return Err(Fault::inference(format!(
                "allocator got {} rows for {} vehicles on the road",
                rows,
                state.vehicles.len()
            )));
        }

        let mut lanes: Vec<i64> = state
            .vehicles
            .iter()
            .map(|v| self.tracker.lane_for(v.target_x))
            .collect();
        let mut load = vec![0usize; self.tracker.num_lanes.max(1)];
        for &lane in &lanes {
            load[lane as usize] += 1;
        }

        if !graph.is_fallback() {
            for &(i, j) in &graph.edges {
                if i >= j || j >= lanes.len() || lanes[i] != lanes[j] {
                    continue;
                }
                let Some((best, _)) = load.iter().enumerate().min_by_key(|(_, n)| **n) else {
                    continue;
                };
                let current = lanes[j] as usize;
                if best != current {
                    load[current] -= 1;
                    load[best] += 1;
                    lanes[j] = best as i64;
                }
            }
        }

        for (vehicle, &lane) in state.vehicles.iter_mut().zip(&lanes) {
            vehicle.target_x = self.lane_center(lane);
        }
        Ok(lanes)
    }
}

pub struct RoadDetector(Arc<SimulatedRoad>);

impl Detector for RoadDetector {
    fn detect(&mut self, frame: &Frame) -> Result<Vec<RawDetection>, Fault> {
        Ok(self.0.step(frame))
    }
}

pub struct RoadAllocator(Arc<SimulatedRoad>);

impl LaneAllocator for RoadAllocator {
    fn allocate(&mut self, features: &DMatrix<f64>, graph: &ProximityGraph) -> Result<Vec<i64>, Fault> {
        self.0.steer(features.nrows(), graph)
    }
}

// ============================================================================
// FRAME SOURCE
// ============================================================================

/// Blank frames at a fixed rate, paced by the context clock.
pub struct SyntheticFrameSource<Ctx: LanePilotContext> {
    context: Arc<Ctx>,
    period: Duration,
    width: u32,
    height: u32,
    /// Stream ends after this many frames (`None` = never)
    limit: Option<u64>,
    next_index: u64,
}

impl<Ctx: LanePilotContext> SyntheticFrameSource<Ctx> {
    pub fn new(context: Arc<Ctx>, fps: u32, width: u32, height: u32, limit: Option<u64>) -> Self {
        Self {
            context,
            period: Duration::from_nanos(1_000_000_000 / fps.max(1) as u64),
            width,
            height,
            limit,
            next_index: 0,
        }
    }
}

#[async_trait]
impl<Ctx: LanePilotContext> FrameSource for SyntheticFrameSource<Ctx> {
    async fn next_frame(&mut self) -> Result<Option<Frame>, Fault> {
        if self.limit.is_some_and(|limit| self.next_index >= limit) {
            return Ok(None);
        }
        if self.next_index > 0 {
            self.context.sleep(self.period).await;
        }

        let frame = Frame {
            index: self.next_index,
            width: self.width,
            height: self.height,
            data: Vec::new(),
            captured_at: self.context.now(),
        };
        self.next_index += 1;
        Ok(Some(frame))
    }
}

// ============================================================================
// SERVOS
// ============================================================================

/// Servo driver that only logs what it would write.
#[derive(Debug, Default)]
pub struct LoggingServoDriver {
    angles: BTreeMap<u8, i32>,
}

impl LoggingServoDriver {
    pub fn angle(&self, servo_id: u8) -> Option<i32> {
        self.angles.get(&servo_id).copied()
    }
}

impl ServoDriver for LoggingServoDriver {
    fn set_angle(&mut self, servo_id: u8, degrees: i32) -> Result<(), ActuatorError> {
        info!(servo = servo_id, degrees, "Servo angle set");
        self.angles.insert(servo_id, degrees);
        Ok(())
    }

    fn release(&mut self) -> Result<(), ActuatorError> {
        info!(servos = self.angles.len(), "Servo torque released");
        self.angles.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use lanepilot_env::ManualContext;

    fn tracker() -> TrackerConfig {
        TrackerConfig {
            image_width_px: 300.0,
            image_height_px: 200.0,
            num_lanes: 3,
            ..TrackerConfig::default()
        }
    }

    fn frame(index: u64) -> Frame {
        Frame {
            index,
            width: 300,
            height: 200,
            data: Vec::new(),
            captured_at: Duration::ZERO,
        }
    }

    fn busy_road() -> Arc<SimulatedRoad> {
        let config = RoadConfig {
            spawn_probability: 1.0,
            noise_px: 0.0,
            ..RoadConfig::default()
        };
        SimulatedRoad::new(7, tracker(), config).unwrap()
    }

    #[test]
    fn test_vehicles_enter_and_leave() {
        let road = busy_road();
        let mut detector = road.detector();
        let mut seen_ids = Vec::new();

        for index in 0..60 {
            let detections = detector.detect(&frame(index)).unwrap();
            assert!(detections.len() <= RoadConfig::default().max_vehicles);
            assert!(detections.windows(2).all(|w| w[0].track_id < w[1].track_id));
            seen_ids.extend(detections.iter().map(|d| d.track_id));
        }

        seen_ids.sort_unstable();
        seen_ids.dedup();
        // Vehicles cross 200 px in about 30 frames, so some have left
        assert!(seen_ids.len() > road.vehicle_count());
    }

    #[test]
    fn test_congested_pair_is_separated() {
        let road = busy_road();
        {
            let mut state = road.lock();
            for (id, y) in [(1, 100.0), (2, 110.0)] {
                state.vehicles.push(SimVehicle {
                    id,
                    center: Vector2::new(50.0, y),
                    box_height: 40.0,
                    target_x: 50.0,
                });
            }
        }

        let graph = ProximityGraph {
            edges: vec![(0, 1), (1, 0)],
            weights: vec![1.0, 1.0],
        };
        let lanes = road.steer(2, &graph).unwrap();
        assert_eq!(lanes, vec![0, 1]);

        // The moved vehicle now heads for the centre of lane 1
        assert_relative_eq!(road.lock().vehicles[1].target_x, 150.0);
    }

    #[test]
    fn test_fallback_graph_keeps_lanes() {
        let road = busy_road();
        let mut detector = road.detector();
        let detections = detector.detect(&frame(0)).unwrap();

        let lanes = road.steer(detections.len(), &ProximityGraph::fallback()).unwrap();
        let expected: Vec<i64> = detections.iter().map(|d| tracker().lane_for(d.bbox[0])).collect();
        assert_eq!(lanes, expected);
    }

    #[test]
    fn test_row_mismatch_is_inference_fault() {
        let road = busy_road();
        assert!(matches!(
            road.steer(3, &ProximityGraph::fallback()),
            Err(Fault::Inference(_))
        ));
    }

    #[tokio::test]
    async fn test_frame_source_paces_with_context_clock() {
        let context = ManualContext::shared(1);
        let mut source = SyntheticFrameSource::new(context.clone(), 10, 300, 200, Some(3));

        let mut stamps = Vec::new();
        while let Some(frame) = source.next_frame().await.unwrap() {
            stamps.push(frame.captured_at);
        }

        assert_eq!(stamps.len(), 3);
        assert_eq!(stamps[2] - stamps[0], Duration::from_millis(200));
    }

    #[test]
    fn test_logging_driver_release_clears() {
        let mut driver = LoggingServoDriver::default();
        driver.set_angle(3, 210).unwrap();
        assert_eq!(driver.angle(3), Some(210));
        driver.release().unwrap();
        assert_eq!(driver.angle(3), None);
    }
}
