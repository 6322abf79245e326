//! Pipeline orchestrator - frame in, lane-switch commands out.
//!
//! ```text
//!   FrameSource ─► Detector ─► VehicleTracker ─► ProximityGraphBuilder ─► LaneAllocator
//!                                                                            │
//!                               producer task                                ▼
//!                          ──────────────────────────  handoff (mpsc, capacity 1)
//!                               consumer task                                │
//!                                                                            ▼
//!                                                              CommandSink::send_command
//! ```
//!
//! The producer awaits free capacity in the handoff slot, so a decision is
//! never dropped while inference runs ahead of the transport. Both tasks
//! share one cancellation handle: a fault in either stops the other.

use crate::command_channel::CommandSink;
use crate::inference::{Detector, Frame, FrameSource, LaneAllocator};
use crate::proximity_graph::{GraphConfig, ProximityGraphBuilder};
use crate::vehicle_tracking::{TrackerConfig, VehicleDetection, VehicleTracker};
use crate::wire::{CommandMessage, LaneSwitch};
use lanepilot_env::{Fault, LanePilotContext, Shutdown, SupervisedTask};
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info};

/// Runs one inference cycle per frame.
pub struct PipelineOrchestrator<Ctx: LanePilotContext> {
    context: Arc<Ctx>,
    tracker: Arc<VehicleTracker>,
    graph_builder: ProximityGraphBuilder,
    detector: Box<dyn Detector>,
    allocator: Box<dyn LaneAllocator>,
    frames_processed: u64,
}

impl<Ctx: LanePilotContext> PipelineOrchestrator<Ctx> {
    pub fn new(
        context: Arc<Ctx>,
        tracker_config: TrackerConfig,
        graph_config: GraphConfig,
        detector: Box<dyn Detector>,
        allocator: Box<dyn LaneAllocator>,
    ) -> Self {
        Self {
            context,
            tracker: Arc::new(VehicleTracker::new(tracker_config)),
            graph_builder: ProximityGraphBuilder::new(graph_config),
            detector,
            allocator,
            frames_processed: 0,
        }
    }

    /// Shared handle to the tracker (read-only inspection).
    pub fn tracker(&self) -> Arc<VehicleTracker> {
        Arc::clone(&self.tracker)
    }

    pub fn frames_processed(&self) -> u64 {
        self.frames_processed
    }

    /// Detect, track, build the graph, allocate; returns the lane switches
    /// for every vehicle in this frame whose allocated lane differs from
    /// its current one.
    pub fn process_frame(&mut self, frame: &Frame) -> Result<Vec<LaneSwitch>, Fault> {
        let detections = self
            .detector
            .detect(frame)?
            .iter()
            .map(|raw| raw.to_vehicle_detection())
            .collect::<Result<Vec<VehicleDetection>, _>>()
            .map_err(|e| Fault::inference(format!("detector output: {}", e)))?;

        let report = self.tracker.observe(&detections, self.context.now());
        self.frames_processed += 1;
        if !report.removed.is_empty() {
            debug!(frame = frame.index, removed = ?report.removed, "stale vehicles evicted");
        }

        // The batch is the set of vehicles seen in this frame, ordered by id
        let seen: BTreeSet<i64> = detections.iter().map(|d| d.track_id).collect();
        let mut snapshot = self.tracker.snapshot();
        snapshot.states.retain(|s| seen.contains(&s.id));
        if snapshot.states.is_empty() {
            return Ok(Vec::new());
        }

        let config = self.tracker.config();
        let graph = self
            .graph_builder
            .build(&snapshot.ids(), &snapshot.raw_features(config.num_lanes));
        let features = snapshot.normalized_features(config.num_lanes, config.normalization);

        let lanes = self.allocator.allocate(&features, &graph)?;
        if lanes.len() != snapshot.states.len() {
            return Err(Fault::inference(format!(
                "allocator returned {} lanes for {} vehicles",
                lanes.len(),
                snapshot.states.len()
            )));
        }

        let decisions: Vec<LaneSwitch> = snapshot
            .states
            .iter()
            .zip(lanes)
            .filter(|(state, lane)| state.lane_id != *lane)
            .map(|(state, lane)| LaneSwitch::new(state.lane_id, lane))
            .collect();

        debug!(
            frame = frame.index,
            vehicles = snapshot.states.len(),
            edges = graph.len(),
            decisions = decisions.len(),
            "cycle complete"
        );
        Ok(decisions)
    }

    /// Starts the producer and consumer tasks in the group `shutdown`.
    pub fn spawn(
        self,
        source: Box<dyn FrameSource>,
        sink: Arc<dyn CommandSink>,
        shutdown: Shutdown,
    ) -> PipelineTasks {
        let (slot_tx, slot_rx) = mpsc::channel(1);

        let producer = SupervisedTask::start_with("pipeline-producer", shutdown.clone(), move |shutdown| {
            run_producer(self, source, slot_tx, shutdown)
        });
        let consumer = SupervisedTask::start_with("pipeline-consumer", shutdown, move |shutdown| {
            run_consumer(slot_rx, sink, shutdown)
        });

        PipelineTasks { producer, consumer }
    }
}

async fn run_producer<Ctx: LanePilotContext>(
    mut pipeline: PipelineOrchestrator<Ctx>,
    mut source: Box<dyn FrameSource>,
    slot: mpsc::Sender<LaneSwitch>,
    shutdown: Shutdown,
) -> Result<(), Fault> {
    loop {
        let frame = tokio::select! {
            _ = shutdown.triggered() => return Ok(()),
            frame = source.next_frame() => frame?,
        };
        let Some(frame) = frame else {
            info!(frames = pipeline.frames_processed(), "Frame source ended");
            return Ok(());
        };

        for decision in pipeline.process_frame(&frame)? {
            tokio::select! {
                _ = shutdown.triggered() => return Ok(()),
                sent = slot.send(decision) => {
                    sent.map_err(|_| Fault::transport("decision consumer stopped"))?;
                }
            }
        }
    }
}

async fn run_consumer(
    mut slot: mpsc::Receiver<LaneSwitch>,
    sink: Arc<dyn CommandSink>,
    shutdown: Shutdown,
) -> Result<(), Fault> {
    loop {
        let decision = tokio::select! {
            _ = shutdown.triggered() => return Ok(()),
            decision = slot.recv() => decision,
        };
        let Some(decision) = decision else {
            return Ok(());
        };

        let reply = sink.send_command(CommandMessage::switch(decision)).await?;
        info!(switch = %decision, reply = %reply.value, "Lane switch sent");
    }
}

/// The two pipeline tasks.
pub struct PipelineTasks {
    producer: SupervisedTask,
    consumer: SupervisedTask,
}

impl PipelineTasks {
    pub fn stop(&self) {
        self.producer.stop();
        self.consumer.stop();
    }

    /// Waits for both tasks; the producer's fault takes precedence.
    pub async fn join(&self) -> Result<(), Fault> {
        let producer = self.producer.join().await;
        let consumer = self.consumer.join().await;
        producer.and(consumer)
    }

    pub fn shutdown_handle(&self) -> Shutdown {
        self.producer.shutdown_handle()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::BoxShape;
    use crate::inference::RawDetection;
    use crate::proximity_graph::{EdgeWeighting, ProximityGraph};
    use async_trait::async_trait;
    use lanepilot_env::ManualContext;
    use nalgebra::DMatrix;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::time::Duration;

    struct ScriptedSource(VecDeque<Frame>);

    impl ScriptedSource {
        fn frames(n: u64) -> Box<Self> {
            Box::new(Self(
                (0..n)
                    .map(|index| Frame {
                        index,
                        width: 300,
                        height: 200,
                        data: Vec::new(),
                        captured_at: Duration::from_millis(index * 100),
                    })
                    .collect(),
            ))
        }
    }

    #[async_trait]
    impl FrameSource for ScriptedSource {
        async fn next_frame(&mut self) -> Result<Option<Frame>, Fault> {
            Ok(self.0.pop_front())
        }
    }

    /// Two vehicles: id 1 in lane 0, id 2 in lane 2 (300 px wide image).
    struct TwoVehicles;

    impl Detector for TwoVehicles {
        fn detect(&mut self, _frame: &Frame) -> Result<Vec<RawDetection>, Fault> {
            Ok(vec![
                RawDetection::new(1, [20.0, 40.0, 40.0, 60.0], BoxShape::Xyxy),
                RawDetection::new(2, [250.0, 50.0, 20.0, 20.0], BoxShape::Xcycwh),
            ])
        }
    }

    struct FixedLanes(Vec<i64>);

    impl LaneAllocator for FixedLanes {
        fn allocate(&mut self, features: &DMatrix<f64>, graph: &ProximityGraph) -> Result<Vec<i64>, Fault> {
            assert!(!graph.edges.is_empty());
            Ok(self.0.iter().copied().take(features.nrows()).collect())
        }
    }

    #[derive(Default)]
    struct RecordingSink {
        sent: Mutex<Vec<CommandMessage>>,
    }

    #[async_trait]
    impl CommandSink for RecordingSink {
        async fn send_command(&self, message: CommandMessage) -> Result<CommandMessage, Fault> {
            // Slower than the producer, so the handoff slot fills up
            tokio::time::sleep(Duration::from_millis(5)).await;
            self.sent.lock().unwrap().push(message);
            Ok(CommandMessage::status_ok())
        }
    }

    fn tracker_config() -> TrackerConfig {
        TrackerConfig {
            image_width_px: 300.0,
            image_height_px: 200.0,
            num_lanes: 3,
            ..TrackerConfig::default()
        }
    }

    fn pipeline(allocator: FixedLanes) -> PipelineOrchestrator<ManualContext> {
        PipelineOrchestrator::new(
            ManualContext::shared(3),
            tracker_config(),
            GraphConfig::with_weighting(EdgeWeighting::Unit),
            Box::new(TwoVehicles),
            Box::new(allocator),
        )
    }

    #[test]
    fn test_process_frame_emits_only_changes() {
        let mut pipeline = pipeline(FixedLanes(vec![2, 2]));
        let frame = ScriptedSource::frames(1).0.pop_front().unwrap();

        let decisions = pipeline.process_frame(&frame).unwrap();
        assert_eq!(decisions, vec![LaneSwitch::new(0, 2)]);
        assert_eq!(pipeline.tracker().len(), 2);
        assert_eq!(pipeline.frames_processed(), 1);
    }

    #[test]
    fn test_allocator_length_mismatch_is_inference_fault() {
        let mut pipeline = pipeline(FixedLanes(vec![1]));
        let frame = ScriptedSource::frames(1).0.pop_front().unwrap();
        assert!(matches!(pipeline.process_frame(&frame), Err(Fault::Inference(_))));
    }

    #[tokio::test]
    async fn test_every_decision_reaches_the_sink_in_order() {
        let sink = Arc::new(RecordingSink::default());
        let tasks = pipeline(FixedLanes(vec![1, 1])).spawn(ScriptedSource::frames(4), sink.clone(), Shutdown::new());

        tokio::time::timeout(Duration::from_secs(5), tasks.join())
            .await
            .unwrap()
            .unwrap();

        let sent = sink.sent.lock().unwrap().clone();
        let values: Vec<String> = sent.iter().map(|m| m.value.as_str().unwrap().to_string()).collect();
        assert_eq!(values, ["0-->1", "2-->1"].repeat(4));
        assert!(sent.iter().all(|m| m.command == "switch"));
    }

    #[tokio::test]
    async fn test_producer_fault_stops_consumer() {
        let sink = Arc::new(RecordingSink::default());
        let tasks = pipeline(FixedLanes(vec![])).spawn(ScriptedSource::frames(3), sink, Shutdown::new());

        let result = tokio::time::timeout(Duration::from_secs(5), tasks.join()).await.unwrap();
        assert!(matches!(result, Err(Fault::Inference(_))));
        assert!(tasks.shutdown_handle().is_triggered());
    }
}
