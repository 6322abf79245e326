//! LanePilot Core - camera-driven lane allocation for a two-node vehicle rig
//!
//! A vision node watches the road, tracks vehicles and decides lane
//! switches; an actuator node turns those decisions into servo angles.
//! This library holds everything both nodes share:
//! 1. **Perception state**: per-vehicle kinematics from bounding boxes
//!    (`vehicle_tracking`) and the proximity graph handed to the allocator
//!    (`proximity_graph`)
//! 2. **Peer link**: HMAC-authenticated UDP discovery (`discovery`) and the
//!    framed JSON request/reply channel (`wire`, `command_channel`)
//! 3. **Orchestration**: the producer/consumer inference pipeline
//!    (`pipeline`), the servo dispatcher (`actuator`) and the SRT video
//!    relay (`video`)

pub mod actuator;
pub mod command_channel;
pub mod config;
pub mod discovery;
pub mod geometry;
pub mod inference;
pub mod normalization;
pub mod pipeline;
pub mod proximity_graph;
pub mod vehicle_tracking;
pub mod video;
pub mod wire;

// Re-export key types for convenience
pub use actuator::{ActuatorConfig, ActuatorDispatcher, Direction, ServoDriver, SharedDirection};
pub use command_channel::{ChannelConfig, CommandChannel, CommandListener, CommandSink};
pub use config::{ConfigError, LanePilotConfig};
pub use discovery::{DiscoveryConfig, DiscoveryError, PeerDiscovery, PeerSession, SharedSecret};
pub use geometry::{BoxShape, Polygon};
pub use inference::{Detector, Frame, FrameSource, LaneAllocator, RawDetection};
pub use normalization::NormalizationMode;
pub use pipeline::{PipelineOrchestrator, PipelineTasks};
pub use proximity_graph::{EdgeWeighting, GraphConfig, ProximityGraph, ProximityGraphBuilder};
pub use vehicle_tracking::{TrackerConfig, VehicleDetection, VehicleState, VehicleTracker};
pub use video::VideoConfig;
pub use wire::{CommandMessage, LaneSwitch};
