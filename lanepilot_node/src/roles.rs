//! The two node roles. Each function is one "start network" attempt run
//! under the `RetrySupervisor`: it builds every component from scratch,
//! waits until something ends or faults, and tears everything down.

use crate::sim::{LoggingServoDriver, RoadConfig, SimulatedRoad, SyntheticFrameSource};
use lanepilot_core::video::start_video_relay;
use lanepilot_core::{
    ActuatorDispatcher, CommandChannel, LanePilotConfig, PeerDiscovery, PipelineOrchestrator, SharedDirection,
    SharedSecret,
};
use lanepilot_env::{Fault, LanePilotContext, Shutdown, SupervisedTask};
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{info, warn};

/// Settings of the simulated vision collaborators.
#[derive(Debug, Clone)]
pub struct VisionOptions {
    pub fps: u32,
    /// End the frame stream after this many frames
    pub frames: Option<u64>,
    pub seed: u64,
}

/// Actuator node: command server, discovery requester, video relay, dispatcher.
///
/// The command server is bound before discovery so it is already listening
/// when the vision node connects back.
pub async fn run_actuator<Ctx: LanePilotContext>(
    attempt: u32,
    context: Arc<Ctx>,
    config: Arc<LanePilotConfig>,
    secret: SharedSecret,
    interrupt: Shutdown,
) -> Result<(), Fault> {
    let network = &config.network;
    info!(attempt, "Starting actuator node");

    let server = CommandChannel::bind(
        SocketAddr::new(network.bind_address, network.command_port),
        network.channel(),
    )
    .await?;

    let indicator = Arc::new(SharedDirection::new());
    let dispatcher = Arc::new(
        ActuatorDispatcher::new(config.actuator.clone(), Box::new(LoggingServoDriver::default()))
            .with_indicator(indicator.clone()),
    );
    server.add_listener(dispatcher.clone());

    let discovery = PeerDiscovery::new(context, network.discovery(), secret);
    let mut relay: Option<SupervisedTask> = None;

    let result = async {
        let session = discovery.discover_peer(&interrupt).await?;
        info!(peer = %session.peer_address, session = %session.session_id, "Vision node found");

        if config.video.enabled {
            relay = Some(start_video_relay(&config.video, session.peer_ip(), Shutdown::new()));
        }

        let outcome = tokio::select! {
            _ = interrupt.triggered() => Ok(()),
            result = server.join() => result,
            result = join_optional(relay.as_ref()) => result,
        };
        session.close();
        outcome
    }
    .await;

    if let Some(relay) = relay {
        relay.stop();
        if let Err(fault) = relay.join().await {
            warn!("Video relay ended with: {}", fault);
        }
    }
    server.dispose().await;
    dispatcher.dispose();
    discovery.dispose().await;
    info!(direction = ?indicator.current(), "Actuator node stopped");
    result
}

/// Vision node: discovery responder, command client, inference pipeline.
///
/// Without `stop_on_response` the responder keeps answering requests for
/// the whole attempt and is stopped during teardown.
pub async fn run_vision<Ctx: LanePilotContext>(
    attempt: u32,
    context: Arc<Ctx>,
    config: Arc<LanePilotConfig>,
    secret: SharedSecret,
    interrupt: Shutdown,
    options: VisionOptions,
) -> Result<(), Fault> {
    let network = &config.network;
    info!(attempt, "Starting vision node");

    let discovery = PeerDiscovery::new(Arc::clone(&context), network.discovery(), secret);

    let result: Result<(), Fault> = async {
        let session = discovery.respond_to_broadcast(&interrupt).await?;
        if discovery.config().stop_on_response {
            // Single-peer responder has already exited
            discovery.dispose().await;
        }

        let tracker_config = config.tracker_config();
        let road = SimulatedRoad::new(options.seed, tracker_config.clone(), RoadConfig::default())?;

        let peer = SocketAddr::new(session.peer_ip(), network.command_port);
        let client = Arc::new(CommandChannel::connect(peer, network.channel()).await?);
        let source = SyntheticFrameSource::new(
            Arc::clone(&context),
            options.fps,
            config.camera.resolution[0],
            config.camera.resolution[1],
            options.frames,
        );
        let pipeline = PipelineOrchestrator::new(
            Arc::clone(&context),
            tracker_config,
            config.graph.clone(),
            Box::new(road.detector()),
            Box::new(road.allocator()),
        );

        // Pipeline and client form one cancellation group
        let tasks = pipeline.spawn(Box::new(source), client.clone(), client.shutdown_handle());

        let outcome = tokio::select! {
            _ = interrupt.triggered() => Ok(()),
            result = tasks.join() => result,
            result = client.join() => {
                tasks.stop();
                tasks.join().await.and(result)
            }
        };

        // Exit notice first; disposing the client stops the whole group
        client.dispose().await;
        let _ = tasks.join().await;
        session.close();
        outcome
    }
    .await;

    discovery.dispose().await;
    info!("Vision node stopped");
    result
}

async fn join_optional(task: Option<&SupervisedTask>) -> Result<(), Fault> {
    match task {
        Some(task) => task.join().await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lanepilot_core::DiscoveryConfig;
    use lanepilot_env::TokioContext;
    use std::net::{IpAddr, Ipv4Addr};
    use std::time::Duration;
    use tokio::net::UdpSocket;

    fn loopback_config(discovery_port: u16, command_port: u16, stop_on_response: bool) -> LanePilotConfig {
        let text = format!(
            r#"{{
                "network": {{
                    "discovery_port": {discovery_port},
                    "command_port": {command_port},
                    "broadcast_address": "127.0.0.1",
                    "bind_address": "127.0.0.1",
                    "stop_on_response": {stop_on_response},
                    "liveness_interval_ms": 200,
                    "reply_timeout_ms": 1000,
                    "connect_timeout_ms": 1000
                }},
                "camera": {{ "fov_deg": 62.2, "resolution": [640, 360] }},
                "vehicle": {{ "height_cm": 6.0 }},
                "environment": {{ "num_lanes": 3 }},
                "graph": {{ "lane_tolerance": 1, "max_distance_cm": 10.0, "weighting": "inverse" }},
                "actuator": {{ "turning_degree": 30, "lane_servos": {{ "0": [1], "1": [2], "2": [3] }} }}
            }}"#
        );
        LanePilotConfig::from_json(&text).unwrap()
    }

    async fn free_udp_port() -> u16 {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        socket.local_addr().unwrap().port()
    }

    #[tokio::test]
    async fn test_vision_keeps_answering_discovery_without_stop_on_response() {
        let channel_config = loopback_config(0, 0, false).network.channel();
        let server = CommandChannel::bind("127.0.0.1:0".parse().unwrap(), channel_config)
            .await
            .unwrap();
        let dispatcher = Arc::new(ActuatorDispatcher::new(
            loopback_config(0, 0, false).actuator,
            Box::new(LoggingServoDriver::default()),
        ));
        server.add_listener(dispatcher.clone());

        let discovery_port = free_udp_port().await;
        let config = Arc::new(loopback_config(discovery_port, server.local_addr().port(), false));
        let secret = SharedSecret::new("lane pilot test secret").unwrap();
        let interrupt = Shutdown::new();

        let requester_config = DiscoveryConfig {
            port: discovery_port,
            broadcast_address: IpAddr::V4(Ipv4Addr::LOCALHOST),
            bind_address: IpAddr::V4(Ipv4Addr::LOCALHOST),
            self_address: None,
            timeout: Duration::from_millis(300),
            attempts: 5,
            stop_on_response: true,
        };

        let options = VisionOptions {
            fps: 10,
            frames: None,
            seed: 1,
        };
        let vision = run_vision(
            1,
            TokioContext::shared(),
            Arc::clone(&config),
            secret.clone(),
            interrupt.clone(),
            options,
        );

        let requesters = async {
            let first = PeerDiscovery::new(TokioContext::shared(), requester_config.clone(), secret.clone());
            let first_session = first.discover_peer(&Shutdown::new()).await;

            // A later requester is still answered by the same vision node
            let second = PeerDiscovery::new(TokioContext::shared(), requester_config.clone(), secret.clone());
            let second_session = second.discover_peer(&Shutdown::new()).await;

            interrupt.trigger();
            (first_session, second_session)
        };

        let (result, (first_session, second_session)) = tokio::join!(vision, requesters);

        assert_eq!(first_session.unwrap().peer_address.port(), discovery_port);
        assert_eq!(second_session.unwrap().peer_address.port(), discovery_port);
        assert!(result.is_ok());

        // Teardown released the discovery port
        assert!(UdpSocket::bind(("127.0.0.1", discovery_port)).await.is_ok());

        server.dispose().await;
        dispatcher.dispose();
    }
}
