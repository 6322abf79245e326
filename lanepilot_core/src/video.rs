//! Video relay - camera to peer over SRT, via a `gst-launch-1.0` child.
//!
//! The media pipeline itself is external. This module only builds the
//! caller command line and supervises the child process: `stop()` kills
//! it, a non-zero exit is a transport fault.

use lanepilot_env::{Fault, Shutdown, SupervisedTask};
use serde::{Deserialize, Serialize};
use std::io::ErrorKind;
use std::net::IpAddr;
use std::process::Stdio;
use tokio::process::Command;
use tracing::{info, warn};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VideoConfig {
    /// Start the relay on the actuator node
    #[serde(default)]
    pub enabled: bool,

    #[serde(default = "default_width")]
    pub width: u32,

    #[serde(default = "default_height")]
    pub height: u32,

    #[serde(default = "default_framerate")]
    pub framerate: u32,

    /// x264 target bitrate in kbit/s
    #[serde(default = "default_bitrate")]
    pub bitrate_kbps: u32,

    /// SRT port on the vision node
    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default = "default_program")]
    pub program: String,
}

fn default_width() -> u32 {
    1280
}

fn default_height() -> u32 {
    720
}

fn default_framerate() -> u32 {
    30
}

fn default_bitrate() -> u32 {
    2000
}

fn default_port() -> u16 {
    5001
}

fn default_program() -> String {
    "gst-launch-1.0".to_string()
}

impl Default for VideoConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            width: default_width(),
            height: default_height(),
            framerate: default_framerate(),
            bitrate_kbps: default_bitrate(),
            port: default_port(),
            program: default_program(),
        }
    }
}

impl VideoConfig {
    /// Arguments of the camera → H.264 → MPEG-TS → SRT caller pipeline.
    pub fn caller_args(&self, peer: IpAddr) -> Vec<String> {
        let caps = format!(
            "video/x-raw,format=NV12,width={},height={},framerate={}/1",
            self.width, self.height, self.framerate
        );
        let bitrate = format!("bitrate={}", self.bitrate_kbps);
        let uri = format!("uri=\"srt://{}:{}?mode=caller&latency=1\"", peer, self.port);

        [
            "libcamerasrc",
            "!",
            caps.as_str(),
            "!",
            "videoconvert",
            "!",
            "x264enc",
            "tune=zerolatency",
            bitrate.as_str(),
            "speed-preset=ultrafast",
            "!",
            "video/x-h264,profile=main",
            "!",
            "queue",
            "!",
            "mpegtsmux",
            "!",
            "srtsink",
            uri.as_str(),
        ]
        .iter()
        .map(|s| s.to_string())
        .collect()
    }
}

/// Starts the SRT caller towards `peer` as a supervised child process.
pub fn start_video_relay(config: &VideoConfig, peer: IpAddr, shutdown: Shutdown) -> SupervisedTask {
    info!("Starting GStreamer pipeline to {}:{}", peer, config.port);
    start_child("video-relay", config.program.clone(), config.caller_args(peer), shutdown)
}

/// Runs `program args..` until it exits or `shutdown` fires.
pub fn start_child(name: &str, program: String, args: Vec<String>, shutdown: Shutdown) -> SupervisedTask {
    SupervisedTask::start_with(name, shutdown, move |shutdown| run_child(program, args, shutdown))
}

async fn run_child(program: String, args: Vec<String>, shutdown: Shutdown) -> Result<(), Fault> {
    let mut child = Command::new(&program)
        .args(&args)
        .stdin(Stdio::null())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| match e.kind() {
            ErrorKind::NotFound => Fault::configuration(format!("{} not found", program)),
            _ => Fault::transport(format!("failed to start {}: {}", program, e)),
        })?;

    tokio::select! {
        _ = shutdown.triggered() => {
            if let Err(e) = child.kill().await {
                warn!("Failed to kill {}: {}", program, e);
            }
            info!("GStreamer pipeline terminated.");
            Ok(())
        }
        status = child.wait() => {
            let status = status?;
            if status.success() {
                info!("{} exited", program);
                Ok(())
            } else {
                Err(Fault::transport(format!("{} exited with {}", program, status)))
            }
        }
    }
}
