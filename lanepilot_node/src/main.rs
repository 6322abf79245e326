//! LanePilot node CLI
//!
//! Runs one of the two node roles under the retry supervisor:
//!
//! ```text
//! lanepilot --config config/lanepilot.json actuator
//! lanepilot --config config/lanepilot.json vision --frames 600
//! ```
//!
//! Exit status: 0 on clean shutdown or SIGINT/SIGTERM, 1 when retries are
//! exhausted or a fatal fault occurs, 2 on a configuration fault.

mod roles;
mod sim;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use lanepilot_core::discovery::SECRET_ENV_VAR;
use lanepilot_core::{LanePilotConfig, SharedSecret};
use lanepilot_env::{RetryOutcome, RetrySupervisor, Shutdown, TokioContext};
use roles::VisionOptions;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[derive(Parser, Debug)]
#[command(name = "lanepilot")]
#[command(about = "Two-node lane allocation: vision node and actuator node", long_about = None)]
struct Args {
    /// JSON configuration file
    #[arg(short, long, default_value = "config/lanepilot.json")]
    config: PathBuf,

    /// Shared handshake secret
    #[arg(long, env = SECRET_ENV_VAR, hide_env_values = true)]
    secret: Option<String>,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    role: Role,
}

#[derive(Subcommand, Debug, Clone)]
enum Role {
    /// Camera side: answers discovery, runs the pipeline, sends lane switches
    Vision {
        /// Simulated frame rate
        #[arg(long, default_value = "10")]
        fps: u32,

        /// Stop after this many frames (0 = run until interrupted)
        #[arg(long, default_value = "0")]
        frames: u64,

        /// Seed of the simulated road
        #[arg(short, long, default_value = "42")]
        seed: u64,
    },

    /// Servo side: finds the vision node, serves commands, relays video
    Actuator,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    init_tracing(args.verbose);

    info!("LanePilot node v{}", env!("CARGO_PKG_VERSION"));

    let code = match bootstrap(&args) {
        Ok((config, secret)) => run(args.role, config, secret).await,
        Err(e) => {
            error!("Configuration error: {:#}", e);
            2
        }
    };
    std::process::exit(code);
}

fn init_tracing(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let subscriber = FmtSubscriber::builder().with_env_filter(filter).finish();
    tracing::subscriber::set_global_default(subscriber).expect("Failed to set tracing subscriber");
}

fn bootstrap(args: &Args) -> Result<(LanePilotConfig, SharedSecret)> {
    let config = LanePilotConfig::load(&args.config)
        .with_context(|| format!("loading {}", args.config.display()))?;
    let secret = match &args.secret {
        Some(secret) => SharedSecret::new(secret)?,
        None => SharedSecret::from_env(SECRET_ENV_VAR)?,
    };
    Ok((config, secret))
}

async fn run(role: Role, config: LanePilotConfig, secret: SharedSecret) -> i32 {
    let interrupt = Shutdown::new();
    spawn_signal_handler(interrupt.clone());

    let context = TokioContext::shared();
    let supervisor = RetrySupervisor::new(Arc::clone(&context), config.retry.policy(), interrupt.clone());
    let config = Arc::new(config);

    let outcome = supervisor
        .run(|attempt| {
            let context = Arc::clone(&context);
            let config = Arc::clone(&config);
            let secret = secret.clone();
            let interrupt = interrupt.clone();
            let role = role.clone();
            async move {
                match role {
                    Role::Actuator => roles::run_actuator(attempt, context, config, secret, interrupt).await,
                    Role::Vision { fps, frames, seed } => {
                        let options = VisionOptions {
                            fps,
                            frames: (frames > 0).then_some(frames),
                            seed,
                        };
                        roles::run_vision(attempt, context, config, secret, interrupt, options).await
                    }
                }
            }
        })
        .await;

    match &outcome {
        RetryOutcome::Completed { attempts } => info!(attempts, "Node finished"),
        RetryOutcome::Interrupted { .. } => info!("Node interrupted, exiting"),
        RetryOutcome::Exhausted { attempts, last_fault } => {
            error!(attempts, "Giving up: {}", last_fault)
        }
        RetryOutcome::Fatal { fault, .. } => error!("Fatal: {}", fault),
    }
    outcome.exit_code()
}

fn spawn_signal_handler(interrupt: Shutdown) {
    tokio::spawn(async move {
        wait_for_signal().await;
        info!("Signal received, shutting down");
        interrupt.trigger();
    });
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    match signal(SignalKind::terminate()) {
        Ok(mut terminate) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = terminate.recv() => {}
            }
        }
        Err(e) => {
            warn!("SIGTERM handler unavailable: {}", e);
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parses_roles() {
        let args = Args::try_parse_from(["lanepilot", "-c", "rig.json", "vision", "--frames", "5"]).unwrap();
        assert_eq!(args.config, PathBuf::from("rig.json"));
        assert!(matches!(args.role, Role::Vision { frames: 5, fps: 10, .. }));

        let args = Args::try_parse_from(["lanepilot", "--secret", "s3cret", "actuator"]).unwrap();
        assert_eq!(args.secret.as_deref(), Some("s3cret"));
        assert!(matches!(args.role, Role::Actuator));
    }

    #[test]
    fn test_missing_config_fails_bootstrap() {
        let args = Args::try_parse_from(["lanepilot", "-c", "/nonexistent.json", "--secret", "x", "actuator"]).unwrap();
        assert!(bootstrap(&args).is_err());
    }
}
