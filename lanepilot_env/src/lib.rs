//! LanePilot Environment Layer
//!
//! This crate provides the execution model shared by both LanePilot nodes
//! (the vision node and the actuator node):
//!
//! - **Context**: clock, sleep and entropy behind the `LanePilotContext` trait,
//!   so engines can run against the real runtime (`TokioContext`) or a
//!   hand-driven clock (`ManualContext`) in tests.
//! - **Faults**: the `Fault` taxonomy every long-running component surfaces.
//! - **SupervisedTask**: one cancellable, fault-reporting unit of work per
//!   responsibility (discovery responder, command channel, video relay, pipeline).
//! - **RetrySupervisor**: the only layer that decides to restart work.
//!
//! # Example
//!
//! ```ignore
//! use lanepilot_env::{RetryPolicy, RetrySupervisor, Shutdown, SupervisedTask, TokioContext};
//!
//! let interrupt = Shutdown::new();
//! let supervisor = RetrySupervisor::new(TokioContext::shared(), RetryPolicy::default(), interrupt);
//! let outcome = supervisor.run(|attempt| start_network(attempt)).await;
//! std::process::exit(outcome.exit_code());
//! ```

mod context;
mod error;
mod manual_impl;
mod retry;
mod shutdown;
mod task;
mod tokio_impl;
mod types;

pub use context::LanePilotContext;
pub use error::Fault;
pub use manual_impl::ManualContext;
pub use retry::{RetryOutcome, RetryPolicy, RetrySupervisor};
pub use shutdown::Shutdown;
pub use task::SupervisedTask;
pub use tokio_impl::TokioContext;
pub use types::SessionId;
