//! Fault taxonomy shared by every LanePilot component.

use thiserror::Error;

/// A fault surfaced by a supervised component.
///
/// Faults are `Clone` so that a stored task fault can be inspected by the
/// owner after `join()` and still be handed to the retry supervisor.
///
/// Degenerate geometry in the tracker is deliberately absent here: it is
/// represented by sentinel values (`f64::INFINITY` depth, zero speed).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Fault {
    /// Socket/connection error on discovery, command channel or video relay
    #[error("Transport fault: {0}")]
    Transport(String),

    /// Malformed or unauthenticated message
    #[error("Protocol fault: {0}")]
    Protocol(String),

    /// Missing or invalid setting, missing model file
    #[error("Configuration fault: {0}")]
    Configuration(String),

    /// Failed write to an actuator
    #[error("Actuator fault: {0}")]
    Actuator(String),

    /// Detector or allocator failure inside a pipeline cycle
    #[error("Inference fault: {0}")]
    Inference(String),

    /// Operation timed out
    #[error("Timeout after {0}ms")]
    Timeout(u64),

    /// The task body panicked
    #[error("Task '{0}' panicked")]
    Panicked(String),

    /// Operator cancel (SIGINT/SIGTERM)
    #[error("Interrupted by operator")]
    Interrupted,
}

impl Fault {
    /// Creates a transport fault.
    pub fn transport(msg: impl Into<String>) -> Self {
        Self::Transport(msg.into())
    }

    /// Creates a protocol fault.
    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }

    /// Creates a configuration fault.
    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    /// Creates an actuator fault.
    pub fn actuator(msg: impl Into<String>) -> Self {
        Self::Actuator(msg.into())
    }

    /// Creates an inference fault.
    pub fn inference(msg: impl Into<String>) -> Self {
        Self::Inference(msg.into())
    }

    /// Whether restarting the top-level operation can help.
    ///
    /// Configuration faults are fatal at startup and an operator interrupt
    /// must never be retried.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::Configuration(_) | Self::Interrupted)
    }
}

impl From<std::io::Error> for Fault {
    fn from(e: std::io::Error) -> Self {
        Self::Transport(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(Fault::transport("reset by peer").is_retryable());
        assert!(Fault::Timeout(100).is_retryable());
        assert!(Fault::Panicked("pipeline".into()).is_retryable());
        assert!(!Fault::configuration("missing secret").is_retryable());
        assert!(!Fault::Interrupted.is_retryable());
    }

    #[test]
    fn test_io_error_is_transport() {
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset");
        assert!(matches!(Fault::from(io), Fault::Transport(_)));
    }
}
