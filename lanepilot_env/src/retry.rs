//! Retry supervisor - restarts a top-level operation on failure.
//!
//! This is the only place in LanePilot where restarts are decided. Inner
//! components surface faults through their `SupervisedTask` and let the
//! whole "start network" operation be retried from discovery onwards.

use crate::{Fault, LanePilotContext, Shutdown};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Configuration for the retry supervisor.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Maximum number of attempts (default: 5, values below 1 count as 1)
    pub max_attempts: u32,

    /// Delay between attempts (default: 5s)
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            delay: Duration::from_secs(5),
        }
    }
}

/// How a supervised run ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryOutcome {
    /// The operation returned normally.
    Completed { attempts: u32 },

    /// The operator cancelled; no further attempt was made.
    Interrupted { attempts: u32 },

    /// Every attempt failed with a retryable fault.
    Exhausted { attempts: u32, last_fault: Fault },

    /// A non-retryable fault ended the run.
    Fatal { attempts: u32, fault: Fault },
}

impl RetryOutcome {
    /// Number of times the operation was invoked.
    pub fn attempts(&self) -> u32 {
        match self {
            Self::Completed { attempts }
            | Self::Interrupted { attempts }
            | Self::Exhausted { attempts, .. }
            | Self::Fatal { attempts, .. } => *attempts,
        }
    }

    /// Process exit status for this outcome.
    ///
    /// 0 = clean shutdown, 1 = retries exhausted or fatal runtime fault,
    /// 2 = configuration fault.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Completed { .. } | Self::Interrupted { .. } => 0,
            Self::Exhausted { .. } => 1,
            Self::Fatal {
                fault: Fault::Configuration(_),
                ..
            } => 2,
            Self::Fatal { .. } => 1,
        }
    }
}

/// Restarts a fallible operation with bounded retries and a fixed delay.
pub struct RetrySupervisor<Ctx: LanePilotContext> {
    context: Arc<Ctx>,
    policy: RetryPolicy,
    interrupt: Shutdown,
}

impl<Ctx: LanePilotContext> RetrySupervisor<Ctx> {
    /// Creates a supervisor. `interrupt` is the operator-cancel handle
    /// (wired to SIGINT/SIGTERM by the binary).
    pub fn new(context: Arc<Ctx>, policy: RetryPolicy, interrupt: Shutdown) -> Self {
        Self {
            context,
            policy,
            interrupt,
        }
    }

    /// Returns the operator-cancel handle.
    pub fn interrupt_handle(&self) -> Shutdown {
        self.interrupt.clone()
    }

    /// Runs `op` until it succeeds, a non-retryable fault occurs, the
    /// operator interrupts, or `max_attempts` is reached.
    ///
    /// `op` receives the 1-based attempt number. It is expected to observe
    /// the interrupt handle itself and return promptly once triggered.
    pub async fn run<F, Fut>(&self, mut op: F) -> RetryOutcome
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<(), Fault>>,
    {
        let max_attempts = self.policy.max_attempts.max(1);
        debug!(max_attempts, delay_ms = self.policy.delay.as_millis() as u64, "retry supervisor armed");

        let mut attempt = 0;
        loop {
            if self.interrupt.is_triggered() {
                info!("Interrupt received before attempt {}, exiting", attempt + 1);
                return RetryOutcome::Interrupted { attempts: attempt };
            }

            attempt += 1;
            let result = op(attempt).await;

            if self.interrupt.is_triggered() {
                info!("Interrupt received, exiting without retry");
                return RetryOutcome::Interrupted { attempts: attempt };
            }

            let fault = match result {
                Ok(()) => return RetryOutcome::Completed { attempts: attempt },
                Err(Fault::Interrupted) => return RetryOutcome::Interrupted { attempts: attempt },
                Err(fault) if !fault.is_retryable() => {
                    error!("Fatal fault, not retrying: {}", fault);
                    return RetryOutcome::Fatal {
                        attempts: attempt,
                        fault,
                    };
                }
                Err(fault) => fault,
            };

            if attempt >= max_attempts {
                error!("Max retries reached ({}). Last fault: {}", max_attempts, fault);
                return RetryOutcome::Exhausted {
                    attempts: attempt,
                    last_fault: fault,
                };
            }

            warn!(
                "[{}/{}] {}. Retrying in {:.1}s...",
                attempt,
                max_attempts,
                fault,
                self.policy.delay.as_secs_f64()
            );

            tokio::select! {
                _ = self.interrupt.triggered() => {
                    info!("Interrupt received during retry delay, exiting");
                    return RetryOutcome::Interrupted { attempts: attempt };
                }
                _ = self.context.sleep(self.policy.delay) => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ManualContext;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn supervisor(max_attempts: u32) -> RetrySupervisor<ManualContext> {
        RetrySupervisor::new(
            ManualContext::shared(7),
            RetryPolicy {
                max_attempts,
                delay: Duration::from_secs(5),
            },
            Shutdown::new(),
        )
    }

    #[tokio::test]
    async fn test_recovers_after_two_failures() {
        let supervisor = supervisor(5);
        let calls = AtomicU32::new(0);

        let outcome = supervisor
            .run(|_| {
                let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                async move {
                    if n <= 2 {
                        Err(Fault::transport("peer vanished"))
                    } else {
                        Ok(())
                    }
                }
            })
            .await;

        assert_eq!(outcome, RetryOutcome::Completed { attempts: 3 });
        assert_eq!(outcome.exit_code(), 0);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_always_failing_stops_after_exactly_max_attempts() {
        let supervisor = supervisor(3);
        let calls = AtomicU32::new(0);

        let outcome = supervisor
            .run(|_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(Fault::transport("no route to host")) }
            })
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(
            outcome,
            RetryOutcome::Exhausted {
                attempts: 3,
                last_fault: Fault::transport("no route to host"),
            }
        );
        assert_ne!(outcome.exit_code(), 0);
    }

    #[tokio::test]
    async fn test_configuration_fault_is_not_retried() {
        let supervisor = supervisor(5);
        let calls = AtomicU32::new(0);

        let outcome = supervisor
            .run(|_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(Fault::configuration("handshake secret missing")) }
            })
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(outcome.exit_code(), 2);
    }

    #[tokio::test]
    async fn test_interrupt_exits_without_retry() {
        let supervisor = supervisor(5);
        let interrupt = supervisor.interrupt_handle();
        let calls = AtomicU32::new(0);

        let outcome = supervisor
            .run(|_| {
                calls.fetch_add(1, Ordering::SeqCst);
                interrupt.trigger();
                async { Err(Fault::transport("stream closed")) }
            })
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(outcome, RetryOutcome::Interrupted { attempts: 1 });
        assert_eq!(outcome.exit_code(), 0);
    }

    #[tokio::test]
    async fn test_delay_uses_context_clock() {
        let context = ManualContext::shared(1);
        let supervisor = RetrySupervisor::new(
            Arc::clone(&context),
            RetryPolicy {
                max_attempts: 3,
                delay: Duration::from_secs(5),
            },
            Shutdown::new(),
        );

        let _ = supervisor
            .run(|_| async { Err::<(), _>(Fault::Timeout(10)) })
            .await;

        // Two delays between three attempts
        assert_eq!(context.now(), Duration::from_secs(10));
    }
}
