//! Supervised task - the single reusable unit of concurrent work.
//!
//! Every long-running component (discovery responder, command channel,
//! video relay, pipeline producer/consumer) runs as one `SupervisedTask`
//! taking a work closure, instead of one thread type per responsibility.
//!
//! # Contract
//!
//! ```text
//!   start(name, work) ──► work(shutdown) runs on the runtime
//!   stop()            ──► shutdown.trigger()  (idempotent)
//!   join().await      ──► Ok(()) | Err(fault)  (stored, repeatable)
//!   fault()           ──► Option<Fault> once the body has exited
//! ```
//!
//! The work body owns its resources (sockets, child processes, device
//! handles). It must select on `shutdown.triggered()` at every blocking
//! boundary and return; resources are released when the body's locals drop.

use crate::{Fault, Shutdown};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error};

/// A cancellable, fault-reporting unit of concurrent execution.
pub struct SupervisedTask {
    name: String,
    shutdown: Shutdown,
    handle: tokio::sync::Mutex<Option<JoinHandle<Result<(), Fault>>>>,
    fault: Arc<Mutex<Option<Fault>>>,
    finished: Arc<AtomicBool>,
}

impl SupervisedTask {
    /// Starts `work` with a fresh cancellation handle.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn start<F, Fut>(name: impl Into<String>, work: F) -> Self
    where
        F: FnOnce(Shutdown) -> Fut,
        Fut: Future<Output = Result<(), Fault>> + Send + 'static,
    {
        Self::start_with(name, Shutdown::new(), work)
    }

    /// Starts `work` bound to an existing cancellation handle.
    ///
    /// Tasks sharing one handle form a group: `stop()` on any of them stops
    /// all of them, and a fault in one triggers the handle so its siblings
    /// exit within one poll interval.
    pub fn start_with<F, Fut>(name: impl Into<String>, shutdown: Shutdown, work: F) -> Self
    where
        F: FnOnce(Shutdown) -> Fut,
        Fut: Future<Output = Result<(), Fault>> + Send + 'static,
    {
        let name = name.into();
        let fault = Arc::new(Mutex::new(None));
        let finished = Arc::new(AtomicBool::new(false));

        let body = work(shutdown.clone());
        let task_name = name.clone();
        let task_shutdown = shutdown.clone();
        let task_fault = Arc::clone(&fault);
        let task_finished = Arc::clone(&finished);

        let handle = tokio::spawn(async move {
            debug!(task = %task_name, "task started");
            let result = body.await;

            match &result {
                Ok(()) => debug!(task = %task_name, "task exited"),
                Err(Fault::Interrupted) => debug!(task = %task_name, "task interrupted"),
                Err(f) => {
                    error!(task = %task_name, fault = %f, "task faulted");
                    task_shutdown.trigger();
                }
            }
            if let Err(f) = &result {
                store_fault(&task_fault, f.clone());
            }
            task_finished.store(true, Ordering::Release);
            result
        });

        Self {
            name,
            shutdown,
            handle: tokio::sync::Mutex::new(Some(handle)),
            fault,
            finished,
        }
    }

    /// Returns the task's name (used in log lines).
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Requests cooperative cancellation. Idempotent.
    pub fn stop(&self) {
        self.shutdown.trigger();
    }

    /// Returns the cancellation handle this task observes.
    pub fn shutdown_handle(&self) -> Shutdown {
        self.shutdown.clone()
    }

    /// Returns true once the work body has returned.
    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::Acquire)
    }

    /// Waits for the work body to exit and returns its outcome.
    ///
    /// Can be called repeatedly and concurrently; later calls return the
    /// stored outcome.
    pub async fn join(&self) -> Result<(), Fault> {
        let mut handle = self.handle.lock().await;
        if let Some(h) = handle.take() {
            match h.await {
                Ok(_) => {}
                Err(e) if e.is_panic() => {
                    error!(task = %self.name, "task panicked");
                    store_fault(&self.fault, Fault::Panicked(self.name.clone()));
                    self.shutdown.trigger();
                    self.finished.store(true, Ordering::Release);
                }
                Err(_) => {
                    // Aborted by runtime shutdown: nothing ran to completion, nothing to report
                    self.finished.store(true, Ordering::Release);
                }
            }
        }
        drop(handle);

        match self.fault() {
            Some(f) => Err(f),
            None => Ok(()),
        }
    }

    /// Returns the fault the task terminated with, if any.
    pub fn fault(&self) -> Option<Fault> {
        self.fault
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}

fn store_fault(slot: &Mutex<Option<Fault>>, fault: Fault) {
    let mut slot = slot.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
    slot.get_or_insert(fault);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_stop_ends_cooperative_loop() {
        let task = SupervisedTask::start("loop", |shutdown| async move {
            loop {
                tokio::select! {
                    _ = shutdown.triggered() => return Ok(()),
                    _ = tokio::time::sleep(Duration::from_millis(5)) => {}
                }
            }
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!task.is_finished());

        task.stop();
        task.stop();
        let result = tokio::time::timeout(Duration::from_secs(1), task.join())
            .await
            .expect("task should exit within one poll interval");
        assert!(result.is_ok());
        assert!(task.is_finished());
        assert!(task.fault().is_none());
    }

    #[tokio::test]
    async fn test_fault_is_stored_and_repeatable() {
        let task = SupervisedTask::start("faulty", |_shutdown| async move {
            Err(Fault::transport("connection lost"))
        });

        assert_eq!(task.join().await, Err(Fault::transport("connection lost")));
        assert_eq!(task.join().await, Err(Fault::transport("connection lost")));
        assert_eq!(task.fault(), Some(Fault::transport("connection lost")));
    }

    #[tokio::test]
    async fn test_fault_stops_group_siblings() {
        let group = Shutdown::new();

        let sibling = SupervisedTask::start_with("sibling", group.clone(), |shutdown| async move {
            shutdown.triggered().await;
            Ok(())
        });
        let faulty = SupervisedTask::start_with("faulty", group.clone(), |_shutdown| async move {
            Err(Fault::protocol("bad frame"))
        });

        assert!(faulty.join().await.is_err());
        tokio::time::timeout(Duration::from_secs(1), sibling.join())
            .await
            .expect("sibling should observe the group shutdown")
            .unwrap();
        assert!(group.is_triggered());
    }

    #[tokio::test]
    async fn test_panic_is_reported_as_fault() {
        let task = SupervisedTask::start("panicky", |_shutdown| async move {
            if true {
                panic!("boom");
            }
            Ok(())
        });

        assert_eq!(task.join().await, Err(Fault::Panicked("panicky".into())));
    }
}
