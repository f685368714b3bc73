//! Lazily launched shared worker.
//!
//! Holds at most one supervisor. Callers that want a single long-lived
//! worker go through `init`; whoever owns the registry decides when to
//! `shutdown` it, and whether a later `init` should start a replacement.
//!
//! The lock is never held across a launch, so `shutdown` can cancel a
//! worker that is still handshaking.

use std::sync::Arc;

use tokio::sync::Mutex;

use crate::config::SupervisorConfig;
use crate::responder::DataHandler;
use crate::supervisor::{ProcessState, Supervisor, SupervisorError};

enum Slot {
    Empty,
    Launching(Arc<Supervisor>),
    Ready(Arc<Supervisor>),
}

impl Slot {
    fn holds(&self, supervisor: &Arc<Supervisor>) -> bool {
        match self {
            Slot::Launching(current) | Slot::Ready(current) => Arc::ptr_eq(current, supervisor),
            Slot::Empty => false,
        }
    }
}

pub struct WorkerRegistry {
    config: SupervisorConfig,
    data_handler: Arc<dyn DataHandler>,
    slot: Mutex<Slot>,
}

impl WorkerRegistry {
    pub fn new(config: SupervisorConfig, data_handler: Arc<dyn DataHandler>) -> Self {
        Self {
            config,
            data_handler,
            slot: Mutex::new(Slot::Empty),
        }
    }

    /// Return the running supervisor, launching one first if needed.
    ///
    /// Concurrent callers share one launch. A failed launch leaves the
    /// registry empty; a launch cancelled by `shutdown` returns `ShutDown`.
    pub async fn init(&self) -> Result<Arc<Supervisor>, SupervisorError> {
        let supervisor = {
            let mut slot = self.slot.lock().await;
            match &*slot {
                Slot::Ready(supervisor) => return Ok(Arc::clone(supervisor)),
                Slot::Launching(supervisor) => Arc::clone(supervisor),
                Slot::Empty => {
                    let supervisor =
                        Supervisor::new(self.config.clone(), Arc::clone(&self.data_handler));
                    *slot = Slot::Launching(Arc::clone(&supervisor));
                    supervisor
                }
            }
        };

        let launched = supervisor.launch().await;

        let mut slot = self.slot.lock().await;
        if !slot.holds(&supervisor) {
            // shutdown() took it while the handshake ran.
            return Err(launched.err().unwrap_or(SupervisorError::ShutDown));
        }
        match launched {
            Ok(()) => {
                *slot = Slot::Ready(Arc::clone(&supervisor));
                Ok(supervisor)
            }
            Err(e) => {
                *slot = Slot::Empty;
                Err(e)
            }
        }
    }

    /// The connected supervisor, if `init` has completed.
    pub async fn get(&self) -> Option<Arc<Supervisor>> {
        match &*self.slot.lock().await {
            Slot::Ready(supervisor) => Some(Arc::clone(supervisor)),
            Slot::Launching(_) | Slot::Empty => None,
        }
    }

    /// Shut down and join the current worker, including one still launching.
    pub async fn shutdown(&self) -> Option<ProcessState> {
        let taken = std::mem::replace(&mut *self.slot.lock().await, Slot::Empty);
        let supervisor = match taken {
            Slot::Launching(supervisor) | Slot::Ready(supervisor) => supervisor,
            Slot::Empty => return None,
        };
        supervisor.shutdown().await;
        Some(supervisor.join(None).await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::responder::EchoDataHandler;
    use std::time::Duration;

    #[tokio::test]
    async fn failed_init_leaves_registry_empty() {
        let registry = WorkerRegistry::new(
            SupervisorConfig::new("/nonexistent/offload-worker"),
            Arc::new(EchoDataHandler),
        );
        assert!(registry.init().await.is_err());
        assert!(registry.get().await.is_none());
        assert!(registry.shutdown().await.is_none());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn shutdown_cancels_a_pending_init() {
        use crate::handshake::CommandSpawner;

        let config = SupervisorConfig::new("/bin/sh").with_spawner(Arc::new(
            CommandSpawner::new("/bin/sh").with_args(["-c", "cat >/dev/null; sleep 30"]),
        ));
        let registry = Arc::new(WorkerRegistry::new(config, Arc::new(EchoDataHandler)));

        let init = {
            let registry = Arc::clone(&registry);
            tokio::spawn(async move { registry.init().await })
        };
        tokio::time::sleep(Duration::from_millis(300)).await;

        let pending = tokio::time::timeout(Duration::from_secs(2), registry.get())
            .await
            .expect("get must not wait for the launch");
        assert!(pending.is_none());

        tokio::time::timeout(Duration::from_secs(5), registry.shutdown())
            .await
            .expect("shutdown must not wait for the launch")
            .expect("a launching worker is shut down");

        let result = tokio::time::timeout(Duration::from_secs(5), init)
            .await
            .expect("init returns once cancelled")
            .unwrap();
        assert!(matches!(result, Err(SupervisorError::ShutDown)));
        assert!(registry.get().await.is_none());
    }
}
