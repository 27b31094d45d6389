//! Process-wide pause flag for the live monitor.

use tokio::sync::Mutex;
use tracing::info;

/// Raised by jobs that need the monitored log file to themselves.
///
/// Shared as `Arc<PauseGate>`; the monitor checks it at the start of every
/// tick and does nothing while it is raised.
#[derive(Debug, Default)]
pub struct PauseGate {
    paused: Mutex<bool>,
}

impl PauseGate {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn pause(&self) {
        let mut paused = self.paused.lock().await;
        if !*paused {
            info!("Live log monitor paused");
        }
        *paused = true;
    }

    pub async fn resume(&self) {
        let mut paused = self.paused.lock().await;
        if *paused {
            info!("Live log monitor resumed");
        }
        *paused = false;
    }

    pub async fn is_paused(&self) -> bool {
        *self.paused.lock().await
    }

    /// Run `f` with the gate raised, lowering it afterwards.
    pub async fn while_paused<F, Fut, T>(&self, f: F) -> T
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        self.pause().await;
        let result = f().await;
        self.resume().await;
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_pause_resume() {
        let gate = PauseGate::new();
        assert!(!gate.is_paused().await);
        gate.pause().await;
        gate.pause().await;
        assert!(gate.is_paused().await);
        gate.resume().await;
        assert!(!gate.is_paused().await);
    }

    #[tokio::test]
    async fn test_while_paused() {
        let gate = PauseGate::new();
        let seen = gate.while_paused(|| async { gate.is_paused().await }).await;
        assert!(seen);
        assert!(!gate.is_paused().await);
    }
}
