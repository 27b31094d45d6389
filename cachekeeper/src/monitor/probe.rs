//! Read-only busy probes between background services.
//!
//! A probe reports a momentary snapshot. Callers never hold a probe's state
//! across their own work, so a job starting right after a check is missed
//! until the next check.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::operation::{OperationKind, OperationRegistry};

/// Something that can report whether a sibling service is busy.
pub trait BusyProbe: Send + Sync {
    /// Name used in logs.
    fn name(&self) -> &str;

    /// What the service is busy with, or `None` when idle.
    fn busy_with(&self) -> Option<String>;

    fn is_busy(&self) -> bool {
        self.busy_with().is_some()
    }
}

/// A named busy marker a service holds while it works.
#[derive(Debug, Clone)]
pub struct BusyFlag {
    name: Arc<str>,
    state: Arc<Mutex<Option<String>>>,
}

impl BusyFlag {
    pub fn new(name: impl Into<Arc<str>>) -> Self {
        Self {
            name: name.into(),
            state: Arc::new(Mutex::new(None)),
        }
    }

    /// Mark busy until the guard is dropped. `None` if already busy.
    pub fn try_acquire(&self, what: impl Into<String>) -> Option<BusyGuard> {
        let mut state = self.state.lock();
        if state.is_some() {
            return None;
        }
        *state = Some(what.into());
        Some(BusyGuard { flag: self.clone() })
    }
}

impl BusyProbe for BusyFlag {
    fn name(&self) -> &str {
        &self.name
    }

    fn busy_with(&self) -> Option<String> {
        self.state.lock().clone()
    }
}

/// Clears its [`BusyFlag`] on drop.
#[derive(Debug)]
pub struct BusyGuard {
    flag: BusyFlag,
}

impl Drop for BusyGuard {
    fn drop(&mut self) {
        *self.flag.state.lock() = None;
    }
}

/// Busy while a user-started operation of `kind` is active.
///
/// Silent operations are ignored, so the live monitor does not block on its
/// own passes.
pub struct ActiveOperationProbe {
    name: String,
    kind: OperationKind,
    registry: Arc<OperationRegistry>,
}

impl ActiveOperationProbe {
    pub fn new(name: impl Into<String>, kind: OperationKind, registry: Arc<OperationRegistry>) -> Self {
        Self {
            name: name.into(),
            kind,
            registry,
        }
    }
}

impl BusyProbe for ActiveOperationProbe {
    fn name(&self) -> &str {
        &self.name
    }

    fn busy_with(&self) -> Option<String> {
        self.registry
            .active_of_kind(self.kind, false)
            .first()
            .map(|op| format!("{} operation {}", op.kind, op.id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_busy_flag_guard() {
        let flag = BusyFlag::new("log-removal");
        assert!(!flag.is_busy());

        let guard = flag.try_acquire("removing steam entries").unwrap();
        assert_eq!(flag.busy_with().as_deref(), Some("removing steam entries"));
        assert!(flag.try_acquire("again").is_none());

        let observer = flag.clone();
        drop(guard);
        assert!(!observer.is_busy());
        assert_eq!(observer.name(), "log-removal");
    }

    #[test]
    fn test_active_operation_probe() {
        let registry = Arc::new(OperationRegistry::new());
        let probe = ActiveOperationProbe::new("manual-ingest", OperationKind::LogIngest, registry.clone());
        assert!(!probe.is_busy());

        let silent = registry.create(OperationKind::LogIngest, true);
        assert!(!probe.is_busy());

        let manual = registry.create(OperationKind::LogIngest, false);
        assert!(probe.busy_with().unwrap().contains(manual.id()));

        registry.remove(manual.id());
        registry.remove(silent.id());
        assert!(!probe.is_busy());
    }
}
