//! [`SourceRegistry`] – owns every hardware source and polls them.
//!
//! Each source sits behind its own lock. A tick polls all sources
//! concurrently on the blocking pool, and every poll is bounded by the
//! registry's poll timeout. A source that fails, panics or overruns yields
//! [`Reading::Degraded`] for that tick; it never stalls the others.
//!
//! # Concurrency
//!
//! A poll that overran its timeout keeps running in the background and keeps
//! holding its lock. Until it finishes, later polls of that source report
//! `Degraded` immediately instead of queuing behind it, and commands routed
//! to it fail with [`EvError::HardwareFault`].

use std::sync::{Arc, Mutex, TryLockError};
use std::time::Duration;

use evdash_types::{Command, EvError, Reading, SourceKind};
use futures_util::future::join_all;
use tracing::{debug, warn};

use crate::source::{Ack, HardwareSource};

/// Default upper bound for one poll of one source.
pub const DEFAULT_POLL_TIMEOUT: Duration = Duration::from_millis(500);

/// One source's contribution to a tick.
#[derive(Debug, Clone, PartialEq)]
pub struct PolledReading {
    pub id: String,
    pub kind: SourceKind,
    pub reading: Reading,
}

struct SourceSlot {
    id: String,
    kind: SourceKind,
    synthetic: bool,
    source: Arc<Mutex<Box<dyn HardwareSource>>>,
}

/// Registry of hardware sources, at most one per [`SourceKind`].
pub struct SourceRegistry {
    slots: Vec<SourceSlot>,
    poll_timeout: Duration,
}

impl Default for SourceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl SourceRegistry {
    pub fn new() -> Self {
        Self::with_poll_timeout(DEFAULT_POLL_TIMEOUT)
    }

    pub fn with_poll_timeout(poll_timeout: Duration) -> Self {
        Self {
            slots: Vec::new(),
            poll_timeout,
        }
    }

    /// Register a source.  A source already registered for the same kind is
    /// replaced.
    pub fn register(&mut self, source: Box<dyn HardwareSource>) {
        let slot = SourceSlot {
            id: source.id().to_string(),
            kind: source.kind(),
            synthetic: source.is_synthetic(),
            source: Arc::new(Mutex::new(source)),
        };
        debug!(source = %slot.id, kind = %slot.kind, synthetic = slot.synthetic, "source registered");
        match self.slots.iter_mut().find(|s| s.kind == slot.kind) {
            Some(existing) => *existing = slot,
            None => self.slots.push(slot),
        }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn contains(&self, kind: SourceKind) -> bool {
        self.slots.iter().any(|s| s.kind == kind)
    }

    /// `(id, kind, synthetic)` for every registered source.
    pub fn describe(&self) -> Vec<(String, SourceKind, bool)> {
        self.slots
            .iter()
            .map(|s| (s.id.clone(), s.kind, s.synthetic))
            .collect()
    }

    pub fn poll_timeout(&self) -> Duration {
        self.poll_timeout
    }

    /// Poll every source concurrently.
    ///
    /// Always returns exactly one [`PolledReading`] per registered source, in
    /// registration order.
    pub async fn poll_all(&self) -> Vec<PolledReading> {
        join_all(self.slots.iter().map(|slot| self.poll_slot(slot))).await
    }

    async fn poll_slot(&self, slot: &SourceSlot) -> PolledReading {
        let source = Arc::clone(&slot.source);
        let task = tokio::task::spawn_blocking(move || match source.try_lock() {
            Ok(mut guard) => guard.poll(),
            Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner().poll(),
            Err(TryLockError::WouldBlock) => Reading::Degraded {
                reason: "previous poll still running".to_string(),
            },
        });

        let reading = match tokio::time::timeout(self.poll_timeout, task).await {
            Ok(Ok(reading)) => reading,
            Ok(Err(join_err)) => {
                warn!(source = %slot.id, error = %join_err, "source poll panicked");
                Reading::Degraded {
                    reason: format!("poll panicked: {join_err}"),
                }
            }
            Err(_) => {
                warn!(source = %slot.id, timeout_ms = self.poll_timeout.as_millis() as u64, "source poll timed out");
                Reading::Degraded {
                    reason: format!("poll exceeded {} ms", self.poll_timeout.as_millis()),
                }
            }
        };

        PolledReading {
            id: slot.id.clone(),
            kind: slot.kind,
            reading,
        }
    }

    /// Route a side-effecting command to the source of the given kind.
    ///
    /// Runs under the same per-source lock and poll timeout as [`poll_all`].
    /// Never waits on a busy source: if its lock is held by an overrunning
    /// poll the command fails right away, so a command reported as busy is
    /// never applied later. A write that overruns the timeout keeps running
    /// on the blocking pool and its outcome is unknown.
    ///
    /// # Errors
    ///
    /// - [`EvError::HardwareFault`] when no source of that kind is registered,
    ///   the source is busy, the write timed out or panicked, or the device
    ///   refused the write.
    /// - [`EvError::Rejected`] when the source does not own the command.
    ///
    /// [`poll_all`]: Self::poll_all
    pub async fn apply(&self, kind: SourceKind, command: &Command) -> Result<Ack, EvError> {
        let Some(slot) = self.slots.iter().find(|s| s.kind == kind) else {
            return Err(EvError::HardwareFault {
                component: kind.to_string(),
                details: format!("no {kind} source registered"),
            });
        };

        let source = Arc::clone(&slot.source);
        let command = command.clone();
        let component = slot.id.clone();
        let task = tokio::task::spawn_blocking(move || match source.try_lock() {
            Ok(mut guard) => guard.apply(&command),
            Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner().apply(&command),
            Err(TryLockError::WouldBlock) => Err(EvError::HardwareFault {
                component,
                details: "source busy".to_string(),
            }),
        });

        match tokio::time::timeout(self.poll_timeout, task).await {
            Ok(Ok(result)) => result,
            Ok(Err(join_err)) => {
                warn!(source = %slot.id, error = %join_err, "source write panicked");
                Err(EvError::HardwareFault {
                    component: slot.id.clone(),
                    details: format!("write panicked: {join_err}"),
                })
            }
            Err(_) => {
                warn!(source = %slot.id, timeout_ms = self.poll_timeout.as_millis() as u64, "source write timed out");
                Err(EvError::HardwareFault {
                    component: slot.id.clone(),
                    details: format!("apply exceeded {} ms", self.poll_timeout.as_millis()),
                })
            }
        }
    }
}
