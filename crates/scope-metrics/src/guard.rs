//! Cardinality guard for the per-expert debug metric
//!
//! The per-expert load gauge multiplies label cardinality by layers times
//! experts, which is too much to export unconditionally. The guard holds a
//! bounded activation window: while it is open the aggregator may publish
//! per-expert series, and once it lapses every per-expert instance is removed
//! from the registry so scrapes stop carrying them.

use crate::registry::{MetricHandle, MetricRegistry};
use crate::Result;
use parking_lot::RwLock;
use std::time::{Duration, Instant};
use tracing::info;

/// One bounded activation of the per-expert debug export
#[derive(Debug, Clone, Copy)]
pub struct DebugWindow {
    activated_at: Instant,
    duration: Duration,
}

impl DebugWindow {
    /// Open a window starting now
    pub fn new(duration: Duration) -> Self {
        Self::starting_at(Instant::now(), duration)
    }

    /// Open a window with an explicit start, for callers that carry their
    /// own clock reading
    pub fn starting_at(activated_at: Instant, duration: Duration) -> Self {
        Self {
            activated_at,
            duration,
        }
    }

    /// Whether the window is still open at `now`. The boundary instant
    /// itself counts as expired.
    pub fn is_active_at(&self, now: Instant) -> bool {
        now < self.expires_at()
    }

    /// Instant at which the window lapses
    pub fn expires_at(&self) -> Instant {
        self.activated_at + self.duration
    }
}

/// Guards the per-expert load gauge behind a time-bounded window
#[derive(Debug)]
pub struct CardinalityGuard {
    registry: MetricRegistry,
    per_expert: MetricHandle,
    default_window: Duration,
    window: RwLock<Option<DebugWindow>>,
}

impl CardinalityGuard {
    /// Create a guard over `per_expert` with no window open
    pub fn new(registry: MetricRegistry, per_expert: MetricHandle, default_window: Duration) -> Self {
        Self {
            registry,
            per_expert,
            default_window,
            window: RwLock::new(None),
        }
    }

    /// Open a window for `duration`, replacing any window already open
    pub fn activate(&self, duration: Duration) {
        self.activate_window(DebugWindow::new(duration));
    }

    /// Open a window for the configured default duration
    pub fn activate_default(&self) {
        self.activate(self.default_window);
    }

    fn activate_window(&self, window: DebugWindow) {
        info!(
            window_seconds = window.duration.as_secs(),
            metric = self.per_expert.name(),
            "Activated per-expert debug export window"
        );
        *self.window.write() = Some(window);
    }

    /// Whether a window is open right now
    pub fn is_active(&self) -> bool {
        self.is_active_at(Instant::now())
    }

    /// Whether a window is open at the supplied clock reading
    pub fn is_active_at(&self, now: Instant) -> bool {
        self.window
            .read()
            .map(|w| w.is_active_at(now))
            .unwrap_or(false)
    }

    /// Run `publish` only while a window is open. Returns whether it ran.
    ///
    /// The window lock is held across the closure, so an expiry sweep on
    /// another thread cannot remove instances between the check and the
    /// writes; removal waits until the publication has landed.
    pub fn publish_if_active<F>(&self, publish: F) -> Result<bool>
    where
        F: FnOnce() -> Result<()>,
    {
        self.publish_if_active_at(Instant::now(), publish)
    }

    /// Gate `publish` against the supplied clock reading
    pub fn publish_if_active_at<F>(&self, now: Instant, publish: F) -> Result<bool>
    where
        F: FnOnce() -> Result<()>,
    {
        let window = self.window.read();
        if !matches!(*window, Some(w) if w.is_active_at(now)) {
            return Ok(false);
        }
        publish()?;
        Ok(true)
    }

    /// Expiry check against the current clock; see [`Self::sweep_at`]
    pub fn sweep(&self) -> bool {
        self.sweep_at(Instant::now())
    }

    /// If the open window has lapsed at `now`, drop every per-expert
    /// instance from the registry and close the window. Returns whether an
    /// expiry was processed. The window never reopens on its own.
    pub fn sweep_at(&self, now: Instant) -> bool {
        let expired = {
            let window = self.window.read();
            matches!(*window, Some(w) if !w.is_active_at(now))
        };
        if !expired {
            return false;
        }

        let mut window = self.window.write();
        // Re-check under the write lock; another sweeper may have won.
        match *window {
            Some(w) if !w.is_active_at(now) => {
                *window = None;
                drop(window);
                self.registry.remove_instances(&self.per_expert);
                info!(
                    metric = self.per_expert.name(),
                    "Per-expert debug export window expired, removed per-expert series"
                );
                true
            }
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{MetricDefinition, MetricOp};

    fn guard_with_registry() -> (CardinalityGuard, MetricRegistry, MetricHandle) {
        let registry = MetricRegistry::new();
        let handle = registry
            .register(MetricDefinition::gauge(
                "expert_load_per_expert_tokens_DEBUG",
                "Per-expert token load",
                &["model", "engine", "layer", "expert_id"],
            ))
            .unwrap();
        let guard = CardinalityGuard::new(
            registry.clone(),
            handle.clone(),
            Duration::from_secs(300),
        );
        (guard, registry, handle)
    }

    #[test]
    fn test_window_boundary_counts_as_expired() {
        let start = Instant::now();
        let window = DebugWindow::starting_at(start, Duration::from_secs(300));

        assert!(window.is_active_at(start));
        assert!(window.is_active_at(start + Duration::from_secs(299)));
        assert!(!window.is_active_at(start + Duration::from_secs(300)));
        assert!(!window.is_active_at(start + Duration::from_secs(301)));
    }

    #[test]
    fn test_guard_starts_closed() {
        let (guard, _registry, _handle) = guard_with_registry();
        assert!(!guard.is_active());
        assert!(!guard.sweep());
    }

    #[test]
    fn test_activate_and_expire() {
        let (guard, registry, handle) = guard_with_registry();
        let start = Instant::now();
        guard.activate_window(DebugWindow::starting_at(start, Duration::from_secs(10)));

        assert!(guard.is_active_at(start + Duration::from_secs(5)));
        registry
            .record(&handle, &["m", "0", "3", "17"], MetricOp::Set(42.0))
            .unwrap();

        // Before expiry the sweep is a no-op and the series survives.
        assert!(!guard.sweep_at(start + Duration::from_secs(5)));
        assert_eq!(
            registry
                .snapshot()
                .metric("expert_load_per_expert_tokens_DEBUG")
                .unwrap()
                .instances
                .len(),
            1
        );

        // At expiry the series is dropped and the window closes.
        assert!(guard.sweep_at(start + Duration::from_secs(10)));
        assert!(!guard.is_active_at(start + Duration::from_secs(10)));
        assert!(registry
            .snapshot()
            .metric("expert_load_per_expert_tokens_DEBUG")
            .unwrap()
            .is_empty());

        // A second sweep finds nothing to do.
        assert!(!guard.sweep_at(start + Duration::from_secs(11)));
    }

    #[test]
    fn test_publication_cannot_outlive_the_window() {
        let (guard, registry, handle) = guard_with_registry();
        let start = Instant::now();
        guard.activate_window(DebugWindow::starting_at(start, Duration::from_secs(10)));

        // While the window is open the gate admits the write.
        let published = guard
            .publish_if_active_at(start + Duration::from_secs(5), || {
                registry.record(&handle, &["m", "0", "3", "17"], MetricOp::Set(900.0))
            })
            .unwrap();
        assert!(published);

        // Expiry removes everything the window admitted.
        assert!(guard.sweep_at(start + Duration::from_secs(11)));
        assert!(registry
            .snapshot()
            .metric("expert_load_per_expert_tokens_DEBUG")
            .unwrap()
            .is_empty());

        // With the window gone the gate refuses the write outright, so a
        // late writer cannot resurrect series behind the sweeps.
        let published = guard
            .publish_if_active_at(start + Duration::from_secs(12), || {
                registry.record(&handle, &["m", "0", "3", "17"], MetricOp::Set(900.0))
            })
            .unwrap();
        assert!(!published);
        assert!(!guard.sweep_at(start + Duration::from_secs(600)));
        assert!(registry
            .snapshot()
            .metric("expert_load_per_expert_tokens_DEBUG")
            .unwrap()
            .is_empty());
    }

    #[test]
    fn test_reactivation_requires_explicit_call() {
        let (guard, _registry, _handle) = guard_with_registry();
        let start = Instant::now();
        guard.activate_window(DebugWindow::starting_at(start, Duration::from_secs(1)));
        guard.sweep_at(start + Duration::from_secs(2));
        assert!(!guard.is_active_at(start + Duration::from_secs(3)));

        guard.activate_window(DebugWindow::starting_at(
            start + Duration::from_secs(4),
            Duration::from_secs(1),
        ));
        assert!(guard.is_active_at(start + Duration::from_secs(4)));
    }

    #[test]
    fn test_activate_replaces_open_window() {
        let (guard, _registry, _handle) = guard_with_registry();
        let start = Instant::now();
        guard.activate_window(DebugWindow::starting_at(start, Duration::from_secs(1)));
        guard.activate_window(DebugWindow::starting_at(start, Duration::from_secs(60)));

        assert!(guard.is_active_at(start + Duration::from_secs(30)));
    }

    #[test]
    fn test_default_window_duration() {
        let (guard, _registry, _handle) = guard_with_registry();
        guard.activate_default();
        let window = guard.window.read().unwrap();
        assert_eq!(window.duration, Duration::from_secs(300));
    }
}
