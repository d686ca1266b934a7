use std::{
    sync::atomic::{AtomicU64, Ordering},
    time::Duration,
};

use tracing::{debug, Span};

use crate::config::duration_ms;

/// Timestamp of the most recent motion edge, shared between the edge
/// callback (single writer) and the control loop.
#[derive(Debug)]
pub struct MotionTracker {
    last_activity_ms: AtomicU64,
    edges: AtomicU64,
    recent_window_ms: u64,
    span: Span,
}

impl MotionTracker {
    pub fn new(recent_window: Duration) -> Self {
        Self {
            last_activity_ms: AtomicU64::new(0),
            edges: AtomicU64::new(0),
            recent_window_ms: duration_ms(recent_window),
            span: tracing::info_span!("motion"),
        }
    }

    /// Seeds the activity timestamp so startup does not look infinitely idle.
    pub fn initialize(&self, now_ms: u64) {
        self.last_activity_ms.fetch_max(now_ms, Ordering::Release);
    }

    /// Called for every edge, rising or falling. No debouncing.
    pub fn on_edge(&self, now_ms: u64) {
        self.last_activity_ms.fetch_max(now_ms, Ordering::Release);
        let edges = self.edges.fetch_add(1, Ordering::Relaxed) + 1;
        let _entered = self.span.enter();
        debug!(edges, "activity detected");
    }

    pub fn last_activity_ms(&self) -> u64 {
        self.last_activity_ms.load(Ordering::Acquire)
    }

    pub fn idle_ms(&self, now_ms: u64) -> u64 {
        now_ms.saturating_sub(self.last_activity_ms())
    }

    pub fn recent_activity(&self, now_ms: u64) -> bool {
        self.idle_ms(now_ms) < self.recent_window_ms
    }

    pub fn recent_window_ms(&self) -> u64 {
        self.recent_window_ms
    }

    pub fn edge_count(&self) -> u64 {
        self.edges.load(Ordering::Relaxed)
    }
}
