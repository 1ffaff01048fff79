//! Progress notifications for multi-step operations
//!
//! Each tracker moves from active to completed (explicit [`ProgressTracker::complete`])
//! or is reaped by the stale sweep when its caller goes quiet. Percentages are
//! capped at 99 until completion so a client never sees 100 early.
//!
//! Events for one token are published while that tracker's map entry is held,
//! so they reach the session's sink in the order the calls were made.

pub mod hub;

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use dashmap::DashMap;
use serde::Serialize;
use serde_json::{json, Value};
use thiserror::Error;
use tokio::{task::JoinHandle, time::Instant, time::MissedTickBehavior};
use tracing::{debug, info};

pub use hub::{NotificationHub, SinkGuard};

use crate::mcp::rpc::JSONRPC_VERSION;

pub const PROGRESS_METHOD: &str = "notifications/progress";
pub const PROGRESS_TOTAL: u8 = 100;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct ProgressToken(String);

impl fmt::Display for ProgressToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProgressError {
    #[error("total steps must be greater than zero")]
    ZeroSteps,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressUpdate {
    pub progress_token: ProgressToken,
    pub progress: u8,
    pub total: u8,
}

impl ProgressUpdate {
    pub fn to_notification(&self) -> Value {
        json!({
            "jsonrpc": JSONRPC_VERSION,
            "method": PROGRESS_METHOD,
            "params": self,
        })
    }
}

#[derive(Debug)]
struct ProgressState {
    session_id: String,
    total_steps: u32,
    current_step: u32,
    last_activity: Instant,
}

/// `min(99, round(current / total * 100))`
pub fn step_percent(current_step: u32, total_steps: u32) -> u8 {
    if total_steps == 0 {
        return 0;
    }
    let percent = (f64::from(current_step) / f64::from(total_steps) * 100.0).round();
    percent.clamp(0.0, 99.0) as u8
}

#[derive(Debug)]
pub struct ProgressTracker {
    active: DashMap<ProgressToken, ProgressState>,
    hub: Arc<NotificationHub>,
    sequence: AtomicU64,
    stale_after: Duration,
}

impl ProgressTracker {
    pub fn new(hub: Arc<NotificationHub>, stale_after: Duration) -> Self {
        Self {
            active: DashMap::new(),
            hub,
            sequence: AtomicU64::new(0),
            stale_after,
        }
    }

    pub fn hub(&self) -> &Arc<NotificationHub> {
        &self.hub
    }

    /// Begins tracking an operation for `session_id` and emits 0%.
    pub fn start(
        &self,
        session_id: &str,
        name: &str,
        total_steps: u32,
    ) -> Result<ProgressToken, ProgressError> {
        if total_steps == 0 {
            return Err(ProgressError::ZeroSteps);
        }

        let sequence = self.sequence.fetch_add(1, Ordering::Relaxed);
        let token = ProgressToken(format!(
            "{name}-{session_id}-{}-{sequence}",
            chrono::Utc::now().timestamp_millis()
        ));

        self.active.insert(
            token.clone(),
            ProgressState {
                session_id: session_id.to_string(),
                total_steps,
                current_step: 0,
                last_activity: Instant::now(),
            },
        );
        debug!(progress_token = %token, session_id, total_steps, "progress started");
        self.emit(session_id, &token, 0);

        Ok(token)
    }

    /// Advances one step. Returns `false` for unknown or finished tokens.
    pub fn step(&self, token: &ProgressToken) -> bool {
        let Some(mut state) = self.active.get_mut(token) else {
            return false;
        };

        state.current_step = state.current_step.saturating_add(1);
        state.last_activity = Instant::now();
        let percent = step_percent(state.current_step, state.total_steps);
        self.emit(&state.session_id, token, percent);
        true
    }

    /// Emits 100% and stops tracking. Returns `false` for unknown or finished tokens.
    pub fn complete(&self, token: &ProgressToken) -> bool {
        let Some((_, state)) = self.active.remove(token) else {
            return false;
        };

        self.emit(&state.session_id, token, PROGRESS_TOTAL);
        debug!(progress_token = %token, steps = state.current_step, "progress completed");
        true
    }

    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    /// Drops trackers idle for longer than the stale threshold.
    pub fn sweep_stale(&self) -> usize {
        let mut removed = 0;
        self.active.retain(|_, state| {
            let keep = state.last_activity.elapsed() <= self.stale_after;
            if !keep {
                removed += 1;
            }
            keep
        });
        removed
    }

    pub fn spawn_sweeper(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let tracker: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;

            loop {
                ticker.tick().await;
                let Some(tracker) = tracker.upgrade() else {
                    break;
                };

                let removed = tracker.sweep_stale();
                if removed > 0 {
                    info!(removed, active = tracker.active_count(), "stale progress trackers removed");
                }
            }
        })
    }

    fn emit(&self, session_id: &str, token: &ProgressToken, progress: u8) {
        let update = ProgressUpdate {
            progress_token: token.clone(),
            progress,
            total: PROGRESS_TOTAL,
        };
        self.hub.publish(session_id, update.to_notification());
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use tokio::sync::mpsc::UnboundedReceiver;

    use super::*;

    fn tracker() -> ProgressTracker {
        ProgressTracker::new(Arc::new(NotificationHub::new()), Duration::from_secs(60))
    }

    fn drain(receiver: &mut UnboundedReceiver<Value>) -> Vec<u64> {
        let mut seen = Vec::new();
        while let Ok(message) = receiver.try_recv() {
            assert_eq!(message["method"], PROGRESS_METHOD);
            assert_eq!(message["params"]["total"], 100);
            seen.push(message["params"]["progress"].as_u64().expect("numeric progress"));
        }
        seen
    }

    #[test]
    fn four_steps_cap_at_ninety_nine_then_complete_reaches_hundred() {
        let tracker = tracker();
        let (_guard, mut receiver) = tracker.hub().register("s1");

        let token = tracker.start("s1", "export", 4).expect("start");
        for _ in 0..4 {
            assert!(tracker.step(&token));
        }
        assert!(tracker.complete(&token));

        assert_eq!(drain(&mut receiver), vec![0, 25, 50, 75, 99, 100]);
        assert_eq!(tracker.active_count(), 0);
    }

    #[test]
    fn percent_rounds_and_caps() {
        assert_eq!(step_percent(1, 3), 33);
        assert_eq!(step_percent(2, 3), 67);
        assert_eq!(step_percent(3, 3), 99);
        assert_eq!(step_percent(9, 3), 99);
        assert_eq!(step_percent(0, 5), 0);
    }

    #[test]
    fn complete_without_steps_emits_hundred_once() {
        let tracker = tracker();
        let (_guard, mut receiver) = tracker.hub().register("s1");

        let token = tracker.start("s1", "quick", 10).expect("start");
        assert!(tracker.complete(&token));
        assert!(!tracker.complete(&token));
        assert!(!tracker.step(&token));

        assert_eq!(drain(&mut receiver), vec![0, 100]);
    }

    #[test]
    fn zero_total_steps_is_rejected() {
        assert_eq!(
            tracker().start("s1", "bad", 0),
            Err(ProgressError::ZeroSteps)
        );
    }

    #[test]
    fn events_without_connection_are_dropped() {
        let tracker = tracker();
        let token = tracker.start("offline", "job", 2).expect("start");
        assert!(tracker.step(&token));
        assert!(tracker.complete(&token));
    }

    #[test]
    fn tokens_are_unique_for_identical_starts() {
        let tracker = tracker();
        let tokens: HashSet<_> = (0..100)
            .map(|_| tracker.start("s1", "same", 1).expect("start"))
            .collect();
        assert_eq!(tokens.len(), 100);
    }

    #[test]
    fn sessions_only_receive_their_own_events() {
        let tracker = tracker();
        let (_guard_a, mut receiver_a) = tracker.hub().register("a");
        let (_guard_b, mut receiver_b) = tracker.hub().register("b");

        let token = tracker.start("a", "job", 2).expect("start");
        tracker.step(&token);

        assert_eq!(drain(&mut receiver_a), vec![0, 50]);
        assert!(drain(&mut receiver_b).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn stale_trackers_are_swept() {
        let tracker = Arc::new(ProgressTracker::new(
            Arc::new(NotificationHub::new()),
            Duration::from_secs(30),
        ));
        let idle = tracker.start("s1", "idle", 5).expect("start");
        let busy = tracker.start("s1", "busy", 5).expect("start");

        tokio::time::advance(Duration::from_secs(20)).await;
        tracker.step(&busy);
        tokio::time::advance(Duration::from_secs(15)).await;

        assert_eq!(tracker.sweep_stale(), 1);
        assert!(!tracker.step(&idle));
        assert!(tracker.step(&busy));
    }

    #[tokio::test(start_paused = true)]
    async fn sweeper_task_reaps_in_background() {
        let tracker = Arc::new(ProgressTracker::new(
            Arc::new(NotificationHub::new()),
            Duration::from_secs(5),
        ));
        tracker.start("s1", "abandoned", 3).expect("start");
        let sweeper = tracker.spawn_sweeper(Duration::from_secs(2));

        tokio::time::sleep(Duration::from_secs(9)).await;

        assert_eq!(tracker.active_count(), 0);
        sweeper.abort();
    }
}
