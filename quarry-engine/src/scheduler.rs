//! Refetch scheduler
//!
//! Watches the client [`Environment`] and an optional interval timer, and
//! re-invalidates a query when a trigger fires and the query is eligible.
//!
//! Eligibility is a pure function of a snapshot ([`RefetchInputs`]) so the
//! rules can be tested without timers:
//!
//! | Reason      | Skipped when                                               |
//! |-------------|------------------------------------------------------------|
//! | all         | disabled, lazy and never fetched, or a fetch is in flight   |
//! | focus       | data is not stale                                          |
//! | reconnect   | data is not stale                                          |
//! | interval    | window unfocused and background refetch not allowed       |

use crate::environment::Environment;
use chrono::{DateTime, Utc};
use quarry_storage::is_stale;
use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, Interval, MissedTickBehavior};

/// Why a refetch is being considered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RefetchReason {
    Focus,
    Reconnect,
    Interval,
}

impl RefetchReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Focus => "focus",
            Self::Reconnect => "reconnect",
            Self::Interval => "interval",
        }
    }
}

impl fmt::Display for RefetchReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a trigger did not refetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    Disabled,
    LazyNeverFetched,
    Background,
    Loading,
    Fresh,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefetchDecision {
    Trigger,
    Skip(SkipReason),
}

/// Snapshot of everything the eligibility rules look at.
#[derive(Debug, Clone, PartialEq)]
pub struct RefetchInputs {
    pub reason: RefetchReason,
    /// Effective enablement, including the lazy trigger flag.
    pub enabled: bool,
    pub lazy: bool,
    pub has_fetched_once: bool,
    /// A fetch (or a pending retry) is in flight.
    pub is_loading: bool,
    pub last_updated: Option<DateTime<Utc>>,
    pub stale_time: Duration,
    pub now: DateTime<Utc>,
    pub has_focus: bool,
    pub refetch_in_background: bool,
}

/// Decide whether a trigger refetches.
pub fn evaluate_refetch(inputs: &RefetchInputs) -> RefetchDecision {
    if !inputs.enabled {
        return RefetchDecision::Skip(SkipReason::Disabled);
    }
    if inputs.lazy && !inputs.has_fetched_once {
        return RefetchDecision::Skip(SkipReason::LazyNeverFetched);
    }
    if inputs.reason == RefetchReason::Interval
        && !inputs.has_focus
        && !inputs.refetch_in_background
    {
        return RefetchDecision::Skip(SkipReason::Background);
    }
    if inputs.is_loading {
        return RefetchDecision::Skip(SkipReason::Loading);
    }
    if inputs.reason != RefetchReason::Interval
        && !is_stale(inputs.last_updated, inputs.stale_time, inputs.now)
    {
        return RefetchDecision::Skip(SkipReason::Fresh);
    }
    RefetchDecision::Trigger
}

/// A query the scheduler can refetch.
pub(crate) trait RefetchTarget: Send + Sync {
    fn query_key(&self) -> &str;

    fn debug_logging(&self) -> bool;

    fn refetch_inputs(&self, reason: RefetchReason) -> RefetchInputs;

    fn trigger_refetch(self: Arc<Self>, reason: RefetchReason);
}

/// Which triggers a scheduler listens to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct SchedulerSettings {
    pub on_focus: bool,
    pub on_reconnect: bool,
    pub interval: Option<Duration>,
}

/// Spawn the scheduler loop for `target` on the current runtime.
///
/// The loop ends when the target is dropped, every trigger source closes,
/// or the returned handle is aborted.
pub(crate) fn spawn_refetch_scheduler(
    target: Weak<dyn RefetchTarget>,
    env: &Environment,
    settings: SchedulerSettings,
) -> JoinHandle<()> {
    let focus_rx = settings.on_focus.then(|| env.focus_events());
    let online = env.online();
    tokio::spawn(refetch_scheduler_task(target, focus_rx, online, settings))
}

async fn refetch_scheduler_task(
    target: Weak<dyn RefetchTarget>,
    mut focus_rx: Option<broadcast::Receiver<crate::environment::FocusEvent>>,
    mut online: quarry_core::SignalReader<bool>,
    settings: SchedulerSettings,
) {
    let mut on_reconnect = settings.on_reconnect;
    let mut was_online = online.get();
    let mut ticker = settings.interval.map(|period| {
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        ticker
    });

    loop {
        let reason = tokio::select! {
            event = recv_focus(&mut focus_rx), if focus_rx.is_some() => match event {
                Ok(_) => RefetchReason::Focus,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::trace!(skipped, "Focus events lagged");
                    RefetchReason::Focus
                }
                Err(broadcast::error::RecvError::Closed) => {
                    focus_rx = None;
                    continue;
                }
            },
            changed = online.changed(), if on_reconnect => {
                if !changed {
                    on_reconnect = false;
                    continue;
                }
                let now_online = online.get();
                let reconnected = now_online && !was_online;
                was_online = now_online;
                if !reconnected {
                    continue;
                }
                RefetchReason::Reconnect
            }
            _ = tick(&mut ticker), if ticker.is_some() => RefetchReason::Interval,
            else => break,
        };

        let Some(target) = target.upgrade() else {
            break;
        };
        attempt_refetch(target, reason);
    }
}

fn attempt_refetch(target: Arc<dyn RefetchTarget>, reason: RefetchReason) {
    let inputs = target.refetch_inputs(reason);
    match evaluate_refetch(&inputs) {
        RefetchDecision::Trigger => {
            query_log!(
                target.debug_logging(),
                query_key = target.query_key(),
                reason = reason.as_str(),
                "Refetch triggered"
            );
            target.trigger_refetch(reason);
        }
        RefetchDecision::Skip(skip) => {
            tracing::trace!(
                query_key = target.query_key(),
                reason = reason.as_str(),
                skip = ?skip,
                "Refetch skipped"
            );
        }
    }
}

async fn recv_focus(
    rx: &mut Option<broadcast::Receiver<crate::environment::FocusEvent>>,
) -> Result<crate::environment::FocusEvent, broadcast::error::RecvError> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

async fn tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => std::future::pending().await,
    }
}
