//! The instance transition graph.

use std::fmt;

use serde::{Deserialize, Serialize};

use lablet_core::InstanceState::{self, *};

/// Something that asks an instance to move.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Trigger {
    /// Scheduler bound a worker, capacity and ports.
    Bind,
    Cancel,
    /// Reservation left the queue unplaced when its timeslot ended.
    Expire,
    TimeslotReached,
    /// Warm lab reactivation; import is skipped.
    WarmActivate,
    /// Import (or warm start) and lab start both succeeded.
    ImportSucceeded,
    ImportFailed,
    CollectionRequested,
    StopRequested,
    CollectionCompleted,
    CollectionFailed,
    CollectionTimedOut,
    GradingCompleted,
    GradingTimedOut,
    WorkerConfirmedStop,
    Restart,
    ResultsPersisted,
    CleanupCompleted,
}

impl Trigger {
    pub fn as_str(self) -> &'static str {
        match self {
            Trigger::Bind => "bind",
            Trigger::Cancel => "cancel",
            Trigger::Expire => "expire",
            Trigger::TimeslotReached => "timeslot.reached",
            Trigger::WarmActivate => "warm.activate",
            Trigger::ImportSucceeded => "import.succeeded",
            Trigger::ImportFailed => "import.failed",
            Trigger::CollectionRequested => "collection.requested",
            Trigger::StopRequested => "stop.requested",
            Trigger::CollectionCompleted => "collection.completed",
            Trigger::CollectionFailed => "collection.failed",
            Trigger::CollectionTimedOut => "collection.timed_out",
            Trigger::GradingCompleted => "grading.completed",
            Trigger::GradingTimedOut => "grading.timed_out",
            Trigger::WorkerConfirmedStop => "worker.confirmed_stop",
            Trigger::Restart => "restart",
            Trigger::ResultsPersisted => "results.persisted",
            Trigger::CleanupCompleted => "cleanup.completed",
        }
    }

    /// Completions reported by systems outside the engine. These may be
    /// replayed and must be applied idempotently.
    pub fn is_external(self) -> bool {
        matches!(
            self,
            Trigger::CollectionCompleted
                | Trigger::CollectionFailed
                | Trigger::CollectionTimedOut
                | Trigger::GradingCompleted
                | Trigger::GradingTimedOut
                | Trigger::WorkerConfirmedStop
                | Trigger::ResultsPersisted
                | Trigger::CleanupCompleted
        )
    }

    /// Triggers whose edge also records data (binding, port map, lab id).
    /// They are only applied through the operation that supplies it.
    pub fn carries_payload(self) -> bool {
        matches!(
            self,
            Trigger::Bind
                | Trigger::TimeslotReached
                | Trigger::WarmActivate
                | Trigger::ImportSucceeded
        )
    }
}

impl fmt::Display for Trigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Every allowed edge: `(from, trigger, to)`.
pub const TRANSITIONS: &[(InstanceState, Trigger, InstanceState)] = &[
    (Pending, Trigger::Bind, Scheduled),
    (Pending, Trigger::Cancel, Terminated),
    (Pending, Trigger::Expire, Terminated),
    (Scheduled, Trigger::TimeslotReached, Instantiating),
    (Scheduled, Trigger::WarmActivate, Instantiating),
    (Scheduled, Trigger::Cancel, Terminated),
    (Instantiating, Trigger::ImportSucceeded, Running),
    (Instantiating, Trigger::ImportFailed, Terminated),
    (Instantiating, Trigger::Cancel, Terminated),
    (Running, Trigger::CollectionRequested, Collecting),
    (Running, Trigger::StopRequested, Stopping),
    (Running, Trigger::Cancel, Stopping),
    (Collecting, Trigger::CollectionCompleted, Grading),
    (Collecting, Trigger::CollectionFailed, Stopping),
    (Collecting, Trigger::CollectionTimedOut, Stopping),
    (Collecting, Trigger::Cancel, Stopping),
    (Grading, Trigger::GradingCompleted, Stopping),
    (Grading, Trigger::GradingTimedOut, Stopping),
    (Grading, Trigger::Cancel, Stopping),
    (Stopping, Trigger::WorkerConfirmedStop, Stopped),
    (Stopped, Trigger::Restart, Running),
    (Stopped, Trigger::ResultsPersisted, Archived),
    (Archived, Trigger::CleanupCompleted, Terminated),
];

/// Triggers that may skip one intermediate state when they arrive
/// early: `(from, trigger, via)`. A collection can finish before the
/// engine has recorded that it started.
const IMPLIED: &[(InstanceState, Trigger, Trigger)] =
    &[(Running, Trigger::CollectionCompleted, Trigger::CollectionRequested)];

/// What a trigger does to an instance in a given state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Plan {
    /// Enter each state in order.
    Apply(Vec<InstanceState>),
    /// Nothing to do; the instance is already at or past the target.
    Ignore,
    /// No edge exists.
    Invalid,
}

fn edge(from: InstanceState, trigger: Trigger) -> Option<InstanceState> {
    TRANSITIONS
        .iter()
        .find(|(f, t, _)| *f == from && *t == trigger)
        .map(|(_, _, to)| *to)
}

/// The state a trigger leads to, wherever it applies.
fn target(trigger: Trigger) -> Option<InstanceState> {
    TRANSITIONS
        .iter()
        .find(|(_, t, _)| *t == trigger)
        .map(|(_, _, to)| *to)
}

/// Resolve a trigger against the central table.
pub fn plan(from: InstanceState, trigger: Trigger) -> Plan {
    if let Some(to) = edge(from, trigger) {
        return Plan::Apply(vec![to]);
    }

    let implied = IMPLIED
        .iter()
        .find(|(f, t, _)| *f == from && *t == trigger)
        .and_then(|(_, _, via)| edge(from, *via))
        .and_then(|mid| edge(mid, trigger).map(|to| vec![mid, to]));
    if let Some(path) = implied {
        return Plan::Apply(path);
    }

    if from.is_terminal() {
        return Plan::Ignore;
    }

    match trigger {
        // Already winding down.
        Trigger::Cancel if from.rank() >= Stopping.rank() => Plan::Ignore,
        t if t.is_external() => match target(t) {
            Some(to) if from.rank() >= to.rank() => Plan::Ignore,
            // Stop-path completion from before a restart.
            Some(Stopping | Stopped) if from == Running => Plan::Ignore,
            _ => Plan::Invalid,
        },
        _ => Plan::Invalid,
    }
}
