//! Process table and per-child state machine.
//!
//! Each declared child is one record keyed by label. A child is in exactly
//! one of three states: waiting for a scheduled launch, running under a live
//! pid, or marked for removal after its label disappeared from the
//! configuration. All transitions happen on the control thread.

use std::collections::HashMap;

use tracing::{debug, info};

use crate::config::ConfigSnapshot;
use crate::constants::QUICK_DEATH_PENALTY;

/// Lifecycle state of one child.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChildState {
    /// Launch scheduled at the given epoch second.
    PendingLaunch {
        /// Epoch second at which the child should be (re)started.
        at: i64,
    },
    /// Running; `pid` is live and not yet reaped.
    Running,
    /// Label left the configuration; terminate and forget.
    PendingRemoval,
}

/// One supervised child.
#[derive(Debug, Clone)]
pub struct Child {
    /// Unique label from the configuration.
    pub label: String,
    /// Raw command line; tokenized at launch.
    pub command: String,
    /// Group the child launches with, if any.
    pub group: Option<String>,
    /// Current OS pid, or `None` when never run or stopped.
    pub pid: Option<u32>,
    /// Lifecycle state.
    pub state: ChildState,
    /// Epoch second of the last successful launch.
    pub last_started: Option<i64>,
    /// Restarts observed so far.
    pub restarts: u64,
}

impl Child {
    fn new(label: String, command: String, group: Option<String>, now: i64) -> Self {
        Self {
            label,
            command,
            group,
            pid: None,
            state: ChildState::PendingLaunch { at: now },
            last_started: None,
            restarts: 0,
        }
    }

    /// Whether a launch is due at `now`.
    pub fn launch_due(&self, now: i64) -> bool {
        matches!(self.state, ChildState::PendingLaunch { at } if at <= now)
    }
}

/// Classification of an observed exit, driving the backoff rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitClass {
    /// The child lived longer than the restart delay.
    Normal,
    /// The child died within the restart delay of its launch.
    TooQuick,
}

/// Computes the next start time for a child reaped at `now`.
///
/// A child that lived no longer than `restart_delay` seconds is penalized
/// with a hundredfold wait; the boundary case counts as too quick.
pub fn backoff_start(
    now: i64,
    last_started: Option<i64>,
    restart_delay: u64,
) -> (i64, ExitClass) {
    let delay = restart_delay as i64;
    let lived = last_started.map(|t| now - t).unwrap_or(0);
    if lived <= delay {
        (now + QUICK_DEATH_PENALTY * delay, ExitClass::TooQuick)
    } else {
        (now + delay, ExitClass::Normal)
    }
}

/// All supervised children, keyed by label. Launch and shutdown ordering is
/// derived from the configuration snapshot, not from this map.
#[derive(Debug, Default)]
pub struct ProcessTable {
    children: HashMap<String, Child>,
}

impl ProcessTable {
    /// Creates an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of records, including those pending removal.
    pub fn len(&self) -> usize {
        self.children.len()
    }

    /// Whether the table holds no records.
    pub fn is_empty(&self) -> bool {
        self.children.is_empty()
    }

    /// Looks up a child by label.
    pub fn get(&self, label: &str) -> Option<&Child> {
        self.children.get(label)
    }

    /// Mutable lookup by label.
    pub fn get_mut(&mut self, label: &str) -> Option<&mut Child> {
        self.children.get_mut(label)
    }

    /// Iterates all records in unspecified order.
    pub fn iter(&self) -> impl Iterator<Item = &Child> {
        self.children.values()
    }

    /// Labels with a live pid, for the reap phase.
    pub fn live_pids(&self) -> Vec<(String, u32)> {
        self.children
            .values()
            .filter_map(|c| c.pid.map(|pid| (c.label.clone(), pid)))
            .collect()
    }

    /// Labels currently marked for removal.
    pub fn pending_removal(&self) -> Vec<String> {
        self.children
            .values()
            .filter(|c| c.state == ChildState::PendingRemoval)
            .map(|c| c.label.clone())
            .collect()
    }

    /// Reconciles the table against a freshly parsed snapshot.
    ///
    /// New labels are created with a launch scheduled at `now`; a changed
    /// command forces an immediate stop-then-start the same way. Labels
    /// absent from the snapshot are marked for removal, but only when the
    /// parse produced no errors; a bad reload never removes children.
    pub fn reconcile(&mut self, snapshot: &ConfigSnapshot, parse_clean: bool, now: i64) {
        for decl in &snapshot.children {
            match self.children.get_mut(&decl.label) {
                Some(child) => {
                    child.group = decl.group.clone();
                    if child.command != decl.command {
                        info!(
                            "Command for '{}' changed, scheduling stop-then-start",
                            decl.label
                        );
                        child.command = decl.command.clone();
                        child.state = ChildState::PendingLaunch { at: now };
                    }
                }
                None => {
                    debug!("New child '{}' scheduled for launch", decl.label);
                    self.children.insert(
                        decl.label.clone(),
                        Child::new(
                            decl.label.clone(),
                            decl.command.clone(),
                            decl.group.clone(),
                            now,
                        ),
                    );
                }
            }
        }

        if parse_clean {
            for child in self.children.values_mut() {
                if snapshot.child(&child.label).is_none()
                    && child.state != ChildState::PendingRemoval
                {
                    info!("Child '{}' left the configuration, marking for removal", child.label);
                    child.state = ChildState::PendingRemoval;
                }
            }
        }
    }

    /// Records a successful launch.
    pub fn record_launch(&mut self, label: &str, pid: u32, now: i64) {
        if let Some(child) = self.children.get_mut(label) {
            child.pid = Some(pid);
            child.last_started = Some(now);
            child.state = ChildState::Running;
        }
    }

    /// Records a failed launch attempt; the child stays pending and is
    /// retried after the restart delay.
    pub fn record_launch_failure(&mut self, label: &str, now: i64, restart_delay: u64) {
        if let Some(child) = self.children.get_mut(label) {
            child.state = ChildState::PendingLaunch {
                at: now + restart_delay as i64,
            };
        }
    }

    /// Records the reap of a running child and schedules its restart per the
    /// backoff rule. Returns the classification, or `None` for unknown
    /// labels.
    pub fn record_exit(
        &mut self,
        label: &str,
        now: i64,
        restart_delay: u64,
    ) -> Option<ExitClass> {
        let child = self.children.get_mut(label)?;
        let (at, class) = backoff_start(now, child.last_started, restart_delay);
        child.pid = None;
        child.restarts += 1;
        child.state = ChildState::PendingLaunch { at };
        Some(class)
    }

    /// Clears the pid of a child that exited while not in the running state,
    /// leaving its schedule untouched.
    pub fn clear_pid(&mut self, label: &str) {
        if let Some(child) = self.children.get_mut(label) {
            child.pid = None;
        }
    }

    /// Deletes a record after its termination completed.
    pub fn remove(&mut self, label: &str) -> Option<Child> {
        self.children.remove(label)
    }
}
