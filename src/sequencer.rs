//! Staged launch ordering.
//!
//! Launches happen in cohorts: every ungrouped child in declaration order
//! first, then each named group in group-name sort order. The control loop
//! walks the cohorts with a configured pause between successive launches so
//! downstream children start a known time after their upstreams. Shutdown
//! reverses the full launch order with no pauses.

use crate::config::ConfigSnapshot;
use crate::table::ProcessTable;

/// Builds the launch cohorts due at `now`: one cohort of ungrouped labels,
/// then one cohort per group in name sort order. Only children whose
/// scheduled start has been reached appear; empty cohorts are dropped.
pub fn staged_cohorts(
    snapshot: &ConfigSnapshot,
    table: &ProcessTable,
    now: i64,
) -> Vec<Vec<String>> {
    let mut cohorts = Vec::new();

    let due = |label: &str| {
        table
            .get(label)
            .map(|child| child.launch_due(now))
            .unwrap_or(false)
    };

    let ungrouped: Vec<String> = snapshot
        .ungrouped_order()
        .into_iter()
        .filter(|label| due(label))
        .map(str::to_string)
        .collect();
    if !ungrouped.is_empty() {
        cohorts.push(ungrouped);
    }

    for (_, members) in snapshot.groups() {
        let cohort: Vec<String> = members
            .into_iter()
            .filter(|label| due(label))
            .map(str::to_string)
            .collect();
        if !cohort.is_empty() {
            cohorts.push(cohort);
        }
    }

    cohorts
}

/// Shutdown order: the exact reverse of the launch order.
pub fn shutdown_order(snapshot: &ConfigSnapshot) -> Vec<String> {
    let mut order = snapshot.launch_order();
    order.reverse();
    order
}
