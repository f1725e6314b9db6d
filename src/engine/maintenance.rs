//! Periodic maintenance sweep: reclaims terminal lease relationships,
//! deallocates remote lease agents that are ready, and finishes delayed
//! application unregistrations. Destruction happens only here, on the logic
//! task, never from a timer fire or message handler.

use std::collections::HashMap;

use crate::engine::apps::{AppHandle, LeasingApplication};
use crate::engine::remote::RemoteLeaseAgent;

use tokio::time::{Duration, Instant};

/// Counters reported by one sweep, for the maintenance log line.
#[derive(Debug, Default, PartialEq, Eq)]
pub(crate) struct SweepStats {
    pub(crate) relationships_removed: usize,
    pub(crate) remotes_removed: usize,
    pub(crate) apps_removed: usize,
}

/// Removes terminal relationships from every remote lease agent, installs GC
/// deadlines on agents left empty, and deallocates agents that are ready.
pub(crate) fn sweep_remotes(
    active: &mut HashMap<String, RemoteLeaseAgent>,
    retired: &mut Vec<RemoteLeaseAgent>,
    gc_delay: Duration,
    now: Instant,
) -> SweepStats {
    let mut stats = SweepStats::default();

    for rla in active.values_mut() {
        let before = rla.relationships.len();
        rla.relationships.retain(|_, rel| !rel.is_terminal());
        rla.timers
            .retain(|id, _| rla.relationships.contains_key(id));
        stats.relationships_removed += before - rla.relationships.len();

        if rla.relationships.is_empty() && rla.time_to_be_failed.is_none() {
            rla.time_to_be_failed = Some(now + gc_delay);
        }
    }

    let before = active.len();
    active.retain(|_, rla| !rla.is_ready_for_deallocation(now));
    stats.remotes_removed += before - active.len();

    let before = retired.len();
    retired.retain(|rla| !rla.is_ready_for_deallocation(now));
    stats.remotes_removed += before - retired.len();

    stats
}

/// Finishes delayed unregistrations: an application queued with `is_delayed`
/// is destroyed once no relationship references it and all delivered event
/// guards have dropped. Returns the removed (name, handle) pairs so the
/// caller can drop its secondary indexes.
pub(crate) fn sweep_apps(
    apps: &mut HashMap<String, LeasingApplication>,
    has_relationships: impl Fn(&str) -> bool,
) -> Vec<(String, AppHandle)> {
    let removable: Vec<String> = apps
        .values()
        .filter(|app| {
            app.is_delayed_unregister
                && app.is_drained()
                && !has_relationships(&app.name)
        })
        .map(|app| app.name.clone())
        .collect();

    removable
        .into_iter()
        .filter_map(|name| {
            apps.remove(&name).map(|app| (name, app.handle))
        })
        .collect()
}
