/**
 * PROCESS TREE RESOLVER - Live mapping of every process to its job root
 *
 * ROLE :
 * Owns the set of tracked job roots (process-group ids received through
 * registration) and periodically rebuilds, from a full host listing, the
 * snapshot {live pid -> root}. Collectors only ever read that snapshot.
 *
 * OPERATION :
 * - A process whose pgid is a tracked root belongs to it (survives the
 *   leader's death: children reparented to init keep their pgid)
 * - Otherwise its parent chain is walked until a tracked root is reached
 *   (covers descendants that moved to their own process group)
 * - A leader is alive only if pid == root is listed with pgid == root, so a
 *   recycled pid in an unrelated group neither keeps the root nor inherits it
 * - Dead leader + live descendants: root kept and flagged orphaned
 * - Dead leader, nothing left: root dropped
 *
 * The snapshot is rebuilt from scratch each tick and swapped in one write.
 * A failed listing keeps the previous snapshot.
 */

use crate::procs::{ListError, ProcessEntry, ProcessSource};
use crate::state::{new_state, Shared};
use skald_contracts::{Pgid, Pid};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Point-in-time mapping of live pids to their job root
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TreeSnapshot {
    owners: HashMap<Pid, Pgid>,
}

impl TreeSnapshot {
    pub fn owner(&self, pid: Pid) -> Option<Pgid> {
        self.owners.get(&pid).copied()
    }

    pub fn len(&self) -> usize {
        self.owners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.owners.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (Pid, Pgid)> + '_ {
        self.owners.iter().map(|(pid, root)| (*pid, *root))
    }

    /// Pids grouped by root, both in ascending order
    pub fn by_root(&self) -> BTreeMap<Pgid, Vec<Pid>> {
        let mut grouped: BTreeMap<Pgid, Vec<Pid>> = BTreeMap::new();
        for (pid, root) in self.iter() {
            grouped.entry(root).or_default().push(pid);
        }
        for pids in grouped.values_mut() {
            pids.sort_unstable();
        }
        grouped
    }

    fn maps_to(&self, root: Pgid) -> bool {
        self.owners.values().any(|r| *r == root)
    }
}

impl FromIterator<(Pid, Pgid)> for TreeSnapshot {
    fn from_iter<I: IntoIterator<Item = (Pid, Pgid)>>(iter: I) -> Self {
        Self { owners: iter.into_iter().collect() }
    }
}

/// Read side of the resolver, cloned into every collector task
#[derive(Clone)]
pub struct SnapshotHandle {
    slot: Shared<Arc<TreeSnapshot>>,
}

impl SnapshotHandle {
    /// Current snapshot. Later refreshes never mutate the returned value.
    pub fn snapshot(&self) -> Arc<TreeSnapshot> {
        self.slot.read().clone()
    }

    #[cfg(test)]
    pub fn fixed(snapshot: TreeSnapshot) -> Self {
        Self { slot: new_state(Arc::new(snapshot)) }
    }

    fn replace(&self, snapshot: TreeSnapshot) {
        *self.slot.write() = Arc::new(snapshot);
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RootState {
    pub orphaned: bool,
}

/// Single writer of the tree snapshot
pub struct TreeResolver {
    source: Box<dyn ProcessSource>,
    roots: BTreeMap<Pgid, RootState>,
    handle: SnapshotHandle,
}

impl TreeResolver {
    pub fn new(source: Box<dyn ProcessSource>) -> Self {
        Self {
            source,
            roots: BTreeMap::new(),
            handle: SnapshotHandle { slot: new_state(Arc::new(TreeSnapshot::default())) },
        }
    }

    pub fn handle(&self) -> SnapshotHandle {
        self.handle.clone()
    }

    pub fn add_root(&mut self, root: Pgid) {
        if self.roots.insert(root, RootState::default()).is_none() {
            info!(pgid = root, "tracking new job root");
        }
    }

    #[cfg(test)]
    pub fn roots(&self) -> &BTreeMap<Pgid, RootState> {
        &self.roots
    }

    #[cfg(test)]
    pub fn snapshot(&self) -> Arc<TreeSnapshot> {
        self.handle.snapshot()
    }

    /// Rebuild the snapshot from a fresh host listing
    pub fn refresh(&mut self) -> Result<(), ListError> {
        let listing = match self.source.list() {
            Ok(listing) => listing,
            Err(e) => {
                warn!("tree refresh skipped, keeping previous snapshot: {e}");
                return Err(e);
            }
        };

        let tracked: HashSet<Pgid> = self.roots.keys().copied().collect();
        let resolved = resolve(&listing, &tracked);
        let snapshot: TreeSnapshot = resolved.owners.into_iter().collect();

        self.roots.retain(|root, state| {
            if resolved.live_leaders.contains(root) {
                state.orphaned = false;
                return true;
            }
            if snapshot.maps_to(*root) {
                if !state.orphaned {
                    warn!(pgid = root, "job leader exited, descendants still running: keeping orphaned root");
                }
                state.orphaned = true;
                return true;
            }
            info!(pgid = root, "job finished, no process left: dropping root");
            false
        });

        debug!(processes = snapshot.len(), roots = self.roots.len(), "tree refreshed");
        self.handle.replace(snapshot);
        Ok(())
    }

    /// Refresh on a fixed ticker and immediately on every new root
    pub async fn run(
        mut self,
        interval: Duration,
        mut new_roots: mpsc::Receiver<Pgid>,
        cancel: CancellationToken,
    ) {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
                root = new_roots.recv() => match root {
                    Some(root) => self.add_root(root),
                    None => break,
                },
            }
            // listing failures are already logged; next tick retries
            let _ = self.refresh();
        }
        debug!("tree resolver stopped");
    }
}

#[derive(Debug, Default)]
struct Resolved {
    owners: Vec<(Pid, Pgid)>,
    live_leaders: HashSet<Pgid>,
}

fn resolve(listing: &[ProcessEntry], tracked: &HashSet<Pgid>) -> Resolved {
    let by_pid: HashMap<Pid, &ProcessEntry> = listing.iter().map(|e| (e.pid, e)).collect();

    let live_leaders: HashSet<Pgid> = tracked
        .iter()
        .copied()
        .filter(|root| {
            by_pid
                .get(root)
                .is_some_and(|e| e.pgid.map_or(true, |g| g == *root))
        })
        .collect();

    let mut memo: HashMap<Pid, Option<Pgid>> = HashMap::new();
    let mut owners = Vec::new();
    for entry in listing {
        if let Some(root) = owner_of(entry.pid, &by_pid, tracked, &live_leaders, &mut memo) {
            owners.push((entry.pid, root));
        }
    }
    Resolved { owners, live_leaders }
}

/// Walks up the parent chain of `pid`; every visited pid is memoised.
fn owner_of(
    pid: Pid,
    by_pid: &HashMap<Pid, &ProcessEntry>,
    tracked: &HashSet<Pgid>,
    live_leaders: &HashSet<Pgid>,
    memo: &mut HashMap<Pid, Option<Pgid>>,
) -> Option<Pgid> {
    let mut path: Vec<Pid> = Vec::new();
    let mut current = pid;
    let owner = loop {
        if let Some(known) = memo.get(&current) {
            break *known;
        }
        let Some(entry) = by_pid.get(&current) else {
            // a parent missing from the listing is a dead tracked leader or a dead end
            break tracked.contains(&current).then_some(current);
        };
        if let Some(group) = entry.pgid.filter(|g| tracked.contains(g)) {
            break Some(group);
        }
        if live_leaders.contains(&current) {
            break Some(current);
        }
        path.push(current);
        match entry.ppid {
            Some(parent) if parent > 1 && parent != current && !path.contains(&parent) => current = parent,
            _ => break None,
        }
    };
    for visited in path {
        memo.insert(visited, owner);
    }
    memo.insert(pid, owner);
    owner
}
