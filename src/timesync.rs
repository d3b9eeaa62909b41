//! Time synchronization groups.
//!
//! Views in the same group follow each other: when one member selects a line,
//! every other member scrolls to the earliest line carrying the closest
//! timestamp not after it. The registry is an arena keyed by view id; members
//! are held weakly so a dropped view never stays alive through its group.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use chrono::NaiveDateTime;
use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::error::{EngineError, Result};

pub type ViewId = u64;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GroupId(pub u64);

/// A view that can take part in time synchronization
pub trait TimeSyncMember: Send + Sync {
    fn line_count(&self) -> usize;

    /// Timestamp carried by the line itself
    fn timestamp_at(&self, line: usize) -> Option<NaiveDateTime>;

    fn current_line(&self) -> Option<usize>;

    /// Scroll to and select `line` without triggering another synchronization
    fn sync_to_line(&self, line: usize);
}

/// Timestamp of `line`, inherited from the closest preceding line that has
/// one
pub fn effective_timestamp(member: &dyn TimeSyncMember, line: usize) -> Option<NaiveDateTime> {
    (0..=line).rev().find_map(|l| member.timestamp_at(l))
}

/// Earliest line whose effective timestamp is the greatest one not after
/// `timestamp`.
///
/// Lines are assumed to be in non-decreasing timestamp order. Returns `None`
/// when every line is later than `timestamp`.
pub fn find_timestamp_line(member: &dyn TimeSyncMember, timestamp: NaiveDateTime) -> Option<usize> {
    let count = member.line_count();
    let mut inherited = InheritedTimestamps::new(member);
    let mut key = |line: usize| inherited.get(line).unwrap_or(NaiveDateTime::MIN);

    let not_after = partition_point(count, |line| key(line) <= timestamp);
    if not_after == 0 {
        return None;
    }
    let found = key(not_after - 1);
    Some(partition_point(not_after, |line| key(line) < found))
}

/// Effective timestamps resolved during one lookup.
///
/// Each run covers lines that all inherit the timestamp found at its first
/// line, so a backward scan stops as soon as it enters a known run. A whole
/// binary search reads every line at most once.
struct InheritedTimestamps<'a> {
    member: &'a dyn TimeSyncMember,
    /// (first, last, timestamp), inclusive
    runs: Vec<(usize, usize, Option<NaiveDateTime>)>,
}

impl<'a> InheritedTimestamps<'a> {
    fn new(member: &'a dyn TimeSyncMember) -> Self {
        Self {
            member,
            runs: Vec::new(),
        }
    }

    fn known(&self, line: usize) -> Option<Option<NaiveDateTime>> {
        self.runs
            .iter()
            .find(|&&(first, last, _)| (first..=last).contains(&line))
            .map(|&(_, _, timestamp)| timestamp)
    }

    fn get(&mut self, line: usize) -> Option<NaiveDateTime> {
        let mut first = line;
        let timestamp = loop {
            if let Some(timestamp) = self.known(first) {
                break timestamp;
            }
            if let Some(timestamp) = self.member.timestamp_at(first) {
                break Some(timestamp);
            }
            if first == 0 {
                break None;
            }
            first -= 1;
        };
        self.runs.push((first, line, timestamp));
        timestamp
    }
}

/// First index in `[0, len)` for which `pred` is false, assuming `pred` holds
/// for a prefix
fn partition_point(len: usize, mut pred: impl FnMut(usize) -> bool) -> usize {
    let (mut lo, mut hi) = (0, len);
    while lo < hi {
        let mid = lo + (hi - lo) / 2;
        if pred(mid) {
            lo = mid + 1;
        } else {
            hi = mid;
        }
    }
    lo
}

#[derive(Debug, Default)]
struct Group {
    members: Vec<ViewId>,
    current: Option<NaiveDateTime>,
}

#[derive(Default)]
struct Registry {
    groups: HashMap<GroupId, Group>,
    membership: HashMap<ViewId, GroupId>,
    members: HashMap<ViewId, Weak<dyn TimeSyncMember>>,
    next_group: u64,
}

impl Registry {
    fn member(&self, id: ViewId) -> Option<Arc<dyn TimeSyncMember>> {
        self.members.get(&id).and_then(Weak::upgrade)
    }

    fn new_group(&mut self, members: Vec<ViewId>, current: Option<NaiveDateTime>) -> GroupId {
        self.next_group += 1;
        let id = GroupId(self.next_group);
        for &member in &members {
            self.membership.insert(member, id);
        }
        self.groups.insert(id, Group { members, current });
        id
    }

    fn add_to_group(&mut self, group: GroupId, member: ViewId) {
        if let Some(g) = self.groups.get_mut(&group) {
            if !g.members.contains(&member) {
                g.members.push(member);
            }
            self.membership.insert(member, group);
        }
    }

    fn remove_from_group(&mut self, member: ViewId) {
        let Some(group_id) = self.membership.remove(&member) else {
            return;
        };
        let Some(group) = self.groups.get_mut(&group_id) else {
            return;
        };
        group.members.retain(|&m| m != member);
        if group.members.len() <= 1 {
            if let Some(group) = self.groups.remove(&group_id) {
                for m in group.members {
                    self.membership.remove(&m);
                }
            }
            debug!(group = group_id.0, "Time sync group dissolved");
        }
    }
}

/// Registry of all time sync groups of an engine
#[derive(Default)]
pub struct TimeSyncRegistry {
    inner: Mutex<Registry>,
}

impl TimeSyncRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, id: ViewId, member: Weak<dyn TimeSyncMember>) {
        self.inner.lock().members.insert(id, member);
    }

    /// Leave any group and forget the member
    pub fn unregister(&self, id: ViewId) {
        let mut registry = self.inner.lock();
        registry.remove_from_group(id);
        registry.members.remove(&id);
    }

    /// Put `view` and `other` in the same group.
    ///
    /// - `other` unsynced: it joins `view`'s group, or both form a new group
    ///   at `view`'s current timestamp.
    /// - `view` unsynced, `other` synced: `view` joins `other`'s group.
    /// - Both in different groups: `other` leaves its group and joins `view`'s.
    ///
    /// Members that joined scroll to the group's current timestamp.
    pub fn join(&self, view: ViewId, other: ViewId) -> Result<GroupId> {
        let (group, timestamp, to_sync) = {
            let mut registry = self.inner.lock();
            let view_member = registry.member(view).ok_or(EngineError::UnknownView(view))?;
            registry.member(other).ok_or(EngineError::UnknownView(other))?;

            let ours = registry.membership.get(&view).copied();
            let theirs = registry.membership.get(&other).copied();
            let (group, joined) = match (ours, theirs) {
                (Some(a), Some(b)) if a == b => (a, Vec::new()),
                (Some(a), Some(_)) => {
                    // `other` alone moves; its old group keeps the rest or dissolves
                    registry.remove_from_group(other);
                    registry.add_to_group(a, other);
                    (a, vec![other])
                }
                (Some(a), None) => {
                    registry.add_to_group(a, other);
                    (a, vec![other])
                }
                (None, Some(b)) => {
                    registry.add_to_group(b, view);
                    (b, vec![view])
                }
                (None, None) => {
                    let current = view_member
                        .current_line()
                        .and_then(|line| effective_timestamp(view_member.as_ref(), line));
                    (registry.new_group(vec![view, other], current), vec![other])
                }
            };
            let timestamp = registry.groups.get(&group).and_then(|g| g.current);
            let to_sync: Vec<_> = joined.iter().filter_map(|&m| registry.member(m)).collect();
            (group, timestamp, to_sync)
        };

        debug!(group = group.0, view, other, "Joined time sync group");
        if let Some(timestamp) = timestamp {
            sync_members(&to_sync, timestamp);
        }
        Ok(group)
    }

    /// Leave the view's group; a group left with one member dissolves
    pub fn leave(&self, view: ViewId) {
        self.inner.lock().remove_from_group(view);
    }

    /// Record a new group timestamp coming from `origin` and scroll every
    /// other member. Returns the number of members that were asked to scroll.
    pub fn set_timestamp(&self, origin: ViewId, timestamp: NaiveDateTime) -> usize {
        let others = {
            let mut registry = self.inner.lock();
            let Some(&group_id) = registry.membership.get(&origin) else {
                return 0;
            };
            let Some(group) = registry.groups.get_mut(&group_id) else {
                return 0;
            };
            group.current = Some(timestamp);
            let ids: Vec<ViewId> = group.members.iter().copied().filter(|&m| m != origin).collect();
            ids.into_iter().filter_map(|m| registry.member(m)).collect::<Vec<_>>()
        };
        trace!(origin, %timestamp, members = others.len(), "Synchronizing group");
        sync_members(&others, timestamp);
        others.len()
    }

    pub fn group_of(&self, view: ViewId) -> Option<GroupId> {
        self.inner.lock().membership.get(&view).copied()
    }

    pub fn is_synced(&self, view: ViewId) -> bool {
        self.group_of(view).is_some()
    }

    pub fn members(&self, group: GroupId) -> Vec<ViewId> {
        self.inner
            .lock()
            .groups
            .get(&group)
            .map(|g| g.members.clone())
            .unwrap_or_default()
    }

    pub fn current_timestamp(&self, group: GroupId) -> Option<NaiveDateTime> {
        self.inner.lock().groups.get(&group).and_then(|g| g.current)
    }
}

/// Scroll members outside the registry lock
fn sync_members(members: &[Arc<dyn TimeSyncMember>], timestamp: NaiveDateTime) {
    for member in members {
        if let Some(line) = find_timestamp_line(member.as_ref(), timestamp) {
            member.sync_to_line(line);
        }
    }
}
