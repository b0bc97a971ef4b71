//! Persistence ports and their in-memory implementations.
//!
//! Trackers only talk to these traits, so a database-backed store can be swapped in without
//! touching strategy code.

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::marker::PhantomData;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;

use crate::error::{Error, Result};
use crate::types::{Post, ProfileChange, Snapshot, TrackedPost, TrackerConfig, TrackerStatus};

/// Snapshots kept per tracker and subject by the in-memory store.
const SNAPSHOT_RETENTION: usize = 100;

/// Posts kept by the in-memory post store; the earliest seen are evicted first.
const POST_RETENTION: usize = 10_000;

/// Profile changes kept by the in-memory change log.
const CHANGE_RETENTION: usize = 10_000;

/// Tracker configuration records.
#[async_trait]
pub trait TrackerStore: Send + Sync {
    async fn get(&self, id: &str) -> Result<Option<TrackerConfig>>;

    /// Insert a new record. Fails if the id is taken.
    async fn insert(&self, tracker: TrackerConfig) -> Result<()>;

    /// Replace an existing record.
    async fn update(&self, tracker: TrackerConfig) -> Result<()>;

    /// Returns whether a record was removed.
    async fn delete(&self, id: &str) -> Result<bool>;

    /// All records, oldest first.
    async fn list(&self) -> Result<Vec<TrackerConfig>>;

    async fn list_by_status(&self, statuses: &[TrackerStatus]) -> Result<Vec<TrackerConfig>>;

    async fn set_status(
        &self,
        id: &str,
        status: TrackerStatus,
        last_error: Option<String>,
    ) -> Result<()>;

    async fn record_run(&self, id: &str, at: DateTime<Utc>) -> Result<()>;

    async fn set_rule_ids(&self, id: &str, rule_ids: BTreeSet<String>) -> Result<()>;
}

/// Append-only history of snapshots, keyed by owning tracker and subject.
///
/// Two trackers watching the same subject never see each other's snapshots.
#[async_trait]
pub trait SnapshotStore<T: Snapshot>: Send + Sync {
    async fn append(&self, snapshot: T) -> Result<()>;

    async fn latest(&self, tracker_id: &str, subject_id: &str) -> Result<Option<T>>;

    /// Up to `limit` snapshots, newest first.
    async fn recent(&self, tracker_id: &str, subject_id: &str, limit: usize) -> Result<Vec<T>>;
}

/// De-duplicated posts seen on the real-time feed.
#[async_trait]
pub trait PostStore: Send + Sync {
    async fn get(&self, post_id: &str) -> Result<Option<TrackedPost>>;

    /// Insert the post, or add the tracker and tag to an existing record.
    ///
    /// Returns the stored record and whether it was newly created.
    async fn upsert_match(
        &self,
        post: Post,
        tracker_id: &str,
        tag: &str,
    ) -> Result<(TrackedPost, bool)>;

    async fn count(&self) -> Result<usize>;
}

/// Audit trail of detected profile field changes.
#[async_trait]
pub trait ChangeLogStore: Send + Sync {
    async fn append(&self, change: ProfileChange) -> Result<()>;

    /// Changes for one user, oldest first.
    async fn for_user(&self, user_id: &str) -> Result<Vec<ProfileChange>>;
}

// ── In-memory ──────────────────────────────────────────────────────

#[derive(Default)]
pub struct MemoryTrackerStore {
    trackers: RwLock<HashMap<String, TrackerConfig>>,
}

impl MemoryTrackerStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn modify(&self, id: &str, f: impl FnOnce(&mut TrackerConfig)) -> Result<()> {
        let mut trackers = self.trackers.write();
        let tracker = trackers
            .get_mut(id)
            .ok_or_else(|| Error::TrackerNotFound(id.to_string()))?;
        f(tracker);
        Ok(())
    }
}

fn sorted(mut trackers: Vec<TrackerConfig>) -> Vec<TrackerConfig> {
    trackers.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
    trackers
}

#[async_trait]
impl TrackerStore for MemoryTrackerStore {
    async fn get(&self, id: &str) -> Result<Option<TrackerConfig>> {
        Ok(self.trackers.read().get(id).cloned())
    }

    async fn insert(&self, tracker: TrackerConfig) -> Result<()> {
        let mut trackers = self.trackers.write();
        if trackers.contains_key(&tracker.id) {
            return Err(Error::Store(format!("tracker {} already exists", tracker.id)));
        }
        trackers.insert(tracker.id.clone(), tracker);
        Ok(())
    }

    async fn update(&self, tracker: TrackerConfig) -> Result<()> {
        let mut trackers = self.trackers.write();
        match trackers.get_mut(&tracker.id) {
            Some(existing) => {
                *existing = tracker;
                Ok(())
            }
            None => Err(Error::TrackerNotFound(tracker.id)),
        }
    }

    async fn delete(&self, id: &str) -> Result<bool> {
        Ok(self.trackers.write().remove(id).is_some())
    }

    async fn list(&self) -> Result<Vec<TrackerConfig>> {
        Ok(sorted(self.trackers.read().values().cloned().collect()))
    }

    async fn list_by_status(&self, statuses: &[TrackerStatus]) -> Result<Vec<TrackerConfig>> {
        Ok(sorted(
            self.trackers
                .read()
                .values()
                .filter(|t| statuses.contains(&t.status))
                .cloned()
                .collect(),
        ))
    }

    async fn set_status(
        &self,
        id: &str,
        status: TrackerStatus,
        last_error: Option<String>,
    ) -> Result<()> {
        self.modify(id, |t| {
            t.status = status;
            t.last_error = last_error;
        })
    }

    async fn record_run(&self, id: &str, at: DateTime<Utc>) -> Result<()> {
        self.modify(id, |t| t.last_run_at = Some(at))
    }

    async fn set_rule_ids(&self, id: &str, rule_ids: BTreeSet<String>) -> Result<()> {
        self.modify(id, |t| t.rule_ids = rule_ids)
    }
}

type SnapshotKey = (String, String);

/// Bounded history per tracker and subject; the oldest snapshots fall off first.
pub struct MemorySnapshotStore<T> {
    history: RwLock<HashMap<SnapshotKey, VecDeque<T>>>,
    retention: usize,
    _marker: PhantomData<fn() -> T>,
}

impl<T> MemorySnapshotStore<T> {
    pub fn new() -> Self {
        Self::with_retention(SNAPSHOT_RETENTION)
    }

    pub fn with_retention(retention: usize) -> Self {
        Self {
            history: RwLock::new(HashMap::new()),
            retention: retention.max(1),
            _marker: PhantomData,
        }
    }
}

impl<T> Default for MemorySnapshotStore<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl<T: Snapshot> SnapshotStore<T> for MemorySnapshotStore<T> {
    async fn append(&self, snapshot: T) -> Result<()> {
        let mut history = self.history.write();
        let key = (
            snapshot.tracker_id().to_string(),
            snapshot.subject_id().to_string(),
        );
        let entries = history.entry(key).or_default();
        entries.push_back(snapshot);
        while entries.len() > self.retention {
            entries.pop_front();
        }
        Ok(())
    }

    async fn latest(&self, tracker_id: &str, subject_id: &str) -> Result<Option<T>> {
        let key = (tracker_id.to_string(), subject_id.to_string());
        Ok(self
            .history
            .read()
            .get(&key)
            .and_then(|entries| entries.back().cloned()))
    }

    async fn recent(&self, tracker_id: &str, subject_id: &str, limit: usize) -> Result<Vec<T>> {
        let key = (tracker_id.to_string(), subject_id.to_string());
        Ok(self
            .history
            .read()
            .get(&key)
            .map(|entries| entries.iter().rev().take(limit).cloned().collect())
            .unwrap_or_default())
    }
}

#[derive(Default)]
struct PostTable {
    posts: HashMap<String, TrackedPost>,
    /// Post ids in first-seen order.
    order: VecDeque<String>,
}

/// Bounded post table; the earliest seen posts are evicted first.
pub struct MemoryPostStore {
    table: RwLock<PostTable>,
    retention: usize,
}

impl MemoryPostStore {
    pub fn new() -> Self {
        Self::with_retention(POST_RETENTION)
    }

    pub fn with_retention(retention: usize) -> Self {
        Self {
            table: RwLock::new(PostTable::default()),
            retention: retention.max(1),
        }
    }
}

impl Default for MemoryPostStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PostStore for MemoryPostStore {
    async fn get(&self, post_id: &str) -> Result<Option<TrackedPost>> {
        Ok(self.table.read().posts.get(post_id).cloned())
    }

    async fn upsert_match(
        &self,
        post: Post,
        tracker_id: &str,
        tag: &str,
    ) -> Result<(TrackedPost, bool)> {
        let mut table = self.table.write();
        if let Some(existing) = table.posts.get_mut(&post.id) {
            existing.record_match(tracker_id, tag);
            return Ok((existing.clone(), false));
        }

        let record = TrackedPost::new(post, tracker_id, tag);
        table.order.push_back(record.post.id.clone());
        table.posts.insert(record.post.id.clone(), record.clone());
        while table.order.len() > self.retention {
            if let Some(evicted) = table.order.pop_front() {
                table.posts.remove(&evicted);
            }
        }
        Ok((record, true))
    }

    async fn count(&self) -> Result<usize> {
        Ok(self.table.read().posts.len())
    }
}

/// Bounded change log; the oldest entries fall off first.
pub struct MemoryChangeLog {
    changes: RwLock<VecDeque<ProfileChange>>,
    retention: usize,
}

impl MemoryChangeLog {
    pub fn new() -> Self {
        Self::with_retention(CHANGE_RETENTION)
    }

    pub fn with_retention(retention: usize) -> Self {
        Self {
            changes: RwLock::new(VecDeque::new()),
            retention: retention.max(1),
        }
    }
}

impl Default for MemoryChangeLog {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ChangeLogStore for MemoryChangeLog {
    async fn append(&self, change: ProfileChange) -> Result<()> {
        let mut changes = self.changes.write();
        changes.push_back(change);
        while changes.len() > self.retention {
            changes.pop_front();
        }
        Ok(())
    }

    async fn for_user(&self, user_id: &str) -> Result<Vec<ProfileChange>> {
        Ok(self
            .changes
            .read()
            .iter()
            .filter(|c| c.user_id == user_id)
            .cloned()
            .collect())
    }
}
