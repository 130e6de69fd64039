//! Per-destination session records for multi-destination writes and verifies.
//!
//! Every destination taking part in a session gets a record keyed by its
//! [`DestinationId`], holding its status and the last progress it reported.
//! Aggregate progress is derived from this table on a timer instead of being
//! pushed on every individual event.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Stable identifier of a destination within a [`crate::core::MultiDestination`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DestinationId(pub(crate) usize);

impl From<usize> for DestinationId {
    /// The id of the destination at `index` in the list a
    /// [`crate::core::MultiDestination`] was built from.
    fn from(index: usize) -> Self {
        Self(index)
    }
}

impl fmt::Display for DestinationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "dest-{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    Active,
    Finished,
    Errored,
}

#[derive(Debug, Clone)]
pub struct SessionRecord<P> {
    pub id: DestinationId,
    pub status: SessionStatus,
    pub progress: Option<P>,
}

/// Thread-safe table of session records.
///
/// Errored records stay in the table (so callers can list them) but never
/// count towards aggregation again, and an errored record is never
/// reactivated.
#[derive(Clone)]
pub struct ProgressTracker<P> {
    inner: Arc<RwLock<BTreeMap<DestinationId, SessionRecord<P>>>>,
}

impl<P> Default for ProgressTracker<P> {
    fn default() -> Self {
        Self {
            inner: Arc::new(RwLock::new(BTreeMap::new())),
        }
    }
}

impl<P: Clone> ProgressTracker<P> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start tracking a destination as active with no progress yet.
    pub async fn register(&self, id: DestinationId) {
        let mut map = self.inner.write().await;
        map.entry(id).or_insert(SessionRecord {
            id,
            status: SessionStatus::Active,
            progress: None,
        });
    }

    /// Record the latest progress for an active destination.
    pub async fn update(&self, id: DestinationId, progress: P) {
        let mut map = self.inner.write().await;
        if let Some(record) = map.get_mut(&id) {
            if record.status != SessionStatus::Errored {
                record.progress = Some(progress);
            }
        }
    }

    /// Mark a destination finished. Returns the number still active.
    pub async fn finish(&self, id: DestinationId) -> usize {
        self.transition(id, SessionStatus::Finished).await
    }

    /// Mark a destination errored. Returns the number still active.
    pub async fn fail(&self, id: DestinationId) -> usize {
        self.transition(id, SessionStatus::Errored).await
    }

    async fn transition(&self, id: DestinationId, status: SessionStatus) -> usize {
        let mut map = self.inner.write().await;
        if let Some(record) = map.get_mut(&id) {
            if record.status == SessionStatus::Active {
                record.status = status;
            }
        }
        count_status(&map, SessionStatus::Active)
    }

    pub async fn get(&self, id: DestinationId) -> Option<SessionRecord<P>> {
        let map = self.inner.read().await;
        map.get(&id).cloned()
    }

    pub async fn active_count(&self) -> usize {
        let map = self.inner.read().await;
        count_status(&map, SessionStatus::Active)
    }

    pub async fn ids_with_status(&self, status: SessionStatus) -> Vec<DestinationId> {
        let map = self.inner.read().await;
        map.values()
            .filter(|r| r.status == status)
            .map(|r| r.id)
            .collect()
    }

    /// Slowest reported progress among active destinations, by `key`.
    pub async fn aggregate<K: Ord>(&self, key: impl Fn(&P) -> K) -> Option<P> {
        self.min_where(|s| s == SessionStatus::Active, key).await
    }

    /// Slowest reported progress among destinations that have not errored.
    /// Used for the last emission of a session, when nothing is active.
    pub async fn final_aggregate<K: Ord>(&self, key: impl Fn(&P) -> K) -> Option<P> {
        self.min_where(|s| s != SessionStatus::Errored, key).await
    }

    async fn min_where<K: Ord>(
        &self,
        include: impl Fn(SessionStatus) -> bool,
        key: impl Fn(&P) -> K,
    ) -> Option<P> {
        let map = self.inner.read().await;
        map.values()
            .filter(|r| include(r.status))
            .filter_map(|r| r.progress.as_ref())
            .min_by_key(|p| key(p))
            .cloned()
    }
}

fn count_status<P>(map: &BTreeMap<DestinationId, SessionRecord<P>>, status: SessionStatus) -> usize {
    map.values().filter(|r| r.status == status).count()
}
