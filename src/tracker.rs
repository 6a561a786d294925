use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::path::PathBuf;
use std::sync::{Arc, LazyLock};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};
use tracing::{debug, info, instrument};

use crate::types::{Listing, ListingId, Source};
use crate::{Result, SleuthError};

/// Identities seen in the last run of one criteria scope, grouped by source.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ScopeState {
    pub updated_at: Option<DateTime<Utc>>,
    pub sources: BTreeMap<Source, BTreeSet<String>>,
}

impl ScopeState {
    pub fn contains(&self, id: &ListingId) -> bool {
        self.sources
            .get(&id.source)
            .map_or(false, |ids| ids.contains(&id.native_id))
    }

    pub fn len(&self) -> usize {
        self.sources.values().map(BTreeSet::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Exclusive hold on one scope's state, released on drop.
pub type ScopeLock = OwnedMutexGuard<()>;

/// Keyed storage of [`ScopeState`], one entry per criteria scope.
///
/// `replace` must be atomic: a concurrent or later `load` observes either
/// the previous state or the new one, never a mix. Callers that read, mark
/// and write a scope hold its [`ScopeLock`] across all three steps, so every
/// handle sharing the store sees the same lock.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Waits for exclusive access to `scope`.
    async fn lock(&self, scope: &str) -> ScopeLock;

    /// Loads the state of `scope`, or `None` if the scope has never run.
    async fn load(&self, scope: &str) -> Result<Option<ScopeState>>;

    /// Replaces the state of `scope` wholesale.
    async fn replace(&self, scope: &str, state: &ScopeState) -> Result<()>;
}

/// Named async locks. Entries nobody holds or waits on are pruned whenever
/// a lock is acquired.
#[derive(Default)]
pub struct ScopeLocks {
    locks: std::sync::Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl ScopeLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn acquire(&self, key: &str) -> ScopeLock {
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
            locks.retain(|_, lock| Arc::strong_count(lock) > 1);
            locks.entry(key.to_string()).or_default().clone()
        };
        lock.lock_owned().await
    }

    fn len(&self) -> usize {
        self.locks.lock().map_or(0, |locks| locks.len())
    }
}

/// In-process state store. State is lost when the process exits.
#[derive(Default)]
pub struct MemoryStateStore {
    scopes: RwLock<HashMap<String, ScopeState>>,
    locks: ScopeLocks,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StateStore for MemoryStateStore {
    async fn lock(&self, scope: &str) -> ScopeLock {
        self.locks.acquire(scope).await
    }

    async fn load(&self, scope: &str) -> Result<Option<ScopeState>> {
        Ok(self.scopes.read().await.get(scope).cloned())
    }

    async fn replace(&self, scope: &str, state: &ScopeState) -> Result<()> {
        self.scopes
            .write()
            .await
            .insert(scope.to_string(), state.clone());
        Ok(())
    }
}

/// Locks of every scope document in the process, keyed by path, so separate
/// `FileStateStore`s over one directory exclude each other.
static FILE_LOCKS: LazyLock<ScopeLocks> = LazyLock::new(ScopeLocks::new);

/// State store keeping one JSON document per scope in a directory.
///
/// Writes go to a temporary sibling file that is renamed over the document,
/// so an interrupted write leaves the previous state in place.
pub struct FileStateStore {
    dir: PathBuf,
}

impl FileStateStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path(&self, scope: &str) -> PathBuf {
        self.dir.join(format!("{}.json", scope))
    }

    fn corruption(scope: &str, reason: impl ToString) -> SleuthError {
        SleuthError::StateCorruption {
            scope: scope.to_string(),
            reason: reason.to_string(),
        }
    }
}

#[async_trait]
impl StateStore for FileStateStore {
    async fn lock(&self, scope: &str) -> ScopeLock {
        let path = self.path(scope);
        let key = std::path::absolute(&path).unwrap_or(path);
        FILE_LOCKS.acquire(&key.to_string_lossy()).await
    }

    async fn load(&self, scope: &str) -> Result<Option<ScopeState>> {
        let path = self.path(scope);
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(Self::corruption(scope, format!("{}: {}", path.display(), e))),
        };

        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|e| Self::corruption(scope, format!("{}: {}", path.display(), e)))
    }

    async fn replace(&self, scope: &str, state: &ScopeState) -> Result<()> {
        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| Self::corruption(scope, e))?;

        let body = serde_json::to_vec_pretty(state)?;
        let path = self.path(scope);
        let staging = self
            .dir
            .join(format!(".{}.{}.tmp", scope, uuid::Uuid::new_v4()));

        tokio::fs::write(&staging, &body)
            .await
            .map_err(|e| Self::corruption(scope, e))?;
        if let Err(e) = tokio::fs::rename(&staging, &path).await {
            let _ = tokio::fs::remove_file(&staging).await;
            return Err(Self::corruption(scope, e));
        }

        debug!(path = %path.display(), "State written");
        Ok(())
    }
}

/// The listings of one run after change tracking.
#[derive(Debug)]
pub struct Tracked {
    /// Listings with `is_new` set, duplicates removed, in input order.
    pub listings: Vec<Listing>,
    /// Records dropped because an earlier record had the same identity.
    pub duplicates: usize,
    /// Whether the scope had no recorded state before this run.
    pub first_run: bool,
}

impl Tracked {
    pub fn new_count(&self) -> usize {
        self.listings.iter().filter(|l| l.is_new).count()
    }
}

/// The next state of a marked scope, not yet written.
///
/// Holds the scope lock until committed or dropped. Dropping it leaves the
/// stored state untouched, so the same listings read as new next run.
pub struct PendingState {
    store: Arc<dyn StateStore>,
    scope: String,
    next: ScopeState,
    _lock: ScopeLock,
}

impl PendingState {
    pub fn state(&self) -> &ScopeState {
        &self.next
    }

    /// Writes the state and releases the scope.
    pub async fn commit(self) -> Result<()> {
        self.store.replace(&self.scope, &self.next).await?;
        debug!(scope = %self.scope, identities = self.next.len(), "Tracking state committed");
        Ok(())
    }
}

/// Flags listings unseen in the previous run of the same criteria scope.
///
/// Runs against one scope are serialized through the store's scope lock:
/// the load, mark and commit steps of one run never interleave with
/// another's, even across trackers sharing the store. Runs against
/// different scopes proceed in parallel.
pub struct ChangeTracker {
    store: Arc<dyn StateStore>,
}

impl ChangeTracker {
    pub fn new(store: Arc<dyn StateStore>) -> Self {
        Self { store }
    }

    /// Marks `listings` against the previous state of `scope`.
    ///
    /// # Arguments
    ///
    /// * `scope` - The criteria scope key.
    /// * `listings` - This run's normalized listings.
    /// * `completed` - Sources that finished fetching. Their identity sets are
    ///   replaced with this run's; sources that failed keep their previous set.
    ///
    /// # Returns
    ///
    /// The de-duplicated listings with `is_new` set, and the pending state
    /// that records them once committed. `StateCorruption` if the previous
    /// state cannot be read.
    #[instrument(skip(self, listings, completed), fields(listings = listings.len()))]
    pub async fn mark(
        &self,
        scope: &str,
        listings: Vec<Listing>,
        completed: &BTreeSet<Source>,
    ) -> Result<(Tracked, PendingState)> {
        let (mut listings, duplicates) = collapse_duplicates(listings);

        let lock = self.store.lock(scope).await;

        let previous = self.store.load(scope).await?;
        let first_run = previous.is_none();
        let previous = previous.unwrap_or_default();

        for listing in &mut listings {
            listing.is_new = !previous.contains(&listing.id);
        }

        let mut next = previous;
        for source in completed {
            let seen: BTreeSet<String> = listings
                .iter()
                .filter(|l| l.source() == *source)
                .map(|l| l.id.native_id.clone())
                .collect();
            next.sources.insert(*source, seen);
        }
        next.updated_at = Some(Utc::now());

        let tracked = Tracked {
            listings,
            duplicates,
            first_run,
        };
        info!(
            new = tracked.new_count(),
            total = tracked.listings.len(),
            duplicates,
            first_run,
            "Change tracking complete"
        );

        let pending = PendingState {
            store: self.store.clone(),
            scope: scope.to_string(),
            next,
            _lock: lock,
        };
        Ok((tracked, pending))
    }

    /// Marks `listings` and commits the new state straight away.
    ///
    /// Nothing is written on error.
    pub async fn track(
        &self,
        scope: &str,
        listings: Vec<Listing>,
        completed: &BTreeSet<Source>,
    ) -> Result<Tracked> {
        let (tracked, pending) = self.mark(scope, listings, completed).await?;
        pending.commit().await?;
        Ok(tracked)
    }
}

/// Keeps the first listing of every identity.
fn collapse_duplicates(listings: Vec<Listing>) -> (Vec<Listing>, usize) {
    let total = listings.len();
    let mut seen = HashSet::new();
    let unique: Vec<Listing> = listings
        .into_iter()
        .filter(|listing| seen.insert(listing.id.clone()))
        .collect();
    let duplicates = total - unique.len();
    (unique, duplicates)
}
