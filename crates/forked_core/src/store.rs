//! Reference implementation of [`ForkedResource`].

use crate::change_feed::{ChangeEvent, ChangeFeed, ChangeStream};
use crate::error::{CoreError, CoreResult};
use crate::fork::{Content, Fork, MergeExpectation, MergeOutcome};
use crate::merge::{merge_content, Merger, MostRecentMerger};
use crate::resource::{ForkTransaction, ForkedResource, Resource};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, error};

/// Snapshot format version.
const SNAPSHOT_VERSION: u16 = 1;

/// Version of the empty commit every store starts from.
const ROOT_VERSION: u64 = 0;

/// Head and common ancestor of one fork.
///
/// For `main`, `ancestor` is unused and kept equal to `head`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
struct ForkHead {
    head: u64,
    ancestor: u64,
}

/// All forks and the commits they reference.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(bound = "R: Resource")]
struct Repository<R> {
    next_version: u64,
    commits: BTreeMap<u64, Content<R>>,
    forks: BTreeMap<Fork, ForkHead>,
}

impl<R: Resource> Repository<R> {
    fn new() -> Self {
        let mut commits = BTreeMap::new();
        commits.insert(ROOT_VERSION, Content::None);
        let mut forks = BTreeMap::new();
        forks.insert(
            Fork::MAIN,
            ForkHead {
                head: ROOT_VERSION,
                ancestor: ROOT_VERSION,
            },
        );
        Self {
            next_version: ROOT_VERSION + 1,
            commits,
            forks,
        }
    }

    fn head(&self, fork: &Fork) -> CoreResult<ForkHead> {
        self.forks
            .get(fork)
            .copied()
            .ok_or_else(|| CoreError::fork_not_found(fork.name()))
    }

    fn side_fork(&self, fork: &Fork) -> CoreResult<ForkHead> {
        if fork.is_main() {
            return Err(CoreError::MainForkReserved);
        }
        self.head(fork)
    }

    fn commit_content(&self, version: u64) -> CoreResult<&Content<R>> {
        self.commits.get(&version).ok_or_else(|| {
            CoreError::CorruptSnapshot(format!("missing commit {version}"))
        })
    }

    fn commit(&mut self, content: Content<R>) -> u64 {
        let version = self.next_version;
        self.next_version += 1;
        self.commits.insert(version, content);
        version
    }

    fn set_head(&mut self, fork: &Fork, head: ForkHead) {
        self.forks.insert(fork.clone(), head);
    }

    /// Drops commits no fork refers to any more.
    fn compact(&mut self) {
        let referenced: BTreeSet<u64> = self
            .forks
            .values()
            .flat_map(|head| [head.head, head.ancestor])
            .collect();
        self.commits.retain(|version, _| referenced.contains(version));
    }
}

#[derive(Serialize, Deserialize)]
#[serde(bound = "R: Resource")]
struct Snapshot<R> {
    version: u16,
    repository: Repository<R>,
}

/// A forked resource kept in memory, optionally backed by a snapshot file.
///
/// Each transaction works on a copy of the repository that replaces the
/// current state only when the transaction succeeds. [`ForkTransaction::flush`]
/// writes the transaction's view to the snapshot file using write-then-rename.
///
/// # Example
///
/// ```ignore
/// use forked_core::{Content, Fork, ForkedResource, ForkedStore};
///
/// let store = ForkedStore::<String>::new();
/// store.update(&Fork::MAIN, Content::Resource("hello".into()))?;
/// ```
pub struct ForkedStore<R: Resource> {
    state: Mutex<Repository<R>>,
    merger: Box<dyn Merger<R>>,
    feed: ChangeFeed,
    path: Option<PathBuf>,
}

impl<R: Resource> ForkedStore<R> {
    /// Creates an in-memory store using [`MostRecentMerger`].
    pub fn new() -> Self {
        Self::with_merger(MostRecentMerger)
    }

    /// Creates an in-memory store with a custom merger.
    pub fn with_merger(merger: impl Merger<R> + 'static) -> Self {
        Self {
            state: Mutex::new(Repository::new()),
            merger: Box::new(merger),
            feed: ChangeFeed::new(),
            path: None,
        }
    }

    /// Opens a file-backed store using [`MostRecentMerger`].
    ///
    /// A missing or empty snapshot file starts a new store.
    pub fn open(path: impl AsRef<Path>) -> CoreResult<Self> {
        Self::open_with_merger(path, MostRecentMerger)
    }

    /// Opens a file-backed store with a custom merger.
    pub fn open_with_merger(path: impl AsRef<Path>, merger: impl Merger<R> + 'static) -> CoreResult<Self> {
        let path = path.as_ref().to_path_buf();
        let repository = match fs::read(&path) {
            Ok(data) if data.is_empty() => Repository::new(),
            Ok(data) => {
                let snapshot: Snapshot<R> = ciborium::from_reader(data.as_slice())
                    .map_err(|e| CoreError::CorruptSnapshot(e.to_string()))?;
                if snapshot.version > SNAPSHOT_VERSION {
                    return Err(CoreError::CorruptSnapshot(format!(
                        "unsupported snapshot version: {}",
                        snapshot.version
                    )));
                }
                snapshot.repository
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Repository::new(),
            Err(e) => return Err(e.into()),
        };

        debug!(path = %path.display(), forks = repository.forks.len(), "opened forked store");

        Ok(Self {
            state: Mutex::new(repository),
            merger: Box::new(merger),
            feed: ChangeFeed::new(),
            path: Some(path),
        })
    }

    /// Returns the snapshot path, if file-backed.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Returns the number of commits currently retained.
    pub fn commit_count(&self) -> usize {
        self.state.lock().commits.len()
    }
}

impl<R: Resource> Default for ForkedStore<R> {
    fn default() -> Self {
        Self::new()
    }
}

/// Saves a snapshot atomically.
///
/// 1. Write to a temporary file next to the snapshot
/// 2. Sync the temporary file to disk
/// 3. Rename it over the snapshot
/// 4. Fsync the directory so the rename is durable
fn write_snapshot<R: Resource>(path: &Path, repository: &Repository<R>) -> CoreResult<()> {
    let snapshot = Snapshot {
        version: SNAPSHOT_VERSION,
        repository: repository.clone(),
    };
    let mut data = Vec::new();
    ciborium::into_writer(&snapshot, &mut data).map_err(|e| CoreError::Codec(e.to_string()))?;

    let temp_path = path.with_extension("tmp");
    let mut file = File::create(&temp_path)?;
    file.write_all(&data)?;
    file.sync_all()?;
    drop(file);

    fs::rename(&temp_path, path)?;
    sync_parent_dir(path)?;
    Ok(())
}

#[cfg(unix)]
fn sync_parent_dir(path: &Path) -> CoreResult<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        File::open(parent)?.sync_all()?;
    }
    Ok(())
}

#[cfg(not(unix))]
fn sync_parent_dir(_path: &Path) -> CoreResult<()> {
    // NTFS journaling makes the rename durable
    Ok(())
}

/// A transaction over a working copy of the repository.
struct StoreTransaction<'a, R: Resource> {
    repository: Repository<R>,
    merger: &'a dyn Merger<R>,
    path: Option<&'a Path>,
    events: Vec<ChangeEvent>,
    flushed: bool,
}

impl<R: Resource> StoreTransaction<'_, R> {
    fn unexpected(fork: &Fork, expectation: MergeExpectation, outcome: MergeOutcome) -> CoreError {
        CoreError::UnexpectedMerge {
            fork: fork.name().to_string(),
            expected: expectation.to_string(),
            actual: outcome.to_string(),
        }
    }
}

impl<R: Resource> ForkTransaction<R> for StoreTransaction<'_, R> {
    fn has_fork(&self, fork: &Fork) -> bool {
        self.repository.forks.contains_key(fork)
    }

    fn create_fork(&mut self, fork: &Fork) -> CoreResult<()> {
        if fork.is_main() {
            return Err(CoreError::MainForkReserved);
        }
        if self.has_fork(fork) {
            return Err(CoreError::fork_exists(fork.name()));
        }
        let main = self.repository.head(&Fork::MAIN)?.head;
        self.repository.set_head(
            fork,
            ForkHead {
                head: main,
                ancestor: main,
            },
        );
        Ok(())
    }

    fn delete_fork(&mut self, fork: &Fork) -> CoreResult<()> {
        self.repository.side_fork(fork)?;
        self.repository.forks.remove(fork);
        self.repository.compact();
        Ok(())
    }

    fn content(&self, fork: &Fork) -> CoreResult<Content<R>> {
        let head = self.repository.head(fork)?;
        self.repository.commit_content(head.head).cloned()
    }

    fn update(&mut self, fork: &Fork, content: Content<R>) -> CoreResult<()> {
        let mut head = self.repository.head(fork)?;
        if *self.repository.commit_content(head.head)? == content {
            return Ok(());
        }

        let version = self.repository.commit(content);
        head.head = version;
        if fork.is_main() {
            head.ancestor = version;
        }
        self.repository.set_head(fork, head);
        self.repository.compact();
        self.events.push(ChangeEvent::update(fork.clone()));
        Ok(())
    }

    fn has_unmerged_commits_in_main(&self, fork: &Fork) -> CoreResult<bool> {
        let head = self.repository.side_fork(fork)?;
        let main = self.repository.head(&Fork::MAIN)?;
        Ok(main.head != head.ancestor)
    }

    fn has_unmerged_commits(&self, fork: &Fork) -> CoreResult<bool> {
        let head = self.repository.side_fork(fork)?;
        Ok(head.head != head.ancestor)
    }

    fn merge_from_main(&mut self, into: &Fork, expectation: MergeExpectation) -> CoreResult<MergeOutcome> {
        let mut target = self.repository.side_fork(into)?;
        let main = self.repository.head(&Fork::MAIN)?.head;

        let outcome = if main == target.ancestor || main == target.head {
            MergeOutcome::UpToDate
        } else if target.head == target.ancestor {
            MergeOutcome::FastForward
        } else {
            MergeOutcome::ThreeWay
        };
        if !expectation.permits(outcome) {
            return Err(Self::unexpected(into, expectation, outcome));
        }

        match outcome {
            MergeOutcome::UpToDate => {
                target.ancestor = main;
            }
            MergeOutcome::FastForward => {
                target.head = main;
                target.ancestor = main;
            }
            MergeOutcome::ThreeWay => {
                let merged = merge_content(
                    self.merger,
                    self.repository.commit_content(target.ancestor)?,
                    self.repository.commit_content(target.head)?,
                    self.repository.commit_content(main)?,
                )?;
                target.head = self.repository.commit(merged);
                target.ancestor = main;
            }
        }
        self.repository.set_head(into, target);
        self.repository.compact();

        if outcome != MergeOutcome::UpToDate {
            self.events.push(ChangeEvent::merge(into.clone(), Fork::MAIN));
        }
        Ok(outcome)
    }

    fn merge_into_main(&mut self, from: &Fork, expectation: MergeExpectation) -> CoreResult<MergeOutcome> {
        let mut source = self.repository.side_fork(from)?;
        let main = self.repository.head(&Fork::MAIN)?.head;

        let outcome = if source.head == source.ancestor || source.head == main {
            MergeOutcome::UpToDate
        } else if main == source.ancestor {
            MergeOutcome::FastForward
        } else {
            MergeOutcome::ThreeWay
        };
        if !expectation.permits(outcome) {
            return Err(Self::unexpected(from, expectation, outcome));
        }

        let new_main = match outcome {
            MergeOutcome::UpToDate => main,
            MergeOutcome::FastForward => source.head,
            MergeOutcome::ThreeWay => {
                let merged = merge_content(
                    self.merger,
                    self.repository.commit_content(source.ancestor)?,
                    self.repository.commit_content(main)?,
                    self.repository.commit_content(source.head)?,
                )?;
                self.repository.commit(merged)
            }
        };
        // `main` now contains everything the fork has.
        if source.head == main {
            source.ancestor = main;
        } else {
            source.ancestor = source.head;
        }
        self.repository.set_head(
            &Fork::MAIN,
            ForkHead {
                head: new_main,
                ancestor: new_main,
            },
        );
        self.repository.set_head(from, source);
        self.repository.compact();

        if outcome != MergeOutcome::UpToDate {
            self.events.push(ChangeEvent::merge(Fork::MAIN, from.clone()));
        }
        Ok(outcome)
    }

    fn flush(&mut self) -> CoreResult<()> {
        if let Some(path) = self.path {
            write_snapshot(path, &self.repository)?;
            self.flushed = true;
        }
        Ok(())
    }
}

impl<R: Resource> ForkedResource for ForkedStore<R> {
    type Resource = R;

    fn atomically<T, E, F>(&self, f: F) -> Result<T, E>
    where
        F: FnOnce(&mut dyn ForkTransaction<R>) -> Result<T, E>,
        E: From<CoreError>,
    {
        let mut state = self.state.lock();
        let mut txn = StoreTransaction {
            repository: state.clone(),
            merger: self.merger.as_ref(),
            path: self.path.as_deref(),
            events: Vec::new(),
            flushed: false,
        };

        match f(&mut txn) {
            Ok(value) => {
                *state = txn.repository;
                // Emitted under the lock so events keep commit order
                self.feed.emit_batch(txn.events);
                Ok(value)
            }
            Err(e) => {
                if txn.flushed {
                    if let Some(path) = self.path.as_deref() {
                        if let Err(restore) = write_snapshot(path, &state) {
                            error!(error = %restore, "failed to restore snapshot after aborted transaction");
                        }
                    }
                }
                Err(e)
            }
        }
    }

    fn subscribe(&self) -> ChangeStream {
        self.feed.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn upload() -> Fork {
        Fork::from_static("upload")
    }

    fn store_with_upload() -> ForkedStore<String> {
        let store = ForkedStore::new();
        store
            .atomically::<_, CoreError, _>(|txn| txn.create_fork(&upload()))
            .unwrap();
        store
    }

    fn set(store: &ForkedStore<String>, fork: &Fork, value: &str) {
        store
            .update(fork, Content::Resource(value.to_string()))
            .unwrap();
    }

    #[test]
    fn new_store_has_empty_main() {
        let store = ForkedStore::<String>::new();
        assert!(store.has_fork(&Fork::MAIN));
        assert_eq!(store.content(&Fork::MAIN).unwrap(), Content::None);
    }

    #[test]
    fn main_is_reserved() {
        let store = ForkedStore::<String>::new();
        let result = store.atomically(|txn| txn.create_fork(&Fork::MAIN));
        assert!(matches!(result, Err(CoreError::MainForkReserved)));
        let result = store.atomically(|txn| txn.delete_fork(&Fork::MAIN));
        assert!(matches!(result, Err(CoreError::MainForkReserved)));
    }

    #[test]
    fn create_fork_twice_fails() {
        let store = store_with_upload();
        let result = store.atomically(|txn| txn.create_fork(&upload()));
        assert!(matches!(result, Err(CoreError::ForkExists { .. })));
    }

    #[test]
    fn fast_forward_from_main() {
        let store = store_with_upload();
        set(&store, &Fork::MAIN, "v1");

        let outcome = store
            .atomically(|txn| {
                assert!(txn.has_unmerged_commits_in_main(&upload())?);
                txn.merge_from_main(&upload(), MergeExpectation::FastForward)
            })
            .unwrap();
        assert_eq!(outcome, MergeOutcome::FastForward);
        assert_eq!(
            store.content(&upload()).unwrap(),
            Content::Resource("v1".to_string())
        );

        let again = store
            .atomically(|txn| txn.merge_from_main(&upload(), MergeExpectation::FastForward))
            .unwrap();
        assert_eq!(again, MergeOutcome::UpToDate);
    }

    #[test]
    fn three_way_merge_into_main() {
        let store = store_with_upload();
        set(&store, &Fork::MAIN, "base");
        store
            .atomically(|txn| txn.merge_from_main(&upload(), MergeExpectation::Any))
            .unwrap();

        set(&store, &Fork::MAIN, "local");
        set(&store, &upload(), "remote");

        let outcome = store
            .atomically(|txn| txn.merge_into_main(&upload(), MergeExpectation::Any))
            .unwrap();
        assert_eq!(outcome, MergeOutcome::ThreeWay);
        // Most recent (incoming) wins by default
        assert_eq!(
            store.content(&Fork::MAIN).unwrap(),
            Content::Resource("remote".to_string())
        );
        assert!(!store
            .atomically(|txn| txn.has_unmerged_commits(&upload()))
            .unwrap());
    }

    #[test]
    fn fast_forward_expectation_is_enforced() {
        let store = store_with_upload();
        set(&store, &upload(), "diverged");
        set(&store, &Fork::MAIN, "main");

        let result = store.atomically(|txn| txn.merge_from_main(&upload(), MergeExpectation::FastForward));
        assert!(matches!(result, Err(CoreError::UnexpectedMerge { .. })));
        // Nothing changed
        assert_eq!(
            store.content(&upload()).unwrap(),
            Content::Resource("diverged".to_string())
        );
    }

    #[test]
    fn failed_transaction_is_rolled_back() {
        let store = store_with_upload();
        let result: Result<(), CoreError> = store.atomically(|txn| {
            txn.update(&Fork::MAIN, Content::Resource("lost".to_string()))?;
            Err(CoreError::merge_failed("boom"))
        });
        assert!(result.is_err());
        assert_eq!(store.content(&Fork::MAIN).unwrap(), Content::None);
    }

    #[test]
    fn events_emitted_after_commit() {
        let store = store_with_upload();
        let mut changes = store.subscribe();

        set(&store, &Fork::MAIN, "v1");
        store
            .atomically(|txn| txn.merge_from_main(&upload(), MergeExpectation::Any))
            .unwrap();

        assert_eq!(changes.try_next(), Some(ChangeEvent::update(Fork::MAIN)));
        assert_eq!(
            changes.try_next(),
            Some(ChangeEvent::merge(upload(), Fork::MAIN))
        );
        assert_eq!(changes.try_next(), None);

        let _: Result<(), CoreError> = store.atomically(|txn| {
            txn.update(&Fork::MAIN, Content::Resource("v2".to_string()))?;
            Err(CoreError::merge_failed("abort"))
        });
        assert_eq!(changes.try_next(), None);
    }

    #[test]
    fn unchanged_update_is_not_a_commit() {
        let store = ForkedStore::<String>::new();
        let mut changes = store.subscribe();
        set(&store, &Fork::MAIN, "same");
        set(&store, &Fork::MAIN, "same");
        assert!(changes.try_next().is_some());
        assert!(changes.try_next().is_none());
    }

    #[test]
    fn deleted_fork_commits_are_compacted() {
        let store = store_with_upload();
        for i in 0..10 {
            set(&store, &upload(), &format!("draft {i}"));
        }
        store.atomically(|txn| txn.delete_fork(&upload())).unwrap();
        assert_eq!(store.commit_count(), 1);
    }

    #[test]
    fn snapshot_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("resource.cbor");

        {
            let store = ForkedStore::<String>::open(&path).unwrap();
            store
                .atomically::<_, CoreError, _>(|txn| {
                    txn.create_fork(&upload())?;
                    txn.update(&Fork::MAIN, Content::Resource("saved".to_string()))?;
                    txn.flush()
                })
                .unwrap();
            // Not flushed
            set(&store, &Fork::MAIN, "unsaved");
        }

        let store = ForkedStore::<String>::open(&path).unwrap();
        assert!(store.has_fork(&upload()));
        assert_eq!(
            store.content(&Fork::MAIN).unwrap(),
            Content::Resource("saved".to_string())
        );
    }

    #[test]
    fn corrupt_snapshot_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("resource.cbor");
        fs::write(&path, b"\xffnot cbor").unwrap();

        let result = ForkedStore::<String>::open(&path);
        assert!(matches!(result, Err(CoreError::CorruptSnapshot(_))));
    }
}
