use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use rustc_hash::{FxHashMap, FxHashSet};

use super::log::{Marker, TransientKey};
use crate::primitives::io::{MemoryStorage, PageStorage};
use crate::storage::btree::BTree;
use crate::storage::mvbt::TmvbTree;
use crate::storage::options::TreeOptions;
use crate::storage::stats::TreeStats;
use crate::storage::txn::{Transaction, TxnContext, TxnId, TxnState};
use crate::types::{KeyCodec, KeyRange, PageId, Result, TreeError, ValCodec, Version};

/// Bookkeeping of running and committed-but-unmigrated transactions.
#[derive(Debug, Default)]
struct CommitTable {
    /// Latest commit version handed out.
    latest: Version,
    /// Latest commit version folded into the stable tree.
    stable_version: Version,
    /// Commits waiting for maintenance, by commit version.
    pending: BTreeMap<Version, TxnId>,
    /// Commit versions of the transactions in `pending`.
    commit_of: FxHashMap<TxnId, Version>,
    /// Writing transactions that have neither committed nor aborted.
    active: FxHashSet<TxnId>,
    /// Encoded keys each running or pending transaction wrote.
    touched: FxHashMap<TxnId, BTreeSet<Vec<u8>>>,
}

impl CommitTable {
    /// Commit version of `txn` if it committed at or before `version`.
    fn visible_commit(&self, txn: TxnId, version: Version) -> Option<Version> {
        self.commit_of.get(&txn).copied().filter(|c| *c <= version)
    }
}

struct MaintenanceGuard<'a>(&'a AtomicBool);

impl Drop for MaintenanceGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Concurrent multiversion tree.
///
/// Writers record their changes as markers in a transient single-version
/// tree; committing only assigns a commit version. A maintenance
/// transaction later folds committed markers, oldest commit first, into a
/// stable [`TmvbTree`] where every commit becomes one version. Readers merge
/// both sides and see exactly the commits up to their read version.
///
/// Locks are always taken in the order commit table, transient tree, stable
/// tree, and never held across a call that takes them again.
pub struct CmvbTree<K: KeyCodec, V: ValCodec> {
    stable: RwLock<TmvbTree<K, V>>,
    transient: RwLock<BTree<TransientKey<K>, Marker<V>>>,
    commits: RwLock<CommitTable>,
    maintenance_running: AtomicBool,
    actions: AtomicUsize,
    ctx: Arc<TxnContext>,
    options: TreeOptions,
    stats: Arc<TreeStats>,
}

fn encoded<K: KeyCodec>(key: &K) -> Vec<u8> {
    let mut buf = vec![0u8; K::ENCODED_LEN];
    key.encode_key(&mut buf);
    buf
}

impl<K: KeyCodec, V: ValCodec> CmvbTree<K, V> {
    /// Creates an empty tree; both the stable and the transient tree live in
    /// `storage`.
    pub fn create(storage: Arc<dyn PageStorage>, options: TreeOptions) -> Result<Self> {
        let ctx = Arc::new(TxnContext::new());
        let stable = TmvbTree::create_with_context(
            Arc::clone(&storage),
            options.clone().overwrite_duplicates(true),
            Arc::clone(&ctx),
        )?;
        let transient = BTree::create(storage, options.clone().overwrite_duplicates(true))?;
        Ok(Self::assemble(stable, transient, ctx, options))
    }

    /// Reopens a flushed tree from the info pages returned by
    /// [`CmvbTree::info_pages`]. Markers of commits that never reached the
    /// stable tree are discarded.
    pub fn open(
        storage: Arc<dyn PageStorage>,
        stable_info: PageId,
        transient_info: PageId,
        options: TreeOptions,
    ) -> Result<Self> {
        let ctx = Arc::new(TxnContext::new());
        let stable = TmvbTree::open(
            Arc::clone(&storage),
            stable_info,
            options.clone().overwrite_duplicates(true),
            Arc::clone(&ctx),
        )?;
        let mut transient =
            BTree::open(storage, transient_info, options.clone().overwrite_duplicates(true))?;
        if !transient.is_empty() {
            tracing::warn!(target: "mvtree::cmvbt", "discarding markers of unmigrated commits");
            transient.clear()?;
        }
        Ok(Self::assemble(stable, transient, ctx, options))
    }

    /// Creates an empty tree over fresh in-memory storage.
    pub fn in_memory(options: TreeOptions) -> Result<Self> {
        let storage: Arc<dyn PageStorage> = Arc::new(MemoryStorage::new(options.page_size)?);
        Self::create(storage, options)
    }

    fn assemble(
        stable: TmvbTree<K, V>,
        transient: BTree<TransientKey<K>, Marker<V>>,
        ctx: Arc<TxnContext>,
        options: TreeOptions,
    ) -> Self {
        let committed = stable.committed_version();
        Self {
            stable: RwLock::new(stable),
            transient: RwLock::new(transient),
            commits: RwLock::new(CommitTable {
                latest: committed,
                stable_version: committed,
                ..CommitTable::default()
            }),
            maintenance_running: AtomicBool::new(false),
            actions: AtomicUsize::new(0),
            ctx,
            options,
            stats: Arc::new(TreeStats::default()),
        }
    }

    /// Info pages of the stable and the transient tree.
    pub fn info_pages(&self) -> (PageId, PageId) {
        (self.stable.read().info_page(), self.transient.read().info_page())
    }

    /// Latest commit version.
    pub fn latest_version(&self) -> Version {
        self.commits.read().latest
    }

    /// Latest commit folded into the stable tree.
    pub fn stable_version(&self) -> Version {
        self.commits.read().stable_version
    }

    /// Commits waiting for maintenance.
    pub fn pending_commits(&self) -> usize {
        self.commits.read().pending.len()
    }

    /// Markers currently held by the transient tree.
    pub fn transient_len(&self) -> Result<usize> {
        self.transient.read().len()
    }

    /// Height of the transient tree.
    pub fn transient_height(&self) -> u32 {
        self.transient.read().height()
    }

    /// Maintenance counters.
    pub fn stats(&self) -> &Arc<TreeStats> {
        &self.stats
    }

    /// Structure-modification counters of the stable tree.
    pub fn stable_stats(&self) -> Arc<TreeStats> {
        Arc::clone(self.stable.read().stats())
    }

    /// Options the tree was opened with.
    pub fn options(&self) -> &TreeOptions {
        &self.options
    }

    /// Starts a writing transaction reading the latest commit.
    pub fn begin_transaction(&self) -> Transaction {
        let id = self.ctx.next_id();
        let mut commits = self.commits.write();
        commits.active.insert(id);
        tracing::trace!(target: "mvtree::cmvbt", txn = id, read_version = commits.latest, "began writer");
        Transaction::new(id, commits.latest, false)
    }

    /// Starts a read-only transaction at the latest commit.
    pub fn begin_read_transaction(&self) -> Transaction {
        Transaction::new(self.ctx.next_id(), self.commits.read().latest, true)
    }

    /// Starts a read-only transaction at commit `version`.
    pub fn begin_read_at(&self, version: Version) -> Result<Transaction> {
        if version > self.commits.read().latest {
            return Err(TreeError::VersionNotCommitted(version));
        }
        Ok(Transaction::new(self.ctx.next_id(), version, true))
    }

    fn check_key(key: &K) -> Result<()> {
        if !KeyRange::<K>::full().contains(key) {
            return Err(TreeError::Invalid("key outside the tree key range"));
        }
        Ok(())
    }

    /// Fails with [`TreeError::WriteConflict`] if a transaction other than
    /// `txn` wrote `key` and either is still running or committed after
    /// `txn` started reading.
    fn check_conflict(&self, commits: &CommitTable, txn: &Transaction, key: &K) -> Result<()> {
        let writers = self.writers_of(key)?;
        for (writer, _) in &writers {
            if *writer == txn.id() {
                continue;
            }
            let committed_later = commits
                .commit_of
                .get(writer)
                .is_some_and(|c| *c > txn.read_version());
            if commits.active.contains(writer) || committed_later {
                tracing::debug!(target: "mvtree::cmvbt", txn = txn.id(), other = writer, "write conflict");
                return Err(TreeError::WriteConflict);
            }
        }
        if commits.stable_version > txn.read_version() {
            let stable = self.stable.read();
            if stable
                .tree()
                .changed_between(key, txn.read_version(), commits.stable_version)?
            {
                tracing::debug!(target: "mvtree::cmvbt", txn = txn.id(), "write conflict with migrated commit");
                return Err(TreeError::WriteConflict);
            }
        }
        Ok(())
    }

    /// Markers stored for `key`, by writing transaction.
    fn writers_of(&self, key: &K) -> Result<Vec<(TxnId, Marker<V>)>> {
        let transient = self.transient.read();
        let markers = transient.range(
            &TransientKey::first_of(key.clone()),
            &TransientKey::first_of(key.next_key()),
        )?;
        Ok(markers
            .into_iter()
            .filter(|(tk, _)| &tk.key == key)
            .map(|(tk, marker)| (tk.txn, marker))
            .collect())
    }

    fn write_marker(
        &self,
        commits: &mut CommitTable,
        txn: &Transaction,
        key: K,
        marker: Marker<V>,
    ) -> Result<()> {
        commits
            .touched
            .entry(txn.id())
            .or_default()
            .insert(encoded(&key));
        self.transient
            .write()
            .insert(TransientKey::new(key, txn.id()), marker)?;
        self.actions.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn check_writable(txn: &Transaction, key: &K) -> Result<()> {
        txn.ensure_active()?;
        txn.ensure_writable()?;
        Self::check_key(key)
    }

    /// Inserts `key` within `txn`, returning the value it replaces.
    pub fn insert(&self, txn: &Transaction, key: K, value: V) -> Result<Option<V>> {
        Self::check_writable(txn, &key)?;
        value.validate()?;
        let mut commits = self.commits.write();
        self.check_conflict(&commits, txn, &key)?;
        let previous = self.visible(&commits, txn, &key)?;
        if previous.is_some() && !self.options.overwrite_duplicates {
            return Err(TreeError::DuplicateKey);
        }
        self.write_marker(&mut commits, txn, key, Marker::Insert(value))?;
        Ok(previous)
    }

    /// Deletes `key` within `txn`, returning its value if it was visible.
    pub fn delete(&self, txn: &Transaction, key: &K) -> Result<Option<V>> {
        Self::check_writable(txn, key)?;
        let mut commits = self.commits.write();
        self.check_conflict(&commits, txn, key)?;
        let previous = self.visible(&commits, txn, key)?;
        if previous.is_some() {
            self.write_marker(&mut commits, txn, key.clone(), Marker::Delete)?;
        }
        Ok(previous)
    }

    /// Value of `key` as seen by `txn`, including its own writes.
    pub fn get(&self, txn: &Transaction, key: &K) -> Result<Option<V>> {
        txn.ensure_active()?;
        let commits = self.commits.read();
        self.visible(&commits, txn, key)
    }

    fn visible(&self, commits: &CommitTable, txn: &Transaction, key: &K) -> Result<Option<V>> {
        if !txn.is_read_only() {
            let own = self
                .transient
                .read()
                .get(&TransientKey::new(key.clone(), txn.id()))?;
            if let Some(marker) = own {
                return Ok(marker.value().cloned());
            }
        }
        self.lookup(commits, key, txn.read_version())
    }

    /// Value of `key` at commit `version`.
    pub fn get_at(&self, key: &K, version: Version) -> Result<Option<V>> {
        let commits = self.commits.read();
        if version > commits.latest {
            return Err(TreeError::VersionNotCommitted(version));
        }
        self.lookup(&commits, key, version)
    }

    /// Newest visible marker for `key`, falling back to the stable tree.
    fn lookup(&self, commits: &CommitTable, key: &K, version: Version) -> Result<Option<V>> {
        let newest = self
            .writers_of(key)?
            .into_iter()
            .filter_map(|(writer, marker)| Some((commits.visible_commit(writer, version)?, marker)))
            .max_by_key(|(commit, _)| *commit);
        if let Some((_, marker)) = newest {
            return Ok(marker.value().cloned());
        }
        let stable_version = version.min(commits.stable_version);
        let stable = self.stable.read();
        stable.tree().get(key, stable_version)
    }

    /// Entries with keys in `[min, max)` as seen by `txn`.
    pub fn range(&self, txn: &Transaction, min: &K, max: &K) -> Result<Vec<(K, V)>> {
        txn.ensure_active()?;
        let version = txn.read_version();
        let commits = self.commits.read();
        let markers = self
            .transient
            .read()
            .range(&TransientKey::first_of(min.clone()), &TransientKey::first_of(max.clone()))?;
        let mut view: BTreeMap<K, V> = {
            let stable = self.stable.read();
            stable
                .tree()
                .range(min, max, version.min(commits.stable_version))?
                .into_iter()
                .collect()
        };
        let mut committed: Vec<(Version, K, Marker<V>)> = Vec::new();
        let mut own: Vec<(K, Marker<V>)> = Vec::new();
        for (tk, marker) in markers {
            if !txn.is_read_only() && tk.txn == txn.id() {
                own.push((tk.key, marker));
            } else if let Some(commit) = commits.visible_commit(tk.txn, version) {
                committed.push((commit, tk.key, marker));
            }
        }
        drop(commits);
        committed.sort_by_key(|(commit, _, _)| *commit);
        let overlay = committed
            .into_iter()
            .map(|(_, key, marker)| (key, marker))
            .chain(own);
        for (key, marker) in overlay {
            match marker {
                Marker::Insert(value) => {
                    view.insert(key, value);
                }
                Marker::Delete => {
                    view.remove(&key);
                }
            }
        }
        Ok(view.into_iter().collect())
    }

    /// Commits `txn`. Writers receive the next commit version; read-only and
    /// empty transactions keep their read version. Runs maintenance once
    /// enough actions have accumulated.
    pub fn commit(&self, txn: &mut Transaction) -> Result<Version> {
        txn.ensure_active()?;
        if txn.is_read_only() {
            txn.finish(TxnState::Committed(txn.read_version()));
            return Ok(txn.read_version());
        }
        let version = {
            let mut commits = self.commits.write();
            commits.active.remove(&txn.id());
            if commits.touched.contains_key(&txn.id()) {
                let version = commits.latest + 1;
                commits.latest = version;
                commits.pending.insert(version, txn.id());
                commits.commit_of.insert(txn.id(), version);
                version
            } else {
                txn.read_version()
            }
        };
        txn.finish(TxnState::Committed(version));
        tracing::debug!(target: "mvtree::cmvbt", txn = txn.id(), version, "committed transaction");
        let interval = self.options.maintenance_interval;
        if self.actions.load(Ordering::Relaxed) >= interval {
            self.actions.store(0, Ordering::Relaxed);
            self.drain()?;
        }
        Ok(version)
    }

    /// Rolls back `txn`, dropping its markers.
    pub fn abort(&self, txn: &mut Transaction) -> Result<()> {
        txn.ensure_active()?;
        if !txn.is_read_only() {
            let touched = {
                let mut commits = self.commits.write();
                commits.active.remove(&txn.id());
                commits.touched.remove(&txn.id()).unwrap_or_default()
            };
            let mut transient = self.transient.write();
            for raw in touched {
                transient.delete(&TransientKey::new(K::decode_key(&raw)?, txn.id()))?;
            }
        }
        txn.finish(TxnState::Aborted);
        tracing::debug!(target: "mvtree::cmvbt", txn = txn.id(), "aborted transaction");
        Ok(())
    }

    /// Folds the oldest pending commit into the stable tree. Returns `false`
    /// when nothing was pending or another maintenance run is in progress.
    pub fn run_maintenance(&self) -> Result<bool> {
        if self
            .maintenance_running
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            return Ok(false);
        }
        let _guard = MaintenanceGuard(&self.maintenance_running);
        let next = {
            let commits = self.commits.read();
            commits.pending.iter().next().map(|(&commit, &txn)| {
                let keys = commits.touched.get(&txn).cloned().unwrap_or_default();
                (commit, txn, keys)
            })
        };
        let Some((commit, writer, keys)) = next else {
            return Ok(false);
        };
        let mut markers = Vec::with_capacity(keys.len());
        {
            let transient = self.transient.read();
            for raw in &keys {
                let key = K::decode_key(raw)?;
                if let Some(marker) = transient.get(&TransientKey::new(key.clone(), writer))? {
                    markers.push((key, marker));
                }
            }
        }
        let mut stable_txn = {
            let mut stable = self.stable.write();
            assert_eq!(
                stable.active_version(),
                commit,
                "stable tree out of step with the commit order"
            );
            stable.begin_transaction()?
        };
        if let Err(err) = self.apply_to_stable(&stable_txn, &markers) {
            self.stable.write().abort(&mut stable_txn)?;
            return Err(err);
        }
        self.stable.write().commit(&mut stable_txn)?;
        {
            let mut commits = self.commits.write();
            commits.pending.remove(&commit);
            commits.commit_of.remove(&writer);
            commits.touched.remove(&writer);
            commits.stable_version = commit;
        }
        {
            let mut transient = self.transient.write();
            for (key, _) in &markers {
                transient.delete(&TransientKey::new(key.clone(), writer))?;
            }
        }
        self.stats.inc_maintenance_runs();
        self.stats.add_migrated_markers(markers.len() as u64);
        tracing::debug!(
            target: "mvtree::cmvbt",
            commit,
            txn = writer,
            markers = markers.len(),
            "migrated commit into stable tree"
        );
        Ok(true)
    }

    /// Replays markers into the stable tree, one tree action per lock.
    fn apply_to_stable(&self, stable_txn: &Transaction, markers: &[(K, Marker<V>)]) -> Result<()> {
        for (key, marker) in markers {
            let mut stable = self.stable.write();
            match marker {
                Marker::Insert(value) => {
                    stable.insert(stable_txn, key.clone(), value.clone())?;
                }
                Marker::Delete => {
                    stable.delete(stable_txn, key)?;
                }
            }
        }
        Ok(())
    }

    /// Runs maintenance until no commit is pending or another run holds it.
    pub fn drain(&self) -> Result<usize> {
        let mut runs = 0;
        while self.run_maintenance()? {
            runs += 1;
        }
        Ok(runs)
    }

    /// Migrates every pending commit and writes both trees to storage.
    pub fn flush(&self) -> Result<()> {
        self.drain()?;
        self.stable.read().flush()?;
        self.transient.read().flush()
    }
}

impl<K: KeyCodec, V: ValCodec> std::fmt::Debug for CmvbTree<K, V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let commits = self.commits.read();
        f.debug_struct("CmvbTree")
            .field("latest", &commits.latest)
            .field("stable_version", &commits.stable_version)
            .field("pending", &commits.pending.len())
            .field("active", &commits.active.len())
            .finish()
    }
}
