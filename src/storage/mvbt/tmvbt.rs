use std::collections::BTreeMap;
use std::sync::Arc;

use super::MvbTree;
use crate::primitives::io::{MemoryStorage, PageStorage};
use crate::storage::options::TreeOptions;
use crate::storage::stats::TreeStats;
use crate::storage::txn::{Transaction, TxnContext, TxnId, TxnState};
use crate::types::{KeyCodec, PageId, Result, TreeError, ValCodec, Version, VersionRange};

/// Transactional multiversion tree.
///
/// One writing transaction at a time collects its changes in the active
/// version and publishes them all at once on commit. Read-only transactions
/// see a committed version and never block the writer.
pub struct TmvbTree<K: KeyCodec, V: ValCodec> {
    tree: MvbTree<K, V>,
    ctx: Arc<TxnContext>,
    writer: Option<TxnId>,
    undo: BTreeMap<K, Option<V>>,
}

impl<K: KeyCodec, V: ValCodec> TmvbTree<K, V> {
    /// Creates an empty tree in `storage`.
    pub fn create(storage: Arc<dyn PageStorage>, options: TreeOptions) -> Result<Self> {
        Self::create_with_context(storage, options, Arc::new(TxnContext::new()))
    }

    /// Creates an empty tree drawing transaction ids from `ctx`.
    pub fn create_with_context(
        storage: Arc<dyn PageStorage>,
        options: TreeOptions,
        ctx: Arc<TxnContext>,
    ) -> Result<Self> {
        Ok(Self::wrap(MvbTree::create(storage, options)?, ctx))
    }

    /// Reopens a tree from its info page.
    pub fn open(
        storage: Arc<dyn PageStorage>,
        info_page: PageId,
        options: TreeOptions,
        ctx: Arc<TxnContext>,
    ) -> Result<Self> {
        Ok(Self::wrap(MvbTree::open(storage, info_page, options)?, ctx))
    }

    /// Creates an empty tree over fresh in-memory storage.
    pub fn in_memory(options: TreeOptions) -> Result<Self> {
        let storage: Arc<dyn PageStorage> = Arc::new(MemoryStorage::new(options.page_size)?);
        Self::create(storage, options)
    }

    fn wrap(tree: MvbTree<K, V>, ctx: Arc<TxnContext>) -> Self {
        Self {
            tree,
            ctx,
            writer: None,
            undo: BTreeMap::new(),
        }
    }

    /// Underlying multiversion tree, for reads at explicit versions.
    pub fn tree(&self) -> &MvbTree<K, V> {
        &self.tree
    }

    /// Latest committed version.
    pub fn committed_version(&self) -> Version {
        self.tree.committed_version()
    }

    /// Version the next commit will publish.
    pub fn active_version(&self) -> Version {
        self.tree.active_version()
    }

    /// Structure-modification counters.
    pub fn stats(&self) -> &Arc<TreeStats> {
        self.tree.stats()
    }

    /// Info page identifying this tree in its storage.
    pub fn info_page(&self) -> PageId {
        self.tree.info_page()
    }

    /// Starts the writing transaction. Fails while another one is running.
    pub fn begin_transaction(&mut self) -> Result<Transaction> {
        if self.writer.is_some() {
            return Err(TreeError::ConcurrentWriter);
        }
        let id = self.ctx.next_id();
        self.writer = Some(id);
        tracing::trace!(target: "mvtree::mvbt", txn = id, version = self.active_version(), "began writer");
        Ok(Transaction::new(id, self.tree.active_version(), false))
    }

    /// Starts a read-only transaction at the latest committed version.
    pub fn begin_read_transaction(&self) -> Transaction {
        Transaction::new(self.ctx.next_id(), self.tree.committed_version(), true)
    }

    /// Starts a read-only transaction at the committed version `version`.
    pub fn begin_read_at(&self, version: Version) -> Result<Transaction> {
        if version > self.tree.committed_version() {
            return Err(TreeError::VersionNotCommitted(version));
        }
        Ok(Transaction::new(self.ctx.next_id(), version, true))
    }

    fn check_writer(&self, txn: &Transaction) -> Result<()> {
        txn.ensure_active()?;
        txn.ensure_writable()?;
        if self.writer != Some(txn.id()) {
            return Err(TreeError::ConcurrentWriter);
        }
        Ok(())
    }

    fn read_version(&self, txn: &Transaction) -> Version {
        if self.writer == Some(txn.id()) {
            self.tree.active_version()
        } else {
            txn.read_version()
        }
    }

    /// Inserts `key` within `txn`, returning the value it replaces.
    pub fn insert(&mut self, txn: &Transaction, key: K, value: V) -> Result<Option<V>> {
        self.check_writer(txn)?;
        let prior = self.tree.get(&key, self.tree.active_version())?;
        let previous = self.tree.insert_active(key.clone(), value)?;
        self.undo.entry(key).or_insert(prior);
        Ok(previous)
    }

    /// Deletes `key` within `txn`, returning its value if it was present.
    pub fn delete(&mut self, txn: &Transaction, key: &K) -> Result<Option<V>> {
        self.check_writer(txn)?;
        let removed = self.tree.delete_active(key)?;
        if let Some(value) = &removed {
            self.undo
                .entry(key.clone())
                .or_insert_with(|| Some(value.clone()));
        }
        Ok(removed)
    }

    /// Value of `key` as seen by `txn`.
    pub fn get(&self, txn: &Transaction, key: &K) -> Result<Option<V>> {
        txn.ensure_active()?;
        self.tree.get(key, self.read_version(txn))
    }

    /// Entries with keys in `[min, max)` as seen by `txn`.
    pub fn range(&self, txn: &Transaction, min: &K, max: &K) -> Result<Vec<(K, V)>> {
        txn.ensure_active()?;
        self.tree.range(min, max, self.read_version(txn))
    }

    /// Committed history of `key`.
    pub fn history(&self, key: &K) -> Result<Vec<(VersionRange, V)>> {
        let committed = self.tree.committed_version();
        let mut pieces = self.tree.history(key)?;
        pieces.retain(|(versions, _)| versions.start <= committed);
        for (versions, _) in &mut pieces {
            if versions.end > committed {
                versions.end = crate::types::VERSION_MAX;
            }
        }
        Ok(pieces)
    }

    /// Publishes the changes of `txn` as one version.
    pub fn commit(&mut self, txn: &mut Transaction) -> Result<Version> {
        txn.ensure_active()?;
        if txn.is_read_only() {
            txn.finish(TxnState::Committed(txn.read_version()));
            return Ok(txn.read_version());
        }
        self.check_writer(txn)?;
        let version = self.tree.commit_version()?;
        self.writer = None;
        self.undo.clear();
        txn.finish(TxnState::Committed(version));
        tracing::debug!(target: "mvtree::mvbt", txn = txn.id(), version, "committed transaction");
        Ok(version)
    }

    /// Rolls back the changes of `txn`.
    pub fn abort(&mut self, txn: &mut Transaction) -> Result<()> {
        txn.ensure_active()?;
        if !txn.is_read_only() {
            self.check_writer(txn)?;
            let undo = std::mem::take(&mut self.undo);
            for (key, prior) in undo {
                match prior {
                    Some(value) => {
                        self.tree.delete_active(&key)?;
                        self.tree.insert_active(key, value)?;
                    }
                    None => {
                        self.tree.delete_active(&key)?;
                    }
                }
            }
            self.writer = None;
        }
        txn.finish(TxnState::Aborted);
        tracing::debug!(target: "mvtree::mvbt", txn = txn.id(), "aborted transaction");
        Ok(())
    }

    /// Writes dirty pages and the info page to storage.
    pub fn flush(&self) -> Result<()> {
        self.tree.flush()
    }
}

impl<K: KeyCodec, V: ValCodec> std::fmt::Debug for TmvbTree<K, V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TmvbTree")
            .field("tree", &self.tree)
            .field("writer", &self.writer)
            .finish()
    }
}
