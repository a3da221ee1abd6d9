use super::CmvbTree;
use crate::storage::options::{PolicyKind, TreeOptions};
use crate::storage::txn::TxnState;
use crate::types::{Result, TreeError};
use rand::{seq::SliceRandom, Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use std::collections::BTreeMap;

fn options(interval: usize) -> TreeOptions {
    TreeOptions::default()
        .page_size(512)
        .max_entries_per_page(6)
        .policy(PolicyKind::NonThrashing)
        .cache_pages(16)
        .maintenance_interval(interval)
}

fn tree(interval: usize) -> Result<CmvbTree<u64, u64>> {
    CmvbTree::in_memory(options(interval))
}

#[test]
fn commits_become_visible_atomically() -> Result<()> {
    let tree = tree(1_000)?;
    let before = tree.begin_read_transaction();
    let mut txn = tree.begin_transaction();
    for key in 0..10u64 {
        tree.insert(&txn, key, key * 3)?;
    }
    assert_eq!(tree.get(&txn, &4)?, Some(12));
    assert_eq!(tree.get(&before, &4)?, None);
    assert_eq!(tree.commit(&mut txn)?, 1);
    assert_eq!(txn.state(), TxnState::Committed(1));
    assert_eq!(tree.get(&before, &4)?, None);

    let after = tree.begin_read_transaction();
    assert_eq!(tree.range(&after, &0, &100)?.len(), 10);
    assert_eq!(tree.pending_commits(), 1);
    assert_eq!(tree.stable_version(), 0);
    assert_eq!(tree.get_at(&9, 1)?, Some(27));
    assert!(matches!(tree.get_at(&9, 2), Err(TreeError::VersionNotCommitted(2))));
    Ok(())
}

#[test]
fn concurrent_writers_on_one_key_conflict() -> Result<()> {
    let tree = tree(1_000)?;
    let mut first = tree.begin_transaction();
    let mut second = tree.begin_transaction();
    tree.insert(&first, 7, 1)?;
    assert!(matches!(tree.insert(&second, 7, 2), Err(TreeError::WriteConflict)));
    tree.insert(&second, 8, 2)?;
    tree.commit(&mut first)?;
    // `second` read before `first` committed
    assert!(matches!(tree.delete(&second, &7), Err(TreeError::WriteConflict)));
    tree.commit(&mut second)?;

    let third = tree.begin_transaction();
    assert_eq!(tree.insert(&third, 7, 3)?, Some(1));
    Ok(())
}

#[test]
fn conflicts_are_detected_after_migration() -> Result<()> {
    let tree = tree(1_000)?;
    let stale = tree.begin_transaction();
    let mut writer = tree.begin_transaction();
    tree.insert(&writer, 11, 1)?;
    tree.commit(&mut writer)?;
    assert_eq!(tree.drain()?, 1);
    assert_eq!(tree.transient_len()?, 0);
    assert!(matches!(tree.insert(&stale, 11, 2), Err(TreeError::WriteConflict)));
    tree.insert(&stale, 12, 2)?;
    Ok(())
}

#[test]
fn abort_discards_markers() -> Result<()> {
    let tree = tree(1_000)?;
    let mut txn = tree.begin_transaction();
    for key in 0..20u64 {
        tree.insert(&txn, key, key)?;
    }
    assert_eq!(tree.transient_len()?, 20);
    tree.abort(&mut txn)?;
    assert_eq!(txn.state(), TxnState::Aborted);
    assert_eq!(tree.transient_len()?, 0);
    assert_eq!(tree.latest_version(), 0);

    let other = tree.begin_transaction();
    assert_eq!(tree.insert(&other, 3, 3)?, None);
    assert!(matches!(tree.insert(&txn, 1, 1), Err(TreeError::TransactionClosed)));
    Ok(())
}

#[test]
fn maintenance_keeps_every_version_readable() -> Result<()> {
    let tree = tree(1_000)?;
    for round in 0..12u64 {
        let mut txn = tree.begin_transaction();
        for key in 0..8u64 {
            if (key + round) % 4 == 0 {
                tree.delete(&txn, &key)?;
            } else {
                tree.insert(&txn, key, round)?;
            }
        }
        tree.commit(&mut txn)?;
    }
    let latest = tree.latest_version();
    let snapshot = |tree: &CmvbTree<u64, u64>| -> Result<Vec<Vec<Option<u64>>>> {
        (1..=latest)
            .map(|v| (0..8u64).map(|k| tree.get_at(&k, v)).collect())
            .collect()
    };
    let before = snapshot(&tree)?;
    assert!(tree.run_maintenance()?);
    assert_eq!(tree.stable_version(), 1);
    assert_eq!(snapshot(&tree)?, before);
    tree.drain()?;
    assert_eq!(tree.stable_version(), latest);
    assert_eq!(tree.pending_commits(), 0);
    assert_eq!(tree.transient_len()?, 0);
    assert_eq!(snapshot(&tree)?, before);
    assert_eq!(tree.stats().maintenance_runs(), latest);
    assert!(!tree.run_maintenance()?);
    Ok(())
}

fn assert_versions_match(
    tree: &CmvbTree<u64, u64>,
    snapshots: &[BTreeMap<u64, u64>],
) -> Result<()> {
    for (version, expected) in snapshots.iter().enumerate() {
        let reader = tree.begin_read_at(version as u64)?;
        let expected: Vec<_> = expected.iter().map(|(k, v)| (*k, *v)).collect();
        assert_eq!(tree.range(&reader, &0, &u64::MAX)?, expected, "version {version}");
    }
    Ok(())
}

#[test]
fn drain_empties_a_deep_transient_log() -> Result<()> {
    let tree = tree(1_000_000)?;
    let mut rng = ChaCha8Rng::seed_from_u64(0x7A11_0C);
    let mut model = BTreeMap::new();
    let mut snapshots = vec![BTreeMap::new()];
    let mut keys: Vec<u64> = (0..400).collect();
    for round in 1..=40u64 {
        keys.shuffle(&mut rng);
        let mut txn = tree.begin_transaction();
        for key in &keys[..15] {
            if model.contains_key(key) && rng.gen_bool(0.3) {
                assert_eq!(tree.delete(&txn, key)?, model.remove(key));
            } else {
                tree.insert(&txn, *key, round)?;
                model.insert(*key, round);
            }
        }
        assert_eq!(tree.commit(&mut txn)?, round);
        snapshots.push(model.clone());
    }
    assert_eq!(tree.transient_len()?, 600);
    assert_eq!(tree.pending_commits(), 40);
    assert!(tree.transient_height() >= 3);
    assert_versions_match(&tree, &snapshots)?;

    assert_eq!(tree.drain()?, 40);
    assert_eq!(tree.transient_len()?, 0);
    assert_eq!(tree.transient_height(), 0);
    assert_eq!(tree.stable_version(), 40);
    assert_versions_match(&tree, &snapshots)?;
    Ok(())
}

#[test]
fn interleaved_maintenance_matches_committed_snapshots() -> Result<()> {
    let tree = tree(1_000_000)?;
    let mut rng = ChaCha8Rng::seed_from_u64(0x5AB1E);
    let mut model: BTreeMap<u64, u64> = BTreeMap::new();
    let mut snapshots = vec![BTreeMap::new()];
    for round in 0..90u32 {
        let mut next = model.clone();
        let mut txn = tree.begin_transaction();
        for _ in 0..8 {
            let key = rng.gen_range(0..300u64);
            if rng.gen_bool(0.35) {
                assert_eq!(tree.delete(&txn, &key)?, next.remove(&key));
            } else {
                let value = rng.gen_range(0..1_000u64);
                assert_eq!(tree.insert(&txn, key, value)?, next.insert(key, value));
            }
        }
        if rng.gen_bool(0.1) {
            tree.abort(&mut txn)?;
        } else {
            tree.commit(&mut txn)?;
            model = next;
            snapshots.push(model.clone());
        }
        if round == 30 {
            assert!(tree.transient_height() >= 3);
        }
        if round > 30 && rng.gen_bool(0.4) {
            tree.run_maintenance()?;
        }
        if round % 15 == 14 {
            assert_versions_match(&tree, &snapshots)?;
        }
    }
    tree.drain()?;
    assert_eq!(tree.pending_commits(), 0);
    assert_eq!(tree.transient_len()?, 0);
    assert_eq!(tree.stable_version(), tree.latest_version());
    assert_versions_match(&tree, &snapshots)?;
    Ok(())
}

#[test]
fn interval_triggers_maintenance_on_commit() -> Result<()> {
    let tree = tree(4)?;
    for key in 0..6u64 {
        let mut txn = tree.begin_transaction();
        tree.insert(&txn, key, key)?;
        tree.commit(&mut txn)?;
    }
    assert!(tree.stable_version() >= 4);
    assert!(tree.pending_commits() <= 2);
    let reader = tree.begin_read_transaction();
    assert_eq!(tree.range(&reader, &0, &10)?.len(), 6);
    Ok(())
}

#[test]
fn strict_duplicates_are_rejected() -> Result<()> {
    let tree = CmvbTree::<u64, u64>::in_memory(options(1_000).overwrite_duplicates(false))?;
    let mut txn = tree.begin_transaction();
    tree.insert(&txn, 1, 1)?;
    assert!(matches!(tree.insert(&txn, 1, 2), Err(TreeError::DuplicateKey)));
    tree.commit(&mut txn)?;
    let other = tree.begin_transaction();
    assert!(matches!(tree.insert(&other, 1, 2), Err(TreeError::DuplicateKey)));
    assert_eq!(tree.delete(&other, &1)?, Some(1));
    assert_eq!(tree.insert(&other, 1, 5)?, None);
    Ok(())
}

#[test]
fn threads_commit_disjoint_keys() -> Result<()> {
    let tree = tree(8)?;
    std::thread::scope(|scope| -> Result<()> {
        let mut handles = Vec::new();
        for worker in 0..4u64 {
            let tree = &tree;
            handles.push(scope.spawn(move || -> Result<()> {
                for batch in 0..10u64 {
                    let mut txn = tree.begin_transaction();
                    for i in 0..5u64 {
                        let key = worker * 1_000 + batch * 10 + i;
                        tree.insert(&txn, key, worker)?;
                    }
                    tree.commit(&mut txn)?;
                }
                Ok(())
            }));
        }
        handles.push(scope.spawn(|| -> Result<()> {
            for _ in 0..50 {
                tree.run_maintenance()?;
                std::thread::yield_now();
            }
            Ok(())
        }));
        for handle in handles {
            handle.join().expect("worker panicked")?;
        }
        Ok(())
    })?;
    tree.drain()?;
    assert_eq!(tree.latest_version(), 40);
    assert_eq!(tree.stable_version(), 40);
    let reader = tree.begin_read_transaction();
    let all = tree.range(&reader, &0, &u64::MAX)?;
    assert_eq!(all.len(), 200);
    assert!(all.iter().all(|(k, v)| k / 1_000 == *v));
    Ok(())
}
