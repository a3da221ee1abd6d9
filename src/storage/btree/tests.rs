use super::BTree;
use crate::primitives::io::{MemoryStorage, PageStorage};
use crate::storage::options::{PolicyKind, TreeOptions};
use crate::types::{Result, TreeError};
use proptest::prelude::*;
use rand::{seq::SliceRandom, Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use std::collections::BTreeMap;
use std::ops::ControlFlow;
use std::sync::Arc;

fn small_options(policy: PolicyKind) -> TreeOptions {
    TreeOptions::default()
        .page_size(512)
        .max_entries_per_page(6)
        .policy(policy)
        .cache_pages(8)
}

fn tree(policy: PolicyKind) -> Result<BTree<u64, u64>> {
    BTree::in_memory(small_options(policy))
}

fn assert_matches_reference(tree: &BTree<u64, u64>, reference: &BTreeMap<u64, u64>) -> Result<()> {
    let entries = tree.entries()?;
    let expected: Vec<_> = reference.iter().map(|(k, v)| (*k, *v)).collect();
    assert_eq!(entries, expected);
    assert_eq!(tree.check_consistency()?, reference.len());
    Ok(())
}

#[test]
fn ascending_inserts_grow_height() -> Result<()> {
    let mut tree = tree(PolicyKind::Fixed)?;
    for key in 0..200u64 {
        tree.insert(key, key * 2)?;
    }
    assert!(tree.height() >= 3);
    assert_eq!(tree.len()?, 200);
    assert_eq!(tree.get(&77)?, Some(154));
    assert!(tree.stats().splits() > 0);
    assert!(tree.stats().height_increases() >= 2);
    tree.check_consistency()?;
    Ok(())
}

#[test]
fn duplicate_policy_is_honoured() -> Result<()> {
    let mut overwrite = tree(PolicyKind::NonThrashing)?;
    assert_eq!(overwrite.insert(5, 1)?, None);
    assert_eq!(overwrite.insert(5, 2)?, Some(1));
    assert_eq!(overwrite.get(&5)?, Some(2));

    let mut strict = BTree::<u64, u64>::in_memory(
        small_options(PolicyKind::NonThrashing).overwrite_duplicates(false),
    )?;
    strict.insert(5, 1)?;
    assert!(matches!(strict.insert(5, 2), Err(TreeError::DuplicateKey)));
    assert_eq!(strict.get(&5)?, Some(1));
    Ok(())
}

#[test]
fn sentinel_key_is_rejected() -> Result<()> {
    let mut tree = tree(PolicyKind::Fixed)?;
    assert!(matches!(
        tree.insert(u64::MAX, 1),
        Err(TreeError::Invalid(_))
    ));
    Ok(())
}

#[test]
fn deleting_everything_removes_the_root() -> Result<()> {
    for policy in [PolicyKind::Fixed, PolicyKind::Ratio, PolicyKind::NonThrashing] {
        let mut tree = tree(policy)?;
        let mut keys: Vec<u64> = (0..300).collect();
        let mut rng = ChaCha8Rng::seed_from_u64(0x5EED);
        keys.shuffle(&mut rng);
        for key in &keys {
            tree.insert(*key, *key)?;
        }
        keys.shuffle(&mut rng);
        for (i, key) in keys.iter().enumerate() {
            assert_eq!(tree.delete(key)?, Some(*key));
            if i % 37 == 0 {
                tree.check_consistency()?;
            }
        }
        assert!(tree.is_empty());
        assert_eq!(tree.height(), 0);
        assert_eq!(tree.active_fixes(), 0);
        assert!(tree.stats().merges() + tree.stats().redistributions() > 0);
    }
    Ok(())
}

#[test]
fn narrow_pages_drain_through_every_level() -> Result<()> {
    for policy in [PolicyKind::Fixed, PolicyKind::Ratio, PolicyKind::NonThrashing] {
        for seed in [1u64, 0xD1CE, 0xFACADE] {
            let mut tree =
                BTree::<u64, u64>::in_memory(small_options(policy).max_entries_per_page(4))?;
            let mut rng = ChaCha8Rng::seed_from_u64(seed);
            let mut keys: Vec<u64> = (0..600).map(|k| k * 3).collect();
            keys.shuffle(&mut rng);
            for key in &keys {
                tree.insert(*key, *key + 1)?;
            }
            assert!(tree.height() >= 4, "{policy:?} height {}", tree.height());
            keys.shuffle(&mut rng);
            for (i, key) in keys.iter().enumerate() {
                assert_eq!(tree.delete(key)?, Some(*key + 1));
                if i % 29 == 0 {
                    assert_eq!(tree.check_consistency()?, keys.len() - i - 1);
                }
            }
            assert!(tree.is_empty());
            assert_eq!(tree.height(), 0);
            assert_eq!(tree.active_fixes(), 0);
            assert!(tree.stats().merges() > 0);
        }
    }
    Ok(())
}

#[test]
fn reads_release_their_fixes() -> Result<()> {
    let mut tree = tree(PolicyKind::Ratio)?;
    for key in 0..300u64 {
        tree.insert(key, key)?;
    }
    let baseline = tree.active_fixes();
    for key in (0..320u64).step_by(7) {
        assert_eq!(tree.get(&key)?, (key < 300).then_some(key));
    }
    assert_eq!(tree.range(&40, &90)?.len(), 50);
    assert_eq!(tree.floor(&1_000)?, Some((299, 299)));
    assert_eq!(tree.active_fixes(), baseline);
    Ok(())
}

#[test]
fn floor_finds_greatest_lower_key() -> Result<()> {
    let mut tree = tree(PolicyKind::NonThrashing)?;
    for key in (0..400u64).step_by(10) {
        tree.insert(key, key + 1)?;
    }
    assert_eq!(tree.floor(&0)?, Some((0, 1)));
    assert_eq!(tree.floor(&15)?, Some((10, 11)));
    assert_eq!(tree.floor(&399)?, Some((390, 391)));
    tree.delete(&0)?;
    assert_eq!(tree.floor(&5)?, None);
    Ok(())
}

#[test]
fn traversal_stops_early_and_releases_fixes() -> Result<()> {
    let mut tree = tree(PolicyKind::NonThrashing)?;
    for key in 0..500u64 {
        tree.insert(key, key)?;
    }
    let baseline = tree.active_fixes();
    let mut seen = Vec::new();
    let flow = tree.traverse(&100, &400, |k, _| {
        seen.push(*k);
        if seen.len() == 25 {
            ControlFlow::Break(())
        } else {
            ControlFlow::Continue(())
        }
    })?;
    assert_eq!(flow, ControlFlow::Break(()));
    assert_eq!(seen, (100..125).collect::<Vec<_>>());
    assert_eq!(tree.active_fixes(), baseline);
    assert_eq!(tree.range(&490, &u64::MAX)?.len(), 10);
    Ok(())
}

#[test]
fn reopen_from_info_page() -> Result<()> {
    let storage: Arc<dyn PageStorage> = Arc::new(MemoryStorage::new(512)?);
    let info_page = {
        let mut tree = BTree::<u64, String>::create(
            Arc::clone(&storage),
            TreeOptions::default().page_size(512).cache_pages(4),
        )?;
        for key in 0..120u64 {
            tree.insert(key, format!("v{key}"))?;
        }
        tree.flush()?;
        tree.info_page()
    };
    let tree = BTree::<u64, String>::open(
        storage,
        info_page,
        TreeOptions::default().page_size(512).cache_pages(4),
    )?;
    assert_eq!(tree.get(&99)?, Some("v99".to_string()));
    assert_eq!(tree.len()?, 120);
    tree.check_consistency()?;
    Ok(())
}

#[test]
fn clear_frees_every_page() -> Result<()> {
    let storage: Arc<dyn PageStorage> = Arc::new(MemoryStorage::new(512)?);
    let mut tree =
        BTree::<u64, u64>::create(Arc::clone(&storage), small_options(PolicyKind::Fixed))?;
    for key in 0..100u64 {
        tree.insert(key, key)?;
    }
    tree.clear()?;
    assert!(tree.is_empty());
    assert_eq!(storage.allocated_pages(), 1);
    tree.insert(1, 1)?;
    assert_eq!(tree.get(&1)?, Some(1));
    Ok(())
}

#[test]
fn random_workload_matches_reference() -> Result<()> {
    let mut tree = tree(PolicyKind::NonThrashing)?;
    let mut reference = BTreeMap::new();
    let mut rng = ChaCha8Rng::seed_from_u64(0xDEADBEEF);
    for step in 0..3_000 {
        let key = rng.gen_range(0..400u64);
        if rng.gen_bool(0.6) {
            let value = rng.gen::<u64>();
            assert_eq!(tree.insert(key, value)?, reference.insert(key, value));
        } else {
            assert_eq!(tree.delete(&key)?, reference.remove(&key));
        }
        if step % 500 == 0 {
            assert_matches_reference(&tree, &reference)?;
        }
    }
    assert_matches_reference(&tree, &reference)
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]
    #[test]
    fn insert_then_delete_in_any_order_empties_tree(
        keys in proptest::collection::btree_set(0u64..5_000, 1..300),
        seed in any::<u64>(),
    ) {
        let mut tree = tree(PolicyKind::NonThrashing).unwrap();
        for key in &keys {
            tree.insert(*key, key ^ 0xFF).unwrap();
        }
        prop_assert_eq!(tree.check_consistency().unwrap(), keys.len());
        let mut order: Vec<u64> = keys.iter().copied().collect();
        order.shuffle(&mut ChaCha8Rng::seed_from_u64(seed));
        for key in order {
            prop_assert_eq!(tree.delete(&key).unwrap(), Some(key ^ 0xFF));
            tree.check_consistency().unwrap();
        }
        prop_assert!(tree.is_empty());
        prop_assert_eq!(tree.active_fixes(), 0);
    }
}
